// Streaming core: NAL extraction, GOP caching, fan-out, capture worker.

pub mod gop;
pub mod hub;
pub mod nal;
pub mod worker;

pub use hub::{BroadcastHub, Subscription};
pub use nal::{H264Unit, UnitExtractor, UnitKind};
pub use worker::{CaptureWorker, WorkerState};
