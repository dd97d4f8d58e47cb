// On-demand snapshot path: external decoder, latest-frame buffer, JPEG.

pub mod decoder;
pub mod pipeline;
pub mod yuv;

pub use decoder::DecoderProcess;
pub use pipeline::{CaptureOutcome, DecoderSpawner, DecoderState, SnapshotHandle, SnapshotPipeline};
