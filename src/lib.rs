// droidcast - live Android screen broadcasting service.
// Capture workers drive device-side encoder agents over the debug
// bridge; the broadcast hub fans H.264 units out to WebSocket clients;
// the snapshot pipeline produces JPEGs from an on-demand decoder.

pub mod adb;
pub mod command_utils;
pub mod config;
pub mod error;
pub mod registry;
pub mod server;
pub mod snapshot;
pub mod stream;
