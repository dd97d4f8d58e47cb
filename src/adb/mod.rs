// Everything that talks to the Android debug bridge lives here.

pub mod bridge;
pub mod client;
pub mod command_builder;
pub mod tracker;

pub use bridge::{BridgeDriver, DeviceProcessHandle, DeviceSetSnapshot, DeviceState};
pub use client::AdbClient;
pub use tracker::{Device, DeviceTracker};
