//! Core library for the camera bridge.
//!
//! A [`Bridge`] owns one capture device, samples it at a fixed frequency on a
//! dedicated thread and publishes every tick as an [`ObservationRecord`].
//! Readers obtained through [`Bridge::reader`] pick records up concurrently
//! without ever observing a partially written frame.

pub mod bridge;
pub mod config;
pub mod device;
pub mod error;
pub mod observation;
pub mod schedule;
pub mod snapshot;
pub mod state;

pub use bridge::Bridge;
pub use config::{AppConfig, BridgeConfig, RestartPolicy};
pub use device::{
    CaptureBackend, CaptureDevice, DeviceHandle, Frame, FrameShape, NoCommand, SyntheticBackend,
    SyntheticCamera, SyntheticScript, SyntheticStats,
};
pub use error::{BridgeError, Result};
pub use observation::{ObservationReader, ObservationRecord};
pub use schedule::{StopSignal, TickSchedule};
pub use snapshot::Snapshot;
pub use state::{ControlState, StateConverter, WebcamConverter};
