//! Capture device lifecycle.
//!
//! The native camera API sits behind [`CaptureBackend`] and [`CaptureDevice`].
//! [`DeviceHandle`] owns exactly one device and enforces the
//! `Closed -> Open -> Closed` state machine on top of it.

mod synthetic;

pub use synthetic::{SyntheticBackend, SyntheticCamera, SyntheticScript, SyntheticStats};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{BridgeError, Result};

/// Width, height and channel count of the frames a device class produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameShape {
    pub width: u32,
    pub height: u32,
    pub channels: u32,
}

impl FrameShape {
    /// 1280x720 three channel frames, the shape webcams are configured to.
    pub const WEBCAM: FrameShape = FrameShape::new(1280, 720, 3);

    pub const fn new(width: u32, height: u32, channels: u32) -> Self {
        Self {
            width,
            height,
            channels,
        }
    }

    /// Number of bytes in one row-major, channel-interleaved frame.
    pub fn byte_len(&self) -> usize {
        self.width as usize * self.height as usize * self.channels as usize
    }

    /// Returns `(height, width, channels)`.
    pub fn dimensions(&self) -> (u32, u32, u32) {
        (self.height, self.width, self.channels)
    }
}

impl Default for FrameShape {
    fn default() -> Self {
        Self::WEBCAM
    }
}

/// One raw capture result. An empty frame is never a valid value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub shape: FrameShape,
    pub data: Vec<u8>,
}

impl Frame {
    pub fn new(shape: FrameShape, data: Vec<u8>) -> Self {
        Self { shape, data }
    }

    pub fn empty(shape: FrameShape) -> Self {
        Self::new(shape, Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }
}

/// Entry point of a native capture API.
pub trait CaptureBackend: Send + 'static {
    type Device: CaptureDevice;

    /// Acquires the device at `index`.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::DeviceUnavailable`] when nothing can be opened there.
    fn open(&mut self, index: i32) -> Result<Self::Device>;
}

/// A device acquired through a [`CaptureBackend`].
pub trait CaptureDevice: Send + 'static {
    fn configure(&mut self, width: u32, height: u32) -> Result<()>;

    /// Blocks until the device yields a frame. The frame may be empty.
    fn read(&mut self) -> Result<Frame>;

    fn release(&mut self);
}

/// Command sent to a device with no actuators.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NoCommand;

/// Owns one capture device from `open` to `close`.
pub struct DeviceHandle<B: CaptureBackend> {
    index: i32,
    shape: FrameShape,
    backend: B,
    device: Option<B::Device>,
}

impl<B: CaptureBackend> DeviceHandle<B> {
    /// Creates a closed handle for the webcam shape.
    pub fn new(backend: B, index: i32) -> Self {
        Self::with_shape(backend, index, FrameShape::WEBCAM)
    }

    pub fn with_shape(backend: B, index: i32, shape: FrameShape) -> Self {
        Self {
            index,
            shape,
            backend,
            device: None,
        }
    }

    pub fn index(&self) -> i32 {
        self.index
    }

    pub fn shape(&self) -> FrameShape {
        self.shape
    }

    pub fn is_open(&self) -> bool {
        self.device.is_some()
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Acquires and configures the device. Must not be called on an open handle.
    pub fn open(&mut self) -> Result<()> {
        debug_assert!(self.device.is_none(), "device handle opened twice");
        let mut device = self.backend.open(self.index)?;
        if let Err(err) = device.configure(self.shape.width, self.shape.height) {
            device.release();
            return Err(err);
        }
        info!(index = self.index, shape = ?self.shape, "camera opened");
        self.device = Some(device);
        Ok(())
    }

    /// Releases the device. Closing a closed handle does nothing.
    pub fn close(&mut self) {
        if let Some(mut device) = self.device.take() {
            device.release();
            info!(index = self.index, "camera released");
        }
    }

    pub fn read(&mut self) -> Result<Frame> {
        let device = self.device.as_mut().ok_or(BridgeError::NotOpen)?;
        let frame = device.read()?;
        if frame.is_empty() {
            return Err(BridgeError::EmptyCapture { index: self.index });
        }
        Ok(frame)
    }

    /// Write path towards the device. A camera has no actuators to drive.
    pub fn apply(&mut self, _command: NoCommand) -> Result<()> {
        if self.device.is_none() {
            return Err(BridgeError::NotOpen);
        }
        Ok(())
    }
}

impl<B: CaptureBackend> Drop for DeviceHandle<B> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<B: CaptureBackend> std::fmt::Debug for DeviceHandle<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceHandle")
            .field("index", &self.index)
            .field("shape", &self.shape)
            .field("open", &self.is_open())
            .finish()
    }
}
