use serde::{Deserialize, Serialize};

use crate::{BridgeError, Frame, FrameShape, Result};

/// Fixed-size copy of the most recent frame, published as extended state.
///
/// The buffer length is `shape.byte_len()` from construction on and never
/// changes. A rejected [`set`](Snapshot::set) leaves the previous contents
/// untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    shape: FrameShape,
    data: Vec<u8>,
}

impl Snapshot {
    /// Creates a zeroed snapshot for frames of `shape`.
    pub fn new(shape: FrameShape) -> Self {
        Self {
            shape,
            data: vec![0; shape.byte_len()],
        }
    }

    /// Copies a frame into the buffer as a flat byte sequence.
    ///
    /// # Errors
    ///
    /// [`BridgeError::ShapeMismatch`] when the frame's byte count differs from
    /// the snapshot capacity. Nothing is truncated or padded.
    pub fn set(&mut self, frame: &Frame) -> Result<()> {
        if frame.data.len() != self.data.len() {
            return Err(BridgeError::ShapeMismatch {
                expected: self.data.len(),
                actual: frame.data.len(),
            });
        }
        self.data.copy_from_slice(&frame.data);
        Ok(())
    }

    pub fn get(&self) -> &[u8] {
        &self.data
    }

    /// Returns `(height, width, channels)`.
    pub fn dimensions(&self) -> (u32, u32, u32) {
        self.shape.dimensions()
    }

    pub fn shape(&self) -> FrameShape {
        self.shape
    }
}
