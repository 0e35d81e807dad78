use std::{
    collections::BTreeSet,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use super::{CaptureBackend, CaptureDevice, Frame, FrameShape};
use crate::{BridgeError, Result};

/// Scripted failure modes for the synthetic camera.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SyntheticScript {
    /// Every read yields a full frame.
    #[default]
    Healthy,
    /// The first `n` reads succeed, every later read is empty.
    EmptyAfter(u64),
    /// The first `n` reads succeed, later frames drop their last row.
    TruncatedAfter(u64),
}

/// Open and release counters shared between a backend and its devices.
#[derive(Debug, Clone, Default)]
pub struct SyntheticStats {
    opened: Arc<AtomicUsize>,
    released: Arc<AtomicUsize>,
    frames: Arc<AtomicUsize>,
}

impl SyntheticStats {
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    pub fn frames(&self) -> usize {
        self.frames.load(Ordering::SeqCst)
    }
}

/// Deterministic stand-in for a native camera API.
///
/// Frames carry a moving gradient with the frame's sequence number stamped,
/// little endian, into the first eight bytes.
#[derive(Debug, Clone)]
pub struct SyntheticBackend {
    indices: BTreeSet<i32>,
    channels: u32,
    script: SyntheticScript,
    read_delay: Duration,
    stats: SyntheticStats,
}

impl Default for SyntheticBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl SyntheticBackend {
    /// A backend exposing a single three channel camera at index 0.
    pub fn new() -> Self {
        Self {
            indices: BTreeSet::from([0]),
            channels: 3,
            script: SyntheticScript::Healthy,
            read_delay: Duration::ZERO,
            stats: SyntheticStats::default(),
        }
    }

    pub fn with_indices(mut self, indices: impl IntoIterator<Item = i32>) -> Self {
        self.indices = indices.into_iter().collect();
        self
    }

    pub fn with_channels(mut self, channels: u32) -> Self {
        self.channels = channels;
        self
    }

    pub fn with_script(mut self, script: SyntheticScript) -> Self {
        self.script = script;
        self
    }

    /// Simulated exposure time spent blocking inside every read.
    pub fn with_read_delay(mut self, delay: Duration) -> Self {
        self.read_delay = delay;
        self
    }

    pub fn stats(&self) -> SyntheticStats {
        self.stats.clone()
    }
}

impl CaptureBackend for SyntheticBackend {
    type Device = SyntheticCamera;

    fn open(&mut self, index: i32) -> Result<SyntheticCamera> {
        if !self.indices.contains(&index) {
            return Err(BridgeError::DeviceUnavailable { index });
        }
        self.stats.opened.fetch_add(1, Ordering::SeqCst);
        Ok(SyntheticCamera {
            shape: FrameShape::new(0, 0, self.channels),
            script: self.script,
            read_delay: self.read_delay,
            sequence: 0,
            released: false,
            stats: self.stats.clone(),
        })
    }
}

#[derive(Debug)]
pub struct SyntheticCamera {
    shape: FrameShape,
    script: SyntheticScript,
    read_delay: Duration,
    sequence: u64,
    released: bool,
    stats: SyntheticStats,
}

impl SyntheticCamera {
    fn pattern(&self) -> Vec<u8> {
        let width = self.shape.width as usize;
        let channels = self.shape.channels as usize;
        let shift = self.sequence as usize;
        let mut data = vec![0u8; self.shape.byte_len()];
        for (offset, byte) in data.iter_mut().enumerate() {
            let pixel = offset / channels.max(1);
            let (row, col) = (pixel / width.max(1), pixel % width.max(1));
            *byte = (row + col + shift + offset % channels.max(1) * 85) as u8;
        }
        let stamp = self.sequence.to_le_bytes();
        let len = stamp.len().min(data.len());
        data[..len].copy_from_slice(&stamp[..len]);
        data
    }
}

impl CaptureDevice for SyntheticCamera {
    fn configure(&mut self, width: u32, height: u32) -> Result<()> {
        self.shape = FrameShape::new(width, height, self.shape.channels);
        Ok(())
    }

    fn read(&mut self) -> Result<Frame> {
        if !self.read_delay.is_zero() {
            thread::sleep(self.read_delay);
        }
        let frame = match self.script {
            SyntheticScript::EmptyAfter(n) if self.sequence >= n => Frame::empty(self.shape),
            SyntheticScript::TruncatedAfter(n) if self.sequence >= n => {
                let mut data = self.pattern();
                let row = self.shape.width as usize * self.shape.channels as usize;
                data.truncate(data.len().saturating_sub(row.max(1)));
                Frame::new(self.shape, data)
            }
            _ => Frame::new(self.shape, self.pattern()),
        };
        self.sequence += 1;
        self.stats.frames.fetch_add(1, Ordering::SeqCst);
        Ok(frame)
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.stats.released.fetch_add(1, Ordering::SeqCst);
        }
    }
}
