use serde::{Deserialize, Serialize};

use crate::{Frame, NoCommand};

/// Actuator-level values exchanged with the surrounding control framework.
///
/// A device without actuators always produces the empty state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ControlState {
    values: Vec<f64>,
}

impl ControlState {
    pub fn new(values: Vec<f64>) -> Self {
        Self { values }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Two-way mapping between a device's native data and [`ControlState`].
///
/// Both directions are required even when one of them is unused by a device.
pub trait StateConverter: Send + 'static {
    /// What the device produces on every read.
    type Output;
    /// What the device accepts on its write path.
    type Command;

    fn to_state(&self, output: &Self::Output) -> ControlState;

    fn to_command(&self, state: &ControlState) -> Self::Command;
}

/// Converter for cameras: frames carry no actuator state.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebcamConverter;

impl StateConverter for WebcamConverter {
    type Output = Frame;
    type Command = NoCommand;

    fn to_state(&self, _output: &Frame) -> ControlState {
        ControlState::empty()
    }

    fn to_command(&self, _state: &ControlState) -> NoCommand {
        NoCommand
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FrameShape;

    #[test]
    fn webcam_frames_map_to_the_empty_state() {
        let shape = FrameShape::new(2, 2, 1);
        let frame = Frame::new(shape, vec![9; 4]);

        let state = WebcamConverter.to_state(&frame);
        assert!(state.is_empty());
        assert_eq!(state, ControlState::empty());
        assert_eq!(WebcamConverter.to_command(&state), NoCommand);
    }
}
