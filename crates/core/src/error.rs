/// Result alias that carries the custom [`BridgeError`] type.
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Common error type for the core crate.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// The capture device at `index` could not be opened.
    #[error("could not open camera with index {index}")]
    DeviceUnavailable { index: i32 },
    /// An operation required an open device handle.
    #[error("device handle is not open")]
    NotOpen,
    /// The device returned a frame without any data.
    #[error("frame captured from camera with index {index} is empty")]
    EmptyCapture { index: i32 },
    /// A captured frame does not match the snapshot's fixed byte length.
    #[error("frame holds {actual} bytes but the snapshot expects {expected}")]
    ShapeMismatch { expected: usize, actual: usize },
    #[error("sampling frequency must be positive and finite, got {0}")]
    InvalidFrequency(f64),
    #[error("bridge is already running")]
    AlreadyRunning,
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("{0}")]
    Json(#[from] serde_json::Error),
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
    /// Free-form failure, used for poisoned locks and panicked threads.
    #[error("{0}")]
    Message(String),
}

impl BridgeError {
    /// Creates a new error that simply wraps the provided message.
    pub fn msg<T: Into<String>>(msg: T) -> Self {
        Self::Message(msg.into())
    }

    /// Returns `true` when the error must terminate a running sampling loop.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::DeviceUnavailable { .. }
                | Self::NotOpen
                | Self::EmptyCapture { .. }
                | Self::ShapeMismatch { .. }
                | Self::Io(_)
                | Self::Message(_)
        )
    }
}

impl From<&str> for BridgeError {
    fn from(value: &str) -> Self {
        Self::msg(value)
    }
}

impl From<String> for BridgeError {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_device_index() {
        let err = BridgeError::EmptyCapture { index: 3 };
        assert_eq!(
            err.to_string(),
            "frame captured from camera with index 3 is empty"
        );
        assert!(err.is_fatal());
    }

    #[test]
    fn configuration_errors_are_not_loop_fatal() {
        assert!(!BridgeError::InvalidFrequency(0.0).is_fatal());
        assert!(!BridgeError::AlreadyRunning.is_fatal());
    }
}
