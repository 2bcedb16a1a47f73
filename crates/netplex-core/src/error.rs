//! Error types for the netplex reactor

use core::fmt;

/// Result type for reactor operations
pub type ReactorResult<T> = Result<T, ReactorError>;

/// Errors that can occur in reactor operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReactorError {
    /// Adding a handle would exceed the configured limit
    AtCapacity,

    /// The descriptor is already registered with the poller
    AlreadyRegistered,

    /// No live handle under this id (already removed, or never added)
    NotRegistered,

    /// The reactor or its wakeup channel has shut down
    Shutdown,

    /// Timing-wheel error
    Wheel(WheelError),

    /// Raw OS error (errno)
    Os(i32),
}

impl fmt::Display for ReactorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReactorError::AtCapacity => write!(f, "reactor at handle capacity"),
            ReactorError::AlreadyRegistered => write!(f, "descriptor already registered"),
            ReactorError::NotRegistered => write!(f, "handle not registered"),
            ReactorError::Shutdown => write!(f, "reactor shut down"),
            ReactorError::Wheel(e) => write!(f, "timing wheel error: {}", e),
            ReactorError::Os(errno) => write!(f, "os error: errno {}", errno),
        }
    }
}

impl std::error::Error for ReactorError {}

/// Errors reported by the flat timing wheel
///
/// The wheel never clamps a delay into range. A target outside the live
/// window is reported and the caller decides: reject the configuration,
/// or treat the timer as already expired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WheelError {
    /// Target tick is at or behind the wheel's current tick
    Underflow,

    /// Target tick is at or beyond the wheel's horizon
    Overflow,

    /// remove() of a timer that is in no bucket
    NotScheduled,

    /// insert() of a timer that is already in a bucket
    AlreadyScheduled,
}

impl fmt::Display for WheelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WheelError::Underflow => write!(f, "target tick already passed"),
            WheelError::Overflow => write!(f, "target tick beyond wheel horizon"),
            WheelError::NotScheduled => write!(f, "timer not scheduled"),
            WheelError::AlreadyScheduled => write!(f, "timer already scheduled"),
        }
    }
}

impl std::error::Error for WheelError {}

impl From<WheelError> for ReactorError {
    fn from(e: WheelError) -> Self {
        ReactorError::Wheel(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = ReactorError::AtCapacity;
        assert_eq!(format!("{}", e), "reactor at handle capacity");

        let e = ReactorError::Wheel(WheelError::Overflow);
        assert_eq!(
            format!("{}", e),
            "timing wheel error: target tick beyond wheel horizon"
        );

        let e = ReactorError::Os(98);
        assert_eq!(format!("{}", e), "os error: errno 98");
    }

    #[test]
    fn test_error_conversion() {
        let wheel_err = WheelError::Underflow;
        let reactor_err: ReactorError = wheel_err.into();
        assert!(matches!(
            reactor_err,
            ReactorError::Wheel(WheelError::Underflow)
        ));
    }
}
