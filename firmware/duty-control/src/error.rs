use thiserror::Error;

/// `EIO`: the output rejected a valid request.
pub const EIO: i32 = 5;
/// `ENODEV`: the endpoint is no longer bound to a channel.
pub const ENODEV: i32 = 19;
/// `EINVAL`: malformed or out-of-range input.
pub const EINVAL: i32 = 22;

/// Failure reported by a PWM backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("timing rejected: on_time={on_time_ns}ns period={period_ns}ns")]
    TimingRejected { on_time_ns: u64, period_ns: u64 },
    #[error("backend failure: {0}")]
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AcquireError {
    #[error("PWM channel {0} unavailable")]
    Unavailable(u8),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("backend rejected configuration: {0}")]
    BackendRejected(#[from] BackendError),
    #[error("channel retired")]
    Retired,
}

/// Rejection of a single write to the control endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WriteError {
    #[error("input is not a base-10 integer")]
    InvalidFormat,
    #[error("duty cycle {0} outside 0..=100")]
    OutOfRange(i64),
    #[error("hardware rejected duty cycle: {0}")]
    HardwareRejected(#[source] ConfigError),
    #[error("endpoint not bound to a channel")]
    Unbound,
}

impl WriteError {
    /// errno value reported through a file-style interface.
    pub fn errno(&self) -> i32 {
        match self {
            WriteError::InvalidFormat | WriteError::OutOfRange(_) => EINVAL,
            WriteError::HardwareRejected(_) => EIO,
            WriteError::Unbound => ENODEV,
        }
    }
}

impl From<WriteError> for std::io::Error {
    fn from(err: WriteError) -> Self {
        let kind = match err {
            WriteError::InvalidFormat | WriteError::OutOfRange(_) => std::io::ErrorKind::InvalidInput,
            WriteError::HardwareRejected(_) | WriteError::Unbound => std::io::ErrorKind::Other,
        };
        std::io::Error::new(kind, err)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistrationError {
    #[error("no free region for {0}")]
    RegionUnavailable(String),
    #[error("{0} already registered")]
    AlreadyExists(String),
    #[error("unknown registration {0}")]
    Unknown(String),
    #[error("registration failed: {0}")]
    Failed(String),
}

/// Startup failure. The sequence has already been unwound when this is returned.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StartError {
    #[error("region allocation failed: {0}")]
    Region(#[source] RegistrationError),
    #[error("class creation failed: {0}")]
    Class(#[source] RegistrationError),
    #[error(transparent)]
    Acquire(#[from] AcquireError),
    #[error("default configuration failed: {0}")]
    Enable(#[from] ConfigError),
    #[error("control node creation failed: {0}")]
    Node(#[source] RegistrationError),
}
