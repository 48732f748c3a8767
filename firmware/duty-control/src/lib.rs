//! Duty-cycle control for a single hardware PWM channel.
//!
//! A caller writes a percentage (`"0"`..`"100"`, optionally newline
//! terminated) to a registered control node; the value is parsed, range
//! checked and applied to the channel under a lock. [`Controller`] brings
//! the channel and its node up in order and tears them down in reverse.

pub mod backend;
pub mod channel;
pub mod endpoint;
pub mod error;
pub mod lifecycle;
pub mod registry;
pub mod request;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use backend::{DutyLatch, PwmBackend};
pub use channel::{DutyPercent, PwmChannel, DEFAULT_DUTY_PERCENT, PERIOD_NS};
pub use endpoint::{ControlEndpoint, FileOperations, SessionHandle};
pub use error::{
    AcquireError, BackendError, ConfigError, RegistrationError, StartError, WriteError,
};
pub use lifecycle::{Controller, ControllerConfig};
pub use registry::{ClassId, MemoryRegistry, NodeFile, NodeId, RegionId, Registry};
pub use request::{DutyRequest, INPUT_CAPACITY};
