use crate::backend::PwmBackend;
use crate::channel::PwmChannel;
use crate::error::{ConfigError, WriteError};
use crate::request::DutyRequest;
use log::{info, warn};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

/// Per-open session identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionHandle(u32);

impl SessionHandle {
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn id(self) -> u32 {
        self.0
    }
}

/// Operation table bound to a registered node.
pub trait FileOperations: Send + Sync {
    fn open(&self) -> SessionHandle;

    fn close(&self, session: SessionHandle);

    /// Returns the number of bytes consumed, which may be fewer than `buf.len()`.
    fn write(&self, session: SessionHandle, buf: &[u8]) -> Result<usize, WriteError>;
}

/// Write-only control point for one PWM channel.
///
/// Holds a weak reference: the channel belongs to whoever acquired it.
pub struct ControlEndpoint<B: PwmBackend> {
    name: String,
    channel: Weak<PwmChannel<B>>,
    next_session: AtomicU32,
    open_sessions: AtomicUsize,
}

impl<B: PwmBackend> ControlEndpoint<B> {
    pub fn new(name: impl Into<String>, channel: &Arc<PwmChannel<B>>) -> Self {
        Self {
            name: name.into(),
            channel: Arc::downgrade(channel),
            next_session: AtomicU32::new(0),
            open_sessions: AtomicUsize::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn open_sessions(&self) -> usize {
        self.open_sessions.load(Ordering::Relaxed)
    }
}

impl<B: PwmBackend> FileOperations for ControlEndpoint<B> {
    fn open(&self) -> SessionHandle {
        let session = SessionHandle(self.next_session.fetch_add(1, Ordering::Relaxed));
        self.open_sessions.fetch_add(1, Ordering::Relaxed);
        info!("Device opened: {} (session {})", self.name, session.id());
        session
    }

    fn close(&self, session: SessionHandle) {
        let _ = self
            .open_sessions
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
        info!("Device closed: {} (session {})", self.name, session.id());
    }

    fn write(&self, _session: SessionHandle, buf: &[u8]) -> Result<usize, WriteError> {
        let request = DutyRequest::from_bytes(buf);
        let duty = request.duty().map_err(|e| {
            warn!("{}: invalid input {:?}: {}", self.name, request, e);
            e
        })?;
        info!("{}: duty cycle {}%", self.name, duty.get());

        let channel = self.channel.upgrade().ok_or(WriteError::Unbound)?;
        channel.set_duty(duty).map_err(|e| {
            warn!("{}: {}", self.name, e);
            match e {
                ConfigError::Retired => WriteError::Unbound,
                e => WriteError::HardwareRejected(e),
            }
        })?;
        Ok(request.consumed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{DutyPercent, PERIOD_NS};
    use crate::mock::{Event, MockBackend};

    fn bound() -> (ControlEndpoint<MockBackend>, Arc<PwmChannel<MockBackend>>, MockBackend) {
        let backend = MockBackend::new();
        let hw = backend.clone();
        let channel = Arc::new(PwmChannel::acquire(backend, 0, PERIOD_NS).unwrap());
        (ControlEndpoint::new("pwm0", &channel), channel, hw)
    }

    #[test]
    fn test_write_scenario() {
        let (endpoint, channel, _hw) = bound();
        let s = endpoint.open();

        assert_eq!(endpoint.write(s, b"50"), Ok(2));
        assert_eq!(channel.on_time_ns(), 500_000_000);
        assert_eq!(endpoint.write(s, b"0"), Ok(1));
        assert_eq!(channel.on_time_ns(), 0);
        assert_eq!(endpoint.write(s, b"100"), Ok(3));
        assert_eq!(channel.on_time_ns(), 1_000_000_000);
        assert_eq!(endpoint.write(s, b"101"), Err(WriteError::OutOfRange(101)));
        assert_eq!(channel.on_time_ns(), 1_000_000_000);
        assert_eq!(endpoint.write(s, b"abc"), Err(WriteError::InvalidFormat));
        assert_eq!(channel.on_time_ns(), 1_000_000_000);
    }

    #[test]
    fn test_rejected_input_never_reaches_hardware() {
        let (endpoint, channel, hw) = bound();
        channel.set_duty(DutyPercent::new(25).unwrap()).unwrap();
        let s = endpoint.open();

        for input in [&b""[..], b"-5", b"200", b"x1", b"12345678901234567890"] {
            assert!(endpoint.write(s, input).is_err());
        }
        assert_eq!(channel.on_time_ns(), 250_000_000);
        assert_eq!(hw.count(|e| matches!(e, Event::Configure { .. })), 1);
    }

    #[test]
    fn test_repeated_write_is_idempotent() {
        let (endpoint, channel, hw) = bound();
        let s = endpoint.open();

        assert_eq!(endpoint.write(s, b"40\n"), Ok(3));
        let first = channel.on_time_ns();
        assert_eq!(endpoint.write(s, b"40\n"), Ok(3));
        assert_eq!(channel.on_time_ns(), first);

        let configures: Vec<_> = hw
            .events()
            .into_iter()
            .filter(|e| matches!(e, Event::Configure { .. }))
            .collect();
        let expected = Event::Configure {
            on_time_ns: 400_000_000,
            period_ns: PERIOD_NS,
        };
        assert_eq!(configures, vec![expected.clone(), expected]);
    }

    #[test]
    fn test_hardware_rejection_propagates() {
        let (endpoint, channel, hw) = bound();
        endpoint.write(endpoint.open(), b"10").unwrap();
        hw.reject_configure(true);

        let err = endpoint.write(endpoint.open(), b"90");
        assert!(matches!(err, Err(WriteError::HardwareRejected(_))));
        assert_eq!(channel.on_time_ns(), 100_000_000);
    }

    #[test]
    fn test_write_after_channel_gone() {
        let (endpoint, channel, hw) = bound();
        let s = endpoint.open();
        drop(channel);

        assert_eq!(endpoint.write(s, b"10"), Err(WriteError::Unbound));
        assert_eq!(hw.outstanding(), 0);
    }

    #[test]
    fn test_write_to_retired_channel_is_unbound() {
        let (endpoint, channel, hw) = bound();
        let s = endpoint.open();
        channel.retire();

        assert_eq!(endpoint.write(s, b"10"), Err(WriteError::Unbound));
        assert!(hw.events().iter().all(|e| !matches!(e, Event::Configure { .. })));
        assert_eq!(hw.outstanding(), 1);
        drop(channel);
        assert_eq!(hw.outstanding(), 0);
    }

    #[test]
    fn test_open_close_bookkeeping() {
        let (endpoint, _channel, _hw) = bound();
        let a = endpoint.open();
        let b = endpoint.open();
        assert_ne!(a, b);
        assert_eq!(endpoint.open_sessions(), 2);

        endpoint.close(a);
        endpoint.close(b);
        endpoint.close(b);
        assert_eq!(endpoint.open_sessions(), 0);
        assert_eq!(endpoint.name(), "pwm0");
    }
}
