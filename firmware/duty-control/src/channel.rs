use crate::backend::PwmBackend;
use crate::error::{AcquireError, ConfigError, WriteError};
use log::{debug, info, warn};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Carrier period: 1 Hz.
pub const PERIOD_NS: u64 = 1_000_000_000;

/// Duty applied at startup, before the control endpoint exists.
pub const DEFAULT_DUTY_PERCENT: u8 = 50;

/// A validated duty cycle in percent, 0..=100.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DutyPercent(u8);

impl DutyPercent {
    pub const MAX: u8 = 100;
    pub const DEFAULT: DutyPercent = DutyPercent(DEFAULT_DUTY_PERCENT);

    pub fn new(percent: u8) -> Option<Self> {
        (percent <= Self::MAX).then_some(Self(percent))
    }

    pub fn get(self) -> u8 {
        self.0
    }

    /// On-time for this duty over `period_ns`, exact for periods divisible by 100.
    pub fn on_time_ns(self, period_ns: u64) -> u64 {
        let percent = u64::from(self.0);
        // Split the period so the multiply cannot overflow.
        (period_ns / 100) * percent + (period_ns % 100) * percent / 100
    }
}

impl TryFrom<i64> for DutyPercent {
    type Error = WriteError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        u8::try_from(value)
            .ok()
            .and_then(DutyPercent::new)
            .ok_or(WriteError::OutOfRange(value))
    }
}

struct ChannelState<B: PwmBackend> {
    backend: B,
    // `None` only once the channel is being dropped.
    handle: Option<B::Handle>,
    on_time_ns: u64,
    enabled: bool,
    retired: bool,
}

/// One acquired hardware PWM output.
///
/// All hardware access goes through the internal lock, so `set_duty` may be
/// called from several writers at once. The stored on-time only changes
/// after the backend accepted the new timing.
///
/// The hardware handle is freed when the last reference goes away. Once
/// [`retire`](Self::retire) has run, the output stays off and further
/// configuration is refused.
pub struct PwmChannel<B: PwmBackend> {
    id: u8,
    period_ns: u64,
    state: Mutex<ChannelState<B>>,
}

impl<B: PwmBackend> PwmChannel<B> {
    /// Take exclusive ownership of channel `id` from `backend`.
    pub fn acquire(mut backend: B, id: u8, period_ns: u64) -> Result<Self, AcquireError> {
        let handle = backend.request(id).ok_or(AcquireError::Unavailable(id))?;
        info!("PWM channel {} acquired (period {}ns)", id, period_ns);
        Ok(Self {
            id,
            period_ns,
            state: Mutex::new(ChannelState {
                backend,
                handle: Some(handle),
                on_time_ns: 0,
                enabled: false,
                retired: false,
            }),
        })
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn period_ns(&self) -> u64 {
        self.period_ns
    }

    pub fn on_time_ns(&self) -> u64 {
        self.lock().on_time_ns
    }

    pub fn is_enabled(&self) -> bool {
        self.lock().enabled
    }

    pub fn is_retired(&self) -> bool {
        self.lock().retired
    }

    /// Reprogram the output for `duty`. On error the previous on-time stays.
    pub fn set_duty(&self, duty: DutyPercent) -> Result<(), ConfigError> {
        let on_time_ns = duty.on_time_ns(self.period_ns);
        let mut guard = self.lock();
        let state = &mut *guard;
        let (backend, handle) = state.live()?;
        backend.configure(handle, on_time_ns, self.period_ns)?;
        state.on_time_ns = on_time_ns;
        debug!(
            "PWM channel {}: {}% -> on_time={}ns",
            self.id,
            duty.get(),
            on_time_ns
        );
        Ok(())
    }

    pub fn enable(&self) -> Result<(), ConfigError> {
        let mut guard = self.lock();
        let state = &mut *guard;
        if state.enabled {
            return Ok(());
        }
        let (backend, handle) = state.live()?;
        backend.enable(handle)?;
        state.enabled = true;
        info!("PWM channel {} enabled", self.id);
        Ok(())
    }

    pub fn disable(&self) {
        let mut guard = self.lock();
        if guard.switch_off() {
            info!("PWM channel {} disabled", self.id);
        }
    }

    /// Switch the output off for good. Later `set_duty`/`enable` calls fail
    /// with [`ConfigError::Retired`].
    pub fn retire(&self) {
        let mut guard = self.lock();
        if guard.switch_off() {
            info!("PWM channel {} disabled", self.id);
        }
        guard.retired = true;
    }

    /// Hand the channel back to the backend.
    pub fn release(self) {
        drop(self);
    }

    fn lock(&self) -> MutexGuard<'_, ChannelState<B>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<B: PwmBackend> ChannelState<B> {
    fn live(&mut self) -> Result<(&mut B, &mut B::Handle), ConfigError> {
        if self.retired {
            return Err(ConfigError::Retired);
        }
        let handle = self.handle.as_mut().ok_or(ConfigError::Retired)?;
        Ok((&mut self.backend, handle))
    }

    /// Returns true if the output was on.
    fn switch_off(&mut self) -> bool {
        if !self.enabled {
            return false;
        }
        if let Some(handle) = self.handle.as_mut() {
            self.backend.disable(handle);
        }
        self.enabled = false;
        true
    }
}

impl<B: PwmBackend> Drop for PwmChannel<B> {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if state.enabled {
            warn!("PWM channel {} released while enabled; disabling", self.id);
            state.switch_off();
        }
        if let Some(handle) = state.handle.take() {
            state.backend.free(handle);
            info!("PWM channel {} released", self.id);
        }
    }
}
