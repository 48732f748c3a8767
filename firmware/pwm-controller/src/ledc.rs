use duty_control::{BackendError, DutyLatch, PwmBackend};
use esp_idf_hal::ledc::LedcDriver;
use esp_idf_sys::EspError;
use log::{debug, warn};

/// The only channel number this backend hands out.
pub const LEDC_CHANNEL: u8 = 0;

/// PWM backend over one LEDC channel with a fixed timer frequency.
pub struct LedcBackend {
    driver: Option<LedcDriver<'static>>,
    period_ns: u64,
}

/// `LedcDriver::set_duty` drives the pin at once, so the duty is latched
/// while the output is off and only written on `enable`.
pub struct LedcHandle {
    driver: LedcDriver<'static>,
    max_duty: u32,
    latch: DutyLatch,
}

impl LedcBackend {
    /// Wrap a configured LEDC channel whose timer runs at `frequency_hz`.
    pub fn new(driver: LedcDriver<'static>, frequency_hz: u32) -> Self {
        Self {
            driver: Some(driver),
            period_ns: 1_000_000_000 / u64::from(frequency_hz.max(1)),
        }
    }

    /// Convert on-time to LEDC duty ticks.
    fn on_time_to_duty(on_time_ns: u64, period_ns: u64, max_duty: u32) -> u32 {
        (u128::from(on_time_ns) * u128::from(max_duty) / u128::from(period_ns)) as u32
    }
}

fn backend_err(e: EspError) -> BackendError {
    BackendError::Failed(e.to_string())
}

impl PwmBackend for LedcBackend {
    type Handle = LedcHandle;

    fn request(&mut self, channel: u8) -> Option<LedcHandle> {
        if channel != LEDC_CHANNEL {
            return None;
        }
        let mut driver = self.driver.take()?;
        if let Err(e) = driver.disable() {
            warn!("LEDC disable on request failed: {:?}", e);
        }
        let max_duty = driver.get_max_duty();
        Some(LedcHandle {
            driver,
            max_duty,
            latch: DutyLatch::default(),
        })
    }

    fn configure(
        &mut self,
        handle: &mut LedcHandle,
        on_time_ns: u64,
        period_ns: u64,
    ) -> Result<(), BackendError> {
        // The timer frequency is fixed at boot.
        if period_ns != self.period_ns || on_time_ns > period_ns {
            return Err(BackendError::TimingRejected {
                on_time_ns,
                period_ns,
            });
        }
        let duty = Self::on_time_to_duty(on_time_ns, period_ns, handle.max_duty);
        debug!(
            "LEDC duty {}/{} ({})",
            duty,
            handle.max_duty,
            if handle.latch.is_live() { "applied" } else { "pending" }
        );
        let driver = &mut handle.driver;
        handle
            .latch
            .update(duty, |d| driver.set_duty(d))
            .map_err(backend_err)
    }

    fn enable(&mut self, handle: &mut LedcHandle) -> Result<(), BackendError> {
        let driver = &mut handle.driver;
        handle
            .latch
            .go_live(|d| driver.set_duty(d))
            .map_err(backend_err)
    }

    fn disable(&mut self, handle: &mut LedcHandle) {
        handle.latch.go_idle();
        if let Err(e) = handle.driver.disable() {
            warn!("LEDC disable failed: {:?}", e);
        }
    }

    fn free(&mut self, handle: LedcHandle) {
        self.driver = Some(handle.driver);
    }
}
