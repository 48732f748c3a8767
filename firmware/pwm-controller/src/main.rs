mod ledc;
mod vfs;

use duty_control::{Controller, ControllerConfig, PERIOD_NS};
use esp_idf_hal::ledc::{config::TimerConfig, LedcDriver, LedcTimerDriver, Resolution};
use esp_idf_hal::peripherals::Peripherals;
use esp_idf_hal::prelude::*;
use ledc::LedcBackend;
use log::{error, info};
use std::thread::sleep;
use std::time::Duration;
use vfs::VfsRegistry;

/// LEDC carrier, one period of `PERIOD_NS`.
const CARRIER_HZ: u32 = (1_000_000_000 / PERIOD_NS) as u32;
const _: () = assert!(CARRIER_HZ as u64 * PERIOD_NS == 1_000_000_000);

/// Only the original ESP32 has the 20-bit timers (and REF_TICK) needed to
/// divide down to 1 Hz. Later chips top out at 14 bits, which their clock
/// dividers cannot bring this low, so timer setup fails there.
#[cfg(esp32)]
const TIMER_RESOLUTION: Resolution = Resolution::Bits20;
#[cfg(not(esp32))]
const TIMER_RESOLUTION: Resolution = Resolution::Bits14;

const STATUS_INTERVAL: Duration = Duration::from_secs(10);

fn main() {
    esp_idf_svc::sys::link_patches();
    esp_idf_logger::init().expect("Failed to init logger");

    info!("PWM Controller v{}", env!("CARGO_PKG_VERSION"));

    let peripherals = Peripherals::take().expect("Failed to take peripherals");

    let timer_config = TimerConfig::default()
        .frequency(CARRIER_HZ.Hz().into())
        .resolution(TIMER_RESOLUTION);
    let timer = match LedcTimerDriver::new(peripherals.ledc.timer0, &timer_config) {
        Ok(timer) => timer,
        Err(e) => {
            error!(
                "LEDC timer cannot run at {} Hz with a {}-bit counter on this chip: {}",
                CARRIER_HZ,
                TIMER_RESOLUTION.bits(),
                e
            );
            return;
        }
    };

    let ledc_driver = match LedcDriver::new(
        peripherals.ledc.channel0,
        timer,
        peripherals.pins.gpio6, // PWM output pin
    ) {
        Ok(driver) => driver,
        Err(e) => {
            error!("Failed to init LEDC channel: {}", e);
            return;
        }
    };

    let backend = LedcBackend::new(ledc_driver, CARRIER_HZ);
    let config = ControllerConfig::default();
    let node = config.node_name.clone();

    let controller = match Controller::start(backend, VfsRegistry::new(), config) {
        Ok(controller) => controller,
        Err(e) => {
            error!("PWM controller not started: {}", e);
            return;
        }
    };

    info!("Write 0-100 to /dev/{} to set the duty cycle", node);

    loop {
        sleep(STATUS_INTERVAL);
        if let Some(channel) = controller.channel() {
            info!(
                "channel {}: on_time={}ns period={}ns enabled={}",
                channel.id(),
                channel.on_time_ns(),
                channel.period_ns(),
                channel.is_enabled()
            );
        }
    }
}
