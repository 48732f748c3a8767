use crate::error::BackendError;

/// Hardware PWM provider.
///
/// A backend hands out at most one handle per channel. The handle is the
/// only way to drive the output, and `free` consumes it, so a channel can
/// never be released twice.
pub trait PwmBackend: Send {
    type Handle: Send;

    /// Request exclusive use of `channel`. `None` if the channel does not
    /// exist, is already taken, or the hardware is absent.
    fn request(&mut self, channel: u8) -> Option<Self::Handle>;

    /// Program on-time and period, both in nanoseconds.
    fn configure(
        &mut self,
        handle: &mut Self::Handle,
        on_time_ns: u64,
        period_ns: u64,
    ) -> Result<(), BackendError>;

    fn enable(&mut self, handle: &mut Self::Handle) -> Result<(), BackendError>;

    /// Stop the output. Best effort.
    fn disable(&mut self, handle: &mut Self::Handle);

    fn free(&mut self, handle: Self::Handle);
}

/// Duty value for hardware whose "set duty" call also drives the pin.
///
/// While idle, updates are only stored. Going live writes the stored value;
/// while live, every update is written through before it is stored.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DutyLatch {
    duty: u32,
    live: bool,
}

impl DutyLatch {
    pub fn duty(&self) -> u32 {
        self.duty
    }

    pub fn is_live(&self) -> bool {
        self.live
    }

    /// Store `duty`, writing it first if live. A failed write keeps the old value.
    pub fn update<E>(
        &mut self,
        duty: u32,
        write: impl FnOnce(u32) -> Result<(), E>,
    ) -> Result<(), E> {
        if self.live {
            write(duty)?;
        }
        self.duty = duty;
        Ok(())
    }

    /// Write the stored duty and stay live on success.
    pub fn go_live<E>(&mut self, write: impl FnOnce(u32) -> Result<(), E>) -> Result<(), E> {
        write(self.duty)?;
        self.live = true;
        Ok(())
    }

    pub fn go_idle(&mut self) {
        self.live = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idle_update_is_not_written() {
        let mut latch = DutyLatch::default();
        let mut writes = Vec::new();
        latch
            .update(4096, |d| {
                writes.push(d);
                Ok::<_, ()>(())
            })
            .unwrap();
        assert!(writes.is_empty());
        assert_eq!(latch.duty(), 4096);
        assert!(!latch.is_live());
    }

    #[test]
    fn test_go_live_writes_stored_duty() {
        let mut latch = DutyLatch::default();
        latch.update(100, |_| Ok::<_, ()>(())).unwrap();

        let mut written = None;
        latch
            .go_live(|d| {
                written = Some(d);
                Ok::<_, ()>(())
            })
            .unwrap();
        assert_eq!(written, Some(100));
        assert!(latch.is_live());
    }

    #[test]
    fn test_live_update_writes_through() {
        let mut latch = DutyLatch::default();
        latch.go_live(|_| Ok::<_, ()>(())).unwrap();

        let mut written = None;
        latch
            .update(250, |d| {
                written = Some(d);
                Ok::<_, ()>(())
            })
            .unwrap();
        assert_eq!(written, Some(250));
        assert_eq!(latch.duty(), 250);
    }

    #[test]
    fn test_failed_write_keeps_previous_duty() {
        let mut latch = DutyLatch::default();
        latch.update(10, |_| Ok::<_, ()>(())).unwrap();
        assert_eq!(latch.go_live(|_| Err("bus")), Err("bus"));
        assert!(!latch.is_live());

        latch.go_live(|_| Ok::<_, &str>(())).unwrap();
        assert_eq!(latch.update(20, |_| Err("bus")), Err("bus"));
        assert_eq!(latch.duty(), 10);
    }

    #[test]
    fn test_go_idle_stops_write_through() {
        let mut latch = DutyLatch::default();
        latch.go_live(|_| Ok::<_, ()>(())).unwrap();
        latch.go_idle();

        let mut writes = 0;
        latch
            .update(7, |_| {
                writes += 1;
                Ok::<_, ()>(())
            })
            .unwrap();
        assert_eq!(writes, 0);
        assert_eq!(latch.duty(), 7);
    }
}
