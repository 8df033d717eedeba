//! Wait-any-bits event group for the controller task.
//!
//! Raising a bit is cheap and allowed from any context. Bits raised
//! repeatedly before the waiter runs are coalesced into one wake.

use core::sync::atomic::{AtomicU8, Ordering};

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::signal::Signal;

pub const EVT_TICK_FAST: u8 = 1 << 0;
pub const EVT_TICK_SLOW: u8 = 1 << 1;
pub const EVT_STATE_CHANGED: u8 = 1 << 2;
pub const EVT_CONFIG_CHANGED: u8 = 1 << 3;

pub struct EventBits {
    bits: AtomicU8,
    wake: Signal<CriticalSectionRawMutex, ()>,
}

impl EventBits {
    pub const fn new() -> Self {
        Self {
            bits: AtomicU8::new(0),
            wake: Signal::new(),
        }
    }

    pub fn raise(&self, bits: u8) {
        self.bits.fetch_or(bits, Ordering::AcqRel);
        self.wake.signal(());
    }

    /// Returns and clears all pending bits.
    pub fn take(&self) -> u8 {
        self.bits.swap(0, Ordering::AcqRel)
    }

    /// Returns and clears `bits` only, leaving the others pending.
    pub fn take_only(&self, bits: u8) -> u8 {
        self.bits.fetch_and(!bits, Ordering::AcqRel) & bits
    }

    pub fn pending(&self) -> u8 {
        self.bits.load(Ordering::Acquire)
    }

    /// Waits until at least one bit is set, then takes all of them.
    pub async fn wait(&self) -> u8 {
        loop {
            let bits = self.take();
            if bits != 0 {
                return bits;
            }
            self.wake.wait().await;
        }
    }
}

impl Default for EventBits {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embassy_futures::block_on;

    #[test]
    fn raises_coalesce() {
        let bits = EventBits::new();
        bits.raise(EVT_STATE_CHANGED);
        bits.raise(EVT_STATE_CHANGED);
        bits.raise(EVT_STATE_CHANGED);
        bits.raise(EVT_TICK_FAST);
        assert_eq!(block_on(bits.wait()), EVT_STATE_CHANGED | EVT_TICK_FAST);
        assert_eq!(bits.pending(), 0);
    }

    #[test]
    fn take_only_leaves_other_bits() {
        let bits = EventBits::new();
        bits.raise(EVT_TICK_SLOW | EVT_CONFIG_CHANGED);
        assert_eq!(bits.take_only(EVT_CONFIG_CHANGED | EVT_STATE_CHANGED), EVT_CONFIG_CHANGED);
        assert_eq!(bits.take(), EVT_TICK_SLOW);
    }

    #[test]
    fn stale_wake_without_bits_keeps_waiting() {
        let bits = EventBits::new();
        bits.raise(EVT_TICK_FAST);
        // Bits consumed without waiting, the wake signal stays set
        assert_eq!(bits.take(), EVT_TICK_FAST);
        bits.raise(EVT_TICK_SLOW);
        assert_eq!(block_on(bits.wait()), EVT_TICK_SLOW);
    }
}
