//! The wake-up counter: a monotonic count of duty-cycle ticks.
//!
//! One increment per wake-up interval, where the interval is
//! `ticks_per_second / rate` radio ticks and `rate` is a power of two, so
//! all modulo and division below reduce to masking and shifting.
//!
//! On the wire the counter travels as 4 bytes big-endian.

use crate::time::Ticks;

pub const WAKE_UP_COUNTER_LEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WakeUpCounter(pub u32);

impl WakeUpCounter {
    pub fn parse(src: &[u8]) -> WakeUpCounter {
        WakeUpCounter(u32::from_be_bytes([src[0], src[1], src[2], src[3]]))
    }

    pub fn write(self, dst: &mut [u8]) {
        dst[..WAKE_UP_COUNTER_LEN].copy_from_slice(&self.0.to_be_bytes());
    }

    /// Low byte; nonce material and channel-hash input.
    pub fn low_byte(self) -> u8 {
        self.0 as u8
    }
}

/// Conversions between tick durations and wake-up counter increments.
#[derive(Debug, Clone, Copy)]
pub struct WakeUpTimebase {
    interval: u32,
}

impl WakeUpTimebase {
    /// Panics if the resulting interval is not a power of two; the rate
    /// must divide the (power-of-two) timer frequency into a power of two.
    pub fn new(ticks_per_second: u32, rate: u32) -> WakeUpTimebase {
        let interval = ticks_per_second / rate;
        assert!(interval.is_power_of_two());
        WakeUpTimebase { interval }
    }

    pub fn interval(&self) -> u32 {
        self.interval
    }

    /// Whole increments in `delta`, plus the remainder in ticks.
    pub fn increments(&self, delta: u32) -> (u32, u32) {
        (
            delta >> self.interval.trailing_zeros(),
            delta & (self.interval - 1),
        )
    }

    /// Increments in `delta`, rounded half-up.
    pub fn round_increments(&self, delta: u32) -> u32 {
        let (increments, rem) = self.increments(delta);
        if rem >= self.interval / 2 {
            increments + 1
        } else {
            increments
        }
    }

    /// Smallest instant at or after `now` that is congruent to `time`
    /// modulo the wake-up interval.
    pub fn shift_to_future(&self, time: Ticks, now: Ticks) -> Ticks {
        let mask = self.interval - 1;
        let mut time = Ticks((now.0 & !mask) | (time.0 & mask));
        while time.has_timed_out(now) {
            time += self.interval;
        }
        time
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tb() -> WakeUpTimebase {
        WakeUpTimebase::new(32768, 8) // 4096-tick interval
    }

    #[test]
    fn wire_format_is_big_endian() {
        let mut buf = [0u8; 4];
        WakeUpCounter(0x01020304).write(&mut buf);
        assert_eq!(buf, [1, 2, 3, 4]);
        assert_eq!(WakeUpCounter::parse(&buf), WakeUpCounter(0x01020304));
    }

    #[test]
    fn increments_split_quotient_and_remainder() {
        let tb = tb();
        assert_eq!(tb.increments(0), (0, 0));
        assert_eq!(tb.increments(4095), (0, 4095));
        assert_eq!(tb.increments(4096), (1, 0));
        assert_eq!(tb.increments(3 * 4096 + 17), (3, 17));
    }

    #[test]
    fn round_increments_of_exact_multiples() {
        let tb = tb();
        for k in 0..5 {
            assert_eq!(tb.round_increments(k * tb.interval()), k);
        }
        assert_eq!(tb.round_increments(2047), 0);
        assert_eq!(tb.round_increments(2048), 1);
    }

    #[test]
    fn shift_to_future_is_congruent_and_not_past() {
        let tb = tb();
        let now = Ticks(100_000);
        for t in [0u32, 17, 4095, 70_000] {
            let shifted = tb.shift_to_future(Ticks(t), now);
            assert_eq!(shifted.0 & (tb.interval() - 1), t & (tb.interval() - 1));
            assert!(shifted.diff(now) > 0);
            assert!(shifted.diff(now) <= tb.interval() as i32);
        }
    }
}
