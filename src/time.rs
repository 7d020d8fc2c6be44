//! Instants on the radio's real-time timer.
//!
//! The timer is a free-running 32-bit counter that wraps. All comparisons
//! therefore go through signed differences, never through `<` on the raw
//! value. A difference is meaningful as long as the two instants are less
//! than half the counter range apart, which holds for every interval this
//! crate schedules.

use core::ops::{Add, AddAssign, Sub};

/// An instant (or unsigned duration) in radio-timer ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Ticks(pub u32);

impl Ticks {
    /// Signed distance from `earlier` to `self`, in ticks.
    pub fn diff(self, earlier: Ticks) -> i32 {
        self.0.wrapping_sub(earlier.0) as i32
    }

    /// `self` lies at or before `other` on the (wrapping) timeline.
    pub fn is_at_or_before(self, other: Ticks) -> bool {
        other.diff(self) >= 0
    }

    /// A deadline has passed once `now` reaches it.
    pub fn has_timed_out(self, now: Ticks) -> bool {
        now.diff(self) >= 0
    }
}

impl Add<u32> for Ticks {
    type Output = Ticks;

    fn add(self, rhs: u32) -> Ticks {
        Ticks(self.0.wrapping_add(rhs))
    }
}

impl AddAssign<u32> for Ticks {
    fn add_assign(&mut self, rhs: u32) {
        self.0 = self.0.wrapping_add(rhs);
    }
}

impl Sub<u32> for Ticks {
    type Output = Ticks;

    fn sub(self, rhs: u32) -> Ticks {
        Ticks(self.0.wrapping_sub(rhs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrapping_comparisons() {
        let a = Ticks(u32::MAX - 10);
        let b = a + 20;
        assert_eq!(b.0, 9);
        assert!(a.is_at_or_before(b));
        assert!(!b.is_at_or_before(a));
        assert_eq!(b.diff(a), 20);
        assert_eq!(a.diff(b), -20);
    }

    #[test]
    fn timeout() {
        let deadline = Ticks(100);
        assert!(!deadline.has_timed_out(Ticks(99)));
        assert!(deadline.has_timed_out(Ticks(100)));
        assert!(deadline.has_timed_out(Ticks(101)));
    }
}
