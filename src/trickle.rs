//! Trickle-style scheduling of HELLO broadcasts.
//!
//! HELLOs run on a doubling interval. Hearing a fresh authentic HELLO
//! from a neighbor we already share a session with counts as redundancy
//! and suppresses our own transmission for that round; discovering a new
//! neighbor resets the interval to its minimum so the neighborhood
//! converges quickly.

use rand_core::RngCore;

const IMIN_S: u32 = 20;
const IMAX_DOUBLINGS: u32 = 8;
const REDUNDANCY: u8 = 2;

#[derive(Debug)]
pub struct Trickle {
    interval_s: u32,
    fire_at_s: u32,
    interval_end_s: u32,
    counter: u8,
    running: bool,
}

impl Default for Trickle {
    fn default() -> Self {
        Trickle {
            interval_s: IMIN_S,
            fire_at_s: 0,
            interval_end_s: 0,
            counter: 0,
            running: false,
        }
    }
}

impl Trickle {
    pub fn start(&mut self, now_s: u32, rng: &mut dyn RngCore) {
        self.running = true;
        self.interval_s = IMIN_S;
        self.begin_interval(now_s, rng);
    }

    pub fn stop(&mut self) {
        self.running = false;
    }

    fn begin_interval(&mut self, now_s: u32, rng: &mut dyn RngCore) {
        self.counter = 0;
        // fire somewhere in the second half of the interval
        let half = self.interval_s / 2;
        let jitter = if half > 0 { rng.next_u32() % half } else { 0 };
        self.fire_at_s = now_s + half + jitter;
        self.interval_end_s = now_s + self.interval_s;
    }

    /// A fresh authentic HELLO from a known neighbor is redundancy.
    pub fn on_fresh_authentic_hello(&mut self) {
        self.counter = self.counter.saturating_add(1);
    }

    /// A new neighbor completed the handshake; advertise eagerly again.
    pub fn on_new_nbr(&mut self, now_s: u32, rng: &mut dyn RngCore) {
        if !self.running {
            return;
        }
        self.interval_s = IMIN_S;
        self.begin_interval(now_s, rng);
    }

    /// Advances the schedule; returns whether a HELLO should go out now.
    pub fn poll(&mut self, now_s: u32, rng: &mut dyn RngCore) -> bool {
        if !self.running {
            return false;
        }
        let mut fire = false;
        if self.fire_at_s != 0 && now_s >= self.fire_at_s {
            fire = self.counter < REDUNDANCY;
            self.fire_at_s = 0;
        }
        if now_s >= self.interval_end_s {
            self.interval_s = (self.interval_s * 2).min(IMIN_S << IMAX_DOUBLINGS);
            self.begin_interval(now_s, rng);
        }
        fire
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::mock::StepRng;

    #[test]
    fn fires_once_per_interval_and_doubles() {
        let mut rng = StepRng::new(0, 1);
        let mut t = Trickle::default();
        t.start(0, &mut rng);
        let mut fired = 0;
        let mut last_fire = 0;
        for s in 0..200 {
            if t.poll(s, &mut rng) {
                fired += 1;
                last_fire = s;
            }
        }
        assert!(fired >= 2);
        assert!(last_fire >= IMIN_S / 2);
    }

    #[test]
    fn redundancy_suppresses() {
        let mut rng = StepRng::new(0, 1);
        let mut t = Trickle::default();
        t.start(0, &mut rng);
        t.on_fresh_authentic_hello();
        t.on_fresh_authentic_hello();
        let mut fired = false;
        for s in 0..IMIN_S + 1 {
            fired |= t.poll(s, &mut rng);
        }
        assert!(!fired);
    }

    #[test]
    fn new_neighbor_resets_interval() {
        let mut rng = StepRng::new(0, 1);
        let mut t = Trickle::default();
        t.start(0, &mut rng);
        for s in 0..150 {
            t.poll(s, &mut rng);
        }
        t.on_new_nbr(150, &mut rng);
        assert!(t.interval_s == IMIN_S);
    }
}
