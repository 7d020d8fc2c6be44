//! Test doubles: a FIFO-backed radio, a static key scheme, and a bundle
//! of link-layer state for exercising framers and strategies without a
//! scheduler.

use rand_core::RngCore;

use crate::anti_replay::FrameCounter;
use crate::config::Config;
use crate::csl::{CslClock, LinkCtx};
use crate::nbr::NbrTable;
use crate::radio::{Radio, RadioError, Timing};
use crate::synchronizer::SyncArena;
use crate::time::Ticks;
use crate::wake_up_counter::{WakeUpCounter, WakeUpTimebase};
use crate::{KeyScheme, LinkAddr};

/// A radio whose receive FIFO is a byte buffer loaded by the test.
#[derive(Default)]
pub struct MockRadio {
    pub fifo: std::vec::Vec<u8>,
    pub read_at: usize,
    pub phy_len: u8,
    pub channel: u8,
    pub rssi: i8,
    pub on: bool,
    pub prepared: std::vec::Vec<u8>,
    pub sequence: std::vec::Vec<u8>,
    pub transmitted: std::vec::Vec<std::vec::Vec<u8>>,
}

impl MockRadio {
    pub fn new() -> MockRadio {
        MockRadio {
            rssi: -90,
            ..MockRadio::default()
        }
    }

    /// Loads a received frame: `frame[0]` is the PHY length byte.
    pub fn load_frame(&mut self, frame: &[u8]) {
        self.phy_len = frame[0];
        self.fifo = frame[1..].to_vec();
        self.read_at = 0;
    }
}

impl Radio for MockRadio {
    fn enter_async_mode(&mut self) {}

    fn on(&mut self) {
        self.on = true;
    }

    fn off(&mut self) {
        self.on = false;
    }

    fn set_channel(&mut self, channel: u8) {
        self.channel = channel;
    }

    fn channel(&self) -> u8 {
        self.channel
    }

    fn set_tx_power(&mut self, _dbm: i8) {}

    fn rssi(&self) -> i8 {
        self.rssi
    }

    fn prepare(&mut self, frame: &[u8]) {
        self.prepared = frame.to_vec();
    }

    fn transmit(&mut self, _keep_radio_on: bool) {
        self.transmitted.push(self.prepared.clone());
    }

    fn prepare_sequence(&mut self, bytes: &[u8]) {
        self.sequence = bytes.to_vec();
    }

    fn transmit_sequence(&mut self) {}

    fn append_to_sequence(&mut self, bytes: &[u8]) {
        self.sequence.extend_from_slice(bytes);
    }

    fn finish_sequence(&mut self) {}

    fn read_phy_header(&mut self) -> Result<u8, RadioError> {
        Ok(self.phy_len)
    }

    fn read_payload(&mut self, dst: &mut [u8]) -> Result<(), RadioError> {
        if self.read_at + dst.len() > self.fifo.len() {
            return Err(RadioError);
        }
        dst.copy_from_slice(&self.fifo[self.read_at..self.read_at + dst.len()]);
        self.read_at += dst.len();
        Ok(())
    }

    fn remaining_payload_bytes(&self) -> u8 {
        (self.fifo.len() - self.read_at) as u8
    }

    fn set_fifop_threshold(&mut self, _bytes: u8) {}

    fn clear_fifop(&mut self) {}
}

/// Every pair of nodes shares the same secret.
pub struct SingleSecret(pub [u8; 16]);

impl KeyScheme for SingleSecret {
    fn secret_with_hello_sender(&self, _addr: &LinkAddr) -> Option<[u8; 16]> {
        Some(self.0)
    }

    fn secret_with_helloack_sender(&self, _addr: &LinkAddr) -> Option<[u8; 16]> {
        Some(self.0)
    }
}

/// A deterministic counter-based generator; only for tests.
pub struct SeqRng(pub u32);

impl RngCore for SeqRng {
    fn next_u32(&mut self) -> u32 {
        self.0 = self.0.wrapping_mul(1103515245).wrapping_add(12345);
        self.0
    }

    fn next_u64(&mut self) -> u64 {
        (self.next_u32() as u64) << 32 | self.next_u32() as u64
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        for b in dest {
            *b = self.next_u32() as u8;
        }
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand_core::Error> {
        self.fill_bytes(dest);
        Ok(())
    }
}

/// One node's worth of link-layer state, for building a [`LinkCtx`].
pub struct TestNode {
    pub cfg: Config,
    pub timing: Timing,
    pub nbr: NbrTable,
    pub sync: SyncArena,
    pub akes: crate::akes::AkesState,
    pub counter: FrameCounter,
    pub key_scheme: SingleSecret,
    pub rng: SeqRng,
    pub addr: LinkAddr,
    pub pan_id: u16,
    pub channel: u8,
    pub wake_up_counter: WakeUpCounter,
    pub last_payload_sfd: Ticks,
}

impl TestNode {
    pub fn new(addr_byte: u8) -> TestNode {
        let cfg = Config::default();
        let akes = crate::akes::AkesState::new(&cfg, true, crate::akes::ExpiryPolicy::SyncBased);
        TestNode {
            cfg,
            timing: Timing::default(),
            nbr: NbrTable::new(),
            sync: SyncArena::default(),
            akes,
            counter: FrameCounter::new(),
            key_scheme: SingleSecret([0x42; 16]),
            rng: SeqRng(addr_byte as u32 + 1),
            addr: LinkAddr([addr_byte; 8]),
            pan_id: 0xabcd,
            channel: 15,
            wake_up_counter: WakeUpCounter(0),
            last_payload_sfd: Ticks(0),
        }
    }

    pub fn clock(&self) -> CslClock {
        CslClock {
            timebase: WakeUpTimebase::new(
                self.timing.ticks_per_second,
                self.cfg.wake_up_counter_rate,
            ),
            wake_up_counter: self.wake_up_counter,
            last_increment: Ticks(0),
            last_wake_up_time: Ticks(0),
            last_payload_sfd: self.last_payload_sfd,
        }
    }

    pub fn ctx(&mut self, now: Ticks) -> LinkCtx<'_> {
        let clock = self.clock();
        LinkCtx {
            cfg: &self.cfg,
            timing: &self.timing,
            nbr: &mut self.nbr,
            sync: &mut self.sync,
            akes: &mut self.akes,
            counter: &mut self.counter,
            key_scheme: &self.key_scheme,
            rng: &mut self.rng,
            clock,
            node_addr: self.addr,
            pan_id: self.pan_id,
            channel: self.channel,
            now,
            now_s: 0,
        }
    }
}
