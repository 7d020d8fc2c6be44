//! The contract between the link layer and a platform radio driver.
//!
//! The link layer never touches hardware. Platform code implements [`Radio`]
//! on top of its transceiver and forwards the transceiver's interrupts to
//! the corresponding `CslMac` entry points (`on_sfd`, `on_fifop`,
//! `on_txdone`). The platform also owns one real-time timer; after each call
//! into the link layer it re-arms that timer to [`crate::csl::CslMac::next_timeout`].

use crate::time::Ticks;

/// A FIFO read failed, e.g. because the frame was shorter than advertised
/// or reception was aborted underneath us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RadioError;

/// Asynchronous radio operations, mirroring what CSL needs from a
/// transceiver that can stream a wake-up sequence out of a ring buffer
/// while the MCU keeps appending to it.
pub trait Radio {
    /// Puts the radio into the asynchronous mode this driver relies on.
    fn enter_async_mode(&mut self);

    fn on(&mut self);
    fn off(&mut self);

    fn set_channel(&mut self, channel: u8);
    fn channel(&self) -> u8;
    fn set_tx_power(&mut self, dbm: i8);

    /// Current received signal strength, for clear-channel assessment.
    fn rssi(&self) -> i8;

    /// Loads a single frame (`frame[0]` is the PHY length byte) for a
    /// subsequent [`Radio::transmit`].
    fn prepare(&mut self, frame: &[u8]);

    /// Transmits the prepared frame. With `keep_radio_on`, reception
    /// resumes right after the last symbol instead of powering down.
    fn transmit(&mut self, keep_radio_on: bool);

    /// Loads the head of a wake-up sequence into the sequence buffer.
    fn prepare_sequence(&mut self, bytes: &[u8]);

    /// Starts streaming the prepared sequence.
    fn transmit_sequence(&mut self);

    /// Appends more bytes behind the sequence's current drain position.
    fn append_to_sequence(&mut self, bytes: &[u8]);

    /// Marks the sequence as complete; transmission stops once drained.
    fn finish_sequence(&mut self);

    /// Reads the PHY length byte of the frame being received.
    fn read_phy_header(&mut self) -> Result<u8, RadioError>;

    /// Reads `dst.len()` payload bytes out of the receive FIFO.
    fn read_payload(&mut self, dst: &mut [u8]) -> Result<(), RadioError>;

    /// Payload bytes of the current frame not yet read out.
    fn remaining_payload_bytes(&self) -> u8;

    /// Arms the FIFO-threshold interrupt to fire once the receive FIFO
    /// holds at least `bytes` unread bytes.
    fn set_fifop_threshold(&mut self, bytes: u8);

    /// Disarms the FIFO-threshold interrupt.
    fn clear_fifop(&mut self);
}

/// The synchronization header every raw frame in a wake-up sequence
/// starts with: four preamble bytes and the start-of-frame delimiter.
pub const SHR: [u8; 5] = [0x00, 0x00, 0x00, 0x00, 0xa7];

/// Platform timing constants, captured once at construction.
///
/// The defaults describe a 2.4 GHz O-QPSK PHY (62500 symbols/s, 2 symbols
/// per byte, 5-byte SHR) clocked against a 32768 Hz real-time timer.
#[derive(Debug, Clone, Copy)]
pub struct Timing {
    /// Real-time timer frequency. Must be a power of two so that wake-up
    /// interval arithmetic reduces to masking.
    pub ticks_per_second: u32,
    /// PHY symbol rate in symbols per second.
    pub symbol_rate: u32,
    pub symbols_per_byte: u32,
    /// Synchronization header: preamble plus SFD, in bytes.
    pub shr_len: u32,
    /// SHR plus the frame length byte, in bytes.
    pub phy_header_len: u32,
    /// Air time of one byte, in microseconds.
    pub byte_period_us: u32,
    /// Ticks from `on()` until the receiver actually hears the channel.
    pub receive_calibration: u32,
    /// Ticks from `transmit()` until the first symbol leaves the antenna.
    pub transmit_calibration: u32,
    /// Ticks needed for one clear-channel assessment.
    pub cca_time: u32,
}

impl Default for Timing {
    fn default() -> Self {
        Timing {
            ticks_per_second: 32768,
            symbol_rate: 62500,
            symbols_per_byte: 2,
            shr_len: 5,
            phy_header_len: 6,
            byte_period_us: 32,
            receive_calibration: 7,
            transmit_calibration: 7,
            cca_time: 5,
        }
    }
}

impl Timing {
    /// Ticks it takes to transmit the given number of PHY symbols.
    pub fn time_to_transmit(&self, symbol_periods: u32) -> u32 {
        ((symbol_periods as u64 * self.ticks_per_second as u64) / self.symbol_rate as u64) as u32
    }

    /// Air time of the synchronization header, in ticks.
    pub fn shr_time(&self) -> u32 {
        self.time_to_transmit(self.symbols_per_byte * self.shr_len)
    }

    pub fn us_to_ticks(&self, us: u32) -> u32 {
        ((us as u64 * self.ticks_per_second as u64) / 1_000_000) as u32
    }

    pub fn ticks_to_s(&self, ticks: u32) -> u32 {
        ticks / self.ticks_per_second
    }

    /// Seconds between two instants, `later` assumed at or after `earlier`.
    pub fn seconds_between(&self, earlier: Ticks, later: Ticks) -> u32 {
        self.ticks_to_s(later.diff(earlier).max(0) as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn air_time() {
        let t = Timing::default();
        // one byte = 2 symbols = 32 us
        assert_eq!(t.time_to_transmit(2), t.us_to_ticks(32));
        // the SHR of a 127-byte frame is well under a millisecond
        assert!(t.shr_time() < t.us_to_ticks(1000));
    }
}
