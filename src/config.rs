//! Compile-time capacities and the runtime configuration surface.

/// Neighbor table capacity. Must stay at or below 32 so that an index fits
/// one byte on the wire and reachability bitmaps fit in a `u32`, and low
/// enough that a HELLO still fits one frame with one MIC per permanent
/// neighbor appended: `(MAX_FRAME_LEN - hello payload) / MIC_LEN`.
pub const NBR_MAX: usize = 12;

/// How many neighbors may sit in the tentative stage at once.
pub const NBR_MAX_TENTATIVES: usize = 5;

/// Outgoing frame queue depth.
pub const QUEUE_CAP: usize = 8;

/// Highest burst index; a burst carries at most `MAX_BURST_INDEX + 1` frames.
pub const MAX_BURST_INDEX: usize = 3;

/// Largest PHY service data unit of IEEE 802.15.4.
pub const MAX_FRAME_LEN: usize = 127;

/// Capacity of the radio's wake-up sequence ring buffer.
pub const MAX_SEQUENCE_LEN: usize = 255;

/// Capacity of the late-rendezvous cache; one per possible channel.
pub const LATE_RENDEZVOUS_CAP: usize = 16;

pub const DEFAULT_CHANNELS_POTR: &[u8] =
    &[11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24, 25, 26];
pub const DEFAULT_CHANNELS_COMPLIANT: &[u8] = &[26];

/// Runtime-tunable parameters. `Default` mirrors the reference defaults.
#[derive(Debug, Clone)]
pub struct Config {
    /// Channel sampling frequency in Hz; must be a power of two.
    pub wake_up_counter_rate: u32,
    /// Channel list. A single entry in compliant mode; a power-of-two-sized
    /// list in POTR mode (ordering is irrelevant, channels are mixed
    /// pseudo-randomly).
    pub channels: &'static [u8],
    pub output_power_dbm: i8,
    pub cca_threshold_dbm: i8,
    pub clock_tolerance_ppm: u32,
    pub compensation_tolerance_ppm: u32,
    pub min_time_between_drift_updates_s: u32,
    pub max_retransmissions: u8,
    pub broadcast_max_retransmissions: u8,
    pub max_retransmissions_of_helloacks_and_acks: u8,
    pub nbr_lifetime_s: u32,
    /// Upper bound on the random HELLOACK delay plus the ACK round trip.
    pub max_waiting_period_s: u32,
    pub max_retransmission_back_off_s: u32,
    pub update_check_interval_s: u32,
    pub max_hello_rate_s: u32,
    pub max_consecutive_hellos: u16,
    pub max_inc_hello_rate_s: u32,
    pub max_consecutive_inc_hellos: u16,
    pub max_helloack_rate_s: u32,
    pub max_consecutive_helloacks: u16,
    pub max_inc_helloack_rate_s: u32,
    pub max_consecutive_inc_helloacks: u16,
    pub max_ack_rate_s: u32,
    pub max_consecutive_acks: u16,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            wake_up_counter_rate: 8,
            channels: DEFAULT_CHANNELS_POTR,
            output_power_dbm: 0,
            cca_threshold_dbm: -81,
            clock_tolerance_ppm: 15,
            compensation_tolerance_ppm: 3,
            min_time_between_drift_updates_s: 50,
            max_retransmissions: 5,
            broadcast_max_retransmissions: 3,
            max_retransmissions_of_helloacks_and_acks: 1,
            nbr_lifetime_s: 60 * 5,
            max_waiting_period_s: 5,
            max_retransmission_back_off_s: 2,
            update_check_interval_s: 1,
            max_hello_rate_s: 5 * 60,
            max_consecutive_hellos: 10,
            max_inc_hello_rate_s: 15,
            max_consecutive_inc_hellos: 20,
            max_helloack_rate_s: 150,
            max_consecutive_helloacks: 20,
            max_inc_helloack_rate_s: 8,
            max_consecutive_inc_helloacks: 20,
            max_ack_rate_s: 150,
            max_consecutive_acks: 20,
        }
    }
}

impl Config {
    pub fn compliant() -> Self {
        Config {
            channels: DEFAULT_CHANNELS_COMPLIANT,
            ..Config::default()
        }
    }
}
