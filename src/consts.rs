//! Constants used across the bridge.
//!
//! Timing values are expressed in microseconds of wall-clock time; the
//! conversion to hardware compare counts lives in [`crate::timer`]. The
//! thresholds follow the SDI-12 v1.3 electrical timing rules: a break is at
//! least 12 ms of spacing, the post-break mark is at least 8.33 ms, and a
//! character at 1200 baud 7E1 (10 bits) lasts 8.33 ms.

/// Duration of one character on the wire: 10 bits at 1200 baud.
pub const CHAR_US: u32 = 8_333;

/// Minimum low interval that qualifies as a break.
pub const BREAK_MIN_US: u32 = 12_000;

/// Failsafe while waiting for the end of a suspected break; a line held low
/// longer than this is a fault.
pub const BREAK_TIMEOUT_US: u32 = 100_000;

/// Break re-test budget after a framing error: the standard 100 ms less the
/// character time already spent inside the corrupted character.
pub const BREAK_RETEST_US: u32 = BREAK_TIMEOUT_US - CHAR_US;

/// Minimum post-break mark. Armed just short of one character time so the
/// compare fires before a start bit can complete.
pub const MARK_MIN_US: u32 = 8_190;

/// Budget from the end of the break to the first command character.
pub const WAKE_TIMEOUT_US: u32 = 100_000;

/// Maximum spacing from one received character to the next (one character
/// time plus the allowed 1.66 ms inter-character mark, rounded up).
pub const INTER_CHAR_US: u32 = 12_000;

/// Mark held between the host's `!` terminator and the first response
/// character. The command is parsed inside this window.
pub const RESPONSE_MARK_US: u32 = 8_450;

/// Granularity of the service-request wait; the window is
/// `10 × measure_wait` of these ticks.
pub const SRQ_TICK_US: u32 = 100_000;

/// Window after a service request in which the host may send `aD0!` without
/// a fresh break.
pub const POST_SRQ_WINDOW_US: u32 = 85_000;

/// Failsafe for the break/mark sequence following a service request.
pub const POST_SRQ_FAILSAFE_US: u32 = 200_000;

/// Failsafe from the start bit of a no-break `aD0!` to its receive-complete.
pub const DCHAR_FAILSAFE_US: u32 = 10_000;

/// Smallest accepted measure-wait, in seconds.
pub const MEASURE_WAIT_MIN: u8 = 1;

/// Largest accepted measure-wait, in seconds. Bounded by the 16-bit compare
/// range of the reference timer configuration.
pub const MEASURE_WAIT_MAX: u8 = 4;

/// Receive buffer capacity: the longest valid command plus terminator, with
/// slack for the zero padding that keeps the buffer a readable string.
pub const RX_BUF_LEN: usize = 10;

/// Transmit buffer capacity for locally generated responses.
pub const TX_BUF_LEN: usize = 40;

/// Capacity of a wireless data message handed to the protocol core.
pub const DATA_MSG_CAP: usize = 35;

/// Zero bytes reserved at the tail of a data message for the CRC characters,
/// `<CR><LF>` and the string terminator.
pub const DATA_SLACK: usize = 6;

/// `msg_signal` sentinel: no data request pending.
pub const NO_REQUEST: u8 = 0xFF;

/// Number of values reported per measurement (one per probe).
pub const MEASURE_VALUES: u8 = 2;

/// Upper bound on concurrently served wireless nodes.
pub const MAX_NODES: usize = 10;

/// Samples retained per probe.
pub const SAMPLE_RING: usize = 16;

/// Probes attached to each node.
pub const PROBES_PER_NODE: usize = 2;

/// Full-scale reading of the node ADC; the default reject sentinel for
/// sample validation.
pub const ADC_FULL_SCALE: u16 = 0x03FF;

/// Identity payload sent after the address in the `aI!` response:
/// 2-character compatibility level, 8-character vendor, 6-character model,
/// 3-character version and a 4-character tail.
pub const IDENT_PAYLOAD: &[u8; 23] = b"13HYDROLNKSMB1000010000";
