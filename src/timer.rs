//! The single compare-deadline timer and its count arithmetic.
//!
//! The protocol core owns exactly one monotonic timer with one compare
//! deadline. Every wait state arms it; every transition that leaves a wait
//! state re-arms or stops it. The trait works in microseconds; converting a
//! deadline to hardware compare counts is a pure scaling on the clock rate
//! and prescaler, provided here in both `const` and runtime form.
//!
//! Common prescaler choices for a 16-bit compare at common clock rates:
//!
//! | F_CPU  | PRESCALER | resolution | max deadline |
//! |--------|-----------|------------|--------------|
//! | 4 MHz  |      1024 |     256 µs |      16.7 s  |
//! | 8 MHz  |      1024 |     128 µs |       8.3 s  |
//! | 16 MHz |      1024 |      64 µs |       4.19 s |

use libm::roundf;

/// Microseconds of wall-clock time.
pub type Micros = u32;

/// A single-shot programmable deadline at sub-millisecond granularity.
///
/// [`elapsed`](DeadlineTimer::elapsed) must be readable from inside the edge
/// interrupt handler; the protocol core uses it to classify a transition as
/// character-long, too short, too long, or a valid break.
pub trait DeadlineTimer {
    /// Zero the counter, program the compare deadline, start counting.
    fn arm(&mut self, deadline: Micros);

    /// Stop the counter and cancel any pending deadline.
    fn stop(&mut self);

    /// Time since the last [`arm`](DeadlineTimer::arm), in microseconds.
    fn elapsed(&self) -> Micros;
}

/// Compare counts for a deadline at the given clock rate and prescaler.
///
/// Evaluated in const context this validates at compile time that the
/// deadline fits the 16-bit compare register.
pub const fn timer_counts(f_cpu: u32, prescaler: u32, interval_us: u32) -> u16 {
    let counts = (f_cpu as u64 / prescaler as u64) * interval_us as u64 / 1_000_000;
    assert!(
        counts > 0 && counts <= u16::MAX as u64,
        "deadline outside the 16-bit compare range"
    );
    counts as u16
}

/// Runtime variant of [`timer_counts`] for fractional-microsecond intervals.
///
/// Saturates at the compare range instead of panicking; a saturated value is
/// a configuration error the caller should have caught with the const form.
pub fn timer_counts_runtime(f_cpu: u32, prescaler: u32, interval_us: f32) -> u16 {
    let ticks_per_second = f_cpu as f32 / prescaler as f32;
    let counts = roundf(ticks_per_second * interval_us / 1_000_000.0);
    if counts < 1.0 {
        1
    } else if counts > u16::MAX as f32 {
        u16::MAX
    } else {
        counts as u16
    }
}

/// The longest deadline representable in the 16-bit compare register at the
/// given clock rate and prescaler, in microseconds.
pub const fn max_interval_us(f_cpu: u32, prescaler: u32) -> u32 {
    (u16::MAX as u64 * 1_000_000 / (f_cpu as u64 / prescaler as u64)) as u32
}

// Every protocol deadline must fit the compare range of the reference
// configuration (16 MHz, prescale 1024), the longest being the SRQ tick.
const _: () = {
    let _ = timer_counts(16_000_000, 1024, crate::consts::BREAK_TIMEOUT_US);
    let _ = timer_counts(16_000_000, 1024, crate::consts::POST_SRQ_FAILSAFE_US);
    let _ = timer_counts(16_000_000, 1024, crate::consts::SRQ_TICK_US);
};
