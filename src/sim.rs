//! Host-side doubles for the hardware seams.
//!
//! [`SimLine`] and [`SimTimer`] implement the line and timer traits over
//! plain state so the protocol driver can be driven deterministically from
//! tests (or any host program). They record every control-surface change
//! the driver makes, which is how the tests assert the interrupt-enable
//! invariants. [`NullPin`] stands in for an absent transmit-enable gate.

use embedded_hal::digital::{ErrorType, OutputPin};

use crate::line::{CharErrors, Level, SdiLine};
use crate::timer::{DeadlineTimer, Micros};

/// In-memory double of the half-duplex line.
///
/// A test harness sets [`level`](SimLine::level) and
/// [`rx_char`](SimLine::rx_char) before delivering the matching driver
/// event, and collects transmitted bytes through
/// [`take_tx`](SimLine::take_tx).
#[derive(Debug)]
pub struct SimLine {
    /// Current line level.
    pub level: Level,
    /// Receive path enabled.
    pub rx_on: bool,
    /// Receive-complete interrupt enabled.
    pub rx_int_on: bool,
    /// Transmitter enabled.
    pub tx_on: bool,
    /// Edge-change interrupt enabled.
    pub edge_int_on: bool,
    /// The output is being held at mark without an active transmitter.
    pub mark_driven: bool,
    /// Latched received character and its error flags.
    pub rx_char: Option<(u8, CharErrors)>,
    pending_tx: Option<u8>,
}

impl Default for SimLine {
    fn default() -> Self {
        SimLine {
            level: Level::High,
            rx_on: false,
            rx_int_on: false,
            tx_on: false,
            edge_int_on: false,
            mark_driven: false,
            rx_char: None,
            pending_tx: None,
        }
    }
}

impl SimLine {
    /// A line idling at mark.
    pub fn new() -> Self {
        SimLine::default()
    }

    /// Takes the byte most recently written by the driver.
    pub fn take_tx(&mut self) -> Option<u8> {
        self.pending_tx.take()
    }
}

impl SdiLine for SimLine {
    fn rx_enable(&mut self, on: bool) {
        self.rx_on = on;
        if !on {
            self.rx_char = None;
        }
    }

    fn rx_int_enable(&mut self, on: bool) {
        self.rx_int_on = on;
    }

    fn tx_enable(&mut self, on: bool) {
        self.tx_on = on;
    }

    fn drive_mark(&mut self) {
        self.mark_driven = true;
        self.level = Level::High;
    }

    fn edge_int_enable(&mut self, on: bool) {
        self.edge_int_on = on;
    }

    fn edge_int_clear(&mut self) {}

    fn read(&mut self) -> (u8, CharErrors) {
        self.rx_char.take().unwrap_or((0, CharErrors::NONE))
    }

    fn write(&mut self, byte: u8) {
        self.mark_driven = false;
        self.pending_tx = Some(byte);
    }

    fn level(&self) -> Level {
        self.level
    }

    fn drain(&mut self) {
        self.rx_char = None;
    }
}

/// In-memory double of the compare-deadline timer.
///
/// A harness advances it with [`tick`](SimTimer::tick) and checks
/// [`remaining`](SimTimer::remaining) to decide when to deliver the
/// deadline event.
#[derive(Debug, Default)]
pub struct SimTimer {
    /// Counter running.
    pub running: bool,
    /// Time since the last arm.
    pub elapsed_us: Micros,
    /// Programmed compare deadline.
    pub deadline: Option<Micros>,
}

impl SimTimer {
    /// A stopped timer.
    pub fn new() -> Self {
        SimTimer::default()
    }

    /// Advances the counter by `dt` if it is running.
    pub fn tick(&mut self, dt: Micros) {
        if self.running {
            self.elapsed_us += dt;
        }
    }

    /// Time until the programmed deadline fires, if one is armed.
    pub fn remaining(&self) -> Option<Micros> {
        if !self.running {
            return None;
        }
        self.deadline.map(|d| d.saturating_sub(self.elapsed_us))
    }
}

impl DeadlineTimer for SimTimer {
    fn arm(&mut self, deadline: Micros) {
        self.elapsed_us = 0;
        self.deadline = Some(deadline);
        self.running = true;
    }

    fn stop(&mut self) {
        self.running = false;
        self.deadline = None;
    }

    fn elapsed(&self) -> Micros {
        self.elapsed_us
    }
}

/// Stand-in for an absent transmit-enable gate pin.
#[derive(Debug, Default)]
pub struct NullPin;

impl ErrorType for NullPin {
    type Error = core::convert::Infallible;
}

impl OutputPin for NullPin {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}
