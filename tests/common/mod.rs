//! Shared bus harness: drives the protocol driver through the simulated
//! line and timer with wall-clock semantics, delivering edge, character and
//! deadline events the way the interrupt hardware would.

#![allow(dead_code)]

use embedded_hal::digital::OutputPin;
use sdi12_bridge::consts::CHAR_US;
use sdi12_bridge::line::{CharErrors, Level};
use sdi12_bridge::sim::{NullPin, SimLine, SimTimer};
use sdi12_bridge::{Sdi12Driver, State};

pub struct BusHarness<EN: OutputPin = NullPin> {
    pub drv: Sdi12Driver<SimLine, SimTimer, EN>,
}

impl BusHarness<NullPin> {
    pub fn new(addrs: &[u8], measure_wait: u8) -> Self {
        let mut drv = Sdi12Driver::new(SimLine::new(), SimTimer::new(), None, None, measure_wait);
        drv.set_addresses(addrs);
        BusHarness { drv }
    }
}

impl<EN: OutputPin> BusHarness<EN> {
    pub fn with_driver(drv: Sdi12Driver<SimLine, SimTimer, EN>) -> Self {
        BusHarness { drv }
    }

    /// Advances wall-clock time, delivering compare deadlines as they fall
    /// due. Re-armed deadlines (the SRQ tick) fire repeatedly.
    pub fn advance(&mut self, mut dt: u32) {
        while dt > 0 {
            match self.drv.timer.remaining() {
                Some(remaining) if remaining <= dt => {
                    self.drv.timer.tick(remaining);
                    dt -= remaining;
                    self.drv.on_deadline();
                }
                _ => {
                    self.drv.timer.tick(dt);
                    dt = 0;
                }
            }
        }
    }

    /// A line transition `after_us` from the previous event. The edge
    /// interrupt only fires if the driver has it enabled.
    pub fn edge(&mut self, level: Level, after_us: u32) {
        self.advance(after_us);
        self.drv.line.level = level;
        if self.drv.line.edge_int_on {
            self.drv.on_line_edge();
        }
    }

    /// A break of `low_us` followed by `mark_us` of marking.
    pub fn wake(&mut self, low_us: u32, mark_us: u32) {
        self.edge(Level::Low, 100);
        self.edge(Level::High, low_us);
        self.advance(mark_us);
    }

    /// One received character, delivered only if the receiver and its
    /// interrupt are enabled (as the UART would).
    pub fn send_char(&mut self, c: u8) {
        self.advance(CHAR_US);
        if self.drv.line.rx_on && self.drv.line.rx_int_on {
            self.drv.line.rx_char = Some((c, CharErrors::NONE));
            self.drv.on_rx_complete();
        }
    }

    /// A received character carrying error flags.
    pub fn send_bad_char(&mut self, c: u8, errors: CharErrors) {
        self.advance(CHAR_US);
        if self.drv.line.rx_on && self.drv.line.rx_int_on {
            self.drv.line.rx_char = Some((c, errors));
            self.drv.on_rx_complete();
        }
    }

    /// A full command frame followed by the main-loop parser pass.
    pub fn send_cmd(&mut self, cmd: &[u8]) {
        for &c in cmd {
            self.send_char(c);
        }
        self.drv.do_task();
    }

    /// Waits out the response mark (if the driver is holding it) and drains
    /// the transmitted frame.
    pub fn collect_response(&mut self) -> Vec<u8> {
        if self.drv.state() == State::SndMrk {
            if let Some(remaining) = self.drv.timer.remaining() {
                self.advance(remaining);
            }
        }
        self.drain_tx()
    }

    /// Drains transmit-complete events until the driver stops writing.
    pub fn drain_tx(&mut self) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(b) = self.drv.line.take_tx() {
            out.push(b);
            self.advance(CHAR_US);
            self.drv.on_tx_complete();
        }
        out
    }

    /// The address character of a data command arriving inside the post-SRQ
    /// window without a fresh break: start-bit edge, an early data edge,
    /// then the completed character.
    pub fn send_no_break_command(&mut self, cmd: &[u8]) {
        self.edge(Level::Low, 5_000);
        self.edge(Level::High, 800);
        self.advance(CHAR_US - 800);
        if self.drv.line.rx_on && self.drv.line.rx_int_on {
            self.drv.line.rx_char = Some((cmd[0], CharErrors::NONE));
            self.drv.on_rx_complete();
        }
        for &c in &cmd[1..] {
            self.send_char(c);
        }
        self.drv.do_task();
    }
}
