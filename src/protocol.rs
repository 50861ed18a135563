//! The SDI-12 line-protocol state machine.
//!
//! One [`Sdi12Driver`] instance owns the whole slave-side conversation with
//! the data logger: break and mark validation, address filtering, command
//! buffering, the marked response delay, the service-request window, and the
//! post-SRQ `aD0!` acceptance paths (with or without a fresh break).
//!
//! Four event entry points drive it, one per interrupt source:
//! [`on_line_edge`](Sdi12Driver::on_line_edge),
//! [`on_rx_complete`](Sdi12Driver::on_rx_complete),
//! [`on_tx_complete`](Sdi12Driver::on_tx_complete) and
//! [`on_deadline`](Sdi12Driver::on_deadline). The main loop calls
//! [`do_task`](Sdi12Driver::do_task), which runs the command parser inside
//! the response-mark window, and moves wireless data in and out through
//! [`take_data_request`](Sdi12Driver::take_data_request) /
//! [`supply_data`](Sdi12Driver::supply_data).
//!
//! Every transition reads and re-arms the timer together with the state
//! write; on hardware this holds because transitions happen inside interrupt
//! handlers that are not re-entered. No failure crosses this boundary: a
//! timeout, a malformed command or a corrupted character simply returns the
//! bus to idle, which is the behaviour SDI-12 requires of a non-addressed
//! device.

use core::convert::Infallible;

use embedded_hal::digital::OutputPin;
use heapless::Vec;

use crate::consts::{
    BREAK_MIN_US, BREAK_RETEST_US, BREAK_TIMEOUT_US, DATA_MSG_CAP, DATA_SLACK, DCHAR_FAILSAFE_US,
    INTER_CHAR_US, MARK_MIN_US, MAX_NODES, MEASURE_WAIT_MAX, MEASURE_WAIT_MIN, NO_REQUEST,
    POST_SRQ_FAILSAFE_US, POST_SRQ_WINDOW_US, RESPONSE_MARK_US, RX_BUF_LEN, SRQ_TICK_US,
    TX_BUF_LEN, WAKE_TIMEOUT_US,
};
use crate::crc;
use crate::line::{Level, SdiLine};
use crate::parser::{self, ParseInput, Reply};
use crate::timer::DeadlineTimer;

/// Protocol states. The flow follows the sensor-side flow chart of the
/// SDI-12 v1.3 specification, extended with the service-request and data
/// command paths.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum State {
    /// Waiting for a falling edge that may start a break. Timer off,
    /// receiver off, edge detect on.
    Idle,
    /// Inside a suspected break, waiting for the rising edge that ends it.
    TstBrk,
    /// Valid break seen; waiting out the post-break mark.
    TstMrk,
    /// Break and mark validated; waiting for the first command character.
    WaitAct,
    /// Collecting command characters up to the `!` terminator.
    WaitChr,
    /// Command received; holding mark ahead of the response while the parser
    /// runs in the background loop.
    SndMrk,
    /// Transmitting the response, one character per transmit-complete.
    SndResp,
    /// Measurement acknowledged; waiting for wireless data, a timeout, or an
    /// abort break.
    WaitSrq,
    /// Transmitting the unsolicited service request.
    SendSrq,
    /// Service request sent; within the window where the host may answer
    /// with or without a fresh break.
    WaitDBrk,
    /// The no-break window expired; a full break must now precede the data
    /// command.
    WaitDBrk2,
    /// A transition arrived inside the no-break window; the next edge
    /// classifies it as character, fault, or break.
    DTst,
    /// Leading edge of a post-SRQ break; testing its duration.
    DBrk,
    /// First character of a no-break data command is arriving.
    DChr,
    /// A falling edge during the SRQ wait; testing for an abort break.
    ABrk,
}

/// Transaction flags shared between the interrupt side and the parser.
///
/// `RX_CMD` is raised by the receive path and cleared by the parser; the
/// command-context bits record which measurement conversation is
/// outstanding and survive a fresh break so follow-on data commands can be
/// matched against it.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Copy, Clone, Default, PartialEq, Eq, Debug)]
pub struct Flags(u8);

impl Flags {
    /// A complete command frame is in the receive buffer.
    pub const RX_CMD: u8 = 1 << 0;
    /// The parser accepted the command and a response is staged.
    pub const PROC_CMD: u8 = 1 << 1;
    /// The parser rejected the command; stay silent.
    pub const PROC_ERR: u8 = 1 << 2;
    /// The outstanding command requested a CRC on its data.
    pub const CRC_REQ: u8 = 1 << 3;
    /// An M-variant command is outstanding.
    pub const CMD_M: u8 = 1 << 4;
    /// A V command is outstanding.
    pub const CMD_V: u8 = 1 << 5;
    /// A C-variant command is outstanding.
    pub const CMD_C: u8 = 1 << 6;
    /// The measurement was aborted by a break.
    pub const ABORT: u8 = 1 << 7;

    /// Any of the measurement-context command bits.
    pub const CMD_ANY: u8 = Self::CMD_M | Self::CMD_V | Self::CMD_C;

    pub(crate) const TRANSIENT: u8 =
        Self::RX_CMD | Self::PROC_CMD | Self::PROC_ERR | Self::ABORT;

    /// True if any of `bits` is set.
    pub fn has(self, bits: u8) -> bool {
        self.0 & bits != 0
    }

    /// The raw bit set.
    pub fn bits(self) -> u8 {
        self.0
    }

    /// True when no flag at all is set.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub(crate) fn set(&mut self, bits: u8) {
        self.0 |= bits;
    }

    pub(crate) fn clear(&mut self, bits: u8) {
        self.0 &= !bits;
    }

    pub(crate) fn clear_all(&mut self) {
        self.0 = 0;
    }
}

/// Follow-up bookkeeping for an outstanding measurement: the low nibble
/// holds the `n` of `aMn!`/`aDn!` (0 when absent), the upper bits record
/// which follow-up kind is in progress.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Copy, Clone, Default, PartialEq, Eq, Debug)]
pub struct RxMeta(u8);

impl RxMeta {
    const D_SEEN: u8 = 1 << 4;
    #[allow(dead_code)] // continuous (R) commands are recognized but stubbed
    const R_SEEN: u8 = 1 << 5;

    /// The stored data-group index.
    pub fn index(self) -> u8 {
        self.0 & 0x0F
    }

    /// True once a data command for this measurement has been accepted.
    pub fn d_seen(self) -> bool {
        self.0 & Self::D_SEEN != 0
    }

    pub(crate) fn set_index(&mut self, n: u8) {
        self.0 = (self.0 & 0xF0) | (n & 0x0F);
    }

    pub(crate) fn mark_d(&mut self) {
        self.0 |= Self::D_SEEN;
    }

    pub(crate) fn clear(&mut self) {
        self.0 = 0;
    }
}

/// One-slot mailbox payload produced by the wireless side and consumed by
/// the data command path.
///
/// Byte 0 is a placeholder the protocol core overwrites with the responding
/// address; the value characters follow; at least [`DATA_SLACK`] zero bytes
/// of tail room are kept free for the CRC characters, `<CR><LF>` and the
/// string terminator.
#[derive(Clone, Debug)]
pub struct DataMsg {
    buf: [u8; DATA_MSG_CAP],
    len: usize,
}

impl Default for DataMsg {
    fn default() -> Self {
        Self::new()
    }
}

impl DataMsg {
    /// An empty message holding only the address placeholder.
    pub fn new() -> Self {
        DataMsg {
            buf: [0; DATA_MSG_CAP],
            len: 1,
        }
    }

    /// Appends one value character. Bytes that would eat into the reserved
    /// tail slack are dropped.
    pub fn push_byte(&mut self, b: u8) {
        if self.len < DATA_MSG_CAP - DATA_SLACK {
            self.buf[self.len] = b;
            self.len += 1;
        }
    }

    /// Appends a decimal rendering of `v`.
    pub fn push_u16(&mut self, v: u16) {
        let mut digits = [0u8; 5];
        let mut n = 0;
        let mut v = v;
        loop {
            digits[n] = b'0' + (v % 10) as u8;
            v /= 10;
            n += 1;
            if v == 0 {
                break;
            }
        }
        while n > 0 {
            n -= 1;
            self.push_byte(digits[n]);
        }
    }

    /// Placeholder plus value characters pushed so far.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    fn byte_at(&self, i: usize) -> u8 {
        if i < DATA_MSG_CAP {
            self.buf[i]
        } else {
            0
        }
    }

    /// Stamps the responding address and terminates the frame, computing the
    /// CRC over the address and value characters when requested. Idempotent:
    /// a retried data command re-finalizes in place.
    fn finalize(&mut self, addr: u8, with_crc: bool) {
        self.buf[0] = addr;
        let mut end = self.len;
        if with_crc {
            for c in crc::encode_ascii(crc::crc16_arc(&self.buf[..self.len])) {
                self.buf[end] = c;
                end += 1;
            }
        }
        self.buf[end] = b'\r';
        self.buf[end + 1] = b'\n';
        self.buf[end + 2] = 0;
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
enum SendCursor {
    Idle,
    /// Position inside the local transmit buffer.
    Local(usize),
    /// Position inside the wireless data message.
    Data(usize),
}

/// Maps an ASCII address character onto the numeric address space:
/// `'0'..'9'` to 0..9, `'A'..'Z'` to 10..35, `'a'..'z'` to 36..61.
pub fn ascii_to_numeric(ch: u8) -> Option<u8> {
    match ch {
        b'0'..=b'9' => Some(ch - b'0'),
        b'A'..=b'Z' => Some(ch - b'A' + 10),
        b'a'..=b'z' => Some(ch - b'a' + 36),
        _ => None,
    }
}

/// Inverse of [`ascii_to_numeric`].
pub fn numeric_to_ascii(n: u8) -> Option<u8> {
    match n {
        0..=9 => Some(b'0' + n),
        10..=35 => Some(b'A' + n - 10),
        36..=61 => Some(b'a' + n - 36),
        _ => None,
    }
}

/// The slave-side SDI-12 protocol driver.
///
/// ## Type parameters
/// - `L`: the half-duplex line ([`SdiLine`])
/// - `T`: the compare-deadline timer ([`DeadlineTimer`])
/// - `EN`: the external transmit-enable gate IC, if the board has one
///   ([`embedded_hal::digital::OutputPin`], optionally inverted)
///
/// Only one instance should drive a given line. All four event methods must
/// be called from contexts that cannot pre-empt each other (the `isr`
/// feature provides `critical-section` wrappers that guarantee this).
#[derive(Debug)]
pub struct Sdi12Driver<L, T, EN>
where
    L: SdiLine,
    T: DeadlineTimer,
    EN: OutputPin,
{
    /// The line control surface.
    pub line: L,
    /// The deadline timer.
    pub timer: T,
    tx_gate: Option<EN>,
    tx_gate_inverted: bool,
    state: State,
    flags: Flags,
    rx_meta: RxMeta,
    rx_buf: [u8; RX_BUF_LEN],
    rx_idx: usize,
    tx_buf: [u8; TX_BUF_LEN],
    send: SendCursor,
    rx_addr: u8,
    num_addr: u8,
    data_slot: Option<DataMsg>,
    srq_ticks: u8,
    query_cursor: u8,
    msg_signal: u8,
    measure_wait: u8,
    addrs: Vec<u8, MAX_NODES>,
    /// Completed transactions (diagnostic).
    pub cmd_good: u16,
    /// Commands rejected by the parser (diagnostic).
    pub cmd_errors: u16,
}

impl<L, T, EN> Sdi12Driver<L, T, EN>
where
    L: SdiLine,
    T: DeadlineTimer,
    EN: OutputPin,
{
    /// Creates a driver and quiesces the line: receiver off, transmitter
    /// off, gate disabled, edge detect armed.
    ///
    /// `measure_wait` is the seconds figure reported in measurement
    /// responses and the length of the SRQ window; it is clamped to the
    /// supported range.
    pub fn new(
        line: L,
        timer: T,
        tx_gate: Option<EN>,
        tx_gate_inverted: Option<bool>,
        measure_wait: u8,
    ) -> Self {
        let mut drv = Sdi12Driver {
            line,
            timer,
            tx_gate,
            tx_gate_inverted: tx_gate_inverted.unwrap_or(false),
            state: State::Idle,
            flags: Flags::default(),
            rx_meta: RxMeta::default(),
            rx_buf: [0; RX_BUF_LEN],
            rx_idx: 0,
            tx_buf: [0; TX_BUF_LEN],
            send: SendCursor::Idle,
            rx_addr: 0,
            num_addr: 0,
            data_slot: None,
            srq_ticks: 0,
            query_cursor: 0,
            msg_signal: NO_REQUEST,
            measure_wait: measure_wait.clamp(MEASURE_WAIT_MIN, MEASURE_WAIT_MAX),
            addrs: Vec::new(),
            cmd_good: 0,
            cmd_errors: 0,
        };
        drv.enable();
        drv
    }

    /// Replaces the set of addresses this bridge answers for (numeric,
    /// 0..=61). Entries beyond the node limit are dropped.
    pub fn set_addresses(&mut self, ids: &[u8]) {
        self.addrs.clear();
        for &id in ids.iter().take(MAX_NODES) {
            if numeric_to_ascii(id).is_some() {
                let _ = self.addrs.push(id);
            }
        }
    }

    /// Current protocol state.
    pub fn state(&self) -> State {
        self.state
    }

    /// Current transaction flags.
    pub fn flags(&self) -> Flags {
        self.flags
    }

    /// Access the transmit-enable gate pin, if one is fitted.
    pub fn tx_gate_mut(&mut self) -> Option<&mut EN> {
        self.tx_gate.as_mut()
    }

    /// Arms the interface: everything quiet, edge detect on, state idle.
    pub fn enable(&mut self) {
        self.timer.stop();
        self.line.rx_enable(false);
        self.line.rx_int_enable(true);
        self.line.tx_enable(false);
        self.gate_enable(false);
        self.line.drive_mark();
        self.line.edge_int_clear();
        self.line.edge_int_enable(true);
        self.reset_transaction();
        self.state = State::Idle;
    }

    /// Quiesces the interface entirely; [`enable`](Sdi12Driver::enable)
    /// restores it.
    pub fn disable(&mut self) {
        self.timer.stop();
        self.line.rx_enable(false);
        self.line.rx_int_enable(false);
        self.line.tx_enable(false);
        self.line.edge_int_enable(false);
        self.gate_enable(false);
        self.reset_transaction();
        self.state = State::Idle;
    }

    /// Takes the pending wireless data request, if any, resetting the signal.
    ///
    /// A non-sentinel value is the numeric address the wireless side should
    /// produce data for.
    pub fn take_data_request(&mut self) -> Option<u8> {
        if self.msg_signal == NO_REQUEST {
            None
        } else {
            let addr = self.msg_signal;
            self.msg_signal = NO_REQUEST;
            Some(addr)
        }
    }

    /// Hands a prepared data message to the protocol core.
    ///
    /// Accepted only while the measurement transaction that asked for it is
    /// still live; data arriving after the SRQ window (or an abort) is
    /// dropped, and `false` is returned.
    pub fn supply_data(&mut self, msg: DataMsg) -> bool {
        let live = self.flags.has(Flags::CMD_M)
            && matches!(self.state, State::SndMrk | State::SndResp | State::WaitSrq);
        if live {
            self.data_slot = Some(msg);
        }
        live
    }

    /// Ready check for callers that must not talk over a live transaction.
    pub fn wait_idle(&self) -> nb::Result<(), Infallible> {
        if self.state == State::Idle {
            Ok(())
        } else {
            Err(nb::Error::WouldBlock)
        }
    }

    // ---- main-loop side ----------------------------------------------------

    /// Runs the background portion of the protocol: the command parser (and
    /// abort handling) inside the response-mark window.
    ///
    /// Must be called regularly from the main loop. The parser's flag
    /// updates and the staged response are applied in one step so the
    /// interrupt side never observes a half-updated parse.
    pub fn do_task(&mut self) {
        if !self.flags.has(Flags::RX_CMD) {
            return;
        }
        self.flags.clear(Flags::RX_CMD);

        if self.flags.has(Flags::ABORT) {
            // the measurement is gone; answer with the bare ack frame
            let addr = self.rx_addr;
            self.load_local(&[addr, b'\r', b'\n']);
            return;
        }

        let out = parser::parse(ParseInput {
            frame: &self.rx_buf[..self.rx_idx],
            flags: self.flags,
            rx_meta: self.rx_meta,
            measure_wait: self.measure_wait,
            num_addr: self.num_addr,
            addrs: &self.addrs,
            query_cursor: self.query_cursor,
        });

        self.flags = out.flags;
        self.rx_meta = out.rx_meta;
        self.query_cursor = out.query_cursor;
        if let Some(addr) = out.msg_signal {
            self.msg_signal = addr;
        }
        match out.reply {
            Reply::Silent => self.cmd_errors = self.cmd_errors.wrapping_add(1),
            Reply::Local(bytes) => self.load_local(&bytes),
            Reply::Data { crc } => self.compose_data(crc),
        }
        self.rx_buf = [0; RX_BUF_LEN];
        self.rx_idx = 0;
    }

    // ---- interrupt side ----------------------------------------------------

    /// Edge-change event on the line.
    ///
    /// Reads the elapsed time first: classification of break and mark
    /// durations depends on it.
    pub fn on_line_edge(&mut self) {
        let elapsed = self.timer.elapsed();
        let level = self.line.level();

        match self.state {
            State::Idle => {
                // rising edges are noise while idle
                if level == Level::Low {
                    self.timer.arm(BREAK_TIMEOUT_US);
                    self.state = State::TstBrk;
                }
            }
            State::TstBrk => {
                // the line came back up: was the low long enough?
                if elapsed < BREAK_MIN_US {
                    self.to_idle();
                } else {
                    self.clear_transient();
                    self.timer.arm(MARK_MIN_US);
                    self.state = State::TstMrk;
                }
            }
            State::TstMrk => {
                // an edge before the mark completed; possibly a new break
                self.timer.arm(BREAK_TIMEOUT_US);
                self.state = State::TstBrk;
            }
            State::WaitSrq => {
                if level == Level::Low {
                    self.timer.arm(BREAK_TIMEOUT_US);
                    self.state = State::ABrk;
                }
            }
            State::ABrk => {
                if elapsed < BREAK_MIN_US {
                    self.to_idle();
                } else {
                    // valid abort: drop the measurement, stage the bare ack
                    self.flags.clear(Flags::CMD_ANY | Flags::CRC_REQ);
                    self.rx_meta.clear();
                    self.data_slot = None;
                    self.msg_signal = NO_REQUEST;
                    self.flags.set(Flags::RX_CMD | Flags::ABORT);
                    self.timer.arm(MARK_MIN_US);
                    self.state = State::TstMrk;
                }
            }
            State::WaitDBrk => {
                if level == Level::Low {
                    // break start or the start bit of a no-break data command
                    self.timer.arm(POST_SRQ_FAILSAFE_US);
                    self.state = State::DTst;
                } else {
                    self.line.drain();
                    self.to_idle();
                }
            }
            State::DTst => {
                self.line.drain();
                self.line.rx_int_enable(true);
                if elapsed < MARK_MIN_US {
                    // shorter than one character: a start bit is under way
                    self.line.edge_int_enable(false);
                    self.timer.arm(DCHAR_FAILSAFE_US);
                    self.state = State::DChr;
                } else if elapsed < BREAK_MIN_US {
                    // too long for a character, too short for a break
                    self.to_idle();
                } else {
                    self.clear_transient();
                    self.timer.arm(MARK_MIN_US);
                    self.state = State::TstMrk;
                }
            }
            State::WaitDBrk2 => {
                if level == Level::Low {
                    self.timer.arm(BREAK_TIMEOUT_US);
                    self.state = State::DBrk;
                } else {
                    self.to_idle();
                }
            }
            State::DBrk => {
                if elapsed < BREAK_MIN_US {
                    self.to_idle();
                } else {
                    self.flags.clear(Flags::ABORT);
                    self.timer.arm(MARK_MIN_US);
                    self.state = State::TstMrk;
                }
            }
            _ => {}
        }
    }

    /// Receive-complete event.
    pub fn on_rx_complete(&mut self) {
        // error flags must be captured together with the byte
        let (raw, errs) = self.line.read();
        let ch = raw & 0x7F;

        if errs.any() {
            // a corrupted character usually means the host opened a new
            // break under the receiver
            self.line.rx_enable(false);
            self.line.edge_int_clear();
            self.line.edge_int_enable(true);
            self.clear_transient();
            if errs.framing {
                self.timer.arm(BREAK_RETEST_US);
                self.state = State::TstBrk;
            } else {
                self.timer.arm(MARK_MIN_US);
                self.state = State::TstMrk;
            }
            return;
        }

        match self.state {
            State::WaitAct => self.first_char(ch),
            State::WaitChr => self.next_char(ch),
            State::DChr => {
                // no-break data command: the address must repeat the
                // measurement address ('?' is thereby rejected too)
                if ch == self.rx_addr {
                    self.rx_buf = [0; RX_BUF_LEN];
                    self.rx_buf[0] = ch;
                    self.rx_idx = 1;
                    self.timer.arm(INTER_CHAR_US);
                    self.state = State::WaitChr;
                } else {
                    self.to_idle();
                }
            }
            _ => {}
        }
    }

    /// Transmit-complete event.
    pub fn on_tx_complete(&mut self) {
        match self.state {
            State::SndResp => {
                if self.send_byte_at_cursor() {
                    return;
                }
                // message done; what follows depends on the command
                if self.flags.has(Flags::CMD_M) && !self.rx_meta.d_seen() {
                    self.gate_enable(false);
                    self.line.tx_enable(false);
                    self.line.rx_enable(false);
                    self.srq_ticks = 0;
                    self.timer.arm(SRQ_TICK_US);
                    self.line.edge_int_clear();
                    self.line.edge_int_enable(true);
                    self.state = State::WaitSrq;
                } else if self.rx_meta.d_seen() {
                    self.cmd_good = self.cmd_good.wrapping_add(1);
                    self.to_idle();
                } else {
                    self.cmd_good = self.cmd_good.wrapping_add(1);
                    self.finish_transaction();
                }
            }
            State::SendSrq => {
                if self.send_byte_at_cursor() {
                    return;
                }
                // SRQ out; the host may answer with or without a fresh break
                self.gate_enable(false);
                self.line.tx_enable(false);
                self.line.rx_enable(true);
                self.line.rx_int_enable(false);
                self.timer.arm(POST_SRQ_WINDOW_US);
                self.line.edge_int_clear();
                self.line.edge_int_enable(true);
                self.state = State::WaitDBrk;
            }
            _ => {}
        }
    }

    /// Compare-deadline event.
    pub fn on_deadline(&mut self) {
        match self.state {
            // stuck low: line fault
            State::TstBrk => self.to_idle(),
            State::TstMrk => {
                if self.flags.has(Flags::ABORT) {
                    // the abort reply goes out after the response mark
                    self.begin_response_window();
                } else {
                    self.timer.arm(WAKE_TIMEOUT_US);
                    self.line.rx_enable(true);
                    self.line.rx_int_enable(true);
                    self.line.drain();
                    self.line.edge_int_enable(false);
                    self.state = State::WaitAct;
                }
            }
            State::WaitAct | State::WaitChr => self.to_idle(),
            State::SndMrk => {
                if self.flags.has(Flags::PROC_CMD) && !self.flags.has(Flags::PROC_ERR) {
                    self.timer.stop();
                    self.line.tx_enable(true);
                    if self.send_byte_at_cursor() {
                        self.state = State::SndResp;
                    } else {
                        self.to_idle();
                    }
                } else {
                    // the parser rejected the frame (or produced nothing):
                    // a non-addressed device stays silent
                    self.to_idle();
                }
            }
            State::WaitSrq => self.srq_tick(),
            State::WaitDBrk => {
                // no-break window over; a full break is now required
                self.line.rx_enable(false);
                self.line.drain();
                self.line.rx_int_enable(true);
                self.timer.arm(POST_SRQ_FAILSAFE_US);
                self.state = State::WaitDBrk2;
            }
            State::DTst => {
                self.line.drain();
                self.line.rx_int_enable(true);
                self.to_idle();
            }
            State::WaitDBrk2 | State::ABrk | State::DBrk | State::DChr => self.to_idle(),
            _ => {}
        }
    }

    // ---- internals ---------------------------------------------------------

    fn gate_enable(&mut self, on: bool) {
        let high = on != self.tx_gate_inverted;
        if let Some(ref mut gate) = self.tx_gate {
            if high {
                let _ = gate.set_high();
            } else {
                let _ = gate.set_low();
            }
        }
    }

    fn reset_transaction(&mut self) {
        self.flags.clear_all();
        self.rx_meta.clear();
        self.rx_buf = [0; RX_BUF_LEN];
        self.rx_idx = 0;
        self.send = SendCursor::Idle;
        self.data_slot = None;
        self.msg_signal = NO_REQUEST;
        self.srq_ticks = 0;
    }

    /// Terminal cleanup: every timeout and fault path lands here. The flags
    /// and follow-up bookkeeping are gone, the transmit driver is off, and
    /// the output is released.
    fn to_idle(&mut self) {
        self.timer.stop();
        self.line.rx_enable(false);
        self.line.rx_int_enable(true);
        self.line.tx_enable(false);
        self.gate_enable(false);
        self.line.edge_int_clear();
        self.line.edge_int_enable(true);
        self.reset_transaction();
        self.state = State::Idle;
    }

    /// Normal end of a transmission. The concurrent-measurement context (if
    /// any) survives so a later data command can collect against it.
    fn finish_transaction(&mut self) {
        let keep_c = self.flags.has(Flags::CMD_C);
        let keep_crc = keep_c && self.flags.has(Flags::CRC_REQ);
        let keep_index = self.rx_meta.index();
        self.to_idle();
        if keep_c {
            self.flags.set(Flags::CMD_C);
            if keep_crc {
                self.flags.set(Flags::CRC_REQ);
            }
            self.rx_meta.set_index(keep_index);
        }
    }

    /// A fresh break wipes the in-flight transaction but not the outstanding
    /// command context; the follow-on address filter guards the latter.
    fn clear_transient(&mut self) {
        self.flags.clear(Flags::TRANSIENT);
        self.send = SendCursor::Idle;
    }

    fn first_char(&mut self, ch: u8) {
        if self.flags.has(Flags::CMD_ANY) {
            // an addressed conversation is outstanding: only its address may
            // continue it, and '?' does not qualify
            if ch != self.rx_addr {
                self.to_idle();
                return;
            }
        } else if ch == b'?' {
            // query; the address fields keep their previous values
        } else {
            match ascii_to_numeric(ch) {
                Some(n) if self.addrs.contains(&n) => {
                    self.rx_addr = ch;
                    self.num_addr = n;
                }
                _ => {
                    self.to_idle();
                    return;
                }
            }
        }
        self.rx_buf = [0; RX_BUF_LEN];
        self.rx_buf[0] = ch;
        self.rx_idx = 1;
        self.timer.arm(INTER_CHAR_US);
        self.state = State::WaitChr;
    }

    fn next_char(&mut self, ch: u8) {
        if ch == b'!' {
            if self.rx_idx >= RX_BUF_LEN {
                self.to_idle();
                return;
            }
            self.rx_buf[self.rx_idx] = ch;
            self.rx_idx += 1;
            self.flags.set(Flags::RX_CMD);
            self.begin_response_window();
        } else {
            if self.rx_idx >= RX_BUF_LEN - 1 {
                // overlong command; a non-addressed device stays silent
                self.to_idle();
                return;
            }
            self.rx_buf[self.rx_idx] = ch;
            self.rx_idx += 1;
            self.timer.arm(INTER_CHAR_US);
        }
    }

    /// Holds the line at mark for the response delay; the parser must finish
    /// inside this window (its cost is bounded, so it does).
    fn begin_response_window(&mut self) {
        self.line.rx_enable(false);
        self.line.edge_int_enable(false);
        self.line.drive_mark();
        self.gate_enable(true);
        self.timer.arm(RESPONSE_MARK_US);
        self.state = State::SndMrk;
    }

    fn srq_tick(&mut self) {
        self.srq_ticks += 1;
        if self.srq_ticks < 10 * self.measure_wait {
            if self.data_slot.is_some() {
                // data ready: send the unsolicited service request
                self.timer.stop();
                self.line.edge_int_enable(false);
                self.line.tx_enable(true);
                self.gate_enable(true);
                self.tx_buf = [0; TX_BUF_LEN];
                self.tx_buf[0] = self.rx_addr;
                self.tx_buf[1] = b'\r';
                self.tx_buf[2] = b'\n';
                self.send = SendCursor::Local(0);
                if self.send_byte_at_cursor() {
                    self.state = State::SendSrq;
                } else {
                    self.to_idle();
                }
            } else {
                self.timer.arm(SRQ_TICK_US);
            }
        } else {
            // window expired; late data will be discarded
            self.to_idle();
        }
    }

    fn load_local(&mut self, bytes: &[u8]) {
        self.tx_buf = [0; TX_BUF_LEN];
        let n = bytes.len().min(TX_BUF_LEN - 1);
        self.tx_buf[..n].copy_from_slice(&bytes[..n]);
        self.send = SendCursor::Local(0);
        self.flags.set(Flags::PROC_CMD);
    }

    /// Stages the data-command response: the wireless message with the
    /// address stamped in (and CRC appended when requested), or the
    /// data-unavailable frame when nothing was produced.
    fn compose_data(&mut self, with_crc: bool) {
        let addr = self.rx_addr;
        if self.data_slot.is_none() {
            self.load_local(&[addr, b'0', b'0', b'0', b'0', b'\r', b'\n']);
            return;
        }
        if let Some(msg) = self.data_slot.as_mut() {
            msg.finalize(addr, with_crc);
        }
        self.send = SendCursor::Data(0);
        self.flags.set(Flags::PROC_CMD);
    }

    /// Writes the byte under the send cursor, advancing it. Returns `false`
    /// on the zero terminator, which ends the message.
    fn send_byte_at_cursor(&mut self) -> bool {
        let b = match self.send {
            SendCursor::Local(i) => {
                if i < TX_BUF_LEN {
                    self.tx_buf[i]
                } else {
                    0
                }
            }
            SendCursor::Data(i) => self.data_slot.as_ref().map_or(0, |m| m.byte_at(i)),
            SendCursor::Idle => 0,
        };
        if b == 0 {
            return false;
        }
        self.line.write(b);
        match self.send {
            SendCursor::Local(ref mut i) | SendCursor::Data(ref mut i) => *i += 1,
            SendCursor::Idle => {}
        }
        true
    }
}
