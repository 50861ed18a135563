//! Command classification and reply construction.
//!
//! The parser is a pure function over the buffered frame and the current
//! transaction context. It never touches the driver directly: it returns a
//! record of new flags, new follow-up bookkeeping and the staged reply,
//! which the state machine applies in one step at the mark-to-response
//! transition. That keeps the interrupt side from ever observing a
//! half-finished parse.
//!
//! Classification goes by the number of bytes between the start of the
//! frame and the trailing `!` (address included):
//!
//! | bytes | commands | reply |
//! |-------|----------|-------|
//! | 1 | `a!` | `a<CR><LF>` |
//! | 1 | `?!` | next configured address, round-robin |
//! | 2 | `aI!` | identity string |
//! | 2 | `aM!` `aV!` `aC!` | measurement timing |
//! | 3 | `aMn!` `aMC!` `aCn!` `aCC!` `aDn!` | timing / staged data |
//! | 4 | `aMCn!` `aCCn!` | timing with CRC |
//! | 4 | `aRCn!`, ≥5 `aX…!` | recognized, silently rejected |
//!
//! Silence (no reply at all) is the specified SDI-12 behaviour for anything
//! malformed; there is no error channel on the wire.

use heapless::Vec;

use crate::consts::{IDENT_PAYLOAD, MEASURE_VALUES};
use crate::protocol::{numeric_to_ascii, Flags, RxMeta};

/// Longest local reply: the identity response.
pub(crate) const REPLY_CAP: usize = 28;

pub(crate) type ReplyBuf = Vec<u8, REPLY_CAP>;

/// What the driver should transmit once the response mark elapses.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Reply {
    /// Nothing; return the bus to idle after the window.
    Silent,
    /// A locally generated frame.
    Local(ReplyBuf),
    /// The wireless data message (address stamped in by the driver), with or
    /// without the CRC characters.
    Data { crc: bool },
}

/// Context the parser needs alongside the frame.
pub(crate) struct ParseInput<'a> {
    /// The received frame including the trailing `!`.
    pub frame: &'a [u8],
    pub flags: Flags,
    pub rx_meta: RxMeta,
    pub measure_wait: u8,
    /// Numeric address of the frame currently being answered.
    pub num_addr: u8,
    /// Configured numeric addresses, in query rotation order.
    pub addrs: &'a [u8],
    pub query_cursor: u8,
}

/// The applied result of a parse.
pub(crate) struct Parsed {
    pub flags: Flags,
    pub rx_meta: RxMeta,
    pub reply: Reply,
    /// Numeric address the wireless side should produce data for, if the
    /// command was an M variant.
    pub msg_signal: Option<u8>,
    pub query_cursor: u8,
}

pub(crate) fn parse(input: ParseInput<'_>) -> Parsed {
    let mut out = Parsed {
        flags: input.flags,
        rx_meta: input.rx_meta,
        reply: Reply::Silent,
        msg_signal: None,
        query_cursor: input.query_cursor,
    };
    out.flags.clear(Flags::RX_CMD | Flags::PROC_CMD | Flags::PROC_ERR);

    let frame = input.frame;
    if frame.len() < 2 || frame[frame.len() - 1] != b'!' {
        return reject(out);
    }
    let addr = frame[0];
    let body = &frame[1..frame.len() - 1];

    if addr == b'?' {
        if !body.is_empty() || input.addrs.is_empty() {
            return reject(out);
        }
        // one configured address per query, rotating through the full set
        let id = input.addrs[out.query_cursor as usize % input.addrs.len()];
        out.query_cursor = (out.query_cursor + 1) % input.addrs.len() as u8;
        return match numeric_to_ascii(id) {
            Some(c) => {
                out.reply = Reply::Local(ack_frame(c));
                out
            }
            None => reject(out),
        };
    }

    match body.len() {
        // `a!`: the address alone acknowledges
        0 => {
            out.reply = Reply::Local(ack_frame(addr));
            out
        }

        1 => match body[0] {
            b'I' => {
                // identity replaces any stale single-shot measurement
                out.flags
                    .clear(Flags::CMD_M | Flags::CMD_V | Flags::CRC_REQ);
                out.rx_meta.clear();
                out.reply = Reply::Local(ident_frame(addr));
                out
            }
            b'M' => measurement(out, addr, input, 0, false),
            b'C' => concurrent(out, addr, input, 0, false),
            b'V' => {
                out.flags.set(Flags::CMD_V);
                out.flags.clear(Flags::CMD_M | Flags::CMD_C | Flags::CRC_REQ);
                out.rx_meta.clear();
                out.reply = Reply::Local(verify_frame(addr));
                out
            }
            _ => reject(out),
        },

        2 => match (body[0], body[1]) {
            (b'M', b'C') => measurement(out, addr, input, 0, true),
            (b'M', n @ b'1'..=b'9') => measurement(out, addr, input, n - b'0', false),
            (b'C', b'C') => concurrent(out, addr, input, 0, true),
            (b'C', n @ b'1'..=b'9') => concurrent(out, addr, input, n - b'0', false),
            (b'D', n @ b'0'..=b'9') => data_request(out, n - b'0'),
            // address reassignment is fixed by the node DIP switches;
            // continuous commands are not served
            (b'A', _) | (b'R', _) => reject(out),
            _ => reject(out),
        },

        3 => match (body[0], body[1], body[2]) {
            (b'M', b'C', n @ b'1'..=b'9') => measurement(out, addr, input, n - b'0', true),
            (b'C', b'C', n @ b'1'..=b'9') => concurrent(out, addr, input, n - b'0', true),
            (b'R', b'C', b'0'..=b'9') => reject(out),
            _ => reject(out),
        },

        // extended commands are recognized but not served
        _ => reject(out),
    }
}

fn reject(mut out: Parsed) -> Parsed {
    out.flags.clear_all();
    out.flags.set(Flags::PROC_ERR);
    out.rx_meta.clear();
    out.reply = Reply::Silent;
    out.msg_signal = None;
    out
}

fn measurement(mut out: Parsed, addr: u8, input: ParseInput<'_>, n: u8, crc: bool) -> Parsed {
    out.flags.clear(Flags::CMD_ANY | Flags::CRC_REQ);
    out.flags.set(Flags::CMD_M);
    if crc {
        out.flags.set(Flags::CRC_REQ);
    }
    out.rx_meta.clear();
    out.rx_meta.set_index(n);
    out.reply = Reply::Local(timing_frame(addr, input.measure_wait, false));
    out.msg_signal = Some(input.num_addr);
    out
}

fn concurrent(mut out: Parsed, addr: u8, input: ParseInput<'_>, n: u8, crc: bool) -> Parsed {
    out.flags.clear(Flags::CMD_ANY | Flags::CRC_REQ);
    out.flags.set(Flags::CMD_C);
    if crc {
        out.flags.set(Flags::CRC_REQ);
    }
    out.rx_meta.clear();
    out.rx_meta.set_index(n);
    out.reply = Reply::Local(timing_frame(addr, input.measure_wait, true));
    out
}

fn data_request(mut out: Parsed, n: u8) -> Parsed {
    if out.flags.has(Flags::CMD_ANY) {
        if n == out.rx_meta.index() {
            out.rx_meta.mark_d();
            let crc = out.flags.has(Flags::CRC_REQ);
            out.reply = Reply::Data { crc };
            out
        } else {
            reject(out)
        }
    } else if n == 0 {
        // no measurement outstanding: answer data-unavailable rather than
        // leaving a well-addressed request hanging
        out.rx_meta.mark_d();
        out.reply = Reply::Data { crc: false };
        out
    } else {
        reject(out)
    }
}

fn ack_frame(addr: u8) -> ReplyBuf {
    let mut buf = ReplyBuf::new();
    let _ = buf.extend_from_slice(&[addr, b'\r', b'\n']);
    buf
}

fn ident_frame(addr: u8) -> ReplyBuf {
    let mut buf = ReplyBuf::new();
    let _ = buf.push(addr);
    let _ = buf.extend_from_slice(IDENT_PAYLOAD);
    let _ = buf.extend_from_slice(b"\r\n");
    buf
}

/// `atttn` / `atttnn`: zero-padded wait seconds, then the value count.
fn timing_frame(addr: u8, wait: u8, wide_count: bool) -> ReplyBuf {
    let mut buf = ReplyBuf::new();
    let _ = buf.extend_from_slice(&[addr, b'0', b'0', b'0' + wait]);
    if wide_count {
        let _ = buf.push(b'0');
    }
    let _ = buf.push(b'0' + MEASURE_VALUES);
    let _ = buf.extend_from_slice(b"\r\n");
    buf
}

/// `a0000`: verification completes immediately and yields no values.
fn verify_frame(addr: u8) -> ReplyBuf {
    let mut buf = ReplyBuf::new();
    let _ = buf.extend_from_slice(&[addr, b'0', b'0', b'0', b'0', b'\r', b'\n']);
    buf
}
