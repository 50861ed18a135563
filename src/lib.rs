//! # sdi12-bridge
//!
//! A portable, no_std driver for the slave side of an SDI-12 bus, bridging a
//! wired data logger to a small network of radio-attached soil-moisture nodes.
//!
//! The data logger issues standard SDI-12 commands over a single half-duplex
//! 1200-baud 7E1 line. This crate answers them on the SDI-12 timing schedule,
//! signals the wireless side when measurement data is wanted, and returns the
//! prepared values inside the SDI-12 response protocol (service request
//! included).
//!
//! The protocol engine is a single state machine fed by four interrupt-shaped
//! event entry points:
//! - a line edge change (break / mark detection),
//! - a character receive complete,
//! - a character transmit complete,
//! - a compare-timer deadline.
//!
//! Hardware is reached through two small traits ([`line::SdiLine`] for the
//! half-duplex line and [`timer::DeadlineTimer`] for the single compare
//! deadline), an optional `embedded-hal` [`OutputPin`] for the external
//! transmit-enable gate IC, and a [`wireless::Radio`] command trait for the
//! radio modem. Everything in between is plain `no_std` Rust with `heapless`
//! buffers.
//!
//! [`OutputPin`]: embedded_hal::digital::OutputPin
//!
//! ## Crate features
//! | Feature | Description |
//! |---------|-------------|
//! | `isr` (default) | Global driver singleton guarded by `critical-section`, plus one dispatch helper per interrupt source |
//! | `std`   | Host-side builds (tests enable this implicitly) |
//! | `defmt` | `defmt::Format` derives and deferred-format diagnostics |
//! | `log`   | `log`-based diagnostics |
//!
//! ## Usage sketch
//!
//! ```ignore
//! // interrupt handlers
//! #[interrupt] fn PCINT3()       { isr::shared_on_line_edge(&BRIDGE); }
//! #[interrupt] fn USART0_RX()    { isr::shared_on_rx_complete(&BRIDGE); }
//! #[interrupt] fn USART0_TX()    { isr::shared_on_tx_complete(&BRIDGE); }
//! #[interrupt] fn TIMER1_COMPA() { isr::shared_on_deadline(&BRIDGE); }
//!
//! // main loop
//! loop {
//!     isr::shared_do_task(&BRIDGE);
//!     if let Some(addr) = isr::shared_take_data_request(&BRIDGE) {
//!         let report = session.registry().prepare_report(addr);
//!         isr::shared_supply_data(&BRIDGE, report);
//!     }
//!     session.poll(now_ms(), &mut radio)?;
//! }
//! ```
//!
//! The main loop never blocks; every wait in the protocol is a programmed
//! deadline, and every failure path silently returns the bus to idle (SDI-12
//! has no failure channel).

#![deny(
    bad_style,
    improper_ctypes,
    non_shorthand_field_patterns,
    no_mangle_generic_items,
    overflowing_literals,
    path_statements,
    patterns_in_fns_without_body,
    unconditional_recursion,
    while_true
)]
#![warn(missing_docs, missing_debug_implementations, unused_qualifications)]
#![cfg_attr(not(any(test, feature = "std")), no_std)]

pub use critical_section;
pub use heapless;

pub mod consts;
pub mod crc;
pub mod line;
pub mod nodes;
pub mod protocol;
pub mod sim;
pub mod timer;
pub mod wireless;

mod parser;

#[cfg(feature = "isr")]
pub mod isr;
#[cfg(feature = "isr")]
mod macros;

pub use protocol::{DataMsg, Flags, Sdi12Driver, State};

// Diagnostics forwarded to whichever logging backend is enabled. Only plain
// `{}` placeholders are used so the same call sites format under both.
#[cfg(feature = "defmt")]
macro_rules! diag {
    ($($arg:tt)*) => {
        defmt::debug!($($arg)*)
    };
}
#[cfg(all(not(feature = "defmt"), feature = "log"))]
macro_rules! diag {
    ($($arg:tt)*) => {
        log::debug!($($arg)*)
    };
}
#[cfg(not(any(feature = "defmt", feature = "log")))]
macro_rules! diag {
    ($($arg:tt)*) => {{}};
}
pub(crate) use diag;
