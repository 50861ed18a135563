//! Interrupt-context glue for a global driver instance.
//!
//! The four event methods of [`Sdi12Driver`] must never pre-empt each other.
//! On a single-core target the canonical arrangement is one `static` driver
//! cell guarded by a `critical_section::Mutex`, with each interrupt handler
//! calling the matching dispatch helper below. The main loop uses the same
//! helpers for the parser pass and the wireless data handoff, so every
//! access is serialized through the same critical section.

use core::cell::RefCell;
use core::convert::Infallible;

use critical_section::Mutex;
use embedded_hal::delay::DelayNs;
use embedded_hal::digital::OutputPin;

use crate::line::SdiLine;
use crate::protocol::{DataMsg, Sdi12Driver};
use crate::timer::DeadlineTimer;

/// The shared driver cell type.
pub type SharedBridge<L, T, EN> = Mutex<RefCell<Option<Sdi12Driver<L, T, EN>>>>;

/// Initializer for the global driver cell.
///
/// ```ignore
/// static BRIDGE: SharedBridge<Line, Timer, Gate> = shared_bridge_init();
/// ```
pub const fn shared_bridge_init<L, T, EN>() -> SharedBridge<L, T, EN>
where
    L: SdiLine,
    T: DeadlineTimer,
    EN: OutputPin,
{
    Mutex::new(RefCell::new(None))
}

/// Installs a constructed driver into the global cell.
pub fn shared_bridge_setup<L, T, EN>(
    shared: &'static SharedBridge<L, T, EN>,
    driver: Sdi12Driver<L, T, EN>,
) where
    L: SdiLine,
    T: DeadlineTimer,
    EN: OutputPin,
{
    critical_section::with(|cs| {
        shared.borrow(cs).replace(Some(driver));
    });
}

macro_rules! dispatch {
    ($(#[$doc:meta])* $name:ident => $method:ident) => {
        $(#[$doc])*
        pub fn $name<L, T, EN>(shared: &'static SharedBridge<L, T, EN>)
        where
            L: SdiLine,
            T: DeadlineTimer,
            EN: OutputPin,
        {
            critical_section::with(|cs| {
                if let Some(driver) = shared.borrow(cs).borrow_mut().as_mut() {
                    driver.$method();
                }
            });
        }
    };
}

dispatch! {
    /// Call from the line edge-change interrupt.
    shared_on_line_edge => on_line_edge
}
dispatch! {
    /// Call from the receive-complete interrupt.
    shared_on_rx_complete => on_rx_complete
}
dispatch! {
    /// Call from the transmit-complete interrupt.
    shared_on_tx_complete => on_tx_complete
}
dispatch! {
    /// Call from the compare-deadline interrupt.
    shared_on_deadline => on_deadline
}
dispatch! {
    /// Call once per main-loop pass; runs the command parser.
    shared_do_task => do_task
}

/// Takes the pending wireless data request, if any.
pub fn shared_take_data_request<L, T, EN>(shared: &'static SharedBridge<L, T, EN>) -> Option<u8>
where
    L: SdiLine,
    T: DeadlineTimer,
    EN: OutputPin,
{
    critical_section::with(|cs| {
        shared
            .borrow(cs)
            .borrow_mut()
            .as_mut()
            .and_then(|driver| driver.take_data_request())
    })
}

/// Hands a prepared data message to the protocol core. Returns `false` when
/// the driver is absent or the measurement is no longer live.
pub fn shared_supply_data<L, T, EN>(shared: &'static SharedBridge<L, T, EN>, msg: DataMsg) -> bool
where
    L: SdiLine,
    T: DeadlineTimer,
    EN: OutputPin,
{
    critical_section::with(|cs| {
        shared
            .borrow(cs)
            .borrow_mut()
            .as_mut()
            .map(|driver| driver.supply_data(msg))
            .unwrap_or(false)
    })
}

/// Blocks until the bus transaction in flight (if any) completes.
///
/// Polls under the critical section so the interrupt side keeps running
/// between probes.
pub fn shared_block_until_idle<L, T, EN, D>(shared: &'static SharedBridge<L, T, EN>, delay: &mut D)
where
    L: SdiLine,
    T: DeadlineTimer,
    EN: OutputPin,
    D: DelayNs,
{
    loop {
        let idle: Result<(), nb::Error<Infallible>> = critical_section::with(|cs| {
            shared
                .borrow(cs)
                .borrow()
                .as_ref()
                .map_or(Ok(()), |driver| driver.wait_idle())
        });
        if idle.is_ok() {
            return;
        }
        delay.delay_us(500);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{NullPin, SimLine, SimTimer};
    use embedded_hal_mock::eh1::delay::NoopDelay;

    static BRIDGE: SharedBridge<SimLine, SimTimer, NullPin> = shared_bridge_init();

    #[test]
    fn shared_cell_round_trip() {
        let driver = Sdi12Driver::new(SimLine::new(), SimTimer::new(), None, None, 1);
        shared_bridge_setup(&BRIDGE, driver);

        // nothing pending on a fresh driver
        assert_eq!(shared_take_data_request(&BRIDGE), None);
        assert!(!shared_supply_data(&BRIDGE, DataMsg::new()));

        shared_do_task(&BRIDGE);
        let mut delay = NoopDelay::new();
        shared_block_until_idle(&BRIDGE, &mut delay);
    }
}
