/// Declares a `static` driver cell named `SDI12_BRIDGE` for interrupt use.
///
/// # Arguments
/// - `$line`: concrete type of the line driver (implements `SdiLine`)
/// - `$timer`: concrete type of the deadline timer (implements `DeadlineTimer`)
/// - `$gate`: concrete type of the transmit-enable gate pin (implements
///   `OutputPin`)
///
/// # Example
/// ```ignore
/// declare_sdi12_bridge!(Usart0Line, Timer1Compare, GatePin);
/// ```
#[macro_export]
macro_rules! declare_sdi12_bridge {
    ( $line:ty, $timer:ty, $gate:ty ) => {
        pub static SDI12_BRIDGE: $crate::isr::SharedBridge<$line, $timer, $gate> =
            $crate::isr::shared_bridge_init();
    };
}

/// Installs a constructed driver into the cell declared by
/// [`declare_sdi12_bridge!`].
///
/// # Example
/// ```ignore
/// let driver = Sdi12Driver::new(line, timer, Some(gate), None, 1);
/// setup_sdi12_bridge!(driver);
/// ```
#[macro_export]
macro_rules! setup_sdi12_bridge {
    ( $driver:expr ) => {
        $crate::isr::shared_bridge_setup(&SDI12_BRIDGE, $driver)
    };
}

/// Forwards an interrupt to the driver in the `SDI12_BRIDGE` cell.
///
/// The first argument names the event source: `edge`, `rx`, `tx` or
/// `deadline`.
///
/// # Example
/// ```ignore
/// #[interrupt]
/// fn PCINT3() {
///     sdi12_bridge_isr!(edge);
/// }
/// ```
#[macro_export]
macro_rules! sdi12_bridge_isr {
    ( edge ) => {
        $crate::isr::shared_on_line_edge(&SDI12_BRIDGE)
    };
    ( rx ) => {
        $crate::isr::shared_on_rx_complete(&SDI12_BRIDGE)
    };
    ( tx ) => {
        $crate::isr::shared_on_tx_complete(&SDI12_BRIDGE)
    };
    ( deadline ) => {
        $crate::isr::shared_on_deadline(&SDI12_BRIDGE)
    };
}

/// Runs the main-loop portion of the protocol against the `SDI12_BRIDGE`
/// cell: the parser pass, then the wireless data handoff through the
/// supplied closure.
///
/// # Example
/// ```ignore
/// loop {
///     sdi12_bridge_task!(|addr| session.registry().prepare_report(addr));
///     session.poll(now_ms(), &mut radio)?;
/// }
/// ```
#[macro_export]
macro_rules! sdi12_bridge_task {
    ( $prepare:expr ) => {{
        $crate::isr::shared_do_task(&SDI12_BRIDGE);
        if let Some(addr) = $crate::isr::shared_take_data_request(&SDI12_BRIDGE) {
            let msg = $prepare(addr);
            let _ = $crate::isr::shared_supply_data(&SDI12_BRIDGE, msg);
        }
    }};
}
