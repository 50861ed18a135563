//! Wireless session controller.
//!
//! A second, much smaller state machine that runs from the main loop and
//! owns the radio side of the bridge: discover the nodes, set each one up
//! (inputs, logical address, synchronized sleep), then sample every node
//! each time the network wakes. It touches the SDI-12 core only through the
//! data-request signal and the one-slot data mailbox.
//!
//! The radio itself sits behind the [`Radio`] command trait; inbound frames
//! are decoded by the modem layer into [`RadioEvent`]s and handed to
//! [`SessionController::on_event`]. The controller issues at most one
//! command per node per step and gates every step on its acknowledgement,
//! with a reply timeout that charges the node's fault counters and moves on.

use crate::consts::PROBES_PER_NODE;
use crate::diag;
use crate::nodes::{NodeSerial, Registry, SampleLimits};

/// Milliseconds of wall-clock time; wrapping arithmetic.
pub type Millis = u32;

/// Link-level faults the modem layer can report.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum LinkFault {
    /// Frame structure did not parse.
    Malformed,
    /// Frame checksum failed.
    Checksum,
}

/// Decoded inbound radio frames.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum RadioEvent {
    /// A node answered discovery with its serial.
    NodeFound(NodeSerial),
    /// Input and pull-up configuration acknowledged.
    IoConfigured,
    /// A digital/analog sample frame: raw DIP lines plus both ADC channels.
    IoSample {
        /// Raw digital input byte carrying the DIP switch lines.
        dip_raw: u8,
        /// ADC readings, one per probe.
        adc: [u16; PROBES_PER_NODE],
    },
    /// Network-synchronized sleep acknowledged.
    SleepStarted,
    /// Probe power switch acknowledged (same frame for on and off).
    ProbePowerAck,
    /// The network just woke up.
    NetworkAwake,
    /// The network just went to sleep.
    NetworkAsleep,
    /// The frame was unusable.
    Fault(LinkFault),
}

/// Commands the controller issues toward the radio modem.
///
/// Implementations frame these for the actual radio; the controller never
/// sees wire bytes.
pub trait Radio {
    /// Transport error type.
    type Error;

    /// Broadcast a node-discovery request.
    fn node_discover(&mut self) -> Result<(), Self::Error>;
    /// Configure a node's analog/digital inputs and pull-ups.
    fn configure_io(&mut self, node: NodeSerial) -> Result<(), Self::Error>;
    /// Request a digital/analog sample from a node.
    fn sample_io(&mut self, node: NodeSerial) -> Result<(), Self::Error>;
    /// Switch a node's probe supply on or off.
    fn probe_power(&mut self, node: NodeSerial, on: bool) -> Result<(), Self::Error>;
    /// Put one node into network-synchronized sleep.
    fn network_sleep(&mut self, node: NodeSerial) -> Result<(), Self::Error>;
    /// Configure the local sleep coordinator; `operational` selects the
    /// deployed sleep/wake windows over the setup ones.
    fn sleep_coordinator(&mut self, operational: bool) -> Result<(), Self::Error>;
}

/// Timing knobs and the sample-validation policy.
#[derive(Copy, Clone, Debug)]
pub struct WirelessConfig {
    /// How long discovery collects responses.
    pub discovery_window_ms: u32,
    /// Settling delay after the network wakes before sampling starts.
    pub settle_ms: u32,
    /// Probe supply warmup before the sample request.
    pub probe_warmup_ms: u32,
    /// How long to wait for any per-node reply.
    pub reply_timeout_ms: u32,
    /// Sample validation sentinels.
    pub limits: SampleLimits,
}

impl Default for WirelessConfig {
    fn default() -> Self {
        WirelessConfig {
            discovery_window_ms: 1_000,
            settle_ms: 1_500,
            probe_warmup_ms: 330,
            reply_timeout_ms: 3_300,
            limits: SampleLimits::default(),
        }
    }
}

/// Controller states. Setup walks the staged list once per node; the
/// operational cycle walks the registry each time the network wakes.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum SessionState {
    /// Collecting discovery responses.
    Discovery,
    /// Configuring the current node's inputs.
    SetupIo,
    /// Reading the current node's DIP switch to learn its address.
    SetupAddr,
    /// Commanding the current node into synchronized sleep.
    SetupSleep,
    /// Between cycles; waiting for the network to wake.
    Idle,
    /// Network awake; letting it settle before sampling.
    Settling,
    /// Selecting the next node to sample, or finishing the cycle.
    NextNode,
    /// Waiting for the probe power-on acknowledgement.
    ProbesOn,
    /// Probe supply on; waiting out the warmup.
    ProbeWarmup,
    /// Waiting for the sample frame.
    Sampling,
    /// Waiting for the probe power-off acknowledgement.
    ProbesOff,
    /// Unrecoverable (no nodes found). Only re-creation leaves this state.
    Failed,
}

/// The wireless session state machine. Drive [`poll`] from the main loop
/// and [`on_event`] from the modem layer.
///
/// [`poll`]: SessionController::poll
/// [`on_event`]: SessionController::on_event
#[derive(Debug)]
pub struct SessionController {
    state: SessionState,
    cfg: WirelessConfig,
    registry: Registry,
    staged: heapless::Vec<NodeSerial, { crate::consts::MAX_NODES }>,
    setup_idx: usize,
    cycle_idx: usize,
    deadline: Option<Millis>,
    awaiting_reply: bool,
    coordinator_pending: bool,
    started: bool,
}

impl SessionController {
    /// A controller that will begin discovery on the first
    /// [`poll`](SessionController::poll).
    pub fn new(cfg: WirelessConfig) -> Self {
        SessionController {
            state: SessionState::Discovery,
            cfg,
            registry: Registry::new(),
            staged: heapless::Vec::new(),
            setup_idx: 0,
            cycle_idx: 0,
            deadline: None,
            awaiting_reply: false,
            coordinator_pending: false,
            started: false,
        }
    }

    /// Current controller state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The node registry (averages, counters).
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// True once setup finished and the sampling cycle is armed.
    pub fn operational(&self) -> bool {
        !matches!(
            self.state,
            SessionState::Discovery
                | SessionState::SetupIo
                | SessionState::SetupAddr
                | SessionState::SetupSleep
                | SessionState::Failed
        )
    }

    /// Advances the state machine: issues pending radio commands, applies
    /// deadline expiries. Call once per main-loop pass.
    pub fn poll<R: Radio>(&mut self, now: Millis, radio: &mut R) -> Result<(), R::Error> {
        match self.state {
            SessionState::Discovery => {
                if !self.started {
                    self.started = true;
                    self.arm(now, self.cfg.discovery_window_ms);
                    radio.node_discover()?;
                } else if self.due(now) {
                    if self.staged.is_empty() {
                        diag!("wireless: no nodes answered discovery");
                        self.state = SessionState::Failed;
                    } else {
                        diag!("wireless: discovered {} nodes", self.staged.len());
                        self.setup_idx = 0;
                        self.disarm();
                        self.state = SessionState::SetupIo;
                    }
                }
            }

            SessionState::SetupIo => {
                if !self.awaiting_reply {
                    self.awaiting_reply = true;
                    radio.configure_io(self.staged[self.setup_idx])?;
                }
            }
            SessionState::SetupAddr => {
                if !self.awaiting_reply {
                    self.awaiting_reply = true;
                    radio.sample_io(self.staged[self.setup_idx])?;
                }
            }
            SessionState::SetupSleep => {
                if !self.awaiting_reply {
                    self.awaiting_reply = true;
                    radio.network_sleep(self.staged[self.setup_idx])?;
                }
            }

            SessionState::Idle => {
                if self.coordinator_pending {
                    self.coordinator_pending = false;
                    radio.sleep_coordinator(true)?;
                    diag!("wireless: setup complete, {} nodes", self.registry.len());
                }
            }

            SessionState::Settling => {
                if self.due(now) {
                    self.cycle_idx = 0;
                    self.disarm();
                    self.state = SessionState::NextNode;
                }
            }

            SessionState::NextNode => {
                if self.cycle_idx < self.registry.len() {
                    let node = self.current_node();
                    self.arm(now, self.cfg.reply_timeout_ms);
                    self.state = SessionState::ProbesOn;
                    radio.probe_power(node, true)?;
                } else {
                    self.disarm();
                    self.state = SessionState::Idle;
                }
            }

            SessionState::ProbesOn | SessionState::Sampling => {
                if self.due(now) {
                    let addr = self.current_addr();
                    diag!("wireless: node {} reply timeout", addr);
                    self.registry.note_timeout(addr);
                    self.advance_node();
                }
            }

            SessionState::ProbesOff => {
                if !self.awaiting_reply {
                    self.awaiting_reply = true;
                    let node = self.current_node();
                    radio.probe_power(node, false)?;
                } else if self.due(now) {
                    let addr = self.current_addr();
                    diag!("wireless: node {} reply timeout", addr);
                    self.registry.note_timeout(addr);
                    self.advance_node();
                }
            }

            SessionState::ProbeWarmup => {
                if self.due(now) {
                    let node = self.current_node();
                    self.arm(now, self.cfg.reply_timeout_ms);
                    self.state = SessionState::Sampling;
                    radio.sample_io(node)?;
                }
            }

            SessionState::Failed => {}
        }
        Ok(())
    }

    /// Applies one decoded inbound frame. Commands the transition may
    /// require are issued by the next [`poll`](SessionController::poll).
    pub fn on_event(&mut self, event: RadioEvent, now: Millis) {
        match (self.state, event) {
            (SessionState::Discovery, RadioEvent::NodeFound(serial)) => {
                if self.staged.push(serial).is_err() {
                    diag!("wireless: discovery overflow, node dropped");
                }
            }

            (SessionState::SetupIo, RadioEvent::IoConfigured) => {
                self.awaiting_reply = false;
                self.state = SessionState::SetupAddr;
            }
            (SessionState::SetupAddr, RadioEvent::IoSample { dip_raw, .. }) => {
                self.awaiting_reply = false;
                let addr = dip_to_address(dip_raw);
                if !self.registry.insert(addr, self.staged[self.setup_idx]) {
                    diag!("wireless: bad DIP address {}", addr);
                }
                self.state = SessionState::SetupSleep;
            }
            (SessionState::SetupSleep, RadioEvent::SleepStarted) => {
                self.awaiting_reply = false;
                self.setup_idx += 1;
                if self.setup_idx < self.staged.len() {
                    self.state = SessionState::SetupIo;
                } else {
                    self.coordinator_pending = true;
                    self.state = SessionState::Idle;
                }
            }

            (SessionState::Idle, RadioEvent::NetworkAwake) => {
                self.arm(now, self.cfg.settle_ms);
                self.state = SessionState::Settling;
            }
            (_, RadioEvent::NetworkAsleep) => {
                if self.operational() {
                    self.cycle_idx = 0;
                    self.disarm();
                    self.state = SessionState::Idle;
                }
            }

            (SessionState::ProbesOn, RadioEvent::ProbePowerAck) => {
                self.arm(now, self.cfg.probe_warmup_ms);
                self.state = SessionState::ProbeWarmup;
            }
            (SessionState::Sampling, RadioEvent::IoSample { adc, .. }) => {
                let addr = self.current_addr();
                let limits = self.cfg.limits;
                self.registry.record_sample(addr, adc, &limits);
                self.arm(now, self.cfg.reply_timeout_ms);
                self.awaiting_reply = false;
                self.state = SessionState::ProbesOff;
            }
            (SessionState::ProbesOff, RadioEvent::ProbePowerAck) => {
                self.advance_node();
            }

            (_, RadioEvent::Fault(kind)) => {
                if self.operational() && self.cycle_idx < self.registry.len() {
                    let addr = self.current_addr();
                    match kind {
                        LinkFault::Malformed => self.registry.note_packet_error(addr),
                        LinkFault::Checksum => self.registry.note_crc_error(addr),
                    }
                    diag!("wireless: node {} link fault", addr);
                    self.advance_node();
                }
            }

            _ => {}
        }
    }

    fn current_addr(&self) -> u8 {
        self.registry.ids()[self.cycle_idx]
    }

    fn current_node(&self) -> NodeSerial {
        self.registry
            .node(self.current_addr())
            .map(|n| n.serial)
            .unwrap_or_default()
    }

    fn advance_node(&mut self) {
        self.cycle_idx += 1;
        self.awaiting_reply = false;
        self.disarm();
        self.state = SessionState::NextNode;
    }

    fn arm(&mut self, now: Millis, after_ms: u32) {
        self.deadline = Some(now.wrapping_add(after_ms));
    }

    fn disarm(&mut self) {
        self.deadline = None;
    }

    fn due(&self, now: Millis) -> bool {
        match self.deadline {
            Some(at) => now.wrapping_sub(at) < 0x8000_0000,
            None => false,
        }
    }
}

/// Decodes the DIP switch lines from the raw digital sample byte. The
/// switches are active-low at the carrier-board bit positions.
pub(crate) fn dip_to_address(raw: u8) -> u8 {
    let one = (!raw & 0x02) >> 1;
    let two = (!raw & 0x10) >> 3;
    let four = (!raw & 0x80) >> 5;
    let eight = (!raw & 0x40) >> 3;
    one | two | four | eight
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct MockRadio {
        log: Vec<&'static str>,
    }

    impl Radio for MockRadio {
        type Error = core::convert::Infallible;

        fn node_discover(&mut self) -> Result<(), Self::Error> {
            self.log.push("discover");
            Ok(())
        }
        fn configure_io(&mut self, _node: NodeSerial) -> Result<(), Self::Error> {
            self.log.push("configure");
            Ok(())
        }
        fn sample_io(&mut self, _node: NodeSerial) -> Result<(), Self::Error> {
            self.log.push("sample");
            Ok(())
        }
        fn probe_power(&mut self, _node: NodeSerial, on: bool) -> Result<(), Self::Error> {
            self.log.push(if on { "power_on" } else { "power_off" });
            Ok(())
        }
        fn network_sleep(&mut self, _node: NodeSerial) -> Result<(), Self::Error> {
            self.log.push("sleep");
            Ok(())
        }
        fn sleep_coordinator(&mut self, _operational: bool) -> Result<(), Self::Error> {
            self.log.push("coordinator");
            Ok(())
        }
    }

    /// Raw digital byte for a DIP setting: a closed switch pulls its line
    /// low and sets the corresponding address bit.
    fn raw_for(addr: u8) -> u8 {
        let mut raw = 0xFFu8;
        if addr & 0x01 != 0 {
            raw &= !0x02;
        }
        if addr & 0x02 != 0 {
            raw &= !0x10;
        }
        if addr & 0x04 != 0 {
            raw &= !0x80;
        }
        if addr & 0x08 != 0 {
            raw &= !0x40;
        }
        raw
    }

    /// Runs discovery and the per-node setup pipeline for the given DIP
    /// addresses, leaving the controller idle and operational.
    fn operational_controller(dips: &[u8]) -> (SessionController, MockRadio) {
        let mut radio = MockRadio::default();
        let mut s = SessionController::new(WirelessConfig::default());
        let mut now = 0;
        s.poll(now, &mut radio).unwrap();
        for (i, _) in dips.iter().enumerate() {
            s.on_event(
                RadioEvent::NodeFound(NodeSerial {
                    sh: 0x0013A200,
                    sl: 0x4000_0000 + i as u32,
                }),
                now,
            );
        }
        now += s.cfg.discovery_window_ms;
        s.poll(now, &mut radio).unwrap();
        for &dip in dips {
            s.poll(now, &mut radio).unwrap(); // configure_io
            s.on_event(RadioEvent::IoConfigured, now);
            s.poll(now, &mut radio).unwrap(); // sample_io for the DIP lines
            s.on_event(
                RadioEvent::IoSample {
                    dip_raw: raw_for(dip),
                    adc: [0, 0],
                },
                now,
            );
            s.poll(now, &mut radio).unwrap(); // network_sleep
            s.on_event(RadioEvent::SleepStarted, now);
        }
        s.poll(now, &mut radio).unwrap(); // sleep coordinator switch-over
        assert_eq!(s.state(), SessionState::Idle);
        assert!(s.operational());
        (s, radio)
    }

    #[test]
    fn dip_decode() {
        assert_eq!(dip_to_address(0xFF), 0);
        for addr in 0..16 {
            assert_eq!(dip_to_address(raw_for(addr)), addr);
        }
    }

    #[test]
    fn discovery_and_setup_pipeline() {
        let (s, radio) = operational_controller(&[3, 7]);
        assert_eq!(s.registry().ids(), &[3, 7]);
        assert_eq!(
            radio.log,
            [
                "discover", "configure", "sample", "sleep", "configure", "sample", "sleep",
                "coordinator"
            ]
        );
    }

    #[test]
    fn empty_discovery_fails() {
        let mut radio = MockRadio::default();
        let mut s = SessionController::new(WirelessConfig::default());
        s.poll(0, &mut radio).unwrap();
        s.poll(s.cfg.discovery_window_ms, &mut radio).unwrap();
        assert_eq!(s.state(), SessionState::Failed);
        assert!(!s.operational());
    }

    #[test]
    fn sampling_cycle_stores_and_powers_down() {
        let (mut s, mut radio) = operational_controller(&[3]);
        radio.log.clear();
        let mut now = 10_000;

        s.on_event(RadioEvent::NetworkAwake, now);
        assert_eq!(s.state(), SessionState::Settling);
        now += s.cfg.settle_ms;
        s.poll(now, &mut radio).unwrap();
        s.poll(now, &mut radio).unwrap(); // probe power on
        assert_eq!(s.state(), SessionState::ProbesOn);

        s.on_event(RadioEvent::ProbePowerAck, now);
        assert_eq!(s.state(), SessionState::ProbeWarmup);
        now += s.cfg.probe_warmup_ms;
        s.poll(now, &mut radio).unwrap(); // sample request
        assert_eq!(s.state(), SessionState::Sampling);

        s.on_event(
            RadioEvent::IoSample {
                dip_raw: 0xFF,
                adc: [512, 498],
            },
            now,
        );
        s.poll(now, &mut radio).unwrap(); // probe power off
        s.on_event(RadioEvent::ProbePowerAck, now);
        s.poll(now, &mut radio).unwrap(); // past the last node
        assert_eq!(s.state(), SessionState::Idle);

        assert_eq!(
            radio.log,
            ["power_on", "sample", "power_off"]
        );
        let node = s.registry().node(3).unwrap();
        assert_eq!(node.probe(0).average(), 512);
        assert_eq!(node.probe(1).average(), 498);

        s.on_event(RadioEvent::NetworkAsleep, now);
        assert_eq!(s.state(), SessionState::Idle);
    }

    #[test]
    fn reply_timeout_charges_node_and_moves_on() {
        let (mut s, mut radio) = operational_controller(&[3]);
        let mut now = 10_000;
        s.on_event(RadioEvent::NetworkAwake, now);
        now += s.cfg.settle_ms;
        s.poll(now, &mut radio).unwrap();
        s.poll(now, &mut radio).unwrap();
        assert_eq!(s.state(), SessionState::ProbesOn);

        now += s.cfg.reply_timeout_ms;
        s.poll(now, &mut radio).unwrap();
        assert_eq!(s.registry().node(3).unwrap().uart_timeouts, 1);
        s.poll(now, &mut radio).unwrap();
        assert_eq!(s.state(), SessionState::Idle);
    }

    #[test]
    fn link_fault_counts_against_current_node() {
        let (mut s, mut radio) = operational_controller(&[3]);
        let mut now = 10_000;
        s.on_event(RadioEvent::NetworkAwake, now);
        now += s.cfg.settle_ms;
        s.poll(now, &mut radio).unwrap();
        s.poll(now, &mut radio).unwrap();

        s.on_event(RadioEvent::Fault(LinkFault::Checksum), now);
        assert_eq!(s.registry().node(3).unwrap().crc_errors, 1);
        s.on_event(RadioEvent::Fault(LinkFault::Malformed), now);
        // the cycle already moved past the only node, so nothing is charged
        assert_eq!(s.registry().node(3).unwrap().packet_errors, 0);
    }
}
