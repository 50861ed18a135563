//! Per-node identity, data quality counters and sample storage.
//!
//! Nothing here is specific to a particular radio. Each node carries its
//! 64-bit serial, the DIP-switch-derived logical address (which doubles as
//! its SDI-12 address and its registry index), link fault counters for the
//! diagnostic display, and one small ring of samples per probe.

use heapless::Vec;

use crate::consts::{ADC_FULL_SCALE, MAX_NODES, PROBES_PER_NODE, SAMPLE_RING};
use crate::protocol::DataMsg;

/// 64-bit radio serial number, high and low words.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Copy, Clone, Default, PartialEq, Eq, Debug)]
pub struct NodeSerial {
    /// Serial number, high word.
    pub sh: u32,
    /// Serial number, low word.
    pub sl: u32,
}

/// Site-configurable sample validation: readings equal to either sentinel
/// are rejected (a floating input reads full-scale, a shorted one reads
/// zero).
#[derive(Copy, Clone, Debug)]
pub struct SampleLimits {
    /// Low reject sentinel.
    pub low: u16,
    /// High reject sentinel.
    pub high: u16,
}

impl Default for SampleLimits {
    fn default() -> Self {
        SampleLimits {
            low: 0,
            high: ADC_FULL_SCALE,
        }
    }
}

impl SampleLimits {
    /// True when the raw reading is usable.
    pub fn accepts(&self, raw: u16) -> bool {
        raw != self.low && raw != self.high
    }
}

/// One probe's sample ring and its good-sample count.
#[derive(Copy, Clone, Default, Debug)]
pub struct Probe {
    ring: [u16; SAMPLE_RING],
    good: u8,
}

impl Probe {
    fn store(&mut self, slot: usize, raw: u16, valid: bool) {
        if valid {
            self.ring[slot] = raw;
            if (self.good as usize) < SAMPLE_RING {
                self.good += 1;
            }
        } else {
            self.ring[slot] = 0;
            self.good = self.good.saturating_sub(1);
        }
    }

    /// Number of currently valid samples in the ring.
    pub fn good_samples(&self) -> u8 {
        self.good
    }

    /// Ring sum divided by the good-sample count; 0 when nothing valid has
    /// been recorded. Rejected slots hold 0 and so never skew the sum.
    pub fn average(&self) -> u16 {
        if self.good == 0 {
            return 0;
        }
        let sum: u32 = self.ring.iter().map(|&v| v as u32).sum();
        (sum / self.good as u32) as u16
    }
}

/// One wireless node.
#[derive(Copy, Clone, Default, Debug)]
pub struct Node {
    /// Radio serial.
    pub serial: NodeSerial,
    /// DIP-switch setting; also the SDI-12 address and registry index.
    pub dip: u8,
    probes: [Probe; PROBES_PER_NODE],
    cursor: u8,
    /// Replies that never arrived.
    pub uart_timeouts: u16,
    /// Frames that arrived malformed.
    pub packet_errors: u16,
    /// Frames that failed their checksum.
    pub crc_errors: u16,
}

impl Node {
    /// Access one probe's samples.
    pub fn probe(&self, i: usize) -> &Probe {
        &self.probes[i]
    }
}

/// Fixed-capacity registry of discovered nodes, indexed by logical address.
///
/// Populated once by the discovery pass before any SDI-12 activity, never
/// resized afterward; mutated only by the wireless controller and read by
/// the command parser through the averages.
#[derive(Default, Debug)]
pub struct Registry {
    nodes: [Node; MAX_NODES],
    ids: Vec<u8, MAX_NODES>,
}

impl Registry {
    /// An empty registry.
    pub fn new() -> Self {
        Registry::default()
    }

    /// Registers a node at its DIP-derived address. Returns `false` for an
    /// out-of-range or duplicate address.
    pub fn insert(&mut self, dip: u8, serial: NodeSerial) -> bool {
        let idx = dip as usize;
        if idx >= MAX_NODES || self.ids.contains(&dip) {
            return false;
        }
        self.nodes[idx].serial = serial;
        self.nodes[idx].dip = dip;
        self.ids.push(dip).is_ok()
    }

    /// The registered logical addresses, in registration order.
    pub fn ids(&self) -> &[u8] {
        &self.ids
    }

    /// Number of registered nodes.
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// True when nothing has been registered.
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// The node at a logical address, if registered.
    pub fn node(&self, addr: u8) -> Option<&Node> {
        if self.ids.contains(&addr) {
            Some(&self.nodes[addr as usize])
        } else {
            None
        }
    }

    fn node_mut(&mut self, addr: u8) -> Option<&mut Node> {
        if self.ids.contains(&addr) {
            Some(&mut self.nodes[addr as usize])
        } else {
            None
        }
    }

    /// Validates and stores one reading per probe at the node's current ring
    /// slot, then advances the slot.
    pub fn record_sample(&mut self, addr: u8, raw: [u16; PROBES_PER_NODE], limits: &SampleLimits) {
        let Some(node) = self.node_mut(addr) else {
            return;
        };
        let slot = node.cursor as usize;
        for (probe, &value) in node.probes.iter_mut().zip(raw.iter()) {
            probe.store(slot, value, limits.accepts(value));
        }
        node.cursor = if slot >= SAMPLE_RING - 1 {
            0
        } else {
            node.cursor + 1
        };
    }

    /// Counts a reply that never arrived.
    pub fn note_timeout(&mut self, addr: u8) {
        if let Some(node) = self.node_mut(addr) {
            node.uart_timeouts = node.uart_timeouts.wrapping_add(1);
        }
    }

    /// Counts a malformed frame.
    pub fn note_packet_error(&mut self, addr: u8) {
        if let Some(node) = self.node_mut(addr) {
            node.packet_errors = node.packet_errors.wrapping_add(1);
        }
    }

    /// Counts a checksum failure.
    pub fn note_crc_error(&mut self, addr: u8) {
        if let Some(node) = self.node_mut(addr) {
            node.crc_errors = node.crc_errors.wrapping_add(1);
        }
    }

    /// Builds the data message for a node: `+<avg0>+<avg1>` behind the
    /// address placeholder, in the layout the protocol core consumes.
    pub fn prepare_report(&self, addr: u8) -> DataMsg {
        let mut msg = DataMsg::new();
        if let Some(node) = self.node(addr) {
            for probe in &node.probes {
                msg.push_byte(b'+');
                msg.push_u16(probe.average());
            }
        }
        msg
    }
}
