//! SubDevice port and topology records.

use crate::dl_status::DlStatus;

/// State of one of the up to 4 ports of a SubDevice.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct Port {
    /// A physical link is present.
    pub link_up: bool,
    /// The port forwards to itself (loopback).
    pub loop_closed: bool,
    /// An RX signal is detected.
    pub signal_detected: bool,
    /// The port did not see the last broadcast timing datagram.
    ///
    /// Set when the DC receive time is unchanged across a broadcast latch. The heuristic is
    /// conservative; certain redundancy topologies may mis-flag ports.
    pub bypassed: bool,
    /// Distributed clock receive time latched at this port, in ns.
    pub dc_receive_time: u32,
    /// Index of the neighbouring SubDevice reached through this port, if known.
    pub neighbour: Option<u16>,
}

/// The port array of one SubDevice, in register order 0-3.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct Ports(pub [Port; 4]);

impl Ports {
    /// Update link/loop/signal flags from a DL status word.
    pub(crate) fn update_from_dl_status(&mut self, status: DlStatus) {
        for (index, port) in self.0.iter_mut().enumerate() {
            let (link_up, loop_closed, signal_detected) = status.port(index as u8);

            port.link_up = link_up;
            port.loop_closed = loop_closed;
            port.signal_detected = signal_detected;
        }
    }

    /// Record freshly latched DC receive times, marking ports whose time did not move since
    /// the previous latch as bypassed.
    pub(crate) fn update_dc_times(&mut self, previous: [u32; 4], latched: [u32; 4]) {
        for (index, port) in self.0.iter_mut().enumerate() {
            port.dc_receive_time = latched[index];
            port.bypassed = latched[index] == previous[index];
        }
    }

    /// Number of ports with an open (forwarding, non-loopback) link.
    pub fn open_ports(&self) -> u8 {
        self.0
            .iter()
            .filter(|port| port.link_up && !port.loop_closed)
            .count() as u8
    }
}
