//! DL status word, register `0x0110`: per-port link, loopback and signal detection.

/// The DL status word.
///
/// Defined in ETG1000.4 Table 34.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
#[cfg_attr(not(test), derive(ethercrab_wire::EtherCrabWireRead))]
#[cfg_attr(
    test,
    derive(arbitrary::Arbitrary, ethercrab_wire::EtherCrabWireReadWrite)
)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[wire(bytes = 2)]
pub struct DlStatus {
    #[wire(bits = 1)]
    pub pdi_operational: bool,
    #[wire(bits = 1)]
    pub watchdog_ok: bool,
    #[wire(bits = 1, post_skip = 1)]
    pub extended_link_detection: bool,
    /// True if port 0 has a physical link present.
    #[wire(bits = 1)]
    pub link_port0: bool,
    /// True if port 1 has a physical link present.
    #[wire(bits = 1)]
    pub link_port1: bool,
    /// True if port 2 has a physical link present.
    #[wire(bits = 1)]
    pub link_port2: bool,
    /// True if port 3 has a physical link present.
    #[wire(bits = 1)]
    pub link_port3: bool,
    /// True if port 0 forwards to itself (i.e. loopback)
    #[wire(bits = 1)]
    pub loopback_port0: bool,
    /// RX signal detected on port 0
    #[wire(bits = 1)]
    pub signal_port0: bool,
    /// True if port 1 forwards to itself (i.e. loopback)
    #[wire(bits = 1)]
    pub loopback_port1: bool,
    /// RX signal detected on port 1
    #[wire(bits = 1)]
    pub signal_port1: bool,
    /// True if port 2 forwards to itself (i.e. loopback)
    #[wire(bits = 1)]
    pub loopback_port2: bool,
    /// RX signal detected on port 2
    #[wire(bits = 1)]
    pub signal_port2: bool,
    /// True if port 3 forwards to itself (i.e. loopback)
    #[wire(bits = 1)]
    pub loopback_port3: bool,
    /// RX signal detected on port 3
    #[wire(bits = 1)]
    pub signal_port3: bool,
}

impl DlStatus {
    /// Per-port `(link up, loop closed, signal detected)` triple.
    pub fn port(&self, index: u8) -> (bool, bool, bool) {
        match index {
            0 => (self.link_port0, self.loopback_port0, self.signal_port0),
            1 => (self.link_port1, self.loopback_port1, self.signal_port1),
            2 => (self.link_port2, self.loopback_port2, self.signal_port2),
            3 => (self.link_port3, self.loopback_port3, self.signal_port3),
            index => unreachable!("Bad port index {}", index),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethercrab_wire::{EtherCrabWireRead, EtherCrabWireWrite};

    #[test]
    #[cfg_attr(miri, ignore)]
    fn dl_status_fuzz() {
        heckcheck::check(|status: DlStatus| {
            let mut buf = [0u8; 16];

            let packed = status.pack_to_slice(&mut buf).expect("Pack");

            let unpacked = DlStatus::unpack_from_slice(packed).expect("Unpack");

            pretty_assertions::assert_eq!(status, unpacked);

            Ok(())
        });
    }

    #[test]
    fn port_triples() {
        // Port 0 link + signal, port 1 loopback
        let parsed = DlStatus::unpack_from_slice(&[0x10, 0x06]).unwrap();

        assert_eq!(parsed.port(0), (true, false, true));
        assert_eq!(parsed.port(1), (false, true, false));
    }
}
