//! SubDevice register address abstraction.

/// Named addresses for the SubDevice registers this engine touches.
///
/// Defined in ETG1000.4, Table 31 onwards.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u16)]
pub enum RegisterAddress {
    /// Type, `u8`.
    ///
    /// The first byte of the 12 byte base information block (type, revision, build, FMMU/SM
    /// counts, port descriptors, feature flags).
    Type = 0x0000u16,
    /// The SubDevice's configured station address, `u16`.
    ConfiguredStationAddress = 0x0010,
    /// The SubDevice's station alias, `u16`.
    ConfiguredStationAlias = 0x0012,

    /// DL control, `u16`.
    DlControl = 0x0100,
    /// DL status, `u16`. Defined in ETG1000.4 Table 34.
    DlStatus = 0x0110,

    /// Application Layer (AL) control register, `u16`. See ETG1000.6 Table 9.
    AlControl = 0x0120,
    /// Application Layer (AL) status register, `u16`. See ETG1000.6 Table 10.
    AlStatus = 0x0130,
    /// Application Layer (AL) status code register, `u16`. See ETG1000.6 Table 11.
    AlStatusCode = 0x0134,

    /// Watchdog divider, `u16`.
    ///
    /// See ETG1000.4 section 6.3 Watchdogs.
    WatchdogDivider = 0x0400,
    /// Sync manager watchdog interval, `u16`.
    SyncManagerWatchdog = 0x0420,

    /// EEPROM (SII) access configuration (PDI/EtherCAT ownership), `u16`.
    SiiConfig = 0x0500,
    /// EEPROM (SII) control/status word, `u16`.
    SiiControl = 0x0502,
    /// EEPROM (SII) word address, `u32`.
    SiiAddress = 0x0504,
    /// EEPROM (SII) read data, 4 bytes.
    SiiData = 0x0508,

    /// Fieldbus Memory Management Unit (FMMU) 0; subsequent FMMUs at 16 byte strides.
    ///
    /// Defined in ETG1000.4 Table 57.
    Fmmu0 = 0x0600,

    /// Sync Manager (SM) 0; subsequent SMs at 8 byte strides.
    ///
    /// Defined in ETG1000.4 Table 59.
    Sm0 = 0x0800,

    /// Distributed clock (DC) port 0 receive time in ns; ports 1-3 follow as `u32`s.
    ///
    /// Distributed clock registers are defined in ETG1000.4 Table 60/61.
    DcTimePort0 = 0x0900,
    /// DC system time, `u64`. A working counter of 1 on a read probes for DC support.
    DcSystemTime = 0x0910,
    /// DC system time offset, `u64`.
    DcSystemTimeOffset = 0x0920,
    /// DC system time difference, `u32` in signed-magnitude representation.
    DcSystemTimeDifference = 0x092C,
    /// DC SYNC0/SYNC1 assign/activate, `u16`.
    DcSyncAssignActivate = 0x0980,
    /// DC SYNC0 start time, `u64`.
    DcSyncStartTime = 0x0990,
    /// DC SYNC0 cycle time in ns, `u32`.
    DcSync0CycleTime = 0x09A0,
    /// DC SYNC1 cycle time in ns, `u32`.
    DcSync1CycleTime = 0x09A4,
}

impl From<RegisterAddress> for u16 {
    fn from(reg: RegisterAddress) -> Self {
        reg as u16
    }
}

impl RegisterAddress {
    /// FMMU configuration area by index.
    pub fn fmmu(index: u8) -> u16 {
        debug_assert!(index < 16, "Bad FMMU index {}", index);

        u16::from(Self::Fmmu0) + u16::from(index) * 0x10
    }

    /// Sync manager configuration area by index.
    pub fn sync_manager(index: u8) -> u16 {
        debug_assert!(index < 16, "Bad SM index {}", index);

        u16::from(Self::Sm0) + u16::from(index) * 0x08
    }

    /// Sync manager status byte by SM index.
    ///
    /// The status register is the 5th byte after the start of the SM.
    pub fn sync_manager_status(index: u8) -> u16 {
        Self::sync_manager(index) + 5
    }

    /// DC receive time register for the given port.
    pub fn dc_time_port(port: u8) -> u16 {
        debug_assert!(port < 4, "Bad port index {}", port);

        u16::from(Self::DcTimePort0) + u16::from(port) * 0x04
    }
}

/// Feature support flags from register `0x0008`, part of the base information block.
#[derive(Default, Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(not(test), derive(ethercrab_wire::EtherCrabWireRead))]
#[cfg_attr(
    test,
    derive(arbitrary::Arbitrary, ethercrab_wire::EtherCrabWireReadWrite)
)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[wire(bytes = 2)]
pub struct SupportFlags {
    #[wire(bits = 1)]
    pub fmmu_supports_bit_ops: bool,
    #[wire(bits = 1)]
    pub reserved_register_support: bool,
    #[wire(bits = 1)]
    pub dc_supported: bool,
    #[wire(bits = 1)]
    pub has_64bit_dc: bool,
    #[wire(bits = 1)]
    pub low_jitter: bool,
    #[wire(bits = 1)]
    pub ebus_enhanced_link_detection: bool,
    #[wire(bits = 1)]
    pub mii_enhanced_link_detection: bool,
    #[wire(bits = 1)]
    pub separate_fcs_error_handling: bool,
    #[wire(bits = 1)]
    pub enhanced_dc_sync: bool,
    #[wire(bits = 1)]
    pub lrw_supported: bool,
    #[wire(bits = 1)]
    pub brw_aprw_fprw_supported: bool,
    #[wire(bits = 1, post_skip = 4)]
    pub special_fmmu: bool,
}

impl core::fmt::Display for SupportFlags {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("DC: ")?;

        if self.dc_supported {
            f.write_str("yes")?;

            if self.has_64bit_dc {
                f.write_str(" (64 bit)")?;
            } else {
                f.write_str(" (32 bit)")?;
            }
        } else {
            f.write_str("no")?;
        }

        if self.enhanced_dc_sync {
            f.write_str(", enhanced sync")?;
        }

        Ok(())
    }
}

/// The physical layer of each of the 4 SubDevice ports, from register `0x0007`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ethercrab_wire::EtherCrabWireRead)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum PortType {
    NotImplemented = 0x00u8,
    NotConfigured = 0x01,
    Ebus = 0x02,
    Mii = 0x03,
}

/// The base information block read from register `0x0000` during scan.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq, ethercrab_wire::EtherCrabWireRead)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[wire(bytes = 12)]
pub struct BaseInfo {
    #[wire(bytes = 1)]
    pub kind: u8,
    #[wire(bytes = 1)]
    pub revision: u8,
    #[wire(bytes = 2)]
    pub build: u16,
    /// Number of supported FMMU entities.
    #[wire(bytes = 1)]
    pub fmmu_count: u8,
    /// Number of supported sync manager channels.
    #[wire(bytes = 1)]
    pub sync_manager_count: u8,
    /// RAM size in KiB.
    #[wire(bytes = 1)]
    pub ram_size_kb: u8,
    /// Physical layer of the 4 ports, 2 bits each.
    #[wire(bytes = 1)]
    pub port_descriptors: u8,
    #[wire(bytes = 2, post_skip = 16)]
    pub support_flags: SupportFlags,
}

impl BaseInfo {
    /// Hardware limit on the number of FMMUs/SMs an ESC can expose.
    pub(crate) const MAX_FMMUS: u8 = 16;
    pub(crate) const MAX_SYNC_MANAGERS: u8 = 16;

    /// FMMU count clamped to the addressable register area.
    pub fn usable_fmmus(&self) -> u8 {
        self.fmmu_count.min(Self::MAX_FMMUS)
    }

    /// Sync manager count clamped to the addressable register area.
    pub fn usable_sync_managers(&self) -> u8 {
        self.sync_manager_count.min(Self::MAX_SYNC_MANAGERS)
    }

    /// Physical layer of the given port, from the descriptor nibbles.
    pub fn port_type(&self, port: u8) -> PortType {
        match (self.port_descriptors >> (port * 2)) & 0b11 {
            0 => PortType::NotImplemented,
            1 => PortType::NotConfigured,
            2 => PortType::Ebus,
            _ => PortType::Mii,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethercrab_wire::{EtherCrabWireRead, EtherCrabWireWrite};

    #[test]
    fn stride_helpers() {
        assert_eq!(RegisterAddress::fmmu(0), 0x0600);
        assert_eq!(RegisterAddress::fmmu(2), 0x0620);
        assert_eq!(RegisterAddress::sync_manager(0), 0x0800);
        assert_eq!(RegisterAddress::sync_manager(3), 0x0818);
        assert_eq!(RegisterAddress::sync_manager_status(1), 0x080D);
        assert_eq!(RegisterAddress::dc_time_port(3), 0x090C);
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn support_flags_fuzz() {
        heckcheck::check(|status: SupportFlags| {
            let mut buf = [0u8; 2];

            let packed = status.pack_to_slice(&mut buf).expect("Pack");

            let unpacked = SupportFlags::unpack_from_slice(packed).expect("Unpack");

            pretty_assertions::assert_eq!(status, unpacked);

            Ok(())
        });
    }

    #[test]
    fn base_info_decode() {
        let raw = [
            0x11, // type
            0x02, // revision
            0x01, 0x00, // build
            0x08, // FMMU count
            0x04, // SM count
            0x01, // RAM KiB
            0x0f, // port descriptors
            0x0c, 0x00, // support flags: DC + 64 bit DC
            0x00, 0x00, // reserved
        ];

        let parsed = BaseInfo::unpack_from_slice(&raw).unwrap();

        assert_eq!(parsed.fmmu_count, 8);
        assert_eq!(parsed.sync_manager_count, 4);
        assert!(parsed.support_flags.dc_supported);
        assert!(parsed.support_flags.has_64bit_dc);
        assert_eq!(parsed.usable_fmmus(), 8);
    }
}
