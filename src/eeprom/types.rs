//! SII register images and category structures.

use crate::mailbox::{MailboxConfig, MailboxProtocols, MailboxWindow};
use ethercrab_wire::EtherCrabWireWriteSized;

/// The SII control/status word at register `0x0502`.
///
/// Defined in ETG1000.4 6.4.3.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[wire(bytes = 2)]
pub struct SiiControl {
    /// EEPROM write access enable.
    #[wire(bits = 1, post_skip = 4)]
    pub write_access: bool,
    /// EEPROM emulation by the PDI application.
    #[wire(bits = 1)]
    pub emulation: bool,
    /// Number of octets a read delivers.
    #[wire(bits = 1)]
    pub read_size: SiiReadSize,
    /// Width of the address field.
    #[wire(bits = 1)]
    pub address_type: SiiAddressSize,

    // Second byte: operation trigger and status bits
    /// Read operation requested / in progress.
    #[wire(bits = 1)]
    pub read: bool,
    /// Write operation requested / in progress.
    #[wire(bits = 1)]
    pub write: bool,
    /// Reload operation requested / in progress.
    #[wire(bits = 1)]
    pub reload: bool,
    /// EEPROM CRC error.
    #[wire(bits = 1)]
    pub checksum_error: bool,
    /// Device information not yet loaded from EEPROM.
    #[wire(bits = 1)]
    pub loading: bool,
    /// Command error, e.g. read during an ongoing operation.
    #[wire(bits = 1)]
    pub command_error: bool,
    /// Write enable missing or write protection active.
    #[wire(bits = 1)]
    pub write_error: bool,
    /// Operation in progress.
    #[wire(bits = 1)]
    pub busy: bool,
}

impl SiiControl {
    /// The device reported an error executing the last operation.
    pub fn has_error(&self) -> bool {
        self.checksum_error || self.command_error || self.write_error
    }

    /// An operation (or the initial EEPROM load) is still in progress.
    pub fn is_busy(&self) -> bool {
        self.busy || self.read || self.write || self.reload
    }
}

/// Octets delivered by one SII read operation.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[wire(bits = 1)]
#[repr(u8)]
pub enum SiiReadSize {
    /// Read 4 octets at a time.
    #[default]
    Octets4 = 0x00,
    /// Read 8 octets at a time.
    Octets8 = 0x01,
}

impl SiiReadSize {
    /// Read chunk size in bytes.
    pub fn chunk_len(&self) -> u16 {
        match self {
            SiiReadSize::Octets4 => 4,
            SiiReadSize::Octets8 => 8,
        }
    }
}

/// Width of the SII word address field.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[wire(bits = 1)]
#[repr(u8)]
pub enum SiiAddressSize {
    #[default]
    U8 = 0x00,
    U16 = 0x01,
}

/// A read request written to the SII control area: control word plus word address.
#[derive(Copy, Clone)]
pub struct SiiRequest {
    control: SiiControl,
    address: u16,
}

impl core::fmt::Debug for SiiRequest {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SiiRequest")
            .field("control", &self.control)
            .field("address", &format_args!("{:#06x}", self.address))
            .finish()
    }
}

impl SiiRequest {
    /// A read of the word at `address`.
    pub fn read(address: u16) -> Self {
        Self {
            control: SiiControl {
                address_type: SiiAddressSize::U16,
                read: true,
                ..Default::default()
            },
            address,
        }
    }

    /// The 4 octet register image written to `0x0502`.
    pub fn as_array(&self) -> [u8; 4] {
        let mut buf = [0u8; 4];

        buf[0..2].copy_from_slice(&self.control.pack());
        buf[2..4].copy_from_slice(&self.address.to_le_bytes());

        buf
    }
}

/// SII category types.
///
/// Defined in ETG1000.6 Table 19.
#[derive(Debug, Copy, Clone, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u16)]
pub enum CategoryType {
    Nop = 0,
    #[wire(alternatives = [2, 3, 4, 5, 6, 7, 8, 9])]
    DeviceSpecific = 1,
    Strings = 10,
    DataTypes = 20,
    General = 30,
    Fmmu = 40,
    SyncManager = 41,
    FmmuExtended = 42,
    SyncUnit = 43,
    TxPdo = 50,
    RxPdo = 51,
    DistributedClock = 60,
    End = 0xffff,
    #[wire(catch_all)]
    Unknown(u16) = 0xfffe,
}

bitflags::bitflags! {
    /// CoE feature detail bits from the SII general category.
    ///
    /// ETG1000.6 Table 21.
    #[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    pub struct CoeDetails: u8 {
        /// SDO requests are supported.
        const ENABLE_SDO = 0x01;
        /// The SDO Information service (dictionary enumeration) is supported.
        const ENABLE_SDO_INFO = 0x02;
        /// The PDO assignment objects (`0x1c1x`) are writable.
        const ENABLE_PDO_ASSIGN = 0x04;
        /// The PDO mapping objects are writable.
        const ENABLE_PDO_CONFIGURATION = 0x08;
        /// Startup upload of the configuration is requested.
        const ENABLE_STARTUP_UPLOAD = 0x10;
        /// SDO complete access is supported.
        const ENABLE_COMPLETE_ACCESS = 0x20;
    }
}

bitflags::bitflags! {
    /// General flags from the SII general category.
    #[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    pub struct GeneralFlags: u8 {
        /// SAFEOP is reachable without process data watchdog.
        const ENABLE_SAFEOP = 0x01;
        /// Device does not support LRW access.
        const ENABLE_NOT_LRW = 0x02;
        /// Mailbox data link layer supported.
        const MAILBOX_DLL = 0x04;
        /// Identification via AL status code supported.
        const IDENT_AL_STATUS = 0x08;
        /// Identification via physical memory supported.
        const IDENT_PHY_MEMORY = 0x10;
    }
}

/// The SII general category (type 30, 32 bytes).
///
/// Defined in ETG1000.6 Table 21.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SiiGeneral {
    /// String index of the device group.
    pub group_string_idx: u8,
    /// String index of the device image name.
    pub image_string_idx: u8,
    /// String index of the order number.
    pub order_string_idx: u8,
    /// String index of the device name.
    pub name_string_idx: u8,
    /// CoE feature details.
    pub coe_details: CoeDetails,
    /// FoE supported.
    pub foe_enabled: bool,
    /// EoE supported.
    pub eoe_enabled: bool,
    /// General flags.
    pub flags: GeneralFlags,
    /// EBus current consumption in mA. Negative values feed current into the bus.
    pub ebus_current: i16,
    /// Physical layer of the 4 ports, one nibble each.
    pub ports: [u8; 4],
}

/// One sync manager descriptor from the SII sync manager category (type 41, 8 bytes each).
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[wire(bytes = 8)]
pub struct SiiSyncManager {
    #[wire(bytes = 2)]
    pub start_address: u16,
    #[wire(bytes = 2)]
    pub length: u16,
    #[wire(bytes = 1)]
    pub control: u8,
    #[wire(bytes = 1)]
    pub status: u8,
    #[wire(bytes = 1)]
    pub enable: u8,
    #[wire(bytes = 1)]
    pub usage_type: u8,
}

/// The default mailbox layout advertised in the fixed SII header (words `0x0014..0x001C`),
/// plus the supported protocol set (word `0x001C`).
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DefaultMailbox {
    /// MainDevice → SubDevice window to use during BOOT state.
    pub bootstrap_write: MailboxWindow,
    /// SubDevice → MainDevice window to use during BOOT state.
    pub bootstrap_read: MailboxWindow,
    /// MainDevice → SubDevice window for standard states.
    pub standard_write: MailboxWindow,
    /// SubDevice → MainDevice window for standard states.
    pub standard_read: MailboxWindow,
    /// Protocols the SubDevice advertises over its mailbox.
    pub supported_protocols: MailboxProtocols,
}

impl DefaultMailbox {
    /// `true` if the SubDevice advertises any mailbox protocol at all.
    pub fn has_mailbox(&self) -> bool {
        !self.supported_protocols.is_empty()
            && self.standard_write.len > 0
            && self.standard_read.len > 0
    }

    /// The mailbox window pair for a bringup towards `bootstrap` or standard states.
    pub fn config(&self, bootstrap: bool) -> MailboxConfig {
        if bootstrap {
            MailboxConfig {
                write: self.bootstrap_write,
                read: self.bootstrap_read,
            }
        } else {
            MailboxConfig {
                write: self.standard_write,
                read: self.standard_read,
            }
        }
    }
}
