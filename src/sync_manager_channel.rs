//! Sync manager channel configuration, registers `0x0800` onwards.

use core::fmt;

/// ETG1000.6 Table 67 – CoE Communication Area, "Sync Manager Communication Type".
pub const SM_TYPE_ADDRESS: u16 = 0x1c00;

/// ETG1000.6 Table 67 – CoE Communication Area, the PDO assignment object of the first sync
/// manager. Assignment objects for subsequent SMs follow at consecutive indices.
pub const SM_BASE_ADDRESS: u16 = 0x1c10;

/// Sync manager channel.
///
/// A window into SubDevice DPRAM with direction and buffering rules. SM0/SM1 conventionally
/// carry the mailbox, SM2+ process data.
///
/// Defined in ETG1000.4 6.7.2.
#[derive(Default, Copy, Clone, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[wire(bytes = 8)]
pub struct SyncManagerChannel {
    #[wire(bytes = 2)]
    pub physical_start_address: u16,
    #[wire(bytes = 2)]
    pub length_bytes: u16,
    #[wire(bytes = 1)]
    pub control: Control,
    #[wire(bytes = 1)]
    pub status: Status,
    #[wire(bytes = 2)]
    pub enable: Enable,
}

impl SyncManagerChannel {
    /// Configuration for the write (MainDevice → SubDevice) mailbox, conventionally SM0.
    ///
    /// Control byte `0x26`: mailbox mode, MainDevice write, DLS-user event enable.
    pub fn mailbox_write(physical_start_address: u16, length_bytes: u16) -> Self {
        Self {
            physical_start_address,
            length_bytes,
            control: Control {
                operation_mode: OperationMode::Mailbox,
                direction: Direction::MainDeviceWrite,
                dls_user_event_enable: true,
                ..Default::default()
            },
            status: Status::default(),
            enable: Enable {
                enable: true,
                ..Default::default()
            },
        }
    }

    /// Configuration for the read (SubDevice → MainDevice) mailbox, conventionally SM1.
    ///
    /// Control byte `0x22`: mailbox mode, MainDevice read, DLS-user event enable.
    pub fn mailbox_read(physical_start_address: u16, length_bytes: u16) -> Self {
        Self {
            physical_start_address,
            length_bytes,
            control: Control {
                operation_mode: OperationMode::Mailbox,
                direction: Direction::MainDeviceRead,
                dls_user_event_enable: true,
                ..Default::default()
            },
            status: Status::default(),
            enable: Enable {
                enable: true,
                ..Default::default()
            },
        }
    }

    /// Configuration for a process data SM.
    pub fn process_data(
        physical_start_address: u16,
        length_bytes: u16,
        direction: Direction,
    ) -> Self {
        Self {
            physical_start_address,
            length_bytes,
            control: Control {
                operation_mode: OperationMode::Normal,
                direction,
                ..Default::default()
            },
            status: Status::default(),
            enable: Enable {
                // A zero length SM must stay disabled
                enable: length_bytes > 0,
                ..Default::default()
            },
        }
    }
}

impl fmt::Debug for SyncManagerChannel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SyncManagerChannel")
            .field(
                "physical_start_address",
                &format_args!("{:#06x}", self.physical_start_address),
            )
            .field(
                "length_bytes",
                &format_args!("{:#06x} ({})", self.length_bytes, self.length_bytes),
            )
            .field("control", &self.control)
            .field("status", &self.status)
            .field("enable", &self.enable)
            .finish()
    }
}

impl fmt::Display for SyncManagerChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!(
            "start {:#06x}, size {:#06x} ({}), direction {:?}, mode {:?}, {}",
            self.physical_start_address,
            self.length_bytes,
            self.length_bytes,
            self.control.direction,
            self.control.operation_mode,
            if self.enable.enable {
                "enabled"
            } else {
                "disabled"
            },
        ))
    }
}

/// SM control byte.
#[derive(Default, Copy, Clone, Debug, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[wire(bytes = 1)]
pub struct Control {
    #[wire(bits = 2)]
    pub operation_mode: OperationMode,
    #[wire(bits = 2)]
    pub direction: Direction,
    #[wire(bits = 1)]
    pub ecat_event_enable: bool,
    #[wire(bits = 1)]
    pub dls_user_event_enable: bool,
    #[wire(bits = 1, post_skip = 1)]
    pub watchdog_enable: bool,
}

/// SM status byte.
///
/// Bit 3 (`mailbox_full`) is the "new message present" indicator polled by the mailbox fetch
/// path.
#[derive(Default, Copy, Clone, Debug, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[wire(bytes = 1)]
pub struct Status {
    #[wire(bits = 1)]
    pub has_write_event: bool,
    #[wire(bits = 1, post_skip = 1)]
    pub has_read_event: bool,
    #[wire(bits = 1)]
    pub mailbox_full: bool,
    #[wire(bits = 2)]
    pub buffer_state: u8,
    #[wire(bits = 1)]
    pub read_buffer_open: bool,
    #[wire(bits = 1)]
    pub write_buffer_open: bool,
}

/// SM enable word.
///
/// Described in ETG1000.4 6.7.2 Sync Manager Attributes.
#[derive(Default, Copy, Clone, Debug, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[wire(bytes = 2)]
pub struct Enable {
    #[wire(bits = 1)]
    pub enable: bool,
    #[wire(bits = 1, post_skip = 4)]
    pub repeat: bool,
    /// DC Event 0 with EtherCAT write.
    #[wire(bits = 1)]
    pub enable_dc_event_bus_write: bool,
    /// DC Event 0 with local write.
    #[wire(bits = 1)]
    pub enable_dc_event_local_write: bool,
    #[wire(bits = 1)]
    pub channel_pdi_disabled: bool,
    #[wire(bits = 1, post_skip = 6)]
    pub repeat_ack: bool,
}

/// SM buffer mode.
#[derive(Default, Copy, Clone, Debug, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[wire(bits = 2)]
#[repr(u8)]
pub enum OperationMode {
    #[default]
    Normal = 0x00,
    Mailbox = 0x02,
}

/// SM transfer direction, from the MainDevice's point of view.
#[derive(Default, Copy, Clone, Debug, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[wire(bits = 2)]
#[repr(u8)]
pub enum Direction {
    #[default]
    MainDeviceRead = 0x00,
    MainDeviceWrite = 0x01,
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethercrab_wire::{EtherCrabWireRead, EtherCrabWireWriteSized};

    #[test]
    fn mailbox_write_control_byte() {
        let sm = SyncManagerChannel::mailbox_write(0x1000, 0x0080);

        let packed = sm.pack();

        assert_eq!(
            packed,
            [
                0x00, 0x10, // start address
                0x80, 0x00, // length
                0x26, // control: mailbox, MainDevice write, DLS-user event
                0x00, // status
                0x01, 0x00, // enabled
            ]
        );
    }

    #[test]
    fn mailbox_read_control_byte() {
        let sm = SyncManagerChannel::mailbox_read(0x10c0, 0x0080);

        assert_eq!(sm.pack()[4], 0x22);
    }

    #[test]
    fn zero_length_process_data_sm_is_disabled() {
        let sm = SyncManagerChannel::process_data(0x1200, 0, Direction::MainDeviceRead);

        assert!(!sm.enable.enable);
    }

    #[test]
    fn mailbox_full_bit() {
        let parsed = Status::unpack_from_slice(&[0x08]).unwrap();

        assert!(parsed.mailbox_full);

        let parsed = Status::unpack_from_slice(&[0x00]).unwrap();

        assert!(!parsed.mailbox_full);
    }

    #[test]
    fn decode_configured_mailbox_sm() {
        // SM1 read mailbox as configured by this engine, read back from a device
        let raw = [0xc0, 0x10, 0x80, 0x00, 0x22, 0x08, 0x01, 0x00];

        let parsed = SyncManagerChannel::unpack_from_slice(&raw).unwrap();

        assert_eq!(parsed.physical_start_address, 0x10c0);
        assert_eq!(parsed.length_bytes, 0x0080);
        assert_eq!(parsed.control.operation_mode, OperationMode::Mailbox);
        assert_eq!(parsed.control.direction, Direction::MainDeviceRead);
        assert!(parsed.status.mailbox_full);
        assert!(parsed.enable.enable);
    }
}
