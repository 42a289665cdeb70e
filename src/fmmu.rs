//! Fieldbus Memory Management Unit (FMMU) configuration, registers `0x0600` onwards.

use core::fmt;

/// One FMMU entity: maps a window of the MainDevice's flat logical address space onto a local
/// register or sync manager window, with a direction.
///
/// ETG1000.4 Table 56 – Fieldbus memory management unit (FMMU) entity.
#[derive(Default, Copy, Clone, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[wire(bytes = 16)]
pub struct Fmmu {
    /// Start address in octets in the logical memory area of the memory translation.
    #[wire(bytes = 4)]
    pub logical_start_address: u32,

    #[wire(bytes = 2)]
    pub length_bytes: u16,

    #[wire(bits = 3, post_skip = 5)]
    pub logical_start_bit: u8,

    #[wire(bits = 3, post_skip = 5)]
    pub logical_end_bit: u8,

    #[wire(bytes = 2)]
    pub physical_start_address: u16,

    #[wire(bits = 3, post_skip = 5)]
    pub physical_start_bit: u8,

    #[wire(bits = 1)]
    pub read_enable: bool,

    #[wire(bits = 1, post_skip = 6)]
    pub write_enable: bool,

    #[wire(bits = 1, post_skip = 31)]
    pub enable: bool,
}

impl Fmmu {
    /// A byte-aligned mapping of `length_bytes` logical bytes onto a physical window.
    pub fn byte_aligned(
        logical_start_address: u32,
        physical_start_address: u16,
        length_bytes: u16,
        read_enable: bool,
        write_enable: bool,
    ) -> Self {
        Self {
            logical_start_address,
            length_bytes,
            logical_start_bit: 0,
            logical_end_bit: 7,
            physical_start_address,
            physical_start_bit: 0,
            read_enable,
            write_enable,
            enable: true,
        }
    }
}

impl fmt::Debug for Fmmu {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Fmmu")
            .field(
                "logical_start_address",
                &format_args!("{:#010x}", self.logical_start_address),
            )
            .field("length_bytes", &self.length_bytes)
            .field("logical_start_bit", &self.logical_start_bit)
            .field("logical_end_bit", &self.logical_end_bit)
            .field(
                "physical_start_address",
                &format_args!("{:#06x}", self.physical_start_address),
            )
            .field("physical_start_bit", &self.physical_start_bit)
            .field("read_enable", &self.read_enable)
            .field("write_enable", &self.write_enable)
            .field("enable", &self.enable)
            .finish()
    }
}

impl fmt::Display for Fmmu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!(
            "logical start {:#010x}:{}, size {}, physical start {:#06x}:{}, {}{}, {}",
            self.logical_start_address,
            self.logical_start_bit,
            self.length_bytes,
            self.physical_start_address,
            self.physical_start_bit,
            if self.read_enable { "R" } else { "" },
            if self.write_enable { "W" } else { "" },
            if self.enable { "enabled" } else { "disabled" },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethercrab_wire::{EtherCrabWireRead, EtherCrabWireSized, EtherCrabWireWriteSized};

    #[test]
    fn default_is_zero() {
        assert_eq!(Fmmu::default().pack(), [0u8; 16]);
    }

    #[test]
    fn size() {
        assert_eq!(Fmmu::PACKED_LEN, 16);
    }

    #[test]
    fn byte_aligned_mapping() {
        let fmmu = Fmmu::byte_aligned(0x0000_0004, 0x1100, 4, true, false);

        assert_eq!(
            fmmu.pack(),
            [
                0x04, 0x00, 0x00, 0x00, // logical start
                0x04, 0x00, // length
                0x00, // logical start bit
                0x07, // logical end bit
                0x00, 0x11, // physical start
                0x00, // physical start bit
                0x01, // read enable
                0x01, // FMMU enable
                0x00, 0x00, 0x00, // padding
            ]
        );
    }

    #[test]
    fn decode_one() {
        let raw = [
            0x00, 0x00, 0x00, 0x00, //
            0x01, 0x00, //
            0x00, //
            0x03, //
            0x00, 0x10, //
            0x00, //
            0x01, //
            0x01, //
            0x00, 0x00, 0x00,
        ];

        let fmmu = Fmmu::unpack_from_slice(&raw).unwrap();

        assert_eq!(
            fmmu,
            Fmmu {
                logical_start_address: 0,
                length_bytes: 1,
                logical_start_bit: 0,
                logical_end_bit: 3,
                physical_start_address: 0x1000,
                physical_start_bit: 0,
                read_enable: true,
                write_enable: false,
                enable: true,
            }
        );
    }
}
