//! Process Data Object (PDO) tables: the assignment of PDOs to sync managers and the mapping
//! of object dictionary entries into each PDO.

use alloc::vec::Vec;

/// Inclusive index range of TxPDOs (SubDevice → MainDevice process data).
pub const TX_PDO_RANGE: core::ops::RangeInclusive<u16> = 0x1a00..=0x1bff;

/// Inclusive index range of RxPDOs (MainDevice → SubDevice process data).
pub const RX_PDO_RANGE: core::ops::RangeInclusive<u16> = 0x1600..=0x17ff;

/// One mapped entry inside a PDO.
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PdoEntry {
    /// Object dictionary index of the mapped variable, or `0` for padding entries.
    pub index: u16,
    /// Object dictionary subindex of the mapped variable.
    pub sub_index: u8,
    /// Size of the mapped variable in bits.
    pub bit_length: u8,
    /// Human readable name, if one is known.
    pub name: heapless::String<64>,
}

impl PdoEntry {
    /// Pack this entry into the `u32` written to a PDO mapping object
    /// (`index:16 ‖ subindex:8 ‖ bit length:8`).
    pub fn as_mapping(&self) -> u32 {
        u32::from(self.index) << 16 | u32::from(self.sub_index) << 8 | u32::from(self.bit_length)
    }

    /// Decode an entry from the `u32` read out of a PDO mapping object.
    pub fn from_mapping(raw: u32) -> Self {
        Self {
            index: (raw >> 16) as u16,
            sub_index: (raw >> 8) as u8,
            bit_length: raw as u8,
            name: heapless::String::new(),
        }
    }
}

// Entries are structurally equal if index, subindex and bit length match; names are display
// metadata only.
impl PartialEq for PdoEntry {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index
            && self.sub_index == other.sub_index
            && self.bit_length == other.bit_length
    }
}

impl Eq for PdoEntry {}

/// One PDO: a fixed-layout bundle of entries carried through one sync manager.
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Pdo {
    /// PDO index, `0x1600..=0x17ff` for RxPDOs and `0x1a00..=0x1bff` for TxPDOs.
    pub index: u16,
    /// The sync manager this PDO is assigned to, if any.
    pub sync_manager: Option<u8>,
    /// Human readable name, if one is known.
    pub name: heapless::String<64>,
    /// Mapped entries in wire order.
    pub entries: Vec<PdoEntry>,
}

impl Pdo {
    /// Total size of the mapped entries in bits.
    pub fn bit_length(&self) -> u16 {
        self.entries
            .iter()
            .map(|entry| u16::from(entry.bit_length))
            .sum()
    }

    /// `true` for a SubDevice → MainDevice (input) PDO.
    pub fn is_tx(&self) -> bool {
        TX_PDO_RANGE.contains(&self.index)
    }

    /// `true` for a MainDevice → SubDevice (output) PDO.
    pub fn is_rx(&self) -> bool {
        RX_PDO_RANGE.contains(&self.index)
    }
}

// PDO equality is index + entry list equality.
impl PartialEq for Pdo {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.entries == other.entries
    }
}

impl Eq for Pdo {}

/// Sum of the byte lengths of all PDOs in `pdos` assigned to sync manager `sm`, rounded up per
/// PDO.
pub(crate) fn sync_manager_size(pdos: &[Pdo], sm: u8) -> u16 {
    pdos.iter()
        .filter(|pdo| pdo.sync_manager == Some(sm))
        .map(|pdo| pdo.bit_length().div_ceil(8))
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(index: u16, sub_index: u8, bit_length: u8) -> PdoEntry {
        PdoEntry {
            index,
            sub_index,
            bit_length,
            name: heapless::String::new(),
        }
    }

    #[test]
    fn mapping_round_trip() {
        let original = entry(0x6000, 0x01, 16);

        let raw = original.as_mapping();

        assert_eq!(raw, 0x6000_0110);
        assert_eq!(PdoEntry::from_mapping(raw), original);
    }

    #[test]
    fn structural_equality_ignores_names() {
        let mut named = entry(0x6000, 0x01, 16);

        named.name.push_str("Channel 1").unwrap();

        assert_eq!(named, entry(0x6000, 0x01, 16));
        assert_ne!(named, entry(0x6000, 0x02, 16));
    }

    #[test]
    fn pdo_equality_is_entry_list_equality() {
        let a = Pdo {
            index: 0x1a00,
            sync_manager: Some(3),
            name: heapless::String::new(),
            entries: alloc::vec![entry(0x6000, 1, 16), entry(0x6000, 2, 16)],
        };

        let mut b = a.clone();
        b.sync_manager = None;

        assert_eq!(a, b);

        b.entries.pop();

        assert_ne!(a, b);
    }

    #[test]
    fn sm_size_sums_assigned_pdos() {
        let pdos = alloc::vec![
            Pdo {
                index: 0x1a00,
                sync_manager: Some(3),
                name: heapless::String::new(),
                entries: alloc::vec![entry(0x6000, 1, 16), entry(0x6000, 2, 16)],
            },
            Pdo {
                index: 0x1a01,
                sync_manager: Some(3),
                name: heapless::String::new(),
                entries: alloc::vec![entry(0x6010, 1, 4)],
            },
            Pdo {
                index: 0x1600,
                sync_manager: Some(2),
                name: heapless::String::new(),
                entries: alloc::vec![entry(0x7000, 1, 8)],
            },
        ];

        // 32 bits + 4 bits rounded up per PDO: 4 + 1
        assert_eq!(sync_manager_size(&pdos, 3), 5);
        assert_eq!(sync_manager_size(&pdos, 2), 1);
        assert_eq!(sync_manager_size(&pdos, 4), 0);
    }
}
