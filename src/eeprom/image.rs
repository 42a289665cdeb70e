//! Parsing of a complete SII image into its category projection.
//!
//! An image lives outside any one SubDevice record so it can be shared between identical,
//! hot-swappable devices; the MainDevice keeps an identity-keyed arena of `Arc<SiiImage>`.

use super::types::{
    CategoryType, CoeDetails, DefaultMailbox, GeneralFlags, SiiGeneral, SiiSyncManager,
};
use crate::eeprom::SII_FIRST_CATEGORY;
use crate::error::{EepromError, Error};
use crate::mailbox::{MailboxProtocols, MailboxWindow};
use crate::pdo::{Pdo, PdoEntry};
use crate::subdevice::SubDeviceIdentity;
use alloc::string::String;
use alloc::vec::Vec;
use ethercrab_wire::EtherCrabWireRead;

/// SII PDO category header record (8 bytes).
#[derive(Debug, Copy, Clone, ethercrab_wire::EtherCrabWireRead)]
#[wire(bytes = 8)]
struct PdoRecord {
    #[wire(bytes = 2)]
    index: u16,
    #[wire(bytes = 1)]
    entry_count: u8,
    /// Sync manager this PDO is assigned to by default, `0xff` for unassigned.
    #[wire(bytes = 1)]
    sync_manager: u8,
    #[wire(bytes = 1)]
    _dc_sync: u8,
    #[wire(bytes = 1, post_skip = 16)]
    name_string_idx: u8,
}

/// SII PDO entry record (8 bytes).
#[derive(Debug, Copy, Clone, ethercrab_wire::EtherCrabWireRead)]
#[wire(bytes = 8)]
struct PdoEntryRecord {
    #[wire(bytes = 2)]
    index: u16,
    #[wire(bytes = 1)]
    sub_index: u8,
    #[wire(bytes = 1)]
    name_string_idx: u8,
    #[wire(bytes = 1)]
    _data_type: u8,
    #[wire(bytes = 1, post_skip = 16)]
    bit_length: u8,
}

/// A parsed SII image: the raw word array plus the projection the engine works from.
#[derive(Debug, Default)]
pub struct SiiImage {
    /// Raw image bytes (always an even count; the SII is word addressed).
    data: Vec<u8>,

    /// Device identity from the fixed header.
    pub identity: SubDeviceIdentity,
    /// Configured station alias from the fixed header.
    pub alias: u16,
    /// Bootstrap/standard mailbox windows and supported protocols.
    pub default_mailbox: DefaultMailbox,
    /// The general category, if present.
    pub general: Option<SiiGeneral>,
    /// Category strings, indexed from 1 on the wire (`strings[0]` is wire index 1).
    strings: Vec<String>,
    /// Sync manager descriptors in category order.
    pub sync_managers: Vec<SiiSyncManager>,
    /// Default TxPDO set (SubDevice → MainDevice).
    pub tx_pdos: Vec<Pdo>,
    /// Default RxPDO set (MainDevice → SubDevice).
    pub rx_pdos: Vec<Pdo>,
}

impl SiiImage {
    /// Parse a complete raw image.
    ///
    /// `data` must cover at least the fixed header (`0x0040` words). A parse failure marks the
    /// whole image unusable; the caller quarantines the SubDevice.
    pub fn parse(data: Vec<u8>) -> Result<Self, Error> {
        if data.len() < usize::from(SII_FIRST_CATEGORY) * 2 {
            return Err(Error::Eeprom(EepromError::Decode));
        }

        let mut image = Self {
            identity: SubDeviceIdentity::unpack_from_slice(&data[0x10..0x20])?,
            alias: word(&data, 0x0004).unwrap_or(0),
            default_mailbox: parse_default_mailbox(&data),
            data,
            ..Default::default()
        };

        // Strings first: the other categories resolve names against them, and nothing
        // guarantees the strings category precedes them in the chain.
        image.walk_categories(true)?;
        image.walk_categories(false)?;

        Ok(image)
    }

    /// Image length in words.
    pub fn len_words(&self) -> usize {
        self.data.len() / 2
    }

    /// Raw image bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Look up a category string by its 1-based wire index. Index 0 means "no string".
    pub fn string(&self, index: u8) -> Option<&str> {
        index
            .checked_sub(1)
            .and_then(|idx| self.strings.get(usize::from(idx)))
            .map(String::as_str)
    }

    /// The device name from the general category, if both are present.
    pub fn name(&self) -> Option<&str> {
        self.general
            .as_ref()
            .and_then(|general| self.string(general.name_string_idx))
    }

    fn walk_categories(&mut self, strings_pass: bool) -> Result<(), Error> {
        let mut cursor = usize::from(SII_FIRST_CATEGORY) * 2;

        loop {
            let Some(header) = self.data.get(cursor..cursor + 4) else {
                // Image ended without the 0xffff sentinel; tolerated, the walk is already
                // bounded by the image length.
                return Ok(());
            };

            let category = CategoryType::unpack_from_slice(&header[0..2])?;
            let len_bytes = usize::from(u16::unpack_from_slice(&header[2..4])?) * 2;

            if category == CategoryType::End {
                return Ok(());
            }

            let body = self
                .data
                .get(cursor + 4..cursor + 4 + len_bytes)
                .ok_or(Error::Eeprom(EepromError::SectionOverrun))?
                .to_vec();

            match category {
                CategoryType::Strings if strings_pass => self.strings = parse_strings(&body)?,
                CategoryType::General if !strings_pass => {
                    self.general = Some(parse_general(&body)?)
                }
                CategoryType::SyncManager if !strings_pass => {
                    for chunk in body.chunks_exact(8) {
                        self.sync_managers
                            .push(SiiSyncManager::unpack_from_slice(chunk)?);
                    }
                }
                CategoryType::TxPdo if !strings_pass => {
                    let mut pdos = parse_pdo_category(&body, &self.strings)?;

                    self.tx_pdos.append(&mut pdos);
                }
                CategoryType::RxPdo if !strings_pass => {
                    let mut pdos = parse_pdo_category(&body, &self.strings)?;

                    self.rx_pdos.append(&mut pdos);
                }
                // FMMU, DC and device specific categories are not needed for bringup
                other => {
                    if !strings_pass {
                        crate::fmt::trace!("Skipping SII category {:?}", other);
                    }
                }
            }

            cursor += 4 + len_bytes;
        }
    }
}

fn lookup(strings: &[String], index: u8) -> Option<&str> {
    index
        .checked_sub(1)
        .and_then(|idx| strings.get(usize::from(idx)))
        .map(String::as_str)
}

fn truncated(s: &str, max: usize) -> &str {
    if s.len() <= max {
        s
    } else {
        let mut end = max;

        while !s.is_char_boundary(end) {
            end -= 1;
        }

        &s[..end]
    }
}

fn word(data: &[u8], address: u16) -> Option<u16> {
    let at = usize::from(address) * 2;

    data.get(at..at + 2)
        .map(|raw| u16::from_le_bytes([raw[0], raw[1]]))
}

fn parse_default_mailbox(data: &[u8]) -> DefaultMailbox {
    let w = |address| word(data, address).unwrap_or(0);

    DefaultMailbox {
        bootstrap_write: MailboxWindow {
            offset: w(0x0014),
            len: w(0x0015),
        },
        bootstrap_read: MailboxWindow {
            offset: w(0x0016),
            len: w(0x0017),
        },
        standard_write: MailboxWindow {
            offset: w(0x0018),
            len: w(0x0019),
        },
        standard_read: MailboxWindow {
            offset: w(0x001a),
            len: w(0x001b),
        },
        supported_protocols: MailboxProtocols::from_bits_retain(w(0x001c)),
    }
}

fn parse_strings(body: &[u8]) -> Result<Vec<String>, Error> {
    let count = *body.first().ok_or(Error::Eeprom(EepromError::Decode))?;

    let mut strings = Vec::new();
    let mut cursor = 1usize;

    for _ in 0..count {
        let len = usize::from(*body.get(cursor).ok_or(Error::Eeprom(EepromError::Decode))?);

        let raw = body
            .get(cursor + 1..cursor + 1 + len)
            .ok_or(Error::Eeprom(EepromError::Decode))?;

        strings.push(String::from_utf8_lossy(raw).into_owned());

        cursor += 1 + len;
    }

    Ok(strings)
}

fn parse_general(body: &[u8]) -> Result<SiiGeneral, Error> {
    if body.len() < 18 {
        return Err(Error::Eeprom(EepromError::Decode));
    }

    let ports = u16::from_le_bytes([body[16], body[17]]);

    Ok(SiiGeneral {
        group_string_idx: body[0],
        image_string_idx: body[1],
        order_string_idx: body[2],
        name_string_idx: body[3],
        coe_details: CoeDetails::from_bits_retain(body[5]),
        foe_enabled: body[6] != 0,
        eoe_enabled: body[7] != 0,
        flags: GeneralFlags::from_bits_retain(body[11]),
        ebus_current: i16::from_le_bytes([body[12], body[13]]),
        ports: [
            (ports & 0x0f) as u8,
            ((ports >> 4) & 0x0f) as u8,
            ((ports >> 8) & 0x0f) as u8,
            ((ports >> 12) & 0x0f) as u8,
        ],
    })
}

fn parse_pdo_category(body: &[u8], strings: &[String]) -> Result<Vec<Pdo>, Error> {
    let mut pdos = Vec::new();
    let mut cursor = 0usize;

    while cursor + 8 <= body.len() {
        let record = PdoRecord::unpack_from_slice(&body[cursor..cursor + 8])?;

        cursor += 8;

        let mut pdo = Pdo {
            index: record.index,
            sync_manager: (record.sync_manager != 0xff).then_some(record.sync_manager),
            name: named(strings, record.name_string_idx),
            entries: Vec::new(),
        };

        for _ in 0..record.entry_count {
            let raw = body
                .get(cursor..cursor + 8)
                .ok_or(Error::Eeprom(EepromError::Decode))?;

            let entry = PdoEntryRecord::unpack_from_slice(raw)?;

            pdo.entries.push(PdoEntry {
                index: entry.index,
                sub_index: entry.sub_index,
                bit_length: entry.bit_length,
                name: named(strings, entry.name_string_idx),
            });

            cursor += 8;
        }

        pdos.push(pdo);
    }

    Ok(pdos)
}

fn named(strings: &[String], index: u8) -> heapless::String<64> {
    let mut name = heapless::String::new();

    if let Some(s) = lookup(strings, index) {
        let _ = name.push_str(truncated(s, name.capacity()));
    }

    name
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a minimal but structurally complete image for one device.
    pub(crate) fn fixture() -> Vec<u8> {
        let mut data = alloc::vec![0u8; 0x80];

        // Alias
        data[0x08..0x0a].copy_from_slice(&alias_bytes());
        // Identity
        data[0x10..0x14].copy_from_slice(&0x0000_000bu32.to_le_bytes());
        data[0x14..0x18].copy_from_slice(&0x0000_1234u32.to_le_bytes());
        data[0x18..0x1c].copy_from_slice(&1u32.to_le_bytes());
        data[0x1c..0x20].copy_from_slice(&42u32.to_le_bytes());

        // Standard mailbox: write 0x1000+128, read 0x1080+128
        data[0x30..0x32].copy_from_slice(&0x1000u16.to_le_bytes());
        data[0x32..0x34].copy_from_slice(&128u16.to_le_bytes());
        data[0x34..0x36].copy_from_slice(&0x1080u16.to_le_bytes());
        data[0x36..0x38].copy_from_slice(&128u16.to_le_bytes());
        // Protocols: CoE
        data[0x38..0x3a].copy_from_slice(&0x0004u16.to_le_bytes());

        // Categories: strings with one entry
        let strings: &[u8] = &[
            0x0a, 0x00, // type 10
            0x04, 0x00, // 4 words
            0x01, // count
            0x06, b'D', b'e', b'v', b'i', b'c', b'e', // "Device"
        ];

        // Sync managers: SM0/SM1 mailbox + SM3 inputs
        let sms: &[u8] = &[
            0x29, 0x00, // type 41
            0x0c, 0x00, // 12 words
            // SM0
            0x00, 0x10, 0x80, 0x00, 0x26, 0x00, 0x01, 0x01, //
            // SM1
            0x80, 0x10, 0x80, 0x00, 0x22, 0x00, 0x01, 0x02, //
            // SM3 inputs
            0x00, 0x11, 0x00, 0x00, 0x20, 0x00, 0x01, 0x04,
        ];

        // One TxPDO 0x1a00 with two entries, assigned to SM3
        let tx_pdo: &[u8] = &[
            0x32, 0x00, // type 50
            0x0c, 0x00, // 12 words
            0x00, 0x1a, // index
            0x02, // entries
            0x03, // SM3
            0x00, // dc
            0x00, // name idx
            0x00, 0x00, // flags
            // entry 0x6000:01, 16 bits
            0x00, 0x60, 0x01, 0x00, 0x00, 0x10, 0x00, 0x00, //
            // entry 0x6000:02, 16 bits
            0x00, 0x60, 0x02, 0x00, 0x00, 0x10, 0x00, 0x00,
        ];

        let end: &[u8] = &[0xff, 0xff, 0x00, 0x00];

        data.extend_from_slice(strings);
        data.extend_from_slice(sms);
        data.extend_from_slice(tx_pdo);
        data.extend_from_slice(end);

        data
    }

    fn alias_bytes() -> [u8; 2] {
        0x0fe1u16.to_le_bytes()
    }

    #[test]
    fn parse_fixture() {
        let image = SiiImage::parse(fixture()).unwrap();

        assert_eq!(image.identity.vendor_id, 0x0000_000b);
        assert_eq!(image.identity.product_id, 0x0000_1234);
        assert_eq!(image.identity.serial, 42);
        assert_eq!(image.alias, 0x0fe1);

        assert!(image.default_mailbox.has_mailbox());
        assert_eq!(image.default_mailbox.standard_write.offset, 0x1000);
        assert_eq!(image.default_mailbox.standard_read.offset, 0x1080);

        assert_eq!(image.sync_managers.len(), 3);
        assert_eq!(image.sync_managers[1].control, 0x22);

        assert_eq!(image.tx_pdos.len(), 1);

        let pdo = &image.tx_pdos[0];

        assert_eq!(pdo.index, 0x1a00);
        assert_eq!(pdo.sync_manager, Some(3));
        assert_eq!(pdo.entries.len(), 2);
        assert_eq!(pdo.entries[0].index, 0x6000);
        assert_eq!(pdo.entries[0].sub_index, 1);
        assert_eq!(pdo.entries[0].bit_length, 16);

        assert_eq!(image.string(1), Some("Device"));
        assert_eq!(image.string(0), None);
    }

    #[test]
    fn truncated_header_rejected() {
        assert!(SiiImage::parse(alloc::vec![0u8; 16]).is_err());
    }

    #[test]
    fn category_overrun_detected() {
        let mut data = fixture();

        // Corrupt the strings category length to point past the end of the image
        data[0x82] = 0xff;
        data[0x83] = 0x7f;

        assert!(matches!(
            SiiImage::parse(data),
            Err(Error::Eeprom(EepromError::SectionOverrun))
        ));
    }

    #[test]
    fn missing_sentinel_is_tolerated() {
        let mut data = fixture();

        // Drop the end marker
        data.truncate(data.len() - 4);

        assert!(SiiImage::parse(data).is_ok());
    }
}
