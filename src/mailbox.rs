//! Mailbox envelope framing and classification.
//!
//! A mailbox message is a 6 byte header followed by a protocol payload, carried in the write
//! mailbox (SM0) or read mailbox (SM1) window of a SubDevice's DPRAM.

use crate::command::Command;
use crate::datagram::Datagram;
use crate::error::{Error, MailboxError};
use crate::register::RegisterAddress;
use crate::sync_manager_channel::Status;
use alloc::vec::Vec;
use ethercrab_wire::{EtherCrabWireRead, EtherCrabWireWriteSized};

/// Size of the mailbox header on the wire.
pub(crate) const MAILBOX_HEADER_LEN: usize = 6;

/// Mailbox message priority.
#[derive(Default, Copy, Clone, Debug, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[cfg_attr(test, derive(arbitrary::Arbitrary))]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum Priority {
    #[default]
    Lowest = 0x00,
    Low = 0x01,
    High = 0x02,
    Highest = 0x03,
}

/// Mailbox protocol type tag.
#[derive(Copy, Clone, Debug, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[cfg_attr(test, derive(arbitrary::Arbitrary))]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum MailboxType {
    /// Error reply (ERR).
    Err = 0x00,
    /// ADS over EtherCAT (AoE).
    Aoe = 0x01,
    /// Ethernet over EtherCAT (EoE).
    Eoe = 0x02,
    /// CAN application protocol over EtherCAT (CoE).
    Coe = 0x03,
    /// File Access over EtherCAT (FoE).
    Foe = 0x04,
    /// Servo profile over EtherCAT (SoE).
    Soe = 0x05,
    // 0x06-0x0e reserved
    /// Vendor specific.
    VendorSpecific = 0x0f,
}

/// Mailbox header.
///
/// Defined in ETG1000.6 under either `TMBXHEADER` or `MbxHeader`, e.g. Table 29 – CoE Elements.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[wire(bytes = 6)]
pub struct MailboxHeader {
    /// Payload length following this header.
    #[wire(bytes = 2)]
    pub length: u16,
    /// Station address of the message source (replies) or destination (requests).
    #[wire(bytes = 2)]
    pub address: u16,
    #[wire(pre_skip = 6, bits = 2)]
    pub priority: Priority,
    #[wire(bits = 4)]
    pub mailbox_type: MailboxType,
    /// Mailbox counter from 1 to 7 inclusive. Wraps around to 1 when the count exceeds 7. 0 is
    /// reserved.
    #[wire(bits = 3, post_skip = 1)]
    pub counter: u8,
}

/// Error codes carried in a standard mailbox error reply (`type == 0`).
///
/// Defined in ETG1000.4 Table 30 – Error reply service data.
#[derive(Debug, Copy, Clone, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[repr(u16)]
pub enum MailboxErrorCode {
    /// Syntax of 6 octet mailbox header is wrong.
    Syntax = 0x0001,
    /// The mailbox protocol is not supported.
    UnsupportedProtocol = 0x0002,
    /// Channel field contains wrong value.
    InvalidChannel = 0x0003,
    /// The service in the mailbox protocol is not supported.
    ServiceNotSupported = 0x0004,
    /// The mailbox protocol header of the mailbox protocol is wrong.
    InvalidHeader = 0x0005,
    /// Length of received mailbox data is too short.
    SizeTooShort = 0x0006,
    /// Mailbox protocol cannot be processed because of limited resources.
    NoMoreMemory = 0x0007,
    /// The length of data is inconsistent.
    InvalidSize = 0x0008,
    /// Unknown error code.
    #[wire(catch_all)]
    Unknown(u16),
}

impl core::fmt::Display for MailboxErrorCode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            MailboxErrorCode::Syntax => "header syntax",
            MailboxErrorCode::UnsupportedProtocol => "unsupported protocol",
            MailboxErrorCode::InvalidChannel => "invalid channel",
            MailboxErrorCode::ServiceNotSupported => "service not supported",
            MailboxErrorCode::InvalidHeader => "invalid protocol header",
            MailboxErrorCode::SizeTooShort => "size too short",
            MailboxErrorCode::NoMoreMemory => "no more memory",
            MailboxErrorCode::InvalidSize => "invalid size",
            MailboxErrorCode::Unknown(_) => "unknown",
        };

        write!(f, "{:#06x} ({})", u16::from(*self), s)
    }
}

bitflags::bitflags! {
    /// Mailbox protocols supported by a SubDevice, advertised in SII word `0x001C`.
    ///
    /// Defined in ETG1000.6 Table 18.
    #[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    pub struct MailboxProtocols: u16 {
        /// ADS over EtherCAT.
        const AOE = 0x0001;
        /// Ethernet over EtherCAT.
        const EOE = 0x0002;
        /// CAN application protocol over EtherCAT.
        const COE = 0x0004;
        /// File access over EtherCAT.
        const FOE = 0x0008;
        /// Servo profile over EtherCAT.
        const SOE = 0x0010;
        /// Vendor specific protocol.
        const VOE = 0x0020;
    }
}

/// One mailbox direction's configured window: a physical start address and a length.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct MailboxWindow {
    /// Physical start address in SubDevice DPRAM.
    pub offset: u16,
    /// Window length in bytes.
    pub len: u16,
}

/// The effective mailbox configuration of one SubDevice: the write (MainDevice → SubDevice)
/// window carried by SM0 and the read window carried by SM1.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct MailboxConfig {
    /// MainDevice → SubDevice window (SM0).
    pub write: MailboxWindow,
    /// SubDevice → MainDevice window (SM1).
    pub read: MailboxWindow,
}

impl MailboxConfig {
    /// `true` if both windows are usable.
    pub fn is_configured(&self) -> bool {
        self.write.len > 0 && self.read.len > 0
    }

    /// Largest mailbox payload (after the 6 byte header) the write window can carry.
    pub fn max_write_payload(&self) -> u16 {
        self.write.len.saturating_sub(MAILBOX_HEADER_LEN as u16)
    }
}

/// Per-protocol receive buffers for replies fetched on behalf of another consumer.
///
/// When two state machines wait on the same read mailbox, only the holder of the mailbox read
/// lock polls and fetches; whatever arrives is deposited here by protocol, and the other party
/// consumes it from its slot instead of issuing its own fetch.
#[derive(Debug, Default)]
pub(crate) struct ProtocolBuffers {
    coe: Option<Vec<u8>>,
    soe: Option<Vec<u8>>,
}

impl ProtocolBuffers {
    /// Deposit a fetched payload into the slot for `mailbox_type`.
    ///
    /// Payloads for protocols nobody listens to are dropped with a log message.
    pub(crate) fn deposit(&mut self, mailbox_type: MailboxType, payload: &[u8]) {
        let slot = match mailbox_type {
            MailboxType::Coe => &mut self.coe,
            MailboxType::Soe => &mut self.soe,
            other => {
                crate::fmt::debug!("Dropping unconsumed {:?} mailbox payload", other);

                return;
            }
        };

        if slot.is_some() {
            crate::fmt::warn!("Overwriting undelivered {:?} mailbox payload", mailbox_type);
        }

        *slot = Some(payload.to_vec());
    }

    /// Take a deposited payload for `mailbox_type`, if any.
    pub(crate) fn take(&mut self, mailbox_type: MailboxType) -> Option<Vec<u8>> {
        match mailbox_type {
            MailboxType::Coe => self.coe.take(),
            MailboxType::Soe => self.soe.take(),
            _ => None,
        }
    }

    pub(crate) fn clear(&mut self) {
        self.coe = None;
        self.soe = None;
    }
}

/// Build the FPWR datagram posting `payload` into the SubDevice's write mailbox.
///
/// The datagram covers the whole configured window; SubDevices only act on a write of the
/// complete mailbox area.
pub(crate) fn prepare_send(
    station_address: u16,
    config: &MailboxConfig,
    mailbox_type: MailboxType,
    counter: u8,
    payload: &[u8],
) -> Result<Datagram, Error> {
    if !config.is_configured() {
        return Err(Error::Mailbox(MailboxError::NoMailbox));
    }

    if payload.len() + MAILBOX_HEADER_LEN > usize::from(config.write.len) {
        return Err(Error::Mailbox(MailboxError::TooLong {
            address: 0,
            sub_index: 0,
        }));
    }

    let header = MailboxHeader {
        length: payload.len() as u16,
        address: station_address,
        priority: Priority::Lowest,
        mailbox_type,
        counter,
    };

    let mut message = Vec::new();

    message.try_reserve_exact(MAILBOX_HEADER_LEN + payload.len())
        .map_err(|_| Error::Capacity(crate::error::Item::MailboxBuffer))?;

    message.extend_from_slice(&header.pack());
    message.extend_from_slice(payload);

    Datagram::write_padded(
        Command::fpwr(station_address, config.write.offset),
        &message,
        config.write.len,
        "mailbox send",
    )
}

/// Build the FPRD datagram polling the read mailbox's SM1 status byte.
pub(crate) fn prepare_check(station_address: u16) -> Result<Datagram, Error> {
    Datagram::read(
        Command::fprd(station_address, RegisterAddress::sync_manager_status(1)),
        1,
        "mailbox check",
    )
}

/// `true` if an SM1 status byte reply indicates a new message is present.
pub(crate) fn message_available(status_byte: &[u8]) -> Result<bool, Error> {
    let status = Status::unpack_from_slice(status_byte)?;

    Ok(status.mailbox_full)
}

/// Build the FPRD datagram fetching the whole configured read mailbox window.
pub(crate) fn prepare_fetch(
    station_address: u16,
    config: &MailboxConfig,
) -> Result<Datagram, Error> {
    if !config.is_configured() {
        return Err(Error::Mailbox(MailboxError::NoMailbox));
    }

    Datagram::read(
        Command::fprd(station_address, config.read.offset),
        config.read.len,
        "mailbox fetch",
    )
}

/// Parse a fetched read mailbox window into its header and payload.
///
/// A `type == 0` reply is decoded as the standard mailbox error list and surfaced as
/// [`MailboxError::ErrorReply`].
pub(crate) fn fetch(config: &MailboxConfig, data: &[u8]) -> Result<(MailboxHeader, Vec<u8>), Error> {
    let header = MailboxHeader::unpack_from_slice(data)?;

    let declared = usize::from(header.length);

    if MAILBOX_HEADER_LEN + declared > usize::from(config.read.len) || data.len() < MAILBOX_HEADER_LEN + declared
    {
        return Err(Error::Mailbox(MailboxError::Truncated));
    }

    let payload = &data[MAILBOX_HEADER_LEN..MAILBOX_HEADER_LEN + declared];

    if header.mailbox_type == MailboxType::Err {
        // Error reply payload: u16 service type (0x01), u16 error code
        let code = payload
            .get(2..4)
            .map(|raw| u16::from_le_bytes([raw[0], raw[1]]))
            .unwrap_or(0);

        let code = MailboxErrorCode::from(code);

        crate::fmt::error!("Mailbox error reply: {}", code);

        return Err(Error::Mailbox(MailboxError::ErrorReply(code)));
    }

    Ok((header, payload.to_vec()))
}

/// The cycling 1..=7 counter placed in outgoing mailbox headers.
///
/// 0 is reserved, so the sequence wraps from 7 back to 1.
pub(crate) fn next_counter(current: u8) -> u8 {
    if current >= 7 { 1 } else { current + 1 }
}
