//! EtherCAT frame assembly and parsing.
//!
//! A frame is a 2 byte header followed by one or more datagrams. Ethernet encapsulation (MAC
//! addresses, EtherType `0x88a4`, FCS) is the transport adapter's responsibility; this module
//! begins at the EtherCAT frame header.

use crate::datagram::{Datagram, PduFlags, DATAGRAM_HEADER_LEN, WKC_LEN};
use crate::error::{Error, Item, PduError};
use crate::LEN_MASK;
use ethercrab_wire::{EtherCrabWireRead, EtherCrabWireSized, EtherCrabWireWrite, WireError};

/// Size of the EtherCAT frame header.
pub(crate) const FRAME_HEADER_LEN: usize = 2;

#[derive(Debug, Copy, Clone, PartialEq, Eq, ethercrab_wire::EtherCrabWireRead)]
#[repr(u8)]
pub(crate) enum ProtocolType {
    DlPdu = 0x01u8,
}

/// An EtherCAT frame header: 11 bit payload length and 4 bit protocol type.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct FrameHeader {
    pub payload_len: u16,
    pub protocol: ProtocolType,
}

impl EtherCrabWireSized for FrameHeader {
    const PACKED_LEN: usize = FRAME_HEADER_LEN;

    type Buffer = [u8; FRAME_HEADER_LEN];

    fn buffer() -> Self::Buffer {
        [0u8; FRAME_HEADER_LEN]
    }
}

impl EtherCrabWireRead for FrameHeader {
    fn unpack_from_slice(buf: &[u8]) -> Result<Self, WireError> {
        let raw = u16::unpack_from_slice(buf)?;

        Ok(Self {
            payload_len: raw & LEN_MASK,
            protocol: ProtocolType::try_from((raw >> 12) as u8)?,
        })
    }
}

impl EtherCrabWireWrite for FrameHeader {
    fn pack_to_slice_unchecked<'buf>(&self, buf: &'buf mut [u8]) -> &'buf [u8] {
        let raw = self.payload_len | (self.protocol as u16) << 12;

        raw.pack_to_slice_unchecked(buf)
    }

    fn packed_len(&self) -> usize {
        Self::PACKED_LEN
    }
}

impl FrameHeader {
    /// Create a new PDU frame header.
    pub fn pdu(len: u16) -> Self {
        debug_assert!(
            len <= LEN_MASK,
            "Frame length may not exceed {} bytes",
            LEN_MASK
        );

        Self {
            payload_len: len & LEN_MASK,
            protocol: ProtocolType::DlPdu,
        }
    }
}

/// Pack `datagrams` into `buf` as one EtherCAT frame, setting the more-follows bit on all but
/// the last. Returns the number of bytes written.
pub(crate) fn pack_frame(datagrams: &[Datagram], buf: &mut [u8]) -> Result<usize, Error> {
    let payload_len: usize = datagrams.iter().map(Datagram::wire_len).sum();

    if payload_len > usize::from(LEN_MASK) {
        return Err(Error::Capacity(Item::Frame));
    }

    let total = FRAME_HEADER_LEN + payload_len;

    if buf.len() < total {
        return Err(Error::Capacity(Item::Frame));
    }

    FrameHeader::pdu(payload_len as u16).pack_to_slice_unchecked(&mut buf[0..FRAME_HEADER_LEN]);

    let mut cursor = FRAME_HEADER_LEN;

    for (position, datagram) in datagrams.iter().enumerate() {
        let more_follows = position + 1 < datagrams.len();

        cursor += datagram.pack_into(&mut buf[cursor..], more_follows)?;
    }

    Ok(total)
}

/// One datagram parsed out of a received frame.
#[derive(Debug, Copy, Clone)]
pub(crate) struct ReceivedPdu<'buf> {
    pub command_code: u8,
    pub index: u8,
    pub address: [u8; 4],
    pub data: &'buf [u8],
    pub working_counter: u16,
}

/// Iterator over the datagrams of a received EtherCAT frame.
pub(crate) struct FramePdus<'buf> {
    payload: &'buf [u8],
    cursor: usize,
    /// Cleared once a datagram without the more-follows bit has been yielded.
    more: bool,
}

/// Parse the frame header and return an iterator over the contained datagrams.
pub(crate) fn parse_frame(buf: &[u8]) -> Result<FramePdus<'_>, Error> {
    let header =
        FrameHeader::unpack_from_slice(buf).map_err(|_| Error::Pdu(PduError::Decode))?;

    let payload = buf
        .get(FRAME_HEADER_LEN..FRAME_HEADER_LEN + usize::from(header.payload_len))
        .ok_or(Error::Pdu(PduError::Decode))?;

    Ok(FramePdus {
        payload,
        cursor: 0,
        more: true,
    })
}

impl<'buf> Iterator for FramePdus<'buf> {
    type Item = Result<ReceivedPdu<'buf>, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if !self.more || self.cursor + DATAGRAM_HEADER_LEN > self.payload.len() {
            return None;
        }

        let header = &self.payload[self.cursor..];

        let command_code = header[0];
        let index = header[1];
        let address = [header[2], header[3], header[4], header[5]];

        let flags = match PduFlags::unpack_from_slice(&header[6..8]) {
            Ok(flags) => flags,
            Err(e) => return Some(Err(Error::Wire(e))),
        };

        let data_start = self.cursor + DATAGRAM_HEADER_LEN;
        let data_end = data_start + usize::from(flags.length);

        let Some(data) = self.payload.get(data_start..data_end) else {
            return Some(Err(Error::Pdu(PduError::Decode)));
        };

        let Some(wkc_bytes) = self.payload.get(data_end..data_end + WKC_LEN) else {
            return Some(Err(Error::Pdu(PduError::Decode)));
        };

        let working_counter = u16::from_le_bytes([wkc_bytes[0], wkc_bytes[1]]);

        self.cursor = data_end + WKC_LEN;
        self.more = flags.more_follows;

        Some(Ok(ReceivedPdu {
            command_code,
            index,
            address,
            data,
            working_counter,
        }))
    }
}
