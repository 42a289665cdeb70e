//! A datagram is the unit of wire work: one command, its payload and its working counter,
//! tracked from creation through send and receive.

use crate::command::Command;
use crate::error::{Error, Item};
use crate::time::Instant;
use crate::LEN_MASK;
use alloc::vec::Vec;
use ethercrab_wire::{EtherCrabWireRead, EtherCrabWireSized, EtherCrabWireWrite, WireError};

/// Size of the datagram header on the wire: command, index, 4 address bytes, flags, IRQ.
pub(crate) const DATAGRAM_HEADER_LEN: usize = 10;

/// Size of the working counter trailer following the payload.
pub(crate) const WKC_LEN: usize = 2;

/// Observable lifecycle state of a [`Datagram`].
///
/// `Queued → Sent` is set by the frame assembly path, `Sent → {Received, TimedOut, Error}` by the
/// receive/timeout path. All other transitions are made by the owning state machine.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum DatagramState {
    /// Freshly created, not yet handed to the engine.
    #[default]
    Init,
    /// Waiting in the transmit queue.
    Queued,
    /// On the wire, awaiting the returning frame.
    Sent,
    /// The reply arrived and the payload/working counter are valid.
    Received,
    /// No reply arrived within the datagram timeout, including retries.
    TimedOut,
    /// The reply failed validation or the transport reported an error.
    Error,
    /// The reply was structurally invalid.
    Invalid,
}

/// The flags word following the address in a datagram header.
///
/// Contains the 11 bit payload length, the circulating bit and the "more PDUs follow" bit
/// (ETG1000.4 Table 14).
#[derive(Default, Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct PduFlags {
    /// Data length of this PDU.
    pub length: u16,
    /// `true` if the frame has circulated once.
    pub circulated: bool,
    /// `true` if another PDU follows this one in the same frame.
    pub more_follows: bool,
}

impl PduFlags {
    pub const fn with_len(len: u16) -> Self {
        Self {
            length: len,
            circulated: false,
            more_follows: false,
        }
    }
}

impl EtherCrabWireSized for PduFlags {
    const PACKED_LEN: usize = 2;

    type Buffer = [u8; 2];

    fn buffer() -> Self::Buffer {
        [0u8; 2]
    }
}

impl EtherCrabWireWrite for PduFlags {
    fn pack_to_slice_unchecked<'buf>(&self, buf: &'buf mut [u8]) -> &'buf [u8] {
        let raw = self.length & LEN_MASK
            | (self.circulated as u16) << 14
            | (self.more_follows as u16) << 15;

        raw.pack_to_slice_unchecked(buf)
    }

    fn packed_len(&self) -> usize {
        Self::PACKED_LEN
    }
}

impl EtherCrabWireRead for PduFlags {
    fn unpack_from_slice(buf: &[u8]) -> Result<Self, WireError> {
        let raw = u16::unpack_from_slice(buf)?;

        Ok(Self {
            length: raw & LEN_MASK,
            circulated: (raw >> 14) & 0x01 == 0x01,
            more_follows: (raw >> 15) & 0x01 == 0x01,
        })
    }
}

/// One EtherCAT datagram: a command addressing a window of SubDevice or logical memory, an owned
/// payload buffer and the working counter filled in from the reply.
#[derive(Debug, Clone)]
pub struct Datagram {
    pub(crate) command: Command,
    /// MainDevice-assigned index, stamped when the datagram is queued for transmission.
    pub(crate) index: u8,
    data: Vec<u8>,
    pub(crate) working_counter: u16,
    state: DatagramState,
    /// Expected working counter; `None` disables the check (e.g. broadcasts and tolerated
    /// writes).
    pub(crate) expected_wkc: Option<u16>,
    pub(crate) sent_at: Option<Instant>,
    pub(crate) received_at: Option<Instant>,
    /// Number of times the reply to this datagram was missing when the engine looked for it.
    pub(crate) skip_count: u8,
    /// Human readable label for logging.
    pub(crate) name: &'static str,
}

impl Datagram {
    fn prealloc(len: usize) -> Result<Vec<u8>, Error> {
        let mut data = Vec::new();

        data.try_reserve_exact(len)
            .map_err(|_| Error::Capacity(Item::Datagram))?;

        data.resize(len, 0);

        Ok(data)
    }

    /// Create a read datagram with a zeroed payload of `len` bytes.
    pub fn read(command: impl Into<Command>, len: u16, name: &'static str) -> Result<Self, Error> {
        Ok(Self {
            command: command.into(),
            index: 0,
            data: Self::prealloc(usize::from(len))?,
            working_counter: 0,
            state: DatagramState::Init,
            expected_wkc: Some(1),
            sent_at: None,
            received_at: None,
            skip_count: 0,
            name,
        })
    }

    /// Create a write datagram carrying a copy of `payload`.
    pub fn write(
        command: impl Into<Command>,
        payload: &[u8],
        name: &'static str,
    ) -> Result<Self, Error> {
        let mut data = Self::prealloc(payload.len())?;

        data.copy_from_slice(payload);

        Ok(Self {
            command: command.into(),
            index: 0,
            data,
            working_counter: 0,
            state: DatagramState::Init,
            expected_wkc: Some(1),
            sent_at: None,
            received_at: None,
            skip_count: 0,
            name,
        })
    }

    /// Create a write datagram of `len` zeroed bytes with `payload` copied into its start.
    ///
    /// Used for writes that must cover a whole window (e.g. a full mailbox) with a shorter
    /// message at its beginning.
    pub fn write_padded(
        command: impl Into<Command>,
        payload: &[u8],
        len: u16,
        name: &'static str,
    ) -> Result<Self, Error> {
        let len = usize::from(len);

        if payload.len() > len {
            return Err(Error::Pdu(crate::error::PduError::TooLong));
        }

        let mut data = Self::prealloc(len)?;

        data[0..payload.len()].copy_from_slice(payload);

        Ok(Self {
            command: command.into(),
            index: 0,
            data,
            working_counter: 0,
            state: DatagramState::Init,
            expected_wkc: Some(1),
            sent_at: None,
            received_at: None,
            skip_count: 0,
            name,
        })
    }

    /// Disable the working counter check for this datagram.
    pub fn ignore_wkc(mut self) -> Self {
        self.expected_wkc = None;

        self
    }

    /// Change the expected working counter from its default of 1.
    pub fn with_wkc(mut self, wkc: u16) -> Self {
        self.expected_wkc = Some(wkc);

        self
    }

    /// Create an independent datagram with the same command, payload and label, ready to be
    /// queued again.
    pub fn repeat(&self) -> Self {
        Self {
            command: self.command,
            index: 0,
            data: self.data.clone(),
            working_counter: 0,
            state: DatagramState::Init,
            expected_wkc: self.expected_wkc,
            sent_at: None,
            received_at: None,
            skip_count: 0,
            name: self.name,
        }
    }

    /// The command this datagram carries.
    pub fn command(&self) -> Command {
        self.command
    }

    /// Current lifecycle state.
    pub fn state(&self) -> DatagramState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: DatagramState) {
        self.state = state;
    }

    /// The payload as received (for reads) or as queued (for writes).
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub(crate) fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// The working counter from the reply.
    pub fn working_counter(&self) -> u16 {
        self.working_counter
    }

    /// Number of times the engine looked for this datagram's reply and found it missing.
    pub fn skip_count(&self) -> u8 {
        self.skip_count
    }

    /// When the datagram was last put on the wire.
    pub fn sent_at(&self) -> Option<Instant> {
        self.sent_at
    }

    /// When the reply arrived.
    pub fn received_at(&self) -> Option<Instant> {
        self.received_at
    }

    /// Check the received state and working counter, mapping failures to errors.
    pub(crate) fn check(&self) -> Result<&[u8], Error> {
        match self.state {
            DatagramState::Received => {
                if let Some(expected) = self.expected_wkc {
                    if self.working_counter != expected {
                        return Err(Error::WorkingCounter {
                            expected,
                            received: self.working_counter,
                        });
                    }
                }

                Ok(&self.data)
            }
            DatagramState::TimedOut => Err(Error::Timeout),
            _ => Err(Error::Pdu(crate::error::PduError::InvalidState)),
        }
    }

    /// Length of this datagram on the wire, including header and working counter trailer.
    pub(crate) fn wire_len(&self) -> usize {
        DATAGRAM_HEADER_LEN + self.data.len() + WKC_LEN
    }

    /// Write the datagram header and payload into `buf`, returning the number of bytes written.
    ///
    /// The working counter trailer is zeroed; SubDevices increment it in flight.
    pub(crate) fn pack_into(&self, buf: &mut [u8], more_follows: bool) -> Result<usize, Error> {
        let total = self.wire_len();

        let buf = buf
            .get_mut(0..total)
            .ok_or(Error::Capacity(Item::Frame))?;

        buf[0] = self.command.code();
        buf[1] = self.index;
        buf[2..6].copy_from_slice(&self.command.address());

        let flags = PduFlags {
            length: self.data.len() as u16,
            circulated: false,
            more_follows,
        };

        flags.pack_to_slice_unchecked(&mut buf[6..8]);

        // IRQ field, unused by this engine
        buf[8..10].copy_from_slice(&[0, 0]);

        buf[DATAGRAM_HEADER_LEN..DATAGRAM_HEADER_LEN + self.data.len()]
            .copy_from_slice(&self.data);

        buf[total - WKC_LEN..total].copy_from_slice(&[0, 0]);

        Ok(total)
    }
}
