//! Error types for the lifecycle engine.

pub use crate::coe::abort_code::CoeAbortCode;
pub use crate::mailbox::MailboxErrorCode;
use crate::{al_status_code::AlStatusCode, command::Command, subdevice_state::SubDeviceState};

/// A carapace error.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum Error {
    /// A low level error occurred when producing or consuming a datagram.
    Pdu(PduError),
    /// A working counter (WKC) error was encountered.
    WorkingCounter {
        /// The expected working counter value.
        expected: u16,
        /// The actual value received.
        received: u16,
    },
    /// Something timed out.
    Timeout,
    /// An SII (EEPROM) error was encountered.
    Eeprom(EepromError),
    /// A fixed size buffer or table was not large enough to hold a given item type.
    Capacity(Item),
    /// A string was too long to fit in a fixed size buffer.
    StringTooLong {
        /// The length of the fixed size buffer.
        max_length: usize,
        /// The length of the input string.
        string_length: usize,
    },
    /// A mailbox error was encountered.
    Mailbox(MailboxError),
    /// A SubDevice does not advertise a capability required for the requested operation.
    Capability(Capability),
    /// An item in a list could not be found.
    NotFound {
        /// Item kind.
        item: Item,

        /// An index into a list of items.
        index: Option<usize>,
    },
    /// An internal error occurred. This indicates something that shouldn't happen within
    /// carapace.
    Internal,
    /// There is a problem with the discovered EtherCAT SubDevice topology.
    Topology,
    /// An error was read back from a SubDevice when attempting to transition to a new state.
    StateTransition,
    /// An invalid state was encountered.
    InvalidState {
        /// The desired state.
        expected: SubDeviceState,

        /// The actual state.
        actual: SubDeviceState,

        /// SubDevice address.
        configured_address: u16,
    },
    /// An error occurred encoding or decoding an item.
    Wire(ethercrab_wire::WireError),
    /// A SubDevice produced an error.
    SubDevice(AlStatusCode),
    /// The operation was cancelled, e.g. by the application detaching a SubDevice configuration
    /// or by engine shutdown.
    Cancelled,
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::Pdu(e) => write!(f, "pdu: {}", e),
            Error::WorkingCounter { expected, received } => {
                write!(f, "working counter expected {}, got {}", expected, received)
            }
            Error::Timeout => f.write_str("timeout"),
            Error::Eeprom(e) => write!(f, "eeprom: {}", e),
            Error::Capacity(item) => write!(f, "not enough capacity for {:?}", item),
            Error::StringTooLong {
                max_length,
                string_length,
            } => write!(
                f,
                "string of {} bytes is too long to fit in max storage of {} bytes",
                string_length, max_length
            ),
            Error::Mailbox(e) => write!(f, "mailbox: {}", e),
            Error::Capability(c) => write!(f, "capability not advertised: {}", c),
            Error::NotFound { item, index } => {
                write!(f, "item kind {:?} not found (index: {:?})", item, index)
            }
            Error::Internal => f.write_str("internal error"),
            Error::Topology => f.write_str("topology"),
            Error::StateTransition => {
                f.write_str("a SubDevice failed to transition to a new state")
            }
            Error::InvalidState {
                expected,
                actual,
                configured_address,
            } => write!(
                f,
                "SubDevice {:#06x} state is invalid: {}, expected {}",
                configured_address, actual, expected
            ),
            Error::Wire(e) => write!(f, "wire encode/decode error: {}", e),
            Error::SubDevice(e) => write!(f, "SubDevice error: {}", e),
            Error::Cancelled => f.write_str("operation cancelled"),
        }
    }
}

/// The kind of item being looked for or allocated.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum Item {
    /// An EtherCAT SubDevice.
    SubDevice,
    /// A datagram payload buffer.
    Datagram,
    /// A whole EtherCAT frame.
    Frame,
    /// Process Data Object.
    Pdo,
    /// A PDO entry.
    PdoEntry,
    /// Fieldbus Memory Management Unit.
    Fmmu,
    /// Sync Manager.
    SyncManager,
    /// A mailbox receive buffer.
    MailboxBuffer,
    /// An object dictionary entry.
    DictionaryObject,
    /// An application request.
    Request,
}

/// A SubDevice capability that an operation requires but the device does not advertise.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum Capability {
    /// No mailbox is configured at all.
    Mailbox,
    /// CoE is not in the supported protocol set.
    Coe,
    /// SoE is not in the supported protocol set.
    Soe,
    /// The device has a fixed PDO assignment.
    PdoAssignment,
    /// The device has a fixed PDO mapping.
    PdoConfiguration,
    /// No distributed clock support.
    DistributedClocks,
}

impl core::fmt::Display for Capability {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Capability::Mailbox => f.write_str("mailbox"),
            Capability::Coe => f.write_str("CoE"),
            Capability::Soe => f.write_str("SoE"),
            Capability::PdoAssignment => f.write_str("configurable PDO assignment"),
            Capability::PdoConfiguration => f.write_str("configurable PDO mapping"),
            Capability::DistributedClocks => f.write_str("distributed clocks"),
        }
    }
}

/// Low-level PDU (Process Data Unit) error.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum PduError {
    /// Failed to decode raw PDU data into a given data type.
    Decode,
    /// PDU data is too long to fit in the given buffer.
    TooLong,
    /// A frame index was given that does not point to an in-flight datagram.
    InvalidIndex(u8),
    /// A received frame is invalid.
    Validation(PduValidationError),
    /// The datagram was not in a state where it could be sent or reused.
    InvalidState,
}

impl core::fmt::Display for PduError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            PduError::Decode => f.write_str("failed to decode raw PDU data into type"),
            PduError::TooLong => f.write_str("data is too long to fit in given buffer"),
            PduError::InvalidIndex(index) => write!(f, "invalid PDU index {}", index),
            PduError::Validation(e) => write!(f, "received PDU validation failed: {}", e),
            PduError::InvalidState => f.write_str("invalid PDU state"),
        }
    }
}

/// Mailbox error.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum MailboxError {
    /// The mailbox operation was aborted.
    Aborted {
        /// Abort code.
        code: CoeAbortCode,
        /// The address used in the operation.
        address: u16,
        /// The subindex used in the operation.
        sub_index: u8,
    },
    /// Mailbox data is too long to fit in the given type or configured mailbox window.
    TooLong {
        /// The address used in the operation.
        address: u16,
        /// The subindex used in the operation.
        sub_index: u8,
    },
    /// A SubDevice has no mailbox but requires one for a given action.
    NoMailbox,
    /// The response to a mailbox action is invalid.
    SdoResponseInvalid {
        /// The address used in the operation.
        address: u16,
        /// The subindex used in the operation.
        sub_index: u8,
    },
    /// The received reply is shorter than its declared length, or its declared length exceeds
    /// the configured mailbox window.
    Truncated,
    /// The received reply carries an unexpected protocol type.
    ProtocolMismatch,
    /// The SubDevice returned a standard mailbox error reply.
    ErrorReply(MailboxErrorCode),
    /// SubDevice sent an emergency message.
    Emergency {
        /// Error code.
        error_code: u16,
        /// Error register.
        error_register: u8,
    },
    /// A drive answered an SoE request with an error code.
    Soe {
        /// The addressed IDN.
        idn: u16,
        /// SoE error code.
        code: u16,
    },
}

impl core::fmt::Display for MailboxError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            MailboxError::Aborted {
                code,
                address,
                sub_index,
            } => write!(f, "{:#06x}:{} aborted: {}", address, sub_index, code),
            MailboxError::TooLong { address, sub_index } => write!(
                f,
                "{:#06x}:{} returned data is too long",
                address, sub_index
            ),
            MailboxError::NoMailbox => f.write_str("device has no mailbox"),
            MailboxError::SdoResponseInvalid { address, sub_index } => write!(
                f,
                "{:#06x}:{} invalid response from device",
                address, sub_index
            ),
            MailboxError::Truncated => f.write_str("mailbox reply truncated"),
            MailboxError::ProtocolMismatch => f.write_str("unexpected mailbox protocol"),
            MailboxError::ErrorReply(code) => write!(f, "mailbox error reply: {}", code),
            MailboxError::Emergency {
                error_code,
                error_register,
            } => write!(
                f,
                "emergency: code {:#06x}, register {:#04x}",
                error_code, error_register
            ),
            MailboxError::Soe { idn, code } => {
                write!(f, "SoE IDN {:#06x} error {:#06x}", idn, code)
            }
        }
    }
}

/// SII (EEPROM) error.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum EepromError {
    /// Failed to decode data from EEPROM.
    Decode,
    /// A category in the category chain overruns the hard image size cap, or the end sentinel is
    /// missing.
    SectionOverrun,
    /// The device reported an error while executing the read operation.
    Device,
    /// The EEPROM was still loading after the load timeout expired.
    StillLoading,
    /// A general EEPROM error occurred.
    General,
}

impl core::fmt::Display for EepromError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            EepromError::Decode => f.write_str("failed to decode data"),
            EepromError::SectionOverrun => f.write_str("category chain overruns size cap"),
            EepromError::Device => f.write_str("device reported a read error"),
            EepromError::StillLoading => f.write_str("EEPROM not loaded within timeout"),
            EepromError::General => f.write_str("general EEPROM error"),
        }
    }
}

/// A received datagram failed to validate against the one that was sent.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum PduValidationError {
    /// The index of the received PDU does not match that of the sent one.
    IndexMismatch {
        /// Sent index.
        sent: u8,
        /// Received index.
        received: u8,
    },
    /// The received command does not match the one sent.
    CommandMismatch {
        /// Sent command.
        sent: Command,
        /// Received command.
        received: Command,
    },
}

impl core::fmt::Display for PduValidationError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::IndexMismatch { sent, received } => {
                write!(f, "PDU index mismatch: sent {}, received {}", sent, received)
            }
            Self::CommandMismatch { sent, received } => {
                write!(
                    f,
                    "PDU command mismatch: sent {}, received {}",
                    sent, received
                )
            }
        }
    }
}

impl From<PduError> for Error {
    fn from(e: PduError) -> Self {
        Self::Pdu(e)
    }
}

impl From<EepromError> for Error {
    fn from(e: EepromError) -> Self {
        Self::Eeprom(e)
    }
}

impl From<MailboxError> for Error {
    fn from(e: MailboxError) -> Self {
        Self::Mailbox(e)
    }
}

impl From<PduValidationError> for PduError {
    fn from(e: PduValidationError) -> Self {
        Self::Validation(e)
    }
}

impl From<ethercrab_wire::WireError> for Error {
    fn from(value: ethercrab_wire::WireError) -> Self {
        Self::Wire(value)
    }
}
