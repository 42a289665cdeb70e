//! Servo profile over EtherCAT (SoE) wire structures.
//!
//! Only the single-fragment IDN write path is implemented, enough to apply drive parameter
//! lists during SubDevice configuration. Values too large for one mailbox message are rejected
//! rather than fragmented.

use crate::error::{Error, MailboxError};
use alloc::vec::Vec;
use ethercrab_wire::{EtherCrabWireRead, EtherCrabWireWriteSized};

/// Size of the SoE header on the wire.
pub(crate) const SOE_HEADER_LEN: usize = 4;

/// SoE operation, ETG1000.6 5.7.
#[derive(Debug, Copy, Clone, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[wire(bits = 3)]
#[repr(u8)]
pub enum SoeOpCode {
    ReadRequest = 0x01,
    ReadResponse = 0x02,
    WriteRequest = 0x03,
    WriteResponse = 0x04,
    Notification = 0x05,
}

/// The 4 byte SoE header.
#[derive(Debug, Copy, Clone, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[wire(bytes = 4)]
pub struct SoeHeader {
    #[wire(bits = 3)]
    pub op_code: SoeOpCode,
    /// More fragments follow.
    #[wire(bits = 1)]
    pub incomplete: bool,
    /// The response carries an error code instead of data.
    #[wire(bits = 1)]
    pub error: bool,
    /// Drive number within the SubDevice.
    #[wire(bits = 3)]
    pub drive_no: u8,
    /// Element selection bitmap; `0x40` selects the value element.
    #[wire(bytes = 1)]
    pub elements: u8,
    /// The addressed IDN, or the fragments-left count on non-final fragments.
    #[wire(bytes = 2)]
    pub idn: u16,
}

/// Element flag selecting the value of an IDN.
pub(crate) const SOE_ELEMENT_VALUE: u8 = 0x40;

/// One IDN write from an application-supplied SoE configuration list.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SoeConfigItem {
    /// Drive number within the SubDevice.
    pub drive_no: u8,
    /// The IDN to write.
    pub idn: u16,
    /// Value bytes.
    pub data: Vec<u8>,
}

/// Build the mailbox payload of a single-fragment IDN write.
pub(crate) fn write_request(item: &SoeConfigItem) -> Vec<u8> {
    let mut buf = Vec::with_capacity(SOE_HEADER_LEN + item.data.len());

    buf.extend_from_slice(
        &SoeHeader {
            op_code: SoeOpCode::WriteRequest,
            incomplete: false,
            error: false,
            drive_no: item.drive_no,
            elements: SOE_ELEMENT_VALUE,
            idn: item.idn,
        }
        .pack(),
    );

    buf.extend_from_slice(&item.data);

    buf
}

/// Classify the mailbox payload answering an IDN write.
///
/// Returns the SoE error code reported by the drive, if any.
pub(crate) fn parse_write_response(payload: &[u8]) -> Result<(), Error> {
    let header = SoeHeader::unpack_from_slice(payload)?;

    if header.op_code != SoeOpCode::WriteResponse {
        return Err(Error::Mailbox(MailboxError::ProtocolMismatch));
    }

    if header.error {
        let code = payload
            .get(SOE_HEADER_LEN..SOE_HEADER_LEN + 2)
            .map(|raw| u16::from_le_bytes([raw[0], raw[1]]))
            .unwrap_or(0);

        crate::fmt::error!(
            "SoE write to drive {} IDN {:#06x} failed: {:#06x}",
            header.drive_no,
            header.idn,
            code
        );

        return Err(Error::Mailbox(MailboxError::Soe {
            idn: header.idn,
            code,
        }));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_request_layout() {
        let item = SoeConfigItem {
            drive_no: 1,
            idn: 0x0064,
            data: alloc::vec![0xaa, 0xbb],
        };

        let buf = write_request(&item);

        // op 3 | drive 1 << 5, elements 0x40, IDN
        assert_eq!(buf, &[0x23, 0x40, 0x64, 0x00, 0xaa, 0xbb]);
    }

    #[test]
    fn error_response_reports_code() {
        // Write response, error bit set, error code 0x7002
        let payload = [0x14, 0x40, 0x64, 0x00, 0x02, 0x70];

        assert!(matches!(
            parse_write_response(&payload),
            Err(Error::Mailbox(MailboxError::Soe {
                idn: 0x0064,
                code: 0x7002,
            }))
        ));
    }

    #[test]
    fn ok_response() {
        let payload = [0x04, 0x40, 0x64, 0x00];

        assert!(parse_write_response(&payload).is_ok());
    }
}
