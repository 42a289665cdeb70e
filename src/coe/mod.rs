//! CANopen over EtherCAT (CoE) wire structures.

pub mod abort_code;
pub mod services;

/// Defined in ETG1000.6 5.6.1 Table 29 – CoE elements.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[cfg_attr(test, derive(arbitrary::Arbitrary))]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[wire(bytes = 2)]
pub struct CoeHeader {
    // number: u9, reserved: u3
    #[wire(pre_skip = 12, bits = 4)]
    pub service: CoeService,
}

/// Defined in ETG1000.6 Table 29 – CoE elements.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[cfg_attr(test, derive(arbitrary::Arbitrary))]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum CoeService {
    /// Emergency
    Emergency = 0x01,
    /// SDO Request
    SdoRequest = 0x02,
    /// SDO Response
    SdoResponse = 0x03,
    /// TxPDO
    TxPdo = 0x04,
    /// RxPDO
    RxPdo = 0x05,
    /// TxPDO remote request
    TxPdoRemoteRequest = 0x06,
    /// RxPDO remote request
    RxPdoRemoteRequest = 0x07,
    /// SDO Information
    SdoInformation = 0x08,
}

/// The flags byte opening an SDO transfer header.
///
/// Defined in ETG1000.6 Section 5.6.2.1.1.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[wire(bytes = 1)]
pub struct InitSdoFlags {
    #[wire(bits = 1)]
    pub size_indicator: bool,
    #[wire(bits = 1)]
    pub expedited_transfer: bool,
    /// For expedited transfers, the number of unused bytes in the 4 byte data field.
    #[wire(bits = 2)]
    pub size: u8,
    #[wire(bits = 1)]
    pub complete_access: bool,
    #[wire(bits = 3)]
    pub command: u8,
}

impl InitSdoFlags {
    pub const DOWNLOAD_REQUEST: u8 = 0x01;
    pub const DOWNLOAD_RESPONSE: u8 = 0x03;
    pub const UPLOAD_REQUEST: u8 = 0x02;
    pub const UPLOAD_RESPONSE: u8 = 0x02;
    pub const ABORT_REQUEST: u8 = 0x04;
}

/// The 4 byte header of a non-segmented SDO request or response.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[wire(bytes = 4)]
pub struct InitSdoHeader {
    #[wire(bytes = 1)]
    pub flags: InitSdoFlags,
    #[wire(bytes = 2)]
    pub index: u16,
    #[wire(bytes = 1)]
    pub sub_index: u8,
}

/// The single byte header of an SDO segment request or response.
///
/// Defined in ETG1000.6 5.6.2.3.1.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[wire(bytes = 1)]
pub struct SegmentSdoHeader {
    #[wire(bits = 1)]
    pub is_last_segment: bool,

    /// Number of filler bytes when the segment carries fewer than 7 data bytes, `0x00` to
    /// `0x07`.
    #[wire(bits = 3)]
    pub segment_data_size: u8,

    #[wire(bits = 1)]
    pub toggle: bool,

    #[wire(bits = 3)]
    pub command: u8,
}

impl SegmentSdoHeader {
    pub const DOWNLOAD_SEGMENT_REQUEST: u8 = 0x00;
    pub const DOWNLOAD_SEGMENT_RESPONSE: u8 = 0x01;
    pub const UPLOAD_SEGMENT_REQUEST: u8 = 0x03;

    /// Segments always carry at least this many data bytes on the wire; shorter payloads are
    /// padded and the padding recorded in `segment_data_size`.
    pub const MIN_DATA_SIZE: usize = 7;
}

/// Header of an SDO Information service request or response.
///
/// Defined in ETG1000.6 5.6.3.2.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[wire(bytes = 4)]
pub struct SdoInfoHeader {
    #[wire(bits = 7)]
    pub op_code: SdoInfoOpCode,
    #[wire(bits = 1, post_skip = 8)]
    pub incomplete: bool,
    /// Number of fragments that follow this one.
    #[wire(bytes = 2)]
    pub fragments_left: u16,
}

/// SDO Information service operation, ETG1000.6 5.6.3.2.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum SdoInfoOpCode {
    GetObjectDescriptionListRequest = 0x01,
    GetObjectDescriptionListResponse = 0x02,
    GetObjectDescriptionRequest = 0x03,
    GetObjectDescriptionResponse = 0x04,
    GetEntryDescriptionRequest = 0x05,
    GetEntryDescriptionResponse = 0x06,
    SdoInfoErrorRequest = 0x07,
}

/// A decoded CoE emergency message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct EmergencyMessage {
    /// Error code, e.g. `0x8130` heartbeat lost.
    pub error_code: u16,
    /// CANopen error register.
    pub error_register: u8,
    /// Manufacturer specific detail bytes.
    pub data: [u8; 5],
}

impl core::fmt::Display for EmergencyMessage {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "emergency: code {:#06x}, register {:#04x}, data {:02x?}",
            self.error_code, self.error_register, self.data
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethercrab_wire::{
        EtherCrabWireRead, EtherCrabWireSized, EtherCrabWireWrite, EtherCrabWireWriteSized,
    };

    #[test]
    #[cfg_attr(miri, ignore)]
    fn coe_header_fuzz() {
        heckcheck::check(|header: CoeHeader| {
            let mut buf = [0u8; { CoeHeader::PACKED_LEN }];

            let packed = header.pack_to_slice_unchecked(&mut buf);

            let unpacked = CoeHeader::unpack_from_slice(packed).expect("Unpack");

            pretty_assertions::assert_eq!(header, unpacked);

            Ok(())
        });
    }

    #[test]
    fn coe_header_service_nibble() {
        let packed = CoeHeader {
            service: CoeService::SdoRequest,
        }
        .pack();

        // Service lives in the top nibble of the second byte
        assert_eq!(packed, [0x00, 0x20]);
    }

    #[test]
    fn segment_header_bits() {
        let header = SegmentSdoHeader {
            is_last_segment: true,
            segment_data_size: 5,
            toggle: true,
            command: SegmentSdoHeader::DOWNLOAD_SEGMENT_REQUEST,
        };

        // last(1) | size(101 << 1) | toggle(1 << 4) | command(000 << 5)
        assert_eq!(header.pack(), [0b0001_1011]);
    }

    #[test]
    fn info_header_round_trip() {
        let header = SdoInfoHeader {
            op_code: SdoInfoOpCode::GetObjectDescriptionListResponse,
            incomplete: true,
            fragments_left: 3,
        };

        let packed = header.pack();

        assert_eq!(packed, [0x82, 0x00, 0x03, 0x00]);

        assert_eq!(SdoInfoHeader::unpack_from_slice(&packed), Ok(header));
    }
}
