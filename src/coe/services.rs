//! Constructors and classifiers for the CoE services used by the SDO state machine.
//!
//! All payloads produced and consumed here start at the CoE header, i.e. they are what goes
//! after the 6 byte mailbox header on the wire.

use super::{
    CoeHeader, CoeService, EmergencyMessage, InitSdoFlags, InitSdoHeader, SdoInfoHeader,
    SdoInfoOpCode, SegmentSdoHeader,
};
use crate::coe::abort_code::CoeAbortCode;
use alloc::vec::Vec;
use ethercrab_wire::{EtherCrabWireRead, EtherCrabWireWrite};

/// Size of an SDO init request/response header, from the CoE header to the start of payload
/// data.
pub(crate) const INIT_HEADER_SIZE: usize = 10;

/// Size of an SDO segment request/response header, from the CoE header to the start of segment
/// data.
pub(crate) const SEGMENT_HEADER_SIZE: usize = 3;

/// "All objects" list type selector for Get OD List.
const OD_LIST_ALL: u16 = 0x0001;

/// An SDO upload request (SubDevice → MainDevice transfer of one object).
pub(crate) fn upload_request(index: u16, sub_index: u8, complete_access: bool) -> [u8; 10] {
    let mut buf = [0u8; 10];

    CoeHeader {
        service: CoeService::SdoRequest,
    }
    .pack_to_slice_unchecked(&mut buf[0..2]);

    InitSdoHeader {
        flags: InitSdoFlags {
            size_indicator: false,
            expedited_transfer: false,
            size: 0,
            complete_access,
            command: InitSdoFlags::UPLOAD_REQUEST,
        },
        index,
        sub_index,
    }
    .pack_to_slice_unchecked(&mut buf[2..6]);

    buf
}

/// A follow-up segment request for a segmented upload.
pub(crate) fn upload_segment_request(toggle: bool) -> [u8; 10] {
    let mut buf = [0u8; 10];

    CoeHeader {
        service: CoeService::SdoRequest,
    }
    .pack_to_slice_unchecked(&mut buf[0..2]);

    SegmentSdoHeader {
        is_last_segment: false,
        segment_data_size: 0,
        toggle,
        command: SegmentSdoHeader::UPLOAD_SEGMENT_REQUEST,
    }
    .pack_to_slice_unchecked(&mut buf[2..3]);

    buf
}

/// An expedited SDO download request carrying up to 4 data bytes inline.
pub(crate) fn download_expedited_request(
    index: u16,
    sub_index: u8,
    complete_access: bool,
    data: &[u8],
) -> [u8; 10] {
    debug_assert!(data.len() <= 4);

    let mut buf = [0u8; 10];

    CoeHeader {
        service: CoeService::SdoRequest,
    }
    .pack_to_slice_unchecked(&mut buf[0..2]);

    InitSdoHeader {
        flags: InitSdoFlags {
            size_indicator: true,
            expedited_transfer: true,
            size: 4u8.saturating_sub(data.len() as u8),
            complete_access,
            command: InitSdoFlags::DOWNLOAD_REQUEST,
        },
        index,
        sub_index,
    }
    .pack_to_slice_unchecked(&mut buf[2..6]);

    buf[6..6 + data.len()].copy_from_slice(data);

    buf
}

/// The initial request of a normal (non-expedited) download: complete size plus as much of the
/// first chunk as fits.
pub(crate) fn download_normal_request(
    index: u16,
    sub_index: u8,
    complete_access: bool,
    complete_size: u32,
    first_chunk: &[u8],
) -> Vec<u8> {
    let mut buf = Vec::with_capacity(INIT_HEADER_SIZE + first_chunk.len());

    buf.resize(INIT_HEADER_SIZE, 0);

    CoeHeader {
        service: CoeService::SdoRequest,
    }
    .pack_to_slice_unchecked(&mut buf[0..2]);

    InitSdoHeader {
        flags: InitSdoFlags {
            size_indicator: true,
            expedited_transfer: false,
            size: 0,
            complete_access,
            command: InitSdoFlags::DOWNLOAD_REQUEST,
        },
        index,
        sub_index,
    }
    .pack_to_slice_unchecked(&mut buf[2..6]);

    buf[6..10].copy_from_slice(&complete_size.to_le_bytes());

    buf.extend_from_slice(first_chunk);

    buf
}

/// A download segment request.
///
/// Segments shorter than [`SegmentSdoHeader::MIN_DATA_SIZE`] are padded up to it, with the
/// number of filler bytes recorded in the header.
pub(crate) fn download_segment_request(toggle: bool, is_last_segment: bool, data: &[u8]) -> Vec<u8> {
    let (padding, seg_data_size) = if data.len() < SegmentSdoHeader::MIN_DATA_SIZE {
        (
            SegmentSdoHeader::MIN_DATA_SIZE - data.len(),
            (SegmentSdoHeader::MIN_DATA_SIZE - data.len()) as u8,
        )
    } else {
        (0, 0)
    };

    let mut buf = Vec::with_capacity(SEGMENT_HEADER_SIZE + data.len() + padding);

    buf.resize(SEGMENT_HEADER_SIZE, 0);

    CoeHeader {
        service: CoeService::SdoRequest,
    }
    .pack_to_slice_unchecked(&mut buf[0..2]);

    SegmentSdoHeader {
        is_last_segment,
        segment_data_size: seg_data_size,
        toggle,
        command: SegmentSdoHeader::DOWNLOAD_SEGMENT_REQUEST,
    }
    .pack_to_slice_unchecked(&mut buf[2..3]);

    buf.extend_from_slice(data);
    buf.resize(buf.len() + padding, 0);

    buf
}

/// A Get OD List request for all objects in the dictionary.
pub(crate) fn od_list_request() -> [u8; 8] {
    let mut buf = [0u8; 8];

    info_header(SdoInfoOpCode::GetObjectDescriptionListRequest, &mut buf);

    buf[6..8].copy_from_slice(&OD_LIST_ALL.to_le_bytes());

    buf
}

/// A Get Object Description request for one object index.
pub(crate) fn object_description_request(index: u16) -> [u8; 8] {
    let mut buf = [0u8; 8];

    info_header(SdoInfoOpCode::GetObjectDescriptionRequest, &mut buf);

    buf[6..8].copy_from_slice(&index.to_le_bytes());

    buf
}

/// A Get Entry Description request for one subindex of one object.
pub(crate) fn entry_description_request(index: u16, sub_index: u8) -> [u8; 10] {
    let mut buf = [0u8; 10];

    info_header(SdoInfoOpCode::GetEntryDescriptionRequest, &mut buf);

    buf[6..8].copy_from_slice(&index.to_le_bytes());
    buf[8] = sub_index;
    // value info: no extra elements requested
    buf[9] = 0x00;

    buf
}

fn info_header(op_code: SdoInfoOpCode, buf: &mut [u8]) {
    CoeHeader {
        service: CoeService::SdoInformation,
    }
    .pack_to_slice_unchecked(&mut buf[0..2]);

    SdoInfoHeader {
        op_code,
        incomplete: false,
        fragments_left: 0,
    }
    .pack_to_slice_unchecked(&mut buf[2..6]);
}

/// Decode an emergency message, if `payload` is one.
///
/// Messages shorter than the nominal 10 bytes are zero filled; devices in the field do emit
/// them.
pub(crate) fn parse_emergency(payload: &[u8]) -> Option<EmergencyMessage> {
    let header = CoeHeader::unpack_from_slice(payload).ok()?;

    if header.service != CoeService::Emergency {
        return None;
    }

    let mut padded = [0u8; 10];
    let take = payload.len().min(10);

    padded[0..take].copy_from_slice(&payload[0..take]);

    let mut data = [0u8; 5];

    data.copy_from_slice(&padded[5..10]);

    Some(EmergencyMessage {
        error_code: u16::from_le_bytes([padded[2], padded[3]]),
        error_register: padded[4],
        data,
    })
}

/// Decode an SDO abort response, returning the echoed address and the abort code.
pub(crate) fn parse_abort(payload: &[u8]) -> Option<(u16, u8, CoeAbortCode)> {
    let header = InitSdoHeader::unpack_from_slice(payload.get(2..6)?).ok()?;

    if header.flags.command != InitSdoFlags::ABORT_REQUEST {
        return None;
    }

    let code = payload
        .get(6..10)
        .map(|raw| u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
        .unwrap_or(0);

    Some((header.index, header.sub_index, CoeAbortCode::from(code)))
}
