//! CoE SDO transfer state machines: upload, download and object dictionary enumeration over a
//! shared mailbox exchange substrate.

use crate::coe::services::{self, INIT_HEADER_SIZE, SEGMENT_HEADER_SIZE};
use crate::coe::{CoeHeader, CoeService, InitSdoFlags, InitSdoHeader, SdoInfoHeader, SdoInfoOpCode, SegmentSdoHeader};
use crate::datagram::{Datagram, DatagramState};
use crate::error::{Error, MailboxError};
use crate::fsm::{Ctx, Step};
use crate::mailbox::{self, MailboxType};
use crate::sdo::{SdoDictionary, SdoEntryAccess, SdoEntryInfo, SdoInfo};
use crate::subdevice::{MailboxLockOwner, MailboxPermit, SubDevice};
use crate::time::Instant;
use alloc::vec::Vec;
use core::time::Duration;
use ethercrab_wire::EtherCrabWireRead;

/// One request → response mailbox exchange.
///
/// Handles posting the request, cooperating on the per-SubDevice mailbox read lock, polling
/// the read mailbox status bit, fetching the reply and absorbing emergency messages. Replies
/// belonging to other protocols are deposited in the SubDevice's protocol buffers; replies
/// for this exchange that another lock holder fetched are consumed from there.
#[derive(Debug)]
pub(crate) struct MailboxExchange {
    owner: MailboxLockOwner,
    protocol: MailboxType,
    request: Vec<u8>,
    state: ExchangeState,
    /// Base of the send retry and response timeouts.
    started: Instant,
    response_timeout: Duration,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum ExchangeState {
    Idle,
    Send,
    Poll,
    Fetch,
    WaitDeposit,
}

impl MailboxExchange {
    pub(crate) fn new(
        owner: MailboxLockOwner,
        protocol: MailboxType,
        response_timeout: Duration,
    ) -> Self {
        Self {
            owner,
            protocol,
            request: Vec::new(),
            state: ExchangeState::Idle,
            started: Instant::ZERO,
            response_timeout,
        }
    }

    /// Post `request` (mailbox payload, protocol header onwards) and begin waiting for the
    /// response.
    pub(crate) fn start(
        &mut self,
        ctx: &Ctx,
        sub: &mut SubDevice,
        request: Vec<u8>,
    ) -> Step<Vec<u8>> {
        self.request = request;
        self.started = ctx.now;

        self.send(sub)
    }

    /// Resume waiting for another response without re-sending the request.
    ///
    /// Used when a response was structurally invalid (not fatal, the real one may still
    /// arrive) and for the follow-up fragments of SDO Information responses. The response
    /// timeout restarts.
    pub(crate) fn repoll(&mut self, ctx: &Ctx, sub: &mut SubDevice) -> Step<Vec<u8>> {
        self.started = ctx.now;

        self.enter_poll(sub)
    }

    fn send(&mut self, sub: &mut SubDevice) -> Step<Vec<u8>> {
        let counter = sub.mailbox.next_counter();

        match mailbox::prepare_send(
            sub.configured_address,
            &sub.mailbox.config,
            self.protocol,
            counter,
            &self.request,
        ) {
            Ok(datagram) => {
                self.state = ExchangeState::Send;

                Step::Send(datagram)
            }
            Err(e) => Step::Failed(e),
        }
    }

    fn enter_poll(&mut self, sub: &mut SubDevice) -> Step<Vec<u8>> {
        match sub.mailbox.try_lock(self.owner) {
            MailboxPermit::Acquired => {
                self.state = ExchangeState::Poll;

                match mailbox::prepare_check(sub.configured_address) {
                    Ok(datagram) => Step::Send(datagram),
                    Err(e) => Step::Failed(e),
                }
            }
            MailboxPermit::ForeignInFlight => {
                self.state = ExchangeState::WaitDeposit;

                Step::Wait
            }
        }
    }

    fn expired(&self, ctx: &Ctx) -> bool {
        ctx.now.duration_since(self.started) >= self.response_timeout
    }

    pub(crate) fn step(
        &mut self,
        ctx: &Ctx,
        sub: &mut SubDevice,
        reply: Option<&Datagram>,
    ) -> Step<Vec<u8>> {
        match self.state {
            ExchangeState::Idle => Step::Wait,

            ExchangeState::Send => {
                let Some(reply) = reply else {
                    return Step::Wait;
                };

                if reply.state() == DatagramState::TimedOut {
                    return Step::Failed(Error::Timeout);
                }

                if reply.working_counter() == 1 {
                    self.enter_poll(sub)
                } else if self.expired(ctx) {
                    Step::Failed(Error::WorkingCounter {
                        expected: 1,
                        received: reply.working_counter(),
                    })
                } else {
                    // The write mailbox may still hold a previous message; keep writing
                    self.send(sub)
                }
            }

            ExchangeState::Poll => {
                let Some(reply) = reply else {
                    return Step::Wait;
                };

                if reply.state() == DatagramState::TimedOut {
                    sub.mailbox.unlock(self.owner);

                    return Step::Failed(Error::Timeout);
                }

                let data = match reply.check() {
                    Ok(data) => data,
                    Err(e) => {
                        sub.mailbox.unlock(self.owner);

                        return Step::Failed(e);
                    }
                };

                match mailbox::message_available(data) {
                    Ok(true) => {
                        self.state = ExchangeState::Fetch;

                        match mailbox::prepare_fetch(sub.configured_address, &sub.mailbox.config)
                        {
                            Ok(datagram) => Step::Send(datagram),
                            Err(e) => {
                                sub.mailbox.unlock(self.owner);

                                Step::Failed(e)
                            }
                        }
                    }
                    Ok(false) => {
                        if self.expired(ctx) {
                            sub.mailbox.unlock(self.owner);

                            return Step::Failed(Error::Timeout);
                        }

                        self.state = ExchangeState::Poll;

                        match mailbox::prepare_check(sub.configured_address) {
                            Ok(datagram) => Step::Send(datagram),
                            Err(e) => {
                                sub.mailbox.unlock(self.owner);

                                Step::Failed(e)
                            }
                        }
                    }
                    Err(e) => {
                        sub.mailbox.unlock(self.owner);

                        Step::Failed(e)
                    }
                }
            }

            ExchangeState::Fetch => {
                let Some(reply) = reply else {
                    return Step::Wait;
                };

                if reply.state() == DatagramState::TimedOut {
                    sub.mailbox.unlock(self.owner);

                    return Step::Failed(Error::Timeout);
                }

                let data = match reply.check() {
                    Ok(data) => data,
                    Err(e) => {
                        sub.mailbox.unlock(self.owner);

                        return Step::Failed(e);
                    }
                };

                match mailbox::fetch(&sub.mailbox.config, data) {
                    Ok((header, payload)) => {
                        if header.mailbox_type != self.protocol {
                            // Someone else's reply; park it and keep waiting for ours
                            sub.mailbox.buffers.deposit(header.mailbox_type, &payload);

                            if self.expired(ctx) {
                                sub.mailbox.unlock(self.owner);

                                return Step::Failed(Error::Timeout);
                            }

                            self.state = ExchangeState::Poll;

                            return match mailbox::prepare_check(sub.configured_address) {
                                Ok(datagram) => Step::Send(datagram),
                                Err(e) => {
                                    sub.mailbox.unlock(self.owner);

                                    Step::Failed(e)
                                }
                            };
                        }

                        sub.mailbox.unlock(self.owner);

                        if self.absorb_emergency(&payload) {
                            return self.enter_poll(sub);
                        }

                        self.state = ExchangeState::Idle;

                        Step::Done(payload)
                    }
                    Err(e) => {
                        sub.mailbox.unlock(self.owner);

                        Step::Failed(e)
                    }
                }
            }

            ExchangeState::WaitDeposit => {
                if let Some(payload) = sub.mailbox.buffers.take(self.protocol) {
                    if self.absorb_emergency(&payload) {
                        return self.enter_poll(sub);
                    }

                    self.state = ExchangeState::Idle;

                    return Step::Done(payload);
                }

                if self.expired(ctx) {
                    return Step::Failed(Error::Timeout);
                }

                // The foreign fetch may have completed; try to take over the polling
                self.enter_poll(sub)
            }
        }
    }

    /// Log and swallow an emergency message, returning `true` if `payload` was one.
    fn absorb_emergency(&self, payload: &[u8]) -> bool {
        if self.protocol != MailboxType::Coe {
            return false;
        }

        if let Some(emergency) = services::parse_emergency(payload) {
            crate::fmt::warn!("{}", emergency);

            return true;
        }

        false
    }
}

use crate::fsm::push_truncated;

/// Outcome of interpreting one response payload.
enum Interpret<T> {
    /// The operation finished.
    Done(T),
    /// Send a new request.
    Request(Vec<u8>),
    /// The response was not the one awaited; poll for another.
    Repoll,
    /// A well-formed reply echoing someone else's request: deposit it for the concurrent
    /// consumer waiting on this SubDevice and poll for another.
    NotMine(Vec<u8>),
    /// Fatal for this operation.
    Failed(Error),
}

/// An SDO upload (SubDevice → MainDevice): expedited, normal and segmented transfers.
#[derive(Debug)]
pub(crate) struct CoeUpload {
    exchange: MailboxExchange,
    index: u16,
    sub_index: u8,
    complete_access: bool,
    segmented: bool,
    toggle: bool,
    complete_size: usize,
    data: Vec<u8>,
}

impl CoeUpload {
    pub(crate) fn new(
        owner: MailboxLockOwner,
        index: u16,
        sub_index: u8,
        complete_access: bool,
        response_timeout: Duration,
    ) -> Self {
        Self {
            exchange: MailboxExchange::new(owner, MailboxType::Coe, response_timeout),
            index,
            sub_index,
            complete_access,
            segmented: false,
            toggle: false,
            complete_size: 0,
            data: Vec::new(),
        }
    }

    pub(crate) fn start(&mut self, ctx: &Ctx, sub: &mut SubDevice) -> Step<Vec<u8>> {
        let request =
            services::upload_request(self.index, self.sub_index, self.complete_access).to_vec();

        self.exchange.start(ctx, sub, request)
    }

    pub(crate) fn step(
        &mut self,
        ctx: &Ctx,
        sub: &mut SubDevice,
        reply: Option<&Datagram>,
    ) -> Step<Vec<u8>> {
        match self.exchange.step(ctx, sub, reply) {
            Step::Done(payload) => match self.interpret(&payload) {
                Interpret::Done(data) => Step::Done(data),
                Interpret::Request(request) => self.exchange.start(ctx, sub, request),
                Interpret::Repoll => self.exchange.repoll(ctx, sub),
                Interpret::NotMine(payload) => {
                    sub.mailbox.buffers.deposit(MailboxType::Coe, &payload);

                    self.exchange.repoll(ctx, sub)
                }
                Interpret::Failed(e) => Step::Failed(e),
            },
            other => other,
        }
    }

    fn invalid(&self) -> Interpret<Vec<u8>> {
        crate::fmt::debug!(
            "Invalid upload response for {:#06x}:{}, waiting for another",
            self.index,
            self.sub_index
        );

        Interpret::Repoll
    }

    fn interpret(&mut self, payload: &[u8]) -> Interpret<Vec<u8>> {
        if let Some((_, _, code)) = services::parse_abort(payload) {
            return Interpret::Failed(Error::Mailbox(MailboxError::Aborted {
                code,
                address: self.index,
                sub_index: self.sub_index,
            }));
        }

        let Ok(coe_header) = CoeHeader::unpack_from_slice(payload) else {
            return self.invalid();
        };

        if coe_header.service != CoeService::SdoResponse {
            return self.invalid();
        }

        if !self.segmented {
            let Some(raw_header) = payload.get(2..6) else {
                return self.invalid();
            };

            let Ok(header) = InitSdoHeader::unpack_from_slice(raw_header) else {
                return self.invalid();
            };

            if header.flags.command != InitSdoFlags::UPLOAD_RESPONSE {
                return self.invalid();
            }

            if header.index != self.index
                || (!self.complete_access && header.sub_index != self.sub_index)
            {
                // A response to a different request, e.g. from the other engine lane
                return Interpret::NotMine(payload.to_vec());
            }

            if header.flags.expedited_transfer {
                let len = if header.flags.size_indicator {
                    4 - usize::from(header.flags.size)
                } else {
                    4
                };

                let Some(data) = payload.get(6..6 + len) else {
                    return self.invalid();
                };

                return Interpret::Done(data.to_vec());
            }

            // Normal transfer: complete size, then the first chunk of data
            let Some(raw_size) = payload.get(6..10) else {
                return self.invalid();
            };

            self.complete_size =
                u32::from_le_bytes([raw_size[0], raw_size[1], raw_size[2], raw_size[3]]) as usize;

            let chunk = payload.get(INIT_HEADER_SIZE..).unwrap_or(&[]);
            let take = chunk.len().min(self.complete_size);

            self.data.extend_from_slice(&chunk[0..take]);

            if self.data.len() >= self.complete_size {
                return Interpret::Done(core::mem::take(&mut self.data));
            }

            self.segmented = true;
            self.toggle = false;

            return Interpret::Request(services::upload_segment_request(self.toggle).to_vec());
        }

        // Segmented phase
        let Some(&raw_seg) = payload.get(2) else {
            return self.invalid();
        };

        let Ok(seg) = SegmentSdoHeader::unpack_from_slice(&[raw_seg]) else {
            return self.invalid();
        };

        if seg.toggle != self.toggle {
            crate::fmt::error!(
                "Upload segment toggle mismatch for {:#06x}:{}",
                self.index,
                self.sub_index
            );

            return Interpret::Failed(Error::Mailbox(MailboxError::SdoResponseInvalid {
                address: self.index,
                sub_index: self.sub_index,
            }));
        }

        let mut data_size = payload.len().saturating_sub(SEGMENT_HEADER_SIZE);

        // Minimum sized replies may carry filler bytes recorded in the segment header
        if payload.len() == SEGMENT_HEADER_SIZE + SegmentSdoHeader::MIN_DATA_SIZE {
            data_size = data_size.saturating_sub(usize::from(seg.segment_data_size));
        }

        let remaining = self.complete_size - self.data.len();
        let take = data_size.min(remaining);

        let Some(chunk) = payload.get(SEGMENT_HEADER_SIZE..SEGMENT_HEADER_SIZE + take) else {
            return self.invalid();
        };

        self.data.extend_from_slice(chunk);

        if seg.is_last_segment || self.data.len() >= self.complete_size {
            return Interpret::Done(core::mem::take(&mut self.data));
        }

        self.toggle = !self.toggle;

        Interpret::Request(services::upload_segment_request(self.toggle).to_vec())
    }
}

/// An SDO download (MainDevice → SubDevice): expedited and segmented transfers.
#[derive(Debug)]
pub(crate) struct CoeDownload {
    exchange: MailboxExchange,
    index: u16,
    sub_index: u8,
    complete_access: bool,
    data: Vec<u8>,
    offset: usize,
    toggle: bool,
    segmented: bool,
}

impl CoeDownload {
    pub(crate) fn new(
        owner: MailboxLockOwner,
        index: u16,
        sub_index: u8,
        complete_access: bool,
        data: Vec<u8>,
        response_timeout: Duration,
    ) -> Self {
        Self {
            exchange: MailboxExchange::new(owner, MailboxType::Coe, response_timeout),
            index,
            sub_index,
            complete_access,
            data,
            offset: 0,
            toggle: false,
            segmented: false,
        }
    }

    /// Usable payload capacity of the write mailbox, from the CoE header onwards.
    fn mailbox_capacity(sub: &SubDevice) -> usize {
        usize::from(sub.mailbox.config.max_write_payload())
    }

    pub(crate) fn start(&mut self, ctx: &Ctx, sub: &mut SubDevice) -> Step<()> {
        let request = if self.data.len() <= 4 {
            self.offset = self.data.len();

            services::download_expedited_request(
                self.index,
                self.sub_index,
                self.complete_access,
                &self.data,
            )
            .to_vec()
        } else {
            let capacity = Self::mailbox_capacity(sub).saturating_sub(INIT_HEADER_SIZE);

            let first_chunk = self.data.len().min(capacity);

            self.offset = first_chunk;

            services::download_normal_request(
                self.index,
                self.sub_index,
                self.complete_access,
                self.data.len() as u32,
                &self.data[0..first_chunk],
            )
        };

        self.exchange.start(ctx, sub, request).map(|_| ())
    }

    pub(crate) fn step(
        &mut self,
        ctx: &Ctx,
        sub: &mut SubDevice,
        reply: Option<&Datagram>,
    ) -> Step<()> {
        match self.exchange.step(ctx, sub, reply) {
            Step::Done(payload) => match self.interpret(&payload, Self::mailbox_capacity(sub)) {
                Interpret::Done(()) => Step::Done(()),
                Interpret::Request(request) => self.exchange.start(ctx, sub, request).map(|_| ()),
                Interpret::Repoll => self.exchange.repoll(ctx, sub).map(|_| ()),
                Interpret::NotMine(payload) => {
                    sub.mailbox.buffers.deposit(MailboxType::Coe, &payload);

                    self.exchange.repoll(ctx, sub).map(|_| ())
                }
                Interpret::Failed(e) => Step::Failed(e),
            },
            other => other.map(|_| ()),
        }
    }

    fn invalid(&self) -> Interpret<()> {
        crate::fmt::debug!(
            "Invalid download response for {:#06x}:{}, waiting for another",
            self.index,
            self.sub_index
        );

        Interpret::Repoll
    }

    fn next_segment(&mut self, capacity: usize) -> Interpret<()> {
        let chunk_capacity = capacity.saturating_sub(SEGMENT_HEADER_SIZE).max(1);

        let remaining = self.data.len() - self.offset;
        let take = remaining.min(chunk_capacity);
        let is_last = take == remaining;

        let request = services::download_segment_request(
            self.toggle,
            is_last,
            &self.data[self.offset..self.offset + take],
        );

        self.offset += take;
        self.segmented = true;

        Interpret::Request(request)
    }

    fn interpret(&mut self, payload: &[u8], capacity: usize) -> Interpret<()> {
        if let Some((_, _, code)) = services::parse_abort(payload) {
            return Interpret::Failed(Error::Mailbox(MailboxError::Aborted {
                code,
                address: self.index,
                sub_index: self.sub_index,
            }));
        }

        let Ok(coe_header) = CoeHeader::unpack_from_slice(payload) else {
            return self.invalid();
        };

        if coe_header.service != CoeService::SdoResponse {
            return self.invalid();
        }

        if !self.segmented {
            let Some(raw_header) = payload.get(2..6) else {
                return self.invalid();
            };

            let Ok(header) = InitSdoHeader::unpack_from_slice(raw_header) else {
                return self.invalid();
            };

            if header.flags.command != InitSdoFlags::DOWNLOAD_RESPONSE {
                return self.invalid();
            }

            if header.index != self.index {
                return Interpret::NotMine(payload.to_vec());
            }

            if self.offset >= self.data.len() {
                return Interpret::Done(());
            }

            self.toggle = false;

            return self.next_segment(capacity);
        }

        // Segment response: check the toggle echo
        let Some(&raw_seg) = payload.get(2) else {
            return self.invalid();
        };

        let Ok(seg) = SegmentSdoHeader::unpack_from_slice(&[raw_seg]) else {
            return self.invalid();
        };

        if seg.toggle != self.toggle {
            crate::fmt::error!(
                "Download segment toggle mismatch for {:#06x}:{}",
                self.index,
                self.sub_index
            );

            return Interpret::Failed(Error::Mailbox(MailboxError::SdoResponseInvalid {
                address: self.index,
                sub_index: self.sub_index,
            }));
        }

        if self.offset >= self.data.len() {
            return Interpret::Done(());
        }

        self.toggle = !self.toggle;

        self.next_segment(capacity)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum DictState {
    OdList,
    ObjectDesc,
    EntryDesc,
}

/// Object dictionary enumeration via the SDO Information service.
///
/// Entry-level errors leave a hole in the object and enumeration continues; object-level
/// errors skip that object only.
#[derive(Debug)]
pub(crate) struct DictionaryEnum {
    exchange: MailboxExchange,
    state: DictState,
    /// Object indices from the OD list response(s).
    indices: Vec<u16>,
    /// Fragments of the OD list seen so far.
    fragments: usize,
    position: usize,
    current: Option<SdoInfo>,
    sub_index: u8,
    dictionary: SdoDictionary,
}

impl DictionaryEnum {
    pub(crate) fn new(owner: MailboxLockOwner, response_timeout: Duration) -> Self {
        Self {
            exchange: MailboxExchange::new(owner, MailboxType::Coe, response_timeout),
            state: DictState::OdList,
            indices: Vec::new(),
            fragments: 0,
            position: 0,
            current: None,
            sub_index: 0,
            dictionary: SdoDictionary::new(),
        }
    }

    pub(crate) fn start(&mut self, ctx: &Ctx, sub: &mut SubDevice) -> Step<SdoDictionary> {
        self.exchange
            .start(ctx, sub, services::od_list_request().to_vec())
            .map(|_| SdoDictionary::new())
    }

    pub(crate) fn step(
        &mut self,
        ctx: &Ctx,
        sub: &mut SubDevice,
        reply: Option<&Datagram>,
    ) -> Step<SdoDictionary> {
        match self.exchange.step(ctx, sub, reply) {
            Step::Done(payload) => match self.interpret(&payload) {
                Interpret::Done(dictionary) => Step::Done(dictionary),
                Interpret::Request(request) => self
                    .exchange
                    .start(ctx, sub, request)
                    .map(|_| SdoDictionary::new()),
                Interpret::Repoll => self.exchange.repoll(ctx, sub).map(|_| SdoDictionary::new()),
                Interpret::NotMine(payload) => {
                    sub.mailbox.buffers.deposit(MailboxType::Coe, &payload);

                    self.exchange.repoll(ctx, sub).map(|_| SdoDictionary::new())
                }
                Interpret::Failed(e) => Step::Failed(e),
            },
            other => other.map(|_| SdoDictionary::new()),
        }
    }

    /// Move on to the object at `self.position`, or finish.
    fn next_object(&mut self) -> Interpret<SdoDictionary> {
        if let Some(info) = self.current.take() {
            self.dictionary.insert(info.index, info);
        }

        let Some(&index) = self.indices.get(self.position) else {
            return Interpret::Done(core::mem::take(&mut self.dictionary));
        };

        self.position += 1;
        self.state = DictState::ObjectDesc;

        Interpret::Request(services::object_description_request(index).to_vec())
    }

    fn next_entry(&mut self) -> Interpret<SdoDictionary> {
        let current = self.current.as_ref().expect("entry walk without object");

        if self.sub_index >= current.max_sub_index {
            return self.next_object();
        }

        self.sub_index += 1;
        self.state = DictState::EntryDesc;

        Interpret::Request(
            services::entry_description_request(current.index, self.sub_index).to_vec(),
        )
    }

    fn interpret(&mut self, payload: &[u8]) -> Interpret<SdoDictionary> {
        let Ok(coe_header) = CoeHeader::unpack_from_slice(payload) else {
            return Interpret::Repoll;
        };

        if coe_header.service != CoeService::SdoInformation {
            return Interpret::Repoll;
        }

        let Some(raw_info) = payload.get(2..6) else {
            return Interpret::Repoll;
        };

        let Ok(info) = SdoInfoHeader::unpack_from_slice(raw_info) else {
            return Interpret::Repoll;
        };

        if info.op_code == SdoInfoOpCode::SdoInfoErrorRequest {
            let code = payload
                .get(6..10)
                .map(|raw| u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
                .unwrap_or(0);

            let code = crate::coe::abort_code::CoeAbortCode::from(code);

            return match self.state {
                // Without the object list there is nothing to enumerate
                DictState::OdList => Interpret::Failed(Error::Mailbox(MailboxError::Aborted {
                    code,
                    address: 0,
                    sub_index: 0,
                })),
                DictState::ObjectDesc => {
                    crate::fmt::warn!("Object description failed: {}", code);

                    self.current = None;

                    self.next_object()
                }
                DictState::EntryDesc => {
                    crate::fmt::debug!(
                        "Entry description {} failed: {}; leaving a hole",
                        self.sub_index,
                        code
                    );

                    self.next_entry()
                }
            };
        }

        match self.state {
            DictState::OdList => {
                if info.op_code != SdoInfoOpCode::GetObjectDescriptionListResponse {
                    return Interpret::Repoll;
                }

                // The first fragment carries the echoed list type before the indices
                let data_start = if self.fragments == 0 { 8 } else { 6 };

                self.fragments += 1;

                for chunk in payload.get(data_start..).unwrap_or(&[]).chunks_exact(2) {
                    self.indices.push(u16::from_le_bytes([chunk[0], chunk[1]]));
                }

                if info.incomplete {
                    // Further fragments arrive without a new request
                    return Interpret::Repoll;
                }

                crate::fmt::debug!("Dictionary lists {} objects", self.indices.len());

                self.next_object()
            }

            DictState::ObjectDesc => {
                if info.op_code != SdoInfoOpCode::GetObjectDescriptionResponse
                    || payload.len() < 12
                {
                    return Interpret::Repoll;
                }

                let index = u16::from_le_bytes([payload[6], payload[7]]);

                // The previous request's index; anything else is stale
                let expected = self
                    .position
                    .checked_sub(1)
                    .and_then(|at| self.indices.get(at));

                if expected != Some(&index) {
                    return Interpret::Repoll;
                }

                let mut info = SdoInfo {
                    index,
                    max_sub_index: payload[10],
                    object_code: payload[11],
                    name: heapless::String::new(),
                    entries: alloc::collections::BTreeMap::new(),
                };

                push_truncated(&mut info.name, payload.get(12..).unwrap_or(&[]));

                self.current = Some(info);
                self.sub_index = 0;
                self.state = DictState::EntryDesc;

                Interpret::Request(services::entry_description_request(index, 0).to_vec())
            }

            DictState::EntryDesc => {
                if info.op_code != SdoInfoOpCode::GetEntryDescriptionResponse
                    || payload.len() < 16
                {
                    return Interpret::Repoll;
                }

                let index = u16::from_le_bytes([payload[6], payload[7]]);
                let sub_index = payload[8];

                let Some(current) = self.current.as_mut() else {
                    return Interpret::Repoll;
                };

                if index != current.index || sub_index != self.sub_index {
                    return Interpret::Repoll;
                }

                let mut entry = SdoEntryInfo {
                    data_type: u16::from_le_bytes([payload[10], payload[11]]),
                    bit_length: u16::from_le_bytes([payload[12], payload[13]]),
                    access: SdoEntryAccess::from_word(u16::from_le_bytes([
                        payload[14],
                        payload[15],
                    ])),
                    description: heapless::String::new(),
                };

                push_truncated(&mut entry.description, payload.get(16..).unwrap_or(&[]));

                current.entries.insert(sub_index, entry);

                self.next_entry()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eeprom::types::DefaultMailbox;
    use crate::mailbox::{MailboxConfig, MailboxHeader, MailboxWindow, Priority};
    use crate::maindevice::{MainDeviceConfig, Timeouts};
    use crate::subdevice::SubDevice;
    use ethercrab_wire::EtherCrabWireWriteSized;

    fn test_subdevice() -> SubDevice {
        let mut sub = SubDevice::new(0, 0x1000);

        sub.mailbox.config = MailboxConfig {
            write: MailboxWindow {
                offset: 0x1000,
                len: 128,
            },
            read: MailboxWindow {
                offset: 0x1080,
                len: 128,
            },
        };
        sub.mailbox.default = DefaultMailbox {
            supported_protocols: crate::mailbox::MailboxProtocols::COE,
            standard_write: sub.mailbox.config.write,
            standard_read: sub.mailbox.config.read,
            ..DefaultMailbox::default()
        };

        sub
    }

    struct TestCtx {
        timeouts: Timeouts,
        config: MainDeviceConfig,
        sii_images: alloc::vec::Vec<alloc::sync::Arc<crate::eeprom::image::SiiImage>>,
        pdo_cache: alloc::vec::Vec<(crate::subdevice::SubDeviceIdentity, alloc::vec::Vec<crate::pdo::Pdo>)>,
    }

    impl TestCtx {
        fn new() -> Self {
            Self {
                timeouts: Timeouts::default(),
                config: MainDeviceConfig::default(),
                sii_images: alloc::vec::Vec::new(),
                pdo_cache: alloc::vec::Vec::new(),
            }
        }

        fn ctx(&mut self) -> Ctx<'_> {
            Ctx {
                now: Instant::from_millis(1),
                timeouts: &self.timeouts,
                config: &self.config,
                sii_images: &mut self.sii_images,
                pdo_cache: &mut self.pdo_cache,
                firmware: None,
            }
        }
    }

    /// Mark `datagram` as answered with `data` and the given working counter.
    fn complete(datagram: &mut Datagram, data: &[u8], wkc: u16) {
        let len = data.len();

        datagram.data_mut()[0..len].copy_from_slice(data);
        datagram.working_counter = wkc;
        datagram.set_state(DatagramState::Received);
    }

    /// Wrap a CoE payload in a mailbox reply as it would be fetched from the read window.
    fn mailbox_reply(payload: &[u8]) -> alloc::vec::Vec<u8> {
        let mut window = alloc::vec![0u8; 128];

        let header = MailboxHeader {
            length: payload.len() as u16,
            address: 0x1000,
            priority: Priority::Lowest,
            mailbox_type: MailboxType::Coe,
            counter: 1,
        };

        window[0..6].copy_from_slice(&header.pack());
        window[6..6 + payload.len()].copy_from_slice(payload);

        window
    }

    /// An expedited upload response for `index`:`sub_index` carrying 4 data bytes.
    fn expedited_response(index: u16, sub_index: u8, data: [u8; 4]) -> alloc::vec::Vec<u8> {
        let mut payload = alloc::vec![0u8; 10];

        payload[1] = 0x30; // SDO response service
        payload[2] = 0x02 | 0x01 | (InitSdoFlags::UPLOAD_RESPONSE << 5); // expedited, sized, 0 unused
        payload[3..5].copy_from_slice(&index.to_le_bytes());
        payload[5] = sub_index;
        payload[6..10].copy_from_slice(&data);

        payload
    }

    fn expect_send(step: Step<alloc::vec::Vec<u8>>) -> Datagram {
        match step {
            Step::Send(datagram) => datagram,
            other => panic!("expected Send, got {:?}", other),
        }
    }

    #[test]
    fn expedited_upload_round_trip() {
        let mut harness = TestCtx::new();
        let mut sub = test_subdevice();

        let mut upload = CoeUpload::new(
            MailboxLockOwner::Lifecycle,
            0x6000,
            0x01,
            false,
            Duration::from_secs(1),
        );

        // Request write into the SubDevice's write mailbox
        let mut request = expect_send(upload.start(&harness.ctx(), &mut sub));

        assert_eq!(request.data().len(), 128);

        let echo = request.data().to_vec();

        complete(&mut request, &echo, 1);

        // Lock acquired, SM1 status poll goes out
        let mut check = expect_send(upload.step(&harness.ctx(), &mut sub, Some(&request)));

        complete(&mut check, &[0x08], 1);

        // Message present: fetch the read window
        let mut fetch = expect_send(upload.step(&harness.ctx(), &mut sub, Some(&check)));

        let reply = mailbox_reply(&expedited_response(0x6000, 0x01, [0x01, 0x02, 0x03, 0x04]));

        complete(&mut fetch, &reply, 1);

        match upload.step(&harness.ctx(), &mut sub, Some(&fetch)) {
            Step::Done(data) => assert_eq!(data, alloc::vec![0x01, 0x02, 0x03, 0x04]),
            other => panic!("expected Done, got {:?}", other),
        }
    }

    #[test]
    fn lock_serialises_two_readers() {
        let mut harness = TestCtx::new();
        let mut sub = test_subdevice();

        let mut first = CoeUpload::new(
            MailboxLockOwner::Lifecycle,
            0x6000,
            0x01,
            false,
            Duration::from_secs(1),
        );
        let mut second = CoeUpload::new(
            MailboxLockOwner::Request,
            0x7000,
            0x01,
            false,
            Duration::from_secs(1),
        );

        // Both requests go out
        let mut first_request = expect_send(first.start(&harness.ctx(), &mut sub));
        let echo = first_request.data().to_vec();
        complete(&mut first_request, &echo, 1);

        // The first reader takes the lock and polls
        let mut check = expect_send(first.step(&harness.ctx(), &mut sub, Some(&first_request)));
        complete(&mut check, &[0x08], 1);

        let mut second_request = expect_send(second.start(&harness.ctx(), &mut sub));
        let echo = second_request.data().to_vec();
        complete(&mut second_request, &echo, 1);

        // The second reader finds the lock taken and suspends without wire work
        match second.step(&harness.ctx(), &mut sub, Some(&second_request)) {
            Step::Wait => {}
            other => panic!("expected Wait, got {:?}", other),
        }

        // The single fetch returns the *second* reader's response
        let mut fetch = expect_send(first.step(&harness.ctx(), &mut sub, Some(&check)));

        let reply = mailbox_reply(&expedited_response(0x7000, 0x01, [0xaa, 0xbb, 0xcc, 0xdd]));

        complete(&mut fetch, &reply, 1);

        // The first reader deposits the foreign reply and goes back to polling
        match first.step(&harness.ctx(), &mut sub, Some(&fetch)) {
            Step::Send(datagram) => {
                // It re-polls the SM1 status byte rather than re-fetching
                assert_eq!(datagram.data().len(), 1);
            }
            other => panic!("expected Send, got {:?}", other),
        }

        // The second reader consumes the deposit without a poll or fetch of its own
        match second.step(&harness.ctx(), &mut sub, None) {
            Step::Done(data) => assert_eq!(data, alloc::vec![0xaa, 0xbb, 0xcc, 0xdd]),
            other => panic!("expected Done, got {:?}", other),
        }
    }
}
