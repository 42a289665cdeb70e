//! The engine: SubDevice table, state machine scheduling, datagram queueing and frame
//! assembly/dispatch.
//!
//! The engine is pumped by the caller: [`MainDevice::tick`] advances every state machine by at
//! most one datagram, [`MainDevice::next_frame`] drains queued datagrams into EtherCAT frames
//! for the transport adapter, and [`MainDevice::receive_frame`] routes returned datagrams back
//! to the state machines that own them.

use crate::command::Command;
use crate::datagram::{Datagram, DatagramState};
use crate::eeprom::firmware::FirmwareLoader;
use crate::eeprom::image::SiiImage;
use crate::error::{Error, Item, PduError};
use crate::frame;
use crate::fsm::coe::DictionaryEnum;
use crate::fsm::request::RequestService;
use crate::fsm::subdevice_config::SubDeviceConfigFsm;
use crate::fsm::subdevice_scan::SubDeviceScan;
use crate::fsm::{Ctx, Step};
use crate::pdo::Pdo;
use crate::register::RegisterAddress;
use crate::sdo::SdoRequest;
use crate::subdevice::{MailboxLockOwner, SubDevice, SubDeviceIdentity};
use crate::subdevice_state::SubDeviceState;
use crate::time::Instant;
use crate::{BASE_SUBDEVICE_ADDRESS, FSM_RETRIES, MAX_FRAME_DATA};
use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::time::Duration;

/// Timeouts used by the protocol state machines.
///
/// The defaults reproduce the protocol constants of the EtherCAT bringup sequence; the `pdu`
/// timeout is the per-datagram deadline after which the engine re-queues or expires a
/// datagram.
#[derive(Copy, Clone, Debug)]
pub struct Timeouts {
    /// Per-datagram response deadline.
    pub pdu: Duration,
    /// AL state transition deadline.
    pub state_transition: Duration,
    /// Window during which an unacknowledged AL control write is retried.
    pub state_transition_unacked: Duration,
    /// SII busy-poll deadline per word cycle.
    pub sii_busy: Duration,
    /// Deadline for the initial EEPROM load after power-on.
    pub sii_load: Duration,
    /// Default mailbox response deadline per exchange.
    pub mailbox_response: Duration,
    /// Window during which an unacknowledged first mailbox SM write is retried.
    pub mailbox_first_write: Duration,
    /// Deadline for the DC system time difference to converge during configuration.
    pub dc_sync: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            pdu: Duration::from_millis(100),
            state_transition: Duration::from_secs(5),
            state_transition_unacked: Duration::from_secs(3),
            sii_busy: Duration::from_millis(20),
            sii_load: Duration::from_millis(500),
            mailbox_response: Duration::from_millis(1000),
            mailbox_first_write: Duration::from_secs(1),
            dc_sync: Duration::from_secs(5),
        }
    }
}

/// What the engine does when a datagram receives no response within the PDU timeout.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RetryBehaviour {
    /// Expire immediately; the owning state machine sees the timeout.
    None,
    /// Re-queue the datagram up to the given number of times.
    Count(u8),
    /// Re-queue forever. Only useful in test setups.
    Forever,
}

impl Default for RetryBehaviour {
    fn default() -> Self {
        RetryBehaviour::Count(FSM_RETRIES)
    }
}

impl RetryBehaviour {
    pub(crate) fn retry_count(&self) -> u8 {
        match self {
            RetryBehaviour::None => 0,
            RetryBehaviour::Count(count) => *count,
            RetryBehaviour::Forever => u8::MAX,
        }
    }
}

impl Default for MainDeviceConfig {
    fn default() -> Self {
        Self {
            retry_behaviour: RetryBehaviour::Count(FSM_RETRIES),
            dc_start_delay: Duration::from_millis(100),
            dc_sync_difference_ns: 10_000,
        }
    }
}

/// Tunables of the engine.
#[derive(Copy, Clone, Debug)]
pub struct MainDeviceConfig {
    /// Datagram retry policy.
    pub retry_behaviour: RetryBehaviour,
    /// Forward offset applied to the application time when computing the DC sync start time.
    pub dc_start_delay: Duration,
    /// Acceptable DC system time difference before SYNC generation is enabled, in ns.
    pub dc_sync_difference_ns: u32,
}

/// Handle for one submitted SDO request.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct RequestHandle(u64);

/// Which in-flight slot a datagram index routes back to.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum LaneKind {
    Engine,
    Lifecycle(usize),
    Request(usize),
}

/// One state machine's in-flight datagram slot.
#[derive(Debug, Default)]
struct Slot {
    datagram: Option<Datagram>,
    retries_left: u8,
}

impl Slot {
    fn is_empty(&self) -> bool {
        self.datagram.is_none()
    }

    /// Take the datagram out if it has completed (or expired).
    fn take_completed(&mut self) -> Option<Datagram> {
        let completed = matches!(
            self.datagram.as_ref().map(Datagram::state),
            Some(DatagramState::Received)
                | Some(DatagramState::TimedOut)
                | Some(DatagramState::Error)
                | Some(DatagramState::Invalid)
        );

        if completed { self.datagram.take() } else { None }
    }

    fn place(&mut self, mut datagram: Datagram, retries: u8) {
        datagram.set_state(DatagramState::Queued);

        self.datagram = Some(datagram);
        self.retries_left = retries;
    }
}

/// The lifecycle lane of one SubDevice: scan, configuration or dictionary enumeration.
#[derive(Debug, Default)]
enum Lifecycle {
    #[default]
    Idle,
    Scan(SubDeviceScan),
    Config(SubDeviceConfigFsm),
    Dictionary(DictionaryEnum),
}

/// Per-SubDevice engine bookkeeping.
#[derive(Debug, Default)]
struct Lanes {
    lifecycle: Lifecycle,
    lifecycle_slot: Slot,
    request: RequestService,
    request_slot: Slot,
    /// A dictionary enumeration has been asked for but not run yet.
    dictionary_requested: bool,
    /// The next configuration run may use the SAFE-OP quick entry.
    quick_reconfigure: bool,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum EngineState {
    Idle,
    Counting,
    Ready,
}

/// The master-side protocol engine.
pub struct MainDevice {
    timeouts: Timeouts,
    config: MainDeviceConfig,

    state: EngineState,
    engine_slot: Slot,

    subdevices: Vec<SubDevice>,
    lanes: Vec<Lanes>,

    /// Identity-keyed arena of shared SII images.
    sii_images: Vec<Arc<SiiImage>>,
    /// CoE-read PDO sets cached per identity.
    pdo_cache: Vec<(SubDeviceIdentity, Vec<Pdo>)>,
    firmware: Option<Box<dyn FirmwareLoader + Send>>,

    /// Datagram index → owning slot.
    routes: [Option<LaneKind>; 256],
    next_index: u8,
    next_handle: u64,
}

impl core::fmt::Debug for MainDevice {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MainDevice")
            .field("state", &self.state)
            .field("subdevices", &self.subdevices.len())
            .finish()
    }
}

impl MainDevice {
    /// Create an engine with the given timeouts and tunables.
    pub fn new(timeouts: Timeouts, config: MainDeviceConfig) -> Self {
        Self {
            timeouts,
            config,
            state: EngineState::Idle,
            engine_slot: Slot::default(),
            subdevices: Vec::new(),
            lanes: Vec::new(),
            sii_images: Vec::new(),
            pdo_cache: Vec::new(),
            firmware: None,
            routes: [None; 256],
            next_index: 0,
            next_handle: 0,
        }
    }

    /// Install an SII firmware override source consulted during scan.
    pub fn with_firmware(mut self, loader: impl FirmwareLoader + Send + 'static) -> Self {
        self.firmware = Some(Box::new(loader));

        self
    }

    /// Begin a network scan: count the ring by broadcast, then identify and characterise each
    /// SubDevice.
    ///
    /// Any previously discovered SubDevices are dropped; their pending requests fail as
    /// cancelled.
    pub fn scan(&mut self) -> Result<(), Error> {
        self.shutdown();

        let datagram =
            Datagram::read(Command::brd(RegisterAddress::Type.into()), 1, "topology count")?
                .ignore_wkc();

        self.engine_slot
            .place(datagram, self.config.retry_behaviour.retry_count());
        self.state = EngineState::Counting;

        Ok(())
    }

    /// `true` once every discovered SubDevice has finished (or failed) its scan.
    pub fn scan_complete(&self) -> bool {
        self.state == EngineState::Ready
            && self
                .subdevices
                .iter()
                .all(|sub| sub.scanned)
    }

    /// The discovered SubDevices, in ring order.
    pub fn subdevices(&self) -> &[SubDevice] {
        &self.subdevices
    }

    /// One SubDevice by ring position.
    pub fn subdevice(&self, index: usize) -> Option<&SubDevice> {
        self.subdevices.get(index)
    }

    /// Attach an application configuration to a SubDevice.
    ///
    /// Replaces any previous configuration; an in-flight configuration run restarts at its
    /// next sequencing edge.
    pub fn attach_config(
        &mut self,
        index: usize,
        config: crate::subdevice::config::SubDeviceConfig,
    ) -> Result<(), Error> {
        let sub = self.subdevices.get_mut(index).ok_or(Error::NotFound {
            item: Item::SubDevice,
            index: Some(index),
        })?;

        sub.config.attach(config);

        Ok(())
    }

    /// Detach a SubDevice's configuration, returning it.
    pub fn detach_config(
        &mut self,
        index: usize,
    ) -> Option<crate::subdevice::config::SubDeviceConfig> {
        self.subdevices.get_mut(index)?.config.detach()
    }

    /// Request that a SubDevice be driven to `state`.
    pub fn request_state(&mut self, index: usize, state: SubDeviceState) -> Result<(), Error> {
        let sub = self.subdevices.get_mut(index).ok_or(Error::NotFound {
            item: Item::SubDevice,
            index: Some(index),
        })?;

        sub.requested_state = state;
        sub.error_flag = false;

        Ok(())
    }

    /// Re-apply SAFE-OP application parameters without re-running the register configuration,
    /// for reconfiguration that must not disturb process data exchange.
    pub fn quick_reconfigure(&mut self, index: usize) -> Result<(), Error> {
        let lanes = self.lanes.get_mut(index).ok_or(Error::NotFound {
            item: Item::SubDevice,
            index: Some(index),
        })?;

        lanes.quick_reconfigure = true;

        Ok(())
    }

    /// Ask for a SubDevice's object dictionary to be enumerated in the background.
    pub fn enumerate_dictionary(&mut self, index: usize) -> Result<(), Error> {
        let lanes = self.lanes.get_mut(index).ok_or(Error::NotFound {
            item: Item::SubDevice,
            index: Some(index),
        })?;

        lanes.dictionary_requested = true;

        Ok(())
    }

    /// Queue an SDO request against a SubDevice.
    pub fn submit_request(
        &mut self,
        index: usize,
        mut request: SdoRequest,
        now: Instant,
    ) -> Result<RequestHandle, Error> {
        let sub = self.subdevices.get_mut(index).ok_or(Error::NotFound {
            item: Item::SubDevice,
            index: Some(index),
        })?;

        if !sub.supports_coe() {
            return Err(Error::Capability(crate::error::Capability::Coe));
        }

        let handle = RequestHandle(self.next_handle);

        self.next_handle += 1;

        request.set_queued(now);

        sub.requests.push_back((handle.0, request));

        Ok(handle)
    }

    /// Look up a submitted request by handle.
    pub fn request(&self, handle: RequestHandle) -> Option<&SdoRequest> {
        self.subdevices.iter().find_map(|sub| {
            sub.requests
                .iter()
                .chain(sub.finished_requests.iter())
                .find(|(at, _)| *at == handle.0)
                .map(|(_, request)| request)
        })
    }

    /// Remove and return a finished request.
    pub fn take_request(&mut self, handle: RequestHandle) -> Option<SdoRequest> {
        for sub in self.subdevices.iter_mut() {
            if let Some(at) = sub
                .finished_requests
                .iter()
                .position(|(id, _)| *id == handle.0)
            {
                return sub.finished_requests.remove(at).map(|(_, request)| request);
            }
        }

        None
    }

    /// Cancel everything: every queued or in-flight request fails, all state machines stop.
    ///
    /// The SubDevice table itself survives so its state can still be inspected.
    pub fn shutdown(&mut self) {
        for (sub, lanes) in self.subdevices.iter_mut().zip(self.lanes.iter_mut()) {
            lanes.request.cancel(sub);
            lanes.lifecycle = Lifecycle::Idle;
            lanes.lifecycle_slot = Slot::default();
            lanes.request_slot = Slot::default();

            sub.cancel_requests();
            sub.mailbox
                .unlock(MailboxLockOwner::Lifecycle);
            sub.mailbox.unlock(MailboxLockOwner::Request);
        }

        self.engine_slot = Slot::default();
        self.routes = [None; 256];
        self.state = EngineState::Idle;
    }

    /// Advance every state machine by at most one datagram.
    pub fn tick(&mut self, now: Instant) {
        self.expire_datagrams(now);
        self.tick_engine();

        if self.state != EngineState::Ready {
            return;
        }

        for index in 0..self.subdevices.len() {
            self.tick_lifecycle(index, now);
            self.tick_request(index, now);
        }
    }

    /// Re-queue or expire datagrams whose response deadline has passed.
    fn expire_datagrams(&mut self, now: Instant) {
        let pdu_timeout = self.timeouts.pdu;
        let routes = &mut self.routes;

        let mut expire = |slot: &mut Slot| {
            let Some(datagram) = slot.datagram.as_mut() else {
                return;
            };

            if datagram.state() != DatagramState::Sent {
                return;
            }

            let deadline_passed = datagram
                .sent_at
                .is_some_and(|sent| now.duration_since(sent) >= pdu_timeout);

            if !deadline_passed {
                return;
            }

            // A late reply to the old index must not be delivered any more
            routes[usize::from(datagram.index)] = None;

            if slot.retries_left > 0 {
                slot.retries_left -= 1;
                datagram.skip_count = datagram.skip_count.saturating_add(1);
                datagram.set_state(DatagramState::Queued);

                crate::fmt::debug!("Re-queueing unanswered datagram {}", datagram.name);
            } else {
                datagram.set_state(DatagramState::TimedOut);
            }
        };

        expire(&mut self.engine_slot);

        for lanes in self.lanes.iter_mut() {
            expire(&mut lanes.lifecycle_slot);
            expire(&mut lanes.request_slot);
        }
    }

    fn tick_engine(&mut self) {
        if self.state != EngineState::Counting {
            return;
        }

        let Some(reply) = self.engine_slot.take_completed() else {
            return;
        };

        if reply.state() != DatagramState::Received {
            crate::fmt::error!("Topology count failed, no response from the ring");

            self.state = EngineState::Idle;

            return;
        }

        let count = reply.working_counter();

        crate::fmt::info!("{} SubDevices on the ring", count);

        self.subdevices = (0..count)
            .map(|position| {
                SubDevice::new(position, BASE_SUBDEVICE_ADDRESS.wrapping_add(position))
            })
            .collect();
        self.lanes = (0..count).map(|_| Lanes::default()).collect();

        self.state = EngineState::Ready;
    }

    fn ctx<'engine>(
        timeouts: &'engine Timeouts,
        config: &'engine MainDeviceConfig,
        sii_images: &'engine mut Vec<Arc<SiiImage>>,
        pdo_cache: &'engine mut Vec<(SubDeviceIdentity, Vec<Pdo>)>,
        firmware: Option<&'engine (dyn FirmwareLoader + Send)>,
        now: Instant,
    ) -> Ctx<'engine> {
        Ctx {
            now,
            timeouts,
            config,
            sii_images,
            pdo_cache,
            firmware: firmware.map(|loader| loader as &dyn FirmwareLoader),
        }
    }

    fn tick_lifecycle(&mut self, index: usize, now: Instant) {
        // Scans run in ring order, one device at a time. Scanning starts out ring-position
        // addressed, so at minimum a device's scan may not begin before its predecessor holds
        // a station address; serialising fully also lets identical devices share the SII
        // image and PDO set read by their predecessor.
        let predecessor_ready = index == 0
            || self
                .subdevices
                .get(index - 1)
                .is_none_or(|prev| prev.scanned);

        let Self {
            subdevices,
            lanes,
            sii_images,
            pdo_cache,
            firmware,
            timeouts,
            config,
            ..
        } = self;

        let sub = &mut subdevices[index];
        let lanes = &mut lanes[index];

        // A datagram is still in flight; nothing to do until it completes
        if !lanes.lifecycle_slot.is_empty()
            && lanes
                .lifecycle_slot
                .datagram
                .as_ref()
                .is_some_and(|datagram| {
                    matches!(
                        datagram.state(),
                        DatagramState::Queued | DatagramState::Sent
                    )
                })
        {
            return;
        }

        let reply = lanes.lifecycle_slot.take_completed();

        let mut ctx = Self::ctx(
            timeouts,
            config,
            sii_images,
            pdo_cache,
            firmware.as_deref(),
            now,
        );

        // Start something if the lane is idle
        if matches!(lanes.lifecycle, Lifecycle::Idle) {
            if sub.error_flag {
                return;
            }

            if !sub.scanned {
                if !predecessor_ready {
                    return;
                }

                let mut scan = SubDeviceScan::new();

                let step = scan.start(&ctx, sub);

                lanes.lifecycle = Lifecycle::Scan(scan);

                Self::settle_lifecycle(step, sub, lanes, config);

                return;
            }

            if sub.requested_state != SubDeviceState::None
                && sub.requested_state != sub.current_state
            {
                let mut fsm = if lanes.quick_reconfigure
                    && sub.current_state == SubDeviceState::SafeOp
                {
                    SubDeviceConfigFsm::quick_start(sub.requested_state)
                } else {
                    SubDeviceConfigFsm::new(sub.requested_state)
                };

                lanes.quick_reconfigure = false;

                let step = fsm.start(&mut ctx, sub);

                lanes.lifecycle = Lifecycle::Config(fsm);

                Self::settle_lifecycle(step, sub, lanes, config);

                return;
            }

            if lanes.dictionary_requested
                && sub.supports_coe()
                && sub.current_state.is_mailbox_capable()
            {
                lanes.dictionary_requested = false;

                let mut fsm =
                    DictionaryEnum::new(MailboxLockOwner::Lifecycle, timeouts.mailbox_response);

                let step = fsm.start(&ctx, sub).map(|_| ());

                lanes.lifecycle = Lifecycle::Dictionary(fsm);

                Self::settle_lifecycle(step, sub, lanes, config);

                return;
            }

            return;
        }

        // Advance the running machine
        let step = match &mut lanes.lifecycle {
            Lifecycle::Idle => return,
            Lifecycle::Scan(scan) => scan.step(&mut ctx, sub, reply.as_ref()),
            Lifecycle::Config(fsm) => fsm.step(&mut ctx, sub, reply.as_ref()),
            Lifecycle::Dictionary(fsm) => match fsm.step(&mut ctx, sub, reply.as_ref()) {
                Step::Done(dictionary) => {
                    sub.dictionary = dictionary;

                    Step::Done(())
                }
                other => other.map(|_| ()),
            },
        };

        Self::settle_lifecycle(step, sub, lanes, config);
    }

    /// Apply a lifecycle step outcome to the lane.
    fn settle_lifecycle(
        step: Step,
        sub: &mut SubDevice,
        lanes: &mut Lanes,
        config: &MainDeviceConfig,
    ) {
        match step {
            Step::Send(datagram) => {
                lanes
                    .lifecycle_slot
                    .place(datagram, config.retry_behaviour.retry_count());
            }
            Step::Wait => {}
            Step::Done(()) => {
                if matches!(lanes.lifecycle, Lifecycle::Scan(_)) {
                    sub.scanned = true;
                }

                lanes.lifecycle = Lifecycle::Idle;
            }
            Step::Failed(e) => {
                crate::fmt::error!(
                    "SubDevice {:#06x} lifecycle failed: {}",
                    sub.configured_address,
                    e
                );

                if matches!(lanes.lifecycle, Lifecycle::Scan(_)) {
                    sub.scanned = true;
                }

                sub.error_flag = true;
                sub.mailbox.unlock(MailboxLockOwner::Lifecycle);
                lanes.lifecycle = Lifecycle::Idle;
            }
        }
    }

    fn tick_request(&mut self, index: usize, now: Instant) {
        let Self {
            subdevices,
            lanes,
            sii_images,
            pdo_cache,
            firmware,
            timeouts,
            config,
            ..
        } = self;

        let sub = &mut subdevices[index];
        let lanes = &mut lanes[index];

        if !lanes.request_slot.is_empty()
            && lanes.request_slot.datagram.as_ref().is_some_and(|datagram| {
                matches!(
                    datagram.state(),
                    DatagramState::Queued | DatagramState::Sent
                )
            })
        {
            return;
        }

        let reply = lanes.request_slot.take_completed();

        let mut ctx = Self::ctx(
            timeouts,
            config,
            sii_images,
            pdo_cache,
            firmware.as_deref(),
            now,
        );

        match lanes.request.step(&mut ctx, sub, reply.as_ref()) {
            Step::Send(datagram) => {
                lanes
                    .request_slot
                    .place(datagram, config.retry_behaviour.retry_count());
            }
            Step::Wait | Step::Done(()) => {}
            Step::Failed(e) => {
                crate::fmt::error!(
                    "SubDevice {:#06x} request servicing failed: {}",
                    sub.configured_address,
                    e
                );

                sub.mailbox.unlock(MailboxLockOwner::Request);
            }
        }
    }

    /// Assemble the next outgoing EtherCAT frame from queued datagrams.
    ///
    /// Returns the number of bytes written into `buf`, or `None` if nothing is waiting. The
    /// included datagrams are stamped as sent at `now`.
    pub fn next_frame(&mut self, buf: &mut [u8], now: Instant) -> Option<usize> {
        let mut outgoing: Vec<(LaneKind, Datagram)> = Vec::new();
        let mut used = 0usize;

        let mut queue = |kind: LaneKind,
                         slot: &mut Slot,
                         routes: &mut [Option<LaneKind>; 256],
                         next_index: &mut u8,
                         outgoing: &mut Vec<(LaneKind, Datagram)>,
                         used: &mut usize| {
            let Some(datagram) = slot.datagram.as_mut() else {
                return;
            };

            if datagram.state() != DatagramState::Queued {
                return;
            }

            if *used + datagram.wire_len() > MAX_FRAME_DATA {
                return;
            }

            // Find a free index for this datagram
            let mut index = *next_index;
            let mut probed = 0u16;

            while routes[usize::from(index)].is_some() && probed < 256 {
                index = index.wrapping_add(1);
                probed += 1;
            }

            if probed >= 256 {
                // Every index is in flight; leave the datagram queued
                return;
            }

            *next_index = index.wrapping_add(1);

            routes[usize::from(index)] = Some(kind);

            datagram.index = index;
            datagram.set_state(DatagramState::Sent);
            datagram.sent_at = Some(now);

            *used += datagram.wire_len();

            outgoing.push((kind, datagram.clone()));
        };

        queue(
            LaneKind::Engine,
            &mut self.engine_slot,
            &mut self.routes,
            &mut self.next_index,
            &mut outgoing,
            &mut used,
        );

        for (index, lanes) in self.lanes.iter_mut().enumerate() {
            queue(
                LaneKind::Lifecycle(index),
                &mut lanes.lifecycle_slot,
                &mut self.routes,
                &mut self.next_index,
                &mut outgoing,
                &mut used,
            );
            queue(
                LaneKind::Request(index),
                &mut lanes.request_slot,
                &mut self.routes,
                &mut self.next_index,
                &mut outgoing,
                &mut used,
            );
        }

        if outgoing.is_empty() {
            return None;
        }

        let datagrams: Vec<Datagram> = outgoing.into_iter().map(|(_, datagram)| datagram).collect();

        match frame::pack_frame(&datagrams, buf) {
            Ok(len) => Some(len),
            Err(e) => {
                crate::fmt::error!("Frame assembly failed: {}", e);

                None
            }
        }
    }

    /// Consume a received EtherCAT frame, routing each datagram back to the state machine
    /// that sent it.
    pub fn receive_frame(&mut self, data: &[u8], now: Instant) -> Result<(), Error> {
        for pdu in frame::parse_frame(data)? {
            let pdu = pdu?;

            let Some(kind) = self.routes[usize::from(pdu.index)].take() else {
                crate::fmt::debug!("Dropping unroutable datagram index {}", pdu.index);

                continue;
            };

            let slot = match kind {
                LaneKind::Engine => &mut self.engine_slot,
                LaneKind::Lifecycle(index) => {
                    &mut self.lanes[index].lifecycle_slot
                }
                LaneKind::Request(index) => &mut self.lanes[index].request_slot,
            };

            let Some(datagram) = slot.datagram.as_mut() else {
                continue;
            };

            if datagram.state() != DatagramState::Sent || datagram.index != pdu.index {
                continue;
            }

            if datagram.command.code() != pdu.command_code {
                crate::fmt::error!(
                    "Datagram {} response command mismatch: sent {:#04x}, got {:#04x}",
                    datagram.name,
                    datagram.command.code(),
                    pdu.command_code
                );

                datagram.set_state(DatagramState::Invalid);

                continue;
            }

            if pdu.data.len() != datagram.data().len() {
                datagram.set_state(DatagramState::Invalid);

                return Err(Error::Pdu(PduError::Decode));
            }

            datagram.data_mut().copy_from_slice(pdu.data);
            datagram.working_counter = pdu.working_counter;
            datagram.received_at = Some(now);
            datagram.set_state(DatagramState::Received);
        }

        Ok(())
    }
}
