//! The long-lived per-device record.

pub mod config;
pub mod ports;

use crate::al_status_code::AlStatusCode;
use crate::eeprom::image::SiiImage;
use crate::eeprom::types::DefaultMailbox;
use crate::mailbox::{MailboxConfig, MailboxProtocols, ProtocolBuffers};
use crate::pdo::Pdo;
use crate::register::BaseInfo;
use crate::sdo::{SdoDictionary, SdoRequest};
use crate::subdevice_state::SubDeviceState;
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use config::ConfigSlot;
use ports::Ports;

/// The identity block from a SubDevice's SII: the tuple hot-swap matching and image sharing
/// are keyed on.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[wire(bytes = 16)]
pub struct SubDeviceIdentity {
    /// Vendor ID assigned by the EtherCAT Technology Group.
    #[wire(bytes = 4)]
    pub vendor_id: u32,
    /// Vendor specific product code.
    #[wire(bytes = 4)]
    pub product_id: u32,
    /// Product revision.
    #[wire(bytes = 4)]
    pub revision: u32,
    /// Device serial number.
    #[wire(bytes = 4)]
    pub serial: u32,
}

impl core::fmt::Display for SubDeviceIdentity {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "vendor {:#010x}, product {:#010x}, rev {}, serial {}",
            self.vendor_id, self.product_id, self.revision, self.serial
        )
    }
}

/// Which engine-side party currently owns the read mailbox of a SubDevice.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum MailboxLockOwner {
    /// The scan/configuration state machine lane.
    Lifecycle,
    /// The application request servicing lane.
    Request,
}

/// Result of attempting to take the mailbox read lock.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum MailboxPermit {
    /// The caller holds the lock and must poll + fetch itself.
    Acquired,
    /// Another party polls the mailbox; wait for a deposit in the protocol buffer instead.
    ForeignInFlight,
}

/// Mailbox state of one SubDevice: advertised defaults, the effective window configuration,
/// the header counter, the advisory read lock and the per-protocol deposit buffers.
#[derive(Debug, Default)]
pub(crate) struct MailboxState {
    /// Windows and protocols advertised in the SII.
    pub default: DefaultMailbox,
    /// Effective windows, read back from the SM configuration after mailbox bringup.
    pub config: MailboxConfig,
    /// Last used 1..=7 header counter.
    pub counter: u8,
    lock: Option<MailboxLockOwner>,
    /// Replies fetched on behalf of a waiting party, keyed by protocol.
    pub buffers: ProtocolBuffers,
}

impl MailboxState {
    /// Try to become the party that consumes the next read-mailbox fetch.
    ///
    /// Re-acquisition by the current holder is permitted; the lock is advisory and
    /// cooperative, not a mutex.
    pub(crate) fn try_lock(&mut self, owner: MailboxLockOwner) -> MailboxPermit {
        match self.lock {
            None => {
                self.lock = Some(owner);

                MailboxPermit::Acquired
            }
            Some(current) if current == owner => MailboxPermit::Acquired,
            Some(_) => MailboxPermit::ForeignInFlight,
        }
    }

    /// Release the lock if `owner` holds it.
    pub(crate) fn unlock(&mut self, owner: MailboxLockOwner) {
        if self.lock == Some(owner) {
            self.lock = None;
        }
    }

    /// Advance and return the next mailbox header counter.
    pub(crate) fn next_counter(&mut self) -> u8 {
        self.counter = crate::mailbox::next_counter(self.counter);

        self.counter
    }
}

/// One discovered EtherCAT SubDevice.
///
/// Created on first discovery, populated by the scan state machine, driven between AL states
/// by the configuration state machine and torn down on engine shutdown.
#[derive(Debug)]
pub struct SubDevice {
    /// Position of the device in the ring, used for auto increment addressing until a station
    /// address is assigned.
    pub(crate) ring_position: u16,
    /// The station address assigned during scan; all post-scan traffic uses it.
    pub(crate) configured_address: u16,
    /// Set once the scan has finished, successfully or not.
    pub(crate) scanned: bool,
    /// Optional persistent alias from the SII.
    pub(crate) alias_address: u16,

    /// SII identity.
    pub(crate) identity: SubDeviceIdentity,
    /// Device name from the SII strings, or empty.
    pub(crate) name: heapless::String<64>,

    /// Base information block: FMMU/SM counts, DC support.
    pub(crate) base: BaseInfo,
    /// Port states and topology flags.
    pub(crate) ports: Ports,
    /// The device answered a read of the DC system time register.
    pub(crate) has_dc_system_time: bool,

    /// Last read AL state.
    pub(crate) current_state: SubDeviceState,
    /// State the application wants the device in.
    pub(crate) requested_state: SubDeviceState,
    /// Last AL status code read from the device, if any.
    pub(crate) last_al_status_code: Option<AlStatusCode>,

    pub(crate) mailbox: MailboxState,

    /// The (possibly shared) SII image.
    pub(crate) sii_image: Option<Arc<SiiImage>>,

    /// Effective PDO set: read over CoE where possible, otherwise the SII defaults.
    pub(crate) pdos: alloc::vec::Vec<Pdo>,

    /// Object dictionary, populated on request by dictionary enumeration.
    pub(crate) dictionary: SdoDictionary,

    /// Queued application SDO requests, keyed by engine-assigned handle.
    pub(crate) requests: VecDeque<(u64, SdoRequest)>,
    /// Completed application SDO requests awaiting pickup.
    pub(crate) finished_requests: VecDeque<(u64, SdoRequest)>,

    /// The device is quarantined after an internal error; the engine leaves it alone but
    /// continues serving the rest of the ring.
    pub(crate) error_flag: bool,

    /// Application configuration attachment point.
    pub(crate) config: ConfigSlot,
}

impl SubDevice {
    pub(crate) fn new(ring_position: u16, configured_address: u16) -> Self {
        Self {
            ring_position,
            configured_address,
            scanned: false,
            alias_address: 0,
            identity: SubDeviceIdentity::default(),
            name: heapless::String::new(),
            base: BaseInfo::default(),
            ports: Ports::default(),
            has_dc_system_time: false,
            current_state: SubDeviceState::None,
            requested_state: SubDeviceState::None,
            last_al_status_code: None,
            mailbox: MailboxState::default(),
            sii_image: None,
            pdos: alloc::vec::Vec::new(),
            dictionary: SdoDictionary::new(),
            requests: VecDeque::new(),
            finished_requests: VecDeque::new(),
            error_flag: false,
            config: ConfigSlot::default(),
        }
    }

    /// The station address assigned during scan.
    pub fn configured_address(&self) -> u16 {
        self.configured_address
    }

    /// The device's position in the ring.
    pub fn ring_position(&self) -> u16 {
        self.ring_position
    }

    /// The persistent station alias, or 0 if none is programmed.
    pub fn alias_address(&self) -> u16 {
        self.alias_address
    }

    /// SII identity.
    pub fn identity(&self) -> SubDeviceIdentity {
        self.identity
    }

    /// Device name from the SII strings category.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Last AL state read from the device.
    pub fn current_state(&self) -> SubDeviceState {
        self.current_state
    }

    /// The state the application requested.
    pub fn requested_state(&self) -> SubDeviceState {
        self.requested_state
    }

    /// Last AL status code read from the device.
    pub fn last_al_status_code(&self) -> Option<AlStatusCode> {
        self.last_al_status_code
    }

    /// Port states and topology flags.
    pub fn ports(&self) -> &Ports {
        &self.ports
    }

    /// The base information block read during scan.
    pub fn base_info(&self) -> BaseInfo {
        self.base
    }

    /// `true` if the device answered the DC system time register probe.
    pub fn has_dc_system_time(&self) -> bool {
        self.has_dc_system_time
    }

    /// The parsed SII image, shared with identical devices where possible.
    pub fn sii_image(&self) -> Option<&Arc<SiiImage>> {
        self.sii_image.as_ref()
    }

    /// The device's effective PDO set.
    pub fn pdos(&self) -> &[Pdo] {
        &self.pdos
    }

    /// The object dictionary, if it has been enumerated.
    pub fn dictionary(&self) -> &SdoDictionary {
        &self.dictionary
    }

    /// `true` once an internal error has quarantined this device.
    pub fn error_flag(&self) -> bool {
        self.error_flag
    }

    /// Protocols advertised in the SII.
    pub fn mailbox_protocols(&self) -> MailboxProtocols {
        self.mailbox.default.supported_protocols
    }

    /// The effective read (SubDevice → MainDevice) mailbox window size in bytes.
    pub fn configured_read_mailbox_len(&self) -> u16 {
        self.mailbox.config.read.len
    }

    /// The effective write (MainDevice → SubDevice) mailbox window size in bytes.
    pub fn configured_write_mailbox_len(&self) -> u16 {
        self.mailbox.config.write.len
    }

    /// `true` if the SubDevice advertises CoE support.
    pub fn supports_coe(&self) -> bool {
        self.mailbox
            .default
            .supported_protocols
            .contains(MailboxProtocols::COE)
    }

    /// `true` if the SubDevice advertises SoE support.
    pub fn supports_soe(&self) -> bool {
        self.mailbox
            .default
            .supported_protocols
            .contains(MailboxProtocols::SOE)
    }

    /// Fail every queued request and drop all buffers; used at teardown and when the device
    /// disappears from the ring.
    pub(crate) fn cancel_requests(&mut self) {
        while let Some((handle, mut request)) = self.requests.pop_front() {
            request.fail(crate::error::Error::Cancelled);

            self.finished_requests.push_back((handle, request));
        }

        self.mailbox.buffers.clear();
    }
}
