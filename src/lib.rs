//! A deterministic EtherCAT MainDevice lifecycle engine.
//!
//! `carapace` drives a segment of EtherCAT SubDevices from power-on to cyclic operation: it scans
//! the ring, identifies every SubDevice from its SII EEPROM, and walks each one through
//! `INIT → PRE-OP → SAFE-OP → OP`, configuring sync managers, FMMUs, distributed clocks, PDO
//! mapping and application parameters (CoE/SoE) on the way. Acyclic SDO traffic is serviced
//! alongside.
//!
//! The crate is transport-agnostic and runtime-agnostic: it neither opens sockets nor reads a
//! clock. The caller pumps [`MainDevice::tick`] with a monotonic [`Instant`], pulls assembled
//! EtherCAT frames with [`MainDevice::next_frame`] and pushes received ones back with
//! [`MainDevice::receive_frame`]. Every state machine inside advances by at most one datagram per
//! tick, so the work done per cycle is bounded and predictable.
//!
//! Ethernet framing (MAC addresses, FCS), the cyclic process data scheduler and EoE/FoE transfers
//! are out of scope and belong to the surrounding application.

#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

// This mod MUST go first, so that the others see its macros.
pub(crate) mod fmt;

mod al_control;
mod al_status_code;
mod coe;
mod command;
mod datagram;
mod dl_status;
mod eeprom;
pub mod error;
mod fmmu;
mod frame;
pub(crate) mod fsm;
mod mailbox;
mod maindevice;
mod pdo;
mod register;
mod sdo;
mod soe;
mod subdevice;
mod subdevice_state;
mod sync_manager_channel;
mod time;

pub use al_status_code::AlStatusCode;
pub use command::{Command, Reads, Writes};
pub use datagram::{Datagram, DatagramState};
pub use eeprom::firmware::FirmwareLoader;
#[cfg(feature = "std")]
pub use eeprom::firmware::SiiFirmwareDir;
pub use eeprom::image::SiiImage;
pub use eeprom::types::{CoeDetails, DefaultMailbox, GeneralFlags, SiiGeneral, SiiSyncManager};
pub use error::Error;
pub use mailbox::{MailboxConfig, MailboxProtocols, MailboxWindow};
pub use maindevice::{MainDevice, MainDeviceConfig, RequestHandle, RetryBehaviour, Timeouts};
pub use pdo::{Pdo, PdoEntry};
pub use register::{BaseInfo, PortType, RegisterAddress, SupportFlags};
pub use sdo::{SdoDirection, SdoEntryAccess, SdoEntryInfo, SdoInfo, SdoRequest, SdoRequestState};
pub use soe::SoeConfigItem;
pub use subdevice::config::{DcConfig, FmmuMapping, SdoConfigItem, SubDeviceConfig};
pub use subdevice::ports::{Port, Ports};
pub use subdevice::{SubDevice, SubDeviceIdentity};
pub use subdevice_state::SubDeviceState;
pub use time::Instant;

/// Mask for the 11-bit length fields used in frame and datagram headers.
const LEN_MASK: u16 = 0b0000_0111_1111_1111;

/// The configured station address given to the first SubDevice on the network.
///
/// Subsequent SubDevices are addressed with ascending addresses from this base.
const BASE_SUBDEVICE_ADDRESS: u16 = 0x1000;

/// Maximum number of datagram payload bytes in a single EtherCAT frame.
///
/// A standard Ethernet frame payload is 1500 bytes, minus the 2 byte EtherCAT frame header.
const MAX_FRAME_DATA: usize = 1498;

/// Datagram-level retry count used by every state machine before a timeout escalates.
const FSM_RETRIES: u8 = 5;
