//! AL (application layer) state for a single SubDevice.

/// State of the application layer state machine in a SubDevice.
///
/// Read from register `0x0130`
/// ([`RegisterAddress::AlStatus`](crate::register::RegisterAddress::AlStatus)).
///
/// Defined in ETG1000.6 6.4.1, ETG1000.6 Table 9.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[doc(alias = "SlaveState")]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[repr(u8)]
pub enum SubDeviceState {
    /// No state recorded/read/known.
    #[default]
    None = 0x00,
    /// EtherCAT `INIT` state.
    Init = 0x01,
    /// EtherCAT `PRE-OP` state.
    PreOp = 0x02,
    /// EtherCAT `BOOT` state.
    Bootstrap = 0x03,
    /// EtherCAT `SAFE-OP` state.
    SafeOp = 0x04,
    /// EtherCAT `OP` state.
    Op = 0x08,
    /// State is a combination of the above variants or is an unknown value.
    #[wire(catch_all)]
    Other(u8),
}

impl SubDeviceState {
    /// `true` if a SubDevice in this state can exchange mailbox traffic.
    pub fn is_mailbox_capable(&self) -> bool {
        matches!(
            self,
            SubDeviceState::PreOp
                | SubDeviceState::SafeOp
                | SubDeviceState::Op
                | SubDeviceState::Bootstrap
        )
    }

    /// Numeric ordering of states along the bringup sequence, used to decide which intermediate
    /// transitions a requested state change must pass through.
    pub(crate) fn rank(&self) -> u8 {
        match self {
            SubDeviceState::None | SubDeviceState::Other(_) => 0,
            SubDeviceState::Init => 1,
            SubDeviceState::PreOp | SubDeviceState::Bootstrap => 2,
            SubDeviceState::SafeOp => 3,
            SubDeviceState::Op => 4,
        }
    }
}

impl core::fmt::Display for SubDeviceState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            SubDeviceState::None => f.write_str("None"),
            SubDeviceState::Init => f.write_str("Init"),
            SubDeviceState::PreOp => f.write_str("Pre-Operational"),
            SubDeviceState::Bootstrap => f.write_str("Bootstrap"),
            SubDeviceState::SafeOp => f.write_str("Safe-Operational"),
            SubDeviceState::Op => f.write_str("Operational"),
            SubDeviceState::Other(value) => write!(f, "Other({:01x})", value),
        }
    }
}
