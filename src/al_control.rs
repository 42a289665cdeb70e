//! AL control and status words for an individual SubDevice.

use crate::subdevice_state::SubDeviceState;

/// The AL control word, written to register `0x0120` to request a state transition or
/// acknowledge an error.
///
/// Defined in ETG1000.6 Table 9 - AL Control Description.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[wire(bytes = 2)]
pub struct AlControl {
    /// Requested state.
    #[wire(bits = 4)]
    pub state: SubDeviceState,
    /// Error acknowledge flag.
    #[wire(bits = 1)]
    pub acknowledge: bool,
    /// ID request flag.
    #[wire(bits = 1, post_skip = 10)]
    pub id_request: bool,
}

impl AlControl {
    /// Request a transition to the given state.
    pub fn new(state: SubDeviceState) -> Self {
        Self {
            state,
            acknowledge: false,
            id_request: false,
        }
    }

    /// Acknowledge an AL error by writing the current state with the acknowledge flag set.
    pub fn ack(state: SubDeviceState) -> Self {
        Self {
            state,
            acknowledge: true,
            id_request: false,
        }
    }

    /// Reset to init, acknowledging any pending error.
    pub fn reset() -> Self {
        Self {
            state: SubDeviceState::Init,
            acknowledge: true,
            ..Default::default()
        }
    }
}

/// The AL status word read from register `0x0130`.
///
/// Defined in ETG1000.6 Table 10 - AL Status Description.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[wire(bytes = 2)]
pub struct AlStatus {
    /// Current state.
    #[wire(bits = 4)]
    pub state: SubDeviceState,
    /// Error indicator; details are in the AL status code register (`0x0134`).
    #[wire(bits = 1)]
    pub error: bool,
    /// Device identification value loaded.
    #[wire(bits = 1, post_skip = 10)]
    pub id_loaded: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethercrab_wire::{EtherCrabWireRead, EtherCrabWireWriteSized};

    #[test]
    fn al_control() {
        let value = AlControl {
            state: SubDeviceState::SafeOp,
            acknowledge: true,
            id_request: false,
        };

        let packed = value.pack();

        assert_eq!(packed, [0x04 | 0x10, 0x00]);
    }

    #[test]
    fn unpack_status() {
        let parsed = AlStatus::unpack_from_slice(&[0x02 | 0x10, 0x00]).unwrap();

        assert_eq!(
            parsed,
            AlStatus {
                state: SubDeviceState::PreOp,
                error: true,
                id_loaded: false,
            }
        );
    }

    #[test]
    fn unpack_short() {
        let parsed = AlControl::unpack_from_slice(&[0x04 | 0x10]);

        assert!(parsed.is_err());
    }
}
