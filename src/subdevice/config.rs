//! Application-supplied SubDevice configuration.
//!
//! A configuration is attached to a discovered SubDevice and consumed by the configuration
//! state machine on the way to the requested AL state. The application may detach it at any
//! time; the state machine notices at its next sequencing edge and restarts or aborts.

use crate::pdo::Pdo;
use crate::soe::SoeConfigItem;
use alloc::vec::Vec;

/// One SDO write applied while the SubDevice is in PRE-OP.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SdoConfigItem {
    /// Object index.
    pub index: u16,
    /// Object subindex.
    pub sub_index: u8,
    /// Write the whole object in one access.
    pub complete_access: bool,
    /// Value bytes.
    pub data: Vec<u8>,
}

/// Distributed clock parameters for one SubDevice.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct DcConfig {
    /// The AssignActivate word written to `0x0980`; zero leaves sync generation disabled.
    pub assign_activate: u16,
    /// SYNC0 cycle time in ns.
    pub sync0_cycle_ns: u32,
    /// Shift of the first SYNC0 pulse relative to the aligned cycle start, in ns.
    pub sync0_shift_ns: u32,
    /// SYNC1 cycle time in ns.
    pub sync1_cycle_ns: u32,
}

/// One requested FMMU translation window.
///
/// The physical side is given as a sync manager index; the configuration state machine
/// resolves it to the SM's physical start address once the SM layout is final.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct FmmuMapping {
    /// Start of the window in the logical address space.
    pub logical_start_address: u32,
    /// Window length in bytes.
    pub length_bytes: u16,
    /// The sync manager whose window this FMMU maps.
    pub sync_manager: u8,
    /// MainDevice reads from this window.
    pub read: bool,
    /// MainDevice writes to this window.
    pub write: bool,
}

/// Everything the application wants configured on one SubDevice.
#[derive(Debug, Clone, Default)]
pub struct SubDeviceConfig {
    /// SDO writes applied in PRE-OP, in order.
    pub sdo_configs: Vec<SdoConfigItem>,
    /// SoE IDN writes applied in PRE-OP, in order.
    pub soe_configs_pre_op: Vec<SoeConfigItem>,
    /// SoE IDN writes applied in SAFE-OP, in order.
    pub soe_configs_safe_op: Vec<SoeConfigItem>,
    /// Desired PDO assignment and mapping. PDOs with a `sync_manager` of `None` are left to
    /// the SubDevice's defaults.
    pub pdos: Vec<Pdo>,
    /// FMMU windows to configure, in FMMU index order.
    pub fmmus: Vec<FmmuMapping>,
    /// Watchdog divider written to `0x0400`.
    pub watchdog_divider: Option<u16>,
    /// Sync manager watchdog interval written to `0x0420`.
    pub watchdog_intervals: Option<u16>,
    /// Distributed clock setup.
    pub dc: Option<DcConfig>,
}

/// The attachment point of a [`SubDeviceConfig`] on a SubDevice.
///
/// The generation counter invalidates any in-flight configuration run when the application
/// attaches or detaches a config: state machines capture the generation when they start and
/// compare it at every sequencing edge.
#[derive(Debug, Default)]
pub(crate) struct ConfigSlot {
    config: Option<SubDeviceConfig>,
    generation: u32,
}

impl ConfigSlot {
    pub(crate) fn attach(&mut self, config: SubDeviceConfig) {
        self.config = Some(config);
        self.generation = self.generation.wrapping_add(1);
    }

    pub(crate) fn detach(&mut self) -> Option<SubDeviceConfig> {
        self.generation = self.generation.wrapping_add(1);

        self.config.take()
    }

    pub(crate) fn generation(&self) -> u32 {
        self.generation
    }

    /// The attached config, only while `generation` still matches the caller's captured value.
    pub(crate) fn get(&self, generation: u32) -> Option<&SubDeviceConfig> {
        if self.generation == generation {
            self.config.as_ref()
        } else {
            None
        }
    }

    pub(crate) fn current(&self) -> Option<&SubDeviceConfig> {
        self.config.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detach_invalidates_captured_generation() {
        let mut slot = ConfigSlot::default();

        slot.attach(SubDeviceConfig::default());

        let generation = slot.generation();

        assert!(slot.get(generation).is_some());

        slot.detach();

        assert!(slot.get(generation).is_none());

        // Re-attaching bumps the generation again; the old capture stays invalid
        slot.attach(SubDeviceConfig::default());

        assert!(slot.get(generation).is_none());
        assert!(slot.get(slot.generation()).is_some());
    }
}
