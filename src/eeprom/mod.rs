//! SubDevice Information Interface (SII): the per-device EEPROM image describing identity,
//! mailbox layout and default process data configuration.

pub mod firmware;
pub mod image;
pub mod types;

/// Word address of the configured station alias in the fixed SII header.
pub(crate) const SII_WORD_ALIAS: u16 = 0x0004;

/// Word address of the identity block (vendor, product, revision, serial: four `u32`s).
pub(crate) const SII_WORD_IDENTITY: u16 = 0x0008;

/// Word address of the first word after the fixed header read by the identity probe.
pub(crate) const SII_WORD_PROBE_END: u16 = 0x0010;

/// Word address of the mailbox/protocol configuration block (bootstrap + standard windows,
/// supported protocols).
pub(crate) const SII_WORD_MAILBOX_CONFIG: u16 = 0x0014;

/// Word address of the first category header, positioned after the fixed fields defined in
/// ETG2010 Table 2.
pub(crate) const SII_FIRST_CATEGORY: u16 = 0x0040;

/// Hard cap on the size of an SII image in words, guarding the category walk against EEPROMs
/// with a missing end sentinel.
pub(crate) const SII_SIZE_CAP_WORDS: u16 = 0x4000;
