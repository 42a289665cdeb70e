//! The cooperative state machine contract.
//!
//! Every state machine in this module advances by at most one datagram per invocation: a call
//! to its `step` method consumes the completed datagram from the previous step (if any) and
//! either hands the engine exactly one new datagram, suspends without wire work, or
//! terminates. No state machine ever blocks or loops over wire operations internally, which
//! bounds the work per engine tick to a constant per SubDevice.

pub(crate) mod coe;
pub(crate) mod pdo;
pub(crate) mod request;
pub(crate) mod sii;
pub(crate) mod state_change;
pub(crate) mod subdevice_config;
pub(crate) mod subdevice_scan;

use crate::datagram::Datagram;
use crate::eeprom::firmware::FirmwareLoader;
use crate::eeprom::image::SiiImage;
use crate::error::Error;
use crate::maindevice::{MainDeviceConfig, Timeouts};
use crate::pdo::Pdo;
use crate::subdevice::SubDeviceIdentity;
use crate::time::Instant;
use alloc::sync::Arc;
use alloc::vec::Vec;

/// The outcome of advancing a state machine by one step.
#[derive(Debug)]
pub(crate) enum Step<T = ()> {
    /// Queue this datagram and call back once it has completed.
    Send(Datagram),
    /// Waiting on something other than a datagram (e.g. the mailbox read lock); poll again
    /// next tick.
    Wait,
    /// Finished successfully.
    Done(T),
    /// Finished with an error.
    Failed(Error),
}

impl<T> Step<T> {
    /// Map the success value, leaving the other variants untouched.
    pub(crate) fn map<U>(self, f: impl FnOnce(T) -> U) -> Step<U> {
        match self {
            Step::Send(datagram) => Step::Send(datagram),
            Step::Wait => Step::Wait,
            Step::Done(value) => Step::Done(f(value)),
            Step::Failed(e) => Step::Failed(e),
        }
    }
}

/// Shared engine state handed to every state machine step.
pub(crate) struct Ctx<'engine> {
    /// The caller-injected timestamp of the current tick.
    pub now: Instant,
    pub timeouts: &'engine Timeouts,
    pub config: &'engine MainDeviceConfig,
    /// Identity-keyed arena of shared SII images.
    pub sii_images: &'engine mut Vec<Arc<SiiImage>>,
    /// CoE-read PDO sets cached per identity so hot-swapped duplicates skip the read.
    pub pdo_cache: &'engine mut Vec<(SubDeviceIdentity, Vec<Pdo>)>,
    /// Optional SII image override source.
    pub firmware: Option<&'engine dyn FirmwareLoader>,
}

/// Copy a NUL-padded name field into a bounded string, cutting at a character boundary.
pub(crate) fn push_truncated<const N: usize>(dst: &mut heapless::String<N>, src: &[u8]) {
    let Ok(s) = core::str::from_utf8(src) else {
        return;
    };

    let s = s.trim_end_matches('\0');

    let mut end = s.len().min(dst.capacity());

    while !s.is_char_boundary(end) {
        end -= 1;
    }

    let _ = dst.push_str(&s[..end]);
}

impl Ctx<'_> {
    /// Find a cached SII image matching `identity`.
    pub(crate) fn cached_image(&self, identity: SubDeviceIdentity) -> Option<Arc<SiiImage>> {
        self.sii_images
            .iter()
            .find(|image| image.identity == identity)
            .cloned()
    }

    /// Find a cached CoE-read PDO set matching `identity`.
    pub(crate) fn cached_pdos(&self, identity: SubDeviceIdentity) -> Option<Vec<Pdo>> {
        self.pdo_cache
            .iter()
            .find(|(cached, _)| *cached == identity)
            .map(|(_, pdos)| pdos.clone())
    }
}
