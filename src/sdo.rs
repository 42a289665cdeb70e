//! SDO dictionary records and application-level SDO transfer requests.

use crate::coe::abort_code::CoeAbortCode;
use crate::error::Error;
use crate::time::Instant;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::time::Duration;

/// Default per-request response timeout.
pub(crate) const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_millis(1000);

/// Access rights of one dictionary entry in each mailbox-capable AL state.
///
/// Decoded from the object access word of an entry description: bits 0-2 grant read in
/// PRE-OP/SAFE-OP/OP, bits 3-5 grant write.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct SdoEntryAccess {
    pub read_pre_op: bool,
    pub read_safe_op: bool,
    pub read_op: bool,
    pub write_pre_op: bool,
    pub write_safe_op: bool,
    pub write_op: bool,
}

impl SdoEntryAccess {
    /// Decode from the object access word of a Get Entry Description response.
    pub fn from_word(raw: u16) -> Self {
        Self {
            read_pre_op: raw & 0x0001 != 0,
            read_safe_op: raw & 0x0002 != 0,
            read_op: raw & 0x0004 != 0,
            write_pre_op: raw & 0x0008 != 0,
            write_safe_op: raw & 0x0010 != 0,
            write_op: raw & 0x0020 != 0,
        }
    }
}

/// Description of one subindex of a dictionary object.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SdoEntryInfo {
    /// CoE data type number.
    pub data_type: u16,
    /// Entry size in bits.
    pub bit_length: u16,
    /// Per-state access rights.
    pub access: SdoEntryAccess,
    /// Entry description string.
    pub description: heapless::String<64>,
}

/// One object in a SubDevice's object dictionary, populated by dictionary enumeration.
#[derive(Debug, Clone, Default)]
pub struct SdoInfo {
    /// Object index.
    pub index: u16,
    /// CoE object code (variable, array, record, ...).
    pub object_code: u8,
    /// Highest subindex of the object.
    pub max_sub_index: u8,
    /// Object name.
    pub name: heapless::String<64>,
    /// Entry descriptions keyed by subindex. Subindices that failed to enumerate are absent.
    pub entries: BTreeMap<u8, SdoEntryInfo>,
}

/// A SubDevice's object dictionary, keyed by object index.
pub(crate) type SdoDictionary = BTreeMap<u16, SdoInfo>;

/// Transfer direction of an SDO request.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum SdoDirection {
    /// SubDevice → MainDevice.
    Upload,
    /// MainDevice → SubDevice.
    Download,
}

/// Lifecycle of an application SDO request.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum SdoRequestState {
    /// Created but not yet handed to the engine.
    #[default]
    Init,
    /// Waiting in a SubDevice's request queue.
    Queued,
    /// A transfer state machine is processing the request.
    Busy,
    /// The transfer completed; for uploads the data buffer holds the result.
    Success,
    /// The transfer failed; see [`SdoRequest::error`] and [`SdoRequest::abort_code`].
    Failure,
}

/// An application-level handle for one pending CoE transfer.
#[derive(Debug, Clone)]
pub struct SdoRequest {
    /// Object index.
    pub index: u16,
    /// Object subindex.
    pub sub_index: u8,
    /// Transfer the whole object in one access instead of a single subindex.
    pub complete_access: bool,
    /// Transfer direction.
    pub direction: SdoDirection,

    data: Vec<u8>,

    /// How long the request may sit in the queue before it is issued.
    pub issue_timeout: Option<Duration>,
    /// How long each mailbox exchange may wait for its response.
    pub response_timeout: Duration,

    pub(crate) issued_at: Option<Instant>,
    pub(crate) sent_at: Option<Instant>,

    state: SdoRequestState,
    error: Option<Error>,
    abort_code: Option<CoeAbortCode>,
}

impl SdoRequest {
    /// Create an upload (read) request.
    pub fn upload(index: u16, sub_index: u8) -> Self {
        Self {
            index,
            sub_index,
            complete_access: false,
            direction: SdoDirection::Upload,
            data: Vec::new(),
            issue_timeout: None,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            issued_at: None,
            sent_at: None,
            state: SdoRequestState::Init,
            error: None,
            abort_code: None,
        }
    }

    /// Create a download (write) request carrying `data`.
    pub fn download(index: u16, sub_index: u8, data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: data.into(),
            direction: SdoDirection::Download,
            ..Self::upload(index, sub_index)
        }
    }

    /// Access the object with CoE complete access.
    pub fn complete_access(mut self) -> Self {
        self.complete_access = true;

        self
    }

    /// Fail the request if it has not been issued to the wire within `timeout`.
    pub fn with_issue_timeout(mut self, timeout: Duration) -> Self {
        self.issue_timeout = Some(timeout);

        self
    }

    /// Override the default 1 s per-exchange response timeout.
    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;

        self
    }

    /// Current request state.
    pub fn state(&self) -> SdoRequestState {
        self.state
    }

    /// The transfer payload: upload result on success, download input otherwise.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// The error that failed this request, if any.
    pub fn error(&self) -> Option<Error> {
        self.error
    }

    /// The SDO abort code returned by the SubDevice, if the failure was an abort.
    pub fn abort_code(&self) -> Option<CoeAbortCode> {
        self.abort_code
    }

    pub(crate) fn set_queued(&mut self, now: Instant) {
        self.state = SdoRequestState::Queued;
        self.issued_at = Some(now);
    }

    pub(crate) fn set_busy(&mut self, now: Instant) {
        self.state = SdoRequestState::Busy;
        self.sent_at = Some(now);
    }

    pub(crate) fn succeed(&mut self, data: Vec<u8>) {
        if self.direction == SdoDirection::Upload {
            self.data = data;
        }

        self.state = SdoRequestState::Success;
    }

    pub(crate) fn fail(&mut self, error: Error) {
        if let Error::Mailbox(crate::error::MailboxError::Aborted { code, .. }) = error {
            self.abort_code = Some(code);
        }

        self.error = Some(error);
        self.state = SdoRequestState::Failure;
    }

    /// `true` once the request has left the `Queued`/`Busy` states.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.state,
            SdoRequestState::Success | SdoRequestState::Failure
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MailboxError;

    #[test]
    fn abort_failure_records_code() {
        let mut request = SdoRequest::upload(0x1018, 1);

        request.fail(Error::Mailbox(MailboxError::Aborted {
            code: CoeAbortCode::NotFound,
            address: 0x1018,
            sub_index: 1,
        }));

        assert_eq!(request.state(), SdoRequestState::Failure);
        assert_eq!(request.abort_code(), Some(CoeAbortCode::NotFound));
    }

    #[test]
    fn upload_success_replaces_data() {
        let mut request = SdoRequest::upload(0x6000, 1);

        request.succeed(alloc::vec![1, 2, 3, 4]);

        assert_eq!(request.data(), &[1, 2, 3, 4]);
        assert!(request.is_terminal());
    }

    #[test]
    fn download_success_keeps_payload() {
        let mut request = SdoRequest::download(0x3000, 1, [9u8, 8, 7]);

        request.succeed(Vec::new());

        assert_eq!(request.data(), &[9, 8, 7]);
    }
}
