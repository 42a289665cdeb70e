//! Servicing of queued application SDO requests.
//!
//! Each SubDevice has a FIFO of pending [`SdoRequest`](crate::sdo::SdoRequest)s. This machine
//! drains it one transfer at a time once the device can exchange mailbox traffic, running in
//! its own lane so it can overlap with (and share the mailbox lock against) the lifecycle
//! machines.

use crate::datagram::Datagram;
use crate::error::Error;
use crate::fsm::coe::{CoeDownload, CoeUpload};
use crate::fsm::{Ctx, Step};
use crate::sdo::{SdoDirection, SdoRequest};
use crate::subdevice::{MailboxLockOwner, SubDevice};
use alloc::vec::Vec;

#[derive(Debug)]
enum Transfer {
    Upload(CoeUpload),
    Download(CoeDownload),
}

#[derive(Debug)]
struct Active {
    handle: u64,
    request: SdoRequest,
    transfer: Transfer,
}

/// Drains one SubDevice's application request queue.
#[derive(Debug, Default)]
pub(crate) struct RequestService {
    active: Option<Active>,
}

impl RequestService {
    pub(crate) fn step(
        &mut self,
        ctx: &mut Ctx,
        sub: &mut SubDevice,
        reply: Option<&Datagram>,
    ) -> Step {
        // Expire requests that sat in the queue past their issue timeout
        while let Some((_, request)) = sub.requests.front() {
            let expired = request
                .issue_timeout
                .zip(request.issued_at)
                .is_some_and(|(timeout, issued)| ctx.now.duration_since(issued) >= timeout);

            if !expired {
                break;
            }

            let (handle, mut request) = sub.requests.pop_front().expect("peeked");

            request.fail(Error::Timeout);
            sub.finished_requests.push_back((handle, request));
        }

        let Some(active) = self.active.as_mut() else {
            return self.try_begin(ctx, sub);
        };

        let step = match &mut active.transfer {
            Transfer::Upload(upload) => upload.step(ctx, sub, reply).map(Some),
            Transfer::Download(download) => download.step(ctx, sub, reply).map(|_| None),
        };

        match step {
            Step::Done(data) => {
                self.finish(sub, Ok(data.unwrap_or_default()));

                // Pick the next request up on the following tick
                Step::Wait
            }
            Step::Failed(e) => {
                self.finish(sub, Err(e));

                Step::Wait
            }
            Step::Send(datagram) => Step::Send(datagram),
            Step::Wait => Step::Wait,
        }
    }

    fn try_begin(&mut self, ctx: &mut Ctx, sub: &mut SubDevice) -> Step {
        if sub.error_flag
            || !sub.current_state.is_mailbox_capable()
            || !sub.supports_coe()
            || sub.requests.is_empty()
        {
            return Step::Wait;
        }

        let (handle, mut request) = sub.requests.pop_front().expect("non-empty");

        request.set_busy(ctx.now);

        let (transfer, step) = match request.direction {
            SdoDirection::Upload => {
                let mut upload = CoeUpload::new(
                    MailboxLockOwner::Request,
                    request.index,
                    request.sub_index,
                    request.complete_access,
                    request.response_timeout,
                );

                let step = upload.start(ctx, sub).map(Some);

                (Transfer::Upload(upload), step)
            }
            SdoDirection::Download => {
                let mut download = CoeDownload::new(
                    MailboxLockOwner::Request,
                    request.index,
                    request.sub_index,
                    request.complete_access,
                    request.data().to_vec(),
                    request.response_timeout,
                );

                let step = download.start(ctx, sub).map(|_| None);

                (Transfer::Download(download), step)
            }
        };

        self.active = Some(Active {
            handle,
            request,
            transfer,
        });

        match step {
            Step::Failed(e) => {
                self.finish(sub, Err(e));

                Step::Wait
            }
            Step::Done(data) => {
                self.finish(sub, Ok(data.unwrap_or_default()));

                Step::Wait
            }
            Step::Send(datagram) => Step::Send(datagram),
            Step::Wait => Step::Wait,
        }
    }

    /// Settle the active request and park it for pickup by the application.
    fn finish(&mut self, sub: &mut SubDevice, result: Result<Vec<u8>, Error>) {
        let Some(Active {
            handle,
            mut request,
            ..
        }) = self.active.take()
        else {
            return;
        };

        match result {
            Ok(data) => request.succeed(data),
            Err(e) => {
                crate::fmt::warn!(
                    "SDO request {:#06x}:{} on SubDevice {:#06x} failed: {}",
                    request.index,
                    request.sub_index,
                    sub.configured_address,
                    e
                );

                request.fail(e);
            }
        }

        sub.finished_requests.push_back((handle, request));
    }

    /// Abort the in-flight transfer (engine shutdown); the request fails as cancelled.
    pub(crate) fn cancel(&mut self, sub: &mut SubDevice) {
        self.finish(sub, Err(Error::Cancelled));
    }
}
