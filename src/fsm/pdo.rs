//! PDO assignment and mapping over CoE: reading a SubDevice's current configuration during
//! scan, and rewriting it from the application's desired configuration.
//!
//! The PDO assignment of sync manager `n` lives at SDO `0x1c10 + n`; each assigned PDO's
//! mapping lives at the PDO's own index (ETG1000.6 Table 67 onwards).

use crate::coe::abort_code::CoeAbortCode;
use crate::datagram::Datagram;
use crate::error::{Error, MailboxError};
use crate::fsm::coe::{CoeDownload, CoeUpload};
use crate::fsm::{Ctx, Step};
use crate::pdo::{Pdo, PdoEntry};
use crate::subdevice::{MailboxLockOwner, SubDevice};
use crate::sync_manager_channel::SM_BASE_ADDRESS;
use alloc::vec::Vec;
use core::time::Duration;

/// First sync manager that can carry process data; SM0/SM1 are the mailbox.
const FIRST_PDO_SM: u8 = 2;

#[derive(Debug)]
enum ReadState {
    /// Uploading `0x1c1n:00`, the number of PDOs assigned to SM `n`.
    AssignCount,
    /// Uploading `0x1c1n:k`, one assigned PDO index.
    AssignEntry { count: u8, k: u8 },
    /// Uploading `pdo:00`, the number of mapped entries.
    MapCount { queue: Vec<usize>, at: usize },
    /// Uploading `pdo:k`, one packed mapping entry.
    MapEntry {
        queue: Vec<usize>,
        at: usize,
        count: u8,
        k: u8,
    },
}

/// Reads the complete PDO assignment and mapping of every process data sync manager.
#[derive(Debug)]
pub(crate) struct PdoRead {
    owner: MailboxLockOwner,
    response_timeout: Duration,
    sm: u8,
    sm_count: u8,
    state: ReadState,
    upload: CoeUpload,
    pdos: Vec<Pdo>,
}

impl PdoRead {
    pub(crate) fn new(
        owner: MailboxLockOwner,
        sm_count: u8,
        response_timeout: Duration,
    ) -> Self {
        Self {
            owner,
            response_timeout,
            sm: FIRST_PDO_SM,
            sm_count,
            state: ReadState::AssignCount,
            upload: CoeUpload::new(
                owner,
                SM_BASE_ADDRESS + u16::from(FIRST_PDO_SM),
                0,
                false,
                response_timeout,
            ),
            pdos: Vec::new(),
        }
    }

    fn upload(&mut self, ctx: &Ctx, sub: &mut SubDevice, index: u16, sub_index: u8) -> Step<Vec<Pdo>> {
        self.upload = CoeUpload::new(self.owner, index, sub_index, false, self.response_timeout);

        self.upload.start(ctx, sub).map(|_| Vec::new())
    }

    pub(crate) fn start(&mut self, ctx: &Ctx, sub: &mut SubDevice) -> Step<Vec<Pdo>> {
        if self.sm >= self.sm_count {
            return Step::Done(Vec::new());
        }

        self.state = ReadState::AssignCount;

        self.upload(ctx, sub, SM_BASE_ADDRESS + u16::from(self.sm), 0)
    }

    /// Move to the next sync manager, or wrap up.
    fn next_sm(&mut self, ctx: &Ctx, sub: &mut SubDevice) -> Step<Vec<Pdo>> {
        self.sm += 1;

        if self.sm >= self.sm_count {
            return Step::Done(core::mem::take(&mut self.pdos));
        }

        self.state = ReadState::AssignCount;

        self.upload(ctx, sub, SM_BASE_ADDRESS + u16::from(self.sm), 0)
    }

    /// Start reading the mappings of the PDOs collected for the current SM, positions given in
    /// `queue`.
    fn start_mapping(
        &mut self,
        ctx: &Ctx,
        sub: &mut SubDevice,
        queue: Vec<usize>,
        at: usize,
    ) -> Step<Vec<Pdo>> {
        let Some(&position) = queue.get(at) else {
            return self.next_sm(ctx, sub);
        };

        let index = self.pdos[position].index;

        self.state = ReadState::MapCount { queue, at };

        self.upload(ctx, sub, index, 0)
    }

    pub(crate) fn step(
        &mut self,
        ctx: &Ctx,
        sub: &mut SubDevice,
        reply: Option<&Datagram>,
    ) -> Step<Vec<Pdo>> {
        let step = self.upload.step(ctx, sub, reply);

        let data = match step {
            Step::Done(data) => data,
            Step::Failed(Error::Mailbox(MailboxError::Aborted { code, .. }))
                if matches!(self.state, ReadState::AssignCount)
                    && matches!(
                        code,
                        CoeAbortCode::NotFound | CoeAbortCode::SubIndexNotFound
                    ) =>
            {
                // This SM has no assignment object; perfectly normal for simple devices
                return self.next_sm(ctx, sub);
            }
            other => return other.map(|_| Vec::new()),
        };

        match core::mem::replace(&mut self.state, ReadState::AssignCount) {
            ReadState::AssignCount => {
                let count = data.first().copied().unwrap_or(0);

                if count == 0 {
                    return self.next_sm(ctx, sub);
                }

                self.state = ReadState::AssignEntry { count, k: 1 };

                self.upload(ctx, sub, SM_BASE_ADDRESS + u16::from(self.sm), 1)
            }

            ReadState::AssignEntry { count, k } => {
                let index = data
                    .get(0..2)
                    .map(|raw| u16::from_le_bytes([raw[0], raw[1]]))
                    .unwrap_or(0);

                self.pdos.push(Pdo {
                    index,
                    sync_manager: Some(self.sm),
                    name: heapless::String::new(),
                    entries: Vec::new(),
                });

                if k < count {
                    self.state = ReadState::AssignEntry { count, k: k + 1 };

                    return self.upload(ctx, sub, SM_BASE_ADDRESS + u16::from(self.sm), k + 1);
                }

                // All assignment entries collected; read each PDO's mapping
                let queue: Vec<usize> = (self.pdos.len() - usize::from(count)..self.pdos.len())
                    .collect();

                self.start_mapping(ctx, sub, queue, 0)
            }

            ReadState::MapCount { queue, at } => {
                let count = data.first().copied().unwrap_or(0);

                if count == 0 {
                    return self.start_mapping(ctx, sub, queue, at + 1);
                }

                let index = self.pdos[queue[at]].index;

                self.state = ReadState::MapEntry {
                    queue,
                    at,
                    count,
                    k: 1,
                };

                self.upload(ctx, sub, index, 1)
            }

            ReadState::MapEntry {
                queue,
                at,
                count,
                k,
            } => {
                let raw = data
                    .get(0..4)
                    .map(|raw| u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
                    .unwrap_or(0);

                self.pdos[queue[at]].entries.push(PdoEntry::from_mapping(raw));

                if k < count {
                    let index = self.pdos[queue[at]].index;

                    self.state = ReadState::MapEntry {
                        queue,
                        at,
                        count,
                        k: k + 1,
                    };

                    return self.upload(ctx, sub, index, k + 1);
                }

                self.start_mapping(ctx, sub, queue, at + 1)
            }
        }
    }
}

/// One SDO download in a PDO configuration plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PlanItem {
    pub index: u16,
    pub sub_index: u8,
    pub data: Vec<u8>,
}

impl PlanItem {
    fn u8(index: u16, sub_index: u8, value: u8) -> Self {
        Self {
            index,
            sub_index,
            data: alloc::vec![value],
        }
    }

    fn u16(index: u16, sub_index: u8, value: u16) -> Self {
        Self {
            index,
            sub_index,
            data: value.to_le_bytes().to_vec(),
        }
    }

    fn u32(index: u16, sub_index: u8, value: u32) -> Self {
        Self {
            index,
            sub_index,
            data: value.to_le_bytes().to_vec(),
        }
    }
}

/// Build the ordered SDO write sequence configuring the PDO assignment and mapping of every
/// sync manager the desired set touches.
///
/// Per SM: clear the assignment, then for each PDO clear its mapping, write its entries and
/// the entry count, then write the assignment entries and finally the assignment count.
pub(crate) fn write_plan(
    desired: &[Pdo],
    assign_writable: bool,
    mapping_writable: bool,
) -> Vec<PlanItem> {
    let mut plan = Vec::new();

    if !assign_writable {
        return plan;
    }

    let mut sms: Vec<u8> = desired.iter().filter_map(|pdo| pdo.sync_manager).collect();

    sms.sort_unstable();
    sms.dedup();

    for sm in sms {
        let assign = SM_BASE_ADDRESS + u16::from(sm);
        let pdos: Vec<&Pdo> = desired
            .iter()
            .filter(|pdo| pdo.sync_manager == Some(sm))
            .collect();

        plan.push(PlanItem::u8(assign, 0, 0));

        if mapping_writable {
            for pdo in &pdos {
                plan.push(PlanItem::u8(pdo.index, 0, 0));

                for (position, entry) in pdo.entries.iter().enumerate() {
                    plan.push(PlanItem::u32(
                        pdo.index,
                        position as u8 + 1,
                        entry.as_mapping(),
                    ));
                }

                plan.push(PlanItem::u8(pdo.index, 0, pdo.entries.len() as u8));
            }
        }

        for (position, pdo) in pdos.iter().enumerate() {
            plan.push(PlanItem::u16(assign, position as u8 + 1, pdo.index));
        }

        plan.push(PlanItem::u8(assign, 0, pdos.len() as u8));
    }

    plan
}

/// Executes a [`write_plan`] one download at a time.
#[derive(Debug)]
pub(crate) struct PdoWrite {
    owner: MailboxLockOwner,
    response_timeout: Duration,
    plan: Vec<PlanItem>,
    position: usize,
    download: CoeDownload,
}

impl PdoWrite {
    pub(crate) fn new(
        owner: MailboxLockOwner,
        plan: Vec<PlanItem>,
        response_timeout: Duration,
    ) -> Self {
        Self {
            owner,
            response_timeout,
            plan,
            position: 0,
            download: CoeDownload::new(owner, 0, 0, false, Vec::new(), response_timeout),
        }
    }

    fn start_item(&mut self, ctx: &Ctx, sub: &mut SubDevice) -> Step {
        let Some(item) = self.plan.get(self.position) else {
            return Step::Done(());
        };

        self.download = CoeDownload::new(
            self.owner,
            item.index,
            item.sub_index,
            false,
            item.data.clone(),
            self.response_timeout,
        );

        self.download.start(ctx, sub)
    }

    pub(crate) fn start(&mut self, ctx: &Ctx, sub: &mut SubDevice) -> Step {
        self.start_item(ctx, sub)
    }

    pub(crate) fn step(
        &mut self,
        ctx: &Ctx,
        sub: &mut SubDevice,
        reply: Option<&Datagram>,
    ) -> Step {
        match self.download.step(ctx, sub, reply) {
            Step::Done(()) => {
                self.position += 1;

                self.start_item(ctx, sub)
            }
            other => other,
        }
    }
}
