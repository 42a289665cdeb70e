//! The SubDevice scan state machine: one-time identification and characterisation of a device
//! found on the ring.
//!
//! Runs once per SubDevice after the broadcast count, in ring order (a device's scan may not
//! begin before its predecessor holds a station address, because scanning starts with auto
//! increment addressing). Populates the SubDevice record: base info, ports, DC capability,
//! identity, the SII image (shared, loaded or read), the effective mailbox windows and the
//! PDO sets.

use crate::al_control::AlStatus;
use crate::command::Command;
use crate::datagram::{Datagram, DatagramState};
use crate::eeprom::image::SiiImage;
use crate::eeprom::{SII_FIRST_CATEGORY, SII_SIZE_CAP_WORDS, SII_WORD_PROBE_END};
use crate::error::{EepromError, Error};
use crate::fsm::pdo::PdoRead;
use crate::fsm::sii::{SiiAddressing, SiiRead};
use crate::fsm::state_change::StateChange;
use crate::fsm::{Ctx, Step};
use crate::register::{BaseInfo, RegisterAddress};
use crate::subdevice::{MailboxLockOwner, SubDevice, SubDeviceIdentity};
use crate::subdevice_state::SubDeviceState;
use crate::sync_manager_channel::SyncManagerChannel;
use crate::time::Instant;
use alloc::sync::Arc;
use alloc::vec::Vec;
use ethercrab_wire::{EtherCrabWireRead, EtherCrabWireWriteSized};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum State {
    AssignAddress,
    ReadAlStatus,
    AckError,
    ReadBaseInfo,
    DcProbe,
    DcTimesFirst,
    DcLatch,
    DcTimesSecond,
    ReadDlStatus,
    SiiToEcat,
    Probe,
    SizeWalk,
    FullRead,
    ConfigureMailboxSms,
    MoveToPreOp,
    ReadMailboxSms,
    DrainMailbox,
    ReadPdos,
}

/// Scans one SubDevice.
#[derive(Debug)]
pub(crate) struct SubDeviceScan {
    state: State,
    sii: Option<SiiRead>,
    change: Option<StateChange>,
    pdo_read: Option<PdoRead>,
    /// Raw bytes of SII words `0x0000..0x0010`.
    probe: Vec<u8>,
    /// Cursor of the category size walk, in words.
    category_cursor: u16,
    /// DC port receive times before the broadcast latch.
    dc_times_before: [u32; 4],
    /// Start of the mailbox SM write retry window.
    mailbox_sm_started: Instant,
}

impl SubDeviceScan {
    pub(crate) fn new() -> Self {
        Self {
            state: State::AssignAddress,
            sii: None,
            change: None,
            pdo_read: None,
            probe: Vec::new(),
            category_cursor: SII_FIRST_CATEGORY,
            dc_times_before: [0; 4],
            mailbox_sm_started: Instant::ZERO,
        }
    }

    pub(crate) fn start(&mut self, _ctx: &Ctx, sub: &mut SubDevice) -> Step {
        crate::fmt::debug!(
            "Scanning ring position {}, assigning station address {:#06x}",
            sub.ring_position,
            sub.configured_address
        );

        self.state = State::AssignAddress;

        match Datagram::write(
            Command::apwr(
                sub.ring_position,
                RegisterAddress::ConfiguredStationAddress.into(),
            ),
            &sub.configured_address.to_le_bytes(),
            "station address",
        ) {
            Ok(datagram) => Step::Send(datagram),
            Err(e) => Step::Failed(e),
        }
    }

    fn fprd(sub: &SubDevice, register: u16, len: u16, name: &'static str) -> Step {
        match Datagram::read(Command::fprd(sub.configured_address, register), len, name) {
            Ok(datagram) => Step::Send(datagram),
            Err(e) => Step::Failed(e),
        }
    }

    /// Kick off an SII read over configured addressing.
    fn sii_read(&mut self, ctx: &Ctx, sub: &SubDevice, start_word: u16, len_words: u16) -> Step {
        let mut read = SiiRead::new(
            SiiAddressing::Configured(sub.configured_address),
            start_word,
            len_words,
        );

        let step = read.start(ctx).map(|_| ());

        self.sii = Some(read);

        step
    }

    /// Install a parsed image on the SubDevice and derive record fields from it.
    fn adopt_image(&mut self, sub: &mut SubDevice, image: Arc<SiiImage>) {
        sub.alias_address = image.alias;
        sub.mailbox.default = image.default_mailbox;

        sub.name.clear();

        if let Some(name) = image.name() {
            crate::fsm::push_truncated(&mut sub.name, name.as_bytes());
        }

        // Default PDO sets; replaced by a CoE read where the device supports one
        sub.pdos = image
            .tx_pdos
            .iter()
            .chain(image.rx_pdos.iter())
            .cloned()
            .collect();

        sub.sii_image = Some(image);
    }

    /// Enter mailbox bringup, or finish for devices without a mailbox.
    fn enter_mailbox_bringup(&mut self, ctx: &Ctx, sub: &mut SubDevice) -> Step {
        if !sub.mailbox.default.has_mailbox() {
            crate::fmt::debug!(
                "SubDevice {:#06x} has no mailbox, scan complete",
                sub.configured_address
            );

            return Step::Done(());
        }

        self.state = State::ConfigureMailboxSms;
        self.mailbox_sm_started = ctx.now;

        self.write_mailbox_sms(sub)
    }

    fn write_mailbox_sms(&mut self, sub: &SubDevice) -> Step {
        let config = sub.mailbox.default.config(false);

        let mut buf = [0u8; 16];

        buf[0..8].copy_from_slice(
            &SyncManagerChannel::mailbox_write(config.write.offset, config.write.len).pack(),
        );
        buf[8..16].copy_from_slice(
            &SyncManagerChannel::mailbox_read(config.read.offset, config.read.len).pack(),
        );

        match Datagram::write(
            Command::fpwr(sub.configured_address, RegisterAddress::sync_manager(0)),
            &buf,
            "mailbox SMs",
        ) {
            Ok(datagram) => Step::Send(datagram.ignore_wkc()),
            Err(e) => Step::Failed(e),
        }
    }

    pub(crate) fn step(
        &mut self,
        ctx: &mut Ctx,
        sub: &mut SubDevice,
        reply: Option<&Datagram>,
    ) -> Step {
        match self.state {
            State::Probe | State::SizeWalk | State::FullRead => {
                return self.step_sii(ctx, sub, reply);
            }
            State::AckError => {
                let change = self.change.as_mut().expect("state change missing");

                return match change.step(ctx, sub, reply) {
                    Step::Done(()) => {
                        self.change = None;
                        self.state = State::ReadBaseInfo;

                        Self::fprd(sub, RegisterAddress::Type.into(), 12, "base info")
                    }
                    other => other,
                };
            }
            State::MoveToPreOp => {
                let change = self.change.as_mut().expect("state change missing");

                return match change.step(ctx, sub, reply) {
                    Step::Done(()) => {
                        self.change = None;
                        self.state = State::ReadMailboxSms;

                        Self::fprd(sub, RegisterAddress::sync_manager(0), 16, "mailbox SM read")
                    }
                    other => other,
                };
            }
            State::ReadPdos => {
                let pdo_read = self.pdo_read.as_mut().expect("pdo read missing");

                return match pdo_read.step(ctx, sub, reply) {
                    Step::Done(pdos) => {
                        self.pdo_read = None;

                        if !pdos.is_empty() {
                            ctx.pdo_cache.push((sub.identity, pdos.clone()));

                            sub.pdos = pdos;
                        }

                        Step::Done(())
                    }
                    Step::Send(d) => Step::Send(d),
                    Step::Wait => Step::Wait,
                    Step::Failed(e) => Step::Failed(e),
                };
            }
            _ => {}
        }

        let Some(reply) = reply else {
            return Step::Wait;
        };

        if reply.state() == DatagramState::TimedOut {
            return Step::Failed(Error::Timeout);
        }

        match self.state {
            State::AssignAddress => {
                if let Err(e) = reply.check() {
                    return Step::Failed(e);
                }

                self.state = State::ReadAlStatus;

                Self::fprd(sub, RegisterAddress::AlStatus.into(), 2, "AL status")
            }

            State::ReadAlStatus => {
                let status = match reply
                    .check()
                    .and_then(|data| AlStatus::unpack_from_slice(data).map_err(Error::from))
                {
                    Ok(status) => status,
                    Err(e) => return Step::Failed(e),
                };

                sub.current_state = status.state;

                if status.error {
                    // Clear the stale error before anything else touches the device
                    crate::fmt::warn!(
                        "SubDevice {:#06x} has an unacknowledged AL error",
                        sub.configured_address
                    );

                    let mut change = StateChange::ack_only();

                    let step = change.start(ctx, sub);

                    self.change = Some(change);
                    self.state = State::AckError;

                    return step;
                }

                self.state = State::ReadBaseInfo;

                Self::fprd(sub, RegisterAddress::Type.into(), 12, "base info")
            }

            State::ReadBaseInfo => {
                let base = match reply
                    .check()
                    .and_then(|data| BaseInfo::unpack_from_slice(data).map_err(Error::from))
                {
                    Ok(base) => base,
                    Err(e) => return Step::Failed(e),
                };

                crate::fmt::debug!(
                    "SubDevice {:#06x}: {} FMMUs, {} SMs, {}",
                    sub.configured_address,
                    base.usable_fmmus(),
                    base.usable_sync_managers(),
                    base.support_flags
                );

                sub.base = base;

                if base.support_flags.dc_supported {
                    self.state = State::DcProbe;

                    match Datagram::read(
                        Command::fprd(
                            sub.configured_address,
                            RegisterAddress::DcSystemTime.into(),
                        ),
                        8,
                        "DC probe",
                    ) {
                        Ok(datagram) => Step::Send(datagram.ignore_wkc()),
                        Err(e) => Step::Failed(e),
                    }
                } else {
                    self.state = State::ReadDlStatus;

                    Self::fprd(sub, RegisterAddress::DlStatus.into(), 2, "DL status")
                }
            }

            State::DcProbe => {
                // Working counter 1 means the system time register exists
                sub.has_dc_system_time = reply.working_counter() == 1;

                self.state = State::DcTimesFirst;

                Self::fprd(sub, RegisterAddress::DcTimePort0.into(), 16, "DC port times")
            }

            State::DcTimesFirst => {
                let data = match reply.check() {
                    Ok(data) => data,
                    Err(e) => return Step::Failed(e),
                };

                self.dc_times_before = port_times(data);

                self.state = State::DcLatch;

                // A broadcast write to the port 0 receive time register latches the local
                // time at every port the frame passes
                match Datagram::write(
                    Command::bwr(RegisterAddress::DcTimePort0.into()),
                    &[0u8; 4],
                    "DC latch",
                ) {
                    Ok(datagram) => Step::Send(datagram.ignore_wkc()),
                    Err(e) => Step::Failed(e),
                }
            }

            State::DcLatch => {
                self.state = State::DcTimesSecond;

                Self::fprd(sub, RegisterAddress::DcTimePort0.into(), 16, "DC port times")
            }

            State::DcTimesSecond => {
                let data = match reply.check() {
                    Ok(data) => data,
                    Err(e) => return Step::Failed(e),
                };

                sub.ports.update_dc_times(self.dc_times_before, port_times(data));

                self.state = State::ReadDlStatus;

                Self::fprd(sub, RegisterAddress::DlStatus.into(), 2, "DL status")
            }

            State::ReadDlStatus => {
                let status = match reply.check().and_then(|data| {
                    crate::dl_status::DlStatus::unpack_from_slice(data).map_err(Error::from)
                }) {
                    Ok(status) => status,
                    Err(e) => return Step::Failed(e),
                };

                sub.ports.update_from_dl_status(status);

                // Daisy chain topology: port 0 faces the predecessor, the first open
                // downstream port the successor. The last device's downstream ports are
                // closed loops, leaving its successor unset.
                if sub.ring_position > 0 {
                    sub.ports.0[0].neighbour = Some(sub.ring_position - 1);
                }

                if let Some(port) = sub
                    .ports
                    .0
                    .iter_mut()
                    .skip(1)
                    .find(|port| port.link_up && !port.loop_closed)
                {
                    port.neighbour = Some(sub.ring_position + 1);
                }

                self.state = State::SiiToEcat;

                // Take the EEPROM back from the PDI so SII reads succeed; some devices
                // always fail this write, which is tolerated
                match Datagram::write(
                    Command::fpwr(sub.configured_address, RegisterAddress::SiiConfig.into()),
                    &[0x00, 0x00],
                    "SII to EtherCAT",
                ) {
                    Ok(datagram) => Step::Send(datagram.ignore_wkc()),
                    Err(e) => Step::Failed(e),
                }
            }

            State::SiiToEcat => {
                self.state = State::Probe;

                self.sii_read(ctx, sub, 0, SII_WORD_PROBE_END)
            }

            State::ConfigureMailboxSms => {
                if reply.working_counter() == 0 {
                    // Some devices need up to a second after power-on before accepting SM
                    // configuration
                    if ctx.now.duration_since(self.mailbox_sm_started)
                        >= ctx.timeouts.mailbox_first_write
                    {
                        return Step::Failed(Error::WorkingCounter {
                            expected: 1,
                            received: 0,
                        });
                    }

                    return self.write_mailbox_sms(sub);
                }

                let mut change = StateChange::new(SubDeviceState::PreOp);

                let step = change.start(ctx, sub);

                self.change = Some(change);
                self.state = State::MoveToPreOp;

                step
            }

            State::ReadMailboxSms => {
                let data = match reply.check() {
                    Ok(data) => data,
                    Err(e) => return Step::Failed(e),
                };

                // Read back what the device actually ended up with
                let sm0 = match SyncManagerChannel::unpack_from_slice(&data[0..8]) {
                    Ok(sm) => sm,
                    Err(e) => return Step::Failed(e.into()),
                };
                let sm1 = match SyncManagerChannel::unpack_from_slice(&data[8..16]) {
                    Ok(sm) => sm,
                    Err(e) => return Step::Failed(e.into()),
                };

                sub.mailbox.config.write.offset = sm0.physical_start_address;
                sub.mailbox.config.write.len = sm0.length_bytes;
                sub.mailbox.config.read.offset = sm1.physical_start_address;
                sub.mailbox.config.read.len = sm1.length_bytes;

                crate::fmt::debug!(
                    "SubDevice {:#06x} mailbox: write {}, read {}",
                    sub.configured_address,
                    sm0,
                    sm1
                );

                self.state = State::DrainMailbox;

                // One blind fetch discards any stale message left over from a previous run
                match Datagram::read(
                    Command::fprd(sub.configured_address, sub.mailbox.config.read.offset),
                    sub.mailbox.config.read.len,
                    "mailbox drain",
                ) {
                    Ok(datagram) => Step::Send(datagram.ignore_wkc()),
                    Err(e) => Step::Failed(e),
                }
            }

            State::DrainMailbox => {
                // Errors and empty replies are both fine here
                self.finish_after_drain(ctx, sub)
            }

            State::Probe
            | State::SizeWalk
            | State::FullRead
            | State::AckError
            | State::MoveToPreOp
            | State::ReadPdos => unreachable!("handled above"),
        }
    }

    fn finish_after_drain(&mut self, ctx: &mut Ctx, sub: &mut SubDevice) -> Step {
        if sub.supports_coe() {
            if let Some(pdos) = ctx.cached_pdos(sub.identity) {
                crate::fmt::debug!(
                    "SubDevice {:#06x}: using cached PDO set",
                    sub.configured_address
                );

                sub.pdos = pdos;

                return Step::Done(());
            }

            let mut pdo_read = PdoRead::new(
                MailboxLockOwner::Lifecycle,
                sub.base.usable_sync_managers(),
                ctx.timeouts.mailbox_response,
            );

            let step = pdo_read.start(ctx, sub).map(|_| ());

            self.pdo_read = Some(pdo_read);
            self.state = State::ReadPdos;

            return step;
        }

        Step::Done(())
    }

    /// The SII phases: identity probe, category size walk, full image read.
    fn step_sii(&mut self, ctx: &mut Ctx, sub: &mut SubDevice, reply: Option<&Datagram>) -> Step {
        let sii = self.sii.as_mut().expect("SII read missing");

        let data = match sii.step(ctx, reply) {
            Step::Done(data) => data,
            Step::Send(datagram) => return Step::Send(datagram),
            Step::Wait => return Step::Wait,
            Step::Failed(e) => return Step::Failed(e),
        };

        self.sii = None;

        match self.state {
            State::Probe => {
                self.probe = data;

                let identity = match SubDeviceIdentity::unpack_from_slice(&self.probe[0x10..0x20])
                {
                    Ok(identity) => identity,
                    Err(e) => return Step::Failed(e.into()),
                };

                sub.identity = identity;
                sub.alias_address =
                    u16::from_le_bytes([self.probe[0x08], self.probe[0x09]]);

                crate::fmt::info!(
                    "SubDevice {:#06x}: {}",
                    sub.configured_address,
                    identity
                );

                // Short-circuit 1: an already parsed image for an identical device
                if let Some(image) = ctx.cached_image(identity) {
                    crate::fmt::debug!(
                        "SubDevice {:#06x}: reusing shared SII image",
                        sub.configured_address
                    );

                    self.adopt_image(sub, image);

                    return self.enter_mailbox_bringup(ctx, sub);
                }

                // Short-circuit 2: an image override from the firmware source
                if let Some(raw) = ctx
                    .firmware
                    .and_then(|loader| loader.load(identity.vendor_id, identity.product_id))
                {
                    return match SiiImage::parse(raw) {
                        Ok(image) => {
                            let image = Arc::new(image);

                            ctx.sii_images.push(image.clone());
                            self.adopt_image(sub, image);

                            self.enter_mailbox_bringup(ctx, sub)
                        }
                        Err(e) => {
                            sub.error_flag = true;

                            Step::Failed(e)
                        }
                    };
                }

                // Fall through to the device read: walk the category chain to size the image
                self.state = State::SizeWalk;
                self.category_cursor = SII_FIRST_CATEGORY;

                self.sii_read(ctx, sub, self.category_cursor, 2)
            }

            State::SizeWalk => {
                let category = u16::from_le_bytes([data[0], data[1]]);
                let len_words = u16::from_le_bytes([data[2], data[3]]);

                if category == 0xffff {
                    // Include the sentinel header so parsing terminates on it
                    let end_words = self.category_cursor + 2;

                    self.state = State::FullRead;

                    return self.sii_read(
                        ctx,
                        sub,
                        SII_WORD_PROBE_END,
                        end_words - SII_WORD_PROBE_END,
                    );
                }

                self.category_cursor += 2 + len_words;

                if self.category_cursor >= SII_SIZE_CAP_WORDS {
                    crate::fmt::error!(
                        "SubDevice {:#06x}: SII category chain has no end marker",
                        sub.configured_address
                    );

                    sub.error_flag = true;

                    return Step::Failed(Error::Eeprom(EepromError::SectionOverrun));
                }

                self.sii_read(ctx, sub, self.category_cursor, 2)
            }

            State::FullRead => {
                let mut raw = core::mem::take(&mut self.probe);

                raw.extend_from_slice(&data);

                match SiiImage::parse(raw) {
                    Ok(image) => {
                        let image = Arc::new(image);

                        ctx.sii_images.push(image.clone());
                        self.adopt_image(sub, image);

                        self.enter_mailbox_bringup(ctx, sub)
                    }
                    Err(e) => {
                        sub.error_flag = true;

                        Step::Failed(e)
                    }
                }
            }

            _ => unreachable!(),
        }
    }
}

fn port_times(data: &[u8]) -> [u32; 4] {
    let mut times = [0u32; 4];

    for (index, chunk) in data.chunks_exact(4).take(4).enumerate() {
        times[index] = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }

    times
}
