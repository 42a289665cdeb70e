//! The SubDevice configuration state machine: drives one device from its current AL state to
//! the requested state, writing every register and parameter the target state demands.
//!
//! Transitions that skip states still write all intermediate register sets. The application
//! may detach the configuration at any time; this machine checks the attachment generation at
//! every sequencing edge and restarts from the beginning when it changes.

use crate::command::Command;
use crate::datagram::{Datagram, DatagramState};
use crate::eeprom::types::CoeDetails;
use crate::error::Error;
use crate::fmmu::Fmmu;
use crate::fsm::coe::{CoeDownload, MailboxExchange};
use crate::fsm::pdo::{self, PdoWrite};
use crate::fsm::state_change::StateChange;
use crate::fsm::{Ctx, Step};
use crate::mailbox::MailboxType;
use crate::register::RegisterAddress;
use crate::soe::{self, SoeConfigItem};
use crate::subdevice::config::{DcConfig, FmmuMapping};
use crate::subdevice::{MailboxLockOwner, SubDevice};
use crate::subdevice_state::SubDeviceState;
use crate::sync_manager_channel::{Direction, SyncManagerChannel};
use crate::time::Instant;
use ethercrab_wire::EtherCrabWireWriteSized;

/// SII sync manager usage types.
const SM_USAGE_PROCESS_OUT: u8 = 0x03;
const SM_USAGE_PROCESS_IN: u8 = 0x04;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum State {
    ToInit,
    ClearFmmus,
    ClearSms,
    ClearDcSync,
    WriteMailboxSms,
    SiiToPdi,
    ToPreOp,
    SiiToEcat,
    SdoConfig,
    SoeConfigPreOp,
    PdoConfig,
    WatchdogDivider,
    WatchdogInterval,
    ProcessSm { sm: u8 },
    WriteFmmu { at: usize },
    DcCycleTimes,
    DcSyncDiffPoll,
    DcReadRefTime,
    DcStartTime,
    DcActivate,
    ToSafeOp,
    SoeConfigSafeOp,
    ToOp,
}

/// Configures one SubDevice towards `target`.
#[derive(Debug)]
pub(crate) struct SubDeviceConfigFsm {
    target: SubDeviceState,
    state: State,
    /// Config slot generation captured at (re)start.
    generation: u32,
    restarted: bool,

    change: Option<StateChange>,
    download: Option<CoeDownload>,
    soe: Option<MailboxExchange>,
    pdo_write: Option<PdoWrite>,

    sdo_pos: usize,
    soe_pos: usize,

    mailbox_sm_started: Instant,
    dc_poll_started: Instant,
}

impl SubDeviceConfigFsm {
    pub(crate) fn new(target: SubDeviceState) -> Self {
        Self {
            target,
            state: State::ToInit,
            generation: 0,
            restarted: false,
            change: None,
            download: None,
            soe: None,
            pdo_write: None,
            sdo_pos: 0,
            soe_pos: 0,
            mailbox_sm_started: Instant::ZERO,
            dc_poll_started: Instant::ZERO,
        }
    }

    /// Entry for parameter-only reconfiguration from SAFE-OP: skips all register writes and
    /// starts directly at the SAFE-OP SoE configuration, leaving PDO traffic undisturbed.
    pub(crate) fn quick_start(target: SubDeviceState) -> Self {
        Self {
            state: State::SoeConfigSafeOp,
            ..Self::new(target)
        }
    }

    pub(crate) fn start(&mut self, ctx: &mut Ctx, sub: &mut SubDevice) -> Step {
        self.generation = sub.config.generation();

        crate::fmt::debug!(
            "Configuring SubDevice {:#06x} for state {}",
            sub.configured_address,
            self.target
        );

        match self.state {
            State::SoeConfigSafeOp => self.enter_soe(ctx, sub, true),
            _ => self.enter_state_change(ctx, sub, SubDeviceState::Init, State::ToInit),
        }
    }

    /// Detect a config detach/attach and restart from the beginning once.
    ///
    /// Returns `true` if the machine restarted and the caller must return the given step.
    fn config_edge(&mut self, ctx: &mut Ctx, sub: &mut SubDevice) -> Option<Step> {
        if sub.config.generation() == self.generation {
            return None;
        }

        if self.restarted {
            // A second detach while already restarting; give up
            return Some(Step::Failed(Error::Cancelled));
        }

        crate::fmt::warn!(
            "SubDevice {:#06x} configuration changed, restarting",
            sub.configured_address
        );

        self.restarted = true;
        self.sdo_pos = 0;
        self.soe_pos = 0;
        self.change = None;
        self.download = None;
        self.soe = None;
        self.pdo_write = None;
        self.state = State::ToInit;

        Some(self.start(ctx, sub))
    }

    fn enter_state_change(
        &mut self,
        ctx: &mut Ctx,
        sub: &mut SubDevice,
        target: SubDeviceState,
        state: State,
    ) -> Step {
        let mut change = StateChange::new(target);

        let step = change.start(ctx, sub);

        self.change = Some(change);
        self.state = state;

        step
    }

    fn fpwr(
        sub: &SubDevice,
        register: u16,
        payload: &[u8],
        name: &'static str,
        tolerated: bool,
    ) -> Step {
        match Datagram::write(
            Command::fpwr(sub.configured_address, register),
            payload,
            name,
        ) {
            Ok(datagram) => Step::Send(if tolerated {
                datagram.ignore_wkc()
            } else {
                datagram
            }),
            Err(e) => Step::Failed(e),
        }
    }

    /// The effective target for the first mailbox-capable hop: BOOT stays BOOT, everything
    /// else goes through PRE-OP.
    fn preop_target(&self) -> SubDeviceState {
        if self.target == SubDeviceState::Bootstrap {
            SubDeviceState::Bootstrap
        } else {
            SubDeviceState::PreOp
        }
    }

    /// `true` once everything at or beyond PRE-OP is out of scope for the requested target.
    fn stops_at_init(&self) -> bool {
        self.target.rank() <= SubDeviceState::Init.rank()
    }

    pub(crate) fn step(
        &mut self,
        ctx: &mut Ctx,
        sub: &mut SubDevice,
        reply: Option<&Datagram>,
    ) -> Step {
        match self.state {
            State::ToInit | State::ToPreOp | State::ToSafeOp | State::ToOp => {
                self.step_state_change(ctx, sub, reply)
            }
            State::SdoConfig => self.step_sdo(ctx, sub, reply),
            State::SoeConfigPreOp => self.step_soe(ctx, sub, reply, false),
            State::SoeConfigSafeOp => self.step_soe(ctx, sub, reply, true),
            State::PdoConfig => self.step_pdo(ctx, sub, reply),
            _ => self.step_register(ctx, sub, reply),
        }
    }

    fn step_state_change(
        &mut self,
        ctx: &mut Ctx,
        sub: &mut SubDevice,
        reply: Option<&Datagram>,
    ) -> Step {
        let change = self.change.as_mut().expect("state change missing");

        match change.step(ctx, sub, reply) {
            Step::Done(()) => {
                self.change = None;

                if let Some(step) = self.config_edge(ctx, sub) {
                    return step;
                }

                match self.state {
                    State::ToInit => {
                        // Clear all FMMUs in one write
                        self.state = State::ClearFmmus;

                        let len = usize::from(sub.base.usable_fmmus()) * 16;

                        Self::fpwr(
                            sub,
                            RegisterAddress::fmmu(0),
                            &alloc::vec![0u8; len.max(16)],
                            "clear FMMUs",
                            false,
                        )
                    }
                    State::ToPreOp => {
                        self.state = State::SiiToEcat;

                        Self::fpwr(
                            sub,
                            RegisterAddress::SiiConfig.into(),
                            &[0x00, 0x00],
                            "SII to EtherCAT",
                            true,
                        )
                    }
                    State::ToSafeOp => self.enter_soe(ctx, sub, true),
                    State::ToOp => {
                        crate::fmt::info!(
                            "SubDevice {:#06x} configured to {}",
                            sub.configured_address,
                            self.target
                        );

                        Step::Done(())
                    }
                    _ => unreachable!(),
                }
            }
            other => other,
        }
    }

    fn step_register(
        &mut self,
        ctx: &mut Ctx,
        sub: &mut SubDevice,
        reply: Option<&Datagram>,
    ) -> Step {
        let Some(reply) = reply else {
            return Step::Wait;
        };

        if reply.state() == DatagramState::TimedOut {
            return Step::Failed(Error::Timeout);
        }

        match self.state {
            State::ClearFmmus => {
                if let Err(e) = reply.check() {
                    return Step::Failed(e);
                }

                self.state = State::ClearSms;

                let len = usize::from(sub.base.usable_sync_managers()) * 8;

                Self::fpwr(
                    sub,
                    RegisterAddress::sync_manager(0),
                    &alloc::vec![0u8; len.max(8)],
                    "clear SMs",
                    false,
                )
            }

            State::ClearSms => {
                if let Err(e) = reply.check() {
                    return Step::Failed(e);
                }

                self.state = State::ClearDcSync;

                // Errors on simple devices without DC are tolerated
                Self::fpwr(
                    sub,
                    RegisterAddress::DcSyncAssignActivate.into(),
                    &[0x00, 0x00],
                    "clear DC sync",
                    true,
                )
            }

            State::ClearDcSync => {
                if !sub.mailbox.default.has_mailbox() {
                    if self.stops_at_init() {
                        return Step::Done(());
                    }

                    // Nothing mailbox-shaped to configure; go straight for the state ladder
                    return self
                        .enter_state_change(ctx, sub, self.preop_target(), State::ToPreOp);
                }

                self.state = State::WriteMailboxSms;
                self.mailbox_sm_started = ctx.now;

                self.write_mailbox_sms(sub)
            }

            State::WriteMailboxSms => {
                if reply.working_counter() == 0 {
                    // Tolerated for up to a second while the device finishes booting
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

                let bootstrap = self.target == SubDeviceState::Bootstrap;

                sub.mailbox.config = sub.mailbox.default.config(bootstrap);

                if self.stops_at_init() {
                    return Step::Done(());
                }

                self.state = State::SiiToPdi;

                // Hand the EEPROM to the PDI over the PRE-OP hop; tolerated, some devices
                // never accept it
                Self::fpwr(
                    sub,
                    RegisterAddress::SiiConfig.into(),
                    &[0x01, 0x00],
                    "SII to PDI",
                    true,
                )
            }

            State::SiiToPdi => {
                self.enter_state_change(ctx, sub, self.preop_target(), State::ToPreOp)
            }

            State::SiiToEcat => {
                if let Some(step) = self.config_edge(ctx, sub) {
                    return step;
                }

                if self.target == SubDeviceState::Bootstrap
                    || self.target.rank() <= SubDeviceState::PreOp.rank()
                {
                    // BOOT and PRE-OP targets are complete at this point
                    return Step::Done(());
                }

                self.enter_sdo(ctx, sub)
            }

            State::WatchdogDivider => {
                self.state = State::WatchdogInterval;

                let interval = sub
                    .config
                    .get(self.generation)
                    .and_then(|config| config.watchdog_intervals);

                match interval {
                    Some(interval) => Self::fpwr(
                        sub,
                        RegisterAddress::SyncManagerWatchdog.into(),
                        &interval.to_le_bytes(),
                        "watchdog interval",
                        true,
                    ),
                    None => self.enter_process_sms(ctx, sub),
                }
            }

            State::WatchdogInterval => self.enter_process_sms(ctx, sub),

            State::ProcessSm { sm } => {
                if let Err(e) = reply.check() {
                    return Step::Failed(e);
                }

                self.next_process_sm(ctx, sub, sm + 1)
            }

            State::WriteFmmu { at } => {
                if let Err(e) = reply.check() {
                    return Step::Failed(e);
                }

                self.next_fmmu(ctx, sub, at + 1)
            }

            State::DcCycleTimes => {
                if let Err(e) = reply.check() {
                    return Step::Failed(e);
                }

                self.state = State::DcSyncDiffPoll;
                self.dc_poll_started = ctx.now;

                self.read_sync_diff(sub)
            }

            State::DcSyncDiffPoll => {
                let diff = match reply.check() {
                    Ok(data) if data.len() >= 4 => {
                        signed_magnitude(u32::from_le_bytes([
                            data[0], data[1], data[2], data[3],
                        ]))
                    }
                    Ok(_) => 0,
                    Err(e) => return Step::Failed(e),
                };

                if diff.unsigned_abs() <= u64::from(ctx.config.dc_sync_difference_ns) {
                    self.state = State::DcReadRefTime;

                    return match Datagram::read(
                        Command::fprd(
                            sub.configured_address,
                            RegisterAddress::DcSystemTime.into(),
                        ),
                        8,
                        "DC reference time",
                    ) {
                        Ok(datagram) => Step::Send(datagram),
                        Err(e) => Step::Failed(e),
                    };
                }

                if ctx.now.duration_since(self.dc_poll_started) >= ctx.timeouts.dc_sync {
                    // Proceed regardless; cyclic drift compensation narrows it further
                    crate::fmt::warn!(
                        "SubDevice {:#06x} system time difference still {} ns",
                        sub.configured_address,
                        diff
                    );

                    self.state = State::DcReadRefTime;

                    return match Datagram::read(
                        Command::fprd(
                            sub.configured_address,
                            RegisterAddress::DcSystemTime.into(),
                        ),
                        8,
                        "DC reference time",
                    ) {
                        Ok(datagram) => Step::Send(datagram),
                        Err(e) => Step::Failed(e),
                    };
                }

                self.read_sync_diff(sub)
            }

            State::DcReadRefTime => {
                let ref_time = match reply.check() {
                    Ok(data) if data.len() >= 8 => u64::from_le_bytes([
                        data[0], data[1], data[2], data[3], data[4], data[5], data[6], data[7],
                    ]),
                    Ok(_) => 0,
                    Err(e) => return Step::Failed(e),
                };

                let Some(dc) = self.dc_config(sub) else {
                    return Step::Failed(Error::Cancelled);
                };

                let start = sync_start_time(
                    ctx.now.as_nanos(),
                    ctx.config.dc_start_delay.as_nanos() as u64,
                    ref_time,
                    &dc,
                );

                self.state = State::DcStartTime;

                Self::fpwr(
                    sub,
                    RegisterAddress::DcSyncStartTime.into(),
                    &start.to_le_bytes(),
                    "DC start time",
                    false,
                )
            }

            State::DcStartTime => {
                if let Err(e) = reply.check() {
                    return Step::Failed(e);
                }

                let Some(dc) = self.dc_config(sub) else {
                    return Step::Failed(Error::Cancelled);
                };

                self.state = State::DcActivate;

                Self::fpwr(
                    sub,
                    RegisterAddress::DcSyncAssignActivate.into(),
                    &dc.assign_activate.to_le_bytes(),
                    "DC activate",
                    false,
                )
            }

            State::DcActivate => {
                if let Err(e) = reply.check() {
                    return Step::Failed(e);
                }

                self.enter_state_change(ctx, sub, SubDeviceState::SafeOp, State::ToSafeOp)
            }

            other => unreachable!("register step in state {:?}", other),
        }
    }

    fn write_mailbox_sms(&mut self, sub: &SubDevice) -> Step {
        let bootstrap = self.target == SubDeviceState::Bootstrap;
        let config = sub.mailbox.default.config(bootstrap);

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

    // --- PRE-OP parameterisation ---

    fn enter_sdo(&mut self, ctx: &mut Ctx, sub: &mut SubDevice) -> Step {
        self.state = State::SdoConfig;
        self.sdo_pos = 0;

        self.next_sdo(ctx, sub)
    }

    fn next_sdo(&mut self, ctx: &mut Ctx, sub: &mut SubDevice) -> Step {
        if let Some(step) = self.config_edge(ctx, sub) {
            return step;
        }

        let item = sub
            .config
            .get(self.generation)
            .and_then(|config| config.sdo_configs.get(self.sdo_pos))
            .cloned();

        let Some(item) = item else {
            return self.enter_soe(ctx, sub, false);
        };

        self.sdo_pos += 1;

        let mut download = CoeDownload::new(
            MailboxLockOwner::Lifecycle,
            item.index,
            item.sub_index,
            item.complete_access,
            item.data,
            ctx.timeouts.mailbox_response,
        );

        let step = download.start(ctx, sub);

        self.download = Some(download);

        step
    }

    fn step_sdo(&mut self, ctx: &mut Ctx, sub: &mut SubDevice, reply: Option<&Datagram>) -> Step {
        let download = self.download.as_mut().expect("download missing");

        match download.step(ctx, sub, reply) {
            Step::Done(()) => {
                self.download = None;

                self.next_sdo(ctx, sub)
            }
            other => other,
        }
    }

    fn enter_soe(&mut self, ctx: &mut Ctx, sub: &mut SubDevice, safe_op: bool) -> Step {
        self.state = if safe_op {
            State::SoeConfigSafeOp
        } else {
            State::SoeConfigPreOp
        };
        self.soe_pos = 0;

        self.next_soe(ctx, sub, safe_op)
    }

    fn soe_item(&self, sub: &SubDevice, safe_op: bool) -> Option<SoeConfigItem> {
        sub.config.get(self.generation).and_then(|config| {
            let list = if safe_op {
                &config.soe_configs_safe_op
            } else {
                &config.soe_configs_pre_op
            };

            list.get(self.soe_pos).cloned()
        })
    }

    fn next_soe(&mut self, ctx: &mut Ctx, sub: &mut SubDevice, safe_op: bool) -> Step {
        if let Some(step) = self.config_edge(ctx, sub) {
            return step;
        }

        let Some(item) = self.soe_item(sub, safe_op) else {
            self.soe = None;

            return if safe_op {
                // After the SAFE-OP parameter list the only thing left is OP itself
                if self.target.rank() >= SubDeviceState::Op.rank() {
                    self.enter_state_change(ctx, sub, SubDeviceState::Op, State::ToOp)
                } else {
                    Step::Done(())
                }
            } else {
                self.enter_pdo(ctx, sub)
            };
        };

        if !sub.supports_soe() {
            crate::fmt::warn!(
                "SubDevice {:#06x} has SoE configuration but does not advertise SoE",
                sub.configured_address
            );

            self.soe = None;

            return if safe_op {
                if self.target.rank() >= SubDeviceState::Op.rank() {
                    self.enter_state_change(ctx, sub, SubDeviceState::Op, State::ToOp)
                } else {
                    Step::Done(())
                }
            } else {
                self.enter_pdo(ctx, sub)
            };
        }

        self.soe_pos += 1;

        let mut exchange = MailboxExchange::new(
            MailboxLockOwner::Lifecycle,
            MailboxType::Soe,
            ctx.timeouts.mailbox_response,
        );

        let step = exchange.start(ctx, sub, soe::write_request(&item)).map(|_| ());

        self.soe = Some(exchange);

        step
    }

    fn step_soe(
        &mut self,
        ctx: &mut Ctx,
        sub: &mut SubDevice,
        reply: Option<&Datagram>,
        safe_op: bool,
    ) -> Step {
        let exchange = self.soe.as_mut().expect("SoE exchange missing");

        match exchange.step(ctx, sub, reply) {
            Step::Done(payload) => {
                if let Err(e) = soe::parse_write_response(&payload) {
                    return Step::Failed(e);
                }

                self.next_soe(ctx, sub, safe_op)
            }
            other => other.map(|_| ()),
        }
    }

    fn enter_pdo(&mut self, ctx: &mut Ctx, sub: &mut SubDevice) -> Step {
        if let Some(step) = self.config_edge(ctx, sub) {
            return step;
        }

        let desired = sub
            .config
            .get(self.generation)
            .map(|config| config.pdos.clone())
            .unwrap_or_default();

        if desired.is_empty() || !sub.supports_coe() {
            return self.enter_watchdog(ctx, sub);
        }

        let details = sub
            .sii_image
            .as_ref()
            .and_then(|image| image.general.as_ref())
            .map(|general| general.coe_details)
            .unwrap_or(CoeDetails::empty());

        let assign_writable = details.contains(CoeDetails::ENABLE_PDO_ASSIGN);
        let mapping_writable = details.contains(CoeDetails::ENABLE_PDO_CONFIGURATION);

        let plan = pdo::write_plan(&desired, assign_writable, mapping_writable);

        if plan.is_empty() {
            if desired != sub.pdos {
                // The device's mapping is fixed; accept what it has
                crate::fmt::warn!(
                    "SubDevice {:#06x} does not allow PDO (re)configuration, keeping its \
                     fixed mapping",
                    sub.configured_address
                );
            }

            return self.enter_watchdog(ctx, sub);
        }

        let mut pdo_write = PdoWrite::new(
            MailboxLockOwner::Lifecycle,
            plan,
            ctx.timeouts.mailbox_response,
        );

        let step = pdo_write.start(ctx, sub);

        self.pdo_write = Some(pdo_write);
        self.state = State::PdoConfig;

        step
    }

    fn step_pdo(&mut self, ctx: &mut Ctx, sub: &mut SubDevice, reply: Option<&Datagram>) -> Step {
        let pdo_write = self.pdo_write.as_mut().expect("pdo write missing");

        match pdo_write.step(ctx, sub, reply) {
            Step::Done(()) => {
                self.pdo_write = None;

                // The written assignment is now the effective one
                if let Some(config) = sub.config.get(self.generation) {
                    sub.pdos = config.pdos.clone();
                }

                self.enter_watchdog(ctx, sub)
            }
            other => other,
        }
    }

    // --- Registers for SAFE-OP ---

    fn enter_watchdog(&mut self, ctx: &mut Ctx, sub: &mut SubDevice) -> Step {
        if let Some(step) = self.config_edge(ctx, sub) {
            return step;
        }

        let divider = sub
            .config
            .get(self.generation)
            .and_then(|config| config.watchdog_divider);

        self.state = State::WatchdogDivider;

        match divider {
            Some(divider) => Self::fpwr(
                sub,
                RegisterAddress::WatchdogDivider.into(),
                &divider.to_le_bytes(),
                "watchdog divider",
                true,
            ),
            None => {
                // Jump over both watchdog writes
                self.state = State::WatchdogInterval;

                let interval = sub
                    .config
                    .get(self.generation)
                    .and_then(|config| config.watchdog_intervals);

                match interval {
                    Some(interval) => Self::fpwr(
                        sub,
                        RegisterAddress::SyncManagerWatchdog.into(),
                        &interval.to_le_bytes(),
                        "watchdog interval",
                        true,
                    ),
                    None => self.enter_process_sms(ctx, sub),
                }
            }
        }
    }

    fn enter_process_sms(&mut self, ctx: &mut Ctx, sub: &mut SubDevice) -> Step {
        self.next_process_sm(ctx, sub, 2)
    }

    /// Configure the process data SM at index `sm`, or move on to the FMMUs.
    fn next_process_sm(&mut self, ctx: &mut Ctx, sub: &mut SubDevice, sm: u8) -> Step {
        let sm_count = sub.base.usable_sync_managers();

        let mut sm = sm;

        while sm < sm_count {
            if let Some(channel) = self.process_sm_channel(sub, sm) {
                self.state = State::ProcessSm { sm };

                return Self::fpwr(
                    sub,
                    RegisterAddress::sync_manager(sm),
                    &channel.pack(),
                    "process data SM",
                    false,
                );
            }

            sm += 1;
        }

        self.next_fmmu(ctx, sub, 0)
    }

    /// The register image for process data SM `sm`: sized from the assigned PDOs of the
    /// desired configuration, falling back to the device's SII defaults.
    fn process_sm_channel(&self, sub: &SubDevice, sm: u8) -> Option<SyncManagerChannel> {
        let descriptor = sub
            .sii_image
            .as_ref()
            .and_then(|image| image.sync_managers.get(usize::from(sm)))?;

        let direction = match descriptor.usage_type {
            SM_USAGE_PROCESS_OUT => Direction::MainDeviceWrite,
            SM_USAGE_PROCESS_IN => Direction::MainDeviceRead,
            // Mailbox or unused SMs are not touched here
            _ => return None,
        };

        let configured = sub
            .config
            .get(self.generation)
            .map(|config| crate::pdo::sync_manager_size(&config.pdos, sm));

        let length = match configured {
            Some(length) if length > 0 => length,
            // No config for this SM: keep the device default
            _ => crate::pdo::sync_manager_size(&sub.pdos, sm).max(descriptor.length),
        };

        Some(SyncManagerChannel::process_data(
            descriptor.start_address,
            length,
            direction,
        ))
    }

    /// Write the FMMU at plan position `at`, or move on to DC/state ladder.
    fn next_fmmu(&mut self, ctx: &mut Ctx, sub: &mut SubDevice, at: usize) -> Step {
        if let Some(step) = self.config_edge(ctx, sub) {
            return step;
        }

        let mapping = sub
            .config
            .get(self.generation)
            .and_then(|config| config.fmmus.get(at))
            .copied();

        let Some(mapping) = mapping else {
            return self.enter_dc(ctx, sub);
        };

        let Some(fmmu) = self.resolve_fmmu(sub, mapping) else {
            crate::fmt::warn!(
                "SubDevice {:#06x}: FMMU {} refers to unknown SM {}",
                sub.configured_address,
                at,
                mapping.sync_manager
            );

            return self.next_fmmu(ctx, sub, at + 1);
        };

        self.state = State::WriteFmmu { at };

        Self::fpwr(
            sub,
            RegisterAddress::fmmu(at as u8),
            &fmmu.pack(),
            "FMMU",
            false,
        )
    }

    fn resolve_fmmu(&self, sub: &SubDevice, mapping: FmmuMapping) -> Option<Fmmu> {
        let descriptor = sub
            .sii_image
            .as_ref()
            .and_then(|image| image.sync_managers.get(usize::from(mapping.sync_manager)))?;

        Some(Fmmu::byte_aligned(
            mapping.logical_start_address,
            descriptor.start_address,
            mapping.length_bytes,
            mapping.read,
            mapping.write,
        ))
    }

    // --- Distributed clocks ---

    fn dc_config(&self, sub: &SubDevice) -> Option<DcConfig> {
        sub.config
            .get(self.generation)
            .and_then(|config| config.dc)
            .filter(|dc| dc.assign_activate != 0)
    }

    fn enter_dc(&mut self, ctx: &mut Ctx, sub: &mut SubDevice) -> Step {
        let Some(dc) = self.dc_config(sub) else {
            return self.enter_state_change(ctx, sub, SubDeviceState::SafeOp, State::ToSafeOp);
        };

        if !sub.base.support_flags.dc_supported {
            crate::fmt::warn!(
                "SubDevice {:#06x} has a DC configuration but no DC support",
                sub.configured_address
            );

            return self.enter_state_change(ctx, sub, SubDeviceState::SafeOp, State::ToSafeOp);
        }

        self.state = State::DcCycleTimes;

        let mut buf = [0u8; 8];

        buf[0..4].copy_from_slice(&dc.sync0_cycle_ns.to_le_bytes());
        buf[4..8].copy_from_slice(&dc.sync1_cycle_ns.to_le_bytes());

        Self::fpwr(
            sub,
            RegisterAddress::DcSync0CycleTime.into(),
            &buf,
            "DC cycle times",
            false,
        )
    }

    fn read_sync_diff(&mut self, sub: &SubDevice) -> Step {
        match Datagram::read(
            Command::fprd(
                sub.configured_address,
                RegisterAddress::DcSystemTimeDifference.into(),
            ),
            4,
            "DC sync difference",
        ) {
            Ok(datagram) => Step::Send(datagram),
            Err(e) => Step::Failed(e),
        }
    }
}

/// Decode the `0x092C` system time difference register: bit 31 is the sign, the rest the
/// magnitude in ns.
fn signed_magnitude(raw: u32) -> i64 {
    let magnitude = i64::from(raw & 0x7fff_ffff);

    if raw & 0x8000_0000 != 0 {
        -magnitude
    } else {
        magnitude
    }
}

/// The cycle-aligned SYNC0 start time: the application time pushed into the future by the
/// start delay, phase aligned to the combined SYNC0/SYNC1 cycle relative to the reference
/// time, plus the configured shift.
fn sync_start_time(app_time: u64, start_delay: u64, ref_time: u64, dc: &DcConfig) -> u64 {
    let cycle = u64::from(dc.sync0_cycle_ns) + u64::from(dc.sync1_cycle_ns);

    let horizon = app_time.wrapping_add(start_delay).wrapping_sub(ref_time);

    if cycle == 0 {
        return horizon.wrapping_add(u64::from(dc.sync0_shift_ns));
    }

    (horizon % cycle).wrapping_add(u64::from(dc.sync0_shift_ns))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signed_magnitude_decoding() {
        assert_eq!(signed_magnitude(0x0000_2710), 10_000);
        assert_eq!(signed_magnitude(0x8000_2710), -10_000);
        assert_eq!(signed_magnitude(0), 0);
    }

    #[test]
    fn start_time_is_cycle_aligned() {
        let dc = DcConfig {
            assign_activate: 0x0300,
            sync0_cycle_ns: 1_000_000,
            sync0_shift_ns: 100,
            sync1_cycle_ns: 0,
        };

        let start = sync_start_time(10_000_000, 1_000_000, 2_500_000, &dc);

        // (10ms + 1ms - 2.5ms) mod 1ms + 100
        assert_eq!(start, 500_100);
    }

    #[test]
    fn zero_cycle_skips_alignment() {
        let dc = DcConfig {
            assign_activate: 0x0300,
            sync0_cycle_ns: 0,
            sync0_shift_ns: 0,
            sync1_cycle_ns: 0,
        };

        assert_eq!(sync_start_time(5_000, 1_000, 2_000, &dc), 4_000);
    }
}
