//! A simulated SubDevice network used by the integration tests.
//!
//! Each simulated device models the register file, SII EEPROM, AL state machine, mailbox and
//! CoE/SoE servers of a real SubDevice closely enough to drive the whole engine through scan,
//! configuration and SDO traffic entirely in memory.

#![allow(dead_code)]

use carapace::{Instant, MainDevice};
use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::time::Duration;

// Command codes
const APRD: u8 = 0x01;
const APWR: u8 = 0x02;
const FPRD: u8 = 0x04;
const FPWR: u8 = 0x05;
const BRD: u8 = 0x07;
const BWR: u8 = 0x08;

const AL_ERROR_BIT: u8 = 0x10;

/// Builds the SII image bytes for a simulated device.
#[derive(Debug, Clone)]
pub struct SiiBuilder {
    pub vendor_id: u32,
    pub product_id: u32,
    pub revision: u32,
    pub serial: u32,
    pub alias: u16,
    pub mailbox_write_offset: u16,
    pub mailbox_read_offset: u16,
    pub mailbox_size: u16,
    /// SII word 0x001C protocol bitmap; 0x0004 is CoE.
    pub protocols: u16,
    /// `(coe_details, name)` for the general category.
    pub general: Option<(u8, &'static str)>,
    /// Raw 8 byte sync manager descriptors.
    pub sync_managers: Vec<[u8; 8]>,
    /// `(pdo index, sm, entries as (index, sub, bits))` for the TxPDO category.
    pub tx_pdos: Vec<(u16, u8, Vec<(u16, u8, u8)>)>,
}

impl Default for SiiBuilder {
    fn default() -> Self {
        Self {
            vendor_id: 0x0000_000b,
            product_id: 0x0000_1234,
            revision: 1,
            serial: 42,
            alias: 0,
            mailbox_write_offset: 0x1000,
            mailbox_read_offset: 0x1100,
            mailbox_size: 256,
            protocols: 0x0004,
            general: Some((0x0f, "sim device")),
            sync_managers: vec![
                // SM0: write mailbox
                [0x00, 0x10, 0x00, 0x01, 0x26, 0x00, 0x01, 0x01],
                // SM1: read mailbox
                [0x00, 0x11, 0x00, 0x01, 0x22, 0x00, 0x01, 0x02],
                // SM2: outputs (none)
                [0x00, 0x12, 0x00, 0x00, 0x24, 0x00, 0x01, 0x03],
                // SM3: inputs
                [0x00, 0x13, 0x04, 0x00, 0x20, 0x00, 0x01, 0x04],
            ],
            tx_pdos: vec![(0x1a00, 3, vec![(0x6000, 1, 16), (0x6000, 2, 16)])],
        }
    }
}

impl SiiBuilder {
    pub fn build(&self) -> Vec<u8> {
        let mut data = vec![0u8; 0x80];

        data[0x08..0x0a].copy_from_slice(&self.alias.to_le_bytes());
        data[0x10..0x14].copy_from_slice(&self.vendor_id.to_le_bytes());
        data[0x14..0x18].copy_from_slice(&self.product_id.to_le_bytes());
        data[0x18..0x1c].copy_from_slice(&self.revision.to_le_bytes());
        data[0x1c..0x20].copy_from_slice(&self.serial.to_le_bytes());

        // Bootstrap mailbox mirrors the standard one
        for base in [0x28usize, 0x30] {
            data[base..base + 2].copy_from_slice(&self.mailbox_write_offset.to_le_bytes());
            data[base + 2..base + 4].copy_from_slice(&self.mailbox_size.to_le_bytes());
            data[base + 4..base + 6].copy_from_slice(&self.mailbox_read_offset.to_le_bytes());
            data[base + 6..base + 8].copy_from_slice(&self.mailbox_size.to_le_bytes());
        }

        data[0x38..0x3a].copy_from_slice(&self.protocols.to_le_bytes());

        // Strings category with the device name
        let mut strings = Vec::new();

        if let Some((_, name)) = self.general {
            strings.push(0x01);
            strings.push(name.len() as u8);
            strings.extend_from_slice(name.as_bytes());

            if strings.len() % 2 != 0 {
                strings.push(0);
            }

            push_category(&mut data, 10, &strings);
        }

        // General category
        if let Some((coe_details, _)) = self.general {
            let mut general = vec![0u8; 32];

            general[3] = 1; // name string index
            general[5] = coe_details;

            push_category(&mut data, 30, &general);
        }

        // Sync managers
        if !self.sync_managers.is_empty() {
            let mut sms = Vec::new();

            for sm in &self.sync_managers {
                sms.extend_from_slice(sm);
            }

            push_category(&mut data, 41, &sms);
        }

        // TxPDOs
        if !self.tx_pdos.is_empty() {
            let mut pdos = Vec::new();

            for (index, sm, entries) in &self.tx_pdos {
                pdos.extend_from_slice(&index.to_le_bytes());
                pdos.push(entries.len() as u8);
                pdos.push(*sm);
                pdos.push(0); // dc sync
                pdos.push(0); // name index
                pdos.extend_from_slice(&[0, 0]); // flags

                for (entry_index, entry_sub, bits) in entries {
                    pdos.extend_from_slice(&entry_index.to_le_bytes());
                    pdos.push(*entry_sub);
                    pdos.push(0); // name index
                    pdos.push(0); // data type
                    pdos.push(*bits);
                    pdos.extend_from_slice(&[0, 0]); // flags
                }
            }

            push_category(&mut data, 50, &pdos);
        }

        data.extend_from_slice(&[0xff, 0xff, 0x00, 0x00]);

        data
    }
}

fn push_category(data: &mut Vec<u8>, kind: u16, body: &[u8]) {
    assert!(body.len() % 2 == 0, "category body must be word aligned");

    data.extend_from_slice(&kind.to_le_bytes());
    data.extend_from_slice(&((body.len() / 2) as u16).to_le_bytes());
    data.extend_from_slice(body);
}

/// Scripted AL state machine behaviour.
#[derive(Debug, Clone, Default)]
pub struct AlScript {
    /// Number of status reads that still report the old state after a transition request.
    pub delay_polls: u8,
    /// On the first request towards `target`, report an error with this status code once.
    /// After the error is acknowledged the device proceeds to the target.
    pub error_once: Option<(u8, u16)>,
}

/// Scripted CoE server behaviour.
#[derive(Debug, Clone, Default)]
pub struct CoeScript {
    /// Abort uploads of these objects with the given code.
    pub abort_upload: BTreeMap<(u16, u8), u32>,
    /// Abort downloads of these objects with the given code.
    pub abort_download: BTreeMap<(u16, u8), u32>,
    /// Emit one emergency message before the next SDO response.
    pub emergency_once: Option<(u16, u8)>,
    /// Object descriptions served by the SDO Information service:
    /// `(index, max subindex, object code, name)`.
    pub od: Vec<(u16, u8, u8, &'static str)>,
    /// Entry descriptions aborted with the given code.
    pub entry_aborts: BTreeMap<(u16, u8), u32>,
}

/// In-flight segmented download staging.
#[derive(Debug, Clone)]
struct DownloadStaging {
    index: u16,
    sub_index: u8,
    expected: usize,
    buf: Vec<u8>,
    toggle: bool,
}

/// In-flight segmented upload staging.
#[derive(Debug, Clone)]
struct UploadStaging {
    data: Vec<u8>,
    offset: usize,
    toggle: bool,
}

/// One simulated SubDevice.
pub struct SimSubDevice {
    /// Register space 0x0000..0x1000.
    regs: Vec<u8>,
    pub station_address: u16,

    sii: Vec<u8>,
    sii_address: u16,
    /// Status reads left during which the EEPROM reports "loading".
    pub sii_loading_reads: u32,

    al_state: u8,
    al_code: u16,
    al_pending: Option<(u8, u8)>,
    al_script: AlScript,
    al_error_used: bool,
    resume_after_ack: Option<u8>,

    dc_supported: bool,
    port_times: [u32; 4],
    /// Ports that never see the broadcast latch.
    pub bypassed_ports: Vec<u8>,
    /// Values served from the system time difference register, in order.
    pub sync_diffs: VecDeque<u32>,

    mailbox_write_offset: u16,
    mailbox_read_offset: u16,
    mailbox_size: u16,
    tx_queue: VecDeque<Vec<u8>>,

    pub dictionary: BTreeMap<(u16, u8), Vec<u8>>,
    pub coe_script: CoeScript,
    download_staging: Option<DownloadStaging>,
    upload_staging: Option<UploadStaging>,

    /// Register writes processed by this device: `(command, register, data)`.
    pub writes: Vec<(u8, u16, Vec<u8>)>,
    /// Number of SM1 status byte polls served.
    pub polls: usize,
    /// Number of read mailbox fetches served.
    pub fetches: usize,
    /// Number of AL status reads served.
    pub al_status_reads: usize,
}

impl SimSubDevice {
    pub fn new(sii: &SiiBuilder) -> Self {
        let image = sii.build();

        let mut device = Self {
            regs: vec![0u8; 0x1000],
            station_address: 0,
            sii: image,
            sii_address: 0,
            sii_loading_reads: 0,
            al_state: 0x01, // INIT
            al_code: 0,
            al_pending: None,
            al_script: AlScript::default(),
            al_error_used: false,
            resume_after_ack: None,
            dc_supported: false,
            port_times: [1000, 2000, 3000, 4000],
            bypassed_ports: vec![2, 3],
            sync_diffs: VecDeque::new(),
            mailbox_write_offset: sii.mailbox_write_offset,
            mailbox_read_offset: sii.mailbox_read_offset,
            mailbox_size: sii.mailbox_size,
            tx_queue: VecDeque::new(),
            dictionary: BTreeMap::new(),
            coe_script: CoeScript::default(),
            download_staging: None,
            upload_staging: None,
            writes: Vec::new(),
            polls: 0,
            fetches: 0,
            al_status_reads: 0,
        };

        // Base information block: type, revision, build, FMMU count, SM count, RAM, ports
        device.regs[0x0000] = 0x11;
        device.regs[0x0001] = 0x02;
        device.regs[0x0004] = 8; // FMMUs
        device.regs[0x0005] = 4; // SMs
        device.regs[0x0007] = 0x0f;

        // DL status: ports 0 and 1 up with signal
        device.regs[0x0110] = 0x30;
        device.regs[0x0111] = 0x0a;

        device
    }

    pub fn with_dc(mut self) -> Self {
        self.dc_supported = true;

        // Support flags: DC + 64 bit
        self.regs[0x0008] = 0x0c;

        self
    }

    pub fn with_al_script(mut self, script: AlScript) -> Self {
        self.al_script = script;

        self
    }

    pub fn al_state(&self) -> u8 {
        self.al_state
    }

    fn has_register(&self, register: u16, len: usize) -> bool {
        if register == 0x0910 {
            return self.dc_supported;
        }

        usize::from(register) + len <= self.regs.len()
    }

    /// Serve a read of `len` bytes at `register` into `buf`.
    fn read_registers(&mut self, register: u16, buf: &mut [u8]) {
        // AL status progression: pending transitions complete after the scripted number of
        // polls
        if register == 0x0130 {
            self.al_status_reads += 1;

            if let Some((target, polls_left)) = self.al_pending {
                if polls_left == 0 {
                    self.al_state = target;
                    self.al_pending = None;
                } else {
                    self.al_pending = Some((target, polls_left - 1));
                }
            }
        }

        let at = usize::from(register);

        // Refresh dynamic registers before the copy-out
        self.regs[0x0130] = self.al_state;
        self.regs[0x0131] = 0;
        self.regs[0x0134..0x0136].copy_from_slice(&self.al_code.to_le_bytes());
        self.regs[0x0010..0x0012].copy_from_slice(&self.station_address.to_le_bytes());

        // SII status + address echo + data
        let sii_status: u16 = if self.sii_loading_reads > 0 {
            if register == 0x0502 {
                self.sii_loading_reads -= 1;
            }

            0x1000 // loading bit
        } else {
            0x0000
        };

        self.regs[0x0502..0x0504].copy_from_slice(&sii_status.to_le_bytes());
        self.regs[0x0504..0x0506].copy_from_slice(&self.sii_address.to_le_bytes());
        self.regs[0x0506..0x0508].copy_from_slice(&[0, 0]);

        let word = usize::from(self.sii_address) * 2;

        for (offset, slot) in (0..4).map(|i| (word + i, 0x0508 + i)) {
            self.regs[slot] = self.sii.get(offset).copied().unwrap_or(0);
        }

        // Read mailbox full flag in the SM1 status byte
        let full = if self.tx_queue.is_empty() { 0x00 } else { 0x08 };

        self.regs[0x080d] = full;

        // DC registers
        for (port, time) in self.port_times.iter().enumerate() {
            self.regs[0x0900 + port * 4..0x0904 + port * 4].copy_from_slice(&time.to_le_bytes());
        }

        if register == 0x092c {
            let diff = self.sync_diffs.pop_front().unwrap_or(0);

            self.regs[0x092c..0x0930].copy_from_slice(&diff.to_le_bytes());
        }

        if register == 0x080d {
            self.polls += 1;
        }

        buf.copy_from_slice(&self.regs[at..at + buf.len()]);
    }

    fn write_registers(&mut self, command: u8, register: u16, data: &[u8]) {
        self.writes.push((command, register, data.to_vec()));

        match register {
            0x0010 => {
                self.station_address = u16::from_le_bytes([data[0], data[1]]);
            }
            0x0120 => {
                let control = data[0];
                let target = control & 0x0f;

                if control & AL_ERROR_BIT != 0 {
                    // Error acknowledge: clear the error indicator
                    self.al_state &= 0x0f;
                    self.al_code = 0;

                    if let Some(resume) = self.resume_after_ack.take() {
                        self.al_pending = Some((resume, 1));
                    }
                } else if target != self.al_state & 0x0f {
                    if let Some((code_target, code)) = self.al_script.error_once {
                        if target == code_target && !self.al_error_used {
                            self.al_error_used = true;
                            self.al_state |= AL_ERROR_BIT;
                            self.al_code = code;
                            self.resume_after_ack = Some(target);

                            return;
                        }
                    }

                    self.al_pending = Some((target, self.al_script.delay_polls));
                }
            }
            0x0502 => {
                // SII control: only reads are implemented
                if data.len() >= 4 && data[1] & 0x01 != 0 {
                    self.sii_address = u16::from_le_bytes([data[2], data[3]]);
                }
            }
            _ => {
                let at = usize::from(register);

                if at + data.len() <= self.regs.len() {
                    self.regs[at..at + data.len()].copy_from_slice(data);
                }
            }
        }
    }

    /// Process one datagram addressed (or broadcast) to this device. Returns `true` if the
    /// device participated.
    fn process(&mut self, command: u8, register: u16, data: &mut [u8]) -> bool {
        match command {
            APRD | FPRD | BRD => {
                if register == self.mailbox_read_offset
                    && data.len() == usize::from(self.mailbox_size)
                {
                    return self.serve_mailbox_fetch(data);
                }

                if !self.has_register(register, data.len()) {
                    return false;
                }

                self.read_registers(register, data);

                true
            }
            APWR | FPWR | BWR => {
                if register == self.mailbox_write_offset
                    && data.len() == usize::from(self.mailbox_size)
                {
                    self.accept_mailbox_message(data);

                    return true;
                }

                if !self.has_register(register, data.len()) {
                    return false;
                }

                self.write_registers(command, register, data);

                true
            }
            _ => false,
        }
    }

    fn serve_mailbox_fetch(&mut self, data: &mut [u8]) -> bool {
        let Some(message) = self.tx_queue.pop_front() else {
            return false;
        };

        self.fetches += 1;

        data.fill(0);
        data[0..message.len()].copy_from_slice(&message);

        true
    }

    /// Queue a mailbox message with the given protocol type and payload.
    fn push_tx(&mut self, mailbox_type: u8, payload: &[u8]) {
        let mut message = vec![0u8; usize::from(self.mailbox_size)];

        message[0..2].copy_from_slice(&(payload.len() as u16).to_le_bytes());
        message[2..4].copy_from_slice(&self.station_address.to_le_bytes());
        message[5] = mailbox_type | 0x10; // counter 1
        message[6..6 + payload.len()].copy_from_slice(payload);

        self.tx_queue.push_back(message);
    }

    fn accept_mailbox_message(&mut self, window: &[u8]) {
        let length = usize::from(u16::from_le_bytes([window[0], window[1]]));
        let mailbox_type = window[5] & 0x0f;
        let payload = &window[6..6 + length];

        match mailbox_type {
            0x03 => self.serve_coe(&payload.to_vec()),
            0x05 => self.serve_soe(&payload.to_vec()),
            other => {
                // Unsupported protocol: standard mailbox error reply
                let _ = other;

                self.push_tx(0x00, &[0x01, 0x00, 0x02, 0x00]);
            }
        }
    }

    /// Usable mailbox payload bytes after the 6 byte header.
    fn tx_capacity(&self) -> usize {
        usize::from(self.mailbox_size) - 6
    }

    fn push_abort(&mut self, index: u16, sub_index: u8, code: u32) {
        let mut resp = vec![0u8; 10];

        resp[1] = 0x30;
        resp[2] = 0x04 << 5;
        resp[3..5].copy_from_slice(&index.to_le_bytes());
        resp[5] = sub_index;
        resp[6..10].copy_from_slice(&code.to_le_bytes());

        self.push_tx(0x03, &resp);
    }

    fn serve_coe(&mut self, payload: &[u8]) {
        let service = payload[1] >> 4;

        if let Some((code, register)) = self.coe_script.emergency_once.take() {
            let mut emergency = vec![0u8; 10];

            emergency[1] = 0x01 << 4;
            emergency[2..4].copy_from_slice(&code.to_le_bytes());
            emergency[4] = register;

            self.push_tx(0x03, &emergency);
        }

        match service {
            // SDO request
            0x02 => self.serve_sdo(payload),
            // SDO information
            0x08 => self.serve_sdo_info(payload),
            _ => self.push_tx(0x00, &[0x01, 0x00, 0x04, 0x00]),
        }
    }

    fn serve_sdo(&mut self, payload: &[u8]) {
        let flags = payload[2];
        let command = flags >> 5;

        match command {
            // Upload request
            0x02 => {
                let index = u16::from_le_bytes([payload[3], payload[4]]);
                let sub_index = payload[5];

                if let Some(&code) = self.coe_script.abort_upload.get(&(index, sub_index)) {
                    return self.push_abort(index, sub_index, code);
                }

                let Some(value) = self.dictionary.get(&(index, sub_index)).cloned() else {
                    return self.push_abort(index, sub_index, 0x0602_0000);
                };

                if value.len() <= 4 {
                    let mut resp = vec![0u8; 10];

                    resp[1] = 0x30;
                    resp[2] = (0x02 << 5)
                        | 0x02
                        | 0x01
                        | (((4 - value.len()) as u8) << 2);
                    resp[3..5].copy_from_slice(&index.to_le_bytes());
                    resp[5] = sub_index;
                    resp[6..6 + value.len()].copy_from_slice(&value);

                    self.push_tx(0x03, &resp);
                } else {
                    let capacity = self.tx_capacity() - 10;
                    let chunk = value.len().min(capacity);

                    let mut resp = vec![0u8; 10 + chunk];

                    resp[1] = 0x30;
                    resp[2] = (0x02 << 5) | 0x01;
                    resp[3..5].copy_from_slice(&index.to_le_bytes());
                    resp[5] = sub_index;
                    resp[6..10].copy_from_slice(&(value.len() as u32).to_le_bytes());
                    resp[10..].copy_from_slice(&value[0..chunk]);

                    self.upload_staging = Some(UploadStaging {
                        offset: chunk,
                        data: value,
                        toggle: false,
                    });

                    self.push_tx(0x03, &resp);
                }
            }

            // Upload segment request
            0x03 => {
                let toggle = payload[2] & 0x10 != 0;

                let Some(mut staging) = self.upload_staging.take() else {
                    return self.push_abort(0, 0, 0x0800_0000);
                };

                if toggle != staging.toggle {
                    return self.push_abort(0, 0, 0x0503_0000);
                }

                let capacity = self.tx_capacity() - 3;
                let remaining = staging.data.len() - staging.offset;
                let chunk = remaining.min(capacity);
                let last = chunk == remaining;

                let filler = 7usize.saturating_sub(chunk);

                let mut resp = vec![0u8; 3 + chunk + filler];

                resp[1] = 0x30;
                resp[2] = (last as u8) | ((filler as u8) << 1) | ((toggle as u8) << 4);
                resp[3..3 + chunk]
                    .copy_from_slice(&staging.data[staging.offset..staging.offset + chunk]);

                staging.offset += chunk;
                staging.toggle = !staging.toggle;

                if !last {
                    self.upload_staging = Some(staging);
                }

                self.push_tx(0x03, &resp);
            }

            // Download request
            0x01 => {
                let index = u16::from_le_bytes([payload[3], payload[4]]);
                let sub_index = payload[5];

                if let Some(&code) = self.coe_script.abort_download.get(&(index, sub_index)) {
                    return self.push_abort(index, sub_index, code);
                }

                let expedited = flags & 0x02 != 0;

                if expedited {
                    let unused = if flags & 0x01 != 0 {
                        usize::from((flags >> 2) & 0x03)
                    } else {
                        0
                    };

                    let value = payload[6..10 - unused].to_vec();

                    self.dictionary.insert((index, sub_index), value);
                } else {
                    let expected =
                        u32::from_le_bytes([payload[6], payload[7], payload[8], payload[9]])
                            as usize;
                    let buf = payload[10..].to_vec();

                    if buf.len() >= expected {
                        self.dictionary.insert((index, sub_index), buf);
                    } else {
                        self.download_staging = Some(DownloadStaging {
                            index,
                            sub_index,
                            expected,
                            buf,
                            toggle: false,
                        });
                    }
                }

                let mut resp = vec![0u8; 10];

                resp[1] = 0x30;
                resp[2] = 0x03 << 5;
                resp[3..5].copy_from_slice(&index.to_le_bytes());
                resp[5] = sub_index;

                self.push_tx(0x03, &resp);
            }

            // Download segment request
            0x00 => {
                let header = payload[2];
                let toggle = header & 0x10 != 0;
                let last = header & 0x01 != 0;
                let filler = usize::from((header >> 1) & 0x07);

                let Some(mut staging) = self.download_staging.take() else {
                    return self.push_abort(0, 0, 0x0800_0000);
                };

                if toggle != staging.toggle {
                    return self.push_abort(staging.index, staging.sub_index, 0x0503_0000);
                }

                let mut chunk = payload.len() - 3;

                if payload.len() == 10 {
                    chunk -= filler;
                }

                staging
                    .buf
                    .extend_from_slice(&payload[3..3 + chunk]);
                staging.toggle = !staging.toggle;

                let mut resp = vec![0u8; 3];

                resp[1] = 0x30;
                resp[2] = (0x01 << 5) | ((toggle as u8) << 4);

                if last {
                    staging.buf.truncate(staging.expected);

                    self.dictionary
                        .insert((staging.index, staging.sub_index), staging.buf.clone());
                } else {
                    self.download_staging = Some(staging);
                }

                self.push_tx(0x03, &resp);
            }

            _ => self.push_abort(0, 0, 0x0504_0001),
        }
    }

    fn serve_sdo_info(&mut self, payload: &[u8]) {
        let op_code = payload[2] & 0x7f;

        match op_code {
            // Get OD list request
            0x01 => {
                let indices: Vec<u16> =
                    self.coe_script.od.iter().map(|(index, ..)| *index).collect();

                // First fragment carries the list type echo; keep it simple with a single
                // fragment, the capacity is plenty for test dictionaries
                let mut resp = vec![0u8; 8 + indices.len() * 2];

                resp[1] = 0x80;
                resp[2] = 0x02;
                resp[6..8].copy_from_slice(&0x0001u16.to_le_bytes());

                for (at, index) in indices.iter().enumerate() {
                    resp[8 + at * 2..10 + at * 2].copy_from_slice(&index.to_le_bytes());
                }

                self.push_tx(0x03, &resp);
            }

            // Get object description request
            0x03 => {
                let index = u16::from_le_bytes([payload[6], payload[7]]);

                let Some((_, max_sub, object_code, name)) = self
                    .coe_script
                    .od
                    .iter()
                    .find(|(at, ..)| *at == index)
                    .copied()
                else {
                    return self.push_info_error(0x0602_0000);
                };

                let mut resp = vec![0u8; 12 + name.len()];

                resp[1] = 0x80;
                resp[2] = 0x04;
                resp[6..8].copy_from_slice(&index.to_le_bytes());
                resp[10] = max_sub;
                resp[11] = object_code;
                resp[12..].copy_from_slice(name.as_bytes());

                self.push_tx(0x03, &resp);
            }

            // Get entry description request
            0x05 => {
                let index = u16::from_le_bytes([payload[6], payload[7]]);
                let sub_index = payload[8];

                if let Some(&code) = self.coe_script.entry_aborts.get(&(index, sub_index)) {
                    return self.push_info_error(code);
                }

                let bits = self
                    .dictionary
                    .get(&(index, sub_index))
                    .map(|value| value.len() as u16 * 8)
                    .unwrap_or(8);

                let mut resp = vec![0u8; 16];

                resp[1] = 0x80;
                resp[2] = 0x06;
                resp[6..8].copy_from_slice(&index.to_le_bytes());
                resp[8] = sub_index;
                resp[10..12].copy_from_slice(&0x0007u16.to_le_bytes()); // data type
                resp[12..14].copy_from_slice(&bits.to_le_bytes());
                resp[14..16].copy_from_slice(&0x0007u16.to_le_bytes()); // readable everywhere

                self.push_tx(0x03, &resp);
            }

            _ => self.push_info_error(0x0504_0001),
        }
    }

    fn push_info_error(&mut self, code: u32) {
        let mut resp = vec![0u8; 10];

        resp[1] = 0x80;
        resp[2] = 0x07;
        resp[6..10].copy_from_slice(&code.to_le_bytes());

        self.push_tx(0x03, &resp);
    }

    fn serve_soe(&mut self, payload: &[u8]) {
        let header = payload[0];
        let op_code = header & 0x07;
        let drive = header >> 5;

        // Only single fragment writes are served
        if op_code == 0x03 {
            let idn = u16::from_le_bytes([payload[2], payload[3]]);

            let mut resp = vec![0u8; 4];

            resp[0] = 0x04 | (drive << 5);
            resp[1] = 0x40;
            resp[2..4].copy_from_slice(&idn.to_le_bytes());

            self.push_tx(0x05, &resp);
        }
    }

    /// Latch the DC receive times of all non-bypassed ports.
    fn latch_dc_times(&mut self) {
        for port in 0..4u8 {
            if !self.bypassed_ports.contains(&port) {
                self.port_times[usize::from(port)] =
                    self.port_times[usize::from(port)].wrapping_add(500);
            }
        }
    }
}

/// A ring of simulated SubDevices.
pub struct Sim {
    pub devices: Vec<SimSubDevice>,
}

impl Sim {
    pub fn new(devices: Vec<SimSubDevice>) -> Self {
        Self { devices }
    }

    /// Run a frame through the ring in place, exactly as the forward pass would: every device
    /// rewrites the datagrams it participates in and bumps their working counters.
    pub fn process_frame(&mut self, frame: &mut [u8]) {
        let payload_len = usize::from(u16::from_le_bytes([frame[0], frame[1]]) & 0x07ff);

        let mut cursor = 2usize;

        while cursor + 12 <= 2 + payload_len {
            let command = frame[cursor];
            let flags = u16::from_le_bytes([frame[cursor + 6], frame[cursor + 7]]);
            let data_len = usize::from(flags & 0x07ff);

            let data_start = cursor + 10;
            let wkc_at = data_start + data_len;

            for device in self.devices.iter_mut() {
                let adp = u16::from_le_bytes([frame[cursor + 2], frame[cursor + 3]]);
                let ado = u16::from_le_bytes([frame[cursor + 4], frame[cursor + 5]]);

                let (participates, next_adp) = match command {
                    APRD | APWR => (adp == 0, adp.wrapping_add(1)),
                    FPRD | FPWR => (adp == device.station_address, adp),
                    BRD | BWR => (true, adp.wrapping_add(1)),
                    _ => (false, adp),
                };

                frame[cursor + 2..cursor + 4].copy_from_slice(&next_adp.to_le_bytes());

                if !participates {
                    continue;
                }

                // The DC latch is a side effect of the frame passing, before the register
                // write itself
                if command == BWR && ado == 0x0900 {
                    device.latch_dc_times();
                }

                let processed =
                    device.process(command, ado, &mut frame[data_start..data_start + data_len]);

                if processed {
                    let wkc = u16::from_le_bytes([frame[wkc_at], frame[wkc_at + 1]])
                        .wrapping_add(1);

                    frame[wkc_at..wkc_at + 2].copy_from_slice(&wkc.to_le_bytes());
                }
            }

            let more = flags & 0x8000 != 0;

            cursor = wkc_at + 2;

            if !more {
                break;
            }
        }
    }
}

/// Pump the engine against the simulator for `ticks` iterations of 1 ms each.
pub fn run(engine: &mut MainDevice, sim: &mut Sim, ticks: usize) {
    let mut now = Instant::ZERO;

    for _ in 0..ticks {
        engine.tick(now);

        let mut buf = [0u8; 1600];

        while let Some(len) = engine.next_frame(&mut buf, now) {
            let mut frame = buf[0..len].to_vec();

            sim.process_frame(&mut frame);

            engine.receive_frame(&frame, now).expect("receive frame");
        }

        now = now + Duration::from_millis(1);
    }
}
