//! The SII word read state machine.
//!
//! Reads a range of EEPROM words through the `0x0502` control register, one 4 byte chunk per
//! cycle: write the read request, then poll the combined control/address/data area until the
//! operation completes, distinguishing the initial "EEPROM not loaded" phase from ordinary
//! busy polling.

use crate::command::Command;
use crate::datagram::{Datagram, DatagramState};
use crate::eeprom::types::{SiiControl, SiiRequest};
use crate::error::{EepromError, Error};
use crate::fsm::{Ctx, Step};
use crate::register::RegisterAddress;
use crate::time::Instant;
use alloc::vec::Vec;
use ethercrab_wire::EtherCrabWireRead;

/// How SII datagrams address the SubDevice.
///
/// Auto increment addressing is used until the scanner has programmed a station address;
/// everything afterwards uses the configured address.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum SiiAddressing {
    AutoIncrement(u16),
    Configured(u16),
}

impl SiiAddressing {
    fn read(&self, register: u16, len: u16, name: &'static str) -> Result<Datagram, Error> {
        match *self {
            SiiAddressing::AutoIncrement(position) => {
                Datagram::read(Command::aprd(position, register), len, name)
            }
            SiiAddressing::Configured(address) => {
                Datagram::read(Command::fprd(address, register), len, name)
            }
        }
    }

    fn write(&self, register: u16, payload: &[u8], name: &'static str) -> Result<Datagram, Error> {
        match *self {
            SiiAddressing::AutoIncrement(position) => {
                Datagram::write(Command::apwr(position, register), payload, name)
            }
            SiiAddressing::Configured(address) => {
                Datagram::write(Command::fpwr(address, register), payload, name)
            }
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum State {
    Request,
    Check,
}

/// Reads `len_words` EEPROM words starting at `start_word` and yields the raw bytes.
#[derive(Debug)]
pub(crate) struct SiiRead {
    addressing: SiiAddressing,
    start_word: u16,
    len_words: u16,
    data: Vec<u8>,
    /// Words fetched so far.
    cursor: u16,
    state: State,
    /// Start of the current word cycle, the base for the busy timeout.
    cycle_started: Instant,
    /// Start of the whole read, the base for the EEPROM load timeout.
    load_started: Instant,
    load_seen: bool,
    check_once_more: bool,
}

impl SiiRead {
    pub(crate) fn new(addressing: SiiAddressing, start_word: u16, len_words: u16) -> Self {
        Self {
            addressing,
            start_word,
            len_words,
            data: Vec::with_capacity(usize::from(len_words) * 2),
            cursor: 0,
            state: State::Request,
            cycle_started: Instant::ZERO,
            load_started: Instant::ZERO,
            load_seen: false,
            check_once_more: true,
        }
    }

    /// Issue the first datagram.
    pub(crate) fn start(&mut self, ctx: &Ctx) -> Step<Vec<u8>> {
        self.load_started = ctx.now;

        self.request()
    }

    fn request(&mut self) -> Step<Vec<u8>> {
        self.state = State::Request;
        self.check_once_more = true;

        let request = SiiRequest::read(self.start_word + self.cursor);

        match self.addressing.write(
            RegisterAddress::SiiControl.into(),
            &request.as_array(),
            "SII read request",
        ) {
            Ok(datagram) => Step::Send(datagram),
            Err(e) => Step::Failed(e),
        }
    }

    fn check(&mut self) -> Step<Vec<u8>> {
        self.state = State::Check;

        // One read covers the control word, the address echo and the 4 data bytes
        match self
            .addressing
            .read(RegisterAddress::SiiControl.into(), 10, "SII check/fetch")
        {
            Ok(datagram) => Step::Send(datagram),
            Err(e) => Step::Failed(e),
        }
    }

    pub(crate) fn step(&mut self, ctx: &Ctx, reply: Option<&Datagram>) -> Step<Vec<u8>> {
        let Some(reply) = reply else {
            return Step::Wait;
        };

        if reply.state() == DatagramState::TimedOut {
            return Step::Failed(Error::Timeout);
        }

        let data = match reply.check() {
            Ok(data) => data,
            Err(e) => return Step::Failed(e),
        };

        match self.state {
            State::Request => {
                self.cycle_started = ctx.now;

                self.check()
            }
            State::Check => {
                let control = match SiiControl::unpack_from_slice(data) {
                    Ok(control) => control,
                    Err(e) => return Step::Failed(e.into()),
                };

                if control.command_error {
                    crate::fmt::error!(
                        "SII read error at word {:#06x}",
                        self.start_word + self.cursor
                    );

                    return Step::Failed(Error::Eeprom(EepromError::Device));
                }

                if control.loading {
                    if !self.load_seen {
                        self.load_seen = true;

                        crate::fmt::warn!("SII EEPROM not loaded yet, retrying");
                    }

                    // Read errors during the load window are tolerated; the retry loop is
                    // bounded only by the load timeout wall clock.
                    if ctx.now.duration_since(self.load_started) >= ctx.timeouts.sii_load {
                        if self.check_once_more {
                            self.check_once_more = false;
                        } else {
                            return Step::Failed(Error::Eeprom(EepromError::StillLoading));
                        }
                    }

                    return self.check();
                } else if self.load_seen {
                    self.load_seen = false;

                    crate::fmt::info!("SII EEPROM loaded, continuing");

                    // Restart the interrupted word cycle from the request
                    return self.request();
                }

                if control.is_busy() {
                    if ctx.now.duration_since(self.cycle_started) >= ctx.timeouts.sii_busy {
                        if self.check_once_more {
                            self.check_once_more = false;
                        } else {
                            return Step::Failed(Error::Timeout);
                        }
                    }

                    return self.check();
                }

                // Operation complete; the last 4 octets are the fetched words
                let Some(chunk) = data.get(6..10) else {
                    return Step::Failed(Error::Eeprom(EepromError::Decode));
                };

                let remaining_bytes = usize::from(self.len_words - self.cursor) * 2;

                self.data.extend_from_slice(&chunk[0..remaining_bytes.min(4)]);

                self.cursor += 2;

                if self.cursor >= self.len_words {
                    Step::Done(core::mem::take(&mut self.data))
                } else {
                    self.request()
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_addressing_modes() {
        let auto = SiiAddressing::AutoIncrement(2)
            .write(0x0502, &[0x80, 0x01, 0x40, 0x00], "req")
            .unwrap();

        assert_eq!(auto.command().code(), 0x02);
        assert_eq!(auto.command().address(), [0xfe, 0xff, 0x02, 0x05]);

        let configured = SiiAddressing::Configured(0x1001)
            .read(0x0502, 10, "check")
            .unwrap();

        assert_eq!(configured.command().code(), 0x04);
        assert_eq!(configured.command().address(), [0x01, 0x10, 0x02, 0x05]);
    }
}
