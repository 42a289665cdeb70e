//! Raw EtherCAT commands, e.g. `LRW`, `BRD`, `APWR`, etc.

use crate::error::{Error, PduError};

const NOP: u8 = 0x00;
const APRD: u8 = 0x01;
const APWR: u8 = 0x02;
const APRW: u8 = 0x03;
const FPRD: u8 = 0x04;
const FPWR: u8 = 0x05;
const FPRW: u8 = 0x06;
const BRD: u8 = 0x07;
const BWR: u8 = 0x08;
const BRW: u8 = 0x09;
const LRD: u8 = 0x0A;
const LWR: u8 = 0x0B;
const LRW: u8 = 0x0C;
const ARMW: u8 = 0x0D;
const FRMW: u8 = 0x0E;

/// Commands that only read SubDevice memory.
#[derive(PartialEq, Eq, Debug, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum Reads {
    /// APRD.
    Aprd {
        /// Auto increment counter.
        address: u16,

        /// Memory location to read from.
        register: u16,
    },
    /// FPRD.
    Fprd {
        /// Configured station address.
        address: u16,

        /// Memory location to read from.
        register: u16,
    },
    /// Broadcast Read (BRD).
    Brd {
        /// Autoincremented by each SubDevice visited.
        address: u16,

        /// Memory location to read from.
        register: u16,
    },
    /// LRD.
    Lrd {
        /// Logical address.
        address: u32,
    },
}

/// Commands that write, or read and write, SubDevice memory.
#[derive(PartialEq, Eq, Debug, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum Writes {
    /// APWR.
    Apwr {
        /// Auto increment counter.
        address: u16,

        /// Memory location to write to.
        register: u16,
    },
    /// APRW.
    Aprw {
        /// Auto increment counter.
        address: u16,

        /// Memory location to exchange.
        register: u16,
    },
    /// FPWR.
    Fpwr {
        /// Configured station address.
        address: u16,

        /// Memory location to write to.
        register: u16,
    },
    /// FPRW.
    Fprw {
        /// Configured station address.
        address: u16,

        /// Memory location to exchange.
        register: u16,
    },
    /// BWR.
    Bwr {
        /// Autoincremented by each SubDevice visited.
        address: u16,

        /// Memory location to write to.
        register: u16,
    },
    /// BRW.
    Brw {
        /// Autoincremented by each SubDevice visited.
        address: u16,

        /// Memory location to exchange.
        register: u16,
    },
    /// LWR.
    Lwr {
        /// Logical address.
        address: u32,
    },
    /// LRW.
    Lrw {
        /// Logical address.
        address: u32,
    },
    /// Auto increment read, multiple write (ARMW).
    Armw {
        /// Auto increment counter.
        address: u16,

        /// Memory location to read from.
        register: u16,
    },
    /// Configured address read, multiple write (FRMW).
    Frmw {
        /// Configured station address.
        address: u16,

        /// Memory location to read from.
        register: u16,
    },
}

/// PDU command.
///
/// A command addresses a window of one SubDevice's memory (by ring position, configured station
/// address or broadcast) or the logical address space translated by the FMMUs of every mapped
/// SubDevice. It is recommended to use the constructor methods on `Command` rather than building
/// the [`Reads`]/[`Writes`] variants directly; the auto increment constructors perform the
/// two's-complement ring position negation for the caller.
#[derive(Default, PartialEq, Eq, Debug, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum Command {
    /// No operation.
    #[default]
    Nop,

    /// Read commands.
    Read(Reads),

    /// Write commands.
    Write(Writes),
}

impl core::fmt::Display for Command {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Command::Nop => write!(f, "NOP"),

            Command::Read(read) => match read {
                Reads::Aprd { address, register } => {
                    write!(f, "APRD(addr {}, reg {:#06x})", address, register)
                }
                Reads::Fprd { address, register } => {
                    write!(f, "FPRD(addr {:#06x}, reg {:#06x})", address, register)
                }
                Reads::Brd { register, .. } => write!(f, "BRD(reg {:#06x})", register),
                Reads::Lrd { address } => write!(f, "LRD(addr {:#010x})", address),
            },

            Command::Write(write) => match write {
                Writes::Apwr { address, register } => {
                    write!(f, "APWR(addr {}, reg {:#06x})", address, register)
                }
                Writes::Aprw { address, register } => {
                    write!(f, "APRW(addr {}, reg {:#06x})", address, register)
                }
                Writes::Fpwr { address, register } => {
                    write!(f, "FPWR(addr {:#06x}, reg {:#06x})", address, register)
                }
                Writes::Fprw { address, register } => {
                    write!(f, "FPRW(addr {:#06x}, reg {:#06x})", address, register)
                }
                Writes::Bwr { register, .. } => write!(f, "BWR(reg {:#06x})", register),
                Writes::Brw { register, .. } => write!(f, "BRW(reg {:#06x})", register),
                Writes::Lwr { address } => write!(f, "LWR(addr {:#010x})", address),
                Writes::Lrw { address } => write!(f, "LRW(addr {:#010x})", address),
                Writes::Armw { address, register } => {
                    write!(f, "ARMW(addr {}, reg {:#06x})", address, register)
                }
                Writes::Frmw { address, register } => {
                    write!(f, "FRMW(addr {:#06x}, reg {:#06x})", address, register)
                }
            },
        }
    }
}

impl Command {
    /// Create a broadcast read (BRD) command to the given register address.
    ///
    /// The address field is always zero when transmitted from the MainDevice.
    pub fn brd(register: u16) -> Reads {
        Reads::Brd {
            address: 0,
            register,
        }
    }

    /// Create a broadcast write (BWR) command to the given register address.
    pub fn bwr(register: u16) -> Writes {
        Writes::Bwr {
            address: 0,
            register,
        }
    }

    /// Create a broadcast read/write (BRW) command to the given register address.
    pub fn brw(register: u16) -> Writes {
        Writes::Brw {
            address: 0,
            register,
        }
    }

    /// FPRD.
    pub fn fprd(address: u16, register: u16) -> Reads {
        Reads::Fprd { address, register }
    }

    /// FPWR.
    pub fn fpwr(address: u16, register: u16) -> Writes {
        Writes::Fpwr { address, register }
    }

    /// FPRW.
    pub fn fprw(address: u16, register: u16) -> Writes {
        Writes::Fprw { address, register }
    }

    /// APRD addressed by ring position.
    ///
    /// The position is encoded as its two's-complement negation. Each SubDevice on the forward
    /// pass increments the address field and executes the command when the value reaches zero.
    pub fn aprd(ring_position: u16, register: u16) -> Reads {
        Reads::Aprd {
            address: 0u16.wrapping_sub(ring_position),
            register,
        }
    }

    /// APWR addressed by ring position.
    pub fn apwr(ring_position: u16, register: u16) -> Writes {
        Writes::Apwr {
            address: 0u16.wrapping_sub(ring_position),
            register,
        }
    }

    /// APRW addressed by ring position.
    pub fn aprw(ring_position: u16, register: u16) -> Writes {
        Writes::Aprw {
            address: 0u16.wrapping_sub(ring_position),
            register,
        }
    }

    /// Auto increment read, multiple write (ARMW), addressed by ring position.
    pub fn armw(ring_position: u16, register: u16) -> Writes {
        Writes::Armw {
            address: 0u16.wrapping_sub(ring_position),
            register,
        }
    }

    /// Configured address read, multiple write (FRMW).
    ///
    /// This can be used to distribute a value from one SubDevice to all others on the network,
    /// e.g. with distributed clocks.
    pub fn frmw(address: u16, register: u16) -> Writes {
        Writes::Frmw { address, register }
    }

    /// Logical Read (LRD).
    pub fn lrd(address: u32) -> Reads {
        Reads::Lrd { address }
    }

    /// Logical Write (LWR).
    pub fn lwr(address: u32) -> Writes {
        Writes::Lwr { address }
    }

    /// Logical Read Write (LRW), used mainly for sending and receiving PDI.
    pub fn lrw(address: u32) -> Writes {
        Writes::Lrw { address }
    }

    /// Get just the command code for a command.
    pub(crate) const fn code(&self) -> u8 {
        match self {
            Self::Nop => NOP,

            Self::Read(read) => match read {
                Reads::Aprd { .. } => APRD,
                Reads::Fprd { .. } => FPRD,
                Reads::Brd { .. } => BRD,
                Reads::Lrd { .. } => LRD,
            },

            Self::Write(write) => match write {
                Writes::Apwr { .. } => APWR,
                Writes::Aprw { .. } => APRW,
                Writes::Fpwr { .. } => FPWR,
                Writes::Fprw { .. } => FPRW,
                Writes::Bwr { .. } => BWR,
                Writes::Brw { .. } => BRW,
                Writes::Lwr { .. } => LWR,
                Writes::Lrw { .. } => LRW,
                Writes::Armw { .. } => ARMW,
                Writes::Frmw { .. } => FRMW,
            },
        }
    }

    /// Get the 4 byte address value for the command.
    pub(crate) fn address(&self) -> [u8; 4] {
        let mut arr = [0x00u8; 4];

        match *self {
            Command::Nop => arr,

            Command::Read(Reads::Aprd { address, register })
            | Command::Read(Reads::Brd { address, register })
            | Command::Read(Reads::Fprd { address, register })
            | Command::Write(Writes::Apwr { address, register })
            | Command::Write(Writes::Aprw { address, register })
            | Command::Write(Writes::Fpwr { address, register })
            | Command::Write(Writes::Fprw { address, register })
            | Command::Write(Writes::Bwr { address, register })
            | Command::Write(Writes::Brw { address, register })
            | Command::Write(Writes::Armw { address, register })
            | Command::Write(Writes::Frmw { address, register }) => {
                arr[0..2].copy_from_slice(&address.to_le_bytes());
                arr[2..4].copy_from_slice(&register.to_le_bytes());

                arr
            }
            Command::Read(Reads::Lrd { address })
            | Command::Write(Writes::Lwr { address })
            | Command::Write(Writes::Lrw { address }) => address.to_le_bytes(),
        }
    }

    /// Parse a command from a code and its 4 address bytes.
    pub(crate) fn parse(command_code: u8, addr: [u8; 4]) -> Result<Self, Error> {
        let physical = (
            u16::from_le_bytes([addr[0], addr[1]]),
            u16::from_le_bytes([addr[2], addr[3]]),
        );
        let logical = u32::from_le_bytes(addr);

        let command = match command_code {
            NOP => Command::Nop,

            APRD => Command::Read(Reads::Aprd {
                address: physical.0,
                register: physical.1,
            }),
            FPRD => Command::Read(Reads::Fprd {
                address: physical.0,
                register: physical.1,
            }),
            BRD => Command::Read(Reads::Brd {
                address: physical.0,
                register: physical.1,
            }),
            LRD => Command::Read(Reads::Lrd { address: logical }),

            APWR => Command::Write(Writes::Apwr {
                address: physical.0,
                register: physical.1,
            }),
            APRW => Command::Write(Writes::Aprw {
                address: physical.0,
                register: physical.1,
            }),
            FPWR => Command::Write(Writes::Fpwr {
                address: physical.0,
                register: physical.1,
            }),
            FPRW => Command::Write(Writes::Fprw {
                address: physical.0,
                register: physical.1,
            }),
            BWR => Command::Write(Writes::Bwr {
                address: physical.0,
                register: physical.1,
            }),
            BRW => Command::Write(Writes::Brw {
                address: physical.0,
                register: physical.1,
            }),
            LWR => Command::Write(Writes::Lwr { address: logical }),
            LRW => Command::Write(Writes::Lrw { address: logical }),
            ARMW => Command::Write(Writes::Armw {
                address: physical.0,
                register: physical.1,
            }),
            FRMW => Command::Write(Writes::Frmw {
                address: physical.0,
                register: physical.1,
            }),

            other => {
                crate::fmt::error!("Invalid command code {:#04x}", other);

                return Err(Error::Pdu(PduError::Decode));
            }
        };

        Ok(command)
    }

    /// How much each SubDevice that successfully processes this command adds to the working
    /// counter.
    ///
    /// Reads and writes add 1. Read/write commands add 1 for the read and 2 for the write, so a
    /// SubDevice that performs both adds 3. Broadcasts accumulate over every reached SubDevice.
    pub(crate) const fn working_counter_increment(&self) -> u16 {
        match self {
            Command::Nop => 0,

            Command::Read(_) => 1,

            Command::Write(write) => match write {
                Writes::Apwr { .. }
                | Writes::Fpwr { .. }
                | Writes::Bwr { .. }
                | Writes::Lwr { .. } => 1,
                Writes::Aprw { .. }
                | Writes::Fprw { .. }
                | Writes::Brw { .. }
                | Writes::Lrw { .. }
                | Writes::Armw { .. }
                | Writes::Frmw { .. } => 3,
            },
        }
    }

    /// `true` if this command is addressed to every SubDevice on the network.
    pub(crate) const fn is_broadcast(&self) -> bool {
        matches!(
            self,
            Command::Read(Reads::Brd { .. })
                | Command::Write(Writes::Bwr { .. })
                | Command::Write(Writes::Brw { .. })
        )
    }
}

impl From<Reads> for Command {
    fn from(value: Reads) -> Self {
        Self::Read(value)
    }
}

impl From<Writes> for Command {
    fn from(value: Writes) -> Self {
        Self::Write(value)
    }
}
