//! The CDMA command descriptor shared with the controller, and decoding of its status word.

use deku::prelude::*;

/// Size of one descriptor in DMA memory
pub const DESCRIPTOR_SIZE: usize = 56;

/// Byte offset of the status word inside a descriptor
pub const STATUS_OFFSET: usize = 32;

pub const CFPTR_MEM: crate::regs::Field = crate::regs::Field::new(24, 3);

pub const CF_INT: u16 = 1 << 8;
pub const CF_CONT: u16 = 1 << 9;
pub const CF_DMA_MASTER: u16 = 1 << 10;

pub const CS_ERR_IDX_SHIFT: u32 = 24;
pub const CS_COMP: u32 = 1 << 15;
pub const CS_FAIL: u32 = 1 << 14;
pub const CS_ERP: u32 = 1 << 11;
pub const CS_TOUT: u32 = 1 << 10;
pub const CS_MAXERR: crate::regs::Field = crate::regs::Field::new(2, 8);
pub const CS_UNCE: u32 = 1 << 1;
pub const CS_ERR: u32 = 1 << 0;

/// Descriptor command types
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u16)]
pub enum CommandKind {
    Erase = 0x1000,
    Reset = 0x1100,
    CopyBack = 0x1200,
    Write = 0x2100,
    Read = 0x2200,
    Nop = 0xFFFF,
}

impl CommandKind {
    pub fn from_raw(raw: u16) -> Option<Self> {
        Some(match raw {
            0x1000 => Self::Erase,
            0x1100 => Self::Reset,
            0x1200 => Self::CopyBack,
            0x2100 => Self::Write,
            0x2200 => Self::Read,
            0xFFFF => Self::Nop,
            _ => return None,
        })
    }
}

/// In-memory layout of a CDMA descriptor, little endian as the controller reads it
#[derive(Debug, Default, Clone, PartialEq, Eq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub struct CdmaDescriptor {
    pub next_pointer: u64,
    pub flash_pointer: u32,
    rsvd0: u32,
    pub command_type: u16,
    rsvd1: u16,
    pub command_flags: u16,
    rsvd2: u16,
    pub memory_pointer: u64,
    pub status: u32,
    rsvd3: u32,
    pub sync_flag_pointer: u64,
    pub sync_arguments: u32,
    rsvd4: u32,
}

impl CdmaDescriptor {
    /// A terminal descriptor for `kind` on flash bank `bank`, row `page`, moving data
    /// to or from bus address `memory`. The controller masters the DMA and raises the
    /// thread-complete interrupt when done.
    pub fn new(kind: CommandKind, bank: u8, page: u32, memory: u64) -> Self {
        Self {
            flash_pointer: CFPTR_MEM.put(bank.into()).wrapping_add(page),
            command_type: kind as u16,
            command_flags: CF_DMA_MASTER | CF_INT,
            memory_pointer: memory,
            ..Default::default()
        }
    }

    pub fn bank(&self) -> u8 {
        CFPTR_MEM.get(self.flash_pointer) as u8
    }

    pub fn page(&self) -> u32 {
        self.flash_pointer & ((1 << CFPTR_MEM.shift) - 1)
    }

    pub fn kind(&self) -> Option<CommandKind> {
        CommandKind::from_raw(self.command_type)
    }
}

/// What a finished descriptor says about the operation
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Outcome {
    Ok,
    /// ECC fixed errors; the payload is the worst per-sector count
    Corrected(u8),
    Erased,
    Uncorrectable,
    Fail,
}

/// A descriptor status word
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DescriptorStatus(pub u32);

impl DescriptorStatus {
    pub fn is_complete(self) -> bool {
        self.0 & CS_COMP != 0
    }

    pub fn is_failed(self) -> bool {
        self.0 & CS_FAIL != 0
    }

    /// Highest number of bit errors corrected in any sector
    pub fn max_errors(self) -> u8 {
        CS_MAXERR.get(self.0) as u8
    }

    /// Index of the descriptor that reported an error in a chain
    pub fn error_index(self) -> u8 {
        (self.0 >> CS_ERR_IDX_SHIFT) as u8
    }

    /// Classify a finished status word.
    ///
    /// Erased-page detection wins over everything, then uncorrectable ECC, then a malformed
    /// descriptor, then corrected errors; a plain fail flag comes last.
    pub fn outcome(self) -> Outcome {
        let s = self.0;
        if s & CS_ERP != 0 {
            Outcome::Erased
        } else if s & CS_UNCE != 0 {
            Outcome::Uncorrectable
        } else if s & CS_ERR != 0 {
            log::error!("CDMA descriptor error flag detected");
            Outcome::Fail
        } else if self.max_errors() != 0 {
            Outcome::Corrected(self.max_errors())
        } else if s & CS_FAIL != 0 {
            Outcome::Fail
        } else {
            Outcome::Ok
        }
    }
}

#[test]
fn test_descriptor_layout() {
    let desc = CdmaDescriptor::new(CommandKind::Read, 1, 0x1234, 0x8000_0000);
    let bytes = desc.to_bytes().unwrap();
    assert_eq!(bytes.len(), DESCRIPTOR_SIZE);
    assert_eq!(&bytes[8..12], &0x0100_1234u32.to_le_bytes());
    assert_eq!(&bytes[16..18], &0x2200u16.to_le_bytes());
    assert_eq!(&bytes[20..22], &(CF_DMA_MASTER | CF_INT).to_le_bytes());
    assert_eq!(&bytes[24..32], &0x8000_0000u64.to_le_bytes());

    let (_, parsed) = CdmaDescriptor::from_bytes((bytes.as_slice(), 0)).unwrap();
    assert_eq!(parsed.bank(), 1);
    assert_eq!(parsed.page(), 0x1234);
    assert_eq!(parsed.kind(), Some(CommandKind::Read));
}

#[test]
fn test_status_priority() {
    let maxerr = CS_MAXERR.put(5);

    assert_eq!(
        DescriptorStatus(CS_COMP | CS_ERP | CS_UNCE | CS_FAIL).outcome(),
        Outcome::Erased
    );
    assert_eq!(
        DescriptorStatus(CS_COMP | CS_UNCE | CS_ERR | maxerr).outcome(),
        Outcome::Uncorrectable
    );
    assert_eq!(DescriptorStatus(CS_ERR | maxerr).outcome(), Outcome::Fail);
    assert_eq!(
        DescriptorStatus(CS_COMP | CS_FAIL | maxerr).outcome(),
        Outcome::Corrected(5)
    );
    assert_eq!(DescriptorStatus(CS_COMP | CS_FAIL).outcome(), Outcome::Fail);
    assert_eq!(DescriptorStatus(CS_COMP).outcome(), Outcome::Ok);
}
