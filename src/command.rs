//! Encoders for the three ways of issuing work to the controller: PIO commands, generic
//! ("mini controller") commands and the CMD_REG0 trigger word of a CDMA descriptor chain.
//!
//! Everything in here is pure bit packing; the [`Controller`](crate::Controller) decides which
//! auxiliary registers to write before the trigger.

use crate::regs::{self, Field};

/// Operation codes understood by the PIO command type
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u16)]
pub enum PioOp {
    SetFeatures = 0x0100,
    Reset = 0x1100,
    CopyBack = 0x1200,
    ProgramPage = 0x2100,
    ReadPage = 0x2200,
}

/// A PIO command, written to CMD_REG0 after CMD_REG1 (and CMD_REG2 for SET FEATURES)
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PioCommand {
    pub op: PioOp,
    pub thread: u8,
    pub vol_id: u8,
    pub interrupt: bool,
}

impl PioCommand {
    pub fn new(op: PioOp, thread: u8) -> Self {
        Self {
            op,
            thread,
            vol_id: 0,
            interrupt: false,
        }
    }

    /// CMD_REG0 value that triggers this command
    pub fn encode(&self) -> u32 {
        regs::CMD_REG0_CT.put(regs::CT_PIO)
            | regs::CMD_REG0_TN.put(self.thread.into())
            | regs::CMD_REG0_VOL_ID.put(self.vol_id.into())
            | regs::CMD_REG0_INT.put(self.interrupt.into())
            | regs::CMD_REG0_PIO_CC.put(self.op as u32)
    }

    /// CMD_REG1 value selecting the bank and (for SET FEATURES) the feature address
    pub fn reg1(bank: u8, feature_addr: u8) -> u32 {
        regs::CMD_REG1_BANK.put(bank.into()) | regs::CMD_REG1_FADDR.put(feature_addr.into())
    }
}

/// CMD_REG0 value that starts the descriptor chain whose address sits in CMD_REG2/3
pub fn cdma_trigger(thread: u8) -> u32 {
    regs::CMD_REG0_CT.put(regs::CT_CDMA) | regs::CMD_REG0_TN.put(thread.into())
}

/// CMD_REG0 value that starts the generic command held in CMD_REG2/3
pub fn generic_trigger(thread: u8, interrupt: bool) -> u32 {
    regs::CMD_REG0_CT.put(regs::CT_GENERIC)
        | regs::CMD_REG0_TN.put(thread.into())
        | regs::CMD_REG0_INT.put(interrupt.into())
}

/// A bit field inside the 64-bit generic command word
#[derive(Debug, Copy, Clone)]
struct Field64 {
    shift: u32,
    mask: u64,
}

impl Field64 {
    const fn new(shift: u32, width: u32) -> Self {
        Self {
            shift,
            mask: (1 << width) - 1,
        }
    }

    const fn put(self, value: u64) -> u64 {
        (value & self.mask) << self.shift
    }

    const fn get(self, word: u64) -> u64 {
        (word >> self.shift) & self.mask
    }
}

const GCMD_INSTR: Field64 = Field64::new(0, 6);
const GCMD_TWB: u64 = 1 << 6;
const GCMD_JEDEC: u64 = 1 << 7;
const GCMD_CS: Field64 = Field64::new(8, 4);
const GCMD_INPUT_ADDR0: Field64 = Field64::new(16, 40);

const GCMD_DIR: Field64 = Field64::new(11, 1);
const GCMD_ECC_EN: u64 = 1 << 12;
const GCMD_SCR_EN: u64 = 1 << 13;
const GCMD_ERPG_EN: u64 = 1 << 14;
const GCMD_SECT_SIZE: Field64 = Field64::new(16, 16);
const GCMD_SECT_CNT: Field64 = Field64::new(32, 8);
const GCMD_LAST_SIZE: Field64 = Field64::new(40, 16);
const GCMD_CORR_CAP: Field64 = Field64::new(56, 2);

/// Instruction types of the generic command layer
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum Instruction {
    Data = 2,
    ReadStatus = 7,
    ChangeReadColumn = 12,
    ReadId = 27,
    ReadParameterPage = 28,
}

impl Instruction {
    pub fn from_raw(raw: u8) -> Option<Self> {
        Some(match raw {
            2 => Self::Data,
            7 => Self::ReadStatus,
            12 => Self::ChangeReadColumn,
            27 => Self::ReadId,
            28 => Self::ReadParameterPage,
            _ => return None,
        })
    }

    /// Commands after which the controller must honour tWB before polling R/B#
    fn needs_twb(self) -> bool {
        matches!(self, Self::ReadId | Self::ReadParameterPage)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum Direction {
    #[default]
    Read = 0,
    Write = 1,
}

/// Generic command carrying an address (read ID, read parameter page, change column...)
pub fn generic_address(instr: Instruction, chip_select: u8, addr: u64) -> u64 {
    let mut word = GCMD_INSTR.put(instr as u64)
        | GCMD_CS.put(chip_select.into())
        | GCMD_INPUT_ADDR0.put(addr);
    if instr.needs_twb() {
        word |= GCMD_TWB;
    }
    word
}

/// Parameters of a generic data transfer through the slave DMA interface
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct GenericData {
    pub direction: Direction,
    pub ecc: bool,
    pub scrambler: bool,
    pub erased_page_detection: bool,
    pub sector_size: u16,
    pub sector_count: u8,
    pub last_sector_size: u16,
    pub corr_cap: u8,
}

impl GenericData {
    /// A single-sector read of `len` bytes, which is all the byte-stream paths need
    pub fn read(len: u16) -> Self {
        Self {
            sector_count: 1,
            last_sector_size: len,
            ..Default::default()
        }
    }

    pub fn encode(&self, chip_select: u8) -> u64 {
        let mut word = GCMD_INSTR.put(Instruction::Data as u64)
            | GCMD_CS.put(chip_select.into())
            | GCMD_DIR.put(self.direction as u64)
            | GCMD_SECT_SIZE.put(self.sector_size.into())
            | GCMD_SECT_CNT.put(self.sector_count.into())
            | GCMD_LAST_SIZE.put(self.last_sector_size.into())
            | GCMD_CORR_CAP.put(self.corr_cap.into());
        if self.ecc {
            word |= GCMD_ECC_EN;
        }
        if self.scrambler {
            word |= GCMD_SCR_EN;
        }
        if self.erased_page_detection {
            word |= GCMD_ERPG_EN;
        }
        word
    }
}

/// A generic command word taken apart again, as the controller sees it
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DecodedGeneric {
    pub instr: u8,
    pub chip_select: u8,
    pub jedec: bool,
    pub twb: bool,
    pub addr: u64,
    pub data: GenericData,
}

impl DecodedGeneric {
    pub fn decode(word: u64) -> Self {
        let data = GenericData {
            direction: if GCMD_DIR.get(word) == 1 {
                Direction::Write
            } else {
                Direction::Read
            },
            ecc: word & GCMD_ECC_EN != 0,
            scrambler: word & GCMD_SCR_EN != 0,
            erased_page_detection: word & GCMD_ERPG_EN != 0,
            sector_size: GCMD_SECT_SIZE.get(word) as u16,
            sector_count: GCMD_SECT_CNT.get(word) as u8,
            last_sector_size: GCMD_LAST_SIZE.get(word) as u16,
            corr_cap: GCMD_CORR_CAP.get(word) as u8,
        };
        Self {
            instr: GCMD_INSTR.get(word) as u8,
            // bit 11 doubles as the data direction
            chip_select: (GCMD_CS.get(word) & 0x7) as u8,
            jedec: word & GCMD_JEDEC != 0,
            twb: word & GCMD_TWB != 0,
            addr: GCMD_INPUT_ADDR0.get(word),
            data,
        }
    }
}

/// Split a 64-bit command into the (CMD_REG2, CMD_REG3) pair
pub fn split(word: u64) -> (u32, u32) {
    (word as u32, (word >> 32) as u32)
}

/// Which command type a CMD_REG0 write selects
pub fn command_type(reg0: u32) -> u32 {
    regs::CMD_REG0_CT.get(reg0)
}

pub fn thread_of(reg0: u32) -> u8 {
    regs::CMD_REG0_TN.get(reg0) as u8
}

pub fn pio_op_of(reg0: u32) -> Option<PioOp> {
    const CC: Field = regs::CMD_REG0_PIO_CC;
    Some(match CC.get(reg0) {
        0x0100 => PioOp::SetFeatures,
        0x1100 => PioOp::Reset,
        0x1200 => PioOp::CopyBack,
        0x2100 => PioOp::ProgramPage,
        0x2200 => PioOp::ReadPage,
        _ => return None,
    })
}

#[test]
fn test_pio_encoding() {
    let reset = PioCommand::new(PioOp::Reset, 2).encode();
    assert_eq!(command_type(reset), regs::CT_PIO);
    assert_eq!(thread_of(reset), 2);
    assert_eq!(pio_op_of(reset), Some(PioOp::Reset));
    assert_eq!(reset & (1 << 20), 0);

    assert_eq!(PioCommand::reg1(1, 0x01), 0x0100_0001);
}

#[test]
fn test_generic_read_id_sets_twb() {
    let word = generic_address(Instruction::ReadId, 1, 0x20);
    let decoded = DecodedGeneric::decode(word);
    assert_eq!(decoded.instr, Instruction::ReadId as u8);
    assert!(decoded.twb);
    assert_eq!(decoded.chip_select, 1);
    assert_eq!(decoded.addr, 0x20);

    let chrc = DecodedGeneric::decode(generic_address(Instruction::ChangeReadColumn, 0, 12));
    assert!(!chrc.twb);
}

#[test]
fn test_generic_data_fields() {
    let data = GenericData {
        direction: Direction::Write,
        ecc: true,
        erased_page_detection: true,
        sector_size: 1024,
        sector_count: 4,
        last_sector_size: 1056,
        corr_cap: 3,
        ..Default::default()
    };
    let word = data.encode(2);
    assert_eq!(word & 0x3F, Instruction::Data as u64);
    assert_eq!((word >> 56) & 3, 3);
    assert_eq!(DecodedGeneric::decode(word).data, data);

    let (lo, hi) = split(word);
    assert_eq!(((hi as u64) << 32) | lo as u64, word);
}

#[test]
fn test_triggers() {
    assert_eq!(command_type(cdma_trigger(3)), regs::CT_CDMA);
    assert_eq!(thread_of(cdma_trigger(3)), 3);
    let gen = generic_trigger(1, true);
    assert_eq!(command_type(gen), regs::CT_GENERIC);
    assert_ne!(gen & (1 << 20), 0);
}
