//! The contract between a NAND controller driver and the NAND core above it: page callbacks,
//! the legacy byte-stream interface, ECC statistics, and helpers for page contents.

use std::str::FromStr;

use anyhow::ensure;

use crate::Result;

/// Convenience methods for operating on `[u8]`s that represent page contents
pub trait PageUtil {
    /// Does this page contain the all-1s bit pattern?
    fn is_erased(&self) -> bool;

    /// Number of bits that are 0, i.e. that differ from an erased page
    fn zero_bits(&self) -> u32;

    /// Decide whether a chunk that failed ECC is really an erased chunk with a few bitflips.
    ///
    /// If at most `threshold` bits are 0 the chunk is rewritten to all-0xFF and the number of
    /// flipped bits is returned; otherwise the chunk is left alone and `None` is returned.
    fn check_erased_chunk(&mut self, threshold: u32) -> Option<u32>;
}

impl PageUtil for [u8] {
    fn is_erased(&self) -> bool {
        self.iter().all(|&x| x == 0xFF)
    }

    fn zero_bits(&self) -> u32 {
        self.iter().map(|x| x.count_zeros()).sum()
    }

    fn check_erased_chunk(&mut self, threshold: u32) -> Option<u32> {
        let mut flips = 0u32;
        for x in self.iter() {
            flips += x.count_zeros();
            if flips > threshold {
                return None;
            }
        }

        self.fill(0xFF);
        Some(flips)
    }
}

/// A pub-fields struct describing the data layout of a NAND flash device
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct NandLayout {
    pub blocks: u32,
    pub pages_per_block: u32,
    pub bytes_per_page: usize,
    pub spare_per_page: usize,
}

impl NandLayout {
    pub fn erase_size(&self) -> usize {
        self.bytes_per_page * self.pages_per_block as usize
    }

    pub fn page_count(&self) -> u32 {
        self.blocks * self.pages_per_block
    }

    /// log2 of the page size
    pub fn page_shift(&self) -> u32 {
        self.bytes_per_page.trailing_zeros()
    }
}

/// Parse strings like "BLOCKSxPAGESxBYTES+SPARE"
impl FromStr for NandLayout {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let (dims, spare) = s
            .split_once('+')
            .ok_or(anyhow::anyhow!("expected #x#x#+#"))?;
        let [blocks, pages_per_block, bytes_per_page]: [&str; 3] = dims
            .split('x')
            .collect::<Vec<_>>()
            .try_into()
            .map_err(|_| anyhow::anyhow!("expected #x#x#+#"))?;
        let blocks = blocks.parse()?;
        let pages_per_block: u32 = pages_per_block.parse()?;
        let bytes_per_page: usize = bytes_per_page.parse()?;
        let spare_per_page = spare.parse()?;

        ensure!(
            bytes_per_page.is_power_of_two(),
            "page size must be a power of two"
        );
        ensure!(
            pages_per_block.is_power_of_two(),
            "pages per block must be a power of two"
        );

        Ok(NandLayout {
            blocks,
            pages_per_block,
            bytes_per_page,
            spare_per_page,
        })
    }
}

/// Running totals of ECC activity, as the MTD layer keeps them
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct EccStats {
    /// Bits corrected, summed over all reads
    pub corrected: u64,
    /// Reads that could not be corrected
    pub failed: u64,
}

/// Page-level callbacks the NAND core calls with a chip already selected.
///
/// `oob` is the caller's spare buffer; passing `Some` is the `oob_required` flag.
pub trait EccOps {
    /// Read a page with hardware ECC, returning the largest number of bitflips seen in a
    /// sector
    fn read_page(&mut self, buf: &mut [u8], oob: Option<&mut [u8]>, page: u32) -> Result<u32>;

    fn read_page_raw(&mut self, buf: &mut [u8], oob: Option<&mut [u8]>, page: u32)
        -> Result<()>;

    fn write_page(&mut self, buf: &[u8], oob: Option<&[u8]>, page: u32) -> Result<()>;

    fn write_page_raw(&mut self, buf: &[u8], oob: Option<&[u8]>, page: u32) -> Result<()>;

    fn read_oob(&mut self, oob: &mut [u8], page: u32) -> Result<()>;

    fn write_oob(&mut self, oob: &[u8], page: u32) -> Result<()>;

    /// Erase the block containing `page`
    fn erase_block(&mut self, page: u32) -> Result<()>;

    fn ecc_stats(&self) -> EccStats;
}

/// Commands the legacy `cmdfunc` hook can receive
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum NandCommand {
    Read0,
    RndOut,
    PageProg,
    ReadOob,
    Erase1,
    Status,
    SeqIn,
    RndIn,
    ReadId,
    Erase2,
    Param,
    GetFeatures,
    SetFeatures,
    Reset,
}

impl NandCommand {
    pub fn opcode(self) -> u8 {
        match self {
            Self::Read0 => 0x00,
            Self::RndOut => 0x05,
            Self::PageProg => 0x10,
            Self::ReadOob => 0x50,
            Self::Erase1 => 0x60,
            Self::Status => 0x70,
            Self::SeqIn => 0x80,
            Self::RndIn => 0x85,
            Self::ReadId => 0x90,
            Self::Erase2 => 0xD0,
            Self::Param => 0xEC,
            Self::GetFeatures => 0xEE,
            Self::SetFeatures => 0xEF,
            Self::Reset => 0xFF,
        }
    }
}

impl TryFrom<u8> for NandCommand {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, u8> {
        [
            Self::Read0,
            Self::RndOut,
            Self::PageProg,
            Self::ReadOob,
            Self::Erase1,
            Self::Status,
            Self::SeqIn,
            Self::RndIn,
            Self::ReadId,
            Self::Erase2,
            Self::Param,
            Self::GetFeatures,
            Self::SetFeatures,
            Self::Reset,
        ]
        .into_iter()
        .find(|cmd| cmd.opcode() == value)
        .ok_or(value)
    }
}

/// The pre-`exec_op` byte-stream interface, used by the core for identification
pub trait LegacyOps {
    /// Route following operations to chip select `chip`; `None` deselects
    fn select_chip(&mut self, chip: Option<u8>);

    /// Start `cmd` with column `col` and row `page` (each -1 when unused)
    fn cmdfunc(&mut self, cmd: u8, col: i32, page: i32);

    /// Next byte of the last command's output, 0xFF once it is exhausted
    fn read_byte(&mut self) -> u8;

    fn read_buf(&mut self, buf: &mut [u8]);

    /// Wait for the chip and return its status byte
    fn waitfunc(&mut self) -> u8;
}

#[test]
fn test_layout_parse() {
    let layout: NandLayout = "64x64x4096+224".parse().unwrap();
    assert_eq!(layout.blocks, 64);
    assert_eq!(layout.erase_size(), 64 * 4096);
    assert_eq!(layout.page_shift(), 12);
    assert_eq!(layout.spare_per_page, 224);

    assert!("64x64x4096".parse::<NandLayout>().is_err());
    assert!("64x64x4000+224".parse::<NandLayout>().is_err());
}

#[test]
fn test_check_erased_chunk() {
    let mut chunk = vec![0xFFu8; 512];
    chunk[3] = 0xFE;
    chunk[100] = 0x7F;
    assert_eq!(chunk.zero_bits(), 2);
    assert_eq!(chunk.check_erased_chunk(2), Some(2));
    assert!(chunk.is_erased());

    let mut chunk = vec![0xFFu8; 512];
    chunk[0] = 0x00;
    assert_eq!(chunk.check_erased_chunk(4), None);
    assert_eq!(chunk[0], 0x00);
}

#[test]
fn test_command_opcodes() {
    assert_eq!(NandCommand::try_from(0x90), Ok(NandCommand::ReadId));
    assert_eq!(NandCommand::try_from(0xEC), Ok(NandCommand::Param));
    assert_eq!(NandCommand::try_from(0x42), Err(0x42));
}
