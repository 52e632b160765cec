//! The NAND array behind the simulated controller: raw cells with program/erase semantics, a
//! per-page noise mask for bitflips, and the sector-by-sector ECC model the controller applies
//! to a transfer.

use std::collections::BTreeMap;
use std::io::{Read, Write};

use anyhow::ensure;
use crc::{Crc, CRC_32_JAMCRC};

use crate::descriptor::{CS_COMP, CS_ERP, CS_FAIL, CS_MAXERR, CS_UNCE};
use crate::geometry::TransferConfig;
use crate::nand::{NandLayout, PageUtil};

const PARITY_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_JAMCRC);

/// How the controller's ECC engine is set up for one transfer
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct EccMode {
    pub corr_cap: u32,
    /// Check-bit bytes stored after every sector
    pub ecc_bytes: u32,
    pub erase_detect: bool,
}

/// A simulated NAND chip
#[derive(Debug, Clone)]
pub struct SimFlash {
    blocks: Box<[SimBlock]>,
    layout: NandLayout,
}

/// A block of SimFlash
#[derive(Debug, Clone)]
pub struct SimBlock {
    /// Every page, main and spare area back to back
    cells: Vec<u8>,

    /// Bits that read back inverted, keyed by page within the block
    noise: BTreeMap<u32, Vec<u8>>,

    erase_count: u32,
}

impl SimBlock {
    fn new(layout: NandLayout) -> Self {
        let raw_page = layout.bytes_per_page + layout.spare_per_page;
        Self {
            cells: vec![0xFF; raw_page * layout.pages_per_block as usize],
            noise: BTreeMap::new(),
            erase_count: 0,
        }
    }
}

impl SimFlash {
    /// Create an erased chip with the specified layout
    pub fn new(layout: NandLayout) -> Self {
        let blocks = vec![SimBlock::new(layout); layout.blocks as usize];
        let blocks = blocks.into_boxed_slice();

        Self { blocks, layout }
    }

    pub fn layout(&self) -> NandLayout {
        self.layout
    }

    /// Bytes per page including the spare area
    pub fn raw_page_size(&self) -> usize {
        self.layout.bytes_per_page + self.layout.spare_per_page
    }

    fn locate(&self, page: u32) -> Option<(usize, usize)> {
        let block = (page / self.layout.pages_per_block) as usize;
        let index = (page % self.layout.pages_per_block) as usize;
        (block < self.blocks.len()).then_some((block, index * self.raw_page_size()))
    }

    /// The programmed cell contents of `page`, without noise
    pub fn page_cells(&self, page: u32) -> Option<&[u8]> {
        let (block, start) = self.locate(page)?;
        Some(&self.blocks[block].cells[start..start + self.raw_page_size()])
    }

    fn page_cells_mut(&mut self, page: u32) -> Option<&mut [u8]> {
        let (block, start) = self.locate(page)?;
        let len = self.raw_page_size();
        Some(&mut self.blocks[block].cells[start..start + len])
    }

    fn page_noise(&self, page: u32) -> Option<&[u8]> {
        let (block, _) = self.locate(page)?;
        self.blocks[block]
            .noise
            .get(&(page % self.layout.pages_per_block))
            .map(Vec::as_slice)
    }

    /// Make the bits of `mask` at byte `offset` of `page` read back inverted until the block
    /// is erased
    pub fn flip_bits(&mut self, page: u32, offset: usize, mask: u8) {
        let raw_page = self.raw_page_size();
        let pages_per_block = self.layout.pages_per_block;
        if let Some((block, _)) = self.locate(page) {
            if offset < raw_page {
                let noise = self.blocks[block]
                    .noise
                    .entry(page % pages_per_block)
                    .or_insert_with(|| vec![0; raw_page]);
                noise[offset] ^= mask;
            }
        }
    }

    pub fn erase_block(&mut self, block: u32) -> bool {
        match self.blocks.get_mut(block as usize) {
            Some(b) => {
                b.cells.fill(0xFF);
                b.noise.clear();
                b.erase_count += 1;
                true
            }
            None => false,
        }
    }

    pub fn erase_count(&self, block: u32) -> u32 {
        self.blocks.get(block as usize).map_or(0, |b| b.erase_count)
    }

    /// Program `data` at byte `offset` of `page`; cells can only go from 1 to 0
    fn program_raw(&mut self, page: u32, offset: usize, data: &[u8]) {
        if let Some(cells) = self.page_cells_mut(page) {
            let end = (offset + data.len()).min(cells.len());
            if offset < end {
                for (cell, byte) in cells[offset..end].iter_mut().zip(data) {
                    *cell &= byte;
                }
            }
        }
    }

    /// Cells as they read back, noise included
    fn sense(&self, page: u32, offset: usize, len: usize) -> Vec<u8> {
        let mut out = vec![0xFF; len];
        if let Some(cells) = self.page_cells(page) {
            let end = (offset + len).min(cells.len());
            if offset < end {
                out[..end - offset].copy_from_slice(&cells[offset..end]);
            }
        }
        if let Some(noise) = self.page_noise(page) {
            for (i, b) in out.iter_mut().enumerate() {
                if let Some(n) = noise.get(offset + i) {
                    *b ^= n;
                }
            }
        }
        out
    }

    fn noise_bits(&self, page: u32, offset: usize, len: usize) -> u32 {
        self.page_noise(page).map_or(0, |noise| {
            noise
                .iter()
                .skip(offset)
                .take(len)
                .map(|n| n.count_ones())
                .sum()
        })
    }

    /// Program a transfer described by `cfg` into `page`, computing check bits per sector when
    /// `ecc` is given
    pub fn program(&mut self, page: u32, cfg: &TransferConfig, ecc: Option<EccMode>, data: &[u8]) {
        let mut pos = cfg.offset as usize;
        let mut consumed = 0;
        for len in sector_lengths(cfg) {
            let end = (consumed + len).min(data.len());
            let sector = &data[consumed.min(end)..end];
            self.program_raw(page, pos, sector);
            pos += len;
            consumed += len;

            if let Some(ecc) = ecc {
                let parity = parity(sector, ecc.ecc_bytes as usize);
                self.program_raw(page, pos, &parity);
                pos += parity.len();
            }
        }
    }

    /// Read a transfer described by `cfg` out of `page`, returning the bytes handed to the
    /// host and the descriptor status the controller would report
    pub fn read(&self, page: u32, cfg: &TransferConfig, ecc: Option<EccMode>) -> (Vec<u8>, u32) {
        let Some(ecc) = ecc else {
            let data = self.sense(page, cfg.offset as usize, cfg.byte_count() as usize);
            return (data, CS_COMP);
        };

        let mut out = Vec::with_capacity(cfg.byte_count() as usize);
        let mut pos = cfg.offset as usize;
        let mut max_flips = 0;
        let mut uncorrectable = false;
        let mut all_erased = true;

        for len in sector_lengths(cfg) {
            let span = len + ecc.ecc_bytes as usize;
            let flips = self.noise_bits(page, pos, span);
            let mut clean = self
                .page_cells(page)
                .map(|cells| cells[pos.min(cells.len())..(pos + len).min(cells.len())].to_vec())
                .unwrap_or_default();
            clean.resize(len, 0xFF);
            let erased = self
                .page_cells(page)
                .map_or(true, |cells| {
                    cells[pos.min(cells.len())..(pos + span).min(cells.len())].is_erased()
                });

            all_erased &= erased && flips == 0;
            if erased && flips != 0 {
                // check bits of an erased sector never decode
                uncorrectable = true;
                out.extend(self.sense(page, pos, len));
            } else if flips > ecc.corr_cap {
                uncorrectable = true;
                out.extend(self.sense(page, pos, len));
            } else {
                max_flips = max_flips.max(flips);
                out.extend(clean);
            }
            pos += span;
        }

        let status = if all_erased {
            if ecc.erase_detect {
                out.fill(0xFF);
                CS_COMP | CS_ERP
            } else {
                CS_COMP | CS_FAIL | CS_UNCE
            }
        } else if uncorrectable {
            CS_COMP | CS_FAIL | CS_UNCE
        } else {
            CS_COMP | CS_MAXERR.put(max_flips)
        };
        (out, status)
    }

    /// Initialize the chip contents with raw pages (main and spare) read from `read`
    pub fn load<R: Read>(&mut self, read: &mut R) -> anyhow::Result<()> {
        for block in self.blocks.iter_mut() {
            read.read_exact(&mut block.cells)?;
            block.noise.clear();
        }

        Ok(())
    }

    /// Write the raw contents of every page out to a writable stream (such as a File)
    pub fn save<W: Write>(&self, write: &mut W) -> anyhow::Result<()> {
        ensure!(!self.blocks.is_empty(), "chip has no blocks");
        for block in self.blocks.iter() {
            write.write_all(&block.cells)?;
        }

        Ok(())
    }
}

/// Length of each sector of a transfer, in order
fn sector_lengths(cfg: &TransferConfig) -> impl Iterator<Item = usize> {
    let count = cfg.sector_count.max(1);
    let (size, last) = (cfg.sector_size as usize, cfg.last_sector_size as usize);
    (0..count).map(move |i| if i + 1 == count { last } else { size })
}

/// Stand-in check bits: a CRC of the sector repeated to fill the space. Blank sectors keep
/// blank check bits so that programming all-0xFF leaves a page erased.
fn parity(sector: &[u8], len: usize) -> Vec<u8> {
    if sector.is_erased() {
        return vec![0xFF; len];
    }
    let crc = PARITY_CRC.checksum(sector).to_le_bytes();
    crc.iter().copied().cycle().take(len).collect()
}

#[cfg(test)]
const TEST_LAYOUT: NandLayout = NandLayout {
    blocks: 4,
    pages_per_block: 4,
    bytes_per_page: 2048,
    spare_per_page: 64,
};

#[cfg(test)]
const TEST_ECC: EccMode = EccMode {
    corr_cap: 8,
    ecc_bytes: 14,
    erase_detect: true,
};

#[cfg(test)]
fn test_cfg() -> TransferConfig {
    TransferConfig {
        offset: 0,
        sector_count: 2,
        sector_size: 1024,
        last_sector_size: 1024 + 16,
    }
}

#[test]
fn test_program_is_and_and_erase_resets() {
    let mut flash = SimFlash::new(TEST_LAYOUT);
    let cfg = TransferConfig {
        offset: 10,
        sector_count: 1,
        sector_size: 0,
        last_sector_size: 2,
    };
    flash.program(5, &cfg, None, &[0xF0, 0x0F]);
    flash.program(5, &cfg, None, &[0x3C, 0xFF]);
    assert_eq!(&flash.page_cells(5).unwrap()[10..12], &[0x30, 0x0F]);

    assert!(flash.erase_block(1));
    assert!(flash.page_cells(5).unwrap().is_erased());
    assert_eq!(flash.erase_count(1), 1);
    assert!(!flash.erase_block(4));
}

#[test]
fn test_ecc_read_corrects_and_reports() {
    let mut flash = SimFlash::new(TEST_LAYOUT);
    let cfg = test_cfg();
    let data: Vec<u8> = (0..cfg.byte_count()).map(|i| i as u8).collect();
    flash.program(0, &cfg, Some(TEST_ECC), &data);

    let (read, status) = flash.read(0, &cfg, Some(TEST_ECC));
    assert_eq!(read, data);
    assert_eq!(status, CS_COMP);

    flash.flip_bits(0, 3, 0x01);
    flash.flip_bits(0, 1024 + 14 + 5, 0x03);
    let (read, status) = flash.read(0, &cfg, Some(TEST_ECC));
    assert_eq!(read, data);
    assert_eq!(CS_MAXERR.get(status), 2);

    // the raw view keeps the check bits between the sectors
    let (raw, _) = flash.read(0, &cfg, None);
    assert_eq!(&raw[..3], &data[..3]);
    assert_ne!(&raw[1024..1038], &data[1024..1038]);
}

#[test]
fn test_ecc_read_uncorrectable_and_erased() {
    let mut flash = SimFlash::new(TEST_LAYOUT);
    let cfg = test_cfg();

    let (read, status) = flash.read(1, &cfg, Some(TEST_ECC));
    assert_eq!(status, CS_COMP | CS_ERP);
    assert!(read.is_erased());

    let no_detect = EccMode {
        erase_detect: false,
        ..TEST_ECC
    };
    assert_eq!(flash.read(1, &cfg, Some(no_detect)).1 & CS_UNCE, CS_UNCE);

    flash.flip_bits(1, 0, 0x01);
    assert_eq!(flash.read(1, &cfg, Some(TEST_ECC)).1 & CS_UNCE, CS_UNCE);

    let data = vec![0x55u8; cfg.byte_count() as usize];
    flash.program(2, &cfg, Some(TEST_ECC), &data);
    for offset in 0..9 {
        flash.flip_bits(2, offset, 0x01);
    }
    let (read, status) = flash.read(2, &cfg, Some(TEST_ECC));
    assert_eq!(status & CS_UNCE, CS_UNCE);
    assert_eq!(read[0], 0x54);
}

#[test]
fn test_load_save() {
    let mut flash = SimFlash::new(TEST_LAYOUT);
    let cfg = test_cfg();
    flash.program(7, &cfg, None, &vec![0x12; cfg.byte_count() as usize]);

    let mut image = Vec::new();
    flash.save(&mut image).unwrap();
    assert_eq!(image.len(), 4 * 4 * (2048 + 64));

    let mut copy = SimFlash::new(TEST_LAYOUT);
    copy.load(&mut image.as_slice()).unwrap();
    assert_eq!(copy.page_cells(7), flash.page_cells(7));
}
