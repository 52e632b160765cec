//! Sector geometry of a page, the BCH engine's capabilities, and the table that turns a transfer
//! kind into TRAN_CFG register values.

use crate::regs;
use crate::{Error, Result};

/// Spare bytes that must stay free beyond the ECC check bits (bad block marker and friends)
pub const MINIMUM_SPARE_SIZE: u32 = 4;

/// Most spare bytes the controller moves along with the last sector
pub const MAX_SPARE_SIZE_PER_SECTOR: u32 = 32;

pub const BCH_MAX_NUM_CORR_CAPS: usize = 8;
pub const BCH_MAX_NUM_SECTOR_SIZES: usize = 2;

/// Correction strengths and sector sizes the BCH engine was synthesized with
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct BchConfig {
    pub corr_caps: [u8; BCH_MAX_NUM_CORR_CAPS],
    pub sector_sizes: [u16; BCH_MAX_NUM_SECTOR_SIZES],
}

impl BchConfig {
    /// Decode BCH_CFG_0..2
    pub fn from_registers(cfg0: u32, cfg1: u32, cfg2: u32) -> Self {
        let mut corr_caps = [0; BCH_MAX_NUM_CORR_CAPS];
        for (i, cap) in corr_caps.iter_mut().enumerate() {
            let reg = if i < 4 { cfg0 } else { cfg1 };
            *cap = regs::bch_corr_cap(i as u32).get(reg) as u8;
        }
        Self {
            corr_caps,
            sector_sizes: [
                regs::BCH_CFG_2_SECT_0.get(cfg2) as u16,
                regs::BCH_CFG_2_SECT_1.get(cfg2) as u16,
            ],
        }
    }

    /// Bytes of check bits per sector for `strength` bits of correction over `step_size`-byte
    /// sectors, or an error if the engine does not support that combination.
    pub fn ecc_bytes(&self, step_size: u32, strength: u32) -> Result<u32> {
        if !self.sector_sizes.iter().any(|&s| u32::from(s) == step_size) {
            let supported: Vec<_> = self.sector_sizes.iter().filter(|&&s| s != 0).collect();
            return Err(Error::UnsupportedEcc(format!(
                "ECC sector size {step_size} is not supported, supported sizes: {supported:?}"
            )));
        }

        // The Galois field order depends on the largest sector the engine handles
        let max_sector_size = self.sector_sizes.iter().copied().max().unwrap_or(0);
        let mult = match max_sector_size {
            256 => 12,
            512 => 13,
            1024 => 14,
            2048 => 15,
            other => {
                return Err(Error::UnsupportedEcc(format!(
                    "unexpected maximum ECC sector size {other}"
                )))
            }
        };

        if strength == 0 || !self.corr_caps.iter().any(|&c| u32::from(c) == strength) {
            let supported: Vec<_> = self.corr_caps.iter().filter(|&&c| c != 0).collect();
            return Err(Error::UnsupportedEcc(format!(
                "correction capability {strength} is not supported, supported: {supported:?}"
            )));
        }

        Ok(2 * ((mult * strength + 15) / 16))
    }
}

/// How a page is split into ECC sectors once the controller is configured
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct PageGeometry {
    /// Main area bytes per page
    pub main_size: u32,
    /// Physical spare bytes per page
    pub spare_size: u32,
    pub sector_size: u32,
    pub sector_count: u32,
    /// Check-bit bytes stored per sector (0 without ECC)
    pub ecc_bytes: u32,
    /// Correction strength in bits per sector (0 without ECC)
    pub corr_cap: u32,
    /// Spare bytes left for the user after the check bits, capped per sector
    pub unused_spare: u32,
}

impl PageGeometry {
    /// Lay out a page with hardware ECC of `strength` bits per `step_size` bytes.
    ///
    /// If the BCH engine cannot do that, the page is treated as one unprotected sector
    /// spanning the whole main area. Only a spare area too small for the check bits is an
    /// error.
    pub fn new(
        main_size: u32,
        spare_size: u32,
        bch: &BchConfig,
        step_size: u32,
        strength: u32,
    ) -> Result<Self> {
        let (sector_size, sector_count, ecc_bytes, corr_cap) =
            match bch.ecc_bytes(step_size, strength) {
                Ok(ecc_bytes) if step_size != 0 && main_size % step_size == 0 => {
                    log::info!(
                        "ECC enabled, correction capability: {strength}, sector size {step_size}"
                    );
                    (step_size, main_size / step_size, ecc_bytes, strength)
                }
                Ok(_) => {
                    log::error!("page size {main_size} is not a multiple of {step_size}");
                    (main_size, 1, 0, 0)
                }
                Err(e) => {
                    log::error!("Wrong ECC configuration: {e}");
                    (main_size, 1, 0, 0)
                }
            };

        let required = sector_count * ecc_bytes;
        if spare_size < MINIMUM_SPARE_SIZE || required >= spare_size - MINIMUM_SPARE_SIZE {
            return Err(Error::SpareTooSmall {
                required,
                available: spare_size,
            });
        }

        Ok(Self {
            main_size,
            spare_size,
            sector_size,
            sector_count,
            ecc_bytes,
            corr_cap,
            unused_spare: (spare_size - required).min(MAX_SPARE_SIZE_PER_SECTOR),
        })
    }

    pub fn ecc_enabled(&self) -> bool {
        self.corr_cap != 0
    }

    /// Strength reported to the NAND core, also the bitflip budget for erased pages.
    /// Without ECC this is 2.
    pub fn strength(&self) -> u32 {
        if self.ecc_enabled() {
            self.corr_cap
        } else {
            2
        }
    }

    /// Value of ECC_CONFIG_0's correction strength field
    pub fn corr_strength_code(&self) -> u32 {
        (self.corr_cap / 8).saturating_sub(1)
    }

    /// User-visible free OOB region as (offset, length)
    pub fn oob_free(&self) -> (u32, u32) {
        (2, self.unused_spare.saturating_sub(2))
    }
}

/// Which part of a page a CDMA transfer moves
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TransferKind {
    /// Last ECC sector plus user spare, ECC protected
    Spare,
    /// Whole main area plus user spare
    MainSpare,
    /// User spare bytes only, for an ECC-less retry of `Spare`
    RawSpare,
    /// Main area only
    Main,
    /// The spare bytes that follow ECC-protected main data on zero-overhead pages
    RawZosSpare,
}

/// TRAN_CFG_0/1 contents for one transfer kind
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TransferConfig {
    pub offset: u32,
    pub sector_count: u32,
    pub sector_size: u32,
    pub last_sector_size: u32,
}

impl TransferKind {
    pub fn config(self, g: &PageGeometry) -> TransferConfig {
        // start of the last sector once the check bits of the preceding ones are counted
        let last_sector_offset = || {
            let preceding = g.main_size - g.sector_size;
            preceding + g.ecc_bytes * (preceding / g.sector_size)
        };

        match self {
            Self::Spare => TransferConfig {
                offset: last_sector_offset(),
                sector_count: 1,
                sector_size: 0,
                last_sector_size: g.sector_size + g.unused_spare,
            },
            Self::MainSpare => TransferConfig {
                offset: 0,
                sector_count: g.sector_count,
                sector_size: g.sector_size,
                last_sector_size: g.sector_size + g.unused_spare,
            },
            Self::RawSpare => TransferConfig {
                offset: last_sector_offset(),
                sector_count: 1,
                sector_size: 0,
                last_sector_size: g.unused_spare,
            },
            Self::Main => TransferConfig {
                offset: 0,
                sector_count: g.sector_count,
                sector_size: g.sector_size,
                last_sector_size: g.sector_size,
            },
            Self::RawZosSpare => TransferConfig {
                offset: g.main_size + g.ecc_bytes * g.sector_count,
                sector_count: 1,
                sector_size: 0,
                last_sector_size: g.unused_spare,
            },
        }
    }
}

impl TransferConfig {
    pub fn tran_cfg_0(&self) -> u32 {
        regs::TRAN_CFG_0_OFFSET.put(self.offset) | regs::TRAN_CFG_0_SEC_CNT.put(self.sector_count)
    }

    pub fn tran_cfg_1(&self) -> u32 {
        regs::TRAN_CFG_1_LAST_SEC_SIZE.put(self.last_sector_size)
            | regs::TRAN_CFG_1_SECTOR_SIZE.put(self.sector_size)
    }

    pub fn from_registers(cfg0: u32, cfg1: u32) -> Self {
        Self {
            offset: regs::TRAN_CFG_0_OFFSET.get(cfg0),
            sector_count: regs::TRAN_CFG_0_SEC_CNT.get(cfg0),
            sector_size: regs::TRAN_CFG_1_SECTOR_SIZE.get(cfg1),
            last_sector_size: regs::TRAN_CFG_1_LAST_SEC_SIZE.get(cfg1),
        }
    }

    /// Bytes moved between the page buffer and the flash
    pub fn byte_count(&self) -> u32 {
        self.sector_count.saturating_sub(1) * self.sector_size + self.last_sector_size
    }
}

#[cfg(test)]
const TEST_BCH: BchConfig = BchConfig {
    corr_caps: [2, 4, 8, 16, 24, 32, 0, 0],
    sector_sizes: [512, 1024],
};

#[test]
fn test_bch_from_registers() {
    let bch = BchConfig::from_registers(0x1008_0402, 0x0000_2018, 0x0400_0200);
    assert_eq!(bch, TEST_BCH);
}

#[test]
fn test_ecc_bytes() {
    // mult 14 for a 1024-byte maximum sector: 2 * ceil(14 * 8 / 16)
    assert_eq!(TEST_BCH.ecc_bytes(1024, 8).unwrap(), 14);
    assert_eq!(TEST_BCH.ecc_bytes(512, 24).unwrap(), 42);
    assert!(matches!(
        TEST_BCH.ecc_bytes(2048, 8),
        Err(Error::UnsupportedEcc(_))
    ));
    assert!(matches!(
        TEST_BCH.ecc_bytes(1024, 12),
        Err(Error::UnsupportedEcc(_))
    ));
}

#[test]
fn test_page_geometry_with_ecc() {
    let g = PageGeometry::new(4096, 224, &TEST_BCH, 1024, 8).unwrap();
    assert_eq!(g.sector_count, 4);
    assert_eq!(g.ecc_bytes, 14);
    assert_eq!(g.unused_spare, 32);
    assert_eq!(g.corr_strength_code(), 0);
    assert_eq!(g.oob_free(), (2, 30));
}

#[test]
fn test_page_geometry_falls_back_without_ecc() {
    let g = PageGeometry::new(4096, 224, &TEST_BCH, 1024, 12).unwrap();
    assert!(!g.ecc_enabled());
    assert_eq!(g.sector_count, 1);
    assert_eq!(g.sector_size, 4096);
    assert_eq!(g.strength(), 2);
}

#[test]
fn test_page_geometry_spare_too_small() {
    // 8 sectors * 42 bytes do not fit in 224 - 4
    let err = PageGeometry::new(4096, 224, &TEST_BCH, 512, 24).unwrap_err();
    assert!(matches!(err, Error::SpareTooSmall { required: 336, .. }));
}

#[test]
fn test_transfer_table() {
    let g = PageGeometry::new(4096, 224, &TEST_BCH, 1024, 8).unwrap();

    let spare = TransferKind::Spare.config(&g);
    assert_eq!(spare.offset, 3072 + 3 * 14);
    assert_eq!((spare.sector_count, spare.last_sector_size), (1, 1024 + 32));

    let main_spare = TransferKind::MainSpare.config(&g);
    assert_eq!(main_spare.offset, 0);
    assert_eq!(main_spare.byte_count(), 4096 + 32);

    let raw_spare = TransferKind::RawSpare.config(&g);
    assert_eq!(raw_spare.offset, spare.offset);
    assert_eq!(raw_spare.byte_count(), 32);

    assert_eq!(TransferKind::Main.config(&g).byte_count(), 4096);

    let zos = TransferKind::RawZosSpare.config(&g);
    assert_eq!(zos.offset, 4096 + 4 * 14);
    assert_eq!(zos.byte_count(), 32);

    let reg0 = main_spare.tran_cfg_0();
    let reg1 = main_spare.tran_cfg_1();
    assert_eq!(TransferConfig::from_registers(reg0, reg1), main_spare);
}
