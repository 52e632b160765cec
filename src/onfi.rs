//! ONFI parameter pages, and the chip geometry taken from them.

use crc::{Algorithm, Crc, CRC_16_UMTS};
use deku::prelude::*;

use crate::nand::NandLayout;

/// ONFI's CRC-16: polynomial 0x8005, MSB first, seeded with "ON"
const ONFI_CRC_ALG: Algorithm<u16> = Algorithm {
    init: 0x4F4E,
    check: 0,
    ..CRC_16_UMTS
};
pub const ONFI_CRC: Crc<u16> = Crc::<u16>::new(&ONFI_CRC_ALG);

pub const ONFI_SIGNATURE: &[u8; 4] = b"ONFI";

/// Size of one copy of the parameter page
pub const PARAM_PAGE_SIZE: usize = 256;

/// Redundant copies the core reads before giving up
pub const PARAM_PAGE_COPIES: usize = 3;

/// The ONFI parameter page, as read from the chip
#[derive(Debug, Clone, PartialEq, Eq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub struct OnfiParamPage {
    pub signature: [u8; 4],
    pub revision: u16,
    pub features: u16,
    pub opt_cmd: u16,
    rsvd0: [u8; 22],

    pub manufacturer: [u8; 12],
    pub model: [u8; 20],
    pub jedec_id: u8,
    pub date_code: u16,
    rsvd1: [u8; 13],

    pub byte_per_page: u32,
    pub spare_bytes_per_page: u16,
    rsvd2: [u8; 6],
    pub pages_per_block: u32,
    pub blocks_per_lun: u32,
    pub lun_count: u8,
    pub addr_cycles: u8,
    pub bits_per_cell: u8,
    pub bb_per_lun: u16,
    pub block_endurance: u16,
    rsvd3: [u8; 5],
    /// Bits of correction required per 512 bytes
    pub ecc_bits: u8,
    rsvd4: [u8; 15],

    rsvd5: u8,
    pub async_timing_mode: u16,
    rsvd6: [u8; 10],
    pub src_sync_timing_mode: u16,
    rsvd7: [u8; 23],

    pub vendor: [u8; 88],
    pub crc: u16,
}

impl Default for OnfiParamPage {
    fn default() -> Self {
        Self {
            signature: *ONFI_SIGNATURE,
            revision: 0,
            features: 0,
            opt_cmd: 0,
            rsvd0: [0; 22],
            manufacturer: [b' '; 12],
            model: [b' '; 20],
            jedec_id: 0,
            date_code: 0,
            rsvd1: [0; 13],
            byte_per_page: 0,
            spare_bytes_per_page: 0,
            rsvd2: [0; 6],
            pages_per_block: 0,
            blocks_per_lun: 0,
            lun_count: 1,
            addr_cycles: 0,
            bits_per_cell: 1,
            bb_per_lun: 0,
            block_endurance: 0,
            rsvd3: [0; 5],
            ecc_bits: 0,
            rsvd4: [0; 15],
            rsvd5: 0,
            async_timing_mode: 1,
            rsvd6: [0; 10],
            src_sync_timing_mode: 0,
            rsvd7: [0; 23],
            vendor: [0; 88],
            crc: 0,
        }
    }
}

impl OnfiParamPage {
    /// A parameter page describing `layout`, with a valid CRC
    pub fn describe(layout: &NandLayout, manufacturer: &str, model: &str, ecc_bits: u8) -> Self {
        let mut page = Self {
            revision: 1 << 1,
            manufacturer: padded(manufacturer),
            model: padded(model),
            byte_per_page: layout.bytes_per_page as u32,
            spare_bytes_per_page: layout.spare_per_page as u16,
            pages_per_block: layout.pages_per_block,
            blocks_per_lun: layout.blocks,
            addr_cycles: 0x23,
            ecc_bits,
            ..Default::default()
        };
        page.fix_crc();
        page
    }

    pub fn compute_crc(&self) -> u16 {
        let bytes = self.to_bytes().unwrap_or_default();
        let covered = bytes.len().saturating_sub(std::mem::size_of::<u16>());
        ONFI_CRC.checksum(&bytes[..covered])
    }

    pub fn check_crc(&self) -> bool {
        self.crc == self.compute_crc()
    }

    pub fn fix_crc(&mut self) {
        self.crc = self.compute_crc();
    }

    /// Parse one 256-byte copy, checking signature and CRC
    pub fn parse(buf: &[u8]) -> Option<Self> {
        let (_, page) = Self::from_bytes((buf, 0)).ok()?;

        if &page.signature != ONFI_SIGNATURE || !page.check_crc() {
            return None;
        }

        Some(page)
    }

    /// The first valid copy among the redundant ones in `buf`
    pub fn parse_redundant(buf: &[u8]) -> Option<Self> {
        buf.chunks_exact(PARAM_PAGE_SIZE)
            .take(PARAM_PAGE_COPIES)
            .enumerate()
            .find_map(|(i, copy)| {
                let page = Self::parse(copy);
                if page.is_none() {
                    log::warn!("ONFI parameter page copy {i} is corrupt");
                }
                page
            })
    }

    pub fn manufacturer(&self) -> String {
        trimmed(&self.manufacturer)
    }

    pub fn model(&self) -> String {
        trimmed(&self.model)
    }

    pub fn geometry(&self) -> ChipGeometry {
        ChipGeometry {
            page_size: self.byte_per_page,
            spare_size: self.spare_bytes_per_page.into(),
            pages_per_block: self.pages_per_block,
            blocks: self.blocks_per_lun * u32::from(self.lun_count.max(1)),
            ecc_bits: self.ecc_bits,
        }
    }
}

fn padded<const N: usize>(s: &str) -> [u8; N] {
    let mut out = [b' '; N];
    let len = s.len().min(N);
    out[..len].copy_from_slice(&s.as_bytes()[..len]);
    out
}

fn trimmed(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).trim_end().to_string()
}

/// Size and organization of one chip
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct ChipGeometry {
    pub page_size: u32,
    pub spare_size: u32,
    pub pages_per_block: u32,
    /// Blocks across all LUNs
    pub blocks: u32,
    /// Correction the chip asks for per 512 bytes, 0 if unknown
    pub ecc_bits: u8,
}

impl ChipGeometry {
    pub fn erase_size(&self) -> u32 {
        self.page_size * self.pages_per_block
    }

    pub fn page_shift(&self) -> u32 {
        self.page_size.trailing_zeros()
    }

    pub fn page_count(&self) -> u32 {
        self.blocks * self.pages_per_block
    }

    pub fn layout(&self) -> NandLayout {
        NandLayout {
            blocks: self.blocks,
            pages_per_block: self.pages_per_block,
            bytes_per_page: self.page_size as usize,
            spare_per_page: self.spare_size as usize,
        }
    }
}

impl From<NandLayout> for ChipGeometry {
    fn from(layout: NandLayout) -> Self {
        Self {
            page_size: layout.bytes_per_page as u32,
            spare_size: layout.spare_per_page as u32,
            pages_per_block: layout.pages_per_block,
            blocks: layout.blocks,
            ecc_bits: 0,
        }
    }
}

#[test]
fn test_onfi_crc_matches_bitwise_reference() {
    // the bit-at-a-time loop NAND cores use
    fn reference(data: &[u8]) -> u16 {
        let mut crc: u16 = 0x4F4E;
        for &byte in data {
            crc ^= u16::from(byte) << 8;
            for _ in 0..8 {
                crc = (crc << 1) ^ if crc & 0x8000 != 0 { 0x8005 } else { 0 };
            }
        }
        crc
    }

    let data: Vec<u8> = (0..254u32).map(|i| (i * 31 + 7) as u8).collect();
    assert_eq!(ONFI_CRC.checksum(&data), reference(&data));
}

#[test]
fn test_param_page_layout() {
    let layout: NandLayout = "2048x64x4096+224".parse().unwrap();
    let page = OnfiParamPage::describe(&layout, "MICRON", "MT29F16G08", 8);
    let bytes = page.to_bytes().unwrap();
    assert_eq!(bytes.len(), PARAM_PAGE_SIZE);
    assert_eq!(&bytes[0..4], b"ONFI");
    assert_eq!(&bytes[32..38], b"MICRON");
    assert_eq!(&bytes[80..84], &4096u32.to_le_bytes());
    assert_eq!(&bytes[84..86], &224u16.to_le_bytes());
    assert_eq!(&bytes[92..96], &64u32.to_le_bytes());
    assert_eq!(&bytes[96..100], &2048u32.to_le_bytes());
    assert_eq!(bytes[112], 8);
    assert_eq!(&bytes[254..256], &page.crc.to_le_bytes());

    let parsed = OnfiParamPage::parse(&bytes).unwrap();
    assert_eq!(parsed.model(), "MT29F16G08");
    assert_eq!(
        parsed.geometry(),
        ChipGeometry {
            ecc_bits: 8,
            ..ChipGeometry::from(layout)
        }
    );
}

#[test]
fn test_redundant_copies() {
    let layout: NandLayout = "1024x64x2048+64".parse().unwrap();
    let good = OnfiParamPage::describe(&layout, "TOSHIBA", "TC58", 4)
        .to_bytes()
        .unwrap();

    let mut buf = good.repeat(PARAM_PAGE_COPIES);
    buf[100] ^= 0x01;
    assert!(OnfiParamPage::parse(&buf[..PARAM_PAGE_SIZE]).is_none());
    let page = OnfiParamPage::parse_redundant(&buf).unwrap();
    assert_eq!(page.geometry().page_size, 2048);

    buf[PARAM_PAGE_SIZE + 100] ^= 0x01;
    buf[2 * PARAM_PAGE_SIZE + 100] ^= 0x01;
    assert!(OnfiParamPage::parse_redundant(&buf).is_none());
}
