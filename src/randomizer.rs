//! Page data randomizer.
//!
//! Pages below the zero-overhead-storage boundary are XORed with a slice of a fixed pseudo-random
//! table before programming, which breaks up long runs of identical bits that some cells handle
//! poorly. Applying the transform twice restores the original bytes, so the same call is used on
//! the write and the read path.
//!
//! With the `randomizer` cargo feature disabled every entry point does nothing.

use crate::{Error, Result};

/// Length of the pseudo-random table
pub const RANDOM_DATA_LENGTH: usize = 4096;

/// Seed of the PRBS15 generator filling the default table
const PRBS_SEED: u16 = 0x576A;

/// Odd, so that consecutive pages in a block start at distinct table offsets
const PAGE_STRIDE: usize = 97;

#[derive(Debug, Clone)]
pub struct Randomizer {
    data: Vec<u8>,
    mask: usize,
    page_in_block_mask: u32,
    erasesize: u32,
    writesize: u32,
    oobsize: u32,
    page_start: u32,
}

impl Randomizer {
    /// Build a randomizer active for pages below `page_start`, validating the geometry
    /// against the length of `data`.
    pub fn new(
        erasesize: u32,
        writesize: u32,
        oobsize: u32,
        data: Vec<u8>,
        page_start: u32,
    ) -> Result<Self> {
        let length = data.len();
        if length == 0 || !length.is_power_of_two() {
            return Err(Error::invalid(format!(
                "random table length {length} is not a power of two"
            )));
        }
        if writesize == 0 || erasesize == 0 || erasesize % writesize != 0 {
            return Err(Error::invalid(format!(
                "erase size {erasesize} is not a multiple of page size {writesize}"
            )));
        }
        let pages_per_block = erasesize / writesize;
        if !pages_per_block.is_power_of_two() || pages_per_block as usize > length {
            return Err(Error::invalid(format!(
                "{pages_per_block} pages per block do not fit a {length} byte table"
            )));
        }
        if oobsize as usize > length {
            return Err(Error::invalid(format!(
                "spare size {oobsize} exceeds the {length} byte table"
            )));
        }

        Ok(Self {
            data,
            mask: length - 1,
            page_in_block_mask: pages_per_block - 1,
            erasesize,
            writesize,
            oobsize,
            page_start,
        })
    }

    /// A randomizer that never touches anything
    pub fn disabled() -> Self {
        Self {
            data: vec![0],
            mask: 0,
            page_in_block_mask: 0,
            erasesize: 0,
            writesize: 0,
            oobsize: 0,
            page_start: 0,
        }
    }

    /// The table used unless the platform supplies its own: a PRBS15 (x^15 + x^14 + 1) stream
    pub fn default_table() -> Vec<u8> {
        let mut lfsr = PRBS_SEED;
        (0..RANDOM_DATA_LENGTH)
            .map(|_| {
                let mut byte = 0u8;
                for _ in 0..8 {
                    let feedback = ((lfsr >> 14) ^ (lfsr >> 13)) & 1;
                    lfsr = ((lfsr << 1) | feedback) & 0x7FFF;
                    byte = (byte << 1) | feedback as u8;
                }
                byte
            })
            .collect()
    }

    /// Does `page` get randomized at all?
    pub fn applies_to(&self, page: u32) -> bool {
        cfg!(feature = "randomizer") && page < self.page_start
    }

    pub fn erasesize(&self) -> u32 {
        self.erasesize
    }

    /// XOR the main area `dat` and/or spare area `oob` of `page` with its key stream.
    ///
    /// The spare area continues the stream where the main area left off, so randomizing the
    /// two separately gives the same result as doing both in one call.
    pub fn randomize_page(&self, page: u32, dat: Option<&mut [u8]>, oob: Option<&mut [u8]>) {
        if !self.applies_to(page) {
            return;
        }

        let start = ((page & self.page_in_block_mask) as usize).wrapping_mul(PAGE_STRIDE);
        if let Some(dat) = dat {
            let len = dat.len().min(self.writesize as usize);
            self.xor(start, &mut dat[..len]);
        }
        if let Some(oob) = oob {
            let len = oob.len().min(self.oobsize as usize);
            self.xor(start + self.writesize as usize, &mut oob[..len]);
        }
    }

    fn xor(&self, start: usize, buf: &mut [u8]) {
        for (i, b) in buf.iter_mut().enumerate() {
            *b ^= self.data[(start + i) & self.mask];
        }
    }
}

#[cfg(test)]
fn test_randomizer() -> Randomizer {
    Randomizer::new(64 * 2048, 2048, 64, Randomizer::default_table(), 128).unwrap()
}

#[test]
fn test_randomizer_rejects_bad_geometry() {
    let table = Randomizer::default_table();
    assert!(Randomizer::new(3000, 2048, 64, table.clone(), 1).is_err());
    assert!(Randomizer::new(2048 * 64, 2048, 64, vec![0; 1000], 1).is_err());
    assert!(Randomizer::new(2048 * 8192, 2048, 64, table.clone(), 1).is_err());
    assert!(Randomizer::new(2048 * 64, 2048, 8192, table, 1).is_err());
}

#[test]
fn test_default_table_is_not_trivial() {
    let table = Randomizer::default_table();
    assert_eq!(table.len(), RANDOM_DATA_LENGTH);
    let ones: u32 = table.iter().map(|b| b.count_ones()).sum();
    let bits = RANDOM_DATA_LENGTH as u32 * 8;
    assert!(ones > bits * 45 / 100 && ones < bits * 55 / 100);
}

#[test]
#[cfg(feature = "randomizer")]
fn test_randomize_is_an_involution() {
    let r = test_randomizer();
    let original: Vec<u8> = (0..2048u32).map(|i| (i * 7) as u8).collect();
    let oob_original = vec![0x5Au8; 64];

    let mut data = original.clone();
    let mut oob = oob_original.clone();
    r.randomize_page(5, Some(&mut data), Some(&mut oob));
    assert_ne!(data, original);
    assert_ne!(oob, oob_original);

    r.randomize_page(5, Some(&mut data), None);
    r.randomize_page(5, None, Some(&mut oob));
    assert_eq!(data, original);
    assert_eq!(oob, oob_original);
}

#[test]
#[cfg(feature = "randomizer")]
fn test_randomize_keyed_by_page() {
    let r = test_randomizer();
    let mut a = vec![0u8; 2048];
    let mut b = vec![0u8; 2048];
    r.randomize_page(1, Some(&mut a), None);
    r.randomize_page(2, Some(&mut b), None);
    assert_ne!(a, b);
}

#[test]
fn test_randomize_skips_pages_at_boundary() {
    let r = test_randomizer();
    let mut data = vec![0x11u8; 2048];
    r.randomize_page(128, Some(&mut data), None);
    r.randomize_page(4000, Some(&mut data), None);
    assert!(data.iter().all(|&b| b == 0x11));

    let mut data = vec![0x11u8; 16];
    Randomizer::disabled().randomize_page(0, Some(&mut data), None);
    assert!(data.iter().all(|&b| b == 0x11));
}
