//! Page, spare and erase operations through CDMA descriptors and the scratch page buffer.
//!
//! Pages below the zero-overhead boundary carry no ECC parity in the spare area: their main
//! data moves on its own and the user spare is read and written raw right behind the check
//! bits. All other pages move main data and user spare together in the last ECC sector.

use super::Controller;
use crate::descriptor::{CommandKind, Outcome};
use crate::geometry::TransferKind;
use crate::nand::{EccOps, EccStats, PageUtil};
use crate::platform::{DmaBuffer, DmaDirection, Platform};
use crate::regs;
use crate::{Error, Result};

fn scratch(buf: &mut Option<DmaBuffer>) -> Result<&mut [u8]> {
    buf.as_mut()
        .map(DmaBuffer::as_mut_slice)
        .ok_or_else(|| Error::Dma("page buffer is not mapped".into()))
}

fn check_len(what: &str, len: usize, needed: u32) -> Result<()> {
    if len < needed as usize {
        return Err(Error::invalid(format!(
            "{what} buffer of {len} bytes, need {needed}"
        )));
    }
    Ok(())
}

impl<P: Platform> Controller<P> {
    /// Program TRAN_CFG_0/1 for `kind` unless the last transfer already used it
    fn prepare_data_size(&mut self, kind: TransferKind) -> Result<()> {
        if self.curr_transfer == Some(kind) {
            return Ok(());
        }

        let cfg = kind.config(&self.geometry);
        if cfg.offset > 0xFFFF || cfg.sector_count > 0xFF || cfg.last_sector_size > 0xFFFF {
            return Err(Error::invalid(format!(
                "{kind:?} transfer {cfg:?} does not fit the transfer registers"
            )));
        }

        self.write(regs::TRAN_CFG_0, cfg.tran_cfg_0());
        self.write(regs::TRAN_CFG_1, cfg.tran_cfg_1());
        self.curr_transfer = Some(kind);
        Ok(())
    }

    fn ecc_config(&self, ecc: bool, erase_detect: bool) {
        let mut reg = 0;
        if ecc {
            reg |= regs::ECC_CONFIG_0_CORR_STR.put(self.geometry.corr_strength_code())
                | regs::ECC_CONFIG_0_ECC_EN;
        }
        if erase_detect {
            reg |= regs::ECC_CONFIG_0_ERASE_DET_EN;
        }
        self.write(regs::ECC_CONFIG_0, reg);
    }

    /// Erased pages are only recognized outside the zero-overhead area
    fn ecc_check_config(&self, with_ecc: bool, page: u32) {
        self.ecc_config(
            with_ecc && self.geometry.ecc_enabled(),
            page >= self.zos_page_end,
        );
    }

    fn scratch_addr(&self) -> Result<u64> {
        self.scratch
            .as_ref()
            .map(DmaBuffer::bus_addr)
            .ok_or_else(|| Error::Dma("page buffer is not mapped".into()))
    }

    /// Run one CDMA command against the scratch buffer and return its outcome
    fn cdma_transfer(&mut self, kind: CommandKind, page: u32, with_ecc: bool) -> Result<Outcome> {
        self.ecc_check_config(with_ecc, page);

        let addr = self.scratch_addr()?;
        if let (CommandKind::Write, Some(buf)) = (kind, &self.scratch) {
            buf.sync_for_device(&*self.hw, DmaDirection::ToDevice);
        }

        self.prepare_descriptor(kind, page, addr)?;
        self.cdma_send_and_wait(self.chip_nr)?;
        let outcome = self.wait_cdma_finish()?;

        if let (CommandKind::Read, Some(buf)) = (kind, self.scratch.as_mut()) {
            buf.sync_for_cpu(&*self.hw, DmaDirection::FromDevice);
        }
        Ok(outcome)
    }

    fn cdma_write_data(&mut self, page: u32, with_ecc: bool) -> Result<()> {
        match self.cdma_transfer(CommandKind::Write, page, with_ecc)? {
            Outcome::Ok => Ok(()),
            outcome => {
                log::error!("CDMA write operation failed on page {page}: {outcome:?}");
                Err(Error::io(format!("program of page {page} failed")))
            }
        }
    }

    fn cdma_read_data(&mut self, page: u32, with_ecc: bool) -> Result<Outcome> {
        self.cdma_transfer(CommandKind::Read, page, with_ecc)
    }

    /// Re-read the current transfer without ECC; only a clean transfer is usable
    fn cdma_read_raw_retry(&mut self, page: u32) -> Result<()> {
        match self.cdma_read_data(page, false)? {
            Outcome::Ok => Ok(()),
            outcome => {
                log::error!("raw re-read of page {page} failed: {outcome:?}");
                Err(Error::io(format!("raw read of page {page} failed")))
            }
        }
    }

    fn main_transfer(&self, page: u32) -> TransferKind {
        if page < self.zos_page_end {
            TransferKind::Main
        } else {
            TransferKind::MainSpare
        }
    }

    /// Copy the main area and user spare out of the scratch buffer
    fn copy_from_scratch(&mut self, buf: &mut [u8], oob: Option<&mut [u8]>) -> Result<()> {
        let main = self.writesize() as usize;
        let spare = self.oobsize() as usize;
        let data = scratch(&mut self.scratch)?;

        buf[..main].copy_from_slice(&data[..main]);
        if let Some(oob) = oob {
            oob[..spare].copy_from_slice(&data[main..main + spare]);
        }
        Ok(())
    }

    fn write_page_data(
        &mut self,
        buf: &[u8],
        oob: Option<&[u8]>,
        page: u32,
        with_ecc: bool,
    ) -> Result<()> {
        let main = self.writesize() as usize;
        let spare = self.oobsize() as usize;
        check_len("page", buf.len(), self.writesize())?;
        if let Some(oob) = oob {
            check_len("spare", oob.len(), self.oobsize())?;
        }

        {
            let data = scratch(&mut self.scratch)?;
            let (dat, rest) = data.split_at_mut(main);
            dat.copy_from_slice(&buf[..main]);
            let spare_area = &mut rest[..spare];
            match oob {
                Some(oob) => {
                    spare_area.copy_from_slice(&oob[..spare]);
                    self.randomizer
                        .randomize_page(page, Some(dat), Some(spare_area));
                }
                None => {
                    spare_area.fill(0xFF);
                    self.randomizer.randomize_page(page, Some(dat), None);
                }
            }
        }

        self.prepare_data_size(self.main_transfer(page))?;
        self.cdma_write_data(page, with_ecc)?;

        match oob {
            Some(oob) if page < self.zos_page_end => self.write_zos_oob(oob, page),
            _ => Ok(()),
        }
    }

    /// Spare bytes of a zero-overhead page, written raw behind the check bits
    fn write_zos_oob(&mut self, oob: &[u8], page: u32) -> Result<()> {
        let spare = self.oobsize() as usize;
        {
            let data = scratch(&mut self.scratch)?;
            data[..spare].copy_from_slice(&oob[..spare]);
            self.randomizer
                .randomize_page(page, None, Some(&mut data[..spare]));
        }

        self.prepare_data_size(TransferKind::RawZosSpare)?;
        self.cdma_write_data(page, false)
    }

    /// Spare bytes of a zero-overhead page; `erased` comes from the main area, since the raw
    /// spare carries no marker of its own
    fn read_zos_oob(&mut self, oob: &mut [u8], page: u32, erased: bool) -> Result<()> {
        let spare = self.oobsize() as usize;
        self.prepare_data_size(TransferKind::RawZosSpare)?;

        match self.cdma_read_data(page, false)? {
            Outcome::Erased => oob[..spare].fill(0xFF),
            Outcome::Ok | Outcome::Corrected(_) | Outcome::Uncorrectable => {
                let data = scratch(&mut self.scratch)?;
                oob[..spare].copy_from_slice(&data[..spare]);
                if !erased {
                    self.randomizer
                        .randomize_page(page, None, Some(&mut oob[..spare]));
                }
            }
            Outcome::Fail => {
                log::error!("CDMA read operation failed on page {page}");
                return Err(Error::io(format!("spare read of page {page} failed")));
            }
        }
        Ok(())
    }

    /// Has the main area of a zero-overhead page never been programmed?
    fn zos_main_erased(&mut self, page: u32) -> Result<bool> {
        let kind = TransferKind::Main;
        self.prepare_data_size(kind)?;

        match self.cdma_read_data(page, true)? {
            Outcome::Erased => Ok(true),
            Outcome::Ok | Outcome::Corrected(_) => Ok(false),
            Outcome::Uncorrectable => {
                self.cdma_read_raw_retry(page)?;
                let span = kind.config(&self.geometry).byte_count() as usize;
                let threshold = self.geometry.strength();
                let data = scratch(&mut self.scratch)?;
                let span = span.min(data.len());
                Ok(data[..span].check_erased_chunk(threshold).is_some())
            }
            Outcome::Fail => {
                log::error!("CDMA read operation failed on page {page}");
                Err(Error::io(format!("read of page {page} failed")))
            }
        }
    }

    fn read_oob_data(&mut self, oob: &mut [u8], page: u32) -> Result<()> {
        let spare = self.oobsize() as usize;
        let sector = self.geometry.sector_size as usize;
        self.prepare_data_size(TransferKind::Spare)?;

        match self.cdma_read_data(page, true)? {
            Outcome::Erased => {
                oob[..spare].fill(0xFF);
                return Ok(());
            }
            Outcome::Uncorrectable => {
                // the sector does not check out; take the spare bytes as they are on the chip
                self.prepare_data_size(TransferKind::RawSpare)?;
                self.cdma_read_raw_retry(page)?;
                let data = scratch(&mut self.scratch)?;
                oob[..spare].copy_from_slice(&data[..spare]);
            }
            Outcome::Ok | Outcome::Corrected(_) => {
                let data = scratch(&mut self.scratch)?;
                oob[..spare].copy_from_slice(&data[sector..sector + spare]);
            }
            Outcome::Fail => {
                log::error!("CDMA read operation failed on page {page}");
                return Err(Error::io(format!("spare read of page {page} failed")));
            }
        }

        self.randomizer
            .randomize_page(page, None, Some(&mut oob[..spare]));
        Ok(())
    }

    /// ECC failed on the whole transfer: decide between an erased page with bitflips and
    /// real data loss from a raw copy of the page
    fn recover_erased(
        &mut self,
        buf: &mut [u8],
        oob: Option<&mut [u8]>,
        page: u32,
        kind: TransferKind,
    ) -> Result<Option<u32>> {
        self.cdma_read_raw_retry(page)?;

        let span = kind.config(&self.geometry).byte_count() as usize;
        let threshold = self.geometry.strength();
        let flips = {
            let data = scratch(&mut self.scratch)?;
            let span = span.min(data.len());
            data[..span].check_erased_chunk(threshold)
        };

        match flips {
            Some(_) => {
                buf[..self.writesize() as usize].fill(0xFF);
                if let Some(oob) = oob {
                    oob[..self.oobsize() as usize].fill(0xFF);
                }
            }
            None => self.deliver_page(buf, oob, page)?,
        }
        Ok(flips)
    }

    /// Hand a successfully read page from the scratch buffer to the caller
    fn deliver_page(&mut self, buf: &mut [u8], oob: Option<&mut [u8]>, page: u32) -> Result<()> {
        let main = self.writesize() as usize;
        let spare = self.oobsize() as usize;

        if page < self.zos_page_end {
            self.copy_from_scratch(buf, None)?;
            self.randomizer
                .randomize_page(page, Some(&mut buf[..main]), None);
            if let Some(oob) = oob {
                self.read_zos_oob(oob, page, false)?;
            }
            return Ok(());
        }

        let mut oob = oob;
        self.copy_from_scratch(buf, oob.as_deref_mut())?;
        self.randomizer.randomize_page(
            page,
            Some(&mut buf[..main]),
            oob.map(|oob| &mut oob[..spare]),
        );
        Ok(())
    }
}

impl<P: Platform> EccOps for Controller<P> {
    fn read_page(&mut self, buf: &mut [u8], oob: Option<&mut [u8]>, page: u32) -> Result<u32> {
        check_len("page", buf.len(), self.writesize())?;
        if let Some(oob) = oob.as_deref() {
            check_len("spare", oob.len(), self.oobsize())?;
        }
        let main = self.writesize() as usize;
        let spare = self.oobsize() as usize;

        let kind = self.main_transfer(page);
        self.prepare_data_size(kind)?;

        let bitflips = match self.cdma_read_data(page, true)? {
            Outcome::Erased => {
                buf[..main].fill(0xFF);
                if let Some(oob) = oob {
                    oob[..spare].fill(0xFF);
                }
                return Ok(0);
            }
            Outcome::Uncorrectable => {
                return match self.recover_erased(buf, oob, page, kind)? {
                    Some(flips) => {
                        log::debug!("page {page} is erased with {flips} bitflips");
                        self.stats.corrected += u64::from(flips);
                        Ok(flips)
                    }
                    None => {
                        log::warn!("uncorrectable ECC error on page {page}");
                        self.stats.failed += 1;
                        Err(Error::Uncorrectable(page))
                    }
                };
            }
            Outcome::Corrected(n) => {
                self.stats.corrected += u64::from(n);
                u32::from(n)
            }
            Outcome::Ok => 0,
            Outcome::Fail => {
                log::error!("CDMA read operation failed on page {page}");
                return Err(Error::io(format!("read of page {page} failed")));
            }
        };

        self.deliver_page(buf, oob, page)?;
        Ok(bitflips)
    }

    fn read_page_raw(&mut self, buf: &mut [u8], oob: Option<&mut [u8]>, page: u32) -> Result<()> {
        check_len("page", buf.len(), self.writesize())?;
        if let Some(oob) = oob.as_deref() {
            check_len("spare", oob.len(), self.oobsize())?;
        }
        let main = self.writesize() as usize;
        let spare = self.oobsize() as usize;

        // no ECC on the first erase block
        let with_ecc = page >= self.chip.pages_per_block;
        let kind = self.main_transfer(page);
        self.prepare_data_size(kind)?;

        match self.cdma_read_data(page, with_ecc)? {
            Outcome::Erased => {
                buf[..main].fill(0xFF);
                if let Some(oob) = oob {
                    oob[..spare].fill(0xFF);
                }
            }
            Outcome::Uncorrectable => {
                self.recover_erased(buf, oob, page, kind)?;
            }
            Outcome::Ok | Outcome::Corrected(_) => self.deliver_page(buf, oob, page)?,
            Outcome::Fail => {
                log::error!("CDMA read operation failed on page {page}");
                return Err(Error::io(format!("raw read of page {page} failed")));
            }
        }
        Ok(())
    }

    fn write_page(&mut self, buf: &[u8], oob: Option<&[u8]>, page: u32) -> Result<()> {
        self.write_page_data(buf, oob, page, true)
    }

    fn write_page_raw(&mut self, buf: &[u8], oob: Option<&[u8]>, page: u32) -> Result<()> {
        self.write_page_data(buf, oob, page, false)
    }

    fn read_oob(&mut self, oob: &mut [u8], page: u32) -> Result<()> {
        check_len("spare", oob.len(), self.oobsize())?;
        if page < self.zos_page_end {
            let erased = self.zos_main_erased(page)?;
            self.read_zos_oob(oob, page, erased)
        } else {
            self.read_oob_data(oob, page)
        }
    }

    fn write_oob(&mut self, oob: &[u8], page: u32) -> Result<()> {
        check_len("spare", oob.len(), self.oobsize())?;
        if page < self.zos_page_end {
            return self.write_zos_oob(oob, page);
        }

        let spare = self.oobsize() as usize;
        let sector = self.geometry.sector_size as usize;
        {
            let data = scratch(&mut self.scratch)?;
            data[..sector].fill(0xFF);
            let spare_area = &mut data[sector..sector + spare];
            spare_area.copy_from_slice(&oob[..spare]);
            self.randomizer.randomize_page(page, None, Some(spare_area));
        }

        self.prepare_data_size(TransferKind::Spare)?;
        self.cdma_write_data(page, true)
    }

    fn erase_block(&mut self, page: u32) -> Result<()> {
        self.prepare_descriptor(CommandKind::Erase, page, 0)?;
        self.cdma_send_and_wait(self.chip_nr)?;

        match self.wait_cdma_finish()? {
            Outcome::Ok => Ok(()),
            outcome => {
                log::error!("erase of block at page {page} failed: {outcome:?}");
                Err(Error::io(format!("erase at page {page} failed")))
            }
        }
    }

    fn ecc_stats(&self) -> EccStats {
        self.stats
    }
}
