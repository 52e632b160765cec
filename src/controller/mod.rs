//! The HPNFC driver proper: one [`Controller`] per controller instance, owning everything the
//! kernel driver kept in its per-device state.
//!
//! Probing resets and initializes the controller, identifies the attached chips, sizes the ECC
//! sectors and switches the interface to the fastest mode both sides support. After that the
//! controller serves the page callbacks of [`EccOps`](crate::nand::EccOps) and the byte-stream
//! interface of [`LegacyOps`](crate::nand::LegacyOps). Dropping it disables interrupts and
//! releases the IRQ, the DMA buffers and the clocks.

use std::sync::{Arc, Weak};
use std::time::Duration;

use deku::DekuContainerWrite;

use crate::config::DeviceConfig;
use crate::descriptor::{
    CdmaDescriptor, CommandKind, DescriptorStatus, Outcome, CS_COMP, CS_FAIL, DESCRIPTOR_SIZE,
    STATUS_OFFSET,
};
use crate::geometry::{BchConfig, PageGeometry, TransferKind};
use crate::nand::{EccStats, NandLayout};
use crate::onfi::{ChipGeometry, OnfiParamPage};
use crate::platform::{DmaBuffer, DmaDirection, IrqReturn, Platform};
use crate::poll::{poll_until, SystemClock};
use crate::randomizer::Randomizer;
use crate::regs::{self, RegisterMap};
use crate::sync::{IrqContext, IrqStatus};
use crate::{Error, Result};

mod init;
mod legacy;
mod transfer;

#[cfg(test)]
mod test;

pub use init::{KnownChip, PhySettings, WorkMode, KNOWN_CHIPS};

/// Clocks enabled at probe when the platform has them
const CLOCKS: [&str; 3] = ["core", "ecc", "sys"];

/// Reset lines pulsed once at probe
const RESETS: [&str; 2] = ["host", "reg"];

/// What DEV_PARAMS_0 says the controller found on the bus
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub enum DeviceType {
    Onfi,
    Jedec,
    #[default]
    Unknown,
}

impl DeviceType {
    fn from_register(dev_params_0: u32) -> Self {
        match regs::DEV_PARAMS_0_DEV_TYPE.get(dev_params_0) {
            regs::DEV_TYPE_ONFI => Self::Onfi,
            regs::DEV_TYPE_JEDEC => Self::Jedec,
            _ => Self::Unknown,
        }
    }
}

/// Bytes collected by the legacy byte-stream commands for `read_byte`
#[derive(Debug, Default)]
struct LegacyBuffer {
    buf: bytes::BytesMut,
    head: usize,
    /// Column for the next `read_buf`
    offset: u32,
}

/// A probed HPNFC controller
pub struct Controller<P: Platform> {
    hw: Arc<P>,
    irq: Arc<IrqContext>,
    config: DeviceConfig,
    map: RegisterMap,

    chip_nr: u8,
    devnum: u8,
    dev_type: DeviceType,
    /// Bytes per slave DMA access
    dma_width: usize,
    bch: BchConfig,
    id: [u8; 8],
    onfi: Option<OnfiParamPage>,
    chip: ChipGeometry,
    geometry: PageGeometry,
    work_mode: (WorkMode, u8),
    zos_page_end: u32,
    curr_transfer: Option<TransferKind>,
    randomizer: Randomizer,

    desc: Option<DmaBuffer>,
    scratch: Option<DmaBuffer>,
    legacy: LegacyBuffer,
    stats: EccStats,

    clocks: Vec<&'static str>,
    irq_installed: bool,
}

impl<P: Platform> Controller<P> {
    /// Bring up the controller on `hw` and identify the chips behind it
    pub fn probe(hw: Arc<P>, config: DeviceConfig) -> Result<Self> {
        for name in RESETS {
            hw.pulse_reset(name)?;
        }
        let clocks = CLOCKS
            .into_iter()
            .filter(|name| hw.enable_clock(name))
            .collect();

        let mut this = Self {
            irq: Arc::new(IrqContext::new()),
            map: config.layout.map(),
            config,
            chip_nr: 0,
            devnum: 0,
            dev_type: DeviceType::Unknown,
            dma_width: 4,
            bch: BchConfig::default(),
            id: [0; 8],
            onfi: None,
            chip: ChipGeometry::default(),
            geometry: PageGeometry::default(),
            work_mode: (WorkMode::Async, 0),
            zos_page_end: 0,
            curr_transfer: None,
            randomizer: Randomizer::disabled(),
            desc: None,
            scratch: None,
            legacy: LegacyBuffer::default(),
            stats: EccStats::default(),
            clocks,
            irq_installed: false,
            hw,
        };

        // on error, dropping `this` undoes whatever was set up so far
        this.init()?;
        Ok(this)
    }

    fn init(&mut self) -> Result<()> {
        self.desc = Some(DmaBuffer::new(&*self.hw, DESCRIPTOR_SIZE)?);

        let weak: Weak<P> = Arc::downgrade(&self.hw);
        let irq = Arc::clone(&self.irq);
        self.hw.request_irq(Arc::new(move || match weak.upgrade() {
            Some(hw) => irq.handle(&*hw),
            None => IrqReturn::None,
        }))?;
        self.irq_installed = true;

        self.hw_init()?;
        self.read_dma_data_width();
        self.read_bch_config();

        if let Err(e) = self.set_work_mode(WorkMode::Async, 0) {
            log::warn!("Could not select asynchronous mode before scanning: {e}");
        }

        log::info!("Start scanning...");
        if let Err(e) = self.scan() {
            log::warn!("nand_scan failed ({e}). Try again");
            self.write(self.map.async_toggle_timings, 0x1818_1818);
            if let Err(e) = self.scan() {
                log::warn!("nand_scan failed");
                return Err(e);
            }
        }
        log::info!("Scanning finished.");

        self.zos_page_end = self.config.zos_page_end(self.chip.page_shift());
        self.dev_info();

        let physical = (self.chip.page_size + self.chip.spare_size) as usize;
        self.scratch = Some(DmaBuffer::new(&*self.hw, physical)?);

        let (step, strength) = match (self.config.ecc, self.chip.ecc_bits) {
            (Some(ecc), _) => (ecc.step_size, ecc.strength),
            (None, bits) if bits != 0 => (512, u32::from(bits)),
            (None, _) => (0, 0),
        };
        self.geometry = PageGeometry::new(
            self.chip.page_size,
            self.chip.spare_size,
            &self.bch,
            step,
            strength,
        )?;
        self.write(regs::ECC_CONFIG_1, 0);

        log::info!(
            "writesize {}, oobsize {}, erasesize {:#x}, size {:#x}",
            self.writesize(),
            self.oobsize(),
            self.erasesize(),
            u64::from(self.erasesize()) * u64::from(self.chip.blocks) * u64::from(self.devnum),
        );

        self.randomizer = if self.config.randomizer {
            Randomizer::new(
                self.erasesize(),
                self.writesize(),
                self.oobsize(),
                Randomizer::default_table(),
                self.zos_page_end,
            )?
        } else {
            Randomizer::disabled()
        };

        if !self.config.params.disable_ddr {
            let (mode, timing) = self.check_best_mode();
            self.set_work_mode(mode, timing)
                .map_err(|e| Error::io(format!("cannot switch to {mode:?} mode: {e}")))?;
            self.work_mode = (mode, timing);
        }

        self.config_phy_timing()
            .map_err(|e| Error::io(format!("PHY timing setup failed: {e}")))?;

        Ok(())
    }

    /// Disable every interrupt cause but leave the global enable set
    fn irq_cleanup(&self) {
        self.write(regs::INTR_ENABLE, regs::INTR_ENABLE_INTR_EN);
    }

    pub(crate) fn read(&self, offset: u32) -> u32 {
        self.hw.read_reg(offset)
    }

    pub(crate) fn write(&self, offset: u32, value: u32) {
        self.hw.write_reg(offset, value)
    }

    /// Busy-wait on `condition` with the configured poll interval
    fn poll<T>(
        &self,
        timeout: Duration,
        what: &'static str,
        condition: impl FnMut() -> Option<T>,
    ) -> Result<T> {
        poll_until(
            &SystemClock,
            timeout,
            self.config.timeouts.poll_interval,
            what,
            condition,
        )
    }

    fn wait_for_thread(&self, thread: u8) -> Result<()> {
        self.poll(self.config.timeouts.poll, "thread ready", || {
            (self.read(regs::TRD_STATUS) & (1 << thread) == 0).then_some(())
        })
    }

    fn wait_for_rb_ready(&self) -> Result<()> {
        let chip = self.chip_nr;
        self.poll(self.config.timeouts.poll, "flash device ready", || {
            ((self.read(self.map.rbn_settings) >> chip) & 1 != 0).then_some(())
        })
    }

    fn wait_for_idle(&self) -> Result<()> {
        self.poll(self.config.timeouts.poll, "controller idle", || {
            (self.read(regs::CTRL_STATUS) & regs::CTRL_STATUS_CTRL_BUSY == 0).then_some(())
        })
    }

    fn wait_for_init_complete(&self) -> Result<()> {
        self.poll(
            self.config.timeouts.init_complete,
            "controller init complete",
            || (self.read(regs::CTRL_STATUS) & regs::CTRL_STATUS_INIT_COMP != 0).then_some(()),
        )
    }

    /// Block until one of the interrupt causes in `mask` fires
    fn wait_for_irq(&self, mask: &IrqStatus) -> IrqStatus {
        self.irq.wait(mask, self.config.timeouts.irq)
    }

    /// Fill the descriptor for `kind` on the selected chip and hand it to the controller
    fn prepare_descriptor(&mut self, kind: CommandKind, page: u32, memory: u64) -> Result<()> {
        let bytes = CdmaDescriptor::new(kind, self.chip_nr, page, memory).to_bytes()?;
        let desc = self
            .desc
            .as_mut()
            .ok_or_else(|| Error::Dma("descriptor is not mapped".into()))?;
        desc.as_mut_slice().copy_from_slice(&bytes);
        desc.sync_for_device(&*self.hw, DmaDirection::Bidirectional);
        self.hw.write_barrier();
        Ok(())
    }

    /// Start the descriptor on `thread`
    fn cdma_send(&self, thread: u8) -> Result<()> {
        let addr = self
            .desc
            .as_ref()
            .map(DmaBuffer::bus_addr)
            .ok_or_else(|| Error::Dma("descriptor is not mapped".into()))?;

        self.wait_for_thread(thread)?;
        self.write(regs::CMD_REG2, addr as u32);
        self.write(regs::CMD_REG3, (addr >> 32) as u32);
        self.write(regs::CMD_REG0, crate::command::cdma_trigger(thread));
        Ok(())
    }

    fn cdma_send_and_wait(&self, thread: u8) -> Result<()> {
        self.cdma_send(thread)?;

        let mask = IrqStatus {
            status: regs::INTR_CDMA_TERR,
            trd_status: 1 << thread,
            trd_error: 1 << thread,
        };
        let status = self.wait_for_irq(&mask);

        if status.is_empty() {
            log::error!("CDMA command timeout");
            return Err(Error::Timeout("CDMA command"));
        }
        if status.status & mask.status != 0 {
            log::error!("CDMA command failed");
            return Err(Error::io("CDMA command failed"));
        }
        Ok(())
    }

    /// Read back the descriptor status once the controller has finished with it
    fn wait_cdma_finish(&mut self) -> Result<Outcome> {
        let hw = &*self.hw;
        let desc = self
            .desc
            .as_mut()
            .ok_or_else(|| Error::Dma("descriptor is not mapped".into()))?;

        poll_until(
            &SystemClock,
            self.config.timeouts.poll,
            self.config.timeouts.poll_interval,
            "CDMA descriptor",
            || {
                desc.sync_for_cpu(hw, DmaDirection::Bidirectional);
                let mut word = [0u8; 4];
                word.copy_from_slice(&desc.as_slice()[STATUS_OFFSET..STATUS_OFFSET + 4]);
                let status = DescriptorStatus(u32::from_le_bytes(word));

                if status.0 & CS_FAIL != 0 {
                    log::error!("CDMA error {:#x}", status.0);
                    Some(status.outcome())
                } else if status.0 & CS_COMP != 0 {
                    Some(status.outcome())
                } else {
                    None
                }
            },
        )
    }

    pub fn platform(&self) -> &Arc<P> {
        &self.hw
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    /// The ECC sector layout chosen at probe
    pub fn geometry(&self) -> &PageGeometry {
        &self.geometry
    }

    pub fn chip_geometry(&self) -> &ChipGeometry {
        &self.chip
    }

    /// Chip layout as a `NandLayout`, with the spare area the NAND core sees
    pub fn layout(&self) -> NandLayout {
        NandLayout {
            spare_per_page: self.oobsize() as usize,
            ..self.chip.layout()
        }
    }

    pub fn writesize(&self) -> u32 {
        self.geometry.main_size
    }

    /// Spare bytes visible to the NAND core; the rest holds check bits
    pub fn oobsize(&self) -> u32 {
        self.geometry.unused_spare
    }

    pub fn erasesize(&self) -> u32 {
        self.chip.erase_size()
    }

    pub fn page_count(&self) -> u32 {
        self.chip.page_count()
    }

    pub fn device_count(&self) -> u8 {
        self.devnum
    }

    pub fn device_type(&self) -> DeviceType {
        self.dev_type
    }

    pub fn id(&self) -> [u8; 8] {
        self.id
    }

    pub fn onfi(&self) -> Option<&OnfiParamPage> {
        self.onfi.as_ref()
    }

    pub fn dma_width(&self) -> usize {
        self.dma_width
    }

    pub fn bch(&self) -> &BchConfig {
        &self.bch
    }

    /// Interface mode and timing mode selected at probe
    pub fn work_mode(&self) -> (WorkMode, u8) {
        self.work_mode
    }

    pub fn zos_page_end(&self) -> u32 {
        self.zos_page_end
    }

    pub fn randomizer(&self) -> &Randomizer {
        &self.randomizer
    }

    pub fn selected_chip(&self) -> u8 {
        self.chip_nr
    }
}

impl<P: Platform> Drop for Controller<P> {
    fn drop(&mut self) {
        self.irq_cleanup();
        if self.irq_installed {
            self.hw.free_irq();
        }
        if let Some(buf) = self.scratch.take() {
            buf.unmap(&*self.hw);
        }
        if let Some(buf) = self.desc.take() {
            buf.unmap(&*self.hw);
        }
        for name in self.clocks.drain(..) {
            self.hw.disable_clock(name);
        }
    }
}
