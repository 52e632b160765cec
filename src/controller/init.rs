//! Controller bring-up: hardware init, device scan, interface mode selection and PHY timings.

use super::{Controller, DeviceType};
use crate::command::{PioCommand, PioOp};
use crate::geometry::BchConfig;
use crate::onfi::{OnfiParamPage, ONFI_SIGNATURE, PARAM_PAGE_COPIES, PARAM_PAGE_SIZE};
use crate::platform::{AuxWindow, Platform};
use crate::regs::{self, Field};
use crate::{Error, Result};

/// Chip selects the controller can drive
const MAX_CHIPS: u32 = 4;

/// ONFI feature address of the timing mode
const FEATURE_TIMING_MODE: u8 = 0x01;

/// Interface a flash device and the controller talk over
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WorkMode {
    Async,
    NvDdr,
    NvDdr2,
    NvDdr3,
    Toggle,
}

impl WorkMode {
    /// Data interface bits of the ONFI timing mode feature
    pub fn interface(self) -> u8 {
        match self {
            Self::Async => 0,
            Self::NvDdr => 1,
            Self::NvDdr2 | Self::Toggle => 2,
            Self::NvDdr3 => 3,
        }
    }

    /// COMMON_SETT operating mode
    pub fn opr_mode(self) -> u32 {
        match self {
            Self::Async => regs::OPR_MODE_SDR,
            Self::NvDdr => regs::OPR_MODE_NV_DDR,
            Self::NvDdr2 | Self::NvDdr3 | Self::Toggle => regs::OPR_MODE_TOGGLE,
        }
    }

    pub fn phy_settings(self) -> &'static PhySettings {
        match self {
            Self::Async => &PhySettings::ASYNC,
            Self::NvDdr => &PhySettings::DDR,
            Self::NvDdr2 | Self::NvDdr3 => &PhySettings::DDR2,
            Self::Toggle => &PhySettings::TOGGLE,
        }
    }

    /// SET FEATURES value selecting this interface at `timing`
    pub fn feature_value(self, timing: u8) -> u8 {
        timing | (self.interface() << 4)
    }
}

/// Values for the PHY register block, for a 100 MHz flash clock
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PhySettings {
    pub phy_ctrl: u32,
    pub tsel: u32,
    pub dq_timing: u32,
    pub dqs_timing: u32,
    pub gate_lpbk: u32,
    pub dll_master: u32,
    pub dll_slave: u32,
}

impl PhySettings {
    pub const DDR: Self = Self {
        phy_ctrl: 0x0000,
        tsel: 0x00,
        dq_timing: 0x02,
        dqs_timing: 0x0000_0004,
        gate_lpbk: 0x0020_0002,
        dll_master: 0x0114_0004,
        dll_slave: 0x1f1f,
    };

    pub const DDR2: Self = Self {
        phy_ctrl: 0x4000,
        tsel: 0x00,
        dq_timing: 0x02,
        dqs_timing: 0x0000_0005,
        gate_lpbk: 0x0038_0000,
        dll_master: 0x0114_0004,
        dll_slave: 0x1f1f,
    };

    pub const TOGGLE: Self = Self {
        phy_ctrl: 0x4000,
        tsel: 0x00,
        dq_timing: 0x02,
        dqs_timing: 0x0000_0004,
        gate_lpbk: 0x0028_0001,
        dll_master: 0x0114_0004,
        dll_slave: 0x1f1f,
    };

    pub const ASYNC: Self = Self {
        phy_ctrl: 0x4040,
        tsel: 0x00,
        dq_timing: 0x02,
        dqs_timing: 0x0010_0004,
        gate_lpbk: 0x1b << 19,
        dll_master: 0x0080_0000,
        dll_slave: 0x0000,
    };
}

/// Timings for a chip that needs more than the generic values
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct KnownChip {
    pub name: &'static str,
    pub id: [u8; 8],
    pub async_toggle: u32,
    pub timings: [u32; 3],
    pub phy_ctrl: u32,
}

const fn async_toggle(trh: u32, trp: u32, twh: u32, twp: u32) -> u32 {
    regs::ASYNC_TOGGLE_TIMINGS_TRH.put(trh)
        | regs::ASYNC_TOGGLE_TIMINGS_TRP.put(trp)
        | regs::ASYNC_TOGGLE_TIMINGS_TWH.put(twh)
        | regs::ASYNC_TOGGLE_TIMINGS_TWP.put(twp)
}

const fn fields(values: [(Field, u32); 4]) -> u32 {
    values[0].0.put(values[0].1)
        | values[1].0.put(values[1].1)
        | values[2].0.put(values[2].1)
        | values[3].0.put(values[3].1)
}

pub const KNOWN_CHIPS: [KnownChip; 2] = [
    KnownChip {
        name: "TC58NVG2S0H",
        id: [0x98, 0xdc, 0x90, 0x26, 0x76, 0x16, 0x08, 0x00],
        async_toggle: async_toggle(2, 2, 2, 2),
        timings: [
            fields([
                (regs::TIMINGS0_TADL, 1),
                (regs::TIMINGS0_TCCS, 99),
                (regs::TIMINGS0_TWHR, 11),
                (regs::TIMINGS0_TRHW, 5),
            ]),
            fields([
                (regs::TIMINGS1_TRHZ, 11),
                (regs::TIMINGS1_TWB, 21),
                (regs::TIMINGS1_TCWAW, 255),
                (regs::TIMINGS1_TVDLY, 255),
            ]),
            regs::TIMINGS2_TFEAT.put(199)
                | regs::TIMINGS2_CS_HOLD_TIME.put(0)
                | regs::TIMINGS2_CS_SETUP_TIME.put(3),
        ],
        phy_ctrl: regs::PHY_CTRL_PHONY_DQS.put(4),
    },
    KnownChip {
        name: "MT29F4G08ABAFAH4",
        id: [0x2c, 0xdc, 0x80, 0xa6, 0x62, 0x00, 0x00, 0x00],
        async_toggle: async_toggle(2, 2, 2, 2),
        timings: [
            fields([
                (regs::TIMINGS0_TADL, 13),
                (regs::TIMINGS0_TCCS, 99),
                (regs::TIMINGS0_TWHR, 11),
                (regs::TIMINGS0_TRHW, 19),
            ]),
            fields([
                (regs::TIMINGS1_TRHZ, 19),
                (regs::TIMINGS1_TWB, 21),
                (regs::TIMINGS1_TCWAW, 255),
                (regs::TIMINGS1_TVDLY, 255),
            ]),
            regs::TIMINGS2_TFEAT.put(199)
                | regs::TIMINGS2_CS_HOLD_TIME.put(0)
                | regs::TIMINGS2_CS_SETUP_TIME.put(3),
        ],
        phy_ctrl: regs::PHY_CTRL_PHONY_DQS.put(4),
    },
];

impl KnownChip {
    pub fn lookup(id: &[u8; 8]) -> Option<&'static KnownChip> {
        KNOWN_CHIPS.iter().find(|chip| &chip.id == id)
    }
}

/// Index of the highest timing mode set in a mode mask
fn best_timing(modes: u32) -> u8 {
    modes.checked_ilog2().unwrap_or(0) as u8
}

impl<P: Platform> Controller<P> {
    pub(super) fn hw_init(&mut self) -> Result<()> {
        if self.config.fpga_bringup {
            self.fpga_bringup()?;
        }

        self.wait_for_init_complete()?;

        // no cache or multiplane operations
        self.write(regs::MULTIPLANE_CFG, 0);
        self.write(regs::CACHE_CFG, 0);

        self.write(
            regs::INTR_ENABLE,
            regs::INTR_ENABLE_INTR_EN
                | regs::INTR_ENABLE_CDMA_TERR_EN
                | regs::INTR_ENABLE_DDMA_TERR_EN
                | regs::INTR_ENABLE_UNSUPP_CMD_EN
                | regs::INTR_ENABLE_SDMA_TRIGG_EN
                | regs::INTR_ENABLE_SDMA_ERR_EN,
        );
        self.write(regs::INTR_STATUS, 0xFFFF_FFFF);
        // thread errors are signalled for every thread
        self.write(regs::TRD_ERR_INT_STATUS_EN, 0xFF);

        Ok(())
    }

    /// Route the NAND pins through the FPGA prototype's eMMC pads
    fn fpga_bringup(&self) -> Result<()> {
        const PHY_CFG: u32 = 0x300;

        let hw = &*self.hw;
        hw.write_aux(AuxWindow::Peripheral, 0x0C, 0x03)?;

        let val = hw.read_aux(AuxWindow::EmmcPhy, PHY_CFG)?;
        hw.write_aux(AuxWindow::EmmcPhy, PHY_CFG, val & !1)?;
        hw.write_aux(AuxWindow::EmmcPhy, PHY_CFG, 0x0088_0002)?;
        hw.write_aux(AuxWindow::EmmcPhy, 0x304, 0x0609_0601)?;
        hw.write_aux(AuxWindow::EmmcPhy, 0x308, 0x0600_0600)?;
        hw.write_aux(AuxWindow::EmmcPhy, 0x30C, 0x0000_0600)?;

        let val = hw.read_aux(AuxWindow::EmmcPhy, PHY_CFG)?;
        hw.write_aux(AuxWindow::EmmcPhy, PHY_CFG, val | 1)?;

        log::debug!("FPGA pin mux and pad PHY configured");
        Ok(())
    }

    pub(super) fn read_dma_data_width(&mut self) {
        self.dma_width = if self.read(regs::CTRL_FEATURES) & regs::CTRL_FEATURES_DMA_DWITH64 != 0 {
            8
        } else {
            4
        };
    }

    pub(super) fn read_bch_config(&mut self) {
        self.bch = BchConfig::from_registers(
            self.read(regs::BCH_CFG_0),
            self.read(regs::BCH_CFG_1),
            self.read(regs::BCH_CFG_2),
        );
    }

    pub(super) fn dev_info(&mut self) {
        self.dev_type = DeviceType::from_register(self.read(regs::DEV_PARAMS_0));
        match self.dev_type {
            DeviceType::Onfi => log::info!("Detected ONFI device:"),
            DeviceType::Jedec => log::info!("Detected JEDEC device:"),
            DeviceType::Unknown => log::info!("Device type was not detected."),
        }
        log::info!("-- Page main area size: {}", self.chip.page_size);
        log::info!("-- Page spare area size: {}", self.chip.spare_size);
    }

    fn pio_reset(&self, bank: u8, thread: u8) -> Result<()> {
        self.wait_for_thread(thread)?;
        self.write(regs::CMD_REG1, PioCommand::reg1(bank, 0));
        self.write(regs::CMD_REG0, PioCommand::new(PioOp::Reset, thread).encode());
        Ok(())
    }

    fn pio_set_features(&self, addr: u8, value: u8, bank: u8, thread: u8) -> Result<()> {
        self.wait_for_thread(thread)?;
        self.write(regs::CMD_REG1, PioCommand::reg1(bank, addr));
        self.write(regs::CMD_REG2, value.into());
        self.write(
            regs::CMD_REG0,
            PioCommand::new(PioOp::SetFeatures, thread).encode(),
        );
        Ok(())
    }

    fn thread_status(&self, thread: u8) -> u32 {
        self.write(regs::CMD_STATUS_PTR, thread.into());
        self.read(regs::CMD_STATUS)
    }

    /// Wait for the PIO command on `thread` to complete or fail
    fn pio_check_finished(&self, thread: u8) -> Result<()> {
        let status = self.poll(self.config.timeouts.poll, "PIO command finished", || {
            let status =
                self.thread_status(thread) & (regs::CMD_STATUS_COMP | regs::CMD_STATUS_FAIL);
            (status != 0).then_some(status)
        })?;

        if status & regs::CMD_STATUS_FAIL != 0 {
            return Err(Error::io(format!("PIO command on thread {thread} failed")));
        }
        Ok(())
    }

    /// Fastest interface both the controller and the flash support, and its timing mode
    pub(super) fn check_best_mode(&self) -> (WorkMode, u8) {
        if self.dev_type != DeviceType::Onfi {
            return (WorkMode::Async, 0);
        }

        let features = self.read(regs::CTRL_FEATURES);
        let time_mod_0 = self.read(regs::ONFI_TIME_MOD_0);
        let time_mod_1 = self.read(regs::ONFI_TIME_MOD_1);

        let mut best = (WorkMode::Async, regs::ONFI_TIME_MOD_0_SDR.get(time_mod_0));
        if features & regs::CTRL_FEATURES_NVDDR != 0 {
            let ddr = regs::ONFI_TIME_MOD_0_DDR.get(time_mod_0);
            if ddr != 0 {
                best = (WorkMode::NvDdr, ddr);
            }
        }
        if features & regs::CTRL_FEATURES_NVDDR_2_3 != 0 {
            let ddr2 = regs::ONFI_TIME_MOD_1_DDR2.get(time_mod_1);
            if ddr2 != 0 {
                best = (WorkMode::NvDdr2, ddr2);
            }
            let ddr3 = regs::ONFI_TIME_MOD_1_DDR3.get(time_mod_1);
            if ddr3 != 0 {
                best = (WorkMode::NvDdr3, ddr3);
            }
        }

        (best.0, best_timing(best.1))
    }

    /// Tell every flash device to switch to `mode` at `timing`
    fn set_flash_work_mode(&self, mode: WorkMode, timing: u8) -> Result<()> {
        let value = mode.feature_value(timing);
        for i in 0..self.devnum {
            self.pio_set_features(FEATURE_TIMING_MODE, value, i, i)?;
        }
        for i in 0..self.devnum {
            self.pio_check_finished(i)?;
        }
        self.wait_for_idle()
    }

    fn apply_phy_settings(&self, phy: &PhySettings) {
        let map = &self.map;
        self.write(map.phy_ctrl, phy.phy_ctrl);
        self.write(map.phy_tsel, phy.tsel);
        self.write(map.phy_dq_timing, phy.dq_timing);
        self.write(map.phy_dqs_timing, phy.dqs_timing);
        self.write(map.phy_gate_lpbk_ctrl, phy.gate_lpbk);
        self.write(map.phy_dll_master_ctrl, phy.dll_master);
        self.write(map.phy_dll_slave_ctrl, phy.dll_slave);
    }

    /// Switch the controller and every flash device to `mode`.
    ///
    /// Each device is reset from its own thread first, which puts it back into asynchronous
    /// mode 0.
    pub(super) fn set_work_mode(&mut self, mode: WorkMode, timing: u8) -> Result<()> {
        let params_1 = self.read(regs::DEV_PARAMS_1);
        if regs::DEV_PARAMS_1_READID_5.get(params_1) == 0x01 {
            // the memory is locked in NV-DDR3
            return Err(Error::invalid("device reports it is fixed in NV-DDR3 mode"));
        }

        let map = self.map;
        self.write(
            map.common_sett,
            regs::COMMON_SETT_OPR_MODE.put(regs::OPR_MODE_SDR),
        );
        self.apply_phy_settings(&PhySettings::ASYNC);

        for i in 0..self.devnum {
            self.pio_reset(i, i)?;
        }
        for i in 0..self.devnum {
            self.pio_check_finished(i)?;
        }

        self.set_flash_work_mode(mode, timing)?;

        let mut dll_phy_ctrl = self.read(map.dll_phy_ctrl) & !regs::DLL_PHY_CTRL_DLL_RST_N;
        self.write(map.dll_phy_ctrl, dll_phy_ctrl);

        match mode {
            WorkMode::Toggle => log::info!("Switch to toggle DDR mode"),
            _ => log::info!("Switch to {mode:?} mode {timing}"),
        }
        self.apply_phy_settings(mode.phy_settings());
        match mode {
            WorkMode::Async => {
                self.write(map.async_toggle_timings, async_toggle(3, 4, 3, 4));
                dll_phy_ctrl |=
                    regs::DLL_PHY_CTRL_EXTENDED_RD_MODE | regs::DLL_PHY_CTRL_EXTENDED_WR_MODE;
            }
            WorkMode::NvDdr2 | WorkMode::NvDdr3 => {
                dll_phy_ctrl &= !regs::DLL_PHY_CTRL_EXTENDED_RD_MODE;
            }
            WorkMode::NvDdr | WorkMode::Toggle => {}
        }

        let common = regs::COMMON_SETT_OPR_MODE.set(self.read(map.common_sett), mode.opr_mode());
        self.write(map.common_sett, common);

        dll_phy_ctrl |= regs::DLL_PHY_CTRL_DLL_RST_N;
        self.write(map.dll_phy_ctrl, dll_phy_ctrl);

        self.wait_for_idle()
    }

    /// Program the timings of a chip from the known-chip table; others keep generic values
    pub(super) fn config_phy_timing(&self) -> Result<()> {
        let Some(chip) = KnownChip::lookup(&self.id) else {
            return Ok(());
        };

        log::info!("Applying {} timings", chip.name);
        self.write(self.map.async_toggle_timings, chip.async_toggle);
        self.write(regs::TIMINGS0, chip.timings[0]);
        self.write(regs::TIMINGS1, chip.timings[1]);
        self.write(regs::TIMINGS2, chip.timings[2]);
        self.write(self.map.phy_ctrl, chip.phy_ctrl);

        self.wait_for_idle()
    }

    /// READ ID at `addr`, returning the first eight bytes
    fn read_id_bytes(&mut self, addr: u8) -> Result<[u8; 8]> {
        self.reset_buf();
        self.read_id(addr, 8)?;
        let mut id = [0u8; 8];
        for b in id.iter_mut() {
            *b = self.next_byte();
        }
        Ok(id)
    }

    fn read_onfi_param_page(&mut self) -> Result<Option<OnfiParamPage>> {
        let signature = self.read_id_bytes(0x20)?;
        if &signature[..4] != ONFI_SIGNATURE {
            log::info!("Chip does not answer with an ONFI signature");
            return Ok(None);
        }

        self.reset_buf();
        self.read_parameter_page(4096)?;
        let copies: Vec<u8> = (0..PARAM_PAGE_SIZE * PARAM_PAGE_COPIES)
            .map(|_| self.next_byte())
            .collect();

        let page = OnfiParamPage::parse_redundant(&copies);
        if page.is_none() {
            log::warn!("No valid ONFI parameter page copy");
        }
        Ok(page)
    }

    /// Identify the chips on every chip select up to the configured limit.
    ///
    /// Chip 0 must answer; scanning stops at the first further chip select that fails to
    /// reset or reports a different ID.
    pub(super) fn scan(&mut self) -> Result<()> {
        let limit = self.config.params.chip_limit().min(MAX_CHIPS) as u8;
        let mut first_id = None;
        let mut found = 0;

        for cs in 0..limit {
            self.chip_nr = cs;

            let reset = self
                .pio_reset(cs, cs)
                .and_then(|()| self.pio_check_finished(cs));
            if let Err(e) = reset {
                if cs == 0 {
                    return Err(e);
                }
                log::debug!("No chip answers on chip select {cs}: {e}");
                break;
            }

            let id = self.read_id_bytes(0x00)?;
            match first_id {
                None => {
                    if id.iter().all(|&b| b == 0x00) || id.iter().all(|&b| b == 0xFF) {
                        log::error!("No NAND device found (ID {id:02x?})");
                        return Err(Error::NoDevice);
                    }
                    first_id = Some(id);
                }
                Some(first) if first != id => {
                    log::info!("Chip select {cs} reports a different ID {id:02x?}, ignoring it");
                    break;
                }
                Some(_) => {}
            }
            found += 1;
        }

        self.chip_nr = 0;
        let id = first_id.ok_or(Error::NoDevice)?;
        let onfi = self.read_onfi_param_page()?;

        let chip = match (&onfi, self.config.fallback_geometry) {
            (Some(page), _) => page.geometry(),
            (None, Some(fallback)) => {
                log::warn!("Using the configured geometry");
                fallback
            }
            (None, None) => {
                log::error!("Cannot determine the chip geometry");
                return Err(Error::NoDevice);
            }
        };
        if !chip.page_size.is_power_of_two() || chip.pages_per_block == 0 || chip.blocks == 0 {
            return Err(Error::invalid(format!("unusable chip geometry {chip:?}")));
        }

        if let Some(page) = &onfi {
            log::info!(
                "{} {}, {} chip(s), ID {id:02x?}",
                page.manufacturer(),
                page.model(),
                found
            );
        } else {
            log::info!("{found} chip(s), ID {id:02x?}");
        }

        self.id = id;
        self.onfi = onfi;
        self.chip = chip;
        self.devnum = found;
        Ok(())
    }
}

#[test]
fn test_best_timing() {
    assert_eq!(best_timing(0), 0);
    assert_eq!(best_timing(0x01), 0);
    assert_eq!(best_timing(0x3F), 5);
    assert_eq!(best_timing(0x10), 4);
}

#[test]
fn test_work_mode_encoding() {
    assert_eq!(WorkMode::NvDdr2.feature_value(3), 0x23);
    assert_eq!(WorkMode::Toggle.opr_mode(), regs::OPR_MODE_TOGGLE);
    assert_eq!(WorkMode::NvDdr3.phy_settings(), &PhySettings::DDR2);
    assert_eq!(WorkMode::Async.feature_value(5), 0x05);
}

#[test]
fn test_known_chip_timings() {
    let chip = KnownChip::lookup(&[0x2c, 0xdc, 0x80, 0xa6, 0x62, 0, 0, 0]).unwrap();
    assert_eq!(chip.name, "MT29F4G08ABAFAH4");
    assert_eq!(regs::TIMINGS0_TADL.get(chip.timings[0]), 13);
    assert_eq!(regs::TIMINGS1_TVDLY.get(chip.timings[1]), 255);
    assert_eq!(regs::TIMINGS2_TFEAT.get(chip.timings[2]), 199);
    assert_eq!(chip.async_toggle, 0x0202_0202);
    assert!(KnownChip::lookup(&[0; 8]).is_none());
}
