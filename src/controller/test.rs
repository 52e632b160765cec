use rand::rngs::SmallRng;
use rand::{RngCore, SeedableRng};

use super::*;
use crate::config::{ModuleParams, RegisterLayout, Timeouts};
use crate::nand::{EccOps, LegacyOps, NandCommand, PageUtil};
use crate::sim::{SimConfig, SimPlatform};

const MT29F4G08: [u8; 8] = [0x2c, 0xdc, 0x80, 0xa6, 0x62, 0x00, 0x00, 0x00];

fn probe(
    sim: SimConfig,
    config: DeviceConfig,
) -> anyhow::Result<(Arc<SimPlatform>, Controller<SimPlatform>)> {
    let hw = Arc::new(SimPlatform::new(sim));
    let ctrl = Controller::probe(Arc::clone(&hw), config)?;
    Ok((hw, ctrl))
}

fn random(rng: &mut SmallRng, len: usize) -> Vec<u8> {
    let mut buf = vec![0; len];
    rng.fill_bytes(&mut buf);
    buf
}

fn reads(hw: &SimPlatform) -> Vec<crate::sim::CdmaRecord> {
    hw.cdma_log()
        .into_iter()
        .filter(|r| r.kind == CommandKind::Read)
        .collect()
}

#[test]
fn test_probe_defaults() -> anyhow::Result<()> {
    let (hw, ctrl) = probe(SimConfig::default(), DeviceConfig::default())?;

    assert_eq!(ctrl.device_count(), 1);
    assert_eq!(ctrl.device_type(), DeviceType::Onfi);
    assert_eq!(ctrl.id(), SimConfig::default().id);
    assert_eq!(ctrl.onfi().map(|p| p.model()).as_deref(), Some("HPNFC-SIM"));
    assert_eq!(ctrl.dma_width(), 4);

    assert_eq!(ctrl.writesize(), 4096);
    assert_eq!(ctrl.oobsize(), 32);
    assert_eq!(ctrl.erasesize(), 64 * 4096);
    assert_eq!(ctrl.layout().spare_per_page, 32);
    assert_eq!(ctrl.geometry().sector_size, 512);
    assert_eq!(ctrl.geometry().corr_cap, 8);
    assert_eq!(ctrl.zos_page_end(), 0);

    assert_eq!(ctrl.work_mode(), (WorkMode::Async, 5));
    assert_eq!(hw.feature(0, 0x01), Some(0x05));

    assert_eq!(hw.reset_pulses(), ["host", "reg"]);
    assert!(hw.clock_enabled("core") && hw.clock_enabled("ecc") && hw.clock_enabled("sys"));
    assert!(hw.irq_registered());
    assert_eq!(hw.mapped_regions(), 2);
    assert_eq!(hw.reg(regs::MULTIPLANE_CFG), 0);
    assert_ne!(hw.reg(regs::INTR_ENABLE) & regs::INTR_ENABLE_SDMA_TRIGG_EN, 0);
    Ok(())
}

#[test]
fn test_round_trip_1024_byte_sectors() -> anyhow::Result<()> {
    let (hw, mut ctrl) = probe(SimConfig::default(), DeviceConfig::default().with_ecc(1024, 8))?;
    assert_eq!(ctrl.geometry().sector_count, 4);

    let mut rng = SmallRng::seed_from_u64(0x4850_4e46);
    let pages = [64, 65, 200, 1023];
    let mut written = Vec::new();
    for page in pages {
        let data = random(&mut rng, 4096);
        let oob = random(&mut rng, 32);
        ctrl.write_page(&data, Some(&oob), page)?;
        written.push((data, oob));
    }

    for (page, (data, oob)) in pages.into_iter().zip(&written) {
        let mut buf = vec![0; 4096];
        let mut spare = vec![0; 32];
        assert_eq!(ctrl.read_page(&mut buf, Some(&mut spare), page)?, 0);
        assert_eq!(&buf, data);
        assert_eq!(&spare, oob);
    }

    assert_eq!(ctrl.ecc_stats(), EccStats::default());
    let last = hw.cdma_log().pop().unwrap();
    assert!(last.ecc);
    assert_eq!(last.transfer.sector_size, 1024);
    assert_eq!(last.transfer.last_sector_size, 1024 + 32);
    Ok(())
}

#[test]
fn test_zos_pages_are_randomized() -> anyhow::Result<()> {
    let config = DeviceConfig::default().with_zos_end(2 * 64 * 4096);
    let (hw, mut ctrl) = probe(SimConfig::default(), config)?;
    assert_eq!(ctrl.zos_page_end(), 128);

    let mut rng = SmallRng::seed_from_u64(7);
    let data = random(&mut rng, 4096);
    let oob = random(&mut rng, 32);

    hw.clear_cdma_log();
    ctrl.write_page(&data, Some(&oob), 3)?;
    let log = hw.cdma_log();
    assert_eq!(log.len(), 2);
    assert!(!log[0].erase_detect);
    assert_eq!(log[0].transfer.last_sector_size, 512);
    assert!(!log[1].ecc);
    assert_eq!(log[1].transfer.offset, 4096 + 8 * 14);

    let cells = hw.with_flash(0, |f| f.page_cells(3).map(<[u8]>::to_vec)).flatten().unwrap();
    if cfg!(feature = "randomizer") {
        assert_ne!(&cells[..512], &data[..512]);
    }

    let mut buf = vec![0; 4096];
    let mut spare = vec![0; 32];
    assert_eq!(ctrl.read_page(&mut buf, Some(&mut spare), 3)?, 0);
    assert_eq!(buf, data);
    assert_eq!(spare, oob);

    let mut spare = vec![0; 32];
    ctrl.read_oob(&mut spare, 3)?;
    assert_eq!(spare, oob);

    // past the boundary nothing is randomized
    ctrl.write_page(&data, Some(&oob), 130)?;
    let cells = hw.with_flash(0, |f| f.page_cells(130).map(<[u8]>::to_vec)).flatten().unwrap();
    assert_eq!(&cells[..512], &data[..512]);
    Ok(())
}

#[test]
fn test_zos_randomizer_turned_off() -> anyhow::Result<()> {
    let config = DeviceConfig::default()
        .with_zos_end(64 * 4096)
        .with_randomizer(false);
    let (hw, mut ctrl) = probe(SimConfig::default(), config)?;

    let data = random(&mut SmallRng::seed_from_u64(8), 4096);
    ctrl.write_page(&data, None, 3)?;
    let cells = hw.with_flash(0, |f| f.page_cells(3).map(<[u8]>::to_vec)).flatten().unwrap();
    assert_eq!(&cells[..512], &data[..512]);

    let mut buf = vec![0; 4096];
    ctrl.read_page(&mut buf, None, 3)?;
    assert_eq!(buf, data);
    Ok(())
}

#[test]
fn test_uncorrectable_zos_page() -> anyhow::Result<()> {
    let config = DeviceConfig::default().with_zos_end(64 * 4096);
    let (hw, mut ctrl) = probe(SimConfig::default(), config)?;
    let mut rng = SmallRng::seed_from_u64(9);
    let data = random(&mut rng, 4096);
    let oob = random(&mut rng, 32);
    ctrl.write_page(&data, Some(&oob), 5)?;

    hw.with_flash(0, |f| {
        f.flip_bits(5, 0, 0xFF);
        f.flip_bits(5, 1, 0x01);
    });
    hw.clear_cdma_log();

    let mut buf = vec![0; 4096];
    let mut spare = vec![0; 32];
    assert!(matches!(
        ctrl.read_page(&mut buf, Some(&mut spare), 5),
        Err(Error::Uncorrectable(5))
    ));
    assert_eq!(ctrl.ecc_stats().failed, 1);

    // the raw copy comes back descrambled, flipped bits and all
    assert_eq!(buf[0], data[0] ^ 0xFF);
    assert_eq!(buf[1], data[1] ^ 0x01);
    assert_eq!(&buf[2..512], &data[2..512]);
    assert_eq!(spare, oob);
    assert_eq!(reads(&hw).len(), 3);
    Ok(())
}

#[test]
fn test_zos_spare_scrambled_to_all_ones() -> anyhow::Result<()> {
    let config = DeviceConfig::default().with_zos_end(64 * 4096);
    let (hw, mut ctrl) = probe(SimConfig::default(), config)?;

    // a spare whose scrambled form is all 0xFF on the chip
    let mut key = vec![0u8; 32];
    ctrl.randomizer().randomize_page(7, None, Some(&mut key));
    let oob: Vec<u8> = key.iter().map(|k| k ^ 0xFF).collect();
    let data = random(&mut SmallRng::seed_from_u64(10), 4096);
    ctrl.write_page(&data, Some(&oob), 7)?;

    let cells = hw.with_flash(0, |f| f.page_cells(7).map(<[u8]>::to_vec)).flatten().unwrap();
    assert!(cells[4096 + 8 * 14..][..32].is_erased());

    let mut spare = vec![0; 32];
    ctrl.read_oob(&mut spare, 7)?;
    assert_eq!(spare, oob);

    let mut buf = vec![0; 4096];
    let mut spare = vec![0; 32];
    ctrl.read_page(&mut buf, Some(&mut spare), 7)?;
    assert_eq!(buf, data);
    assert_eq!(spare, oob);
    Ok(())
}

#[test]
fn test_erased_zos_page() -> anyhow::Result<()> {
    let config = DeviceConfig::default().with_zos_end(64 * 4096);
    let (hw, mut ctrl) = probe(SimConfig::default(), config)?;

    // no erased-page detection here, so the engine reports a failure and the raw copy decides
    let mut buf = vec![0; 4096];
    let mut spare = vec![0; 32];
    assert_eq!(ctrl.read_page(&mut buf, Some(&mut spare), 10)?, 0);
    assert!(buf.is_erased() && spare.is_erased());
    assert_eq!(reads(&hw).len(), 2);
    assert_eq!(ctrl.ecc_stats(), EccStats::default());

    ctrl.read_oob(&mut spare, 10)?;
    assert!(spare.is_erased());
    Ok(())
}

#[test]
fn test_erased_page_reads_as_ff() -> anyhow::Result<()> {
    let (hw, mut ctrl) = probe(SimConfig::default(), DeviceConfig::default())?;

    let mut buf = vec![0; 4096];
    let mut spare = vec![0; 32];
    assert_eq!(ctrl.read_page(&mut buf, Some(&mut spare), 70)?, 0);
    assert!(buf.is_erased());
    assert!(spare.is_erased());
    assert_eq!(reads(&hw).len(), 1);
    Ok(())
}

#[test]
fn test_corrected_bitflips_are_counted() -> anyhow::Result<()> {
    let (hw, mut ctrl) = probe(SimConfig::default(), DeviceConfig::default())?;
    let mut rng = SmallRng::seed_from_u64(1);
    let data = random(&mut rng, 4096);
    ctrl.write_page(&data, None, 64)?;

    hw.with_flash(0, |f| {
        f.flip_bits(64, 10, 0b0000_0111);
        // second sector starts after 512 data and 14 check bytes
        f.flip_bits(64, 600, 0x01);
    });

    let mut buf = vec![0; 4096];
    assert_eq!(ctrl.read_page(&mut buf, None, 64)?, 3);
    assert_eq!(buf, data);
    assert_eq!(ctrl.ecc_stats().corrected, 3);
    assert_eq!(ctrl.ecc_stats().failed, 0);
    Ok(())
}

#[test]
fn test_erased_page_with_bitflips() -> anyhow::Result<()> {
    let (hw, mut ctrl) = probe(SimConfig::default(), DeviceConfig::default())?;
    hw.with_flash(0, |f| f.flip_bits(80, 100, 0x03));

    let mut buf = vec![0; 4096];
    let mut spare = vec![0; 32];
    assert_eq!(ctrl.read_page(&mut buf, Some(&mut spare), 80)?, 2);
    assert!(buf.is_erased() && spare.is_erased());
    assert_eq!(ctrl.ecc_stats().corrected, 2);

    let log = reads(&hw);
    assert_eq!(log.len(), 2);
    assert!(log[0].ecc);
    assert!(!log[1].ecc);
    Ok(())
}

#[test]
fn test_uncorrectable_page() -> anyhow::Result<()> {
    let (hw, mut ctrl) = probe(SimConfig::default(), DeviceConfig::default())?;
    let mut rng = SmallRng::seed_from_u64(2);
    ctrl.write_page(&random(&mut rng, 4096), None, 90)?;

    hw.with_flash(0, |f| {
        f.flip_bits(90, 0, 0xFF);
        f.flip_bits(90, 1, 0x01);
    });
    hw.clear_cdma_log();

    let mut buf = vec![0; 4096];
    assert!(matches!(
        ctrl.read_page(&mut buf, None, 90),
        Err(Error::Uncorrectable(90))
    ));
    assert_eq!(ctrl.ecc_stats().failed, 1);
    // exactly one raw re-read
    assert_eq!(reads(&hw).len(), 2);
    Ok(())
}

#[test]
fn test_transfer_config_is_cached() -> anyhow::Result<()> {
    let (hw, mut ctrl) = probe(SimConfig::default(), DeviceConfig::default())?;
    let before = hw.write_count(regs::TRAN_CFG_0);
    let before_1 = hw.write_count(regs::TRAN_CFG_1);

    let mut buf = vec![0; 4096];
    ctrl.read_page(&mut buf, None, 64)?;
    ctrl.read_page(&mut buf, None, 65)?;
    assert_eq!(hw.write_count(regs::TRAN_CFG_0), before + 1);

    let mut spare = vec![0; 32];
    ctrl.read_oob(&mut spare, 64)?;
    ctrl.read_page(&mut buf, None, 64)?;
    assert_eq!(hw.write_count(regs::TRAN_CFG_0), before + 3);
    assert_eq!(hw.write_count(regs::TRAN_CFG_1), before_1 + 3);
    Ok(())
}

#[test]
fn test_oob_round_trip() -> anyhow::Result<()> {
    let (hw, mut ctrl) = probe(SimConfig::default(), DeviceConfig::default())?;
    let mut rng = SmallRng::seed_from_u64(3);
    let oob = random(&mut rng, 32);

    ctrl.write_oob(&oob, 100)?;
    let write = hw.cdma_log().pop().unwrap();
    assert_eq!(write.transfer.offset, 7 * 512 + 7 * 14);
    assert!(write.ecc);

    let mut spare = vec![0; 32];
    ctrl.read_oob(&mut spare, 100)?;
    assert_eq!(spare, oob);

    let mut buf = vec![0; 4096];
    let mut spare = vec![0; 32];
    ctrl.read_page(&mut buf, Some(&mut spare), 100)?;
    assert!(buf.is_erased());
    assert_eq!(spare, oob);

    // a page written without spare data leaves the spare erased
    ctrl.write_page(&random(&mut rng, 4096), None, 101)?;
    ctrl.read_oob(&mut spare, 101)?;
    assert!(spare.is_erased());
    Ok(())
}

#[test]
fn test_raw_read_ecc_only_past_first_block() -> anyhow::Result<()> {
    let (hw, mut ctrl) = probe(SimConfig::default(), DeviceConfig::default())?;
    let mut rng = SmallRng::seed_from_u64(4);
    let data = random(&mut rng, 4096);
    ctrl.write_page_raw(&data, None, 5)?;
    assert!(!hw.cdma_log().pop().unwrap().ecc);

    let mut buf = vec![0; 4096];
    ctrl.read_page_raw(&mut buf, None, 5)?;
    assert!(!hw.cdma_log().pop().unwrap().ecc);
    assert_eq!(buf, data);

    ctrl.read_page_raw(&mut buf, None, 70)?;
    assert!(hw.cdma_log().pop().unwrap().ecc);
    assert!(buf.is_erased());
    Ok(())
}

#[test]
fn test_stalled_command_times_out() -> anyhow::Result<()> {
    let config = DeviceConfig::default().with_timeouts(Timeouts::uniform(Duration::from_millis(50)));
    let (hw, mut ctrl) = probe(SimConfig::default(), config)?;
    hw.faults(|f| f.stall_completion = true);

    let mut buf = vec![0; 4096];
    assert!(matches!(
        ctrl.read_page(&mut buf, None, 64),
        Err(Error::Timeout(_))
    ));
    Ok(())
}

#[test]
fn test_failures_are_io_errors() -> anyhow::Result<()> {
    let (hw, mut ctrl) = probe(SimConfig::default(), DeviceConfig::default())?;
    let mut buf = vec![0; 4096];

    hw.faults(|f| f.controller_error_next = true);
    assert!(matches!(ctrl.read_page(&mut buf, None, 64), Err(Error::Io(_))));

    hw.faults(|f| f.descriptor_error_next = true);
    assert!(matches!(ctrl.read_page(&mut buf, None, 64), Err(Error::Io(_))));

    hw.faults(|f| f.fail_next_program = true);
    assert!(matches!(ctrl.write_page(&buf, None, 64), Err(Error::Io(_))));

    // and the controller keeps working afterwards
    assert_eq!(ctrl.read_page(&mut buf, None, 64)?, 0);
    Ok(())
}

#[test]
fn test_erase_block() -> anyhow::Result<()> {
    let (hw, mut ctrl) = probe(SimConfig::default(), DeviceConfig::default())?;
    let mut rng = SmallRng::seed_from_u64(5);
    ctrl.write_page(&random(&mut rng, 4096), None, 64)?;

    ctrl.erase_block(64)?;
    assert_eq!(hw.with_flash(0, |f| f.erase_count(1)), Some(1));

    let mut buf = vec![0; 4096];
    assert_eq!(ctrl.read_page(&mut buf, None, 64)?, 0);
    assert!(buf.is_erased());

    assert!(matches!(ctrl.erase_block(1 << 20), Err(Error::Io(_))));
    Ok(())
}

#[test]
fn test_scan_retry() -> anyhow::Result<()> {
    let hw = Arc::new(SimPlatform::new(SimConfig::default()));
    hw.faults(|f| f.blank_id_reads = 1);

    let ctrl = Controller::probe(Arc::clone(&hw), DeviceConfig::default())?;
    assert_eq!(ctrl.device_count(), 1);
    assert!(hw
        .writes(RegisterMap::STANDARD.async_toggle_timings)
        .contains(&0x1818_1818));
    Ok(())
}

#[test]
fn test_failed_probe_tears_down() {
    let hw = Arc::new(SimPlatform::new(SimConfig::default()));
    hw.faults(|f| f.blank_id_reads = 2);

    let result = Controller::probe(Arc::clone(&hw), DeviceConfig::default());
    assert!(matches!(result, Err(Error::NoDevice)));
    assert!(!hw.irq_registered());
    assert_eq!(hw.mapped_regions(), 0);
    assert!(!hw.clock_enabled("core"));
    assert_eq!(hw.reg(regs::INTR_ENABLE), regs::INTR_ENABLE_INTR_EN);
}

#[test]
fn test_non_onfi_chip() -> anyhow::Result<()> {
    let sim = SimConfig::default().with_onfi(false);
    let hw = Arc::new(SimPlatform::new(sim.clone()));
    let result = Controller::probe(hw, DeviceConfig::default());
    assert!(matches!(result, Err(Error::NoDevice)));

    let fallback = ChipGeometry {
        ecc_bits: 8,
        ..ChipGeometry::from(sim.layout)
    };
    let (hw, ctrl) = probe(sim, DeviceConfig::default().with_fallback_geometry(fallback))?;
    assert!(ctrl.onfi().is_none());
    assert_eq!(ctrl.device_type(), DeviceType::Unknown);
    assert_eq!(ctrl.work_mode(), (WorkMode::Async, 0));
    assert_eq!(hw.feature(0, 0x01), Some(0x00));
    assert_eq!(ctrl.geometry().sector_size, 512);
    Ok(())
}

#[test]
fn test_corrupt_parameter_page_copies() -> anyhow::Result<()> {
    let hw = Arc::new(SimPlatform::new(SimConfig::default()));
    hw.faults(|f| f.corrupt_param_copies = 2);
    let ctrl = Controller::probe(Arc::clone(&hw), DeviceConfig::default())?;
    assert_eq!(ctrl.chip_geometry().page_size, 4096);
    drop(ctrl);

    let hw = Arc::new(SimPlatform::new(SimConfig::default()));
    hw.faults(|f| f.corrupt_param_copies = 3);
    let result = Controller::probe(hw, DeviceConfig::default());
    assert!(matches!(result, Err(Error::NoDevice)));
    Ok(())
}

#[test]
fn test_multi_chip_scan() -> anyhow::Result<()> {
    let params = ModuleParams {
        maxchips: 4,
        disable_ddr: false,
    };

    let (hw, ctrl) = probe(
        SimConfig::default().with_chips(2),
        DeviceConfig::default().with_params(params),
    )?;
    assert_eq!(ctrl.device_count(), 2);
    assert_eq!(ctrl.selected_chip(), 0);
    assert_eq!(hw.feature(1, 0x01), Some(0x05));

    // only the first chip select without maxchips
    let (_, ctrl) = probe(SimConfig::default().with_chips(2), DeviceConfig::default())?;
    assert_eq!(ctrl.device_count(), 1);

    // a different chip ends the scan
    let hw = Arc::new(SimPlatform::new(SimConfig::default().with_chips(3)));
    hw.set_chip_id(1, MT29F4G08);
    let ctrl = Controller::probe(hw, DeviceConfig::default().with_params(params))?;
    assert_eq!(ctrl.device_count(), 1);
    Ok(())
}

#[test]
fn test_best_mode_ddr2() -> anyhow::Result<()> {
    let sim = SimConfig::default().with_timing_modes(0x3F, 0x1F, 0x0F, 0);
    let (hw, ctrl) = probe(sim, DeviceConfig::default())?;
    let map = RegisterMap::STANDARD;

    assert_eq!(ctrl.work_mode(), (WorkMode::NvDdr2, 3));
    assert_eq!(hw.feature(0, 0x01), Some(0x23));
    assert_eq!(
        regs::COMMON_SETT_OPR_MODE.get(hw.reg(map.common_sett)),
        regs::OPR_MODE_TOGGLE
    );
    assert_eq!(hw.reg(map.phy_dqs_timing), PhySettings::DDR2.dqs_timing);
    let dll = hw.reg(map.dll_phy_ctrl);
    assert_ne!(dll & regs::DLL_PHY_CTRL_DLL_RST_N, 0);
    assert_eq!(dll & regs::DLL_PHY_CTRL_EXTENDED_RD_MODE, 0);
    Ok(())
}

#[test]
fn test_best_mode_ddr3_and_ddr() -> anyhow::Result<()> {
    let sim = SimConfig::default().with_timing_modes(0x3F, 0x1F, 0x0F, 0x03);
    let (hw, ctrl) = probe(sim, DeviceConfig::default())?;
    assert_eq!(ctrl.work_mode(), (WorkMode::NvDdr3, 1));
    assert_eq!(hw.feature(0, 0x01), Some(0x31));

    let sim = SimConfig::default().with_timing_modes(0x3F, 0x07, 0, 0);
    let (hw, ctrl) = probe(sim, DeviceConfig::default())?;
    assert_eq!(ctrl.work_mode(), (WorkMode::NvDdr, 2));
    assert_eq!(
        regs::COMMON_SETT_OPR_MODE.get(hw.reg(RegisterMap::STANDARD.common_sett)),
        regs::OPR_MODE_NV_DDR
    );
    Ok(())
}

#[test]
fn test_disable_ddr_stays_async() -> anyhow::Result<()> {
    let sim = SimConfig::default().with_timing_modes(0x3F, 0x1F, 0x0F, 0);
    let config = DeviceConfig::default().with_params(ModuleParams {
        maxchips: 1,
        disable_ddr: true,
    });
    let (hw, ctrl) = probe(sim, config)?;
    let map = RegisterMap::STANDARD;

    assert_eq!(ctrl.work_mode(), (WorkMode::Async, 0));
    assert_eq!(hw.feature(0, 0x01), None);
    assert_eq!(
        regs::COMMON_SETT_OPR_MODE.get(hw.reg(map.common_sett)),
        regs::OPR_MODE_SDR
    );
    Ok(())
}

#[test]
fn test_known_chip_timings() -> anyhow::Result<()> {
    let (hw, _ctrl) = probe(SimConfig::default().with_id(MT29F4G08), DeviceConfig::default())?;
    let map = RegisterMap::STANDARD;
    let chip = &KNOWN_CHIPS[1];

    assert_eq!(hw.reg(regs::TIMINGS0), chip.timings[0]);
    assert_eq!(hw.reg(regs::TIMINGS1), chip.timings[1]);
    assert_eq!(hw.reg(regs::TIMINGS2), chip.timings[2]);
    assert_eq!(hw.reg(map.async_toggle_timings), 0x0202_0202);
    assert_eq!(hw.reg(map.phy_ctrl), regs::PHY_CTRL_PHONY_DQS.put(4));

    // other chips keep the generic values
    let (hw, _ctrl) = probe(SimConfig::default(), DeviceConfig::default())?;
    assert_eq!(hw.write_count(regs::TIMINGS0), 0);
    Ok(())
}

#[test]
fn test_as390_register_layout() -> anyhow::Result<()> {
    let sim = SimConfig::default().with_register_map(RegisterMap::AS390_REMAP);
    let config = DeviceConfig::default().with_layout(RegisterLayout::As390Remap);
    let (hw, ctrl) = probe(sim, config)?;

    assert_eq!(ctrl.device_count(), 1);
    assert_ne!(hw.write_count(RegisterMap::AS390_REMAP.async_toggle_timings), 0);
    assert_ne!(hw.write_count(RegisterMap::AS390_REMAP.phy_ctrl), 0);
    assert_eq!(hw.write_count(RegisterMap::STANDARD.async_toggle_timings), 0);
    assert_eq!(hw.write_count(RegisterMap::STANDARD.phy_ctrl), 0);
    Ok(())
}

#[test]
fn test_64bit_slave_dma() -> anyhow::Result<()> {
    let (_, mut ctrl) = probe(SimConfig::default().with_dma_64bit(true), DeviceConfig::default())?;
    assert_eq!(ctrl.dma_width(), 8);
    assert!(ctrl.onfi().is_some());

    ctrl.cmdfunc(NandCommand::ReadId.opcode(), 0x00, -1);
    let id: Vec<u8> = (0..8).map(|_| ctrl.read_byte()).collect();
    assert_eq!(id, SimConfig::default().id);

    ctrl.cmdfunc(NandCommand::Param.opcode(), 0, -1);
    let mut buf = [0u8; 10];
    ctrl.read_buf(&mut buf);
    assert_eq!(&buf[..4], b"ONFI");
    Ok(())
}

#[test]
fn test_legacy_commands() -> anyhow::Result<()> {
    let config = DeviceConfig::default().with_timeouts(Timeouts::uniform(Duration::from_millis(20)));
    let (hw, mut ctrl) = probe(SimConfig::default(), config)?;

    ctrl.cmdfunc(NandCommand::Status.opcode(), -1, -1);
    assert_eq!(ctrl.read_byte(), 0xE0);
    assert_eq!(ctrl.waitfunc(), 0xE0);

    ctrl.cmdfunc(NandCommand::ReadId.opcode(), 0x00, -1);
    let id: Vec<u8> = (0..8).map(|_| ctrl.read_byte()).collect();
    assert_eq!(id, SimConfig::default().id);
    assert_eq!(ctrl.read_byte(), 0xFF);

    ctrl.cmdfunc(NandCommand::Param.opcode(), 0x00, -1);
    let page: Vec<u8> = (0..256).map(|_| ctrl.read_byte()).collect();
    assert!(crate::onfi::OnfiParamPage::parse(&page).is_some());

    // logged and ignored, the stream carries on with the second parameter page copy
    ctrl.cmdfunc(NandCommand::Erase1.opcode(), -1, 64);
    ctrl.cmdfunc(0x42, -1, -1);
    assert_eq!(ctrl.read_byte(), b'O');
    assert_eq!(ctrl.read_byte(), b'N');

    ctrl.cmdfunc(NandCommand::Reset.opcode(), -1, -1);
    assert_eq!(ctrl.read_byte(), b'F');
    ctrl.cmdfunc(NandCommand::Status.opcode(), -1, -1);
    assert_eq!(ctrl.read_byte(), 0xE0);
    assert_eq!(ctrl.read_byte(), 0xFF);

    hw.faults(|f| f.sdma_error_next = true);
    ctrl.cmdfunc(NandCommand::ReadId.opcode(), 0x00, -1);
    assert_eq!(ctrl.read_byte(), 0xFF);

    hw.faults(|f| f.busy_chips = 0x01);
    ctrl.cmdfunc(NandCommand::Status.opcode(), -1, -1);
    assert_eq!(ctrl.read_byte(), 0x80);
    assert_eq!(ctrl.waitfunc(), 0x01);

    ctrl.select_chip(Some(1));
    assert_eq!(ctrl.selected_chip(), 1);
    ctrl.select_chip(None);
    assert_eq!(ctrl.selected_chip(), 1);
    Ok(())
}

#[test]
fn test_drop_releases_everything() -> anyhow::Result<()> {
    let (hw, ctrl) = probe(SimConfig::default(), DeviceConfig::default())?;
    drop(ctrl);

    assert!(!hw.irq_registered());
    assert_eq!(hw.mapped_regions(), 0);
    assert!(!hw.clock_enabled("ecc"));
    assert_eq!(hw.reg(regs::INTR_ENABLE), regs::INTR_ENABLE_INTR_EN);
    Ok(())
}

#[test]
fn test_fpga_bringup() -> anyhow::Result<()> {
    use crate::platform::AuxWindow::{EmmcPhy, Peripheral};

    let (hw, _ctrl) = probe(
        SimConfig::default().with_fpga(true),
        DeviceConfig::default().with_fpga_bringup(true),
    )?;
    assert_eq!(
        hw.aux_writes(),
        [
            (Peripheral, 0x0C, 0x03),
            (EmmcPhy, 0x300, 0x0000_0000),
            (EmmcPhy, 0x300, 0x0088_0002),
            (EmmcPhy, 0x304, 0x0609_0601),
            (EmmcPhy, 0x308, 0x0600_0600),
            (EmmcPhy, 0x30C, 0x0000_0600),
            (EmmcPhy, 0x300, 0x0088_0003),
        ]
    );

    // no auxiliary windows to program
    let hw = Arc::new(SimPlatform::new(SimConfig::default()));
    let result = Controller::probe(hw, DeviceConfig::default().with_fpga_bringup(true));
    assert!(matches!(result, Err(Error::InvalidArgument(_))));
    Ok(())
}

#[test]
fn test_unsupported_ecc_disables_it() -> anyhow::Result<()> {
    let (_, mut ctrl) = probe(SimConfig::default(), DeviceConfig::default().with_ecc(512, 12))?;
    assert!(!ctrl.geometry().ecc_enabled());
    assert_eq!(ctrl.geometry().sector_size, 4096);
    assert_eq!(ctrl.geometry().strength(), 2);

    let mut rng = SmallRng::seed_from_u64(6);
    let data = random(&mut rng, 4096);
    ctrl.write_page(&data, None, 64)?;
    let mut buf = vec![0; 4096];
    assert_eq!(ctrl.read_page(&mut buf, None, 64)?, 0);
    assert_eq!(buf, data);
    Ok(())
}

#[test]
fn test_spare_too_small() -> anyhow::Result<()> {
    let sim = SimConfig::default().with_layout("16x64x4096+64".parse()?);
    let hw = Arc::new(SimPlatform::new(sim));
    let result = Controller::probe(Arc::clone(&hw), DeviceConfig::default().with_ecc(512, 24));
    assert!(matches!(result, Err(Error::SpareTooSmall { .. })));
    assert_eq!(hw.mapped_regions(), 0);
    Ok(())
}

#[test]
fn test_fixed_ddr3_device_refuses_mode_change() {
    let sim = SimConfig {
        readid_5: 1,
        ..Default::default()
    };
    let hw = Arc::new(SimPlatform::new(sim));
    let result = Controller::probe(hw, DeviceConfig::default());
    assert!(matches!(result, Err(Error::Io(_))));
}

#[test]
fn test_short_buffers_are_rejected() -> anyhow::Result<()> {
    let (_, mut ctrl) = probe(SimConfig::default(), DeviceConfig::default())?;
    let mut buf = vec![0; 2048];
    assert!(matches!(
        ctrl.read_page(&mut buf, None, 64),
        Err(Error::InvalidArgument(_))
    ));
    let mut spare = vec![0; 8];
    assert!(matches!(
        ctrl.read_oob(&mut spare, 64),
        Err(Error::InvalidArgument(_))
    ));
    Ok(())
}
