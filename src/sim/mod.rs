//! A register-level model of the controller and the chips behind it, used by the tests and by
//! `hpnfc-ctl --sim-layout`.
//!
//! [`SimPlatform`] implements [`Platform`] by decoding every CMD_REG0 write the way the hardware
//! would: PIO commands update the per-thread command status, generic commands fill the slave DMA
//! FIFO, and CDMA commands fetch their descriptor from simulated DMA memory, move page data
//! through a [`SimFlash`] and write the status word back. Interrupts are latched in the W1C cause
//! registers and delivered by calling the installed handler on the writing thread.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::io::{Read, Write};
use std::sync::{Mutex, MutexGuard};

use deku::prelude::*;

use crate::command::{self, DecodedGeneric, Direction, Instruction, PioOp};
use crate::descriptor::{
    CdmaDescriptor, CommandKind, CF_INT, CS_COMP, CS_ERR, CS_FAIL, DESCRIPTOR_SIZE,
    STATUS_OFFSET,
};
use crate::geometry::{BchConfig, TransferConfig};
use crate::nand::NandLayout;
use crate::onfi::{OnfiParamPage, PARAM_PAGE_SIZE};
use crate::platform::{AuxWindow, DmaDirection, IrqHandler, Platform};
use crate::regs::{self, RegisterMap};
use crate::{Error, Result};

mod flash;

pub use flash::{EccMode, SimBlock, SimFlash};

/// Bytes the chip streams out for a READ PARAMETER PAGE before repeating
const PARAM_STREAM_LEN: usize = 4096;

const DMA_BASE: u64 = 0x8000_0000;
const DMA_ALIGN: u64 = 0x1000;

/// How the simulated controller was synthesized, and what is attached to it
#[derive(Debug, Clone)]
pub struct SimConfig {
    pub layout: NandLayout,
    /// Chips attached, one per chip select starting at 0
    pub chips: u8,
    /// READ ID output at address 0x00
    pub id: [u8; 8],
    /// Answer READ ID 0x20 with the ONFI signature and serve a parameter page
    pub onfi: bool,
    /// Correction the parameter page asks for per 512 bytes
    pub ecc_bits: u8,
    pub bch: BchConfig,
    pub dma_64bit: bool,
    pub threads: u8,
    pub onfi_time_mod: [u32; 2],
    pub register_map: RegisterMap,
    /// CTRL_STATUS reads before INIT_COMP is reported
    pub init_delay: u32,
    pub readid_5: u8,
    pub clocks: Vec<String>,
    pub resets: Vec<String>,
    /// Provide the FPGA prototype's auxiliary windows
    pub fpga: bool,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            layout: NandLayout {
                blocks: 16,
                pages_per_block: 64,
                bytes_per_page: 4096,
                spare_per_page: 224,
            },
            chips: 1,
            id: [0x2c, 0xdc, 0x90, 0xa6, 0x54, 0x00, 0x00, 0x00],
            onfi: true,
            ecc_bits: 8,
            bch: BchConfig {
                corr_caps: [2, 4, 8, 16, 24, 32, 0, 0],
                sector_sizes: [512, 1024],
            },
            dma_64bit: false,
            threads: 4,
            onfi_time_mod: [0x003F, 0],
            register_map: RegisterMap::STANDARD,
            init_delay: 2,
            readid_5: 0,
            clocks: ["core", "ecc", "sys"].map(String::from).to_vec(),
            resets: ["host", "reg"].map(String::from).to_vec(),
            fpga: false,
        }
    }
}

impl SimConfig {
    pub fn with_layout(mut self, layout: NandLayout) -> Self {
        self.layout = layout;
        self
    }

    pub fn with_chips(mut self, chips: u8) -> Self {
        self.chips = chips;
        self
    }

    pub fn with_id(mut self, id: [u8; 8]) -> Self {
        self.id = id;
        self
    }

    pub fn with_onfi(mut self, onfi: bool) -> Self {
        self.onfi = onfi;
        self
    }

    pub fn with_dma_64bit(mut self, wide: bool) -> Self {
        self.dma_64bit = wide;
        self
    }

    /// Timing modes in ONFI_TIME_MOD_0 (SDR, DDR) and ONFI_TIME_MOD_1 (DDR2, DDR3)
    pub fn with_timing_modes(mut self, sdr: u16, ddr: u16, ddr2: u16, ddr3: u16) -> Self {
        self.onfi_time_mod = [
            regs::ONFI_TIME_MOD_0_SDR.put(sdr.into()) | regs::ONFI_TIME_MOD_0_DDR.put(ddr.into()),
            regs::ONFI_TIME_MOD_1_DDR2.put(ddr2.into())
                | regs::ONFI_TIME_MOD_1_DDR3.put(ddr3.into()),
        ];
        self
    }

    pub fn with_register_map(mut self, map: RegisterMap) -> Self {
        self.register_map = map;
        self
    }

    pub fn with_fpga(mut self, fpga: bool) -> Self {
        self.fpga = fpga;
        self
    }

    fn ctrl_features(&self) -> u32 {
        let mut reg = regs::CTRL_FEATURES_N_THREADS.put(self.threads.into())
            | regs::CTRL_FEATURES_N_BANKS.put(u32::from(self.chips.saturating_sub(1)))
            | regs::CTRL_FEATURES_ASYNC;
        if self.dma_64bit {
            reg |= regs::CTRL_FEATURES_DMA_DWITH64;
        }
        if regs::ONFI_TIME_MOD_0_DDR.get(self.onfi_time_mod[0]) != 0 {
            reg |= regs::CTRL_FEATURES_NVDDR;
        }
        if self.onfi_time_mod[1] != 0 {
            reg |= regs::CTRL_FEATURES_NVDDR_2_3;
        }
        reg
    }

    fn bch_registers(&self) -> [u32; 3] {
        let mut caps = [0u32; 2];
        for (i, &cap) in self.bch.corr_caps.iter().enumerate() {
            caps[i / 4] |= regs::bch_corr_cap(i as u32).put(cap.into());
        }
        [
            caps[0],
            caps[1],
            regs::BCH_CFG_2_SECT_0.put(self.bch.sector_sizes[0].into())
                | regs::BCH_CFG_2_SECT_1.put(self.bch.sector_sizes[1].into()),
        ]
    }

    fn param_stream(&self) -> Vec<u8> {
        if !self.onfi {
            return vec![0; PARAM_STREAM_LEN];
        }
        let page = OnfiParamPage::describe(&self.layout, "SIMULATED", "HPNFC-SIM", self.ecc_bits);
        let bytes = page.to_bytes().unwrap_or_default();
        bytes
            .iter()
            .copied()
            .cycle()
            .take(PARAM_STREAM_LEN)
            .collect()
    }
}

/// Failures the test harness can arrange
#[derive(Debug, Default, Clone)]
pub struct Faults {
    /// Accept CDMA commands but never finish them
    pub stall_completion: bool,
    /// Next page program reports a failure without touching the array
    pub fail_next_program: bool,
    /// Next descriptor comes back with its error flag set
    pub descriptor_error_next: bool,
    /// Next CDMA command raises the controller's CDMA error interrupt instead of completing
    pub controller_error_next: bool,
    /// Next generic data transfer raises an SDMA error
    pub sdma_error_next: bool,
    /// Thread that never leaves the busy state
    pub stuck_thread: Option<u8>,
    /// Chip selects whose R/B# line stays low
    pub busy_chips: u8,
    /// Keep CTRL_STATUS.INIT_COMP clear
    pub hold_init: bool,
    pub ctrl_busy: bool,
    /// READ ID commands that return all zeroes before the chip starts answering
    pub blank_id_reads: u32,
    /// Parameter page copies (from the first) served with a bad CRC
    pub corrupt_param_copies: usize,
    pub dma_map_fails: bool,
}

/// A CDMA command as the simulated controller executed it
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CdmaRecord {
    pub kind: CommandKind,
    pub bank: u8,
    pub page: u32,
    pub ecc: bool,
    pub erase_detect: bool,
    pub transfer: TransferConfig,
    pub status: u32,
}

#[derive(Debug)]
struct SimChip {
    flash: SimFlash,
    id: [u8; 8],
    features: BTreeMap<u8, u8>,
    resets: u32,
}

#[derive(Debug)]
struct SimState {
    config: SimConfig,
    faults: Faults,
    regs: HashMap<u32, u32>,
    writes: HashMap<u32, Vec<u32>>,
    status_reads: u32,
    thread_status: [u32; 4],
    chips: Vec<SimChip>,
    param_stream: Vec<u8>,

    /// Bytes the last generic command left for DATA to stream out
    output: Vec<u8>,
    column: usize,
    sdma: VecDeque<u8>,

    memory: BTreeMap<u64, Vec<u8>>,
    next_dma: u64,
    cdma_log: Vec<CdmaRecord>,

    clocks: BTreeSet<String>,
    reset_pulses: Vec<String>,
    aux: HashMap<(AuxWindow, u32), u32>,
    aux_log: Vec<(AuxWindow, u32, u32)>,
}

/// The simulated platform: controller registers, DMA memory and NAND chips
pub struct SimPlatform {
    state: Mutex<SimState>,
    handler: Mutex<Option<IrqHandler>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl SimPlatform {
    pub fn new(config: SimConfig) -> Self {
        let chips = (0..config.chips)
            .map(|_| SimChip {
                flash: SimFlash::new(config.layout),
                id: config.id,
                features: BTreeMap::new(),
                resets: 0,
            })
            .collect();

        let [bch0, bch1, bch2] = config.bch_registers();
        let layout = config.layout;
        let mut regs = HashMap::new();
        regs.insert(regs::CTRL_FEATURES, config.ctrl_features());
        regs.insert(
            regs::MANUFACTURER_ID,
            regs::MANUFACTURER_ID_MID.put(config.id[0].into())
                | regs::MANUFACTURER_ID_DID.put(config.id[1].into()),
        );
        regs.insert(
            regs::NF_DEV_AREAS,
            regs::NF_DEV_AREAS_MAIN.put(layout.bytes_per_page as u32)
                | regs::NF_DEV_AREAS_SPARE.put(layout.spare_per_page as u32),
        );
        let dev_type = if config.onfi { regs::DEV_TYPE_ONFI } else { 0 };
        regs.insert(
            regs::DEV_PARAMS_0,
            regs::DEV_PARAMS_0_DEV_TYPE.put(dev_type) | regs::DEV_PARAMS_0_NO_OF_LUNS.put(1),
        );
        regs.insert(
            regs::DEV_PARAMS_1,
            regs::DEV_PARAMS_1_READID_5.put(config.readid_5.into()),
        );
        regs.insert(regs::ONFI_TIME_MOD_0, config.onfi_time_mod[0]);
        regs.insert(regs::ONFI_TIME_MOD_1, config.onfi_time_mod[1]);
        regs.insert(regs::BCH_CFG_0, bch0);
        regs.insert(regs::BCH_CFG_1, bch1);
        regs.insert(regs::BCH_CFG_2, bch2);

        let state = SimState {
            param_stream: config.param_stream(),
            config,
            faults: Faults::default(),
            regs,
            writes: HashMap::new(),
            status_reads: 0,
            thread_status: [0; 4],
            chips,
            output: Vec::new(),
            column: 0,
            sdma: VecDeque::new(),
            memory: BTreeMap::new(),
            next_dma: DMA_BASE,
            cdma_log: Vec::new(),
            clocks: BTreeSet::new(),
            reset_pulses: Vec::new(),
            aux: HashMap::new(),
            aux_log: Vec::new(),
        };

        Self {
            state: Mutex::new(state),
            handler: Mutex::new(None),
        }
    }

    pub fn config(&self) -> SimConfig {
        lock(&self.state).config.clone()
    }

    /// Adjust the fault knobs
    pub fn faults(&self, f: impl FnOnce(&mut Faults)) {
        f(&mut lock(&self.state).faults)
    }

    /// Operate on the NAND array of chip select `chip`
    pub fn with_flash<R>(&self, chip: u8, f: impl FnOnce(&mut SimFlash) -> R) -> Option<R> {
        let mut state = lock(&self.state);
        state
            .chips
            .get_mut(usize::from(chip))
            .map(|c| f(&mut c.flash))
    }

    /// Change what chip `chip` answers to READ ID
    pub fn set_chip_id(&self, chip: u8, id: [u8; 8]) {
        if let Some(c) = lock(&self.state).chips.get_mut(usize::from(chip)) {
            c.id = id;
        }
    }

    /// Fill chip `chip` from a raw image (main and spare of every page, in order)
    pub fn load_image<R: Read>(&self, chip: u8, read: &mut R) -> anyhow::Result<()> {
        self.with_flash(chip, |flash| flash.load(read))
            .unwrap_or_else(|| Err(anyhow::anyhow!("no chip {chip}")))
    }

    pub fn save_image<W: Write>(&self, chip: u8, write: &mut W) -> anyhow::Result<()> {
        self.with_flash(chip, |flash| flash.save(write))
            .unwrap_or_else(|| Err(anyhow::anyhow!("no chip {chip}")))
    }

    /// Current register contents, without the side effects of a bus read
    pub fn reg(&self, offset: u32) -> u32 {
        lock(&self.state).regs.get(&offset).copied().unwrap_or(0)
    }

    /// Every value written to the register at `offset`, oldest first
    pub fn writes(&self, offset: u32) -> Vec<u32> {
        lock(&self.state)
            .writes
            .get(&offset)
            .cloned()
            .unwrap_or_default()
    }

    pub fn write_count(&self, offset: u32) -> usize {
        lock(&self.state).writes.get(&offset).map_or(0, Vec::len)
    }

    pub fn cdma_log(&self) -> Vec<CdmaRecord> {
        lock(&self.state).cdma_log.clone()
    }

    pub fn clear_cdma_log(&self) {
        lock(&self.state).cdma_log.clear();
    }

    pub fn feature(&self, chip: u8, addr: u8) -> Option<u8> {
        lock(&self.state)
            .chips
            .get(usize::from(chip))
            .and_then(|c| c.features.get(&addr).copied())
    }

    pub fn reset_count(&self, chip: u8) -> u32 {
        lock(&self.state)
            .chips
            .get(usize::from(chip))
            .map_or(0, |c| c.resets)
    }

    pub fn clock_enabled(&self, name: &str) -> bool {
        lock(&self.state).clocks.contains(name)
    }

    pub fn reset_pulses(&self) -> Vec<String> {
        lock(&self.state).reset_pulses.clone()
    }

    pub fn aux_writes(&self) -> Vec<(AuxWindow, u32, u32)> {
        lock(&self.state).aux_log.clone()
    }

    /// Number of live DMA mappings
    pub fn mapped_regions(&self) -> usize {
        lock(&self.state).memory.len()
    }

    pub fn irq_registered(&self) -> bool {
        lock(&self.handler).is_some()
    }

    fn fire_irq(&self) {
        let handler = lock(&self.handler).clone();
        if let Some(handler) = handler {
            handler();
        }
    }
}

impl SimState {
    fn reg(&self, offset: u32) -> u32 {
        self.regs.get(&offset).copied().unwrap_or(0)
    }

    fn set_bits(&mut self, offset: u32, bits: u32) {
        *self.regs.entry(offset).or_insert(0) |= bits;
    }

    /// Latch interrupt causes; returns whether the line should be raised
    fn raise(&mut self, status: u32, trd_comp: u32, trd_err: u32) -> bool {
        self.set_bits(regs::INTR_STATUS, status);
        self.set_bits(regs::TRD_COMP_INT_STATUS, trd_comp);
        self.set_bits(regs::TRD_ERR_INT_STATUS, trd_err);
        self.irq_line()
    }

    fn irq_line(&self) -> bool {
        let enable = self.reg(regs::INTR_ENABLE);
        enable & regs::INTR_ENABLE_INTR_EN != 0
            && (self.reg(regs::INTR_STATUS) & enable != 0
                || self.reg(regs::TRD_COMP_INT_STATUS) != 0
                || self.reg(regs::TRD_ERR_INT_STATUS) != 0)
    }

    fn read(&mut self, offset: u32) -> u32 {
        let map = self.config.register_map;
        match offset {
            regs::CTRL_STATUS => {
                self.status_reads = self.status_reads.saturating_add(1);
                let mut reg = 0;
                if !self.faults.hold_init && self.status_reads > self.config.init_delay {
                    reg |= regs::CTRL_STATUS_INIT_COMP;
                }
                if self.faults.ctrl_busy {
                    reg |= regs::CTRL_STATUS_CTRL_BUSY;
                }
                reg
            }
            regs::TRD_STATUS => self.faults.stuck_thread.map_or(0, |t| 1 << t),
            regs::CMD_STATUS => {
                let thread = self.reg(regs::CMD_STATUS_PTR) as usize % self.thread_status.len();
                self.thread_status[thread]
            }
            o if o == map.rbn_settings => {
                let present = (1u32 << self.chips.len()) - 1;
                present & !u32::from(self.faults.busy_chips)
            }
            o => self.reg(o),
        }
    }

    /// Handle a register write; returns whether the interrupt line is now raised
    fn write(&mut self, offset: u32, value: u32) -> bool {
        self.writes.entry(offset).or_default().push(value);
        match offset {
            regs::INTR_STATUS | regs::TRD_COMP_INT_STATUS | regs::TRD_ERR_INT_STATUS => {
                let reg = self.regs.entry(offset).or_insert(0);
                *reg &= !value;
                false
            }
            regs::CMD_REG0 => {
                self.regs.insert(offset, value);
                self.execute(value)
            }
            regs::INTR_ENABLE => {
                self.regs.insert(offset, value);
                self.irq_line()
            }
            _ => {
                self.regs.insert(offset, value);
                false
            }
        }
    }

    fn execute(&mut self, reg0: u32) -> bool {
        let thread = command::thread_of(reg0);
        match command::command_type(reg0) {
            regs::CT_PIO => {
                self.pio(reg0, thread);
                false
            }
            regs::CT_GENERIC => self.generic(thread),
            regs::CT_CDMA => self.cdma(thread),
            _ => false,
        }
    }

    fn pio(&mut self, reg0: u32, thread: u8) {
        let reg1 = self.reg(regs::CMD_REG1);
        let bank = regs::CMD_REG1_BANK.get(reg1) as usize;
        let value = self.reg(regs::CMD_REG2) as u8;

        let status = match (command::pio_op_of(reg0), self.chips.get_mut(bank)) {
            (Some(PioOp::Reset), Some(chip)) => {
                chip.resets += 1;
                chip.features.clear();
                CS_COMP
            }
            (Some(PioOp::SetFeatures), Some(chip)) => {
                let addr = regs::CMD_REG1_FADDR.get(reg1) as u8;
                chip.features.insert(addr, value);
                CS_COMP
            }
            _ => CS_COMP | CS_FAIL,
        };
        self.thread_status[usize::from(thread) % 4] = status;
    }

    fn generic(&mut self, thread: u8) -> bool {
        let word = u64::from(self.reg(regs::CMD_REG2)) | u64::from(self.reg(regs::CMD_REG3)) << 32;
        let cmd = DecodedGeneric::decode(word);
        let chip = self.chips.get(usize::from(cmd.chip_select));

        match Instruction::from_raw(cmd.instr) {
            Some(Instruction::ReadId) => {
                self.column = 0;
                self.output = match chip {
                    Some(_) if self.faults.blank_id_reads > 0 => {
                        self.faults.blank_id_reads -= 1;
                        vec![0; 8]
                    }
                    Some(chip) if cmd.addr == 0x00 => chip.id.to_vec(),
                    Some(_) if cmd.addr == 0x20 && self.config.onfi => b"ONFI".to_vec(),
                    _ => vec![0; 8],
                };
                false
            }
            Some(Instruction::ReadParameterPage) => {
                self.column = 0;
                self.output = match chip {
                    Some(_) => {
                        let mut stream = self.param_stream.clone();
                        for copy in 0..self.faults.corrupt_param_copies {
                            if let Some(b) = stream.get_mut(copy * PARAM_PAGE_SIZE + 100) {
                                *b ^= 0x01;
                            }
                        }
                        stream
                    }
                    None => Vec::new(),
                };
                false
            }
            Some(Instruction::ChangeReadColumn) => {
                self.column = cmd.addr as usize;
                false
            }
            Some(Instruction::ReadStatus) => {
                self.column = 0;
                self.output = vec![0xE0];
                false
            }
            Some(Instruction::Data) if cmd.data.direction == Direction::Read => {
                if std::mem::take(&mut self.faults.sdma_error_next) {
                    return self.raise(regs::INTR_SDMA_ERR, 0, 0);
                }

                let len = usize::from(cmd.data.last_sector_size);
                let start = self.column.min(self.output.len());
                let end = (self.column + len).min(self.output.len());
                let mut data = self.output[start..end].to_vec();
                data.resize(len, 0);
                self.column += len;

                let width = if self.config.dma_64bit { 8 } else { 4 };
                let padded = (len + width - 1) / width * width;
                data.resize(padded, 0);
                self.sdma = data.into();
                self.regs.insert(regs::SDMA_SIZE, padded as u32);
                self.regs.insert(
                    regs::SDMA_TRD_NUM,
                    regs::SDMA_TRD_NUM_SDMA_TRD.put(thread.into()),
                );
                self.raise(regs::INTR_SDMA_TRIGG, 0, 0)
            }
            _ => self.raise(regs::INTR_UNSUPP_CMD, 0, 0),
        }
    }

    fn region(&self, addr: u64) -> Option<(u64, usize)> {
        let (&base, mem) = self.memory.range(..=addr).next_back()?;
        let offset = (addr - base) as usize;
        (offset < mem.len()).then_some((base, offset))
    }

    fn dma_read(&self, addr: u64, len: usize) -> Option<Vec<u8>> {
        let (base, offset) = self.region(addr)?;
        let mem = self.memory.get(&base)?;
        mem.get(offset..offset + len).map(<[u8]>::to_vec)
    }

    fn dma_write(&mut self, addr: u64, data: &[u8]) -> bool {
        let Some((base, offset)) = self.region(addr) else {
            return false;
        };
        match self
            .memory
            .get_mut(&base)
            .and_then(|mem| mem.get_mut(offset..offset + data.len()))
        {
            Some(dst) => {
                dst.copy_from_slice(data);
                true
            }
            None => false,
        }
    }

    /// The ECC engine setup ECC_CONFIG_0 selects for a transfer shaped like `cfg`
    fn ecc_mode(&self, cfg: &TransferConfig) -> Option<EccMode> {
        let ecc_cfg = self.reg(regs::ECC_CONFIG_0);
        if ecc_cfg & regs::ECC_CONFIG_0_ECC_EN == 0 {
            return None;
        }

        let bch = &self.config.bch;
        let code = regs::ECC_CONFIG_0_CORR_STR.get(ecc_cfg);
        let corr_cap = bch
            .corr_caps
            .iter()
            .map(|&c| u32::from(c))
            .filter(|&c| c != 0 && (c / 8).saturating_sub(1) == code)
            .max()
            .unwrap_or(8 * (code + 1));

        let sector = if cfg.sector_size != 0 {
            cfg.sector_size
        } else {
            bch.sector_sizes
                .iter()
                .map(|&s| u32::from(s))
                .filter(|&s| s != 0 && s <= cfg.last_sector_size)
                .max()?
        };

        let ecc_bytes = bch.ecc_bytes(sector, corr_cap).ok()?;
        Some(EccMode {
            corr_cap: corr_cap.max(8),
            ecc_bytes,
            erase_detect: ecc_cfg & regs::ECC_CONFIG_0_ERASE_DET_EN != 0,
        })
    }

    fn cdma(&mut self, thread: u8) -> bool {
        if self.faults.stall_completion {
            return false;
        }
        if std::mem::take(&mut self.faults.controller_error_next) {
            return self.raise(regs::INTR_CDMA_TERR, 0, 0);
        }

        let desc_addr =
            u64::from(self.reg(regs::CMD_REG2)) | u64::from(self.reg(regs::CMD_REG3)) << 32;
        let desc = self
            .dma_read(desc_addr, DESCRIPTOR_SIZE)
            .and_then(|bytes| {
                CdmaDescriptor::from_bytes((bytes.as_slice(), 0))
                    .ok()
                    .map(|(_, desc)| desc)
            });
        let Some(desc) = desc else {
            log::error!("simulated CDMA: no descriptor at {desc_addr:#x}");
            return self.raise(regs::INTR_CDMA_TERR, 0, 0);
        };

        let transfer =
            TransferConfig::from_registers(self.reg(regs::TRAN_CFG_0), self.reg(regs::TRAN_CFG_1));
        let ecc = self.ecc_mode(&transfer);
        let bank = desc.bank();
        let page = desc.page();

        let status = if std::mem::take(&mut self.faults.descriptor_error_next) {
            CS_COMP | CS_FAIL | CS_ERR
        } else {
            self.run_descriptor(&desc, &transfer, ecc)
        };

        if let Some(kind) = desc.kind() {
            self.cdma_log.push(CdmaRecord {
                kind,
                bank,
                page,
                ecc: ecc.is_some(),
                erase_detect: ecc.map_or(false, |e| e.erase_detect),
                transfer,
                status,
            });
        }

        self.dma_write(desc_addr + STATUS_OFFSET as u64, &status.to_le_bytes());

        let bit = 1u32 << thread;
        let trd_comp = if desc.command_flags & CF_INT != 0 {
            bit
        } else {
            0
        };
        let trd_err = if status & CS_FAIL != 0 {
            bit & self.reg(regs::TRD_ERR_INT_STATUS_EN)
        } else {
            0
        };
        self.raise(0, trd_comp, trd_err)
    }

    fn run_descriptor(
        &mut self,
        desc: &CdmaDescriptor,
        transfer: &TransferConfig,
        ecc: Option<EccMode>,
    ) -> u32 {
        let bank = usize::from(desc.bank());
        let page = desc.page();
        let len = transfer.byte_count() as usize;

        if bank >= self.chips.len() {
            return CS_COMP | CS_FAIL;
        }

        match desc.kind() {
            Some(CommandKind::Erase) => {
                let chip = &mut self.chips[bank];
                let block = page / chip.flash.layout().pages_per_block;
                if chip.flash.erase_block(block) {
                    CS_COMP
                } else {
                    CS_COMP | CS_FAIL
                }
            }
            Some(CommandKind::Write) => {
                if std::mem::take(&mut self.faults.fail_next_program)
                    || page >= self.config.layout.page_count()
                {
                    return CS_COMP | CS_FAIL;
                }
                let Some(data) = self.dma_read(desc.memory_pointer, len) else {
                    return CS_COMP | CS_FAIL | CS_ERR;
                };
                self.chips[bank].flash.program(page, transfer, ecc, &data);
                CS_COMP
            }
            Some(CommandKind::Read) => {
                let (data, status) = self.chips[bank].flash.read(page, transfer, ecc);
                if self.dma_write(desc.memory_pointer, &data) {
                    status
                } else {
                    CS_COMP | CS_FAIL | CS_ERR
                }
            }
            Some(CommandKind::Reset | CommandKind::CopyBack | CommandKind::Nop) => CS_COMP,
            None => CS_COMP | CS_FAIL | CS_ERR,
        }
    }
}

impl Platform for SimPlatform {
    fn read_reg(&self, offset: u32) -> u32 {
        lock(&self.state).read(offset)
    }

    fn write_reg(&self, offset: u32, value: u32) {
        let fire = lock(&self.state).write(offset, value);
        if fire {
            self.fire_irq();
        }
    }

    fn read_slave_dma(&self) -> u32 {
        let mut state = lock(&self.state);
        let mut word = [0u8; 4];
        for b in word.iter_mut() {
            *b = state.sdma.pop_front().unwrap_or(0);
        }
        u32::from_le_bytes(word)
    }

    fn dma_map(&self, len: usize) -> Result<u64> {
        let mut state = lock(&self.state);
        if state.faults.dma_map_fails {
            return Err(Error::Dma(format!("cannot map {len} bytes")));
        }
        let addr = state.next_dma;
        let span = (len as u64).max(1);
        state.next_dma += (span + DMA_ALIGN - 1) / DMA_ALIGN * DMA_ALIGN;
        state.memory.insert(addr, vec![0; len]);
        Ok(addr)
    }

    fn dma_unmap(&self, addr: u64, _len: usize) {
        lock(&self.state).memory.remove(&addr);
    }

    fn dma_sync_for_device(&self, addr: u64, cpu: &[u8], dir: DmaDirection) {
        if dir.to_device() {
            lock(&self.state).dma_write(addr, cpu);
        }
    }

    fn dma_sync_for_cpu(&self, addr: u64, cpu: &mut [u8], dir: DmaDirection) {
        if dir.from_device() {
            if let Some(data) = lock(&self.state).dma_read(addr, cpu.len()) {
                cpu.copy_from_slice(&data);
            }
        }
    }

    fn request_irq(&self, handler: IrqHandler) -> Result<()> {
        *lock(&self.handler) = Some(handler);
        Ok(())
    }

    fn free_irq(&self) {
        lock(&self.handler).take();
    }

    fn enable_clock(&self, name: &str) -> bool {
        let mut state = lock(&self.state);
        if state.config.clocks.iter().any(|c| c == name) {
            state.clocks.insert(name.to_string());
            true
        } else {
            false
        }
    }

    fn disable_clock(&self, name: &str) {
        lock(&self.state).clocks.remove(name);
    }

    fn pulse_reset(&self, name: &str) -> Result<()> {
        let mut state = lock(&self.state);
        if state.config.resets.iter().any(|r| r == name) {
            state.reset_pulses.push(name.to_string());
        }
        Ok(())
    }

    fn read_aux(&self, window: AuxWindow, offset: u32) -> Result<u32> {
        let state = lock(&self.state);
        if !state.config.fpga {
            return Err(Error::invalid(format!("no {window:?} window")));
        }
        Ok(state.aux.get(&(window, offset)).copied().unwrap_or(0))
    }

    fn write_aux(&self, window: AuxWindow, offset: u32, value: u32) -> Result<()> {
        let mut state = lock(&self.state);
        if !state.config.fpga {
            return Err(Error::invalid(format!("no {window:?} window")));
        }
        state.aux.insert((window, offset), value);
        state.aux_log.push((window, offset, value));
        Ok(())
    }
}

#[cfg(test)]
use crate::command::{GenericData, PioCommand};

#[test]
fn test_w1c_interrupt_status() {
    let sim = SimPlatform::new(SimConfig::default());
    lock(&sim.state).raise(regs::INTR_SDMA_TRIGG | regs::INTR_CDMA_TERR, 0b10, 0);

    sim.write_reg(regs::INTR_STATUS, regs::INTR_SDMA_TRIGG);
    assert_eq!(sim.read_reg(regs::INTR_STATUS), regs::INTR_CDMA_TERR);
    sim.write_reg(regs::TRD_COMP_INT_STATUS, 0b10);
    assert_eq!(sim.read_reg(regs::TRD_COMP_INT_STATUS), 0);
}

#[test]
fn test_init_complete_after_delay() {
    let sim = SimPlatform::new(SimConfig::default());
    let init = |sim: &SimPlatform| sim.read_reg(regs::CTRL_STATUS) & regs::CTRL_STATUS_INIT_COMP;
    assert_eq!(init(&sim), 0);
    assert_eq!(init(&sim), 0);
    assert_ne!(init(&sim), 0);
}

#[test]
fn test_bch_registers_decode() {
    let config = SimConfig::default();
    let sim = SimPlatform::new(config.clone());
    let bch = BchConfig::from_registers(
        sim.read_reg(regs::BCH_CFG_0),
        sim.read_reg(regs::BCH_CFG_1),
        sim.read_reg(regs::BCH_CFG_2),
    );
    assert_eq!(bch, config.bch);
}

#[test]
fn test_pio_reset_and_set_features() {
    let sim = SimPlatform::new(SimConfig::default().with_chips(2));

    sim.write_reg(regs::CMD_REG1, PioCommand::reg1(1, 0));
    sim.write_reg(regs::CMD_REG0, PioCommand::new(PioOp::Reset, 1).encode());
    sim.write_reg(regs::CMD_STATUS_PTR, 1);
    assert_eq!(sim.read_reg(regs::CMD_STATUS), CS_COMP);
    assert_eq!(sim.reset_count(1), 1);

    sim.write_reg(regs::CMD_REG1, PioCommand::reg1(0, 0x01));
    sim.write_reg(regs::CMD_REG2, 0x14);
    sim.write_reg(regs::CMD_REG0, PioCommand::new(PioOp::SetFeatures, 0).encode());
    assert_eq!(sim.feature(0, 0x01), Some(0x14));

    // no chip on bank 3
    sim.write_reg(regs::CMD_REG1, PioCommand::reg1(3, 0));
    sim.write_reg(regs::CMD_REG0, PioCommand::new(PioOp::Reset, 3).encode());
    sim.write_reg(regs::CMD_STATUS_PTR, 3);
    assert_ne!(sim.read_reg(regs::CMD_STATUS) & CS_FAIL, 0);
}

#[test]
fn test_generic_read_id_through_slave_dma() {
    let sim = SimPlatform::new(SimConfig::default());
    let send = |word: u64| {
        let (lo, hi) = command::split(word);
        sim.write_reg(regs::CMD_REG2, lo);
        sim.write_reg(regs::CMD_REG3, hi);
        sim.write_reg(regs::CMD_REG0, command::generic_trigger(0, false));
    };

    send(command::generic_address(Instruction::ReadId, 0, 0x00));
    send(GenericData::read(8).encode(0));
    assert_ne!(sim.reg(regs::INTR_STATUS) & regs::INTR_SDMA_TRIGG, 0);
    assert_eq!(sim.read_reg(regs::SDMA_SIZE), 8);

    let lo = sim.read_slave_dma().to_le_bytes();
    let hi = sim.read_slave_dma().to_le_bytes();
    assert_eq!([lo, hi].concat(), SimConfig::default().id);
}

#[test]
fn test_sdma_size_rounds_to_access_width() {
    let sim = SimPlatform::new(SimConfig::default().with_dma_64bit(true));
    let (lo, hi) = command::split(GenericData::read(4).encode(0));
    sim.write_reg(regs::CMD_REG2, lo);
    sim.write_reg(regs::CMD_REG3, hi);
    sim.write_reg(regs::CMD_REG0, command::generic_trigger(0, false));
    assert_eq!(sim.reg(regs::SDMA_SIZE), 8);
}

#[test]
fn test_dma_memory_sync() {
    let sim = SimPlatform::new(SimConfig::default());
    let a = sim.dma_map(100).unwrap();
    let b = sim.dma_map(10).unwrap();
    assert!(b >= a + 100);

    sim.dma_sync_for_device(a, &[1, 2, 3], DmaDirection::ToDevice);
    let mut back = [0u8; 3];
    sim.dma_sync_for_cpu(a, &mut back, DmaDirection::ToDevice);
    assert_eq!(back, [0, 0, 0]);
    sim.dma_sync_for_cpu(a, &mut back, DmaDirection::FromDevice);
    assert_eq!(back, [1, 2, 3]);

    sim.dma_unmap(a, 100);
    assert_eq!(sim.mapped_regions(), 1);
}

#[test]
fn test_unsupported_generic_instruction() {
    let sim = SimPlatform::new(SimConfig::default());
    sim.write_reg(regs::CMD_REG2, 0x3F);
    sim.write_reg(regs::CMD_REG3, 0);
    sim.write_reg(regs::CMD_REG0, command::generic_trigger(0, false));
    assert_ne!(sim.reg(regs::INTR_STATUS) & regs::INTR_UNSUPP_CMD, 0);
}
