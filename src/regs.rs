//! HPNFC register map: offsets, bit fields and the remappable PHY block.
//!
//! Every multi-bit field is described by a [`Field`] holding its shift and unshifted mask, so
//! reading and writing fields never repeats the shift/mask arithmetic at the call site.

/// A bit field inside a 32-bit register
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Field {
    pub shift: u32,
    pub mask: u32,
}

impl Field {
    pub const fn new(shift: u32, width: u32) -> Self {
        let mask = if width >= 32 {
            u32::MAX
        } else {
            (1 << width) - 1
        };
        Self { shift, mask }
    }

    /// Extract this field from a register value
    pub const fn get(self, reg: u32) -> u32 {
        (reg >> self.shift) & self.mask
    }

    /// Place `value` into this field's position (other bits zero)
    pub const fn put(self, value: u32) -> u32 {
        (value & self.mask) << self.shift
    }

    /// Replace this field within `reg`
    pub const fn set(self, reg: u32, value: u32) -> u32 {
        (reg & !(self.mask << self.shift)) | self.put(value)
    }
}

pub const fn bit(n: u32) -> u32 {
    1 << n
}

// Command registers
pub const CMD_REG0: u32 = 0x0000;
pub const CMD_REG0_CT: Field = Field::new(30, 2);
pub const CMD_REG0_TN: Field = Field::new(24, 2);
pub const CMD_REG0_INT: Field = Field::new(20, 1);
pub const CMD_REG0_VOL_ID: Field = Field::new(16, 4);
pub const CMD_REG0_PIO_CC: Field = Field::new(0, 16);

pub const CT_CDMA: u32 = 0;
pub const CT_PIO: u32 = 1;
pub const CT_RESET: u32 = 2;
pub const CT_GENERIC: u32 = 3;

pub const CMD_REG1: u32 = 0x0004;
pub const CMD_REG1_BANK: Field = Field::new(24, 2);
pub const CMD_REG1_FADDR: Field = Field::new(0, 8);

pub const CMD_REG2: u32 = 0x0008;
pub const CMD_REG3: u32 = 0x000C;
pub const CMD_STATUS_PTR: u32 = 0x0010;
pub const CMD_STATUS: u32 = 0x0014;

pub const CMD_STATUS_COMP: u32 = bit(15);
pub const CMD_STATUS_FAIL: u32 = bit(14);

// Interrupts
pub const INTR_STATUS: u32 = 0x0110;
pub const INTR_SDMA_ERR: u32 = bit(22);
pub const INTR_SDMA_TRIGG: u32 = bit(21);
pub const INTR_UNSUPP_CMD: u32 = bit(19);
pub const INTR_DDMA_TERR: u32 = bit(18);
pub const INTR_CDMA_TERR: u32 = bit(17);
pub const INTR_CDMA_IDLE: u32 = bit(16);

pub const INTR_ENABLE: u32 = 0x0114;
pub const INTR_ENABLE_INTR_EN: u32 = bit(31);
pub const INTR_ENABLE_SDMA_ERR_EN: u32 = bit(22);
pub const INTR_ENABLE_SDMA_TRIGG_EN: u32 = bit(21);
pub const INTR_ENABLE_UNSUPP_CMD_EN: u32 = bit(19);
pub const INTR_ENABLE_DDMA_TERR_EN: u32 = bit(18);
pub const INTR_ENABLE_CDMA_TERR_EN: u32 = bit(17);

pub const CTRL_STATUS: u32 = 0x0118;
pub const CTRL_STATUS_INIT_COMP: u32 = bit(9);
pub const CTRL_STATUS_CTRL_BUSY: u32 = bit(8);

pub const TRD_STATUS: u32 = 0x0120;
pub const TRD_ERR_INT_STATUS: u32 = 0x0128;
pub const TRD_ERR_INT_STATUS_EN: u32 = 0x0130;
pub const TRD_COMP_INT_STATUS: u32 = 0x0138;

// Transfer configuration
pub const TRAN_CFG_0: u32 = 0x0400;
pub const TRAN_CFG_0_OFFSET: Field = Field::new(16, 16);
pub const TRAN_CFG_0_SEC_CNT: Field = Field::new(0, 8);

pub const TRAN_CFG_1: u32 = 0x0404;
pub const TRAN_CFG_1_LAST_SEC_SIZE: Field = Field::new(16, 16);
pub const TRAN_CFG_1_SECTOR_SIZE: Field = Field::new(0, 16);

pub const NF_DEV_LAYOUT: u32 = 0x0424;

pub const ECC_CONFIG_0: u32 = 0x0428;
pub const ECC_CONFIG_0_CORR_STR: Field = Field::new(8, 2);
pub const ECC_CONFIG_0_SCRAMBLER_EN: u32 = bit(2);
pub const ECC_CONFIG_0_ERASE_DET_EN: u32 = bit(1);
pub const ECC_CONFIG_0_ECC_EN: u32 = bit(0);

pub const ECC_CONFIG_1: u32 = 0x042C;

pub const MULTIPLANE_CFG: u32 = 0x0434;
pub const CACHE_CFG: u32 = 0x0438;
pub const DMA_SETTINGS: u32 = 0x043C;
pub const SDMA_SIZE: u32 = 0x0440;
pub const SDMA_TRD_NUM: u32 = 0x0444;
pub const SDMA_TRD_NUM_SDMA_TRD: Field = Field::new(0, 2);

// Controller and device parameters
pub const CTRL_FEATURES: u32 = 0x0804;
pub const CTRL_FEATURES_N_THREADS: Field = Field::new(0, 3);
pub const CTRL_FEATURES_DMA_DWITH64: u32 = bit(21);
pub const CTRL_FEATURES_N_BANKS: Field = Field::new(24, 2);
pub const CTRL_FEATURES_ASYNC: u32 = bit(26);
pub const CTRL_FEATURES_NVDDR: u32 = bit(27);
pub const CTRL_FEATURES_NVDDR_2_3: u32 = bit(28);

pub const MANUFACTURER_ID: u32 = 0x0808;
pub const MANUFACTURER_ID_DID: Field = Field::new(16, 16);
pub const MANUFACTURER_ID_MID: Field = Field::new(0, 16);

pub const NF_DEV_AREAS: u32 = 0x080C;
pub const NF_DEV_AREAS_SPARE: Field = Field::new(16, 16);
pub const NF_DEV_AREAS_MAIN: Field = Field::new(0, 16);

pub const DEV_PARAMS_0: u32 = 0x0810;
pub const DEV_PARAMS_0_DEV_TYPE: Field = Field::new(30, 2);
pub const DEV_PARAMS_0_NO_OF_LUNS: Field = Field::new(0, 8);
pub const DEV_TYPE_ONFI: u32 = 1;
pub const DEV_TYPE_JEDEC: u32 = 2;

pub const DEV_PARAMS_1: u32 = 0x0814;
pub const DEV_PARAMS_1_READID_5: Field = Field::new(16, 8);

pub const ONFI_TIME_MOD_0: u32 = 0x0824;
pub const ONFI_TIME_MOD_0_SDR: Field = Field::new(0, 16);
pub const ONFI_TIME_MOD_0_DDR: Field = Field::new(16, 16);

pub const ONFI_TIME_MOD_1: u32 = 0x0828;
pub const ONFI_TIME_MOD_1_DDR2: Field = Field::new(0, 16);
pub const ONFI_TIME_MOD_1_DDR3: Field = Field::new(16, 16);

pub const BCH_CFG_0: u32 = 0x0838;
pub const BCH_CFG_1: u32 = 0x083C;
pub const BCH_CFG_2: u32 = 0x0840;
pub const BCH_CFG_2_SECT_0: Field = Field::new(0, 16);
pub const BCH_CFG_2_SECT_1: Field = Field::new(16, 16);

/// One correction capability per byte in `BCH_CFG_0` and `BCH_CFG_1`
pub const fn bch_corr_cap(index: u32) -> Field {
    Field::new((index % 4) * 8, 8)
}

// Timing registers (never remapped)
pub const TIMINGS0: u32 = 0x1024;
pub const TIMINGS0_TADL: Field = Field::new(24, 8);
pub const TIMINGS0_TCCS: Field = Field::new(16, 8);
pub const TIMINGS0_TWHR: Field = Field::new(8, 8);
pub const TIMINGS0_TRHW: Field = Field::new(0, 8);

pub const TIMINGS1: u32 = 0x1028;
pub const TIMINGS1_TRHZ: Field = Field::new(24, 8);
pub const TIMINGS1_TWB: Field = Field::new(16, 8);
pub const TIMINGS1_TCWAW: Field = Field::new(8, 8);
pub const TIMINGS1_TVDLY: Field = Field::new(0, 8);

pub const TIMINGS2: u32 = 0x102C;
pub const TIMINGS2_TFEAT: Field = Field::new(16, 10);
pub const TIMINGS2_CS_HOLD_TIME: Field = Field::new(8, 6);
pub const TIMINGS2_CS_SETUP_TIME: Field = Field::new(0, 6);

// Fields of registers in the remappable block
pub const COMMON_SETT_OPR_MODE: Field = Field::new(0, 2);
pub const OPR_MODE_SDR: u32 = 0;
pub const OPR_MODE_NV_DDR: u32 = 1;
pub const OPR_MODE_TOGGLE: u32 = 2;

pub const ASYNC_TOGGLE_TIMINGS_TRH: Field = Field::new(24, 5);
pub const ASYNC_TOGGLE_TIMINGS_TRP: Field = Field::new(16, 5);
pub const ASYNC_TOGGLE_TIMINGS_TWH: Field = Field::new(8, 5);
pub const ASYNC_TOGGLE_TIMINGS_TWP: Field = Field::new(0, 5);

pub const DLL_PHY_CTRL_DLL_RST_N: u32 = bit(24);
pub const DLL_PHY_CTRL_EXTENDED_WR_MODE: u32 = bit(17);
pub const DLL_PHY_CTRL_EXTENDED_RD_MODE: u32 = bit(16);

pub const PHY_CTRL_PHONY_DQS: Field = Field::new(4, 5);

/// Offsets of the registers whose location depends on the SoC integration
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RegisterMap {
    pub rbn_settings: u32,
    pub common_sett: u32,
    pub async_toggle_timings: u32,
    pub dll_phy_ctrl: u32,
    pub phy_dq_timing: u32,
    pub phy_dqs_timing: u32,
    pub phy_gate_lpbk_ctrl: u32,
    pub phy_dll_master_ctrl: u32,
    pub phy_dll_slave_ctrl: u32,
    pub phy_ctrl: u32,
    pub phy_tsel: u32,
}

impl RegisterMap {
    pub const STANDARD: Self = Self {
        rbn_settings: 0x1004,
        common_sett: 0x1008,
        async_toggle_timings: 0x101C,
        dll_phy_ctrl: 0x1034,
        phy_dq_timing: 0x2000,
        phy_dqs_timing: 0x2004,
        phy_gate_lpbk_ctrl: 0x2008,
        phy_dll_master_ctrl: 0x200C,
        phy_dll_slave_ctrl: 0x2010,
        phy_ctrl: 0x2080,
        phy_tsel: 0x2084,
    };

    /// Layout used by the AS390 integration, which moves the PHY block down
    pub const AS390_REMAP: Self = Self {
        rbn_settings: 0x0904,
        common_sett: 0x0908,
        async_toggle_timings: 0x091C,
        dll_phy_ctrl: 0x0934,
        phy_dq_timing: 0x0A00,
        phy_dqs_timing: 0x0A04,
        phy_gate_lpbk_ctrl: 0x0A08,
        phy_dll_master_ctrl: 0x0A0C,
        phy_dll_slave_ctrl: 0x0A10,
        phy_ctrl: 0x0A80,
        phy_tsel: 0x0A84,
    };
}

impl Default for RegisterMap {
    fn default() -> Self {
        Self::STANDARD
    }
}

#[test]
fn test_field_roundtrip() {
    assert_eq!(CMD_REG0_CT.put(CT_GENERIC), 0xC000_0000);
    assert_eq!(CMD_REG0_TN.get(0x0300_0000), 3);
    assert_eq!(TRAN_CFG_0_OFFSET.set(0xFFFF_00FF, 0x1234), 0x1234_00FF);
    assert_eq!(TIMINGS2_TFEAT.put(0xFFFF), 0x3FF << 16);
    assert_eq!(bch_corr_cap(5).get(0x0018_0800), 0x08);
    assert_eq!(Field::new(0, 32).get(0xDEAD_BEEF), 0xDEAD_BEEF);
}
