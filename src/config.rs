//! Probe-time configuration: what a device tree and module parameters would supply.

use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, ensure, Context};

use crate::onfi::ChipGeometry;
use crate::regs::RegisterMap;

/// Bounds on every wait the driver performs
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Timeouts {
    /// Register busy-polls (thread busy, R/B#, controller idle, PIO status)
    pub poll: Duration,
    /// The controller's own initialization after reset
    pub init_complete: Duration,
    /// Each wait for an interrupt
    pub irq: Duration,
    /// Pause between two reads of a polled register
    pub poll_interval: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            poll: Duration::from_secs(1),
            init_complete: Duration::from_secs(10),
            irq: Duration::from_secs(10),
            poll_interval: Duration::from_micros(10),
        }
    }
}

impl Timeouts {
    /// The same timeouts with every limit replaced by `limit`
    pub fn uniform(limit: Duration) -> Self {
        Self {
            poll: limit,
            init_complete: limit,
            irq: limit,
            ..Default::default()
        }
    }
}

/// Driver-wide knobs, given on the command line as `maxchips=N disable_ddr=N`
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct ModuleParams {
    /// Most chip selects to scan; 0 means one
    pub maxchips: u32,
    /// Stay in asynchronous SDR mode instead of switching to the best mode
    pub disable_ddr: bool,
}

impl ModuleParams {
    pub fn chip_limit(&self) -> u32 {
        self.maxchips.max(1)
    }
}

impl FromStr for ModuleParams {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let mut params = Self::default();
        for item in s.split_whitespace() {
            let (key, value) = item
                .split_once('=')
                .with_context(|| format!("expected key=value, got {item:?}"))?;
            let value: u32 = value
                .parse()
                .with_context(|| format!("bad value for {key}"))?;
            match key {
                "maxchips" => params.maxchips = value,
                "disable_ddr" => params.disable_ddr = value != 0,
                _ => bail!("unknown parameter {key:?}"),
            }
        }
        Ok(params)
    }
}

/// Requested hardware ECC: `strength` bits of correction per `step_size` bytes
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct EccRequest {
    pub step_size: u32,
    pub strength: u32,
}

/// Parse strings like "1024/8"
impl FromStr for EccRequest {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let (step, strength) = s.split_once('/').context("expected STEP/STRENGTH")?;
        let step_size: u32 = step.parse()?;
        let strength = strength.parse()?;
        ensure!(step_size.is_power_of_two(), "ECC step size must be a power of two");

        Ok(Self {
            step_size,
            strength,
        })
    }
}

/// Where the SoC integration placed the remappable register block
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub enum RegisterLayout {
    #[default]
    Standard,
    As390Remap,
}

impl RegisterLayout {
    pub fn map(self) -> RegisterMap {
        match self {
            Self::Standard => RegisterMap::STANDARD,
            Self::As390Remap => RegisterMap::AS390_REMAP,
        }
    }
}

impl FromStr for RegisterLayout {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "standard" => Ok(Self::Standard),
            "as390" => Ok(Self::As390Remap),
            _ => bail!("unknown register layout {s:?}, expected standard or as390"),
        }
    }
}

/// Everything a controller instance is probed with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    /// Byte offset where zero-overhead storage ends; pages before it are randomized and
    /// stored without erased-page detection
    pub zos_end: Option<u64>,
    /// ECC to request; defaults to what the parameter page asks for
    pub ecc: Option<EccRequest>,
    pub layout: RegisterLayout,
    /// Program the FPGA prototype's pin mux and pad PHY before anything else
    pub fpga_bringup: bool,
    /// Scramble the zero-overhead region; on unless turned off here or at build time
    pub randomizer: bool,
    /// Geometry to assume when a chip has no valid parameter page
    pub fallback_geometry: Option<ChipGeometry>,
    pub params: ModuleParams,
    pub timeouts: Timeouts,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            zos_end: None,
            ecc: None,
            layout: RegisterLayout::default(),
            fpga_bringup: false,
            randomizer: true,
            fallback_geometry: None,
            params: ModuleParams::default(),
            timeouts: Timeouts::default(),
        }
    }
}

impl DeviceConfig {
    pub fn with_zos_end(mut self, zos_end: u64) -> Self {
        self.zos_end = Some(zos_end);
        self
    }

    pub fn with_ecc(mut self, step_size: u32, strength: u32) -> Self {
        self.ecc = Some(EccRequest {
            step_size,
            strength,
        });
        self
    }

    pub fn with_layout(mut self, layout: RegisterLayout) -> Self {
        self.layout = layout;
        self
    }

    pub fn with_fpga_bringup(mut self, enable: bool) -> Self {
        self.fpga_bringup = enable;
        self
    }

    pub fn with_randomizer(mut self, enable: bool) -> Self {
        self.randomizer = enable;
        self
    }

    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_fallback_geometry(mut self, geometry: ChipGeometry) -> Self {
        self.fallback_geometry = Some(geometry);
        self
    }

    pub fn with_params(mut self, params: ModuleParams) -> Self {
        self.params = params;
        self
    }

    /// First page past the zero-overhead region, given the page size
    pub fn zos_page_end(&self, page_shift: u32) -> u32 {
        self.zos_end.map_or(0, |end| (end >> page_shift) as u32)
    }
}

#[test]
fn test_module_params() {
    let params: ModuleParams = "maxchips=2 disable_ddr=1".parse().unwrap();
    assert_eq!(params.maxchips, 2);
    assert!(params.disable_ddr);

    let params: ModuleParams = "".parse().unwrap();
    assert_eq!(params.chip_limit(), 1);

    assert!("maxchips".parse::<ModuleParams>().is_err());
    assert!("speed=3".parse::<ModuleParams>().is_err());
}

#[test]
fn test_ecc_request() {
    let ecc: EccRequest = "1024/8".parse().unwrap();
    assert_eq!(ecc.step_size, 1024);
    assert_eq!(ecc.strength, 8);
    assert!("1000/8".parse::<EccRequest>().is_err());
    assert!("1024".parse::<EccRequest>().is_err());
}

#[test]
fn test_zos_page_end() {
    let config = DeviceConfig::default().with_zos_end(0x40_0000);
    assert_eq!(config.zos_page_end(12), 0x400);
    assert_eq!(DeviceConfig::default().zos_page_end(12), 0);
}

#[test]
fn test_randomizer_on_by_default() {
    assert!(DeviceConfig::default().randomizer);
    assert!(!DeviceConfig::default().with_randomizer(false).randomizer);
}

#[test]
fn test_register_layout() {
    assert_eq!("standard".parse::<RegisterLayout>().unwrap(), RegisterLayout::Standard);
    assert_eq!("as390".parse::<RegisterLayout>().unwrap(), RegisterLayout::As390Remap);
    assert!("default".parse::<RegisterLayout>().is_err());
}
