//! Poke at an HPNFC controller from the command line.
//!
//! Runs against the in-memory simulator (optionally backed by a raw chip image) or, on Linux,
//! against real hardware through `/dev/mem` and a UIO interrupt.

use anyhow::{bail, ensure, Context, Result};
use clap::{Args, Parser, Subcommand};
use log::LevelFilter;
use rand::rngs::SmallRng;
use rand::{RngCore, SeedableRng};

use std::fs::File;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Arc;

use hpnfc::{
    config::{DeviceConfig, EccRequest, ModuleParams, RegisterLayout},
    nand::{EccOps, NandLayout, PageUtil},
    platform::Platform,
    sim::{SimConfig, SimPlatform},
    Controller, Error,
};

#[cfg(target_os = "linux")]
use hpnfc::platform::devmem::{DevMem, DevMemConfig};

fn parse_addr(s: &str) -> Result<u64> {
    match s.strip_prefix("0x") {
        Some(hex) => Ok(u64::from_str_radix(hex, 16)?),
        None => Ok(s.parse()?),
    }
}

/// Physical resources of a real controller
#[cfg(target_os = "linux")]
#[derive(Args, Debug)]
struct HwOptions {
    /// Physical address of the register window
    #[clap(long, value_parser = parse_addr, group = "device", requires_all = ["slave_dma", "dma_pool", "uio"])]
    regs: Option<u64>,

    #[clap(long, value_parser = parse_addr, default_value = "0x10000")]
    regs_len: u64,

    /// Physical address of the slave DMA data window
    #[clap(long, value_parser = parse_addr)]
    slave_dma: Option<u64>,

    /// Physical address of memory reserved for DMA buffers
    #[clap(long, value_parser = parse_addr)]
    dma_pool: Option<u64>,

    #[clap(long, value_parser = parse_addr, default_value = "0x10000")]
    dma_pool_len: u64,

    /// UIO device bound to the controller interrupt
    #[clap(long)]
    uio: Option<PathBuf>,

    /// Physical address of the FPGA prototype's eMMC PHY window
    #[clap(long, value_parser = parse_addr)]
    emmc_phy: Option<u64>,

    /// Physical address of the FPGA prototype's pin-mux window
    #[clap(long, value_parser = parse_addr)]
    peripheral: Option<u64>,
}

#[derive(Args, Debug)]
struct DeviceOptions {
    /// Layout of the NAND to simulate
    #[clap(long, group = "device")]
    sim_layout: Option<NandLayout>,

    /// Raw chip image (main and spare of every page) to load into the simulator
    #[clap(long, requires = "sim_layout")]
    sim_path: Option<PathBuf>,

    /// Write back the chip image when done
    #[clap(long, requires = "sim_path")]
    sim_write: bool,

    #[cfg(target_os = "linux")]
    #[clap(flatten)]
    hw: HwOptions,

    /// Hardware ECC as STEP/STRENGTH, e.g. 1024/8
    #[clap(long)]
    ecc: Option<EccRequest>,

    /// Byte offset where the zero-overhead region ends
    #[clap(long, value_parser = parse_addr)]
    zos_end: Option<u64>,

    /// Store pages in the zero-overhead region unscrambled
    #[clap(long)]
    no_randomizer: bool,

    /// Register layout: standard or as390
    #[clap(long, default_value = "standard")]
    reg_layout: RegisterLayout,

    /// Program the FPGA prototype's pin mux and pad PHY first
    #[clap(long)]
    fpga: bool,

    /// Module parameters, e.g. "maxchips=2 disable_ddr=1"
    #[clap(long, default_value = "")]
    params: ModuleParams,
}

impl DeviceOptions {
    fn device_config(&self) -> DeviceConfig {
        DeviceConfig {
            zos_end: self.zos_end,
            ecc: self.ecc,
            layout: self.reg_layout,
            fpga_bringup: self.fpga,
            randomizer: !self.no_randomizer,
            params: self.params,
            ..Default::default()
        }
    }

    fn open(&self) -> Result<Device> {
        if let Some(layout) = self.sim_layout {
            let sim = Arc::new(SimPlatform::new(
                SimConfig::default()
                    .with_layout(layout)
                    .with_fpga(self.fpga)
                    .with_register_map(self.reg_layout.map()),
            ));
            if let Some(path) = &self.sim_path {
                sim.load_image(0, &mut File::open(path)?)?;
            }

            let ctrl = Controller::probe(Arc::clone(&sim), self.device_config())?;
            return Ok(Device::Sim(ctrl));
        }

        #[cfg(target_os = "linux")]
        {
            let hw = &self.hw;
            let (Some(regs), Some(slave_dma), Some(dma_pool), Some(uio)) =
                (hw.regs, hw.slave_dma, hw.dma_pool, hw.uio.clone())
            else {
                bail!("--regs, --slave-dma, --dma-pool and --uio are all needed");
            };

            let devmem = DevMem::open(DevMemConfig {
                regs,
                regs_len: hw.regs_len.try_into()?,
                slave_dma,
                dma_pool,
                dma_pool_len: hw.dma_pool_len.try_into()?,
                uio,
                emmc_phy: hw.emmc_phy,
                peripheral: hw.peripheral,
            })?;
            let ctrl = Controller::probe(Arc::new(devmem), self.device_config())?;
            Ok(Device::DevMem(ctrl))
        }

        #[cfg(not(target_os = "linux"))]
        bail!("--sim-layout is required")
    }

    fn cleanup(&self, device: Device) -> Result<()> {
        if self.sim_write {
            if let (Some(path), Device::Sim(ctrl)) = (&self.sim_path, &device) {
                ctrl.platform().save_image(0, &mut File::create(path)?)?;
            }
        }

        Ok(())
    }
}

enum Device {
    Sim(Controller<SimPlatform>),

    #[cfg(target_os = "linux")]
    DevMem(Controller<DevMem>),
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Describe the probed chip and the controller setup
    Info,

    /// Read pages and write them to a file (or summarize them)
    Read {
        /// First page to read
        page: u32,

        #[clap(long, default_value_t = 1)]
        count: u32,

        /// Where to write the page data
        #[clap(long)]
        output: Option<PathBuf>,

        /// Read without ECC correction
        #[clap(long)]
        raw: bool,
    },

    /// Program the contents of a file, padded with 0xFF, starting at a page
    Write {
        page: u32,

        path: PathBuf,

        /// Program without check bits
        #[clap(long)]
        raw: bool,
    },

    /// Erase blocks
    Erase {
        block: u32,

        #[clap(long, default_value_t = 1)]
        count: u32,
    },

    /// Print the user spare bytes of a page
    ReadOob { page: u32 },

    /// Fill the user spare bytes of a page with one value
    WriteOob {
        page: u32,

        #[clap(value_parser = parse_addr)]
        fill: u64,
    },

    /// Erase, program with random data and read back a range of blocks
    Verify {
        block: u32,

        #[clap(long, default_value_t = 1)]
        count: u32,

        #[clap(long, default_value_t = 0)]
        seed: u64,
    },
}

impl Command {
    fn execute<P: Platform>(self, ctrl: &mut Controller<P>) -> Result<()> {
        let writesize = ctrl.writesize() as usize;
        let oobsize = ctrl.oobsize() as usize;
        let pages_per_block = ctrl.chip_geometry().pages_per_block;

        match self {
            Command::Info => {
                if let Some(onfi) = ctrl.onfi() {
                    println!("{} {}", onfi.manufacturer(), onfi.model());
                }
                println!("ID: {:02x?} ({:?})", ctrl.id(), ctrl.device_type());
                println!("Chips: {}", ctrl.device_count());
                println!("Layout: {:?}", ctrl.layout());
                println!("ECC: {:?}", ctrl.geometry());
                println!("Interface: {:?}", ctrl.work_mode());
                println!("Zero-overhead pages: {}", ctrl.zos_page_end());
            }

            Command::Read {
                page,
                count,
                output,
                raw,
            } => {
                let mut out = output.map(File::create).transpose()?;
                let mut buf = vec![0u8; writesize];
                let mut oob = vec![0u8; oobsize];

                let rpt = howudoin::new()
                    .label("Reading pages")
                    .set_len(u64::from(count));
                for page in page..page + count {
                    let flips = if raw {
                        ctrl.read_page_raw(&mut buf, Some(&mut oob), page)?;
                        0
                    } else {
                        match ctrl.read_page(&mut buf, Some(&mut oob), page) {
                            Ok(flips) => flips,
                            Err(Error::Uncorrectable(_)) => {
                                rpt.add_info(format!("page {page} is uncorrectable"));
                                continue;
                            }
                            Err(e) => return Err(e.into()),
                        }
                    };

                    match &mut out {
                        Some(file) => file.write_all(&buf)?,
                        None if buf.is_erased() => println!("{page:6}: erased"),
                        None => println!("{page:6}: {flips} bitflips, {:02x?}", &buf[..16]),
                    }
                    rpt.inc();
                }
                rpt.close();
            }

            Command::Write { page, path, raw } => {
                let mut data = Vec::new();
                File::open(path)?.read_to_end(&mut data)?;
                let pages = (data.len() + writesize - 1) / writesize;
                data.resize(pages * writesize, 0xFF);

                let rpt = howudoin::new()
                    .label("Programming pages")
                    .set_len(pages as u64);
                for (chunk, page) in data.chunks(writesize).zip(page..) {
                    if raw {
                        ctrl.write_page_raw(chunk, None, page)?;
                    } else {
                        ctrl.write_page(chunk, None, page)?;
                    }
                    rpt.inc();
                }
                rpt.close();
            }

            Command::Erase { block, count } => {
                let rpt = howudoin::new()
                    .label("Erasing blocks")
                    .set_len(u64::from(count));
                for block in block..block + count {
                    ctrl.erase_block(block * pages_per_block)?;
                    rpt.inc();
                }
                rpt.close();
            }

            Command::ReadOob { page } => {
                let mut oob = vec![0u8; oobsize];
                ctrl.read_oob(&mut oob, page)?;
                println!("{oob:02x?}");
            }

            Command::WriteOob { page, fill } => {
                let fill = u8::try_from(fill).context("fill value must be a byte")?;
                ctrl.write_oob(&vec![fill; oobsize], page)?;
            }

            Command::Verify { block, count, seed } => {
                ensure!(count > 0, "nothing to verify");
                let mut rng = SmallRng::seed_from_u64(seed);
                let mut expected = vec![0u8; writesize];
                let mut buf = vec![0u8; writesize];
                let first = block * pages_per_block;
                let pages = count * pages_per_block;

                let rpt = howudoin::new()
                    .label("Verifying blocks")
                    .set_len(u64::from(count));
                for block in block..block + count {
                    ctrl.erase_block(block * pages_per_block)?;
                    rpt.inc();
                }

                for page in first..first + pages {
                    rng.fill_bytes(&mut expected);
                    ctrl.write_page(&expected, None, page)?;
                }

                let mut rng = SmallRng::seed_from_u64(seed);
                for page in first..first + pages {
                    rng.fill_bytes(&mut expected);
                    ctrl.read_page(&mut buf, None, page)?;
                    if buf != expected {
                        bail!("page {page} reads back different data");
                    }
                }
                rpt.close();

                let stats = ctrl.ecc_stats();
                println!(
                    "{pages} pages verified, {} bits corrected, {} failures",
                    stats.corrected, stats.failed
                );
            }
        };

        Ok(())
    }
}

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Cli {
    /// The controller to use
    #[clap(flatten)]
    device: DeviceOptions,

    /// More log output; repeat for more
    #[clap(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// The command to run against the controller
    #[clap(subcommand)]
    cmd: Command,
}

fn main() -> Result<()> {
    let args = Cli::parse();

    let level = match args.verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    simple_logger::SimpleLogger::new().with_level(level).init()?;
    howudoin::init(howudoin::consumers::TermLine::default());

    let mut device = args.device.open()?;
    match &mut device {
        Device::Sim(ctrl) => args.cmd.execute(ctrl)?,

        #[cfg(target_os = "linux")]
        Device::DevMem(ctrl) => args.cmd.execute(ctrl)?,
    }
    args.device.cleanup(device)?;
    Ok(())
}
