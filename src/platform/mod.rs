//! What the driver needs from the system it runs on: register windows, DMA-able memory, an
//! interrupt line and (optionally) clocks and resets.

use std::sync::Arc;

use crate::{Error, Result};

#[cfg(target_os = "linux")]
pub mod devmem;

/// Result of running an interrupt handler on a (possibly shared) line
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum IrqReturn {
    None,
    Handled,
}

/// The controller's interrupt handler, installed with [`Platform::request_irq`]
pub type IrqHandler = Arc<dyn Fn() -> IrqReturn + Send + Sync>;

/// Which side of a streaming mapping owns the buffer next
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DmaDirection {
    ToDevice,
    FromDevice,
    Bidirectional,
}

impl DmaDirection {
    pub fn to_device(self) -> bool {
        matches!(self, Self::ToDevice | Self::Bidirectional)
    }

    pub fn from_device(self) -> bool {
        matches!(self, Self::FromDevice | Self::Bidirectional)
    }
}

/// Extra register windows only present on FPGA prototypes
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum AuxWindow {
    /// eMMC PHY pads, borrowed to drive the NAND pins
    EmmcPhy,
    /// Peripheral pin-mux select
    Peripheral,
}

/// Everything the controller driver touches outside its own state.
///
/// Register accessors take `&self`: MMIO has no Rust-visible state and the interrupt handler
/// reads registers concurrently with the thread issuing commands.
pub trait Platform: Send + Sync + 'static {
    /// 32-bit read from the controller register window
    fn read_reg(&self, offset: u32) -> u32;

    /// 32-bit write to the controller register window
    fn write_reg(&self, offset: u32, value: u32);

    /// One 32-bit access to the slave DMA data window
    fn read_slave_dma(&self) -> u32;

    /// Allocate `len` bytes the controller can master, returning the bus address
    fn dma_map(&self, len: usize) -> Result<u64>;

    fn dma_unmap(&self, addr: u64, len: usize);

    /// Hand `cpu` over to the device at bus address `addr`
    fn dma_sync_for_device(&self, addr: u64, cpu: &[u8], dir: DmaDirection);

    /// Take the buffer at bus address `addr` back from the device into `cpu`
    fn dma_sync_for_cpu(&self, addr: u64, cpu: &mut [u8], dir: DmaDirection);

    /// Install the handler for the controller's interrupt line
    fn request_irq(&self, handler: IrqHandler) -> Result<()>;

    fn free_irq(&self);

    /// Order all earlier memory writes before any later register write
    fn write_barrier(&self) {
        std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
    }

    /// Enable the named clock; returns false if the platform has no such clock
    fn enable_clock(&self, _name: &str) -> bool {
        false
    }

    fn disable_clock(&self, _name: &str) {}

    /// Assert then deassert the named reset line, if present
    fn pulse_reset(&self, _name: &str) -> Result<()> {
        Ok(())
    }

    fn read_aux(&self, window: AuxWindow, offset: u32) -> Result<u32> {
        Err(Error::invalid(format!(
            "no {window:?} window to read at {offset:#x}"
        )))
    }

    fn write_aux(&self, window: AuxWindow, offset: u32, _value: u32) -> Result<()> {
        Err(Error::invalid(format!(
            "no {window:?} window to write at {offset:#x}"
        )))
    }
}

/// A CPU-side buffer paired with its streaming DMA mapping
#[derive(Debug)]
pub struct DmaBuffer {
    addr: u64,
    data: Vec<u8>,
}

impl DmaBuffer {
    /// Allocate and map a zeroed buffer of `len` bytes
    pub fn new<P: Platform + ?Sized>(hw: &P, len: usize) -> Result<Self> {
        let addr = hw.dma_map(len)?;
        Ok(Self {
            addr,
            data: vec![0; len],
        })
    }

    pub fn bus_addr(&self) -> u64 {
        self.addr
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn sync_for_device<P: Platform + ?Sized>(&self, hw: &P, dir: DmaDirection) {
        hw.dma_sync_for_device(self.addr, &self.data, dir);
    }

    pub fn sync_for_cpu<P: Platform + ?Sized>(&mut self, hw: &P, dir: DmaDirection) {
        hw.dma_sync_for_cpu(self.addr, &mut self.data, dir);
    }

    /// Drop the mapping; the buffer must not be handed to the device again
    pub fn unmap<P: Platform + ?Sized>(self, hw: &P) {
        hw.dma_unmap(self.addr, self.data.len());
    }
}
