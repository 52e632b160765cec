//! Drive a controller from userspace: registers and DMA memory through `/dev/mem`, the
//! interrupt through a UIO device.
//!
//! Bus addresses are assumed to equal physical addresses, and DMA buffers come out of a
//! reserved carve-out that the kernel leaves alone.

use std::ffi::c_void;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::num::NonZeroUsize;
use std::os::fd::AsFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;

use nix::fcntl::OFlag;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};

use super::{AuxWindow, DmaDirection, IrqHandler, Platform};
use crate::{Error, Result};

const PAGE_SIZE: u64 = 4096;

/// Bytes of the slave DMA window that get mapped
const SLAVE_DMA_LEN: usize = 0x1000;

/// How often the interrupt thread checks whether it should stop
const IRQ_POLL_MS: u16 = 100;

/// Physical addresses of everything the controller needs
#[derive(Debug, Clone)]
pub struct DevMemConfig {
    pub regs: u64,
    pub regs_len: usize,
    pub slave_dma: u64,
    /// Reserved memory handed out for descriptors and page buffers
    pub dma_pool: u64,
    pub dma_pool_len: usize,
    /// `/dev/uioN` bound to the controller's interrupt
    pub uio: PathBuf,
    pub emmc_phy: Option<u64>,
    pub peripheral: Option<u64>,
}

/// One `mmap`ed window of physical memory
struct Mapping {
    base: NonNull<c_void>,
    /// Offset of the requested address inside the page-aligned mapping
    skew: usize,
    len: usize,
}

// SAFETY: the mapping is plain device memory, only accessed with volatile operations
unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

impl Mapping {
    fn new(mem: &File, phys: u64, len: usize) -> Result<Self> {
        let aligned = phys & !(PAGE_SIZE - 1);
        let skew = (phys - aligned) as usize;
        let map_len = NonZeroUsize::new(len + skew)
            .ok_or_else(|| Error::invalid(format!("empty window at {phys:#x}")))?;
        let offset = i64::try_from(aligned)
            .map_err(|_| Error::invalid(format!("address {phys:#x} out of range")))?;

        // SAFETY: a fresh shared mapping of a file we hold open; nothing else aliases it
        let base = unsafe {
            mmap(
                None,
                map_len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                mem.as_fd(),
                offset,
            )
        }
        .map_err(|e| Error::io(format!("cannot map {len:#x} bytes at {phys:#x}: {e}")))?;

        log::debug!("mapped {len:#x} bytes at {phys:#x}");
        Ok(Self { base, skew, len })
    }

    fn word(&self, offset: usize) -> Option<*mut u32> {
        if offset % 4 != 0 || offset + 4 > self.len {
            return None;
        }
        // SAFETY: in bounds of the mapping, checked above
        Some(unsafe { self.base.as_ptr().cast::<u8>().add(self.skew + offset) }.cast())
    }

    fn read32(&self, offset: usize) -> u32 {
        match self.word(offset) {
            // SAFETY: aligned and inside the mapping
            Some(ptr) => unsafe { ptr.read_volatile() },
            None => {
                log::error!("read outside window at {offset:#x}");
                0xFFFF_FFFF
            }
        }
    }

    fn write32(&self, offset: usize, value: u32) {
        match self.word(offset) {
            // SAFETY: aligned and inside the mapping
            Some(ptr) => unsafe { ptr.write_volatile(value) },
            None => log::error!("write outside window at {offset:#x}"),
        }
    }

    fn copy_in(&self, offset: usize, data: &[u8]) {
        for (i, b) in data.iter().enumerate().take(self.len.saturating_sub(offset)) {
            // SAFETY: bounded by the mapping length
            unsafe {
                let ptr = self.base.as_ptr().cast::<u8>().add(self.skew + offset + i);
                ptr.write_volatile(*b);
            }
        }
    }

    fn copy_out(&self, offset: usize, data: &mut [u8]) {
        let avail = self.len.saturating_sub(offset);
        for (i, b) in data.iter_mut().enumerate().take(avail) {
            // SAFETY: bounded by the mapping length
            *b = unsafe {
                self.base
                    .as_ptr()
                    .cast::<u8>()
                    .add(self.skew + offset + i)
                    .read_volatile()
            };
        }
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        // SAFETY: unmapping exactly what `mmap` returned
        if let Err(e) = unsafe { munmap(self.base, self.len + self.skew) } {
            log::warn!("munmap failed: {e}");
        }
    }
}

/// Bump allocator over the DMA carve-out; it starts over once every buffer is returned
#[derive(Debug, Default)]
struct Pool {
    next: usize,
    live: usize,
}

struct IrqThread {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// A controller reached through `/dev/mem`
pub struct DevMem {
    config: DevMemConfig,
    regs: Mapping,
    slave_dma: Mapping,
    dma: Mapping,
    emmc_phy: Option<Mapping>,
    peripheral: Option<Mapping>,
    pool: Mutex<Pool>,
    irq: Mutex<Option<IrqThread>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl DevMem {
    pub fn open(config: DevMemConfig) -> Result<Self> {
        Self::open_at(Path::new("/dev/mem"), config)
    }

    pub fn open_at(path: &Path, config: DevMemConfig) -> Result<Self> {
        let mem = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(OFlag::O_SYNC.bits())
            .open(path)
            .map_err(|e| Error::io(format!("cannot open {}: {e}", path.display())))?;

        let optional = |phys: Option<u64>| -> Result<Option<Mapping>> {
            phys.map(|phys| Mapping::new(&mem, phys, PAGE_SIZE as usize))
                .transpose()
        };

        Ok(Self {
            regs: Mapping::new(&mem, config.regs, config.regs_len)?,
            slave_dma: Mapping::new(&mem, config.slave_dma, SLAVE_DMA_LEN)?,
            dma: Mapping::new(&mem, config.dma_pool, config.dma_pool_len)?,
            emmc_phy: optional(config.emmc_phy)?,
            peripheral: optional(config.peripheral)?,
            pool: Mutex::default(),
            irq: Mutex::new(None),
            config,
        })
    }

    fn pool_offset(&self, addr: u64) -> Option<usize> {
        let offset = addr.checked_sub(self.config.dma_pool)? as usize;
        (offset < self.dma.len).then_some(offset)
    }

    fn aux(&self, window: AuxWindow) -> Result<&Mapping> {
        match window {
            AuxWindow::EmmcPhy => self.emmc_phy.as_ref(),
            AuxWindow::Peripheral => self.peripheral.as_ref(),
        }
        .ok_or_else(|| Error::invalid(format!("no {window:?} window configured")))
    }
}

/// Wait for UIO interrupts and run `handler` for each one until `stop` is set
fn irq_loop(mut uio: File, handler: IrqHandler, stop: Arc<AtomicBool>) {
    let unmask = 1u32.to_ne_bytes();
    if let Err(e) = uio.write_all(&unmask) {
        log::error!("cannot enable the UIO interrupt: {e}");
        return;
    }

    while !stop.load(Ordering::Acquire) {
        let ready = {
            let mut fds = [PollFd::new(uio.as_fd(), PollFlags::POLLIN)];
            match poll(&mut fds, PollTimeout::from(IRQ_POLL_MS)) {
                Ok(n) => n > 0,
                Err(nix::errno::Errno::EINTR) => false,
                Err(e) => {
                    log::error!("poll on the UIO device failed: {e}");
                    return;
                }
            }
        };
        if !ready {
            continue;
        }

        let mut count = [0u8; 4];
        if let Err(e) = uio.read_exact(&mut count) {
            log::error!("UIO read failed: {e}");
            return;
        }
        handler();

        if let Err(e) = uio.write_all(&unmask) {
            log::error!("cannot re-enable the UIO interrupt: {e}");
            return;
        }
    }
}

impl Platform for DevMem {
    fn read_reg(&self, offset: u32) -> u32 {
        self.regs.read32(offset as usize)
    }

    fn write_reg(&self, offset: u32, value: u32) {
        self.regs.write32(offset as usize, value)
    }

    fn read_slave_dma(&self) -> u32 {
        self.slave_dma.read32(0)
    }

    fn dma_map(&self, len: usize) -> Result<u64> {
        let mut pool = lock(&self.pool);
        // keep every buffer cache-line aligned
        let start = (pool.next + 63) & !63;
        if start + len > self.dma.len {
            return Err(Error::Dma(format!(
                "{len} bytes do not fit the {:#x} byte DMA pool",
                self.dma.len
            )));
        }

        pool.next = start + len;
        pool.live += 1;
        Ok(self.config.dma_pool + start as u64)
    }

    fn dma_unmap(&self, _addr: u64, _len: usize) {
        let mut pool = lock(&self.pool);
        pool.live = pool.live.saturating_sub(1);
        if pool.live == 0 {
            pool.next = 0;
        }
    }

    fn dma_sync_for_device(&self, addr: u64, cpu: &[u8], dir: DmaDirection) {
        if !dir.to_device() {
            return;
        }
        match self.pool_offset(addr) {
            Some(offset) => self.dma.copy_in(offset, cpu),
            None => log::error!("sync of unknown DMA address {addr:#x}"),
        }
        self.write_barrier();
    }

    fn dma_sync_for_cpu(&self, addr: u64, cpu: &mut [u8], dir: DmaDirection) {
        if !dir.from_device() {
            return;
        }
        self.write_barrier();
        match self.pool_offset(addr) {
            Some(offset) => self.dma.copy_out(offset, cpu),
            None => log::error!("sync of unknown DMA address {addr:#x}"),
        }
    }

    fn request_irq(&self, handler: IrqHandler) -> Result<()> {
        let mut irq = lock(&self.irq);
        if irq.is_some() {
            return Err(Error::invalid("interrupt handler already installed"));
        }

        let uio = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.config.uio)
            .map_err(|e| Error::io(format!("cannot open {}: {e}", self.config.uio.display())))?;

        let stop = Arc::new(AtomicBool::new(false));
        let handle = std::thread::Builder::new()
            .name("hpnfc-irq".into())
            .spawn({
                let stop = Arc::clone(&stop);
                move || irq_loop(uio, handler, stop)
            })
            .map_err(|e| Error::io(format!("cannot start the interrupt thread: {e}")))?;

        *irq = Some(IrqThread { stop, handle });
        Ok(())
    }

    fn free_irq(&self) {
        if let Some(thread) = lock(&self.irq).take() {
            thread.stop.store(true, Ordering::Release);
            if thread.handle.join().is_err() {
                log::error!("interrupt thread panicked");
            }
        }
    }

    fn read_aux(&self, window: AuxWindow, offset: u32) -> Result<u32> {
        Ok(self.aux(window)?.read32(offset as usize))
    }

    fn write_aux(&self, window: AuxWindow, offset: u32, value: u32) -> Result<()> {
        self.aux(window)?.write32(offset as usize, value);
        Ok(())
    }
}

impl Drop for DevMem {
    fn drop(&mut self) {
        self.free_irq();
    }
}
