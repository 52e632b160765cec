//! Byte-stream access through generic commands and the slave DMA window, used by the NAND core
//! for identification and status.

use super::Controller;
use crate::command::{self, GenericData, Instruction};
use crate::nand::{LegacyOps, NandCommand};
use crate::platform::Platform;
use crate::regs;
use crate::sync::IrqStatus;
use crate::{Error, Result};

/// Bytes moved per generic transfer when the slave DMA is 64 bits wide
const NARROW_CHUNK: usize = 4;

impl<P: Platform> Controller<P> {
    fn generic_cmd_send(&self, thread: u8, word: u64, interrupt: bool) -> Result<()> {
        self.wait_for_thread(thread)?;

        let (lo, hi) = command::split(word);
        self.write(regs::CMD_REG2, lo);
        self.write(regs::CMD_REG3, hi);
        self.write(regs::CMD_REG0, command::generic_trigger(thread, interrupt));
        Ok(())
    }

    /// Issue an addressed instruction on the selected chip and wait for it to leave the thread
    fn generic_cmd_command(&self, instr: Instruction, addr: u64) -> Result<()> {
        let thread = self.chip_nr;
        self.generic_cmd_send(
            thread,
            command::generic_address(instr, self.chip_nr, addr),
            false,
        )?;
        self.wait_for_thread(thread)
    }

    fn generic_cmd_data(&self, data: &GenericData) -> Result<()> {
        self.generic_cmd_send(self.chip_nr, data.encode(self.chip_nr), false)
    }

    /// Wait for the controller to offer data on the slave DMA window.
    ///
    /// Returns the thread that owns the data and the number of bytes available.
    fn wait_on_sdma_trigg(&self) -> Result<(u8, usize)> {
        let mask = IrqStatus {
            status: regs::INTR_SDMA_TRIGG | regs::INTR_SDMA_ERR | regs::INTR_UNSUPP_CMD,
            ..Default::default()
        };
        let status = self.wait_for_irq(&mask);

        if status.is_empty() {
            log::error!("Timeout while waiting for SDMA");
            return Err(Error::Timeout("slave DMA"));
        }
        if status.status & regs::INTR_SDMA_TRIGG == 0 {
            log::error!("SDMA error - irq_status {:#x}", status.status);
            return Err(Error::io("slave DMA transfer failed"));
        }

        let size = self.read(regs::SDMA_SIZE) as usize;
        let thread = regs::SDMA_TRD_NUM_SDMA_TRD.get(self.read(regs::SDMA_TRD_NUM)) as u8;
        Ok((thread, size))
    }

    /// Drain `size` bytes from the slave DMA window
    fn dma_read_data(&self, size: usize) -> Result<Vec<u8>> {
        if size % 4 != 0 {
            return Err(Error::io(format!("slave DMA size {size} is not word aligned")));
        }

        Ok((0..size / 4)
            .flat_map(|_| self.hw.read_slave_dma().to_le_bytes())
            .collect())
    }

    /// One generic read of `len` bytes at the current column
    fn generic_read(&self, len: usize) -> Result<Vec<u8>> {
        let len16 = u16::try_from(len)
            .map_err(|_| Error::invalid(format!("{len} bytes is too long for one transfer")))?;

        self.generic_cmd_data(&GenericData::read(len16))?;
        let (_, size) = self.wait_on_sdma_trigg()?;
        let mut data = self.dma_read_data(size)?;
        data.truncate(len);
        Ok(data)
    }

    pub(super) fn reset_buf(&mut self) {
        self.legacy.buf.clear();
        self.legacy.head = 0;
    }

    pub(super) fn next_byte(&mut self) -> u8 {
        match self.legacy.buf.get(self.legacy.head) {
            Some(&b) => {
                self.legacy.head += 1;
                b
            }
            None => 0xFF,
        }
    }

    /// READ ID at `addr`, appending `size` bytes to the byte-stream buffer
    pub(super) fn read_id(&mut self, addr: u8, size: u16) -> Result<()> {
        self.generic_cmd_command(Instruction::ReadId, addr.into())?;
        self.wait_for_rb_ready()?;

        self.generic_cmd_data(&GenericData::read(size))?;
        let (_, sdma_size) = self.wait_on_sdma_trigg()?;
        let data = self.dma_read_data(sdma_size)?;
        self.legacy.buf.extend_from_slice(&data);
        Ok(())
    }

    /// Read `size` bytes of the parameter page into the byte-stream buffer
    pub(super) fn read_parameter_page(&mut self, size: u16) -> Result<()> {
        self.generic_cmd_command(Instruction::ReadParameterPage, 0)?;
        self.wait_for_rb_ready()?;

        if self.dma_width != 8 {
            let data = self.generic_read(size.into())?;
            self.legacy.buf.extend_from_slice(&data);
            return Ok(());
        }

        // a 64-bit slave DMA cannot move the page in one go; step the column instead
        let mut offset = 0;
        while offset < usize::from(size) {
            let data = self.generic_read(NARROW_CHUNK)?;
            self.legacy.buf.extend_from_slice(&data);
            offset += NARROW_CHUNK;

            self.generic_cmd_command(Instruction::ChangeReadColumn, offset as u64)?;
            self.wait_for_rb_ready()?;
        }
        Ok(())
    }

    fn read_stream(&mut self, buf: &mut [u8]) -> Result<()> {
        if self.dma_width != 8 {
            self.wait_for_rb_ready()?;
            let data = self.generic_read(buf.len())?;
            buf[..data.len()].copy_from_slice(&data);
            self.legacy.offset += buf.len() as u32;
            return Ok(());
        }

        for chunk in buf.chunks_mut(NARROW_CHUNK) {
            self.generic_cmd_command(Instruction::ChangeReadColumn, self.legacy.offset.into())?;
            self.wait_for_rb_ready()?;
            let data = self.generic_read(NARROW_CHUNK)?;
            let len = chunk.len().min(data.len());
            chunk[..len].copy_from_slice(&data[..len]);
            self.legacy.offset += chunk.len() as u32;
        }
        Ok(())
    }
}

impl<P: Platform> LegacyOps for Controller<P> {
    fn select_chip(&mut self, chip: Option<u8>) {
        if let Some(chip) = chip {
            self.chip_nr = chip;
        }
    }

    fn cmdfunc(&mut self, cmd: u8, col: i32, _page: i32) {
        self.legacy.offset = 0;

        let result = match NandCommand::try_from(cmd) {
            Ok(NandCommand::Status) => {
                self.reset_buf();
                let ready = (self.read(self.map.rbn_settings) >> self.chip_nr) & 1 != 0;
                self.legacy.buf.extend_from_slice(&[if ready { 0xE0 } else { 0x80 }]);
                Ok(())
            }
            Ok(NandCommand::ReadId) => {
                self.reset_buf();
                self.read_id(col.max(0) as u8, 8)
            }
            Ok(NandCommand::Param) => {
                self.reset_buf();
                self.read_parameter_page(4096)
            }
            Ok(NandCommand::RndOut) => {
                self.legacy.offset = col.max(0) as u32;
                Ok(())
            }
            Ok(
                NandCommand::Read0
                | NandCommand::SeqIn
                | NandCommand::Reset
                | NandCommand::ReadOob
                | NandCommand::PageProg,
            ) => Ok(()),
            Ok(_) | Err(_) => {
                log::warn!("unsupported command received {cmd:#04x}");
                Ok(())
            }
        };

        if let Err(e) = result {
            log::error!("command {cmd:#04x} failed: {e}");
        }
    }

    fn read_byte(&mut self) -> u8 {
        self.next_byte()
    }

    fn read_buf(&mut self, buf: &mut [u8]) {
        if let Err(e) = self.read_stream(buf) {
            log::error!("read_buf of {} bytes failed: {e}", buf.len());
        }
    }

    fn waitfunc(&mut self) -> u8 {
        match self.wait_for_rb_ready() {
            Ok(()) => 0xE0,
            Err(_) => 0x01,
        }
    }
}
