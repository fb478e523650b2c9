//! Tape driver interface.
//!
//! Modeled on the teacher's `src/tape/drive/mod.rs::TapeDriver` trait: one
//! handle per physical device exposing position, label and TOC operations.
//! "on success the device position and state match the operation's name, and
//! on failure the handle is left in an undefined position that the caller
//! must recover from (typically by rewind)".

use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};

use crate::blocked::{BlockDevice, BlockReadError, BlockedReader, BlockedWriter};
use crate::mtio;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TapePosition {
    pub file: u64,
    pub block: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveState {
    Ready,
    NoTape,
    DoorOpen,
}

/// Operations a physical (or simulated) tape drive handle supports, per
/// `spec.md` §4.1. `BlockDevice` provides the block-aligned read/write this
/// trait layers position, label and file-mark semantics on top of.
pub trait TapeDriver: BlockDevice {
    fn status(&mut self) -> Result<DriveState>;
    fn is_loaded(&mut self) -> Result<bool> {
        Ok(matches!(self.status()?, DriveState::Ready))
    }
    fn wait_ready(&mut self, timeout: Duration) -> Result<()> {
        let start = Instant::now();
        loop {
            if self.is_loaded()? {
                return Ok(());
            }
            if start.elapsed() >= timeout {
                bail!("tape not ready after {:?}", timeout);
            }
            std::thread::sleep(Duration::from_millis(200));
        }
    }

    fn rewind(&mut self) -> Result<()>;
    /// Moves to file `n`, counted from BOT (file 0 is the label).
    fn seek_to_file_mark(&mut self, n: u64) -> Result<()>;
    /// Exact block seek; not every device/emulation implements this
    /// precisely.9 step 3's documented fallback.
    fn seek_to_block(&mut self, block: u64) -> Result<()>;
    fn get_position(&mut self) -> Result<TapePosition>;
    fn write_file_mark(&mut self) -> Result<()>;
    fn erase(&mut self) -> Result<()>;
    fn eject(&mut self) -> Result<()>;

    fn write_file(&mut self) -> BlockedWriter<'_, Self>
    where
        Self: Sized,
    {
        BlockedWriter::new(self)
    }

    fn read_file(&mut self) -> BlockedReader<'_, Self>
    where
        Self: Sized,
    {
        BlockedReader::new(self)
    }
}

/// Real SCSI/`st`-driver tape device, driven via `MTIOCTOP`/`MTIOCGET`.
pub struct LinuxTapeDevice {
    file: File,
    block_size: usize,
}

impl LinuxTapeDevice {
    pub fn open(device_path: &Path, block_size: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(device_path)
            .with_context(|| format!("opening tape device {}", device_path.display()))?;
        Ok(Self { file, block_size })
    }

    fn fd(&self) -> std::os::unix::io::RawFd {
        self.file.as_raw_fd()
    }
}

impl BlockDevice for LinuxTapeDevice {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn write_block(&mut self, data: &[u8]) -> std::io::Result<()> {
        use std::io::Write;
        self.file.write_all(data)
    }

    fn write_filemark(&mut self) -> std::io::Result<()> {
        mtio::do_op(self.fd(), mtio::MTWEOF, 1)
            .map_err(|e| std::io::Error::from_raw_os_error(e as i32))
    }

    fn read_block(&mut self, buffer: &mut [u8]) -> Result<(), BlockReadError> {
        use std::io::Read;
        let n = self.file.read(buffer)?;
        if n == 0 {
            return Err(BlockReadError::EndOfFile);
        }
        if n < buffer.len() {
            return Err(BlockReadError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "short block read from tape device",
            )));
        }
        Ok(())
    }
}

impl TapeDriver for LinuxTapeDevice {
    fn status(&mut self) -> Result<DriveState> {
        let st = mtio::get_status(self.fd())?;
        if st.mt_gstat & mtio::GMT_DR_OPEN != 0 {
            return Ok(DriveState::DoorOpen);
        }
        if st.mt_gstat & mtio::GMT_ONLINE == 0 {
            return Ok(DriveState::NoTape);
        }
        Ok(DriveState::Ready)
    }

    fn rewind(&mut self) -> Result<()> {
        mtio::do_op(self.fd(), mtio::MTREW, 1)?;
        Ok(())
    }

    fn seek_to_file_mark(&mut self, n: u64) -> Result<()> {
        self.rewind()?;
        if n > 0 {
            mtio::do_op(self.fd(), mtio::MTFSF, n as i32)?;
        }
        Ok(())
    }

    fn seek_to_block(&mut self, block: u64) -> Result<()> {
        mtio::do_op(self.fd(), mtio::MTSEEK, block as i32)?;
        Ok(())
    }

    fn get_position(&mut self) -> Result<TapePosition> {
        let st = mtio::get_status(self.fd())?;
        Ok(TapePosition {
            file: st.mt_fileno.max(0) as u64,
            block: st.mt_blkno.max(0) as u64,
        })
    }

    fn write_file_mark(&mut self) -> Result<()> {
        Ok(self.write_filemark()?)
    }

    fn erase(&mut self) -> Result<()> {
        mtio::do_op(self.fd(), mtio::MTERASE, 1)?;
        Ok(())
    }

    fn eject(&mut self) -> Result<()> {
        mtio::do_op(self.fd(), mtio::MTOFFL, 1)?;
        Ok(())
    }
}

/// A directory of flat files standing in for tape media, per the teacher's
/// `src/tape/drive/virtual_tape.rs` — used for development without
/// hardware and by this crate's own tests.
pub struct SimulatedTapeDevice {
    base: PathBuf,
    block_size: usize,
    current_file: u64,
    write_buf: Vec<u8>,
    read_cursor: usize,
    read_buf: Option<Vec<u8>>,
    loaded: bool,
}

impl SimulatedTapeDevice {
    pub fn open(base: &Path, block_size: usize) -> Result<Self> {
        std::fs::create_dir_all(base)?;
        Ok(Self {
            base: base.to_owned(),
            block_size,
            current_file: 0,
            write_buf: Vec::new(),
            read_cursor: 0,
            read_buf: None,
            loaded: true,
        })
    }

    fn path_for(&self, file: u64) -> PathBuf {
        self.base.join(format!("file{file}.bin"))
    }

    /// Simulates the drive being emptied — used by restore-wrong-tape tests.
    pub fn set_loaded(&mut self, loaded: bool) {
        self.loaded = loaded;
    }
}

impl BlockDevice for SimulatedTapeDevice {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn write_block(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.write_buf.extend_from_slice(data);
        Ok(())
    }

    fn write_filemark(&mut self) -> std::io::Result<()> {
        std::fs::write(self.path_for(self.current_file), &self.write_buf)?;
        self.write_buf.clear();
        self.current_file += 1;
        Ok(())
    }

    fn read_block(&mut self, buffer: &mut [u8]) -> Result<(), BlockReadError> {
        if self.read_buf.is_none() {
            let path = self.path_for(self.current_file);
            match std::fs::read(&path) {
                Ok(data) => {
                    self.read_buf = Some(data);
                    self.read_cursor = 0;
                }
                Err(_) => return Err(BlockReadError::EndOfStream),
            }
        }
        let data = self.read_buf.as_ref().unwrap();
        if self.read_cursor >= data.len() {
            self.read_buf = None;
            self.current_file += 1;
            return Err(BlockReadError::EndOfFile);
        }
        let end = (self.read_cursor + buffer.len()).min(data.len());
        let n = end - self.read_cursor;
        buffer[..n].copy_from_slice(&data[self.read_cursor..end]);
        self.read_cursor = end;
        Ok(())
    }
}

impl TapeDriver for SimulatedTapeDevice {
    fn status(&mut self) -> Result<DriveState> {
        Ok(if self.loaded {
            DriveState::Ready
        } else {
            DriveState::NoTape
        })
    }

    fn rewind(&mut self) -> Result<()> {
        self.current_file = 0;
        self.read_buf = None;
        self.read_cursor = 0;
        Ok(())
    }

    fn seek_to_file_mark(&mut self, n: u64) -> Result<()> {
        self.rewind()?;
        self.current_file = n;
        Ok(())
    }

    fn seek_to_block(&mut self, _block: u64) -> Result<()> {
        bail!("simulated tape device does not support direct block seek")
    }

    fn get_position(&mut self) -> Result<TapePosition> {
        Ok(TapePosition {
            file: self.current_file,
            block: self.read_cursor as u64 / self.block_size as u64,
        })
    }

    fn write_file_mark(&mut self) -> Result<()> {
        Ok(self.write_filemark()?)
    }

    fn erase(&mut self) -> Result<()> {
        if self.base.exists() {
            std::fs::remove_dir_all(&self.base)?;
            std::fs::create_dir_all(&self.base)?;
        }
        self.current_file = 0;
        Ok(())
    }

    fn eject(&mut self) -> Result<()> {
        self.loaded = false;
        Ok(())
    }
}
