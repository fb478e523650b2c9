//! Block-buffered reader/writer over a tape device.
//!
//! "writes to the device smaller than one block are
//! forbidden" — a `BlockedWriter` aggregates small upstream writes into
//! full `block_size` writes, the same shape as the teacher's
//! `pbs-tape::blocked_writer::BlockedWriter`. Each physical block is
//! prefixed with a 4-byte little-endian payload-length header (instead of
//! the teacher's `#[repr(C)] BlockHeader` + `endian_trait` cast) so a
//! `BlockedReader` can tell padding from data without a side channel.

use std::io;
use std::io::Read as _;

use thiserror::Error;

/// The underlying transport a `BlockedWriter`/`BlockedReader` drives. A real
/// tape device, a plain file, or (in tests) an in-memory buffer can all
/// implement this.
pub trait BlockDevice {
    fn block_size(&self) -> usize;
    /// `data.len()` is always exactly `block_size()`.
    fn write_block(&mut self, data: &[u8]) -> io::Result<()>;
    fn write_filemark(&mut self) -> io::Result<()>;
    /// Fills `buffer` (exactly `block_size()` bytes) or returns
    /// `BlockReadError::EndOfFile` at a filemark / `EndOfStream` at EOM.
    fn read_block(&mut self, buffer: &mut [u8]) -> Result<(), BlockReadError>;
}

#[derive(Debug, Error)]
pub enum BlockReadError {
    #[error("{0}")]
    Io(#[from] io::Error),
    #[error("end of file")]
    EndOfFile,
    #[error("end of data stream")]
    EndOfStream,
}

const HEADER_LEN: usize = 4;

pub struct BlockedWriter<'d, D: BlockDevice> {
    device: &'d mut D,
    buffer: Vec<u8>,
    buffer_pos: usize,
    bytes_written: u64,
    wrote_filemark: bool,
}

impl<'d, D: BlockDevice> BlockedWriter<'d, D> {
    pub fn new(device: &'d mut D) -> Self {
        let block_size = device.block_size();
        Self {
            device,
            buffer: vec![0u8; block_size],
            buffer_pos: HEADER_LEN,
            bytes_written: 0,
            wrote_filemark: false,
        }
    }

    /// Payload bytes written so far (pre-padding) — the post-transform byte
    /// counter of `spec.md` §4.2.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    fn flush_block(&mut self, is_final: bool) -> io::Result<()> {
        let payload_len = (self.buffer_pos - HEADER_LEN) as u32;
        self.buffer[0..HEADER_LEN].copy_from_slice(&payload_len.to_le_bytes());
        if is_final {
            for b in &mut self.buffer[self.buffer_pos..] {
                *b = 0;
            }
        }
        self.device.write_block(&self.buffer)?;
        self.buffer_pos = HEADER_LEN;
        Ok(())
    }

    pub fn write(&mut self, mut data: &[u8]) -> io::Result<usize> {
        let total = data.len();
        while !data.is_empty() {
            let space = self.buffer.len() - self.buffer_pos;
            let take = space.min(data.len());
            self.buffer[self.buffer_pos..self.buffer_pos + take]
                .copy_from_slice(&data[..take]);
            self.buffer_pos += take;
            data = &data[take..];
            if self.buffer_pos == self.buffer.len() {
                self.flush_block(false)?;
            }
        }
        self.bytes_written += total as u64;
        Ok(total)
    }

    /// Flushes any partial final block (zero-padded to `block_size`, per
    /// `spec.md` §4.2) and writes the terminating file mark.
    pub fn finish(mut self) -> io::Result<u64> {
        if self.buffer_pos > HEADER_LEN || self.bytes_written == 0 {
            self.flush_block(true)?;
        }
        self.device.write_filemark()?;
        self.wrote_filemark = true;
        Ok(self.bytes_written)
    }
}

impl<'d, D: BlockDevice> io::Write for BlockedWriter<'d, D> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        BlockedWriter::write(self, buf)
    }
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'d, D: BlockDevice> Drop for BlockedWriter<'d, D> {
    fn drop(&mut self) {
        if !self.wrote_filemark {
            if self.buffer_pos > HEADER_LEN {
                let _ = self.flush_block(true);
            }
            let _ = self.device.write_filemark();
        }
    }
}

pub struct BlockedReader<'d, D: BlockDevice> {
    device: &'d mut D,
    block: Vec<u8>,
    pos: usize,
    len: usize,
    at_eof: bool,
}

impl<'d, D: BlockDevice> BlockedReader<'d, D> {
    pub fn new(device: &'d mut D) -> Self {
        let block_size = device.block_size();
        Self {
            device,
            block: vec![0u8; block_size],
            pos: 0,
            len: 0,
            at_eof: false,
        }
    }

    fn fill(&mut self) -> Result<bool, BlockReadError> {
        match self.device.read_block(&mut self.block) {
            Ok(()) => {
                let payload_len =
                    u32::from_le_bytes(self.block[0..HEADER_LEN].try_into().unwrap()) as usize;
                self.pos = HEADER_LEN;
                self.len = HEADER_LEN + payload_len;
                Ok(true)
            }
            Err(BlockReadError::EndOfFile) => {
                self.at_eof = true;
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    /// Reads the whole file into one buffer; used for label/TOC records
    /// which are small JSON documents.
    pub fn read_to_end(&mut self) -> Result<Vec<u8>, BlockReadError> {
        let mut out = Vec::new();
        loop {
            let mut chunk = [0u8; 65536];
            let n = self.read(&mut chunk).map_err(BlockReadError::Io)?;
            if n == 0 {
                break;
            }
            out.extend_from_slice(&chunk[..n]);
        }
        Ok(out)
    }

    pub fn is_at_eof(&self) -> bool {
        self.at_eof
    }
}

impl<'d, D: BlockDevice> io::Read for BlockedReader<'d, D> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pos >= self.len && !self.at_eof {
            match self.fill() {
                Ok(_) => {}
                Err(BlockReadError::Io(err)) => return Err(err),
                Err(_) => return Err(io::Error::new(io::ErrorKind::Other, "block read error")),
            }
        }
        if self.pos >= self.len {
            return Ok(0);
        }
        let avail = self.len - self.pos;
        let take = avail.min(buf.len());
        buf[..take].copy_from_slice(&self.block[self.pos..self.pos + take]);
        self.pos += take;
        Ok(take)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::io::{Read, Write};

    /// An in-memory device standing in for a drive, for unit tests.
    struct MemDevice {
        block_size: usize,
        blocks: VecDeque<Vec<u8>>,
        written: Vec<Vec<u8>>,
        filemarks: usize,
    }

    impl MemDevice {
        fn new(block_size: usize) -> Self {
            Self {
                block_size,
                blocks: VecDeque::new(),
                written: Vec::new(),
                filemarks: 0,
            }
        }

        fn queue_written_as_input(&mut self) {
            self.blocks = self.written.drain(..).collect();
        }
    }

    impl BlockDevice for MemDevice {
        fn block_size(&self) -> usize {
            self.block_size
        }
        fn write_block(&mut self, data: &[u8]) -> io::Result<()> {
            assert_eq!(data.len(), self.block_size, "block writes must be block-aligned");
            self.written.push(data.to_vec());
            Ok(())
        }
        fn write_filemark(&mut self) -> io::Result<()> {
            self.filemarks += 1;
            Ok(())
        }
        fn read_block(&mut self, buffer: &mut [u8]) -> Result<(), BlockReadError> {
            match self.blocks.pop_front() {
                Some(block) => {
                    buffer.copy_from_slice(&block);
                    Ok(())
                }
                None => Err(BlockReadError::EndOfFile),
            }
        }
    }

    #[test]
    fn never_writes_short_blocks() {
        let mut dev = MemDevice::new(64);
        {
            let mut writer = BlockedWriter::new(&mut dev);
            writer.write_all(b"hello world").unwrap();
            writer.finish().unwrap();
        }
        assert!(dev.written.iter().all(|b| b.len() == 64));
        assert_eq!(dev.filemarks, 1);
    }

    #[test]
    fn round_trips_payload_through_padding() {
        let mut dev = MemDevice::new(32);
        let payload = b"the quick brown fox jumps over the lazy dog";
        {
            let mut writer = BlockedWriter::new(&mut dev);
            writer.write_all(payload).unwrap();
            let n = writer.finish().unwrap();
            assert_eq!(n, payload.len() as u64);
        }
        dev.queue_written_as_input();
        let mut reader = BlockedReader::new(&mut dev);
        let out = reader.read_to_end().unwrap();
        assert_eq!(out, payload);
    }
}
