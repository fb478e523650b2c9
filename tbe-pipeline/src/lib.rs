//! Pipeline Builder.
//!
//! Builds the write-side (backup) and read-side (restore) stream chain for
//! a `PipelineKind`: compress-then-encrypt on the way to tape, decrypt-then-
//! decompress on the way back. One dispatch point keyed on `PipelineKind`
//! replaces four near-duplicated code paths, per Design Note §9.

mod compress;
mod counting;
mod crypt;

pub use counting::{CountingReader, CountingWriter};
pub use crypt::{CryptReader, CryptWriter};

use std::io::{Read, Write};

use anyhow::Result;
use tbe_types::PipelineKind;

/// Builds the write side of a backup pipeline: caller writes plaintext tar
/// data in, `sink` receives the final on-tape bytes.
///
/// `passphrase` must be `Some` whenever `kind.encrypts()` is true.
pub fn build_writer<'a, W: Write + 'a>(
    sink: W,
    kind: PipelineKind,
    passphrase: Option<&[u8]>,
) -> Result<Box<dyn Write + 'a>> {
    let after_encrypt: Box<dyn Write + 'a> = if kind.encrypts() {
        let passphrase = passphrase.ok_or_else(|| {
            anyhow::anyhow!("pipeline requires a passphrase but none was supplied")
        })?;
        Box::new(CryptWriter::new(sink, passphrase)?)
    } else {
        Box::new(sink)
    };
    let compression = match kind {
        PipelineKind::Compress(c) | PipelineKind::CompressEncrypt(c) => c,
        PipelineKind::Plain | PipelineKind::Encrypt => tbe_types::Compression::None,
    };
    compress::wrap_writer(after_encrypt, compression)
}

/// Builds the read side of a restore pipeline: caller reads plaintext tar
/// data out, `source` supplies the bytes as stored on tape.
pub fn build_reader<'a, R: Read + 'a>(
    source: R,
    kind: PipelineKind,
    passphrase: Option<&[u8]>,
) -> Result<Box<dyn Read + 'a>> {
    let compression = match kind {
        PipelineKind::Compress(c) | PipelineKind::CompressEncrypt(c) => c,
        PipelineKind::Plain | PipelineKind::Encrypt => tbe_types::Compression::None,
    };
    let after_decrypt: Box<dyn Read + 'a> = if kind.encrypts() {
        let passphrase = passphrase.ok_or_else(|| {
            anyhow::anyhow!("pipeline requires a passphrase but none was supplied")
        })?;
        Box::new(CryptReader::new(source, passphrase)?)
    } else {
        Box::new(source)
    };
    compress::wrap_reader(after_decrypt, compression)
}
