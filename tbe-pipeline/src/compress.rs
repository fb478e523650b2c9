//! Compression stage.
//!
//! Grounded on the teacher's `pbs-datastore::data_blob` use of
//! `zstd::stream::write::Encoder`/`read::Decoder`; gzip support added from
//! the same Cargo.toml's `flate2` dependency for sources that prefer it.
//! `Compression::Lto` means "let the drive's hardware compressor handle
//! it" — this stage is a pass-through for that variant, per `spec.md`
//! §4.2's note that software and hardware compression are mutually
//! exclusive.

use std::io::{Read, Write};

use anyhow::Result;
use tbe_types::Compression;

const ZSTD_LEVEL: i32 = 3;

pub fn wrap_writer<'a, W: Write + 'a>(inner: W, compression: Compression) -> Result<Box<dyn Write + 'a>> {
    match compression {
        Compression::None | Compression::Lto => Ok(Box::new(inner)),
        Compression::Zstd => {
            let encoder = zstd::stream::write::Encoder::new(inner, ZSTD_LEVEL)?;
            Ok(Box::new(encoder.auto_finish()))
        }
        Compression::Gzip => Ok(Box::new(flate2::write::GzEncoder::new(
            inner,
            flate2::Compression::default(),
        ))),
    }
}

pub fn wrap_reader<'a, R: Read + 'a>(inner: R, compression: Compression) -> Result<Box<dyn Read + 'a>> {
    match compression {
        Compression::None | Compression::Lto => Ok(Box::new(inner)),
        Compression::Zstd => Ok(Box::new(zstd::stream::read::Decoder::new(inner)?)),
        Compression::Gzip => Ok(Box::new(flate2::read::GzDecoder::new(inner))),
    }
}
