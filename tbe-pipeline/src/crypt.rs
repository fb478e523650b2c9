//! Stream encryption.
//!
//! Grounded on the teacher's `pbs-datastore::crypt_writer::CryptWriter` /
//! `crypt_reader::CryptReader` (both wrap an `openssl::symm::Crypter` around
//! a plain `Read`/`Write`). The teacher authenticates with AES-256-GCM under
//! a key shipped out of band in its key config; this engine instead derives
//! a key from a passphrase via PBKDF2 and carries the salt/IV as a small
//! plaintext header at the front of the ciphertext stream, so a restore
//! needs nothing but the passphrase and the bytes already on tape.

use std::io::{self, Read, Write};

use anyhow::{Context, Result};
use openssl::pkcs5::pbkdf2_hmac;
use openssl::rand::rand_bytes;
use openssl::symm::{Cipher, Crypter, Mode};

const SALT_LEN: usize = 16;
const IV_LEN: usize = 16;
const KEY_LEN: usize = 32;
/// `spec.md` §4.2/§6: "PBKDF2 at 100 000 iterations".
const PBKDF2_ITERATIONS: usize = 100_000;
pub const HEADER_LEN: usize = SALT_LEN + IV_LEN;

fn derive_key(passphrase: &[u8], salt: &[u8]) -> Result<[u8; KEY_LEN]> {
    let mut key = [0u8; KEY_LEN];
    pbkdf2_hmac(
        passphrase,
        salt,
        PBKDF2_ITERATIONS,
        openssl::hash::MessageDigest::sha256(),
        &mut key,
    )
    .context("deriving key from passphrase")?;
    Ok(key)
}

fn crypt_err(err: openssl::error::ErrorStack) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err.to_string())
}

/// Encrypts everything written through it with AES-256-CBC. The first bytes
/// written to `inner` are a plaintext salt+IV header.
pub struct CryptWriter<W: Write> {
    inner: Option<W>,
    crypter: Crypter,
    block_size: usize,
    buf: Box<[u8; 64 * 1024]>,
    finalized: bool,
}

impl<W: Write> CryptWriter<W> {
    pub fn new(mut inner: W, passphrase: &[u8]) -> Result<Self> {
        let mut salt = [0u8; SALT_LEN];
        let mut iv = [0u8; IV_LEN];
        rand_bytes(&mut salt)?;
        rand_bytes(&mut iv)?;
        let key = derive_key(passphrase, &salt)?;
        inner.write_all(&salt)?;
        inner.write_all(&iv)?;
        let cipher = Cipher::aes_256_cbc();
        let crypter = Crypter::new(cipher, Mode::Encrypt, &key, Some(&iv))?;
        Ok(Self {
            inner: Some(inner),
            crypter,
            block_size: cipher.block_size(),
            buf: Box::new([0u8; 64 * 1024]),
            finalized: false,
        })
    }

    /// Flushes the final padded cipher block and returns the inner writer.
    pub fn finish(mut self) -> Result<W> {
        self.finalize_inner()?;
        Ok(self.inner.take().expect("inner present until finalize"))
    }

    fn finalize_inner(&mut self) -> Result<()> {
        if self.finalized {
            return Ok(());
        }
        self.finalized = true;
        let n = self.crypter.finalize(self.buf.as_mut())?;
        if let Some(inner) = self.inner.as_mut() {
            if n > 0 {
                inner.write_all(&self.buf[..n])?;
            }
            inner.flush()?;
        }
        Ok(())
    }
}

impl<W: Write> Write for CryptWriter<W> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let max_chunk = self.buf.len() - self.block_size;
        let take = data.len().min(max_chunk);
        let n = self
            .crypter
            .update(&data[..take], self.buf.as_mut())
            .map_err(crypt_err)?;
        self.inner
            .as_mut()
            .expect("write after finish")
            .write_all(&self.buf[..n])?;
        Ok(take)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.as_mut().expect("write after finish").flush()
    }
}

/// Mirrors zstd's `AutoFinishEncoder`: a `CryptWriter` reached only through
/// a boxed pipeline still flushes its final block when dropped. Errors at
/// that point are logged, not propagated — callers that need a hard
/// guarantee should call `finish()` explicitly before the writer is dropped.
impl<W: Write> Drop for CryptWriter<W> {
    fn drop(&mut self) {
        if let Err(err) = self.finalize_inner() {
            log::error!("failed to finalize encrypted stream: {err:#}");
        }
    }
}

/// Decrypts a stream written by `CryptWriter`. Reads the salt+IV header on
/// construction. A wrong passphrase does not fail until `finalize()` rejects
/// the trailing PKCS#7 padding, surfacing as an `io::Error` from the final
/// `read()` call —'s wrong-key restore scenario.
pub struct CryptReader<R> {
    inner: R,
    crypter: Crypter,
    finished: bool,
    leftover: Vec<u8>,
}

impl<R: Read> CryptReader<R> {
    pub fn new(mut inner: R, passphrase: &[u8]) -> Result<Self> {
        let mut salt = [0u8; SALT_LEN];
        let mut iv = [0u8; IV_LEN];
        inner.read_exact(&mut salt).context("reading salt header")?;
        inner.read_exact(&mut iv).context("reading iv header")?;
        let key = derive_key(passphrase, &salt)?;
        let crypter = Crypter::new(Cipher::aes_256_cbc(), Mode::Decrypt, &key, Some(&iv))?;
        Ok(Self {
            inner,
            crypter,
            finished: false,
            leftover: Vec::new(),
        })
    }
}

impl<R: Read> Read for CryptReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.leftover.is_empty() {
            let n = self.leftover.len().min(buf.len());
            buf[..n].copy_from_slice(&self.leftover[..n]);
            self.leftover.drain(..n);
            return Ok(n);
        }
        if self.finished {
            return Ok(0);
        }
        let mut chunk = vec![0u8; 64 * 1024];
        let read_n = self.inner.read(&mut chunk)?;
        let mut outbuf = vec![0u8; read_n + 32];
        let produced = if read_n == 0 {
            let n = self.crypter.finalize(&mut outbuf).map_err(crypt_err)?;
            self.finished = true;
            n
        } else {
            self.crypter
                .update(&chunk[..read_n], &mut outbuf)
                .map_err(crypt_err)?
        };
        outbuf.truncate(produced);
        let take = outbuf.len().min(buf.len());
        buf[..take].copy_from_slice(&outbuf[..take]);
        if outbuf.len() > take {
            self.leftover = outbuf[take..].to_vec();
        }
        Ok(take)
    }
}
