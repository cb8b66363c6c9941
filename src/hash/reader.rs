//! Readers that hash bytes as they stream past

use crate::error::RegistryError;
use crate::hash::Hash;
use sha2::{Digest, Sha256};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, ready};
use tokio::io::{AsyncRead, ReadBuf};

/// Forwards bytes unchanged while accumulating their sha256 and length.
pub struct HashingReader<R> {
    inner: R,
    hasher: Sha256,
    count: u64,
}

impl<R> HashingReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            count: 0,
        }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    /// Digest and byte count of everything read so far.
    pub fn finish(self) -> (Hash, u64) {
        (Hash::from_hasher(self.hasher), self.count)
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for HashingReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        let before = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
        let chunk = &buf.filled()[before..];
        this.hasher.update(chunk);
        this.count += chunk.len() as u64;
        Poll::Ready(Ok(()))
    }
}

/// Fails the read with an integrity error when the stream does not hash to
/// the expected digest, or its length disagrees with the expected size.
///
/// The check happens at EOF, so a consumer only observes success after every
/// byte has been verified.
pub struct VerifyingReader<R> {
    inner: R,
    hasher: Sha256,
    count: u64,
    expected: Hash,
    expected_size: Option<u64>,
    done: bool,
}

impl<R> VerifyingReader<R> {
    pub fn new(inner: R, expected: Hash, expected_size: Option<u64>) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            count: 0,
            expected,
            expected_size,
            done: false,
        }
    }

    fn verify(&mut self) -> io::Result<()> {
        if let Some(size) = self.expected_size {
            if size != self.count {
                return Err(RegistryError::Integrity(format!(
                    "size mismatch for {}: expected {} bytes, read {}",
                    self.expected, size, self.count
                ))
                .into_io());
            }
        }
        let actual = Hash::from_hasher(std::mem::take(&mut self.hasher));
        if actual != self.expected {
            return Err(RegistryError::Integrity(format!(
                "digest mismatch: expected {}, computed {}",
                self.expected, actual
            ))
            .into_io());
        }
        Ok(())
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for VerifyingReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        if this.done || buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }
        let before = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
        let chunk = &buf.filled()[before..];
        if chunk.is_empty() {
            this.done = true;
            return Poll::Ready(this.verify());
        }
        this.hasher.update(chunk);
        this.count += chunk.len() as u64;
        if let Some(size) = this.expected_size {
            if this.count > size {
                this.done = true;
                return Poll::Ready(Err(RegistryError::Integrity(format!(
                    "size mismatch for {}: read more than the expected {} bytes",
                    this.expected, size
                ))
                .into_io()));
            }
        }
        Poll::Ready(Ok(()))
    }
}
