//! Framed reads and writes over byte streams
//!
//! Two framings are used by the dataplane:
//!
//! - Raw: the local interface hands over one packet per read, so a frame is
//!   whatever a single read returns ([`RawFrameReader`], [`RawFrameWriter`]).
//! - Encrypted: peers exchange length-prefixed messages, each under its own
//!   IV. Length prefix and payload share one CFB keystream
//!   ([`CipherFrameReader`], [`CipherFrameWriter`]):
//!
//! ```text
//! +-----------+----------------------+---------------------------+
//! | IV (16)   | enc(length: u16 BE)  | enc(payload: length bytes)|
//! +-----------+----------------------+---------------------------+
//! ```

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::buffer_pool::PooledBuffer;
use crate::crypto::{new_iv, Cipher, IV_SIZE};
use crate::{Error, Result};

/// Length of the encrypted length prefix
const LENGTH_PREFIX: usize = 2;

/// Largest payload an encrypted frame can carry
pub const MAX_FRAME_LEN: usize = u16::MAX as usize;

/// Source of frames
#[async_trait]
pub trait FrameReader: Send {
    /// Read one frame into `buf`, replacing its contents
    ///
    /// Returns [`Error::Closed`] when the stream ended cleanly.
    async fn read_frame(&mut self, buf: &mut PooledBuffer) -> Result<()>;
}

/// Sink for frames
#[async_trait]
pub trait FrameWriter: Send {
    /// Write one complete frame
    async fn write_frame(&mut self, frame: &[u8]) -> Result<()>;
}

async fn read_exact_or_closed<R>(reader: &mut R, buf: &mut [u8]) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(Error::Closed),
        Err(e) => Err(e.into()),
    }
}

/// One read call, one frame
pub struct RawFrameReader<R> {
    inner: R,
}

impl<R> RawFrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

#[async_trait]
impl<R> FrameReader for RawFrameReader<R>
where
    R: AsyncRead + Unpin + Send,
{
    async fn read_frame(&mut self, buf: &mut PooledBuffer) -> Result<()> {
        buf.clear();
        let n = self.inner.read(buf.spare_mut()).await?;
        if n == 0 {
            return Err(Error::Closed);
        }
        buf.set_len(n);
        Ok(())
    }
}

/// Writes each frame as is
pub struct RawFrameWriter<W> {
    inner: W,
}

impl<W> RawFrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

#[async_trait]
impl<W> FrameWriter for RawFrameWriter<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        self.inner.write_all(frame).await?;
        self.inner.flush().await?;
        Ok(())
    }
}

/// Reads `[IV][enc(len)][enc(payload)]` frames
pub struct CipherFrameReader<R> {
    inner: R,
    cipher: Cipher,
}

impl<R> CipherFrameReader<R> {
    pub fn new(inner: R, cipher: Cipher) -> Self {
        Self { inner, cipher }
    }
}

#[async_trait]
impl<R> FrameReader for CipherFrameReader<R>
where
    R: AsyncRead + Unpin + Send,
{
    async fn read_frame(&mut self, buf: &mut PooledBuffer) -> Result<()> {
        buf.clear();

        let mut iv = [0u8; IV_SIZE];
        read_exact_or_closed(&mut self.inner, &mut iv).await?;
        let mut dec = self.cipher.decryptor(&iv);

        let mut prefix = [0u8; LENGTH_PREFIX];
        read_exact_or_closed(&mut self.inner, &mut prefix).await?;
        dec.decrypt(&mut prefix);
        let len = u16::from_be_bytes(prefix) as usize;

        if len > buf.capacity() {
            return Err(Error::FrameTooLarge(len));
        }

        let payload = &mut buf.spare_mut()[..len];
        read_exact_or_closed(&mut self.inner, payload).await?;
        dec.decrypt(payload);
        buf.set_len(len);
        Ok(())
    }
}

/// Writes `[IV][enc(len)][enc(payload)]` frames with a fresh IV each
pub struct CipherFrameWriter<W> {
    inner: W,
    cipher: Cipher,
    scratch: Vec<u8>,
}

impl<W> CipherFrameWriter<W> {
    pub fn new(inner: W, cipher: Cipher) -> Self {
        Self {
            inner,
            cipher,
            scratch: Vec::new(),
        }
    }
}

#[async_trait]
impl<W> FrameWriter for CipherFrameWriter<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        if frame.len() > MAX_FRAME_LEN {
            return Err(Error::FrameTooLarge(frame.len()));
        }

        let iv = new_iv();
        let mut enc = self.cipher.encryptor(&iv);

        self.scratch.clear();
        self.scratch.extend_from_slice(&iv);
        self.scratch
            .extend_from_slice(&(frame.len() as u16).to_be_bytes());
        self.scratch.extend_from_slice(frame);
        enc.encrypt(&mut self.scratch[IV_SIZE..]);

        self.inner.write_all(&self.scratch).await?;
        self.inner.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BufferPool;

    #[tokio::test]
    async fn test_cipher_frames_roundtrip() {
        let pool = BufferPool::new(4, 4096);
        let (a, b) = tokio::io::duplex(64 * 1024);
        let cipher = Cipher::new(b"session");

        let mut writer = CipherFrameWriter::new(a, cipher.copy());
        let mut reader = CipherFrameReader::new(b, cipher);

        let frames: Vec<Vec<u8>> = vec![b"first".to_vec(), vec![], vec![0x42; 1500]];
        for frame in &frames {
            writer.write_frame(frame).await.unwrap();
        }

        for frame in &frames {
            let mut buf = pool.get();
            reader.read_frame(&mut buf).await.unwrap();
            assert_eq!(&buf[..], &frame[..]);
        }
    }

    #[tokio::test]
    async fn test_cipher_frame_wire_layout() {
        let (a, mut b) = tokio::io::duplex(4096);
        let cipher = Cipher::new(b"session");
        let mut writer = CipherFrameWriter::new(a, cipher.copy());
        writer.write_frame(b"hello").await.unwrap();
        drop(writer);

        let mut wire = Vec::new();
        b.read_to_end(&mut wire).await.unwrap();
        assert_eq!(wire.len(), IV_SIZE + 2 + 5);

        let mut iv = [0u8; IV_SIZE];
        iv.copy_from_slice(&wire[..IV_SIZE]);
        let mut body = wire[IV_SIZE..].to_vec();
        cipher.decryptor(&iv).decrypt(&mut body);
        assert_eq!(&body[..2], &5u16.to_be_bytes());
        assert_eq!(&body[2..], b"hello");
    }

    #[tokio::test]
    async fn test_same_payload_encrypts_differently() {
        let (a, mut b) = tokio::io::duplex(4096);
        let mut writer = CipherFrameWriter::new(a, Cipher::new(b"session"));
        writer.write_frame(b"same").await.unwrap();
        writer.write_frame(b"same").await.unwrap();
        drop(writer);

        let mut wire = Vec::new();
        b.read_to_end(&mut wire).await.unwrap();
        let frame_len = IV_SIZE + 2 + 4;
        assert_ne!(&wire[..frame_len], &wire[frame_len..]);
    }

    #[tokio::test]
    async fn test_frame_too_large_for_buffer() {
        let pool = BufferPool::new(1, 100);
        let (a, b) = tokio::io::duplex(4096);
        let cipher = Cipher::new(b"session");
        let mut writer = CipherFrameWriter::new(a, cipher.copy());
        let mut reader = CipherFrameReader::new(b, cipher);

        writer.write_frame(&[0u8; 101]).await.unwrap();
        let mut buf = pool.get();
        assert!(matches!(
            reader.read_frame(&mut buf).await,
            Err(Error::FrameTooLarge(101))
        ));
    }

    #[tokio::test]
    async fn test_write_rejects_oversized_frame() {
        let (a, _b) = tokio::io::duplex(16);
        let mut writer = CipherFrameWriter::new(a, Cipher::new(b"session"));
        let frame = vec![0u8; MAX_FRAME_LEN + 1];
        assert!(matches!(
            writer.write_frame(&frame).await,
            Err(Error::FrameTooLarge(_))
        ));
    }

    #[tokio::test]
    async fn test_cipher_reader_eof_is_closed() {
        let pool = BufferPool::new(1, 100);
        let (a, b) = tokio::io::duplex(16);
        drop(a);
        let mut reader = CipherFrameReader::new(b, Cipher::new(b"session"));
        let mut buf = pool.get();
        assert!(matches!(reader.read_frame(&mut buf).await, Err(Error::Closed)));
    }

    #[tokio::test]
    async fn test_raw_frames() {
        let pool = BufferPool::new(2, 2048);
        let (a, b) = tokio::io::duplex(4096);
        let mut writer = RawFrameWriter::new(a);
        let mut reader = RawFrameReader::new(b);

        writer.write_frame(b"raw packet").await.unwrap();
        let mut buf = pool.get();
        reader.read_frame(&mut buf).await.unwrap();
        assert_eq!(&buf[..], b"raw packet");

        drop(writer);
        assert!(matches!(reader.read_frame(&mut buf).await, Err(Error::Closed)));
    }
}
