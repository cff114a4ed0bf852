//! Cipher engine for the cvpn protocol
//!
//! Uses AES-256-CFB keyed either from a password (through an MD5-based
//! `EVP_BytesToKey` derivation) or from raw session key bytes.
//!
//! Every message carries its own IV in clear text ahead of the ciphertext:
//!
//! ```text
//! +------------------+------------------------+
//! |   IV (16 bytes)  |   CFB ciphertext       |
//! +------------------+------------------------+
//! ```
//!
//! The IV is drawn from the thread-local CSPRNG on every [`Cipher::encrypt`]
//! call, so a (key, IV) pair is never reused.
//!
//! CFB is a stream mode: ciphertext has the same length as the plaintext and
//! there is no padding. There is no MAC either; tampering goes undetected.
//!
//! ## Streaming
//!
//! Framed messages encrypt a length prefix and a payload under one IV. The
//! [`FrameEncryptor`] / [`FrameDecryptor`] pair keeps the CFB state between
//! calls so the two pieces share one keystream:
//!
//! ```rust
//! use cvpn_protocol::{Cipher, new_iv};
//!
//! let cipher = Cipher::new(b"milk");
//! let iv = new_iv();
//!
//! let mut header = 5u16.to_be_bytes();
//! let mut body = *b"hello";
//! let mut enc = cipher.encryptor(&iv);
//! enc.encrypt(&mut header);
//! enc.encrypt(&mut body);
//!
//! let mut dec = cipher.decryptor(&iv);
//! dec.decrypt(&mut header);
//! dec.decrypt(&mut body);
//! assert_eq!(u16::from_be_bytes(header), 5);
//! assert_eq!(&body, b"hello");
//! ```

use aes::cipher::{AsyncStreamCipher, KeyIvInit};
use md5::{Digest, Md5};
use rand::RngCore;

use crate::{Error, Result};

type Aes256CfbEnc = cfb_mode::Encryptor<aes::Aes256>;
type Aes256CfbDec = cfb_mode::Decryptor<aes::Aes256>;
type Aes256CfbBufEnc = cfb_mode::BufEncryptor<aes::Aes256>;
type Aes256CfbBufDec = cfb_mode::BufDecryptor<aes::Aes256>;

/// Symmetric key size in bytes (AES-256)
pub const KEY_SIZE: usize = 32;

/// IV size in bytes (one AES block)
pub const IV_SIZE: usize = 16;

const MD5_LEN: usize = 16;

/// Derive `length` key bytes from a password
///
/// This is OpenSSL's `EVP_BytesToKey` with MD5 and a single iteration:
/// `d0 = MD5(password)`, `dn = MD5(d(n-1) || password)`, concatenated and
/// truncated. There is no salt, so the same password always gives the same
/// key.
pub fn derive_key(password: &[u8], length: usize) -> Vec<u8> {
    let mut key = Vec::with_capacity(length + MD5_LEN);
    let mut prev: Option<[u8; MD5_LEN]> = None;

    while key.len() < length {
        let mut hasher = Md5::new();
        if let Some(prev) = prev {
            hasher.update(prev);
        }
        hasher.update(password);
        let digest: [u8; MD5_LEN] = hasher.finalize().into();
        key.extend_from_slice(&digest);
        prev = Some(digest);
    }

    key.truncate(length);
    key
}

/// Generate a fresh random IV
pub fn new_iv() -> [u8; IV_SIZE] {
    let mut iv = [0u8; IV_SIZE];
    rand::rng().fill_bytes(&mut iv);
    iv
}

/// Generate a fresh random session key
pub fn new_session_key() -> [u8; KEY_SIZE] {
    let mut key = [0u8; KEY_SIZE];
    rand::rng().fill_bytes(&mut key);
    key
}

/// Keyed AES-256-CFB context
///
/// Holds no per-message state; every operation takes an explicit IV.
#[derive(Clone)]
pub struct Cipher {
    key: [u8; KEY_SIZE],
}

impl Cipher {
    /// Create a cipher from a password through [`derive_key`]
    pub fn new(password: &[u8]) -> Self {
        let derived = derive_key(password, KEY_SIZE);
        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(&derived);
        Self { key }
    }

    /// Create a cipher from raw key bytes
    ///
    /// Only the first [`KEY_SIZE`] bytes are used.
    pub fn from_raw(raw: &[u8]) -> Result<Self> {
        if raw.len() < KEY_SIZE {
            return Err(Error::KeyTooShort {
                expected: KEY_SIZE,
                actual: raw.len(),
            });
        }
        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(&raw[..KEY_SIZE]);
        Ok(Self { key })
    }

    /// Produce an independent cipher with the same key
    pub fn copy(&self) -> Self {
        self.clone()
    }

    /// Encrypt `src` into `dst` under a freshly generated IV written to `iv_out`
    pub fn encrypt(&self, iv_out: &mut [u8; IV_SIZE], dst: &mut [u8], src: &[u8]) -> Result<()> {
        if dst.len() != src.len() {
            return Err(Error::LengthMismatch {
                src: src.len(),
                dst: dst.len(),
            });
        }
        *iv_out = new_iv();
        dst.copy_from_slice(src);
        Aes256CfbEnc::new(&self.key.into(), &(*iv_out).into()).encrypt(dst);
        Ok(())
    }

    /// Decrypt `src` into `dst` using the IV the sender transmitted
    pub fn decrypt(&self, iv: &[u8; IV_SIZE], dst: &mut [u8], src: &[u8]) -> Result<()> {
        if dst.len() != src.len() {
            return Err(Error::LengthMismatch {
                src: src.len(),
                dst: dst.len(),
            });
        }
        dst.copy_from_slice(src);
        Aes256CfbDec::new(&self.key.into(), &(*iv).into()).decrypt(dst);
        Ok(())
    }

    /// Encrypt a message into a new `IV || ciphertext` vector
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut out = vec![0u8; IV_SIZE + plaintext.len()];
        let mut iv = [0u8; IV_SIZE];
        self.encrypt(&mut iv, &mut out[IV_SIZE..], plaintext)?;
        out[..IV_SIZE].copy_from_slice(&iv);
        Ok(out)
    }

    /// Decrypt an `IV || ciphertext` message
    pub fn open(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() < IV_SIZE {
            return Err(Error::PacketTooShort {
                expected: IV_SIZE,
                actual: data.len(),
            });
        }
        let mut iv = [0u8; IV_SIZE];
        iv.copy_from_slice(&data[..IV_SIZE]);
        let mut out = vec![0u8; data.len() - IV_SIZE];
        self.decrypt(&iv, &mut out, &data[IV_SIZE..])?;
        Ok(out)
    }

    /// Start a streaming encryptor for one framed message
    pub fn encryptor(&self, iv: &[u8; IV_SIZE]) -> FrameEncryptor {
        FrameEncryptor {
            inner: Aes256CfbBufEnc::new(&self.key.into(), &(*iv).into()),
        }
    }

    /// Start a streaming decryptor for one framed message
    pub fn decryptor(&self, iv: &[u8; IV_SIZE]) -> FrameDecryptor {
        FrameDecryptor {
            inner: Aes256CfbBufDec::new(&self.key.into(), &(*iv).into()),
        }
    }
}

impl std::fmt::Debug for Cipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cipher").finish_non_exhaustive()
    }
}

/// CFB encryptor that keeps its keystream position across calls
pub struct FrameEncryptor {
    inner: Aes256CfbBufEnc,
}

impl FrameEncryptor {
    /// Encrypt `data` in place, continuing the keystream
    pub fn encrypt(&mut self, data: &mut [u8]) {
        self.inner.encrypt(data);
    }
}

/// CFB decryptor that keeps its keystream position across calls
pub struct FrameDecryptor {
    inner: Aes256CfbBufDec,
}

impl FrameDecryptor {
    /// Decrypt `data` in place, continuing the keystream
    pub fn decrypt(&mut self, data: &mut [u8]) {
        self.inner.decrypt(data);
    }
}
