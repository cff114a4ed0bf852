//! Session handshake
//!
//! A connection starts with one request and one response, both encrypted
//! under the cipher derived from the shared secret:
//!
//! ```text
//! client -> server
//! +-----------+-----------------------------------------------+
//! | IV (16)   | enc( SHA-256(secret) (32) | session key (32) ) |
//! +-----------+-----------------------------------------------+
//!
//! server -> client
//! +-----------+-----------------------------------------------+
//! | IV (16)   | enc( status (1) | ip (4) | mask (4) | port (2) ) |
//! +-----------+-----------------------------------------------+
//! ```
//!
//! The response has the same size whatever the status; address fields are
//! zero unless the status is [`Status::Ok`]. After an `Ok` both sides switch
//! to a cipher keyed by the session key the client generated.

use std::fmt;
use std::net::Ipv4Addr;

use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::crypto::{new_session_key, Cipher, IV_SIZE, KEY_SIZE};
use crate::{Error, Result};

/// Size of the secret verification value
pub const SECRET_HASH_SIZE: usize = 32;

/// Encrypted request size on the wire
pub const REQUEST_LEN: usize = IV_SIZE + SECRET_HASH_SIZE + KEY_SIZE;

/// Encrypted response size on the wire
pub const RESPONSE_LEN: usize = IV_SIZE + RESPONSE_BODY_LEN;

const RESPONSE_BODY_LEN: usize = 1 + 4 + 4 + 2;

/// Outcome of a handshake as reported by the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Status {
    Ok = 0,
    NoIpAvailable = 1,
    NoPortAvailable = 2,
    InvalidSecret = 3,
}

impl TryFrom<u8> for Status {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Status::Ok),
            1 => Ok(Status::NoIpAvailable),
            2 => Ok(Status::NoPortAvailable),
            3 => Ok(Status::InvalidSecret),
            other => Err(Error::UnknownStatus(other)),
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Ok => write!(f, "ok"),
            Status::NoIpAvailable => write!(f, "no IP address available"),
            Status::NoPortAvailable => write!(f, "no port available"),
            Status::InvalidSecret => write!(f, "invalid secret"),
        }
    }
}

/// Verification value for a shared secret
pub fn secret_hash(secret: &[u8]) -> [u8; SECRET_HASH_SIZE] {
    Sha256::digest(secret).into()
}

/// Client hello carrying the secret proof and the fresh session key
#[derive(Clone, PartialEq, Eq)]
pub struct Request {
    pub secret_hash: [u8; SECRET_HASH_SIZE],
    pub session_key: [u8; KEY_SIZE],
}

impl Request {
    /// Build a request for `secret` with a freshly generated session key
    pub fn new(secret: &[u8]) -> Self {
        Self {
            secret_hash: secret_hash(secret),
            session_key: new_session_key(),
        }
    }

    /// Encrypt into `IV || ciphertext`
    pub fn encode(&self, cipher: &Cipher) -> Result<Vec<u8>> {
        let mut plain = [0u8; SECRET_HASH_SIZE + KEY_SIZE];
        plain[..SECRET_HASH_SIZE].copy_from_slice(&self.secret_hash);
        plain[SECRET_HASH_SIZE..].copy_from_slice(&self.session_key);
        cipher.seal(&plain)
    }

    /// Decrypt from `IV || ciphertext`
    pub fn decode(cipher: &Cipher, data: &[u8]) -> Result<Self> {
        if data.len() != REQUEST_LEN {
            return Err(Error::InvalidPacket(format!(
                "handshake request is {} bytes, expected {}",
                data.len(),
                REQUEST_LEN
            )));
        }
        let plain = cipher.open(data)?;
        let mut secret_hash = [0u8; SECRET_HASH_SIZE];
        let mut session_key = [0u8; KEY_SIZE];
        secret_hash.copy_from_slice(&plain[..SECRET_HASH_SIZE]);
        session_key.copy_from_slice(&plain[SECRET_HASH_SIZE..]);
        Ok(Self {
            secret_hash,
            session_key,
        })
    }

    /// Compare the carried proof against the server's own
    ///
    /// Plain byte comparison; not constant time.
    pub fn verify(&self, expected: &[u8; SECRET_HASH_SIZE]) -> bool {
        self.secret_hash == *expected
    }

    /// Cipher for the rest of the session
    pub fn session_cipher(&self) -> Result<Cipher> {
        Cipher::from_raw(&self.session_key)
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request").finish_non_exhaustive()
    }
}

/// Server reply to a [`Request`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Response {
    pub status: Status,
    pub ip: Ipv4Addr,
    pub mask: Ipv4Addr,
    pub port: u16,
}

impl Response {
    /// Successful reply with the leased address, mask and port
    pub fn ok(ip: Ipv4Addr, mask: Ipv4Addr, port: u16) -> Self {
        Self {
            status: Status::Ok,
            ip,
            mask,
            port,
        }
    }

    /// Refusal with zeroed address fields
    pub fn reject(status: Status) -> Self {
        Self {
            status,
            ip: Ipv4Addr::UNSPECIFIED,
            mask: Ipv4Addr::UNSPECIFIED,
            port: 0,
        }
    }

    /// Encrypt into `IV || ciphertext`
    pub fn encode(&self, cipher: &Cipher) -> Result<Vec<u8>> {
        let mut plain = [0u8; RESPONSE_BODY_LEN];
        plain[0] = self.status as u8;
        plain[1..5].copy_from_slice(&self.ip.octets());
        plain[5..9].copy_from_slice(&self.mask.octets());
        plain[9..11].copy_from_slice(&self.port.to_be_bytes());
        cipher.seal(&plain)
    }

    /// Decrypt from `IV || ciphertext`
    pub fn decode(cipher: &Cipher, data: &[u8]) -> Result<Self> {
        if data.len() != RESPONSE_LEN {
            return Err(Error::InvalidPacket(format!(
                "handshake response is {} bytes, expected {}",
                data.len(),
                RESPONSE_LEN
            )));
        }
        let plain = cipher.open(data)?;
        Ok(Self {
            status: Status::try_from(plain[0])?,
            ip: Ipv4Addr::new(plain[1], plain[2], plain[3], plain[4]),
            mask: Ipv4Addr::new(plain[5], plain[6], plain[7], plain[8]),
            port: u16::from_be_bytes([plain[9], plain[10]]),
        })
    }
}

/// Parameters of an established session on the client side
#[derive(Debug, Clone)]
pub struct Session {
    /// Address leased to this client
    pub ip: Ipv4Addr,
    /// Netmask of the tunnel subnet
    pub mask: Ipv4Addr,
    /// Port leased alongside the address
    pub port: u16,
    /// Cipher keyed by the exchanged session key
    pub cipher: Cipher,
}

impl Session {
    /// Prefix length of [`Session::mask`]
    pub fn prefix_len(&self) -> u8 {
        u32::from(self.mask).count_ones() as u8
    }
}

fn is_netmask(mask: Ipv4Addr) -> bool {
    let bits = u32::from(mask);
    bits != 0 && bits.leading_ones() + bits.trailing_zeros() == 32
}

fn in_subnet(ip: Ipv4Addr, mask: Ipv4Addr) -> bool {
    let host = u32::from(ip) & !u32::from(mask);
    host != 0 && host != !u32::from(mask)
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

/// Run the client half of the handshake
///
/// Returns [`Error::Rejected`] when the server answers with anything but
/// [`Status::Ok`].
pub async fn client_handshake<S>(stream: &mut S, cipher: &Cipher, secret: &[u8]) -> Result<Session>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = Request::new(secret);
    stream.write_all(&request.encode(cipher)?).await?;
    stream.flush().await?;

    let mut buf = [0u8; RESPONSE_LEN];
    read_exact_or_closed(stream, &mut buf).await?;
    let response = Response::decode(cipher, &buf)?;
    log::debug!("Handshake response: {:?}", response.status);

    // A reply sealed under another secret decrypts to noise; rejections
    // carry zeroed fields and acceptances a valid address, noise neither.
    if response.status != Status::Ok {
        if response != Response::reject(response.status) {
            return Err(Error::InvalidPacket(
                "handshake rejection carries non-zero fields".into(),
            ));
        }
        return Err(Error::Rejected(response.status));
    }
    if !is_netmask(response.mask) || !in_subnet(response.ip, response.mask) {
        return Err(Error::InvalidPacket(format!(
            "handshake response carries invalid address {}/{}",
            response.ip, response.mask
        )));
    }

    Ok(Session {
        ip: response.ip,
        mask: response.mask,
        port: response.port,
        cipher: request.session_cipher()?,
    })
}

/// Read and decrypt a client request
pub async fn read_request<R>(reader: &mut R, cipher: &Cipher) -> Result<Request>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; REQUEST_LEN];
    read_exact_or_closed(reader, &mut buf).await?;
    Request::decode(cipher, &buf)
}

/// Encrypt and send a response
pub async fn write_response<W>(writer: &mut W, cipher: &Cipher, response: &Response) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&response.encode(cipher)?).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(Status::Ok as u8, 0);
        assert_eq!(Status::NoIpAvailable as u8, 1);
        assert_eq!(Status::NoPortAvailable as u8, 2);
        assert_eq!(Status::InvalidSecret as u8, 3);
        for code in 0..4u8 {
            assert_eq!(Status::try_from(code).unwrap() as u8, code);
        }
        assert!(matches!(Status::try_from(9), Err(Error::UnknownStatus(9))));
    }

    #[test]
    fn test_secret_hash_is_sha256() {
        let hash = secret_hash(b"milk");
        assert_eq!(hash.len(), 32);
        assert_eq!(hash, secret_hash(b"milk"));
        assert_ne!(hash, secret_hash(b"milk "));
    }

    #[test]
    fn test_request_wire_size_and_decode() {
        let cipher = Cipher::new(b"milk");
        let request = Request::new(b"milk");
        let wire = request.encode(&cipher).unwrap();
        assert_eq!(wire.len(), REQUEST_LEN);

        let decoded = Request::decode(&cipher, &wire).unwrap();
        assert!(decoded == request);
        assert!(decoded.verify(&secret_hash(b"milk")));
    }

    #[test]
    fn test_request_wrong_secret_fails_verify() {
        // Client and server share the cipher password but the client proves a
        // different secret
        let cipher = Cipher::new(b"milk");
        let wire = Request::new(b"cheese").encode(&cipher).unwrap();
        let decoded = Request::decode(&cipher, &wire).unwrap();
        assert!(!decoded.verify(&secret_hash(b"milk")));
    }

    #[test]
    fn test_request_under_other_cipher_fails_verify() {
        let wire = Request::new(b"cheese").encode(&Cipher::new(b"cheese")).unwrap();
        let decoded = Request::decode(&Cipher::new(b"milk"), &wire).unwrap();
        assert!(!decoded.verify(&secret_hash(b"milk")));
    }

    #[test]
    fn test_request_bad_length() {
        let cipher = Cipher::new(b"milk");
        assert!(matches!(
            Request::decode(&cipher, &[0u8; 10]),
            Err(Error::InvalidPacket(_))
        ));
    }

    #[test]
    fn test_session_keys_are_fresh() {
        assert_ne!(Request::new(b"milk").session_key, Request::new(b"milk").session_key);
    }

    #[test]
    fn test_response_fixed_size() {
        let cipher = Cipher::new(b"milk");
        let ok = Response::ok(
            Ipv4Addr::new(10, 0, 200, 2),
            Ipv4Addr::new(255, 255, 255, 0),
            40002,
        );
        for response in [
            ok,
            Response::reject(Status::NoIpAvailable),
            Response::reject(Status::NoPortAvailable),
            Response::reject(Status::InvalidSecret),
        ] {
            let wire = response.encode(&cipher).unwrap();
            assert_eq!(wire.len(), RESPONSE_LEN);
            assert_eq!(Response::decode(&cipher, &wire).unwrap(), response);
        }
    }

    #[test]
    fn test_reject_zeroes_fields() {
        let response = Response::reject(Status::InvalidSecret);
        assert_eq!(response.ip, Ipv4Addr::UNSPECIFIED);
        assert_eq!(response.mask, Ipv4Addr::UNSPECIFIED);
        assert_eq!(response.port, 0);
    }

    #[test]
    fn test_netmask_check() {
        assert!(is_netmask(Ipv4Addr::new(255, 255, 255, 0)));
        assert!(is_netmask(Ipv4Addr::new(255, 255, 255, 252)));
        assert!(!is_netmask(Ipv4Addr::new(255, 0, 255, 0)));
        assert!(!is_netmask(Ipv4Addr::UNSPECIFIED));

        let mask = Ipv4Addr::new(255, 255, 255, 0);
        assert!(in_subnet(Ipv4Addr::new(10, 0, 200, 2), mask));
        assert!(!in_subnet(Ipv4Addr::new(10, 0, 200, 0), mask));
        assert!(!in_subnet(Ipv4Addr::new(10, 0, 200, 255), mask));
    }

    #[test]
    fn test_session_prefix_len() {
        let session = Session {
            ip: Ipv4Addr::new(10, 0, 200, 2),
            mask: Ipv4Addr::new(255, 255, 255, 0),
            port: 0,
            cipher: Cipher::new(b"milk"),
        };
        assert_eq!(session.prefix_len(), 24);
    }

    #[tokio::test]
    async fn test_handshake_over_duplex() {
        let (mut client_io, mut server_io) = tokio::io::duplex(1024);

        let server = tokio::spawn(async move {
            let cipher = Cipher::new(b"milk");
            let request = read_request(&mut server_io, &cipher).await.unwrap();
            assert!(request.verify(&secret_hash(b"milk")));
            let response = Response::ok(
                Ipv4Addr::new(10, 0, 200, 2),
                Ipv4Addr::new(255, 255, 255, 0),
                40002,
            );
            write_response(&mut server_io, &cipher, &response).await.unwrap();
            request.session_key
        });

        let session = client_handshake(&mut client_io, &Cipher::new(b"milk"), b"milk")
            .await
            .unwrap();
        let session_key = server.await.unwrap();

        assert_eq!(session.ip, Ipv4Addr::new(10, 0, 200, 2));
        assert_eq!(session.port, 40002);

        let sealed = session.cipher.seal(b"after handshake").unwrap();
        let server_cipher = Cipher::from_raw(&session_key).unwrap();
        assert_eq!(server_cipher.open(&sealed).unwrap(), b"after handshake");
    }

    #[tokio::test]
    async fn test_handshake_rejected() {
        let (mut client_io, mut server_io) = tokio::io::duplex(1024);

        tokio::spawn(async move {
            let cipher = Cipher::new(b"milk");
            let _ = read_request(&mut server_io, &cipher).await.unwrap();
            write_response(&mut server_io, &cipher, &Response::reject(Status::InvalidSecret))
                .await
                .unwrap();
        });

        let err = client_handshake(&mut client_io, &Cipher::new(b"milk"), b"cheese")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Rejected(Status::InvalidSecret)));
        assert!(err.is_protocol_error());
    }

    #[tokio::test]
    async fn test_rejection_with_fields_is_noise() {
        let (mut client_io, mut server_io) = tokio::io::duplex(1024);

        tokio::spawn(async move {
            let cipher = Cipher::new(b"milk");
            let _ = read_request(&mut server_io, &cipher).await.unwrap();
            let noisy = Response {
                status: Status::NoIpAvailable,
                ip: Ipv4Addr::new(1, 2, 3, 4),
                mask: Ipv4Addr::UNSPECIFIED,
                port: 7,
            };
            write_response(&mut server_io, &cipher, &noisy).await.unwrap();
        });

        let err = client_handshake(&mut client_io, &Cipher::new(b"milk"), b"milk")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidPacket(_)));
    }

    #[tokio::test]
    async fn test_handshake_peer_closed() {
        let (mut client_io, server_io) = tokio::io::duplex(1024);
        drop(server_io);
        let err = client_handshake(&mut client_io, &Cipher::new(b"milk"), b"milk")
            .await
            .unwrap_err();
        assert!(err.is_transport_error());
    }
}
