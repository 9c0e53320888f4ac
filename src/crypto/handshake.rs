//! TCP obfuscation handshake
//!
//! Both sides end up with two RC4 streams, one per direction. Keys come
//! either from a 16-byte identity hash both peers know plus a random nonce,
//! or from a Diffie-Hellman exchange over a fixed 768-bit prime.
//!
//! Wire layout, shared secret:
//!
//! ```text
//! initiator: marker(1) nonce(4) RC4[sync(4) supported(1) preferred(1) padlen(1) pad]
//! responder: RC4[sync(4) method(1) padlen(1) pad]
//! ```
//!
//! Diffie-Hellman:
//!
//! ```text
//! initiator: marker(1) A(96) pad(0..15)
//! responder: B(96) RC4[sync(4) supported(1) preferred(1) padlen(1) pad]
//! initiator: RC4[sync(4) method(1) padlen(1) pad]
//! ```
//!
//! Anything after the last handshake block is encrypted ed2k stream data.

use std::time::{Duration, Instant};

use anyhow::Result;
use num_bigint::BigUint;
use rand::Rng;
use tracing::{debug, trace, warn};

use crate::crypto::rc4::{Rc4Key, Rc4Stream};
use crate::crypto::{md5_digest, random_marker, random_padding};
use crate::error::Ed2kError;
use crate::protocol::constants::is_protocol;
use crate::protocol::cursor::ByteCursor;

pub const MAGIC_SYNC: u32 = 0x835E_6FC4;
const MAGIC_REQUESTER: u8 = 0x22;
const MAGIC_SERVER: u8 = 0xCB;

/// Basic obfuscation, the only method implemented
pub const METHOD_OBFUSCATION: u8 = 0;
const SUPPORTED_METHODS: u8 = 0;
const PREFERRED_METHOD: u8 = METHOD_OBFUSCATION;

pub const DH_KEY_SIZE: usize = 96;
const DH_EXPONENT_SIZE: usize = 16;
const MAX_PADDING: usize = 15;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(2000);

const CRYPT_PRIME: [u8; DH_KEY_SIZE] = [
    0xF2, 0xBF, 0x52, 0xC5, 0x5F, 0x58, 0x7A, 0xDD, 0x53, 0x71, 0xA9, 0x36, 0xE8, 0x86, 0xEB, 0x3C, 0x62, 0x17, 0xA3,
    0x3E, 0xC3, 0x4C, 0xB4, 0x0D, 0xC7, 0x3A, 0x41, 0xA6, 0x43, 0xAF, 0xFC, 0xE7, 0x21, 0xFC, 0x28, 0x63, 0x66, 0x53,
    0x5B, 0xDB, 0xCE, 0x25, 0x9F, 0x22, 0x86, 0xDA, 0x4A, 0x91, 0xB2, 0x07, 0xCB, 0xAA, 0x52, 0x55, 0xD4, 0xF6, 0x1C,
    0xCE, 0xAE, 0xD4, 0x5A, 0xD5, 0xE0, 0x74, 0x7D, 0xF7, 0x78, 0x18, 0x28, 0x10, 0x5F, 0x34, 0x0F, 0x76, 0x23, 0x87,
    0xF8, 0x8B, 0x28, 0x91, 0x42, 0xFB, 0x42, 0x68, 0x8F, 0x05, 0x15, 0x0F, 0x54, 0x8B, 0x5F, 0x43, 0x6A, 0xF7, 0x0D,
    0xF3,
];

/// Per-connection crypt state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptState {
    /// Obfuscation off, or the peer opened in cleartext
    Disabled,
    /// Nothing received yet
    Unknown,
    Negotiating,
    Encrypting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

/// Key derivation scheme
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeStrategy {
    /// Keys from an identity hash known to both sides plus a nonce
    SharedSecret { hash: [u8; 16] },
    /// Keys from a Diffie-Hellman exchange
    DiffieHellman,
}

/// Send and receive keys for one side of a connection
#[derive(Debug, Clone)]
pub struct SessionKeys {
    send: Rc4Key,
    recv: Rc4Key,
}

impl SessionKeys {
    fn with_magic(material: &[u8], suffix: &[u8], role: Role) -> Self {
        let derive = |magic: u8| {
            let mut buf = Vec::with_capacity(material.len() + 1 + suffix.len());
            buf.extend_from_slice(material);
            buf.push(magic);
            buf.extend_from_slice(suffix);
            Rc4Key::new(&md5_digest(&buf), true)
        };
        let (send, recv) = match role {
            Role::Initiator => (derive(MAGIC_REQUESTER), derive(MAGIC_SERVER)),
            Role::Responder => (derive(MAGIC_SERVER), derive(MAGIC_REQUESTER)),
        };
        Self { send, recv }
    }

    /// `MD5(hash ++ magic ++ nonce)`
    pub fn shared_secret(hash: &[u8; 16], nonce: &[u8; 4], role: Role) -> Self {
        Self::with_magic(hash, nonce, role)
    }

    /// `MD5(K ++ magic)` with K left-padded to the prime size
    pub fn diffie_hellman(secret: &[u8], role: Role) -> Self {
        Self::with_magic(secret, &[], role)
    }

    pub fn send_key(&self) -> &Rc4Key {
        &self.send
    }

    pub fn recv_key(&self) -> &Rc4Key {
        &self.recv
    }
}

/// Output of feeding received bytes through the crypt layer
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Processed {
    /// Cleartext ed2k stream bytes for the framer
    pub plaintext: Vec<u8>,
    /// Handshake bytes to send back, already encrypted where needed
    pub reply: Option<Vec<u8>>,
}

impl Processed {
    fn plain(data: Vec<u8>) -> Self {
        Self {
            plaintext: data,
            reply: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Idle,
    /// Responder: cleartext marker + nonce or marker + A
    ReadHello,
    /// DH initiator: cleartext B
    ReadDhPublic,
    /// Encrypted sync + supported + preferred + padding, answered with a method
    ReadOffer,
    /// Encrypted sync + method + padding
    ReadChoice,
    Done,
}

/// TCP obfuscation layer for one connection
pub struct TcpCrypt {
    state: CryptState,
    role: Role,
    strategy: HandshakeStrategy,
    stage: Stage,
    cleartext: Vec<u8>,
    decrypted: Vec<u8>,
    send: Option<Rc4Stream>,
    recv: Option<Rc4Stream>,
    dh_exponent: Option<BigUint>,
    timeout: Duration,
    deadline: Option<Instant>,
    peer: String,
}

impl std::fmt::Debug for TcpCrypt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpCrypt")
            .field("state", &self.state)
            .field("role", &self.role)
            .field("stage", &self.stage)
            .field("peer", &self.peer)
            .finish()
    }
}

impl TcpCrypt {
    fn with_state(state: CryptState, role: Role, strategy: HandshakeStrategy, timeout: Duration) -> Self {
        Self {
            state,
            role,
            strategy,
            stage: Stage::Idle,
            cleartext: Vec::new(),
            decrypted: Vec::new(),
            send: None,
            recv: None,
            dh_exponent: None,
            timeout,
            deadline: None,
            peer: String::from("unknown"),
        }
    }

    /// Plain connection, every byte passes through
    pub fn disabled() -> Self {
        Self::with_state(CryptState::Disabled, Role::Responder, HandshakeStrategy::DiffieHellman, DEFAULT_TIMEOUT)
    }

    /// Accepting side. The first received byte decides between cleartext
    /// and a handshake.
    pub fn responder(strategy: HandshakeStrategy, timeout: Duration) -> Self {
        Self::with_state(CryptState::Unknown, Role::Responder, strategy, timeout)
    }

    /// Connecting side. Call `start` to get the opening bytes.
    pub fn initiator(strategy: HandshakeStrategy, timeout: Duration) -> Self {
        Self::with_state(CryptState::Unknown, Role::Initiator, strategy, timeout)
    }

    /// Peer address used in error reports
    pub fn with_peer(mut self, peer: impl Into<String>) -> Self {
        self.peer = peer.into();
        self
    }

    pub fn state(&self) -> CryptState {
        self.state
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// When the running handshake must have finished
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_expired(&self) -> bool {
        self.deadline.map_or(false, |d| Instant::now() >= d)
    }

    /// Opening bytes for the initiator
    pub fn start(&mut self) -> Result<Vec<u8>> {
        if self.role != Role::Initiator || self.state != CryptState::Unknown {
            return Err(self.fail("Handshake already started or not an initiator", None));
        }

        let mut packet = vec![random_marker()];
        match self.strategy.clone() {
            HandshakeStrategy::SharedSecret { hash } => {
                let nonce: [u8; 4] = rand::thread_rng().gen();
                self.install(SessionKeys::shared_secret(&hash, &nonce, Role::Initiator));
                packet.extend_from_slice(&nonce);
                packet.extend(self.encrypt_block(&[SUPPORTED_METHODS, PREFERRED_METHOD])?);
                self.stage = Stage::ReadChoice;
            }
            HandshakeStrategy::DiffieHellman => {
                let exponent = random_exponent();
                packet.extend(fixed_width(&dh_public(&exponent)));
                packet.extend(random_padding(MAX_PADDING));
                self.dh_exponent = Some(exponent);
                self.stage = Stage::ReadDhPublic;
            }
        }

        self.begin_negotiation();
        debug!("HANDSHAKE > {} ({} bytes)", self.peer, packet.len());
        Ok(packet)
    }

    /// Feed received bytes
    pub fn process(&mut self, data: &[u8]) -> Result<Processed> {
        match self.state {
            CryptState::Disabled => Ok(Processed::plain(data.to_vec())),
            CryptState::Encrypting => {
                let recv = self.recv.as_mut().ok_or_else(|| Ed2kError::handshake_error("Missing receive key"))?;
                Ok(Processed::plain(recv.process(data)))
            }
            CryptState::Unknown => {
                if self.role == Role::Initiator {
                    return Err(self.fail("Data received before the handshake was started", None));
                }
                let Some(&first) = data.first() else {
                    return Ok(Processed::default());
                };
                if is_protocol(first) {
                    trace!("Cleartext connection from {}", self.peer);
                    self.state = CryptState::Disabled;
                    return Ok(Processed::plain(data.to_vec()));
                }
                debug!("HANDSHAKE < {} negotiation start", self.peer);
                self.stage = Stage::ReadHello;
                self.begin_negotiation();
                self.negotiate(data)
            }
            CryptState::Negotiating => {
                if self.is_expired() {
                    return Err(self.fail("Handshake timed out", None));
                }
                self.negotiate(data)
            }
        }
    }

    /// Encrypt outbound stream bytes. Cleartext connections pass through;
    /// nothing may be sent while a handshake is running.
    pub fn encrypt(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        match self.state {
            CryptState::Encrypting => {
                let send = self.send.as_mut().ok_or_else(|| Ed2kError::handshake_error("Missing send key"))?;
                Ok(send.process(data))
            }
            CryptState::Disabled => Ok(data.to_vec()),
            CryptState::Unknown | CryptState::Negotiating => {
                Err(self.fail("Cannot send before the handshake completes", None))
            }
        }
    }

    fn begin_negotiation(&mut self) {
        self.state = CryptState::Negotiating;
        self.deadline = Some(Instant::now() + self.timeout);
    }

    fn install(&mut self, keys: SessionKeys) {
        self.send = Some(keys.send.start());
        self.recv = Some(keys.recv.start());
    }

    fn absorb(&mut self, data: &[u8]) {
        if let Some(recv) = self.recv.as_mut() {
            let plain = recv.process(data);
            self.decrypted.extend_from_slice(&plain);
        } else {
            self.cleartext.extend_from_slice(data);
        }
    }

    fn negotiate(&mut self, data: &[u8]) -> Result<Processed> {
        self.absorb(data);

        let mut reply = Vec::new();
        loop {
            let progressed = match self.stage {
                Stage::ReadHello => self.read_hello(&mut reply)?,
                Stage::ReadDhPublic => self.read_dh_public()?,
                Stage::ReadOffer => self.read_offer(&mut reply)?,
                Stage::ReadChoice => self.read_choice()?,
                Stage::Idle | Stage::Done => false,
            };
            if !progressed {
                break;
            }
        }

        let plaintext = if self.state == CryptState::Encrypting {
            std::mem::take(&mut self.decrypted)
        } else {
            Vec::new()
        };
        Ok(Processed {
            plaintext,
            reply: (!reply.is_empty()).then_some(reply),
        })
    }

    fn read_hello(&mut self, reply: &mut Vec<u8>) -> Result<bool> {
        match self.strategy.clone() {
            HandshakeStrategy::SharedSecret { hash } => {
                if self.cleartext.len() < 5 {
                    return Ok(false);
                }
                let nonce = [self.cleartext[1], self.cleartext[2], self.cleartext[3], self.cleartext[4]];
                self.install(SessionKeys::shared_secret(&hash, &nonce, Role::Responder));

                let rest = self.cleartext.split_off(5);
                self.cleartext.clear();
                self.absorb(&rest);
                self.stage = Stage::ReadOffer;
                Ok(true)
            }
            HandshakeStrategy::DiffieHellman => {
                if self.cleartext.len() < 1 + DH_KEY_SIZE {
                    return Ok(false);
                }
                let peer_public = BigUint::from_bytes_be(&self.cleartext[1..1 + DH_KEY_SIZE]);
                // the initiator pads with 0..15 unframed bytes and then waits
                let padding = self.cleartext.len() - 1 - DH_KEY_SIZE;
                trace!("Discarding {} bytes of DH padding from {}", padding, self.peer);
                self.cleartext.clear();

                let exponent = random_exponent();
                let secret = self.dh_secret(&peer_public, &exponent)?;
                self.install(SessionKeys::diffie_hellman(&secret, Role::Responder));

                reply.extend(fixed_width(&dh_public(&exponent)));
                reply.extend(self.encrypt_block(&[SUPPORTED_METHODS, PREFERRED_METHOD])?);
                debug!("HANDSHAKE > {} DH answer", self.peer);
                self.stage = Stage::ReadChoice;
                Ok(true)
            }
        }
    }

    fn read_dh_public(&mut self) -> Result<bool> {
        if self.cleartext.len() < DH_KEY_SIZE {
            return Ok(false);
        }
        let peer_public = BigUint::from_bytes_be(&self.cleartext[..DH_KEY_SIZE]);
        let exponent = self
            .dh_exponent
            .take()
            .ok_or_else(|| Ed2kError::handshake_error("Missing DH exponent"))?;
        let secret = self.dh_secret(&peer_public, &exponent)?;
        self.install(SessionKeys::diffie_hellman(&secret, Role::Initiator));

        let rest = self.cleartext.split_off(DH_KEY_SIZE);
        self.cleartext.clear();
        self.absorb(&rest);
        self.stage = Stage::ReadOffer;
        Ok(true)
    }

    fn read_offer(&mut self, reply: &mut Vec<u8>) -> Result<bool> {
        let Some((fields, consumed)) = self.parse_block(2)? else {
            return Ok(false);
        };
        trace!(
            "Peer {} supports methods 0x{:02x}, prefers {}",
            self.peer,
            fields[0],
            fields[1]
        );
        if fields[1] != METHOD_OBFUSCATION {
            return Err(self.fail("Encryption method not supported", Some(format!("method {}", fields[1]))));
        }
        self.decrypted.drain(..consumed);

        reply.extend(self.encrypt_block(&[METHOD_OBFUSCATION])?);
        self.finish();
        Ok(true)
    }

    fn read_choice(&mut self) -> Result<bool> {
        let Some((fields, consumed)) = self.parse_block(1)? else {
            return Ok(false);
        };
        if fields[0] != METHOD_OBFUSCATION {
            return Err(self.fail("Encryption method not supported", Some(format!("method {}", fields[0]))));
        }
        self.decrypted.drain(..consumed);
        self.finish();
        Ok(true)
    }

    fn finish(&mut self) {
        debug!("HANDSHAKE {} complete, encrypting", self.peer);
        self.state = CryptState::Encrypting;
        self.stage = Stage::Done;
        self.deadline = None;
    }

    /// `sync(4) fields(n) padlen(1) pad` from the decrypted buffer
    fn parse_block(&self, fields: usize) -> Result<Option<(Vec<u8>, usize)>> {
        let buf = &self.decrypted;
        if buf.len() < 4 {
            return Ok(None);
        }
        let sync = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if sync != MAGIC_SYNC {
            return Err(self.fail("Wrong sync value", Some(format!("0x{:08x}", sync))));
        }
        let header = 4 + fields + 1;
        if buf.len() < header {
            return Ok(None);
        }
        let total = header + buf[header - 1] as usize;
        if buf.len() < total {
            return Ok(None);
        }
        Ok(Some((buf[4..4 + fields].to_vec(), total)))
    }

    fn encrypt_block(&mut self, fields: &[u8]) -> Result<Vec<u8>> {
        let pad = random_padding(MAX_PADDING);
        let mut cursor = ByteCursor::with_capacity(4 + fields.len() + 1 + pad.len());
        cursor
            .write_u32(MAGIC_SYNC)
            .write_bytes(fields)
            .write_u8(pad.len() as u8)
            .write_bytes(&pad);
        let send = self.send.as_mut().ok_or_else(|| Ed2kError::handshake_error("Missing send key"))?;
        Ok(send.process(cursor.written()))
    }

    fn dh_secret(&self, peer_public: &BigUint, exponent: &BigUint) -> Result<Vec<u8>> {
        let prime = prime();
        let one = BigUint::from(1u32);
        if *peer_public <= one || *peer_public >= prime {
            return Err(self.fail("Invalid DH public value", None));
        }
        Ok(fixed_width(&peer_public.modpow(exponent, &prime)))
    }

    fn fail(&self, message: &str, source: Option<String>) -> anyhow::Error {
        warn!("HANDSHAKE {}: {}", self.peer, message);
        match source {
            Some(source) => Ed2kError::handshake_error_full(message, self.peer.clone(), source).into(),
            None => Ed2kError::handshake_error_with_peer(message, self.peer.clone()).into(),
        }
    }
}

fn prime() -> BigUint {
    BigUint::from_bytes_be(&CRYPT_PRIME)
}

fn random_exponent() -> BigUint {
    let bytes: [u8; DH_EXPONENT_SIZE] = rand::thread_rng().gen();
    BigUint::from_bytes_be(&bytes)
}

fn dh_public(exponent: &BigUint) -> BigUint {
    BigUint::from(2u32).modpow(exponent, &prime())
}

/// Big-endian bytes left-padded with zeros to the prime size
fn fixed_width(value: &BigUint) -> Vec<u8> {
    let bytes = value.to_bytes_be();
    let mut out = vec![0u8; DH_KEY_SIZE.saturating_sub(bytes.len())];
    out.extend_from_slice(&bytes);
    out
}
