//! UDP obfuscation
//!
//! Every datagram picks a random 16-bit nonce, so every possible key is
//! derived once at startup: `RC4(MD5(server key ++ direction magic ++ nonce))`
//! for all 65536 nonces in both directions. The table is read-only after
//! construction and shared between tasks behind an `Arc`.

use std::sync::Arc;

use anyhow::Result;
use rand::Rng;
use tracing::{debug, info, trace};

use crate::crypto::rc4::{Rc4Key, Rc4Stream};
use crate::crypto::{md5_digest, random_marker};
use crate::error::Ed2kError;
use crate::protocol::constants::is_protocol;
use crate::protocol::cursor::ByteCursor;

/// Sync value at the start of every decrypted datagram
pub const UDP_SYNC: u32 = 0x13EF_24D5;

const MAGIC_SERVER_TO_CLIENT: u8 = 0xA5;
const MAGIC_CLIENT_TO_SERVER: u8 = 0x6B;
const NONCE_COUNT: usize = 1 << 16;

/// marker(1) + nonce(2) + sync(4) + padlen(1)
const MIN_OBFUSCATED_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ServerToClient,
    ClientToServer,
}

impl Direction {
    fn magic(self) -> u8 {
        match self {
            Direction::ServerToClient => MAGIC_SERVER_TO_CLIENT,
            Direction::ClientToServer => MAGIC_CLIENT_TO_SERVER,
        }
    }

    fn offset(self) -> usize {
        match self {
            Direction::ServerToClient => 0,
            Direction::ClientToServer => NONCE_COUNT,
        }
    }
}

/// Precomputed key permutations for both directions
pub struct UdpKeyspace {
    server_key: u32,
    permutations: Vec<[u8; 256]>,
}

impl std::fmt::Debug for UdpKeyspace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpKeyspace")
            .field("server_key", &format_args!("0x{:08x}", self.server_key))
            .field("keys", &self.permutations.len())
            .finish()
    }
}

impl UdpKeyspace {
    /// Derive all 2 × 65536 keys. Takes a noticeable moment and about 32MB.
    pub fn build(server_key: u32) -> Self {
        info!("Building UDP keyspace for server key 0x{:08x}", server_key);
        let mut permutations = vec![[0u8; 256]; 2 * NONCE_COUNT];

        for direction in [Direction::ServerToClient, Direction::ClientToServer] {
            let mut seed = [0u8; 7];
            seed[..4].copy_from_slice(&server_key.to_le_bytes());
            seed[4] = direction.magic();
            for nonce in 0..NONCE_COUNT {
                seed[5..].copy_from_slice(&(nonce as u16).to_le_bytes());
                let key = Rc4Key::new(&md5_digest(&seed), false);
                permutations[direction.offset() + nonce] = *key.permutation();
            }
        }

        debug!("UDP keyspace ready ({} keys)", permutations.len());
        Self {
            server_key,
            permutations,
        }
    }

    pub fn server_key(&self) -> u32 {
        self.server_key
    }

    /// Fresh stream for `nonce`; the stored permutation is copied
    pub fn key(&self, direction: Direction, nonce: u16) -> Rc4Stream {
        Rc4Key::from_permutation(&self.permutations[direction.offset() + nonce as usize]).start()
    }
}

/// A datagram after the obfuscation layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpPayload {
    pub data: Vec<u8>,
    /// Whether the datagram arrived obfuscated
    pub obfuscated: bool,
}

/// One endpoint's view of the keyspace
#[derive(Debug, Clone)]
pub struct UdpObfuscation {
    keyspace: Arc<UdpKeyspace>,
    send: Direction,
    recv: Direction,
}

impl UdpObfuscation {
    /// Server side: receives client→server, sends server→client
    pub fn server(keyspace: Arc<UdpKeyspace>) -> Self {
        Self {
            keyspace,
            send: Direction::ServerToClient,
            recv: Direction::ClientToServer,
        }
    }

    /// Client side, the mirror of `server`
    pub fn client(keyspace: Arc<UdpKeyspace>) -> Self {
        Self {
            keyspace,
            send: Direction::ClientToServer,
            recv: Direction::ServerToClient,
        }
    }

    /// Strip obfuscation. Cleartext datagrams pass through unchanged; a sync
    /// mismatch is an error and the datagram must be dropped.
    pub fn decrypt(&self, datagram: &[u8]) -> Result<UdpPayload> {
        let Some(&first) = datagram.first() else {
            return Err(Ed2kError::protocol_error("Empty datagram").into());
        };
        if is_protocol(first) {
            return Ok(UdpPayload {
                data: datagram.to_vec(),
                obfuscated: false,
            });
        }
        if datagram.len() < MIN_OBFUSCATED_LEN {
            return Err(Ed2kError::protocol_error_with_source(
                "Obfuscated datagram too short",
                format!("{} bytes", datagram.len()),
            )
            .into());
        }

        let nonce = u16::from_le_bytes([datagram[1], datagram[2]]);
        let plain = self.keyspace.key(self.recv, nonce).process(&datagram[3..]);

        let mut cursor = ByteCursor::from_vec(plain);
        let sync = cursor.read_u32()?;
        if sync != UDP_SYNC {
            trace!("UDP sync mismatch 0x{:08x} for nonce {}", sync, nonce);
            return Err(Ed2kError::protocol_error_with_source(
                "Wrong UDP sync value",
                format!("0x{:08x}", sync),
            )
            .into());
        }
        let pad = cursor.read_u8()? as usize;
        cursor.read_bytes(pad)?;

        Ok(UdpPayload {
            data: cursor.read_rest(),
            obfuscated: true,
        })
    }

    /// Obfuscate with a random nonce
    pub fn encrypt(&self, payload: &[u8]) -> Vec<u8> {
        let nonce: u16 = rand::thread_rng().gen();
        self.encrypt_with_nonce(payload, nonce)
    }

    pub fn encrypt_with_nonce(&self, payload: &[u8], nonce: u16) -> Vec<u8> {
        let mut body = ByteCursor::with_capacity(5 + payload.len());
        body.write_u32(UDP_SYNC).write_u8(0).write_bytes(payload);
        let encrypted = self.keyspace.key(self.send, nonce).process(body.written());

        let mut out = ByteCursor::with_capacity(3 + encrypted.len());
        out.write_u8(random_marker()).write_u16(nonce).write_bytes(&encrypted);
        out.into_written()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::constants::PR_ED2K;
    use std::sync::OnceLock;

    fn keyspace() -> Arc<UdpKeyspace> {
        static KEYSPACE: OnceLock<Arc<UdpKeyspace>> = OnceLock::new();
        KEYSPACE
            .get_or_init(|| Arc::new(UdpKeyspace::build(0x12345678)))
            .clone()
    }

    #[test]
    fn test_key_matches_direct_derivation() {
        let space = keyspace();
        let mut seed = Vec::new();
        seed.extend_from_slice(&0x12345678u32.to_le_bytes());
        seed.push(MAGIC_CLIENT_TO_SERVER);
        seed.extend_from_slice(&7u16.to_le_bytes());
        let direct = Rc4Key::new(&md5_digest(&seed), false);

        let zeros = [0u8; 32];
        assert_eq!(
            space.key(Direction::ClientToServer, 7).process(&zeros),
            direct.start().process(&zeros)
        );
    }

    #[test]
    fn test_keys_are_fresh_copies() {
        let space = keyspace();
        let first = space.key(Direction::ServerToClient, 99).process(&[0u8; 16]);
        let second = space.key(Direction::ServerToClient, 99).process(&[0u8; 16]);
        assert_eq!(first, second);
    }

    #[test]
    fn test_round_trip_random_nonces() {
        let server = UdpObfuscation::server(keyspace());
        let client = UdpObfuscation::client(keyspace());
        let mut rng = rand::thread_rng();

        for _ in 0..1000 {
            let len = rng.gen_range(0..64);
            let payload: Vec<u8> = (0..len).map(|_| rng.gen()).collect();

            let upstream = server.decrypt(&client.encrypt(&payload)).unwrap();
            assert!(upstream.obfuscated);
            assert_eq!(upstream.data, payload);

            let downstream = client.decrypt(&server.encrypt(&payload)).unwrap();
            assert_eq!(downstream.data, payload);
        }
    }

    #[test]
    fn test_cleartext_passes_through() {
        let server = UdpObfuscation::server(keyspace());
        let datagram = [PR_ED2K, 0x96, 1, 2, 3, 4];
        let out = server.decrypt(&datagram).unwrap();
        assert!(!out.obfuscated);
        assert_eq!(out.data, datagram);
    }

    #[test]
    fn test_wrong_direction_is_dropped() {
        let server = UdpObfuscation::server(keyspace());
        // server output decrypted with the server's own receive keys
        let datagram = server.encrypt_with_nonce(&[PR_ED2K, 0x96, 0, 0, 0, 0], 1234);
        assert!(server.decrypt(&datagram).is_err());
    }

    #[test]
    fn test_short_datagram_rejected() {
        let server = UdpObfuscation::server(keyspace());
        assert!(server.decrypt(&[0x01, 0x02, 0x03]).is_err());
        assert!(server.decrypt(&[]).is_err());
    }
}
