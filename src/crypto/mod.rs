//! Protocol obfuscation
//!
//! RC4 keyed by MD5 digests hides ed2k traffic from pattern matching. It
//! gives no protection against an active attacker.

pub mod handshake;
pub mod rc4;
pub mod udp;

use rand::Rng;

use crate::protocol::constants::is_protocol;

pub use handshake::{CryptState, HandshakeStrategy, Processed, Role, SessionKeys, TcpCrypt};
pub use rc4::{Rc4Key, Rc4Stream};
pub use udp::{Direction, UdpKeyspace, UdpObfuscation, UdpPayload};

/// MD5 of `data`
pub fn md5_digest(data: &[u8]) -> [u8; 16] {
    md5::compute(data).0
}

/// Random byte that is not a cleartext protocol code
pub fn random_marker() -> u8 {
    let mut rng = rand::thread_rng();
    loop {
        let byte: u8 = rng.gen();
        if !is_protocol(byte) {
            return byte;
        }
    }
}

/// Between 0 and `max` random bytes, inclusive
pub fn random_padding(max: usize) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    let len = rng.gen_range(0..=max);
    (0..len).map(|_| rng.gen()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_md5_digest() {
        assert_eq!(hex::encode(md5_digest(b"")), "d41d8cd98f00b204e9800998ecf8427e");
    }

    #[test]
    fn test_random_marker_never_protocol() {
        for _ in 0..2000 {
            assert!(!is_protocol(random_marker()));
        }
    }

    #[test]
    fn test_random_padding_bounds() {
        for _ in 0..100 {
            assert!(random_padding(15).len() <= 15);
        }
    }
}
