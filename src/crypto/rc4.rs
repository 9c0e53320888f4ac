//! RC4 stream cipher
//!
//! `Rc4Key` is an immutable snapshot of the cipher state right after key
//! setup. Encrypting or decrypting needs a `Rc4Stream` obtained from
//! `Rc4Key::start`, so a stored key can never be advanced by accident.

/// Keystream bytes discarded after setup for TCP keys
pub const DROP_BYTES: usize = 1024;

/// Cipher state snapshot
#[derive(Clone, PartialEq, Eq)]
pub struct Rc4Key {
    state: [u8; 256],
    x: u8,
    y: u8,
}

impl std::fmt::Debug for Rc4Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rc4Key").field("x", &self.x).field("y", &self.y).finish_non_exhaustive()
    }
}

impl Rc4Key {
    /// Run the key schedule over `secret`. With `drop` the first
    /// `DROP_BYTES` of keystream are generated and thrown away.
    pub fn new(secret: &[u8], drop: bool) -> Self {
        let mut state = [0u8; 256];
        for (i, slot) in state.iter_mut().enumerate() {
            *slot = i as u8;
        }

        if !secret.is_empty() {
            let mut j: u8 = 0;
            for i in 0..256 {
                j = j.wrapping_add(secret[i % secret.len()]).wrapping_add(state[i]);
                state.swap(i, j as usize);
            }
        }

        let key = Self { state, x: 0, y: 0 };
        if !drop {
            return key;
        }

        let mut stream = key.start();
        stream.skip(DROP_BYTES);
        stream.snapshot()
    }

    /// Wrap a stored permutation with `x = y = 0`
    pub fn from_permutation(state: &[u8; 256]) -> Self {
        Self {
            state: *state,
            x: 0,
            y: 0,
        }
    }

    pub fn permutation(&self) -> &[u8; 256] {
        &self.state
    }

    /// Fresh mutable stream positioned at this snapshot
    pub fn start(&self) -> Rc4Stream {
        Rc4Stream {
            state: self.state,
            x: self.x,
            y: self.y,
        }
    }
}

/// Running cipher. Every processed byte advances the state.
#[derive(Clone)]
pub struct Rc4Stream {
    state: [u8; 256],
    x: u8,
    y: u8,
}

impl std::fmt::Debug for Rc4Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rc4Stream").field("x", &self.x).field("y", &self.y).finish_non_exhaustive()
    }
}

impl Rc4Stream {
    #[inline]
    fn next_byte(&mut self) -> u8 {
        self.x = self.x.wrapping_add(1);
        self.y = self.y.wrapping_add(self.state[self.x as usize]);
        self.state.swap(self.x as usize, self.y as usize);
        let idx = self.state[self.x as usize].wrapping_add(self.state[self.y as usize]);
        self.state[idx as usize]
    }

    /// XOR `data` with the keystream in place
    pub fn apply(&mut self, data: &mut [u8]) {
        for byte in data.iter_mut() {
            *byte ^= self.next_byte();
        }
    }

    /// XOR a copy of `data` with the keystream
    pub fn process(&mut self, data: &[u8]) -> Vec<u8> {
        let mut out = data.to_vec();
        self.apply(&mut out);
        out
    }

    /// Advance without producing output
    pub fn skip(&mut self, n: usize) {
        for _ in 0..n {
            self.next_byte();
        }
    }

    /// Freeze the current state
    pub fn snapshot(&self) -> Rc4Key {
        Rc4Key {
            state: self.state,
            x: self.x,
            y: self.y,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_vector() {
        let key = Rc4Key::new(b"Key", false);
        let out = key.start().process(b"Plaintext");
        assert_eq!(hex::encode(out), "bbf316e8d940af0ad3");
    }

    #[test]
    fn test_second_known_vector() {
        let key = Rc4Key::new(b"Wiki", false);
        let out = key.start().process(b"pedia");
        assert_eq!(hex::encode(out), "1021bf0420");
    }

    #[test]
    fn test_self_inverse_with_independent_keys() {
        let plain = b"ed2k obfuscated payload".to_vec();
        let k1 = Rc4Key::new(&[7u8; 16], true);
        let k2 = Rc4Key::new(&[7u8; 16], true);
        let cipher = k1.start().process(&plain);
        assert_ne!(cipher, plain);
        assert_eq!(k2.start().process(&cipher), plain);
    }

    #[test]
    fn test_stored_key_not_advanced() {
        let key = Rc4Key::new(b"secret", false);
        let first = key.start().process(&[0u8; 8]);
        let second = key.start().process(&[0u8; 8]);
        assert_eq!(first, second);
    }

    #[test]
    fn test_drop_matches_manual_skip() {
        let dropped = Rc4Key::new(b"secret", true);
        let mut manual = Rc4Key::new(b"secret", false).start();
        manual.skip(DROP_BYTES);
        assert_eq!(dropped.start().process(&[0u8; 16]), manual.process(&[0u8; 16]));
    }

    #[test]
    fn test_streaming_equals_one_shot() {
        let key = Rc4Key::new(b"chunked", false);
        let data: Vec<u8> = (0..100u8).collect();
        let whole = key.start().process(&data);

        let mut stream = key.start();
        let mut parts = stream.process(&data[..33]);
        parts.extend(stream.process(&data[33..]));
        assert_eq!(parts, whole);
    }
}
