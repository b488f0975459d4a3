//! Blake2b byte generators
//!
//! Deterministic filler for entropy buffers, scratchpads and synthetic
//! datasets. Real RandomX derives these from AES and a memory-hard dataset
//! function; both stay outside the VM core, so callers only need bytes that
//! are reproducible from a seed.

use blake2::{Blake2b512, Digest};
use rayon::prelude::*;

const BLOCK: usize = 64;

/// Blake2b-based random generator
pub struct Blake2Generator {
    /// Current state (64 bytes)
    state: [u8; BLOCK],
    /// Current position in state
    position: usize,
}

impl Blake2Generator {
    /// Create a generator for one instance of a seeded stream
    pub fn new(seed: &[u8], nonce: u64) -> Self {
        let mut hasher = Blake2b512::new();
        hasher.update(seed);
        hasher.update(nonce.to_le_bytes());
        Self {
            state: hasher.finalize().into(),
            position: 0,
        }
    }

    /// Get next byte
    pub fn next_byte(&mut self) -> u8 {
        if self.position == BLOCK {
            self.rehash();
        }
        let byte = self.state[self.position];
        self.position += 1;
        byte
    }

    /// Get next u64 (little-endian)
    pub fn next_u64(&mut self) -> u64 {
        let mut bytes = [0u8; 8];
        self.fill_bytes(&mut bytes);
        u64::from_le_bytes(bytes)
    }

    /// Fill buffer with random bytes
    pub fn fill_bytes(&mut self, buf: &mut [u8]) {
        let mut filled = 0;
        while filled < buf.len() {
            if self.position == BLOCK {
                self.rehash();
            }
            let take = (BLOCK - self.position).min(buf.len() - filled);
            buf[filled..filled + take]
                .copy_from_slice(&self.state[self.position..self.position + take]);
            self.position += take;
            filled += take;
        }
    }

    fn rehash(&mut self) {
        let mut hasher = Blake2b512::new();
        hasher.update(self.state);
        self.state = hasher.finalize().into();
        self.position = 0;
    }
}

/// Fill a large buffer in counter mode: block `i` is `Blake2b512(seed || i)`.
/// Blocks are independent, so the fill runs on the rayon pool.
pub fn fill_counter_mode(seed: &[u8], buf: &mut [u8]) {
    buf.par_chunks_mut(BLOCK).enumerate().for_each(|(i, chunk)| {
        let mut hasher = Blake2b512::new();
        hasher.update(seed);
        hasher.update((i as u64).to_le_bytes());
        let block: [u8; BLOCK] = hasher.finalize().into();
        chunk.copy_from_slice(&block[..chunk.len()]);
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generator_is_deterministic() {
        let mut a = Blake2Generator::new(b"seed", 7);
        let mut b = Blake2Generator::new(b"seed", 7);
        let mut buf_a = [0u8; 200];
        let mut buf_b = [0u8; 200];
        a.fill_bytes(&mut buf_a);
        b.fill_bytes(&mut buf_b);
        assert_eq!(buf_a, buf_b);

        let mut c = Blake2Generator::new(b"seed", 8);
        let mut buf_c = [0u8; 200];
        c.fill_bytes(&mut buf_c);
        assert_ne!(buf_a, buf_c);
    }

    #[test]
    fn split_reads_match_one_read() {
        let mut whole = Blake2Generator::new(b"split", 0);
        let mut parts = Blake2Generator::new(b"split", 0);
        let mut buf = [0u8; 150];
        whole.fill_bytes(&mut buf);

        let mut joined = Vec::new();
        for _ in 0..150 {
            joined.push(parts.next_byte());
        }
        assert_eq!(&buf[..], &joined[..]);
    }

    #[test]
    fn counter_mode_handles_partial_tail() {
        let mut buf = vec![0u8; 130];
        fill_counter_mode(b"tail", &mut buf);
        let mut again = vec![0u8; 130];
        fill_counter_mode(b"tail", &mut again);
        assert_eq!(buf, again);
        assert_ne!(buf[..64], buf[64..128]);
    }
}
