// SPDX-FileCopyrightText: 2025 The otapply Authors
// SPDX-License-Identifier: GPL-3.0-only

//! Incremental SHA-256 whose midstream state can be exported to a string and
//! restored later, potentially by a different process. The mainstream digest
//! crates intentionally hide their internal state, which makes them unusable
//! for hashing a stream across process restarts, so the compression function
//! is implemented here. Correctness is cross-checked against `sha2` in the
//! tests.

use base64::{Engine, engine::general_purpose::STANDARD};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid base64 in hash context")]
    ContextBase64(#[from] base64::DecodeError),
    #[error("Hash context has invalid size: {0}")]
    ContextSize(usize),
    #[error("Hash context is internally inconsistent")]
    ContextInconsistent,
}

type Result<T> = std::result::Result<T, Error>;

const H0: [u32; 8] = [
    0x6a09e667, 0xbb67ae85, 0x3c6ef372, 0xa54ff53a, 0x510e527f, 0x9b05688c, 0x1f83d9ab, 0x5be0cd19,
];

const K: [u32; 64] = [
    0x428a2f98, 0x71374491, 0xb5c0fbcf, 0xe9b5dba5, 0x3956c25b, 0x59f111f1, 0x923f82a4, 0xab1c5ed5,
    0xd807aa98, 0x12835b01, 0x243185be, 0x550c7dc3, 0x72be5d74, 0x80deb1fe, 0x9bdc06a7, 0xc19bf174,
    0xe49b69c1, 0xefbe4786, 0x0fc19dc6, 0x240ca1cc, 0x2de92c6f, 0x4a7484aa, 0x5cb0a9dc, 0x76f988da,
    0x983e5152, 0xa831c66d, 0xb00327c8, 0xbf597fc7, 0xc6e00bf3, 0xd5a79147, 0x06ca6351, 0x14292967,
    0x27b70a85, 0x2e1b2138, 0x4d2c6dfc, 0x53380d13, 0x650a7354, 0x766a0abb, 0x81c2c92e, 0x92722c85,
    0xa2bfe8a1, 0xa81a664b, 0xc24b8b70, 0xc76c51a3, 0xd192e819, 0xd6990624, 0xf40e3585, 0x106aa070,
    0x19a4c116, 0x1e376c08, 0x2748774c, 0x34b0bcb5, 0x391c0cb3, 0x4ed8aa4a, 0x5b9cca4f, 0x682e6ff3,
    0x748f82ee, 0x78a5636f, 0x84c87814, 0x8cc70208, 0x90befffa, 0xa4506ceb, 0xbef9a3f7, 0xc67178f2,
];

const BLOCK_SIZE: usize = 64;
// 8 state words plus the 64-bit message length.
const CONTEXT_FIXED_SIZE: usize = 8 * 4 + 8;

/// Streaming SHA-256 with serializable midstream state.
#[derive(Clone, Debug)]
pub struct PayloadHasher {
    state: [u32; 8],
    length: u64,
    partial: Vec<u8>,
}

impl Default for PayloadHasher {
    fn default() -> Self {
        Self::new()
    }
}

impl PayloadHasher {
    pub fn new() -> Self {
        Self {
            state: H0,
            length: 0,
            partial: Vec::with_capacity(BLOCK_SIZE),
        }
    }

    pub fn update(&mut self, mut data: &[u8]) {
        self.length = self.length.wrapping_add(data.len() as u64);

        if !self.partial.is_empty() {
            let need = BLOCK_SIZE - self.partial.len();
            let take = need.min(data.len());
            self.partial.extend_from_slice(&data[..take]);
            data = &data[take..];

            if self.partial.len() == BLOCK_SIZE {
                let block: [u8; BLOCK_SIZE] = self.partial[..].try_into().unwrap();
                compress(&mut self.state, &block);
                self.partial.clear();
            }
        }

        let mut chunks = data.chunks_exact(BLOCK_SIZE);
        for chunk in &mut chunks {
            compress(&mut self.state, chunk.try_into().unwrap());
        }
        self.partial.extend_from_slice(chunks.remainder());
    }

    /// Completes the hash. Restore from [`Self::context`] to keep feeding the
    /// same stream afterwards.
    pub fn finalize(mut self) -> [u8; 32] {
        let bit_length = self.length.wrapping_mul(8);

        self.update(&[0x80]);
        while self.partial.len() != BLOCK_SIZE - 8 {
            self.update(&[0]);
        }
        // The padding updates above also advanced self.length, which is why
        // bit_length was snapshotted first.
        self.partial.extend_from_slice(&bit_length.to_be_bytes());
        let block: [u8; BLOCK_SIZE] = self.partial[..].try_into().unwrap();
        compress(&mut self.state, &block);

        let mut digest = [0u8; 32];
        for (chunk, word) in digest.chunks_exact_mut(4).zip(self.state) {
            chunk.copy_from_slice(&word.to_be_bytes());
        }
        digest
    }

    /// Exports the midstream state as a printable string.
    pub fn context(&self) -> String {
        let mut raw = Vec::with_capacity(CONTEXT_FIXED_SIZE + self.partial.len());
        for word in self.state {
            raw.extend_from_slice(&word.to_be_bytes());
        }
        raw.extend_from_slice(&self.length.to_be_bytes());
        raw.extend_from_slice(&self.partial);

        STANDARD.encode(raw)
    }

    /// Restores a hasher from a string produced by [`Self::context`].
    pub fn from_context(context: &str) -> Result<Self> {
        let raw = STANDARD.decode(context)?;
        if raw.len() < CONTEXT_FIXED_SIZE || raw.len() >= CONTEXT_FIXED_SIZE + BLOCK_SIZE {
            return Err(Error::ContextSize(raw.len()));
        }

        let mut state = [0u32; 8];
        for (word, chunk) in state.iter_mut().zip(raw.chunks_exact(4)) {
            *word = u32::from_be_bytes(chunk.try_into().unwrap());
        }
        let length = u64::from_be_bytes(raw[32..40].try_into().unwrap());
        let partial = raw[CONTEXT_FIXED_SIZE..].to_vec();

        if partial.len() as u64 != length % BLOCK_SIZE as u64 {
            return Err(Error::ContextInconsistent);
        }

        Ok(Self {
            state,
            length,
            partial,
        })
    }

    /// Total number of bytes fed so far.
    pub fn length(&self) -> u64 {
        self.length
    }
}

fn compress(state: &mut [u32; 8], block: &[u8; BLOCK_SIZE]) {
    let mut w = [0u32; 64];
    for (word, chunk) in w[..16].iter_mut().zip(block.chunks_exact(4)) {
        *word = u32::from_be_bytes(chunk.try_into().unwrap());
    }
    for i in 16..64 {
        let s0 = w[i - 15].rotate_right(7) ^ w[i - 15].rotate_right(18) ^ (w[i - 15] >> 3);
        let s1 = w[i - 2].rotate_right(17) ^ w[i - 2].rotate_right(19) ^ (w[i - 2] >> 10);
        w[i] = w[i - 16]
            .wrapping_add(s0)
            .wrapping_add(w[i - 7])
            .wrapping_add(s1);
    }

    let [mut a, mut b, mut c, mut d, mut e, mut f, mut g, mut h] = *state;

    for i in 0..64 {
        let s1 = e.rotate_right(6) ^ e.rotate_right(11) ^ e.rotate_right(25);
        let ch = (e & f) ^ (!e & g);
        let t1 = h
            .wrapping_add(s1)
            .wrapping_add(ch)
            .wrapping_add(K[i])
            .wrapping_add(w[i]);
        let s0 = a.rotate_right(2) ^ a.rotate_right(13) ^ a.rotate_right(22);
        let maj = (a & b) ^ (a & c) ^ (b & c);
        let t2 = s0.wrapping_add(maj);

        h = g;
        g = f;
        f = e;
        e = d.wrapping_add(t1);
        d = c;
        c = b;
        b = a;
        a = t1.wrapping_add(t2);
    }

    for (word, value) in state.iter_mut().zip([a, b, c, d, e, f, g, h]) {
        *word = word.wrapping_add(value);
    }
}
