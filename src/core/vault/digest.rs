//! Incremental SHA-256 (FIPS 180-4), fed piecewise so callers can hash
//! `key || nonce || counter` style inputs without concatenating them first.

const BLOCK_LEN: usize = 64;
const LENGTH_OFFSET: usize = BLOCK_LEN - 8;

const INITIAL_STATE: [u32; 8] = [
    0x6a09e667, 0xbb67ae85, 0x3c6ef372, 0xa54ff53a, 0x510e527f, 0x9b05688c, 0x1f83d9ab, 0x5be0cd19,
];

const ROUND_CONSTANTS: [u32; 64] = [
    0x428a2f98, 0x71374491, 0xb5c0fbcf, 0xe9b5dba5, 0x3956c25b, 0x59f111f1, 0x923f82a4, 0xab1c5ed5,
    0xd807aa98, 0x12835b01, 0x243185be, 0x550c7dc3, 0x72be5d74, 0x80deb1fe, 0x9bdc06a7, 0xc19bf174,
    0xe49b69c1, 0xefbe4786, 0x0fc19dc6, 0x240ca1cc, 0x2de92c6f, 0x4a7484aa, 0x5cb0a9dc, 0x76f988da,
    0x983e5152, 0xa831c66d, 0xb00327c8, 0xbf597fc7, 0xc6e00bf3, 0xd5a79147, 0x06ca6351, 0x14292967,
    0x27b70a85, 0x2e1b2138, 0x4d2c6dfc, 0x53380d13, 0x650a7354, 0x766a0abb, 0x81c2c92e, 0x92722c85,
    0xa2bfe8a1, 0xa81a664b, 0xc24b8b70, 0xc76c51a3, 0xd192e819, 0xd6990624, 0xf40e3585, 0x106aa070,
    0x19a4c116, 0x1e376c08, 0x2748774c, 0x34b0bcb5, 0x391c0cb3, 0x4ed8aa4a, 0x5b9cca4f, 0x682e6ff3,
    0x748f82ee, 0x78a5636f, 0x84c87814, 0x8cc70208, 0x90befffa, 0xa4506ceb, 0xbef9a3f7, 0xc67178f2,
];

#[derive(Clone)]
pub(crate) struct Sha256 {
    state: [u32; 8],
    pending: [u8; BLOCK_LEN],
    pending_len: usize,
    message_len: u64,
}

impl Sha256 {
    pub(crate) fn new() -> Self {
        Self {
            state: INITIAL_STATE,
            pending: [0; BLOCK_LEN],
            pending_len: 0,
            message_len: 0,
        }
    }

    pub(crate) fn update(mut self, mut bytes: &[u8]) -> Self {
        self.message_len = self.message_len.wrapping_add(bytes.len() as u64);
        while !bytes.is_empty() {
            let take = (BLOCK_LEN - self.pending_len).min(bytes.len());
            let (head, rest) = bytes.split_at(take);
            self.pending[self.pending_len..self.pending_len + take].copy_from_slice(head);
            self.pending_len += take;
            bytes = rest;
            if self.pending_len == BLOCK_LEN {
                let block = self.pending;
                self.compress(&block);
                self.pending_len = 0;
            }
        }
        self
    }

    pub(crate) fn finalize(self) -> [u8; 32] {
        let bit_len = self.message_len.wrapping_mul(8);
        // 0x80, then zeros until 8 bytes remain in the block for the length.
        let padding_len = if self.pending_len < LENGTH_OFFSET {
            LENGTH_OFFSET - self.pending_len
        } else {
            BLOCK_LEN + LENGTH_OFFSET - self.pending_len
        };
        let mut padding = [0_u8; BLOCK_LEN];
        padding[0] = 0x80;

        let hasher = self
            .update(&padding[..padding_len])
            .update(&bit_len.to_be_bytes());

        let mut out = [0_u8; 32];
        for (bytes, word) in out.chunks_exact_mut(4).zip(hasher.state) {
            bytes.copy_from_slice(&word.to_be_bytes());
        }
        out
    }

    fn compress(&mut self, block: &[u8; BLOCK_LEN]) {
        // Rolling 16-word message schedule: slot `round % 16` holds w[round].
        let mut schedule = [0_u32; 16];
        for (word, bytes) in schedule.iter_mut().zip(block.chunks_exact(4)) {
            *word = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        }

        let mut working = self.state;
        for (round, constant) in ROUND_CONSTANTS.iter().enumerate() {
            if round >= 16 {
                let older = schedule[(round + 1) % 16];
                let recent = schedule[(round + 14) % 16];
                let small_sigma0 = older.rotate_right(7) ^ older.rotate_right(18) ^ (older >> 3);
                let small_sigma1 =
                    recent.rotate_right(17) ^ recent.rotate_right(19) ^ (recent >> 10);
                schedule[round % 16] = schedule[round % 16]
                    .wrapping_add(small_sigma0)
                    .wrapping_add(schedule[(round + 9) % 16])
                    .wrapping_add(small_sigma1);
            }

            let [a, b, c, d, e, f, g, h] = working;
            let big_sigma1 = e.rotate_right(6) ^ e.rotate_right(11) ^ e.rotate_right(25);
            let choose = (e & f) ^ (!e & g);
            let t1 = h
                .wrapping_add(big_sigma1)
                .wrapping_add(choose)
                .wrapping_add(*constant)
                .wrapping_add(schedule[round % 16]);
            let big_sigma0 = a.rotate_right(2) ^ a.rotate_right(13) ^ a.rotate_right(22);
            let majority = (a & b) ^ (a & c) ^ (b & c);
            let t2 = big_sigma0.wrapping_add(majority);
            working = [t1.wrapping_add(t2), a, b, c, d.wrapping_add(t1), e, f, g];
        }

        for (word, added) in self.state.iter_mut().zip(working) {
            *word = word.wrapping_add(added);
        }
    }
}

/// One-shot digest of `input`.
pub(crate) fn sha256(input: &[u8]) -> [u8; 32] {
    Sha256::new().update(input).finalize()
}
