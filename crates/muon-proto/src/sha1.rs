//! SHA-1 digest.
//!
//! Firmware images carry a SHA-1 of their payload; the driver recomputes
//! it before a download is started. One-shot only; images are contiguous
//! in memory, so no incremental state is needed.

/// SHA-1 digest length in bytes.
pub const SHA1_LEN: usize = 20;

/// Initial hash state (FIPS 180-1).
const H0: [u32; 5] = [0x6745_2301, 0xEFCD_AB89, 0x98BA_DCFE, 0x1032_5476, 0xC3D2_E1F0];

/// Computes the SHA-1 digest of `data`.
#[must_use]
pub fn sha1(data: &[u8]) -> [u8; SHA1_LEN] {
    let mut h = H0;

    let mut chunks = data.chunks_exact(64);
    for chunk in &mut chunks {
        let mut block = [0u8; 64];
        block.copy_from_slice(chunk);
        compress(&mut h, &block);
    }

    // Final block(s): 0x80 terminator, zero fill, 64-bit bit length.
    let rem = chunks.remainder();
    let bit_len = (data.len() as u64) * 8;
    let mut block = [0u8; 64];
    block[..rem.len()].copy_from_slice(rem);
    block[rem.len()] = 0x80;
    if rem.len() < 56 {
        block[56..].copy_from_slice(&bit_len.to_be_bytes());
        compress(&mut h, &block);
    } else {
        compress(&mut h, &block);
        let mut last = [0u8; 64];
        last[56..].copy_from_slice(&bit_len.to_be_bytes());
        compress(&mut h, &last);
    }

    let mut out = [0u8; SHA1_LEN];
    for (i, word) in h.iter().enumerate() {
        out[i * 4..i * 4 + 4].copy_from_slice(&word.to_be_bytes());
    }
    out
}

/// One 512-bit compression round.
fn compress(h: &mut [u32; 5], block: &[u8; 64]) {
    let mut w = [0u32; 80];
    for (i, word) in w.iter_mut().take(16).enumerate() {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&block[i * 4..i * 4 + 4]);
        *word = u32::from_be_bytes(bytes);
    }
    for i in 16..80 {
        w[i] = (w[i - 3] ^ w[i - 8] ^ w[i - 14] ^ w[i - 16]).rotate_left(1);
    }

    let [mut a, mut b, mut c, mut d, mut e] = *h;

    for (i, &wi) in w.iter().enumerate() {
        let (f, k) = match i {
            0..=19 => ((b & c) | (!b & d), 0x5A82_7999),
            20..=39 => (b ^ c ^ d, 0x6ED9_EBA1),
            40..=59 => ((b & c) | (b & d) | (c & d), 0x8F1B_BCDC),
            _ => (b ^ c ^ d, 0xCA62_C1D6),
        };
        let t = a
            .rotate_left(5)
            .wrapping_add(f)
            .wrapping_add(e)
            .wrapping_add(k)
            .wrapping_add(wi);
        e = d;
        d = c;
        c = b.rotate_left(30);
        b = a;
        a = t;
    }

    h[0] = h[0].wrapping_add(a);
    h[1] = h[1].wrapping_add(b);
    h[2] = h[2].wrapping_add(c);
    h[3] = h[3].wrapping_add(d);
    h[4] = h[4].wrapping_add(e);
}
