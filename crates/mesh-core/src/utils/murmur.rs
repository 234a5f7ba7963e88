//! MurmurHash3, x86 32-bit variant.
//!
//! Service and handler ids travel on the wire and are matched against tables the
//! receiving process computed independently, so this must stay bit-for-bit identical
//! to the reference `MurmurHash3_x86_32` (little-endian block reads, seed applied as the
//! initial state).

const C1: u32 = 0xcc9e_2d51;
const C2: u32 = 0x1b87_3593;

/// Hashes `data` with MurmurHash3 x86_32 using the given seed.
#[must_use]
pub fn murmur3_32(data: &[u8], seed: u32) -> u32 {
    let mut hash = seed;

    let mut blocks = data.chunks_exact(4);
    for block in &mut blocks {
        let k = u32::from_le_bytes([block[0], block[1], block[2], block[3]]);
        hash ^= mix_k(k);
        hash = hash.rotate_left(13).wrapping_mul(5).wrapping_add(0xe654_6b64);
    }

    let tail = blocks.remainder();
    if !tail.is_empty() {
        let mut k = 0u32;
        for (shift, byte) in tail.iter().enumerate() {
            k |= u32::from(*byte) << (8 * shift);
        }
        hash ^= mix_k(k);
    }

    // Length is folded in modulo 2^32, as the reference implementation does.
    #[allow(clippy::cast_possible_truncation)]
    let len = data.len() as u32;
    hash ^= len;
    fmix32(hash)
}

#[inline]
fn mix_k(k: u32) -> u32 {
    k.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2)
}

#[inline]
fn fmix32(mut hash: u32) -> u32 {
    hash ^= hash >> 16;
    hash = hash.wrapping_mul(0x85eb_ca6b);
    hash ^= hash >> 13;
    hash = hash.wrapping_mul(0xc2b2_ae35);
    hash ^= hash >> 16;
    hash
}
