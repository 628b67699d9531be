//! WebSocket frame masking utilities
//!
//! Client-to-server frames must be masked with an unpredictable key, and the
//! handshake nonce must be random. Both draw from the backend selected via
//! feature flags:
//! - `fastrand`: fast PRNG (default)
//! - `getrandom`: cryptographically secure RNG
//! - `rand_rng`: uses the `rand` crate
//!
//! If multiple features are enabled, priority is: getrandom > rand_rng > fastrand.

/// XOR `data` in place with the repeating 4-byte `mask`.
///
/// Masking is an involution: applying the same key twice restores the input.
#[inline]
pub fn apply_mask(data: &mut [u8], mask: [u8; 4]) {
    apply_mask_offset(data, mask, 0);
}

/// XOR `data` in place as if it started at payload index `offset`.
///
/// Lets a payload be unmasked in pieces as it arrives across reads.
#[inline]
pub fn apply_mask_offset(data: &mut [u8], mask: [u8; 4], offset: usize) {
    if data.is_empty() {
        return;
    }

    let rotated = rotate(mask, offset);
    let word = u64::from_ne_bytes([
        rotated[0], rotated[1], rotated[2], rotated[3], rotated[0], rotated[1], rotated[2],
        rotated[3],
    ]);

    let mut chunks = data.chunks_exact_mut(8);
    for chunk in &mut chunks {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(chunk);
        chunk.copy_from_slice(&(u64::from_ne_bytes(bytes) ^ word).to_ne_bytes());
    }

    for (i, byte) in chunks.into_remainder().iter_mut().enumerate() {
        *byte ^= rotated[i & 3];
    }
}

#[inline]
fn rotate(mask: [u8; 4], offset: usize) -> [u8; 4] {
    let s = offset & 3;
    [mask[s], mask[(s + 1) & 3], mask[(s + 2) & 3], mask[(s + 3) & 3]]
}

/// Generate a fresh random mask for an outgoing frame.
#[inline]
pub fn generate_mask() -> [u8; 4] {
    let mut mask = [0u8; 4];
    fill_random(&mut mask);
    mask
}

/// Fill `buf` from the configured RNG backend.
#[cfg(feature = "getrandom")]
pub fn fill_random(buf: &mut [u8]) {
    if getrandom::getrandom(buf).is_err() {
        // OS entropy unavailable: time-seeded xorshift, never an all-zero key
        fill_fallback(buf);
    }
}

/// Fill `buf` from the configured RNG backend.
#[cfg(all(feature = "rand_rng", not(feature = "getrandom")))]
pub fn fill_random(buf: &mut [u8]) {
    use rand::Rng;
    rand::rng().fill(buf);
}

/// Fill `buf` from the configured RNG backend.
#[cfg(all(
    feature = "fastrand",
    not(feature = "getrandom"),
    not(feature = "rand_rng")
))]
pub fn fill_random(buf: &mut [u8]) {
    fastrand::fill(buf);
}

#[cfg(not(any(feature = "fastrand", feature = "getrandom", feature = "rand_rng")))]
pub fn fill_random(_buf: &mut [u8]) {
    compile_error!("At least one RNG feature must be enabled: fastrand, getrandom, or rand_rng");
}

#[cfg(feature = "getrandom")]
fn fill_fallback(buf: &mut [u8]) {
    use std::time::{SystemTime, UNIX_EPOCH};

    let mut seed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
        | 1;

    for byte in buf {
        seed ^= seed << 13;
        seed ^= seed >> 7;
        seed ^= seed << 17;
        *byte = seed as u8;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_involution() {
        let original: Vec<u8> = (0..=255).collect();
        let mut data = original.clone();
        let mask = [0x37, 0xfa, 0x21, 0x3d];

        apply_mask(&mut data, mask);
        assert_ne!(data, original);
        apply_mask(&mut data, mask);
        assert_eq!(data, original);
    }

    #[test]
    fn test_mask_matches_rfc_definition() {
        let mask = [0x01, 0x02, 0x03, 0x04];
        let mut data = *b"Hello, masked world";
        apply_mask(&mut data, mask);

        for (i, byte) in data.iter().enumerate() {
            assert_eq!(byte ^ mask[i % 4], b"Hello, masked world"[i]);
        }
    }

    #[test]
    fn test_mask_offset_split_equals_whole() {
        let mask = [0xde, 0xad, 0xbe, 0xef];
        let payload: Vec<u8> = (0..100u8).collect();

        let mut whole = payload.clone();
        apply_mask(&mut whole, mask);

        for split in 0..payload.len() {
            let mut pieces = payload.clone();
            let (head, tail) = pieces.split_at_mut(split);
            apply_mask_offset(head, mask, 0);
            apply_mask_offset(tail, mask, split);
            assert_eq!(pieces, whole, "split at {split}");
        }
    }

    #[test]
    fn test_generated_masks_vary() {
        let masks: Vec<[u8; 4]> = (0..16).map(|_| generate_mask()).collect();
        assert!(masks.iter().any(|m| *m != masks[0]));
    }
}
