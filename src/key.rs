use crate::shm::layout::KEY_LEN;

/// Fixed-length, zero-padded session identifier used for every index operation.
pub type PaddedKey = [u8; KEY_LEN];

/// Zero-pad a session id to `KEY_LEN` bytes.
///
/// Returns `None` for ids longer than `KEY_LEN`; those can never be cached.
#[inline]
pub fn pad_key(key: &[u8]) -> Option<PaddedKey> {
    if key.len() > KEY_LEN {
        return None;
    }
    let mut padded = [0u8; KEY_LEN];
    padded[..key.len()].copy_from_slice(key);
    Some(padded)
}
