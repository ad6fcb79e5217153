//! `mysql_native_password` scramble.
//!
//! `SHA1(password) XOR SHA1(seed + SHA1(SHA1(password)))`

use sha1::{Digest, Sha1};

/// Computes the 20-byte login response for `password` against the server
/// `seed`. An empty password yields an empty response.
pub fn scramble_native_password(password: &[u8], seed: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }

    let seed = &seed[..seed.len().min(20)];

    let stage1: [u8; 20] = Sha1::digest(password).into();
    let stage2: [u8; 20] = Sha1::digest(stage1).into();

    let mut hasher = Sha1::new();
    hasher.update(seed);
    hasher.update(stage2);
    let stage3: [u8; 20] = hasher.finalize().into();

    stage1.iter().zip(stage3.iter()).map(|(a, b)| a ^ b).collect()
}

/// Checks a client login response against the expected plain-text password.
pub fn verify_native_password(expected: &[u8], seed: &[u8], response: &[u8]) -> bool {
    scramble_native_password(expected, seed) == response
}
