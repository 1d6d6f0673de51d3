/// mysql_native_password scrambling and challenge generation
///
/// ```text
/// stage1 = SHA1(password)
/// stage2 = SHA1(stage1)
/// token  = SHA1(challenge + stage2) XOR stage1
/// ```
use rand::Rng;
use sha1::{Digest, Sha1};

/// Length of the authentication challenge
pub const CHALLENGE_LEN: usize = 20;

const CHALLENGE_ALPHABET: &[u8] =
    b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ1234567890~!@#$%^&*()_+}{><?";

/// Generate a printable 20-byte challenge
pub fn generate_challenge() -> [u8; CHALLENGE_LEN] {
    let mut rng = rand::thread_rng();
    let mut challenge = [0u8; CHALLENGE_LEN];
    for byte in challenge.iter_mut() {
        *byte = CHALLENGE_ALPHABET[rng.gen_range(0..CHALLENGE_ALPHABET.len())];
    }
    challenge
}

/// Compute the scrambled credential for `password` under `challenge`.
///
/// An empty password scrambles to an empty token, as MySQL clients send.
pub fn scramble(challenge: &[u8], password: &str) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }

    let stage1 = Sha1::digest(password.as_bytes());
    let stage2 = Sha1::digest(stage1);

    let mut hasher = Sha1::new();
    hasher.update(challenge);
    hasher.update(stage2);
    let mixed = hasher.finalize();

    stage1.iter().zip(mixed.iter()).map(|(a, b)| a ^ b).collect()
}

/// Check a client-submitted token against the expected password
pub fn verify(challenge: &[u8], password: &str, token: &[u8]) -> bool {
    scramble(challenge, password) == token
}
