//! Transaction id (mtid) generation: 6 bytes drawn from a thread-local,
//! cryptographically-seeded PRNG. Uniqueness is statistical and enforced by
//! the call table's insert-if-absent semantics, not by this module.

use rand::Rng;

pub const MTID_LEN: usize = 6;

pub fn random_mtid() -> Vec<u8> {
    let mut buf = vec![0u8; MTID_LEN];
    rand::thread_rng().fill(&mut buf[..]);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_six_bytes() {
        assert_eq!(random_mtid().len(), MTID_LEN);
    }

    #[test]
    fn is_not_trivially_constant() {
        // Statistically near-impossible to collide twice in a row; a flake
        // here would indicate a broken RNG, not bad luck.
        let a = random_mtid();
        let b = random_mtid();
        assert_ne!(a, b);
    }
}
