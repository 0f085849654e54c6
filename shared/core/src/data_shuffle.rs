use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Shuffle {
    #[default]
    DontShuffle,
    Seeded([u8; 32]),
}

impl Shuffle {
    /// Expands a numeric seed into a 32-byte RNG seed, big-endian in the tail bytes.
    pub fn from_seed(seed: u64) -> Self {
        let mut array = [0u8; 32];
        array[24..32].copy_from_slice(&seed.to_be_bytes());
        Shuffle::Seeded(array)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seed_bytes_are_big_endian_tail() {
        let Shuffle::Seeded(bytes) = Shuffle::from_seed(0x0102) else {
            panic!("expected seeded shuffle");
        };
        assert_eq!(&bytes[..30], &[0u8; 30]);
        assert_eq!(&bytes[30..], &[1, 2]);
    }
}
