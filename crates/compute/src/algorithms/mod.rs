//! Numeric building blocks of the engine. None of these know about locks,
//! cadences or process control; the pipeline wires them together.

pub mod adwin;
pub mod half_space_trees;
pub mod regressor;
pub mod relaxation;
pub mod similarity;

/// Derive an independent RNG seed for one entity.
///
/// SplitMix64 finalizer over the base seed, the pid and a salt, so per-pid
/// streams do not depend on the order in which pids are visited.
pub(crate) fn mix_seed(seed: u64, pid: u32, salt: u64) -> u64 {
    let mut z = seed
        ^ (u64::from(pid)).wrapping_mul(0x9E37_79B9_7F4A_7C15)
        ^ salt.wrapping_mul(0xD1B5_4A32_D192_ED03);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mix_seed_separates_pids_and_salts() {
        let a = mix_seed(42, 1, 0);
        assert_eq!(a, mix_seed(42, 1, 0));
        assert_ne!(a, mix_seed(42, 2, 0));
        assert_ne!(a, mix_seed(42, 1, 1));
        assert_ne!(a, mix_seed(43, 1, 0));
    }
}
