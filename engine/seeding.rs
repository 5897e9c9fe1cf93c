//! Deterministic seeds: starting points for the smoothing-parameter search and
//! random-stream seeds for the per-task coefficient draws.

use ahash::AHashSet;
use ndarray::Array1;

/// Log smoothing parameters of the starting grid stay inside this box.
pub const RHO_SEED_BOUND: f64 = 12.0;
/// Spacing of the uniform grid.
const GRID_STEP: f64 = 4.0;
/// Values probed along each single penalty axis, all other parameters at 0.
const SINGLE_AXIS_VALUES: [f64; 2] = [8.0, -8.0];

/// Candidate starting points for the log smoothing parameters, without
/// duplicates: a uniform grid from `RHO_SEED_BOUND` down to `-RHO_SEED_BOUND`
/// with every penalty equal, followed by single-axis probes.
pub fn generate_rho_candidates(num_penalties: usize) -> Vec<Array1<f64>> {
    let mut seeds = Vec::new();

    let mut v = RHO_SEED_BOUND;
    while v >= -RHO_SEED_BOUND - 1e-9 {
        seeds.push(Array1::from_elem(num_penalties, v));
        v -= GRID_STEP;
    }

    for idx in 0..num_penalties {
        for &val in &SINGLE_AXIS_VALUES {
            let mut seed = Array1::zeros(num_penalties);
            seed[idx] = val;
            seeds.push(seed);
        }
    }

    let mut seen: AHashSet<Vec<u64>> = AHashSet::new();
    seeds
        .into_iter()
        .filter(|s| seen.insert(s.iter().map(|&v| v.to_bits()).collect()))
        .collect()
}

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

fn fnv1a(hash: u64, bytes: &[u8]) -> u64 {
    bytes
        .iter()
        .fold(hash, |h, &b| (h ^ u64::from(b)).wrapping_mul(FNV_PRIME))
}

/// Seed of the random stream for one (group, scenario) task.
///
/// Depends only on its arguments, so results do not depend on which worker
/// runs the task or in which order.
pub fn derive_task_seed(group: &str, scenario: &str, base_seed: u64) -> u64 {
    let mut hash = fnv1a(FNV_OFFSET_BASIS, group.as_bytes());
    // Separator so ("ab", "c") and ("a", "bc") hash differently.
    hash = fnv1a(hash, &[0xff]);
    hash = fnv1a(hash, scenario.as_bytes());
    hash ^ base_seed
}
