//! Parameter sampling for new trials.

use hpo_types::{ParamValue, SweepSpec};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::BTreeMap;
use tracing::trace;

/// Deterministic generator for trial `trial_index` of a sweep seeded with
/// `seed`. Each index gets its own ChaCha stream, so draws do not depend on
/// the order or batching in which trials are launched.
pub fn trial_rng(seed: u64, trial_index: usize) -> ChaCha8Rng {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    rng.set_stream(trial_index as u64);
    rng
}

/// Draw one value per distribution of `spec` and merge in its fixed
/// arguments unchanged.
///
/// Distributions are visited in name order, which keeps the result
/// reproducible for a given `rng` state.
pub fn generate_params<R: Rng + ?Sized>(
    spec: &SweepSpec,
    trial_index: usize,
    rng: &mut R,
) -> BTreeMap<String, ParamValue> {
    let mut params = spec.fixed_params.clone();
    for (name, distribution) in &spec.distributions {
        let value = distribution.sample(rng);
        trace!(sweep = %spec.sweep_id, trial = trial_index, param = %name, value = %value, "sampled");
        params.insert(name.clone(), value);
    }
    params
}

/// Parameters for trial `trial_index` using the sweep's own seed.
pub fn sample_trial(spec: &SweepSpec, trial_index: usize) -> BTreeMap<String, ParamValue> {
    let mut rng = trial_rng(spec.seed, trial_index);
    generate_params(spec, trial_index, &mut rng)
}
