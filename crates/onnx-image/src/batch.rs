//! Batch expansion
//!
//! Expands one base recipe into an ordered list of recipes with exactly
//! one field varied along the chosen axis. Seed entries draw fresh random
//! seeds; the other axes walk their numeric range.

use std::collections::HashSet;

use rand::Rng;

use crate::options::{BatchOptions, BatchType, SchedulerOptions};

/// Expands the base options along the batch axis, in emission order.
pub fn expand(base: &SchedulerOptions, batch: &BatchOptions) -> Vec<SchedulerOptions> {
    match batch.batch_type {
        BatchType::Seed => {
            let count = batch.count.max(1);
            random_seeds(count, base.seed)
                .into_iter()
                .map(|seed| base.with_seed(seed))
                .collect()
        }
        BatchType::Step => {
            let from = batch.value_from.round() as i64;
            let to = batch.value_to.round() as i64;
            let count = (to - from).max(1);
            (0..count)
                .map(|i| SchedulerOptions {
                    inference_steps: (from + i).max(1) as usize,
                    ..base.clone()
                })
                .collect()
        }
        BatchType::Guidance => range_values(batch)
            .into_iter()
            .map(|value| SchedulerOptions {
                guidance_scale: value,
                ..base.clone()
            })
            .collect(),
        BatchType::Strength => range_values(batch)
            .into_iter()
            .map(|value| SchedulerOptions {
                strength: value.clamp(f32::EPSILON, 1.0),
                ..base.clone()
            })
            .collect(),
    }
}

/// `max(1, ceil((to - from) / increment))` values starting at `from`.
fn range_values(batch: &BatchOptions) -> Vec<f32> {
    let increment = if batch.increment.abs() < f32::EPSILON {
        1.0
    } else {
        batch.increment
    };
    let span = (batch.value_to - batch.value_from) / increment;
    let count = (span.ceil() as i64).max(1) as usize;
    (0..count)
        .map(|i| batch.value_from + i as f32 * increment)
        .collect()
}

/// Fresh distinct seeds, none equal to the base seed or zero.
fn random_seeds(count: usize, base_seed: u64) -> Vec<u64> {
    let mut rng = rand::thread_rng();
    let mut seen = HashSet::with_capacity(count + 1);
    seen.insert(base_seed);
    seen.insert(0);
    let mut seeds = Vec::with_capacity(count);
    while seeds.len() < count {
        let seed: u64 = rng.gen();
        if seen.insert(seed) {
            seeds.push(seed);
        }
    }
    seeds
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(batch_type: BatchType, count: usize, from: f32, to: f32, increment: f32) -> BatchOptions {
        BatchOptions {
            batch_type,
            count,
            value_from: from,
            value_to: to,
            increment,
        }
    }

    #[test]
    fn test_seed_axis_yields_distinct_seeds() {
        let base = SchedulerOptions {
            seed: 42,
            ..Default::default()
        };
        let expanded = expand(&base, &batch(BatchType::Seed, 5, 0.0, 0.0, 0.0));
        assert_eq!(expanded.len(), 5);
        let mut seeds: Vec<u64> = expanded.iter().map(|o| o.seed).collect();
        assert!(seeds.iter().all(|&s| s != 42 && s != 0));
        seeds.sort_unstable();
        seeds.dedup();
        assert_eq!(seeds.len(), 5);
    }

    #[test]
    fn test_seed_axis_clamps_to_one() {
        let base = SchedulerOptions::default();
        assert_eq!(expand(&base, &batch(BatchType::Seed, 0, 0.0, 0.0, 0.0)).len(), 1);
    }

    #[test]
    fn test_step_axis_walks_half_open_range() {
        let base = SchedulerOptions::default();
        let expanded = expand(&base, &batch(BatchType::Step, 0, 20.0, 24.0, 0.0));
        let steps: Vec<usize> = expanded.iter().map(|o| o.inference_steps).collect();
        assert_eq!(steps, vec![20, 21, 22, 23]);
    }

    #[test]
    fn test_guidance_axis_matches_range_arithmetic() {
        let base = SchedulerOptions::default();
        let expanded = expand(&base, &batch(BatchType::Guidance, 0, 1.0, 10.0, 2.0));
        let scales: Vec<f32> = expanded.iter().map(|o| o.guidance_scale).collect();
        assert_eq!(scales, vec![1.0, 3.0, 5.0, 7.0, 9.0]);
    }

    #[test]
    fn test_strength_axis_carries_other_fields() {
        let base = SchedulerOptions {
            seed: 7,
            inference_steps: 12,
            ..Default::default()
        };
        let expanded = expand(&base, &batch(BatchType::Strength, 0, 0.2, 0.8, 0.3));
        assert_eq!(expanded.len(), 2);
        assert!(expanded.iter().all(|o| o.seed == 7 && o.inference_steps == 12));
        assert!((expanded[0].strength - 0.2).abs() < 1e-6);
        assert!((expanded[1].strength - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_degenerate_range_yields_one_entry() {
        let base = SchedulerOptions::default();
        let expanded = expand(&base, &batch(BatchType::Guidance, 0, 5.0, 5.0, 2.0));
        assert_eq!(expanded.len(), 1);
        assert_eq!(expanded[0].guidance_scale, 5.0);
    }
}
