//! Cross-solver properties every scheduler in the family must satisfy.

use ndarray::Array4;
use onnx_image_schedulers::{SchedulerConfig, SchedulerKind};

const KINDS: [SchedulerKind; 6] = [
    SchedulerKind::Lms,
    SchedulerKind::Euler,
    SchedulerKind::EulerAncestral,
    SchedulerKind::Ddpm,
    SchedulerKind::Ddim,
    SchedulerKind::Kdpm2,
];

fn config(steps: usize, seed: u64) -> SchedulerConfig {
    SchedulerConfig {
        inference_steps: steps,
        seed,
        ..Default::default()
    }
}

#[test]
fn test_timesteps_strictly_descending_for_every_solver() {
    for kind in KINDS {
        let scheduler = kind.create(&config(20, 42)).unwrap();
        let timesteps = scheduler.timesteps();
        assert!(!timesteps.is_empty(), "{}", kind.name());
        assert!(
            timesteps.windows(2).all(|w| w[0] > w[1]),
            "{} timesteps not strictly descending: {timesteps:?}",
            kind.name()
        );
    }
}

#[test]
fn test_single_evaluation_solvers_expose_exact_step_count() {
    for kind in [
        SchedulerKind::Lms,
        SchedulerKind::Euler,
        SchedulerKind::EulerAncestral,
        SchedulerKind::Ddpm,
        SchedulerKind::Ddim,
    ] {
        let scheduler = kind.create(&config(30, 42)).unwrap();
        assert_eq!(scheduler.timesteps().len(), 30, "{}", kind.name());
    }
    // The midpoint solver interleaves one extra evaluation per interval.
    let kdpm2 = SchedulerKind::Kdpm2.create(&config(30, 42)).unwrap();
    assert_eq!(kdpm2.timesteps().len(), 59);
}

#[test]
fn test_full_loop_preserves_latent_shape() {
    for kind in KINDS {
        let mut scheduler = kind.create(&config(8, 7)).unwrap();
        let mut latent = scheduler.create_random_sample([1, 4, 8, 8], scheduler.init_noise_sigma());
        let timesteps = scheduler.timesteps().to_vec();
        for &t in &timesteps {
            let scaled = scheduler.scale_model_input(latent.clone(), t);
            assert_eq!(scaled.dim(), (1, 4, 8, 8));
            // A constant stand-in for the noise prediction.
            let model_output = scaled.mapv(|v| v * 0.1);
            let out = scheduler.step(&model_output, t, &latent).unwrap();
            latent = out.prev_sample;
            assert_eq!(latent.dim(), (1, 4, 8, 8), "{}", kind.name());
            assert!(
                latent.iter().all(|v| v.is_finite()),
                "{} produced non-finite latent",
                kind.name()
            );
        }
    }
}

#[test]
fn test_create_random_sample_is_seed_reproducible() {
    for kind in KINDS {
        let mut a = kind.create(&config(10, 1234)).unwrap();
        let mut b = kind.create(&config(10, 1234)).unwrap();
        let sigma = a.init_noise_sigma();
        assert_eq!(
            a.create_random_sample([1, 4, 16, 16], sigma),
            b.create_random_sample([1, 4, 16, 16], sigma),
            "{}",
            kind.name()
        );
    }
}

#[test]
fn test_truncated_schedule_steps_like_image_to_image() {
    // Entering the schedule part-way (strength < 1) must still step.
    for kind in KINDS {
        let mut scheduler = kind.create(&config(10, 5)).unwrap();
        let timesteps = scheduler.timesteps().to_vec();
        // Even index so the midpoint solver re-enters on an anchor call.
        let start = (timesteps.len() / 2) & !1;

        let clean = Array4::from_elem((1, 4, 8, 8), 0.25);
        let noise = scheduler.sample_noise([1, 4, 8, 8]);
        let mut latent = scheduler.add_noise(&clean, &noise, timesteps[start]);

        for &t in &timesteps[start..] {
            let scaled = scheduler.scale_model_input(latent.clone(), t);
            let model_output = scaled.mapv(|v| v * 0.05);
            latent = scheduler.step(&model_output, t, &latent).unwrap().prev_sample;
        }
        assert!(latent.iter().all(|v| v.is_finite()), "{}", kind.name());
    }
}
