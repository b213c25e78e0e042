//! Discrete diffusion solvers
//!
//! Each scheduler turns a trained noise schedule into an inference-time
//! update rule: it decides the timestep sequence, how much noise the first
//! latent carries, how the model input is scaled, and how a noise
//! prediction moves the latent one step back along the reverse process.
//! All schedulers share the precomputed beta/alpha tables in
//! [`schedule::NoiseSchedule`] and differ only in their update rules.

pub mod ddim;
pub mod ddpm;
pub mod euler;
pub mod kdpm2;
pub mod lms;
pub mod schedule;

pub use ddim::DdimScheduler;
pub use ddpm::DdpmScheduler;
pub use euler::{EulerAncestralScheduler, EulerScheduler};
pub use kdpm2::Kdpm2Scheduler;
pub use lms::LmsScheduler;
pub use schedule::{
    BetaSchedule, NoiseSchedule, PredictionType, Scheduler, SchedulerConfig, SchedulerError,
    SchedulerKind, StepOutput, TimestepSpacing,
};
