//! bayaudit: Bayesian risk-limiting post-election audits of plurality
//! contests spread across many separately-managed paper ballot collections.
//!
//! The audit runs in stages. Each stage freezes a snapshot of the election
//! directory, ingests the audited-vote transcripts uploaded so far, estimates
//! for every open contest the posterior probability that the reported outcome
//! is wrong, updates contest statuses, and plans the next stage's sampling
//! workload per collection. Everything downstream of the public audit seed is
//! deterministic, so two runs over the same inputs produce byte-identical
//! outputs.

#[macro_use]
extern crate serde_derive;

pub mod app;
pub mod emit;
pub mod errors;
pub mod files;
pub mod ids;
pub mod manifest;
pub mod model;
pub mod risk;
pub mod rng;
pub mod sample;
pub mod sampler;
pub mod stage;
pub mod tables;
pub mod term;
