//! The multi-stage control loop.
//!
//! Stage `000` is setup: validate everything, freeze the per-collection
//! sampling orders, and plan the first pull. Every later stage binds a
//! content snapshot of the operative inputs, ingests the audited-vote
//! transcripts as of that snapshot, measures risk for each open Bayes
//! contest, updates statuses (terminal ones stay terminal), and plans the
//! next stage's per-collection workload. The audit is over when no
//! contest remains open.

use std::collections::BTreeMap;

use color_eyre::eyre::{Context, Result};
use tracing::{debug, info};

use crate::emit::{self, OutputRow, PlanRow, StageOutputs};
use crate::errors::AuditError;
use crate::files;
use crate::model::{Cid, ContestStatus, Election, Pbcid, RiskMethod, SamplingMode};
use crate::risk;
use crate::sample::{self, SampleTally};
use crate::sampler;
use crate::tables::{self, ElectionDir};

/// Stage indices render as fixed-width labels so they sort as versions.
pub fn stage_label(stage: u32) -> String {
    format!("{stage:03}")
}

/// What a completed stage hands back to the CLI for display.
#[derive(Debug)]
pub struct StageReport {
    pub stage: u32,
    pub outputs: Vec<OutputRow>,
    pub statuses_before: BTreeMap<Cid, ContestStatus>,
    pub plan: Vec<PlanRow>,
    pub done: bool,
}

/// Run one stage end-to-end against an election directory.
pub fn run_stage(dir: &ElectionDir, stage: u32) -> Result<StageReport> {
    let loaded = tables::load_election(dir).context("loading election inputs")?;
    let mut inputs = loaded.inputs;
    let election = loaded.election;
    election.check_consistency()?;
    let seed = tables::read_seed(dir, &mut inputs)?;

    if stage == 0 {
        setup_stage(dir, &election, &seed, inputs)
    } else {
        audit_stage(dir, &election, &seed, stage, inputs)
    }
}

/// Stage `000`: write the sampling orders and a bootstrap plan.
fn setup_stage(
    dir: &ElectionDir,
    election: &Election,
    seed: &str,
    inputs: Vec<std::path::PathBuf>,
) -> Result<StageReport> {
    info!("stage 000: freezing sampling orders");
    for collection in election.structure.collections.values() {
        let manifest = election.manifest(&collection.pbcid)?;
        let order = sampler::sampling_order(seed, manifest);
        tables::write_audit_order(dir, manifest, &order)
            .with_context(|| format!("writing audit order for {}", collection.pbcid))?;
        debug!("{}: sampling order over {} ballots", collection.pbcid, order.len());
    }

    let statuses: BTreeMap<Cid, ContestStatus> = election
        .contest_params
        .iter()
        .map(|(cid, p)| (cid.clone(), p.status))
        .collect();
    let outputs = output_rows(election, &statuses, &BTreeMap::new(), &SampleTally::default());
    let done = statuses.values().all(|s| s.is_terminal());
    let plan = plan_rows(election, &statuses, &SampleTally::default(), &BTreeMap::new(), None, done)?;

    let snapshot = files::snapshot_digests(dir.root(), &inputs)?;
    let out = StageOutputs {
        stage_label: stage_label(0),
        snapshot,
        outputs: outputs.clone(),
        plan: plan.clone(),
    };
    emit::write_stage(dir, &out)?;

    Ok(StageReport {
        stage: 0,
        outputs,
        statuses_before: statuses,
        plan,
        done,
    })
}

/// Stages `001…`: measure, decide, plan.
fn audit_stage(
    dir: &ElectionDir,
    election: &Election,
    seed: &str,
    stage: u32,
    mut inputs: Vec<std::path::PathBuf>,
) -> Result<StageReport> {
    if stage > election.global.max_audit_stages {
        return Err(AuditError::parameter(format!(
            "stage {stage} exceeds max_audit_stages {}",
            election.global.max_audit_stages
        ))
        .into());
    }

    // The permutation depends only on seed and manifest, so recomputing
    // it here reproduces exactly what stage 000 wrote.
    let mut orders: BTreeMap<Pbcid, Vec<usize>> = BTreeMap::new();
    for collection in election.structure.collections.values() {
        let manifest = election.manifest(&collection.pbcid)?;
        orders.insert(
            collection.pbcid.clone(),
            sampler::sampling_order(seed, manifest),
        );
    }

    let mut transcripts = BTreeMap::new();
    for collection in election.structure.collections.values() {
        if let Some(rows) = tables::read_audited_votes(dir, &collection.pbcid, &mut inputs)? {
            transcripts.insert(collection.pbcid.clone(), rows);
        }
    }

    // Freeze the snapshot before any arithmetic.
    let snapshot = files::snapshot_digests(dir.root(), &inputs)?;
    info!(
        "stage {}: snapshot of {} input files bound",
        stage_label(stage),
        snapshot.len()
    );

    let tally = sample::ingest(election, &orders, &transcripts)?;

    // Measure every open Bayes contest, then apply the status updates in
    // one sweep: a contest that passes mid-loop must not change how its
    // peers are measured.
    let mut risks: BTreeMap<Cid, f64> = BTreeMap::new();
    let mut statuses: BTreeMap<Cid, ContestStatus> = BTreeMap::new();
    let statuses_before: BTreeMap<Cid, ContestStatus> = election
        .contest_params
        .iter()
        .map(|(cid, p)| (cid.clone(), p.status))
        .collect();
    for cid in election.structure.contests.keys() {
        let params = &election.contest_params[cid];
        if params.status == ContestStatus::Open && params.method == RiskMethod::Bayes {
            let measured = risk::measure_risk(election, &tally, cid, stage, seed)?;
            let after = risk::decide_status(measured.risk, params);
            info!(
                "contest {cid}: measured risk {} -> {after}",
                emit::format_risk(measured.risk)
            );
            risks.insert(cid.clone(), measured.risk);
            statuses.insert(cid.clone(), after);
        } else {
            statuses.insert(cid.clone(), params.status);
        }
    }

    let done = statuses.values().all(|s| s.is_terminal());
    if done {
        info!("audit complete: every contest is terminal");
    }

    let prev_risks = emit::read_prev_risks(dir, &stage_label(stage - 1))?;
    let outputs = output_rows(election, &statuses, &risks, &tally);
    let plan = plan_rows(election, &statuses, &tally, &risks, prev_risks.as_ref(), done)?;

    let out = StageOutputs {
        stage_label: stage_label(stage),
        snapshot,
        outputs: outputs.clone(),
        plan: plan.clone(),
    };
    emit::write_stage(dir, &out)?;

    // Carry the parameter table forward with the new statuses.
    let mut new_params = election.contest_params.clone();
    for (cid, status) in &statuses {
        if let Some(p) = new_params.get_mut(cid) {
            p.status = *status;
        }
    }
    emit::write_contest_params(dir, &stage_label(stage), &election.structure.contests, &new_params)?;

    Ok(StageReport {
        stage,
        outputs,
        statuses_before,
        plan,
        done,
    })
}

fn output_rows(
    election: &Election,
    statuses: &BTreeMap<Cid, ContestStatus>,
    risks: &BTreeMap<Cid, f64>,
    tally: &SampleTally,
) -> Vec<OutputRow> {
    election
        .structure
        .contests
        .keys()
        .map(|cid| {
            let p = &election.contest_params[cid];
            OutputRow {
                cid: cid.clone(),
                method: p.method,
                measured_risk: risks.get(cid).copied(),
                risk_limit: p.risk_limit,
                upset_threshold: p.upset_threshold,
                status_after: statuses[cid],
                sample_total: tally.sample_total(cid),
            }
        })
        .collect()
}

/// The per-stage sampling increment for one collection.
fn next_increment(
    audit_done: bool,
    has_active_driver: bool,
    rate: usize,
    size: usize,
    audited: usize,
) -> usize {
    if audit_done || !has_active_driver {
        0
    } else {
        rate.min(size.saturating_sub(audited))
    }
}

fn plan_rows(
    election: &Election,
    statuses: &BTreeMap<Cid, ContestStatus>,
    tally: &SampleTally,
    risks: &BTreeMap<Cid, f64>,
    prev_risks: Option<&BTreeMap<Cid, f64>>,
    done: bool,
) -> Result<Vec<PlanRow>> {
    let mut plan = Vec::new();
    for collection in election.structure.collections.values() {
        let pbcid = &collection.pbcid;
        let size = election.collection_size(pbcid)?;
        let audited = tally.audited_in(pbcid);
        let rate = election.collection_params[pbcid].max_audit_rate as usize;

        // Opportunistic contests ride along; only open *active* contests
        // drive more sampling here.
        let drivers: Vec<&Cid> = collection
            .contests
            .iter()
            .filter(|cid| {
                statuses.get(*cid) == Some(&ContestStatus::Open)
                    && election.contest_params[*cid].sampling_mode == SamplingMode::Active
            })
            .collect();
        let increment = next_increment(done, !drivers.is_empty(), rate, size, audited);

        let estimated = if increment == 0 {
            audited
        } else {
            // Extrapolate from the worst (highest-risk) driving contest.
            let worst = drivers
                .iter()
                .filter_map(|cid| risks.get(*cid).map(|r| (*cid, *r)))
                .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
            match worst {
                Some((cid, risk)) => emit::estimate_total_needed(
                    audited,
                    rate,
                    size,
                    Some(risk),
                    prev_risks.and_then(|m| m.get(cid).copied()),
                    election.contest_params[cid].risk_limit,
                ),
                None => emit::estimate_total_needed(audited, rate, size, None, None, 1.0),
            }
        };

        plan.push(PlanRow {
            pbcid: pbcid.clone(),
            audited_so_far: audited,
            next_stage_increment: increment,
            estimated_total_needed: estimated,
        });
    }
    Ok(plan)
}
