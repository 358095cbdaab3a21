//! The Bayesian risk estimator: for each open contest, the Monte-Carlo
//! posterior probability that the reported outcome is wrong.
//!
//! The posterior over a collection's unseen ballots is a Polya urn — a
//! symmetric Dirichlet prior with concentration `α` over the contest's
//! vote categories, updated by the audited sample (and, for noCVR
//! collections, by the reported tallies as weighted pseudo-observations).
//! CVR collections stratify by reported vote, which is what lets a small
//! sample kill off large reported margins.
//!
//! Each trial realises the urn through its Dirichlet representation:
//! gamma draws per category, normalised, with the stratum's unseen count
//! apportioned by largest remainder. Trials are independent, so they fan
//! out over a rayon pool; each trial draws from its own counter window of
//! the contest's PRNG domain, making the result independent of worker
//! scheduling.

use std::collections::{BTreeMap, BTreeSet};

use color_eyre::eyre::Result;
use rayon::prelude::*;
use tracing::debug;

use crate::errors::AuditError;
use crate::ids::{self, Vote};
use crate::model::{Cid, ContestParams, ContestStatus, CvrType, Election, SelId};
use crate::rng::AuditRng;
use crate::sample::{SampleTally, Stratum};

/// Each trial draws from a disjoint counter window this wide; no trial
/// comes near exhausting it.
const TRIAL_COUNTER_STRIDE: u64 = 1 << 32;

/// One stratum's posterior urn, ready to draw from.
#[derive(Debug)]
struct Urn {
    /// `α + observed (+ weighted reported tallies)` per category, in
    /// category order.
    pseudocounts: Vec<f64>,
    /// Ballots of this stratum not yet audited.
    unseen: usize,
}

/// A contest's full posterior-simulation setup, built once per stage and
/// shared read-only by the trial workers.
#[derive(Debug)]
pub struct ContestProblem {
    cid: Cid,
    winners: usize,
    reported_winners: BTreeSet<SelId>,
    /// Sorted category labels; all vectors below index into this.
    categories: Vec<SelId>,
    /// Audited observations per category, summed over strata and
    /// collections — the fixed part of every trial's tally.
    observed: Vec<u64>,
    urns: Vec<Urn>,
}

/// The measured risk of one contest at one stage.
#[derive(Debug, Clone)]
pub struct RiskResult {
    pub cid: Cid,
    pub risk: f64,
    pub sample_total: usize,
}

/// `r(cid) ≤ λ` passes, `r(cid) ≥ υ` upsets, anything between stays open.
pub fn decide_status(risk: f64, params: &ContestParams) -> ContestStatus {
    if risk <= params.risk_limit {
        ContestStatus::Passed
    } else if risk >= params.upset_threshold {
        ContestStatus::Upset
    } else {
        ContestStatus::Open
    }
}

/// Estimate `P(reported winner set ≠ true winner set)` for `cid`.
///
/// The draw set consumed is a deterministic function of
/// `(seed, cid, stage_index, n_trials)`.
pub fn measure_risk(
    election: &Election,
    tally: &SampleTally,
    cid: &str,
    stage_index: u32,
    seed: &str,
) -> Result<RiskResult> {
    let problem = build_problem(election, tally, cid)?;
    let k = election.global.n_trials;
    let domain = format!("risk:{cid}:{stage_index}");

    let failures: u64 = (0..k)
        .into_par_iter()
        .map(|trial| {
            let mut rng =
                AuditRng::with_counter(seed, &domain, 1 + trial * TRIAL_COUNTER_STRIDE);
            u64::from(run_trial(&problem, &mut rng))
        })
        .sum();

    let risk = failures as f64 / k as f64;
    debug!(
        "{}: {failures}/{k} trials upset the reported outcome",
        problem.cid
    );
    Ok(RiskResult {
        cid: problem.cid,
        risk,
        sample_total: tally.sample_total(cid),
    })
}

/// One posterior draw; true when the trial's winners differ from the
/// reported winners.
fn run_trial(problem: &ContestProblem, rng: &mut AuditRng) -> bool {
    let mut totals = problem.observed.clone();
    for urn in &problem.urns {
        if urn.unseen == 0 {
            continue;
        }
        // Log-space Dirichlet draw: small concentrations underflow a
        // direct gamma draw to zero across the board.
        let log_weights: Vec<f64> = urn.pseudocounts.iter().map(|&a| rng.gamma_ln(a)).collect();
        let top = log_weights.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let weights: Vec<f64> = log_weights.iter().map(|lw| (lw - top).exp()).collect();
        for (total, drawn) in totals.iter_mut().zip(apportion(&weights, urn.unseen)) {
            *total += drawn;
        }
    }
    let winners = plurality_winners(&problem.categories, &totals, problem.winners);
    winners != problem.reported_winners
}

/// Split `total` into integer parts proportional to `weights` by largest
/// remainder, ties to the earlier (lexicographically smaller) category.
fn apportion(weights: &[f64], total: usize) -> Vec<u64> {
    let sum: f64 = weights.iter().sum();
    let mut parts: Vec<u64> = Vec::with_capacity(weights.len());
    let mut fractions: Vec<(usize, f64)> = Vec::with_capacity(weights.len());
    let mut allocated: u64 = 0;
    for (i, w) in weights.iter().enumerate() {
        let exact = total as f64 * w / sum;
        let floor = exact.floor();
        parts.push(floor as u64);
        allocated += floor as u64;
        fractions.push((i, exact - floor));
    }
    let mut leftover = total as u64 - allocated;
    fractions.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap().then(a.0.cmp(&b.0)));
    for (i, _) in fractions {
        if leftover == 0 {
            break;
        }
        parts[i] += 1;
        leftover -= 1;
    }
    parts
}

/// The plurality outcome rule: the top-`w` selection ids by count, with
/// exact ties broken lexicographically on the (already reduced) id.
/// Special `-…` categories cannot win.
pub fn plurality_winners(categories: &[SelId], totals: &[u64], w: usize) -> BTreeSet<SelId> {
    let mut ranked: Vec<(&SelId, u64)> = categories
        .iter()
        .zip(totals)
        .filter(|(cat, _)| !ids::is_special(cat))
        .map(|(cat, t)| (cat, *t))
        .collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(b.0)));
    ranked.into_iter().take(w).map(|(cat, _)| cat.clone()).collect()
}

/// Assemble the categories, observed counts and urns for one contest.
fn build_problem(
    election: &Election,
    tally: &SampleTally,
    cid: &str,
) -> Result<ContestProblem> {
    let contest = election.contest(cid)?;
    let params = election
        .contest_params
        .get(cid)
        .ok_or_else(|| AuditError::consistency(format!("no audit parameters for contest {cid}")))?;
    let alpha = params.pseudocount;

    // Category set: the contest's base categories plus whatever the
    // sample or the reported tallies actually produced, sorted so seeded
    // runs see a stable order.
    let mut category_set = contest.base_categories();
    for pbcid in election.structure.rel(cid) {
        if let Some(strata) = tally.strata(cid, pbcid) {
            for avotes in strata.values() {
                for avote in avotes.keys() {
                    category_set.insert(contest.category_of(avote)?);
                }
            }
        }
        if let Some(rt) = election.reported.tallies.get(pbcid).and_then(|t| t.get(cid)) {
            for vote in rt.keys() {
                category_set.insert(contest.category_of(vote)?);
            }
        }
    }
    let categories: Vec<SelId> = category_set.into_iter().collect();
    let index: BTreeMap<&str, usize> = categories
        .iter()
        .enumerate()
        .map(|(i, c)| (c.as_str(), i))
        .collect();

    let mut observed = vec![0u64; categories.len()];
    let mut urns = Vec::new();

    for pbcid in election.structure.rel(cid) {
        let collection = election.collection(pbcid)?;
        let manifest = election.manifest(pbcid)?;
        let strata = tally.strata(cid, pbcid);

        // Observed audited ballots enter every trial's tally as-is.
        if let Some(strata) = strata {
            for avotes in strata.values() {
                for (avote, count) in avotes {
                    observed[index[contest.category_of(avote)?.as_str()]] += *count as u64;
                }
            }
        }

        match collection.cvr_type {
            CvrType::Cvr => {
                // Stratum sizes over the whole collection, from the CVRs.
                let mut stratum_sizes: BTreeMap<Vote, usize> = BTreeMap::new();
                for entry in &manifest.entries {
                    let rvote = election.reported.reported_vote(pbcid, &entry.bid, cid);
                    *stratum_sizes.entry(rvote).or_insert(0) += 1;
                }
                for (rvote, size) in stratum_sizes {
                    let stratum = Stratum::Reported(rvote.clone());
                    let observed_in = strata.and_then(|s| s.get(&stratum));
                    let seen: usize = observed_in
                        .map(|avotes| avotes.values().sum())
                        .unwrap_or(0);
                    if seen > size {
                        return Err(AuditError::consistency(format!(
                            "contest {cid}, collection {pbcid}: {seen} audited ballots report {rvote} but only {size} exist"
                        ))
                        .into());
                    }
                    let mut pseudocounts = vec![alpha; categories.len()];
                    if let Some(avotes) = observed_in {
                        for (avote, count) in avotes {
                            pseudocounts[index[contest.category_of(avote)?.as_str()]] +=
                                *count as f64;
                        }
                    }
                    urns.push(Urn {
                        pseudocounts,
                        unseen: size - seen,
                    });
                }
            }
            CvrType::NoCvr => {
                // One pooled urn; the reported tally has no per-ballot
                // link, so it enters as weighted prior observations.
                let weight = election.global.nocvr_prior_weight;
                let mut pseudocounts = vec![alpha; categories.len()];
                if let Some(rt) = election.reported.tallies.get(pbcid).and_then(|t| t.get(cid))
                {
                    for (vote, count) in rt {
                        pseudocounts[index[contest.category_of(vote)?.as_str()]] +=
                            weight * *count as f64;
                    }
                }
                if let Some(avotes) = strata.and_then(|s| s.get(&Stratum::NoCvr)) {
                    for (avote, count) in avotes {
                        pseudocounts[index[contest.category_of(avote)?.as_str()]] +=
                            *count as f64;
                    }
                }
                let audited = tally.audited_in(pbcid);
                if audited > manifest.size() {
                    return Err(AuditError::consistency(format!(
                        "collection {pbcid}: more audited ballots than the manifest holds"
                    ))
                    .into());
                }
                urns.push(Urn {
                    pseudocounts,
                    unseen: manifest.size() - audited,
                });
            }
        }
    }

    let reported_winners: BTreeSet<SelId> = election
        .outcomes
        .get(cid)
        .ok_or_else(|| AuditError::consistency(format!("no reported outcome for contest {cid}")))?
        .iter()
        .cloned()
        .collect();

    Ok(ContestProblem {
        cid: cid.to_string(),
        winners: contest.winners,
        reported_winners,
        categories,
        observed,
        urns,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{Manifest, ManifestRow};
    use crate::model::*;
    use indexmap::IndexMap;

    const SEED: &str = "13456201235197891138";

    #[test]
    fn apportion_sums_and_is_stable() {
        let parts = apportion(&[1.0, 1.0, 1.0], 10);
        assert_eq!(parts.iter().sum::<u64>(), 10);
        assert_eq!(parts, apportion(&[1.0, 1.0, 1.0], 10));
        // Exact thirds: the two leftover units go to the earliest ties.
        assert_eq!(parts, vec![4, 4, 2]);
        assert_eq!(apportion(&[9.0, 1.0], 100), vec![90, 10]);
    }

    #[test]
    fn winners_break_ties_lexicographically() {
        let cats: Vec<SelId> = ["0", "1", "-Undervote"]
            .into_iter()
            .map(String::from)
            .collect();
        let winners = plurality_winners(&cats, &[5, 5, 9], 1);
        assert_eq!(winners, BTreeSet::from(["0".to_string()]));
    }

    /// A one-contest election over a single collection with the given
    /// reported tally, audited sample and reported winner.
    fn election_with(
        cvr_type: CvrType,
        reported_ones: usize,
        reported_zeros: usize,
        winner: &str,
        n_trials: u64,
    ) -> Election {
        let n = (reported_ones + reported_zeros) as u32;
        let contest = Contest {
            cid: "C".into(),
            kind: ContestType::Plurality,
            winners: 1,
            writeins: WriteinPolicy::No,
            selections: ["0", "1"].into_iter().map(String::from).collect(),
        };
        let collection = Collection {
            pbcid: "J".into(),
            manager: "Anona County".into(),
            cvr_type,
            contests: vec!["C".into()],
        };
        let manifest = Manifest::expand(
            "J",
            &[ManifestRow {
                pbcid: "J".into(),
                box_id: "B1".into(),
                position: 1,
                stamp: String::new(),
                bid: "B-00001".into(),
                number_of_ballots: n,
                comments: String::new(),
            }],
        )
        .unwrap();
        let mut reported = ReportedVotes::default();
        match cvr_type {
            CvrType::Cvr => {
                for (i, e) in manifest.entries.iter().enumerate() {
                    let sel = if i < reported_ones { "1" } else { "0" };
                    reported
                        .cvr
                        .entry("J".into())
                        .or_default()
                        .entry(e.bid.clone())
                        .or_default()
                        .insert("C".into(), Vote::single(sel));
                }
            }
            CvrType::NoCvr => {
                let t = reported.tallies.entry("J".into()).or_default().entry("C".into()).or_default();
                t.insert(Vote::single("1"), reported_ones);
                t.insert(Vote::single("0"), reported_zeros);
            }
        }
        Election {
            structure: Structure {
                info: ElectionInfo::default(),
                contests: IndexMap::from([("C".to_string(), contest)]),
                collections: IndexMap::from([("J".to_string(), collection)]),
            },
            manifests: BTreeMap::from([("J".to_string(), manifest)]),
            reported,
            outcomes: BTreeMap::from([("C".to_string(), vec![winner.to_string()])]),
            global: GlobalParams {
                n_trials,
                ..GlobalParams::default()
            },
            contest_params: BTreeMap::from([(
                "C".to_string(),
                ContestParams {
                    cid: "C".into(),
                    method: RiskMethod::Bayes,
                    risk_limit: 0.05,
                    upset_threshold: 0.99,
                    sampling_mode: SamplingMode::Active,
                    status: ContestStatus::Open,
                    pseudocount: 1.0,
                },
            )]),
            collection_params: BTreeMap::new(),
        }
    }

    /// A sample of `ones + zeros` audited ballots agreeing with the CVRs.
    fn matching_sample(election: &Election, ones: usize, zeros: usize) -> SampleTally {
        let mut tally = SampleTally::default();
        tally.audited.insert("J".into(), ones + zeros);
        let strata = tally.counts.entry(("C".into(), "J".into())).or_default();
        let stratum_for = |sel: &str| match election.collection("J").unwrap().cvr_type {
            CvrType::Cvr => Stratum::Reported(Vote::single(sel)),
            CvrType::NoCvr => Stratum::NoCvr,
        };
        if ones > 0 {
            strata
                .entry(stratum_for("1"))
                .or_default()
                .insert(Vote::single("1"), ones);
        }
        if zeros > 0 {
            strata
                .entry(stratum_for("0"))
                .or_default()
                .insert(Vote::single("0"), zeros);
        }
        tally
    }

    #[test]
    fn landslide_with_agreeing_sample_has_tiny_risk() {
        let election = election_with(CvrType::Cvr, 900, 100, "1", 2000);
        let tally = matching_sample(&election, 36, 4);
        let r = measure_risk(&election, &tally, "C", 1, SEED).unwrap();
        assert!(r.risk >= 0.0 && r.risk <= 1.0);
        assert!(r.risk < 0.05, "landslide measured risk {}", r.risk);
        assert_eq!(r.sample_total, 40);
        let params = &election.contest_params["C"];
        assert_eq!(decide_status(r.risk, params), ContestStatus::Passed);
    }

    #[test]
    fn wrong_reported_outcome_has_near_certain_risk() {
        let election = election_with(CvrType::Cvr, 900, 100, "0", 2000);
        let tally = matching_sample(&election, 36, 4);
        let r = measure_risk(&election, &tally, "C", 1, SEED).unwrap();
        assert!(r.risk >= 0.99, "wrong outcome measured risk {}", r.risk);
        let params = &election.contest_params["C"];
        assert_eq!(decide_status(r.risk, params), ContestStatus::Upset);
    }

    #[test]
    fn nocvr_draws_from_the_tally_urn() {
        // No per-ballot CVRs anywhere; the urn must come from the
        // reported tallies plus the pooled sample.
        let election = election_with(CvrType::NoCvr, 900, 100, "1", 1000);
        let tally = matching_sample(&election, 18, 2);
        let r = measure_risk(&election, &tally, "C", 1, SEED).unwrap();
        assert!(r.risk < 0.05, "noCVR landslide measured risk {}", r.risk);
    }

    #[test]
    fn tiny_pseudocounts_do_not_break_the_draw() {
        let mut election = election_with(CvrType::Cvr, 900, 100, "1", 300);
        election.contest_params.get_mut("C").unwrap().pseudocount = 0.001;
        let tally = matching_sample(&election, 36, 4);
        let r = measure_risk(&election, &tally, "C", 1, SEED).unwrap();
        assert!((0.0..=1.0).contains(&r.risk));
        assert!(r.risk < 0.05, "concentrated posterior measured {}", r.risk);
    }

    #[test]
    fn risk_is_reproducible() {
        let election = election_with(CvrType::Cvr, 90, 60, "1", 500);
        let tally = matching_sample(&election, 6, 4);
        let a = measure_risk(&election, &tally, "C", 2, SEED).unwrap();
        let b = measure_risk(&election, &tally, "C", 2, SEED).unwrap();
        assert_eq!(a.risk, b.risk);
        let other_stage = measure_risk(&election, &tally, "C", 3, SEED).unwrap();
        assert!((0.0..=1.0).contains(&other_stage.risk));
    }
}
