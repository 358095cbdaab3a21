//! Audited-vote ingestion: turning cumulative transcripts into the
//! sample cross-tab the risk estimator consumes.
//!
//! Each collection manager uploads *all* ballots audited so far, every
//! time. We check the upload against the manifest and against the
//! sampling order — an upload must cover an initial segment of the order
//! with no skips, or someone pulled the wrong ballot from the wrong box.

use std::collections::{BTreeMap, HashSet};

use color_eyre::eyre::Result;
use tracing::debug;

use crate::errors::AuditError;
use crate::ids::Vote;
use crate::model::{Cid, CvrType, Election, Pbcid};
use crate::sampler;
use crate::tables::AuditedVoteRow;

/// The reported-vote stratum of one sample observation.
///
/// CVR collections stratify by the scanner's reported vote, which is what
/// makes a comparison audit sharp; noCVR collections have nothing to
/// stratify on and pool into a single stratum.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stratum {
    Reported(Vote),
    NoCvr,
}

/// `s[cid, pbcid, rvote, avote]`: the per-stage sample tally, plus the
/// audited-ballot count per collection. Ephemeral — rebuilt from the
/// snapshot every stage.
#[derive(Debug, Default)]
pub struct SampleTally {
    pub counts: BTreeMap<(Cid, Pbcid), BTreeMap<Stratum, BTreeMap<Vote, usize>>>,
    /// `n(pbcid)`: distinct ballots audited so far per collection.
    pub audited: BTreeMap<Pbcid, usize>,
}

impl SampleTally {
    pub fn audited_in(&self, pbcid: &str) -> usize {
        self.audited.get(pbcid).copied().unwrap_or(0)
    }

    /// Total audited observations for a contest, across collections.
    pub fn sample_total(&self, cid: &str) -> usize {
        self.counts
            .iter()
            .filter(|((c, _), _)| c == cid)
            .flat_map(|(_, strata)| strata.values())
            .flat_map(|avotes| avotes.values())
            .sum()
    }

    /// The observed counts for one `(cid, pbcid)`, if any.
    pub fn strata(&self, cid: &str, pbcid: &str) -> Option<&BTreeMap<Stratum, BTreeMap<Vote, usize>>> {
        self.counts.get(&(cid.to_string(), pbcid.to_string()))
    }
}

/// Absorb the latest transcripts into a sample tally, validating manifest
/// membership and the no-skips prefix property against each collection's
/// sampling order.
pub fn ingest(
    election: &Election,
    orders: &BTreeMap<Pbcid, Vec<usize>>,
    transcripts: &BTreeMap<Pbcid, Vec<AuditedVoteRow>>,
) -> Result<SampleTally> {
    let mut tally = SampleTally::default();

    for collection in election.structure.collections.values() {
        let pbcid = &collection.pbcid;
        let rows = match transcripts.get(pbcid) {
            Some(rows) => rows,
            None => {
                tally.audited.insert(pbcid.clone(), 0);
                continue;
            }
        };
        let manifest = election.manifest(pbcid)?;
        let order = orders
            .get(pbcid)
            .ok_or_else(|| AuditError::consistency(format!("no sampling order for {pbcid}")))?;
        let ordered = sampler::ordered_bids(manifest, order);

        let audited_bids: HashSet<&str> = rows.iter().map(|r| r.bid.as_str()).collect();
        for bid in &audited_bids {
            if !manifest.contains_bid(bid) {
                return Err(AuditError::consistency(format!(
                    "audited ballot ({pbcid}, {bid}) is not in the manifest"
                ))
                .into());
            }
        }
        // The audited bids must be exactly the first |audited| entries of
        // the sampling order; the first uncovered entry is the skip.
        for (i, bid) in ordered.iter().take(audited_bids.len()).enumerate() {
            if !audited_bids.contains(bid) {
                return Err(AuditError::OutOfOrderSample {
                    pbcid: pbcid.clone(),
                    missing_bid: (*bid).to_string(),
                    position: i + 1,
                }
                .into());
            }
        }
        debug!(
            "{pbcid}: {} audited ballots form a clean prefix of the order",
            audited_bids.len()
        );
        tally.audited.insert(pbcid.clone(), audited_bids.len());

        let mut seen_rows: HashSet<(&str, &str)> = HashSet::new();
        for row in rows {
            if !seen_rows.insert((row.bid.as_str(), row.cid.as_str())) {
                return Err(AuditError::consistency(format!(
                    "audited votes for {pbcid} record ballot {} contest {} twice",
                    row.bid, row.cid
                ))
                .into());
            }
            let contest = election.contest(&row.cid)?;
            if !collection.contests.iter().any(|c| c == &row.cid) {
                return Err(AuditError::consistency(format!(
                    "collection {pbcid} audited contest {} it does not carry",
                    row.cid
                ))
                .into());
            }
            // Surfaces UnknownSelection before anything tallies.
            contest.classify(&row.vote)?;

            let stratum = match collection.cvr_type {
                CvrType::Cvr => {
                    Stratum::Reported(election.reported.reported_vote(pbcid, &row.bid, &row.cid))
                }
                CvrType::NoCvr => Stratum::NoCvr,
            };
            *tally
                .counts
                .entry((row.cid.clone(), pbcid.clone()))
                .or_default()
                .entry(stratum)
                .or_default()
                .entry(row.vote.clone())
                .or_insert(0) += 1;
        }
    }
    Ok(tally)
}
