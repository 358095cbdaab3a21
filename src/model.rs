//! The typed in-memory election: structure, reported data, audit
//! parameters, and the consistency checks that run before any sampling.
//!
//! There is no process-wide state anywhere in the engine; an [`Election`]
//! is assembled from the versioned files and passed explicitly to each
//! stage operation.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use indexmap::IndexMap;

use crate::errors::AuditError;
use crate::ids::{self, Vote, VoteClass};
use crate::manifest::Manifest;

pub type Cid = String;
pub type Pbcid = String;
pub type Bid = String;
pub type SelId = String;

/// Supported tabulation methods. Preferential methods are reserved: their
/// rows parse to an error rather than silently tallying as plurality.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContestType {
    Plurality,
}

impl FromStr for ContestType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "plurality" => Ok(ContestType::Plurality),
            other => Err(format!("unsupported contest type {other:?}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteinPolicy {
    No,
    Qualified,
    Arbitrary,
}

impl FromStr for WriteinPolicy {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "no" => Ok(WriteinPolicy::No),
            "qualified" => Ok(WriteinPolicy::Qualified),
            "arbitrary" => Ok(WriteinPolicy::Arbitrary),
            other => Err(format!("unknown write-in policy {other:?}")),
        }
    }
}

/// One contest: its rules and its declared selection set.
///
/// `selections` holds reduced selection ids, sorted; pre-qualified
/// write-ins appear here with their `+` prefix.
#[derive(Debug, Clone)]
pub struct Contest {
    pub cid: Cid,
    pub kind: ContestType,
    /// `w ≥ 1` winners.
    pub winners: usize,
    pub writeins: WriteinPolicy,
    pub selections: BTreeSet<SelId>,
}

impl Contest {
    /// Classify a vote against this contest's rules.
    ///
    /// A plurality voter marks one selection; `winners` widens the winner
    /// set, not the ballot. An unknown non-write-in selection is the
    /// caller's data-entry error, reported as [`AuditError::UnknownSelection`].
    pub fn classify(&self, vote: &Vote) -> Result<VoteClass, AuditError> {
        let sels = match vote {
            Vote::Set(s) => s,
            Vote::Ranked(_) => {
                return Err(AuditError::consistency(format!(
                    "contest {}: ranked vote in a plurality contest",
                    self.cid
                )))
            }
        };
        match sels.as_slice() {
            [] => Ok(VoteClass::Undervote),
            [s] => {
                if ids::is_special(s) {
                    Ok(VoteClass::Special)
                } else if ids::is_writein(s) {
                    match self.writeins {
                        WriteinPolicy::No => Ok(VoteClass::InvalidWritein),
                        WriteinPolicy::Qualified => {
                            if self.selections.contains(s) {
                                Ok(VoteClass::Valid)
                            } else {
                                Ok(VoteClass::InvalidWritein)
                            }
                        }
                        WriteinPolicy::Arbitrary => Ok(VoteClass::Valid),
                    }
                } else if self.selections.contains(s) {
                    Ok(VoteClass::Valid)
                } else {
                    Err(AuditError::UnknownSelection {
                        cid: self.cid.clone(),
                        selid: s.clone(),
                    })
                }
            }
            _ => Ok(VoteClass::Overvote),
        }
    }

    /// The single tally category a vote lands in for the risk estimator.
    pub fn category_of(&self, vote: &Vote) -> Result<SelId, AuditError> {
        Ok(match self.classify(vote)? {
            VoteClass::Undervote => ids::SEL_UNDERVOTE.to_string(),
            VoteClass::Overvote => ids::SEL_OVERVOTE.to_string(),
            VoteClass::InvalidWritein => ids::SEL_INVALID.to_string(),
            VoteClass::Special => vote.selections()[0].clone(),
            VoteClass::Valid => {
                let s = &vote.selections()[0];
                if ids::is_writein(s) && !self.selections.contains(s) {
                    // An arbitrary (unlisted) write-in pools with the rest.
                    ids::SEL_WRITEIN_POOL.to_string()
                } else {
                    s.clone()
                }
            }
        })
    }

    /// The base category set for the posterior urn: declared selections,
    /// the standard invalid outcomes, and the write-in pool where the
    /// policy admits unlisted write-ins. Sorted (BTreeSet), so seeded runs
    /// see a stable ordering.
    pub fn base_categories(&self) -> BTreeSet<SelId> {
        let mut cats = self.selections.clone();
        cats.insert(ids::SEL_INVALID.to_string());
        cats.insert(ids::SEL_OVERVOTE.to_string());
        cats.insert(ids::SEL_UNDERVOTE.to_string());
        if self.writeins == WriteinPolicy::Arbitrary {
            cats.insert(ids::SEL_WRITEIN_POOL.to_string());
        }
        cats
    }

    /// Is this selection id an acceptable *reported winner* here?
    pub fn valid_winner(&self, selid: &str) -> bool {
        self.selections.contains(selid)
            || (self.writeins == WriteinPolicy::Arbitrary && ids::is_writein(selid))
    }
}

/// Whether a collection's scanners produce per-ballot CVRs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CvrType {
    Cvr,
    NoCvr,
}

impl FromStr for CvrType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cvr" => Ok(CvrType::Cvr),
            "nocvr" => Ok(CvrType::NoCvr),
            other => Err(format!("unknown collection type {other:?}")),
        }
    }
}

/// One paper ballot collection and the contests it may carry.
#[derive(Debug, Clone)]
pub struct Collection {
    pub pbcid: Pbcid,
    pub manager: String,
    pub cvr_type: CvrType,
    pub contests: Vec<Cid>,
}

/// Election metadata from `11-election.csv`.
#[derive(Debug, Clone, Default)]
pub struct ElectionInfo {
    pub name: String,
    pub dirname: String,
    pub date: String,
    pub url: String,
}

/// The write-once structural tables: contests and collections, in
/// declaration order.
#[derive(Debug, Clone)]
pub struct Structure {
    pub info: ElectionInfo,
    pub contests: IndexMap<Cid, Contest>,
    pub collections: IndexMap<Pbcid, Collection>,
}

impl Structure {
    /// `rel[cid]`: the collections that may carry ballots for `cid`.
    /// Derived from the collections' contest lists, which keeps the
    /// relation bidirectionally consistent by construction.
    pub fn rel(&self, cid: &str) -> Vec<&Pbcid> {
        self.collections
            .values()
            .filter(|c| c.contests.iter().any(|x| x == cid))
            .map(|c| &c.pbcid)
            .collect()
    }

    /// Structure-level consistency: every contest a collection lists must
    /// be declared, and every contest must be carried somewhere.
    pub fn check(&self) -> Result<(), AuditError> {
        for coll in self.collections.values() {
            for cid in &coll.contests {
                if !self.contests.contains_key(cid) {
                    return Err(AuditError::consistency(format!(
                        "collection {} lists undeclared contest {}",
                        coll.pbcid, cid
                    )));
                }
            }
        }
        for contest in self.contests.values() {
            if self.rel(&contest.cid).is_empty() {
                return Err(AuditError::consistency(format!(
                    "contest {} is carried by no collection",
                    contest.cid
                )));
            }
            if contest.winners == 0 {
                return Err(AuditError::parameter(format!(
                    "contest {}: winners must be at least 1",
                    contest.cid
                )));
            }
        }
        Ok(())
    }
}

/// Reported votes: per-ballot CVRs for CVR collections, per-contest vote
/// tallies for noCVR collections.
#[derive(Debug, Clone, Default)]
pub struct ReportedVotes {
    pub cvr: BTreeMap<Pbcid, BTreeMap<Bid, BTreeMap<Cid, Vote>>>,
    pub tallies: BTreeMap<Pbcid, BTreeMap<Cid, BTreeMap<Vote, usize>>>,
}

impl ReportedVotes {
    /// The reported vote for `(pbcid, bid, cid)` in a CVR collection.
    /// A ballot the scanner produced no row for reports `-NoRecord`.
    pub fn reported_vote(&self, pbcid: &str, bid: &str, cid: &str) -> Vote {
        self.cvr
            .get(pbcid)
            .and_then(|b| b.get(bid))
            .and_then(|c| c.get(cid))
            .cloned()
            .unwrap_or_else(|| Vote::single(ids::SEL_NO_RECORD))
    }
}

/// How a contest's risk is measured. Only Bayes is implemented; the
/// parameter file reserves the slot for frequentist methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RiskMethod {
    Bayes,
}

impl FromStr for RiskMethod {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bayes" => Ok(RiskMethod::Bayes),
            other => Err(format!("unknown risk measurement method {other:?}")),
        }
    }
}

impl fmt::Display for RiskMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Bayes")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplingMode {
    Active,
    Opportunistic,
}

impl FromStr for SamplingMode {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "active" => Ok(SamplingMode::Active),
            "opportunistic" => Ok(SamplingMode::Opportunistic),
            other => Err(format!("unknown sampling mode {other:?}")),
        }
    }
}

impl fmt::Display for SamplingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SamplingMode::Active => "Active",
            SamplingMode::Opportunistic => "Opportunistic",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContestStatus {
    Open,
    Passed,
    Upset,
    Off,
}

impl ContestStatus {
    /// Terminal statuses never reopen (monotone stopping).
    pub fn is_terminal(self) -> bool {
        !matches!(self, ContestStatus::Open)
    }
}

impl FromStr for ContestStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "open" => Ok(ContestStatus::Open),
            "passed" => Ok(ContestStatus::Passed),
            "upset" => Ok(ContestStatus::Upset),
            "off" => Ok(ContestStatus::Off),
            other => Err(format!("unknown contest status {other:?}")),
        }
    }
}

impl fmt::Display for ContestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ContestStatus::Open => "Open",
            ContestStatus::Passed => "Passed",
            ContestStatus::Upset => "Upset",
            ContestStatus::Off => "Off",
        })
    }
}

/// Global audit parameters (`10-audit-parameters-global`).
#[derive(Debug, Clone)]
pub struct GlobalParams {
    pub max_audit_stages: u32,
    /// Monte-Carlo trials per contest per stage.
    pub n_trials: u64,
    /// Relative weight of a reported-tally ballot as a prior observation
    /// in a noCVR urn. The reference leaves this scale open, so it is a
    /// parameter here.
    pub nocvr_prior_weight: f64,
}

impl Default for GlobalParams {
    fn default() -> Self {
        GlobalParams {
            max_audit_stages: 20,
            n_trials: 100_000,
            nocvr_prior_weight: 1.0,
        }
    }
}

impl GlobalParams {
    pub fn validate(&self) -> Result<(), AuditError> {
        if self.n_trials == 0 {
            return Err(AuditError::parameter("n_trials must be positive"));
        }
        if self.n_trials > (1 << 31) {
            return Err(AuditError::parameter(
                "n_trials above 2^31 would exhaust the trial counter space",
            ));
        }
        if self.max_audit_stages == 0 {
            return Err(AuditError::parameter("max_audit_stages must be positive"));
        }
        if !(self.nocvr_prior_weight > 0.0) {
            return Err(AuditError::parameter(
                "nocvr_prior_weight must be positive",
            ));
        }
        Ok(())
    }
}

/// Per-contest audit parameters (`11-audit-parameters-contest`).
#[derive(Debug, Clone)]
pub struct ContestParams {
    pub cid: Cid,
    pub method: RiskMethod,
    /// `λ`: measured risk at or below this passes the contest.
    pub risk_limit: f64,
    /// `υ ≥ λ`: measured risk at or above this escalates to a full hand count.
    pub upset_threshold: f64,
    pub sampling_mode: SamplingMode,
    pub status: ContestStatus,
    /// `α`: Dirichlet concentration over the vote categories.
    pub pseudocount: f64,
}

impl ContestParams {
    pub fn validate(&self) -> Result<(), AuditError> {
        if !(0.0..=1.0).contains(&self.risk_limit) {
            return Err(AuditError::parameter(format!(
                "contest {}: risk_limit {} not in [0,1]",
                self.cid, self.risk_limit
            )));
        }
        if !(0.0..=1.0).contains(&self.upset_threshold) {
            return Err(AuditError::parameter(format!(
                "contest {}: upset_threshold {} not in [0,1]",
                self.cid, self.upset_threshold
            )));
        }
        if self.upset_threshold < self.risk_limit {
            return Err(AuditError::parameter(format!(
                "contest {}: upset_threshold {} below risk_limit {}",
                self.cid, self.upset_threshold, self.risk_limit
            )));
        }
        if !(self.pseudocount > 0.0) {
            return Err(AuditError::parameter(format!(
                "contest {}: pseudocount must be positive",
                self.cid
            )));
        }
        Ok(())
    }
}

/// Per-collection audit parameters (`12-audit-parameters-collection`).
#[derive(Debug, Clone)]
pub struct CollectionParams {
    pub pbcid: Pbcid,
    /// Hard per-stage cap on new ballots pulled from this collection.
    pub max_audit_rate: u32,
}

impl CollectionParams {
    pub fn validate(&self) -> Result<(), AuditError> {
        if self.max_audit_rate == 0 {
            return Err(AuditError::parameter(format!(
                "collection {}: max_audit_rate must be positive",
                self.pbcid
            )));
        }
        Ok(())
    }
}

/// Everything a stage needs, loaded as of its snapshot.
#[derive(Debug, Clone)]
pub struct Election {
    pub structure: Structure,
    pub manifests: BTreeMap<Pbcid, Manifest>,
    pub reported: ReportedVotes,
    /// `ro(cid)`: ordered reported winner lists.
    pub outcomes: BTreeMap<Cid, Vec<SelId>>,
    pub global: GlobalParams,
    pub contest_params: BTreeMap<Cid, ContestParams>,
    pub collection_params: BTreeMap<Pbcid, CollectionParams>,
}

impl Election {
    pub fn contest(&self, cid: &str) -> Result<&Contest, AuditError> {
        self.structure
            .contests
            .get(cid)
            .ok_or_else(|| AuditError::consistency(format!("undeclared contest {cid}")))
    }

    pub fn collection(&self, pbcid: &str) -> Result<&Collection, AuditError> {
        self.structure
            .collections
            .get(pbcid)
            .ok_or_else(|| AuditError::consistency(format!("undeclared collection {pbcid}")))
    }

    pub fn manifest(&self, pbcid: &str) -> Result<&Manifest, AuditError> {
        self.manifests
            .get(pbcid)
            .ok_or_else(|| AuditError::consistency(format!("no manifest for collection {pbcid}")))
    }

    /// `N(pbcid)`.
    pub fn collection_size(&self, pbcid: &str) -> Result<usize, AuditError> {
        Ok(self.manifest(pbcid)?.size())
    }

    /// Full consistency per §4.3: run after everything is loaded, before
    /// any sampling or risk measurement.
    pub fn check_consistency(&self) -> Result<(), AuditError> {
        self.structure.check()?;
        self.check_reported()?;
        self.check_params()?;
        Ok(())
    }

    /// Manifests, CVRs, tallies and outcomes agree with the structure.
    pub fn check_reported(&self) -> Result<(), AuditError> {
        for pbcid in self.manifests.keys() {
            if !self.structure.collections.contains_key(pbcid) {
                return Err(AuditError::consistency(format!(
                    "manifest present for undeclared collection {pbcid}"
                )));
            }
        }
        for coll in self.structure.collections.values() {
            if !self.manifests.contains_key(&coll.pbcid) {
                return Err(AuditError::consistency(format!(
                    "no manifest for collection {}",
                    coll.pbcid
                )));
            }
        }

        for (pbcid, ballots) in &self.reported.cvr {
            let coll = self.collection(pbcid)?;
            if coll.cvr_type != CvrType::Cvr {
                return Err(AuditError::consistency(format!(
                    "per-ballot CVRs supplied for noCVR collection {pbcid}"
                )));
            }
            let manifest = self.manifest(pbcid)?;
            for (bid, votes) in ballots {
                if !manifest.contains_bid(bid) {
                    return Err(AuditError::consistency(format!(
                        "CVR ballot ({pbcid}, {bid}) is not in the manifest"
                    )));
                }
                for (cid, vote) in votes {
                    self.check_carried(pbcid, cid)?;
                    // Surfaces UnknownSelection for undeclared selids.
                    self.contest(cid)?.classify(vote)?;
                }
            }
        }

        for (pbcid, contests) in &self.reported.tallies {
            let coll = self.collection(pbcid)?;
            if coll.cvr_type != CvrType::NoCvr {
                return Err(AuditError::consistency(format!(
                    "reported tallies supplied for CVR collection {pbcid}"
                )));
            }
            for (cid, tally) in contests {
                self.check_carried(pbcid, cid)?;
                let contest = self.contest(cid)?;
                for vote in tally.keys() {
                    contest.classify(vote)?;
                }
            }
        }

        for (cid, winners) in &self.outcomes {
            let contest = self.contest(cid)?;
            if winners.len() != contest.winners {
                return Err(AuditError::consistency(format!(
                    "contest {cid}: reported outcome names {} winners, contest has {}",
                    winners.len(),
                    contest.winners
                )));
            }
            for w in winners {
                if !contest.valid_winner(w) {
                    return Err(AuditError::consistency(format!(
                        "contest {cid}: reported winner {w:?} is not a valid selection"
                    )));
                }
            }
        }
        for cid in self.structure.contests.keys() {
            if !self.outcomes.contains_key(cid) {
                return Err(AuditError::consistency(format!(
                    "no reported outcome for contest {cid}"
                )));
            }
        }
        Ok(())
    }

    /// Parameter tables cover the structure and are in range.
    pub fn check_params(&self) -> Result<(), AuditError> {
        self.global.validate()?;
        for cid in self.structure.contests.keys() {
            let p = self.contest_params.get(cid).ok_or_else(|| {
                AuditError::consistency(format!("no audit parameters for contest {cid}"))
            })?;
            p.validate()?;
        }
        for pbcid in self.structure.collections.keys() {
            let p = self.collection_params.get(pbcid).ok_or_else(|| {
                AuditError::consistency(format!("no audit parameters for collection {pbcid}"))
            })?;
            p.validate()?;
        }
        Ok(())
    }

    fn check_carried(&self, pbcid: &str, cid: &str) -> Result<(), AuditError> {
        let coll = self.collection(pbcid)?;
        self.contest(cid)?;
        if !coll.contests.iter().any(|c| c == cid) {
            return Err(AuditError::consistency(format!(
                "collection {pbcid} reports votes for contest {cid} it does not carry"
            )));
        }
        Ok(())
    }
}
