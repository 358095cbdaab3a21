//! Readers and writers for the CSV tables of an election directory.
//!
//! Layout (every name is a versioned (prefix, suffix) pair — see
//! [`crate::files`]):
//!
//! ```text
//! <dir>/
//!   10-structure/   11-election.csv  12-contests.csv  13-collections.csv
//!   20-reported/    reported-cvrs-<pbcid>.csv  manifest-<pbcid>.csv
//!                   23-reported-outcomes.csv
//!   30-audit/
//!     311-audit-seed.csv
//!     10-audit-parameters-global.csv
//!     11-audit-parameters-contest.csv
//!     12-audit-parameters-collection.csv
//!     audit-order-<pbcid>.csv
//!     audited-votes-<pbcid>.csv
//!     stage-<NNN>/   20-audit-snapshot-…  30-audit-output-…  40-audit-plan-…
//! ```
//!
//! Fixed-shape rows deserialize through serde; tables with variadic
//! selection columns are handled record-by-record.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use color_eyre::eyre::{Context, ContextCompat, Result};
use indexmap::IndexMap;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use crate::errors::AuditError;
use crate::files;
use crate::ids::{self, parse_vote, Vote};
use crate::manifest::{Manifest, ManifestRow};
use crate::model::{
    Cid, Collection, CollectionParams, Contest, ContestParams, ContestStatus, ContestType,
    CvrType, Election, ElectionInfo, GlobalParams, Pbcid, ReportedVotes, RiskMethod,
    SamplingMode, SelId, Structure,
};

static SEED_SYNTAX: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[0-9]{20,}$").unwrap());

/// Path arithmetic for one election's directory tree.
#[derive(Debug, Clone)]
pub struct ElectionDir {
    root: PathBuf,
}

impl ElectionDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        ElectionDir { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn structure_dir(&self) -> PathBuf {
        self.root.join("10-structure")
    }

    pub fn reported_dir(&self) -> PathBuf {
        self.root.join("20-reported")
    }

    pub fn audit_dir(&self) -> PathBuf {
        self.root.join("30-audit")
    }

    /// `30-audit/stage-<NNN>/`, the one directory a stage may create.
    pub fn stage_dir(&self, stage_label: &str) -> PathBuf {
        self.audit_dir().join(format!("stage-{stage_label}"))
    }
}

/// An identifier field: reduced, comma-free, non-empty.
fn checked_id(field: &str, what: &str) -> Result<String> {
    let id = ids::reduce(field);
    if id.is_empty() {
        return Err(AuditError::consistency(format!("empty {what} identifier")).into());
    }
    if id.contains(',') {
        return Err(AuditError::consistency(format!(
            "{what} identifier {id:?} contains a comma"
        ))
        .into());
    }
    Ok(id)
}

fn reader_for(path: &Path) -> Result<csv::Reader<std::fs::File>> {
    csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_path(path)
        .with_context(|| format!("could not open {}", path.display()))
}

/// Serialize rows and land them atomically.
pub fn write_csv(path: &Path, header: &[&str], rows: &[Vec<String>]) -> Result<()> {
    let mut wtr = csv::Writer::from_writer(Vec::new());
    wtr.write_record(header)?;
    for row in rows {
        wtr.write_record(row)?;
    }
    let bytes = wtr.into_inner().context("could not finish CSV buffer")?;
    files::atomic_write(path, &bytes)
}

/* ***** 10-structure ***** */

/// `11-election.csv`: attribute/value pairs.
pub fn read_election_info(dir: &ElectionDir, inputs: &mut Vec<PathBuf>) -> Result<ElectionInfo> {
    let (path, _) = files::require_operative(&dir.structure_dir(), "11-election", ".csv")?;
    let mut info = ElectionInfo::default();
    let mut seen = Vec::new();
    let mut rdr = reader_for(&path)?;
    for (i, record) in rdr.records().enumerate() {
        let row = record.with_context(|| format!("{}: row {}", path.display(), i + 2))?;
        let attribute = row.get(0).unwrap_or("").trim();
        let value = row.get(1).unwrap_or("").trim().to_string();
        seen.push(attribute.to_string());
        match attribute {
            "Election name" => info.name = value,
            "Election dirname" => info.dirname = value,
            "Election date" => info.date = value,
            "Election URL" => info.url = value,
            _ => debug!("{}: ignoring attribute {attribute:?}", path.display()),
        }
    }
    for required in ["Election name", "Election dirname", "Election date", "Election URL"] {
        if !seen.iter().any(|s| s == required) {
            return Err(AuditError::consistency(format!(
                "{}: required attribute {required:?} absent",
                path.display()
            ))
            .into());
        }
    }
    inputs.push(path);
    Ok(info)
}

/// `12-contests.csv`: `cid, type, winners, writeins, selection_1, …`.
pub fn read_contests(
    dir: &ElectionDir,
    inputs: &mut Vec<PathBuf>,
) -> Result<IndexMap<Cid, Contest>> {
    let (path, _) = files::require_operative(&dir.structure_dir(), "12-contests", ".csv")?;
    let mut contests: IndexMap<Cid, Contest> = IndexMap::new();
    let mut rdr = reader_for(&path)?;
    for (i, record) in rdr.records().enumerate() {
        let at = || format!("{}: row {}", path.display(), i + 2);
        let row = record.with_context(at)?;
        let cid = checked_id(row.get(0).unwrap_or(""), "contest").with_context(at)?;
        let kind: ContestType = row
            .get(1)
            .unwrap_or("")
            .parse()
            .map_err(AuditError::consistency)
            .with_context(at)?;
        let winners: usize = row
            .get(2)
            .unwrap_or("")
            .parse()
            .context("winners must be an integer")
            .with_context(at)?;
        let writeins = row
            .get(3)
            .unwrap_or("")
            .parse()
            .map_err(AuditError::consistency)
            .with_context(at)?;
        let selections = row
            .iter()
            .skip(4)
            .map(ids::reduce)
            .filter(|s| !s.is_empty())
            .collect();
        let contest = Contest {
            cid: cid.clone(),
            kind,
            winners,
            writeins,
            selections,
        };
        if contests.insert(cid.clone(), contest).is_some() {
            return Err(AuditError::consistency(format!("contest {cid} declared twice")))
                .with_context(at);
        }
    }
    inputs.push(path);
    Ok(contests)
}

/// `13-collections.csv`: `pbcid, manager, cvr_type, cid_1, …`.
pub fn read_collections(
    dir: &ElectionDir,
    inputs: &mut Vec<PathBuf>,
) -> Result<IndexMap<Pbcid, Collection>> {
    let (path, _) = files::require_operative(&dir.structure_dir(), "13-collections", ".csv")?;
    let mut collections: IndexMap<Pbcid, Collection> = IndexMap::new();
    let mut rdr = reader_for(&path)?;
    for (i, record) in rdr.records().enumerate() {
        let at = || format!("{}: row {}", path.display(), i + 2);
        let row = record.with_context(at)?;
        let pbcid = checked_id(row.get(0).unwrap_or(""), "collection").with_context(at)?;
        let manager = row.get(1).unwrap_or("").trim().to_string();
        let cvr_type: CvrType = row
            .get(2)
            .unwrap_or("")
            .parse()
            .map_err(AuditError::consistency)
            .with_context(at)?;
        let contests: Vec<Cid> = row
            .iter()
            .skip(3)
            .map(ids::reduce)
            .filter(|s| !s.is_empty())
            .collect();
        let collection = Collection {
            pbcid: pbcid.clone(),
            manager,
            cvr_type,
            contests,
        };
        if collections.insert(pbcid.clone(), collection).is_some() {
            return Err(AuditError::consistency(format!(
                "collection {pbcid} declared twice"
            )))
            .with_context(at);
        }
    }
    inputs.push(path);
    Ok(collections)
}

pub fn load_structure(dir: &ElectionDir, inputs: &mut Vec<PathBuf>) -> Result<Structure> {
    let info = read_election_info(dir, inputs)?;
    let contests = read_contests(dir, inputs)?;
    let collections = read_collections(dir, inputs)?;
    Ok(Structure {
        info,
        contests,
        collections,
    })
}

/* ***** 20-reported ***** */

/// `manifest-<pbcid>.csv`, expanded.
pub fn read_manifest(
    dir: &ElectionDir,
    pbcid: &str,
    inputs: &mut Vec<PathBuf>,
) -> Result<Manifest> {
    let prefix = format!("manifest-{}", ids::file_safe(pbcid));
    let (path, _) = files::require_operative(&dir.reported_dir(), &prefix, ".csv")?;
    let mut rows: Vec<ManifestRow> = Vec::new();
    let mut rdr = reader_for(&path)?;
    for (i, record) in rdr.deserialize().enumerate() {
        let at = || format!("{}: row {}", path.display(), i + 2);
        let row: ManifestRow = record.with_context(at)?;
        if ids::reduce(&row.pbcid) != pbcid {
            return Err(AuditError::consistency(format!(
                "manifest row names collection {:?}, file belongs to {pbcid}",
                row.pbcid
            )))
            .with_context(at);
        }
        rows.push(row);
    }
    let manifest = Manifest::expand(pbcid, &rows)
        .with_context(|| format!("expanding {}", path.display()))?;
    inputs.push(path);
    Ok(manifest)
}

/// `reported-cvrs-<pbcid>.csv`: per-ballot rows for CVR collections,
/// `(tally, vote)` rows for noCVR collections.
pub fn read_reported_cvrs(
    dir: &ElectionDir,
    collection: &Collection,
    reported: &mut ReportedVotes,
    inputs: &mut Vec<PathBuf>,
) -> Result<()> {
    let prefix = format!("reported-cvrs-{}", ids::file_safe(&collection.pbcid));
    let (path, _) = files::require_operative(&dir.reported_dir(), &prefix, ".csv")?;
    let mut rdr = reader_for(&path)?;
    for (i, record) in rdr.records().enumerate() {
        let at = || format!("{}: row {}", path.display(), i + 2);
        let row = record.with_context(at)?;
        let pbcid = checked_id(row.get(0).unwrap_or(""), "collection").with_context(at)?;
        if pbcid != collection.pbcid {
            return Err(AuditError::consistency(format!(
                "CVR row names collection {pbcid}, file belongs to {}",
                collection.pbcid
            )))
            .with_context(at);
        }
        // Column 1 is the scanner id; audit arithmetic never uses it.
        let cid = checked_id(row.get(3).unwrap_or(""), "contest").with_context(at)?;
        let vote = parse_vote(row.iter().skip(4));
        match collection.cvr_type {
            CvrType::Cvr => {
                let bid = checked_id(row.get(2).unwrap_or(""), "ballot").with_context(at)?;
                let prev = reported
                    .cvr
                    .entry(pbcid)
                    .or_default()
                    .entry(bid.clone())
                    .or_default()
                    .insert(cid.clone(), vote);
                if prev.is_some() {
                    return Err(AuditError::consistency(format!(
                        "duplicate CVR row for ballot {bid}, contest {cid}"
                    )))
                    .with_context(at);
                }
            }
            CvrType::NoCvr => {
                let tally: usize = row
                    .get(2)
                    .unwrap_or("")
                    .parse()
                    .context("noCVR tally must be an integer")
                    .with_context(at)?;
                *reported
                    .tallies
                    .entry(pbcid)
                    .or_default()
                    .entry(cid)
                    .or_default()
                    .entry(vote)
                    .or_insert(0) += tally;
            }
        }
    }
    inputs.push(path);
    Ok(())
}

/// `23-reported-outcomes.csv`: `cid, winner_1, …`.
pub fn read_outcomes(
    dir: &ElectionDir,
    inputs: &mut Vec<PathBuf>,
) -> Result<BTreeMap<Cid, Vec<SelId>>> {
    let (path, _) = files::require_operative(&dir.reported_dir(), "23-reported-outcomes", ".csv")?;
    let mut outcomes = BTreeMap::new();
    let mut rdr = reader_for(&path)?;
    for (i, record) in rdr.records().enumerate() {
        let at = || format!("{}: row {}", path.display(), i + 2);
        let row = record.with_context(at)?;
        let cid = checked_id(row.get(0).unwrap_or(""), "contest").with_context(at)?;
        let winners: Vec<SelId> = row
            .iter()
            .skip(1)
            .map(ids::reduce)
            .filter(|s| !s.is_empty())
            .collect();
        if outcomes.insert(cid.clone(), winners).is_some() {
            return Err(AuditError::consistency(format!(
                "contest {cid} has two reported outcomes"
            )))
            .with_context(at);
        }
    }
    inputs.push(path);
    Ok(outcomes)
}

/* ***** 30-audit inputs ***** */

/// `311-audit-seed.csv`: one cell, a decimal string of at least 20 digits.
pub fn read_seed(dir: &ElectionDir, inputs: &mut Vec<PathBuf>) -> Result<String> {
    let (path, _) = files::require_operative(&dir.audit_dir(), "311-audit-seed", ".csv")?;
    let mut rdr = reader_for(&path)?;
    let row = rdr
        .records()
        .next()
        .with_context(|| format!("{}: no seed row", path.display()))?
        .with_context(|| format!("{}: seed row unreadable", path.display()))?;
    let seed = row.get(0).unwrap_or("").trim().to_string();
    if !SEED_SYNTAX.is_match(&seed) {
        return Err(AuditError::SeedInvalid).with_context(|| path.display().to_string());
    }
    inputs.push(path);
    Ok(seed)
}

/// `10-audit-parameters-global`: `max_audit_stages, n_trials[, nocvr_prior_weight]`.
pub fn read_global_params(dir: &ElectionDir, inputs: &mut Vec<PathBuf>) -> Result<GlobalParams> {
    let (path, _) =
        files::require_operative(&dir.audit_dir(), "10-audit-parameters-global", ".csv")?;
    let mut rdr = reader_for(&path)?;
    let row = rdr
        .records()
        .next()
        .with_context(|| format!("{}: no parameter row", path.display()))?
        .with_context(|| format!("{}: parameter row unreadable", path.display()))?;
    let at = || format!("{}: row 2", path.display());
    let defaults = GlobalParams::default();
    let params = GlobalParams {
        max_audit_stages: row
            .get(0)
            .unwrap_or("")
            .parse()
            .context("max_audit_stages must be an integer")
            .with_context(at)?,
        n_trials: row
            .get(1)
            .unwrap_or("")
            .parse()
            .context("n_trials must be an integer")
            .with_context(at)?,
        nocvr_prior_weight: match row.get(2).map(str::trim).filter(|s| !s.is_empty()) {
            Some(s) => s
                .parse()
                .context("nocvr_prior_weight must be a number")
                .with_context(at)?,
            None => defaults.nocvr_prior_weight,
        },
    };
    inputs.push(path);
    Ok(params)
}

/// `11-audit-parameters-contest`: `cid, method, risk_limit,
/// upset_threshold, sampling_mode, status, param_1, …`. Method parameters
/// are `name=value` cells (`pseudocount=0.5`); a bare number is shorthand
/// for the pseudocount.
pub fn read_contest_params(
    dir: &ElectionDir,
    inputs: &mut Vec<PathBuf>,
) -> Result<BTreeMap<Cid, ContestParams>> {
    let (path, _) =
        files::require_operative(&dir.audit_dir(), "11-audit-parameters-contest", ".csv")?;
    let mut params = BTreeMap::new();
    let mut rdr = reader_for(&path)?;
    for (i, record) in rdr.records().enumerate() {
        let at = || format!("{}: row {}", path.display(), i + 2);
        let row = record.with_context(at)?;
        let cid = checked_id(row.get(0).unwrap_or(""), "contest").with_context(at)?;
        let method: RiskMethod = row
            .get(1)
            .unwrap_or("")
            .parse()
            .map_err(AuditError::consistency)
            .with_context(at)?;
        let risk_limit: f64 = row
            .get(2)
            .unwrap_or("")
            .parse()
            .context("risk_limit must be a number")
            .with_context(at)?;
        let upset_threshold: f64 = row
            .get(3)
            .unwrap_or("")
            .parse()
            .context("upset_threshold must be a number")
            .with_context(at)?;
        let sampling_mode: SamplingMode = row
            .get(4)
            .unwrap_or("")
            .parse()
            .map_err(AuditError::consistency)
            .with_context(at)?;
        let status: ContestStatus = row
            .get(5)
            .unwrap_or("")
            .parse()
            .map_err(AuditError::consistency)
            .with_context(at)?;
        let mut pseudocount = 0.5;
        for cell in row.iter().skip(6).filter(|s| !s.trim().is_empty()) {
            let (name, value) = match cell.split_once('=') {
                Some((n, v)) => (n.trim(), v.trim()),
                None => ("pseudocount", cell.trim()),
            };
            match name {
                "pseudocount" => {
                    pseudocount = value
                        .parse()
                        .context("pseudocount must be a number")
                        .with_context(at)?;
                }
                other => {
                    return Err(AuditError::parameter(format!(
                        "contest {cid}: unknown method parameter {other:?}"
                    )))
                    .with_context(at)
                }
            }
        }
        let p = ContestParams {
            cid: cid.clone(),
            method,
            risk_limit,
            upset_threshold,
            sampling_mode,
            status,
            pseudocount,
        };
        if params.insert(cid.clone(), p).is_some() {
            return Err(AuditError::consistency(format!(
                "contest {cid} has two parameter rows"
            )))
            .with_context(at);
        }
    }
    inputs.push(path);
    Ok(params)
}

/// `12-audit-parameters-collection`: `pbcid, max_audit_rate`.
pub fn read_collection_params(
    dir: &ElectionDir,
    inputs: &mut Vec<PathBuf>,
) -> Result<BTreeMap<Pbcid, CollectionParams>> {
    let (path, _) =
        files::require_operative(&dir.audit_dir(), "12-audit-parameters-collection", ".csv")?;
    let mut params = BTreeMap::new();
    let mut rdr = reader_for(&path)?;
    for (i, record) in rdr.records().enumerate() {
        let at = || format!("{}: row {}", path.display(), i + 2);
        let row = record.with_context(at)?;
        let pbcid = checked_id(row.get(0).unwrap_or(""), "collection").with_context(at)?;
        let max_audit_rate: u32 = row
            .get(1)
            .unwrap_or("")
            .parse()
            .context("max_audit_rate must be an integer")
            .with_context(at)?;
        let p = CollectionParams {
            pbcid: pbcid.clone(),
            max_audit_rate,
        };
        if params.insert(pbcid.clone(), p).is_some() {
            return Err(AuditError::consistency(format!(
                "collection {pbcid} has two parameter rows"
            )))
            .with_context(at);
        }
    }
    inputs.push(path);
    Ok(params)
}

/// One transcript row: an auditor's interpretation of one contest on one
/// sampled ballot.
#[derive(Debug, Clone)]
pub struct AuditedVoteRow {
    pub bid: String,
    pub cid: Cid,
    pub vote: Vote,
}

/// `audited-votes-<pbcid>.csv`, cumulative. `Ok(None)` when the
/// collection has uploaded nothing yet.
pub fn read_audited_votes(
    dir: &ElectionDir,
    pbcid: &str,
    inputs: &mut Vec<PathBuf>,
) -> Result<Option<Vec<AuditedVoteRow>>> {
    let prefix = format!("audited-votes-{}", ids::file_safe(pbcid));
    let found = files::operative(&dir.audit_dir(), &prefix, ".csv")?;
    let (path, label) = match found {
        Some(x) => x,
        None => return Ok(None),
    };
    debug!("audited votes for {pbcid}: using version {label:?}");
    let mut rows = Vec::new();
    let mut rdr = reader_for(&path)?;
    for (i, record) in rdr.records().enumerate() {
        let at = || format!("{}: row {}", path.display(), i + 2);
        let row = record.with_context(at)?;
        let row_pbcid = checked_id(row.get(0).unwrap_or(""), "collection").with_context(at)?;
        if row_pbcid != pbcid {
            return Err(AuditError::consistency(format!(
                "audited-vote row names collection {row_pbcid}, file belongs to {pbcid}"
            )))
            .with_context(at);
        }
        rows.push(AuditedVoteRow {
            bid: checked_id(row.get(1).unwrap_or(""), "ballot").with_context(at)?,
            cid: checked_id(row.get(2).unwrap_or(""), "contest").with_context(at)?,
            vote: parse_vote(row.iter().skip(3)),
        });
    }
    inputs.push(path);
    Ok(Some(rows))
}

/* ***** writers ***** */

/// `audit-order-<pbcid>.csv`: the sampling order, one row per ballot.
pub fn write_audit_order(dir: &ElectionDir, manifest: &Manifest, order: &[usize]) -> Result<()> {
    let path = dir.audit_dir().join(format!(
        "audit-order-{}.csv",
        ids::file_safe(&manifest.pbcid)
    ));
    let header = ["order", "pbcid", "box", "position", "stamp", "bid", "comments"];
    let rows: Vec<Vec<String>> = order
        .iter()
        .enumerate()
        .map(|(i, &idx)| {
            let e = &manifest.entries[idx];
            vec![
                (i + 1).to_string(),
                manifest.pbcid.clone(),
                e.box_id.clone(),
                e.position.to_string(),
                e.stamp.clone(),
                e.bid.clone(),
                e.comments.clone(),
            ]
        })
        .collect();
    write_csv(&path, &header, &rows)
}

/* ***** aggregate loaders ***** */

/// Everything the stage controller needs, plus the operative input paths
/// it was loaded from (for the stage snapshot).
#[derive(Debug)]
pub struct LoadedElection {
    pub election: Election,
    pub inputs: Vec<PathBuf>,
}

/// Structure plus all reported data, with default audit parameters.
/// Enough for `read-reported`, `make-audit-orders` and `read-audited`;
/// a stage run swaps in the real parameter tables via [`load_election`].
pub fn load_reported(dir: &ElectionDir, inputs: &mut Vec<PathBuf>) -> Result<Election> {
    let structure = load_structure(dir, inputs)?;
    let mut manifests = BTreeMap::new();
    let mut reported = ReportedVotes::default();
    for collection in structure.collections.values() {
        manifests.insert(
            collection.pbcid.clone(),
            read_manifest(dir, &collection.pbcid, inputs)?,
        );
        read_reported_cvrs(dir, collection, &mut reported, inputs)?;
    }
    let outcomes = read_outcomes(dir, inputs)?;
    Ok(Election {
        structure,
        manifests,
        reported,
        outcomes,
        global: GlobalParams::default(),
        contest_params: BTreeMap::new(),
        collection_params: BTreeMap::new(),
    })
}

pub fn load_election(dir: &ElectionDir) -> Result<LoadedElection> {
    let mut inputs = Vec::new();
    let mut election = load_reported(dir, &mut inputs)?;
    election.global = read_global_params(dir, &mut inputs)?;
    election.contest_params = read_contest_params(dir, &mut inputs)?;
    election.collection_params = read_collection_params(dir, &mut inputs)?;
    Ok(LoadedElection { election, inputs })
}
