//! The CLI: argument structs and the per-subcommand drivers.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueHint};
use color_eyre::eyre::{Context, Result};
use tabwriter::TabWriter;
use tracing::info;

use crate::model::ContestStatus;
use crate::sample;
use crate::sampler;
use crate::stage::{self, StageReport};
use crate::tables::{self, ElectionDir};
use crate::term;

#[derive(Parser, Debug)]
#[clap(version, about)]
pub struct Cli {
    #[clap(flatten)]
    pub verbose: clap_verbosity_flag::Verbosity,

    /// Size of the Monte-Carlo worker pool (defaults to all cores)
    #[clap(long, global = true)]
    pub threads: Option<usize>,

    #[clap(subcommand)]
    pub command: CliCommands,
}

#[derive(Subcommand, Debug)]
pub enum CliCommands {
    /// Load and check the election structure: contests and collections
    ReadStructure(CliDir),
    /// Load and check reported CVRs, manifests and reported outcomes
    ReadReported(CliDir),
    /// Load and validate the public audit seed
    ReadSeed(CliDir),
    /// Write the sampling order file for each collection
    MakeAuditOrders(CliDir),
    /// Load and validate the audited-vote transcripts uploaded so far
    ReadAudited(CliDir),
    /// Run one audit stage end-to-end (000 is setup)
    Stage(CliStage),
}

#[derive(Parser, Debug)]
pub struct CliDir {
    /// The election directory
    #[clap(parse(from_os_str), value_hint = ValueHint::DirPath)]
    pub dir: PathBuf,
}

#[derive(Parser, Debug)]
pub struct CliStage {
    /// The stage number, e.g. 003 (000 performs setup only)
    pub stage: String,

    /// The election directory
    #[clap(parse(from_os_str), value_hint = ValueHint::DirPath)]
    pub dir: PathBuf,
}

/// Does the top-level command.
pub fn actual(m: Cli) -> Result<()> {
    if let Some(n) = m.threads {
        rayon::ThreadPoolBuilder::new()
            .num_threads(n)
            .build_global()
            .context("could not size the worker pool")?;
    }
    use CliCommands::*;
    match m.command {
        ReadStructure(sm) => read_structure(&sm)?,
        ReadReported(sm) => read_reported(&sm)?,
        ReadSeed(sm) => read_seed(&sm)?,
        MakeAuditOrders(sm) => make_audit_orders(&sm)?,
        ReadAudited(sm) => read_audited(&sm)?,
        Stage(sm) => run_stage(&sm)?,
    }
    Ok(())
}

/// Performs the `read-structure` subcommand.
pub fn read_structure(args: &CliDir) -> Result<()> {
    let dir = ElectionDir::new(&args.dir);
    let mut inputs = Vec::new();
    let structure = tables::load_structure(&dir, &mut inputs)?;
    structure.check()?;

    let mut tw = TabWriter::new(std::io::stdout());
    writeln!(tw, "Contest\tWinners\tWrite-ins\tSelections\tCollections")?;
    for contest in structure.contests.values() {
        writeln!(
            tw,
            "{}\t{}\t{:?}\t{}\t{}",
            contest.cid,
            contest.winners,
            contest.writeins,
            contest.selections.len(),
            structure
                .rel(&contest.cid)
                .iter()
                .map(|p| p.as_str())
                .collect::<Vec<_>>()
                .join(" ")
        )?;
    }
    tw.flush()?;
    info!(
        "structure OK: {} ({} contests, {} collections)",
        structure.info.name,
        structure.contests.len(),
        structure.collections.len()
    );
    Ok(())
}

/// Performs the `read-reported` subcommand.
pub fn read_reported(args: &CliDir) -> Result<()> {
    let dir = ElectionDir::new(&args.dir);
    let mut inputs = Vec::new();
    let election = tables::load_reported(&dir, &mut inputs)?;
    election.structure.check()?;
    election.check_reported()?;

    let mut tw = TabWriter::new(std::io::stdout());
    writeln!(tw, "Collection\tType\tBallots\tContests")?;
    for collection in election.structure.collections.values() {
        writeln!(
            tw,
            "{}\t{:?}\t{}\t{}",
            collection.pbcid,
            collection.cvr_type,
            election.collection_size(&collection.pbcid)?,
            collection.contests.join(" ")
        )?;
    }
    tw.flush()?;
    info!("reported data OK ({} input files)", inputs.len());
    Ok(())
}

/// Performs the `read-seed` subcommand.
pub fn read_seed(args: &CliDir) -> Result<()> {
    let dir = ElectionDir::new(&args.dir);
    let mut inputs = Vec::new();
    let seed = tables::read_seed(&dir, &mut inputs)?;
    println!("audit seed OK: {} digits", seed.len());
    Ok(())
}

/// Performs the `make-audit-orders` subcommand.
pub fn make_audit_orders(args: &CliDir) -> Result<()> {
    let dir = ElectionDir::new(&args.dir);
    let mut inputs = Vec::new();
    let election = tables::load_reported(&dir, &mut inputs)?;
    election.structure.check()?;
    election.check_reported()?;
    let seed = tables::read_seed(&dir, &mut inputs)?;

    for collection in election.structure.collections.values() {
        let manifest = election.manifest(&collection.pbcid)?;
        let order = sampler::sampling_order(&seed, manifest);
        tables::write_audit_order(&dir, manifest, &order)
            .with_context(|| format!("writing audit order for {}", collection.pbcid))?;
        info!(
            "{}: sampling order written ({} ballots)",
            collection.pbcid,
            order.len()
        );
    }
    Ok(())
}

/// Performs the `read-audited` subcommand.
pub fn read_audited(args: &CliDir) -> Result<()> {
    let dir = ElectionDir::new(&args.dir);
    let mut inputs = Vec::new();
    let election = tables::load_reported(&dir, &mut inputs)?;
    election.structure.check()?;
    election.check_reported()?;
    let seed = tables::read_seed(&dir, &mut inputs)?;

    let mut orders = BTreeMap::new();
    let mut transcripts = BTreeMap::new();
    for collection in election.structure.collections.values() {
        let manifest = election.manifest(&collection.pbcid)?;
        orders.insert(
            collection.pbcid.clone(),
            sampler::sampling_order(&seed, manifest),
        );
        if let Some(rows) = tables::read_audited_votes(&dir, &collection.pbcid, &mut inputs)? {
            transcripts.insert(collection.pbcid.clone(), rows);
        }
    }
    let tally = sample::ingest(&election, &orders, &transcripts)?;

    let mut tw = TabWriter::new(std::io::stdout());
    writeln!(tw, "Collection\tAudited\tOf")?;
    for collection in election.structure.collections.values() {
        writeln!(
            tw,
            "{}\t{}\t{}",
            collection.pbcid,
            tally.audited_in(&collection.pbcid),
            election.collection_size(&collection.pbcid)?
        )?;
    }
    tw.flush()?;
    Ok(())
}

/// Performs the `stage` subcommand.
pub fn run_stage(args: &CliStage) -> Result<()> {
    let stage_index: u32 = args
        .stage
        .parse()
        .with_context(|| format!("stage must be a number, got {:?}", args.stage))?;
    let dir = ElectionDir::new(&args.dir);
    let report = stage::run_stage(&dir, stage_index)?;
    print_report(&report)?;
    Ok(())
}

fn print_report(report: &StageReport) -> Result<()> {
    let mut tw = TabWriter::new(std::io::stdout());
    writeln!(tw, "Contest\tMethod\tRisk\tLimit\tUpset\tStatus\tSample")?;
    for row in &report.outputs {
        let status = row.status_after.to_string();
        let status = match row.status_after {
            ContestStatus::Upset => term::decorate_if_tty(&status, term::BOLD),
            ContestStatus::Off => term::decorate_if_tty(&status, term::FAINT),
            _ => status,
        };
        writeln!(
            tw,
            "{}\t{}\t{}\t{}\t{}\t{}\t{}",
            row.cid,
            row.method,
            row.measured_risk
                .map(crate::emit::format_risk)
                .unwrap_or_else(|| "-".to_string()),
            row.risk_limit,
            row.upset_threshold,
            status,
            row.sample_total
        )?;
    }
    writeln!(tw)?;
    writeln!(tw, "Collection\tAudited\tNext\tEstimated total")?;
    for row in &report.plan {
        writeln!(
            tw,
            "{}\t{}\t{}\t{}",
            row.pbcid, row.audited_so_far, row.next_stage_increment, row.estimated_total_needed
        )?;
    }
    tw.flush()?;

    if report.done {
        println!("Audit complete after stage {}.", stage::stage_label(report.stage));
    } else {
        println!(
            "Stage {} complete; sampling continues.",
            stage::stage_label(report.stage)
        );
    }
    Ok(())
}
