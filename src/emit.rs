//! Stage artifact emission: the content snapshot, the per-contest output
//! table, the next-stage plan, and the carried-forward contest
//! parameters.
//!
//! Everything a stage writes lands under its own `stage-<NNN>/` directory
//! (plus one new version of the contest-parameter table beside the other
//! versions), so earlier stages are never touched and the whole audit
//! trail stays replayable.

use std::collections::BTreeMap;

use color_eyre::eyre::{Context, Result};
use indexmap::IndexMap;

use crate::model::{Cid, Contest, ContestParams, ContestStatus, RiskMethod};
use crate::tables::{write_csv, ElectionDir};

/// One row of `30-audit-output-<NNN>.csv`.
#[derive(Debug, Clone)]
pub struct OutputRow {
    pub cid: Cid,
    pub method: RiskMethod,
    /// Empty for contests not measured this stage (terminal or off).
    pub measured_risk: Option<f64>,
    pub risk_limit: f64,
    pub upset_threshold: f64,
    pub status_after: ContestStatus,
    pub sample_total: usize,
}

/// One row of `40-audit-plan-<NNN>.csv`.
#[derive(Debug, Clone)]
pub struct PlanRow {
    pub pbcid: String,
    pub audited_so_far: usize,
    pub next_stage_increment: usize,
    pub estimated_total_needed: usize,
}

/// The three stage artifacts, ready to serialise.
#[derive(Debug)]
pub struct StageOutputs {
    pub stage_label: String,
    /// `(relative path, sha256)` of every input considered, sorted.
    pub snapshot: Vec<(String, String)>,
    pub outputs: Vec<OutputRow>,
    pub plan: Vec<PlanRow>,
}

/// Risks are written with seven decimals: at least five significant
/// digits for any `failures / n_trials` the estimator can produce.
pub fn format_risk(risk: f64) -> String {
    format!("{risk:.7}")
}

/// Write the snapshot, output and plan files for a stage.
pub fn write_stage(dir: &ElectionDir, out: &StageOutputs) -> Result<()> {
    let stage_dir = dir.stage_dir(&out.stage_label);

    let snapshot_rows: Vec<Vec<String>> = out
        .snapshot
        .iter()
        .map(|(path, digest)| vec![path.clone(), digest.clone()])
        .collect();
    write_csv(
        &stage_dir.join(format!("20-audit-snapshot-{}.csv", out.stage_label)),
        &["path", "sha256"],
        &snapshot_rows,
    )
    .context("writing audit snapshot")?;

    let output_rows: Vec<Vec<String>> = out
        .outputs
        .iter()
        .map(|r| {
            vec![
                r.cid.clone(),
                r.method.to_string(),
                r.measured_risk.map(format_risk).unwrap_or_default(),
                r.risk_limit.to_string(),
                r.upset_threshold.to_string(),
                r.status_after.to_string(),
                r.sample_total.to_string(),
            ]
        })
        .collect();
    write_csv(
        &stage_dir.join(format!("30-audit-output-{}.csv", out.stage_label)),
        &[
            "cid",
            "method",
            "measured_risk",
            "risk_limit",
            "upset_threshold",
            "status_after",
            "sample_total",
        ],
        &output_rows,
    )
    .context("writing audit output")?;

    let plan_rows: Vec<Vec<String>> = out
        .plan
        .iter()
        .map(|r| {
            vec![
                r.pbcid.clone(),
                r.audited_so_far.to_string(),
                r.next_stage_increment.to_string(),
                r.estimated_total_needed.to_string(),
            ]
        })
        .collect();
    write_csv(
        &stage_dir.join(format!("40-audit-plan-{}.csv", out.stage_label)),
        &[
            "pbcid",
            "audited_so_far",
            "next_stage_increment",
            "estimated_total_needed",
        ],
        &plan_rows,
    )
    .context("writing audit plan")
}

/// Carry the contest-parameter table forward with this stage's statuses,
/// as a new version labelled by the stage — the next stage's operative
/// parameters.
pub fn write_contest_params(
    dir: &ElectionDir,
    stage_label: &str,
    contests: &IndexMap<Cid, Contest>,
    params: &BTreeMap<Cid, ContestParams>,
) -> Result<()> {
    let rows: Vec<Vec<String>> = contests
        .keys()
        .filter_map(|cid| params.get(cid))
        .map(|p| {
            vec![
                p.cid.clone(),
                p.method.to_string(),
                p.risk_limit.to_string(),
                p.upset_threshold.to_string(),
                p.sampling_mode.to_string(),
                p.status.to_string(),
                format!("pseudocount={}", p.pseudocount),
            ]
        })
        .collect();
    write_csv(
        &dir.audit_dir()
            .join(format!("11-audit-parameters-contest-{stage_label}.csv")),
        &[
            "cid",
            "method",
            "risk_limit",
            "upset_threshold",
            "sampling_mode",
            "status",
            "param_1",
        ],
        &rows,
    )
    .context("carrying contest parameters forward")
}

/// The previous stage's measured risks, for the advisory extrapolation.
/// `None` when that stage left no output (or never ran).
pub fn read_prev_risks(
    dir: &ElectionDir,
    prev_label: &str,
) -> Result<Option<BTreeMap<Cid, f64>>> {
    let path = dir
        .stage_dir(prev_label)
        .join(format!("30-audit-output-{prev_label}.csv"));
    if !path.is_file() {
        return Ok(None);
    }
    let mut risks = BTreeMap::new();
    let mut rdr = csv::ReaderBuilder::new()
        .flexible(true)
        .from_path(&path)
        .with_context(|| format!("could not open {}", path.display()))?;
    for record in rdr.records() {
        let row = record.with_context(|| path.display().to_string())?;
        let cid = row.get(0).unwrap_or("").to_string();
        if let Some(risk) = row.get(2).and_then(|s| s.parse::<f64>().ok()) {
            risks.insert(cid, risk);
        }
    }
    Ok(Some(risks))
}

/// Advisory estimate of the total sample a collection will need.
///
/// Geometric extrapolation on the driving contest's risk across the last
/// two stages: if the risk shrank by ratio `ρ`, about
/// `log(limit / risk) / log(ρ)` further stages reach the limit. Floored
/// at one more stage's rate, capped at the collection size. With no
/// history, or a risk that is not shrinking, one further stage's worth is
/// all that can honestly be claimed.
pub fn estimate_total_needed(
    audited: usize,
    rate: usize,
    collection_size: usize,
    risk: Option<f64>,
    prev_risk: Option<f64>,
    risk_limit: f64,
) -> usize {
    let one_more = (audited + rate).min(collection_size);
    let (risk, prev) = match (risk, prev_risk) {
        (Some(r), Some(p)) => (r, p),
        _ => return one_more,
    };
    if risk <= risk_limit {
        return audited.min(collection_size);
    }
    if risk <= 0.0 || prev <= risk || risk_limit <= 0.0 {
        return one_more;
    }
    let ratio = risk / prev;
    let stages = ((risk_limit / risk).ln() / ratio.ln()).ceil();
    if !stages.is_finite() || stages < 1.0 {
        return one_more;
    }
    // Extrapolations past a few hundred stages are noise; the cap below
    // renders them as "the whole collection" anyway.
    let stages = stages.min(1e6) as usize;
    (audited + stages * rate).min(collection_size).max(one_more)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn risk_formatting_keeps_significant_digits() {
        assert_eq!(format_risk(0.0), "0.0000000");
        assert_eq!(format_risk(0.00043), "0.0004300");
        assert_eq!(format_risk(1.0), "1.0000000");
    }

    #[test]
    fn extrapolation_shrinks_toward_the_limit() {
        // Risk fell 0.8 → 0.4; at that ratio 0.06 is under three more
        // halvings away (0.4 → 0.2 → 0.1 → 0.05).
        let est = estimate_total_needed(80, 40, 10_000, Some(0.4), Some(0.8), 0.06);
        assert_eq!(est, 80 + 3 * 40);
    }

    #[test]
    fn extrapolation_degenerate_cases() {
        // No history: one more stage's worth.
        assert_eq!(estimate_total_needed(40, 40, 10_000, Some(0.4), None, 0.05), 80);
        // Growing risk: same.
        assert_eq!(
            estimate_total_needed(40, 40, 10_000, Some(0.5), Some(0.4), 0.05),
            80
        );
        // Already under the limit: what is audited suffices.
        assert_eq!(
            estimate_total_needed(40, 40, 10_000, Some(0.01), Some(0.4), 0.05),
            40
        );
        // Caps at the collection size.
        assert_eq!(
            estimate_total_needed(90, 40, 100, Some(0.9), Some(0.91), 0.05),
            100
        );
    }
}
