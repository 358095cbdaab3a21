//! End-to-end audit scenarios over scratch election directories.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use bayaudit::errors::AuditError;
use bayaudit::model::ContestStatus;
use bayaudit::stage::run_stage;
use bayaudit::tables::ElectionDir;

const SEED: &str = "13456201235197891138";

/// One contest `C` over selections {0, 1} in a single collection `J`.
struct Scenario {
    collection_size: usize,
    reported_ones: usize,
    winner: &'static str,
    cvr: bool,
    n_trials: u64,
    audit_rate: u32,
}

fn write_file(path: PathBuf, content: String) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
}

fn build_election(root: &Path, s: &Scenario) {
    write_file(
        root.join("10-structure/11-election.csv"),
        "attribute,value\n\
         Election name,Example Election\n\
         Election dirname,ex1\n\
         Election date,2017-11-07\n\
         Election URL,https://example.org/ex1\n"
            .to_string(),
    );
    write_file(
        root.join("10-structure/12-contests.csv"),
        "cid,type,winners,writeins,selection_1,selection_2\nC,plurality,1,No,0,1\n".to_string(),
    );
    let cvr_type = if s.cvr { "CVR" } else { "noCVR" };
    write_file(
        root.join("10-structure/13-collections.csv"),
        format!("pbcid,manager,cvr_type,cid_1\nJ,Anona County,{cvr_type},C\n"),
    );
    write_file(
        root.join("20-reported/manifest-J.csv"),
        format!(
            "pbcid,box,position,stamp,bid,number_of_ballots,comments\nJ,B1,1,,B-000001,{},\n",
            s.collection_size
        ),
    );
    let mut cvrs = String::from(if s.cvr {
        "pbcid,scanner,bid,cid,sel_1\n"
    } else {
        "pbcid,scanner,tally,cid,sel_1\n"
    });
    if s.cvr {
        for i in 1..=s.collection_size {
            let sel = if i <= s.reported_ones { "1" } else { "0" };
            cvrs.push_str(&format!("J,scanner-1,B-{i:06},C,{sel}\n"));
        }
    } else {
        cvrs.push_str(&format!("J,scanner-1,{},C,1\n", s.reported_ones));
        cvrs.push_str(&format!(
            "J,scanner-1,{},C,0\n",
            s.collection_size - s.reported_ones
        ));
    }
    write_file(root.join("20-reported/reported-cvrs-J.csv"), cvrs);
    write_file(
        root.join("20-reported/23-reported-outcomes.csv"),
        format!("cid,winner_1\nC,{}\n", s.winner),
    );
    write_file(
        root.join("30-audit/311-audit-seed.csv"),
        format!("seed\n{SEED}\n"),
    );
    write_file(
        root.join("30-audit/10-audit-parameters-global.csv"),
        format!("max_audit_stages,n_trials\n20,{}\n", s.n_trials),
    );
    write_file(
        root.join("30-audit/11-audit-parameters-contest.csv"),
        "cid,method,risk_limit,upset_threshold,sampling_mode,status,param_1\n\
         C,Bayes,0.05,0.99,Active,Open,pseudocount=1\n"
            .to_string(),
    );
    write_file(
        root.join("30-audit/12-audit-parameters-collection.csv"),
        format!("pbcid,max_audit_rate\nJ,{}\n", s.audit_rate),
    );
}

/// The bids of `audit-order-J.csv`, in sampling order.
fn order_bids(root: &Path) -> Vec<String> {
    let mut rdr = csv::Reader::from_path(root.join("30-audit/audit-order-J.csv")).unwrap();
    rdr.records()
        .map(|r| r.unwrap().get(5).unwrap().to_string())
        .collect()
}

/// The ground-truth selection of a ballot: the first `ones` bids of the
/// batch vote 1, the rest 0.
fn true_sel(bid: &str, ones: usize) -> &'static str {
    let n: usize = bid.trim_start_matches("B-").parse().unwrap();
    if n <= ones {
        "1"
    } else {
        "0"
    }
}

/// Upload a cumulative transcript for the first `bids` of the order.
fn write_audited(root: &Path, version_label: &str, bids: &[String], ones: usize) {
    let mut s = String::from("pbcid,bid,cid,sel_1\n");
    for bid in bids {
        s.push_str(&format!("J,{bid},C,{}\n", true_sel(bid, ones)));
    }
    write_file(
        root.join(format!("30-audit/audited-votes-J{version_label}.csv")),
        s,
    );
}

#[test]
fn s1_unanimous_landslide_passes_at_stage_one() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path();
    build_election(
        root,
        &Scenario {
            collection_size: 10_000,
            reported_ones: 9_000,
            winner: "1",
            cvr: true,
            n_trials: 2_000,
            audit_rate: 40,
        },
    );
    let dir = ElectionDir::new(root);

    let setup = run_stage(&dir, 0).unwrap();
    assert!(!setup.done);
    assert_eq!(setup.plan[0].audited_so_far, 0);
    assert_eq!(setup.plan[0].next_stage_increment, 40);
    assert!(root.join("30-audit/stage-000/40-audit-plan-000.csv").is_file());

    // The order is a permutation of the manifest.
    let bids = order_bids(root);
    assert_eq!(bids.len(), 10_000);
    assert_eq!(bids.iter().collect::<HashSet<_>>().len(), 10_000);

    write_audited(root, "", &bids[..40], 9_000);
    let report = run_stage(&dir, 1).unwrap();
    let c = &report.outputs[0];
    let risk = c.measured_risk.unwrap();
    assert!((0.0..=1.0).contains(&risk));
    assert!(risk < 0.05, "landslide risk {risk}");
    assert_eq!(c.status_after, ContestStatus::Passed);
    assert_eq!(c.sample_total, 40);
    assert!(report.done);
    assert_eq!(report.plan[0].next_stage_increment, 0);

    // The carried-forward parameters record the pass for later stages.
    let params = fs::read_to_string(root.join("30-audit/11-audit-parameters-contest-001.csv")).unwrap();
    assert!(params.contains("Passed"));
}

#[test]
fn s2_wrong_reported_outcome_upsets() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path();
    build_election(
        root,
        &Scenario {
            collection_size: 10_000,
            reported_ones: 9_000,
            winner: "0", // contradicted by both CVRs and hand interpretations
            cvr: true,
            n_trials: 2_000,
            audit_rate: 40,
        },
    );
    let dir = ElectionDir::new(root);
    run_stage(&dir, 0).unwrap();
    let bids = order_bids(root);
    write_audited(root, "", &bids[..40], 9_000);

    let report = run_stage(&dir, 1).unwrap();
    let c = &report.outputs[0];
    assert!(c.measured_risk.unwrap() >= 0.99);
    assert_eq!(c.status_after, ContestStatus::Upset);
    assert!(report.done, "an upset contest stops sampling");
    assert_eq!(report.plan[0].next_stage_increment, 0);
}

#[test]
fn s4_nocvr_draws_from_reported_tallies() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path();
    build_election(
        root,
        &Scenario {
            collection_size: 10_000,
            reported_ones: 9_000,
            winner: "1",
            cvr: false,
            n_trials: 1_000,
            audit_rate: 40,
        },
    );
    let dir = ElectionDir::new(root);
    run_stage(&dir, 0).unwrap();
    let bids = order_bids(root);
    write_audited(root, "", &bids[..40], 9_000);

    let report = run_stage(&dir, 1).unwrap();
    let c = &report.outputs[0];
    assert!(c.measured_risk.unwrap() < 0.05);
    assert_eq!(c.status_after, ContestStatus::Passed);
}

#[test]
fn s5_newest_transcript_version_wins() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path();
    build_election(
        root,
        &Scenario {
            collection_size: 1_000,
            reported_ones: 900,
            winner: "1",
            cvr: true,
            n_trials: 500,
            audit_rate: 40,
        },
    );
    let dir = ElectionDir::new(root);
    run_stage(&dir, 0).unwrap();
    let bids = order_bids(root);

    write_audited(root, "-2017-11-21", &bids[..40], 900);
    run_stage(&dir, 1).unwrap();

    // A newer cumulative upload supersedes the older one, which stays
    // behind as archive.
    write_audited(root, "-2017-11-22", &bids[..80], 900);
    let report = run_stage(&dir, 2).unwrap();
    assert_eq!(report.plan[0].audited_so_far, 80);

    let snapshot =
        fs::read_to_string(root.join("30-audit/stage-002/20-audit-snapshot-002.csv")).unwrap();
    assert!(snapshot.contains("audited-votes-J-2017-11-22.csv"));
    assert!(!snapshot.contains("audited-votes-J-2017-11-21.csv"));
}

#[test]
fn s6_skipped_order_entry_is_rejected() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path();
    build_election(
        root,
        &Scenario {
            collection_size: 1_000,
            reported_ones: 900,
            winner: "1",
            cvr: true,
            n_trials: 500,
            audit_rate: 40,
        },
    );
    let dir = ElectionDir::new(root);
    run_stage(&dir, 0).unwrap();
    let bids = order_bids(root);

    // Positions 2 and 3 audited, position 1 skipped.
    write_audited(root, "", &bids[1..3], 900);
    let err = run_stage(&dir, 1).unwrap_err();
    match err.downcast_ref::<AuditError>() {
        Some(AuditError::OutOfOrderSample {
            pbcid,
            missing_bid,
            position,
        }) => {
            assert_eq!(pbcid, "J");
            assert_eq!(missing_bid, &bids[0]);
            assert_eq!(*position, 1);
        }
        other => panic!("expected OutOfOrderSample, got {other:?}"),
    }
}

#[test]
fn s3_opportunistic_contest_upsets_while_active_passes() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path();

    // Two contests on one collection: C is active and correctly
    // reported; F is opportunistic and its reported outcome is wrong.
    write_file(
        root.join("10-structure/11-election.csv"),
        "attribute,value\n\
         Election name,Example Election\n\
         Election dirname,ex3\n\
         Election date,2017-11-07\n\
         Election URL,https://example.org/ex3\n"
            .to_string(),
    );
    write_file(
        root.join("10-structure/12-contests.csv"),
        "cid,type,winners,writeins,selection_1,selection_2\n\
         C,plurality,1,No,0,1\n\
         F,plurality,1,No,0,1\n"
            .to_string(),
    );
    write_file(
        root.join("10-structure/13-collections.csv"),
        "pbcid,manager,cvr_type,cid_1,cid_2\nJ,Anona County,CVR,C,F\n".to_string(),
    );
    write_file(
        root.join("20-reported/manifest-J.csv"),
        "pbcid,box,position,stamp,bid,number_of_ballots,comments\nJ,B1,1,,B-000001,1000,\n"
            .to_string(),
    );
    let mut cvrs = String::from("pbcid,scanner,bid,cid,sel_1\n");
    for i in 1..=1000 {
        let sel = if i <= 900 { "1" } else { "0" };
        cvrs.push_str(&format!("J,scanner-1,B-{i:06},C,{sel}\n"));
        cvrs.push_str(&format!("J,scanner-1,B-{i:06},F,{sel}\n"));
    }
    write_file(root.join("20-reported/reported-cvrs-J.csv"), cvrs);
    write_file(
        root.join("20-reported/23-reported-outcomes.csv"),
        "cid,winner_1\nC,1\nF,0\n".to_string(),
    );
    write_file(
        root.join("30-audit/311-audit-seed.csv"),
        format!("seed\n{SEED}\n"),
    );
    write_file(
        root.join("30-audit/10-audit-parameters-global.csv"),
        "max_audit_stages,n_trials\n20,800\n".to_string(),
    );
    write_file(
        root.join("30-audit/11-audit-parameters-contest.csv"),
        "cid,method,risk_limit,upset_threshold,sampling_mode,status,param_1\n\
         C,Bayes,0.05,0.99,Active,Open,pseudocount=1\n\
         F,Bayes,0.10,0.99,Opportunistic,Open,pseudocount=1\n"
            .to_string(),
    );
    write_file(
        root.join("30-audit/12-audit-parameters-collection.csv"),
        "pbcid,max_audit_rate\nJ,40\n".to_string(),
    );

    let dir = ElectionDir::new(root);
    run_stage(&dir, 0).unwrap();
    let bids = order_bids(root);
    let mut transcript = String::from("pbcid,bid,cid,sel_1\n");
    for bid in &bids[..40] {
        let sel = true_sel(bid, 900);
        transcript.push_str(&format!("J,{bid},C,{sel}\n"));
        transcript.push_str(&format!("J,{bid},F,{sel}\n"));
    }
    write_file(root.join("30-audit/audited-votes-J.csv"), transcript);

    let report = run_stage(&dir, 1).unwrap();
    let by_cid: std::collections::BTreeMap<_, _> = report
        .outputs
        .iter()
        .map(|r| (r.cid.as_str(), r.status_after))
        .collect();
    assert_eq!(by_cid["C"], ContestStatus::Passed);
    assert_eq!(by_cid["F"], ContestStatus::Upset);
    assert!(report.done);
}

#[test]
fn determinism_across_independent_runs() {
    let scenario = Scenario {
        collection_size: 1_000,
        reported_ones: 900,
        winner: "1",
        cvr: true,
        n_trials: 500,
        audit_rate: 40,
    };
    let outputs: Vec<Vec<Vec<u8>>> = (0..2)
        .map(|_| {
            let tmp = tempfile::tempdir().unwrap();
            let root = tmp.path();
            build_election(root, &scenario);
            let dir = ElectionDir::new(root);
            run_stage(&dir, 0).unwrap();
            let bids = order_bids(root);
            write_audited(root, "", &bids[..40], 900);
            run_stage(&dir, 1).unwrap();
            [
                "30-audit/audit-order-J.csv",
                "30-audit/stage-000/20-audit-snapshot-000.csv",
                "30-audit/stage-000/40-audit-plan-000.csv",
                "30-audit/stage-001/20-audit-snapshot-001.csv",
                "30-audit/stage-001/30-audit-output-001.csv",
                "30-audit/stage-001/40-audit-plan-001.csv",
                "30-audit/11-audit-parameters-contest-001.csv",
            ]
            .iter()
            .map(|rel| fs::read(root.join(rel)).unwrap())
            .collect()
        })
        .collect();
    assert_eq!(outputs[0], outputs[1], "stage outputs must be byte-identical");
}
