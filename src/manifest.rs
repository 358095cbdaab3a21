//! Ballot manifests: the enumeration of the physical ballots in a
//! collection, with box / position / stamp locators.
//!
//! A manifest row may compactly describe a contiguous batch: with
//! `number_of_ballots = n` the row stands for `n` ballots whose position,
//! stamp and bid auto-increment from the row's values. Incrementing a
//! string bumps its trailing digit run, preserving leading zeros
//! (`B-0001` → `B-0002`, `XY-9` → `XY-10`); a value with no trailing
//! digits gets `1` appended.

use std::collections::{BTreeMap, HashSet};

use once_cell::sync::Lazy;
use regex::Regex;

use crate::errors::AuditError;

/// Splits a locator into its stem and trailing digit run (either may be empty).
static TRAILING_DIGITS: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(.*?)([0-9]*)$").unwrap());

/// Bump the trailing digit run of a locator string.
pub fn increment_locator(s: &str) -> String {
    let caps = TRAILING_DIGITS.captures(s).expect("regex matches any string");
    let stem = caps.get(1).map_or("", |m| m.as_str());
    let digits = caps.get(2).map_or("", |m| m.as_str());
    if digits.is_empty() {
        return format!("{s}1");
    }
    // Decimal increment with carry over the raw digit bytes, so widths
    // like B-0001 survive and arbitrary lengths can't overflow.
    let mut out: Vec<u8> = digits.as_bytes().to_vec();
    for d in out.iter_mut().rev() {
        if *d == b'9' {
            *d = b'0';
        } else {
            *d += 1;
            return format!("{stem}{}", String::from_utf8_lossy(&out));
        }
    }
    out.insert(0, b'1');
    format!("{stem}{}", String::from_utf8_lossy(&out))
}

/// One physical ballot's locator line, post-expansion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    pub box_id: String,
    /// 1-based dense position within the box.
    pub position: u32,
    /// Optional stamp, unique within the box when present.
    pub stamp: String,
    pub bid: String,
    pub comments: String,
}

/// A compact manifest row as it appears in `manifest-<pbcid>.csv`.
#[derive(Debug, Clone, Deserialize)]
pub struct ManifestRow {
    pub pbcid: String,
    #[serde(rename = "box")]
    pub box_id: String,
    pub position: u32,
    pub stamp: String,
    pub bid: String,
    pub number_of_ballots: u32,
    #[serde(default)]
    pub comments: String,
}

/// The expanded manifest of one collection.
#[derive(Debug, Clone)]
pub struct Manifest {
    pub pbcid: String,
    pub entries: Vec<ManifestEntry>,
    /// bid → index into `entries`; collections run to the hundreds of
    /// thousands of ballots, so membership must not be a scan.
    index: BTreeMap<String, usize>,
}

impl Manifest {
    /// Expand compact rows into one entry per ballot and validate the
    /// arithmetic: the expansion must yield exactly `Σ number_of_ballots`
    /// distinct bids, stamps must not repeat within a box, and each box's
    /// positions must be dense from 1.
    pub fn expand(pbcid: &str, rows: &[ManifestRow]) -> Result<Manifest, AuditError> {
        let mut entries: Vec<ManifestEntry> = Vec::new();
        let mut declared: usize = 0;

        for row in rows {
            if row.number_of_ballots == 0 {
                return Err(AuditError::consistency(format!(
                    "manifest for {pbcid}: bid {} declares zero ballots",
                    row.bid
                )));
            }
            declared += row.number_of_ballots as usize;
            let mut position = row.position;
            let mut stamp = row.stamp.clone();
            let mut bid = row.bid.clone();
            for i in 0..row.number_of_ballots {
                if i > 0 {
                    position += 1;
                    if !stamp.is_empty() {
                        stamp = increment_locator(&stamp);
                    }
                    bid = increment_locator(&bid);
                }
                entries.push(ManifestEntry {
                    box_id: row.box_id.clone(),
                    position,
                    stamp: stamp.clone(),
                    bid: bid.clone(),
                    comments: row.comments.clone(),
                });
            }
        }

        let index: BTreeMap<String, usize> = entries
            .iter()
            .enumerate()
            .map(|(i, e)| (e.bid.clone(), i))
            .collect();
        if index.len() != declared {
            return Err(AuditError::ManifestArithmetic {
                pbcid: pbcid.to_string(),
                declared,
                found: index.len(),
            });
        }

        let manifest = Manifest {
            pbcid: pbcid.to_string(),
            entries,
            index,
        };
        manifest.check_boxes()?;
        Ok(manifest)
    }

    /// Per-box invariants: dense 1-based positions, unique stamps.
    fn check_boxes(&self) -> Result<(), AuditError> {
        let mut boxes: BTreeMap<&str, Vec<&ManifestEntry>> = BTreeMap::new();
        for e in &self.entries {
            boxes.entry(e.box_id.as_str()).or_default().push(e);
        }
        for (box_id, entries) in boxes {
            let mut positions: Vec<u32> = entries.iter().map(|e| e.position).collect();
            positions.sort_unstable();
            if positions
                .iter()
                .enumerate()
                .any(|(i, p)| *p != (i + 1) as u32)
            {
                return Err(AuditError::consistency(format!(
                    "manifest for {}: box {box_id} positions are not dense from 1",
                    self.pbcid
                )));
            }
            let mut stamps: HashSet<&str> = HashSet::new();
            for e in entries {
                if !e.stamp.is_empty() && !stamps.insert(e.stamp.as_str()) {
                    return Err(AuditError::consistency(format!(
                        "manifest for {}: box {box_id} repeats stamp {}",
                        self.pbcid, e.stamp
                    )));
                }
            }
        }
        Ok(())
    }

    /// `N(pbcid)`: the number of ballots in the collection.
    pub fn size(&self) -> usize {
        self.entries.len()
    }

    pub fn contains_bid(&self, bid: &str) -> bool {
        self.index.contains_key(bid)
    }

    /// The entry for a bid, if the manifest lists it.
    pub fn entry_for(&self, bid: &str) -> Option<&ManifestEntry> {
        self.index.get(bid).map(|&i| &self.entries[i])
    }
}
