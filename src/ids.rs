//! Identifier reduction and vote canonicalisation.
//!
//! Contest, collection, ballot and selection identifiers are arbitrary
//! strings supplied by election officials; we store them in a *reduced*
//! form so that stray whitespace in a spreadsheet cannot split a tally.
//! Votes are finite sets of selection ids, held as sorted tuples so that
//! value equality and hashing behave.

use itertools::Itertools;

/// Selection ids beginning with this mark a write-in.
pub const WRITEIN_MARK: char = '+';
/// Selection ids beginning with this mark a special non-choice outcome.
pub const SPECIAL_MARK: char = '-';

/// The standard special outcomes an audited interpretation may produce.
pub const SEL_INVALID: &str = "-Invalid";
pub const SEL_OVERVOTE: &str = "-Overvote";
pub const SEL_UNDERVOTE: &str = "-Undervote";
pub const SEL_NO_RECORD: &str = "-NoRecord";

/// The pooled category that arbitrary (unlisted) write-ins tally into.
pub const SEL_WRITEIN_POOL: &str = "+Writein";

/// Reduce an identifier: strip leading/trailing whitespace and collapse
/// each internal whitespace run to a single space.
///
/// Idempotent: `reduce(reduce(x)) == reduce(x)`.
pub fn reduce(id: &str) -> String {
    id.split_whitespace().join(" ")
}

/// Reduce an identifier for use as a filename component: everything
/// outside `[A-Za-z0-9+-_.]` (spaces included) is removed.
///
/// Idempotent, like [`reduce`].
pub fn file_safe(id: &str) -> String {
    reduce(id)
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '_' | '.'))
        .collect()
}

/// Is this selection id a write-in?
pub fn is_writein(selid: &str) -> bool {
    selid.starts_with(WRITEIN_MARK)
}

/// Is this selection id a special non-choice outcome?
pub fn is_special(selid: &str) -> bool {
    selid.starts_with(SPECIAL_MARK)
}

/// A voter's expressed choice in one contest.
///
/// Plurality-family methods see a *set* of selections, canonicalised to a
/// sorted, deduplicated tuple (the empty tuple is an undervote). The
/// `Ranked` arm preserves order for preferential methods; nothing in the
/// current engine produces one, but the representations must stay distinct
/// because a ranked vote is not value-equal to the set of its entries.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Vote {
    /// An unordered selection set, stored sorted.
    Set(Vec<String>),
    /// An ordered preference list (reserved).
    Ranked(Vec<String>),
}

impl Vote {
    /// Canonicalise a selection set: each entry reduced, sorted, deduped.
    pub fn set<I, S>(selections: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let sels: Vec<String> = selections
            .into_iter()
            .map(|s| reduce(s.as_ref()))
            .filter(|s| !s.is_empty())
            .sorted()
            .dedup()
            .collect();
        Vote::Set(sels)
    }

    /// The empty selection set.
    pub fn undervote() -> Self {
        Vote::Set(Vec::new())
    }

    /// A one-selection set (the common case for plurality).
    pub fn single(selid: &str) -> Self {
        Vote::set([selid])
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Vote::Set(v) | Vote::Ranked(v) => v.is_empty(),
        }
    }

    /// The selections, in canonical order for `Set`, voter order for `Ranked`.
    pub fn selections(&self) -> &[String] {
        match self {
            Vote::Set(v) | Vote::Ranked(v) => v,
        }
    }

    /// Render for a CSV row: one field per selection.
    pub fn to_fields(&self) -> Vec<String> {
        self.selections().to_vec()
    }
}

impl std::fmt::Display for Vote {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Vote::Set(v) => write!(f, "{{{}}}", v.join(", ")),
            Vote::Ranked(v) => write!(f, "[{}]", v.join(" > ")),
        }
    }
}

/// Parse the selection fields of a CSV row into a canonical [`Vote`].
///
/// Fields are trimmed; fully blank *trailing* fields (spreadsheet ragged
/// edges) are discarded; the rest are reduced and sorted. A blank field in
/// the middle of real selections is discarded too — `Vote::set` drops
/// empties — so `["", "Alice"]` and `["Alice", ""]` agree.
pub fn parse_vote<'a, I>(fields: I) -> Vote
where
    I: IntoIterator<Item = &'a str>,
{
    Vote::set(fields.into_iter().map(str::trim))
}

/// How a vote relates to its contest's rules. Computed by
/// [`crate::model::Contest::classify`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteClass {
    /// A single declared (or pre-qualified write-in) selection.
    Valid,
    /// The empty set.
    Undervote,
    /// More selections than the contest permits.
    Overvote,
    /// A write-in that the contest's write-in policy does not admit.
    InvalidWritein,
    /// A special `-…` outcome recorded by the auditor or scanner.
    Special,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reduce_collapses_and_is_idempotent() {
        assert_eq!(reduce("  Denton   County\tCVR "), "Denton County CVR");
        for x in ["", "  ", "a  b", " a b c ", "plain"] {
            assert_eq!(reduce(&reduce(x)), reduce(x));
        }
    }

    #[test]
    fn file_safe_strips_and_is_idempotent() {
        assert_eq!(file_safe("PBC 1 (north)"), "PBC1north");
        assert_eq!(file_safe("DEN/A-1_2.x"), "DENA-1_2.x");
        for x in ["PBC 1", "a/b\\c", "+WriteIn Bob", "--ok--"] {
            assert_eq!(file_safe(&file_safe(x)), file_safe(x));
        }
    }

    #[test]
    fn vote_canonical_under_permutation_and_whitespace() {
        let a = parse_vote(vec!["Bob ", " Alice"]);
        let b = parse_vote(vec!["Alice", "Bob"]);
        assert_eq!(a, b);
        assert_eq!(a, Vote::set(["Bob", "Alice", "Bob"]));
    }

    #[test]
    fn blank_trailing_fields_are_dropped() {
        assert_eq!(parse_vote(vec!["Alice", "", "  "]), Vote::single("Alice"));
        assert_eq!(parse_vote(vec!["", ""]), Vote::undervote());
    }

    #[test]
    fn csv_row_round_trip_preserves_the_tuple() {
        for vote in [
            Vote::undervote(),
            Vote::single("Alice"),
            Vote::set(["Bob", "Alice", "+Carol"]),
        ] {
            let fields = vote.to_fields();
            let back = parse_vote(fields.iter().map(String::as_str));
            assert_eq!(back, vote);
        }
    }

    #[test]
    fn set_and_ranked_are_distinct() {
        let set = Vote::set(["A", "B"]);
        let ranked = Vote::Ranked(vec!["A".into(), "B".into()]);
        assert_ne!(set, ranked);
    }

    #[test]
    fn marks() {
        assert!(is_writein("+Lizardman"));
        assert!(is_special(SEL_UNDERVOTE));
        assert!(!is_special("Alice"));
    }
}
