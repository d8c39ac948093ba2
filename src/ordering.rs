//! Total orders over grouping keys (chromosome names)
//!
//! Two orders are supported:
//!
//! * **Lexicographic**: plain byte order of the grouping key.
//! * **Natural**: keys are read as `[chr]?[digits]?[suffix]?`. Autosomes 1..=22
//!   come first in numeric order, then `M`/`MT`, `X`, `Y`, then any other
//!   numeric token, then everything else in a hash-derived but reproducible
//!   order. Keys carrying the case-insensitive `chr` marker sort after all keys
//!   without it. The empty key and a bare `chr` sort last.
//!
//! Whatever the order, two different keys never compare equal: ties on rank are
//! broken by the exact key bytes, and equal keys by position. The sorters add
//! the whole line as the final tie-break.

use crate::error::SortError;
use crate::record::RecordKey;
use std::borrow::Cow;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::str::FromStr;
use xxhash_rust::xxh3::xxh3_64;

/// Case-insensitive prefix that moves a key into the "marked" half of the
/// natural order.
pub const MARKER: &[u8] = b"chr";

const RANK_MT: u32 = 23;
const RANK_X: u32 = 24;
const RANK_Y: u32 = 25;
const RANK_OTHER_NUMERIC: u32 = 26;
const RANK_HASHED: u32 = 27;

/// Ordering policy, selected at runtime and passed explicitly to every sorter
/// and merger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChromOrder {
    /// Byte-wise order of the grouping key
    #[default]
    Lexicographic,
    /// Token-aware order with fixed ranks for the sex and mitochondrial contigs
    Natural,
}

/// Precomputed natural-order rank of one grouping key.
///
/// Field order is significant: the derived `Ord` compares the marker first, then
/// the class, then the numeric value, then the suffix tie-break.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NaturalRank {
    marker: bool,
    class: u32,
    number: u64,
    suffix: u64,
}

impl NaturalRank {
    /// Rank given to keys that have nothing to rank on.
    pub const LAST: NaturalRank = NaturalRank {
        marker: true,
        class: u32::MAX,
        number: u64::MAX,
        suffix: u64::MAX,
    };

    /// Compute the rank of a grouping key.
    pub fn of(key: &[u8]) -> Self {
        if key.is_empty() {
            return Self::LAST;
        }

        let (marker, rest) = match key.get(..MARKER.len()) {
            Some(prefix) if prefix.eq_ignore_ascii_case(MARKER) => (true, &key[MARKER.len()..]),
            _ => (false, key),
        };
        if rest.is_empty() {
            return Self::LAST;
        }

        let digits = rest.iter().take_while(|b| b.is_ascii_digit()).count();
        if digits == 0 {
            let class = if rest.eq_ignore_ascii_case(b"M") || rest.eq_ignore_ascii_case(b"MT") {
                RANK_MT
            } else if rest.eq_ignore_ascii_case(b"X") {
                RANK_X
            } else if rest.eq_ignore_ascii_case(b"Y") {
                RANK_Y
            } else {
                return Self {
                    marker,
                    class: RANK_HASHED,
                    number: xxh3_64(rest),
                    suffix: 0,
                };
            };
            return Self {
                marker,
                class,
                number: 0,
                suffix: 0,
            };
        }

        let number = parse_digits_saturating(&rest[..digits]);
        let suffix = suffix_rank(&rest[digits..]);
        match number {
            1..=22 => Self {
                marker,
                class: number as u32,
                number: 0,
                suffix,
            },
            _ => Self {
                marker,
                class: RANK_OTHER_NUMERIC,
                number,
                suffix,
            },
        }
    }

    /// Whether the key carried the `chr` marker
    pub fn has_marker(&self) -> bool {
        self.marker
    }

    /// Coarse class: 1..=22 autosomes, 23 M/MT, 24 X, 25 Y, larger values for
    /// everything else
    pub fn class(&self) -> u32 {
        self.class
    }
}

fn parse_digits_saturating(digits: &[u8]) -> u64 {
    digits.iter().fold(0u64, |acc, &d| {
        acc.saturating_mul(10).saturating_add(u64::from(d - b'0'))
    })
}

/// Zero for a bare contig so it sorts before any annotated variant of itself.
fn suffix_rank(suffix: &[u8]) -> u64 {
    if suffix.is_empty() {
        0
    } else {
        (xxh3_64(suffix) >> 1) + 1
    }
}

/// Memoized comparable form of a grouping key under one policy.
///
/// Under the lexicographic policy the rank carries nothing and the comparison
/// falls through to the key bytes, so it is exactly byte order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum GroupRank {
    Bytes,
    Natural(NaturalRank),
}

/// Full sort key of one record: rank, then key bytes, then position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SortKey<'k> {
    pub rank: GroupRank,
    pub group: &'k [u8],
    pub position: i64,
}

impl ChromOrder {
    /// Rank a grouping key under this policy
    #[inline]
    pub fn rank(&self, group: &[u8]) -> GroupRank {
        match self {
            ChromOrder::Lexicographic => GroupRank::Bytes,
            ChromOrder::Natural => GroupRank::Natural(NaturalRank::of(group)),
        }
    }

    /// Build the memoized sort key of an extracted record key
    #[inline]
    pub fn sort_key<'k>(&self, key: RecordKey<'k>) -> SortKey<'k> {
        SortKey {
            rank: self.rank(key.group),
            group: key.group,
            position: key.position,
        }
    }

    /// Compare two grouping keys
    pub fn compare_groups(&self, a: &[u8], b: &[u8]) -> Ordering {
        self.rank(a).cmp(&self.rank(b)).then_with(|| a.cmp(b))
    }

    /// Compare two records by grouping key, then position
    pub fn compare(&self, a: &RecordKey<'_>, b: &RecordKey<'_>) -> Ordering {
        self.compare_groups(a.group, b.group)
            .then(a.position.cmp(&b.position))
    }
}

impl FromStr for ChromOrder {
    type Err = SortError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "lexicographic" | "lex" | "default" => Ok(ChromOrder::Lexicographic),
            "natural" | "nat" => Ok(ChromOrder::Natural),
            _ => Err(SortError::parse_error(&format!(
                "unknown chromosome order: {s}"
            ))),
        }
    }
}

impl std::fmt::Display for ChromOrder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ChromOrder::Lexicographic => "lexicographic",
            ChromOrder::Natural => "natural",
        };
        write!(f, "{name}")
    }
}

/// Interns grouping keys to provisional ids during ingestion, then turns them
/// into dense ordinals that follow the policy.
///
/// Once finalized, comparing two records reduces to comparing two integers,
/// whatever the key length or policy.
pub struct RankTable<'a> {
    order: ChromOrder,
    ids: HashMap<Cow<'a, [u8]>, u32>,
}

impl<'a> RankTable<'a> {
    pub fn new(order: ChromOrder) -> Self {
        Self {
            order,
            ids: HashMap::new(),
        }
    }

    /// Intern a key, copying it on first sight
    #[inline]
    pub fn intern(&mut self, group: &[u8]) -> u32 {
        if let Some(&id) = self.ids.get(group) {
            return id;
        }
        self.insert(Cow::Owned(group.to_vec()))
    }

    /// Intern a key that outlives the table (e.g. a slice of a mapping)
    #[inline]
    pub fn intern_borrowed(&mut self, group: &'a [u8]) -> u32 {
        if let Some(&id) = self.ids.get(group) {
            return id;
        }
        self.insert(Cow::Borrowed(group))
    }

    fn insert(&mut self, group: Cow<'a, [u8]>) -> u32 {
        let id = self.ids.len() as u32;
        self.ids.insert(group, id);
        id
    }

    /// Number of distinct keys seen
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Assign each provisional id its ordinal in policy order
    pub fn finalize(self) -> RankMap {
        let order = self.order;
        let mut entries: Vec<(GroupRank, Cow<'a, [u8]>, u32)> = self
            .ids
            .into_iter()
            .map(|(group, id)| (order.rank(&group), group, id))
            .collect();
        // Keys are distinct, so the unstable sort is still deterministic.
        entries.sort_unstable_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));

        let mut ordinals = vec![0u32; entries.len()];
        for (ordinal, (_, _, id)) in entries.iter().enumerate() {
            ordinals[*id as usize] = ordinal as u32;
        }
        RankMap { ordinals }
    }
}

/// Provisional id to ordinal lookup produced by [`RankTable::finalize`].
#[derive(Debug, Clone)]
pub struct RankMap {
    ordinals: Vec<u32>,
}

impl RankMap {
    #[inline]
    pub fn ordinal(&self, id: u32) -> u32 {
        self.ordinals[id as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sorted_by(order: ChromOrder, keys: &[&str]) -> Vec<String> {
        let mut keys: Vec<&str> = keys.to_vec();
        keys.sort_by(|a, b| order.compare_groups(a.as_bytes(), b.as_bytes()));
        keys.into_iter().map(String::from).collect()
    }

    const MIXED: [&str; 8] = ["chr10", "chr2", "chr1", "chrX", "chrM", "10", "2", "1"];

    #[test]
    fn test_natural_order_scenario() {
        assert_eq!(
            sorted_by(ChromOrder::Natural, &MIXED),
            vec!["1", "2", "10", "chr1", "chr2", "chr10", "chrM", "chrX"]
        );
    }

    #[test]
    fn test_lexicographic_order_scenario() {
        assert_eq!(
            sorted_by(ChromOrder::Lexicographic, &MIXED),
            vec!["1", "10", "2", "chr1", "chr10", "chr2", "chrM", "chrX"]
        );
    }

    #[test]
    fn test_sentinel_ranks() {
        let m = NaturalRank::of(b"chrM");
        let mt = NaturalRank::of(b"MT");
        let x = NaturalRank::of(b"X");
        let y = NaturalRank::of(b"Y");
        assert_eq!(m.class(), 23);
        assert_eq!(mt.class(), 23);
        assert!(m.has_marker());
        assert!(!mt.has_marker());
        assert!(mt < x && x < y);
        assert!(NaturalRank::of(b"22") < mt);
    }

    #[test]
    fn test_other_tokens_after_known_ranks() {
        let y = NaturalRank::of(b"Y");
        let big = NaturalRank::of(b"23");
        let scaffold = NaturalRank::of(b"scaffold");
        assert!(y < big);
        assert!(big < scaffold);
        assert!(NaturalRank::of(b"23") < NaturalRank::of(b"100"));
        assert_eq!(NaturalRank::of(b"GL000"), NaturalRank::of(b"GL000"));
    }

    #[test]
    fn test_annotated_contig_follows_base() {
        let order = ChromOrder::Natural;
        assert_eq!(
            order.compare_groups(b"chr1", b"chr1_KI270706v1_random"),
            Ordering::Less
        );
        assert_eq!(
            order.compare_groups(b"chr1_KI270706v1_random", b"chr2"),
            Ordering::Less
        );
    }

    #[test]
    fn test_marker_is_case_insensitive() {
        let lower = NaturalRank::of(b"chr3");
        let upper = NaturalRank::of(b"CHR3");
        assert_eq!(lower, upper);
        assert!(NaturalRank::of(b"Y") < lower);
        // Equal ranks still separate distinct keys.
        assert_eq!(
            ChromOrder::Natural.compare_groups(b"CHR3", b"chr3"),
            Ordering::Less
        );
    }

    #[test]
    fn test_empty_and_bare_marker_sort_last() {
        assert_eq!(NaturalRank::of(b""), NaturalRank::LAST);
        assert_eq!(NaturalRank::of(b"chr"), NaturalRank::LAST);
        assert!(NaturalRank::of(b"chrUn_gl000220") < NaturalRank::LAST);
        assert_eq!(
            ChromOrder::Lexicographic.compare_groups(b"", b"1"),
            Ordering::Less
        );
    }

    #[test]
    fn test_position_breaks_ties() {
        let order = ChromOrder::Natural;
        let a = RecordKey {
            group: b"1",
            position: 200,
        };
        let b = RecordKey {
            group: b"1",
            position: 100,
        };
        assert_eq!(order.compare(&a, &b), Ordering::Greater);
        assert!(order.sort_key(b) < order.sort_key(a));
    }

    #[test]
    fn test_rank_table_ordinals_follow_policy() {
        let mut table = RankTable::new(ChromOrder::Natural);
        let ids: Vec<u32> = MIXED.iter().map(|k| table.intern(k.as_bytes())).collect();
        assert_eq!(table.intern(b"chr2"), ids[1]);
        assert_eq!(table.len(), MIXED.len());

        let map = table.finalize();
        let mut by_ordinal: Vec<(u32, &str)> = ids
            .iter()
            .zip(MIXED.iter())
            .map(|(&id, &key)| (map.ordinal(id), key))
            .collect();
        by_ordinal.sort();
        let keys: Vec<&str> = by_ordinal.into_iter().map(|(_, k)| k).collect();
        assert_eq!(keys, vec!["1", "2", "10", "chr1", "chr2", "chr10", "chrM", "chrX"]);
    }

    #[test]
    fn test_from_str_and_display() {
        assert_eq!("natural".parse::<ChromOrder>().unwrap(), ChromOrder::Natural);
        assert_eq!("LEX".parse::<ChromOrder>().unwrap(), ChromOrder::Lexicographic);
        assert!("alphabetical".parse::<ChromOrder>().is_err());
        assert_eq!(ChromOrder::Natural.to_string(), "natural");
    }

    fn chrom_strategy() -> impl Strategy<Value = String> {
        prop_oneof![
            "(chr|CHR|Chr)?[0-9]{1,3}(_[a-z0-9]{1,5})?",
            "(chr)?(X|Y|M|MT|x|Un)",
            "[A-Za-z0-9_.]{0,8}",
        ]
    }

    proptest! {
        #[test]
        fn prop_natural_compare_antisymmetric(a in chrom_strategy(), b in chrom_strategy()) {
            let order = ChromOrder::Natural;
            let ab = order.compare_groups(a.as_bytes(), b.as_bytes());
            let ba = order.compare_groups(b.as_bytes(), a.as_bytes());
            prop_assert_eq!(ab, ba.reverse());
            prop_assert_eq!(ab == Ordering::Equal, a == b);
        }

        #[test]
        fn prop_natural_compare_transitive(
            a in chrom_strategy(),
            b in chrom_strategy(),
            c in chrom_strategy(),
        ) {
            let order = ChromOrder::Natural;
            let mut keys = [a, b, c];
            keys.sort_by(|x, y| order.compare_groups(x.as_bytes(), y.as_bytes()));
            prop_assert_ne!(order.compare_groups(keys[0].as_bytes(), keys[1].as_bytes()), Ordering::Greater);
            prop_assert_ne!(order.compare_groups(keys[1].as_bytes(), keys[2].as_bytes()), Ordering::Greater);
            prop_assert_ne!(order.compare_groups(keys[0].as_bytes(), keys[2].as_bytes()), Ordering::Greater);
        }

        #[test]
        fn prop_lexicographic_is_byte_order(a in chrom_strategy(), b in chrom_strategy()) {
            prop_assert_eq!(
                ChromOrder::Lexicographic.compare_groups(a.as_bytes(), b.as_bytes()),
                a.as_bytes().cmp(b.as_bytes())
            );
        }

        #[test]
        fn prop_permutations_sort_identically(
            mut keys in prop::collection::vec(chrom_strategy(), 0..24),
        ) {
            let order = ChromOrder::Natural;
            let mut forward = keys.clone();
            forward.sort_by(|x, y| order.compare_groups(x.as_bytes(), y.as_bytes()));
            keys.reverse();
            keys.sort_by(|x, y| order.compare_groups(x.as_bytes(), y.as_bytes()));
            prop_assert_eq!(forward, keys);
        }
    }
}
