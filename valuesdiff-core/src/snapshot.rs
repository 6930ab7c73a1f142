//! Snapshots of tracked items and the three-way comparison between them.

use std::{
    cmp::Ordering,
    collections::{btree_map, BTreeMap},
    iter::Peekable,
};

use serde::{Deserialize, Serialize};

/// A flat mapping from item key to item value.
///
/// Keys identify an item; values are opaque strings. The map is kept sorted,
/// which is what makes [`diff`] deterministic and linear.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Snapshot(BTreeMap<String, String>);

impl Snapshot {
    pub fn new() -> Self {
        Snapshot(BTreeMap::new())
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.0.insert(key.into(), value.into())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Entries in ascending key order.
    pub fn iter(&self) -> btree_map::Iter<'_, String, String> {
        self.0.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn as_map(&self) -> &BTreeMap<String, String> {
        &self.0
    }
}

impl From<BTreeMap<String, String>> for Snapshot {
    fn from(map: BTreeMap<String, String>) -> Self {
        Snapshot(map)
    }
}

impl From<Snapshot> for BTreeMap<String, String> {
    fn from(snapshot: Snapshot) -> Self {
        snapshot.0
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Snapshot {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Snapshot(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

impl<'a> IntoIterator for &'a Snapshot {
    type Item = (&'a String, &'a String);
    type IntoIter = btree_map::Iter<'a, String, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// The keys that differ between a desired snapshot and a baseline.
///
/// Every list is sorted ascending and the three lists are pairwise disjoint.
/// Successive plans are compared for stability by the host, so the order is
/// part of the contract.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DiffResult {
    /// Keys in the desired snapshot that the baseline lacks.
    pub created: Vec<String>,
    /// Keys present in both, with a different value.
    pub updated: Vec<String>,
    /// Keys in the baseline that the desired snapshot lacks.
    pub deleted: Vec<String>,
}

impl DiffResult {
    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }

    /// Total number of keys that differ.
    pub fn len(&self) -> usize {
        self.created.len() + self.updated.len() + self.deleted.len()
    }
}

/// Compare `desired` against `baseline`.
///
/// Values are compared byte for byte. Both snapshots are walked once in key
/// order, so the output lists come out sorted without a separate sort.
pub fn diff(desired: &Snapshot, baseline: &Snapshot) -> DiffResult {
    let mut result = DiffResult::default();
    let mut desired_iter = desired.iter().peekable();
    let mut baseline_iter = baseline.iter().peekable();

    loop {
        match next_pair(&mut desired_iter, &mut baseline_iter) {
            Step::Created(k) => result.created.push(k.clone()),
            Step::Deleted(k) => result.deleted.push(k.clone()),
            Step::Both(k, desired_value, baseline_value) => {
                if desired_value != baseline_value {
                    result.updated.push(k.clone());
                }
            }
            Step::Done => break,
        }
    }

    result
}

enum Step<'a> {
    Created(&'a String),
    Deleted(&'a String),
    Both(&'a String, &'a String, &'a String),
    Done,
}

type Entries<'a> = Peekable<btree_map::Iter<'a, String, String>>;

fn next_pair<'a>(desired: &mut Entries<'a>, baseline: &mut Entries<'a>) -> Step<'a> {
    let order = match (desired.peek(), baseline.peek()) {
        (None, None) => return Step::Done,
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (Some((dk, _)), Some((bk, _))) => dk.cmp(bk),
    };
    match order {
        Ordering::Less => match desired.next() {
            Some((k, _)) => Step::Created(k),
            None => Step::Done,
        },
        Ordering::Greater => match baseline.next() {
            Some((k, _)) => Step::Deleted(k),
            None => Step::Done,
        },
        Ordering::Equal => match (desired.next(), baseline.next()) {
            (Some((k, dv)), Some((_, bv))) => Step::Both(k, dv, bv),
            _ => Step::Done,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::BTreeSet;

    fn snap(entries: &[(&str, &str)]) -> Snapshot {
        entries.iter().copied().collect()
    }

    #[test]
    fn test_diff_everything_created_against_empty() {
        let d = diff(&snap(&[("1", "a"), ("2", "b"), ("3", "c")]), &Snapshot::new());
        assert_eq!(d.created, vec!["1", "2", "3"]);
        assert!(d.updated.is_empty());
        assert!(d.deleted.is_empty());
    }

    #[test]
    fn test_diff_mixed() {
        let baseline = snap(&[("1", "a"), ("2", "b"), ("3", "c")]);
        let desired = snap(&[("1", "a"), ("3", "cc"), ("4", "d"), ("5", "e")]);
        let d = diff(&desired, &baseline);
        assert_eq!(d.created, vec!["4", "5"]);
        assert_eq!(d.updated, vec!["3"]);
        assert_eq!(d.deleted, vec!["2"]);
        assert_eq!(d.len(), 4);
    }

    #[test]
    fn test_diff_values_are_case_sensitive() {
        let d = diff(&snap(&[("k", "Value")]), &snap(&[("k", "value")]));
        assert_eq!(d.updated, vec!["k"]);
    }

    #[test]
    fn test_diff_lexicographic_not_numeric() {
        let d = diff(&snap(&[("10", "x"), ("9", "x"), ("1", "x")]), &Snapshot::new());
        assert_eq!(d.created, vec!["1", "10", "9"]);
    }

    #[test]
    fn test_diff_everything_deleted() {
        let d = diff(&Snapshot::new(), &snap(&[("b", "1"), ("a", "2")]));
        assert_eq!(d.deleted, vec!["a", "b"]);
        assert!(d.created.is_empty() && d.updated.is_empty());
    }

    #[test]
    fn test_snapshot_serializes_as_plain_map() {
        let s = snap(&[("b", "2"), ("a", "1")]);
        assert_eq!(
            serde_json::to_value(&s).unwrap(),
            serde_json::json!({"a": "1", "b": "2"})
        );
    }

    fn arb_snapshot() -> impl Strategy<Value = Snapshot> {
        prop::collection::btree_map("[a-e]{1,2}", "[xyz]{0,2}", 0..12).prop_map(Snapshot::from)
    }

    proptest! {
        #[test]
        fn prop_diff_of_self_is_empty(a in arb_snapshot()) {
            prop_assert!(diff(&a, &a).is_empty());
        }

        #[test]
        fn prop_diff_sets_are_disjoint_and_complete(a in arb_snapshot(), b in arb_snapshot()) {
            let d = diff(&a, &b);
            let created: BTreeSet<_> = d.created.iter().cloned().collect();
            let updated: BTreeSet<_> = d.updated.iter().cloned().collect();
            let deleted: BTreeSet<_> = d.deleted.iter().cloned().collect();
            prop_assert!(created.is_disjoint(&updated));
            prop_assert!(created.is_disjoint(&deleted));
            prop_assert!(updated.is_disjoint(&deleted));

            let expected: BTreeSet<String> = a
                .keys()
                .chain(b.keys())
                .filter(|k| a.get(k) != b.get(k))
                .map(str::to_owned)
                .collect();
            let actual: BTreeSet<String> = created.union(&updated).cloned()
                .chain(deleted.iter().cloned())
                .collect();
            prop_assert_eq!(actual, expected);
        }

        #[test]
        fn prop_diff_is_sorted_and_stable(a in arb_snapshot(), b in arb_snapshot()) {
            let first = diff(&a, &b);
            let second = diff(&a, &b);
            prop_assert_eq!(&first, &second);
            for list in [&first.created, &first.updated, &first.deleted] {
                prop_assert!(list.windows(2).all(|w| w[0] < w[1]));
            }
        }
    }
}
