//! Streaming group detection over a key-sorted replay
//!
//! A [`GroupDetector`] is fed one entry at a time, together with whether
//! another entry follows. It keeps at most one open group and the previous
//! entry, and returns a [`Group`] each time a maximal run of related entries
//! ends. Entries with no related neighbour are skipped.

use std::collections::BTreeMap;

use crate::key::SortableKey;
use crate::staging::StagedEntry;

/// "Same group" relation between two adjacent keys
///
/// Must agree with the staging sort order: related keys have to replay as one
/// contiguous run.
pub trait GroupPredicate: Send + Sync {
    fn same_group(&self, previous: &SortableKey, current: &SortableKey) -> bool;
}

impl<F> GroupPredicate for F
where
    F: Fn(&SortableKey, &SortableKey) -> bool + Send + Sync,
{
    fn same_group(&self, previous: &SortableKey, current: &SortableKey) -> bool {
        self(previous, current)
    }
}

/// Keys are related when they agree on every listed field
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SameFields {
    fields: Vec<String>,
}

impl SameFields {
    pub fn new<S: Into<String>>(fields: impl IntoIterator<Item = S>) -> Self {
        Self {
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }
}

impl GroupPredicate for SameFields {
    fn same_group(&self, previous: &SortableKey, current: &SortableKey) -> bool {
        self.fields.iter().all(|f| match (previous.get(f), current.get(f)) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        })
    }
}

/// Entries of one group, in replay order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Group {
    entries: BTreeMap<u64, StagedEntry>,
}

impl Group {
    fn insert(&mut self, entry: StagedEntry) {
        self.entries.entry(entry.ordinal).or_insert(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &StagedEntry> {
        self.entries.values()
    }

    /// First entry; its key identifies the group
    pub fn first(&self) -> Option<&StagedEntry> {
        self.entries.values().next()
    }

    pub fn rows(&self) -> impl Iterator<Item = &str> {
        self.entries.values().map(|e| e.row.as_str())
    }

    pub fn into_entries(self) -> Vec<StagedEntry> {
        self.entries.into_values().collect()
    }
}

pub struct GroupDetector<P> {
    predicate: P,
    previous: Option<StagedEntry>,
    open: Group,
    emitted: u64,
    skipped: u64,
}

impl<P: GroupPredicate> GroupDetector<P> {
    pub fn new(predicate: P) -> Self {
        Self {
            predicate,
            previous: None,
            open: Group::default(),
            emitted: 0,
            skipped: 0,
        }
    }

    /// Feed the next entry; returns a group when one is complete
    ///
    /// `has_next` must be false on the last entry of the stream so the final
    /// run is flushed.
    pub fn push(&mut self, entry: StagedEntry, has_next: bool) -> Option<Group> {
        let Some(previous) = self.previous.take() else {
            if !has_next {
                self.skipped += 1;
            }
            self.previous = Some(entry);
            return None;
        };

        let related = self.predicate.same_group(&previous.key, &entry.key);
        let mut done = None;

        if related {
            self.open.insert(previous);
            self.open.insert(entry.clone());
            if !has_next {
                done = self.close();
            }
        } else {
            if self.open.is_empty() {
                self.skipped += 1;
            }
            done = self.close();
            if !has_next {
                self.skipped += 1;
            }
        }

        self.previous = Some(entry);
        done
    }

    /// Groups emitted so far
    pub fn emitted(&self) -> u64 {
        self.emitted
    }

    /// Entries dropped for having no related neighbour
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    fn close(&mut self) -> Option<Group> {
        if self.open.is_empty() {
            return None;
        }
        self.emitted += 1;
        Some(std::mem::take(&mut self.open))
    }
}

/// Run a detector over an in-memory sequence of entries
pub fn detect_groups<P: GroupPredicate>(
    predicate: P,
    entries: impl IntoIterator<Item = StagedEntry>,
) -> Vec<Group> {
    let mut detector = GroupDetector::new(predicate);
    let mut iter = entries.into_iter().peekable();
    let mut groups = Vec::new();
    while let Some(entry) = iter.next() {
        let has_next = iter.peek().is_some();
        if let Some(group) = detector.push(entry, has_next) {
            groups.push(group);
        }
    }
    groups
}
