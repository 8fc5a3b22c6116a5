//! Core data model for ELH: collection keys, work-item references, fetched records and the
//! checkpoint document that makes a harvest resumable.

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use url::Url;

pub const CRATE_NAME: &str = "elh-core";

/// Sentinel used when no key can be derived from a source. Collisions under it are
/// last-write-wins.
pub const UNKNOWN_COLLECTION_KEY: &str = "unknown";

pub const META_MAIN_URL: &str = "main_url";
pub const META_IMAGE_URL: &str = "image_url";
pub const META_TITLE: &str = "title";

/// Stable identifier of one collection, derived from a human-readable source identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CollectionKey(String);

impl CollectionKey {
    /// Lower-cases the input and collapses every run of non-alphanumeric characters into a
    /// single `_`. Inputs with no alphanumeric content map to the `unknown` sentinel.
    pub fn canonicalize(source: &str) -> Self {
        let mut out = String::with_capacity(source.len());
        let mut pending_separator = false;
        for ch in source.chars() {
            if ch.is_alphanumeric() {
                if pending_separator && !out.is_empty() {
                    out.push('_');
                }
                pending_separator = false;
                out.extend(ch.to_lowercase());
            } else {
                pending_separator = true;
            }
        }
        if out.is_empty() {
            Self::unknown()
        } else {
            Self(out)
        }
    }

    pub fn unknown() -> Self {
        Self(UNKNOWN_COLLECTION_KEY.to_string())
    }

    pub fn is_unknown(&self) -> bool {
        self.0 == UNKNOWN_COLLECTION_KEY
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CollectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Canonical absolute URL of one fetchable unit inside a collection.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkItemRef(String);

impl WorkItemRef {
    /// Resolves `href` against `base` and strips the fragment, so that two links to the
    /// same page compare equal.
    pub fn resolve(base: &Url, href: &str) -> Option<Self> {
        let mut url = base.join(href.trim()).ok()?;
        url.set_fragment(None);
        Some(Self(url.to_string()))
    }

    /// Wraps a reference that is already canonical (e.g. read back from a checkpoint).
    pub fn new(url: impl Into<String>) -> Self {
        Self(url.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkItemRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Appends the references from `incoming` that are not already in `sequence`, preserving
/// the order of both. Returns how many were appended.
pub fn append_unique(
    sequence: &mut Vec<WorkItemRef>,
    incoming: impl IntoIterator<Item = WorkItemRef>,
) -> usize {
    let mut seen: HashSet<WorkItemRef> = sequence.iter().cloned().collect();
    let before = sequence.len();
    for item in incoming {
        if seen.insert(item.clone()) {
            sequence.push(item);
        }
    }
    sequence.len() - before
}

/// Result of fetching one work item. An empty string means "not found / not fetched yet".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Record {
    /// Primary media link; drives completeness.
    pub video: String,
    pub subtitle: String,
    pub dub: String,
}

impl Record {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_complete(&self) -> bool {
        !self.video.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.video.is_empty() && self.subtitle.is_empty() && self.dub.is_empty()
    }
}

/// Progress of one collection. `items[i]` is the record for `refs[i]`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectionState {
    pub metadata: BTreeMap<String, String>,
    pub refs: Vec<WorkItemRef>,
    #[serde(deserialize_with = "records_allowing_null")]
    pub items: Vec<Record>,
}

impl CollectionState {
    pub fn main_url(&self) -> Option<&str> {
        self.metadata
            .get(META_MAIN_URL)
            .map(String::as_str)
            .filter(|s| !s.is_empty())
    }

    /// Indices that still need a fetch: past the end of `items`, or not complete.
    pub fn pending_indices(&self) -> Vec<usize> {
        (0..self.refs.len())
            .filter(|&i| self.items.get(i).map_or(true, |r| !r.is_complete()))
            .collect()
    }

    pub fn complete_count(&self) -> usize {
        self.items
            .iter()
            .take(self.refs.len())
            .filter(|r| r.is_complete())
            .count()
    }

    /// Pads `items` with empty records up to `refs.len()`. Records beyond the reference
    /// sequence are cut off; the number removed is returned so callers can report it.
    pub fn align_items(&mut self) -> usize {
        let target = self.refs.len();
        if self.items.len() > target {
            let dropped = self.items.len() - target;
            self.items.truncate(target);
            return dropped;
        }
        self.items.resize_with(target, Record::empty);
        0
    }

    /// Copies metadata entries that are non-empty in `incoming` and missing or empty here.
    pub fn merge_metadata(&mut self, incoming: &BTreeMap<String, String>) -> bool {
        let mut changed = false;
        for (key, value) in incoming {
            if value.is_empty() {
                continue;
            }
            let slot = self.metadata.entry(key.clone()).or_default();
            if slot.is_empty() {
                *slot = value.clone();
                changed = true;
            }
        }
        changed
    }
}

/// A collection produced by discovery, before it is merged into the checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredCollection {
    pub key: CollectionKey,
    pub metadata: BTreeMap<String, String>,
    pub refs: Vec<WorkItemRef>,
}

/// Outcome of discovering one collection source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Discovered {
    Collection(DiscoveredCollection),
    /// The source needs the rendered path; static discovery abstains.
    Deferred { source: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Merged { appended: usize },
    /// A different source already owned this key and was overwritten.
    Replaced,
}

/// Durable root of a harvest: every collection's progress plus deferred sources.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointFile {
    pub collections: BTreeMap<CollectionKey, CollectionState>,
    pub deferred: Vec<String>,
    /// Sources whose key was taken over by another source. Still known, so a later run
    /// does not replace the winner again.
    pub superseded: Vec<String>,
}

impl CheckpointFile {
    pub fn key_for_source(&self, source: &str) -> Option<&CollectionKey> {
        self.collections
            .iter()
            .find(|(_, state)| state.main_url() == Some(source))
            .map(|(key, _)| key)
    }

    pub fn is_deferred(&self, source: &str) -> bool {
        self.deferred.iter().any(|s| s == source)
    }

    pub fn is_superseded(&self, source: &str) -> bool {
        self.superseded.iter().any(|s| s == source)
    }

    /// Recorded under a key, waiting for rendered discovery, or displaced by a key collision.
    pub fn is_known(&self, source: &str) -> bool {
        self.key_for_source(source).is_some() || self.is_deferred(source) || self.is_superseded(source)
    }

    pub fn defer(&mut self, source: &str) -> bool {
        if self.is_deferred(source) {
            return false;
        }
        self.deferred.push(source.to_string());
        true
    }

    pub fn undefer(&mut self, source: &str) -> bool {
        let before = self.deferred.len();
        self.deferred.retain(|s| s != source);
        before != self.deferred.len()
    }

    /// Merges a discovered collection. Reference sequences only grow (existing order kept,
    /// new references appended) so completed indices stay aligned. If the key is owned by a
    /// different main URL the earlier entry is replaced and its source marked superseded.
    pub fn upsert_discovered(&mut self, discovered: DiscoveredCollection) -> UpsertOutcome {
        let DiscoveredCollection { key, metadata, refs } = discovered;
        let incoming_main = metadata.get(META_MAIN_URL).cloned().unwrap_or_default();
        if !incoming_main.is_empty() {
            self.superseded.retain(|s| *s != incoming_main);
        }

        match self.collections.get_mut(&key) {
            Some(state)
                if state.main_url().is_none()
                    || incoming_main.is_empty()
                    || state.main_url() == Some(incoming_main.as_str()) =>
            {
                state.merge_metadata(&metadata);
                let appended = append_unique(&mut state.refs, refs);
                state.align_items();
                UpsertOutcome::Merged { appended }
            }
            Some(state) => {
                let mut fresh = CollectionState {
                    metadata,
                    refs: Vec::new(),
                    items: Vec::new(),
                };
                append_unique(&mut fresh.refs, refs);
                fresh.align_items();
                let displaced = std::mem::replace(state, fresh);
                if let Some(previous) = displaced.main_url() {
                    if !self.superseded.iter().any(|s| s == previous) {
                        self.superseded.push(previous.to_string());
                    }
                }
                UpsertOutcome::Replaced
            }
            None => {
                let mut fresh = CollectionState {
                    metadata,
                    refs: Vec::new(),
                    items: Vec::new(),
                };
                append_unique(&mut fresh.refs, refs);
                fresh.align_items();
                self.collections.insert(key, fresh);
                UpsertOutcome::Inserted
            }
        }
    }
}

fn records_allowing_null<'de, D>(deserializer: D) -> Result<Vec<Record>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Vec<Option<Record>> = Vec::deserialize(deserializer)?;
    Ok(raw.into_iter().map(Option::unwrap_or_default).collect())
}
