//! Offline pipeline turning the RUZ group dictionary into a deduplicated
//! `GroupIndexSnapshot`.
//!
//! 1. fetch the dictionary
//! 2. normalize raw records into `(id, label)` pairs
//! 3. drop exact duplicate pairs
//! 4. resolve labels shared by several ids, either by keeping the smallest id
//!    or by probing each candidate's schedule
//! 5. persist the sorted snapshot

use crate::probe::ProbeScheduler;
use crate::snapshot::{SnapshotError, SnapshotStore};
use crate::types::{GroupIndexSnapshot, GroupRecord, ScheduleWindow};
use indexmap::{IndexMap, IndexSet};
use serde_json::{Map, Value};
use shared::upstream::{Upstream, UpstreamError, dictionary_url};
use std::time::Duration;
use url::Url;

// Dictionary records spell the id field differently depending on their origin.
const ID_FIELDS: &[&str] = &["groupOid", "groupId", "oid"];
const LABEL_FIELD: &str = "number";

#[derive(thiserror::Error, Debug)]
pub enum BuildError {
    #[error("could not fetch group dictionary: {0}")]
    Fetch(#[from] UpstreamError),

    #[error("could not write snapshot: {0}")]
    Snapshot(#[from] SnapshotError),
}

/// How to pick one id for a label that appears with several ids.
#[derive(Clone, Debug, PartialEq)]
pub enum Resolution {
    /// Keep the smallest id.
    Fast,
    /// Keep the id with the most events in `window`.
    Validated {
        window: ScheduleWindow,
        throttle: Duration,
    },
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BuildReport {
    /// Distinct `(id, label)` pairs found in the dictionary.
    pub total_pairs: usize,
    pub unique_labels: usize,
    /// Ids dropped because another id won their label.
    pub duplicate_ids: usize,
    pub probes: usize,
}

pub struct IndexBuilder<U> {
    upstream: U,
    ruz_base: Url,
    resolution: Resolution,
}

impl<U: Upstream> IndexBuilder<U> {
    pub fn new(upstream: U, ruz_base: Url, resolution: Resolution) -> Self {
        IndexBuilder {
            upstream,
            ruz_base,
            resolution,
        }
    }

    /// Returns the raw dictionary records. A payload that is not a list is
    /// treated as an empty dictionary.
    pub async fn fetch_dictionary(&self) -> Result<Vec<Value>, BuildError> {
        let url = dictionary_url(&self.ruz_base)?;
        match self.upstream.fetch_json(&url).await?.payload {
            Value::Array(records) => Ok(records),
            other => {
                tracing::warn!(
                    kind = json_kind(&other),
                    "group dictionary is not a list, treating it as empty"
                );
                Ok(Vec::new())
            }
        }
    }

    pub async fn build(&self) -> Result<(GroupIndexSnapshot, BuildReport), BuildError> {
        let source = dictionary_url(&self.ruz_base)?;
        let raw = self.fetch_dictionary().await?;

        let pairs = dedupe_pairs(normalize_pairs(&raw));
        if pairs.is_empty() {
            tracing::warn!("no groups found in dictionary, writing an empty index");
        }

        let by_label = group_by_label(&pairs);
        let mut report = BuildReport {
            total_pairs: pairs.len(),
            unique_labels: by_label.len(),
            duplicate_ids: pairs.len() - by_label.len(),
            probes: 0,
        };

        let items = match &self.resolution {
            Resolution::Fast => resolve_smallest(&by_label),
            Resolution::Validated { window, throttle } => {
                let mut scheduler =
                    ProbeScheduler::new(&self.upstream, &self.ruz_base, *window, *throttle);
                let items = resolve_validated(&by_label, &mut scheduler).await;
                report.probes = scheduler.probes();
                items
            }
        };

        Ok((GroupIndexSnapshot::new(source.as_str(), items), report))
    }

    /// Builds the snapshot and replaces the file behind `store`. Nothing is
    /// written when the dictionary cannot be fetched.
    pub async fn build_and_store(
        &self,
        store: &SnapshotStore,
    ) -> Result<BuildReport, BuildError> {
        let (snapshot, report) = self.build().await?;
        store.store(&snapshot)?;

        tracing::info!(
            groups = snapshot.count,
            pairs = report.total_pairs,
            duplicates = report.duplicate_ids,
            probes = report.probes,
            path = %store.path().display(),
            "group index built"
        );
        Ok(report)
    }
}

/// Extracts `(id, label)` from raw dictionary records, skipping records
/// without a positive numeric id or a non-empty label.
pub fn normalize_pairs(raw: &[Value]) -> Vec<GroupRecord> {
    raw.iter()
        .filter_map(Value::as_object)
        .filter_map(|record| {
            let id = extract_id(record)?;
            let label = record
                .get(LABEL_FIELD)
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|label| !label.is_empty())?;
            Some(GroupRecord::new(id, label))
        })
        .collect()
}

fn extract_id(record: &Map<String, Value>) -> Option<u64> {
    let raw = ID_FIELDS
        .iter()
        .filter_map(|field| record.get(*field))
        .find(|value| is_present(value))?;

    let id = match raw {
        Value::Number(n) => n.as_u64().or_else(|| {
            n.as_f64()
                .filter(|f| f.fract() == 0.0 && *f >= 1.0 && *f <= u64::MAX as f64)
                .map(|f| f as u64)
        }),
        Value::String(s) => s.trim().parse::<u64>().ok(),
        _ => None,
    }?;

    (id > 0).then_some(id)
}

// A field counts as present unless it is null, false, zero or empty.
fn is_present(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Removes exact duplicate pairs, keeping first-seen order.
pub fn dedupe_pairs(pairs: Vec<GroupRecord>) -> Vec<GroupRecord> {
    pairs
        .into_iter()
        .collect::<IndexSet<_>>()
        .into_iter()
        .collect()
}

pub fn group_by_label(pairs: &[GroupRecord]) -> IndexMap<String, Vec<u64>> {
    let mut by_label: IndexMap<String, Vec<u64>> = IndexMap::new();
    for record in pairs {
        by_label
            .entry(record.label.clone())
            .or_default()
            .push(record.id);
    }
    by_label
}

pub fn resolve_smallest(by_label: &IndexMap<String, Vec<u64>>) -> Vec<GroupRecord> {
    by_label
        .iter()
        .filter_map(|(label, ids)| {
            ids.iter()
                .min()
                .map(|id| GroupRecord::new(*id, label.as_str()))
        })
        .collect()
}

/// Labels with a single id are kept as they are; only real duplicates are probed.
pub async fn resolve_validated<U: Upstream + ?Sized>(
    by_label: &IndexMap<String, Vec<u64>>,
    scheduler: &mut ProbeScheduler<'_, U>,
) -> Vec<GroupRecord> {
    let mut items = Vec::with_capacity(by_label.len());
    for (label, ids) in by_label {
        let chosen = match ids.as_slice() {
            [] => None,
            [only] => Some(*only),
            candidates => {
                let live = scheduler.pick_live_id(candidates).await;
                tracing::debug!(label = %label, ?candidates, ?live, "resolved duplicate label");
                live
            }
        };

        if let Some(id) = chosen {
            items.push(GroupRecord::new(id, label.as_str()));
        }
    }
    items
}
