use crate::metrics_defs::{INDEX_RELOADS, INDEX_SIZE};
use crate::snapshot::SnapshotStore;
use crate::types::GroupRecord;
use parking_lot::RwLock;
use shared::{counter, gauge};
use std::sync::Arc;
use std::time::SystemTime;

pub const DEFAULT_LIMIT: usize = 50;
pub const MAX_LIMIT: usize = 200;

struct IndexedGroup {
    record: GroupRecord,
    label_lower: String,
}

/// What is currently in memory and which file version it came from.
#[derive(Default)]
struct IndexState {
    groups: Arc<Vec<IndexedGroup>>,
    // mtime seen by the last load attempt, `None` before the first one
    attempted: Option<Option<SystemTime>>,
}

/// Serves group name suggestions from the snapshot written by the index builder.
///
/// The snapshot is re-read only when its modification time changes. A missing
/// or corrupt snapshot results in an empty index, never an error.
pub struct GroupSuggest {
    store: SnapshotStore,
    state: RwLock<IndexState>,
}

impl GroupSuggest {
    pub fn new(store: SnapshotStore) -> Self {
        GroupSuggest {
            store,
            state: RwLock::new(IndexState::default()),
        }
    }

    /// Number of groups currently loaded.
    pub fn len(&self) -> usize {
        self.state.read().groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reloads the snapshot if the file changed since the last attempt.
    /// Returns true when the in-memory index was replaced.
    pub fn reload(&self) -> bool {
        let mtime = self.store.modified().ok();
        if self.state.read().attempted == Some(mtime) {
            return false;
        }

        let mut state = self.state.write();
        // Another request may have reloaded while we waited for the lock
        if state.attempted == Some(mtime) {
            return false;
        }

        let groups = match mtime {
            None => {
                tracing::warn!(
                    path = %self.store.path().display(),
                    "group index snapshot is missing, serving empty suggestions"
                );
                counter!(INDEX_RELOADS, "outcome" => "missing").increment(1);
                Vec::new()
            }
            Some(_) => match self.store.load() {
                Ok(snapshot) => {
                    counter!(INDEX_RELOADS, "outcome" => "ok").increment(1);
                    tracing::info!(
                        count = snapshot.items.len(),
                        updated_at = %snapshot.updated_at,
                        "loaded group index snapshot"
                    );
                    snapshot
                        .items
                        .into_iter()
                        .map(|record| IndexedGroup {
                            label_lower: record.label.to_lowercase(),
                            record,
                        })
                        .collect()
                }
                Err(err) => {
                    counter!(INDEX_RELOADS, "outcome" => "error").increment(1);
                    tracing::error!(
                        path = %self.store.path().display(),
                        error = %err,
                        "failed to load group index snapshot, serving empty suggestions"
                    );
                    Vec::new()
                }
            },
        };

        gauge!(INDEX_SIZE).set(groups.len() as f64);
        state.groups = Arc::new(groups);
        state.attempted = Some(mtime);
        true
    }

    /// Groups whose label contains `term` (case-insensitive) or, for an
    /// all-digit term, whose id starts with it. Snapshot order, at most
    /// `limit` results (capped at [`MAX_LIMIT`]).
    pub fn suggest(&self, term: &str, limit: usize) -> Vec<GroupRecord> {
        let term = term.trim();
        if term.is_empty() || limit == 0 {
            return Vec::new();
        }

        self.reload();
        let groups = self.state.read().groups.clone();

        let needle = term.to_lowercase();
        let numeric = term.bytes().all(|b| b.is_ascii_digit());

        groups
            .iter()
            .filter(|group| {
                group.label_lower.contains(&needle)
                    || (numeric && group.record.id.to_string().starts_with(term))
            })
            .take(limit.min(MAX_LIMIT))
            .map(|group| group.record.clone())
            .collect()
    }
}
