//! Canonical student group index: the offline builder that produces
//! `groups_index.json` and the suggest service that serves it.

pub mod builder;
pub mod metrics_defs;
pub mod probe;
pub mod snapshot;
pub mod suggest;
pub mod types;

pub use builder::{BuildError, BuildReport, IndexBuilder, Resolution};
pub use snapshot::{SnapshotError, SnapshotStore};
pub use suggest::GroupSuggest;
pub use types::{GroupIndexSnapshot, GroupRecord, ScheduleWindow};
