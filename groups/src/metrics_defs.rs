//! Metrics definitions for the group index.

use shared::metrics_defs::{MetricDef, MetricType};

pub const INDEX_RELOADS: MetricDef = MetricDef {
    name: "groups_index.reloads",
    metric_type: MetricType::Counter,
    description: "Number of snapshot reloads. Tagged with outcome.",
};

pub const INDEX_SIZE: MetricDef = MetricDef {
    name: "groups_index.size",
    metric_type: MetricType::Gauge,
    description: "Number of groups in the currently loaded snapshot",
};

pub const VALIDATION_PROBES: MetricDef = MetricDef {
    name: "groups_index.validation.probes",
    metric_type: MetricType::Counter,
    description: "Number of schedule probes issued while validating duplicate labels",
};

pub const ALL_METRICS: &[MetricDef] = &[INDEX_RELOADS, INDEX_SIZE, VALIDATION_PROBES];
