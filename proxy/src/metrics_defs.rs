use shared::metrics_defs::{MetricDef, MetricType};

pub const CACHE_HITS: MetricDef = MetricDef {
    name: "cache.hits",
    metric_type: MetricType::Counter,
    description: "Responses served from the response cache",
};

pub const CACHE_MISSES: MetricDef = MetricDef {
    name: "cache.misses",
    metric_type: MetricType::Counter,
    description: "Requests that had to go to the upstream",
};

pub const CACHE_STALE_SERVED: MetricDef = MetricDef {
    name: "cache.stale_served",
    metric_type: MetricType::Counter,
    description: "Stale responses served because the upstream failed",
};

pub const REQUEST_DURATION: MetricDef = MetricDef {
    name: "request.duration",
    metric_type: MetricType::Histogram,
    description: "API request duration in seconds. Tagged with endpoint and status.",
};

pub const ALL_METRICS: &[MetricDef] = &[
    CACHE_HITS,
    CACHE_MISSES,
    CACHE_STALE_SERVED,
    REQUEST_DURATION,
];
