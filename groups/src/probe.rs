//! Picks the "live" id among several ids sharing one label by asking the
//! schedule endpoint how many events each of them has.

use crate::metrics_defs::VALIDATION_PROBES;
use crate::types::ScheduleWindow;
use serde_json::Value;
use shared::counter;
use shared::upstream::{Upstream, schedule_url};
use std::time::Duration;
use tokio::time::sleep;
use url::Url;

// Keys under which RUZ sometimes wraps the list of lessons.
const ENVELOPE_KEYS: &[&str] = &["result", "items", "lessons"];

/// Number of events in a schedule payload, either a bare list or a list
/// wrapped in one of the known envelope keys. Anything else counts as zero.
pub fn count_events(payload: &Value) -> usize {
    match payload {
        Value::Array(events) => events.len(),
        Value::Object(map) => ENVELOPE_KEYS
            .iter()
            .find_map(|key| map.get(*key).and_then(Value::as_array))
            .map_or(0, Vec::len),
        _ => 0,
    }
}

/// The id with the strictly greatest score. Ties keep the earliest candidate.
pub fn select_live_id(scores: &[(u64, usize)]) -> Option<u64> {
    let mut best: Option<(u64, usize)> = None;
    for &(id, score) in scores {
        if best.is_none_or(|(_, best_score)| score > best_score) {
            best = Some((id, score));
        }
    }
    best.map(|(id, _)| id)
}

/// Probes one group's schedule over `window`. Failed probes score zero.
pub async fn probe_event_count<U: Upstream + ?Sized>(
    upstream: &U,
    ruz_base: &Url,
    group_id: u64,
    window: &ScheduleWindow,
) -> usize {
    let url = match schedule_url(
        ruz_base,
        &group_id.to_string(),
        &window.start_param(),
        &window.finish_param(),
        "1",
    ) {
        Ok(url) => url,
        Err(err) => {
            tracing::warn!(group_id, error = %err, "cannot build schedule probe URL");
            return 0;
        }
    };

    counter!(VALIDATION_PROBES).increment(1);
    match upstream.fetch_json(&url).await {
        Ok(response) => count_events(&response.payload),
        Err(err) => {
            tracing::warn!(group_id, error = %err, "schedule probe failed, scoring as empty");
            0
        }
    }
}

/// Runs probes one at a time, sleeping `throttle` between consecutive requests
/// so a validation run does not hammer the upstream.
pub struct ProbeScheduler<'a, U: ?Sized> {
    upstream: &'a U,
    ruz_base: &'a Url,
    window: ScheduleWindow,
    throttle: Duration,
    probes: usize,
}

impl<'a, U: Upstream + ?Sized> ProbeScheduler<'a, U> {
    pub fn new(
        upstream: &'a U,
        ruz_base: &'a Url,
        window: ScheduleWindow,
        throttle: Duration,
    ) -> Self {
        ProbeScheduler {
            upstream,
            ruz_base,
            window,
            throttle,
            probes: 0,
        }
    }

    /// Total number of probes issued so far.
    pub fn probes(&self) -> usize {
        self.probes
    }

    pub async fn score(&mut self, candidates: &[u64]) -> Vec<(u64, usize)> {
        let mut scores = Vec::with_capacity(candidates.len());
        for &id in candidates {
            if self.probes > 0 && !self.throttle.is_zero() {
                sleep(self.throttle).await;
            }
            self.probes += 1;

            let events = probe_event_count(self.upstream, self.ruz_base, id, &self.window).await;
            tracing::debug!(group_id = id, events, "probed group schedule");
            scores.push((id, events));
        }
        scores
    }

    /// Returns `None` only for an empty candidate list.
    pub async fn pick_live_id(&mut self, candidates: &[u64]) -> Option<u64> {
        let scores = self.score(candidates).await;
        select_live_id(&scores)
    }
}
