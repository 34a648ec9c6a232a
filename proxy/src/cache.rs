//! In-memory cache of upstream responses.
//!
//! Only `200 OK` answers are stored, for a single TTL fixed at startup.
//! Concurrent misses for one key share a single upstream call, and failures are
//! never stored, so the request after an error goes upstream again.
//!
//! With stale fallback enabled, every stored response is also copied into a
//! second, longer-lived cache that is consulted only when the upstream fails.

use crate::metrics_defs::{CACHE_HITS, CACHE_MISSES, CACHE_STALE_SERVED};
use axum::body::Bytes;
use http::StatusCode;
use moka::future::Cache;
use shared::counter;
use shared::upstream::{UpstreamError, UpstreamResponse};
use std::future::Future;
use std::time::Duration;

#[derive(Clone, Debug, PartialEq)]
pub struct CachedResponse {
    pub status: StatusCode,
    /// Serialized JSON payload
    pub body: Bytes,
}

impl CachedResponse {
    pub fn from_upstream(response: &UpstreamResponse) -> Result<Self, UpstreamError> {
        let body = serde_json::to_vec(&response.payload)
            .map_err(|e| UpstreamError::InvalidJson(e.to_string()))?;
        Ok(CachedResponse {
            status: response.status,
            body: Bytes::from(body),
        })
    }

    pub fn is_cacheable(&self) -> bool {
        self.status == StatusCode::OK
    }
}

enum FetchFailure {
    Upstream(UpstreamError),
    // Successful, but must not be stored
    Uncacheable(CachedResponse),
}

pub struct ResponseCache {
    fresh: Cache<String, CachedResponse>,
    stale: Option<Cache<String, CachedResponse>>,
}

impl ResponseCache {
    pub fn new(ttl: Duration, max_entries: u64, stale_ttl: Option<Duration>) -> Self {
        let fresh = Cache::builder()
            .max_capacity(max_entries)
            .time_to_live(ttl)
            .build();
        let stale = stale_ttl.map(|stale_ttl| {
            Cache::builder()
                .max_capacity(max_entries)
                .time_to_live(stale_ttl)
                .build()
        });

        ResponseCache { fresh, stale }
    }

    /// Fresh entry for `key`, if any. Expired entries are never returned.
    pub async fn get(&self, key: &str) -> Option<CachedResponse> {
        self.fresh.get(key).await
    }

    /// Stores `response` unless its status is something other than 200.
    pub async fn put(&self, key: &str, response: CachedResponse) {
        if !response.is_cacheable() {
            return;
        }
        if let Some(stale) = &self.stale {
            stale.insert(key.to_string(), response.clone()).await;
        }
        self.fresh.insert(key.to_string(), response).await;
    }

    /// Returns the fresh entry for `key` or runs `fetch` to produce one.
    ///
    /// When several callers miss on the same key at once, only one of them
    /// runs its `fetch`; the others wait for and share its outcome.
    pub async fn get_or_fetch<F>(&self, key: &str, fetch: F) -> Result<CachedResponse, UpstreamError>
    where
        F: Future<Output = Result<UpstreamResponse, UpstreamError>> + Send,
    {
        let init = async {
            let response = match fetch
                .await
                .and_then(|response| CachedResponse::from_upstream(&response))
            {
                Ok(response) => response,
                Err(err) => return Err(FetchFailure::Upstream(err)),
            };
            if !response.is_cacheable() {
                return Err(FetchFailure::Uncacheable(response));
            }
            if let Some(stale) = &self.stale {
                stale.insert(key.to_string(), response.clone()).await;
            }
            Ok(response)
        };

        match self.fresh.entry_by_ref(key).or_try_insert_with(init).await {
            Ok(entry) => {
                if entry.is_fresh() {
                    counter!(CACHE_MISSES).increment(1);
                } else {
                    counter!(CACHE_HITS).increment(1);
                }
                Ok(entry.into_value())
            }
            Err(failure) => {
                counter!(CACHE_MISSES).increment(1);
                match failure.as_ref() {
                    FetchFailure::Uncacheable(response) => Ok(response.clone()),
                    FetchFailure::Upstream(err) => self.stale_or(key, err.clone()).await,
                }
            }
        }
    }

    async fn stale_or(&self, key: &str, err: UpstreamError) -> Result<CachedResponse, UpstreamError> {
        if let Some(stale) = &self.stale
            && let Some(response) = stale.get(key).await
        {
            tracing::warn!(key, error = %err, "upstream failed, serving stale response");
            counter!(CACHE_STALE_SERVED).increment(1);
            return Ok(response);
        }
        Err(err)
    }
}
