//! The section contract and its run pipeline.
//!
//! A section is one unit of AWS collection work. Per invocation it walks a
//! fixed pipeline: gather colleague contents, fetch live or cached raw data,
//! compute content (merging colleague data back in, even over cached raw
//! data), hand the computed content to the distributor, then shape and
//! validate result rows. Sections never catch their own errors; the
//! orchestrator decides what a failure means.

use std::collections::BTreeMap;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tracing::debug;

use crate::cache::CacheStore;

/// Payload plus fetch timestamp, owned by the section that fetched it.
#[derive(Debug, Clone)]
pub struct RawContent {
    pub payload: Value,
    pub timestamp: i64,
}

/// Merged payload delivered downstream and turned into result rows.
#[derive(Debug, Clone)]
pub struct ComputedContent {
    pub payload: Value,
    pub timestamp: i64,
}

/// What a section receives from upstream producers via the distributor.
///
/// `max_timestamp` is the newest timestamp among all contributors; a locally
/// cached value is stale if any colleague is newer than it.
#[derive(Debug, Clone, Default)]
pub struct ColleagueContents {
    pub contents: BTreeMap<String, Value>,
    pub max_timestamp: Option<i64>,
}

impl ColleagueContents {
    pub fn insert(&mut self, producer: &str, content: &ComputedContent) {
        self.contents
            .insert(producer.to_string(), content.payload.clone());
        self.max_timestamp = Some(match self.max_timestamp {
            Some(ts) => ts.max(content.timestamp),
            None => content.timestamp,
        });
    }

    pub fn get(&self, producer: &str) -> Option<&Value> {
        self.contents.get(producer)
    }

    /// True if a cache written at `cache_timestamp` is still usable against
    /// these colleagues.
    pub fn cache_is_current(&self, cache_timestamp: i64) -> bool {
        match self.max_timestamp {
            Some(ts) => ts <= cache_timestamp,
            None => true,
        }
    }
}

/// One output unit of a section run.
#[derive(Debug, Clone)]
pub struct SectionResult {
    /// Empty string targets the main host; anything else is a piggyback host.
    pub piggyback_host: String,
    /// Array or object; anything else fails validation.
    pub payload: Value,
    /// Host labels contributed to the piggyback target.
    pub labels: BTreeMap<String, String>,
}

impl SectionResult {
    pub fn for_host(payload: Value) -> Self {
        Self {
            piggyback_host: String::new(),
            payload,
            labels: BTreeMap::new(),
        }
    }

    pub fn for_piggyback(host: impl Into<String>, payload: Value) -> Self {
        Self {
            piggyback_host: host.into(),
            payload,
            labels: BTreeMap::new(),
        }
    }

    pub fn with_labels(mut self, labels: BTreeMap<String, String>) -> Self {
        self.labels = labels;
        self
    }

    /// Falsy payloads are dropped rather than emitted.
    pub fn is_empty(&self) -> bool {
        match &self.payload {
            Value::Null => true,
            Value::Array(a) => a.is_empty(),
            Value::Object(o) => o.is_empty(),
            _ => false,
        }
    }

    fn validate(&self) -> Result<()> {
        if !self.payload.is_array() && !self.payload.is_object() {
            bail!(
                "section result for host {:?} is neither array nor object",
                self.piggyback_host
            );
        }
        Ok(())
    }
}

/// One AWS collection unit.
///
/// Implementations only provide the declarative bits; the pipeline itself
/// lives in [`run_section`]. Futures are not `Send` on purpose: sections run
/// strictly sequentially on a current-thread runtime.
#[async_trait(?Send)]
pub trait Section {
    /// Distribution key, unique within one run. Emitted as `aws_<name>`.
    fn name(&self) -> &str;

    /// Region this section instance collects for (global sections report the
    /// region their API endpoint lives in).
    fn region(&self) -> &str;

    /// Seconds a cached fetch stays usable. Zero disables caching; intervals
    /// above 60 get the `cached(...)` header annotation.
    fn cache_interval(&self) -> u64;

    /// Record content pushed by an upstream producer.
    fn receive(&mut self, producer: &str, content: &ComputedContent);

    /// The colleague contents accumulated so far.
    fn colleague_contents(&self) -> &ColleagueContents;

    /// Fetch live data from AWS.
    async fn fetch(&self) -> Result<Value>;

    /// Merge raw data with colleague contents. Invoked on every run, cached
    /// raw data included.
    fn compute(&self, raw: &RawContent) -> Result<Value>;

    /// Shape the computed content into result rows.
    fn results(&self, computed: &ComputedContent) -> Result<Vec<SectionResult>>;
}

/// Everything the orchestrator needs from one completed section run.
pub struct SectionOutput {
    pub name: String,
    pub cache_interval: u64,
    pub from_cache: bool,
    pub timestamp: i64,
    pub computed: ComputedContent,
    pub results: Vec<SectionResult>,
}

/// Drive one section through the full pipeline.
///
/// The fetch stage is skipped when caching was requested, a cache entry
/// exists, and no colleague is newer than it. Compute always runs.
pub async fn run_section(
    section: &dyn Section,
    cache: &CacheStore,
    use_cache: bool,
) -> Result<SectionOutput> {
    let name = section.name().to_string();
    let colleagues = section.colleague_contents();

    let cacheable = section.cache_interval() > 0;
    let mut from_cache = false;

    let raw = if cacheable && use_cache {
        match cache.read(&name, section.region())? {
            Some(entry)
                if entry.is_valid(section.cache_interval())
                    && colleagues.cache_is_current(entry.timestamp) =>
            {
                debug!(section = %name, "using cached raw content");
                from_cache = true;
                RawContent {
                    payload: entry.payload,
                    timestamp: entry.timestamp,
                }
            }
            _ => fetch_live(section, cache, cacheable).await?,
        }
    } else {
        fetch_live(section, cache, cacheable).await?
    };

    let computed = ComputedContent {
        payload: section.compute(&raw)?,
        timestamp: raw.timestamp,
    };

    let mut results = section.results(&computed)?;
    // Falsy results are silently dropped, never emitted.
    results.retain(|r| !r.is_empty());
    for result in &results {
        result.validate()?;
    }

    Ok(SectionOutput {
        name,
        cache_interval: section.cache_interval(),
        from_cache,
        timestamp: raw.timestamp,
        computed,
        results,
    })
}

async fn fetch_live(
    section: &dyn Section,
    cache: &CacheStore,
    cacheable: bool,
) -> Result<RawContent> {
    debug!(section = %section.name(), region = %section.region(), "fetching live data");
    let payload = section.fetch().await?;
    let raw = RawContent {
        payload,
        timestamp: Utc::now().timestamp(),
    };
    if cacheable {
        cache.write(section.name(), section.region(), &raw.payload, raw.timestamp)?;
    }
    Ok(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_colleague_max_timestamp() {
        let mut colleagues = ColleagueContents::default();
        colleagues.insert(
            "a",
            &ComputedContent {
                payload: Value::Null,
                timestamp: 100,
            },
        );
        colleagues.insert(
            "b",
            &ComputedContent {
                payload: Value::Null,
                timestamp: 250,
            },
        );
        assert_eq!(colleagues.max_timestamp, Some(250));
    }

    #[test]
    fn test_cache_stale_when_any_colleague_newer() {
        let mut colleagues = ColleagueContents::default();
        colleagues.insert(
            "a",
            &ComputedContent {
                payload: Value::Null,
                timestamp: 100,
            },
        );
        assert!(colleagues.cache_is_current(100));
        assert!(colleagues.cache_is_current(150));
        assert!(!colleagues.cache_is_current(99));
    }

    #[test]
    fn test_no_colleagues_never_invalidate() {
        let colleagues = ColleagueContents::default();
        assert!(colleagues.cache_is_current(0));
    }

    #[test]
    fn test_empty_results_detected() {
        assert!(SectionResult::for_host(Value::Array(vec![])).is_empty());
        assert!(SectionResult::for_host(serde_json::json!({})).is_empty());
        assert!(!SectionResult::for_host(serde_json::json!([{"Id": 1}])).is_empty());
    }

    #[test]
    fn test_scalar_payload_fails_validation() {
        let result = SectionResult::for_host(serde_json::json!("just a string"));
        assert!(result.validate().is_err());
    }
}
