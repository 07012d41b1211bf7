//! End-to-end tests for the section pipeline and cache interplay.

use std::cell::Cell;

use anyhow::Result;
use async_trait::async_trait;
use pretty_assertions::assert_eq;
use serde_json::Value;

use awsagent::cache::CacheStore;
use awsagent::section::{
    run_section, ColleagueContents, ComputedContent, RawContent, Section, SectionResult,
};

/// Section stub that counts live fetches.
struct Counting {
    name: String,
    interval: u64,
    colleagues: ColleagueContents,
    fetches: Cell<u32>,
}

impl Counting {
    fn new(name: &str, interval: u64) -> Self {
        Self {
            name: name.to_string(),
            interval,
            colleagues: ColleagueContents::default(),
            fetches: Cell::new(0),
        }
    }
}

#[async_trait(?Send)]
impl Section for Counting {
    fn name(&self) -> &str {
        &self.name
    }
    fn region(&self) -> &str {
        "eu-west-1"
    }
    fn cache_interval(&self) -> u64 {
        self.interval
    }
    fn receive(&mut self, producer: &str, content: &ComputedContent) {
        self.colleagues.insert(producer, content);
    }
    fn colleague_contents(&self) -> &ColleagueContents {
        &self.colleagues
    }
    async fn fetch(&self) -> Result<Value> {
        self.fetches.set(self.fetches.get() + 1);
        Ok(serde_json::json!([{"Id": "fetched"}]))
    }
    fn compute(&self, raw: &RawContent) -> Result<Value> {
        Ok(raw.payload.clone())
    }
    fn results(&self, computed: &ComputedContent) -> Result<Vec<SectionResult>> {
        Ok(vec![SectionResult::for_host(computed.payload.clone())])
    }
}

fn cache() -> (tempfile::TempDir, CacheStore) {
    let dir = tempfile::tempdir().unwrap();
    let store = CacheStore::new(dir.path(), "testhost");
    (dir, store)
}

#[tokio::test]
async fn second_run_within_interval_uses_cache() {
    let (_dir, store) = cache();
    let section = Counting::new("probe", 300);

    let first = run_section(&section, &store, true).await.unwrap();
    assert!(!first.from_cache);
    assert_eq!(section.fetches.get(), 1);

    let second = run_section(&section, &store, true).await.unwrap();
    assert!(second.from_cache);
    assert_eq!(section.fetches.get(), 1);
    assert_eq!(second.computed.payload, first.computed.payload);
}

#[tokio::test]
async fn no_cache_flag_always_fetches() {
    let (_dir, store) = cache();
    let section = Counting::new("probe", 300);

    run_section(&section, &store, false).await.unwrap();
    run_section(&section, &store, false).await.unwrap();
    assert_eq!(section.fetches.get(), 2);
}

#[tokio::test]
async fn newer_colleague_invalidates_cache() {
    let (_dir, store) = cache();
    let mut section = Counting::new("probe", 300);

    run_section(&section, &store, true).await.unwrap();
    assert_eq!(section.fetches.get(), 1);

    // A colleague fetched strictly later than our cache entry.
    section.receive(
        "upstream",
        &ComputedContent {
            payload: serde_json::json!([]),
            timestamp: chrono::Utc::now().timestamp() + 10,
        },
    );
    let rerun = run_section(&section, &store, true).await.unwrap();
    assert!(!rerun.from_cache);
    assert_eq!(section.fetches.get(), 2);
}

#[tokio::test]
async fn zero_interval_sections_never_touch_the_cache() {
    let (dir, store) = cache();
    let section = Counting::new("probe", 0);

    run_section(&section, &store, true).await.unwrap();
    run_section(&section, &store, true).await.unwrap();
    assert_eq!(section.fetches.get(), 2);

    // Nothing was written below the host directory.
    let entries: Vec<_> = std::fs::read_dir(dir.path().join("testhost"))
        .map(|d| d.collect())
        .unwrap_or_default();
    assert!(entries.is_empty());
}

/// Section whose results are empty arrays; they must be dropped, not emitted.
struct Hollow {
    colleagues: ColleagueContents,
}

#[async_trait(?Send)]
impl Section for Hollow {
    fn name(&self) -> &str {
        "hollow"
    }
    fn region(&self) -> &str {
        "eu-west-1"
    }
    fn cache_interval(&self) -> u64 {
        0
    }
    fn receive(&mut self, producer: &str, content: &ComputedContent) {
        self.colleagues.insert(producer, content);
    }
    fn colleague_contents(&self) -> &ColleagueContents {
        &self.colleagues
    }
    async fn fetch(&self) -> Result<Value> {
        Ok(serde_json::json!([]))
    }
    fn compute(&self, raw: &RawContent) -> Result<Value> {
        Ok(raw.payload.clone())
    }
    fn results(&self, computed: &ComputedContent) -> Result<Vec<SectionResult>> {
        Ok(vec![
            SectionResult::for_host(computed.payload.clone()),
            SectionResult::for_piggyback("sub-host", serde_json::json!([])),
        ])
    }
}

#[tokio::test]
async fn falsy_results_are_dropped() {
    let (_dir, store) = cache();
    let section = Hollow {
        colleagues: ColleagueContents::default(),
    };
    let output = run_section(&section, &store, false).await.unwrap();
    assert!(output.results.is_empty());
}
