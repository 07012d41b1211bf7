//! One module per AWS capability.
//!
//! Every service follows the same split the agent protocol expects: a summary
//! section doing the Describe/List inventory calls, and downstream sections
//! (metrics, labels, limits) that consume the summary via the distributor
//! instead of re-fetching.

pub mod cloudwatch;
pub mod dynamodb;
pub mod ebs;
pub mod ec2;
pub mod ecs;
pub mod elb;
pub mod elbv2;
pub mod lambda;
pub mod rds;
pub mod s3;
pub mod wafv2;

use serde_json::Value;
use tracing::info;

use crate::section::ColleagueContents;

/// The declarative identity shared by every section implementation.
pub struct SectionCore {
    pub name: String,
    pub region: String,
    pub cache_interval: u64,
    pub colleagues: ColleagueContents,
}

impl SectionCore {
    pub fn new(name: &str, region: &str, cache_interval: u64) -> Self {
        Self {
            name: name.to_string(),
            region: region.to_string(),
            cache_interval,
            colleagues: ColleagueContents::default(),
        }
    }
}

/// Delegate the [`crate::section::Section`] plumbing to an embedded
/// [`SectionCore`] field named `core`.
macro_rules! section_plumbing {
    () => {
        fn name(&self) -> &str {
            &self.core.name
        }
        fn region(&self) -> &str {
            &self.core.region
        }
        fn cache_interval(&self) -> u64 {
            self.core.cache_interval
        }
        fn receive(&mut self, producer: &str, content: &crate::section::ComputedContent) {
            self.core.colleagues.insert(producer, content);
        }
        fn colleague_contents(&self) -> &crate::section::ColleagueContents {
            &self.core.colleagues
        }
    };
}
pub(crate) use section_plumbing;

/// Rows of one producer's colleague content. A producer that never delivered
/// (or delivered something that is not an array) counts as "feature absent".
pub fn colleague_rows(colleagues: &ColleagueContents, producer: &str) -> Vec<Value> {
    match colleagues.get(producer) {
        Some(Value::Array(rows)) => rows.clone(),
        Some(_) | None => {
            info!(producer, "no colleague content, treating as absent");
            Vec::new()
        }
    }
}

/// Inventory rows for a summary section: prefer whatever colleagues supplied,
/// fall back to the freshly fetched payload. Either way the caller's filters
/// apply afterwards, so the result set is the same for both paths.
pub fn rows_from(colleagues: &ColleagueContents, raw: &Value) -> Vec<Value> {
    let supplied: Vec<Value> = colleagues
        .contents
        .values()
        .filter_map(|v| v.as_array())
        .flatten()
        .cloned()
        .collect();
    if !supplied.is_empty() {
        return supplied;
    }
    raw.as_array().cloned().unwrap_or_default()
}

/// Keep only rows whose `key` value appears in `names`. An empty filter keeps
/// everything.
pub fn filter_by_names(rows: Vec<Value>, key: &str, names: &[String]) -> Vec<Value> {
    if names.is_empty() {
        return rows;
    }
    rows.into_iter()
        .filter(|row| {
            row.get(key)
                .and_then(|v| v.as_str())
                .map(|name| names.iter().any(|n| n == name))
                .unwrap_or(false)
        })
        .collect()
}

/// Extract the string value under `key`, or a placeholder for rows the API
/// returned without one.
pub fn str_of<'a>(row: &'a Value, key: &str) -> &'a str {
    row.get(key).and_then(|v| v.as_str()).unwrap_or("unknown")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::section::ComputedContent;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_filter_by_names_is_an_intersection() {
        let rows = vec![
            serde_json::json!({"ClusterName": "cluster-test1"}),
            serde_json::json!({"ClusterName": "cluster-test2"}),
        ];
        let filtered = filter_by_names(rows.clone(), "ClusterName", &["cluster-test1".into()]);
        assert_eq!(filtered.len(), 1);
        assert_eq!(str_of(&filtered[0], "ClusterName"), "cluster-test1");

        // Names not present in the inventory never materialize.
        let filtered = filter_by_names(rows.clone(), "ClusterName", &["cluster-test9".into()]);
        assert!(filtered.is_empty());

        // Empty filter keeps everything.
        assert_eq!(filter_by_names(rows.clone(), "ClusterName", &[]).len(), 2);
    }

    #[test]
    fn test_rows_from_prefers_colleague_data() {
        let mut colleagues = ColleagueContents::default();
        colleagues.insert(
            "upstream",
            &ComputedContent {
                payload: serde_json::json!([{"Id": "from-colleague"}]),
                timestamp: 1,
            },
        );
        let raw = serde_json::json!([{"Id": "from-fetch"}]);

        let rows = rows_from(&colleagues, &raw);
        assert_eq!(str_of(&rows[0], "Id"), "from-colleague");

        let rows = rows_from(&ColleagueContents::default(), &raw);
        assert_eq!(str_of(&rows[0], "Id"), "from-fetch");
    }

    #[test]
    fn test_missing_colleague_is_absent_feature() {
        let colleagues = ColleagueContents::default();
        assert!(colleague_rows(&colleagues, "ec2_summary").is_empty());
    }
}
