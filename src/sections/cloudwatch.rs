//! Shared CloudWatch plumbing for the metric sections.
//!
//! Every metrics section boils down to the same GetMetricData call: one query
//! per (resource, metric) pair, a fixed look-back window, and a reshape of the
//! results into JSON rows. The Logs Insights poller for Lambda lives here too.

use anyhow::{Context, Result};
use aws_sdk_cloudwatch as cloudwatch;
use aws_sdk_cloudwatch::types::{Dimension, Metric, MetricDataQuery, MetricStat};
use aws_sdk_cloudwatchlogs as logs;
use aws_sdk_cloudwatchlogs::types::QueryStatus;
use chrono::Utc;
use serde_json::Value;
use tracing::{debug, warn};

/// One metric to collect for every resource of a section.
#[derive(Debug, Clone)]
pub struct MetricSpec {
    pub namespace: &'static str,
    pub metric_name: &'static str,
    pub stat: &'static str,
}

impl MetricSpec {
    pub const fn new(namespace: &'static str, metric_name: &'static str, stat: &'static str) -> Self {
        Self {
            namespace,
            metric_name,
            stat,
        }
    }
}

/// Fetch `specs` for every `(dimension value, label)` resource over the last
/// `period` seconds. Returns one row per metric data result:
/// `{"Id", "Label", "Timestamps", "Values"}`.
pub async fn fetch_metric_data(
    client: &cloudwatch::Client,
    dimension_name: &str,
    resources: &[(String, String)],
    specs: &[MetricSpec],
    period: i64,
) -> Result<Vec<Value>> {
    if resources.is_empty() {
        return Ok(Vec::new());
    }

    let mut queries = Vec::new();
    for (res_idx, (dimension_value, label)) in resources.iter().enumerate() {
        for (spec_idx, spec) in specs.iter().enumerate() {
            let dimension = Dimension::builder()
                .name(dimension_name)
                .value(dimension_value)
                .build();
            let metric = Metric::builder()
                .namespace(spec.namespace)
                .metric_name(spec.metric_name)
                .dimensions(dimension)
                .build();
            let stat = MetricStat::builder()
                .metric(metric)
                .period(period as i32)
                .stat(spec.stat)
                .build();
            queries.push(
                MetricDataQuery::builder()
                    // Query ids must start with a lowercase letter.
                    .id(format!("id_{}_{}", res_idx, spec_idx))
                    .label(format!("{} {}", label, spec.metric_name))
                    .metric_stat(stat)
                    .build(),
            );
        }
    }

    let now = Utc::now().timestamp();
    let start = aws_smithy_types::DateTime::from_secs(now - period);
    let end = aws_smithy_types::DateTime::from_secs(now);

    let mut rows = Vec::new();
    // GetMetricData accepts at most 500 queries per call.
    for chunk in queries.chunks(500) {
        let response = client
            .get_metric_data()
            .start_time(start)
            .end_time(end)
            .set_metric_data_queries(Some(chunk.to_vec()))
            .send()
            .await
            .context("GetMetricData failed")?;

        for result in response.metric_data_results.unwrap_or_default() {
            let timestamps: Vec<i64> = result
                .timestamps
                .unwrap_or_default()
                .iter()
                .map(|t| t.secs())
                .collect();
            rows.push(serde_json::json!({
                "Id": result.id,
                "Label": result.label,
                "Timestamps": timestamps,
                "Values": result.values.unwrap_or_default(),
            }));
        }
    }
    debug!(rows = rows.len(), "metric data fetched");
    Ok(rows)
}

/// How long the Insights poller waits between get_query_results calls.
const INSIGHTS_POLL_INTERVAL_SECS: u64 = 1;

/// StartQuery accepts at most this many log groups per query.
const MAX_LOG_GROUPS_PER_QUERY: usize = 50;

/// Run a Logs Insights query over `log_groups` and merge the rows.
///
/// The query is issued once per batch of [`MAX_LOG_GROUPS_PER_QUERY`] log
/// groups; each batch busy-polls until completion or `timeout_secs`. On
/// timeout the query is abandoned with a warning and an empty result set; the
/// next poll cycle simply tries again.
pub async fn run_insights_query(
    client: &logs::Client,
    log_groups: &[String],
    query: &str,
    lookback_secs: i64,
    timeout_secs: u64,
) -> Result<Vec<Value>> {
    let mut rows = Vec::new();
    for batch in log_groups.chunks(MAX_LOG_GROUPS_PER_QUERY) {
        rows.extend(query_batch(client, batch, query, lookback_secs, timeout_secs).await?);
    }
    Ok(rows)
}

async fn query_batch(
    client: &logs::Client,
    log_groups: &[String],
    query: &str,
    lookback_secs: i64,
    timeout_secs: u64,
) -> Result<Vec<Value>> {
    let now = Utc::now().timestamp();
    let response = client
        .start_query()
        .set_log_group_names(Some(log_groups.to_vec()))
        .start_time(now - lookback_secs)
        .end_time(now)
        .query_string(query)
        .send()
        .await
        .context("StartQuery failed")?;
    let Some(query_id) = response.query_id else {
        return Ok(Vec::new());
    };

    let deadline = Utc::now().timestamp() + timeout_secs as i64;
    loop {
        let results = client
            .get_query_results()
            .query_id(&query_id)
            .send()
            .await
            .context("GetQueryResults failed")?;

        match results.status {
            Some(QueryStatus::Complete) => {
                let rows = results
                    .results
                    .unwrap_or_default()
                    .into_iter()
                    .map(|fields| {
                        let mut row = serde_json::Map::new();
                        for field in fields {
                            if let (Some(k), Some(v)) = (field.field, field.value) {
                                row.insert(k, Value::String(v));
                            }
                        }
                        Value::Object(row)
                    })
                    .collect();
                return Ok(rows);
            }
            Some(QueryStatus::Failed) | Some(QueryStatus::Cancelled) => {
                warn!(query_id, "Insights query did not complete");
                return Ok(Vec::new());
            }
            _ => {}
        }

        if Utc::now().timestamp() >= deadline {
            warn!(query_id, timeout_secs, "Insights query timed out, giving up");
            return Ok(Vec::new());
        }
        tokio::time::sleep(std::time::Duration::from_secs(INSIGHTS_POLL_INTERVAL_SECS)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_groups_are_batched_within_the_query_limit() {
        let groups: Vec<String> = (0..120).map(|i| format!("/aws/lambda/fn-{}", i)).collect();
        let batches: Vec<&[String]> = groups.chunks(MAX_LOG_GROUPS_PER_QUERY).collect();
        assert_eq!(batches.len(), 3);
        assert!(batches.iter().all(|b| b.len() <= MAX_LOG_GROUPS_PER_QUERY));
        let total: usize = batches.iter().map(|b| b.len()).sum();
        assert_eq!(total, groups.len());
    }
}
