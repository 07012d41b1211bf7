//! Lambda sections: function inventory, CloudWatch metrics and the Logs
//! Insights query for memory usage.

use anyhow::Result;
use async_trait::async_trait;
use aws_sdk_cloudwatch as cloudwatch;
use aws_sdk_cloudwatchlogs as logs;
use aws_sdk_lambda as lambda;
use serde_json::Value;

use super::cloudwatch::{fetch_metric_data, run_insights_query, MetricSpec};
use super::ec2::shape_summary_rows;
use super::{colleague_rows, rows_from, section_plumbing, str_of, SectionCore};
use crate::section::{ComputedContent, RawContent, Section, SectionResult};
use crate::tags::{TagFilter, TagImport};

const METRICS: &[MetricSpec] = &[
    MetricSpec::new("AWS/Lambda", "Invocations", "Sum"),
    MetricSpec::new("AWS/Lambda", "Errors", "Sum"),
    MetricSpec::new("AWS/Lambda", "Throttles", "Sum"),
    MetricSpec::new("AWS/Lambda", "Duration", "Average"),
    MetricSpec::new("AWS/Lambda", "ConcurrentExecutions", "Maximum"),
    MetricSpec::new("AWS/Lambda", "DeadLetterErrors", "Sum"),
];

/// Max wall time spent polling one Insights query before giving up.
const INSIGHTS_TIMEOUT_SECS: u64 = 30;

const INSIGHTS_QUERY: &str =
    "filter @type = \"REPORT\" \
     | stats max(@memorySize) as memory_size_max, max(@maxMemoryUsed) as max_memory_used_max \
       by bin(5m)";

fn function_to_json(function: &lambda::types::FunctionConfiguration, tags: Vec<Value>) -> Value {
    let mut json = serde_json::Map::new();
    if let Some(name) = &function.function_name {
        json.insert("FunctionName".to_string(), Value::String(name.clone()));
    }
    if let Some(arn) = &function.function_arn {
        json.insert("FunctionArn".to_string(), Value::String(arn.clone()));
    }
    if let Some(runtime) = &function.runtime {
        json.insert(
            "Runtime".to_string(),
            Value::String(runtime.as_str().to_string()),
        );
    }
    if let Some(memory) = function.memory_size {
        json.insert("MemorySize".to_string(), Value::Number(memory.into()));
    }
    if let Some(timeout) = function.timeout {
        json.insert("Timeout".to_string(), Value::Number(timeout.into()));
    }
    json.insert("Tags".to_string(), Value::Array(tags));
    Value::Object(json)
}

pub struct LambdaSummary {
    core: SectionCore,
    client: lambda::Client,
    names: Vec<String>,
    tag_filter: Option<TagFilter>,
    tag_import: TagImport,
}

impl LambdaSummary {
    pub fn new(
        config: &aws_types::SdkConfig,
        region: &str,
        names: Vec<String>,
        tag_filter: Option<TagFilter>,
        tag_import: TagImport,
    ) -> Self {
        Self {
            core: SectionCore::new("lambda_summary", region, 300),
            client: lambda::Client::new(config),
            names,
            tag_filter,
            tag_import,
        }
    }
}

#[async_trait(?Send)]
impl Section for LambdaSummary {
    section_plumbing!();

    async fn fetch(&self) -> Result<Value> {
        let mut functions = Vec::new();
        let mut paginator = self.client.list_functions().into_paginator().send();
        while let Some(page) = paginator.next().await {
            let page = page?;
            for function in page.functions.unwrap_or_default() {
                // Lambda tags come from a separate API, keyed by ARN.
                let tags = match &function.function_arn {
                    Some(arn) => match self.client.list_tags().resource(arn).send().await {
                        Ok(response) => response
                            .tags
                            .unwrap_or_default()
                            .into_iter()
                            .map(|(k, v)| serde_json::json!({"Key": k, "Value": v}))
                            .collect(),
                        Err(_) => Vec::new(),
                    },
                    None => Vec::new(),
                };
                functions.push(function_to_json(&function, tags));
            }
        }
        Ok(Value::Array(functions))
    }

    fn compute(&self, raw: &RawContent) -> Result<Value> {
        let rows = rows_from(&self.core.colleagues, &raw.payload);
        Ok(Value::Array(shape_summary_rows(
            rows,
            "FunctionName",
            &self.names,
            &self.tag_filter,
            &self.tag_import,
        )))
    }

    fn results(&self, computed: &ComputedContent) -> Result<Vec<SectionResult>> {
        Ok(vec![SectionResult::for_host(computed.payload.clone())])
    }
}

pub struct LambdaMetrics {
    core: SectionCore,
    client: cloudwatch::Client,
}

impl LambdaMetrics {
    pub fn new(config: &aws_types::SdkConfig, region: &str) -> Self {
        Self {
            core: SectionCore::new("lambda", region, 0),
            client: cloudwatch::Client::new(config),
        }
    }
}

#[async_trait(?Send)]
impl Section for LambdaMetrics {
    section_plumbing!();

    async fn fetch(&self) -> Result<Value> {
        let resources: Vec<(String, String)> =
            colleague_rows(&self.core.colleagues, "lambda_summary")
                .iter()
                .map(|row| {
                    let name = str_of(row, "FunctionName").to_string();
                    (name.clone(), name)
                })
                .collect();
        let rows =
            fetch_metric_data(&self.client, "FunctionName", &resources, METRICS, 600).await?;
        Ok(Value::Array(rows))
    }

    fn compute(&self, raw: &RawContent) -> Result<Value> {
        Ok(raw.payload.clone())
    }

    fn results(&self, computed: &ComputedContent) -> Result<Vec<SectionResult>> {
        Ok(vec![SectionResult::for_host(computed.payload.clone())])
    }
}

/// Memory usage per function via a Logs Insights query against the functions'
/// log groups. The only busy-wait in the agent: poll the query status with a
/// fixed sleep until completion or the deadline.
pub struct LambdaInsights {
    core: SectionCore,
    client: logs::Client,
}

impl LambdaInsights {
    pub fn new(config: &aws_types::SdkConfig, region: &str) -> Self {
        Self {
            core: SectionCore::new("lambda_cloudwatch_insights", region, 0),
            client: logs::Client::new(config),
        }
    }
}

#[async_trait(?Send)]
impl Section for LambdaInsights {
    section_plumbing!();

    async fn fetch(&self) -> Result<Value> {
        let log_groups: Vec<String> = colleague_rows(&self.core.colleagues, "lambda_summary")
            .iter()
            .map(|row| format!("/aws/lambda/{}", str_of(row, "FunctionName")))
            .collect();
        let rows = run_insights_query(
            &self.client,
            &log_groups,
            INSIGHTS_QUERY,
            600,
            INSIGHTS_TIMEOUT_SECS,
        )
        .await?;
        Ok(Value::Array(rows))
    }

    fn compute(&self, raw: &RawContent) -> Result<Value> {
        Ok(raw.payload.clone())
    }

    fn results(&self, computed: &ComputedContent) -> Result<Vec<SectionResult>> {
        Ok(vec![SectionResult::for_host(computed.payload.clone())])
    }
}
