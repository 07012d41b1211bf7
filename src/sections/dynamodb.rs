//! DynamoDB sections: table inventory and capacity metrics.

use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;
use aws_sdk_cloudwatch as cloudwatch;
use aws_sdk_dynamodb as dynamodb;
use serde_json::Value;

use super::cloudwatch::{fetch_metric_data, MetricSpec};
use super::ec2::shape_summary_rows;
use super::{colleague_rows, rows_from, section_plumbing, str_of, SectionCore};
use crate::section::{ComputedContent, RawContent, Section, SectionResult};
use crate::tags::{TagFilter, TagImport};

const METRICS: &[MetricSpec] = &[
    MetricSpec::new("AWS/DynamoDB", "ConsumedReadCapacityUnits", "Sum"),
    MetricSpec::new("AWS/DynamoDB", "ConsumedWriteCapacityUnits", "Sum"),
    MetricSpec::new("AWS/DynamoDB", "ReadThrottleEvents", "Sum"),
    MetricSpec::new("AWS/DynamoDB", "WriteThrottleEvents", "Sum"),
    MetricSpec::new("AWS/DynamoDB", "SuccessfulRequestLatency", "Average"),
];

pub struct DynamodbSummary {
    core: SectionCore,
    client: dynamodb::Client,
    names: Vec<String>,
    tag_filter: Option<TagFilter>,
    tag_import: TagImport,
}

impl DynamodbSummary {
    pub fn new(
        config: &aws_types::SdkConfig,
        region: &str,
        names: Vec<String>,
        tag_filter: Option<TagFilter>,
        tag_import: TagImport,
    ) -> Self {
        Self {
            core: SectionCore::new("dynamodb_summary", region, 300),
            client: dynamodb::Client::new(config),
            names,
            tag_filter,
            tag_import,
        }
    }

    async fn table_to_json(&self, name: &str) -> Result<Value> {
        let response = self.client.describe_table().table_name(name).send().await?;
        let mut json = serde_json::Map::new();
        json.insert("TableName".to_string(), Value::String(name.to_string()));
        if let Some(table) = response.table {
            if let Some(status) = &table.table_status {
                json.insert(
                    "TableStatus".to_string(),
                    Value::String(status.as_str().to_string()),
                );
            }
            if let Some(items) = table.item_count {
                json.insert("ItemCount".to_string(), Value::Number(items.into()));
            }
            if let Some(size) = table.table_size_bytes {
                json.insert("TableSizeBytes".to_string(), Value::Number(size.into()));
            }
            if let Some(throughput) = &table.provisioned_throughput {
                if let Some(read) = throughput.read_capacity_units {
                    json.insert("ReadCapacityUnits".to_string(), Value::Number(read.into()));
                }
                if let Some(write) = throughput.write_capacity_units {
                    json.insert("WriteCapacityUnits".to_string(), Value::Number(write.into()));
                }
            }
            // Table tags are keyed by ARN through a separate call.
            let tags: Vec<Value> = match &table.table_arn {
                Some(arn) => match self
                    .client
                    .list_tags_of_resource()
                    .resource_arn(arn)
                    .send()
                    .await
                {
                    Ok(response) => response
                        .tags
                        .unwrap_or_default()
                        .into_iter()
                        .map(|t| serde_json::json!({"Key": t.key, "Value": t.value}))
                        .collect(),
                    Err(_) => Vec::new(),
                },
                None => Vec::new(),
            };
            json.insert("Tags".to_string(), Value::Array(tags));
        }
        Ok(Value::Object(json))
    }
}

#[async_trait(?Send)]
impl Section for DynamodbSummary {
    section_plumbing!();

    async fn fetch(&self) -> Result<Value> {
        let mut names = Vec::new();
        let mut paginator = self.client.list_tables().into_paginator().send();
        while let Some(page) = paginator.next().await {
            let page = page?;
            names.extend(page.table_names.unwrap_or_default());
        }

        let mut tables = Vec::new();
        for name in names {
            tables.push(self.table_to_json(&name).await?);
        }
        Ok(Value::Array(tables))
    }

    fn compute(&self, raw: &RawContent) -> Result<Value> {
        let rows = rows_from(&self.core.colleagues, &raw.payload);
        Ok(Value::Array(shape_summary_rows(
            rows,
            "TableName",
            &self.names,
            &self.tag_filter,
            &self.tag_import,
        )))
    }

    fn results(&self, computed: &ComputedContent) -> Result<Vec<SectionResult>> {
        Ok(vec![SectionResult::for_host(computed.payload.clone())])
    }
}

pub struct DynamodbTable {
    core: SectionCore,
    client: cloudwatch::Client,
}

impl DynamodbTable {
    pub fn new(config: &aws_types::SdkConfig, region: &str) -> Self {
        Self {
            core: SectionCore::new("dynamodb_table", region, 0),
            client: cloudwatch::Client::new(config),
        }
    }
}

#[async_trait(?Send)]
impl Section for DynamodbTable {
    section_plumbing!();

    async fn fetch(&self) -> Result<Value> {
        let resources: Vec<(String, String)> =
            colleague_rows(&self.core.colleagues, "dynamodb_summary")
                .iter()
                .map(|row| {
                    let name = str_of(row, "TableName").to_string();
                    (name.clone(), name)
                })
                .collect();
        let rows = fetch_metric_data(&self.client, "TableName", &resources, METRICS, 600).await?;
        Ok(Value::Array(rows))
    }

    fn compute(&self, raw: &RawContent) -> Result<Value> {
        Ok(raw.payload.clone())
    }

    fn results(&self, computed: &ComputedContent) -> Result<Vec<SectionResult>> {
        // One piggyback block per table, named after the table.
        let mut per_host: BTreeMap<String, Vec<Value>> = BTreeMap::new();
        for row in computed.payload.as_array().unwrap_or(&Vec::new()) {
            let label = str_of(row, "Label");
            let table = label.split(' ').next().unwrap_or(label);
            per_host
                .entry(format!("{}_{}", self.core.region, table))
                .or_default()
                .push(row.clone());
        }
        Ok(per_host
            .into_iter()
            .map(|(host, rows)| SectionResult::for_piggyback(host, Value::Array(rows)))
            .collect())
    }
}
