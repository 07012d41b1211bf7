//! RDS sections: DB instance inventory and CloudWatch metrics.

use anyhow::Result;
use async_trait::async_trait;
use aws_sdk_cloudwatch as cloudwatch;
use aws_sdk_rds as rds;
use serde_json::Value;

use super::cloudwatch::{fetch_metric_data, MetricSpec};
use super::ec2::shape_summary_rows;
use super::{colleague_rows, rows_from, section_plumbing, str_of, SectionCore};
use crate::section::{ComputedContent, RawContent, Section, SectionResult};
use crate::tags::{TagFilter, TagImport};

const METRICS: &[MetricSpec] = &[
    MetricSpec::new("AWS/RDS", "CPUUtilization", "Average"),
    MetricSpec::new("AWS/RDS", "DatabaseConnections", "Average"),
    MetricSpec::new("AWS/RDS", "FreeableMemory", "Average"),
    MetricSpec::new("AWS/RDS", "FreeStorageSpace", "Average"),
    MetricSpec::new("AWS/RDS", "ReadIOPS", "Average"),
    MetricSpec::new("AWS/RDS", "WriteIOPS", "Average"),
    MetricSpec::new("AWS/RDS", "ReadLatency", "Average"),
    MetricSpec::new("AWS/RDS", "WriteLatency", "Average"),
    MetricSpec::new("AWS/RDS", "BurstBalance", "Average"),
];

fn db_instance_to_json(db: &rds::types::DbInstance) -> Value {
    let mut json = serde_json::Map::new();
    if let Some(id) = &db.db_instance_identifier {
        json.insert("DBInstanceIdentifier".to_string(), Value::String(id.clone()));
    }
    if let Some(class) = &db.db_instance_class {
        json.insert("DBInstanceClass".to_string(), Value::String(class.clone()));
    }
    if let Some(engine) = &db.engine {
        json.insert("Engine".to_string(), Value::String(engine.clone()));
    }
    if let Some(status) = &db.db_instance_status {
        json.insert("DBInstanceStatus".to_string(), Value::String(status.clone()));
    }
    if let Some(storage) = db.allocated_storage {
        json.insert("AllocatedStorage".to_string(), Value::Number(storage.into()));
    }
    if let Some(multi_az) = db.multi_az {
        json.insert("MultiAZ".to_string(), Value::Bool(multi_az));
    }
    if let Some(az) = &db.availability_zone {
        json.insert("AvailabilityZone".to_string(), Value::String(az.clone()));
    }
    let tags: Vec<Value> = db
        .tag_list
        .clone()
        .unwrap_or_default()
        .iter()
        .filter_map(|t| {
            Some(serde_json::json!({
                "Key": t.key.clone()?,
                "Value": t.value.clone()?,
            }))
        })
        .collect();
    json.insert("Tags".to_string(), Value::Array(tags));
    Value::Object(json)
}

pub struct RdsSummary {
    core: SectionCore,
    client: rds::Client,
    names: Vec<String>,
    tag_filter: Option<TagFilter>,
    tag_import: TagImport,
}

impl RdsSummary {
    pub fn new(
        config: &aws_types::SdkConfig,
        region: &str,
        names: Vec<String>,
        tag_filter: Option<TagFilter>,
        tag_import: TagImport,
    ) -> Self {
        Self {
            core: SectionCore::new("rds_summary", region, 300),
            client: rds::Client::new(config),
            names,
            tag_filter,
            tag_import,
        }
    }
}

#[async_trait(?Send)]
impl Section for RdsSummary {
    section_plumbing!();

    async fn fetch(&self) -> Result<Value> {
        let mut instances = Vec::new();
        let mut paginator = self.client.describe_db_instances().into_paginator().send();
        while let Some(page) = paginator.next().await {
            let page = page?;
            for db in page.db_instances.unwrap_or_default() {
                instances.push(db_instance_to_json(&db));
            }
        }
        Ok(Value::Array(instances))
    }

    fn compute(&self, raw: &RawContent) -> Result<Value> {
        let rows = rows_from(&self.core.colleagues, &raw.payload);
        Ok(Value::Array(shape_summary_rows(
            rows,
            "DBInstanceIdentifier",
            &self.names,
            &self.tag_filter,
            &self.tag_import,
        )))
    }

    fn results(&self, computed: &ComputedContent) -> Result<Vec<SectionResult>> {
        Ok(vec![SectionResult::for_host(computed.payload.clone())])
    }
}

pub struct RdsMetrics {
    core: SectionCore,
    client: cloudwatch::Client,
}

impl RdsMetrics {
    pub fn new(config: &aws_types::SdkConfig, region: &str) -> Self {
        Self {
            core: SectionCore::new("rds", region, 0),
            client: cloudwatch::Client::new(config),
        }
    }
}

#[async_trait(?Send)]
impl Section for RdsMetrics {
    section_plumbing!();

    async fn fetch(&self) -> Result<Value> {
        let resources: Vec<(String, String)> =
            colleague_rows(&self.core.colleagues, "rds_summary")
                .iter()
                .map(|row| {
                    let id = str_of(row, "DBInstanceIdentifier").to_string();
                    (id.clone(), id)
                })
                .collect();
        let rows = fetch_metric_data(
            &self.client,
            "DBInstanceIdentifier",
            &resources,
            METRICS,
            600,
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
