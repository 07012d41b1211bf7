//! S3 sections.
//!
//! Bucket listing is account-wide, so `s3_summary` runs exactly once and is
//! fanned out through the global distributor to the per-region metric
//! sections, which keep only the buckets homed in their own region.

use anyhow::Result;
use async_trait::async_trait;
use aws_sdk_cloudwatch as cloudwatch;
use aws_sdk_s3 as s3;
use serde_json::Value;
use tracing::info;

use super::cloudwatch::{fetch_metric_data, MetricSpec};
use super::ec2::shape_summary_rows;
use super::{colleague_rows, rows_from, section_plumbing, str_of, SectionCore};
use crate::section::{ComputedContent, RawContent, Section, SectionResult};
use crate::tags::{TagFilter, TagImport};

const METRICS: &[MetricSpec] = &[
    MetricSpec::new("AWS/S3", "BucketSizeBytes", "Average"),
    MetricSpec::new("AWS/S3", "NumberOfObjects", "Average"),
];

pub struct S3Summary {
    core: SectionCore,
    client: s3::Client,
    names: Vec<String>,
    tag_filter: Option<TagFilter>,
    tag_import: TagImport,
}

impl S3Summary {
    pub fn new(
        config: &aws_types::SdkConfig,
        names: Vec<String>,
        tag_filter: Option<TagFilter>,
        tag_import: TagImport,
    ) -> Self {
        Self {
            core: SectionCore::new("s3_summary", crate::credentials::GLOBAL_REGION, 86400),
            client: s3::Client::new(config),
            names,
            tag_filter,
            tag_import,
        }
    }

    async fn bucket_to_json(&self, bucket: &s3::types::Bucket) -> Option<Value> {
        let name = bucket.name.clone()?;
        let mut json = serde_json::Map::new();
        json.insert("Name".to_string(), Value::String(name.clone()));
        if let Some(created) = bucket.creation_date {
            json.insert("CreationDate".to_string(), Value::String(created.to_string()));
        }

        // us-east-1 reports its location as an empty constraint.
        let location = match self.client.get_bucket_location().bucket(&name).send().await {
            Ok(response) => response
                .location_constraint
                .map(|l| l.as_str().to_string())
                .filter(|l| !l.is_empty())
                .unwrap_or_else(|| crate::credentials::GLOBAL_REGION.to_string()),
            Err(err) => {
                info!(bucket = %name, %err, "GetBucketLocation failed, keeping bucket without region");
                String::new()
            }
        };
        json.insert("LocationConstraint".to_string(), Value::String(location));

        // Buckets without a tag set raise NoSuchTagSet; that is "no tags".
        let tags: Vec<Value> = match self.client.get_bucket_tagging().bucket(&name).send().await {
            Ok(response) => response
                .tag_set
                .iter()
                .map(|t| serde_json::json!({"Key": t.key(), "Value": t.value()}))
                .collect(),
            Err(_) => Vec::new(),
        };
        json.insert("Tags".to_string(), Value::Array(tags));
        Some(Value::Object(json))
    }
}

#[async_trait(?Send)]
impl Section for S3Summary {
    section_plumbing!();

    async fn fetch(&self) -> Result<Value> {
        let response = self.client.list_buckets().send().await?;
        let mut buckets = Vec::new();
        for bucket in response.buckets.unwrap_or_default() {
            if let Some(json) = self.bucket_to_json(&bucket).await {
                buckets.push(json);
            }
        }
        Ok(Value::Array(buckets))
    }

    fn compute(&self, raw: &RawContent) -> Result<Value> {
        let rows = rows_from(&self.core.colleagues, &raw.payload);
        Ok(Value::Array(shape_summary_rows(
            rows,
            "Name",
            &self.names,
            &self.tag_filter,
            &self.tag_import,
        )))
    }

    fn results(&self, computed: &ComputedContent) -> Result<Vec<SectionResult>> {
        Ok(vec![SectionResult::for_host(computed.payload.clone())])
    }
}

pub struct S3Metrics {
    core: SectionCore,
    client: cloudwatch::Client,
}

impl S3Metrics {
    pub fn new(config: &aws_types::SdkConfig, region: &str) -> Self {
        Self {
            core: SectionCore::new("s3", region, 0),
            client: cloudwatch::Client::new(config),
        }
    }

    /// Buckets homed in this section's region.
    fn regional_buckets(&self) -> Vec<String> {
        colleague_rows(&self.core.colleagues, "s3_summary")
            .iter()
            .filter(|row| str_of(row, "LocationConstraint") == self.core.region)
            .map(|row| str_of(row, "Name").to_string())
            .collect()
    }
}

#[async_trait(?Send)]
impl Section for S3Metrics {
    section_plumbing!();

    async fn fetch(&self) -> Result<Value> {
        let resources: Vec<(String, String)> = self
            .regional_buckets()
            .into_iter()
            .map(|name| (name.clone(), name))
            .collect();
        // Storage metrics are daily; look back far enough to catch one point.
        let rows =
            fetch_metric_data(&self.client, "BucketName", &resources, METRICS, 86400).await?;
        Ok(Value::Array(rows))
    }

    fn compute(&self, raw: &RawContent) -> Result<Value> {
        Ok(raw.payload.clone())
    }

    fn results(&self, computed: &ComputedContent) -> Result<Vec<SectionResult>> {
        Ok(vec![SectionResult::for_host(computed.payload.clone())])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::section::ComputedContent;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_regional_buckets_filtered_by_location() {
        let config = aws_types::SdkConfig::builder()
            .behavior_version(aws_config::BehaviorVersion::latest())
            .build();
        let mut section = S3Metrics::new(&config, "eu-west-1");
        section.receive(
            "s3_summary",
            &ComputedContent {
                payload: serde_json::json!([
                    {"Name": "bucket-eu", "LocationConstraint": "eu-west-1"},
                    {"Name": "bucket-us", "LocationConstraint": "us-east-1"},
                ]),
                timestamp: 1,
            },
        );
        assert_eq!(section.regional_buckets(), vec!["bucket-eu".to_string()]);
    }
}
