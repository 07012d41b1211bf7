//! EC2 sections: instance inventory, piggyback labels, CloudWatch metrics and
//! the account quota rows.

use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;
use aws_sdk_cloudwatch as cloudwatch;
use aws_sdk_ec2 as ec2;
use serde_json::Value;

use super::cloudwatch::{fetch_metric_data, MetricSpec};
use super::{colleague_rows, filter_by_names, rows_from, section_plumbing, str_of, SectionCore};
use crate::args::PiggybackNaming;
use crate::section::{ComputedContent, RawContent, Section, SectionResult};
use crate::tags::{filter_resources_matching_tags, tags_of, Tag, TagFilter, TagImport};

const METRICS: &[MetricSpec] = &[
    MetricSpec::new("AWS/EC2", "CPUUtilization", "Average"),
    MetricSpec::new("AWS/EC2", "CPUCreditUsage", "Average"),
    MetricSpec::new("AWS/EC2", "CPUCreditBalance", "Average"),
    MetricSpec::new("AWS/EC2", "NetworkIn", "Sum"),
    MetricSpec::new("AWS/EC2", "NetworkOut", "Sum"),
    MetricSpec::new("AWS/EC2", "DiskReadOps", "Sum"),
    MetricSpec::new("AWS/EC2", "DiskWriteOps", "Sum"),
    MetricSpec::new("AWS/EC2", "DiskReadBytes", "Sum"),
    MetricSpec::new("AWS/EC2", "DiskWriteBytes", "Sum"),
    MetricSpec::new("AWS/EC2", "StatusCheckFailed_Instance", "Maximum"),
    MetricSpec::new("AWS/EC2", "StatusCheckFailed_System", "Maximum"),
];

/// Piggyback host name for one instance row.
pub fn piggyback_host(row: &Value, region: &str, naming: PiggybackNaming) -> String {
    match naming {
        PiggybackNaming::PrivateDnsName => str_of(row, "PrivateDnsName").to_string(),
        PiggybackNaming::IpRegionInstance => format!(
            "ip-{}-{}-{}",
            str_of(row, "PrivateIpAddress").replace('.', "-"),
            region,
            str_of(row, "InstanceId")
        ),
    }
}

fn instance_to_json(instance: &ec2::types::Instance) -> Value {
    let mut json = serde_json::Map::new();
    if let Some(id) = &instance.instance_id {
        json.insert("InstanceId".to_string(), Value::String(id.clone()));
    }
    if let Some(instance_type) = &instance.instance_type {
        json.insert(
            "InstanceType".to_string(),
            Value::String(instance_type.as_str().to_string()),
        );
    }
    if let Some(state) = &instance.state {
        if let Some(name) = &state.name {
            json.insert("State".to_string(), Value::String(name.as_str().to_string()));
        }
    }
    if let Some(ip) = &instance.private_ip_address {
        json.insert("PrivateIpAddress".to_string(), Value::String(ip.clone()));
    }
    if let Some(dns) = &instance.private_dns_name {
        json.insert("PrivateDnsName".to_string(), Value::String(dns.clone()));
    }
    if let Some(az) = instance.placement.as_ref().and_then(|p| p.availability_zone.as_ref()) {
        json.insert("AvailabilityZone".to_string(), Value::String(az.clone()));
    }
    if let Some(launch_time) = instance.launch_time {
        json.insert(
            "LaunchTime".to_string(),
            Value::String(launch_time.to_string()),
        );
    }
    if let Some(vpc_id) = &instance.vpc_id {
        json.insert("VpcId".to_string(), Value::String(vpc_id.clone()));
    }
    if let Some(image_id) = &instance.image_id {
        json.insert("ImageId".to_string(), Value::String(image_id.clone()));
    }
    let tags: Vec<Value> = instance
        .tags
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

/// Apply the name filter, then the tag filter, then attach imported labels.
/// Shared by every summary section; lives here because EC2 defined the shape.
pub fn shape_summary_rows(
    rows: Vec<Value>,
    id_key: &str,
    names: &[String],
    tag_filter: &Option<TagFilter>,
    tag_import: &TagImport,
) -> Vec<Value> {
    let mut rows = filter_by_names(rows, id_key, names);
    if let Some(filter) = tag_filter {
        let tagged: BTreeMap<String, Vec<Tag>> = rows
            .iter()
            .map(|row| (str_of(row, id_key).to_string(), tags_of(row)))
            .collect();
        let keep = filter_resources_matching_tags(&tagged, filter);
        rows.retain(|row| keep.iter().any(|k| k == str_of(row, id_key)));
    }
    for row in &mut rows {
        let tags = tags_of(row);
        tag_import.attach_labels(row, &tags);
    }
    rows
}

pub struct Ec2Summary {
    core: SectionCore,
    client: ec2::Client,
    names: Vec<String>,
    tag_filter: Option<TagFilter>,
    tag_import: TagImport,
}

impl Ec2Summary {
    pub fn new(
        config: &aws_types::SdkConfig,
        region: &str,
        names: Vec<String>,
        tag_filter: Option<TagFilter>,
        tag_import: TagImport,
    ) -> Self {
        Self {
            core: SectionCore::new("ec2_summary", region, 300),
            client: ec2::Client::new(config),
            names,
            tag_filter,
            tag_import,
        }
    }
}

#[async_trait(?Send)]
impl Section for Ec2Summary {
    section_plumbing!();

    async fn fetch(&self) -> Result<Value> {
        let mut instances = Vec::new();
        let mut paginator = self.client.describe_instances().into_paginator().send();
        while let Some(page) = paginator.next().await {
            let page = page?;
            for reservation in page.reservations.unwrap_or_default() {
                for instance in reservation.instances.unwrap_or_default() {
                    instances.push(instance_to_json(&instance));
                }
            }
        }
        Ok(Value::Array(instances))
    }

    fn compute(&self, raw: &RawContent) -> Result<Value> {
        let rows = rows_from(&self.core.colleagues, &raw.payload);
        Ok(Value::Array(shape_summary_rows(
            rows,
            "InstanceId",
            &self.names,
            &self.tag_filter,
            &self.tag_import,
        )))
    }

    fn results(&self, computed: &ComputedContent) -> Result<Vec<SectionResult>> {
        Ok(vec![SectionResult::for_host(computed.payload.clone())])
    }
}

/// Piggyback host labels for every instance, derived from the summary's
/// imported tags.
pub struct Ec2Labels {
    core: SectionCore,
    naming: PiggybackNaming,
}

impl Ec2Labels {
    pub fn new(region: &str, naming: PiggybackNaming) -> Self {
        Self {
            core: SectionCore::new("ec2_labels", region, 0),
            naming,
        }
    }
}

#[async_trait(?Send)]
impl Section for Ec2Labels {
    section_plumbing!();

    async fn fetch(&self) -> Result<Value> {
        // Purely colleague-driven.
        Ok(Value::Null)
    }

    fn compute(&self, _raw: &RawContent) -> Result<Value> {
        Ok(Value::Array(colleague_rows(
            &self.core.colleagues,
            "ec2_summary",
        )))
    }

    fn results(&self, computed: &ComputedContent) -> Result<Vec<SectionResult>> {
        let mut results = Vec::new();
        for row in computed.payload.as_array().unwrap_or(&Vec::new()) {
            let labels: BTreeMap<String, String> = row
                .get(crate::tags::TAGS_FOR_CMK_LABELS_KEY)
                .and_then(|v| v.as_object())
                .map(|obj| {
                    obj.iter()
                        .filter_map(|(k, v)| Some((k.clone(), v.as_str()?.to_string())))
                        .collect()
                })
                .unwrap_or_default();
            if labels.is_empty() {
                continue;
            }
            let host = piggyback_host(row, &self.core.region, self.naming);
            results.push(
                SectionResult::for_piggyback(host, serde_json::json!([row.clone()]))
                    .with_labels(labels),
            );
        }
        Ok(results)
    }
}

pub struct Ec2Metrics {
    core: SectionCore,
    client: cloudwatch::Client,
    naming: PiggybackNaming,
}

impl Ec2Metrics {
    pub fn new(config: &aws_types::SdkConfig, region: &str, naming: PiggybackNaming) -> Self {
        Self {
            core: SectionCore::new("ec2", region, 0),
            client: cloudwatch::Client::new(config),
            naming,
        }
    }

    fn instances(&self) -> Vec<Value> {
        colleague_rows(&self.core.colleagues, "ec2_summary")
    }
}

#[async_trait(?Send)]
impl Section for Ec2Metrics {
    section_plumbing!();

    async fn fetch(&self) -> Result<Value> {
        let resources: Vec<(String, String)> = self
            .instances()
            .iter()
            .map(|row| {
                let id = str_of(row, "InstanceId").to_string();
                (id.clone(), id)
            })
            .collect();
        let rows = fetch_metric_data(&self.client, "InstanceId", &resources, METRICS, 600).await?;
        Ok(Value::Array(rows))
    }

    fn compute(&self, raw: &RawContent) -> Result<Value> {
        Ok(raw.payload.clone())
    }

    fn results(&self, computed: &ComputedContent) -> Result<Vec<SectionResult>> {
        // One piggyback block per instance, carrying that instance's metrics.
        let mut per_host: BTreeMap<String, Vec<Value>> = BTreeMap::new();
        for row in computed.payload.as_array().unwrap_or(&Vec::new()) {
            let label = str_of(row, "Label");
            let instance_id = label.split(' ').next().unwrap_or(label);
            let Some(instance) = self
                .instances()
                .into_iter()
                .find(|i| str_of(i, "InstanceId") == instance_id)
            else {
                continue;
            };
            let host = piggyback_host(&instance, &self.core.region, self.naming);
            per_host.entry(host).or_default().push(row.clone());
        }
        Ok(per_host
            .into_iter()
            .map(|(host, rows)| SectionResult::for_piggyback(host, Value::Array(rows)))
            .collect())
    }
}

/// Quota usage rows from DescribeAccountAttributes plus the instance count
/// delivered by the summary.
pub struct Ec2Limits {
    core: SectionCore,
    client: ec2::Client,
}

impl Ec2Limits {
    pub fn new(config: &aws_types::SdkConfig, region: &str) -> Self {
        Self {
            core: SectionCore::new("ec2_limits", region, 300),
            client: ec2::Client::new(config),
        }
    }
}

#[async_trait(?Send)]
impl Section for Ec2Limits {
    section_plumbing!();

    async fn fetch(&self) -> Result<Value> {
        let response = self.client.describe_account_attributes().send().await?;
        let mut attributes = serde_json::Map::new();
        for attribute in response.account_attributes.unwrap_or_default() {
            let Some(name) = attribute.attribute_name else {
                continue;
            };
            let value = attribute
                .attribute_values
                .unwrap_or_default()
                .into_iter()
                .find_map(|v| v.attribute_value);
            if let Some(value) = value {
                attributes.insert(name, Value::String(value));
            }
        }
        Ok(Value::Object(attributes))
    }

    fn compute(&self, raw: &RawContent) -> Result<Value> {
        let running = colleague_rows(&self.core.colleagues, "ec2_summary")
            .iter()
            .filter(|row| str_of(row, "State") == "running")
            .count();
        let limit = raw
            .payload
            .get("max-instances")
            .and_then(|v| v.as_str())
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(20);
        Ok(serde_json::json!([{
            "key": "running_ondemand_instances_total",
            "title": "Total Running On-Demand Instances",
            "limit": limit,
            "amount": running,
            "region": self.core.region,
        }]))
    }

    fn results(&self, computed: &ComputedContent) -> Result<Vec<SectionResult>> {
        Ok(vec![SectionResult::for_host(computed.payload.clone())])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn instance(id: &str, ip: &str, tags: Value) -> Value {
        serde_json::json!({
            "InstanceId": id,
            "State": "running",
            "PrivateIpAddress": ip,
            "PrivateDnsName": format!("{}.internal", id),
            "Tags": tags,
        })
    }

    #[test]
    fn test_piggyback_naming_conventions() {
        let row = instance("i-0001", "10.0.1.99", serde_json::json!([]));
        assert_eq!(
            piggyback_host(&row, "eu-west-1", PiggybackNaming::IpRegionInstance),
            "ip-10-0-1-99-eu-west-1-i-0001"
        );
        assert_eq!(
            piggyback_host(&row, "eu-west-1", PiggybackNaming::PrivateDnsName),
            "i-0001.internal"
        );
    }

    #[test]
    fn test_shape_summary_rows_name_and_tag_filter() {
        let rows = vec![
            instance("i-0001", "10.0.0.1", serde_json::json!([{"Key": "env", "Value": "prod"}])),
            instance("i-0002", "10.0.0.2", serde_json::json!([{"Key": "env", "Value": "dev"}])),
        ];

        // Tag filter alone.
        let filter = TagFilter {
            pairs: vec![Tag::new("env", "prod")],
        };
        let shaped = shape_summary_rows(
            rows.clone(),
            "InstanceId",
            &[],
            &Some(filter),
            &TagImport::ImportAll,
        );
        assert_eq!(shaped.len(), 1);
        assert_eq!(str_of(&shaped[0], "InstanceId"), "i-0001");
        assert_eq!(
            shaped[0]["TagsForCmkLabels"],
            serde_json::json!({"cmk/aws/tag/env": "prod"})
        );

        // Name filter alone.
        let shaped = shape_summary_rows(
            rows,
            "InstanceId",
            &["i-0002".to_string()],
            &None,
            &TagImport::IgnoreAll,
        );
        assert_eq!(shaped.len(), 1);
        assert_eq!(
            shaped[0]["TagsForCmkLabels"],
            serde_json::json!({})
        );
    }
}
