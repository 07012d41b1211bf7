//! EBS sections: volume inventory and CloudWatch volume metrics.
//!
//! The summary subscribes to `ec2_summary` so volume rows can be attributed
//! to the instance they are attached to without a second DescribeInstances.

use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;
use aws_sdk_cloudwatch as cloudwatch;
use aws_sdk_ec2 as ec2;
use serde_json::Value;

use super::cloudwatch::{fetch_metric_data, MetricSpec};
use super::{colleague_rows, section_plumbing, str_of, SectionCore};
use crate::args::PiggybackNaming;
use crate::section::{ComputedContent, RawContent, Section, SectionResult};

const METRICS: &[MetricSpec] = &[
    MetricSpec::new("AWS/EBS", "VolumeReadOps", "Sum"),
    MetricSpec::new("AWS/EBS", "VolumeWriteOps", "Sum"),
    MetricSpec::new("AWS/EBS", "VolumeReadBytes", "Sum"),
    MetricSpec::new("AWS/EBS", "VolumeWriteBytes", "Sum"),
    MetricSpec::new("AWS/EBS", "VolumeQueueLength", "Average"),
    MetricSpec::new("AWS/EBS", "BurstBalance", "Average"),
];

fn volume_to_json(volume: &ec2::types::Volume) -> Value {
    let mut json = serde_json::Map::new();
    if let Some(id) = &volume.volume_id {
        json.insert("VolumeId".to_string(), Value::String(id.clone()));
    }
    if let Some(state) = &volume.state {
        json.insert("State".to_string(), Value::String(state.as_str().to_string()));
    }
    if let Some(volume_type) = &volume.volume_type {
        json.insert(
            "VolumeType".to_string(),
            Value::String(volume_type.as_str().to_string()),
        );
    }
    if let Some(size) = volume.size {
        json.insert("Size".to_string(), Value::Number(size.into()));
    }
    if let Some(az) = &volume.availability_zone {
        json.insert("AvailabilityZone".to_string(), Value::String(az.clone()));
    }
    if let Some(encrypted) = volume.encrypted {
        json.insert("Encrypted".to_string(), Value::Bool(encrypted));
    }
    let attachments: Vec<Value> = volume
        .attachments
        .clone()
        .unwrap_or_default()
        .iter()
        .filter_map(|a| {
            Some(serde_json::json!({
                "InstanceId": a.instance_id.clone()?,
                "Device": a.device.clone().unwrap_or_default(),
            }))
        })
        .collect();
    json.insert("Attachments".to_string(), Value::Array(attachments));
    Value::Object(json)
}

pub struct EbsSummary {
    core: SectionCore,
    client: ec2::Client,
}

impl EbsSummary {
    pub fn new(config: &aws_types::SdkConfig, region: &str) -> Self {
        Self {
            core: SectionCore::new("ebs_summary", region, 300),
            client: ec2::Client::new(config),
        }
    }
}

#[async_trait(?Send)]
impl Section for EbsSummary {
    section_plumbing!();

    async fn fetch(&self) -> Result<Value> {
        let mut volumes = Vec::new();
        let mut paginator = self.client.describe_volumes().into_paginator().send();
        while let Some(page) = paginator.next().await {
            let page = page?;
            for volume in page.volumes.unwrap_or_default() {
                volumes.push(volume_to_json(&volume));
            }
        }
        Ok(Value::Array(volumes))
    }

    fn compute(&self, raw: &RawContent) -> Result<Value> {
        // Restrict to volumes attached to instances the EC2 summary kept, so
        // the EC2 filters transitively apply. No EC2 colleague = keep all.
        let instances = colleague_rows(&self.core.colleagues, "ec2_summary");
        let mut rows = raw.payload.as_array().cloned().unwrap_or_default();
        if !instances.is_empty() {
            let known: Vec<&str> = instances
                .iter()
                .map(|i| str_of(i, "InstanceId"))
                .collect();
            rows.retain(|row| {
                let attachments = row.get("Attachments").and_then(|a| a.as_array());
                match attachments {
                    Some(attachments) if !attachments.is_empty() => attachments
                        .iter()
                        .any(|a| known.contains(&str_of(a, "InstanceId"))),
                    // Unattached volumes always belong to the main host.
                    _ => true,
                }
            });
        }
        Ok(Value::Array(rows))
    }

    fn results(&self, computed: &ComputedContent) -> Result<Vec<SectionResult>> {
        Ok(vec![SectionResult::for_host(computed.payload.clone())])
    }
}

pub struct EbsMetrics {
    core: SectionCore,
    client: cloudwatch::Client,
    naming: PiggybackNaming,
}

impl EbsMetrics {
    pub fn new(config: &aws_types::SdkConfig, region: &str, naming: PiggybackNaming) -> Self {
        Self {
            core: SectionCore::new("ebs", region, 0),
            client: cloudwatch::Client::new(config),
            naming,
        }
    }

    /// Map volume id to the piggyback host of the instance it is attached to;
    /// unattached volumes stay on the main host.
    fn volume_hosts(&self) -> BTreeMap<String, String> {
        let volumes = colleague_rows(&self.core.colleagues, "ebs_summary");
        let instances = colleague_rows(&self.core.colleagues, "ec2_summary");
        let mut hosts = BTreeMap::new();
        for volume in &volumes {
            let volume_id = str_of(volume, "VolumeId").to_string();
            let attached_to = volume
                .get("Attachments")
                .and_then(|a| a.as_array())
                .and_then(|a| a.first())
                .map(|a| str_of(a, "InstanceId").to_string());
            let host = attached_to
                .and_then(|instance_id| {
                    instances
                        .iter()
                        .find(|i| str_of(i, "InstanceId") == instance_id)
                        .map(|i| super::ec2::piggyback_host(i, &self.core.region, self.naming))
                })
                .unwrap_or_default();
            hosts.insert(volume_id, host);
        }
        hosts
    }
}

#[async_trait(?Send)]
impl Section for EbsMetrics {
    section_plumbing!();

    async fn fetch(&self) -> Result<Value> {
        let resources: Vec<(String, String)> = self
            .volume_hosts()
            .keys()
            .map(|id| (id.clone(), id.clone()))
            .collect();
        let rows = fetch_metric_data(&self.client, "VolumeId", &resources, METRICS, 600).await?;
        Ok(Value::Array(rows))
    }

    fn compute(&self, raw: &RawContent) -> Result<Value> {
        Ok(raw.payload.clone())
    }

    fn results(&self, computed: &ComputedContent) -> Result<Vec<SectionResult>> {
        let hosts = self.volume_hosts();
        let mut per_host: BTreeMap<String, Vec<Value>> = BTreeMap::new();
        for row in computed.payload.as_array().unwrap_or(&Vec::new()) {
            let label = str_of(row, "Label");
            let volume_id = label.split(' ').next().unwrap_or(label);
            let host = hosts.get(volume_id).cloned().unwrap_or_default();
            per_host.entry(host).or_default().push(row.clone());
        }
        Ok(per_host
            .into_iter()
            .map(|(host, rows)| SectionResult {
                piggyback_host: host,
                payload: Value::Array(rows),
                labels: BTreeMap::new(),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::section::ComputedContent;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_summary_keeps_only_known_instances_volumes() {
        let mut section = EbsSummary {
            core: SectionCore::new("ebs_summary", "eu-west-1", 300),
            client: ec2::Client::new(
                &aws_types::SdkConfig::builder()
                    .behavior_version(aws_config::BehaviorVersion::latest())
                    .build(),
            ),
        };
        section.receive(
            "ec2_summary",
            &ComputedContent {
                payload: serde_json::json!([{"InstanceId": "i-0001"}]),
                timestamp: 1,
            },
        );

        let raw = RawContent {
            payload: serde_json::json!([
                {"VolumeId": "vol-1", "Attachments": [{"InstanceId": "i-0001"}]},
                {"VolumeId": "vol-2", "Attachments": [{"InstanceId": "i-0999"}]},
                {"VolumeId": "vol-3", "Attachments": []},
            ]),
            timestamp: 2,
        };
        let computed = section.compute(&raw).unwrap();
        let ids: Vec<&str> = computed
            .as_array()
            .unwrap()
            .iter()
            .map(|r| str_of(r, "VolumeId"))
            .collect();
        assert_eq!(ids, vec!["vol-1", "vol-3"]);
    }
}
