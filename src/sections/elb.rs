//! Classic ELB sections: load balancer inventory, metrics and account limits.

use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;
use aws_sdk_cloudwatch as cloudwatch;
use aws_sdk_elasticloadbalancing as elb;
use serde_json::Value;

use super::cloudwatch::{fetch_metric_data, MetricSpec};
use super::ec2::shape_summary_rows;
use super::{colleague_rows, rows_from, section_plumbing, str_of, SectionCore};
use crate::section::{ComputedContent, RawContent, Section, SectionResult};
use crate::tags::{TagFilter, TagImport};

const METRICS: &[MetricSpec] = &[
    MetricSpec::new("AWS/ELB", "RequestCount", "Sum"),
    MetricSpec::new("AWS/ELB", "Latency", "Average"),
    MetricSpec::new("AWS/ELB", "HTTPCode_Backend_2XX", "Sum"),
    MetricSpec::new("AWS/ELB", "HTTPCode_Backend_4XX", "Sum"),
    MetricSpec::new("AWS/ELB", "HTTPCode_Backend_5XX", "Sum"),
    MetricSpec::new("AWS/ELB", "HealthyHostCount", "Average"),
    MetricSpec::new("AWS/ELB", "UnHealthyHostCount", "Average"),
    MetricSpec::new("AWS/ELB", "SurgeQueueLength", "Maximum"),
    MetricSpec::new("AWS/ELB", "SpilloverCount", "Sum"),
];

pub struct ElbSummary {
    core: SectionCore,
    client: elb::Client,
    names: Vec<String>,
    tag_filter: Option<TagFilter>,
    tag_import: TagImport,
}

impl ElbSummary {
    pub fn new(
        config: &aws_types::SdkConfig,
        region: &str,
        names: Vec<String>,
        tag_filter: Option<TagFilter>,
        tag_import: TagImport,
    ) -> Self {
        Self {
            core: SectionCore::new("elb_summary", region, 300),
            client: elb::Client::new(config),
            names,
            tag_filter,
            tag_import,
        }
    }

    async fn tags_for(&self, names: &[String]) -> BTreeMap<String, Vec<Value>> {
        let mut tags_by_name: BTreeMap<String, Vec<Value>> = BTreeMap::new();
        // DescribeTags accepts at most 20 names per call.
        for chunk in names.chunks(20) {
            let response = self
                .client
                .describe_tags()
                .set_load_balancer_names(Some(chunk.to_vec()))
                .send()
                .await;
            let Ok(response) = response else { continue };
            for description in response.tag_descriptions.unwrap_or_default() {
                let Some(name) = description.load_balancer_name else {
                    continue;
                };
                let tags = description
                    .tags
                    .unwrap_or_default()
                    .into_iter()
                    .filter_map(|t| {
                        Some(serde_json::json!({
                            "Key": t.key,
                            "Value": t.value?,
                        }))
                    })
                    .collect();
                tags_by_name.insert(name, tags);
            }
        }
        tags_by_name
    }
}

#[async_trait(?Send)]
impl Section for ElbSummary {
    section_plumbing!();

    async fn fetch(&self) -> Result<Value> {
        let mut balancers = Vec::new();
        let mut paginator = self.client.describe_load_balancers().into_paginator().send();
        while let Some(page) = paginator.next().await {
            let page = page?;
            for lb in page.load_balancer_descriptions.unwrap_or_default() {
                let mut json = serde_json::Map::new();
                if let Some(name) = &lb.load_balancer_name {
                    json.insert("LoadBalancerName".to_string(), Value::String(name.clone()));
                }
                if let Some(dns) = &lb.dns_name {
                    json.insert("DNSName".to_string(), Value::String(dns.clone()));
                }
                if let Some(scheme) = &lb.scheme {
                    json.insert("Scheme".to_string(), Value::String(scheme.clone()));
                }
                let azs: Vec<Value> = lb
                    .availability_zones
                    .clone()
                    .unwrap_or_default()
                    .into_iter()
                    .map(Value::String)
                    .collect();
                json.insert("AvailabilityZones".to_string(), Value::Array(azs));
                let instances: Vec<Value> = lb
                    .instances
                    .clone()
                    .unwrap_or_default()
                    .into_iter()
                    .filter_map(|i| i.instance_id)
                    .map(Value::String)
                    .collect();
                json.insert("Instances".to_string(), Value::Array(instances));
                balancers.push(Value::Object(json));
            }
        }

        let names: Vec<String> = balancers
            .iter()
            .map(|b| str_of(b, "LoadBalancerName").to_string())
            .collect();
        let tags_by_name = self.tags_for(&names).await;
        for balancer in &mut balancers {
            let name = str_of(balancer, "LoadBalancerName").to_string();
            if let Some(obj) = balancer.as_object_mut() {
                let tags = tags_by_name.get(&name).cloned().unwrap_or_default();
                obj.insert("Tags".to_string(), Value::Array(tags));
            }
        }
        Ok(Value::Array(balancers))
    }

    fn compute(&self, raw: &RawContent) -> Result<Value> {
        let rows = rows_from(&self.core.colleagues, &raw.payload);
        Ok(Value::Array(shape_summary_rows(
            rows,
            "LoadBalancerName",
            &self.names,
            &self.tag_filter,
            &self.tag_import,
        )))
    }

    fn results(&self, computed: &ComputedContent) -> Result<Vec<SectionResult>> {
        Ok(vec![SectionResult::for_host(computed.payload.clone())])
    }
}

pub struct ElbMetrics {
    core: SectionCore,
    client: cloudwatch::Client,
}

impl ElbMetrics {
    pub fn new(config: &aws_types::SdkConfig, region: &str) -> Self {
        Self {
            core: SectionCore::new("elb", region, 0),
            client: cloudwatch::Client::new(config),
        }
    }

    fn balancers(&self) -> Vec<Value> {
        colleague_rows(&self.core.colleagues, "elb_summary")
    }
}

#[async_trait(?Send)]
impl Section for ElbMetrics {
    section_plumbing!();

    async fn fetch(&self) -> Result<Value> {
        let resources: Vec<(String, String)> = self
            .balancers()
            .iter()
            .map(|row| {
                let name = str_of(row, "LoadBalancerName").to_string();
                (name.clone(), name)
            })
            .collect();
        let rows =
            fetch_metric_data(&self.client, "LoadBalancerName", &resources, METRICS, 600).await?;
        Ok(Value::Array(rows))
    }

    fn compute(&self, raw: &RawContent) -> Result<Value> {
        Ok(raw.payload.clone())
    }

    fn results(&self, computed: &ComputedContent) -> Result<Vec<SectionResult>> {
        // Metrics ride piggyback on the load balancer's DNS name.
        let mut per_host: BTreeMap<String, Vec<Value>> = BTreeMap::new();
        for row in computed.payload.as_array().unwrap_or(&Vec::new()) {
            let label = str_of(row, "Label");
            let lb_name = label.split(' ').next().unwrap_or(label);
            let Some(balancer) = self
                .balancers()
                .into_iter()
                .find(|b| str_of(b, "LoadBalancerName") == lb_name)
            else {
                continue;
            };
            let host = str_of(&balancer, "DNSName").to_string();
            per_host.entry(host).or_default().push(row.clone());
        }
        Ok(per_host
            .into_iter()
            .map(|(host, rows)| SectionResult::for_piggyback(host, Value::Array(rows)))
            .collect())
    }
}

/// Account limits vs current usage for classic load balancers.
pub struct ElbLimits {
    core: SectionCore,
    client: elb::Client,
}

impl ElbLimits {
    pub fn new(config: &aws_types::SdkConfig, region: &str) -> Self {
        Self {
            core: SectionCore::new("elb_limits", region, 300),
            client: elb::Client::new(config),
        }
    }
}

#[async_trait(?Send)]
impl Section for ElbLimits {
    section_plumbing!();

    async fn fetch(&self) -> Result<Value> {
        let response = self.client.describe_account_limits().send().await?;
        let mut limits = serde_json::Map::new();
        for limit in response.limits.unwrap_or_default() {
            if let (Some(name), Some(max)) = (limit.name, limit.max) {
                limits.insert(name, Value::String(max));
            }
        }
        Ok(Value::Object(limits))
    }

    fn compute(&self, raw: &RawContent) -> Result<Value> {
        let in_use = colleague_rows(&self.core.colleagues, "elb_summary").len();
        let limit = raw
            .payload
            .get("classic-load-balancers")
            .and_then(|v| v.as_str())
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(20);
        Ok(serde_json::json!([{
            "key": "load_balancers",
            "title": "Classic Load Balancers",
            "limit": limit,
            "amount": in_use,
            "region": self.core.region,
        }]))
    }

    fn results(&self, computed: &ComputedContent) -> Result<Vec<SectionResult>> {
        Ok(vec![SectionResult::for_host(computed.payload.clone())])
    }
}
