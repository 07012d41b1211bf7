//! ELBv2 sections: application and network load balancers.
//!
//! The summary covers both types; the metric sections split by type because
//! ALB and NLB publish to different namespaces with different metric sets.

use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;
use aws_sdk_cloudwatch as cloudwatch;
use aws_sdk_elasticloadbalancingv2 as elbv2;
use serde_json::Value;

use super::cloudwatch::{fetch_metric_data, MetricSpec};
use super::ec2::shape_summary_rows;
use super::{colleague_rows, rows_from, section_plumbing, str_of, SectionCore};
use crate::section::{ComputedContent, RawContent, Section, SectionResult};
use crate::tags::{TagFilter, TagImport};

const APPLICATION_METRICS: &[MetricSpec] = &[
    MetricSpec::new("AWS/ApplicationELB", "RequestCount", "Sum"),
    MetricSpec::new("AWS/ApplicationELB", "ActiveConnectionCount", "Sum"),
    MetricSpec::new("AWS/ApplicationELB", "NewConnectionCount", "Sum"),
    MetricSpec::new("AWS/ApplicationELB", "TargetResponseTime", "Average"),
    MetricSpec::new("AWS/ApplicationELB", "HTTPCode_Target_2XX_Count", "Sum"),
    MetricSpec::new("AWS/ApplicationELB", "HTTPCode_Target_4XX_Count", "Sum"),
    MetricSpec::new("AWS/ApplicationELB", "HTTPCode_Target_5XX_Count", "Sum"),
    MetricSpec::new("AWS/ApplicationELB", "HTTPCode_ELB_5XX_Count", "Sum"),
    MetricSpec::new("AWS/ApplicationELB", "ProcessedBytes", "Sum"),
];

const NETWORK_METRICS: &[MetricSpec] = &[
    MetricSpec::new("AWS/NetworkELB", "ActiveFlowCount", "Average"),
    MetricSpec::new("AWS/NetworkELB", "NewFlowCount", "Sum"),
    MetricSpec::new("AWS/NetworkELB", "ProcessedBytes", "Sum"),
    MetricSpec::new("AWS/NetworkELB", "TCP_Client_Reset_Count", "Sum"),
    MetricSpec::new("AWS/NetworkELB", "TCP_Target_Reset_Count", "Sum"),
    MetricSpec::new("AWS/NetworkELB", "HealthyHostCount", "Maximum"),
    MetricSpec::new("AWS/NetworkELB", "UnHealthyHostCount", "Maximum"),
];

/// The CloudWatch dimension wants the trailing `app/...` or `net/...` part of
/// the ARN, not the name.
fn dimension_of_arn(arn: &str) -> Option<&str> {
    arn.split("loadbalancer/").nth(1)
}

pub struct Elbv2Summary {
    core: SectionCore,
    client: elbv2::Client,
    names: Vec<String>,
    tag_filter: Option<TagFilter>,
    tag_import: TagImport,
}

impl Elbv2Summary {
    pub fn new(
        config: &aws_types::SdkConfig,
        region: &str,
        names: Vec<String>,
        tag_filter: Option<TagFilter>,
        tag_import: TagImport,
    ) -> Self {
        Self {
            core: SectionCore::new("elbv2_summary", region, 300),
            client: elbv2::Client::new(config),
            names,
            tag_filter,
            tag_import,
        }
    }

    async fn tags_for(&self, arns: &[String]) -> BTreeMap<String, Vec<Value>> {
        let mut tags_by_arn: BTreeMap<String, Vec<Value>> = BTreeMap::new();
        // DescribeTags accepts at most 20 ARNs per call.
        for chunk in arns.chunks(20) {
            let response = self
                .client
                .describe_tags()
                .set_resource_arns(Some(chunk.to_vec()))
                .send()
                .await;
            let Ok(response) = response else { continue };
            for description in response.tag_descriptions.unwrap_or_default() {
                let Some(arn) = description.resource_arn else {
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
                tags_by_arn.insert(arn, tags);
            }
        }
        tags_by_arn
    }
}

#[async_trait(?Send)]
impl Section for Elbv2Summary {
    section_plumbing!();

    async fn fetch(&self) -> Result<Value> {
        let mut balancers = Vec::new();
        let mut paginator = self.client.describe_load_balancers().into_paginator().send();
        while let Some(page) = paginator.next().await {
            let page = page?;
            for lb in page.load_balancers.unwrap_or_default() {
                let mut json = serde_json::Map::new();
                if let Some(name) = &lb.load_balancer_name {
                    json.insert("LoadBalancerName".to_string(), Value::String(name.clone()));
                }
                if let Some(arn) = &lb.load_balancer_arn {
                    json.insert("LoadBalancerArn".to_string(), Value::String(arn.clone()));
                }
                if let Some(dns) = &lb.dns_name {
                    json.insert("DNSName".to_string(), Value::String(dns.clone()));
                }
                if let Some(lb_type) = &lb.r#type {
                    json.insert("Type".to_string(), Value::String(lb_type.as_str().to_string()));
                }
                if let Some(state) = lb.state.as_ref().and_then(|s| s.code.as_ref()) {
                    json.insert("State".to_string(), Value::String(state.as_str().to_string()));
                }
                if let Some(scheme) = &lb.scheme {
                    json.insert("Scheme".to_string(), Value::String(scheme.as_str().to_string()));
                }
                balancers.push(Value::Object(json));
            }
        }

        let arns: Vec<String> = balancers
            .iter()
            .map(|b| str_of(b, "LoadBalancerArn").to_string())
            .collect();
        let tags_by_arn = self.tags_for(&arns).await;
        for balancer in &mut balancers {
            let arn = str_of(balancer, "LoadBalancerArn").to_string();
            if let Some(obj) = balancer.as_object_mut() {
                let tags = tags_by_arn.get(&arn).cloned().unwrap_or_default();
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

/// Shared implementation for the two typed metric sections.
struct TypedMetrics {
    core: SectionCore,
    client: cloudwatch::Client,
    lb_type: &'static str,
    metrics: &'static [MetricSpec],
}

impl TypedMetrics {
    fn balancers(&self) -> Vec<Value> {
        colleague_rows(&self.core.colleagues, "elbv2_summary")
            .into_iter()
            .filter(|row| str_of(row, "Type") == self.lb_type)
            .collect()
    }

    async fn fetch_rows(&self) -> Result<Value> {
        let resources: Vec<(String, String)> = self
            .balancers()
            .iter()
            .filter_map(|row| {
                let dimension =
                    dimension_of_arn(str_of(row, "LoadBalancerArn"))?.to_string();
                Some((dimension, str_of(row, "LoadBalancerName").to_string()))
            })
            .collect();
        let rows =
            fetch_metric_data(&self.client, "LoadBalancer", &resources, self.metrics, 600).await?;
        Ok(Value::Array(rows))
    }

    fn piggyback_results(&self, computed: &ComputedContent) -> Result<Vec<SectionResult>> {
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

pub struct Elbv2Application(TypedMetrics);

impl Elbv2Application {
    pub fn new(config: &aws_types::SdkConfig, region: &str) -> Self {
        Self(TypedMetrics {
            core: SectionCore::new("elbv2_application", region, 0),
            client: cloudwatch::Client::new(config),
            lb_type: "application",
            metrics: APPLICATION_METRICS,
        })
    }
}

#[async_trait(?Send)]
impl Section for Elbv2Application {
    fn name(&self) -> &str {
        &self.0.core.name
    }
    fn region(&self) -> &str {
        &self.0.core.region
    }
    fn cache_interval(&self) -> u64 {
        self.0.core.cache_interval
    }
    fn receive(&mut self, producer: &str, content: &ComputedContent) {
        self.0.core.colleagues.insert(producer, content);
    }
    fn colleague_contents(&self) -> &crate::section::ColleagueContents {
        &self.0.core.colleagues
    }
    async fn fetch(&self) -> Result<Value> {
        self.0.fetch_rows().await
    }
    fn compute(&self, raw: &RawContent) -> Result<Value> {
        Ok(raw.payload.clone())
    }
    fn results(&self, computed: &ComputedContent) -> Result<Vec<SectionResult>> {
        self.0.piggyback_results(computed)
    }
}

pub struct Elbv2Network(TypedMetrics);

impl Elbv2Network {
    pub fn new(config: &aws_types::SdkConfig, region: &str) -> Self {
        Self(TypedMetrics {
            core: SectionCore::new("elbv2_network", region, 0),
            client: cloudwatch::Client::new(config),
            lb_type: "network",
            metrics: NETWORK_METRICS,
        })
    }
}

#[async_trait(?Send)]
impl Section for Elbv2Network {
    fn name(&self) -> &str {
        &self.0.core.name
    }
    fn region(&self) -> &str {
        &self.0.core.region
    }
    fn cache_interval(&self) -> u64 {
        self.0.core.cache_interval
    }
    fn receive(&mut self, producer: &str, content: &ComputedContent) {
        self.0.core.colleagues.insert(producer, content);
    }
    fn colleague_contents(&self) -> &crate::section::ColleagueContents {
        &self.0.core.colleagues
    }
    async fn fetch(&self) -> Result<Value> {
        self.0.fetch_rows().await
    }
    fn compute(&self, raw: &RawContent) -> Result<Value> {
        Ok(raw.payload.clone())
    }
    fn results(&self, computed: &ComputedContent) -> Result<Vec<SectionResult>> {
        self.0.piggyback_results(computed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dimension_of_arn() {
        let arn = "arn:aws:elasticloadbalancing:eu-west-1:123456789012:\
                   loadbalancer/app/my-alb/50dc6c495c0c9188";
        assert_eq!(dimension_of_arn(arn), Some("app/my-alb/50dc6c495c0c9188"));
        assert_eq!(dimension_of_arn("garbage"), None);
    }
}
