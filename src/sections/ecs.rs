//! ECS sections: cluster inventory and CloudWatch cluster metrics.

use anyhow::Result;
use async_trait::async_trait;
use aws_sdk_cloudwatch as cloudwatch;
use aws_sdk_ecs as ecs;
use serde_json::Value;

use super::cloudwatch::{fetch_metric_data, MetricSpec};
use super::ec2::shape_summary_rows;
use super::{colleague_rows, rows_from, section_plumbing, str_of, SectionCore};
use crate::section::{ComputedContent, RawContent, Section, SectionResult};
use crate::tags::{TagFilter, TagImport};

const METRICS: &[MetricSpec] = &[
    MetricSpec::new("AWS/ECS", "CPUUtilization", "Average"),
    MetricSpec::new("AWS/ECS", "MemoryUtilization", "Average"),
    MetricSpec::new("AWS/ECS", "CPUReservation", "Average"),
    MetricSpec::new("AWS/ECS", "MemoryReservation", "Average"),
];

fn cluster_to_json(cluster: &ecs::types::Cluster) -> Value {
    let mut json = serde_json::Map::new();
    if let Some(name) = &cluster.cluster_name {
        json.insert("ClusterName".to_string(), Value::String(name.clone()));
    }
    if let Some(arn) = &cluster.cluster_arn {
        json.insert("ClusterArn".to_string(), Value::String(arn.clone()));
    }
    if let Some(status) = &cluster.status {
        json.insert("Status".to_string(), Value::String(status.clone()));
    }
    json.insert(
        "RunningTasksCount".to_string(),
        Value::Number(cluster.running_tasks_count.into()),
    );
    json.insert(
        "ActiveServicesCount".to_string(),
        Value::Number(cluster.active_services_count.into()),
    );
    json.insert(
        "RegisteredContainerInstancesCount".to_string(),
        Value::Number(cluster.registered_container_instances_count.into()),
    );
    // ECS tags use lowercase field names, unlike most of AWS.
    let tags: Vec<Value> = cluster
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

pub struct EcsSummary {
    core: SectionCore,
    client: ecs::Client,
    names: Vec<String>,
    tag_filter: Option<TagFilter>,
    tag_import: TagImport,
}

impl EcsSummary {
    pub fn new(
        config: &aws_types::SdkConfig,
        region: &str,
        names: Vec<String>,
        tag_filter: Option<TagFilter>,
        tag_import: TagImport,
    ) -> Self {
        Self {
            core: SectionCore::new("ecs_summary", region, 300),
            client: ecs::Client::new(config),
            names,
            tag_filter,
            tag_import,
        }
    }
}

#[async_trait(?Send)]
impl Section for EcsSummary {
    section_plumbing!();

    async fn fetch(&self) -> Result<Value> {
        let mut arns = Vec::new();
        let mut paginator = self.client.list_clusters().into_paginator().send();
        while let Some(page) = paginator.next().await {
            let page = page?;
            arns.extend(page.cluster_arns.unwrap_or_default());
        }

        let mut clusters = Vec::new();
        // DescribeClusters takes at most 100 clusters per call.
        for chunk in arns.chunks(100) {
            let response = self
                .client
                .describe_clusters()
                .set_clusters(Some(chunk.to_vec()))
                .include(ecs::types::ClusterField::Tags)
                .send()
                .await?;
            for cluster in response.clusters.unwrap_or_default() {
                clusters.push(cluster_to_json(&cluster));
            }
        }
        Ok(Value::Array(clusters))
    }

    fn compute(&self, raw: &RawContent) -> Result<Value> {
        let rows = rows_from(&self.core.colleagues, &raw.payload);
        Ok(Value::Array(shape_summary_rows(
            rows,
            "ClusterName",
            &self.names,
            &self.tag_filter,
            &self.tag_import,
        )))
    }

    fn results(&self, computed: &ComputedContent) -> Result<Vec<SectionResult>> {
        Ok(vec![SectionResult::for_host(computed.payload.clone())])
    }
}

pub struct EcsMetrics {
    core: SectionCore,
    client: cloudwatch::Client,
}

impl EcsMetrics {
    pub fn new(config: &aws_types::SdkConfig, region: &str) -> Self {
        Self {
            core: SectionCore::new("ecs", region, 0),
            client: cloudwatch::Client::new(config),
        }
    }
}

#[async_trait(?Send)]
impl Section for EcsMetrics {
    section_plumbing!();

    async fn fetch(&self) -> Result<Value> {
        let resources: Vec<(String, String)> =
            colleague_rows(&self.core.colleagues, "ecs_summary")
                .iter()
                .map(|row| {
                    let name = str_of(row, "ClusterName").to_string();
                    (name.clone(), name)
                })
                .collect();
        let rows = fetch_metric_data(&self.client, "ClusterName", &resources, METRICS, 600).await?;
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
    use pretty_assertions::assert_eq;

    fn summary_with_names(names: Vec<String>) -> EcsSummary {
        let config = aws_types::SdkConfig::builder()
            .behavior_version(aws_config::BehaviorVersion::latest())
            .build();
        EcsSummary::new(&config, "eu-west-1", names, None, TagImport::ImportAll)
    }

    fn clusters() -> Value {
        serde_json::json!([
            {
                "ClusterName": "cluster-test1",
                "Status": "ACTIVE",
                "Tags": [{"Key": "env", "Value": "prod"}],
            },
            {
                "ClusterName": "cluster-test2",
                "Status": "ACTIVE",
                "Tags": [],
            },
        ])
    }

    #[test]
    fn test_no_filter_returns_all_clusters() {
        let section = summary_with_names(Vec::new());
        let raw = RawContent {
            payload: clusters(),
            timestamp: 1,
        };
        let computed = section.compute(&raw).unwrap();
        assert_eq!(computed.as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_name_filter_resolves_tags_into_labels() {
        let section = summary_with_names(vec!["cluster-test1".to_string()]);
        let raw = RawContent {
            payload: clusters(),
            timestamp: 1,
        };
        let computed = section.compute(&raw).unwrap();
        let rows = computed.as_array().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(str_of(&rows[0], "ClusterName"), "cluster-test1");
        assert_eq!(
            rows[0]["TagsForCmkLabels"],
            serde_json::json!({"cmk/aws/tag/env": "prod"})
        );
    }

    #[test]
    fn test_filter_result_is_same_for_colleague_supplied_data() {
        let mut section = summary_with_names(vec!["cluster-test1".to_string()]);
        section.receive(
            "ecs_inventory",
            &ComputedContent {
                payload: clusters(),
                timestamp: 5,
            },
        );
        // Nothing was fetched; the colleague data feeds compute instead.
        let raw = RawContent {
            payload: Value::Null,
            timestamp: 5,
        };
        let computed = section.compute(&raw).unwrap();
        let rows = computed.as_array().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(str_of(&rows[0], "ClusterName"), "cluster-test1");
    }
}
