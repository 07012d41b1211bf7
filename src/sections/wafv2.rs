//! WAFV2 sections: web ACL inventory and request metrics.
//!
//! WAFV2 has two scopes. REGIONAL ACLs protect regional resources; CLOUDFRONT
//! ACLs protect distributions and only exist in us-east-1, so building a
//! CLOUDFRONT section for any other region is a constraint violation.

use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;
use aws_sdk_cloudwatch as cloudwatch;
use aws_sdk_wafv2 as wafv2;
use serde_json::Value;

use super::cloudwatch::{fetch_metric_data, MetricSpec};
use super::ec2::shape_summary_rows;
use super::{colleague_rows, rows_from, section_plumbing, str_of, SectionCore};
use crate::error::ConstraintViolation;
use crate::section::{ComputedContent, RawContent, Section, SectionResult};
use crate::tags::{TagFilter, TagImport};

const METRICS: &[MetricSpec] = &[
    MetricSpec::new("AWS/WAFV2", "AllowedRequests", "Sum"),
    MetricSpec::new("AWS/WAFV2", "BlockedRequests", "Sum"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wafv2Scope {
    Regional,
    Cloudfront,
}

impl Wafv2Scope {
    fn to_sdk(self) -> wafv2::types::Scope {
        match self {
            Self::Regional => wafv2::types::Scope::Regional,
            Self::Cloudfront => wafv2::types::Scope::Cloudfront,
        }
    }
}

pub struct Wafv2Summary {
    core: SectionCore,
    client: wafv2::Client,
    scope: Wafv2Scope,
    names: Vec<String>,
    tag_filter: Option<TagFilter>,
    tag_import: TagImport,
}

impl Wafv2Summary {
    pub fn new(
        config: &aws_types::SdkConfig,
        region: &str,
        scope: Wafv2Scope,
        names: Vec<String>,
        tag_filter: Option<TagFilter>,
        tag_import: TagImport,
    ) -> Result<Self> {
        if scope == Wafv2Scope::Cloudfront && region != crate::credentials::GLOBAL_REGION {
            return Err(ConstraintViolation(format!(
                "WAFV2 CLOUDFRONT scope is only served from {}, got region {}",
                crate::credentials::GLOBAL_REGION,
                region
            ))
            .into());
        }
        Ok(Self {
            core: SectionCore::new("wafv2_summary", region, 300),
            client: wafv2::Client::new(config),
            scope,
            names,
            tag_filter,
            tag_import,
        })
    }

    async fn acl_tags(&self, arn: &str) -> Vec<Value> {
        match self
            .client
            .list_tags_for_resource()
            .resource_arn(arn)
            .send()
            .await
        {
            Ok(response) => response
                .tag_info_for_resource
                .and_then(|info| info.tag_list)
                .unwrap_or_default()
                .into_iter()
                .filter_map(|t| {
                    Some(serde_json::json!({
                        "Key": t.key?,
                        "Value": t.value?,
                    }))
                })
                .collect(),
            Err(_) => Vec::new(),
        }
    }
}

#[async_trait(?Send)]
impl Section for Wafv2Summary {
    section_plumbing!();

    async fn fetch(&self) -> Result<Value> {
        let mut acls = Vec::new();
        let mut next_marker: Option<String> = None;
        // ListWebAcls has no paginator in the SDK; walk the marker by hand.
        loop {
            let response = self
                .client
                .list_web_acls()
                .scope(self.scope.to_sdk())
                .set_next_marker(next_marker.clone())
                .send()
                .await?;
            for acl in response.web_acls.unwrap_or_default() {
                let mut json = serde_json::Map::new();
                if let Some(name) = &acl.name {
                    json.insert("Name".to_string(), Value::String(name.clone()));
                }
                if let Some(id) = &acl.id {
                    json.insert("Id".to_string(), Value::String(id.clone()));
                }
                if let Some(arn) = &acl.arn {
                    json.insert("ARN".to_string(), Value::String(arn.clone()));
                    let tags = self.acl_tags(arn).await;
                    json.insert("Tags".to_string(), Value::Array(tags));
                }
                acls.push(Value::Object(json));
            }
            next_marker = response.next_marker;
            if next_marker.is_none() {
                break;
            }
        }
        Ok(Value::Array(acls))
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

pub struct Wafv2WebAcl {
    core: SectionCore,
    client: cloudwatch::Client,
}

impl Wafv2WebAcl {
    pub fn new(config: &aws_types::SdkConfig, region: &str) -> Self {
        Self {
            core: SectionCore::new("wafv2_web_acl", region, 0),
            client: cloudwatch::Client::new(config),
        }
    }
}

#[async_trait(?Send)]
impl Section for Wafv2WebAcl {
    section_plumbing!();

    async fn fetch(&self) -> Result<Value> {
        let resources: Vec<(String, String)> =
            colleague_rows(&self.core.colleagues, "wafv2_summary")
                .iter()
                .map(|row| {
                    let name = str_of(row, "Name").to_string();
                    (name.clone(), name)
                })
                .collect();
        let rows = fetch_metric_data(&self.client, "WebACL", &resources, METRICS, 600).await?;
        Ok(Value::Array(rows))
    }

    fn compute(&self, raw: &RawContent) -> Result<Value> {
        Ok(raw.payload.clone())
    }

    fn results(&self, computed: &ComputedContent) -> Result<Vec<SectionResult>> {
        let mut per_acl: BTreeMap<String, Vec<Value>> = BTreeMap::new();
        for row in computed.payload.as_array().unwrap_or(&Vec::new()) {
            let label = str_of(row, "Label");
            let acl = label.split(' ').next().unwrap_or(label);
            per_acl.entry(acl.to_string()).or_default().push(row.clone());
        }
        Ok(per_acl
            .into_values()
            .map(|rows| SectionResult::for_host(Value::Array(rows)))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{classify, Severity};

    fn config() -> aws_types::SdkConfig {
        aws_types::SdkConfig::builder()
            .behavior_version(aws_config::BehaviorVersion::latest())
            .build()
    }

    #[test]
    fn test_cloudfront_scope_outside_us_east_1_is_rejected() {
        let err = Wafv2Summary::new(
            &config(),
            "eu-west-1",
            Wafv2Scope::Cloudfront,
            Vec::new(),
            None,
            TagImport::IgnoreAll,
        )
        .unwrap_err();
        assert_eq!(classify(&err), Severity::Constraint);
    }

    #[test]
    fn test_cloudfront_scope_in_us_east_1_is_accepted() {
        assert!(Wafv2Summary::new(
            &config(),
            "us-east-1",
            Wafv2Scope::Cloudfront,
            Vec::new(),
            None,
            TagImport::IgnoreAll,
        )
        .is_ok());
    }

    #[test]
    fn test_regional_scope_works_anywhere() {
        assert!(Wafv2Summary::new(
            &config(),
            "ap-southeast-2",
            Wafv2Scope::Regional,
            Vec::new(),
            None,
            TagImport::IgnoreAll,
        )
        .is_ok());
    }
}
