//! Builds the section graph and runs it.
//!
//! Sections execute strictly in the order they were appended, which is laid
//! out so producers always precede their subscribers; there is no topological
//! sort. Each section run is individually guarded: constraint violations are
//! logged and dropped, anything else is logged and recorded, and in debug
//! mode nothing is swallowed at all.

use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::rc::Rc;

use anyhow::Result;
use serde_json::Value;
use tracing::{error, info, warn};

use crate::args::Args;
use crate::cache::CacheStore;
use crate::credentials::{sdk_config_for_region, AccessKey, GLOBAL_REGION};
use crate::distributor::{GlobalResultDistributor, ResultDistributor, SharedSection};
use crate::error::{classify, Severity};
use crate::output::AgentOutput;
use crate::section::{run_section, SectionOutput};
use crate::sections;
use crate::tags::{TagFilter, TagImport};

pub struct Orchestrator {
    sections: Vec<SharedSection>,
    distributor: ResultDistributor,
    global_distributor: GlobalResultDistributor,
    /// Producers routed through the global distributor.
    global_producers: BTreeSet<String>,
    static_labels: BTreeMap<String, String>,
    debug: bool,
}

pub struct RunReport {
    pub outputs: Vec<SectionOutput>,
    pub exceptions: Vec<String>,
}

impl RunReport {
    pub fn has_exceptions(&self) -> bool {
        !self.exceptions.is_empty()
    }
}

fn share<S: crate::section::Section + 'static>(section: S) -> SharedSection {
    Rc::new(std::cell::RefCell::new(section))
}

impl Orchestrator {
    /// Wire up every requested section for every requested region.
    pub async fn build(args: &Args, key: &AccessKey, account_id: &str) -> Result<Self> {
        let mut this = Self {
            sections: Vec::new(),
            distributor: ResultDistributor::new(),
            global_distributor: GlobalResultDistributor::new(),
            global_producers: BTreeSet::new(),
            static_labels: BTreeMap::from([(
                "cmk/aws/account-id".to_string(),
                account_id.to_string(),
            )]),
            debug: args.debug,
        };

        let tag_import = TagImport::from_cli(
            args.import_tags.is_some(),
            args.ignore_tags,
            args.import_tags.as_deref().filter(|p| !p.is_empty()),
        )?;
        let overall_tags = TagFilter::from_cli(args.tag_key.as_deref(), &args.tag_values);

        // Account-global services run once, against us-east-1.
        if args.global_services.iter().any(|s| s == "s3") {
            let config = sdk_config_for_region(key, GLOBAL_REGION).await;
            this.global_producers.insert("s3_summary".to_string());
            this.append(share(sections::s3::S3Summary::new(
                &config,
                args.s3_names.clone(),
                service_tags(&overall_tags, args.s3_tag_key.as_deref(), &args.s3_tag_values),
                tag_import.clone(),
            )));
        }
        if args.global_services.iter().any(|s| s == "wafv2") {
            let config = sdk_config_for_region(key, GLOBAL_REGION).await;
            this.build_wafv2(
                &config,
                GLOBAL_REGION,
                sections::wafv2::Wafv2Scope::Cloudfront,
                args,
                service_tags(&overall_tags, args.wafv2_tag_key.as_deref(), &args.wafv2_tag_values),
                &tag_import,
            )?;
        }

        for region in &args.regions {
            let config = sdk_config_for_region(key, region).await;
            for service in &args.services {
                match service.as_str() {
                    "ec2" => {
                        let summary = share(sections::ec2::Ec2Summary::new(
                            &config,
                            region,
                            args.ec2_names.clone(),
                            service_tags(
                                &overall_tags,
                                args.ec2_tag_key.as_deref(),
                                &args.ec2_tag_values,
                            ),
                            tag_import.clone(),
                        ));
                        let labels = share(sections::ec2::Ec2Labels::new(
                            region,
                            args.piggyback_naming_convention,
                        ));
                        let metrics = share(sections::ec2::Ec2Metrics::new(
                            &config,
                            region,
                            args.piggyback_naming_convention,
                        ));
                        let limits = share(sections::ec2::Ec2Limits::new(&config, region));
                        self::register(&mut this.distributor, "ec2_summary", &[&labels, &metrics, &limits]);
                        this.append(summary);
                        this.append(labels);
                        this.append(metrics);
                        this.append(limits);
                    }
                    "ebs" => {
                        let summary = share(sections::ebs::EbsSummary::new(&config, region));
                        let metrics = share(sections::ebs::EbsMetrics::new(
                            &config,
                            region,
                            args.piggyback_naming_convention,
                        ));
                        self::register(&mut this.distributor, "ec2_summary", &[&summary, &metrics]);
                        self::register(&mut this.distributor, "ebs_summary", &[&metrics]);
                        this.append(summary);
                        this.append(metrics);
                    }
                    "s3" => {
                        // Consumes the account-global bucket listing.
                        let metrics = share(sections::s3::S3Metrics::new(&config, region));
                        this.global_distributor.register("s3_summary", metrics.clone());
                        this.append(metrics);
                    }
                    "rds" => {
                        let summary = share(sections::rds::RdsSummary::new(
                            &config,
                            region,
                            args.rds_names.clone(),
                            service_tags(
                                &overall_tags,
                                args.rds_tag_key.as_deref(),
                                &args.rds_tag_values,
                            ),
                            tag_import.clone(),
                        ));
                        let metrics = share(sections::rds::RdsMetrics::new(&config, region));
                        self::register(&mut this.distributor, "rds_summary", &[&metrics]);
                        this.append(summary);
                        this.append(metrics);
                    }
                    "lambda" => {
                        let summary = share(sections::lambda::LambdaSummary::new(
                            &config,
                            region,
                            args.lambda_names.clone(),
                            service_tags(
                                &overall_tags,
                                args.lambda_tag_key.as_deref(),
                                &args.lambda_tag_values,
                            ),
                            tag_import.clone(),
                        ));
                        let metrics = share(sections::lambda::LambdaMetrics::new(&config, region));
                        let insights = share(sections::lambda::LambdaInsights::new(&config, region));
                        self::register(
                            &mut this.distributor,
                            "lambda_summary",
                            &[&metrics, &insights],
                        );
                        this.append(summary);
                        this.append(metrics);
                        this.append(insights);
                    }
                    "elb" => {
                        let summary = share(sections::elb::ElbSummary::new(
                            &config,
                            region,
                            args.elb_names.clone(),
                            service_tags(
                                &overall_tags,
                                args.elb_tag_key.as_deref(),
                                &args.elb_tag_values,
                            ),
                            tag_import.clone(),
                        ));
                        let metrics = share(sections::elb::ElbMetrics::new(&config, region));
                        let limits = share(sections::elb::ElbLimits::new(&config, region));
                        self::register(&mut this.distributor, "elb_summary", &[&metrics, &limits]);
                        this.append(summary);
                        this.append(metrics);
                        this.append(limits);
                    }
                    "elbv2" => {
                        let summary = share(sections::elbv2::Elbv2Summary::new(
                            &config,
                            region,
                            args.elbv2_names.clone(),
                            service_tags(
                                &overall_tags,
                                args.elbv2_tag_key.as_deref(),
                                &args.elbv2_tag_values,
                            ),
                            tag_import.clone(),
                        ));
                        let application =
                            share(sections::elbv2::Elbv2Application::new(&config, region));
                        let network = share(sections::elbv2::Elbv2Network::new(&config, region));
                        self::register(
                            &mut this.distributor,
                            "elbv2_summary",
                            &[&application, &network],
                        );
                        this.append(summary);
                        this.append(application);
                        this.append(network);
                    }
                    "dynamodb" => {
                        let summary = share(sections::dynamodb::DynamodbSummary::new(
                            &config,
                            region,
                            args.dynamodb_names.clone(),
                            service_tags(
                                &overall_tags,
                                args.dynamodb_tag_key.as_deref(),
                                &args.dynamodb_tag_values,
                            ),
                            tag_import.clone(),
                        ));
                        let table = share(sections::dynamodb::DynamodbTable::new(&config, region));
                        self::register(&mut this.distributor, "dynamodb_summary", &[&table]);
                        this.append(summary);
                        this.append(table);
                    }
                    "ecs" => {
                        let summary = share(sections::ecs::EcsSummary::new(
                            &config,
                            region,
                            args.ecs_names.clone(),
                            service_tags(
                                &overall_tags,
                                args.ecs_tag_key.as_deref(),
                                &args.ecs_tag_values,
                            ),
                            tag_import.clone(),
                        ));
                        let metrics = share(sections::ecs::EcsMetrics::new(&config, region));
                        self::register(&mut this.distributor, "ecs_summary", &[&metrics]);
                        this.append(summary);
                        this.append(metrics);
                    }
                    "wafv2" => {
                        this.build_wafv2(
                            &config,
                            region,
                            sections::wafv2::Wafv2Scope::Regional,
                            args,
                            service_tags(
                                &overall_tags,
                                args.wafv2_tag_key.as_deref(),
                                &args.wafv2_tag_values,
                            ),
                            &tag_import,
                        )?;
                    }
                    other => {
                        warn!(service = other, "unknown service requested, skipping");
                    }
                }
            }
        }
        Ok(this)
    }

    fn build_wafv2(
        &mut self,
        config: &aws_types::SdkConfig,
        region: &str,
        scope: sections::wafv2::Wafv2Scope,
        args: &Args,
        tag_filter: Option<TagFilter>,
        tag_import: &TagImport,
    ) -> Result<()> {
        let summary = match sections::wafv2::Wafv2Summary::new(
            config,
            region,
            scope,
            args.wafv2_names.clone(),
            tag_filter,
            tag_import.clone(),
        ) {
            Ok(summary) => share(summary),
            Err(err) if !args.debug => {
                // Constraint violation at construction: skip the pair.
                error!(region, %err, "cannot build wafv2 section");
                return Ok(());
            }
            Err(err) => return Err(err),
        };
        let metrics = share(sections::wafv2::Wafv2WebAcl::new(config, region));
        register(&mut self.distributor, "wafv2_summary", &[&metrics]);
        self.append(summary);
        self.append(metrics);
        Ok(())
    }

    fn append(&mut self, section: SharedSection) {
        self.sections.push(section);
    }

    /// Run every section in append order.
    pub async fn run(&mut self, cache: &CacheStore, use_cache: bool) -> Result<RunReport> {
        let mut report = RunReport {
            outputs: Vec::new(),
            exceptions: Vec::new(),
        };

        for section in &self.sections {
            let name = section.borrow().name().to_string();
            let result = {
                let section = section.borrow();
                run_section(&*section, cache, use_cache).await
            };
            match result {
                Ok(output) => {
                    info!(section = %name, results = output.results.len(), from_cache = output.from_cache, "section finished");
                    if self.global_producers.contains(&name) {
                        self.global_distributor.distribute(&name, &output.computed);
                    } else {
                        self.distributor.distribute(&name, &output.computed);
                    }
                    report.outputs.push(output);
                }
                Err(err) if self.debug => return Err(err),
                Err(err) => match classify(&err) {
                    Severity::Constraint => {
                        error!(section = %name, %err, "constraint violated, results dropped");
                    }
                    Severity::Generic => {
                        error!(section = %name, %err, "section failed");
                        report.exceptions.push(format!("{}: {}", name, err));
                    }
                },
            }
        }
        Ok(report)
    }

    /// Serialize a finished run to the agent wire format.
    pub fn write_report<W: Write>(&self, report: &RunReport, writer: W) -> Result<()> {
        let mut out = AgentOutput::new(writer);

        for output in &report.outputs {
            out.write_host_results(output)?;
        }
        out.write_labels(&self.static_labels)?;

        // Piggyback hosts collect blocks and labels across all sections.
        let mut hosts: BTreeMap<String, (Vec<(&SectionOutput, &Value)>, BTreeMap<String, String>)> =
            BTreeMap::new();
        for output in &report.outputs {
            for result in &output.results {
                if result.piggyback_host.is_empty() {
                    continue;
                }
                let entry = hosts.entry(result.piggyback_host.clone()).or_default();
                entry.0.push((output, &result.payload));
                entry.1.extend(result.labels.clone());
            }
        }
        for (host, (blocks, mut labels)) in hosts {
            // Static labels apply to every host, main and piggyback alike.
            for (key, value) in &self.static_labels {
                labels.entry(key.clone()).or_insert_with(|| value.clone());
            }
            out.write_piggyback_host(&host, &blocks, &labels)?;
        }

        out.write_exceptions(&report.exceptions)?;
        Ok(())
    }
}

fn register(distributor: &mut ResultDistributor, producer: &str, subscribers: &[&SharedSection]) {
    for subscriber in subscribers {
        distributor.register(producer, (*subscriber).clone());
    }
}

/// Per-service tag filter, falling back to the overall one.
fn service_tags(
    overall: &Option<TagFilter>,
    key: Option<&str>,
    values: &[String],
) -> Option<TagFilter> {
    TagFilter::from_cli(key, values).or_else(|| overall.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tags::Tag;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_service_tags_override_the_overall_filter() {
        let overall = Some(TagFilter {
            pairs: vec![Tag::new("env", "prod")],
        });

        let own = service_tags(&overall, Some("team"), &["storage".to_string()]);
        assert_eq!(own.unwrap().pairs, vec![Tag::new("team", "storage")]);

        let fallback = service_tags(&overall, None, &[]);
        assert_eq!(fallback.unwrap().pairs, vec![Tag::new("env", "prod")]);

        assert!(service_tags(&None, None, &[]).is_none());
    }
}
