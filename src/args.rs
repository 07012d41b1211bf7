//! Command line surface of the AWS agent.

use std::path::PathBuf;

use clap::Parser;

/// Checkmk-style AWS special agent: collects inventory and CloudWatch metrics
/// for the configured services and prints them in the agent wire format.
#[derive(Debug, Parser)]
#[command(name = "agent-aws", version, about)]
pub struct Args {
    /// AWS access key id.
    #[arg(long, env = "AWS_ACCESS_KEY_ID")]
    pub access_key_id: Option<String>,

    /// AWS secret access key, passed directly.
    #[arg(long, env = "AWS_SECRET_ACCESS_KEY", conflicts_with = "secret_access_key_reference")]
    pub secret_access_key: Option<String>,

    /// Password-store reference of the form `ident@/path/to/store` resolved
    /// to the secret access key at startup.
    #[arg(long)]
    pub secret_access_key_reference: Option<String>,

    /// Proxy host for all AWS endpoints.
    #[arg(long)]
    pub proxy_host: Option<String>,

    /// Proxy port.
    #[arg(long)]
    pub proxy_port: Option<u16>,

    /// Proxy user.
    #[arg(long)]
    pub proxy_user: Option<String>,

    /// Proxy password.
    #[arg(long)]
    pub proxy_password: Option<String>,

    /// Regions to collect regional services from.
    #[arg(long, num_args = 1.., value_delimiter = ' ')]
    pub regions: Vec<String>,

    /// Global services to collect (e.g. s3).
    #[arg(long, num_args = 0.., value_delimiter = ' ')]
    pub global_services: Vec<String>,

    /// Regional services to collect (e.g. ec2 ebs rds lambda elb elbv2
    /// dynamodb ecs wafv2).
    #[arg(long, num_args = 0.., value_delimiter = ' ')]
    pub services: Vec<String>,

    /// Restrict EC2 collection to these instance names.
    #[arg(long, num_args = 1..)]
    pub ec2_names: Vec<String>,

    /// EC2 tag filter key.
    #[arg(long)]
    pub ec2_tag_key: Option<String>,

    /// EC2 tag filter values.
    #[arg(long, num_args = 1..)]
    pub ec2_tag_values: Vec<String>,

    /// Restrict S3 collection to these bucket names.
    #[arg(long, num_args = 1..)]
    pub s3_names: Vec<String>,

    /// S3 tag filter key.
    #[arg(long)]
    pub s3_tag_key: Option<String>,

    /// S3 tag filter values.
    #[arg(long, num_args = 1..)]
    pub s3_tag_values: Vec<String>,

    /// Restrict RDS collection to these DB instance identifiers.
    #[arg(long, num_args = 1..)]
    pub rds_names: Vec<String>,

    /// RDS tag filter key.
    #[arg(long)]
    pub rds_tag_key: Option<String>,

    /// RDS tag filter values.
    #[arg(long, num_args = 1..)]
    pub rds_tag_values: Vec<String>,

    /// Restrict Lambda collection to these function names.
    #[arg(long, num_args = 1..)]
    pub lambda_names: Vec<String>,

    /// Lambda tag filter key.
    #[arg(long)]
    pub lambda_tag_key: Option<String>,

    /// Lambda tag filter values.
    #[arg(long, num_args = 1..)]
    pub lambda_tag_values: Vec<String>,

    /// Restrict ECS collection to these cluster names.
    #[arg(long, num_args = 1..)]
    pub ecs_names: Vec<String>,

    /// ECS tag filter key.
    #[arg(long)]
    pub ecs_tag_key: Option<String>,

    /// ECS tag filter values.
    #[arg(long, num_args = 1..)]
    pub ecs_tag_values: Vec<String>,

    /// Restrict ELB collection to these load balancer names.
    #[arg(long, num_args = 1..)]
    pub elb_names: Vec<String>,

    /// ELB tag filter key.
    #[arg(long)]
    pub elb_tag_key: Option<String>,

    /// ELB tag filter values.
    #[arg(long, num_args = 1..)]
    pub elb_tag_values: Vec<String>,

    /// Restrict ELBv2 collection to these load balancer names.
    #[arg(long, num_args = 1..)]
    pub elbv2_names: Vec<String>,

    /// ELBv2 tag filter key.
    #[arg(long)]
    pub elbv2_tag_key: Option<String>,

    /// ELBv2 tag filter values.
    #[arg(long, num_args = 1..)]
    pub elbv2_tag_values: Vec<String>,

    /// Restrict DynamoDB collection to these table names.
    #[arg(long, num_args = 1..)]
    pub dynamodb_names: Vec<String>,

    /// DynamoDB tag filter key.
    #[arg(long)]
    pub dynamodb_tag_key: Option<String>,

    /// DynamoDB tag filter values.
    #[arg(long, num_args = 1..)]
    pub dynamodb_tag_values: Vec<String>,

    /// Restrict WAFV2 collection to these web ACL names.
    #[arg(long, num_args = 1..)]
    pub wafv2_names: Vec<String>,

    /// WAFV2 tag filter key.
    #[arg(long)]
    pub wafv2_tag_key: Option<String>,

    /// WAFV2 tag filter values.
    #[arg(long, num_args = 1..)]
    pub wafv2_tag_values: Vec<String>,

    /// Overall tag filter key applied to every service without its own filter.
    #[arg(long)]
    pub tag_key: Option<String>,

    /// Overall tag filter values.
    #[arg(long, num_args = 1..)]
    pub tag_values: Vec<String>,

    /// Import AWS tags as host labels; optionally restricted by a key regex.
    #[arg(long, num_args = 0..=1, default_missing_value = "", value_name = "PATTERN")]
    pub import_tags: Option<String>,

    /// Never import AWS tags as host labels.
    #[arg(long, conflicts_with = "import_tags")]
    pub ignore_tags: bool,

    /// Name of the monitored host (scopes the cache directory).
    #[arg(long, default_value = "aws")]
    pub hostname: String,

    /// Piggyback host naming convention for EC2 instances.
    #[arg(long, value_enum, default_value_t = PiggybackNaming::IpRegionInstance)]
    pub piggyback_naming_convention: PiggybackNaming,

    /// Only verify credentials: exit 0 on success, 2 on auth failure.
    #[arg(long)]
    pub connection_test: bool,

    /// Never read cached data, always fetch live.
    #[arg(long)]
    pub no_cache: bool,

    /// Override the cache base directory.
    #[arg(long)]
    pub cache_dir: Option<PathBuf>,

    /// Let exceptions propagate instead of being swallowed per section.
    #[arg(long)]
    pub debug: bool,

    /// Log at info level instead of warning.
    #[arg(long, short)]
    pub verbose: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum PiggybackNaming {
    /// `ip-<ip>-<region>-<instance-id>` style names.
    IpRegionInstance,
    /// The instance's private DNS name.
    PrivateDnsName,
}

impl Args {
    /// The flag values that participate in the config hash. Credentials are
    /// left out: rotating a key must not invalidate caches.
    pub fn config_fingerprint(&self) -> Vec<String> {
        let mut parts = Vec::new();
        parts.extend(self.regions.iter().cloned());
        parts.extend(self.global_services.iter().cloned());
        parts.extend(self.services.iter().cloned());
        let name_filters = [
            &self.ec2_names,
            &self.s3_names,
            &self.rds_names,
            &self.lambda_names,
            &self.ecs_names,
            &self.elb_names,
            &self.elbv2_names,
            &self.dynamodb_names,
            &self.wafv2_names,
        ];
        for names in name_filters {
            parts.extend(names.iter().cloned());
        }
        let tag_filters = [
            (&self.ec2_tag_key, &self.ec2_tag_values),
            (&self.s3_tag_key, &self.s3_tag_values),
            (&self.rds_tag_key, &self.rds_tag_values),
            (&self.lambda_tag_key, &self.lambda_tag_values),
            (&self.ecs_tag_key, &self.ecs_tag_values),
            (&self.elb_tag_key, &self.elb_tag_values),
            (&self.elbv2_tag_key, &self.elbv2_tag_values),
            (&self.dynamodb_tag_key, &self.dynamodb_tag_values),
            (&self.wafv2_tag_key, &self.wafv2_tag_values),
            (&self.tag_key, &self.tag_values),
        ];
        for (key, values) in tag_filters {
            parts.extend(key.iter().cloned());
            parts.extend(values.iter().cloned());
        }
        parts.extend(self.import_tags.iter().cloned());
        parts.push(self.ignore_tags.to_string());
        parts.push(format!("{:?}", self.piggyback_naming_convention));
        parts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_invocation_parses() {
        let args = Args::parse_from([
            "agent-aws",
            "--access-key-id",
            "AKIA123",
            "--secret-access-key",
            "abc",
            "--regions",
            "eu-west-1",
            "--services",
            "ec2",
            "ebs",
        ]);
        assert_eq!(args.regions, vec!["eu-west-1"]);
        assert_eq!(args.services, vec!["ec2", "ebs"]);
        assert!(!args.no_cache);
    }

    #[test]
    fn test_import_tags_pattern_is_optional() {
        let args = Args::parse_from(["agent-aws", "--import-tags"]);
        assert_eq!(args.import_tags.as_deref(), Some(""));

        let args = Args::parse_from(["agent-aws", "--import-tags", "^env"]);
        assert_eq!(args.import_tags.as_deref(), Some("^env"));
    }

    #[test]
    fn test_every_service_has_name_and_tag_filters() {
        let args = Args::parse_from([
            "agent-aws",
            "--rds-names",
            "db-1",
            "--lambda-names",
            "fn-1",
            "--elbv2-names",
            "alb-1",
            "--dynamodb-names",
            "table-1",
            "--wafv2-names",
            "acl-1",
            "--rds-tag-key",
            "env",
            "--rds-tag-values",
            "prod",
        ]);
        assert_eq!(args.rds_names, vec!["db-1"]);
        assert_eq!(args.lambda_names, vec!["fn-1"]);
        assert_eq!(args.elbv2_names, vec!["alb-1"]);
        assert_eq!(args.dynamodb_names, vec!["table-1"]);
        assert_eq!(args.wafv2_names, vec!["acl-1"]);
        assert_eq!(args.rds_tag_key.as_deref(), Some("env"));
        assert_eq!(args.rds_tag_values, vec!["prod"]);

        // Per-service filters participate in the cache config hash.
        let plain = Args::parse_from(["agent-aws"]);
        assert_ne!(args.config_fingerprint(), plain.config_fingerprint());
    }

    #[test]
    fn test_config_fingerprint_ignores_credentials() {
        let a = Args::parse_from(["agent-aws", "--access-key-id", "A", "--regions", "eu-west-1"]);
        let b = Args::parse_from(["agent-aws", "--access-key-id", "B", "--regions", "eu-west-1"]);
        assert_eq!(a.config_fingerprint(), b.config_fingerprint());
    }
}
