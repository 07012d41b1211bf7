//! Tag filtering and tag-to-label mapping.
//!
//! Two independent mechanisms share this module: resource selection by tag
//! (`filter_resources_matching_tags`), and the import of AWS tags as
//! monitoring host labels under the `TagsForCmkLabels` key of summary rows.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use regex::Regex;
use serde_json::Value;

/// Prefix for host labels derived from AWS tags.
pub const TAG_LABEL_PREFIX: &str = "cmk/aws/tag/";

/// Key under which imported tags are attached to summary rows.
pub const TAGS_FOR_CMK_LABELS_KEY: &str = "TagsForCmkLabels";

/// A single key/value pair as returned by the AWS tag APIs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    pub key: String,
    pub value: String,
}

impl Tag {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Extract `{Key, Value}` pairs from the `Tags` array of a raw AWS JSON row.
/// A missing or malformed array means the resource has no tags.
pub fn tags_of(row: &Value) -> Vec<Tag> {
    let Some(items) = row.get("Tags").and_then(|t| t.as_array()) else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| {
            let key = item.get("Key").and_then(|k| k.as_str())?;
            let value = item.get("Value").and_then(|v| v.as_str())?;
            Some(Tag::new(key, value))
        })
        .collect()
}

/// Tag filter from the CLI: one key with the set of accepted values.
#[derive(Debug, Clone, Default)]
pub struct TagFilter {
    pub pairs: Vec<Tag>,
}

impl TagFilter {
    pub fn from_cli(key: Option<&str>, values: &[String]) -> Option<Self> {
        let key = key?;
        Some(Self {
            pairs: values.iter().map(|v| Tag::new(key, v.clone())).collect(),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    fn matches(&self, tag: &Tag) -> bool {
        self.pairs
            .iter()
            .any(|p| p.key == tag.key && p.value == tag.value)
    }
}

/// Return the keys of `resources` that carry at least one tag whose key AND
/// value both appear in `tags_to_match`. An empty filter never matches.
pub fn filter_resources_matching_tags(
    resources: &BTreeMap<String, Vec<Tag>>,
    tags_to_match: &TagFilter,
) -> Vec<String> {
    if tags_to_match.is_empty() {
        return Vec::new();
    }
    resources
        .iter()
        .filter(|(_, tags)| tags.iter().any(|t| tags_to_match.matches(t)))
        .map(|(key, _)| key.clone())
        .collect()
}

/// Which AWS tags become monitoring host labels.
#[derive(Debug, Clone)]
pub enum TagImport {
    /// Every tag becomes a label.
    ImportAll,
    /// No tag becomes a label.
    IgnoreAll,
    /// Only tags whose key matches the pattern become labels.
    Filtered(Regex),
}

impl TagImport {
    pub fn from_cli(import_tags: bool, ignore_tags: bool, pattern: Option<&str>) -> Result<Self> {
        if ignore_tags {
            return Ok(Self::IgnoreAll);
        }
        match pattern {
            Some(p) => {
                let re = Regex::new(p)
                    .with_context(|| format!("invalid tag import pattern {:?}", p))?;
                Ok(Self::Filtered(re))
            }
            None if import_tags => Ok(Self::ImportAll),
            None => Ok(Self::IgnoreAll),
        }
    }

    /// Build the label mapping for one resource's raw tags.
    pub fn labels_for(&self, tags: &[Tag]) -> BTreeMap<String, String> {
        let keep: Box<dyn Fn(&Tag) -> bool> = match self {
            Self::ImportAll => Box::new(|_| true),
            Self::IgnoreAll => Box::new(|_| false),
            Self::Filtered(re) => Box::new(move |t: &Tag| re.is_match(&t.key)),
        };
        tags.iter()
            .filter(|t| keep(t))
            .map(|t| (format!("{}{}", TAG_LABEL_PREFIX, t.key), t.value.clone()))
            .collect()
    }

    /// Attach the imported tags of `tags` to a summary row under
    /// `TagsForCmkLabels`.
    pub fn attach_labels(&self, row: &mut Value, tags: &[Tag]) {
        if let Some(obj) = row.as_object_mut() {
            let labels: serde_json::Map<String, Value> = self
                .labels_for(tags)
                .into_iter()
                .map(|(k, v)| (k, Value::String(v)))
                .collect();
            obj.insert(TAGS_FOR_CMK_LABELS_KEY.to_string(), Value::Object(labels));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample_resources() -> BTreeMap<String, Vec<Tag>> {
        let mut resources = BTreeMap::new();
        resources.insert(
            "i-0001".to_string(),
            vec![Tag::new("env", "prod"), Tag::new("team", "storage")],
        );
        resources.insert("i-0002".to_string(), vec![Tag::new("env", "dev")]);
        resources.insert("i-0003".to_string(), Vec::new());
        resources
    }

    #[test]
    fn test_filter_matches_key_and_value() {
        let filter = TagFilter {
            pairs: vec![Tag::new("env", "prod")],
        };
        let matched = filter_resources_matching_tags(&sample_resources(), &filter);
        assert_eq!(matched, vec!["i-0001".to_string()]);
    }

    #[test]
    fn test_filter_requires_both_key_and_value() {
        // Key matches but value does not.
        let filter = TagFilter {
            pairs: vec![Tag::new("env", "staging")],
        };
        let matched = filter_resources_matching_tags(&sample_resources(), &filter);
        assert!(matched.is_empty());
    }

    #[test]
    fn test_empty_filter_yields_empty_set() {
        let filter = TagFilter::default();
        let matched = filter_resources_matching_tags(&sample_resources(), &filter);
        assert!(matched.is_empty());
    }

    #[test]
    fn test_import_all_keeps_every_tag() {
        let tags = vec![Tag::new("env", "prod"), Tag::new("team", "storage")];
        let labels = TagImport::ImportAll.labels_for(&tags);
        assert_eq!(labels.len(), 2);
        assert_eq!(labels["cmk/aws/tag/env"], "prod");
        assert_eq!(labels["cmk/aws/tag/team"], "storage");
    }

    #[test]
    fn test_ignore_all_keeps_nothing() {
        let tags = vec![Tag::new("env", "prod")];
        assert!(TagImport::IgnoreAll.labels_for(&tags).is_empty());
    }

    #[test]
    fn test_filtered_import_matches_key_pattern() {
        let tags = vec![
            Tag::new("env", "prod"),
            Tag::new("cost-center", "42"),
            Tag::new("environment", "qa"),
        ];
        let import = TagImport::from_cli(true, false, Some("^env")).unwrap();
        let labels = import.labels_for(&tags);
        assert_eq!(labels.len(), 2);
        assert!(labels.contains_key("cmk/aws/tag/env"));
        assert!(labels.contains_key("cmk/aws/tag/environment"));
    }

    #[test]
    fn test_attach_labels_writes_tags_for_cmk_labels() {
        let mut row = serde_json::json!({"ClusterName": "cluster-test1"});
        let tags = vec![Tag::new("env", "prod")];
        TagImport::ImportAll.attach_labels(&mut row, &tags);
        assert_eq!(
            row["TagsForCmkLabels"],
            serde_json::json!({"cmk/aws/tag/env": "prod"})
        );
    }

    #[test]
    fn test_tags_of_handles_missing_array() {
        assert!(tags_of(&serde_json::json!({})).is_empty());
        let row = serde_json::json!({"Tags": [{"Key": "env", "Value": "prod"}]});
        assert_eq!(tags_of(&row), vec![Tag::new("env", "prod")]);
    }
}
