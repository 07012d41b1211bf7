//! Salesforce instance-status feed parser.
//!
//! Legacy check: the agent side only delivers the pre-fetched JSON documents
//! from the Salesforce status API, one per line. This module parses them,
//! discovers one item per instance key and assesses the reported status.

use std::collections::BTreeMap;

use anyhow::Result;
use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct InstanceStatus {
    pub key: String,
    #[serde(default = "unknown_status")]
    pub status: String,
    #[serde(default)]
    pub active: bool,
}

fn unknown_status() -> String {
    "UNKNOWN".to_string()
}

/// Monitoring state of one parsed instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckState {
    Ok,
    Warn,
    Crit,
}

/// Parse the agent payload: each line is one JSON document describing either
/// a single instance (object) or a list of instances. Unparseable lines are
/// skipped, not fatal.
pub fn parse_status_feed(lines: &[&str]) -> Result<BTreeMap<String, InstanceStatus>> {
    let mut instances = BTreeMap::new();
    for line in lines {
        let Ok(doc) = serde_json::from_str::<Value>(line) else {
            continue;
        };
        match doc {
            Value::Array(items) => {
                for item in items {
                    if let Ok(instance) = serde_json::from_value::<InstanceStatus>(item) {
                        instances.insert(instance.key.clone(), instance);
                    }
                }
            }
            item => {
                if let Ok(instance) = serde_json::from_value::<InstanceStatus>(item) {
                    instances.insert(instance.key.clone(), instance);
                }
            }
        }
    }
    Ok(instances)
}

/// Status assessment per the Salesforce status vocabulary.
pub fn check_state(instance: &InstanceStatus) -> CheckState {
    match instance.status.as_str() {
        "OK" | "HEALTHY" => CheckState::Ok,
        "MAINTENANCE" | "MINOR_INCIDENT_CORE" | "MINOR_INCIDENT_NONCORE" => CheckState::Warn,
        _ => CheckState::Crit,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const FEED: &str = r#"[{"key": "NA1", "status": "OK", "active": true},
        {"key": "EU2", "status": "MAINTENANCE", "active": true}]"#;

    #[test]
    fn test_parse_discovers_one_item_per_instance_key() {
        let instances = parse_status_feed(&[&FEED.replace('\n', " ")]).unwrap();
        assert_eq!(instances.len(), 2);
        assert!(instances.contains_key("NA1"));
        assert!(instances.contains_key("EU2"));
    }

    #[test]
    fn test_single_object_lines_are_accepted() {
        let instances =
            parse_status_feed(&[r#"{"key": "AP0", "status": "HEALTHY", "active": true}"#]).unwrap();
        assert_eq!(instances["AP0"].status, "HEALTHY");
    }

    #[test]
    fn test_garbage_lines_are_skipped() {
        let instances = parse_status_feed(&["not json", r#"{"key": "NA1", "status": "OK"}"#])
            .unwrap();
        assert_eq!(instances.len(), 1);
    }

    #[test]
    fn test_status_assessment() {
        let ok = InstanceStatus {
            key: "NA1".into(),
            status: "HEALTHY".into(),
            active: true,
        };
        assert_eq!(check_state(&ok), CheckState::Ok);

        let warn = InstanceStatus {
            status: "MAINTENANCE".into(),
            ..ok.clone()
        };
        assert_eq!(check_state(&warn), CheckState::Warn);

        let crit = InstanceStatus {
            status: "MAJOR_INCIDENT_CORE".into(),
            ..ok
        };
        assert_eq!(check_state(&crit), CheckState::Crit);
    }
}
