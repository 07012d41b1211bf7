//! HP StoreOnce appliance scraping.
//!
//! The appliance exposes cluster and service-set information as XML over
//! HTTPS. The agent flattens the property elements into tab-separated
//! key/value rows; the parsing is schema-free because the relevant documents
//! are flat `<properties>` bags of leaf elements.

use anyhow::{Context, Result};
use quick_xml::events::Event;
use quick_xml::Reader;

pub const CLUSTER_PATH: &str = "/storeonceservices/cluster/";
pub const SERVICESETS_PATH: &str = "/storeonceservices/cluster/servicesets/";

#[derive(Debug, Clone)]
pub struct StoreOnceConfig {
    pub address: String,
    pub user: String,
    pub password: String,
    pub verify_tls: bool,
}

pub struct StoreOnceClient {
    config: StoreOnceConfig,
    http: reqwest::blocking::Client,
}

impl StoreOnceClient {
    pub fn new(config: StoreOnceConfig) -> Result<Self> {
        let http = reqwest::blocking::Client::builder()
            .danger_accept_invalid_certs(!config.verify_tls)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self { config, http })
    }

    pub fn fetch_xml(&self, path: &str) -> Result<String> {
        let url = format!("https://{}{}", self.config.address, path);
        let response = self
            .http
            .get(&url)
            .basic_auth(&self.config.user, Some(&self.config.password))
            .header("Accept", "text/xml")
            .send()
            .with_context(|| format!("request to {} failed", url))?
            .error_for_status()
            .with_context(|| format!("appliance rejected {}", url))?;
        response.text().context("failed to read appliance response")
    }
}

/// Flatten every leaf element into `(element name, text)` pairs, in document
/// order. Nested container elements contribute nothing themselves.
pub fn parse_properties(xml: &str) -> Result<Vec<(String, String)>> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut properties = Vec::new();
    let mut current: Option<String> = None;
    let mut buf = Vec::new();
    loop {
        match reader
            .read_event_into(&mut buf)
            .context("malformed appliance XML")?
        {
            Event::Start(e) => {
                current = Some(String::from_utf8_lossy(e.name().as_ref()).to_string());
            }
            Event::Text(t) => {
                if let Some(name) = current.take() {
                    let text = t.unescape().context("malformed appliance XML text")?;
                    properties.push((name, text.to_string()));
                }
            }
            Event::End(_) => {
                current = None;
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(properties)
}

/// Render one agent section of tab-separated key/value rows.
pub fn write_section<W: std::io::Write>(
    writer: &mut W,
    name: &str,
    properties: &[(String, String)],
) -> Result<()> {
    writeln!(writer, "<<<storeonce_{}:sep(9)>>>", name)?;
    for (key, value) in properties {
        writeln!(writer, "{}\t{}", key, value)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const CLUSTER_XML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
        <cluster>
          <properties>
            <applianceName>storeonce-1</applianceName>
            <network>10.0.0.5</network>
            <serialNumber>CZ25110</serialNumber>
            <healthLevelString>OK</healthLevelString>
          </properties>
        </cluster>"#;

    #[test]
    fn test_leaf_elements_become_key_value_pairs() {
        let properties = parse_properties(CLUSTER_XML).unwrap();
        assert_eq!(
            properties,
            vec![
                ("applianceName".to_string(), "storeonce-1".to_string()),
                ("network".to_string(), "10.0.0.5".to_string()),
                ("serialNumber".to_string(), "CZ25110".to_string()),
                ("healthLevelString".to_string(), "OK".to_string()),
            ]
        );
    }

    #[test]
    fn test_section_rendering_is_tab_separated() {
        let properties = vec![("applianceName".to_string(), "storeonce-1".to_string())];
        let mut buf = Vec::new();
        write_section(&mut buf, "clusterinfo", &properties).unwrap();
        assert_eq!(
            String::from_utf8(buf).unwrap(),
            "<<<storeonce_clusterinfo:sep(9)>>>\napplianceName\tstoreonce-1\n"
        );
    }

    #[test]
    fn test_multiple_service_sets_flatten_in_document_order() {
        let xml = r#"<servicesets>
            <serviceset><properties><ssid>1</ssid><health>OK</health></properties></serviceset>
            <serviceset><properties><ssid>2</ssid><health>WARNING</health></properties></serviceset>
        </servicesets>"#;
        let properties = parse_properties(xml).unwrap();
        assert_eq!(
            properties,
            vec![
                ("ssid".to_string(), "1".to_string()),
                ("health".to_string(), "OK".to_string()),
                ("ssid".to_string(), "2".to_string()),
                ("health".to_string(), "WARNING".to_string()),
            ]
        );
    }
}
