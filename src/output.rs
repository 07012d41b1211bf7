//! Line-oriented agent output.
//!
//! The monitoring server consumes a sequence of marker-delimited blocks:
//!
//! ```text
//! <<<aws_ec2_summary>>>
//! [{"InstanceId": "..."}]
//! <<<<i-0123456789>>>>
//! <<<aws_ec2:cached(1700000000,660)>>>
//! [...]
//! <<<labels:sep(0)>>>
//! {"cmk/aws/tag/env": "prod"}
//! <<<<>>>>
//! <<<aws_exceptions>>>
//! No exceptions
//! ```
//!
//! Host-scoped blocks start with `<<<aws_<name>>>>`; when a section's cache
//! interval exceeds 60 seconds the header carries a `cached(ts,max_age)`
//! annotation so the server knows how stale the data may be. Piggyback blocks
//! are wrapped in `<<<<host>>>>` ... `<<<<>>>>`.

use std::collections::BTreeMap;
use std::io::Write;

use anyhow::Result;
use serde_json::Value;

use crate::section::SectionOutput;

/// Extra slack added to a section's cache interval in the `cached(...)`
/// annotation, covering poll jitter.
const CACHE_AGE_SLACK: u64 = 60;

pub struct AgentOutput<W: Write> {
    writer: W,
}

impl<W: Write> AgentOutput<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    fn section_header(&mut self, name: &str, timestamp: i64, cache_interval: u64) -> Result<()> {
        if cache_interval > 60 {
            writeln!(
                self.writer,
                "<<<aws_{}:cached({},{})>>>",
                name,
                timestamp,
                cache_interval + CACHE_AGE_SLACK
            )?;
        } else {
            writeln!(self.writer, "<<<aws_{}>>>", name)?;
        }
        Ok(())
    }

    fn rows(&mut self, payload: &Value) -> Result<()> {
        writeln!(self.writer, "{}", serde_json::to_string(payload)?)?;
        Ok(())
    }

    /// Emit the host-scoped results of one section run.
    pub fn write_host_results(&mut self, output: &SectionOutput) -> Result<()> {
        let host_results: Vec<_> = output
            .results
            .iter()
            .filter(|r| r.piggyback_host.is_empty())
            .collect();
        if host_results.is_empty() {
            return Ok(());
        }
        self.section_header(&output.name, output.timestamp, output.cache_interval)?;
        for result in host_results {
            self.rows(&result.payload)?;
        }
        Ok(())
    }

    /// Emit one piggyback host's wrapper with its section blocks and labels.
    pub fn write_piggyback_host(
        &mut self,
        host: &str,
        blocks: &[(&SectionOutput, &Value)],
        labels: &BTreeMap<String, String>,
    ) -> Result<()> {
        writeln!(self.writer, "<<<<{}>>>>", host)?;
        for (output, payload) in blocks {
            self.section_header(&output.name, output.timestamp, output.cache_interval)?;
            self.rows(payload)?;
        }
        if !labels.is_empty() {
            self.write_labels(labels)?;
        }
        writeln!(self.writer, "<<<<>>>>")?;
        Ok(())
    }

    /// Emit the host-label block.
    pub fn write_labels(&mut self, labels: &BTreeMap<String, String>) -> Result<()> {
        writeln!(self.writer, "<<<labels:sep(0)>>>")?;
        let map: serde_json::Map<String, Value> = labels
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect();
        writeln!(self.writer, "{}", serde_json::to_string(&Value::Object(map))?)?;
        Ok(())
    }

    /// Always emitted, even when everything went fine.
    pub fn write_exceptions(&mut self, exceptions: &[String]) -> Result<()> {
        writeln!(self.writer, "<<<aws_exceptions>>>")?;
        if exceptions.is_empty() {
            writeln!(self.writer, "No exceptions")?;
        } else {
            for line in exceptions {
                // Keep the block line-oriented no matter what the message holds.
                writeln!(self.writer, "{}", line.replace('\n', " "))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::section::{ComputedContent, SectionResult};
    use pretty_assertions::assert_eq;

    fn sample_output(name: &str, interval: u64, rows: Value) -> SectionOutput {
        SectionOutput {
            name: name.to_string(),
            cache_interval: interval,
            from_cache: false,
            timestamp: 1700000000,
            computed: ComputedContent {
                payload: rows.clone(),
                timestamp: 1700000000,
            },
            results: vec![SectionResult::for_host(rows)],
        }
    }

    fn render<F: FnOnce(&mut AgentOutput<&mut Vec<u8>>)>(f: F) -> String {
        let mut buf = Vec::new();
        let mut out = AgentOutput::new(&mut buf);
        f(&mut out);
        String::from_utf8(buf).unwrap()
    }

    #[test]
    fn test_plain_section_header() {
        let output = sample_output("ec2_summary", 60, serde_json::json!([{"Id": "i-1"}]));
        let text = render(|out| out.write_host_results(&output).unwrap());
        assert_eq!(text, "<<<aws_ec2_summary>>>\n[{\"Id\":\"i-1\"}]\n");
    }

    #[test]
    fn test_cached_header_above_sixty_seconds() {
        let output = sample_output("s3_summary", 600, serde_json::json!([1]));
        let text = render(|out| out.write_host_results(&output).unwrap());
        assert!(text.starts_with("<<<aws_s3_summary:cached(1700000000,660)>>>\n"));
    }

    #[test]
    fn test_piggyback_wrapper_with_labels() {
        let output = sample_output("ec2", 0, serde_json::json!([{"Id": "m1"}]));
        let payload = serde_json::json!([{"Id": "m1"}]);
        let mut labels = BTreeMap::new();
        labels.insert("cmk/aws/tag/env".to_string(), "prod".to_string());

        let text = render(|out| {
            out.write_piggyback_host("i-0001", &[(&output, &payload)], &labels)
                .unwrap()
        });
        assert_eq!(
            text,
            "<<<<i-0001>>>>\n\
             <<<aws_ec2>>>\n\
             [{\"Id\":\"m1\"}]\n\
             <<<labels:sep(0)>>>\n\
             {\"cmk/aws/tag/env\":\"prod\"}\n\
             <<<<>>>>\n"
        );
    }

    #[test]
    fn test_exceptions_block_when_clean() {
        let text = render(|out| out.write_exceptions(&[]).unwrap());
        assert_eq!(text, "<<<aws_exceptions>>>\nNo exceptions\n");
    }

    #[test]
    fn test_exceptions_block_is_line_oriented() {
        let text = render(|out| {
            out.write_exceptions(&["ec2_summary: Rate\nexceeded".to_string()])
                .unwrap()
        });
        assert_eq!(text, "<<<aws_exceptions>>>\nec2_summary: Rate exceeded\n");
    }
}
