//! Report collaborators: parsing, persistence and the ingestion log.
//!
//! The fetcher only knows the three traits; the bundled implementations
//! cover the common case of raw or gzip-packed DMARC aggregate XML kept in
//! memory for the duration of a run.

use std::collections::HashSet;
use std::io::Read;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use quick_xml::events::Event;
use tracing::{info, warn};

use crate::source::SourceKind;

/// The envelope of one aggregate report, enough to identify and register
/// it.
#[derive(Debug, Clone, Default)]
pub struct ParsedReport {
    pub org_name: String,
    /// The `report_id` assigned by the reporting organization.
    pub external_id: String,
    /// Domain the published policy applies to.
    pub domain: String,
    pub date_begin: Option<i64>,
    pub date_end: Option<i64>,
}

#[derive(Debug, Clone, Copy)]
pub struct StoreResult {
    pub id: u64,
}

pub trait ReportParser {
    fn parse(&self, data: &[u8], filename: &str) -> Result<ParsedReport>;
}

pub trait ReportStore {
    fn save(&mut self, report: &ParsedReport, filename: &str) -> Result<StoreResult>;
}

/// Per-report audit trail of the ingestion run.
pub trait RunLog {
    fn log_success(&self, kind: SourceKind, filename: Option<&str>, report: &ParsedReport);
    fn log_failure(
        &self,
        kind: SourceKind,
        filename: Option<&str>,
        report: Option<&ParsedReport>,
        message: Option<&str>,
    );
}

/// Parser for aggregate report XML, raw or gzip-packed.
#[derive(Debug, Default)]
pub struct XmlReportParser;

impl ReportParser for XmlReportParser {
    fn parse(&self, data: &[u8], filename: &str) -> Result<ParsedReport> {
        let xml = if data.starts_with(&[0x1f, 0x8b]) {
            let mut decoder = flate2::read::GzDecoder::new(data);
            let mut xml = Vec::new();
            decoder
                .read_to_end(&mut xml)
                .with_context(|| format!("failed to unpack {filename}"))?;
            xml
        } else if data.starts_with(b"PK") {
            bail!("{filename}: zip-packed reports are not supported by the built-in parser");
        } else {
            data.to_vec()
        };

        parse_aggregate_xml(&xml).with_context(|| format!("failed to parse {filename}"))
    }
}

fn parse_aggregate_xml(xml: &[u8]) -> Result<ParsedReport> {
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(true);

    let mut report = ParsedReport::default();
    let mut path: Vec<String> = Vec::new();
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(start) => {
                path.push(String::from_utf8_lossy(start.name().as_ref()).to_lowercase());
            }
            Event::End(_) => {
                path.pop();
            }
            Event::Text(text) => {
                let value = text.unescape()?.trim().to_string();
                if value.is_empty() {
                    continue;
                }
                match tail(&path) {
                    ("report_metadata", "org_name") => report.org_name = value,
                    ("report_metadata", "report_id") => report.external_id = value,
                    ("date_range", "begin") => report.date_begin = value.parse().ok(),
                    ("date_range", "end") => report.date_end = value.parse().ok(),
                    ("policy_published", "domain") => report.domain = value,
                    _ => {}
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    if report.org_name.is_empty() {
        bail!("the report has no org_name");
    }
    if report.external_id.is_empty() {
        bail!("the report has no report_id");
    }
    if report.domain.is_empty() {
        bail!("the report has no published policy domain");
    }
    Ok(report)
}

fn tail(path: &[String]) -> (&str, &str) {
    match path {
        [.., parent, name] => (parent.as_str(), name.as_str()),
        [name] => ("", name.as_str()),
        [] => ("", ""),
    }
}

/// In-memory store enforcing (domain, report id) uniqueness for the run.
#[derive(Debug, Default)]
pub struct MemoryReportStore {
    seen: HashSet<(String, String)>,
    next_id: u64,
}

impl ReportStore for MemoryReportStore {
    fn save(&mut self, report: &ParsedReport, _filename: &str) -> Result<StoreResult> {
        let key = (report.domain.to_lowercase(), report.external_id.clone());
        if !self.seen.insert(key) {
            bail!(
                "report {} for domain {} is already loaded",
                report.external_id,
                report.domain
            );
        }
        self.next_id += 1;
        Ok(StoreResult { id: self.next_id })
    }
}

/// Run log that writes one structured event per report.
#[derive(Debug, Default)]
pub struct TracingRunLog;

impl RunLog for TracingRunLog {
    fn log_success(&self, kind: SourceKind, filename: Option<&str>, report: &ParsedReport) {
        info!(
            target: "report_log",
            source = %kind,
            filename = filename.unwrap_or("-"),
            domain = %report.domain,
            report_id = %report.external_id,
            event_time = %Utc::now().format("%Y-%m-%d %H:%M:%S"),
            success = true,
            "report loaded"
        );
    }

    fn log_failure(
        &self,
        kind: SourceKind,
        filename: Option<&str>,
        report: Option<&ParsedReport>,
        message: Option<&str>,
    ) {
        warn!(
            target: "report_log",
            source = %kind,
            filename = filename.unwrap_or("-"),
            domain = report.map(|r| r.domain.as_str()).unwrap_or("-"),
            report_id = report.map(|r| r.external_id.as_str()).unwrap_or("-"),
            event_time = %Utc::now().format("%Y-%m-%d %H:%M:%S"),
            success = false,
            message = message.unwrap_or("unknown error"),
            "report not loaded"
        );
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    const SAMPLE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<feedback>
  <report_metadata>
    <org_name>acme.example</org_name>
    <email>noreply@acme.example</email>
    <report_id>8842911465038797308</report_id>
    <date_range>
      <begin>1688342400</begin>
      <end>1688428799</end>
    </date_range>
  </report_metadata>
  <policy_published>
    <domain>shop.example</domain>
    <p>none</p>
  </policy_published>
  <record>
    <row><source_ip>192.0.2.7</source_ip><count>2</count></row>
  </record>
</feedback>"#;

    #[test]
    fn parses_raw_xml() {
        let report = XmlReportParser.parse(SAMPLE.as_bytes(), "r.xml").unwrap();
        assert_eq!(report.org_name, "acme.example");
        assert_eq!(report.external_id, "8842911465038797308");
        assert_eq!(report.domain, "shop.example");
        assert_eq!(report.date_begin, Some(1_688_342_400));
        assert_eq!(report.date_end, Some(1_688_428_799));
    }

    #[test]
    fn parses_gzip_packed_xml() {
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(SAMPLE.as_bytes()).unwrap();
        let packed = encoder.finish().unwrap();

        let report = XmlReportParser.parse(&packed, "r.xml.gz").unwrap();
        assert_eq!(report.domain, "shop.example");
    }

    #[test]
    fn rejects_zip_payloads() {
        let err = XmlReportParser
            .parse(b"PK\x03\x04rest-of-archive", "r.zip")
            .unwrap_err();
        assert!(err.to_string().contains("zip"));
    }

    #[test]
    fn rejects_reports_without_identity() {
        let xml = "<feedback><report_metadata><org_name>a</org_name>\
                   </report_metadata></feedback>";
        assert!(XmlReportParser.parse(xml.as_bytes(), "r.xml").is_err());
    }

    #[test]
    fn store_rejects_duplicates_ignoring_domain_case() {
        let report = ParsedReport {
            org_name: "acme".to_string(),
            external_id: "id-1".to_string(),
            domain: "Shop.Example".to_string(),
            ..ParsedReport::default()
        };
        let mut store = MemoryReportStore::default();
        store.save(&report, "test").unwrap();

        let same = ParsedReport {
            domain: "shop.example".to_string(),
            ..report.clone()
        };
        assert!(store.save(&same, "test").is_err());

        let other = ParsedReport {
            external_id: "id-2".to_string(),
            ..report
        };
        assert!(store.save(&other, "test").is_ok());
    }
}
