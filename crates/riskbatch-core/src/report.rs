use crate::scoring::GroupStatistics;
use crate::{BatchId, ContractError, TenantId};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt::Write as _;

pub const REPORT_FORMAT_VERSION: &str = "batch-report.v1";

/// Everything a renderer needs to produce a batch report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportData {
    pub tenant_id: TenantId,
    pub tenant_name: String,
    pub batch_id: BatchId,
    pub batch_title: String,
    pub batch_index: Option<i64>,
    pub assessments_total: u32,
    pub assessments_completed: u32,
    pub assessments_deactivated: u32,
    pub groups: Vec<GroupStatistics>,
    pub issued_by: String,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedDocument {
    pub bytes: Vec<u8>,
    pub media_type: &'static str,
    pub extension: &'static str,
}

impl RenderedDocument {
    pub fn content_hash(&self) -> String {
        sha256_hex(&self.bytes)
    }
}

pub trait ReportRenderer {
    fn render(&self, data: &ReportData) -> Result<RenderedDocument, ContractError>;
}

/// Deterministic text rendering; the same data always yields the same bytes.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainTextRenderer;

impl ReportRenderer for PlainTextRenderer {
    fn render(&self, data: &ReportData) -> Result<RenderedDocument, ContractError> {
        let mut out = String::new();
        let fmt_err = |err: std::fmt::Error| ContractError::Render(err.to_string());

        writeln!(out, "Psychosocial risk assessment report").map_err(fmt_err)?;
        writeln!(out, "format: {REPORT_FORMAT_VERSION}").map_err(fmt_err)?;
        writeln!(out, "tenant: {} (#{})", data.tenant_name, data.tenant_id).map_err(fmt_err)?;
        let batch_line = match data.batch_index {
            Some(index) => writeln!(
                out,
                "batch: {} (#{}, index {index})",
                data.batch_title, data.batch_id
            ),
            None => writeln!(out, "batch: {} (#{})", data.batch_title, data.batch_id),
        };
        batch_line.map_err(fmt_err)?;
        writeln!(
            out,
            "assessments: {} total, {} completed, {} deactivated",
            data.assessments_total, data.assessments_completed, data.assessments_deactivated
        )
        .map_err(fmt_err)?;
        writeln!(
            out,
            "generated: {} by {}",
            data.generated_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            data.issued_by
        )
        .map_err(fmt_err)?;
        writeln!(out).map_err(fmt_err)?;

        if data.groups.is_empty() {
            writeln!(out, "no group scores recorded").map_err(fmt_err)?;
        }
        for group in &data.groups {
            writeln!(
                out,
                "{:>2}. {:<36} n={:<4} mean={:>6.2} sd={:>6.2} risk={}",
                group.group,
                group.name,
                group.respondents,
                group.mean,
                group.std_dev,
                group.risk.as_str()
            )
            .map_err(fmt_err)?;
        }

        Ok(RenderedDocument {
            bytes: out.into_bytes(),
            media_type: "text/plain; charset=utf-8",
            extension: "txt",
        })
    }
}

/// Machine-readable companion artifact written next to the document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportMetadata {
    pub format: String,
    pub batch_id: BatchId,
    pub tenant_id: TenantId,
    pub content_hash: String,
    pub media_type: String,
    pub document_location: String,
    pub issued_by: String,
    pub generated_at: DateTime<Utc>,
    pub groups: Vec<GroupStatistics>,
}

impl ReportMetadata {
    pub fn new(data: &ReportData, document: &RenderedDocument, document_location: &str) -> Self {
        Self {
            format: REPORT_FORMAT_VERSION.to_string(),
            batch_id: data.batch_id,
            tenant_id: data.tenant_id,
            content_hash: document.content_hash(),
            media_type: document.media_type.to_string(),
            document_location: document_location.to_string(),
            issued_by: data.issued_by.clone(),
            generated_at: data.generated_at,
            groups: data.groups.clone(),
        }
    }

    pub fn to_canonical_json(&self) -> Result<String, ContractError> {
        canonical_json(self)
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    Sha256::digest(bytes)
        .iter()
        .fold(String::with_capacity(64), |mut hex, byte| {
            let _ = write!(hex, "{byte:02x}");
            hex
        })
}

/// JSON with the keys of every object in byte order, so equal metadata
/// always serializes to identical bytes.
pub fn canonical_json<T: Serialize>(value: &T) -> Result<String, ContractError> {
    let mut json = serde_json::to_value(value).map_err(serialization_error)?;
    sort_object_keys(&mut json);
    serde_json::to_string(&json).map_err(serialization_error)
}

fn sort_object_keys(value: &mut Value) {
    match value {
        Value::Object(object) => {
            let sorted: BTreeMap<String, Value> = std::mem::take(object).into_iter().collect();
            object.extend(sorted.into_iter().map(|(key, mut child)| {
                sort_object_keys(&mut child);
                (key, child)
            }));
        }
        Value::Array(items) => items.iter_mut().for_each(sort_object_keys),
        _ => {}
    }
}

fn serialization_error(err: serde_json::Error) -> ContractError {
    ContractError::Serialization(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scoring::{summarize_group, GroupCatalog};
    use chrono::TimeZone;

    fn sample_data() -> ReportData {
        let catalog = GroupCatalog::default();
        let groups = catalog
            .groups()
            .iter()
            .take(2)
            .filter_map(|definition| summarize_group(definition, &[20.0, 70.0]))
            .collect();
        ReportData {
            tenant_id: TenantId(7),
            tenant_name: "Clinica Horizonte".to_string(),
            batch_id: BatchId(42),
            batch_title: "Annual survey".to_string(),
            batch_index: Some(3),
            assessments_total: 2,
            assessments_completed: 2,
            assessments_deactivated: 0,
            groups,
            issued_by: "52998224725".to_string(),
            generated_at: Utc
                .with_ymd_and_hms(2026, 3, 1, 12, 0, 0)
                .single()
                .expect("valid timestamp"),
        }
    }

    #[test]
    fn plain_text_rendering_is_deterministic() {
        let data = sample_data();
        let first = PlainTextRenderer.render(&data).expect("render");
        let second = PlainTextRenderer.render(&data).expect("render");
        assert_eq!(first.content_hash(), second.content_hash());
        assert_eq!(first.content_hash().len(), 64);

        let text = String::from_utf8(first.bytes).expect("utf8");
        assert!(text.contains("batch: Annual survey (#42, index 3)"));
        assert!(text.contains("Work demands"));
    }

    #[test]
    fn hash_changes_with_content() {
        let data = sample_data();
        let mut other = sample_data();
        other.assessments_deactivated = 1;
        let a = PlainTextRenderer.render(&data).expect("render");
        let b = PlainTextRenderer.render(&other).expect("render");
        assert_ne!(a.content_hash(), b.content_hash());
    }

    #[test]
    fn metadata_json_is_key_sorted_and_carries_hash() {
        let data = sample_data();
        let document = PlainTextRenderer.render(&data).expect("render");
        let metadata = ReportMetadata::new(&data, &document, "reports/42.txt");
        let json = metadata.to_canonical_json().expect("json");
        assert!(json.starts_with("{\"batch_id\":42"));
        assert!(json.contains(&document.content_hash()));
    }

    #[test]
    fn canonical_json_sorts_nested_object_keys() {
        let value = serde_json::json!({
            "b": { "z": 1, "a": [{ "y": true, "x": null }] },
            "a": 0
        });
        assert_eq!(
            canonical_json(&value).expect("json"),
            r#"{"a":0,"b":{"a":[{"x":null,"y":true}],"z":1}}"#
        );
    }

    #[test]
    fn sha256_hex_matches_known_vector() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
