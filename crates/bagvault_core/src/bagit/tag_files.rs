//! Tag file rendering and parsing.
//!
//! Output is byte-stable: LF line endings, fixed field order, manifest
//! lines sorted by encoded path with a two-space separator.

use super::{decode_manifest_path, encode_manifest_path, BAGIT_VERSION, TAG_FILE_ENCODING};
use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;

static MANIFEST_LINE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([0-9A-Fa-f]+)[ \t]+(\S.*)$").expect("valid manifest line regex"));

/// Renders `bagit.txt`.
pub fn render_declaration() -> String {
    format!("BagIt-Version: {BAGIT_VERSION}\nTag-File-Character-Encoding: {TAG_FILE_ENCODING}\n")
}

/// Metadata written to `bag-info.txt`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BagInfo {
    pub software_agent: String,
    pub bagging_date: NaiveDate,
    pub payload_bytes: u64,
    pub payload_files: u64,
    pub source_organization: Option<String>,
    pub external_description: String,
    pub external_identifier: String,
    pub internal_sender_identifier: String,
}

impl BagInfo {
    /// `Payload-Oxum` value: `<octets>.<stream count>`.
    pub fn payload_oxum(&self) -> String {
        format!("{}.{}", self.payload_bytes, self.payload_files)
    }

    pub fn render(&self) -> String {
        let mut fields = vec![
            ("Bag-Software-Agent", self.software_agent.clone()),
            (
                "Bagging-Date",
                self.bagging_date.format("%Y-%m-%d").to_string(),
            ),
            ("Payload-Oxum", self.payload_oxum()),
            ("Bag-Size", format_bytes(self.payload_bytes)),
        ];
        if let Some(organization) = &self.source_organization {
            fields.push(("Source-Organization", organization.clone()));
        }
        fields.push(("External-Description", self.external_description.clone()));
        fields.push(("External-Identifier", self.external_identifier.clone()));
        fields.push((
            "Internal-Sender-Identifier",
            self.internal_sender_identifier.clone(),
        ));

        let mut out = String::new();
        for (label, value) in fields {
            out.push_str(label);
            out.push_str(": ");
            out.push_str(&fold_value(&value));
            out.push('\n');
        }
        out
    }
}

// Multi-line values become indented continuation lines.
fn fold_value(value: &str) -> String {
    value
        .lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n  ")
}

/// Parses `Label: value` tag files, joining indented continuation lines.
///
/// Returns `Err(line_number)` (1-based) for a malformed line.
pub fn parse_tag_fields(content: &str) -> Result<Vec<(String, String)>, usize> {
    let mut fields: Vec<(String, String)> = Vec::new();
    for (index, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        if line.starts_with(' ') || line.starts_with('\t') {
            match fields.last_mut() {
                Some((_, value)) => {
                    value.push('\n');
                    value.push_str(line.trim());
                    continue;
                }
                None => return Err(index + 1),
            }
        }
        let (label, value) = line.split_once(':').ok_or(index + 1)?;
        let label = label.trim();
        if label.is_empty() {
            return Err(index + 1);
        }
        fields.push((label.to_string(), value.trim().to_string()));
    }
    Ok(fields)
}

/// Renders a manifest from `(digest, bag-relative path)` pairs.
///
/// Lines are sorted by encoded path so input order never changes output.
pub fn render_manifest<'a>(entries: impl IntoIterator<Item = (&'a str, &'a str)>) -> String {
    let mut lines: Vec<(String, &str)> = entries
        .into_iter()
        .map(|(digest, path)| (encode_manifest_path(path), digest))
        .collect();
    lines.sort_by(|left, right| left.0.cmp(&right.0));

    let mut out = String::new();
    for (path, digest) in lines {
        out.push_str(digest);
        out.push_str("  ");
        out.push_str(&path);
        out.push('\n');
    }
    out
}

/// Parses one manifest line into `(lowercase digest, decoded path)`.
pub fn parse_manifest_line(line: &str) -> Option<(String, String)> {
    let captures = MANIFEST_LINE_RE.captures(line.trim_end_matches('\r'))?;
    Some((
        captures[1].to_ascii_lowercase(),
        decode_manifest_path(&captures[2]),
    ))
}

/// Human-readable size used for `Bag-Size`.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    const THRESHOLD: f64 = 1024.0;

    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let bytes_f = bytes as f64;
    let unit_index = (bytes_f.log(THRESHOLD).floor() as usize).min(UNITS.len() - 1);
    let value = bytes_f / THRESHOLD.powi(unit_index as i32);
    format!("{value:.1} {}", UNITS[unit_index])
}
