use std::collections::BTreeMap;

use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};
use base64::engine::GeneralPurpose;
use base64::Engine;
use tonic::metadata::{
    AsciiMetadataKey, AsciiMetadataValue, BinaryMetadataKey, BinaryMetadataValue, KeyAndValueRef,
    MetadataMap,
};

use crate::error::{GrpcmdError, Result};

/// Message of the validation error raised for metadata outside 0x20-0x7E.
pub const NON_ASCII_METADATA: &str = "Metadata contains non-ASCII characters.";

/// Binary header values are accepted in any of these encodings, tried in order.
const BASE64_ENGINES: [GeneralPurpose; 4] = [STANDARD, URL_SAFE, STANDARD_NO_PAD, URL_SAFE_NO_PAD];

/// Names carrying the call status, reported through the status instead.
const STATUS_METADATA: [&str; 3] = ["grpc-status", "grpc-message", "grpc-status-details-bin"];

/// True when every character is printable ASCII (0x20-0x7E). Control
/// characters, including newlines, fail the check.
pub fn is_printable_ascii(text: &str) -> bool {
    text.bytes().all(|b| (0x20..=0x7e).contains(&b))
}

pub fn ensure_printable_ascii(text: &str) -> Result<()> {
    if is_printable_ascii(text) {
        Ok(())
    } else {
        Err(GrpcmdError::Validation(NON_ASCII_METADATA.to_string()))
    }
}

/// A request transcript split into its header lines and JSON body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestParts {
    /// `"Key: Value"` strings, one per header line, in order.
    pub headers: Vec<String>,
    pub body: String,
}

/// Split a combined `headers + blank line + body` text.
///
/// When only whitespace precedes the first `{`, the whole text is the body.
/// Otherwise the leading block is read as MIME-style header lines: keys are
/// canonicalized, indented lines continue the previous value, and a repeated
/// key yields one entry per occurrence. The block ends at the first blank
/// line, at the line holding the first `{`, or at the end of the text, and
/// whatever follows is the body.
pub fn split_headers_and_body(text: &str) -> Result<RequestParts> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Ok(RequestParts::default());
    }
    if let Some(start) = text.find('{') {
        if text[..start].trim().is_empty() {
            return Ok(RequestParts {
                headers: Vec::new(),
                body: text.to_string(),
            });
        }
    }

    let body_start = trimmed.find('{').unwrap_or(trimmed.len());
    let mut entries: Vec<(String, String)> = Vec::new();
    let mut consumed = 0;
    for raw in trimmed.split_inclusive('\n') {
        if consumed + raw.len() > body_start {
            break;
        }
        consumed += raw.len();
        let line = raw.trim_end_matches(['\n', '\r']);
        if line.trim().is_empty() {
            break;
        }

        if line.starts_with([' ', '\t']) {
            let Some((_, value)) = entries.last_mut() else {
                return Err(malformed_header(line));
            };
            if !value.is_empty() {
                value.push(' ');
            }
            value.push_str(line.trim());
            continue;
        }

        let (key, value) = line.split_once(':').ok_or_else(|| malformed_header(line))?;
        let key = key.trim();
        if key.is_empty() {
            return Err(malformed_header(line));
        }
        let key = canonical_header_key(key).ok_or_else(|| malformed_header(line))?;
        entries.push((key, value.trim().to_string()));
    }

    Ok(RequestParts {
        headers: entries
            .into_iter()
            .map(|(key, value)| format!("{key}: {value}"))
            .collect(),
        body: trimmed[consumed..].to_string(),
    })
}

fn malformed_header(line: &str) -> GrpcmdError {
    GrpcmdError::Validation(format!("malformed header line: {line:?}"))
}

/// MIME canonical form: `x-request-id` becomes `X-Request-Id`. `None` for
/// keys with characters outside the HTTP token set.
fn canonical_header_key(key: &str) -> Option<String> {
    let is_token = |c: char| c.is_ascii_alphanumeric() || "!#$%&'*+-.^_`|~".contains(c);
    if !key.chars().all(is_token) {
        return None;
    }

    let mut upper = true;
    let canonical = key
        .chars()
        .map(|c| {
            let out = if upper {
                c.to_ascii_uppercase()
            } else {
                c.to_ascii_lowercase()
            };
            upper = c == '-';
            out
        })
        .collect();
    Some(canonical)
}

/// Turn a flat JSON object into `"key:value"` header strings. Strings are
/// used as they are, other values as their JSON text. Blank input means no
/// headers.
pub fn parse_metadata_json(text: &str) -> Result<Vec<String>> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }

    let object: serde_json::Map<String, serde_json::Value> = serde_json::from_str(trimmed)
        .map_err(|e| GrpcmdError::Validation(format!("metadata is not a JSON object: {e}")))?;
    Ok(object
        .into_iter()
        .map(|(key, value)| match value {
            serde_json::Value::String(s) => format!("{key}:{s}"),
            other => format!("{key}:{other}"),
        })
        .collect())
}

/// Headers from a metadata block: printable ASCII is checked first, then
/// header lines and a JSON object body are both accepted.
pub fn parse_metadata(text: &str) -> Result<Vec<String>> {
    ensure_printable_ascii(text)?;
    let parts = split_headers_and_body(text)?;
    let mut headers = parts.headers;
    headers.extend(parse_metadata_json(&parts.body)?);
    Ok(headers)
}

/// Convert `"Name: Value"` strings into request metadata.
///
/// The name is everything before the first `:`, trimmed and lowercased.
/// Names ending in `-bin` take base64 values, falling back to the raw bytes
/// when no encoding fits. Entries that cannot be sent are skipped.
pub fn metadata_from_headers(headers: &[String]) -> MetadataMap {
    let mut map = MetadataMap::new();
    for header in headers {
        let (name, value) = header.split_once(':').unwrap_or((header.as_str(), ""));
        let name = name.trim().to_ascii_lowercase();
        if name.is_empty() {
            continue;
        }
        if let Err(reason) = append_header(&mut map, &name, value.trim()) {
            tracing::warn!(%header, "dropping header: {reason}");
        }
    }
    map
}

fn append_header(
    map: &mut MetadataMap,
    name: &str,
    value: &str,
) -> std::result::Result<(), &'static str> {
    if name.ends_with("-bin") {
        let key = BinaryMetadataKey::from_bytes(name.as_bytes())
            .map_err(|_| "invalid binary metadata key")?;
        let bytes = decode_base64(value).unwrap_or_else(|| value.as_bytes().to_vec());
        map.append_bin(key, BinaryMetadataValue::from_bytes(&bytes));
    } else {
        let key =
            AsciiMetadataKey::from_bytes(name.as_bytes()).map_err(|_| "invalid metadata key")?;
        let value = value
            .parse::<AsciiMetadataValue>()
            .map_err(|_| "invalid metadata value")?;
        map.append(key, value);
    }
    Ok(())
}

fn decode_base64(value: &str) -> Option<Vec<u8>> {
    BASE64_ENGINES
        .iter()
        .find_map(|engine| engine.decode(value).ok())
}

/// Flatten received metadata into a name to value mapping.
///
/// Repeated names are joined with `", "`, binary values are base64 encoded,
/// and the status entries are left out.
pub fn metadata_to_map(md: &MetadataMap) -> BTreeMap<String, String> {
    let mut map: BTreeMap<String, String> = BTreeMap::new();
    for entry in md.iter() {
        let (name, value) = match entry {
            KeyAndValueRef::Ascii(key, value) => (
                key.as_str(),
                String::from_utf8_lossy(value.as_encoded_bytes()).into_owned(),
            ),
            KeyAndValueRef::Binary(key, value) => (
                key.as_str(),
                value
                    .to_bytes()
                    .map(|bytes| STANDARD.encode(bytes))
                    .unwrap_or_else(|_| String::from_utf8_lossy(value.as_encoded_bytes()).into_owned()),
            ),
        };
        if STATUS_METADATA.contains(&name) {
            continue;
        }
        map.entry(name.to_string())
            .and_modify(|joined| {
                joined.push_str(", ");
                joined.push_str(&value);
            })
            .or_insert_with(|| value.clone());
    }
    map
}
