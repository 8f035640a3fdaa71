//! Parsing and repair of AI analysis responses.
//!
//! Models wrap JSON in Markdown fences, add prose around it, emit
//! typographic quotes, and leave trailing commas. Parsing tries the raw
//! text first and only then applies the repair pass.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use resonance_core::{DerivedFields, Error, Result};

static CODE_FENCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)```[A-Za-z0-9_-]*[ \t]*\r?\n?(.*?)```").expect("valid code fence regex")
});

static TRAILING_COMMA: Lazy<Regex> =
    Lazy::new(|| Regex::new(r",(\s*[}\]])").expect("valid trailing comma regex"));

/// Descriptive fields extracted from one analysis payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SongAnalysis {
    pub description: String,
    pub genres: Vec<String>,
    pub moods: Vec<String>,
    pub themes: Vec<String>,
    /// 0.0 (calm) to 1.0 (intense).
    pub energy: Option<f32>,
}

impl SongAnalysis {
    /// Read the known fields out of a payload object. Missing or oddly
    /// typed fields fall back to empty values.
    pub fn from_payload(payload: &JsonValue) -> Result<Self> {
        let object = payload.as_object().ok_or_else(|| {
            Error::MalformedResponse("analysis payload is not a JSON object".to_string())
        })?;

        Ok(Self {
            description: object
                .get("description")
                .and_then(JsonValue::as_str)
                .map(|s| s.trim().to_string())
                .unwrap_or_default(),
            genres: string_list(object, "genres"),
            moods: string_list(object, "moods"),
            themes: string_list(object, "themes"),
            energy: object
                .get("energy")
                .and_then(JsonValue::as_f64)
                .map(|e| e.clamp(0.0, 1.0) as f32),
        })
    }

    /// Searchable fields stored next to the payload.
    pub fn derived(&self) -> DerivedFields {
        DerivedFields {
            genres: self.genres.clone(),
            moods: self.moods.clone(),
            energy: self.energy,
        }
    }
}

/// Accepts `["a", "b"]` or `"a, b"`.
fn string_list(object: &Map<String, JsonValue>, key: &str) -> Vec<String> {
    let values: Vec<String> = match object.get(key) {
        Some(JsonValue::Array(items)) => items
            .iter()
            .filter_map(JsonValue::as_str)
            .map(str::to_string)
            .collect(),
        Some(JsonValue::String(joined)) => joined.split(',').map(str::to_string).collect(),
        _ => Vec::new(),
    };
    values
        .into_iter()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .collect()
}

/// A validated analysis: the payload to store verbatim plus its fields.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedAnalysis {
    pub payload: JsonValue,
    pub analysis: SongAnalysis,
}

/// Cut model output down to the JSON object it most likely contains.
fn extract_object(raw: &str) -> &str {
    let trimmed = raw.trim();
    let body = CODE_FENCE
        .captures(trimmed)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .unwrap_or(trimmed);

    match (body.find('{'), body.rfind('}')) {
        (Some(start), Some(end)) if start < end => &body[start..=end],
        _ => body.trim(),
    }
}

/// Best-effort repair of model output into parseable JSON text.
pub fn repair_json(raw: &str) -> String {
    let normalized = extract_object(raw)
        .replace(['\u{201C}', '\u{201D}', '\u{201E}', '\u{201F}'], "\"")
        .replace(['\u{2018}', '\u{2019}', '\u{201A}', '\u{201B}'], "'");
    TRAILING_COMMA.replace_all(&normalized, "$1").into_owned()
}

/// Parse one item's raw model output.
///
/// Returns `MalformedResponse` when the output is not a JSON object even
/// after repair.
pub fn parse_analysis(raw: &str) -> Result<ParsedAnalysis> {
    let candidate = extract_object(raw);
    let payload = match serde_json::from_str::<JsonValue>(candidate) {
        Ok(value) => value,
        Err(_) => serde_json::from_str::<JsonValue>(&repair_json(raw))
            .map_err(|e| Error::MalformedResponse(format!("unparseable analysis: {e}")))?,
    };
    if !payload.is_object() {
        return Err(Error::MalformedResponse(
            "analysis is not a JSON object".to_string(),
        ));
    }
    let analysis = SongAnalysis::from_payload(&payload)?;
    Ok(ParsedAnalysis { payload, analysis })
}

/// Text handed to the embedding provider for one item.
pub fn embedding_text(title: &str, artist: &str, analysis: &SongAnalysis) -> String {
    let mut parts = vec![format!("{} by {}", title, artist)];
    if !analysis.description.is_empty() {
        parts.push(analysis.description.clone());
    }
    for (label, values) in [
        ("Genres", &analysis.genres),
        ("Moods", &analysis.moods),
        ("Themes", &analysis.themes),
    ] {
        if !values.is_empty() {
            parts.push(format!("{}: {}", label, values.join(", ")));
        }
    }
    parts.join("\n")
}
