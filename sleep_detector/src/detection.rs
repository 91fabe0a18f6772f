use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const DEFAULT_CONFIDENCE: &str = "low";
pub const DEFAULT_DETAILS: &str = "Analysis completed";
pub const ERROR_CONFIDENCE: &str = "none";

const FENCE: &str = "```";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Sleeping,
    Awake,
    Error,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Sleeping => "sleeping",
            Status::Awake => "awake",
            Status::Error => "error",
        }
    }

    /// Lowercases and trims a status reported by the model. Anything other
    /// than `sleeping` or `awake` becomes `awake`; the model can never
    /// report `error`.
    pub fn from_model(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "sleeping" => Status::Sleeping,
            _ => Status::Awake,
        }
    }
}

/// Outcome of one detection. Every field is always populated.
///
/// `confidence` is passed through as the model wrote it, only `status` is
/// normalized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectionResult {
    pub status: Status,
    pub confidence: String,
    pub details: String,
}

impl DetectionResult {
    pub fn error(details: impl Into<String>) -> Self {
        Self {
            status: Status::Error,
            confidence: ERROR_CONFIDENCE.into(),
            details: details.into(),
        }
    }

    fn sleeping_by_keyword() -> Self {
        Self {
            status: Status::Sleeping,
            confidence: "medium".into(),
            details: "Person appears to be sleeping based on image analysis".into(),
        }
    }

    fn unclear() -> Self {
        Self {
            status: Status::Awake,
            confidence: "low".into(),
            details: "Could not parse model response clearly".into(),
        }
    }

    /// Builds a result from a JSON object, backfilling missing or non-string
    /// fields. Unknown keys are dropped.
    fn from_object(object: &Map<String, Value>) -> Self {
        let field = |name: &str| object.get(name).and_then(Value::as_str);

        Self {
            status: field("status").map_or(Status::Awake, Status::from_model),
            confidence: field("confidence").unwrap_or(DEFAULT_CONFIDENCE).to_string(),
            details: field("details").unwrap_or(DEFAULT_DETAILS).to_string(),
        }
    }
}

/// How a model reply was turned into a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyKind {
    Json,
    Keyword,
}

/// Removes a wrapping code fence. Only applies when the reply opens with a
/// fence; every line that starts with one is dropped.
pub fn strip_code_fence(reply: &str) -> String {
    let reply = reply.trim();
    if !reply.starts_with(FENCE) {
        return reply.to_string();
    }

    reply
        .lines()
        .filter(|line| !line.trim_start().starts_with(FENCE))
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

/// Coerces the model's freeform reply into a [`DetectionResult`].
pub fn normalize_reply(reply: &str) -> (DetectionResult, ReplyKind) {
    let text = strip_code_fence(reply);

    match serde_json::from_str::<Value>(&text) {
        Ok(Value::Object(object)) => (DetectionResult::from_object(&object), ReplyKind::Json),
        _ if text.to_lowercase().contains("sleep") => {
            (DetectionResult::sleeping_by_keyword(), ReplyKind::Keyword)
        }
        _ => (DetectionResult::unclear(), ReplyKind::Keyword),
    }
}
