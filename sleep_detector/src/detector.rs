use crate::detection::{normalize_reply, DetectionResult, ReplyKind};
use crate::telemetry::Metrics;
use crate::vision::{CompletionRequest, VisionModel};
use std::sync::Arc;
use std::time::Instant;
use tracing::instrument;

const DATA_URI_SCHEME: &str = "data:";
const DEFAULT_IMAGE_PREFIX: &str = "data:image/jpeg;base64,";

const SYSTEM_PROMPT: &str = r#"You are a sleep detection assistant. Look at the image and decide whether the person in it is sleeping or awake.

Signs that a person is asleep:
- Eyes closed
- Head tilted to one side or dropped forward
- Relaxed facial muscles
- Lying down, reclined or slumped posture
- Looks unconscious or drowsy

Reply with ONLY one valid JSON object, no markdown and no other text, in exactly this format:
{"status": "sleeping" or "awake", "confidence": "high" or "medium" or "low", "details": "short explanation of what you saw"}

Examples:
{"status": "sleeping", "confidence": "high", "details": "Eyes are closed and the head is tilted to the side, the person appears to be asleep"}
{"status": "awake", "confidence": "high", "details": "Eyes are open and the person is looking at the camera, clearly awake"}
"#;

const FINAL_INSTRUCTION: &str =
    "Decide whether the person in this image is sleeping or awake. Respond with ONLY the JSON object.";

/// Prefixes bare base64 with a JPEG data URI. Strings that are already data
/// URIs pass through untouched.
pub fn to_data_uri(image: &str) -> String {
    if image.starts_with(DATA_URI_SCHEME) {
        image.to_string()
    } else {
        format!("{}{}", DEFAULT_IMAGE_PREFIX, image)
    }
}

pub fn build_prompt() -> String {
    format!("{}\n\n{}", SYSTEM_PROMPT, FINAL_INSTRUCTION)
}

/// Asks the vision model whether the pictured person is asleep.
///
/// Holds no per-request state, so one instance serves every request.
pub struct Detector {
    model: Arc<dyn VisionModel>,
    metrics: Arc<Metrics>,
}

impl Detector {
    pub fn new(model: Arc<dyn VisionModel>, metrics: Arc<Metrics>) -> Self {
        Self { model, metrics }
    }

    pub fn model_id(&self) -> &str {
        self.model.model_id()
    }

    /// Never fails: model errors come back as a `status: error` result.
    #[instrument(skip(self, image))]
    pub async fn detect(&self, image: &str) -> DetectionResult {
        let start = Instant::now();
        let request = CompletionRequest {
            prompt: build_prompt(),
            image_url: to_data_uri(image),
        };

        let result = match self.model.complete(request).await {
            Ok(reply) => {
                let (result, kind) = normalize_reply(&reply);
                if kind == ReplyKind::Keyword {
                    tracing::warn!("Model reply was not a JSON object, fell back to keyword match");
                }
                result
            }
            Err(e) => {
                tracing::error!("Vision model call failed: {}", e);
                DetectionResult::error(format!("Error during analysis: {}", e))
            }
        };

        let elapsed_ms = start.elapsed().as_millis() as u64;
        self.metrics.record_detection(result.status.as_str(), elapsed_ms);
        tracing::info!(status = result.status.as_str(), elapsed_ms, "Detection finished");

        result
    }
}
