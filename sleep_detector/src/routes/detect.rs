use crate::{detection::DetectionResult, server::SharedState};
use axum::{
    extract::{rejection::BytesRejection, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use bytes::Bytes;
use serde_json::Value;
use thiserror::Error;
use tracing::instrument;

/// Payloads shorter than this, once any data-URI prefix is removed, can't
/// be a usable image.
pub const MIN_IMAGE_CHARS: usize = 100;

#[derive(Error, Debug)]
pub enum DetectRequestError {
    #[error("No image data provided. Send JSON with 'image' key containing base64 data.")]
    MissingImage,
    #[error("Image data appears too small or invalid.")]
    ImageTooSmall,
    #[error("Image data is too large.")]
    ImageTooLarge,
}

impl From<BytesRejection> for DetectRequestError {
    fn from(rejection: BytesRejection) -> Self {
        if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
            DetectRequestError::ImageTooLarge
        } else {
            DetectRequestError::MissingImage
        }
    }
}

impl DetectRequestError {
    fn reason(&self) -> &'static str {
        match self {
            DetectRequestError::MissingImage => "missing_image",
            DetectRequestError::ImageTooSmall => "image_too_small",
            DetectRequestError::ImageTooLarge => "image_too_large",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            DetectRequestError::ImageTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for DetectRequestError {
    fn into_response(self) -> Response {
        let body = DetectionResult::error(self.to_string());
        (self.status(), Json(body)).into_response()
    }
}

/// Pulls the `image` string out of a JSON body.
fn extract_image(body: &[u8]) -> Result<String, DetectRequestError> {
    let mut value: Value =
        serde_json::from_slice(body).map_err(|_| DetectRequestError::MissingImage)?;

    match value.get_mut("image").map(Value::take) {
        Some(Value::String(image)) => Ok(image),
        _ => Err(DetectRequestError::MissingImage),
    }
}

/// Everything after the last comma when a data-URI prefix is present.
fn raw_payload(image: &str) -> &str {
    image.rsplit(',').next().unwrap_or(image)
}

fn validate(image: &str) -> Result<(), DetectRequestError> {
    if raw_payload(image).chars().count() < MIN_IMAGE_CHARS {
        return Err(DetectRequestError::ImageTooSmall);
    }
    Ok(())
}

/// Model failures still answer 200 with a `status: error` body. Request
/// errors, including an oversized body, answer with an `error` result too.
#[instrument(skip(state, body))]
pub async fn detect(
    State(state): State<SharedState>,
    body: Result<Bytes, BytesRejection>,
) -> Result<Json<DetectionResult>, DetectRequestError> {
    let image = body
        .map_err(DetectRequestError::from)
        .and_then(|body| extract_image(&body))
        .and_then(|image| validate(&image).map(|_| image))
        .inspect_err(|e| {
            tracing::warn!("Rejected detect request: {}", e);
            state.metrics.record_rejection(e.reason());
        })?;

    let result = state.detector.detect(&image).await;

    Ok(Json(result))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_image() {
        assert_eq!(extract_image(br#"{"image": "abc"}"#).unwrap(), "abc");
    }

    #[test]
    fn test_extract_image_rejects_bad_bodies() {
        let bodies: [&[u8]; 7] = [
            b"",
            b"not json",
            b"{}",
            b"[]",
            br#"{"img": "abc"}"#,
            br#"{"image": 12345}"#,
            br#"{"image": null}"#,
        ];
        for body in bodies {
            assert!(
                matches!(extract_image(body), Err(DetectRequestError::MissingImage)),
                "body {:?}",
                String::from_utf8_lossy(body)
            );
        }
    }

    #[test]
    fn test_raw_payload_strips_data_uri_prefix() {
        assert_eq!(raw_payload("data:image/png;base64,QUJD"), "QUJD");
        assert_eq!(raw_payload("QUJD"), "QUJD");
    }

    #[test]
    fn test_validate_length_threshold() {
        let exactly = "A".repeat(MIN_IMAGE_CHARS);
        let short = "A".repeat(MIN_IMAGE_CHARS - 1);

        assert!(validate(&exactly).is_ok());
        assert!(validate(&format!("data:image/jpeg;base64,{}", exactly)).is_ok());
        assert!(matches!(validate(&short), Err(DetectRequestError::ImageTooSmall)));
        // the prefix doesn't count towards the length
        assert!(validate(&format!("data:image/jpeg;base64,{}", short)).is_err());
    }

    #[test]
    fn test_oversized_body_keeps_result_shape() {
        let response = DetectRequestError::ImageTooLarge.into_response();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);

        let response = DetectRequestError::ImageTooSmall.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
