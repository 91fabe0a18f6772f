//! Client for the hosted vision-language model, spoken over an
//! OpenAI-compatible chat completions API.

use crate::config::VisionConfig;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument};

#[derive(Error, Debug)]
pub enum VisionError {
    #[error("GROQ_API_KEY is not set")]
    MissingApiKey,
    #[error("request to vision model failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("vision model returned {status}: {message}")]
    Api { status: StatusCode, message: String },
    #[error("vision model returned an empty completion")]
    EmptyCompletion,
}

/// A single-turn prompt: instructions plus one image.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub prompt: String,
    pub image_url: String,
}

#[async_trait]
pub trait VisionModel: Send + Sync + 'static {
    fn model_id(&self) -> &str;

    /// Returns the raw text of the model's first choice.
    async fn complete(&self, request: CompletionRequest) -> Result<String, VisionError>;
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_completion_tokens: u32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: Vec<ContentPart<'a>>,
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart<'a> {
    Text { text: &'a str },
    ImageUrl { image_url: ImageUrl<'a> },
}

#[derive(Serialize)]
struct ImageUrl<'a> {
    url: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ApiErrorBody {
    error: ApiErrorDetail,
}

#[derive(Deserialize)]
struct ApiErrorDetail {
    message: String,
}

pub struct GroqClient {
    client: Client,
    completions_url: String,
    model: String,
    api_key: Option<String>,
    temperature: f32,
    max_completion_tokens: u32,
}

impl GroqClient {
    pub fn new(config: &VisionConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            completions_url: config.get_completions_url(),
            model: config.model.clone(),
            api_key: config.api_key.clone(),
            temperature: config.temperature,
            max_completion_tokens: config.max_completion_tokens,
        })
    }

    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    fn chat_request<'a>(&'a self, request: &'a CompletionRequest) -> ChatRequest<'a> {
        ChatRequest {
            model: &self.model,
            messages: vec![ChatMessage {
                role: "user",
                content: vec![
                    ContentPart::Text {
                        text: &request.prompt,
                    },
                    ContentPart::ImageUrl {
                        image_url: ImageUrl {
                            url: &request.image_url,
                        },
                    },
                ],
            }],
            temperature: self.temperature,
            max_completion_tokens: self.max_completion_tokens,
        }
    }
}

#[async_trait]
impl VisionModel for GroqClient {
    fn model_id(&self) -> &str {
        &self.model
    }

    #[instrument(skip(self, request), fields(model = %self.model))]
    async fn complete(&self, request: CompletionRequest) -> Result<String, VisionError> {
        let api_key = self.api_key.as_deref().ok_or(VisionError::MissingApiKey)?;

        let response = self
            .client
            .post(&self.completions_url)
            .bearer_auth(api_key)
            .json(&self.chat_request(&request))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ApiErrorBody>(&body)
                .map(|b| b.error.message)
                .unwrap_or(body);
            return Err(VisionError::Api { status, message });
        }

        let chat_response: ChatResponse = response.json().await?;
        debug!("received {} choice(s)", chat_response.choices.len());

        chat_response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .map(|content| content.trim().to_string())
            .ok_or(VisionError::EmptyCompletion)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        http::{header, HeaderMap},
        routing::post,
        Router,
    };

    fn config_for(base_url: &str, api_key: Option<&str>) -> VisionConfig {
        serde_json::from_value(serde_json::json!({
            "base_url": base_url,
            "model": "test-vision-model",
            "api_key": api_key,
        }))
        .unwrap()
    }

    fn test_config(api_key: Option<&str>) -> VisionConfig {
        config_for("http://127.0.0.1:59999/openai/v1/", api_key)
    }

    /// Serves `status` and `body` for every completion request on a local
    /// port. Requests without the expected bearer token get a 401.
    async fn completions_server(status: StatusCode, body: &'static str) -> GroqClient {
        let router = Router::new().route(
            "/openai/v1/chat/completions",
            post(move |headers: HeaderMap| async move {
                let authorized = headers
                    .get(header::AUTHORIZATION)
                    .is_some_and(|value| value == "Bearer test-key");
                if !authorized {
                    return (StatusCode::UNAUTHORIZED, "missing bearer token");
                }
                (status, body)
            }),
        );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        GroqClient::new(&config_for(&format!("http://{}/openai/v1", addr), Some("test-key"))).unwrap()
    }

    fn sample_request() -> CompletionRequest {
        CompletionRequest {
            prompt: "Is this person asleep?".into(),
            image_url: "data:image/jpeg;base64,AAAA".into(),
        }
    }

    #[test]
    fn test_chat_request_shape() {
        let client = GroqClient::new(&test_config(Some("key"))).unwrap();
        let request = sample_request();

        let body = serde_json::to_value(client.chat_request(&request)).unwrap();

        assert_eq!(
            body,
            serde_json::json!({
                "model": "test-vision-model",
                "messages": [{
                    "role": "user",
                    "content": [
                        {"type": "text", "text": "Is this person asleep?"},
                        {"type": "image_url", "image_url": {"url": "data:image/jpeg;base64,AAAA"}}
                    ]
                }],
                "temperature": 0.1f32,
                "max_completion_tokens": 256
            })
        );
    }

    #[test]
    fn test_client_uses_configured_endpoint() {
        let client = GroqClient::new(&test_config(None)).unwrap();

        assert_eq!(
            client.completions_url,
            "http://127.0.0.1:59999/openai/v1/chat/completions"
        );
        assert_eq!(client.model_id(), "test-vision-model");
        assert!(!client.has_api_key());
    }

    #[tokio::test]
    async fn test_missing_api_key_fails_before_sending() {
        let client = GroqClient::new(&test_config(None)).unwrap();

        let err = client.complete(sample_request()).await.unwrap_err();

        assert!(matches!(err, VisionError::MissingApiKey));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_transport_error() {
        let client = GroqClient::new(&test_config(Some("key"))).unwrap();

        let err = client.complete(sample_request()).await.unwrap_err();

        assert!(matches!(err, VisionError::Transport(_)));
    }

    #[tokio::test]
    async fn test_completion_text_is_trimmed() {
        let client = completions_server(
            StatusCode::OK,
            r#"{"choices":[{"message":{"role":"assistant","content":"  {\"status\":\"awake\"}\n "}}]}"#,
        )
        .await;

        let reply = client.complete(sample_request()).await.unwrap();

        assert_eq!(reply, r#"{"status":"awake"}"#);
    }

    #[tokio::test]
    async fn test_api_error_message_is_extracted() {
        let client = completions_server(
            StatusCode::BAD_REQUEST,
            r#"{"error":{"message":"image too large","type":"invalid_request_error"}}"#,
        )
        .await;

        let err = client.complete(sample_request()).await.unwrap_err();

        match err {
            VisionError::Api { status, message } => {
                assert_eq!(status, StatusCode::BAD_REQUEST);
                assert_eq!(message, "image too large");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_api_error_falls_back_to_raw_body() {
        let client = completions_server(StatusCode::SERVICE_UNAVAILABLE, "upstream overloaded").await;

        let err = client.complete(sample_request()).await.unwrap_err();

        assert_eq!(
            err.to_string(),
            "vision model returned 503 Service Unavailable: upstream overloaded"
        );
    }

    #[tokio::test]
    async fn test_empty_choices_is_empty_completion() {
        let client = completions_server(StatusCode::OK, r#"{"choices":[]}"#).await;

        let err = client.complete(sample_request()).await.unwrap_err();

        assert!(matches!(err, VisionError::EmptyCompletion));
    }

    #[tokio::test]
    async fn test_null_content_is_empty_completion() {
        let client = completions_server(
            StatusCode::OK,
            r#"{"choices":[{"message":{"role":"assistant","content":null}}]}"#,
        )
        .await;

        let err = client.complete(sample_request()).await.unwrap_err();

        assert!(matches!(err, VisionError::EmptyCompletion));
    }

    #[tokio::test]
    async fn test_undecodable_success_body_is_transport_error() {
        let client = completions_server(StatusCode::OK, "not json").await;

        let err = client.complete(sample_request()).await.unwrap_err();

        assert!(matches!(err, VisionError::Transport(_)));
    }
}
