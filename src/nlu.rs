//! Remote intent detection. The provider is opaque: we send the utterance
//! with a per-session dialogue handle and get back a label, a confidence
//! and the provider's own reply.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::config::NluConfig;
use crate::error::NluError;
use crate::types::NluParameters;

#[derive(Debug, Clone, PartialEq)]
pub struct NluResult {
    pub intent: String,
    pub confidence: f64,
    pub fulfillment_text: String,
    pub parameters: NluParameters,
}

#[async_trait]
pub trait NluProvider: Send + Sync {
    async fn detect_intent(&self, session_id: &str, text: &str) -> Result<NluResult, NluError>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DetectIntentResponse {
    #[serde(default)]
    intent: Option<String>,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    fulfillment_text: Option<String>,
    #[serde(default)]
    parameters: Option<Value>,
}

pub struct HttpNluProvider {
    client: reqwest::Client,
    config: NluConfig,
}

impl HttpNluProvider {
    pub fn new(client: reqwest::Client, config: NluConfig) -> Self {
        Self { client, config }
    }

    /// `{base_url}/sessions/{session_id}:detectIntent`, with the session id
    /// percent-encoded as a single path segment.
    fn endpoint(&self, session_id: &str) -> Result<reqwest::Url, NluError> {
        let session_id = session_id.trim();
        if session_id.is_empty() {
            return Err(NluError::InvalidEndpoint("empty session id".to_string()));
        }
        let mut url = reqwest::Url::parse(&self.config.base_url)
            .map_err(|err| NluError::InvalidEndpoint(err.to_string()))?;
        url.path_segments_mut()
            .map_err(|_| NluError::InvalidEndpoint(self.config.base_url.clone()))?
            .pop_if_empty()
            .push("sessions")
            .push(&format!("{session_id}:detectIntent"));
        Ok(url)
    }
}

fn flatten_parameters(value: Option<Value>) -> NluParameters {
    let Some(Value::Object(map)) = value else {
        return NluParameters::new();
    };
    map.into_iter()
        .filter_map(|(key, value)| {
            let text = match value {
                Value::String(s) => s,
                Value::Number(n) => n.to_string(),
                Value::Bool(b) => b.to_string(),
                _ => return None,
            };
            let text = text.trim().to_string();
            (!text.is_empty()).then_some((key, text))
        })
        .collect()
}

#[async_trait]
impl NluProvider for HttpNluProvider {
    async fn detect_intent(&self, session_id: &str, text: &str) -> Result<NluResult, NluError> {
        let mut request = self
            .client
            .post(self.endpoint(session_id)?)
            .timeout(self.config.timeout)
            .json(&json!({
                "text": text,
                "languageCode": self.config.language,
            }));
        if !self.config.api_key.is_empty() {
            request = request.bearer_auth(&self.config.api_key);
        }
        let response = request.send().await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(NluError::Status { status, body });
        }
        let payload = response.json::<DetectIntentResponse>().await?;

        let intent = payload
            .intent
            .map(|label| label.trim().to_string())
            .filter(|label| !label.is_empty())
            .ok_or_else(|| NluError::InvalidResponse("missing intent".to_string()))?;
        let confidence = payload
            .confidence
            .filter(|c| c.is_finite())
            .map(|c| c.clamp(0.0, 1.0))
            .ok_or_else(|| NluError::InvalidResponse("missing confidence".to_string()))?;

        Ok(NluResult {
            intent,
            confidence,
            fulfillment_text: payload.fulfillment_text.unwrap_or_default().trim().to_string(),
            parameters: flatten_parameters(payload.parameters),
        })
    }
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{header, method, path, path_regex};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use std::time::Duration;

    use super::*;

    fn provider(base_url: &str) -> HttpNluProvider {
        HttpNluProvider::new(
            reqwest::Client::new(),
            NluConfig {
                base_url: base_url.to_string(),
                api_key: "test-key".to_string(),
                language: "es".to_string(),
                timeout: Duration::from_millis(300),
            },
        )
    }

    #[tokio::test]
    async fn parses_successful_detection() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/sessions/s-1:detectIntent"))
            .and(header("authorization", "Bearer test-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "intent": "exam.price",
                "confidence": 0.92,
                "fulfillmentText": "Con gusto te ayudo con precios.",
                "parameters": { "exam": "Hemograma", "count": 2, "empty": "", "nested": {} }
            })))
            .mount(&server)
            .await;

        let result = provider(&server.uri())
            .detect_intent("s-1", "cuánto cuesta el hemograma")
            .await
            .unwrap();
        assert_eq!(result.intent, "exam.price");
        assert_eq!(result.confidence, 0.92);
        assert_eq!(result.parameters.get("exam").map(String::as_str), Some("Hemograma"));
        assert_eq!(result.parameters.get("count").map(String::as_str), Some("2"));
        assert!(!result.parameters.contains_key("empty"));
        assert!(!result.parameters.contains_key("nested"));
    }

    #[tokio::test]
    async fn non_success_status_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .mount(&server)
            .await;

        let err = provider(&server.uri())
            .detect_intent("s-1", "hola")
            .await
            .unwrap_err();
        assert!(matches!(err, NluError::Status { status: 503, .. }));
    }

    #[tokio::test]
    async fn slow_provider_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "intent": "greeting", "confidence": 0.9 }))
                    .set_delay(Duration::from_secs(30)),
            )
            .mount(&server)
            .await;

        let started = std::time::Instant::now();
        let err = provider(&server.uri())
            .detect_intent("s-1", "hola")
            .await
            .unwrap_err();
        assert!(matches!(&err, NluError::Http(e) if e.is_timeout()));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn session_id_stays_one_path_segment() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path_regex(r"^/sessions/[^/?#]+:detectIntent$"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "intent": "greeting", "confidence": 0.9 })),
            )
            .expect(1)
            .mount(&server)
            .await;

        let result = provider(&server.uri())
            .detect_intent("../admin?x=1#frag", "hola")
            .await
            .unwrap();
        assert_eq!(result.intent, "greeting");

        let endpoint = provider("http://nlu.local/v1").endpoint("a/b").unwrap();
        assert_eq!(endpoint.path(), "/v1/sessions/a%2Fb:detectIntent");
        assert!(provider("not a url").endpoint("s-1").is_err());
    }

    #[tokio::test]
    async fn missing_intent_is_invalid() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "confidence": 0.5 })))
            .mount(&server)
            .await;

        let err = provider(&server.uri())
            .detect_intent("s-1", "hola")
            .await
            .unwrap_err();
        assert!(matches!(err, NluError::InvalidResponse(_)));
    }
}
