use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// One call to the text-generation collaborator.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    /// Ask the provider for a JSON object response.
    pub json_output: bool,
}

impl GenerationRequest {
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            messages,
            max_tokens: None,
            temperature: None,
            json_output: false,
        }
    }

    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn json(mut self) -> Self {
        self.json_output = true;
        self
    }
}

/// The text-generation collaborator: returns generated text or fails.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, request: GenerationRequest) -> Result<String>;
}

#[derive(Clone)]
pub struct LlmClient {
    api_url: String,
    api_key: String,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Message,
}

impl LlmClient {
    pub fn new(api_url: String, api_key: String) -> Self {
        Self {
            api_url: api_url.trim_end_matches('/').to_string(),
            api_key,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl TextGenerator for LlmClient {
    /// Generate a completion using the OpenAI API format
    async fn generate(&self, request: GenerationRequest) -> Result<String> {
        let url = format!("{}/chat/completions", self.api_url);

        let body = ChatCompletionRequest {
            model: request.model,
            messages: request.messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            response_format: request
                .json_output
                .then_some(ResponseFormat { kind: "json_object" }),
        };

        let mut req = self.client.post(&url).json(&body);

        // Add API key header if provided (not needed for local models)
        if !self.api_key.is_empty() {
            req = req.header("Authorization", format!("Bearer {}", self.api_key));
        }

        let response = req.send().await.context("Failed to send LLM request")?;

        // Check for HTTP errors and include response body for debugging
        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read body".to_string());
            anyhow::bail!("LLM API returned error {}: {}", status, body);
        }

        let completion: ChatCompletionResponse = response
            .json()
            .await
            .context("Failed to parse LLM response")?;

        let content = completion
            .choices
            .first()
            .map(|c| c.message.content.trim().to_string())
            .ok_or_else(|| anyhow::anyhow!("No response from LLM"))?;

        Ok(content)
    }
}

/// Condense `text` with the summary model. Empty input yields an empty
/// summary without a model call.
pub async fn summarize(
    generator: &dyn TextGenerator,
    model: &str,
    text: &str,
    max_words: u32,
    focus: &str,
) -> Result<String> {
    if text.trim().is_empty() {
        return Ok(String::new());
    }

    let prompt = format!(
        "Fasse den folgenden Text prägnant zusammen und konzentriere dich auf die {}.\n\
         Beschränke die Zusammenfassung auf maximal {} Wörter.\n\n\
         Text:\n{}",
        focus, max_words, text
    );
    let request = GenerationRequest::new(
        model,
        vec![
            Message::system("Du bist ein hilfreicher Assistent, der lange Texte zusammenfassen kann."),
            Message::user(prompt),
        ],
    )
    .max_tokens(max_words * 2)
    .temperature(0.3);

    let summary = generator
        .generate(request)
        .await
        .context("Summary generation failed")?;
    Ok(summary.trim().to_string())
}

/// Parse a JSON payload out of a model response, tolerating code fences,
/// `<think>` preambles and surrounding prose.
pub fn parse_json<T>(response: &str) -> Result<T>
where
    T: for<'de> Deserialize<'de>,
{
    if let Ok(parsed) = serde_json::from_str::<T>(response) {
        return Ok(parsed);
    }

    let cleaned = if let Some(think_end) = response.rfind("</think>") {
        &response[think_end + 8..]
    } else {
        response
    };

    if let Ok(parsed) = serde_json::from_str::<T>(cleaned.trim()) {
        return Ok(parsed);
    }

    let json_content = if let Some(start) = cleaned.find("```json") {
        let after_start = &cleaned[start + 7..];
        if let Some(end) = after_start.find("```") {
            after_start[..end].trim()
        } else {
            cleaned
        }
    } else if let Some(start) = cleaned.find('{') {
        match cleaned.rfind('}') {
            Some(end) if end > start => &cleaned[start..=end],
            _ => cleaned,
        }
    } else {
        cleaned
    };

    serde_json::from_str::<T>(json_content.trim()).context(format!(
        "Failed to parse JSON. Extracted: {} | Original: {}",
        json_content,
        response.chars().take(500).collect::<String>()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn parse_json_accepts_plain_object() {
        let parsed: HashMap<String, String> =
            parse_json(r#"{"Hobbys": "Laufen, Kochen"}"#).expect("parse");
        assert_eq!(parsed["Hobbys"], "Laufen, Kochen");
    }

    #[test]
    fn parse_json_strips_code_fence_and_think_block() {
        let raw = "<think>hmm</think>\nHier ist das Profil:\n```json\n{\"Beruf\": \"Lehrer\"}\n```";
        let parsed: HashMap<String, String> = parse_json(raw).expect("parse");
        assert_eq!(parsed["Beruf"], "Lehrer");
    }

    #[test]
    fn parse_json_reports_raw_text_on_failure() {
        let err = parse_json::<HashMap<String, String>>("kein json").unwrap_err();
        assert!(format!("{err:#}").contains("kein json"));
    }

    #[test]
    fn parse_json_rejects_reversed_braces_without_panicking() {
        let err = parse_json::<HashMap<String, String>>("Keine neuen Fakten } gefunden {").unwrap_err();
        assert!(format!("{err:#}").contains("Keine neuen Fakten"));
    }

    #[test]
    fn request_builder_sets_generation_parameters() {
        let request = GenerationRequest::new("gpt-4o", vec![Message::user("hi")])
            .max_tokens(60)
            .temperature(0.7)
            .json();
        assert_eq!(request.max_tokens, Some(60));
        assert_eq!(request.temperature, Some(0.7));
        assert!(request.json_output);
        assert_eq!(request.messages[0].role, "user");
    }
}
