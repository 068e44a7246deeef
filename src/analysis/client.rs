use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

use crate::config::AnalysisSettings;

const MAX_TOKENS: u32 = 500;

/// External vision-language capability. Given evidence JPEG bytes, produce free text.
pub trait VisionAnalyzer: Send {
    fn name(&self) -> &str;

    fn analyze(&mut self, jpeg: &[u8]) -> Result<String>;
}

impl<A: VisionAnalyzer + ?Sized> VisionAnalyzer for Box<A> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn analyze(&mut self, jpeg: &[u8]) -> Result<String> {
        (**self).analyze(jpeg)
    }
}

/// OpenAI-compatible chat completion client that sends the evidence inline as a data URL.
pub struct HttpVisionAnalyzer {
    agent: ureq::Agent,
    endpoint: String,
    model: String,
    api_key: Option<String>,
    prompt: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

impl HttpVisionAnalyzer {
    pub fn new(settings: &AnalysisSettings) -> Result<Self> {
        let endpoint = settings
            .endpoint
            .clone()
            .ok_or_else(|| anyhow!("analysis.endpoint is not configured"))?;
        url::Url::parse(&endpoint)
            .with_context(|| format!("analysis.endpoint is not a URL: {}", endpoint))?;
        Ok(Self {
            agent: ureq::AgentBuilder::new()
                .timeout(settings.timeout().max(Duration::from_secs(1)))
                .build(),
            endpoint,
            model: settings.model.clone(),
            api_key: settings.api_key.clone(),
            prompt: settings.prompt.clone(),
        })
    }

    fn request_body(&self, jpeg: &[u8]) -> serde_json::Value {
        json!({
            "model": self.model,
            "max_tokens": MAX_TOKENS,
            "messages": [{
                "role": "user",
                "content": [
                    { "type": "text", "text": self.prompt },
                    {
                        "type": "image_url",
                        "image_url": { "url": format!("data:image/jpeg;base64,{}", BASE64.encode(jpeg)) }
                    }
                ]
            }]
        })
    }
}

impl VisionAnalyzer for HttpVisionAnalyzer {
    fn name(&self) -> &str {
        "http"
    }

    fn analyze(&mut self, jpeg: &[u8]) -> Result<String> {
        let mut request = self.agent.post(&self.endpoint);
        if let Some(key) = &self.api_key {
            request = request.set("Authorization", &format!("Bearer {}", key));
        }
        let response = request
            .send_json(self.request_body(jpeg))
            .with_context(|| format!("analysis request to {}", self.endpoint))?;
        let parsed: ChatResponse = response
            .into_json()
            .context("analysis response was not a chat completion")?;
        completion_text(parsed)
    }
}

fn completion_text(response: ChatResponse) -> Result<String> {
    let text = response
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .map(|t| t.trim().to_string())
        .unwrap_or_default();
    if text.is_empty() {
        return Err(anyhow!("analysis response contained no text"));
    }
    Ok(text)
}

/// First non-empty line of an analysis, for one-line previews.
pub fn summary_line(analysis: &str) -> &str {
    analysis
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> AnalysisSettings {
        AnalysisSettings {
            endpoint: Some("http://127.0.0.1:9/v1/chat/completions".to_string()),
            ..AnalysisSettings::default()
        }
    }

    #[test]
    fn request_carries_prompt_and_inline_jpeg() -> Result<()> {
        let analyzer = HttpVisionAnalyzer::new(&settings())?;
        let body = analyzer.request_body(&[0xff, 0xd8, 0xff]);
        let content = &body["messages"][0]["content"];
        assert_eq!(content[0]["text"], settings().prompt);
        assert_eq!(content[1]["image_url"]["url"], "data:image/jpeg;base64,/9j/");
        Ok(())
    }

    #[test]
    fn missing_endpoint_is_rejected() {
        assert!(HttpVisionAnalyzer::new(&AnalysisSettings::default()).is_err());
    }

    #[test]
    fn completion_text_requires_content() -> Result<()> {
        let ok: ChatResponse = serde_json::from_str(
            r#"{"choices":[{"message":{"role":"assistant","content":"  Overloaded truck\nDetails  "}}]}"#,
        )?;
        assert_eq!(completion_text(ok)?, "Overloaded truck\nDetails");

        let empty: ChatResponse = serde_json::from_str(r#"{"choices":[]}"#)?;
        assert!(completion_text(empty).is_err());
        Ok(())
    }

    #[test]
    fn summary_is_first_non_empty_line() {
        assert_eq!(summary_line("\n  Gravel truck, tarp missing\nmore"), "Gravel truck, tarp missing");
        assert_eq!(summary_line(""), "");
    }
}
