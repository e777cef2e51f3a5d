//! Sentiment check for large pumps using xAI's chat-completions API
//!
//! Asks whether a pump looks like exhausted retail FOMO (good to short) or
//! news-driven momentum (stay away).
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use super::{SentimentAdvisor, SentimentVerdict};
use crate::error::BotError;
use crate::Result;

const GROK_API_URL: &str = "https://api.x.ai/v1/chat/completions";
const MODEL: &str = "grok-3-mini";
const MAX_TOKENS: u32 = 300;
const MAX_RETRIES: u32 = 2;
const CACHE_TTL: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<Message>,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: MessageContent,
}

#[derive(Debug, Deserialize)]
struct MessageContent {
    content: String,
}

#[derive(Debug, Deserialize)]
struct VerdictPayload {
    is_good: bool,
    #[serde(default)]
    fomo_level: Option<f64>,
    #[serde(default)]
    reason: String,
}

pub struct GrokAdvisor {
    api_key: String,
    api_url: String,
    client: reqwest::Client,
    cache: Mutex<HashMap<String, (Instant, SentimentVerdict)>>,
}

impl GrokAdvisor {
    pub fn new(api_key: String) -> Result<Self> {
        Self::with_url(api_key, GROK_API_URL)
    }

    pub fn with_url(api_key: String, api_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            api_key,
            api_url: api_url.to_string(),
            client,
            cache: Mutex::new(HashMap::new()),
        })
    }

    fn cached(&self, symbol: &str) -> Option<SentimentVerdict> {
        let cache = self.cache.lock().ok()?;
        cache
            .get(symbol)
            .filter(|(at, _)| at.elapsed() < CACHE_TTL)
            .map(|(_, verdict)| verdict.clone())
    }

    fn remember(&self, symbol: &str, verdict: &SentimentVerdict) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.retain(|_, (at, _)| at.elapsed() < CACHE_TTL);
            cache.insert(symbol.to_string(), (Instant::now(), verdict.clone()));
        }
    }

    fn prompt(symbol: &str, pump_percent: f64) -> String {
        format!(
            "{} perpetual futures are up {:.1}% in 24 hours. Judge from current social \
             sentiment and news whether this is retail FOMO likely to retrace (good to short) \
             or a fundamental move likely to continue. Respond with JSON only: \
             {{\"is_good\": bool, \"fomo_level\": 0-100, \"reason\": \"one sentence\"}}",
            symbol, pump_percent
        )
    }

    async fn ask(&self, prompt: String) -> Result<String> {
        let request = ChatRequest {
            model: MODEL.to_string(),
            max_tokens: MAX_TOKENS,
            temperature: 0.0,
            messages: vec![
                Message {
                    role: "system".to_string(),
                    content: "You are a crypto market sentiment analyst. Always respond with valid JSON only, no markdown formatting.".to_string(),
                },
                Message {
                    role: "user".to_string(),
                    content: prompt,
                },
            ],
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            let response = self
                .client
                .post(&self.api_url)
                .header("Authorization", format!("Bearer {}", &self.api_key))
                .json(&request)
                .send()
                .await?;

            let status = response.status();
            if status.as_u16() == 429 && attempt < MAX_RETRIES {
                tokio::time::sleep(Duration::from_millis(500 * attempt as u64)).await;
                continue;
            }
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(BotError::Advisor(format!("HTTP {}: {}", status, body)));
            }

            let chat: ChatResponse = response.json().await?;
            return chat
                .choices
                .into_iter()
                .next()
                .map(|c| c.message.content)
                .ok_or_else(|| BotError::Advisor("empty completion".to_string()));
        }
    }
}

/// Pull the verdict out of a completion, tolerating code fences and chatter
pub fn parse_verdict(content: &str) -> Result<SentimentVerdict> {
    let start = content.find('{');
    let end = content.rfind('}');
    let json = match (start, end) {
        (Some(start), Some(end)) if end > start => &content[start..=end],
        _ => return Err(BotError::Advisor(format!("no JSON in reply: {}", content))),
    };

    let payload: VerdictPayload = serde_json::from_str(json)
        .map_err(|e| BotError::Advisor(format!("unparseable verdict: {}", e)))?;

    Ok(SentimentVerdict {
        is_good: payload.is_good,
        fomo_level: payload.fomo_level,
        reason: payload.reason,
    })
}

#[async_trait]
impl SentimentAdvisor for GrokAdvisor {
    async fn is_good_short_entry(
        &self,
        symbol: &str,
        pump_percent: f64,
    ) -> Result<SentimentVerdict> {
        if let Some(verdict) = self.cached(symbol) {
            return Ok(verdict);
        }

        let content = self.ask(Self::prompt(symbol, pump_percent)).await?;
        let verdict = parse_verdict(&content)?;
        self.remember(symbol, &verdict);

        tracing::debug!(
            "🤖 Grok on {}: good={} fomo={:?} ({})",
            symbol,
            verdict.is_good,
            verdict.fomo_level,
            verdict.reason
        );
        Ok(verdict)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_fenced_verdict() {
        let content = "```json\n{\"is_good\": true, \"fomo_level\": 85, \"reason\": \"meme hype\"}\n```";
        let verdict = parse_verdict(content).unwrap();
        assert!(verdict.is_good);
        assert_eq!(verdict.fomo_level, Some(85.0));
        assert_eq!(verdict.reason, "meme hype");
    }

    #[test]
    fn test_parse_rejects_prose() {
        assert!(parse_verdict("I cannot help with that.").is_err());
    }

    #[tokio::test]
    async fn test_round_trip_against_mock_server() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/chat/completions")
            .match_header("authorization", "Bearer test-key")
            .with_status(200)
            .with_body(
                r#"{"choices":[{"message":{"role":"assistant","content":"{\"is_good\": false, \"fomo_level\": 20, \"reason\": \"exchange listing news\"}"}}]}"#,
            )
            .expect(1)
            .create_async()
            .await;

        let url = format!("{}/v1/chat/completions", server.url());
        let advisor = GrokAdvisor::with_url("test-key".to_string(), &url).unwrap();

        let verdict = advisor.is_good_short_entry("WIFUSDT", 45.0).await.unwrap();
        assert!(!verdict.is_good);

        // Second call is served from cache
        let again = advisor.is_good_short_entry("WIFUSDT", 47.0).await.unwrap();
        assert_eq!(again, verdict);
        mock.assert_async().await;
    }
}
