use crate::error::BotError;
use crate::Result;

/// Secrets read from the environment (`.env` is loaded by the binary)
#[derive(Clone)]
pub struct Credentials {
    pub api_key: String,
    pub api_secret: String,
    /// Dashboard Postgres. Without it the bot runs with an offline control channel.
    pub database_url: Option<String>,
    /// Enables the sentiment advisor for large pumps
    pub grok_api_key: Option<String>,
}

impl Credentials {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            api_key: required("BINANCE_API_KEY")?,
            api_secret: required("BINANCE_API_SECRET")?,
            database_url: optional("DATABASE_URL"),
            grok_api_key: optional("GROK_API_KEY"),
        })
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &mask(&self.api_key))
            .field("api_secret", &"***")
            .field("database_url", &self.database_url.as_ref().map(|_| "***"))
            .field("grok_api_key", &self.grok_api_key.as_ref().map(|_| "***"))
            .finish()
    }
}

fn required(name: &str) -> Result<String> {
    optional(name).ok_or_else(|| BotError::InvalidSettings(format!("{} not set", name)))
}

fn optional(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn mask(key: &str) -> String {
    let visible: String = key.chars().take(4).collect();
    format!("{}***", visible)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_output_hides_secrets() {
        let creds = Credentials {
            api_key: "abcdefgh".to_string(),
            api_secret: "topsecret".to_string(),
            database_url: Some("postgres://user:pw@host/db".to_string()),
            grok_api_key: None,
        };
        let printed = format!("{:?}", creds);
        assert!(printed.contains("abcd***"));
        assert!(!printed.contains("topsecret"));
        assert!(!printed.contains("pw@host"));
    }
}
