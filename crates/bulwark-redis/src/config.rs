use bulwark_core::AppError;

pub const DEFAULT_KEY_PREFIX: &str = "bulwark:ratelimit";

/// Connection settings for the shared rate-limit store.
#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub url: String,
    pub key_prefix: String,
}

impl RedisConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
        }
    }

    /// Read configuration from environment variables.
    ///
    /// - `REDIS_URL` (required)
    /// - `BULWARK_KEY_PREFIX` (optional, defaults to `bulwark:ratelimit`)
    pub fn from_env() -> Result<Self, AppError> {
        let url = std::env::var("REDIS_URL").map_err(|_| {
            AppError::Config("REDIS_URL not set. Required for shared rate limiting.".into())
        })?;

        let key_prefix = match std::env::var("BULWARK_KEY_PREFIX") {
            Err(_) => DEFAULT_KEY_PREFIX.to_string(),
            Ok(raw) => {
                let trimmed = raw.trim().trim_end_matches(':');
                if trimmed.is_empty() {
                    return Err(AppError::Config(
                        "BULWARK_KEY_PREFIX must not be empty".into(),
                    ));
                }
                trimmed.to_string()
            }
        };

        Ok(Self { url, key_prefix })
    }
}
