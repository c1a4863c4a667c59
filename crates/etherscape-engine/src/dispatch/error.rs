use crate::media::truncate_text;

/// Markers in a provider's own error text that mean "out of quota or credit"
/// or "rate limited".
const EXHAUSTION_MARKERS: &[&str] = &[
    "quota",
    "billing",
    "insufficient credit",
    "insufficient_credit",
    "out of credits",
    "not enough credits",
    "resource_exhausted",
    "rate limit",
    "rate_limit",
    "ratelimit",
    "too many requests",
];

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProviderErrorKind {
    /// Missing key or rejected credentials. The provider is skipped.
    Config,
    /// Rate limit, quota, outage or transport failure. The next provider is tried.
    Transient,
    /// Anything else the provider reported. The fallback walk stops.
    Fatal,
}

impl ProviderErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Config => "config",
            Self::Transient => "transient",
            Self::Fatal => "fatal",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub provider: String,
    pub message: String,
}

impl ProviderError {
    pub fn new(kind: ProviderErrorKind, provider: &str, message: impl Into<String>) -> Self {
        Self {
            kind,
            provider: provider.to_string(),
            message: message.into(),
        }
    }

    pub fn config(provider: &str, message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Config, provider, message)
    }

    pub fn transient(provider: &str, message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Transient, provider, message)
    }

    pub fn fatal(provider: &str, message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Fatal, provider, message)
    }

    pub fn missing_key(provider: &str) -> Self {
        Self::config(provider, format!("{provider} API key is required."))
    }

    /// Classifies a non-success HTTP response.
    pub fn from_status(provider: &str, code: u16, body: &str) -> Self {
        let message = format!(
            "{provider} request failed ({code}): {}",
            truncate_text(body.trim(), 512)
        );
        let kind = match code {
            401 | 403 => ProviderErrorKind::Config,
            402 | 429 | 503 | 529 => ProviderErrorKind::Transient,
            _ if reports_exhaustion(body) => ProviderErrorKind::Transient,
            _ => ProviderErrorKind::Fatal,
        };
        Self::new(kind, provider, message)
    }

    /// Classifies a failure the provider reported inside a successful
    /// response, such as a failed job status.
    pub fn reported(provider: &str, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        let kind = if reports_exhaustion(&reason) {
            ProviderErrorKind::Transient
        } else {
            ProviderErrorKind::Fatal
        };
        Self::new(kind, provider, reason)
    }

    pub fn from_transport(provider: &str, context: &str, err: reqwest::Error) -> Self {
        let message = format!("{context}: {err}");
        if err.is_timeout() || err.is_connect() || err.is_request() {
            Self::transient(provider, message)
        } else {
            Self::fatal(provider, message)
        }
    }

    /// Whether the orchestrator may move on to the next provider.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.kind,
            ProviderErrorKind::Config | ProviderErrorKind::Transient
        )
    }
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ProviderError {}

fn reports_exhaustion(text: &str) -> bool {
    let lower = text.to_ascii_lowercase();
    EXHAUSTION_MARKERS.iter().any(|marker| lower.contains(marker))
}

#[cfg(test)]
mod tests {
    use super::{ProviderError, ProviderErrorKind};

    #[test]
    fn status_codes_map_to_kinds() {
        let cases = [
            (401, ProviderErrorKind::Config),
            (403, ProviderErrorKind::Config),
            (402, ProviderErrorKind::Transient),
            (429, ProviderErrorKind::Transient),
            (503, ProviderErrorKind::Transient),
            (529, ProviderErrorKind::Transient),
            (400, ProviderErrorKind::Fatal),
            (500, ProviderErrorKind::Fatal),
        ];
        for (code, kind) in cases {
            assert_eq!(ProviderError::from_status("stability", code, "{}").kind, kind, "{code}");
        }
    }

    #[test]
    fn exhaustion_bodies_are_transient() {
        let err = ProviderError::from_status(
            "gemini",
            400,
            r#"{"error":{"status":"RESOURCE_EXHAUSTED","message":"Quota exceeded"}}"#,
        );
        assert_eq!(err.kind, ProviderErrorKind::Transient);
        assert!(err.message.starts_with("gemini request failed (400)"));
    }

    #[test]
    fn limit_wording_alone_is_not_transient() {
        let err = ProviderError::reported("bfl", "prompt exceeds the character limit");
        assert_eq!(err.kind, ProviderErrorKind::Fatal);
        assert!(!err.is_recoverable());
        let billing = ProviderError::reported("leonardo", "Billing: not enough credits");
        assert!(billing.is_recoverable());
    }

    #[test]
    fn rate_limit_wording_is_transient() {
        let reported = ProviderError::reported("replicate", "Rate limit exceeded, please retry later");
        assert_eq!(reported.kind, ProviderErrorKind::Transient);
        let body = ProviderError::from_status("stability", 400, "Too many requests: rate limit reached");
        assert_eq!(body.kind, ProviderErrorKind::Transient);
        let coded = ProviderError::from_status("bfl", 400, r#"{"code":"rate_limit_exceeded"}"#);
        assert!(coded.is_recoverable());
    }

    #[test]
    fn missing_key_is_config() {
        let err = ProviderError::missing_key("replicate");
        assert_eq!(err.kind, ProviderErrorKind::Config);
        assert_eq!(err.to_string(), "replicate API key is required.");
    }
}
