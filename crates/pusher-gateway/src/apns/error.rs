//! Classification of APNS delivery failures.
//!
//! A failed send becomes one [`DeliveryError`] variant. Token errors mean
//! the device token is dead and must be purged; everything else aborts the
//! batch that hit it.

use serde::Deserialize;

/// Reasons that indict the device token rather than the request.
const TOKEN_REASONS: [&str; 5] = [
    "BadDeviceToken",
    "MissingDeviceToken",
    "DeviceTokenNotForTopic",
    "TopicDisallowed",
    "Unregistered",
];

/// Error body returned by APNS alongside a non-200 status.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApnsErrorBody {
    #[serde(default)]
    pub reason: String,
    /// Milliseconds since the epoch at which the token stopped being valid.
    #[serde(default)]
    pub timestamp: Option<i64>,
}

/// Outcome of a single failed send.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    /// The device token is invalid; purge records saved before `invalid_since`.
    #[error("{}", reason_text(*status, reason))]
    Token {
        status: u16,
        reason: String,
        /// Unix seconds, when APNS reported it.
        invalid_since: Option<i64>,
    },

    /// APNS refused the request itself (headers, payload, credentials).
    #[error("{}", reason_text(*status, reason))]
    Rejected { status: u16, reason: String },

    /// APNS failed with a 5xx.
    #[error("{}", reason_text(*status, reason))]
    Server { status: u16, reason: String },

    /// No HTTP response, or the connection was torn down mid-stream.
    #[error("transport error: {0}")]
    Transport(String),

    /// The identity could not produce credentials for the request.
    #[error("credential error: {0}")]
    Credential(String),
}

/// Coarse taxonomy used by callers that only need to branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Token,
    Rejected,
    Server,
    Transport,
    Credential,
}

impl ErrorKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Token => "token",
            Self::Rejected => "rejected",
            Self::Server => "server",
            Self::Transport => "transport",
            Self::Credential => "credential",
        }
    }
}

impl DeliveryError {
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Token { .. } => ErrorKind::Token,
            Self::Rejected { .. } => ErrorKind::Rejected,
            Self::Server { .. } => ErrorKind::Server,
            Self::Transport(_) => ErrorKind::Transport,
            Self::Credential(_) => ErrorKind::Credential,
        }
    }

    /// True when the token should be dropped and the next one tried.
    pub const fn is_token(&self) -> bool {
        matches!(self, Self::Token { .. })
    }

    /// HTTP status of the provider response, `0` when there was none.
    pub const fn status(&self) -> u16 {
        match self {
            Self::Token { status, .. }
            | Self::Rejected { status, .. }
            | Self::Server { status, .. } => *status,
            Self::Transport(_) | Self::Credential(_) => 0,
        }
    }

    /// The raw APNS reason code, if any.
    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Token { reason, .. }
            | Self::Rejected { reason, .. }
            | Self::Server { reason, .. } => Some(reason),
            Self::Transport(_) | Self::Credential(_) => None,
        }
    }

    /// Unix seconds from which stored copies of the token are stale.
    pub const fn invalid_since(&self) -> Option<i64> {
        match self {
            Self::Token { invalid_since, .. } => *invalid_since,
            _ => None,
        }
    }
}

/// Map a provider error to its taxonomy.
///
/// `timestamp` is in milliseconds, as APNS sends it; zero counts as absent.
pub fn classify(status: u16, reason: &str, timestamp: Option<i64>) -> DeliveryError {
    let reason = reason.to_string();
    if TOKEN_REASONS.contains(&reason.as_str()) {
        return DeliveryError::Token {
            status,
            reason,
            invalid_since: timestamp.filter(|&ms| ms != 0).map(|ms| ms / 1000),
        };
    }
    match status {
        0 => DeliveryError::Transport(reason_text(0, &reason)),
        500..=599 => DeliveryError::Server { status, reason },
        _ => DeliveryError::Rejected { status, reason },
    }
}

/// Classify a non-200 response from its status and body.
pub fn from_response(status: u16, body: &[u8]) -> DeliveryError {
    match serde_json::from_slice::<ApnsErrorBody>(body) {
        Ok(parsed) => classify(status, &parsed.reason, parsed.timestamp),
        Err(_) => classify(status, "", None),
    }
}

/// Recover an APNS reason from a connection-level failure.
///
/// When APNS closes a connection it sends GOAWAY with a JSON reason as debug
/// data; that text surfaces somewhere in the error's source chain.
pub fn from_transport(err: &(dyn std::error::Error + 'static)) -> DeliveryError {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(body) = embedded_reason(&e.to_string()) {
            return classify(0, &body.reason, body.timestamp);
        }
        current = e.source();
    }
    DeliveryError::Transport(err.to_string())
}

fn embedded_reason(text: &str) -> Option<ApnsErrorBody> {
    let start = text.find("{\"reason\"")?;
    let end = text[start..].find('}')? + start;
    serde_json::from_str::<ApnsErrorBody>(&text[start..=end])
        .ok()
        .filter(|b| !b.reason.is_empty())
}

/// Human-readable description of an APNS reason.
///
/// Unknown reasons fall back to the HTTP status text, then to the raw code.
pub fn reason_text(status: u16, reason: &str) -> String {
    if let Some(text) = known_reason(reason) {
        return text.to_string();
    }
    reqwest::StatusCode::from_u16(status)
        .ok()
        .and_then(|s| s.canonical_reason())
        .map_or_else(|| reason.to_string(), ToString::to_string)
}

fn known_reason(reason: &str) -> Option<&'static str> {
    Some(match reason {
        "BadCollapseId" => "The collapse identifier exceeds the maximum allowed size.",
        "BadDeviceToken" => {
            "The specified device token was bad. Verify that the request contains a valid token and that the token matches the environment."
        }
        "BadExpirationDate" => "The apns-expiration value is bad.",
        "BadMessageId" => "The apns-id value is bad.",
        "BadPriority" => "The apns-priority value is bad.",
        "BadTopic" => "The apns-topic was invalid.",
        "DeviceTokenNotForTopic" => "The device token does not match the specified topic.",
        "DuplicateHeaders" => "One or more headers were repeated.",
        "IdleTimeout" => "Idle time out.",
        "MissingDeviceToken" => {
            "The device token is not specified in the request :path. Verify that the :path header contains the device token."
        }
        "MissingTopic" => {
            "The apns-topic header of the request was not specified and was required. The apns-topic header is mandatory when the client is connected using a certificate that supports multiple topics."
        }
        "PayloadEmpty" => "The message payload was empty.",
        "TopicDisallowed" => "Pushing to this topic is not allowed.",
        "BadCertificate" => "The certificate was bad.",
        "BadCertificateEnvironment" => "The client certificate was for the wrong environment.",
        "ExpiredProviderToken" => {
            "The provider token is stale and a new token should be generated."
        }
        "Forbidden" => "The specified action is not allowed.",
        "InvalidProviderToken" => {
            "The provider token is not valid or the token signature could not be verified."
        }
        "MissingProviderToken" => {
            "No provider certificate was used to connect to APNs and Authorization header was missing or no provider token was specified."
        }
        "BadPath" => "The request contained a bad :path value.",
        "MethodNotAllowed" => "The specified :method was not POST.",
        "Unregistered" => "The device token is inactive for the specified topic.",
        "PayloadTooLarge" => {
            "The message payload was too large. See The Remote Notification Payload for details on maximum payload size."
        }
        "TooManyProviderTokenUpdates" => "The provider token is being updated too often.",
        "TooManyRequests" => {
            "Too many requests were made consecutively to the same device token."
        }
        "InternalServerError" => "An internal server error occurred.",
        "ServiceUnavailable" => "The service is unavailable.",
        "Shutdown" => "The server is shutting down.",
        _ => return None,
    })
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn token_reasons_are_token_errors() {
        for reason in TOKEN_REASONS {
            let err = classify(400, reason, None);
            assert!(err.is_token(), "{reason} should be a token error");
        }
        assert!(classify(410, "Unregistered", None).is_token());
    }

    #[test]
    fn unregistered_carries_invalid_since_in_seconds() {
        let err = classify(410, "Unregistered", Some(1_700_000_000_123));
        assert_eq!(err.invalid_since(), Some(1_700_000_000));
        assert_eq!(err.status(), 410);
        assert_eq!(err.reason(), Some("Unregistered"));
    }

    #[test]
    fn zero_timestamp_is_absent() {
        let err = classify(410, "Unregistered", Some(0));
        assert_eq!(err.invalid_since(), None);
    }

    #[test]
    fn other_statuses_split_by_range() {
        assert_eq!(classify(400, "BadTopic", None).kind(), ErrorKind::Rejected);
        assert_eq!(classify(403, "InvalidProviderToken", None).kind(), ErrorKind::Rejected);
        assert_eq!(classify(500, "InternalServerError", None).kind(), ErrorKind::Server);
        assert_eq!(classify(503, "ServiceUnavailable", None).kind(), ErrorKind::Server);
        assert_eq!(classify(0, "Shutdown", None).kind(), ErrorKind::Transport);
    }

    #[test]
    fn reason_text_uses_table_then_status_then_raw() {
        assert_eq!(reason_text(400, "BadTopic"), "The apns-topic was invalid.");
        assert_eq!(reason_text(429, "SomethingNew"), "Too Many Requests");
        assert_eq!(reason_text(0, "SomethingNew"), "SomethingNew");
        assert_eq!(reason_text(599, "Weird"), "Weird");
    }

    #[test]
    fn display_uses_reason_text() {
        let err = classify(410, "Unregistered", None);
        assert_eq!(
            err.to_string(),
            "The device token is inactive for the specified topic."
        );
    }

    #[test]
    fn response_body_is_parsed() {
        let err = from_response(410, br#"{"reason":"Unregistered","timestamp":1500000000000}"#);
        assert_eq!(err.invalid_since(), Some(1_500_000_000));

        let err = from_response(400, b"not json");
        assert_eq!(
            err,
            DeliveryError::Rejected {
                status: 400,
                reason: String::new()
            }
        );
    }

    #[derive(Debug)]
    struct Outer(Inner);
    #[derive(Debug)]
    struct Inner(String);

    impl std::fmt::Display for Outer {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str("error sending request")
        }
    }
    impl std::error::Error for Outer {
        fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
            Some(&self.0)
        }
    }
    impl std::fmt::Display for Inner {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str(&self.0)
        }
    }
    impl std::error::Error for Inner {}

    #[test]
    fn goaway_reason_is_recovered_from_source_chain() {
        let err = Outer(Inner(
            r#"connection error: GOAWAY debug data {"reason":"Shutdown"}"#.to_string(),
        ));
        let classified = from_transport(&err);
        assert_eq!(
            classified,
            DeliveryError::Transport("The server is shutting down.".to_string())
        );
    }

    #[test]
    fn goaway_with_token_reason_is_token_error() {
        let err = Inner(r#"GOAWAY {"reason":"BadDeviceToken"}"#.to_string());
        assert!(from_transport(&err).is_token());
    }

    #[test]
    fn plain_transport_failure_keeps_message() {
        let err = Outer(Inner("connection refused".to_string()));
        assert_eq!(
            from_transport(&err),
            DeliveryError::Transport("error sending request".to_string())
        );
    }
}
