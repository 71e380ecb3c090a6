//! Outbound notification and its APNS header set.

/// Longest `apns-collapse-id` APNS accepts, in bytes.
pub const MAX_COLLAPSE_ID_LEN: usize = 64;

/// Sent as `user-agent` on every provider request.
pub const USER_AGENT: &str = concat!("pusher-gateway/", env!("CARGO_PKG_VERSION"));

/// A notification addressed to one topic.
///
/// The device token is not part of it: a single instance is shared across
/// every recipient of a fan-out and the token travels beside it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// Owner of the recipient tokens, echoed back in delivery responses.
    pub owner: String,
    pub topic: String,
    /// Raw JSON body.
    pub payload: Vec<u8>,
    /// Caller-supplied `apns-id`.
    pub id: Option<String>,
    /// Unix seconds after which APNS should stop trying.
    pub expiration: Option<i64>,
    pub low_priority: bool,
    pub collapse_id: Option<String>,
}

impl Notification {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            owner: String::new(),
            topic: topic.into(),
            payload: payload.into(),
            id: None,
            expiration: None,
            low_priority: false,
            collapse_id: None,
        }
    }

    #[must_use]
    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }

    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    #[must_use]
    pub const fn with_expiration(mut self, unix_secs: i64) -> Self {
        self.expiration = Some(unix_secs);
        self
    }

    #[must_use]
    pub const fn with_low_priority(mut self, low: bool) -> Self {
        self.low_priority = low;
        self
    }

    #[must_use]
    pub fn with_collapse_id(mut self, collapse_id: impl Into<String>) -> Self {
        self.collapse_id = Some(collapse_id.into());
        self
    }

    /// Request path for `token`.
    pub fn path(token: &str) -> String {
        format!("/3/device/{token}")
    }

    /// Provider headers for this notification as of `now` (unix seconds).
    ///
    /// An expiration already in the past is sent as `0`. Collapse IDs longer
    /// than [`MAX_COLLAPSE_ID_LEN`] are dropped.
    pub fn apns_headers(&self, now: i64) -> Vec<(&'static str, String)> {
        let mut headers = vec![
            ("user-agent", USER_AGENT.to_string()),
            ("content-type", "application/json".to_string()),
        ];
        if let Some(id) = self.id.as_deref().filter(|id| !id.is_empty()) {
            headers.push(("apns-id", id.to_string()));
        }
        if let Some(expiration) = self.expiration {
            let value = if expiration < now { 0 } else { expiration };
            headers.push(("apns-expiration", value.to_string()));
        }
        if self.low_priority {
            headers.push(("apns-priority", "5".to_string()));
        }
        if !self.topic.is_empty() {
            headers.push(("apns-topic", self.topic.clone()));
        }
        if let Some(collapse) = self
            .collapse_id
            .as_deref()
            .filter(|c| !c.is_empty() && c.len() <= MAX_COLLAPSE_ID_LEN)
        {
            headers.push(("apns-collapse-id", collapse.to_string()));
        }
        headers
    }
}
