use thiserror::Error;

/// The SDN error taxonomy.
///
/// Variants are kinds, not component-local types: every crate in the
/// workspace reports through this enum so callers can match on recovery
/// policy without knowing which layer failed.
#[derive(Debug, Error)]
pub enum SdnError {
    // ── Schema / validation ──────────────────────────────────────────────────
    #[error("unknown schema: {0}")]
    UnknownSchema(String),

    #[error("schema validation failed: {0}")]
    SchemaValidationFailed(String),

    // ── Signatures / identity ────────────────────────────────────────────────
    /// Deliberately carries no detail: callers must not be able to tell
    /// "wrong key" from "corrupt signature".
    #[error("invalid signature")]
    InvalidSignature,

    // ── Protocol ─────────────────────────────────────────────────────────────
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("rate limited")]
    RateLimited,

    #[error("peer is quarantined")]
    Quarantined,

    // ── Auth ─────────────────────────────────────────────────────────────────
    #[error("unauthorized")]
    Unauthorized,

    #[error("forbidden")]
    Forbidden,

    /// Uniform opaque failure for the whole challenge/verify path.
    #[error("authentication failed")]
    AuthenticationFailed,

    #[error("session invalid")]
    SessionInvalid,

    #[error("too many pending challenges")]
    TooManyPendingChallenges,

    // ── Store ────────────────────────────────────────────────────────────────
    #[error("not found")]
    NotFound,

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("storage error: {0}")]
    StorageError(String),

    // ── Subscriptions ────────────────────────────────────────────────────────
    #[error("invalid subscription: {}", .0.join("; "))]
    InvalidSubscription(Vec<String>),

    // ── Transport / timing ───────────────────────────────────────────────────
    #[error("timeout")]
    Timeout,

    #[error("transport error: {0}")]
    TransportError(String),

    // ── Serialization ────────────────────────────────────────────────────────
    #[error("serialization error: {0}")]
    Serialization(String),

    // ── Lifecycle ────────────────────────────────────────────────────────────
    #[error("shutting down")]
    Shutdown,
}

impl SdnError {
    /// Short machine-readable code used in Nack payloads and audit events.
    pub fn code(&self) -> &'static str {
        match self {
            SdnError::UnknownSchema(_) => "unknown_schema",
            SdnError::SchemaValidationFailed(_) => "schema_validation_failed",
            SdnError::InvalidSignature => "invalid_signature",
            SdnError::InvalidRequest(_) => "invalid_request",
            SdnError::MessageTooLarge { .. } => "message_too_large",
            SdnError::RateLimited => "rate_limited",
            SdnError::Quarantined => "quarantined",
            SdnError::Unauthorized => "unauthorized",
            SdnError::Forbidden => "forbidden",
            SdnError::AuthenticationFailed => "authentication_failed",
            SdnError::SessionInvalid => "session_invalid",
            SdnError::TooManyPendingChallenges => "too_many_pending_challenges",
            SdnError::NotFound => "not_found",
            SdnError::AlreadyExists(_) => "already_exists",
            SdnError::StorageError(_) => "storage_error",
            SdnError::InvalidSubscription(_) => "invalid_subscription",
            SdnError::Timeout => "timeout",
            SdnError::TransportError(_) => "transport_error",
            SdnError::Serialization(_) => "serialization_error",
            SdnError::Shutdown => "shutdown",
        }
    }
}
