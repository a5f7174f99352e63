//! sdn-auth
//!
//! Challenge/response authentication: bounded single-use nonces, Trust On
//! First Use key binding, SQLite-persisted sessions and user records, and
//! per-IP/per-xpub fixed-window rate limits.

pub mod challenge;
pub mod sessions;
pub mod users;

pub use challenge::{AuthConfig, AuthCore, ChallengeRequest, ChallengeResponse, VerifyRequest};
pub use sessions::{Session, SessionStore};
pub use users::{UserRecord, UserStore};
