use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use rand::RngCore;
use tracing::debug;

use sdn_core::{
    EventSink, NodeEvent, SdnError, CHALLENGE_LIMIT_PER_IP, CHALLENGE_LIMIT_PER_XPUB,
    CHALLENGE_TTL_SECS, DEFAULT_CLOCK_SKEW_SECS, DEFAULT_MAX_PENDING_CHALLENGES,
    DEFAULT_MAX_RATE_LIMIT_ENTRIES, DEFAULT_SESSION_TTL_SECS, VERIFY_LIMIT_PER_IP,
    VERIFY_LIMIT_PER_XPUB,
};
use sdn_trust::RateTable;

use crate::sessions::{Session, SessionStore};
use crate::users::UserStore;

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub clock_skew_secs: i64,
    pub challenge_ttl_secs: i64,
    pub session_ttl_secs: i64,
    pub max_pending_challenges: usize,
    pub max_rate_limit_entries: usize,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            clock_skew_secs: DEFAULT_CLOCK_SKEW_SECS,
            challenge_ttl_secs: CHALLENGE_TTL_SECS,
            session_ttl_secs: DEFAULT_SESSION_TTL_SECS,
            max_pending_challenges: DEFAULT_MAX_PENDING_CHALLENGES,
            max_rate_limit_entries: DEFAULT_MAX_RATE_LIMIT_ENTRIES,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeRequest {
    pub xpub: String,
    pub client_pubkey_hex: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeResponse {
    pub challenge_id: String,
    /// Hex-encoded 32-byte nonce; the client signs these hex bytes.
    pub challenge: String,
    pub expires_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyRequest {
    pub challenge_id: String,
    pub xpub: String,
    pub client_pubkey_hex: String,
    pub challenge: String,
    pub signature_hex: String,
}

struct PendingChallenge {
    xpub: String,
    pubkey_hex: String,
    nonce_hex: String,
    expires_at: i64,
    /// Unknown xpubs receive a syntactically valid challenge that can never
    /// verify, so callers cannot probe which xpubs exist.
    verifiable: bool,
}

/// Challenge/response authentication for administrative endpoints.
///
/// Challenges are single-use, bounded in number, and expire after 60 s.
/// Every verification failure returns the uniform `AuthenticationFailed`;
/// detail goes only to debug logs.
pub struct AuthCore {
    users: Arc<UserStore>,
    sessions: Arc<SessionStore>,
    pending: Mutex<HashMap<String, PendingChallenge>>,
    ip_limiter: RateTable,
    xpub_limiter: RateTable,
    config: AuthConfig,
    events: Arc<dyn EventSink>,
}

fn random_hex(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::thread_rng().fill_bytes(&mut buf);
    hex::encode(buf)
}

impl AuthCore {
    pub fn new(
        users: Arc<UserStore>,
        sessions: Arc<SessionStore>,
        config: AuthConfig,
        events: Arc<dyn EventSink>,
    ) -> Self {
        let max_entries = config.max_rate_limit_entries;
        Self {
            users,
            sessions,
            pending: Mutex::new(HashMap::new()),
            ip_limiter: RateTable::new(max_entries),
            xpub_limiter: RateTable::new(max_entries),
            config,
            events,
        }
    }

    pub fn request_challenge(
        &self,
        req: &ChallengeRequest,
        ip: &str,
    ) -> Result<ChallengeResponse, SdnError> {
        self.request_challenge_at(req, ip, chrono::Utc::now().timestamp())
    }

    pub fn request_challenge_at(
        &self,
        req: &ChallengeRequest,
        ip: &str,
        now: i64,
    ) -> Result<ChallengeResponse, SdnError> {
        self.ip_limiter.check_at(&format!("challenge:{ip}"), CHALLENGE_LIMIT_PER_IP, now)?;
        self.xpub_limiter
            .check_at(&format!("challenge:{}", req.xpub), CHALLENGE_LIMIT_PER_XPUB, now)?;

        if (req.timestamp - now).abs() > self.config.clock_skew_secs {
            return Err(SdnError::InvalidRequest("timestamp outside permitted skew".into()));
        }
        let pubkey = hex::decode(&req.client_pubkey_hex)
            .map_err(|_| SdnError::InvalidRequest("client public key is not hex".into()))?;
        if !sdn_crypto::is_valid_ed25519_pubkey(&pubkey) {
            return Err(SdnError::InvalidRequest("client public key is invalid".into()));
        }

        let verifiable = self.users.get(&req.xpub)?.is_some();
        let challenge_id = random_hex(16);
        let nonce_hex = random_hex(32);
        let expires_at = now + self.config.challenge_ttl_secs;

        {
            let mut pending = self.pending.lock().expect("challenge mutex poisoned");
            pending.retain(|_, c| c.expires_at > now);
            if pending.len() >= self.config.max_pending_challenges {
                return Err(SdnError::TooManyPendingChallenges);
            }
            pending.insert(
                challenge_id.clone(),
                PendingChallenge {
                    xpub: req.xpub.clone(),
                    pubkey_hex: req.client_pubkey_hex.clone(),
                    nonce_hex: nonce_hex.clone(),
                    expires_at,
                    verifiable,
                },
            );
        }

        Ok(ChallengeResponse { challenge_id, challenge: nonce_hex, expires_at })
    }

    pub fn verify(&self, req: &VerifyRequest, ip: &str, user_agent: &str) -> Result<Session, SdnError> {
        self.verify_at(req, ip, user_agent, chrono::Utc::now().timestamp())
    }

    pub fn verify_at(
        &self,
        req: &VerifyRequest,
        ip: &str,
        user_agent: &str,
        now: i64,
    ) -> Result<Session, SdnError> {
        self.ip_limiter.check_at(&format!("verify:{ip}"), VERIFY_LIMIT_PER_IP, now)?;
        self.xpub_limiter.check_at(&format!("verify:{}", req.xpub), VERIFY_LIMIT_PER_XPUB, now)?;

        // Single use: the challenge leaves the map before any check runs, so
        // a replay can never observe a second success.
        let challenge = self
            .pending
            .lock()
            .expect("challenge mutex poisoned")
            .remove(&req.challenge_id)
            .ok_or(SdnError::AuthenticationFailed)?;

        let checks_pass = challenge.expires_at > now
            && challenge.verifiable
            && challenge.xpub == req.xpub
            && challenge.pubkey_hex == req.client_pubkey_hex
            && challenge.nonce_hex == req.challenge;
        if !checks_pass {
            debug!(xpub = %req.xpub, "challenge verification rejected");
            return Err(SdnError::AuthenticationFailed);
        }

        let user = self.users.get(&req.xpub)?.ok_or(SdnError::AuthenticationFailed)?;
        match &user.signing_pubkey_hex {
            Some(bound) if bound != &req.client_pubkey_hex => {
                debug!(xpub = %req.xpub, "signing key mismatch");
                return Err(SdnError::AuthenticationFailed);
            }
            Some(_) => {}
            None => self.users.bind_signing_key(&req.xpub, &req.client_pubkey_hex)?,
        }

        let pubkey = hex::decode(&req.client_pubkey_hex)
            .map_err(|_| SdnError::AuthenticationFailed)?;
        let signature =
            hex::decode(&req.signature_hex).map_err(|_| SdnError::AuthenticationFailed)?;
        sdn_crypto::verify_ed25519(&pubkey, challenge.nonce_hex.as_bytes(), &signature)
            .map_err(|_| SdnError::AuthenticationFailed)?;

        let session = Session {
            token: random_hex(32),
            xpub: req.xpub.clone(),
            trust_level: user.trust_level,
            created_at: now,
            expires_at: now + self.config.session_ttl_secs,
            ip: ip.to_string(),
            user_agent: user_agent.to_string(),
            revoked: false,
        };
        self.sessions.insert(&session)?;
        self.users.record_login(&req.xpub, now)?;
        self.events.emit(NodeEvent::SessionCreated { xpub: req.xpub.clone(), at: now });
        Ok(session)
    }

    pub fn validate_session(&self, token: &str) -> Result<Session, SdnError> {
        self.sessions.validate(token, chrono::Utc::now().timestamp())
    }

    pub fn validate_session_at(&self, token: &str, now: i64) -> Result<Session, SdnError> {
        self.sessions.validate(token, now)
    }

    /// Revoke a session token.
    pub fn logout(&self, token: &str) -> Result<(), SdnError> {
        let session = self.sessions.get(token)?.ok_or(SdnError::SessionInvalid)?;
        self.sessions.revoke(token)?;
        self.events.emit(NodeEvent::SessionRevoked { xpub: session.xpub });
        Ok(())
    }

    /// Periodic cleanup: expired challenges and dead sessions.
    pub fn sweep(&self) -> Result<u64, SdnError> {
        self.sweep_at(chrono::Utc::now().timestamp())
    }

    pub fn sweep_at(&self, now: i64) -> Result<u64, SdnError> {
        self.pending.lock().expect("challenge mutex poisoned").retain(|_, c| c.expires_at > now);
        self.sessions.sweep(now)
    }

    pub fn pending_challenges(&self) -> usize {
        self.pending.lock().expect("challenge mutex poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sdn_core::{NullSink, TrustLevel};
    use sdn_crypto::NodeSigner;

    struct Fixture {
        auth: AuthCore,
        users: Arc<UserStore>,
        signer: NodeSigner,
        pubkey_hex: String,
    }

    fn fixture_with(config: AuthConfig) -> Fixture {
        let users = Arc::new(UserStore::open_in_memory().unwrap());
        let sessions = Arc::new(SessionStore::open_in_memory().unwrap());
        let signer = NodeSigner::generate();
        let pubkey_hex = hex::encode(signer.public_key_bytes());
        let auth = AuthCore::new(Arc::clone(&users), sessions, config, Arc::new(NullSink));
        Fixture { auth, users, signer, pubkey_hex }
    }

    fn fixture() -> Fixture {
        let f = fixture_with(AuthConfig::default());
        f.users.upsert("xpub-admin", TrustLevel::Admin).unwrap();
        f
    }

    fn challenge_req(f: &Fixture, now: i64) -> ChallengeRequest {
        ChallengeRequest {
            xpub: "xpub-admin".into(),
            client_pubkey_hex: f.pubkey_hex.clone(),
            timestamp: now,
        }
    }

    fn verify_req(f: &Fixture, resp: &ChallengeResponse) -> VerifyRequest {
        VerifyRequest {
            challenge_id: resp.challenge_id.clone(),
            xpub: "xpub-admin".into(),
            client_pubkey_hex: f.pubkey_hex.clone(),
            challenge: resp.challenge.clone(),
            signature_hex: hex::encode(f.signer.sign(resp.challenge.as_bytes())),
        }
    }

    #[test]
    fn challenge_verify_happy_path_then_replay_fails() {
        let f = fixture();
        let now = 1_700_000_000;
        let resp = f.auth.request_challenge_at(&challenge_req(&f, now), "1.2.3.4", now).unwrap();

        let req = verify_req(&f, &resp);
        let session = f.auth.verify_at(&req, "1.2.3.4", "cli", now + 1).unwrap();
        assert_eq!(session.trust_level, TrustLevel::Admin);
        assert_eq!(session.xpub, "xpub-admin");
        f.auth.validate_session_at(&session.token, now + 2).unwrap();

        // last_login recorded
        let user = f.users.get("xpub-admin").unwrap().unwrap();
        assert_eq!(user.last_login, Some(now + 1));

        // Replay of the identical verify: challenge already consumed.
        assert!(matches!(
            f.auth.verify_at(&req, "1.2.3.4", "cli", now + 2),
            Err(SdnError::AuthenticationFailed)
        ));
    }

    #[test]
    fn tampered_signature_fails_uniformly() {
        let f = fixture();
        let now = 1_700_000_000;
        let resp = f.auth.request_challenge_at(&challenge_req(&f, now), "ip", now).unwrap();
        let mut req = verify_req(&f, &resp);
        req.signature_hex = hex::encode([0u8; 64]);
        assert!(matches!(
            f.auth.verify_at(&req, "ip", "ua", now),
            Err(SdnError::AuthenticationFailed)
        ));
    }

    #[test]
    fn unknown_xpub_gets_plausible_challenge_that_never_verifies() {
        let f = fixture();
        let now = 1_700_000_000;
        let req = ChallengeRequest {
            xpub: "xpub-ghost".into(),
            client_pubkey_hex: f.pubkey_hex.clone(),
            timestamp: now,
        };
        let resp = f.auth.request_challenge_at(&req, "ip", now).unwrap();
        // Indistinguishable shape from a real challenge.
        assert_eq!(resp.challenge.len(), 64);
        assert_eq!(resp.challenge_id.len(), 32);

        let verify = VerifyRequest {
            challenge_id: resp.challenge_id.clone(),
            xpub: "xpub-ghost".into(),
            client_pubkey_hex: f.pubkey_hex.clone(),
            challenge: resp.challenge.clone(),
            signature_hex: hex::encode(f.signer.sign(resp.challenge.as_bytes())),
        };
        assert!(matches!(
            f.auth.verify_at(&verify, "ip", "ua", now),
            Err(SdnError::AuthenticationFailed)
        ));
    }

    #[test]
    fn expired_challenge_fails() {
        let f = fixture();
        let now = 1_700_000_000;
        let resp = f.auth.request_challenge_at(&challenge_req(&f, now), "ip", now).unwrap();
        let req = verify_req(&f, &resp);
        assert!(matches!(
            f.auth.verify_at(&req, "ip", "ua", now + 61),
            Err(SdnError::AuthenticationFailed)
        ));
    }

    #[test]
    fn timestamp_outside_skew_rejected() {
        let f = fixture();
        let now = 1_700_000_000;
        let mut req = challenge_req(&f, now);
        req.timestamp = now - 121;
        assert!(matches!(
            f.auth.request_challenge_at(&req, "ip", now),
            Err(SdnError::InvalidRequest(_))
        ));
    }

    #[test]
    fn tofu_binds_first_key_and_rejects_a_different_one() {
        let f = fixture();
        let now = 1_700_000_000;
        let resp = f.auth.request_challenge_at(&challenge_req(&f, now), "ip", now).unwrap();
        f.auth.verify_at(&verify_req(&f, &resp), "ip", "ua", now).unwrap();

        // A second client with a different key cannot log in for this xpub.
        let other = NodeSigner::generate();
        let other_hex = hex::encode(other.public_key_bytes());
        let req2 = ChallengeRequest {
            xpub: "xpub-admin".into(),
            client_pubkey_hex: other_hex.clone(),
            timestamp: now,
        };
        let resp2 = f.auth.request_challenge_at(&req2, "ip", now).unwrap();
        let verify2 = VerifyRequest {
            challenge_id: resp2.challenge_id.clone(),
            xpub: "xpub-admin".into(),
            client_pubkey_hex: other_hex,
            challenge: resp2.challenge.clone(),
            signature_hex: hex::encode(other.sign(resp2.challenge.as_bytes())),
        };
        assert!(matches!(
            f.auth.verify_at(&verify2, "ip", "ua", now),
            Err(SdnError::AuthenticationFailed)
        ));
    }

    #[test]
    fn pending_challenge_cap() {
        let f = fixture_with(AuthConfig { max_pending_challenges: 2, ..Default::default() });
        f.users.upsert("xpub-admin", TrustLevel::Admin).unwrap();
        let now = 1_700_000_000;
        f.auth.request_challenge_at(&challenge_req(&f, now), "ip1", now).unwrap();
        f.auth.request_challenge_at(&challenge_req(&f, now), "ip2", now).unwrap();
        assert!(matches!(
            f.auth.request_challenge_at(&challenge_req(&f, now), "ip3", now),
            Err(SdnError::TooManyPendingChallenges)
        ));
        // Expired entries free capacity.
        assert!(f
            .auth
            .request_challenge_at(&challenge_req(&f, now + 61), "ip4", now + 61)
            .is_ok());
    }

    #[test]
    fn challenge_rate_limit_per_ip() {
        let f = fixture();
        let now = 1_700_000_000;
        for _ in 0..CHALLENGE_LIMIT_PER_IP {
            // Spread across xpubs so only the IP limit binds.
            let req = ChallengeRequest {
                xpub: format!("xpub-{}", random_hex(4)),
                client_pubkey_hex: f.pubkey_hex.clone(),
                timestamp: now,
            };
            f.auth.request_challenge_at(&req, "10.0.0.1", now).unwrap();
        }
        assert!(matches!(
            f.auth.request_challenge_at(&challenge_req(&f, now), "10.0.0.1", now),
            Err(SdnError::RateLimited)
        ));
    }

    #[test]
    fn logout_revokes_session() {
        let f = fixture();
        let now = 1_700_000_000;
        let resp = f.auth.request_challenge_at(&challenge_req(&f, now), "ip", now).unwrap();
        let session = f.auth.verify_at(&verify_req(&f, &resp), "ip", "ua", now).unwrap();
        f.auth.logout(&session.token).unwrap();
        assert!(matches!(
            f.auth.validate_session_at(&session.token, now + 1),
            Err(SdnError::SessionInvalid)
        ));
    }

    #[test]
    fn sweep_purges_expired_challenges() {
        let f = fixture();
        let now = 1_700_000_000;
        f.auth.request_challenge_at(&challenge_req(&f, now), "ip", now).unwrap();
        assert_eq!(f.auth.pending_challenges(), 1);
        f.auth.sweep_at(now + 61).unwrap();
        assert_eq!(f.auth.pending_challenges(), 0);
    }
}
