use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};

use sdn_core::{SdnError, TrustLevel};

/// An authenticated bearer session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub token: String,
    pub xpub: String,
    pub trust_level: TrustLevel,
    pub created_at: i64,
    pub expires_at: i64,
    pub ip: String,
    pub user_agent: String,
    pub revoked: bool,
}

/// SQLite-persisted session table (its own database file).
pub struct SessionStore {
    conn: Mutex<Connection>,
}

fn sql_err(e: rusqlite::Error) -> SdnError {
    SdnError::StorageError(e.to_string())
}

impl SessionStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, SdnError> {
        Self::init(Connection::open(path).map_err(sql_err)?)
    }

    pub fn open_in_memory() -> Result<Self, SdnError> {
        Self::init(Connection::open_in_memory().map_err(sql_err)?)
    }

    fn init(conn: Connection) -> Result<Self, SdnError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS sessions (
                 token       TEXT PRIMARY KEY,
                 xpub        TEXT NOT NULL,
                 trust_level TEXT NOT NULL,
                 created_at  INTEGER NOT NULL,
                 expires_at  INTEGER NOT NULL,
                 ip          TEXT NOT NULL DEFAULT '',
                 user_agent  TEXT NOT NULL DEFAULT '',
                 revoked     INTEGER NOT NULL DEFAULT 0
             );
             CREATE INDEX IF NOT EXISTS idx_sessions_expiry ON sessions (expires_at);",
        )
        .map_err(sql_err)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn insert(&self, session: &Session) -> Result<(), SdnError> {
        let conn = self.conn.lock().expect("session store mutex poisoned");
        conn.execute(
            "INSERT INTO sessions
                 (token, xpub, trust_level, created_at, expires_at, ip, user_agent, revoked)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                session.token,
                session.xpub,
                session.trust_level.as_str(),
                session.created_at,
                session.expires_at,
                session.ip,
                session.user_agent,
                session.revoked as i64,
            ],
        )
        .map_err(sql_err)?;
        Ok(())
    }

    pub fn get(&self, token: &str) -> Result<Option<Session>, SdnError> {
        let conn = self.conn.lock().expect("session store mutex poisoned");
        conn.query_row(
            "SELECT token, xpub, trust_level, created_at, expires_at, ip, user_agent, revoked
             FROM sessions WHERE token = ?1",
            params![token],
            |row| {
                Ok(Session {
                    token: row.get(0)?,
                    xpub: row.get(1)?,
                    trust_level: TrustLevel::parse(&row.get::<_, String>(2)?)
                        .unwrap_or_default(),
                    created_at: row.get(3)?,
                    expires_at: row.get(4)?,
                    ip: row.get(5)?,
                    user_agent: row.get(6)?,
                    revoked: row.get::<_, i64>(7)? != 0,
                })
            },
        )
        .optional()
        .map_err(sql_err)
    }

    /// Look up a live session; expired or revoked tokens are `SessionInvalid`.
    pub fn validate(&self, token: &str, now: i64) -> Result<Session, SdnError> {
        let session = self.get(token)?.ok_or(SdnError::SessionInvalid)?;
        if session.revoked || session.expires_at <= now {
            return Err(SdnError::SessionInvalid);
        }
        Ok(session)
    }

    pub fn revoke(&self, token: &str) -> Result<bool, SdnError> {
        let conn = self.conn.lock().expect("session store mutex poisoned");
        let changed = conn
            .execute("UPDATE sessions SET revoked = 1 WHERE token = ?1", params![token])
            .map_err(sql_err)?;
        Ok(changed > 0)
    }

    /// Delete expired and revoked sessions. Returns the number removed.
    pub fn sweep(&self, now: i64) -> Result<u64, SdnError> {
        let conn = self.conn.lock().expect("session store mutex poisoned");
        let removed = conn
            .execute(
                "DELETE FROM sessions WHERE revoked = 1 OR expires_at <= ?1",
                params![now],
            )
            .map_err(sql_err)?;
        Ok(removed as u64)
    }
}
