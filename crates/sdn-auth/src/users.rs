use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use sdn_core::{SdnError, TrustLevel};

/// One configured user: an extended public key identity, its trust level,
/// the Ed25519 signing key bound to it, and login bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub xpub: String,
    pub trust_level: TrustLevel,
    pub signing_pubkey_hex: Option<String>,
    pub last_login: Option<i64>,
}

/// The user-records database (xpub → trust level, signing key, last login).
pub struct UserStore {
    conn: Mutex<Connection>,
}

fn sql_err(e: rusqlite::Error) -> SdnError {
    SdnError::StorageError(e.to_string())
}

/// Apply an additive column migration, tolerating "duplicate column" on
/// upgrade so the statement can run unconditionally.
fn add_column(conn: &Connection, ddl: &str) -> Result<(), SdnError> {
    match conn.execute_batch(ddl) {
        Ok(()) => Ok(()),
        Err(e) if e.to_string().contains("duplicate column") => Ok(()),
        Err(e) => Err(sql_err(e)),
    }
}

impl UserStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, SdnError> {
        Self::init(Connection::open(path).map_err(sql_err)?)
    }

    pub fn open_in_memory() -> Result<Self, SdnError> {
        Self::init(Connection::open_in_memory().map_err(sql_err)?)
    }

    fn init(conn: Connection) -> Result<Self, SdnError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS users (
                 xpub        TEXT PRIMARY KEY,
                 trust_level TEXT NOT NULL,
                 created_at  INTEGER NOT NULL DEFAULT (strftime('%s','now'))
             );",
        )
        .map_err(sql_err)?;
        // Columns added after first release; additive only.
        add_column(&conn, "ALTER TABLE users ADD COLUMN signing_pubkey_hex TEXT;")?;
        add_column(&conn, "ALTER TABLE users ADD COLUMN last_login INTEGER;")?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn get(&self, xpub: &str) -> Result<Option<UserRecord>, SdnError> {
        let conn = self.conn.lock().expect("user store mutex poisoned");
        conn.query_row(
            "SELECT xpub, trust_level, signing_pubkey_hex, last_login
             FROM users WHERE xpub = ?1",
            params![xpub],
            |row| {
                Ok(UserRecord {
                    xpub: row.get(0)?,
                    trust_level: TrustLevel::parse(&row.get::<_, String>(1)?)
                        .unwrap_or_default(),
                    signing_pubkey_hex: row.get(2)?,
                    last_login: row.get(3)?,
                })
            },
        )
        .optional()
        .map_err(sql_err)
    }

    /// Create or update a user entry.
    pub fn upsert(&self, xpub: &str, trust_level: TrustLevel) -> Result<(), SdnError> {
        let conn = self.conn.lock().expect("user store mutex poisoned");
        conn.execute(
            "INSERT INTO users (xpub, trust_level) VALUES (?1, ?2)
             ON CONFLICT(xpub) DO UPDATE SET trust_level = ?2",
            params![xpub, trust_level.as_str()],
        )
        .map_err(sql_err)?;
        Ok(())
    }

    /// Bind a signing key to a user (Trust On First Use: first successful
    /// login wins when none is configured).
    pub fn bind_signing_key(&self, xpub: &str, pubkey_hex: &str) -> Result<(), SdnError> {
        let conn = self.conn.lock().expect("user store mutex poisoned");
        let changed = conn
            .execute(
                "UPDATE users SET signing_pubkey_hex = ?2
                 WHERE xpub = ?1 AND signing_pubkey_hex IS NULL",
                params![xpub, pubkey_hex],
            )
            .map_err(sql_err)?;
        if changed > 0 {
            debug!(xpub, "signing key bound on first use");
        }
        Ok(())
    }

    /// Stamp a successful login.
    pub fn record_login(&self, xpub: &str, now: i64) -> Result<(), SdnError> {
        let conn = self.conn.lock().expect("user store mutex poisoned");
        conn.execute("UPDATE users SET last_login = ?2 WHERE xpub = ?1", params![xpub, now])
            .map_err(sql_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsert_and_get() {
        let store = UserStore::open_in_memory().unwrap();
        store.upsert("xpub-alice", TrustLevel::Admin).unwrap();
        let user = store.get("xpub-alice").unwrap().unwrap();
        assert_eq!(user.trust_level, TrustLevel::Admin);
        assert!(user.signing_pubkey_hex.is_none());
        assert!(store.get("xpub-nobody").unwrap().is_none());
    }

    #[test]
    fn tofu_binding_only_sets_once() {
        let store = UserStore::open_in_memory().unwrap();
        store.upsert("xpub-a", TrustLevel::Standard).unwrap();
        store.bind_signing_key("xpub-a", "aa".repeat(32).as_str()).unwrap();
        store.bind_signing_key("xpub-a", "bb".repeat(32).as_str()).unwrap();
        let user = store.get("xpub-a").unwrap().unwrap();
        assert_eq!(user.signing_pubkey_hex.unwrap(), "aa".repeat(32));
    }

    #[test]
    fn migration_is_idempotent() {
        // init runs the ALTER statements; running them again on the same
        // connection must tolerate the duplicate-column error.
        let store = UserStore::open_in_memory().unwrap();
        let conn = store.conn.lock().unwrap();
        add_column(&conn, "ALTER TABLE users ADD COLUMN signing_pubkey_hex TEXT;").unwrap();
    }

    #[test]
    fn record_login_updates_timestamp() {
        let store = UserStore::open_in_memory().unwrap();
        store.upsert("xpub-a", TrustLevel::Standard).unwrap();
        store.record_login("xpub-a", 1_700_000_000).unwrap();
        assert_eq!(store.get("xpub-a").unwrap().unwrap().last_login, Some(1_700_000_000));
    }
}
