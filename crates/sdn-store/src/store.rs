use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, warn};

use sdn_core::{Cid, PeerId, Predicate, Record, SdnError};
use sdn_schema::{PayloadFields, SchemaRegistry};

/// Result of a `put`: the CID, and whether this call inserted the row.
///
/// The insert is the dedup linearization point — a racing second writer gets
/// `inserted == false` and must not re-dispatch the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PutOutcome {
    pub cid: Cid,
    pub inserted: bool,
}

/// Row-count and size summary for one schema partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaStats {
    pub schema: String,
    pub rows: u64,
    pub payload_bytes: u64,
}

/// Result ordering for `query`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueryOrder {
    /// Store insertion order (rowid).
    #[default]
    Insertion,
    ReceivedAsc,
    ReceivedDesc,
}

/// CID-addressed, schema-partitioned, queryable record store.
///
/// One SQLite table per schema name plus a global `cid_index` for CID → schema
/// lookup and cross-schema deduplication. The connection is behind a single
/// mutex: one writer at a time, which SQLite would serialize anyway; WAL mode
/// keeps readers cheap.
pub struct Store {
    conn: Mutex<Connection>,
    registry: Arc<SchemaRegistry>,
    fields: Arc<dyn PayloadFields>,
}

fn sql_err(e: rusqlite::Error) -> SdnError {
    SdnError::StorageError(e.to_string())
}

/// Schema names become table names; reject anything that cannot be embedded
/// safely.
fn table_name(schema: &str) -> Result<String, SdnError> {
    if schema.is_empty()
        || !schema.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Err(SdnError::UnknownSchema(schema.to_string()));
    }
    Ok(format!("records_{schema}"))
}

impl Store {
    /// Open (or create) the store database at `path`.
    pub fn open<P: AsRef<Path>>(
        path: P,
        registry: Arc<SchemaRegistry>,
        fields: Arc<dyn PayloadFields>,
    ) -> Result<Self, SdnError> {
        let conn = Connection::open(path).map_err(sql_err)?;
        Self::init(conn, registry, fields)
    }

    /// In-memory store for tests.
    pub fn open_in_memory(
        registry: Arc<SchemaRegistry>,
        fields: Arc<dyn PayloadFields>,
    ) -> Result<Self, SdnError> {
        let conn = Connection::open_in_memory().map_err(sql_err)?;
        Self::init(conn, registry, fields)
    }

    fn init(
        conn: Connection,
        registry: Arc<SchemaRegistry>,
        fields: Arc<dyn PayloadFields>,
    ) -> Result<Self, SdnError> {
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             CREATE TABLE IF NOT EXISTS cid_index (
                 cid    TEXT PRIMARY KEY,
                 schema TEXT NOT NULL
             );",
        )
        .map_err(sql_err)?;
        Ok(Self { conn: Mutex::new(conn), registry, fields })
    }

    fn ensure_table(conn: &Connection, table: &str) -> Result<(), SdnError> {
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                 cid         TEXT PRIMARY KEY,
                 peer_id     TEXT NOT NULL,
                 received_at INTEGER NOT NULL,
                 payload     BLOB NOT NULL,
                 signature   BLOB NOT NULL,
                 created_at  INTEGER NOT NULL DEFAULT (strftime('%s','now'))
             );
             CREATE INDEX IF NOT EXISTS idx_{table}_peer_received
                 ON {table} (peer_id, received_at);"
        ))
        .map_err(sql_err)
    }

    /// Validate, verify, and persist a record. Idempotent on CID collision:
    /// the first insert's signature and peer win, later calls are no-ops.
    pub fn put(
        &self,
        schema: &str,
        payload: &[u8],
        producer: &PeerId,
        signature: &[u8],
    ) -> Result<PutOutcome, SdnError> {
        if !self.registry.has(schema) {
            return Err(SdnError::UnknownSchema(schema.to_string()));
        }
        self.registry.validate(schema, payload)?;
        sdn_crypto::verify_from_peer(producer, payload, signature)?;

        let cid = Cid::of(payload);
        let received_at = chrono::Utc::now().timestamp();
        let table = table_name(schema)?;

        let conn = self.conn.lock().expect("store mutex poisoned");
        Self::ensure_table(&conn, &table)?;

        // Linearization point: first INSERT into cid_index wins.
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO cid_index (cid, schema) VALUES (?1, ?2)",
                params![cid.to_hex(), schema],
            )
            .map_err(sql_err)?
            > 0;

        if inserted {
            conn.execute(
                &format!(
                    "INSERT OR IGNORE INTO {table}
                         (cid, peer_id, received_at, payload, signature)
                     VALUES (?1, ?2, ?3, ?4, ?5)"
                ),
                params![cid.to_hex(), producer.as_str(), received_at, payload, signature],
            )
            .map_err(sql_err)?;
            debug!(cid = %cid, schema, "record stored");
        }

        Ok(PutOutcome { cid, inserted })
    }

    /// Fetch a record by CID.
    ///
    /// Corruption detected on read (payload no longer hashes to the CID) logs
    /// a warning, removes the row, and reports `NotFound`.
    pub fn get(&self, cid: &Cid) -> Result<Record, SdnError> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let schema: String = conn
            .query_row(
                "SELECT schema FROM cid_index WHERE cid = ?1",
                params![cid.to_hex()],
                |row| row.get(0),
            )
            .optional()
            .map_err(sql_err)?
            .ok_or(SdnError::NotFound)?;

        let table = table_name(&schema)?;
        let row = conn
            .query_row(
                &format!(
                    "SELECT peer_id, received_at, payload, signature FROM {table} WHERE cid = ?1"
                ),
                params![cid.to_hex()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, Vec<u8>>(2)?,
                        row.get::<_, Vec<u8>>(3)?,
                    ))
                },
            )
            .optional()
            .map_err(sql_err)?;

        let (peer_id, received_at, payload, signature) = match row {
            Some(r) => r,
            None => {
                // Index without a row: heal the index and report missing.
                conn.execute("DELETE FROM cid_index WHERE cid = ?1", params![cid.to_hex()])
                    .map_err(sql_err)?;
                return Err(SdnError::NotFound);
            }
        };

        if Cid::of(&payload) != *cid {
            warn!(cid = %cid, schema = %schema, "corrupt row detected on read; removing");
            conn.execute(&format!("DELETE FROM {table} WHERE cid = ?1"), params![cid.to_hex()])
                .map_err(sql_err)?;
            conn.execute("DELETE FROM cid_index WHERE cid = ?1", params![cid.to_hex()])
                .map_err(sql_err)?;
            return Err(SdnError::NotFound);
        }

        Ok(Record {
            schema_name: schema,
            payload,
            signature,
            producer: PeerId::new(peer_id),
            received_at,
        })
    }

    /// Whether a CID is present (no payload read, no corruption check).
    pub fn contains(&self, cid: &Cid) -> Result<bool, SdnError> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let found: Option<String> = conn
            .query_row(
                "SELECT schema FROM cid_index WHERE cid = ?1",
                params![cid.to_hex()],
                |row| row.get(0),
            )
            .optional()
            .map_err(sql_err)?;
        Ok(found.is_some())
    }

    /// Field-level query over one schema partition. Predicates AND together;
    /// unknown fields produce empty matches, not errors.
    pub fn query(
        &self,
        schema: &str,
        predicates: &[Predicate],
        limit: Option<usize>,
        order: QueryOrder,
    ) -> Result<Vec<Record>, SdnError> {
        if !self.registry.has(schema) {
            return Err(SdnError::UnknownSchema(schema.to_string()));
        }
        let table = table_name(schema)?;
        let order_sql = match order {
            QueryOrder::Insertion => "rowid ASC",
            QueryOrder::ReceivedAsc => "received_at ASC, rowid ASC",
            QueryOrder::ReceivedDesc => "received_at DESC, rowid DESC",
        };

        let conn = self.conn.lock().expect("store mutex poisoned");
        Self::ensure_table(&conn, &table)?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT cid, peer_id, received_at, payload, signature
                 FROM {table} ORDER BY {order_sql}"
            ))
            .map_err(sql_err)?;

        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, Vec<u8>>(3)?,
                    row.get::<_, Vec<u8>>(4)?,
                ))
            })
            .map_err(sql_err)?;

        let mut out = Vec::new();
        for row in rows {
            let (_cid, peer_id, received_at, payload, signature) = row.map_err(sql_err)?;
            let matches = predicates.iter().all(|p| {
                let field = self.fields.get(schema, &payload, &p.field);
                p.eval(field.as_ref())
            });
            if !matches {
                continue;
            }
            out.push(Record {
                schema_name: schema.to_string(),
                payload,
                signature,
                producer: PeerId::new(peer_id),
                received_at,
            });
            if let Some(max) = limit {
                if out.len() >= max {
                    break;
                }
            }
        }
        Ok(out)
    }

    /// Records received at or after `timestamp`, ascending by receipt time.
    pub fn since(&self, schema: &str, timestamp: i64) -> Result<Vec<Record>, SdnError> {
        if !self.registry.has(schema) {
            return Err(SdnError::UnknownSchema(schema.to_string()));
        }
        let table = table_name(schema)?;
        let conn = self.conn.lock().expect("store mutex poisoned");
        Self::ensure_table(&conn, &table)?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT peer_id, received_at, payload, signature
                 FROM {table} WHERE received_at >= ?1
                 ORDER BY received_at ASC, rowid ASC"
            ))
            .map_err(sql_err)?;
        let rows = stmt
            .query_map(params![timestamp], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, Vec<u8>>(2)?,
                    row.get::<_, Vec<u8>>(3)?,
                ))
            })
            .map_err(sql_err)?;

        let mut out = Vec::new();
        for row in rows {
            let (peer_id, received_at, payload, signature) = row.map_err(sql_err)?;
            out.push(Record {
                schema_name: schema.to_string(),
                payload,
                signature,
                producer: PeerId::new(peer_id),
                received_at,
            });
        }
        Ok(out)
    }

    /// Remove a record. Returns whether anything was deleted.
    pub fn delete(&self, cid: &Cid) -> Result<bool, SdnError> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let schema: Option<String> = conn
            .query_row(
                "SELECT schema FROM cid_index WHERE cid = ?1",
                params![cid.to_hex()],
                |row| row.get(0),
            )
            .optional()
            .map_err(sql_err)?;
        let Some(schema) = schema else { return Ok(false) };
        let table = table_name(&schema)?;
        conn.execute(&format!("DELETE FROM {table} WHERE cid = ?1"), params![cid.to_hex()])
            .map_err(sql_err)?;
        conn.execute("DELETE FROM cid_index WHERE cid = ?1", params![cid.to_hex()])
            .map_err(sql_err)?;
        Ok(true)
    }

    /// Evict records older than `max_age_secs`, keeping at least
    /// `min_keep_per_schema` most-recent rows in every partition. Returns the
    /// number of evicted records.
    pub fn gc(&self, max_age_secs: u64, min_keep_per_schema: usize) -> Result<u64, SdnError> {
        let cutoff = chrono::Utc::now().timestamp() - max_age_secs as i64;
        let conn = self.conn.lock().expect("store mutex poisoned");

        let schemas: Vec<String> = {
            let mut stmt = conn
                .prepare("SELECT DISTINCT schema FROM cid_index")
                .map_err(sql_err)?;
            let rows = stmt.query_map([], |row| row.get(0)).map_err(sql_err)?;
            rows.collect::<Result<_, _>>().map_err(sql_err)?
        };

        let mut evicted = 0u64;
        for schema in schemas {
            let table = table_name(&schema)?;
            let removed = conn
                .execute(
                    &format!(
                        "DELETE FROM {table}
                         WHERE received_at < ?1
                           AND cid NOT IN (
                               SELECT cid FROM {table}
                               ORDER BY received_at DESC, rowid DESC
                               LIMIT ?2
                           )"
                    ),
                    params![cutoff, min_keep_per_schema as i64],
                )
                .map_err(sql_err)?;
            evicted += removed as u64;
            conn.execute(
                &format!(
                    "DELETE FROM cid_index
                     WHERE schema = ?1 AND cid NOT IN (SELECT cid FROM {table})"
                ),
                params![schema],
            )
            .map_err(sql_err)?;
        }
        if evicted > 0 {
            debug!(evicted, "store gc pass complete");
        }
        Ok(evicted)
    }

    /// Test hook: run raw SQL against the backing connection.
    #[cfg(test)]
    pub(crate) fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> T) -> T {
        let conn = self.conn.lock().expect("store mutex poisoned");
        f(&conn)
    }

    /// Per-schema row counts and payload sizes.
    pub fn stats(&self) -> Result<Vec<SchemaStats>, SdnError> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let schemas: Vec<String> = {
            let mut stmt = conn
                .prepare("SELECT DISTINCT schema FROM cid_index ORDER BY schema")
                .map_err(sql_err)?;
            let rows = stmt.query_map([], |row| row.get(0)).map_err(sql_err)?;
            rows.collect::<Result<_, _>>().map_err(sql_err)?
        };

        let mut out = Vec::new();
        for schema in schemas {
            let table = table_name(&schema)?;
            let (rows, bytes): (i64, i64) = conn
                .query_row(
                    &format!(
                        "SELECT COUNT(*), COALESCE(SUM(LENGTH(payload)), 0) FROM {table}"
                    ),
                    [],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .map_err(sql_err)?;
            out.push(SchemaStats {
                schema,
                rows: rows as u64,
                payload_bytes: bytes as u64,
            });
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::params;
    use sdn_core::{FilterOp, Predicate};
    use sdn_crypto::NodeSigner;
    use sdn_schema::{JsonFields, SchemaRegistry, ValidationMode};
    use serde_json::json;

    fn store() -> (Store, NodeSigner) {
        let registry = Arc::new(SchemaRegistry::new("spacedata", ValidationMode::Strict));
        let store = Store::open_in_memory(registry, Arc::new(JsonFields)).unwrap();
        (store, NodeSigner::generate())
    }

    fn omm_payload(object_id: &str, inclination: f64) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "OBJECT_ID": object_id,
            "EPOCH": "2024-01-15T12:00:00Z",
            "INCLINATION": inclination,
        }))
        .unwrap()
    }

    fn put_omm(store: &Store, signer: &NodeSigner, payload: &[u8]) -> PutOutcome {
        let sig = signer.sign(payload);
        store.put("OMM", payload, &signer.peer_id(), &sig).unwrap()
    }

    #[test]
    fn put_get_round_trip() {
        let (store, signer) = store();
        let payload = omm_payload("1998-067A", 51.6);
        let outcome = put_omm(&store, &signer, &payload);
        assert!(outcome.inserted);
        assert_eq!(outcome.cid, Cid::of(&payload));

        let record = store.get(&outcome.cid).unwrap();
        assert_eq!(record.payload, payload);
        assert_eq!(record.schema_name, "OMM");
        assert_eq!(record.producer, signer.peer_id());
        sdn_crypto::verify_from_peer(&record.producer, &record.payload, &record.signature)
            .unwrap();
    }

    #[test]
    fn put_is_idempotent_on_cid_collision() {
        let (store, signer) = store();
        let payload = omm_payload("1998-067A", 51.6);
        let first = put_omm(&store, &signer, &payload);
        let second = put_omm(&store, &signer, &payload);
        assert_eq!(first.cid, second.cid);
        assert!(first.inserted);
        assert!(!second.inserted, "second writer observes idempotent success");

        let stats = store.stats().unwrap();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].rows, 1);
    }

    #[test]
    fn put_rejects_unknown_schema_and_bad_signature() {
        let (store, signer) = store();
        let payload = omm_payload("1998-067A", 51.6);
        let sig = signer.sign(&payload);

        assert!(matches!(
            store.put("NOPE", &payload, &signer.peer_id(), &sig),
            Err(SdnError::UnknownSchema(_))
        ));
        assert!(matches!(
            store.put("OMM", &payload, &signer.peer_id(), &[0u8; 64]),
            Err(SdnError::InvalidSignature)
        ));
        assert!(matches!(
            store.put("OMM", br#"{"OBJECT_ID":"x"}"#, &signer.peer_id(), &sig),
            Err(SdnError::SchemaValidationFailed(_))
        ));
    }

    #[test]
    fn get_missing_is_not_found() {
        let (store, _) = store();
        assert!(matches!(store.get(&Cid::of(b"nothing")), Err(SdnError::NotFound)));
    }

    #[test]
    fn query_filters_in_insertion_order() {
        let (store, signer) = store();
        for (id, inc) in [("A", 51.6), ("B", 28.5), ("C", 97.6)] {
            put_omm(&store, &signer, &omm_payload(id, inc));
        }
        let preds = vec![Predicate::new("INCLINATION", FilterOp::Gte, json!(50))];
        let hits = store.query("OMM", &preds, None, QueryOrder::Insertion).unwrap();
        assert_eq!(hits.len(), 2);
        let incs: Vec<f64> = hits
            .iter()
            .map(|r| {
                serde_json::from_slice::<serde_json::Value>(&r.payload).unwrap()["INCLINATION"]
                    .as_f64()
                    .unwrap()
            })
            .collect();
        assert_eq!(incs, vec![51.6, 97.6], "matches arrive in store insertion order");
    }

    #[test]
    fn query_unknown_field_matches_nothing() {
        let (store, signer) = store();
        put_omm(&store, &signer, &omm_payload("A", 51.6));
        let preds = vec![Predicate::new("NO_SUCH_FIELD", FilterOp::Eq, json!(1))];
        assert!(store.query("OMM", &preds, None, QueryOrder::Insertion).unwrap().is_empty());
    }

    #[test]
    fn query_respects_limit() {
        let (store, signer) = store();
        for i in 0..5 {
            put_omm(&store, &signer, &omm_payload(&format!("SAT-{i}"), 51.0 + i as f64));
        }
        let hits = store.query("OMM", &[], Some(3), QueryOrder::Insertion).unwrap();
        assert_eq!(hits.len(), 3);
    }

    #[test]
    fn since_returns_ascending_receipt_order() {
        let (store, signer) = store();
        let a = put_omm(&store, &signer, &omm_payload("A", 1.0));
        let b = put_omm(&store, &signer, &omm_payload("B", 2.0));
        store.with_conn(|conn| {
            conn.execute(
                "UPDATE records_OMM SET received_at = 100 WHERE cid = ?1",
                params![a.cid.to_hex()],
            )
            .unwrap();
            conn.execute(
                "UPDATE records_OMM SET received_at = 200 WHERE cid = ?1",
                params![b.cid.to_hex()],
            )
            .unwrap();
        });
        let all = store.since("OMM", 0).unwrap();
        assert_eq!(all.len(), 2);
        assert!(all[0].received_at <= all[1].received_at);
        let later = store.since("OMM", 150).unwrap();
        assert_eq!(later.len(), 1);
        assert_eq!(later[0].cid(), b.cid);
    }

    #[test]
    fn delete_removes_row_and_index() {
        let (store, signer) = store();
        let outcome = put_omm(&store, &signer, &omm_payload("A", 51.6));
        assert!(store.delete(&outcome.cid).unwrap());
        assert!(!store.delete(&outcome.cid).unwrap());
        assert!(matches!(store.get(&outcome.cid), Err(SdnError::NotFound)));
    }

    #[test]
    fn corrupt_row_is_healed_on_read() {
        let (store, signer) = store();
        let outcome = put_omm(&store, &signer, &omm_payload("A", 51.6));
        store.with_conn(|conn| {
            conn.execute(
                "UPDATE records_OMM SET payload = ?1 WHERE cid = ?2",
                params![b"garbage".to_vec(), outcome.cid.to_hex()],
            )
            .unwrap();
        });
        assert!(matches!(store.get(&outcome.cid), Err(SdnError::NotFound)));
        // Row is gone entirely now.
        assert!(!store.contains(&outcome.cid).unwrap());
    }

    #[test]
    fn gc_keeps_most_recent_per_schema() {
        let (store, signer) = store();
        let mut cids = Vec::new();
        for i in 0..4 {
            cids.push(put_omm(&store, &signer, &omm_payload(&format!("S{i}"), i as f64)).cid);
        }
        // Backdate everything far into the past, most recent last.
        store.with_conn(|conn| {
            for (i, cid) in cids.iter().enumerate() {
                conn.execute(
                    "UPDATE records_OMM SET received_at = ?1 WHERE cid = ?2",
                    params![100 + i as i64, cid.to_hex()],
                )
                .unwrap();
            }
        });
        let evicted = store.gc(3600, 2).unwrap();
        assert_eq!(evicted, 2);
        assert!(!store.contains(&cids[0]).unwrap());
        assert!(!store.contains(&cids[1]).unwrap());
        assert!(store.contains(&cids[2]).unwrap());
        assert!(store.contains(&cids[3]).unwrap());
    }
}
