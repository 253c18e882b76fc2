//! Database repository layer
//!
//! Provides query and upsert operations for messages and classification rows.

use super::{CandidateFilter, SessionStore};
use crate::error::{Error, Result};
use crate::types::*;
use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Mutex;

/// Max bound parameters per `IN (...)` query
const ID_CHUNK: usize = 500;

/// Database handle with connection pooling (single connection for now)
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open or create a database at the given path
    pub fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;

        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA busy_timeout = 5000;
            ",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run migrations on this database
    pub fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        super::schema::run_migrations(&conn)
    }

    /// Get the underlying connection (for advanced use)
    pub fn connection(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap()
    }

    // ============================================
    // Message operations
    // ============================================

    /// Insert multiple messages in a transaction.
    ///
    /// The upstream chat system owns this table; this exists for local
    /// seeding and tests.
    pub fn insert_messages(&self, messages: &[Message]) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        for message in messages {
            tx.execute(
                r#"
                INSERT INTO messages (id, session_id, role, content, timestamp)
                VALUES (?1, ?2, ?3, ?4, ?5)
                "#,
                params![
                    message.id,
                    message.session_id,
                    message.role.as_str(),
                    message.content,
                    format_ts(&message.timestamp),
                ],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    // ============================================
    // Classification reads
    // ============================================

    /// Get a stored message classification by message ID
    pub fn get_message_classification(
        &self,
        message_id: i64,
    ) -> Result<Option<MessageClassification>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT * FROM message_classification WHERE message_id = ?",
            [message_id],
            Self::row_to_message_classification,
        )
        .optional()
        .map_err(Error::from)
    }

    /// Count stored message classifications
    pub fn count_message_classifications(&self) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM message_classification", [], |row| {
                row.get(0)
            })?;
        Ok(count)
    }

    // ============================================
    // Row mapping
    // ============================================

    fn row_to_message(row: &Row) -> rusqlite::Result<Message> {
        let role_str: String = row.get("role")?;
        let ts_str: String = row.get("timestamp")?;

        Ok(Message {
            id: row.get("id")?,
            session_id: row.get("session_id")?,
            role: role_str
                .parse()
                .map_err(|e: String| conversion_error(row, "role", e))?,
            content: row.get("content")?,
            timestamp: parse_ts(&ts_str).map_err(|e| conversion_error(row, "timestamp", e))?,
        })
    }

    fn row_to_session_classification(row: &Row) -> rusqlite::Result<SessionClassification> {
        let scores_str: String = row.get("all_categories")?;
        let upto_str: String = row.get("processed_upto")?;
        let run_at_str: String = row.get("run_at")?;

        Ok(SessionClassification {
            session_id: row.get("session_id")?,
            primary_category: row.get("primary_category")?,
            all_categories: serde_json::from_str(&scores_str)
                .map_err(|e| conversion_error(row, "all_categories", e.to_string()))?,
            processed_upto: parse_ts(&upto_str)
                .map_err(|e| conversion_error(row, "processed_upto", e))?,
            run_at: parse_ts(&run_at_str).map_err(|e| conversion_error(row, "run_at", e))?,
            model: row.get("model")?,
            instructions_version: row.get("instructions_version")?,
            notes: row.get("notes")?,
        })
    }

    fn row_to_message_classification(row: &Row) -> rusqlite::Result<MessageClassification> {
        let role_str: String = row.get("role")?;
        let scores_str: String = row.get("all_categories")?;
        let run_at_str: String = row.get("run_at")?;

        Ok(MessageClassification {
            message_id: row.get("message_id")?,
            session_id: row.get("session_id")?,
            role: role_str
                .parse()
                .map_err(|e: String| conversion_error(row, "role", e))?,
            primary_category: row.get("primary_category")?,
            all_categories: serde_json::from_str(&scores_str)
                .map_err(|e| conversion_error(row, "all_categories", e.to_string()))?,
            run_at: parse_ts(&run_at_str).map_err(|e| conversion_error(row, "run_at", e))?,
            model: row.get("model")?,
            instructions_version: row.get("instructions_version")?,
        })
    }

    fn row_to_session_ref(row: &Row) -> rusqlite::Result<SessionRef> {
        let max_ts: String = row.get("max_ts")?;
        let processed_upto: Option<String> = row.get("processed_upto")?;

        Ok(SessionRef {
            session_id: row.get("session_id")?,
            current_upto: parse_ts(&max_ts).map_err(|e| conversion_error(row, "max_ts", e))?,
            message_count: row.get("message_count")?,
            processed_upto: processed_upto
                .map(|s| parse_ts(&s))
                .transpose()
                .map_err(|e| conversion_error(row, "processed_upto", e))?,
            role_messages: row.get("role_messages")?,
            unclassified_messages: row.get("unclassified_messages")?,
        })
    }
}

impl SessionStore for Database {
    fn list_candidate_sessions(&self, filter: &CandidateFilter) -> Result<Vec<SessionRef>> {
        let conn = self.conn.lock().unwrap();

        let mut params: Vec<String> = vec![];
        let role_cond = match filter.message_roles.names() {
            Some(names) => {
                params.extend(names.iter().map(|n| n.to_string()));
                format!("LOWER(TRIM(m.role)) IN ({})", placeholders(names.len()))
            }
            None => "1 = 1".to_string(),
        };

        let mut sql = format!(
            r#"
            SELECT
                m.session_id AS session_id,
                (SELECT l.timestamp FROM messages l
                 WHERE l.session_id = m.session_id
                 ORDER BY julianday(l.timestamp) DESC, l.id DESC
                 LIMIT 1) AS max_ts,
                COUNT(*) AS message_count,
                sc.processed_upto AS processed_upto,
                SUM(CASE WHEN {role_cond} THEN 1 ELSE 0 END) AS role_messages,
                SUM(CASE WHEN {role_cond} AND mc.message_id IS NULL THEN 1 ELSE 0 END)
                    AS unclassified_messages
            FROM messages m
            LEFT JOIN message_classification mc ON mc.message_id = m.id
            LEFT JOIN session_classification sc ON sc.session_id = m.session_id
            GROUP BY m.session_id
            "#
        );
        // The role condition appears twice
        let role_params = params.clone();
        params.extend(role_params);

        if let Some(since) = &filter.since {
            sql.push_str(" HAVING MAX(julianday(m.timestamp)) >= julianday(?)");
            params.push(format_ts(since));
        }

        sql.push_str(" ORDER BY m.session_id ASC");

        let mut stmt = conn.prepare(&sql)?;
        let sessions = stmt
            .query_map(params_from_iter(params.iter()), Self::row_to_session_ref)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(sessions)
    }

    fn get_messages(
        &self,
        session_id: &str,
        roles: &RoleFilter,
        upto: Option<DateTime<Utc>>,
    ) -> Result<Vec<Message>> {
        let conn = self.conn.lock().unwrap();

        let mut sql = String::from(
            "SELECT id, session_id, role, content, timestamp FROM messages WHERE session_id = ?",
        );
        let mut params: Vec<String> = vec![session_id.to_string()];

        if let Some(names) = roles.names() {
            sql.push_str(&format!(
                " AND LOWER(TRIM(role)) IN ({})",
                placeholders(names.len())
            ));
            params.extend(names.iter().map(|n| n.to_string()));
        }

        if let Some(upto) = upto {
            sql.push_str(" AND julianday(timestamp) <= julianday(?)");
            params.push(format_ts(&upto));
        }

        sql.push_str(" ORDER BY julianday(timestamp) ASC, id ASC");

        let mut stmt = conn.prepare(&sql)?;
        let messages = stmt
            .query_map(params_from_iter(params.iter()), Self::row_to_message)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(messages)
    }

    fn get_existing_session_classification(
        &self,
        session_id: &str,
    ) -> Result<Option<SessionClassification>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT * FROM session_classification WHERE session_id = ?",
            [session_id],
            Self::row_to_session_classification,
        )
        .optional()
        .map_err(Error::from)
    }

    fn get_existing_message_classification_ids(
        &self,
        message_ids: &[i64],
    ) -> Result<HashSet<i64>> {
        let conn = self.conn.lock().unwrap();
        let mut existing = HashSet::new();

        for chunk in message_ids.chunks(ID_CHUNK) {
            let sql = format!(
                "SELECT message_id FROM message_classification WHERE message_id IN ({})",
                placeholders(chunk.len())
            );
            let mut stmt = conn.prepare(&sql)?;
            let ids = stmt
                .query_map(params_from_iter(chunk.iter()), |row| row.get::<_, i64>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            existing.extend(ids);
        }

        Ok(existing)
    }

    fn upsert_session_classification(&self, row: &SessionClassification) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO session_classification (session_id, primary_category, all_categories,
                                                processed_upto, run_at, model,
                                                instructions_version, notes)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(session_id) DO UPDATE SET
                primary_category = excluded.primary_category,
                all_categories = excluded.all_categories,
                processed_upto = MAX(session_classification.processed_upto, excluded.processed_upto),
                run_at = excluded.run_at,
                model = excluded.model,
                instructions_version = excluded.instructions_version,
                notes = excluded.notes
            "#,
            params![
                row.session_id,
                row.primary_category,
                serde_json::to_string(&row.all_categories)?,
                format_ts(&row.processed_upto),
                format_ts(&row.run_at),
                row.model,
                row.instructions_version,
                row.notes,
            ],
        )?;
        Ok(())
    }

    fn upsert_message_classifications(&self, rows: &[MessageClassification]) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        for row in rows {
            tx.execute(
                r#"
                INSERT INTO message_classification (message_id, session_id, role, primary_category,
                                                    all_categories, run_at, model,
                                                    instructions_version)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                ON CONFLICT(message_id) DO UPDATE SET
                    primary_category = excluded.primary_category,
                    all_categories = excluded.all_categories,
                    run_at = excluded.run_at,
                    model = excluded.model,
                    instructions_version = excluded.instructions_version
                "#,
                params![
                    row.message_id,
                    row.session_id,
                    row.role.as_str(),
                    row.primary_category,
                    serde_json::to_string(&row.all_categories)?,
                    format_ts(&row.run_at),
                    row.model,
                    row.instructions_version,
                ],
            )?;
        }

        tx.commit()?;
        Ok(())
    }
}

/// Fixed-width RFC 3339 UTC.
///
/// Upstream rows may use other layouts, so SQL compares message times
/// through `julianday()` rather than as text.
pub fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse RFC 3339, or a naive `YYYY-MM-DD HH:MM:SS[.f]` taken as UTC.
pub fn parse_ts(raw: &str) -> std::result::Result<DateTime<Utc>, String> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|e| format!("invalid timestamp '{}': {}", raw, e))
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

fn conversion_error(row: &Row, column: &str, message: String) -> rusqlite::Error {
    let idx = row.as_ref().column_index(column).unwrap_or(0);
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        Type::Text,
        Box::new(Error::Parse {
            entity: column.to_string(),
            message,
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_735_689_600 + secs, 0).unwrap()
    }

    fn msg(id: i64, session_id: &str, role: Role, secs: i64) -> Message {
        Message {
            id,
            session_id: session_id.to_string(),
            role,
            content: Some(format!("message {}", id)),
            timestamp: ts(secs),
        }
    }

    fn test_db() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.migrate().unwrap();
        db
    }

    fn session_row(session_id: &str, upto: i64) -> SessionClassification {
        SessionClassification {
            session_id: session_id.to_string(),
            primary_category: "billing".to_string(),
            all_categories: [("billing".to_string(), 0.9), ("other".to_string(), 0.1)]
                .into_iter()
                .collect(),
            processed_upto: ts(upto),
            run_at: Utc::now(),
            model: "test-model".to_string(),
            instructions_version: Some("v1".to_string()),
            notes: None,
        }
    }

    fn message_row(message_id: i64, session_id: &str, category: &str) -> MessageClassification {
        MessageClassification {
            message_id,
            session_id: session_id.to_string(),
            role: Role::User,
            primary_category: category.to_string(),
            all_categories: [(category.to_string(), 1.0)].into_iter().collect(),
            run_at: Utc::now(),
            model: "test-model".to_string(),
            instructions_version: Some("v1".to_string()),
        }
    }

    #[test]
    fn test_message_insert_and_query() {
        let db = test_db();
        db.insert_messages(&[
            msg(2, "s1", Role::Assistant, 20),
            msg(1, "s1", Role::User, 10),
            msg(3, "s2", Role::User, 5),
        ])
        .unwrap();

        let all = db.get_messages("s1", &RoleFilter::All, None).unwrap();
        assert_eq!(all.iter().map(|m| m.id).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(all[0].timestamp, ts(10));

        let users = db
            .get_messages("s1", &RoleFilter::Only(vec![Role::User]), None)
            .unwrap();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].role, Role::User);

        let capped = db.get_messages("s1", &RoleFilter::All, Some(ts(15))).unwrap();
        assert_eq!(capped.len(), 1);
    }

    #[test]
    fn test_list_candidate_sessions() {
        let db = test_db();
        db.insert_messages(&[
            msg(1, "b", Role::User, 10),
            msg(2, "b", Role::Assistant, 30),
            msg(3, "a", Role::User, 5),
        ])
        .unwrap();
        db.upsert_message_classifications(&[message_row(1, "b", "billing")])
            .unwrap();
        db.upsert_session_classification(&session_row("b", 30))
            .unwrap();

        let filter = CandidateFilter {
            since: None,
            message_roles: RoleFilter::Only(vec![Role::User]),
        };
        let sessions = db.list_candidate_sessions(&filter).unwrap();
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].session_id, "a");
        assert_eq!(sessions[0].processed_upto, None);
        assert_eq!(sessions[0].unclassified_messages, 1);

        let b = &sessions[1];
        assert_eq!(b.current_upto, ts(30));
        assert_eq!(b.message_count, 2);
        assert_eq!(b.role_messages, 1);
        assert_eq!(b.unclassified_messages, 0);
        assert_eq!(b.processed_upto, Some(ts(30)));

        let since = CandidateFilter {
            since: Some(ts(10)),
            message_roles: RoleFilter::All,
        };
        let sessions = db.list_candidate_sessions(&since).unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].session_id, "b");
        assert_eq!(sessions[0].unclassified_messages, 1);
    }

    #[test]
    fn test_session_classification_upsert_keeps_highest_watermark() {
        let db = test_db();
        db.upsert_session_classification(&session_row("s1", 50))
            .unwrap();

        let mut older = session_row("s1", 20);
        older.primary_category = "other".to_string();
        db.upsert_session_classification(&older).unwrap();

        let stored = db
            .get_existing_session_classification("s1")
            .unwrap()
            .unwrap();
        assert_eq!(stored.processed_upto, ts(50));
        assert_eq!(stored.primary_category, "other");
        assert_eq!(stored.all_categories.get("billing"), Some(&0.9));
    }

    #[test]
    fn test_message_classification_upsert_replaces() {
        let db = test_db();
        db.upsert_message_classifications(&[message_row(7, "s1", "billing")])
            .unwrap();
        db.upsert_message_classifications(&[message_row(7, "s1", "account")])
            .unwrap();

        assert_eq!(db.count_message_classifications().unwrap(), 1);
        let stored = db.get_message_classification(7).unwrap().unwrap();
        assert_eq!(stored.primary_category, "account");
        assert_eq!(stored.role, Role::User);
    }

    #[test]
    fn test_existing_message_ids_across_chunks() {
        let db = test_db();
        let rows: Vec<_> = (0..(ID_CHUNK as i64 + 10))
            .filter(|id| id % 2 == 0)
            .map(|id| message_row(id, "s1", "other"))
            .collect();
        db.upsert_message_classifications(&rows).unwrap();

        let probe: Vec<i64> = (0..(ID_CHUNK as i64 + 10)).collect();
        let existing = db.get_existing_message_classification_ids(&probe).unwrap();
        assert_eq!(existing.len(), rows.len());
        assert!(existing.contains(&(ID_CHUNK as i64)));
        assert!(!existing.contains(&1));
    }

    /// Rows written by the upstream system in layouts other than `format_ts`
    fn seed_upstream_rows(db: &Database) {
        let conn = db.connection();
        for (id, session, role, ts) in [
            (1, "s1", "user", "2025-01-01T00:00:00Z"),
            (2, "s1", " User", "2025-01-01T00:00:10Z"),
            (3, "s2", "user", "2025-01-01T01:00:05+01:00"),
            (4, "s2", "assistant", "2025-01-01 00:00:20"),
        ] {
            conn.execute(
                "INSERT INTO messages (id, session_id, role, content, timestamp) VALUES (?1, ?2, ?3, 'text', ?4)",
                params![id, session, role, ts],
            )
            .unwrap();
        }
    }

    #[test]
    fn test_upstream_timestamp_layouts_compare_by_time() {
        let db = test_db();
        seed_upstream_rows(&db);

        let filter = CandidateFilter {
            since: None,
            message_roles: RoleFilter::Only(vec![Role::User]),
        };
        let sessions = db.list_candidate_sessions(&filter).unwrap();
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].current_upto, ts(10));
        assert_eq!(sessions[0].role_messages, 2);
        assert_eq!(sessions[1].current_upto, ts(20));

        // The newest message must be inside its own session's watermark
        let s1 = db
            .get_messages("s1", &RoleFilter::All, Some(sessions[0].current_upto))
            .unwrap();
        assert_eq!(s1.iter().map(|m| m.id).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(s1[1].role, Role::User);

        let s2 = db
            .get_messages("s2", &RoleFilter::All, Some(sessions[1].current_upto))
            .unwrap();
        assert_eq!(s2.iter().map(|m| m.id).collect::<Vec<_>>(), vec![3, 4]);
        assert_eq!(s2[0].timestamp, ts(5));

        let capped = db.get_messages("s2", &RoleFilter::All, Some(ts(5))).unwrap();
        assert_eq!(capped.len(), 1);

        let since = CandidateFilter {
            since: Some(ts(15)),
            message_roles: RoleFilter::All,
        };
        let sessions = db.list_candidate_sessions(&since).unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].session_id, "s2");
    }

    #[test]
    fn test_role_filter_ignores_surrounding_whitespace() {
        let db = test_db();
        seed_upstream_rows(&db);

        let users = db
            .get_messages("s1", &RoleFilter::Only(vec![Role::User]), None)
            .unwrap();
        assert_eq!(users.len(), 2);
    }

    #[test]
    fn test_parse_ts_formats() {
        assert_eq!(parse_ts("2025-01-01T00:00:00Z").unwrap(), ts(0));
        assert_eq!(parse_ts("2025-01-01T01:00:00+01:00").unwrap(), ts(0));
        assert_eq!(parse_ts("2025-01-01 00:00:10").unwrap(), ts(10));
        assert!(parse_ts("yesterday").is_err());
        assert_eq!(format_ts(&ts(0)), "2025-01-01T00:00:00.000000Z");
    }
}
