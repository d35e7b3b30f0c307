#![forbid(unsafe_code)]

use std::path::Path;
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use courtintel_domain::{
    format_rfc3339, now_utc, parse_rfc3339, AuditLogEntry, AuditLogId, BiasCheckFields,
    BiasCheckId, BiasCheckRecord, CaseId, CaseRecord, NewCase, RulingFields, RulingId,
    RulingRecord, UserId, UserRecord,
};
use courtintel_store_core::{AuditLogSink, CaseStore, RulingStore, UserDirectory};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::debug;

const COURT_SCHEMA_VERSION: i64 = 1;

const SCHEMA_V1: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS users (
  user_id TEXT PRIMARY KEY,
  username TEXT NOT NULL UNIQUE,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS cases (
  case_id TEXT PRIMARY KEY,
  user_id TEXT NOT NULL,
  title TEXT NOT NULL,
  narrative TEXT NOT NULL,
  locale TEXT NOT NULL,
  created_at TEXT NOT NULL,
  FOREIGN KEY (user_id) REFERENCES users(user_id) ON DELETE CASCADE
);
CREATE INDEX IF NOT EXISTS idx_cases_user ON cases(user_id);

CREATE TABLE IF NOT EXISTS rulings (
  ruling_id TEXT PRIMARY KEY,
  case_id TEXT NOT NULL UNIQUE,
  verdict TEXT NOT NULL,
  rationale TEXT NOT NULL,
  citations_json TEXT NOT NULL,
  risk_flags_json TEXT NOT NULL,
  model_name TEXT NOT NULL,
  tokens_in INTEGER NOT NULL CHECK (tokens_in >= 0),
  tokens_out INTEGER NOT NULL CHECK (tokens_out >= 0),
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  FOREIGN KEY (case_id) REFERENCES cases(case_id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS bias_checks (
  bias_check_id TEXT PRIMARY KEY,
  ruling_id TEXT NOT NULL UNIQUE,
  bias_score REAL NOT NULL,
  notes_json TEXT NOT NULL,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  FOREIGN KEY (ruling_id) REFERENCES rulings(ruling_id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS audit_logs (
  log_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  log_id TEXT NOT NULL UNIQUE,
  user_id TEXT NOT NULL,
  action TEXT NOT NULL,
  metadata_json TEXT,
  created_at TEXT NOT NULL,
  FOREIGN KEY (user_id) REFERENCES users(user_id)
);
CREATE INDEX IF NOT EXISTS idx_audit_logs_user ON audit_logs(user_id, log_seq);

CREATE TRIGGER IF NOT EXISTS trg_audit_logs_no_update
BEFORE UPDATE ON audit_logs
BEGIN
  SELECT RAISE(FAIL, 'audit_logs is append-only');
END;
CREATE TRIGGER IF NOT EXISTS trg_audit_logs_no_delete
BEFORE DELETE ON audit_logs
BEGIN
  SELECT RAISE(FAIL, 'audit_logs is append-only');
END;
";

const RULING_COLUMNS: &str = "ruling_id, case_id, verdict, rationale, citations_json, \
risk_flags_json, model_name, tokens_in, tokens_out, created_at, updated_at";

const BIAS_CHECK_COLUMNS: &str =
    "bias_check_id, ruling_id, bias_score, notes_json, created_at, updated_at";

/// Every store trait over one `SQLite` connection.
///
/// A connection is not shareable across threads; open one store per request.
pub struct SqliteCourtStore {
    conn: Connection,
}

impl SqliteCourtStore {
    /// Open or create a `SQLite` database and configure local pragmas.
    ///
    /// # Errors
    /// Returns an error if opening the database or applying pragmas fails.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Create tables and triggers. Safe to run on every start.
    ///
    /// # Errors
    /// Returns an error if the schema cannot be applied.
    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(SCHEMA_V1)
            .context("failed to apply court schema")?;

        let now = format_rfc3339(now_utc())?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![COURT_SCHEMA_VERSION, now],
            )
            .context("failed to record court migration")?;
        Ok(())
    }

    /// Open `path` and apply migrations.
    ///
    /// # Errors
    /// Returns an error if opening or migrating fails.
    pub fn open_and_migrate(path: &Path) -> Result<Self> {
        let store = Self::open(path)?;
        store.migrate()?;
        Ok(store)
    }
}

impl UserDirectory for SqliteCourtStore {
    fn register_user(&self, username: &str) -> Result<UserRecord> {
        let record = UserRecord {
            user_id: UserId::new(),
            username: username.to_string(),
            created_at: now_utc(),
        };
        self.conn
            .execute(
                "INSERT INTO users(user_id, username, created_at) VALUES (?1, ?2, ?3)",
                params![
                    record.user_id.to_string(),
                    record.username,
                    format_rfc3339(record.created_at)?,
                ],
            )
            .with_context(|| format!("failed to register user {username}"))?;
        debug!(user_id = %record.user_id, "user registered");
        Ok(record)
    }

    fn find_user(&self, username: &str) -> Result<Option<UserRecord>> {
        self.conn
            .query_row(
                "SELECT user_id, username, created_at FROM users WHERE username = ?1",
                params![username],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()
            .context("failed to look up user by name")?
            .map(user_from_parts)
            .transpose()
    }
}

impl CaseStore for SqliteCourtStore {
    fn insert_case(&self, owner: UserId, case: &NewCase) -> Result<CaseRecord> {
        let record = CaseRecord {
            case_id: CaseId::new(),
            user_id: owner,
            title: case.title.clone(),
            narrative: case.narrative.clone(),
            locale: case.locale.clone(),
            created_at: now_utc(),
        };
        self.conn
            .execute(
                "INSERT INTO cases(case_id, user_id, title, narrative, locale, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    record.case_id.to_string(),
                    record.user_id.to_string(),
                    record.title,
                    record.narrative,
                    record.locale,
                    format_rfc3339(record.created_at)?,
                ],
            )
            .context("failed to insert case")?;
        Ok(record)
    }

    fn get_case(&self, case_id: CaseId) -> Result<Option<CaseRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT case_id, user_id, title, narrative, locale, created_at
             FROM cases WHERE case_id = ?1",
        )?;
        let mut rows = stmt.query(params![case_id.to_string()])?;
        match rows.next()? {
            Some(row) => Ok(Some(case_from_row(row)?)),
            None => Ok(None),
        }
    }

    fn list_cases_for_user(&self, owner: UserId) -> Result<Vec<CaseRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT case_id, user_id, title, narrative, locale, created_at
             FROM cases WHERE user_id = ?1
             ORDER BY rowid DESC",
        )?;
        let mut rows = stmt.query(params![owner.to_string()])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(case_from_row(row)?);
        }
        Ok(out)
    }

    fn delete_case(&self, case_id: CaseId) -> Result<bool> {
        let removed = self
            .conn
            .execute(
                "DELETE FROM cases WHERE case_id = ?1",
                params![case_id.to_string()],
            )
            .context("failed to delete case")?;
        Ok(removed > 0)
    }
}

impl RulingStore for SqliteCourtStore {
    fn get_ruling_for_case(&self, case_id: CaseId) -> Result<Option<RulingRecord>> {
        query_ruling_for_case(&self.conn, case_id)
    }

    fn upsert_ruling(&self, case_id: CaseId, fields: &RulingFields) -> Result<RulingRecord> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("failed to begin ruling transaction")?;
        let now = format_rfc3339(now_utc())?;
        tx.execute(
            "INSERT INTO rulings(
                ruling_id, case_id, verdict, rationale, citations_json, risk_flags_json,
                model_name, tokens_in, tokens_out, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)
            ON CONFLICT(case_id) DO UPDATE SET
                verdict = excluded.verdict,
                rationale = excluded.rationale,
                citations_json = excluded.citations_json,
                risk_flags_json = excluded.risk_flags_json,
                model_name = excluded.model_name,
                tokens_in = excluded.tokens_in,
                tokens_out = excluded.tokens_out,
                updated_at = excluded.updated_at",
            params![
                RulingId::new().to_string(),
                case_id.to_string(),
                fields.verdict,
                fields.rationale,
                serde_json::to_string(&fields.citations)?,
                serde_json::to_string(&fields.risk_flags)?,
                fields.model_name,
                i64::from(fields.tokens_in),
                i64::from(fields.tokens_out),
                now,
            ],
        )
        .with_context(|| format!("failed to upsert ruling for case {case_id}"))?;

        let record = query_ruling_for_case(&tx, case_id)?
            .ok_or_else(|| anyhow!("ruling for case {case_id} missing after upsert"))?;
        tx.commit().context("failed to commit ruling")?;
        Ok(record)
    }

    fn get_bias_check_for_ruling(&self, ruling_id: RulingId) -> Result<Option<BiasCheckRecord>> {
        query_bias_check_for_ruling(&self.conn, ruling_id)
    }

    fn upsert_bias_check(
        &self,
        ruling_id: RulingId,
        fields: &BiasCheckFields,
    ) -> Result<BiasCheckRecord> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("failed to begin bias check transaction")?;
        let now = format_rfc3339(now_utc())?;
        tx.execute(
            "INSERT INTO bias_checks(
                bias_check_id, ruling_id, bias_score, notes_json, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?5)
            ON CONFLICT(ruling_id) DO UPDATE SET
                bias_score = excluded.bias_score,
                notes_json = excluded.notes_json,
                updated_at = excluded.updated_at",
            params![
                BiasCheckId::new().to_string(),
                ruling_id.to_string(),
                fields.bias_score,
                serde_json::to_string(&fields.notes)?,
                now,
            ],
        )
        .with_context(|| format!("failed to upsert bias check for ruling {ruling_id}"))?;

        let record = query_bias_check_for_ruling(&tx, ruling_id)?
            .ok_or_else(|| anyhow!("bias check for ruling {ruling_id} missing after upsert"))?;
        tx.commit().context("failed to commit bias check")?;
        Ok(record)
    }
}

impl AuditLogSink for SqliteCourtStore {
    fn append(
        &self,
        user_id: UserId,
        action: &str,
        metadata: Option<&serde_json::Value>,
    ) -> Result<AuditLogEntry> {
        let log_id = AuditLogId::new();
        let created_at = now_utc();
        self.conn
            .execute(
                "INSERT INTO audit_logs(log_id, user_id, action, metadata_json, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    log_id.to_string(),
                    user_id.to_string(),
                    action,
                    metadata.map(serde_json::to_string).transpose()?,
                    format_rfc3339(created_at)?,
                ],
            )
            .with_context(|| format!("failed to append audit log entry {action}"))?;

        Ok(AuditLogEntry {
            log_seq: self.conn.last_insert_rowid(),
            log_id,
            user_id,
            action: action.to_string(),
            metadata: metadata.cloned(),
            created_at,
        })
    }

    fn list_for_user(&self, user_id: UserId, limit: usize) -> Result<Vec<AuditLogEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT log_seq, log_id, user_id, action, metadata_json, created_at
             FROM audit_logs
             WHERE user_id = ?1
             ORDER BY log_seq DESC
             LIMIT ?2",
        )?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut rows = stmt.query(params![user_id.to_string(), limit])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let metadata_raw: Option<String> = row.get(4)?;
            out.push(AuditLogEntry {
                log_seq: row.get(0)?,
                log_id: AuditLogId::from_str(&row.get::<_, String>(1)?)?,
                user_id: UserId::from_str(&row.get::<_, String>(2)?)?,
                action: row.get(3)?,
                metadata: metadata_raw
                    .map(|raw| serde_json::from_str(&raw))
                    .transpose()
                    .context("invalid metadata_json")?,
                created_at: parse_rfc3339(&row.get::<_, String>(5)?)?,
            });
        }
        Ok(out)
    }
}

fn query_ruling_for_case(conn: &Connection, case_id: CaseId) -> Result<Option<RulingRecord>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {RULING_COLUMNS} FROM rulings WHERE case_id = ?1"
    ))?;
    let mut rows = stmt.query(params![case_id.to_string()])?;
    match rows.next()? {
        Some(row) => Ok(Some(ruling_from_row(row)?)),
        None => Ok(None),
    }
}

fn query_bias_check_for_ruling(
    conn: &Connection,
    ruling_id: RulingId,
) -> Result<Option<BiasCheckRecord>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {BIAS_CHECK_COLUMNS} FROM bias_checks WHERE ruling_id = ?1"
    ))?;
    let mut rows = stmt.query(params![ruling_id.to_string()])?;
    match rows.next()? {
        Some(row) => Ok(Some(bias_check_from_row(row)?)),
        None => Ok(None),
    }
}

fn user_from_parts(
    (user_id, username, created_at): (String, String, String),
) -> Result<UserRecord> {
    Ok(UserRecord {
        user_id: UserId::from_str(&user_id)?,
        username,
        created_at: parse_rfc3339(&created_at)?,
    })
}

fn case_from_row(row: &Row<'_>) -> Result<CaseRecord> {
    Ok(CaseRecord {
        case_id: CaseId::from_str(&row.get::<_, String>(0)?)?,
        user_id: UserId::from_str(&row.get::<_, String>(1)?)?,
        title: row.get(2)?,
        narrative: row.get(3)?,
        locale: row.get(4)?,
        created_at: parse_rfc3339(&row.get::<_, String>(5)?)?,
    })
}

fn ruling_from_row(row: &Row<'_>) -> Result<RulingRecord> {
    let citations_raw: String = row.get(4)?;
    let risk_flags_raw: String = row.get(5)?;
    Ok(RulingRecord {
        ruling_id: RulingId::from_str(&row.get::<_, String>(0)?)?,
        case_id: CaseId::from_str(&row.get::<_, String>(1)?)?,
        verdict: row.get(2)?,
        rationale: row.get(3)?,
        citations: serde_json::from_str(&citations_raw).context("invalid citations_json")?,
        risk_flags: serde_json::from_str(&risk_flags_raw).context("invalid risk_flags_json")?,
        model_name: row.get(6)?,
        tokens_in: token_count(row.get(7)?)?,
        tokens_out: token_count(row.get(8)?)?,
        created_at: parse_rfc3339(&row.get::<_, String>(9)?)?,
        updated_at: parse_rfc3339(&row.get::<_, String>(10)?)?,
    })
}

fn bias_check_from_row(row: &Row<'_>) -> Result<BiasCheckRecord> {
    let notes_raw: String = row.get(3)?;
    Ok(BiasCheckRecord {
        bias_check_id: BiasCheckId::from_str(&row.get::<_, String>(0)?)?,
        ruling_id: RulingId::from_str(&row.get::<_, String>(1)?)?,
        bias_score: row.get(2)?,
        notes: serde_json::from_str(&notes_raw).context("invalid notes_json")?,
        created_at: parse_rfc3339(&row.get::<_, String>(4)?)?,
        updated_at: parse_rfc3339(&row.get::<_, String>(5)?)?,
    })
}

fn token_count(value: i64) -> Result<u32> {
    u32::try_from(value).map_err(|_| anyhow!("token count out of range: {value}"))
}
