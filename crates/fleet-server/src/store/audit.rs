use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use super::{now_ms, Store, StoreError};

/// Audit details are capped so a runaway command output cannot bloat the log.
pub const MAX_AUDIT_DETAILS: usize = 2000;

#[derive(Debug, Clone)]
pub struct NewAuditEntry {
    pub username: String,
    pub action: String,
    pub host_id: String,
    pub details: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditEntry {
    pub id: i64,
    pub username: String,
    pub action: String,
    pub host_id: String,
    pub details: String,
    pub status: String,
    pub created_at_ms: i64,
    pub updated_at_ms: Option<i64>,
}

pub(super) fn insert_audit(
    conn: &Connection,
    entry: &NewAuditEntry,
    created_at_ms: i64,
) -> Result<i64, StoreError> {
    conn.execute(
        "INSERT INTO audit_logs (username, action, host_id, details, status, created_at_ms) \
         VALUES (?1, ?2, ?3, ?4, 'pending', ?5)",
        params![
            entry.username,
            entry.action,
            entry.host_id,
            entry.details,
            created_at_ms
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

impl Store {
    /// Moves an audit entry to its final status. Empty `details` keeps the
    /// existing text.
    pub async fn finish_audit(
        &self,
        audit_id: i64,
        status: &str,
        details: &str,
    ) -> Result<(), StoreError> {
        let status = status.to_string();
        let details = truncate_details(details);
        self.call(move |conn| {
            conn.execute(
                "UPDATE audit_logs SET status = ?2, \
                 details = COALESCE(NULLIF(?3, ''), details), updated_at_ms = ?4 WHERE id = ?1",
                params![audit_id, status, details, now_ms()],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn audit_entry(&self, audit_id: i64) -> Result<Option<AuditEntry>, StoreError> {
        self.call(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT id, username, action, host_id, details, status, created_at_ms, \
                     updated_at_ms FROM audit_logs WHERE id = ?1",
                    params![audit_id],
                    |row| {
                        Ok(AuditEntry {
                            id: row.get(0)?,
                            username: row.get(1)?,
                            action: row.get(2)?,
                            host_id: row.get(3)?,
                            details: row.get(4)?,
                            status: row.get(5)?,
                            created_at_ms: row.get(6)?,
                            updated_at_ms: row.get(7)?,
                        })
                    },
                )
                .optional()?)
        })
        .await
    }
}

fn truncate_details(details: &str) -> String {
    match details.char_indices().nth(MAX_AUDIT_DETAILS) {
        Some((cut, _)) => details[..cut].to_string(),
        None => details.to_string(),
    }
}
