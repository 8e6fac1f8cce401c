use protocol::{
    CommandId, CommandKind, CommandRecord, CommandSpec, CommandStatus, FinalStatus,
    PendingCommand,
};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::audit::{insert_audit, NewAuditEntry};
use super::{now_ms, Store, StoreError};

const RECORD_COLUMNS: &str = "id, host_id, kind, action, target, payload, status, output, \
     timed_out, issued_by, audit_log_id, created_at_ms, started_at_ms, ended_at_ms";

#[derive(Debug, Clone)]
pub struct NewCommand {
    pub host_id: String,
    pub spec: CommandSpec,
    pub issued_by: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResolveOutcome {
    /// This call performed the terminal write.
    Applied(CommandRecord),
    /// An earlier resolution won; the stored record is returned untouched.
    AlreadyResolved(CommandRecord),
    WrongHost,
    NotFound,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    AlreadyStarted,
    AlreadyResolved,
    WrongHost,
    NotFound,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StalledCommand {
    pub record: CommandRecord,
}

impl Store {
    /// Persists a pending command, and its audit entry when given, in one
    /// transaction.
    pub async fn enqueue(
        &self,
        command: NewCommand,
        audit: Option<NewAuditEntry>,
    ) -> Result<CommandId, StoreError> {
        self.call(move |conn| {
            let tx = conn.transaction()?;
            let created_at = now_ms();
            let audit_id = match audit {
                Some(entry) => Some(insert_audit(&tx, &entry, created_at)?),
                None => None,
            };
            let payload = serde_json::to_string(&command.spec.payload)
                .map_err(|err| StoreError::Serialization(err.to_string()))?;
            tx.execute(
                "INSERT INTO remote_commands \
                 (host_id, kind, action, target, payload, status, issued_by, audit_log_id, created_at_ms) \
                 VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6, ?7, ?8)",
                params![
                    command.host_id,
                    command.spec.kind.as_str(),
                    command.spec.action,
                    command.spec.target,
                    payload,
                    command.issued_by,
                    audit_id,
                    created_at,
                ],
            )?;
            let id = tx.last_insert_rowid();
            tx.commit()?;
            Ok(CommandId(id))
        })
        .await
    }

    /// Every unresolved command for the host, oldest first.
    pub async fn pending_for(&self, host_id: &str) -> Result<Vec<PendingCommand>, StoreError> {
        let host_id = host_id.to_string();
        self.call(move |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT id, kind, action, target, payload FROM remote_commands \
                 WHERE host_id = ?1 AND status = 'pending' ORDER BY created_at_ms ASC, id ASC",
            )?;
            let rows = stmt.query_map(params![host_id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })?;
            let mut commands = Vec::new();
            for row in rows {
                let (id, kind, action, target, payload) = row?;
                commands.push(PendingCommand {
                    id: CommandId(id),
                    spec: CommandSpec {
                        kind: parse_kind(&kind)?,
                        action,
                        target,
                        payload: parse_payload(&payload)?,
                    },
                });
            }
            Ok(commands)
        })
        .await
    }

    pub async fn get(&self, id: CommandId) -> Result<Option<CommandRecord>, StoreError> {
        self.call(move |conn| load_record(conn, id)).await
    }

    pub async fn owner_of(&self, id: CommandId) -> Result<Option<String>, StoreError> {
        self.call(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT host_id FROM remote_commands WHERE id = ?1",
                    params![id.0],
                    |row| row.get(0),
                )
                .optional()?)
        })
        .await
    }

    pub async fn recent_for_host(
        &self,
        host_id: &str,
        limit: usize,
    ) -> Result<Vec<CommandRecord>, StoreError> {
        let host_id = host_id.to_string();
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.call(move |conn| {
            let sql = format!(
                "SELECT {RECORD_COLUMNS} FROM remote_commands \
                 WHERE host_id = ?1 ORDER BY id DESC LIMIT ?2"
            );
            let mut stmt = conn.prepare_cached(&sql)?;
            let rows = stmt.query_map(params![host_id, limit], RawRecord::from_row)?;
            let mut records = Vec::new();
            for row in rows {
                records.push(row?.into_record()?);
            }
            Ok(records)
        })
        .await
    }

    /// Stamps `started_at_ms` the first time an agent announces execution.
    /// Status stays pending.
    pub async fn mark_started(
        &self,
        id: CommandId,
        host_id: &str,
    ) -> Result<StartOutcome, StoreError> {
        let host_id = host_id.to_string();
        self.call(move |conn| {
            let Some(record) = load_record(conn, id)? else {
                return Ok(StartOutcome::NotFound);
            };
            if record.host_id != host_id {
                return Ok(StartOutcome::WrongHost);
            }
            if record.status.is_terminal() {
                return Ok(StartOutcome::AlreadyResolved);
            }
            let changed = conn.execute(
                "UPDATE remote_commands SET started_at_ms = ?2 \
                 WHERE id = ?1 AND status = 'pending' AND started_at_ms IS NULL",
                params![id.0, now_ms()],
            )?;
            Ok(if changed == 1 {
                StartOutcome::Started
            } else {
                StartOutcome::AlreadyStarted
            })
        })
        .await
    }

    /// Terminal write for a command. Only the first resolution takes effect;
    /// later calls report [`ResolveOutcome::AlreadyResolved`] and change nothing.
    ///
    /// `host_id` restricts the write to the owning host; `None` is used by the
    /// server itself when expiring stalled commands.
    pub async fn resolve(
        &self,
        id: CommandId,
        host_id: Option<&str>,
        status: FinalStatus,
        output: String,
        timed_out: bool,
    ) -> Result<ResolveOutcome, StoreError> {
        let host_id = host_id.map(str::to_string);
        self.call(move |conn| {
            let tx = conn.transaction()?;
            let outcome = resolve_in(&tx, id, host_id.as_deref(), status, &output, timed_out)?;
            tx.commit()?;
            Ok(outcome)
        })
        .await
    }

    /// Fails every pending command created before `cutoff_ms`, optionally
    /// only for one host. Returns the commands this call resolved.
    pub async fn expire_stalled(
        &self,
        host_id: Option<&str>,
        cutoff_ms: i64,
        reason: &str,
    ) -> Result<Vec<StalledCommand>, StoreError> {
        let host_id = host_id.map(str::to_string);
        let reason = reason.to_string();
        self.call(move |conn| {
            let tx = conn.transaction()?;
            let ids: Vec<i64> = {
                let mut stmt = tx.prepare_cached(
                    "SELECT id FROM remote_commands WHERE status = 'pending' \
                     AND created_at_ms < ?1 AND (?2 IS NULL OR host_id = ?2) ORDER BY id",
                )?;
                let rows = stmt.query_map(params![cutoff_ms, host_id], |row| row.get(0))?;
                rows.collect::<Result<_, _>>()?
            };
            let mut expired = Vec::new();
            for id in ids {
                if let ResolveOutcome::Applied(record) =
                    resolve_in(&tx, CommandId(id), None, FinalStatus::Failed, &reason, false)?
                {
                    expired.push(StalledCommand { record });
                }
            }
            tx.commit()?;
            Ok(expired)
        })
        .await
    }
}

fn resolve_in(
    conn: &Connection,
    id: CommandId,
    host_id: Option<&str>,
    status: FinalStatus,
    output: &str,
    timed_out: bool,
) -> Result<ResolveOutcome, StoreError> {
    let Some(record) = load_record(conn, id)? else {
        return Ok(ResolveOutcome::NotFound);
    };
    if host_id.is_some_and(|host| host != record.host_id) {
        return Ok(ResolveOutcome::WrongHost);
    }
    let status = CommandStatus::from(status);
    let changed = conn.execute(
        "UPDATE remote_commands SET status = ?2, output = ?3, timed_out = ?4, ended_at_ms = ?5 \
         WHERE id = ?1 AND status = 'pending'",
        params![id.0, status.as_str(), output, timed_out, now_ms()],
    )?;
    let current = load_record(conn, id)?.ok_or_else(|| {
        StoreError::Corrupt(format!("command {id} vanished during resolution"))
    })?;
    Ok(if changed == 1 {
        ResolveOutcome::Applied(current)
    } else {
        ResolveOutcome::AlreadyResolved(current)
    })
}

fn load_record(conn: &Connection, id: CommandId) -> Result<Option<CommandRecord>, StoreError> {
    let sql = format!("SELECT {RECORD_COLUMNS} FROM remote_commands WHERE id = ?1");
    let raw = conn
        .query_row(&sql, params![id.0], RawRecord::from_row)
        .optional()?;
    raw.map(RawRecord::into_record).transpose()
}

struct RawRecord {
    id: i64,
    host_id: String,
    kind: String,
    action: String,
    target: Option<String>,
    payload: String,
    status: String,
    output: String,
    timed_out: bool,
    issued_by: String,
    audit_log_id: Option<i64>,
    created_at_ms: i64,
    started_at_ms: Option<i64>,
    ended_at_ms: Option<i64>,
}

impl RawRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            host_id: row.get(1)?,
            kind: row.get(2)?,
            action: row.get(3)?,
            target: row.get(4)?,
            payload: row.get(5)?,
            status: row.get(6)?,
            output: row.get(7)?,
            timed_out: row.get(8)?,
            issued_by: row.get(9)?,
            audit_log_id: row.get(10)?,
            created_at_ms: row.get(11)?,
            started_at_ms: row.get(12)?,
            ended_at_ms: row.get(13)?,
        })
    }

    fn into_record(self) -> Result<CommandRecord, StoreError> {
        Ok(CommandRecord {
            id: CommandId(self.id),
            host_id: self.host_id,
            spec: CommandSpec {
                kind: parse_kind(&self.kind)?,
                action: self.action,
                target: self.target,
                payload: parse_payload(&self.payload)?,
            },
            status: self
                .status
                .parse()
                .map_err(|_| StoreError::Corrupt(format!("status {}", self.status)))?,
            output: self.output,
            timed_out: self.timed_out,
            issued_by: self.issued_by,
            audit_log_id: self.audit_log_id,
            created_at_ms: self.created_at_ms,
            started_at_ms: self.started_at_ms,
            ended_at_ms: self.ended_at_ms,
        })
    }
}

fn parse_kind(raw: &str) -> Result<CommandKind, StoreError> {
    raw.parse()
        .map_err(|_| StoreError::Corrupt(format!("kind {raw}")))
}

fn parse_payload(raw: &str) -> Result<serde_json::Value, StoreError> {
    serde_json::from_str(raw).map_err(|err| StoreError::Serialization(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn restart(host: &str, target: &str) -> NewCommand {
        NewCommand {
            host_id: host.to_string(),
            spec: CommandSpec {
                kind: CommandKind::ServiceUnit,
                action: "restart".to_string(),
                target: Some(target.to_string()),
                payload: serde_json::Value::Null,
            },
            issued_by: "alice".to_string(),
        }
    }

    #[tokio::test]
    async fn pending_for_returns_host_commands_in_creation_order() {
        let store = Store::open_in_memory().expect("store");
        let first = store.enqueue(restart("h1", "nginx"), None).await.expect("enqueue");
        store.enqueue(restart("h2", "redis"), None).await.expect("enqueue");
        let second = store.enqueue(restart("h1", "sshd"), None).await.expect("enqueue");

        let pending = store.pending_for("h1").await.expect("pending");
        let ids: Vec<_> = pending.iter().map(|command| command.id).collect();
        assert_eq!(ids, vec![first, second]);
        assert_eq!(pending[0].spec.target.as_deref(), Some("nginx"));
        assert!(store.pending_for("h3").await.expect("pending").is_empty());
    }

    #[tokio::test]
    async fn payload_survives_persistence() {
        let store = Store::open_in_memory().expect("store");
        let mut command = restart("h1", "sshd");
        command.spec.kind = CommandKind::LogFetch;
        command.spec.action = "logs".to_string();
        command.spec.payload = json!({ "lines": 20 });
        let id = store.enqueue(command, None).await.expect("enqueue");
        let record = store.get(id).await.expect("get").expect("record");
        assert_eq!(record.spec.payload, json!({ "lines": 20 }));
        assert_eq!(record.status, CommandStatus::Pending);
    }

    #[tokio::test]
    async fn first_resolution_wins() {
        let store = Store::open_in_memory().expect("store");
        let id = store.enqueue(restart("h1", "nginx"), None).await.expect("enqueue");

        let first = store
            .resolve(id, Some("h1"), FinalStatus::Completed, "done".into(), false)
            .await
            .expect("resolve");
        assert!(matches!(first, ResolveOutcome::Applied(ref record) if record.output == "done"));

        let second = store
            .resolve(id, Some("h1"), FinalStatus::Failed, "late".into(), true)
            .await
            .expect("resolve twice");
        match second {
            ResolveOutcome::AlreadyResolved(record) => {
                assert_eq!(record.status, CommandStatus::Completed);
                assert_eq!(record.output, "done");
                assert!(!record.timed_out);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(store.pending_for("h1").await.expect("pending").is_empty());
    }

    #[tokio::test]
    async fn resolve_checks_owner() {
        let store = Store::open_in_memory().expect("store");
        let id = store.enqueue(restart("h1", "nginx"), None).await.expect("enqueue");
        let outcome = store
            .resolve(id, Some("h2"), FinalStatus::Completed, String::new(), false)
            .await
            .expect("resolve");
        assert_eq!(outcome, ResolveOutcome::WrongHost);
        let missing = store
            .resolve(CommandId(999), Some("h1"), FinalStatus::Completed, String::new(), false)
            .await
            .expect("resolve");
        assert_eq!(missing, ResolveOutcome::NotFound);
        assert_eq!(store.pending_for("h1").await.expect("pending").len(), 1);
    }

    #[tokio::test]
    async fn started_marker_is_set_once() {
        let store = Store::open_in_memory().expect("store");
        let id = store.enqueue(restart("h1", "nginx"), None).await.expect("enqueue");
        assert_eq!(store.mark_started(id, "h1").await.expect("start"), StartOutcome::Started);
        assert_eq!(
            store.mark_started(id, "h1").await.expect("start"),
            StartOutcome::AlreadyStarted
        );
        assert_eq!(store.mark_started(id, "h9").await.expect("start"), StartOutcome::WrongHost);
        let record = store.get(id).await.expect("get").expect("record");
        assert_eq!(record.status, CommandStatus::Pending);
        assert!(record.started_at_ms.is_some());
    }

    #[tokio::test]
    async fn expire_stalled_fails_only_old_pending_commands() {
        let store = Store::open_in_memory().expect("store");
        let old = store.enqueue(restart("h1", "nginx"), None).await.expect("enqueue");
        let done = store.enqueue(restart("h1", "sshd"), None).await.expect("enqueue");
        let other = store.enqueue(restart("h2", "nginx"), None).await.expect("enqueue");
        store
            .resolve(done, Some("h1"), FinalStatus::Completed, "ok".into(), false)
            .await
            .expect("resolve");

        let cutoff = now_ms() + 1_000;
        let expired = store
            .expire_stalled(Some("h1"), cutoff, "expired")
            .await
            .expect("expire");
        let ids: Vec<_> = expired.iter().map(|stalled| stalled.record.id).collect();
        assert_eq!(ids, vec![old]);
        assert_eq!(expired[0].record.status, CommandStatus::Failed);

        let untouched = store.get(other).await.expect("get").expect("record");
        assert_eq!(untouched.status, CommandStatus::Pending);
        let kept = store.get(done).await.expect("get").expect("record");
        assert_eq!(kept.output, "ok");

        let none = store.expire_stalled(None, 0, "expired").await.expect("expire");
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn history_is_newest_first_and_limited() {
        let store = Store::open_in_memory().expect("store");
        let mut ids = Vec::new();
        for target in ["a", "b", "c"] {
            ids.push(store.enqueue(restart("h1", target), None).await.expect("enqueue"));
        }
        let recent = store.recent_for_host("h1", 2).await.expect("history");
        let got: Vec<_> = recent.iter().map(|record| record.id).collect();
        assert_eq!(got, vec![ids[2], ids[1]]);
        assert_eq!(store.owner_of(ids[0]).await.expect("owner").as_deref(), Some("h1"));
        assert_eq!(store.owner_of(CommandId(77)).await.expect("owner"), None);
    }
}
