use protocol::{HostSnapshot, PackageStatus};
use rusqlite::{params, OptionalExtension};

use super::{now_ms, Store, StoreError};

impl Store {
    /// Records the latest heartbeat for a host.
    pub async fn touch_host(
        &self,
        host_id: &str,
        agent_version: &str,
        snapshot: HostSnapshot,
    ) -> Result<(), StoreError> {
        let host_id = host_id.to_string();
        let agent_version = agent_version.to_string();
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO hosts (id, hostname, os, kernel, agent_version, last_seen_ms) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
                 ON CONFLICT(id) DO UPDATE SET hostname = excluded.hostname, os = excluded.os, \
                 kernel = excluded.kernel, agent_version = excluded.agent_version, \
                 last_seen_ms = excluded.last_seen_ms",
                params![
                    host_id,
                    snapshot.hostname,
                    snapshot.os,
                    snapshot.kernel,
                    agent_version,
                    now_ms()
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn upsert_package_status(
        &self,
        host_id: &str,
        status: PackageStatus,
    ) -> Result<(), StoreError> {
        let host_id = host_id.to_string();
        let packages = serde_json::to_string(&status.packages)
            .map_err(|err| StoreError::Serialization(err.to_string()))?;
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO package_status \
                 (host_id, pending_packages, security_updates, packages, updated_at_ms) \
                 VALUES (?1, ?2, ?3, ?4, ?5) \
                 ON CONFLICT(host_id) DO UPDATE SET pending_packages = excluded.pending_packages, \
                 security_updates = excluded.security_updates, packages = excluded.packages, \
                 updated_at_ms = excluded.updated_at_ms",
                params![
                    host_id,
                    status.pending_packages,
                    status.security_updates,
                    packages,
                    now_ms()
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn package_status(&self, host_id: &str) -> Result<Option<PackageStatus>, StoreError> {
        let host_id = host_id.to_string();
        self.call(move |conn| {
            let row = conn
                .query_row(
                    "SELECT pending_packages, security_updates, packages FROM package_status \
                     WHERE host_id = ?1",
                    params![host_id],
                    |row| {
                        Ok((
                            row.get::<_, u32>(0)?,
                            row.get::<_, u32>(1)?,
                            row.get::<_, String>(2)?,
                        ))
                    },
                )
                .optional()?;
            let Some((pending_packages, security_updates, packages)) = row else {
                return Ok(None);
            };
            let packages = serde_json::from_str(&packages)
                .map_err(|err| StoreError::Serialization(err.to_string()))?;
            Ok(Some(PackageStatus {
                pending_packages,
                security_updates,
                packages,
            }))
        })
        .await
    }
}
