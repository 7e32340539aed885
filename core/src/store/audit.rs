use super::{ts_col, uuid_col, UnitOfWork};
use crate::{
    error::CoreResult,
    event::AuditRecord,
    types::{ts_to_secs, EntityId},
};
use rusqlite::{params, Connection};

pub(super) fn insert(conn: &Connection, r: &AuditRecord) -> CoreResult<()> {
    let before = r.before.as_ref().map(serde_json::to_string).transpose()?;
    let after = r.after.as_ref().map(serde_json::to_string).transpose()?;
    conn.execute(
        "INSERT INTO audit_log (ts, actor, component, entity_id, event, before_state, after_state, correlation_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            ts_to_secs(&r.ts),
            r.actor,
            r.component,
            r.entity_id.to_string(),
            r.event,
            before,
            after,
            r.correlation_id,
        ],
    )?;
    Ok(())
}

impl UnitOfWork {
    // ── Audit log ─────────────────────────────────────────────────

    /// Audit records for one entity in the order they were written.
    pub fn audit_for_entity(&self, entity_id: EntityId) -> CoreResult<Vec<AuditRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT audit_id, ts, actor, component, entity_id, event, before_state, after_state, correlation_id
             FROM audit_log WHERE entity_id = ?1 ORDER BY audit_id ASC",
        )?;
        let raw = stmt
            .query_map(params![entity_id.to_string()], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    ts_col(row, 1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    uuid_col(row, 4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, Option<String>>(6)?,
                    row.get::<_, Option<String>>(7)?,
                    row.get::<_, String>(8)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        raw.into_iter()
            .map(|(id, ts, actor, component, entity_id, event, before, after, correlation_id)| -> CoreResult<AuditRecord> {
                Ok(AuditRecord {
                    id: Some(id),
                    ts,
                    actor,
                    component,
                    entity_id,
                    event,
                    before: before.map(|b| serde_json::from_str(&b)).transpose()?,
                    after: after.map(|a| serde_json::from_str(&a)).transpose()?,
                    correlation_id,
                })
            })
            .collect()
    }

    pub fn audit_count(&self) -> CoreResult<i64> {
        let n = self
            .conn()?
            .query_row("SELECT COUNT(*) FROM audit_log", [], |row| row.get(0))?;
        Ok(n)
    }
}
