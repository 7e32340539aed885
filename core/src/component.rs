//! Component trait.
//!
//! RULE: Every domain component implements `Component`.
//! Each component owns one aggregate root and its tables. Cross-component
//! effects go through the owner's contract inside the caller's Unit of Work.

use crate::{
    error::CoreResult,
    event::{AuditEvent, AuditRecord},
    store::UnitOfWork,
    types::{EntityId, Timestamp},
};
use serde_json::Value;

pub trait Component: Send + Sync {
    /// Unique stable name, written to the `component` column of the audit log.
    fn name(&self) -> &'static str;

    /// Append an audit record for `entity_id` inside `uow`. It becomes visible
    /// atomically with the mutation it describes.
    fn audit(
        &self,
        uow: &UnitOfWork,
        entity_id: EntityId,
        event: AuditEvent,
        before: Option<Value>,
        after: Option<Value>,
        ts: Timestamp,
    ) -> CoreResult<()> {
        let ctx = uow.context();
        let record = AuditRecord {
            id: None,
            ts,
            actor: ctx.principal.actor(),
            component: self.name().to_string(),
            entity_id,
            event: event.code().to_string(),
            before,
            after,
            correlation_id: ctx.correlation_id.clone(),
        };
        uow.append_audit(&record)
    }
}
