use serde_json::Value;
use uuid::Uuid;

use super::{EventKind, Store, StoreError};

impl Store {
    /// Appends one audit record. The event log is insert-only and totally
    /// ordered by (created_at, id).
    pub async fn append_event(
        &self,
        kind: EventKind,
        domain_id: Option<Uuid>,
        payload: Value,
    ) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO events (domain_id, kind, payload) VALUES ($1, $2, $3)")
            .bind(domain_id)
            .bind(kind.as_str())
            .bind(payload)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn count_events_of_kind(&self, kind: EventKind) -> Result<i64, StoreError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*)::bigint FROM events WHERE kind = $1")
                .bind(kind.as_str())
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }
}
