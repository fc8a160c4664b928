//! Idempotent schema setup for the PostgreSQL object store, run at startup.

use diesel_async::AsyncPgConnection;
use diesel_async::SimpleAsyncConnection;

/// One table holds every record kind; metadata and body are JSONB documents.
pub const MIGRATION_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS store_objects (
    id               BIGSERIAL PRIMARY KEY,
    kind             VARCHAR(32) NOT NULL,
    namespace        VARCHAR(253) NOT NULL,
    name             VARCHAR(253) NOT NULL,
    resource_version BIGINT NOT NULL DEFAULT 1,
    metadata         JSONB NOT NULL,
    body             JSONB NOT NULL DEFAULT '{}'::jsonb,
    create_date      TIMESTAMPTZ DEFAULT NOW(),
    write_date       TIMESTAMPTZ DEFAULT NOW(),
    UNIQUE (kind, namespace, name)
);

CREATE INDEX IF NOT EXISTS idx_store_objects_kind_ns ON store_objects (kind, namespace);
CREATE INDEX IF NOT EXISTS idx_store_objects_labels ON store_objects USING GIN ((metadata -> 'labels'));
"#;

pub async fn run_migration(conn: &mut AsyncPgConnection) -> anyhow::Result<()> {
    conn.batch_execute(MIGRATION_SQL)
        .await
        .map_err(|e| anyhow::anyhow!("object store migration failed: {e}"))?;
    Ok(())
}
