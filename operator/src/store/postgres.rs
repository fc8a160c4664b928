//! PostgreSQL object store over diesel-async.
//!
//! Every write is conditional on the resource version that was read, so two
//! operators racing on the same record resolve to one winner and one
//! `Conflict`.

use async_trait::async_trait;
use chrono::Utc;
use diesel::dsl::sql;
use diesel::prelude::*;
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use diesel::sql_types::{Bool, Jsonb};
use diesel_async::pooled_connection::deadpool::{Object, Pool};
use diesel_async::pooled_connection::AsyncDieselConnectionManager;
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use serde_json::{Map, Value};
use tokio::sync::broadcast;

use crate::models::{Kind, Labels, ObjectMeta};
use crate::schema::store_objects;

use super::{
    merge_delete, merge_update, migration, prepare_create, Merged, ObjectRef, ObjectStore,
    RawObject, StoreError, UpdateScope,
};

pub type DieselPool = Pool<AsyncPgConnection>;

#[derive(Debug, Queryable, Selectable)]
#[diesel(table_name = store_objects)]
struct StoredRow {
    name: String,
    resource_version: i64,
    metadata: Value,
    body: Value,
}

impl StoredRow {
    fn into_raw(self) -> Result<RawObject, StoreError> {
        let mut metadata: ObjectMeta = serde_json::from_value(self.metadata)?;
        metadata.resource_version = self.resource_version as u64;
        let body = match self.body {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Ok(RawObject { metadata, body })
    }
}

/// Containment document for `selector`; `None` matches every record.
fn label_selector(selector: &Labels) -> Option<Value> {
    if selector.is_empty() {
        return None;
    }
    Some(Value::Object(
        selector
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect(),
    ))
}

/// Decode listed rows; a row that no longer decodes is logged and skipped.
fn decode_rows(kind: Kind, rows: Vec<StoredRow>) -> Vec<RawObject> {
    rows.into_iter()
        .filter_map(|row| {
            let name = row.name.clone();
            match row.into_raw() {
                Ok(raw) => Some(raw),
                Err(e) => {
                    tracing::warn!(%kind, name = %name, error = %e, "Skipping undecodable record");
                    None
                }
            }
        })
        .collect()
}

pub struct PgStore {
    pool: DieselPool,
    events: broadcast::Sender<ObjectRef>,
}

fn backend(e: impl std::fmt::Display) -> StoreError {
    StoreError::Backend(e.to_string())
}

impl PgStore {
    /// Connect, build the pool and run the schema migration.
    pub async fn connect(database_url: &str, max_connections: usize) -> anyhow::Result<Self> {
        let manager = AsyncDieselConnectionManager::<AsyncPgConnection>::new(database_url);
        let pool = Pool::builder(manager)
            .max_size(max_connections)
            .build()
            .map_err(|e| anyhow::anyhow!("diesel pool: {e}"))?;

        {
            let mut conn = pool
                .get()
                .await
                .map_err(|e| anyhow::anyhow!("diesel pool: {e}"))?;
            tracing::info!("Running object store migration...");
            migration::run_migration(&mut conn).await?;
            tracing::info!("Object store migration completed.");
        }

        let (events, _) = broadcast::channel(1024);
        Ok(Self { pool, events })
    }

    async fn conn(&self) -> Result<Object<AsyncPgConnection>, StoreError> {
        self.pool.get().await.map_err(backend)
    }

    fn notify(&self, kind: Kind, namespace: &str, name: &str) {
        let _ = self.events.send(ObjectRef::new(kind, namespace, name));
    }

    async fn fetch(
        &self,
        conn: &mut AsyncPgConnection,
        kind: Kind,
        namespace: &str,
        name: &str,
    ) -> Result<RawObject, StoreError> {
        let row: Option<StoredRow> = store_objects::table
            .filter(store_objects::kind.eq(kind.as_str()))
            .filter(store_objects::namespace.eq(namespace))
            .filter(store_objects::name.eq(name))
            .select(StoredRow::as_select())
            .first(conn)
            .await
            .optional()
            .map_err(backend)?;

        row.ok_or_else(|| StoreError::not_found(kind, namespace, name))?
            .into_raw()
    }

    /// Apply `merged` guarded by the version that was read.
    async fn commit(
        &self,
        conn: &mut AsyncPgConnection,
        kind: Kind,
        stored: &RawObject,
        merged: Merged,
    ) -> Result<Option<RawObject>, StoreError> {
        let meta = &stored.metadata;
        let expected = meta.resource_version as i64;
        let target = store_objects::table
            .filter(store_objects::kind.eq(kind.as_str()))
            .filter(store_objects::namespace.eq(&meta.namespace))
            .filter(store_objects::name.eq(&meta.name))
            .filter(store_objects::resource_version.eq(expected));

        let (affected, result) = match merged {
            Merged::Write(object) => {
                let affected = diesel::update(target)
                    .set((
                        store_objects::resource_version
                            .eq(object.metadata.resource_version as i64),
                        store_objects::metadata.eq(serde_json::to_value(&object.metadata)?),
                        store_objects::body.eq(Value::Object(object.body.clone())),
                        store_objects::write_date.eq(Utc::now()),
                    ))
                    .execute(conn)
                    .await
                    .map_err(backend)?;
                (affected, Some(object))
            }
            Merged::Remove => {
                let affected = diesel::delete(target)
                    .execute(conn)
                    .await
                    .map_err(backend)?;
                (affected, None)
            }
        };

        if affected == 0 {
            return Err(StoreError::conflict(kind, &meta.namespace, &meta.name));
        }
        self.notify(kind, &meta.namespace, &meta.name);
        Ok(result)
    }
}

#[async_trait]
impl ObjectStore for PgStore {
    async fn get(&self, kind: Kind, namespace: &str, name: &str) -> Result<RawObject, StoreError> {
        let mut conn = self.conn().await?;
        self.fetch(&mut conn, kind, namespace, name).await
    }

    async fn list(
        &self,
        kind: Kind,
        namespace: &str,
        selector: &Labels,
    ) -> Result<Vec<RawObject>, StoreError> {
        let mut conn = self.conn().await?;
        let mut query = store_objects::table
            .filter(store_objects::kind.eq(kind.as_str()))
            .filter(store_objects::namespace.eq(namespace))
            .order(store_objects::name.asc())
            .select(StoredRow::as_select())
            .into_boxed();
        // served by idx_store_objects_labels
        if let Some(labels) = label_selector(selector) {
            query = query
                .filter(sql::<Bool>("metadata -> 'labels' @> ").bind::<Jsonb, _>(labels));
        }

        let rows: Vec<StoredRow> = query.load(&mut conn).await.map_err(backend)?;
        Ok(decode_rows(kind, rows))
    }

    async fn create(&self, kind: Kind, object: RawObject) -> Result<RawObject, StoreError> {
        let object = prepare_create(object, Utc::now());
        let meta = &object.metadata;
        let mut conn = self.conn().await?;

        let inserted = diesel::insert_into(store_objects::table)
            .values((
                store_objects::kind.eq(kind.as_str()),
                store_objects::namespace.eq(&meta.namespace),
                store_objects::name.eq(&meta.name),
                store_objects::resource_version.eq(meta.resource_version as i64),
                store_objects::metadata.eq(serde_json::to_value(meta)?),
                store_objects::body.eq(Value::Object(object.body.clone())),
            ))
            .execute(&mut conn)
            .await;

        match inserted {
            Ok(_) => {}
            Err(DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, _)) => {
                return Err(StoreError::already_exists(kind, &meta.namespace, &meta.name));
            }
            Err(e) => return Err(backend(e)),
        }

        self.notify(kind, &meta.namespace, &meta.name);
        Ok(object)
    }

    async fn update(
        &self,
        kind: Kind,
        object: RawObject,
        scope: UpdateScope,
    ) -> Result<Option<RawObject>, StoreError> {
        let mut conn = self.conn().await?;
        let stored = self
            .fetch(
                &mut conn,
                kind,
                &object.metadata.namespace,
                &object.metadata.name,
            )
            .await?;
        let merged = merge_update(kind, &stored, object, scope)?;
        self.commit(&mut conn, kind, &stored, merged).await
    }

    async fn delete(
        &self,
        kind: Kind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<RawObject>, StoreError> {
        let mut conn = self.conn().await?;
        let stored = self.fetch(&mut conn, kind, namespace, name).await?;
        let merged = merge_delete(&stored, Utc::now());
        self.commit(&mut conn, kind, &stored, merged).await
    }

    fn subscribe(&self) -> broadcast::Receiver<ObjectRef> {
        self.events.subscribe()
    }
}
