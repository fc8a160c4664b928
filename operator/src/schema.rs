//! Diesel table definitions for the PostgreSQL object store.

diesel::table! {
    store_objects (id) {
        id -> Int8,
        kind -> Varchar,
        namespace -> Varchar,
        name -> Varchar,
        resource_version -> Int8,
        metadata -> Jsonb,
        body -> Jsonb,
        create_date -> Nullable<Timestamptz>,
        write_date -> Nullable<Timestamptz>,
    }
}
