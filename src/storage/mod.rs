// ABOUTME: Durable state layout: bucket/oplog store, CRUD queue, schema management

pub mod buckets;
pub mod crud;
pub mod schema;
