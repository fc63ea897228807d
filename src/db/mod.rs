pub mod cache;
pub mod connectors;
pub mod entity;
pub mod join_killer;
pub mod query;
pub mod router;
pub mod schema;
pub mod sync;
