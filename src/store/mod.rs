//! Persistence layer: libSQL-backed storage for messages, review items, and inventory.

pub mod libsql_backend;
pub mod messages;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use messages::MessageStore;
pub use traits::Database;
