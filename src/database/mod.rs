pub mod operations;
pub mod schema;
pub mod store;


pub use operations::{Database, DbError};
pub use schema::{initialize_schema, run_migrations};
pub use store::{load_event, BackingStore, StoredEvent};
