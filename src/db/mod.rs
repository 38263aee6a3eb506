pub mod connection;
pub mod schema;
pub mod store;

pub use connection::make_pool;
pub use schema::{quote_ident, quote_literal, validate_ident};
pub use store::{RelationalStore, SqliteStore};
