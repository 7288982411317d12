//! SQLite persistence for wallet storage.
//!
//! Each wallet file is a small key-value table holding JSON values, so the
//! sync engine can keep its nonce and label mapping next to the wallet.

pub mod schema;

pub use schema::SqliteStorage;
