// SQLite persistence for the arcflow engine.

pub mod models;
pub mod repositories;

pub use repositories::Database;
