pub mod batched;
pub mod sqlite;
