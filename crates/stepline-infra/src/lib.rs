//! Infrastructure layer for Stepline: SQLite persistence behind the
//! repository traits defined in `stepline-core`.

pub mod sqlite;
