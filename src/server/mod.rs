//! Workspace sync server: per-workspace rooms behind an axum router.

pub mod http;
pub mod room;

pub use http::router;
pub use room::{Room, RoomConfig, RoomPolicy, RoomRegistry};
