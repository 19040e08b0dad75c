//! Transaction state machines and the handles executors keep for them.

pub mod arena;
pub mod response;
pub mod transaction;
pub mod work;
