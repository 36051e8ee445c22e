pub mod artifacts;
pub mod fetch;
pub mod fleet;
pub mod logs;
