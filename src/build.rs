pub mod cache;
pub mod compile;
pub mod loader;
