pub mod runner;
pub mod service;

// Re-export common types
pub use runner::RunDefaults;
pub use service::Worker;
