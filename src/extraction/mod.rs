pub mod config;
pub mod fields;
pub mod url;

// Re-export common types
pub use config::{ExtractionConfig, ResourceType};
pub use fields::{filter_valid, record_to_json, Extractor};
pub use url::build_url;
