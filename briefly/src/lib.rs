// Library interface for briefly modules
// This allows tests and the binary to import modules

pub mod compiler;
pub mod delivery;
pub mod error;
pub mod ingestion;
pub mod jobs;
pub mod llm;
pub mod maintenance;
pub mod models;
pub mod processing;
pub mod scraping;
pub mod services;
pub mod storage;

pub use error::PipelineError;
pub use services::Services;
