// Receipty - Core Library
// Receipt ingestion, LLM extraction and spending analytics, shared by the CLI and the API server

pub mod analytics;
pub mod config;
pub mod db;
pub mod llm;
pub mod logging;
pub mod models;
pub mod processor;
pub mod schema;
pub mod seed;

#[cfg(feature = "server")]
pub mod api;

// Re-export commonly used types
pub use config::{ConfigError, Settings};
pub use db::{
    open_database, setup_database, submit_receipt, get_all_receipts, get_receipt,
    get_receipts_by_status, get_analysis_rows, reset_failed_to_pending, export_items_csv,
    insert_event, get_events_for_entity, AnalysisRow, Event, SubmitOutcome,
};
pub use llm::{LlmError, OpenAiExtractor, ReceiptExtractor};
pub use models::{format_money, Category, Item, Receipt, ReceiptStatus, DEMO_USER_ID};
pub use processor::{ProcessingReport, ProcessorOptions, ReceiptProcessor};
pub use schema::{
    parse_structured_receipt, receipt_json_schema, ItemData, StructuredReceiptData,
    ValidationError, ValidationResult,
};
pub use analytics::{Dashboard, Filter, MonthlyAnalysis};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
