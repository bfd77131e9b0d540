// Rapporti ETL - Core Library
// Staging-based bulk ingestion of regulatory entity files into SQLite.
// Exposes all modules for use in the CLI driver and tests.

pub mod config;
pub mod db;
pub mod entities;   // Record kinds + typed records
pub mod error;
pub mod loader;     // Batch Loader (chunked staging writes)
pub mod logging;
pub mod normalize;  // Canonical business keys
pub mod parser;     // Line Parser + file-name conventions
pub mod pipeline;   // Per-submission orchestration
pub mod reporter;   // Error/Duplicate Reporter
pub mod retry;      // Retry Executor
pub mod staging;    // Staging Processor
pub mod store;      // Blob-store collaborator
pub mod validation; // Field Validator

// Re-export commonly used types
pub use config::{IngestConfig, TimeoutConfig};
pub use db::{
    open_database, open_in_memory, setup_database, run_in_transaction,
    Ingestion, IngestionCounts, IngestionStatus, Submission, SubmissionStatus, TxClass,
};
pub use entities::{
    AccountingData, EntityData, IdentifierChange, Link, ParentKey, RecordKind, Relationship,
    Subject, TypedRecord,
};
pub use error::{EtlError, Result};
pub use loader::{BatchLoader, LoaderStats};
pub use parser::{detect_kind, fiscal_period, get_parser, LineParser, ParseError};
pub use pipeline::{
    FileResult, SourceFile, StagingIngestionService, SubmissionFailure, SubmissionReport,
};
pub use reporter::{error_count_by_code, error_details, ErrorDetail, ErrorRow};
pub use retry::RetryPolicy;
pub use staging::{DeferredConstraints, ProcessOutcome, RowStatus, StagingProcessor, StagingStep};
pub use store::{LocalObjectStore, ObjectInfo, ObjectStore};
pub use validation::{ErrorCause, ErrorCode, FieldValidator, SeenKeys};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
