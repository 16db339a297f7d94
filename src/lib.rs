// Dynamic Sub-Ledger - Core Library
// Exposes all modules for use in CLI, API server, and tests

pub mod error;
pub mod fields;     // Field references: [name] extraction
pub mod formula;    // Expression evaluator (allowlist parser)
pub mod account;    // Account templates: static or row-dependent
pub mod plan;       // Query plan builder
pub mod rules;      // Rule definitions and sources
pub mod executor;   // Query executors (in-memory)
pub mod processor;  // Rule processor
pub mod summary;    // Per-account totals and report
pub mod sink;       // Result sinks (JSON, CSV)
pub mod db;         // SQLite store, executor and sink
pub mod config;     // YAML configuration

// Re-export commonly used types
pub use error::{ConfigError, EvalError, RowError, RuleError};
pub use fields::{extract_fields, has_field_refs, value_text, FieldSource};
pub use formula::{evaluate, parse, try_evaluate, Expr, Formula, Function};
pub use account::{resolve, AccountKind, AccountTemplate, ResolvedAccount, Segment, UNKNOWN_FIELD};
pub use plan::{
    build_plan, parse_filter, AggregationPlan, BaseFields, MatchConstraint, MatchValue,
    OverlapPolicy, PlanOptions,
};
pub use rules::{RuleDefinition, RuleFile, RuleSource, RuleStatus};
pub use executor::{MemoryExecutor, QueryExecutor, ResultRow};
pub use processor::{
    LedgerEntry, RuleOutcome, RuleProcessor, RunContext, RunIssue, RunOptions, RunOutcome,
};
pub use summary::{render_summary, summarize, AccountSummary};
pub use sink::{file_sink, CsvFileSink, JsonFileSink, OutputFormat, ResultSink};
pub use db::{
    count_entries, get_entries, get_rules, insert_entries, insert_event, insert_rules,
    insert_source_rows, load_records, setup_database, Event, SqliteExecutor, SqliteRuleStore,
    SqliteSink,
};
pub use config::Config;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
