// Estimate Provenance - Core Library
// Formula versioning, line item computation and audit snapshots.
// Exposes all modules for use in CLI, API server, and tests

pub mod error;
pub mod formula;        // Registry, expression language, evaluator
pub mod locks;
pub mod estimate;
pub mod provenance;     // Usage snapshots
pub mod pipeline;
pub mod staleness;
pub mod aggregation;    // Subtotal / markup / VAT
pub mod store;
pub mod engine;
pub mod import;
pub mod config;
pub mod logging;

#[cfg(feature = "server")]
pub mod api;

// Re-export commonly used types
pub use error::{Error, ErrorKind, Result};
pub use formula::{
    evaluate, FormulaDraft, FormulaRegistry, FormulaVersion, InMemoryRegistry,
    InputDecl, Value, ValueKind, VersionRef,
};
pub use estimate::{
    Estimate, LineItem, PricingPolicy, RoundingMode, RoundingRule, VatBase,
};
pub use provenance::UsageSnapshot;
pub use staleness::{check_line_staleness, check_staleness, Staleness};
pub use aggregation::{aggregate, AggregateTotals, LineContribution, ValueSource};
pub use store::{EstimateStore, Event, MemoryStore, SqliteStore};
pub use engine::{
    EstimatingEngine, FormulaUsage, LineFailure, Recomputation, Verification,
};
pub use config::EngineConfig;
pub use logging::{init_logging, LogConfig, LogFormat};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
