//! Diagram Exchange Core - Generated Diagram Intake
//!
//! Turns the free-text answer of a generative model into a valid draw.io
//! document and describes it.
//!
//! # Guarantees
//! 1. Every stage degrades into a structured error, never a panic
//! 2. A document reported as valid satisfies every structural rule
//! 3. Repair runs at most once per request and is idempotent
//! 4. Identical input yields identical output (apart from outcome ids and timestamps)
//! 5. Configuration is explicit; there is no global state

pub mod markup;
pub mod document;
pub mod envelope;
pub mod normalize;
pub mod validation;
pub mod repair;
pub mod introspect;
pub mod convert;
pub mod scoring;
pub mod config;
pub mod prompts;
pub mod hashing;
pub mod pipeline;

pub use config::{ConfigError, PipelineConfig};
pub use convert::{ConversionError, FormatConverter, Notation, Projection};
pub use document::{Cell, CellKind, DiagramDocument, Geometry};
pub use envelope::{Envelope, EnvelopeParser, ParseFailure, RecoveryStage};
pub use hashing::{canonical_json, compute_content_hash, document_hash};
pub use introspect::{
    Complexity, ElementDescriptor, ElementKind, Introspection, Introspector, LayoutSummary,
};
pub use pipeline::{
    DiagramPipeline, GenerationOutcome, GenerationRequest, PipelineError, ValidationReport,
};
pub use prompts::{FileInput, PromptBuilder};
pub use repair::{RepairEngine, RepairError};
pub use scoring::ConfidenceScorer;
pub use validation::{ErrorKind, SchemaValidator, ValidationError, ValidationResult, ValidationRule};

pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const MIN_CONFIG_VERSION: &str = "1.0.0";
