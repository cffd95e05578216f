pub mod config;
pub mod entities;
pub mod error;
pub mod fallback;
pub mod fuzzy_matcher;
pub mod llm;
pub mod narrator;
pub mod pipeline;
pub mod schema;
pub mod sql;
pub mod store;
pub mod synthesizer;
pub mod templates;

pub use config::PipelineConfig;
pub use entities::{EntityExtractor, EntitySet, LlmEntityExtractor, VocabularySource};
pub use error::{PipelineError, Result};
pub use fallback::FallbackLadder;
pub use llm::{LlmClient, TextGenerator};
pub use pipeline::{PipelineState, QueryPipeline, ResultEnvelope};
pub use schema::{Column, SchemaDescriptor, SchemaProvider};
pub use sql::{DialectRepairEngine, ReasonCode, SafetyValidator, ValidationOutcome};
pub use store::{DataStore, Row, ScalarValue, SqliteStore};
pub use synthesizer::{QuerySynthesizer, Synthesis};
pub use templates::TemplateLibrary;
