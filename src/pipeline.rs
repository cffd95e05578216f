//! Pipeline Orchestrator
//!
//! Sequences entity extraction, synthesis, validation, execution, recovery
//! and narration for one question, and always answers with a
//! [`ResultEnvelope`]. Nothing escapes `process_query`.

use crate::config::PipelineConfig;
use crate::entities::{EntityExtractor, EntitySet, LlmEntityExtractor};
use crate::error::Result;
use crate::fallback::{relax_player_predicate, FallbackLadder};
use crate::llm::{LlmClient, TextGenerator};
use crate::narrator::Narrator;
use crate::schema::{SchemaDescriptor, SchemaProvider};
use crate::sql::{SafetyValidator, ValidationOutcome};
use crate::store::{DataStore, Row, SqliteStore};
use crate::synthesizer::QuerySynthesizer;
use crate::templates::TemplateLibrary;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const FALLBACK_NOTE: &str = "\n\n(Note: Used a simplified query due to complexity.)";
pub const RELAXED_PREFIX: &str =
    "I couldn't find specific data for that player. Here's what I found instead:\n";
pub const EMPTY_RESULT_MESSAGE: &str =
    "I couldn't find any data matching your criteria. Please try rephrasing your question.";
pub const ERROR_MESSAGE: &str = "There was an error processing your question. Please try again.";
pub const UNEXPECTED_ERROR_MESSAGE: &str =
    "I encountered an unexpected error. Please try again or rephrase your question.";

/// Rows kept after predicate relaxation
const RELAXED_ROW_LIMIT: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Start,
    EntitiesExtracted,
    SqlSynthesized,
    SqlValidated,
    Executed,
    ResultsNonempty,
    NarrativeGenerated,
    FallbackLadder,
    EmptyResultRecovery,
    Done(Outcome),
}

/// The single value `process_query` returns.
#[derive(Debug, Clone, Serialize)]
pub struct ResultEnvelope {
    pub request_id: Uuid,
    pub processed_at: DateTime<Utc>,
    pub original_question: String,
    pub resolved_entities: Option<EntitySet>,
    pub final_sql: Option<String>,
    pub result_rows: Option<Vec<Row>>,
    pub narrative_text: String,
    pub succeeded: bool,
    pub used_fallback: bool,
    pub error_detail: Option<String>,
    /// Generator calls spent on SQL synthesis
    pub attempts: u32,
    pub states: Vec<PipelineState>,
}

impl ResultEnvelope {
    fn new(question: &str) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            processed_at: Utc::now(),
            original_question: question.to_string(),
            resolved_entities: None,
            final_sql: None,
            result_rows: None,
            narrative_text: UNEXPECTED_ERROR_MESSAGE.to_string(),
            succeeded: false,
            used_fallback: false,
            error_detail: None,
            attempts: 0,
            states: vec![PipelineState::Start],
        }
    }

    fn visit(&mut self, state: PipelineState) {
        debug!(request_id = %self.request_id, ?state, "Pipeline state");
        self.states.push(state);
    }

    fn succeed(&mut self, sql: String, rows: Vec<Row>, narrative: String) {
        self.final_sql = Some(sql);
        self.result_rows = Some(rows);
        self.narrative_text = narrative;
        self.succeeded = true;
        self.error_detail = None;
        self.visit(PipelineState::Done(Outcome::Success));
    }

    fn fail(&mut self, narrative: &str, detail: Option<String>) {
        self.narrative_text = narrative.to_string();
        self.succeeded = false;
        self.error_detail = detail;
        self.visit(PipelineState::Done(Outcome::Failure));
    }

    pub fn final_state(&self) -> Option<PipelineState> {
        self.states.last().copied()
    }
}

/// Why the primary path handed over to the fallback ladder.
enum PrimaryFailure {
    NoSql(String),
    Rejected(String),
    Execution(String),
}

impl PrimaryFailure {
    fn detail(self) -> String {
        match self {
            PrimaryFailure::NoSql(detail) => format!("Failed to generate SQL query: {}", detail),
            PrimaryFailure::Rejected(reason) => format!("SQL validation failed: {}", reason),
            PrimaryFailure::Execution(detail) => format!("SQL execution failed: {}", detail),
        }
    }
}

pub struct QueryPipeline {
    extractor: Arc<dyn EntityExtractor>,
    synthesizer: QuerySynthesizer,
    store: Arc<dyn DataStore>,
    validator: SafetyValidator,
    ladder: FallbackLadder,
    narrator: Narrator,
}

impl QueryPipeline {
    pub fn new(
        generator: Arc<dyn TextGenerator>,
        extractor: Arc<dyn EntityExtractor>,
        store: Arc<dyn DataStore>,
        schema: SchemaDescriptor,
        templates: Arc<TemplateLibrary>,
    ) -> Self {
        let validator = SafetyValidator::new(schema.table());
        Self {
            extractor,
            synthesizer: QuerySynthesizer::new(generator.clone(), Arc::new(schema), templates),
            store,
            validator,
            ladder: FallbackLadder::standard(),
            narrator: Narrator::new(generator),
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.synthesizer = self.synthesizer.with_max_retries(max_retries);
        self
    }

    pub fn with_approximate_rewrites(mut self, allow: bool) -> Self {
        self.synthesizer = self.synthesizer.with_approximate_rewrites(allow);
        self
    }

    pub fn with_ladder(mut self, ladder: FallbackLadder) -> Self {
        self.ladder = ladder;
        self
    }

    /// Wire the production components: SQLite store, Anthropic client,
    /// generator-backed entity extraction and the template library.
    pub fn from_config(config: &PipelineConfig) -> Result<Self> {
        config.check()?;

        let store = Arc::new(SqliteStore::open(&config.db_path)?);
        let schema = match store.get_schema(&config.table_name)? {
            Some(schema) => schema,
            None => {
                warn!("Table '{}' not found; prompts will omit the schema", config.table_name);
                SchemaDescriptor::unavailable(&config.table_name)
            }
        };

        let generator: Arc<dyn TextGenerator> = Arc::new(LlmClient::from_config(config)?);
        let templates = match &config.templates_path {
            Some(path) => TemplateLibrary::from_json_file(path)?,
            None => TemplateLibrary::builtin(),
        };
        let extractor = LlmEntityExtractor::from_config(generator.clone(), store.as_ref(), config)?;

        info!(
            "Pipeline ready: table={}, model={}, templates={}",
            config.table_name,
            config.model,
            templates.shapes().len()
        );

        Ok(Self::new(
            generator,
            Arc::new(extractor),
            store,
            schema,
            Arc::new(templates),
        )
        .with_max_retries(config.max_retries)
        .with_approximate_rewrites(config.allow_approximate_rewrites))
    }

    pub async fn process_query(&self, question: &str) -> ResultEnvelope {
        info!("Processing query: {}", question);
        let mut envelope = ResultEnvelope::new(question);

        if let Err(e) = self.run(question, &mut envelope).await {
            error!(request_id = %envelope.request_id, "Error processing query: {}", e);
            envelope.fail(UNEXPECTED_ERROR_MESSAGE, Some(e.to_string()));
        }
        envelope
    }

    async fn run(&self, question: &str, envelope: &mut ResultEnvelope) -> Result<()> {
        let entities = match self.extractor.extract(question).await {
            Ok(entities) if !entities.is_empty() => Some(entities),
            Ok(_) => None,
            Err(e) => {
                warn!("Entity extraction failed, continuing without entities: {}", e);
                None
            }
        };
        info!("Extracted entities: {:?}", entities);
        envelope.resolved_entities = entities.clone();
        envelope.visit(PipelineState::EntitiesExtracted);

        let synthesis = self.synthesizer.synthesize(question, entities.as_ref()).await;
        envelope.attempts = synthesis.attempts;
        envelope.visit(PipelineState::SqlSynthesized);

        let sql = match synthesis.sql {
            Some(sql) => sql,
            None => {
                let detail = synthesis
                    .generation_error
                    .unwrap_or_else(|| "no candidate produced".to_string());
                warn!("SQL generation failed: {}", detail);
                return self
                    .recover_from_failure(question, entities.as_ref(), envelope, PrimaryFailure::NoSql(detail))
                    .await;
            }
        };
        info!("Generated SQL: {}", sql);

        let outcome = self.validator.validate(&sql);
        envelope.visit(PipelineState::SqlValidated);
        if let ValidationOutcome::Rejected(reason) = outcome {
            error!("SQL validation failed: {}", reason.describe());
            return self
                .recover_from_failure(
                    question,
                    entities.as_ref(),
                    envelope,
                    PrimaryFailure::Rejected(reason.describe().to_string()),
                )
                .await;
        }

        let rows = match self.store.execute(&sql).await {
            Ok(rows) => rows,
            Err(e) if e.is_execution() => {
                envelope.visit(PipelineState::Executed);
                error!("SQL execution error: {}", e);
                return self
                    .recover_from_failure(
                        question,
                        entities.as_ref(),
                        envelope,
                        PrimaryFailure::Execution(e.to_string()),
                    )
                    .await;
            }
            Err(e) => return Err(e),
        };
        envelope.visit(PipelineState::Executed);

        if rows.is_empty() {
            warn!("Query returned no results");
            return self.recover_from_empty(question, entities.as_ref(), sql, envelope).await;
        }
        envelope.visit(PipelineState::ResultsNonempty);

        let narrative = self.narrator.narrate(question, &sql, &rows).await;
        envelope.visit(PipelineState::NarrativeGenerated);
        info!("Successfully processed query with {} results", rows.len());
        envelope.succeed(sql, rows, narrative);
        Ok(())
    }

    async fn recover_from_failure(
        &self,
        question: &str,
        entities: Option<&EntitySet>,
        envelope: &mut ResultEnvelope,
        failure: PrimaryFailure,
    ) -> Result<()> {
        if self.run_ladder(question, entities, envelope).await? {
            return Ok(());
        }
        envelope.fail(ERROR_MESSAGE, Some(failure.detail()));
        Ok(())
    }

    async fn recover_from_empty(
        &self,
        question: &str,
        entities: Option<&EntitySet>,
        sql: String,
        envelope: &mut ResultEnvelope,
    ) -> Result<()> {
        if entities.map_or(false, EntitySet::has_players) {
            envelope.visit(PipelineState::EmptyResultRecovery);
            if let Some(relaxed) = relax_player_predicate(&sql) {
                if self.validator.validate(&relaxed).is_accepted() {
                    if let Some(mut rows) = self.execute_nonempty(&relaxed).await? {
                        rows.truncate(RELAXED_ROW_LIMIT);
                        info!("Relaxed player predicate returned {} rows", rows.len());
                        let narrative = format!(
                            "{}{}",
                            RELAXED_PREFIX,
                            self.narrator.narrate(question, &relaxed, &rows).await
                        );
                        envelope.used_fallback = true;
                        envelope.succeed(relaxed, rows, narrative);
                        return Ok(());
                    }
                }
            }
            debug!("Predicate relaxation produced nothing");
        }

        if self.run_ladder(question, entities, envelope).await? {
            return Ok(());
        }

        envelope.final_sql = Some(sql);
        envelope.result_rows = Some(Vec::new());
        envelope.fail(EMPTY_RESULT_MESSAGE, None);
        Ok(())
    }

    /// First ladder candidate that validates and returns rows wins.
    async fn run_ladder(
        &self,
        question: &str,
        entities: Option<&EntitySet>,
        envelope: &mut ResultEnvelope,
    ) -> Result<bool> {
        envelope.visit(PipelineState::FallbackLadder);
        info!("Trying fallback strategies");

        for (name, sql) in self.ladder.candidates(question, entities, self.validator.table()) {
            if let ValidationOutcome::Rejected(reason) = self.validator.validate(&sql) {
                warn!(strategy = name, %reason, "Fallback candidate rejected");
                continue;
            }
            let Some(rows) = self.execute_nonempty(&sql).await? else {
                debug!(strategy = name, "Fallback produced nothing");
                continue;
            };

            info!(strategy = name, "Fallback succeeded with {} results", rows.len());
            let narrative = format!(
                "{}{}",
                self.narrator.narrate(question, &sql, &rows).await,
                FALLBACK_NOTE
            );
            envelope.used_fallback = true;
            envelope.succeed(sql, rows, narrative);
            return Ok(true);
        }
        Ok(false)
    }

    /// `Ok(None)` for an execution error or an empty result.
    async fn execute_nonempty(&self, sql: &str) -> Result<Option<Vec<Row>>> {
        match self.store.execute(sql).await {
            Ok(rows) if rows.is_empty() => Ok(None),
            Ok(rows) => Ok(Some(rows)),
            Err(e) if e.is_execution() => {
                warn!("Recovery query failed: {}", e);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}
