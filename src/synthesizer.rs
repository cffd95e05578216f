//! Query Synthesizer
//!
//! Turns a question into a candidate SQL statement: known-shape bypass,
//! prompt construction, generation, extraction, repair and validation, inside
//! a bounded retry budget.

use crate::entities::EntitySet;
use crate::llm::TextGenerator;
use crate::schema::{SchemaDescriptor, EXCLUDE_AGGREGATE_ROWS};
use crate::sql::{
    extract_sql, DialectRepairEngine, ExtractionStrategy, ReasonCode, SafetyValidator,
    ValidationOutcome,
};
use crate::templates::{ShapeTrigger, TemplateLibrary};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Everyday words for columns, listed in the prompt.
const COLUMN_TERMS: [(&str, &str); 14] = [
    ("points", "Pts"),
    ("rebounds", "Reb"),
    ("assists", "Ast"),
    ("steals", "Stl"),
    ("blocks", "Blk"),
    ("turnovers", "\"TO\""),
    ("three pointers made", "\"3PTM\""),
    ("three pointers attempted", "\"3PTA\""),
    ("minutes", "Min"),
    ("jersey number", "\"No\""),
    ("date", "game_date"),
    ("field goal percentage", "CAST(FGM AS REAL) / NULLIF(FGA, 0)"),
    ("three point percentage", "CAST(\"3PTM\" AS REAL) / NULLIF(\"3PTA\", 0)"),
    ("free throw percentage", "CAST(FTM AS REAL) / NULLIF(FTA, 0)"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SqlSource {
    /// A known-shape template answered the question without generation
    Template,
    Generated,
}

/// What one `synthesize` call produced.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Synthesis {
    /// Last candidate, valid or not. `None` when nothing usable came back.
    pub sql: Option<String>,
    pub source: Option<SqlSource>,
    /// Generator calls made
    pub attempts: u32,
    /// Known shape that supplied the SQL, either up front or during repair
    pub template: Option<String>,
    pub extraction: Option<ExtractionStrategy>,
    pub last_rejection: Option<ReasonCode>,
    pub generation_error: Option<String>,
    pub approximate: bool,
}

impl Synthesis {
    pub fn is_accepted(&self) -> bool {
        self.sql.is_some() && self.last_rejection.is_none()
    }
}

pub struct QuerySynthesizer {
    generator: Arc<dyn TextGenerator>,
    schema: Arc<SchemaDescriptor>,
    templates: Arc<TemplateLibrary>,
    repair: DialectRepairEngine,
    validator: SafetyValidator,
    max_retries: u32,
}

impl QuerySynthesizer {
    pub fn new(
        generator: Arc<dyn TextGenerator>,
        schema: Arc<SchemaDescriptor>,
        templates: Arc<TemplateLibrary>,
    ) -> Self {
        let table = schema.table().to_string();
        Self {
            generator,
            repair: DialectRepairEngine::new(table.clone(), templates.clone()),
            validator: SafetyValidator::new(table),
            schema,
            templates,
            max_retries: 2,
        }
    }

    /// Extra attempts allowed after the first rejected candidate.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_approximate_rewrites(mut self, allow: bool) -> Self {
        self.repair = self.repair.with_approximate_rewrites(allow);
        self
    }

    pub fn table(&self) -> &str {
        self.schema.table()
    }

    pub fn build_prompt(&self, question: &str, entities: Option<&EntitySet>) -> String {
        let terms = COLUMN_TERMS
            .iter()
            .map(|(term, column)| format!("- {}: {}", term, column))
            .collect::<Vec<_>>()
            .join("\n");

        format!(
            r#"You are an expert SQLite query generator for UCLA women's basketball statistics.

CRITICAL SQLITE REQUIREMENTS:
- Use ONLY SQLite syntax - NO PostgreSQL features
- FORBIDDEN: EXTRACT, INTERVAL, DATE_TRUNC, STDDEV, VARIANCE, ILIKE, ::, SIMILAR TO, SPLIT_PART
- For dates: Use strftime('%Y-%m-%d', date_column) instead of EXTRACT
- Use CAST(col AS REAL) for type conversion, not ::
- Use LIKE instead of ILIKE

COLUMN NAMING:
- Always quote special columns: "3PTM", "3PTA", "TO", "No", "OR-DR"
- Column names are case-sensitive

Database schema:
{schema}

Terminology:
{terms}

Extracted entities: {entities}

User question: {question}

RULES:
- Query only the {table} table
- Always exclude team rows (use WHERE {exclude})
- Use SQLite date functions: date(), datetime(), strftime()
- Handle NULL with NULLIF() or COALESCE()
- Avoid CTEs; use simple subqueries
- Never put an aggregate function inside GROUP BY
- Keep queries simple

Generate ONLY the SQL query with no explanations."#,
            schema = self.schema.render_listing(),
            terms = terms,
            entities = EntitySet::render_for_prompt(entities),
            question = question,
            table = self.schema.table(),
            exclude = EXCLUDE_AGGREGATE_ROWS,
        )
    }

    pub async fn synthesize(&self, question: &str, entities: Option<&EntitySet>) -> Synthesis {
        if let Some(shape) = self.templates.find(ShapeTrigger::Question, question) {
            info!(template = %shape.name, "Question matches a known shape; skipping generation");
            return Synthesis {
                sql: Some(shape.render(self.table())),
                source: Some(SqlSource::Template),
                template: Some(shape.name.clone()),
                ..Synthesis::default()
            };
        }

        let prompt = self.build_prompt(question, entities);
        let mut synthesis = Synthesis::default();

        for attempt in 1..=self.max_retries + 1 {
            synthesis.attempts = attempt;

            let response = match self.generator.generate(&prompt).await {
                Ok(response) => response,
                Err(e) if e.is_connectivity() => {
                    warn!(attempt, "Text generation unreachable: {}", e);
                    synthesis.generation_error = Some(e.to_string());
                    synthesis.sql = None;
                    return synthesis;
                }
                Err(e) => {
                    warn!(attempt, "Text generation failed: {}", e);
                    synthesis.generation_error = Some(e.to_string());
                    continue;
                }
            };

            let extracted = extract_sql(&response);
            debug!(attempt, strategy = ?extracted.strategy, "Extracted SQL candidate");
            let report = self.repair.repair_with_report(&extracted.sql);
            let outcome = self.validator.validate(&report.sql);

            synthesis.sql = Some(report.sql);
            synthesis.source = Some(SqlSource::Generated);
            synthesis.extraction = Some(extracted.strategy);
            synthesis.template = report.template;
            synthesis.approximate = report.approximate;

            match outcome {
                ValidationOutcome::Accepted => {
                    info!(attempt, "Generated SQL accepted");
                    synthesis.last_rejection = None;
                    return synthesis;
                }
                ValidationOutcome::Rejected(reason) => {
                    warn!(attempt, reason = %reason, "Invalid SQL: {}", reason.describe());
                    synthesis.last_rejection = Some(reason);
                }
            }
        }

        synthesis
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{PipelineError, Result};
    use crate::schema::Column;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Replays scripted responses and counts calls.
    struct Scripted {
        responses: Mutex<Vec<Result<String>>>,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(mut responses: Vec<Result<String>>) -> Arc<Self> {
            responses.reverse();
            Arc::new(Self {
                responses: Mutex::new(responses),
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TextGenerator for Scripted {
        async fn generate(&self, _prompt: &str) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.responses
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Err(PipelineError::Llm("script exhausted".to_string())))
        }
    }

    fn synthesizer(generator: Arc<Scripted>) -> QuerySynthesizer {
        let schema = SchemaDescriptor::new(
            "ucla_player_stats",
            vec![Column::new("Name", "TEXT"), Column::new("Pts", "INTEGER")],
        );
        QuerySynthesizer::new(generator, Arc::new(schema), Arc::new(TemplateLibrary::builtin()))
    }

    #[test]
    fn test_prompt_contents() {
        let synthesizer = synthesizer(Scripted::new(vec![]));
        let prompt = synthesizer.build_prompt("Who scored most?", None);
        assert!(prompt.contains("Table: ucla_player_stats\n- Name (TEXT)\n- Pts (INTEGER)"));
        assert!(prompt.contains("Extracted entities: None"));
        assert!(prompt.contains("Name NOT IN ('Totals', 'TM', 'Team')"));
        assert!(prompt.contains("User question: Who scored most?"));

        let entities = EntitySet {
            opponent: Some("USC".to_string()),
            ..EntitySet::default()
        };
        let prompt = synthesizer.build_prompt("Who scored most?", Some(&entities));
        assert!(prompt.contains(r#"Extracted entities: {"opponent":"USC"}"#));
    }

    #[tokio::test]
    async fn test_close_games_bypass_skips_generation() {
        let generator = Scripted::new(vec![]);
        let synthesizer = synthesizer(generator.clone());

        let synthesis = synthesizer
            .synthesize("Compare Kiki Rice and Londynn Jones in close games", None)
            .await;
        assert_eq!(generator.calls(), 0);
        assert_eq!(synthesis.source, Some(SqlSource::Template));
        assert_eq!(synthesis.template.as_deref(), Some("close_games_comparison"));
        assert!(synthesis.sql.unwrap().contains("FROM ucla_player_stats"));
    }

    #[tokio::test]
    async fn test_repaired_candidate_is_accepted() {
        let generator = Scripted::new(vec![Ok(
            "```sql\nSELECT Name, SUM(TO) FROM ucla_player_stats WHERE Name ILIKE '%betts%' GROUP BY Name\n```"
                .to_string(),
        )]);
        let synthesizer = synthesizer(generator.clone());

        let synthesis = synthesizer.synthesize("turnovers for Betts", None).await;
        assert!(synthesis.is_accepted());
        assert_eq!(synthesis.attempts, 1);
        assert_eq!(synthesis.extraction, Some(ExtractionStrategy::SqlFence));
        assert_eq!(
            synthesis.sql.as_deref(),
            Some(r#"SELECT Name, SUM("TO") FROM ucla_player_stats WHERE Name LIKE '%betts%' GROUP BY Name"#)
        );
    }

    #[tokio::test]
    async fn test_retries_until_valid() {
        let generator = Scripted::new(vec![
            Ok("SELECT * FROM other_table".to_string()),
            Err(PipelineError::Llm("rate limited".to_string())),
            Ok("SELECT Name FROM ucla_player_stats".to_string()),
        ]);
        let synthesizer = synthesizer(generator.clone());

        let synthesis = synthesizer.synthesize("names", None).await;
        assert_eq!(generator.calls(), 3);
        assert!(synthesis.is_accepted());
        assert_eq!(synthesis.sql.as_deref(), Some("SELECT Name FROM ucla_player_stats"));
    }

    #[tokio::test]
    async fn test_retry_budget_is_bounded() {
        let generator = Scripted::new(vec![
            Ok("SELECT * FROM a".to_string()),
            Ok("SELECT * FROM b".to_string()),
            Ok("SELECT * FROM c".to_string()),
            Ok("SELECT * FROM ucla_player_stats".to_string()),
        ]);
        let synthesizer = synthesizer(generator.clone());

        let synthesis = synthesizer.synthesize("everything", None).await;
        assert_eq!(generator.calls(), 3);
        assert_eq!(synthesis.last_rejection, Some(ReasonCode::WrongTable));
        assert_eq!(synthesis.sql.as_deref(), Some("SELECT * FROM c"));
    }

    #[tokio::test]
    async fn test_connectivity_error_stops_immediately() {
        let generator = Scripted::new(vec![Err(PipelineError::LlmConnectivity(
            "connection refused".to_string(),
        ))]);
        let synthesizer = synthesizer(generator.clone());

        let synthesis = synthesizer.synthesize("anything", None).await;
        assert_eq!(generator.calls(), 1);
        assert!(synthesis.sql.is_none());
        assert!(synthesis.generation_error.is_some());
    }
}
