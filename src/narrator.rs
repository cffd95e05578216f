//! Narration of query results
//!
//! Asks the text generator for a short answer grounded in the rows; falls
//! back to a plain summary when generation is unavailable.

use crate::llm::TextGenerator;
use crate::store::Row;
use std::sync::Arc;
use tracing::error;

/// Rows shown to the generator
const PROMPT_ROW_LIMIT: usize = 10;
/// Rows quoted by the plain summary
const SUMMARY_ROW_LIMIT: usize = 3;

pub const NO_DATA_MESSAGE: &str = "I couldn't find any data matching your request.";

pub struct Narrator {
    generator: Arc<dyn TextGenerator>,
}

impl Narrator {
    pub fn new(generator: Arc<dyn TextGenerator>) -> Self {
        Self { generator }
    }

    pub fn build_prompt(question: &str, sql: &str, rows: &[Row]) -> String {
        let shown = rows
            .iter()
            .take(PROMPT_ROW_LIMIT)
            .map(|row| serde_json::to_string(row).unwrap_or_else(|_| row.to_string()))
            .collect::<Vec<_>>()
            .join("\n");

        format!(
            r#"Based on the following UCLA women's basketball statistics, provide a clear answer to the user's question.

User question: {}
SQL query used: {}
Query results (up to {} rows):
{}

Instructions:
- Provide a direct answer to the user's question
- Include specific numbers and statistics from the data
- Format clearly and concisely
- If comparing players, present the comparison clearly
- Don't mention SQL or technical details"#,
            question, sql, PROMPT_ROW_LIMIT, shown
        )
    }

    /// Plain-text description used when the generator cannot be reached.
    pub fn summarize(rows: &[Row]) -> String {
        match rows {
            [] => NO_DATA_MESSAGE.to_string(),
            [only] => format!("I found one result: {}", only),
            _ => {
                let first: Vec<String> = rows
                    .iter()
                    .take(SUMMARY_ROW_LIMIT)
                    .map(|row| row.to_string())
                    .collect();
                format!(
                    "I found {} results. Here are the first few: {}",
                    rows.len(),
                    first.join("; ")
                )
            }
        }
    }

    pub async fn narrate(&self, question: &str, sql: &str, rows: &[Row]) -> String {
        if rows.is_empty() {
            return NO_DATA_MESSAGE.to_string();
        }

        match self
            .generator
            .generate(&Self::build_prompt(question, sql, rows))
            .await
        {
            Ok(text) if !text.trim().is_empty() => text.trim().to_string(),
            Ok(_) => Self::summarize(rows),
            Err(e) => {
                error!("Failed to generate narrative: {}", e);
                Self::summarize(rows)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{PipelineError, Result};
    use crate::store::ScalarValue;
    use async_trait::async_trait;

    struct Offline;

    #[async_trait]
    impl TextGenerator for Offline {
        async fn generate(&self, _prompt: &str) -> Result<String> {
            Err(PipelineError::LlmConnectivity("offline".to_string()))
        }
    }

    struct Echo;

    #[async_trait]
    impl TextGenerator for Echo {
        async fn generate(&self, prompt: &str) -> Result<String> {
            Ok(format!("  {} chars  ", prompt.len()))
        }
    }

    fn row(name: &str, pts: i64) -> Row {
        Row::new(vec![
            ("Name".to_string(), ScalarValue::Text(name.to_string())),
            ("Pts".to_string(), ScalarValue::Integer(pts)),
        ])
    }

    #[tokio::test]
    async fn test_offline_summary() {
        let narrator = Narrator::new(Arc::new(Offline));

        let one = narrator.narrate("q", "SELECT 1", &[row("Betts, Lauren", 20)]).await;
        assert_eq!(one, "I found one result: {Name: Betts, Lauren, Pts: 20}");

        let rows: Vec<Row> = (0..5).map(|i| row("Rice, Kiki", i)).collect();
        let many = narrator.narrate("q", "SELECT 1", &rows).await;
        assert!(many.starts_with("I found 5 results. Here are the first few: "));
        assert_eq!(many.matches("Rice, Kiki").count(), 3);
    }

    #[tokio::test]
    async fn test_empty_rows_skip_generation() {
        let narrator = Narrator::new(Arc::new(Echo));
        assert_eq!(narrator.narrate("q", "SELECT 1", &[]).await, NO_DATA_MESSAGE);
    }

    #[tokio::test]
    async fn test_generated_text_is_trimmed() {
        let narrator = Narrator::new(Arc::new(Echo));
        let text = narrator.narrate("q", "SELECT 1", &[row("Betts, Lauren", 20)]).await;
        assert!(text.ends_with("chars"));
        assert!(!text.starts_with(' '));
    }

    #[test]
    fn test_prompt_caps_rows() {
        let rows: Vec<Row> = (0..15).map(|i| row("Jones, Londynn", i)).collect();
        let prompt = Narrator::build_prompt("Who scored?", "SELECT Name, Pts FROM t", &rows);
        assert_eq!(prompt.matches("Jones, Londynn").count(), 10);
        assert!(prompt.contains(r#"{"Name":"Jones, Londynn","Pts":0}"#));
    }
}
