//! Pull a single SQL statement out of free-form generator output.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

lazy_static! {
    static ref SQL_FENCE: Regex = Regex::new(r"(?is)```sql\s*(.*?)\s*```").unwrap();
    static ref BACKTICK_SPAN: Regex = Regex::new(r"(?s)`([^`]+)`").unwrap();
    static ref TRAILING_SELECT: Regex = Regex::new(r"(?is)(?:^|\n)[ \t]*(SELECT\b.*?;?)\s*$").unwrap();
    static ref FIRST_SELECT: Regex = Regex::new(r"(?is)\bSELECT\b").unwrap();
}

/// Which strategy produced the candidate, in the order they are tried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionStrategy {
    SqlFence,
    BacktickSpan,
    TrailingSelect,
    PrefixStrip,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extracted {
    pub sql: String,
    pub strategy: ExtractionStrategy,
}

pub fn extract_sql(response: &str) -> Extracted {
    if let Some(caps) = SQL_FENCE.captures(response) {
        return Extracted {
            sql: caps[1].trim().to_string(),
            strategy: ExtractionStrategy::SqlFence,
        };
    }

    if let Some(caps) = BACKTICK_SPAN.captures(response) {
        let inner = caps[1].trim();
        if !inner.is_empty() {
            return Extracted {
                sql: inner.to_string(),
                strategy: ExtractionStrategy::BacktickSpan,
            };
        }
    }

    if let Some(caps) = TRAILING_SELECT.captures(response) {
        return Extracted {
            sql: caps[1].trim().to_string(),
            strategy: ExtractionStrategy::TrailingSelect,
        };
    }

    let stripped = match FIRST_SELECT.find(response) {
        Some(m) => &response[m.start()..],
        None => response,
    };
    Extracted {
        sql: stripped.trim().to_string(),
        strategy: ExtractionStrategy::PrefixStrip,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sql_fence() {
        let response = "Here you go:\n```sql\nSELECT * FROM ucla_player_stats\n```\nEnjoy.";
        let extracted = extract_sql(response);
        assert_eq!(extracted.sql, "SELECT * FROM ucla_player_stats");
        assert_eq!(extracted.strategy, ExtractionStrategy::SqlFence);
    }

    #[test]
    fn test_untagged_fence_falls_to_backtick_span() {
        let response = "```\nSELECT Name FROM ucla_player_stats\n```";
        let extracted = extract_sql(response);
        assert_eq!(extracted.sql, "SELECT Name FROM ucla_player_stats");
        assert_eq!(extracted.strategy, ExtractionStrategy::BacktickSpan);
    }

    #[test]
    fn test_inline_backticks() {
        let extracted = extract_sql("Run `SELECT MAX(Pts) FROM ucla_player_stats` to see it.");
        assert_eq!(extracted.sql, "SELECT MAX(Pts) FROM ucla_player_stats");
    }

    #[test]
    fn test_trailing_select_after_prose() {
        let response = "The query below selects averages.\nSELECT Name, AVG(Pts)\nFROM ucla_player_stats\nGROUP BY Name;";
        let extracted = extract_sql(response);
        assert_eq!(extracted.strategy, ExtractionStrategy::TrailingSelect);
        assert_eq!(
            extracted.sql,
            "SELECT Name, AVG(Pts)\nFROM ucla_player_stats\nGROUP BY Name;"
        );
    }

    #[test]
    fn test_prefix_strip() {
        let extracted = extract_sql("Answer: SELECT COUNT(*) FROM ucla_player_stats");
        assert_eq!(extracted.sql, "SELECT COUNT(*) FROM ucla_player_stats");
        assert_eq!(extracted.strategy, ExtractionStrategy::PrefixStrip);
    }

    #[test]
    fn test_no_select_returns_trimmed_text() {
        let extracted = extract_sql("  I cannot answer that.  ");
        assert_eq!(extracted.sql, "I cannot answer that.");
    }
}
