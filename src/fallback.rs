//! Fallback ladder
//!
//! Deterministic query builders used when generation, validation or execution
//! fails. They never call the text generator. Candidates are tried in order and
//! the orchestrator keeps the first one that validates and returns rows.

use crate::entities::EntitySet;
use crate::schema::EXCLUDE_AGGREGATE_ROWS;
use itertools::Itertools;
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::HashSet;

lazy_static! {
    static ref PLAYER_EQUALITY: Regex =
        Regex::new(r#"(?i)\b(WHERE|AND)\s+"?Name"?\s*=\s*'(?:[^']|'')*'\s+AND\b"#).unwrap();
}

/// Builds a candidate from `(question, entities, table)`, or declines.
pub type FallbackFn = fn(&str, Option<&EntitySet>, &str) -> Option<String>;

#[derive(Clone, Copy)]
pub struct FallbackStrategy {
    pub name: &'static str,
    pub build: FallbackFn,
}

pub struct FallbackLadder {
    strategies: Vec<FallbackStrategy>,
}

impl FallbackLadder {
    pub fn new(strategies: Vec<FallbackStrategy>) -> Self {
        Self { strategies }
    }

    /// Simple aggregation, then basic player lookup, then top performers.
    pub fn standard() -> Self {
        Self::new(vec![
            FallbackStrategy {
                name: "simple_aggregation",
                build: simple_aggregation,
            },
            FallbackStrategy {
                name: "basic_player_lookup",
                build: basic_player_lookup,
            },
            FallbackStrategy {
                name: "top_performers",
                build: top_performers,
            },
        ])
    }

    pub fn strategies(&self) -> &[FallbackStrategy] {
        &self.strategies
    }

    /// Every candidate the ladder produces for this question, in order.
    pub fn candidates(
        &self,
        question: &str,
        entities: Option<&EntitySet>,
        table: &str,
    ) -> Vec<(&'static str, String)> {
        self.strategies
            .iter()
            .filter_map(|s| (s.build)(question, entities, table).map(|sql| (s.name, sql)))
            .collect()
    }
}

impl Default for FallbackLadder {
    fn default() -> Self {
        Self::standard()
    }
}

fn question_words(question: &str) -> HashSet<String> {
    question
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .collect()
}

fn resolved_players(entities: Option<&EntitySet>) -> Option<&[String]> {
    entities
        .map(|e| e.player_names.as_slice())
        .filter(|names| !names.is_empty())
}

/// `'A', 'B'` with embedded quotes doubled.
fn quoted_list(names: &[String]) -> String {
    names
        .iter()
        .map(|name| format!("'{}'", name.replace('\'', "''")))
        .join(", ")
}

/// Per-player average of points or rebounds.
pub fn simple_aggregation(question: &str, entities: Option<&EntitySet>, table: &str) -> Option<String> {
    let words = question_words(question);
    if !words.contains("average") && !words.contains("avg") {
        return None;
    }

    let (column, alias) = if words.contains("points") {
        ("Pts", "avg_points")
    } else if words.contains("rebounds") {
        ("Reb", "avg_rebounds")
    } else {
        return None;
    };

    let player_filter = resolved_players(entities)
        .map(|names| format!(" AND Name IN ({})", quoted_list(names)))
        .unwrap_or_default();

    Some(format!(
        "SELECT Name, ROUND(AVG({column}), 2) as {alias}\n\
         FROM {table}\n\
         WHERE {exclude}{player_filter}\n\
         GROUP BY Name\n\
         ORDER BY {alias} DESC\n\
         LIMIT 10",
        column = column,
        alias = alias,
        table = table,
        exclude = EXCLUDE_AGGREGATE_ROWS,
        player_filter = player_filter,
    ))
}

/// Recent game lines for the resolved players.
pub fn basic_player_lookup(_question: &str, entities: Option<&EntitySet>, table: &str) -> Option<String> {
    let names = resolved_players(entities)?;

    Some(format!(
        "SELECT Name, Pts, Reb, Ast, \"TO\", Stl, Blk, Opponent, game_date\n\
         FROM {table}\n\
         WHERE Name IN ({names}) AND {exclude}\n\
         ORDER BY game_date DESC\n\
         LIMIT 20",
        table = table,
        names = quoted_list(names),
        exclude = EXCLUDE_AGGREGATE_ROWS,
    ))
}

/// Scoring leaderboard for "best"/"top" questions.
pub fn top_performers(question: &str, _entities: Option<&EntitySet>, table: &str) -> Option<String> {
    let words = question_words(question);
    if !words.contains("best") && !words.contains("top") {
        return None;
    }

    Some(format!(
        "SELECT Name, ROUND(AVG(Pts), 2) as avg_points, ROUND(AVG(Reb), 2) as avg_rebounds, ROUND(AVG(Ast), 2) as avg_assists\n\
         FROM {table}\n\
         WHERE {exclude}\n\
         GROUP BY Name\n\
         ORDER BY avg_points DESC\n\
         LIMIT 10",
        table = table,
        exclude = EXCLUDE_AGGREGATE_ROWS,
    ))
}

/// Drop one `Name = '...' AND` predicate that directly follows WHERE or AND.
/// Returns `None` when the statement has no such predicate.
pub fn relax_player_predicate(sql: &str) -> Option<String> {
    let relaxed = PLAYER_EQUALITY.replacen(sql, 1, "$1");
    if relaxed == sql {
        None
    } else {
        Some(relaxed.into_owned())
    }
}
