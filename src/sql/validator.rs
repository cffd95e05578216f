//! Safety Validator
//!
//! Classifies a candidate statement as accepted or rejected. Rules are
//! checked in a fixed order and the first match decides the reason, so every
//! rejection is attributable to exactly one rule.

use crate::sql::scan::{self, Token, TokenKind};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

lazy_static! {
    static ref MUTATING_STATEMENT: Regex =
        Regex::new(r"(?i);\s*(DROP|DELETE|UPDATE|INSERT|CREATE|ALTER)\b").unwrap();
    static ref UNION_INJECTION: Regex =
        Regex::new(r"(?is)\bUNION\s+(?:ALL\s+)?SELECT\b.*--").unwrap();
}

/// Why a candidate was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReasonCode {
    Empty,
    MutatingStatement,
    UnionInjection,
    ForbiddenExtract,
    ForbiddenInterval,
    ForbiddenStddev,
    ForbiddenVariance,
    ForbiddenIlike,
    ForbiddenCastOperator,
    ForbiddenSimilarTo,
    ForbiddenSplitPart,
    AggregateInGroupBy,
    CteInWhere,
    NotASelect,
    WrongTable,
}

impl ReasonCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasonCode::Empty => "empty",
            ReasonCode::MutatingStatement => "mutating-statement",
            ReasonCode::UnionInjection => "union-injection",
            ReasonCode::ForbiddenExtract => "forbidden-extract",
            ReasonCode::ForbiddenInterval => "forbidden-interval",
            ReasonCode::ForbiddenStddev => "forbidden-stddev",
            ReasonCode::ForbiddenVariance => "forbidden-variance",
            ReasonCode::ForbiddenIlike => "forbidden-ilike",
            ReasonCode::ForbiddenCastOperator => "forbidden-cast-operator",
            ReasonCode::ForbiddenSimilarTo => "forbidden-similar-to",
            ReasonCode::ForbiddenSplitPart => "forbidden-split-part",
            ReasonCode::AggregateInGroupBy => "aggregate-in-group-by",
            ReasonCode::CteInWhere => "cte-in-where",
            ReasonCode::NotASelect => "not-a-select",
            ReasonCode::WrongTable => "wrong-table",
        }
    }

    /// Human-readable explanation, used in logs and error details.
    pub fn describe(&self) -> &'static str {
        match self {
            ReasonCode::Empty => "Empty SQL query",
            ReasonCode::MutatingStatement => "Statement separator followed by a mutating statement",
            ReasonCode::UnionInjection => "UNION SELECT followed by an inline comment",
            ReasonCode::ForbiddenExtract => "EXTRACT not supported in SQLite",
            ReasonCode::ForbiddenInterval => "INTERVAL not supported in SQLite",
            ReasonCode::ForbiddenStddev => "STDDEV not supported in SQLite",
            ReasonCode::ForbiddenVariance => "VARIANCE not supported in SQLite",
            ReasonCode::ForbiddenIlike => "ILIKE not supported in SQLite",
            ReasonCode::ForbiddenCastOperator => "PostgreSQL casting (::) not supported",
            ReasonCode::ForbiddenSimilarTo => "SIMILAR TO not supported in SQLite",
            ReasonCode::ForbiddenSplitPart => "SPLIT_PART not supported in SQLite",
            ReasonCode::AggregateInGroupBy => "Aggregate functions not allowed in GROUP BY",
            ReasonCode::CteInWhere => "CTE cannot be used inside WHERE clause",
            ReasonCode::NotASelect => "Query must contain SELECT",
            ReasonCode::WrongTable => "Query must reference the authorized table",
        }
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", content = "reason", rename_all = "snake_case")]
pub enum ValidationOutcome {
    Accepted,
    Rejected(ReasonCode),
}

impl ValidationOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, ValidationOutcome::Accepted)
    }

    pub fn reason(&self) -> Option<ReasonCode> {
        match self {
            ValidationOutcome::Accepted => None,
            ValidationOutcome::Rejected(reason) => Some(*reason),
        }
    }
}

/// Validator bound to the one table queries may reference.
#[derive(Debug, Clone)]
pub struct SafetyValidator {
    table: String,
}

impl SafetyValidator {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn validate(&self, sql: &str) -> ValidationOutcome {
        match self.first_violation(sql) {
            Some(reason) => ValidationOutcome::Rejected(reason),
            None => ValidationOutcome::Accepted,
        }
    }

    fn first_violation(&self, sql: &str) -> Option<ReasonCode> {
        if sql.trim().is_empty() {
            return Some(ReasonCode::Empty);
        }
        let tokens = scan::tokenize(sql);

        // Checked on raw text and on tokens: neither quoting nor comments may hide these.
        if MUTATING_STATEMENT.is_match(sql) || mutating_after_separator(&tokens) {
            return Some(ReasonCode::MutatingStatement);
        }
        if UNION_INJECTION.is_match(sql) {
            return Some(ReasonCode::UnionInjection);
        }

        let code: Vec<Token<'_>> = tokens
            .iter()
            .copied()
            .filter(|t| !matches!(t.kind, TokenKind::StringLit | TokenKind::Comment))
            .collect();

        if let Some(reason) = forbidden_token(&code) {
            return Some(reason);
        }
        if scan::has_aggregate_in_group_by(&code) {
            return Some(ReasonCode::AggregateInGroupBy);
        }
        if scan::has_cte_in_where(&code) {
            return Some(ReasonCode::CteInWhere);
        }
        if !code.iter().any(|t| t.is_word("SELECT")) {
            return Some(ReasonCode::NotASelect);
        }
        let references_table = code.iter().any(|t| {
            matches!(t.kind, TokenKind::Word | TokenKind::QuotedIdent)
                && t.ident().eq_ignore_ascii_case(&self.table)
        });
        if !references_table {
            return Some(ReasonCode::WrongTable);
        }

        None
    }
}

const MUTATING_KEYWORDS: [&str; 6] = ["DROP", "DELETE", "UPDATE", "INSERT", "CREATE", "ALTER"];

/// A separator followed, past any comments, by a mutating keyword.
fn mutating_after_separator(tokens: &[Token<'_>]) -> bool {
    tokens.iter().enumerate().any(|(idx, token)| {
        token.kind == TokenKind::Semicolon
            && tokens[idx + 1..]
                .iter()
                .find(|t| t.kind != TokenKind::Comment)
                .map_or(false, |t| MUTATING_KEYWORDS.iter().any(|kw| t.is_word(kw)))
    })
}

fn forbidden_token(tokens: &[Token<'_>]) -> Option<ReasonCode> {
    for (idx, token) in tokens.iter().enumerate() {
        let next = tokens.get(idx + 1);
        match token.kind {
            TokenKind::Word => {
                let upper = token.text.to_ascii_uppercase();
                let reason = match upper.as_str() {
                    "EXTRACT" => Some(ReasonCode::ForbiddenExtract),
                    "INTERVAL" => Some(ReasonCode::ForbiddenInterval),
                    "STDDEV" | "STDDEV_POP" | "STDDEV_SAMP" => Some(ReasonCode::ForbiddenStddev),
                    "VARIANCE" => Some(ReasonCode::ForbiddenVariance),
                    "ILIKE" => Some(ReasonCode::ForbiddenIlike),
                    "SPLIT_PART" => Some(ReasonCode::ForbiddenSplitPart),
                    "SIMILAR" if next.map_or(false, |t| t.is_word("TO")) => {
                        Some(ReasonCode::ForbiddenSimilarTo)
                    }
                    _ => None,
                };
                if reason.is_some() {
                    return reason;
                }
            }
            TokenKind::Other if token.text == ":" => {
                if next.map_or(false, |t| t.text == ":" && t.start == token.end()) {
                    return Some(ReasonCode::ForbiddenCastOperator);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator() -> SafetyValidator {
        SafetyValidator::new("ucla_player_stats")
    }

    fn reason(sql: &str) -> Option<ReasonCode> {
        validator().validate(sql).reason()
    }

    #[test]
    fn test_accepts_minimal_select() {
        assert!(validator().validate("SELECT * FROM ucla_player_stats").is_accepted());
    }

    #[test]
    fn test_rejects_drop_regardless_of_surroundings() {
        assert_eq!(
            reason("SELECT * FROM ucla_player_stats; DROP TABLE x"),
            Some(ReasonCode::MutatingStatement)
        );
        assert_eq!(
            reason("SELECT Name FROM ucla_player_stats WHERE Pts > 3;drop table x; SELECT 1"),
            Some(ReasonCode::MutatingStatement)
        );
    }

    #[test]
    fn test_rejects_drop_hidden_behind_comment() {
        assert_eq!(
            reason("SELECT * FROM ucla_player_stats; /* x */ DROP TABLE ucla_player_stats"),
            Some(ReasonCode::MutatingStatement)
        );
        assert_eq!(
            reason("SELECT * FROM ucla_player_stats; -- cleanup\nDELETE FROM ucla_player_stats"),
            Some(ReasonCode::MutatingStatement)
        );
        assert!(validator()
            .validate("SELECT * FROM ucla_player_stats; /* DROP */ SELECT 1 FROM ucla_player_stats")
            .is_accepted());
    }

    #[test]
    fn test_rejects_empty() {
        assert_eq!(reason("   \n\t"), Some(ReasonCode::Empty));
    }

    #[test]
    fn test_rejects_union_injection() {
        assert_eq!(
            reason("SELECT Name FROM ucla_player_stats UNION SELECT sql FROM sqlite_master --"),
            Some(ReasonCode::UnionInjection)
        );
    }

    #[test]
    fn test_each_forbidden_token_has_its_own_reason() {
        let cases = [
            ("SELECT EXTRACT(YEAR FROM game_date) FROM ucla_player_stats", ReasonCode::ForbiddenExtract),
            ("SELECT game_date + INTERVAL '3' DAY FROM ucla_player_stats", ReasonCode::ForbiddenInterval),
            ("SELECT STDDEV(Pts) FROM ucla_player_stats", ReasonCode::ForbiddenStddev),
            ("SELECT VARIANCE(Pts) FROM ucla_player_stats", ReasonCode::ForbiddenVariance),
            ("SELECT * FROM ucla_player_stats WHERE Name ILIKE '%rice%'", ReasonCode::ForbiddenIlike),
            ("SELECT Pts::text FROM ucla_player_stats", ReasonCode::ForbiddenCastOperator),
            ("SELECT * FROM ucla_player_stats WHERE Name SIMILAR TO 'R%'", ReasonCode::ForbiddenSimilarTo),
            ("SELECT SPLIT_PART(Name, ',', 1) FROM ucla_player_stats", ReasonCode::ForbiddenSplitPart),
        ];
        for (sql, expected) in cases {
            assert_eq!(reason(sql), Some(expected), "{}", sql);
        }
    }

    #[test]
    fn test_forbidden_words_inside_literals_are_ignored() {
        assert!(validator()
            .validate("SELECT * FROM ucla_player_stats WHERE Opponent = 'Interval State'")
            .is_accepted());
    }

    #[test]
    fn test_aggregate_in_group_by() {
        assert_eq!(
            reason("SELECT Opponent FROM ucla_player_stats GROUP BY Opponent, AVG(Pts)"),
            Some(ReasonCode::AggregateInGroupBy)
        );
        // Aggregates after the GROUP BY clause are fine
        assert!(validator()
            .validate("SELECT Name FROM ucla_player_stats GROUP BY Name ORDER BY AVG(Pts) DESC")
            .is_accepted());
    }

    #[test]
    fn test_cte_in_where() {
        assert_eq!(
            reason(
                "SELECT * FROM ucla_player_stats WHERE game_date IN \
                 (WITH close_games AS (SELECT game_date FROM ucla_player_stats) SELECT * FROM close_games)"
            ),
            Some(ReasonCode::CteInWhere)
        );
    }

    #[test]
    fn test_not_a_select_and_wrong_table() {
        assert_eq!(reason("PRAGMA table_info(ucla_player_stats)"), Some(ReasonCode::NotASelect));
        assert_eq!(reason("SELECT * FROM players"), Some(ReasonCode::WrongTable));
        assert_eq!(
            reason("SELECT * FROM ucla_player_stats_archive"),
            Some(ReasonCode::WrongTable)
        );
        assert!(validator().validate("select * from UCLA_PLAYER_STATS").is_accepted());
    }

    #[test]
    fn test_rule_order_first_match_wins() {
        // Both a forbidden token and a missing table: the earlier rule decides
        assert_eq!(reason("SELECT Name ILIKE 'x' FROM players"), Some(ReasonCode::ForbiddenIlike));
    }

    #[test]
    fn test_reason_codes_serialize_kebab_case() {
        let json = serde_json::to_string(&ValidationOutcome::Rejected(ReasonCode::CteInWhere)).unwrap();
        assert_eq!(json, r#"{"verdict":"rejected","reason":"cte-in-where"}"#);
    }
}
