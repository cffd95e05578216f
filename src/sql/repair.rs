//! Dialect Repair Engine
//!
//! Rewrites the PostgreSQL-flavoured SQL a general text generator tends to
//! emit into the SQLite subset the store accepts. Rewrites are deterministic
//! and applying the engine to its own output changes nothing.

use crate::sql::scan::{self, TokenKind};
use crate::templates::{ShapeTrigger, TemplateLibrary};
use lazy_static::lazy_static;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::sync::Arc;
use tracing::{debug, info, warn};

lazy_static! {
    static ref CTE_INTRO: Regex = Regex::new(r"(?i)\bWITH\s+\w+\s+AS\s*\(").unwrap();
    static ref DOUBLED_QUOTES: Regex = Regex::new(r#"""([^"]+)"""#).unwrap();
    static ref EXTRACT_YEAR: Regex =
        Regex::new(r"(?i)\bEXTRACT\s*\(\s*YEAR\s+FROM\s+([^)]+?)\s*\)").unwrap();
    static ref EXTRACT_MONTH: Regex =
        Regex::new(r"(?i)\bEXTRACT\s*\(\s*MONTH\s+FROM\s+([^)]+?)\s*\)").unwrap();
    static ref INTERVAL_DAYS: Regex = Regex::new(
        r#"(?i)((?:\w+\.)?(?:\w+|"[^"]+")(?:\([^()]*\))?)\s*([+-])\s*INTERVAL\s*'(\d+)'\s*DAYS?\b"#
    )
    .unwrap();
    static ref CAST_SUFFIX: Regex = Regex::new(r"(?i)::\s*(?:text|integer|float|date)\b").unwrap();
    static ref ILIKE: Regex = Regex::new(r"(?i)\bILIKE\b").unwrap();
    static ref STDDEV: Regex = Regex::new(r"(?i)\bSTDDEV\s*\(\s*([^()]+?)\s*\)").unwrap();
    static ref WHERE_CLOSE: Regex = Regex::new(r"(?i)\bWHERE\s*\)").unwrap();
    static ref WHERE_AND: Regex = Regex::new(r"(?i)\bWHERE(?:\s+AND\b)+").unwrap();
}

/// Identifiers that must always be double-quoted in the target dialect.
const FORCE_QUOTED: [&str; 3] = ["3PTM", "3PTA", "TO"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairRule {
    TemplateSubstitution,
    CteStripped,
    CollapsedQuotes,
    ExtractYear,
    ExtractMonth,
    IntervalArithmetic,
    CastStripped,
    IlikeToLike,
    StddevApproximation,
    QuotedIdentifier,
    DanglingWhere,
    BalancedParens,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepairReport {
    pub sql: String,
    pub applied: Vec<RepairRule>,
    /// Name of the known shape whose template replaced the query
    pub template: Option<String>,
    /// Set when a rewrite only approximates the original expression
    pub approximate: bool,
}

impl RepairReport {
    pub fn changed(&self) -> bool {
        !self.applied.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct DialectRepairEngine {
    table: String,
    templates: Arc<TemplateLibrary>,
    allow_approximate: bool,
}

impl DialectRepairEngine {
    pub fn new(table: impl Into<String>, templates: Arc<TemplateLibrary>) -> Self {
        Self {
            table: table.into(),
            templates,
            allow_approximate: false,
        }
    }

    /// Permit rewrites that are not exact equivalents (STDDEV).
    pub fn with_approximate_rewrites(mut self, allow: bool) -> Self {
        self.allow_approximate = allow;
        self
    }

    pub fn repair(&self, sql: &str) -> String {
        self.repair_with_report(sql).sql
    }

    pub fn repair_with_report(&self, sql: &str) -> RepairReport {
        let mut report = RepairReport {
            sql: sql.to_string(),
            applied: Vec::new(),
            template: None,
            approximate: false,
        };
        if sql.trim().is_empty() {
            return report;
        }

        self.apply_structural(&mut report);

        apply_regex(&mut report, &DOUBLED_QUOTES, RepairRule::CollapsedQuotes, r#""${1}""#);
        apply_regex(&mut report, &EXTRACT_YEAR, RepairRule::ExtractYear, "strftime('%Y', ${1})");
        apply_regex(&mut report, &EXTRACT_MONTH, RepairRule::ExtractMonth, "strftime('%m', ${1})");
        apply_with(&mut report, &INTERVAL_DAYS, RepairRule::IntervalArithmetic, |caps: &Captures| {
            format!("date({}, '{}{} days')", &caps[1], &caps[2], &caps[3])
        });
        apply_regex(&mut report, &CAST_SUFFIX, RepairRule::CastStripped, "");
        apply_regex(&mut report, &ILIKE, RepairRule::IlikeToLike, "LIKE");

        if STDDEV.is_match(&report.sql) {
            if self.allow_approximate {
                apply_regex(
                    &mut report,
                    &STDDEV,
                    RepairRule::StddevApproximation,
                    "SQRT(AVG((${1} - sub_avg) * (${1} - sub_avg)))",
                );
                report.approximate = true;
                warn!(
                    approximate = true,
                    "STDDEV rewritten to a variance expansion that assumes a precomputed sub_avg column"
                );
            } else {
                debug!("STDDEV left in place; approximate rewrites are disabled");
            }
        }

        if let Some(quoted) = quote_identifiers(&report.sql) {
            report.sql = quoted;
            report.applied.push(RepairRule::QuotedIdentifier);
        }

        // AND first, so `WHERE AND )` collapses fully in one pass.
        let sql = WHERE_AND.replace_all(&report.sql, "WHERE").into_owned();
        let sql = WHERE_CLOSE.replace_all(&sql, ")").into_owned();
        if sql != report.sql {
            report.sql = sql;
            report.applied.push(RepairRule::DanglingWhere);
        }

        if let Some(balanced) = balance_parens(&report.sql) {
            report.sql = balanced;
            report.applied.push(RepairRule::BalancedParens);
        }

        if report.changed() {
            info!("Applied SQLite compatibility fixes: {:?}", report.applied);
        }
        report
    }

    fn apply_structural(&self, report: &mut RepairReport) {
        let tokens = scan::tokenize(&report.sql);

        if scan::has_aggregate_in_group_by(&tokens) {
            if let Some(shape) = self
                .templates
                .find(ShapeTrigger::AggregateInGroupBy, &report.sql)
            {
                info!("Replacing query with '{}' template", shape.name);
                report.sql = shape.render(&self.table);
                report.template = Some(shape.name.clone());
                report.applied.push(RepairRule::TemplateSubstitution);
                return;
            }
        }

        if scan::has_cte_in_where(&tokens) {
            if let Some(shape) = self.templates.find(ShapeTrigger::CteInWhere, &report.sql) {
                info!("Replacing query with '{}' template", shape.name);
                report.sql = shape.render(&self.table);
                report.template = Some(shape.name.clone());
                report.applied.push(RepairRule::TemplateSubstitution);
            } else {
                report.sql = CTE_INTRO.replace_all(&report.sql, "(").into_owned();
                report.applied.push(RepairRule::CteStripped);
            }
        }
    }
}

fn apply_regex(report: &mut RepairReport, pattern: &Regex, rule: RepairRule, replacement: &str) {
    apply_with(report, pattern, rule, |caps: &Captures| {
        let mut expanded = String::new();
        caps.expand(replacement, &mut expanded);
        expanded
    });
}

fn apply_with<F>(report: &mut RepairReport, pattern: &Regex, rule: RepairRule, replacement: F)
where
    F: FnMut(&Captures) -> String,
{
    let rewritten = match pattern.replace_all(&report.sql, replacement) {
        Cow::Owned(rewritten) => Some(rewritten),
        Cow::Borrowed(_) => None,
    };
    if let Some(rewritten) = rewritten {
        report.sql = rewritten;
        report.applied.push(rule);
    }
}

/// Double-quote bare `3PTM`, `3PTA` and `TO`. Quoted identifiers, string
/// literals and longer words containing them are left alone, as is `TO` in
/// keyword position (`SIMILAR TO`, `RENAME TO`, `to(`).
fn quote_identifiers(sql: &str) -> Option<String> {
    let tokens: Vec<_> = scan::tokenize(sql)
        .into_iter()
        .filter(|t| t.kind != TokenKind::Comment)
        .collect();

    let mut edits = Vec::new();
    for (idx, token) in tokens.iter().enumerate() {
        if token.kind != TokenKind::Word {
            continue;
        }
        let Some(canonical) = FORCE_QUOTED
            .iter()
            .find(|name| token.text.eq_ignore_ascii_case(name))
        else {
            continue;
        };

        if *canonical == "TO" {
            let prev_is_keyword = idx
                .checked_sub(1)
                .and_then(|p| tokens.get(p))
                .map_or(false, |p| p.is_word("SIMILAR") || p.is_word("RENAME"));
            let is_call = tokens
                .get(idx + 1)
                .map_or(false, |n| n.kind == TokenKind::OpenParen);
            if prev_is_keyword || is_call {
                continue;
            }
        }
        edits.push((token.start, token.end(), format!("\"{}\"", canonical)));
    }

    if edits.is_empty() {
        return None;
    }

    let mut out = String::with_capacity(sql.len() + edits.len() * 2);
    let mut cursor = 0;
    for (start, end, replacement) in edits {
        out.push_str(&sql[cursor..start]);
        out.push_str(&replacement);
        cursor = end;
    }
    out.push_str(&sql[cursor..]);
    Some(out)
}

/// Count-based paren balancing. Missing closers are appended (ahead of a
/// trailing `;` and a trailing `--` comment); surplus closers are removed
/// only from the tail, so a surplus in the middle of the statement survives.
fn balance_parens(sql: &str) -> Option<String> {
    let tokens = scan::tokenize(sql);
    let opens = tokens.iter().filter(|t| t.kind == TokenKind::OpenParen).count();
    let closes = tokens.iter().filter(|t| t.kind == TokenKind::CloseParen).count();
    if opens == closes {
        return None;
    }

    let (code, line_comment) = match tokens.last() {
        Some(last) if last.kind == TokenKind::Comment && last.text.starts_with("--") => {
            (&sql[..last.start], Some(last.text))
        }
        _ => (sql, None),
    };

    let trimmed = code.trim_end();
    let (mut body, tail) = match trimmed.strip_suffix(';') {
        Some(body) => (body.trim_end().to_string(), ";"),
        None => (trimmed.to_string(), ""),
    };

    if opens > closes {
        body.push_str(&")".repeat(opens - closes));
    } else {
        for _ in 0..(closes - opens) {
            let kept = body.trim_end().len();
            body.truncate(kept);
            if !body.ends_with(')') {
                break;
            }
            body.pop();
        }
    }

    let mut balanced = format!("{}{}", body, tail);
    if let Some(comment) = line_comment {
        balanced.push(' ');
        balanced.push_str(comment);
    }
    if balanced == sql {
        None
    } else {
        Some(balanced)
    }
}
