//! Lightweight SQL scanner
//!
//! Splits a candidate statement into words, quoted identifiers, string
//! literals and punctuation, and locates clause boundaries (WHERE, GROUP BY)
//! by paren depth. Candidates come from a text generator and are frequently
//! malformed, so scanning never fails: anything unrecognised becomes a
//! single-character `Other` token.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    /// Bare identifier, keyword or number (`Pts`, `SELECT`, `3PTM`, `10`)
    Word,
    /// `"..."`, `` `...` `` or `[...]`
    QuotedIdent,
    /// `'...'` with `''` escapes
    StringLit,
    Comment,
    OpenParen,
    CloseParen,
    Semicolon,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Token<'a> {
    pub kind: TokenKind,
    pub text: &'a str,
    /// Byte offset into the scanned string
    pub start: usize,
}

impl<'a> Token<'a> {
    pub fn end(&self) -> usize {
        self.start + self.text.len()
    }

    pub fn is_word(&self, word: &str) -> bool {
        self.kind == TokenKind::Word && self.text.eq_ignore_ascii_case(word)
    }

    /// Identifier text with surrounding quotes removed.
    pub fn ident(&self) -> &'a str {
        match self.kind {
            TokenKind::QuotedIdent if self.text.len() >= 2 => &self.text[1..self.text.len() - 1],
            _ => self.text,
        }
    }
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

pub fn tokenize(sql: &str) -> Vec<Token<'_>> {
    let mut tokens = Vec::new();
    let mut chars = sql.char_indices().peekable();

    while let Some((start, c)) = chars.next() {
        if c.is_whitespace() {
            continue;
        }

        let kind = match c {
            '(' => TokenKind::OpenParen,
            ')' => TokenKind::CloseParen,
            ';' => TokenKind::Semicolon,
            '\'' => {
                // '' inside a literal is an escaped quote, not a terminator
                loop {
                    match chars.next() {
                        Some((_, '\'')) => {
                            if matches!(chars.peek(), Some((_, '\''))) {
                                chars.next();
                            } else {
                                break;
                            }
                        }
                        Some(_) => {}
                        None => break,
                    }
                }
                TokenKind::StringLit
            }
            '"' | '`' | '[' => {
                let close = match c {
                    '[' => ']',
                    other => other,
                };
                for (_, next) in chars.by_ref() {
                    if next == close {
                        break;
                    }
                }
                TokenKind::QuotedIdent
            }
            '-' if matches!(chars.peek(), Some((_, '-'))) => {
                while let Some(&(_, next)) = chars.peek() {
                    if next == '\n' {
                        break;
                    }
                    chars.next();
                }
                TokenKind::Comment
            }
            '/' if matches!(chars.peek(), Some((_, '*'))) => {
                chars.next();
                let mut prev = '\0';
                for (_, next) in chars.by_ref() {
                    if prev == '*' && next == '/' {
                        break;
                    }
                    prev = next;
                }
                TokenKind::Comment
            }
            c if is_word_char(c) => {
                while let Some(&(_, next)) = chars.peek() {
                    if !is_word_char(next) {
                        break;
                    }
                    chars.next();
                }
                TokenKind::Word
            }
            _ => TokenKind::Other,
        };

        let end = chars.peek().map(|&(i, _)| i).unwrap_or(sql.len());
        tokens.push(Token {
            kind,
            text: &sql[start..end],
            start,
        });
    }

    tokens
}

/// Which clause a span belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Clause {
    Where,
    GroupBy,
}

/// Token index range `[start, end)` covering the body of one clause
/// (the introducing keyword excluded).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClauseSpan {
    pub clause: Clause,
    pub start: usize,
    pub end: usize,
}

const SET_OPERATORS: [&str; 3] = ["UNION", "INTERSECT", "EXCEPT"];

fn ends_clause(tokens: &[Token<'_>], idx: usize, clause: Clause) -> bool {
    let token = &tokens[idx];
    if token.kind != TokenKind::Word {
        return false;
    }
    let followed_by_by = tokens.get(idx + 1).map_or(false, |t| t.is_word("BY"));

    if SET_OPERATORS.iter().any(|op| token.is_word(op))
        || token.is_word("HAVING")
        || token.is_word("LIMIT")
        || token.is_word("WINDOW")
        || (token.is_word("ORDER") && followed_by_by)
    {
        return true;
    }
    clause == Clause::Where && token.is_word("GROUP") && followed_by_by
}

/// Locate every WHERE and GROUP BY clause, at any nesting depth.
///
/// A clause runs until a terminating keyword at its own depth, a `;`, or a
/// `)` that closes the scope the clause was opened in.
pub fn clause_spans(tokens: &[Token<'_>]) -> Vec<ClauseSpan> {
    let mut spans = Vec::new();

    for (idx, token) in tokens.iter().enumerate() {
        let (clause, body_start) = if token.is_word("WHERE") {
            (Clause::Where, idx + 1)
        } else if token.is_word("GROUP") && tokens.get(idx + 1).map_or(false, |t| t.is_word("BY")) {
            (Clause::GroupBy, idx + 2)
        } else {
            continue;
        };

        let mut depth = 0usize;
        let mut end = tokens.len();
        for (pos, t) in tokens.iter().enumerate().skip(body_start) {
            match t.kind {
                TokenKind::OpenParen => depth += 1,
                TokenKind::CloseParen => {
                    if depth == 0 {
                        end = pos;
                        break;
                    }
                    depth -= 1;
                }
                TokenKind::Semicolon if depth == 0 => {
                    end = pos;
                    break;
                }
                TokenKind::Word if depth == 0 && ends_clause(tokens, pos, clause) => {
                    end = pos;
                    break;
                }
                _ => {}
            }
        }

        spans.push(ClauseSpan {
            clause,
            start: body_start.min(end),
            end,
        });
    }

    spans
}

pub const AGGREGATES: [&str; 7] = ["AVG", "SUM", "COUNT", "MIN", "MAX", "TOTAL", "GROUP_CONCAT"];

/// True if any GROUP BY clause contains an aggregate call.
pub fn has_aggregate_in_group_by(tokens: &[Token<'_>]) -> bool {
    clause_spans(tokens)
        .iter()
        .filter(|span| span.clause == Clause::GroupBy)
        .any(|span| {
            let body = &tokens[span.start..span.end];
            body.windows(2).any(|pair| {
                AGGREGATES.iter().any(|agg| pair[0].is_word(agg))
                    && pair[1].kind == TokenKind::OpenParen
            })
        })
}

/// True if any WHERE clause contains `WITH <name> AS (`.
pub fn has_cte_in_where(tokens: &[Token<'_>]) -> bool {
    clause_spans(tokens)
        .iter()
        .filter(|span| span.clause == Clause::Where)
        .any(|span| {
            let body = &tokens[span.start..span.end];
            body.windows(4).any(|w| {
                w[0].is_word("WITH")
                    && matches!(w[1].kind, TokenKind::Word | TokenKind::QuotedIdent)
                    && w[2].is_word("AS")
                    && w[3].kind == TokenKind::OpenParen
            })
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(sql: &str) -> Vec<(TokenKind, &str)> {
        tokenize(sql).into_iter().map(|t| (t.kind, t.text)).collect()
    }

    #[test]
    fn test_tokenize_literals_and_identifiers() {
        let tokens = kinds("SELECT \"3PTM\", Name FROM t WHERE Name = 'O''Brien'");
        assert_eq!(tokens[1], (TokenKind::QuotedIdent, "\"3PTM\""));
        assert_eq!(tokens[2], (TokenKind::Other, ","));
        assert_eq!(tokens.last().unwrap(), &(TokenKind::StringLit, "'O''Brien'"));
    }

    #[test]
    fn test_digit_led_identifier_is_one_word() {
        let tokens = kinds("SUM(3PTM)");
        assert_eq!(tokens[2], (TokenKind::Word, "3PTM"));
    }

    #[test]
    fn test_unterminated_literal_runs_to_end() {
        let tokens = kinds("SELECT 'abc");
        assert_eq!(tokens[1], (TokenKind::StringLit, "'abc"));
    }

    #[test]
    fn test_group_by_span_stops_at_order_by() {
        let sql = "SELECT Name FROM t GROUP BY Name ORDER BY AVG(Pts) DESC";
        let tokens = tokenize(sql);
        assert!(!has_aggregate_in_group_by(&tokens));

        let sql = "SELECT Name FROM t GROUP BY Name, AVG(Pts)";
        assert!(has_aggregate_in_group_by(&tokenize(sql)));
    }

    #[test]
    fn test_group_by_span_inside_subquery() {
        let sql = "SELECT * FROM (SELECT Name FROM t GROUP BY AVG(Pts)) x";
        assert!(has_aggregate_in_group_by(&tokenize(sql)));

        let sql = "SELECT * FROM (SELECT Name FROM t GROUP BY Name) x WHERE COUNT(1) > 0";
        assert!(!has_aggregate_in_group_by(&tokenize(sql)));
    }

    #[test]
    fn test_cte_in_where() {
        let sql = "SELECT * FROM t WHERE game_date IN (WITH close AS (SELECT 1) SELECT * FROM close)";
        assert!(has_cte_in_where(&tokenize(sql)));

        let sql = "WITH close AS (SELECT 1) SELECT * FROM t WHERE Pts > 1";
        assert!(!has_cte_in_where(&tokenize(sql)));
    }
}
