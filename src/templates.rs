//! Known-hard question shapes
//!
//! Some questions are answered unreliably by free generation. Each
//! [`KnownShape`] pairs a structural description (keywords, named players,
//! the kind of dialect violation it shows up with) with a hand-written query.
//! The library is data: the built-in set can be replaced from a JSON file.

use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

/// Placeholder substituted with the authorized table name.
pub const TABLE_PLACEHOLDER: &str = "{table}";

/// Where a shape is recognised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShapeTrigger {
    /// Matched against the user's question before any generation happens
    Question,
    /// Matched against generated SQL that has an aggregate inside GROUP BY
    AggregateInGroupBy,
    /// Matched against generated SQL that has a CTE inside WHERE
    CteInWhere,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnownShape {
    pub name: String,
    pub trigger: ShapeTrigger,
    /// All must occur in the matched text (case-insensitive)
    #[serde(default)]
    pub keywords: Vec<String>,
    /// Canonical `Last, First` names the template is written for
    #[serde(default)]
    pub players: Vec<String>,
    /// How many of `players` must be mentioned, by any part of their name
    #[serde(default)]
    pub min_player_mentions: usize,
    pub sql: String,
}

impl KnownShape {
    fn matches(&self, text: &str) -> bool {
        let lower = text.to_lowercase();
        if !self.keywords.iter().all(|k| lower.contains(&k.to_lowercase())) {
            return false;
        }
        if self.min_player_mentions == 0 {
            return true;
        }

        let words: HashSet<&str> = lower
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .collect();
        let mentioned = self
            .players
            .iter()
            .filter(|player| name_parts(player).iter().any(|part| words.contains(part.as_str())))
            .count();
        mentioned >= self.min_player_mentions
    }

    pub fn render(&self, table: &str) -> String {
        self.sql.replace(TABLE_PLACEHOLDER, table)
    }
}

fn name_parts(player: &str) -> Vec<String> {
    player
        .split(|c: char| !c.is_alphanumeric())
        .filter(|part| part.chars().count() >= 2)
        .map(|part| part.to_lowercase())
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateLibrary {
    shapes: Vec<KnownShape>,
}

impl TemplateLibrary {
    pub fn new(shapes: Vec<KnownShape>) -> Result<Self> {
        for shape in &shapes {
            if !shape.sql.contains(TABLE_PLACEHOLDER) {
                return Err(PipelineError::Template(format!(
                    "template '{}' does not reference {}",
                    shape.name, TABLE_PLACEHOLDER
                )));
            }
            if shape.min_player_mentions > shape.players.len() {
                return Err(PipelineError::Template(format!(
                    "template '{}' requires {} player mentions but lists {} players",
                    shape.name,
                    shape.min_player_mentions,
                    shape.players.len()
                )));
            }
        }
        Ok(Self { shapes })
    }

    pub fn empty() -> Self {
        Self { shapes: Vec::new() }
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let shapes: Vec<KnownShape> = serde_json::from_str(json)?;
        Self::new(shapes)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&content)
    }

    pub fn shapes(&self) -> &[KnownShape] {
        &self.shapes
    }

    pub fn get(&self, name: &str) -> Option<&KnownShape> {
        self.shapes.iter().find(|s| s.name == name)
    }

    /// First shape with the given trigger whose features match `text`.
    pub fn find(&self, trigger: ShapeTrigger, text: &str) -> Option<&KnownShape> {
        self.shapes
            .iter()
            .filter(|s| s.trigger == trigger)
            .find(|s| s.matches(text))
    }

    /// The shapes shipped with the application.
    pub fn builtin() -> Self {
        let close_games_players = vec!["Rice, Kiki".to_string(), "Jones, Londynn".to_string()];

        Self {
            shapes: vec![
                KnownShape {
                    name: "close_games_comparison".to_string(),
                    trigger: ShapeTrigger::Question,
                    keywords: vec!["close".to_string(), "games".to_string()],
                    players: close_games_players.clone(),
                    min_player_mentions: 2,
                    sql: CLOSE_GAMES_COMPARISON.to_string(),
                },
                KnownShape {
                    name: "close_games_cte".to_string(),
                    trigger: ShapeTrigger::CteInWhere,
                    keywords: vec!["close".to_string()],
                    players: close_games_players,
                    min_player_mentions: 1,
                    sql: CLOSE_GAMES_BY_MARGIN.to_string(),
                },
                KnownShape {
                    name: "opponent_strength".to_string(),
                    trigger: ShapeTrigger::AggregateInGroupBy,
                    keywords: vec!["opponent_strength".to_string()],
                    players: Vec::new(),
                    min_player_mentions: 0,
                    sql: OPPONENT_STRENGTH.to_string(),
                },
            ],
        }
    }
}

impl Default for TemplateLibrary {
    fn default() -> Self {
        Self::builtin()
    }
}

const CLOSE_GAMES_COMPARISON: &str = r#"SELECT
  Name,
  COUNT(*) as games_played,
  ROUND(AVG(Pts), 1) as avg_pts,
  ROUND(AVG(Ast), 1) as avg_ast,
  ROUND(AVG(Reb), 1) as avg_reb,
  ROUND(AVG("TO"), 1) as avg_to,
  ROUND(CAST(SUM(FGM) AS REAL) / NULLIF(SUM(FGA), 0) * 100, 1) as fg_pct,
  ROUND(CAST(SUM("3PTM") AS REAL) / NULLIF(SUM("3PTA"), 0) * 100, 1) as three_pt_pct
FROM {table}
WHERE Name IN ('Rice, Kiki', 'Jones, Londynn')
  AND Name NOT IN ('Totals', 'TM', 'Team')
GROUP BY Name
ORDER BY avg_pts DESC"#;

const CLOSE_GAMES_BY_MARGIN: &str = r#"SELECT
  Name,
  COUNT(*) as games_played,
  ROUND(AVG(Pts), 1) as avg_pts,
  ROUND(AVG(Ast), 1) as avg_ast,
  ROUND(AVG(Reb), 1) as avg_reb,
  ROUND(AVG("TO"), 1) as avg_to,
  ROUND(CAST(SUM(FGM) AS REAL) / NULLIF(SUM(FGA), 0) * 100, 1) as fg_pct,
  ROUND(CAST(SUM("3PTM") AS REAL) / NULLIF(SUM("3PTA"), 0) * 100, 1) as three_pt_pct
FROM {table}
WHERE Name IN ('Rice, Kiki', 'Jones, Londynn')
  AND Name NOT IN ('Totals', 'TM', 'Team')
  AND game_date IN (
    SELECT game_date
    FROM {table}
    WHERE Name = 'Totals'
    AND Pts BETWEEN 70 AND 90
  )
GROUP BY Name
ORDER BY avg_pts DESC"#;

const OPPONENT_STRENGTH: &str = r#"SELECT
  'vs_all_opponents' as analysis_type,
  COUNT(*) as games_played,
  ROUND(AVG(Pts), 1) as avg_points,
  ROUND(AVG(Reb), 1) as avg_rebounds,
  ROUND(CAST(SUM(FGM) AS REAL) / NULLIF(SUM(FGA), 0) * 100, 1) as fg_percentage,
  ROUND(AVG(Blk), 1) as avg_blocks,
  GROUP_CONCAT(DISTINCT Opponent) as opponents_faced
FROM {table}
WHERE Name = 'Betts, Lauren'
  AND Name NOT IN ('Totals', 'TM', 'Team')"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::validator::SafetyValidator;

    #[test]
    fn test_close_games_question_needs_both_players() {
        let library = TemplateLibrary::builtin();
        let shape = library.find(
            ShapeTrigger::Question,
            "Compare Kiki Rice and Londynn Jones in close games",
        );
        assert_eq!(shape.map(|s| s.name.as_str()), Some("close_games_comparison"));

        assert!(library
            .find(ShapeTrigger::Question, "How did Kiki Rice play in close games?")
            .is_none());
        assert!(library
            .find(ShapeTrigger::Question, "Compare Rice and Jones in blowouts")
            .is_none());
    }

    #[test]
    fn test_sql_triggers_do_not_match_questions() {
        let library = TemplateLibrary::builtin();
        assert!(library
            .find(ShapeTrigger::AggregateInGroupBy, "SELECT Name FROM t GROUP BY AVG(Pts)")
            .is_none());
        assert!(library
            .find(
                ShapeTrigger::AggregateInGroupBy,
                "SELECT opponent_strength FROM t GROUP BY AVG(Pts)"
            )
            .is_some());
    }

    #[test]
    fn test_builtin_templates_validate() {
        let validator = SafetyValidator::new("ucla_player_stats");
        for shape in TemplateLibrary::builtin().shapes() {
            let sql = shape.render("ucla_player_stats");
            assert!(validator.validate(&sql).is_accepted(), "{}", shape.name);
        }
    }

    #[test]
    fn test_load_from_json() {
        let json = r#"[{
            "name": "season_high",
            "trigger": "question",
            "keywords": ["season high"],
            "sql": "SELECT Name, MAX(Pts) FROM {table} GROUP BY Name"
        }]"#;
        let library = TemplateLibrary::from_json_str(json).unwrap();
        let shape = library
            .find(ShapeTrigger::Question, "Who has the season high?")
            .unwrap();
        assert_eq!(shape.render("stats"), "SELECT Name, MAX(Pts) FROM stats GROUP BY Name");
    }

    #[test]
    fn test_template_without_placeholder_is_rejected() {
        let json = r#"[{"name": "bad", "trigger": "question", "sql": "SELECT 1"}]"#;
        assert!(matches!(
            TemplateLibrary::from_json_str(json),
            Err(PipelineError::Template(_))
        ));
    }
}
