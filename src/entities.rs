//! Entity extraction
//!
//! Pulls players, jersey numbers, opponents and statistic filters out of a
//! question, then resolves the mentioned names against the values actually
//! stored in the table so prompts can use canonical spellings.

use crate::config::PipelineConfig;
use crate::error::Result;
use crate::fuzzy_matcher::{FuzzyMatcher, MatchCache};
use crate::llm::TextGenerator;
use crate::schema::AGGREGATE_ROW_NAMES;
use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

lazy_static! {
    static ref JSON_OBJECT: Regex = Regex::new(r"(?s)(\{.*\})").unwrap();
    static ref JERSEY_NUMBER: Regex = Regex::new(r"(?i)#(\d+)|No\. (\d+)|number (\d+)").unwrap();
    static ref COMPARISON: Regex =
        Regex::new(r"(?i)(more than|less than|at least|at most|>=|<=|>|<|=)").unwrap();
    static ref NUMBER: Regex = Regex::new(r"\b(\d+(?:\.\d+)?)\b").unwrap();
}

/// Statistic keywords recognised without the generator, with their canonical names.
const STAT_KEYWORDS: [(&str, &str); 12] = [
    ("points", "points"),
    ("rebounds", "rebounds"),
    ("assists", "assists"),
    ("steals", "steals"),
    ("blocks", "blocks"),
    ("turnovers", "turnovers"),
    ("pts", "points"),
    ("reb", "rebounds"),
    ("ast", "assists"),
    ("stl", "steals"),
    ("blk", "blocks"),
    ("to", "turnovers"),
];

/// Structured hints about a question. Every field is optional; an empty set
/// only makes the generation prompt less specific.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntitySet {
    /// Canonical `Name` values
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub player_names: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub player_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opponent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub statistic: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comparison: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclude_totals: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_comparison_query: Option<bool>,
}

impl EntitySet {
    pub fn is_empty(&self) -> bool {
        *self == EntitySet::default()
    }

    pub fn has_players(&self) -> bool {
        !self.player_names.is_empty()
    }

    /// JSON text for prompts, or `None` when there is nothing to say.
    pub fn render_for_prompt(entities: Option<&EntitySet>) -> String {
        match entities {
            Some(set) if !set.is_empty() => {
                serde_json::to_string(set).unwrap_or_else(|_| "None".to_string())
            }
            _ => "None".to_string(),
        }
    }

    /// Lenient reading of generator output: accepts a single name where a
    /// list is expected and numbers written as strings.
    fn from_loose_json(value: &Value) -> Self {
        let text = |key: &str| -> Option<String> {
            match value.get(key)? {
                Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            }
        };
        let flag = |key: &str| value.get(key).and_then(Value::as_bool);

        let player_names = match value.get("player_names").or_else(|| value.get("player_name")) {
            Some(Value::String(name)) => vec![name.clone()],
            Some(Value::Array(names)) => names
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
            _ => Vec::new(),
        };

        Self {
            player_names,
            player_number: text("player_number"),
            opponent: text("opponent"),
            statistic: text("statistic"),
            comparison: text("comparison"),
            value: text("value").and_then(|v| v.parse().ok()),
            exclude_totals: flag("exclude_totals"),
            is_comparison_query: flag("is_comparison_query"),
        }
    }
}

#[async_trait]
pub trait EntityExtractor: Send + Sync {
    async fn extract(&self, question: &str) -> Result<EntitySet>;
}

/// Distinct column values used as the resolution vocabulary.
pub trait VocabularySource: Send + Sync {
    fn distinct_values(&self, table: &str, column: &str) -> Result<Vec<String>>;
}

/// Known players, jersey numbers and opponents.
#[derive(Debug, Clone, Default)]
pub struct Vocabulary {
    pub players: Vec<String>,
    pub numbers: Vec<String>,
    pub opponents: Vec<String>,
}

impl Vocabulary {
    pub fn load(source: &dyn VocabularySource, table: &str) -> Result<Self> {
        let players: Vec<String> = source
            .distinct_values(table, "Name")?
            .into_iter()
            .filter(|name| !AGGREGATE_ROW_NAMES.contains(&name.as_str()))
            .collect();
        let numbers = source.distinct_values(table, "No")?;
        let opponents = source.distinct_values(table, "Opponent")?;

        info!(
            "Loaded vocabulary: {} players, {} numbers, {} opponents",
            players.len(),
            numbers.len(),
            opponents.len()
        );
        Ok(Self {
            players,
            numbers,
            opponents,
        })
    }
}

/// Generator-backed extractor with a regex fallback and fuzzy resolution.
pub struct LlmEntityExtractor {
    generator: Arc<dyn TextGenerator>,
    vocabulary: Vocabulary,
    matcher: FuzzyMatcher,
    cache: MatchCache,
}

impl LlmEntityExtractor {
    pub fn new(
        generator: Arc<dyn TextGenerator>,
        vocabulary: Vocabulary,
        threshold: f64,
        cache_capacity: usize,
    ) -> Self {
        Self {
            generator,
            vocabulary,
            matcher: FuzzyMatcher::new(threshold),
            cache: MatchCache::new(cache_capacity),
        }
    }

    pub fn from_config(
        generator: Arc<dyn TextGenerator>,
        source: &dyn VocabularySource,
        config: &PipelineConfig,
    ) -> Result<Self> {
        let vocabulary = Vocabulary::load(source, &config.table_name)?;
        Ok(Self::new(
            generator,
            vocabulary,
            config.fuzzy_threshold,
            config.cache_capacity,
        ))
    }

    pub fn cache(&self) -> &MatchCache {
        &self.cache
    }

    fn build_prompt(question: &str) -> String {
        format!(
            r#"Extract entities from this UCLA women's basketball statistics query.
Return a JSON object with these fields:
- player_names: Array of player names mentioned
- player_number: Jersey number if mentioned
- opponent: Opponent team if mentioned
- statistic: Statistic mentioned (points, rebounds, assists, etc.)
- comparison: Comparison operators (>, <, =, etc.)
- value: Numeric value for comparison
- exclude_totals: true if query wants individual players only
- is_comparison_query: true if comparing multiple players

Query: {}

JSON output:"#,
            question
        )
    }

    /// Regex-only extraction used when the generator is unavailable or
    /// returns something that is not JSON.
    pub fn pattern_extract(&self, question: &str) -> EntitySet {
        let mut entities = EntitySet::default();

        let jersey = JERSEY_NUMBER.captures(question);
        if let Some(caps) = &jersey {
            entities.player_number = caps
                .iter()
                .skip(1)
                .flatten()
                .next()
                .map(|m| m.as_str().to_string());
        }
        let jersey_span = jersey.and_then(|caps| caps.get(0)).map(|m| m.range());

        let words: Vec<&str> = question
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .collect();
        let lower: HashSet<String> = words.iter().map(|w| w.to_lowercase()).collect();

        entities.statistic = STAT_KEYWORDS
            .iter()
            .find(|(keyword, _)| {
                // "to" is an ordinary English word; only the column spelling counts
                if *keyword == "to" {
                    words.contains(&"TO")
                } else {
                    lower.contains(*keyword)
                }
            })
            .map(|(_, canonical)| canonical.to_string());

        entities.comparison = COMPARISON
            .captures(question)
            .map(|caps| caps[1].to_lowercase());

        entities.value = NUMBER
            .captures_iter(question)
            .filter_map(|caps| caps.get(1))
            .find(|m| jersey_span.as_ref().map_or(true, |span| !span.contains(&m.start())))
            .and_then(|m| m.as_str().parse().ok());

        // Surname or given name mentioned on its own
        entities.player_names = self
            .vocabulary
            .players
            .iter()
            .filter(|player| {
                player
                    .split(|c: char| !c.is_alphanumeric())
                    .filter(|part| part.chars().count() >= 3)
                    .any(|part| lower.contains(&part.to_lowercase()))
            })
            .cloned()
            .collect();

        entities
    }

    fn resolve(&self, raw: EntitySet) -> EntitySet {
        let mut player_names: Vec<String> = Vec::new();
        for name in &raw.player_names {
            if let Some(resolved) = self.resolve_one("players", name, &self.vocabulary.players) {
                if !player_names.contains(&resolved) {
                    player_names.push(resolved);
                }
            }
        }

        let player_number = raw.player_number.as_deref().and_then(|number| {
            let wanted = number.trim().trim_start_matches('#');
            self.vocabulary
                .numbers
                .iter()
                .find(|n| n.as_str() == wanted)
                .cloned()
        });

        let opponent = raw
            .opponent
            .as_deref()
            .and_then(|o| self.resolve_one("opponents", o, &self.vocabulary.opponents));

        EntitySet {
            player_names,
            player_number,
            opponent,
            ..raw
        }
    }

    fn resolve_one(&self, kind: &str, query: &str, options: &[String]) -> Option<String> {
        if query.trim().is_empty() || options.is_empty() {
            return None;
        }
        if let Some(cached) = self.cache.get(kind, query) {
            return cached;
        }

        let resolved = self
            .matcher
            .find_best_match(query, options)
            .map(|(matched, score)| {
                debug!("Resolved {} '{}' -> '{}' ({:.2})", kind, query, matched, score);
                matched
            });
        if resolved.is_none() {
            debug!("No {} match for '{}'", kind, query);
        }
        self.cache.put(kind, query, resolved.clone());
        resolved
    }
}

#[async_trait]
impl EntityExtractor for LlmEntityExtractor {
    async fn extract(&self, question: &str) -> Result<EntitySet> {
        let raw = match self.generator.generate(&Self::build_prompt(question)).await {
            Ok(response) => match JSON_OBJECT
                .captures(&response)
                .and_then(|caps| serde_json::from_str::<Value>(&caps[1]).ok())
            {
                Some(json) => EntitySet::from_loose_json(&json),
                None => {
                    warn!("Entity response was not JSON; using pattern extraction");
                    self.pattern_extract(question)
                }
            },
            Err(e) => {
                warn!("Entity extraction failed: {}; using pattern extraction", e);
                self.pattern_extract(question)
            }
        };

        Ok(self.resolve(raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipelineError;

    struct Canned(std::result::Result<String, ()>);

    #[async_trait]
    impl TextGenerator for Canned {
        async fn generate(&self, _prompt: &str) -> Result<String> {
            self.0
                .clone()
                .map_err(|_| PipelineError::LlmConnectivity("offline".to_string()))
        }
    }

    fn extractor(response: std::result::Result<&str, ()>) -> LlmEntityExtractor {
        let vocabulary = Vocabulary {
            players: vec![
                "Betts, Lauren".to_string(),
                "Rice, Kiki".to_string(),
                "Jones, Londynn".to_string(),
            ],
            numbers: vec!["51".to_string(), "1".to_string(), "3".to_string()],
            opponents: vec!["USC".to_string(), "Stanford".to_string()],
        };
        LlmEntityExtractor::new(
            Arc::new(Canned(response.map(str::to_string))),
            vocabulary,
            0.80,
            16,
        )
    }

    #[test]
    fn test_render_for_prompt() {
        assert_eq!(EntitySet::render_for_prompt(None), "None");
        assert_eq!(EntitySet::render_for_prompt(Some(&EntitySet::default())), "None");

        let set = EntitySet {
            player_names: vec!["Betts, Lauren".to_string()],
            ..EntitySet::default()
        };
        assert_eq!(
            EntitySet::render_for_prompt(Some(&set)),
            r#"{"player_names":["Betts, Lauren"]}"#
        );
    }

    #[tokio::test]
    async fn test_generator_json_is_resolved() {
        let extractor = extractor(Ok(r#"Sure: {"player_names": ["Lauren Betts", "Nobody Known"],
            "opponent": "usc", "statistic": "points", "value": "20", "player_number": 51}"#));

        let entities = extractor.extract("How many points did Lauren Betts score vs USC?").await.unwrap();
        assert_eq!(entities.player_names, vec!["Betts, Lauren".to_string()]);
        assert_eq!(entities.opponent.as_deref(), Some("USC"));
        assert_eq!(entities.player_number.as_deref(), Some("51"));
        assert_eq!(entities.value, Some(20.0));
        assert_eq!(entities.statistic.as_deref(), Some("points"));
    }

    #[tokio::test]
    async fn test_generator_failure_uses_patterns() {
        let extractor = extractor(Err(()));
        let entities = extractor
            .extract("Did Betts have more than 10 rebounds against Stanford?")
            .await
            .unwrap();

        assert_eq!(entities.player_names, vec!["Betts, Lauren".to_string()]);
        assert_eq!(entities.statistic.as_deref(), Some("rebounds"));
        assert_eq!(entities.comparison.as_deref(), Some("more than"));
        assert_eq!(entities.value, Some(10.0));
    }

    #[test]
    fn test_pattern_extract_jersey_number() {
        let extractor = extractor(Err(()));
        let entities = extractor.pattern_extract("Show every game for #3 with at least 5 ast");
        assert_eq!(entities.player_number.as_deref(), Some("3"));
        assert_eq!(entities.value, Some(5.0));
        assert_eq!(entities.statistic.as_deref(), Some("assists"));
        assert_eq!(entities.comparison.as_deref(), Some("at least"));
    }

    #[test]
    fn test_lowercase_to_is_not_turnovers() {
        let extractor = extractor(Err(()));
        assert_eq!(extractor.pattern_extract("Compare Rice to Jones").statistic, None);
        assert_eq!(
            extractor.pattern_extract("Who had the most TO?").statistic.as_deref(),
            Some("turnovers")
        );
    }

    #[test]
    fn test_resolution_is_cached() {
        let extractor = extractor(Err(()));
        let raw = EntitySet {
            player_names: vec!["kiki rice".to_string()],
            ..EntitySet::default()
        };
        let first = extractor.resolve(raw.clone());
        assert_eq!(first.player_names, vec!["Rice, Kiki".to_string()]);
        assert_eq!(extractor.cache().len(), 1);

        let second = extractor.resolve(raw);
        assert_eq!(first, second);
        assert_eq!(extractor.cache().len(), 1);
    }
}
