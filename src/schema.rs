//! Schema descriptor for the single authorized table

use crate::error::Result;
use serde::{Deserialize, Serialize};

/// `Name` values that hold team aggregates rather than one player's line.
pub const AGGREGATE_ROW_NAMES: [&str; 3] = ["Totals", "TM", "Team"];

/// Predicate every per-player query carries.
pub const EXCLUDE_AGGREGATE_ROWS: &str = "Name NOT IN ('Totals', 'TM', 'Team')";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub declared_type: String,
    pub not_null: bool,
    pub is_primary_key: bool,
}

impl Column {
    pub fn new(name: impl Into<String>, declared_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            declared_type: declared_type.into(),
            not_null: false,
            is_primary_key: false,
        }
    }
}

/// Ordered column metadata for one table. Loaded once per pipeline and never
/// mutated afterwards; reconnecting is the only way to refresh it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaDescriptor {
    table: String,
    columns: Vec<Column>,
}

impl SchemaDescriptor {
    pub fn new(table: impl Into<String>, columns: Vec<Column>) -> Self {
        Self {
            table: table.into(),
            columns,
        }
    }

    /// A descriptor with no column information, used when introspection
    /// returns nothing. Prompts then say the schema is unavailable.
    pub fn unavailable(table: impl Into<String>) -> Self {
        Self::new(table, Vec::new())
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn is_available(&self) -> bool {
        !self.columns.is_empty()
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// Flat listing embedded into generation prompts.
    pub fn render_listing(&self) -> String {
        if !self.is_available() {
            return format!("Table: {} (schema not available)", self.table);
        }

        let mut lines = vec![format!("Table: {}", self.table)];
        lines.extend(
            self.columns
                .iter()
                .map(|c| format!("- {} ({})", c.name, c.declared_type)),
        );
        lines.join("\n")
    }
}

/// Source of column metadata.
pub trait SchemaProvider: Send + Sync {
    /// `Ok(None)` when the table does not exist.
    fn get_schema(&self, table: &str) -> Result<Option<SchemaDescriptor>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_listing() {
        let schema = SchemaDescriptor::new(
            "ucla_player_stats",
            vec![Column::new("Name", "TEXT"), Column::new("Pts", "INTEGER")],
        );
        assert_eq!(
            schema.render_listing(),
            "Table: ucla_player_stats\n- Name (TEXT)\n- Pts (INTEGER)"
        );
        assert!(schema.column("pts").is_some());
    }

    #[test]
    fn test_unavailable_schema_listing() {
        let schema = SchemaDescriptor::unavailable("ucla_player_stats");
        assert!(!schema.is_available());
        assert_eq!(
            schema.render_listing(),
            "Table: ucla_player_stats (schema not available)"
        );
    }
}
