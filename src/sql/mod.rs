//! SQL inspection, repair and extraction for the SQLite target dialect

pub mod extract;
pub mod repair;
pub mod scan;
pub mod validator;

pub use extract::{extract_sql, Extracted, ExtractionStrategy};
pub use repair::{DialectRepairEngine, RepairReport, RepairRule};
pub use validator::{ReasonCode, SafetyValidator, ValidationOutcome};
