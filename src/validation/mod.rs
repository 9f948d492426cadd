pub mod config_validator;
pub mod sql_analysis;
pub mod sql_validator;

pub use config_validator::ConfigValidator;
pub use sql_analysis::{extract_references, SqlReferences};
pub use sql_validator::{SqlValidator, StatementKind};
