pub mod sqlite;

pub use sqlite::{ConfigStore, DefinitionKind};
