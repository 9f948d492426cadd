use serde::{Deserialize, Serialize};

/// Tables and columns of one live database, as read from its metadata catalog
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaCatalog {
    pub database: String,
    pub tables: Vec<Table>,
    pub retrieved_at: chrono::DateTime<chrono::Utc>,
}

impl SchemaCatalog {
    pub fn new(database: impl Into<String>, tables: Vec<Table>) -> Self {
        Self {
            database: database.into(),
            tables,
            retrieved_at: chrono::Utc::now(),
        }
    }

    /// Case-insensitive table lookup; a `schema.table` name matches on both parts
    pub fn table(&self, name: &str) -> Option<&Table> {
        let (schema, table) = match name.rsplit_once('.') {
            Some((schema, table)) => (Some(schema), table),
            None => (None, name),
        };
        self.tables.iter().find(|t| {
            t.name.eq_ignore_ascii_case(table)
                && match (schema, &t.schema) {
                    (Some(wanted), Some(actual)) => wanted.eq_ignore_ascii_case(actual),
                    _ => true,
                }
        })
    }

    pub fn has_table(&self, name: &str) -> bool {
        self.table(name).is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Table {
    pub name: String,
    pub schema: Option<String>,
    pub columns: Vec<Column>,
}

impl Table {
    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c.name.eq_ignore_ascii_case(name))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub data_type: String,
    pub is_nullable: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> SchemaCatalog {
        SchemaCatalog::new(
            "main",
            vec![Table {
                name: "stock_trades".into(),
                schema: Some("public".into()),
                columns: vec![Column {
                    name: "Symbol".into(),
                    data_type: "text".into(),
                    is_nullable: false,
                }],
            }],
        )
    }

    #[test]
    fn test_case_insensitive_lookup() {
        let catalog = catalog();
        assert!(catalog.has_table("STOCK_TRADES"));
        assert!(catalog.has_table("public.stock_trades"));
        assert!(!catalog.has_table("audit.stock_trades"));
        assert!(catalog.table("stock_trades").unwrap().has_column("symbol"));
        assert!(!catalog.has_table("trades"));
    }
}
