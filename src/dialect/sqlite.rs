use super::Dialect;
use crate::core::DataType;

#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteDialect;

impl Dialect for SqliteDialect {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn type_name(&self, data_type: DataType) -> &'static str {
        match data_type {
            DataType::Integer | DataType::Boolean => "INTEGER",
            DataType::Float => "REAL",
            DataType::Text => "TEXT",
        }
    }

    fn parameter(&self, _index: usize) -> String {
        "?".to_string()
    }

    fn page(&self, sql: &mut String, offset: Option<usize>, limit: Option<usize>) {
        // SQLite cannot express OFFSET without LIMIT
        match limit {
            Some(limit) => sql.push_str(&format!(" LIMIT {}", limit)),
            None => sql.push_str(" LIMIT -1"),
        }
        if let Some(offset) = offset {
            sql.push_str(&format!(" OFFSET {}", offset));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{Filter, Select, Statement};
    use crate::core::{Column, TableSchema, Value};

    #[test]
    fn test_create_table() {
        let schema = TableSchema::new(
            "Document",
            vec![
                Column::new("Id", DataType::Integer).primary_key(),
                Column::new("Type", DataType::Text).not_null(),
                Column::new("Content", DataType::Text),
            ],
        )
        .with_index("Type");

        let script = SqliteDialect.schema_script(&schema);
        assert_eq!(
            script[0],
            "CREATE TABLE IF NOT EXISTS \"Document\" (\"Id\" INTEGER PRIMARY KEY, \"Type\" TEXT NOT NULL, \"Content\" TEXT)"
        );
        assert_eq!(
            script[1],
            "CREATE INDEX IF NOT EXISTS \"IX_Document_Type\" ON \"Document\" (\"Type\")"
        );
    }

    #[test]
    fn test_offset_without_limit() {
        let rendered = SqliteDialect.render(
            &Select::from("Document")
                .filter(Filter::new().eq("Type", "Post"))
                .offset(10)
                .into(),
        );
        assert_eq!(
            rendered.sql,
            "SELECT * FROM \"Document\" WHERE \"Type\" = ? LIMIT -1 OFFSET 10"
        );
        assert_eq!(rendered.parameters, vec![Value::Text("Post".into())]);
    }

    #[test]
    fn test_update_with_version_check() {
        let rendered = SqliteDialect.render(&Statement::update(
            "Document",
            vec![("Version".into(), Value::Integer(3))],
            Filter::new().eq("Id", 1).eq("Version", 2),
        ));
        assert_eq!(
            rendered.sql,
            "UPDATE \"Document\" SET \"Version\" = ? WHERE \"Id\" = ? AND \"Version\" = ?"
        );
        assert_eq!(rendered.parameters.len(), 3);
    }
}
