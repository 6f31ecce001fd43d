use super::Dialect;
use crate::core::DataType;

#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresDialect;

impl Dialect for PostgresDialect {
    fn name(&self) -> &'static str {
        "postgres"
    }

    fn type_name(&self, data_type: DataType) -> &'static str {
        match data_type {
            DataType::Integer => "BIGINT",
            DataType::Float => "DOUBLE PRECISION",
            DataType::Text => "TEXT",
            DataType::Boolean => "BOOLEAN",
        }
    }

    fn parameter(&self, index: usize) -> String {
        format!("${}", index)
    }

    fn page(&self, sql: &mut String, offset: Option<usize>, limit: Option<usize>) {
        if let Some(limit) = limit {
            sql.push_str(&format!(" LIMIT {}", limit));
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
    fn test_numbered_parameters() {
        let rendered = PostgresDialect.render(&Statement::insert(
            "PostsByDay",
            vec!["Id".into(), "GroupKey".into(), "Count".into()],
            vec![Value::Integer(1), Value::Text("t:20210101".into()), Value::Integer(3)],
        ));
        assert_eq!(
            rendered.sql,
            "INSERT INTO \"PostsByDay\" (\"Id\", \"GroupKey\", \"Count\") VALUES ($1, $2, $3)"
        );
    }

    #[test]
    fn test_select_in_and_paging() {
        let rendered = PostgresDialect.render(
            &Select::from("Document")
                .filter(Filter::new().is_in("Id", vec![Value::Integer(1), Value::Integer(2)]))
                .order_by("Id", true)
                .limit(5)
                .into(),
        );
        assert_eq!(
            rendered.sql,
            "SELECT * FROM \"Document\" WHERE \"Id\" IN ($1, $2) ORDER BY \"Id\" DESC LIMIT 5"
        );
    }

    #[test]
    fn test_types_and_unique_columns() {
        let schema = TableSchema::new(
            "Totals",
            vec![
                Column::new("Id", DataType::Integer).primary_key(),
                Column::new("GroupKey", DataType::Text).not_null().unique(),
                Column::new("Amount", DataType::Float),
            ],
        );
        assert_eq!(
            PostgresDialect.create_table(&schema, false),
            "CREATE TABLE \"Totals\" (\"Id\" BIGINT PRIMARY KEY, \"GroupKey\" TEXT NOT NULL UNIQUE, \"Amount\" DOUBLE PRECISION)"
        );
    }
}
