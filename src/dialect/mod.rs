//! SQL dialects.
//!
//! A dialect turns portable [`TableSchema`]s and structured [`Statement`]s into
//! engine-specific SQL text. The core never writes dialect syntax itself.

pub mod postgres;
pub mod sqlite;

use crate::connection::{Predicate, Projection, Statement};
use crate::core::{DataType, DbError, Result, TableSchema, Value};
use regex::Regex;
use std::fmt;

pub use postgres::PostgresDialect;
pub use sqlite::SqliteDialect;

lazy_static::lazy_static! {
    static ref IDENTIFIER: Regex = Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,62}$").unwrap();
}

/// Check that `name` can be used as a table or column name on every dialect.
pub fn validate_identifier(name: &str) -> Result<()> {
    if IDENTIFIER.is_match(name) {
        Ok(())
    } else {
        Err(DbError::InvalidDefinition(format!(
            "'{}' is not a valid identifier",
            name
        )))
    }
}

/// SQL text with positional parameters
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedSql {
    pub sql: String,
    pub parameters: Vec<Value>,
}

impl fmt::Display for RenderedSql {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.sql)?;
        if !self.parameters.is_empty() {
            let params: Vec<String> = self.parameters.iter().map(|p| p.to_string()).collect();
            write!(f, " -- [{}]", params.join(", "))?;
        }
        Ok(())
    }
}

pub trait Dialect: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    fn type_name(&self, data_type: DataType) -> &'static str;

    fn quote(&self, identifier: &str) -> String {
        format!("\"{}\"", identifier.replace('"', "\"\""))
    }

    /// Placeholder for the 1-based parameter `index`
    fn parameter(&self, index: usize) -> String;

    /// Append paging to a SELECT
    fn page(&self, sql: &mut String, offset: Option<usize>, limit: Option<usize>);

    fn primary_key_clause(&self, data_type: DataType) -> String {
        format!("{} PRIMARY KEY", self.type_name(data_type))
    }

    fn create_table(&self, schema: &TableSchema, if_not_exists: bool) -> String {
        let columns: Vec<String> = schema
            .columns()
            .iter()
            .map(|column| {
                if column.primary_key {
                    return format!(
                        "{} {}",
                        self.quote(&column.name),
                        self.primary_key_clause(column.data_type)
                    );
                }
                let mut def = format!("{} {}", self.quote(&column.name), self.type_name(column.data_type));
                if !column.nullable {
                    def.push_str(" NOT NULL");
                }
                if column.unique {
                    def.push_str(" UNIQUE");
                }
                def
            })
            .collect();

        format!(
            "CREATE TABLE {}{} ({})",
            if if_not_exists { "IF NOT EXISTS " } else { "" },
            self.quote(schema.name()),
            columns.join(", ")
        )
    }

    fn create_index(&self, table: &str, column: &str, unique: bool) -> String {
        format!(
            "CREATE {}INDEX IF NOT EXISTS {} ON {} ({})",
            if unique { "UNIQUE " } else { "" },
            self.quote(&format!("IX_{}_{}", table, column)),
            self.quote(table),
            self.quote(column)
        )
    }

    fn drop_table(&self, name: &str, if_exists: bool) -> String {
        format!(
            "DROP TABLE {}{}",
            if if_exists { "IF EXISTS " } else { "" },
            self.quote(name)
        )
    }

    /// Full DDL for a table: the table itself and its secondary indexes
    fn schema_script(&self, schema: &TableSchema) -> Vec<String> {
        let mut script = vec![self.create_table(schema, true)];
        for column in &schema.indexes {
            script.push(self.create_index(schema.name(), column, false));
        }
        script
    }

    fn render(&self, statement: &Statement) -> RenderedSql {
        let mut parameters = Vec::new();
        let sql = match statement {
            Statement::CreateTable {
                schema,
                if_not_exists,
            } => self.create_table(schema, *if_not_exists),
            Statement::DropTable { name, if_exists } => self.drop_table(name, *if_exists),
            Statement::Insert {
                table,
                columns,
                values,
            } => {
                let placeholders: Vec<String> = values
                    .iter()
                    .map(|value| bind(self, &mut parameters, value))
                    .collect();
                let columns: Vec<String> = columns.iter().map(|c| self.quote(c)).collect();
                format!(
                    "INSERT INTO {} ({}) VALUES ({})",
                    self.quote(table),
                    columns.join(", "),
                    placeholders.join(", ")
                )
            }
            Statement::Update {
                table,
                assignments,
                filter,
            } => {
                let sets: Vec<String> = assignments
                    .iter()
                    .map(|(column, value)| {
                        format!("{} = {}", self.quote(column), bind(self, &mut parameters, value))
                    })
                    .collect();
                let mut sql = format!("UPDATE {} SET {}", self.quote(table), sets.join(", "));
                push_where(self, &mut sql, &mut parameters, filter.predicates());
                sql
            }
            Statement::Delete { table, filter } => {
                let mut sql = format!("DELETE FROM {}", self.quote(table));
                push_where(self, &mut sql, &mut parameters, filter.predicates());
                sql
            }
            Statement::Select(select) => {
                let projection = match &select.projection {
                    Projection::All => "*".to_string(),
                    Projection::Columns(columns) => columns
                        .iter()
                        .map(|c| self.quote(c))
                        .collect::<Vec<_>>()
                        .join(", "),
                    Projection::Count => "COUNT(*)".to_string(),
                    Projection::Max(column) => format!("MAX({})", self.quote(column)),
                };
                let mut sql = format!("SELECT {} FROM {}", projection, self.quote(&select.table));
                push_where(self, &mut sql, &mut parameters, select.filter.predicates());
                if !select.order_by.is_empty() {
                    let keys: Vec<String> = select
                        .order_by
                        .iter()
                        .map(|o| {
                            format!(
                                "{}{}",
                                self.quote(&o.column),
                                if o.descending { " DESC" } else { "" }
                            )
                        })
                        .collect();
                    sql.push_str(&format!(" ORDER BY {}", keys.join(", ")));
                }
                if select.offset.is_some() || select.limit.is_some() {
                    self.page(&mut sql, select.offset, select.limit);
                }
                sql
            }
        };
        RenderedSql { sql, parameters }
    }
}

fn bind<D: Dialect + ?Sized>(dialect: &D, parameters: &mut Vec<Value>, value: &Value) -> String {
    parameters.push(value.clone());
    dialect.parameter(parameters.len())
}

fn push_where<D: Dialect + ?Sized>(
    dialect: &D,
    sql: &mut String,
    parameters: &mut Vec<Value>,
    predicates: &[Predicate],
) {
    if predicates.is_empty() {
        return;
    }
    let conditions: Vec<String> = predicates
        .iter()
        .map(|predicate| match predicate {
            Predicate::Compare { column, op, value } => format!(
                "{} {} {}",
                dialect.quote(column),
                op.symbol(),
                bind(dialect, parameters, value)
            ),
            Predicate::In { column, values } if values.is_empty() => {
                format!("1 = 0 /* {} IN () */", dialect.quote(column))
            }
            Predicate::In { column, values } => {
                let placeholders: Vec<String> =
                    values.iter().map(|v| bind(dialect, parameters, v)).collect();
                format!("{} IN ({})", dialect.quote(column), placeholders.join(", "))
            }
        })
        .collect();
    sql.push_str(" WHERE ");
    sql.push_str(&conditions.join(" AND "));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifier_validation() {
        assert!(validate_identifier("Document").is_ok());
        assert!(validate_identifier("app_PostsByDay_Document").is_ok());
        assert!(validate_identifier("1table").is_err());
        assert!(validate_identifier("drop table;").is_err());
        assert!(validate_identifier("").is_err());
    }

    #[test]
    fn test_rendered_sql_display_lists_parameters() {
        let rendered = RenderedSql {
            sql: "DELETE FROM \"Document\" WHERE \"Id\" = ?".into(),
            parameters: vec![Value::Integer(7)],
        };
        assert_eq!(
            rendered.to_string(),
            "DELETE FROM \"Document\" WHERE \"Id\" = ? -- [7]"
        );
    }
}
