//! Structured statements exchanged with a [`Connection`](super::Connection).
//!
//! Drivers that speak SQL render them through a [`Dialect`](crate::dialect::Dialect);
//! the in-memory engine executes them directly.

use crate::core::{Row, TableSchema, Value};

#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    CreateTable {
        schema: TableSchema,
        if_not_exists: bool,
    },
    DropTable {
        name: String,
        if_exists: bool,
    },
    Insert {
        table: String,
        columns: Vec<String>,
        values: Row,
    },
    Update {
        table: String,
        assignments: Vec<(String, Value)>,
        filter: Filter,
    },
    Delete {
        table: String,
        filter: Filter,
    },
    Select(Select),
}

impl Statement {
    pub fn insert(table: impl Into<String>, columns: Vec<String>, values: Row) -> Self {
        Statement::Insert {
            table: table.into(),
            columns,
            values,
        }
    }

    pub fn update(table: impl Into<String>, assignments: Vec<(String, Value)>, filter: Filter) -> Self {
        Statement::Update {
            table: table.into(),
            assignments,
            filter,
        }
    }

    pub fn delete(table: impl Into<String>, filter: Filter) -> Self {
        Statement::Delete {
            table: table.into(),
            filter,
        }
    }

    pub fn table(&self) -> &str {
        match self {
            Statement::CreateTable { schema, .. } => schema.name(),
            Statement::DropTable { name, .. } => name,
            Statement::Insert { table, .. }
            | Statement::Update { table, .. }
            | Statement::Delete { table, .. } => table,
            Statement::Select(select) => &select.table,
        }
    }

    pub fn is_query(&self) -> bool {
        matches!(self, Statement::Select(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
}

impl CompareOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::NotEq => "<>",
            CompareOp::Lt => "<",
            CompareOp::LtEq => "<=",
            CompareOp::Gt => ">",
            CompareOp::GtEq => ">=",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Compare {
        column: String,
        op: CompareOp,
        value: Value,
    },
    In {
        column: String,
        values: Vec<Value>,
    },
}

impl Predicate {
    pub fn column(&self) -> &str {
        match self {
            Predicate::Compare { column, .. } | Predicate::In { column, .. } => column,
        }
    }

    /// Evaluate against a single column value. NULL never matches.
    pub fn matches(&self, actual: &Value) -> bool {
        if actual.is_null() {
            return false;
        }
        match self {
            Predicate::Compare { op, value, .. } => {
                let Ok(ordering) = actual.compare(value) else {
                    return false;
                };
                match op {
                    CompareOp::Eq => ordering.is_eq(),
                    CompareOp::NotEq => ordering.is_ne(),
                    CompareOp::Lt => ordering.is_lt(),
                    CompareOp::LtEq => ordering.is_le(),
                    CompareOp::Gt => ordering.is_gt(),
                    CompareOp::GtEq => ordering.is_ge(),
                }
            }
            Predicate::In { values, .. } => values.iter().any(|v| v == actual),
        }
    }

    /// Values that an index lookup can use directly
    pub fn lookup_values(&self) -> Option<Vec<&Value>> {
        match self {
            Predicate::Compare {
                op: CompareOp::Eq,
                value,
                ..
            } => Some(vec![value]),
            Predicate::In { values, .. } => Some(values.iter().collect()),
            _ => None,
        }
    }
}

/// Conjunction of predicates. An empty filter matches every row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    predicates: Vec<Predicate>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn compare(mut self, column: impl Into<String>, op: CompareOp, value: impl Into<Value>) -> Self {
        self.predicates.push(Predicate::Compare {
            column: column.into(),
            op,
            value: value.into(),
        });
        self
    }

    pub fn eq(self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.compare(column, CompareOp::Eq, value)
    }

    pub fn is_in(mut self, column: impl Into<String>, values: Vec<Value>) -> Self {
        self.predicates.push(Predicate::In {
            column: column.into(),
            values,
        });
        self
    }

    pub fn push(&mut self, predicate: Predicate) {
        self.predicates.push(predicate);
    }

    pub fn predicates(&self) -> &[Predicate] {
        &self.predicates
    }

    pub fn is_empty(&self) -> bool {
        self.predicates.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Projection {
    All,
    Columns(Vec<String>),
    Count,
    Max(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderBy {
    pub column: String,
    pub descending: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Select {
    pub table: String,
    pub projection: Projection,
    pub filter: Filter,
    pub order_by: Vec<OrderBy>,
    pub offset: Option<usize>,
    pub limit: Option<usize>,
}

impl Select {
    pub fn from(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            projection: Projection::All,
            filter: Filter::new(),
            order_by: Vec::new(),
            offset: None,
            limit: None,
        }
    }

    pub fn columns(mut self, columns: &[&str]) -> Self {
        self.projection = Projection::Columns(columns.iter().map(|c| c.to_string()).collect());
        self
    }

    pub fn count(mut self) -> Self {
        self.projection = Projection::Count;
        self
    }

    pub fn max(mut self, column: impl Into<String>) -> Self {
        self.projection = Projection::Max(column.into());
        self
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filter = filter;
        self
    }

    pub fn order_by(mut self, column: impl Into<String>, descending: bool) -> Self {
        self.order_by.push(OrderBy {
            column: column.into(),
            descending,
        });
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

impl From<Select> for Statement {
    fn from(select: Select) -> Self {
        Statement::Select(select)
    }
}
