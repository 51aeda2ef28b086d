//! Count queries against the hosted backend

use serde_json::Value;

/// Comparison operator of a query filter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
}

impl FilterOp {
    pub fn as_str(self) -> &'static str {
        match self {
            FilterOp::Eq => "eq",
            FilterOp::Neq => "neq",
            FilterOp::Gt => "gt",
            FilterOp::Gte => "gte",
            FilterOp::Lt => "lt",
            FilterOp::Lte => "lte",
        }
    }
}

/// `column <op> value`
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub column: String,
    pub op: FilterOp,
    pub value: Value,
}

impl Filter {
    /// Whether `row` satisfies this filter. Missing columns never match;
    /// numbers compare numerically, strings lexically.
    pub fn matches(&self, row: &Value) -> bool {
        let Some(actual) = row.get(&self.column) else {
            return false;
        };
        let ord = compare(actual, &self.value);
        match self.op {
            FilterOp::Eq => actual == &self.value,
            FilterOp::Neq => actual != &self.value,
            FilterOp::Gt => ord.is_some_and(|o| o.is_gt()),
            FilterOp::Gte => ord.is_some_and(|o| o.is_ge()),
            FilterOp::Lt => ord.is_some_and(|o| o.is_lt()),
            FilterOp::Lte => ord.is_some_and(|o| o.is_le()),
        }
    }
}

fn compare(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// `count`-only query over one table
#[derive(Debug, Clone, PartialEq)]
pub struct CountQuery {
    pub table: String,
    pub filters: Vec<Filter>,
}

impl CountQuery {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            filters: Vec::new(),
        }
    }

    fn with(mut self, column: &str, op: FilterOp, value: impl Into<Value>) -> Self {
        self.filters.push(Filter {
            column: column.to_string(),
            op,
            value: value.into(),
        });
        self
    }

    pub fn eq(self, column: &str, value: impl Into<Value>) -> Self {
        self.with(column, FilterOp::Eq, value)
    }

    pub fn neq(self, column: &str, value: impl Into<Value>) -> Self {
        self.with(column, FilterOp::Neq, value)
    }

    pub fn gt(self, column: &str, value: impl Into<Value>) -> Self {
        self.with(column, FilterOp::Gt, value)
    }

    pub fn gte(self, column: &str, value: impl Into<Value>) -> Self {
        self.with(column, FilterOp::Gte, value)
    }

    pub fn lt(self, column: &str, value: impl Into<Value>) -> Self {
        self.with(column, FilterOp::Lt, value)
    }

    pub fn lte(self, column: &str, value: impl Into<Value>) -> Self {
        self.with(column, FilterOp::Lte, value)
    }

    pub fn matches(&self, row: &Value) -> bool {
        self.filters.iter().all(|f| f.matches(row))
    }
}

impl std::fmt::Display for CountQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.table)?;
        for (i, filter) in self.filters.iter().enumerate() {
            let sep = if i == 0 { '?' } else { '&' };
            write!(f, "{}{}={}.{}", sep, filter.column, filter.op.as_str(), filter.value)?;
        }
        Ok(())
    }
}
