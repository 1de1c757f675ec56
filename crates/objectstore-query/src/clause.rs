//! Ordering clauses of a query chain.

use std::cmp::Ordering;
use std::fmt;

use objectstore_core::{Result, Value};

use crate::compile::{Selector, compile_selector};
use crate::expr::Expr;

/// Sort direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum OrderDirection {
    #[default]
    Asc,
    Desc,
}

impl OrderDirection {
    pub const fn as_str(&self) -> &'static str {
        match self {
            OrderDirection::Asc => "ASC",
            OrderDirection::Desc => "DESC",
        }
    }

    pub fn apply(self, ordering: Ordering) -> Ordering {
        match self {
            OrderDirection::Asc => ordering,
            OrderDirection::Desc => ordering.reverse(),
        }
    }
}

/// One sort key of a context: a selector expression and its direction.
#[derive(Clone)]
pub struct OrderItem {
    expr: Expr,
    direction: OrderDirection,
    selector: Selector,
}

impl OrderItem {
    pub fn new(expr: Expr, direction: OrderDirection) -> Result<Self> {
        let selector = compile_selector(&expr)?;
        Ok(Self {
            expr,
            direction,
            selector,
        })
    }

    pub fn expr(&self) -> &Expr {
        &self.expr
    }

    pub fn direction(&self) -> OrderDirection {
        self.direction
    }

    pub fn selector(&self) -> &Selector {
        &self.selector
    }

    /// Compare two selected keys in this item's direction. NULL sorts first
    /// ascending.
    pub fn compare_values(&self, a: &Value, b: &Value) -> Ordering {
        self.direction.apply(a.compare(b))
    }
}

impl fmt::Debug for OrderItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.expr, self.direction.as_str())
    }
}
