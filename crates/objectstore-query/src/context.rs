//! Query chains and their analyzed contexts.
//!
//! A [`QueryExpr`] is the method chain a caller builds (`filter`, `order_by`,
//! `take`, ...). [`ContextRegistry::analyse`] turns it into a shared
//! [`QueryContext`]. Contexts are cached by structural equality of the
//! normalized chain, so identical queries built at different call sites get
//! the very same context (and therefore the same materialized view).

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Weak};

use objectstore_core::{EntityRef, Error, Result, TableMapping, TranslationErrorKind, Value};
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::clause::{OrderDirection, OrderItem};
use crate::compile::{Predicate, compile_predicate};
use crate::expr::Expr;

/// A query method chain over one mapped table.
#[derive(Debug, Clone)]
pub enum QueryExpr {
    /// The root queryable
    Table(Arc<TableMapping>),
    Where(Box<QueryExpr>, Expr),
    OrderBy(Box<QueryExpr>, Expr, OrderDirection),
    ThenBy(Box<QueryExpr>, Expr, OrderDirection),
    Take(Box<QueryExpr>, usize),
    Skip(Box<QueryExpr>, usize),
    ForceLoad(Box<QueryExpr>),
    ForceCache(Box<QueryExpr>),
}

impl QueryExpr {
    pub fn table(mapping: &Arc<TableMapping>) -> Self {
        QueryExpr::Table(Arc::clone(mapping))
    }

    pub fn filter(self, predicate: Expr) -> Self {
        QueryExpr::Where(Box::new(self), predicate)
    }

    pub fn order_by(self, key: Expr) -> Self {
        QueryExpr::OrderBy(Box::new(self), key, OrderDirection::Asc)
    }

    pub fn order_by_desc(self, key: Expr) -> Self {
        QueryExpr::OrderBy(Box::new(self), key, OrderDirection::Desc)
    }

    pub fn then_by(self, key: Expr) -> Self {
        QueryExpr::ThenBy(Box::new(self), key, OrderDirection::Asc)
    }

    pub fn then_by_desc(self, key: Expr) -> Self {
        QueryExpr::ThenBy(Box::new(self), key, OrderDirection::Desc)
    }

    pub fn take(self, count: usize) -> Self {
        QueryExpr::Take(Box::new(self), count)
    }

    pub fn skip(self, count: usize) -> Self {
        QueryExpr::Skip(Box::new(self), count)
    }

    /// Always hit the database before trusting the cache.
    pub fn force_load(self) -> Self {
        QueryExpr::ForceLoad(Box::new(self))
    }

    /// Answer from the cache only.
    pub fn force_cache(self) -> Self {
        QueryExpr::ForceCache(Box::new(self))
    }

    pub fn inner(&self) -> Option<&QueryExpr> {
        match self {
            QueryExpr::Table(_) => None,
            QueryExpr::Where(inner, _)
            | QueryExpr::OrderBy(inner, _, _)
            | QueryExpr::ThenBy(inner, _, _)
            | QueryExpr::Take(inner, _)
            | QueryExpr::Skip(inner, _)
            | QueryExpr::ForceLoad(inner)
            | QueryExpr::ForceCache(inner) => Some(inner),
        }
    }

    /// Mapping of the root table.
    pub fn mapping(&self) -> &Arc<TableMapping> {
        match self {
            QueryExpr::Table(mapping) => mapping,
            QueryExpr::Where(inner, _)
            | QueryExpr::OrderBy(inner, _, _)
            | QueryExpr::ThenBy(inner, _, _)
            | QueryExpr::Take(inner, _)
            | QueryExpr::Skip(inner, _)
            | QueryExpr::ForceLoad(inner)
            | QueryExpr::ForceCache(inner) => inner.mapping(),
        }
    }

    /// Fold every captured or parameter-free subexpression into a constant.
    pub fn normalize(&self) -> Result<QueryExpr> {
        let boxed = |inner: &QueryExpr| inner.normalize().map(Box::new);
        Ok(match self {
            QueryExpr::Table(mapping) => QueryExpr::Table(Arc::clone(mapping)),
            QueryExpr::Where(inner, e) => QueryExpr::Where(boxed(inner)?, e.fold_constants()?),
            QueryExpr::OrderBy(inner, e, d) => {
                QueryExpr::OrderBy(boxed(inner)?, e.fold_constants()?, *d)
            }
            QueryExpr::ThenBy(inner, e, d) => {
                QueryExpr::ThenBy(boxed(inner)?, e.fold_constants()?, *d)
            }
            QueryExpr::Take(inner, n) => QueryExpr::Take(boxed(inner)?, *n),
            QueryExpr::Skip(inner, n) => QueryExpr::Skip(boxed(inner)?, *n),
            QueryExpr::ForceLoad(inner) => QueryExpr::ForceLoad(boxed(inner)?),
            QueryExpr::ForceCache(inner) => QueryExpr::ForceCache(boxed(inner)?),
        })
    }
}

impl PartialEq for QueryExpr {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (QueryExpr::Table(a), QueryExpr::Table(b)) => a.table() == b.table(),
            (QueryExpr::Where(ia, a), QueryExpr::Where(ib, b)) => a == b && ia == ib,
            (QueryExpr::OrderBy(ia, a, da), QueryExpr::OrderBy(ib, b, db))
            | (QueryExpr::ThenBy(ia, a, da), QueryExpr::ThenBy(ib, b, db)) => {
                da == db && a == b && ia == ib
            }
            (QueryExpr::Take(ia, a), QueryExpr::Take(ib, b))
            | (QueryExpr::Skip(ia, a), QueryExpr::Skip(ib, b)) => a == b && ia == ib,
            (QueryExpr::ForceLoad(a), QueryExpr::ForceLoad(b))
            | (QueryExpr::ForceCache(a), QueryExpr::ForceCache(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for QueryExpr {}

impl Hash for QueryExpr {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            QueryExpr::Table(mapping) => mapping.table().hash(state),
            QueryExpr::Where(inner, e) => {
                inner.hash(state);
                e.hash(state);
            }
            QueryExpr::OrderBy(inner, e, d) | QueryExpr::ThenBy(inner, e, d) => {
                inner.hash(state);
                e.hash(state);
                d.hash(state);
            }
            QueryExpr::Take(inner, n) | QueryExpr::Skip(inner, n) => {
                inner.hash(state);
                n.hash(state);
            }
            QueryExpr::ForceLoad(inner) | QueryExpr::ForceCache(inner) => inner.hash(state),
        }
    }
}

impl fmt::Display for QueryExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryExpr::Table(mapping) => write!(f, "{}", mapping.table()),
            QueryExpr::Where(inner, e) => write!(f, "{}.where({})", inner, e),
            QueryExpr::OrderBy(inner, e, d) => write!(f, "{}.order_by({} {})", inner, e, d.as_str()),
            QueryExpr::ThenBy(inner, e, d) => write!(f, "{}.then_by({} {})", inner, e, d.as_str()),
            QueryExpr::Take(inner, n) => write!(f, "{}.take({})", inner, n),
            QueryExpr::Skip(inner, n) => write!(f, "{}.skip({})", inner, n),
            QueryExpr::ForceLoad(inner) => write!(f, "{}.force_load()", inner),
            QueryExpr::ForceCache(inner) => write!(f, "{}.force_cache()", inner),
        }
    }
}

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// An analyzed query: conjunctive predicate, ordering, row limit and cache
/// policy over one mapped table.
pub struct QueryContext {
    id: u64,
    query: QueryExpr,
    mapping: Arc<TableMapping>,
    inner: Option<Arc<QueryContext>>,
    predicates: Vec<Expr>,
    predicate: Option<Predicate>,
    order: Vec<OrderItem>,
    top: Option<usize>,
    force_load: bool,
    force_cache: bool,
    loaded: AtomicBool,
    predicate_properties: Vec<String>,
    routed_properties: Vec<String>,
}

impl QueryContext {
    fn build(query: &QueryExpr, inner: Option<Arc<QueryContext>>) -> Result<Self> {
        let not_supported = |message: &str| {
            Error::translation(TranslationErrorKind::NotSupportedQuery, query, message)
        };
        let mut predicates = Vec::new();
        let mut order = Vec::new();
        let mut top = None;
        let (mut force_load, mut force_cache) = (false, false);

        if let Some(parent) = &inner {
            predicates = parent.predicates.clone();
            order = parent.order.clone();
            top = parent.top;
            let limited = parent.top.is_some();
            match query {
                QueryExpr::Where(_, e) => {
                    if limited {
                        return Err(not_supported("where after take"));
                    }
                    predicates.push(e.clone());
                }
                QueryExpr::OrderBy(_, e, d) => {
                    if limited {
                        return Err(not_supported("order_by after take"));
                    }
                    order = vec![OrderItem::new(e.clone(), *d)?];
                }
                QueryExpr::ThenBy(_, e, d) => {
                    if limited {
                        return Err(not_supported("then_by after take"));
                    }
                    if order.is_empty() {
                        return Err(not_supported("then_by without order_by"));
                    }
                    order.push(OrderItem::new(e.clone(), *d)?);
                }
                QueryExpr::Take(_, n) => top = Some(top.map_or(*n, |t: usize| t.min(*n))),
                QueryExpr::Skip(_, _) => return Err(not_supported("skip is not supported")),
                QueryExpr::ForceLoad(_) => force_load = true,
                QueryExpr::ForceCache(_) => force_cache = true,
                QueryExpr::Table(_) => {}
            }
        }

        let mapping = Arc::clone(query.mapping());
        let predicate = match predicates.split_first() {
            None => None,
            Some((first, rest)) => {
                let all = rest
                    .iter()
                    .fold(first.clone(), |acc, e| acc.and(e.clone()));
                Some(compile_predicate(&all)?)
            }
        };

        let mut predicate_properties = Vec::new();
        for e in &predicates {
            for p in e.referenced_properties() {
                if !predicate_properties.contains(&p) {
                    predicate_properties.push(p);
                }
            }
        }
        if predicates.is_empty() {
            predicate_properties = mapping
                .key_properties()
                .into_iter()
                .map(str::to_string)
                .collect();
        }
        let mut routed_properties = predicate_properties.clone();
        for item in &order {
            for p in item.expr().referenced_properties() {
                if !routed_properties.contains(&p) {
                    routed_properties.push(p);
                }
            }
        }

        Ok(Self {
            id: NEXT_CONTEXT_ID.fetch_add(1, AtomicOrdering::Relaxed),
            query: query.clone(),
            mapping,
            inner,
            predicates,
            predicate,
            order,
            top,
            force_load,
            force_cache,
            loaded: AtomicBool::new(false),
            predicate_properties,
            routed_properties,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// The normalized chain this context was analyzed from.
    pub fn query(&self) -> &QueryExpr {
        &self.query
    }

    pub fn mapping(&self) -> &Arc<TableMapping> {
        &self.mapping
    }

    pub fn inner(&self) -> Option<&Arc<QueryContext>> {
        self.inner.as_ref()
    }

    /// Where-clause expressions, innermost first. They combine with AND.
    pub fn predicates(&self) -> &[Expr] {
        &self.predicates
    }

    pub fn order(&self) -> &[OrderItem] {
        &self.order
    }

    pub fn top(&self) -> Option<usize> {
        self.top
    }

    /// The chain ends in `ForceLoad`: every read goes to the database.
    pub fn is_force_load(&self) -> bool {
        self.force_load
    }

    pub fn is_force_cache(&self) -> bool {
        self.force_cache
    }

    /// No predicate and no limit: every row of the table.
    pub fn is_whole_table(&self) -> bool {
        self.predicates.is_empty() && self.top.is_none()
    }

    /// Should the database be queried before the cache is trusted?
    pub fn should_load(&self) -> bool {
        if self.force_load {
            return true;
        }
        if self.force_cache || self.is_loaded() {
            return false;
        }
        self.inner.as_ref().is_none_or(|inner| inner.should_load())
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.load(AtomicOrdering::Acquire)
    }

    pub fn mark_loaded(&self) {
        self.loaded.store(true, AtomicOrdering::Release);
    }

    pub fn clear_loaded(&self) {
        self.loaded.store(false, AtomicOrdering::Release);
    }

    /// Evaluate the predicate in memory.
    pub fn matches(&self, object: &EntityRef) -> Result<bool> {
        match &self.predicate {
            Some(predicate) => predicate(object),
            None => Ok(true),
        }
    }

    /// Lexicographic comparison by the order items. Selector failures
    /// compare as NULL.
    pub fn compare(&self, a: &EntityRef, b: &EntityRef) -> Ordering {
        for item in &self.order {
            let left = (item.selector())(a).unwrap_or(Value::Null);
            let right = (item.selector())(b).unwrap_or(Value::Null);
            let ordering = item.compare_values(&left, &right);
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    }

    /// Own properties the predicate reads; the key properties when the
    /// context has no predicate.
    pub fn predicate_related_properties(&self) -> &[String] {
        &self.predicate_properties
    }

    /// Properties whose change can alter membership or position.
    pub fn routed_properties(&self) -> &[String] {
        &self.routed_properties
    }
}

impl fmt::Debug for QueryContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryContext")
            .field("id", &self.id)
            .field("query", &self.query.to_string())
            .field("order", &self.order)
            .field("top", &self.top)
            .field("loaded", &self.is_loaded())
            .finish()
    }
}

/// Cache of analyzed contexts, keyed by the normalized query chain.
#[derive(Default)]
pub struct ContextRegistry {
    contexts: Mutex<HashMap<QueryExpr, Weak<QueryContext>>>,
}

impl ContextRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Analyze a chain, reusing the live context of an equal chain.
    pub fn analyse(&self, query: &QueryExpr) -> Result<Arc<QueryContext>> {
        let normalized = query.normalize()?;
        self.analyse_normalized(&normalized)
    }

    fn analyse_normalized(&self, query: &QueryExpr) -> Result<Arc<QueryContext>> {
        if let Some(existing) = self.lookup(query) {
            trace!(context = existing.id(), query = %query, "context cache hit");
            return Ok(existing);
        }
        let inner = match query.inner() {
            Some(inner) => Some(self.analyse_normalized(inner)?),
            None => None,
        };
        let context = Arc::new(QueryContext::build(query, inner)?);

        let mut contexts = self.contexts.lock();
        if let Some(existing) = contexts.get(query).and_then(Weak::upgrade) {
            return Ok(existing);
        }
        debug!(context = context.id(), query = %query, "analyzed query context");
        contexts.insert(query.clone(), Arc::downgrade(&context));
        Ok(context)
    }

    fn lookup(&self, query: &QueryExpr) -> Option<Arc<QueryContext>> {
        self.contexts.lock().get(query).and_then(Weak::upgrade)
    }

    /// Drop entries whose context is gone. Returns how many were removed.
    pub fn prune(&self) -> usize {
        let mut contexts = self.contexts.lock();
        let before = contexts.len();
        contexts.retain(|_, context| context.strong_count() > 0);
        before - contexts.len()
    }

    pub fn len(&self) -> usize {
        self.contexts.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
