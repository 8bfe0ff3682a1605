//! The fluent query builder.
//!
//! [`QueryBuilder`] accumulates a [`QueryPlan`]; [`FieldBuilder`] is the
//! intermediate state returned by `where_field` whose only exits are the
//! comparison operators, so a filter can never be left half-built. Path
//! validation failures do not break the chain; they are remembered and
//! surfaced by the terminal operation.

use vellum_core::catalog::CollectionSchema;
use vellum_core::error::{Result, VellumError};
use vellum_core::value::DocValue;

use crate::plan::{FilterLeaf, FilterOp, FilterValue, QueryPlan, SortDir};

/// Executes compiled plans. Implemented by the collection runtime; the
/// builder itself stays backend-free.
pub trait QueryExecutor {
    /// Materializes all matching documents.
    fn run_select(&self, plan: &QueryPlan) -> Result<Vec<DocValue>>;

    /// Counts matching rows.
    fn run_count(&self, plan: &QueryPlan) -> Result<u64>;

    /// Streams matching documents row-at-a-time without materializing the
    /// full result set.
    fn run_stream(
        &self,
        plan: &QueryPlan,
        on_doc: &mut dyn FnMut(DocValue) -> Result<()>,
    ) -> Result<()>;
}

/// Fluent accumulator over a [`QueryPlan`].
pub struct QueryBuilder<'a> {
    schema: &'a CollectionSchema,
    executor: Option<&'a dyn QueryExecutor>,
    plan: QueryPlan,
    pending_error: Option<VellumError>,
}

impl<'a> QueryBuilder<'a> {
    /// A builder bound to an executor; the usual entry point, via
    /// `Collection::query()`.
    pub fn new(schema: &'a CollectionSchema, executor: &'a dyn QueryExecutor) -> Self {
        Self {
            schema,
            executor: Some(executor),
            plan: QueryPlan::default(),
            pending_error: None,
        }
    }

    /// A builder with no executor; terminals fail, but the plan can be
    /// inspected. Used for plan construction and tests.
    pub fn detached(schema: &'a CollectionSchema) -> Self {
        Self {
            schema,
            executor: None,
            plan: QueryPlan::default(),
            pending_error: None,
        }
    }

    // -- Filters -------------------------------------------------------------

    /// Starts a filter on a field path. The returned [`FieldBuilder`] must be
    /// completed with a comparison operator.
    pub fn where_field(mut self, path: impl Into<String>) -> FieldBuilder<Self> {
        let path = path.into();
        if let Err(e) = validate_path(self.schema, &path) {
            self.remember(e);
        }
        FieldBuilder { sink: self, path }
    }

    /// Adds a branch to the trailing OR-group: the closure builds an AND
    /// list that is OR-ed with adjacent `or_where` branches.
    ///
    /// ```text
    /// q.where_field("status").eq("active")
    ///  .or_where(|b| b.where_field("role").eq("admin"))
    ///  .or_where(|b| b.where_field("role").eq("mod"))
    /// // status = 'active' AND (role = 'admin' OR role = 'mod')
    /// ```
    pub fn or_where(
        mut self,
        f: impl FnOnce(OrBranchBuilder<'a>) -> OrBranchBuilder<'a>,
    ) -> Self {
        let branch = f(OrBranchBuilder {
            schema: self.schema,
            leaves: Vec::new(),
            pending_error: None,
        });
        if let Some(e) = branch.pending_error {
            self.remember(e);
        }
        if !branch.leaves.is_empty() {
            self.plan.filters.push_or_branch(branch.leaves);
        }
        self
    }

    // -- Ordering & pagination ------------------------------------------------

    pub fn order_by(mut self, path: impl Into<String>, dir: SortDir) -> Self {
        let path = path.into();
        if let Err(e) = validate_path(self.schema, &path) {
            self.remember(e);
        }
        self.plan.ordering.push((path, dir));
        self
    }

    pub fn order_by_many(
        mut self,
        orderings: impl IntoIterator<Item = (impl Into<String>, SortDir)>,
    ) -> Self {
        for (path, dir) in orderings {
            self = self.order_by(path, dir);
        }
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.plan.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.plan.offset = Some(offset);
        self
    }

    /// 1-based pagination; desugars to `limit(size).offset((page-1)*size)`.
    pub fn page(mut self, page: u64, size: u64) -> Self {
        if page == 0 {
            self.remember(VellumError::validation("page numbers start at 1"));
            return self;
        }
        self.limit(size).offset((page - 1) * size)
    }

    pub fn distinct(mut self) -> Self {
        self.plan.distinct = true;
        self
    }

    /// Restricts the result to the named paths; nested structure is
    /// reconstructed from dotted paths on read.
    pub fn select(mut self, paths: impl IntoIterator<Item = impl Into<String>>) -> Self {
        for path in paths {
            let path = path.into();
            if let Err(e) = validate_path(self.schema, &path) {
                self.remember(e);
            }
            self.plan.projection.push(path);
        }
        self
    }

    // -- Terminals -----------------------------------------------------------

    /// Materializes all matching documents.
    pub fn to_vec(self) -> Result<Vec<DocValue>> {
        let (executor, plan) = self.finish()?;
        executor.run_select(&plan)
    }

    /// The first matching document, if any.
    pub fn first(self) -> Result<Option<DocValue>> {
        let (executor, mut plan) = self.finish()?;
        plan.limit = Some(1);
        Ok(executor.run_select(&plan)?.into_iter().next())
    }

    /// Counts matching rows.
    pub fn count(self) -> Result<u64> {
        let (executor, plan) = self.finish()?;
        executor.run_count(&plan)
    }

    /// Streams matching documents without materializing the result set.
    pub fn for_each(self, mut f: impl FnMut(DocValue) -> Result<()>) -> Result<()> {
        let (executor, plan) = self.finish()?;
        executor.run_stream(&plan, &mut f)
    }

    /// The accumulated plan, surfacing any deferred validation error.
    pub fn into_plan(self) -> Result<QueryPlan> {
        match self.pending_error {
            Some(e) => Err(e),
            None => Ok(self.plan),
        }
    }

    /// The plan built so far, ignoring deferred errors. For inspection.
    pub fn plan(&self) -> &QueryPlan {
        &self.plan
    }

    fn finish(self) -> Result<(&'a dyn QueryExecutor, QueryPlan)> {
        let executor = self.executor.ok_or_else(|| {
            VellumError::validation("query builder is not bound to a collection")
        })?;
        match self.pending_error {
            Some(e) => Err(e),
            None => Ok((executor, self.plan)),
        }
    }

    fn remember(&mut self, e: VellumError) {
        // First error wins; later ones are usually knock-on effects.
        self.pending_error.get_or_insert(e);
    }
}

/// Builds one AND branch of an OR-group inside [`QueryBuilder::or_where`].
pub struct OrBranchBuilder<'a> {
    schema: &'a CollectionSchema,
    leaves: Vec<FilterLeaf>,
    pending_error: Option<VellumError>,
}

impl<'a> OrBranchBuilder<'a> {
    /// Starts a filter on a field path within this branch.
    pub fn where_field(mut self, path: impl Into<String>) -> FieldBuilder<Self> {
        let path = path.into();
        if let Err(e) = validate_path(self.schema, &path) {
            self.pending_error.get_or_insert(e);
        }
        FieldBuilder { sink: self, path }
    }
}

/// Where filter leaves land; implemented by both builder flavours.
pub trait FilterSink: Sized {
    fn accept(self, leaf: FilterLeaf) -> Self;
}

impl FilterSink for QueryBuilder<'_> {
    fn accept(mut self, leaf: FilterLeaf) -> Self {
        self.plan.filters.push_leaf(leaf);
        self
    }
}

impl FilterSink for OrBranchBuilder<'_> {
    fn accept(mut self, leaf: FilterLeaf) -> Self {
        self.leaves.push(leaf);
        self
    }
}

/// Comparison stage returned by `where_field`. Every operator returns to the
/// parent builder, so the only way out is through a completed filter.
pub struct FieldBuilder<S: FilterSink> {
    sink: S,
    path: String,
}

impl<S: FilterSink> FieldBuilder<S> {
    fn emit(self, op: FilterOp, value: FilterValue) -> S {
        self.sink.accept(FilterLeaf {
            path: self.path,
            op,
            value,
        })
    }

    pub fn eq(self, value: impl Into<DocValue>) -> S {
        self.emit(FilterOp::Eq, FilterValue::One(value.into()))
    }

    pub fn ne(self, value: impl Into<DocValue>) -> S {
        self.emit(FilterOp::Ne, FilterValue::One(value.into()))
    }

    pub fn gt(self, value: impl Into<DocValue>) -> S {
        self.emit(FilterOp::Gt, FilterValue::One(value.into()))
    }

    pub fn gte(self, value: impl Into<DocValue>) -> S {
        self.emit(FilterOp::Gte, FilterValue::One(value.into()))
    }

    pub fn lt(self, value: impl Into<DocValue>) -> S {
        self.emit(FilterOp::Lt, FilterValue::One(value.into()))
    }

    pub fn lte(self, value: impl Into<DocValue>) -> S {
        self.emit(FilterOp::Lte, FilterValue::One(value.into()))
    }

    /// Inclusive range.
    pub fn between(self, lo: impl Into<DocValue>, hi: impl Into<DocValue>) -> S {
        self.emit(FilterOp::Between, FilterValue::Range(lo.into(), hi.into()))
    }

    pub fn in_values(self, values: impl IntoIterator<Item = impl Into<DocValue>>) -> S {
        self.emit(
            FilterOp::In,
            FilterValue::Many(values.into_iter().map(Into::into).collect()),
        )
    }

    pub fn nin_values(self, values: impl IntoIterator<Item = impl Into<DocValue>>) -> S {
        self.emit(
            FilterOp::Nin,
            FilterValue::Many(values.into_iter().map(Into::into).collect()),
        )
    }

    /// Substring match; wildcards in `value` are escaped.
    pub fn contains(self, value: impl Into<String>) -> S {
        self.emit(
            FilterOp::Contains,
            FilterValue::One(DocValue::String(value.into())),
        )
    }

    pub fn starts_with(self, value: impl Into<String>) -> S {
        self.emit(
            FilterOp::StartsWith,
            FilterValue::One(DocValue::String(value.into())),
        )
    }

    pub fn ends_with(self, value: impl Into<String>) -> S {
        self.emit(
            FilterOp::EndsWith,
            FilterValue::One(DocValue::String(value.into())),
        )
    }

    /// Raw `LIKE` pattern; wildcards pass through untouched.
    pub fn like(self, pattern: impl Into<String>) -> S {
        self.emit(
            FilterOp::Like,
            FilterValue::One(DocValue::String(pattern.into())),
        )
    }

    pub fn is_null(self) -> S {
        self.emit(FilterOp::IsNull, FilterValue::None)
    }

    pub fn not_null(self) -> S {
        self.emit(FilterOp::NotNull, FilterValue::None)
    }
}

/// Validates a field path.
///
/// A flat name must be declared in the shape (permissive shapes accept any
/// name). A dotted path is accepted as a JSON extraction path and checked
/// structurally. All segments are restricted to identifier characters, which
/// is also what keeps paths safe to embed in `json_extract` literals.
fn validate_path(schema: &CollectionSchema, path: &str) -> Result<()> {
    if path.is_empty() {
        return Err(VellumError::validation("field path must not be empty"));
    }
    for segment in path.split('.') {
        if segment.is_empty() {
            return Err(VellumError::validation(format!(
                "field path '{path}' has an empty segment"
            )));
        }
        if !segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(VellumError::validation(format!(
                "field path '{path}' contains invalid characters"
            )));
        }
    }
    if !path.contains('.') && !schema.shape.has_field(path) {
        return Err(VellumError::validation(format!(
            "unknown field '{path}' in collection '{}'",
            schema.name
        )));
    }
    Ok(())
}
