//! Query plan types: the accumulated, backend-independent description of a
//! query that the SQL translator compiles.

use vellum_core::DocValue;

/// Comparison operator of a filter leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    Nin,
    Contains,
    StartsWith,
    EndsWith,
    /// Raw `LIKE` pattern supplied by the caller, no wildcard escaping.
    Like,
    IsNull,
    NotNull,
    Between,
}

/// Operand of a filter leaf; shape depends on the operator.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum FilterValue {
    /// `is_null` / `not_null` take no operand.
    #[default]
    None,
    One(DocValue),
    /// `in` / `nin` lists.
    Many(Vec<DocValue>),
    /// `between` bounds, inclusive.
    Range(DocValue, DocValue),
}

/// A single predicate: `path op value`.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterLeaf {
    pub path: String,
    pub op: FilterOp,
    pub value: FilterValue,
}

/// One node of the top-level AND list.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterNode {
    Leaf(FilterLeaf),
    /// An OR of branches, each branch an AND list of leaves. This is the one
    /// level of explicit grouping the plan supports.
    OrGroup(Vec<Vec<FilterLeaf>>),
}

/// The accumulated predicate structure: an AND over its nodes.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FilterTree {
    pub nodes: Vec<FilterNode>,
}

impl FilterTree {
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Adds a leaf to the AND list.
    pub fn push_leaf(&mut self, leaf: FilterLeaf) {
        self.nodes.push(FilterNode::Leaf(leaf));
    }

    /// Adds a branch to the trailing OR-group, opening one if the last node
    /// is not already an OR-group.
    pub fn push_or_branch(&mut self, branch: Vec<FilterLeaf>) {
        if let Some(FilterNode::OrGroup(branches)) = self.nodes.last_mut() {
            branches.push(branch);
        } else {
            self.nodes.push(FilterNode::OrGroup(vec![branch]));
        }
    }
}

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDir {
    Asc,
    Desc,
}

impl SortDir {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

/// The full, backend-independent description of a query.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct QueryPlan {
    pub filters: FilterTree,
    /// `(path, direction)` pairs, applied in order.
    pub ordering: Vec<(String, SortDir)>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    pub distinct: bool,
    /// Projected field paths; empty selects the full document.
    pub projection: Vec<String>,
}
