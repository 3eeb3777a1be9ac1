use std::{
    collections::{BTreeSet, HashMap},
    fmt,
    ops::{BitAnd, BitOr, Not},
    sync::Arc,
};

use datafusion_common::ScalarValue;

mod bind;
mod eval;

pub(crate) use eval::compare_scalars;
pub use eval::{Binding, PartitionBinding};

/// Result of evaluating a predicate against partial knowledge of a row.
///
/// `Unknown` means the answer depends on values that are not bound, so a
/// fragment can only be pruned on a definite `False`. Connectives follow
/// Kleene's three-valued logic.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TriState {
    /// Holds for every row the binding describes.
    True,
    /// Holds for no row the binding describes.
    False,
    /// Depends on unbound values.
    Unknown,
}

impl TriState {
    /// Kleene conjunction: `False` dominates, then `Unknown`.
    pub fn and(self, other: Self) -> Self {
        match (self, other) {
            (TriState::False, _) | (_, TriState::False) => TriState::False,
            (TriState::True, TriState::True) => TriState::True,
            _ => TriState::Unknown,
        }
    }

    /// Kleene disjunction: `True` dominates, then `Unknown`.
    pub fn or(self, other: Self) -> Self {
        match (self, other) {
            (TriState::True, _) | (_, TriState::True) => TriState::True,
            (TriState::False, TriState::False) => TriState::False,
            _ => TriState::Unknown,
        }
    }

    /// Swaps `True` and `False`; `Unknown` stays unknown.
    pub fn not(self) -> Self {
        match self {
            TriState::True => TriState::False,
            TriState::False => TriState::True,
            TriState::Unknown => TriState::Unknown,
        }
    }

    /// `Some(bool)` for definite answers.
    pub fn as_bool(self) -> Option<bool> {
        match self {
            TriState::True => Some(true),
            TriState::False => Some(false),
            TriState::Unknown => None,
        }
    }
}

impl From<bool> for TriState {
    fn from(value: bool) -> Self {
        if value {
            TriState::True
        } else {
            TriState::False
        }
    }
}

// Operator trait implementations for ergonomic usage
impl BitAnd for TriState {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self::Output {
        self.and(rhs)
    }
}

impl BitOr for TriState {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        self.or(rhs)
    }
}

impl Not for TriState {
    type Output = Self;

    fn not(self) -> Self::Output {
        TriState::not(self)
    }
}

/// Comparison operator of an [`ExprNode::Compare`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum CmpOp {
    /// `==`
    Eq,
    /// `!=`
    NotEq,
    /// `<`
    Lt,
    /// `<=`
    LtEq,
    /// `>`
    Gt,
    /// `>=`
    GtEq,
}

impl CmpOp {
    /// Operator to use when the operands are swapped.
    pub fn flip(self) -> Self {
        match self {
            CmpOp::Eq => CmpOp::Eq,
            CmpOp::NotEq => CmpOp::NotEq,
            CmpOp::Lt => CmpOp::Gt,
            CmpOp::LtEq => CmpOp::GtEq,
            CmpOp::Gt => CmpOp::Lt,
            CmpOp::GtEq => CmpOp::LtEq,
        }
    }

    /// Infix spelling used by `Display`.
    pub fn symbol(self) -> &'static str {
        match self {
            CmpOp::Eq => "==",
            CmpOp::NotEq => "!=",
            CmpOp::Lt => "<",
            CmpOp::LtEq => "<=",
            CmpOp::Gt => ">",
            CmpOp::GtEq => ">=",
        }
    }

    /// Whether `left.cmp(right) == ordering` satisfies this operator.
    pub fn matches(self, ordering: std::cmp::Ordering) -> bool {
        use std::cmp::Ordering::*;
        match self {
            CmpOp::Eq => ordering == Equal,
            CmpOp::NotEq => ordering != Equal,
            CmpOp::Lt => ordering == Less,
            CmpOp::LtEq => ordering != Greater,
            CmpOp::Gt => ordering == Greater,
            CmpOp::GtEq => ordering != Less,
        }
    }
}

/// Index of a node inside an [`ExprArena`] or [`Expression`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct ExprId(u32);

impl ExprId {
    /// Position in the owning arena's node list.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// One node of an expression DAG. Children are referenced by id.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ExprNode {
    /// A literal value.
    Scalar(ScalarValue),
    /// A reference to a field by name.
    Field(String),
    /// `left op right`; both sides are scalars or field references once bound.
    Compare {
        op: CmpOp,
        left: ExprId,
        right: ExprId,
    },
    And(ExprId, ExprId),
    Or(ExprId, ExprId),
    Not(ExprId),
}

impl ExprNode {
    fn children(&self) -> impl Iterator<Item = ExprId> {
        let (a, b) = match *self {
            ExprNode::Scalar(_) | ExprNode::Field(_) => (None, None),
            ExprNode::Compare { left, right, .. } => (Some(left), Some(right)),
            ExprNode::And(l, r) | ExprNode::Or(l, r) => (Some(l), Some(r)),
            ExprNode::Not(e) => (Some(e), None),
        };
        a.into_iter().chain(b)
    }
}

/// Append-only node storage with hash-consing.
///
/// A node can only refer to ids that already exist when it is pushed, so an
/// arena never contains a cycle. Pushing a node equal to an existing one
/// returns the existing id, which is how common sub-expressions end up shared.
///
/// ```
/// use quarry::{CmpOp, ExprArena};
///
/// let mut arena = ExprArena::new();
/// let year = arena.field("year");
/// let y2020 = arena.scalar(2020i32);
/// let eq = arena.compare(CmpOp::Eq, year, y2020);
/// // `year` is interned, not duplicated
/// assert_eq!(arena.field("year"), year);
/// let expr = arena.finish(eq);
/// assert_eq!(expr.to_string(), "(year == 2020)");
/// ```
#[derive(Clone, Debug, Default)]
pub struct ExprArena {
    nodes: Vec<ExprNode>,
    interned: HashMap<ExprNode, ExprId>,
}

impl ExprArena {
    /// Create an empty arena.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct nodes pushed so far.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// The node stored at `id`.
    ///
    /// # Panics
    ///
    /// Panics if `id` was not issued by this arena.
    pub fn node(&self, id: ExprId) -> &ExprNode {
        &self.nodes[id.index()]
    }

    /// Insert a node, returning the id of an identical node if one exists.
    ///
    /// # Panics
    ///
    /// Panics if the node references an id that is not in this arena.
    pub fn push(&mut self, node: ExprNode) -> ExprId {
        if let Some(id) = self.interned.get(&node) {
            return *id;
        }
        for child in node.children() {
            assert!(
                child.index() < self.nodes.len(),
                "expression child {child:?} does not exist in arena"
            );
        }
        let id = ExprId(u32::try_from(self.nodes.len()).expect("expression arena overflow"));
        self.nodes.push(node.clone());
        self.interned.insert(node, id);
        id
    }

    /// Intern a literal.
    pub fn scalar(&mut self, value: impl Into<ScalarValue>) -> ExprId {
        self.push(ExprNode::Scalar(value.into()))
    }

    /// Intern a field reference.
    pub fn field(&mut self, name: impl Into<String>) -> ExprId {
        self.push(ExprNode::Field(name.into()))
    }

    /// Intern `left op right`.
    pub fn compare(&mut self, op: CmpOp, left: ExprId, right: ExprId) -> ExprId {
        self.push(ExprNode::Compare { op, left, right })
    }

    /// Intern the conjunction of two existing nodes.
    pub fn and(&mut self, left: ExprId, right: ExprId) -> ExprId {
        self.push(ExprNode::And(left, right))
    }

    /// Intern the disjunction of two existing nodes.
    pub fn or(&mut self, left: ExprId, right: ExprId) -> ExprId {
        self.push(ExprNode::Or(left, right))
    }

    /// Intern the negation of an existing node.
    pub fn not(&mut self, inner: ExprId) -> ExprId {
        self.push(ExprNode::Not(inner))
    }

    /// Copy the sub-expression rooted at `id` of `expr` into this arena.
    pub fn import(&mut self, expr: &Expression, id: ExprId) -> ExprId {
        let mut remap = HashMap::new();
        self.import_node(expr, id, &mut remap)
    }

    fn import_node(
        &mut self,
        expr: &Expression,
        id: ExprId,
        remap: &mut HashMap<ExprId, ExprId>,
    ) -> ExprId {
        if let Some(mapped) = remap.get(&id) {
            return *mapped;
        }
        let node = match expr.node(id) {
            ExprNode::Scalar(value) => ExprNode::Scalar(value.clone()),
            ExprNode::Field(name) => ExprNode::Field(name.clone()),
            ExprNode::Compare { op, left, right } => ExprNode::Compare {
                op: *op,
                left: self.import_node(expr, *left, remap),
                right: self.import_node(expr, *right, remap),
            },
            ExprNode::And(l, r) => {
                ExprNode::And(self.import_node(expr, *l, remap), self.import_node(expr, *r, remap))
            }
            ExprNode::Or(l, r) => {
                ExprNode::Or(self.import_node(expr, *l, remap), self.import_node(expr, *r, remap))
            }
            ExprNode::Not(inner) => ExprNode::Not(self.import_node(expr, *inner, remap)),
        };
        let mapped = self.push(node);
        remap.insert(id, mapped);
        mapped
    }

    /// Freeze the arena into an immutable expression rooted at `root`.
    pub fn finish(self, root: ExprId) -> Expression {
        assert!(root.index() < self.nodes.len(), "root {root:?} not in arena");
        Expression {
            nodes: self.nodes.into(),
            root,
        }
    }
}

/// Immutable predicate or value expression.
///
/// Cloning is cheap: the nodes live in a shared arena. Expressions built with
/// the combinators below (`col("a").eq(lit(1)).and(...)`) are copied into a
/// fresh arena on every combination, re-interning shared sub-expressions.
#[derive(Clone)]
pub struct Expression {
    nodes: Arc<[ExprNode]>,
    root: ExprId,
}

/// Reference a field by name.
pub fn col(name: impl Into<String>) -> Expression {
    Expression::field(name)
}

/// Wrap a scalar value.
pub fn lit(value: impl Into<ScalarValue>) -> Expression {
    Expression::scalar(value)
}

impl Expression {
    fn single(node: ExprNode) -> Self {
        let mut arena = ExprArena::new();
        let root = arena.push(node);
        arena.finish(root)
    }

    /// A single literal; same as [`lit`].
    pub fn scalar(value: impl Into<ScalarValue>) -> Self {
        Self::single(ExprNode::Scalar(value.into()))
    }

    /// A single field reference; same as [`col`].
    pub fn field(name: impl Into<String>) -> Self {
        Self::single(ExprNode::Field(name.into()))
    }

    /// The always-true expression, used when nothing is known about a fragment.
    pub fn literal_true() -> Self {
        Self::scalar(true)
    }

    /// The always-false expression.
    pub fn literal_false() -> Self {
        Self::scalar(false)
    }

    fn binary(self, rhs: Expression, make: impl FnOnce(ExprId, ExprId) -> ExprNode) -> Self {
        let mut arena = ExprArena::new();
        let left = arena.import(&self, self.root);
        let right = arena.import(&rhs, rhs.root);
        let root = arena.push(make(left, right));
        arena.finish(root)
    }

    /// `self op rhs`. The named methods below are shorthands for each
    /// [`CmpOp`].
    pub fn compare(self, op: CmpOp, rhs: Expression) -> Self {
        self.binary(rhs, |left, right| ExprNode::Compare { op, left, right })
    }

    /// `self == rhs`
    pub fn eq(self, rhs: Expression) -> Self {
        self.compare(CmpOp::Eq, rhs)
    }

    /// `self != rhs`
    pub fn not_eq(self, rhs: Expression) -> Self {
        self.compare(CmpOp::NotEq, rhs)
    }

    /// `self < rhs`
    pub fn lt(self, rhs: Expression) -> Self {
        self.compare(CmpOp::Lt, rhs)
    }

    /// `self <= rhs`
    pub fn lt_eq(self, rhs: Expression) -> Self {
        self.compare(CmpOp::LtEq, rhs)
    }

    /// `self > rhs`
    pub fn gt(self, rhs: Expression) -> Self {
        self.compare(CmpOp::Gt, rhs)
    }

    /// `self >= rhs`
    pub fn gt_eq(self, rhs: Expression) -> Self {
        self.compare(CmpOp::GtEq, rhs)
    }

    /// Both `self` and `rhs`.
    pub fn and(self, rhs: Expression) -> Self {
        self.binary(rhs, ExprNode::And)
    }

    /// Either `self` or `rhs`.
    pub fn or(self, rhs: Expression) -> Self {
        self.binary(rhs, ExprNode::Or)
    }

    /// Left-folded `And` of all parts; `true` when empty.
    pub fn conjunction(parts: impl IntoIterator<Item = Expression>) -> Self {
        let mut arena = ExprArena::new();
        let mut root = None;
        for part in parts {
            let id = arena.import(&part, part.root);
            root = Some(match root {
                None => id,
                Some(acc) => arena.and(acc, id),
            });
        }
        match root {
            Some(root) => arena.finish(root),
            None => Self::literal_true(),
        }
    }

    /// Id of the top-level node.
    pub fn root(&self) -> ExprId {
        self.root
    }

    /// The node at `id` in the backing arena.
    pub fn node(&self, id: ExprId) -> &ExprNode {
        &self.nodes[id.index()]
    }

    pub fn root_node(&self) -> &ExprNode {
        self.node(self.root)
    }

    /// Number of distinct nodes backing this expression.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Expression rooted at one of this expression's nodes, sharing storage.
    pub fn subexpression(&self, id: ExprId) -> Expression {
        Expression {
            nodes: Arc::clone(&self.nodes),
            root: id,
        }
    }

    /// The literal value, when the whole expression is one.
    pub fn as_scalar(&self) -> Option<&ScalarValue> {
        match self.root_node() {
            ExprNode::Scalar(value) => Some(value),
            _ => None,
        }
    }

    pub fn is_literal_true(&self) -> bool {
        matches!(self.as_scalar(), Some(ScalarValue::Boolean(Some(true))))
    }

    pub fn is_literal_false(&self) -> bool {
        matches!(self.as_scalar(), Some(ScalarValue::Boolean(Some(false))))
    }

    /// Names of all fields referenced anywhere in the expression.
    pub fn field_names(&self) -> BTreeSet<&str> {
        let mut names = BTreeSet::new();
        let mut stack = vec![self.root];
        let mut seen = vec![false; self.nodes.len()];
        while let Some(id) = stack.pop() {
            if std::mem::replace(&mut seen[id.index()], true) {
                continue;
            }
            let node = self.node(id);
            if let ExprNode::Field(name) = node {
                names.insert(name.as_str());
            }
            stack.extend(node.children());
        }
        names
    }

    /// Operands of the top-level `And` chain.
    pub fn conjuncts(&self) -> Vec<Expression> {
        let mut out = Vec::new();
        let mut stack = vec![self.root];
        while let Some(id) = stack.pop() {
            match self.node(id) {
                ExprNode::And(l, r) => {
                    stack.push(*r);
                    stack.push(*l);
                }
                _ => out.push(self.subexpression(id)),
            }
        }
        out
    }

    fn structurally_equal(&self, a: ExprId, other: &Expression, b: ExprId) -> bool {
        match (self.node(a), other.node(b)) {
            (ExprNode::Scalar(x), ExprNode::Scalar(y)) => x == y,
            (ExprNode::Field(x), ExprNode::Field(y)) => x == y,
            (
                ExprNode::Compare { op, left, right },
                ExprNode::Compare {
                    op: op2,
                    left: left2,
                    right: right2,
                },
            ) => {
                op == op2
                    && self.structurally_equal(*left, other, *left2)
                    && self.structurally_equal(*right, other, *right2)
            }
            (ExprNode::And(l, r), ExprNode::And(l2, r2))
            | (ExprNode::Or(l, r), ExprNode::Or(l2, r2)) => {
                self.structurally_equal(*l, other, *l2) && self.structurally_equal(*r, other, *r2)
            }
            (ExprNode::Not(x), ExprNode::Not(y)) => self.structurally_equal(*x, other, *y),
            _ => false,
        }
    }

    fn fmt_node(&self, id: ExprId, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.node(id) {
            ExprNode::Scalar(value) => match value {
                ScalarValue::Utf8(Some(s)) | ScalarValue::LargeUtf8(Some(s)) => {
                    write!(f, "\"{s}\"")
                }
                other => write!(f, "{other}"),
            },
            ExprNode::Field(name) => f.write_str(name),
            ExprNode::Compare { op, left, right } => {
                f.write_str("(")?;
                self.fmt_node(*left, f)?;
                write!(f, " {} ", op.symbol())?;
                self.fmt_node(*right, f)?;
                f.write_str(")")
            }
            ExprNode::And(l, r) => {
                f.write_str("(")?;
                self.fmt_node(*l, f)?;
                f.write_str(" and ")?;
                self.fmt_node(*r, f)?;
                f.write_str(")")
            }
            ExprNode::Or(l, r) => {
                f.write_str("(")?;
                self.fmt_node(*l, f)?;
                f.write_str(" or ")?;
                self.fmt_node(*r, f)?;
                f.write_str(")")
            }
            ExprNode::Not(inner) => {
                f.write_str("not ")?;
                self.fmt_node(*inner, f)
            }
        }
    }
}

impl Not for Expression {
    type Output = Expression;

    fn not(self) -> Self::Output {
        let mut arena = ExprArena::new();
        let inner = arena.import(&self, self.root);
        let root = arena.not(inner);
        arena.finish(root)
    }
}

impl PartialEq for Expression {
    fn eq(&self, other: &Self) -> bool {
        self.structurally_equal(self.root, other, other.root)
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_node(self.root, f)
    }
}

impl fmt::Debug for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Expression({self})")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combinators_share_common_subexpressions() {
        let year = col("year").eq(lit(2020i32));
        let expr = year.clone().and(year.clone().or(col("month").eq(lit(1i32))));
        // year, 2020, year==2020, month, 1, month==1, or, and
        assert_eq!(expr.node_count(), 8);
        assert_eq!(
            expr.to_string(),
            "((year == 2020) and ((year == 2020) or (month == 1)))"
        );
    }

    #[test]
    fn structural_equality_ignores_arena_layout() {
        let mut arena = ExprArena::new();
        let one = arena.scalar(1i64);
        let a = arena.field("a");
        let cmp = arena.compare(CmpOp::Lt, a, one);
        let built = arena.finish(cmp);

        assert_eq!(built, col("a").lt(lit(1i64)));
        assert_ne!(built, col("a").lt(lit(2i64)));
        assert_ne!(built, col("a").gt(lit(1i64)));
    }

    #[test]
    #[should_panic(expected = "does not exist in arena")]
    fn push_rejects_forward_references() {
        let mut arena = ExprArena::new();
        arena.push(ExprNode::Not(ExprId(3)));
    }

    #[test]
    fn field_names_and_conjuncts() {
        let expr = Expression::conjunction([
            col("a").eq(lit(1i32)),
            col("b").gt(col("c")),
            !col("a").eq(lit(2i32)),
        ]);
        let names: Vec<_> = expr.field_names().into_iter().collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        let parts = expr.conjuncts();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[1], col("b").gt(col("c")));
        assert!(Expression::conjunction([]).is_literal_true());
    }

    #[test]
    fn tri_state_kleene_logic() {
        use TriState::*;
        assert_eq!(False & Unknown, False);
        assert_eq!(True & Unknown, Unknown);
        assert_eq!(True | Unknown, True);
        assert_eq!(False | Unknown, Unknown);
        assert_eq!(!Unknown, Unknown);
        assert_eq!(!True, False);
    }

    #[test]
    fn cmp_op_flip_preserves_meaning() {
        use std::cmp::Ordering;
        for op in [CmpOp::Eq, CmpOp::NotEq, CmpOp::Lt, CmpOp::LtEq, CmpOp::Gt, CmpOp::GtEq] {
            for ordering in [Ordering::Less, Ordering::Equal, Ordering::Greater] {
                assert_eq!(op.matches(ordering), op.flip().matches(ordering.reverse()));
            }
        }
    }
}
