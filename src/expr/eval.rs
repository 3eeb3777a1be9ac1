//! Three-valued evaluation against a binding of field values, and
//! simplification of an expression under a guarantee.
//!
//! Evaluation never fails. A reference to an unbound field, a null value, a
//! non-boolean operand in boolean position or a comparison between values of
//! different types all produce [`TriState::Unknown`], which callers must read
//! as "cannot prune, must materialize".

use std::{
    borrow::Cow,
    collections::{BTreeMap, HashMap},
};

use datafusion_common::ScalarValue;

use super::{CmpOp, ExprArena, ExprId, ExprNode, Expression, TriState};

/// Source of field values for evaluation (a row, or a fragment's partition keys).
pub trait Binding {
    /// The value of `field`, or `None` when it is unbound.
    fn value(&self, field: &str) -> Option<&ScalarValue>;
}

impl Binding for HashMap<String, ScalarValue> {
    fn value(&self, field: &str) -> Option<&ScalarValue> {
        self.get(field)
    }
}

impl Binding for BTreeMap<String, ScalarValue> {
    fn value(&self, field: &str) -> Option<&ScalarValue> {
        self.get(field)
    }
}

/// Field values pinned by a fragment's partition expression.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PartitionBinding {
    values: BTreeMap<String, ScalarValue>,
}

impl PartitionBinding {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pin `field` to `value`, replacing any earlier value.
    pub fn insert(&mut self, field: impl Into<String>, value: ScalarValue) {
        self.values.insert(field.into(), value);
    }

    /// The pinned value of `field`, if any.
    pub fn get(&self, field: &str) -> Option<&ScalarValue> {
        self.values.get(field)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Pinned fields in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &ScalarValue)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }
}

impl Binding for PartitionBinding {
    fn value(&self, field: &str) -> Option<&ScalarValue> {
        self.values.get(field)
    }
}

impl<K: Into<String>> FromIterator<(K, ScalarValue)> for PartitionBinding {
    fn from_iter<I: IntoIterator<Item = (K, ScalarValue)>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }
}

enum Value<'a> {
    Scalar(Cow<'a, ScalarValue>),
    Unknown,
}

impl Value<'_> {
    fn truth(&self) -> TriState {
        match self {
            Value::Scalar(value) => match value.as_ref() {
                ScalarValue::Boolean(Some(b)) => TriState::from(*b),
                _ => TriState::Unknown,
            },
            Value::Unknown => TriState::Unknown,
        }
    }

    fn from_tri(tri: TriState) -> Value<'static> {
        match tri.as_bool() {
            Some(b) => Value::Scalar(Cow::Owned(ScalarValue::Boolean(Some(b)))),
            None => Value::Unknown,
        }
    }
}

pub(crate) fn compare_scalars(op: CmpOp, left: &ScalarValue, right: &ScalarValue) -> TriState {
    if left.is_null() || right.is_null() || left.data_type() != right.data_type() {
        return TriState::Unknown;
    }
    match left.partial_cmp(right) {
        Some(ordering) => TriState::from(op.matches(ordering)),
        None => TriState::Unknown,
    }
}

impl Expression {
    /// Evaluate the expression against a binding.
    ///
    /// ```
    /// use std::collections::HashMap;
    ///
    /// use datafusion_common::ScalarValue;
    /// use quarry::{TriState, col, lit};
    ///
    /// let filter = col("year").eq(lit(2020i32)).and(col("value").gt(lit(10i64)));
    /// let binding = HashMap::from([("year".to_string(), ScalarValue::Int32(Some(2021)))]);
    /// // `value` is unbound, but the conjunction is already decided by `year`
    /// assert_eq!(filter.evaluate(&binding), TriState::False);
    /// ```
    pub fn evaluate(&self, binding: &dyn Binding) -> TriState {
        self.eval_node(self.root, binding).truth()
    }

    fn eval_node<'a>(&'a self, id: ExprId, binding: &'a dyn Binding) -> Value<'a> {
        match self.node(id) {
            ExprNode::Scalar(value) => Value::Scalar(Cow::Borrowed(value)),
            ExprNode::Field(name) => match binding.value(name) {
                Some(value) => Value::Scalar(Cow::Borrowed(value)),
                None => Value::Unknown,
            },
            ExprNode::Compare { op, left, right } => {
                let (Value::Scalar(left), Value::Scalar(right)) =
                    (self.eval_node(*left, binding), self.eval_node(*right, binding))
                else {
                    return Value::Unknown;
                };
                Value::from_tri(compare_scalars(*op, &left, &right))
            }
            ExprNode::And(l, r) => {
                let left = self.eval_node(*l, binding).truth();
                if left == TriState::False {
                    return Value::from_tri(TriState::False);
                }
                Value::from_tri(left.and(self.eval_node(*r, binding).truth()))
            }
            ExprNode::Or(l, r) => {
                let left = self.eval_node(*l, binding).truth();
                if left == TriState::True {
                    return Value::from_tri(TriState::True);
                }
                Value::from_tri(left.or(self.eval_node(*r, binding).truth()))
            }
            ExprNode::Not(inner) => Value::from_tri(self.eval_node(*inner, binding).truth().not()),
        }
    }

    /// Field values pinned by `field == scalar` conjuncts.
    ///
    /// Conjuncts of any other shape are ignored. A field pinned to two
    /// different values keeps the first one; the expression is then
    /// unsatisfiable anyway and evaluation of the conjunction stays sound.
    pub fn known_field_values(&self) -> PartitionBinding {
        let mut binding = PartitionBinding::new();
        for conjunct in self.conjuncts() {
            let ExprNode::Compare {
                op: CmpOp::Eq,
                left,
                right,
            } = conjunct.root_node()
            else {
                continue;
            };
            let pinned = match (conjunct.node(*left), conjunct.node(*right)) {
                (ExprNode::Field(name), ExprNode::Scalar(value))
                | (ExprNode::Scalar(value), ExprNode::Field(name)) => Some((name, value)),
                _ => None,
            };
            if let Some((name, value)) = pinned {
                if value.is_null() {
                    continue;
                }
                binding
                    .values
                    .entry(name.clone())
                    .or_insert_with(|| value.clone());
            }
        }
        binding
    }

    /// Simplify this expression assuming `guarantee` holds.
    ///
    /// Every sub-expression whose value is decided by the guarantee's pinned
    /// field values is replaced by a boolean literal, and literal operands of
    /// `And`/`Or` are folded away. What remains is the residual predicate that
    /// still has to be checked row by row.
    ///
    /// ```
    /// use quarry::{col, lit};
    ///
    /// let filter = col("year").eq(lit(2020i32)).and(col("value").gt(lit(10i64)));
    /// let partition = col("year").eq(lit(2020i32));
    /// assert_eq!(
    ///     filter.simplify_with_guarantee(&partition),
    ///     col("value").gt(lit(10i64))
    /// );
    /// ```
    pub fn simplify_with_guarantee(&self, guarantee: &Expression) -> Expression {
        self.simplify_with_binding(&guarantee.known_field_values())
    }

    /// Like [`Expression::simplify_with_guarantee`], with the known values
    /// given directly.
    pub fn simplify_with_binding(&self, binding: &dyn Binding) -> Expression {
        let mut arena = ExprArena::new();
        let mut memo = HashMap::new();
        let root = self.fold(self.root, binding, &mut arena, &mut memo);
        arena.finish(root)
    }

    fn fold(
        &self,
        id: ExprId,
        binding: &dyn Binding,
        arena: &mut ExprArena,
        memo: &mut HashMap<ExprId, ExprId>,
    ) -> ExprId {
        if let Some(done) = memo.get(&id) {
            return *done;
        }
        let node = self.node(id);
        let folded = match node {
            ExprNode::Scalar(value) => arena.scalar(value.clone()),
            ExprNode::Field(name) => match binding.value(name) {
                Some(value) => arena.scalar(value.clone()),
                None => arena.field(name.clone()),
            },
            ExprNode::Compare { op, left, right } => {
                match self.eval_node(id, binding).truth().as_bool() {
                    Some(b) => arena.scalar(b),
                    None => {
                        let left = self.fold(*left, binding, arena, memo);
                        let right = self.fold(*right, binding, arena, memo);
                        arena.compare(*op, left, right)
                    }
                }
            }
            ExprNode::And(l, r) => {
                let left = self.fold(*l, binding, arena, memo);
                let right = self.fold(*r, binding, arena, memo);
                match (literal_bool(arena, left), literal_bool(arena, right)) {
                    (Some(false), _) | (_, Some(false)) => arena.scalar(false),
                    (Some(true), _) => right,
                    (_, Some(true)) => left,
                    _ => arena.and(left, right),
                }
            }
            ExprNode::Or(l, r) => {
                let left = self.fold(*l, binding, arena, memo);
                let right = self.fold(*r, binding, arena, memo);
                match (literal_bool(arena, left), literal_bool(arena, right)) {
                    (Some(true), _) | (_, Some(true)) => arena.scalar(true),
                    (Some(false), _) => right,
                    (_, Some(false)) => left,
                    _ => arena.or(left, right),
                }
            }
            ExprNode::Not(inner) => {
                let inner = self.fold(*inner, binding, arena, memo);
                match literal_bool(arena, inner) {
                    Some(b) => arena.scalar(!b),
                    None => arena.not(inner),
                }
            }
        };
        memo.insert(id, folded);
        folded
    }
}

fn literal_bool(arena: &ExprArena, id: ExprId) -> Option<bool> {
    match arena.node(id) {
        ExprNode::Scalar(ScalarValue::Boolean(Some(b))) => Some(*b),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{col, lit};

    fn binding(pairs: &[(&str, ScalarValue)]) -> PartitionBinding {
        pairs.iter().map(|(k, v)| (*k, v.clone())).collect()
    }

    #[test]
    fn compare_uses_typed_order() {
        let b = binding(&[
            ("n", ScalarValue::Int64(Some(10))),
            ("s", ScalarValue::Utf8(Some("b".into()))),
        ]);
        assert_eq!(col("n").gt(lit(9i64)).evaluate(&b), TriState::True);
        assert_eq!(col("n").lt(lit(9i64)).evaluate(&b), TriState::False);
        // byte-lexicographic for strings: "b" > "abc"
        assert_eq!(col("s").gt(lit("abc")).evaluate(&b), TriState::True);
        assert_eq!(col("s").lt_eq(lit("b")).evaluate(&b), TriState::True);
    }

    #[test]
    fn mismatched_missing_and_null_are_unknown() {
        let b = binding(&[
            ("n", ScalarValue::Int64(Some(10))),
            ("z", ScalarValue::Int64(None)),
        ]);
        assert_eq!(col("n").eq(lit("10")).evaluate(&b), TriState::Unknown);
        assert_eq!(col("n").eq(lit(10i32)).evaluate(&b), TriState::Unknown);
        assert_eq!(col("missing").eq(lit(1i64)).evaluate(&b), TriState::Unknown);
        assert_eq!(col("z").eq(lit(1i64)).evaluate(&b), TriState::Unknown);
        // non-boolean value in boolean position
        assert_eq!(col("n").evaluate(&b), TriState::Unknown);
    }

    #[test]
    fn connectives_decide_only_when_definite() {
        let b = binding(&[("year", ScalarValue::Int32(Some(2020)))]);
        let unknown = col("value").gt(lit(1i64));
        let yes = col("year").eq(lit(2020i32));
        let no = col("year").eq(lit(2021i32));

        assert_eq!(no.clone().and(unknown.clone()).evaluate(&b), TriState::False);
        assert_eq!(unknown.clone().and(no.clone()).evaluate(&b), TriState::False);
        assert_eq!(yes.clone().and(unknown.clone()).evaluate(&b), TriState::Unknown);
        assert_eq!(yes.clone().or(unknown.clone()).evaluate(&b), TriState::True);
        assert_eq!(no.clone().or(unknown.clone()).evaluate(&b), TriState::Unknown);
        assert_eq!((!no).evaluate(&b), TriState::True);
        assert_eq!((!unknown).evaluate(&b), TriState::Unknown);
    }

    #[test]
    fn known_field_values_reads_equality_conjuncts() {
        let expr = Expression::conjunction([
            col("year").eq(lit(2020i32)),
            lit("x").eq(col("tag")),
            col("month").gt(lit(3i32)),
            col("year").eq(lit(1999i32)),
        ]);
        let known = expr.known_field_values();
        assert_eq!(known.len(), 2);
        assert_eq!(known.get("year"), Some(&ScalarValue::Int32(Some(2020))));
        assert_eq!(known.get("tag"), Some(&ScalarValue::Utf8(Some("x".into()))));
        assert!(Expression::literal_true().known_field_values().is_empty());
    }

    #[test]
    fn simplify_folds_decided_branches() {
        let guarantee = col("year").eq(lit(2020i32));
        let residual = col("value").gt(lit(10i64));

        let filter = col("year").eq(lit(2021i32)).and(residual.clone());
        assert!(filter.simplify_with_guarantee(&guarantee).is_literal_false());

        let filter = col("year").eq(lit(2021i32)).or(residual.clone());
        assert_eq!(filter.simplify_with_guarantee(&guarantee), residual);

        let filter = !col("year").eq(lit(2021i32));
        assert!(filter.simplify_with_guarantee(&guarantee).is_literal_true());

        let untouched = col("month").eq(lit(1i32)).or(residual.clone());
        assert_eq!(untouched.simplify_with_guarantee(&guarantee), untouched);
    }
}
