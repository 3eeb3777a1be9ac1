use std::collections::HashMap;

use arrow_schema::{DataType, Schema};
use datafusion_common::ScalarValue;

use super::{ExprArena, ExprId, ExprNode, Expression};
use crate::{QuarryError, Result};

impl Expression {
    /// Validate the expression against a schema and cast literals to the
    /// types of the fields they are compared with.
    ///
    /// # Errors
    ///
    /// - [`QuarryError::FieldNotFound`] when a field is not in `schema`
    /// - [`QuarryError::InvalidExpression`] when a literal cannot be cast to
    ///   the field type it is compared with, when two fields of different
    ///   types are compared, when a connective has a non-boolean operand, or
    ///   when the expression as a whole is not boolean
    pub fn bind(&self, schema: &Schema) -> Result<Expression> {
        let mut binder = Binder {
            expr: self,
            schema,
            arena: ExprArena::new(),
            memo: HashMap::new(),
        };
        let (root, data_type) = binder.bind_node(self.root)?;
        if data_type != DataType::Boolean {
            return Err(QuarryError::invalid_expression(format!(
                "filter {self} evaluates to {data_type:?}, not Boolean"
            )));
        }
        Ok(binder.arena.finish(root))
    }
}

struct Binder<'a> {
    expr: &'a Expression,
    schema: &'a Schema,
    arena: ExprArena,
    memo: HashMap<ExprId, (ExprId, DataType)>,
}

impl Binder<'_> {
    fn bind_node(&mut self, id: ExprId) -> Result<(ExprId, DataType)> {
        if let Some(done) = self.memo.get(&id) {
            return Ok(done.clone());
        }
        let bound = match self.expr.node(id) {
            ExprNode::Scalar(value) => (self.arena.scalar(value.clone()), value.data_type()),
            ExprNode::Field(name) => {
                let field = self
                    .schema
                    .field_with_name(name)
                    .map_err(|_| QuarryError::FieldNotFound { name: name.clone() })?;
                (self.arena.field(name.clone()), field.data_type().clone())
            }
            ExprNode::Compare { op, left, right } => {
                let (left, right) = self.bind_comparison(*left, *right)?;
                (self.arena.compare(*op, left, right), DataType::Boolean)
            }
            ExprNode::And(l, r) => {
                let l = self.bind_boolean(*l)?;
                let r = self.bind_boolean(*r)?;
                (self.arena.and(l, r), DataType::Boolean)
            }
            ExprNode::Or(l, r) => {
                let l = self.bind_boolean(*l)?;
                let r = self.bind_boolean(*r)?;
                (self.arena.or(l, r), DataType::Boolean)
            }
            ExprNode::Not(inner) => {
                let inner = self.bind_boolean(*inner)?;
                (self.arena.not(inner), DataType::Boolean)
            }
        };
        self.memo.insert(id, bound.clone());
        Ok(bound)
    }

    fn bind_boolean(&mut self, id: ExprId) -> Result<ExprId> {
        let (bound, data_type) = self.bind_node(id)?;
        match data_type {
            DataType::Boolean | DataType::Null => Ok(bound),
            other => Err(QuarryError::invalid_expression(format!(
                "operand {} of a boolean connective has type {other:?}",
                self.expr.subexpression(id)
            ))),
        }
    }

    fn bind_comparison(&mut self, left: ExprId, right: ExprId) -> Result<(ExprId, ExprId)> {
        let left_node = self.expr.node(left);
        let right_node = self.expr.node(right);
        match (left_node, right_node) {
            (ExprNode::Scalar(value), _) if !matches!(right_node, ExprNode::Scalar(_)) => {
                let (right, target) = self.bind_node(right)?;
                let left = self.cast_literal(value, &target)?;
                Ok((left, right))
            }
            (_, ExprNode::Scalar(value)) if !matches!(left_node, ExprNode::Scalar(_)) => {
                let (left, target) = self.bind_node(left)?;
                let right = self.cast_literal(value, &target)?;
                Ok((left, right))
            }
            _ => {
                let (l, left_type) = self.bind_node(left)?;
                let (r, right_type) = self.bind_node(right)?;
                if left_type != right_type
                    && left_type != DataType::Null
                    && right_type != DataType::Null
                {
                    return Err(QuarryError::invalid_expression(format!(
                        "cannot compare {} ({left_type:?}) with {} ({right_type:?})",
                        self.expr.subexpression(left),
                        self.expr.subexpression(right),
                    )));
                }
                Ok((l, r))
            }
        }
    }

    fn cast_literal(&mut self, value: &ScalarValue, target: &DataType) -> Result<ExprId> {
        if value.data_type() == *target || value.is_null() && *target == DataType::Null {
            return Ok(self.arena.scalar(value.clone()));
        }
        let cast = value.cast_to(target).map_err(|e| {
            QuarryError::invalid_expression(format!(
                "cannot cast {value} ({:?}) to {target:?}: {e}",
                value.data_type()
            ))
        })?;
        // A lossy cast ("abc" -> NULL, 2020.5 -> 2020) would change the meaning
        // of the comparison, and pruning with it could drop matching fragments.
        if (cast.is_null() && !value.is_null()) || !round_trips(value, &cast) {
            return Err(QuarryError::invalid_expression(format!(
                "{value} ({:?}) is not exactly representable as {target:?}",
                value.data_type()
            )));
        }
        Ok(self.arena.scalar(cast))
    }
}

/// Whether casting `cast` back to the type of `original` gives `original`.
///
/// String literals are exempt: they are parsed, and a successful parse is
/// exact even though the textual form may differ ("2020-01-01" as a date).
fn round_trips(original: &ScalarValue, cast: &ScalarValue) -> bool {
    let original_type = original.data_type();
    if matches!(
        original_type,
        DataType::Utf8 | DataType::LargeUtf8 | DataType::Utf8View
    ) {
        return true;
    }
    cast.cast_to(&original_type)
        .is_ok_and(|back| back == *original)
}
