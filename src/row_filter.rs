//! Row-level evaluation of [`Expression`]s against record batches.
//!
//! Uses Kleene logic throughout: a row whose predicate is null (unknown) is
//! not selected by [`RowFilter::apply`]. A field missing from the batch, and a
//! comparison between columns of different types, evaluate to null rather
//! than failing, mirroring [`Expression::evaluate`].
use arrow_arith::boolean as arith_boolean;
use arrow_array::{Array, ArrayRef, BooleanArray, RecordBatch};
use arrow_ord::cmp as ord_cmp;
use arrow_schema::DataType;
use arrow_select::filter::filter_record_batch;
use datafusion_common::ScalarValue;

use crate::{
    Result,
    expr::{CmpOp, ExprId, ExprNode, Expression},
};

/// A predicate applied to decoded record batches.
#[derive(Clone, Debug)]
pub struct RowFilter {
    expr: Expression,
}

enum Columnar {
    Array(ArrayRef),
    Scalar(ScalarValue),
}

impl Columnar {
    fn data_type(&self) -> DataType {
        match self {
            Columnar::Array(array) => array.data_type().clone(),
            Columnar::Scalar(value) => value.data_type(),
        }
    }
}

impl RowFilter {
    /// Wrap an expression. Fields missing from a batch read as null.
    pub fn new(expr: Expression) -> Self {
        Self { expr }
    }

    pub fn expr(&self) -> &Expression {
        &self.expr
    }

    /// `true` when the filter keeps every row without looking at it.
    pub fn is_pass_through(&self) -> bool {
        self.expr.is_literal_true()
    }

    /// Evaluate the filter against a record batch and return a boolean mask.
    pub fn evaluate(&self, batch: &RecordBatch) -> Result<BooleanArray> {
        let value = self.evaluate_node(self.expr.root(), batch)?;
        to_mask(value, batch.num_rows())
    }

    /// Evaluate and apply the filter, returning only matching rows.
    pub fn apply(&self, batch: RecordBatch) -> Result<RecordBatch> {
        if self.is_pass_through() {
            return Ok(batch);
        }
        let mask = self.evaluate(&batch)?;
        if mask.true_count() == batch.num_rows() {
            return Ok(batch);
        }
        Ok(filter_record_batch(&batch, &mask)?)
    }

    fn evaluate_node(&self, id: ExprId, batch: &RecordBatch) -> Result<Columnar> {
        let rows = batch.num_rows();
        Ok(match self.expr.node(id) {
            ExprNode::Scalar(value) => Columnar::Scalar(value.clone()),
            ExprNode::Field(name) => match batch.column_by_name(name) {
                Some(array) => Columnar::Array(array.clone()),
                None => Columnar::Scalar(ScalarValue::Null),
            },
            ExprNode::Compare { op, left, right } => {
                let left = self.evaluate_node(*left, batch)?;
                let right = self.evaluate_node(*right, batch)?;
                self.evaluate_cmp(*op, left, right, rows)?
            }
            ExprNode::And(l, r) => {
                let l = to_mask(self.evaluate_node(*l, batch)?, rows)?;
                if l.false_count() == rows && l.null_count() == 0 {
                    return Ok(Columnar::Array(std::sync::Arc::new(l)));
                }
                let r = to_mask(self.evaluate_node(*r, batch)?, rows)?;
                Columnar::Array(std::sync::Arc::new(arith_boolean::and_kleene(&l, &r)?))
            }
            ExprNode::Or(l, r) => {
                let l = to_mask(self.evaluate_node(*l, batch)?, rows)?;
                let r = to_mask(self.evaluate_node(*r, batch)?, rows)?;
                Columnar::Array(std::sync::Arc::new(arith_boolean::or_kleene(&l, &r)?))
            }
            ExprNode::Not(inner) => {
                let inner = to_mask(self.evaluate_node(*inner, batch)?, rows)?;
                Columnar::Array(std::sync::Arc::new(arith_boolean::not(&inner)?))
            }
        })
    }

    fn evaluate_cmp(
        &self,
        op: CmpOp,
        left: Columnar,
        right: Columnar,
        rows: usize,
    ) -> Result<Columnar> {
        use ord_cmp::{eq, gt, gt_eq, lt, lt_eq, neq};

        if logical_type(&left.data_type()) != logical_type(&right.data_type()) {
            return Ok(Columnar::Array(std::sync::Arc::new(BooleanArray::new_null(
                rows,
            ))));
        }

        let (left, right) = match (left, right) {
            (Columnar::Scalar(l), Columnar::Scalar(r)) => {
                let value = crate::expr::compare_scalars(op, &l, &r).as_bool();
                return Ok(Columnar::Scalar(ScalarValue::Boolean(value)));
            }
            (l, r) => (l, r),
        };

        let left_scalar;
        let right_scalar;
        let left_ref: &dyn arrow_array::Datum = match &left {
            Columnar::Array(array) => array,
            Columnar::Scalar(value) => {
                left_scalar = value.to_scalar()?;
                &left_scalar
            }
        };
        let right_ref: &dyn arrow_array::Datum = match &right {
            Columnar::Array(array) => array,
            Columnar::Scalar(value) => {
                right_scalar = value.to_scalar()?;
                &right_scalar
            }
        };

        let result = match op {
            CmpOp::Eq => eq(left_ref, right_ref)?,
            CmpOp::NotEq => neq(left_ref, right_ref)?,
            CmpOp::Lt => lt(left_ref, right_ref)?,
            CmpOp::LtEq => lt_eq(left_ref, right_ref)?,
            CmpOp::Gt => gt(left_ref, right_ref)?,
            CmpOp::GtEq => gt_eq(left_ref, right_ref)?,
        };

        Ok(Columnar::Array(std::sync::Arc::new(result)))
    }
}

fn logical_type(data_type: &DataType) -> &DataType {
    match data_type {
        DataType::Dictionary(_, value) => value.as_ref(),
        other => other,
    }
}

fn to_mask(value: Columnar, rows: usize) -> Result<BooleanArray> {
    Ok(match value {
        Columnar::Array(array) => match array.as_any().downcast_ref::<BooleanArray>() {
            Some(mask) => mask.clone(),
            None => BooleanArray::new_null(rows),
        },
        Columnar::Scalar(ScalarValue::Boolean(Some(b))) => BooleanArray::from(vec![b; rows]),
        Columnar::Scalar(_) => BooleanArray::new_null(rows),
    })
}
