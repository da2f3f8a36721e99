#![forbid(unsafe_code)]

use std::collections::HashMap;

use dx_lang::{AstNode, BinaryOp, UnaryOp, stringify};
use dx_store::Table;
use dx_value::Value;

mod builtins;
mod date;

pub use builtins::is_builtin;

/// Valid numeric observations for one window-function argument within the
/// evaluator's row scope, with the aggregate statistics the window builtins
/// share.
#[derive(Debug, Clone)]
struct WindowStats {
    sorted: Vec<f64>,
    mean: f64,
    sd: f64,
}

impl WindowStats {
    fn from_values(valid: &[f64]) -> Self {
        let n = valid.len();
        let mean = if n == 0 {
            0.0
        } else {
            valid.iter().sum::<f64>() / n as f64
        };
        let sd = if n == 0 {
            0.0
        } else {
            let var = valid.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n as f64;
            var.sqrt()
        };
        let mut sorted = valid.to_vec();
        sorted.sort_by(f64::total_cmp);
        Self { sorted, mean, sd }
    }

    fn len(&self) -> usize {
        self.sorted.len()
    }
}

/// Evaluates ASTs against a table, scoped to an ordered set of row indices
/// (the whole table, a filtered subset, or one partition slice). Window
/// functions aggregate over exactly this scope; their statistics are
/// computed once per distinct argument expression and memoized for the
/// evaluator's lifetime.
///
/// Evaluation is exception-free: invalid operands, missing columns,
/// division by zero and bad dates all resolve to null, so a single bad row
/// never aborts a column computation.
pub struct ColumnEvaluator<'a> {
    table: &'a Table,
    rows: Vec<usize>,
    window: HashMap<String, WindowStats>,
}

impl<'a> ColumnEvaluator<'a> {
    #[must_use]
    pub fn new(table: &'a Table, rows: Vec<usize>) -> Self {
        Self {
            table,
            rows,
            window: HashMap::new(),
        }
    }

    #[must_use]
    pub fn over_all_rows(table: &'a Table) -> Self {
        Self::new(table, (0..table.len()).collect())
    }

    #[must_use]
    pub fn rows(&self) -> &[usize] {
        &self.rows
    }

    /// Evaluate for every row in scope, in scope order.
    pub fn evaluate_rows(&mut self, ast: &AstNode) -> Vec<(usize, Value)> {
        let rows = self.rows.clone();
        rows.into_iter()
            .map(|row| (row, self.evaluate_at(ast, row)))
            .collect()
    }

    pub fn evaluate_at(&mut self, ast: &AstNode, row: usize) -> Value {
        match ast {
            AstNode::Number { value } => Value::Number(*value),
            AstNode::Str { value } => Value::Utf8(value.clone()),
            AstNode::Bool { value } => Value::Bool(*value),
            AstNode::ColumnRef { name } => {
                self.table.value(row, name).cloned().unwrap_or(Value::Null)
            }
            AstNode::Unary { op, operand } => {
                let value = self.evaluate_at(operand, row);
                eval_unary(*op, &value)
            }
            AstNode::Binary { op, left, right } => {
                let lhs = self.evaluate_at(left, row);
                let rhs = self.evaluate_at(right, row);
                eval_binary(*op, &lhs, &rhs)
            }
            AstNode::Call { name, args } => builtins::call(self, name, args, row),
            // Arrays are argument-position constructs (cut breaks/labels);
            // in a scalar position they have no value.
            AstNode::Array { .. } => Value::Null,
        }
    }

    /// Evaluate an array-literal argument to scalar elements; `None` when
    /// the node is not an array literal.
    pub(crate) fn eval_array(&mut self, node: &AstNode, row: usize) -> Option<Vec<Value>> {
        let AstNode::Array { elements } = node else {
            return None;
        };
        Some(
            elements
                .iter()
                .map(|el| self.evaluate_at(el, row))
                .collect(),
        )
    }

    /// Compute (once) and key the window statistics for an argument
    /// expression over the evaluator's row scope.
    pub(crate) fn ensure_window(&mut self, arg: &AstNode) -> String {
        let key = stringify(arg);
        if !self.window.contains_key(&key) {
            let rows = self.rows.clone();
            let mut valid = Vec::with_capacity(rows.len());
            for row in rows {
                if let Some(n) = self.evaluate_at(arg, row).as_number() {
                    valid.push(n);
                }
            }
            self.window.insert(key.clone(), WindowStats::from_values(&valid));
        }
        key
    }

    pub(crate) fn window_stats(&self, key: &str) -> &WindowStats {
        self.window
            .get(key)
            .expect("window statistics ensured before lookup")
    }
}

fn eval_unary(op: UnaryOp, value: &Value) -> Value {
    match op {
        UnaryOp::Neg => match value.as_number() {
            Some(n) => Value::Number(-n),
            None => Value::Null,
        },
        UnaryOp::Not => Value::Bool(!value.is_truthy()),
    }
}

fn eval_binary(op: BinaryOp, lhs: &Value, rhs: &Value) -> Value {
    match op {
        BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Mod
        | BinaryOp::Pow => {
            let (Some(a), Some(b)) = (lhs.as_number(), rhs.as_number()) else {
                return Value::Null;
            };
            match op {
                BinaryOp::Add => Value::from_finite(a + b),
                BinaryOp::Sub => Value::from_finite(a - b),
                BinaryOp::Mul => Value::from_finite(a * b),
                // Division and modulo by zero yield null, not infinities.
                BinaryOp::Div => {
                    if b == 0.0 {
                        Value::Null
                    } else {
                        Value::from_finite(a / b)
                    }
                }
                BinaryOp::Mod => {
                    if b == 0.0 {
                        Value::Null
                    } else {
                        Value::from_finite(a % b)
                    }
                }
                BinaryOp::Pow => Value::from_finite(a.powf(b)),
                _ => Value::Null,
            }
        }
        BinaryOp::Gt | BinaryOp::Ge | BinaryOp::Lt | BinaryOp::Le => {
            match lhs.compare_order(rhs) {
                Some(ordering) => Value::Bool(match op {
                    BinaryOp::Gt => ordering.is_gt(),
                    BinaryOp::Ge => ordering.is_ge(),
                    BinaryOp::Lt => ordering.is_lt(),
                    BinaryOp::Le => ordering.is_le(),
                    _ => false,
                }),
                None => Value::Null,
            }
        }
        BinaryOp::Eq => Value::Bool(lhs.strict_eq(rhs)),
        BinaryOp::Ne => Value::Bool(!lhs.strict_eq(rhs)),
        BinaryOp::And => Value::Bool(lhs.is_truthy() && rhs.is_truthy()),
        BinaryOp::Or => Value::Bool(lhs.is_truthy() || rhs.is_truthy()),
    }
}
