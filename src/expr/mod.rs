//! Compiled scalar expressions over blocks.
//!
//! A query arrives here already parsed: expressions are built
//! programmatically (the WHERE condition, DEFAULT clauses of columns,
//! materialized-view transforms) and executed column-wise against blocks.

use std::collections::BTreeSet;

use crate::block::{Block, Column, ColumnWithTypeAndName, DataType, Value};
use crate::error::{Error, Result};

/// A scalar expression tree. Evaluation is row-parallel: every node
/// produces a whole column.
#[derive(Clone, Debug)]
pub enum Expression {
    /// Reference to a block column by name.
    Column(String),
    Literal {
        value: Value,
        data_type: DataType,
    },
    Function {
        name: String,
        args: Vec<Expression>,
    },
}

impl Expression {
    pub fn column(name: impl Into<String>) -> Expression {
        Expression::Column(name.into())
    }

    pub fn literal(value: Value, data_type: DataType) -> Expression {
        Expression::Literal { value, data_type }
    }

    pub fn call(name: impl Into<String>, args: Vec<Expression>) -> Expression {
        Expression::Function { name: name.into(), args }
    }

    /// Textual form, used as the produced column's name.
    pub fn text(&self) -> String {
        match self {
            Expression::Column(name) => name.clone(),
            Expression::Literal { value, .. } => match value {
                Value::UInt64(v) => v.to_string(),
                Value::Int64(v) => v.to_string(),
                Value::Float64(v) => v.to_string(),
                Value::Bytes(b) => format!("'{}'", String::from_utf8_lossy(b)),
                other => format!("{other:?}"),
            },
            Expression::Function { name, args } => {
                let rendered: Vec<String> = args.iter().map(|a| a.text()).collect();
                format!("{}({})", name, rendered.join(", "))
            }
        }
    }

    /// Names of all block columns the expression reads.
    pub fn collect_columns(&self, out: &mut BTreeSet<String>) {
        match self {
            Expression::Column(name) => {
                out.insert(name.clone());
            }
            Expression::Literal { .. } => {}
            Expression::Function { args, .. } => {
                for arg in args {
                    arg.collect_columns(out);
                }
            }
        }
    }

    pub fn evaluate(&self, block: &Block) -> Result<ColumnWithTypeAndName> {
        match self {
            Expression::Column(name) => Ok(block.by_name(name)?.clone()),
            Expression::Literal { value, data_type } => Ok(ColumnWithTypeAndName::new(
                self.text(),
                data_type.clone(),
                Column::Const {
                    data_type: data_type.clone(),
                    value: value.clone(),
                    len: block.rows(),
                },
            )),
            Expression::Function { name, args } => {
                let mut columns = Vec::with_capacity(args.len());
                for arg in args {
                    columns.push(arg.evaluate(block)?);
                }
                let column = apply_function(name, &columns, block.rows())?;
                Ok(ColumnWithTypeAndName::new(self.text(), column.data_type(), column))
            }
        }
    }
}

/// Numeric family of a binary operation's result.
#[derive(Clone, Copy, PartialEq)]
enum ValueKind {
    Unsigned,
    Signed,
    Float,
}

fn value_kind(data_type: &DataType) -> Result<ValueKind> {
    match data_type {
        DataType::UInt8
        | DataType::UInt16
        | DataType::UInt32
        | DataType::UInt64
        | DataType::Date
        | DataType::DateTime => Ok(ValueKind::Unsigned),
        DataType::Int8 | DataType::Int16 | DataType::Int32 | DataType::Int64 => Ok(ValueKind::Signed),
        DataType::Float32 | DataType::Float64 => Ok(ValueKind::Float),
        other => Err(Error::InvalidArgument(format!(
            "numeric argument expected, got {other}"
        ))),
    }
}

fn common_kind(a: ValueKind, b: ValueKind) -> ValueKind {
    match (a, b) {
        (ValueKind::Float, _) | (_, ValueKind::Float) => ValueKind::Float,
        (ValueKind::Signed, _) | (_, ValueKind::Signed) => ValueKind::Signed,
        _ => ValueKind::Unsigned,
    }
}

fn result_type(kind: ValueKind) -> DataType {
    match kind {
        ValueKind::Unsigned => DataType::UInt64,
        ValueKind::Signed => DataType::Int64,
        ValueKind::Float => DataType::Float64,
    }
}

fn arith(kind: ValueKind, op: &str, a: &Value, b: &Value) -> Result<Value> {
    Ok(match kind {
        ValueKind::Float => {
            let (x, y) = (a.as_f64()?, b.as_f64()?);
            Value::Float64(match op {
                "plus" => x + y,
                "minus" => x - y,
                "multiply" => x * y,
                "divide" => x / y,
                "modulo" => x % y,
                _ => return Err(Error::Logical(format!("unknown arithmetic op {op}"))),
            })
        }
        ValueKind::Signed => {
            let (x, y) = (a.as_i64()?, b.as_i64()?);
            if matches!(op, "divide" | "modulo") && y == 0 {
                return Err(Error::InvalidArgument("division by zero".into()));
            }
            Value::Int64(match op {
                "plus" => x.wrapping_add(y),
                "minus" => x.wrapping_sub(y),
                "multiply" => x.wrapping_mul(y),
                "divide" => x.wrapping_div(y),
                "modulo" => x.wrapping_rem(y),
                _ => return Err(Error::Logical(format!("unknown arithmetic op {op}"))),
            })
        }
        ValueKind::Unsigned => {
            let (x, y) = (a.as_u64()?, b.as_u64()?);
            if matches!(op, "divide" | "modulo") && y == 0 {
                return Err(Error::InvalidArgument("division by zero".into()));
            }
            Value::UInt64(match op {
                "plus" => x.wrapping_add(y),
                "minus" => x.wrapping_sub(y),
                "multiply" => x.wrapping_mul(y),
                "divide" => x / y,
                "modulo" => x % y,
                _ => return Err(Error::Logical(format!("unknown arithmetic op {op}"))),
            })
        }
    })
}

fn compare_values(a: &Value, b: &Value) -> Result<std::cmp::Ordering> {
    // Numeric comparisons cross families through f64; everything else
    // compares within its own family.
    Ok(match (a, b) {
        (Value::Bytes(x), Value::Bytes(y)) => x.cmp(y),
        (x, y) => x.as_f64()?.total_cmp(&y.as_f64()?),
    })
}

fn expect_args<'a>(
    name: &str,
    args: &'a [ColumnWithTypeAndName],
    arity: usize,
) -> Result<&'a [ColumnWithTypeAndName]> {
    if args.len() != arity {
        return Err(Error::InvalidArgument(format!(
            "function {name} takes {arity} arguments, got {}",
            args.len()
        )));
    }
    Ok(args)
}

/// Applies a scalar function to evaluated argument columns.
pub fn apply_function(name: &str, args: &[ColumnWithTypeAndName], rows: usize) -> Result<Column> {
    match name {
        "plus" | "minus" | "multiply" | "divide" | "modulo" => {
            let args = expect_args(name, args, 2)?;
            let kind = common_kind(value_kind(&args[0].data_type)?, value_kind(&args[1].data_type)?);
            let mut out = Column::new(&result_type(kind))?;
            for i in 0..rows {
                let value = arith(kind, name, &args[0].column.get(i), &args[1].column.get(i))?;
                out.push_value(&value)?;
            }
            Ok(out)
        }
        "negate" => {
            let args = expect_args(name, args, 1)?;
            let kind = value_kind(&args[0].data_type)?;
            let target = if kind == ValueKind::Float { DataType::Float64 } else { DataType::Int64 };
            let mut out = Column::new(&target)?;
            for i in 0..rows {
                let value = match kind {
                    ValueKind::Float => Value::Float64(-args[0].column.get(i).as_f64()?),
                    _ => Value::Int64(args[0].column.get(i).as_i64()?.wrapping_neg()),
                };
                out.push_value(&value)?;
            }
            Ok(out)
        }
        "equals" | "notEquals" | "less" | "greater" | "lessOrEquals" | "greaterOrEquals" => {
            let args = expect_args(name, args, 2)?;
            let mut mask = Vec::with_capacity(rows);
            for i in 0..rows {
                let ord = compare_values(&args[0].column.get(i), &args[1].column.get(i))?;
                let hit = match name {
                    "equals" => ord.is_eq(),
                    "notEquals" => ord.is_ne(),
                    "less" => ord.is_lt(),
                    "greater" => ord.is_gt(),
                    "lessOrEquals" => ord.is_le(),
                    "greaterOrEquals" => ord.is_ge(),
                    _ => unreachable!(),
                };
                mask.push(hit as u8);
            }
            Ok(Column::UInt8(mask))
        }
        "and" | "or" => {
            let args = expect_args(name, args, 2)?;
            let mut mask = Vec::with_capacity(rows);
            for i in 0..rows {
                let x = args[0].column.get(i).as_u64()? != 0;
                let y = args[1].column.get(i).as_u64()? != 0;
                mask.push(if name == "and" { x && y } else { x || y } as u8);
            }
            Ok(Column::UInt8(mask))
        }
        "not" => {
            let args = expect_args(name, args, 1)?;
            let mut mask = Vec::with_capacity(rows);
            for i in 0..rows {
                mask.push((args[0].column.get(i).as_u64()? == 0) as u8);
            }
            Ok(Column::UInt8(mask))
        }
        other => crate::errinput!("unknown function: {other}"),
    }
}

/// Converts a value to the family of a target type, with range checks done
/// by the receiving column.
fn convert_value(value: &Value, target: &DataType) -> Result<Value> {
    Ok(match (value_kind(target), value) {
        (Ok(ValueKind::Float), v) => Value::Float64(v.as_f64()?),
        (Ok(ValueKind::Signed), Value::Float64(f)) => Value::Int64(*f as i64),
        (Ok(ValueKind::Signed), v) => Value::Int64(v.as_i64()?),
        (Ok(ValueKind::Unsigned), Value::Float64(f)) => Value::UInt64(*f as u64),
        (Ok(ValueKind::Unsigned), v) => Value::UInt64(v.as_u64()?),
        (Err(_), v) => v.clone(),
    })
}

/// Rewrites a column to a new type, converting each value. Used by ALTER
/// when a column's declared type changes.
pub fn cast_column(column: &Column, target: &DataType) -> Result<Column> {
    let mut out = Column::new(target)?;
    for i in 0..column.len() {
        out.push_value(&convert_value(&column.get(i), target)?)?;
    }
    Ok(out)
}

/// One step of a compiled expression program.
#[derive(Clone, Debug)]
pub enum ExpressionAction {
    /// Evaluate and append a column under the given name.
    AddColumn { name: String, expression: Expression },
    RemoveColumn { name: String },
    /// Keep only the named columns, in this order.
    Project { names: Vec<String> },
}

/// A compiled expression DAG flattened into an ordered action list.
#[derive(Clone, Debug, Default)]
pub struct ExpressionActions {
    actions: Vec<ExpressionAction>,
}

impl ExpressionActions {
    pub fn new(actions: Vec<ExpressionAction>) -> Self {
        Self { actions }
    }

    pub fn add(mut self, action: ExpressionAction) -> Self {
        self.actions.push(action);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Block column names required before any action has run.
    pub fn required_columns(&self) -> Vec<String> {
        let mut produced = BTreeSet::new();
        let mut required = BTreeSet::new();
        for action in &self.actions {
            match action {
                ExpressionAction::AddColumn { name, expression } => {
                    let mut refs = BTreeSet::new();
                    expression.collect_columns(&mut refs);
                    for r in refs {
                        if !produced.contains(&r) {
                            required.insert(r);
                        }
                    }
                    produced.insert(name.clone());
                }
                ExpressionAction::RemoveColumn { .. } | ExpressionAction::Project { .. } => {}
            }
        }
        required.into_iter().collect()
    }

    pub fn execute(&self, block: &mut Block) -> Result<()> {
        for action in &self.actions {
            match action {
                ExpressionAction::AddColumn { name, expression } => {
                    let mut column = expression.evaluate(block)?;
                    column.name = name.clone();
                    block.insert(column);
                }
                ExpressionAction::RemoveColumn { name } => {
                    let position = block.position_by_name(name)?;
                    block.erase(position)?;
                }
                ExpressionAction::Project { names } => {
                    *block = block.sort_columns(names)?;
                }
            }
        }
        block.check_sizes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_block() -> Block {
        Block::with_columns(vec![
            ColumnWithTypeAndName::new("a", DataType::UInt32, Column::UInt32(vec![1, 2, 3, 4])),
            ColumnWithTypeAndName::new("b", DataType::Int64, Column::Int64(vec![10, -20, 30, -40])),
        ])
        .unwrap()
    }

    #[test]
    fn test_arithmetic() {
        let block = sample_block();
        let expr = Expression::call(
            "plus",
            vec![Expression::column("a"), Expression::column("b")],
        );
        let result = expr.evaluate(&block).unwrap();
        assert_eq!(result.data_type, DataType::Int64);
        assert_eq!(result.column.get(1), Value::Int64(-18));
        assert_eq!(result.name, "plus(a, b)");
    }

    #[test]
    fn test_comparison_produces_uint8_mask() {
        let block = sample_block();
        let expr = Expression::call(
            "greater",
            vec![
                Expression::column("a"),
                Expression::literal(Value::UInt64(2), DataType::UInt32),
            ],
        );
        let result = expr.evaluate(&block).unwrap();
        assert!(matches!(result.column, Column::UInt8(ref v) if v == &vec![0, 0, 1, 1]));
    }

    #[test]
    fn test_division_by_zero() {
        let block = sample_block();
        let expr = Expression::call(
            "divide",
            vec![
                Expression::column("a"),
                Expression::literal(Value::UInt64(0), DataType::UInt32),
            ],
        );
        assert!(expr.evaluate(&block).is_err());
    }

    #[test]
    fn test_actions_add_remove_project() {
        let mut block = sample_block();
        let actions = ExpressionActions::default()
            .add(ExpressionAction::AddColumn {
                name: "double_a".into(),
                expression: Expression::call(
                    "multiply",
                    vec![
                        Expression::column("a"),
                        Expression::literal(Value::UInt64(2), DataType::UInt8),
                    ],
                ),
            })
            .add(ExpressionAction::Project { names: vec!["double_a".into(), "b".into()] });
        actions.execute(&mut block).unwrap();
        assert_eq!(block.columns(), 2);
        assert_eq!(block.at(0).name, "double_a");
        assert_eq!(block.at(0).column.get(3), Value::UInt64(8));
    }

    #[test]
    fn test_required_columns_skips_produced() {
        let actions = ExpressionActions::default()
            .add(ExpressionAction::AddColumn {
                name: "t".into(),
                expression: Expression::call(
                    "plus",
                    vec![Expression::column("x"), Expression::column("y")],
                ),
            })
            .add(ExpressionAction::AddColumn {
                name: "u".into(),
                expression: Expression::call(
                    "plus",
                    vec![Expression::column("t"), Expression::column("z")],
                ),
            });
        assert_eq!(actions.required_columns(), vec!["x".to_string(), "y".into(), "z".into()]);
    }

    #[test]
    fn test_cast_column() {
        let col = Column::Float64(vec![1.9, -2.2]);
        let cast = cast_column(&col, &DataType::Int32).unwrap();
        assert!(matches!(cast, Column::Int32(ref v) if v == &vec![1, -2]));
    }
}
