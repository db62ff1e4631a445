// SPDX-License-Identifier: GPL-3.0-only

use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::ast::{BinaryOp, Expr, UnaryOp};
use crate::error::{ExprError, Result};
use crate::value::Value;

/// Variable bindings for one evaluation.
#[derive(Debug, Clone, Default)]
pub struct Activation {
    bindings: BTreeMap<String, Value>,
}

impl Activation {
    pub fn new() -> Self {
        let mut activation = Self::default();
        for (name, value) in crate::env::size_constants() {
            activation.bind(name, value);
        }
        activation
    }

    pub fn bind(&mut self, name: &str, value: impl Into<Value>) -> &mut Self {
        self.bindings.insert(name.to_string(), value.into());
        self
    }

    pub fn with(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.bind(name, value);
        self
    }

    fn get(&self, name: &str) -> Option<&Value> {
        self.bindings.get(name)
    }
}

pub fn evaluate(expr: &Expr, activation: &Activation) -> Result<Value> {
    let mut locals = Vec::new();
    Evaluator {
        activation,
        locals: &mut locals,
    }
    .eval(expr)
}

struct Evaluator<'a> {
    activation: &'a Activation,
    locals: &'a mut Vec<(String, Value)>,
}

fn eval_error(message: impl Into<String>) -> ExprError {
    ExprError::Evaluation(message.into())
}

impl Evaluator<'_> {
    fn lookup(&self, name: &str) -> Result<Value> {
        if let Some((_, value)) = self.locals.iter().rev().find(|(bound, _)| bound == name) {
            return Ok(value.clone());
        }

        self.activation
            .get(name)
            .cloned()
            .ok_or_else(|| eval_error(format!("no such attribute '{name}'")))
    }

    fn eval(&mut self, expr: &Expr) -> Result<Value> {
        match expr {
            Expr::Literal(value) => Ok(value.clone()),
            Expr::Ident(name) => self.lookup(name),
            Expr::Member(target, field) => match self.eval(target)? {
                Value::Map(mut fields) => fields
                    .remove(field)
                    .ok_or_else(|| eval_error(format!("no such key '{field}'"))),
                other => Err(eval_error(format!(
                    "cannot select '{field}' from {}",
                    other.type_name()
                ))),
            },
            Expr::Index(target, index) => {
                let target = self.eval(target)?;
                let index = self.eval(index)?;
                index_value(target, &index)
            }
            Expr::List(items) => items
                .iter()
                .map(|item| self.eval(item))
                .collect::<Result<Vec<_>>>()
                .map(Value::List),
            Expr::Unary(op, operand) => {
                let operand = self.eval(operand)?;
                match (op, operand) {
                    (UnaryOp::Not, Value::Bool(value)) => Ok(Value::Bool(!value)),
                    (UnaryOp::Negate, Value::Int(value)) => value
                        .checked_neg()
                        .map(Value::Int)
                        .ok_or_else(|| eval_error("integer overflow")),
                    (_, other) => Err(ExprError::NoMatchingOverload(format!(
                        "unary operator on {}",
                        other.type_name()
                    ))),
                }
            }
            Expr::Ternary(condition, then, otherwise) => match self.eval(condition)? {
                Value::Bool(true) => self.eval(then),
                Value::Bool(false) => self.eval(otherwise),
                other => Err(ExprError::TypeMismatch {
                    expected: "bool".into(),
                    actual: other.type_name().into(),
                }),
            },
            Expr::Binary(BinaryOp::And, lhs, rhs) => self.logical(lhs, rhs, false),
            Expr::Binary(BinaryOp::Or, lhs, rhs) => self.logical(lhs, rhs, true),
            Expr::Binary(op, lhs, rhs) => {
                let lhs = self.eval(lhs)?;
                let rhs = self.eval(rhs)?;
                binary(*op, lhs, rhs)
            }
            Expr::Call {
                target,
                function,
                args,
            } => self.call(target.as_deref(), function, args),
        }
    }

    /// `&&` / `||` with short-circuit; an error on one side is absorbed when
    /// the other side alone decides the result.
    fn logical(&mut self, lhs: &Expr, rhs: &Expr, short: bool) -> Result<Value> {
        let left = self.eval(lhs).and_then(expect_bool);
        if let Ok(value) = left
            && value == short
        {
            return Ok(Value::Bool(short));
        }

        let right = self.eval(rhs).and_then(expect_bool);
        match (left, right) {
            (_, Ok(value)) if value == short => Ok(Value::Bool(short)),
            (Ok(_), Ok(value)) => Ok(Value::Bool(value)),
            (Err(err), _) | (_, Err(err)) => Err(err),
        }
    }

    fn call(&mut self, target: Option<&Expr>, function: &str, args: &[Expr]) -> Result<Value> {
        match (function, target) {
            ("has", None) => {
                let [Expr::Member(inner, field)] = args else {
                    return Err(ExprError::NoMatchingOverload("has".into()));
                };
                match self.eval(inner)? {
                    Value::Map(fields) => Ok(Value::Bool(fields.contains_key(field))),
                    other => Err(eval_error(format!(
                        "has() on {}",
                        other.type_name()
                    ))),
                }
            }
            ("exists" | "all" | "exists_one" | "filter" | "map", Some(target)) => {
                let [Expr::Ident(var), body] = args else {
                    return Err(ExprError::NoMatchingOverload(function.into()));
                };

                let Value::List(items) = self.eval(target)? else {
                    return Err(ExprError::NoMatchingOverload(function.into()));
                };

                self.comprehension(function, var, body, items)
            }
            _ => {
                let target = target.map(|t| self.eval(t)).transpose()?;
                let args = args
                    .iter()
                    .map(|arg| self.eval(arg))
                    .collect::<Result<Vec<_>>>()?;

                builtin(function, target, args)
            }
        }
    }

    fn comprehension(
        &mut self,
        function: &str,
        var: &str,
        body: &Expr,
        items: Vec<Value>,
    ) -> Result<Value> {
        let mut matched = 0usize;
        let mut results = Vec::new();
        let mut first_error = None;

        for item in items {
            self.locals.push((var.to_string(), item.clone()));
            let outcome = self.eval(body);
            self.locals.pop();

            if function == "map" {
                results.push(outcome?);
                continue;
            }

            match outcome.and_then(expect_bool) {
                Ok(true) => {
                    matched += 1;
                    match function {
                        "exists" => return Ok(Value::Bool(true)),
                        "filter" => results.push(item),
                        _ => {}
                    }
                }
                Ok(false) => {
                    if function == "all" {
                        return Ok(Value::Bool(false));
                    }
                }
                Err(err) => {
                    if function == "filter" || function == "exists_one" {
                        return Err(err);
                    }
                    first_error.get_or_insert(err);
                }
            }
        }

        if let Some(err) = first_error {
            return Err(err);
        }

        Ok(match function {
            "exists" => Value::Bool(false),
            "all" => Value::Bool(true),
            "exists_one" => Value::Bool(matched == 1),
            _ => Value::List(results),
        })
    }
}

fn expect_bool(value: Value) -> Result<bool> {
    match value {
        Value::Bool(value) => Ok(value),
        other => Err(ExprError::TypeMismatch {
            expected: "bool".into(),
            actual: other.type_name().into(),
        }),
    }
}

fn index_value(target: Value, index: &Value) -> Result<Value> {
    match (target, index) {
        (Value::List(items), Value::Int(_) | Value::UInt(_)) => {
            let position = match index {
                Value::Int(i) if *i >= 0 => *i as usize,
                Value::UInt(i) => *i as usize,
                _ => return Err(eval_error("index out of range")),
            };
            items
                .into_iter()
                .nth(position)
                .ok_or_else(|| eval_error("index out of range"))
        }
        (Value::Map(mut fields), Value::String(key)) => fields
            .remove(key)
            .ok_or_else(|| eval_error(format!("no such key '{key}'"))),
        (target, index) => Err(ExprError::NoMatchingOverload(format!(
            "_[_] on {} with {}",
            target.type_name(),
            index.type_name()
        ))),
    }
}

/// Mixed int/uint arithmetic is carried out on uint when the int side is non-negative.
fn unify_unsigned(lhs: &Value, rhs: &Value) -> Option<(u64, u64)> {
    match (lhs, rhs) {
        (Value::UInt(a), Value::UInt(b)) => Some((*a, *b)),
        (Value::UInt(a), Value::Int(b)) if *b >= 0 => Some((*a, *b as u64)),
        (Value::Int(a), Value::UInt(b)) if *a >= 0 => Some((*a as u64, *b)),
        _ => None,
    }
}

fn binary(op: BinaryOp, lhs: Value, rhs: Value) -> Result<Value> {
    let overflow = || eval_error("integer overflow");
    let mismatch = |lhs: &Value, rhs: &Value| {
        ExprError::NoMatchingOverload(format!(
            "{} {} {}",
            lhs.type_name(),
            op.symbol(),
            rhs.type_name()
        ))
    };

    match op {
        BinaryOp::Eq => Ok(Value::Bool(lhs.loose_eq(&rhs))),
        BinaryOp::Ne => Ok(Value::Bool(!lhs.loose_eq(&rhs))),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let ordering = lhs.compare(&rhs).ok_or_else(|| mismatch(&lhs, &rhs))?;
            Ok(Value::Bool(match op {
                BinaryOp::Lt => ordering == Ordering::Less,
                BinaryOp::Le => ordering != Ordering::Greater,
                BinaryOp::Gt => ordering == Ordering::Greater,
                _ => ordering != Ordering::Less,
            }))
        }
        BinaryOp::In => match &rhs {
            Value::List(items) => Ok(Value::Bool(items.iter().any(|item| item.loose_eq(&lhs)))),
            Value::Map(fields) => match &lhs {
                Value::String(key) => Ok(Value::Bool(fields.contains_key(key))),
                _ => Err(mismatch(&lhs, &rhs)),
            },
            _ => Err(mismatch(&lhs, &rhs)),
        },
        BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Rem => {
            match (&lhs, &rhs) {
                (Value::String(a), Value::String(b)) if op == BinaryOp::Add => {
                    return Ok(Value::String(format!("{a}{b}")));
                }
                (Value::List(a), Value::List(b)) if op == BinaryOp::Add => {
                    return Ok(Value::List(a.iter().chain(b).cloned().collect()));
                }
                (Value::Int(a), Value::Int(b)) => {
                    let (a, b) = (*a, *b);
                    let result = match op {
                        BinaryOp::Add => a.checked_add(b),
                        BinaryOp::Sub => a.checked_sub(b),
                        BinaryOp::Mul => a.checked_mul(b),
                        BinaryOp::Div if b == 0 => return Err(eval_error("division by zero")),
                        BinaryOp::Div => a.checked_div(b),
                        BinaryOp::Rem if b == 0 => return Err(eval_error("modulus by zero")),
                        _ => a.checked_rem(b),
                    };
                    return result.map(Value::Int).ok_or_else(overflow);
                }
                _ => {}
            }

            let (a, b) = unify_unsigned(&lhs, &rhs).ok_or_else(|| mismatch(&lhs, &rhs))?;
            let result = match op {
                BinaryOp::Add => a.checked_add(b),
                BinaryOp::Sub => a.checked_sub(b),
                BinaryOp::Mul => a.checked_mul(b),
                BinaryOp::Div if b == 0 => return Err(eval_error("division by zero")),
                BinaryOp::Div => a.checked_div(b),
                BinaryOp::Rem if b == 0 => return Err(eval_error("modulus by zero")),
                _ => a.checked_rem(b),
            };
            result.map(Value::UInt).ok_or_else(overflow)
        }
        BinaryOp::And | BinaryOp::Or => Err(mismatch(&lhs, &rhs)),
    }
}

fn builtin(function: &str, target: Option<Value>, args: Vec<Value>) -> Result<Value> {
    let overload = || ExprError::NoMatchingOverload(function.to_string());

    match (function, target, args.as_slice()) {
        ("size", Some(Value::String(s)), []) => Ok(Value::Int(s.chars().count() as i64)),
        ("size", None, [Value::String(s)]) => Ok(Value::Int(s.chars().count() as i64)),
        ("size", Some(Value::List(items)), []) => Ok(Value::Int(items.len() as i64)),
        ("size", None, [Value::List(items)]) => Ok(Value::Int(items.len() as i64)),
        ("startsWith", Some(Value::String(s)), [Value::String(prefix)]) => {
            Ok(Value::Bool(s.starts_with(prefix.as_str())))
        }
        ("endsWith", Some(Value::String(s)), [Value::String(suffix)]) => {
            Ok(Value::Bool(s.ends_with(suffix.as_str())))
        }
        ("contains", Some(Value::String(s)), [Value::String(needle)]) => {
            Ok(Value::Bool(s.contains(needle.as_str())))
        }
        ("lowerAscii", Some(Value::String(s)), []) => Ok(Value::String(s.to_ascii_lowercase())),
        ("upperAscii", Some(Value::String(s)), []) => Ok(Value::String(s.to_ascii_uppercase())),
        ("trim", Some(Value::String(s)), []) => Ok(Value::String(s.trim().to_string())),
        ("int", None, [value]) => match value {
            Value::Int(v) => Ok(Value::Int(*v)),
            Value::UInt(v) => i64::try_from(*v)
                .map(Value::Int)
                .map_err(|_| eval_error("integer overflow")),
            Value::String(s) => s
                .parse()
                .map(Value::Int)
                .map_err(|_| eval_error(format!("cannot convert {s:?} to int"))),
            _ => Err(overload()),
        },
        ("uint", None, [value]) => match value {
            Value::UInt(v) => Ok(Value::UInt(*v)),
            Value::Int(v) => u64::try_from(*v)
                .map(Value::UInt)
                .map_err(|_| eval_error("integer overflow")),
            Value::String(s) => s
                .parse()
                .map(Value::UInt)
                .map_err(|_| eval_error(format!("cannot convert {s:?} to uint"))),
            _ => Err(overload()),
        },
        ("string", None, [value]) => match value {
            Value::String(s) => Ok(Value::String(s.clone())),
            Value::Int(v) => Ok(Value::String(v.to_string())),
            Value::UInt(v) => Ok(Value::String(v.to_string())),
            Value::Bool(v) => Ok(Value::String(v.to_string())),
            _ => Err(overload()),
        },
        _ => Err(overload()),
    }
}
