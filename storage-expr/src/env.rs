// SPDX-License-Identifier: GPL-3.0-only

//! Declared variables and the compile-time check run against them.

use std::collections::BTreeMap;

use crate::ast::{BinaryOp, Expr, UnaryOp};
use crate::error::{ExprError, Result};
use crate::value::Value;

pub const KIB: u64 = 1024;
pub const MIB: u64 = 1024 * KIB;
pub const GIB: u64 = 1024 * MIB;
pub const TIB: u64 = 1024 * GIB;

#[derive(Debug, Clone, PartialEq)]
pub enum Type {
    Bool,
    Int,
    UInt,
    String,
    List(Box<Type>),
    Object(&'static str, BTreeMap<&'static str, Type>),
    Dyn,
}

impl Type {
    pub fn name(&self) -> String {
        match self {
            Type::Bool => "bool".into(),
            Type::Int => "int".into(),
            Type::UInt => "uint".into(),
            Type::String => "string".into(),
            Type::List(item) => format!("list({})", item.name()),
            Type::Object(name, _) => (*name).into(),
            Type::Dyn => "dyn".into(),
        }
    }

    fn is_numeric(&self) -> bool {
        matches!(self, Type::Int | Type::UInt | Type::Dyn)
    }

    fn accepts(&self, other: &Type) -> bool {
        match (self, other) {
            (Type::Dyn, _) | (_, Type::Dyn) => true,
            (Type::Int | Type::UInt, Type::Int | Type::UInt) => true,
            (Type::List(a), Type::List(b)) => a.accepts(b),
            (Type::Object(a, _), Type::Object(b, _)) => a == b,
            _ => self == other,
        }
    }
}

/// Which set of variables an expression is compiled against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum EnvKind {
    /// `volume`, `disk`, `system_disk` and the size constants.
    #[default]
    VolumeLocator,
    /// `disk`, `system_disk` and the size constants.
    DiskLocator,
}

impl EnvKind {
    pub fn env(self) -> Env {
        let mut variables = BTreeMap::new();

        if self == EnvKind::VolumeLocator {
            variables.insert("volume", volume_type());
        }

        variables.insert("disk", disk_type());
        variables.insert("system_disk", Type::Bool);

        for constant in ["KiB", "MiB", "GiB", "TiB"] {
            variables.insert(constant, Type::UInt);
        }

        Env { variables }
    }
}

/// Values for the size constants every environment declares.
pub fn size_constants() -> [(&'static str, Value); 4] {
    [
        ("KiB", Value::UInt(KIB)),
        ("MiB", Value::UInt(MIB)),
        ("GiB", Value::UInt(GIB)),
        ("TiB", Value::UInt(TIB)),
    ]
}

fn volume_type() -> Type {
    let fields = BTreeMap::from([
        ("name", Type::String),
        ("uuid", Type::String),
        ("label", Type::String),
        ("type", Type::String),
        ("dev_path", Type::String),
        ("parent", Type::String),
        ("parent_dev_path", Type::String),
        ("partition_label", Type::String),
        ("partition_uuid", Type::String),
        ("partition_type", Type::String),
        ("partition_index", Type::UInt),
        ("size", Type::UInt),
        ("sector_size", Type::UInt),
        ("io_size", Type::UInt),
        ("block_size", Type::UInt),
        ("filesystem_block_size", Type::UInt),
        ("probed_size", Type::UInt),
        ("offset", Type::UInt),
    ]);

    Type::Object("volume", fields)
}

fn disk_type() -> Type {
    let fields = BTreeMap::from([
        ("dev_path", Type::String),
        ("size", Type::UInt),
        ("io_size", Type::UInt),
        ("sector_size", Type::UInt),
        ("readonly", Type::Bool),
        ("cdrom", Type::Bool),
        ("rotational", Type::Bool),
        ("transport", Type::String),
        ("wwid", Type::String),
        ("model", Type::String),
        ("serial", Type::String),
        ("modalias", Type::String),
        ("bus_path", Type::String),
        ("sub_system", Type::String),
        ("symlinks", Type::List(Box::new(Type::String))),
        ("secondary_disks", Type::List(Box::new(Type::String))),
    ]);

    Type::Object("disk", fields)
}

#[derive(Debug, Clone)]
pub struct Env {
    variables: BTreeMap<&'static str, Type>,
}

impl Env {
    pub fn lookup(&self, name: &str) -> Option<&Type> {
        self.variables.get(name)
    }

    /// Type-check `expr`, returning the type it produces.
    pub fn check(&self, expr: &Expr) -> Result<Type> {
        let mut scope = Vec::new();
        self.check_in(expr, &mut scope)
    }

    fn check_in(&self, expr: &Expr, scope: &mut Vec<(String, Type)>) -> Result<Type> {
        match expr {
            Expr::Literal(value) => Ok(literal_type(value)),
            Expr::Ident(name) => scope
                .iter()
                .rev()
                .find(|(bound, _)| bound == name)
                .map(|(_, ty)| ty.clone())
                .or_else(|| self.variables.get(name.as_str()).cloned())
                .ok_or_else(|| ExprError::UndeclaredReference(name.clone())),
            Expr::Member(target, field) => {
                let target = self.check_in(target, scope)?;
                member_type(&target, field)
            }
            Expr::Index(target, index) => {
                let target = self.check_in(target, scope)?;
                let index = self.check_in(index, scope)?;
                match target {
                    Type::List(item) if index.is_numeric() => Ok(*item),
                    Type::Dyn => Ok(Type::Dyn),
                    other => Err(ExprError::NoMatchingOverload(format!(
                        "_[_] on {} with {}",
                        other.name(),
                        index.name()
                    ))),
                }
            }
            Expr::Unary(op, operand) => {
                let operand = self.check_in(operand, scope)?;
                match op {
                    UnaryOp::Not if operand.accepts(&Type::Bool) => Ok(Type::Bool),
                    UnaryOp::Negate if operand.is_numeric() => Ok(Type::Int),
                    _ => Err(ExprError::NoMatchingOverload(format!(
                        "{} {}",
                        if *op == UnaryOp::Not { "!" } else { "-" },
                        operand.name()
                    ))),
                }
            }
            Expr::Binary(op, lhs, rhs) => {
                let lhs = self.check_in(lhs, scope)?;
                let rhs = self.check_in(rhs, scope)?;
                binary_type(*op, &lhs, &rhs)
            }
            Expr::Ternary(condition, then, otherwise) => {
                let condition = self.check_in(condition, scope)?;
                if !condition.accepts(&Type::Bool) {
                    return Err(ExprError::TypeMismatch {
                        expected: "bool".into(),
                        actual: condition.name(),
                    });
                }
                let then = self.check_in(then, scope)?;
                let otherwise = self.check_in(otherwise, scope)?;
                Ok(if then == otherwise { then } else { Type::Dyn })
            }
            Expr::List(items) => {
                let mut item_type: Option<Type> = None;
                for item in items {
                    let ty = self.check_in(item, scope)?;
                    item_type = match item_type {
                        None => Some(ty),
                        Some(prev) if prev == ty => Some(prev),
                        Some(_) => Some(Type::Dyn),
                    };
                }
                Ok(Type::List(Box::new(item_type.unwrap_or(Type::Dyn))))
            }
            Expr::Call {
                target,
                function,
                args,
            } => self.check_call(target.as_deref(), function, args, scope),
        }
    }

    fn check_call(
        &self,
        target: Option<&Expr>,
        function: &str,
        args: &[Expr],
        scope: &mut Vec<(String, Type)>,
    ) -> Result<Type> {
        let overload = || ExprError::NoMatchingOverload(function.to_string());

        match (function, target) {
            ("has", None) => {
                let [Expr::Member(inner, field)] = args else {
                    return Err(ExprError::NoMatchingOverload(
                        "has() requires a field selection".into(),
                    ));
                };
                let inner = self.check_in(inner, scope)?;
                member_type(&inner, field)?;
                Ok(Type::Bool)
            }
            ("exists" | "all" | "exists_one" | "filter" | "map", Some(target)) => {
                let [Expr::Ident(var), body] = args else {
                    return Err(ExprError::NoMatchingOverload(format!(
                        "{function}() requires a variable and an expression"
                    )));
                };

                let item = match self.check_in(target, scope)? {
                    Type::List(item) => *item,
                    Type::Dyn => Type::Dyn,
                    _ => return Err(overload()),
                };

                scope.push((var.clone(), item.clone()));
                let body = self.check_in(body, scope);
                scope.pop();
                let body = body?;

                match function {
                    "map" => Ok(Type::List(Box::new(body))),
                    "filter" => Ok(Type::List(Box::new(item))),
                    _ if body.accepts(&Type::Bool) => Ok(Type::Bool),
                    _ => Err(ExprError::TypeMismatch {
                        expected: "bool".into(),
                        actual: body.name(),
                    }),
                }
            }
            _ => {
                let target = target.map(|t| self.check_in(t, scope)).transpose()?;
                let args = args
                    .iter()
                    .map(|arg| self.check_in(arg, scope))
                    .collect::<Result<Vec<_>>>()?;

                function_type(function, target.as_ref(), &args)
            }
        }
    }
}

fn literal_type(value: &Value) -> Type {
    match value {
        Value::Null | Value::List(_) | Value::Map(_) => Type::Dyn,
        Value::Bool(_) => Type::Bool,
        Value::Int(_) => Type::Int,
        Value::UInt(_) => Type::UInt,
        Value::String(_) => Type::String,
    }
}

fn member_type(target: &Type, field: &str) -> Result<Type> {
    match target {
        Type::Object(name, fields) => {
            fields
                .get(field)
                .cloned()
                .ok_or_else(|| ExprError::NoSuchField {
                    on: (*name).to_string(),
                    field: field.to_string(),
                })
        }
        Type::Dyn => Ok(Type::Dyn),
        other => Err(ExprError::NoSuchField {
            on: other.name(),
            field: field.to_string(),
        }),
    }
}

fn binary_type(op: BinaryOp, lhs: &Type, rhs: &Type) -> Result<Type> {
    let mismatch = || {
        ExprError::NoMatchingOverload(format!("{} {} {}", lhs.name(), op.symbol(), rhs.name()))
    };

    match op {
        BinaryOp::And | BinaryOp::Or => {
            if lhs.accepts(&Type::Bool) && rhs.accepts(&Type::Bool) {
                Ok(Type::Bool)
            } else {
                Err(mismatch())
            }
        }
        BinaryOp::Eq | BinaryOp::Ne => {
            if lhs.accepts(rhs) {
                Ok(Type::Bool)
            } else {
                Err(mismatch())
            }
        }
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let ordered = (lhs.is_numeric() && rhs.is_numeric())
                || (lhs.accepts(&Type::String) && rhs.accepts(&Type::String));
            if ordered {
                Ok(Type::Bool)
            } else {
                Err(mismatch())
            }
        }
        BinaryOp::In => match rhs {
            Type::List(item) if item.accepts(lhs) => Ok(Type::Bool),
            Type::Dyn => Ok(Type::Bool),
            _ => Err(mismatch()),
        },
        BinaryOp::Add if *lhs == Type::String && *rhs == Type::String => Ok(Type::String),
        BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Rem => {
            match (lhs, rhs) {
                (Type::Int, Type::Int) => Ok(Type::Int),
                (Type::UInt, Type::UInt | Type::Int) | (Type::Int, Type::UInt) => Ok(Type::UInt),
                (Type::Dyn, _) | (_, Type::Dyn) => Ok(Type::Dyn),
                (Type::List(a), Type::List(_)) if op == BinaryOp::Add => Ok(Type::List(a.clone())),
                _ => Err(mismatch()),
            }
        }
    }
}

fn function_type(function: &str, target: Option<&Type>, args: &[Type]) -> Result<Type> {
    let overload = || ExprError::NoMatchingOverload(function.to_string());

    match (function, target, args) {
        ("size", None, [Type::String | Type::List(_) | Type::Dyn])
        | ("size", Some(Type::String | Type::List(_) | Type::Dyn), []) => Ok(Type::Int),
        (
            "startsWith" | "endsWith" | "contains",
            Some(Type::String | Type::Dyn),
            [Type::String | Type::Dyn],
        ) => Ok(Type::Bool),
        ("lowerAscii" | "upperAscii" | "trim", Some(Type::String | Type::Dyn), []) => {
            Ok(Type::String)
        }
        ("int", None, [_]) => Ok(Type::Int),
        ("uint", None, [_]) => Ok(Type::UInt),
        ("string", None, [_]) => Ok(Type::String),
        _ => Err(overload()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;

    fn check(kind: EnvKind, source: &str) -> Result<Type> {
        kind.env().check(&parse(source)?)
    }

    #[test]
    fn volume_fields_are_typed() {
        assert_eq!(
            check(EnvKind::VolumeLocator, r#"volume.partition_label == "META" && volume.size == 1048576u"#),
            Ok(Type::Bool)
        );
        assert_eq!(check(EnvKind::VolumeLocator, "volume.size / MiB"), Ok(Type::UInt));
    }

    #[test]
    fn disk_env_has_no_volume() {
        assert_eq!(
            check(EnvKind::DiskLocator, r#"volume.name == """#),
            Err(ExprError::UndeclaredReference("volume".into()))
        );
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert_eq!(
            check(EnvKind::DiskLocator, "disk.colour == 1"),
            Err(ExprError::NoSuchField {
                on: "disk".into(),
                field: "colour".into()
            })
        );
    }

    #[test]
    fn macro_variables_are_scoped() {
        assert_eq!(
            check(EnvKind::DiskLocator, r#"disk.symlinks.exists(l, l.startsWith("/dev/disk/by-id/"))"#),
            Ok(Type::Bool)
        );
        assert_eq!(
            check(EnvKind::DiskLocator, r#"disk.symlinks.exists(l, true) && l == """#),
            Err(ExprError::UndeclaredReference("l".into()))
        );
    }

    #[test]
    fn comparing_string_with_number_fails() {
        assert!(matches!(
            check(EnvKind::DiskLocator, r#"disk.model > 3"#),
            Err(ExprError::NoMatchingOverload(_))
        ));
    }
}
