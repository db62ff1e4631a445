// SPDX-License-Identifier: GPL-3.0-only

//! Boolean expressions used by volume locators and disk selectors.
//!
//! The language is a small subset of CEL: literals, member access, the usual
//! logical/relational/arithmetic operators, `in`, ternaries, string helpers
//! (`startsWith`, `endsWith`, `contains`, `lowerAscii`, `upperAscii`, `size`)
//! and the list macros (`exists`, `all`, `exists_one`, `filter`, `map`, `has`).
//!
//! Expressions are checked against a declared environment ([`EnvKind`]) when
//! first used. The compiled program is cached on the [`Expression`] value and
//! shared by clones, so a `VolumeConfig` held in the store compiles its
//! locator once per version.

pub mod ast;
pub mod env;
pub mod error;
pub mod eval;
pub mod lexer;
pub mod parser;
pub mod value;

use std::fmt;
use std::sync::{Arc, OnceLock};

use serde::{Serialize, Serializer};

pub use env::{EnvKind, GIB, KIB, MIB, TIB, Type};
pub use error::{ExprError, Result};
pub use eval::Activation;
pub use value::{ObjectBuilder, Value};

/// A parsed and type-checked expression.
#[derive(Debug, Clone)]
pub struct Program {
    ast: ast::Expr,
}

impl Program {
    pub fn compile(source: &str, kind: EnvKind) -> Result<Self> {
        let ast = parser::parse(source)?;

        match kind.env().check(&ast)? {
            Type::Bool | Type::Dyn => Ok(Self { ast }),
            other => Err(ExprError::TypeMismatch {
                expected: "bool".into(),
                actual: other.name(),
            }),
        }
    }

    pub fn evaluate(&self, activation: &Activation) -> Result<Value> {
        eval::evaluate(&self.ast, activation)
    }
}

/// Source text of an expression plus its lazily compiled program.
#[derive(Clone, Default)]
pub struct Expression {
    source: Arc<str>,
    env: EnvKind,
    program: Arc<OnceLock<Result<Program>>>,
}

impl Expression {
    pub fn new(source: impl AsRef<str>, env: EnvKind) -> Self {
        Self {
            source: Arc::from(source.as_ref()),
            env,
            program: Arc::new(OnceLock::new()),
        }
    }

    /// Build and compile eagerly, surfacing syntax or type errors now.
    pub fn parse(source: impl AsRef<str>, env: EnvKind) -> Result<Self> {
        let expression = Self::new(source, env);
        expression.program()?;
        Ok(expression)
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn env(&self) -> EnvKind {
        self.env
    }

    pub fn is_zero(&self) -> bool {
        self.source.trim().is_empty()
    }

    pub fn program(&self) -> Result<&Program> {
        self.program
            .get_or_init(|| {
                let compiled = Program::compile(&self.source, self.env);
                if let Err(err) = &compiled {
                    tracing::debug!("failed to compile expression {:?}: {}", self.source, err);
                }
                compiled
            })
            .as_ref()
            .map_err(Clone::clone)
    }

    pub fn eval_bool(&self, activation: &Activation) -> Result<bool> {
        match self.program()?.evaluate(activation)? {
            Value::Bool(value) => Ok(value),
            other => Err(ExprError::TypeMismatch {
                expected: "bool".into(),
                actual: other.type_name().into(),
            }),
        }
    }
}

impl PartialEq for Expression {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source && self.env == other.env
    }
}

impl Eq for Expression {}

impl fmt::Debug for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Expression").field(&&*self.source).finish()
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl Serialize for Expression {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn volume(label: &str, name: &str, size: u64) -> Value {
        ObjectBuilder::new()
            .field("partition_label", label)
            .field("name", name)
            .field("size", size)
            .build()
    }

    const META: &str =
        r#"volume.partition_label == "META" && (volume.name == "" || volume.name == "talosmeta") && volume.size == 1048576u"#;

    #[test]
    fn meta_locator_matches_only_meta() {
        let expression = Expression::parse(META, EnvKind::VolumeLocator).unwrap();

        let meta = Activation::new().with("volume", volume("META", "", MIB));
        let state = Activation::new().with("volume", volume("STATE", "xfs", 100 * MIB));
        let bad_size = Activation::new().with("volume", volume("META", "talosmeta", 2 * MIB));

        assert!(expression.eval_bool(&meta).unwrap());
        assert!(!expression.eval_bool(&state).unwrap());
        assert!(!expression.eval_bool(&bad_size).unwrap());
    }

    #[test]
    fn clones_share_compiled_program() {
        let expression = Expression::new("system_disk", EnvKind::DiskLocator);
        let clone = expression.clone();

        let first = expression.program().unwrap() as *const Program;
        let second = clone.program().unwrap() as *const Program;

        assert_eq!(first, second);
    }

    #[test]
    fn non_boolean_expressions_fail_to_compile() {
        assert!(matches!(
            Expression::parse("disk.size", EnvKind::DiskLocator),
            Err(ExprError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn equality_ignores_compile_state() {
        let a = Expression::new("system_disk", EnvKind::DiskLocator);
        let b = Expression::new("system_disk", EnvKind::DiskLocator);
        let _ = a.program();
        assert_eq!(a, b);
        assert_ne!(a, Expression::new("system_disk", EnvKind::VolumeLocator));
    }

    #[test]
    fn default_is_zero() {
        assert!(Expression::default().is_zero());
        assert_eq!(Expression::default().program().err(), Some(ExprError::Empty));
    }

    #[test]
    fn serializes_as_source() {
        let expression = Expression::new("system_disk", EnvKind::DiskLocator);
        assert_eq!(serde_json::to_string(&expression).unwrap(), r#""system_disk""#);
    }
}
