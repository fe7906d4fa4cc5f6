//! Condition expression evaluator.
//!
//! Transition guards and exit conditions are small boolean/comparison
//! expressions evaluated against two namespaces: the decisions of the most
//! recent agent reply, then run-scoped state. Identifiers absent from both are
//! *undefined*: falsy on their own and false in every comparison.
//!
//! ```text
//! expr    := and (OR and)*
//! and     := not (AND not)*
//! not     := NOT not | cmp
//! cmp     := primary (op primary)*        op: == != > >= < <=
//! primary := literal | identifier | '(' expr ')'
//! ```
//!
//! Whole-expression keywords (`always`, `never`, `max_turns_exceeded`,
//! `error_occurred`) and workflow extensions are checked before the grammar.
//! A malformed expression never fails the run: it is treated as a single
//! identifier lookup.

pub mod lexer;
pub mod parser;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, warn};

use conclave_core::types::{DecisionValue, Decisions};

pub use lexer::CmpOp;
pub use parser::{parse, Expr};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConditionError {
    #[error("empty expression")]
    Empty,

    #[error("unexpected character '{ch}' at {pos}")]
    UnexpectedChar { ch: char, pos: usize },

    #[error("unterminated string starting at {pos}")]
    UnterminatedString { pos: usize },

    #[error("malformed number '{text}' at {pos}")]
    BadNumber { text: String, pos: usize },

    #[error("unexpected end of expression at {pos}")]
    UnexpectedEnd { pos: usize },

    #[error("expected {expected} at {pos}, found {found}")]
    Expected {
        expected: &'static str,
        found: String,
        pos: usize,
    },

    #[error("unexpected {found} at {pos}")]
    TrailingInput { pos: usize, found: String },
}

/// Read-only variable namespace.
pub trait VariableSource {
    fn lookup(&self, name: &str) -> Option<DecisionValue>;
}

impl VariableSource for BTreeMap<String, DecisionValue> {
    fn lookup(&self, name: &str) -> Option<DecisionValue> {
        self.get(name).cloned()
    }
}

impl VariableSource for HashMap<String, DecisionValue> {
    fn lookup(&self, name: &str) -> Option<DecisionValue> {
        self.get(name).cloned()
    }
}

/// The two namespaces an expression sees, decisions first.
pub struct Scope<'a> {
    decisions: &'a Decisions,
    state: &'a dyn VariableSource,
    max_turns: usize,
}

impl<'a> Scope<'a> {
    pub fn new(decisions: &'a Decisions, state: &'a dyn VariableSource, max_turns: usize) -> Self {
        Self {
            decisions,
            state,
            max_turns,
        }
    }

    /// Resolve an identifier: decisions, then state, then system conditions.
    pub fn get(&self, name: &str) -> Option<DecisionValue> {
        if let Some(v) = self.decisions.get(name) {
            return Some(v.clone());
        }
        if let Some(v) = self.state.lookup(name) {
            return Some(v);
        }
        self.system(name).map(DecisionValue::Bool)
    }

    pub fn decisions(&self) -> &Decisions {
        self.decisions
    }

    pub fn state(&self) -> &dyn VariableSource {
        self.state
    }

    /// Built-in run-scoped conditions.
    fn system(&self, name: &str) -> Option<bool> {
        match name {
            "max_turns_exceeded" => {
                let total = self
                    .state
                    .lookup("total_turns")
                    .and_then(|v| v.as_f64())
                    .unwrap_or(0.0);
                let max = self
                    .state
                    .lookup("max_turns")
                    .and_then(|v| v.as_f64())
                    .unwrap_or(self.max_turns as f64);
                Some(total >= max)
            }
            "error_occurred" => Some(
                self.state
                    .lookup("error")
                    .is_some_and(|e| !e.to_string().is_empty()),
            ),
            _ => None,
        }
    }
}

/// Workflow-specific named predicates, consulted when a whole expression is
/// `name` or `name(arg)`.
pub trait ConditionExtension: Send + Sync {
    /// `None` means the name is not handled here.
    fn check(&self, name: &str, arg: Option<&str>, scope: &Scope<'_>) -> Option<bool>;
}

type Predicate = Box<dyn Fn(Option<&str>, &Scope<'_>) -> bool + Send + Sync>;

/// Closure-backed extension.
#[derive(Default)]
pub struct PredicateTable {
    predicates: HashMap<String, Predicate>,
}

impl PredicateTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(
        mut self,
        name: impl Into<String>,
        predicate: impl Fn(Option<&str>, &Scope<'_>) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.predicates.insert(name.into(), Box::new(predicate));
        self
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.predicates.keys().map(|k| k.as_str())
    }
}

impl ConditionExtension for PredicateTable {
    fn check(&self, name: &str, arg: Option<&str>, scope: &Scope<'_>) -> Option<bool> {
        self.predicates.get(name).map(|p| p(arg, scope))
    }
}

/// Evaluates condition expressions for one workflow.
#[derive(Clone)]
pub struct ConditionEvaluator {
    max_turns: usize,
    extension: Option<Arc<dyn ConditionExtension>>,
}

impl ConditionEvaluator {
    pub fn new(max_turns: usize) -> Self {
        Self {
            max_turns,
            extension: None,
        }
    }

    pub fn with_extension(mut self, extension: Arc<dyn ConditionExtension>) -> Self {
        self.extension = Some(extension);
        self
    }

    /// Parse without evaluating, for up-front validation.
    pub fn parse(expr: &str) -> Result<Expr, ConditionError> {
        parse(expr)
    }

    /// Evaluate `expr`. Never fails: malformed input falls back to an
    /// identifier lookup of the whole trimmed expression.
    pub fn evaluate(&self, expr: &str, decisions: &Decisions, state: &dyn VariableSource) -> bool {
        match self.try_evaluate(expr, decisions, state) {
            Ok(result) => result,
            Err(e) => {
                let raw = expr.trim();
                let scope = Scope::new(decisions, state, self.max_turns);
                let fallback = scope.get(raw).is_some_and(|v| v.is_truthy());
                warn!(
                    expression = %raw,
                    error = %e,
                    fallback,
                    "Malformed condition, falling back to identifier lookup"
                );
                fallback
            }
        }
    }

    /// Evaluate `expr`, surfacing parse errors.
    pub fn try_evaluate(
        &self,
        expr: &str,
        decisions: &Decisions,
        state: &dyn VariableSource,
    ) -> Result<bool, ConditionError> {
        let expr = expr.trim();
        if expr.is_empty() {
            return Ok(true);
        }

        let scope = Scope::new(decisions, state, self.max_turns);

        if expr.eq_ignore_ascii_case("always") {
            return Ok(true);
        }
        if expr.eq_ignore_ascii_case("never") {
            return Ok(false);
        }
        if let Some(result) = scope.system(expr) {
            return Ok(result);
        }

        if let Some(ext) = &self.extension {
            if let Some((name, arg)) = split_call(expr) {
                if let Some(result) = ext.check(name, arg, &scope) {
                    debug!(expression = %expr, result, "Condition handled by extension");
                    return Ok(result);
                }
            }
        }

        let ast = parse(expr)?;
        Ok(eval_bool(&ast, &scope))
    }
}

/// Split `name` or `name(arg)` into parts. Quotes around `arg` are stripped.
fn split_call(expr: &str) -> Option<(&str, Option<&str>)> {
    let is_name = |s: &str| {
        !s.is_empty()
            && s.chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    };

    if is_name(expr) {
        return Some((expr, None));
    }
    let (name, rest) = expr.split_once('(')?;
    let name = name.trim();
    let arg = rest.strip_suffix(')')?.trim();
    if !is_name(name) {
        return None;
    }
    let arg = arg
        .strip_prefix('"')
        .and_then(|a| a.strip_suffix('"'))
        .or_else(|| arg.strip_prefix('\'').and_then(|a| a.strip_suffix('\'')))
        .unwrap_or(arg);
    Some((name, if arg.is_empty() { None } else { Some(arg) }))
}

/// A comparison operand; `None` is the undefined sentinel.
fn eval_operand(expr: &Expr, scope: &Scope<'_>) -> Option<DecisionValue> {
    match expr {
        Expr::Literal(v) => Some(v.clone()),
        Expr::Var(name) => scope.get(name),
        other => Some(DecisionValue::Bool(eval_bool(other, scope))),
    }
}

fn eval_bool(expr: &Expr, scope: &Scope<'_>) -> bool {
    match expr {
        Expr::Literal(v) => v.is_truthy(),
        Expr::Var(name) => scope.get(name).is_some_and(|v| v.is_truthy()),
        Expr::Not(inner) => !eval_bool(inner, scope),
        Expr::And(items) => items.iter().all(|e| eval_bool(e, scope)),
        Expr::Or(items) => items.iter().any(|e| eval_bool(e, scope)),
        Expr::Compare { first, rest } => {
            let mut left = eval_operand(first, scope);
            for (op, operand) in rest {
                let right = eval_operand(operand, scope);
                if !compare(left.as_ref(), *op, right.as_ref()) {
                    return false;
                }
                left = right;
            }
            true
        }
    }
}

fn compare(left: Option<&DecisionValue>, op: CmpOp, right: Option<&DecisionValue>) -> bool {
    let (Some(left), Some(right)) = (left, right) else {
        return false;
    };

    if let (Some(a), Some(b)) = (left.as_f64(), right.as_f64()) {
        return match op {
            CmpOp::Eq => a == b,
            CmpOp::Ne => a != b,
            CmpOp::Gt => a > b,
            CmpOp::Ge => a >= b,
            CmpOp::Lt => a < b,
            CmpOp::Le => a <= b,
        };
    }

    let a = comparable_text(left);
    let b = comparable_text(right);
    match op {
        CmpOp::Eq => a == b,
        CmpOp::Ne => a != b,
        CmpOp::Gt => a > b,
        CmpOp::Ge => a >= b,
        CmpOp::Lt => a < b,
        CmpOp::Le => a <= b,
    }
}

/// Booleans compare as lowercase words so `"True" == true` holds.
fn comparable_text(value: &DecisionValue) -> String {
    match value {
        DecisionValue::Str(s) if s.eq_ignore_ascii_case("true") => "true".into(),
        DecisionValue::Str(s) if s.eq_ignore_ascii_case("false") => "false".into(),
        other => other.to_string(),
    }
}
