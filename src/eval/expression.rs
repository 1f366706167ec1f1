use std::cmp::Ordering;

use async_recursion::async_recursion;
use chrono::Utc;
use dashmap::DashMap;
use lazy_static::lazy_static;
use regex::Regex;
use tracing::debug;

use super::context::EvaluationContext;
use super::{EvalError, EvalResult};
use crate::ast::{ComparisonOperator, ExistsPattern, Expression};
use crate::value::Value;

/// Patterns kept before the cache is cleared.
const REGEX_CACHE_CAPACITY: usize = 256;

lazy_static! {
    // MATCHES パターンのキャッシュ
    static ref REGEX_CACHE: DashMap<String, Regex> = DashMap::new();
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ExpressionEvaluator;

impl ExpressionEvaluator {
    pub fn new() -> Self {
        Self
    }

    #[async_recursion]
    pub async fn eval_expression(
        &self,
        expr: &Expression,
        context: &EvaluationContext,
    ) -> EvalResult<Value> {
        match expr {
            Expression::Literal(literal) => Ok(Value::from(literal)),
            Expression::List(items) => {
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    values.push(self.eval_expression(item, context).await?);
                }
                Ok(Value::List(values))
            }
            Expression::Path(path) => Ok(context.resolve_path(path)),
            Expression::And(left, right) => {
                if !self.eval_condition(left, context).await? {
                    return Ok(Value::Boolean(false));
                }
                Ok(Value::Boolean(self.eval_condition(right, context).await?))
            }
            Expression::Or(left, right) => {
                if self.eval_condition(left, context).await? {
                    return Ok(Value::Boolean(true));
                }
                Ok(Value::Boolean(self.eval_condition(right, context).await?))
            }
            Expression::Not(operand) => {
                Ok(Value::Boolean(!self.eval_condition(operand, context).await?))
            }
            Expression::Comparison { op, left, right } => {
                let left = self.eval_expression(left, context).await?;
                let right = self.eval_expression(right, context).await?;
                Self::compare(*op, &left, &right).map(Value::Boolean)
            }
            Expression::IsNull { operand, negated } => {
                let value = self.eval_expression(operand, context).await?;
                Ok(Value::Boolean(value.is_null() != *negated))
            }
            Expression::FunctionCall { name, arguments } => {
                let mut args = Vec::with_capacity(arguments.len());
                for argument in arguments {
                    args.push(self.eval_expression(argument, context).await?);
                }
                self.eval_function_call(name, args, context).await
            }
            Expression::Exists(pattern) => self.eval_exists(pattern, context).await,
        }
    }

    /// Evaluates and applies truthiness.
    pub async fn eval_condition(
        &self,
        expr: &Expression,
        context: &EvaluationContext,
    ) -> EvalResult<bool> {
        Ok(self.eval_expression(expr, context).await?.is_truthy())
    }

    pub fn compare(op: ComparisonOperator, left: &Value, right: &Value) -> EvalResult<bool> {
        let mismatch = || EvalError::TypeMismatch {
            op: op.to_string(),
            left: left.type_name().to_string(),
            right: right.type_name().to_string(),
        };

        match op {
            ComparisonOperator::Equal => Ok(left.loose_eq(right)),
            ComparisonOperator::NotEqual => Ok(!left.loose_eq(right)),
            ComparisonOperator::LessThan
            | ComparisonOperator::GreaterThan
            | ComparisonOperator::LessThanEqual
            | ComparisonOperator::GreaterThanEqual => {
                let ordering = left.partial_compare(right).ok_or_else(mismatch)?;
                Ok(match op {
                    ComparisonOperator::LessThan => ordering == Ordering::Less,
                    ComparisonOperator::GreaterThan => ordering == Ordering::Greater,
                    ComparisonOperator::LessThanEqual => ordering != Ordering::Greater,
                    _ => ordering != Ordering::Less,
                })
            }
            ComparisonOperator::In => match (left, right) {
                (_, Value::List(items)) => Ok(items.iter().any(|item| item.loose_eq(left))),
                (Value::String(needle), Value::String(haystack)) => {
                    Ok(haystack.contains(needle.as_str()))
                }
                _ => Err(mismatch()),
            },
            ComparisonOperator::Matches => match (left, right) {
                (Value::Null, _) => Ok(false),
                (Value::String(text), Value::String(pattern)) => {
                    Ok(Self::cached_regex(pattern)?.is_match(text))
                }
                _ => Err(mismatch()),
            },
        }
    }

    fn cached_regex(pattern: &str) -> EvalResult<Regex> {
        if let Some(regex) = REGEX_CACHE.get(pattern) {
            return Ok(regex.clone());
        }
        let regex = Regex::new(&format!("^(?:{})$", pattern)).map_err(|e| EvalError::InvalidRegex {
            pattern: pattern.to_string(),
            message: e.to_string(),
        })?;
        if REGEX_CACHE.len() >= REGEX_CACHE_CAPACITY {
            debug!("regex cache full, clearing {} patterns", REGEX_CACHE.len());
            REGEX_CACHE.clear();
        }
        REGEX_CACHE.insert(pattern.to_string(), regex.clone());
        Ok(regex)
    }

    async fn eval_function_call(
        &self,
        name: &str,
        args: Vec<Value>,
        context: &EvaluationContext,
    ) -> EvalResult<Value> {
        if let Some(result) = Self::eval_builtin(name, &args) {
            return result;
        }

        debug!("delegating function {} to the entity store", name);
        match context.store() {
            Some(store) => Ok(store.call_function(name, args).await?),
            None => Err(EvalError::UnknownFunction(name.to_string())),
        }
    }

    /// `None` when `name` is not a builtin.
    fn eval_builtin(name: &str, args: &[Value]) -> Option<EvalResult<Value>> {
        let function = name.to_ascii_uppercase();
        let invalid = |message: &str| {
            Err(EvalError::InvalidArgument {
                function: function.clone(),
                message: message.to_string(),
            })
        };

        let result = match (function.as_str(), args) {
            ("NOW", []) => Ok(Value::String(Utc::now().to_rfc3339())),
            ("NOW", _) => invalid("takes no arguments"),
            ("LEN", [value]) => match value {
                Value::Null => Ok(Value::Integer(0)),
                Value::String(s) => Ok(Value::Integer(s.chars().count() as i64)),
                Value::List(items) => Ok(Value::Integer(items.len() as i64)),
                Value::Map(map) => Ok(Value::Integer(map.len() as i64)),
                _ => invalid("expected a string, list or map"),
            },
            ("UPPER", [Value::String(s)]) => Ok(Value::String(s.to_uppercase())),
            ("LOWER", [Value::String(s)]) => Ok(Value::String(s.to_lowercase())),
            ("UPPER" | "LOWER", [Value::Null]) => Ok(Value::Null),
            ("UPPER" | "LOWER" | "LEN", _) => invalid("expected a single string argument"),
            ("CONCAT", values) => Ok(Value::String(
                values
                    .iter()
                    .filter(|v| !v.is_null())
                    .map(|v| v.to_string())
                    .collect(),
            )),
            ("COALESCE", values) => Ok(values
                .iter()
                .find(|v| !v.is_null())
                .cloned()
                .unwrap_or_default()),
            ("ABS", [Value::Integer(i)]) => match i.checked_abs() {
                Some(abs) => Ok(Value::Integer(abs)),
                None => invalid("integer overflow"),
            },
            ("ABS", [Value::Float(f)]) => Ok(Value::Float(f.abs())),
            ("ABS", _) => invalid("expected a single number"),
            _ => return None,
        };
        Some(result)
    }

    async fn eval_exists(
        &self,
        pattern: &ExistsPattern,
        context: &EvaluationContext,
    ) -> EvalResult<Value> {
        let store = context
            .store()
            .ok_or_else(|| EvalError::NoStore("EXISTS".to_string()))?;
        let candidates = store.scan(&pattern.entity_type).await?;

        let Some(filter) = &pattern.filter else {
            return Ok(Value::Boolean(!candidates.is_empty()));
        };
        for candidate in candidates {
            let mut scoped = context.clone();
            scoped.bind(&pattern.variable, Value::Map(candidate.snapshot()));
            if self.eval_condition(filter, &scoped).await? {
                return Ok(Value::Boolean(true));
            }
        }
        Ok(Value::Boolean(false))
    }
}
