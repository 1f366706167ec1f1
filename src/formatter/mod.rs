//! Canonical DSL printing and human-readable action descriptions.
//!
//! Every printed form parses back into an equivalent AST.

pub mod config;
pub mod visitor;

use core::fmt;

use serde::Serialize;

use crate::ast::*;
use config::FormatterConfig;
use visitor::FormatterVisitor;

pub fn format_definitions(definitions: &[Definition]) -> String {
    FormatterVisitor::new(FormatterConfig::default()).format_definitions(definitions)
}

impl fmt::Display for Definition {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", format_definitions(std::slice::from_ref(self)))
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}({}", self.trigger_type, self.entity_type)?;
        if let Some(property) = &self.property {
            write!(f, ".{}", property)?;
        }
        write!(f, ")")
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Statement::Set { target, value } => write!(f, "SET {} = {};", target, value),
            Statement::Call {
                service,
                method,
                arguments,
                into,
            } => {
                write!(f, "CALL {}.{}({})", service, method, join_arguments(arguments))?;
                if let Some(var) = into {
                    write!(f, " INTO {}", var)?;
                }
                write!(f, ";")
            }
            Statement::Trigger {
                entity_type,
                action_name,
                target,
                params,
            } => {
                write!(f, "TRIGGER {}.{} ON {}", entity_type, action_name, target)?;
                if !params.is_empty() {
                    write!(f, " WITH {{ {} }}", join_arguments(params))?;
                }
                write!(f, ";")
            }
        }
    }
}

fn join_arguments(arguments: &[NamedArgument]) -> String {
    arguments
        .iter()
        .map(|arg| format!("{}: {}", arg.name, arg.value))
        .collect::<Vec<_>>()
        .join(", ")
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Literal::String(s) => write!(f, "\"{}\"", s),
            Literal::Integer(i) => write!(f, "{}", i),
            Literal::Float(x) => {
                let text = x.to_string();
                if text.contains('.') {
                    write!(f, "{}", text)
                } else {
                    write!(f, "{}.0", text)
                }
            }
            Literal::Boolean(b) => write!(f, "{}", b),
            Literal::Null => write!(f, "null"),
        }
    }
}

// OR < AND < NOT < comparison < primary
fn precedence(expr: &Expression) -> u8 {
    match expr {
        Expression::Or(..) => 1,
        Expression::And(..) => 2,
        Expression::Not(_) => 3,
        Expression::Comparison { .. } | Expression::IsNull { .. } => 4,
        _ => 5,
    }
}

fn write_expr(f: &mut fmt::Formatter, expr: &Expression, min_precedence: u8) -> fmt::Result {
    if precedence(expr) < min_precedence {
        write!(f, "(")?;
        write_expr(f, expr, 0)?;
        return write!(f, ")");
    }

    match expr {
        Expression::Literal(literal) => write!(f, "{}", literal),
        Expression::List(items) => {
            write!(f, "[")?;
            write_list(f, items)?;
            write!(f, "]")
        }
        Expression::Path(path) => write!(f, "{}", path),
        Expression::Or(left, right) => {
            write_expr(f, left, 1)?;
            write!(f, " OR ")?;
            write_expr(f, right, 2)
        }
        Expression::And(left, right) => {
            write_expr(f, left, 2)?;
            write!(f, " AND ")?;
            write_expr(f, right, 3)
        }
        Expression::Not(operand) => {
            write!(f, "NOT ")?;
            write_expr(f, operand, 3)
        }
        Expression::Comparison { op, left, right } => {
            write_expr(f, left, 5)?;
            write!(f, " {} ", op)?;
            write_expr(f, right, 5)
        }
        Expression::IsNull { operand, negated } => {
            write_expr(f, operand, 5)?;
            write!(f, " {}", if *negated { "IS NOT NULL" } else { "IS NULL" })
        }
        Expression::FunctionCall { name, arguments } => {
            write!(f, "{}(", name)?;
            write_list(f, arguments)?;
            write!(f, ")")
        }
        Expression::Exists(pattern) => {
            write!(f, "EXISTS({}: {}", pattern.variable, pattern.entity_type)?;
            if let Some(filter) = &pattern.filter {
                write!(f, " WHERE {}", filter)?;
            }
            write!(f, ")")
        }
    }
}

fn write_list(f: &mut fmt::Formatter, items: &[Expression]) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write_expr(f, item, 0)?;
    }
    Ok(())
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write_expr(f, self, 0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParameterSummary {
    pub name: String,
    #[serde(rename = "type")]
    pub param_type: String,
    pub optional: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PreconditionSummary {
    pub name: String,
    pub rule: String,
    pub on_failure: String,
}

/// Serializable view of an action, for tooling output.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActionSummary {
    pub name: String,
    pub entity_type: String,
    pub parameters: Vec<ParameterSummary>,
    pub preconditions: Vec<PreconditionSummary>,
    pub has_effect: bool,
}

impl From<&ActionDef> for ActionSummary {
    fn from(action: &ActionDef) -> Self {
        Self {
            name: action.action_name.clone(),
            entity_type: action.entity_type.clone(),
            parameters: action
                .parameters
                .iter()
                .map(|p| ParameterSummary {
                    name: p.name.clone(),
                    param_type: p.param_type.clone(),
                    optional: p.optional,
                })
                .collect(),
            preconditions: action
                .preconditions
                .iter()
                .enumerate()
                .map(|(i, p)| PreconditionSummary {
                    name: p.label(i + 1),
                    rule: p.condition.to_string(),
                    on_failure: p.on_failure.clone(),
                })
                .collect(),
            has_effect: action.effect.is_some(),
        }
    }
}

/// Multi-line description of an action for operators.
pub fn describe_action(action: &ActionDef) -> String {
    let mut output = vec![format!("Action: {}", action.qualified_name())];

    if action.parameters.is_empty() {
        output.push("  Parameters: None".to_string());
    } else {
        output.push("  Parameters:".to_string());
        for param in &action.parameters {
            let optional = if param.optional { "optional" } else { "required" };
            output.push(format!(
                "    - {} ({}, {})",
                param.name, param.param_type, optional
            ));
        }
    }

    if action.preconditions.is_empty() {
        output.push("  Preconditions: None".to_string());
    } else {
        output.push("  Preconditions (All must be true):".to_string());
        for (i, precondition) in action.preconditions.iter().enumerate() {
            let position = i + 1;
            output.push(format!("    {}. {}:", position, precondition.label(position)));
            output.push(format!("       Rule: {}", precondition.condition));
            output.push(format!(
                "       Error Message if False: {}",
                precondition.on_failure
            ));
        }
    }

    match &action.effect {
        Some(_) => output.push("  Effect: Yes (modifies state)".to_string()),
        None => output.push("  Effect: None (read-only)".to_string()),
    }

    output.join("\n")
}
