use core::fmt;

use thiserror::Error;

/// A top-level item of a DSL source file.
#[derive(Debug, Clone, PartialEq)]
pub enum Definition {
    Action(ActionDef),
    Rule(RuleDef),
}

impl Definition {
    pub fn as_action(&self) -> Option<&ActionDef> {
        match self {
            Definition::Action(action) => Some(action),
            Definition::Rule(_) => None,
        }
    }

    pub fn as_rule(&self) -> Option<&RuleDef> {
        match self {
            Definition::Rule(rule) => Some(rule),
            Definition::Action(_) => None,
        }
    }

    /// `Entity.action` for actions, the rule name for rules.
    pub fn name(&self) -> String {
        match self {
            Definition::Action(action) => action.qualified_name(),
            Definition::Rule(rule) => rule.name.clone(),
        }
    }
}

// ACTION
#[derive(Debug, Clone, PartialEq)]
pub struct ActionDef {
    pub entity_type: String,
    pub action_name: String,
    pub parameters: Vec<Parameter>,
    pub preconditions: Vec<Precondition>,
    pub effect: Option<Vec<Statement>>,
}

impl ActionDef {
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.entity_type, self.action_name)
    }

    pub fn parameter(&self, name: &str) -> Option<&Parameter> {
        self.parameters.iter().find(|p| p.name == name)
    }

    /// Checks structural constraints the grammar cannot express.
    pub fn validate(&self) -> ASTResult<()> {
        for (i, param) in self.parameters.iter().enumerate() {
            if self.parameters[..i].iter().any(|p| p.name == param.name) {
                return Err(ASTError::DuplicateParameter {
                    action: self.qualified_name(),
                    name: param.name.clone(),
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    pub name: String,
    pub param_type: String,
    pub optional: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Precondition {
    pub name: Option<String>,
    pub condition: Expression,
    pub on_failure: String,
}

impl Precondition {
    /// Display label; `position` is 1-based.
    pub fn label(&self, position: usize) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => format!("Check {}", position),
        }
    }
}

// RULE
#[derive(Debug, Clone, PartialEq)]
pub struct RuleDef {
    pub name: String,
    pub priority: i64,
    pub trigger: Trigger,
    pub body: ForClause,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Trigger {
    pub trigger_type: TriggerType,
    pub entity_type: String,
    pub property: Option<String>,
}

impl Trigger {
    pub fn new(trigger_type: TriggerType, entity_type: &str, property: Option<&str>) -> Self {
        Self {
            trigger_type,
            entity_type: entity_type.to_string(),
            property: property.map(String::from),
        }
    }

    /// Index key: `{type}:{entity_type}[:{property}]`.
    pub fn key(&self) -> String {
        match &self.property {
            Some(property) => format!("{}:{}:{}", self.trigger_type, self.entity_type, property),
            None => format!("{}:{}", self.trigger_type, self.entity_type),
        }
    }

    /// The same trigger without its property.
    pub fn widened(&self) -> Option<Trigger> {
        self.property.as_ref().map(|_| Trigger {
            trigger_type: self.trigger_type,
            entity_type: self.entity_type.clone(),
            property: None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum TriggerType {
    Create,
    Update,
    Delete,
    Link,
    Scan,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ForClause {
    pub variable: String,
    pub entity_type: String,
    pub condition: Option<Expression>,
    pub statements: Vec<Statement>,
}

// Statements shared by EFFECT blocks and FOR bodies
#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    Set {
        target: PathRef,
        value: Expression,
    },
    Call {
        service: String,
        method: String,
        arguments: Vec<NamedArgument>,
        into: Option<String>,
    },
    /// Rule bodies only.
    Trigger {
        entity_type: String,
        action_name: String,
        target: String,
        params: Vec<NamedArgument>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct NamedArgument {
    pub name: String,
    pub value: Expression,
}

impl NamedArgument {
    pub fn new(name: &str, value: Expression) -> Self {
        Self {
            name: name.to_string(),
            value,
        }
    }
}

// Expressions
#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    Literal(Literal),
    List(Vec<Expression>),
    Path(PathRef),
    And(Box<Expression>, Box<Expression>),
    Or(Box<Expression>, Box<Expression>),
    Not(Box<Expression>),
    Comparison {
        op: ComparisonOperator,
        left: Box<Expression>,
        right: Box<Expression>,
    },
    IsNull {
        operand: Box<Expression>,
        negated: bool,
    },
    FunctionCall {
        name: String,
        arguments: Vec<Expression>,
    },
    Exists(ExistsPattern),
}

impl Expression {
    pub fn path(path: &str) -> Self {
        Expression::Path(PathRef::from_dotted(path))
    }

    pub fn string(s: &str) -> Self {
        Expression::Literal(Literal::String(s.to_string()))
    }

    pub fn integer(i: i64) -> Self {
        Expression::Literal(Literal::Integer(i))
    }

    pub fn boolean(b: bool) -> Self {
        Expression::Literal(Literal::Boolean(b))
    }

    pub fn compare(op: ComparisonOperator, left: Expression, right: Expression) -> Self {
        Expression::Comparison {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn and(left: Expression, right: Expression) -> Self {
        Expression::And(Box::new(left), Box::new(right))
    }

    pub fn or(left: Expression, right: Expression) -> Self {
        Expression::Or(Box::new(left), Box::new(right))
    }

    pub fn not(operand: Expression) -> Self {
        Expression::Not(Box::new(operand))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    String(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    Null,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString)]
pub enum ComparisonOperator {
    #[strum(serialize = "==")]
    Equal,
    #[strum(serialize = "!=")]
    NotEqual,
    #[strum(serialize = "<")]
    LessThan,
    #[strum(serialize = ">")]
    GreaterThan,
    #[strum(serialize = "<=")]
    LessThanEqual,
    #[strum(serialize = ">=")]
    GreaterThanEqual,
    #[strum(serialize = "IN")]
    In,
    #[strum(serialize = "MATCHES")]
    Matches,
}

/// `EXISTS(var: Entity WHERE expr)`
#[derive(Debug, Clone, PartialEq)]
pub struct ExistsPattern {
    pub variable: String,
    pub entity_type: String,
    pub filter: Option<Box<Expression>>,
}

/// Dot-separated access path. The root is `this` or a bound variable.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PathRef(pub Vec<String>);

impl PathRef {
    pub const THIS: &'static str = "this";

    pub fn from_dotted(path: &str) -> Self {
        PathRef(path.split('.').map(String::from).collect())
    }

    pub fn root(&self) -> &str {
        self.0.first().map(String::as_str).unwrap_or_default()
    }

    pub fn segments(&self) -> &[String] {
        self.0.get(1..).unwrap_or_default()
    }

    pub fn is_this(&self) -> bool {
        self.root() == Self::THIS
    }

    /// Property name written by `SET`: a leading `this.` is stripped.
    pub fn property_name(&self) -> String {
        if self.is_this() && self.0.len() > 1 {
            self.segments().join(".")
        } else {
            self.0.join(".")
        }
    }
}

impl fmt::Display for PathRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0.join("."))
    }
}

#[derive(Error, Debug, PartialEq)]
pub enum ASTError {
    #[error("Duplicate parameter '{name}' in action {action}")]
    DuplicateParameter { action: String, name: String },
}

pub type ASTResult<T> = Result<T, ASTError>;
