use std::path::Path;
use std::str::FromStr;

use nom::{
    branch::alt,
    bytes::complete::{tag, take_while, take_while1},
    character::complete::{char, digit1, multispace1, not_line_ending, satisfy},
    combinator::{cut, eof, fail, map, map_res, not, opt, peek, recognize, value, verify},
    error::{context, VerboseError, VerboseErrorKind},
    multi::{many0, separated_list0},
    sequence::{delimited, pair, preceded, terminated, tuple},
    Finish, IResult,
};
use thiserror::Error;
use tracing::{debug, instrument};

use crate::ast::*;

type PResult<'a, O> = IResult<&'a str, O, VerboseError<&'a str>>;

const KEYWORDS: [&str; 27] = [
    "ACTION",
    "PRECONDITION",
    "ON_FAILURE",
    "EFFECT",
    "SET",
    "CALL",
    "INTO",
    "RULE",
    "PRIORITY",
    "ON",
    "FOR",
    "WHERE",
    "TRIGGER",
    "WITH",
    "AND",
    "OR",
    "NOT",
    "IN",
    "MATCHES",
    "IS",
    "NULL",
    "EXISTS",
    "true",
    "false",
    "TRUE",
    "FALSE",
    "null",
];

#[derive(Error, Debug, PartialEq)]
pub enum ParseError {
    #[error("Syntax error at line {line}, column {column} near '{token}': {message}")]
    Syntax {
        line: usize,
        column: usize,
        token: String,
        message: String,
    },
    #[error("Failed to read {path}: {message}")]
    Io { path: String, message: String },
    #[error(transparent)]
    Ast(#[from] ASTError),
}

pub type ParseResult<T> = Result<T, ParseError>;

/// Parses a DSL document into its ACTION and RULE definitions, in source order.
#[instrument(level = "debug", skip(source))]
pub fn parse(source: &str) -> ParseResult<Vec<Definition>> {
    let (_, definitions) = terminated(
        preceded(sp, many0(ws(parse_definition))),
        context("expected ACTION or RULE definition", eof),
    )(source)
    .finish()
    .map_err(|e| syntax_error(source, e))?;

    for definition in &definitions {
        if let Definition::Action(action) = definition {
            action.validate()?;
        }
    }
    debug!("parsed {} definitions", definitions.len());
    Ok(definitions)
}

pub fn parse_file(path: impl AsRef<Path>) -> ParseResult<Vec<Definition>> {
    let path = path.as_ref();
    let source = std::fs::read_to_string(path).map_err(|e| ParseError::Io {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;
    parse(&source)
}

/// Parses a standalone expression, e.g. for ad-hoc evaluation.
#[instrument(level = "debug", skip(source))]
pub fn parse_expression(source: &str) -> ParseResult<Expression> {
    let (_, expression) = terminated(ws(parse_expr), context("unexpected trailing input", eof))(
        source,
    )
    .finish()
    .map_err(|e| syntax_error(source, e))?;
    Ok(expression)
}

fn syntax_error(source: &str, error: VerboseError<&str>) -> ParseError {
    let remaining = error
        .errors
        .first()
        .map(|(rest, _)| rest.trim_start())
        .unwrap_or_default();
    let offset = source.len().saturating_sub(remaining.len());
    let consumed = &source[..offset];
    let line = consumed.matches('\n').count() + 1;
    let column = consumed
        .rsplit('\n')
        .next()
        .map(|l| l.chars().count())
        .unwrap_or_default()
        + 1;

    let message = match error.errors.first() {
        Some((_, VerboseErrorKind::Char(c))) => format!("expected '{}'", c),
        _ => error
            .errors
            .iter()
            .find_map(|(_, kind)| match kind {
                VerboseErrorKind::Context(ctx) => Some(ctx.to_string()),
                _ => None,
            })
            .unwrap_or_else(|| "unexpected token".to_string()),
    };

    let token = match remaining.split_whitespace().next() {
        Some(word) => word.chars().take(24).collect(),
        None => "end of input".to_string(),
    };

    ParseError::Syntax {
        line,
        column,
        token,
        message,
    }
}

#[instrument(level = "debug", skip(input))]
fn parse_definition(input: &str) -> PResult<Definition> {
    alt((
        map(parse_action, Definition::Action),
        map(parse_rule, Definition::Rule),
    ))(input)
}

// ACTION Entity.action(params) { ... }
#[instrument(level = "debug", skip(input))]
fn parse_action(input: &str) -> PResult<ActionDef> {
    let (input, _) = keyword("ACTION")(input)?;
    let (input, (entity_type, action_name)) =
        cut(context("expected <Entity>.<action>", parse_entity_action))(input)?;
    let (input, parameters) = opt(delimited(
        ws(char('(')),
        separated_list0(ws(char(',')), parse_parameter),
        cut(ws(char(')'))),
    ))(input)?;
    let (input, _) = cut(ws(char('{')))(input)?;
    let (input, preconditions) = many0(parse_precondition)(input)?;
    let (input, effect) = opt(parse_effect)(input)?;
    let (input, _) = cut(ws(char('}')))(input)?;

    Ok((
        input,
        ActionDef {
            entity_type: entity_type.to_string(),
            action_name: action_name.to_string(),
            parameters: parameters.unwrap_or_default(),
            preconditions,
            effect: effect.flatten(),
        },
    ))
}

fn parse_entity_action(input: &str) -> PResult<(&str, &str)> {
    tuple((ws(identifier), preceded(char('.'), ws(identifier))))(input)
}

#[instrument(level = "debug", skip(input))]
fn parse_parameter(input: &str) -> PResult<Parameter> {
    map(
        tuple((
            ws(identifier),
            preceded(ws(char(':')), cut(ws(identifier))),
            opt(ws(char('?'))),
        )),
        |(name, param_type, optional)| Parameter {
            name: name.to_string(),
            param_type: param_type.to_string(),
            optional: optional.is_some(),
        },
    )(input)
}

// PRECONDITION [name]: expr ON_FAILURE: "message"
#[instrument(level = "debug", skip(input))]
fn parse_precondition(input: &str) -> PResult<Precondition> {
    let (input, _) = keyword("PRECONDITION")(input)?;
    let (input, (name, _, condition, _, _, on_failure)) = cut(tuple((
        opt(ws(identifier)),
        ws(char(':')),
        context("expected precondition expression", parse_expr),
        context("expected ON_FAILURE", keyword("ON_FAILURE")),
        ws(char(':')),
        context("expected failure message string", ws(parse_string)),
    )))(input)?;

    Ok((
        input,
        Precondition {
            name: name.map(String::from),
            condition,
            on_failure,
        },
    ))
}

// 空のEFFECTブロックはNoneとして扱う
#[instrument(level = "debug", skip(input))]
fn parse_effect(input: &str) -> PResult<Option<Vec<Statement>>> {
    let (input, _) = keyword("EFFECT")(input)?;
    let (input, statements) = cut(delimited(
        ws(char('{')),
        many0(parse_effect_statement),
        ws(char('}')),
    ))(input)?;
    Ok((input, (!statements.is_empty()).then_some(statements)))
}

fn parse_effect_statement(input: &str) -> PResult<Statement> {
    alt((
        parse_set_statement,
        parse_call_statement,
        preceded(
            peek(keyword("TRIGGER")),
            cut(context("TRIGGER is only allowed inside RULE bodies", fail)),
        ),
    ))(input)
}

fn parse_rule_statement(input: &str) -> PResult<Statement> {
    alt((
        parse_set_statement,
        parse_call_statement,
        parse_trigger_statement,
    ))(input)
}

// SET path = expr;
#[instrument(level = "debug", skip(input))]
fn parse_set_statement(input: &str) -> PResult<Statement> {
    let (input, _) = keyword("SET")(input)?;
    let (input, (target, _, value, _)) = cut(tuple((
        context("expected assignment target", ws(parse_path)),
        ws(char('=')),
        context("expected expression", parse_expr),
        opt(ws(char(';'))),
    )))(input)?;
    Ok((input, Statement::Set { target, value }))
}

// CALL service.method(field: expr, ...) [INTO var];
#[instrument(level = "debug", skip(input))]
fn parse_call_statement(input: &str) -> PResult<Statement> {
    let (input, _) = keyword("CALL")(input)?;
    let (input, (path, arguments, into, _)) = cut(tuple((
        context(
            "expected <service>.<method>",
            verify(ws(parse_path), |p: &PathRef| p.0.len() >= 2),
        ),
        delimited(
            ws(char('(')),
            separated_list0(ws(char(',')), parse_named_argument),
            ws(char(')')),
        ),
        opt(preceded(keyword("INTO"), ws(identifier))),
        opt(ws(char(';'))),
    )))(input)?;

    let mut segments = path.0;
    let method = segments.pop().unwrap_or_default();
    Ok((
        input,
        Statement::Call {
            service: segments.join("."),
            method,
            arguments,
            into: into.map(String::from),
        },
    ))
}

// TRIGGER Entity.action ON var [WITH { field: expr, ... }];
#[instrument(level = "debug", skip(input))]
fn parse_trigger_statement(input: &str) -> PResult<Statement> {
    let (input, _) = keyword("TRIGGER")(input)?;
    let (input, ((entity_type, action_name), _, target, params, _)) = cut(tuple((
        context("expected <Entity>.<action>", parse_entity_action),
        keyword("ON"),
        context("expected bound variable", ws(identifier)),
        opt(preceded(
            keyword("WITH"),
            delimited(
                ws(char('{')),
                separated_list0(ws(char(',')), parse_named_argument),
                ws(char('}')),
            ),
        )),
        opt(ws(char(';'))),
    )))(input)?;

    Ok((
        input,
        Statement::Trigger {
            entity_type: entity_type.to_string(),
            action_name: action_name.to_string(),
            target: target.to_string(),
            params: params.unwrap_or_default(),
        },
    ))
}

fn parse_named_argument(input: &str) -> PResult<NamedArgument> {
    map(
        tuple((ws(identifier), ws(char(':')), cut(parse_expr))),
        |(name, _, value)| NamedArgument::new(name, value),
    )(input)
}

// RULE name [PRIORITY n] { ON TYPE(Entity[.prop]) FOR (v: Entity [WHERE expr]) { ... } }
#[instrument(level = "debug", skip(input))]
fn parse_rule(input: &str) -> PResult<RuleDef> {
    let (input, _) = keyword("RULE")(input)?;
    let (input, name) = cut(context("expected rule name", ws(identifier)))(input)?;
    let (input, priority) = opt(preceded(
        keyword("PRIORITY"),
        cut(context("expected integer priority", ws(parse_i64))),
    ))(input)?;
    let (input, _) = cut(ws(char('{')))(input)?;
    let (input, trigger) = cut(context("expected ON <TYPE>(<Entity>)", parse_trigger))(input)?;
    let (input, body) = cut(context("expected FOR clause", parse_for_clause))(input)?;
    let (input, _) = cut(ws(char('}')))(input)?;

    Ok((
        input,
        RuleDef {
            name: name.to_string(),
            priority: priority.unwrap_or_default(),
            trigger,
            body,
        },
    ))
}

#[instrument(level = "debug", skip(input))]
fn parse_trigger(input: &str) -> PResult<Trigger> {
    let (input, _) = keyword("ON")(input)?;
    let (input, (trigger_type, _, entity_type, property, _)) = cut(tuple((
        context(
            "expected CREATE, UPDATE, DELETE, LINK or SCAN",
            map_res(ws(take_while1(|c: char| c.is_ascii_uppercase())), TriggerType::from_str),
        ),
        ws(char('(')),
        ws(identifier),
        opt(preceded(char('.'), ws(identifier))),
        ws(char(')')),
    )))(input)?;

    Ok((input, Trigger::new(trigger_type, entity_type, property)))
}

#[instrument(level = "debug", skip(input))]
fn parse_for_clause(input: &str) -> PResult<ForClause> {
    let (input, _) = keyword("FOR")(input)?;
    let (input, (_, variable, _, entity_type, condition, _)) = cut(tuple((
        ws(char('(')),
        ws(identifier),
        ws(char(':')),
        ws(identifier),
        opt(preceded(keyword("WHERE"), cut(parse_expr))),
        ws(char(')')),
    )))(input)?;
    let (input, statements) = cut(delimited(
        ws(char('{')),
        many0(parse_rule_statement),
        ws(char('}')),
    ))(input)?;

    Ok((
        input,
        ForClause {
            variable: variable.to_string(),
            entity_type: entity_type.to_string(),
            condition,
            statements,
        },
    ))
}

fn parse_expr(input: &str) -> PResult<Expression> {
    parse_logical_or(input)
}

// 論理OR
#[instrument(level = "debug", skip(input))]
fn parse_logical_or(input: &str) -> PResult<Expression> {
    let (input, first) = parse_logical_and(input)?;
    let (input, rest) = many0(preceded(keyword("OR"), cut(parse_logical_and)))(input)?;

    let result = rest.into_iter().fold(first, Expression::or);
    Ok((input, result))
}

// 論理AND
#[instrument(level = "debug", skip(input))]
fn parse_logical_and(input: &str) -> PResult<Expression> {
    let (input, first) = parse_not(input)?;
    let (input, rest) = many0(preceded(keyword("AND"), cut(parse_not)))(input)?;

    let result = rest.into_iter().fold(first, Expression::and);
    Ok((input, result))
}

fn parse_not(input: &str) -> PResult<Expression> {
    alt((
        map(preceded(keyword("NOT"), cut(parse_not)), Expression::not),
        parse_comparison,
    ))(input)
}

// 比較演算子は二項のみ
#[instrument(level = "debug", skip(input))]
fn parse_comparison(input: &str) -> PResult<Expression> {
    let (input, left) = parse_primary(input)?;
    let (input, tail) = opt(alt((
        map(
            pair(parse_comparison_operator, cut(parse_primary)),
            |(op, right)| (Some((op, right)), false),
        ),
        map(
            preceded(keyword("IS"), cut(terminated(opt(keyword("NOT")), keyword("NULL")))),
            |not| (None, not.is_some()),
        ),
    )))(input)?;

    let expression = match tail {
        None => return Ok((input, left)),
        Some((Some((op, right)), _)) => Expression::compare(op, left, right),
        Some((None, negated)) => Expression::IsNull {
            operand: Box::new(left),
            negated,
        },
    };

    let (input, _) = cut(context(
        "comparison chains are not allowed",
        not(alt((
            map(parse_comparison_operator, |_| ()),
            map(keyword("IS"), |_| ()),
        ))),
    ))(input)?;
    Ok((input, expression))
}

fn parse_comparison_operator(input: &str) -> PResult<ComparisonOperator> {
    map_res(
        alt((
            ws(alt((
                tag("=="),
                tag("!="),
                tag("<="),
                tag(">="),
                tag("<"),
                tag(">"),
            ))),
            keyword("IN"),
            keyword("MATCHES"),
        )),
        ComparisonOperator::from_str,
    )(input)
}

// 基本式
#[instrument(level = "debug", skip(input))]
fn parse_primary(input: &str) -> PResult<Expression> {
    context(
        "expected expression",
        ws(alt((
            map(parse_literal, Expression::Literal),
            map(
                delimited(
                    ws(char('[')),
                    separated_list0(ws(char(',')), parse_expr),
                    cut(ws(char(']'))),
                ),
                Expression::List,
            ),
            map(parse_exists, Expression::Exists),
            // 関数呼び出し
            map(
                pair(
                    terminated(identifier, peek(char('('))),
                    delimited(
                        char('('),
                        separated_list0(ws(char(',')), parse_expr),
                        cut(ws(char(')'))),
                    ),
                ),
                |(name, arguments)| Expression::FunctionCall {
                    name: name.to_string(),
                    arguments,
                },
            ),
            delimited(ws(char('(')), parse_expr, cut(ws(char(')')))),
            map(parse_path, Expression::Path),
        ))),
    )(input)
}

// EXISTS(v: Entity [WHERE expr])
#[instrument(level = "debug", skip(input))]
fn parse_exists(input: &str) -> PResult<ExistsPattern> {
    let (input, _) = keyword("EXISTS")(input)?;
    let (input, (_, variable, _, entity_type, filter, _)) = cut(tuple((
        ws(char('(')),
        ws(identifier),
        ws(char(':')),
        ws(identifier),
        opt(preceded(keyword("WHERE"), cut(parse_expr))),
        ws(char(')')),
    )))(input)?;

    Ok((
        input,
        ExistsPattern {
            variable: variable.to_string(),
            entity_type: entity_type.to_string(),
            filter: filter.map(Box::new),
        },
    ))
}

fn parse_path(input: &str) -> PResult<PathRef> {
    map(
        pair(identifier, many0(preceded(char('.'), raw_identifier))),
        |(head, tail)| {
            let mut segments = vec![head.to_string()];
            segments.extend(tail.into_iter().map(String::from));
            PathRef(segments)
        },
    )(input)
}

#[instrument(level = "debug", skip(input))]
fn parse_literal(input: &str) -> PResult<Literal> {
    alt((
        // `.`を含む数値のみ浮動小数点とする
        map(parse_f64_strict, Literal::Float),
        map(parse_i64, Literal::Integer),
        map(parse_string, Literal::String),
        value(
            Literal::Boolean(true),
            alt((keyword("true"), keyword("TRUE"))),
        ),
        value(
            Literal::Boolean(false),
            alt((keyword("false"), keyword("FALSE"))),
        ),
        value(Literal::Null, alt((keyword("null"), keyword("NULL")))),
    ))(input)
}

fn parse_string(input: &str) -> PResult<String> {
    map(
        delimited(char('"'), take_while(|c| c != '"'), cut(char('"'))),
        |s: &str| s.to_string(),
    )(input)
}

fn parse_f64_strict(input: &str) -> PResult<f64> {
    map_res(
        recognize(tuple((opt(char('-')), digit1, char('.'), digit1))),
        |s: &str| s.parse::<f64>(),
    )(input)
}

fn parse_i64(input: &str) -> PResult<i64> {
    map_res(recognize(pair(opt(char('-')), digit1)), |s: &str| {
        s.parse::<i64>()
    })(input)
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

fn raw_identifier(input: &str) -> PResult<&str> {
    recognize(pair(
        take_while1(|c: char| c.is_alphabetic() || c == '_'),
        take_while(is_ident_char),
    ))(input)
}

fn identifier(input: &str) -> PResult<&str> {
    verify(raw_identifier, |s: &str| !KEYWORDS.contains(&s))(input)
}

fn keyword<'a>(kw: &'static str) -> impl FnMut(&'a str) -> PResult<'a, &'a str> {
    ws(terminated(tag(kw), not(peek(satisfy(is_ident_char)))))
}

// 空白と行コメント (`//`, `#`)
fn sp(input: &str) -> PResult<()> {
    value(
        (),
        many0(alt((
            value((), multispace1),
            value((), pair(alt((tag("//"), tag("#"))), not_line_ending)),
        ))),
    )(input)
}

fn ws<'a, F, O>(inner: F) -> impl FnMut(&'a str) -> PResult<'a, O>
where
    F: FnMut(&'a str) -> PResult<'a, O>,
{
    delimited(sp, inner, sp)
}
