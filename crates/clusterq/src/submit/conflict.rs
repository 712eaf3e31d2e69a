//! Boolean conflict expressions over file presence flags.
//!
//! Grammar: role names, `not`, `and`, `or` and parentheses, with precedence
//! `not > and > or`. Binary operators associate to the left.
use chumsky::error::Simple;
use chumsky::prelude::{filter, just, recursive};
use chumsky::text::{TextParser, keyword};
use chumsky::Parser;

use crate::common::error::ClusterqError;
use crate::common::parser2::{CharParser, all_consuming};
use crate::common::placeholders::{TEMPLATE_DELIMITER, interpolate_safe};
use crate::config::catalog::FileCatalog;
use crate::{Map, Set};

const KEYWORDS: [&str; 3] = ["not", "and", "or"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BoolExpr {
    Var(String),
    Not(Box<BoolExpr>),
    And(Box<BoolExpr>, Box<BoolExpr>),
    Or(Box<BoolExpr>, Box<BoolExpr>),
}

impl BoolExpr {
    /// Evaluates the expression, failing with the name of the first variable missing
    /// from `presence`.
    pub fn evaluate(&self, presence: &Map<String, bool>) -> Result<bool, String> {
        Ok(match self {
            BoolExpr::Var(name) => *presence.get(name).ok_or_else(|| name.clone())?,
            BoolExpr::Not(operand) => !operand.evaluate(presence)?,
            BoolExpr::And(lhs, rhs) => lhs.evaluate(presence)? && rhs.evaluate(presence)?,
            BoolExpr::Or(lhs, rhs) => lhs.evaluate(presence)? || rhs.evaluate(presence)?,
        })
    }

    pub fn variables(&self) -> Set<&str> {
        let mut variables = Set::new();
        self.collect_variables(&mut variables);
        variables
    }

    fn collect_variables<'a>(&'a self, variables: &mut Set<&'a str>) {
        match self {
            BoolExpr::Var(name) => {
                variables.insert(name.as_str());
            }
            BoolExpr::Not(operand) => operand.collect_variables(variables),
            BoolExpr::And(lhs, rhs) | BoolExpr::Or(lhs, rhs) => {
                lhs.collect_variables(variables);
                rhs.collect_variables(variables);
            }
        }
    }
}

fn parse_variable() -> impl CharParser<String> + Clone {
    filter(|c: &char| c.is_alphanumeric() || matches!(c, '_' | '-' | '.'))
        .repeated()
        .at_least(1)
        .collect::<String>()
        .try_map(|name, span| {
            if KEYWORDS.contains(&name.as_str()) {
                Err(Simple::custom(span, format!("`{name}` is an operator")))
            } else {
                Ok(name)
            }
        })
        .padded()
        .labelled("role")
}

fn parse_bool_expr() -> impl CharParser<BoolExpr> {
    recursive(|expr| {
        let atom = parse_variable()
            .map(BoolExpr::Var)
            .or(expr.delimited_by(just('(').padded(), just(')').padded()));

        let negation = keyword("not")
            .padded()
            .repeated()
            .then(atom)
            .foldr(|_, operand| BoolExpr::Not(Box::new(operand)));

        let conjunction = negation
            .clone()
            .then(keyword("and").padded().ignore_then(negation).repeated())
            .foldl(|lhs, rhs| BoolExpr::And(Box::new(lhs), Box::new(rhs)));

        conjunction
            .clone()
            .then(keyword("or").padded().ignore_then(conjunction).repeated())
            .foldl(|lhs, rhs| BoolExpr::Or(Box::new(lhs), Box::new(rhs)))
    })
}

pub fn parse_conflict_expression(input: &str) -> anyhow::Result<BoolExpr> {
    all_consuming(parse_bool_expr()).parse_text(input)
}

/// A declared conflict between input files and the message reported when it holds.
#[derive(Debug, Clone)]
pub struct ConflictRule {
    expression: String,
    expr: BoolExpr,
    message: String,
}

impl ConflictRule {
    /// Parses `expression` and checks that it only refers to roles of the catalog.
    pub fn compile(expression: &str, message: &str, catalog: &FileCatalog) -> crate::Result<Self> {
        let expr = parse_conflict_expression(expression).map_err(|error| {
            ClusterqError::Config(format!(
                "Invalid conflict expression `{expression}`:\n{error}"
            ))
        })?;
        if let Some(unknown) = expr.variables().into_iter().find(|v| !catalog.contains(v)) {
            return Err(ClusterqError::Config(format!(
                "Conflict expression `{expression}` refers to unknown file role `{unknown}`"
            )));
        }
        Ok(Self {
            expression: expression.to_string(),
            expr,
            message: message.to_string(),
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    pub fn is_triggered(&self, presence: &Map<String, bool>) -> crate::Result<bool> {
        self.expr.evaluate(presence).map_err(|variable| {
            ClusterqError::Config(format!(
                "Conflict expression `{}` refers to unknown file role `{variable}`",
                self.expression
            ))
        })
    }

    /// Message of the rule with `%file` replaced by the input name and `%job` by the
    /// job name.
    pub fn format_message(&self, inputname: &str, jobname: &str) -> String {
        let mut values = Map::new();
        values.insert("file".to_string(), inputname.to_string());
        values.insert("job".to_string(), jobname.to_string());
        interpolate_safe(&self.message, TEMPLATE_DELIMITER, &[], &values).text
    }
}

/// Evaluates every rule independently; the first one that holds rejects the job.
pub fn check_conflicts(
    rules: &[ConflictRule],
    presence: &Map<String, bool>,
    inputname: &str,
    jobname: &str,
) -> crate::Result<()> {
    for rule in rules {
        if rule.is_triggered(presence)? {
            log::debug!("Conflict `{}` holds for {inputname}", rule.expression());
            return Err(ClusterqError::Conflict(
                rule.format_message(inputname, jobname),
            ));
        }
    }
    Ok(())
}
