//! Message selectors
//!
//! Queues, consumers, diverts and bridges hold an optional selector that is
//! evaluated against message properties. Only conjunctions of property
//! equalities are understood: `color = 'green' AND size = 3`.

use std::fmt;

use mq_common::Message;

use crate::error::ControlError;
use crate::Result;

#[derive(Debug, Clone, PartialEq)]
enum Literal {
    Text(String),
    Number(i64),
}

#[derive(Debug, Clone, PartialEq)]
struct Clause {
    property: String,
    value: Literal,
}

/// A compiled selector.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    expression: String,
    clauses: Vec<Clause>,
}

impl Filter {
    /// Compile an optional expression. Absent or blank expressions yield `None`.
    pub fn parse(expression: Option<&str>) -> Result<Option<Filter>> {
        let expression = match expression.map(str::trim) {
            Some(e) if !e.is_empty() => e,
            _ => return Ok(None),
        };

        let clauses = split_conjunction(expression)
            .into_iter()
            .map(|clause| parse_clause(clause, expression))
            .collect::<Result<Vec<_>>>()?;

        Ok(Some(Filter {
            expression: expression.to_string(),
            clauses,
        }))
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    pub fn matches(&self, message: &Message) -> bool {
        self.clauses.iter().all(|clause| {
            let Some(actual) = message.property(&clause.property) else {
                return false;
            };
            match &clause.value {
                Literal::Text(expected) => actual == expected,
                Literal::Number(expected) => actual.trim().parse::<i64>().ok() == Some(*expected),
            }
        })
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expression)
    }
}

/// Evaluate an optional filter; no filter accepts everything.
pub fn accepts(filter: Option<&Filter>, message: &Message) -> bool {
    filter.map_or(true, |f| f.matches(message))
}

fn split_conjunction(expression: &str) -> Vec<&str> {
    const AND: &[u8] = b" and ";

    let bytes = expression.as_bytes();
    let mut parts = Vec::new();
    let mut in_quotes = false;
    let mut start = 0;
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'\'' {
            in_quotes = !in_quotes;
        } else if !in_quotes
            && i + AND.len() <= bytes.len()
            && bytes[i..i + AND.len()].eq_ignore_ascii_case(AND)
        {
            parts.push(expression[start..i].trim());
            start = i + AND.len();
            i = start;
            continue;
        }
        i += 1;
    }
    parts.push(expression[start..].trim());
    parts
}

fn parse_clause(clause: &str, expression: &str) -> Result<Clause> {
    let unsupported = || ControlError::invalid(format!("unsupported selector: {}", expression));

    let (property, value) = clause.split_once('=').ok_or_else(unsupported)?;
    let property = property.trim();
    let value = value.trim();

    if property.is_empty() || !property.chars().all(|c| c.is_alphanumeric() || c == '_' || c == '.') {
        return Err(unsupported());
    }

    let value = if value.len() >= 2 && value.starts_with('\'') && value.ends_with('\'') {
        Literal::Text(value[1..value.len() - 1].replace("''", "'"))
    } else if let Ok(n) = value.parse::<i64>() {
        Literal::Number(n)
    } else if value.eq_ignore_ascii_case("true") || value.eq_ignore_ascii_case("false") {
        Literal::Text(value.to_ascii_lowercase())
    } else {
        return Err(unsupported());
    };

    Ok(Clause {
        property: property.to_string(),
        value,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blank_expression_is_no_filter() {
        assert!(Filter::parse(None).unwrap().is_none());
        assert!(Filter::parse(Some("")).unwrap().is_none());
        assert!(Filter::parse(Some("   ")).unwrap().is_none());
    }

    #[test]
    fn test_equality_conjunction() {
        let filter = Filter::parse(Some("color = 'green' AND size = 3")).unwrap().unwrap();
        let matching = Message::new("x").with_property("color", "green").with_property("size", "3");
        let wrong_color = Message::new("x").with_property("color", "red").with_property("size", "3");
        let missing = Message::new("x").with_property("color", "green");

        assert!(filter.matches(&matching));
        assert!(!filter.matches(&wrong_color));
        assert!(!filter.matches(&missing));
        assert_eq!(filter.to_string(), "color = 'green' AND size = 3");
    }

    #[test]
    fn test_quoted_and_keyword() {
        let filter = Filter::parse(Some("label = 'salt AND pepper'")).unwrap().unwrap();
        let msg = Message::new("x").with_property("label", "salt AND pepper");
        assert!(filter.matches(&msg));
    }

    #[test]
    fn test_unsupported_expression() {
        assert!(Filter::parse(Some("size > 3")).is_err());
        assert!(Filter::parse(Some("= 'x'")).is_err());
    }
}
