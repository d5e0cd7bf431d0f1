//! Message selectors for the in-memory broker.
//!
//! A selector is a conjunction of `identifier operator literal` clauses:
//!
//! ```text
//! region = 'emea' AND JMSPriority >= 7 AND urgent = TRUE
//! ```
//!
//! Identifiers name message properties or one of the `JMS*` headers. A clause
//! whose identifier is absent from the message never matches.

use crate::error::MessagingError;
use crate::message::{DeliveryMode, Message};
use regex::Regex;
use std::cmp::Ordering;

#[cfg(test)]
#[path = "selector_tests.rs"]
mod tests;

const CLAUSE_PATTERN: &str = r"^\s*([A-Za-z_$][A-Za-z0-9_$.]*)\s*(<>|>=|<=|=|>|<)\s*('(?:[^']|'')*'|[-+]?\d+(?:\.\d+)?|(?i:true|false))\s*";
const CONJUNCTION_PATTERN: &str = r"^(?i:and)\s+";

#[derive(Debug, Clone, PartialEq)]
enum Field {
    Priority,
    Type,
    CorrelationId,
    DeliveryMode,
    MessageId,
    Property(String),
}

impl Field {
    fn parse(identifier: &str) -> Self {
        match identifier {
            "JMSPriority" => Self::Priority,
            "JMSType" => Self::Type,
            "JMSCorrelationID" => Self::CorrelationId,
            "JMSDeliveryMode" => Self::DeliveryMode,
            "JMSMessageID" => Self::MessageId,
            other => Self::Property(other.to_string()),
        }
    }

    fn resolve<'a>(&self, message: &'a Message) -> Option<FieldValue<'a>> {
        match self {
            Self::Priority => Some(FieldValue::Number(f64::from(message.priority.value()))),
            Self::Type => message.message_type.as_deref().map(FieldValue::Text),
            Self::CorrelationId => message.correlation_id.as_deref().map(FieldValue::Text),
            Self::DeliveryMode => Some(FieldValue::Text(match message.delivery_mode {
                DeliveryMode::Persistent => "PERSISTENT",
                DeliveryMode::NonPersistent => "NON_PERSISTENT",
            })),
            Self::MessageId => message.message_id.as_ref().map(|id| FieldValue::Text(id.as_str())),
            Self::Property(name) => message.properties.get(name).map(|v| FieldValue::Text(v.as_str())),
        }
    }
}

enum FieldValue<'a> {
    Text(&'a str),
    Number(f64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operator {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

impl Operator {
    fn parse(token: &str) -> Option<Self> {
        match token {
            "=" => Some(Self::Eq),
            "<>" => Some(Self::Ne),
            ">" => Some(Self::Gt),
            ">=" => Some(Self::Ge),
            "<" => Some(Self::Lt),
            "<=" => Some(Self::Le),
            _ => None,
        }
    }

    fn accepts(&self, ordering: Ordering) -> bool {
        match self {
            Self::Eq => ordering == Ordering::Equal,
            Self::Ne => ordering != Ordering::Equal,
            Self::Gt => ordering == Ordering::Greater,
            Self::Ge => ordering != Ordering::Less,
            Self::Lt => ordering == Ordering::Less,
            Self::Le => ordering != Ordering::Greater,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Literal {
    Text(String),
    Number(f64),
    Bool(bool),
}

impl Literal {
    fn parse(token: &str) -> Option<Self> {
        if let Some(quoted) = token.strip_prefix('\'').and_then(|t| t.strip_suffix('\'')) {
            return Some(Self::Text(quoted.replace("''", "'")));
        }
        if token.eq_ignore_ascii_case("true") {
            return Some(Self::Bool(true));
        }
        if token.eq_ignore_ascii_case("false") {
            return Some(Self::Bool(false));
        }
        token.parse().ok().map(Self::Number)
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Clause {
    field: Field,
    operator: Operator,
    literal: Literal,
}

impl Clause {
    fn matches(&self, message: &Message) -> bool {
        let Some(value) = self.field.resolve(message) else {
            return false;
        };

        let ordering = match (&value, &self.literal) {
            (FieldValue::Number(n), Literal::Number(l)) => n.partial_cmp(l),
            (FieldValue::Text(t), Literal::Number(l)) => {
                t.trim().parse::<f64>().ok().and_then(|n| n.partial_cmp(l))
            }
            (FieldValue::Text(t), Literal::Text(l)) => Some((*t).cmp(l.as_str())),
            (FieldValue::Text(t), Literal::Bool(l)) => match t.to_ascii_lowercase().as_str() {
                "true" => Some(true.cmp(l)),
                "false" => Some(false.cmp(l)),
                _ => None,
            },
            (FieldValue::Number(_), Literal::Text(_) | Literal::Bool(_)) => None,
        };

        ordering.is_some_and(|o| self.operator.accepts(o))
    }
}

/// A parsed message selector
#[derive(Debug, Clone, PartialEq)]
pub struct Selector {
    source: String,
    clauses: Vec<Clause>,
}

impl Selector {
    pub fn parse(source: &str) -> Result<Self, MessagingError> {
        let invalid = |message: String| MessagingError::InvalidSelector {
            selector: source.to_string(),
            message,
        };

        let clause_re = Regex::new(CLAUSE_PATTERN).map_err(|e| invalid(e.to_string()))?;
        let and_re = Regex::new(CONJUNCTION_PATTERN).map_err(|e| invalid(e.to_string()))?;

        let mut clauses = Vec::new();
        let mut rest = source;
        loop {
            let captures = clause_re
                .captures(rest)
                .ok_or_else(|| invalid(format!("expected 'identifier operator literal' at '{}'", rest.trim())))?;

            let operator = Operator::parse(&captures[2])
                .ok_or_else(|| invalid(format!("unknown operator '{}'", &captures[2])))?;
            let literal = Literal::parse(&captures[3])
                .ok_or_else(|| invalid(format!("malformed literal '{}'", &captures[3])))?;
            if matches!(literal, Literal::Bool(_)) && !matches!(operator, Operator::Eq | Operator::Ne) {
                return Err(invalid("booleans only support '=' and '<>'".to_string()));
            }

            clauses.push(Clause {
                field: Field::parse(&captures[1]),
                operator,
                literal,
            });

            rest = &rest[captures[0].len()..];
            if rest.is_empty() {
                break;
            }
            let conjunction = and_re
                .find(rest)
                .ok_or_else(|| invalid(format!("expected AND at '{}'", rest.trim())))?;
            rest = &rest[conjunction.end()..];
        }

        Ok(Self {
            source: source.to_string(),
            clauses,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn matches(&self, message: &Message) -> bool {
        self.clauses.iter().all(|clause| clause.matches(message))
    }
}
