//! Compiles strategy match rules into a typed predicate over events.
//!
//! Rules are an OR of AND-groups of `{key, operator, value}` conditions.
//! Conditions that cannot be applied (missing key, unknown operator, bad
//! regex, non-list `in` value, ...) are dropped with a warning instead of
//! failing the strategy. A group whose conditions were all dropped is
//! ignored.
//!
//! **Permissive fallback:** when no group keeps a single valid condition the
//! matcher accepts every event. An empty rule tree therefore matches
//! everything, and so does a tree made only of broken conditions.

use alarmd_common::types::{Event, RawCondition};
use regex::{Regex, RegexBuilder};
use serde_json::Value;
use std::cmp::Ordering;
use std::str::FromStr;

/// Maps a configured key (English or localized) to the event field name.
/// Unknown keys pass through and are looked up in labels, then tags.
pub fn resolve_field(key: &str) -> &str {
    match key {
        "标题" | "title" => "title",
        "告警源" | "source" => "source",
        "级别" | "level" => "level",
        "类型对象" | "resource_type" => "resource_type",
        "对象实例" | "resource_name" => "resource_name",
        "内容" | "description" => "description",
        "告警类型" | "event_type" => "event_type",
        "服务" | "service" => "service",
        "位置" | "location" => "location",
        "事件ID" | "event_id" => "event_id",
        "资源ID" | "resource_id" => "resource_id",
        "指标" | "item" => "item",
        other => other,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Eq,
    Ne,
    Contains,
    NotContains,
    Regex,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    NotIn,
}

impl FromStr for Operator {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "eq" | "等于" => Ok(Self::Eq),
            "ne" | "不等于" => Ok(Self::Ne),
            "contains" | "包含" => Ok(Self::Contains),
            "not_contains" | "不包含" => Ok(Self::NotContains),
            "regex" | "re" | "正则" => Ok(Self::Regex),
            "gt" | "大于" => Ok(Self::Gt),
            "gte" | "大于等于" => Ok(Self::Gte),
            "lt" | "小于" => Ok(Self::Lt),
            "lte" | "小于等于" => Ok(Self::Lte),
            "in" | "字中串" => Ok(Self::In),
            "not_in" => Ok(Self::NotIn),
            _ => Err(format!("unknown match operator: {s}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Gt,
    Gte,
    Lt,
    Lte,
}

impl CompareOp {
    fn check(&self, ord: Ordering) -> bool {
        match self {
            Self::Gt => ord == Ordering::Greater,
            Self::Gte => ord != Ordering::Less,
            Self::Lt => ord == Ordering::Less,
            Self::Lte => ord != Ordering::Greater,
        }
    }
}

/// One validated condition.
#[derive(Debug, Clone)]
pub enum Condition {
    Eq { field: String, value: String },
    /// With `value: None`, matches events where the field is present.
    Ne { field: String, value: Option<String> },
    /// `needle` is stored lowercased.
    Contains { field: String, needle: String },
    NotContains { field: String, needle: String },
    Regex { field: String, pattern: Regex },
    Compare { field: String, op: CompareOp, value: String },
    In { field: String, values: Vec<String> },
    NotIn { field: String, values: Vec<String> },
    /// A dropped condition. Never part of a compiled group.
    Skip,
}

impl Condition {
    /// Validates one raw condition. Invalid input yields [`Condition::Skip`].
    pub fn parse(raw: &RawCondition) -> Self {
        let (Some(key), Some(op_str)) = (raw.key.as_deref(), raw.operator.as_deref()) else {
            tracing::warn!(?raw, "Dropping match condition without key or operator");
            return Self::Skip;
        };
        if key.is_empty() {
            tracing::warn!(?raw, "Dropping match condition without key or operator");
            return Self::Skip;
        }

        let op = match op_str.parse::<Operator>() {
            Ok(op) => op,
            Err(e) => {
                tracing::warn!(?raw, error = %e, "Dropping match condition");
                return Self::Skip;
            }
        };

        if raw.value.is_null() && op != Operator::Ne {
            tracing::warn!(?raw, "Dropping match condition with null value");
            return Self::Skip;
        }

        let field = resolve_field(key).to_string();
        match op {
            Operator::Eq => match value_text(&raw.value) {
                Some(value) => Self::Eq { field, value },
                None => Self::Skip,
            },
            Operator::Ne => Self::Ne {
                field,
                value: value_text(&raw.value),
            },
            Operator::Contains => match value_text(&raw.value) {
                Some(v) => Self::Contains {
                    field,
                    needle: v.to_lowercase(),
                },
                None => Self::Skip,
            },
            Operator::NotContains => match value_text(&raw.value) {
                Some(v) if !v.is_empty() => Self::NotContains {
                    field,
                    needle: v.to_lowercase(),
                },
                _ => {
                    tracing::warn!(?raw, "Dropping not_contains condition with empty value");
                    Self::Skip
                }
            },
            Operator::Regex => {
                let Some(pattern) = value_text(&raw.value).filter(|p| !p.is_empty()) else {
                    tracing::warn!(?raw, "Dropping regex condition with empty pattern");
                    return Self::Skip;
                };
                match RegexBuilder::new(&pattern).case_insensitive(true).build() {
                    Ok(pattern) => Self::Regex { field, pattern },
                    Err(e) => {
                        tracing::warn!(pattern = %pattern, error = %e, "Dropping invalid regex condition");
                        Self::Skip
                    }
                }
            }
            Operator::Gt | Operator::Gte | Operator::Lt | Operator::Lte => {
                let cmp = match op {
                    Operator::Gt => CompareOp::Gt,
                    Operator::Gte => CompareOp::Gte,
                    Operator::Lt => CompareOp::Lt,
                    _ => CompareOp::Lte,
                };
                match value_text(&raw.value) {
                    Some(value) => Self::Compare {
                        field,
                        op: cmp,
                        value,
                    },
                    None => Self::Skip,
                }
            }
            Operator::In | Operator::NotIn => {
                let Value::Array(items) = &raw.value else {
                    tracing::warn!(?raw, "Dropping membership condition whose value is not a list");
                    return Self::Skip;
                };
                let values: Vec<String> = items.iter().filter_map(value_text).collect();
                if op == Operator::In {
                    Self::In { field, values }
                } else {
                    Self::NotIn { field, values }
                }
            }
        }
    }

    pub fn is_skip(&self) -> bool {
        matches!(self, Self::Skip)
    }

    /// Evaluates the condition. Negated conditions also match events where
    /// the field is absent.
    pub fn matches(&self, event: &Event) -> bool {
        match self {
            Self::Eq { field, value } => event.field(field).is_some_and(|v| v == value.as_str()),
            Self::Ne { field, value } => match (event.field(field), value) {
                (Some(_), None) => true,
                (None, None) => false,
                (Some(v), Some(expected)) => v != expected.as_str(),
                (None, Some(_)) => true,
            },
            Self::Contains { field, needle } => event
                .field(field)
                .is_some_and(|v| v.to_lowercase().contains(needle.as_str())),
            Self::NotContains { field, needle } => !event
                .field(field)
                .is_some_and(|v| v.to_lowercase().contains(needle.as_str())),
            Self::Regex { field, pattern } => {
                event.field(field).is_some_and(|v| pattern.is_match(&v))
            }
            Self::Compare { field, op, value } => event
                .field(field)
                .is_some_and(|v| op.check(compare_values(&v, value))),
            Self::In { field, values } => event
                .field(field)
                .is_some_and(|v| values.iter().any(|x| x.as_str() == &*v)),
            Self::NotIn { field, values } => !event
                .field(field)
                .is_some_and(|v| values.iter().any(|x| x.as_str() == &*v)),
            Self::Skip => true,
        }
    }
}

/// Numeric when both sides parse as numbers, lexical otherwise.
fn compare_values(left: &str, right: &str) -> Ordering {
    match (left.trim().parse::<f64>(), right.trim().parse::<f64>()) {
        (Ok(l), Ok(r)) => l.partial_cmp(&r).unwrap_or(Ordering::Equal),
        _ => left.cmp(right),
    }
}

fn value_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(number_text(n)),
        other => Some(other.to_string()),
    }
}

/// Integral floats are written without a fraction, so a rule value of `2.0`
/// reads the same as the event's integer level `2`.
fn number_text(n: &serde_json::Number) -> String {
    match n.as_f64() {
        Some(f) if n.is_f64() && f.fract() == 0.0 && f.abs() < 9.0e15 => {
            format!("{}", f as i64)
        }
        _ => n.to_string(),
    }
}

/// A compiled rule tree.
///
/// # Examples
///
/// ```
/// use alarmd_common::types::RawCondition;
/// use alarmd_engine::matcher::Matcher;
/// use serde_json::json;
///
/// let matcher = Matcher::compile(&[vec![
///     RawCondition::new("level", "eq", json!(2)),
///     RawCondition::new("description", "regex", json!("(")),
/// ]]);
/// // the broken regex is dropped, the level condition stays
/// assert_eq!(matcher.condition_count(), 1);
/// assert!(!matcher.is_permissive());
/// ```
#[derive(Debug, Clone, Default)]
pub struct Matcher {
    groups: Vec<Vec<Condition>>,
}

impl Matcher {
    pub fn compile(rules: &[Vec<RawCondition>]) -> Self {
        let groups: Vec<Vec<Condition>> = rules
            .iter()
            .map(|group| {
                group
                    .iter()
                    .map(Condition::parse)
                    .filter(|c| !c.is_skip())
                    .collect::<Vec<_>>()
            })
            .filter(|group| !group.is_empty())
            .collect();

        if groups.is_empty() && !rules.is_empty() {
            tracing::warn!(
                groups = rules.len(),
                "No valid match condition in any group, matching all events"
            );
        }
        Self { groups }
    }

    /// True when the matcher accepts every event.
    pub fn is_permissive(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn condition_count(&self) -> usize {
        self.groups.iter().map(Vec::len).sum()
    }

    pub fn matches(&self, event: &Event) -> bool {
        self.is_permissive()
            || self
                .groups
                .iter()
                .any(|group| group.iter().all(|c| c.matches(event)))
    }

    /// Events accepted by the rule tree, in input order.
    pub fn filter<'a>(&self, events: &'a [Event]) -> Vec<&'a Event> {
        events.iter().filter(|e| self.matches(e)).collect()
    }
}

/// Compiles `rules` and filters `events` in one step.
pub fn match_events<'a>(events: &'a [Event], rules: &[Vec<RawCondition>]) -> Vec<&'a Event> {
    Matcher::compile(rules).filter(events)
}
