use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::event::{ChangeEvent, ChangeType};

/// Which change types a subscription wants.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventFilter {
    #[default]
    #[serde(rename = "*")]
    All,
    #[serde(rename = "INSERT")]
    Insert,
    #[serde(rename = "UPDATE")]
    Update,
    #[serde(rename = "DELETE")]
    Delete,
}

impl EventFilter {
    pub fn accepts(&self, change: ChangeType) -> bool {
        matches!(
            (self, change),
            (Self::All, _)
                | (Self::Insert, ChangeType::Insert)
                | (Self::Update, ChangeType::Update)
                | (Self::Delete, ChangeType::Delete)
        )
    }
}

impl FromStr for EventFilter {
    type Err = FilterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "*" | "ALL" => Ok(Self::All),
            "INSERT" => Ok(Self::Insert),
            "UPDATE" => Ok(Self::Update),
            "DELETE" => Ok(Self::Delete),
            _ => Err(FilterError::UnknownEvent(s.to_string())),
        }
    }
}

impl fmt::Display for EventFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::All => "*",
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum FilterError {
    #[error("unknown event type: {0}")]
    UnknownEvent(String),
    #[error("malformed row filter {0:?}: expected column=op.value")]
    Malformed(String),
    #[error("unsupported filter operator: {0}")]
    UnknownOperator(String),
}

/// What change-events one handler wants from a channel.
///
/// Used directly as a map key; two keys are the same subscription exactly when
/// all four fields are equal.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriptionKey {
    pub schema: String,
    pub table: String,
    pub event: EventFilter,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
}

impl SubscriptionKey {
    /// All events on `schema.table`.
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
            event: EventFilter::All,
            filter: None,
        }
    }

    pub fn event(mut self, event: EventFilter) -> Self {
        self.event = event;
        self
    }

    pub fn filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    /// Parse the row filter, if any.
    pub fn row_filter(&self) -> Result<Option<RowFilter>, FilterError> {
        self.filter.as_deref().map(RowFilter::parse).transpose()
    }

    /// Schema, table (`*` matches any) and event type; the row filter is checked separately.
    pub fn matches_target(&self, event: &ChangeEvent) -> bool {
        self.schema == event.schema
            && (self.table == "*" || self.table == event.table)
            && self.event.accepts(event.change)
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}:{}", self.schema, self.table, self.event)?;
        if let Some(filter) = &self.filter {
            write!(f, "[{}]", filter)?;
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
}

/// A `column=op.value` row predicate, e.g. `client_id=eq.42` or `status=in.(failed,completed)`.
#[derive(Clone, Debug, PartialEq)]
pub struct RowFilter {
    pub column: String,
    pub op: FilterOp,
    pub values: Vec<String>,
}

impl RowFilter {
    pub fn parse(raw: &str) -> Result<Self, FilterError> {
        let (column, rest) = raw
            .split_once('=')
            .ok_or_else(|| FilterError::Malformed(raw.to_string()))?;
        let (op, value) = rest
            .split_once('.')
            .ok_or_else(|| FilterError::Malformed(raw.to_string()))?;
        if column.is_empty() {
            return Err(FilterError::Malformed(raw.to_string()));
        }

        let op = match op {
            "eq" => FilterOp::Eq,
            "neq" => FilterOp::Neq,
            "gt" => FilterOp::Gt,
            "gte" => FilterOp::Gte,
            "lt" => FilterOp::Lt,
            "lte" => FilterOp::Lte,
            "in" => FilterOp::In,
            other => return Err(FilterError::UnknownOperator(other.to_string())),
        };

        let values = if op == FilterOp::In {
            let inner = value
                .strip_prefix('(')
                .and_then(|v| v.strip_suffix(')'))
                .ok_or_else(|| FilterError::Malformed(raw.to_string()))?;
            inner
                .split(',')
                .map(|v| v.trim().trim_matches('"').to_string())
                .collect()
        } else {
            vec![value.to_string()]
        };

        Ok(Self {
            column: column.to_string(),
            op,
            values,
        })
    }

    pub fn matches(&self, record: &serde_json::Value) -> bool {
        let Some(field) = record.get(&self.column) else {
            return false;
        };
        match self.op {
            FilterOp::Eq => loosely_equal(field, &self.values[0]),
            FilterOp::Neq => !loosely_equal(field, &self.values[0]),
            FilterOp::In => self.values.iter().any(|v| loosely_equal(field, v)),
            FilterOp::Gt | FilterOp::Gte | FilterOp::Lt | FilterOp::Lte => {
                let Some(ordering) = compare(field, &self.values[0]) else {
                    return false;
                };
                match self.op {
                    FilterOp::Gt => ordering.is_gt(),
                    FilterOp::Gte => ordering.is_ge(),
                    FilterOp::Lt => ordering.is_lt(),
                    _ => ordering.is_le(),
                }
            }
        }
    }
}

fn as_text(field: &serde_json::Value) -> String {
    match field {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn loosely_equal(field: &serde_json::Value, expected: &str) -> bool {
    if let (Some(a), Ok(b)) = (field.as_f64(), expected.parse::<f64>()) {
        return a == b;
    }
    as_text(field) == expected
}

fn compare(field: &serde_json::Value, expected: &str) -> Option<std::cmp::Ordering> {
    if let (Some(a), Ok(b)) = (field.as_f64(), expected.parse::<f64>()) {
        return a.partial_cmp(&b);
    }
    field.as_str().map(|s| s.cmp(expected))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn keys_compare_structurally() {
        let a = SubscriptionKey::new("public", "mentions").event(EventFilter::Insert);
        let b = SubscriptionKey::new("public", "mentions").event(EventFilter::Insert);
        assert_eq!(a, b);

        // would collide if keys were built by naive string concatenation
        let c = SubscriptionKey::new("public", "a:b").filter("x=eq.1");
        let d = SubscriptionKey::new("public:a", "b").filter("x=eq.1");
        assert_ne!(c, d);
    }

    #[test]
    fn event_filter_parsing() {
        assert_eq!("*".parse::<EventFilter>().unwrap(), EventFilter::All);
        assert_eq!("insert".parse::<EventFilter>().unwrap(), EventFilter::Insert);
        assert!("UPSERT".parse::<EventFilter>().is_err());
        assert!(EventFilter::All.accepts(ChangeType::Delete));
        assert!(!EventFilter::Insert.accepts(ChangeType::Update));
    }

    #[test]
    fn parse_row_filters() {
        let f = RowFilter::parse("client_id=eq.42").unwrap();
        assert_eq!(f.column, "client_id");
        assert_eq!(f.op, FilterOp::Eq);
        assert_eq!(f.values, vec!["42"]);

        let f = RowFilter::parse("status=in.(failed, completed)").unwrap();
        assert_eq!(f.values, vec!["failed", "completed"]);

        assert!(matches!(
            RowFilter::parse("nonsense"),
            Err(FilterError::Malformed(_))
        ));
        assert!(matches!(
            RowFilter::parse("a=like.x"),
            Err(FilterError::UnknownOperator(_))
        ));
        assert!(matches!(
            RowFilter::parse("a=in.x,y"),
            Err(FilterError::Malformed(_))
        ));
    }

    #[test]
    fn row_filter_matching() {
        let row = json!({"client_id": 42, "status": "failed", "score": 0.7});
        assert!(RowFilter::parse("client_id=eq.42").unwrap().matches(&row));
        assert!(!RowFilter::parse("client_id=neq.42").unwrap().matches(&row));
        assert!(RowFilter::parse("status=in.(completed,failed)").unwrap().matches(&row));
        assert!(RowFilter::parse("score=gt.0.5").unwrap().matches(&row));
        assert!(!RowFilter::parse("score=lte.0.5").unwrap().matches(&row));
        assert!(!RowFilter::parse("missing=eq.1").unwrap().matches(&row));
    }

    #[test]
    fn target_matching() {
        let event = ChangeEvent::insert("public", "mentions", json!({"id": 1}));
        assert!(SubscriptionKey::new("public", "mentions").matches_target(&event));
        assert!(SubscriptionKey::new("public", "*").matches_target(&event));
        assert!(
            !SubscriptionKey::new("public", "mentions")
                .event(EventFilter::Delete)
                .matches_target(&event)
        );
        assert!(!SubscriptionKey::new("audit", "mentions").matches_target(&event));
    }

    #[test]
    fn display() {
        let key = SubscriptionKey::new("public", "clips")
            .event(EventFilter::Update)
            .filter("id=eq.3");
        assert_eq!(key.to_string(), "public.clips:UPDATE[id=eq.3]");
    }
}
