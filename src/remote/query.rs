//! Query, ordering and cursor types shared by every remote store.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::cmp::Ordering;
use std::fmt;

use super::Document;

/// A comparable field value. Variants order before values, so mixed-type
/// fields still sort deterministically.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FieldValue {
  Null,
  Bool(bool),
  Int(i64),
  Timestamp(DateTime<Utc>),
  Text(String),
}

impl FieldValue {
  /// Read a JSON field as a comparable value. RFC 3339 strings become
  /// timestamps so sub-second precision compares correctly.
  pub fn from_json(value: &Value) -> FieldValue {
    match value {
      Value::Bool(b) => FieldValue::Bool(*b),
      Value::Number(n) => match n.as_i64() {
        Some(i) => FieldValue::Int(i),
        None => FieldValue::Text(n.to_string()),
      },
      Value::String(s) => match DateTime::parse_from_rfc3339(s) {
        Ok(dt) => FieldValue::Timestamp(dt.with_timezone(&Utc)),
        Err(_) => FieldValue::Text(s.clone()),
      },
      _ => FieldValue::Null,
    }
  }

  /// Whether a JSON value equals this field value.
  pub fn matches(&self, value: &Value) -> bool {
    FieldValue::from_json(value) == *self
  }
}

impl fmt::Display for FieldValue {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      FieldValue::Null => f.write_str("null"),
      FieldValue::Bool(b) => write!(f, "{}", b),
      FieldValue::Int(i) => write!(f, "{}", i),
      FieldValue::Timestamp(t) => f.write_str(&t.to_rfc3339()),
      FieldValue::Text(s) => f.write_str(s),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
  /// Field equals value
  Eq,
  /// Array field contains value
  Contains,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filter {
  pub field: String,
  pub op: FilterOp,
  pub value: FieldValue,
}

impl Filter {
  pub fn matches(&self, document: &Value) -> bool {
    let Some(field) = document.get(&self.field) else {
      return false;
    };
    match self.op {
      FilterOp::Eq => self.value.matches(field),
      FilterOp::Contains => field
        .as_array()
        .is_some_and(|items| items.iter().any(|item| self.value.matches(item))),
    }
  }

  /// Wire form used in HTTP query strings: `field:op:value`
  pub fn encode(&self) -> String {
    let op = match self.op {
      FilterOp::Eq => "eq",
      FilterOp::Contains => "contains",
    };
    format!("{}:{}:{}", self.field, op, self.value)
  }
}

/// A logical query against one collection. All filters must match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteQuery {
  pub collection: String,
  pub filters: Vec<Filter>,
}

impl RemoteQuery {
  pub fn new(collection: impl Into<String>) -> Self {
    Self {
      collection: collection.into(),
      filters: Vec::new(),
    }
  }

  pub fn where_eq(mut self, field: impl Into<String>, value: FieldValue) -> Self {
    self.filters.push(Filter {
      field: field.into(),
      op: FilterOp::Eq,
      value,
    });
    self
  }

  pub fn where_contains(mut self, field: impl Into<String>, value: FieldValue) -> Self {
    self.filters.push(Filter {
      field: field.into(),
      op: FilterOp::Contains,
      value,
    });
    self
  }

  pub fn matches(&self, document: &Value) -> bool {
    self.filters.iter().all(|f| f.matches(document))
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
  Ascending,
  Descending,
}

impl Direction {
  pub fn as_str(&self) -> &'static str {
    match self {
      Direction::Ascending => "asc",
      Direction::Descending => "desc",
    }
  }
}

/// A single sort field and direction, fixed for the life of a paginator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBy {
  pub field: String,
  pub direction: Direction,
}

impl OrderBy {
  pub fn ascending(field: impl Into<String>) -> Self {
    Self {
      field: field.into(),
      direction: Direction::Ascending,
    }
  }

  pub fn descending(field: impl Into<String>) -> Self {
    Self {
      field: field.into(),
      direction: Direction::Descending,
    }
  }

  /// Compare two keys in this ordering.
  pub fn compare(&self, a: &CursorKey, b: &CursorKey) -> Ordering {
    match self.direction {
      Direction::Ascending => a.cmp(b),
      Direction::Descending => b.cmp(a),
    }
  }

  /// Whether `key` sorts strictly after `cursor` in this ordering.
  pub fn is_after(&self, key: &CursorKey, cursor: &CursorKey) -> bool {
    self.compare(key, cursor) == Ordering::Greater
  }
}

/// Position of one document in an ordering: the sort value, with the
/// document id breaking ties so equal sort values never skip or repeat.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CursorKey {
  pub value: FieldValue,
  pub id: String,
}

impl CursorKey {
  /// Key of a raw document for the given sort field.
  pub fn from_json(document: &Value, field: &str) -> CursorKey {
    CursorKey {
      value: document
        .get(field)
        .map(FieldValue::from_json)
        .unwrap_or(FieldValue::Null),
      id: document
        .get("id")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string(),
    }
  }

  /// Key of a typed document for the given sort field.
  pub fn for_document<T: Document>(document: &T, field: &str) -> CursorKey {
    let value = serde_json::to_value(document)
      .ok()
      .and_then(|v| v.get(field).map(FieldValue::from_json))
      .unwrap_or(FieldValue::Null);
    CursorKey {
      value,
      id: document.id().to_string(),
    }
  }
}

/// One page request: fixed ordering, size, and the exclusive start position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
  pub order: OrderBy,
  pub limit: usize,
  pub start_after: Option<CursorKey>,
}

/// One page of results in the requested order.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
  pub items: Vec<T>,
}
