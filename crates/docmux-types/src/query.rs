//! Query descriptors
//!
//! A `QueryDescriptor` names a collection plus optional filters, sort
//! orders, a limit and pagination cursors. Descriptors are compared by
//! their canonical key, never by identity.

use serde::{Deserialize, Serialize};

use crate::value::FieldValue;

/// Pseudo-field addressing the document id in filters and sort orders.
pub const DOCUMENT_ID_FIELD: &str = "__name__";

/// Comparison operator of a field filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FilterOp {
	Eq,
	Ne,
	Lt,
	Le,
	Gt,
	Ge,
	In,
	NotIn,
	ArrayContains,
	ArrayContainsAny,
}

impl FilterOp {
	pub fn as_str(self) -> &'static str {
		match self {
			FilterOp::Eq => "==",
			FilterOp::Ne => "!=",
			FilterOp::Lt => "<",
			FilterOp::Le => "<=",
			FilterOp::Gt => ">",
			FilterOp::Ge => ">=",
			FilterOp::In => " in ",
			FilterOp::NotIn => " not-in ",
			FilterOp::ArrayContains => " array-contains ",
			FilterOp::ArrayContainsAny => " array-contains-any ",
		}
	}

	/// Operators whose operand is a list of values.
	pub fn takes_list(self) -> bool {
		matches!(self, FilterOp::In | FilterOp::NotIn | FilterOp::ArrayContainsAny)
	}
}

/// A filter clause, possibly compound.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Filter {
	Field { field: String, op: FilterOp, value: FieldValue },
	And(Vec<Filter>),
	Or(Vec<Filter>),
}

impl Filter {
	pub fn field(field: impl Into<String>, op: FilterOp, value: impl Into<FieldValue>) -> Self {
		Filter::Field { field: field.into(), op, value: value.into() }
	}

	pub fn eq(field: impl Into<String>, value: impl Into<FieldValue>) -> Self {
		Self::field(field, FilterOp::Eq, value)
	}

	pub fn any_of(field: impl Into<String>, values: Vec<FieldValue>) -> Self {
		Filter::Field { field: field.into(), op: FilterOp::In, value: FieldValue::Array(values) }
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Direction {
	Asc,
	Desc,
}

impl Direction {
	pub fn as_str(self) -> &'static str {
		match self {
			Direction::Asc => "asc",
			Direction::Desc => "desc",
		}
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBy {
	pub field: String,
	pub direction: Direction,
}

/// Whether `limit` keeps the first or the last N results.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LimitType {
	#[default]
	First,
	Last,
}

impl LimitType {
	pub fn as_str(self) -> &'static str {
		match self {
			LimitType::First => "F",
			LimitType::Last => "L",
		}
	}
}

/// Pagination cursor: one value per sort order, in sort-order sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cursor {
	pub values: Vec<FieldValue>,
	/// `start_at`/`end_at` are inclusive, `start_after`/`end_before` are not
	pub inclusive: bool,
}

/// Structured query against one collection.
///
/// Top-level `filters` are combined with AND; their order is irrelevant.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryDescriptor {
	pub path: String,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub filters: Vec<Filter>,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub order_by: Vec<OrderBy>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub limit: Option<u32>,
	#[serde(default)]
	pub limit_type: LimitType,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub start: Option<Cursor>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub end: Option<Cursor>,
}

impl QueryDescriptor {
	/// Query every document of a collection.
	pub fn collection(path: impl Into<String>) -> Self {
		Self { path: path.into(), ..Default::default() }
	}

	/// Query the documents of `collection` whose id is one of `ids`.
	pub fn by_ids<S: AsRef<str>>(collection: impl Into<String>, ids: &[S]) -> Self {
		let values = ids.iter().map(|id| FieldValue::String(id.as_ref().to_string())).collect();
		Self::collection(collection).with_filter(Filter::any_of(DOCUMENT_ID_FIELD, values))
	}

	pub fn with_filter(mut self, filter: Filter) -> Self {
		self.filters.push(filter);
		self
	}

	pub fn where_field(
		self,
		field: impl Into<String>,
		op: FilterOp,
		value: impl Into<FieldValue>,
	) -> Self {
		self.with_filter(Filter::field(field, op, value))
	}

	pub fn order_by(mut self, field: impl Into<String>, direction: Direction) -> Self {
		self.order_by.push(OrderBy { field: field.into(), direction });
		self
	}

	pub fn limit(mut self, limit: u32) -> Self {
		self.limit = Some(limit);
		self.limit_type = LimitType::First;
		self
	}

	pub fn limit_to_last(mut self, limit: u32) -> Self {
		self.limit = Some(limit);
		self.limit_type = LimitType::Last;
		self
	}

	pub fn start_at(mut self, values: Vec<FieldValue>) -> Self {
		self.start = Some(Cursor { values, inclusive: true });
		self
	}

	pub fn start_after(mut self, values: Vec<FieldValue>) -> Self {
		self.start = Some(Cursor { values, inclusive: false });
		self
	}

	pub fn end_at(mut self, values: Vec<FieldValue>) -> Self {
		self.end = Some(Cursor { values, inclusive: true });
		self
	}

	pub fn end_before(mut self, values: Vec<FieldValue>) -> Self {
		self.end = Some(Cursor { values, inclusive: false });
		self
	}
}

// vim: ts=4
