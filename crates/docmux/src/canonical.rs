//! Query key canonicalization
//!
//! Turns a [`QueryDescriptor`] into a string used as a map key for shared
//! query subscriptions. Two descriptors produce the same key exactly when
//! they select the same documents in the same order:
//!
//! ```text
//! repos/1/issues|o:desc-created|f:AND(label=="bug",open==true),state!="x"|l:20|lt:F|s:[5
//! ```
//!
//! Sibling filter clauses are sorted after rendering, and list operands of
//! set operators (`in`, `not-in`, `array-contains-any`) are sorted and
//! de-duplicated, so clause order never affects the key. The key is never
//! parsed back.

use docmux_types::query::{Cursor, Filter, FilterOp, QueryDescriptor};
use docmux_types::utils::segments;
use docmux_types::value::FieldValue;
use std::fmt::Write;

use crate::prelude::*;

/// Canonical key of a query descriptor.
pub fn canonical_key(query: &QueryDescriptor) -> MxResult<String> {
	let mut key = segments(&query.path).collect::<Vec<_>>().join("/");
	if key.is_empty() {
		return Err(Error::InvalidArgument("query without collection path".into()));
	}

	if !query.order_by.is_empty() {
		let orders = query
			.order_by
			.iter()
			.map(|o| format!("{}-{}", o.direction.as_str(), render_field(&o.field)))
			.collect::<Vec<_>>();
		let _ = write!(key, "|o:{}", orders.join(","));
	}

	if !query.filters.is_empty() {
		let _ = write!(key, "|f:{}", render_clauses(&query.filters)?.join(","));
	}

	if let Some(limit) = query.limit {
		let _ = write!(key, "|l:{}|lt:{}", limit, query.limit_type.as_str());
	}
	if let Some(start) = &query.start {
		let _ = write!(key, "|s:{}", render_cursor(start)?);
	}
	if let Some(end) = &query.end {
		let _ = write!(key, "|e:{}", render_cursor(end)?);
	}

	Ok(key)
}

/// Canonical key of the collection-by-ids query for `ids`.
pub fn ids_key<S: AsRef<str>>(collection: &str, ids: &[S]) -> String {
	canonical_key(&QueryDescriptor::by_ids(collection, ids)).unwrap_or_default()
}

fn render_clauses(filters: &[Filter]) -> MxResult<Vec<String>> {
	let mut parts = filters.iter().map(render_filter).collect::<MxResult<Vec<_>>>()?;
	parts.sort();
	parts.dedup();
	Ok(parts)
}

fn render_filter(filter: &Filter) -> MxResult<String> {
	match filter {
		Filter::Field { field, op, value } => {
			let operand = if op.takes_list() {
				render_set(*op, value)?
			} else {
				render_value(value)?
			};
			Ok(format!("{}{}{}", render_field(field), op.as_str(), operand))
		}
		Filter::And(subs) => Ok(format!("AND({})", render_clauses(subs)?.join(","))),
		Filter::Or(subs) => Ok(format!("OR({})", render_clauses(subs)?.join(","))),
	}
}

/// Operand of a set operator: order and duplicates do not matter.
fn render_set(op: FilterOp, value: &FieldValue) -> MxResult<String> {
	let items = value.as_array().ok_or_else(|| {
		Error::InvalidArgument(format!("operator '{}' needs a list", op.as_str().trim()))
	})?;
	let mut rendered = items.iter().map(render_value).collect::<MxResult<Vec<_>>>()?;
	rendered.sort();
	rendered.dedup();
	Ok(format!("[{}]", rendered.join(",")))
}

fn render_cursor(cursor: &Cursor) -> MxResult<String> {
	let values = cursor.values.iter().map(render_value).collect::<MxResult<Vec<_>>>()?;
	Ok(format!("{}{}", if cursor.inclusive { '[' } else { '(' }, values.join(",")))
}

/// Plain identifiers render as-is, anything else is backquoted.
fn render_field(field: &str) -> String {
	let plain = !field.is_empty()
		&& field.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.');
	if plain { field.to_string() } else { format!("`{}`", escape(field, '`')) }
}

fn render_value(value: &FieldValue) -> MxResult<String> {
	match value {
		FieldValue::Null => Ok("null".into()),
		FieldValue::Bool(b) => Ok(b.to_string()),
		FieldValue::Number(n) => Ok(n.to_string()),
		FieldValue::String(s) => Ok(format!("\"{}\"", escape(s, '"'))),
		FieldValue::Reference(path) => Ok(format!("ref(\"{}\")", escape(path, '"'))),
		FieldValue::Array(items) => {
			let rendered = items.iter().map(render_value).collect::<MxResult<Vec<_>>>()?;
			Ok(format!("[{}]", rendered.join(",")))
		}
		FieldValue::Timestamp { .. } | FieldValue::Bytes(_) | FieldValue::Map(_) => {
			Err(Error::UnsupportedValue(value.kind()))
		}
	}
}

fn escape(s: &str, quote: char) -> String {
	let mut out = String::with_capacity(s.len());
	for c in s.chars() {
		if c == quote || c == '\\' {
			out.push('\\');
		}
		out.push(c);
	}
	out
}


// vim: ts=4
