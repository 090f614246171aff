//! Query evaluation over the in-memory document map

use docmux_types::prelude::*;
use docmux_types::query::{
	Cursor, DOCUMENT_ID_FIELD, Direction, Filter, FilterOp, LimitType, QueryDescriptor,
};
use docmux_types::store_adapter::DocChange;
use docmux_types::utils::parent_path;
use docmux_types::value::FieldValue;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

/// Run `query` against `docs`, returning matches in query order.
pub fn execute_query(docs: &BTreeMap<Box<str>, Value>, query: &QueryDescriptor) -> Vec<Document> {
	let mut results = docs
		.iter()
		.filter(|(path, _)| parent_path(path) == Some(query.path.as_str()))
		.map(|(path, data)| Document::new(path.clone(), data.clone()))
		.filter(|doc| query.filters.iter().all(|f| matches_filter(doc, f)))
		.collect::<Vec<_>>();

	results.sort_by(|a, b| compare_documents(a, b, query));

	if let Some(start) = &query.start {
		results.retain(|doc| {
			let ord = compare_to_cursor(doc, query, start);
			ord == Ordering::Greater || (start.inclusive && ord == Ordering::Equal)
		});
	}
	if let Some(end) = &query.end {
		results.retain(|doc| {
			let ord = compare_to_cursor(doc, query, end);
			ord == Ordering::Less || (end.inclusive && ord == Ordering::Equal)
		});
	}

	if let Some(limit) = query.limit {
		let limit = limit as usize;
		if results.len() > limit {
			match query.limit_type {
				LimitType::First => results.truncate(limit),
				LimitType::Last => {
					results.drain(..results.len() - limit);
				}
			}
		}
	}
	results
}

/// Change records turning `before` into `after`: removals first, then
/// additions and modifications in `after` order.
pub fn diff(before: &[Document], after: &[Document]) -> Vec<DocChange> {
	let old = before.iter().map(|d| (&*d.path, d)).collect::<HashMap<_, _>>();
	let new = after.iter().map(|d| &*d.path).collect::<std::collections::HashSet<_>>();

	let mut changes = before
		.iter()
		.filter(|d| !new.contains(&*d.path))
		.map(|d| DocChange::removed(d.clone()))
		.collect::<Vec<_>>();
	for doc in after {
		match old.get(&*doc.path) {
			None => changes.push(DocChange::added(doc.clone())),
			Some(prev) if prev.data != doc.data => changes.push(DocChange::modified(doc.clone())),
			Some(_) => {}
		}
	}
	changes
}

/// Value of `field` in `doc`; `__name__` is the document id, dotted names
/// address nested fields.
pub fn field_value(doc: &Document, field: &str) -> Option<Value> {
	if field == DOCUMENT_ID_FIELD {
		return Some(Value::String(doc.id.to_string()));
	}
	let mut current = &doc.data;
	for part in field.split('.') {
		current = current.get(part)?;
	}
	Some(current.clone())
}

/// Check if a document matches a filter
pub fn matches_filter(doc: &Document, filter: &Filter) -> bool {
	match filter {
		Filter::And(subs) => subs.iter().all(|f| matches_filter(doc, f)),
		Filter::Or(subs) => subs.iter().any(|f| matches_filter(doc, f)),
		Filter::Field { field, op, value } => {
			let actual = field_value(doc, field);
			let expected = value.to_json();
			match op {
				FilterOp::Eq => actual.as_ref() == Some(&expected),
				// missing fields never match an inequality
				FilterOp::Ne => actual.is_some_and(|a| a != expected),
				FilterOp::Lt => compares(actual.as_ref(), &expected, |o| o == Ordering::Less),
				FilterOp::Le => compares(actual.as_ref(), &expected, |o| o != Ordering::Greater),
				FilterOp::Gt => compares(actual.as_ref(), &expected, |o| o == Ordering::Greater),
				FilterOp::Ge => compares(actual.as_ref(), &expected, |o| o != Ordering::Less),
				FilterOp::In => {
					actual.is_some_and(|a| list(value).iter().any(|v| v.to_json() == a))
				}
				FilterOp::NotIn => {
					actual.is_some_and(|a| !list(value).iter().any(|v| v.to_json() == a))
				}
				FilterOp::ArrayContains => match actual {
					Some(Value::Array(items)) => items.contains(&expected),
					_ => false,
				},
				FilterOp::ArrayContainsAny => match actual {
					Some(Value::Array(items)) => {
						list(value).iter().any(|v| items.contains(&v.to_json()))
					}
					_ => false,
				},
			}
		}
	}
}

fn list(value: &FieldValue) -> &[FieldValue] {
	value.as_array().unwrap_or(std::slice::from_ref(value))
}

fn compares(actual: Option<&Value>, expected: &Value, accept: impl Fn(Ordering) -> bool) -> bool {
	match actual {
		Some(actual) if same_kind(actual, expected) => accept(compare_values(Some(actual), Some(expected))),
		_ => false,
	}
}

fn same_kind(a: &Value, b: &Value) -> bool {
	matches!(
		(a, b),
		(Value::Number(_), Value::Number(_))
			| (Value::String(_), Value::String(_))
			| (Value::Bool(_), Value::Bool(_))
	)
}

/// Compare two JSON values for sorting
pub fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
	match (a, b) {
		(None, None) => Ordering::Equal,
		(None, Some(_)) => Ordering::Less,
		(Some(_), None) => Ordering::Greater,
		(Some(Value::Number(a)), Some(Value::Number(b))) => {
			a.as_f64().partial_cmp(&b.as_f64()).unwrap_or(Ordering::Equal)
		}
		(Some(Value::String(a)), Some(Value::String(b))) => a.cmp(b),
		(Some(Value::Bool(a)), Some(Value::Bool(b))) => a.cmp(b),
		(Some(a), Some(b)) => a.to_string().cmp(&b.to_string()),
	}
}

/// Sort by the query's orders, then by document id.
fn compare_documents(a: &Document, b: &Document, query: &QueryDescriptor) -> Ordering {
	for order in &query.order_by {
		let ord = compare_values(
			field_value(a, &order.field).as_ref(),
			field_value(b, &order.field).as_ref(),
		);
		let ord = match order.direction {
			Direction::Asc => ord,
			Direction::Desc => ord.reverse(),
		};
		if ord != Ordering::Equal {
			return ord;
		}
	}
	a.id.cmp(&b.id)
}

/// Position of `doc` relative to `cursor`, in query order.
fn compare_to_cursor(doc: &Document, query: &QueryDescriptor, cursor: &Cursor) -> Ordering {
	for (order, value) in query.order_by.iter().zip(&cursor.values) {
		let ord = compare_values(field_value(doc, &order.field).as_ref(), Some(&value.to_json()));
		let ord = match order.direction {
			Direction::Asc => ord,
			Direction::Desc => ord.reverse(),
		};
		if ord != Ordering::Equal {
			return ord;
		}
	}
	Ordering::Equal
}


// vim: ts=4
