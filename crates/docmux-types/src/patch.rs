//! Field patches
//!
//! A field write (`write_field`, `WriteOp::Update`) is applied the same way
//! by the store and by the optimistic overlay on cached documents:
//! - top-level fields of the patch overwrite the document's fields
//! - nested objects in the patch replace, they are not merged
//! - dotted keys (`"profile.age"`) address nested fields
//! - `null` removes a field

use serde_json::{Map, Value};

use crate::prelude::*;

/// Apply `patch` to `target` in place.
pub fn apply_patch(target: &mut Value, patch: &Value) -> MxResult<()> {
	let Value::Object(patch_obj) = patch else {
		return Err(Error::InvalidArgument("field patch must be an object".into()));
	};
	if !target.is_object() {
		*target = Value::Object(Map::new());
	}
	let Some(target_obj) = target.as_object_mut() else {
		return Ok(());
	};

	for (key, value) in patch_obj {
		if key.contains('.') {
			apply_dotted(target_obj, key, value)?;
		} else if value.is_null() {
			target_obj.remove(key);
		} else {
			target_obj.insert(key.clone(), value.clone());
		}
	}
	Ok(())
}

fn apply_dotted(target: &mut Map<String, Value>, dotted: &str, value: &Value) -> MxResult<()> {
	let mut parts = dotted.split('.').collect::<Vec<_>>();
	let Some(last) = parts.pop() else {
		return Ok(());
	};

	let mut current = target;
	for part in parts {
		let entry = current.entry(part.to_string()).or_insert_with(|| Value::Object(Map::new()));
		current = entry.as_object_mut().ok_or_else(|| {
			Error::InvalidArgument(format!("cannot set '{}': '{}' is not an object", dotted, part))
		})?;
	}

	if value.is_null() {
		current.remove(last);
	} else {
		current.insert(last.to_string(), value.clone());
	}
	Ok(())
}


// vim: ts=4
