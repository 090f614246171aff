//! Registry configuration

use docmux_types::store_adapter::{MAX_BATCH_OPS, MAX_IN_LIST};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Timing and sizing knobs of a [`SubscriptionRegistry`](crate::SubscriptionRegistry).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RegistryConfig {
	/// Delay between the first registration on a new collection and opening
	/// its subscription. Registrations arriving meanwhile are batched.
	#[serde(rename = "startDelayMs", with = "duration_ms")]
	pub start_delay: Duration,

	/// How long a document or query subscription outlives its owner,
	/// waiting for a new consumer to take it over.
	#[serde(rename = "gracePeriodMs", with = "duration_ms")]
	pub grace_period: Duration,

	/// Ids per chunk subscription (the store's `in` list ceiling)
	pub chunk_size: usize,

	/// Operations per batch commit
	pub batch_limit: usize,
}

impl Default for RegistryConfig {
	fn default() -> Self {
		Self {
			start_delay: Duration::ZERO,
			grace_period: Duration::from_millis(100),
			chunk_size: MAX_IN_LIST,
			batch_limit: MAX_BATCH_OPS,
		}
	}
}

impl RegistryConfig {
	pub fn with_start_delay(mut self, delay: Duration) -> Self {
		self.start_delay = delay;
		self
	}

	pub fn with_grace_period(mut self, grace: Duration) -> Self {
		self.grace_period = grace;
		self
	}

	pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
		self.chunk_size = chunk_size.clamp(1, MAX_IN_LIST);
		self
	}

	pub fn with_batch_limit(mut self, batch_limit: usize) -> Self {
		self.batch_limit = batch_limit.clamp(1, MAX_BATCH_OPS);
		self
	}
}

mod duration_ms {
	use serde::{Deserialize, Deserializer, Serializer};
	use std::time::Duration;

	pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
		u64::deserialize(deserializer).map(Duration::from_millis)
	}
}


// vim: ts=4
