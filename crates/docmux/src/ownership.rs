//! Ownership of a shared subscription
//!
//! Document and query subscriptions are owned by one caller at a time.
//! When the owner leaves, the subscription enters `PendingReassignment`
//! for the grace period; a caller registering meanwhile takes it over
//! without touching the network. When the grace timer fires, `settle`
//! either hands ownership to the next queued caller or tells the registry
//! to unsubscribe.

use docmux_types::types::CallerId;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Ownership {
	#[default]
	Unowned,
	Owned(CallerId),
	/// The owner left at `epoch`; a grace timer for that epoch is running
	PendingReassignment { previous: CallerId, epoch: u64 },
}

/// Outcome of a grace timer firing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settle {
	/// The timer belongs to an earlier release; nothing to do
	Stale,
	/// A queued caller became owner
	Reassigned(CallerId),
	/// Nobody is left; the subscription must be torn down
	Relinquish,
}

impl Ownership {
	pub fn owner(&self) -> Option<&CallerId> {
		match self {
			Ownership::Owned(owner) => Some(owner),
			_ => None,
		}
	}

	pub fn is_pending(&self) -> bool {
		matches!(self, Ownership::PendingReassignment { .. })
	}

	/// A caller registers. Returns true if it became the owner, false if
	/// it joins as a listener behind the current owner.
	pub fn claim(&mut self, caller: &CallerId) -> bool {
		match self {
			Ownership::Owned(owner) => owner == caller,
			Ownership::Unowned | Ownership::PendingReassignment { .. } => {
				*self = Ownership::Owned(caller.clone());
				true
			}
		}
	}

	/// A caller leaves. If it was the owner the record enters the grace
	/// period for `epoch`, which is returned so the caller can arm a timer.
	pub fn release(&mut self, caller: &CallerId, epoch: u64) -> Option<u64> {
		match self {
			Ownership::Owned(owner) if owner == caller => {
				*self = Ownership::PendingReassignment { previous: caller.clone(), epoch };
				Some(epoch)
			}
			_ => None,
		}
	}

	/// The grace timer for `epoch` fired. `next` is the first caller still
	/// registered, if any.
	pub fn settle(&mut self, epoch: u64, next: Option<&CallerId>) -> Settle {
		match self {
			Ownership::PendingReassignment { epoch: pending, .. } if *pending == epoch => {
				match next {
					Some(next) => {
						*self = Ownership::Owned(next.clone());
						Settle::Reassigned(next.clone())
					}
					None => {
						*self = Ownership::Unowned;
						Settle::Relinquish
					}
				}
			}
			_ => Settle::Stale,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn caller(seq: u64) -> CallerId {
		CallerId::new(seq)
	}

	#[test]
	fn test_first_claim_owns() {
		let mut ownership = Ownership::default();
		assert!(ownership.claim(&caller(1)));
		assert_eq!(ownership.owner(), Some(&caller(1)));
		assert!(!ownership.claim(&caller(2)));
		assert_eq!(ownership.owner(), Some(&caller(1)));
	}

	#[test]
	fn test_listener_release_keeps_owner() {
		let mut ownership = Ownership::Owned(caller(1));
		assert_eq!(ownership.release(&caller(2), 7), None);
		assert_eq!(ownership, Ownership::Owned(caller(1)));
	}

	#[test]
	fn test_owner_release_enters_grace() {
		let mut ownership = Ownership::Owned(caller(1));
		assert_eq!(ownership.release(&caller(1), 3), Some(3));
		assert!(ownership.is_pending());
		assert_eq!(ownership.owner(), None);
	}

	#[test]
	fn test_claim_during_grace_hands_off() {
		let mut ownership = Ownership::Owned(caller(1));
		ownership.release(&caller(1), 1);
		assert!(ownership.claim(&caller(2)));
		assert_eq!(ownership, Ownership::Owned(caller(2)));
		// the armed timer is now stale
		assert_eq!(ownership.settle(1, None), Settle::Stale);
		assert_eq!(ownership, Ownership::Owned(caller(2)));
	}

	#[test]
	fn test_settle_promotes_queued_listener() {
		let mut ownership = Ownership::Owned(caller(1));
		ownership.release(&caller(1), 4);
		assert_eq!(ownership.settle(4, Some(&caller(3))), Settle::Reassigned(caller(3)));
		assert_eq!(ownership.owner(), Some(&caller(3)));
	}

	#[test]
	fn test_settle_without_callers_relinquishes() {
		let mut ownership = Ownership::Owned(caller(1));
		ownership.release(&caller(1), 5);
		assert_eq!(ownership.settle(5, None), Settle::Relinquish);
		assert_eq!(ownership, Ownership::Unowned);
	}

	#[test]
	fn test_settle_with_old_epoch_is_stale() {
		let mut ownership = Ownership::Owned(caller(1));
		ownership.release(&caller(1), 1);
		ownership.claim(&caller(2));
		ownership.release(&caller(2), 2);
		assert_eq!(ownership.settle(1, None), Settle::Stale);
		assert!(ownership.is_pending());
		assert_eq!(ownership.settle(2, None), Settle::Relinquish);
	}
}

// vim: ts=4
