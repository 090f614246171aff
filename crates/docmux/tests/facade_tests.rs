//! Facade tests
//!
//! Caller id stability across want changes, mount lifetime.

mod common;

use common::*;
use docmux::types::prelude::*;
use docmux::types::query::{Direction, FilterOp, QueryDescriptor};
use docmux::types::value::FieldValue;
use docmux::{Facade, Want};
use serde_json::json;

#[tokio::test(start_paused = true)]
async fn test_caller_id_survives_want_changes() {
	let (store, registry) = setup();
	seed(&store, "tags", &["a", "b"]);
	let facade = Facade::new(registry.clone());
	let mount = facade.mount();
	let id = mount.id().clone();

	let recorder = Recorder::new();
	let reg = mount
		.use_docs("tags", &["a"], recorder.on_result(), recorder.on_error())
		.expect("Failed to register");
	assert_eq!(reg.key, LogicalKey::Collection("tags".into()));
	settle().await;
	assert_eq!(recorder.last_ids(), Some(vec!["a".into()]));

	// more ids on the same collection: same registration, listener grows
	let reg = mount.update(&reg.key, Want::ids("tags", &["a", "b"])).expect("Failed to update");
	settle().await;
	assert_eq!(recorder.last_ids(), Some(vec!["a".into(), "b".into()]));
	assert_eq!(registry.owner_of(&reg.key), Some(id.clone()));
	assert_eq!(store.stats().query_subscribes, 2);

	// a different kind of want: re-registered under the same id
	let reg = mount.update(&reg.key, Want::document("tags/a")).expect("Failed to update");
	assert_eq!(reg.key, LogicalKey::Document("tags/a".into()));
	settle().await;
	assert_eq!(recorder.last_ids(), Some(vec!["a".into()]));
	assert_eq!(registry.owner_of(&reg.key), Some(id));
	assert_eq!(mount.keys(), vec![reg.key.clone()]);
	assert_eq!(registry.stats().collections, 0);
}

#[tokio::test(start_paused = true)]
async fn test_update_to_cached_want_delivers_immediately() {
	let (store, registry) = setup();
	seed(&store, "tags", &["a", "b"]);
	let facade = Facade::new(registry);

	let first = facade.mount();
	first.use_doc("tags/b", Recorder::new().on_result(), None).expect("Failed to register");
	settle().await;

	let second = facade.mount();
	let recorder = Recorder::new();
	let reg = second.use_doc("tags/a", recorder.on_result(), None).expect("Failed to register");
	settle().await;
	assert_eq!(recorder.result_count(), 1);

	let reg = second.update(&reg.key, Want::document("tags/b")).expect("Failed to update");
	assert!(reg.cached.is_some());
	assert_eq!(recorder.result_count(), 2);
	assert_eq!(recorder.last_ids(), Some(vec!["b".into()]));
	assert_eq!(store.stats().document_subscribes, 2);
}

#[tokio::test(start_paused = true)]
async fn test_same_key_update_is_noop() {
	let (store, registry) = setup();
	seed(&store, "tags", &["a"]);
	let facade = Facade::new(registry);
	let mount = facade.mount();

	let reg = mount.use_doc("tags/a", Recorder::new().on_result(), None).expect("Failed to register");
	settle().await;
	let again = mount.update(&reg.key, Want::document("tags/a")).expect("Failed to update");
	assert_eq!(again.key, reg.key);
	assert_eq!(store.stats().document_subscribes, 1);

	let unknown = LogicalKey::Document("tags/zz".into());
	assert_eq!(mount.unregister(&unknown), Err(Error::UnknownCaller));
	assert!(matches!(mount.update(&unknown, Want::document("tags/a")), Err(Error::UnknownCaller)));
}

#[tokio::test(start_paused = true)]
async fn test_dropping_mount_unregisters_everything() {
	let (store, registry) = setup();
	seed(&store, "tags", &["a", "b"]);
	let facade = Facade::new(registry.clone());

	let recorder = Recorder::new();
	{
		let mount = facade.mount();
		mount.use_docs("tags", &["a", "b"], recorder.on_result(), None).expect("Failed to register");
		mount.use_doc("tags/a", recorder.on_result(), None).expect("Failed to register");
		let query = QueryDescriptor::collection("tags").order_by("name", Direction::Desc);
		mount.use_query(query, recorder.on_result(), None).expect("Failed to register");
		settle().await;
		assert_eq!(mount.keys().len(), 3);
		assert_eq!(registry.stats().callers, 3);
	}

	let stats = registry.stats();
	assert_eq!(stats.callers, 0);
	assert_eq!(stats.collections, 0);
	// document and query wait out their grace period
	assert_eq!(stats.documents + stats.queries, 2);

	let seen = recorder.result_count();
	store.set("tags/a", serde_json::json!({"name": "changed"}));
	advance(200).await;
	assert_eq!(recorder.result_count(), seen);
	assert_eq!(registry.stats(), docmux::RegistryStats::default());
	assert_eq!(store.stats().active, 0);
}

#[tokio::test(start_paused = true)]
async fn test_mount_ids_are_unique() {
	let (_store, registry) = setup();
	let facade = Facade::new(registry);
	let first = facade.mount();
	let second = facade.mount();

	assert_ne!(first.id(), second.id());
	assert!(second.id().seq() > first.id().seq());
	if cfg!(debug_assertions) {
		assert!(first.id().label().is_some_and(|label| label.contains("facade_tests.rs")));
	}
}

#[tokio::test(start_paused = true)]
async fn test_query_want_key_matches_registration() {
	let (store, registry) = setup();
	seed(&store, "tags", &["a", "b"]);
	let facade = Facade::new(registry);
	let mount = facade.mount();

	let query = QueryDescriptor::collection("tags").order_by("name", Direction::Desc).limit(1);
	let want = Want::Query(query.clone());
	let recorder = Recorder::new();
	let reg = mount.use_query(query, recorder.on_result(), None).expect("Failed to register");
	assert_eq!(want.key(), Ok(reg.key));
	settle().await;
	assert_eq!(recorder.last_ids(), Some(vec!["b".into()]));
}

#[tokio::test(start_paused = true)]
async fn test_failed_update_keeps_registration() {
	let (store, registry) = setup();
	seed(&store, "tags", &["a"]);
	let facade = Facade::new(registry.clone());
	let mount = facade.mount();

	let recorder = Recorder::new();
	let reg = mount.use_doc("tags/a", recorder.on_result(), None).expect("Failed to register");
	settle().await;

	// rejected before touching anything
	let result = mount.update(&reg.key, Want::document("tags"));
	assert!(matches!(result, Err(Error::InvalidArgument(_))));
	let timestamp = QueryDescriptor::collection("tags")
		.where_field("at", FilterOp::Gt, FieldValue::Timestamp { seconds: 1, nanos: 0 });
	let result = mount.update(&reg.key, Want::Query(timestamp));
	assert!(matches!(result, Err(Error::UnsupportedValue("timestamp"))));

	// refused by the store
	let ids = (0..31).map(|i| format!("t{}", i)).collect::<Vec<_>>();
	let result = mount.update(&reg.key, Want::Query(QueryDescriptor::by_ids("tags", &ids)));
	assert!(matches!(result, Err(Error::InvalidArgument(_))));

	assert_eq!(mount.keys(), vec![reg.key.clone()]);
	assert_eq!(registry.stats().callers, 1);
	assert_eq!(registry.owner_of(&reg.key), Some(mount.id().clone()));

	store.set("tags/a", json!({"name": "still here"}));
	settle().await;
	assert_eq!(recorder.last_field("name"), Some(json!("still here")));
	assert_eq!(store.stats().unsubscribes, 0);
}

#[tokio::test(start_paused = true)]
async fn test_double_unregister_reports_it() {
	let (store, registry) = setup();
	seed(&store, "tags", &["a"]);
	let facade = Facade::new(registry);
	let mount = facade.mount();

	let reg = mount.use_doc("tags/a", Recorder::new().on_result(), None).expect("Failed to register");
	assert_eq!(mount.unregister(&reg.key), Ok(()));
	assert_eq!(mount.unregister(&reg.key), Err(Error::AlreadyUnregistered(mount.id().clone())));
	// any spelling of the path
	assert_eq!(
		mount.unregister(&LogicalKey::Document("/tags//a".into())),
		Err(Error::AlreadyUnregistered(mount.id().clone()))
	);
	assert_eq!(mount.unregister(&LogicalKey::Document("tags/b".into())), Err(Error::UnknownCaller));
}

#[test]
fn test_want_keys_are_normalized() {
	assert_eq!(Want::document("/tags//a/").key(), Ok(LogicalKey::Document("tags/a".into())));
	assert_eq!(Want::ids("/tags/", &["a"]).key(), Ok(LogicalKey::Collection("tags".into())));
	assert!(matches!(Want::document("tags").key(), Err(Error::InvalidArgument(_))));
	assert!(matches!(Want::ids("tags/a", &["b"]).key(), Err(Error::InvalidArgument(_))));
}

// vim: ts=4
