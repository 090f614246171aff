//! Subscription registry tests
//!
//! Sharing, batching, chunking, ownership hand-off and error delivery,
//! checked against the memory store's subscription accounting.

mod common;

use common::*;
use docmux::types::prelude::*;
use docmux::types::query::{Direction, QueryDescriptor};
use docmux::{RegistryConfig, RegistryStats};
use serde_json::json;
use std::time::Duration;

#[tokio::test(start_paused = true)]
async fn test_callers_share_collection_subscription() {
	let (store, registry) = setup();
	seed(&store, "tags", &["a", "b", "c"]);

	let first = Recorder::new();
	let second = Recorder::new();
	registry
		.register_docs_hook(caller(1), "tags", &["a", "b"], first.on_docs(), first.on_error())
		.expect("Failed to register");
	registry
		.register_docs_hook(caller(2), "tags", &["c", "b"], second.on_docs(), second.on_error())
		.expect("Failed to register");
	settle().await;

	// one request for the union, in arrival order
	assert_eq!(store.subscribed_queries(), vec![QueryDescriptor::by_ids("tags", &["a", "b", "c"])]);
	assert_eq!(first.last_ids(), Some(vec!["a".into(), "b".into()]));
	assert_eq!(second.last_ids(), Some(vec!["c".into(), "b".into()]));
	assert_eq!(
		registry.stats(),
		RegistryStats { collections: 1, callers: 2, chunks: 1, ..RegistryStats::default() }
	);
}

#[tokio::test(start_paused = true)]
async fn test_start_delay_batches_late_registrations() {
	let (store, registry) =
		setup_with(RegistryConfig::default().with_start_delay(Duration::from_millis(20)));
	seed(&store, "tags", &["a", "b"]);

	let first = Recorder::new();
	let second = Recorder::new();
	registry
		.register_docs_hook(caller(1), "tags", &["a"], first.on_docs(), None)
		.expect("Failed to register");
	advance(10).await;
	assert_eq!(store.stats().query_subscribes, 0);

	registry
		.register_docs_hook(caller(2), "tags", &["b"], second.on_docs(), None)
		.expect("Failed to register");
	advance(15).await;

	assert_eq!(store.stats().query_subscribes, 1);
	assert_eq!(first.last_ids(), Some(vec!["a".into()]));
	assert_eq!(second.last_ids(), Some(vec!["b".into()]));
}

#[tokio::test(start_paused = true)]
async fn test_cached_documents_are_returned_immediately() {
	let (store, registry) = setup();
	seed(&store, "tags", &["a", "b"]);

	let first = Recorder::new();
	registry
		.register_docs_hook(caller(1), "tags", &["a", "b"], first.on_docs(), None)
		.expect("Failed to register");
	settle().await;

	let second = Recorder::new();
	let reg = registry
		.register_docs_hook(caller(2), "tags", &["b", "a"], second.on_docs(), None)
		.expect("Failed to register");
	let cached = reg.cached.expect("Documents should be cached");
	assert_eq!(cached.iter().map(|d| &*d.id).collect::<Vec<_>>(), vec!["b", "a"]);
	assert_eq!(store.stats().query_subscribes, 1);

	// only changes reach the second caller through its callback
	settle().await;
	assert_eq!(second.result_count(), 0);
	store.set("tags/a", json!({"name": "changed"}));
	settle().await;
	assert_eq!(second.result_count(), 1);
	assert_eq!(first.result_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_large_id_sets_are_chunked() {
	let (store, registry) = setup();
	let ids = (0..35).map(|i| format!("d{:02}", i)).collect::<Vec<_>>();
	let refs = ids.iter().map(String::as_str).collect::<Vec<_>>();
	seed(&store, "docs", &refs);

	let recorder = Recorder::new();
	registry
		.register_docs_hook(caller(1), "docs", &ids, recorder.on_docs(), recorder.on_error())
		.expect("Failed to register");
	settle().await;

	let layout = registry.chunks_of("docs");
	assert_eq!(layout.iter().map(Vec::len).collect::<Vec<_>>(), vec![30, 5]);
	assert_eq!(store.stats().query_subscribes, 2);
	// delivered once, after both chunks answered
	assert_eq!(recorder.result_count(), 1);
	assert_eq!(recorder.last_ids(), Some(ids.clone()));
	assert!(recorder.errors().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_new_ids_fill_the_last_chunk() {
	let (store, registry) = setup();
	let ids = (0..35).map(|i| format!("d{:02}", i)).collect::<Vec<_>>();
	let refs = ids.iter().map(String::as_str).collect::<Vec<_>>();
	seed(&store, "docs", &refs);
	seed(&store, "docs", &["x1", "x2", "x3"]);

	registry
		.register_docs_hook(caller(1), "docs", &ids, Recorder::new().on_docs(), None)
		.expect("Failed to register");
	settle().await;

	let late = Recorder::new();
	registry
		.register_docs_hook(caller(2), "docs", &["x1", "d00", "x2", "x3"], late.on_docs(), None)
		.expect("Failed to register");
	settle().await;

	// only the 5-id chunk is replaced, the full one is untouched
	let stats = store.stats();
	assert_eq!(stats.query_subscribes, 3);
	assert_eq!(stats.unsubscribes, 1);
	let layout = registry.chunks_of("docs");
	assert_eq!(layout.iter().map(Vec::len).collect::<Vec<_>>(), vec![30, 8]);
	assert_eq!(&*layout[1][5], "x1");
	assert_eq!(late.last_ids(), Some(vec!["x1".into(), "d00".into(), "x2".into(), "x3".into()]));
}

#[tokio::test(start_paused = true)]
async fn test_growing_chunk_stays_loading() {
	let (store, registry) = setup();
	let ids = (0..35).map(|i| format!("d{:02}", i)).collect::<Vec<_>>();
	let refs = ids.iter().map(String::as_str).collect::<Vec<_>>();
	seed(&store, "docs", &refs);
	seed(&store, "docs", &["x1"]);

	let first = Recorder::new();
	registry
		.register_docs_hook(caller(1), "docs", &ids, first.on_docs(), first.on_error())
		.expect("Failed to register");
	settle().await;

	let late = Recorder::new();
	registry
		.register_docs_hook(caller(2), "docs", &["x1", "zz", "d00"], late.on_docs(), late.on_error())
		.expect("Failed to register");
	// a change on the untouched chunk lands while the last one is resubscribing
	store.set("docs/d01", json!({"name": "changed"}));
	assert!(late.errors().is_empty());
	settle().await;

	assert!(first.errors().is_empty());
	assert_eq!(late.errors(), vec![Error::NotFound("docs/zz".into())]);
	assert_eq!(late.result_count(), 0);

	store.set("docs/zz", json!({"name": "zz"}));
	settle().await;
	assert_eq!(late.last_ids(), Some(vec!["x1".into(), "zz".into(), "d00".into()]));
	assert_eq!(late.errors().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_update_to_cached_ids_skips_the_store() {
	let (store, registry) = setup();
	seed(&store, "tags", &["a", "b", "c"]);

	registry
		.register_docs_hook(caller(1), "tags", &["a", "b", "c"], Recorder::new().on_docs(), None)
		.expect("Failed to register");
	settle().await;

	let narrow = Recorder::new();
	let reg = registry
		.register_docs_hook(caller(2), "tags", &["a"], narrow.on_docs(), narrow.on_error())
		.expect("Failed to register");
	assert!(reg.cached.is_some());
	let before = store.stats();

	registry.update_doc_ids("tags", &caller(2), &["c", "b"]).expect("Failed to update");
	// delivered before returning
	assert_eq!(narrow.result_count(), 1);
	assert_eq!(narrow.last_ids(), Some(vec!["c".into(), "b".into()]));

	settle().await;
	assert_eq!(store.stats(), before);
	assert_eq!(narrow.result_count(), 1);
	assert!(narrow.errors().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_path_spellings_share_subscriptions() {
	let (store, registry) = setup();
	seed(&store, "tags", &["a"]);

	let docs = Recorder::new();
	registry
		.register_docs_hook(caller(1), "tags", &["a"], Recorder::new().on_docs(), None)
		.expect("Failed to register");
	registry
		.register_docs_hook(caller(2), "/tags/", &["a"], docs.on_docs(), None)
		.expect("Failed to register");
	let doc = Recorder::new();
	registry
		.register_doc_hook(caller(3), "tags/a", Recorder::new().on_doc(), None)
		.expect("Failed to register");
	registry
		.register_doc_hook(caller(4), "/tags//a/", doc.on_doc(), None)
		.expect("Failed to register");
	settle().await;

	let stats = store.stats();
	assert_eq!(stats.query_subscribes, 1);
	assert_eq!(stats.document_subscribes, 1);
	assert_eq!(
		registry.stats(),
		RegistryStats { collections: 1, documents: 1, callers: 4, chunks: 1, ..RegistryStats::default() }
	);
	assert_eq!(registry.owner_of(&LogicalKey::Document("/tags/a".into())), Some(caller(3)));
	assert_eq!(registry.chunks_of("tags/").len(), 1);

	registry.write_field("tags//a", json!({"color": "blue"})).await.expect("Failed to write");
	assert_eq!(docs.last_field("color"), Some(json!("blue")));
	assert_eq!(doc.last_field("color"), Some(json!("blue")));
	assert_eq!(store.get("tags/a"), Some(json!({"name": "a", "color": "blue"})));

	registry.update_doc_ids("tags/", &caller(1), &["a"]).expect("Failed to update");
	registry
		.unregister(&LogicalKey::Collection("/tags".into()), &caller(2))
		.expect("Failed to unregister");
	registry
		.unregister(&LogicalKey::Document("tags/a/".into()), &caller(4))
		.expect("Failed to unregister");
	assert_eq!(registry.stats().callers, 2);
}

#[tokio::test(start_paused = true)]
async fn test_missing_ids_report_not_found() {
	let (store, registry) = setup();
	seed(&store, "tags", &["a"]);

	let recorder = Recorder::new();
	registry
		.register_docs_hook(caller(1), "tags", &["a", "x"], recorder.on_docs(), recorder.on_error())
		.expect("Failed to register");
	settle().await;

	assert_eq!(recorder.errors(), vec![Error::NotFound("tags/x".into())]);
	assert_eq!(recorder.result_count(), 0);

	// unrelated changes do not repeat the report
	store.set("tags/a", json!({"name": "again"}));
	settle().await;
	assert_eq!(recorder.errors().len(), 1);

	store.set("tags/x", json!({"name": "x"}));
	settle().await;
	assert_eq!(recorder.last_ids(), Some(vec!["a".into(), "x".into()]));
}

#[tokio::test(start_paused = true)]
async fn test_store_errors_pass_through() {
	let (store, registry) = setup();
	store.fail_subscriptions("tags", Error::PermissionDenied);

	let docs = Recorder::new();
	registry
		.register_docs_hook(caller(1), "tags", &["a"], docs.on_docs(), docs.on_error())
		.expect("Failed to register");
	let doc = Recorder::new();
	registry
		.register_doc_hook(caller(2), "tags/b", doc.on_doc(), doc.on_error())
		.expect("Failed to register");
	settle().await;

	assert_eq!(docs.errors(), vec![Error::PermissionDenied]);
	assert_eq!(doc.errors(), vec![Error::PermissionDenied]);
}

#[tokio::test(start_paused = true)]
async fn test_unregister_before_first_snapshot() {
	let (store, registry) = setup();
	seed(&store, "tags", &["a"]);

	let docs = Recorder::new();
	let reg = registry
		.register_docs_hook(caller(1), "tags", &["a"], docs.on_docs(), docs.on_error())
		.expect("Failed to register");
	reg.registration.unregister().expect("Failed to unregister");

	let doc = Recorder::new();
	let reg = registry
		.register_doc_hook(caller(2), "tags/a", doc.on_doc(), doc.on_error())
		.expect("Failed to register");
	reg.registration.unregister().expect("Failed to unregister");
	advance(200).await;

	assert_eq!(store.stats().query_subscribes, 0);
	assert_eq!(docs.result_count() + doc.result_count(), 0);
	assert_eq!(registry.stats(), RegistryStats::default());
	assert_eq!(store.stats().active, 0);
}

#[tokio::test(start_paused = true)]
async fn test_no_delivery_after_unregister() {
	let (store, registry) = setup();
	seed(&store, "tags", &["a"]);

	let recorder = Recorder::new();
	let reg = registry
		.register_docs_hook(caller(1), "tags", &["a"], recorder.on_docs(), None)
		.expect("Failed to register");
	settle().await;
	assert_eq!(recorder.result_count(), 1);

	store.set("tags/a", json!({"name": "changed"}));
	reg.registration.unregister().expect("Failed to unregister");
	settle().await;

	assert_eq!(recorder.result_count(), 1);
	assert_eq!(store.stats().active, 0);
	assert_eq!(reg.registration.unregister(), Err(Error::AlreadyUnregistered(caller(1))));
}

#[tokio::test(start_paused = true)]
async fn test_document_owner_hand_off() {
	let (store, registry) = setup();
	seed(&store, "tags", &["a"]);
	let key = LogicalKey::Document("tags/a".into());

	let first = Recorder::new();
	let reg = registry
		.register_doc_hook(caller(1), "tags/a", first.on_doc(), None)
		.expect("Failed to register");
	settle().await;
	assert_eq!(registry.owner_of(&key), Some(caller(1)));

	reg.registration.unregister().expect("Failed to unregister");
	advance(50).await;

	let second = Recorder::new();
	let reg = registry
		.register_doc_hook(caller(2), "tags/a", second.on_doc(), None)
		.expect("Failed to register");
	assert!(reg.cached.is_some());
	assert_eq!(registry.owner_of(&key), Some(caller(2)));
	advance(200).await;

	// taken over without touching the store
	let stats = store.stats();
	assert_eq!(stats.document_subscribes, 1);
	assert_eq!(stats.unsubscribes, 0);
	assert_eq!(registry.stats().documents, 1);
}

#[tokio::test(start_paused = true)]
async fn test_document_hand_off_during_chunk_growth() {
	let (store, registry) = setup();
	let ids = (0..35).map(|i| format!("d{:02}", i)).collect::<Vec<_>>();
	let refs = ids.iter().map(String::as_str).collect::<Vec<_>>();
	seed(&store, "docs", &refs);
	seed(&store, "docs", &["x1"]);
	let key = LogicalKey::Document("docs/d33".into());

	let docs = Recorder::new();
	registry
		.register_docs_hook(caller(1), "docs", &ids, docs.on_docs(), docs.on_error())
		.expect("Failed to register");
	let reg = registry
		.register_doc_hook(caller(2), "docs/d33", Recorder::new().on_doc(), None)
		.expect("Failed to register");
	settle().await;

	reg.registration.unregister().expect("Failed to unregister");
	advance(50).await;

	// inside the grace period: the collection grows and a new caller takes
	// the document over
	registry
		.register_docs_hook(caller(3), "docs", &["x1"], Recorder::new().on_docs(), None)
		.expect("Failed to register");
	let heir = Recorder::new();
	let taken = registry
		.register_doc_hook(caller(4), "docs/d33", heir.on_doc(), heir.on_error())
		.expect("Failed to register");
	assert!(taken.cached.is_some());
	advance(200).await;

	let stats = store.stats();
	assert_eq!(stats.document_subscribes, 1);
	assert_eq!(stats.query_subscribes, 3);
	// only the resubscribed last chunk
	assert_eq!(stats.unsubscribes, 1);
	assert_eq!(registry.owner_of(&key), Some(caller(4)));
	let layout = registry.chunks_of("docs");
	assert_eq!(layout.iter().map(Vec::len).collect::<Vec<_>>(), vec![30, 6]);

	let seen = docs.result_count();
	store.set("docs/d33", json!({"name": "moved"}));
	settle().await;
	assert_eq!(heir.last_field("name"), Some(json!("moved")));
	assert!(docs.result_count() > seen);
	assert!(docs.errors().is_empty());
	assert!(heir.errors().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_grace_period_expiry_unsubscribes() {
	let (store, registry) = setup();
	seed(&store, "tags", &["a"]);

	let reg = registry
		.register_doc_hook(caller(1), "tags/a", Recorder::new().on_doc(), None)
		.expect("Failed to register");
	settle().await;
	reg.registration.unregister().expect("Failed to unregister");

	advance(90).await;
	assert_eq!(store.stats().unsubscribes, 0);
	advance(20).await;
	assert_eq!(store.stats().unsubscribes, 1);
	assert_eq!(registry.stats().documents, 0);

	// a fresh registration subscribes again
	registry
		.register_doc_hook(caller(2), "tags/a", Recorder::new().on_doc(), None)
		.expect("Failed to register");
	assert_eq!(store.stats().document_subscribes, 2);
}

#[tokio::test(start_paused = true)]
async fn test_listener_becomes_owner_after_grace() {
	let (store, registry) = setup();
	seed(&store, "tags", &["a"]);
	let key = LogicalKey::Document("tags/a".into());

	let reg = registry
		.register_doc_hook(caller(1), "tags/a", Recorder::new().on_doc(), None)
		.expect("Failed to register");
	let listener = Recorder::new();
	registry
		.register_doc_hook(caller(2), "tags/a", listener.on_doc(), None)
		.expect("Failed to register");
	settle().await;

	reg.registration.unregister().expect("Failed to unregister");
	assert_eq!(registry.owner_of(&key), None);
	advance(150).await;

	assert_eq!(registry.owner_of(&key), Some(caller(2)));
	store.set("tags/a", json!({"name": "still live"}));
	settle().await;
	assert_eq!(listener.last_field("name"), Some(json!("still live")));
	assert_eq!(store.stats().unsubscribes, 0);
}

#[tokio::test(start_paused = true)]
async fn test_missing_document_and_vanish() {
	let (store, registry) = setup();

	let recorder = Recorder::new();
	registry
		.register_doc_hook(caller(1), "tags/a", recorder.on_doc(), recorder.on_error())
		.expect("Failed to register");
	settle().await;
	assert_eq!(recorder.errors(), vec![Error::NotFound("tags/a".into())]);

	let late = Recorder::new();
	registry
		.register_doc_hook(caller(2), "tags/a", late.on_doc(), late.on_error())
		.expect("Failed to register");
	assert_eq!(late.errors(), vec![Error::NotFound("tags/a".into())]);

	store.set("tags/a", json!({"name": "a"}));
	settle().await;
	assert_eq!(recorder.last_field("name"), Some(json!("a")));

	store.delete("tags/a");
	settle().await;
	assert_eq!(
		recorder.errors(),
		vec![Error::NotFound("tags/a".into()), Error::DocumentVanished("tags/a".into())]
	);
}

#[tokio::test(start_paused = true)]
async fn test_equivalent_queries_share_subscription() {
	let (store, registry) = setup();
	store.set("notes/n1", json!({"rank": 2, "owner": "u1"}));
	store.set("notes/n2", json!({"rank": 1, "owner": "u1"}));
	store.set("notes/n3", json!({"rank": 3, "owner": "u2"}));

	let first_query = QueryDescriptor::collection("notes")
		.where_field("owner", docmux::types::query::FilterOp::Eq, "u1")
		.order_by("rank", Direction::Asc);
	let second_query = first_query.clone();

	let first = Recorder::new();
	let reg = registry
		.register_query_hook(caller(1), &first_query, first.on_docs(), None)
		.expect("Failed to register");
	let second = Recorder::new();
	let other = registry
		.register_query_hook(caller(2), &second_query, second.on_docs(), None)
		.expect("Failed to register");
	settle().await;

	assert_eq!(reg.key, other.key);
	assert_eq!(store.stats().query_subscribes, 1);
	assert_eq!(first.last_ids(), Some(vec!["n2".into(), "n1".into()]));
	assert_eq!(second.last_ids(), first.last_ids());
}

#[tokio::test(start_paused = true)]
async fn test_write_field_updates_caches_first() {
	let (store, registry) = setup();
	seed(&store, "tags", &["a", "b"]);

	let docs = Recorder::new();
	registry
		.register_docs_hook(caller(1), "tags", &["a"], docs.on_docs(), None)
		.expect("Failed to register");
	let doc = Recorder::new();
	registry
		.register_doc_hook(caller(2), "tags/a", doc.on_doc(), None)
		.expect("Failed to register");
	let query = Recorder::new();
	registry
		.register_query_hook(caller(3), &QueryDescriptor::collection("tags"), query.on_docs(), None)
		.expect("Failed to register");
	settle().await;

	store.fail_writes(Some(Error::Unavailable("offline".into())));
	let result = registry.write_field("tags/a", json!({"color": "red"})).await;
	assert!(result.is_err());

	// every cached copy saw the patch even though the store refused it
	assert_eq!(docs.last_field("color"), Some(json!("red")));
	assert_eq!(doc.last_field("color"), Some(json!("red")));
	assert_eq!(query.last_field("color"), Some(json!("red")));
	assert_eq!(store.get("tags/a"), Some(json!({"name": "a"})));

	assert!(matches!(
		registry.write_field("tags", json!({"color": "red"})).await,
		Err(Error::InvalidArgument(_))
	));
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_registration_rejected() {
	let (_store, registry) = setup();
	registry
		.register_docs_hook(caller(1), "tags", &["a"], Recorder::new().on_docs(), None)
		.expect("Failed to register");
	let again = registry.register_docs_hook(caller(1), "tags", &["b"], Recorder::new().on_docs(), None);
	assert!(matches!(again, Err(Error::InvalidArgument(_))));

	assert_eq!(
		registry.unregister(&LogicalKey::Document("tags/zz".into()), &caller(1)),
		Err(Error::UnknownCaller)
	);
}

#[tokio::test(start_paused = true)]
async fn test_double_unregister_by_key() {
	let (_store, registry) = setup();
	let key = LogicalKey::Document("tags/a".into());
	registry
		.register_doc_hook(caller(1), "tags/a", Recorder::new().on_doc(), None)
		.expect("Failed to register");

	assert_eq!(registry.unregister(&key, &caller(1)), Ok(()));
	assert_eq!(registry.unregister(&key, &caller(1)), Err(Error::AlreadyUnregistered(caller(1))));
	assert!(registry.was_unregistered(&key, &caller(1)));

	// registering again starts over
	registry
		.register_doc_hook(caller(1), "tags/a", Recorder::new().on_doc(), None)
		.expect("Failed to register");
	assert!(!registry.was_unregistered(&key, &caller(1)));
	assert_eq!(registry.unregister(&key, &caller(1)), Ok(()));

	registry.forget_caller(&caller(1));
	assert_eq!(registry.unregister(&key, &caller(1)), Err(Error::UnknownCaller));
}

// vim: ts=4
