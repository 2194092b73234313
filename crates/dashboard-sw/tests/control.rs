mod common;

use common::{small_config, Harness};
use dashboard_sw::{ControlMessage, ControlReply, MessageTarget, Role};

#[tokio::test]
async fn get_version_replies_with_tag_and_timestamp() {
    let h = Harness::new();
    h.container.register(small_config()).await.unwrap();

    let reply = h
        .container
        .post_raw_message(MessageTarget::Active, r#"{"type":"GET_VERSION"}"#)
        .await
        .unwrap();

    match reply {
        Some(ControlReply::Version { version, timestamp }) => {
            assert_eq!(version, "dashboard-pro-v1.0.0");
            assert!(timestamp > 0);
        }
        other => panic!("unexpected reply: {other:?}"),
    }
}

#[tokio::test]
async fn clear_cache_deletes_every_partition() {
    let h = Harness::new();
    h.origin.ok("/", "<html>").await.unwrap();
    h.container.caches().open("dashboard-static-v0.1.0").await;
    h.container.register(small_config()).await.unwrap();
    h.container.caches().open("someone-else").await;

    let reply = h
        .container
        .post_message(MessageTarget::Active, ControlMessage::ClearCache)
        .await
        .unwrap();

    assert_eq!(reply, Some(ControlReply::Success { success: true }));
    assert!(h.container.caches().keys().await.is_empty());

    // Later writes land in a fresh partition.
    let response = h.container.fetch(h.request("/")).await.unwrap();
    assert!(!response.from_cache);
    assert!(h
        .container
        .caches()
        .has(&small_config().partition_name(Role::Static))
        .await);
}

#[tokio::test]
async fn preload_succeeds_despite_failing_urls() {
    let h = Harness::new();
    h.origin.ok("/img/a.png", "a").await.unwrap();
    h.origin.ok("/docs/guide", "guide").await.unwrap();
    h.origin.fail("/img/broken.png").await.unwrap();
    h.container.register(small_config()).await.unwrap();

    let reply = h
        .container
        .post_raw_message(
            MessageTarget::Active,
            r#"{"type":"PRELOAD_RESOURCES","payload":{"urls":["/img/a.png","/img/missing.png","/img/broken.png","/docs/guide"]}}"#,
        )
        .await
        .unwrap();

    assert_eq!(reply, Some(ControlReply::Success { success: true }));
    let mut expected = vec![h.key("/docs/guide"), h.key("/img/a.png")];
    expected.sort();
    assert_eq!(
        h.container
            .caches()
            .entry_keys(&small_config().partition_name(Role::Dynamic))
            .await,
        expected
    );
}

#[tokio::test]
async fn preload_of_empty_list_replies_success() {
    let h = Harness::new();
    h.container.register(small_config()).await.unwrap();

    let reply = h
        .container
        .post_message(MessageTarget::Active, ControlMessage::preload(Vec::<String>::new()))
        .await
        .unwrap();

    assert_eq!(reply, Some(ControlReply::Success { success: true }));
}

#[tokio::test]
async fn cache_stats_report_partitions() {
    let h = Harness::new();
    h.origin.ok("/", "<html>").await.unwrap();
    h.origin.ok("/app.js", "app()").await.unwrap();
    h.container.register(small_config()).await.unwrap();

    let reply = h
        .container
        .post_message(MessageTarget::Active, ControlMessage::GetCacheStats)
        .await
        .unwrap();

    let Some(ControlReply::CacheStats { partitions }) = reply else {
        panic!("expected cache stats");
    };
    assert_eq!(partitions.len(), 1);
    assert_eq!(partitions[0].name, "dashboard-static-v1.0.0");
    assert_eq!(partitions[0].entries, 2);
    assert_eq!(partitions[0].bytes, 11);
    assert_eq!(partitions[0].max_age_seconds, Some(30 * 24 * 60 * 60));
}

#[tokio::test]
async fn unknown_messages_are_ignored() {
    let h = Harness::new();
    h.container.register(small_config()).await.unwrap();

    for raw in [r#"{"type":"FORMAT_DISK"}"#, r#"{"payload":{}}"#, "garbage"] {
        let reply = h
            .container
            .post_raw_message(MessageTarget::Active, raw)
            .await
            .unwrap();
        assert_eq!(reply, None);
    }
    assert!(h.container.controller().await.is_some());
}
