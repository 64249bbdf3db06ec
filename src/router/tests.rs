use super::*;
use crate::bus::ChannelBroker;
use bytes::Bytes;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::timeout;

fn connect(broker: &ChannelBroker) -> Connection {
    Connection::new(Arc::new(broker.connect().unwrap()))
}

fn echo() -> impl ReplyHandler {
    respond_fn(|request: Envelope| async move {
        Ok(Envelope::new()
            .with_status(200)
            .with("echo", request.get_str("name").unwrap_or_default()))
    })
}

fn failing() -> impl ReplyHandler {
    handler_fn(|_request, _connection| async move {
        Err(BridgeError::Protocol("name is required".to_string()))
    })
}

/// Caller-side helper: subscribe to the reply topic, publish, await one reply.
async fn roundtrip(caller: &Connection, topic: &str, request: Envelope) -> Option<Envelope> {
    let reply_topic = request.reply_topic().unwrap_or_default().to_string();
    caller.subscribe(&reply_topic).await.unwrap();
    let mut messages = caller.messages();
    caller.publish(topic, &request).await.unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_millis(500);
    loop {
        let message = tokio::time::timeout_at(deadline, messages.recv())
            .await
            .ok()?
            .ok()?;
        if message.topic == reply_topic {
            return Envelope::from_slice(&message.topic, &message.payload).ok();
        }
    }
}

fn request(id: &str, topic: &str) -> Envelope {
    Envelope::new()
        .with_correlation_id(id)
        .with_reply_topic(format!("{}/{}", topic, id))
        .with("name", "x")
}

#[test]
fn test_builder_rejects_duplicate_topic() {
    let result = RouterBuilder::new()
        .register("user/test", echo())
        .and_then(|b| b.register("user/test", echo()));

    assert!(matches!(
        result,
        Err(BridgeError::DuplicateTopic(ref topic)) if topic == "user/test"
    ));
}

#[test]
fn test_bundles_merge_and_collide() {
    let user: HandlerBundle = vec![
        ("user/test".to_string(), Arc::new(echo()) as Arc<dyn ReplyHandler>),
        ("POST/users".to_string(), Arc::new(echo()) as Arc<dyn ReplyHandler>),
    ];
    let admin: HandlerBundle = vec![("admin/test".to_string(), Arc::new(echo()) as Arc<dyn ReplyHandler>)];

    let router = RouterBuilder::new()
        .bundle(user)
        .and_then(|b| b.bundle(admin))
        .unwrap()
        .build();
    assert_eq!(
        router.topics().collect::<Vec<_>>(),
        vec!["POST/users", "admin/test", "user/test"]
    );

    let clash: HandlerBundle = vec![("admin/test".to_string(), Arc::new(echo()) as Arc<dyn ReplyHandler>)];
    let result = RouterBuilder::new()
        .register("admin/test", echo())
        .and_then(|b| b.bundle(clash));
    assert!(matches!(result, Err(BridgeError::DuplicateTopic(_))));
}

#[tokio::test]
async fn test_start_subscribes_and_handles() {
    let broker = ChannelBroker::new();
    let router = RouterBuilder::new()
        .register("user/test", echo())
        .unwrap()
        .register("POST/users", echo())
        .unwrap()
        .build();
    let handle = router.start(connect(&broker)).await.unwrap();
    assert_eq!(handle.topics().len(), 2);
    assert_eq!(broker.subscription_count(), 2);

    let caller = connect(&broker);
    let reply = roundtrip(&caller, "POST/users", request("abc", "POST/users"))
        .await
        .expect("reply");
    assert_eq!(reply.correlation_id(), Some("abc"));
    assert_eq!(reply.status(), Some(200));
    assert_eq!(reply.get_str("echo"), Some("x"));
}

#[tokio::test]
async fn test_start_failure_releases_subscriptions() {
    let broker = ChannelBroker::new();
    broker.set_fail_on_subscribe(true);
    let router = RouterBuilder::new()
        .register("chat/test", echo())
        .unwrap()
        .build();

    let result = router.start(connect(&broker)).await;
    assert!(matches!(result, Err(BridgeError::Subscription { .. })));
    assert_eq!(broker.subscription_count(), 0);
}

#[tokio::test]
async fn test_malformed_message_dropped() {
    let broker = ChannelBroker::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let router = RouterBuilder::new()
        .register(
            "ad/test",
            handler_fn(move |request: Envelope, connection: Connection| {
                counter.fetch_add(1, Ordering::SeqCst);
                async move { connection.reply(&request, Envelope::new().with_status(200)).await }
            }),
        )
        .unwrap()
        .build();
    let _handle = router.start(connect(&broker)).await.unwrap();

    let caller = connect(&broker);
    caller
        .publish_bytes("ad/test", Bytes::from_static(b"not json"))
        .await
        .unwrap();

    // The router keeps serving after the bad message
    let reply = roundtrip(&caller, "ad/test", request("abc", "ad/test")).await;
    assert!(reply.is_some());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_handler_error_becomes_error_reply() {
    let broker = ChannelBroker::new();
    let router = RouterBuilder::new()
        .register("user/test", failing())
        .unwrap()
        .build();
    let _handle = router.start(connect(&broker)).await.unwrap();

    let caller = connect(&broker);
    let reply = roundtrip(&caller, "user/test", request("abc", "user/test"))
        .await
        .expect("error reply");

    assert_eq!(reply.correlation_id(), Some("abc"));
    assert_eq!(reply.status(), Some(HANDLER_FAILURE_STATUS));
    assert!(reply
        .error_message()
        .unwrap_or_default()
        .contains("name is required"));
}

#[tokio::test]
async fn test_handler_panic_becomes_error_reply() {
    let broker = ChannelBroker::new();
    let router = RouterBuilder::new()
        .register(
            "notification/test",
            handler_fn(|_request, _connection| async move {
                if true {
                    panic!("boom");
                }
                Ok(())
            }),
        )
        .unwrap()
        .build();
    let handle = router.start(connect(&broker)).await.unwrap();

    let caller = connect(&broker);
    let reply = roundtrip(
        &caller,
        "notification/test",
        request("abc", "notification/test"),
    )
    .await
    .expect("error reply");
    assert_eq!(reply.status(), Some(HANDLER_FAILURE_STATUS));
    assert_eq!(reply.error_message(), Some("handler panicked"));

    // The worker survives the panic
    assert!(!handle.is_finished());
}

#[tokio::test]
async fn test_panic_before_future_becomes_error_reply() {
    let broker = ChannelBroker::new();
    let router = RouterBuilder::new()
        .register(
            "user/test",
            respond_fn(|request: Envelope| {
                // Panics in the closure body, before any future exists
                let name = request.get_str("missing").map(str::to_string).unwrap();
                async move { Ok(Envelope::new().with_status(200).with("name", name)) }
            }),
        )
        .unwrap()
        .build();
    let handle = router.start(connect(&broker)).await.unwrap();

    let caller = connect(&broker);
    let reply = roundtrip(&caller, "user/test", request("abc", "user/test"))
        .await
        .expect("error reply");
    assert_eq!(reply.correlation_id(), Some("abc"));
    assert_eq!(reply.status(), Some(HANDLER_FAILURE_STATUS));
    assert_eq!(reply.error_message(), Some("handler panicked"));
    assert!(!handle.is_finished());
}

#[tokio::test]
async fn test_error_before_future_becomes_error_reply() {
    let broker = ChannelBroker::new();
    let router = RouterBuilder::new()
        .register(
            "chat/test",
            handler_fn(|request: Envelope, _connection: Connection| {
                let checked = request
                    .get_str("message")
                    .map(|_| ())
                    .ok_or_else(|| BridgeError::Protocol("message is required".to_string()));
                async move { checked }
            }),
        )
        .unwrap()
        .build();
    let _handle = router.start(connect(&broker)).await.unwrap();

    let caller = connect(&broker);
    let reply = roundtrip(&caller, "chat/test", request("abc", "chat/test"))
        .await
        .expect("error reply");
    assert_eq!(reply.status(), Some(HANDLER_FAILURE_STATUS));
    assert!(reply
        .error_message()
        .unwrap_or_default()
        .contains("message is required"));
}

#[tokio::test]
async fn test_wildcard_registration_routes_requests() {
    let broker = ChannelBroker::new();
    let router = RouterBuilder::new()
        .register("POST/+", echo())
        .unwrap()
        .register(
            "POST/users",
            respond_fn(|_request: Envelope| async move {
                Ok(Envelope::new().with_status(201).with("echo", "exact"))
            }),
        )
        .unwrap()
        .build();
    let _handle = router.start(connect(&broker)).await.unwrap();

    let caller = connect(&broker);
    let reply = roundtrip(&caller, "POST/orders", request("abc", "POST/orders"))
        .await
        .expect("reply from filter handler");
    assert_eq!(reply.status(), Some(200));
    assert_eq!(reply.get_str("echo"), Some("x"));

    let reply = roundtrip(&caller, "POST/users", request("def", "POST/users"))
        .await
        .expect("reply from exact handler");
    assert_eq!(reply.status(), Some(201));
    assert_eq!(reply.get_str("echo"), Some("exact"));
}

#[test]
fn test_find_handler_prefers_exact_topic() {
    let handlers: Handlers = Arc::new(
        [
            ("#".to_string(), Arc::new(echo()) as Arc<dyn ReplyHandler>),
            ("user/test".to_string(), Arc::new(failing()) as Arc<dyn ReplyHandler>),
        ]
        .into_iter()
        .collect(),
    );

    let exact = find_handler(&handlers, "user/test").unwrap();
    assert!(Arc::ptr_eq(exact, &handlers["user/test"]));
    let filtered = find_handler(&handlers, "chat/test").unwrap();
    assert!(Arc::ptr_eq(filtered, &handlers["#"]));
    assert!(find_handler(&Arc::new(BTreeMap::new()), "chat/test").is_none());
}

#[tokio::test]
async fn test_handler_error_without_reply_topic_sends_nothing() {
    let broker = ChannelBroker::new();
    let router = RouterBuilder::new()
        .register("admin/test", failing())
        .unwrap()
        .build();
    let _handle = router.start(connect(&broker)).await.unwrap();

    let caller = connect(&broker);
    caller.subscribe("#").await.unwrap();
    let mut messages = caller.messages();
    caller
        .publish("admin/test", &Envelope::new().with_correlation_id("abc"))
        .await
        .unwrap();

    // Our own request echoes back through the wildcard, nothing else follows
    let first = timeout(Duration::from_millis(100), messages.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.topic, "admin/test");
    assert!(timeout(Duration::from_millis(100), messages.recv())
        .await
        .is_err());
    assert_eq!(broker.published_count(), 1);
}

#[tokio::test]
async fn test_shutdown_unsubscribes() {
    let broker = ChannelBroker::new();
    let router = RouterBuilder::new()
        .register("chat/test", echo())
        .unwrap()
        .build();
    let handle = router.start(connect(&broker)).await.unwrap();
    assert_eq!(broker.subscription_count(), 1);

    handle.shutdown().await;
    assert_eq!(broker.subscription_count(), 0);

    let caller = connect(&broker);
    assert!(roundtrip(&caller, "chat/test", request("abc", "chat/test"))
        .await
        .is_none());
}
