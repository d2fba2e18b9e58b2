mod common;

use alink_client::{Error, Features, Qos, Routed};
use alink_core::{DeviceIdentity, DeviceKey, LifecycleState};
use alink_proto::{ops, PushKind, TopicLayout};
use common::{root, settle, setup, setup_with, StubReply, TIMEOUT};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[tokio::test]
async fn call_returns_data_when_reply_arrives_in_time() {
    let (stub, session) = setup();
    stub.on("thing.event.property.post", |_| {
        Some(StubReply::code(0).after(Duration::from_millis(50)))
    });

    let data = session
        .call(&ops::PROPERTY_POST, &root(), json!({"temp": 21}), TIMEOUT)
        .await
        .unwrap();

    assert_eq!(data, json!({}));
    assert!(session.pending().is_empty());

    let sent = stub.published_on("/sys/PK1/DN1/thing/event/property/post");
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].body["params"]["temp"], 21);
    assert_eq!(sent[0].body["version"], "1.0");
    assert!(sent[0].body["id"].is_string());
    assert_eq!(sent[0].qos, Qos::AtLeastOnce);
}

#[tokio::test]
async fn call_times_out_when_nobody_replies() {
    let (_stub, session) = setup();

    let started = Instant::now();
    let err = session
        .call(&ops::PROPERTY_POST, &root(), json!({"temp": 21}), TIMEOUT)
        .await
        .unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(err, Error::Timeout(_)), "{err:?}");
    assert!(elapsed >= TIMEOUT);
    assert!(elapsed < TIMEOUT + Duration::from_millis(500), "{elapsed:?}");
    assert!(session.pending().is_empty());
}

#[tokio::test]
async fn overlapping_calls_resolve_independently() {
    let (stub, session) = setup();
    stub.on("thing.event.property.post", |params| {
        let n = params["n"].as_u64()?;
        // The first request is answered last.
        let delay = Duration::from_millis(if n == 1 { 150 } else { 10 });
        Some(StubReply::ok(json!({ "n": n })).after(delay))
    });

    let op = ops::PROPERTY_POST;
    let device = root();
    let (first, second) = tokio::join!(
        session.call(&op, &device, json!({"n": 1}), TIMEOUT),
        session.call(&op, &device, json!({"n": 2}), TIMEOUT),
    );

    assert_eq!(first.unwrap()["n"], 1);
    assert_eq!(second.unwrap()["n"], 2);
    assert!(session.pending().is_empty());
}

#[tokio::test]
async fn unbounded_timeout_still_resolves() {
    let (stub, session) = setup();
    stub.on("thing.event.property.post", |_| Some(StubReply::code(200)));

    let data = session
        .call(&ops::PROPERTY_POST, &root(), json!({}), Duration::MAX)
        .await
        .unwrap();

    assert_eq!(data, json!({}));
    assert_eq!(session.pending().sweep(), 0);
    assert!(session.pending().is_empty());
}

#[tokio::test]
async fn remote_rejection_is_distinct_from_timeout() {
    let (stub, session) = setup();
    stub.on("thing.config.get", |_| Some(StubReply::code(460)));

    let err = session.get_config(&root(), TIMEOUT).await.unwrap_err();
    assert_eq!(err.remote_code(), Some(460));
    assert!(!err.is_timeout());
}

#[tokio::test]
async fn publish_failure_leaves_no_waiter() {
    let (stub, session) = setup();
    stub.fail_publishes(true);

    let err = session
        .post_properties(&root(), json!({"temp": 21}), TIMEOUT)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Transport(_)), "{err:?}");
    assert!(session.pending().is_empty());
}

#[tokio::test]
async fn event_post_uses_identifier_topic() {
    let (stub, session) = setup();
    stub.accept("thing.event.overheat.post");

    session
        .post_event(&root(), "overheat", json!({"temp": 90}), TIMEOUT)
        .await
        .unwrap();
    let sent = stub.published_on("/sys/PK1/DN1/thing/event/overheat/post");
    assert_eq!(sent[0].body["params"]["value"]["temp"], 90);

    assert!(matches!(
        session.post_event(&root(), "a/b", json!({}), TIMEOUT).await,
        Err(Error::InvalidParameter(_))
    ));
}

#[tokio::test]
async fn calls_for_unusable_sub_devices_fail_fast() {
    let (stub, session) = setup();
    let sub = DeviceKey::new("PK2", "sensor");

    assert!(matches!(
        session.post_properties(&sub, json!({}), TIMEOUT).await,
        Err(Error::NotFound(_))
    ));

    session
        .registry()
        .add(DeviceIdentity::new("PK2", "sensor", "s"))
        .unwrap();
    assert!(matches!(
        session.post_properties(&sub, json!({}), TIMEOUT).await,
        Err(Error::NotActive(_))
    ));

    session
        .registry()
        .set_state(&sub, LifecycleState::Online)
        .unwrap();
    session.registry().set_available(&sub, false).unwrap();
    assert!(matches!(
        session.post_properties(&sub, json!({}), TIMEOUT).await,
        Err(Error::NotAvailable(_))
    ));

    assert!(stub.published().is_empty());
}

#[tokio::test]
async fn dispatch_reports_bad_topics_without_failing() {
    let (_stub, session) = setup();

    assert!(matches!(
        session.dispatch("/sys/PK1", b"{}"),
        Err(Error::InvalidTopic(_))
    ));
    assert!(matches!(
        session.dispatch("/sys/PK1/DN1/thing/unknown", b"{}"),
        Err(Error::Unroutable(_))
    ));
    assert!(matches!(
        session.dispatch("/sys/PK1/DN1/thing/event/property/post_reply", b"garbage"),
        Err(Error::Decode(_))
    ));

    // A late reply with no waiter is drained.
    assert_eq!(
        session
            .dispatch(
                "/sys/PK1/DN1/thing/event/property/post_reply",
                br#"{"id":"99","code":200,"data":{}}"#,
            )
            .unwrap(),
        Routed::Reply {
            id: alink_proto::RequestId(99),
            matched: false
        }
    );
}

#[tokio::test]
async fn disable_push_updates_registry_and_is_acknowledged() {
    let (stub, session) = setup();
    session
        .registry()
        .add(DeviceIdentity::new("PK2", "sensor", "s"))
        .unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    session.on(PushKind::Disable, move |event| {
        sink.lock().push(event.device.clone());
    });

    let routed = session
        .dispatch(
            "/sys/PK2/sensor/thing/disable",
            br#"{"id":"17","version":"1.0","method":"thing.disable","params":{}}"#,
        )
        .unwrap();
    assert_eq!(
        routed,
        Routed::Push {
            kind: PushKind::Disable,
            handled: true
        }
    );

    let key = DeviceKey::new("PK2", "sensor");
    assert!(!session.registry().get(&key).unwrap().available);
    assert_eq!(*seen.lock(), vec![key.clone()]);

    settle().await;
    let acks = stub.published_on("/sys/PK2/sensor/thing/disable_reply");
    assert_eq!(acks.len(), 1);
    assert_eq!(acks[0].body["id"], "17");
    assert_eq!(acks[0].body["code"], 200);

    session
        .dispatch(
            "/sys/PK2/sensor/thing/enable",
            br#"{"id":"18","method":"thing.enable","params":{}}"#,
        )
        .unwrap();
    assert!(session.registry().get(&key).unwrap().available);
}

#[tokio::test]
async fn topology_pushes_track_sub_devices() {
    let (_stub, session) = setup();

    session
        .dispatch(
            "/sys/PK1/DN1/thing/topo/add/notify",
            br#"{"id":"1","method":"thing.topo.add.notify","params":[{"productKey":"PK2","deviceName":"a"}]}"#,
        )
        .unwrap();
    let a = DeviceKey::new("PK2", "a");
    assert_eq!(
        session.registry().get(&a).unwrap().state,
        LifecycleState::Authorized
    );

    session
        .dispatch(
            "/sys/PK1/DN1/thing/topo/change",
            br#"{"id":"2","method":"thing.topo.change","params":{"status":0,"subList":[{"productKey":"PK2","deviceName":"a"},{"productKey":"PK2","deviceName":"b"}]}}"#,
        )
        .unwrap();
    let b = DeviceKey::new("PK2", "b");
    assert_eq!(session.registry().get(&a).unwrap().state, LifecycleState::Attached);
    assert_eq!(session.registry().get(&b).unwrap().state, LifecycleState::Attached);

    session
        .dispatch(
            "/sys/PK1/DN1/thing/topo/change",
            br#"{"id":"3","params":{"status":8,"subList":[{"productKey":"PK2","deviceName":"a"}]}}"#,
        )
        .unwrap();
    assert!(!session.registry().get(&a).unwrap().available);

    session
        .dispatch(
            "/sys/PK1/DN1/thing/topo/change",
            br#"{"id":"4","params":{"status":1,"subList":[{"productKey":"PK2","deviceName":"b"}]}}"#,
        )
        .unwrap();
    assert!(!session.registry().contains(&b));

    // The gateway itself is never removed.
    session
        .dispatch("/sys/PK1/DN1/thing/delete", br#"{"id":"5","params":{}}"#)
        .unwrap();
    assert!(session.registry().contains(&root()));
}

#[tokio::test]
async fn unhandled_pushes_are_ignored() {
    let (_stub, session) = setup();
    let routed = session
        .dispatch(
            "/sys/PK1/DN1/thing/service/reboot",
            br#"{"id":"6","method":"thing.service.reboot","params":{}}"#,
        )
        .unwrap();
    assert_eq!(
        routed,
        Routed::Push {
            kind: PushKind::ServiceCall,
            handled: false
        }
    );
}

#[tokio::test]
async fn ntp_probe_and_response() {
    let (stub, session) = setup();
    let server_time = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&server_time);
    session.on(PushKind::NtpResponse, move |event| {
        *sink.lock() = event.server_time_ms();
    });

    session.request_ntp().await.unwrap();
    let probe = stub.published_on("/ext/ntp/PK1/DN1/request");
    assert_eq!(probe.len(), 1);
    assert_eq!(probe[0].qos, Qos::AtMostOnce);
    assert!(probe[0].body["deviceSendTime"].is_string());

    session
        .dispatch(
            "/ext/ntp/PK1/DN1/response",
            br#"{"deviceSendTime":"1000","serverRecvTime":"1600","serverSendTime":"1610"}"#,
        )
        .unwrap();
    let estimate = (*server_time.lock()).expect("ntp handler ran");
    assert!(estimate > 1610);
}

#[tokio::test]
async fn disabled_features_are_reported() {
    let (_stub, session) = setup_with(
        TopicLayout::mqtt(),
        Features {
            gateway: false,
            ntp: false,
        },
    );
    assert!(matches!(
        session.request_ntp().await,
        Err(Error::NotSupportedFeature("ntp"))
    ));
    assert!(matches!(
        alink_client::Gateway::new(session.clone()),
        Err(Error::NotSupportedFeature("gateway"))
    ));

    session.subscribe_device(&root()).await.unwrap();
}

#[tokio::test]
async fn bridged_layout_shifts_every_segment() {
    let (stub, session) = setup_with(TopicLayout::bridged(), Features::default());
    stub.accept("thing.event.property.post");

    session
        .post_properties(&root(), json!({"temp": 21}), TIMEOUT)
        .await
        .unwrap();
    assert_eq!(
        stub.published()[0].topic,
        "/topic/sys/PK1/DN1/thing/event/property/post"
    );

    session.subscribe_device(&root()).await.unwrap();
    assert!(stub
        .subscribed()
        .iter()
        .all(|topic| topic.starts_with("/topic/")));

    // Without the root segment the topic is not ours.
    assert!(matches!(
        session.dispatch("/sys/PK1/DN1/thing/disable", b"{}"),
        Err(Error::InvalidTopic(_))
    ));
    let routed = session
        .dispatch(
            "/topic/sys/PK1/DN1/thing/service/property/set",
            br#"{"id":"8","params":{"temp":30}}"#,
        )
        .unwrap();
    assert!(matches!(
        routed,
        Routed::Push {
            kind: PushKind::PropertySet,
            ..
        }
    ));
}

#[tokio::test]
async fn handlers_can_answer_pushes() {
    let (stub, session) = setup();
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    session.on(PushKind::PropertySet, move |event| sink.lock().push(event.clone()));

    session
        .dispatch(
            "/sys/PK1/DN1/thing/service/property/set",
            br#"{"id":"21","method":"thing.service.property.set","params":{"LightSwitch":1}}"#,
        )
        .unwrap();
    let event = events.lock()[0].clone();
    assert_eq!(event.params["LightSwitch"], 1);

    session.reply_push(&event, 200, Value::Null).await.unwrap();
    let replies = stub.published_on("/sys/PK1/DN1/thing/service/property/set_reply");
    assert_eq!(replies[0].body["id"], "21");
}
