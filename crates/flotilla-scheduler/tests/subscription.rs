//! Subscription lifecycle against a fake master: handshake, event
//! delivery, redirects, reconnects and stalls.

mod common;

use std::time::Duration;

use common::{FakeMaster, ProbeReply, SubscribeReply, config, subscribed_event, wait_for};
use flotilla_core::CallType;
use flotilla_scheduler::{Notification, Scheduler, SchedulerError};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::time::Instant;

#[tokio::test]
async fn subscribe_delivers_events() {
    let mut master = FakeMaster::start().await;
    let scheduler = Scheduler::builder(config(&master, ""))
        .start()
        .await
        .unwrap();
    let (handle, mut rx, _task) = scheduler.into_parts();
    assert!(matches!(rx.recv().await, Some(Notification::Ready)));

    handle.subscribe().unwrap();
    let mut sub = master.next_subscription().await;
    assert_eq!(sub.request.method, "POST");
    assert_eq!(sub.request.path, "/api/v1/scheduler");
    assert_eq!(sub.request.call_type(), "SUBSCRIBE");
    assert_eq!(sub.request.body["subscribe"]["framework_info"]["name"], "fw");
    assert!(sub.request.body.get("framework_id").is_none());

    let connected = wait_for(&mut rx, |n| matches!(n, Notification::Connected { .. })).await;
    assert!(matches!(connected, Notification::Connected { stream_id } if stream_id == "stream-1"));

    sub.send(subscribed_event("fw-1")).await;
    match wait_for(&mut rx, |n| matches!(n, Notification::Subscribed { .. })).await {
        Notification::Subscribed {
            framework_id,
            stream_id,
        } => {
            assert_eq!(framework_id, "fw-1");
            assert_eq!(stream_id.as_deref(), Some("stream-1"));
        }
        other => panic!("unexpected {other:?}"),
    }

    sub.send(json!({ "type": "HEARTBEAT" })).await;
    wait_for(&mut rx, |n| matches!(n, Notification::Heartbeat { .. })).await;
}

#[tokio::test]
async fn frames_split_across_chunks() {
    let mut master = FakeMaster::start().await;
    let scheduler = Scheduler::builder(config(&master, "")).start().await.unwrap();
    let (handle, mut rx, _task) = scheduler.into_parts();
    handle.subscribe().unwrap();
    let mut sub = master.next_subscription().await;

    let heartbeat = flotilla_scheduler::recordio::encode(br#"{"type":"HEARTBEAT"}"#);
    let subscribed = flotilla_scheduler::recordio::encode(
        &serde_json::to_vec(&subscribed_event("fw-1")).unwrap(),
    );
    let mut bytes = subscribed;
    bytes.extend_from_slice(&heartbeat);
    let (head, tail) = bytes.split_at(7);
    sub.send_raw(head).await;
    sub.send_raw(tail).await;

    wait_for(&mut rx, |n| matches!(n, Notification::Subscribed { .. })).await;
    wait_for(&mut rx, |n| matches!(n, Notification::Heartbeat { .. })).await;
}

#[tokio::test]
async fn unparseable_event_keeps_stream() {
    let mut master = FakeMaster::start().await;
    let scheduler = Scheduler::builder(config(&master, "")).start().await.unwrap();
    let (handle, mut rx, _task) = scheduler.into_parts();
    handle.subscribe().unwrap();
    let mut sub = master.next_subscription().await;

    sub.send_raw(&flotilla_scheduler::recordio::encode(b"{oops")).await;
    wait_for(&mut rx, |n| {
        matches!(n, Notification::Error(SchedulerError::Protocol(_)))
    })
    .await;

    sub.send(json!({ "type": "HEARTBEAT" })).await;
    wait_for(&mut rx, |n| matches!(n, Notification::Heartbeat { .. })).await;
    assert_eq!(master.subscribe_count(), 1);
}

#[tokio::test]
async fn redirect_is_followed() {
    let mut leader = FakeMaster::start().await;
    let follower = FakeMaster::start().await;
    follower.script(SubscribeReply::Redirect(format!(
        "//127.0.0.1:{}/api/v1/scheduler",
        leader.addr.port()
    )));

    let scheduler = Scheduler::builder(config(&follower, "")).start().await.unwrap();
    let (handle, mut rx, _task) = scheduler.into_parts();
    handle.subscribe().unwrap();

    let mut sub = leader.next_subscription().await;
    assert_eq!(follower.subscribe_count(), 1);
    wait_for(&mut rx, |n| matches!(n, Notification::Connected { .. })).await;

    // Calls go to the leader too.
    sub.send(subscribed_event("fw-1")).await;
    wait_for(&mut rx, |n| matches!(n, Notification::Subscribed { .. })).await;
    handle.revive().unwrap();
    let call = leader.next_call_of("REVIVE").await;
    assert_eq!(call.headers.get("mesos-stream-id").map(String::as_str), Some("stream-1"));
}

#[tokio::test]
async fn stream_end_resubscribes_with_framework_id() {
    let mut master = FakeMaster::start().await;
    let scheduler = Scheduler::builder(config(&master, "")).start().await.unwrap();
    let (handle, mut rx, _task) = scheduler.into_parts();
    handle.subscribe().unwrap();

    let mut sub = master.next_subscription().await;
    sub.send(subscribed_event("fw-1")).await;
    wait_for(&mut rx, |n| matches!(n, Notification::Subscribed { .. })).await;

    // Streams that end before any heartbeat: the first reconnect is
    // immediate, then the delay grows 1000ms, 1500ms.
    let mut previous = sub;
    for (round, min_delay) in [(2, 0), (3, 1000), (4, 1500)] {
        let closed_at = Instant::now();
        previous.close().await;
        wait_for(&mut rx, |n| {
            matches!(n, Notification::Error(SchedulerError::Transport(_)))
        })
        .await;

        let again = master.next_subscription().await;
        let waited = closed_at.elapsed();
        assert!(
            waited >= Duration::from_millis(min_delay),
            "round {round} resubscribed after {waited:?}"
        );
        if min_delay == 0 {
            assert!(waited < Duration::from_millis(900), "round {round} waited {waited:?}");
        }
        assert_eq!(again.request.body["framework_id"]["value"], "fw-1");
        assert_eq!(
            again.request.body["subscribe"]["framework_info"]["id"]["value"],
            "fw-1"
        );
        match wait_for(&mut rx, |n| matches!(n, Notification::Connected { .. })).await {
            Notification::Connected { stream_id } => {
                assert_eq!(stream_id, format!("stream-{round}"))
            }
            other => panic!("unexpected {other:?}"),
        }
        previous = again;
    }
    assert_eq!(master.subscribe_count(), 4);
}

#[tokio::test]
async fn unreachable_master_on_subscribe_is_not_retried() {
    let master = FakeMaster::start().await;
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let closed_port = listener.local_addr().unwrap().port();
    drop(listener);
    let mut config = config(&master, "");
    config.master.port = closed_port;

    let scheduler = Scheduler::builder(config).start().await.unwrap();
    let (handle, mut rx, _task) = scheduler.into_parts();
    handle.subscribe().unwrap();

    let is_transport = |n: &Notification| matches!(n, Notification::Error(SchedulerError::Transport(_)));
    wait_for(&mut rx, is_transport).await;

    // A backoff reconnect would fire immediately and fail the same way.
    let retried = tokio::time::timeout(Duration::from_millis(500), wait_for(&mut rx, is_transport)).await;
    assert!(retried.is_err());
    assert!(handle.launched_tasks().await.unwrap().is_empty());
}

#[tokio::test]
async fn missing_stream_id_is_not_retried() {
    let mut master = FakeMaster::start().await;
    master.script(SubscribeReply::MissingStreamId);
    let scheduler = Scheduler::builder(config(&master, "")).start().await.unwrap();
    let (handle, mut rx, _task) = scheduler.into_parts();
    handle.subscribe().unwrap();

    wait_for(&mut rx, |n| {
        matches!(n, Notification::Error(SchedulerError::Protocol(_)))
    })
    .await;
    assert!(master.subscription_within(Duration::from_millis(300)).await.is_none());
    assert_eq!(master.subscribe_count(), 1);

    // An explicit subscribe tries again.
    handle.subscribe().unwrap();
    master.next_subscription().await;
}

#[tokio::test]
async fn rejected_subscribe_surfaces_status() {
    let master = FakeMaster::start().await;
    master.script(SubscribeReply::Status(401));
    let scheduler = Scheduler::builder(config(&master, "")).start().await.unwrap();
    let (handle, mut rx, _task) = scheduler.into_parts();
    handle.subscribe().unwrap();

    match wait_for(&mut rx, |n| matches!(n, Notification::Error(_))).await {
        Notification::Error(SchedulerError::CallRejected { call, status, body }) => {
            assert_eq!(call, CallType::Subscribe);
            assert_eq!(status, 401);
            assert_eq!(body, "rejected");
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn stall_follows_probe_redirect() {
    let mut stalled = FakeMaster::start().await;
    let mut leader = FakeMaster::start().await;
    stalled.set_probe(ProbeReply::Redirect(format!("//127.0.0.1:{}", leader.addr.port())));

    let mut config = config(&stalled, "");
    config.master.idle_timeout = Duration::from_millis(200);
    let scheduler = Scheduler::builder(config).start().await.unwrap();
    let (handle, _rx, _task) = scheduler.into_parts();
    handle.subscribe().unwrap();

    let _silent = stalled.next_subscription().await;
    leader.next_subscription().await;
}

#[tokio::test]
async fn stall_without_leader_ends_loop() {
    let mut master = FakeMaster::start().await;
    master.set_probe(ProbeReply::Hang);

    let mut config = config(&master, "");
    config.master.idle_timeout = Duration::from_millis(200);
    config.master.request_timeout = Duration::from_millis(200);
    let scheduler = Scheduler::builder(config).start().await.unwrap();
    let (handle, mut rx, task) = scheduler.into_parts();
    handle.subscribe().unwrap();
    let _silent = master.next_subscription().await;

    wait_for(&mut rx, |n| {
        matches!(n, Notification::Error(SchedulerError::LeaderLost(_)))
    })
    .await;
    let result = tokio::time::timeout(common::WAIT, task).await.unwrap().unwrap();
    assert!(matches!(result, Err(SchedulerError::LeaderLost(_))));
}

#[tokio::test]
async fn stall_on_discovery_host_resubscribes() {
    let mut master = FakeMaster::start().await;
    master.set_probe(ProbeReply::Hang);

    let mut config = config(&master, "");
    config.master.discovery_host = "127.0.0.1".to_string();
    config.master.idle_timeout = Duration::from_millis(200);
    let scheduler = Scheduler::builder(config).start().await.unwrap();
    let (handle, _rx, _task) = scheduler.into_parts();
    handle.subscribe().unwrap();

    let _first = master.next_subscription().await;
    let _second = master.next_subscription().await;
    assert!(master.subscribe_count() >= 2);
}
