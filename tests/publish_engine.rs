mod common;

use std::time::Duration;

use tokio::sync::mpsc;

use common::{created, data, keep_alive, parameters, publish_response, PublishReply, ScriptedPublisher};
use uasc::config::PublishConfig;
use uasc::messages::{PublishRequest, SubscriptionAcknowledgement};
use uasc::subscription::{PublishEngine, Subscription, SubscriptionEvent};

type Requests = mpsc::UnboundedReceiver<(PublishRequest, PublishReply)>;

fn config(depth: u32) -> PublishConfig {
    PublishConfig {
        pipeline_depth: depth,
        max_publish_requests: 25,
        channel_poll_interval_ms: 100,
    }
}

fn subscription(
    id: u32,
    interval_ms: f64,
    keep_alive: u32,
) -> (Subscription, mpsc::UnboundedReceiver<SubscriptionEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let subscription = Subscription::from_response(
        parameters(interval_ms, keep_alive),
        &created(id, interval_ms, keep_alive),
        tx,
    );
    (subscription, rx)
}

async fn next_request(requests: &mut Requests) -> (PublishRequest, PublishReply) {
    tokio::time::timeout(Duration::from_secs(5), requests.recv())
        .await
        .expect("publish request issued")
        .expect("publisher alive")
}

fn drain(requests: &mut Requests) -> Vec<(PublishRequest, PublishReply)> {
    let mut drained = Vec::new();
    while let Ok(request) = requests.try_recv() {
        drained.push(request);
    }
    drained
}

#[tokio::test(start_paused = true)]
async fn pipeline_fills_to_depth_with_scaled_timeout_hints() {
    let (publisher, mut requests) = ScriptedPublisher::new();
    let engine = PublishEngine::new(publisher, config(5));
    let (first, _first_events) = subscription(1, 1000.0, 10);
    let (second, _second_events) = subscription(2, 1000.0, 10);
    engine.register(first);
    engine.register(second);

    tokio::time::sleep(Duration::from_millis(4_500)).await;
    // Replies stay unanswered but alive for the whole test.
    let pending = drain(&mut requests);
    assert_eq!(pending.len(), 10);
    assert_eq!(engine.outstanding(), 10);
    assert_eq!(engine.outstanding_for(1), 5);
    assert_eq!(engine.outstanding_for(2), 5);

    let mut hints: Vec<u32> = pending
        .iter()
        .map(|(request, _)| request.request_header.timeout_hint)
        .collect();
    hints.sort_unstable();
    assert_eq!(
        hints,
        vec![10_000, 10_000, 20_000, 20_000, 30_000, 30_000, 40_000, 40_000, 50_000, 50_000]
    );
}

#[tokio::test]
async fn acknowledgement_rides_on_the_next_request() {
    let (publisher, mut requests) = ScriptedPublisher::new();
    let engine = PublishEngine::new(publisher, config(1));
    let (sub, mut events) = subscription(7, 500.0, 3);
    engine.register(sub);

    let (first, reply) = next_request(&mut requests).await;
    assert!(first.subscription_acknowledgements.is_empty());
    reply
        .send(Ok(publish_response(7, data(1))))
        .expect("engine waiting");

    let (second, _reply) = next_request(&mut requests).await;
    // The owner got the notification before the acknowledgement went out.
    match events.try_recv().expect("notification delivered") {
        SubscriptionEvent::Notification {
            subscription_id,
            message,
        } => {
            assert_eq!(subscription_id, 7);
            assert_eq!(message.sequence_number, 1);
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert_eq!(
        second.subscription_acknowledgements,
        vec![SubscriptionAcknowledgement {
            subscription_id: 7,
            sequence_number: 1,
        }]
    );
    assert_eq!(engine.last_sequence_number(7), Some(1));
}

#[tokio::test]
async fn keep_alive_is_reported_but_not_acknowledged() {
    let (publisher, mut requests) = ScriptedPublisher::new();
    let engine = PublishEngine::new(publisher, config(1));
    let (sub, mut events) = subscription(3, 500.0, 3);
    engine.register(sub);

    let (_, reply) = next_request(&mut requests).await;
    reply
        .send(Ok(publish_response(3, keep_alive(4))))
        .expect("engine waiting");
    let (next, _reply) = next_request(&mut requests).await;

    assert!(next.subscription_acknowledgements.is_empty());
    assert_eq!(
        events.try_recv().expect("keep-alive delivered"),
        SubscriptionEvent::KeepAlive {
            subscription_id: 3,
            sequence_number: 4,
        }
    );
    assert_eq!(engine.last_sequence_number(3), Some(0));
}

#[tokio::test]
async fn duplicate_notifications_reach_the_owner_once() {
    let (publisher, mut requests) = ScriptedPublisher::new();
    let engine = PublishEngine::new(publisher, config(1));
    let (sub, mut events) = subscription(5, 500.0, 3);
    engine.register(sub);

    for sequence_number in [1, 2, 2, 3] {
        let (_, reply) = next_request(&mut requests).await;
        reply
            .send(Ok(publish_response(5, data(sequence_number))))
            .expect("engine waiting");
    }
    let (_, _reply) = next_request(&mut requests).await;

    let mut delivered = Vec::new();
    while let Ok(SubscriptionEvent::Notification { message, .. }) = events.try_recv() {
        delivered.push(message.sequence_number);
    }
    assert_eq!(delivered, vec![1, 2, 3]);
}

#[tokio::test]
async fn pipeline_stays_at_depth_across_many_cycles() {
    let (publisher, mut requests) = ScriptedPublisher::new();
    let engine = PublishEngine::new(publisher, config(3));
    let (sub, _events) = subscription(9, 100.0, 5);
    engine.register(sub);

    let mut queue = std::collections::VecDeque::new();
    for _ in 0..3 {
        queue.push_back(next_request(&mut requests).await);
    }
    for sequence_number in 1..=20u32 {
        let (_, reply) = queue.pop_front().expect("outstanding request");
        reply
            .send(Ok(publish_response(9, data(sequence_number))))
            .expect("engine waiting");
        queue.push_back(next_request(&mut requests).await);
        assert_eq!(engine.outstanding(), 3);
    }
    assert!(drain(&mut requests).is_empty());
    assert_eq!(engine.last_sequence_number(9), Some(20));
}

#[tokio::test]
async fn unregistered_subscription_is_not_replenished() {
    let (publisher, mut requests) = ScriptedPublisher::new();
    let engine = PublishEngine::new(publisher, config(2));
    let (sub, _events) = subscription(4, 100.0, 5);
    engine.register(sub);
    let first = next_request(&mut requests).await;
    let second = next_request(&mut requests).await;

    assert!(engine.unregister(4).is_some());
    for (_, reply) in [first, second] {
        reply
            .send(Ok(publish_response(4, data(1))))
            .expect("engine waiting");
    }
    common::eventually("in-flight requests settled", || engine.outstanding() == 0).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(drain(&mut requests).is_empty());
    assert!(engine.subscription_ids().is_empty());
}

#[tokio::test]
async fn suspended_engine_refills_on_resume() {
    let (publisher, mut requests) = ScriptedPublisher::new();
    let engine = PublishEngine::new(publisher, config(2));
    let (sub, _events) = subscription(6, 100.0, 5);
    engine.register(sub);
    let (_, reply) = next_request(&mut requests).await;
    let _held = next_request(&mut requests).await;

    engine.suspend();
    reply
        .send(Ok(publish_response(6, data(1))))
        .expect("engine waiting");
    common::eventually("response processed", || engine.outstanding() == 1).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(drain(&mut requests).is_empty());

    engine.resume();
    let (refill, _reply) = next_request(&mut requests).await;
    assert_eq!(engine.outstanding(), 2);
    assert_eq!(
        refill.subscription_acknowledgements,
        vec![SubscriptionAcknowledgement {
            subscription_id: 6,
            sequence_number: 1,
        }]
    );
}
