//! Transient (queue-group) subscriptions.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use sourced_messaging::{
    typed, CancellationToken, Envelope, HandlerError, InMemoryBroker, SubscriptionState,
};
use tokio::sync::mpsc;

use crate::support::{eventually, next_within, recorder, service, OrderCreated};

const SHORT: Duration = Duration::from_millis(50);
const LONG: Duration = Duration::from_secs(1);

#[tokio::test]
async fn publish_and_subscribe_round_trip() {
    let broker = InMemoryBroker::new();
    let (publisher, subscriber) = service(&broker, "wms", "ordering").await;
    let cancel = CancellationToken::new();

    let (handler, mut rx) = recorder();
    let handle = subscriber
        .subscribe(&cancel, "wms", "ordering", "order", handler)
        .await
        .unwrap();
    assert_eq!(handle.queue(), "wms-ordering-wms-ordering-order");

    publisher
        .publish("order", &OrderCreated::new("123"))
        .await
        .unwrap();

    let envelope = next_within(&mut rx, LONG).await.expect("message delivered");
    assert_eq!(envelope.name, "orderCreated");
    let event: OrderCreated = envelope.decode().unwrap();
    assert_eq!(event.order_id, "123");
    assert_eq!(event.order_type, "normal");

    assert!(next_within(&mut rx, SHORT).await.is_none());
    cancel.cancel();
    assert_eq!(handle.stop().await.handled, 1);
}

#[tokio::test]
async fn shared_queue_group_delivers_to_exactly_one_instance() {
    let broker = InMemoryBroker::new();
    let (publisher, _) = service(&broker, "wms", "ordering").await;
    let (_, first) = service(&broker, "wms", "shipping").await;
    let (_, second) = service(&broker, "wms", "shipping").await;
    let cancel = CancellationToken::new();

    let (tx, mut rx) = mpsc::unbounded_channel();
    for (instance, subscriber) in [(1, &first), (2, &second)] {
        let tx = tx.clone();
        subscriber
            .subscribe(&cancel, "wms", "ordering", "order", move |envelope: Envelope| {
                let _ = tx.send((instance, envelope));
                async { Ok::<_, HandlerError>(()) }
            })
            .await
            .unwrap();
    }
    assert_eq!(
        broker.queue_members("wms.ordering.order", "wms-shipping-wms-ordering-order"),
        2
    );

    for id in ["1", "2", "3", "4"] {
        publisher.publish("order", &OrderCreated::new(id)).await.unwrap();
    }

    let mut seen = Vec::new();
    while let Ok(Some((instance, envelope))) = tokio::time::timeout(SHORT, rx.recv()).await {
        let event: OrderCreated = envelope.decode().unwrap();
        seen.push((instance, event.order_id));
    }
    cancel.cancel();

    let mut ids: Vec<&str> = seen.iter().map(|(_, id)| id.as_str()).collect();
    ids.sort();
    assert_eq!(ids, vec!["1", "2", "3", "4"]);
    // Round robin spreads the load across both instances.
    assert!(seen.iter().any(|(instance, _)| *instance == 1));
    assert!(seen.iter().any(|(instance, _)| *instance == 2));
}

#[tokio::test]
async fn each_consuming_service_gets_its_own_copy() {
    let broker = InMemoryBroker::new();
    let (publisher, _) = service(&broker, "wms", "ordering").await;
    let (_, shipping) = service(&broker, "wms", "shipping").await;
    let (_, billing) = service(&broker, "wms", "billing").await;
    let cancel = CancellationToken::new();

    let (shipping_handler, mut shipping_rx) = recorder();
    let (billing_handler, mut billing_rx) = recorder();
    shipping
        .subscribe(&cancel, "wms", "ordering", "order", shipping_handler)
        .await
        .unwrap();
    billing
        .subscribe(&cancel, "wms", "ordering", "order", billing_handler)
        .await
        .unwrap();

    publisher.publish("order", &OrderCreated::new("9")).await.unwrap();

    assert!(next_within(&mut shipping_rx, LONG).await.is_some());
    assert!(next_within(&mut billing_rx, LONG).await.is_some());
    cancel.cancel();
}

#[tokio::test]
async fn messages_before_subscribe_are_not_delivered() {
    let broker = InMemoryBroker::new();
    let (publisher, subscriber) = service(&broker, "wms", "ordering").await;
    let cancel = CancellationToken::new();

    publisher.publish("order", &OrderCreated::new("early")).await.unwrap();

    let (handler, mut rx) = recorder();
    subscriber
        .subscribe(&cancel, "wms", "ordering", "order", handler)
        .await
        .unwrap();
    assert!(next_within(&mut rx, SHORT).await.is_none());
    cancel.cancel();
}

#[tokio::test]
async fn undecodable_message_is_dropped_not_redelivered() {
    let broker = InMemoryBroker::new();
    let (publisher, subscriber) = service(&broker, "wms", "ordering").await;
    let cancel = CancellationToken::new();

    let (handler, mut rx) = recorder();
    let handle = subscriber
        .subscribe(&cancel, "wms", "ordering", "order", handler)
        .await
        .unwrap();

    publisher
        .connection()
        .publish_raw("wms.ordering.order", Bytes::from_static(b"{not an envelope"))
        .await
        .unwrap();
    publisher.publish("order", &OrderCreated::new("ok")).await.unwrap();

    let envelope = next_within(&mut rx, LONG).await.unwrap();
    assert_eq!(envelope.decode::<OrderCreated>().unwrap().order_id, "ok");
    assert!(next_within(&mut rx, SHORT).await.is_none());

    let stats = handle.stop().await;
    assert_eq!(stats.received, 2);
    assert_eq!(stats.dropped, 1);
    assert_eq!(stats.handled, 1);
}

#[tokio::test]
async fn handler_error_is_swallowed_and_loop_continues() {
    let broker = InMemoryBroker::new();
    let (publisher, subscriber) = service(&broker, "wms", "ordering").await;
    let cancel = CancellationToken::new();

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let handle = subscriber
        .subscribe(
            &cancel,
            "wms",
            "ordering",
            "order",
            typed(move |_name: String, event: OrderCreated| {
                counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if event.order_id == "bad" {
                        Err(HandlerError::rejected("unknown customer"))
                    } else {
                        Ok(())
                    }
                }
            }),
        )
        .await
        .unwrap();

    publisher.publish("order", &OrderCreated::new("bad")).await.unwrap();
    publisher.publish("order", &OrderCreated::new("good")).await.unwrap();

    assert!(eventually(|| calls.load(Ordering::SeqCst) == 2).await);
    tokio::time::sleep(SHORT).await;
    // The failed message is gone; nothing comes back.
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let stats = handle.stop().await;
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.handled, 1);
}

#[tokio::test]
async fn cancellation_lets_in_flight_handler_finish_and_starts_no_more() {
    let broker = InMemoryBroker::new();
    let (publisher, subscriber) = service(&broker, "wms", "ordering").await;
    let cancel = CancellationToken::new();

    let started = Arc::new(Mutex::new(Vec::new()));
    let finished = Arc::new(Mutex::new(Vec::new()));
    let (scope, begun, done) = (cancel.clone(), Arc::clone(&started), Arc::clone(&finished));
    let mut handle = subscriber
        .subscribe(
            &cancel,
            "wms",
            "ordering",
            "order",
            typed(move |_name: String, event: OrderCreated| {
                begun.lock().unwrap().push(event.order_id.clone());
                scope.cancel();
                let done = Arc::clone(&done);
                async move {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    done.lock().unwrap().push(event.order_id);
                    Ok::<_, HandlerError>(())
                }
            }),
        )
        .await
        .unwrap();

    for id in ["1", "2", "3"] {
        publisher.publish("order", &OrderCreated::new(id)).await.unwrap();
    }

    assert!(handle.wait_for(SubscriptionState::Unbound).await);
    assert_eq!(*started.lock().unwrap(), vec!["1".to_string()]);
    assert_eq!(*finished.lock().unwrap(), vec!["1".to_string()]);

    let stats = handle.join().await;
    assert_eq!(stats.received, 1);
    assert_eq!(stats.handled, 1);
}

#[tokio::test]
async fn cancellation_stops_processing_and_leaves_group() {
    let broker = InMemoryBroker::new();
    let (publisher, subscriber) = service(&broker, "wms", "ordering").await;
    let cancel = CancellationToken::new();

    let (handler, mut rx) = recorder();
    let mut handle = subscriber
        .subscribe(&cancel, "wms", "ordering", "order", handler)
        .await
        .unwrap();
    assert_eq!(handle.state(), SubscriptionState::Bound);

    cancel.cancel();
    assert!(handle.wait_for(SubscriptionState::Unbound).await);
    assert_eq!(
        broker.queue_members("wms.ordering.order", "wms-ordering-wms-ordering-order"),
        0
    );

    publisher.publish("order", &OrderCreated::new("late")).await.unwrap();
    assert!(next_within(&mut rx, SHORT).await.is_none());
    assert_eq!(handle.join().await.received, 0);
}
