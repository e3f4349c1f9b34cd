//! Durable (stream-backed) subscriptions.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use sourced_messaging::{
    typed, BrokerError, CancellationToken, HandlerError, InMemoryBroker, SubscriptionState,
};

use crate::support::{eventually, next_within, recorder, service, OrderCreated};

const STREAM: &str = "wms-ordering";
const DURABLE: &str = "wms-shipping-wms-ordering-order";
const SHORT: Duration = Duration::from_millis(60);
const LONG: Duration = Duration::from_secs(1);

async fn ordering_with_stream(broker: &InMemoryBroker) -> sourced_messaging::Publisher {
    let (publisher, _) = service(broker, "wms", "ordering").await;
    publisher.connection().with_stream(["order"]).await.unwrap();
    publisher
}

#[tokio::test]
async fn stream_round_trip_and_ack_is_terminal() {
    let broker = InMemoryBroker::new();
    let publisher = ordering_with_stream(&broker).await;
    let (_, shipping) = service(&broker, "wms", "shipping").await;

    publisher
        .publish_durable("order", &OrderCreated::new("123"))
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    let (handler, mut rx) = recorder();
    let handle = shipping
        .subscribe_stream(&cancel, "wms", "ordering", "order", handler)
        .await
        .unwrap();
    assert_eq!(handle.queue(), DURABLE);

    let envelope = next_within(&mut rx, LONG).await.expect("stored message delivered");
    assert_eq!(envelope.decode::<OrderCreated>().unwrap(), OrderCreated::new("123"));
    assert!(eventually(|| broker.acked(STREAM, DURABLE) == vec![1]).await);

    let stats = handle.stop().await;
    assert_eq!(stats.acked, 1);

    // Same durable name resumes after the acknowledged message.
    let (handler, mut rx) = recorder();
    let resumed = shipping
        .subscribe_stream(&cancel, "wms", "ordering", "order", handler)
        .await
        .unwrap();
    assert!(next_within(&mut rx, SHORT).await.is_none());
    assert_eq!(broker.delivery_count(STREAM, 1), 1);
    resumed.stop().await;
}

#[tokio::test]
async fn failed_handler_causes_redelivery() {
    let broker = InMemoryBroker::new();
    let publisher = ordering_with_stream(&broker).await;
    let (_, shipping) = service(&broker, "wms", "shipping").await;

    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&attempts);
    let handle = shipping
        .subscribe_stream(
            &CancellationToken::new(),
            "wms",
            "ordering",
            "order",
            typed(move |_name: String, _event: OrderCreated| {
                let attempt = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt == 0 {
                        Err(HandlerError::rejected("warehouse offline"))
                    } else {
                        Ok(())
                    }
                }
            }),
        )
        .await
        .unwrap();

    publisher
        .publish_durable("order", &OrderCreated::new("1"))
        .await
        .unwrap();

    assert!(eventually(|| broker.acked(STREAM, DURABLE) == vec![1]).await);
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    assert_eq!(broker.delivery_count(STREAM, 1), 2);

    let stats = handle.stop().await;
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.nacked, 1);
    assert_eq!(stats.acked, 1);
}

#[tokio::test]
async fn undecodable_message_is_nacked_for_redelivery() {
    let broker = InMemoryBroker::new();
    let publisher = ordering_with_stream(&broker).await;
    let (_, shipping) = service(&broker, "wms", "shipping").await;

    publisher
        .connection()
        .publish_durable_raw("wms.ordering.order", Bytes::from_static(b"\x00garbage"))
        .await
        .unwrap();
    publisher
        .publish_durable("order", &OrderCreated::new("ok"))
        .await
        .unwrap();

    let (handler, mut rx) = recorder();
    let handle = shipping
        .subscribe_stream(&CancellationToken::new(), "wms", "ordering", "order", handler)
        .await
        .unwrap();

    // The valid message still gets through.
    let envelope = next_within(&mut rx, LONG).await.unwrap();
    assert_eq!(envelope.decode::<OrderCreated>().unwrap().order_id, "ok");

    // The bad one keeps coming back instead of being dropped.
    assert!(eventually(|| broker.delivery_count(STREAM, 1) >= 3).await);
    assert!(!broker.acked(STREAM, DURABLE).contains(&1));

    let stats = handle.stop().await;
    assert!(stats.dropped >= 2);
    assert!(stats.nacked >= 2);
    assert_eq!(stats.handled, 1);
}

#[tokio::test]
async fn messages_stored_before_subscribe_are_delivered() {
    let broker = InMemoryBroker::new();
    let publisher = ordering_with_stream(&broker).await;
    let (_, shipping) = service(&broker, "wms", "shipping").await;

    for id in ["1", "2", "3"] {
        publisher
            .publish_durable("order", &OrderCreated::new(id))
            .await
            .unwrap();
    }

    let (handler, mut rx) = recorder();
    let handle = shipping
        .subscribe_stream(&CancellationToken::new(), "wms", "ordering", "order", handler)
        .await
        .unwrap();

    let mut ids = Vec::new();
    for _ in 0..3 {
        let envelope = next_within(&mut rx, LONG).await.unwrap();
        ids.push(envelope.decode::<OrderCreated>().unwrap().order_id);
    }
    // One consumer sees the stream in order.
    assert_eq!(ids, vec!["1", "2", "3"]);
    handle.stop().await;
}

#[tokio::test]
async fn cancellation_mid_batch_leaves_rest_for_redelivery() {
    let broker = InMemoryBroker::new();
    let publisher = ordering_with_stream(&broker).await;
    let (_, shipping) = service(&broker, "wms", "shipping").await;

    for id in ["1", "2", "3"] {
        publisher
            .publish_durable("order", &OrderCreated::new(id))
            .await
            .unwrap();
    }

    let cancel = CancellationToken::new();
    let handled = Arc::new(Mutex::new(Vec::new()));
    let (scope, seen) = (cancel.clone(), Arc::clone(&handled));
    let mut handle = shipping
        .subscribe_stream(
            &cancel,
            "wms",
            "ordering",
            "order",
            typed(move |_name: String, event: OrderCreated| {
                seen.lock().unwrap().push(event.order_id);
                // First message pulls the plug; the rest of the batch must not run.
                scope.cancel();
                async { Ok::<_, HandlerError>(()) }
            }),
        )
        .await
        .unwrap();

    assert!(handle.wait_for(SubscriptionState::Unbound).await);
    assert_eq!(*handled.lock().unwrap(), vec!["1".to_string()]);
    assert_eq!(broker.acked(STREAM, DURABLE), vec![1]);
    assert_eq!(broker.in_flight(STREAM, DURABLE), 0);

    let stats = handle.join().await;
    assert_eq!(stats.received, 1);

    // A fresh binding picks up what was never settled.
    let (handler, mut rx) = recorder();
    let resumed = shipping
        .subscribe_stream(&CancellationToken::new(), "wms", "ordering", "order", handler)
        .await
        .unwrap();
    let mut ids = HashSet::new();
    for _ in 0..2 {
        let envelope = next_within(&mut rx, LONG).await.unwrap();
        ids.insert(envelope.decode::<OrderCreated>().unwrap().order_id);
    }
    assert_eq!(ids, HashSet::from(["2".to_string(), "3".to_string()]));
    resumed.stop().await;
}

#[tokio::test]
async fn instances_sharing_a_durable_split_the_work() {
    let broker = InMemoryBroker::new();
    let publisher = ordering_with_stream(&broker).await;
    let (_, first) = service(&broker, "wms", "shipping").await;
    let (_, second) = service(&broker, "wms", "shipping").await;

    let (first_handler, mut first_rx) = recorder();
    let (second_handler, mut second_rx) = recorder();
    let cancel = CancellationToken::new();
    first
        .subscribe_stream(&cancel, "wms", "ordering", "order", first_handler)
        .await
        .unwrap();
    second
        .subscribe_stream(&cancel, "wms", "ordering", "order", second_handler)
        .await
        .unwrap();

    for id in 0..6 {
        publisher
            .publish_durable("order", &OrderCreated::new(&id.to_string()))
            .await
            .unwrap();
    }

    assert!(eventually(|| broker.acked(STREAM, DURABLE).len() == 6).await);
    cancel.cancel();

    let mut ids = Vec::new();
    while let Some(envelope) = next_within(&mut first_rx, SHORT).await {
        ids.push(envelope.decode::<OrderCreated>().unwrap().order_id);
    }
    while let Some(envelope) = next_within(&mut second_rx, SHORT).await {
        ids.push(envelope.decode::<OrderCreated>().unwrap().order_id);
    }
    ids.sort();
    assert_eq!(ids, vec!["0", "1", "2", "3", "4", "5"]);
}

#[tokio::test]
async fn durable_publish_without_stream_fails() {
    let broker = InMemoryBroker::new();
    let (publisher, _) = service(&broker, "wms", "ordering").await;
    assert!(matches!(
        publisher
            .publish_durable("order", &OrderCreated::new("1"))
            .await,
        Err(BrokerError::StreamPublish { .. })
    ));
}

#[tokio::test]
async fn durable_subscribe_without_stream_fails() {
    let broker = InMemoryBroker::new();
    let (_, shipping) = service(&broker, "wms", "shipping").await;
    let (handler, _rx) = recorder();
    assert!(matches!(
        shipping
            .subscribe_stream(&CancellationToken::new(), "wms", "ordering", "order", handler)
            .await,
        Err(BrokerError::StreamNotFound(_))
    ));
}

#[tokio::test]
async fn disconnect_ends_durable_subscription() {
    let broker = InMemoryBroker::new();
    let publisher = ordering_with_stream(&broker).await;
    let (_, shipping) = service(&broker, "wms", "shipping").await;

    publisher
        .publish_durable("order", &OrderCreated::new("1"))
        .await
        .unwrap();

    let (handler, mut rx) = recorder();
    let mut handle = shipping
        .subscribe_stream(&CancellationToken::new(), "wms", "ordering", "order", handler)
        .await
        .unwrap();
    assert!(next_within(&mut rx, LONG).await.is_some());
    assert!(eventually(|| broker.acked(STREAM, DURABLE) == vec![1]).await);

    // No cancellation: losing the session alone must release the binding.
    shipping.connection().disconnect().await.unwrap();
    assert!(handle.wait_for(SubscriptionState::Unbound).await);
    assert!(eventually(|| handle.is_finished()).await);

    let stats = handle.join().await;
    assert_eq!(stats.acked, 1);
    assert!(stats.pulls < 10, "kept pulling after disconnect: {stats:?}");
}
