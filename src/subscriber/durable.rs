//! Durable pull dispatch loop (at least once).

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::handle::{SubscriptionState, SubscriptionStats};
use super::handler::Handler;
use crate::config::SubscriptionOptions;
use crate::envelope::Envelope;
use crate::error::BrokerError;
use crate::transport::{Delivery, PullConsumer};

#[derive(Clone, Copy)]
enum Settle {
    Ack,
    Nak,
}

/// Pull batches from `consumer` until `cancel` fires.
///
/// Handler success acks. Decode failure or handler error naks so the broker
/// redelivers. Once cancellation is observed no further message in the
/// current batch reaches the handler; unsettled messages go back to the broker.
/// A closed session ends the loop; any other fetch error backs off and retries.
pub(crate) async fn dispatch<H: Handler>(
    mut consumer: Box<dyn PullConsumer>,
    handler: H,
    options: SubscriptionOptions,
    cancel: CancellationToken,
    state: watch::Sender<SubscriptionState>,
) -> SubscriptionStats {
    let mut stats = SubscriptionStats::default();

    'pull: loop {
        let fetched = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            fetched = consumer.fetch(options.batch_size, options.fetch_expiry) => fetched,
        };
        stats.pulls += 1;

        let batch = match fetched {
            Ok(batch) => batch,
            Err(BrokerError::NotConnected) => {
                warn!("session closed, ending durable subscription");
                break;
            }
            Err(err) => {
                warn!(error = %err, "pull failed, backing off");
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(options.fetch_expiry) => continue,
                }
            }
        };

        for delivery in batch {
            if cancel.is_cancelled() {
                break 'pull;
            }
            stats.received += 1;

            let envelope = match Envelope::parse(delivery.payload()) {
                Ok(envelope) => envelope,
                Err(err) => {
                    stats.dropped += 1;
                    error!(subject = delivery.subject(), error = %err, "message is not an envelope");
                    settle(delivery.as_ref(), Settle::Nak, &mut stats).await;
                    continue;
                }
            };

            let event = envelope.name.clone();
            match handler.handle(envelope).await {
                Ok(()) => {
                    stats.handled += 1;
                    debug!(%event, "handled");
                    settle(delivery.as_ref(), Settle::Ack, &mut stats).await;
                }
                Err(err) => {
                    if err.is_decode() {
                        stats.dropped += 1;
                    } else {
                        stats.failed += 1;
                    }
                    error!(%event, error = %err, "handler failed, requesting redelivery");
                    settle(delivery.as_ref(), Settle::Nak, &mut stats).await;
                }
            }
        }
    }

    state.send_replace(SubscriptionState::Draining);
    if let Err(err) = consumer.release().await {
        error!(error = %err, "failed to release durable consumer");
    }
    state.send_replace(SubscriptionState::Unbound);
    debug!(?stats, "subscription stopped");
    stats
}

// Settlement failures are logged only; the broker redelivers unsettled messages.
async fn settle(delivery: &dyn Delivery, outcome: Settle, stats: &mut SubscriptionStats) {
    let result = match outcome {
        Settle::Ack => delivery.ack().await,
        Settle::Nak => delivery.nak().await,
    };
    match (outcome, result) {
        (Settle::Ack, Ok(())) => stats.acked += 1,
        (Settle::Nak, Ok(())) => stats.nacked += 1,
        (Settle::Ack, Err(err)) => error!(subject = delivery.subject(), error = %err, "ack failed"),
        (Settle::Nak, Err(err)) => error!(subject = delivery.subject(), error = %err, "nak failed"),
    }
}
