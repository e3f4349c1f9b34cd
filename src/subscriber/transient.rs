//! Queue-group dispatch loop (at most once).

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::handle::{SubscriptionState, SubscriptionStats};
use super::handler::Handler;
use crate::envelope::Envelope;
use crate::transport::QueueSubscription;

/// Receive from `subscription` until `cancel` fires or the transport closes.
///
/// Messages are handled one at a time. Decode failures and handler errors are
/// logged and the message is gone; nothing is retried.
pub(crate) async fn dispatch<H: Handler>(
    mut subscription: Box<dyn QueueSubscription>,
    handler: H,
    cancel: CancellationToken,
    state: watch::Sender<SubscriptionState>,
) -> SubscriptionStats {
    let mut stats = SubscriptionStats::default();

    loop {
        let payload = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = subscription.next() => match next {
                Some(payload) => payload,
                None => {
                    warn!("subscription closed by transport");
                    state.send_replace(SubscriptionState::Unbound);
                    return stats;
                }
            },
        };
        stats.received += 1;

        let envelope = match Envelope::parse(&payload) {
            Ok(envelope) => envelope,
            Err(err) => {
                stats.dropped += 1;
                error!(error = %err, "dropping message that is not an envelope");
                continue;
            }
        };

        let event = envelope.name.clone();
        match handler.handle(envelope).await {
            Ok(()) => {
                stats.handled += 1;
                debug!(%event, "handled");
            }
            Err(err) if err.is_decode() => {
                stats.dropped += 1;
                error!(%event, error = %err, "dropping undecodable payload");
            }
            Err(err) => {
                stats.failed += 1;
                error!(%event, error = %err, "handler failed");
            }
        }
    }

    state.send_replace(SubscriptionState::Draining);
    if let Err(err) = subscription.unsubscribe().await {
        error!(error = %err, "failed to leave queue group");
    }
    state.send_replace(SubscriptionState::Unbound);
    debug!(?stats, "subscription stopped");
    stats
}
