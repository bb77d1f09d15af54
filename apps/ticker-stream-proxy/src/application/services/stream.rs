//! Price Stream
//!
//! The consumer side of a subscription: a pull-based, cancellable sequence of
//! observations for one symbol.
//!
//! # Lifecycle
//!
//! ```text
//! Attached ──(cancel / drop / unsubscribe)──► Detaching ──► Detached
//! ```
//!
//! Detaching removes the consumer from its symbol's set exactly once, no
//! matter how many paths trigger it. If the consumer was the last one, the
//! source stops tracking the symbol.

use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::application::ports::PriceSource;
use crate::domain::streaming::{PriceObservation, Symbol};
use crate::domain::subscription::{
    Attachment, ConsumerId, DetachOutcome, SubscriptionRegistry,
};
use crate::infrastructure::metrics;

// =============================================================================
// Detach
// =============================================================================

/// Exactly-once removal of one consumer from the registry.
struct Detach {
    registry: Arc<SubscriptionRegistry>,
    source: Arc<dyn PriceSource>,
    symbol: Symbol,
    consumer_id: ConsumerId,
    done: AtomicBool,
}

impl Detach {
    fn run(&self) {
        if self.done.swap(true, Ordering::AcqRel) {
            return;
        }

        let source = &self.source;
        let outcome = self
            .registry
            .detach(&self.symbol, self.consumer_id, |symbol| {
                source.remove_ticker(symbol);
            });

        match outcome {
            DetachOutcome::LastConsumer => tracing::info!(
                symbol = %self.symbol,
                consumer_id = self.consumer_id,
                "Last consumer detached, stopped tracking symbol"
            ),
            DetachOutcome::Remaining(remaining) => tracing::debug!(
                symbol = %self.symbol,
                consumer_id = self.consumer_id,
                remaining,
                "Consumer detached"
            ),
            // Already ended by an unsubscribe of the whole symbol.
            DetachOutcome::NotAttached => {}
        }

        metrics::set_active_consumers(self.registry.stats().consumer_count);
        metrics::set_tracked_symbols(self.source.tracked_symbols().len());
    }
}

// =============================================================================
// Stream Cancel
// =============================================================================

/// Handle that cancels one [`PriceStream`] from another task.
///
/// Cancelling wakes a pending pull, which then ends the stream cleanly.
#[derive(Clone)]
pub struct StreamCancel {
    token: CancellationToken,
    detach: Arc<Detach>,
}

impl StreamCancel {
    /// Cancel the stream and detach its consumer.
    pub fn cancel(&self) {
        self.token.cancel();
        self.detach.run();
    }

    /// Whether the stream has been cancelled (from either side).
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl std::fmt::Debug for StreamCancel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamCancel")
            .field("symbol", &self.detach.symbol)
            .field("consumer_id", &self.detach.consumer_id)
            .field("cancelled", &self.token.is_cancelled())
            .finish()
    }
}

// =============================================================================
// Price Stream
// =============================================================================

/// One consumer's sequence of observations for a symbol.
///
/// Yields observations in arrival order and suspends while none are pending.
/// The sequence never ends on its own; it ends (returns `None`) only after
/// cancellation, an unsubscribe of its symbol, or hub shutdown. Dropping the
/// stream detaches the consumer.
pub struct PriceStream {
    symbol: Symbol,
    consumer_id: ConsumerId,
    receiver: mpsc::UnboundedReceiver<PriceObservation>,
    token: CancellationToken,
    detach: Arc<Detach>,
    finished: bool,
}

impl PriceStream {
    pub(crate) fn new(
        symbol: Symbol,
        consumer_id: ConsumerId,
        attachment: Attachment,
        registry: Arc<SubscriptionRegistry>,
        source: Arc<dyn PriceSource>,
    ) -> Self {
        let detach = Arc::new(Detach {
            registry,
            source,
            symbol: symbol.clone(),
            consumer_id,
            done: AtomicBool::new(false),
        });

        Self {
            symbol,
            consumer_id,
            receiver: attachment.receiver,
            token: attachment.cancel,
            detach,
            finished: false,
        }
    }

    /// The symbol this stream follows.
    #[must_use]
    pub const fn symbol(&self) -> &Symbol {
        &self.symbol
    }

    /// This stream's consumer id.
    #[must_use]
    pub const fn consumer_id(&self) -> ConsumerId {
        self.consumer_id
    }

    /// A handle that can cancel this stream from elsewhere.
    #[must_use]
    pub fn cancel_handle(&self) -> StreamCancel {
        StreamCancel {
            token: self.token.clone(),
            detach: Arc::clone(&self.detach),
        }
    }

    /// Cancel this stream. The next pull returns `None`.
    pub fn cancel(&self) {
        self.cancel_handle().cancel();
    }

    /// Whether the stream has ended.
    #[must_use]
    pub const fn is_finished(&self) -> bool {
        self.finished
    }

    fn finish(&mut self) {
        self.finished = true;
        self.receiver.close();
        self.detach.run();
    }
}

impl Stream for PriceStream {
    type Item = PriceObservation;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }
        if this.token.is_cancelled() {
            this.finish();
            return Poll::Ready(None);
        }

        match this.receiver.poll_recv(cx) {
            Poll::Ready(Some(observation)) if !this.token.is_cancelled() => {
                metrics::record_observation_delivered();
                Poll::Ready(Some(observation))
            }
            Poll::Ready(_) => {
                this.finish();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for PriceStream {
    fn drop(&mut self) {
        self.detach.run();
    }
}

impl std::fmt::Debug for PriceStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PriceStream")
            .field("symbol", &self.symbol)
            .field("consumer_id", &self.consumer_id)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}
