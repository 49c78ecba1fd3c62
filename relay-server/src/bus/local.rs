use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};

use super::{BusEnvelope, BusError, BusSignal, BusSubscription, FanoutBus, SUBSCRIPTION_BUFFER};

/// In-process bus over a `tokio::sync::broadcast` channel.
///
/// Serves single-process deployments. Clones share the channel, so several
/// fan-out nodes in one process can stand in for a multi-process cluster.
#[derive(Debug, Clone)]
pub struct LocalBus {
    sender: broadcast::Sender<Arc<BusEnvelope>>,
}

impl LocalBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }
}

#[async_trait]
impl FanoutBus for LocalBus {
    async fn publish(&self, envelope: &BusEnvelope) -> Result<(), BusError> {
        // No subscribers is not an error.
        let _ = self.sender.send(Arc::new(envelope.clone()));
        Ok(())
    }

    async fn subscribe(&self) -> Result<BusSubscription, BusError> {
        let mut receiver = self.sender.subscribe();
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);

        tokio::spawn(async move {
            loop {
                let signal = match receiver.recv().await {
                    Ok(envelope) => BusSignal::Envelope(envelope.as_ref().clone()),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => BusSignal::Lagged(skipped),
                    Err(broadcast::error::RecvError::Closed) => {
                        let _ = tx.send(BusSignal::Disconnected).await;
                        break;
                    }
                };
                if tx.send(signal).await.is_err() {
                    break;
                }
            }
        });

        Ok(rx)
    }

    fn name(&self) -> &'static str {
        "local"
    }
}
