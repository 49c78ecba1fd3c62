use std::time::Duration;

use async_trait::async_trait;
use sqlx::{PgPool, postgres::PgListener};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{BusEnvelope, BusError, BusSignal, BusSubscription, FanoutBus, SUBSCRIPTION_BUFFER};

/// Largest payload Postgres accepts for `NOTIFY` (8000 bytes, exclusive).
pub const NOTIFY_PAYLOAD_LIMIT: usize = 7999;

const RECONNECT_DELAY: Duration = Duration::from_millis(500);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

/// Bus over Postgres `LISTEN`/`NOTIFY`.
///
/// Envelopes are published with `pg_notify` on the configured channel and
/// received through a dedicated [`PgListener`] connection.
#[derive(Debug, Clone)]
pub struct PgNotifyBus {
    pool: PgPool,
    channel: String,
}

impl PgNotifyBus {
    pub fn new(pool: PgPool, channel: impl Into<String>) -> Self {
        Self {
            pool,
            channel: channel.into(),
        }
    }
}

/// Encodes an envelope for `NOTIFY`.
///
/// A message too large for the payload limit is sent as a reference to its
/// stored row; receivers load it from the log.
pub(crate) fn encode_envelope(envelope: &BusEnvelope) -> Result<String, BusError> {
    let payload = serde_json::to_string(envelope)?;
    if payload.len() <= NOTIFY_PAYLOAD_LIMIT {
        return Ok(payload);
    }

    let Some(reference) = envelope.by_reference() else {
        return Err(BusError::Oversize {
            bytes: payload.len(),
            limit: NOTIFY_PAYLOAD_LIMIT,
        });
    };
    debug!(bytes = payload.len(), "envelope over the NOTIFY limit; sending a reference");
    Ok(serde_json::to_string(&reference)?)
}

#[async_trait]
impl FanoutBus for PgNotifyBus {
    async fn publish(&self, envelope: &BusEnvelope) -> Result<(), BusError> {
        let payload = encode_envelope(envelope)?;
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(&self.channel)
            .bind(payload)
            .execute(&self.pool)
            .await
            .map_err(|err| BusError::Publish(err.to_string()))?;
        Ok(())
    }

    async fn subscribe(&self) -> Result<BusSubscription, BusError> {
        let mut listener = PgListener::connect_with(&self.pool)
            .await
            .map_err(BusError::Connect)?;
        listener
            .listen(&self.channel)
            .await
            .map_err(BusError::Connect)?;
        info!(channel = %self.channel, "listening for bus notifications");

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        tokio::spawn(relay_notifications(listener, tx));
        Ok(rx)
    }

    fn name(&self) -> &'static str {
        "postgres"
    }
}

async fn relay_notifications(mut listener: PgListener, tx: mpsc::Sender<BusSignal>) {
    loop {
        let signal = match listener.try_recv().await {
            Ok(Some(notification)) => {
                match serde_json::from_str::<BusEnvelope>(notification.payload()) {
                    Ok(envelope) => BusSignal::Envelope(envelope),
                    Err(err) => {
                        warn!(error = %err, "discarding undecodable bus notification");
                        continue;
                    }
                }
            }
            // The listener connection dropped; notifications sent meanwhile are gone.
            Ok(None) => {
                if tx.send(BusSignal::Disconnected).await.is_err() {
                    return;
                }
                reconnect(&mut listener, &tx).await;
                BusSignal::Reconnected
            }
            Err(err) => {
                warn!(error = %err, "bus listener failed");
                if tx.send(BusSignal::Disconnected).await.is_err() {
                    return;
                }
                reconnect(&mut listener, &tx).await;
                BusSignal::Reconnected
            }
        };

        if tx.send(signal).await.is_err() {
            debug!("bus subscription dropped; stopping listener");
            return;
        }
    }
}

/// Re-establishes the listener connection, backing off between attempts.
///
/// Any statement through the listener reconnects it and re-issues `LISTEN`
/// for every channel it was subscribed to.
async fn reconnect(listener: &mut PgListener, tx: &mpsc::Sender<BusSignal>) {
    let mut delay = RECONNECT_DELAY;
    loop {
        if tx.is_closed() {
            return;
        }
        match sqlx::query("SELECT 1").execute(&mut *listener).await {
            Ok(_) => {
                info!("bus listener reconnected");
                return;
            }
            Err(err) => {
                warn!(error = %err, retry_in = ?delay, "bus listener reconnect failed");
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(MAX_RECONNECT_DELAY);
            }
        }
    }
}
