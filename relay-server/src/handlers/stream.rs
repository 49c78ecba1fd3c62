//! `GET /api/stream`: the server-sent event stream a client reads.

use std::{convert::Infallible, sync::Arc, time::Duration};

use axum::{
    Router,
    extract::{Query, State},
    http::HeaderMap,
    response::sse::{Event, KeepAlive, Sse},
    routing::get,
};
use futures_util::{Stream, stream};
use serde::Deserialize;
use shared::models::{ClientEvent, SequenceId};
use tokio::sync::mpsc;
use tracing::{info, instrument, warn};

use crate::{
    app_state::AppState,
    connection::{Connection, ConnectionId},
    recovery::{Handshake, OpenedSession, RecoveryEngine},
};

const LAST_EVENT_ID: &str = "last-event-id";

pub fn routes() -> Router<Arc<AppState>> {
    Router::new().route("/api/stream", get(stream_events))
}

#[derive(Debug, Deserialize, Default)]
pub struct StreamQuery {
    offset: Option<SequenceId>,
    session: Option<ConnectionId>,
}

/// The `offset` query parameter wins over `Last-Event-ID`; both default to 0.
fn handshake_from(query: &StreamQuery, headers: &HeaderMap) -> Handshake {
    let from_header = headers
        .get(LAST_EVENT_ID)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<SequenceId>().ok());

    Handshake {
        last_known_offset: query.offset.or(from_header).unwrap_or(0).max(0),
        session: query.session,
    }
}

#[instrument(skip(state, headers))]
async fn stream_events(
    State(state): State<Arc<AppState>>,
    Query(query): Query<StreamQuery>,
    headers: HeaderMap,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let handshake = handshake_from(&query, &headers);
    let opened = state.recovery.open(handshake).await;
    info!(
        connection_id = %opened.connection.id(),
        offset = handshake.last_known_offset,
        recovered = opened.recovered,
        "stream opened"
    );

    let keepalive = KeepAlive::new()
        .interval(Duration::from_secs(state.config.stream.heartbeat_seconds.max(1)))
        .text("keep-alive");

    Sse::new(event_stream(Arc::clone(&state.recovery), opened)).keep_alive(keepalive)
}

fn event_stream(
    engine: Arc<RecoveryEngine>,
    opened: OpenedSession,
) -> impl Stream<Item = Result<Event, Infallible>> {
    let transport = Transport {
        engine,
        connection: opened.connection,
        receiver: Some(opened.receiver),
        last_delivered: None,
    };

    stream::unfold(transport, |mut transport| async move {
        let event = transport.next_event().await?;
        if let Some(sequence_id) = event.sequence_id() {
            transport.last_delivered = transport.last_delivered.max(Some(sequence_id));
        }
        Some((Ok(to_sse(&event)), transport))
    })
}

fn to_sse(event: &ClientEvent) -> Event {
    let data = match event.data_json() {
        Ok(data) => data,
        Err(err) => {
            warn!(event = event.name(), error = %err, "dropping unencodable event");
            return Event::default().comment("unencodable event");
        }
    };

    let sse = Event::default().event(event.name()).data(data);
    match event.sequence_id() {
        Some(sequence_id) => sse.id(sequence_id.to_string()),
        None => sse,
    }
}

/// One client's side of the stream. Dropping it, which hyper does when the
/// client goes away, hands the connection back to the recovery engine.
#[derive(Debug)]
struct Transport {
    engine: Arc<RecoveryEngine>,
    connection: Arc<Connection>,
    receiver: Option<mpsc::Receiver<ClientEvent>>,
    /// Highest sequence id handed to the response body.
    last_delivered: Option<SequenceId>,
}

impl Transport {
    async fn next_event(&mut self) -> Option<ClientEvent> {
        let closed = self.connection.closed();
        let receiver = self.receiver.as_mut()?;
        tokio::select! {
            event = receiver.recv() => event,
            () = closed.cancelled() => None,
        }
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        let Some(receiver) = self.receiver.take() else {
            return;
        };
        let engine = Arc::clone(&self.engine);
        let connection = Arc::clone(&self.connection);
        let last_delivered = self.last_delivered;

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    engine.close(connection, receiver, last_delivered).await;
                });
            }
            Err(_) => warn!(
                connection_id = %connection.id(),
                "stream dropped outside the runtime; connection not cleaned up"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{bus::LocalBus, store::MemoryMessageLog};
    use axum::{
        body::Body,
        http::{HeaderValue, Request, StatusCode, header::CONTENT_TYPE},
    };
    use futures_util::StreamExt;
    use shared::config::server::{Config, Profile};
    use tower::ServiceExt;

    fn state() -> Arc<AppState> {
        let config = Arc::new(Config::default_for_profile(Profile::Test));
        Arc::new(AppState::assemble(
            config,
            Arc::new(MemoryMessageLog::new()),
            Arc::new(LocalBus::new(64)),
        ))
    }

    async fn seed(state: &AppState, contents: &[&str]) {
        for (index, content) in contents.iter().enumerate() {
            state
                .publisher
                .publish((*content).to_string(), Some(format!("seed-{index}")), "alice".into())
                .await
                .unwrap();
        }
    }

    /// Collects the body until the handshake's closing `nickname` event.
    async fn read_handshake(body: Body) -> String {
        let mut chunks = body.into_data_stream();
        let mut text = String::new();
        while !text.contains("event: nickname") {
            let chunk = tokio::time::timeout(Duration::from_secs(1), chunks.next())
                .await
                .expect("chunk in time")
                .expect("stream open")
                .expect("chunk");
            text.push_str(&String::from_utf8_lossy(&chunk));
        }
        text
    }

    #[test]
    fn offset_query_wins_over_last_event_id() {
        let mut headers = HeaderMap::new();
        headers.insert(LAST_EVENT_ID, HeaderValue::from_static("7"));

        let query = StreamQuery {
            offset: Some(3),
            session: None,
        };
        assert_eq!(handshake_from(&query, &headers).last_known_offset, 3);

        let query = StreamQuery::default();
        assert_eq!(handshake_from(&query, &headers).last_known_offset, 7);
    }

    #[test]
    fn malformed_or_negative_offsets_mean_replay_everything() {
        let mut headers = HeaderMap::new();
        headers.insert(LAST_EVENT_ID, HeaderValue::from_static("not-a-number"));
        assert_eq!(
            handshake_from(&StreamQuery::default(), &headers).last_known_offset,
            0
        );

        let query = StreamQuery {
            offset: Some(-4),
            session: None,
        };
        assert_eq!(handshake_from(&query, &HeaderMap::new()).last_known_offset, 0);
    }

    #[tokio::test]
    async fn stream_replays_after_the_offset() {
        let state = state();
        seed(&state, &["first", "second"]).await;

        let response = routes()
            .with_state(Arc::clone(&state))
            .oneshot(
                Request::builder()
                    .uri("/api/stream?offset=1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            "text/event-stream"
        );

        let text = read_handshake(response.into_body()).await;
        assert!(text.contains("event: session"));
        assert!(text.contains("second"));
        assert!(text.contains("id: 2"));
        assert!(!text.contains("first"));
    }

    #[tokio::test]
    async fn last_event_id_header_is_a_handshake_offset() {
        let state = state();
        seed(&state, &["first", "second"]).await;

        let response = routes()
            .with_state(Arc::clone(&state))
            .oneshot(
                Request::builder()
                    .uri("/api/stream")
                    .header(LAST_EVENT_ID, "2")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        let text = read_handshake(response.into_body()).await;
        assert!(!text.contains("event: message"));
    }

    #[tokio::test]
    async fn dropping_the_body_unregisters_the_connection() {
        let state = state();

        let response = routes()
            .with_state(Arc::clone(&state))
            .oneshot(
                Request::builder()
                    .uri("/api/stream")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        read_handshake(response.into_body()).await;

        for _ in 0..100 {
            if state.registry.is_empty().await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(state.registry.is_empty().await);
    }
}
