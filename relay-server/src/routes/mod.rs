use std::sync::Arc;

use axum::Router;

use crate::{app_state::AppState, handlers};

pub mod health;

/// Routes a client uses: the event stream and per-connection requests.
pub fn create_api_router() -> Router<Arc<AppState>> {
    Router::new()
        .merge(handlers::stream::routes())
        .merge(handlers::connections::routes())
}
