use std::sync::Arc;

use shared::config::server::Config;

use crate::{
    fanout::Fanout, publisher::Publisher, recovery::RecoveryEngine, registry::Registry,
    store::SharedLog,
};

/// Handles shared by every route.
#[derive(Clone, Debug)]
pub struct AppState {
    pub config: Arc<Config>,
    pub log: SharedLog,
    pub registry: Arc<Registry>,
    pub fanout: Arc<Fanout>,
    pub publisher: Publisher,
    pub recovery: Arc<RecoveryEngine>,
}

impl AppState {
    /// Wires the broadcast components around an already chosen log and bus.
    pub fn assemble(config: Arc<Config>, log: SharedLog, bus: crate::bus::SharedBus) -> Self {
        let registry = Arc::new(Registry::new(&config.stream));
        let fanout = Arc::new(Fanout::new(Arc::clone(&registry), bus, Arc::clone(&log)));
        let publisher = Publisher::new(Arc::clone(&log), Arc::clone(&fanout));
        let recovery = Arc::new(RecoveryEngine::new(
            Arc::clone(&log),
            Arc::clone(&fanout),
            &config.stream,
        ));
        Self {
            config,
            log,
            registry,
            fanout,
            publisher,
            recovery,
        }
    }
}
