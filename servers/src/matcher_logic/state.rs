use anyhow::Result;
use std::sync::Arc;

use lib_common::EngineTiming;
use lib_common::connections::{Database, PgReservationStore, PgSettingsStore};
use lib_common::core::{
    MatchService, MemoryReservationStore, MemorySettingsStore, ReservationStore, SettingsStore,
    TracingReporter,
};
use lib_common::retrieve::HttpFeedApi;

use crate::matcher_logic::config::Config;

#[derive(Clone)]
pub struct AppState {
    service: Arc<MatchService>,
}

impl AppState {
    pub fn new(service: Arc<MatchService>) -> Self {
        Self { service }
    }

    /// Wires the service from configuration: PostgreSQL stores when a
    /// database URL is set, in-memory stores otherwise.
    pub async fn build(config: &Config) -> Result<Self> {
        let (reservations, settings): (Arc<dyn ReservationStore>, Arc<dyn SettingsStore>) =
            match &config.database_url {
                Some(url) => {
                    let db = Database::connect(url, config.db_max_connections())?;
                    db.ping().await?;
                    db.migrate().await?;
                    tracing::info!(max_connections = config.db_max_connections(), "using PostgreSQL stores");
                    (
                        Arc::new(PgReservationStore::new(db.pool().clone())),
                        Arc::new(PgSettingsStore::new(db.pool().clone())),
                    )
                }
                None => {
                    tracing::warn!("no database configured, state lives in memory only");
                    (
                        Arc::new(MemoryReservationStore::default()),
                        Arc::new(MemorySettingsStore::default()),
                    )
                }
            };

        let api = HttpFeedApi::new(config.feed_client())?;
        let service = MatchService::new(
            Arc::new(api),
            reservations,
            settings,
            Arc::new(TracingReporter),
            EngineTiming::default(),
        );
        Ok(Self::new(Arc::new(service)))
    }

    pub fn service(&self) -> &Arc<MatchService> {
        &self.service
    }
}
