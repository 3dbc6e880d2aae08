//! Application state shared across routes

use std::sync::Arc;

use crate::config::Config;
use crate::game::RoomRegistry;
use crate::store::LedgerClient;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub ledger: LedgerClient,
    pub rooms: Arc<RoomRegistry>,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let config = Arc::new(config);

        // Ledger client for reward settlement
        let ledger = LedgerClient::new(&config);

        // Room registry, the process-wide owner of live battle rooms
        let rooms = Arc::new(RoomRegistry::new());

        Self {
            config,
            ledger,
            rooms,
        }
    }
}
