use std::sync::Arc;
use tradelink_hub::Hub;

/// Shared application state accessible by all route handlers.
pub struct AppState {
    pub hub: Arc<Hub>,
}

impl AppState {
    pub fn new(hub: Arc<Hub>) -> Self {
        Self { hub }
    }
}
