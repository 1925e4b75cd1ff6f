use std::sync::Arc;

use auth::AuthService;
use repository::Store;
use tokio::sync::mpsc;

/// State shared between all request handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub auth: Arc<AuthService>,
    /// Handle used to push newly-submitted order ids onto the Poller's
    /// backlog.
    pub poller_tx: mpsc::UnboundedSender<i64>,
}
