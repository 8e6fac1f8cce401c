use axum::extract::FromRef;
use std::sync::Arc;
use std::time::Duration;

use crate::auth::Credentials;
use crate::completion::CompletionHandler;
use crate::config::ServerConfig;
use crate::hub::StreamHub;
use crate::store::Store;

#[derive(Debug, Clone)]
pub struct Settings {
    pub stalled_after: Duration,
    pub history_limit: usize,
    pub viewer_write_timeout: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            stalled_after: Duration::from_secs(60 * 60),
            history_limit: 50,
            viewer_write_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub hub: StreamHub,
    pub completion: CompletionHandler,
    pub credentials: Arc<Credentials>,
    pub settings: Arc<Settings>,
}

impl AppState {
    pub fn new(store: Store, hub: StreamHub, credentials: Credentials, settings: Settings) -> Self {
        Self {
            completion: CompletionHandler::new(store.clone(), hub.clone()),
            store,
            hub,
            credentials: Arc::new(credentials),
            settings: Arc::new(settings),
        }
    }

    pub fn from_config(config: &ServerConfig, store: Store) -> Self {
        let settings = Settings {
            stalled_after: Duration::from_secs(config.queue.stalled_after_minutes * 60),
            history_limit: config.queue.history_limit.max(1),
            viewer_write_timeout: Duration::from_secs(config.stream.viewer_write_timeout_secs.max(1)),
        };
        Self::new(
            store,
            StreamHub::new(config.stream.hub_limits()),
            Credentials::new(&config.hosts, &config.operators),
            settings,
        )
    }
}

impl FromRef<AppState> for Arc<Credentials> {
    fn from_ref(state: &AppState) -> Self {
        Arc::clone(&state.credentials)
    }
}
