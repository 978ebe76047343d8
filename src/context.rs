use std::sync::Arc;

use crate::broker::DispatchBroker;
use crate::config::AppConfig;
use crate::credentials::{CredentialStore, FileCredentialStore};
use crate::protocol::FrameCodec;
use crate::registry::SessionRegistry;

#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub credentials: Arc<dyn CredentialStore>,
    pub registry: SessionRegistry,
    pub broker: Arc<DispatchBroker>,
}

impl AppContext {
    pub fn new(config: AppConfig) -> Self {
        let credentials = Arc::new(FileCredentialStore::new(config.credentials_path.clone()));
        Self::with_store(config, credentials)
    }

    pub fn with_store(config: AppConfig, credentials: Arc<dyn CredentialStore>) -> Self {
        let registry = SessionRegistry::new();
        let broker = Arc::new(DispatchBroker::new(
            registry.clone(),
            config.dispatch_timeout(),
        ));
        Self {
            config: Arc::new(config),
            credentials,
            registry,
            broker,
        }
    }

    pub fn codec(&self) -> FrameCodec {
        FrameCodec::new(self.config.max_frame_len)
    }
}
