//! Type→provider registry, built once at startup.

use std::sync::Arc;

use tokio::sync::Mutex as AsyncMutex;

use crate::config::Settings;
use crate::providers::local::LocalProvider;
use crate::providers::s3::S3Provider;
use crate::providers::server::ServerProvider;
use crate::providers::webdav::WebdavProvider;
use crate::providers::{DestinationProvider, RetentionProvider};
use crate::store::models::DestinationKind;

pub struct Registry {
    local: LocalProvider,
    webdav: WebdavProvider,
    s3: S3Provider,
    server: ServerProvider,
}

impl Registry {
    pub fn new(settings: &Settings, cli_mutex: Arc<AsyncMutex<()>>) -> Self {
        Self {
            local: LocalProvider,
            webdav: WebdavProvider,
            s3: S3Provider,
            server: ServerProvider {
                bw_binary: settings.bw_binary.clone(),
                deadline: settings.pipeline_deadline,
                cli_mutex,
            },
        }
    }

    pub fn backup_provider(&self, kind: DestinationKind) -> &dyn DestinationProvider {
        match kind {
            DestinationKind::Local => &self.local,
            DestinationKind::Webdav => &self.webdav,
            DestinationKind::S3 => &self.s3,
            DestinationKind::Server => &self.server,
        }
    }

    /// `server` carries no retention capability by construction.
    pub fn retention_provider(&self, kind: DestinationKind) -> Option<&dyn RetentionProvider> {
        match kind {
            DestinationKind::Local => Some(&self.local),
            DestinationKind::Webdav => Some(&self.webdav),
            DestinationKind::S3 => Some(&self.s3),
            DestinationKind::Server => None,
        }
    }
}
