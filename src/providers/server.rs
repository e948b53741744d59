use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex as AsyncMutex;

use crate::providers::{BackupContext, DestinationProvider};
use crate::vault_cli::Driver;

/// Imports the exported vault into another vault server. Not a
/// `RetentionProvider`: there is nothing here to retain against, since the
/// target vault owns its own history.
///
/// Shares the process-global CLI mutex passed in at construction, so an
/// import here still serializes against every other `bw` invocation.
pub struct ServerProvider {
    pub bw_binary: String,
    pub deadline: Duration,
    pub cli_mutex: Arc<AsyncMutex<()>>,
}

#[async_trait]
impl DestinationProvider for ServerProvider {
    async fn backup(&self, ctx: &BackupContext<'_>) -> anyhow::Result<String> {
        let target_id = ctx
            .destination
            .target_server_id
            .ok_or_else(|| anyhow::anyhow!("server destination missing target_server_id"))?;
        let target = ctx
            .target_server
            .as_ref()
            .filter(|s| s.id == target_id)
            .ok_or_else(|| anyhow::anyhow!("target server config not loaded"))?;

        let driver = Driver::new(self.bw_binary.clone(), self.cli_mutex.clone(), self.deadline);
        let _ = driver.logout().await;
        driver.config_server(&target.url).await?;
        driver.login(&target.client_id, &target.client_secret).await?;
        driver.sync().await?;
        let session = driver.unlock(&target.master_password).await?;
        driver
            .import(ctx.source_file_path, "json", session.as_deref())
            .await?;
        driver.logout().await.ok();

        Ok(format!("server://{}", target.name))
    }
}
