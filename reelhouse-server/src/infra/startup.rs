use std::sync::Arc;

use anyhow::Context;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use reelhouse_config::Config;
use reelhouse_core::{
    ArtifactStore, Capabilities, FsArtifactStore, IdleWorker, Scheduler,
    TokioProcessRunner,
};

/// Long-lived services shared by the HTTP layer and the idle worker.
#[derive(Debug)]
pub struct Services {
    pub scheduler: Scheduler,
    pub store: Arc<FsArtifactStore>,
}

/// Prepare the cache, probe the tools and start the scheduler.
pub fn build_services(config: &Config) -> anyhow::Result<Services> {
    let store = Arc::new(FsArtifactStore::new(
        config.media.root.clone(),
        config.cache.root.clone(),
    ));
    store.ensure_layout().with_context(|| {
        format!(
            "failed to prepare artifact cache at {}",
            config.cache.root.display()
        )
    })?;

    let capabilities = Capabilities::detect(&config.tools.paths);
    let enabled = capabilities.enabled_kinds();
    if enabled.is_empty() {
        warn!("no artifact kinds are available; install ffmpeg/ffprobe or fix tool paths");
    } else {
        info!(kinds = ?enabled, "artifact kinds available");
    }

    let runner = Arc::new(TokioProcessRunner::new(config.tools.grace_period));
    let scheduler = Scheduler::new(
        config.scheduler.clone(),
        runner,
        Arc::clone(&store) as Arc<dyn ArtifactStore>,
        capabilities,
    );
    scheduler.start();

    Ok(Services { scheduler, store })
}

/// Start background catch-up unless disabled or there is no library to scan.
pub fn spawn_idle_worker(
    config: &Config,
    services: &Services,
    shutdown: CancellationToken,
) -> Option<JoinHandle<()>> {
    if !config.idle.enabled {
        info!("idle worker disabled");
        return None;
    }
    if config.media.root.is_none() {
        warn!("idle worker skipped: MEDIA_ROOT is not configured");
        return None;
    }
    let worker = IdleWorker::new(
        services.scheduler.clone(),
        Arc::clone(&services.store) as Arc<dyn ArtifactStore>,
        config.idle.clone(),
    );
    Some(worker.spawn(shutdown))
}
