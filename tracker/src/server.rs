use std::future::Future;
use std::sync::Arc;

use tokio::net::TcpListener;

use crate::config::Config;
use crate::router;
use crate::source::GithubSource;
use crate::time::SystemTime;
use crate::track::Tracker;

pub async fn serve<F>(config: Config, listener: TcpListener, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let timesource = Arc::new(SystemTime {});

    let source = Arc::new(GithubSource::new(
        &config.github_api_url,
        config.github_access_token.as_deref(),
        config.request_timeout.0,
        timesource.clone(),
    )?);

    let tracker = Arc::new(Tracker::new(&config, source, timesource));
    let app = router::router(tracker, config.export_prometheus);

    tracing::info!("listening on {:?}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}
