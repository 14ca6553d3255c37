use std::future::Future;

use anyhow::Result;
use axum::serve;
use brokerline_bus::{SharedQueueService, select};
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::config::GatewayConfig;
use crate::handler::logging_handler;
use crate::http::{GatewayState, build_router};

/// Starts the gateway: selects the queue adapter, serves HTTP until ctrl-c,
/// then closes the adapter.
pub async fn run(config: GatewayConfig) -> Result<()> {
    let queue = select(&config.queue, None).await?;
    let listener = match TcpListener::bind(config.addr).await {
        Ok(listener) => listener,
        Err(err) => {
            queue.close().await;
            return Err(err.into());
        }
    };
    info!(addr = %config.addr, provider = %queue.provider(), "queue-gateway listening");

    serve_queue(listener, queue, async {
        tokio::signal::ctrl_c().await.ok();
    })
    .await
}

/// Subscribes the logging handler, serves the router on `listener` until
/// `shutdown` resolves and closes `queue` on every exit path.
pub async fn serve_queue<S>(
    listener: TcpListener,
    queue: SharedQueueService,
    shutdown: S,
) -> Result<()>
where
    S: Future<Output = ()> + Send + 'static,
{
    if let Err(err) = queue.subscribe(logging_handler()).await {
        error!(error = %err, "failed to subscribe to queue");
        queue.close().await;
        return Err(err.into());
    }

    let router = build_router(GatewayState::new(queue.clone()));
    let served = serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await;

    info!("queue-gateway shutting down");
    queue.close().await;
    served?;
    Ok(())
}
