use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::FutureExt;

use crate::listener::bind_reuseport;
use crate::proxy::RequestProxy;
use crate::router::app_router;

/// Serves the proxy on `port` until `shutdown` resolves. More than one
/// listener binds the port with `SO_REUSEPORT`.
pub async fn serve_http<F>(
    proxy: Arc<RequestProxy>,
    port: u16,
    listeners: usize,
    shutdown: F,
) -> io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let shutdown = shutdown.boxed().shared();

    let listener_count = listeners.max(1);
    if listener_count == 1 {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!("🚀 Isolate proxy listening on {}", addr);
        return axum::serve(listener, app_router(proxy))
            .with_graceful_shutdown(shutdown)
            .await;
    }

    let mut handles = Vec::with_capacity(listener_count);
    for _ in 0..listener_count {
        let listener = bind_reuseport(addr)?;
        let app = app_router(Arc::clone(&proxy));
        let shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move {
            if let Err(err) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown)
                .await
            {
                tracing::error!("HTTP listener exited: {}", err);
            }
        }));
    }
    tracing::info!(
        "🚀 Isolate proxy listening on {} ({} listeners)",
        addr,
        listener_count
    );

    for handle in handles {
        let _ = handle.await;
    }
    Ok(())
}
