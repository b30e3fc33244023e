use std::net::SocketAddr;
use std::sync::Arc;

use axum::response::IntoResponse;

use crate::config::ServerConfig;
use crate::core::dispatcher::Dispatcher;
use crate::core::request::ProxyRequest;
use crate::error::ProxyError;

/// The HTTP listener. Requests arrive through a single catch-all route,
/// get buffered into a [`ProxyRequest`] and answered with whatever the
/// dispatcher produces.
pub struct ProxyServer {
    config: ServerConfig,
    dispatcher: Arc<Dispatcher>,
    running: tokio::sync::Mutex<Option<RunningListener>>,
}

/// Handle to a started listener
struct RunningListener {
    stop_tx: tokio::sync::oneshot::Sender<()>,
    task: tokio::task::JoinHandle<()>,
}

impl ProxyServer {
    pub fn new(config: ServerConfig, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            config,
            dispatcher,
            running: tokio::sync::Mutex::new(None),
        }
    }

    /// Bind the configured address and begin serving. A bind failure is a
    /// startup error, so a misconfigured port makes the process exit
    /// non-zero instead of limping along.
    pub async fn start(&self) -> Result<(), ProxyError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(ProxyError::InternalError(
                "listener already started".to_string(),
            ));
        }

        let addr: SocketAddr = format!("{}:{}", self.config.host, self.config.port)
            .parse()
            .map_err(|e| ProxyError::InternalError(format!("invalid listen address: {}", e)))?;

        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let server = axum::Server::try_bind(&addr)
            .map_err(|e| ProxyError::InternalError(format!("cannot bind {}: {}", addr, e)))?
            .serve(router(self.dispatcher.clone()).into_make_service())
            .with_graceful_shutdown(async {
                let _ = stop_rx.await;
            });

        let task = tokio::spawn(async move {
            if let Err(e) = server.await {
                tracing::error!("Listener error: {}", e);
            }
        });

        tracing::info!("Proxy listening on {}", addr);
        *running = Some(RunningListener { stop_tx, task });
        Ok(())
    }

    /// Ask the listener to drain its connections and wait for it to finish
    pub async fn stop(&self) -> Result<(), ProxyError> {
        let listener = self
            .running
            .lock()
            .await
            .take()
            .ok_or_else(|| ProxyError::InternalError("listener is not running".to_string()))?;

        // A dropped receiver means the serve task already ended on its own
        let _ = listener.stop_tx.send(());
        tracing::info!("Draining connections");

        listener
            .task
            .await
            .map_err(|e| ProxyError::InternalError(format!("listener task failed: {}", e)))?;
        tracing::info!("Listener stopped");
        Ok(())
    }
}

/// One catch-all route; the dispatcher decides what a path means.
fn router(dispatcher: Arc<Dispatcher>) -> axum::Router {
    axum::Router::new()
        .fallback(move |request: axum::http::Request<axum::body::Body>| {
            let dispatcher = dispatcher.clone();
            async move { respond(dispatcher, request).await }
        })
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

async fn respond(
    dispatcher: Arc<Dispatcher>,
    request: axum::http::Request<axum::body::Body>,
) -> axum::response::Response {
    let (head, body) = request.into_parts();
    let body = match hyper::body::to_bytes(body).await {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::warn!("Dropping request with unreadable body: {}", e);
            return (
                hyper::StatusCode::BAD_REQUEST,
                "request body could not be read",
            )
                .into_response();
        }
    };

    let reply = dispatcher
        .dispatch(ProxyRequest::from_parts(head, body))
        .await;
    (reply.status, reply.headers, reply.body).into_response()
}
