use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

pub(crate) fn start_api_server(cancel: CancellationToken) {
    tokio::spawn(async move {
        let app = Router::new()
            .nest("/relay", crate::handler::relay::relay_router())
            .nest("/system", crate::handler::system::system_router());

        let addr = crate::config::config().bind_addr();
        let listener = TcpListener::bind(addr).await.unwrap();
        log::info!("API server started on {}", addr);
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal(cancel))
            .await
        {
            log::error!("API server error: {}", e);
        }
    });
}

async fn shutdown_signal(cancel: CancellationToken) {
    cancel.cancelled().await;
    log::info!("Shutting down API server...");
}
