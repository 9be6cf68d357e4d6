use tokio_util::sync::CancellationToken;

mod api;
mod config;
mod handler;
mod manager;
mod relay;
mod shutdown;

fn init_logging() {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .filter_module("rtmp_relay", log::LevelFilter::Debug)
        .init();
}

#[tokio::main]
async fn main() {
    init_logging();
    let config = config::config();

    let cancel = CancellationToken::new();

    let cancel_clone = cancel.clone();
    api::start_api_server(cancel_clone);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                break;
            },
            _ = tokio::signal::ctrl_c() => {
                cancel.cancel();
            },
        }
    }

    // No encoder process may outlive the server.
    shutdown::shutdown_all(config.settings.stop_grace).await;

    std::process::exit(0);
}
