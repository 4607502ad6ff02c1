mod app;
mod auth;
mod booking;
mod chat;
mod config;
mod error;
mod gateway;
mod handoff;
mod intent;
mod nlu;
mod notify;
mod prompting;
mod registry;
mod store;
mod text;
mod types;

fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("lab_chat_server=info,tower_http=info,warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

#[tokio::main]
async fn main() {
    init_tracing();
    app::run().await;
}
