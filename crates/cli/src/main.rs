use engine::RuntimeConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod serve;
mod watch;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cli=info,http=info,pool=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!(
        "isolate proxy {} ({})",
        env!("CARGO_PKG_VERSION"),
        env!("ISOLATE_PROXY_GIT_SHA")
    );
    let config = RuntimeConfig::load();
    serve::run(config).await
}
