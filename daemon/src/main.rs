use stratavore_daemon::config::{Config, LogFormat};
use stratavore_daemon::Orchestrator;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    // Config first: tracing setup depends on it. Failures go to stderr since
    // no subscriber exists yet.
    let config_path = std::env::var("STRATAVORE_CONFIG").ok();
    let config = match Config::load(Some(config_path.as_deref().unwrap_or("stratavore"))) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("ERROR: failed to load configuration: {e}");
            std::process::exit(1);
        }
    };

    init_tracing(&config);
    tracing::info!("starting stratavored v{}", env!("CARGO_PKG_VERSION"));

    Orchestrator::new(config).run().await
}

fn init_tracing(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.observability.log_level));

    match config.observability.log_format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
        LogFormat::Text => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init(),
    }
}
