use tokio::net::TcpListener;

use kinship_relay::config::{generate_config_template, Config};
use kinship_relay::{auth, db, routes, state, ws};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load config with layered precedence: defaults < TOML < env < CLI
    let config = Config::load()?;

    if config.generate_config {
        print!("{}", generate_config_template());
        return Ok(());
    }

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("kinship_relay=info"));
    if config.json_logs {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().pretty().with_env_filter(filter).init();
    }

    tracing::info!("Kinship relay v{} starting", env!("CARGO_PKG_VERSION"));

    let db = db::init_db(&config.data_dir)?;
    let jwt_secret = auth::jwt::load_or_generate_jwt_secret(&config.data_dir)?;
    let keepalive: state::Keepalive = config.realtime.unwrap_or_default().into();
    tracing::info!(
        ping_interval_secs = keepalive.ping_interval.as_secs(),
        pong_timeout_secs = keepalive.pong_timeout.as_secs(),
        "Push channel keepalive configured"
    );

    let app_state = state::AppState {
        db,
        jwt_secret,
        connections: ws::new_connection_registry(),
        keepalive,
    };

    let app = routes::build_router(app_state);

    let addr = format!("{}:{}", config.bind_address, config.port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    axum::serve(listener, app.into_make_service()).await?;

    Ok(())
}
