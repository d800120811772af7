use anyhow::Result;
use dotenvy::dotenv;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use telematics_gateway::cache::TokenCache;
use telematics_gateway::clients::{
    build_http_client, CarusoClient, HighMobilityClient, HighMobilityTokenSource,
};
use telematics_gateway::config::database::DatabaseConfig;
use telematics_gateway::config::EnvironmentConfig;
use telematics_gateway::database::DatabaseConnection;
use telematics_gateway::middleware::auth::AdminCredentials;
use telematics_gateway::models::Provider;
use telematics_gateway::repositories::{
    PgClearanceRepository, PgTelemetryRepository, PgVehicleRepository,
};
use telematics_gateway::routes::create_router;
use telematics_gateway::services::{JobScheduler, ReconcilerConfig};
use telematics_gateway::state::{AppState, Stores};

#[tokio::main]
async fn main() -> Result<()> {
    // Cargar variables de entorno
    dotenv().ok();

    // Configurar logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("🚗 Telematics Gateway - High Mobility / Caruso");
    info!("===============================================");

    let config = EnvironmentConfig::from_env()?;

    // Inicializar base de datos
    let db_config = DatabaseConfig::for_gateway(&config);
    let db_connection = match DatabaseConnection::connect(&db_config).await {
        Ok(conn) => conn,
        Err(e) => {
            error!("❌ Error conectando a la base de datos: {}", e);
            return Err(anyhow::anyhow!("Error de base de datos: {}", e));
        }
    };
    let pool = db_connection.pool().clone();

    let stores = Stores {
        registry: Arc::new(PgVehicleRepository::new(pool.clone())),
        clearances: Arc::new(PgClearanceRepository::new(pool.clone())),
        telemetry: Arc::new(PgTelemetryRepository::new(pool)),
    };

    // Clientes de proveedores
    let http = build_http_client(config.provider_timeout)?;
    let token_source = HighMobilityTokenSource::new(
        http.clone(),
        config.hm_api_url.clone(),
        config.hm_client_id.clone(),
        config.hm_client_secret.clone(),
    );
    let tokens = Arc::new(TokenCache::new(
        Provider::HighMobility,
        Arc::new(token_source),
        config.token_refresh_margin,
    ));
    let high_mobility = Arc::new(HighMobilityClient::new(
        http.clone(),
        config.hm_api_url.clone(),
        tokens,
    ));
    let caruso = Arc::new(CarusoClient::new(
        http,
        config.caruso_api_url.clone(),
        config.caruso_subscription_id.clone(),
        config.caruso_api_key.clone(),
        config.caruso_data_items.clone(),
    ));

    let state = AppState::new(
        AdminCredentials::new(config.admin_username.clone(), config.admin_password_hash.clone()),
        stores,
        high_mobility,
        caruso,
        ReconcilerConfig::from_env(&config),
        config.hm_query_concurrency,
    );

    // Jobs de fondo
    let mut scheduler = JobScheduler::new();
    scheduler.spawn_reconciler(state.reconciler.clone(), config.reconcile_interval);
    scheduler.spawn_dispatcher(state.dispatcher.clone(), config.dispatch_interval);

    let app = create_router(state, &config.cors_origins);

    let addr: SocketAddr = config.server_url().parse()?;
    info!("🌐 Servidor iniciando en http://{} ({})", addr, config.environment);
    info!("🔍 Endpoints disponibles:");
    info!("   GET  /health, GET /metrics");
    info!("   GET  /vehicle-data/:vin, GET|POST /clearances (High Mobility)");
    info!("   GET|POST /caruso/vehicle-data");
    info!("   /vehicles, /jobs/reconcile, /jobs/load-vehicle-data (admin)");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!("❌ Error del servidor: {}", e);
    }

    info!("⏳ Esperando a los jobs en curso...");
    scheduler.shutdown(config.shutdown_grace).await;

    info!("👋 Servidor terminado");
    Ok(())
}

/// Señal de apagado graceful
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("❌ No se pudo instalar el handler de Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("❌ No se pudo instalar el handler de SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("🛑 Señal Ctrl+C recibida, apagando servidor...");
        },
        _ = terminate => {
            info!("🛑 Señal de terminación recibida, apagando servidor...");
        },
    }
}
