use crate::cli::ServeArgs;
use crate::infra::AppState;
use crate::routes::operational_routes;
use axum::Extension;
use axum_prometheus::PrometheusMetricLayer;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tenant_repairs::config::AppConfig;
use tenant_repairs::error::AppError;
use tenant_repairs::telemetry;
use tenant_repairs::workflows::repairs::StatusCatalog;
use tracing::info;

pub(crate) async fn run(mut args: ServeArgs) -> Result<(), AppError> {
    let mut config = AppConfig::load()?;

    if let Some(host) = args.host.take() {
        config.server.host = host;
    }
    if let Some(port) = args.port.take() {
        config.server.port = port;
    }

    telemetry::init(&config.telemetry)?;

    let catalog = StatusCatalog::from_config(&config.repairs);
    let commented: Vec<&str> = catalog
        .definitions()
        .iter()
        .filter(|definition| definition.comment_required)
        .map(|definition| definition.key)
        .collect();

    let (prometheus_layer, prometheus_handle) = PrometheusMetricLayer::pair();
    let readiness_flag = Arc::new(AtomicBool::new(false));
    let app_state = AppState {
        readiness: readiness_flag.clone(),
        metrics: Arc::new(prometheus_handle),
        catalog_size: catalog.definitions().len(),
    };

    let app = operational_routes()
        .layer(Extension(app_state))
        .layer(prometheus_layer);

    let addr = config.server.socket_addr()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    readiness_flag.store(true, Ordering::Release);

    info!(
        ?config.environment,
        %addr,
        comment_required = ?commented,
        transport_timeout_ms = config.repairs.transport_timeout.as_millis() as u64,
        "damage report service ready"
    );

    axum::serve(listener, app).await?;
    Ok(())
}
