use std::net::SocketAddr;
use std::sync::Arc;

use dotenvy::dotenv;
use tracing::info;

use subscription_billing::infra::{
    app::create_app,
    config::AppConfig,
    error::InfraError,
    reconciliation_scheduler::run_reconciliation_scheduler,
    setup::{init_app_state, init_tracing},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    let config = AppConfig::from_env()?;
    init_tracing(config.log_file.as_deref());

    let app_state = init_app_state(config).await?;

    let bind_addr = app_state.config.bind_addr;
    let reconciliation = &app_state.config.reconciliation;

    if reconciliation.enabled {
        tokio::spawn(run_reconciliation_scheduler(
            Arc::clone(&app_state.reconciliation_use_cases),
            reconciliation.daily_hour_utc,
            reconciliation.critical_check_interval,
        ));
    } else {
        info!("Reconciliation scheduler disabled");
    }

    let app = create_app(app_state);

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .map_err(InfraError::TcpBind)?;

    info!("Billing service listening at {}", &listener.local_addr()?);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .map_err(InfraError::Server)?;

    Ok(())
}
