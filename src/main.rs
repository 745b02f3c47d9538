use std::process;

use tally::{
    application::error::AppError,
    config,
    engine::{CounterEngine, EngineBackends, EngineConfig},
    infra::{error::InfraError, telemetry},
};
use tracing::{Dispatch, Level, dispatcher, error, info};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (_cli_args, settings) = config::load_with_cli().map_err(InfraError::from)?;

    telemetry::init(&settings.logging)?;

    let engine_config = EngineConfig::from(&settings);
    let backends = EngineBackends::in_memory(&engine_config);
    let engine = CounterEngine::start(&engine_config, backends);

    info!("tallyd running; press Ctrl-C to stop");
    let signal = tokio::signal::ctrl_c().await;
    engine.shutdown().await;

    signal.map_err(InfraError::from)?;
    info!("tallyd stopped");
    Ok(())
}
