use clap::Parser;
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod cli;

use cli::args::Cli;
use cli::exit_codes;
use stomp_broker::{Broker, StaticCredentials};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = match &cli.log_level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("stomp_broker=info,stompd=info")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut builder = Broker::builder().config(cli.broker_config());
    if let (Some(login), Some(passcode)) = (&cli.login, &cli.passcode) {
        builder = builder.authenticator(Arc::new(
            StaticCredentials::new().with_user(login.clone(), passcode.clone()),
        ));
    }
    let broker = builder.build();

    let signal_broker = broker.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, shutting down");
            signal_broker.shutdown();
        }
    });

    match broker.listen_and_serve().await {
        Ok(()) => ExitCode::from(exit_codes::SUCCESS),
        Err(e) => {
            eprintln!("stompd: {}: {}", broker.config().addr, e);
            ExitCode::from(exit_codes::NETWORK_ERROR)
        }
    }
}
