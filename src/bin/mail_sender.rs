use anyhow::{Context, Result};
use clap::ArgMatches;
use feedback_decryptor::relay::{Relay, SmtpTransport};
use feedback_decryptor::store::Datastore;
use feedback_decryptor::template::Templater;
use feedback_decryptor::transform::Registry;
use feedback_decryptor::worker::{init_from_matches, run_worker, shutdown_token, worker_command};
use feedback_decryptor::workers::ReplySender;
use std::process;
use std::sync::Arc;

#[tokio::main]
async fn main() {
    let matches = worker_command(
        "mail-sender",
        "Sends decrypted feedback records as threaded replies",
    )
    .get_matches();

    if let Err(e) = run(&matches).await {
        log::error!("mail-sender failed to start: {e:#}");
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

async fn run(matches: &ArgMatches) -> Result<()> {
    let config = init_from_matches(matches)?;
    let store = Datastore::open(&config.datastore_path, config.correlation_ttl())
        .with_context(|| format!("Failed to open datastore {}", config.datastore_path))?;
    let templater = Templater::new(Arc::new(Registry::standard()))?;
    let relay = Relay::new(Arc::new(SmtpTransport::from_config(&config)?));

    let mut worker =
        ReplySender::from_config(&config, store, Arc::new(templater), Arc::new(relay));
    run_worker(&mut worker, shutdown_token()).await;
    Ok(())
}
