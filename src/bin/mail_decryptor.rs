use anyhow::{Context, Result};
use clap::ArgMatches;
use feedback_decryptor::mailbox::Pop3Connector;
use feedback_decryptor::pipeline::Pipeline;
use feedback_decryptor::relay::{Relay, SmtpTransport};
use feedback_decryptor::store::Datastore;
use feedback_decryptor::worker::{init_from_matches, run_worker, shutdown_token, worker_command};
use feedback_decryptor::workers::{MailIngestor, Notifier};
use std::process;
use std::sync::Arc;

#[tokio::main]
async fn main() {
    let matches = worker_command(
        "mail-decryptor",
        "Decrypts feedback attachments arriving in the feedback mailbox",
    )
    .get_matches();

    if let Err(e) = run(&matches).await {
        log::error!("mail-decryptor failed to start: {e:#}");
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

async fn run(matches: &ArgMatches) -> Result<()> {
    let config = init_from_matches(matches)?;
    let store = Datastore::open(&config.datastore_path, config.correlation_ttl())
        .with_context(|| format!("Failed to open datastore {}", config.datastore_path))?;
    let pipeline = Pipeline::from_config(&config, store)?;

    let transport = SmtpTransport::from_config(&config)?;
    let notifier = Notifier::from_config(Arc::new(Relay::new(Arc::new(transport))), &config);
    let connector = Pop3Connector::from_config(&config)?;

    let mut worker = MailIngestor::new(Arc::new(connector), pipeline, notifier);
    run_worker(&mut worker, shutdown_token()).await;
    Ok(())
}
