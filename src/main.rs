use clap::{Arg, Command};
use feedback_decryptor::config::{Config, DEFAULT_CONFIG_PATH};
use feedback_decryptor::discovery;
use feedback_decryptor::envelope::{Envelope, EnvelopeKey};
use feedback_decryptor::psinet::Psinet;
use feedback_decryptor::store::Datastore;
use feedback_decryptor::template::Templater;
use feedback_decryptor::transform::Registry;
use feedback_decryptor::worker::init_logging;
use std::process;
use std::sync::Arc;

#[tokio::main]
async fn main() {
    let matches = Command::new("feedback-decryptor")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Operator tools for the feedback decryption pipeline")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value(DEFAULT_CONFIG_PATH),
        )
        .arg(
            Arg::new("generate-config")
                .long("generate-config")
                .value_name("FILE")
                .help("Write an example configuration file")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("test-config")
                .long("test-config")
                .help("Validate the configuration and load the private key")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("decrypt")
                .long("decrypt")
                .value_name("FILE")
                .help("Decrypt an envelope file (JSON, optionally base64 wrapped) to stdout")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("stats")
                .long("stats")
                .help("Show ingestion statistics since the last stats email")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("discover")
                .long("discover")
                .value_name("IP")
                .help("Run discovery server selection for a client address")
                .requires("servers")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("servers")
                .long("servers")
                .value_name("LIST")
                .help("Comma-separated discovery candidates")
                .value_delimiter(',')
                .action(clap::ArgAction::Append),
        )
        .arg(
            Arg::new("time")
                .long("time")
                .value_name("SECS")
                .help("Selection time in seconds since the epoch (default: now)")
                .value_parser(clap::value_parser!(u64))
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Enable debug logging")
                .action(clap::ArgAction::SetTrue),
        )
        .get_matches();

    init_logging(matches.get_flag("verbose"));

    if let Some(generate_path) = matches.get_one::<String>("generate-config") {
        generate_config(generate_path);
        return;
    }

    if let Some(ip) = matches.get_one::<String>("discover") {
        let servers: Vec<String> = matches
            .get_many::<String>("servers")
            .map(|values| values.map(|s| s.trim().to_string()).collect())
            .unwrap_or_default();
        let time = matches.get_one::<u64>("time").copied();
        match discovery::select_servers(&servers, ip, time).first() {
            Some(server) => println!("{server}"),
            None => {
                eprintln!("No discovery candidates given");
                process::exit(1);
            }
        }
        return;
    }

    let config_path = matches
        .get_one::<String>("config")
        .map(String::as_str)
        .unwrap_or(DEFAULT_CONFIG_PATH);
    let config = match Config::from_file(config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            process::exit(1);
        }
    };

    if matches.get_flag("test-config") {
        test_config(&config, config_path);
        return;
    }

    if let Some(envelope_file) = matches.get_one::<String>("decrypt") {
        decrypt_file(&config, envelope_file);
        return;
    }

    if matches.get_flag("stats") {
        show_stats(&config);
        return;
    }

    eprintln!("Nothing to do; see --help. Workers run as separate binaries.");
    process::exit(2);
}

fn generate_config(path: &str) {
    match Config::example().to_file(path) {
        Ok(()) => {
            println!("Example configuration written to: {path}");
            println!("Please edit the configuration file to suit your deployment.");
        }
        Err(e) => {
            eprintln!("Error writing configuration file: {e}");
            process::exit(1);
        }
    }
}

fn load_key(config: &Config) -> EnvelopeKey {
    let password = Some(config.private_key_password.expose()).filter(|p| !p.is_empty());
    match EnvelopeKey::from_file(&config.private_key_pem_file, password) {
        Ok(key) => key,
        Err(e) => {
            eprintln!("❌ Failed to load private key: {e:#}");
            process::exit(1);
        }
    }
}

fn test_config(config: &Config, path: &str) {
    println!("🔍 Testing configuration {path}...");
    println!();

    load_key(config);
    println!("✅ Private key loaded from {}", config.private_key_pem_file);

    let psinet_path = config.psinet_path();
    match Psinet::from_file(&psinet_path) {
        Ok(_) => println!("✅ psinet inventory loaded from {}", psinet_path.display()),
        Err(e) => println!("⚠️  psinet inventory unavailable: {e:#}"),
    }

    if let Err(e) = Templater::new(Arc::new(Registry::standard())) {
        println!("❌ Email templates failed to load: {e:#}");
        process::exit(1);
    }
    println!("✅ Email templates loaded");

    println!("Decrypted replies go to: {:?}", config.decrypted_email_recipient.as_slice());
    println!("Stats emails go to: {:?}", config.stats_email_recipients.as_slice());
    println!(
        "Bucket: {} ({}), objects up to {} bytes, {} decrypt worker(s)",
        config.s3_bucket_name, config.aws_region, config.s3_object_max_size, config.num_processes
    );
    if config.pop_server.is_none() {
        println!("⚠️  popServer is not set; mail-decryptor will not start");
    }
    if config.smtp_server.is_none() {
        println!("⚠️  smtpServer is not set; no email can be sent");
    }
    println!("✅ Configuration is valid");
}

fn decrypt_file(config: &Config, path: &str) {
    let data = match std::fs::read(path) {
        Ok(data) => data,
        Err(e) => {
            eprintln!("Error reading {path}: {e}");
            process::exit(1);
        }
    };
    let Some(envelope) = Envelope::from_attachment(&data) else {
        eprintln!("{path} does not contain an envelope");
        process::exit(1);
    };

    match load_key(config).decrypt(&envelope) {
        Ok(cleartext) => println!("{}", String::from_utf8_lossy(&cleartext)),
        Err(e) => {
            eprintln!("Decryption failed: {e}");
            process::exit(1);
        }
    }
}

fn show_stats(config: &Config) {
    let store = match Datastore::open(&config.datastore_path, config.correlation_ttl()) {
        Ok(store) => store,
        Err(e) => {
            eprintln!("Error opening datastore {}: {e}", config.datastore_path);
            process::exit(1);
        }
    };

    let since = match store.get_stats_cursor() {
        Ok(Some(last)) => last,
        Ok(None) => chrono::Utc::now() - chrono::Duration::days(1),
        Err(e) => {
            eprintln!("Error reading stats cursor: {e}");
            process::exit(1);
        }
    };

    match store.get_stats(since) {
        Ok(summary) => {
            println!("📊 Feedback statistics since {}", summary.since.to_rfc3339());
            println!("New records: {}", summary.new_records);
            for platform in &summary.platforms {
                println!("  {:<12} {}", platform.platform, platform.count);
            }
            println!("Pending correlations: {}", summary.pending_correlations);
            if !summary.top_errors.is_empty() {
                println!("Top errors:");
                for error in &summary.top_errors {
                    println!("  {:>5}  {}: {}", error.count, error.module, error.error);
                }
            }
        }
        Err(e) => {
            eprintln!("Error reading statistics: {e}");
            process::exit(1);
        }
    }
}
