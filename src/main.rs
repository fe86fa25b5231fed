//! paywatch - Bitcoin Payment Watcher
//!
//! Run modes:
//!   paywatch watch --amount <btc>    - Wait for a payment, then forward it
//!   paywatch address                 - Print a fresh receiving address
//!   paywatch help                    - Show usage
//!
//! Settings come from `PAYWATCH_*` environment variables (a `.env` file is
//! loaded if present).

use paywatch::logging::{self, generate_correlation_id, log_system_event};
use paywatch::payment::{AddressProvisioner, ConnectionError};
use paywatch::{
    units, EsploraClient, EsploraFeed, Payment, PaymentConfig, PaymentError, PaymentEvent,
    PaymentOptions, PaymentServices, ServiceConfig,
};
use std::env;
use std::sync::Arc;

/// Automatic forwarding retries after a failed attempt
const MAX_FORWARD_RETRIES: u32 = 3;

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        return;
    }

    let config = match ServiceConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = logging::init_from_config(&config) {
        eprintln!("Warning: {}", e);
    }

    let result = match args[1].as_str() {
        "watch" => run_watch(&config, &args[2..]).await,
        "address" => run_address(&config),
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {}", other);
            print_usage();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error [{}]: {}", e.error_code(), e);
        std::process::exit(1);
    }
}

fn print_usage() {
    println!("paywatch - Bitcoin Payment Watcher");
    println!();
    println!("Usage:");
    println!("  paywatch watch --amount <btc> [options]   Wait for a payment");
    println!("      --confirmations <n>                   Required depth (default: 6)");
    println!("      --receiver <address>                  Watch an existing address (no forwarding)");
    println!("      --main-wallet <address>               Forward funds here once confirmed");
    println!("  paywatch address                          Print a fresh receiving address");
    println!();
    println!("Environment Variables:");
    println!("  PAYWATCH_NETWORK              mainnet or testnet (default: testnet)");
    println!("  PAYWATCH_ESPLORA_URL          Esplora API endpoint");
    println!("  PAYWATCH_POLL_INTERVAL_SECS   Reconciliation interval (default: 60)");
    println!("  PAYWATCH_FEED_INTERVAL_SECS   Live feed refresh interval (default: 10)");
    println!("  PAYWATCH_FEE_RATE             Forwarding fee rate in sat/vB");
    println!("  PAYWATCH_MAIN_WALLET          Default forwarding destination");
    println!("  PAYWATCH_LOG_LEVEL            trace, debug, info, warn, error");
    println!("  PAYWATCH_LOG_JSON             Set to 1 for JSON logs");
}

/// Parsed `watch` arguments
struct WatchArgs {
    amount_btc: f64,
    confirmations: Option<u32>,
    receiver: Option<String>,
    main_wallet: Option<String>,
}

fn parse_watch_args(args: &[String]) -> Result<WatchArgs, PaymentError> {
    let mut amount_btc = None;
    let mut confirmations = None;
    let mut receiver = None;
    let mut main_wallet = None;

    let mut i = 0;
    while i < args.len() {
        let value = args.get(i + 1);
        match (args[i].as_str(), value) {
            ("--amount", Some(v)) => {
                amount_btc = Some(v.parse::<f64>().map_err(|_| {
                    PaymentError::validation(format!("invalid amount: {}", v))
                })?);
                i += 2;
            }
            ("--confirmations", Some(v)) => {
                confirmations = Some(v.parse::<u32>().map_err(|_| {
                    PaymentError::validation(format!("invalid confirmations: {}", v))
                })?);
                i += 2;
            }
            ("--receiver", Some(v)) => {
                receiver = Some(v.clone());
                i += 2;
            }
            ("--main-wallet", Some(v)) => {
                main_wallet = Some(v.clone());
                i += 2;
            }
            (flag, _) => {
                return Err(PaymentError::validation(format!("unexpected argument: {}", flag)));
            }
        }
    }

    let amount_btc =
        amount_btc.ok_or_else(|| PaymentError::validation("--amount is required"))?;
    if !amount_btc.is_finite() || amount_btc <= 0.0 {
        return Err(PaymentError::validation("amount must be positive"));
    }

    Ok(WatchArgs {
        amount_btc,
        confirmations,
        receiver,
        main_wallet,
    })
}

async fn run_watch(config: &ServiceConfig, args: &[String]) -> Result<(), PaymentError> {
    let watch = parse_watch_args(args)?;

    let mut options = PaymentOptions::from_btc(watch.amount_btc, config.network);
    if let Some(confirmations) = watch.confirmations {
        options = options.confirmations(confirmations);
    }
    if let Some(receiver) = watch.receiver {
        options = options.receiver(receiver);
    }
    if let Some(wallet) = watch.main_wallet.or_else(|| config.main_wallet.clone()) {
        options = options.main_wallet(wallet);
    }

    let client = Arc::new(EsploraClient::new(&config.esplora_url).with_fee_rate(config.fee_rate));
    let feed = Arc::new(EsploraFeed::new((*client).clone(), config.feed_interval));
    let services = PaymentServices::new(client.clone(), client, feed);

    let payment = Payment::with_config(
        options,
        services,
        PaymentConfig {
            poll_interval: config.poll_interval,
            ..PaymentConfig::default()
        },
    )?;

    let session = generate_correlation_id();
    log_system_event(
        "watch_started",
        serde_json::json!({
            "session": session,
            "payment_id": payment.id(),
            "network": config.network.name(),
            "receiver": payment.receiver_address(),
            "expected_sats": payment.expected_amount(),
        }),
    );

    config.print_summary();
    println!();
    println!("Payment: {}", payment.id());
    println!("Send {} to:", units::format_sats(payment.expected_amount()));
    println!("  {}", payment.receiver_address());
    println!("Required Confirmations: {}", payment.min_confirmations());
    match payment.main_wallet() {
        Some(wallet) if payment.can_forward() => println!("Forwarding To: {}", wallet),
        Some(_) => println!("Forwarding: unavailable (no key material for receiver)"),
        None => println!("Forwarding: disabled"),
    }
    println!();
    println!("Press Ctrl+C to stop");
    println!();

    let mut events = payment.subscribe();
    if !payment.start().await {
        payment.dispose().await;
        return Err(ConnectionError::Connect(format!(
            "could not reach {}",
            config.esplora_url
        ))
        .into());
    }

    let forwarding = payment.main_wallet().is_some();
    let mut retries = 0;

    loop {
        let event = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("Interrupted");
                break;
            }
            event = events.recv() => event,
        };

        match event {
            Some(PaymentEvent::Detected { transaction }) => {
                println!(
                    "Detected {} in {} ({} confirmations); total {}",
                    units::format_sats(transaction.amount_sats),
                    transaction.txid,
                    transaction.depth(),
                    units::format_sats(payment.total_received()),
                );
            }
            Some(PaymentEvent::Confirmed {
                amount_sats,
                confirmations,
                from,
            }) => {
                println!(
                    "Confirmed {} ({} confirmations){}",
                    units::format_sats(amount_sats),
                    confirmations,
                    if from.is_empty() {
                        String::new()
                    } else {
                        format!(" from {}", from.join(", "))
                    }
                );
                if !forwarding {
                    break;
                }
            }
            Some(PaymentEvent::Forwarded {
                txid,
                amount_sats,
                destination,
            }) => {
                println!(
                    "Forwarded {} to {} in {}",
                    units::format_sats(amount_sats),
                    destination,
                    txid
                );
                break;
            }
            Some(PaymentEvent::ForwardFailed { error }) => {
                eprintln!("Forwarding failed: {}", error);
                if retries >= MAX_FORWARD_RETRIES || !payment.can_forward() {
                    eprintln!("Funds remain at {}", payment.receiver_address());
                    break;
                }
                retries += 1;
                tokio::time::sleep(config.poll_interval).await;
                // Outcome arrives as the next event
                let _ = payment.retry_forwarding().await;
            }
            Some(PaymentEvent::Cancelled) | None => break,
        }
    }

    payment.dispose().await;
    log_system_event(
        "watch_stopped",
        serde_json::json!({
            "session": session,
            "payment_id": payment.id(),
            "state": payment.state().map(|s| s.to_string()),
            "total_sats": payment.total_received(),
        }),
    );
    Ok(())
}

fn run_address(config: &ServiceConfig) -> Result<(), PaymentError> {
    let keys = AddressProvisioner::new().provision(config.network)?;

    println!("Network: {}", config.network);
    println!("Address: {}", keys.address());
    println!("Public Key: {}", keys.public_key_hex());
    println!();
    println!("The private key is not retained; use `paywatch watch` to receive funds.");
    Ok(())
}

