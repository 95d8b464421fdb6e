use clap::{Parser, Subcommand, ValueEnum};
use miette::{IntoDiagnostic, Result};
use rust_decimal::Decimal;
use serde::Serialize;
use spei_settlement::application::expiration::IntervalTrigger;
use spei_settlement::application::receipts::{ChannelEventSink, ReceiptTrigger};
use spei_settlement::application::service::{Ports, SettlementService};
use spei_settlement::application::webhook::ingest_result_for;
use spei_settlement::config::Settings;
use spei_settlement::domain::actor::{Actor, Role};
use spei_settlement::domain::clock::SystemClock;
use spei_settlement::domain::settlement::PaymentSettled;
use spei_settlement::domain::webhook::{WebhookCredential, parse_payment_date};
use spei_settlement::infrastructure::in_memory::{
    InMemoryAuditTrail, InMemoryBilling, InMemoryPendingPaymentStore, InMemoryWebhookLedger,
    RecordingNotifier, RecordingReceiptRenderer,
};
use spei_settlement::interfaces::api::{
    ConciliationRequest, ConfirmPaymentRequest, GenerateReferenceRequest,
};
use spei_settlement::interfaces::csv::outcome_writer::{OutcomeWriter, StatementOutcome};
use spei_settlement::interfaces::csv::statement_reader::StatementReader;
use std::fs::File;
use std::io::{self, Read};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to persistent database (optional). If provided, uses RocksDB.
    #[arg(long, global = true)]
    db_path: Option<PathBuf>,

    /// TOML settings file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Staff member performing the operation. Omit to act as the system.
    #[arg(long, global = true)]
    actor: Option<String>,

    #[arg(long, global = true, value_enum, default_value_t = CliRole::Staff)]
    role: CliRole,

    /// Settle still-pending references confirmed after their validity window.
    #[arg(long, global = true)]
    accept_late: bool,

    /// Shared secret for webhook signatures; overrides the settings file.
    #[arg(long, global = true)]
    webhook_secret: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum CliRole {
    Admin,
    Finance,
    Staff,
}

impl From<CliRole> for Role {
    fn from(role: CliRole) -> Self {
        match role {
            CliRole::Admin => Role::Admin,
            CliRole::Finance => Role::Finance,
            CliRole::Staff => Role::Staff,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Issue a payment reference for a student's concept.
    Generate {
        #[arg(long)]
        student: String,
        #[arg(long)]
        concept: String,
        #[arg(long)]
        amount: Decimal,
        #[arg(long)]
        debt: Option<String>,
    },
    /// Confirm a pending payment by id or reference.
    Confirm { pending_payment: String },
    /// Reconcile one bank-statement movement.
    Reconcile {
        #[arg(long)]
        reference: String,
        #[arg(long)]
        amount: Decimal,
        /// RFC 3339 timestamp or YYYY-MM-DD.
        #[arg(long)]
        date: Option<String>,
        #[arg(long)]
        transaction_id: Option<String>,
    },
    /// Reconcile every row of a bank-statement CSV; outcomes go to stdout.
    ReconcileStatement { input: PathBuf },
    /// Ingest a bank webhook payload from a file, or stdin when omitted.
    Webhook {
        payload: Option<PathBuf>,
        /// `sha256=<hex>` HMAC of the payload.
        #[arg(long, conflicts_with = "api_key")]
        signature: Option<String>,
        #[arg(long)]
        api_key: Option<String>,
    },
    /// Show the state of a pending payment by id or reference.
    Status { pending_payment: String },
    /// Expire overdue references once.
    Sweep,
    /// Sweep now and then on the configured interval until interrupted.
    RunSweeper,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("spei_settlement=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

struct Backend {
    ports: Ports,
    receipts: ReceiptTrigger,
    events: mpsc::UnboundedReceiver<PaymentSettled>,
}

fn open_backend(db_path: Option<PathBuf>) -> Result<Backend> {
    let (sink, events) = ChannelEventSink::channel();
    let billing = Arc::new(InMemoryBilling::accept_all());
    let clock = Arc::new(SystemClock);

    #[cfg(feature = "storage-rocksdb")]
    {
        if let Some(db_path) = db_path {
            use spei_settlement::infrastructure::rocksdb::RocksDBStore;
            let store = Arc::new(RocksDBStore::open(db_path).into_diagnostic()?);
            let ports = Ports {
                store: store.clone(),
                ledger: store.clone(),
                audit: store,
                billing,
                events: Arc::new(sink),
                clock,
            };
            let receipts = receipt_trigger(&ports);
            return Ok(Backend {
                ports,
                receipts,
                events,
            });
        }
    }

    #[cfg(not(feature = "storage-rocksdb"))]
    {
        if db_path.is_some() {
            eprintln!(
                "WARNING: Persistent storage requested via --db-path, but 'storage-rocksdb' feature is not enabled. Falling back to In-Memory storage."
            );
        }
    }

    let ports = Ports {
        store: Arc::new(InMemoryPendingPaymentStore::new()),
        ledger: Arc::new(InMemoryWebhookLedger::new()),
        audit: Arc::new(InMemoryAuditTrail::new()),
        billing,
        events: Arc::new(sink),
        clock,
    };
    let receipts = receipt_trigger(&ports);
    Ok(Backend {
        ports,
        receipts,
        events,
    })
}

fn receipt_trigger(ports: &Ports) -> ReceiptTrigger {
    ReceiptTrigger::new(
        ports.store.clone(),
        Arc::new(RecordingReceiptRenderer::new()),
        Arc::new(RecordingNotifier::new()),
    )
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value).into_diagnostic()?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let mut settings = match &cli.config {
        Some(path) => Settings::load(path).into_diagnostic()?,
        None => Settings::default(),
    };
    if cli.accept_late {
        settings.accept_late_payments = true;
    }
    if let Some(secret) = cli.webhook_secret {
        settings.webhook_secret = Some(secret);
    }
    let actor = match cli.actor {
        Some(id) => Actor::staff(id, cli.role.into()),
        None => Actor::System,
    };

    let Backend {
        ports,
        receipts,
        mut events,
    } = open_backend(cli.db_path)?;
    let sweep_interval = settings.sweep_interval();
    let service = SettlementService::new(ports, settings);

    match cli.command {
        Command::Generate {
            student,
            concept,
            amount,
            debt,
        } => {
            let request = GenerateReferenceRequest {
                student_id: student,
                concept_id: concept,
                amount,
                debt_id: debt,
            };
            let response = service
                .generate_reference(request, &actor)
                .await
                .into_diagnostic()?;
            print_json(&response)?;
        }
        Command::Confirm { pending_payment } => {
            let request = ConfirmPaymentRequest {
                pending_payment_id: pending_payment,
            };
            let response = service
                .confirm_payment(request, &actor)
                .await
                .into_diagnostic()?;
            receipts.drain(&mut events).await;
            print_json(&response)?;
        }
        Command::Reconcile {
            reference,
            amount,
            date,
            transaction_id,
        } => {
            let payment_date = date
                .map(|d| parse_payment_date(&d))
                .transpose()
                .into_diagnostic()?;
            let request = ConciliationRequest {
                reference,
                amount,
                payment_date,
                transaction_id,
            };
            let response = service.conciliate(request, &actor).await.into_diagnostic()?;
            receipts.drain(&mut events).await;
            print_json(&response)?;
        }
        Command::ReconcileStatement { input } => {
            let file = File::open(input).into_diagnostic()?;
            let reader = StatementReader::new(file);
            let stdout = io::stdout();
            let mut writer = OutcomeWriter::new(stdout.lock());
            let mut refused = 0usize;
            for row in reader.rows() {
                let request = match row.and_then(|r| r.into_request()) {
                    Ok(request) => request,
                    Err(e) => {
                        tracing::warn!(error = %e, "Skipping unreadable statement row");
                        continue;
                    }
                };
                let reference = request.reference.clone();
                let outcome = match service.conciliate(request, &actor).await {
                    Ok(response) => StatementOutcome {
                        reference,
                        code: response.code,
                        payment_id: response.payment_id,
                        requires_manual_review: response.requires_manual_review.unwrap_or(false),
                    },
                    Err(e) => {
                        tracing::error!(%reference, error = %e, "Statement row not reconciled");
                        refused += 1;
                        StatementOutcome {
                            reference,
                            code: ingest_result_for(&Err(e)).code,
                            payment_id: None,
                            requires_manual_review: false,
                        }
                    }
                };
                writer.write(&outcome).into_diagnostic()?;
            }
            writer.finish().into_diagnostic()?;
            receipts.drain(&mut events).await;
            if refused > 0 {
                return Err(miette::miette!(
                    "{} statement row(s) were not reconciled",
                    refused
                ));
            }
        }
        Command::Webhook {
            payload,
            signature,
            api_key,
        } => {
            let mut raw = Vec::new();
            match payload {
                Some(path) => {
                    File::open(path).into_diagnostic()?.read_to_end(&mut raw).into_diagnostic()?;
                }
                None => {
                    io::stdin().read_to_end(&mut raw).into_diagnostic()?;
                }
            }
            let credential = signature
                .map(WebhookCredential::Signature)
                .or(api_key.map(WebhookCredential::ApiKey));
            let result = service.ingest_webhook(&raw, credential.as_ref()).await;
            receipts.drain(&mut events).await;
            print_json(&result)?;
        }
        Command::Status { pending_payment } => {
            let response = service.status(&pending_payment).await.into_diagnostic()?;
            print_json(&response)?;
        }
        Command::Sweep => {
            let report = service.sweeper().sweep_once(None).await.into_diagnostic()?;
            print_json(&report)?;
        }
        Command::RunSweeper => {
            let (stop, shutdown) = watch::channel(false);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("Shutdown requested");
                    let _ = stop.send(true);
                }
            });
            let reports = service
                .sweeper()
                .run(IntervalTrigger::every(sweep_interval), shutdown)
                .await;
            print_json(&reports)?;
        }
    }

    Ok(())
}
