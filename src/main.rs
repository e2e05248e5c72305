use brokersync::broker::{BrokerAdapter, InMemoryBroker, ShellBroker};
use brokersync::cli::{self, Cli, Commands};
use brokersync::config::AppConfig;
use brokersync::domain::SettlementRequest;
use brokersync::error::{Result, SyncError};
use brokersync::persistence::PostgresStore;
use brokersync::service::Service;
use chrono::Utc;
use clap::Parser;
use std::sync::Arc;
use tracing::{info, warn};

mod main_runtime;

use main_runtime::{init_logging, init_logging_simple};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::load_from(&cli.config)?;
    if let Err(errors) = config.validate() {
        for error in &errors {
            eprintln!("\x1b[31m✗ {}\x1b[0m", error);
        }
        return Err(SyncError::Validation(errors.join("; ")));
    }

    let _log_guard = match cli.command {
        Commands::Run => init_logging(&config.logging),
        _ => {
            init_logging_simple();
            None
        }
    };

    let one_shot = !matches!(cli.command, Commands::Run);
    let service = build_service(config).await?;

    let result = match cli.command {
        Commands::Run => {
            info!(
                host = %service.config().broker.host,
                "Starting brokersync"
            );
            service.run().await
        }
        Commands::Sync { queue } => run_sync(&service, queue.as_deref()).await,
        Commands::Queues { host } => run_queues(&service, host).await,
        Commands::Status => run_status(&service).await,
        Commands::Settle {
            security,
            quantity,
            seller,
            buyer,
            queue,
            trade_date,
            settlement_date,
            correlation_id,
        } => {
            let trade_date = trade_date.unwrap_or_else(|| Utc::now().date_naive());
            let mut request =
                SettlementRequest::new(&security, quantity, &seller, &buyer, &queue, trade_date);
            request.settlement_date = settlement_date.unwrap_or(trade_date);
            request.correlation_id = correlation_id;
            run_settle(&service, &request).await
        }
        Commands::Message {
            transaction_id,
            correlation,
        } => run_message(&service, transaction_id.as_deref(), correlation.as_deref()).await,
        Commands::Purge { days } => run_purge(&service, days).await,
    };

    if one_shot {
        if let Err(e) = service.connection().disconnect().await {
            warn!(error = %e, "Broker disconnect failed");
        }
    }
    result
}

async fn build_service(config: AppConfig) -> Result<Service> {
    let store = Arc::new(
        PostgresStore::new(&config.database.url, config.database.max_connections).await?,
    );
    store.migrate().await?;

    let adapter: Arc<dyn BrokerAdapter> = if config.broker.enabled {
        Arc::new(ShellBroker::new(config.broker.clone()))
    } else {
        warn!("Broker integration disabled, using an in-process broker");
        Arc::new(InMemoryBroker::with_host(&config.broker.host))
    };

    Ok(Service::new(config, adapter, store.clone(), store))
}

async fn run_sync(service: &Service, queue: Option<&str>) -> Result<()> {
    service.connection().connect_with_retry().await?;

    match queue {
        Some(name) => {
            if service.engine().sync_one(name).await? {
                println!("\x1b[32m✓ {} synchronized\x1b[0m", name);
            } else {
                println!("\x1b[31m✗ {} not found on the broker\x1b[0m", name);
            }
        }
        None => {
            let result = service.engine().sync_all().await?;
            cli::print_sync_result(&result);
        }
    }
    Ok(())
}

async fn run_queues(service: &Service, host: Option<String>) -> Result<()> {
    service.connection().connect_with_retry().await?;

    let host = host.unwrap_or_else(|| service.config().broker.host.clone());
    let listing = service.connection().adapter().list_queues(&host).await?;
    cli::print_queue_listing(&host, &listing);
    Ok(())
}

async fn run_status(service: &Service) -> Result<()> {
    // an unreachable broker is reported, not fatal
    if let Err(e) = service.connection().connect().await {
        warn!(error = %e, "Broker unreachable");
    }

    let stats = service.engine().statistics().await?;
    let counts = service.tracker().status_counts().await?;
    cli::print_status(&service.connection().get_status(), &stats, &counts);
    Ok(())
}

async fn run_settle(service: &Service, request: &SettlementRequest) -> Result<()> {
    service.connection().connect_with_retry().await?;

    let result = service.tracker().create_paired(request).await?;
    cli::print_paired(&result);

    if result.is_complete() {
        Ok(())
    } else {
        Err(SyncError::Correlation(format!(
            "settlement {} was not fully sent",
            result.correlation_id
        )))
    }
}

async fn run_message(
    service: &Service,
    transaction_id: Option<&str>,
    correlation: Option<&str>,
) -> Result<()> {
    let records = match (transaction_id, correlation) {
        (Some(tx), _) => service
            .tracker()
            .find_by_transaction_id(tx)
            .await?
            .into_iter()
            .collect::<Vec<_>>(),
        (None, Some(correlation)) => {
            service
                .tracker()
                .find_by_common_reference_id(correlation)
                .await?
        }
        (None, None) => Vec::new(),
    };

    if records.is_empty() {
        println!("\x1b[33mNo matching messages\x1b[0m");
    }
    for record in &records {
        cli::print_record(record);
        println!();
    }
    Ok(())
}

async fn run_purge(service: &Service, days: Option<u32>) -> Result<()> {
    let days = days.unwrap_or(service.config().sync.purge_after_days);
    let older_than = Utc::now() - chrono::Duration::days(i64::from(days));

    let purged = service.engine().purge_inactive(older_than).await?;
    println!(
        "\x1b[32m✓ Purged {} inactive queue entries older than {} days\x1b[0m",
        purged, days
    );
    Ok(())
}
