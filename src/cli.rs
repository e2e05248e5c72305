use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use std::collections::HashMap;

use crate::broker::QueueListing;
use crate::correlation::PairedResult;
use crate::domain::{ConnectionState, ConnectionStatus, MessageRecord, MessageStatus, SyncResult, SyncStatistics, SyncStatus};

#[derive(Parser, Debug)]
#[command(name = "brokersync")]
#[command(version = "0.1.0")]
#[command(about = "Message broker queue reconciliation and settlement message tracking", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config directory (default.toml plus the BROKERSYNC_ENV overlay)
    #[arg(short, long, global = true, default_value = "config", env = "BROKERSYNC_CONFIG")]
    pub config: String,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the full service: connect, reconcile, listen, and resync periodically
    Run,
    /// Reconcile the queue registry against the broker once
    Sync {
        /// Reconcile only this queue
        #[arg(short, long)]
        queue: Option<String>,
    },
    /// Print the live queue listing
    Queues {
        /// Host to enumerate (defaults to broker.host)
        #[arg(long)]
        host: Option<String>,
    },
    /// Connection state, registry statistics and message counts
    Status,
    /// Send a paired RECE/DELI settlement
    Settle {
        /// Security identifier (ISIN-like)
        #[arg(long)]
        security: String,
        #[arg(long)]
        quantity: Decimal,
        /// Seller participant code
        #[arg(long)]
        seller: String,
        /// Buyer participant code
        #[arg(long)]
        buyer: String,
        /// Destination queue
        #[arg(long)]
        queue: String,
        /// Trade date (YYYY-MM-DD, defaults to today)
        #[arg(long)]
        trade_date: Option<NaiveDate>,
        /// Settlement date (YYYY-MM-DD, defaults to the trade date)
        #[arg(long)]
        settlement_date: Option<NaiveDate>,
        /// Correlation id to use instead of a generated one
        #[arg(long)]
        correlation_id: Option<String>,
    },
    /// Look up tracked messages
    Message {
        /// Transaction id of one leg
        #[arg(required_unless_present = "correlation", conflicts_with = "correlation")]
        transaction_id: Option<String>,
        /// Show every leg sharing this correlation id
        #[arg(long)]
        correlation: Option<String>,
    },
    /// Delete inactive registry entries
    Purge {
        /// Age in days (defaults to sync.purge_after_days)
        #[arg(long)]
        days: Option<u32>,
    },
}

fn state_color(state: ConnectionState) -> &'static str {
    match state {
        ConnectionState::Connected => "\x1b[32m",
        ConnectionState::Error => "\x1b[31m",
        _ => "\x1b[33m",
    }
}

fn sync_color(status: SyncStatus) -> &'static str {
    match status {
        SyncStatus::Success => "\x1b[32m",
        SyncStatus::PartialSuccess => "\x1b[33m",
        _ => "\x1b[31m",
    }
}

pub fn print_sync_result(result: &SyncResult) {
    println!(
        "{}{}\x1b[0m at {}",
        sync_color(result.status),
        result.status,
        result.sync_time.format("%Y-%m-%d %H:%M:%S UTC")
    );
    println!("  Total:   {}", result.total_queues);
    println!("  Created: {}", result.created_queues);
    println!("  Updated: {}", result.updated_queues);
    println!("  Deleted: {}", result.deleted_queues);
    if let Some(error) = &result.error_message {
        println!("  \x1b[31m{}\x1b[0m", error);
    }
}

pub fn print_queue_listing(host: &str, listing: &QueueListing) {
    println!("Queues on {}:", host);
    println!("{:<40} {:>10}  {}", "NAME", "MESSAGES", "PATH");
    for queue in &listing.queues {
        println!(
            "{:<40} {:>10}  {}",
            queue.name, queue.approx_message_count, queue.path
        );
    }
    for (name, error) in &listing.unreadable {
        println!("{:<40} {:>10}  \x1b[31m{}\x1b[0m", name, "?", error);
    }
    println!(
        "{} readable, {} unreadable",
        listing.queues.len(),
        listing.unreadable.len()
    );
}

pub fn print_status(
    connection: &ConnectionStatus,
    stats: &SyncStatistics,
    counts: &HashMap<MessageStatus, i64>,
) {
    println!(
        "Broker {}:{}  {}{}\x1b[0m",
        connection.host,
        connection.port,
        state_color(connection.state),
        connection.state
    );
    if let Some(error) = &connection.last_error {
        println!("  Last error: {}", error);
    }

    println!();
    println!(
        "Registry: {} active, {} inactive",
        stats.active_queues, stats.inactive_queues
    );
    if let Some(last) = &stats.last_result {
        print_sync_result(last);
    }

    println!();
    println!("Messages:");
    for status in [
        MessageStatus::Created,
        MessageStatus::Sent,
        MessageStatus::Peeked,
        MessageStatus::Received,
        MessageStatus::Processed,
        MessageStatus::Failed,
    ] {
        println!("  {:<10} {}", status, counts.get(&status).copied().unwrap_or(0));
    }
}

pub fn print_paired(result: &PairedResult) {
    let marker = if result.is_complete() {
        "\x1b[32m✓\x1b[0m"
    } else {
        "\x1b[31m✗\x1b[0m"
    };
    println!("{} Correlation {}", marker, result.correlation_id);
    for leg in [&result.rece, &result.deli] {
        println!(
            "  {} {:<28} {:<10} {}",
            leg.movement_type,
            leg.transaction_id,
            leg.status,
            leg.error
                .as_deref()
                .or(leg.message_id.as_deref())
                .unwrap_or_default()
        );
    }
}

pub fn print_record(record: &MessageRecord) {
    println!("{} ({})", record.transaction_id, record.movement_type);
    println!("  Status:      {}", record.status);
    println!("  Queue:       {} [{}]", record.queue_name, record.environment);
    if let Some(id) = &record.message_id {
        println!("  Message id:  {}", id);
    }
    if let Some(linked) = &record.linked_transaction_id {
        println!("  Linked:      {}", linked);
    }
    if let Some(correlation) = &record.common_reference_id {
        println!("  Correlation: {}", correlation);
    }
    if let Some(error) = &record.error_message {
        println!("  \x1b[31mError:       {}\x1b[0m", error);
    }
    println!("  Created:     {}", record.created_at);
    for (label, at) in [
        ("Sent", record.sent_at),
        ("Received", record.received_at),
        ("Processed", record.processed_at),
    ] {
        if let Some(at) = at {
            println!("  {:<12} {}", format!("{}:", label), at);
        }
    }
}
