use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use receipty::{
    analytics, db, format_money, seed, OpenAiExtractor, ProcessorOptions, ReceiptProcessor,
    ReceiptStatus, Settings,
};

#[derive(Parser, Debug)]
#[command(name = "receipty")]
#[command(about = "Receipt ingestion, LLM extraction and spending analytics", version)]
struct Cli {
    /// SQLite database file (overrides DATABASE_PATH)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the database and its tables
    Init,

    /// Insert clean processed receipts
    Seed {
        #[arg(long, default_value_t = 10)]
        receipts: usize,
        /// Delete all existing data first
        #[arg(long)]
        clear: bool,
    },

    /// Insert simulated OCR text as pending receipts
    SimulateOcr {
        #[arg(long, default_value_t = 5)]
        receipts: usize,
    },

    /// Run one extraction batch over pending receipts
    Process,

    /// Move failed receipts back to pending
    RetryFailed,

    /// List receipts
    List {
        /// pending, processing, processed or failed
        #[arg(long)]
        status: Option<ReceiptStatus>,
    },

    /// Status counts and spending summary
    Stats,

    /// Write every item with its receipt to a CSV file
    Export {
        #[arg(long)]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::from_env()?;
    receipty::logging::init_tracing(&settings.log_level);

    let db_path = cli.db.clone().unwrap_or_else(|| settings.database_path.clone());

    match cli.command {
        Command::Init => run_init(&db_path),
        Command::Seed { receipts, clear } => run_seed(&db_path, receipts, clear),
        Command::SimulateOcr { receipts } => run_simulate_ocr(&db_path, receipts),
        Command::Process => run_process(&db_path, &settings).await,
        Command::RetryFailed => run_retry_failed(&db_path),
        Command::List { status } => run_list(&db_path, status),
        Command::Stats => run_stats(&db_path),
        Command::Export { output } => run_export(&db_path, &output),
    }
}

fn open(db_path: &Path) -> Result<Connection> {
    db::open_database(db_path)
}

fn today() -> chrono::NaiveDate {
    chrono::Local::now().date_naive()
}

fn run_init(db_path: &Path) -> Result<()> {
    println!("🔧 Setting up database...");
    open(db_path)?;
    println!("✓ Database ready at {:?} (WAL mode)", db_path);
    Ok(())
}

fn run_seed(db_path: &Path, receipts: usize, clear: bool) -> Result<()> {
    let conn = open(db_path)?;

    if clear {
        println!("🧹 Clearing existing tables...");
        db::clear_all(&conn)?;
    }

    println!("🌱 Generating {} clean receipts...", receipts);
    let ids = seed::generate_clean_data(&conn, receipts, &mut rand::thread_rng(), today())?;
    println!("✓ Created {} receipts", ids.len());
    println!("✓ Database contains {} receipts", db::count_receipts(&conn)?);
    Ok(())
}

fn run_simulate_ocr(db_path: &Path, receipts: usize) -> Result<()> {
    let conn = open(db_path)?;

    println!("📄 Simulating {} OCR receipts...", receipts);
    let outcomes = seed::simulate_ocr_insertion(&conn, receipts, &mut rand::thread_rng(), today())?;
    for outcome in &outcomes {
        match outcome {
            db::SubmitOutcome::Created(receipt) => println!("  ✓ Inserted raw receipt {}", receipt.id),
            db::SubmitOutcome::Duplicate(id) => println!("  ⚠ Duplicate of receipt {}", id),
        }
    }
    println!("✓ Database contains {} receipts", db::count_receipts(&conn)?);
    Ok(())
}

async fn run_process(db_path: &Path, settings: &Settings) -> Result<()> {
    let api_key = settings.require_openai_key()?.to_string();
    let extractor = OpenAiExtractor::new(
        api_key,
        Some(settings.openai_base_url.clone()),
        settings.openai_model.clone(),
        settings.llm_timeout_secs,
    );

    let conn = Arc::new(Mutex::new(open(db_path)?));
    let processor = ReceiptProcessor::new(conn, Arc::new(extractor), ProcessorOptions::from(settings))?;

    println!("⚙️  Processing pending receipts with {}...", settings.openai_model);
    let report = processor.run_batch().await?;

    println!("✓ {}", report.summary());
    for failure in &report.failures {
        println!("  ✗ {}: {}", failure.receipt_id, failure.reason);
    }
    Ok(())
}

fn run_retry_failed(db_path: &Path) -> Result<()> {
    let conn = open(db_path)?;
    let reset = db::reset_failed_to_pending(&conn, "cli")?;
    println!("🔁 {} failed receipts moved back to pending", reset);
    Ok(())
}

fn run_list(db_path: &Path, status: Option<ReceiptStatus>) -> Result<()> {
    let conn = open(db_path)?;
    let receipts = match status {
        Some(status) => db::get_receipts_by_status(&conn, status)?,
        None => db::get_all_receipts(&conn)?,
    };

    println!(
        "{:<36}  {:<10}  {:<10}  {:<16}  {:>10}",
        "ID", "STATUS", "DATE", "MERCHANT", "TOTAL"
    );
    for receipt in &receipts {
        println!(
            "{:<36}  {:<10}  {:<10}  {:<16}  {:>10}",
            receipt.id,
            receipt.status.as_str(),
            receipt
                .receipt_date
                .map(|d| d.format("%Y-%m-%d").to_string())
                .unwrap_or_else(|| "-".to_string()),
            receipt.merchant.as_deref().unwrap_or("-"),
            receipt
                .total_amount
                .map(|t| format!("{}€", format_money(t)))
                .unwrap_or_else(|| "-".to_string()),
        );
        if let Some(reason) = &receipt.failure_reason {
            println!("    ↳ {}", reason);
        }
    }
    println!("\n{} receipts", receipts.len());
    Ok(())
}

fn run_stats(db_path: &Path) -> Result<()> {
    let conn = open(db_path)?;

    println!("📊 Receipts by status");
    for (status, count) in db::count_by_status(&conn)? {
        println!("  {:<10} {}", status.as_str(), count);
    }

    let rows = db::get_analysis_rows(&conn)?;
    let kpis = analytics::kpis(&rows);
    println!("\n💶 Spending");
    println!("  Total spend:         {}€", format_money(kpis.total_spend));
    println!("  Receipts:            {}", kpis.receipt_count);
    println!("  Average per receipt: {}€", format_money(kpis.average_per_receipt));
    if let Some(category) = kpis.top_category {
        println!("  Top category:        {}", category);
    }

    let monthly = analytics::monthly_analysis(&rows, today());
    println!("\n📅 {} vs {}", monthly.current_month, monthly.previous_month);
    println!("  This month:     {}€", format_money(monthly.current_month_spend));
    println!("  Previous month: {}€", format_money(monthly.previous_month_spend));
    println!("  Monthly avg:    {}€", format_money(monthly.average_monthly_spend));
    match monthly.delta_vs_previous_pct {
        Some(pct) => println!("  Δ previous:     {}€ ({}%)", format_money(monthly.delta_vs_previous), pct),
        None => println!("  Δ previous:     {}€", format_money(monthly.delta_vs_previous)),
    }
    Ok(())
}

fn run_export(db_path: &Path, output: &Path) -> Result<()> {
    let conn = open(db_path)?;
    let count = db::export_items_csv(&conn, output)
        .with_context(|| format!("Failed to export items to {:?}", output))?;
    println!("✓ Exported {} items to {:?}", count, output);
    Ok(())
}
