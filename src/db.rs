use crate::models::{Category, Item, Receipt, ReceiptStatus};
use crate::schema::StructuredReceiptData;
use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info};

/// Event for audit trail (every state change of a receipt is an event)
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Event {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub entity_type: String,
    pub entity_id: String,
    pub data: serde_json::Value,
    pub actor: String,
}

impl Event {
    pub fn new(
        event_type: &str,
        entity_type: &str,
        entity_id: &str,
        data: serde_json::Value,
        actor: &str,
    ) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            event_type: event_type.to_string(),
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            data,
            actor: actor.to_string(),
        }
    }

    pub fn for_receipt(event_type: &str, receipt_id: &str, data: serde_json::Value, actor: &str) -> Self {
        Self::new(event_type, "receipt", receipt_id, data, actor)
    }
}

/// Outcome of submitting OCR text
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    Created(Receipt),
    /// Same text already submitted by this user; carries the existing receipt id
    Duplicate(String),
}

/// A processed receipt inserted directly (demo data)
#[derive(Debug, Clone)]
pub struct NewProcessedReceipt {
    pub user_id: String,
    pub merchant: String,
    pub receipt_date: NaiveDate,
    pub total_amount: Decimal,
    pub items: Vec<NewItem>,
}

#[derive(Debug, Clone)]
pub struct NewItem {
    pub name: String,
    pub price: Decimal,
    pub quantity: u32,
    pub category: Category,
}

/// An item joined with its receipt, the shape analytics work on
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisRow {
    pub receipt_id: String,
    pub receipt_date: Option<NaiveDate>,
    pub merchant: Option<String>,
    pub status: ReceiptStatus,
    pub name: String,
    pub price: Decimal,
    pub quantity: u32,
    pub category: Category,
    pub total_price: Decimal,
}

/// Normalized hash of OCR text, used for duplicate detection
/// NOTE: whitespace runs are collapsed so re-OCR of the same print matches
pub fn compute_text_hash(text: &str) -> String {
    let normalized = text.split_whitespace().collect::<Vec<_>>().join(" ");
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    format!("{:x}", hasher.finalize())
}

pub fn open_database(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)
        .with_context(|| format!("Failed to open database at {:?}", path))?;
    setup_database(&conn)?;
    Ok(conn)
}

pub fn setup_database(conn: &Connection) -> Result<()> {
    // Enable WAL mode for crash recovery
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;

    // ==========================================================================
    // Receipts Table
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS receipts (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            extracted_text TEXT,
            text_hash TEXT,
            status TEXT NOT NULL DEFAULT 'pending'
                CHECK (status IN ('pending', 'processing', 'processed', 'failed')),
            merchant TEXT,
            receipt_date TEXT,
            total_amount TEXT,
            failure_reason TEXT,
            attempts INTEGER NOT NULL DEFAULT 0
        )",
        [],
    )?;

    // ==========================================================================
    // Items Table
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS items (
            id TEXT PRIMARY KEY,
            receipt_id TEXT NOT NULL REFERENCES receipts(id) ON DELETE CASCADE,
            name TEXT NOT NULL CHECK (length(name) > 0),
            price TEXT NOT NULL,
            quantity INTEGER NOT NULL CHECK (quantity >= 1),
            category TEXT NOT NULL
        )",
        [],
    )?;

    // ==========================================================================
    // Events Table (audit trail)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id TEXT UNIQUE NOT NULL,
            timestamp TEXT NOT NULL,
            event_type TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            data TEXT NOT NULL,
            actor TEXT NOT NULL,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    // ==========================================================================
    // Indexes
    // ==========================================================================
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_receipts_text_hash
         ON receipts(user_id, text_hash) WHERE text_hash IS NOT NULL",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_receipts_status ON receipts(status, created_at)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_receipts_date ON receipts(receipt_date)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_items_receipt ON items(receipt_id)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_events_entity ON events(entity_type, entity_id)",
        [],
    )?;

    Ok(())
}

// ============================================================================
// ROW MAPPING
// ============================================================================

const RECEIPT_COLUMNS: &str = "id, user_id, created_at, updated_at, extracted_text, status,
     merchant, receipt_date, total_amount, failure_reason, attempts";

fn conversion_error(idx: usize, err: impl std::fmt::Display) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, err.to_string())),
    )
}

fn parse_timestamp(idx: usize, value: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn parse_date(idx: usize, value: Option<String>) -> rusqlite::Result<Option<NaiveDate>> {
    value
        .map(|s| NaiveDate::parse_from_str(&s, "%Y-%m-%d").map_err(|e| conversion_error(idx, e)))
        .transpose()
}

fn parse_decimal(idx: usize, value: &str) -> rusqlite::Result<Decimal> {
    Decimal::from_str(value).map_err(|e| conversion_error(idx, e))
}

fn receipt_from_row(row: &Row<'_>) -> rusqlite::Result<Receipt> {
    let created_at: String = row.get(2)?;
    let updated_at: String = row.get(3)?;
    let status: String = row.get(5)?;
    let receipt_date: Option<String> = row.get(7)?;
    let total_amount: Option<String> = row.get(8)?;

    Ok(Receipt {
        id: row.get(0)?,
        user_id: row.get(1)?,
        created_at: parse_timestamp(2, &created_at)?,
        updated_at: parse_timestamp(3, &updated_at)?,
        extracted_text: row.get(4)?,
        status: status.parse().map_err(|e: String| conversion_error(5, e))?,
        merchant: row.get(6)?,
        receipt_date: parse_date(7, receipt_date)?,
        total_amount: total_amount
            .as_deref()
            .map(|s| parse_decimal(8, s))
            .transpose()?,
        failure_reason: row.get(9)?,
        attempts: row.get(10)?,
    })
}

fn item_from_row(row: &Row<'_>) -> rusqlite::Result<Item> {
    let price: String = row.get(3)?;
    let category: String = row.get(5)?;

    Ok(Item {
        id: row.get(0)?,
        receipt_id: row.get(1)?,
        name: row.get(2)?,
        price: parse_decimal(3, &price)?,
        quantity: row.get(4)?,
        category: category.parse().map_err(|e: String| conversion_error(5, e))?,
    })
}

// ============================================================================
// INGESTION
// ============================================================================

/// Store OCR text as a pending receipt (idempotent per user + text)
pub fn submit_receipt(conn: &Connection, user_id: &str, extracted_text: &str, actor: &str) -> Result<SubmitOutcome> {
    let hash = compute_text_hash(extracted_text);
    let now = Utc::now();
    let id = uuid::Uuid::new_v4().to_string();

    let result = conn.execute(
        "INSERT INTO receipts (id, user_id, created_at, updated_at, extracted_text, text_hash, status)
         VALUES (?1, ?2, ?3, ?3, ?4, ?5, 'pending')",
        params![id, user_id, now.to_rfc3339(), extracted_text, hash],
    );

    match result {
        Ok(_) => {
            insert_event(
                conn,
                &Event::for_receipt(
                    "receipt_submitted",
                    &id,
                    serde_json::json!({ "user_id": user_id, "text_hash": hash }),
                    actor,
                ),
            )?;
            debug!(receipt_id = %id, "receipt submitted");
            let receipt = get_receipt(conn, &id)?
                .with_context(|| format!("Receipt {} vanished after insert", id))?;
            Ok(SubmitOutcome::Created(receipt))
        }
        Err(rusqlite::Error::SqliteFailure(err, _))
            if err.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            let existing: String = conn.query_row(
                "SELECT id FROM receipts WHERE user_id = ?1 AND text_hash = ?2",
                params![user_id, hash],
                |row| row.get(0),
            )?;
            Ok(SubmitOutcome::Duplicate(existing))
        }
        Err(e) => Err(e.into()),
    }
}

/// Insert an already-processed receipt with its items in one transaction
pub fn insert_processed_receipt(conn: &Connection, receipt: &NewProcessedReceipt, actor: &str) -> Result<String> {
    let tx = conn.unchecked_transaction()?;
    let id = uuid::Uuid::new_v4().to_string();
    let now = Utc::now().to_rfc3339();

    tx.execute(
        "INSERT INTO receipts (id, user_id, created_at, updated_at, status, merchant, receipt_date, total_amount)
         VALUES (?1, ?2, ?3, ?3, 'processed', ?4, ?5, ?6)",
        params![
            id,
            receipt.user_id,
            now,
            receipt.merchant,
            receipt.receipt_date.format("%Y-%m-%d").to_string(),
            receipt.total_amount.to_string(),
        ],
    )?;

    insert_items(&tx, &id, &receipt.items)?;

    insert_event(
        &tx,
        &Event::for_receipt(
            "receipt_imported",
            &id,
            serde_json::json!({ "merchant": receipt.merchant, "items": receipt.items.len() }),
            actor,
        ),
    )?;

    tx.commit()?;
    Ok(id)
}

fn insert_items(conn: &Connection, receipt_id: &str, items: &[NewItem]) -> Result<()> {
    let mut stmt = conn.prepare(
        "INSERT INTO items (id, receipt_id, name, price, quantity, category)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
    )?;

    for item in items {
        stmt.execute(params![
            uuid::Uuid::new_v4().to_string(),
            receipt_id,
            item.name,
            item.price.to_string(),
            item.quantity,
            item.category.as_str(),
        ])?;
    }

    Ok(())
}

// ============================================================================
// QUERIES
// ============================================================================

pub fn get_receipt(conn: &Connection, id: &str) -> Result<Option<Receipt>> {
    let receipt = conn
        .query_row(
            &format!("SELECT {} FROM receipts WHERE id = ?1", RECEIPT_COLUMNS),
            [id],
            receipt_from_row,
        )
        .optional()?;

    Ok(receipt)
}

pub fn get_all_receipts(conn: &Connection) -> Result<Vec<Receipt>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM receipts ORDER BY created_at DESC, id",
        RECEIPT_COLUMNS
    ))?;

    let receipts = stmt
        .query_map([], receipt_from_row)?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(receipts)
}

pub fn get_receipts_by_status(conn: &Connection, status: ReceiptStatus) -> Result<Vec<Receipt>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM receipts WHERE status = ?1 ORDER BY created_at DESC, id",
        RECEIPT_COLUMNS
    ))?;

    let receipts = stmt
        .query_map([status.as_str()], receipt_from_row)?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(receipts)
}

/// Oldest pending receipts first
pub fn fetch_pending_receipts(conn: &Connection, limit: usize) -> Result<Vec<Receipt>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM receipts WHERE status = 'pending' ORDER BY created_at ASC, id LIMIT ?1",
        RECEIPT_COLUMNS
    ))?;

    let receipts = stmt
        .query_map([limit as i64], receipt_from_row)?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(receipts)
}

pub fn get_items_for_receipt(conn: &Connection, receipt_id: &str) -> Result<Vec<Item>> {
    let mut stmt = conn.prepare(
        "SELECT id, receipt_id, name, price, quantity, category
         FROM items WHERE receipt_id = ?1 ORDER BY rowid",
    )?;

    let items = stmt
        .query_map([receipt_id], item_from_row)?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(items)
}

/// Items joined with their receipt; receipts without items do not appear
pub fn get_analysis_rows(conn: &Connection) -> Result<Vec<AnalysisRow>> {
    let mut stmt = conn.prepare(
        "SELECT i.receipt_id, r.receipt_date, r.merchant, r.status,
                i.name, i.price, i.quantity, i.category
         FROM items i
         LEFT JOIN receipts r ON r.id = i.receipt_id
         ORDER BY r.receipt_date, i.rowid",
    )?;

    let rows = stmt
        .query_map([], |row| {
            let receipt_date: Option<String> = row.get(1)?;
            let status: Option<String> = row.get(3)?;
            let price: String = row.get(5)?;
            let quantity: u32 = row.get(6)?;
            let category: String = row.get(7)?;

            let price = parse_decimal(5, &price)?;

            Ok(AnalysisRow {
                receipt_id: row.get(0)?,
                receipt_date: parse_date(1, receipt_date)?,
                merchant: row.get(2)?,
                status: status
                    .as_deref()
                    .unwrap_or("pending")
                    .parse()
                    .map_err(|e: String| conversion_error(3, e))?,
                name: row.get(4)?,
                price,
                quantity,
                category: category.parse().map_err(|e: String| conversion_error(7, e))?,
                total_price: price
                    .checked_mul(Decimal::from(quantity))
                    .ok_or_else(|| conversion_error(5, "amount out of range"))?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(rows)
}

pub fn count_receipts(conn: &Connection) -> Result<i64> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM receipts", [], |row| row.get(0))?;

    Ok(count)
}

/// Receipt counts per status (every status present, zero when empty)
pub fn count_by_status(conn: &Connection) -> Result<Vec<(ReceiptStatus, i64)>> {
    let mut counts = Vec::with_capacity(ReceiptStatus::ALL.len());
    for status in ReceiptStatus::ALL {
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM receipts WHERE status = ?1",
            [status.as_str()],
            |row| row.get(0),
        )?;
        counts.push((status, count));
    }
    Ok(counts)
}

// ============================================================================
// STATUS TRANSITIONS
// ============================================================================

/// pending → processing. Returns false when someone else already claimed it.
pub fn claim_receipt(conn: &Connection, receipt_id: &str) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE receipts
         SET status = 'processing', attempts = attempts + 1, updated_at = ?2
         WHERE id = ?1 AND status = 'pending'",
        params![receipt_id, Utc::now().to_rfc3339()],
    )?;

    Ok(changed == 1)
}

/// processing → processed, replacing any previous items atomically
pub fn save_extraction(conn: &Connection, receipt_id: &str, data: &StructuredReceiptData, actor: &str) -> Result<()> {
    let tx = conn.unchecked_transaction()?;

    let changed = tx.execute(
        "UPDATE receipts
         SET status = 'processed', merchant = ?2, receipt_date = ?3, total_amount = ?4,
             failure_reason = NULL, updated_at = ?5
         WHERE id = ?1 AND status = 'processing'",
        params![
            receipt_id,
            data.merchant,
            data.receipt_date.format("%Y-%m-%d").to_string(),
            data.total_amount.to_string(),
            Utc::now().to_rfc3339(),
        ],
    )?;

    if changed != 1 {
        anyhow::bail!("Receipt {} is not in processing state", receipt_id);
    }

    tx.execute("DELETE FROM items WHERE receipt_id = ?1", [receipt_id])?;

    let items: Vec<NewItem> = data
        .items
        .iter()
        .map(|item| NewItem {
            name: item.name.clone(),
            price: item.price,
            quantity: item.quantity,
            category: item.category,
        })
        .collect();
    insert_items(&tx, receipt_id, &items)?;

    insert_event(
        &tx,
        &Event::for_receipt(
            "receipt_processed",
            receipt_id,
            serde_json::json!({
                "merchant": data.merchant,
                "total_amount": data.total_amount.to_string(),
                "items": data.items.len(),
            }),
            actor,
        ),
    )?;

    tx.commit()?;
    Ok(())
}

/// processing → failed, keeping the reason for the developer queue
pub fn mark_failed(conn: &Connection, receipt_id: &str, reason: &str, actor: &str) -> Result<()> {
    let tx = conn.unchecked_transaction()?;

    let changed = tx.execute(
        "UPDATE receipts SET status = 'failed', failure_reason = ?2, updated_at = ?3
         WHERE id = ?1 AND status = 'processing'",
        params![receipt_id, reason, Utc::now().to_rfc3339()],
    )?;

    if changed != 1 {
        anyhow::bail!("Receipt {} is not in processing state", receipt_id);
    }

    insert_event(
        &tx,
        &Event::for_receipt(
            "receipt_failed",
            receipt_id,
            serde_json::json!({ "reason": reason }),
            actor,
        ),
    )?;

    tx.commit()?;
    Ok(())
}

/// processing → pending without counting it as a failure
pub fn release_receipt(conn: &Connection, receipt_id: &str) -> Result<()> {
    conn.execute(
        "UPDATE receipts SET status = 'pending', updated_at = ?2
         WHERE id = ?1 AND status = 'processing'",
        params![receipt_id, Utc::now().to_rfc3339()],
    )?;

    Ok(())
}

/// failed → pending for every failed receipt; returns how many were reset
pub fn reset_failed_to_pending(conn: &Connection, actor: &str) -> Result<usize> {
    let ids: Vec<String> = {
        let mut stmt = conn.prepare("SELECT id FROM receipts WHERE status = 'failed'")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        ids
    };

    let tx = conn.unchecked_transaction()?;
    let reset = tx.execute(
        "UPDATE receipts SET status = 'pending', updated_at = ?1 WHERE status = 'failed'",
        [Utc::now().to_rfc3339()],
    )?;

    for id in &ids {
        insert_event(
            &tx,
            &Event::for_receipt("receipt_retried", id, serde_json::json!({}), actor),
        )?;
    }
    tx.commit()?;

    info!(count = reset, "failed receipts reset to pending");
    Ok(reset)
}

/// processing → pending for rows claimed before `cutoff`, i.e. left behind by a
/// crashed run. Rows claimed more recently belong to a live processor.
pub fn reset_stale_processing(conn: &Connection, cutoff: DateTime<Utc>) -> Result<usize> {
    let claimed: Vec<(String, String)> = {
        let mut stmt = conn.prepare("SELECT id, updated_at FROM receipts WHERE status = 'processing'")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        rows
    };

    let mut reset = 0;
    for (id, updated_at) in claimed {
        let claimed_at = parse_timestamp(1, &updated_at)?;
        if claimed_at >= cutoff {
            continue;
        }

        // Only if nobody touched the row since we read it
        reset += conn.execute(
            "UPDATE receipts SET status = 'pending', updated_at = ?3
             WHERE id = ?1 AND status = 'processing' AND updated_at = ?2",
            params![id, updated_at, Utc::now().to_rfc3339()],
        )?;
    }

    if reset > 0 {
        info!(count = reset, "stale processing receipts reset to pending");
    }
    Ok(reset)
}

/// Delete every item, receipt and event
pub fn clear_all(conn: &Connection) -> Result<()> {
    conn.execute("DELETE FROM items", [])?;
    conn.execute("DELETE FROM receipts", [])?;
    conn.execute("DELETE FROM events", [])?;
    Ok(())
}

// ============================================================================
// AUDIT TRAIL
// ============================================================================

/// Insert event into audit trail
pub fn insert_event(conn: &Connection, event: &Event) -> Result<()> {
    let data_json = serde_json::to_string(&event.data)?;

    conn.execute(
        "INSERT INTO events (
            event_id, timestamp, event_type, entity_type, entity_id, data, actor
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            event.event_id,
            event.timestamp.to_rfc3339(),
            event.event_type,
            event.entity_type,
            event.entity_id,
            data_json,
            event.actor,
        ],
    )?;

    Ok(())
}

/// Get events for a specific entity, newest first
pub fn get_events_for_entity(
    conn: &Connection,
    entity_type: &str,
    entity_id: &str,
) -> Result<Vec<Event>> {
    let mut stmt = conn.prepare(
        "SELECT event_id, timestamp, event_type, entity_type, entity_id, data, actor
         FROM events
         WHERE entity_type = ?1 AND entity_id = ?2
         ORDER BY timestamp DESC, id DESC",
    )?;

    let events = stmt
        .query_map(params![entity_type, entity_id], |row| {
            let timestamp_str: String = row.get(1)?;
            let data_json: String = row.get(5)?;

            Ok(Event {
                event_id: row.get(0)?,
                timestamp: parse_timestamp(1, &timestamp_str)?,
                event_type: row.get(2)?,
                entity_type: row.get(3)?,
                entity_id: row.get(4)?,
                data: serde_json::from_str(&data_json).map_err(|e| conversion_error(5, e))?,
                actor: row.get(6)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(events)
}

// ============================================================================
// EXPORT
// ============================================================================

#[derive(Serialize)]
struct ExportRow<'a> {
    receipt_id: &'a str,
    receipt_date: String,
    merchant: &'a str,
    name: &'a str,
    quantity: u32,
    price: String,
    total_price: String,
    category: &'a str,
}

/// Write every item (joined with its receipt) as CSV; returns the row count
pub fn export_items_csv(conn: &Connection, path: &Path) -> Result<usize> {
    let rows = get_analysis_rows(conn)?;
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("Failed to create CSV file {:?}", path))?;

    for row in &rows {
        writer.serialize(ExportRow {
            receipt_id: &row.receipt_id,
            receipt_date: row
                .receipt_date
                .map(|d| d.format("%Y-%m-%d").to_string())
                .unwrap_or_default(),
            merchant: row.merchant.as_deref().unwrap_or(""),
            name: &row.name,
            quantity: row.quantity,
            price: row.price.to_string(),
            total_price: row.total_price.to_string(),
            category: row.category.as_str(),
        })?;
    }

    writer.flush()?;
    Ok(rows.len())
}
