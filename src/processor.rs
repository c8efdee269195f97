// ⚙️ Receipt Processor - pending receipts → LLM → validated rows
//
// One batch at a time. Each receipt is claimed (pending → processing) with a
// conditional update, extracted, validated against the receipt schema, and
// either saved (processed) or marked failed with a reason.
//
// The SQLite lock is only taken inside `with_conn`, never across an await.
// A claim is a lease: rows stuck in `processing` longer than `stale_after`
// are assumed orphaned by a crashed run and go back to pending.

use crate::config::Settings;
use crate::db;
use crate::llm::{LlmError, ReceiptExtractor};
use crate::models::Receipt;
use crate::schema::{format_errors, parse_structured_receipt};
use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use rusqlite::Connection;
use serde::Serialize;
use serde_json::Value;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

const ACTOR: &str = "llm_processor";

// ============================================================================
// OPTIONS + REPORT
// ============================================================================

#[derive(Debug, Clone)]
pub struct ProcessorOptions {
    /// Maximum receipts claimed per batch
    pub batch_size: usize,
    /// Tries per receipt for transient LLM errors
    pub max_attempts: u32,
    /// Linear backoff unit between tries
    pub retry_backoff: Duration,
    /// How long a claim may stay in `processing` before another run reclaims it
    pub stale_after: Duration,
}

impl Default for ProcessorOptions {
    fn default() -> Self {
        ProcessorOptions {
            batch_size: 50,
            max_attempts: 3,
            retry_backoff: Duration::from_millis(500),
            stale_after: Duration::from_secs(300),
        }
    }
}

impl From<&Settings> for ProcessorOptions {
    fn from(settings: &Settings) -> Self {
        let retry_backoff = Duration::from_millis(settings.llm_retry_backoff_ms);
        ProcessorOptions {
            batch_size: settings.process_batch_size,
            max_attempts: settings.llm_max_attempts,
            retry_backoff,
            stale_after: claim_lease(
                Duration::from_secs(settings.llm_timeout_secs),
                settings.llm_max_attempts,
                retry_backoff,
            ),
        }
    }
}

/// Worst case time one receipt stays claimed (every try timing out, every
/// backoff slept) plus a minute for validation and the write.
fn claim_lease(timeout: Duration, max_attempts: u32, backoff: Duration) -> Duration {
    let backoff_units = u64::from(max_attempts) * u64::from(max_attempts.saturating_sub(1)) / 2;
    timeout
        .saturating_mul(max_attempts)
        .saturating_add(backoff.saturating_mul(u32::try_from(backoff_units).unwrap_or(u32::MAX)))
        .saturating_add(Duration::from_secs(60))
}

#[derive(Debug, Clone, Serialize)]
pub struct ReceiptFailure {
    pub receipt_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessingReport {
    pub examined: usize,
    pub processed: usize,
    pub failed: usize,
    /// Claimed by someone else between fetch and claim
    pub skipped: usize,
    pub failures: Vec<ReceiptFailure>,
    /// Set when a fatal LLM error stopped the batch early
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aborted: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl ProcessingReport {
    fn start(examined: usize) -> Self {
        let now = Utc::now();
        ProcessingReport {
            examined,
            processed: 0,
            failed: 0,
            skipped: 0,
            failures: Vec::new(),
            aborted: None,
            started_at: now,
            finished_at: now,
        }
    }

    fn record_failure(&mut self, receipt_id: &str, reason: String) {
        warn!(receipt_id = %receipt_id, reason = %reason, "receipt failed");
        self.failed += 1;
        self.failures.push(ReceiptFailure {
            receipt_id: receipt_id.to_string(),
            reason,
        });
    }

    pub fn summary(&self) -> String {
        format!(
            "{} examined, {} processed, {} failed, {} skipped",
            self.examined, self.processed, self.failed, self.skipped
        )
    }
}

enum Outcome {
    Processed,
    Failed(String),
    Aborted(LlmError),
}

/// Clears the running flag when the batch ends, even on panic
struct RunGuard {
    flag: Arc<AtomicBool>,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

// ============================================================================
// PROCESSOR
// ============================================================================

pub struct ReceiptProcessor {
    db: Arc<Mutex<Connection>>,
    extractor: Arc<dyn ReceiptExtractor>,
    options: ProcessorOptions,
    running: Arc<AtomicBool>,
    last_report: Mutex<Option<ProcessingReport>>,
}

impl ReceiptProcessor {
    /// Create a processor; receipts whose claim expired go back to pending
    pub fn new(
        db: Arc<Mutex<Connection>>,
        extractor: Arc<dyn ReceiptExtractor>,
        options: ProcessorOptions,
    ) -> Result<Self> {
        let processor = ReceiptProcessor {
            db,
            extractor,
            options,
            running: Arc::new(AtomicBool::new(false)),
            last_report: Mutex::new(None),
        };

        processor.recover_stale()?;
        Ok(processor)
    }

    /// Reset claims older than `stale_after`; returns how many were reset
    fn recover_stale(&self) -> Result<usize> {
        let lease = chrono::Duration::from_std(self.options.stale_after)
            .map_err(|e| anyhow!("Invalid claim lease: {}", e))?;
        let Some(cutoff) = Utc::now().checked_sub_signed(lease) else {
            return Ok(0);
        };

        let recovered = self.with_conn(|conn| db::reset_stale_processing(conn, cutoff))?;
        if recovered > 0 {
            warn!(count = recovered, "reset receipts left in processing state");
        }
        Ok(recovered)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn last_report(&self) -> Option<ProcessingReport> {
        self.last_report.lock().ok().and_then(|report| report.clone())
    }

    fn try_begin(&self) -> Option<RunGuard> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RunGuard {
                flag: Arc::clone(&self.running),
            })
    }

    /// Run one batch in the current task
    pub async fn run_batch(&self) -> Result<ProcessingReport> {
        let _guard = self
            .try_begin()
            .ok_or_else(|| anyhow!("A processing batch is already running"))?;
        self.process_pending().await
    }

    /// Start a batch on a background task. `None` when one is already running.
    pub fn spawn_batch(self: &Arc<Self>) -> Option<JoinHandle<Result<ProcessingReport>>> {
        let guard = self.try_begin()?;
        let processor = Arc::clone(self);

        Some(tokio::spawn(async move {
            let _guard = guard;
            let result = processor.process_pending().await;
            match &result {
                Ok(report) => info!(summary = %report.summary(), "receipt batch finished"),
                Err(e) => error!(error = %e, "receipt batch failed"),
            }
            result
        }))
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        // A panic while holding the lock leaves SQLite itself consistent
        let conn = self.db.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&conn)
    }

    fn release(&self, receipt_id: &str) {
        if let Err(e) = self.with_conn(|conn| db::release_receipt(conn, receipt_id)) {
            error!(receipt_id = %receipt_id, error = %e, "failed to release receipt");
        }
    }

    fn store_report(&self, report: &ProcessingReport) {
        if let Ok(mut last) = self.last_report.lock() {
            *last = Some(report.clone());
        }
    }

    async fn process_pending(&self) -> Result<ProcessingReport> {
        self.recover_stale()?;

        let batch_size = self.options.batch_size;
        let pending = self.with_conn(|conn| db::fetch_pending_receipts(conn, batch_size))?;
        let mut report = ProcessingReport::start(pending.len());

        info!(count = pending.len(), model = %self.extractor.model(), "processing pending receipts");

        let result = self.process_receipts(&pending, &mut report).await;

        if let Err(e) = &result {
            report.aborted = Some(format!("{:#}", e));
        }
        report.finished_at = Utc::now();
        self.store_report(&report);
        result.map(|()| report)
    }

    /// Claim and process each receipt. A claimed receipt never stays in
    /// `processing`: it ends processed, failed, or released back to pending.
    async fn process_receipts(&self, pending: &[Receipt], report: &mut ProcessingReport) -> Result<()> {
        for receipt in pending {
            if !self.with_conn(|conn| db::claim_receipt(conn, &receipt.id))? {
                report.skipped += 1;
                continue;
            }

            match AssertUnwindSafe(self.process_claimed(receipt)).catch_unwind().await {
                Ok(Ok(Outcome::Processed)) => report.processed += 1,
                Ok(Ok(Outcome::Failed(reason))) => report.record_failure(&receipt.id, reason),
                Ok(Ok(Outcome::Aborted(err))) => {
                    self.release(&receipt.id);
                    return Err(anyhow::Error::new(err).context("Receipt processing aborted"));
                }
                Ok(Err(e)) => {
                    self.release(&receipt.id);
                    return Err(e.context("Receipt processing aborted"));
                }
                Err(panic) => {
                    let reason = format!("Processing panicked: {}", panic_message(panic.as_ref()));
                    error!(receipt_id = %receipt.id, reason = %reason, "receipt processing panicked");
                    if let Err(e) = self.with_conn(|conn| db::mark_failed(conn, &receipt.id, &reason, ACTOR)) {
                        error!(receipt_id = %receipt.id, error = %e, "failed to mark receipt failed");
                        self.release(&receipt.id);
                    }
                    report.record_failure(&receipt.id, reason);
                }
            }
        }

        Ok(())
    }

    async fn process_claimed(&self, receipt: &Receipt) -> Result<Outcome> {
        let Some(text) = receipt
            .extracted_text
            .as_deref()
            .filter(|t| !t.trim().is_empty())
        else {
            return self.fail(&receipt.id, "Receipt has no extracted text".to_string());
        };

        let value = match self.extract_with_retry(text).await {
            Ok(value) => value,
            Err(e) if e.is_fatal() => return Ok(Outcome::Aborted(e)),
            Err(e) => return self.fail(&receipt.id, e.to_string()),
        };

        match parse_structured_receipt(&value) {
            Ok(data) => {
                self.with_conn(|conn| db::save_extraction(conn, &receipt.id, &data, ACTOR))?;
                info!(receipt_id = %receipt.id, merchant = %data.merchant, items = data.items.len(), "receipt processed");
                Ok(Outcome::Processed)
            }
            Err(errors) => self.fail(&receipt.id, format_errors(&errors)),
        }
    }

    fn fail(&self, receipt_id: &str, reason: String) -> Result<Outcome> {
        self.with_conn(|conn| db::mark_failed(conn, receipt_id, &reason, ACTOR))?;
        Ok(Outcome::Failed(reason))
    }

    async fn extract_with_retry(&self, text: &str) -> Result<Value, LlmError> {
        let mut attempt = 1;
        loop {
            match self.extractor.extract(text).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.options.max_attempts => {
                    warn!(attempt, error = %e, "transient LLM error, retrying");
                    tokio::time::sleep(self.options.retry_backoff * attempt).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

// ============================================================================
// TEST SUPPORT
// ============================================================================

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    /// Replays canned answers in order; runs dry with `EmptyResponse`
    pub struct ScriptedExtractor {
        responses: Mutex<VecDeque<Result<Value, LlmError>>>,
        pub calls: AtomicUsize,
        gate: Option<Arc<Notify>>,
    }

    impl ScriptedExtractor {
        pub fn new(responses: Vec<Result<Value, LlmError>>) -> Self {
            ScriptedExtractor {
                responses: Mutex::new(responses.into()),
                calls: AtomicUsize::new(0),
                gate: None,
            }
        }

        /// Every call waits until the gate is notified
        pub fn gated(responses: Vec<Result<Value, LlmError>>, gate: Arc<Notify>) -> Self {
            ScriptedExtractor {
                gate: Some(gate),
                ..Self::new(responses)
            }
        }

        pub fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ReceiptExtractor for ScriptedExtractor {
        async fn extract(&self, _receipt_text: &str) -> Result<Value, LlmError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Err(LlmError::EmptyResponse))
        }

        fn model(&self) -> &str {
            "scripted"
        }
    }

    pub fn status_error(code: u16) -> LlmError {
        LlmError::Status {
            status: reqwest::StatusCode::from_u16(code).unwrap(),
            body: "test".to_string(),
        }
    }

    pub fn valid_answer() -> Value {
        serde_json::json!({
            "merchant": "Carrefour",
            "receipt_date": "2024-06-03",
            "total_amount": "7.25 EUR",
            "items": [
                {"name": "Camembert Président", "quantity": 1, "price": 2.75, "category": "Alimentation"},
                {"name": "Pâtes Barilla", "quantity": 3, "price": 1.5, "category": "Alimentation"}
            ]
        })
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::db::SubmitOutcome;
    use crate::models::{ReceiptStatus, DEMO_USER_ID};
    use serde_json::json;
    use tokio::sync::Notify;

    fn shared_db() -> Arc<Mutex<Connection>> {
        let conn = Connection::open_in_memory().unwrap();
        db::setup_database(&conn).unwrap();
        Arc::new(Mutex::new(conn))
    }

    fn submit(db: &Arc<Mutex<Connection>>, text: &str) -> String {
        let conn = db.lock().unwrap();
        match db::submit_receipt(&conn, DEMO_USER_ID, text, "test").unwrap() {
            SubmitOutcome::Created(receipt) => receipt.id,
            SubmitOutcome::Duplicate(id) => id,
        }
    }

    fn status_of(db: &Arc<Mutex<Connection>>, id: &str) -> ReceiptStatus {
        let conn = db.lock().unwrap();
        db::get_receipt(&conn, id).unwrap().unwrap().status
    }

    fn fast_options() -> ProcessorOptions {
        ProcessorOptions {
            batch_size: 10,
            max_attempts: 3,
            retry_backoff: Duration::ZERO,
            stale_after: Duration::from_secs(60),
        }
    }

    fn processor(db: &Arc<Mutex<Connection>>, extractor: ScriptedExtractor) -> (ReceiptProcessor, Arc<ScriptedExtractor>) {
        let extractor = Arc::new(extractor);
        let processor = ReceiptProcessor::new(db.clone(), extractor.clone(), fast_options()).unwrap();
        (processor, extractor)
    }

    #[tokio::test]
    async fn test_valid_answer_is_saved() {
        let db = shared_db();
        let id = submit(&db, "CARREFOUR\nTOTAL A PAYER 7.25 EUR");
        let (processor, _) = processor(&db, ScriptedExtractor::new(vec![Ok(valid_answer())]));

        let report = processor.run_batch().await.unwrap();

        assert_eq!(report.examined, 1);
        assert_eq!(report.processed, 1);
        assert_eq!(report.failed, 0);
        assert_eq!(status_of(&db, &id), ReceiptStatus::Processed);

        let conn = db.lock().unwrap();
        let items = db::get_items_for_receipt(&conn, &id).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[1].quantity, 3);
    }

    #[tokio::test]
    async fn test_invalid_answer_marks_failed_without_items() {
        let db = shared_db();
        let id = submit(&db, "BROKEN RECEIPT");
        let mut answer = valid_answer();
        answer["total_amount"] = json!(99.99);
        let (processor, _) = processor(&db, ScriptedExtractor::new(vec![Ok(answer)]));

        let report = processor.run_batch().await.unwrap();

        assert_eq!(report.failed, 1);
        assert!(report.failures[0].reason.contains("does not match the receipt total amount"));
        assert_eq!(status_of(&db, &id), ReceiptStatus::Failed);

        let conn = db.lock().unwrap();
        assert!(db::get_items_for_receipt(&conn, &id).unwrap().is_empty());
        let receipt = db::get_receipt(&conn, &id).unwrap().unwrap();
        assert!(receipt.failure_reason.unwrap().starts_with("[Receipt] total_amount"));
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let db = shared_db();
        let id = submit(&db, "LECLERC");
        let (processor, extractor) = processor(
            &db,
            ScriptedExtractor::new(vec![Err(status_error(503)), Ok(valid_answer())]),
        );

        let report = processor.run_batch().await.unwrap();

        assert_eq!(report.processed, 1);
        assert_eq!(extractor.call_count(), 2);
        assert_eq!(status_of(&db, &id), ReceiptStatus::Processed);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let db = shared_db();
        let id = submit(&db, "LECLERC");
        let (processor, extractor) = processor(
            &db,
            ScriptedExtractor::new(vec![
                Err(status_error(500)),
                Err(status_error(502)),
                Err(status_error(503)),
                Ok(valid_answer()),
            ]),
        );

        let report = processor.run_batch().await.unwrap();

        assert_eq!(report.failed, 1);
        assert_eq!(extractor.call_count(), 3);
        assert_eq!(status_of(&db, &id), ReceiptStatus::Failed);
    }

    #[tokio::test]
    async fn test_fatal_error_aborts_and_releases() {
        let db = shared_db();
        let first = submit(&db, "FIRST");
        let second = submit(&db, "SECOND");
        let (processor, extractor) = processor(&db, ScriptedExtractor::new(vec![Err(status_error(401))]));

        let err = processor.run_batch().await.unwrap_err();

        assert!(err.to_string().contains("aborted"));
        assert_eq!(extractor.call_count(), 1);
        assert_eq!(status_of(&db, &first), ReceiptStatus::Pending);
        assert_eq!(status_of(&db, &second), ReceiptStatus::Pending);

        let report = processor.last_report().unwrap();
        assert!(report.aborted.is_some());
        assert!(!processor.is_running());
    }

    #[tokio::test]
    async fn test_blank_text_fails_without_llm_call() {
        let db = shared_db();
        let id = submit(&db, "   ");
        let (processor, extractor) = processor(&db, ScriptedExtractor::new(vec![]));

        let report = processor.run_batch().await.unwrap();

        assert_eq!(report.failed, 1);
        assert_eq!(report.failures[0].reason, "Receipt has no extracted text");
        assert_eq!(extractor.call_count(), 0);
        assert_eq!(status_of(&db, &id), ReceiptStatus::Failed);
    }

    #[tokio::test]
    async fn test_batch_size_limits_claims() {
        let db = shared_db();
        for text in ["A", "B", "C"] {
            submit(&db, text);
        }
        let extractor = Arc::new(ScriptedExtractor::new(vec![Ok(valid_answer()), Ok(valid_answer())]));
        let options = ProcessorOptions {
            batch_size: 2,
            ..fast_options()
        };
        let processor = ReceiptProcessor::new(db.clone(), extractor, options).unwrap();

        let report = processor.run_batch().await.unwrap();

        assert_eq!(report.examined, 2);
        let conn = db.lock().unwrap();
        assert_eq!(db::get_receipts_by_status(&conn, ReceiptStatus::Pending).unwrap().len(), 1);
    }

    fn backdate_claim(db: &Arc<Mutex<Connection>>, id: &str, age: chrono::Duration) {
        let conn = db.lock().unwrap();
        conn.execute(
            "UPDATE receipts SET updated_at = ?1 WHERE id = ?2",
            rusqlite::params![(Utc::now() - age).to_rfc3339(), id],
        )
        .unwrap();
    }

    #[tokio::test]
    async fn test_new_recovers_stale_processing() {
        let db = shared_db();
        let stale = submit(&db, "STALE");
        let fresh = submit(&db, "FRESH");
        {
            let conn = db.lock().unwrap();
            db::claim_receipt(&conn, &stale).unwrap();
            db::claim_receipt(&conn, &fresh).unwrap();
        }
        backdate_claim(&db, &stale, chrono::Duration::minutes(10));

        let (_processor, _) = processor(&db, ScriptedExtractor::new(vec![]));
        assert_eq!(status_of(&db, &stale), ReceiptStatus::Pending);
        assert_eq!(status_of(&db, &fresh), ReceiptStatus::Processing);
    }

    #[tokio::test]
    async fn test_second_processor_leaves_live_claims_alone() {
        let db = shared_db();
        let id = submit(&db, "CARREFOUR");
        let gate = Arc::new(Notify::new());
        let first_extractor = Arc::new(ScriptedExtractor::gated(vec![Ok(valid_answer())], gate.clone()));
        let first = Arc::new(ReceiptProcessor::new(db.clone(), first_extractor.clone(), fast_options()).unwrap());

        let handle = first.spawn_batch().expect("first batch starts");
        while first_extractor.call_count() == 0 {
            tokio::task::yield_now().await;
        }

        // Another process starts on the same database while the first is mid-extraction
        let (second, second_extractor) = processor(&db, ScriptedExtractor::new(vec![Ok(valid_answer())]));
        let report = second.run_batch().await.unwrap();
        assert_eq!(report.examined, 0);
        assert_eq!(second_extractor.call_count(), 0);
        assert_eq!(status_of(&db, &id), ReceiptStatus::Processing);

        gate.notify_one();
        let report = handle.await.unwrap().unwrap();
        assert_eq!(report.processed, 1);

        let conn = db.lock().unwrap();
        let receipt = db::get_receipt(&conn, &id).unwrap().unwrap();
        assert_eq!(receipt.status, ReceiptStatus::Processed);
        assert_eq!(receipt.attempts, 1);
    }

    #[tokio::test]
    async fn test_database_error_releases_claimed_receipt() {
        let db = shared_db();
        let id = submit(&db, "MONOPRIX");
        let gate = Arc::new(Notify::new());
        let extractor = Arc::new(ScriptedExtractor::gated(vec![Ok(valid_answer())], gate.clone()));
        let processor = Arc::new(ReceiptProcessor::new(db.clone(), extractor.clone(), fast_options()).unwrap());

        let handle = processor.spawn_batch().expect("batch starts");
        while extractor.call_count() == 0 {
            tokio::task::yield_now().await;
        }
        db.lock().unwrap().execute("DROP TABLE items", []).unwrap();
        gate.notify_one();

        let err = handle.await.unwrap().unwrap_err();
        assert!(err.to_string().contains("aborted"));
        assert_eq!(status_of(&db, &id), ReceiptStatus::Pending);

        let report = processor.last_report().unwrap();
        assert!(report.aborted.is_some());
        assert_eq!(report.processed, 0);
        assert!(!processor.is_running());
    }

    /// Panics on the first call, answers normally afterwards
    struct PanicOnceExtractor {
        calls: std::sync::atomic::AtomicUsize,
    }

    #[async_trait::async_trait]
    impl ReceiptExtractor for PanicOnceExtractor {
        async fn extract(&self, _receipt_text: &str) -> Result<Value, LlmError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("extractor blew up");
            }
            Ok(valid_answer())
        }

        fn model(&self) -> &str {
            "panic-once"
        }
    }

    #[tokio::test]
    async fn test_panic_marks_receipt_failed_and_batch_continues() {
        let db = shared_db();
        let first = submit(&db, "FIRST");
        let second = submit(&db, "SECOND");
        let extractor = Arc::new(PanicOnceExtractor {
            calls: std::sync::atomic::AtomicUsize::new(0),
        });
        let processor = ReceiptProcessor::new(db.clone(), extractor, fast_options()).unwrap();

        let report = processor.run_batch().await.unwrap();

        assert_eq!(report.processed, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(report.failures[0].reason, "Processing panicked: extractor blew up");

        let panicked = report.failures[0].receipt_id.clone();
        let survived = if panicked == first { &second } else { &first };
        assert_eq!(status_of(&db, &panicked), ReceiptStatus::Failed);
        assert_eq!(status_of(&db, survived), ReceiptStatus::Processed);
        assert!(!processor.is_running());
    }

    #[test]
    fn test_claim_lease_covers_every_try() {
        // 3 × 60 s timeouts + (1 + 2) × 0.5 s backoff + 60 s slack
        let lease = claim_lease(Duration::from_secs(60), 3, Duration::from_millis(500));
        assert_eq!(lease, Duration::from_millis(241_500));
    }

    #[tokio::test]
    async fn test_overlapping_batches_are_refused() {
        let db = shared_db();
        submit(&db, "SLOW");
        let gate = Arc::new(Notify::new());
        let extractor = Arc::new(ScriptedExtractor::gated(vec![Ok(valid_answer())], gate.clone()));
        let processor = Arc::new(ReceiptProcessor::new(db.clone(), extractor.clone(), fast_options()).unwrap());

        let handle = processor.spawn_batch().expect("first batch starts");
        assert!(processor.is_running());
        assert!(processor.spawn_batch().is_none());
        assert!(processor.run_batch().await.is_err());

        // Wait until the batch is blocked inside the extractor, then release it
        while extractor.call_count() == 0 {
            tokio::task::yield_now().await;
        }
        gate.notify_one();

        let report = handle.await.unwrap().unwrap();
        assert_eq!(report.processed, 1);
        assert!(!processor.is_running());
        assert_eq!(processor.last_report().unwrap().processed, 1);
    }
}
