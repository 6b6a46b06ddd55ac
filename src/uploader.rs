//! Caller-side delivery to an LRS with retry.
//!
//! Retries resend the same statement id, so a statement that did land before a
//! transport error is not stored twice.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::LrsError;
use crate::lrs::Lrs;
use crate::xapi::Statement;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    /// Four attempts, waiting 1s, 2s and 4s between them.
    fn default() -> Self {
        RetryPolicy { max_attempts: 4, base_delay: Duration::from_secs(1) }
    }
}

impl RetryPolicy {
    /// Wait before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(attempt.saturating_sub(1))
    }
}

pub async fn send_with_retry(lrs: &dyn Lrs, statement: &Statement, policy: &RetryPolicy) -> Result<Uuid, LrsError> {
    let mut attempt = 1;
    loop {
        match lrs.send_statement(statement).await {
            Ok(id) => return Ok(id),
            Err(e) if e.is_retryable() && attempt < policy.max_attempts => {
                let wait = policy.delay_for(attempt);
                tracing::warn!(statement = %statement.id, attempt, ?wait, error = %e, "statement send failed, retrying");
                tokio::time::sleep(wait).await;
                attempt += 1;
            }
            Err(e) => {
                tracing::error!(statement = %statement.id, attempt, error = %e, "statement send gave up");
                return Err(e);
            }
        }
    }
}

/// A statement the uploader could not deliver. Resend it as-is: the id is
/// unchanged, so a copy that did land is not duplicated.
#[derive(Debug)]
pub struct Undelivered {
    pub statement: Statement,
    pub error: LrsError,
}

/// Background queue feeding statements to an LRS one at a time.
pub struct Uploader {
    tx: mpsc::Sender<Statement>,
    handle: JoinHandle<Vec<Undelivered>>,
}

impl Uploader {
    pub fn spawn(lrs: Arc<dyn Lrs>, policy: RetryPolicy, capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<Statement>(capacity);
        let handle = tokio::spawn(async move {
            let mut failed = Vec::new();
            while let Some(statement) = rx.recv().await {
                if let Err(error) = send_with_retry(lrs.as_ref(), &statement, &policy).await {
                    failed.push(Undelivered { statement, error });
                }
            }
            tracing::debug!(undelivered = failed.len(), "uploader queue closed");
            failed
        });
        Uploader { tx, handle }
    }

    /// Queue a statement; waits when the queue is full. A stopped uploader
    /// hands the statement back.
    pub async fn enqueue(&self, statement: Statement) -> Result<(), Box<Undelivered>> {
        self.tx.send(statement).await.map_err(|e| {
            Box::new(Undelivered { statement: e.0, error: LrsError::Transport("uploader stopped".into()) })
        })
    }

    /// Close the queue, wait for it to drain and return what could not be
    /// delivered.
    pub async fn shutdown(self) -> Vec<Undelivered> {
        drop(self.tx);
        match self.handle.await {
            Ok(failed) => failed,
            Err(e) => {
                tracing::error!(error = %e, "uploader task failed");
                Vec::new()
            }
        }
    }
}
