//! Notification Dispatcher
//!
//! Fire-and-forget email delivery over a bounded queue drained by a fixed
//! pool of workers.
//!
//! ```text
//! producers ──try_send──▶ [ bounded mpsc (capacity N) ] ──▶ worker 1..W ──▶ render ──▶ transport
//!     │                                                        │
//!     └─ full: drop + warn                                     └─ send error: log, no retry
//! ```
//!
//! Producers never wait: a full queue drops the job. `close` stops intake,
//! lets the workers drain whatever is already queued, and waits for them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::EnqueueError;
use crate::mailer::templates::{render, Template};
use crate::mailer::transport::{MailTransport, OutgoingMessage};

/// One email to render and send. Owned by the dispatcher once queued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailJob {
    /// Recipient address
    pub to: String,
    /// Subject line
    pub subject: String,
    /// Body template
    pub template: Template,
    /// Template values
    pub data: HashMap<String, String>,
}

impl EmailJob {
    /// Build a job from a template name; unknown names use the fallback body
    pub fn new(
        to: impl Into<String>,
        subject: impl Into<String>,
        template_name: &str,
        data: HashMap<String, String>,
    ) -> Self {
        Self {
            to: to.into(),
            subject: subject.into(),
            template: Template::from_name(template_name),
            data,
        }
    }

    /// Job for `template` with its default subject, addressed to `name <to>`
    pub fn for_template(template: Template, to: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            to: to.into(),
            subject: template.subject(),
            template,
            data: HashMap::from([("name".to_string(), name.into())]),
        }
    }

    /// Registration welcome email
    pub fn welcome(to: impl Into<String>, name: impl Into<String>) -> Self {
        Self::for_template(Template::Welcome, to, name)
    }

    /// Failed renewal notice
    pub fn payment_failed(to: impl Into<String>, name: impl Into<String>) -> Self {
        Self::for_template(Template::PaymentFailed, to, name)
    }
}

/// Lifetime counters for the dispatcher
#[derive(Debug, Default)]
pub struct MailerStats {
    enqueued: AtomicU64,
    dropped: AtomicU64,
    sent: AtomicU64,
    failed: AtomicU64,
}

/// Point-in-time copy of [`MailerStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailerStatsSnapshot {
    /// Jobs accepted onto the queue
    pub enqueued: u64,
    /// Jobs dropped because the queue was full
    pub dropped: u64,
    /// Jobs the transport accepted
    pub sent: u64,
    /// Jobs the transport rejected
    pub failed: u64,
    /// Jobs currently waiting in the queue
    pub queued: u64,
}

struct Shared {
    sender: RwLock<Option<mpsc::Sender<EmailJob>>>,
    receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<EmailJob>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    transport: Arc<dyn MailTransport>,
    from: String,
    capacity: usize,
    stats: Arc<MailerStats>,
}

/// Handle to the dispatcher. Cheap to clone; all clones share one queue.
#[derive(Clone)]
pub struct Mailer {
    inner: Arc<Shared>,
}

impl std::fmt::Debug for Mailer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mailer")
            .field("capacity", &self.inner.capacity)
            .field("from", &self.inner.from)
            .field("stats", &self.stats())
            .finish()
    }
}

impl Mailer {
    /// Create the queue without starting any workers
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize, transport: Arc<dyn MailTransport>, from: impl Into<String>) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            inner: Arc::new(Shared {
                sender: RwLock::new(Some(tx)),
                receiver: Arc::new(tokio::sync::Mutex::new(rx)),
                workers: Mutex::new(Vec::new()),
                transport,
                from: from.into(),
                capacity,
                stats: Arc::new(MailerStats::default()),
            }),
        }
    }

    /// Create the queue and start `workers` workers. Must run inside a tokio runtime.
    pub fn spawn(
        capacity: usize,
        workers: usize,
        transport: Arc<dyn MailTransport>,
        from: impl Into<String>,
    ) -> Self {
        let mailer = Self::new(capacity, transport, from);
        mailer.start(workers);
        mailer
    }

    /// Start `count` additional workers. Must run inside a tokio runtime.
    pub fn start(&self, count: usize) {
        if self.is_closed() {
            warn!("Mailer already closed; not starting workers");
            return;
        }

        let mut workers = self.inner.workers.lock();
        let first_id = workers.len();
        for id in first_id..first_id + count {
            workers.push(tokio::spawn(worker_loop(
                id,
                Arc::clone(&self.inner.receiver),
                Arc::clone(&self.inner.transport),
                self.inner.from.clone(),
                Arc::clone(&self.inner.stats),
            )));
        }
        info!(workers = workers.len(), capacity = self.inner.capacity, "Mailer started");
    }

    /// Queue `job` without waiting.
    ///
    /// A full queue drops the job and logs the recipient and subject. A
    /// closed dispatcher rejects the job and logs an error; producers must
    /// not outlive `close`.
    pub fn enqueue(&self, job: EmailJob) -> Result<(), EnqueueError> {
        let sender = self.inner.sender.read();
        let Some(sender) = sender.as_ref() else {
            error!(to = %job.to, subject = %job.subject, "Email enqueued after mailer close");
            return Err(EnqueueError::Closed);
        };

        match sender.try_send(job) {
            Ok(()) => {
                self.inner.stats.enqueued.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(TrySendError::Full(job)) => {
                self.inner.stats.dropped.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("mailer_jobs_dropped_total").increment(1);
                warn!(to = %job.to, subject = %job.subject, "Mailer queue full, dropping email");
                Err(EnqueueError::QueueFull)
            }
            Err(TrySendError::Closed(job)) => {
                error!(to = %job.to, subject = %job.subject, "Mailer queue closed unexpectedly");
                Err(EnqueueError::Closed)
            }
        }
    }

    /// Stop accepting jobs, deliver everything already queued, and wait for
    /// the workers to exit. Later calls return immediately.
    ///
    /// If no worker was ever started, the queue is drained on the caller's task.
    pub async fn close(&self) {
        let sender = self.inner.sender.write().take();
        if sender.is_none() {
            return;
        }
        drop(sender);

        let handles = std::mem::take(&mut *self.inner.workers.lock());
        if handles.is_empty() {
            worker_loop(
                0,
                Arc::clone(&self.inner.receiver),
                Arc::clone(&self.inner.transport),
                self.inner.from.clone(),
                Arc::clone(&self.inner.stats),
            )
            .await;
        } else {
            for result in join_all(handles).await {
                if let Err(e) = result {
                    error!(error = %e, "Mailer worker terminated abnormally");
                }
            }
        }

        info!(stats = ?self.stats(), "Mailer closed");
    }

    /// Whether `close` has been called
    pub fn is_closed(&self) -> bool {
        self.inner.sender.read().is_none()
    }

    /// Queue capacity fixed at construction
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Current counters
    pub fn stats(&self) -> MailerStatsSnapshot {
        let queued = self
            .inner
            .sender
            .read()
            .as_ref()
            .map(|s| (s.max_capacity() - s.capacity()) as u64)
            .unwrap_or(0);
        let stats = &self.inner.stats;
        MailerStatsSnapshot {
            enqueued: stats.enqueued.load(Ordering::Relaxed),
            dropped: stats.dropped.load(Ordering::Relaxed),
            sent: stats.sent.load(Ordering::Relaxed),
            failed: stats.failed.load(Ordering::Relaxed),
            queued,
        }
    }
}

async fn worker_loop(
    id: usize,
    receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<EmailJob>>>,
    transport: Arc<dyn MailTransport>,
    from: String,
    stats: Arc<MailerStats>,
) {
    debug!(worker = id, "Mailer worker started");

    loop {
        // Only the receive happens under the lock; delivery runs unlocked.
        let next = receiver.lock().await.recv().await;
        let Some(job) = next else {
            break;
        };

        let message = OutgoingMessage {
            from: from.clone(),
            html: render(job.template, &job.data),
            to: job.to,
            subject: job.subject,
        };

        match transport.deliver(&message).await {
            Ok(()) => {
                stats.sent.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("mailer_jobs_sent_total").increment(1);
                debug!(worker = id, to = %message.to, subject = %message.subject, "Email sent");
            }
            Err(e) => {
                stats.failed.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("mailer_send_failures_total").increment(1);
                error!(
                    worker = id,
                    to = %message.to,
                    subject = %message.subject,
                    error = %e,
                    "Failed to send email"
                );
            }
        }
    }

    debug!(worker = id, "Mailer worker exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SendError;
    use crate::mailer::transport::MemoryTransport;
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::sync::{Notify, Semaphore};

    /// Transport that parks every delivery until a permit is released
    struct GatedTransport {
        gate: Semaphore,
        entered: Notify,
        inner: MemoryTransport,
    }

    impl GatedTransport {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                gate: Semaphore::new(0),
                entered: Notify::new(),
                inner: MemoryTransport::new(),
            })
        }
    }

    #[async_trait]
    impl MailTransport for GatedTransport {
        async fn deliver(&self, message: &OutgoingMessage) -> Result<(), SendError> {
            self.entered.notify_one();
            let permit = self.gate.acquire().await.expect("gate closed");
            permit.forget();
            self.inner.deliver(message).await
        }
    }

    fn job(n: usize) -> EmailJob {
        EmailJob::payment_failed(format!("user{}@example.com", n), format!("User {}", n))
    }

    #[tokio::test]
    async fn test_enqueue_and_deliver() {
        let transport = MemoryTransport::new();
        let mailer = Mailer::spawn(10, 3, Arc::new(transport.clone()), "noreply@levelup.dev");

        mailer.enqueue(job(1)).unwrap();
        mailer.enqueue(EmailJob::welcome("ada@example.com", "Ada")).unwrap();
        mailer.close().await;

        let sent = transport.sent();
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().all(|m| m.from == "noreply@levelup.dev"));
        let welcome = sent.iter().find(|m| m.to == "ada@example.com").unwrap();
        assert_eq!(welcome.subject, "Welcome to Level Up Backend");
        assert!(welcome.html.contains("Ada"));

        let stats = mailer.stats();
        assert_eq!(stats.enqueued, 2);
        assert_eq!(stats.sent, 2);
        assert_eq!(stats.dropped, 0);
    }

    #[tokio::test]
    async fn test_overflow_drops_excess_without_workers() {
        let transport = MemoryTransport::new();
        let mailer = Mailer::new(5, Arc::new(transport.clone()), "noreply@levelup.dev");

        let mut dropped = 0;
        for n in 0..12 {
            if mailer.enqueue(job(n)) == Err(EnqueueError::QueueFull) {
                dropped += 1;
            }
        }

        assert_eq!(dropped, 12 - 5);
        assert_eq!(mailer.stats().dropped, 7);
        assert_eq!(mailer.stats().queued, 5);

        // Closing with no workers drains inline
        mailer.close().await;
        assert_eq!(transport.sent().len(), 5);
    }

    #[tokio::test]
    async fn test_overflow_with_blocked_worker() {
        let transport = GatedTransport::new();
        let mailer = Mailer::spawn(3, 1, transport.clone(), "noreply@levelup.dev");

        // First job is picked up and parks the only worker
        mailer.enqueue(job(0)).unwrap();
        tokio::time::timeout(Duration::from_secs(5), transport.entered.notified())
            .await
            .unwrap();

        let results: Vec<_> = (1..=10).map(|n| mailer.enqueue(job(n))).collect();
        let accepted = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(accepted, 3);
        assert_eq!(mailer.stats().dropped, 7);

        transport.gate.add_permits(100);
        mailer.close().await;
        assert_eq!(transport.inner.sent().len(), 4);
    }

    #[tokio::test]
    async fn test_enqueue_never_blocks_when_full() {
        let mailer = Mailer::new(1, Arc::new(MemoryTransport::new()), "noreply@levelup.dev");
        mailer.enqueue(job(0)).unwrap();

        let result = tokio::time::timeout(Duration::from_millis(100), async {
            mailer.enqueue(job(1))
        })
        .await
        .expect("enqueue must not wait");
        assert_eq!(result, Err(EnqueueError::QueueFull));
    }

    #[tokio::test]
    async fn test_send_failure_not_retried() {
        let transport = MemoryTransport::failing(SendError::Transport("smtp down".into()));
        let mailer = Mailer::spawn(10, 2, Arc::new(transport.clone()), "noreply@levelup.dev");

        mailer.enqueue(job(1)).unwrap();
        mailer.enqueue(job(2)).unwrap();
        mailer.close().await;

        let stats = mailer.stats();
        assert_eq!(stats.failed, 2);
        assert_eq!(stats.sent, 0);
    }

    #[tokio::test]
    async fn test_enqueue_after_close_fails() {
        let mailer = Mailer::spawn(10, 1, Arc::new(MemoryTransport::new()), "noreply@levelup.dev");
        mailer.close().await;

        assert!(mailer.is_closed());
        assert_eq!(mailer.enqueue(job(1)), Err(EnqueueError::Closed));

        // Second close is a no-op
        mailer.close().await;
    }

    #[tokio::test]
    async fn test_close_drains_queue() {
        let transport = GatedTransport::new();
        let mailer = Mailer::spawn(50, 3, transport.clone(), "noreply@levelup.dev");

        for n in 0..30 {
            mailer.enqueue(job(n)).unwrap();
        }
        transport.gate.add_permits(30);
        mailer.close().await;

        assert_eq!(transport.inner.sent().len(), 30);
        assert_eq!(mailer.stats().sent, 30);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_producers_account_for_every_job() {
        let transport = MemoryTransport::new();
        let mailer = Mailer::new(16, Arc::new(transport.clone()), "noreply@levelup.dev");

        let producers: Vec<_> = (0..8)
            .map(|p| {
                let mailer = mailer.clone();
                tokio::spawn(async move {
                    (0..25)
                        .map(|n| mailer.enqueue(job(p * 100 + n)))
                        .filter(Result::is_ok)
                        .count()
                })
            })
            .collect();

        let mut accepted = 0;
        for producer in producers {
            accepted += producer.await.unwrap();
        }

        let stats = mailer.stats();
        assert_eq!(stats.enqueued + stats.dropped, 8 * 25);
        assert_eq!(stats.enqueued, accepted as u64);
        assert_eq!(stats.enqueued, 16);

        mailer.close().await;
        assert_eq!(transport.sent().len(), 16);
    }

    #[test]
    fn test_unknown_template_name_uses_fallback() {
        let job = EmailJob::new("a@b.c", "Hi", "no_such_template", HashMap::new());
        assert_eq!(job.template, Template::Fallback);
    }
}
