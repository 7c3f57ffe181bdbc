//! Bounded validation worker pool
//!
//! A fixed set of `max_workers` tokio tasks pull jobs from one shared
//! queue, so at most `max_workers` validations are ever in flight. Failed
//! attempts go back to the tail of the same queue until the retry budget
//! is spent; fresh work is never overtaken by retries.
//!
//! ```text
//!   enqueue ──▶ [ job queue ] ──▶ worker 0..N ──▶ Validator
//!                    ▲                  │
//!                    └── retry (tail) ──┤
//!                                       └──▶ stats + ValidationComplete event
//! ```

use crate::config::ValidatorConfig;
use crate::pipeline::events::{EventReceiver, EventSender, PipelineEvent};
use crate::proxy::models::Proxy;
use crate::validation::models::{TestResult, ValidationResult, ValidationStats, ValidationTask};
use crate::validation::protocol::Validator;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

enum Job {
    Validate { task: ValidationTask, generation: u64 },
    Stop,
}

/// Counters and results guarded by one lock
#[derive(Default)]
struct SchedulerState {
    generation: u64,
    stats: ValidationStats,
    results: HashMap<String, ValidationResult>,
    latency_sum: u64,
    latency_count: u64,
    /// Tasks enqueued but not yet terminal (queued, active or awaiting retry)
    in_flight: u64,
}

impl SchedulerState {
    /// Store the latest attempt for a task, keeping the latency mean current
    fn record(&mut self, task_id: &str, result: ValidationResult) {
        if let Some(latency) = result.tests.speed.latency_ms {
            self.latency_sum += latency;
            self.latency_count += 1;
        }
        if let Some(previous) = self.results.insert(task_id.to_string(), result) {
            if let Some(latency) = previous.tests.speed.latency_ms {
                self.latency_sum -= latency;
                self.latency_count -= 1;
            }
        }

        self.stats.average_latency_ms = if self.latency_count > 0 {
            self.latency_sum as f64 / self.latency_count as f64
        } else {
            0.0
        };
        self.stats.success_rate = if self.stats.total > 0 {
            self.stats.passed as f64 / self.stats.total as f64 * 100.0
        } else {
            0.0
        };
    }
}

struct Shared {
    validator: Arc<dyn Validator>,
    max_retries: u32,
    sender: mpsc::UnboundedSender<Job>,
    state: Mutex<SchedulerState>,
    accepting: AtomicBool,
    idle: Notify,
    events: EventSender,
}

impl Shared {
    /// Claim a dequeued job. Returns false when it must be dropped.
    fn begin(&self, generation: u64) -> bool {
        let mut state = self.state.lock();
        if generation != state.generation {
            return false;
        }
        state.stats.pending = state.stats.pending.saturating_sub(1);

        if !self.accepting.load(Ordering::SeqCst) {
            state.stats.discarded += 1;
            state.in_flight -= 1;
            if state.in_flight == 0 {
                self.idle.notify_waiters();
            }
            return false;
        }

        state.stats.active += 1;
        true
    }

    async fn run(&self, task: ValidationTask, generation: u64) {
        let validator = Arc::clone(&self.validator);
        let proxy = task.proxy.clone();
        let retry_count = task.retry_count;

        // A panicking validator must not take the worker down with it.
        let outcome =
            tokio::spawn(async move { validator.validate(&proxy, retry_count).await }).await;

        let result = match outcome {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(proxy = %task.proxy, error = %e, "Validation task aborted");
                let mut result = ValidationResult::pending(task.proxy.clone(), retry_count);
                result.tests.connectivity =
                    TestResult::failed(format!("validation task aborted: {}", e));
                result
            }
        };

        self.complete(task, result, generation);
    }

    fn complete(&self, mut task: ValidationTask, result: ValidationResult, generation: u64) {
        let mut state = self.state.lock();
        if generation != state.generation {
            return;
        }
        state.stats.active = state.stats.active.saturating_sub(1);

        if !result.passed
            && task.retry_count < self.max_retries
            && self.accepting.load(Ordering::SeqCst)
        {
            state.record(&task.id, result);
            task.retry_count += 1;
            tracing::debug!(
                proxy = %task.proxy,
                attempt = task.retry_count + 1,
                "Retrying validation"
            );
            state.stats.pending += 1;
            match self.sender.send(Job::Validate { task, generation }) {
                Ok(()) => return,
                Err(_) => {
                    state.stats.pending -= 1;
                    tracing::warn!("Validation queue closed, dropping retry");
                }
            }
            // Fall through as a terminal failure; the result is already stored.
            state.stats.failed += 1;
        } else {
            if result.passed {
                state.stats.passed += 1;
            } else {
                state.stats.failed += 1;
            }
            state.record(&task.id, result.clone());
            let _ = self.events.send(PipelineEvent::ValidationComplete(Box::new(result)));
        }

        // record() ran before the counters above moved; refresh the rate.
        state.stats.success_rate = if state.stats.total > 0 {
            state.stats.passed as f64 / state.stats.total as f64 * 100.0
        } else {
            0.0
        };

        state.in_flight -= 1;
        if state.in_flight == 0 {
            self.idle.notify_waiters();
        }
    }
}

/// Bounded pool validating proxies with retry
pub struct ValidationScheduler {
    shared: Arc<Shared>,
    max_workers: usize,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ValidationScheduler {
    /// Start the pool. Must be called from within a tokio runtime.
    pub fn new(validator: Arc<dyn Validator>, config: &ValidatorConfig, events: EventSender) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let max_workers = config.max_workers.max(1);

        let shared = Arc::new(Shared {
            validator,
            max_retries: config.max_retries,
            sender,
            state: Mutex::new(SchedulerState::default()),
            accepting: AtomicBool::new(true),
            idle: Notify::new(),
            events,
        });

        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        let workers = (0..max_workers)
            .map(|worker_id| {
                let shared = Arc::clone(&shared);
                let receiver = Arc::clone(&receiver);
                tokio::spawn(worker_loop(worker_id, shared, receiver))
            })
            .collect();

        Self {
            shared,
            max_workers,
            workers: Mutex::new(workers),
        }
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Queue proxies for validation without waiting for any of them.
    ///
    /// Returns how many tasks were queued; zero once the pool is shut down.
    pub fn enqueue(&self, proxies: Vec<Proxy>) -> usize {
        if proxies.is_empty() {
            return 0;
        }
        let mut state = self.shared.state.lock();
        if !self.shared.accepting.load(Ordering::SeqCst) {
            tracing::warn!(count = proxies.len(), "Validation pool is shut down, dropping proxies");
            return 0;
        }
        let generation = state.generation;
        let mut queued = 0;

        for proxy in proxies {
            let task = ValidationTask::new(proxy);
            if self.shared.sender.send(Job::Validate { task, generation }).is_err() {
                tracing::warn!("Validation queue closed");
                break;
            }
            queued += 1;
        }

        state.stats.total += queued;
        state.stats.pending += queued;
        state.in_flight += queued;
        tracing::info!(
            added = queued,
            queue_size = state.stats.pending,
            "Added proxies to validation queue"
        );
        queued as usize
    }

    /// Completion events of this pool
    pub fn subscribe(&self) -> EventReceiver {
        self.shared.events.subscribe()
    }

    /// Current validation statistics
    pub fn get_stats(&self) -> ValidationStats {
        self.shared.state.lock().stats.clone()
    }

    /// Latest result recorded for a task
    pub fn get_result(&self, task_id: &str) -> Option<ValidationResult> {
        self.shared.state.lock().results.get(task_id).cloned()
    }

    /// Latest result of every task seen since the last clear
    pub fn results(&self) -> Vec<ValidationResult> {
        self.shared.state.lock().results.values().cloned().collect()
    }

    /// Forget queued work, results and statistics.
    ///
    /// Tasks already running finish but their outcome is discarded.
    pub fn clear(&self) {
        let mut state = self.shared.state.lock();
        let generation = state.generation + 1;
        *state = SchedulerState {
            generation,
            ..SchedulerState::default()
        };
        self.shared.idle.notify_waiters();
    }

    /// Wait until every queued task reached a terminal outcome
    pub async fn wait_for_completion(&self) {
        loop {
            let notified = self.shared.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.shared.state.lock().in_flight == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Stop accepting work and join the workers.
    ///
    /// Queued tasks that have not started are dropped. Active validations
    /// run to completion (or their own timeouts) and are not retried.
    pub async fn shutdown(&self) {
        // Flipped under the state lock so no retry or enqueue can slip in
        // behind the stop jobs.
        let was_accepting = {
            let _state = self.shared.state.lock();
            self.shared.accepting.swap(false, Ordering::SeqCst)
        };
        if !was_accepting {
            return;
        }

        let workers = std::mem::take(&mut *self.workers.lock());
        for _ in 0..workers.len() {
            let _ = self.shared.sender.send(Job::Stop);
        }
        for handle in workers {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Validation worker exited abnormally");
            }
        }

        let stats = self.get_stats();
        tracing::info!(
            passed = stats.passed,
            failed = stats.failed,
            discarded = stats.discarded,
            success_rate = stats.success_rate,
            "Validation pool stopped"
        );
    }
}

async fn worker_loop(
    worker_id: usize,
    shared: Arc<Shared>,
    receiver: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Job>>>,
) {
    tracing::debug!(worker_id, "Validation worker started");
    loop {
        let job = {
            let mut rx = receiver.lock().await;
            rx.recv().await
        };

        match job {
            Some(Job::Validate { task, generation }) => {
                if shared.begin(generation) {
                    shared.run(task, generation).await;
                }
            }
            Some(Job::Stop) | None => break,
        }
    }
    tracing::debug!(worker_id, "Validation worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::events;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn config(max_workers: usize) -> ValidatorConfig {
        ValidatorConfig {
            max_workers,
            ..ValidatorConfig::default()
        }
    }

    fn result_for(proxy: &Proxy, retry_count: u32, passed: bool, latency: Option<u64>) -> ValidationResult {
        let mut result = ValidationResult::pending(proxy.clone(), retry_count);
        result.passed = passed;
        result.tests.speed.latency_ms = latency;
        result
    }

    fn proxies(n: usize) -> Vec<Proxy> {
        (0..n).map(|i| Proxy::new(format!("10.0.0.{}", i), 8080)).collect()
    }

    /// Fails every attempt and counts calls per proxy
    #[derive(Default)]
    struct AlwaysFail {
        calls: Mutex<HashMap<String, u32>>,
    }

    #[async_trait]
    impl Validator for AlwaysFail {
        async fn validate(&self, proxy: &Proxy, retry_count: u32) -> ValidationResult {
            *self.calls.lock().entry(proxy.full()).or_default() += 1;
            result_for(proxy, retry_count, false, None)
        }
    }

    /// Tracks the highest number of concurrent validations
    #[derive(Default)]
    struct Concurrency {
        current: AtomicUsize,
        peak: AtomicUsize,
        done: AtomicUsize,
    }

    #[async_trait]
    impl Validator for Concurrency {
        async fn validate(&self, proxy: &Proxy, retry_count: u32) -> ValidationResult {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            self.done.fetch_add(1, Ordering::SeqCst);
            result_for(proxy, retry_count, true, Some(100))
        }
    }

    /// Records dispatch order; the first attempt of `flaky` fails
    struct Ordered {
        flaky: String,
        order: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Validator for Ordered {
        async fn validate(&self, proxy: &Proxy, retry_count: u32) -> ValidationResult {
            self.order.lock().push(proxy.full());
            let passed = !(proxy.full() == self.flaky && retry_count == 0);
            result_for(proxy, retry_count, passed, Some(200))
        }
    }

    struct Panics;

    #[async_trait]
    impl Validator for Panics {
        async fn validate(&self, proxy: &Proxy, _retry_count: u32) -> ValidationResult {
            if proxy.port == 666 {
                panic!("validator bug");
            }
            result_for(proxy, 0, true, Some(50))
        }
    }

    #[tokio::test]
    async fn test_failing_proxy_attempted_three_times() {
        let validator = Arc::new(AlwaysFail::default());
        let scheduler = ValidationScheduler::new(validator.clone(), &config(4), events::channel());

        assert_eq!(scheduler.enqueue(vec![Proxy::new("1.1.1.1", 80)]), 1);
        scheduler.wait_for_completion().await;

        assert_eq!(validator.calls.lock().get("1.1.1.1:80"), Some(&3));
        let stats = scheduler.get_stats();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.passed, 0);
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.active, 0);
        assert_eq!(stats.success_rate, 0.0);
    }

    #[tokio::test]
    async fn test_pool_never_exceeds_max_workers() {
        let validator = Arc::new(Concurrency::default());
        let scheduler = ValidationScheduler::new(validator.clone(), &config(3), events::channel());

        scheduler.enqueue(proxies(12));
        scheduler.wait_for_completion().await;

        assert_eq!(validator.done.load(Ordering::SeqCst), 12);
        assert!(validator.peak.load(Ordering::SeqCst) <= 3);
        let stats = scheduler.get_stats();
        assert_eq!(stats.passed, 12);
        assert_eq!(stats.success_rate, 100.0);
        assert_eq!(stats.average_latency_ms, 100.0);
    }

    #[tokio::test]
    async fn test_retries_go_to_the_tail() {
        let validator = Arc::new(Ordered {
            flaky: "10.0.0.0:8080".to_string(),
            order: Mutex::new(Vec::new()),
        });
        let scheduler = ValidationScheduler::new(validator.clone(), &config(1), events::channel());

        scheduler.enqueue(proxies(3));
        scheduler.wait_for_completion().await;

        assert_eq!(
            *validator.order.lock(),
            vec!["10.0.0.0:8080", "10.0.0.1:8080", "10.0.0.2:8080", "10.0.0.0:8080"]
        );
        let stats = scheduler.get_stats();
        assert_eq!(stats.passed, 3);
        assert_eq!(stats.failed, 0);
        assert_eq!(scheduler.results().len(), 3);
    }

    #[tokio::test]
    async fn test_emits_one_event_per_terminal_result() {
        let sender = events::channel();
        let mut rx = sender.subscribe();
        let scheduler = ValidationScheduler::new(Arc::new(AlwaysFail::default()), &config(2), sender);

        scheduler.enqueue(proxies(2));
        scheduler.wait_for_completion().await;

        let mut completed = 0;
        while let Ok(event) = rx.try_recv() {
            if let PipelineEvent::ValidationComplete(result) = event {
                assert_eq!(result.retry_count, 2);
                completed += 1;
            }
        }
        assert_eq!(completed, 2);
    }

    #[tokio::test]
    async fn test_panicking_validator_does_not_kill_pool() {
        let scheduler = ValidationScheduler::new(Arc::new(Panics), &config(1), events::channel());

        scheduler.enqueue(vec![Proxy::new("6.6.6.6", 666), Proxy::new("7.7.7.7", 80)]);
        scheduler.wait_for_completion().await;

        let stats = scheduler.get_stats();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.passed, 1);
    }

    #[tokio::test]
    async fn test_clear_resets_stats() {
        let scheduler = ValidationScheduler::new(Arc::new(Concurrency::default()), &config(2), events::channel());
        scheduler.enqueue(proxies(2));
        scheduler.wait_for_completion().await;
        assert_eq!(scheduler.get_stats().total, 2);

        scheduler.clear();
        assert_eq!(scheduler.get_stats(), ValidationStats::default());
        assert!(scheduler.results().is_empty());

        scheduler.enqueue(proxies(1));
        scheduler.wait_for_completion().await;
        assert_eq!(scheduler.get_stats().passed, 1);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_work() {
        let scheduler = ValidationScheduler::new(Arc::new(Concurrency::default()), &config(2), events::channel());
        scheduler.shutdown().await;

        assert_eq!(scheduler.enqueue(proxies(3)), 0);
        scheduler.wait_for_completion().await;
        assert_eq!(scheduler.get_stats().total, 0);
    }

    /// Fails every attempt after a delay
    struct SlowFail;

    #[async_trait]
    impl Validator for SlowFail {
        async fn validate(&self, proxy: &Proxy, retry_count: u32) -> ValidationResult {
            tokio::time::sleep(Duration::from_millis(50)).await;
            result_for(proxy, retry_count, false, None)
        }
    }

    #[tokio::test]
    async fn test_shutdown_mid_validation_accounts_for_every_task() {
        let scheduler = ValidationScheduler::new(Arc::new(SlowFail), &config(1), events::channel());
        scheduler.enqueue(proxies(3));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(scheduler.get_stats().active, 1);

        scheduler.shutdown().await;
        tokio::time::timeout(Duration::from_secs(1), scheduler.wait_for_completion())
            .await
            .expect("pool should be idle after shutdown");

        let stats = scheduler.get_stats();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.discarded, 2);
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.active, 0);
        assert_eq!(stats.total, stats.passed + stats.failed + stats.discarded);
    }

    #[test]
    fn test_latency_mean_uses_latest_attempt() {
        let mut state = SchedulerState::default();
        let proxy = Proxy::new("1.1.1.1", 80);
        state.record("a", result_for(&proxy, 0, false, Some(900)));
        state.record("a", result_for(&proxy, 1, true, Some(100)));
        state.record("b", result_for(&proxy, 0, true, None));
        state.record("c", result_for(&proxy, 0, true, Some(300)));
        assert_eq!(state.stats.average_latency_ms, 200.0);
    }
}
