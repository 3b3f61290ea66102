/// Process-wide arbiter of the provider request budget.
///
/// One `RateLimitManager` is constructed at startup and cloned (it is a handle) into
/// every component that calls the provider. Counters and the pending queue live behind
/// a single `tokio::sync::Mutex`; every grant decision is made while holding it, so quota
/// is never double-spent and queue order is never raced.
///
/// Budgets are fixed windows (per minute, per day, optional tokens per minute). A task
/// that finds budget is granted on enqueue; otherwise it waits in a queue ordered by
/// priority, then arrival. A queued task passed over by `starvation_bound` later arrivals
/// is escalated one tier, so a low-priority task reaches `high` after at most
/// `2 * starvation_bound` skips and is then served in arrival order.
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, Mutex};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::AnalysisError;
use crate::model::Priority;

const MINUTE: Duration = Duration::from_secs(60);
const DAY: Duration = Duration::from_secs(24 * 60 * 60);
const IDLE_POLL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub requests_per_minute: u32,
    pub requests_per_day: u32,
    pub tokens_per_minute: Option<u64>,
    /// 429 retries before `RateLimited` is surfaced.
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub starvation_bound: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 60,
            requests_per_day: 1_000,
            tokens_per_minute: None,
            max_retries: 3,
            backoff_base: Duration::from_millis(1_000),
            backoff_max: Duration::from_millis(30_000),
            starvation_bound: 5,
        }
    }
}

impl RateLimitConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let num = |name: &str| std::env::var(name).ok().and_then(|s| s.parse::<u64>().ok());

        Self {
            requests_per_minute: num("RATE_LIMIT_PER_MINUTE")
                .filter(|&n| n > 0)
                .map(|n| n as u32)
                .unwrap_or(defaults.requests_per_minute),
            requests_per_day: num("RATE_LIMIT_PER_DAY")
                .filter(|&n| n > 0)
                .map(|n| n as u32)
                .unwrap_or(defaults.requests_per_day),
            tokens_per_minute: num("RATE_LIMIT_TOKENS_PER_MINUTE").filter(|&n| n > 0),
            max_retries: num("RATE_LIMIT_MAX_RETRIES")
                .map(|n| n as u32)
                .unwrap_or(defaults.max_retries),
            backoff_base: num("RATE_LIMIT_BACKOFF_BASE_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.backoff_base),
            backoff_max: num("RATE_LIMIT_BACKOFF_MAX_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.backoff_max),
            starvation_bound: num("RATE_LIMIT_STARVATION_BOUND")
                .filter(|&n| n > 0)
                .map(|n| n as u32)
                .unwrap_or(defaults.starvation_bound),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TaskOptions {
    pub priority: Priority,
    pub estimated_tokens: u64,
    pub max_wait_time: Duration,
}

impl Default for TaskOptions {
    fn default() -> Self {
        Self {
            priority: Priority::Medium,
            estimated_tokens: 0,
            max_wait_time: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct UsageWindow {
    pub used: u64,
    pub limit: u64,
}

/// Read-only snapshot for callers and the status tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitStatus {
    pub requests_per_minute: UsageWindow,
    pub requests_per_day: UsageWindow,
    pub tokens_per_minute: Option<UsageWindow>,
    pub queue_length: usize,
    pub estimated_wait_time_ms: u64,
    pub recommendations: Vec<String>,
}

#[derive(Clone)]
pub struct RateLimitManager {
    config: Arc<RateLimitConfig>,
    state: Arc<Mutex<State>>,
}

impl RateLimitManager {
    pub fn new(config: RateLimitConfig) -> Self {
        let now = Instant::now();
        Self {
            config: Arc::new(config),
            state: Arc::new(Mutex::new(State::new(now))),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Run `task` once budget is granted. A `RateLimited` result pauses all grants for
    /// the retry delay and re-queues the task, up to `max_retries` times.
    pub async fn execute_with_rate_limit<T, F, Fut>(
        &self,
        user_id: &str,
        mut task: F,
        options: TaskOptions,
    ) -> Result<T, AnalysisError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, AnalysisError>>,
    {
        let mut attempt: u32 = 0;
        loop {
            self.acquire(user_id, &options).await?;
            match task().await {
                Ok(v) => return Ok(v),
                Err(AnalysisError::RateLimited { retry_after }) => {
                    let delay = self.retry_delay(attempt, retry_after);
                    if attempt >= self.config.max_retries {
                        warn!(
                            user_id,
                            attempts = attempt + 1,
                            retry_after_ms = delay.as_millis() as u64,
                            "provider rate limit persisted, giving up"
                        );
                        return Err(AnalysisError::RateLimited {
                            retry_after: Some(delay),
                        });
                    }
                    warn!(
                        user_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "provider returned 429, backing off"
                    );
                    self.pause_for(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Delay before 429 retry `attempt` (0-based): `Retry-After` when the provider sent
    /// one, else `base * 2^attempt`; both capped at `backoff_max`.
    pub fn retry_delay(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let exponential = || {
            let mult = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
            self.config.backoff_base.saturating_mul(mult)
        };
        retry_after
            .unwrap_or_else(exponential)
            .min(self.config.backoff_max)
    }

    pub async fn get_rate_limit_status(&self) -> RateLimitStatus {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        state.roll(now);
        state.prune_abandoned();
        let queue_length = state.queue.len();
        let estimated_wait = state.estimate_wait(queue_length, now, &self.config);
        let paused_for = state
            .paused_until
            .filter(|&until| until > now)
            .map(|until| until - now);

        let minute = UsageWindow {
            used: state.minute.used,
            limit: u64::from(self.config.requests_per_minute),
        };
        let day = UsageWindow {
            used: state.day.used,
            limit: u64::from(self.config.requests_per_day),
        };
        let tokens = self.config.tokens_per_minute.map(|limit| UsageWindow {
            used: state.tokens.used,
            limit,
        });

        RateLimitStatus {
            requests_per_minute: minute,
            requests_per_day: day,
            tokens_per_minute: tokens,
            queue_length,
            estimated_wait_time_ms: estimated_wait.as_millis() as u64,
            recommendations: recommendations(minute, day, queue_length, paused_for),
        }
    }

    /// 1-based position of the user's earliest-served pending task, if any.
    pub async fn get_queue_position(&self, user_id: &str) -> Option<usize> {
        let mut state = self.state.lock().await;
        state.prune_abandoned();
        state
            .dispatch_order(self.config.starvation_bound)
            .iter()
            .position(|&i| state.queue[i].user_id == user_id)
            .map(|p| p + 1)
    }

    async fn acquire(&self, user_id: &str, options: &TaskOptions) -> Result<(), AnalysisError> {
        let enqueued_at = Instant::now();
        let deadline = enqueued_at + options.max_wait_time;
        let (tx, mut rx) = oneshot::channel();

        let ticket_id = {
            let mut state = self.state.lock().await;
            let id = state.enqueue(user_id, options, tx);
            state.pump(enqueued_at, &self.config);
            if rx.try_recv().is_ok() {
                return Ok(());
            }
            debug!(
                user_id,
                priority = ?options.priority,
                queue_length = state.queue.len(),
                "task queued for rate-limit budget"
            );
            id
        };

        loop {
            let wake = {
                let state = self.state.lock().await;
                state.next_wake(Instant::now(), &self.config)
            };
            tokio::select! {
                granted = &mut rx => {
                    // The sender only disappears without granting if the ticket was removed.
                    return granted.map_err(|_| AnalysisError::QueueTimeout {
                        waited_ms: enqueued_at.elapsed().as_millis() as u64,
                    });
                }
                _ = tokio::time::sleep_until(wake.min(deadline)) => {}
            }

            let now = Instant::now();
            let mut state = self.state.lock().await;
            state.pump(now, &self.config);
            if rx.try_recv().is_ok() {
                return Ok(());
            }
            if now >= deadline {
                state.queue.retain(|t| t.id != ticket_id);
                let waited_ms = (now - enqueued_at).as_millis() as u64;
                warn!(user_id, waited_ms, "queued task exceeded its wait limit");
                return Err(AnalysisError::QueueTimeout { waited_ms });
            }
        }
    }

    async fn pause_for(&self, delay: Duration) {
        let until = Instant::now() + delay;
        let mut state = self.state.lock().await;
        state.paused_until = Some(state.paused_until.map_or(until, |p| p.max(until)));
    }
}

/// A fixed window counter.
#[derive(Debug)]
struct Window {
    started: Instant,
    length: Duration,
    used: u64,
}

impl Window {
    fn new(started: Instant, length: Duration) -> Self {
        Self {
            started,
            length,
            used: 0,
        }
    }

    fn roll(&mut self, now: Instant) {
        if now < self.resets_at() {
            return;
        }
        let elapsed = now - self.started;
        let windows = (elapsed.as_nanos() / self.length.as_nanos()) as u32;
        self.started += self.length * windows;
        self.used = 0;
    }

    fn resets_at(&self) -> Instant {
        self.started + self.length
    }
}

struct Ticket {
    id: u64,
    user_id: String,
    priority: Priority,
    estimated_tokens: u64,
    passed_over: u32,
    grant: oneshot::Sender<()>,
}

impl Ticket {
    /// Base rank (low 0, medium 1, high 2) plus one tier per `bound` skips, capped at high.
    fn effective_rank(&self, bound: u32) -> u8 {
        let base: u32 = match self.priority {
            Priority::Low => 0,
            Priority::Medium => 1,
            Priority::High => 2,
        };
        (base + self.passed_over / bound.max(1)).min(2) as u8
    }
}

struct State {
    minute: Window,
    day: Window,
    tokens: Window,
    /// Arrival order; `id` doubles as the arrival sequence number.
    queue: Vec<Ticket>,
    next_id: u64,
    paused_until: Option<Instant>,
}

impl State {
    fn new(now: Instant) -> Self {
        Self {
            minute: Window::new(now, MINUTE),
            day: Window::new(now, DAY),
            tokens: Window::new(now, MINUTE),
            queue: Vec::new(),
            next_id: 0,
            paused_until: None,
        }
    }

    fn roll(&mut self, now: Instant) {
        self.minute.roll(now);
        self.day.roll(now);
        self.tokens.roll(now);
        if self.paused_until.is_some_and(|until| until <= now) {
            self.paused_until = None;
        }
    }

    fn enqueue(
        &mut self,
        user_id: &str,
        options: &TaskOptions,
        grant: oneshot::Sender<()>,
    ) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.queue.push(Ticket {
            id,
            user_id: user_id.to_string(),
            priority: options.priority,
            estimated_tokens: options.estimated_tokens,
            passed_over: 0,
            grant,
        });
        id
    }

    /// Drop tickets whose waiter went away.
    fn prune_abandoned(&mut self) {
        self.queue.retain(|t| !t.grant.is_closed());
    }

    /// Queue indices in the order they would be granted.
    fn dispatch_order(&self, bound: u32) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.queue.len()).collect();
        order.sort_by(|&a, &b| {
            let (ta, tb) = (&self.queue[a], &self.queue[b]);
            tb.effective_rank(bound)
                .cmp(&ta.effective_rank(bound))
                .then(ta.id.cmp(&tb.id))
        });
        order
    }

    fn head(&self, bound: u32) -> Option<usize> {
        self.dispatch_order(bound).first().copied()
    }

    fn has_budget(&self, estimated_tokens: u64, config: &RateLimitConfig) -> bool {
        self.minute.used < u64::from(config.requests_per_minute)
            && self.day.used < u64::from(config.requests_per_day)
            && self.tokens_fit(estimated_tokens, config)
    }

    fn tokens_fit(&self, estimated_tokens: u64, config: &RateLimitConfig) -> bool {
        match config.tokens_per_minute {
            Some(limit) => self.tokens.used == 0 || self.tokens.used + estimated_tokens <= limit,
            None => true,
        }
    }

    /// Grant as many queued tickets as the budget allows, strictly in dispatch order.
    fn pump(&mut self, now: Instant, config: &RateLimitConfig) -> usize {
        self.roll(now);
        self.prune_abandoned();
        if self.paused_until.is_some() {
            return 0;
        }

        let mut granted = 0;
        while let Some(idx) = self.head(config.starvation_bound) {
            if !self.has_budget(self.queue[idx].estimated_tokens, config) {
                break;
            }
            let ticket = self.queue.remove(idx);
            self.minute.used += 1;
            self.day.used += 1;
            self.tokens.used += ticket.estimated_tokens;

            if ticket.grant.send(()).is_err() {
                // Waiter dropped between prune and send; return the slot.
                self.minute.used -= 1;
                self.day.used -= 1;
                self.tokens.used -= ticket.estimated_tokens;
                continue;
            }
            for waiting in self.queue.iter_mut().filter(|t| t.id < ticket.id) {
                waiting.passed_over += 1;
            }
            granted += 1;
        }
        granted
    }

    /// Earliest instant at which the head of the queue could be granted.
    fn next_wake(&self, now: Instant, config: &RateLimitConfig) -> Instant {
        let mut wake = now;
        if let Some(until) = self.paused_until {
            wake = wake.max(until);
        }
        if self.day.used >= u64::from(config.requests_per_day) {
            wake = wake.max(self.day.resets_at());
        }
        let head_tokens = self
            .head(config.starvation_bound)
            .map(|i| self.queue[i].estimated_tokens)
            .unwrap_or(0);
        if self.minute.used >= u64::from(config.requests_per_minute)
            || !self.tokens_fit(head_tokens, config)
        {
            wake = wake.max(self.minute.resets_at());
        }
        if wake <= now {
            now + IDLE_POLL
        } else {
            wake
        }
    }

    /// Wait for a task with `ahead` tasks in front of it.
    fn estimate_wait(&self, ahead: usize, now: Instant, config: &RateLimitConfig) -> Duration {
        let pause = self
            .paused_until
            .filter(|&until| until > now)
            .map(|until| until.saturating_duration_since(now))
            .unwrap_or_default();
        if self.day.used >= u64::from(config.requests_per_day) {
            return self.day.resets_at().saturating_duration_since(now).max(pause);
        }

        let per_minute = u64::from(config.requests_per_minute.max(1));
        let remaining = per_minute.saturating_sub(self.minute.used);
        let ahead = ahead as u64;
        if ahead < remaining {
            return pause;
        }
        let extra_windows = (ahead - remaining) / per_minute;
        let until_reset = self.minute.resets_at().saturating_duration_since(now);
        (until_reset + MINUTE * extra_windows as u32).max(pause)
    }
}

fn recommendations(
    minute: UsageWindow,
    day: UsageWindow,
    queue_length: usize,
    paused_for: Option<Duration>,
) -> Vec<String> {
    let mut out = Vec::new();
    if day.limit > 0 && day.used * 100 >= day.limit * 90 {
        out.push(format!(
            "Approaching daily limit ({}/{} requests); defer non-urgent analyses",
            day.used, day.limit
        ));
    }
    if minute.limit > 0 && minute.used * 100 >= minute.limit * 80 {
        out.push("High request rate; new requests may be queued briefly".to_string());
    }
    if queue_length >= 5 {
        out.push(format!(
            "{queue_length} requests queued; analyse fewer documents per batch"
        ));
    }
    if let Some(d) = paused_for {
        out.push(format!(
            "Provider is throttling requests; resuming in ~{}s",
            d.as_secs().max(1)
        ));
    }
    out
}
