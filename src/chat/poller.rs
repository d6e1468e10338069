//! Polls a conversation until a new assistant message lands.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::ChatBackend;
use crate::error::GatewayError;
use crate::models::{assistant_count, ChatMessage, ConversationId};
use crate::settings::EffectiveSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_wait: Duration,
    /// Consecutive failed fetches tolerated before giving up.
    pub retry_budget: u32,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self { interval: Duration::from_millis(1500), max_wait: Duration::from_secs(60), retry_budget: 5 }
    }
}

impl From<&EffectiveSettings> for PollPolicy {
    fn from(s: &EffectiveSettings) -> Self {
        Self { interval: s.poll_interval, max_wait: s.poll_max_wait, retry_budget: s.poll_retry_budget }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    ReplyArrived(Vec<ChatMessage>),
    TimedOut { last_snapshot: Option<Vec<ChatMessage>> },
    Failed(GatewayError),
    Cancelled,
}

type Registry = Arc<Mutex<HashMap<ConversationId, (u64, Arc<watch::Sender<bool>>)>>>;

/// At most one running poll per conversation.
pub struct ReplyPoller<B: ChatBackend> {
    backend: Arc<B>,
    policy: PollPolicy,
    active: Registry,
    generation: Arc<AtomicU64>,
}

impl<B: ChatBackend> Clone for ReplyPoller<B> {
    fn clone(&self) -> Self {
        Self {
            backend: self.backend.clone(),
            policy: self.policy,
            active: self.active.clone(),
            generation: self.generation.clone(),
        }
    }
}

impl<B: ChatBackend> ReplyPoller<B> {
    pub fn new(backend: Arc<B>, policy: PollPolicy) -> Self {
        Self { backend, policy, active: Registry::default(), generation: Arc::new(AtomicU64::new(0)) }
    }

    pub fn policy(&self) -> PollPolicy {
        self.policy
    }

    /// Starts polling `conversation`, cancelling whatever poll it had.
    pub fn start_polling(&self, conversation: ConversationId, baseline: usize) -> PollHandle {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = watch::channel(false);
        let cancel = Arc::new(tx);

        let previous = lock(&self.active).insert(conversation, (generation, cancel.clone()));
        if let Some((_, old)) = previous {
            debug!(conversation, "replacing running poll");
            old.send_replace(true);
        }

        let backend = self.backend.clone();
        let policy = self.policy;
        let registry = self.active.clone();
        let task = tokio::spawn(async move {
            let outcome = run(backend.as_ref(), conversation, baseline, policy, rx).await;
            forget(&registry, conversation, generation);
            outcome
        });

        PollHandle { conversation, generation, cancel, registry: self.active.clone(), task: Some(task) }
    }

    /// Returns whether a poll was running.
    pub fn stop_polling(&self, conversation: ConversationId) -> bool {
        match lock(&self.active).remove(&conversation) {
            Some((_, cancel)) => {
                cancel.send_replace(true);
                true
            }
            None => false,
        }
    }

    pub fn is_polling(&self, conversation: ConversationId) -> bool {
        lock(&self.active).contains_key(&conversation)
    }
}

/// Owner of one running poll. Dropping it cancels the poll.
pub struct PollHandle {
    conversation: ConversationId,
    generation: u64,
    cancel: Arc<watch::Sender<bool>>,
    registry: Registry,
    task: Option<JoinHandle<PollOutcome>>,
}

impl PollHandle {
    pub fn conversation(&self) -> ConversationId {
        self.conversation
    }

    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    pub async fn outcome(mut self) -> PollOutcome {
        let Some(task) = self.task.take() else { return PollOutcome::Cancelled };
        match task.await {
            Ok(outcome) => outcome,
            Err(e) if e.is_cancelled() => PollOutcome::Cancelled,
            Err(e) => PollOutcome::Failed(GatewayError::Network(format!("poll task failed: {e}"))),
        }
    }
}

impl Drop for PollHandle {
    fn drop(&mut self) {
        self.cancel.send_replace(true);
        forget(&self.registry, self.conversation, self.generation);
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn forget(registry: &Registry, conversation: ConversationId, generation: u64) {
    let mut active = lock(registry);
    if active.get(&conversation).is_some_and(|(g, _)| *g == generation) {
        active.remove(&conversation);
    }
}

async fn run<B: ChatBackend>(
    backend: &B,
    conversation: ConversationId,
    baseline: usize,
    policy: PollPolicy,
    mut cancel: watch::Receiver<bool>,
) -> PollOutcome {
    let start = Instant::now();
    let deadline = sleep_until(start + policy.max_wait);
    tokio::pin!(deadline);
    let mut ticks = interval_at(start + policy.interval, policy.interval);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let budget = policy.retry_budget.max(1);
    let mut failures = 0u32;
    let mut last_snapshot = None;

    loop {
        if *cancel.borrow_and_update() {
            return PollOutcome::Cancelled;
        }
        tokio::select! {
            biased;
            _ = cancel.changed() => return PollOutcome::Cancelled,
            _ = &mut deadline => {
                info!(conversation, waited_ms = policy.max_wait.as_millis() as u64, "gave up waiting for reply");
                return PollOutcome::TimedOut { last_snapshot };
            }
            _ = ticks.tick() => {}
        }

        metrics::counter!("poll_ticks_total").increment(1);
        let fetched = tokio::select! {
            biased;
            _ = cancel.changed() => return PollOutcome::Cancelled,
            r = backend.fetch_messages(conversation) => r,
        };

        match fetched {
            Ok(snapshot) => {
                failures = 0;
                let seen = assistant_count(&snapshot);
                if seen > baseline {
                    debug!(conversation, baseline, seen, "reply arrived");
                    return PollOutcome::ReplyArrived(snapshot);
                }
                last_snapshot = Some(snapshot);
            }
            Err(GatewayError::Unauthorized) => return PollOutcome::Failed(GatewayError::Unauthorized),
            Err(e) => {
                failures += 1;
                if failures >= budget {
                    warn!(conversation, failures, error = %e, "poll retry budget exhausted");
                    return PollOutcome::Failed(e);
                }
                debug!(conversation, failures, error = %e, "poll fetch failed, retrying");
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::models::Role;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    pub fn conversation(users: usize, assistants: usize) -> Vec<ChatMessage> {
        let roles = std::iter::repeat(Role::User).take(users).chain(std::iter::repeat(Role::Assistant).take(assistants));
        roles
            .enumerate()
            .map(|(i, role)| ChatMessage {
                id: i.to_string(),
                role,
                content: format!("m{i}"),
                timestamp: Utc.timestamp_opt(1_700_000_000 + i as i64, 0).unwrap(),
            })
            .collect()
    }

    /// Scripted backend: answers fetches in order, repeating the last one.
    #[derive(Default)]
    pub struct ScriptedBackend {
        pub fetches: Mutex<VecDeque<Result<Vec<ChatMessage>, GatewayError>>>,
        pub fetch_count: AtomicUsize,
        pub sent: Mutex<Vec<(ConversationId, String)>>,
        pub send_error: Option<GatewayError>,
    }

    impl ScriptedBackend {
        pub fn with_fetches(fetches: Vec<Result<Vec<ChatMessage>, GatewayError>>) -> Self {
            Self { fetches: Mutex::new(fetches.into()), ..Default::default() }
        }

        pub fn fetch_count(&self) -> usize {
            self.fetch_count.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ChatBackend for ScriptedBackend {
        async fn send_message(&self, conversation: ConversationId, text: &str) -> Result<(), GatewayError> {
            self.sent.lock().unwrap().push((conversation, text.to_string()));
            match &self.send_error {
                Some(e) => Err(e.clone()),
                None => Ok(()),
            }
        }

        async fn fetch_messages(&self, _conversation: ConversationId) -> Result<Vec<ChatMessage>, GatewayError> {
            self.fetch_count.fetch_add(1, Ordering::SeqCst);
            let mut queue = self.fetches.lock().unwrap();
            if queue.len() > 1 {
                return queue.pop_front().unwrap_or(Ok(Vec::new()));
            }
            queue.front().cloned().unwrap_or(Ok(Vec::new()))
        }
    }
}
