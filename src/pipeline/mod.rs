//! The per-cycle delivery pipeline.
//!
//! One call to [`DeliveryPipeline::run_cycle`] processes every configured
//! feed:
//!
//! 1. Feeds run as independent tasks, at most `feed_concurrency` at a time.
//! 2. Each feed is fetched. A feed that opts out of `first_push` and has no
//!    bucket file for any channel records its whole batch as seen without
//!    sending anything.
//! 3. Surviving items are filtered ([`select_candidates`]) and ordered
//!    oldest first ([`order_candidates`]).
//! 4. Every (item, channel) pair not yet seen is rendered and dispatched to
//!    a per-feed pool of `channel_concurrency` workers. Workers retry with
//!    backoff, mark the item seen only after a confirmed send, and cool down
//!    before taking the next task.
//! 5. Feed failures are collected into one [`Error::Feeds`].
//!
//! There is no mid-cycle cancellation. [`DeliveryPipeline::run_until`]
//! stops between cycles.

mod candidates;
mod retry;
mod service;

pub use candidates::{Candidate, order_candidates, select_candidates};
pub use retry::{DeliveryOutcome, RetryPolicy, deliver_with_retry};
pub use service::ERROR_BACKOFF;

use crate::config::{DeliverySettings, FeedConfig};
use crate::dedup::{BloomFilter, DedupStore, MembershipFilter};
use crate::feed::{FeedFetcher, FeedItem, resolve_item_id};
use crate::rendering::Renderer;
use crate::transport::Transport;
use crate::{Error, FeedError, Result};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

/// Counters for one feed's pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeedReport {
    /// Items returned by the fetcher.
    pub items_fetched: usize,
    /// Items that survived filtering.
    pub candidates: usize,
    /// Confirmed sends.
    pub items_sent: usize,
    /// Delivery tasks that exhausted their retries.
    pub send_failures: usize,
    /// Confirmed sends whose mark could not be persisted.
    pub mark_failures: usize,
    /// Items recorded without sending on a feed's first run.
    pub backlog_suppressed: usize,
}

/// Counters for one polling cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Feeds that completed.
    pub feeds_processed: usize,
    /// Feeds that failed.
    pub feeds_failed: usize,
    /// Confirmed sends.
    pub items_sent: usize,
    /// Delivery tasks that exhausted their retries.
    pub send_failures: usize,
    /// Confirmed sends whose mark could not be persisted.
    pub mark_failures: usize,
    /// Items recorded without sending on a feed's first run.
    pub backlog_suppressed: usize,
}

impl CycleReport {
    fn absorb(&mut self, feed: &FeedReport) {
        self.feeds_processed += 1;
        self.items_sent += feed.items_sent;
        self.send_failures += feed.send_failures;
        self.mark_failures += feed.mark_failures;
        self.backlog_suppressed += feed.backlog_suppressed;
    }
}

/// What to do with one feed's fetched batch.
#[derive(Debug)]
enum FeedPlan {
    /// First run without `first_push`: record everything, send nothing.
    Backlog(Vec<FeedItem>),
    /// Ordered candidates with the channels that have not seen each one.
    Deliver(Vec<(Candidate, Vec<String>)>),
}

/// Decides a feed's work from the store. Reads the store synchronously.
fn plan_feed<F: MembershipFilter>(
    store: &DedupStore<F>,
    feed: &FeedConfig,
    items: Vec<FeedItem>,
    now: DateTime<Utc>,
) -> FeedPlan {
    let first_run = !feed.first_push
        && feed
            .channels
            .iter()
            .all(|channel| !store.has_bucket_file(&feed.url, channel));
    if first_run {
        return FeedPlan::Backlog(items);
    }

    let planned = order_candidates(select_candidates(items, feed, store, now))
        .into_iter()
        .map(|candidate| {
            let channels = feed
                .channels
                .iter()
                .filter(|channel| {
                    let seen = store.is_seen(&feed.url, channel, &candidate.id);
                    if seen {
                        debug!(channel = %channel, title = %candidate.item.title, "Already delivered to channel");
                    }
                    !seen
                })
                .cloned()
                .collect();
            (candidate, channels)
        })
        .collect();
    FeedPlan::Deliver(planned)
}

#[derive(Debug, Clone, Copy, Default)]
struct TaskResult {
    sent: bool,
    mark_failed: bool,
}

/// Drives polling cycles against a shared [`DedupStore`].
///
/// Cloning is cheap; clones share the store and collaborators.
pub struct DeliveryPipeline<F = BloomFilter> {
    store: Arc<DedupStore<F>>,
    fetcher: Arc<dyn FeedFetcher>,
    transport: Arc<dyn Transport>,
    renderer: Arc<dyn Renderer>,
    settings: DeliverySettings,
    policy: RetryPolicy,
}

impl<F> Clone for DeliveryPipeline<F> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            fetcher: Arc::clone(&self.fetcher),
            transport: Arc::clone(&self.transport),
            renderer: Arc::clone(&self.renderer),
            settings: self.settings,
            policy: self.policy,
        }
    }
}

impl<F: MembershipFilter + 'static> DeliveryPipeline<F> {
    /// Creates a pipeline.
    #[must_use]
    pub fn new(
        store: Arc<DedupStore<F>>,
        fetcher: Arc<dyn FeedFetcher>,
        transport: Arc<dyn Transport>,
        renderer: Arc<dyn Renderer>,
        settings: DeliverySettings,
    ) -> Self {
        Self {
            store,
            fetcher,
            transport,
            renderer,
            policy: settings.retry_policy(),
            settings,
        }
    }

    /// Replaces the concurrency and retry settings for later cycles.
    pub const fn set_settings(&mut self, settings: DeliverySettings) {
        self.policy = settings.retry_policy();
        self.settings = settings;
    }

    /// The shared store.
    #[must_use]
    pub const fn store(&self) -> &Arc<DedupStore<F>> {
        &self.store
    }

    /// Runs one polling cycle over `feeds`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Feeds`] listing every feed that failed, in
    /// configuration order. Other feeds are still processed in full.
    #[instrument(skip_all, fields(feeds = feeds.len()))]
    pub async fn run_cycle(&self, feeds: &[FeedConfig]) -> Result<CycleReport> {
        let started = Instant::now();
        let feed_slots = Arc::new(Semaphore::new(self.settings.feed_concurrency.max(1)));
        let mut tasks = JoinSet::new();

        for (index, feed) in feeds.iter().cloned().enumerate() {
            let pipeline = self.clone();
            let slots = Arc::clone(&feed_slots);
            tasks.spawn(async move {
                let result = match slots.acquire_owned().await {
                    Ok(_permit) => pipeline.process_feed(&feed).await,
                    Err(e) => Err(Error::operation("acquire_feed_slot", e)),
                };
                (index, feed.name, result)
            });
        }

        let mut report = CycleReport::default();
        let mut failures = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, _, Ok(feed_report))) => report.absorb(&feed_report),
                Ok((index, name, Err(e))) => {
                    error!(feed = %name, error = %e, "Error processing feed");
                    metrics::counter!("feedrelay_feed_errors_total").increment(1);
                    failures.push((index, FeedError { feed: name, source: Box::new(e) }));
                },
                Err(e) => {
                    error!(error = %e, "Feed task aborted");
                    metrics::counter!("feedrelay_feed_errors_total").increment(1);
                    failures.push((
                        usize::MAX,
                        FeedError {
                            feed: "<unknown>".to_string(),
                            source: Box::new(Error::operation("join_feed_task", e)),
                        },
                    ));
                },
            }
        }
        report.feeds_failed = failures.len();

        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        metrics::histogram!("feedrelay_cycle_duration_ms").record(elapsed_ms);
        info!(
            feeds_processed = report.feeds_processed,
            feeds_failed = report.feeds_failed,
            items_sent = report.items_sent,
            send_failures = report.send_failures,
            backlog_suppressed = report.backlog_suppressed,
            elapsed_ms,
            "Cycle complete"
        );

        if failures.is_empty() {
            Ok(report)
        } else {
            failures.sort_by_key(|(index, _)| *index);
            Err(Error::Feeds(failures.into_iter().map(|(_, e)| e).collect()))
        }
    }

    #[instrument(skip_all, fields(feed = %feed.name))]
    async fn process_feed(&self, feed: &FeedConfig) -> Result<FeedReport> {
        info!(url = %feed.url, "Processing feed");
        let mut report = FeedReport::default();

        let items = self.fetch(&feed.url).await?;
        report.items_fetched = items.len();
        if items.is_empty() {
            info!("No items found in feed");
            return Ok(report);
        }

        let candidates = match self.plan(feed, items).await? {
            FeedPlan::Backlog(items) => {
                report.backlog_suppressed = self.suppress_backlog(feed, &items).await;
                return Ok(report);
            },
            FeedPlan::Deliver(candidates) => candidates,
        };
        report.candidates = candidates.len();

        let workers = Arc::new(Semaphore::new(self.settings.channel_concurrency.max(1)));
        let mut tasks = JoinSet::new();

        for (candidate, channels) in &candidates {
            for channel in channels {
                let text = self.renderer.render(&candidate.item, &feed.template);
                if text.is_empty() {
                    metrics::counter!("feedrelay_items_skipped_total", "reason" => "empty_render").increment(1);
                    debug!(channel = %channel, title = %candidate.item.title, "Rendered message is empty, skipping");
                    continue;
                }

                // Acquire before spawning so dispatch follows candidate order.
                let permit = Arc::clone(&workers)
                    .acquire_owned()
                    .await
                    .map_err(|e| Error::operation("acquire_worker", e))?;

                let pipeline = self.clone();
                let feed_url = feed.url.clone();
                let channel = channel.clone();
                let id = candidate.id.clone();
                let title = candidate.item.title.clone();
                tasks.spawn(async move {
                    let result = pipeline.deliver(&feed_url, &channel, &id, &title, &text).await;
                    drop(permit);
                    result
                });
            }
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(result) => {
                    if result.sent {
                        report.items_sent += 1;
                    } else {
                        report.send_failures += 1;
                    }
                    if result.mark_failed {
                        report.mark_failures += 1;
                    }
                },
                Err(e) => {
                    error!(error = %e, "Delivery task aborted");
                    report.send_failures += 1;
                },
            }
        }

        info!(
            candidates = report.candidates,
            items_sent = report.items_sent,
            send_failures = report.send_failures,
            "Feed processed"
        );
        Ok(report)
    }

    /// One delivery task: send with retries, then mark and cool down.
    async fn deliver(&self, feed_url: &str, channel: &str, id: &str, title: &str, text: &str) -> TaskResult {
        let outcome = deliver_with_retry(&self.transport, channel, text, &self.policy).await;

        if !outcome.delivered {
            metrics::counter!("feedrelay_send_failures_total").increment(1);
            warn!(
                channel,
                title,
                attempts = outcome.attempts,
                error = outcome.last_error.as_deref().unwrap_or_default(),
                "Message not delivered, will retry next cycle"
            );
            return TaskResult::default();
        }

        metrics::counter!("feedrelay_items_sent_total").increment(1);
        info!(channel, title, attempts = outcome.attempts, "Message sent");

        let mark_failed = match self.mark(feed_url, channel, id).await {
            Ok(()) => false,
            Err(e) => {
                metrics::counter!("feedrelay_mark_failures_total").increment(1);
                error!(
                    channel,
                    item_id = id,
                    error = %e,
                    "Message sent but could not be marked seen; it may be sent again after a restart"
                );
                true
            },
        };

        tokio::time::sleep(self.policy.cooldown).await;
        TaskResult {
            sent: true,
            mark_failed,
        }
    }

    /// Runs [`plan_feed`] on the blocking pool; store reads take a sync lock.
    async fn plan(&self, feed: &FeedConfig, items: Vec<FeedItem>) -> Result<FeedPlan> {
        let store = Arc::clone(&self.store);
        let feed = feed.clone();
        tokio::task::spawn_blocking(move || plan_feed(&store, &feed, items, Utc::now()))
            .await
            .map_err(|e| Error::operation("select_candidates", e))
    }

    /// Records every item as seen on every channel without sending.
    async fn suppress_backlog(&self, feed: &FeedConfig, items: &[FeedItem]) -> usize {
        info!(
            items = items.len(),
            channels = feed.channels.len(),
            "First run for feed, recording existing items without sending"
        );

        for item in items {
            let id = resolve_item_id(item);
            for channel in &feed.channels {
                if let Err(e) = self.mark(&feed.url, channel, &id).await {
                    metrics::counter!("feedrelay_mark_failures_total").increment(1);
                    error!(channel = %channel, item_id = %id, error = %e, "Could not record backlog item");
                }
            }
        }
        items.len()
    }

    async fn fetch(&self, url: &str) -> Result<Vec<FeedItem>> {
        let fetcher = Arc::clone(&self.fetcher);
        let url = url.to_string();
        tokio::task::spawn_blocking(move || fetcher.fetch(&url))
            .await
            .unwrap_or_else(|e| Err(Error::operation("fetch_feed", e)))
    }

    async fn mark(&self, feed_url: &str, channel: &str, id: &str) -> Result<()> {
        let store = Arc::clone(&self.store);
        let (feed_url, channel, id) = (feed_url.to_string(), channel.to_string(), id.to_string());
        tokio::task::spawn_blocking(move || store.mark_seen(&feed_url, &channel, &id))
            .await
            .unwrap_or_else(|e| Err(Error::operation("mark_seen", e)))
    }
}
