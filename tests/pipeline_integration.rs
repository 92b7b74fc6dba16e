//! End-to-end tests for delivery cycles against a real on-disk store.

// Integration tests use expect/unwrap for simplicity - panics are acceptable in tests
#![allow(clippy::expect_used, clippy::unwrap_used)]

use feedrelay::feed::parse_feed;
use feedrelay::{
    DedupStore, DeliveryPipeline, DeliverySettings, FeedConfig, FeedFetcher, FeedItem,
    FilterParams, Result, StoreConfig, TemplateRenderer, Transport,
};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

const URL: &str = "https://news.example.com/rss";

const RSS: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0">
  <channel>
    <title>Example News</title>
    <link>https://news.example.com/</link>
    <description>Example</description>
    <item>
      <title>Second story</title>
      <link>https://news.example.com/2</link>
      <guid>story-2</guid>
      <pubDate>Tue, 02 Jan 2024 09:00:00 GMT</pubDate>
      <description>&lt;p&gt;Later &lt;b&gt;news&lt;/b&gt;&lt;/p&gt;</description>
    </item>
    <item>
      <title>First story</title>
      <link>https://news.example.com/1</link>
      <guid>story-1</guid>
      <pubDate>Mon, 01 Jan 2024 09:00:00 GMT</pubDate>
    </item>
  </channel>
</rss>"#;

/// Serves a fixed feed body through the real parser.
struct StaticFetcher {
    body: Mutex<String>,
}

impl FeedFetcher for StaticFetcher {
    fn fetch(&self, _url: &str) -> Result<Vec<FeedItem>> {
        parse_feed(self.body.lock().unwrap().as_bytes())
    }
}

#[derive(Default)]
struct RecordingTransport {
    sent: Mutex<Vec<(String, String)>>,
}

impl Transport for RecordingTransport {
    fn send(&self, channel: &str, text: &str) -> Result<()> {
        self.sent
            .lock()
            .unwrap()
            .push((channel.to_string(), text.to_string()));
        Ok(())
    }
}

fn open_store(dir: &Path) -> Arc<DedupStore> {
    Arc::new(
        DedupStore::open(StoreConfig::new(dir).with_filter(FilterParams::new(1_000, 0.001)))
            .expect("open store"),
    )
}

fn feed(first_push: bool) -> FeedConfig {
    let mut feed = FeedConfig::new("example", URL, &["@news"]);
    feed.first_push = first_push;
    feed.article_expiration_duration_hours = Some(24 * 365 * 100);
    feed.template = "{title}|{pubDate}".to_string();
    feed
}

fn pipeline(
    store: Arc<DedupStore>,
    fetcher: Arc<StaticFetcher>,
    transport: Arc<RecordingTransport>,
) -> DeliveryPipeline {
    DeliveryPipeline::new(
        store,
        fetcher,
        transport,
        Arc::new(TemplateRenderer::new()),
        DeliverySettings {
            channel_concurrency: 1,
            ..DeliverySettings::default()
        },
    )
}

#[tokio::test(start_paused = true)]
async fn test_parsed_feed_is_delivered_oldest_first() {
    let dir = TempDir::new().expect("tempdir");
    let fetcher = Arc::new(StaticFetcher {
        body: Mutex::new(RSS.to_string()),
    });
    let transport = Arc::new(RecordingTransport::default());
    let relay = pipeline(open_store(dir.path()), fetcher, Arc::clone(&transport));

    let report = relay.run_cycle(&[feed(true)]).await.expect("cycle");

    assert_eq!(report.items_sent, 2);
    let texts: Vec<String> = transport.sent.lock().unwrap().iter().map(|(_, t)| t.clone()).collect();
    assert_eq!(
        texts,
        vec!["First story|2024-01-01 09:00:00", "Second story|2024-01-02 09:00:00"]
    );
}

#[tokio::test(start_paused = true)]
async fn test_restart_does_not_resend() {
    let dir = TempDir::new().expect("tempdir");
    let fetcher = Arc::new(StaticFetcher {
        body: Mutex::new(RSS.to_string()),
    });

    let first = Arc::new(RecordingTransport::default());
    pipeline(open_store(dir.path()), Arc::clone(&fetcher), Arc::clone(&first))
        .run_cycle(&[feed(true)])
        .await
        .expect("first cycle");
    assert_eq!(first.sent.lock().unwrap().len(), 2);

    let second = Arc::new(RecordingTransport::default());
    let report = pipeline(open_store(dir.path()), fetcher, Arc::clone(&second))
        .run_cycle(&[feed(true)])
        .await
        .expect("after restart");

    assert_eq!(report.items_sent, 0);
    assert!(second.sent.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_first_run_without_push_only_sends_later_items() {
    let dir = TempDir::new().expect("tempdir");
    let fetcher = Arc::new(StaticFetcher {
        body: Mutex::new(RSS.to_string()),
    });
    let transport = Arc::new(RecordingTransport::default());
    let relay = pipeline(open_store(dir.path()), Arc::clone(&fetcher), Arc::clone(&transport));

    let report = relay.run_cycle(&[feed(false)]).await.expect("first cycle");
    assert_eq!(report.backlog_suppressed, 2);
    assert!(transport.sent.lock().unwrap().is_empty());

    let updated = RSS.replace(
        "<item>\n      <title>Second story</title>",
        "<item>\n      <title>Third story</title>\n      <link>https://news.example.com/3</link>\n      <guid>story-3</guid>\n      <pubDate>Wed, 03 Jan 2024 09:00:00 GMT</pubDate>\n    </item>\n    <item>\n      <title>Second story</title>",
    );
    *fetcher.body.lock().unwrap() = updated;

    relay.run_cycle(&[feed(false)]).await.expect("second cycle");
    let texts: Vec<String> = transport.sent.lock().unwrap().iter().map(|(_, t)| t.clone()).collect();
    assert_eq!(texts, vec!["Third story|2024-01-03 09:00:00"]);
}
