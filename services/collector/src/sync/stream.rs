//! Event feed consumption.

use std::sync::Arc;

use bytes::BytesMut;
use futures_util::StreamExt;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};
use yhs_events::{ChangeEvent, EventError, EventType};

use super::accumulator::Accumulator;
use super::handler::{ApplicationEventHandler, Outcome};
use crate::client::{ClientError, SchedulerClient};
use crate::counters::EventCounters;
use crate::shutdown::signalled;

/// Longest feed line accepted; longer lines are discarded.
pub const MAX_LINE_BYTES: usize = 1 << 20;

/// Reads the scheduler's event feed and routes every event.
///
/// Application events go to the [`ApplicationEventHandler`]; queue events
/// are batched through the [`Accumulator`]; everything else is only counted.
pub struct EventStreamConsumer {
    client: Arc<dyn SchedulerClient>,
    handler: ApplicationEventHandler,
    accumulator: Arc<Accumulator>,
    counters: Arc<EventCounters>,
}

impl EventStreamConsumer {
    pub fn new(
        client: Arc<dyn SchedulerClient>,
        handler: ApplicationEventHandler,
        accumulator: Arc<Accumulator>,
        counters: Arc<EventCounters>,
    ) -> Self {
        Self {
            client,
            handler,
            accumulator,
            counters,
        }
    }

    pub fn handler(&self) -> &ApplicationEventHandler {
        &self.handler
    }

    /// Consume one connection to the feed.
    ///
    /// Returns `Ok(())` when the feed ends or `shutdown` fires, and the
    /// transport error otherwise. Undecodable lines are skipped.
    #[instrument(skip_all, fields(component = "event_stream"))]
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), ClientError> {
        let mut stream = self.client.event_stream().await?;
        info!("Event stream connected");

        let mut lines = LineSplitter::new(MAX_LINE_BYTES);
        loop {
            let chunk = tokio::select! {
                biased;
                _ = signalled(&mut shutdown) => return Ok(()),
                chunk = stream.next() => chunk,
            };

            match chunk {
                Some(Ok(bytes)) => {
                    lines.push(&bytes);
                    while let Some(line) = lines.next_line() {
                        self.process_line(&line).await;
                    }
                }
                Some(Err(e)) => return Err(e),
                None => {
                    if let Some(line) = lines.finish() {
                        self.process_line(&line).await;
                    }
                    info!("Event stream closed by scheduler");
                    return Ok(());
                }
            }
        }
    }

    async fn process_line(&mut self, line: &[u8]) -> Option<Outcome> {
        match ChangeEvent::decode(line) {
            Ok(event) => Some(self.dispatch(event).await),
            Err(EventError::Empty) => {
                warn!("Empty line on event stream");
                None
            }
            Err(e) => {
                warn!(error = %e, "Skipping undecodable event");
                None
            }
        }
    }

    /// Count an event and hand it to whoever handles its type.
    pub async fn dispatch(&mut self, event: ChangeEvent) -> Outcome {
        self.counters.record(event.key());
        debug!(
            key = %event.key(),
            detail = %event.change_detail,
            object_id = %event.object_id,
            "Event received"
        );

        match event.event_type {
            EventType::App => self.handler.handle(&event).await,
            EventType::Queue => {
                self.accumulator.add(event);
                Outcome::Forwarded
            }
            _ => Outcome::Ignored,
        }
    }
}

/// Splits a byte stream into `\n`-terminated lines of bounded length.
///
/// Bytes already searched for a terminator are not searched again. A line
/// longer than `max_line` is dropped up to and including its terminator.
struct LineSplitter {
    pending: BytesMut,
    scanned: usize,
    max_line: usize,
    discarding: bool,
}

impl LineSplitter {
    fn new(max_line: usize) -> Self {
        Self {
            pending: BytesMut::new(),
            scanned: 0,
            max_line,
            discarding: false,
        }
    }

    fn push(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
    }

    /// The next complete line, without its terminator.
    fn next_line(&mut self) -> Option<BytesMut> {
        loop {
            let Some(offset) = self.pending[self.scanned..].iter().position(|b| *b == b'\n') else {
                if self.pending.len() > self.max_line {
                    if !self.discarding {
                        warn!(max_line_bytes = self.max_line, "Event line too long, discarding");
                    }
                    self.discarding = true;
                    self.pending.clear();
                    self.scanned = 0;
                } else {
                    self.scanned = self.pending.len();
                }
                return None;
            };

            let end = self.scanned + offset;
            let mut line = self.pending.split_to(end + 1);
            line.truncate(end);
            self.scanned = 0;

            let was_discarding = std::mem::take(&mut self.discarding);
            if end > self.max_line {
                if !was_discarding {
                    warn!(line_bytes = end, max_line_bytes = self.max_line, "Event line too long, discarding");
                }
                continue;
            }
            if was_discarding {
                continue;
            }
            return Some(line);
        }
    }

    /// The unterminated remainder once the stream has ended.
    fn finish(&mut self) -> Option<BytesMut> {
        self.scanned = 0;
        let discarded = std::mem::take(&mut self.discarding);
        if discarded || self.pending.is_empty() || self.pending.len() > self.max_line {
            self.pending.clear();
            return None;
        }
        Some(self.pending.split())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tokio::sync::mpsc;
    use yhs_events::{ApplicationInfo, ChangeType, EventKey};

    use crate::client::fake::FakeClient;
    use crate::store::MemoryStore;
    use crate::workqueue::{WorkQueue, WorkQueueConfig};

    const FEED: &str = concat!(
        r#"{"type":2,"eventChangeType":2,"eventChangeDetail":203,"objectID":"app1","timestampNano":1}"#,
        "\n",
        "not json\n",
        "\n",
        r#"{"type":"QUEUE","eventChangeType":"SET","eventChangeDetail":"QUEUE_CONFIG","objectID":"root.a"}"#,
        "\n",
        r#"{"type":3,"eventChangeType":2,"eventChangeDetail":301,"objectID":"node-1"}"#,
        "\n",
        r#"{"type":2,"eventChangeType":1,"eventChangeDetail":206,"objectID":"app1","timestampNano":5}"#,
    );

    fn consumer(
        feed: &str,
    ) -> (
        EventStreamConsumer,
        mpsc::UnboundedReceiver<usize>,
        watch::Sender<bool>,
    ) {
        let client = FakeClient::default();
        *client.feed.lock().unwrap() = feed.as_bytes().to_vec();
        client.applications.lock().unwrap().insert(
            "app1".into(),
            ApplicationInfo {
                id: "app1".into(),
                ..Default::default()
            },
        );
        let client: Arc<dyn SchedulerClient> = Arc::new(client);

        let workqueue = Arc::new(WorkQueue::new(WorkQueueConfig::default()));
        let (tx, rx) = watch::channel(false);
        workqueue.start(rx).unwrap();

        let (flushed_tx, flushed_rx) = mpsc::unbounded_channel();
        let accumulator = Arc::new(Accumulator::new(
            Duration::from_secs(2),
            Box::new(move |batch| {
                let flushed_tx = flushed_tx.clone();
                Box::pin(async move {
                    let _ = flushed_tx.send(batch.len());
                })
            }),
        ));

        let handler = ApplicationEventHandler::new(
            client.clone(),
            Arc::new(MemoryStore::new()),
            workqueue,
        );
        let consumer = EventStreamConsumer::new(
            client,
            handler,
            accumulator,
            Arc::new(EventCounters::new()),
        );
        (consumer, flushed_rx, tx)
    }

    #[tokio::test]
    async fn test_feed_is_routed_and_counted() {
        let (mut consumer, _flushed, _tx) = consumer(FEED);
        let (_stop, shutdown) = watch::channel(false);

        consumer.run(shutdown).await.unwrap();

        let counters = &consumer.counters;
        assert_eq!(counters.get(EventKey::new(EventType::App, ChangeType::Add)), 1);
        assert_eq!(counters.get(EventKey::new(EventType::App, ChangeType::Set)), 1);
        assert_eq!(counters.get(EventKey::new(EventType::Queue, ChangeType::Set)), 1);
        assert_eq!(counters.get(EventKey::new(EventType::Node, ChangeType::Add)), 1);
        assert_eq!(counters.snapshot().values().sum::<u64>(), 4);

        let app = consumer.handler().cached("app1").unwrap();
        assert_eq!(app.state, "APP_RUNNING");
    }

    #[tokio::test]
    async fn test_queue_events_reach_accumulator() {
        let (mut consumer, mut flushed, _tx) = consumer("");
        let accumulator = consumer.accumulator.clone();
        let (_stop, shutdown) = watch::channel(false);
        tokio::spawn(async move { accumulator.run(shutdown).await });

        let event = ChangeEvent {
            event_type: EventType::Queue,
            change_type: ChangeType::Set,
            object_id: "root.a".into(),
            ..Default::default()
        };
        assert_eq!(consumer.dispatch(event.clone()).await, Outcome::Forwarded);
        assert_eq!(consumer.dispatch(event).await, Outcome::Forwarded);

        let batch = tokio::time::timeout(Duration::from_secs(10), flushed.recv())
            .await
            .unwrap();
        assert_eq!(batch, Some(2));
    }

    #[tokio::test]
    async fn test_user_group_events_are_only_counted() {
        let (mut consumer, _flushed, _tx) = consumer("");
        let event = ChangeEvent {
            event_type: EventType::UserGroup,
            change_type: ChangeType::Add,
            ..Default::default()
        };
        assert_eq!(consumer.dispatch(event).await, Outcome::Ignored);
        assert_eq!(
            consumer
                .counters
                .get(EventKey::new(EventType::UserGroup, ChangeType::Add)),
            1
        );
    }

    #[tokio::test]
    async fn test_shutdown_ends_run() {
        let (mut consumer, _flushed, _tx) = consumer(FEED);
        let (_stop, shutdown) = watch::channel(true);
        consumer.run(shutdown).await.unwrap();
        assert_eq!(consumer.counters.snapshot().len(), 0);
    }

    fn drain(splitter: &mut LineSplitter) -> Vec<String> {
        std::iter::from_fn(|| splitter.next_line())
            .map(|line| String::from_utf8(line.to_vec()).unwrap())
            .collect()
    }

    #[test]
    fn test_lines_split_across_chunks() {
        let mut lines = LineSplitter::new(64);
        lines.push(b"{\"a\":1}\n{\"b\"");
        assert_eq!(drain(&mut lines), ["{\"a\":1}"]);

        lines.push(b":2}");
        assert!(drain(&mut lines).is_empty());
        lines.push(b"\n\n");
        assert_eq!(drain(&mut lines), ["{\"b\":2}", ""]);
        assert!(lines.finish().is_none());
    }

    #[test]
    fn test_unterminated_tail_is_returned_at_end() {
        let mut lines = LineSplitter::new(64);
        lines.push(b"first\nsecond");
        assert_eq!(drain(&mut lines), ["first"]);
        assert_eq!(&lines.finish().unwrap()[..], b"second");
    }

    #[test]
    fn test_oversized_line_is_discarded() {
        let mut lines = LineSplitter::new(8);
        lines.push(b"0123456789");
        assert!(drain(&mut lines).is_empty());
        assert!(lines.pending.is_empty());

        lines.push(b"abcdef\nok\n");
        assert_eq!(drain(&mut lines), ["ok"]);

        lines.push(b"much-too-long\nfine\n");
        assert_eq!(drain(&mut lines), ["fine"]);
    }

    #[test]
    fn test_unterminated_feed_stays_bounded() {
        let mut lines = LineSplitter::new(16);
        for _ in 0..100 {
            lines.push(b"xxxxxxxx");
            assert!(drain(&mut lines).is_empty());
            assert!(lines.pending.len() <= 16);
        }
        assert!(lines.finish().is_none());
    }
}
