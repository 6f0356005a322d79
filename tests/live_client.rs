//! End-to-end behaviour of the live client against in-memory transports.
//!
//! Every test runs on a paused clock so reconnect delays and poll intervals
//! elapse instantly and deterministically.

use async_trait::async_trait;
use futures_util::StreamExt;
use mip_live_feed::{
    FeedError,
    client::{LiveEventClient, LiveEventHandle},
    client_state::{Channel, ConnectionState, FeedSnapshot},
    config::Config,
    error::FeedResult,
    sse::SseFrame,
    transport::{FrameStream, PollQuery, PollTransport, PushTransport, Transports},
    types::{Event, EventId, Heartbeat},
    visibility::VisibilityHandle,
};
use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::{
    sync::mpsc,
    time::{Instant, sleep},
};
use url::Url;

type FrameSender = mpsc::UnboundedSender<FeedResult<SseFrame>>;

enum Script {
    Fail(FeedError),
    Stall,
    Stream(mpsc::UnboundedReceiver<FeedResult<SseFrame>>),
}

#[derive(Debug, Clone)]
struct OpenCall {
    portfolio_id: Option<i64>,
    after_id: Option<EventId>,
    at: Instant,
}

#[derive(Default)]
struct ScriptedPush {
    scripts: Mutex<VecDeque<Script>>,
    opens: Mutex<Vec<OpenCall>>,
}

impl ScriptedPush {
    fn stream(&self) -> FrameSender {
        let (tx, rx) = mpsc::unbounded_channel();
        self.scripts.lock().unwrap().push_back(Script::Stream(rx));
        tx
    }

    fn fail(&self, error: FeedError) {
        self.scripts.lock().unwrap().push_back(Script::Fail(error));
    }

    fn stall(&self) {
        self.scripts.lock().unwrap().push_back(Script::Stall);
    }

    fn opens(&self) -> Vec<OpenCall> {
        self.opens.lock().unwrap().clone()
    }
}

#[async_trait]
impl PushTransport for ScriptedPush {
    async fn open(
        &self,
        portfolio_id: Option<i64>,
        after_id: Option<&EventId>,
    ) -> FeedResult<FrameStream> {
        self.opens.lock().unwrap().push(OpenCall {
            portfolio_id,
            after_id: after_id.cloned(),
            at: Instant::now(),
        });

        let script = self.scripts.lock().unwrap().pop_front();
        match script {
            Some(Script::Fail(error)) => Err(error),
            Some(Script::Stall) => std::future::pending().await,
            Some(Script::Stream(rx)) => {
                let frames = futures_util::stream::unfold(rx, |mut rx| async move {
                    rx.recv().await.map(|item| (item, rx))
                });
                Ok(frames.boxed())
            }
            // nothing scripted: a stream that stays open and silent
            None => Ok(futures_util::stream::pending::<FeedResult<SseFrame>>().boxed()),
        }
    }

    fn describe(&self) -> String {
        "memory://decisions/stream".to_string()
    }
}

#[derive(Default)]
struct RecordingPoll {
    responses: Mutex<VecDeque<FeedResult<Vec<Event>>>>,
    queries: Mutex<Vec<(PollQuery, Instant)>>,
    // requests from this index on never answer
    stall_from: Option<usize>,
    latency: Duration,
}

impl RecordingPoll {
    fn stalled() -> Self {
        Self::stalling_after(0)
    }

    fn stalling_after(answered: usize) -> Self {
        Self {
            stall_from: Some(answered),
            ..Default::default()
        }
    }

    fn slow(latency: Duration) -> Self {
        Self {
            latency,
            ..Default::default()
        }
    }

    fn respond(&self, response: FeedResult<Vec<Event>>) {
        self.responses.lock().unwrap().push_back(response);
    }

    fn queries(&self) -> Vec<PollQuery> {
        self.queries.lock().unwrap().iter().map(|(q, _)| q.clone()).collect()
    }
}

#[async_trait]
impl PollTransport for RecordingPoll {
    async fn fetch(&self, query: &PollQuery) -> FeedResult<Vec<Event>> {
        let index = {
            let mut queries = self.queries.lock().unwrap();
            queries.push((query.clone(), Instant::now()));
            queries.len() - 1
        };
        if self.stall_from.is_some_and(|from| index >= from) {
            std::future::pending::<()>().await;
        }
        if !self.latency.is_zero() {
            sleep(self.latency).await;
        }
        let response = self.responses.lock().unwrap().pop_front();
        response.unwrap_or_else(|| Ok(Vec::new()))
    }
}

fn config() -> Config {
    Config::new(Url::parse("http://mip.test").unwrap())
}

fn frame(event: &str, data: &str) -> FeedResult<SseFrame> {
    Ok(SseFrame {
        event: event.to_string(),
        data: data.to_string(),
        id: None,
        retry_ms: None,
    })
}

fn events_frame(ids: &[i64], last_id: i64) -> FeedResult<SseFrame> {
    let events: Vec<serde_json::Value> = ids
        .iter()
        .map(|id| {
            serde_json::json!({"event_id": id, "decision_type": "ENTRY", "severity": "green"})
        })
        .collect();
    let data = serde_json::json!({"events": events, "last_id": last_id}).to_string();
    frame("events", &data)
}

fn events(ids: &[i64]) -> Vec<Event> {
    ids.iter().map(|&id| Event::with_id(id)).collect()
}

fn ids(snapshot: &FeedSnapshot) -> Vec<EventId> {
    snapshot.events.iter().map(|e| e.event_id.clone()).collect()
}

fn numeric(values: &[i64]) -> Vec<EventId> {
    values.iter().map(|&v| EventId::Numeric(v)).collect()
}

fn start(
    config: Config,
    push: Option<Arc<ScriptedPush>>,
    poll: Arc<RecordingPoll>,
) -> LiveEventHandle {
    start_with_visibility(config, push, poll, VisibilityHandle::new(true))
}

fn start_with_visibility(
    config: Config,
    push: Option<Arc<ScriptedPush>>,
    poll: Arc<RecordingPoll>,
    visibility: VisibilityHandle,
) -> LiveEventHandle {
    let transports = Transports {
        push: push.map(|p| p as Arc<dyn PushTransport>),
        poll,
    };
    LiveEventClient::spawn(Arc::new(config), transports, None, visibility)
}

async fn wait_for(
    handle: &LiveEventHandle,
    condition: impl Fn(&FeedSnapshot) -> bool,
) -> FeedSnapshot {
    // 10ms steps on the paused clock, up to 200s of feed time
    for _ in 0..20_000 {
        let snapshot = handle.snapshot().await;
        if condition(&snapshot) {
            return snapshot;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never held; last snapshot: {:?}", handle.snapshot().await);
}

#[tokio::test(start_paused = true)]
async fn stream_batches_are_merged_without_duplicates() {
    let push = Arc::new(ScriptedPush::default());
    let poll = Arc::new(RecordingPoll::default());
    let tx = push.stream();
    let mut handle = start(config(), Some(push.clone()), poll.clone());

    tx.send(frame("connected", "{}")).unwrap();
    tx.send(events_frame(&[1, 2], 2)).unwrap();
    tx.send(events_frame(&[2, 3], 3)).unwrap();

    let snapshot = wait_for(&handle, |s| s.events.len() == 3).await;
    assert_eq!(ids(&snapshot), numeric(&[3, 2, 1]));
    assert!(snapshot.connected);
    assert_eq!(snapshot.state, ConnectionState::Connected);
    assert_eq!(snapshot.channel, Some(Channel::Push));
    assert_eq!(snapshot.cursor, Some(EventId::Numeric(3)));
    assert!(poll.queries().is_empty());

    handle.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn latest_heartbeat_wins() {
    let push = Arc::new(ScriptedPush::default());
    let tx = push.stream();
    let mut handle = start(config(), Some(push), Arc::new(RecordingPoll::default()));

    tx.send(frame("connected", "{}")).unwrap();
    tx.send(frame("heartbeat", r#"{"open":5,"triggered":1,"exited":0,"note":"first"}"#))
        .unwrap();
    tx.send(frame("heartbeat", r#"{"open":4,"triggered":1,"exited":1}"#))
        .unwrap();

    let snapshot = wait_for(&handle, |s| s.heartbeat.as_ref().is_some_and(|h| h.exited == 1)).await;
    assert_eq!(
        snapshot.heartbeat,
        Some(Heartbeat {
            open: 4,
            triggered: 1,
            exited: 1,
            ..Default::default()
        })
    );

    handle.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn server_error_does_not_drop_the_connection() {
    let push = Arc::new(ScriptedPush::default());
    let tx = push.stream();
    let mut handle = start(config(), Some(push), Arc::new(RecordingPoll::default()));

    tx.send(frame("connected", "{}")).unwrap();
    tx.send(frame("error", r#"{"message":"rate limited"}"#)).unwrap();

    let snapshot = wait_for(&handle, |s| s.error.is_some()).await;
    assert_eq!(snapshot.error.as_deref(), Some("rate limited"));
    assert!(snapshot.connected);

    handle.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn malformed_messages_are_skipped() {
    let push = Arc::new(ScriptedPush::default());
    let tx = push.stream();
    let mut handle = start(config(), Some(push), Arc::new(RecordingPoll::default()));

    tx.send(frame("connected", "{}")).unwrap();
    tx.send(frame("events", "not json")).unwrap();
    tx.send(frame("heartbeat", "[]")).unwrap();
    tx.send(frame("something-else", "{}")).unwrap();
    tx.send(events_frame(&[8], 8)).unwrap();

    let snapshot = wait_for(&handle, |s| !s.events.is_empty()).await;
    assert_eq!(ids(&snapshot), numeric(&[8]));
    assert!(snapshot.connected);
    assert!(snapshot.heartbeat.is_none());
    assert!(snapshot.error.is_none());
    assert_eq!(handle.state().lock().await.malformed_messages, 2);

    handle.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn reconnects_after_fixed_delay_and_keeps_cursor() {
    let push = Arc::new(ScriptedPush::default());
    let first = push.stream();
    let second = push.stream();
    let mut handle = start(config(), Some(push.clone()), Arc::new(RecordingPoll::default()));

    first.send(frame("connected", "{}")).unwrap();
    first.send(events_frame(&[4, 5], 5)).unwrap();
    wait_for(&handle, |s| s.events.len() == 2).await;
    drop(first);

    let snapshot = wait_for(&handle, |s| s.state == ConnectionState::Disconnected).await;
    assert!(!snapshot.connected);
    assert_eq!(snapshot.events.len(), 2, "buffer survives the outage");

    wait_for(&handle, |_| push.opens().len() == 2).await;
    let opens = push.opens();
    assert_eq!(opens[0].after_id, None);
    assert_eq!(opens[1].after_id, Some(EventId::Numeric(5)));
    assert!(opens[1].at - opens[0].at >= Duration::from_secs(5));

    // a server resend after reconnect is absorbed
    second.send(frame("connected", "{}")).unwrap();
    second.send(events_frame(&[5, 6], 6)).unwrap();
    let snapshot = wait_for(&handle, |s| s.events.len() == 3).await;
    assert_eq!(ids(&snapshot), numeric(&[6, 5, 4]));
    assert!(snapshot.connected);
    assert!(snapshot.error.is_none());

    handle.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn missing_push_transport_polls_from_zero() {
    let poll = Arc::new(RecordingPoll::default());
    poll.respond(Ok(events(&[1, 2])));
    poll.respond(Ok(events(&[3])));
    let mut handle = start(config(), None, poll.clone());

    let snapshot = wait_for(&handle, |s| s.events.len() == 3).await;
    assert_eq!(snapshot.state, ConnectionState::Polling);
    assert_eq!(snapshot.channel, Some(Channel::Poll));
    assert_eq!(ids(&snapshot), numeric(&[3, 2, 1]));

    let queries = poll.queries();
    assert_eq!(queries[0].after_id, EventId::ZERO);
    assert_eq!(queries[0].limit, 50);
    assert_eq!(queries[0].portfolio_id, None);
    assert_eq!(queries[1].after_id, EventId::Numeric(2));

    let times: Vec<Instant> = poll.queries.lock().unwrap().iter().map(|(_, at)| *at).collect();
    assert!(times[1] - times[0] >= Duration::from_secs(5));

    handle.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn unavailable_stream_switches_to_polling_once() {
    let push = Arc::new(ScriptedPush::default());
    push.fail(FeedError::PushUnavailable {
        reason: "404".to_string(),
    });
    let poll = Arc::new(RecordingPoll::default());
    poll.respond(Ok(events(&[10])));
    let mut handle = start(config(), Some(push.clone()), poll.clone());

    let snapshot = wait_for(&handle, |s| !s.events.is_empty()).await;
    assert_eq!(snapshot.channel, Some(Channel::Poll));

    sleep(Duration::from_secs(30)).await;
    assert_eq!(push.opens().len(), 1, "no stream retries after fallback");
    assert!(poll.queries().len() >= 2);

    handle.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn repeated_stream_failures_fall_back_when_limited() {
    let push = Arc::new(ScriptedPush::default());
    push.fail(FeedError::StreamClosed);
    push.fail(FeedError::Timeout);
    let poll = Arc::new(RecordingPoll::default());

    let mut config = config();
    config.stream.max_push_failures = 2;
    let mut handle = start(config, Some(push.clone()), poll.clone());

    let snapshot = wait_for(&handle, |s| s.channel == Some(Channel::Poll)).await;
    assert_eq!(snapshot.state, ConnectionState::Polling);
    assert_eq!(push.opens().len(), 2);
    wait_for(&handle, |_| !poll.queries().is_empty()).await;

    handle.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn poll_failures_keep_buffer_and_clear_on_success() {
    let poll = Arc::new(RecordingPoll::default());
    poll.respond(Ok(events(&[1])));
    poll.respond(Err(FeedError::UnexpectedStatus {
        status: 503,
        endpoint: "http://mip.test/decisions/events".to_string(),
    }));
    poll.respond(Ok(events(&[2])));
    let mut handle = start(config(), None, poll.clone());

    let snapshot = wait_for(&handle, |s| s.error.is_some()).await;
    assert_eq!(ids(&snapshot), numeric(&[1]));
    assert!(snapshot.error.as_deref().unwrap().contains("503"));

    let snapshot = wait_for(&handle, |s| s.events.len() == 2).await;
    assert!(snapshot.error.is_none());
    assert_eq!(poll.queries()[2].after_id, EventId::Numeric(1));

    handle.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn hidden_surface_is_not_polled() {
    let poll = Arc::new(RecordingPoll::default());
    let visibility = VisibilityHandle::new(false);
    let mut handle = start_with_visibility(config(), None, poll.clone(), visibility.clone());

    sleep(Duration::from_secs(32)).await;
    assert!(poll.queries().is_empty());

    visibility.set_visible(true);
    sleep(Duration::from_millis(10)).await;
    assert_eq!(poll.queries().len(), 1, "one immediate refresh");

    sleep(Duration::from_secs(2)).await;
    assert_eq!(poll.queries().len(), 1);

    sleep(Duration::from_secs(4)).await;
    assert_eq!(poll.queries().len(), 2, "interval resumes");

    visibility.set_visible(false);
    sleep(Duration::from_secs(30)).await;
    assert_eq!(poll.queries().len(), 2);

    handle.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn disabled_client_stays_idle() {
    let push = Arc::new(ScriptedPush::default());
    let poll = Arc::new(RecordingPoll::default());
    let mut config = config();
    config.stream.enabled = false;
    let mut handle = start(config, Some(push.clone()), poll.clone());

    sleep(Duration::from_secs(60)).await;
    let snapshot = handle.snapshot().await;
    assert_eq!(snapshot.state, ConnectionState::Idle);
    assert!(snapshot.events.is_empty());
    assert!(push.opens().is_empty());
    assert!(poll.queries().is_empty());

    handle.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn teardown_is_idempotent_and_drops_in_flight_polls() {
    let poll = Arc::new(RecordingPoll::stalled());
    let mut handle = start(config(), None, poll.clone());

    wait_for(&handle, |_| poll.queries().len() == 1).await;
    handle.teardown().await;
    handle.teardown().await;

    let snapshot = handle.snapshot().await;
    assert_eq!(snapshot.state, ConnectionState::TornDown);
    assert!(snapshot.events.is_empty());
    assert!(snapshot.channel.is_none());
    assert!(!handle.is_running());

    sleep(Duration::from_secs(60)).await;
    assert_eq!(poll.queries().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn reconfigure_replaces_the_subscription() {
    let push = Arc::new(ScriptedPush::default());
    let old = push.stream();
    let new = push.stream();
    let mut handle = start(config(), Some(push.clone()), Arc::new(RecordingPoll::default()));

    old.send(frame("connected", "{}")).unwrap();
    old.send(events_frame(&[1], 1)).unwrap();
    wait_for(&handle, |s| s.events.len() == 1).await;

    handle.reconfigure(Some(7), true).await;
    let _ = old.send(events_frame(&[99], 99));

    new.send(frame("connected", "{}")).unwrap();
    new.send(events_frame(&[20], 20)).unwrap();
    let snapshot = wait_for(&handle, |s| !s.events.is_empty()).await;

    assert_eq!(ids(&snapshot), numeric(&[20]));
    let opens = push.opens();
    assert_eq!(opens.len(), 2);
    assert_eq!(opens[1].portfolio_id, Some(7));
    assert_eq!(opens[1].after_id, None, "cursor does not leak across filters");
    assert_eq!(handle.config().stream.portfolio_id, Some(7));

    handle.reconfigure(Some(7), false).await;
    sleep(Duration::from_secs(30)).await;
    assert_eq!(handle.snapshot().await.state, ConnectionState::Idle);
    assert_eq!(push.opens().len(), 2);

    handle.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn silent_stream_is_dropped_after_idle_timeout() {
    let push = Arc::new(ScriptedPush::default());
    let mut handle = start(config(), Some(push.clone()), Arc::new(RecordingPoll::default()));

    let snapshot = wait_for(&handle, |s| s.state == ConnectionState::Disconnected).await;
    assert_eq!(snapshot.error.as_deref(), Some("Request timed out"));

    wait_for(&handle, |_| push.opens().len() == 2).await;
    let opens = push.opens();
    assert!(opens[1].at - opens[0].at >= Duration::from_secs(65));

    handle.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn frames_keep_the_idle_timer_from_firing() {
    let push = Arc::new(ScriptedPush::default());
    let tx = push.stream();
    let mut handle = start(config(), Some(push.clone()), Arc::new(RecordingPoll::default()));

    tx.send(frame("connected", "{}")).unwrap();
    for open in 1..=4u64 {
        sleep(Duration::from_secs(40)).await;
        let data = format!(r#"{{"open":{open},"triggered":0,"exited":0}}"#);
        tx.send(frame("heartbeat", &data)).unwrap();
    }
    sleep(Duration::from_millis(10)).await;

    let snapshot = handle.snapshot().await;
    assert!(snapshot.connected);
    assert_eq!(snapshot.heartbeat.map(|h| h.open), Some(4));
    assert_eq!(push.opens().len(), 1);

    handle.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn stalled_stream_open_times_out_and_retries() {
    let push = Arc::new(ScriptedPush::default());
    push.stall();
    let mut handle = start(config(), Some(push.clone()), Arc::new(RecordingPoll::default()));

    let snapshot = wait_for(&handle, |s| s.state == ConnectionState::Disconnected).await;
    assert_eq!(snapshot.error.as_deref(), Some("Request timed out"));

    wait_for(&handle, |_| push.opens().len() == 2).await;
    let opens = push.opens();
    assert!(opens[1].at - opens[0].at >= Duration::from_secs(20));

    handle.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn stalled_poll_times_out_and_keeps_buffer() {
    let poll = Arc::new(RecordingPoll::stalling_after(1));
    poll.respond(Ok(events(&[1, 2])));
    let mut handle = start(config(), None, poll.clone());

    wait_for(&handle, |s| s.events.len() == 2).await;
    let started = Instant::now();
    let snapshot = wait_for(&handle, |s| s.error.is_some()).await;

    assert_eq!(snapshot.error.as_deref(), Some("Request timed out"));
    assert_eq!(ids(&snapshot), numeric(&[2, 1]));
    assert_eq!(snapshot.state, ConnectionState::Polling);
    // the second poll starts at 5s and gives up 15s later
    assert!(Instant::now() - started >= Duration::from_secs(15));

    handle.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn zero_poll_interval_does_not_stop_the_client() {
    let poll = Arc::new(RecordingPoll::default());
    let mut config = config();
    config.poll.interval = Duration::ZERO;
    let mut handle = start(config, None, poll.clone());

    wait_for(&handle, |_| poll.queries().len() >= 2).await;
    assert!(handle.is_running());

    handle.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn reveal_during_a_poll_still_refreshes() {
    let poll = Arc::new(RecordingPoll::slow(Duration::from_secs(1)));
    let visibility = VisibilityHandle::new(true);
    let mut handle = start_with_visibility(config(), None, poll.clone(), visibility.clone());

    // first tick's request is in flight until t=1s
    sleep(Duration::from_millis(500)).await;
    assert_eq!(poll.queries().len(), 1);
    visibility.set_visible(false);
    visibility.set_visible(true);

    sleep(Duration::from_millis(1_000)).await;
    assert_eq!(poll.queries().len(), 2, "reveal refreshed after the in-flight poll");

    handle.teardown().await;
}

