// file: src/client.rs
// description: live decision-event client: SSE stream with reconnect and polling fallback
// reference: GET /decisions/stream (SSE), GET /decisions/events (poll)

use crate::{
    buffer::{EventBuffer, MergeOutcome},
    client_state::{Channel, ClientState, FeedSnapshot, Lease, SharedClientState},
    config::Config,
    error::FeedError,
    events::{EventSender, FeedEvent},
    monitoring::{
        BUFFERED_GAUGE, CONNECTED_GAUGE, DUPLICATES_COUNTER, EVENTS_MERGED_COUNTER,
        EVICTED_COUNTER, MALFORMED_COUNTER, MESSAGES_RECEIVED_COUNTER, POLL_COUNTER,
        RECONNECT_COUNTER,
    },
    sse::SseFrame,
    transport::{PollQuery, PushTransport, Transports},
    types::StreamMessage,
    visibility::{VisibilityHandle, VisibilityWatch},
};
use futures_util::StreamExt;
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::{Mutex, mpsc::error::TrySendError, watch},
    task::JoinHandle,
    time::{MissedTickBehavior, interval, sleep, timeout},
};
use tracing::{debug, info, trace, warn};

const MIN_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// How the push loop ended.
#[derive(Debug, PartialEq, Eq)]
enum PushExit {
    Stopped,
    FallBack,
}

/// Receivers the run loop waits on besides the transports.
struct Signals {
    shutdown: watch::Receiver<bool>,
    visibility: VisibilityWatch,
    visibility_closed: bool,
}

// A dropped sender also means stop.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

impl Signals {
    fn is_visible(&self) -> bool {
        self.visibility.borrow().visible
    }
}

pub struct LiveEventClient {
    pub config: Arc<Config>,
    transports: Transports,
    event_sender: Option<EventSender>,
    pub state: SharedClientState,
}

impl LiveEventClient {
    pub fn new(
        config: Arc<Config>,
        transports: Transports,
        event_sender: Option<EventSender>,
    ) -> Self {
        let buffer = EventBuffer::with_policies(
            config.buffer.retention_cap,
            config.buffer.merge_policy,
            config.buffer.ordering,
        );
        Self {
            config,
            transports,
            event_sender,
            state: Arc::new(Mutex::new(ClientState::new(buffer))),
        }
    }

    /// Starts the client on the current tokio runtime.
    pub fn spawn(
        config: Arc<Config>,
        transports: Transports,
        event_sender: Option<EventSender>,
        visibility: VisibilityHandle,
    ) -> LiveEventHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let client = Self::new(config.clone(), transports.clone(), event_sender.clone());
        let state = client.state.clone();
        let signals = Signals {
            shutdown: shutdown_rx,
            visibility: visibility.subscribe(),
            visibility_closed: false,
        };
        let task = tokio::spawn(client.run(signals));

        LiveEventHandle {
            config,
            transports,
            event_sender,
            visibility,
            state,
            shutdown: shutdown_tx,
            task: Some(task),
        }
    }

    async fn run(self, mut signals: Signals) {
        self.notify(FeedEvent::Starting);

        if !self.config.stream.enabled {
            info!("Feed disabled; staying idle");
            self.notify(FeedEvent::Idle);
            shutdown_requested(&mut signals.shutdown).await;
            self.notify(FeedEvent::Stopping);
            return;
        }

        let push = if self.config.stream.push_enabled {
            self.transports.push.clone()
        } else {
            None
        };

        let fall_back = match push {
            Some(push) => self.run_push(push, &mut signals).await == PushExit::FallBack,
            None => {
                info!("Push channel unavailable; polling from the start");
                self.notify(FeedEvent::FallbackToPolling {
                    reason: "push channel unavailable".to_string(),
                });
                true
            }
        };

        if fall_back {
            self.run_poll(&mut signals).await;
        }

        CONNECTED_GAUGE.set(0.0);
        self.notify(FeedEvent::Stopping);
    }

    async fn run_push(&self, push: Arc<dyn PushTransport>, signals: &mut Signals) -> PushExit {
        let url = push.describe();

        loop {
            let (lease, attempt) = {
                let mut state = self.state.lock().await;
                match state.activate(Channel::Push) {
                    Some(lease) => (lease, state.reconnect_attempt),
                    None => return PushExit::Stopped,
                }
            };

            info!(%url, attempt, "Connecting to decision stream");
            self.notify(FeedEvent::Connecting {
                url: url.clone(),
                attempt,
            });

            let failure = tokio::select! {
                _ = shutdown_requested(&mut signals.shutdown) => return PushExit::Stopped,
                failure = self.stream_session(push.as_ref(), &lease) => failure,
            };

            CONNECTED_GAUGE.set(0.0);
            let unavailable = matches!(failure, FeedError::PushUnavailable { .. });
            let (failures, attempt) = {
                let mut state = self.state.lock().await;
                if !state.on_transport_error(&lease, failure.to_string()) {
                    return PushExit::Stopped;
                }
                (state.consecutive_push_failures, state.increment_reconnect())
            };

            warn!(error = %failure, failures, "Decision stream disconnected");
            self.notify(FeedEvent::ConnectionFailed(failure.to_string()));

            let limit = self.config.stream.max_push_failures;
            if unavailable || (limit > 0 && failures >= limit) {
                let reason = if unavailable {
                    failure.to_string()
                } else {
                    format!("{failures} consecutive stream failures")
                };
                warn!(%reason, "Falling back to polling");
                self.notify(FeedEvent::FallbackToPolling { reason });
                return PushExit::FallBack;
            }

            let delay = self.reconnect_delay();
            RECONNECT_COUNTER.increment(1);
            info!("Reconnecting in {:?} (attempt {})", delay, attempt);
            self.notify(FeedEvent::Reconnecting {
                attempt,
                delay_ms: delay.as_millis() as u64,
            });

            tokio::select! {
                _ = shutdown_requested(&mut signals.shutdown) => return PushExit::Stopped,
                _ = sleep(delay) => {}
            }
        }
    }

    /// Runs one stream connection until it fails. The returned error is the
    /// reason it ended; a stream that ends cleanly is `StreamClosed`.
    async fn stream_session(&self, push: &dyn PushTransport, lease: &Lease) -> FeedError {
        let after_id = self.state.lock().await.cursor().cloned();
        let open = push.open(self.config.stream.portfolio_id, after_id.as_ref());

        let mut frames = match timeout(self.config.api.timeout, open).await {
            Ok(Ok(frames)) => frames,
            Ok(Err(e)) => return e,
            Err(_) => return FeedError::Timeout,
        };

        let idle_timeout = self.config.stream.idle_timeout;
        loop {
            match timeout(idle_timeout, frames.next()).await {
                Err(_) => {
                    debug!("No frame within {:?}", idle_timeout);
                    return FeedError::Timeout;
                }
                Ok(None) => return FeedError::StreamClosed,
                Ok(Some(Err(e))) => return e,
                Ok(Some(Ok(frame))) => {
                    if !self.handle_frame(lease, frame).await {
                        return FeedError::StreamClosed;
                    }
                }
            }
        }
    }

    /// Applies one frame. Returns false once the lease is no longer current.
    async fn handle_frame(&self, lease: &Lease, frame: SseFrame) -> bool {
        MESSAGES_RECEIVED_COUNTER.increment(1);
        trace!(event = %frame.event, data = %frame.data, "Received stream frame");

        let decoded = StreamMessage::decode(&frame.event, &frame.data);
        let mut state = self.state.lock().await;
        if !state.is_current(lease) {
            debug!("Discarding frame for inactive stream");
            return false;
        }

        let message = match decoded {
            Ok(Some(message)) => message,
            Ok(None) => {
                trace!(event = %frame.event, "Ignoring unrecognised stream message");
                return true;
            }
            Err(e) => {
                state.record_malformed();
                drop(state);
                MALFORMED_COUNTER.increment(1);
                debug!(event = %frame.event, error = %e, "Dropping malformed message");
                self.notify(FeedEvent::MalformedMessage {
                    kind: frame.event,
                    reason: e.to_string(),
                });
                return true;
            }
        };

        state.record_message();
        match message {
            StreamMessage::Connected => {
                state.on_connected(lease);
                let session_id = state.session_id.clone();
                drop(state);
                CONNECTED_GAUGE.set(1.0);
                info!(%session_id, "Decision stream connected");
                self.notify(FeedEvent::Connected { session_id });
            }
            StreamMessage::Events(payload) => {
                if let Some(outcome) = state.on_events(lease, payload.events, payload.last_id) {
                    let buffered = state.buffer().len();
                    drop(state);
                    self.report_merge(Channel::Push, outcome, buffered);
                }
            }
            StreamMessage::Heartbeat(heartbeat) => {
                state.on_heartbeat(lease, heartbeat.clone());
                drop(state);
                debug!(
                    open = heartbeat.open,
                    triggered = heartbeat.triggered,
                    exited = heartbeat.exited,
                    "Heartbeat"
                );
                self.notify(FeedEvent::Heartbeat(Arc::new(heartbeat)));
            }
            StreamMessage::Error(payload) => {
                state.on_server_error(lease, payload.message.clone());
                drop(state);
                warn!(message = %payload.message, "Server reported stream error");
                self.notify(FeedEvent::ServerError {
                    message: payload.message,
                });
            }
        }
        true
    }

    async fn run_poll(&self, signals: &mut Signals) {
        let Some(lease) = self.state.lock().await.activate(Channel::Poll) else {
            return;
        };

        let mut period = self.config.poll.interval;
        if period.is_zero() {
            warn!("Poll interval is zero; using {:?}", MIN_POLL_INTERVAL);
            period = MIN_POLL_INTERVAL;
        }
        info!("Polling decision events every {:?}", period);
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut seen_reveals = signals.visibility.borrow().reveals;

        loop {
            tokio::select! {
                _ = shutdown_requested(&mut signals.shutdown) => return,
                _ = ticker.tick() => {
                    // A reveal already seen here is served by this tick's poll.
                    let now = *signals.visibility.borrow_and_update();
                    seen_reveals = now.reveals;
                    if now.visible {
                        if !self.poll_once(&lease).await {
                            return;
                        }
                    } else {
                        trace!("Surface hidden; skipping poll");
                    }
                }
                changed = signals.visibility.changed(), if !signals.visibility_closed => {
                    if changed.is_err() {
                        signals.visibility_closed = true;
                        continue;
                    }
                    let now = *signals.visibility.borrow_and_update();
                    if now.visible && now.reveals != seen_reveals {
                        debug!("Surface visible again; refreshing now");
                        if !self.poll_once(&lease).await {
                            return;
                        }
                        ticker.reset();
                    }
                    seen_reveals = now.reveals;
                }
            }
        }
    }

    /// One poll request. Returns false once the lease is no longer current.
    async fn poll_once(&self, lease: &Lease) -> bool {
        let query = {
            let state = self.state.lock().await;
            if !state.is_current(lease) {
                return false;
            }
            PollQuery {
                after_id: state.after_id(),
                limit: self.config.poll.page_size,
                portfolio_id: self.config.stream.portfolio_id,
            }
        };

        POLL_COUNTER.increment(1);
        trace!(after_id = %query.after_id, "Polling decision events");
        let result = timeout(self.config.api.timeout, self.transports.poll.fetch(&query))
            .await
            .unwrap_or_else(|_| Err(FeedError::Timeout));

        let mut state = self.state.lock().await;
        if !state.is_current(lease) {
            debug!("Discarding poll response for inactive client");
            return false;
        }

        match result {
            Ok(events) => {
                if let Some(outcome) = state.on_poll_success(lease, events) {
                    let buffered = state.buffer().len();
                    drop(state);
                    self.report_merge(Channel::Poll, outcome, buffered);
                }
            }
            Err(e) => {
                state.on_transport_error(lease, e.to_string());
                drop(state);
                warn!(error = %e, "Poll failed");
                self.notify(FeedEvent::PollFailed(e.to_string()));
            }
        }
        true
    }

    fn report_merge(&self, channel: Channel, outcome: MergeOutcome, buffered: usize) {
        EVENTS_MERGED_COUNTER.increment(outcome.inserted as u64);
        DUPLICATES_COUNTER.increment(outcome.duplicates as u64);
        EVICTED_COUNTER.increment(outcome.evicted as u64);
        BUFFERED_GAUGE.set(buffered as f64);

        debug!(
            ?channel,
            inserted = outcome.inserted,
            duplicates = outcome.duplicates,
            evicted = outcome.evicted,
            buffered,
            "Merged event batch"
        );

        if outcome.inserted > 0 {
            self.notify(FeedEvent::EventsMerged {
                channel,
                fresh: Arc::new(outcome.fresh),
                duplicates: outcome.duplicates,
                evicted: outcome.evicted,
                buffered,
            });
        }
    }

    fn reconnect_delay(&self) -> Duration {
        let base = self.config.stream.reconnect_delay;
        let jitter = self.config.stream.reconnect_jitter;
        if jitter.is_zero() {
            base
        } else {
            base + Duration::from_millis(fastrand::u64(0..=jitter.as_millis() as u64))
        }
    }

    // Never blocks: a full or closed bus only costs the notification.
    fn notify(&self, event: FeedEvent) {
        if let Some(sender) = &self.event_sender {
            match sender.try_send(event) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => debug!("Consumer lagging; notification dropped"),
                Err(TrySendError::Closed(_)) => trace!("Consumer gone; notification dropped"),
            }
        }
    }
}

/// Owner side of a running client. Dropping it tears the client down.
pub struct LiveEventHandle {
    config: Arc<Config>,
    transports: Transports,
    event_sender: Option<EventSender>,
    visibility: VisibilityHandle,
    state: SharedClientState,
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl LiveEventHandle {
    pub async fn snapshot(&self) -> FeedSnapshot {
        self.state.lock().await.snapshot()
    }

    /// State of the current client. A reconfigure replaces it.
    pub fn state(&self) -> SharedClientState {
        self.state.clone()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn visibility(&self) -> &VisibilityHandle {
        &self.visibility
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Stops the client and discards its state. Later calls do nothing.
    pub async fn teardown(&mut self) {
        let first = self.state.lock().await.teardown();
        self.shutdown.send_replace(true);
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
        }
        if first {
            CONNECTED_GAUGE.set(0.0);
            info!("Feed client torn down");
        }
    }

    /// Replaces the running client with one for a new filter or enabled
    /// flag. The old client is fully stopped before the new one starts.
    pub async fn reconfigure(&mut self, portfolio_id: Option<i64>, enabled: bool) {
        self.teardown().await;

        let mut config = (*self.config).clone();
        config.stream.portfolio_id = portfolio_id;
        config.stream.enabled = enabled;
        info!(?portfolio_id, enabled, "Reconfiguring feed client");

        let next = LiveEventClient::spawn(
            Arc::new(config),
            self.transports.clone(),
            self.event_sender.clone(),
            self.visibility.clone(),
        );
        *self = next;
    }
}

impl Drop for LiveEventHandle {
    fn drop(&mut self) {
        if let Ok(mut state) = self.state.try_lock() {
            state.teardown();
        }
        self.shutdown.send_replace(true);
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
