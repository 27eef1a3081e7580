//! Single relay connection management.
//!
//! Each connection runs as a background task that owns the WebSocket, the resubscribe
//! list and the publishes awaiting `OK`. Callers only send commands, so all of that
//! state has a single writer.

use crate::backoff::Backoff;
use crate::error::{ClientError, Result};
use crate::message::{ClientMessage, RelayMessage, parse_relay_message};
use futures_util::{SinkExt, StreamExt, stream::SplitSink};
use nostr::{Event, Filter};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, interval_at, sleep, timeout};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWriter = SplitSink<WsStream, Message>;

/// A connection must stay open this long before the reconnect backoff starts over.
const STABLE_CONNECTION: Duration = Duration::from_secs(5);

/// Connection state.
///
/// `Connecting -> Open -> (Closed | Backoff -> Connecting)`. A `Closed` connection with
/// nothing outstanding reconnects as soon as it is given work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
    Backoff,
}

/// Event received from a relay, tagged with its source.
#[derive(Debug, Clone)]
pub struct InboundEvent {
    pub relay_url: String,
    pub subscription_id: String,
    pub event: Event,
}

/// Relay answer to a published event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishAck {
    pub accepted: bool,
    pub message: String,
}

/// Relay connection configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub connect_timeout: Duration,
    pub reconnect_base_delay: Duration,
    pub reconnect_max_delay: Duration,
    /// 0 means unlimited.
    pub max_reconnect_attempts: u32,
    /// `None` disables keepalive pings.
    pub ping_interval: Option<Duration>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            reconnect_base_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(60),
            max_reconnect_attempts: 0,
            ping_interval: Some(Duration::from_secs(30)),
        }
    }
}

enum Command {
    Subscribe {
        subscription_id: String,
        filters: Vec<Filter>,
    },
    Unsubscribe(String),
    Publish {
        event: Event,
        reply: Option<oneshot::Sender<PublishAck>>,
    },
    Shutdown,
}

/// Handle to one relay connection task.
pub struct RelayConnection {
    url: String,
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RelayConnection {
    /// Spawn the connection task and start connecting. Must be called inside a Tokio runtime.
    ///
    /// Events for live subscriptions are forwarded to `inbound`.
    pub fn open(
        url: &str,
        config: RelayConfig,
        inbound: mpsc::UnboundedSender<InboundEvent>,
    ) -> Result<Self> {
        let parsed_url = Url::parse(url)?;
        if parsed_url.scheme() != "ws" && parsed_url.scheme() != "wss" {
            return Err(ClientError::InvalidUrl(format!(
                "URL must use ws:// or wss:// scheme, got: {}",
                parsed_url.scheme()
            )));
        }

        let (commands, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(ConnectionState::Connecting);
        let actor = RelayActor::new(url.to_string(), config, command_rx, state_tx, inbound);
        let task = tokio::spawn(actor.run());

        Ok(Self {
            url: url.to_string(),
            commands,
            state,
            task: Mutex::new(Some(task)),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Wait until the connection reaches `target`.
    pub async fn wait_for_state(&self, target: ConnectionState, limit: Duration) -> Result<()> {
        let mut state = self.state.clone();
        timeout(limit, state.wait_for(|current| *current == target))
            .await
            .map_err(|_| {
                ClientError::Timeout(format!("{} did not reach {:?} in {:?}", self.url, target, limit))
            })?
            .map_err(|_| ClientError::NotConnected)?;
        Ok(())
    }

    /// Open a wire subscription. Sent immediately when open, otherwise on the next open.
    pub fn subscribe(&self, subscription_id: impl Into<String>, filters: Vec<Filter>) -> Result<()> {
        self.command(Command::Subscribe {
            subscription_id: subscription_id.into(),
            filters,
        })
    }

    /// Cancel a wire subscription and drop it from the resubscribe list.
    pub fn unsubscribe(&self, subscription_id: impl Into<String>) -> Result<()> {
        self.command(Command::Unsubscribe(subscription_id.into()))
    }

    /// Publish and return a receiver for the relay's `OK`.
    ///
    /// The receiver errors if the connection gives up or shuts down first.
    pub fn publish(&self, event: Event) -> Result<oneshot::Receiver<PublishAck>> {
        let (reply, ack) = oneshot::channel();
        self.command(Command::Publish {
            event,
            reply: Some(reply),
        })?;
        Ok(ack)
    }

    /// Send a client message without waiting for any acknowledgement.
    pub fn send(&self, message: ClientMessage) -> Result<()> {
        match message {
            ClientMessage::Req {
                subscription_id,
                filters,
            } => self.subscribe(subscription_id, filters),
            ClientMessage::Close(subscription_id) => self.unsubscribe(subscription_id),
            ClientMessage::Event(event) => self.command(Command::Publish { event, reply: None }),
        }
    }

    /// Close the socket and stop the connection task.
    pub async fn close(&self) {
        // Send errors mean the task is already gone.
        let _ = self.commands.send(Command::Shutdown);
        let task = self.task.lock().await.take();
        if let Some(task) = task
            && let Err(error) = task.await
        {
            warn!("relay task for {} ended abnormally: {}", self.url, error);
        }
    }

    fn command(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| ClientError::NotConnected)
    }
}

struct PendingPublish {
    event: Event,
    replies: Vec<oneshot::Sender<PublishAck>>,
    sent: bool,
}

enum Next {
    Connect,
    Backoff,
    Idle,
    Shutdown,
}

struct RelayActor {
    url: String,
    config: RelayConfig,
    commands: mpsc::UnboundedReceiver<Command>,
    state: watch::Sender<ConnectionState>,
    inbound: mpsc::UnboundedSender<InboundEvent>,
    /// Resubscribe list, replayed in id order after every reconnect.
    outstanding: BTreeMap<String, Vec<Filter>>,
    pending: HashMap<String, PendingPublish>,
    backoff: Backoff,
    opened_at: Option<Instant>,
}

impl RelayActor {
    fn new(
        url: String,
        config: RelayConfig,
        commands: mpsc::UnboundedReceiver<Command>,
        state: watch::Sender<ConnectionState>,
        inbound: mpsc::UnboundedSender<InboundEvent>,
    ) -> Self {
        let backoff = Backoff::new(
            config.reconnect_base_delay,
            config.reconnect_max_delay,
            config.max_reconnect_attempts,
        );
        Self {
            url,
            config,
            commands,
            state,
            inbound,
            outstanding: BTreeMap::new(),
            pending: HashMap::new(),
            backoff,
            opened_at: None,
        }
    }

    async fn run(mut self) {
        let mut next = Next::Connect;
        loop {
            next = match next {
                Next::Connect => self.connect_and_serve().await,
                Next::Backoff => self.wait_backoff().await,
                Next::Idle => self.idle().await,
                Next::Shutdown => break,
            };
        }
        self.set_state(ConnectionState::Closed);
        debug!("relay task for {} stopped", self.url);
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    async fn connect_and_serve(&mut self) -> Next {
        self.set_state(ConnectionState::Connecting);
        let connected = timeout(self.config.connect_timeout, connect_async(self.url.as_str())).await;
        let stream = match connected {
            Ok(Ok((stream, _response))) => stream,
            Ok(Err(error)) => {
                warn!("failed to connect to {}: {}", self.url, error);
                return self.after_disconnect();
            }
            Err(_) => {
                warn!(
                    "connection to {} timed out after {:?}",
                    self.url, self.config.connect_timeout
                );
                return self.after_disconnect();
            }
        };

        let (mut writer, mut reader) = stream.split();
        self.opened_at = Some(Instant::now());
        self.set_state(ConnectionState::Open);
        info!("connected to {}", self.url);

        if let Err(error) = self.replay(&mut writer).await {
            warn!("replay to {} failed: {}", self.url, error);
            return self.after_disconnect();
        }

        let mut ping = self
            .config
            .ping_interval
            .filter(|period| !period.is_zero())
            .map(|period| interval_at(Instant::now() + period, period));

        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    let command = match command {
                        None | Some(Command::Shutdown) => {
                            if let Err(error) = writer.send(Message::Close(None)).await {
                                debug!("close frame to {} failed: {}", self.url, error);
                            }
                            return Next::Shutdown;
                        }
                        Some(command) => command,
                    };
                    if let Some(message) = self.apply(command, true)
                        && let Err(error) = send_message(&mut writer, &message).await
                    {
                        warn!("write to {} failed: {}", self.url, error);
                        return self.after_disconnect();
                    }
                }
                frame = reader.next() => match frame {
                    Some(Ok(Message::Text(text))) => self.handle_text(text.as_str()),
                    Some(Ok(Message::Close(_))) | None => {
                        info!("relay {} closed the connection", self.url);
                        return self.after_disconnect();
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        debug!("received ping from {} ({} bytes)", self.url, payload.len());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(error)) => {
                        warn!("websocket read error on {}: {}", self.url, error);
                        return self.after_disconnect();
                    }
                },
                () = next_tick(&mut ping) => {
                    self.prune_pending();
                    if let Err(error) = writer.send(Message::Ping(Vec::new())).await {
                        warn!("ping to {} failed: {}", self.url, error);
                        return self.after_disconnect();
                    }
                }
            }
        }
    }

    /// Re-issue every outstanding subscription and flush queued publishes.
    async fn replay(&mut self, writer: &mut WsWriter) -> Result<()> {
        for (subscription_id, filters) in &self.outstanding {
            let request = ClientMessage::Req {
                subscription_id: subscription_id.clone(),
                filters: filters.clone(),
            };
            send_message(writer, &request).await?;
        }
        if !self.outstanding.is_empty() {
            debug!(
                "replayed {} subscriptions on {}",
                self.outstanding.len(),
                self.url
            );
        }

        self.prune_pending();
        for pending in self.pending.values_mut() {
            send_message(writer, &ClientMessage::Event(pending.event.clone())).await?;
            pending.sent = true;
        }
        Ok(())
    }

    /// Record the effect of a command and return the frame to send if the socket is open.
    fn apply(&mut self, command: Command, open: bool) -> Option<ClientMessage> {
        self.prune_pending();
        let message = match command {
            Command::Subscribe {
                subscription_id,
                filters,
            } => {
                self.outstanding
                    .insert(subscription_id.clone(), filters.clone());
                Some(ClientMessage::Req {
                    subscription_id,
                    filters,
                })
            }
            // A subscription that never reached the relay needs no CLOSE.
            Command::Unsubscribe(subscription_id) => self
                .outstanding
                .remove(&subscription_id)
                .map(|_| ClientMessage::Close(subscription_id)),
            Command::Publish { event, reply } => {
                let pending = self
                    .pending
                    .entry(event.id.clone())
                    .or_insert_with(|| PendingPublish {
                        event: event.clone(),
                        replies: Vec::new(),
                        sent: false,
                    });
                pending.replies.extend(reply);
                pending.sent |= open;
                Some(ClientMessage::Event(event))
            }
            Command::Shutdown => None,
        };
        message.filter(|_| open)
    }

    fn handle_text(&mut self, text: &str) {
        match parse_relay_message(text) {
            Ok(Some(RelayMessage::Event(subscription_id, event))) => {
                if !self.outstanding.contains_key(&subscription_id) {
                    debug!(
                        "dropping event for closed subscription {} on {}",
                        subscription_id, self.url
                    );
                    return;
                }
                if self
                    .inbound
                    .send(InboundEvent {
                        relay_url: self.url.clone(),
                        subscription_id,
                        event,
                    })
                    .is_err()
                {
                    debug!("inbound receiver for {} is gone", self.url);
                }
            }
            Ok(Some(RelayMessage::Ok(event_id, accepted, message))) => {
                if let Some(pending) = self.pending.remove(&event_id) {
                    for reply in pending.replies {
                        let _ = reply.send(PublishAck {
                            accepted,
                            message: message.clone(),
                        });
                    }
                }
            }
            Ok(Some(RelayMessage::Eose(subscription_id))) => {
                debug!("end of stored events for {} on {}", subscription_id, self.url);
            }
            Ok(Some(RelayMessage::Notice(notice))) => {
                info!("notice from {}: {}", self.url, notice);
            }
            Ok(Some(RelayMessage::Auth(_))) => {
                debug!("ignoring AUTH challenge from {}", self.url);
            }
            Ok(Some(RelayMessage::Closed(subscription_id, reason))) => {
                if self.outstanding.remove(&subscription_id).is_some() {
                    warn!(
                        "{} closed subscription {}: {}",
                        self.url, subscription_id, reason
                    );
                }
            }
            Ok(None) => {}
            Err(error) => warn!("protocol parse error on {}: {}", self.url, error),
        }
    }

    /// Drop publishes that were written and have nobody left waiting for their `OK`.
    ///
    /// Unsent publishes stay queued even without a waiter.
    fn prune_pending(&mut self) {
        self.pending.retain(|_, pending| {
            pending.replies.retain(|reply| !reply.is_closed());
            !(pending.sent && pending.replies.is_empty())
        });
    }

    fn has_work(&mut self) -> bool {
        self.prune_pending();
        !self.outstanding.is_empty() || !self.pending.is_empty()
    }

    fn after_disconnect(&mut self) -> Next {
        if let Some(opened_at) = self.opened_at.take()
            && opened_at.elapsed() >= STABLE_CONNECTION
        {
            self.backoff.reset();
        }
        if self.has_work() {
            Next::Backoff
        } else {
            Next::Idle
        }
    }

    async fn wait_backoff(&mut self) -> Next {
        let Some(delay) = self.backoff.next_delay() else {
            warn!(
                "giving up on {} after {} reconnect attempts",
                self.url,
                self.backoff.attempt()
            );
            // Dropping the reply senders tells waiting publishers the relay is gone.
            self.pending.clear();
            return Next::Idle;
        };

        self.set_state(ConnectionState::Backoff);
        debug!("reconnecting to {} in {:?}", self.url, delay);
        let wake = sleep(delay);
        tokio::pin!(wake);
        loop {
            tokio::select! {
                () = &mut wake => return Next::Connect,
                command = self.commands.recv() => match command {
                    None | Some(Command::Shutdown) => return Next::Shutdown,
                    Some(command) => {
                        self.apply(command, false);
                    }
                },
            }
        }
    }

    async fn idle(&mut self) -> Next {
        self.set_state(ConnectionState::Closed);
        loop {
            match self.commands.recv().await {
                None | Some(Command::Shutdown) => return Next::Shutdown,
                Some(command) => {
                    self.apply(command, false);
                    if self.has_work() {
                        self.backoff.reset();
                        return Next::Connect;
                    }
                }
            }
        }
    }
}

async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

async fn send_message(writer: &mut WsWriter, message: &ClientMessage) -> Result<()> {
    let text = message.to_json()?;
    writer
        .send(Message::Text(text))
        .await
        .map_err(|error| ClientError::WebSocket(error.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn actor() -> (RelayActor, mpsc::UnboundedReceiver<InboundEvent>) {
        let (_commands, command_rx) = mpsc::unbounded_channel();
        let (state_tx, _state) = watch::channel(ConnectionState::Connecting);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let actor = RelayActor::new(
            "wss://relay.example.com".to_string(),
            RelayConfig::default(),
            command_rx,
            state_tx,
            inbound_tx,
        );
        (actor, inbound_rx)
    }

    fn sample_event(id: &str) -> Event {
        Event {
            id: id.to_string(),
            pubkey: "pubkey".to_string(),
            created_at: 1,
            kind: 1,
            tags: vec![],
            content: "hello".to_string(),
            sig: "sig".to_string(),
        }
    }

    fn subscribe(id: &str) -> Command {
        Command::Subscribe {
            subscription_id: id.to_string(),
            filters: vec![Filter::new().kinds([1])],
        }
    }

    #[test]
    fn open_rejects_non_websocket_scheme() {
        let (inbound, _rx) = mpsc::unbounded_channel();
        let result = RelayConnection::open("https://relay.example.com", RelayConfig::default(), inbound);
        assert!(matches!(result, Err(ClientError::InvalidUrl(_))));
    }

    #[test]
    fn commands_while_disconnected_only_update_bookkeeping() {
        let (mut actor, _rx) = actor();
        assert!(actor.apply(subscribe("a"), false).is_none());
        assert!(actor.apply(subscribe("b"), false).is_none());
        assert!(actor.apply(Command::Unsubscribe("b".to_string()), false).is_none());
        assert_eq!(actor.outstanding.keys().collect::<Vec<_>>(), vec!["a"]);
        assert!(actor.has_work());
        assert!(matches!(actor.after_disconnect(), Next::Backoff));

        assert!(actor.apply(Command::Unsubscribe("a".to_string()), false).is_none());
        assert!(matches!(actor.after_disconnect(), Next::Idle));
    }

    #[test]
    fn close_is_only_sent_for_known_subscriptions() {
        let (mut actor, _rx) = actor();
        assert!(matches!(
            actor.apply(subscribe("a"), true),
            Some(ClientMessage::Req { subscription_id, .. }) if subscription_id == "a"
        ));
        assert!(matches!(
            actor.apply(Command::Unsubscribe("a".to_string()), true),
            Some(ClientMessage::Close(id)) if id == "a"
        ));
        assert!(actor.apply(Command::Unsubscribe("a".to_string()), true).is_none());
    }

    #[test]
    fn events_route_only_for_outstanding_subscriptions() -> Result<()> {
        let (mut actor, mut inbound) = actor();
        actor.apply(subscribe("live"), true);

        let live = serde_json::to_string(&serde_json::json!(["EVENT", "live", sample_event("e1")]))?;
        let stale = serde_json::to_string(&serde_json::json!(["EVENT", "gone", sample_event("e2")]))?;
        actor.handle_text(&stale);
        actor.handle_text(&live);
        actor.handle_text("not json");

        let received = inbound
            .try_recv()
            .map_err(|_| ClientError::Internal("expected an inbound event".to_string()))?;
        assert_eq!(received.relay_url, "wss://relay.example.com");
        assert_eq!(received.subscription_id, "live");
        assert_eq!(received.event.id, "e1");
        assert!(inbound.try_recv().is_err());
        Ok(())
    }

    #[test]
    fn relay_closed_drops_subscription_from_replay_list() {
        let (mut actor, _rx) = actor();
        actor.apply(subscribe("a"), true);
        actor.handle_text(r#"["CLOSED","a","error: shutting down"]"#);
        assert!(actor.outstanding.is_empty());
    }

    #[tokio::test]
    async fn ok_resolves_every_waiting_publisher() -> Result<()> {
        let (mut actor, _rx) = actor();
        let (first_tx, first_rx) = oneshot::channel();
        let (second_tx, second_rx) = oneshot::channel();
        actor.apply(
            Command::Publish {
                event: sample_event("e1"),
                reply: Some(first_tx),
            },
            false,
        );
        actor.apply(
            Command::Publish {
                event: sample_event("e1"),
                reply: Some(second_tx),
            },
            false,
        );
        assert_eq!(actor.pending.len(), 1);

        actor.handle_text(r#"["OK","e1",false,"blocked: spam"]"#);
        let expected = PublishAck {
            accepted: false,
            message: "blocked: spam".to_string(),
        };
        let first = first_rx
            .await
            .map_err(|_| ClientError::Internal("first reply dropped".to_string()))?;
        let second = second_rx
            .await
            .map_err(|_| ClientError::Internal("second reply dropped".to_string()))?;
        assert_eq!(first, expected);
        assert_eq!(second, expected);
        assert!(actor.pending.is_empty());
        Ok(())
    }

    #[test]
    fn abandoned_publishes_do_not_accumulate_on_an_open_socket() {
        let (mut actor, _rx) = actor();
        let mut waiting = None;
        for n in 0..1000 {
            let (reply, ack) = oneshot::channel();
            actor.apply(
                Command::Publish {
                    event: sample_event(&format!("e{n}")),
                    reply: Some(reply),
                },
                true,
            );
            // The publisher gave up waiting; the last one is still listening.
            if n == 999 {
                waiting = Some(ack);
            }
        }
        assert_eq!(actor.pending.len(), 1);
        assert!(actor.has_work());

        drop(waiting);
        assert!(!actor.has_work());
        assert!(actor.pending.is_empty());
    }

    #[test]
    fn fire_and_forget_publishes_are_kept_until_written() {
        let (mut actor, _rx) = actor();
        let queued = Command::Publish {
            event: sample_event("queued"),
            reply: None,
        };
        assert!(actor.apply(queued, false).is_none());
        assert!(actor.has_work());
        assert!(matches!(actor.after_disconnect(), Next::Backoff));

        let written = Command::Publish {
            event: sample_event("written"),
            reply: None,
        };
        assert!(matches!(
            actor.apply(written, true),
            Some(ClientMessage::Event(event)) if event.id == "written"
        ));
        // Pruned on the next pass; the queued one still waits for a socket.
        assert!(actor.has_work());
        assert!(!actor.pending.contains_key("written"));
        assert!(actor.pending.contains_key("queued"));
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_only_restarts_after_a_stable_connection() {
        let (mut actor, _rx) = actor();
        actor.apply(subscribe("a"), false);
        for _ in 0..3 {
            assert!(actor.backoff.next_delay().is_some());
        }

        // Accepted, then dropped straight away.
        actor.opened_at = Some(Instant::now());
        tokio::time::advance(Duration::from_millis(100)).await;
        assert!(matches!(actor.after_disconnect(), Next::Backoff));
        assert_eq!(actor.backoff.attempt(), 3);

        actor.opened_at = Some(Instant::now());
        tokio::time::advance(STABLE_CONNECTION).await;
        assert!(matches!(actor.after_disconnect(), Next::Backoff));
        assert_eq!(actor.backoff.attempt(), 0);
    }
}
