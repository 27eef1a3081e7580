//! Shared fixtures: an in-memory transport and a scripted WebSocket relay.

#![allow(dead_code)]

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use nostr::{Event, EventTemplate, Filter, Keys, matches_any};
use nostr_mux::{PublishOutcome, PublishReport, RelayTransport, Result};
use serde_json::{Value, json};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::{accept_async, tungstenite::Message};

pub const WAIT: Duration = Duration::from_secs(5);

pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub fn note(keys: &Keys, content: &str) -> Event {
    keys.sign_template(&EventTemplate {
        created_at: 1_700_000_000,
        kind: 1,
        tags: vec![],
        content: content.to_string(),
    })
    .unwrap()
}

/// Transport that records every call and answers publishes with a fixed outcome.
pub struct MockTransport {
    relays: Vec<String>,
    outcome: PublishOutcome,
    feed: Option<mpsc::UnboundedSender<Event>>,
    pub subscribes: Mutex<Vec<(String, Vec<Filter>)>>,
    pub unsubscribes: Mutex<Vec<String>>,
    pub published: Mutex<Vec<Event>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            relays: vec![
                "wss://relay.one.example".to_string(),
                "wss://relay.two.example".to_string(),
            ],
            outcome: PublishOutcome::Accepted,
            feed: None,
            subscribes: Mutex::new(Vec::new()),
            unsubscribes: Mutex::new(Vec::new()),
            published: Mutex::new(Vec::new()),
        }
    }

    /// Every relay refuses every publish with `reason`.
    pub fn rejecting(reason: &str) -> Self {
        Self {
            outcome: PublishOutcome::Rejected(reason.to_string()),
            ..Self::new()
        }
    }

    /// Copies of published events are also sent to the returned receiver.
    pub fn with_feed(self) -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                feed: Some(tx),
                ..self
            },
            rx,
        )
    }

    pub fn relays(&self) -> &[String] {
        &self.relays
    }

    pub fn subscribe_count(&self) -> usize {
        lock(&self.subscribes).len()
    }

    pub fn unsubscribed(&self) -> Vec<String> {
        lock(&self.unsubscribes).clone()
    }

    /// Latest still-open subscription whose filters match `event`.
    pub fn subscription_matching(&self, event: &Event) -> Option<String> {
        let closed = self.unsubscribed();
        lock(&self.subscribes)
            .iter()
            .rev()
            .find(|(id, filters)| !closed.contains(id) && matches_any(filters, event))
            .map(|(id, _)| id.clone())
    }
}

#[async_trait]
impl RelayTransport for MockTransport {
    async fn relay_urls(&self) -> Vec<String> {
        self.relays.clone()
    }

    async fn subscribe(&self, _: &[String], subscription_id: &str, filters: &[Filter]) -> Result<()> {
        lock(&self.subscribes).push((subscription_id.to_string(), filters.to_vec()));
        Ok(())
    }

    async fn unsubscribe(&self, subscription_id: &str) -> Result<()> {
        lock(&self.unsubscribes).push(subscription_id.to_string());
        Ok(())
    }

    async fn publish(&self, relays: &[String], event: &Event) -> Result<PublishReport> {
        lock(&self.published).push(event.clone());
        if let Some(feed) = &self.feed {
            let _ = feed.send(event.clone());
        }
        let mut report = PublishReport::new(event.id.clone());
        for relay in relays {
            report.outcomes.insert(relay.clone(), self.outcome.clone());
        }
        Ok(report)
    }
}

enum Control {
    Send(String),
    Disconnect,
}

/// Single-connection WebSocket relay on localhost.
///
/// Every text frame from the client is surfaced through [`MockRelay::next_frame`];
/// `EVENT` frames are answered with `OK` automatically.
pub struct MockRelay {
    pub url: String,
    frames: mpsc::UnboundedReceiver<Value>,
    control: mpsc::UnboundedSender<Control>,
    connections: Arc<AtomicUsize>,
}

impl MockRelay {
    pub async fn start() -> Self {
        Self::start_with_ack(true, "").await
    }

    pub async fn start_with_ack(accept: bool, message: &'static str) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let (frame_tx, frames) = mpsc::unbounded_channel();
        let (control, mut control_rx) = mpsc::unbounded_channel();
        let connections = Arc::new(AtomicUsize::new(0));
        let accepted = Arc::clone(&connections);

        tokio::spawn(async move {
            loop {
                let Ok((tcp, _)) = listener.accept().await else {
                    return;
                };
                let Ok(socket) = accept_async(tcp).await else {
                    continue;
                };
                accepted.fetch_add(1, Ordering::SeqCst);
                let (mut writer, mut reader) = socket.split();
                loop {
                    tokio::select! {
                        frame = reader.next() => match frame {
                            Some(Ok(Message::Text(text))) => {
                                let Ok(value) = serde_json::from_str::<Value>(&text) else {
                                    continue;
                                };
                                if value[0] == "EVENT" {
                                    let ok = json!(["OK", value[1]["id"], accept, message]);
                                    let _ = writer.send(Message::Text(ok.to_string())).await;
                                }
                                let _ = frame_tx.send(value);
                            }
                            Some(Ok(_)) => {}
                            Some(Err(_)) | None => break,
                        },
                        control = control_rx.recv() => match control {
                            Some(Control::Send(text)) => {
                                let _ = writer.send(Message::Text(text)).await;
                            }
                            Some(Control::Disconnect) => {
                                let _ = writer.send(Message::Close(None)).await;
                                break;
                            }
                            None => return,
                        },
                    }
                }
            }
        });

        Self {
            url,
            frames,
            control,
            connections,
        }
    }

    /// Next frame the client sent, failing the test after [`WAIT`].
    pub async fn next_frame(&mut self) -> Value {
        tokio::time::timeout(WAIT, self.frames.recv())
            .await
            .unwrap()
            .unwrap()
    }

    /// Next frame whose first element is `verb`, skipping others.
    pub async fn next_verb(&mut self, verb: &str) -> Value {
        loop {
            let frame = self.next_frame().await;
            if frame[0] == verb {
                return frame;
            }
        }
    }

    pub fn send_event(&self, subscription_id: &str, event: &Event) {
        let frame = json!(["EVENT", subscription_id, event]);
        self.control.send(Control::Send(frame.to_string())).unwrap();
    }

    pub fn send_raw(&self, text: &str) {
        self.control.send(Control::Send(text.to_string())).unwrap();
    }

    pub fn disconnect(&self) {
        self.control.send(Control::Disconnect).unwrap();
    }

    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}
