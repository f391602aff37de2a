//! Discord gateway session and REST sender.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use super::{ChatSink, DeliveryError, GatewayEvent, InboundMessage};
use crate::error::BotError;

pub const API_BASE: &str = "https://discord.com/api/v10";
pub const GATEWAY_URL: &str = "wss://gateway.discord.gg/?v=10&encoding=json";
const USER_AGENT: &str = concat!("DiscordBot (azure-bot, ", env!("CARGO_PKG_VERSION"), ")");

/// Discord rejects longer message bodies.
const MAX_MESSAGE_CHARS: usize = 2000;

/// Longest 429 wait honoured before a reply is dropped.
const MAX_RATE_LIMIT_WAIT: Duration = Duration::from_secs(10);

const INITIAL_BACKOFF: Duration = Duration::from_secs(2);
const MAX_BACKOFF: Duration = Duration::from_secs(60);
/// Sessions that lived this long reset the reconnect backoff.
const STABLE_SESSION: Duration = Duration::from_secs(300);

// ── Protocol ────────────────────────────────────────────────────────

mod op {
    pub const DISPATCH: u8 = 0;
    pub const HEARTBEAT: u8 = 1;
    pub const IDENTIFY: u8 = 2;
    pub const RECONNECT: u8 = 7;
    pub const INVALID_SESSION: u8 = 9;
    pub const HELLO: u8 = 10;
    pub const HEARTBEAT_ACK: u8 = 11;
}

mod intent {
    pub const GUILDS: u64 = 1 << 0;
    pub const GUILD_MEMBERS: u64 = 1 << 1;
    pub const GUILD_MESSAGES: u64 = 1 << 9;
    pub const DIRECT_MESSAGES: u64 = 1 << 12;
    pub const MESSAGE_CONTENT: u64 = 1 << 15;
}

pub const INTENTS: u64 = intent::GUILDS
    | intent::GUILD_MEMBERS
    | intent::GUILD_MESSAGES
    | intent::DIRECT_MESSAGES
    | intent::MESSAGE_CONTENT;

/// Envelope fields shared by every gateway frame; `d` is decoded per kind.
#[derive(Debug, Default, facet::Facet)]
#[facet(default)]
struct FrameHeader {
    #[facet(default)]
    op: u8,
    #[facet(default)]
    s: Option<u64>,
    #[facet(default)]
    t: Option<String>,
}

#[derive(Debug, Default, facet::Facet)]
#[facet(default)]
struct HelloFrame {
    #[facet(default)]
    d: Hello,
}

#[derive(Debug, Default, facet::Facet)]
#[facet(default)]
struct Hello {
    #[facet(default)]
    heartbeat_interval: u64,
}

#[derive(Debug, Default, facet::Facet)]
#[facet(default)]
struct User {
    #[facet(default)]
    id: String,
}

#[derive(Debug, facet::Facet)]
struct ReadyFrame {
    d: Ready,
}

#[derive(Debug, facet::Facet)]
struct Ready {
    user: User,
}

#[derive(Debug, facet::Facet)]
struct MessageFrame {
    d: MessageCreate,
}

#[derive(Debug, facet::Facet)]
struct MessageCreate {
    #[facet(default)]
    content: String,
    channel_id: String,
    author: User,
    #[facet(default)]
    timestamp: Option<String>,
}

#[derive(Debug, facet::Facet)]
struct IdentifyFrame {
    op: u8,
    d: Identify,
}

#[derive(Debug, facet::Facet)]
struct Identify {
    token: String,
    intents: u64,
    properties: ConnectionProperties,
}

#[derive(Debug, facet::Facet)]
struct ConnectionProperties {
    os: String,
    browser: String,
    device: String,
}

#[derive(Debug, facet::Facet)]
struct HeartbeatFrame {
    op: u8,
    d: Option<u64>,
}

#[derive(Debug, facet::Facet)]
struct CreateMessage {
    content: String,
}

/// Body of a 429 from the REST API.
#[derive(Debug, Default, facet::Facet)]
#[facet(default)]
struct RateLimited {
    #[facet(default)]
    retry_after: f64,
}

/// What the session loop should do with one decoded frame.
#[derive(Debug, PartialEq)]
enum FrameAction {
    Event(GatewayEvent),
    HeartbeatNow,
    Acknowledged,
    Ignore,
}

/// `raw` is the full frame text; dispatch payloads are decoded from it
/// according to `header.t`.
fn interpret(header: &FrameHeader, raw: &str) -> Result<FrameAction, String> {
    match header.op {
        op::DISPATCH => Ok(dispatch(header.t.as_deref(), raw)),
        op::HEARTBEAT => Ok(FrameAction::HeartbeatNow),
        op::HEARTBEAT_ACK => Ok(FrameAction::Acknowledged),
        op::RECONNECT => Err("gateway requested reconnect".into()),
        op::INVALID_SESSION => Err("gateway invalidated the session".into()),
        _ => Ok(FrameAction::Ignore),
    }
}

fn dispatch(kind: Option<&str>, raw: &str) -> FrameAction {
    let decoded = match kind {
        Some("READY") => facet_json::from_str::<ReadyFrame>(raw)
            .map(|f| GatewayEvent::Ready { user_id: f.d.user.id })
            .map_err(|e| e.to_string()),
        Some("MESSAGE_CREATE") => facet_json::from_str::<MessageFrame>(raw)
            .map(|f| {
                GatewayEvent::Message(InboundMessage {
                    content: f.d.content,
                    channel_id: f.d.channel_id,
                    author_id: f.d.author.id,
                    timestamp: f.d.timestamp.as_deref().and_then(parse_timestamp),
                })
            })
            .map_err(|e| e.to_string()),
        _ => return FrameAction::Ignore,
    };
    match decoded {
        Ok(event) => FrameAction::Event(event),
        Err(e) => {
            tracing::warn!(event = kind.unwrap_or_default(), "skipping malformed dispatch: {e}");
            FrameAction::Ignore
        }
    }
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

fn identify_frame(token: &str) -> Result<Message, BotError> {
    let frame = IdentifyFrame {
        op: op::IDENTIFY,
        d: Identify {
            token: token.to_string(),
            intents: INTENTS,
            properties: ConnectionProperties {
                os: std::env::consts::OS.to_string(),
                browser: "azure-bot".into(),
                device: "azure-bot".into(),
            },
        },
    };
    facet_json::to_string(&frame)
        .map(Message::Text)
        .map_err(gateway_error)
}

fn heartbeat_frame(seq: Option<u64>) -> Result<Message, BotError> {
    facet_json::to_string(&HeartbeatFrame {
        op: op::HEARTBEAT,
        d: seq,
    })
    .map(Message::Text)
    .map_err(gateway_error)
}

fn gateway_error(message: impl std::fmt::Display) -> BotError {
    BotError::Gateway {
        message: message.to_string(),
    }
}

// ── Gateway session ─────────────────────────────────────────────────

pub struct DiscordGateway {
    token: String,
    url: String,
}

impl DiscordGateway {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            url: GATEWAY_URL.to_string(),
        }
    }

    /// Run one gateway session, forwarding events into `tx`.
    ///
    /// Returns `Ok(())` only when the receiver is gone; every other exit is
    /// an error so the supervisor reconnects.
    pub async fn run_session(&self, tx: &mpsc::Sender<GatewayEvent>) -> Result<(), BotError> {
        let (ws, _) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(gateway_error)?;
        let (mut sink, mut stream) = ws.split();

        let hello = match stream.next().await {
            Some(Ok(Message::Text(text))) => facet_json::from_str::<FrameHeader>(&text)
                .ok()
                .filter(|h| h.op == op::HELLO)
                .and_then(|_| facet_json::from_str::<HelloFrame>(&text).ok())
                .filter(|f| f.d.heartbeat_interval > 0)
                .map(|f| f.d)
                .ok_or_else(|| gateway_error("expected HELLO as first frame"))?,
            Some(Ok(other)) => return Err(gateway_error(format!("unexpected first frame: {other:?}"))),
            Some(Err(e)) => return Err(gateway_error(e)),
            None => return Err(gateway_error("connection closed before HELLO")),
        };

        sink.send(identify_frame(&self.token)?)
            .await
            .map_err(gateway_error)?;
        tracing::debug!(heartbeat_ms = hello.heartbeat_interval, "identified with gateway");

        let mut heartbeat = tokio::time::interval(Duration::from_millis(hello.heartbeat_interval));
        heartbeat.tick().await;
        let mut seq: Option<u64> = None;
        let mut acked = true;

        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    if !acked {
                        return Err(gateway_error("heartbeat was not acknowledged"));
                    }
                    acked = false;
                    sink.send(heartbeat_frame(seq)?).await.map_err(gateway_error)?;
                }
                incoming = stream.next() => {
                    let message = match incoming {
                        Some(Ok(m)) => m,
                        Some(Err(e)) => return Err(gateway_error(e)),
                        None => return Err(gateway_error("connection closed")),
                    };
                    let text = match message {
                        Message::Text(text) => text,
                        Message::Close(frame) => {
                            return Err(gateway_error(format!("connection closed: {frame:?}")));
                        }
                        _ => continue,
                    };
                    let header: FrameHeader = match facet_json::from_str(&text) {
                        Ok(h) => h,
                        Err(e) => {
                            tracing::warn!("skipping undecodable gateway frame: {e}");
                            continue;
                        }
                    };
                    if let Some(s) = header.s {
                        seq = Some(s);
                    }
                    match interpret(&header, &text).map_err(gateway_error)? {
                        FrameAction::Event(event) => {
                            if tx.send(event).await.is_err() {
                                return Ok(());
                            }
                        }
                        FrameAction::HeartbeatNow => {
                            sink.send(heartbeat_frame(seq)?).await.map_err(gateway_error)?;
                        }
                        FrameAction::Acknowledged => acked = true,
                        FrameAction::Ignore => {}
                    }
                }
            }
        }
    }
}

/// Keep a gateway session alive, reconnecting with exponential backoff.
pub fn spawn_supervised(gateway: DiscordGateway, tx: mpsc::Sender<GatewayEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut backoff = INITIAL_BACKOFF;
        loop {
            let started = Instant::now();
            let result = gateway.run_session(&tx).await;

            if tx.is_closed() {
                break;
            }

            match result {
                Ok(()) => tracing::warn!("gateway session ended; reconnecting"),
                Err(e) => tracing::error!("gateway session failed: {e}; reconnecting"),
            }

            if started.elapsed() >= STABLE_SESSION {
                backoff = INITIAL_BACKOFF;
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    })
}

// ── REST sender ─────────────────────────────────────────────────────

pub struct DiscordSink {
    http: reqwest::Client,
    token: String,
    api_base: String,
}

impl DiscordSink {
    pub fn new(http: reqwest::Client, token: impl Into<String>) -> Self {
        Self {
            http,
            token: token.into(),
            api_base: API_BASE.to_string(),
        }
    }
}

#[async_trait]
impl ChatSink for DiscordSink {
    async fn send(&self, channel_id: &str, text: &str) -> Result<(), DeliveryError> {
        let failed = |reason: String| DeliveryError {
            channel_id: channel_id.to_string(),
            reason,
        };

        let url = format!(
            "{}/channels/{}/messages",
            self.api_base,
            urlencoding::encode(channel_id)
        );
        let body = facet_json::to_string(&CreateMessage {
            content: truncate(text, MAX_MESSAGE_CHARS).to_string(),
        })
        .map_err(|e| failed(e.to_string()))?;

        let mut rate_limited = false;
        loop {
            let resp = self
                .http
                .post(&url)
                .header(reqwest::header::AUTHORIZATION, format!("Bot {}", self.token))
                .header(reqwest::header::USER_AGENT, USER_AGENT)
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(body.clone())
                .send()
                .await
                .map_err(|e| failed(e.to_string()))?;

            let status = resp.status();
            if status.is_success() {
                return Ok(());
            }
            if status != reqwest::StatusCode::TOO_MANY_REQUESTS || rate_limited {
                return Err(failed(format!("discord returned {status}")));
            }

            // One retry after the advertised wait.
            rate_limited = true;
            let wait = rate_limit_wait(&resp.text().await.unwrap_or_default());
            tracing::debug!(channel = channel_id, wait_ms = wait.as_millis() as u64, "rate limited");
            tokio::time::sleep(wait).await;
        }
    }
}

/// `retry_after` (seconds, fractional) from a 429 body, capped.
fn rate_limit_wait(body: &str) -> Duration {
    let secs = facet_json::from_str::<RateLimited>(body)
        .map(|r| r.retry_after)
        .unwrap_or(1.0);
    if secs.is_finite() && secs > 0.0 {
        Duration::from_secs_f64(secs).min(MAX_RATE_LIMIT_WAIT)
    } else {
        Duration::ZERO
    }
}

fn truncate(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
