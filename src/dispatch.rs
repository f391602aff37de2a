//! Routes chat events to command handlers.
//!
//! Intake runs on a single task that owns the `Dispatcher`; every matching
//! message is handled on its own spawned task so a long polling wait never
//! blocks the next message. Each task is wrapped in a panic boundary that
//! logs and replies with the generic internal-error text.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use tokio::task::JoinHandle;

use crate::chat::{ChatSink, GatewayEvent, InboundMessage};
use crate::command::{self, ArgumentError, Command, Verb};
use crate::orchestrator::{ActionKind, ControlAction, ErrorKind, OperationOutcome, Orchestrator};
use crate::presenter;
use crate::registry::VmRegistry;

/// Everything a handler task needs. Shared read-only across tasks.
pub struct HandlerContext {
    registry: Arc<VmRegistry>,
    orchestrator: Orchestrator,
    sink: Arc<dyn ChatSink>,
}

pub struct Dispatcher {
    ctx: Arc<HandlerContext>,
    bot_user_id: Option<String>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<VmRegistry>,
        orchestrator: Orchestrator,
        sink: Arc<dyn ChatSink>,
    ) -> Self {
        Self {
            ctx: Arc::new(HandlerContext {
                registry,
                orchestrator,
                sink,
            }),
            bot_user_id: None,
        }
    }

    pub fn handle_event(&mut self, event: GatewayEvent) -> Option<JoinHandle<()>> {
        match event {
            GatewayEvent::Ready { user_id } => {
                tracing::info!(user_id = %user_id, "chat session ready");
                self.bot_user_id = Some(user_id);
                None
            }
            GatewayEvent::Message(msg) => self.on_message(msg),
        }
    }

    /// Spawn a handler for `msg`, or return `None` when it is ignored
    /// (own message or not a command).
    pub fn on_message(&self, msg: InboundMessage) -> Option<JoinHandle<()>> {
        if self.bot_user_id.as_deref() == Some(msg.author_id.as_str()) {
            return None;
        }

        let parsed = command::parse(&msg.content);
        if let Ok(Command {
            verb: Verb::Unrecognized,
            ..
        }) = parsed
        {
            return None;
        }

        let ctx = self.ctx.clone();
        Some(tokio::spawn(async move {
            let channel = msg.channel_id.clone();
            let handled = AssertUnwindSafe(ctx.handle(&msg, parsed))
                .catch_unwind()
                .await;
            if let Err(panic) = handled {
                tracing::error!(
                    channel = %channel,
                    content = %msg.content,
                    "command handler panicked: {}",
                    panic_message(&*panic)
                );
                ctx.reply(&channel, presenter::INTERNAL_ERROR).await;
            }
        }))
    }
}

impl HandlerContext {
    async fn handle(&self, msg: &InboundMessage, parsed: Result<Command, ArgumentError>) {
        let channel = &msg.channel_id;
        let command = match parsed {
            Ok(command) => command,
            Err(err) => {
                tracing::info!(
                    channel = %channel,
                    kind = ?ErrorKind::UserInput,
                    "rejected {} command: {err}",
                    err.verb
                );
                let outcome =
                    OperationOutcome::failed(ErrorKind::UserInput, presenter::argument_error(&err));
                self.reply(channel, presenter::outcome(&outcome)).await;
                return;
            }
        };

        match command.verb {
            Verb::Ping => {
                let latency = latency_ms(msg.timestamp, Utc::now());
                self.reply(channel, &presenter::pong(latency)).await;
            }
            Verb::Help => self.reply(channel, presenter::help()).await,
            Verb::Start | Verb::Stop | Verb::State => {
                if let Some(name) = command.argument.as_deref() {
                    self.control(channel, command.verb, name).await;
                }
            }
            Verb::Unrecognized => {}
        }
    }

    async fn control(&self, channel: &str, verb: Verb, name: &str) {
        let Some(kind) = ActionKind::for_verb(verb) else {
            return;
        };
        tracing::info!(vm = name, channel, "received {verb} command");

        let target = match self.registry.resolve(name) {
            Ok(entry) => entry.clone(),
            Err(err) => {
                tracing::info!(vm = name, kind = ?ErrorKind::UserInput, "{err}");
                let outcome = OperationOutcome::failed(
                    ErrorKind::UserInput,
                    presenter::registry_error(verb, &err),
                );
                self.reply(channel, presenter::outcome(&outcome)).await;
                return;
            }
        };

        self.reply(channel, &presenter::progress(verb, name)).await;
        let outcome = self
            .orchestrator
            .execute(&ControlAction { kind, target })
            .await;
        self.reply(channel, presenter::outcome(&outcome)).await;
    }

    /// Send a reply. Delivery failures are logged only.
    async fn reply(&self, channel: &str, text: &str) {
        if let Err(err) = self.sink.send(channel, text).await {
            tracing::error!(kind = ?ErrorKind::Delivery, "{err}");
        }
    }
}

fn latency_ms(sent: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Option<i64> {
    sent.map(|t| (now - t).num_milliseconds().max(0))
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}
