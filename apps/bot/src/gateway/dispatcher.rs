//! Inbound frame dispatch: replies, heartbeats, the connect handshake and
//! the event chain (filter, commands, subscribers, fanout).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::time::Instant;

use crate::commands::CommandRouter;
use crate::models::{ApiResponse, Event, MessageEvent};
use crate::service::ServiceRegistry;

use super::correlator::{BotApi, RequestCorrelator};
use super::events::{classify, FrameKind};
use super::fanout::EventFanout;
use super::registry::ConnectionRegistry;
use super::session::ConnectionRecord;

/// Delay before the one retry of a failed handshake probe.
pub const HANDSHAKE_RETRY_DELAY: Duration = Duration::from_secs(3);

/// Whether an event continues down the chain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Propagation {
    #[default]
    Continue,
    Stop,
}

/// One typed event plus where it came from.
pub struct EventContext {
    pub service_id: String,
    pub connection_id: String,
    pub event: Event,
    /// Calls back on the connection the event arrived on.
    pub bot: BotApi,
    pub received_at: DateTime<Utc>,
    matched: Mutex<Option<String>>,
}

impl EventContext {
    pub fn new(service_id: impl Into<String>, connection_id: impl Into<String>, event: Event, bot: BotApi) -> Self {
        Self {
            service_id: service_id.into(),
            connection_id: connection_id.into(),
            event,
            bot,
            received_at: Utc::now(),
            matched: Mutex::new(None),
        }
    }

    pub fn message(&self) -> Option<&MessageEvent> {
        self.event.as_message()
    }

    /// The command pattern that matched this event, if any.
    pub fn matched_expression(&self) -> Option<String> {
        self.matched.lock().clone()
    }

    pub(crate) fn set_matched(&self, expression: &str) {
        *self.matched.lock() = Some(expression.to_string());
    }
}

/// Generic event handler, run after the command router.
#[async_trait]
pub trait EventSubscriber: Send + Sync {
    async fn on_event(&self, _event: &EventContext) -> Propagation {
        Propagation::Continue
    }

    /// Called once a connection finished its handshake.
    async fn on_connect(&self, _connection: &ConnectionRecord) {}
}

pub struct EventDispatcher {
    registry: Arc<ConnectionRegistry>,
    services: Arc<ServiceRegistry>,
    correlator: Arc<RequestCorrelator>,
    router: Arc<CommandRouter>,
    subscribers: Vec<Arc<dyn EventSubscriber>>,
    fanout: EventFanout,
    handshake_retry_delay: Duration,
}

impl EventDispatcher {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        services: Arc<ServiceRegistry>,
        correlator: Arc<RequestCorrelator>,
        router: Arc<CommandRouter>,
        fanout: EventFanout,
    ) -> Self {
        Self {
            registry,
            services,
            correlator,
            router,
            subscribers: Vec::new(),
            fanout,
            handshake_retry_delay: HANDSHAKE_RETRY_DELAY,
        }
    }

    /// Subscribers run in the order they were added.
    pub fn subscribe(mut self, subscriber: Arc<dyn EventSubscriber>) -> Self {
        self.subscribers.push(subscriber);
        self
    }

    pub fn with_handshake_retry_delay(mut self, delay: Duration) -> Self {
        self.handshake_retry_delay = delay;
        self
    }

    /// Entry point for a transport's read loop.
    ///
    /// Replies and heartbeats are applied inline so they keep arrival order;
    /// everything else runs on its own task.
    pub fn ingest(self: &Arc<Self>, connection_id: &str, text: &str) {
        let frame: Value = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(%connection_id, error = %e, "dropping malformed frame");
                return;
            }
        };
        match classify(&frame) {
            FrameKind::Reply(echo) => {
                self.correlator.resolve(&echo, frame);
            }
            FrameKind::Heartbeat => self.heartbeat(connection_id),
            _ => {
                let this = self.clone();
                let connection_id = connection_id.to_string();
                tokio::spawn(async move { this.adapter(frame, &connection_id).await });
            }
        }
    }

    /// Classify and fully handle one frame.
    pub async fn adapter(&self, frame: Value, connection_id: &str) {
        match classify(&frame) {
            FrameKind::Reply(echo) => {
                self.correlator.resolve(&echo, frame);
            }
            FrameKind::Heartbeat => self.heartbeat(connection_id),
            FrameKind::Lifecycle => {
                if frame.get("sub_type").and_then(Value::as_str) == Some("disable") {
                    tracing::info!(%connection_id, "remote side disabled");
                } else {
                    self.handshake(connection_id).await;
                }
            }
            FrameKind::OtherMeta(kind) => {
                tracing::debug!(%connection_id, meta_event_type = %kind, "ignoring meta event");
            }
            FrameKind::Message | FrameKind::MessageSent | FrameKind::Notice | FrameKind::Request => {
                self.dispatch_event(frame, connection_id).await;
            }
            FrameKind::Unknown => {
                tracing::warn!(%connection_id, "dropping unrecognized frame");
            }
        }
    }

    fn heartbeat(&self, connection_id: &str) {
        if !self.registry.update_heartbeat(connection_id, Instant::now()) {
            tracing::debug!(%connection_id, "heartbeat for unknown connection");
        }
    }

    /// Learn the login id of a fresh connection, retrying the probe once.
    async fn handshake(&self, connection_id: &str) {
        let Some(record) = self.registry.lookup(connection_id) else {
            tracing::warn!(%connection_id, "lifecycle event for unknown connection");
            return;
        };
        let bot = BotApi::new(self.correlator.clone(), connection_id);

        let first = bot.get_login_info().await;
        let login_id = match probe_login_id(&first) {
            Some(id) => id,
            None => {
                tracing::debug!(%connection_id, status = ?first.status, "login probe failed, retrying");
                tokio::time::sleep(self.handshake_retry_delay).await;
                let second = bot.get_login_info().await;
                match probe_login_id(&second) {
                    Some(id) => id,
                    None => {
                        tracing::warn!(
                            %connection_id,
                            service_id = %record.service_id,
                            status = ?second.status,
                            "handshake failed, closing connection"
                        );
                        self.registry.close(connection_id);
                        self.correlator.abandon_connection(connection_id);
                        return;
                    }
                }
            }
        };

        self.registry.update_login_id(connection_id, login_id);
        tracing::info!(
            %connection_id,
            service_id = %record.service_id,
            login_id,
            "connection ready"
        );
        for subscriber in &self.subscribers {
            subscriber.on_connect(&record).await;
        }
    }

    async fn dispatch_event(&self, frame: Value, connection_id: &str) {
        let Some(record) = self.registry.lookup(connection_id) else {
            tracing::debug!(%connection_id, "event for unknown connection");
            return;
        };
        let Some(service) = self.services.get(&record.service_id) else {
            tracing::warn!(%connection_id, service_id = %record.service_id, "event for unknown service");
            return;
        };
        if service.is_disposed() {
            return;
        }

        let event = match Event::from_value(frame) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(%connection_id, error = %e, "dropping malformed event");
                return;
            }
        };
        if let Some(sender) = event.sender_id().filter(|id| service.is_blocked(*id)) {
            tracing::debug!(%connection_id, user_id = sender, "dropping event from blocked user");
            return;
        }

        let ctx = Arc::new(EventContext::new(
            record.service_id.clone(),
            connection_id,
            event,
            BotApi::new(self.correlator.clone(), connection_id),
        ));

        if let Some(message) = ctx.message().filter(|m| !m.is_self_sent()) {
            if service.flags.auto_mark_read {
                let bot = ctx.bot.clone();
                let message_id = message.message_id;
                tokio::spawn(async move {
                    let resp = bot.mark_msg_as_read(message_id).await;
                    if !resp.is_success() {
                        tracing::debug!(message_id, status = ?resp.status, "mark_msg_as_read failed");
                    }
                });
            }
            if service.flags.command_routing {
                let outcome = self.router.route(&ctx, message, &service).await;
                if !outcome.continues() {
                    return;
                }
            }
        }

        for subscriber in &self.subscribers {
            if subscriber.on_event(&ctx).await == Propagation::Stop {
                return;
            }
        }
        self.fanout.publish(ctx);
    }
}

fn probe_login_id(resp: &ApiResponse) -> Option<i64> {
    if !resp.is_success() {
        return None;
    }
    match resp.data.get("user_id")? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::{CommandContext, CommandDescriptor};
    use crate::gateway::session::{ConnectionMode, Outbound, SocketHandle};
    use crate::service::{ServiceFlags, ServiceRecord};
    use serde_json::json;
    use std::collections::HashSet;
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<i64>>,
        connects: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl EventSubscriber for Recorder {
        async fn on_event(&self, event: &EventContext) -> Propagation {
            self.events.lock().push(event.event.sender_id().unwrap_or_default());
            Propagation::Continue
        }

        async fn on_connect(&self, connection: &ConnectionRecord) {
            self.connects.lock().push(connection.connection_id.clone());
        }
    }

    struct Harness {
        dispatcher: Arc<EventDispatcher>,
        registry: Arc<ConnectionRegistry>,
        correlator: Arc<RequestCorrelator>,
        recorder: Arc<Recorder>,
        commands: Arc<Mutex<Vec<String>>>,
        fanout: EventFanout,
        rx: mpsc::Receiver<Outbound>,
    }

    fn harness(flags: ServiceFlags, api_timeout: Duration) -> Harness {
        let registry = Arc::new(ConnectionRegistry::new());
        let services = Arc::new(ServiceRegistry::new());
        services.insert(ServiceRecord::new("svc", HashSet::new(), HashSet::from([666]), flags));
        let (socket, rx) = SocketHandle::channel();
        registry
            .register(ConnectionRecord::new("svc", "c1", socket, api_timeout, ConnectionMode::Server))
            .unwrap();
        let correlator = Arc::new(RequestCorrelator::new(registry.clone()));

        let commands = Arc::new(Mutex::new(Vec::new()));
        let sink = commands.clone();
        let router = CommandRouter::builder()
            .register(
                CommandDescriptor::builder("stop")
                    .pattern(r"^/stop (\w+)$")
                    .handler(move |ctx: CommandContext| {
                        let sink = sink.clone();
                        async move {
                            sink.lock().push(ctx.capture(1).unwrap_or_default().to_string());
                            Propagation::Stop
                        }
                    })
                    .build()
                    .unwrap(),
            )
            .build();

        let recorder = Arc::new(Recorder::default());
        let fanout = EventFanout::new();
        let dispatcher = EventDispatcher::new(
            registry.clone(),
            services,
            correlator.clone(),
            Arc::new(router),
            fanout.clone(),
        )
        .subscribe(recorder.clone())
        .with_handshake_retry_delay(Duration::from_secs(1));

        Harness {
            dispatcher: Arc::new(dispatcher),
            registry,
            correlator,
            recorder,
            commands,
            fanout,
            rx,
        }
    }

    fn group_message(user_id: i64, text: &str) -> Value {
        json!({
            "post_type": "message",
            "message_type": "group",
            "message_id": 900,
            "group_id": 555,
            "user_id": user_id,
            "raw_message": text,
            "sender": {"user_id": user_id, "role": "member"}
        })
    }

    async fn next_call(rx: &mut mpsc::Receiver<Outbound>) -> Value {
        match rx.recv().await {
            Some(Outbound::Text(text)) => serde_json::from_str(&text).unwrap(),
            other => panic!("expected a text frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn command_stops_the_chain() {
        let h = harness(ServiceFlags::default(), Duration::from_secs(5));
        let mut published = h.fanout.subscribe();
        h.dispatcher.adapter(group_message(42, "/stop now"), "c1").await;

        assert_eq!(*h.commands.lock(), vec!["now".to_string()]);
        assert!(h.recorder.events.lock().is_empty());
        assert!(published.try_recv().is_err());
    }

    #[tokio::test]
    async fn unmatched_message_reaches_subscribers_and_fanout() {
        let h = harness(ServiceFlags::default(), Duration::from_secs(5));
        let mut published = h.fanout.subscribe();
        h.dispatcher.adapter(group_message(42, "hello"), "c1").await;

        assert!(h.commands.lock().is_empty());
        assert_eq!(*h.recorder.events.lock(), vec![42]);
        let ctx = published.try_recv().unwrap();
        assert_eq!(ctx.connection_id, "c1");
        assert_eq!(ctx.message().unwrap().raw_message, "hello");
    }

    #[tokio::test]
    async fn blocked_user_is_dropped() {
        let h = harness(ServiceFlags::default(), Duration::from_secs(5));
        h.dispatcher.adapter(group_message(666, "/stop now"), "c1").await;
        h.dispatcher.adapter(group_message(666, "hello"), "c1").await;
        assert!(h.commands.lock().is_empty());
        assert!(h.recorder.events.lock().is_empty());
    }

    #[tokio::test]
    async fn routing_can_be_disabled() {
        let flags = ServiceFlags {
            command_routing: false,
            ..Default::default()
        };
        let h = harness(flags, Duration::from_secs(5));
        h.dispatcher.adapter(group_message(42, "/stop now"), "c1").await;
        assert!(h.commands.lock().is_empty());
        assert_eq!(*h.recorder.events.lock(), vec![42]);
    }

    #[tokio::test]
    async fn self_sent_messages_skip_the_router() {
        let h = harness(ServiceFlags::default(), Duration::from_secs(5));
        let mut frame = group_message(42, "/stop now");
        frame["post_type"] = json!("message_sent");
        h.dispatcher.adapter(frame, "c1").await;
        assert!(h.commands.lock().is_empty());
        assert_eq!(*h.recorder.events.lock(), vec![42]);
    }

    #[tokio::test]
    async fn auto_mark_read_acknowledges_message() {
        let flags = ServiceFlags {
            auto_mark_read: true,
            ..Default::default()
        };
        let mut h = harness(flags, Duration::from_millis(50));
        h.dispatcher.adapter(group_message(42, "hello"), "c1").await;
        let call = next_call(&mut h.rx).await;
        assert_eq!(call["action"], "mark_msg_as_read");
        assert_eq!(call["params"], json!({"message_id": 900}));
    }

    #[tokio::test]
    async fn notices_and_requests_reach_subscribers() {
        let h = harness(ServiceFlags::default(), Duration::from_secs(5));
        h.dispatcher
            .adapter(json!({"post_type": "notice", "notice_type": "group_increase", "user_id": 7}), "c1")
            .await;
        h.dispatcher
            .adapter(json!({"post_type": "request", "request_type": "friend", "user_id": 8, "flag": "x"}), "c1")
            .await;
        assert_eq!(*h.recorder.events.lock(), vec![7, 8]);
    }

    #[tokio::test]
    async fn handshake_records_login_id_and_notifies() {
        let mut h = harness(ServiceFlags::default(), Duration::from_secs(5));
        let dispatcher = h.dispatcher.clone();
        let lifecycle = tokio::spawn(async move {
            dispatcher
                .adapter(
                    json!({"post_type": "meta_event", "meta_event_type": "lifecycle", "sub_type": "connect"}),
                    "c1",
                )
                .await
        });

        let probe = next_call(&mut h.rx).await;
        assert_eq!(probe["action"], "get_login_info");
        let echo = probe["echo"].as_str().unwrap().to_string();
        h.dispatcher.ingest(
            "c1",
            &json!({"retcode": 0, "status": "ok", "data": {"user_id": 10001, "nickname": "bot"}, "echo": echo})
                .to_string(),
        );
        lifecycle.await.unwrap();

        assert_eq!(h.registry.lookup("c1").unwrap().login_id(), Some(10001));
        assert_eq!(*h.recorder.connects.lock(), vec!["c1".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn handshake_retries_once_then_closes() {
        let mut h = harness(ServiceFlags::default(), Duration::from_secs(2));
        let dispatcher = h.dispatcher.clone();
        let lifecycle = tokio::spawn(async move {
            dispatcher
                .adapter(json!({"post_type": "meta_event", "meta_event_type": "lifecycle"}), "c1")
                .await
        });

        assert_eq!(next_call(&mut h.rx).await["action"], "get_login_info");
        assert_eq!(next_call(&mut h.rx).await["action"], "get_login_info");
        lifecycle.await.unwrap();

        assert!(h.registry.lookup("c1").is_none());
        assert!(matches!(h.rx.recv().await, Some(Outbound::Close(_))));
        assert!(h.recorder.connects.lock().is_empty());
        assert_eq!(h.correlator.pending_len(), 0);
    }

    #[tokio::test]
    async fn heartbeat_frame_updates_registry() {
        let h = harness(ServiceFlags::default(), Duration::from_secs(5));
        let before = h.registry.lookup("c1").unwrap().last_heartbeat();
        tokio::time::sleep(Duration::from_millis(5)).await;
        h.dispatcher.ingest(
            "c1",
            r#"{"post_type":"meta_event","meta_event_type":"heartbeat","interval":5000}"#,
        );
        assert!(h.registry.lookup("c1").unwrap().last_heartbeat() > before);
    }

    #[tokio::test]
    async fn malformed_and_unknown_frames_are_dropped() {
        let h = harness(ServiceFlags::default(), Duration::from_secs(5));
        h.dispatcher.ingest("c1", "not json");
        h.dispatcher.adapter(json!({"post_type": "mystery"}), "c1").await;
        h.dispatcher.adapter(json!({"post_type": "message", "message_type": "guild"}), "c1").await;
        h.dispatcher.adapter(group_message(42, "hello"), "ghost").await;
        assert!(h.recorder.events.lock().is_empty());
    }

    #[test]
    fn login_id_accepts_string_ids() {
        let resp = ApiResponse::from_frame(&json!({"retcode": 0, "data": {"user_id": "10001"}}));
        assert_eq!(probe_login_id(&resp), Some(10001));
        let failed = ApiResponse::from_frame(&json!({"retcode": 103, "data": {"user_id": 1}}));
        assert_eq!(probe_login_id(&failed), None);
    }
}
