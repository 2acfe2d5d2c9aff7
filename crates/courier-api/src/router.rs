//! Handler registry for parsed callback messages.
//!
//! Lookup order for an `event` message: the handler registered for its event
//! name, then the default event handler, then the `event` type handler, then
//! the default handler. Other messages go to their type handler, then the
//! default handler. With nothing registered the message is logged and
//! dropped. A handler that panics is reported like one that failed.

use std::{any::Any, collections::BTreeMap, fmt, future::Future, panic::AssertUnwindSafe, sync::Arc};

use async_trait::async_trait;
use courier_core::{OutboundMessage, ParsedMessage};
use futures::FutureExt;

/// Per-callback context passed to handlers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackContext {
    /// Account the callback was addressed to.
    pub account_id: String,
}

/// Application code invoked for routed messages.
///
/// Returning a message queues it as a reply to the sender.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handles one message.
    async fn handle(&self, message: ParsedMessage, context: CallbackContext) -> anyhow::Result<Option<OutboundMessage>>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(ParsedMessage, CallbackContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Option<OutboundMessage>>> + Send,
{
    async fn handle(&self, message: ParsedMessage, context: CallbackContext) -> anyhow::Result<Option<OutboundMessage>> {
        (self.0)(message, context).await
    }
}

/// Wraps an async closure as a [`MessageHandler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(ParsedMessage, CallbackContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Option<OutboundMessage>>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Predicate run before routing; returning `false` drops the message.
pub type MessageFilter = Arc<dyn Fn(&ParsedMessage, &CallbackContext) -> bool + Send + Sync>;

/// Which registration a message was routed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Handler for one event name.
    Event(String),
    /// Fallback for events without their own handler.
    DefaultEvent,
    /// Handler for a message type.
    Type(String),
    /// Fallback for everything.
    Default,
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Event(event) => write!(f, "event:{event}"),
            Self::DefaultEvent => write!(f, "event:*"),
            Self::Type(msg_type) => write!(f, "{msg_type}"),
            Self::Default => write!(f, "*"),
        }
    }
}

/// Result of routing one message.
#[derive(Debug)]
pub enum RouteOutcome {
    /// A handler ran successfully.
    Handled {
        /// Registration that handled it
        route: Route,
        /// Reply to queue, if any
        reply: Option<OutboundMessage>,
    },
    /// A handler ran and failed.
    Failed {
        /// Registration that handled it
        route: Route,
        /// Handler error
        error: anyhow::Error,
    },
    /// A filter rejected the message.
    Filtered,
    /// No handler matched.
    Unhandled,
}

/// Registry mapping message types and event names to handlers.
#[derive(Default)]
pub struct MessageRouter {
    types: BTreeMap<String, Arc<dyn MessageHandler>>,
    events: BTreeMap<String, Arc<dyn MessageHandler>>,
    default_event: Option<Arc<dyn MessageHandler>>,
    default: Option<Arc<dyn MessageHandler>>,
    filters: Vec<MessageFilter>,
}

impl fmt::Debug for MessageRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageRouter")
            .field("routes", &self.routes())
            .field("filters", &self.filters.len())
            .finish()
    }
}

impl MessageRouter {
    /// Empty router; every message is logged and dropped.
    pub fn new() -> Self {
        Self::default()
    }

    /// Handles messages of `msg_type` (case-insensitive).
    pub fn register(&mut self, msg_type: &str, handler: Arc<dyn MessageHandler>) -> &mut Self {
        self.types.insert(msg_type.to_ascii_lowercase(), handler);
        self
    }

    /// Handles `event` messages whose event name is `event` (case-insensitive).
    pub fn register_event(&mut self, event: &str, handler: Arc<dyn MessageHandler>) -> &mut Self {
        self.events.insert(event.to_ascii_lowercase(), handler);
        self
    }

    /// Fallback for events without their own handler.
    pub fn set_default_event(&mut self, handler: Arc<dyn MessageHandler>) -> &mut Self {
        self.default_event = Some(handler);
        self
    }

    /// Fallback for everything unmatched.
    pub fn set_default(&mut self, handler: Arc<dyn MessageHandler>) -> &mut Self {
        self.default = Some(handler);
        self
    }

    /// Adds a filter; filters run in registration order.
    pub fn use_filter(
        &mut self,
        filter: impl Fn(&ParsedMessage, &CallbackContext) -> bool + Send + Sync + 'static,
    ) -> &mut Self {
        self.filters.push(Arc::new(filter));
        self
    }

    /// Registered routes in lookup-key form (`text`, `event:click`, `*`).
    pub fn routes(&self) -> Vec<String> {
        let events = self.events.keys().map(|e| Route::Event(e.clone()));
        let types = self.types.keys().map(|t| Route::Type(t.clone()));
        events
            .chain(self.default_event.as_ref().map(|_| Route::DefaultEvent))
            .chain(types)
            .chain(self.default.as_ref().map(|_| Route::Default))
            .map(|route| route.to_string())
            .collect()
    }

    /// Handler and route that `message` resolves to.
    pub fn resolve(&self, message: &ParsedMessage) -> Option<(Route, Arc<dyn MessageHandler>)> {
        let event = message.event().filter(|e| !e.is_empty());

        let by_event = event.and_then(|e| self.events.get(e).map(|h| (Route::Event(e.to_owned()), h)));
        let default_event = event.and(self.default_event.as_ref()).map(|h| (Route::DefaultEvent, h));
        let by_type = self.types.get(&message.msg_type).map(|h| (Route::Type(message.msg_type.clone()), h));
        let fallback = self.default.as_ref().map(|h| (Route::Default, h));

        by_event.or(default_event).or(by_type).or(fallback).map(|(route, handler)| (route, Arc::clone(handler)))
    }

    /// Runs filters, then the resolved handler.
    pub async fn route(&self, message: ParsedMessage, context: CallbackContext) -> RouteOutcome {
        if !self.filters.iter().all(|filter| filter(&message, &context)) {
            tracing::debug!(msg_type = %message.msg_type, "message dropped by filter");
            return RouteOutcome::Filtered;
        }

        let Some((route, handler)) = self.resolve(&message) else {
            tracing::warn!(
                msg_type = %message.msg_type,
                event = message.event().unwrap_or_default(),
                "no handler registered for message"
            );
            return RouteOutcome::Unhandled;
        };

        tracing::debug!(%route, from_user = %message.from_user, "routing message");
        match AssertUnwindSafe(handler.handle(message, context)).catch_unwind().await {
            Ok(Ok(reply)) => RouteOutcome::Handled { route, reply },
            Ok(Err(error)) => RouteOutcome::Failed { route, error },
            Err(payload) => {
                let error = anyhow::anyhow!("handler panicked: {}", panic_message(payload.as_ref()));
                tracing::error!(%route, error = %error, "message handler panicked");
                RouteOutcome::Failed { route, error }
            },
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use courier_core::Target;

    use super::*;

    fn message(body: &str) -> ParsedMessage {
        ParsedMessage::parse(body).unwrap()
    }

    fn text() -> ParsedMessage {
        message(r#"{"MsgType":"text","FromUserName":"u1","Content":"hi"}"#)
    }

    fn click() -> ParsedMessage {
        message(r#"{"MsgType":"event","FromUserName":"u1","Event":"CLICK","EventKey":"menu_1"}"#)
    }

    fn ctx() -> CallbackContext {
        CallbackContext { account_id: "default".into() }
    }

    fn noop() -> Arc<dyn MessageHandler> {
        handler_fn(|_, _| async { Ok(None) })
    }

    fn route_of(router: &MessageRouter, message: &ParsedMessage) -> Option<Route> {
        router.resolve(message).map(|(route, _)| route)
    }

    #[test]
    fn event_lookup_order() {
        let mut router = MessageRouter::new();
        router.set_default(noop());
        assert_eq!(route_of(&router, &click()), Some(Route::Default));

        router.register("event", noop());
        assert_eq!(route_of(&router, &click()), Some(Route::Type("event".into())));

        router.set_default_event(noop());
        assert_eq!(route_of(&router, &click()), Some(Route::DefaultEvent));

        router.register_event("Click", noop());
        assert_eq!(route_of(&router, &click()), Some(Route::Event("click".into())));
    }

    #[test]
    fn type_handler_then_default() {
        let mut router = MessageRouter::new();
        assert_eq!(route_of(&router, &text()), None);

        router.set_default(noop());
        assert_eq!(route_of(&router, &text()), Some(Route::Default));

        router.register("TEXT", noop());
        router.set_default_event(noop());
        assert_eq!(route_of(&router, &text()), Some(Route::Type("text".into())));
    }

    #[test]
    fn lists_routes() {
        let mut router = MessageRouter::new();
        router.register("text", noop()).register_event("subscribe", noop()).set_default(noop());

        assert_eq!(router.routes(), vec!["event:subscribe", "text", "*"]);
    }

    #[tokio::test]
    async fn handler_reply_is_returned() {
        let mut router = MessageRouter::new();
        router.register(
            "text",
            handler_fn(|message: ParsedMessage, _| async move {
                let echo = format!("echo: {}", message.text().unwrap_or_default());
                Ok(Some(OutboundMessage::text(Target::user(message.from_user), echo)))
            }),
        );

        let RouteOutcome::Handled { reply: Some(reply), .. } = router.route(text(), ctx()).await else {
            panic!("expected a reply");
        };
        assert_eq!(reply, OutboundMessage::text(Target::user("u1"), "echo: hi"));
    }

    #[tokio::test]
    async fn handler_errors_are_reported_not_raised() {
        let mut router = MessageRouter::new();
        router.register("text", handler_fn(|_, _| async { Err(anyhow::anyhow!("boom")) }));

        let outcome = router.route(text(), ctx()).await;
        assert!(matches!(outcome, RouteOutcome::Failed { ref error, .. } if error.to_string() == "boom"));
    }

    #[tokio::test]
    async fn handler_panics_are_reported_not_raised() {
        let mut router = MessageRouter::new();
        router.register(
            "text",
            handler_fn(|message: ParsedMessage, _| async move {
                if message.text() == Some("hi") {
                    panic!("bad state for {}", message.from_user);
                }
                Ok(None)
            }),
        );

        let outcome = router.route(text(), ctx()).await;
        assert!(matches!(
            outcome,
            RouteOutcome::Failed { route: Route::Type(ref t), ref error }
                if t == "text" && error.to_string() == "handler panicked: bad state for u1"
        ));
    }

    #[tokio::test]
    async fn filters_short_circuit() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut router = MessageRouter::new();
        router
            .register(
                "text",
                handler_fn(move |_, _| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async { Ok(None) }
                }),
            )
            .use_filter(|message, _| message.from_user != "blocked");

        let blocked = message(r#"{"MsgType":"text","FromUserName":"blocked","Content":"x"}"#);
        assert!(matches!(router.route(blocked, ctx()).await, RouteOutcome::Filtered));
        assert!(matches!(router.route(text(), ctx()).await, RouteOutcome::Handled { reply: None, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unhandled_without_registrations() {
        let router = MessageRouter::new();
        assert!(matches!(router.route(click(), ctx()).await, RouteOutcome::Unhandled));
    }
}
