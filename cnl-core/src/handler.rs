//! Handler dispatch: the handler kinds, the entry points the consumer calls on
//! them, and the context through which they touch the tree and the network.

use tracing::debug;

use crate::access::{GroupDecryptHandler, KeyCache};
use crate::config::ConsumerConfig;
use crate::consumer::OutboundAction;
use crate::crypto::{ContentCrypto, KeyStore};
use crate::error::Error;
use crate::fetcher::{Fetcher, Owner, RequestToken};
use crate::generalized::GeneralizedObjectHandler;
use crate::name::Name;
use crate::namespace::{Content, Namespace, NodeId};
use crate::protocol::Interest;
use crate::segmented::SegmentedHandler;
use crate::stream::GeneralizedObjectStreamHandler;

/// Slot of an attached handler in the consumer's handler arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(usize);

impl HandlerId {
    pub(crate) fn from_index(index: usize) -> Self {
        HandlerId(index)
    }

    pub fn index(self) -> usize {
        self.0
    }
}

/// Behavior attached to a namespace node. At most one per node; descendants
/// without their own handler are served by the nearest ancestor's.
#[derive(Debug)]
pub enum Handler {
    /// Fetch `<node>/seg=N` children and publish their concatenation.
    Segmented(SegmentedHandler),
    /// Discover the latest version and assemble it under `<node>/<version>`.
    Generalized(GeneralizedObjectHandler),
    /// Follow `<node>/_latest` and fetch the `<node>/seq=N` objects after it.
    Stream(GeneralizedObjectStreamHandler),
    /// Wraps another handler; decrypts what it assembles before publishing.
    GroupDecrypt(GroupDecryptHandler),
}

impl Handler {
    pub fn segmented() -> Self {
        Handler::Segmented(SegmentedHandler::new())
    }

    pub fn generalized() -> Self {
        Handler::Generalized(GeneralizedObjectHandler::new())
    }

    pub fn stream() -> Self {
        Handler::Stream(GeneralizedObjectStreamHandler::new())
    }

    pub fn group_decrypt(inner: Handler) -> Self {
        Handler::GroupDecrypt(GroupDecryptHandler::new(inner))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Handler::Segmented(_) => "segmented",
            Handler::Generalized(_) => "generalized",
            Handler::Stream(_) => "stream",
            Handler::GroupDecrypt(_) => "group-decrypt",
        }
    }

    pub fn as_segmented(&self) -> Option<&SegmentedHandler> {
        match self {
            Handler::Segmented(h) => Some(h),
            _ => None,
        }
    }

    pub fn as_generalized(&self) -> Option<&GeneralizedObjectHandler> {
        match self {
            Handler::Generalized(h) => Some(h),
            _ => None,
        }
    }

    pub fn as_stream(&self) -> Option<&GeneralizedObjectStreamHandler> {
        match self {
            Handler::Stream(h) => Some(h),
            _ => None,
        }
    }

    pub fn as_group_decrypt(&self) -> Option<&GroupDecryptHandler> {
        match self {
            Handler::GroupDecrypt(h) => Some(h),
            _ => None,
        }
    }

    /// Last fault, if the handler is in its failed state.
    pub fn failure(&self) -> Option<&Error> {
        match self {
            Handler::Segmented(h) => h.failure(),
            Handler::Generalized(h) => h.failure(),
            Handler::Stream(h) => h.failure(),
            Handler::GroupDecrypt(h) => h.failure(),
        }
    }
}

impl From<SegmentedHandler> for Handler {
    fn from(h: SegmentedHandler) -> Self {
        Handler::Segmented(h)
    }
}

impl From<GeneralizedObjectHandler> for Handler {
    fn from(h: GeneralizedObjectHandler) -> Self {
        Handler::Generalized(h)
    }
}

impl From<GeneralizedObjectStreamHandler> for Handler {
    fn from(h: GeneralizedObjectStreamHandler) -> Self {
        Handler::Stream(h)
    }
}

impl From<GroupDecryptHandler> for Handler {
    fn from(h: GroupDecryptHandler) -> Self {
        Handler::GroupDecrypt(h)
    }
}

/// Entry points the consumer drives. `node` arguments are always at or below
/// the handler's attach point, except for content and failures bubbling up
/// from a nested handler's attach point.
pub(crate) trait NamespaceHandler {
    fn on_attach(&mut self, ctx: &mut HandlerContext<'_>);

    /// Content was set on `node`.
    fn on_content(&mut self, ctx: &mut HandlerContext<'_>, node: NodeId);

    /// A request this handler issued was answered; the data is stored at `node`.
    fn on_fetch_data(&mut self, ctx: &mut HandlerContext<'_>, token: RequestToken, node: NodeId);

    /// Content was cleared on `node`.
    fn on_content_cleared(&mut self, _ctx: &mut HandlerContext<'_>, _node: NodeId) {}

    /// A request this handler issued ran out of retries.
    fn on_fetch_failed(&mut self, ctx: &mut HandlerContext<'_>, token: RequestToken, error: Error);

    /// A nested handler attached at `node` failed.
    fn on_failure(&mut self, _ctx: &mut HandlerContext<'_>, _node: NodeId, _error: &Error) {}

    /// Resume after failure, keeping what was already fetched.
    fn retry(&mut self, ctx: &mut HandlerContext<'_>);

    /// Look for newer content. Only meaningful for versioned objects.
    fn refresh(&mut self, _ctx: &mut HandlerContext<'_>) {}

    /// Stop. Outstanding requests are cancelled and later callbacks ignored.
    fn cancel(&mut self, ctx: &mut HandlerContext<'_>);
}

impl NamespaceHandler for Handler {
    fn on_attach(&mut self, ctx: &mut HandlerContext<'_>) {
        match self {
            Handler::Segmented(h) => h.on_attach(ctx),
            Handler::Generalized(h) => h.on_attach(ctx),
            Handler::Stream(h) => h.on_attach(ctx),
            Handler::GroupDecrypt(h) => h.on_attach(ctx),
        }
    }

    fn on_content(&mut self, ctx: &mut HandlerContext<'_>, node: NodeId) {
        match self {
            Handler::Segmented(h) => h.on_content(ctx, node),
            Handler::Generalized(h) => h.on_content(ctx, node),
            Handler::Stream(h) => h.on_content(ctx, node),
            Handler::GroupDecrypt(h) => h.on_content(ctx, node),
        }
    }

    fn on_content_cleared(&mut self, ctx: &mut HandlerContext<'_>, node: NodeId) {
        match self {
            Handler::Segmented(h) => h.on_content_cleared(ctx, node),
            Handler::Generalized(h) => h.on_content_cleared(ctx, node),
            Handler::Stream(h) => h.on_content_cleared(ctx, node),
            Handler::GroupDecrypt(h) => h.on_content_cleared(ctx, node),
        }
    }

    fn on_fetch_data(&mut self, ctx: &mut HandlerContext<'_>, token: RequestToken, node: NodeId) {
        match self {
            Handler::Segmented(h) => h.on_fetch_data(ctx, token, node),
            Handler::Generalized(h) => h.on_fetch_data(ctx, token, node),
            Handler::Stream(h) => h.on_fetch_data(ctx, token, node),
            Handler::GroupDecrypt(h) => h.on_fetch_data(ctx, token, node),
        }
    }

    fn on_fetch_failed(&mut self, ctx: &mut HandlerContext<'_>, token: RequestToken, error: Error) {
        match self {
            Handler::Segmented(h) => h.on_fetch_failed(ctx, token, error),
            Handler::Generalized(h) => h.on_fetch_failed(ctx, token, error),
            Handler::Stream(h) => h.on_fetch_failed(ctx, token, error),
            Handler::GroupDecrypt(h) => h.on_fetch_failed(ctx, token, error),
        }
    }

    fn on_failure(&mut self, ctx: &mut HandlerContext<'_>, node: NodeId, error: &Error) {
        match self {
            Handler::Segmented(h) => h.on_failure(ctx, node, error),
            Handler::Generalized(h) => h.on_failure(ctx, node, error),
            Handler::Stream(h) => h.on_failure(ctx, node, error),
            Handler::GroupDecrypt(h) => h.on_failure(ctx, node, error),
        }
    }

    fn retry(&mut self, ctx: &mut HandlerContext<'_>) {
        match self {
            Handler::Segmented(h) => h.retry(ctx),
            Handler::Generalized(h) => h.retry(ctx),
            Handler::Stream(h) => h.retry(ctx),
            Handler::GroupDecrypt(h) => h.retry(ctx),
        }
    }

    fn refresh(&mut self, ctx: &mut HandlerContext<'_>) {
        match self {
            Handler::Segmented(h) => h.refresh(ctx),
            Handler::Generalized(h) => h.refresh(ctx),
            Handler::Stream(h) => h.refresh(ctx),
            Handler::GroupDecrypt(h) => h.refresh(ctx),
        }
    }

    fn cancel(&mut self, ctx: &mut HandlerContext<'_>) {
        match self {
            Handler::Segmented(h) => h.cancel(ctx),
            Handler::Generalized(h) => h.cancel(ctx),
            Handler::Stream(h) => h.cancel(ctx),
            Handler::GroupDecrypt(h) => h.cancel(ctx),
        }
    }
}

/// Structural work a handler asks for; applied after its callback returns.
#[derive(Debug)]
pub(crate) enum Deferred {
    Attach { node: NodeId, handler: Handler },
    Cancel(NodeId),
    Retry(NodeId),
}

/// Everything a handler callback may touch.
pub(crate) struct HandlerContext<'a> {
    pub tree: &'a mut Namespace,
    pub config: &'a ConsumerConfig,
    pub keys: &'a mut KeyCache,
    pub crypto: &'a dyn ContentCrypto,
    pub key_store: &'a dyn KeyStore,
    /// The handler being called.
    pub id: HandlerId,
    /// Where it is attached.
    pub node: NodeId,
    fetcher: &'a mut Fetcher,
    out: &'a mut Vec<OutboundAction>,
    deferred: &'a mut Vec<Deferred>,
    /// When set, `publish` collects content here instead of writing the node.
    intercept: Option<Vec<Content>>,
}

impl<'a> HandlerContext<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tree: &'a mut Namespace,
        fetcher: &'a mut Fetcher,
        out: &'a mut Vec<OutboundAction>,
        deferred: &'a mut Vec<Deferred>,
        config: &'a ConsumerConfig,
        keys: &'a mut KeyCache,
        crypto: &'a dyn ContentCrypto,
        key_store: &'a dyn KeyStore,
        id: HandlerId,
        node: NodeId,
    ) -> Self {
        Self {
            tree,
            config,
            keys,
            crypto,
            key_store,
            id,
            node,
            fetcher,
            out,
            deferred,
            intercept: None,
        }
    }

    /// Name of the attach point.
    pub fn node_name(&self) -> Name {
        self.tree.name(self.node).cloned().unwrap_or_default()
    }

    pub fn express(&mut self, interest: Interest, max_attempts: u32) -> RequestToken {
        let interest = interest.with_lifetime(self.config.interest_lifetime_ms);
        self.fetcher
            .express(interest, Owner::Handler(self.id), max_attempts, self.out)
    }

    pub fn cancel_request(&mut self, token: RequestToken) {
        self.fetcher.cancel(token, self.out);
    }

    /// Write the handler's output to its attach node, unless a wrapping handler
    /// is intercepting.
    pub fn publish(&mut self, content: Content) {
        if let Some(captured) = self.intercept.as_mut() {
            captured.push(content);
            return;
        }
        if let Err(e) = self.tree.set_content(self.node, content) {
            debug!(error = %e, "publish to missing node");
        }
    }

    /// Report a fault scoped to the attach node.
    pub fn fail(&mut self, error: &Error) {
        self.tree.notify_failed(self.node, error);
    }

    pub fn attach(&mut self, node: NodeId, handler: Handler) {
        self.deferred.push(Deferred::Attach { node, handler });
    }

    pub fn cancel_handler_at(&mut self, node: NodeId) {
        self.deferred.push(Deferred::Cancel(node));
    }

    pub fn retry_handler_at(&mut self, node: NodeId) {
        self.deferred.push(Deferred::Retry(node));
    }

    /// Run `f` with publishing captured; returns what it published.
    pub fn intercepting<F>(&mut self, f: F) -> Vec<Content>
    where
        F: FnOnce(&mut HandlerContext<'a>),
    {
        let saved = self.intercept.replace(Vec::new());
        f(self);
        std::mem::replace(&mut self.intercept, saved).unwrap_or_default()
    }
}
