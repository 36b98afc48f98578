//! Consumer: owns the namespace tree, the attached handlers, the fetcher and the
//! capabilities, and runs the dispatch loop.
//!
//! Host-driven. The host performs the returned `OutboundAction`s and reports
//! request outcomes back through `on_data`, `on_timeout`, `on_network_error`,
//! `on_packet` and `tick`. Every entry point dispatches queued tree events
//! before returning.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use tracing::{debug, warn};

use crate::access::KeyCache;
use crate::config::ConsumerConfig;
use crate::crypto::{ChaChaCrypto, ContentCrypto, KeyStore, MemoryKeyStore};
use crate::error::{Error, Result};
use crate::fetcher::{Fetcher, Owner, RequestToken, RetryOutcome};
use crate::handler::{Deferred, Handler, HandlerContext, HandlerId, NamespaceHandler};
use crate::name::{Component, Name};
use crate::namespace::{Content, ListenerId, Namespace, NodeId, Notification, TreeEvent};
use crate::protocol::{Data, Interest, Packet};
use crate::wire::{decode_frame, FrameDecodeError};

/// Work for the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundAction {
    /// Send the interest; report its outcome against `token`. Retries reuse the token.
    ExpressInterest {
        token: RequestToken,
        interest: Interest,
    },
    /// Stop waiting for `token`; later outcomes for it are ignored anyway.
    CancelInterest(RequestToken),
}

enum Command {
    Resolve(Name),
    SetHandler(Name, Handler),
    Fetch(Name),
    Retry(Name),
}

/// Queue of tree changes requested from inside a listener. Listeners only see
/// a `&Notification`; they capture a `Commands` handle to act on the tree.
/// Queued commands run in order once the call that fired the listener has
/// returned to the consumer's dispatch loop. The outbound actions they cause
/// are returned by the consumer entry point that ran them, or by `flush`.
#[derive(Clone, Default)]
pub struct Commands {
    queue: Rc<RefCell<VecDeque<Command>>>,
}

impl Commands {
    /// Create the node for `name`, firing `ChildAdded` on the way down.
    pub fn resolve(&self, name: Name) {
        self.push(Command::Resolve(name));
    }

    /// Resolve `name` and attach `handler` there.
    pub fn set_handler(&self, name: Name, handler: Handler) {
        self.push(Command::SetHandler(name, handler));
    }

    /// Resolve `name` and fetch its single packet.
    pub fn fetch(&self, name: Name) {
        self.push(Command::Fetch(name));
    }

    pub fn retry(&self, name: Name) {
        self.push(Command::Retry(name));
    }

    pub fn is_empty(&self) -> bool {
        self.queue.borrow().is_empty()
    }

    fn push(&self, command: Command) {
        self.queue.borrow_mut().push_back(command);
    }

    fn take(&self) -> VecDeque<Command> {
        std::mem::take(&mut *self.queue.borrow_mut())
    }
}

impl std::fmt::Debug for Commands {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Commands")
            .field("queued", &self.queue.borrow().len())
            .finish()
    }
}

struct HandlerEntry {
    node: NodeId,
    handler: Handler,
}

pub struct Consumer {
    tree: Namespace,
    /// Taken out while being called; `None` afterwards means detached.
    handlers: Vec<Option<HandlerEntry>>,
    fetcher: Fetcher,
    config: ConsumerConfig,
    keys: KeyCache,
    crypto: Box<dyn ContentCrypto>,
    key_store: Box<dyn KeyStore>,
    deferred: Vec<Deferred>,
    commands: Commands,
    outbox: Vec<OutboundAction>,
}

impl Default for Consumer {
    fn default() -> Self {
        Self::new()
    }
}

impl Consumer {
    pub fn new() -> Self {
        Self::with_config(ConsumerConfig::default())
    }

    /// Default crypto and an empty key store.
    pub fn with_config(config: ConsumerConfig) -> Self {
        Self::with_capabilities(config, Box::new(ChaChaCrypto), Box::new(MemoryKeyStore::new()))
    }

    pub fn with_capabilities(
        config: ConsumerConfig,
        crypto: Box<dyn ContentCrypto>,
        key_store: Box<dyn KeyStore>,
    ) -> Self {
        Self {
            tree: Namespace::new(),
            handlers: Vec::new(),
            fetcher: Fetcher::new(config.request_timeout_ticks),
            config,
            keys: KeyCache::new(),
            crypto,
            key_store,
            deferred: Vec::new(),
            commands: Commands::default(),
            outbox: Vec::new(),
        }
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    pub fn tree(&self) -> &Namespace {
        &self.tree
    }

    pub fn key_cache(&self) -> &KeyCache {
        &self.keys
    }

    /// Requests still awaiting an outcome.
    pub fn pending_requests(&self) -> usize {
        self.fetcher.pending_count()
    }

    /// Listener commands queued by `ChildAdded` run before this returns; any
    /// outbound actions they cause wait for the next entry point or `flush`.
    pub fn resolve(&mut self, name: &Name) -> Result<NodeId> {
        let node = self.tree.resolve(name)?;
        self.pump();
        Ok(node)
    }

    /// Handle for listeners that need to change the tree.
    pub fn commands(&self) -> Commands {
        self.commands.clone()
    }

    /// Run anything still queued and hand over the pending outbound actions.
    pub fn flush(&mut self) -> Vec<OutboundAction> {
        self.pump();
        self.drain()
    }

    pub fn content(&self, node: NodeId) -> Option<&Content> {
        self.tree.content(node)
    }

    pub fn child_components(&self, node: NodeId) -> Vec<Component> {
        self.tree.child_components(node)
    }

    /// Handler attached to exactly this node.
    pub fn handler(&self, node: NodeId) -> Option<&Handler> {
        let id = self.tree.handler(node)?;
        self.handlers
            .get(id.index())
            .and_then(Option::as_ref)
            .map(|e| &e.handler)
    }

    pub fn add_listener<F>(&mut self, node: NodeId, listener: F) -> Result<ListenerId>
    where
        F: FnMut(&Notification<'_>) + 'static,
    {
        self.tree.add_listener(node, Box::new(listener))
    }

    pub fn remove_listener(&mut self, id: ListenerId) -> bool {
        self.tree.remove_listener(id)
    }

    /// Attach `handler` to `node` and start it.
    pub fn set_handler(&mut self, node: NodeId, handler: Handler) -> Result<Vec<OutboundAction>> {
        self.attach(node, handler)?;
        self.pump();
        Ok(self.drain())
    }

    /// Set content locally, as if it had been fetched.
    pub fn set_content(&mut self, node: NodeId, content: Content) -> Result<Vec<OutboundAction>> {
        self.tree.set_content(node, content)?;
        self.pump();
        Ok(self.drain())
    }

    /// Drop the content on `node`. The handler serving it is told, so a later
    /// `retry` fetches or rebuilds it.
    pub fn clear_content(&mut self, node: NodeId) -> Result<Vec<OutboundAction>> {
        self.tree.clear_content(node)?;
        self.pump();
        Ok(self.drain())
    }

    /// Fetch the single packet named by `node`, without a handler.
    pub fn fetch(&mut self, node: NodeId) -> Result<Vec<OutboundAction>> {
        self.express_plain(node)?;
        Ok(self.drain())
    }

    fn express_plain(&mut self, node: NodeId) -> Result<()> {
        let name = self.tree.name(node)?.clone();
        let interest = Interest::new(name).with_lifetime(self.config.interest_lifetime_ms);
        self.fetcher
            .express(interest, Owner::Plain, self.config.max_retries, &mut self.outbox);
        Ok(())
    }

    /// Resume the failed handler on `node`. Without a handler, re-fetch the
    /// node if it has no content.
    pub fn retry(&mut self, node: NodeId) -> Result<Vec<OutboundAction>> {
        self.retry_node(node)?;
        self.pump();
        Ok(self.drain())
    }

    fn retry_node(&mut self, node: NodeId) -> Result<()> {
        self.tree.name(node)?;
        match self.tree.handler(node) {
            Some(id) => self.call(id, |h, ctx| h.retry(ctx)),
            None if !self.tree.has_content(node) => self.express_plain(node)?,
            None => {}
        }
        Ok(())
    }

    /// Look for a newer version of the object on `node`.
    pub fn refresh(&mut self, node: NodeId) -> Result<Vec<OutboundAction>> {
        self.tree.name(node)?;
        if let Some(id) = self.tree.handler(node) {
            self.call(id, |h, ctx| h.refresh(ctx));
        }
        self.pump();
        Ok(self.drain())
    }

    /// Detach and stop the handler on `node`. Its outstanding requests are
    /// cancelled; outcomes still in flight become no-ops.
    pub fn cancel_handler(&mut self, node: NodeId) -> Result<Vec<OutboundAction>> {
        self.tree.name(node)?;
        self.cancel_at(node);
        self.pump();
        Ok(self.drain())
    }

    /// Stop every handler and cancel every request.
    pub fn shutdown(&mut self) -> Vec<OutboundAction> {
        let attached: Vec<NodeId> = self
            .handlers
            .iter()
            .flatten()
            .map(|e| e.node)
            .collect();
        for node in attached {
            self.cancel_at(node);
        }
        self.apply_deferred();
        self.fetcher.cancel_all(&mut self.outbox);
        debug!(nodes = self.tree.len(), "consumer shut down");
        self.drain()
    }

    /// Data answering the request `token`.
    pub fn on_data(&mut self, token: RequestToken, data: Data) -> Vec<OutboundAction> {
        let Some(pending) = self.fetcher.complete(token, &data) else {
            debug!(token = token.value(), name = %data.name, "late or unmatched data");
            return self.drain();
        };
        match self.tree.resolve(&data.name) {
            Ok(node) => {
                if let Err(e) = self.tree.set_content(node, Content::from_data(&data)) {
                    warn!(error = %e, "store fetched content");
                }
                if let Owner::Handler(id) = pending.owner {
                    self.call(id, |h, ctx| h.on_fetch_data(ctx, token, node));
                }
            }
            Err(error) => {
                self.report_failure(token, pending.owner, &pending.interest.name, error);
            }
        }
        self.pump();
        self.drain()
    }

    /// One frame from the face. Returns the bytes consumed.
    pub fn on_packet(
        &mut self,
        bytes: &[u8],
    ) -> std::result::Result<(usize, Vec<OutboundAction>), FrameDecodeError> {
        let (packet, used) = decode_frame(bytes)?;
        let actions = match packet {
            Packet::Data(data) => match self.fetcher.match_name(&data.name) {
                Some(token) => self.on_data(token, data),
                None => {
                    debug!(name = %data.name, "unsolicited data");
                    Vec::new()
                }
            },
            Packet::Interest(interest) => {
                debug!(name = %interest.name, "consumer ignores interest");
                Vec::new()
            }
        };
        Ok((used, actions))
    }

    pub fn on_timeout(&mut self, token: RequestToken) -> Vec<OutboundAction> {
        let outcome = self.fetcher.on_timeout(token, &mut self.outbox);
        self.settle(token, outcome)
    }

    pub fn on_network_error(&mut self, token: RequestToken, reason: &str) -> Vec<OutboundAction> {
        let outcome = self.fetcher.on_network_error(token, reason, &mut self.outbox);
        self.settle(token, outcome)
    }

    /// Advance the request clock; requests unanswered for too many ticks are
    /// treated as timed out.
    pub fn tick(&mut self) -> Vec<OutboundAction> {
        for (token, pending, error) in self.fetcher.tick(&mut self.outbox) {
            self.report_failure(token, pending.owner, &pending.interest.name, error);
        }
        self.pump();
        self.drain()
    }

    fn settle(&mut self, token: RequestToken, outcome: RetryOutcome) -> Vec<OutboundAction> {
        if let RetryOutcome::Exhausted(pending, error) = outcome {
            self.report_failure(token, pending.owner, &pending.interest.name, error);
        }
        self.pump();
        self.drain()
    }

    fn report_failure(&mut self, token: RequestToken, owner: Owner, name: &Name, error: Error) {
        match owner {
            Owner::Handler(id) => self.call(id, |h, ctx| h.on_fetch_failed(ctx, token, error)),
            Owner::Plain => {
                if let Some(node) = self.tree.find(name) {
                    self.tree.notify_failed(node, &error);
                }
            }
        }
    }

    fn attach(&mut self, node: NodeId, handler: Handler) -> Result<()> {
        let id = HandlerId::from_index(self.handlers.len());
        self.tree.attach_handler(node, id)?;
        debug!(
            name = %self.tree.name(node)?,
            kind = handler.kind(),
            "attach handler"
        );
        self.handlers.push(Some(HandlerEntry { node, handler }));
        self.call(id, |h, ctx| h.on_attach(ctx));
        Ok(())
    }

    fn cancel_at(&mut self, node: NodeId) -> bool {
        let Some(id) = self.tree.detach_handler(node) else {
            return false;
        };
        self.call(id, |h, ctx| h.cancel(ctx));
        self.fetcher.cancel_owner(Owner::Handler(id), &mut self.outbox);
        if let Some(slot) = self.handlers.get_mut(id.index()) {
            *slot = None;
        }
        true
    }

    /// Run one handler callback. Handlers never run nested: anything structural
    /// they ask for is queued in `deferred`.
    fn call<F>(&mut self, id: HandlerId, f: F)
    where
        F: FnOnce(&mut Handler, &mut HandlerContext<'_>),
    {
        let Some(mut entry) = self.handlers.get_mut(id.index()).and_then(Option::take) else {
            debug!(handler = id.index(), "callback for detached handler");
            return;
        };
        {
            let mut ctx = HandlerContext::new(
                &mut self.tree,
                &mut self.fetcher,
                &mut self.outbox,
                &mut self.deferred,
                &self.config,
                &mut self.keys,
                self.crypto.as_ref(),
                self.key_store.as_ref(),
                id,
                entry.node,
            );
            f(&mut entry.handler, &mut ctx);
        }
        if let Some(slot) = self.handlers.get_mut(id.index()) {
            *slot = Some(entry);
        }
    }

    fn pump(&mut self) {
        loop {
            self.apply_deferred();
            if self.apply_commands() {
                continue;
            }
            let Some(event) = self.tree.pop_event() else {
                break;
            };
            match event {
                TreeEvent::ContentSet(node) => self.dispatch_content(node),
                TreeEvent::ContentCleared(node) => self.dispatch_cleared(node),
                TreeEvent::Failed(node, error) => self.dispatch_failure(node, &error),
            }
        }
    }

    /// Run listener commands queued so far. False if there were none.
    fn apply_commands(&mut self) -> bool {
        let queued = self.commands.take();
        if queued.is_empty() {
            return false;
        }
        for command in queued {
            let result = match command {
                Command::Resolve(name) => self.tree.resolve(&name).map(drop),
                Command::SetHandler(name, handler) => self
                    .tree
                    .resolve(&name)
                    .and_then(|node| self.attach(node, handler)),
                Command::Fetch(name) => self
                    .tree
                    .resolve(&name)
                    .and_then(|node| self.express_plain(node)),
                Command::Retry(name) => self
                    .tree
                    .resolve(&name)
                    .and_then(|node| self.retry_node(node)),
            };
            if let Err(error) = result {
                warn!(%error, "listener command failed");
            }
        }
        true
    }

    fn apply_deferred(&mut self) {
        while !self.deferred.is_empty() {
            for op in std::mem::take(&mut self.deferred) {
                match op {
                    Deferred::Attach { node, handler } => {
                        if let Err(error) = self.attach(node, handler) {
                            warn!(%error, "nested handler not attached");
                        }
                    }
                    Deferred::Cancel(node) => {
                        self.cancel_at(node);
                    }
                    Deferred::Retry(node) => {
                        if let Some(id) = self.tree.handler(node) {
                            self.call(id, |h, ctx| h.retry(ctx));
                        }
                    }
                }
            }
        }
    }

    /// Nearest handler first; then, if the node owns a handler, the parent's
    /// nearest handler sees the result. Ciphertext published by a decrypting
    /// handler stays on its node; its plaintext propagates instead.
    fn dispatch_content(&mut self, node: NodeId) {
        if let Some((_, id)) = self.tree.effective_handler(node) {
            self.call(id, |h, ctx| h.on_content(ctx, node));
        }
        let Some(owner) = self.handler(node) else {
            return;
        };
        let awaiting_plaintext = matches!(owner, Handler::GroupDecrypt(_))
            && self.tree.content(node).is_some_and(|c| c.meta.encrypted);
        if awaiting_plaintext {
            return;
        }
        if let Some((_, id)) = self
            .tree
            .parent(node)
            .and_then(|p| self.tree.effective_handler(p))
        {
            self.call(id, |h, ctx| h.on_content(ctx, node));
        }
    }

    fn dispatch_cleared(&mut self, node: NodeId) {
        if let Some((_, id)) = self.tree.effective_handler(node) {
            self.call(id, |h, ctx| h.on_content_cleared(ctx, node));
        }
    }

    fn dispatch_failure(&mut self, node: NodeId, error: &Error) {
        if self.tree.handler(node).is_none() {
            return;
        }
        if let Some((_, id)) = self
            .tree
            .parent(node)
            .and_then(|p| self.tree.effective_handler(p))
        {
            self.call(id, |h, ctx| h.on_failure(ctx, node, error));
        }
    }

    fn drain(&mut self) -> Vec<OutboundAction> {
        std::mem::take(&mut self.outbox)
    }
}

impl std::fmt::Debug for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer")
            .field("tree", &self.tree)
            .field("handlers", &self.handlers.iter().flatten().count())
            .field("pending", &self.fetcher.pending_count())
            .field("cached_keys", &self.keys.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::namespace::NodeEvent;
    use crate::producer::{segment_object, ProducerStore};
    use crate::testutil::{name, record, Network, Seen};
    use crate::wire::encode_frame;

    #[test]
    fn second_handler_on_same_node_is_rejected() {
        let mut consumer = Consumer::new();
        let obj = consumer.resolve(&name("/a/obj")).unwrap();
        consumer.set_handler(obj, Handler::segmented()).unwrap();
        assert!(matches!(
            consumer.set_handler(obj, Handler::segmented()),
            Err(Error::HandlerAlreadyAttached(n)) if n == name("/a/obj")
        ));
        assert_eq!(consumer.handler(obj).map(Handler::kind), Some("segmented"));
    }

    #[test]
    fn resolving_prefix_after_descendant_returns_same_node() {
        let mut consumer = Consumer::new();
        let deep = consumer.resolve(&name("/a/b/c")).unwrap();
        let a = consumer.resolve(&name("/a")).unwrap();
        assert_eq!(consumer.tree().find(&name("/a")), Some(a));
        assert_eq!(consumer.resolve(&name("/a/b/c")).unwrap(), deep);
        assert_eq!(
            consumer.child_components(a),
            vec![Component::from("b")]
        );
    }

    #[test]
    fn listener_added_after_completion_replays_content() {
        let mut store = ProducerStore::new();
        store.insert_all(segment_object(&name("/a/obj"), b"payload", 4, None));
        let mut net = Network::new(store);
        let mut consumer = Consumer::new();
        let obj = consumer.resolve(&name("/a/obj")).unwrap();
        net.absorb(consumer.set_handler(obj, Handler::segmented()).unwrap());
        net.deliver_all(&mut consumer);

        let replayed = Rc::new(RefCell::new(None));
        let sink = replayed.clone();
        consumer
            .add_listener(obj, move |n: &Notification<'_>| {
                if let NodeEvent::ContentSet(c) = &n.event {
                    *sink.borrow_mut() = Some(c.bytes.clone());
                }
            })
            .unwrap();
        assert_eq!(*replayed.borrow(), Some(b"payload".to_vec()));
    }

    #[test]
    fn plain_fetch_sets_content() {
        let mut store = ProducerStore::new();
        store.insert(Data::new(name("/a/single"), b"one packet".to_vec()));
        let mut net = Network::new(store);
        let mut consumer = Consumer::new();
        let node = consumer.resolve(&name("/a/single")).unwrap();
        let seen = record(&mut consumer, node);
        net.absorb(consumer.fetch(node).unwrap());
        net.deliver_all(&mut consumer);
        assert_eq!(*seen.borrow(), vec![Seen::Set(b"one packet".to_vec())]);
    }

    #[test]
    fn plain_fetch_failure_notifies_node() {
        let mut consumer = Consumer::new();
        let node = consumer.resolve(&name("/a/nothing")).unwrap();
        let seen = record(&mut consumer, node);
        let token = match consumer.fetch(node).unwrap().as_slice() {
            [OutboundAction::ExpressInterest { token, .. }] => *token,
            other => panic!("unexpected actions {:?}", other),
        };
        for _ in 0..2 {
            let actions = consumer.on_network_error(token, "unreachable");
            assert_eq!(actions.len(), 1);
        }
        assert!(consumer.on_network_error(token, "unreachable").is_empty());
        assert!(matches!(
            seen.borrow().as_slice(),
            [Seen::Failed(Error::FetchNetworkError { attempts: 3, .. })]
        ));
    }

    #[test]
    fn packets_from_face_are_matched_by_name() {
        let mut consumer = Consumer::new();
        let node = consumer.resolve(&name("/a/framed")).unwrap();
        let actions = consumer.fetch(node).unwrap();
        assert_eq!(actions.len(), 1);
        let frame = encode_frame(&Packet::Data(Data::new(name("/a/framed"), b"f".to_vec()))).unwrap();
        let (used, actions) = consumer.on_packet(&frame).unwrap();
        assert_eq!(used, frame.len());
        assert!(actions.is_empty());
        assert_eq!(consumer.content(node).map(|c| c.bytes.clone()), Some(b"f".to_vec()));
        assert_eq!(consumer.pending_requests(), 0);
        assert!(matches!(
            consumer.on_packet(&frame[..3]),
            Err(FrameDecodeError::NeedMore)
        ));
    }

    #[test]
    fn cancelled_handler_ignores_late_data() {
        let mut store = ProducerStore::new();
        store.insert_all(segment_object(&name("/a/obj"), b"late", 2, None));
        let mut consumer = Consumer::new();
        let obj = consumer.resolve(&name("/a/obj")).unwrap();
        let actions = consumer.set_handler(obj, Handler::segmented()).unwrap();
        let token = match actions.as_slice() {
            [OutboundAction::ExpressInterest { token, .. }] => *token,
            other => panic!("unexpected actions {:?}", other),
        };
        let actions = consumer.cancel_handler(obj).unwrap();
        assert_eq!(actions, vec![OutboundAction::CancelInterest(token)]);
        assert!(consumer.handler(obj).is_none());

        let data = store.get(&name("/a/obj/seg=0")).cloned().unwrap();
        assert!(consumer.on_data(token, data).is_empty());
        assert!(consumer.tree().find(&name("/a/obj/seg=0")).is_none());
        assert!(consumer.on_timeout(token).is_empty());
    }

    #[test]
    fn shutdown_cancels_everything() {
        let mut consumer = Consumer::new();
        let a = consumer.resolve(&name("/a")).unwrap();
        let b = consumer.resolve(&name("/b")).unwrap();
        let c = consumer.resolve(&name("/c")).unwrap();
        consumer.set_handler(a, Handler::segmented()).unwrap();
        consumer.set_handler(b, Handler::generalized()).unwrap();
        consumer.fetch(c).unwrap();
        assert_eq!(consumer.pending_requests(), 3);
        let actions = consumer.shutdown();
        assert_eq!(actions.len(), 3);
        assert!(actions
            .iter()
            .all(|a| matches!(a, OutboundAction::CancelInterest(_))));
        assert_eq!(consumer.pending_requests(), 0);
    }

    #[test]
    fn tick_times_out_unanswered_requests() {
        let config = ConsumerConfig {
            request_timeout_ticks: 1,
            max_retries: 2,
            ..ConsumerConfig::default()
        };
        let mut consumer = Consumer::with_config(config);
        let obj = consumer.resolve(&name("/a/obj")).unwrap();
        let seen = record(&mut consumer, obj);
        consumer.set_handler(obj, Handler::segmented()).unwrap();
        let mut expressed = 1;
        for _ in 0..10 {
            expressed += consumer
                .tick()
                .iter()
                .filter(|a| matches!(a, OutboundAction::ExpressInterest { .. }))
                .count();
        }
        assert_eq!(expressed, 2);
        assert!(matches!(
            seen.borrow().as_slice(),
            [Seen::Failed(Error::FetchTimeout { attempts: 2, .. })]
        ));
    }

    #[test]
    fn handler_on_ancestor_serves_descendants() {
        let mut store = ProducerStore::new();
        store.insert_all(segment_object(&name("/a/obj"), b"xyz", 1, None));
        let mut net = Network::new(store);
        let mut consumer = Consumer::new();
        let obj = consumer.resolve(&name("/a/obj")).unwrap();
        net.absorb(consumer.set_handler(obj, Handler::segmented()).unwrap());
        net.deliver_all(&mut consumer);
        let seg = consumer.tree().find(&name("/a/obj/seg=2")).unwrap();
        assert_eq!(consumer.tree().effective_handler(seg).map(|(n, _)| n), Some(obj));
        assert_eq!(consumer.content(obj).map(|c| c.bytes.clone()), Some(b"xyz".to_vec()));
    }

    #[test]
    fn listener_attaches_handlers_to_new_children() {
        let mut store = ProducerStore::new();
        store.insert_all(segment_object(&name("/feed/a"), b"first", 8, None));
        store.insert_all(segment_object(&name("/feed/b"), b"second", 8, None));
        let mut net = Network::new(store);
        let mut consumer = Consumer::new();
        let feed = consumer.resolve(&name("/feed")).unwrap();
        let commands = consumer.commands();
        consumer
            .add_listener(feed, move |n: &Notification<'_>| {
                if let NodeEvent::ChildAdded(child) = &n.event {
                    let child = (*child).clone();
                    commands.set_handler(child.clone(), Handler::segmented());
                    commands.resolve(child.append(Component::from("_note")));
                }
            })
            .unwrap();

        let a = consumer.resolve(&name("/feed/a")).unwrap();
        let b = consumer.resolve(&name("/feed/b")).unwrap();
        assert!(consumer.commands().is_empty());
        assert_eq!(consumer.handler(a).map(Handler::kind), Some("segmented"));
        assert!(consumer.tree().find(&name("/feed/a/_note")).is_some());

        net.absorb(consumer.flush());
        assert_eq!(
            net.pending_names(),
            vec![name("/feed/a/seg=0"), name("/feed/b/seg=0")]
        );
        net.deliver_all(&mut consumer);
        assert_eq!(consumer.content(a).map(|c| c.bytes.clone()), Some(b"first".to_vec()));
        assert_eq!(consumer.content(b).map(|c| c.bytes.clone()), Some(b"second".to_vec()));
    }
}
