//! Segmented object handler: fetches `<object>/seg=N` children in a pipelined
//! window and publishes their concatenation on the object node once every
//! segment up to the final block id is present.
//!
//! While fetching, listeners on the object node also get one
//! `NodeEvent::SegmentReady` per segment, in segment order, whatever order the
//! segments arrive in.

use std::time::SystemTime;

use tracing::{debug, info, warn};

use crate::config::ConsumerConfig;
use crate::error::{Error, Result};
use crate::fetcher::RequestToken;
use crate::handler::{HandlerContext, NamespaceHandler};
use crate::name::Component;
use crate::namespace::{Content, ContentMeta, NodeId};
use crate::pipeline::SegmentWindow;
use crate::protocol::Interest;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SegmentedState {
    Idle,
    FetchingFirstSegment,
    FetchingRemaining,
    Assembling,
    Complete,
    /// Retries exhausted or segments inconsistent. Fetched segments are kept.
    Failed(Error),
    Cancelled,
}

#[derive(Debug)]
pub struct SegmentedHandler {
    state: SegmentedState,
    window: SegmentWindow,
    /// Next segment to report in order.
    next_in_order: u64,
    max_retries: Option<u32>,
    pipeline_size: Option<usize>,
    initial_interest_count: Option<usize>,
}

impl Default for SegmentedHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl SegmentedHandler {
    pub fn new() -> Self {
        Self {
            state: SegmentedState::Idle,
            window: SegmentWindow::new(),
            next_in_order: 0,
            max_retries: None,
            pipeline_size: None,
            initial_interest_count: None,
        }
    }

    /// Override the consumer-wide attempt budget for this object.
    pub fn with_max_retries(mut self, n: u32) -> Result<Self> {
        if n < 1 {
            return Err(Error::Config("max_retries must be at least 1".into()));
        }
        self.max_retries = Some(n);
        Ok(self)
    }

    pub fn with_pipeline_size(mut self, n: usize) -> Result<Self> {
        if n < 1 {
            return Err(Error::Config("pipeline_size must be at least 1".into()));
        }
        self.pipeline_size = Some(n);
        Ok(self)
    }

    pub fn with_initial_interest_count(mut self, n: usize) -> Result<Self> {
        if n < 1 {
            return Err(Error::Config(
                "initial_interest_count must be at least 1".into(),
            ));
        }
        self.initial_interest_count = Some(n);
        Ok(self)
    }

    /// Same overrides, for nested handlers created by a versioned object.
    pub(crate) fn with_overrides(
        mut self,
        max_retries: Option<u32>,
        pipeline_size: Option<usize>,
        initial_interest_count: Option<usize>,
    ) -> Self {
        self.max_retries = max_retries;
        self.pipeline_size = pipeline_size;
        self.initial_interest_count = initial_interest_count;
        self
    }

    pub fn state(&self) -> &SegmentedState {
        &self.state
    }

    pub fn failure(&self) -> Option<&Error> {
        match &self.state {
            SegmentedState::Failed(e) => Some(e),
            _ => None,
        }
    }

    pub fn final_segment(&self) -> Option<u64> {
        self.window.final_segment()
    }

    pub fn received_segments(&self) -> usize {
        self.window.received_count()
    }

    fn max_retries(&self, config: &ConsumerConfig) -> u32 {
        self.max_retries.unwrap_or(config.max_retries)
    }

    fn window_size(&self, config: &ConsumerConfig) -> usize {
        if self.window.final_segment().is_some() {
            self.pipeline_size.unwrap_or(config.pipeline_size)
        } else {
            self.initial_interest_count
                .unwrap_or(config.initial_interest_count)
        }
    }

    fn is_fetching(&self) -> bool {
        matches!(
            self.state,
            SegmentedState::FetchingFirstSegment | SegmentedState::FetchingRemaining
        )
    }

    /// Pick up segments already in the tree, then request the rest.
    fn start(&mut self, ctx: &mut HandlerContext<'_>) {
        self.state = SegmentedState::FetchingFirstSegment;
        for component in ctx.tree.child_components(ctx.node) {
            let Some(segment) = component.to_segment() else {
                continue;
            };
            let Some(child) = ctx.tree.child_id(ctx.node, &component) else {
                continue;
            };
            if !ctx.tree.has_content(child) {
                self.window.forget_received(segment);
                continue;
            }
            if let Err(e) = self.absorb(ctx, segment, child) {
                self.fail(ctx, e);
                return;
            }
        }
        self.report_in_order(ctx);
        self.advance(ctx);
    }

    /// Fire `SegmentReady` for each segment from `next_in_order` on that is
    /// present, stopping at the first gap.
    fn report_in_order(&mut self, ctx: &mut HandlerContext<'_>) {
        loop {
            if self
                .window
                .final_segment()
                .is_some_and(|last| self.next_in_order > last)
            {
                return;
            }
            let content = ctx
                .tree
                .child_id(ctx.node, &Component::from_segment(self.next_in_order))
                .and_then(|id| ctx.tree.content(id))
                .cloned();
            let Some(content) = content else {
                return;
            };
            let node = ctx.node;
            ctx.tree.notify_segment(node, self.next_in_order, &content);
            self.next_in_order += 1;
        }
    }

    /// Record `segment` as received and learn the final block id from it.
    ///
    /// Requests past a newly learned final block id were speculative; they
    /// are cancelled without reporting anything. Only a segment that has
    /// actually arrived past the final block id is an inconsistency.
    fn absorb(&mut self, ctx: &mut HandlerContext<'_>, segment: u64, node: NodeId) -> Result<()> {
        let final_block = ctx.tree.content(node).and_then(|c| c.meta.final_block_id);
        if let Some(token) = self.window.mark_received(segment) {
            // No-op when the fetcher already completed it.
            ctx.cancel_request(token);
        }
        if let Some(final_segment) = final_block {
            self.window
                .set_final(final_segment)
                .map_err(|c| Error::ReassemblyInconsistency {
                    name: ctx.node_name(),
                    final_block_id: c.final_segment,
                    seen: c.seen,
                })?;
            for (beyond, token) in self.window.take_beyond_final() {
                debug!(segment = beyond, "cancel request past final segment");
                ctx.cancel_request(token);
            }
        }
        if let Some(final_segment) = self.window.final_segment() {
            if segment > final_segment {
                return Err(Error::ReassemblyInconsistency {
                    name: ctx.node_name(),
                    final_block_id: final_segment,
                    seen: segment,
                });
            }
        }
        Ok(())
    }

    fn advance(&mut self, ctx: &mut HandlerContext<'_>) {
        if self.window.is_complete() {
            self.assemble(ctx);
            return;
        }
        let max_retries = self.max_retries(ctx.config);
        let window = self.window_size(ctx.config);
        let base = ctx.node_name();
        for segment in self.window.next_to_request(window) {
            let token = ctx.express(Interest::new(base.clone().append_segment(segment)), max_retries);
            self.window.mark_requested(segment, token);
        }
        self.state = if self.window.is_received(0) {
            SegmentedState::FetchingRemaining
        } else {
            SegmentedState::FetchingFirstSegment
        };
    }

    fn assemble(&mut self, ctx: &mut HandlerContext<'_>) {
        let Some(last) = self.window.final_segment() else {
            return;
        };
        self.state = SegmentedState::Assembling;
        let mut bytes = Vec::new();
        let mut meta = ContentMeta::default();
        let mut missing = Vec::new();
        for segment in 0..=last {
            let content = ctx
                .tree
                .child_id(ctx.node, &Component::from_segment(segment))
                .and_then(|id| ctx.tree.content(id));
            match content {
                Some(c) => {
                    if segment == 0 {
                        meta = c.meta.clone();
                    }
                    bytes.extend_from_slice(&c.bytes);
                }
                None => missing.push(segment),
            }
        }
        if !missing.is_empty() {
            debug!(?missing, "segment content cleared before assembly");
            for segment in missing {
                self.window.forget_received(segment);
            }
            self.advance(ctx);
            return;
        }
        meta.received_at = Some(SystemTime::now());
        meta.final_block_id = None;
        // Segments naming a content key carry ciphertext.
        meta.encrypted = meta.key_name.is_some();
        info!(
            name = %ctx.node_name(),
            segments = last + 1,
            bytes = bytes.len(),
            "object assembled"
        );
        self.state = SegmentedState::Complete;
        ctx.publish(Content { bytes, meta });
    }

    fn fail(&mut self, ctx: &mut HandlerContext<'_>, error: Error) {
        for token in self.window.in_flight_tokens() {
            ctx.cancel_request(token);
        }
        self.window.clear_in_flight();
        warn!(name = %ctx.node_name(), %error, "segmented fetch failed");
        ctx.fail(&error);
        self.state = SegmentedState::Failed(error);
    }
}

impl NamespaceHandler for SegmentedHandler {
    fn on_attach(&mut self, ctx: &mut HandlerContext<'_>) {
        if self.state == SegmentedState::Idle {
            self.start(ctx);
        }
    }

    fn on_content(&mut self, ctx: &mut HandlerContext<'_>, node: NodeId) {
        if !self.is_fetching() || node == ctx.node || ctx.tree.parent(node) != Some(ctx.node) {
            return;
        }
        let segment = ctx
            .tree
            .name(node)
            .ok()
            .and_then(|n| n.last())
            .and_then(Component::to_segment);
        let Some(segment) = segment else {
            return;
        };
        if let Err(e) = self.absorb(ctx, segment, node) {
            self.fail(ctx, e);
            return;
        }
        self.report_in_order(ctx);
        self.advance(ctx);
    }

    fn on_content_cleared(&mut self, ctx: &mut HandlerContext<'_>, node: NodeId) {
        if ctx.tree.parent(node) != Some(ctx.node) {
            return;
        }
        let segment = ctx
            .tree
            .name(node)
            .ok()
            .and_then(|n| n.last())
            .and_then(Component::to_segment);
        let Some(segment) = segment else {
            return;
        };
        self.window.forget_received(segment);
        if self.is_fetching() {
            self.advance(ctx);
        }
    }

    fn on_fetch_data(&mut self, _ctx: &mut HandlerContext<'_>, _token: RequestToken, _node: NodeId) {
        // Segment content is handled when its ContentSet event is dispatched.
    }

    fn on_fetch_failed(&mut self, ctx: &mut HandlerContext<'_>, token: RequestToken, error: Error) {
        if !self.is_fetching() {
            return;
        }
        let Some(segment) = self.window.segment_for_token(token) else {
            return;
        };
        self.window.forget_request(segment);
        self.fail(ctx, error);
    }

    /// Resume a failed fetch, or rebuild a completed object whose content
    /// was cleared. Segments still in the tree are reused.
    fn retry(&mut self, ctx: &mut HandlerContext<'_>) {
        let cleared = self.state == SegmentedState::Complete && !ctx.tree.has_content(ctx.node);
        if matches!(self.state, SegmentedState::Failed(_)) || cleared {
            debug!(name = %ctx.node_name(), cleared, "retry segmented fetch");
            self.start(ctx);
        }
    }

    fn cancel(&mut self, ctx: &mut HandlerContext<'_>) {
        for token in self.window.in_flight_tokens() {
            ctx.cancel_request(token);
        }
        self.window.clear_in_flight();
        self.state = SegmentedState::Cancelled;
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use rand::seq::SliceRandom;
    use rand::thread_rng;

    use super::*;
    use crate::config::ConsumerConfig;
    use crate::consumer::Consumer;
    use crate::handler::Handler;
    use crate::namespace::{NodeEvent, Notification};
    use crate::producer::{segment_object, ProducerStore};
    use crate::protocol::Data;
    use crate::testutil::{name, record, Network, Seen};

    fn store_with(object: &str, payload: &[u8], segment_size: usize) -> ProducerStore {
        let mut store = ProducerStore::new();
        store.insert_all(segment_object(&name(object), payload, segment_size, None));
        store
    }

    #[test]
    fn out_of_order_segments_assemble_once() {
        let config = ConsumerConfig::default().with_initial_interest_count(3).unwrap();
        let mut consumer = Consumer::with_config(config);
        let mut net = Network::new(store_with("/a/obj", b"AABBCC", 2));
        let obj = consumer.resolve(&name("/a/obj")).unwrap();
        let seen = record(&mut consumer, obj);

        net.absorb(consumer.set_handler(obj, Handler::segmented()).unwrap());
        assert_eq!(net.pending_names().len(), 3);

        for seg in [1u64, 0] {
            assert!(net.deliver(&mut consumer, &name("/a/obj").append_segment(seg)));
            assert!(seen.borrow().is_empty());
        }
        assert!(net.deliver(&mut consumer, &name("/a/obj/seg=2")));
        assert_eq!(*seen.borrow(), vec![Seen::Set(b"AABBCC".to_vec())]);

        let state = consumer.handler(obj).and_then(Handler::as_segmented).map(|h| h.state().clone());
        assert_eq!(state, Some(SegmentedState::Complete));
        assert!(net.pending_names().is_empty());
    }

    #[test]
    fn any_arrival_order_gives_same_bytes() {
        let payload: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        let mut rng = thread_rng();
        for _ in 0..16 {
            let config = ConsumerConfig::default()
                .with_initial_interest_count(16)
                .unwrap()
                .with_pipeline_size(16)
                .unwrap();
            let mut consumer = Consumer::with_config(config);
            let mut net = Network::new(store_with("/p/obj", &payload, 100));
            let obj = consumer.resolve(&name("/p/obj")).unwrap();
            net.absorb(consumer.set_handler(obj, Handler::segmented()).unwrap());
            let mut order = net.pending_names();
            order.shuffle(&mut rng);
            for n in order {
                net.deliver(&mut consumer, &n);
            }
            net.deliver_all(&mut consumer);
            assert_eq!(consumer.content(obj).map(|c| c.bytes.clone()), Some(payload.clone()));
        }
    }

    #[test]
    fn sequential_fetch_discovers_final_block_from_segment_zero() {
        let mut consumer = Consumer::new();
        let mut net = Network::new(store_with("/a/big", &[7u8; 50], 10));
        let obj = consumer.resolve(&name("/a/big")).unwrap();
        net.absorb(consumer.set_handler(obj, Handler::segmented()).unwrap());
        assert_eq!(net.pending_names(), vec![name("/a/big/seg=0")]);
        net.deliver_all(&mut consumer);
        assert_eq!(consumer.content(obj).map(|c| c.bytes.len()), Some(50));
    }

    #[test]
    fn empty_object_completes_with_empty_content() {
        let mut consumer = Consumer::new();
        let mut net = Network::new(store_with("/a/empty", b"", 10));
        let obj = consumer.resolve(&name("/a/empty")).unwrap();
        net.absorb(consumer.set_handler(obj, Handler::segmented()).unwrap());
        net.deliver_all(&mut consumer);
        assert_eq!(consumer.content(obj).map(|c| c.bytes.clone()), Some(Vec::new()));
    }

    #[test]
    fn exhausted_segment_fails_after_max_retries() {
        let mut consumer = Consumer::new();
        let mut net = Network::new(ProducerStore::new());
        let obj = consumer.resolve(&name("/a/gone")).unwrap();
        let seen = record(&mut consumer, obj);
        net.absorb(consumer.set_handler(obj, Handler::segmented()).unwrap());
        net.deliver_all(&mut consumer);

        assert_eq!(net.expressed_count(&name("/a/gone/seg=0")), 3);
        let failures: Vec<Seen> = seen.borrow().clone();
        assert_eq!(failures.len(), 1);
        assert!(matches!(
            &failures[0],
            Seen::Failed(Error::FetchTimeout { attempts: 3, .. })
        ));
        assert!(consumer.content(obj).is_none());
    }

    #[test]
    fn retry_keeps_fetched_segments() {
        let config = ConsumerConfig::default().with_initial_interest_count(3).unwrap();
        let mut consumer = Consumer::with_config(config);
        let store = store_with("/a/obj", b"AABBCC", 2);
        let mut net = Network::new(store);
        let obj = consumer.resolve(&name("/a/obj")).unwrap();
        net.absorb(consumer.set_handler(obj, Handler::segmented()).unwrap());
        net.deliver(&mut consumer, &name("/a/obj/seg=0"));
        net.deliver(&mut consumer, &name("/a/obj/seg=1"));
        // seg=2 times out every time.
        net.time_out_all(&mut consumer);
        assert!(consumer.handler(obj).and_then(Handler::failure).is_some());
        assert!(consumer.content(obj).is_none());

        net.absorb(consumer.retry(obj).unwrap());
        assert_eq!(net.pending_names(), vec![name("/a/obj/seg=2")]);
        net.deliver_all(&mut consumer);
        assert_eq!(consumer.content(obj).map(|c| c.bytes.clone()), Some(b"AABBCC".to_vec()));
    }

    #[test]
    fn segment_beyond_final_block_is_inconsistent() {
        let config = ConsumerConfig::default().with_initial_interest_count(4).unwrap();
        let mut consumer = Consumer::with_config(config);
        let mut store = ProducerStore::new();
        store.insert(Data::new(name("/a/x/seg=3"), b"d".to_vec()));
        store.insert(Data::new(name("/a/x/seg=0"), b"a".to_vec()).with_final_block_id(1));
        let mut net = Network::new(store);
        let obj = consumer.resolve(&name("/a/x")).unwrap();
        let seen = record(&mut consumer, obj);
        net.absorb(consumer.set_handler(obj, Handler::segmented()).unwrap());
        net.deliver(&mut consumer, &name("/a/x/seg=3"));
        net.deliver(&mut consumer, &name("/a/x/seg=0"));

        assert!(matches!(
            seen.borrow().as_slice(),
            [Seen::Failed(Error::ReassemblyInconsistency {
                final_block_id: 1,
                seen: 3,
                ..
            })]
        ));
        assert!(net.pending_names().is_empty());
    }

    #[test]
    fn segments_already_present_are_used_on_attach() {
        let mut consumer = Consumer::new();
        let seg0 = consumer.resolve(&name("/a/obj/seg=0")).unwrap();
        let data = Data::new(name("/a/obj/seg=0"), b"only".to_vec()).with_final_block_id(0);
        consumer.set_content(seg0, Content::from_data(&data)).unwrap();
        let obj = consumer.resolve(&name("/a/obj")).unwrap();
        let actions = consumer.set_handler(obj, Handler::segmented()).unwrap();
        assert!(actions.is_empty());
        assert_eq!(consumer.content(obj).map(|c| c.bytes.clone()), Some(b"only".to_vec()));
    }

    #[test]
    fn handler_overrides_reject_zero() {
        assert!(SegmentedHandler::new().with_pipeline_size(0).is_err());
        assert!(SegmentedHandler::new().with_max_retries(0).is_err());
        assert!(SegmentedHandler::new().with_initial_interest_count(0).is_err());
    }

    #[test]
    fn requests_past_final_block_are_cancelled_silently() {
        let config = ConsumerConfig::default().with_initial_interest_count(4).unwrap();
        let mut consumer = Consumer::with_config(config);
        let mut net = Network::new(store_with("/a/two", b"xxyy", 2));
        let obj = consumer.resolve(&name("/a/two")).unwrap();
        let seen = record(&mut consumer, obj);
        net.absorb(consumer.set_handler(obj, Handler::segmented()).unwrap());
        assert_eq!(net.pending_names().len(), 4);

        net.deliver(&mut consumer, &name("/a/two/seg=0"));
        assert_eq!(net.pending_names(), vec![name("/a/two/seg=1")]);
        assert!(seen.borrow().is_empty());

        net.deliver_all(&mut consumer);
        assert_eq!(*seen.borrow(), vec![Seen::Set(b"xxyy".to_vec())]);
        assert_eq!(net.expressed_count(&name("/a/two/seg=3")), 1);
    }

    #[test]
    fn segments_are_reported_in_order() {
        let config = ConsumerConfig::default().with_initial_interest_count(4).unwrap();
        let mut consumer = Consumer::with_config(config);
        let mut net = Network::new(store_with("/a/obj", b"aabbccdd", 2));
        let obj = consumer.resolve(&name("/a/obj")).unwrap();
        let order = Rc::new(RefCell::new(Vec::new()));
        let sink = order.clone();
        consumer
            .add_listener(obj, move |n: &Notification<'_>| {
                if let NodeEvent::SegmentReady { segment, content } = &n.event {
                    sink.borrow_mut().push((*segment, content.bytes.clone()));
                }
            })
            .unwrap();
        net.absorb(consumer.set_handler(obj, Handler::segmented()).unwrap());

        net.deliver(&mut consumer, &name("/a/obj/seg=2"));
        net.deliver(&mut consumer, &name("/a/obj/seg=1"));
        assert!(order.borrow().is_empty());
        net.deliver(&mut consumer, &name("/a/obj/seg=0"));
        net.deliver(&mut consumer, &name("/a/obj/seg=3"));

        assert_eq!(
            *order.borrow(),
            vec![
                (0, b"aa".to_vec()),
                (1, b"bb".to_vec()),
                (2, b"cc".to_vec()),
                (3, b"dd".to_vec())
            ]
        );
    }

    #[test]
    fn cleared_object_refetches_cleared_segments_on_retry() {
        let mut consumer = Consumer::new();
        let mut net = Network::new(store_with("/a/obj", b"AABBCC", 2));
        let obj = consumer.resolve(&name("/a/obj")).unwrap();
        let seen = record(&mut consumer, obj);
        net.absorb(consumer.set_handler(obj, Handler::segmented()).unwrap());
        net.deliver_all(&mut consumer);

        let seg1 = consumer.tree().find(&name("/a/obj/seg=1")).unwrap();
        net.absorb(consumer.clear_content(obj).unwrap());
        net.absorb(consumer.clear_content(seg1).unwrap());
        net.absorb(consumer.retry(obj).unwrap());
        assert_eq!(net.pending_names(), vec![name("/a/obj/seg=1")]);
        net.deliver_all(&mut consumer);

        assert_eq!(
            *seen.borrow(),
            vec![
                Seen::Set(b"AABBCC".to_vec()),
                Seen::Cleared,
                Seen::Set(b"AABBCC".to_vec())
            ]
        );
        assert_eq!(net.expressed_count(&name("/a/obj/seg=1")), 2);
    }

    #[test]
    fn retry_on_complete_object_with_content_does_nothing() {
        let mut consumer = Consumer::new();
        let mut net = Network::new(store_with("/a/obj", b"AB", 1));
        let obj = consumer.resolve(&name("/a/obj")).unwrap();
        net.absorb(consumer.set_handler(obj, Handler::segmented()).unwrap());
        net.deliver_all(&mut consumer);
        assert!(consumer.retry(obj).unwrap().is_empty());
    }

    #[test]
    fn segments_naming_a_key_assemble_as_ciphertext() {
        let mut store = ProducerStore::new();
        store.insert_all(
            segment_object(&name("/a/sealed"), b"opaque bytes", 4, None)
                .into_iter()
                .map(|d| d.with_key_name(name("/a/CK/1"))),
        );
        let mut consumer = Consumer::new();
        let mut net = Network::new(store);
        let obj = consumer.resolve(&name("/a/sealed")).unwrap();
        net.absorb(consumer.set_handler(obj, Handler::segmented()).unwrap());
        net.deliver_all(&mut consumer);

        let content = consumer.content(obj).unwrap();
        assert!(content.meta.encrypted);
        assert_eq!(content.meta.key_name, Some(name("/a/CK/1")));
        assert_eq!(net.expressed_count(&name("/a/CK/1")), 0);
    }
}
