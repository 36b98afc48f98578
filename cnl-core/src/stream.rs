//! Generalized object stream: fetches `<stream>/_latest` to learn the newest
//! sequence number, then keeps a pipeline of `<stream>/seq=N` objects in
//! flight. Each object is described by its `<stream>/seq=N/_meta` packet and
//! is either inline or assembled by a nested segmented handler.
//!
//! Listeners on the stream node get `NodeEvent::SequenceReady` as each object
//! completes. A sequence number that is not produced yet stalls the pipeline
//! at that number until `refresh` or `retry`.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, info, warn};

use crate::config::ConsumerConfig;
use crate::error::{Error, Result};
use crate::fetcher::RequestToken;
use crate::handler::{Handler, HandlerContext, NamespaceHandler};
use crate::name::{Component, Name};
use crate::namespace::{Content, NodeId};
use crate::protocol::{ContentMetaInfo, Interest, LATEST_COMPONENT, META_COMPONENT};
use crate::segmented::SegmentedHandler;
use crate::wire::{decode_content_meta_info, decode_latest_target};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    FetchingLatest,
    Streaming,
    /// `_latest` could not be fetched or understood before streaming began.
    Failed(Error),
    Cancelled,
}

#[derive(Debug)]
pub struct GeneralizedObjectStreamHandler {
    state: StreamState,
    latest: Option<RequestToken>,
    /// Set once the first `_latest` answer has chosen where to start.
    anchored: bool,
    /// `_meta` requests in flight, by sequence number.
    requested: BTreeMap<u64, RequestToken>,
    /// Objects whose `_meta` arrived but which are not reported yet, and
    /// their nodes. Segmented ones have a nested handler there.
    assembling: BTreeMap<u64, NodeId>,
    /// Nested assemblies that failed; `retry` resumes them.
    failed: BTreeMap<u64, NodeId>,
    reported: BTreeSet<u64>,
    max_reported: Option<u64>,
    /// Lowest sequence number whose `_meta` fetch ran out of retries.
    stalled_at: Option<u64>,
    meta_infos: BTreeMap<u64, ContentMetaInfo>,
    max_retries: Option<u32>,
    pipeline_size: Option<usize>,
}

impl Default for GeneralizedObjectStreamHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl GeneralizedObjectStreamHandler {
    pub fn new() -> Self {
        Self {
            state: StreamState::Idle,
            latest: None,
            anchored: false,
            requested: BTreeMap::new(),
            assembling: BTreeMap::new(),
            failed: BTreeMap::new(),
            reported: BTreeSet::new(),
            max_reported: None,
            stalled_at: None,
            meta_infos: BTreeMap::new(),
            max_retries: None,
            pipeline_size: None,
        }
    }

    pub fn with_max_retries(mut self, n: u32) -> Result<Self> {
        if n < 1 {
            return Err(Error::Config("max_retries must be at least 1".into()));
        }
        self.max_retries = Some(n);
        Ok(self)
    }

    /// Number of sequence objects kept in flight at once.
    pub fn with_pipeline_size(mut self, n: usize) -> Result<Self> {
        if n < 1 {
            return Err(Error::Config("pipeline_size must be at least 1".into()));
        }
        self.pipeline_size = Some(n);
        Ok(self)
    }

    pub fn state(&self) -> &StreamState {
        &self.state
    }

    pub fn failure(&self) -> Option<&Error> {
        match &self.state {
            StreamState::Failed(e) => Some(e),
            _ => None,
        }
    }

    /// Highest sequence number reported so far.
    pub fn max_reported_sequence(&self) -> Option<u64> {
        self.max_reported
    }

    /// Decoded `_meta` of object `sequence`.
    pub fn meta_info(&self, sequence: u64) -> Option<&ContentMetaInfo> {
        self.meta_infos.get(&sequence)
    }

    fn max_retries(&self, config: &ConsumerConfig) -> u32 {
        self.max_retries.unwrap_or(config.max_retries)
    }

    fn next_sequence(&self) -> u64 {
        self.max_reported.map_or(0, |m| m.saturating_add(1))
    }

    fn fetch_latest(&mut self, ctx: &mut HandlerContext<'_>) {
        if self.latest.is_some() {
            return;
        }
        let name = ctx.node_name().append(Component::from(LATEST_COMPONENT));
        let max_retries = self.max_retries(ctx.config);
        self.latest = Some(ctx.express(Interest::discovery(name), max_retries));
        if self.state != StreamState::Streaming {
            self.state = StreamState::FetchingLatest;
        }
    }

    fn fail(&mut self, ctx: &mut HandlerContext<'_>, error: Error) {
        warn!(name = %ctx.node_name(), %error, "stream fault");
        ctx.fail(&error);
        if self.state != StreamState::Streaming {
            self.state = StreamState::Failed(error);
        }
    }

    fn malformed(&mut self, ctx: &mut HandlerContext<'_>, name: Name, reason: &str) {
        let error = Error::MalformedObject {
            name,
            reason: reason.to_string(),
        };
        self.fail(ctx, error);
    }

    fn on_latest(&mut self, ctx: &mut HandlerContext<'_>, node: NodeId) {
        let Ok(name) = ctx.tree.name(node).cloned() else {
            return;
        };
        let stream = ctx.node_name();
        let versioned =
            name.len() == stream.len() + 2 && name.last().is_some_and(Component::is_version);
        if !versioned {
            self.malformed(ctx, name, "expected <stream>/_latest/<version>");
            return;
        }
        let target = match ctx.tree.content(node).map(|c| decode_latest_target(&c.bytes)) {
            Some(Ok(target)) => target,
            Some(Err(e)) => {
                self.malformed(ctx, name, &format!("undecodable _latest: {}", e));
                return;
            }
            None => {
                self.malformed(ctx, name, "_latest packet has no content");
                return;
            }
        };
        let sequence = if target.len() == stream.len() + 1 && stream.is_prefix_of(&target) {
            target.last().and_then(Component::to_sequence_number)
        } else {
            None
        };
        let Some(sequence) = sequence else {
            self.malformed(ctx, target, "_latest does not name <stream>/seq=N");
            return;
        };
        debug!(%target, sequence, "stream latest");
        if !self.anchored {
            self.anchored = true;
            if self.next_sequence() < sequence {
                self.max_reported = Some(sequence - 1);
            }
        }
        self.state = StreamState::Streaming;
        self.stalled_at = None;
        self.request_more(ctx);
    }

    /// Keep up to the pipeline size of objects requested or assembling.
    fn request_more(&mut self, ctx: &mut HandlerContext<'_>) {
        if self.state != StreamState::Streaming {
            return;
        }
        let window = self.pipeline_size.unwrap_or(ctx.config.pipeline_size).max(1);
        let max_retries = self.max_retries(ctx.config);
        let stream = ctx.node_name();
        let mut sequence = self.next_sequence();
        while self.requested.len() + self.assembling.len() < window {
            if self.stalled_at.is_some_and(|s| sequence >= s) {
                break;
            }
            let busy = self.requested.contains_key(&sequence)
                || self.assembling.contains_key(&sequence)
                || self.failed.contains_key(&sequence)
                || self.reported.contains(&sequence);
            if !busy {
                let meta = stream
                    .clone()
                    .append_sequence_number(sequence)
                    .append(Component::from(META_COMPONENT));
                let token = ctx.express(Interest::new(meta), max_retries);
                self.requested.insert(sequence, token);
            }
            sequence = match sequence.checked_add(1) {
                Some(s) => s,
                None => break,
            };
        }
    }

    fn on_meta(&mut self, ctx: &mut HandlerContext<'_>, sequence: u64, node: NodeId) {
        let Some(object) = ctx.tree.parent(node) else {
            return;
        };
        let name = ctx.tree.name(node).cloned().unwrap_or_default();
        let packet = ctx.tree.content(node).cloned();
        let info = match packet.as_ref().map(|c| decode_content_meta_info(&c.bytes)) {
            Some(Ok(info)) => info,
            Some(Err(e)) => {
                self.malformed(ctx, name, &format!("undecodable _meta: {}", e));
                return;
            }
            None => {
                self.malformed(ctx, name, "_meta packet has no content");
                return;
            }
        };
        self.assembling.insert(sequence, object);
        if info.has_segments {
            let nested = SegmentedHandler::new().with_overrides(self.max_retries, None, None);
            ctx.attach(object, Handler::Segmented(nested));
        } else {
            let mut content = Content::new(info.other.clone());
            content.meta.freshness_period_ms = packet.and_then(|p| p.meta.freshness_period_ms);
            if let Err(e) = ctx.tree.set_content(object, content) {
                debug!(error = %e, "inline stream object on missing node");
            }
        }
        self.meta_infos.insert(sequence, info);
    }

    /// Sequence number of `node` if it is a direct `seq=N` child of the stream.
    fn sequence_of(&self, ctx: &HandlerContext<'_>, node: NodeId) -> Option<u64> {
        if ctx.tree.parent(node) != Some(ctx.node) {
            return None;
        }
        ctx.tree
            .name(node)
            .ok()
            .and_then(|n| n.last())
            .and_then(Component::to_sequence_number)
    }
}

impl NamespaceHandler for GeneralizedObjectStreamHandler {
    fn on_attach(&mut self, ctx: &mut HandlerContext<'_>) {
        if self.state == StreamState::Idle {
            self.fetch_latest(ctx);
        }
    }

    fn on_content(&mut self, ctx: &mut HandlerContext<'_>, node: NodeId) {
        if self.state == StreamState::Cancelled {
            return;
        }
        let Some(sequence) = self.sequence_of(ctx, node) else {
            return;
        };
        if !self.reported.insert(sequence) {
            return;
        }
        self.assembling.remove(&sequence);
        self.failed.remove(&sequence);
        if self.max_reported.map_or(true, |m| sequence > m) {
            self.max_reported = Some(sequence);
        }
        if let Some(content) = ctx.tree.content(node).cloned() {
            info!(name = %ctx.node_name(), sequence, bytes = content.bytes.len(), "stream object");
            let stream = ctx.node;
            ctx.tree.notify_sequence(stream, sequence, &content);
        }
        self.request_more(ctx);
    }

    fn on_fetch_data(&mut self, ctx: &mut HandlerContext<'_>, token: RequestToken, node: NodeId) {
        if self.latest == Some(token) {
            self.latest = None;
            self.on_latest(ctx, node);
            return;
        }
        let sequence = self
            .requested
            .iter()
            .find(|(_, t)| **t == token)
            .map(|(s, _)| *s);
        if let Some(sequence) = sequence {
            self.requested.remove(&sequence);
            self.on_meta(ctx, sequence, node);
            self.request_more(ctx);
        }
    }

    fn on_fetch_failed(&mut self, ctx: &mut HandlerContext<'_>, token: RequestToken, error: Error) {
        if self.latest == Some(token) {
            self.latest = None;
            self.fail(ctx, error);
            return;
        }
        let sequence = self
            .requested
            .iter()
            .find(|(_, t)| **t == token)
            .map(|(s, _)| *s);
        let Some(sequence) = sequence else {
            return;
        };
        self.requested.remove(&sequence);
        // Not produced yet: wait for a refresh instead of asking again.
        info!(name = %ctx.node_name(), sequence, "stream waiting for sequence");
        self.stalled_at = Some(self.stalled_at.map_or(sequence, |s| s.min(sequence)));
    }

    fn on_failure(&mut self, ctx: &mut HandlerContext<'_>, node: NodeId, error: &Error) {
        let Some(sequence) = self.sequence_of(ctx, node) else {
            return;
        };
        if self.assembling.remove(&sequence).is_some() {
            self.failed.insert(sequence, node);
            self.fail(ctx, error.clone());
            self.request_more(ctx);
        }
    }

    /// Fetch `_latest` again after it failed; otherwise resume failed
    /// assemblies and lift a stall.
    fn retry(&mut self, ctx: &mut HandlerContext<'_>) {
        match self.state {
            StreamState::Failed(_) => {
                self.state = StreamState::Idle;
                self.fetch_latest(ctx);
            }
            StreamState::Streaming => {
                for (sequence, node) in std::mem::take(&mut self.failed) {
                    debug!(sequence, "retry stream object");
                    self.assembling.insert(sequence, node);
                    ctx.retry_handler_at(node);
                }
                self.stalled_at = None;
                self.request_more(ctx);
            }
            _ => {}
        }
    }

    fn refresh(&mut self, ctx: &mut HandlerContext<'_>) {
        if self.state != StreamState::Cancelled {
            self.fetch_latest(ctx);
        }
    }

    fn cancel(&mut self, ctx: &mut HandlerContext<'_>) {
        if let Some(token) = self.latest.take() {
            ctx.cancel_request(token);
        }
        for (_, token) in std::mem::take(&mut self.requested) {
            ctx.cancel_request(token);
        }
        for (_, node) in std::mem::take(&mut self.assembling) {
            ctx.cancel_handler_at(node);
        }
        self.state = StreamState::Cancelled;
    }
}
