//! Versioned object handler: discovers the latest version under the bare object
//! name, assembles it under `<object>/<version>` with a nested segmented
//! handler, and republishes the result on the bare name.

use std::collections::BTreeMap;
use std::time::SystemTime;

use tracing::{debug, info, warn};

use crate::config::{ConsumerConfig, StaleVersionPolicy};
use crate::error::{Error, Result};
use crate::fetcher::RequestToken;
use crate::handler::{Handler, HandlerContext, NamespaceHandler};
use crate::name::{Component, Name};
use crate::namespace::{Content, NodeId};
use crate::protocol::{ContentMetaInfo, Interest, META_COMPONENT};
use crate::segmented::SegmentedHandler;
use crate::wire::decode_content_meta_info;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GeneralizedState {
    Idle,
    Discovering,
    Fetching { version: u64 },
    Complete { version: u64 },
    Failed(Error),
    Cancelled,
}

#[derive(Debug)]
pub struct GeneralizedObjectHandler {
    state: GeneralizedState,
    discovery: Option<RequestToken>,
    latest_version: Option<u64>,
    published_version: Option<u64>,
    /// Versions with an assembly started, and the node it runs under.
    assemblies: BTreeMap<u64, NodeId>,
    meta_info: Option<ContentMetaInfo>,
    stale_version_policy: Option<StaleVersionPolicy>,
    max_retries: Option<u32>,
    pipeline_size: Option<usize>,
    initial_interest_count: Option<usize>,
}

impl Default for GeneralizedObjectHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl GeneralizedObjectHandler {
    pub fn new() -> Self {
        Self {
            state: GeneralizedState::Idle,
            discovery: None,
            latest_version: None,
            published_version: None,
            assemblies: BTreeMap::new(),
            meta_info: None,
            stale_version_policy: None,
            max_retries: None,
            pipeline_size: None,
            initial_interest_count: None,
        }
    }

    pub fn with_stale_version_policy(mut self, policy: StaleVersionPolicy) -> Self {
        self.stale_version_policy = Some(policy);
        self
    }

    /// Attempt budget for discovery and for the nested segment fetches.
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

    pub fn state(&self) -> &GeneralizedState {
        &self.state
    }

    pub fn failure(&self) -> Option<&Error> {
        match &self.state {
            GeneralizedState::Failed(e) => Some(e),
            _ => None,
        }
    }

    /// Newest version seen by discovery.
    pub fn latest_version(&self) -> Option<u64> {
        self.latest_version
    }

    /// Version whose content is currently on the object node.
    pub fn published_version(&self) -> Option<u64> {
        self.published_version
    }

    /// Last decoded `_meta` payload.
    pub fn meta_info(&self) -> Option<&ContentMetaInfo> {
        self.meta_info.as_ref()
    }

    fn policy(&self, config: &ConsumerConfig) -> StaleVersionPolicy {
        self.stale_version_policy
            .unwrap_or(config.stale_version_policy)
    }

    fn discover(&mut self, ctx: &mut HandlerContext<'_>) {
        if self.discovery.is_some() {
            return;
        }
        let max_retries = self.max_retries.unwrap_or(ctx.config.max_retries);
        let token = ctx.express(Interest::discovery(ctx.node_name()), max_retries);
        self.discovery = Some(token);
        if self.latest_version.is_none() {
            self.state = GeneralizedState::Discovering;
        }
    }

    fn malformed(&mut self, ctx: &mut HandlerContext<'_>, name: Name, reason: &str) {
        let error = Error::MalformedObject {
            name,
            reason: reason.to_string(),
        };
        self.fail(ctx, error);
    }

    fn fail(&mut self, ctx: &mut HandlerContext<'_>, error: Error) {
        warn!(name = %ctx.node_name(), %error, "versioned object failed");
        ctx.fail(&error);
        if self.published_version.is_none() {
            self.state = GeneralizedState::Failed(error);
        }
    }

    fn on_discovered(&mut self, ctx: &mut HandlerContext<'_>, node: NodeId) {
        let Ok(name) = ctx.tree.name(node).cloned() else {
            return;
        };
        let object_len = ctx.node_name().len();
        let version = if name.len() == object_len + 2 {
            name.get(-2).and_then(Component::to_version)
        } else {
            None
        };
        let (Some(version), Some(version_node)) = (version, ctx.tree.parent(node)) else {
            self.malformed(ctx, name, "expected <object>/<version>/<segment or _meta>");
            return;
        };

        if let Some(latest) = self.latest_version {
            if version <= latest {
                debug!(%name, version, latest, "discovery found no newer version");
                return;
            }
        }
        if let Some(old) = self.latest_version.replace(version) {
            self.supersede(ctx, old);
        }
        debug!(%name, version, "discovered version");

        let is_meta = name.last() == Some(&Component::from(META_COMPONENT));
        if is_meta {
            let decoded = ctx
                .tree
                .content(node)
                .map(|c| decode_content_meta_info(&c.bytes));
            let info = match decoded {
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
            if info.has_segments {
                self.start_assembly(ctx, version, version_node);
            } else {
                let mut content = Content::new(info.other.clone());
                if let Some(meta) = ctx.tree.content(node).map(|c| c.meta.clone()) {
                    content.meta.freshness_period_ms = meta.freshness_period_ms;
                    content.meta.key_name = meta.key_name;
                }
                self.state = GeneralizedState::Fetching { version };
                self.publish_version(ctx, version, content);
            }
            self.meta_info = Some(info);
        } else if name.last().is_some_and(Component::is_segment) {
            self.start_assembly(ctx, version, version_node);
        } else {
            self.malformed(ctx, name, "expected a segment or _meta component");
        }
    }

    fn start_assembly(&mut self, ctx: &mut HandlerContext<'_>, version: u64, version_node: NodeId) {
        self.assemblies.insert(version, version_node);
        self.state = GeneralizedState::Fetching { version };
        let nested = SegmentedHandler::new().with_overrides(
            self.max_retries,
            self.pipeline_size,
            self.initial_interest_count,
        );
        ctx.attach(version_node, Handler::Segmented(nested));
    }

    /// A newer version was discovered while `old` was the latest.
    fn supersede(&mut self, ctx: &mut HandlerContext<'_>, old: u64) {
        if self.published_version == Some(old) {
            return;
        }
        if self.policy(ctx.config) == StaleVersionPolicy::Cancel {
            if let Some(node) = self.assemblies.remove(&old) {
                info!(name = %ctx.node_name(), version = old, "cancel stale version");
                ctx.cancel_handler_at(node);
            }
        }
    }

    fn publish_version(&mut self, ctx: &mut HandlerContext<'_>, version: u64, mut content: Content) {
        if self.published_version.is_some_and(|p| p >= version) {
            debug!(version, "newer version already published");
            return;
        }
        if self.policy(ctx.config) == StaleVersionPolicy::Cancel
            && self.latest_version != Some(version)
        {
            return;
        }
        self.published_version = Some(version);
        if self.latest_version == Some(version) {
            self.state = GeneralizedState::Complete { version };
        }
        content.meta.received_at = Some(SystemTime::now());
        info!(name = %ctx.node_name(), version, bytes = content.bytes.len(), "publish version");
        ctx.publish(content);
    }

    fn version_of(&self, ctx: &HandlerContext<'_>, node: NodeId) -> Option<u64> {
        if ctx.tree.parent(node) != Some(ctx.node) {
            return None;
        }
        let version = ctx
            .tree
            .name(node)
            .ok()
            .and_then(|n| n.last())
            .and_then(Component::to_version)?;
        (self.assemblies.get(&version) == Some(&node)).then_some(version)
    }
}

impl NamespaceHandler for GeneralizedObjectHandler {
    fn on_attach(&mut self, ctx: &mut HandlerContext<'_>) {
        if self.state == GeneralizedState::Idle {
            self.discover(ctx);
        }
    }

    fn on_content(&mut self, ctx: &mut HandlerContext<'_>, node: NodeId) {
        if self.state == GeneralizedState::Cancelled {
            return;
        }
        let Some(version) = self.version_of(ctx, node) else {
            return;
        };
        if let Some(content) = ctx.tree.content(node).cloned() {
            self.publish_version(ctx, version, content);
        }
    }

    fn on_fetch_data(&mut self, ctx: &mut HandlerContext<'_>, token: RequestToken, node: NodeId) {
        if self.discovery == Some(token) {
            self.discovery = None;
            self.on_discovered(ctx, node);
        }
    }

    fn on_fetch_failed(&mut self, ctx: &mut HandlerContext<'_>, token: RequestToken, error: Error) {
        if self.discovery == Some(token) {
            self.discovery = None;
            self.fail(ctx, error);
        }
    }

    fn on_failure(&mut self, ctx: &mut HandlerContext<'_>, node: NodeId, error: &Error) {
        let Some(version) = self.version_of(ctx, node) else {
            return;
        };
        if self.latest_version == Some(version) && self.published_version != Some(version) {
            self.fail(ctx, error.clone());
        }
    }

    /// Resume after a failure, or republish after the object's content was
    /// cleared. A version whose assembly still holds content is republished
    /// directly; otherwise its nested handler is retried.
    fn retry(&mut self, ctx: &mut HandlerContext<'_>) {
        let cleared = matches!(self.state, GeneralizedState::Complete { .. })
            && !ctx.tree.has_content(ctx.node);
        if !cleared && !matches!(self.state, GeneralizedState::Failed(_)) {
            return;
        }
        if cleared {
            self.published_version = None;
        }
        let pending = self
            .latest_version
            .and_then(|v| self.assemblies.get(&v).map(|node| (v, *node)));
        match pending {
            Some((version, node)) => {
                self.state = GeneralizedState::Fetching { version };
                match ctx.tree.content(node).cloned() {
                    Some(content) => self.publish_version(ctx, version, content),
                    None => ctx.retry_handler_at(node),
                }
            }
            None => {
                if cleared {
                    self.latest_version = None;
                }
                self.state = GeneralizedState::Idle;
                self.discover(ctx);
            }
        }
    }

    fn refresh(&mut self, ctx: &mut HandlerContext<'_>) {
        if self.state != GeneralizedState::Cancelled {
            self.discover(ctx);
        }
    }

    fn cancel(&mut self, ctx: &mut HandlerContext<'_>) {
        if let Some(token) = self.discovery.take() {
            ctx.cancel_request(token);
        }
        for node in self.assemblies.values() {
            ctx.cancel_handler_at(*node);
        }
        self.state = GeneralizedState::Cancelled;
    }
}
