//! Namespace tree: arena of nodes addressed by `NodeId`, created lazily on
//! resolve, each with optional content, an optional handler and listeners.
//!
//! Listeners run synchronously in registration order and cannot borrow the
//! tree. A listener that needs to change it queues work on a
//! `consumer::Commands` handle; handlers and queued commands are driven from
//! the event queue after the mutating call has returned.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::time::SystemTime;

use crate::error::{Error, Result};
use crate::handler::HandlerId;
use crate::name::{Component, Name};
use crate::protocol::Data;

/// Index of a node in its tree. Only meaningful for the tree that issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl NodeId {
    pub const ROOT: NodeId = NodeId(0);

    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Content metadata carried alongside the bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContentMeta {
    pub received_at: Option<SystemTime>,
    pub freshness_period_ms: Option<u64>,
    pub final_block_id: Option<u64>,
    /// Content key needed to decrypt these bytes.
    pub key_name: Option<Name>,
    /// Bytes are still ciphertext.
    pub encrypted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Content {
    pub bytes: Vec<u8>,
    pub meta: ContentMeta,
}

impl Content {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            bytes: bytes.into(),
            meta: ContentMeta {
                received_at: Some(SystemTime::now()),
                ..ContentMeta::default()
            },
        }
    }

    pub fn from_data(data: &Data) -> Self {
        Self {
            bytes: data.content.clone(),
            meta: ContentMeta {
                received_at: Some(SystemTime::now()),
                freshness_period_ms: data.meta_info.freshness_period_ms,
                final_block_id: data.final_segment(),
                key_name: data.meta_info.key_name.clone(),
                encrypted: false,
            },
        }
    }
}

/// What happened to a node.
#[derive(Debug)]
pub enum NodeEvent<'a> {
    /// Content transitioned to present (or was replaced).
    ContentSet(&'a Content),
    ContentCleared,
    /// A child node was created under this node.
    ChildAdded(&'a Name),
    /// Content on this node is now decrypted plaintext.
    PlaintextReady(&'a Content),
    /// Segment `segment` of the object on this node, reported in segment order.
    SegmentReady { segment: u64, content: &'a Content },
    /// Object `sequence` of the stream on this node is available at
    /// `<node>/seq=<sequence>`. Reported as objects complete, not in order.
    SequenceReady { sequence: u64, content: &'a Content },
    /// A fault scoped to this node (fetch exhausted, reassembly, key, decrypt).
    Failed(&'a Error),
}

#[derive(Debug)]
pub struct Notification<'a> {
    pub node: NodeId,
    pub name: &'a Name,
    pub event: NodeEvent<'a>,
}

pub type Listener = Box<dyn FnMut(&Notification<'_>)>;

/// Structural events queued for handler dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TreeEvent {
    ContentSet(NodeId),
    ContentCleared(NodeId),
    Failed(NodeId, Error),
}

struct Node {
    name: Name,
    parent: Option<NodeId>,
    children: BTreeMap<Component, NodeId>,
    content: Option<Content>,
    handler: Option<HandlerId>,
    listeners: Vec<(ListenerId, Listener)>,
}

impl Node {
    fn new(name: Name, parent: Option<NodeId>) -> Self {
        Self {
            name,
            parent,
            children: BTreeMap::new(),
            content: None,
            handler: None,
            listeners: Vec::new(),
        }
    }
}

/// The tree. Grows monotonically; nodes are never removed.
pub struct Namespace {
    nodes: Vec<Node>,
    listener_owner: HashMap<ListenerId, NodeId>,
    next_listener: u64,
    events: VecDeque<TreeEvent>,
}

impl Namespace {
    pub fn new() -> Self {
        Self {
            nodes: vec![Node::new(Name::new(), None)],
            listener_owner: HashMap::new(),
            next_listener: 1,
            events: VecDeque::new(),
        }
    }

    pub fn root(&self) -> NodeId {
        NodeId::ROOT
    }

    /// Number of nodes, root included.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    /// Return the node for `name`, creating every missing node on the way down.
    /// Each created node fires `ChildAdded` on its parent.
    pub fn resolve(&mut self, name: &Name) -> Result<NodeId> {
        if let Some(c) = name.components().iter().find(|c| c.is_empty()) {
            return Err(Error::InvalidName(format!(
                "{} has an empty component {:?}",
                name,
                c.as_bytes()
            )));
        }
        let mut current = NodeId::ROOT;
        for component in name.components() {
            current = self.child_unchecked(current, component);
        }
        Ok(current)
    }

    /// Get or create the child of `node` with `component`.
    pub fn child(&mut self, node: NodeId, component: &Component) -> Result<NodeId> {
        self.check(node)?;
        if component.is_empty() {
            return Err(Error::InvalidName("empty component".into()));
        }
        Ok(self.child_unchecked(node, component))
    }

    fn child_unchecked(&mut self, node: NodeId, component: &Component) -> NodeId {
        if let Some(&id) = self.nodes[node.0].children.get(component) {
            return id;
        }
        let id = NodeId(self.nodes.len());
        let name = self.nodes[node.0].name.clone().append(component.clone());
        self.nodes.push(Node::new(name.clone(), Some(node)));
        self.nodes[node.0].children.insert(component.clone(), id);
        self.fire(node, NodeEvent::ChildAdded(&name));
        id
    }

    /// Lookup without creating.
    pub fn find(&self, name: &Name) -> Option<NodeId> {
        let mut current = NodeId::ROOT;
        for component in name.components() {
            current = *self.nodes[current.0].children.get(component)?;
        }
        Some(current)
    }

    pub fn name(&self, node: NodeId) -> Result<&Name> {
        Ok(&self.get(node)?.name)
    }

    pub fn parent(&self, node: NodeId) -> Option<NodeId> {
        self.nodes.get(node.0).and_then(|n| n.parent)
    }

    pub fn content(&self, node: NodeId) -> Option<&Content> {
        self.nodes.get(node.0).and_then(|n| n.content.as_ref())
    }

    pub fn has_content(&self, node: NodeId) -> bool {
        self.content(node).is_some()
    }

    /// Sorted snapshot of the child components. Safe to iterate while the tree grows.
    pub fn child_components(&self, node: NodeId) -> Vec<Component> {
        self.nodes
            .get(node.0)
            .map(|n| n.children.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn child_id(&self, node: NodeId, component: &Component) -> Option<NodeId> {
        self.nodes
            .get(node.0)
            .and_then(|n| n.children.get(component).copied())
    }

    /// Store content and notify every listener, in registration order. Setting
    /// identical bytes again still notifies.
    pub fn set_content(&mut self, node: NodeId, content: Content) -> Result<()> {
        self.check(node)?;
        self.nodes[node.0].content = Some(content);
        let Node {
            name,
            content,
            listeners,
            ..
        } = &mut self.nodes[node.0];
        if let Some(content) = content.as_ref() {
            let notification = Notification {
                node,
                name,
                event: NodeEvent::ContentSet(content),
            };
            for (_, listener) in listeners.iter_mut() {
                listener(&notification);
            }
        }
        self.events.push_back(TreeEvent::ContentSet(node));
        Ok(())
    }

    /// Invalidate content (e.g. to force a re-fetch). No-op if already absent.
    pub fn clear_content(&mut self, node: NodeId) -> Result<()> {
        self.check(node)?;
        if self.nodes[node.0].content.take().is_some() {
            self.fire(node, NodeEvent::ContentCleared);
            self.events.push_back(TreeEvent::ContentCleared(node));
        }
        Ok(())
    }

    /// Register a listener. If the node already has content, the listener is
    /// called once with it before this returns.
    pub fn add_listener(&mut self, node: NodeId, mut listener: Listener) -> Result<ListenerId> {
        self.check(node)?;
        let id = ListenerId(self.next_listener);
        self.next_listener += 1;
        let entry = &self.nodes[node.0];
        if let Some(content) = entry.content.as_ref() {
            listener(&Notification {
                node,
                name: &entry.name,
                event: NodeEvent::ContentSet(content),
            });
        }
        self.nodes[node.0].listeners.push((id, listener));
        self.listener_owner.insert(id, node);
        Ok(id)
    }

    /// Returns false if the listener was not registered.
    pub fn remove_listener(&mut self, id: ListenerId) -> bool {
        match self.listener_owner.remove(&id) {
            Some(node) => {
                self.nodes[node.0].listeners.retain(|(l, _)| *l != id);
                true
            }
            None => false,
        }
    }

    pub(crate) fn notify_failed(&mut self, node: NodeId, error: &Error) {
        if self.check(node).is_err() {
            return;
        }
        self.fire(node, NodeEvent::Failed(error));
        self.events.push_back(TreeEvent::Failed(node, error.clone()));
    }

    pub(crate) fn notify_plaintext(&mut self, node: NodeId) {
        if self.check(node).is_err() {
            return;
        }
        let Node {
            name,
            content,
            listeners,
            ..
        } = &mut self.nodes[node.0];
        if let Some(content) = content.as_ref() {
            let notification = Notification {
                node,
                name,
                event: NodeEvent::PlaintextReady(content),
            };
            for (_, listener) in listeners.iter_mut() {
                listener(&notification);
            }
        }
    }

    pub(crate) fn notify_segment(&mut self, node: NodeId, segment: u64, content: &Content) {
        if self.check(node).is_ok() {
            self.fire(node, NodeEvent::SegmentReady { segment, content });
        }
    }

    pub(crate) fn notify_sequence(&mut self, node: NodeId, sequence: u64, content: &Content) {
        if self.check(node).is_ok() {
            self.fire(node, NodeEvent::SequenceReady { sequence, content });
        }
    }

    fn fire(&mut self, node: NodeId, event: NodeEvent<'_>) {
        let Node {
            name, listeners, ..
        } = &mut self.nodes[node.0];
        let notification = Notification { node, name, event };
        for (_, listener) in listeners.iter_mut() {
            listener(&notification);
        }
    }

    pub fn handler(&self, node: NodeId) -> Option<HandlerId> {
        self.nodes.get(node.0).and_then(|n| n.handler)
    }

    pub(crate) fn attach_handler(&mut self, node: NodeId, handler: HandlerId) -> Result<()> {
        let entry = self.get_mut(node)?;
        if entry.handler.is_some() {
            return Err(Error::HandlerAlreadyAttached(entry.name.clone()));
        }
        entry.handler = Some(handler);
        Ok(())
    }

    pub(crate) fn detach_handler(&mut self, node: NodeId) -> Option<HandlerId> {
        self.nodes.get_mut(node.0).and_then(|n| n.handler.take())
    }

    /// Nearest handler at or above `node`, with the node it is attached to.
    pub fn effective_handler(&self, node: NodeId) -> Option<(NodeId, HandlerId)> {
        let mut current = Some(node);
        while let Some(id) = current {
            let entry = self.nodes.get(id.0)?;
            if let Some(h) = entry.handler {
                return Some((id, h));
            }
            current = entry.parent;
        }
        None
    }

    pub(crate) fn pop_event(&mut self) -> Option<TreeEvent> {
        self.events.pop_front()
    }

    fn check(&self, node: NodeId) -> Result<()> {
        self.get(node).map(|_| ())
    }

    fn get(&self, node: NodeId) -> Result<&Node> {
        self.nodes.get(node.0).ok_or(Error::UnknownNode(node.0))
    }

    fn get_mut(&mut self, node: NodeId) -> Result<&mut Node> {
        self.nodes.get_mut(node.0).ok_or(Error::UnknownNode(node.0))
    }
}

impl Default for Namespace {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Namespace")
            .field("nodes", &self.nodes.len())
            .field("listeners", &self.listener_owner.len())
            .finish()
    }
}
