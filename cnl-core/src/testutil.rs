//! Test harness: an in-memory network that answers the consumer's interests
//! from a `ProducerStore`, in whatever order the test asks for. Interests the
//! store cannot answer time out.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use crate::consumer::{Consumer, OutboundAction};
use crate::error::Error;
use crate::fetcher::RequestToken;
use crate::name::Name;
use crate::namespace::{NodeEvent, NodeId, Notification};
use crate::producer::ProducerStore;
use crate::protocol::Interest;

pub(crate) fn name(s: &str) -> Name {
    s.parse().expect("test name parses")
}

/// Owned copy of a notification, for asserting on listener history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Seen {
    Set(Vec<u8>),
    Cleared,
    Plain(Vec<u8>),
    Failed(Error),
}

pub(crate) type SeenLog = Rc<RefCell<Vec<Seen>>>;

/// Record content, plaintext and failure notifications on `node`.
pub(crate) fn record(consumer: &mut Consumer, node: NodeId) -> SeenLog {
    let log: SeenLog = Rc::default();
    let sink = log.clone();
    consumer
        .add_listener(node, move |n: &Notification<'_>| {
            let seen = match &n.event {
                NodeEvent::ContentSet(c) => Seen::Set(c.bytes.clone()),
                NodeEvent::ContentCleared => Seen::Cleared,
                NodeEvent::PlaintextReady(c) => Seen::Plain(c.bytes.clone()),
                NodeEvent::Failed(e) => Seen::Failed((*e).clone()),
                NodeEvent::ChildAdded(_)
                | NodeEvent::SegmentReady { .. }
                | NodeEvent::SequenceReady { .. } => return,
            };
            sink.borrow_mut().push(seen);
        })
        .expect("listener attaches");
    log
}

pub(crate) struct Network {
    store: ProducerStore,
    pending: BTreeMap<RequestToken, Interest>,
    expressed: Vec<Name>,
}

impl Network {
    pub fn new(store: ProducerStore) -> Self {
        Self {
            store,
            pending: BTreeMap::new(),
            expressed: Vec::new(),
        }
    }

    pub fn store_mut(&mut self) -> &mut ProducerStore {
        &mut self.store
    }

    pub fn absorb(&mut self, actions: Vec<OutboundAction>) {
        for action in actions {
            match action {
                OutboundAction::ExpressInterest { token, interest } => {
                    self.expressed.push(interest.name.clone());
                    self.pending.insert(token, interest);
                }
                OutboundAction::CancelInterest(token) => {
                    self.pending.remove(&token);
                }
            }
        }
    }

    /// Interest names awaiting an answer, oldest request first.
    pub fn pending_names(&self) -> Vec<Name> {
        self.pending.values().map(|i| i.name.clone()).collect()
    }

    /// How many times an interest for `name` was sent, retries included.
    pub fn expressed_count(&self, name: &Name) -> usize {
        self.expressed.iter().filter(|n| *n == name).count()
    }

    /// Answer the pending interest for exactly `name`. False if none is pending.
    pub fn deliver(&mut self, consumer: &mut Consumer, name: &Name) -> bool {
        let token = self
            .pending
            .iter()
            .find(|(_, i)| i.name == *name)
            .map(|(t, _)| *t);
        match token {
            Some(token) => {
                self.answer(consumer, token);
                true
            }
            None => false,
        }
    }

    /// Answer everything, oldest first, until nothing is pending.
    pub fn deliver_all(&mut self, consumer: &mut Consumer) {
        for _ in 0..10_000 {
            let Some(&token) = self.pending.keys().next() else {
                return;
            };
            self.answer(consumer, token);
        }
        panic!("network never went quiet");
    }

    /// Time out every pending interest, retries included, until nothing is pending.
    pub fn time_out_all(&mut self, consumer: &mut Consumer) {
        for _ in 0..10_000 {
            let Some(&token) = self.pending.keys().next() else {
                return;
            };
            self.pending.remove(&token);
            let actions = consumer.on_timeout(token);
            self.absorb(actions);
        }
        panic!("network never went quiet");
    }

    fn answer(&mut self, consumer: &mut Consumer, token: RequestToken) {
        let Some(interest) = self.pending.remove(&token) else {
            return;
        };
        let actions = match self.store.answer(&interest).cloned() {
            Some(data) => consumer.on_data(token, data),
            None => consumer.on_timeout(token),
        };
        self.absorb(actions);
    }
}
