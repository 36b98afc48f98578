//! Group-encryption access control: a handler that wraps another one, takes
//! the ciphertext it assembles, fetches (and if needed unwraps) the content
//! key named in the object's metadata, and publishes plaintext only after a
//! successful decryption.

use std::collections::HashMap;
use std::time::SystemTime;

use tracing::{debug, info, warn};

use crate::error::Error;
use crate::fetcher::RequestToken;
use crate::handler::{Handler, HandlerContext, NamespaceHandler};
use crate::name::Name;
use crate::namespace::{Content, NodeId};
use crate::protocol::Interest;

/// Decrypted content keys by key name. A key enters the cache only after it
/// has decrypted an object, and leaves it when it fails to. Otherwise it lives
/// as long as the consumer, so unbounded key rotation grows it without bound.
#[derive(Debug, Default)]
pub struct KeyCache {
    keys: HashMap<Name, Vec<u8>>,
}

impl KeyCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key_name: &Name) -> Option<&[u8]> {
        self.keys.get(key_name).map(Vec::as_slice)
    }

    pub fn insert(&mut self, key_name: Name, key: Vec<u8>) {
        self.keys.insert(key_name, key);
    }

    pub fn remove(&mut self, key_name: &Name) -> Option<Vec<u8>> {
        self.keys.remove(key_name)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecryptState {
    /// Inner handler still assembling.
    Waiting,
    FetchingKey { key_name: Name },
    Decrypted,
    /// Ciphertext stays on the node.
    Failed(Error),
    Cancelled,
}

#[derive(Debug)]
pub struct GroupDecryptHandler {
    inner: Box<Handler>,
    state: DecryptState,
    ciphertext: Option<Content>,
    key_token: Option<RequestToken>,
}

impl GroupDecryptHandler {
    pub fn new(inner: Handler) -> Self {
        Self {
            inner: Box::new(inner),
            state: DecryptState::Waiting,
            ciphertext: None,
            key_token: None,
        }
    }

    pub fn inner(&self) -> &Handler {
        &self.inner
    }

    pub fn state(&self) -> &DecryptState {
        &self.state
    }

    /// True once the node holds decrypted plaintext. Content presence alone
    /// does not mean this: ciphertext is published first.
    pub fn is_plaintext_ready(&self) -> bool {
        self.state == DecryptState::Decrypted
    }

    pub fn failure(&self) -> Option<&Error> {
        match &self.state {
            DecryptState::Failed(e) => Some(e),
            _ => self.inner.failure(),
        }
    }

    /// Call the inner handler, capturing what it publishes as ciphertext.
    fn forward<F>(&mut self, ctx: &mut HandlerContext<'_>, f: F)
    where
        F: FnOnce(&mut Handler, &mut HandlerContext<'_>),
    {
        let inner = &mut self.inner;
        let captured = ctx.intercepting(|ctx| f(inner, ctx));
        for content in captured {
            self.on_ciphertext(ctx, content);
        }
    }

    fn on_ciphertext(&mut self, ctx: &mut HandlerContext<'_>, mut content: Content) {
        if self.state == DecryptState::Cancelled {
            return;
        }
        let Some(key_name) = content.meta.key_name.clone() else {
            let error = Error::MalformedObject {
                name: ctx.node_name(),
                reason: "encrypted object names no content key".into(),
            };
            self.fail(ctx, error);
            return;
        };
        content.meta.encrypted = true;
        self.ciphertext = Some(content.clone());
        ctx.publish(content);
        self.resolve_key(ctx, key_name);
    }

    fn resolve_key(&mut self, ctx: &mut HandlerContext<'_>, key_name: Name) {
        if let Some(key) = ctx.keys.get(&key_name).map(<[u8]>::to_vec) {
            debug!(%key_name, "content key cached");
            self.decrypt(ctx, key_name, key);
            return;
        }
        if self.key_token.is_some() {
            if matches!(&self.state, DecryptState::FetchingKey { key_name: k } if *k == key_name) {
                return;
            }
            if let Some(token) = self.key_token.take() {
                ctx.cancel_request(token);
            }
        }
        debug!(%key_name, "fetch content key");
        let token = ctx.express(Interest::new(key_name.clone()), ctx.config.max_retries);
        self.key_token = Some(token);
        self.state = DecryptState::FetchingKey { key_name };
    }

    fn on_key(&mut self, ctx: &mut HandlerContext<'_>, node: NodeId) {
        let DecryptState::FetchingKey { key_name } = self.state.clone() else {
            return;
        };
        let Some(packet) = ctx.tree.content(node).cloned() else {
            self.fail(
                ctx,
                Error::KeyUnavailable {
                    key_name,
                    reason: "key packet has no content".into(),
                },
            );
            return;
        };
        let key = match &packet.meta.key_name {
            Some(private_name) => {
                let key_store = ctx.key_store;
                let crypto = ctx.crypto;
                let Some(private_key) = key_store.resolve_private_key(private_name) else {
                    let reason = format!("private key {} not found", private_name);
                    self.fail(ctx, Error::KeyUnavailable { key_name, reason });
                    return;
                };
                match crypto.unwrap_key(&packet.bytes, private_key) {
                    Ok(key) => key,
                    Err(source) => {
                        self.fail(ctx, Error::Unwrap { key_name, source });
                        return;
                    }
                }
            }
            None => packet.bytes,
        };
        self.decrypt(ctx, key_name, key);
    }

    fn decrypt(&mut self, ctx: &mut HandlerContext<'_>, key_name: Name, key: Vec<u8>) {
        let Some(ciphertext) = self.ciphertext.clone() else {
            return;
        };
        match ctx.crypto.decrypt(&ciphertext.bytes, &key) {
            Ok(plaintext) => {
                ctx.keys.insert(key_name, key);
                let mut meta = ciphertext.meta;
                meta.encrypted = false;
                meta.received_at = Some(SystemTime::now());
                info!(name = %ctx.node_name(), bytes = plaintext.len(), "object decrypted");
                self.state = DecryptState::Decrypted;
                ctx.publish(Content {
                    bytes: plaintext,
                    meta,
                });
                let node = ctx.node;
                ctx.tree.notify_plaintext(node);
            }
            Err(source) => {
                if ctx.keys.remove(&key_name).is_some() {
                    debug!(%key_name, "evict content key");
                }
                let name = ctx.node_name();
                self.fail(ctx, Error::Decrypt { name, source });
            }
        }
    }

    fn fail(&mut self, ctx: &mut HandlerContext<'_>, error: Error) {
        warn!(name = %ctx.node_name(), %error, "decryption failed");
        ctx.fail(&error);
        self.state = DecryptState::Failed(error);
    }
}

impl NamespaceHandler for GroupDecryptHandler {
    fn on_attach(&mut self, ctx: &mut HandlerContext<'_>) {
        self.forward(ctx, |h, c| h.on_attach(c));
    }

    fn on_content(&mut self, ctx: &mut HandlerContext<'_>, node: NodeId) {
        if node == ctx.node || self.state == DecryptState::Cancelled {
            return;
        }
        self.forward(ctx, |h, c| h.on_content(c, node));
    }

    fn on_content_cleared(&mut self, ctx: &mut HandlerContext<'_>, node: NodeId) {
        if node != ctx.node {
            self.forward(ctx, |h, c| h.on_content_cleared(c, node));
        }
    }

    fn on_fetch_data(&mut self, ctx: &mut HandlerContext<'_>, token: RequestToken, node: NodeId) {
        if self.key_token == Some(token) {
            self.key_token = None;
            self.on_key(ctx, node);
        } else {
            self.forward(ctx, |h, c| h.on_fetch_data(c, token, node));
        }
    }

    fn on_fetch_failed(&mut self, ctx: &mut HandlerContext<'_>, token: RequestToken, error: Error) {
        if self.key_token != Some(token) {
            self.forward(ctx, |h, c| h.on_fetch_failed(c, token, error));
            return;
        }
        self.key_token = None;
        if let DecryptState::FetchingKey { key_name } = self.state.clone() {
            let reason = error.to_string();
            self.fail(ctx, Error::KeyUnavailable { key_name, reason });
        }
    }

    fn on_failure(&mut self, ctx: &mut HandlerContext<'_>, node: NodeId, error: &Error) {
        self.forward(ctx, |h, c| h.on_failure(c, node, error));
    }

    fn retry(&mut self, ctx: &mut HandlerContext<'_>) {
        let key_name = self
            .ciphertext
            .as_ref()
            .and_then(|c| c.meta.key_name.clone());
        let cleared = !ctx.tree.has_content(ctx.node);
        match (&self.state, key_name) {
            (DecryptState::Failed(_), Some(key_name)) if !cleared => {
                debug!(%key_name, "retry content key");
                self.resolve_key(ctx, key_name);
            }
            (DecryptState::Decrypted | DecryptState::Failed(_), Some(_)) if cleared => {
                if let Some(ciphertext) = self.ciphertext.clone() {
                    debug!(name = %ctx.node_name(), "republish cleared object");
                    self.on_ciphertext(ctx, ciphertext);
                }
            }
            _ => self.forward(ctx, |h, c| h.retry(c)),
        }
    }

    fn refresh(&mut self, ctx: &mut HandlerContext<'_>) {
        self.forward(ctx, |h, c| h.refresh(c));
    }

    fn cancel(&mut self, ctx: &mut HandlerContext<'_>) {
        if let Some(token) = self.key_token.take() {
            ctx.cancel_request(token);
        }
        self.forward(ctx, |h, c| h.cancel(c));
        self.state = DecryptState::Cancelled;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConsumerConfig;
    use crate::consumer::Consumer;
    use crate::crypto::{
        encrypt_content, generate_content_key, wrap_key, ChaChaCrypto, MemoryKeyStore, PrivateKey,
    };
    use crate::producer::{segment_object, ProducerStore};
    use crate::protocol::Data;
    use crate::testutil::{name, record, Network, Seen};

    const SECRET: &[u8] = b"members only: meeting moved to thursday";

    /// Encrypted object under `object`, its key named `key_name`.
    fn encrypted_store(object: &str, key_name: &str, key: &[u8]) -> (ProducerStore, Vec<u8>) {
        let ciphertext = encrypt_content(key, SECRET).unwrap();
        let mut store = ProducerStore::new();
        store.insert_all(
            segment_object(&name(object), &ciphertext, 16, None)
                .into_iter()
                .map(|d| d.with_key_name(name(key_name))),
        );
        (store, ciphertext)
    }

    fn decrypt_state(consumer: &Consumer, node: NodeId) -> Option<DecryptState> {
        consumer
            .handler(node)
            .and_then(Handler::as_group_decrypt)
            .map(|h| h.state().clone())
    }

    #[test]
    fn plaintext_only_after_key_arrives() {
        let key = generate_content_key();
        let (mut store, ciphertext) = encrypted_store("/g/doc", "/g/CK/1", &key);
        store.insert(Data::new(name("/g/CK/1"), key.to_vec()));
        let mut net = Network::new(store);
        let mut consumer = Consumer::new();
        let doc = consumer.resolve(&name("/g/doc")).unwrap();
        let seen = record(&mut consumer, doc);

        net.absorb(
            consumer
                .set_handler(doc, Handler::group_decrypt(Handler::segmented()))
                .unwrap(),
        );
        while net.pending_names().iter().any(|n| n != &name("/g/CK/1")) {
            let next = net.pending_names().into_iter().find(|n| n != &name("/g/CK/1")).unwrap();
            net.deliver(&mut consumer, &next);
        }
        assert_eq!(*seen.borrow(), vec![Seen::Set(ciphertext.clone())]);
        assert!(consumer.content(doc).unwrap().meta.encrypted);
        assert!(matches!(
            decrypt_state(&consumer, doc),
            Some(DecryptState::FetchingKey { .. })
        ));

        net.deliver(&mut consumer, &name("/g/CK/1"));
        assert_eq!(
            *seen.borrow(),
            vec![
                Seen::Set(ciphertext),
                Seen::Set(SECRET.to_vec()),
                Seen::Plain(SECRET.to_vec())
            ]
        );
        let content = consumer.content(doc).unwrap();
        assert!(!content.meta.encrypted);
        assert_eq!(decrypt_state(&consumer, doc), Some(DecryptState::Decrypted));
    }

    #[test]
    fn wrapped_key_is_unwrapped_with_private_key() {
        let member = PrivateKey::generate();
        let key = generate_content_key();
        let (mut store, _) = encrypted_store("/g/doc", "/g/CK/1", &key);
        let wrapped = wrap_key(member.public_key(), &key).unwrap();
        store.insert(Data::new(name("/g/CK/1"), wrapped).with_key_name(name("/g/member/KEY")));

        let mut keys = MemoryKeyStore::new();
        keys.insert(name("/g/member/KEY"), member);
        let mut consumer = Consumer::with_capabilities(
            ConsumerConfig::default(),
            Box::new(ChaChaCrypto),
            Box::new(keys),
        );
        let mut net = Network::new(store);
        let doc = consumer.resolve(&name("/g/doc")).unwrap();
        net.absorb(
            consumer
                .set_handler(doc, Handler::group_decrypt(Handler::segmented()))
                .unwrap(),
        );
        net.deliver_all(&mut consumer);
        assert_eq!(consumer.content(doc).map(|c| c.bytes.clone()), Some(SECRET.to_vec()));
    }

    #[test]
    fn key_fetch_failure_reports_once_and_keeps_ciphertext() {
        let key = generate_content_key();
        let (store, ciphertext) = encrypted_store("/g/doc", "/g/CK/missing", &key);
        let mut net = Network::new(store);
        let mut consumer = Consumer::new();
        let doc = consumer.resolve(&name("/g/doc")).unwrap();
        let seen = record(&mut consumer, doc);
        net.absorb(
            consumer
                .set_handler(doc, Handler::group_decrypt(Handler::segmented()))
                .unwrap(),
        );
        net.deliver_all(&mut consumer);

        let seen = seen.borrow();
        let unavailable = seen
            .iter()
            .filter(|s| matches!(s, Seen::Failed(Error::KeyUnavailable { .. })))
            .count();
        assert_eq!(unavailable, 1);
        assert!(!seen.iter().any(|s| matches!(s, Seen::Plain(_))));
        assert!(!seen.contains(&Seen::Set(SECRET.to_vec())));
        assert_eq!(consumer.content(doc).map(|c| c.bytes.clone()), Some(ciphertext));
        assert_eq!(net.expressed_count(&name("/g/CK/missing")), 3);
    }

    #[test]
    fn unknown_private_key_is_key_unavailable() {
        let member = PrivateKey::generate();
        let key = generate_content_key();
        let (mut store, _) = encrypted_store("/g/doc", "/g/CK/1", &key);
        let wrapped = wrap_key(member.public_key(), &key).unwrap();
        store.insert(Data::new(name("/g/CK/1"), wrapped).with_key_name(name("/g/other/KEY")));
        let mut net = Network::new(store);
        let mut consumer = Consumer::new();
        let doc = consumer.resolve(&name("/g/doc")).unwrap();
        net.absorb(
            consumer
                .set_handler(doc, Handler::group_decrypt(Handler::segmented()))
                .unwrap(),
        );
        net.deliver_all(&mut consumer);
        assert!(matches!(
            consumer.handler(doc).and_then(Handler::failure),
            Some(Error::KeyUnavailable { .. })
        ));
        assert!(consumer.content(doc).unwrap().meta.encrypted);
    }

    #[test]
    fn wrong_key_is_a_decrypt_error() {
        let key = generate_content_key();
        let (mut store, _) = encrypted_store("/g/doc", "/g/CK/1", &key);
        store.insert(Data::new(name("/g/CK/1"), generate_content_key().to_vec()));
        let mut net = Network::new(store);
        let mut consumer = Consumer::new();
        let doc = consumer.resolve(&name("/g/doc")).unwrap();
        net.absorb(
            consumer
                .set_handler(doc, Handler::group_decrypt(Handler::segmented()))
                .unwrap(),
        );
        net.deliver_all(&mut consumer);
        assert!(matches!(
            consumer.handler(doc).and_then(Handler::failure),
            Some(Error::Decrypt { .. })
        ));
    }

    #[test]
    fn shared_key_is_fetched_once() {
        let key = generate_content_key();
        let (mut store, _) = encrypted_store("/g/one", "/g/CK/1", &key);
        let (other, _) = encrypted_store("/g/two", "/g/CK/1", &key);
        store.insert_all(other.packets().cloned());
        store.insert(Data::new(name("/g/CK/1"), key.to_vec()));
        let mut net = Network::new(store);
        let mut consumer = Consumer::new();
        let one = consumer.resolve(&name("/g/one")).unwrap();
        let two = consumer.resolve(&name("/g/two")).unwrap();
        net.absorb(
            consumer
                .set_handler(one, Handler::group_decrypt(Handler::segmented()))
                .unwrap(),
        );
        net.deliver_all(&mut consumer);
        net.absorb(
            consumer
                .set_handler(two, Handler::group_decrypt(Handler::segmented()))
                .unwrap(),
        );
        net.deliver_all(&mut consumer);

        assert_eq!(net.expressed_count(&name("/g/CK/1")), 1);
        assert_eq!(consumer.content(two).map(|c| c.bytes.clone()), Some(SECRET.to_vec()));
    }

    #[test]
    fn versioned_encrypted_object() {
        let key = generate_content_key();
        let (mut store, _) = encrypted_store("/g/doc/v=4", "/g/CK/4", &key);
        store.insert(Data::new(name("/g/CK/4"), key.to_vec()));
        let mut net = Network::new(store);
        let mut consumer = Consumer::new();
        let doc = consumer.resolve(&name("/g/doc")).unwrap();
        let seen = record(&mut consumer, doc);
        net.absorb(
            consumer
                .set_handler(doc, Handler::group_decrypt(Handler::generalized()))
                .unwrap(),
        );
        net.deliver_all(&mut consumer);
        assert_eq!(consumer.content(doc).map(|c| c.bytes.clone()), Some(SECRET.to_vec()));
        assert!(seen.borrow().contains(&Seen::Plain(SECRET.to_vec())));
    }

    #[test]
    fn retry_after_key_failure_fetches_key_again() {
        let key = generate_content_key();
        let (store, _) = encrypted_store("/g/doc", "/g/CK/1", &key);
        let mut net = Network::new(store);
        let mut consumer = Consumer::new();
        let doc = consumer.resolve(&name("/g/doc")).unwrap();
        net.absorb(
            consumer
                .set_handler(doc, Handler::group_decrypt(Handler::segmented()))
                .unwrap(),
        );
        net.deliver_all(&mut consumer);
        assert!(consumer.handler(doc).and_then(Handler::failure).is_some());

        net.store_mut().insert(Data::new(name("/g/CK/1"), key.to_vec()));
        net.absorb(consumer.retry(doc).unwrap());
        net.deliver_all(&mut consumer);
        assert_eq!(consumer.content(doc).map(|c| c.bytes.clone()), Some(SECRET.to_vec()));
    }

    #[test]
    fn key_that_fails_to_decrypt_is_not_cached() {
        let key = generate_content_key();
        let (mut store, _) = encrypted_store("/g/doc", "/g/CK/1", &key);
        store.insert(Data::new(name("/g/CK/1"), generate_content_key().to_vec()));
        let mut net = Network::new(store);
        let mut consumer = Consumer::new();
        let doc = consumer.resolve(&name("/g/doc")).unwrap();
        net.absorb(
            consumer
                .set_handler(doc, Handler::group_decrypt(Handler::segmented()))
                .unwrap(),
        );
        net.deliver_all(&mut consumer);
        assert!(matches!(
            consumer.handler(doc).and_then(Handler::failure),
            Some(Error::Decrypt { .. })
        ));
        assert!(consumer.key_cache().get(&name("/g/CK/1")).is_none());

        net.store_mut().insert(Data::new(name("/g/CK/1"), key.to_vec()));
        net.absorb(consumer.retry(doc).unwrap());
        assert_eq!(net.pending_names(), vec![name("/g/CK/1")]);
        net.deliver_all(&mut consumer);
        assert_eq!(consumer.content(doc).map(|c| c.bytes.clone()), Some(SECRET.to_vec()));
        assert_eq!(consumer.key_cache().get(&name("/g/CK/1")), Some(&key[..]));
        assert_eq!(net.expressed_count(&name("/g/CK/1")), 2);
    }
}
