//! Namespace abstraction over interest/data networking.
//! Host-driven: no I/O; host passes request completions and ticks, receives actions.

pub mod access;
pub mod config;
pub mod consumer;
pub mod crypto;
pub mod error;
pub mod fetcher;
pub mod generalized;
pub mod handler;
pub mod name;
pub mod namespace;
pub mod pipeline;
pub mod producer;
pub mod protocol;
pub mod segmented;
pub mod stream;
pub mod wire;

#[cfg(test)]
pub(crate) mod testutil;

pub use access::{DecryptState, GroupDecryptHandler, KeyCache};
pub use config::{ConsumerConfig, StaleVersionPolicy};
pub use consumer::{Commands, Consumer, OutboundAction};
pub use crypto::{
    ChaChaCrypto, ContentCrypto, CryptoError, KeyStore, MemoryKeyStore, PrivateKey, PublicKey,
};
pub use error::{Error, Result};
pub use fetcher::RequestToken;
pub use generalized::{GeneralizedObjectHandler, GeneralizedState};
pub use handler::{Handler, HandlerId};
pub use name::{Component, Name};
pub use namespace::{
    Content, ContentMeta, ListenerId, Namespace, NodeEvent, NodeId, Notification,
};
pub use producer::{segment_object, ProducerStore};
pub use protocol::{ContentMetaInfo, Data, Interest, MetaInfo, Packet};
pub use segmented::{SegmentedHandler, SegmentedState};
pub use stream::{GeneralizedObjectStreamHandler, StreamState};
pub use wire::{
    decode_frame, decode_latest_target, encode_frame, encode_latest_target, FrameDecodeError,
    FrameEncodeError,
};
