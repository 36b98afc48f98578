//! Packet model: interests, data and the generalized-object `_meta` payload.

use serde::{Deserialize, Serialize};

use crate::name::{Component, Name};

/// Default interest lifetime in milliseconds.
pub const DEFAULT_INTEREST_LIFETIME_MS: u64 = 4000;

/// Component naming the `_meta` packet of a generalized object.
pub const META_COMPONENT: &str = "_meta";

/// Component under which a stream announces its newest sequence number.
pub const LATEST_COMPONENT: &str = "_latest";

/// Request for the data packet under `name`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interest {
    pub name: Name,
    /// Any data whose name starts with `name` satisfies this interest.
    pub can_be_prefix: bool,
    pub must_be_fresh: bool,
    pub lifetime_ms: u64,
}

impl Interest {
    pub fn new(name: Name) -> Self {
        Self {
            name,
            can_be_prefix: false,
            must_be_fresh: false,
            lifetime_ms: DEFAULT_INTEREST_LIFETIME_MS,
        }
    }

    /// Interest used for version discovery: prefix match, fresh only.
    pub fn discovery(name: Name) -> Self {
        Self {
            can_be_prefix: true,
            must_be_fresh: true,
            ..Self::new(name)
        }
    }

    pub fn with_lifetime(mut self, lifetime_ms: u64) -> Self {
        self.lifetime_ms = lifetime_ms;
        self
    }

    /// Whether `data_name` answers this interest.
    pub fn matches(&self, data_name: &Name) -> bool {
        if self.can_be_prefix {
            self.name.is_prefix_of(data_name)
        } else {
            self.name == *data_name
        }
    }
}

/// Data packet metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaInfo {
    pub freshness_period_ms: Option<u64>,
    /// Segment component of the last segment of the object.
    pub final_block_id: Option<Component>,
    /// For object segments: the content key needed to decrypt the object.
    /// For key packets: the private key that wraps this key.
    pub key_name: Option<Name>,
}

/// Named content, the response to an interest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Data {
    pub name: Name,
    pub meta_info: MetaInfo,
    pub content: Vec<u8>,
}

impl Data {
    pub fn new(name: Name, content: impl Into<Vec<u8>>) -> Self {
        Self {
            name,
            meta_info: MetaInfo::default(),
            content: content.into(),
        }
    }

    pub fn with_final_block_id(mut self, segment: u64) -> Self {
        self.meta_info.final_block_id = Some(Component::from_segment(segment));
        self
    }

    pub fn with_key_name(mut self, key_name: Name) -> Self {
        self.meta_info.key_name = Some(key_name);
        self
    }

    pub fn with_freshness(mut self, ms: u64) -> Self {
        self.meta_info.freshness_period_ms = Some(ms);
        self
    }

    /// Final block id as a segment number, if present and segment-typed.
    pub fn final_segment(&self) -> Option<u64> {
        self.meta_info
            .final_block_id
            .as_ref()
            .and_then(Component::to_segment)
    }
}

/// All wire packet types. Encoding is bincode; framing is length-prefix (see wire module).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Packet {
    Interest(Interest),
    Data(Data),
}

/// Payload of a generalized object's `_meta` packet.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentMetaInfo {
    pub content_type: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
    /// True when the object body is carried in segment packets.
    pub has_segments: bool,
    /// Object body when `has_segments` is false.
    pub other: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_interest_matches_only_same_name() {
        let name: Name = "/a/obj".parse().unwrap();
        let interest = Interest::new(name.clone());
        assert!(interest.matches(&name));
        assert!(!interest.matches(&name.clone().append_segment(0)));
    }

    #[test]
    fn prefix_interest_matches_descendants() {
        let name: Name = "/a/obj".parse().unwrap();
        let interest = Interest::discovery(name.clone());
        assert!(interest.matches(&name.clone().append_version(3).append_segment(0)));
        assert!(!interest.matches(&"/a/other".parse().unwrap()));
    }

    #[test]
    fn final_segment_requires_segment_component() {
        let data = Data::new("/a/seg=0".parse().unwrap(), b"x".to_vec()).with_final_block_id(4);
        assert_eq!(data.final_segment(), Some(4));
        let mut other = data.clone();
        other.meta_info.final_block_id = Some(Component::from("end"));
        assert_eq!(other.final_segment(), None);
    }
}
