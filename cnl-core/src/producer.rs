//! Producer side: split an object into segment packets, describe versioned
//! objects with a `_meta` packet, announce stream objects through `_latest`,
//! and answer interests from an in-memory table.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::name::{Component, Name};
use crate::protocol::{ContentMetaInfo, Data, Interest, LATEST_COMPONENT, META_COMPONENT};
use crate::wire::{encode_content_meta_info, encode_latest_target};

/// Default segment payload size in bytes.
pub const DEFAULT_SEGMENT_SIZE: usize = 8 * 1024;

/// Freshness of a stream's `_latest` packet.
pub const DEFAULT_LATEST_FRESHNESS_MS: u64 = 1000;

/// Split `bytes` into `<name>/seg=N` packets, each carrying the final block id.
/// An empty payload yields a single empty segment 0.
pub fn segment_object(
    name: &Name,
    bytes: &[u8],
    segment_size: usize,
    freshness_ms: Option<u64>,
) -> Vec<Data> {
    let size = if segment_size == 0 {
        DEFAULT_SEGMENT_SIZE
    } else {
        segment_size
    };
    let chunks: Vec<&[u8]> = if bytes.is_empty() {
        vec![bytes]
    } else {
        bytes.chunks(size).collect()
    };
    let last = chunks.len().saturating_sub(1) as u64;
    chunks
        .into_iter()
        .enumerate()
        .map(|(i, chunk)| {
            let data = Data::new(name.clone().append_segment(i as u64), chunk.to_vec())
                .with_final_block_id(last);
            match freshness_ms {
                Some(ms) => data.with_freshness(ms),
                None => data,
            }
        })
        .collect()
}

/// Packets by name.
#[derive(Debug, Clone, Default)]
pub struct ProducerStore {
    packets: BTreeMap<Name, Data>,
    /// Newest sequence number published per stream.
    produced: BTreeMap<Name, u64>,
}

impl ProducerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, data: Data) {
        self.packets.insert(data.name.clone(), data);
    }

    pub fn insert_all(&mut self, packets: impl IntoIterator<Item = Data>) {
        for data in packets {
            self.insert(data);
        }
    }

    /// Segment `bytes` under `name` (or `name/v=version`) and store the segments.
    /// Returns the name the segments were published under.
    pub fn publish(
        &mut self,
        name: &Name,
        version: Option<u64>,
        bytes: &[u8],
        segment_size: usize,
        freshness_ms: Option<u64>,
    ) -> Name {
        let base = match version {
            Some(v) => name.clone().append_version(v),
            None => name.clone(),
        };
        self.insert_all(segment_object(&base, bytes, segment_size, freshness_ms));
        base
    }

    /// Publish a generalized object under `name` (or `name/v=version`): a
    /// `_meta` packet describing it, plus segments when the bytes do not fit
    /// in one segment. Small objects travel inline in the `_meta` packet.
    pub fn publish_object(
        &mut self,
        name: &Name,
        version: Option<u64>,
        bytes: &[u8],
        content_type: &str,
        segment_size: usize,
        freshness_ms: Option<u64>,
    ) -> Result<Name, bincode::Error> {
        let base = match version {
            Some(v) => name.clone().append_version(v),
            None => name.clone(),
        };
        let size = if segment_size == 0 {
            DEFAULT_SEGMENT_SIZE
        } else {
            segment_size
        };
        let has_segments = bytes.len() > size;
        let info = ContentMetaInfo {
            content_type: content_type.to_string(),
            timestamp_ms: now_ms(),
            has_segments,
            other: if has_segments { Vec::new() } else { bytes.to_vec() },
        };
        let mut meta = Data::new(
            base.clone().append(Component::from(META_COMPONENT)),
            encode_content_meta_info(&info)?,
        );
        if let Some(ms) = freshness_ms {
            meta = meta.with_freshness(ms);
        }
        self.insert(meta);
        if has_segments {
            self.insert_all(segment_object(&base, bytes, size, freshness_ms));
        }
        Ok(base)
    }

    /// Publish object `sequence` of the stream at `stream` as
    /// `<stream>/seq=<sequence>` and point `<stream>/_latest` at it. The
    /// `_latest` packet is versioned by sequence number, so the newest one is
    /// what a fresh prefix interest finds.
    pub fn publish_sequence(
        &mut self,
        stream: &Name,
        sequence: u64,
        bytes: &[u8],
        content_type: &str,
        segment_size: usize,
    ) -> Result<Name, bincode::Error> {
        let target = stream.clone().append_sequence_number(sequence);
        self.publish_object(&target, None, bytes, content_type, segment_size, None)?;
        let newest = self.produced.get(stream).map_or(true, |&n| sequence >= n);
        if newest {
            let latest = stream
                .clone()
                .append(Component::from(LATEST_COMPONENT))
                .append_version(sequence);
            self.insert(
                Data::new(latest, encode_latest_target(&target)?)
                    .with_freshness(DEFAULT_LATEST_FRESHNESS_MS),
            );
            self.produced.insert(stream.clone(), sequence);
        }
        Ok(target)
    }

    /// Publish the next object of `stream`, one past the newest published.
    pub fn add_sequence(
        &mut self,
        stream: &Name,
        bytes: &[u8],
        content_type: &str,
        segment_size: usize,
    ) -> Result<Name, bincode::Error> {
        let next = self.produced_sequence(stream).map_or(0, |n| n + 1);
        self.publish_sequence(stream, next, bytes, content_type, segment_size)
    }

    /// Newest sequence number published on `stream`.
    pub fn produced_sequence(&self, stream: &Name) -> Option<u64> {
        self.produced.get(stream).copied()
    }

    pub fn get(&self, name: &Name) -> Option<&Data> {
        self.packets.get(name)
    }

    pub fn packets(&self) -> impl Iterator<Item = &Data> {
        self.packets.values()
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    /// Exact match, or for prefix interests the first packet under the
    /// interest name in canonical order. With `must_be_fresh`, the latest
    /// version under the name wins, preferring its `_meta` packet.
    pub fn answer(&self, interest: &Interest) -> Option<&Data> {
        if !interest.can_be_prefix {
            return self.packets.get(&interest.name);
        }
        if interest.must_be_fresh {
            let depth = interest.name.len() as isize;
            let latest = self
                .under(&interest.name)
                .filter_map(|d| d.name.get(depth).and_then(Component::to_version))
                .max();
            if let Some(version) = latest {
                let versioned = interest.name.clone().append_version(version);
                let meta = versioned.clone().append(Component::from(META_COMPONENT));
                return self
                    .packets
                    .get(&meta)
                    .or_else(|| self.under(&versioned).next());
            }
        }
        self.under(&interest.name).next()
    }

    fn under(&self, prefix: &Name) -> impl Iterator<Item = &Data> + '_ {
        let prefix = prefix.clone();
        self.packets
            .range(prefix.clone()..)
            .take_while(move |(name, _)| prefix.is_prefix_of(name))
            .map(|(_, data)| data)
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
