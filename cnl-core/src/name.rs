//! Hierarchical names: ordered opaque components with canonical ordering and
//! marker-typed components for segments, versions and sequence numbers.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

const SEGMENT_MARKER: u8 = 0x00;
const VERSION_MARKER: u8 = 0xFD;
const SEQUENCE_MARKER: u8 = 0xFE;

/// One name component. Opaque bytes; typed components carry a marker byte
/// followed by a 1, 2, 4 or 8 byte big-endian integer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Component(Vec<u8>);

impl Component {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Component(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn from_segment(segment: u64) -> Self {
        Self::with_marker(SEGMENT_MARKER, segment)
    }

    pub fn from_version(version: u64) -> Self {
        Self::with_marker(VERSION_MARKER, version)
    }

    pub fn from_sequence_number(seq: u64) -> Self {
        Self::with_marker(SEQUENCE_MARKER, seq)
    }

    pub fn is_segment(&self) -> bool {
        self.marked_value(SEGMENT_MARKER).is_some()
    }

    pub fn is_version(&self) -> bool {
        self.marked_value(VERSION_MARKER).is_some()
    }

    pub fn is_sequence_number(&self) -> bool {
        self.marked_value(SEQUENCE_MARKER).is_some()
    }

    pub fn to_segment(&self) -> Option<u64> {
        self.marked_value(SEGMENT_MARKER)
    }

    pub fn to_version(&self) -> Option<u64> {
        self.marked_value(VERSION_MARKER)
    }

    pub fn to_sequence_number(&self) -> Option<u64> {
        self.marked_value(SEQUENCE_MARKER)
    }

    fn with_marker(marker: u8, value: u64) -> Self {
        let mut out = vec![marker];
        if value <= u8::MAX as u64 {
            out.push(value as u8);
        } else if value <= u16::MAX as u64 {
            out.extend_from_slice(&(value as u16).to_be_bytes());
        } else if value <= u32::MAX as u64 {
            out.extend_from_slice(&(value as u32).to_be_bytes());
        } else {
            out.extend_from_slice(&value.to_be_bytes());
        }
        Component(out)
    }

    fn marked_value(&self, marker: u8) -> Option<u64> {
        let (first, rest) = self.0.split_first()?;
        if *first != marker || !matches!(rest.len(), 1 | 2 | 4 | 8) {
            return None;
        }
        Some(rest.iter().fold(0u64, |acc, &b| (acc << 8) | b as u64))
    }
}

/// Canonical order: shorter components first, then bytewise.
impl Ord for Component {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .len()
            .cmp(&other.0.len())
            .then_with(|| self.0.cmp(&other.0))
    }
}

impl PartialOrd for Component {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl From<&str> for Component {
    fn from(s: &str) -> Self {
        Component(s.as_bytes().to_vec())
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(n) = self.to_segment() {
            return write!(f, "seg={}", n);
        }
        if let Some(n) = self.to_version() {
            return write!(f, "v={}", n);
        }
        if let Some(n) = self.to_sequence_number() {
            return write!(f, "seq={}", n);
        }
        for &b in &self.0 {
            if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~') {
                write!(f, "{}", b as char)?;
            } else {
                write!(f, "%{:02X}", b)?;
            }
        }
        Ok(())
    }
}

impl FromStr for Component {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        if s.is_empty() {
            return Err(Error::InvalidName("empty component".into()));
        }
        let typed = [
            ("seg=", SEGMENT_MARKER),
            ("v=", VERSION_MARKER),
            ("seq=", SEQUENCE_MARKER),
        ];
        for (prefix, marker) in typed {
            if let Some(num) = s.strip_prefix(prefix) {
                let value = num
                    .parse::<u64>()
                    .map_err(|_| Error::InvalidName(format!("bad number in component {:?}", s)))?;
                return Ok(Component::with_marker(marker, value));
            }
        }
        let bytes = s.as_bytes();
        let mut out = Vec::with_capacity(bytes.len());
        let mut i = 0;
        while i < bytes.len() {
            if bytes[i] == b'%' {
                let hex = s
                    .get(i + 1..i + 3)
                    .ok_or_else(|| Error::InvalidName(format!("truncated escape in {:?}", s)))?;
                if !hex.bytes().all(|c| c.is_ascii_hexdigit()) {
                    return Err(Error::InvalidName(format!("bad escape in {:?}", s)));
                }
                let b = u8::from_str_radix(hex, 16)
                    .map_err(|_| Error::InvalidName(format!("bad escape in {:?}", s)))?;
                out.push(b);
                i += 3;
            } else {
                out.push(bytes[i]);
                i += 1;
            }
        }
        Ok(Component(out))
    }
}

/// Ordered sequence of components. The empty name is the root.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Name(Vec<Component>);

impl Name {
    pub fn new() -> Self {
        Name(Vec::new())
    }

    pub fn from_components(components: Vec<Component>) -> Self {
        Name(components)
    }

    pub fn components(&self) -> &[Component] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Component at `i`; negative indexes count from the end.
    pub fn get(&self, i: isize) -> Option<&Component> {
        let idx = if i < 0 {
            self.0.len().checked_sub(i.unsigned_abs())?
        } else {
            i as usize
        };
        self.0.get(idx)
    }

    pub fn last(&self) -> Option<&Component> {
        self.0.last()
    }

    pub fn append(mut self, component: Component) -> Self {
        self.0.push(component);
        self
    }

    pub fn push(&mut self, component: Component) {
        self.0.push(component);
    }

    pub fn append_segment(self, segment: u64) -> Self {
        self.append(Component::from_segment(segment))
    }

    pub fn append_version(self, version: u64) -> Self {
        self.append(Component::from_version(version))
    }

    pub fn append_sequence_number(self, sequence: u64) -> Self {
        self.append(Component::from_sequence_number(sequence))
    }

    /// First `n` components (the whole name if `n >= len`).
    pub fn prefix(&self, n: usize) -> Name {
        Name(self.0[..n.min(self.0.len())].to_vec())
    }

    pub fn parent(&self) -> Option<Name> {
        if self.0.is_empty() {
            None
        } else {
            Some(self.prefix(self.0.len() - 1))
        }
    }

    pub fn is_prefix_of(&self, other: &Name) -> bool {
        self.0.len() <= other.0.len() && self.0.iter().zip(&other.0).all(|(a, b)| a == b)
    }
}

impl Ord for Name {
    fn cmp(&self, other: &Self) -> Ordering {
        for (a, b) in self.0.iter().zip(&other.0) {
            match a.cmp(b) {
                Ordering::Equal => continue,
                ord => return ord,
            }
        }
        self.0.len().cmp(&other.0.len())
    }
}

impl PartialOrd for Name {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return write!(f, "/");
        }
        for c in &self.0 {
            write!(f, "/{}", c)?;
        }
        Ok(())
    }
}

impl FromStr for Name {
    type Err = Error;

    /// Parse the URI form. Leading slash optional; `/` alone is the root; a
    /// single trailing slash is tolerated, any other empty component is not.
    fn from_str(s: &str) -> Result<Self, Error> {
        let trimmed = s.strip_prefix('/').unwrap_or(s);
        let trimmed = trimmed.strip_suffix('/').unwrap_or(trimmed);
        if trimmed.is_empty() {
            return Ok(Name::new());
        }
        let components = trimmed
            .split('/')
            .map(Component::from_str)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| match e {
                Error::InvalidName(reason) => Error::InvalidName(format!("{}: {}", s, reason)),
                other => other,
            })?;
        Ok(Name(components))
    }
}
