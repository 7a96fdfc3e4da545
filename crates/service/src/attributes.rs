//! Notification attributes and the observation set.
//!
//! Attributes hang off object, instance or resource paths and inherit
//! downwards: the most specific level that carries a value for a given
//! attribute wins, level by level, falling back to the session defaults.
//! Observations hold only the path, never a pointer into the store; the
//! value is re-resolved at every emission.

use std::net::SocketAddr;
use std::time::Instant;

use ahash::{HashMap, HashMapExt};

use codec::{ContentFormat, path::Path};

use crate::Error;

/// The pmin/pmax/gt/lt/st pacing parameters of the Information Reporting
/// interface. Absent fields inherit.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct NotificationAttributes {
    pub pmin: Option<u32>,
    pub pmax: Option<u32>,
    pub gt: Option<f64>,
    pub lt: Option<f64>,
    pub step: Option<f64>,
}

impl NotificationAttributes {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Fill absent fields from `other`, attribute by attribute.
    fn inherit(&self, other: &NotificationAttributes) -> Self {
        Self {
            pmin: self.pmin.or(other.pmin),
            pmax: self.pmax.or(other.pmax),
            gt: self.gt.or(other.gt),
            lt: self.lt.or(other.lt),
            step: self.step.or(other.step),
        }
    }

    /// Parse a Write-Attributes query list.
    ///
    /// Returns the parsed attributes and whether `cancel` was present.
    ///
    /// # Test
    ///
    /// ```
    /// use lwm2m_stack_service::attributes::NotificationAttributes;
    ///
    /// let (attributes, cancel) = NotificationAttributes::parse_query(&[
    ///     "pmin=5".to_string(),
    ///     "gt=20.5".to_string(),
    /// ])
    /// .unwrap();
    ///
    /// assert_eq!(attributes.pmin, Some(5));
    /// assert_eq!(attributes.gt, Some(20.5));
    /// assert_eq!(attributes.pmax, None);
    /// assert!(!cancel);
    /// ```
    pub fn parse_query(query: &[String]) -> Result<(Self, bool), Error> {
        let mut attributes = Self::default();
        let mut cancel = false;

        for entry in query {
            if entry == "cancel" {
                cancel = true;
                continue;
            }

            let (name, value) = entry.split_once('=').ok_or(Error::PathInvalid)?;
            match name {
                "pmin" => {
                    attributes.pmin = Some(value.parse().map_err(|_| Error::PathInvalid)?);
                }
                "pmax" => {
                    attributes.pmax = Some(value.parse().map_err(|_| Error::PathInvalid)?);
                }
                "gt" => attributes.gt = Some(value.parse().map_err(|_| Error::PathInvalid)?),
                "lt" => attributes.lt = Some(value.parse().map_err(|_| Error::PathInvalid)?),
                "st" => {
                    attributes.step = Some(value.parse().map_err(|_| Error::PathInvalid)?);
                }
                _ => return Err(Error::PathInvalid),
            }
        }

        Ok((attributes, cancel))
    }
}

/// Per-path attribute storage with level inheritance.
#[derive(Debug, Default)]
pub struct AttributeStore {
    entries: HashMap<Path, NotificationAttributes>,
    defaults: NotificationAttributes,
}

impl AttributeStore {
    pub fn new(defaults: NotificationAttributes) -> Self {
        Self {
            entries: HashMap::new(),
            defaults,
        }
    }

    /// Merge `attributes` into the entry at `path`; present fields
    /// overwrite, absent fields keep their stored value.
    pub fn set(&mut self, path: Path, attributes: NotificationAttributes) {
        let entry = self.entries.entry(path).or_default();

        if attributes.pmin.is_some() {
            entry.pmin = attributes.pmin;
        }

        if attributes.pmax.is_some() {
            entry.pmax = attributes.pmax;
        }

        if attributes.gt.is_some() {
            entry.gt = attributes.gt;
        }

        if attributes.lt.is_some() {
            entry.lt = attributes.lt;
        }

        if attributes.step.is_some() {
            entry.step = attributes.step;
        }
    }

    pub fn clear(&mut self, path: &Path) {
        self.entries.remove(path);
    }

    /// Resolve the effective attributes at `path`: most-specific non-empty
    /// level wins per attribute, then the session defaults.
    pub fn resolve(&self, path: &Path) -> NotificationAttributes {
        let mut resolved = NotificationAttributes::default();

        let mut level = Some(*path);
        while let Some(current) = level {
            if let Some(entry) = self.entries.get(&current) {
                resolved = resolved.inherit(entry);
            }

            level = current.parent();
        }

        resolved.inherit(&self.defaults)
    }
}

/// One observation: `(peer, token, path)` plus pacing state.
#[derive(Debug)]
pub struct Observation {
    pub peer: SocketAddr,
    pub token: Vec<u8>,
    pub path: Path,
    pub format: ContentFormat,
    sequence: u32,
    pub last_emit: Option<Instant>,
    pub last_numeric: Option<f64>,
    pub pending: bool,
}

impl Observation {
    /// The next Observe option value; strictly monotonic per observation,
    /// wrapping at the option's 24-bit width.
    pub fn next_sequence(&mut self) -> u32 {
        let sequence = self.sequence;
        self.sequence = (self.sequence + 1) & 0x00FF_FFFF;
        sequence
    }
}

/// All live observations of a session.
#[derive(Debug, Default)]
pub struct ObserverSet {
    observations: Vec<Observation>,
}

impl ObserverSet {
    /// Install an observation, replacing any prior one under the same
    /// `(peer, token, path)` key. A different token from the same peer on
    /// the same path is a distinct observation.
    pub fn observe(
        &mut self,
        peer: SocketAddr,
        token: &[u8],
        path: Path,
        format: ContentFormat,
    ) -> &mut Observation {
        self.cancel(peer, token, &path);

        self.observations.push(Observation {
            peer,
            token: token.to_vec(),
            path,
            format,
            sequence: 0,
            last_emit: None,
            last_numeric: None,
            pending: false,
        });

        self.observations.last_mut().unwrap()
    }

    /// Remove the observation identified by `(peer, token, path)`.
    pub fn cancel(&mut self, peer: SocketAddr, token: &[u8], path: &Path) -> bool {
        let before = self.observations.len();
        self.observations
            .retain(|it| !(it.peer == peer && it.token == token && it.path == *path));

        self.observations.len() != before
    }

    /// Remove every observation this peer holds on `path`, whatever token
    /// established it. Write-Attributes `cancel` addresses the path, not
    /// one observe relation.
    pub fn cancel_path(&mut self, peer: SocketAddr, path: &Path) -> bool {
        let before = self.observations.len();
        self.observations
            .retain(|it| !(it.peer == peer && it.path == *path));

        self.observations.len() != before
    }

    pub fn cancel_peer(&mut self, peer: SocketAddr) {
        self.observations.retain(|it| it.peer != peer);
    }

    pub fn clear(&mut self) {
        self.observations.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Observation> {
        self.observations.iter_mut()
    }

    /// Mark every observation covering `path` as having a pending change.
    pub fn mark_changed(&mut self, path: &Path) {
        for observation in &mut self.observations {
            if observation.path.covers(path) {
                observation.pending = true;
            }
        }
    }
}
