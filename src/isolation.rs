//! Stream isolation classifier
//!
//! Groups concurrently observed streams into circuits: equivalence classes
//! of streams whose isolation-relevant attributes agree. Streams in one
//! circuit share an isolation token; streams in different circuits never
//! do, so a plugin cannot correlate lookups made on behalf of unrelated
//! identities.
//!
//! Packing is first-fit in circuit creation order. A stream joins the first
//! circuit whose every member it is compatible with, and is never moved
//! afterwards. A new epoch discards every circuit.

use std::collections::{BTreeMap, BTreeSet};

/// Field name → value, per stream
pub type IsolationAttributes = BTreeMap<String, String>;

/// Comma-separated list of the fields a stream is isolated on
pub const ISO_FIELDS_KEY: &str = "ISO_FIELDS";

fn iso_fields(attrs: &IsolationAttributes) -> impl Iterator<Item = &str> {
    attrs
        .get(ISO_FIELDS_KEY)
        .map(String::as_str)
        .unwrap_or("")
        .split(',')
        .filter(|f| !f.is_empty())
}

/// Two streams are compatible when every field either of them is isolated
/// on has the same value in both, where "absent" only matches "absent".
pub fn streams_compatible(a: &IsolationAttributes, b: &IsolationAttributes) -> bool {
    let fields: BTreeSet<&str> = iso_fields(a).chain(iso_fields(b)).collect();
    fields.into_iter().all(|field| a.get(field) == b.get(field))
}

/// An equivalence class of mutually compatible streams
#[derive(Debug, Clone)]
pub struct Circuit {
    pub id: u64,
    pub members: Vec<IsolationAttributes>,
}

impl Circuit {
    /// Compatible with every member, not just a representative
    pub fn accepts(&self, attrs: &IsolationAttributes) -> bool {
        self.members.iter().all(|member| streams_compatible(member, attrs))
    }
}

/// Epoch-scoped first-fit circuit classifier
#[derive(Debug, Clone)]
pub struct IsolationClassifier {
    epoch: Option<String>,
    circuits: Vec<Circuit>,
    /// Last id handed out; never rewound, so ids from an old epoch are not reissued
    last_id: u64,
}

impl Default for IsolationClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl IsolationClassifier {
    /// Empty classifier with no epoch seen yet
    pub fn new() -> Self {
        Self {
            epoch: None,
            circuits: Vec::new(),
            last_id: 0,
        }
    }

    /// Assign `attrs` to a circuit and return the circuit id
    pub fn classify(&mut self, epoch: &str, attrs: IsolationAttributes) -> u64 {
        if self.epoch.as_deref() != Some(epoch) {
            if self.epoch.is_some() {
                tracing::info!(
                    epoch = %epoch,
                    discarded = self.circuits.len(),
                    "New nym epoch; cleared isolation history"
                );
            }
            self.epoch = Some(epoch.to_string());
            self.circuits.clear();
        }

        if !attrs.contains_key(ISO_FIELDS_KEY) {
            tracing::warn!(
                "Isolation fields are missing; stream isolation won't work properly. \
                 Maybe the Tor daemon is outdated?"
            );
        }

        if let Some(circuit) = self.circuits.iter_mut().find(|c| c.accepts(&attrs)) {
            circuit.members.push(attrs);
            return circuit.id;
        }

        self.last_id += 1;
        let id = self.last_id;
        tracing::debug!(circuit = id, "Assigning clean circuit");
        self.circuits.push(Circuit {
            id,
            members: vec![attrs],
        });
        id
    }

    /// Epoch of the current circuit set
    pub fn epoch(&self) -> Option<&str> {
        self.epoch.as_deref()
    }

    /// Circuits opened in the current epoch, in creation order
    pub fn circuits(&self) -> &[Circuit] {
        &self.circuits
    }
}
