//! Revision identifiers and revision records.

use crate::error::{ProtocolError, ProtocolResult};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// A revision identifier of the form `<generation>-<digest>`.
///
/// Ordering compares the generation first and the digest second, which is
/// also the order used to pick a deterministic winner among leaves.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RevisionId {
    generation: u64,
    digest: String,
}

impl RevisionId {
    /// Creates a revision id from its parts.
    pub fn new(generation: u64, digest: impl Into<String>) -> ProtocolResult<Self> {
        let digest = digest.into();
        if generation == 0 {
            return Err(ProtocolError::InvalidRevisionId {
                value: format!("{}-{}", generation, digest),
                reason: "generation must be at least 1",
            });
        }
        if generation == u64::MAX {
            return Err(ProtocolError::InvalidRevisionId {
                value: format!("{}-{}", generation, digest),
                reason: "generation out of range",
            });
        }
        if digest.is_empty() {
            return Err(ProtocolError::InvalidRevisionId {
                value: format!("{}-", generation),
                reason: "empty digest",
            });
        }
        Ok(Self { generation, digest })
    }

    /// Derives the id of a new revision.
    ///
    /// The generation is one more than the parent's (1 for a root) and the
    /// digest covers the parent id, the deleted flag, the body and the
    /// attachments.
    pub fn next(
        parent: Option<&RevisionId>,
        body: &Value,
        deleted: bool,
        attachments: &BTreeMap<String, Attachment>,
    ) -> Self {
        let mut hasher = Sha256::new();
        if let Some(parent) = parent {
            hasher.update(parent.to_string().as_bytes());
        }
        hasher.update([u8::from(deleted)]);
        hasher.update(body.to_string().as_bytes());
        for (name, attachment) in attachments {
            hasher.update(name.as_bytes());
            hasher.update(attachment.content_type.as_bytes());
            hasher.update(&attachment.data);
        }
        let hash = hasher.finalize();

        Self {
            generation: parent.map_or(1, |p| p.generation.saturating_add(1)),
            digest: hex::encode(&hash[..16]),
        }
    }

    /// Returns the generation number.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns the digest part.
    pub fn digest(&self) -> &str {
        &self.digest
    }
}

impl fmt::Display for RevisionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.generation, self.digest)
    }
}

impl FromStr for RevisionId {
    type Err = ProtocolError;

    fn from_str(s: &str) -> ProtocolResult<Self> {
        let (generation, digest) = s.split_once('-').ok_or(ProtocolError::InvalidRevisionId {
            value: s.to_string(),
            reason: "missing '-' separator",
        })?;
        let generation = generation
            .parse::<u64>()
            .map_err(|_| ProtocolError::InvalidRevisionId {
                value: s.to_string(),
                reason: "generation is not a number",
            })?;
        Self::new(generation, digest)
    }
}

impl TryFrom<String> for RevisionId {
    type Error = ProtocolError;

    fn try_from(value: String) -> ProtocolResult<Self> {
        value.parse()
    }
}

impl From<RevisionId> for String {
    fn from(id: RevisionId) -> Self {
        id.to_string()
    }
}

/// Binary attachment carried by a revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    /// MIME type.
    pub content_type: String,
    /// Raw bytes, base64 on the wire.
    #[serde(serialize_with = "encode_base64", deserialize_with = "decode_base64")]
    pub data: Vec<u8>,
}

impl Attachment {
    /// Creates a new attachment.
    pub fn new(content_type: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            content_type: content_type.into(),
            data: data.into(),
        }
    }
}

fn encode_base64<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&STANDARD.encode(data))
}

fn decode_base64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
    let encoded = String::deserialize(deserializer)?;
    STANDARD
        .decode(encoded.as_bytes())
        .map_err(serde::de::Error::custom)
}

/// One revision of a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Revision {
    /// This revision's id.
    #[serde(rename = "_rev")]
    pub id: RevisionId,
    /// Parent revision, `None` only for generation 1.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<RevisionId>,
    /// Tombstone marker.
    #[serde(default, rename = "_deleted", skip_serializing_if = "std::ops::Not::not")]
    pub deleted: bool,
    /// Opaque JSON payload.
    #[serde(default)]
    pub body: Value,
    /// Named attachments.
    #[serde(
        default,
        rename = "_attachments",
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub attachments: BTreeMap<String, Attachment>,
}

impl Revision {
    /// Creates a revision on top of `parent` (or a root when `None`).
    pub fn new(
        parent: Option<&RevisionId>,
        body: Value,
        deleted: bool,
        attachments: BTreeMap<String, Attachment>,
    ) -> Self {
        Self {
            id: RevisionId::next(parent, &body, deleted, &attachments),
            parent: parent.cloned(),
            deleted,
            body,
            attachments,
        }
    }

    /// Creates a generation-1 revision.
    pub fn root(body: Value) -> Self {
        Self::new(None, body, false, BTreeMap::new())
    }

    /// Creates a child revision carrying a new body.
    pub fn child(&self, body: Value) -> Self {
        Self::new(Some(&self.id), body, false, BTreeMap::new())
    }

    /// Creates a deletion marker on top of this revision.
    pub fn tombstone(&self) -> Self {
        Self::new(Some(&self.id), Value::Null, true, BTreeMap::new())
    }

    /// Checks the generation/parent invariant.
    pub fn validate(&self) -> ProtocolResult<()> {
        match &self.parent {
            None if self.id.generation() != 1 => Err(ProtocolError::InvalidRevision {
                revision: self.id.to_string(),
                reason: "only generation 1 may have no parent".into(),
            }),
            Some(parent) if parent.generation().checked_add(1) != Some(self.id.generation()) => {
                Err(ProtocolError::InvalidRevision {
                    revision: self.id.to_string(),
                    reason: format!("parent {} is not exactly one generation older", parent),
                })
            }
            _ => Ok(()),
        }
    }
}

/// A document id plus one history path, ordered root to leaf.
///
/// The ancestors travel with the leaf so the receiving side can attach a
/// branch at the right place in its own tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRevs {
    /// Document id.
    pub id: String,
    /// History path, oldest first.
    pub revisions: Vec<Revision>,
}

impl DocumentRevs {
    /// Creates a new path record.
    pub fn new(id: impl Into<String>, revisions: Vec<Revision>) -> Self {
        Self {
            id: id.into(),
            revisions,
        }
    }

    /// Returns the newest revision of the path.
    pub fn leaf(&self) -> Option<&Revision> {
        self.revisions.last()
    }

    /// Checks that every revision is valid and each one is the child of
    /// its predecessor.
    pub fn validate(&self) -> ProtocolResult<()> {
        validate_path(&self.id, &self.revisions)
    }
}

pub(crate) fn validate_path(doc_id: &str, revisions: &[Revision]) -> ProtocolResult<()> {
    if revisions.is_empty() {
        return Err(ProtocolError::InvalidPath {
            doc_id: doc_id.to_string(),
            reason: "empty path".into(),
        });
    }
    for revision in revisions {
        revision.validate()?;
    }
    for pair in revisions.windows(2) {
        if pair[1].parent.as_ref() != Some(&pair[0].id) {
            return Err(ProtocolError::InvalidPath {
                doc_id: doc_id.to_string(),
                reason: format!("{} does not descend from {}", pair[1].id, pair[0].id),
            });
        }
    }
    Ok(())
}
