//! Record keys, raw payloads and the read-side projection

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::codec::{self, PayloadCodec};
use crate::error::{MergelineError, Result};
use crate::model::surrogate::SurrogateId;

/// Small integer code identifying a record's logical type. The id ↔ name
/// mapping is owned by the embedding system.
pub type ResourceTypeId = i16;

/// Serialization format of a stored payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceFormat {
    Json,
    Xml,
}

impl Default for ResourceFormat {
    fn default() -> Self {
        ResourceFormat::Json
    }
}

/// Write operation that produced a record version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteMethod {
    Post,
    Put,
    Delete,
}

impl WriteMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            WriteMethod::Post => "POST",
            WriteMethod::Put => "PUT",
            WriteMethod::Delete => "DELETE",
        }
    }
}

impl fmt::Display for WriteMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies a specific record version, or the current version when
/// `version` is absent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceKey {
    pub resource_type_id: ResourceTypeId,
    pub resource_id: String,
    pub version: Option<String>,
}

impl ResourceKey {
    /// Key for the current version of a resource.
    pub fn current(resource_type_id: ResourceTypeId, resource_id: impl Into<String>) -> Self {
        Self {
            resource_type_id,
            resource_id: resource_id.into(),
            version: None,
        }
    }

    /// Key for one specific version of a resource.
    pub fn versioned(
        resource_type_id: ResourceTypeId,
        resource_id: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            resource_type_id,
            resource_id: resource_id.into(),
            version: Some(version.into()),
        }
    }
}

/// Surrogate-addressed key as stored on disk: type, id, position in the
/// global version order, plus the version string and deleted flag of that row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceDateKey {
    pub resource_type_id: ResourceTypeId,
    pub resource_id: String,
    pub surrogate_id: SurrogateId,
    pub version: Option<String>,
    pub is_deleted: bool,
}

/// Stored payload: either a real compressed blob or the tombstone marker left
/// by a rolled-back transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Compressed(Bytes),
    Invisible,
}

/// Lazily-materialized payload plus its format tag and a flag recording
/// whether metadata was already embedded at write time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResource {
    payload: Payload,
    pub format: ResourceFormat,
    pub meta_set: bool,
}

impl RawResource {
    /// Wrap payload bytes as they came off the wire, recognizing the
    /// tombstone sentinel without touching the decompression path.
    pub fn from_stored(payload: Bytes, format: ResourceFormat, meta_set: bool) -> Self {
        if codec::is_tombstone(&payload) {
            return Self::invisible();
        }
        Self {
            payload: Payload::Compressed(payload),
            format,
            meta_set,
        }
    }

    /// The marker for a rolled-back record version.
    pub fn invisible() -> Self {
        Self {
            payload: Payload::Invisible,
            format: ResourceFormat::Json,
            meta_set: false,
        }
    }

    pub fn is_invisible(&self) -> bool {
        matches!(self.payload, Payload::Invisible)
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Compressed bytes of a real payload; `None` for the tombstone marker.
    pub fn compressed_bytes(&self) -> Option<&Bytes> {
        match &self.payload {
            Payload::Compressed(bytes) => Some(bytes),
            Payload::Invisible => None,
        }
    }

    /// Materialize the payload text. This is the only place decompression
    /// happens; callers that never look at the payload never pay for it.
    pub fn decode(&self, codec: &dyn PayloadCodec) -> Result<String> {
        match &self.payload {
            Payload::Compressed(bytes) => codec.decompress(bytes),
            Payload::Invisible => Err(MergelineError::codec_msg(
                "tombstoned record version has no payload",
            )),
        }
    }
}

/// Read-side projection of one stored record version.
#[derive(Debug, Clone)]
pub struct ResourceWrapper {
    pub resource_id: String,
    pub version: String,
    pub resource_type_id: ResourceTypeId,
    pub resource_type_name: String,
    pub raw_resource: RawResource,
    pub request_method: Option<WriteMethod>,
    /// Derived from the surrogate id, not stored separately.
    pub last_modified: DateTime<Utc>,
    pub is_deleted: bool,
    pub is_history: bool,
    pub search_param_hash: Option<String>,
    pub surrogate_id: SurrogateId,
}

impl ResourceWrapper {
    /// Whether this wrapper resolves to the tombstone marker. Such wrappers
    /// are excluded from reads unless the caller opted into invisible rows.
    pub fn is_invisible(&self) -> bool {
        self.raw_resource.is_invisible()
    }

    /// Version-qualified key addressing exactly this wrapper.
    pub fn key(&self) -> ResourceKey {
        ResourceKey::versioned(self.resource_type_id, self.resource_id.clone(), self.version.clone())
    }
}
