// System
use std::{fmt, str::FromStr};

// Third Party
use uuid::Uuid;

// Local
use crate::{
    error::{TraceError, TraceResult},
    utils::OBJECT_NAME_PREFIX,
};

/// Correlation key shared by every cluster object belonging to one trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TraceId(Uuid);

impl TraceId {
    /// Mint a fresh identifier. Collisions are treated as impossible; a resulting name conflict
    /// surfaces as `AlreadyExists` on create.
    pub fn generate() -> Self {
        TraceId(Uuid::new_v4())
    }

    /// Name shared by the job and its config map.
    pub fn object_name(&self) -> String {
        format!("{}{}", OBJECT_NAME_PREFIX, self.0)
    }

    /// Recover the identifier from either a bare id or a prefixed object name.
    pub fn from_object_name(name: &str) -> TraceResult<Self> {
        name.strip_prefix(OBJECT_NAME_PREFIX)
            .unwrap_or(name)
            .parse()
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for TraceId {
    type Err = TraceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(TraceId)
            .map_err(|e| TraceError::InvalidSpec(format!("invalid trace id {:?}: {}", s, e)))
    }
}
