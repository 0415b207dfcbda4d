//! Typed form of a validated DSL document.
//!
//! Deserialization only runs after [`validate`] has accepted the raw YAML,
//! so the serde layer never produces user-facing errors.
//!
//! [`validate`]: crate::dsl::parse

use std::collections::BTreeMap;

use error_stack::{Report, ResultExt};
use serde::Deserialize;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

use crate::{dsl::ValidationError, model::DataFrameAction};

#[derive(Debug, Default, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Document {
    #[serde(default)]
    pub define_entities: Vec<EntityDef>,
    #[serde(default)]
    pub add_projections: Vec<ProjectionDef>,
    #[serde(default)]
    pub add_change_set: Vec<ChangeSetDef>,
    #[serde(default)]
    pub add_hooks: Vec<HookDef>,
}

impl Document {
    /// Whether the document contains no instructions at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.define_entities.is_empty()
            && self.add_projections.is_empty()
            && self.add_change_set.is_empty()
            && self.add_hooks.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EntityDef {
    pub name: String,
    pub version: i32,
    pub fields: Vec<FieldDef>,
    pub identified_by: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FieldDef {
    pub name: String,
    /// A database column type, passed through opaquely. Unknown types surface
    /// as the database's own error at DDL time.
    #[serde(rename = "type")]
    pub column_type: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ProjectionDef {
    pub name: String,
    pub version: i32,
    pub dependencies: Vec<DependencyDef>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DependencyDef {
    pub entity: String,
    pub version: i32,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ChangeSetDef {
    #[serde(default)]
    pub description: Option<String>,
    /// RFC 3339 timestamp; kept as text until apply time.
    pub effective: String,
    pub frames: Vec<FrameDef>,
}

impl ChangeSetDef {
    /// # Errors
    ///
    /// - if `effective` is not RFC 3339 (validation normally rules this out).
    pub fn effective_timestamp(&self) -> Result<OffsetDateTime, Report<ValidationError>> {
        OffsetDateTime::parse(&self.effective, &Rfc3339)
            .change_context(ValidationError::new(
                "/add_change_set",
                "must match format 'date-time'",
            ))
            .attach_printable_lazy(|| self.effective.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FrameDef {
    pub entity: String,
    pub version: i32,
    pub action: DataFrameAction,
    pub data: Vec<BTreeMap<String, serde_yaml::Value>>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct HookDef {
    pub name: String,
    pub event: String,
    #[serde(default)]
    pub projection: Option<String>,
    #[serde(default)]
    pub version: Option<i32>,
}
