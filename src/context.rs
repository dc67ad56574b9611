//! Versioned, schema-checked context hand-off between stages.
//!
//! This module provides:
//! - `ContextPayload` — the structured document a stage produces
//! - `StageSchema` / `FieldSpec` — the declared contract per stage, one for
//!   the producing side and one for the consuming side
//! - `ContextChain` — validation plus registered version migrations
//!
//! A payload must satisfy *both* the producing stage's output schema and the
//! consuming stage's input schema, since the two contracts evolve
//! independently. Validation is pure: it never touches the worker and never
//! mutates stored state. Once validated, a payload is passed by value into
//! the stage record and never mutated again.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::errors::ValidationError;
use crate::stage::Stage;

/// Current context schema version. Bump when a stage contract changes shape
/// and register a migration from the previous version.
pub const CONTEXT_SCHEMA_VERSION: u32 = 2;

/// JSON kind expected for a schema field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    String,
    Number,
    Bool,
    List,
    Object,
}

impl FieldKind {
    fn matches(&self, value: &Value) -> bool {
        match self {
            FieldKind::String => value.is_string(),
            FieldKind::Number => value.is_number(),
            FieldKind::Bool => value.is_boolean(),
            FieldKind::List => value.is_array(),
            FieldKind::Object => value.is_object(),
        }
    }

    fn name_of(value: &Value) -> &'static str {
        match value {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Array(_) => "list",
            Value::Object(_) => "object",
        }
    }
}

impl std::fmt::Display for FieldKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FieldKind::String => "string",
            FieldKind::Number => "number",
            FieldKind::Bool => "bool",
            FieldKind::List => "list",
            FieldKind::Object => "object",
        };
        write!(f, "{}", name)
    }
}

/// One declared field of a stage contract.
#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
    pub required: bool,
}

const fn req(name: &'static str, kind: FieldKind) -> FieldSpec {
    FieldSpec {
        name,
        kind,
        required: true,
    }
}

const fn opt(name: &'static str, kind: FieldKind) -> FieldSpec {
    FieldSpec {
        name,
        kind,
        required: false,
    }
}

/// The declared contract for one side of a stage boundary.
#[derive(Debug, Clone, Copy)]
pub struct StageSchema {
    pub stage: Stage,
    pub fields: &'static [FieldSpec],
}

/// What each stage must produce.
static OUTPUT_SCHEMAS: [StageSchema; 5] = [
    StageSchema {
        stage: Stage::Requirements,
        fields: &[
            req("summary", FieldKind::String),
            req("requirements", FieldKind::List),
            req("acceptance_criteria", FieldKind::List),
        ],
    },
    StageSchema {
        stage: Stage::Architecture,
        fields: &[
            req("summary", FieldKind::String),
            req("components", FieldKind::List),
            req("interfaces", FieldKind::List),
            opt("decisions", FieldKind::List),
        ],
    },
    StageSchema {
        stage: Stage::Development,
        fields: &[
            req("summary", FieldKind::String),
            req("modules", FieldKind::List),
            opt("tests", FieldKind::List),
        ],
    },
    StageSchema {
        stage: Stage::Qa,
        fields: &[
            req("summary", FieldKind::String),
            req("defects", FieldKind::List),
            opt("verified_modules", FieldKind::List),
        ],
    },
    StageSchema {
        stage: Stage::Integration,
        fields: &[
            req("summary", FieldKind::String),
            req("release_notes", FieldKind::String),
            req("verified", FieldKind::Bool),
        ],
    },
];

/// What each stage requires from its predecessor's output. Requirements is
/// the entry stage and consumes nothing.
static INPUT_SCHEMAS: [StageSchema; 5] = [
    StageSchema {
        stage: Stage::Requirements,
        fields: &[],
    },
    StageSchema {
        stage: Stage::Architecture,
        fields: &[
            req("requirements", FieldKind::List),
            req("acceptance_criteria", FieldKind::List),
        ],
    },
    StageSchema {
        stage: Stage::Development,
        fields: &[
            req("components", FieldKind::List),
            req("interfaces", FieldKind::List),
        ],
    },
    StageSchema {
        stage: Stage::Qa,
        fields: &[req("modules", FieldKind::List)],
    },
    StageSchema {
        stage: Stage::Integration,
        fields: &[req("defects", FieldKind::List)],
    },
];

/// The structured document exchanged between consecutive stages.
///
/// Immutable after validation; stored by value in the stage record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextPayload {
    pub schema_version: u32,
    pub stage: Stage,
    pub fields: BTreeMap<String, Value>,
}

/// Unvalidated worker output: a declared version plus the raw fields body.
#[derive(Debug, Clone)]
pub struct RawPayload {
    pub schema_version: u32,
    pub body: Value,
}

impl RawPayload {
    /// A payload the worker emitted at the current schema version.
    pub fn current(body: Value) -> Self {
        Self {
            schema_version: CONTEXT_SCHEMA_VERSION,
            body,
        }
    }
}

type MigrationFn = fn(BTreeMap<String, Value>) -> Result<BTreeMap<String, Value>, String>;

/// Validates and versions stage hand-off payloads.
///
/// Migrations are registered per `(from, to)` step; a payload at an older
/// version is walked one step at a time up to [`CONTEXT_SCHEMA_VERSION`].
/// A missing step is a hard stop (`UnmigratableContext`), never a silent
/// field drop.
pub struct ContextChain {
    migrations: BTreeMap<(u32, u32), MigrationFn>,
}

impl Default for ContextChain {
    fn default() -> Self {
        Self::new()
    }
}

impl ContextChain {
    /// Chain with the built-in migrations registered.
    pub fn new() -> Self {
        let mut migrations: BTreeMap<(u32, u32), MigrationFn> = BTreeMap::new();
        migrations.insert((1, 2), migrate_v1_to_v2);
        Self { migrations }
    }

    /// Register a migration step. Later registrations replace earlier ones
    /// for the same step.
    pub fn register_migration(&mut self, from: u32, to: u32, migration: MigrationFn) {
        self.migrations.insert((from, to), migration);
    }

    /// The declared output contract for a stage.
    pub fn output_schema(stage: Stage) -> &'static StageSchema {
        &OUTPUT_SCHEMAS[stage.index()]
    }

    /// The declared input contract for a stage.
    pub fn input_schema(stage: Stage) -> &'static StageSchema {
        &INPUT_SCHEMAS[stage.index()]
    }

    /// Validate a worker's raw output against the producing stage's
    /// contract, migrating the payload to the current version first.
    pub fn validate_outbound(
        &self,
        stage: Stage,
        raw: RawPayload,
    ) -> Result<ContextPayload, ValidationError> {
        let Value::Object(body) = raw.body else {
            return Err(ValidationError::NotAnObject {
                actual: FieldKind::name_of(&raw.body).to_string(),
            });
        };
        let fields: BTreeMap<String, Value> = body.into_iter().collect();
        let fields = self.migrate(raw.schema_version, fields)?;

        check_schema(Self::output_schema(stage), stage, &fields)?;

        Ok(ContextPayload {
            schema_version: CONTEXT_SCHEMA_VERSION,
            stage,
            fields,
        })
    }

    /// Validate a stored payload against the consuming stage's contract.
    ///
    /// The payload must have been produced by the consuming stage's
    /// predecessor; a payload recorded at an older schema version is
    /// migrated (the stored copy is left untouched).
    pub fn validate_inbound(
        &self,
        next_stage: Stage,
        payload: &ContextPayload,
    ) -> Result<ContextPayload, ValidationError> {
        if let Some(expected_producer) = predecessor(next_stage)
            && payload.stage != expected_producer
        {
            return Err(ValidationError::StageMismatch {
                expected: expected_producer,
                found: payload.stage,
            });
        }

        let fields = self.migrate(payload.schema_version, payload.fields.clone())?;
        check_schema(Self::input_schema(next_stage), next_stage, &fields)?;

        Ok(ContextPayload {
            schema_version: CONTEXT_SCHEMA_VERSION,
            stage: payload.stage,
            fields,
        })
    }

    /// Walk the payload from `from` to the current version one registered
    /// step at a time.
    fn migrate(
        &self,
        from: u32,
        mut fields: BTreeMap<String, Value>,
    ) -> Result<BTreeMap<String, Value>, ValidationError> {
        if from == CONTEXT_SCHEMA_VERSION {
            return Ok(fields);
        }
        if from > CONTEXT_SCHEMA_VERSION {
            // A payload from the future cannot be downgraded.
            return Err(ValidationError::UnmigratableContext {
                from,
                to: CONTEXT_SCHEMA_VERSION,
            });
        }

        let mut version = from;
        while version < CONTEXT_SCHEMA_VERSION {
            let step = (version, version + 1);
            let Some(migration) = self.migrations.get(&step) else {
                return Err(ValidationError::UnmigratableContext {
                    from,
                    to: CONTEXT_SCHEMA_VERSION,
                });
            };
            fields = migration(fields).map_err(|message| ValidationError::MigrationFailed {
                from: step.0,
                to: step.1,
                message,
            })?;
            version += 1;
        }
        Ok(fields)
    }
}

/// The stage whose output feeds `stage`, or `None` for the entry stage.
fn predecessor(stage: Stage) -> Option<Stage> {
    let idx = stage.index();
    if idx == 0 {
        None
    } else {
        Some(Stage::ALL[idx - 1])
    }
}

fn check_schema(
    schema: &StageSchema,
    stage: Stage,
    fields: &BTreeMap<String, Value>,
) -> Result<(), ValidationError> {
    for spec in schema.fields {
        match fields.get(spec.name) {
            Some(value) => {
                if !spec.kind.matches(value) {
                    return Err(ValidationError::WrongKind {
                        stage,
                        field: spec.name.to_string(),
                        expected: spec.kind,
                        actual: FieldKind::name_of(value).to_string(),
                    });
                }
            }
            None if spec.required => {
                return Err(ValidationError::MissingField {
                    stage,
                    field: spec.name.to_string(),
                });
            }
            None => {}
        }
    }
    Ok(())
}

/// v1 named the acceptance criteria field "criteria"; v2 renamed it.
fn migrate_v1_to_v2(
    mut fields: BTreeMap<String, Value>,
) -> Result<BTreeMap<String, Value>, String> {
    if let Some(value) = fields.remove("criteria") {
        fields.insert("acceptance_criteria".to_string(), value);
    }
    Ok(fields)
}
