use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::model::Program;

/// Actor-type id used when an environment (or program) declares only a flat
/// actor count.
pub const GENERIC_ACTOR_TYPE: &str = "generic";

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// Concurrency and staffing limits for one task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceConstraint {
    pub task: String,
    /// How many concurrent (fractional) uses of the task are allowed.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: u32,
    /// Actors consumed per full (fraction 1.0) use of the task.
    #[serde(default = "default_actors_required")]
    pub actors_required: f64,
    /// Actor types allowed to perform this task. Empty means "generic" when
    /// the actor pool is a legacy flat count.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub qualified_actor_types: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

fn default_max_concurrent() -> u32 {
    1
}

fn default_actors_required() -> f64 {
    1.0
}

/// A pool of interchangeable workers of one kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActorType {
    pub name: String,
    #[serde(default = "default_actor_count")]
    pub count: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub qualifications: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

fn default_actor_count() -> u32 {
    1
}

/// A named bundle of actor types and task constraints shared by programs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Environment {
    pub environment_id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Legacy flat actor count; superseded by `actorTypes`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actors: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor_types: Option<BTreeMap<String, ActorType>>,
    #[serde(default)]
    pub resource_constraints: Vec<ResourceConstraint>,
}

impl Environment {
    /// The actor pool: declared types, or a synthetic generic pool built from
    /// the legacy `actors` count.
    pub fn actor_pool(&self) -> BTreeMap<String, ActorType> {
        match &self.actor_types {
            Some(types) => types.clone(),
            None => generic_pool(self.actors.unwrap_or(1)),
        }
    }
}

fn generic_pool(count: u32) -> BTreeMap<String, ActorType> {
    let mut pool = BTreeMap::new();
    pool.insert(
        GENERIC_ACTOR_TYPE.to_string(),
        ActorType {
            name: "Generic Actor".to_string(),
            count: count.max(1),
            qualifications: Vec::new(),
            description: None,
        },
    );
    pool
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

/// The effective resource picture for one program: merged constraints, the
/// actor pool, and the implicit per-task limit for undeclared tasks (present
/// only for programs without an environment reference).
#[derive(Debug, Clone)]
pub struct ResolvedResources {
    pub constraints: Vec<ResourceConstraint>,
    pub actor_types: BTreeMap<String, ActorType>,
    pub implicit_limit: Option<u32>,
}

#[derive(Debug, thiserror::Error)]
pub enum EnvironmentError {
    #[error("environment '{0}' not found in catalog")]
    UnknownEnvironment(String),
    #[error("no environment of type '{0}' in catalog")]
    UnknownEnvironmentType(String),
    #[error("environment type '{environment}' does not match program environmentType '{program}'")]
    TypeMismatch { environment: String, program: String },
}

/// An in-memory map of environment id to environment value. Discovery from a
/// directory is the caller's concern; the catalog itself is a plain value.
#[derive(Debug, Clone, Default)]
pub struct EnvironmentCatalog {
    environments: BTreeMap<String, Environment>,
}

impl EnvironmentCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, environment: Environment) {
        self.environments
            .insert(environment.environment_id.clone(), environment);
    }

    pub fn get(&self, environment_id: &str) -> Option<&Environment> {
        self.environments.get(environment_id)
    }

    pub fn list(&self) -> impl Iterator<Item = &Environment> {
        self.environments.values()
    }

    pub fn list_by_type<'a>(&'a self, kind: &'a str) -> impl Iterator<Item = &'a Environment> {
        self.environments.values().filter(move |e| e.kind == kind)
    }

    /// The default environment for a type: prefer ids containing "standard"
    /// or "default", otherwise the first match.
    pub fn default_for_type<'a>(&'a self, kind: &'a str) -> Option<&'a Environment> {
        let mut first = None;
        for env in self.list_by_type(kind) {
            let id = env.environment_id.to_ascii_lowercase();
            if id.contains("standard") || id.contains("default") {
                return Some(env);
            }
            if first.is_none() {
                first = Some(env);
            }
        }
        first
    }

    /// Resolve the effective constraints and actor pool for a program.
    ///
    /// Inline constraints override environment constraints per task. Programs
    /// with no environment reference fall back to a generic actor pool and an
    /// implicit per-task limit equal to their `actors` count (1 if unset).
    pub fn resolve(&self, program: &Program) -> Result<ResolvedResources, EnvironmentError> {
        let environment = match (&program.environment, &program.environment_type) {
            (Some(id), _) => Some(
                self.get(id)
                    .ok_or_else(|| EnvironmentError::UnknownEnvironment(id.clone()))?,
            ),
            (None, Some(kind)) => Some(
                self.default_for_type(kind)
                    .ok_or_else(|| EnvironmentError::UnknownEnvironmentType(kind.clone()))?,
            ),
            (None, None) => None,
        };

        if let (Some(env), Some(kind)) = (environment, &program.environment_type) {
            if &env.kind != kind {
                return Err(EnvironmentError::TypeMismatch {
                    environment: env.kind.clone(),
                    program: kind.clone(),
                });
            }
        }

        let program_constraints = program.resource_constraints.clone().unwrap_or_default();
        let mut constraints = match environment {
            Some(env) => merge_constraints(program_constraints, &env.resource_constraints),
            None => program_constraints,
        };

        let actor_types = match environment {
            Some(env) => env.actor_pool(),
            None => generic_pool(program.actors.unwrap_or(1)),
        };

        // A synthetic generic pool qualifies every constraint that names no
        // actor types.
        let legacy_pool = actor_types.len() == 1 && actor_types.contains_key(GENERIC_ACTOR_TYPE);
        if legacy_pool {
            for constraint in constraints.iter_mut() {
                if constraint.qualified_actor_types.is_empty() {
                    constraint
                        .qualified_actor_types
                        .push(GENERIC_ACTOR_TYPE.to_string());
                }
            }
        }

        let implicit_limit = match environment {
            Some(_) => None,
            None => Some(program.actors.unwrap_or(1).max(1)),
        };

        Ok(ResolvedResources {
            constraints,
            actor_types,
            implicit_limit,
        })
    }
}

/// Merge program constraints over environment constraints. Environment order
/// is preserved; program entries replace same-task entries and any leftovers
/// are appended.
fn merge_constraints(
    program_constraints: Vec<ResourceConstraint>,
    environment_constraints: &[ResourceConstraint],
) -> Vec<ResourceConstraint> {
    let mut overrides: BTreeMap<String, ResourceConstraint> = program_constraints
        .into_iter()
        .map(|c| (c.task.clone(), c))
        .collect();

    let mut merged = Vec::with_capacity(environment_constraints.len());
    for env_constraint in environment_constraints {
        match overrides.remove(&env_constraint.task) {
            Some(program_constraint) => merged.push(program_constraint),
            None => merged.push(env_constraint.clone()),
        }
    }
    merged.extend(overrides.into_values());
    merged
}

/// Parse an environment document (JSON value) after time-field normalization.
pub fn environment_from_value(
    mut value: serde_json::Value,
) -> Result<Environment, serde_json::Error> {
    crate::time::normalize_time_fields(&mut value);
    serde_json::from_value(value)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
