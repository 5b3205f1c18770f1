use serde::{Deserialize, Serialize};

use crate::environment::ResourceConstraint;
use crate::time::{flexible_seconds, normalize_time_fields, Duration};
use crate::trigger::{StartTrigger, Trigger};

// ---------------------------------------------------------------------------
// Step-level building blocks
// ---------------------------------------------------------------------------

/// A fractional claim on one task ("mixing at 0.5").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskShare {
    pub name: String,
    pub fraction: f64,
}

/// What kind of payload a step's code block carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CodeKind {
    #[serde(rename = "script", alias = "python")]
    InlineScript,
    #[serde(rename = "shell", alias = "sh")]
    ShellCommand,
}

/// A one-shot payload executed when the step starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeBlock {
    #[serde(rename = "type")]
    pub kind: CodeKind,
    #[serde(rename = "code")]
    pub source: String,
}

/// A pre- or post-step window that reserves tasks without running the step's
/// main work. Consumed by the validator's task-closure check.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Buffer {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tasks: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub task_resources: Vec<TaskShare>,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub seconds: u64,
}

fn is_zero(v: &u64) -> bool {
    *v == 0
}

// ---------------------------------------------------------------------------
// Steps and tracks
// ---------------------------------------------------------------------------

pub const DEFAULT_PRIORITY: i32 = 100;

fn default_priority() -> i32 {
    DEFAULT_PRIORITY
}

fn is_default_priority(p: &i32) -> bool {
    *p == DEFAULT_PRIORITY
}

/// One unit of scheduled work.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    pub step_id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Lower numbers are admitted first. Ties fall back to definition order.
    #[serde(
        default = "default_priority",
        skip_serializing_if = "is_default_priority"
    )]
    pub priority: i32,
    pub start_trigger: StartTrigger,
    pub duration: Duration,
    /// Sugar for a single task at full share.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,
    /// Additional tasks at full share.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tasks: Vec<String>,
    /// Explicit fractional shares; these override the full-share defaults.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub task_resources: Vec<TaskShare>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_buffer: Option<Buffer>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_buffer: Option<Buffer>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_block: Option<CodeBlock>,
    /// Opaque equipment ids; only the planner's usage profiles read these.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<String>,
}

impl Step {
    /// The merged `(task, fraction)` view: `task` and `tasks` entries claim a
    /// full share, `taskResources` entries set or override fractions.
    pub fn task_shares(&self) -> Vec<(String, f64)> {
        let mut shares: Vec<(String, f64)> = Vec::new();

        let mut push = |shares: &mut Vec<(String, f64)>, name: &str, fraction: f64, replace: bool| {
            match shares.iter_mut().find(|(n, _)| n == name) {
                Some((_, f)) => {
                    if replace {
                        *f = fraction;
                    }
                }
                None => shares.push((name.to_string(), fraction)),
            }
        };

        if let Some(task) = &self.task {
            push(&mut shares, task, 1.0, false);
        }
        for task in &self.tasks {
            push(&mut shares, task, 1.0, false);
        }
        for share in &self.task_resources {
            push(&mut shares, &share.name, share.fraction, true);
        }

        shares
    }

    /// Every task name this step touches, including buffer windows.
    pub fn all_task_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.task_shares().into_iter().map(|(n, _)| n).collect();
        for buffer in [&self.pre_buffer, &self.post_buffer].into_iter().flatten() {
            for task in &buffer.tasks {
                if !names.iter().any(|n| n == task) {
                    names.push(task.clone());
                }
            }
            for share in &buffer.task_resources {
                if !names.iter().any(|n| n == &share.name) {
                    names.push(share.name.clone());
                }
            }
        }
        names
    }

    /// Manual trigger names attached to this step, from the start trigger and
    /// from a variable/indefinite duration.
    pub fn manual_trigger_names(&self) -> Vec<String> {
        let mut names = self.start_trigger.manual_names();
        if let Some(name) = self.duration.manual_trigger() {
            if !names.iter().any(|n| n == name) {
                names.push(name.to_string());
            }
        }
        names
    }
}

/// An opaque track template; only the id is interpreted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackTemplate {
    pub template_id: String,
    #[serde(flatten)]
    pub payload: serde_json::Map<String, serde_json::Value>,
}

fn default_batch_size() -> u32 {
    1
}

fn is_default_batch(v: &u32) -> bool {
    *v <= 1
}

/// An ordered sequence of steps that executes sequentially, in parallel with
/// other tracks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Track {
    pub track_id: String,
    pub name: String,
    #[serde(default)]
    pub steps: Vec<Step>,
    /// Materializes this track `batch_size` times at run time.
    #[serde(
        rename = "batch_size",
        alias = "batchSize",
        default = "default_batch_size",
        skip_serializing_if = "is_default_batch"
    )]
    pub batch_size: u32,
    /// Seconds added between successive batches' program-relative triggers.
    #[serde(
        rename = "stagger",
        alias = "staggerSeconds",
        alias = "stagger_seconds",
        default,
        deserialize_with = "flexible_seconds",
        skip_serializing_if = "is_zero"
    )]
    pub stagger_seconds: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_id: Option<String>,
}

// ---------------------------------------------------------------------------
// Program
// ---------------------------------------------------------------------------

/// Immutable program configuration: tracks of steps plus one resource source
/// (inline constraints, an environment reference, or a flat actor count).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Program {
    pub program_id: String,
    pub name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_trigger: Option<StartTrigger>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_constraints: Option<Vec<ResourceConstraint>>,
    /// Environment id reference.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
    /// Environment type reference; resolved to a concrete environment by the
    /// catalog.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment_type: Option<String>,
    /// Flat actor count; the implicit limit for undeclared tasks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actors: Option<u32>,
    #[serde(default)]
    pub tracks: Vec<Track>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub track_templates: Vec<TrackTemplate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl Program {
    /// Iterate `(track, step)` pairs in definition order.
    pub fn steps(&self) -> impl Iterator<Item = (&Track, &Step)> {
        self.tracks
            .iter()
            .flat_map(|track| track.steps.iter().map(move |step| (track, step)))
    }

    pub fn find_step(&self, step_id: &str) -> Option<&Step> {
        self.steps()
            .map(|(_, step)| step)
            .find(|step| step.step_id == step_id)
    }

    pub fn step_count(&self) -> usize {
        self.tracks.iter().map(|t| t.steps.len()).sum()
    }
}

// ---------------------------------------------------------------------------
// Document ingest
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocFormat {
    Json,
    Yaml,
}

impl DocFormat {
    /// Guess the format from a file extension; JSON is the default.
    pub fn from_extension(path: &str) -> Self {
        let lower = path.to_ascii_lowercase();
        if lower.ends_with(".yaml") || lower.ends_with(".yml") {
            DocFormat::Yaml
        } else {
            DocFormat::Json
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Rewrite legacy document shapes to the canonical form: time strings become
/// integer seconds, the old `trigger` key becomes `startTrigger`, and steps
/// with no trigger at all default to program start.
pub fn normalize_program_document(value: &mut serde_json::Value) {
    normalize_time_fields(value);

    let Some(tracks) = value.get_mut("tracks").and_then(|t| t.as_array_mut()) else {
        return;
    };
    for track in tracks {
        let Some(steps) = track.get_mut("steps").and_then(|s| s.as_array_mut()) else {
            continue;
        };
        for step in steps.iter_mut() {
            let Some(obj) = step.as_object_mut() else {
                continue;
            };
            if let Some(old) = obj.remove("trigger") {
                let converted = convert_legacy_trigger(&old, obj);
                obj.insert("startTrigger".to_string(), converted);
            }
            if !obj.contains_key("startTrigger") {
                obj.insert(
                    "startTrigger".to_string(),
                    serde_json::json!({ "type": "programStart" }),
                );
            }
        }
    }
}

fn convert_legacy_trigger(
    old: &serde_json::Value,
    step: &serde_json::Map<String, serde_json::Value>,
) -> serde_json::Value {
    let step_id = step.get("stepId").and_then(|v| v.as_str()).unwrap_or("");
    if let Some(obj) = old.as_object() {
        match obj.get("type").and_then(|t| t.as_str()) {
            Some("programStart") => return serde_json::json!({ "type": "programStart" }),
            Some("manual") => {
                // Legacy manual triggers carried no name; route by step id.
                let name = obj
                    .get("triggerName")
                    .and_then(|v| v.as_str())
                    .unwrap_or(step_id);
                return serde_json::json!({ "type": "manual", "triggerName": name });
            }
            Some("afterStep") | Some("stepComplete") => {
                return serde_json::json!({
                    "type": "afterStep",
                    "stepId": obj.get("stepId").cloned().unwrap_or_default(),
                });
            }
            _ => {}
        }
        if let Some(on) = obj.get("on") {
            return serde_json::json!({ "type": "afterStep", "stepId": on.clone() });
        }
    }
    serde_json::json!({ "type": "programStart" })
}

/// Parse a program from an already-parsed JSON value, normalizing first.
pub fn program_from_value(mut value: serde_json::Value) -> Result<Program, serde_json::Error> {
    normalize_program_document(&mut value);
    serde_json::from_value(value)
}

/// Parse a program document from source text in either supported format.
pub fn load_program_str(source: &str, format: DocFormat) -> Result<Program, ParseError> {
    let value: serde_json::Value = match format {
        DocFormat::Json => serde_json::from_str(source)?,
        DocFormat::Yaml => serde_yaml::from_str(source)?,
    };
    Ok(program_from_value(value)?)
}

// ---------------------------------------------------------------------------
// Batch expansion
// ---------------------------------------------------------------------------

/// Materialize batched tracks. A track with `batch_size` N > 1 becomes N
/// tracks whose step ids, manual trigger names, and same-track references are
/// suffixed `_k`; batch k's program-relative triggers are delayed by
/// `k·stagger_seconds`. References to steps outside the track are left alone.
pub fn expand_batches(program: &Program) -> Program {
    let mut expanded = program.clone();
    let mut tracks = Vec::with_capacity(program.tracks.len());

    for track in &program.tracks {
        if track.batch_size <= 1 {
            tracks.push(track.clone());
            continue;
        }

        let local_ids: Vec<String> = track.steps.iter().map(|s| s.step_id.clone()).collect();

        for batch in 0..track.batch_size {
            let suffix = format!("_{}", batch + 1);
            let mut copy = track.clone();
            copy.track_id = format!("{}{}", track.track_id, suffix);
            copy.batch_size = 1;
            copy.stagger_seconds = 0;

            for step in copy.steps.iter_mut() {
                step.step_id = format!("{}{}", step.step_id, suffix);
                step.name = format!("{} #{}", step.name, batch + 1);

                step.start_trigger.for_each_mut(&mut |t| {
                    if let Trigger::AfterStep { step_id, .. }
                    | Trigger::AfterStepWithBuffer { step_id, .. }
                    | Trigger::OnAbort { step_id } = t
                    {
                        if local_ids.iter().any(|id| id == step_id) {
                            *step_id = format!("{}{}", step_id, suffix);
                        }
                    }
                });

                if batch > 0 && track.stagger_seconds > 0 {
                    step.start_trigger
                        .delay_program_start(batch as u64 * track.stagger_seconds);
                }

                match &mut step.duration {
                    Duration::Variable { trigger_name, .. }
                    | Duration::Indefinite { trigger_name, .. } => {
                        if let Some(name) = trigger_name {
                            *name = format!("{}{}", name, suffix);
                        }
                    }
                    Duration::Fixed { .. } => {}
                }
            }

            tracks.push(copy);
        }
    }

    expanded.tracks = tracks;
    expanded
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
