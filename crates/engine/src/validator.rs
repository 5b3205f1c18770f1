use std::collections::{HashMap, HashSet};

use petgraph::algo::is_cyclic_directed;
use petgraph::graph::DiGraph;
use serde::Serialize;

use crate::environment::EnvironmentCatalog;
use crate::model::{program_from_value, Program};
use crate::simulate::{compute_timings, DurationMode};
use crate::time::Duration;
use crate::trigger::Trigger;

// ---------------------------------------------------------------------------
// Report types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationSummary {
    pub program_id: Option<String>,
    pub name: Option<String>,
    pub tracks: usize,
    pub total_steps: usize,
    pub resource_constraints: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidationReport {
    pub is_valid: bool,
    /// Structural failures: the document does not fit the program shape.
    pub schema_errors: Vec<String>,
    /// Semantic failures: the document fits but cannot execute coherently.
    pub logic_errors: Vec<String>,
    pub warnings: Vec<String>,
    pub summary: ValidationSummary,
}

impl ValidationReport {
    fn invalid_schema(errors: Vec<String>, summary: ValidationSummary) -> Self {
        ValidationReport {
            is_valid: false,
            schema_errors: errors,
            logic_errors: Vec::new(),
            warnings: Vec::new(),
            summary,
        }
    }
}

// ---------------------------------------------------------------------------
// Entry points
// ---------------------------------------------------------------------------

/// Validate a raw program document: normalization + typed parse as the schema
/// pass, then the semantic pass over the typed program.
pub fn validate_document(
    document: &serde_json::Value,
    catalog: &EnvironmentCatalog,
    strict: bool,
) -> ValidationReport {
    match program_from_value(document.clone()) {
        Ok(program) => validate_program(&program, catalog, strict),
        Err(err) => ValidationReport::invalid_schema(vec![err.to_string()], raw_summary(document)),
    }
}

fn raw_summary(document: &serde_json::Value) -> ValidationSummary {
    let tracks = document.get("tracks").and_then(|t| t.as_array());
    ValidationSummary {
        program_id: document
            .get("programId")
            .and_then(|v| v.as_str())
            .map(String::from),
        name: document
            .get("name")
            .and_then(|v| v.as_str())
            .map(String::from),
        tracks: tracks.map(|t| t.len()).unwrap_or(0),
        total_steps: tracks
            .map(|tracks| {
                tracks
                    .iter()
                    .filter_map(|t| t.get("steps").and_then(|s| s.as_array()))
                    .map(|s| s.len())
                    .sum()
            })
            .unwrap_or(0),
        resource_constraints: document
            .get("resourceConstraints")
            .and_then(|v| v.as_array())
            .map(|v| v.len())
            .unwrap_or(0),
    }
}

/// Validate a typed program. Errors block execution; warnings are advisory.
pub fn validate_program(
    program: &Program,
    catalog: &EnvironmentCatalog,
    strict: bool,
) -> ValidationReport {
    let mut schema_errors: Vec<String> = Vec::new();
    let mut errors: Vec<String> = Vec::new();
    let mut warnings: Vec<String> = Vec::new();

    let step_ids: HashSet<&str> = program
        .steps()
        .map(|(_, step)| step.step_id.as_str())
        .collect();

    // -----------------------------------------------------------------------
    // Schema-pass range checks the typed parse cannot express
    // -----------------------------------------------------------------------
    for track in &program.tracks {
        if track.batch_size == 0 {
            schema_errors.push(format!(
                "Track '{}' has batch_size 0 -- must be at least 1",
                track.track_id
            ));
        }
    }
    for (_, step) in program.steps() {
        for (task, fraction) in step.task_shares() {
            if !(fraction > 0.0 && fraction <= 1.0) {
                schema_errors.push(format!(
                    "Step '{}' claims task '{}' at fraction {} -- must be in (0, 1]",
                    step.step_id, task, fraction
                ));
            }
        }
    }
    if let Some(constraints) = &program.resource_constraints {
        for constraint in constraints {
            if constraint.max_concurrent == 0 {
                schema_errors.push(format!(
                    "Constraint for task '{}' has maxConcurrent 0 -- must be at least 1",
                    constraint.task
                ));
            }
            if constraint.actors_required < 0.0 {
                schema_errors.push(format!(
                    "Constraint for task '{}' has negative actorsRequired",
                    constraint.task
                ));
            }
        }
    }

    // -----------------------------------------------------------------------
    // Error: duplicate step IDs
    // -----------------------------------------------------------------------
    {
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for (_, step) in program.steps() {
            *counts.entry(step.step_id.as_str()).or_insert(0) += 1;
        }
        let mut duplicated: Vec<(&str, usize)> =
            counts.into_iter().filter(|(_, n)| *n > 1).collect();
        duplicated.sort();
        for (step_id, count) in duplicated {
            errors.push(format!(
                "Duplicate step ID '{}' found {} times",
                step_id, count
            ));
        }
    }

    // -----------------------------------------------------------------------
    // Error: trigger references to unknown steps
    // -----------------------------------------------------------------------
    {
        let mut referenced: HashSet<String> = HashSet::new();
        for (_, step) in program.steps() {
            for reference in step.start_trigger.referenced_steps() {
                referenced.insert(reference);
            }
        }
        let mut missing: Vec<&String> = referenced
            .iter()
            .filter(|id| !step_ids.contains(id.as_str()))
            .collect();
        missing.sort();
        for id in missing {
            errors.push(format!(
                "Referenced step ID '{}' does not exist in any track",
                id
            ));
        }
    }

    // -----------------------------------------------------------------------
    // Error: duration bounds
    // -----------------------------------------------------------------------
    for (_, step) in program.steps() {
        match &step.duration {
            Duration::Variable {
                min_seconds,
                max_seconds,
                default_seconds,
                ..
            } => {
                if min_seconds > max_seconds {
                    errors.push(format!(
                        "Step '{}' has minSeconds {} greater than maxSeconds {}",
                        step.step_id, min_seconds, max_seconds
                    ));
                } else if default_seconds < min_seconds || default_seconds > max_seconds {
                    errors.push(format!(
                        "Step '{}' has default duration {} outside [{}, {}]",
                        step.step_id, default_seconds, min_seconds, max_seconds
                    ));
                }
            }
            Duration::Indefinite {
                min_seconds,
                default_seconds,
                ..
            } => {
                if default_seconds < min_seconds {
                    errors.push(format!(
                        "Step '{}' has default duration {} below minSeconds {}",
                        step.step_id, default_seconds, min_seconds
                    ));
                }
            }
            Duration::Fixed { .. } => {}
        }
    }

    // -----------------------------------------------------------------------
    // Error: conflicting resource sources
    // -----------------------------------------------------------------------
    if program.resource_constraints.is_some()
        && (program.environment.is_some() || program.environment_type.is_some())
    {
        errors.push(
            "Program declares both inline resourceConstraints and an environment reference"
                .to_string(),
        );
    }

    // -----------------------------------------------------------------------
    // Error: environment resolution
    // -----------------------------------------------------------------------
    let resolved = catalog.resolve(program);
    let declared_tasks: HashSet<String> = match &resolved {
        Ok(resolved) => resolved.constraints.iter().map(|c| c.task.clone()).collect(),
        Err(err) => {
            errors.push(err.to_string());
            program
                .resource_constraints
                .iter()
                .flatten()
                .map(|c| c.task.clone())
                .collect()
        }
    };

    // -----------------------------------------------------------------------
    // Error: tasks used but never declared
    // -----------------------------------------------------------------------
    let has_fallback = program.actors.is_some()
        || program.environment.is_some()
        || program.environment_type.is_some();
    if strict || !has_fallback {
        let mut reported: HashSet<String> = HashSet::new();
        for (_, step) in program.steps() {
            for task in step.all_task_names() {
                if !declared_tasks.contains(&task) && reported.insert(task.clone()) {
                    errors.push(format!(
                        "Task '{}' is used in steps but not defined in resourceConstraints",
                        task
                    ));
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Error: unknown template references
    // -----------------------------------------------------------------------
    {
        let template_ids: HashSet<&str> = program
            .track_templates
            .iter()
            .map(|t| t.template_id.as_str())
            .collect();
        for track in &program.tracks {
            if let Some(template_id) = &track.template_id {
                if !template_ids.contains(template_id.as_str()) {
                    errors.push(format!(
                        "Referenced template ID '{}' does not exist in trackTemplates",
                        template_id
                    ));
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Error: circular trigger references
    // -----------------------------------------------------------------------
    {
        let mut graph: DiGraph<(), ()> = DiGraph::new();
        let mut nodes = HashMap::new();
        for (_, step) in program.steps() {
            let node = graph.add_node(());
            nodes.insert(step.step_id.as_str(), node);
        }
        for (_, step) in program.steps() {
            let Some(&target) = nodes.get(step.step_id.as_str()) else {
                continue;
            };
            step.start_trigger.for_each(&mut |trigger| {
                if let Trigger::AfterStep { step_id, .. }
                | Trigger::AfterStepWithBuffer { step_id, .. } = trigger
                {
                    if let Some(&source) = nodes.get(step_id.as_str()) {
                        graph.add_edge(source, target, ());
                    }
                }
            });
        }
        if is_cyclic_directed(&graph) {
            errors.push(
                "Circular trigger references -- steps depend on each other's completion"
                    .to_string(),
            );
        }
    }

    // -----------------------------------------------------------------------
    // Error: intra-track overlaps (symbolic start propagation)
    // -----------------------------------------------------------------------
    {
        let timings = compute_timings(program, DurationMode::Planned);
        for track in &program.tracks {
            if track.steps.len() <= 1 {
                continue;
            }
            let mut windows: Vec<(&str, u64, u64)> = track
                .steps
                .iter()
                .filter_map(|step| {
                    timings
                        .get(&step.step_id)
                        .map(|t| (step.name.as_str(), t.start, t.end))
                })
                .collect();
            windows.sort_by_key(|(_, start, _)| *start);

            for pair in windows.windows(2) {
                let (prev_name, _, prev_end) = pair[0];
                let (next_name, next_start, _) = pair[1];
                if prev_end > next_start {
                    errors.push(format!(
                        "Track '{}': steps '{}' and '{}' overlap by {} seconds",
                        track.name,
                        prev_name,
                        next_name,
                        prev_end - next_start
                    ));
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Warnings
    // -----------------------------------------------------------------------
    for track in &program.tracks {
        if track.steps.is_empty() {
            warnings.push(format!("Track '{}' has no steps", track.track_id));
        }
    }
    if !declared_tasks.is_empty() {
        for (_, step) in program.steps() {
            if step.task_shares().is_empty() {
                warnings.push(format!(
                    "Step '{}' claims no tasks -- it won't be resource-constrained",
                    step.step_id
                ));
            }
        }
    }

    let is_valid = schema_errors.is_empty() && errors.is_empty();
    ValidationReport {
        is_valid,
        schema_errors,
        logic_errors: errors,
        warnings,
        summary: ValidationSummary {
            program_id: Some(program.program_id.clone()),
            name: Some(program.name.clone()),
            tracks: program.tracks.len(),
            total_steps: program.step_count(),
            resource_constraints: program
                .resource_constraints
                .as_ref()
                .map(|c| c.len())
                .unwrap_or(0),
        },
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
