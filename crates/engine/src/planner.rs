use std::collections::{BTreeSet, HashSet};

use tracing::debug;

use crate::environment::Environment;
use crate::model::{Program, Step, Track};
use crate::simulate::{build_usage, Bottleneck, DurationMode};
use crate::time::Duration;
use crate::trigger::{StartTrigger, StepEvent, Trigger};

pub const DEFAULT_STAGGER_INTERVAL: u64 = 5;
pub const DEFAULT_PADDING_SECONDS: u64 = 2;
pub const DEFAULT_WORST_CASE_THRESHOLD: i64 = 2;

// ---------------------------------------------------------------------------
// Options and results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct PlannerOptions {
    /// Seconds between staggered track starts.
    pub stagger_interval: u64,
    /// Length of the synthetic padding step inserted before contended steps.
    pub padding_seconds: u64,
    /// Concurrency level treated as contention in the worst-case (maximum
    /// duration) profile.
    pub worst_case_threshold: i64,
}

impl Default for PlannerOptions {
    fn default() -> Self {
        PlannerOptions {
            stagger_interval: DEFAULT_STAGGER_INTERVAL,
            padding_seconds: DEFAULT_PADDING_SECONDS,
            worst_case_threshold: DEFAULT_WORST_CASE_THRESHOLD,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error("environment type '{environment}' does not match program environmentType '{program}'")]
    TypeMismatch { environment: String, program: String },
}

/// The rewritten program plus what drove the rewrite.
#[derive(Debug)]
pub struct PlanOutcome {
    pub program: Program,
    pub bottlenecks: Vec<Bottleneck>,
    pub notes: Vec<String>,
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Rewrite a program to reduce peak resource contention: sequence implicit
/// intra-track ordering, repair bad references, find bottlenecks under the
/// environment's limits, then stagger contended tracks and pad contended
/// steps. With no remaining contention the program comes back unchanged.
pub fn plan(
    program: &Program,
    environment: Option<&Environment>,
    options: PlannerOptions,
) -> Result<PlanOutcome, PlanError> {
    if let (Some(env), Some(kind)) = (environment, &program.environment_type) {
        if &env.kind != kind {
            return Err(PlanError::TypeMismatch {
                environment: env.kind.clone(),
                program: kind.clone(),
            });
        }
    }

    let mut working = program.clone();
    let mut notes: Vec<String> = Vec::new();

    sequence_track_steps(&mut working, &mut notes);
    repair_references(&mut working, &mut notes);

    let bottlenecks = find_bottlenecks(&working, program, environment, options);
    debug!(count = bottlenecks.len(), "bottlenecks identified");

    if !bottlenecks.is_empty() {
        stagger_tracks(&mut working, &bottlenecks, options.stagger_interval, &mut notes);
        pad_contended_steps(&mut working, &bottlenecks, options.padding_seconds, &mut notes);
    }

    Ok(PlanOutcome {
        program: working,
        bottlenecks,
        notes,
    })
}

// ---------------------------------------------------------------------------
// Pass 1: make implicit intra-track ordering explicit
// ---------------------------------------------------------------------------

/// Tracks run their steps sequentially; a non-first step still carrying a
/// program-start or manual trigger is rewritten to follow its predecessor.
fn sequence_track_steps(program: &mut Program, notes: &mut Vec<String>) {
    for track in &mut program.tracks {
        for i in 1..track.steps.len() {
            let implicit = matches!(
                track.steps[i].start_trigger,
                StartTrigger::Single(Trigger::ProgramStart) | StartTrigger::Single(Trigger::Manual { .. })
            );
            if implicit {
                let previous = track.steps[i - 1].step_id.clone();
                track.steps[i].start_trigger = StartTrigger::Single(Trigger::AfterStep {
                    step_id: previous.clone(),
                    event: StepEvent::End,
                    offset_seconds: 0,
                });
                notes.push(format!(
                    "Sequenced step '{}' after '{}' in track '{}'",
                    track.steps[i].step_id, previous, track.track_id
                ));
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Pass 2: repair bad references
// ---------------------------------------------------------------------------

fn single_reference(trigger: &StartTrigger) -> Option<String> {
    match trigger {
        StartTrigger::Single(Trigger::AfterStep { step_id, .. })
        | StartTrigger::Single(Trigger::AfterStepWithBuffer { step_id, .. }) => {
            Some(step_id.clone())
        }
        _ => None,
    }
}

/// Dangling references repoint to the previous step in the track (or to
/// program start for a first step); a reference to a step defined later in
/// the same track moves the referenced step earlier.
fn repair_references(program: &mut Program, notes: &mut Vec<String>) {
    let all_ids: HashSet<String> = program
        .steps()
        .map(|(_, step)| step.step_id.clone())
        .collect();

    for track in &mut program.tracks {
        let mut i = 0;
        while i < track.steps.len() {
            let Some(reference) = single_reference(&track.steps[i].start_trigger) else {
                i += 1;
                continue;
            };
            let local_index = track.steps.iter().position(|s| s.step_id == reference);

            match local_index {
                // Dangling (or self-referential) reference.
                None if !all_ids.contains(&reference) => {
                    let step_id = track.steps[i].step_id.clone();
                    if i > 0 {
                        let previous = track.steps[i - 1].step_id.clone();
                        track.steps[i].start_trigger = StartTrigger::Single(Trigger::AfterStep {
                            step_id: previous.clone(),
                            event: StepEvent::End,
                            offset_seconds: 0,
                        });
                        notes.push(format!(
                            "Repointed step '{}' at '{}' (unknown reference '{}')",
                            step_id, previous, reference
                        ));
                    } else {
                        track.steps[i].start_trigger =
                            StartTrigger::Single(Trigger::ProgramStart);
                        notes.push(format!(
                            "Reset step '{}' to program start (unknown reference '{}')",
                            step_id, reference
                        ));
                    }
                }
                // Cross-track reference; nothing to repair here.
                None => {}
                Some(ref_index) if ref_index == i => {
                    let step_id = track.steps[i].step_id.clone();
                    track.steps[i].start_trigger = if i > 0 {
                        StartTrigger::Single(Trigger::AfterStep {
                            step_id: track.steps[i - 1].step_id.clone(),
                            event: StepEvent::End,
                            offset_seconds: 0,
                        })
                    } else {
                        StartTrigger::Single(Trigger::ProgramStart)
                    };
                    notes.push(format!("Removed self-reference on step '{}'", step_id));
                }
                Some(ref_index) if ref_index > i => {
                    let mut moved = track.steps.remove(ref_index);
                    // The sequencing pass may have chained the moved step
                    // after its new successor; re-root it to keep the track
                    // acyclic.
                    if single_reference(&moved.start_trigger).as_deref()
                        == Some(track.steps[i].step_id.as_str())
                    {
                        moved.start_trigger = if i > 0 {
                            StartTrigger::Single(Trigger::AfterStep {
                                step_id: track.steps[i - 1].step_id.clone(),
                                event: StepEvent::End,
                                offset_seconds: 0,
                            })
                        } else {
                            StartTrigger::Single(Trigger::ProgramStart)
                        };
                    }
                    notes.push(format!(
                        "Moved step '{}' before '{}' in track '{}'",
                        moved.step_id, track.steps[i].step_id, track.track_id
                    ));
                    track.steps.insert(i, moved);
                }
                Some(_) => {}
            }
            i += 1;
        }
    }
}

// ---------------------------------------------------------------------------
// Bottleneck detection
// ---------------------------------------------------------------------------

fn step_touches(step: &Step, resources: &BTreeSet<String>) -> bool {
    step.task_shares()
        .iter()
        .any(|(task, _)| resources.contains(task))
        || step.resources.iter().any(|r| resources.contains(r))
}

/// Constraint violations in the planned profile, unioned with threshold-level
/// contention in the worst-case profile. Resources that show up in both are
/// listed first.
fn find_bottlenecks(
    working: &Program,
    original: &Program,
    environment: Option<&Environment>,
    options: PlannerOptions,
) -> Vec<Bottleneck> {
    // Without concurrency limits there is nothing to relieve.
    let Some(constraints) = original
        .resource_constraints
        .clone()
        .or_else(|| environment.map(|e| e.resource_constraints.clone()))
    else {
        return Vec::new();
    };

    let mut constrained: Vec<Bottleneck> = Vec::new();
    let planned = build_usage(working, DurationMode::Planned);
    for (resource, spans) in planned.profile() {
        let Some(limit) = constraints
            .iter()
            .find(|c| c.task == resource)
            .map(|c| c.max_concurrent as i64)
        else {
            continue;
        };
        for span in spans {
            if span.count > limit {
                constrained.push(Bottleneck {
                    resource: resource.clone(),
                    start: span.start,
                    end: span.end,
                    count: span.count,
                });
            }
        }
    }

    let worst =
        build_usage(working, DurationMode::Maximum).find_bottlenecks(options.worst_case_threshold);

    let worst_resources: HashSet<&str> = worst.iter().map(|b| b.resource.as_str()).collect();
    let mut combined: Vec<Bottleneck> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();

    for bottleneck in &constrained {
        if worst_resources.contains(bottleneck.resource.as_str()) {
            seen.insert(bottleneck.resource.clone());
            combined.push(bottleneck.clone());
        }
    }
    for bottleneck in worst {
        if !seen.contains(&bottleneck.resource) {
            seen.insert(bottleneck.resource.clone());
            combined.push(bottleneck);
        }
    }
    for bottleneck in constrained {
        if !seen.contains(&bottleneck.resource) {
            seen.insert(bottleneck.resource.clone());
            combined.push(bottleneck);
        }
    }
    combined
}

// ---------------------------------------------------------------------------
// Staggering
// ---------------------------------------------------------------------------

fn track_average_priority(track: &Track) -> f64 {
    if track.steps.is_empty() {
        return crate::model::DEFAULT_PRIORITY as f64;
    }
    track.steps.iter().map(|s| s.priority as f64).sum::<f64>() / track.steps.len() as f64
}

/// For each bottleneck resource, defer the start of every touching track but
/// the highest-priority one by k·interval, rewriting the tracks'
/// program-relative triggers so the runtime honors the delay.
fn stagger_tracks(
    program: &mut Program,
    bottlenecks: &[Bottleneck],
    interval: u64,
    notes: &mut Vec<String>,
) {
    let resources: BTreeSet<String> = bottlenecks.iter().map(|b| b.resource.clone()).collect();
    let mut offsets: Vec<u64> = vec![0; program.tracks.len()];

    for resource in &resources {
        let single: BTreeSet<String> = std::iter::once(resource.clone()).collect();
        let mut touching: Vec<usize> = program
            .tracks
            .iter()
            .enumerate()
            .filter(|(_, track)| track.steps.iter().any(|s| step_touches(s, &single)))
            .map(|(i, _)| i)
            .collect();
        touching.sort_by(|a, b| {
            track_average_priority(&program.tracks[*a])
                .partial_cmp(&track_average_priority(&program.tracks[*b]))
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.cmp(b))
        });

        for (k, track_index) in touching.iter().enumerate().skip(1) {
            offsets[*track_index] += k as u64 * interval;
        }
    }

    for (track_index, offset) in offsets.iter().enumerate() {
        if *offset == 0 {
            continue;
        }
        let track = &mut program.tracks[track_index];
        for step in &mut track.steps {
            step.start_trigger.delay_program_start(*offset);
        }
        notes.push(format!(
            "Staggered track '{}' start by {}s",
            track.track_id, offset
        ));
    }
}

// ---------------------------------------------------------------------------
// Padding
// ---------------------------------------------------------------------------

/// Insert a short no-resource step before every contended non-first step,
/// chained off the predecessor; the contended step is re-chained through the
/// padding so the gap is real.
fn pad_contended_steps(
    program: &mut Program,
    bottlenecks: &[Bottleneck],
    padding_seconds: u64,
    notes: &mut Vec<String>,
) {
    let resources: BTreeSet<String> = bottlenecks.iter().map(|b| b.resource.clone()).collect();

    for track in &mut program.tracks {
        let mut contended: Vec<usize> = track
            .steps
            .iter()
            .enumerate()
            .filter(|(i, step)| *i > 0 && step_touches(step, &resources))
            .map(|(i, _)| i)
            .collect();

        // Back to front so earlier indices stay valid while inserting.
        contended.sort_unstable_by(|a, b| b.cmp(a));

        for index in contended {
            let previous_id = track.steps[index - 1].step_id.clone();
            let padding_id = format!("padding-{}-{}", track.track_id, index);

            let padding = Step {
                step_id: padding_id.clone(),
                name: "Resource contention padding".to_string(),
                description: Some("Added automatically to reduce resource contention".to_string()),
                priority: crate::model::DEFAULT_PRIORITY,
                start_trigger: StartTrigger::Single(Trigger::AfterStep {
                    step_id: previous_id.clone(),
                    event: StepEvent::End,
                    offset_seconds: 0,
                }),
                duration: Duration::Fixed {
                    seconds: padding_seconds,
                },
                task: None,
                tasks: Vec::new(),
                task_resources: Vec::new(),
                pre_buffer: None,
                post_buffer: None,
                code_block: None,
                resources: Vec::new(),
            };

            // Re-chain the contended step through the padding when it was
            // waiting on the predecessor.
            if single_reference(&track.steps[index].start_trigger).as_deref()
                == Some(previous_id.as_str())
            {
                track.steps[index].start_trigger.for_each_mut(&mut |t| {
                    if let Trigger::AfterStep { step_id, .. }
                    | Trigger::AfterStepWithBuffer { step_id, .. } = t
                    {
                        if step_id == &previous_id {
                            *step_id = padding_id.clone();
                        }
                    }
                });
            }

            notes.push(format!(
                "Padded step '{}' in track '{}' with {}s",
                track.steps[index].step_id, track.track_id, padding_seconds
            ));
            track.steps.insert(index, padding);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
