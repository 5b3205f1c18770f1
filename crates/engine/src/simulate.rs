use std::collections::{BTreeMap, HashMap, HashSet};

use serde::Serialize;

use crate::model::{Program, Step};
use crate::trigger::{StartTrigger, StepEvent, Trigger};

// ---------------------------------------------------------------------------
// Symbolic step timing
// ---------------------------------------------------------------------------

/// Which duration figure a simulation uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DurationMode {
    /// Default durations; what the validator and planner schedule against.
    Planned,
    /// Best case (variable minimums).
    Minimum,
    /// Worst case (variable maximums; indefinite steps are open-ended).
    Maximum,
}

/// A step's symbolic schedule window, in seconds from program start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepTiming {
    pub start: u64,
    pub end: u64,
}

fn step_duration(step: &Step, mode: DurationMode) -> u64 {
    match mode {
        DurationMode::Planned => step.duration.planned(),
        DurationMode::Minimum => step.duration.minimum(),
        DurationMode::Maximum => step.duration.maximum(),
    }
}

/// Compute every step's symbolic start/end by propagating trigger references.
///
/// Unresolvable triggers (manual, abort, wall-clock) and dangling references
/// count as program start; reference cycles resolve to program start as well
/// (the validator reports them separately).
pub fn compute_timings(program: &Program, mode: DurationMode) -> HashMap<String, StepTiming> {
    let steps: HashMap<&str, &Step> = program
        .steps()
        .map(|(_, step)| (step.step_id.as_str(), step))
        .collect();

    let mut starts: HashMap<String, u64> = HashMap::new();
    let mut visiting: HashSet<String> = HashSet::new();
    for (_, step) in program.steps() {
        resolve_start(&step.step_id, &steps, mode, &mut starts, &mut visiting);
    }

    starts
        .into_iter()
        .map(|(id, start)| {
            let duration = steps
                .get(id.as_str())
                .map(|s| step_duration(s, mode))
                .unwrap_or(0);
            let end = start.saturating_add(duration);
            (id, StepTiming { start, end })
        })
        .collect()
}

fn resolve_start(
    step_id: &str,
    steps: &HashMap<&str, &Step>,
    mode: DurationMode,
    starts: &mut HashMap<String, u64>,
    visiting: &mut HashSet<String>,
) -> u64 {
    if let Some(start) = starts.get(step_id) {
        return *start;
    }
    let Some(step) = steps.get(step_id) else {
        return 0;
    };
    if !visiting.insert(step_id.to_string()) {
        return 0;
    }
    let start = trigger_start(&step.start_trigger, steps, mode, starts, visiting);
    visiting.remove(step_id);
    starts.insert(step_id.to_string(), start);
    start
}

fn trigger_start(
    trigger: &StartTrigger,
    steps: &HashMap<&str, &Step>,
    mode: DurationMode,
    starts: &mut HashMap<String, u64>,
    visiting: &mut HashSet<String>,
) -> u64 {
    match trigger {
        StartTrigger::Single(leaf) => leaf_start(leaf, steps, mode, starts, visiting),
        StartTrigger::Composite {
            logic: crate::trigger::TriggerLogic::All,
            triggers,
        } => triggers
            .iter()
            .map(|t| trigger_start(t, steps, mode, starts, visiting))
            .max()
            .unwrap_or(0),
        StartTrigger::Composite {
            logic: crate::trigger::TriggerLogic::Any,
            triggers,
        } => triggers
            .iter()
            .map(|t| trigger_start(t, steps, mode, starts, visiting))
            .min()
            .unwrap_or(0),
    }
}

fn leaf_start(
    trigger: &Trigger,
    steps: &HashMap<&str, &Step>,
    mode: DurationMode,
    starts: &mut HashMap<String, u64>,
    visiting: &mut HashSet<String>,
) -> u64 {
    match trigger {
        Trigger::ProgramStart => 0,
        Trigger::ProgramStartOffset { offset_seconds } => *offset_seconds,
        Trigger::AfterStep {
            step_id,
            event,
            offset_seconds,
        } => {
            reference_time(step_id, *event, steps, mode, starts, visiting)
                .saturating_add(*offset_seconds)
        }
        Trigger::AfterStepWithBuffer {
            step_id,
            buffer_seconds,
            event,
        } => {
            reference_time(step_id, *event, steps, mode, starts, visiting)
                .saturating_add(*buffer_seconds)
        }
        Trigger::Absolute { .. } | Trigger::Manual { .. } | Trigger::OnAbort { .. } => 0,
    }
}

fn reference_time(
    step_id: &str,
    event: StepEvent,
    steps: &HashMap<&str, &Step>,
    mode: DurationMode,
    starts: &mut HashMap<String, u64>,
    visiting: &mut HashSet<String>,
) -> u64 {
    if !steps.contains_key(step_id) {
        return 0;
    }
    let start = resolve_start(step_id, steps, mode, starts, visiting);
    match event {
        StepEvent::Start => start,
        StepEvent::End => {
            let duration = steps
                .get(step_id)
                .map(|s| step_duration(s, mode))
                .unwrap_or(0);
            start.saturating_add(duration)
        }
    }
}

// ---------------------------------------------------------------------------
// Usage profiles
// ---------------------------------------------------------------------------

/// One contiguous interval of constant concurrent use for a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageSpan {
    pub start: u64,
    pub end: u64,
    pub count: i64,
}

/// An interval where a resource's simulated concurrent use exceeds its cap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Bottleneck {
    pub resource: String,
    pub start: u64,
    pub end: u64,
    pub count: i64,
}

/// Concurrent-use deltas over time, accumulated per resource id and swept
/// into constant-count spans on demand.
#[derive(Debug, Default)]
pub struct UsageProfile {
    deltas: BTreeMap<u64, BTreeMap<String, i64>>,
}

impl UsageProfile {
    pub fn add_usage(&mut self, start: u64, end: u64, resource: &str) {
        *self
            .deltas
            .entry(start)
            .or_default()
            .entry(resource.to_string())
            .or_insert(0) += 1;
        *self
            .deltas
            .entry(end)
            .or_default()
            .entry(resource.to_string())
            .or_insert(0) -= 1;
    }

    /// Sweep the deltas into per-resource span lists. Every resource active
    /// in a segment gets a span for that segment.
    pub fn profile(&self) -> BTreeMap<String, Vec<UsageSpan>> {
        let points: Vec<u64> = self.deltas.keys().copied().collect();
        let mut current: BTreeMap<String, i64> = BTreeMap::new();
        let mut result: BTreeMap<String, Vec<UsageSpan>> = BTreeMap::new();

        for window in points.windows(2) {
            let (time, next) = (window[0], window[1]);
            if let Some(changes) = self.deltas.get(&time) {
                for (resource, delta) in changes {
                    *current.entry(resource.clone()).or_insert(0) += delta;
                }
            }
            for (resource, count) in &current {
                if *count > 0 {
                    result.entry(resource.clone()).or_default().push(UsageSpan {
                        start: time,
                        end: next,
                        count: *count,
                    });
                }
            }
        }
        result
    }

    /// Spans at or above `threshold`, most contended first.
    pub fn find_bottlenecks(&self, threshold: i64) -> Vec<Bottleneck> {
        let mut bottlenecks: Vec<Bottleneck> = Vec::new();
        for (resource, spans) in self.profile() {
            for span in spans {
                if span.count >= threshold {
                    bottlenecks.push(Bottleneck {
                        resource: resource.clone(),
                        start: span.start,
                        end: span.end,
                        count: span.count,
                    });
                }
            }
        }
        bottlenecks.sort_by(|a, b| b.count.cmp(&a.count).then(b.start.cmp(&a.start)));
        bottlenecks
    }
}

/// Build the usage profile for a whole program: one unit per step per task it
/// claims and per equipment id it lists, over the step's symbolic window.
pub fn build_usage(program: &Program, mode: DurationMode) -> UsageProfile {
    let timings = compute_timings(program, mode);
    let mut usage = UsageProfile::default();

    for (_, step) in program.steps() {
        let Some(timing) = timings.get(&step.step_id) else {
            continue;
        };
        for (task, _) in step.task_shares() {
            usage.add_usage(timing.start, timing.end, &task);
        }
        for resource in &step.resources {
            usage.add_usage(timing.start, timing.end, resource);
        }
    }
    usage
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
