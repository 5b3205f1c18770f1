use serde::{Deserialize, Serialize};

use crate::time::parse_wall_time;

// ---------------------------------------------------------------------------
// Trigger variants
// ---------------------------------------------------------------------------

/// Which lifecycle event of a referenced step a trigger keys on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StepEvent {
    Start,
    #[default]
    End,
}

/// A single trigger condition. Evaluated against the live world each tick;
/// a step is admitted once its trigger is satisfied and resources fit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Trigger {
    ProgramStart,
    #[serde(rename_all = "camelCase")]
    ProgramStartOffset {
        offset_seconds: u64,
    },
    #[serde(rename_all = "camelCase")]
    AfterStep {
        step_id: String,
        #[serde(default)]
        event: StepEvent,
        #[serde(default)]
        offset_seconds: u64,
    },
    #[serde(rename_all = "camelCase")]
    AfterStepWithBuffer {
        step_id: String,
        #[serde(default)]
        buffer_seconds: u64,
        #[serde(default)]
        event: StepEvent,
    },
    /// Wall-clock trigger; `time` is an ISO 8601 datetime string.
    Absolute {
        time: String,
    },
    #[serde(rename_all = "camelCase")]
    Manual {
        trigger_name: String,
    },
    #[serde(rename_all = "camelCase")]
    OnAbort {
        step_id: String,
    },
}

/// The world state a trigger is evaluated against. The scheduler implements
/// this over its live step table; the trait keeps evaluation pure and
/// testable.
pub trait TriggerWorld {
    fn program_running(&self) -> bool;
    fn now(&self) -> f64;
    fn program_start(&self) -> Option<f64>;
    fn step_started_at(&self, step_id: &str) -> Option<f64>;
    fn step_completed_at(&self, step_id: &str) -> Option<f64>;
    fn step_aborted(&self, step_id: &str) -> bool;
    /// Whether a `Trigger` command has been delivered to the given step.
    fn manual_fired(&self, step_id: &str) -> bool;
}

impl Trigger {
    /// Evaluate this trigger for the step that owns it.
    pub fn satisfied(&self, world: &dyn TriggerWorld, owner: &str) -> bool {
        match self {
            Trigger::ProgramStart => world.program_running(),
            Trigger::ProgramStartOffset { offset_seconds } => match world.program_start() {
                Some(start) => world.now() - start >= *offset_seconds as f64,
                None => false,
            },
            Trigger::AfterStep {
                step_id,
                event,
                offset_seconds,
            } => {
                let base = match event {
                    StepEvent::End => world.step_completed_at(step_id),
                    StepEvent::Start => world.step_started_at(step_id),
                };
                match base {
                    Some(t) => t + *offset_seconds as f64 <= world.now(),
                    None => false,
                }
            }
            Trigger::AfterStepWithBuffer {
                step_id,
                buffer_seconds,
                event,
            } => {
                let base = match event {
                    StepEvent::End => world.step_completed_at(step_id),
                    StepEvent::Start => world.step_started_at(step_id),
                };
                match base {
                    Some(t) => world.now() - t >= *buffer_seconds as f64,
                    None => false,
                }
            }
            Trigger::Absolute { time } => match parse_wall_time(time) {
                Some(t) => world.now() >= t,
                None => false,
            },
            Trigger::Manual { .. } => world.manual_fired(owner),
            Trigger::OnAbort { step_id } => world.step_aborted(step_id),
        }
    }

    /// The step id this trigger references, if any.
    pub fn referenced_step(&self) -> Option<&str> {
        match self {
            Trigger::AfterStep { step_id, .. }
            | Trigger::AfterStepWithBuffer { step_id, .. }
            | Trigger::OnAbort { step_id } => Some(step_id),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Start triggers: a single condition or a composite over several
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerLogic {
    All,
    Any,
}

/// A step's start condition: either one trigger or a boolean combination.
/// Composites nest, so `{all: [x, {any: [y, z]}]}` shapes are expressible.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StartTrigger {
    Composite {
        logic: TriggerLogic,
        triggers: Vec<StartTrigger>,
    },
    Single(Trigger),
}

impl StartTrigger {
    pub fn satisfied(&self, world: &dyn TriggerWorld, owner: &str) -> bool {
        match self {
            StartTrigger::Single(trigger) => trigger.satisfied(world, owner),
            StartTrigger::Composite { logic, triggers } => match logic {
                TriggerLogic::All => triggers.iter().all(|t| t.satisfied(world, owner)),
                TriggerLogic::Any => triggers.iter().any(|t| t.satisfied(world, owner)),
            },
        }
    }

    /// Visit every leaf trigger, including composite children.
    pub fn for_each(&self, f: &mut impl FnMut(&Trigger)) {
        match self {
            StartTrigger::Single(trigger) => f(trigger),
            StartTrigger::Composite { triggers, .. } => {
                for child in triggers {
                    child.for_each(f);
                }
            }
        }
    }

    /// Mutably visit every leaf trigger, including composite children.
    pub fn for_each_mut(&mut self, f: &mut impl FnMut(&mut Trigger)) {
        match self {
            StartTrigger::Single(trigger) => f(trigger),
            StartTrigger::Composite { triggers, .. } => {
                for child in triggers {
                    child.for_each_mut(f);
                }
            }
        }
    }

    /// Every step id referenced by any leaf.
    pub fn referenced_steps(&self) -> Vec<String> {
        let mut refs = Vec::new();
        self.for_each(&mut |t| {
            if let Some(id) = t.referenced_step() {
                refs.push(id.to_string());
            }
        });
        refs
    }

    /// Manual trigger names declared by any leaf.
    pub fn manual_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        self.for_each(&mut |t| {
            if let Trigger::Manual { trigger_name } = t {
                names.push(trigger_name.clone());
            }
        });
        names
    }

    pub fn has_manual(&self) -> bool {
        let mut found = false;
        self.for_each(&mut |t| {
            if matches!(t, Trigger::Manual { .. }) {
                found = true;
            }
        });
        found
    }

    /// Push program-relative leaves later by `offset` seconds. `ProgramStart`
    /// becomes `ProgramStartOffset(offset)`; existing offsets accumulate.
    pub fn delay_program_start(&mut self, offset: u64) {
        if offset == 0 {
            return;
        }
        self.for_each_mut(&mut |t| match t {
            Trigger::ProgramStart => {
                *t = Trigger::ProgramStartOffset {
                    offset_seconds: offset,
                };
            }
            Trigger::ProgramStartOffset { offset_seconds } => {
                *offset_seconds += offset;
            }
            _ => {}
        });
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
