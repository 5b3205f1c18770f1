use std::collections::HashMap;
use std::sync::mpsc::{channel, Receiver, Sender, TryRecvError};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::admission::{Reservation, ResourcePool};
use crate::environment::ResolvedResources;
use crate::model::{expand_batches, CodeKind, Program, Step};
use crate::time::Duration;
use crate::trigger::TriggerWorld;

/// Float tolerance when deciding a fixed step has reached its expected end.
const FIXED_COMPLETION_EPSILON: f64 = 0.05;

/// Running steps with less than this many seconds remaining are completed
/// rather than left to straddle the next tick.
const NEAR_ZERO_REMAINING: f64 = 0.1;

// ---------------------------------------------------------------------------
// Clocks
// ---------------------------------------------------------------------------

/// Injectable wall-clock source, in seconds. The scheduler scales elapsed
/// wall time by its `time_scale` to produce program time.
pub trait Clock: Send {
    fn now(&self) -> f64;
}

/// Epoch-seconds system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> f64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0)
    }
}

/// A hand-driven clock. Clones share the same time, so a driver can hold one
/// handle while the scheduler owns another.
#[derive(Debug, Default, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<f64>>,
}

impl ManualClock {
    pub fn starting_at(now: f64) -> Self {
        ManualClock {
            now: Arc::new(Mutex::new(now)),
        }
    }

    pub fn set(&self, now: f64) {
        if let Ok(mut guard) = self.now.lock() {
            *guard = now;
        }
    }

    pub fn advance(&self, seconds: f64) {
        if let Ok(mut guard) = self.now.lock() {
            *guard += seconds;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> f64 {
        self.now.lock().map(|guard| *guard).unwrap_or(0.0)
    }
}

// ---------------------------------------------------------------------------
// Code execution
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeOutcome {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

#[derive(Debug, thiserror::Error)]
pub enum CodeError {
    #[error("failed to run code block: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Executes step code blocks. Injected so embedders and tests can replace the
/// escape hatch with a pure function.
pub trait CodeExecutor: Send {
    fn execute(&mut self, kind: CodeKind, source: &str) -> Result<CodeOutcome, CodeError>;
}

/// Runs both code-block kinds through `sh -c`.
#[derive(Debug, Default)]
pub struct ShellExecutor;

impl CodeExecutor for ShellExecutor {
    fn execute(&mut self, _kind: CodeKind, source: &str) -> Result<CodeOutcome, CodeError> {
        let output = std::process::Command::new("sh")
            .arg("-c")
            .arg(source)
            .output()?;
        Ok(CodeOutcome {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }
}

/// Ignores code blocks; used for planning contexts and tests.
#[derive(Debug, Default)]
pub struct NullExecutor;

impl CodeExecutor for NullExecutor {
    fn execute(&mut self, _kind: CodeKind, _source: &str) -> Result<CodeOutcome, CodeError> {
        Ok(CodeOutcome::default())
    }
}

fn substitute_placeholders(source: &str, step: &Step, track_id: &str) -> String {
    source
        .replace("{step.id}", &step.step_id)
        .replace("{step.name}", &step.name)
        .replace("{step.track}", track_id)
        .replace(
            "{step.description}",
            step.description.as_deref().unwrap_or(""),
        )
}

// ---------------------------------------------------------------------------
// Commands, events, step state
// ---------------------------------------------------------------------------

/// Inbound control messages, drained at the start of every tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    StartProgram,
    Trigger {
        name: String,
        step_id: Option<String>,
    },
    Abort {
        step_id: String,
    },
    ForceComplete {
        step_id: String,
    },
}

/// Outbound notifications, delivered synchronously to listeners during
/// `tick()`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    ProgramStarted { time: f64 },
    ProgramFinished { time: f64 },
    #[serde(rename_all = "camelCase")]
    StepStarted { step_id: String, time: f64 },
    #[serde(rename_all = "camelCase")]
    StepCompleted { step_id: String, time: f64 },
    #[serde(rename_all = "camelCase")]
    StepAborted {
        step_id: String,
        time: f64,
        reason: String,
    },
}

pub type EventListener = Box<dyn FnMut(&Event)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    Pending,
    WaitingForManual,
    Running,
    Completed,
    Aborted,
}

/// Live state for one step. The step definition is immutable; the runtime
/// fields are written only by the scheduler while ticking.
#[derive(Debug)]
pub struct StepState {
    pub step: Step,
    pub track_id: String,
    pub order: usize,
    pub status: StepStatus,
    pub started_at: Option<f64>,
    pub ended_at: Option<f64>,
    pub expected_end: Option<f64>,
    pub manual_fired: bool,
    pub abort_reason: Option<String>,
    pub code_outcome: Option<CodeOutcome>,
    pub code_error: Option<String>,
    reservation: Option<Reservation>,
}

impl StepState {
    fn new(step: Step, track_id: String, order: usize) -> Self {
        StepState {
            step,
            track_id,
            order,
            status: StepStatus::Pending,
            started_at: None,
            ended_at: None,
            expected_end: None,
            manual_fired: false,
            abort_reason: None,
            code_outcome: None,
            code_error: None,
            reservation: None,
        }
    }

    /// Percent complete, or `None` where progress has no meaning (running
    /// indefinite steps, aborted steps).
    pub fn progress(&self, now: f64) -> Option<f64> {
        match self.status {
            StepStatus::Pending | StepStatus::WaitingForManual => Some(0.0),
            StepStatus::Completed => Some(100.0),
            StepStatus::Aborted => None,
            StepStatus::Running => {
                if self.step.duration.is_indefinite() {
                    return None;
                }
                let started = self.started_at?;
                let planned = self.step.duration.planned() as f64;
                if planned <= 0.0 {
                    return Some(100.0);
                }
                Some(((now - started) / planned * 100.0).min(100.0))
            }
        }
    }

    /// Seconds until the expected end, for running steps.
    pub fn remaining(&self, now: f64) -> Option<f64> {
        if self.status != StepStatus::Running {
            return None;
        }
        self.expected_end.map(|end| (end - now).max(0.0))
    }
}

/// Serializable view of one step's runtime state.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepSnapshot {
    pub step_id: String,
    pub name: String,
    pub track_id: String,
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub abort_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code_error: Option<String>,
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

struct WorldView<'a> {
    steps: &'a HashMap<String, StepState>,
    running: bool,
    now: f64,
    start: Option<f64>,
}

impl TriggerWorld for WorldView<'_> {
    fn program_running(&self) -> bool {
        self.running
    }
    fn now(&self) -> f64 {
        self.now
    }
    fn program_start(&self) -> Option<f64> {
        self.start
    }
    fn step_started_at(&self, step_id: &str) -> Option<f64> {
        self.steps.get(step_id).and_then(|s| s.started_at)
    }
    fn step_completed_at(&self, step_id: &str) -> Option<f64> {
        self.steps
            .get(step_id)
            .filter(|s| s.status == StepStatus::Completed)
            .and_then(|s| s.ended_at)
    }
    fn step_aborted(&self, step_id: &str) -> bool {
        self.steps
            .get(step_id)
            .map(|s| s.status == StepStatus::Aborted)
            .unwrap_or(false)
    }
    fn manual_fired(&self, step_id: &str) -> bool {
        self.steps
            .get(step_id)
            .map(|s| s.manual_fired)
            .unwrap_or(false)
    }
}

/// Clonable handle for submitting commands from other threads.
#[derive(Clone)]
pub struct CommandSender {
    tx: Sender<Command>,
}

impl CommandSender {
    pub fn send(&self, command: Command) {
        let _ = self.tx.send(command);
    }
}

/// Drives one program instance. Owns all mutable world state; advances only
/// inside `tick()`. Commands arrive through a thread-safe FIFO and are
/// observed at the start of the next tick.
pub struct Scheduler {
    steps: HashMap<String, StepState>,
    /// Step ids in definition order; the admission tie-break.
    order: Vec<String>,
    /// Ordered `track_id -> [step_id]` layout for display adapters.
    tracks: Vec<(String, Vec<String>)>,
    manual_triggers: HashMap<String, Vec<String>>,
    pool: ResourcePool,
    clock: Box<dyn Clock>,
    executor: Box<dyn CodeExecutor>,
    time_scale: f64,
    started: bool,
    finished: bool,
    start_wall: Option<f64>,
    program_start_time: Option<f64>,
    current_time: f64,
    command_tx: Sender<Command>,
    command_rx: Receiver<Command>,
    listeners: Vec<EventListener>,
    status_message: Option<String>,
}

impl Scheduler {
    /// Build a scheduler for a program. Batched tracks are materialized here;
    /// the program value itself is left untouched.
    pub fn new(program: &Program, resolved: &ResolvedResources) -> Self {
        let expanded = expand_batches(program);

        let mut steps = HashMap::new();
        let mut order = Vec::new();
        let mut tracks = Vec::new();
        let mut manual_triggers: HashMap<String, Vec<String>> = HashMap::new();

        for track in &expanded.tracks {
            let mut track_steps = Vec::with_capacity(track.steps.len());
            for step in &track.steps {
                let step_id = step.step_id.clone();
                for name in step.manual_trigger_names() {
                    manual_triggers.entry(name).or_default().push(step_id.clone());
                }
                steps.insert(
                    step_id.clone(),
                    StepState::new(step.clone(), track.track_id.clone(), order.len()),
                );
                track_steps.push(step_id.clone());
                order.push(step_id);
            }
            tracks.push((track.track_id.clone(), track_steps));
        }

        let (command_tx, command_rx) = channel();

        Scheduler {
            steps,
            order,
            tracks,
            manual_triggers,
            pool: ResourcePool::new(resolved),
            clock: Box::new(SystemClock),
            executor: Box::new(ShellExecutor),
            time_scale: 1.0,
            started: false,
            finished: false,
            start_wall: None,
            program_start_time: None,
            current_time: 0.0,
            command_tx,
            command_rx,
            listeners: Vec::new(),
            status_message: None,
        }
    }

    pub fn set_clock(&mut self, clock: Box<dyn Clock>) {
        self.clock = clock;
    }

    pub fn set_executor(&mut self, executor: Box<dyn CodeExecutor>) {
        self.executor = executor;
    }

    pub fn set_time_scale(&mut self, time_scale: f64) {
        self.time_scale = if time_scale > 0.0 { time_scale } else { 1.0 };
    }

    pub fn add_listener(&mut self, listener: EventListener) {
        self.listeners.push(listener);
    }

    pub fn handle(&self) -> CommandSender {
        CommandSender {
            tx: self.command_tx.clone(),
        }
    }

    pub fn submit(&self, command: Command) {
        let _ = self.command_tx.send(command);
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn current_time(&self) -> f64 {
        self.current_time
    }

    pub fn program_start_time(&self) -> Option<f64> {
        self.program_start_time
    }

    pub fn status_message(&self) -> Option<&str> {
        self.status_message.as_deref()
    }

    pub fn step(&self, step_id: &str) -> Option<&StepState> {
        self.steps.get(step_id)
    }

    pub fn pool(&self) -> &ResourcePool {
        &self.pool
    }

    pub fn tracks(&self) -> &[(String, Vec<String>)] {
        &self.tracks
    }

    /// Snapshots in definition order.
    pub fn snapshot(&self) -> Vec<StepSnapshot> {
        self.order
            .iter()
            .filter_map(|id| self.steps.get(id))
            .map(|state| StepSnapshot {
                step_id: state.step.step_id.clone(),
                name: state.step.name.clone(),
                track_id: state.track_id.clone(),
                status: state.status,
                started_at: state.started_at,
                ended_at: state.ended_at,
                progress: state.progress(self.current_time),
                remaining: state.remaining(self.current_time),
                abort_reason: state.abort_reason.clone(),
                code_error: state.code_error.clone(),
            })
            .collect()
    }

    // -----------------------------------------------------------------------
    // Tick
    // -----------------------------------------------------------------------

    /// One scheduling round: drain commands, advance the clock, admit ready
    /// steps, complete expired ones, detect program finish.
    pub fn tick(&mut self) {
        self.drain_commands();

        if !self.started || self.finished {
            return;
        }

        if let (Some(start), Some(wall)) = (self.program_start_time, self.start_wall) {
            let elapsed = self.clock.now() - wall;
            self.current_time = start + elapsed * self.time_scale;
        }

        self.admit_ready_steps();
        self.complete_expired_steps();
        self.check_finished();
    }

    fn drain_commands(&mut self) {
        loop {
            let command = match self.command_rx.try_recv() {
                Ok(command) => command,
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            };
            debug!(?command, "command received");
            match command {
                Command::StartProgram => self.start_program(),
                Command::Trigger { name, step_id } => self.handle_trigger(&name, step_id),
                Command::Abort { step_id } => self.handle_abort(&step_id),
                Command::ForceComplete { step_id } => self.handle_force_complete(&step_id),
            }
        }
    }

    fn start_program(&mut self) {
        if self.started {
            return;
        }
        let now = self.clock.now();
        self.started = true;
        self.start_wall = Some(now);
        self.program_start_time = Some(now);
        self.current_time = now;
        self.set_status("Program started".to_string());
        info!(time = now, "program started");
        self.emit(Event::ProgramStarted { time: now });
    }

    fn handle_trigger(&mut self, name: &str, step_id: Option<String>) {
        let Some(registered) = self.manual_triggers.get(name).cloned() else {
            warn!(trigger = name, "unknown trigger");
            self.set_status(format!("Unknown trigger: {}", name));
            return;
        };
        let targets: Vec<String> = match step_id {
            Some(step_id) => {
                if registered.iter().any(|id| id == &step_id) {
                    vec![step_id]
                } else {
                    self.set_status(format!(
                        "Step '{}' not found for trigger '{}'",
                        step_id, name
                    ));
                    return;
                }
            }
            None => registered,
        };
        for target in targets {
            self.deliver_trigger(&target);
        }
    }

    fn deliver_trigger(&mut self, step_id: &str) {
        let Some(state) = self.steps.get(step_id) else {
            return;
        };
        let status = state.status;
        let has_manual_start = state.step.start_trigger.has_manual();
        let name = state.step.name.clone();
        let duration = state.step.duration.clone();
        let started_at = state.started_at;

        match status {
            StepStatus::Pending => {
                if has_manual_start {
                    if let Some(state) = self.steps.get_mut(step_id) {
                        state.manual_fired = true;
                        state.status = StepStatus::WaitingForManual;
                    }
                    self.set_status(format!("Step '{}' is now waiting to start", name));
                } else {
                    self.set_status(format!(
                        "Step '{}' does not take a manual start trigger",
                        step_id
                    ));
                }
            }
            StepStatus::Running => match duration {
                Duration::Variable { min_seconds, .. } => {
                    let elapsed = started_at.map(|t| self.current_time - t).unwrap_or(0.0);
                    if elapsed >= min_seconds as f64 {
                        self.complete_step(step_id);
                        self.set_status(format!("Manually completed step '{}'", step_id));
                    } else {
                        self.set_status(format!(
                            "Step '{}' cannot complete before its minimum duration",
                            step_id
                        ));
                    }
                }
                Duration::Indefinite { .. } => {
                    self.complete_step(step_id);
                    self.set_status(format!("Manually completed step '{}'", step_id));
                }
                Duration::Fixed { .. } => {
                    self.set_status(format!(
                        "Step '{}' has a fixed duration and completes on its own",
                        step_id
                    ));
                }
            },
            _ => {
                self.set_status(format!("Step '{}' is not pending or running", step_id));
            }
        }
    }

    fn handle_abort(&mut self, step_id: &str) {
        match self.steps.get(step_id).map(|s| s.status) {
            Some(StepStatus::Running) => {
                self.abort_step(step_id, "Aborted by command");
            }
            Some(_) => {
                self.set_status(format!("Step '{}' is not running; abort ignored", step_id));
            }
            None => {
                warn!(step = step_id, "abort for unknown step");
                self.set_status(format!("Unknown step: {}", step_id));
            }
        }
    }

    fn handle_force_complete(&mut self, step_id: &str) {
        match self.steps.get(step_id).map(|s| s.status) {
            Some(StepStatus::Running) => {
                self.complete_step(step_id);
                self.set_status(format!("Force-completed step '{}'", step_id));
            }
            Some(_) => {
                self.set_status(format!(
                    "Step '{}' is not running; force-complete ignored",
                    step_id
                ));
            }
            None => {
                warn!(step = step_id, "force-complete for unknown step");
                self.set_status(format!("Unknown step: {}", step_id));
            }
        }
    }

    // -----------------------------------------------------------------------
    // Admission
    // -----------------------------------------------------------------------

    fn admit_ready_steps(&mut self) {
        let mut candidates: Vec<(i32, usize, String)> = Vec::new();
        {
            let world = WorldView {
                steps: &self.steps,
                running: self.started && !self.finished,
                now: self.current_time,
                start: self.program_start_time,
            };
            for step_id in &self.order {
                let Some(state) = self.steps.get(step_id) else {
                    continue;
                };
                // A delivered manual trigger sets the step's fired flag and
                // commits here on the next tick, once the whole trigger
                // (including composite siblings) holds.
                let ready = match state.status {
                    StepStatus::Pending | StepStatus::WaitingForManual => {
                        state.step.start_trigger.satisfied(&world, step_id)
                    }
                    _ => false,
                };
                if ready {
                    candidates.push((state.step.priority, state.order, step_id.clone()));
                }
            }
        }
        candidates.sort();

        for (_, _, step_id) in candidates {
            let Some(state) = self.steps.get(&step_id) else {
                continue;
            };
            let shares = state.step.task_shares();
            match self.pool.try_reserve(&shares) {
                Ok(reservation) => self.start_step(&step_id, reservation),
                Err(denied) => {
                    debug!(step = %step_id, %denied, "admission deferred");
                }
            }
        }
    }

    fn start_step(&mut self, step_id: &str, reservation: Reservation) {
        let now = self.current_time;
        let code = {
            let Some(state) = self.steps.get_mut(step_id) else {
                return;
            };
            state.status = StepStatus::Running;
            state.started_at = Some(now);
            state.expected_end = Some(now + state.step.duration.planned() as f64);
            state.reservation = Some(reservation);
            state
                .step
                .code_block
                .clone()
                .map(|block| (block, state.step.clone(), state.track_id.clone()))
        };

        if let Some((block, step, track_id)) = code {
            let source = substitute_placeholders(&block.source, &step, &track_id);
            let result = self.executor.execute(block.kind, &source);
            if let Some(state) = self.steps.get_mut(step_id) {
                match result {
                    Ok(outcome) => state.code_outcome = Some(outcome),
                    Err(err) => {
                        warn!(step = step_id, error = %err, "code block failed");
                        state.code_error = Some(err.to_string());
                    }
                }
            }
        }

        info!(step = step_id, time = now, "step started");
        self.emit(Event::StepStarted {
            step_id: step_id.to_string(),
            time: now,
        });
    }

    // -----------------------------------------------------------------------
    // Completion
    // -----------------------------------------------------------------------

    fn complete_expired_steps(&mut self) {
        let now = self.current_time;
        let mut due: Vec<String> = Vec::new();

        for step_id in &self.order {
            let Some(state) = self.steps.get(step_id) else {
                continue;
            };
            if state.status != StepStatus::Running {
                continue;
            }
            // Indefinite steps only end by command.
            if state.step.duration.is_indefinite() {
                continue;
            }
            let Some(expected_end) = state.expected_end else {
                continue;
            };
            let expired = match &state.step.duration {
                Duration::Fixed { .. } => now >= expected_end - FIXED_COMPLETION_EPSILON,
                Duration::Variable { .. } => now >= expected_end,
                Duration::Indefinite { .. } => false,
            };
            if expired || expected_end - now < NEAR_ZERO_REMAINING {
                due.push(step_id.clone());
            }
        }

        for step_id in due {
            self.complete_step(&step_id);
        }
    }

    fn complete_step(&mut self, step_id: &str) {
        let now = self.current_time;
        let reservation = {
            let Some(state) = self.steps.get_mut(step_id) else {
                return;
            };
            state.status = StepStatus::Completed;
            state.ended_at = Some(now);
            state.reservation.take()
        };
        if let Some(reservation) = reservation {
            self.pool.release(&reservation);
        }
        info!(step = step_id, time = now, "step completed");
        self.emit(Event::StepCompleted {
            step_id: step_id.to_string(),
            time: now,
        });
    }

    fn abort_step(&mut self, step_id: &str, reason: &str) {
        let now = self.current_time;
        let reservation = {
            let Some(state) = self.steps.get_mut(step_id) else {
                return;
            };
            state.status = StepStatus::Aborted;
            state.ended_at = Some(now);
            state.abort_reason = Some(reason.to_string());
            state.reservation.take()
        };
        if let Some(reservation) = reservation {
            self.pool.release(&reservation);
        }
        info!(step = step_id, time = now, reason, "step aborted");
        self.emit(Event::StepAborted {
            step_id: step_id.to_string(),
            time: now,
            reason: reason.to_string(),
        });
    }

    fn check_finished(&mut self) {
        let done = self.steps.values().all(|state| {
            matches!(state.status, StepStatus::Completed | StepStatus::Aborted)
        });
        if done && !self.finished {
            self.finished = true;
            self.set_status("Program execution completed".to_string());
            info!(time = self.current_time, "program finished");
            self.emit(Event::ProgramFinished {
                time: self.current_time,
            });
        }
    }

    fn set_status(&mut self, message: String) {
        debug!(status = %message);
        self.status_message = Some(message);
    }

    fn emit(&mut self, event: Event) {
        for listener in self.listeners.iter_mut() {
            listener(&event);
        }
    }
}

// ---------------------------------------------------------------------------
// Simulated runs
// ---------------------------------------------------------------------------

/// Result of driving a program to completion against a manual clock.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationReport {
    pub finished: bool,
    pub end_time: f64,
    pub events: Vec<Event>,
    pub steps: Vec<StepSnapshot>,
}

/// Run a program in simulated time with a fixed tick. Stops when the program
/// finishes or `max_seconds` of simulated time have elapsed (so indefinite
/// steps cannot hang the driver). Code blocks run through the given executor.
pub fn run_simulated(
    program: &Program,
    resolved: &ResolvedResources,
    executor: Box<dyn CodeExecutor>,
    time_scale: f64,
    max_seconds: f64,
    tick_seconds: f64,
) -> SimulationReport {
    use std::cell::RefCell;
    use std::rc::Rc;

    let clock = ManualClock::default();
    let events: Rc<RefCell<Vec<Event>>> = Rc::new(RefCell::new(Vec::new()));

    let mut scheduler = Scheduler::new(program, resolved);
    scheduler.set_clock(Box::new(clock.clone()));
    scheduler.set_executor(executor);
    scheduler.set_time_scale(time_scale);
    {
        let sink = Rc::clone(&events);
        scheduler.add_listener(Box::new(move |event| sink.borrow_mut().push(event.clone())));
    }

    scheduler.submit(Command::StartProgram);
    settle(&mut scheduler, &events);

    let tick = if tick_seconds > 0.0 { tick_seconds } else { 0.05 };
    loop {
        if scheduler.is_finished() {
            break;
        }
        let simulated = scheduler
            .program_start_time()
            .map(|start| scheduler.current_time() - start)
            .unwrap_or(0.0);
        if simulated >= max_seconds {
            break;
        }
        clock.advance(tick);
        settle(&mut scheduler, &events);
    }

    let report_events = events.borrow().clone();
    SimulationReport {
        finished: scheduler.is_finished(),
        end_time: scheduler.current_time(),
        events: report_events,
        steps: scheduler.snapshot(),
    }
}

/// Tick until the scheduler stops producing events at the current instant, so
/// completion-then-admission chains land on the same logical time.
fn settle(scheduler: &mut Scheduler, events: &std::rc::Rc<std::cell::RefCell<Vec<Event>>>) {
    loop {
        let before = events.borrow().len();
        scheduler.tick();
        if events.borrow().len() == before {
            break;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::EnvironmentCatalog;
    use crate::model::program_from_value;
    use serde_json::json;
    use std::cell::RefCell;
    use std::rc::Rc;

    struct Harness {
        scheduler: Scheduler,
        clock: ManualClock,
        events: Rc<RefCell<Vec<Event>>>,
    }

    impl Harness {
        fn new(document: serde_json::Value) -> Self {
            let program = program_from_value(document).unwrap();
            let resolved = EnvironmentCatalog::new().resolve(&program).unwrap();
            let clock = ManualClock::default();
            let events: Rc<RefCell<Vec<Event>>> = Rc::new(RefCell::new(Vec::new()));

            let mut scheduler = Scheduler::new(&program, &resolved);
            scheduler.set_clock(Box::new(clock.clone()));
            scheduler.set_executor(Box::new(NullExecutor));
            let sink = Rc::clone(&events);
            scheduler.add_listener(Box::new(move |e| sink.borrow_mut().push(e.clone())));

            Harness {
                scheduler,
                clock,
                events,
            }
        }

        fn start(&mut self) {
            self.scheduler.submit(Command::StartProgram);
            self.settle();
        }

        fn settle(&mut self) {
            loop {
                let before = self.events.borrow().len();
                self.scheduler.tick();
                if self.events.borrow().len() == before {
                    break;
                }
            }
        }

        fn advance(&mut self, seconds: f64) {
            self.clock.advance(seconds);
            self.settle();
        }

        fn status_of(&self, step_id: &str) -> StepStatus {
            self.scheduler.step(step_id).unwrap().status
        }

        fn times_of(&self, step_id: &str) -> (Option<f64>, Option<f64>) {
            let state = self.scheduler.step(step_id).unwrap();
            (state.started_at, state.ended_at)
        }
    }

    fn assert_near(actual: Option<f64>, expected: f64) {
        let actual = actual.expect("time not set");
        assert!(
            (actual - expected).abs() < 1e-6,
            "expected {expected}, got {actual}"
        );
    }

    #[test]
    fn linear_two_step_program() {
        let mut h = Harness::new(json!({
            "programId": "p", "name": "P", "version": "1", "actors": 1,
            "tracks": [{
                "trackId": "t", "name": "T",
                "steps": [
                    { "stepId": "a", "name": "A", "duration": 5,
                      "startTrigger": { "type": "programStart" } },
                    { "stepId": "b", "name": "B", "duration": 3,
                      "startTrigger": { "type": "afterStep", "stepId": "a" } }
                ]
            }]
        }));
        h.start();
        assert_eq!(h.status_of("a"), StepStatus::Running);
        assert_eq!(h.status_of("b"), StepStatus::Pending);

        h.advance(5.0);
        assert_eq!(h.status_of("a"), StepStatus::Completed);
        assert_eq!(h.status_of("b"), StepStatus::Running);
        assert_near(h.times_of("a").1, 5.0);
        assert_near(h.times_of("b").0, 5.0);

        h.advance(3.0);
        assert_eq!(h.status_of("b"), StepStatus::Completed);
        assert_near(h.times_of("b").1, 8.0);
        assert!(h.scheduler.is_finished());

        let events = h.events.borrow();
        let names: Vec<&str> = events
            .iter()
            .map(|e| match e {
                Event::ProgramStarted { .. } => "program_started",
                Event::ProgramFinished { .. } => "program_finished",
                Event::StepStarted { .. } => "step_started",
                Event::StepCompleted { .. } => "step_completed",
                Event::StepAborted { .. } => "step_aborted",
            })
            .collect();
        assert_eq!(
            names,
            vec![
                "program_started",
                "step_started",
                "step_completed",
                "step_started",
                "step_completed",
                "program_finished"
            ]
        );
    }

    #[test]
    fn concurrency_cap_serializes_equal_priority_steps() {
        let mut h = Harness::new(json!({
            "programId": "p", "name": "P", "version": "1",
            "resourceConstraints": [
                { "task": "cooking", "maxConcurrent": 1, "actorsRequired": 0.0 }
            ],
            "tracks": [
                { "trackId": "t1", "name": "T1", "steps": [
                    { "stepId": "a", "name": "A", "duration": 10, "task": "cooking",
                      "startTrigger": { "type": "programStart" } }
                ]},
                { "trackId": "t2", "name": "T2", "steps": [
                    { "stepId": "b", "name": "B", "duration": 10, "task": "cooking",
                      "startTrigger": { "type": "programStart" } }
                ]}
            ]
        }));
        h.start();
        assert_eq!(h.status_of("a"), StepStatus::Running);
        assert_eq!(h.status_of("b"), StepStatus::Pending);

        h.advance(10.0);
        assert_eq!(h.status_of("a"), StepStatus::Completed);
        assert_eq!(h.status_of("b"), StepStatus::Running);
        assert_near(h.times_of("b").0, 10.0);

        h.advance(10.0);
        assert!(h.scheduler.is_finished());
        assert_near(h.times_of("b").1, 20.0);
    }

    #[test]
    fn fractional_shares_run_concurrently() {
        let mut h = Harness::new(json!({
            "programId": "p", "name": "P", "version": "1",
            "resourceConstraints": [
                { "task": "mixing", "maxConcurrent": 1, "actorsRequired": 0.0 }
            ],
            "tracks": [
                { "trackId": "t1", "name": "T1", "steps": [
                    { "stepId": "x", "name": "X", "duration": 6,
                      "taskResources": [{ "name": "mixing", "fraction": 0.5 }],
                      "startTrigger": { "type": "programStart" } }
                ]},
                { "trackId": "t2", "name": "T2", "steps": [
                    { "stepId": "y", "name": "Y", "duration": 6,
                      "taskResources": [{ "name": "mixing", "fraction": 0.5 }],
                      "startTrigger": { "type": "programStart" } }
                ]}
            ]
        }));
        h.start();
        assert_eq!(h.status_of("x"), StepStatus::Running);
        assert_eq!(h.status_of("y"), StepStatus::Running);

        h.advance(6.0);
        assert!(h.scheduler.is_finished());
        assert_near(h.times_of("x").1, 6.0);
        assert_near(h.times_of("y").1, 6.0);
    }

    #[test]
    fn qualified_actor_selection_prefers_larger_pool() {
        let program = program_from_value(json!({
            "programId": "p", "name": "P", "version": "1",
            "environment": "bakery",
            "tracks": [
                { "trackId": "t1", "name": "T1", "steps": [
                    { "stepId": "a", "name": "A", "duration": 10, "task": "baking",
                      "startTrigger": { "type": "programStart" } }
                ]},
                { "trackId": "t2", "name": "T2", "steps": [
                    { "stepId": "b", "name": "B", "duration": 10, "task": "baking",
                      "startTrigger": { "type": "programStart" } }
                ]},
                { "trackId": "t3", "name": "T3", "steps": [
                    { "stepId": "c", "name": "C", "duration": 10, "task": "baking",
                      "startTrigger": { "type": "programStart" } }
                ]}
            ]
        }))
        .unwrap();
        let mut catalog = EnvironmentCatalog::new();
        catalog.insert(
            serde_json::from_value(json!({
                "environmentId": "bakery",
                "name": "Bakery",
                "type": "bakery",
                "actorTypes": {
                    "head-baker": { "name": "Head Baker", "count": 1 },
                    "baker": { "name": "Baker", "count": 2 }
                },
                "resourceConstraints": [
                    { "task": "baking", "maxConcurrent": 2, "actorsRequired": 1.0,
                      "qualifiedActorTypes": ["head-baker", "baker"],
                      "description": "oven work" }
                ]
            }))
            .unwrap(),
        );
        let resolved = catalog.resolve(&program).unwrap();

        let clock = ManualClock::default();
        let mut scheduler = Scheduler::new(&program, &resolved);
        scheduler.set_clock(Box::new(clock.clone()));
        scheduler.set_executor(Box::new(NullExecutor));

        scheduler.submit(Command::StartProgram);
        scheduler.tick();
        scheduler.tick();

        // Cap is 2 concurrent bakes; both admissions charge the baker pool.
        assert_eq!(scheduler.step("a").unwrap().status, StepStatus::Running);
        assert_eq!(scheduler.step("b").unwrap().status, StepStatus::Running);
        assert_eq!(scheduler.step("c").unwrap().status, StepStatus::Pending);
        assert!((scheduler.pool().actor_usage("baker") - 2.0).abs() < 1e-9);
        assert_eq!(scheduler.pool().actor_usage("head-baker"), 0.0);
    }

    #[test]
    fn abort_releases_resources_for_the_next_step() {
        let mut h = Harness::new(json!({
            "programId": "p", "name": "P", "version": "1",
            "resourceConstraints": [
                { "task": "cooking", "maxConcurrent": 1, "actorsRequired": 0.0 }
            ],
            "tracks": [
                { "trackId": "t1", "name": "T1", "steps": [
                    { "stepId": "s", "name": "S", "duration": 100, "task": "cooking",
                      "startTrigger": { "type": "programStart" } }
                ]},
                { "trackId": "t2", "name": "T2", "steps": [
                    { "stepId": "next", "name": "Next", "duration": 5, "task": "cooking",
                      "startTrigger": { "type": "programStart" } }
                ]}
            ]
        }));
        h.start();
        assert_eq!(h.status_of("s"), StepStatus::Running);
        assert_eq!(h.status_of("next"), StepStatus::Pending);

        h.advance(2.0);
        h.scheduler.submit(Command::Abort {
            step_id: "s".into(),
        });
        h.settle();

        assert_eq!(h.status_of("s"), StepStatus::Aborted);
        assert_near(h.times_of("s").1, 2.0);
        assert_eq!(h.status_of("next"), StepStatus::Running);
        assert!((h.scheduler.pool().task_usage("cooking") - 1.0).abs() < 1e-9);
    }

    #[test]
    fn abort_of_non_running_step_is_a_no_op() {
        let mut h = Harness::new(json!({
            "programId": "p", "name": "P", "version": "1", "actors": 1,
            "tracks": [{
                "trackId": "t", "name": "T",
                "steps": [
                    { "stepId": "a", "name": "A", "duration": 5,
                      "startTrigger": { "type": "programStart" } },
                    { "stepId": "b", "name": "B", "duration": 5,
                      "startTrigger": { "type": "afterStep", "stepId": "a" } }
                ]
            }]
        }));
        h.start();
        h.scheduler.submit(Command::Abort {
            step_id: "b".into(),
        });
        h.settle();
        assert_eq!(h.status_of("b"), StepStatus::Pending);
        assert!(h.scheduler.status_message().unwrap().contains("not running"));
    }

    #[test]
    fn empty_program_finishes_on_start() {
        let mut h = Harness::new(json!({
            "programId": "p", "name": "P", "version": "1", "actors": 1,
            "tracks": []
        }));
        h.start();
        assert!(h.scheduler.is_finished());
    }

    #[test]
    fn indefinite_step_only_ends_by_command() {
        let mut h = Harness::new(json!({
            "programId": "p", "name": "P", "version": "1", "actors": 1,
            "tracks": [{
                "trackId": "t", "name": "T",
                "steps": [{
                    "stepId": "hold", "name": "Hold",
                    "duration": { "type": "indefinite", "minSeconds": 0,
                                  "defaultSeconds": 10, "triggerName": "release" },
                    "startTrigger": { "type": "programStart" }
                }]
            }]
        }));
        h.start();
        assert_eq!(h.status_of("hold"), StepStatus::Running);

        // Runs far past its display default without completing.
        h.advance(500.0);
        assert_eq!(h.status_of("hold"), StepStatus::Running);
        assert!(!h.scheduler.is_finished());

        h.scheduler.submit(Command::Trigger {
            name: "release".into(),
            step_id: None,
        });
        h.settle();
        assert_eq!(h.status_of("hold"), StepStatus::Completed);
        assert!(h.scheduler.is_finished());
    }

    #[test]
    fn variable_step_respects_minimum_before_manual_completion() {
        let mut h = Harness::new(json!({
            "programId": "p", "name": "P", "version": "1", "actors": 1,
            "tracks": [{
                "trackId": "t", "name": "T",
                "steps": [{
                    "stepId": "brew", "name": "Brew",
                    "duration": { "type": "variable", "minSeconds": 5,
                                  "maxSeconds": 20, "defaultSeconds": 10,
                                  "triggerName": "done" },
                    "startTrigger": { "type": "programStart" }
                }]
            }]
        }));
        h.start();

        h.advance(2.0);
        h.scheduler.submit(Command::Trigger {
            name: "done".into(),
            step_id: None,
        });
        h.settle();
        assert_eq!(h.status_of("brew"), StepStatus::Running);
        assert!(h
            .scheduler
            .status_message()
            .unwrap()
            .contains("minimum duration"));

        h.advance(4.0);
        h.scheduler.submit(Command::Trigger {
            name: "done".into(),
            step_id: None,
        });
        h.settle();
        assert_eq!(h.status_of("brew"), StepStatus::Completed);
        assert_near(h.times_of("brew").1, 6.0);
    }

    #[test]
    fn variable_step_auto_completes_at_default() {
        let mut h = Harness::new(json!({
            "programId": "p", "name": "P", "version": "1", "actors": 1,
            "tracks": [{
                "trackId": "t", "name": "T",
                "steps": [{
                    "stepId": "brew", "name": "Brew",
                    "duration": { "type": "variable", "minSeconds": 5,
                                  "maxSeconds": 20, "defaultSeconds": 10 },
                    "startTrigger": { "type": "programStart" }
                }]
            }]
        }));
        h.start();
        h.advance(9.0);
        assert_eq!(h.status_of("brew"), StepStatus::Running);
        h.advance(1.0);
        assert_eq!(h.status_of("brew"), StepStatus::Completed);
        assert_near(h.times_of("brew").1, 10.0);
    }

    #[test]
    fn priority_beats_definition_order() {
        let mut h = Harness::new(json!({
            "programId": "p", "name": "P", "version": "1",
            "resourceConstraints": [
                { "task": "cooking", "maxConcurrent": 1, "actorsRequired": 0.0 }
            ],
            "tracks": [
                { "trackId": "t1", "name": "T1", "steps": [
                    { "stepId": "later", "name": "Later", "duration": 5, "task": "cooking",
                      "startTrigger": { "type": "programStart" } }
                ]},
                { "trackId": "t2", "name": "T2", "steps": [
                    { "stepId": "urgent", "name": "Urgent", "duration": 5, "task": "cooking",
                      "priority": 1,
                      "startTrigger": { "type": "programStart" } }
                ]}
            ]
        }));
        h.start();
        assert_eq!(h.status_of("urgent"), StepStatus::Running);
        assert_eq!(h.status_of("later"), StepStatus::Pending);
    }

    #[test]
    fn manual_start_trigger_routes_by_step_id() {
        let mut h = Harness::new(json!({
            "programId": "p", "name": "P", "version": "1", "actors": 2,
            "tracks": [
                { "trackId": "t1", "name": "T1", "steps": [
                    { "stepId": "a", "name": "A", "duration": 5,
                      "startTrigger": { "type": "manual", "triggerName": "go" } }
                ]},
                { "trackId": "t2", "name": "T2", "steps": [
                    { "stepId": "b", "name": "B", "duration": 5,
                      "startTrigger": { "type": "manual", "triggerName": "go" } }
                ]}
            ]
        }));
        h.start();
        assert_eq!(h.status_of("a"), StepStatus::Pending);

        h.scheduler.submit(Command::Trigger {
            name: "go".into(),
            step_id: Some("b".into()),
        });
        h.settle();
        assert_eq!(h.status_of("a"), StepStatus::Pending);
        assert_eq!(h.status_of("b"), StepStatus::Running);

        // Without a step id the remaining match fires too.
        h.scheduler.submit(Command::Trigger {
            name: "go".into(),
            step_id: None,
        });
        h.settle();
        assert_eq!(h.status_of("a"), StepStatus::Running);
    }

    #[test]
    fn unknown_trigger_is_surfaced_not_fatal() {
        let mut h = Harness::new(json!({
            "programId": "p", "name": "P", "version": "1", "actors": 1,
            "tracks": [{
                "trackId": "t", "name": "T",
                "steps": [{
                    "stepId": "a", "name": "A", "duration": 5,
                    "startTrigger": { "type": "programStart" }
                }]
            }]
        }));
        h.start();
        h.scheduler.submit(Command::Trigger {
            name: "nope".into(),
            step_id: None,
        });
        h.settle();
        assert!(h
            .scheduler
            .status_message()
            .unwrap()
            .contains("Unknown trigger"));
        assert_eq!(h.status_of("a"), StepStatus::Running);
    }

    #[test]
    fn composite_all_requires_manual_and_dependency() {
        let mut h = Harness::new(json!({
            "programId": "p", "name": "P", "version": "1", "actors": 2,
            "tracks": [{
                "trackId": "t", "name": "T",
                "steps": [
                    { "stepId": "a", "name": "A", "duration": 2,
                      "startTrigger": { "type": "programStart" } },
                    { "stepId": "b", "name": "B", "duration": 2,
                      "startTrigger": {
                        "logic": "all",
                        "triggers": [
                            { "type": "afterStep", "stepId": "a" },
                            { "type": "manual", "triggerName": "confirm" }
                        ]
                      } }
                ]
            }]
        }));
        h.start();
        h.advance(2.0);
        // Dependency met, manual not yet fired.
        assert_eq!(h.status_of("b"), StepStatus::Pending);

        h.scheduler.submit(Command::Trigger {
            name: "confirm".into(),
            step_id: None,
        });
        h.settle();
        assert_eq!(h.status_of("b"), StepStatus::Running);
    }

    #[test]
    fn code_block_failure_does_not_abort_the_step() {
        struct FailingExecutor;
        impl CodeExecutor for FailingExecutor {
            fn execute(&mut self, _: CodeKind, _: &str) -> Result<CodeOutcome, CodeError> {
                Err(CodeError::Spawn(std::io::Error::other("boom")))
            }
        }

        let program = program_from_value(json!({
            "programId": "p", "name": "P", "version": "1", "actors": 1,
            "tracks": [{
                "trackId": "t", "name": "T",
                "steps": [{
                    "stepId": "a", "name": "A", "duration": 5,
                    "codeBlock": { "type": "shell", "code": "echo {step.id}" },
                    "startTrigger": { "type": "programStart" }
                }]
            }]
        }))
        .unwrap();
        let resolved = EnvironmentCatalog::new().resolve(&program).unwrap();
        let clock = ManualClock::default();
        let mut scheduler = Scheduler::new(&program, &resolved);
        scheduler.set_clock(Box::new(clock.clone()));
        scheduler.set_executor(Box::new(FailingExecutor));

        scheduler.submit(Command::StartProgram);
        scheduler.tick();
        scheduler.tick();
        let state = scheduler.step("a").unwrap();
        assert_eq!(state.status, StepStatus::Running);
        assert!(state.code_error.is_some());

        clock.advance(5.0);
        scheduler.tick();
        assert_eq!(scheduler.step("a").unwrap().status, StepStatus::Completed);
    }

    #[test]
    fn symbolic_timings_match_executed_starts_without_contention() {
        let document = json!({
            "programId": "p", "name": "P", "version": "1", "actors": 4,
            "tracks": [
                { "trackId": "t1", "name": "T1", "steps": [
                    { "stepId": "a", "name": "A", "duration": 2,
                      "startTrigger": { "type": "programStart" } },
                    { "stepId": "b", "name": "B", "duration": 3,
                      "startTrigger": { "type": "afterStep", "stepId": "a" } }
                ]},
                { "trackId": "t2", "name": "T2", "steps": [
                    { "stepId": "c", "name": "C", "duration": 4,
                      "startTrigger": { "type": "programStartOffset", "offsetSeconds": 1 } }
                ]}
            ]
        });
        let program = program_from_value(document).unwrap();
        let timings =
            crate::simulate::compute_timings(&program, crate::simulate::DurationMode::Planned);

        let resolved = EnvironmentCatalog::new().resolve(&program).unwrap();
        let report = run_simulated(&program, &resolved, Box::new(NullExecutor), 1.0, 60.0, 0.05);
        assert!(report.finished);

        // Executed starts track the validator's symbolic starts up to the
        // simulation tick and the near-zero completion tolerance.
        for snapshot in &report.steps {
            let symbolic = timings[&snapshot.step_id].start as f64;
            let actual = snapshot.started_at.expect("step never started");
            assert!(
                (actual - symbolic).abs() < 0.3,
                "step {}: symbolic {} vs actual {}",
                snapshot.step_id,
                symbolic,
                actual
            );
        }
    }

    #[test]
    fn on_abort_trigger_starts_the_fallback_step() {
        let mut h = Harness::new(json!({
            "programId": "p", "name": "P", "version": "1", "actors": 2,
            "tracks": [
                { "trackId": "t1", "name": "T1", "steps": [
                    { "stepId": "risky", "name": "Risky", "duration": 100,
                      "startTrigger": { "type": "programStart" } }
                ]},
                { "trackId": "t2", "name": "T2", "steps": [
                    { "stepId": "cleanup", "name": "Cleanup", "duration": 5,
                      "startTrigger": { "type": "onAbort", "stepId": "risky" } }
                ]}
            ]
        }));
        h.start();
        h.advance(3.0);
        assert_eq!(h.status_of("cleanup"), StepStatus::Pending);

        h.scheduler.submit(Command::Abort {
            step_id: "risky".into(),
        });
        h.settle();
        assert_eq!(h.status_of("risky"), StepStatus::Aborted);
        assert_eq!(h.status_of("cleanup"), StepStatus::Running);

        let aborted = h
            .events
            .borrow()
            .iter()
            .any(|e| matches!(e, Event::StepAborted { step_id, .. } if step_id == "risky"));
        assert!(aborted);
    }

    #[test]
    fn force_complete_ends_a_running_step() {
        let mut h = Harness::new(json!({
            "programId": "p", "name": "P", "version": "1", "actors": 1,
            "tracks": [{
                "trackId": "t", "name": "T",
                "steps": [{
                    "stepId": "slow", "name": "Slow", "duration": 1000,
                    "startTrigger": { "type": "programStart" }
                }]
            }]
        }));
        h.start();
        h.advance(1.0);

        h.scheduler.submit(Command::ForceComplete {
            step_id: "slow".into(),
        });
        h.settle();
        assert_eq!(h.status_of("slow"), StepStatus::Completed);
        assert_near(h.times_of("slow").1, 1.0);
        assert!(h.scheduler.is_finished());
    }

    #[test]
    fn absolute_trigger_waits_for_wall_time() {
        // The manual clock counts epoch seconds here; the trigger time is
        // ten seconds past the epoch.
        let mut h = Harness::new(json!({
            "programId": "p", "name": "P", "version": "1", "actors": 1,
            "tracks": [{
                "trackId": "t", "name": "T",
                "steps": [{
                    "stepId": "timed", "name": "Timed", "duration": 5,
                    "startTrigger": { "type": "absolute", "time": "1970-01-01T00:00:10" }
                }]
            }]
        }));
        h.start();
        assert_eq!(h.status_of("timed"), StepStatus::Pending);

        h.advance(9.0);
        assert_eq!(h.status_of("timed"), StepStatus::Pending);

        h.advance(1.0);
        assert_eq!(h.status_of("timed"), StepStatus::Running);
        assert_near(h.times_of("timed").0, 10.0);
    }

    #[test]
    fn batched_tracks_materialize_with_stagger() {
        let mut h = Harness::new(json!({
            "programId": "p", "name": "P", "version": "1", "actors": 4,
            "tracks": [{
                "trackId": "loaf", "name": "Loaf",
                "batch_size": 2, "stagger": 10,
                "steps": [{
                    "stepId": "mix", "name": "Mix", "duration": 5,
                    "startTrigger": { "type": "programStart" }
                }]
            }]
        }));
        h.start();
        assert_eq!(h.status_of("mix_1"), StepStatus::Running);
        assert_eq!(h.status_of("mix_2"), StepStatus::Pending);

        h.advance(10.0);
        assert_eq!(h.status_of("mix_1"), StepStatus::Completed);
        assert_eq!(h.status_of("mix_2"), StepStatus::Running);
        assert_near(h.times_of("mix_2").0, 10.0);

        h.advance(5.0);
        assert!(h.scheduler.is_finished());
    }

    #[test]
    fn run_simulated_drives_to_completion() {
        let program = program_from_value(json!({
            "programId": "p", "name": "P", "version": "1", "actors": 1,
            "tracks": [{
                "trackId": "t", "name": "T",
                "steps": [
                    { "stepId": "a", "name": "A", "duration": 2,
                      "startTrigger": { "type": "programStart" } },
                    { "stepId": "b", "name": "B", "duration": 1,
                      "startTrigger": { "type": "afterStep", "stepId": "a" } }
                ]
            }]
        }))
        .unwrap();
        let resolved = EnvironmentCatalog::new().resolve(&program).unwrap();
        let report = run_simulated(&program, &resolved, Box::new(NullExecutor), 1.0, 60.0, 0.05);

        assert!(report.finished);
        assert!(report.end_time > 2.5 && report.end_time < 3.3);
        assert!(report
            .events
            .iter()
            .any(|e| matches!(e, Event::ProgramFinished { .. })));
    }
}
