use std::collections::{BTreeMap, HashMap};

use crate::environment::ResolvedResources;

/// Tolerance for fractional-share float comparisons.
const SHARE_EPSILON: f64 = 1e-9;

// ---------------------------------------------------------------------------
// Pool state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct TaskLimits {
    max_concurrent: f64,
    actors_required: f64,
    qualified: Vec<String>,
}

/// What one admitted step holds: fractional task shares plus the actor-type
/// charges they cost. Released verbatim on completion or abort.
#[derive(Debug, Clone, Default)]
pub struct Reservation {
    pub task_shares: Vec<(String, f64)>,
    pub actor_charges: Vec<(String, f64)>,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AdmissionDenied {
    #[error("task '{0}' has no declared constraint")]
    UnknownTask(String),
    #[error("task '{task}' is at capacity ({usage:.2}/{max})")]
    TaskBusy { task: String, usage: f64, max: f64 },
    #[error("no qualified actor type has {needed:.2} free for task '{task}'")]
    NoQualifiedActors { task: String, needed: f64 },
}

/// Live concurrent-use accounting for tasks and actor types. Reservations are
/// all-or-nothing: either every share in a request fits and all deltas commit
/// together, or nothing changes.
#[derive(Debug)]
pub struct ResourcePool {
    limits: HashMap<String, TaskLimits>,
    usage: HashMap<String, f64>,
    actor_capacity: BTreeMap<String, f64>,
    actor_usage: BTreeMap<String, f64>,
    /// Per-task cap for tasks with no declared constraint; `None` rejects
    /// them outright.
    implicit_limit: Option<f64>,
}

impl ResourcePool {
    pub fn new(resolved: &ResolvedResources) -> Self {
        let limits = resolved
            .constraints
            .iter()
            .map(|c| {
                (
                    c.task.clone(),
                    TaskLimits {
                        max_concurrent: c.max_concurrent as f64,
                        actors_required: c.actors_required,
                        qualified: c.qualified_actor_types.clone(),
                    },
                )
            })
            .collect();
        let actor_capacity: BTreeMap<String, f64> = resolved
            .actor_types
            .iter()
            .map(|(id, t)| (id.clone(), t.count as f64))
            .collect();
        let actor_usage = actor_capacity.keys().map(|k| (k.clone(), 0.0)).collect();

        Self {
            limits,
            usage: HashMap::new(),
            actor_capacity,
            actor_usage,
            implicit_limit: resolved.implicit_limit.map(|n| n as f64),
        }
    }

    fn limits_for(&mut self, task: &str) -> Result<TaskLimits, AdmissionDenied> {
        if let Some(limits) = self.limits.get(task) {
            return Ok(limits.clone());
        }
        let Some(limit) = self.implicit_limit else {
            return Err(AdmissionDenied::UnknownTask(task.to_string()));
        };
        // Undeclared task under an actors-only program: capped by the actor
        // count, performable by any pool type.
        let implicit = TaskLimits {
            max_concurrent: limit,
            actors_required: 1.0,
            qualified: self.actor_capacity.keys().cloned().collect(),
        };
        self.limits.insert(task.to_string(), implicit.clone());
        Ok(implicit)
    }

    /// Attempt to reserve every `(task, fraction)` share atomically.
    pub fn try_reserve(&mut self, shares: &[(String, f64)]) -> Result<Reservation, AdmissionDenied> {
        let mut task_deltas: Vec<(String, f64)> = Vec::new();
        let mut actor_deltas: BTreeMap<String, f64> = BTreeMap::new();

        for (task, fraction) in shares {
            let limits = self.limits_for(task)?;

            let pending: f64 = task_deltas
                .iter()
                .filter(|(t, _)| t == task)
                .map(|(_, f)| f)
                .sum();
            let current = self.usage.get(task).copied().unwrap_or(0.0) + pending;
            if current + fraction > limits.max_concurrent + SHARE_EPSILON {
                return Err(AdmissionDenied::TaskBusy {
                    task: task.clone(),
                    usage: current,
                    max: limits.max_concurrent,
                });
            }
            task_deltas.push((task.clone(), *fraction));

            let needed = limits.actors_required * fraction;
            if needed <= SHARE_EPSILON {
                continue;
            }

            // Greatest remaining capacity wins; ties go to the
            // lexicographically smaller actor-type id.
            let mut best: Option<(String, f64)> = None;
            for actor_type in &limits.qualified {
                let Some(capacity) = self.actor_capacity.get(actor_type) else {
                    continue;
                };
                let used = self.actor_usage.get(actor_type).copied().unwrap_or(0.0)
                    + actor_deltas.get(actor_type).copied().unwrap_or(0.0);
                let remaining = capacity - used;
                if remaining + SHARE_EPSILON < needed {
                    continue;
                }
                let better = match &best {
                    None => true,
                    Some((best_type, best_remaining)) => {
                        remaining > best_remaining + SHARE_EPSILON
                            || ((remaining - best_remaining).abs() <= SHARE_EPSILON
                                && actor_type < best_type)
                    }
                };
                if better {
                    best = Some((actor_type.clone(), remaining));
                }
            }

            let Some((chosen, _)) = best else {
                return Err(AdmissionDenied::NoQualifiedActors {
                    task: task.clone(),
                    needed,
                });
            };
            *actor_deltas.entry(chosen).or_insert(0.0) += needed;
        }

        for (task, fraction) in &task_deltas {
            *self.usage.entry(task.clone()).or_insert(0.0) += fraction;
        }
        for (actor_type, amount) in &actor_deltas {
            *self.actor_usage.entry(actor_type.clone()).or_insert(0.0) += amount;
        }

        Ok(Reservation {
            task_shares: task_deltas,
            actor_charges: actor_deltas.into_iter().collect(),
        })
    }

    /// Refund exactly what a reservation charged. Clamped at zero so float
    /// residue can never drive a counter negative.
    pub fn release(&mut self, reservation: &Reservation) {
        for (task, fraction) in &reservation.task_shares {
            if let Some(usage) = self.usage.get_mut(task) {
                *usage = (*usage - fraction).max(0.0);
            }
        }
        for (actor_type, amount) in &reservation.actor_charges {
            if let Some(usage) = self.actor_usage.get_mut(actor_type) {
                *usage = (*usage - amount).max(0.0);
            }
        }
    }

    pub fn task_usage(&self, task: &str) -> f64 {
        self.usage.get(task).copied().unwrap_or(0.0)
    }

    pub fn actor_usage(&self, actor_type: &str) -> f64 {
        self.actor_usage.get(actor_type).copied().unwrap_or(0.0)
    }

    pub fn actor_capacity(&self, actor_type: &str) -> f64 {
        self.actor_capacity.get(actor_type).copied().unwrap_or(0.0)
    }

    /// `(task, usage, max)` rows for display adapters.
    pub fn task_rows(&self) -> Vec<(String, f64, f64)> {
        let mut rows: Vec<(String, f64, f64)> = self
            .limits
            .iter()
            .map(|(task, limits)| (task.clone(), self.task_usage(task), limits.max_concurrent))
            .collect();
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        rows
    }

    /// `(actor type, usage, capacity)` rows for display adapters.
    pub fn actor_rows(&self) -> Vec<(String, f64, f64)> {
        self.actor_capacity
            .iter()
            .map(|(id, capacity)| (id.clone(), self.actor_usage(id), *capacity))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::{ActorType, ResourceConstraint};
    use std::collections::BTreeMap;

    fn constraint(task: &str, max: u32, actors: f64, qualified: &[&str]) -> ResourceConstraint {
        ResourceConstraint {
            task: task.to_string(),
            max_concurrent: max,
            actors_required: actors,
            qualified_actor_types: qualified.iter().map(|s| s.to_string()).collect(),
            description: None,
        }
    }

    fn actor(name: &str, count: u32) -> ActorType {
        ActorType {
            name: name.to_string(),
            count,
            qualifications: Vec::new(),
            description: None,
        }
    }

    fn pool(
        constraints: Vec<ResourceConstraint>,
        actors: Vec<(&str, u32)>,
        implicit: Option<u32>,
    ) -> ResourcePool {
        let actor_types: BTreeMap<String, ActorType> = actors
            .into_iter()
            .map(|(id, count)| (id.to_string(), actor(id, count)))
            .collect();
        ResourcePool::new(&ResolvedResources {
            constraints,
            actor_types,
            implicit_limit: implicit,
        })
    }

    #[test]
    fn fractional_shares_fit_under_cap() {
        let mut pool = pool(
            vec![constraint("mixing", 1, 0.0, &[])],
            vec![("generic", 1)],
            None,
        );
        let first = pool.try_reserve(&[("mixing".into(), 0.5)]).unwrap();
        let _second = pool.try_reserve(&[("mixing".into(), 0.5)]).unwrap();
        assert!((pool.task_usage("mixing") - 1.0).abs() < 1e-9);

        let third = pool.try_reserve(&[("mixing".into(), 0.5)]);
        assert!(matches!(third, Err(AdmissionDenied::TaskBusy { .. })));

        pool.release(&first);
        assert!((pool.task_usage("mixing") - 0.5).abs() < 1e-9);
    }

    #[test]
    fn picks_actor_type_with_greatest_remaining_capacity() {
        let mut pool = pool(
            vec![constraint("baking", 3, 1.0, &["head-baker", "baker"])],
            vec![("head-baker", 1), ("baker", 2)],
            None,
        );

        let first = pool.try_reserve(&[("baking".into(), 1.0)]).unwrap();
        assert_eq!(first.actor_charges, vec![("baker".to_string(), 1.0)]);

        // baker and head-baker are now tied at 1 remaining; lexicographic id
        // breaks the tie.
        let second = pool.try_reserve(&[("baking".into(), 1.0)]).unwrap();
        assert_eq!(second.actor_charges, vec![("baker".to_string(), 1.0)]);

        let third = pool.try_reserve(&[("baking".into(), 1.0)]).unwrap();
        assert_eq!(third.actor_charges, vec![("head-baker".to_string(), 1.0)]);

        let fourth = pool.try_reserve(&[("baking".into(), 1.0)]);
        assert!(matches!(
            fourth,
            Err(AdmissionDenied::NoQualifiedActors { .. })
        ));
    }

    #[test]
    fn failed_request_commits_nothing() {
        let mut pool = pool(
            vec![
                constraint("mixing", 2, 0.0, &[]),
                constraint("baking", 1, 1.0, &["baker"]),
            ],
            vec![("baker", 0)],
            None,
        );

        let denied = pool.try_reserve(&[("mixing".into(), 1.0), ("baking".into(), 1.0)]);
        assert!(denied.is_err());
        assert_eq!(pool.task_usage("mixing"), 0.0);
        assert_eq!(pool.task_usage("baking"), 0.0);
    }

    #[test]
    fn release_refunds_the_charged_type() {
        let mut pool = pool(
            vec![constraint("baking", 2, 1.0, &["head-baker", "baker"])],
            vec![("head-baker", 1), ("baker", 2)],
            None,
        );
        let reservation = pool.try_reserve(&[("baking".into(), 1.0)]).unwrap();
        assert_eq!(pool.actor_usage("baker"), 1.0);
        pool.release(&reservation);
        assert_eq!(pool.actor_usage("baker"), 0.0);
        assert_eq!(pool.actor_usage("head-baker"), 0.0);
    }

    #[test]
    fn unknown_task_uses_implicit_limit_when_present() {
        let mut with_fallback = pool(vec![], vec![("generic", 2)], Some(2));
        assert!(with_fallback.try_reserve(&[("sweep".into(), 1.0)]).is_ok());
        assert!(with_fallback.try_reserve(&[("sweep".into(), 1.0)]).is_ok());
        assert!(matches!(
            with_fallback.try_reserve(&[("sweep".into(), 1.0)]),
            Err(AdmissionDenied::NoQualifiedActors { .. }) | Err(AdmissionDenied::TaskBusy { .. })
        ));

        let mut without = pool(vec![], vec![("generic", 2)], None);
        assert!(matches!(
            without.try_reserve(&[("sweep".into(), 1.0)]),
            Err(AdmissionDenied::UnknownTask(_))
        ));
    }

    #[test]
    fn in_attempt_reservations_are_visible() {
        // Two shares of the same task in one request must both count.
        let mut pool = pool(
            vec![constraint("mixing", 1, 0.0, &[])],
            vec![("generic", 1)],
            None,
        );
        let denied = pool.try_reserve(&[("mixing".into(), 0.6), ("mixing".into(), 0.6)]);
        assert!(matches!(denied, Err(AdmissionDenied::TaskBusy { .. })));
    }
}
