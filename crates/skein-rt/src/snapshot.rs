// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Point-in-time dump of a runtime: carriers, live tasks, open scopes and
//! gate diagnostics.

use std::fmt;

use serde::Serialize;

use crate::gate::Resource;
use crate::green::scheduler::Shared;
use crate::green::task::{TaskId, TaskState};
use crate::scope::{Phase, Policy, ScopeId};

#[derive(Debug, Clone, Serialize)]
pub struct CarrierInfo {
    pub id: usize,
    pub name: String,
    pub current: Option<TaskId>,
    pub pinned: bool,
    pub polls: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskInfo {
    pub id: TaskId,
    pub parent: Option<TaskId>,
    pub scope: Option<ScopeId>,
    pub state: TaskState,
    pub blocked_on: Option<Resource>,
    pub spawned_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScopeInfo {
    pub id: ScopeId,
    pub name: String,
    pub parent: Option<ScopeId>,
    pub owner: String,
    pub policy: Policy,
    pub phase: Phase,
    pub live: usize,
    pub open_children: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RuntimeSnapshot {
    pub carriers: Vec<CarrierInfo>,
    pub tasks: Vec<TaskInfo>,
    pub scopes: Vec<ScopeInfo>,
    pub pinned: usize,
    pub runnable: usize,
    pub diagnostics: Vec<String>,
}

impl RuntimeSnapshot {
    pub(crate) fn capture(shared: &Shared) -> Self {
        let carriers = shared
            .carriers
            .iter()
            .map(|c| CarrierInfo {
                id: c.id,
                name: c.name.clone(),
                current: c.current(),
                pinned: c.is_pinned(),
                polls: c.polls(),
            })
            .collect();

        let tasks = shared
            .live_tasks()
            .iter()
            .map(|t| TaskInfo {
                id: t.id(),
                parent: t.header.parent,
                scope: t.header.scope.as_ref().map(|s| s.id),
                state: t.state(),
                blocked_on: t.blocked_on(),
                spawned_at: t.header.spawned_at.to_string(),
            })
            .collect();

        let scopes = shared
            .scopes
            .open_scopes()
            .iter()
            .map(|s| ScopeInfo {
                id: s.id,
                name: s.name.clone(),
                parent: s.parent.as_ref().map(|p| p.id),
                owner: s.owner.to_string(),
                policy: s.policy,
                phase: s.phase(),
                live: s.live(),
                open_children: s.open_children(),
            })
            .collect();

        Self {
            carriers,
            tasks,
            scopes,
            pinned: shared.gate.pinned(),
            runnable: shared.runnable(),
            diagnostics: shared
                .gate
                .diagnostics()
                .iter()
                .map(ToString::to_string)
                .collect(),
        }
    }

    /// Tasks currently in `state`.
    pub fn count(&self, state: TaskState) -> usize {
        self.tasks.iter().filter(|t| t.state == state).count()
    }
}

impl fmt::Display for RuntimeSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "carriers: {} ({} pinned), runnable: {}",
            self.carriers.len(),
            self.pinned,
            self.runnable
        )?;
        for c in &self.carriers {
            let current = c
                .current
                .map_or_else(|| "idle".to_string(), |t| t.to_string());
            let pinned = if c.pinned { " [pinned]" } else { "" };
            writeln!(f, "  {}: {}{} ({} polls)", c.name, current, pinned, c.polls)?;
        }
        if !self.scopes.is_empty() {
            writeln!(f, "scopes:")?;
            for s in &self.scopes {
                writeln!(
                    f,
                    "  {} `{}` {:?} {:?} owner={} live={} children={}",
                    s.id, s.name, s.phase, s.policy, s.owner, s.live, s.open_children
                )?;
            }
        }
        if !self.tasks.is_empty() {
            writeln!(f, "tasks:")?;
            for t in &self.tasks {
                write!(f, "  {} {:?}", t.id, t.state)?;
                if let Some(resource) = t.blocked_on {
                    write!(f, " on {}", resource)?;
                }
                if let Some(scope) = t.scope {
                    write!(f, " in {}", scope)?;
                }
                writeln!(f, " (spawned at {})", t.spawned_at)?;
            }
        }
        for d in &self.diagnostics {
            writeln!(f, "warning: {}", d)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Runtime;
    use crate::scope::Policy;
    use crate::sync::Latch;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn shows_parked_tasks_and_scopes() {
        let rt = Runtime::with_carriers(2).unwrap();
        let latch = Arc::new(Latch::new(1));
        let scope = rt.open_scope("dump", Policy::CollectAll);
        for _ in 0..3 {
            let latch = latch.clone();
            scope.fork(async move { latch.wait().await }).unwrap();
        }
        std::thread::sleep(Duration::from_millis(50));

        let snap = rt.snapshot();
        assert_eq!(snap.carriers.len(), 2);
        assert_eq!(snap.count(TaskState::Parked), 3);
        assert!(snap
            .tasks
            .iter()
            .all(|t| t.blocked_on == Some(Resource::Latch) && t.scope == Some(scope.id())));
        assert_eq!(snap.scopes.len(), 1);
        assert_eq!(snap.scopes[0].live, 3);

        let text = snap.to_string();
        assert!(text.contains("dump"));
        assert!(text.contains("on latch"));
        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["tasks"].as_array().unwrap().len(), 3);

        latch.count_down();
        scope.join_blocking().unwrap();
        scope.close().unwrap();
        assert!(rt.snapshot().scopes.is_empty());
    }
}
