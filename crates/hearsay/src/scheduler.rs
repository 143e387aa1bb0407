//! Pending-task registry for in-flight protocol sub-operations

use crate::node::{Node, NodeId};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::time::Instant;

/// An in-flight protocol sub-operation awaiting a correlated ack or a
/// timeout. The correlation key is the id of the peer whose ack would
/// satisfy the task.
#[derive(Debug, Clone)]
pub enum Task {
    /// Direct probe sent to `target`; unanswered, it escalates to
    /// indirect probes.
    Probe { target: Node },

    /// Indirect probes fanned out for `target`; unanswered, the target
    /// becomes suspected.
    IndirectProbe { target: Node },

    /// `target` is suspected; without a refuting ack it is declared failed.
    Suspicion { target: Node },

    /// A ping forwarded to a peer on behalf of `requester`; the peer's ack
    /// must be relayed back to the requester.
    PingReqRelay { requester: Node, target: NodeId },
}

impl Task {
    /// The id whose ack satisfies this task.
    pub fn id(&self) -> &str {
        match self {
            Task::Probe { target }
            | Task::IndirectProbe { target }
            | Task::Suspicion { target } => &target.id,
            Task::PingReqRelay { target, .. } => target,
        }
    }
}

/// Registry of pending tasks, indexed by correlation id and by deadline.
///
/// Multiple tasks may share an id (e.g. several concurrent ping-reqs
/// targeting the same peer). Tasks are owned here exclusively from
/// registration until they are fetched on a correlated ack or swept as
/// timed out; the caller decides what satisfaction or escalation means.
#[derive(Debug)]
pub struct TaskScheduler {
    timeout: Duration,
    tasks: HashMap<NodeId, Vec<(Task, Instant)>>,
    deadlines: BTreeMap<Instant, Vec<NodeId>>,
}

impl TaskScheduler {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            tasks: HashMap::new(),
            deadlines: BTreeMap::new(),
        }
    }

    /// Number of pending tasks.
    pub fn len(&self) -> usize {
        self.tasks.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Check whether any task is pending under `id`.
    pub fn contains(&self, id: &str) -> bool {
        self.tasks.contains_key(id)
    }

    /// Register a task with the default timeout.
    pub fn add(&mut self, task: Task) {
        self.add_with_timeout(task, self.timeout);
    }

    /// Register a task expiring after `timeout`.
    pub fn add_with_timeout(&mut self, task: Task, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        let id = task.id().to_owned();
        self.tasks
            .entry(id.clone())
            .or_default()
            .push((task, deadline));
        self.deadlines.entry(deadline).or_default().push(id);
    }

    /// Remove and return every task registered under `id`.
    ///
    /// Called when a correlated ack arrives: all tasks waiting on that id
    /// are satisfied at once. Stale deadline-index entries are skipped by
    /// the sweep.
    pub fn fetch(&mut self, id: &str) -> Vec<Task> {
        match self.tasks.remove(id) {
            Some(entries) => entries.into_iter().map(|(task, _)| task).collect(),
            None => Vec::new(),
        }
    }

    /// Sweep out every task whose deadline has passed.
    ///
    /// Expired tasks are removed from both indexes and handed back for
    /// escalation.
    pub fn timeout_tasks(&mut self) -> Vec<Task> {
        let now = Instant::now();

        let mut expired_ids = Vec::new();
        while let Some(entry) = self.deadlines.first_entry() {
            if *entry.key() > now {
                break;
            }
            expired_ids.extend(entry.remove());
        }

        let mut results = Vec::new();
        for id in expired_ids {
            let Some(entries) = self.tasks.get_mut(&id) else {
                // Already satisfied by an ack.
                continue;
            };

            let mut i = 0;
            while i < entries.len() {
                if entries[i].1 <= now {
                    results.push(entries.remove(i).0);
                } else {
                    i += 1;
                }
            }
            if entries.is_empty() {
                self.tasks.remove(&id);
            }
        }

        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str) -> Node {
        Node::new(id, "127.0.0.1:7946".parse().unwrap(), 1)
    }

    fn probe(id: &str) -> Task {
        Task::Probe { target: node(id) }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_returns_all_tasks_under_id() {
        let mut scheduler = TaskScheduler::new(Duration::from_millis(500));
        scheduler.add(probe("x"));
        scheduler.add(Task::PingReqRelay {
            requester: node("r"),
            target: "x".to_owned(),
        });
        scheduler.add(probe("y"));

        let fetched = scheduler.fetch("x");
        assert_eq!(fetched.len(), 2);
        assert!(fetched.iter().all(|t| t.id() == "x"));

        // Fetch is remove-and-return: nothing left under "x".
        assert!(scheduler.fetch("x").is_empty());
        assert_eq!(scheduler.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetched_tasks_never_time_out() {
        let mut scheduler = TaskScheduler::new(Duration::from_millis(500));
        scheduler.add(probe("x"));
        scheduler.fetch("x");

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(scheduler.timeout_tasks().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_sweep_exactness() {
        let mut scheduler = TaskScheduler::new(Duration::from_millis(500));
        scheduler.add(probe("x"));

        // Before t + T: never swept.
        tokio::time::advance(Duration::from_millis(499)).await;
        assert!(scheduler.timeout_tasks().is_empty());

        // At or after t + T: swept exactly once.
        tokio::time::advance(Duration::from_millis(1)).await;
        let expired = scheduler.timeout_tasks();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id(), "x");
        assert!(scheduler.is_empty());

        assert!(scheduler.timeout_tasks().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_task_timeouts() {
        let mut scheduler = TaskScheduler::new(Duration::from_millis(500));
        scheduler.add(probe("fast"));
        scheduler.add_with_timeout(probe("slow"), Duration::from_secs(4));

        tokio::time::advance(Duration::from_millis(500)).await;
        let expired = scheduler.timeout_tasks();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id(), "fast");

        tokio::time::advance(Duration::from_secs(4)).await;
        let expired = scheduler.timeout_tasks();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id(), "slow");
    }

    #[tokio::test(start_paused = true)]
    async fn test_refreshed_task_survives_stale_deadline() {
        let mut scheduler = TaskScheduler::new(Duration::from_millis(500));
        scheduler.add(probe("x"));

        tokio::time::advance(Duration::from_millis(400)).await;
        // Satisfied and re-registered under the same id.
        scheduler.fetch("x");
        scheduler.add(probe("x"));

        // The first registration's deadline passes; the fresh task stays.
        tokio::time::advance(Duration::from_millis(100)).await;
        assert!(scheduler.timeout_tasks().is_empty());
        assert_eq!(scheduler.len(), 1);

        tokio::time::advance(Duration::from_millis(400)).await;
        assert_eq!(scheduler.timeout_tasks().len(), 1);
    }
}
