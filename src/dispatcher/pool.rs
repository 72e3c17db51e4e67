//! Task pool
//!
//! ```text
//! get_next_task
//!   ├─→ requeue FIFO (UnTreated)        served first
//!   └─→ cursor ─→ first NotProcessed    never moves backwards
//! ```
//!
//! Every operation runs inside one critical section, so a task index is
//! handed to at most one caller at a time.

use super::task::{FileDescriptor, Mesher, Task, TaskState};
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use tracing::{debug, warn};

#[derive(Debug, Default)]
struct PoolState {
    tasks: Vec<Task>,
    next_task_index: usize,
    completed_task_count: usize,
    requeued: VecDeque<usize>,
    known_files: HashSet<u32>,
}

/// Thread-safe list of import tasks
#[derive(Debug)]
pub struct TaskPool {
    max_retries: u8,
    state: Mutex<PoolState>,
}

impl TaskPool {
    pub fn new(max_retries: u8) -> Self {
        Self {
            max_retries,
            state: Mutex::new(PoolState::default()),
        }
    }

    /// Append a task for `file`; `None` if the file is already in the pool
    pub fn add_task(&self, file: FileDescriptor, mesher: Mesher) -> Option<usize> {
        let mut state = self.state.lock();
        if !state.known_files.insert(file.uid()) {
            debug!(file = %file, "File already queued");
            return None;
        }

        let index = state.tasks.len();
        debug!(task_index = index, file = %file, mesher = %mesher, "Task added");
        state
            .tasks
            .push(Task::new(index, file, mesher, self.max_retries));
        Some(index)
    }

    /// Claim the next pending task and mark it `Running`
    pub fn get_next_task(&self) -> Option<Task> {
        let mut state = self.state.lock();

        while let Some(index) = state.requeued.pop_front() {
            let task = &mut state.tasks[index];
            if task.state == TaskState::UnTreated {
                task.state = TaskState::Running;
                return Some(task.clone());
            }
        }

        while state.next_task_index < state.tasks.len() {
            let index = state.next_task_index;
            state.next_task_index += 1;

            let task = &mut state.tasks[index];
            if task.state == TaskState::NotProcessed {
                task.state = TaskState::Running;
                return Some(task.clone());
            }
        }

        None
    }

    /// Record a new state for task `index`
    ///
    /// Only final states and `UnTreated` are accepted. `NotProcessed` and
    /// `Running` are owned by the pool and are ignored with a warning.
    pub fn set_task_state(&self, index: usize, new_state: TaskState) {
        if matches!(new_state, TaskState::NotProcessed | TaskState::Running) {
            warn!(task_index = index, state = %new_state, "Rejected state change");
            return;
        }
        let mut state = self.state.lock();
        Self::apply_state(&mut state, index, new_state);
    }

    fn apply_state(state: &mut PoolState, index: usize, new_state: TaskState) {
        let Some(task) = state.tasks.get_mut(index) else {
            warn!(task_index = index, "State change for unknown task");
            return;
        };

        let was_terminal = task.state.is_terminal();
        task.state = new_state;

        if new_state.is_terminal() && !was_terminal {
            state.completed_task_count += 1;
        } else if !new_state.is_terminal() && was_terminal {
            state.completed_task_count -= 1;
        }

        if new_state == TaskState::UnTreated {
            state.requeued.push_back(index);
        }
    }

    /// Apply the retry policy after a worker failed on task `index`.
    ///
    /// Returns `UnTreated` if the task was requeued, `ProcessFailed` once its
    /// retry budget is spent.
    pub fn report_failure(&self, index: usize) -> TaskState {
        let mut state = self.state.lock();
        let Some(task) = state.tasks.get_mut(index) else {
            warn!(task_index = index, "Failure reported for unknown task");
            return TaskState::ProcessFailed;
        };

        let next = if task.retries_remaining > 0 {
            task.retries_remaining -= 1;
            TaskState::UnTreated
        } else {
            TaskState::ProcessFailed
        };
        Self::apply_state(&mut state, index, next);
        next
    }

    /// Move every task that is not finished to `terminal_state`.
    ///
    /// Returns how many tasks were abandoned.
    pub fn abandon_pending(&self, terminal_state: TaskState) -> usize {
        assert!(terminal_state.is_terminal());

        let mut state = self.state.lock();
        let unfinished: Vec<usize> = state
            .tasks
            .iter()
            .filter(|task| !task.state.is_terminal())
            .map(|task| task.index)
            .collect();

        for &index in &unfinished {
            Self::apply_state(&mut state, index, terminal_state);
        }
        let len = state.tasks.len();
        state.requeued.clear();
        state.next_task_index = len;
        unfinished.len()
    }

    /// Hand tasks left `Running` by vanished workers back to the queue.
    ///
    /// Their retry budget is untouched. Returns how many were reclaimed.
    pub fn reclaim_running(&self) -> usize {
        let mut state = self.state.lock();
        let running: Vec<usize> = state
            .tasks
            .iter()
            .filter(|task| task.state == TaskState::Running)
            .map(|task| task.index)
            .collect();

        for &index in &running {
            Self::apply_state(&mut state, index, TaskState::UnTreated);
        }
        running.len()
    }

    pub fn is_over(&self) -> bool {
        let state = self.state.lock();
        state.completed_task_count == state.tasks.len()
    }

    pub fn len(&self) -> usize {
        self.state.lock().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().tasks.is_empty()
    }

    pub fn completed_count(&self) -> usize {
        self.state.lock().completed_task_count
    }

    pub fn task(&self, index: usize) -> Option<Task> {
        self.state.lock().tasks.get(index).cloned()
    }

    pub fn snapshot(&self) -> Vec<Task> {
        self.state.lock().tasks.clone()
    }

    pub fn running_count(&self) -> usize {
        self.count_where(|task| task.state == TaskState::Running)
    }

    pub fn pending_count(&self) -> usize {
        self.count_where(|task| task.state.is_pending())
    }

    /// Number of tasks currently in `state`
    pub fn count_in_state(&self, state: TaskState) -> usize {
        self.count_where(|task| task.state == state)
    }

    fn count_where(&self, predicate: impl Fn(&Task) -> bool) -> usize {
        self.state
            .lock()
            .tasks
            .iter()
            .filter(|task| predicate(task))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_with(files: &[&str], retries: u8) -> TaskPool {
        let pool = TaskPool::new(retries);
        for file in files {
            pool.add_task(FileDescriptor::new(*file), Mesher::CadKernel);
        }
        pool
    }

    #[test]
    fn test_tasks_served_in_order() {
        let pool = pool_with(&["a.step", "b.step", "c.step"], 1);

        assert_eq!(pool.get_next_task().map(|t| t.index), Some(0));
        assert_eq!(pool.get_next_task().map(|t| t.index), Some(1));
        assert_eq!(pool.get_next_task().map(|t| t.index), Some(2));
        assert!(pool.get_next_task().is_none());
        assert_eq!(pool.running_count(), 3);
    }

    #[test]
    fn test_duplicate_file_not_added() {
        let pool = TaskPool::new(1);
        assert_eq!(pool.add_task(FileDescriptor::new("a.step"), Mesher::CadKernel), Some(0));
        assert_eq!(pool.add_task(FileDescriptor::new("a.step"), Mesher::TechSoft), None);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_is_over_counts_terminal_states_once() {
        let pool = pool_with(&["a.step", "b.step"], 1);
        assert!(!pool.is_over());

        pool.set_task_state(0, TaskState::ProcessOk);
        pool.set_task_state(0, TaskState::ProcessOk);
        assert_eq!(pool.completed_count(), 1);
        assert!(!pool.is_over());

        pool.set_task_state(1, TaskState::FileNotFound);
        assert!(pool.is_over());
    }

    #[test]
    fn test_pool_owned_states_are_rejected() {
        let pool = pool_with(&["a.step", "b.step"], 1);
        pool.set_task_state(0, TaskState::ProcessOk);

        pool.set_task_state(0, TaskState::NotProcessed);
        pool.set_task_state(1, TaskState::Running);
        assert_eq!(pool.task(0).unwrap().state, TaskState::ProcessOk);
        assert_eq!(pool.task(1).unwrap().state, TaskState::NotProcessed);
        assert_eq!(pool.completed_count(), 1);
        assert_eq!(pool.running_count(), 0);

        // UnTreated still requeues.
        assert_eq!(pool.get_next_task().map(|t| t.index), Some(1));
        pool.set_task_state(1, TaskState::UnTreated);
        assert_eq!(pool.get_next_task().map(|t| t.index), Some(1));
    }

    #[test]
    fn test_empty_pool_is_over() {
        let pool = TaskPool::new(1);
        assert!(pool.is_over());
        assert!(pool.get_next_task().is_none());
    }

    #[test]
    fn test_requeued_task_is_served_first() {
        let pool = pool_with(&["a.step", "b.step", "c.step"], 1);

        let first = pool.get_next_task().unwrap();
        assert_eq!(pool.report_failure(first.index), TaskState::UnTreated);

        // Cursor already moved past task 0, the requeue brings it back.
        let again = pool.get_next_task().unwrap();
        assert_eq!(again.index, 0);
        assert_eq!(again.retries_remaining, 0);
        assert_eq!(pool.get_next_task().map(|t| t.index), Some(1));
    }

    #[test]
    fn test_retry_budget_is_spent() {
        let pool = pool_with(&["a.step"], 1);

        let task = pool.get_next_task().unwrap();
        assert_eq!(pool.report_failure(task.index), TaskState::UnTreated);
        assert!(!pool.is_over());

        let task = pool.get_next_task().unwrap();
        assert_eq!(pool.report_failure(task.index), TaskState::ProcessFailed);
        assert!(pool.is_over());
        assert_eq!(pool.task(0).unwrap().state, TaskState::ProcessFailed);
    }

    #[test]
    fn test_zero_retries_fails_immediately() {
        let pool = pool_with(&["a.step"], 0);
        let task = pool.get_next_task().unwrap();
        assert_eq!(pool.report_failure(task.index), TaskState::ProcessFailed);
    }

    #[test]
    fn test_reclaim_running_keeps_retries() {
        let pool = pool_with(&["a.step", "b.step"], 1);
        pool.get_next_task();
        pool.get_next_task();

        assert_eq!(pool.reclaim_running(), 2);
        assert_eq!(pool.pending_count(), 2);

        let task = pool.get_next_task().unwrap();
        assert_eq!(task.index, 0);
        assert_eq!(task.retries_remaining, 1);
    }

    #[test]
    fn test_abandon_pending() {
        let pool = pool_with(&["a.step", "b.step", "c.step"], 1);
        pool.get_next_task();
        pool.set_task_state(0, TaskState::ProcessOk);
        pool.get_next_task();

        assert_eq!(pool.abandon_pending(TaskState::ProcessFailed), 2);
        assert!(pool.is_over());
        assert!(pool.get_next_task().is_none());
        assert_eq!(pool.count_in_state(TaskState::ProcessFailed), 2);
        assert_eq!(pool.pending_count(), 0);
    }
}
