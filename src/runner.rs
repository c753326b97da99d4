use std::thread;

use tracing::warn;

pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Executes background work whose result comes back over a channel.
pub trait TaskRunner: Send + Sync {
    fn run(&self, task: Task);
}

/// Runs every task on its own short-lived named thread.
#[derive(Debug, Clone)]
pub struct ThreadRunner {
    name: String,
}

impl ThreadRunner {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl TaskRunner for ThreadRunner {
    fn run(&self, task: Task) {
        if let Err(err) = thread::Builder::new().name(self.name.clone()).spawn(task) {
            warn!(error = %err, runner = %self.name, "failed to spawn background task");
        }
    }
}

/// Runs tasks immediately on the caller's thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct InlineRunner;

impl TaskRunner for InlineRunner {
    fn run(&self, task: Task) {
        task();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn thread_runner_executes_task() {
        let (tx, rx) = crossbeam_channel::bounded(1);
        ThreadRunner::new("test-runner").run(Box::new(move || {
            let _ = tx.send(thread::current().name().map(str::to_string));
        }));
        let name = rx.recv_timeout(Duration::from_secs(5)).expect("task ran");
        assert_eq!(name.as_deref(), Some("test-runner"));
    }

    #[test]
    fn inline_runner_is_synchronous() {
        let (tx, rx) = crossbeam_channel::unbounded();
        InlineRunner.run(Box::new(move || {
            let _ = tx.send(1);
        }));
        assert_eq!(rx.try_recv().ok(), Some(1));
    }
}
