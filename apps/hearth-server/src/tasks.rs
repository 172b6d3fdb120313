use std::borrow::Cow;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use tokio::task::JoinHandle;
use tracing::{debug, error};

const BACKOFF_START: Duration = Duration::from_millis(200);
const BACKOFF_MAX: Duration = Duration::from_secs(10);
/// A loop that stays up this long gets its backoff reset.
const CALM_PERIOD: Duration = Duration::from_secs(30);

/// A named background task owned by the hub.
#[derive(Debug)]
pub struct TaskHandle {
    name: Cow<'static, str>,
    join: JoinHandle<()>,
}

impl TaskHandle {
    pub fn new(name: impl Into<Cow<'static, str>>, join: JoinHandle<()>) -> Self {
        Self {
            name: name.into(),
            join,
        }
    }

    /// Wait up to `grace` for the task to end, then abort it.
    async fn finish(self, grace: Duration) {
        let Self { name, mut join } = self;
        match tokio::time::timeout(grace, &mut join).await {
            Ok(Ok(())) => debug!(target: "hearth::tasks", task = %name, "task finished"),
            Ok(Err(err)) => debug!(target: "hearth::tasks", task = %name, ?err, "task ended abnormally"),
            Err(_) => {
                join.abort();
                let _ = join.await;
                debug!(target: "hearth::tasks", task = %name, "task aborted after grace period");
            }
        }
    }
}

/// Background tasks drained when the server shuts down.
#[derive(Default)]
pub struct TaskManager {
    tasks: Vec<TaskHandle>,
}

impl TaskManager {
    pub fn push(&mut self, task: TaskHandle) {
        self.tasks.push(task);
    }

    pub async fn shutdown_with_grace(self, grace: Duration) {
        for task in self.tasks {
            task.finish(grace).await;
        }
    }
}

impl From<Vec<TaskHandle>> for TaskManager {
    fn from(tasks: Vec<TaskHandle>) -> Self {
        Self { tasks }
    }
}

/// Run `factory()` until it returns normally. A panic is logged and the loop is
/// re-created after an exponential backoff.
pub fn spawn_supervised<F, Fut>(name: impl Into<Cow<'static, str>>, mut factory: F) -> TaskHandle
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let name = name.into();
    let label = name.clone();
    let join = tokio::spawn(async move {
        let mut backoff = BACKOFF_START;
        loop {
            let started = Instant::now();
            if AssertUnwindSafe(factory()).catch_unwind().await.is_ok() {
                break;
            }
            if started.elapsed() > CALM_PERIOD {
                backoff = BACKOFF_START;
            }
            error!(
                target: "hearth::tasks",
                task = %label,
                backoff_ms = backoff.as_millis() as u64,
                "background task panicked; restarting"
            );
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(BACKOFF_MAX);
        }
    });
    TaskHandle::new(name, join)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn panicking_loop_is_recreated() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let task = spawn_supervised("flaky", move || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    panic!("first run fails");
                }
            }
        });
        tokio::time::timeout(Duration::from_secs(5), task.join)
            .await
            .expect("task finished")
            .expect("join");
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn shutdown_aborts_tasks_that_outlive_grace() {
        let mut manager = TaskManager::default();
        manager.push(TaskHandle::new(
            "sleeper",
            tokio::spawn(async {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }),
        ));
        tokio::time::timeout(
            Duration::from_secs(2),
            manager.shutdown_with_grace(Duration::from_millis(10)),
        )
        .await
        .expect("shutdown completes");
    }
}
