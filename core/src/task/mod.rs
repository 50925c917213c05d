use std::cell::RefCell;
use std::rc::Rc;
use tokio::task::JoinSet;
use tokio_shutdown::Shutdown;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, debug_span, error};

type MutableJoinSet = Rc<RefCell<JoinSet<()>>>;

/// Owns the long-running tasks of the process and the cancellation token that
/// is cancelled once the process receives a shutdown signal.
pub struct Builder {
    join_set: MutableJoinSet,
    shutdown: Shutdown,
    cancellation_token: CancellationToken,
}

impl Builder {
    pub fn new_task(&self, name: &'static str) -> Spawner {
        Spawner {
            name,
            join_set: self.join_set.clone(),
            shutdown: self.shutdown.clone(),
        }
    }

    /// A token tied to the process lifetime, for work spawned outside the join set.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.child_token()
    }

    pub async fn join_all(self) {
        let mut join_set = self.join_set.take();
        while let Some(result) = join_set.join_next().await {
            if let Err(err) = result {
                error!("Task failed: {}", err);
            }
        }
    }
}

impl Default for Builder {
    #[allow(clippy::expect_used)] // Without a signal handler the process cannot shut down cleanly
    fn default() -> Self {
        let builder = Self {
            join_set: MutableJoinSet::default(),
            shutdown: Shutdown::new().expect("Failed to create shutdown handle"),
            cancellation_token: CancellationToken::new(),
        };

        let cancellation_token = builder.cancellation_token.clone();
        builder
            .new_task("cancel_on_shutdown")
            .spawn_on_shutdown(async move {
                debug!("Shutdown requested, cancelling background work");
                cancellation_token.cancel();
            });

        builder
    }
}

pub struct Spawner {
    name: &'static str,
    join_set: MutableJoinSet,
    shutdown: Shutdown,
}

impl Spawner {
    #[track_caller]
    pub fn spawn<F>(self, task: F)
    where
        F: Future<Output = ()>,
        F: Send + 'static,
    {
        debug!("Spawning task '{}'", self.name);
        self.join_set
            .borrow_mut()
            .spawn(task.instrument(debug_span!("task", name = self.name)));
    }

    #[track_caller]
    pub fn spawn_on_shutdown<F>(self, task: F)
    where
        F: Future<Output = ()>,
        F: Send + 'static,
    {
        let shutdown = self.shutdown.clone();
        self.spawn(async move {
            let () = shutdown.handle().await;
            task.await;
        });
    }
}
