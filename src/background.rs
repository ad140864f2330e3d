use std::{
    future::Future,
    sync::{Arc, Weak},
    time::Duration,
};

use tokio::{
    runtime::Handle,
    sync::Notify,
    task::JoinHandle,
    time::MissedTickBehavior,
};

/// A task running `tick` every interval against a weakly held target.
///
/// The task ends when stopped or once the target is dropped. A tick already in progress runs to
/// completion.
pub(crate) struct BackgroundLoop {
    handle: JoinHandle<()>,
    stop: Arc<Notify>,
}

impl BackgroundLoop {
    pub(crate) fn spawn<T, F, Fut>(
        runtime: &Handle,
        interval: Duration,
        target: Weak<T>,
        mut tick: F,
    ) -> Self
    where
        T: Send + Sync + 'static,
        F: FnMut(Arc<T>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let stop = Arc::new(Notify::new());
        let stopped = Arc::clone(&stop);

        let handle = runtime.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            // Tokio's interval ticks immediately on first await; discard that.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = stopped.notified() => break,
                }

                let Some(target) = target.upgrade() else {
                    break;
                };

                tick(target).await;
            }
        });

        Self { handle, stop }
    }

    pub(crate) fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    pub(crate) fn stop(self) {
        self.stop.notify_one();
    }
}
