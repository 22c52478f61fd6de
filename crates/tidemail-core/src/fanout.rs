//! Fan-out coordinator
//!
//! Submits independent units of work and joins them. Plain units never
//! produce an error; units submitted with [`FanOut::spawn_required`] report
//! failures, and [`FanOut::wait`] surfaces the first one observed.

use std::future::Future;
use tokio::task::JoinSet;
use tracing::error;

/// Join barrier over a set of spawned units
pub struct FanOut<E = tidemail_common::Error> {
    set: JoinSet<Result<(), E>>,
}

impl<E: Send + 'static> FanOut<E> {
    pub fn new() -> Self {
        Self { set: JoinSet::new() }
    }

    /// Submit a unit whose outcome is not observed
    pub fn spawn<T, F, Fut>(&mut self, arg: T, f: F)
    where
        T: Send + 'static,
        F: FnOnce(T) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.set.spawn(async move {
            f(arg).await;
            Ok(())
        });
    }

    /// Submit a unit that must succeed
    pub fn spawn_required<T, F, Fut>(&mut self, arg: T, f: F)
    where
        T: Send + 'static,
        F: FnOnce(T) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
    {
        self.set.spawn(async move { f(arg).await });
    }

    /// Number of units not yet joined
    pub fn len(&self) -> usize {
        self.set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }

    /// Block until every unit has returned
    pub async fn wait(mut self) -> Result<(), E> {
        let mut first_error = None;

        while let Some(joined) = self.set.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
                Err(e) if e.is_panic() => error!("Fan-out unit panicked: {}", e),
                Err(e) => error!("Fan-out unit cancelled: {}", e),
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl<E: Send + 'static> Default for FanOut<E> {
    fn default() -> Self {
        Self::new()
    }
}
