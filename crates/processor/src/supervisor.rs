//! Loop supervision
//!
//! Each consumer loop runs as its own tokio task. A loop that fails does not
//! affect the others; the supervisor returns once every loop has exited, or
//! stops them all when shutdown is signalled and aborts whatever has not
//! drained within the grace period.

use futures::future::join_all;
use std::future::Future;
use std::time::Duration;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{info, warn};

use crate::broker::Broker;
use crate::consumer_loop::{ConsumerLoop, LoopExit, LoopHandle};
use crate::error::ProcessorError;

pub struct Supervisor {
    grace_period: Duration,
    loops: Vec<LoopHandle>,
    tasks: Vec<JoinHandle<LoopExit>>,
}

impl Supervisor {
    pub fn new(grace_period: Duration) -> Self {
        Self {
            grace_period,
            loops: Vec::new(),
            tasks: Vec::new(),
        }
    }

    pub fn spawn<B: Broker + 'static>(&mut self, consumer_loop: ConsumerLoop<B>) -> LoopHandle {
        let handle = consumer_loop.handle();
        self.loops.push(handle.clone());
        self.tasks.push(tokio::spawn(consumer_loop.run()));
        handle
    }

    pub fn handles(&self) -> Vec<LoopHandle> {
        self.loops.clone()
    }

    /// Wait for every loop, stopping them all once `shutdown` resolves
    ///
    /// Returns each loop's id and exit reason.
    pub async fn run_until(self, shutdown: impl Future<Output = ()>) -> Vec<(usize, LoopExit)> {
        let Supervisor {
            grace_period,
            loops,
            tasks,
        } = self;

        let aborts: Vec<AbortHandle> = tasks.iter().map(JoinHandle::abort_handle).collect();
        let mut joined = Box::pin(join_all(tasks));

        let results = tokio::select! {
            results = &mut joined => {
                info!("All consumer loops exited");
                results
            }
            _ = shutdown => {
                info!(loops = loops.len(), "Shutdown requested, stopping consumer loops");
                for handle in &loops {
                    handle.stop();
                }

                match tokio::time::timeout(grace_period, &mut joined).await {
                    Ok(results) => results,
                    Err(_) => {
                        warn!(
                            grace_ms = grace_period.as_millis() as u64,
                            "Consumer loops did not drain in time, aborting"
                        );
                        for abort in &aborts {
                            abort.abort();
                        }
                        joined.await
                    }
                }
            }
        };

        loops
            .iter()
            .map(LoopHandle::id)
            .zip(results)
            .map(|(id, result)| {
                let exit = match result {
                    Ok(exit) => exit,
                    Err(e) if e.is_cancelled() => LoopExit::Aborted,
                    Err(e) => LoopExit::Fatal(ProcessorError::from(e)),
                };
                (id, exit)
            })
            .collect()
    }
}
