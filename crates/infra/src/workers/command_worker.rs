use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{Instrument, error, info, info_span};

use crate::command_processor::{CommandProcessor, ProcessError};

/// A fixed set of command workers sharing one processor.
///
/// Each worker runs [`CommandProcessor::run`] inside a `worker` span carrying
/// its index. Workers share nothing but the processor's collaborators.
#[derive(Debug)]
pub struct CommandWorkerPool {
    shutdown: watch::Sender<bool>,
    workers: JoinSet<Result<(), ProcessError>>,
}

impl CommandWorkerPool {
    pub fn spawn(concurrency: usize, processor: Arc<CommandProcessor>) -> Self {
        let (shutdown, rx) = watch::channel(false);
        let mut workers = JoinSet::new();

        for index in 0..concurrency {
            let processor = processor.clone();
            let rx = rx.clone();
            workers.spawn(async move { processor.run(rx).await }.instrument(info_span!("worker", worker = index)));
        }

        info!(concurrency, "command workers started");
        Self { shutdown, workers }
    }

    /// Stop leasing new commands. In-flight commands still finish.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Wait for every worker to stop.
    ///
    /// The first fatal error shuts the remaining workers down and is returned
    /// once all of them have finished.
    pub async fn wait(&mut self) -> Result<(), ProcessError> {
        let mut first_error = None;

        while let Some(joined) = self.workers.join_next().await {
            let result = joined.unwrap_or_else(|e| Err(ProcessError::Unknown(format!("worker task failed: {e}"))));

            if let Err(err) = result {
                error!(error = %err, "worker failed, shutting down");
                self.shutdown();
                first_error.get_or_insert(err);
            }
        }

        info!("command workers stopped");
        first_error.map_or(Ok(()), Err)
    }
}
