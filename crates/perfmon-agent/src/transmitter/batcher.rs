//! Background batching loop
//!
//! Single consumer of the record queue. A batch is dispatched when it
//! reaches `batch_size`, when `batch_timeout` has passed since the previous
//! dispatch while records are waiting, or on an explicit flush request.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::Instant;

use super::Shared;
use crate::record::PerformanceRecord;

pub(crate) enum Command {
    Record(Box<PerformanceRecord>),
    /// Dispatch whatever is buffered now
    Flush,
}

pub(crate) async fn run(mut rx: mpsc::Receiver<Command>, shared: Arc<Shared>) {
    let mut batch: Vec<PerformanceRecord> = Vec::new();
    let mut last_flush = Instant::now();

    tracing::debug!("Batch loop started");

    loop {
        let config = shared.config.snapshot();
        let deadline = last_flush + config.batch_timeout;

        let dispatch = tokio::select! {
            biased;

            _ = shared.cancel.cancelled() => break,

            command = rx.recv() => match command {
                Some(Command::Record(record)) => {
                    batch.push(*record);
                    batch.len() >= config.batch_size
                }
                Some(Command::Flush) => !batch.is_empty(),
                None => break,
            },

            _ = tokio::time::sleep_until(deadline), if !batch.is_empty() => true,
        };

        if dispatch {
            let records = std::mem::take(&mut batch);
            last_flush = Instant::now();
            tracing::debug!(batch_size = records.len(), "Dispatching batch");
            tokio::spawn(shared.clone().deliver_batch(records));
        }
    }

    // Anything still buffered or queued is lost at this point
    rx.close();
    let mut abandoned = batch.len();
    while let Ok(command) = rx.try_recv() {
        if let Command::Record(_) = command {
            abandoned += 1;
        }
    }
    if abandoned > 0 {
        tracing::warn!(records = abandoned, "Dropping undelivered records at shutdown");
        shared.stats.discarded(abandoned);
    }

    tracing::debug!("Batch loop stopped");
}
