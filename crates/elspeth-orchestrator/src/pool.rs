//! Work pool: `pool_size` worker threads pulling `PullItem`s off a
//! shared queue, each running one to completion through
//! `elspeth_core::process_row` and forwarding every resulting outcome to
//! the `ReleaseQueue`. Workers never talk to each other or touch the
//! release order themselves — that's entirely the `ReleaseQueue`'s job.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender};

use elspeth_core::{process_row, ProcessorContext};

use crate::error::OrchestratorError;
use crate::puller::PullItem;
use crate::release::ReleaseCommand;

pub fn spawn(
    workers: usize,
    ctx: Arc<ProcessorContext>,
    work_rx: Receiver<PullItem>,
    release_tx: Sender<ReleaseCommand>,
) -> Vec<JoinHandle<Result<(), OrchestratorError>>> {
    (0..workers)
        .map(|idx| {
            let ctx = Arc::clone(&ctx);
            let work_rx = work_rx.clone();
            let release_tx = release_tx.clone();
            thread::Builder::new()
                .name(format!("elspeth-worker-{idx}"))
                .spawn(move || worker_loop(ctx, work_rx, release_tx))
                .expect("failed to spawn worker thread")
        })
        .collect()
}

fn worker_loop(
    ctx: Arc<ProcessorContext>,
    work_rx: Receiver<PullItem>,
    release_tx: Sender<ReleaseCommand>,
) -> Result<(), OrchestratorError> {
    while let Ok(item) = work_rx.recv() {
        let outcomes = process_row(&ctx, item.token, item.seq, &item.start_node_id)?;
        release_tx
            .send(ReleaseCommand::Outcomes(outcomes))
            .map_err(|_| OrchestratorError::ChannelClosed)?;
    }
    Ok(())
}
