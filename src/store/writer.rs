//! The serial write executor: a single-consumer work queue owning every
//! mutation, so unit-of-work arrival order determines both log order and
//! index order.

use std::sync::{mpsc, Arc};
use std::thread;

use log::error;

use crate::records::{CompletionCallback, QueueRecord, UnitOfWork};
use crate::{Result, StoreError};

use super::{commit, share_result, StoreInner};

pub(crate) enum Task {
    Store(Vec<UnitOfWork>),
    AddQueue(QueueRecord, Option<CompletionCallback>),
    RemoveQueue(u64, Option<CompletionCallback>),
}

/// Owns the writer thread; dropping it drains the queue and joins.
pub(crate) struct WriteExecutor {
    sender: Option<mpsc::Sender<Task>>,
    worker: Option<thread::JoinHandle<()>>,
}

impl WriteExecutor {
    pub(crate) fn start(inner: Arc<StoreInner>) -> Result<WriteExecutor> {
        let (sender, receiver) = mpsc::channel::<Task>();
        let worker = thread::Builder::new()
            .name("mqstore-writer".to_owned())
            .spawn(move || {
                while let Ok(task) = receiver.recv() {
                    run_task(&inner, task);
                }
            })?;

        Ok(WriteExecutor {
            sender: Some(sender),
            worker: Some(worker),
        })
    }

    pub(crate) fn submit(&self, task: Task) -> Result<()> {
        self.sender
            .as_ref()
            .ok_or(StoreError::Stopped)?
            .send(task)
            .map_err(|_| StoreError::Stopped)
    }
}

/// When drop, drain the queue and join the writer thread.
impl Drop for WriteExecutor {
    fn drop(&mut self) {
        drop(self.sender.take());
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("writer thread panicked");
            }
        }
    }
}

fn run_task(inner: &Arc<StoreInner>, task: Task) {
    match task {
        Task::Store(mut uows) => {
            let result = inner.retry("unit-of-work commit", || {
                inner.with_state(|state| commit::commit_uows(&inner.config, state, &mut uows))
            });
            if let Err(e) = &result {
                error!("unit-of-work batch failed: {}", e);
            }
            for uow in &mut uows {
                if let Some(callback) = uow.on_complete.take() {
                    callback(share_result(&result));
                }
            }
        }
        Task::AddQueue(record, callback) => {
            let result = inner.retry("add queue", || {
                inner.with_state(|state| commit::commit_add_queue(state, &record))
            });
            if let Some(callback) = callback {
                callback(share_result(&result));
            }
        }
        Task::RemoveQueue(queue_key, callback) => {
            let result = inner.retry("remove queue", || {
                inner.with_state(|state| commit::commit_remove_queue(state, queue_key))
            });
            if let Some(callback) = callback {
                callback(share_result(&result));
            }
        }
    }
}
