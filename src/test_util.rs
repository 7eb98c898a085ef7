// Copyright 2026 the handoff contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::exec::{Executor, ExecutorRef, Job};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};

pub(crate) fn trace_init() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .with_test_writer()
        .try_init();
}

/// A single worker thread draining a queue of jobs. Dropping the handle
/// closes the queue and joins the worker; jobs submitted afterwards are
/// abandoned.
pub(crate) struct ThreadExecutor {
    queue: Arc<Queue>,
    worker: Option<std::thread::JoinHandle<()>>,
}

struct Queue {
    tx: Mutex<Option<mpsc::Sender<Job>>>,
}

impl Executor for Queue {
    fn submit(&self, job: Job) {
        let tx = self.tx.lock().unwrap();
        match tx.as_ref() {
            // A failed send tears the job down via its Drop impl, which
            // abandons it.
            Some(tx) => drop(tx.send(job)),
            None => job.abandon(),
        }
    }
}

impl ThreadExecutor {
    pub(crate) fn spawn() -> Self {
        let (tx, rx) = mpsc::channel::<Job>();
        let worker = std::thread::spawn(move || {
            while let Ok(job) = rx.recv() {
                job.run();
            }
        });
        Self {
            queue: Arc::new(Queue {
                tx: Mutex::new(Some(tx)),
            }),
            worker: Some(worker),
        }
    }

    pub(crate) fn handle(&self) -> ExecutorRef {
        self.queue.clone()
    }
}

impl Drop for ThreadExecutor {
    fn drop(&mut self) {
        drop(self.queue.tx.lock().unwrap().take());
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}
