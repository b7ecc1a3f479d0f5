//! Ordered work queues.
//!
//! A [`Stream`] owns one worker thread that executes enqueued jobs strictly in
//! submission order. Enqueueing never blocks on the job itself; completion is
//! observed with [`Stream::synchronize`] or by waiting on the handle a job
//! returns. In-flight jobs cannot be cancelled.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::thread::JoinHandle;

use ndarray::Array2;

use super::Device;
use crate::{FilError, Result};

static NEXT_STREAM_ID: AtomicU64 = AtomicU64::new(0);

type Job = Box<dyn FnOnce() + Send + 'static>;

enum Command {
    Run(Job),
    Fence(mpsc::Sender<()>),
}

/// FIFO execution stream bound to a [`Device`].
#[derive(Debug)]
pub struct Stream {
    id: u64,
    device: Device,
    sender: Option<mpsc::Sender<Command>>,
    worker: Option<JoinHandle<()>>,
}

impl Stream {
    pub(crate) fn new(device: Device) -> Result<Self> {
        let id = NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::channel::<Command>();
        let worker = std::thread::Builder::new()
            .name(format!("fil-stream-{id}"))
            .spawn(move || {
                for command in receiver {
                    match command {
                        Command::Run(job) => job(),
                        Command::Fence(done) => {
                            let _ = done.send(());
                        }
                    }
                }
            })
            .map_err(FilError::StreamSpawn)?;

        tracing::debug!(stream = id, "stream created");
        Ok(Self {
            id,
            device,
            sender: Some(sender),
            worker: Some(worker),
        })
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Append a job to the queue.
    pub(crate) fn enqueue<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        tracing::trace!(stream = self.id, "enqueue job");
        self.send(Command::Run(Box::new(job)))
    }

    /// Block until every job enqueued so far has completed.
    pub fn synchronize(&self) -> Result<()> {
        let (done_tx, done_rx) = mpsc::channel();
        self.send(Command::Fence(done_tx))?;
        done_rx.recv().map_err(|_| FilError::StreamClosed(self.id))
    }

    fn send(&self, command: Command) -> Result<()> {
        self.sender
            .as_ref()
            .ok_or(FilError::StreamClosed(self.id))?
            .send(command)
            .map_err(|_| FilError::StreamClosed(self.id))
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        // Closing the channel lets the worker drain the queue and exit.
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

/// Handle to a prediction enqueued on a [`Stream`].
#[derive(Debug)]
pub struct PendingPrediction {
    stream: u64,
    receiver: mpsc::Receiver<Result<Array2<f32>>>,
}

impl PendingPrediction {
    pub(crate) fn new(stream: u64, receiver: mpsc::Receiver<Result<Array2<f32>>>) -> Self {
        Self { stream, receiver }
    }

    /// Block until the prediction has been computed.
    pub fn wait(self) -> Result<Array2<f32>> {
        self.receiver
            .recv()
            .map_err(|_| FilError::StreamClosed(self.stream))?
    }
}
