/*
 * Copyright 2020-2021 Replicate, Inc.
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */
use std::io;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Receiver, Sender};

use crate::error::{Error, Result};

/// The number of buffered chunks in an in-memory pipe.
const PIPE_CAPACITY: usize = 16;

type Job = Box<dyn FnOnce() -> Result<()> + Send + 'static>;

/// A fixed pool of worker threads fed by a bounded queue.
///
/// Jobs are fallible; after the first failure the queue stops accepting and
/// running jobs, and `wait` reports that first error. The bounded feed
/// channel applies backpressure to the submitting thread.
pub struct WorkerQueue {
    sender: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
    state: Arc<QueueState>,
}

struct QueueState {
    failed: AtomicBool,
    error: Mutex<Option<Error>>,
}

impl QueueState {
    fn record(&self, err: Error) {
        let mut slot = self.error.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_none() {
            *slot = Some(err);
        }
        self.failed.store(true, Ordering::SeqCst);
    }
}

impl WorkerQueue {
    pub fn new(max_workers: usize) -> Self {
        let (sender, receiver): (Sender<Job>, Receiver<Job>) = bounded(max_workers);
        let state = Arc::new(QueueState {
            failed: AtomicBool::new(false),
            error: Mutex::new(None),
        });
        let workers = (0..max_workers)
            .map(|_| {
                let receiver = receiver.clone();
                let state = Arc::clone(&state);
                thread::spawn(move || {
                    for job in receiver.iter() {
                        // Drain without running once a job has failed.
                        if state.failed.load(Ordering::SeqCst) {
                            continue;
                        }
                        if let Err(err) = job() {
                            state.record(err);
                        }
                    }
                })
            })
            .collect();
        WorkerQueue {
            sender: Some(sender),
            workers,
            state,
        }
    }

    /// Submit a job, blocking if all workers are busy and the queue is full.
    /// After a failure this becomes a no-op.
    pub fn spawn(&self, job: impl FnOnce() -> Result<()> + Send + 'static) {
        if self.state.failed.load(Ordering::SeqCst) {
            return;
        }
        if let Some(sender) = &self.sender {
            // A send error means the workers are gone, which only happens
            // after `wait`.
            let _ = sender.send(Box::new(job));
        }
    }

    /// Wait for all submitted jobs to finish and return the first error, if
    /// any.
    pub fn wait(mut self) -> Result<()> {
        self.sender.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
        let mut slot = self.state.error.lock().unwrap_or_else(|e| e.into_inner());
        match slot.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Create an in-memory pipe of byte chunks.
///
/// The writer blocks when the pipe is full. Dropping the reader makes
/// subsequent writes fail with `BrokenPipe`; dropping the writer makes the
/// reader return end-of-file, while [`PipeWriter::fail`] makes it return an
/// error instead. This gives a producer/consumer pair cancellation in both
/// directions.
pub fn pipe() -> (PipeReader, PipeWriter) {
    let (sender, receiver) = bounded(PIPE_CAPACITY);
    (
        PipeReader {
            receiver,
            chunk: Vec::new(),
            pos: 0,
        },
        PipeWriter { sender },
    )
}

pub struct PipeWriter {
    sender: Sender<io::Result<Vec<u8>>>,
}

impl PipeWriter {
    /// Close the pipe with an error: the reader fails with `message`
    /// instead of seeing end-of-file.
    pub fn fail(self, message: &str) {
        let _ = self.sender.send(Err(io::Error::new(
            io::ErrorKind::Other,
            message.to_string(),
        )));
    }
}

impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.sender
            .send(Ok(buf.to_vec()))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "pipe reader was dropped"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub struct PipeReader {
    receiver: Receiver<io::Result<Vec<u8>>>,
    chunk: Vec<u8>,
    pos: usize,
}

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.pos >= self.chunk.len() {
            match self.receiver.recv() {
                Ok(Ok(chunk)) => {
                    self.chunk = chunk;
                    self.pos = 0;
                }
                Ok(Err(err)) => return Err(err),
                // Writer dropped: end of stream.
                Err(_) => return Ok(0),
            }
        }
        let remaining = &self.chunk[self.pos..];
        let len = remaining.len().min(buf.len());
        buf[..len].copy_from_slice(&remaining[..len]);
        self.pos += len;
        Ok(len)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::error::Error;

    #[test]
    fn queue_runs_all_jobs() -> anyhow::Result<()> {
        let queue = WorkerQueue::new(4);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..100 {
            let counter = Arc::clone(&counter);
            queue.spawn(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }
        queue.wait()?;
        assert_eq!(counter.load(Ordering::SeqCst), 100);
        Ok(())
    }

    #[test]
    fn queue_reports_first_error_and_stops() {
        let queue = WorkerQueue::new(1);
        let ran_after_failure = Arc::new(AtomicBool::new(false));
        queue.spawn(|| Err(Error::Write(String::from("boom"))));
        for _ in 0..10 {
            let flag = Arc::clone(&ran_after_failure);
            queue.spawn(move || {
                flag.store(true, Ordering::SeqCst);
                Ok(())
            });
        }
        let err = queue.wait().unwrap_err();
        assert!(matches!(err, Error::Write(message) if message == "boom"));
        assert!(!ran_after_failure.load(Ordering::SeqCst));
    }

    #[test]
    fn pipe_round_trips_bytes() -> anyhow::Result<()> {
        let (mut reader, mut writer) = pipe();
        let handle = std::thread::spawn(move || {
            writer.write_all(b"hello ")?;
            writer.write_all(b"world")?;
            Ok::<_, std::io::Error>(())
        });
        let mut data = Vec::new();
        reader.read_to_end(&mut data)?;
        handle.join().unwrap()?;
        assert_eq!(data, b"hello world");
        Ok(())
    }

    #[test]
    fn dropping_reader_breaks_writer() {
        let (reader, mut writer) = pipe();
        drop(reader);
        let err = writer.write_all(b"data").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[test]
    fn dropping_writer_ends_reader() -> anyhow::Result<()> {
        let (mut reader, writer) = pipe();
        drop(writer);
        let mut data = Vec::new();
        assert_eq!(reader.read_to_end(&mut data)?, 0);
        Ok(())
    }

    #[test]
    fn failing_writer_surfaces_error_to_reader() {
        let (mut reader, mut writer) = pipe();
        writer.write_all(b"partial").unwrap();
        writer.fail("archiving failed");
        let mut data = Vec::new();
        let err = reader.read_to_end(&mut data).unwrap_err();
        assert!(err.to_string().contains("archiving failed"));
    }
}
