//! Duplex framed connection
//!
//! Wraps a frame reader and a frame writer with two pump tasks:
//!
//! ```text
//!             +-----------+   output queue   +-------+
//!  stream --> | read pump | ---------------> |       |
//!             +-----------+                  | owner |
//!             +------------+   input queue   |       |
//!  stream <-- | write pump | <-------------- |       |
//!             +------------+                 +-------+
//! ```
//!
//! Both pumps live in one [`JoinSet`] and watch one [`CancellationToken`].
//! Each pump ends with exactly one `Result`; the owner collects them through
//! [`Pumps::next_error`]. A pump never stops its sibling: after the owner sees
//! an error it calls [`Pumps::close`], which cancels and joins both.

use std::fmt;
use std::time::Duration;

use cvpn_protocol::{BufferPool, FrameReader, FrameWriter, PooledBuffer};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Lifecycle of a duplex connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplexState {
    /// Constructed, pumps not started
    Idle,
    /// Pumps running
    Running,
    /// Every pump finished cleanly
    Closed,
    /// At least one pump failed
    Errored,
}

impl fmt::Display for DuplexState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DuplexState::Idle => write!(f, "Idle"),
            DuplexState::Running => write!(f, "Running"),
            DuplexState::Closed => write!(f, "Closed"),
            DuplexState::Errored => write!(f, "Errored"),
        }
    }
}

/// Tunables for one duplex connection
#[derive(Debug, Clone)]
pub struct DuplexOptions {
    /// Label used in log lines
    pub name: String,
    /// Depth of the input and output queues
    pub queue_depth: usize,
    /// Fail the read pump when nothing arrives for this long
    pub idle_timeout: Option<Duration>,
}

impl DuplexOptions {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = depth.max(1);
        self
    }

    pub fn idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }
}

impl Default for DuplexOptions {
    fn default() -> Self {
        Self {
            name: "duplex".to_string(),
            queue_depth: 64,
            idle_timeout: None,
        }
    }
}

/// A connection that has not been started yet
pub struct Duplex<R, W> {
    reader: R,
    writer: W,
    pool: BufferPool,
    options: DuplexOptions,
}

impl<R, W> Duplex<R, W>
where
    R: FrameReader + 'static,
    W: FrameWriter + 'static,
{
    pub fn new(reader: R, writer: W, pool: BufferPool, options: DuplexOptions) -> Self {
        Self {
            reader,
            writer,
            pool,
            options,
        }
    }

    pub fn state(&self) -> DuplexState {
        DuplexState::Idle
    }

    /// Spawn both pumps; they stop when `cancel` fires
    pub fn start(self, cancel: CancellationToken) -> DuplexHandle {
        let (input_tx, input_rx) = mpsc::channel(self.options.queue_depth);
        let (output_tx, output_rx) = mpsc::channel(self.options.queue_depth);

        let mut tasks = JoinSet::new();
        tasks.spawn(read_pump(
            self.reader,
            self.pool,
            output_tx,
            cancel.clone(),
            self.options.idle_timeout,
        ));
        tasks.spawn(write_pump(self.writer, input_rx, cancel.clone()));

        log::debug!("[{}] pumps started", self.options.name);

        DuplexHandle {
            input: input_tx,
            output: output_rx,
            pumps: Pumps {
                name: self.options.name,
                tasks,
                cancel,
                errored: false,
                closed: false,
            },
        }
    }
}

/// A running connection
///
/// The queues and the pump supervisor are separate fields so an owner can
/// wait on `output.recv()` and `pumps.next_error()` in one `select!`.
pub struct DuplexHandle {
    /// Frames queued here are written to the stream in order
    pub input: mpsc::Sender<PooledBuffer>,
    /// Frames read from the stream
    pub output: mpsc::Receiver<PooledBuffer>,
    /// Supervisor of the two pump tasks
    pub pumps: Pumps,
}

impl DuplexHandle {
    /// Queue a frame for writing, waiting for room
    pub async fn send(&self, buf: PooledBuffer) -> Result<()> {
        self.input
            .send(buf)
            .await
            .map_err(|_| Error::Connection(format!("[{}] write pump stopped", self.pumps.name)))
    }

    /// Receive the next frame read from the stream
    pub async fn recv(&mut self) -> Option<PooledBuffer> {
        self.output.recv().await
    }

    /// See [`Pumps::next_error`]
    pub async fn next_error(&mut self) -> Option<Error> {
        self.pumps.next_error().await
    }

    pub fn state(&self) -> DuplexState {
        self.pumps.state()
    }

    /// Stop the pumps and wait for them
    pub async fn close(mut self) -> DuplexState {
        self.pumps.close().await
    }
}

/// Owns the pump tasks of one connection
pub struct Pumps {
    name: String,
    tasks: JoinSet<Result<()>>,
    cancel: CancellationToken,
    errored: bool,
    closed: bool,
}

impl Pumps {
    /// Wait for the next pump failure
    ///
    /// Returns `None` once every pump has finished without error. Safe to use
    /// in `select!`.
    pub async fn next_error(&mut self) -> Option<Error> {
        loop {
            match self.tasks.join_next().await? {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => {
                    self.errored = true;
                    return Some(e);
                }
                Err(join_err) => {
                    self.errored = true;
                    return Some(Error::Connection(format!(
                        "[{}] pump task failed: {}",
                        self.name, join_err
                    )));
                }
            }
        }
    }

    /// Cancel both pumps and wait until they are gone
    pub async fn close(&mut self) -> DuplexState {
        self.cancel.cancel();
        while let Some(result) = self.tasks.join_next().await {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    log::debug!("[{}] pump ended with: {}", self.name, e);
                    self.errored = true;
                }
                Err(e) => {
                    log::warn!("[{}] pump task failed: {}", self.name, e);
                    self.errored = true;
                }
            }
        }
        self.closed = true;
        log::debug!("[{}] pumps stopped", self.name);
        self.state()
    }

    pub fn state(&self) -> DuplexState {
        if !self.closed && !self.tasks.is_empty() {
            DuplexState::Running
        } else if self.errored {
            DuplexState::Errored
        } else {
            DuplexState::Closed
        }
    }
}

impl Drop for Pumps {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn read_pump<R>(
    mut reader: R,
    pool: BufferPool,
    output: mpsc::Sender<PooledBuffer>,
    cancel: CancellationToken,
    idle_timeout: Option<Duration>,
) -> Result<()>
where
    R: FrameReader,
{
    loop {
        let mut buf = pool.get();

        let read = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            read = read_with_timeout(&mut reader, &mut buf, idle_timeout) => read,
        };
        read?;

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            sent = output.send(buf) => {
                if sent.is_err() {
                    // Owner dropped the output queue
                    return Ok(());
                }
            }
        }
    }
}

async fn read_with_timeout<R>(
    reader: &mut R,
    buf: &mut PooledBuffer,
    idle_timeout: Option<Duration>,
) -> Result<()>
where
    R: FrameReader,
{
    match idle_timeout {
        Some(limit) => match tokio::time::timeout(limit, reader.read_frame(buf)).await {
            Ok(read) => Ok(read?),
            Err(_) => Err(Error::Timeout(format!("no data for {:?}", limit))),
        },
        None => Ok(reader.read_frame(buf).await?),
    }
}

async fn write_pump<W>(
    mut writer: W,
    mut input: mpsc::Receiver<PooledBuffer>,
    cancel: CancellationToken,
) -> Result<()>
where
    W: FrameWriter,
{
    loop {
        let buf = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            buf = input.recv() => match buf {
                Some(buf) => buf,
                None => return Ok(()),
            },
        };

        let written = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            written = writer.write_frame(&buf) => written,
        };
        // Back to the pool whether or not the write succeeded
        drop(buf);
        written?;
    }
}
