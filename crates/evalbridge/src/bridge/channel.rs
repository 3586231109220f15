//! Duplex message channel between one driver and one worker.
//!
//! An [`Endpoint`] owns a framed read half and a framed write half. Sends are
//! fire-and-forget into the underlying buffer; `recv` is the only call that
//! suspends. Reading after the peer has gone away yields
//! [`ChannelError::Closed`] rather than blocking forever.

use std::io;
use std::marker::PhantomData;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde::{Serialize, de::DeserializeOwned};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::Child;
use tokio_util::codec::{FramedRead, FramedWrite};

use super::codec::JsonCodec;
use super::protocol::{DriverMessage, WorkerMessage};

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Driver side: receives worker messages, sends driver messages.
pub type DriverEndpoint = Endpoint<WorkerMessage, DriverMessage>;
/// Worker side: receives driver messages, sends worker messages.
pub type WorkerEndpoint = Endpoint<DriverMessage, WorkerMessage>;

/// Default buffer size for in-memory channels.
pub const DEFAULT_PAIR_CAPACITY: usize = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("channel closed by peer")]
    Closed,
    #[error("no message within {0:?}")]
    Timeout(Duration),
    /// The peer is alive but the bytes on the wire are not a valid frame.
    #[error("malformed message: {0}")]
    Malformed(#[source] io::Error),
    #[error("channel i/o error: {0}")]
    Io(#[source] io::Error),
}

impl From<io::Error> for ChannelError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::UnexpectedEof => Self::Closed,
            io::ErrorKind::InvalidData => Self::Malformed(e),
            _ => Self::Io(e),
        }
    }
}

pub struct Endpoint<In, Out> {
    reader: FramedRead<BoxedReader, JsonCodec<In>>,
    writer: FramedWrite<BoxedWriter, JsonCodec<Out>>,
    _direction: PhantomData<fn(Out) -> In>,
}

impl<In, Out> Endpoint<In, Out>
where
    In: DeserializeOwned,
    Out: Serialize,
{
    pub fn new(reader: BoxedReader, writer: BoxedWriter) -> Self {
        Self {
            reader: FramedRead::new(reader, JsonCodec::new()),
            writer: FramedWrite::new(writer, JsonCodec::new()),
            _direction: PhantomData,
        }
    }

    /// Write one message and flush it to the peer.
    pub async fn send(&mut self, msg: Out) -> Result<(), ChannelError> {
        self.writer.send(msg).await?;
        Ok(())
    }

    /// Wait for the next message. `None` waits indefinitely.
    pub async fn recv(&mut self, timeout: Option<Duration>) -> Result<In, ChannelError> {
        let next = match timeout {
            Some(limit) => tokio::time::timeout(limit, self.reader.next())
                .await
                .map_err(|_| ChannelError::Timeout(limit))?,
            None => self.reader.next().await,
        };

        match next {
            Some(Ok(msg)) => Ok(msg),
            Some(Err(e)) => Err(e.into()),
            None => Err(ChannelError::Closed),
        }
    }

    /// Flush and shut down the write half; the peer then reads end-of-stream.
    pub async fn close(&mut self) -> Result<(), ChannelError> {
        self.writer.close().await?;
        Ok(())
    }
}

/// Connected in-memory endpoints backed by a bounded duplex pipe.
pub fn pair(capacity: usize) -> (DriverEndpoint, WorkerEndpoint) {
    let (driver_side, worker_side) = tokio::io::duplex(capacity);
    let (driver_read, driver_write) = tokio::io::split(driver_side);
    let (worker_read, worker_write) = tokio::io::split(worker_side);
    (
        Endpoint::new(Box::new(driver_read), Box::new(driver_write)),
        Endpoint::new(Box::new(worker_read), Box::new(worker_write)),
    )
}

/// Driver endpoint over a spawned child's stdin/stdout.
///
/// The child must have been spawned with both piped.
pub fn from_child(child: &mut Child) -> io::Result<DriverEndpoint> {
    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| io::Error::other("worker stdin not captured"))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| io::Error::other("worker stdout not captured"))?;
    Ok(Endpoint::new(Box::new(stdout), Box::new(stdin)))
}

/// Worker endpoint over this process's stdin/stdout.
///
/// On unix the control channel is first moved to a private duplicate of
/// fd 1, and fd 1 is pointed at stderr. Anything the objective (or a library
/// it calls) prints to stdout afterwards lands in the worker's log instead of
/// corrupting the frame stream. Output written before this call cannot be
/// caught and will be rejected by the driver as a malformed message.
pub fn stdio() -> io::Result<WorkerEndpoint> {
    let control = protect_stdout()?;
    Ok(Endpoint::new(Box::new(tokio::io::stdin()), control))
}

#[cfg(unix)]
fn protect_stdout() -> io::Result<BoxedWriter> {
    use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd};

    use nix::unistd::{dup, dup2};

    let control = dup(io::stdout().as_fd())
        .map_err(|e| io::Error::other(format!("dup(stdout) failed: {e}")))?;

    // Safety: fd 1 is open for the life of the process. The OwnedFd is only a
    // dup2 target and is forgotten so fd 1 is never closed.
    let mut fd1 = unsafe { OwnedFd::from_raw_fd(1) };
    let redirected = dup2(io::stderr().as_fd(), &mut fd1);
    std::mem::forget(fd1);
    redirected.map_err(|e| io::Error::other(format!("dup2(stderr, stdout) failed: {e}")))?;

    tracing::debug!(control_fd = control.as_raw_fd(), "Moved control channel off stdout");
    let file = std::fs::File::from(control);
    Ok(Box::new(tokio::fs::File::from_std(file)))
}

#[cfg(not(unix))]
fn protect_stdout() -> io::Result<BoxedWriter> {
    // No fd juggling here: stray stdout output will corrupt the channel.
    Ok(Box::new(tokio::io::stdout()))
}
