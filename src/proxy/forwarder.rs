//! Relay engine
//!
//! Copies bytes both ways between two units. Each direction runs in its own
//! task; when one reaches EOF it shuts down the opposite writer so the peer
//! sees the end too. The other direction keeps running until its own reader
//! reports EOF or an error. From then on it is only bounded by `linger`, an
//! idle limit that restarts with every chunk copied, so a silent peer that
//! never closes cannot pin the session. Both units are closed exactly once
//! after both directions stopped.

use std::time::Duration;

use log::debug;
use metrics::counter;
use tokio::io::{split, AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::timeout;

use crate::transport::Unit;

/// Relay tuning
#[derive(Debug, Clone, Copy)]
pub struct RelayOptions {
    /// Copy buffer per direction
    pub buffer_size: usize,
    /// Idle limit for the surviving direction once the other one ended
    pub linger: Duration,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            buffer_size: crate::config::defaults::buffer_size(),
            linger: Duration::from_secs(crate::config::defaults::relay_linger()),
        }
    }
}

/// Bytes moved by one relay
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// Copied from the first unit into the second
    pub a_to_b: u64,
    /// Copied from the second unit into the first
    pub b_to_a: u64,
}

/// How a direction stopped
#[derive(Debug)]
enum DirectionEnd {
    Eof,
    Error(std::io::Error),
    Idle,
}

struct Direction<R, W> {
    reader: ReadHalf<R>,
    writer: WriteHalf<W>,
    bytes: u64,
    end: DirectionEnd,
}

/// Aborts the direction task when the relay future is dropped
struct DirectionTask<T>(JoinHandle<T>);

impl<T> DirectionTask<T> {
    async fn join(&mut self) -> std::result::Result<T, JoinError> {
        (&mut self.0).await
    }
}

impl<T> Drop for DirectionTask<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn idle_error() -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::TimedOut, "peer idle after half-close")
}

async fn copy_direction<R, W>(
    mut reader: ReadHalf<R>,
    mut writer: WriteHalf<W>,
    buffer_size: usize,
    linger: Duration,
    mut peer_done: watch::Receiver<bool>,
) -> Direction<R, W>
where
    R: Unit,
    W: Unit,
{
    let mut buffer = vec![0u8; buffer_size];
    let mut bytes = 0u64;
    let mut half_closed = *peer_done.borrow();

    let end = loop {
        // Reads are cancel-safe, so switching to the idle limit mid-read loses nothing
        let read = if half_closed {
            match timeout(linger, reader.read(&mut buffer)).await {
                Ok(read) => read,
                Err(_) => break DirectionEnd::Idle,
            }
        } else {
            tokio::select! {
                read = reader.read(&mut buffer) => read,
                _ = peer_done.changed() => {
                    half_closed = true;
                    continue;
                }
            }
        };

        let n = match read {
            Ok(0) => break DirectionEnd::Eof,
            Ok(n) => n,
            Err(e) => break DirectionEnd::Error(e),
        };

        let written = if half_closed {
            timeout(linger, writer.write_all(&buffer[..n]))
                .await
                .unwrap_or_else(|_| Err(idle_error()))
        } else {
            writer.write_all(&buffer[..n]).await
        };
        if let Err(e) = written {
            break DirectionEnd::Error(e);
        }
        bytes += n as u64;
    };

    // Pass the end on so the peer behind the writer stops waiting
    let _ = timeout(linger, writer.shutdown()).await;

    Direction { reader, writer, bytes, end }
}

fn log_end(tid: &str, label: &str, bytes: u64, end: &DirectionEnd) {
    match end {
        DirectionEnd::Eof => debug!("Tid:{}, {} closed after {} bytes", tid, label, bytes),
        DirectionEnd::Error(e) => debug!("Tid:{}, {} ended with error after {} bytes: {}", tid, label, bytes, e),
        DirectionEnd::Idle => debug!("Tid:{}, {} idle for too long after {} bytes", tid, label, bytes),
    }
}

/// Relay `a` and `b` until both directions are done, then close both
///
/// Copy errors end their direction and are logged at debug; they never fail
/// the call. Dropping the returned future stops both directions and
/// releases the units.
pub async fn relay<A, B>(tid: &str, a: A, b: B, options: RelayOptions) -> RelayStats
where
    A: Unit + 'static,
    B: Unit + 'static,
{
    let (a_reader, a_writer) = split(a);
    let (b_reader, b_writer) = split(b);
    let (done_tx, done_rx) = watch::channel(false);
    let buffer_size = options.buffer_size.max(1);
    let linger = options.linger;

    let mut a_to_b: DirectionTask<Direction<A, B>> = DirectionTask(tokio::spawn(copy_direction(
        a_reader,
        b_writer,
        buffer_size,
        linger,
        done_rx.clone(),
    )));
    let mut b_to_a: DirectionTask<Direction<B, A>> = DirectionTask(tokio::spawn(copy_direction(
        b_reader,
        a_writer,
        buffer_size,
        linger,
        done_rx,
    )));

    // One direction ending only arms the idle limit on the other
    let (forward, backward) = tokio::select! {
        first = a_to_b.join() => {
            let _ = done_tx.send(true);
            (first, b_to_a.join().await)
        }
        first = b_to_a.join() => {
            let _ = done_tx.send(true);
            (a_to_b.join().await, first)
        }
    };

    let mut stats = RelayStats::default();
    match (forward, backward) {
        (Ok(forward), Ok(backward)) => {
            log_end(tid, "client -> remote", forward.bytes, &forward.end);
            log_end(tid, "remote -> client", backward.bytes, &backward.end);
            stats.a_to_b = forward.bytes;
            stats.b_to_a = backward.bytes;

            let mut a = forward.reader.unsplit(backward.writer);
            let mut b = backward.reader.unsplit(forward.writer);
            a.close().await;
            b.close().await;
        }
        // A panicked direction dropped its halves, which releases the units
        (forward, backward) => {
            for result in [forward.err(), backward.err()].into_iter().flatten() {
                debug!("Tid:{}, relay direction failed: {}", tid, result);
            }
        }
    }

    counter!("relay.bytes").increment(stats.a_to_b + stats.b_to_a);
    debug!(
        "Tid:{}, relay finished, {} bytes up, {} bytes down",
        tid, stats.a_to_b, stats.b_to_a
    );
    stats
}
