//! Transports and the stream driver.
//!
//! The protocol task only ever writes through [`Transport`]; reading is done
//! by whoever owns the byte source and pushes chunks into
//! [`ProtocolHandle::data_received`]. [`serve`] wires both directions up for
//! any `AsyncRead`/`AsyncWrite` pair (stdio, sockets, `tokio::io::duplex`).

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::error::ProtocolError;
use crate::protocol::{ExitStatus, Protocol, ProtocolHandle};

/// Size of each read from the underlying stream.
const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Write side of a connection, used from the protocol task.
///
/// Writes must not block; implementations hand the bytes off and return.
pub trait Transport: Send {
    /// Queue an encoded frame for the peer.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection can no longer accept data.
    fn write(&mut self, data: &[u8]) -> io::Result<()>;

    /// Stop accepting writes. Frames already queued are still delivered.
    fn close(&mut self) {}
}

/// Transport that forwards every frame over an unbounded channel.
///
/// [`serve`] drains the receiver into a writer; tests read it directly.
#[derive(Debug)]
pub struct ChannelTransport {
    tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
}

impl ChannelTransport {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }
}

impl Transport for ChannelTransport {
    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        let Some(tx) = &self.tx else {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "transport closed"));
        };
        tx.send(data.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "writer has gone away"))
    }

    fn close(&mut self) {
        self.tx = None;
    }
}

/// Drive `protocol` over a byte stream until the connection ends.
///
/// A reader task feeds chunks into the protocol; a writer task writes and
/// flushes each outgoing frame. End of input is reported as a clean
/// connection loss, read and write failures as a lost connection.
///
/// # Errors
///
/// Returns whatever ended the protocol, unless it ended with `exit`.
///
/// # Example
///
/// ```ignore
/// let status = serve(protocol, tokio::io::stdin(), tokio::io::stdout()).await?;
/// std::process::exit(status.code);
/// ```
pub async fn serve<R, W>(
    protocol: Protocol,
    reader: R,
    writer: W,
) -> Result<ExitStatus, ProtocolError>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let handle = protocol.handle();
    let (transport, frames) = ChannelTransport::new();
    handle.connection_made(transport);

    let writer_task = tokio::spawn(write_loop(writer, frames, handle.clone()));
    let reader_task = tokio::spawn(read_loop(reader, handle));

    let outcome = protocol.run().await;
    reader_task.abort();

    // The transport was dropped with the protocol, so the writer drains and stops
    if let Err(err) = writer_task.await {
        if err.is_panic() {
            return Err(ProtocolError::Io(io::Error::new(
                io::ErrorKind::Other,
                "writer task panicked",
            )));
        }
    }

    outcome
}

async fn read_loop<R>(mut reader: R, handle: ProtocolHandle)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK_SIZE];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                debug!("End of input stream");
                handle.connection_lost(None);
                break;
            }
            Ok(n) => handle.data_received(buf[..n].to_vec()),
            Err(err) => {
                error!("Failed to read from transport: {}", err);
                handle.connection_lost(Some(err));
                break;
            }
        }
    }
}

async fn write_loop<W>(
    mut writer: W,
    mut frames: mpsc::UnboundedReceiver<Vec<u8>>,
    handle: ProtocolHandle,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = frames.recv().await {
        if let Err(err) = write_frame(&mut writer, &frame).await {
            error!("Failed to write to transport: {}", err);
            handle.connection_lost(Some(err));
            break;
        }
    }
}

/// Write one encoded frame and flush it.
async fn write_frame<W>(writer: &mut W, frame: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(frame).await?;
    writer.flush().await
}
