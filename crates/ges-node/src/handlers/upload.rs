//! Request body intake for the RPC services.
//!
//! The body is copied into a spool that feeds the backend's stdin. A gzip
//! body is inflated on a blocking thread with [`flate2::read::GzDecoder`],
//! one bounded buffer at a time, so a highly compressed upload never
//! expands in memory beyond [`CHUNK_SIZE`] per step.

use axum::body::BodyDataStream;
use bytes::{Buf, Bytes};
use flate2::read::GzDecoder;
use futures::StreamExt;
use ges_pipe::SpoolWriter;
use parking_lot::Mutex;
use std::io::{self, Read};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, Instrument};

use crate::error::{GatewayError, Result};

/// Largest slice of inflated data held at once.
pub(crate) const CHUNK_SIZE: usize = 64 * 1024;

/// Encoded chunks in flight between the body reader and the inflater.
const INFLATE_QUEUE: usize = 4;

/// Failure of a body copy, readable after the pump itself is gone.
#[derive(Clone, Default)]
pub(crate) struct IntakeError(Arc<Mutex<Option<GatewayError>>>);

impl IntakeError {
    /// The intake error, if the copy failed.
    pub(crate) fn take(&self) -> Option<GatewayError> {
        self.0.lock().take()
    }

    fn set(&self, err: GatewayError) {
        *self.0.lock() = Some(err);
    }
}

/// Background copy of a request body into a spool.
///
/// Dropping the pump aborts the copy and releases the spool writer, and
/// with it the body stream.
pub(crate) struct BodyPump {
    error: IntakeError,
    task: JoinHandle<()>,
}

impl BodyPump {
    /// Starts copying `body` into `sink`. The spool is finished on success
    /// and left unfinished on error, which the backend sees as a broken
    /// stdin.
    pub(crate) fn spawn(body: BodyDataStream, mut sink: SpoolWriter, gzip: bool) -> Self {
        let error = IntakeError::default();
        let slot = error.clone();
        let task = tokio::spawn(
            async move {
                match pump_body(body, &mut sink, gzip).await {
                    Ok(()) => {
                        debug!(
                            bytes = sink.len(),
                            spilled = sink.is_spilled(),
                            "Request body buffered"
                        );
                        sink.finish();
                    }
                    Err(err) => {
                        debug!(error = %err, "Request body intake failed");
                        slot.set(err);
                    }
                }
            }
            .instrument(tracing::Span::current()),
        );
        Self { error, task }
    }

    /// Handle to the copy's failure, if any.
    pub(crate) fn error(&self) -> IntakeError {
        self.error.clone()
    }

    /// True once the copy has stopped, successfully or not.
    #[cfg(test)]
    pub(crate) fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for BodyPump {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn pump_body(mut body: BodyDataStream, sink: &mut SpoolWriter, gzip: bool) -> Result<()> {
    if gzip {
        return pump_gzip(body, sink).await;
    }
    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(|e| GatewayError::BadRequest(format!("request body: {e}")))?;
        sink.write(&chunk).await?;
    }
    Ok(())
}

async fn pump_gzip(mut body: BodyDataStream, sink: &mut SpoolWriter) -> Result<()> {
    let (input_tx, input_rx) = mpsc::channel::<Bytes>(INFLATE_QUEUE);
    let (output_tx, mut output_rx) = mpsc::channel::<Vec<u8>>(1);
    let inflater = tokio::task::spawn_blocking(move || inflate(input_rx, output_tx));

    let feed = async move {
        loop {
            // A stopped inflater ends the feed; its result says why.
            let chunk = tokio::select! {
                chunk = body.next() => chunk,
                () = input_tx.closed() => break,
            };
            let Some(chunk) = chunk else { break };
            let chunk =
                chunk.map_err(|e| GatewayError::BadRequest(format!("request body: {e}")))?;
            if input_tx.send(chunk).await.is_err() {
                break;
            }
        }
        Ok::<_, GatewayError>(())
    };
    let drain = async {
        while let Some(inflated) = output_rx.recv().await {
            sink.write(&inflated).await?;
        }
        Ok::<_, GatewayError>(())
    };
    tokio::try_join!(feed, drain)?;

    inflater
        .await
        .map_err(|e| GatewayError::Internal(format!("gzip task failed: {e}")))?
}

/// Inflates the chunks arriving on `input`, sending at most [`CHUNK_SIZE`]
/// bytes per message. Stops quietly when the receiver goes away.
fn inflate(input: mpsc::Receiver<Bytes>, output: mpsc::Sender<Vec<u8>>) -> Result<()> {
    let mut decoder = GzDecoder::new(ChannelReader {
        input,
        current: Bytes::new(),
    });
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = decoder
            .read(&mut buf)
            .map_err(|e| GatewayError::BadRequest(format!("gzip body: {e}")))?;
        if n == 0 {
            return Ok(());
        }
        if output.blocking_send(buf[..n].to_vec()).is_err() {
            return Ok(());
        }
    }
}

/// Blocking [`Read`] over the encoded chunks. The end of the channel is
/// the end of the body.
struct ChannelReader {
    input: mpsc::Receiver<Bytes>,
    current: Bytes,
}

impl Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.current.is_empty() {
            match self.input.blocking_recv() {
                Some(chunk) => self.current = chunk,
                None => return Ok(0),
            }
        }
        let n = buf.len().min(self.current.len());
        buf[..n].copy_from_slice(&self.current[..n]);
        self.current.advance(n);
        Ok(n)
    }
}
