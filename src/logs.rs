//! Log multiplexer: one framed stream over every pod serving a function.
//!
//! Each pod gets its own reader task; all of them funnel framed chunks into
//! a single channel so the consumer sees one interleaved stream. Within a
//! pod, frame order follows read order. A pod whose stream fails is dropped
//! from the mux without disturbing the others, and the merged stream ends
//! once every reader is done.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::warn;

use crate::substrate::{LabelSelector, LogStream, Substrate, SubstrateError};

/// Pause between polls when a follow stream reports nothing new.
const EMPTY_READ_BACKOFF: Duration = Duration::from_secs(1);

/// Frame one chunk of a pod's output: `data: <pod>: <chunk>\n\n`.
fn frame_chunk(pod: &str, chunk: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(pod.len() + chunk.len() + 10);
    frame.extend_from_slice(b"data: ");
    frame.extend_from_slice(pod.as_bytes());
    frame.extend_from_slice(b": ");
    frame.extend_from_slice(chunk);
    frame.extend_from_slice(b"\n\n");
    frame
}

async fn pump_pod_logs(mut stream: LogStream, pod: String, tx: mpsc::Sender<Vec<u8>>) {
    while let Some(read) = stream.next().await {
        match read {
            Ok(chunk) if chunk.is_empty() => {
                // Nothing new on a follow stream; back off before polling
                // again.
                tokio::time::sleep(EMPTY_READ_BACKOFF).await;
            }
            Ok(chunk) => {
                if tx.send(frame_chunk(&pod, &chunk)).await.is_err() {
                    // Consumer hung up.
                    return;
                }
            }
            Err(err) => {
                warn!(pod = %pod, error = %err, "log stream read failed, dropping pod from mux");
                return;
            }
        }
    }
}

/// Open a merged log stream over all pods labeled `app=<functionId>`.
///
/// The channel is the single writer boundary: reader tasks never share a
/// sink, they share a sender. With no matching pods the stream ends
/// immediately.
pub async fn stream_function_logs(
    substrate: Arc<dyn Substrate>,
    function_id: &str,
    follow: bool,
) -> Result<LogStream, SubstrateError> {
    let pods = substrate.list_pods(&LabelSelector::app(function_id)).await?;

    let (tx, rx) = mpsc::channel::<Vec<u8>>(64);
    for pod in pods {
        match substrate.stream_pod_logs(&pod.name, follow).await {
            Ok(stream) => {
                tokio::spawn(pump_pod_logs(stream, pod.name, tx.clone()));
            }
            Err(err) => {
                warn!(pod = %pod.name, error = %err, "could not open pod log stream");
            }
        }
    }
    drop(tx);

    let merged = futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|frame| (Ok(frame), rx))
    });
    Ok(merged.boxed())
}
