#![cfg(feature = "async")]

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::batch::{FileReport, Pipeline};
use crate::decoder::TelemetryDecoder;
use crate::payload::{PayloadLoader, SourceFile};
use crate::runner::CommandRunner;

/// Run a batch as a Tokio `Stream` of per-file reports.
///
/// Files are still processed one at a time, in order: the synchronous pipeline runs on a
/// blocking thread (`tokio::task::spawn_blocking`) and forwards each report over a bounded
/// channel. Dropping the stream stops the batch after the file in progress.
///
/// `buffer` controls the channel capacity.
pub fn stream_batch<R, L, D>(
    pipeline: Pipeline<R, L, D>,
    sources: Vec<SourceFile>,
    buffer: usize,
) -> ReceiverStream<FileReport>
where
    R: CommandRunner + Send + 'static,
    L: PayloadLoader + Send + 'static,
    D: TelemetryDecoder + Send + 'static,
{
    let (tx, rx) = mpsc::channel(buffer.max(1));

    tokio::task::spawn_blocking(move || {
        for source in &sources {
            let report = pipeline.report_file(source);
            if tx.blocking_send(report).is_err() {
                break;
            }
        }
    });

    ReceiverStream::new(rx)
}
