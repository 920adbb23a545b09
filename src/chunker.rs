use std::io;
use std::pin::pin;

use futures_util::{Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::objectstore::ContentHash;
use crate::transfer::TransferReporter;

const ONE_KIB: usize = 1024;
pub const DEFAULT_CHUNK_SIZE: usize = 256 * ONE_KIB;

/// Splits `stream` into chunks of `chunk_size` bytes; only the last one may be shorter.
pub fn chunk_stream(
    chunk_size: usize,
    mut stream: impl AsyncRead + Unpin,
) -> impl Stream<Item = io::Result<Vec<u8>>> {
    let chunk_size = chunk_size.max(1);
    async_stream::try_stream! {
        loop {
            let mut chunk = Vec::with_capacity(chunk_size);
            let chunk_len = (&mut stream).take(chunk_size as u64).read_to_end(&mut chunk).await?;
            if chunk_len == 0 {
                break;
            }
            yield chunk;
            if chunk_len < chunk_size {
                break;
            }
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum CopyOutcome {
    Finished { len: u64, hash: ContentHash },
    Cancelled,
}

/// Copies `source` into `sink` chunk by chunk, reporting cumulative progress
/// against `total` after each chunk.
///
/// Stops between chunks once the transfer has been cancelled.
pub async fn copy_with_progress<E>(
    reporter: &TransferReporter<E>,
    chunk_size: usize,
    total: u64,
    source: impl AsyncRead + Unpin,
    sink: &mut (impl AsyncWrite + Unpin),
) -> io::Result<CopyOutcome> {
    let mut chunks = pin!(chunk_stream(chunk_size, source));
    let mut hasher = blake3::Hasher::new();
    let mut len = 0u64;

    reporter.progress(0, total);
    while let Some(chunk) = chunks.next().await {
        if reporter.is_cancelled() {
            return Ok(CopyOutcome::Cancelled);
        }
        let chunk = chunk?;
        hasher.update(&chunk);
        sink.write_all(&chunk).await?;

        len += chunk.len() as u64;
        reporter.progress(len, total.max(len));
        // let sibling transfers and the observer interleave with large copies
        tokio::task::yield_now().await;
    }
    if reporter.is_cancelled() {
        return Ok(CopyOutcome::Cancelled);
    }
    sink.flush().await?;

    Ok(CopyOutcome::Finished {
        len,
        hash: hasher.finalize().into(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::{transfer_channel, Progress, TransferEvent};

    #[tokio::test]
    async fn splits_into_fixed_chunks() {
        let data = b"0123456789".as_slice();
        let chunks: Vec<_> = chunk_stream(4, data).collect().await;
        let chunks: Vec<Vec<u8>> = chunks.into_iter().map(Result::unwrap).collect();
        assert_eq!(chunks, [b"0123".to_vec(), b"4567".to_vec(), b"89".to_vec()]);

        let chunks: Vec<_> = chunk_stream(4, b"".as_slice()).collect().await;
        assert!(chunks.is_empty());
    }

    #[tokio::test]
    async fn reports_progress_per_chunk() {
        let (reporter, mut handle) = transfer_channel::<io::Error>();
        let mut sink = Vec::new();

        let outcome = copy_with_progress(&reporter, 3, 7, b"abcdefg".as_slice(), &mut sink)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            CopyOutcome::Finished {
                len: 7,
                hash: ContentHash::from_contents(b"abcdefg"),
            }
        );
        assert_eq!(sink, b"abcdefg");
        drop(reporter);

        let mut seen = vec![];
        while let Some(TransferEvent::Progress(Progress { completed, .. })) = handle.next_event().await {
            seen.push(completed);
        }
        assert_eq!(seen, [0, 3, 6, 7]);
    }

    #[tokio::test]
    async fn stops_when_cancelled() {
        let (reporter, handle) = transfer_channel::<io::Error>();
        assert!(handle.cancel());

        let mut sink = Vec::new();
        let outcome = copy_with_progress(&reporter, 3, 7, b"abcdefg".as_slice(), &mut sink)
            .await
            .unwrap();
        assert_eq!(outcome, CopyOutcome::Cancelled);
        assert!(sink.is_empty());
    }
}
