//! Chunk framing over a byte transport
//!
//! HTTP bodies arrive in network-sized chunks that have nothing to do with
//! record or frame boundaries. [`ChunkStream`] hands those chunks out one at a
//! time and decides when the stream is over: only when the transport itself
//! reports completion. An empty chunk is just an empty chunk.

use async_trait::async_trait;
use bytes::Bytes;
use ferrule_common::{FerruleError, Result};
use futures::Stream;
use std::collections::VecDeque;
use tracing::debug;

/// A source of raw body chunks.
#[async_trait]
pub trait ChunkSource: Send {
    /// Next chunk, or `None` once the transport reports end of data.
    async fn read_chunk(&mut self) -> Result<Option<Bytes>>;
}

#[async_trait]
impl ChunkSource for reqwest::Response {
    async fn read_chunk(&mut self) -> Result<Option<Bytes>> {
        Ok(self.chunk().await?)
    }
}

/// In-memory chunk source, e.g. for replaying a captured response body
#[derive(Debug, Default, Clone)]
pub struct MemoryChunks {
    chunks: VecDeque<Bytes>,
}

impl MemoryChunks {
    pub fn new<I, B>(chunks: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        Self {
            chunks: chunks.into_iter().map(Into::into).collect(),
        }
    }

    /// Split `payload` into chunks of at most `size` bytes
    pub fn split(payload: impl Into<Bytes>, size: usize) -> Self {
        let payload = payload.into();
        let size = size.max(1);
        let mut chunks = VecDeque::new();
        let mut offset = 0;
        while offset < payload.len() {
            let end = (offset + size).min(payload.len());
            chunks.push_back(payload.slice(offset..end));
            offset = end;
        }
        Self { chunks }
    }
}

#[async_trait]
impl ChunkSource for MemoryChunks {
    async fn read_chunk(&mut self) -> Result<Option<Bytes>> {
        Ok(self.chunks.pop_front())
    }
}

/// Lazy, non-restartable sequence of body chunks.
///
/// End of stream is signalled exactly once; every call after that (or after
/// a transport error) returns `Ok(None)` without touching the source again.
pub struct ChunkStream<S> {
    source: S,
    finished: bool,
    chunks_read: u64,
    bytes_read: u64,
}

impl<S: ChunkSource> ChunkStream<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            finished: false,
            chunks_read: 0,
            bytes_read: 0,
        }
    }

    /// Read the next chunk. Empty chunks are returned as-is.
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        if self.finished {
            return Ok(None);
        }

        match self.source.read_chunk().await {
            Ok(Some(chunk)) => {
                self.chunks_read += 1;
                self.bytes_read += chunk.len() as u64;
                Ok(Some(chunk))
            }
            Ok(None) => {
                self.finished = true;
                debug!(
                    chunks = self.chunks_read,
                    bytes = self.bytes_read,
                    "At EOF, stopping chunk iteration"
                );
                Ok(None)
            }
            Err(e) => {
                self.finished = true;
                Err(e)
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Adapt into a `futures::Stream` of chunks
    pub fn into_stream(self) -> impl Stream<Item = Result<Bytes>> + Send
    where
        S: 'static,
    {
        futures::stream::try_unfold(self, |mut chunks| async move {
            Ok::<_, FerruleError>(chunks.next_chunk().await?.map(|chunk| (chunk, chunks)))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    /// Yields its chunks, then one error, then would panic if polled again.
    struct FailingSource {
        chunks: VecDeque<Bytes>,
        failed: bool,
    }

    #[async_trait]
    impl ChunkSource for FailingSource {
        async fn read_chunk(&mut self) -> Result<Option<Bytes>> {
            if let Some(chunk) = self.chunks.pop_front() {
                return Ok(Some(chunk));
            }
            assert!(!self.failed, "source polled after failure");
            self.failed = true;
            Err(FerruleError::Internal("connection reset".into()))
        }
    }

    #[tokio::test]
    async fn test_empty_chunk_is_not_end_of_stream() {
        let mut stream = ChunkStream::new(MemoryChunks::new(vec![
            Bytes::from_static(b"a"),
            Bytes::new(),
            Bytes::from_static(b"b"),
        ]));

        assert_eq!(stream.next_chunk().await.unwrap().unwrap(), "a");
        assert_eq!(stream.next_chunk().await.unwrap().unwrap(), "");
        assert!(!stream.is_finished());
        assert_eq!(stream.next_chunk().await.unwrap().unwrap(), "b");
        assert!(stream.next_chunk().await.unwrap().is_none());
        assert!(stream.is_finished());
        assert_eq!(stream.bytes_read(), 2);
    }

    #[tokio::test]
    async fn test_end_of_stream_is_sticky() {
        let mut stream = ChunkStream::new(MemoryChunks::default());
        assert!(stream.next_chunk().await.unwrap().is_none());
        assert!(stream.next_chunk().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_error_finishes_stream() {
        let mut stream = ChunkStream::new(FailingSource {
            chunks: VecDeque::from(vec![Bytes::from_static(b"x")]),
            failed: false,
        });
        assert!(stream.next_chunk().await.unwrap().is_some());
        assert!(stream.next_chunk().await.is_err());
        assert!(stream.next_chunk().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_split_and_stream_adapter() {
        let source = MemoryChunks::split(&b"hello world"[..], 4);
        let chunks: Vec<Bytes> = ChunkStream::new(source).into_stream().try_collect().await.unwrap();
        assert_eq!(chunks, vec!["hell", "o wo", "rld"]);
    }
}
