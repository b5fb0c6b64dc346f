//! Arrow IPC stream decoding (`FORMAT ArrowStream`)
//!
//! Two decoders share the [`ColumnarDecoder`] interface:
//!
//! - [`ArrowStreamDecoder`] decodes incrementally on the async runtime and
//!   only awaits when it needs the next body chunk.
//! - [`BlockingArrowStream`] runs arrow's blocking [`StreamReader`] on a
//!   dedicated blocking thread, fed by an async pump task. It gives up overlap
//!   with other tasks on that thread in exchange for a plain `Read` source.
//!
//! Callers pick one; they are never mixed on one response.

use crate::chunks::{ChunkSource, ChunkStream};
use arrow_array::RecordBatch;
use arrow_buffer::Buffer;
use arrow_ipc::reader::{StreamDecoder, StreamReader};
use arrow_schema::SchemaRef;
use async_trait::async_trait;
use bytes::{Buf, Bytes};
use ferrule_common::{FerruleError, Result};
use futures::Stream;
use std::io::{self, BufReader, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Chunks buffered between the pump task and the blocking reader
pub const DEFAULT_CHUNK_BUFFER: usize = 16;

/// Decoded batches buffered between the blocking reader and the caller
pub const DEFAULT_BATCH_BUFFER: usize = 4;

/// A source of record batches decoded from a columnar stream
#[async_trait]
pub trait ColumnarDecoder: Send {
    /// Next batch in arrival order, or `None` when the stream is complete
    async fn next_batch(&mut self) -> Result<Option<RecordBatch>>;
}

/// Adapt any decoder into a `futures::Stream` of batches
pub fn batch_stream<D>(decoder: D) -> impl Stream<Item = Result<RecordBatch>> + Send
where
    D: ColumnarDecoder + 'static,
{
    futures::stream::try_unfold(decoder, |mut decoder| async move {
        Ok::<_, FerruleError>(decoder.next_batch().await?.map(|batch| (batch, decoder)))
    })
}

/// Incremental Arrow IPC stream decoder driven by body chunks
pub struct ArrowStreamDecoder<S> {
    chunks: ChunkStream<S>,
    decoder: StreamDecoder,
    buffer: Buffer,
    batches: u64,
    finished: bool,
}

impl<S: ChunkSource> ArrowStreamDecoder<S> {
    pub fn new(chunks: ChunkStream<S>) -> Self {
        Self {
            chunks,
            decoder: StreamDecoder::new(),
            buffer: Buffer::from_vec(Vec::<u8>::new()),
            batches: 0,
            finished: false,
        }
    }

    /// Batches decoded so far
    pub fn batches(&self) -> u64 {
        self.batches
    }

    async fn decode_next(&mut self) -> Result<Option<RecordBatch>> {
        if self.finished {
            return Ok(None);
        }

        loop {
            // Decoding never awaits; a batch split across chunks waits in the
            // decoder's internal state until the rest arrives.
            if !self.buffer.is_empty() {
                if let Some(batch) = self.decoder.decode(&mut self.buffer)? {
                    self.batches += 1;
                    return Ok(Some(batch));
                }
            }

            match self.chunks.next_chunk().await? {
                Some(chunk) => self.buffer = Buffer::from(chunk),
                None => {
                    self.finished = true;
                    self.decoder.finish().map_err(|e| {
                        FerruleError::MalformedStream(format!(
                            "Arrow stream truncated after {} batches: {}",
                            self.batches, e
                        ))
                    })?;
                    debug!(batches = self.batches, "Arrow stream complete");
                    return Ok(None);
                }
            }
        }
    }
}

#[async_trait]
impl<S: ChunkSource> ColumnarDecoder for ArrowStreamDecoder<S> {
    async fn next_batch(&mut self) -> Result<Option<RecordBatch>> {
        self.decode_next().await
    }
}

/// Blocking Arrow IPC reader over any `Read` source
pub struct BlockingArrowDecoder<R: Read> {
    reader: StreamReader<BufReader<R>>,
}

impl<R: Read> BlockingArrowDecoder<R> {
    /// Reads the schema message before returning
    pub fn try_new(source: R) -> Result<Self> {
        let reader = StreamReader::try_new(BufReader::new(source), None)?;
        Ok(Self { reader })
    }

    pub fn schema(&self) -> SchemaRef {
        self.reader.schema()
    }
}

impl<R: Read> Iterator for BlockingArrowDecoder<R> {
    type Item = Result<RecordBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        self.reader.next().map(|batch| batch.map_err(FerruleError::from))
    }
}

/// `Read` adapter over chunks arriving on a channel. Must only be used from a
/// blocking context.
pub struct ChannelReader {
    receiver: mpsc::Receiver<Bytes>,
    current: Bytes,
    closed: Arc<AtomicBool>,
}

impl ChannelReader {
    pub fn new(receiver: mpsc::Receiver<Bytes>) -> Self {
        Self {
            receiver,
            current: Bytes::new(),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Set once the sending side has closed and every chunk was read
    pub fn closed_flag(&self) -> Arc<AtomicBool> {
        self.closed.clone()
    }
}

impl Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        while self.current.is_empty() {
            match self.receiver.blocking_recv() {
                Some(chunk) => self.current = chunk,
                None => {
                    self.closed.store(true, Ordering::Release);
                    return Ok(0);
                }
            }
        }
        let n = buf.len().min(self.current.len());
        buf[..n].copy_from_slice(&self.current[..n]);
        self.current.advance(n);
        Ok(n)
    }
}

/// Arrow IPC decoding on a dedicated blocking thread.
///
/// A pump task moves body chunks into a bounded channel, the blocking thread
/// decodes them with [`StreamReader`], and batches come back over a second
/// bounded channel. Dropping this stops the pump.
pub struct BlockingArrowStream {
    batches: mpsc::Receiver<Result<RecordBatch>>,
    pump: Option<JoinHandle<Result<()>>>,
    decoded: u64,
}

impl BlockingArrowStream {
    pub fn spawn<S>(chunks: ChunkStream<S>) -> Self
    where
        S: ChunkSource + 'static,
    {
        Self::spawn_with_buffers(chunks, DEFAULT_CHUNK_BUFFER, DEFAULT_BATCH_BUFFER)
    }

    pub fn spawn_with_buffers<S>(
        mut chunks: ChunkStream<S>,
        chunk_buffer: usize,
        batch_buffer: usize,
    ) -> Self
    where
        S: ChunkSource + 'static,
    {
        let (chunk_tx, chunk_rx) = mpsc::channel::<Bytes>(chunk_buffer.max(1));
        let (batch_tx, batch_rx) = mpsc::channel(batch_buffer.max(1));

        let pump = tokio::spawn(async move {
            while let Some(chunk) = chunks.next_chunk().await? {
                if chunk.is_empty() {
                    continue;
                }
                if chunk_tx.send(chunk).await.is_err() {
                    // Reader stopped early (decode error or consumer gone)
                    break;
                }
            }
            Ok::<(), FerruleError>(())
        });

        tokio::task::spawn_blocking(move || {
            let reader = ChannelReader::new(chunk_rx);
            let closed = reader.closed_flag();
            let mut decoded = 0u64;
            // A read error after the body ended means the stream was cut short
            let classify = |e: FerruleError, decoded: u64| {
                if closed.load(Ordering::Acquire) {
                    FerruleError::MalformedStream(format!(
                        "Arrow stream ended mid-message after {} batches: {}",
                        decoded, e
                    ))
                } else {
                    e
                }
            };

            let decoder = match BlockingArrowDecoder::try_new(reader) {
                Ok(decoder) => decoder,
                Err(e) => {
                    let _ = batch_tx.blocking_send(Err(classify(e, decoded)));
                    return;
                }
            };
            for batch in decoder {
                let batch = batch.map_err(|e| classify(e, decoded));
                let failed = batch.is_err();
                if batch_tx.blocking_send(batch).is_err() || failed {
                    return;
                }
                decoded += 1;
            }
        });

        Self {
            batches: batch_rx,
            pump: Some(pump),
            decoded: 0,
        }
    }

    /// Batches handed out so far
    pub fn batches(&self) -> u64 {
        self.decoded
    }

    /// Transport errors take precedence: a connection dropped mid-body shows
    /// up on the reader side as a plain EOF or a truncated frame.
    async fn pump_result(&mut self, wait: bool) -> Result<()> {
        match self.pump.take() {
            Some(handle) if wait || handle.is_finished() => handle.await?,
            Some(handle) => {
                handle.abort();
                Ok(())
            }
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ColumnarDecoder for BlockingArrowStream {
    async fn next_batch(&mut self) -> Result<Option<RecordBatch>> {
        match self.batches.recv().await {
            Some(Ok(batch)) => {
                self.decoded += 1;
                Ok(Some(batch))
            }
            Some(Err(decode_error)) => {
                self.pump_result(false).await?;
                Err(decode_error)
            }
            None => {
                self.pump_result(true).await?;
                debug!(batches = self.decoded, "Blocking Arrow stream complete");
                Ok(None)
            }
        }
    }
}

impl Drop for BlockingArrowStream {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.take() {
            if !pump.is_finished() {
                warn!("Blocking Arrow stream dropped before completion, stopping pump");
            }
            pump.abort();
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::chunks::MemoryChunks;
    use arrow_array::{Int64Array, StringArray};
    use arrow_ipc::writer::StreamWriter;
    use arrow_schema::{DataType, Field, Schema};

    /// Batches of `rows` rows each, ids counting up across batches
    pub(crate) fn reference_batches(count: usize, rows: usize) -> Vec<RecordBatch> {
        let schema = Arc::new(Schema::new(vec![
            Field::new("id", DataType::Int64, false),
            Field::new("event", DataType::Utf8, true),
        ]));
        (0..count)
            .map(|b| {
                let ids: Vec<i64> = (0..rows).map(|r| (b * rows + r) as i64).collect();
                let events: Vec<Option<String>> = ids
                    .iter()
                    .map(|id| (id % 3 != 0).then(|| format!("event-{id}")))
                    .collect();
                RecordBatch::try_new(
                    schema.clone(),
                    vec![
                        Arc::new(Int64Array::from(ids)),
                        Arc::new(StringArray::from(events)),
                    ],
                )
                .unwrap()
            })
            .collect()
    }

    pub(crate) fn encode_stream(batches: &[RecordBatch]) -> Vec<u8> {
        let mut out = Vec::new();
        {
            let mut writer = StreamWriter::try_new(&mut out, &batches[0].schema()).unwrap();
            for batch in batches {
                writer.write(batch).unwrap();
            }
            writer.finish().unwrap();
        }
        out
    }

    async fn drain<D: ColumnarDecoder>(mut decoder: D) -> Result<Vec<RecordBatch>> {
        let mut out = Vec::new();
        while let Some(batch) = decoder.next_batch().await? {
            out.push(batch);
        }
        Ok(out)
    }

    #[tokio::test]
    async fn test_async_decoder_single_chunk() {
        let batches = reference_batches(3, 5);
        let stream = encode_stream(&batches);
        let decoder = ArrowStreamDecoder::new(ChunkStream::new(MemoryChunks::new(vec![stream])));
        assert_eq!(drain(decoder).await.unwrap(), batches);
    }

    #[tokio::test]
    async fn test_async_decoder_any_chunk_size() {
        let batches = reference_batches(4, 7);
        let stream = encode_stream(&batches);
        for size in [1, 2, 3, 7, 8, 64, 100, 333, 4096, stream.len()] {
            let source = MemoryChunks::split(stream.clone(), size);
            let decoded = drain(ArrowStreamDecoder::new(ChunkStream::new(source))).await.unwrap();
            assert_eq!(decoded, batches, "chunk size {size}");
        }
    }

    #[tokio::test]
    async fn test_async_decoder_tolerates_empty_chunks() {
        let batches = reference_batches(2, 3);
        let stream = Bytes::from(encode_stream(&batches));
        let mid = stream.len() / 2;
        let source = MemoryChunks::new(vec![
            Bytes::new(),
            stream.slice(..mid),
            Bytes::new(),
            stream.slice(mid..),
        ]);
        let decoded = drain(ArrowStreamDecoder::new(ChunkStream::new(source))).await.unwrap();
        assert_eq!(decoded, batches);
    }

    #[tokio::test]
    async fn test_async_decoder_truncated_stream() {
        let stream = encode_stream(&reference_batches(2, 10));
        let truncated = stream[..stream.len() - 20].to_vec();
        let mut decoder =
            ArrowStreamDecoder::new(ChunkStream::new(MemoryChunks::split(truncated, 16)));

        let first = decoder.next_batch().await.unwrap();
        assert!(first.is_some());
        let err = decoder.next_batch().await.unwrap_err();
        assert_eq!(err.code(), "MALFORMED_STREAM");
        assert_eq!(decoder.batches(), 1);
    }

    #[tokio::test]
    async fn test_async_decoder_empty_body() {
        let decoder = ArrowStreamDecoder::new(ChunkStream::new(MemoryChunks::default()));
        assert!(drain(decoder).await.unwrap().is_empty());
    }

    #[test]
    fn test_blocking_decoder_over_reader() {
        let batches = reference_batches(3, 4);
        let stream = encode_stream(&batches);
        let decoder = BlockingArrowDecoder::try_new(std::io::Cursor::new(stream)).unwrap();
        assert_eq!(decoder.schema(), batches[0].schema());
        let decoded: Vec<RecordBatch> = decoder.collect::<Result<_>>().unwrap();
        assert_eq!(decoded, batches);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_blocking_stream_matches_async_decoder() {
        let batches = reference_batches(5, 6);
        let stream = encode_stream(&batches);
        for size in [1, 13, 256, stream.len()] {
            let source = MemoryChunks::split(stream.clone(), size);
            let blocking = BlockingArrowStream::spawn_with_buffers(ChunkStream::new(source), 2, 1);
            assert_eq!(drain(blocking).await.unwrap(), batches, "chunk size {size}");
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_blocking_stream_truncated_stream() {
        let stream = encode_stream(&reference_batches(2, 10));
        let truncated = stream[..stream.len() - 20].to_vec();
        let source = MemoryChunks::split(truncated, 16);
        let mut decoder = BlockingArrowStream::spawn_with_buffers(ChunkStream::new(source), 2, 1);

        assert!(decoder.next_batch().await.unwrap().is_some());
        let err = decoder.next_batch().await.unwrap_err();
        assert_eq!(err.code(), "MALFORMED_STREAM");
        assert_eq!(decoder.batches(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_blocking_stream_empty_body() {
        let source = MemoryChunks::default();
        let err = drain(BlockingArrowStream::spawn(ChunkStream::new(source)))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "MALFORMED_STREAM");
    }

    #[test]
    fn test_channel_reader_flags_close() {
        let (tx, rx) = mpsc::channel(2);
        tx.try_send(Bytes::from_static(b"abc")).unwrap();
        drop(tx);

        let mut reader = ChannelReader::new(rx);
        let closed = reader.closed_flag();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"abc");
        assert!(closed.load(Ordering::Acquire));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_blocking_stream_reports_garbage() {
        // Continuation marker and a short length, then bytes that are no flatbuffer
        let garbage: Vec<u8> = [0xFF, 0xFF, 0xFF, 0xFF, 8, 0, 0, 0]
            .into_iter()
            .chain(*b"notarrow")
            .collect();
        let source = MemoryChunks::new(vec![garbage]);
        let err = drain(BlockingArrowStream::spawn(ChunkStream::new(source)))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "ARROW_ERROR");
    }

    #[tokio::test]
    async fn test_batch_stream_adapter() {
        use futures::TryStreamExt;

        let batches = reference_batches(3, 2);
        let source = MemoryChunks::split(encode_stream(&batches), 50);
        let rows: Vec<usize> = batch_stream(ArrowStreamDecoder::new(ChunkStream::new(source)))
            .map_ok(|batch| batch.num_rows())
            .try_collect()
            .await
            .unwrap();
        assert_eq!(rows, vec![2, 2, 2]);
    }
}
