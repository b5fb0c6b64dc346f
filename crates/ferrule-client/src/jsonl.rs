//! Line-delimited JSON decoding (`FORMAT JSONEachRow`)
//!
//! Chunk boundaries split lines arbitrarily, so unterminated trailing bytes
//! are carried over and completed by later chunks. A record may span any
//! number of chunks.

use crate::chunks::{ChunkSource, ChunkStream};
use bytes::Bytes;
use ferrule_common::{FerruleError, Result};
use futures::Stream;
use serde::de::DeserializeOwned;
use std::collections::VecDeque;
use std::marker::PhantomData;
use tracing::debug;

/// Default record separator
pub const LINE_SEPARATOR: u8 = b'\n';

/// Decodes one JSON record per line from a chunked body, in arrival order.
pub struct JsonLinesDecoder<S, T = serde_json::Value> {
    chunks: ChunkStream<S>,
    separator: u8,
    carry: Vec<u8>,
    lines: VecDeque<Bytes>,
    records: u64,
    finished: bool,
    _record: PhantomData<fn() -> T>,
}

impl<S: ChunkSource, T: DeserializeOwned> JsonLinesDecoder<S, T> {
    pub fn new(chunks: ChunkStream<S>) -> Self {
        Self::with_separator(chunks, LINE_SEPARATOR)
    }

    pub fn with_separator(chunks: ChunkStream<S>, separator: u8) -> Self {
        Self {
            chunks,
            separator,
            carry: Vec::new(),
            lines: VecDeque::new(),
            records: 0,
            finished: false,
            _record: PhantomData,
        }
    }

    /// Next decoded record, or `None` at end of stream.
    pub async fn next_record(&mut self) -> Result<Option<T>> {
        loop {
            if let Some(line) = self.lines.pop_front() {
                let record = decode_line(&line)?;
                self.records += 1;
                return Ok(Some(record));
            }

            if self.finished {
                return Ok(None);
            }

            match self.chunks.next_chunk().await? {
                Some(chunk) => self.split_chunk(chunk),
                None => return self.finish(),
            }
        }
    }

    /// Records decoded so far
    pub fn records(&self) -> u64 {
        self.records
    }

    /// Adapt into a `futures::Stream` of records
    pub fn into_stream(self) -> impl Stream<Item = Result<T>> + Send
    where
        S: 'static,
        T: Send + 'static,
    {
        futures::stream::try_unfold(self, |mut decoder| async move {
            Ok::<_, FerruleError>(decoder.next_record().await?.map(|record| (record, decoder)))
        })
    }

    fn split_chunk(&mut self, chunk: Bytes) {
        let mut start = 0;
        for (i, byte) in chunk.iter().enumerate() {
            if *byte != self.separator {
                continue;
            }
            if self.carry.is_empty() {
                self.push_line(chunk.slice(start..i));
            } else {
                self.carry.extend_from_slice(&chunk[start..i]);
                let line = Bytes::from(std::mem::take(&mut self.carry));
                self.push_line(line);
            }
            start = i + 1;
        }
        self.carry.extend_from_slice(&chunk[start..]);
    }

    // Blank lines carry no record.
    fn push_line(&mut self, line: Bytes) {
        if !line.trim_ascii().is_empty() {
            self.lines.push_back(line);
        }
    }

    fn finish(&mut self) -> Result<Option<T>> {
        self.finished = true;
        let tail = std::mem::take(&mut self.carry);

        if tail.trim_ascii().is_empty() {
            debug!(records = self.records, "JSON lines stream complete");
            return Ok(None);
        }

        let record = serde_json::from_slice(&tail).map_err(|e| {
            FerruleError::MalformedStream(format!(
                "undecodable trailing fragment of {} bytes: {}",
                tail.len(),
                e
            ))
        })?;
        self.records += 1;
        debug!(records = self.records, "JSON lines stream complete");
        Ok(Some(record))
    }
}

fn decode_line<T: DeserializeOwned>(line: &[u8]) -> Result<T> {
    serde_json::from_slice(line).map_err(|e| {
        FerruleError::MalformedStream(format!("undecodable line of {} bytes: {}", line.len(), e))
    })
}
