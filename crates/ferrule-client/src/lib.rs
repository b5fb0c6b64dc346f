//! Ferrule ClickHouse client
//!
//! Streams query results out of the ClickHouse HTTP interface:
//! - `encode` - values to ClickHouse literal syntax
//! - `query` - parameter formatting and out-of-band `param_*` values
//! - `client` - sessions, GET/POST request shaping, error classification
//! - `chunks` - body chunk framing
//! - `jsonl` - `JSONEachRow` decoding
//! - `columnar` - `ArrowStream` decoding, async and blocking
//! - `producer` - record batches into a bounded queue

pub mod chunks;
pub mod client;
pub mod columnar;
pub mod encode;
pub mod jsonl;
pub mod producer;
pub mod query;

pub use chunks::{ChunkSource, ChunkStream, MemoryChunks};
pub use client::{
    ClickHouseClient, ClickHouseClientBuilder, ClientOptions, QueryResponse, SessionGuard,
    SessionState,
};
pub use columnar::{batch_stream, ArrowStreamDecoder, BlockingArrowStream, ColumnarDecoder};
pub use encode::{encode, Timestamp, Value};
pub use jsonl::JsonLinesDecoder;
pub use producer::{produce, record_batch_queue, spawn_producer, BatchReceiver, BatchSender};
pub use query::{prepare_query, QueryParameters};

pub use ferrule_common::{FerruleError, Result};
