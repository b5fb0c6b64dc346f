//! Ferrule CLI
//!
//! Runs one query against ClickHouse and writes the result to stdout:
//! - `raw` - GET, body copied as-is
//! - `execute` - POST, body discarded
//! - `jsonl` - POST, records re-serialized one per line
//! - `arrow` / `arrow-blocking` - POST, batches re-encoded as an Arrow IPC stream
//! - `queue` - POST, batches produced into a bounded queue by a background task
//!
//! Connection settings come from `CLICKHOUSE_*` environment variables.

mod telemetry;

use anyhow::{bail, Context};
use arrow_array::RecordBatch;
use arrow_ipc::writer::StreamWriter;
use clap::{Parser, ValueEnum};
use ferrule_client::{
    record_batch_queue, ClickHouseClient, ClientOptions, ColumnarDecoder, QueryParameters, Value,
};
use ferrule_common::config::env_parse_or_default;
use ferrule_common::ClickHouseSettings;
use std::io::{self, Write};
use std::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Raw,
    Execute,
    Jsonl,
    Arrow,
    ArrowBlocking,
    Queue,
}

#[derive(Parser, Debug)]
#[command(name = "ferrule")]
#[command(about = "Stream ClickHouse query results over HTTP")]
struct Args {
    /// Query to run
    query: Option<String>,

    /// Only check that the server answers /ping
    #[arg(long)]
    ping: bool,

    /// ClickHouse HTTP URL (defaults to the offline cluster from settings)
    #[arg(long, env = "FERRULE_URL")]
    url: Option<String>,

    /// Team the query runs for, selects the max_block_size override
    #[arg(long, env = "FERRULE_TEAM_ID")]
    team_id: Option<i64>,

    /// Explicit max_block_size
    #[arg(long)]
    max_block_size: Option<u64>,

    /// How to read the response
    #[arg(long, value_enum, default_value = "raw")]
    format: OutputFormat,

    /// Queue capacity for the `queue` format
    #[arg(long)]
    queue_capacity: Option<usize>,

    /// Query id passed to ClickHouse
    #[arg(long)]
    query_id: Option<String>,

    /// Query parameter as name=value, repeatable
    #[arg(long = "param", value_parser = parse_param)]
    params: Vec<(String, Value)>,

    /// Extra ClickHouse setting as name=value, repeatable
    #[arg(long = "setting", value_parser = parse_setting)]
    settings: Vec<(String, String)>,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

fn parse_setting(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(name, value)| (name.trim().to_string(), value.to_string()))
        .filter(|(name, _)| !name.is_empty())
        .ok_or_else(|| format!("expected name=value, got '{}'", raw))
}

/// Integers and floats are passed as numbers, everything else as a string
fn parse_param(raw: &str) -> Result<(String, Value), String> {
    let (name, value) = parse_setting(raw)?;
    let value = if let Ok(int) = value.parse::<i64>() {
        Value::from(int)
    } else if let Ok(float) = value.parse::<f64>() {
        Value::from(float)
    } else {
        Value::from(value)
    };
    Ok((name, value))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let args = Args::parse();
    telemetry::init(&args.log_level)?;

    let settings = ClickHouseSettings::from_env().context("loading ClickHouse settings")?;
    let options = ClientOptions {
        team_id: args.team_id,
        url: args.url.clone(),
        max_block_size: args.max_block_size,
        extra: args.settings.clone(),
    };
    let mut client = ClickHouseClient::from_settings(&settings, options)?;
    info!(url = %client.url(), "Connecting to ClickHouse");

    let session = client.open()?;

    if args.ping {
        if session.is_alive().await? {
            println!("Ok.");
            return Ok(());
        }
        bail!("ClickHouse at {} is not answering", session.url());
    }

    let Some(query) = args.query.as_deref() else {
        bail!("no query given (pass a query or --ping)");
    };
    let parameters: QueryParameters = args.params.iter().cloned().collect();
    let parameters = (!parameters.is_empty()).then_some(parameters);

    let started = Instant::now();
    let run = Run {
        session: &session,
        query,
        parameters: parameters.as_ref(),
        query_id: args.query_id.as_deref(),
    };

    let summary = match args.format {
        OutputFormat::Raw => run.raw().await?,
        OutputFormat::Execute => run.execute().await?,
        OutputFormat::Jsonl => run.jsonl().await?,
        OutputFormat::Arrow => {
            let decoder = session
                .stream_query_as_arrow(query, &[], run.parameters, run.query_id)
                .await?;
            write_arrow(decoder).await?
        }
        OutputFormat::ArrowBlocking => {
            let decoder = session
                .stream_query_as_arrow_blocking(query, &[], run.parameters, run.query_id)
                .await?;
            write_arrow(decoder).await?
        }
        OutputFormat::Queue => {
            let capacity = args
                .queue_capacity
                .unwrap_or_else(|| env_parse_or_default("FERRULE_QUEUE_CAPACITY", 4));
            run.queue(capacity).await?
        }
    };

    info!(
        format = ?args.format,
        units = summary.units,
        rows = summary.rows,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Query complete"
    );
    Ok(())
}

#[derive(Debug, Default)]
struct Summary {
    /// Records, batches or bytes depending on the format
    units: u64,
    rows: u64,
}

struct Run<'a> {
    session: &'a ClickHouseClient,
    query: &'a str,
    parameters: Option<&'a QueryParameters>,
    query_id: Option<&'a str>,
}

impl Run<'_> {
    async fn raw(&self) -> anyhow::Result<Summary> {
        let body = self
            .session
            .read_query(self.query, self.parameters, self.query_id)
            .await?;
        io::stdout().lock().write_all(&body)?;
        Ok(Summary {
            units: body.len() as u64,
            rows: 0,
        })
    }

    async fn execute(&self) -> anyhow::Result<Summary> {
        self.session
            .execute_query(self.query, &[], self.parameters, self.query_id)
            .await?;
        Ok(Summary::default())
    }

    async fn jsonl(&self) -> anyhow::Result<Summary> {
        let mut decoder = self
            .session
            .stream_query_as_jsonl::<serde_json::Value>(self.query, &[], self.parameters, self.query_id)
            .await?;

        let mut out = io::stdout().lock();
        let mut summary = Summary::default();
        while let Some(record) = decoder.next_record().await? {
            serde_json::to_writer(&mut out, &record)?;
            out.write_all(b"\n")?;
            summary.units += 1;
            summary.rows += 1;
        }
        out.flush()?;
        Ok(summary)
    }

    async fn queue(&self, capacity: usize) -> anyhow::Result<Summary> {
        let (tx, mut rx) = record_batch_queue(capacity);
        let producer = self
            .session
            .spawn_query_producer(self.query, &[], self.parameters, self.query_id, tx)
            .await?;

        let mut summary = Summary::default();
        while let Some(batch) = rx.recv().await {
            summary.units += 1;
            summary.rows += batch.num_rows() as u64;
            println!("batch {}\t{} rows\t{} columns", summary.units, batch.num_rows(), batch.num_columns());
        }

        let produced = producer.await.context("producer task failed")??;
        if produced != summary.units {
            warn!(produced, consumed = summary.units, "Producer and consumer disagree on batch count");
        }
        Ok(summary)
    }
}

/// Re-encode decoded batches as an Arrow IPC stream on stdout
async fn write_arrow<D: ColumnarDecoder>(mut decoder: D) -> anyhow::Result<Summary> {
    let mut summary = Summary::default();
    let mut writer: Option<StreamWriter<io::StdoutLock<'static>>> = None;

    while let Some(batch) = decoder.next_batch().await? {
        if writer.is_none() {
            writer = Some(StreamWriter::try_new(io::stdout().lock(), &batch.schema())?);
        }
        if let Some(writer) = writer.as_mut() {
            write_batch(writer, &batch)?;
        }
        summary.units += 1;
        summary.rows += batch.num_rows() as u64;
    }

    if let Some(mut writer) = writer {
        writer.finish()?;
    }
    Ok(summary)
}

fn write_batch<W: Write>(writer: &mut StreamWriter<W>, batch: &RecordBatch) -> anyhow::Result<()> {
    writer.write(batch)?;
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_param() {
        let (name, value) = parse_param("team_id=2").unwrap();
        assert_eq!(name, "team_id");
        assert_eq!(value.encode_to_string(), "2");

        let (_, value) = parse_param("ratio=0.5").unwrap();
        assert_eq!(value.encode_to_string(), "0.5");

        let (_, value) = parse_param("event=$pageview=x").unwrap();
        assert_eq!(value.encode_to_string(), "'$pageview=x'");

        assert!(parse_param("novalue").is_err());
        assert!(parse_param("=1").is_err());
    }

    #[test]
    fn test_parse_setting() {
        assert_eq!(
            parse_setting("log_comment=batch export").unwrap(),
            ("log_comment".to_string(), "batch export".to_string())
        );
    }

    #[test]
    fn test_args() {
        let args = Args::try_parse_from([
            "ferrule",
            "--format",
            "arrow-blocking",
            "--param",
            "team_id=2",
            "--setting",
            "max_threads=4",
            "SELECT 1",
        ])
        .unwrap();
        assert_eq!(args.format, OutputFormat::ArrowBlocking);
        assert_eq!(args.query.as_deref(), Some("SELECT 1"));
        assert_eq!(args.params.len(), 1);
        assert_eq!(args.settings, vec![("max_threads".to_string(), "4".to_string())]);
    }
}
