//! ClickHouse HTTP client
//!
//! A [`ClickHouseClient`] holds the request defaults (URL, auth headers,
//! database, resource limits). The HTTP connection pool only exists while a
//! session is open: [`ClickHouseClient::open`] returns a [`SessionGuard`] and
//! dropping the guard closes the session on every exit path. Query methods
//! called outside an open session fail with [`FerruleError::NotConnected`].
//!
//! Read-only queries go out as GET with the query in the query string.
//! Everything else is a POST: the encoded rows form the body when there are
//! any, otherwise the query text itself does.

use crate::chunks::ChunkStream;
use crate::columnar::{ArrowStreamDecoder, BlockingArrowStream};
use crate::encode::Value;
use crate::jsonl::JsonLinesDecoder;
use crate::producer::{produce, spawn_producer, BatchSender};
use crate::query::{out_of_band_parameters, prepare_query, QueryParameters};
use bytes::Bytes;
use ferrule_common::{create_client_tls_config, ClickHouseSettings, FerruleError, Result, TlsSettings};
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{StatusCode, Url};
use serde::de::DeserializeOwned;
use std::ops::{Deref, DerefMut};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Header carrying the ClickHouse user
pub const USER_HEADER: &str = "X-ClickHouse-User";

/// Header carrying the ClickHouse password
pub const KEY_HEADER: &str = "X-ClickHouse-Key";

/// Socket connect timeout applied unless configured otherwise
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No session has been opened yet
    Unopened,
    /// A session is open and queries may be sent
    Open,
    /// The last session was closed
    Closed,
}

/// Builder for [`ClickHouseClient`]
#[derive(Debug, Clone)]
pub struct ClickHouseClientBuilder {
    url: String,
    user: Option<String>,
    password: Option<String>,
    database: Option<String>,
    params: Vec<(String, String)>,
    connect_timeout: Duration,
    read_timeout: Option<Duration>,
    tls: TlsSettings,
}

impl Default for ClickHouseClientBuilder {
    fn default() -> Self {
        Self {
            url: "http://localhost:8123".into(),
            user: None,
            password: None,
            database: None,
            params: Vec::new(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_timeout: None,
            tls: TlsSettings::default(),
        }
    }
}

impl ClickHouseClientBuilder {
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    /// Add a request parameter sent with every query. Setting the same name
    /// twice keeps the last value.
    pub fn param(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        let name = name.into();
        let value = value.to_string();
        match self.params.iter_mut().find(|(existing, _)| *existing == name) {
            Some(slot) => slot.1 = value,
            None => self.params.push((name, value)),
        }
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Socket read timeout. Unset by default: long exports may go quiet for a while.
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }

    pub fn tls(mut self, tls: TlsSettings) -> Self {
        self.tls = tls;
        self
    }

    pub fn build(self) -> Result<ClickHouseClient> {
        let url = Url::parse(&self.url)
            .map_err(|e| FerruleError::Config(format!("Invalid ClickHouse URL '{}': {}", self.url, e)))?;

        let mut headers = HeaderMap::new();
        if let Some(user) = self.user.as_deref().filter(|u| !u.is_empty()) {
            headers.insert(USER_HEADER, header_value(USER_HEADER, user)?);
        }
        if let Some(password) = self.password.as_deref().filter(|p| !p.is_empty()) {
            let mut value = header_value(KEY_HEADER, password)?;
            value.set_sensitive(true);
            headers.insert(KEY_HEADER, value);
        }

        let mut params = Vec::with_capacity(self.params.len() + 1);
        match self.database.filter(|d| !d.is_empty()) {
            Some(database) => {
                params.push(("database".to_string(), database));
                params.extend(self.params.into_iter().filter(|(name, _)| name != "database"));
            }
            None => params.extend(self.params),
        }

        Ok(ClickHouseClient {
            url,
            headers,
            params,
            connect_timeout: self.connect_timeout,
            read_timeout: self.read_timeout,
            tls: self.tls,
            http: None,
            state: SessionState::Unopened,
        })
    }
}

fn header_value(name: &str, value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|e| FerruleError::Config(format!("Invalid value for {}: {}", name, e)))
}

/// Per-job options for [`ClickHouseClient::from_settings`]
#[derive(Debug, Clone, Default)]
pub struct ClientOptions {
    /// Team the queries run for; selects the `max_block_size` override
    pub team_id: Option<i64>,
    /// Use this URL instead of the offline cluster
    pub url: Option<String>,
    /// Explicit `max_block_size`, taking precedence over team overrides
    pub max_block_size: Option<u64>,
    /// Additional request parameters
    pub extra: Vec<(String, String)>,
}

/// Live response to a successful query
#[derive(Debug)]
pub struct QueryResponse {
    response: reqwest::Response,
}

impl QueryResponse {
    pub fn status(&self) -> StatusCode {
        self.response.status()
    }

    /// Read the full body. Only for small payloads.
    pub async fn read_all(self) -> Result<Bytes> {
        Ok(self.response.bytes().await?)
    }

    pub async fn text(self) -> Result<String> {
        Ok(self.response.text().await?)
    }

    /// Hand the body over to a chunk consumer
    pub fn into_chunks(self) -> ChunkStream<reqwest::Response> {
        ChunkStream::new(self.response)
    }
}

/// Client for the ClickHouse HTTP interface
#[derive(Debug)]
pub struct ClickHouseClient {
    url: Url,
    headers: HeaderMap,
    params: Vec<(String, String)>,
    connect_timeout: Duration,
    read_timeout: Option<Duration>,
    tls: TlsSettings,
    http: Option<reqwest::Client>,
    state: SessionState,
}

impl ClickHouseClient {
    pub fn builder() -> ClickHouseClientBuilder {
        ClickHouseClientBuilder::default()
    }

    /// Client for export jobs, configured from settings.
    ///
    /// Every request carries the resource limits, cancels read-only queries
    /// when the connection drops and asks for Arrow strings as `Utf8`.
    pub fn from_settings(settings: &ClickHouseSettings, options: ClientOptions) -> Result<Self> {
        let url = options
            .url
            .unwrap_or_else(|| settings.export_url().to_string());
        let max_block_size = options
            .max_block_size
            .filter(|size| *size > 0)
            .unwrap_or_else(|| settings.max_block_size_for(options.team_id));

        let mut builder = Self::builder()
            .url(url)
            .user(&settings.user)
            .password(&settings.password)
            .database(&settings.database)
            .tls(TlsSettings {
                verify: settings.verify,
                ca_path: settings.ca_path.clone(),
            })
            .param("max_execution_time", settings.max_execution_time)
            .param("max_memory_usage", settings.max_memory_usage)
            .param("max_block_size", max_block_size)
            .param("cancel_http_readonly_queries_on_client_close", 1)
            .param("output_format_arrow_string_as_string", "true")
            .param("http_send_timeout", 0);

        for (name, value) in options.extra {
            builder = builder.param(name, value);
        }
        builder.build()
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Request parameters sent with every query
    pub fn default_params(&self) -> &[(String, String)] {
        &self.params
    }

    /// Open a session. The session closes when the guard is dropped.
    pub fn open(&mut self) -> Result<SessionGuard<'_>> {
        if self.state == SessionState::Open {
            return Err(FerruleError::internal("ClickHouse session is already open"));
        }

        let mut builder = reqwest::Client::builder()
            .default_headers(self.headers.clone())
            .connect_timeout(self.connect_timeout);
        if let Some(timeout) = self.read_timeout {
            builder = builder.read_timeout(timeout);
        }
        if self.url.scheme() == "https" {
            builder = builder.use_preconfigured_tls(create_client_tls_config(&self.tls)?);
        }

        self.http = Some(builder.build()?);
        self.state = SessionState::Open;
        debug!(url = %self.url, "Opened ClickHouse session");
        Ok(SessionGuard { client: self })
    }

    /// Close the session and release its connections. Idempotent.
    pub fn close(&mut self) {
        if self.http.take().is_some() {
            debug!(url = %self.url, "Closed ClickHouse session");
        }
        if self.state == SessionState::Open {
            self.state = SessionState::Closed;
        }
    }

    fn session(&self) -> Result<&reqwest::Client> {
        match (&self.http, self.state) {
            (Some(http), SessionState::Open) => Ok(http),
            _ => Err(FerruleError::NotConnected),
        }
    }

    /// Probe `/ping`. Fails only with `NotConnected` outside a session;
    /// transport problems are reported as `Ok(false)`.
    pub async fn is_alive(&self) -> Result<bool> {
        let http = self.session()?;
        let ping = match self.url.join("ping") {
            Ok(url) => url,
            Err(e) => {
                warn!(error = %e, "Failed ClickHouse liveness check");
                return Ok(false);
            }
        };

        match http.get(ping).send().await.and_then(|r| r.error_for_status()) {
            Ok(_) => Ok(true),
            Err(e) => {
                warn!(error = %e, "Failed ClickHouse liveness check");
                Ok(false)
            }
        }
    }

    fn request_params(
        &self,
        query: &str,
        parameters: Option<&QueryParameters>,
        query_id: Option<&str>,
    ) -> Vec<(String, String)> {
        let mut params = self.params.clone();
        if let Some(id) = query_id {
            params.push(("query_id".to_string(), id.to_string()));
        }
        params.extend(out_of_band_parameters(query, parameters));
        params
    }

    /// Send a read-only query as GET.
    ///
    /// Server errors carry the query as the caller passed it, before
    /// parameters were substituted.
    pub async fn get_query(
        &self,
        query: &str,
        parameters: Option<&QueryParameters>,
        query_id: Option<&str>,
    ) -> Result<QueryResponse> {
        let http = self.session()?;
        let prepared = prepare_query(query, parameters)?;

        let mut params = self.request_params(query, parameters, query_id);
        params.push(("query".to_string(), prepared.clone()));

        debug!(query_id, "Sending GET query");
        let response = http.get(self.url.clone()).query(&params).send().await?;
        check_response(response, query).await
    }

    /// Send a query as POST. Non-empty `rows` are encoded and sent as the
    /// body, joined by `,`; otherwise the query itself is the body.
    pub async fn post_query(
        &self,
        query: &str,
        rows: &[Value],
        parameters: Option<&QueryParameters>,
        query_id: Option<&str>,
    ) -> Result<QueryResponse> {
        let http = self.session()?;
        let prepared = prepare_query(query, parameters)?;
        let mut params = self.request_params(query, parameters, query_id);

        let body = if rows.is_empty() {
            Bytes::from(prepared.clone())
        } else {
            params.push(("query".to_string(), prepared.clone()));
            encode_rows(rows)
        };

        debug!(query_id, rows = rows.len(), "Sending POST query");
        let response = http
            .post(self.url.clone())
            .query(&params)
            .body(body)
            .send()
            .await?;
        check_response(response, &prepared).await
    }

    /// Run a query and discard the response body
    pub async fn execute_query(
        &self,
        query: &str,
        rows: &[Value],
        parameters: Option<&QueryParameters>,
        query_id: Option<&str>,
    ) -> Result<()> {
        self.post_query(query, rows, parameters, query_id)
            .await?
            .read_all()
            .await?;
        Ok(())
    }

    /// Run a read-only query and read the whole response, e.g. for `count()`
    pub async fn read_query(
        &self,
        query: &str,
        parameters: Option<&QueryParameters>,
        query_id: Option<&str>,
    ) -> Result<Bytes> {
        self.get_query(query, parameters, query_id)
            .await?
            .read_all()
            .await
    }

    /// Stream one JSON record per line (`FORMAT JSONEachRow`)
    pub async fn stream_query_as_jsonl<T: DeserializeOwned>(
        &self,
        query: &str,
        rows: &[Value],
        parameters: Option<&QueryParameters>,
        query_id: Option<&str>,
    ) -> Result<JsonLinesDecoder<reqwest::Response, T>> {
        let response = self.post_query(query, rows, parameters, query_id).await?;
        Ok(JsonLinesDecoder::new(response.into_chunks()))
    }

    /// Stream Arrow record batches (`FORMAT ArrowStream`), decoded on the runtime
    pub async fn stream_query_as_arrow(
        &self,
        query: &str,
        rows: &[Value],
        parameters: Option<&QueryParameters>,
        query_id: Option<&str>,
    ) -> Result<ArrowStreamDecoder<reqwest::Response>> {
        let response = self.post_query(query, rows, parameters, query_id).await?;
        Ok(ArrowStreamDecoder::new(response.into_chunks()))
    }

    /// Stream Arrow record batches decoded on a blocking thread
    pub async fn stream_query_as_arrow_blocking(
        &self,
        query: &str,
        rows: &[Value],
        parameters: Option<&QueryParameters>,
        query_id: Option<&str>,
    ) -> Result<BlockingArrowStream> {
        let response = self.post_query(query, rows, parameters, query_id).await?;
        Ok(BlockingArrowStream::spawn(response.into_chunks()))
    }

    /// Decode Arrow record batches into `queue` until the response is exhausted.
    ///
    /// Returns the number of batches produced.
    pub async fn produce_query_as_arrow_record_batches(
        &self,
        query: &str,
        rows: &[Value],
        parameters: Option<&QueryParameters>,
        query_id: Option<&str>,
        queue: &BatchSender,
    ) -> Result<u64> {
        let mut decoder = self
            .stream_query_as_arrow(query, rows, parameters, query_id)
            .await?;
        produce(&mut decoder, queue).await
    }

    /// Send the query, then produce its batches into `queue` from a background task
    pub async fn spawn_query_producer(
        &self,
        query: &str,
        rows: &[Value],
        parameters: Option<&QueryParameters>,
        query_id: Option<&str>,
        queue: BatchSender,
    ) -> Result<JoinHandle<Result<u64>>> {
        let decoder = self
            .stream_query_as_arrow(query, rows, parameters, query_id)
            .await?;
        Ok(spawn_producer(decoder, queue))
    }
}

fn encode_rows(rows: &[Value]) -> Bytes {
    let mut body = Vec::new();
    for (i, row) in rows.iter().enumerate() {
        if i > 0 {
            body.push(b',');
        }
        body.extend_from_slice(&row.encode());
    }
    Bytes::from(body)
}

async fn check_response(response: reqwest::Response, query: &str) -> Result<QueryResponse> {
    let status = response.status();
    if status != StatusCode::OK {
        let message = response.text().await?;
        warn!(status = status.as_u16(), "ClickHouse query failed");
        return Err(FerruleError::from_response(query, message));
    }
    Ok(QueryResponse { response })
}

/// An open session. Dereferences to the client; dropping it closes the session.
pub struct SessionGuard<'a> {
    client: &'a mut ClickHouseClient,
}

impl Deref for SessionGuard<'_> {
    type Target = ClickHouseClient;

    fn deref(&self) -> &ClickHouseClient {
        &*self.client
    }
}

impl DerefMut for SessionGuard<'_> {
    fn deref_mut(&mut self) -> &mut ClickHouseClient {
        &mut *self.client
    }
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        self.client.close();
    }
}
