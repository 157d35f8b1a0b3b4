use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

/// The database the monitoring collector writes filesystem job stats into.
pub const METRICS_DATABASE_NAME: &str = "esmon_database";

#[derive(Error, Debug)]
pub enum QueryError {
    #[error("Metrics request failed: {0}")]
    TransportError(#[from] reqwest::Error),
    #[error("Metrics server returned status [{0}]")]
    StatusError(reqwest::StatusCode),
    #[error("Malformed metrics response: {0}")]
    MalformedBody(String),
    #[error("Metrics response has [{actual}] columns, expected at least [{expected}]")]
    MissingColumn { expected: usize, actual: usize },
}

/// One tabular query result: column names plus positional row values. An
/// empty result (the store had no matching series) has no columns and no
/// values.
#[derive(Debug, Clone, Default)]
pub struct Rows {
    pub columns: Vec<String>,
    pub values: Vec<Vec<serde_json::Value>>,
}

impl Rows {
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Columns are consumed positionally; reject results narrower than the
    /// query contract before indexing into them.
    pub fn require_columns(&self, expected: usize) -> Result<(), QueryError> {
        if !self.values.is_empty() && self.columns.len() < expected {
            return Err(QueryError::MissingColumn {
                expected,
                actual: self.columns.len(),
            });
        }
        Ok(())
    }
}

#[async_trait]
pub trait MetricsSource: Send + Sync {
    async fn query(&self, query: &str) -> Result<Rows, QueryError>;
}

pub fn throughput_query(fsname: &str, start_seconds: u64) -> String {
    format!(
        "SELECT ost_index,job_id,value FROM ost_jobstats_bytes \
         WHERE fs_name = '{}' AND \
         (optype = 'sum_write_bytes' OR optype = 'sum_read_bytes') \
         AND value > 0 AND time > {}s",
        fsname, start_seconds
    )
}

pub fn metadata_query(fsname: &str, start_seconds: u64) -> String {
    format!(
        "SELECT job_id,sum FROM \"cqm_mdt_jobstats_samples-fs_name-job_id\" \
         WHERE fs_name = '{}' AND sum > 0 AND time > {}s",
        fsname, start_seconds
    )
}

// The wire format of a query response: a list of per-statement results, each
// carrying zero or more series. No "series" key means no data matched.
#[derive(Debug, Deserialize)]
struct QueryResponse {
    results: Vec<StatementResult>,
}

#[derive(Debug, Deserialize)]
struct StatementResult {
    #[serde(default)]
    series: Option<Vec<Series>>,
}

#[derive(Debug, Deserialize)]
struct Series {
    columns: Vec<String>,
    values: Vec<Vec<serde_json::Value>>,
}

/// A read-only client for the time-series HTTP endpoint. Holds a reusable
/// connection pool and is safe to share between controllers.
#[derive(Debug)]
pub struct InfluxdbClient {
    query_url: String,
    database: String,
    client: reqwest::Client,
    log: slog::Logger,
}

impl InfluxdbClient {
    pub fn new(
        hostname: &str,
        database: &str,
        timeout: std::time::Duration,
        log: slog::Logger,
    ) -> Result<InfluxdbClient, QueryError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(InfluxdbClient {
            query_url: format!("http://{}:8086/query", hostname),
            database: database.to_owned(),
            client,
            log,
        })
    }

    fn parse_body(body: QueryResponse) -> Result<Rows, QueryError> {
        let result = body
            .results
            .into_iter()
            .next()
            .ok_or_else(|| QueryError::MalformedBody("empty results list".to_owned()))?;

        let series = match result.series {
            // No matching series is a valid empty result, not an error.
            None => return Ok(Rows::default()),
            Some(series) => series,
        };
        let serie = match series.into_iter().next() {
            None => return Ok(Rows::default()),
            Some(serie) => serie,
        };

        Ok(Rows {
            columns: serie.columns,
            values: serie.values,
        })
    }
}

#[async_trait]
impl MetricsSource for InfluxdbClient {
    async fn query(&self, query: &str) -> Result<Rows, QueryError> {
        slog::debug!(self.log, "querying metrics store"; "query" => query);
        let response = self
            .client
            .get(&self.query_url)
            .query(&[
                ("db", self.database.as_str()),
                ("q", query),
                ("epoch", "s"),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(QueryError::StatusError(response.status()));
        }

        let body: QueryResponse = response
            .json()
            .await
            .map_err(|e| QueryError::MalformedBody(e.to_string()))?;
        Self::parse_body(body)
    }
}
