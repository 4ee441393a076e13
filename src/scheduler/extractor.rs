//! Sources a scheduler pulls from. Every extractor returns the documents whose
//! time falls in `[start, end)` as newline-delimited JSON, oldest first.

use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use serde_json::{json, Value};

use crate::error::{poison_err, EngineError, Result};
use crate::ingest::TimeParser;
use crate::job::types::{DataSource, Job};

#[async_trait]
pub trait DataExtractor: Send + Sync {
    /// Documents with a time in `[start, end)`. An empty body means no data.
    async fn extract(&self, start: i64, end: i64) -> Result<Bytes>;
}

/// Builds the extractor for a scheduled job.
pub trait ExtractorFactory: Send + Sync {
    fn create(&self, job: &Job) -> Result<Arc<dyn DataExtractor>>;
}

impl<F> ExtractorFactory for F
where
    F: Fn(&Job) -> Result<Arc<dyn DataExtractor>> + Send + Sync,
{
    fn create(&self, job: &Job) -> Result<Arc<dyn DataExtractor>> {
        self(job)
    }
}

/// Picks the extractor named by the job's `dataSource`.
#[derive(Debug, Clone, Default)]
pub struct SourceExtractorFactory {
    http: reqwest::Client,
}

impl SourceExtractorFactory {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }
}

impl ExtractorFactory for SourceExtractorFactory {
    fn create(&self, job: &Job) -> Result<Arc<dyn DataExtractor>> {
        let Some(config) = &job.scheduler_config else {
            return Err(EngineError::NoSuchScheduledJob {
                job_id: job.id.clone(),
            });
        };
        let time = TimeField::new(job);
        match config.data_source {
            DataSource::File => {
                let path = config
                    .file_path
                    .clone()
                    .ok_or_else(|| EngineError::invalid_value("A FILE scheduler requires filePath"))?;
                Ok(Arc::new(FileExtractor::new(
                    path,
                    time,
                    config.tail_file.unwrap_or(false),
                )))
            }
            DataSource::Elasticsearch => {
                let base_url = config.base_url.clone().ok_or_else(|| {
                    EngineError::invalid_value("An ELASTICSEARCH scheduler requires baseUrl")
                })?;
                Ok(Arc::new(ElasticsearchExtractor {
                    http: self.http.clone(),
                    base_url: base_url.trim_end_matches('/').to_string(),
                    indexes: config.indexes.clone().unwrap_or_default(),
                    types: config.types.clone().unwrap_or_default(),
                    query: config.query.clone(),
                    scroll_size: config.scroll_size(),
                    time,
                }))
            }
        }
    }
}

/// How a job reads the time out of a document.
#[derive(Debug, Clone)]
pub struct TimeField {
    name: String,
    parser: TimeParser,
}

impl TimeField {
    pub fn new(job: &Job) -> Self {
        Self::named(
            &job.data_description.time_field,
            &job.data_description.time_format,
        )
    }

    pub fn named(name: &str, format: &str) -> Self {
        Self {
            name: name.to_string(),
            parser: TimeParser::new(format),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Looks up the field as a flat key first, then as a dotted path.
    pub fn read(&self, document: &Value) -> Option<i64> {
        let value = document.get(&self.name).or_else(|| {
            self.name
                .split('.')
                .try_fold(document, |node, part| node.get(part))
        })?;
        match value {
            Value::String(text) => self.parser.parse(text),
            Value::Number(number) => self.parser.parse(&number.to_string()),
            _ => None,
        }
    }
}

fn ndjson<'a>(documents: impl IntoIterator<Item = &'a Value>) -> Bytes {
    let mut body = BytesMut::new();
    for document in documents {
        body.put_slice(document.to_string().as_bytes());
        body.put_u8(b'\n');
    }
    body.freeze()
}

fn sorted_window(documents: &[(i64, Value)], start: i64, end: i64) -> Bytes {
    let from = documents.partition_point(|(time, _)| *time < start);
    let to = documents.partition_point(|(time, _)| *time < end);
    ndjson(documents[from..to.max(from)].iter().map(|(_, doc)| doc))
}

/// Serves documents held in memory. Documents may be pushed while a
/// scheduler is running.
#[derive(Debug)]
pub struct InMemoryExtractor {
    time: TimeField,
    documents: Mutex<Vec<(i64, Value)>>,
}

impl InMemoryExtractor {
    pub fn new(time: TimeField) -> Self {
        Self {
            time,
            documents: Mutex::new(Vec::new()),
        }
    }

    /// Adds documents, keeping them in time order. Documents without a
    /// readable time are dropped.
    pub fn push(&self, documents: impl IntoIterator<Item = Value>) -> Result<usize> {
        let mut held = self.documents.lock().map_err(poison_err)?;
        let mut added = 0;
        for document in documents {
            if let Some(time) = self.time.read(&document) {
                held.push((time, document));
                added += 1;
            }
        }
        held.sort_by_key(|(time, _)| *time);
        Ok(added)
    }

    pub fn len(&self) -> usize {
        self.documents.lock().map(|held| held.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl DataExtractor for InMemoryExtractor {
    async fn extract(&self, start: i64, end: i64) -> Result<Bytes> {
        let held = self.documents.lock().map_err(poison_err)?;
        Ok(sorted_window(&held, start, end))
    }
}

/// Reads an NDJSON file. The file is read once unless `tail` is set, in
/// which case it is re-read on every poll.
#[derive(Debug)]
pub struct FileExtractor {
    path: PathBuf,
    time: TimeField,
    tail: bool,
    cached: tokio::sync::Mutex<Option<Arc<Vec<(i64, Value)>>>>,
}

impl FileExtractor {
    pub fn new(path: impl Into<PathBuf>, time: TimeField, tail: bool) -> Self {
        Self {
            path: path.into(),
            time,
            tail,
            cached: tokio::sync::Mutex::new(None),
        }
    }

    async fn load(&self) -> Result<Arc<Vec<(i64, Value)>>> {
        let mut cached = self.cached.lock().await;
        if let Some(documents) = cached.as_ref() {
            if !self.tail {
                return Ok(documents.clone());
            }
        }
        let text = tokio::fs::read_to_string(&self.path).await?;
        let mut documents = Vec::new();
        let mut skipped = 0usize;
        for line in text.lines().filter(|line| !line.trim().is_empty()) {
            let parsed = serde_json::from_str::<Value>(line)
                .ok()
                .and_then(|doc| self.time.read(&doc).map(|time| (time, doc)));
            match parsed {
                Some(entry) => documents.push(entry),
                None => skipped += 1,
            }
        }
        if skipped > 0 {
            tracing::debug!(path = %self.path.display(), skipped, "skipped unreadable lines");
        }
        documents.sort_by_key(|(time, _)| *time);
        let documents = Arc::new(documents);
        *cached = Some(documents.clone());
        Ok(documents)
    }
}

#[async_trait]
impl DataExtractor for FileExtractor {
    async fn extract(&self, start: i64, end: i64) -> Result<Bytes> {
        let documents = self.load().await?;
        Ok(sorted_window(&documents, start, end))
    }
}

/// Pages through an Elasticsearch index with a range filter on the job's
/// time field, sorted by time and continued with `search_after`.
#[derive(Debug, Clone)]
pub struct ElasticsearchExtractor {
    http: reqwest::Client,
    base_url: String,
    indexes: Vec<String>,
    types: Vec<String>,
    query: Option<Value>,
    scroll_size: u32,
    time: TimeField,
}

const SEARCH_TIMEOUT: Duration = Duration::from_secs(30);

fn read_error(message: String) -> EngineError {
    EngineError::Io(io::Error::other(message))
}

impl ElasticsearchExtractor {
    fn search_url(&self) -> String {
        let mut url = format!("{}/{}", self.base_url, self.indexes.join(","));
        if !self.types.is_empty() {
            url.push('/');
            url.push_str(&self.types.join(","));
        }
        url.push_str("/_search");
        url
    }

    fn search_body(&self, start: i64, end: i64, after: Option<&Value>) -> Value {
        let field = self.time.name();
        let mut body = json!({
            "size": self.scroll_size,
            "query": {
                "bool": {
                    "must": [self.query.clone().unwrap_or_else(|| json!({ "match_all": {} }))],
                    "filter": [{
                        "range": {
                            field: { "gte": start, "lt": end, "format": "epoch_second" }
                        }
                    }]
                }
            },
            "sort": [{ field: { "order": "asc" } }, { "_doc": { "order": "asc" } }]
        });
        if let Some(after) = after {
            body["search_after"] = after.clone();
        }
        body
    }
}

#[async_trait]
impl DataExtractor for ElasticsearchExtractor {
    async fn extract(&self, start: i64, end: i64) -> Result<Bytes> {
        let url = self.search_url();
        let mut body = BytesMut::new();
        let mut after: Option<Value> = None;
        loop {
            let response = self
                .http
                .post(&url)
                .timeout(SEARCH_TIMEOUT)
                .json(&self.search_body(start, end, after.as_ref()))
                .send()
                .await
                .map_err(|err| read_error(format!("search request to {url} failed: {err}")))?;
            if !response.status().is_success() {
                let status = response.status();
                let text = response.text().await.unwrap_or_default();
                return Err(read_error(format!("search returned {status}: {text}")));
            }
            let page: Value = response
                .json()
                .await
                .map_err(|err| read_error(format!("invalid search response: {err}")))?;
            let hits = page["hits"]["hits"].as_array().cloned().unwrap_or_default();
            for hit in &hits {
                if let Some(source) = hit.get("_source") {
                    body.put_slice(source.to_string().as_bytes());
                    body.put_u8(b'\n');
                }
            }
            if hits.len() < self.scroll_size as usize {
                break;
            }
            match hits.last().and_then(|hit| hit.get("sort")) {
                Some(sort) => after = Some(sort.clone()),
                None => break,
            }
        }
        Ok(body.freeze())
    }
}
