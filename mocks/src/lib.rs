//! In-memory stand-ins for the backend, the transform service and the
//! session, used by the tests of every other crate.

use api_client::{
    ApiClientError, Filter, ImageSource, Query, RemoteDataStore, RemoteObjectStore, Row,
    StyleParameters, TransformApi,
};
use async_trait::async_trait;
use auth::AuthContext;
use bytes::Bytes;
use chrono::{SecondsFormat, Utc};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Mutex, RwLock};
use std::time::Duration;

fn text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn compare(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(x), Some(y)) => text(x).cmp(&text(y)),
        (Some(_), None) => Ordering::Greater,
        (None, Some(_)) => Ordering::Less,
        (None, None) => Ordering::Equal,
    }
}

fn matches(row: &Row, filters: &[Filter]) -> bool {
    filters.iter().all(|f| {
        row.get(&f.column)
            .map(|v| text(v) == f.value_text())
            .unwrap_or(false)
    })
}

/// Relational store backed by a map of tables.
#[derive(Default)]
pub struct FakeDataStore {
    tables: Mutex<HashMap<String, Vec<Row>>>,
    calls: Mutex<Vec<(String, String)>>,
    table_failures: Mutex<HashMap<(String, String), ApiClientError>>,
    filter_failures: Mutex<Vec<(String, String, String, ApiClientError)>>,
    query_delay: Mutex<Option<Duration>>,
    next_id: AtomicU64,
}

impl FakeDataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append rows to `table`. Each value must be a JSON object.
    pub fn seed(&self, table: &str, rows: Vec<Value>) {
        let mut tables = self.tables.lock().unwrap();
        let entry = tables.entry(table.to_string()).or_default();
        for row in rows {
            if let Value::Object(map) = row {
                entry.push(map);
            }
        }
    }

    /// Replace the contents of `table`.
    pub fn reset_table(&self, table: &str, rows: Vec<Value>) {
        self.tables.lock().unwrap().remove(table);
        self.seed(table, rows);
    }

    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.tables
            .lock()
            .unwrap()
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    /// Make every `op` ("query", "insert", "update", "delete", "count" or "*")
    /// on `table` fail with `err`.
    pub fn fail(&self, op: &str, table: &str, err: ApiClientError) {
        self.table_failures
            .lock()
            .unwrap()
            .insert((op.to_string(), table.to_string()), err);
    }

    /// Make reads of `table` filtered on `column == value` fail with `err`.
    pub fn fail_matching(&self, table: &str, column: &str, value: &str, err: ApiClientError) {
        self.filter_failures.lock().unwrap().push((
            table.to_string(),
            column.to_string(),
            value.to_string(),
            err,
        ));
    }

    pub fn clear_failures(&self) {
        self.table_failures.lock().unwrap().clear();
        self.filter_failures.lock().unwrap().clear();
    }

    pub fn set_query_delay(&self, delay: Option<Duration>) {
        *self.query_delay.lock().unwrap() = delay;
    }

    pub fn call_count(&self, op: &str, table: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(o, t)| o == op && t == table)
            .count()
    }

    fn record(&self, op: &str, table: &str, filters: &[Filter]) -> Result<(), ApiClientError> {
        self.calls
            .lock()
            .unwrap()
            .push((op.to_string(), table.to_string()));
        let failures = self.table_failures.lock().unwrap();
        for key in [(op, table), ("*", table)] {
            if let Some(err) = failures.get(&(key.0.to_string(), key.1.to_string())) {
                return Err(err.clone());
            }
        }
        drop(failures);
        if op == "query" || op == "count" {
            let filter_failures = self.filter_failures.lock().unwrap();
            for (t, column, value, err) in filter_failures.iter() {
                if t == table
                    && filters
                        .iter()
                        .any(|f| &f.column == column && &f.value_text() == value)
                {
                    return Err(err.clone());
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteDataStore for FakeDataStore {
    async fn query(&self, table: &str, query: &Query) -> Result<Vec<Row>, ApiClientError> {
        self.record("query", table, &query.filters)?;
        let delay = *self.query_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut rows: Vec<Row> = self
            .rows(table)
            .into_iter()
            .filter(|r| matches(r, &query.filters))
            .collect();
        if let Some(order) = &query.order {
            rows.sort_by(|a, b| {
                let ord = compare(a.get(&order.column), b.get(&order.column));
                if order.descending {
                    ord.reverse()
                } else {
                    ord
                }
            });
        }
        let offset = query.offset.unwrap_or(0);
        let limit = query.limit.unwrap_or(usize::MAX);
        Ok(rows.into_iter().skip(offset).take(limit).collect())
    }

    async fn insert(&self, table: &str, mut row: Row) -> Result<Row, ApiClientError> {
        self.record("insert", table, &[])?;
        if !row.contains_key("id") {
            let n = self.next_id.fetch_add(1, AtomicOrdering::SeqCst) + 1;
            row.insert("id".into(), Value::String(format!("{}-{}", table, n)));
        }
        if !row.contains_key("created_at") {
            row.insert(
                "created_at".into(),
                Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)),
            );
        }
        self.tables
            .lock()
            .unwrap()
            .entry(table.to_string())
            .or_default()
            .push(row.clone());
        Ok(row)
    }

    async fn update(&self, table: &str, filters: &[Filter], patch: Row) -> Result<Row, ApiClientError> {
        self.record("update", table, filters)?;
        let mut tables = self.tables.lock().unwrap();
        let rows = tables.entry(table.to_string()).or_default();
        let mut updated = None;
        for row in rows.iter_mut().filter(|r| matches(r, filters)) {
            for (k, v) in &patch {
                row.insert(k.clone(), v.clone());
            }
            updated.get_or_insert_with(|| row.clone());
        }
        updated.ok_or(ApiClientError::NotFound)
    }

    async fn delete(&self, table: &str, filters: &[Filter]) -> Result<(), ApiClientError> {
        self.record("delete", table, filters)?;
        let mut tables = self.tables.lock().unwrap();
        if let Some(rows) = tables.get_mut(table) {
            rows.retain(|r| !matches(r, filters));
        }
        Ok(())
    }

    async fn count(&self, table: &str, filters: &[Filter]) -> Result<u64, ApiClientError> {
        self.record("count", table, filters)?;
        Ok(self
            .rows(table)
            .iter()
            .filter(|r| matches(r, filters))
            .count() as u64)
    }
}

/// Object storage that hands out a different signed URL on every request.
#[derive(Default)]
pub struct FakeObjectStore {
    objects: Mutex<HashMap<String, (Bytes, String)>>,
    signed: AtomicUsize,
    fail_signing: AtomicBool,
    fail_upload: AtomicBool,
}

impl FakeObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signed_url_count(&self) -> usize {
        self.signed.load(AtomicOrdering::SeqCst)
    }

    pub fn object(&self, bucket: &str, path: &str) -> Option<(Bytes, String)> {
        self.objects
            .lock()
            .unwrap()
            .get(&format!("{}/{}", bucket, path))
            .cloned()
    }

    pub fn set_fail_signing(&self, fail: bool) {
        self.fail_signing.store(fail, AtomicOrdering::SeqCst);
    }

    pub fn set_fail_upload(&self, fail: bool) {
        self.fail_upload.store(fail, AtomicOrdering::SeqCst);
    }
}

#[async_trait]
impl RemoteObjectStore for FakeObjectStore {
    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        bytes: Bytes,
        content_type: &str,
    ) -> Result<(), ApiClientError> {
        if self.fail_upload.load(AtomicOrdering::SeqCst) {
            return Err(ApiClientError::RequestError("upload refused".into()));
        }
        self.objects.lock().unwrap().insert(
            format!("{}/{}", bucket, path),
            (bytes, content_type.to_string()),
        );
        Ok(())
    }

    async fn signed_url(
        &self,
        bucket: &str,
        path: &str,
        expiry_secs: u64,
    ) -> Result<String, ApiClientError> {
        if self.fail_signing.load(AtomicOrdering::SeqCst) {
            return Err(ApiClientError::RequestError("signing unavailable".into()));
        }
        let n = self.signed.fetch_add(1, AtomicOrdering::SeqCst) + 1;
        Ok(format!(
            "https://fake.storage/sign/{}/{}?expires={}&token={}",
            bucket, path, expiry_secs, n
        ))
    }

    fn public_url(&self, bucket: &str, path: &str) -> String {
        format!("https://fake.storage/public/{}/{}", bucket, path)
    }

    async fn remove(&self, bucket: &str, paths: &[String]) -> Result<(), ApiClientError> {
        let mut objects = self.objects.lock().unwrap();
        for path in paths {
            objects.remove(&format!("{}/{}", bucket, path));
        }
        Ok(())
    }
}

pub struct FakeTransformApi {
    outcome: Mutex<Result<String, ApiClientError>>,
    submissions: AtomicUsize,
    delay: Mutex<Option<Duration>>,
}

impl FakeTransformApi {
    pub fn succeeding(result_url: &str) -> Self {
        FakeTransformApi {
            outcome: Mutex::new(Ok(result_url.to_string())),
            submissions: AtomicUsize::new(0),
            delay: Mutex::new(None),
        }
    }

    pub fn failing(err: ApiClientError) -> Self {
        FakeTransformApi {
            outcome: Mutex::new(Err(err)),
            submissions: AtomicUsize::new(0),
            delay: Mutex::new(None),
        }
    }

    pub fn set_outcome(&self, outcome: Result<String, ApiClientError>) {
        *self.outcome.lock().unwrap() = outcome;
    }

    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn submissions(&self) -> usize {
        self.submissions.load(AtomicOrdering::SeqCst)
    }
}

#[async_trait]
impl TransformApi for FakeTransformApi {
    async fn submit(&self, _image: Bytes, _style: &StyleParameters) -> Result<String, ApiClientError> {
        self.submissions.fetch_add(1, AtomicOrdering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.outcome.lock().unwrap().clone()
    }
}

/// Serves registered URLs; anything else is `NotFound`.
#[derive(Default)]
pub struct FakeImageSource {
    images: Mutex<HashMap<String, Bytes>>,
    fetches: AtomicUsize,
    delay: Mutex<Option<Duration>>,
}

impl FakeImageSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, url: &str, bytes: &'static [u8]) {
        self.images
            .lock()
            .unwrap()
            .insert(url.to_string(), Bytes::from_static(bytes));
    }

    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(AtomicOrdering::SeqCst)
    }
}

#[async_trait]
impl ImageSource for FakeImageSource {
    async fn fetch(&self, url: &str) -> Result<Bytes, ApiClientError> {
        self.fetches.fetch_add(1, AtomicOrdering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.images
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or(ApiClientError::NotFound)
    }
}

/// Fixed identity that tests can switch at will.
#[derive(Default)]
pub struct StaticAuth {
    user: RwLock<Option<String>>,
}

impl StaticAuth {
    pub fn signed_in(user_id: &str) -> Self {
        StaticAuth {
            user: RwLock::new(Some(user_id.to_string())),
        }
    }

    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn set_user(&self, user_id: Option<&str>) {
        *self.user.write().unwrap() = user_id.map(str::to_string);
    }
}

impl AuthContext for StaticAuth {
    fn current_user_id(&self) -> Option<String> {
        self.user.read().unwrap().clone()
    }

    fn access_token(&self) -> Option<String> {
        self.current_user_id().map(|u| format!("token-{}", u))
    }
}
