//! Best-effort delivery of exported documents
//!
//! The exporter races the configured sink against a timeout and falls back to
//! a local save whenever delivery does not succeed. Nothing here returns an
//! error to the caller: every outcome is captured in a [`DeliveryReport`].

use crate::config::TrackerConfig;
use crate::error::ExportError;
use crate::export::{export_filename, ExportDocument};
use crate::types::SessionRecord;
use chrono::{DateTime, Utc};
use log::{error, info, warn};
use std::fs;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::time::Duration;

/// Future returned by a [`TransportSink`]; resolves to the remote location, if
/// the sink reports one.
pub type DeliveryFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Option<String>, ExportError>> + Send + 'a>>;

/// Receives one serialized document per session.
pub trait TransportSink {
    fn deliver<'a>(&'a self, filename: &'a str, body: &'a str) -> DeliveryFuture<'a>;

    fn describe(&self) -> String {
        "sink".to_string()
    }
}

/// Writes bytes somewhere the operator can find them.
pub trait LocalSave {
    /// Returns where the document was written
    fn save(&self, filename: &str, body: &[u8]) -> Result<String, ExportError>;
}

/// Saves documents as files in a directory, creating it on first use.
#[derive(Debug, Clone)]
pub struct DirectorySave {
    dir: PathBuf,
}

impl DirectorySave {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl LocalSave for DirectorySave {
    fn save(&self, filename: &str, body: &[u8]) -> Result<String, ExportError> {
        fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(filename);
        fs::write(&path, body)?;
        Ok(path.display().to_string())
    }
}

/// Uploads documents with `POST {endpoint}?filename=...`.
///
/// A successful response may carry `{ "url": ... }` naming the stored blob.
#[cfg(feature = "http")]
pub struct HttpSink {
    client: reqwest::Client,
    endpoint: String,
}

#[cfg(feature = "http")]
impl HttpSink {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
        }
    }

    async fn upload(&self, filename: &str, body: &str) -> Result<Option<String>, ExportError> {
        let response = self
            .client
            .post(&self.endpoint)
            .query(&[("filename", filename)])
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body.to_string())
            .send()
            .await
            .map_err(|e| ExportError::Transport(e.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ExportError::Transport(e.to_string()))?;

        if !status.is_success() {
            return Err(ExportError::Rejected {
                status: status.as_u16(),
                message: text,
            });
        }

        let url = serde_json::from_str::<serde_json::Value>(&text)
            .ok()
            .and_then(|v| v.get("url").and_then(|u| u.as_str()).map(str::to_string));
        Ok(url)
    }
}

#[cfg(feature = "http")]
impl TransportSink for HttpSink {
    fn deliver<'a>(&'a self, filename: &'a str, body: &'a str) -> DeliveryFuture<'a> {
        Box::pin(self.upload(filename, body))
    }

    fn describe(&self) -> String {
        self.endpoint.clone()
    }
}

/// How the remote attempt ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteOutcome {
    Delivered { location: Option<String> },
    Failed { reason: String },
    TimedOut,
    NoSink,
    /// The document could not be serialized; nothing was sent or saved
    NotEncoded { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    pub filename: String,
    pub remote: RemoteOutcome,
    /// Where the local copy landed, if one was written
    pub local_copy: Option<String>,
    pub local_error: Option<String>,
}

impl DeliveryReport {
    pub fn delivered(&self) -> bool {
        matches!(self.remote, RemoteOutcome::Delivered { .. })
    }

    /// True when the document reached at least one destination
    pub fn persisted(&self) -> bool {
        self.delivered() || self.local_copy.is_some()
    }
}

pub struct Exporter {
    sink: Option<Box<dyn TransportSink>>,
    local: Option<Box<dyn LocalSave>>,
    timeout: Duration,
    always_save_locally: bool,
}

impl Default for Exporter {
    fn default() -> Self {
        Self::from_config(&TrackerConfig::default())
    }
}

impl Exporter {
    pub fn from_config(config: &TrackerConfig) -> Self {
        Self {
            sink: None,
            local: None,
            timeout: config.export_timeout(),
            always_save_locally: config.always_save_locally,
        }
    }

    pub fn with_sink(mut self, sink: Box<dyn TransportSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_local_save(mut self, local: Box<dyn LocalSave>) -> Self {
        self.local = Some(local);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Deliver a finished record. Must run inside a tokio runtime with the
    /// time driver enabled.
    pub async fn export(&self, record: &SessionRecord, at: DateTime<Utc>) -> DeliveryReport {
        let filename = export_filename(record, &at);

        let body = match ExportDocument::from_record(record).to_json() {
            Ok(body) => body,
            Err(e) => {
                error!("Failed to encode session {}: {}", record.session_id, e);
                return DeliveryReport {
                    filename,
                    remote: RemoteOutcome::NotEncoded {
                        reason: e.to_string(),
                    },
                    local_copy: None,
                    local_error: None,
                };
            }
        };

        let remote = self.send(&filename, &body).await;
        let delivered = matches!(remote, RemoteOutcome::Delivered { .. });

        let mut report = DeliveryReport {
            filename,
            remote,
            local_copy: None,
            local_error: None,
        };

        if !delivered || self.always_save_locally {
            self.save_locally(&mut report, body.as_bytes());
        }

        if !report.persisted() {
            error!(
                "Session {} was neither delivered nor saved locally",
                record.session_id
            );
        }
        report
    }

    async fn send(&self, filename: &str, body: &str) -> RemoteOutcome {
        let sink = match &self.sink {
            Some(sink) => sink,
            None => return RemoteOutcome::NoSink,
        };

        match tokio::time::timeout(self.timeout, sink.deliver(filename, body)).await {
            Ok(Ok(location)) => {
                info!("Delivered {} to {}", filename, sink.describe());
                RemoteOutcome::Delivered { location }
            }
            Ok(Err(e)) => {
                warn!("Delivery of {} failed: {}", filename, e);
                RemoteOutcome::Failed {
                    reason: e.to_string(),
                }
            }
            Err(_) => {
                let e = ExportError::Timeout(self.timeout.as_millis() as u64);
                warn!("Delivery of {} abandoned: {}", filename, e);
                RemoteOutcome::TimedOut
            }
        }
    }

    fn save_locally(&self, report: &mut DeliveryReport, body: &[u8]) {
        let local = match &self.local {
            Some(local) => local,
            None => return,
        };
        match local.save(&report.filename, body) {
            Ok(location) => {
                info!("Saved local copy at {}", location);
                report.local_copy = Some(location);
            }
            Err(e) => {
                error!("Local save of {} failed: {}", report.filename, e);
                report.local_error = Some(e.to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::{Arc, Mutex};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()
    }

    fn record() -> SessionRecord {
        SessionRecord {
            session_id: "sess-1".to_string(),
            run_key: "1".to_string(),
            participant_id: None,
            sequence: 1,
            started_at: t0(),
            ended_at: Some(t0()),
            pages: Vec::new(),
        }
    }

    struct OkSink;

    impl TransportSink for OkSink {
        fn deliver<'a>(&'a self, filename: &'a str, _body: &'a str) -> DeliveryFuture<'a> {
            Box::pin(async move {
                Ok::<_, ExportError>(Some(format!("https://blob.example/{}", filename)))
            })
        }
    }

    struct FailingSink;

    impl TransportSink for FailingSink {
        fn deliver<'a>(&'a self, _filename: &'a str, _body: &'a str) -> DeliveryFuture<'a> {
            Box::pin(async {
                Err::<Option<String>, _>(ExportError::Rejected {
                    status: 500,
                    message: "Failed to upload file".to_string(),
                })
            })
        }
    }

    struct HangingSink;

    impl TransportSink for HangingSink {
        fn deliver<'a>(&'a self, _filename: &'a str, _body: &'a str) -> DeliveryFuture<'a> {
            Box::pin(std::future::pending::<Result<Option<String>, ExportError>>())
        }
    }

    #[derive(Clone, Default)]
    struct MemorySave {
        saved: Arc<Mutex<Vec<(String, Vec<u8>)>>>,
    }

    impl LocalSave for MemorySave {
        fn save(&self, filename: &str, body: &[u8]) -> Result<String, ExportError> {
            self.saved
                .lock()
                .unwrap()
                .push((filename.to_string(), body.to_vec()));
            Ok(format!("memory://{}", filename))
        }
    }

    fn exporter(sink: Box<dyn TransportSink>, local: &MemorySave, always: bool) -> Exporter {
        Exporter::from_config(&TrackerConfig::default().with_always_save_locally(always))
            .with_sink(sink)
            .with_local_save(Box::new(local.clone()))
            .with_timeout(Duration::from_millis(50))
    }

    #[tokio::test]
    async fn test_success_without_backup() {
        let local = MemorySave::default();
        let report = exporter(Box::new(OkSink), &local, false)
            .export(&record(), t0())
            .await;
        assert!(report.delivered());
        assert!(report.local_copy.is_none());
        assert!(local.saved.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_success_with_backup_copy() {
        let local = MemorySave::default();
        let report = exporter(Box::new(OkSink), &local, true)
            .export(&record(), t0())
            .await;
        assert!(report.delivered());
        assert_eq!(local.saved.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failure_falls_back_to_local() {
        let local = MemorySave::default();
        let report = exporter(Box::new(FailingSink), &local, false)
            .export(&record(), t0())
            .await;

        assert!(matches!(report.remote, RemoteOutcome::Failed { .. }));
        assert!(report.persisted());
        let saved = local.saved.lock().unwrap();
        let doc: serde_json::Value = serde_json::from_slice(&saved[0].1).unwrap();
        assert_eq!(doc["sessionId"], "sess-1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_sink_times_out() {
        let local = MemorySave::default();
        let report = exporter(Box::new(HangingSink), &local, false)
            .export(&record(), t0())
            .await;
        assert_eq!(report.remote, RemoteOutcome::TimedOut);
        assert_eq!(report.local_copy, Some(format!("memory://{}", report.filename)));
    }

    #[tokio::test]
    async fn test_no_sink_saves_locally() {
        let local = MemorySave::default();
        let report = Exporter::default()
            .with_local_save(Box::new(local.clone()))
            .export(&record(), t0())
            .await;
        assert_eq!(report.remote, RemoteOutcome::NoSink);
        assert!(report.local_copy.is_some());
    }

    #[test]
    fn test_directory_save_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let save = DirectorySave::new(dir.path().join("exports"));
        let location = save.save("doc.json", b"{}").unwrap();
        assert_eq!(std::fs::read_to_string(location).unwrap(), "{}");
    }
}
