//! Concurrent upload orchestration.
//!
//! Every selected file becomes an [`UploadTask`] and starts uploading at once
//! on its own tokio task. The task list lives behind a `std::sync::Mutex`;
//! critical sections never span an `.await`, because the progress callback
//! takes the same lock from inside the body stream's `poll_next`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::task::{FileRef, NoPreview, PreviewProvider, TaskId, TaskStatus, UploadTask};
use super::transport::{ProgressFn, UploadTransport};
use super::ClientError;
use crate::describe::{DescribeError, ImageDescriber};

#[derive(Default)]
struct TaskTable {
    /// Tasks in selection order.
    tasks: Vec<UploadTask>,
    tokens: HashMap<TaskId, CancellationToken>,
    handles: HashMap<TaskId, JoinHandle<()>>,
}

impl TaskTable {
    fn get_mut(&mut self, id: TaskId) -> Option<&mut UploadTask> {
        self.tasks.iter_mut().find(|t| t.id == id)
    }

    fn get(&self, id: TaskId) -> Option<&UploadTask> {
        self.tasks.iter().find(|t| t.id == id)
    }
}

struct Inner {
    transport: Arc<dyn UploadTransport>,
    bucket: String,
    table: Mutex<TaskTable>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, TaskTable> {
        self.table.lock().expect("task table mutex poisoned")
    }

    /// Apply `f` to a task if it still exists.
    fn update<R>(&self, id: TaskId, f: impl FnOnce(&mut UploadTask) -> R) -> Option<R> {
        self.lock().get_mut(id).map(f)
    }
}

/// Owns the task list and drives each upload.
///
/// Cheap to clone; clones share the same task list.
#[derive(Clone)]
pub struct UploadOrchestrator {
    inner: Arc<Inner>,
    describer: Option<Arc<dyn ImageDescriber>>,
    previews: Arc<dyn PreviewProvider>,
}

impl UploadOrchestrator {
    pub fn new(transport: Arc<dyn UploadTransport>, bucket: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                bucket: bucket.into(),
                table: Mutex::new(TaskTable::default()),
            }),
            describer: None,
            previews: Arc::new(NoPreview),
        }
    }

    pub fn with_describer(mut self, describer: Option<Arc<dyn ImageDescriber>>) -> Self {
        self.describer = describer;
        self
    }

    pub fn with_previews(mut self, previews: Arc<dyn PreviewProvider>) -> Self {
        self.previews = previews;
        self
    }

    pub fn bucket(&self) -> &str {
        &self.inner.bucket
    }

    /// Create one task per file and start all of them.
    pub fn select_files(&self, files: Vec<FileRef>) -> Vec<TaskId> {
        let created: Vec<UploadTask> = files
            .into_iter()
            .map(|file| {
                let preview = self.previews.open(&file);
                UploadTask::new(file, preview)
            })
            .collect();
        let ids: Vec<TaskId> = created.iter().map(|t| t.id).collect();
        self.inner.lock().tasks.extend(created);

        for id in &ids {
            self.start(*id);
        }
        info!("Selected {} file(s) for upload to {}", ids.len(), self.inner.bucket);
        ids
    }

    /// Start a pending task. Any other state is left alone and returned.
    pub fn start(&self, id: TaskId) -> Option<TaskStatus> {
        let mut table = self.inner.lock();
        let task = table.get_mut(id)?;
        if !task.begin() {
            debug!("Task {} already {}", id, task.status);
            return Some(task.status);
        }
        let file = task.file.clone();

        let token = CancellationToken::new();
        let handle = tokio::spawn(run_upload(
            self.inner.clone(),
            id,
            file,
            token.clone(),
        ));
        table.tokens.insert(id, token);
        table.handles.insert(id, handle);
        Some(TaskStatus::Uploading)
    }

    /// Abort an in-flight upload. Returns true if the task changed state.
    pub fn cancel(&self, id: TaskId) -> bool {
        let mut table = self.inner.lock();
        if let Some(token) = table.tokens.get(&id) {
            token.cancel();
        }
        let cancelled = table.get_mut(id).map(UploadTask::cancel).unwrap_or(false);
        if cancelled {
            info!("Upload {} cancelled", id);
        }
        cancelled
    }

    /// Cancel, release the preview and forget a task.
    pub fn remove(&self, id: TaskId) -> bool {
        let removed = {
            let mut table = self.inner.lock();
            if let Some(token) = table.tokens.remove(&id) {
                token.cancel();
            }
            table.handles.remove(&id);
            let index = table.tasks.iter().position(|t| t.id == id);
            index.map(|i| table.tasks.remove(i))
        };
        match removed {
            Some(task) => {
                if let Some(preview) = task.preview {
                    self.previews.release(preview);
                }
                true
            }
            None => false,
        }
    }

    /// Remove every task.
    pub fn clear(&self) {
        let drained = {
            let mut table = self.inner.lock();
            for (_, token) in table.tokens.drain() {
                token.cancel();
            }
            table.handles.clear();
            std::mem::take(&mut table.tasks)
        };
        for preview in drained.into_iter().filter_map(|t| t.preview) {
            self.previews.release(preview);
        }
    }

    pub fn task(&self, id: TaskId) -> Option<UploadTask> {
        self.inner.lock().get(id).cloned()
    }

    /// Copy of every task, in selection order.
    pub fn snapshot(&self) -> Vec<UploadTask> {
        self.inner.lock().tasks.clone()
    }

    /// Wait until every started upload has finished.
    pub async fn wait(&self) {
        loop {
            let handles: Vec<JoinHandle<()>> = {
                let mut table = self.inner.lock();
                table.handles.drain().map(|(_, h)| h).collect()
            };
            if handles.is_empty() {
                return;
            }
            for handle in handles {
                if let Err(e) = handle.await {
                    warn!("Upload worker ended abnormally: {}", e);
                }
            }
        }
    }

    /// Ask the describer for a description of a task's file.
    ///
    /// Ignored while a description for the same task is in flight. Failures
    /// land in `description_error` and never affect the upload state.
    pub async fn describe(&self, id: TaskId) -> Option<UploadTask> {
        let file = {
            let mut table = self.inner.lock();
            let task = table.get_mut(id)?;
            if task.analyzing {
                return Some(task.clone());
            }
            if self.describer.is_none() {
                task.description_error = Some(DescribeError::NotConfigured.to_string());
                return Some(task.clone());
            }
            task.analyzing = true;
            task.description_error = None;
            task.file.clone()
        };

        let result = match &self.describer {
            Some(describer) => describer.describe(&file).await,
            None => Err(DescribeError::NotConfigured),
        };

        let mut table = self.inner.lock();
        let task = table.get_mut(id)?;
        task.analyzing = false;
        match result {
            Ok(text) => task.description = Some(text),
            Err(e) => {
                warn!("Description of {} failed: {}", task.file.name, e);
                task.description_error = Some(e.to_string());
            }
        }
        Some(task.clone())
    }
}

async fn run_upload(inner: Arc<Inner>, id: TaskId, file: FileRef, token: CancellationToken) {
    let progress_inner = inner.clone();
    let on_progress: ProgressFn = Arc::new(move |sent, total| {
        if total > 0 {
            let percent = sent as f64 / total as f64 * 100.0;
            progress_inner.update(id, |t| t.advance(percent));
        }
    });

    let result = tokio::select! {
        result = inner.transport.upload(&file, &inner.bucket, on_progress) => result,
        _ = token.cancelled() => Err(ClientError::Cancelled),
    };

    // Settle the task and drop its bookkeeping under one lock, so a task in
    // a terminal state never has a token or handle left behind.
    let mut table = inner.lock();
    table.tokens.remove(&id);
    table.handles.remove(&id);
    let Some(task) = table.get_mut(id) else {
        debug!("Task {} removed before its upload finished", id);
        return;
    };
    match result {
        Ok(public_url) => {
            if task.complete(public_url.clone()) {
                info!("Uploaded {} -> {}", file.name, public_url);
            } else {
                debug!("Dropping late result for task {}", id);
            }
        }
        Err(ClientError::Cancelled) => {
            task.cancel();
        }
        Err(e) => {
            warn!("Upload of {} failed: {}", file.name, e);
            task.fail(e.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::task::PreviewHandle;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;

    /// Reports progress in quarters, then answers with a scripted result.
    struct FakeTransport {
        calls: AtomicUsize,
        gate: Option<Arc<Notify>>,
        fail_with: Option<fn() -> ClientError>,
    }

    impl FakeTransport {
        fn ok() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                gate: None,
                fail_with: None,
            }
        }

        fn gated(gate: Arc<Notify>) -> Self {
            Self {
                gate: Some(gate),
                ..Self::ok()
            }
        }

        fn failing(f: fn() -> ClientError) -> Self {
            Self {
                fail_with: Some(f),
                ..Self::ok()
            }
        }
    }

    impl UploadTransport for FakeTransport {
        fn upload<'a>(
            &'a self,
            file: &'a FileRef,
            bucket: &'a str,
            on_progress: ProgressFn,
        ) -> Pin<Box<dyn Future<Output = Result<String, ClientError>> + Send + 'a>> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                let total = file.size();
                for quarter in 1..=4u64 {
                    on_progress(total * quarter / 4, total);
                    // A stale callback must not pull progress back.
                    on_progress(total / 8, total);
                }
                if let Some(gate) = &self.gate {
                    gate.notified().await;
                }
                match self.fail_with {
                    Some(f) => Err(f()),
                    None => Ok(format!(
                        "https://storage.googleapis.com/{bucket}/{}",
                        file.name
                    )),
                }
            })
        }
    }

    #[derive(Default)]
    struct RecordingPreviews {
        released: Mutex<Vec<PreviewHandle>>,
    }

    impl PreviewProvider for RecordingPreviews {
        fn open(&self, file: &FileRef) -> Option<PreviewHandle> {
            Some(PreviewHandle(format!("preview:{}", file.name)))
        }

        fn release(&self, handle: PreviewHandle) {
            self.released.lock().unwrap().push(handle);
        }
    }

    struct FixedDescriber(Result<&'static str, ()>);

    impl ImageDescriber for FixedDescriber {
        fn describe<'a>(
            &'a self,
            _file: &'a FileRef,
        ) -> Pin<Box<dyn Future<Output = Result<String, DescribeError>> + Send + 'a>> {
            Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                self.0
                    .map(str::to_string)
                    .map_err(|_| DescribeError::Failed)
            })
        }
    }

    fn file(name: &str) -> FileRef {
        FileRef::new(name, "image/png", vec![1u8; 1024])
    }

    #[tokio::test]
    async fn test_all_files_upload_concurrently() {
        let transport = Arc::new(FakeTransport::ok());
        let orchestrator = UploadOrchestrator::new(transport.clone(), "assets");
        let ids = orchestrator.select_files(vec![file("a.png"), file("b.png"), file("c.png")]);
        orchestrator.wait().await;

        assert_eq!(transport.calls.load(Ordering::SeqCst), 3);
        let tasks = orchestrator.snapshot();
        assert_eq!(tasks.iter().map(|t| t.id).collect::<Vec<_>>(), ids);
        for task in tasks {
            assert_eq!(task.status, TaskStatus::Completed);
            assert_eq!(task.progress, 100.0);
            assert_eq!(
                task.public_url.as_deref(),
                Some(format!("https://storage.googleapis.com/assets/{}", task.file.name).as_str())
            );
            assert!(task.error.is_none());
        }
    }

    #[tokio::test]
    async fn test_finished_workers_leave_no_bookkeeping() {
        let orchestrator = UploadOrchestrator::new(Arc::new(FakeTransport::ok()), "assets");
        orchestrator.select_files(vec![file("a.png"), file("b.png")]);

        // No wait(): a long-lived caller only ever polls snapshots.
        tokio::time::timeout(Duration::from_secs(5), async {
            while !orchestrator
                .snapshot()
                .iter()
                .all(|t| t.status.is_terminal())
            {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let table = orchestrator.inner.lock();
        assert!(table.handles.is_empty());
        assert!(table.tokens.is_empty());
    }

    #[tokio::test]
    async fn test_failure_sets_error_message() {
        let transport = Arc::new(FakeTransport::failing(|| {
            ClientError::server_reported(500, "Bucket name not configured.")
        }));
        let orchestrator = UploadOrchestrator::new(transport, "assets");
        let ids = orchestrator.select_files(vec![file("a.png")]);
        orchestrator.wait().await;

        let task = orchestrator.task(ids[0]).unwrap();
        assert_eq!(task.status, TaskStatus::Error);
        assert_eq!(
            task.error.as_deref(),
            Some("Server Error (500): Bucket name not configured.")
        );
        assert!(task.public_url.is_none());
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let transport = Arc::new(FakeTransport::ok());
        let orchestrator = UploadOrchestrator::new(transport.clone(), "assets");
        let ids = orchestrator.select_files(vec![file("a.png")]);

        let status = orchestrator.start(ids[0]);
        assert!(matches!(
            status,
            Some(TaskStatus::Uploading) | Some(TaskStatus::Completed)
        ));
        orchestrator.wait().await;
        assert_eq!(orchestrator.start(ids[0]), Some(TaskStatus::Completed));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
        assert_eq!(orchestrator.start(TaskId::new()), None);
    }

    #[tokio::test]
    async fn test_cancel_wins_over_late_result() {
        let gate = Arc::new(Notify::new());
        let transport = Arc::new(FakeTransport::gated(gate.clone()));
        let orchestrator = UploadOrchestrator::new(transport, "assets");
        let ids = orchestrator.select_files(vec![file("a.png")]);

        // Let the worker reach the gate.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(orchestrator.cancel(ids[0]));
        gate.notify_waiters();
        orchestrator.wait().await;

        let task = orchestrator.task(ids[0]).unwrap();
        assert_eq!(task.status, TaskStatus::Cancelled);
        assert!(task.public_url.is_none());
        assert!(!orchestrator.cancel(ids[0]));
    }

    #[tokio::test]
    async fn test_remove_and_clear_release_previews() {
        let gate = Arc::new(Notify::new());
        let previews = Arc::new(RecordingPreviews::default());
        let orchestrator = UploadOrchestrator::new(Arc::new(FakeTransport::gated(gate)), "assets")
            .with_previews(previews.clone());
        let ids = orchestrator.select_files(vec![file("a.png"), file("b.png"), file("c.png")]);
        assert_eq!(
            orchestrator.task(ids[0]).unwrap().preview,
            Some(PreviewHandle("preview:a.png".to_string()))
        );

        assert!(orchestrator.remove(ids[0]));
        assert!(!orchestrator.remove(ids[0]));
        assert!(orchestrator.task(ids[0]).is_none());
        assert_eq!(orchestrator.snapshot().len(), 2);

        orchestrator.clear();
        assert!(orchestrator.snapshot().is_empty());
        orchestrator.wait().await;

        let released = previews.released.lock().unwrap().clone();
        assert_eq!(released.len(), 3);
        assert_eq!(released[0], PreviewHandle("preview:a.png".to_string()));
    }

    #[tokio::test]
    async fn test_describe_without_describer() {
        let orchestrator = UploadOrchestrator::new(Arc::new(FakeTransport::ok()), "assets");
        let ids = orchestrator.select_files(vec![file("a.png")]);
        orchestrator.wait().await;

        let task = orchestrator.describe(ids[0]).await.unwrap();
        assert_eq!(task.description_error.as_deref(), Some("API Key not configured"));
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(task.error.is_none());
    }

    #[tokio::test]
    async fn test_describe_records_result_and_ignores_duplicates() {
        let describer: Arc<dyn ImageDescriber> = Arc::new(FixedDescriber(Ok("A red square.")));
        let orchestrator = UploadOrchestrator::new(Arc::new(FakeTransport::ok()), "assets")
            .with_describer(Some(describer));
        let ids = orchestrator.select_files(vec![file("a.png")]);
        orchestrator.wait().await;

        let (first, second) = tokio::join!(orchestrator.describe(ids[0]), async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            orchestrator.describe(ids[0]).await
        });
        let second = second.unwrap();
        assert!(second.analyzing);
        assert!(second.description.is_none());

        let first = first.unwrap();
        assert!(!first.analyzing);
        assert_eq!(first.description.as_deref(), Some("A red square."));
    }

    #[tokio::test]
    async fn test_describe_failure_leaves_upload_state() {
        let describer: Arc<dyn ImageDescriber> = Arc::new(FixedDescriber(Err(())));
        let orchestrator = UploadOrchestrator::new(Arc::new(FakeTransport::ok()), "assets")
            .with_describer(Some(describer));
        let ids = orchestrator.select_files(vec![file("a.png")]);
        orchestrator.wait().await;

        let task = orchestrator.describe(ids[0]).await.unwrap();
        assert_eq!(
            task.description_error.as_deref(),
            Some("Failed to analyze image with Gemini.")
        );
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(task.error.is_none());
    }

    #[tokio::test]
    async fn test_end_to_end_against_server() {
        use crate::auth::CredentialProvider;
        use crate::client::transport::HttpTransport;
        use crate::config::{ClientConfig, Config, CredentialsConfig};
        use crate::storage::memory::MemoryWriter;
        use crate::test_support::spawn_server;
        use crate::AppState;

        let writer = Arc::new(MemoryWriter::new());
        let mut config = Config::default();
        config.credentials = CredentialsConfig {
            access_token: Some("ya29.test".to_string()),
            ..CredentialsConfig::default()
        };
        let credentials = CredentialProvider::from_config(&config.credentials).unwrap();
        let state = Arc::new(AppState {
            config,
            credentials: Arc::new(credentials),
            writer: writer.clone(),
        });
        let base = spawn_server(crate::server::app(state)).await;

        let client_config = ClientConfig {
            chunk_size: 256,
            ..ClientConfig::default()
        };
        let transport = Arc::new(HttpTransport::new(&base, &client_config).unwrap());
        let orchestrator = UploadOrchestrator::new(transport, "assets");
        let ids = orchestrator.select_files(vec![
            FileRef::new("photo one.jpg", "image/jpeg", vec![9u8; 4096]),
            FileRef::new("empty.txt", "text/plain", Vec::new()),
        ]);
        orchestrator.wait().await;

        let photo = orchestrator.task(ids[0]).unwrap();
        assert_eq!(photo.status, TaskStatus::Completed, "{:?}", photo.error);
        assert_eq!(
            photo.public_url.as_deref(),
            Some("https://storage.googleapis.com/assets/photo%20one.jpg")
        );
        let stored = writer.get("assets", "photo one.jpg").await.unwrap();
        assert_eq!(stored.data.len(), 4096);
        assert_eq!(stored.content_type, "image/jpeg");

        let empty = orchestrator.task(ids[1]).unwrap();
        assert_eq!(empty.status, TaskStatus::Completed, "{:?}", empty.error);
        assert_eq!(empty.progress, 100.0);
    }

    #[tokio::test]
    async fn test_timeout_is_recorded_on_task() {
        use crate::client::transport::HttpTransport;
        use crate::config::ClientConfig;
        use crate::test_support::spawn_server;
        use axum::routing::post;

        let router = axum::Router::new().route(
            "/upload",
            post(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                "too late"
            }),
        );
        let base = spawn_server(router).await;
        let client_config = ClientConfig {
            timeout_secs: 1,
            ..ClientConfig::default()
        };
        let transport = Arc::new(HttpTransport::new(&base, &client_config).unwrap());
        let orchestrator = UploadOrchestrator::new(transport, "assets");
        let ids = orchestrator.select_files(vec![file("slow.png")]);
        orchestrator.wait().await;

        let task = orchestrator.task(ids[0]).unwrap();
        assert_eq!(task.status, TaskStatus::Error);
        assert_eq!(task.error.as_deref(), Some("Request timed out."));
        assert!(task.public_url.is_none());
    }
}
