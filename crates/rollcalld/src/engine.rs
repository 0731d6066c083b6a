use crate::config::Config;
use crate::store::SqliteStore;
use chrono::{NaiveDate, Utc};
use rollcall_core::readiness::check_model_files;
use rollcall_core::{
    AttendanceGate, Embedding, EmbeddingStore, EnrollError, EuclideanMatcher, GalleryMatcher,
    Identity, IdentityCandidate, IdentityRegistrar, Notifier, PublicIdentity, Readiness,
    ReadinessError, ReadinessState, RecordError, RecordedAttendance, ReportQuery, ReportRow, Store,
    StoreError,
};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Enroll(#[from] EnrollError),
    #[error(transparent)]
    Record(#[from] RecordError),
    #[error("storage error: {0}")]
    Store(#[from] StoreError),
    #[error("readiness check failed: {0}")]
    Readiness(#[from] ReadinessError),
    #[error("engine task exited")]
    ChannelClosed,
}

/// Snapshot returned by `Status`.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub version: &'static str,
    pub readiness: ReadinessState,
    pub identities: usize,
    pub match_threshold: f32,
    pub embedding_dim: usize,
    pub notifications: bool,
}

/// Messages sent from D-Bus handlers to the engine.
enum EngineRequest {
    Enroll {
        candidate: IdentityCandidate,
        reply: oneshot::Sender<Result<Identity, EngineError>>,
    },
    Record {
        probe: Embedding,
        session_tag: String,
        date: Option<NaiveDate>,
        reply: oneshot::Sender<Result<RecordedAttendance, EngineError>>,
    },
    ListIdentities {
        reply: oneshot::Sender<Result<Vec<PublicIdentity>, EngineError>>,
    },
    Report {
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
        group: Option<String>,
        reply: oneshot::Sender<Result<Vec<ReportRow>, EngineError>>,
    },
    Status {
        reply: oneshot::Sender<Result<EngineStatus, EngineError>>,
    },
}

/// Clone-safe handle to the engine.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    readiness: Readiness,
}

impl EngineHandle {
    async fn call<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T, EngineError>>) -> EngineRequest,
    ) -> Result<T, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    pub async fn enroll(&self, candidate: IdentityCandidate) -> Result<Identity, EngineError> {
        self.call(|reply| EngineRequest::Enroll { candidate, reply }).await
    }

    /// Mark attendance. `date` defaults to the current UTC date.
    pub async fn record(
        &self,
        probe: Embedding,
        session_tag: String,
        date: Option<NaiveDate>,
    ) -> Result<RecordedAttendance, EngineError> {
        self.call(|reply| EngineRequest::Record {
            probe,
            session_tag,
            date,
            reply,
        })
        .await
    }

    pub async fn list_identities(&self) -> Result<Vec<PublicIdentity>, EngineError> {
        self.call(|reply| EngineRequest::ListIdentities { reply }).await
    }

    /// Attendance rows between `from` and `to` inclusive. Missing bounds
    /// default to the configured window ending today.
    pub async fn report(
        &self,
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
        group: Option<String>,
    ) -> Result<Vec<ReportRow>, EngineError> {
        self.call(|reply| EngineRequest::Report {
            from,
            to,
            group,
            reply,
        })
        .await
    }

    pub async fn status(&self) -> Result<EngineStatus, EngineError> {
        self.call(|reply| EngineRequest::Status { reply }).await
    }

    /// Refuse further matching. In-flight requests finish or fail with NotReady.
    pub fn shutdown(&self) {
        self.readiness.teardown();
    }
}

struct Engine {
    store: Arc<dyn Store>,
    matcher: Arc<GalleryMatcher>,
    registrar: IdentityRegistrar,
    gate: AttendanceGate,
    match_threshold: f32,
    report_default_days: u32,
    notifications: bool,
}

impl Engine {
    fn handle(&self, req: EngineRequest) {
        match req {
            EngineRequest::Enroll { candidate, reply } => {
                let _ = reply.send(self.registrar.enroll(candidate).map_err(Into::into));
            }
            EngineRequest::Record {
                probe,
                session_tag,
                date,
                reply,
            } => {
                let date = date.unwrap_or_else(today);
                let result = self.gate.record(&probe, &session_tag, date);
                let _ = reply.send(result.map_err(Into::into));
            }
            EngineRequest::ListIdentities { reply } => {
                let result: Result<Vec<PublicIdentity>, StoreError> = self
                    .store
                    .identities()
                    .map(|ids| ids.iter().map(Identity::public).collect());
                let _ = reply.send(result.map_err(Into::into));
            }
            EngineRequest::Report {
                from,
                to,
                group,
                reply,
            } => {
                let _ = reply.send(self.report(from, to, group.as_deref()));
            }
            EngineRequest::Status { reply } => {
                let _ = reply.send(self.status());
            }
        }
    }

    fn report(
        &self,
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
        group: Option<&str>,
    ) -> Result<Vec<ReportRow>, EngineError> {
        let window = ReportQuery::last_days(today(), self.report_default_days, group);
        let query = ReportQuery::new(
            from.unwrap_or(window.from),
            to.unwrap_or(window.to),
            group,
        );
        let rows = self.store.attendance_report(&query)?;
        tracing::debug!(from = %query.from, to = %query.to, rows = rows.len(), "report");
        Ok(rows)
    }

    fn status(&self) -> Result<EngineStatus, EngineError> {
        Ok(EngineStatus {
            version: env!("CARGO_PKG_VERSION"),
            readiness: self.matcher.readiness().state(),
            identities: self.store.identity_count()?,
            match_threshold: self.match_threshold,
            embedding_dim: self.matcher.gallery().expected_dim(),
            notifications: self.notifications,
        })
    }
}

fn today() -> NaiveDate {
    Utc::now().date_naive()
}

/// Open the database named by `config` and start the engine on it.
pub fn spawn_engine(config: &Config, notifier: Arc<dyn Notifier>) -> Result<EngineHandle, EngineError> {
    let store = SqliteStore::open(&config.db_path)?;
    tracing::info!(path = %config.db_path.display(), "database opened");
    start_engine(Arc::new(store), config, notifier)
}

/// Build the matching components over `store`, run the readiness checks,
/// then enter the request loop. Fails fast if a check fails.
pub fn start_engine(
    store: Arc<dyn Store>,
    config: &Config,
    notifier: Arc<dyn Notifier>,
) -> Result<EngineHandle, EngineError> {
    let readiness = Readiness::new();
    let gallery = EmbeddingStore::new(store.clone(), config.embedding_dim);
    let matcher = Arc::new(GalleryMatcher::new(
        Box::new(EuclideanMatcher::new(config.match_threshold)),
        gallery.clone(),
        readiness.clone(),
    ));

    readiness.init(|| {
        if let Some(dir) = &config.model_dir {
            check_model_files(dir, &config.model_files)?;
            tracing::info!(dir = %dir.display(), "extractor model files present");
        }
        let entries = gallery
            .gallery()
            .map_err(|e| ReadinessError::CheckFailed(format!("loading gallery: {e}")))?;
        tracing::info!(identities = entries.len(), "gallery loaded");
        Ok(())
    })?;

    let engine = Arc::new(Engine {
        registrar: IdentityRegistrar::new(matcher.clone(), store.clone()),
        gate: AttendanceGate::new(matcher.clone(), store.clone(), notifier),
        store,
        matcher,
        match_threshold: config.match_threshold,
        report_default_days: config.report_default_days,
        notifications: config.notify_enabled,
    });

    let (tx, mut rx) = mpsc::channel::<EngineRequest>(64);
    tokio::spawn(async move {
        tracing::info!("engine started");
        while let Some(req) = rx.recv().await {
            let engine = engine.clone();
            tokio::task::spawn_blocking(move || engine.handle(req));
        }
        tracing::info!("engine exiting");
    });

    Ok(EngineHandle { tx, readiness })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollcall_core::store::InsertOutcome;
    use rollcall_core::types::{AttendanceEvent, DedupKey};
    use rollcall_core::{MemoryStore, NullNotifier};
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn face(k: usize) -> Embedding {
        let mut values = vec![0.0; 128];
        values[k] = 1.0;
        Embedding::new(values)
    }

    fn candidate(id: &str, contact: &str, k: usize) -> IdentityCandidate {
        IdentityCandidate {
            identity_id: id.into(),
            display_name: format!("Student {id}"),
            contact_address: contact.into(),
            group_tag: "CS".into(),
            embedding: face(k),
        }
    }

    fn engine() -> EngineHandle {
        start_engine(
            Arc::new(MemoryStore::new()),
            &Config::default(),
            Arc::new(NullNotifier),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_enroll_record_report_flow() {
        let engine = engine();
        engine.enroll(candidate("S1", "a@x.com", 0)).await.unwrap();
        engine.enroll(candidate("S2", "b@x.com", 1)).await.unwrap();

        let recorded = engine.record(face(1), "morning".into(), None).await.unwrap();
        assert_eq!(recorded.identity.identity_id, "S2");
        assert_eq!(recorded.event.date, today());

        let again = engine.record(face(1), "morning".into(), None).await;
        assert!(matches!(again, Err(EngineError::Record(RecordError::AlreadyMarked(_)))));

        let rows = engine.report(None, None, Some("all".into())).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].display_name, "Student S2");

        let ids = engine.list_identities().await.unwrap();
        assert_eq!(ids.len(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_face_surfaces_as_enroll_error() {
        let engine = engine();
        engine.enroll(candidate("S1", "a@x.com", 0)).await.unwrap();
        let err = engine.enroll(candidate("S2", "b@x.com", 0)).await.unwrap_err();
        assert!(matches!(err, EngineError::Enroll(EnrollError::DuplicateFace(_))));
    }

    #[tokio::test]
    async fn test_explicit_report_window() {
        let engine = engine();
        engine.enroll(candidate("S1", "a@x.com", 0)).await.unwrap();
        let past = NaiveDate::from_ymd_opt(2024, 1, 10).unwrap();
        engine.record(face(0), "morning".into(), Some(past)).await.unwrap();

        let default_window = engine.report(None, None, None).await.unwrap();
        assert!(default_window.is_empty());

        let explicit = engine
            .report(NaiveDate::from_ymd_opt(2024, 1, 1), NaiveDate::from_ymd_opt(2024, 1, 31), None)
            .await
            .unwrap();
        assert_eq!(explicit.len(), 1);
    }

    #[tokio::test]
    async fn test_status_and_shutdown() {
        let engine = engine();
        let status = engine.status().await.unwrap();
        assert_eq!(status.readiness, ReadinessState::Ready);
        assert_eq!(status.identities, 0);
        assert_eq!(status.embedding_dim, 128);

        engine.shutdown();
        let err = engine.record(face(0), "morning".into(), None).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::Record(RecordError::NotReady(ReadinessError::NotReady(ReadinessState::TornDown)))
        ));
    }

    /// Delegates to a `MemoryStore`, counting full gallery loads.
    struct CountingStore {
        inner: MemoryStore,
        gallery_loads: AtomicUsize,
    }

    impl Store for CountingStore {
        fn identity(&self, identity_id: &str) -> Result<Option<Identity>, StoreError> {
            self.inner.identity(identity_id)
        }
        fn identity_by_contact(&self, contact: &str) -> Result<Option<Identity>, StoreError> {
            self.inner.identity_by_contact(contact)
        }
        fn identities(&self) -> Result<Vec<Identity>, StoreError> {
            self.gallery_loads.fetch_add(1, Ordering::SeqCst);
            self.inner.identities()
        }
        fn identity_count(&self) -> Result<usize, StoreError> {
            self.inner.identity_count()
        }
        fn insert_identity(&self, identity: &Identity) -> Result<InsertOutcome, StoreError> {
            self.inner.insert_identity(identity)
        }
        fn attendance(&self, key: &DedupKey) -> Result<Option<AttendanceEvent>, StoreError> {
            self.inner.attendance(key)
        }
        fn insert_attendance(&self, event: &AttendanceEvent) -> Result<InsertOutcome, StoreError> {
            self.inner.insert_attendance(event)
        }
        fn attendance_report(&self, query: &ReportQuery) -> Result<Vec<ReportRow>, StoreError> {
            self.inner.attendance_report(query)
        }
    }

    #[tokio::test]
    async fn test_status_counts_without_loading_gallery() {
        let store = Arc::new(CountingStore {
            inner: MemoryStore::new(),
            gallery_loads: AtomicUsize::new(0),
        });
        let engine = start_engine(store.clone(), &Config::default(), Arc::new(NullNotifier)).unwrap();
        engine.enroll(candidate("S1", "a@x.com", 0)).await.unwrap();
        engine.enroll(candidate("S2", "b@x.com", 1)).await.unwrap();

        let loads = store.gallery_loads.load(Ordering::SeqCst);
        let status = engine.status().await.unwrap();
        assert_eq!(status.identities, 2);
        assert_eq!(store.gallery_loads.load(Ordering::SeqCst), loads);
    }

    #[tokio::test]
    async fn test_missing_model_files_fail_startup() {
        let config = Config {
            model_dir: Some(PathBuf::from("/nonexistent/rollcall-models")),
            ..Config::default()
        };
        let err = start_engine(Arc::new(MemoryStore::new()), &config, Arc::new(NullNotifier))
            .err()
            .unwrap();
        assert!(matches!(
            err,
            EngineError::Readiness(ReadinessError::MissingModelFiles { .. })
        ));
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_startup() {
        let store = Arc::new(MemoryStore::new());
        store.set_available(false);
        let err = start_engine(store, &Config::default(), Arc::new(NullNotifier))
            .err()
            .unwrap();
        assert!(matches!(err, EngineError::Readiness(ReadinessError::CheckFailed(_))));
    }
}
