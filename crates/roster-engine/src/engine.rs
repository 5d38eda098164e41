use crate::attendance::{
    AttendanceError, AttendanceService, EnrollError, EnrollRequest, FaceOutcome, IdentityUpdate,
};
use crate::cache::IdentityCache;
use crate::config::Config;
use roster_core::{Detection, FaceDetect, FaceDetector, FaceEmbed, FaceRecognizer};
use roster_store::{AttendanceStore, Identity, StoreError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Attendance(#[from] AttendanceError),
    #[error(transparent)]
    Enroll(#[from] EnrollError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

type Reply<T, E> = oneshot::Sender<Result<T, E>>;

/// Messages sent from async callers to the engine thread.
enum EngineRequest {
    ProcessFrame {
        frame: Vec<u8>,
        reply: Reply<Vec<FaceOutcome>, AttendanceError>,
    },
    Detect {
        frame: Vec<u8>,
        reply: Reply<Vec<Detection>, AttendanceError>,
    },
    Enroll {
        request: EnrollRequest,
        reply: Reply<Identity, EnrollError>,
    },
    UpdateIdentity {
        id: i64,
        update: IdentityUpdate,
        reply: Reply<Identity, StoreError>,
    },
    DeleteIdentity {
        id: i64,
        reply: Reply<bool, StoreError>,
    },
    RefreshCache {
        reply: Reply<usize, StoreError>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    in_flight: Arc<AtomicBool>,
    cache: Arc<IdentityCache>,
}

/// Clears the in-flight flag unless the frame reached the engine thread,
/// which then owns clearing it.
struct InFlightGuard<'a> {
    flag: &'a AtomicBool,
    armed: bool,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.flag.store(false, Ordering::Release);
        }
    }
}

impl EngineHandle {
    /// Run the attendance pipeline on a frame, unless another frame is still
    /// being processed. Returns `Ok(None)` when the frame was dropped.
    pub async fn try_process_frame(
        &self,
        frame: Vec<u8>,
    ) -> Result<Option<Vec<FaceOutcome>>, EngineError> {
        if self.in_flight.swap(true, Ordering::AcqRel) {
            tracing::debug!("frame dropped: pipeline busy");
            return Ok(None);
        }
        let mut guard = InFlightGuard {
            flag: &self.in_flight,
            armed: true,
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::ProcessFrame {
                frame,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        guard.armed = false;

        let outcomes = reply_rx.await.map_err(|_| EngineError::ChannelClosed)??;
        Ok(Some(outcomes))
    }

    /// Whether a frame is currently being processed.
    pub fn is_busy(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Detect faces without matching; used while waiting for a still face.
    pub async fn detect(&self, frame: Vec<u8>) -> Result<Vec<Detection>, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.request(EngineRequest::Detect { frame, reply }, rx).await
    }

    pub async fn enroll(&self, request: EnrollRequest) -> Result<Identity, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.request(EngineRequest::Enroll { request, reply }, rx).await
    }

    pub async fn update_identity(
        &self,
        id: i64,
        update: IdentityUpdate,
    ) -> Result<Identity, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.request(EngineRequest::UpdateIdentity { id, update, reply }, rx)
            .await
    }

    pub async fn delete_identity(&self, id: i64) -> Result<bool, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.request(EngineRequest::DeleteIdentity { id, reply }, rx).await
    }

    pub async fn refresh_cache(&self) -> Result<usize, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.request(EngineRequest::RefreshCache { reply }, rx).await
    }

    /// Current identity list, read from the shared cache without a round trip.
    pub fn identities(&self) -> Arc<Vec<Identity>> {
        self.cache.snapshot()
    }

    async fn request<T, E>(
        &self,
        request: EngineRequest,
        reply_rx: oneshot::Receiver<Result<T, E>>,
    ) -> Result<T, EngineError>
    where
        EngineError: From<E>,
    {
        self.tx
            .send(request)
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        Ok(reply_rx.await.map_err(|_| EngineError::ChannelClosed)??)
    }
}

/// Load the detector and recognizer named by `config`.
///
/// Each model is optional: a missing or broken file is logged and the
/// capability it backs reports itself unavailable.
pub fn load_models(config: &Config) -> (Option<FaceDetector>, Option<FaceRecognizer>) {
    let detector_path = config.detector_model_path();
    let detector = match FaceDetector::load(&detector_path) {
        Ok(detector) => {
            tracing::info!(path = %detector_path.display(), "SCRFD detector loaded");
            Some(detector)
        }
        Err(e) => {
            tracing::warn!(error = %e, "face detection disabled");
            None
        }
    };

    let recognizer_path = config.recognizer_model_path();
    let recognizer = match FaceRecognizer::load(&recognizer_path) {
        Ok(recognizer) => {
            tracing::info!(path = %recognizer_path.display(), "ArcFace recognizer loaded");
            Some(recognizer)
        }
        Err(e) => {
            tracing::warn!(error = %e, "face recognition disabled");
            None
        }
    };

    (detector, recognizer)
}

/// Move the service onto a dedicated OS thread and return a handle to it.
///
/// Requests are served one at a time, so at most one frame is ever in the
/// pipeline.
pub fn spawn_engine<D, E, S>(
    mut service: AttendanceService<D, E, S>,
) -> Result<EngineHandle, EngineError>
where
    D: FaceDetect + Send + 'static,
    E: FaceEmbed + Send + 'static,
    S: AttendanceStore + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);
    let in_flight = Arc::new(AtomicBool::new(false));
    let cache = service.cache();

    let worker_flag = Arc::clone(&in_flight);
    std::thread::Builder::new()
        .name("roster-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::ProcessFrame { frame, reply } => {
                        let result = service.process_frame(&frame);
                        worker_flag.store(false, Ordering::Release);
                        let _ = reply.send(result);
                    }
                    EngineRequest::Detect { frame, reply } => {
                        let _ = reply.send(service.detect(&frame));
                    }
                    EngineRequest::Enroll { request, reply } => {
                        let _ = reply.send(service.enroll(request));
                    }
                    EngineRequest::UpdateIdentity { id, update, reply } => {
                        let _ = reply.send(service.update_identity(id, update));
                    }
                    EngineRequest::DeleteIdentity { id, reply } => {
                        let _ = reply.send(service.delete_identity(id));
                    }
                    EngineRequest::RefreshCache { reply } => {
                        let _ = reply.send(service.refresh_cache());
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle {
        tx,
        in_flight,
        cache,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attendance::tests::{face_at, frame_bytes, FakeDetector, FakeEmbedder};
    use crate::attendance::Policy;
    use image::RgbImage;
    use roster_core::{DetectorError, Embedding};
    use roster_store::{Cohort, SqliteStore};
    use std::time::Duration;

    /// Blocks every detection until the test lets it through.
    struct GatedDetector {
        gate: std::sync::mpsc::Receiver<()>,
        inner: FakeDetector,
    }

    impl FaceDetect for GatedDetector {
        fn detect(&mut self, image: &RgbImage) -> Result<Vec<Detection>, DetectorError> {
            let _ = self.gate.recv();
            self.inner.detect(image)
        }
    }

    fn enrolling_service() -> AttendanceService<FakeDetector, FakeEmbedder, SqliteStore> {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut detector = FakeDetector::default();
        detector.faces.push(face_at(10.0, 0.9));
        let mut embedder = FakeEmbedder::default();
        embedder.by_x.insert(10, Embedding::normalized(vec![1.0, 0.0]));
        AttendanceService::new(detector, embedder, store, Policy::default()).unwrap()
    }

    #[tokio::test]
    async fn test_enroll_update_delete_through_handle() {
        let handle = spawn_engine(enrolling_service()).unwrap();

        let identity = handle
            .enroll(EnrollRequest {
                name: "Ada".into(),
                external_id: "S001".into(),
                cohort: Cohort::default(),
                image: frame_bytes(),
            })
            .await
            .unwrap();
        assert_eq!(handle.identities().len(), 1);

        let updated = handle
            .update_identity(
                identity.id,
                IdentityUpdate {
                    name: Some("Ada L.".into()),
                    ..IdentityUpdate::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.name, "Ada L.");
        assert_eq!(handle.identities()[0].name, "Ada L.");

        assert_eq!(handle.detect(frame_bytes()).await.unwrap().len(), 1);
        assert!(handle.delete_identity(identity.id).await.unwrap());
        assert!(handle.identities().is_empty());
        assert_eq!(handle.refresh_cache().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_enroll_rejection_is_surfaced() {
        let handle = spawn_engine(enrolling_service()).unwrap();
        let result = handle
            .enroll(EnrollRequest {
                name: "Ada".into(),
                external_id: "S001".into(),
                cohort: Cohort::default(),
                image: b"not an image".to_vec(),
            })
            .await;
        assert!(matches!(result, Err(EngineError::Enroll(EnrollError::InvalidImage(_)))));
    }

    #[tokio::test]
    async fn test_frame_dropped_while_one_is_in_flight() {
        let (open_gate, gate) = std::sync::mpsc::channel();
        let detector = GatedDetector {
            gate,
            inner: FakeDetector::default(),
        };
        let store = SqliteStore::open_in_memory().unwrap();
        let service =
            AttendanceService::new(detector, FakeEmbedder::default(), store, Policy::default())
                .unwrap();
        let handle = spawn_engine(service).unwrap();

        let first = tokio::spawn({
            let handle = handle.clone();
            async move { handle.try_process_frame(frame_bytes()).await }
        });
        while !handle.is_busy() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        let dropped = handle.try_process_frame(frame_bytes()).await.unwrap();
        assert!(dropped.is_none());

        open_gate.send(()).unwrap();
        let processed = first.await.unwrap().unwrap();
        assert!(processed.is_some_and(|outcomes| outcomes.is_empty()));
        assert!(!handle.is_busy());

        open_gate.send(()).unwrap();
        let again = handle.try_process_frame(frame_bytes()).await.unwrap();
        assert!(again.is_some());
    }
}
