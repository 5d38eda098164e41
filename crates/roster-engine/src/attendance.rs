//! Per-frame attendance policy and enrollment.
//!
//! Each detected face moves through detect, embed, match, session check and
//! day dedup. Unmatched faces and faces without an applicable session are
//! reported, never persisted. Enrollment demands a single confident face
//! that does not already resemble an enrolled identity.

use crate::cache::IdentityCache;
use crate::config::Config;
use chrono::{Local, NaiveDateTime};
use image::{DynamicImage, ImageFormat, RgbImage};
use roster_core::{
    BoundingBox, CosineMatcher, Detection, DetectorError, Embedding, FaceDetect, FaceEmbed,
    Matcher, RecognizerError,
};
use roster_store::{
    AttendanceRecord, AttendanceStatus, AttendanceStore, ClassSession, Cohort, Identity,
    NewIdentity, StoreError,
};
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum AttendanceError {
    #[error("could not decode frame: {0}")]
    InvalidImage(#[from] image::ImageError),
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
}

#[derive(Error, Debug)]
pub enum EnrollError {
    #[error("could not decode image: {0}")]
    InvalidImage(#[from] image::ImageError),
    #[error("{0} must not be empty")]
    MissingField(&'static str),
    #[error("face model unavailable")]
    ModelUnavailable,
    #[error("no face detected")]
    NoFaceDetected,
    #[error("{0} faces detected; enrollment needs exactly one")]
    MultipleFacesDetected(usize),
    #[error("face quality too low (score {0:.2})")]
    LowFaceQuality(f32),
    #[error("could not compute a face embedding: {0}")]
    EmbeddingUnavailable(String),
    #[error("face already enrolled as {name}")]
    DuplicateIdentity { name: String },
    #[error("detector error: {0}")]
    Detector(DetectorError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Thresholds the engine applies on top of the detector and matcher.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Policy {
    pub frame_min_score: f32,
    pub match_threshold: f32,
    pub duplicate_threshold: f32,
    pub enroll_min_score: f32,
}

impl Default for Policy {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for Policy {
    fn from(config: &Config) -> Self {
        Self {
            frame_min_score: config.frame_min_score,
            match_threshold: config.match_threshold,
            duplicate_threshold: config.duplicate_threshold,
            enroll_min_score: config.enroll_min_score,
        }
    }
}

/// What happened to one face in a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FaceStatus {
    #[serde(rename = "Attendance Marked")]
    AttendanceMarked,
    #[serde(rename = "Already Marked")]
    AlreadyMarked,
    #[serde(rename = "No Active Session")]
    NoActiveSession,
    #[serde(rename = "Unknown")]
    Unknown,
}

impl FaceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FaceStatus::AttendanceMarked => "Attendance Marked",
            FaceStatus::AlreadyMarked => "Already Marked",
            FaceStatus::NoActiveSession => "No Active Session",
            FaceStatus::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for FaceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FaceOutcome {
    /// The matched identity, `None` for unknown faces.
    pub identity: Option<Identity>,
    pub status: FaceStatus,
    pub already_marked: bool,
    /// Best cosine similarity against the gallery (0 with an empty gallery).
    pub confidence: f32,
    pub detection: Detection,
}

#[derive(Debug, Clone)]
pub struct EnrollRequest {
    pub name: String,
    pub external_id: String,
    pub cohort: Cohort,
    /// Encoded image bytes (JPEG, PNG, ...).
    pub image: Vec<u8>,
}

/// Editable identity fields. `None` leaves a field as it is; an empty
/// cohort string clears that attribute.
#[derive(Debug, Clone, Default)]
pub struct IdentityUpdate {
    pub name: Option<String>,
    pub external_id: Option<String>,
    pub course: Option<String>,
    pub year: Option<String>,
    pub semester: Option<String>,
    pub group: Option<String>,
}

impl IdentityUpdate {
    fn apply(self, identity: &mut Identity) {
        if let Some(name) = self.name {
            identity.name = name;
        }
        if let Some(external_id) = self.external_id {
            identity.external_id = external_id;
        }
        let cohort = &mut identity.cohort;
        for (field, value) in [
            (&mut cohort.course, self.course),
            (&mut cohort.year, self.year),
            (&mut cohort.semester, self.semester),
            (&mut cohort.group, self.group),
        ] {
            if let Some(value) = value {
                *field = if value.is_empty() { None } else { Some(value) };
            }
        }
    }
}

/// Orchestrates detection, embedding, matching and the attendance policy
/// over a store and an identity cache.
pub struct AttendanceService<D, E, S> {
    detector: D,
    embedder: E,
    store: S,
    cache: Arc<IdentityCache>,
    matcher: CosineMatcher,
    policy: Policy,
    thumbnail_dir: Option<PathBuf>,
}

impl<D, E, S> AttendanceService<D, E, S>
where
    D: FaceDetect,
    E: FaceEmbed,
    S: AttendanceStore,
{
    /// Build the service and fill the identity cache from the store.
    pub fn new(detector: D, embedder: E, store: S, policy: Policy) -> Result<Self, StoreError> {
        let cache = Arc::new(IdentityCache::new());
        let count = cache.refresh(&store)?;
        tracing::info!(identities = count, "attendance service ready");
        Ok(Self {
            detector,
            embedder,
            store,
            cache,
            matcher: CosineMatcher,
            policy,
            thumbnail_dir: None,
        })
    }

    /// Save a cropped thumbnail of every enrolled face under `dir`.
    pub fn with_thumbnail_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.thumbnail_dir = Some(dir.into());
        self
    }

    pub fn cache(&self) -> Arc<IdentityCache> {
        Arc::clone(&self.cache)
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Process one frame stamped with the local wall-clock time.
    pub fn process_frame(&mut self, frame: &[u8]) -> Result<Vec<FaceOutcome>, AttendanceError> {
        self.process_frame_at(frame, Local::now().naive_local())
    }

    /// Process one frame as if it arrived at `now`.
    pub fn process_frame_at(
        &mut self,
        frame: &[u8],
        now: NaiveDateTime,
    ) -> Result<Vec<FaceOutcome>, AttendanceError> {
        let image = decode(frame)?;

        let detections = match self.detector.detect(&image) {
            Ok(detections) => detections,
            Err(DetectorError::ModelUnavailable) => {
                tracing::debug!("detector unavailable; frame yields no faces");
                Vec::new()
            }
            Err(e) => {
                tracing::warn!(error = %e, "face detection failed; frame skipped");
                Vec::new()
            }
        };

        let gallery = self.cache.snapshot();
        let mut sessions: Option<Vec<ClassSession>> = None;
        let mut marked_this_run: HashSet<i64> = HashSet::new();
        let mut outcomes = Vec::new();

        for detection in detections {
            if detection.score < self.policy.frame_min_score {
                continue;
            }

            let embedding = match self.embedder.embed(&image, &detection) {
                Ok(embedding) if !embedding.is_empty() => embedding,
                Ok(_) => {
                    tracing::debug!(score = detection.score, "empty embedding; face skipped");
                    continue;
                }
                Err(e) => {
                    tracing::debug!(
                        error = %e,
                        score = detection.score,
                        "embedding failed; face skipped"
                    );
                    continue;
                }
            };

            let best = self
                .matcher
                .best_match(&embedding, gallery.iter().map(|identity| &identity.embedding));
            let confidence = best.map(|m| m.similarity).unwrap_or(0.0);

            let identity = match best {
                Some(m) if m.similarity > self.policy.match_threshold => gallery[m.index].clone(),
                _ => {
                    outcomes.push(FaceOutcome {
                        identity: None,
                        status: FaceStatus::Unknown,
                        already_marked: false,
                        confidence,
                        detection,
                    });
                    continue;
                }
            };

            let active = sessions.get_or_insert_with(|| load_active_sessions(&self.store));
            let Some(session) = active.iter().find(|s| s.cohort.admits(&identity.cohort)) else {
                outcomes.push(FaceOutcome {
                    identity: Some(identity),
                    status: FaceStatus::NoActiveSession,
                    already_marked: false,
                    confidence,
                    detection,
                });
                continue;
            };

            let status = if marked_this_run.contains(&identity.id) {
                FaceStatus::AlreadyMarked
            } else {
                match self.mark_once(&identity, session, now) {
                    Ok(status) => status,
                    Err(e) => {
                        tracing::warn!(
                            error = %e,
                            identity = identity.id,
                            "attendance write failed; face skipped"
                        );
                        continue;
                    }
                }
            };
            marked_this_run.insert(identity.id);

            outcomes.push(FaceOutcome {
                identity: Some(identity),
                status,
                already_marked: status == FaceStatus::AlreadyMarked,
                confidence,
                detection,
            });
        }

        tracing::debug!(faces = outcomes.len(), "frame processed");
        Ok(outcomes)
    }

    fn mark_once(
        &self,
        identity: &Identity,
        session: &ClassSession,
        now: NaiveDateTime,
    ) -> Result<FaceStatus, StoreError> {
        let date = now.date();
        if self.store.has_attendance_on(identity.id, date)? {
            return Ok(FaceStatus::AlreadyMarked);
        }

        let record = AttendanceRecord {
            identity_id: identity.id,
            session_id: session.id,
            date,
            time: now.time(),
            status: AttendanceStatus::Present,
        };
        if !self.store.mark_attendance(&record)? {
            return Ok(FaceStatus::AlreadyMarked);
        }

        tracing::info!(
            identity = identity.id,
            name = %identity.name,
            session = session.id,
            %date,
            "attendance marked"
        );
        Ok(FaceStatus::AttendanceMarked)
    }

    /// Detect faces in an encoded frame without matching them.
    pub fn detect(&mut self, frame: &[u8]) -> Result<Vec<Detection>, AttendanceError> {
        let image = decode(frame)?;
        Ok(self.detector.detect(&image)?)
    }

    /// Enroll a new identity from a single-face image.
    pub fn enroll(&mut self, request: EnrollRequest) -> Result<Identity, EnrollError> {
        if request.name.trim().is_empty() {
            return Err(EnrollError::MissingField("name"));
        }
        if request.external_id.trim().is_empty() {
            return Err(EnrollError::MissingField("external id"));
        }

        let image = decode(&request.image)?;
        let detections = self.detector.detect(&image).map_err(|e| match e {
            DetectorError::ModelUnavailable => EnrollError::ModelUnavailable,
            other => EnrollError::Detector(other),
        })?;

        let face = match detections.as_slice() {
            [] => return Err(EnrollError::NoFaceDetected),
            [face] => face,
            faces => return Err(EnrollError::MultipleFacesDetected(faces.len())),
        };
        if face.score < self.policy.enroll_min_score {
            return Err(EnrollError::LowFaceQuality(face.score));
        }

        let embedding = match self.embedder.embed(&image, face) {
            Ok(embedding) if !embedding.is_empty() => embedding,
            Ok(_) => return Err(EnrollError::EmbeddingUnavailable("empty embedding".into())),
            Err(RecognizerError::ModelUnavailable) => return Err(EnrollError::ModelUnavailable),
            Err(e) => return Err(EnrollError::EmbeddingUnavailable(e.to_string())),
        };

        if let Some(existing) = self.find_duplicate(&embedding) {
            tracing::info!(
                existing = existing.id,
                name = %existing.name,
                "enrollment rejected: duplicate face"
            );
            return Err(EnrollError::DuplicateIdentity {
                name: existing.name.clone(),
            });
        }

        let thumbnail_path = self.save_thumbnail(&image, &face.bbox);
        let stored = self.store.add_identity(&NewIdentity {
            name: request.name,
            external_id: request.external_id,
            embedding,
            thumbnail_path: thumbnail_path.clone(),
            cohort: request.cohort,
        });
        let identity = match stored {
            Ok(identity) => identity,
            Err(e) => {
                if let Some(path) = thumbnail_path {
                    remove_thumbnail(&path);
                }
                return Err(e.into());
            }
        };
        self.cache.upsert(identity.clone());

        tracing::info!(
            id = identity.id,
            name = %identity.name,
            score = face.score,
            "identity enrolled"
        );
        Ok(identity)
    }

    /// First cached identity whose similarity to `embedding` exceeds the
    /// duplicate threshold.
    fn find_duplicate(&self, embedding: &Embedding) -> Option<Identity> {
        self.cache
            .snapshot()
            .iter()
            .filter(|identity| !identity.embedding.is_empty())
            .find(|identity| {
                embedding.similarity(&identity.embedding) > self.policy.duplicate_threshold
            })
            .cloned()
    }

    fn save_thumbnail(&self, image: &RgbImage, bbox: &BoundingBox) -> Option<String> {
        let dir = self.thumbnail_dir.as_ref()?;
        let (x, y, width, height) = clamp_box(bbox, image.width(), image.height())?;
        let crop = image::imageops::crop_imm(image, x, y, width, height).to_image();

        let path = dir.join(format!("{}.jpg", Uuid::new_v4()));
        let saved = std::fs::create_dir_all(dir)
            .map_err(image::ImageError::IoError)
            .and_then(|()| {
                DynamicImage::ImageRgb8(crop).save_with_format(&path, ImageFormat::Jpeg)
            });
        match saved {
            Ok(()) => Some(path.to_string_lossy().into_owned()),
            Err(e) => {
                tracing::warn!(error = %e, path = %path.display(), "thumbnail not saved");
                None
            }
        }
    }

    /// Apply an edit to an enrolled identity. The embedding is kept.
    pub fn update_identity(
        &mut self,
        id: i64,
        update: IdentityUpdate,
    ) -> Result<Identity, StoreError> {
        let mut identity = self
            .lookup_identity(id)?
            .ok_or(StoreError::IdentityNotFound(id))?;
        update.apply(&mut identity);
        self.store.update_identity(&identity)?;
        self.cache.upsert(identity.clone());
        tracing::info!(id, name = %identity.name, "identity updated");
        Ok(identity)
    }

    /// Delete an identity with its attendance history and thumbnail.
    pub fn delete_identity(&mut self, id: i64) -> Result<bool, StoreError> {
        let existing = self.lookup_identity(id)?;
        let removed = self.store.delete_identity(id)?;
        self.cache.remove(id);

        if let Some(path) = existing.and_then(|identity| identity.thumbnail_path) {
            remove_thumbnail(&path);
        }
        if removed {
            tracing::info!(id, "identity deleted");
        }
        Ok(removed)
    }

    pub fn refresh_cache(&self) -> Result<usize, StoreError> {
        self.cache.refresh(&self.store)
    }

    /// Cached identity, or the stored row when the cache has not seen it yet.
    fn lookup_identity(&self, id: i64) -> Result<Option<Identity>, StoreError> {
        if let Some(identity) = self.cache.find(id) {
            return Ok(Some(identity));
        }
        Ok(self
            .store
            .list_identities()?
            .into_iter()
            .find(|identity| identity.id == id))
    }
}

fn remove_thumbnail(path: &str) {
    if let Err(e) = std::fs::remove_file(path) {
        tracing::warn!(error = %e, path = %path, "thumbnail not removed");
    }
}

fn decode(bytes: &[u8]) -> Result<RgbImage, image::ImageError> {
    Ok(image::load_from_memory(bytes)?.to_rgb8())
}

fn load_active_sessions<S: AttendanceStore>(store: &S) -> Vec<ClassSession> {
    store.list_active_sessions().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "could not load active sessions");
        Vec::new()
    })
}

/// Integer crop rectangle of `bbox` clipped to the image, or `None` if
/// nothing of it is inside.
fn clamp_box(bbox: &BoundingBox, width: u32, height: u32) -> Option<(u32, u32, u32, u32)> {
    let coords = [bbox.x, bbox.y, bbox.width, bbox.height];
    if !coords.iter().all(|v| v.is_finite()) {
        return None;
    }
    let x0 = bbox.x.floor().clamp(0.0, width as f32) as u32;
    let y0 = bbox.y.floor().clamp(0.0, height as f32) as u32;
    let x1 = (bbox.x + bbox.width).ceil().clamp(0.0, width as f32) as u32;
    let y1 = (bbox.y + bbox.height).ceil().clamp(0.0, height as f32) as u32;
    if x1 <= x0 || y1 <= y0 {
        return None;
    }
    Some((x0, y0, x1 - x0, y1 - y0))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::NaiveDate;
    use image::Rgb;
    use roster_store::{AttendanceEntry, SqliteStore};
    use std::collections::HashMap;
    use std::io::Cursor;

    /// Returns the same detections for every frame.
    #[derive(Default)]
    pub(crate) struct FakeDetector {
        pub faces: Vec<Detection>,
    }

    impl FaceDetect for FakeDetector {
        fn detect(&mut self, _image: &RgbImage) -> Result<Vec<Detection>, DetectorError> {
            Ok(self.faces.clone())
        }
    }

    /// Maps a detection (keyed by its box x) to a fixed embedding.
    #[derive(Default)]
    pub(crate) struct FakeEmbedder {
        pub by_x: HashMap<i64, Embedding>,
    }

    impl FaceEmbed for FakeEmbedder {
        fn embed(
            &mut self,
            _image: &RgbImage,
            face: &Detection,
        ) -> Result<Embedding, RecognizerError> {
            self.by_x
                .get(&(face.bbox.x as i64))
                .cloned()
                .ok_or_else(|| RecognizerError::InferenceFailed("no embedding for face".into()))
        }
    }

    /// Sqlite store whose inserts of new identities always fail.
    struct RejectingStore(SqliteStore);

    impl AttendanceStore for RejectingStore {
        fn list_identities(&self) -> Result<Vec<Identity>, StoreError> {
            self.0.list_identities()
        }

        fn add_identity(&self, _identity: &NewIdentity) -> Result<Identity, StoreError> {
            Err(StoreError::InvalidValue("inserts disabled".into()))
        }

        fn update_identity(&self, identity: &Identity) -> Result<(), StoreError> {
            self.0.update_identity(identity)
        }

        fn delete_identity(&self, id: i64) -> Result<bool, StoreError> {
            self.0.delete_identity(id)
        }

        fn find_identity_by_external_id(
            &self,
            external_id: &str,
        ) -> Result<Option<Identity>, StoreError> {
            self.0.find_identity_by_external_id(external_id)
        }

        fn has_attendance_on(&self, identity_id: i64, date: NaiveDate) -> Result<bool, StoreError> {
            self.0.has_attendance_on(identity_id, date)
        }

        fn mark_attendance(&self, record: &AttendanceRecord) -> Result<bool, StoreError> {
            self.0.mark_attendance(record)
        }

        fn attendance_records(
            &self,
            date: Option<NaiveDate>,
        ) -> Result<Vec<AttendanceEntry>, StoreError> {
            self.0.attendance_records(date)
        }

        fn attendance_for_identity(
            &self,
            identity_id: i64,
        ) -> Result<Vec<AttendanceEntry>, StoreError> {
            self.0.attendance_for_identity(identity_id)
        }

        fn list_active_sessions(&self) -> Result<Vec<ClassSession>, StoreError> {
            self.0.list_active_sessions()
        }

        fn start_session(&self, owner: &str, cohort: &Cohort) -> Result<ClassSession, StoreError> {
            self.0.start_session(owner, cohort)
        }

        fn end_session(&self, id: i64) -> Result<bool, StoreError> {
            self.0.end_session(id)
        }

        fn sessions_for_owner(&self, owner: &str) -> Result<Vec<ClassSession>, StoreError> {
            self.0.sessions_for_owner(owner)
        }
    }

    pub(crate) fn face_at(x: f32, score: f32) -> Detection {
        Detection {
            bbox: BoundingBox { x, y: 10.0, width: 20.0, height: 20.0 },
            landmarks: [
                (x + 5.0, 15.0),
                (x + 15.0, 15.0),
                (x + 10.0, 20.0),
                (x + 6.0, 25.0),
                (x + 14.0, 25.0),
            ],
            score,
        }
    }

    pub(crate) fn frame_bytes() -> Vec<u8> {
        let image = RgbImage::from_pixel(64, 64, Rgb([90, 120, 150]));
        let mut buf = Vec::new();
        DynamicImage::ImageRgb8(image)
            .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
            .unwrap();
        buf
    }

    /// Unit vector at `angle` radians in the plane, so similarity between
    /// two of them is the cosine of the angle between.
    fn unit(angle: f32) -> Embedding {
        Embedding::normalized(vec![angle.cos(), angle.sin(), 0.0])
    }

    fn angle_for(similarity: f32) -> f32 {
        similarity.acos()
    }

    fn cohort(course: Option<&str>) -> Cohort {
        Cohort {
            course: course.map(str::to_string),
            ..Cohort::default()
        }
    }

    type TestService = AttendanceService<FakeDetector, FakeEmbedder, SqliteStore>;

    fn service() -> TestService {
        let store = SqliteStore::open_in_memory().unwrap();
        AttendanceService::new(
            FakeDetector::default(),
            FakeEmbedder::default(),
            store,
            Policy::default(),
        )
        .unwrap()
    }

    /// Enroll an identity directly through the store and cache.
    fn seed(
        service: &TestService,
        name: &str,
        embedding: Embedding,
        course: Option<&str>,
    ) -> Identity {
        let identity = service
            .store()
            .add_identity(&NewIdentity {
                name: name.into(),
                external_id: format!("ID-{name}"),
                embedding,
                thumbnail_path: None,
                cohort: cohort(course),
            })
            .unwrap();
        service.cache().upsert(identity.clone());
        identity
    }

    fn request(name: &str) -> EnrollRequest {
        EnrollRequest {
            name: name.into(),
            external_id: format!("ID-{name}"),
            cohort: Cohort::default(),
            image: frame_bytes(),
        }
    }

    fn at(day: u32, hour: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 3, day)
            .unwrap()
            .and_hms_opt(hour, 0, 0)
            .unwrap()
    }

    fn show(service: &mut TestService, faces: Vec<(Detection, Embedding)>) {
        service.detector.faces = faces.iter().map(|(d, _)| d.clone()).collect();
        service.embedder.by_x = faces
            .into_iter()
            .map(|(d, e)| (d.bbox.x as i64, e))
            .collect();
    }

    // --- Enrollment ---

    #[test]
    fn test_enroll_single_clean_face() {
        let mut service = service();
        show(&mut service, vec![(face_at(10.0, 0.8), unit(0.0))]);

        let identity = service.enroll(request("Ada")).unwrap();
        assert_eq!(identity.name, "Ada");
        assert_eq!(service.cache().len(), 1);
        assert_eq!(service.store().list_identities().unwrap().len(), 1);
    }

    #[test]
    fn test_enroll_rejects_no_face() {
        let mut service = service();
        assert!(matches!(service.enroll(request("Ada")), Err(EnrollError::NoFaceDetected)));
    }

    #[test]
    fn test_enroll_rejects_two_faces() {
        let mut service = service();
        show(
            &mut service,
            vec![(face_at(0.0, 0.9), unit(0.0)), (face_at(30.0, 0.9), unit(1.0))],
        );
        assert!(matches!(
            service.enroll(request("Ada")),
            Err(EnrollError::MultipleFacesDetected(2))
        ));
    }

    #[test]
    fn test_enroll_rejects_low_quality_face() {
        let mut service = service();
        show(&mut service, vec![(face_at(10.0, 0.4), unit(0.0))]);
        match service.enroll(request("Ada")) {
            Err(EnrollError::LowFaceQuality(score)) => assert!((score - 0.4).abs() < 1e-6),
            other => panic!("expected LowFaceQuality, got {other:?}"),
        }
        assert!(service.cache().is_empty());
    }

    #[test]
    fn test_enroll_rejects_duplicate_face() {
        let mut service = service();
        seed(&service, "Ada", unit(0.0), None);
        show(&mut service, vec![(face_at(10.0, 0.9), unit(angle_for(0.9)))]);

        match service.enroll(request("Ada again")) {
            Err(EnrollError::DuplicateIdentity { name }) => assert_eq!(name, "Ada"),
            other => panic!("expected DuplicateIdentity, got {other:?}"),
        }
        assert_eq!(service.cache().len(), 1);
    }

    #[test]
    fn test_enroll_accepts_dissimilar_face() {
        let mut service = service();
        seed(&service, "Ada", unit(0.0), None);
        show(&mut service, vec![(face_at(10.0, 0.9), unit(angle_for(0.1)))]);

        let identity = service.enroll(request("Bob")).unwrap();
        assert_eq!(identity.name, "Bob");
        assert_eq!(service.cache().len(), 2);
    }

    #[test]
    fn test_enroll_without_models() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut service = AttendanceService::new(
            None::<FakeDetector>,
            None::<FakeEmbedder>,
            store,
            Policy::default(),
        )
        .unwrap();
        assert!(matches!(
            service.enroll(request("Ada")),
            Err(EnrollError::ModelUnavailable)
        ));
    }

    #[test]
    fn test_enroll_rejects_bad_image_and_blank_name() {
        let mut service = service();
        let mut bad = request("Ada");
        bad.image = b"not an image".to_vec();
        assert!(matches!(service.enroll(bad), Err(EnrollError::InvalidImage(_))));
        assert!(matches!(
            service.enroll(request(" ")),
            Err(EnrollError::MissingField("name"))
        ));
    }

    #[test]
    fn test_enroll_writes_thumbnail() {
        let dir = tempfile::tempdir().unwrap();
        let mut service = service().with_thumbnail_dir(dir.path().join("img"));
        show(&mut service, vec![(face_at(10.0, 0.8), unit(0.0))]);

        let identity = service.enroll(request("Ada")).unwrap();
        let path = identity.thumbnail_path.expect("thumbnail path");
        let thumb = image::open(&path).unwrap();
        assert_eq!((thumb.width(), thumb.height()), (20, 20));

        assert!(service.delete_identity(identity.id).unwrap());
        assert!(!std::path::Path::new(&path).exists());
    }

    #[test]
    fn test_failed_insert_removes_thumbnail() {
        let dir = tempfile::tempdir().unwrap();
        let thumbs = dir.path().join("img");
        let store = RejectingStore(SqliteStore::open_in_memory().unwrap());
        let mut service = AttendanceService::new(
            FakeDetector::default(),
            FakeEmbedder::default(),
            store,
            Policy::default(),
        )
        .unwrap()
        .with_thumbnail_dir(thumbs.clone());
        service.detector.faces = vec![face_at(10.0, 0.8)];
        service.embedder.by_x = HashMap::from([(10, unit(0.0))]);

        assert!(matches!(
            service.enroll(request("Ada")),
            Err(EnrollError::Store(StoreError::InvalidValue(_)))
        ));
        assert!(service.cache().is_empty());
        let left: Vec<_> = std::fs::read_dir(&thumbs).unwrap().collect();
        assert!(left.is_empty());
    }

    #[test]
    fn test_delete_removes_thumbnail_of_uncached_identity() {
        let dir = tempfile::tempdir().unwrap();
        let thumb = dir.path().join("elsewhere.jpg");
        std::fs::write(&thumb, b"jpeg").unwrap();

        let mut service = service();
        let identity = service
            .store()
            .add_identity(&NewIdentity {
                name: "Added elsewhere".into(),
                external_id: "X1".into(),
                embedding: unit(0.0),
                thumbnail_path: Some(thumb.to_string_lossy().into_owned()),
                cohort: Cohort::default(),
            })
            .unwrap();
        assert!(service.cache().find(identity.id).is_none());

        assert!(service.delete_identity(identity.id).unwrap());
        assert!(!thumb.exists());
        assert!(service.store().list_identities().unwrap().is_empty());
    }

    #[test]
    fn test_clamp_box() {
        let inside = BoundingBox { x: 10.2, y: 5.0, width: 20.0, height: 10.0 };
        assert_eq!(clamp_box(&inside, 64, 64), Some((10, 5, 21, 10)));

        let spilling = BoundingBox { x: -5.0, y: 50.0, width: 20.0, height: 30.0 };
        assert_eq!(clamp_box(&spilling, 64, 64), Some((0, 50, 15, 14)));

        let outside = BoundingBox { x: 100.0, y: 0.0, width: 10.0, height: 10.0 };
        assert_eq!(clamp_box(&outside, 64, 64), None);
    }

    // --- Per-frame attendance ---

    #[test]
    fn test_marks_once_per_day_within_session() {
        let mut service = service();
        let ada = seed(&service, "Ada", unit(0.0), Some("CS"));
        service.store().start_session("prof", &cohort(Some("CS"))).unwrap();
        show(&mut service, vec![(face_at(10.0, 0.9), unit(0.1))]);

        let first = service.process_frame_at(&frame_bytes(), at(3, 9)).unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].status, FaceStatus::AttendanceMarked);
        assert_eq!(first[0].identity.as_ref().map(|i| i.id), Some(ada.id));
        assert!(!first[0].already_marked);

        let second = service.process_frame_at(&frame_bytes(), at(3, 10)).unwrap();
        assert_eq!(second[0].status, FaceStatus::AlreadyMarked);
        assert!(second[0].already_marked);

        assert_eq!(service.store().attendance_records(None).unwrap().len(), 1);
    }

    #[test]
    fn test_second_session_same_day_does_not_mark_again() {
        let mut service = service();
        seed(&service, "Ada", unit(0.0), Some("CS"));
        let morning = service.store().start_session("prof", &cohort(Some("CS"))).unwrap();
        show(&mut service, vec![(face_at(10.0, 0.9), unit(0.0))]);

        service.process_frame_at(&frame_bytes(), at(3, 9)).unwrap();
        service.store().end_session(morning.id).unwrap();
        service.store().start_session("other", &Cohort::default()).unwrap();

        let later = service.process_frame_at(&frame_bytes(), at(3, 14)).unwrap();
        assert_eq!(later[0].status, FaceStatus::AlreadyMarked);
        assert_eq!(service.store().attendance_records(None).unwrap().len(), 1);

        let next_day = service.process_frame_at(&frame_bytes(), at(4, 9)).unwrap();
        assert_eq!(next_day[0].status, FaceStatus::AttendanceMarked);
    }

    #[test]
    fn test_unmatched_face_is_reported_not_persisted() {
        let mut service = service();
        seed(&service, "Ada", unit(0.0), None);
        service.store().start_session("prof", &Cohort::default()).unwrap();
        show(&mut service, vec![(face_at(10.0, 0.9), unit(angle_for(0.1)))]);

        let outcomes = service.process_frame_at(&frame_bytes(), at(3, 9)).unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].status, FaceStatus::Unknown);
        assert!(outcomes[0].identity.is_none());
        assert!((outcomes[0].confidence - 0.1).abs() < 1e-4);
        assert!(service.store().attendance_records(None).unwrap().is_empty());
    }

    #[test]
    fn test_empty_gallery_reports_unknown() {
        let mut service = service();
        show(&mut service, vec![(face_at(10.0, 0.9), unit(0.0))]);
        let outcomes = service.process_frame_at(&frame_bytes(), at(3, 9)).unwrap();
        assert_eq!(outcomes[0].status, FaceStatus::Unknown);
        assert_eq!(outcomes[0].confidence, 0.0);
    }

    #[test]
    fn test_no_session_for_cohort() {
        let mut service = service();
        seed(&service, "Ada", unit(0.0), Some("EE"));
        service.store().start_session("prof", &cohort(Some("CS"))).unwrap();
        show(&mut service, vec![(face_at(10.0, 0.9), unit(0.0))]);

        let outcomes = service.process_frame_at(&frame_bytes(), at(3, 9)).unwrap();
        assert_eq!(outcomes[0].status, FaceStatus::NoActiveSession);
        assert_eq!(outcomes[0].identity.as_ref().map(|i| i.name.as_str()), Some("Ada"));
        assert!(service.store().attendance_records(None).unwrap().is_empty());
    }

    #[test]
    fn test_low_score_faces_are_dropped() {
        let mut service = service();
        seed(&service, "Ada", unit(0.0), None);
        service.store().start_session("prof", &Cohort::default()).unwrap();
        show(&mut service, vec![(face_at(10.0, 0.3), unit(0.0))]);

        let outcomes = service.process_frame_at(&frame_bytes(), at(3, 9)).unwrap();
        assert!(outcomes.is_empty());
    }

    #[test]
    fn test_failed_face_does_not_abort_others() {
        let mut service = service();
        seed(&service, "Ada", unit(0.0), None);
        service.store().start_session("prof", &Cohort::default()).unwrap();
        show(&mut service, vec![(face_at(40.0, 0.9), unit(0.0))]);
        // A second face with no embedding available.
        service.detector.faces.insert(0, face_at(5.0, 0.95));

        let outcomes = service.process_frame_at(&frame_bytes(), at(3, 9)).unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].status, FaceStatus::AttendanceMarked);
    }

    #[test]
    fn test_same_identity_twice_in_one_frame_counts_once() {
        let mut service = service();
        seed(&service, "Ada", unit(0.0), None);
        service.store().start_session("prof", &Cohort::default()).unwrap();
        show(
            &mut service,
            vec![(face_at(0.0, 0.9), unit(0.0)), (face_at(40.0, 0.9), unit(0.05))],
        );

        let outcomes = service.process_frame_at(&frame_bytes(), at(3, 9)).unwrap();
        let statuses: Vec<_> = outcomes.iter().map(|o| o.status).collect();
        assert_eq!(statuses, vec![FaceStatus::AttendanceMarked, FaceStatus::AlreadyMarked]);
        assert_eq!(service.store().attendance_records(None).unwrap().len(), 1);
    }

    #[test]
    fn test_best_match_wins() {
        let mut service = service();
        seed(&service, "Ada", unit(0.0), None);
        let bob = seed(&service, "Bob", unit(1.2), None);
        service.store().start_session("prof", &Cohort::default()).unwrap();
        show(&mut service, vec![(face_at(10.0, 0.9), unit(1.1))]);

        let outcomes = service.process_frame_at(&frame_bytes(), at(3, 9)).unwrap();
        assert_eq!(outcomes[0].identity.as_ref().map(|i| i.id), Some(bob.id));
    }

    #[test]
    fn test_missing_detector_yields_no_faces() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut service = AttendanceService::new(
            None::<FakeDetector>,
            FakeEmbedder::default(),
            store,
            Policy::default(),
        )
        .unwrap();
        assert!(service.process_frame_at(&frame_bytes(), at(3, 9)).unwrap().is_empty());
        assert!(matches!(
            service.detect(&frame_bytes()),
            Err(AttendanceError::Detector(DetectorError::ModelUnavailable))
        ));
    }

    #[test]
    fn test_undecodable_frame() {
        let mut service = service();
        assert!(matches!(
            service.process_frame_at(b"garbage", at(3, 9)),
            Err(AttendanceError::InvalidImage(_))
        ));
    }

    #[test]
    fn test_status_text() {
        assert_eq!(FaceStatus::AttendanceMarked.to_string(), "Attendance Marked");
        assert_eq!(FaceStatus::AlreadyMarked.to_string(), "Already Marked");
        assert_eq!(FaceStatus::NoActiveSession.to_string(), "No Active Session");
        assert_eq!(FaceStatus::Unknown.to_string(), "Unknown");
    }

    // --- Identity maintenance ---

    #[test]
    fn test_update_identity_keeps_embedding() {
        let mut service = service();
        let ada = seed(&service, "Ada", unit(0.0), Some("CS"));

        let updated = service
            .update_identity(
                ada.id,
                IdentityUpdate {
                    name: Some("Ada L.".into()),
                    course: Some(String::new()),
                    group: Some("B".into()),
                    ..IdentityUpdate::default()
                },
            )
            .unwrap();
        assert_eq!(updated.name, "Ada L.");
        assert_eq!(updated.cohort.course, None);
        assert_eq!(updated.cohort.group.as_deref(), Some("B"));
        assert_eq!(updated.embedding, ada.embedding);
        assert_eq!(service.cache().find(ada.id).map(|i| i.name), Some("Ada L.".into()));

        assert!(matches!(
            service.update_identity(999, IdentityUpdate::default()),
            Err(StoreError::IdentityNotFound(999))
        ));
    }

    #[test]
    fn test_delete_removes_from_store_and_cache() {
        let mut service = service();
        let ada = seed(&service, "Ada", unit(0.0), None);
        service.store().start_session("prof", &Cohort::default()).unwrap();
        show(&mut service, vec![(face_at(10.0, 0.9), unit(0.0))]);
        service.process_frame_at(&frame_bytes(), at(3, 9)).unwrap();

        assert!(service.delete_identity(ada.id).unwrap());
        assert!(service.cache().find(ada.id).is_none());
        assert!(service.store().attendance_records(None).unwrap().is_empty());

        let outcomes = service.process_frame_at(&frame_bytes(), at(3, 10)).unwrap();
        assert_eq!(outcomes[0].status, FaceStatus::Unknown);
    }

    #[test]
    fn test_refresh_picks_up_external_changes() {
        let service = service();
        service
            .store()
            .add_identity(&NewIdentity {
                name: "Added elsewhere".into(),
                external_id: "X1".into(),
                embedding: unit(0.0),
                thumbnail_path: None,
                cohort: Cohort::default(),
            })
            .unwrap();
        assert_eq!(service.cache().len(), 0);
        assert_eq!(service.refresh_cache().unwrap(), 1);
        assert_eq!(service.cache().len(), 1);
    }
}
