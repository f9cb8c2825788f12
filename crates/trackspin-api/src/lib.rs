use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use trackspin_core::{
    AdaptiveRecommender, AffinityRecommender, BaselineRecommender, BlendRecommender, Catalog,
    HistoryStore, Recommender, SimilarTracks, SimilarityRecommender, TasteProfile, TasteProfiles,
    Track, TrackId, UserId,
};
use trackspin_store_sqlite::SqliteStore;
use ulid::Ulid;

pub const API_CONTRACT_VERSION: &str = "api.v1";

/// Default experiment under which listeners are bucketed into strategy arms.
pub const DEFAULT_EXPERIMENT: &str = "next-track-strategies";

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct NextTrackRequest {
    pub track: i64,
    pub time: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct NextTrackResponse {
    pub user: i64,
    pub track: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct LastTrackResponse {
    pub user: i64,
}

/// The strategy arms a request can be served by.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Variant {
    Baseline,
    Similarity,
    Affinity,
    Blend,
    Adaptive,
}

impl Variant {
    const ALL: [Self; 5] =
        [Self::Baseline, Self::Similarity, Self::Affinity, Self::Blend, Self::Adaptive];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Baseline => "baseline",
            Self::Similarity => "similarity",
            Self::Affinity => "affinity",
            Self::Blend => "blend",
            Self::Adaptive => "adaptive",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "baseline" => Some(Self::Baseline),
            "similarity" => Some(Self::Similarity),
            "affinity" => Some(Self::Affinity),
            "blend" => Some(Self::Blend),
            "adaptive" => Some(Self::Adaptive),
            _ => None,
        }
    }
}

/// Deterministic experiment assignment: a user always lands on the same arm
/// for a given experiment name.
#[derive(Debug, Clone)]
pub struct Experiment {
    name: String,
}

impl Experiment {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    #[must_use]
    pub fn assign(&self, user: UserId) -> Variant {
        let mut hasher = Sha256::new();
        hasher.update(self.name.as_bytes());
        hasher.update(user.0.to_be_bytes());
        let digest = hasher.finalize();

        let mut bucket_bytes = [0_u8; 8];
        bucket_bytes.copy_from_slice(&digest[..8]);
        let bucket = u64::from_be_bytes(bucket_bytes) % Variant::ALL.len() as u64;
        Variant::ALL[usize::try_from(bucket).unwrap_or(0)]
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum PlayEvent {
    Next,
    Last,
}

/// One line of the playback data log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlayRecord {
    pub record_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub logged_at: OffsetDateTime,
    pub event: PlayEvent,
    pub user: i64,
    pub track: i64,
    pub time: f64,
    pub latency_ms: u64,
    pub variant: Option<Variant>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recommendation: Option<i64>,
}

/// Append-only JSONL sink for playback events. Write failures propagate; the
/// log never drops records silently.
pub struct PlayLog {
    file: Mutex<File>,
}

impl PlayLog {
    /// # Errors
    /// Returns an error when the log file cannot be created or opened.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open play log at {}", path.display()))?;
        Ok(Self { file: Mutex::new(file) })
    }

    /// # Errors
    /// Returns an error when serialization or the append fails.
    pub fn append(&self, record: &PlayRecord) -> Result<()> {
        let line = serde_json::to_string(record).context("failed to serialize play record")?;
        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        writeln!(file, "{line}").context("failed to append to play log")?;
        Ok(())
    }
}

/// Construction-time options for [`RecommendApi`].
#[derive(Debug, Clone, Default)]
pub struct ApiOptions {
    /// Pin every request to one arm instead of experiment assignment.
    pub variant: Option<Variant>,
    /// Where to append the playback data log; `None` disables logging.
    pub play_log: Option<PathBuf>,
}

/// The request boundary's single entry point into the decision engine. Every
/// strategy arm is constructed once over shared store handles; per-request
/// routing is experiment assignment unless a variant is pinned.
#[derive(Clone)]
pub struct RecommendApi {
    store: Arc<SqliteStore>,
    baseline: Arc<BaselineRecommender>,
    similarity: Arc<SimilarityRecommender>,
    affinity: Arc<AffinityRecommender>,
    blend: Arc<BlendRecommender>,
    adaptive: Arc<AdaptiveRecommender>,
    experiment: Experiment,
    variant: Option<Variant>,
    play_log: Option<Arc<PlayLog>>,
}

impl RecommendApi {
    /// Open the backing database, migrate it, and wire up all strategy arms.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or migrated, or
    /// when the play log cannot be created.
    pub fn open(db: &Path, options: ApiOptions) -> Result<Self> {
        let store = Arc::new(SqliteStore::open(db)?);
        store.migrate()?;

        let similar = Arc::clone(&store) as Arc<dyn SimilarTracks>;
        let taste = Arc::clone(&store) as Arc<dyn TasteProfiles>;
        let history = Arc::clone(&store) as Arc<dyn HistoryStore>;
        let catalog = Arc::clone(&store) as Arc<dyn Catalog>;

        let play_log = match options.play_log {
            Some(path) => Some(Arc::new(PlayLog::open(&path)?)),
            None => None,
        };

        Ok(Self {
            baseline: Arc::new(BaselineRecommender::new(
                Arc::clone(&similar),
                Arc::clone(&catalog),
            )),
            similarity: Arc::new(SimilarityRecommender::new(
                Arc::clone(&similar),
                Arc::clone(&history),
                Arc::clone(&catalog),
            )),
            affinity: Arc::new(AffinityRecommender::new(
                Arc::clone(&taste),
                Arc::clone(&history),
                Arc::clone(&catalog),
            )),
            blend: Arc::new(BlendRecommender::new(
                Arc::clone(&similar),
                Arc::clone(&taste),
                Arc::clone(&history),
                Arc::clone(&catalog),
            )),
            adaptive: Arc::new(AdaptiveRecommender::new(similar, taste, history, catalog)),
            experiment: Experiment::new(DEFAULT_EXPERIMENT),
            variant: options.variant,
            play_log,
            store,
        })
    }

    /// The shared store handle, for upload tooling and the service bootstrap.
    #[must_use]
    pub fn store(&self) -> &SqliteStore {
        &self.store
    }

    fn recommender_for(&self, variant: Variant) -> &dyn Recommender {
        match variant {
            Variant::Baseline => &*self.baseline,
            Variant::Similarity => &*self.similarity,
            Variant::Affinity => &*self.affinity,
            Variant::Blend => &*self.blend,
            Variant::Adaptive => &*self.adaptive,
        }
    }

    /// Serve one listen turn: route the user to an arm and return exactly one
    /// next track.
    ///
    /// # Errors
    /// Returns an error on store failure, an empty catalog, or a failed log
    /// append. Missing candidate data is not an error.
    pub fn next_track(&self, user: UserId, request: &NextTrackRequest) -> Result<NextTrackResponse> {
        let started = Instant::now();
        let variant = self.variant.unwrap_or_else(|| self.experiment.assign(user));

        let mut rng = rand::thread_rng();
        let recommendation = self
            .recommender_for(variant)
            .recommend_next(user, TrackId(request.track), request.time, &mut rng)
            .with_context(|| format!("recommendation failed for user {user}"))?;

        self.log_play(PlayRecord {
            record_id: Ulid::new().to_string(),
            logged_at: OffsetDateTime::now_utc(),
            event: PlayEvent::Next,
            user: user.0,
            track: request.track,
            time: request.time,
            latency_ms: elapsed_ms(started),
            variant: Some(variant),
            recommendation: Some(recommendation.0),
        })?;

        Ok(NextTrackResponse { user: user.0, track: recommendation.0 })
    }

    /// Record the final turn of a listening session. No recommendation is
    /// produced.
    ///
    /// # Errors
    /// Returns an error when the log append fails.
    pub fn last_track(&self, user: UserId, request: &NextTrackRequest) -> Result<LastTrackResponse> {
        let started = Instant::now();
        self.log_play(PlayRecord {
            record_id: Ulid::new().to_string(),
            logged_at: OffsetDateTime::now_utc(),
            event: PlayEvent::Last,
            user: user.0,
            track: request.track,
            time: request.time,
            latency_ms: elapsed_ms(started),
            variant: None,
            recommendation: None,
        })?;
        Ok(LastTrackResponse { user: user.0 })
    }

    /// Catalog metadata for one track, `None` when unknown.
    ///
    /// # Errors
    /// Returns an error when the store read fails.
    pub fn track_info(&self, track: TrackId) -> Result<Option<Track>> {
        self.store.get_track(track)
    }

    fn log_play(&self, record: PlayRecord) -> Result<()> {
        match &self.play_log {
            Some(log) => log.append(&record),
            None => Ok(()),
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Read a catalog dataset: one JSON [`Track`] per line, blank lines skipped.
///
/// # Errors
/// Returns an error when the file cannot be read or a line is not a valid
/// track record.
pub fn read_tracks_jsonl(path: &Path) -> Result<Vec<Track>> {
    read_jsonl(path, "track")
}

/// Read a taste dataset: one JSON [`TasteProfile`] per line.
///
/// # Errors
/// Returns an error when the file cannot be read or a line is not a valid
/// profile record.
pub fn read_taste_profiles_jsonl(path: &Path) -> Result<Vec<TasteProfile>> {
    read_jsonl(path, "taste profile")
}

fn read_jsonl<T: serde::de::DeserializeOwned>(path: &Path, what: &str) -> Result<Vec<T>> {
    let file = File::open(path)
        .with_context(|| format!("failed to open {what} dataset at {}", path.display()))?;
    let mut records = Vec::new();
    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("failed to read {what} dataset line"))?;
        if line.trim().is_empty() {
            continue;
        }
        let record = serde_json::from_str(&line)
            .with_context(|| format!("line {} is not a valid {what} record", index + 1))?;
        records.push(record);
    }
    Ok(records)
}

/// Load both datasets into the store. Returns `(tracks, profiles)` counts.
///
/// # Errors
/// Returns an error when reading or uploading fails.
pub fn upload_datasets(
    store: &SqliteStore,
    tracks: &Path,
    taste_profiles: Option<&Path>,
) -> Result<(usize, usize)> {
    let track_records = read_tracks_jsonl(tracks)?;
    let uploaded_tracks = store.upload_tracks(&track_records)?;

    let uploaded_profiles = match taste_profiles {
        Some(path) => {
            let profiles = read_taste_profiles_jsonl(path)?;
            store.upload_taste_profiles(&profiles)?
        }
        None => 0,
    };

    Ok((uploaded_tracks, uploaded_profiles))
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("trackspin-api-{}.sqlite3", Ulid::new()))
    }

    fn seeded_api(variant: Option<Variant>, play_log: Option<PathBuf>) -> Result<RecommendApi> {
        let api = RecommendApi::open(&unique_temp_db_path(), ApiOptions { variant, play_log })?;
        api.store().upload_tracks(&[
            Track {
                track: TrackId(5),
                artist: "a".to_string(),
                title: "t5".to_string(),
                recommendations: vec![TrackId(10), TrackId(20)],
            },
            Track {
                track: TrackId(10),
                artist: "a".to_string(),
                title: "t10".to_string(),
                recommendations: Vec::new(),
            },
            Track {
                track: TrackId(20),
                artist: "a".to_string(),
                title: "t20".to_string(),
                recommendations: Vec::new(),
            },
            Track {
                track: TrackId(30),
                artist: "a".to_string(),
                title: "t30".to_string(),
                recommendations: Vec::new(),
            },
        ])?;
        Ok(api)
    }

    // Test IDs: TEXP-001
    #[test]
    fn assignment_is_deterministic_per_user() {
        let experiment = Experiment::new(DEFAULT_EXPERIMENT);
        for raw in 0..64 {
            let user = UserId(raw);
            assert_eq!(experiment.assign(user), experiment.assign(user));
        }
    }

    // Test IDs: TEXP-002
    #[test]
    fn assignment_reaches_every_arm() {
        let experiment = Experiment::new(DEFAULT_EXPERIMENT);
        let seen = (0..1000).map(|raw| experiment.assign(UserId(raw))).collect::<HashSet<_>>();
        assert_eq!(seen.len(), Variant::ALL.len());
    }

    // Test IDs: TAPI-001
    #[test]
    fn next_track_serves_from_the_similarity_pool() -> Result<()> {
        let api = seeded_api(Some(Variant::Similarity), None)?;
        let response = api.next_track(UserId(7), &NextTrackRequest { track: 5, time: 1.0 })?;
        assert_eq!(response.user, 7);
        assert!(response.track == 10 || response.track == 20);
        Ok(())
    }

    // Test IDs: TAPI-002
    #[test]
    fn next_track_with_unknown_previous_track_still_answers() -> Result<()> {
        let api = seeded_api(Some(Variant::Adaptive), None)?;
        let response = api.next_track(UserId(7), &NextTrackRequest { track: 999, time: 0.2 })?;
        assert!([5, 10, 20, 30].contains(&response.track));
        Ok(())
    }

    // Test IDs: TAPI-003
    #[test]
    fn every_variant_answers_for_a_fresh_user() -> Result<()> {
        for variant in Variant::ALL {
            let api = seeded_api(Some(variant), None)?;
            let response =
                api.next_track(UserId(42), &NextTrackRequest { track: 5, time: 0.9 })?;
            assert!([5, 10, 20, 30].contains(&response.track), "variant {}", variant.as_str());
        }
        Ok(())
    }

    // Test IDs: TLOG-001
    #[test]
    fn play_log_records_next_and_last_events() -> Result<()> {
        let log_path = std::env::temp_dir().join(format!("trackspin-log-{}.jsonl", Ulid::new()));
        let api = seeded_api(Some(Variant::Similarity), Some(log_path.clone()))?;

        api.next_track(UserId(7), &NextTrackRequest { track: 5, time: 0.6 })?;
        api.last_track(UserId(7), &NextTrackRequest { track: 10, time: 0.3 })?;

        let raw = std::fs::read_to_string(&log_path)?;
        let records = raw
            .lines()
            .map(serde_json::from_str::<PlayRecord>)
            .collect::<Result<Vec<_>, _>>()?;
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].event, PlayEvent::Next);
        assert!(records[0].recommendation.is_some());
        assert_eq!(records[1].event, PlayEvent::Last);
        assert_eq!(records[1].recommendation, None);

        let _ = std::fs::remove_file(&log_path);
        Ok(())
    }

    // Test IDs: TAPI-004
    #[test]
    fn track_info_round_trips_and_misses_cleanly() -> Result<()> {
        let api = seeded_api(None, None)?;
        let info = api.track_info(TrackId(5))?;
        assert_eq!(info.map(|track| track.title), Some("t5".to_string()));
        assert_eq!(api.track_info(TrackId(999))?, None);
        Ok(())
    }

    // Test IDs: TAPI-005
    #[test]
    fn jsonl_datasets_round_trip_through_upload() -> Result<()> {
        let dir = std::env::temp_dir();
        let tracks_path = dir.join(format!("trackspin-tracks-{}.jsonl", Ulid::new()));
        let taste_path = dir.join(format!("trackspin-taste-{}.jsonl", Ulid::new()));
        std::fs::write(
            &tracks_path,
            concat!(
                r#"{"track":1,"artist":"a","title":"one","recommendations":[2]}"#,
                "\n\n",
                r#"{"track":2,"artist":"b","title":"two","recommendations":[]}"#,
                "\n",
            ),
        )?;
        std::fs::write(&taste_path, concat!(r#"{"user":7,"tracks":[1,2]}"#, "\n"))?;

        let api = RecommendApi::open(&unique_temp_db_path(), ApiOptions::default())?;
        let (tracks, profiles) =
            upload_datasets(api.store(), &tracks_path, Some(taste_path.as_path()))?;
        assert_eq!((tracks, profiles), (2, 1));
        assert_eq!(api.track_info(TrackId(2))?.map(|track| track.title), Some("two".to_string()));

        let _ = std::fs::remove_file(&tracks_path);
        let _ = std::fs::remove_file(&taste_path);
        Ok(())
    }
}
