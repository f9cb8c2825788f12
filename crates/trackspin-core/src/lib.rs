use std::collections::{BTreeSet, HashMap};
use std::fmt::{Display, Formatter};
use std::sync::{Arc, Mutex, PoisonError};

use rand::seq::SliceRandom;
use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};

/// Listened share below which a turn counts as disengaged. A drop across this
/// line while candidates are exhausted forces one strategy switch per run.
pub const SWITCH_THRESHOLD: f64 = 0.75;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum StoreError {
    #[error("store read failed: {0}")]
    Read(String),
    #[error("store write failed: {0}")]
    Write(String),
    #[error("stored value is malformed: {0}")]
    Codec(String),
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum RecommendError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("track catalog is empty")]
    EmptyCatalog,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TrackId(pub i64);

impl Display for TrackId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct UserId(pub i64);

impl Display for UserId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Catalog metadata for one track. `recommendations` is the similarity pool
/// keyed by this track; the decision engine never reads the other fields.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Track {
    pub track: TrackId,
    pub artist: String,
    pub title: String,
    #[serde(default)]
    pub recommendations: Vec<TrackId>,
}

/// One line of the taste dataset: the tracks a user is known to come back to.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct TasteProfile {
    pub user: UserId,
    #[serde(default)]
    pub tracks: Vec<TrackId>,
}

pub type CandidateSet = BTreeSet<TrackId>;

/// Read side of the track-similarity pool. Implementations normalize an
/// unknown track and a known track with an empty similarity list to `None`;
/// callers treat both as "no usable source".
pub trait SimilarTracks: Send + Sync {
    /// # Errors
    /// Returns [`StoreError`] when the backing store fails.
    fn similar_to(&self, track: TrackId) -> Result<Option<CandidateSet>, StoreError>;
}

/// Read side of the per-user taste pool. `None` means the user has no stored
/// taste set; a stored empty set stays `Some`.
pub trait TasteProfiles: Send + Sync {
    /// # Errors
    /// Returns [`StoreError`] when the backing store fails.
    fn taste_of(&self, user: UserId) -> Result<Option<CandidateSet>, StoreError>;
}

/// Persisted listen history, one append-only sequence per user.
pub trait HistoryStore: Send + Sync {
    /// # Errors
    /// Returns [`StoreError`] when the backing store fails.
    fn load(&self, user: UserId) -> Result<Option<Vec<TrackId>>, StoreError>;
    /// # Errors
    /// Returns [`StoreError`] when the backing store fails.
    fn save(&self, user: UserId, history: &[TrackId]) -> Result<(), StoreError>;
}

/// Full set of playable tracks, for the uniform-random fallback.
pub trait Catalog: Send + Sync {
    /// # Errors
    /// Returns [`StoreError`] when the backing store fails.
    fn track_ids(&self) -> Result<Vec<TrackId>, StoreError>;
}

/// The one capability every strategy implements: given the listen turn just
/// finished, return exactly one next track. Missing or exhausted candidate
/// data is not an error; only store failures and an empty catalog are.
pub trait Recommender: Send + Sync {
    /// # Errors
    /// Returns [`RecommendError::Store`] on store failure and
    /// [`RecommendError::EmptyCatalog`] when even the fallback has nothing
    /// to choose from.
    fn recommend_next(
        &self,
        user: UserId,
        prev_track: TrackId,
        listened: f64,
        rng: &mut dyn RngCore,
    ) -> Result<TrackId, RecommendError>;
}

/// Per-user listen history with lazy seeding. Every call that seeds or
/// records performs exactly one store write.
#[derive(Clone)]
pub struct HistoryTracker {
    store: Arc<dyn HistoryStore>,
}

impl HistoryTracker {
    #[must_use]
    pub fn new(store: Arc<dyn HistoryStore>) -> Self {
        Self { store }
    }

    /// Return the stored sequence for `user`, creating it as
    /// `[previous_track]` when absent.
    ///
    /// # Errors
    /// Returns [`StoreError`] when the backing store fails.
    pub fn get_or_seed(
        &self,
        user: UserId,
        previous_track: TrackId,
    ) -> Result<Vec<TrackId>, StoreError> {
        if let Some(history) = self.store.load(user)? {
            return Ok(history);
        }
        let seeded = vec![previous_track];
        self.store.save(user, &seeded)?;
        Ok(seeded)
    }

    /// Persist `history + [track]` as the new sequence for `user`.
    ///
    /// # Errors
    /// Returns [`StoreError`] when the backing store fails.
    pub fn record(
        &self,
        user: UserId,
        mut history: Vec<TrackId>,
        track: TrackId,
    ) -> Result<(), StoreError> {
        history.push(track);
        self.store.save(user, &history)
    }
}

fn without_played(candidates: &CandidateSet, history: &[TrackId]) -> CandidateSet {
    let played = history.iter().copied().collect::<CandidateSet>();
    candidates.difference(&played).copied().collect()
}

fn choose_track(candidates: &CandidateSet, rng: &mut dyn RngCore) -> Option<TrackId> {
    let pool = candidates.iter().copied().collect::<Vec<_>>();
    pool.choose(rng).copied()
}

/// Terminal fallback: uniform choice over the whole catalog, history ignored
/// and never written. Repeats are possible here and accepted.
pub struct CatalogRandom {
    catalog: Arc<dyn Catalog>,
}

impl CatalogRandom {
    #[must_use]
    pub fn new(catalog: Arc<dyn Catalog>) -> Self {
        Self { catalog }
    }
}

impl Recommender for CatalogRandom {
    fn recommend_next(
        &self,
        _user: UserId,
        _prev_track: TrackId,
        _listened: f64,
        rng: &mut dyn RngCore,
    ) -> Result<TrackId, RecommendError> {
        let pool = self.catalog.track_ids()?;
        pool.choose(rng).copied().ok_or(RecommendError::EmptyCatalog)
    }
}

/// Picks among tracks similar to the one just played, minus the user's
/// history; falls back to [`CatalogRandom`] when the pool is missing or
/// exhausted.
pub struct SimilarityRecommender {
    similar: Arc<dyn SimilarTracks>,
    history: HistoryTracker,
    fallback: CatalogRandom,
}

impl SimilarityRecommender {
    #[must_use]
    pub fn new(
        similar: Arc<dyn SimilarTracks>,
        history: Arc<dyn HistoryStore>,
        catalog: Arc<dyn Catalog>,
    ) -> Self {
        Self {
            similar,
            history: HistoryTracker::new(history),
            fallback: CatalogRandom::new(catalog),
        }
    }
}

impl Recommender for SimilarityRecommender {
    fn recommend_next(
        &self,
        user: UserId,
        prev_track: TrackId,
        listened: f64,
        rng: &mut dyn RngCore,
    ) -> Result<TrackId, RecommendError> {
        let Some(candidates) = self.similar.similar_to(prev_track)? else {
            return self.fallback.recommend_next(user, prev_track, listened, rng);
        };

        let history = self.history.get_or_seed(user, prev_track)?;
        let remaining = without_played(&candidates, &history);
        let Some(pick) = choose_track(&remaining, rng) else {
            return self.fallback.recommend_next(user, prev_track, listened, rng);
        };

        self.history.record(user, history, pick)?;
        Ok(pick)
    }
}

/// Picks among the user's stored taste pool, minus history; same fallback
/// shape as [`SimilarityRecommender`].
pub struct AffinityRecommender {
    taste: Arc<dyn TasteProfiles>,
    history: HistoryTracker,
    fallback: CatalogRandom,
}

impl AffinityRecommender {
    #[must_use]
    pub fn new(
        taste: Arc<dyn TasteProfiles>,
        history: Arc<dyn HistoryStore>,
        catalog: Arc<dyn Catalog>,
    ) -> Self {
        Self {
            taste,
            history: HistoryTracker::new(history),
            fallback: CatalogRandom::new(catalog),
        }
    }
}

impl Recommender for AffinityRecommender {
    fn recommend_next(
        &self,
        user: UserId,
        prev_track: TrackId,
        listened: f64,
        rng: &mut dyn RngCore,
    ) -> Result<TrackId, RecommendError> {
        let Some(candidates) = self.taste.taste_of(user)? else {
            return self.fallback.recommend_next(user, prev_track, listened, rng);
        };

        let history = self.history.get_or_seed(user, prev_track)?;
        let remaining = without_played(&candidates, &history);
        let Some(pick) = choose_track(&remaining, rng) else {
            return self.fallback.recommend_next(user, prev_track, listened, rng);
        };

        self.history.record(user, history, pick)?;
        Ok(pick)
    }
}

/// Intersects the similarity and taste pools. When one pool is missing the
/// whole turn is delegated to the other arm; when the intersection is
/// exhausted an unbiased coin picks the arm. Delegates own their history
/// updates.
pub struct BlendRecommender {
    similar: Arc<dyn SimilarTracks>,
    taste: Arc<dyn TasteProfiles>,
    history: HistoryTracker,
    by_similarity: SimilarityRecommender,
    by_taste: AffinityRecommender,
}

impl BlendRecommender {
    #[must_use]
    pub fn new(
        similar: Arc<dyn SimilarTracks>,
        taste: Arc<dyn TasteProfiles>,
        history: Arc<dyn HistoryStore>,
        catalog: Arc<dyn Catalog>,
    ) -> Self {
        Self {
            similar: Arc::clone(&similar),
            taste: Arc::clone(&taste),
            history: HistoryTracker::new(Arc::clone(&history)),
            by_similarity: SimilarityRecommender::new(
                similar,
                Arc::clone(&history),
                Arc::clone(&catalog),
            ),
            by_taste: AffinityRecommender::new(taste, history, catalog),
        }
    }
}

impl Recommender for BlendRecommender {
    fn recommend_next(
        &self,
        user: UserId,
        prev_track: TrackId,
        listened: f64,
        rng: &mut dyn RngCore,
    ) -> Result<TrackId, RecommendError> {
        let Some(similar) = self.similar.similar_to(prev_track)? else {
            return self.by_taste.recommend_next(user, prev_track, listened, rng);
        };
        let Some(taste) = self.taste.taste_of(user)? else {
            return self.by_similarity.recommend_next(user, prev_track, listened, rng);
        };

        let history = self.history.get_or_seed(user, prev_track)?;
        let blended = similar.intersection(&taste).copied().collect::<CandidateSet>();
        let remaining = without_played(&blended, &history);

        if let Some(pick) = choose_track(&remaining, rng) {
            self.history.record(user, history, pick)?;
            return Ok(pick);
        }

        if rng.gen_bool(0.5) {
            self.by_similarity.recommend_next(user, prev_track, listened, rng)
        } else {
            self.by_taste.recommend_next(user, prev_track, listened, rng)
        }
    }
}

/// Which base arm served a user's last delegated pick.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Arm {
    Similarity,
    Affinity,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct TasteMemory {
    last_track: TrackId,
    last_listened: f64,
    /// `None` means the blended pick itself served last.
    served_by: Option<Arm>,
    switched: bool,
}

/// Blend plus hysteresis. While the blended pool keeps producing picks the
/// per-user memory is reset; once it runs dry, turns alternate between the
/// base arms by coin flip, except that a single engagement drop across
/// [`SWITCH_THRESHOLD`] forces the opposite arm exactly once per dry run.
///
/// The memory map is process-local and unbounded; it is lost on restart and
/// never evicted. See DESIGN.md for the lifecycle notes.
pub struct AdaptiveRecommender {
    similar: Arc<dyn SimilarTracks>,
    taste: Arc<dyn TasteProfiles>,
    history: HistoryTracker,
    by_similarity: SimilarityRecommender,
    by_taste: AffinityRecommender,
    memory: Mutex<HashMap<UserId, TasteMemory>>,
}

impl AdaptiveRecommender {
    #[must_use]
    pub fn new(
        similar: Arc<dyn SimilarTracks>,
        taste: Arc<dyn TasteProfiles>,
        history: Arc<dyn HistoryStore>,
        catalog: Arc<dyn Catalog>,
    ) -> Self {
        Self {
            similar: Arc::clone(&similar),
            taste: Arc::clone(&taste),
            history: HistoryTracker::new(Arc::clone(&history)),
            by_similarity: SimilarityRecommender::new(
                similar,
                Arc::clone(&history),
                Arc::clone(&catalog),
            ),
            by_taste: AffinityRecommender::new(taste, history, catalog),
            memory: Mutex::new(HashMap::new()),
        }
    }

    fn route_dry_turn(
        &self,
        user: UserId,
        prev_track: TrackId,
        listened: f64,
        rng: &mut dyn RngCore,
    ) -> Arm {
        let mut memory = self.memory.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = memory.entry(user).or_insert(TasteMemory {
            last_track: prev_track,
            last_listened: 1.0,
            served_by: None,
            switched: false,
        });

        if listened < SWITCH_THRESHOLD && entry.last_listened >= SWITCH_THRESHOLD && !entry.switched
        {
            entry.switched = true;
            // A forced switch keeps the recorded turn untouched so the same
            // drop cannot trigger twice.
            match entry.served_by {
                Some(Arm::Similarity) => return Arm::Affinity,
                Some(Arm::Affinity) => return Arm::Similarity,
                None => {}
            }
        }

        entry.last_track = prev_track;
        entry.last_listened = listened;
        let arm = if rng.gen_bool(0.5) { Arm::Similarity } else { Arm::Affinity };
        entry.served_by = Some(arm);
        arm
    }
}

impl Recommender for AdaptiveRecommender {
    fn recommend_next(
        &self,
        user: UserId,
        prev_track: TrackId,
        listened: f64,
        rng: &mut dyn RngCore,
    ) -> Result<TrackId, RecommendError> {
        let Some(similar) = self.similar.similar_to(prev_track)? else {
            return self.by_taste.recommend_next(user, prev_track, listened, rng);
        };
        let Some(taste) = self.taste.taste_of(user)? else {
            return self.by_similarity.recommend_next(user, prev_track, listened, rng);
        };

        let history = self.history.get_or_seed(user, prev_track)?;
        let blended = similar.intersection(&taste).copied().collect::<CandidateSet>();
        let remaining = without_played(&blended, &history);

        if let Some(pick) = choose_track(&remaining, rng) {
            self.history.record(user, history, pick)?;
            let mut memory = self.memory.lock().unwrap_or_else(PoisonError::into_inner);
            memory.insert(
                user,
                TasteMemory {
                    last_track: prev_track,
                    last_listened: listened,
                    served_by: None,
                    switched: false,
                },
            );
            return Ok(pick);
        }

        match self.route_dry_turn(user, prev_track, listened, rng) {
            Arm::Similarity => self.by_similarity.recommend_next(user, prev_track, listened, rng),
            Arm::Affinity => self.by_taste.recommend_next(user, prev_track, listened, rng),
        }
    }
}

/// Legacy control arm: uniform pick among the similarity pool with no history
/// filtering and no history writes; pure-random when the pool is missing.
pub struct BaselineRecommender {
    similar: Arc<dyn SimilarTracks>,
    fallback: CatalogRandom,
}

impl BaselineRecommender {
    #[must_use]
    pub fn new(similar: Arc<dyn SimilarTracks>, catalog: Arc<dyn Catalog>) -> Self {
        Self { similar, fallback: CatalogRandom::new(catalog) }
    }
}

impl Recommender for BaselineRecommender {
    fn recommend_next(
        &self,
        user: UserId,
        prev_track: TrackId,
        listened: f64,
        rng: &mut dyn RngCore,
    ) -> Result<TrackId, RecommendError> {
        let Some(candidates) = self.similar.similar_to(prev_track)? else {
            return self.fallback.recommend_next(user, prev_track, listened, rng);
        };
        match choose_track(&candidates, rng) {
            Some(pick) => Ok(pick),
            None => self.fallback.recommend_next(user, prev_track, listened, rng),
        }
    }
}
