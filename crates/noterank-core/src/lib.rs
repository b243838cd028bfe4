use std::cmp::Ordering;
use std::fmt::{Display, Formatter};

use rand::Rng;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("store read error: {0}")]
    StoreRead(String),
    #[error("store write error: {0}")]
    StoreWrite(String),
}

/// Failure reported by a record store adapter. The engine maps it onto
/// [`EngineError::StoreRead`] or [`EngineError::StoreWrite`] depending on
/// which side of the adapter failed.
#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
#[error("{0}")]
pub struct StoreError(pub String);

/// Backing store for ranked notes, consumed by the session controller.
///
/// `list_candidates` feeds engine construction, `write_metric` receives the
/// per-round flush, and `read_content` is only used by the surrounding
/// renderer.
pub trait RecordStore {
    /// List every record carrying a value for `metric`.
    ///
    /// # Errors
    /// Returns [`StoreError`] when the underlying store cannot be read.
    fn list_candidates(&self, metric: &str) -> Result<Vec<Candidate>, StoreError>;

    /// Fetch the displayable content of one record.
    ///
    /// # Errors
    /// Returns [`StoreError`] when the record is missing or unreadable.
    fn read_content(&self, id: &str) -> Result<String, StoreError>;

    /// Durably write one record's metric value.
    ///
    /// # Errors
    /// Returns [`StoreError`] when the write does not complete.
    fn write_metric(&mut self, id: &str, metric: &str, value: &str) -> Result<(), StoreError>;
}

/// A tracked metric and the direction in which better values compare.
///
/// With `ascending = true` a better record carries a *lower* value.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct MetricSpec {
    pub name: String,
    pub ascending: bool,
}

impl MetricSpec {
    #[must_use]
    pub fn new(name: impl Into<String>, ascending: bool) -> Self {
        Self { name: name.into(), ascending }
    }

    /// Stable identifier derived from the metric name: trimmed, with spaces
    /// replaced by dashes.
    #[must_use]
    pub fn slug(&self) -> String {
        self.name
            .trim()
            .chars()
            .map(|ch| if ch == ' ' { '-' } else { ch })
            .collect()
    }
}

/// One record participating in a ranking session.
///
/// `value` stays a string end to end; only the comparison and swap rules
/// parse it, mirroring how the values live in note metadata.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Candidate {
    pub id: String,
    pub label: String,
    pub value: String,
}

impl Candidate {
    #[must_use]
    pub fn new(id: impl Into<String>, label: impl Into<String>, value: impl Into<String>) -> Self {
        Self { id: id.into(), label: label.into(), value: value.into() }
    }

    /// Leading-integer parse of the stored value: optional sign, then a
    /// digit prefix. `"12 points"` parses as 12; `"high"` parses as `None`.
    #[must_use]
    pub fn numeric(&self) -> Option<i64> {
        parse_leading_int(&self.value)
    }
}

fn parse_leading_int(value: &str) -> Option<i64> {
    let trimmed = value.trim_start();
    let (negative, digits) = match trimmed.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, trimmed.strip_prefix('+').unwrap_or(trimmed)),
    };
    let end = digits
        .find(|ch: char| !ch.is_ascii_digit())
        .unwrap_or(digits.len());
    if end == 0 {
        return None;
    }
    let magnitude: i64 = digits[..end].parse().ok()?;
    Some(if negative { -magnitude } else { magnitude })
}

fn value_cmp(lhs: &Candidate, rhs: &Candidate) -> Ordering {
    match (lhs.numeric(), rhs.numeric()) {
        (Some(a), Some(b)) => a.cmp(&b),
        _ => lhs.value.cmp(&rhs.value),
    }
}

fn value_lt(lhs: &Candidate, rhs: &Candidate) -> bool {
    value_cmp(lhs, rhs) == Ordering::Less
}

/// Which display slot the user picked as better.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Slot {
    Left,
    Right,
}

/// One candidate as placed into a display slot.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct SlotCard {
    pub index: usize,
    pub id: String,
    pub label: String,
    pub value: String,
}

/// One presented round: two adjacent candidates with their slot assignment.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RoundView {
    pub left: SlotCard,
    pub right: SlotCard,
}

/// The pairwise-comparison reorder engine for one metric.
///
/// Holds a working copy of the candidate collection. Slot membership and
/// order are fixed for the engine's lifetime; answering rounds only trades
/// `value` fields between the two compared slots, so "adjacent by index"
/// keeps meaning the same neighbours across rounds.
#[derive(Debug, Clone)]
pub struct ComparisonEngine {
    spec: MetricSpec,
    candidates: Vec<Candidate>,
    last_pair: Option<(usize, usize)>,
    active_pair: Option<(usize, usize)>,
}

impl ComparisonEngine {
    /// Build the working collection: drop candidates with an empty value,
    /// sort the rest ascending by value.
    ///
    /// # Errors
    /// Returns [`EngineError::Configuration`] when fewer than two candidates
    /// qualify; a session cannot start without at least one comparable pair.
    pub fn new(spec: MetricSpec, candidates: Vec<Candidate>) -> Result<Self, EngineError> {
        let mut candidates: Vec<Candidate> = candidates
            .into_iter()
            .filter(|candidate| !candidate.value.trim().is_empty())
            .collect();
        candidates.sort_by(value_cmp);

        if candidates.len() < 2 {
            return Err(EngineError::Configuration(format!(
                "metric '{}' has {} candidate(s) with a value; at least 2 are required",
                spec.name,
                candidates.len()
            )));
        }

        Ok(Self { spec, candidates, last_pair: None, active_pair: None })
    }

    #[must_use]
    pub fn spec(&self) -> &MetricSpec {
        &self.spec
    }

    #[must_use]
    pub fn candidates(&self) -> &[Candidate] {
        &self.candidates
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    #[must_use]
    pub fn last_pair(&self) -> Option<(usize, usize)> {
        self.last_pair
    }

    /// The `(left, right)` slot indices of the currently presented round.
    #[must_use]
    pub fn active_pair(&self) -> Option<(usize, usize)> {
        self.active_pair
    }

    /// Pick the next round: a uniformly random primary slot and its
    /// adjacent-by-index neighbour (the preceding slot, or the following one
    /// when the primary is slot 0), redrawing while the unordered pair
    /// matches the previous round. With only two candidates a single pair
    /// exists, so repeat-avoidance is skipped.
    pub fn select_round<R: Rng>(&mut self, rng: &mut R) -> RoundView {
        let len = self.candidates.len();
        let (primary, secondary) = loop {
            let primary = rng.gen_range(0..len);
            let secondary = if primary == 0 { 1 } else { primary - 1 };
            if len == 2 || !self.repeats_last_pair(primary, secondary) {
                break (primary, secondary);
            }
        };
        self.present(primary, secondary)
    }

    fn repeats_last_pair(&self, a: usize, b: usize) -> bool {
        matches!(self.last_pair, Some((x, y)) if (x == a && y == b) || (x == b && y == a))
    }

    fn present(&mut self, primary: usize, secondary: usize) -> RoundView {
        self.last_pair = Some((primary, secondary));

        // The currently-lower-ranked-looking candidate (per direction) takes
        // the left slot, so left/right keep a consistent meaning across
        // rounds for the same direction setting.
        let primary_first = if self.spec.ascending {
            value_lt(&self.candidates[primary], &self.candidates[secondary])
        } else {
            value_lt(&self.candidates[secondary], &self.candidates[primary])
        };
        let (left, right) = if primary_first { (primary, secondary) } else { (secondary, primary) };
        self.active_pair = Some((left, right));

        RoundView { left: self.card(left), right: self.card(right) }
    }

    fn card(&self, index: usize) -> SlotCard {
        let candidate = &self.candidates[index];
        SlotCard {
            index,
            id: candidate.id.clone(),
            label: candidate.label.clone(),
            value: candidate.value.clone(),
        }
    }

    /// Apply the user's verdict for the open round. When the stored values
    /// disagree with the verdict under the configured direction, the two
    /// slots trade `value` fields; otherwise nothing changes. Values that do
    /// not parse as integers never swap.
    ///
    /// Returns whether a swap happened. Re-applying the same winner on an
    /// already-corrected pair is a no-op.
    ///
    /// # Errors
    /// Returns [`EngineError::Configuration`] when no round is open.
    pub fn apply_answer(&mut self, winner: Slot) -> Result<bool, EngineError> {
        let (left, right) = self.active_pair.ok_or_else(|| {
            EngineError::Configuration("no round is open to answer".to_string())
        })?;
        let (better, worse) = match winner {
            Slot::Left => (left, right),
            Slot::Right => (right, left),
        };

        let (Some(better_value), Some(worse_value)) =
            (self.candidates[better].numeric(), self.candidates[worse].numeric())
        else {
            return Ok(false);
        };

        let out_of_order = if self.spec.ascending {
            better_value > worse_value
        } else {
            better_value < worse_value
        };
        if !out_of_order {
            return Ok(false);
        }

        let better_raw = std::mem::take(&mut self.candidates[better].value);
        let worse_raw = std::mem::replace(&mut self.candidates[worse].value, better_raw);
        self.candidates[better].value = worse_raw;
        Ok(true)
    }

    /// Write the current values of exactly the two candidates in the open
    /// round back through the store. Both writes are attempted even when the
    /// first fails; failures are gathered into one error. The in-memory
    /// collection stays authoritative either way, so a failed flush can be
    /// retried externally without corrupting engine state.
    ///
    /// A no-op when no round has been presented yet.
    ///
    /// # Errors
    /// Returns [`EngineError::StoreWrite`] naming every candidate whose
    /// write failed.
    pub fn flush<S: RecordStore>(&self, store: &mut S) -> Result<(), EngineError> {
        let Some((left, right)) = self.active_pair else {
            return Ok(());
        };

        let mut failures = Vec::new();
        for index in [left, right] {
            let candidate = &self.candidates[index];
            if let Err(err) = store.write_metric(&candidate.id, &self.spec.name, &candidate.value) {
                failures.push(format!("{}: {err}", candidate.id));
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(EngineError::StoreWrite(failures.join("; ")))
        }
    }
}

/// Result of answering one round: whether the answer corrected the stored
/// values, and the next round to present.
#[derive(Debug, Clone)]
pub struct RoundOutcome {
    pub swapped: bool,
    pub next: RoundView,
}

/// One open reorder session: an engine plus the round lifecycle
/// `RoundOpen -> (answer: apply + flush) -> RoundOpen -> ... -> Closed`.
#[derive(Debug)]
pub struct Session {
    engine: ComparisonEngine,
}

impl Session {
    /// Start a session for `spec`: list candidates, build the engine, and
    /// present the first round.
    ///
    /// # Errors
    /// Returns [`EngineError::StoreRead`] when candidate listing fails and
    /// [`EngineError::Configuration`] when fewer than two candidates
    /// qualify.
    pub fn open<S: RecordStore, R: Rng>(
        spec: MetricSpec,
        store: &S,
        rng: &mut R,
    ) -> Result<(Self, RoundView), EngineError> {
        let candidates = store
            .list_candidates(&spec.name)
            .map_err(|err| EngineError::StoreRead(err.to_string()))?;
        let mut engine = ComparisonEngine::new(spec, candidates)?;
        let view = engine.select_round(rng);
        Ok((Self { engine }, view))
    }

    #[must_use]
    pub fn engine(&self) -> &ComparisonEngine {
        &self.engine
    }

    /// Answer the open round: apply the verdict, flush both compared
    /// candidates, then select the next round. The next round is only drawn
    /// once the flush settles, so a future comparison never sees stale
    /// in-flight values.
    ///
    /// On a flush failure the round stays open and the same answer can be
    /// retried: the re-applied verdict is a no-op and the flush runs again.
    ///
    /// # Errors
    /// Propagates [`EngineError::Configuration`] from the answer step and
    /// [`EngineError::StoreWrite`] from the flush.
    pub fn answer<S: RecordStore, R: Rng>(
        &mut self,
        winner: Slot,
        store: &mut S,
        rng: &mut R,
    ) -> Result<RoundOutcome, EngineError> {
        let swapped = self.engine.apply_answer(winner)?;
        self.engine.flush(store)?;
        let next = self.engine.select_round(rng);
        Ok(RoundOutcome { swapped, next })
    }

    /// Close the session with one final flush for whatever pair was last
    /// shown, answered or not.
    ///
    /// # Errors
    /// Returns [`EngineError::StoreWrite`] when the final flush fails; the
    /// session is released regardless.
    pub fn close<S: RecordStore>(self, store: &mut S) -> Result<(), EngineError> {
        self.engine.flush(store)
    }
}

/// Owner of at most one open session. Opening a session for a new metric
/// first closes (and final-flushes) the existing one, so two engines never
/// mutate candidate collections at the same time.
#[derive(Debug, Default)]
pub struct SessionManager {
    active: Option<Session>,
}

impl SessionManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.active.is_some()
    }

    #[must_use]
    pub fn session(&self) -> Option<&Session> {
        self.active.as_ref()
    }

    /// Open a session for `spec`, closing any existing session first.
    ///
    /// # Errors
    /// Propagates the final flush error of the previous session, or any
    /// [`Session::open`] error for the new one. The previous session is
    /// released even when its final flush fails.
    pub fn open<S: RecordStore, R: Rng>(
        &mut self,
        spec: MetricSpec,
        store: &mut S,
        rng: &mut R,
    ) -> Result<RoundView, EngineError> {
        if let Some(existing) = self.active.take() {
            existing.close(store)?;
        }
        let (session, view) = Session::open(spec, store, rng)?;
        self.active = Some(session);
        Ok(view)
    }

    /// Route an answer to the open session.
    ///
    /// # Errors
    /// Returns [`EngineError::Configuration`] when no session is open;
    /// otherwise propagates [`Session::answer`] errors.
    pub fn answer<S: RecordStore, R: Rng>(
        &mut self,
        winner: Slot,
        store: &mut S,
        rng: &mut R,
    ) -> Result<RoundOutcome, EngineError> {
        let session = self.active.as_mut().ok_or_else(|| {
            EngineError::Configuration("no reorder session is open".to_string())
        })?;
        session.answer(winner, store, rng)
    }

    /// Close the open session, if any.
    ///
    /// # Errors
    /// Propagates the final flush error.
    pub fn close<S: RecordStore>(&mut self, store: &mut S) -> Result<(), EngineError> {
        match self.active.take() {
            Some(session) => session.close(store),
            None => Ok(()),
        }
    }
}

impl Display for Slot {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Left => write!(f, "left"),
            Self::Right => write!(f, "right"),
        }
    }
}
