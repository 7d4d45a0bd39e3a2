//! Predictive
//!
//! Learns which value tends to follow a short run of values and, when it is
//! confident enough, commits the value it expects next instead of the one
//! proposed. This is speculative substitution: the cell may jump to a value
//! nobody proposed yet, betting that the proposer is about to.
//!
//! # Pattern Mining
//!
//! Every proposed value is interned into a compact symbol. For each new
//! value `v` the optimizer records, for every run length `L` in
//! `2..=max_pattern_length`, that the last `L` values were followed by `v`.
//! The dictionary holds at most `max_patterns` runs; when full, the run with
//! the lowest `frequency × recency` is evicted. Each run remembers at most
//! `max_followers` distinct next values; a new one replaces the rarest. With
//! a half-life configured, frequencies decay exponentially with the time
//! between observations.
//!
//! Both caps together bound how many symbols can be referenced at once, so
//! the symbol table is compacted back under [`Predictive::symbol_limit`].
//!
//! # Prediction
//!
//! After folding the new history, the most recent values (ending with the
//! proposal) are matched against the dictionary, longest run first. The best
//! follower of the longest matching run is scored as
//!
//! ```text
//! score = (count / total) × (L / max_pattern_length) × (0.5 + 0.5 × success_rate)
//! ```
//!
//! and substituted when the score beats the threshold. The threshold moves
//! with the environment: `base + (0.5 − mean signal) × 0.4`, clamped to
//! `[0.3, 0.95]`, so scarce resources demand more confidence.
//!
//! Each call first scores the previous best guess against the value actually
//! proposed: `success_rate = success_rate × 0.9 + (hit ? 0.1 : 0)`.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use super::Decision;
use crate::adaptive::signal::ContextSnapshot;
use crate::adaptive::transition::TransitionLog;
use crate::error::{Error, Result};

/// Lower bound of the adjusted confidence threshold.
pub const MIN_THRESHOLD: f64 = 0.3;
/// Upper bound of the adjusted confidence threshold.
pub const MAX_THRESHOLD: f64 = 0.95;

const CONTEXT_SWING: f64 = 0.4;
const INITIAL_SUCCESS_RATE: f64 = 0.5;
const MIN_SYMBOL_LIMIT: usize = 32;

/// Tuning for [`Predictive`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PredictiveConfig {
    /// Longest run of values used as a pattern key. At least 2.
    pub max_pattern_length: usize,
    /// Dictionary capacity.
    pub max_patterns: usize,
    /// Distinct next values remembered per run.
    pub max_followers: usize,
    /// Base score a prediction must beat, in `[0, 1]`.
    pub confidence_threshold: f64,
    /// Frequencies halve after this long without reinforcement.
    pub half_life_ms: Option<u64>,
}

impl Default for PredictiveConfig {
    fn default() -> Self {
        Self {
            max_pattern_length: 4,
            max_patterns: 256,
            max_followers: 8,
            confidence_threshold: 0.7,
            half_life_ms: None,
        }
    }
}

impl PredictiveConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_pattern_length < 2 {
            return Err(Error::InvalidParameter {
                name: "max_pattern_length",
                reason: format!("must be at least 2, got {}", self.max_pattern_length),
            });
        }
        if self.max_patterns == 0 {
            return Err(Error::InvalidCapacity("max_patterns"));
        }
        if self.max_followers == 0 {
            return Err(Error::InvalidCapacity("max_followers"));
        }
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(Error::InvalidParameter {
                name: "confidence_threshold",
                reason: format!("must be in [0, 1], got {}", self.confidence_threshold),
            });
        }
        if self.half_life_ms == Some(0) {
            return Err(Error::InvalidDuration("half_life_ms"));
        }
        Ok(())
    }

    fn half_life(&self) -> Option<Duration> {
        self.half_life_ms.map(Duration::from_millis)
    }
}

type Symbol = u32;
type PatternKey = SmallVec<[Symbol; 4]>;

/// Interns values that only implement `PartialEq`.
struct SymbolTable<T> {
    values: Vec<T>,
}

impl<T: PartialEq> SymbolTable<T> {
    fn intern(&mut self, value: &T) -> Symbol
    where
        T: Clone,
    {
        match self.values.iter().position(|v| v == value) {
            Some(index) => index as Symbol,
            None => {
                self.values.push(value.clone());
                (self.values.len() - 1) as Symbol
            }
        }
    }

    fn resolve(&self, symbol: Symbol) -> Option<&T> {
        self.values.get(symbol as usize)
    }
}

/// Follower counts for one pattern key.
struct PatternStats {
    followers: SmallVec<[(Symbol, f64); 4]>,
    total: f64,
    last_seen: Instant,
}

impl PatternStats {
    fn new(now: Instant) -> Self {
        Self {
            followers: SmallVec::new(),
            total: 0.0,
            last_seen: now,
        }
    }

    fn age(&mut self, now: Instant, half_life: Option<Duration>) {
        let factor = decay(now.saturating_duration_since(self.last_seen), half_life);
        if factor < 1.0 {
            for (_, count) in &mut self.followers {
                *count *= factor;
            }
            self.total *= factor;
        }
    }

    fn record(&mut self, next: Symbol, now: Instant, max_followers: usize) {
        match self.followers.iter_mut().find(|(symbol, _)| *symbol == next) {
            Some((_, count)) => *count += 1.0,
            None => {
                if self.followers.len() >= max_followers {
                    self.evict_rarest();
                }
                self.followers.push((next, 1.0));
            }
        }
        self.total += 1.0;
        self.last_seen = now;
    }

    /// Drop the least frequent follower; earlier followers go first on ties.
    fn evict_rarest(&mut self) {
        let rarest = self
            .followers
            .iter()
            .enumerate()
            .fold(None, |rarest: Option<(usize, f64)>, (index, &(_, count))| match rarest {
                Some(current) if current.1 <= count => Some(current),
                _ => Some((index, count)),
            });
        if let Some((index, count)) = rarest {
            self.followers.remove(index);
            self.total = (self.total - count).max(0.0);
        }
    }

    /// Most frequent follower; earlier followers win ties.
    fn best(&self) -> Option<(Symbol, f64)> {
        self.followers
            .iter()
            .copied()
            .fold(None, |best: Option<(Symbol, f64)>, candidate| match best {
                Some(current) if current.1 >= candidate.1 => Some(current),
                _ => Some(candidate),
            })
    }

    fn retention(&self, now: Instant, half_life: Option<Duration>) -> f64 {
        let age = now.saturating_duration_since(self.last_seen);
        let recency = match half_life {
            Some(_) => decay(age, half_life),
            None => 1.0 / (1.0 + age.as_secs_f64()),
        };
        self.total * recency
    }
}

fn decay(elapsed: Duration, half_life: Option<Duration>) -> f64 {
    match half_life {
        Some(half_life) => 0.5f64.powf(elapsed.as_secs_f64() / half_life.as_secs_f64()),
        None => 1.0,
    }
}

/// A scored guess at the next value.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Candidate {
    symbol: Symbol,
    length: usize,
    confidence: f64,
    score: f64,
}

/// Pattern-mining optimizer that may substitute a predicted value.
pub struct Predictive<T> {
    config: PredictiveConfig,
    symbols: SymbolTable<T>,
    patterns: HashMap<PatternKey, PatternStats>,
    recent: VecDeque<Symbol>,
    next_sequence: u64,
    last_prediction: Option<Symbol>,
    success_rate: f64,
    substitutions: u64,
}

impl<T> Predictive<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    pub fn new(config: PredictiveConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            symbols: SymbolTable { values: Vec::new() },
            patterns: HashMap::new(),
            recent: VecDeque::new(),
            next_sequence: 0,
            last_prediction: None,
            success_rate: INITIAL_SUCCESS_RATE,
            substitutions: 0,
        })
    }

    pub fn config(&self) -> &PredictiveConfig {
        &self.config
    }

    /// Rolling accuracy of past best guesses.
    pub fn success_rate(&self) -> f64 {
        self.success_rate
    }

    pub fn pattern_count(&self) -> usize {
        self.patterns.len()
    }

    /// Number of distinct values currently interned.
    pub fn symbol_count(&self) -> usize {
        self.symbols.values.len()
    }

    /// Number of times a predicted value replaced the proposal.
    pub fn substitutions(&self) -> u64 {
        self.substitutions
    }

    /// Confidence threshold after adjusting for `context`.
    pub fn threshold(&self, context: &ContextSnapshot) -> f64 {
        let shift = context
            .mean()
            .map(|mean| (0.5 - mean) * CONTEXT_SWING)
            .unwrap_or(0.0);
        (self.config.confidence_threshold + shift).clamp(MIN_THRESHOLD, MAX_THRESHOLD)
    }

    /// Score the last guess, learn from `history`, and pick the value to
    /// commit. `history` is expected to end with the proposal.
    pub fn optimize(
        &mut self,
        proposed: T,
        history: &TransitionLog<T>,
        context: &ContextSnapshot,
    ) -> Result<Decision<T>> {
        if let Some(latest) = history.latest() {
            if latest.sequence + 1 < self.next_sequence {
                return Err(Error::HistoryRewound {
                    newest: latest.sequence,
                    consumed: self.next_sequence - 1,
                });
            }
        }

        let proposed_symbol = self.symbols.intern(&proposed);
        if let Some(predicted) = self.last_prediction.take() {
            let hit = if predicted == proposed_symbol { 0.1 } else { 0.0 };
            self.success_rate = self.success_rate * 0.9 + hit;
        }

        self.fold(history);

        let candidate = self.predict();
        self.last_prediction = candidate.map(|c| c.symbol);

        let threshold = self.threshold(context);
        let substitute = candidate
            .filter(|c| c.score > threshold && c.symbol != proposed_symbol)
            .and_then(|c| self.symbols.resolve(c.symbol).cloned().map(|value| (c, value)));

        let decision = match substitute {
            Some((candidate, value)) => {
                self.substitutions += 1;
                tracing::debug!(
                    length = candidate.length,
                    confidence = candidate.confidence,
                    score = candidate.score,
                    threshold,
                    "substituting predicted value"
                );
                Decision::Commit(value)
            }
            None => Decision::Commit(proposed),
        };

        self.compact_if_needed();
        Ok(decision)
    }

    /// Fold transitions not seen yet into the dictionary.
    fn fold(&mut self, history: &TransitionLog<T>) {
        let half_life = self.config.half_life();
        let max_length = self.config.max_pattern_length;
        let fresh: Vec<(u64, T, Instant)> = history
            .since(self.next_sequence)
            .map(|t| (t.sequence, t.to.clone(), t.timestamp))
            .collect();

        for (sequence, value, timestamp) in fresh {
            if sequence > self.next_sequence && !self.recent.is_empty() {
                // Entries were evicted before we saw them; runs across the
                // gap never happened.
                self.recent.clear();
            }
            let symbol = self.symbols.intern(&value);

            for length in 2..=max_length.min(self.recent.len()) {
                let key: PatternKey = self.recent.iter().skip(self.recent.len() - length).copied().collect();
                self.observe(key, symbol, timestamp, half_life);
            }

            self.recent.push_back(symbol);
            if self.recent.len() > max_length {
                self.recent.pop_front();
            }
            self.next_sequence = sequence + 1;
        }
    }

    fn observe(&mut self, key: PatternKey, next: Symbol, now: Instant, half_life: Option<Duration>) {
        if !self.patterns.contains_key(&key) && self.patterns.len() >= self.config.max_patterns {
            self.evict(now, half_life);
        }
        let stats = self.patterns.entry(key).or_insert_with(|| PatternStats::new(now));
        stats.age(now, half_life);
        stats.record(next, now, self.config.max_followers);
    }

    fn evict(&mut self, now: Instant, half_life: Option<Duration>) {
        let weakest = self
            .patterns
            .iter()
            .map(|(key, stats)| (stats.retention(now, half_life), stats.last_seen, key))
            .min_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)))
            .map(|(_, _, key)| key.clone());
        if let Some(key) = weakest {
            self.patterns.remove(&key);
        }
    }

    /// Longest run ending at the newest value that has a known follower.
    fn predict(&self) -> Option<Candidate> {
        let max_length = self.config.max_pattern_length;
        let reliability = 0.5 + 0.5 * self.success_rate;

        for length in (2..=max_length.min(self.recent.len())).rev() {
            let key: PatternKey = self.recent.iter().skip(self.recent.len() - length).copied().collect();
            let Some(stats) = self.patterns.get(&key) else {
                continue;
            };
            if stats.total <= 0.0 {
                continue;
            }
            if let Some((symbol, count)) = stats.best() {
                let confidence = count / stats.total;
                let score = confidence * (length as f64 / max_length as f64) * reliability;
                return Some(Candidate {
                    symbol,
                    length,
                    confidence,
                    score,
                });
            }
        }
        None
    }

    /// Size the symbol table may reach before it is compacted.
    ///
    /// Twice the number of symbols that can be referenced at once: every
    /// pattern key and follower, the recent window and the pending guess.
    pub fn symbol_limit(&self) -> usize {
        let config = &self.config;
        let referenced = config.max_patterns * (config.max_pattern_length + config.max_followers)
            + config.max_pattern_length
            + 1;
        (referenced * 2).max(MIN_SYMBOL_LIMIT)
    }

    /// Drop symbols no pattern, run or pending guess refers to.
    fn compact_if_needed(&mut self) {
        if self.symbols.values.len() <= self.symbol_limit() {
            return;
        }

        let mut live = vec![false; self.symbols.values.len()];
        let mut mark = |symbol: Symbol| live[symbol as usize] = true;
        for (key, stats) in &self.patterns {
            key.iter().copied().for_each(&mut mark);
            stats.followers.iter().for_each(|(symbol, _)| mark(*symbol));
        }
        self.recent.iter().copied().for_each(&mut mark);
        if let Some(symbol) = self.last_prediction {
            mark(symbol);
        }

        let mut remap = vec![None; live.len()];
        let mut kept = Vec::new();
        for (old, value) in std::mem::take(&mut self.symbols.values).into_iter().enumerate() {
            if live[old] {
                remap[old] = Some(kept.len() as Symbol);
                kept.push(value);
            }
        }
        let before = remap.len();
        self.symbols.values = kept;

        let translate = |symbol: Symbol| remap[symbol as usize].unwrap_or(symbol);
        self.patterns = std::mem::take(&mut self.patterns)
            .into_iter()
            .map(|(key, mut stats)| {
                for (symbol, _) in &mut stats.followers {
                    *symbol = translate(*symbol);
                }
                (key.into_iter().map(translate).collect(), stats)
            })
            .collect();
        for symbol in &mut self.recent {
            *symbol = translate(*symbol);
        }
        self.last_prediction = self.last_prediction.map(translate);

        tracing::debug!(before, after = self.symbols.values.len(), "symbol table compacted");
    }

    pub fn fresh(&self) -> Self {
        Self {
            config: self.config.clone(),
            symbols: SymbolTable { values: Vec::new() },
            patterns: HashMap::new(),
            recent: VecDeque::new(),
            next_sequence: 0,
            last_prediction: None,
            success_rate: INITIAL_SUCCESS_RATE,
            substitutions: 0,
        }
    }
}

impl<T> std::fmt::Debug for Predictive<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Predictive")
            .field("config", &self.config)
            .field("patterns", &self.patterns.len())
            .field("success_rate", &self.success_rate)
            .finish()
    }
}
