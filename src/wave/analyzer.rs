use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::Arc,
};

use serde::Serialize;

use crate::wave::{
    policy::{ProductPolicy, ScoringPolicy, ShapeMetrics},
    text::{Sentence, jaccard, segment},
};

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WaveMetrics {
    pub curl: f64,
    pub divergence: f64,
    pub potential: f64,
    pub coherence_score: f64,
}

impl WaveMetrics {
    pub const TRIVIAL: Self = Self {
        curl: 0.0,
        divergence: 0.0,
        potential: 0.0,
        coherence_score: 100.0,
    };
}

/// Text in, metrics out. Pure and deterministic; never fails.
#[derive(Clone)]
pub struct CoherenceAnalyzer {
    policy: Arc<dyn ScoringPolicy>,
}

impl Default for CoherenceAnalyzer {
    fn default() -> Self {
        Self::new(Arc::new(ProductPolicy))
    }
}

impl CoherenceAnalyzer {
    pub fn new(policy: Arc<dyn ScoringPolicy>) -> Self {
        Self { policy }
    }

    pub fn policy_name(&self) -> &'static str {
        self.policy.name()
    }

    pub fn analyze(&self, text: &str) -> WaveMetrics {
        let sentences = segment(text);
        if sentences.len() < 2 {
            return WaveMetrics::TRIVIAL;
        }

        let shape = ShapeMetrics {
            curl: curl(&sentences),
            divergence: divergence(&sentences),
            potential: potential(&sentences),
        };
        WaveMetrics {
            curl: shape.curl,
            divergence: shape.divergence,
            potential: shape.potential,
            coherence_score: self.policy.score(&shape),
        }
    }
}

/// Earlier sentences indexed by term. Identical term sets share one slot,
/// so only sentences that overlap the current one are ever scored.
#[derive(Default)]
struct TermIndex<'a> {
    term_ids: HashMap<&'a str, usize>,
    postings: Vec<Vec<usize>>,
    slots: HashMap<Vec<usize>, usize>,
    slot_sizes: Vec<usize>,
    overlap: Vec<usize>,
    touched: Vec<usize>,
}

impl<'a> TermIndex<'a> {
    /// Sorted term ids of `terms` and how many of them are new.
    fn intern(&mut self, terms: &'a BTreeSet<String>) -> (Vec<usize>, usize) {
        let mut fresh = 0;
        let mut ids: Vec<usize> = terms
            .iter()
            .map(|term| {
                let next = self.term_ids.len();
                *self.term_ids.entry(term.as_str()).or_insert_with(|| {
                    fresh += 1;
                    next
                })
            })
            .collect();
        ids.sort_unstable();
        (ids, fresh)
    }

    /// Best Jaccard similarity of `ids` against every indexed slot.
    fn best_match(&mut self, ids: &[usize]) -> f64 {
        if self.slots.contains_key(ids) {
            return 1.0;
        }
        for &term in ids {
            if let Some(slots) = self.postings.get(term) {
                for &slot in slots {
                    if self.overlap[slot] == 0 {
                        self.touched.push(slot);
                    }
                    self.overlap[slot] += 1;
                }
            }
        }

        let mut best = 0.0_f64;
        for slot in self.touched.drain(..) {
            let shared = self.overlap[slot];
            self.overlap[slot] = 0;
            let union = ids.len() + self.slot_sizes[slot] - shared;
            best = best.max(shared as f64 / union as f64);
        }
        best
    }

    fn insert(&mut self, ids: Vec<usize>) {
        if self.slots.contains_key(&ids) {
            return;
        }
        let slot = self.slot_sizes.len();
        if let Some(&max_id) = ids.last()
            && self.postings.len() <= max_id
        {
            self.postings.resize_with(max_id + 1, Vec::new);
        }
        for &term in &ids {
            self.postings[term].push(slot);
        }
        self.slot_sizes.push(ids.len());
        self.overlap.push(0);
        self.slots.insert(ids, slot);
    }
}

/// Mean loop contribution of every sentence after the first: its best
/// Jaccard match against an earlier sentence, scaled by the share of its
/// terms already seen.
fn curl(sentences: &[Sentence]) -> f64 {
    let terms: Vec<BTreeSet<String>> = sentences.iter().map(Sentence::terms).collect();
    let mut index = TermIndex::default();
    let mut total = 0.0;

    for (position, current) in terms.iter().enumerate() {
        let (ids, fresh) = index.intern(current);
        if position > 0 && !ids.is_empty() {
            let best_match = index.best_match(&ids);
            let repeated_share = 1.0 - fresh as f64 / ids.len() as f64;
            total += best_match * repeated_share;
        }
        index.insert(ids);
    }

    (total / (terms.len() - 1) as f64).clamp(0.0, 1.0)
}

/// Sentences that introduce at least one keyword not seen before.
fn progressive(sentences: &[Sentence]) -> Vec<BTreeSet<&str>> {
    let mut seen = BTreeSet::new();
    let mut progressive = Vec::new();
    for sentence in sentences {
        let keywords = sentence.keyword_set();
        if keywords.iter().any(|keyword| !seen.contains(keyword)) {
            seen.extend(keywords.iter().copied());
            progressive.push(keywords);
        }
    }
    progressive
}

/// Mean Jaccard distance between consecutive rolling keyword windows over
/// the progressive sentences.
fn divergence(sentences: &[Sentence]) -> f64 {
    let progressive = progressive(sentences);
    let width = if progressive.len() >= 3 { 2 } else { 1 };
    let windows: Vec<BTreeSet<&str>> = progressive
        .windows(width)
        .map(|group| group.iter().flatten().copied().collect())
        .collect();
    if windows.len() < 2 {
        return 0.0;
    }

    let distance: f64 = windows
        .windows(2)
        .map(|pair| 1.0 - jaccard(&pair[0], &pair[1]))
        .sum();
    (distance / (windows.len() - 1) as f64).clamp(0.0, 1.0)
}

/// Share of early-weighted keyword mass carried by keywords that occur
/// exactly once.
fn potential(sentences: &[Sentence]) -> f64 {
    let mut occurrences: BTreeMap<&str, usize> = BTreeMap::new();
    for sentence in sentences {
        for keyword in &sentence.keywords {
            *occurrences.entry(keyword.as_str()).or_default() += 1;
        }
    }

    let progressive = progressive(sentences);
    let rank_count = progressive.len() as f64;
    let mut introduced_at: BTreeMap<&str, usize> = BTreeMap::new();
    for (rank, keywords) in progressive.iter().enumerate() {
        for &keyword in keywords {
            introduced_at.entry(keyword).or_insert(rank);
        }
    }

    let weight = |rank: usize| 1.0 - rank as f64 / rank_count;
    let (hapax, all) = introduced_at.iter().fold(
        (0.0, 0.0),
        |(hapax, all), (keyword, rank)| {
            let w = weight(*rank);
            let once = occurrences.get(keyword).copied() == Some(1);
            (if once { hapax + w } else { hapax }, all + w)
        },
    );

    if all <= 0.0 {
        return 0.0;
    }
    (hapax / all).clamp(0.0, 1.0)
}
