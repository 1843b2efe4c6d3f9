// ABOUTME: Tracks who this agent has @-mentioned and when, enforcing a per-subject cooldown.
// ABOUTME: Ranks mention candidates by recency and relevance under separate agent and human policies.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::config::{TagPolicy, TaggingConfig};
use crate::rng::RandomSource;

/// Whether a subject is another agent or a human participant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubjectKind {
    Agent,
    Human,
}

impl TaggingConfig {
    pub fn policy(&self, kind: SubjectKind) -> &TagPolicy {
        match kind {
            SubjectKind::Agent => &self.agents,
            SubjectKind::Human => &self.humans,
        }
    }
}

/// One @-mention, append-only
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaggingRecord {
    pub subject_id: String,
    pub tagged_by: String,
    pub at: DateTime<Utc>,
}

/// A subject that could be mentioned in the next message
#[derive(Debug, Clone, PartialEq)]
pub struct TagCandidate {
    pub subject_id: String,
    pub kind: SubjectKind,
    /// Topic relevance in [0, 1]
    pub relevance: f64,
}

#[derive(Debug, Clone)]
pub struct TaggingTracker {
    agent_id: String,
    config: TaggingConfig,
    records: Vec<TaggingRecord>,
    /// Most recent tag by this agent per subject
    last_tagged: HashMap<String, DateTime<Utc>>,
    /// When each subject last spoke
    last_seen: HashMap<String, DateTime<Utc>>,
}

impl TaggingTracker {
    pub fn new(agent_id: impl Into<String>, config: TaggingConfig) -> Self {
        Self {
            agent_id: agent_id.into(),
            config,
            records: Vec::new(),
            last_tagged: HashMap::new(),
            last_seen: HashMap::new(),
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// True when this agent has not tagged `subject_id` within the cooldown.
    ///
    /// For a tag at `t` this is false on `[t, t + cooldown)` and true from
    /// `t + cooldown` on.
    pub fn can_tag(&self, subject_id: &str, kind: SubjectKind, now: DateTime<Utc>) -> bool {
        match self.last_tagged.get(subject_id) {
            Some(at) => now >= *at + self.config.policy(kind).cooldown(),
            None => true,
        }
    }

    /// Record a mention. Only call once the message carrying it was sent.
    pub fn record_tag(&mut self, subject_id: &str, tagged_by: &str, at: DateTime<Utc>) {
        self.records.push(TaggingRecord {
            subject_id: subject_id.to_string(),
            tagged_by: tagged_by.to_string(),
            at,
        });
        if tagged_by == self.agent_id {
            let entry = self.last_tagged.entry(subject_id.to_string()).or_insert(at);
            if at > *entry {
                *entry = at;
            }
        }
        tracing::debug!(
            agent_id = %self.agent_id,
            subject_id = %subject_id,
            tagged_by = %tagged_by,
            "Tag recorded"
        );
    }

    /// Note that `subject_id` spoke at `at`, feeding the recency score
    pub fn note_activity(&mut self, subject_id: &str, at: DateTime<Utc>) {
        let entry = self.last_seen.entry(subject_id.to_string()).or_insert(at);
        if at > *entry {
            *entry = at;
        }
    }

    pub fn records(&self) -> &[TaggingRecord] {
        &self.records
    }

    /// Recency in [0, 1]: 1 for just-seen, halving every half-life, 0 if never seen
    pub fn recency(&self, subject_id: &str, policy: &TagPolicy, now: DateTime<Utc>) -> f64 {
        let Some(seen) = self.last_seen.get(subject_id) else {
            return 0.0;
        };
        let elapsed = (now - *seen).num_milliseconds().max(0) as f64 / 1000.0;
        let half_life = policy.recency_half_life_secs.max(1) as f64;
        0.5_f64.powf(elapsed / half_life)
    }

    /// Pick subjects to mention: filter by cooldown, score, add jitter, take the top N.
    ///
    /// Agents and humans are ranked together but each is scored and capped by
    /// its own policy.
    pub fn select_targets<R: RandomSource>(
        &self,
        candidates: &[TagCandidate],
        now: DateTime<Utc>,
        rng: &mut R,
    ) -> Vec<String> {
        let mut scored: Vec<(f64, &TagCandidate)> = Vec::new();
        for candidate in candidates {
            if candidate.subject_id == self.agent_id
                || !self.can_tag(&candidate.subject_id, candidate.kind, now)
            {
                continue;
            }
            let policy = self.config.policy(candidate.kind);
            let score = policy.recency_weight * self.recency(&candidate.subject_id, policy, now)
                + policy.relevance_weight * candidate.relevance.clamp(0.0, 1.0)
                + rng.range_f64(0.0, policy.jitter);
            scored.push((score, candidate));
        }
        scored.sort_by(|a, b| b.0.total_cmp(&a.0));

        let mut taken: HashMap<SubjectKind, usize> = HashMap::new();
        let mut selected = Vec::new();
        for (_, candidate) in scored {
            let cap = self.config.policy(candidate.kind).max_tags;
            let count = taken.entry(candidate.kind).or_insert(0);
            if *count >= cap || selected.contains(&candidate.subject_id) {
                continue;
            }
            *count += 1;
            selected.push(candidate.subject_id.clone());
        }
        selected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rng::SequenceRandom;
    use chrono::Duration;

    fn tracker() -> TaggingTracker {
        TaggingTracker::new("vc", TaggingConfig::default())
    }

    fn candidate(id: &str, kind: SubjectKind, relevance: f64) -> TagCandidate {
        TagCandidate {
            subject_id: id.to_string(),
            kind,
            relevance,
        }
    }

    #[test]
    fn test_cooldown_boundaries() {
        let mut tracker = tracker();
        let t = Utc::now();
        tracker.record_tag("eth", "vc", t);

        assert!(!tracker.can_tag("eth", SubjectKind::Agent, t + Duration::seconds(1)));
        assert!(!tracker.can_tag("eth", SubjectKind::Agent, t + Duration::seconds(86_399)));
        assert!(tracker.can_tag("eth", SubjectKind::Agent, t + Duration::seconds(86_400)));
        assert!(tracker.can_tag("mo", SubjectKind::Agent, t));
    }

    #[test]
    fn test_tags_by_others_do_not_block() {
        let mut tracker = tracker();
        let t = Utc::now();
        tracker.record_tag("eth", "mo", t);
        assert!(tracker.can_tag("eth", SubjectKind::Agent, t + Duration::seconds(1)));
        assert_eq!(tracker.records().len(), 1);
    }

    #[test]
    fn test_human_policy_is_separate() {
        let mut config = TaggingConfig::default();
        config.humans.cooldown_secs = 60;
        let mut tracker = TaggingTracker::new("vc", config);
        let t = Utc::now();
        tracker.record_tag("alice", "vc", t);
        assert!(tracker.can_tag("alice", SubjectKind::Human, t + Duration::seconds(60)));
        assert!(!tracker.can_tag("alice", SubjectKind::Agent, t + Duration::seconds(60)));
    }

    #[test]
    fn test_select_respects_cap_and_cooldown() {
        let mut tracker = tracker();
        let now = Utc::now();
        tracker.record_tag("eth", "vc", now - Duration::seconds(10));

        let mut rng = SequenceRandom::constant(0.0);
        let picked = tracker.select_targets(
            &[
                candidate("eth", SubjectKind::Agent, 1.0),
                candidate("mo", SubjectKind::Agent, 0.9),
                candidate("kit", SubjectKind::Agent, 0.5),
                candidate("zed", SubjectKind::Agent, 0.2),
                candidate("vc", SubjectKind::Agent, 1.0),
            ],
            now,
            &mut rng,
        );
        assert_eq!(picked, vec!["mo", "kit"]);
    }

    #[test]
    fn test_recency_decays() {
        let mut tracker = tracker();
        let now = Utc::now();
        let policy = TagPolicy::default();
        tracker.note_activity("eth", now - Duration::seconds(3600));
        let r = tracker.recency("eth", &policy, now);
        assert!((r - 0.5).abs() < 1e-9);
        assert_eq!(tracker.recency("nobody", &policy, now), 0.0);
    }
}
