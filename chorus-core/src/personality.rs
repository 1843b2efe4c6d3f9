// ABOUTME: Personality profiles and the seedable transform that rewrites drafts in an agent's voice.
// ABOUTME: Each rewrite step is gated by its own trait-derived probability drawn from a RandomSource.

use anyhow::Result;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::rng::RandomSource;

const DEFAULT_ELABORATIONS: &[&str] = &[
    "There's a lot more to it than people think.",
    "I keep coming back to that idea.",
    "Honestly it's been on my mind all week.",
];
const DEFAULT_POSITIVE_CLOSERS: &[&str] = &["Love this.", "This is great.", "So good."];
const DEFAULT_DRY_CLOSERS: &[&str] = &["Anyway.", "Just saying.", "We'll see."];
const DEFAULT_QUESTIONS: &[&str] = &[
    "What do you think?",
    "Anyone else?",
    "Am I wrong here?",
];
const DEFAULT_UPBEAT_EMOJIS: &[&str] = &["😄", "🔥", "✨", "🙌"];
const DEFAULT_MUTED_EMOJIS: &[&str] = &["🤔", "😐", "🙃"];

/// Scales how readily low formality turns into slang
const SLANG_SCALE: f64 = 0.8;
/// Scales closing-remark probability by distance from neutral positivity
const CLOSER_SCALE: f64 = 0.6;
/// Scales trailing-question probability
const QUESTION_SCALE: f64 = 0.5;

/// Bounded trait vector; every value lives in [0, 1].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TraitVector {
    pub verbosity: f64,
    pub formality: f64,
    pub positivity: f64,
    pub emoji_rate: f64,
    pub interruption_tendency: f64,
    pub topic_drift: f64,
    pub question_frequency: f64,
}

impl Default for TraitVector {
    fn default() -> Self {
        Self {
            verbosity: 0.5,
            formality: 0.5,
            positivity: 0.5,
            emoji_rate: 0.2,
            interruption_tendency: 0.3,
            topic_drift: 0.2,
            question_frequency: 0.3,
        }
    }
}

impl TraitVector {
    fn named(&self) -> [(&'static str, f64); 7] {
        [
            ("verbosity", self.verbosity),
            ("formality", self.formality),
            ("positivity", self.positivity),
            ("emoji_rate", self.emoji_rate),
            ("interruption_tendency", self.interruption_tendency),
            ("topic_drift", self.topic_drift),
            ("question_frequency", self.question_frequency),
        ]
    }

    pub fn validate(&self) -> Result<()> {
        for (name, value) in self.named() {
            if !(0.0..=1.0).contains(&value) || value.is_nan() {
                anyhow::bail!("personality trait {} must be within [0, 1], got {}", name, value);
            }
        }
        Ok(())
    }
}

/// Prefix/suffix templates spoken in this agent's voice
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VoicePatterns {
    pub prefixes: Vec<String>,
    pub suffixes: Vec<String>,
    /// Base probability of inserting a prefix or suffix
    pub frequency: f64,
}

impl Default for VoicePatterns {
    fn default() -> Self {
        Self {
            prefixes: Vec::new(),
            suffixes: Vec::new(),
            frequency: 0.25,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlangRule {
    pub from: String,
    pub to: String,
}

/// Per-agent personality, immutable for the life of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersonalityProfile {
    pub traits: TraitVector,
    /// Interest vocabulary used for relevance scoring
    pub interests: Vec<String>,
    pub voice: VoicePatterns,
    pub slang: Vec<SlangRule>,
    pub emojis: Vec<String>,
    pub positive_closers: Vec<String>,
    pub dry_closers: Vec<String>,
    pub questions: Vec<String>,
    pub elaborations: Vec<String>,
    /// Typing speed in characters per minute
    pub typing_speed_cpm: f64,
}

impl Default for PersonalityProfile {
    fn default() -> Self {
        Self {
            traits: TraitVector::default(),
            interests: Vec::new(),
            voice: VoicePatterns::default(),
            slang: Vec::new(),
            emojis: Vec::new(),
            positive_closers: Vec::new(),
            dry_closers: Vec::new(),
            questions: Vec::new(),
            elaborations: Vec::new(),
            typing_speed_cpm: 300.0,
        }
    }
}

impl PersonalityProfile {
    pub fn validate(&self) -> Result<()> {
        self.traits.validate()?;
        if !(0.0..=1.0).contains(&self.voice.frequency) {
            anyhow::bail!(
                "voice.frequency must be within [0, 1], got {}",
                self.voice.frequency
            );
        }
        if self.typing_speed_cpm <= 0.0 || !self.typing_speed_cpm.is_finite() {
            anyhow::bail!(
                "typing_speed_cpm must be positive, got {}",
                self.typing_speed_cpm
            );
        }
        Ok(())
    }
}

/// Situation the draft is being sent in.
#[derive(Debug, Clone, Default)]
pub struct EnhanceContext {
    /// Replying to someone rather than opening; replies are never elaborated
    pub is_reply: bool,
    /// Trailing questions are allowed (off for sign-offs)
    pub allow_question: bool,
}

impl EnhanceContext {
    pub fn opener() -> Self {
        Self {
            is_reply: false,
            allow_question: true,
        }
    }

    pub fn reply() -> Self {
        Self {
            is_reply: true,
            allow_question: true,
        }
    }

    pub fn sign_off() -> Self {
        Self {
            is_reply: true,
            allow_question: false,
        }
    }
}

/// Rewrite `body` in the voice described by `profile`.
///
/// Deterministic for a given random source state. Empty input stays empty.
pub fn enhance<R: RandomSource>(
    body: &str,
    profile: &PersonalityProfile,
    context: &EnhanceContext,
    rng: &mut R,
) -> String {
    let body = body.trim();
    if body.is_empty() {
        return String::new();
    }
    let traits = &profile.traits;

    let mut text = adjust_length(body, profile, !context.is_reply, rng);
    text = substitute_slang(&text, profile, rng);

    let voice_p = profile.voice.frequency * (1.0 - traits.formality * 0.5);
    if !profile.voice.prefixes.is_empty() && rng.chance(voice_p) {
        if let Some(prefix) = rng.pick(&profile.voice.prefixes) {
            text = format!("{} {}", prefix.trim(), text);
        }
    }
    if !profile.voice.suffixes.is_empty() && rng.chance(voice_p) {
        if let Some(suffix) = rng.pick(&profile.voice.suffixes) {
            text = format!("{} {}", text, suffix.trim());
        }
    }

    if traits.positivity >= 0.6 && rng.chance((traits.positivity - 0.5) * CLOSER_SCALE) {
        if let Some(closer) = pick_or_default(rng, &profile.positive_closers, DEFAULT_POSITIVE_CLOSERS)
        {
            text = format!("{} {}", text, closer);
        }
    } else if traits.positivity <= 0.3 && rng.chance((0.5 - traits.positivity) * CLOSER_SCALE) {
        if let Some(closer) = pick_or_default(rng, &profile.dry_closers, DEFAULT_DRY_CLOSERS) {
            text = format!("{} {}", text, closer);
        }
    }

    if context.allow_question
        && !text.trim_end().ends_with('?')
        && rng.chance(traits.question_frequency * QUESTION_SCALE)
    {
        if let Some(question) = pick_or_default(rng, &profile.questions, DEFAULT_QUESTIONS) {
            text = format!("{} {}", text, question);
        }
    }

    if traits.formality < 0.2 && rng.chance(0.5) {
        text = casualize(&text);
    }

    if rng.chance(traits.emoji_rate) {
        let palette: &[&str] = if traits.positivity >= 0.5 {
            DEFAULT_UPBEAT_EMOJIS
        } else {
            DEFAULT_MUTED_EMOJIS
        };
        if let Some(emoji) = pick_or_default(rng, &profile.emojis, palette) {
            text = insert_emoji(&text, &emoji, rng);
        }
    }

    text
}

fn pick_or_default<R: RandomSource>(
    rng: &mut R,
    configured: &[String],
    fallback: &[&str],
) -> Option<String> {
    if configured.is_empty() {
        rng.pick(fallback).map(|s| s.to_string())
    } else {
        rng.pick(configured).cloned()
    }
}

/// Truncate to leading sentences when terse, elaborate when verbose and allowed.
fn adjust_length<R: RandomSource>(
    body: &str,
    profile: &PersonalityProfile,
    elaborate: bool,
    rng: &mut R,
) -> String {
    let verbosity = profile.traits.verbosity;
    let sentences = split_sentences(body);

    if verbosity < 0.3 && sentences.len() > 1 && rng.chance(1.0 - verbosity) {
        let keep = if verbosity < 0.15 { 1 } else { 2 };
        return sentences
            .into_iter()
            .take(keep)
            .collect::<Vec<_>>()
            .join(" ");
    }

    if elaborate && verbosity > 0.7 && rng.chance(verbosity - 0.5) {
        if let Some(extra) = pick_or_default(rng, &profile.elaborations, DEFAULT_ELABORATIONS) {
            return format!("{} {}", body, extra);
        }
    }

    body.to_string()
}

fn substitute_slang<R: RandomSource>(text: &str, profile: &PersonalityProfile, rng: &mut R) -> String {
    let p = (1.0 - profile.traits.formality) * SLANG_SCALE;
    let mut out = text.to_string();
    for rule in &profile.slang {
        if rule.from.is_empty() {
            continue;
        }
        let pattern = format!(r"(?i)\b{}\b", regex::escape(&rule.from));
        let Ok(re) = Regex::new(&pattern) else {
            continue;
        };
        if re.is_match(&out) && rng.chance(p) {
            out = re.replace_all(&out, rule.to.as_str()).into_owned();
        }
    }
    out
}

/// Lowercase the first letter and drop a single trailing period
fn casualize(text: &str) -> String {
    let mut chars = text.chars();
    let mut out = match chars.next() {
        Some(first) => first.to_lowercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    };
    if out.ends_with('.') && !out.ends_with("..") {
        out.pop();
    }
    out
}

fn insert_emoji<R: RandomSource>(text: &str, emoji: &str, rng: &mut R) -> String {
    match rng.range_u64(0, 2) {
        0 => format!("{} {}", emoji, text),
        1 => format!("{} {}", text, emoji),
        _ => {
            let sentences = split_sentences(text);
            if sentences.len() < 2 {
                return format!("{} {}", text, emoji);
            }
            let (head, tail) = sentences.split_at(1);
            format!("{} {} {}", head[0], emoji, tail.join(" "))
        }
    }
}

/// Split text on sentence-ending punctuation followed by whitespace.
pub fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        current.push(c);
        if matches!(c, '.' | '!' | '?') {
            let at_boundary = chars.peek().map(|n| n.is_whitespace()).unwrap_or(true);
            if at_boundary {
                let trimmed = current.trim();
                if !trimmed.is_empty() {
                    sentences.push(trimmed.to_string());
                }
                current.clear();
            }
        }
    }
    let trimmed = current.trim();
    if !trimmed.is_empty() {
        sentences.push(trimmed.to_string());
    }
    sentences
}
