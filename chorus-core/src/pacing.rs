// ABOUTME: Typing simulation that turns a message length into bursts of typing and thinking pauses.
// ABOUTME: Only shapes timing of typing actions and sends; never gates whether a message is sent.

use std::time::Duration;

use crate::config::PacingConfig;
use crate::personality::PersonalityProfile;
use crate::rng::RandomSource;

/// One typing burst, optionally followed by a thinking pause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypingSegment {
    pub typing: Duration,
    pub pause: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct PacingSimulator {
    config: PacingConfig,
}

impl PacingSimulator {
    pub fn new(config: PacingConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PacingConfig {
        &self.config
    }

    /// Plan how a message of `message_length` characters gets typed.
    ///
    /// Total typing time follows the profile's characters-per-minute with
    /// relative jitter, clamped to `[burst_min, max_total]`. It is split into
    /// equal bursts that each fall within `[burst_min, burst_max]`; pauses
    /// only ever sit between bursts and are not counted against `max_total`.
    pub fn simulate<R: RandomSource>(
        &self,
        message_length: usize,
        profile: &PersonalityProfile,
        rng: &mut R,
    ) -> Vec<TypingSegment> {
        if message_length == 0 {
            return Vec::new();
        }
        let cfg = &self.config;

        let cpm = profile.typing_speed_cpm.max(1.0);
        let base_ms = message_length as f64 / cpm * 60_000.0;
        let factor = 1.0 + rng.range_f64(-cfg.jitter, cfg.jitter);
        let ceiling = cfg.max_total_ms.max(cfg.burst_min_ms);
        let total_ms = ((base_ms * factor).round() as u64).clamp(cfg.burst_min_ms, ceiling);

        let fewest = total_ms.div_ceil(cfg.burst_max_ms.max(1)).max(1);
        let most = (total_ms / cfg.burst_min_ms.max(1)).max(fewest);
        let bursts = rng.range_u64(fewest, most);

        let share = total_ms / bursts;
        let remainder = total_ms % bursts;
        let mut segments = Vec::with_capacity(bursts as usize);
        for i in 0..bursts {
            let typing_ms = (share + u64::from(i < remainder)).clamp(cfg.burst_min_ms, cfg.burst_max_ms);
            let is_last = i + 1 == bursts;
            let pause = if !is_last && rng.chance(cfg.pause_probability) {
                Some(Duration::from_millis(
                    rng.range_u64(cfg.pause_min_ms, cfg.pause_max_ms),
                ))
            } else {
                None
            };
            segments.push(TypingSegment {
                typing: Duration::from_millis(typing_ms),
                pause,
            });
        }
        segments
    }
}

/// Sum of typing and pause time across a plan
pub fn total_duration(segments: &[TypingSegment]) -> Duration {
    segments
        .iter()
        .map(|s| s.typing + s.pause.unwrap_or_default())
        .sum()
}

/// Sum of typing time only
pub fn typing_duration(segments: &[TypingSegment]) -> Duration {
    segments.iter().map(|s| s.typing).sum()
}

/// Delay before typing begins, uniform in `[min, max]`
pub fn response_delay<R: RandomSource>(min: Duration, max: Duration, rng: &mut R) -> Duration {
    let low = min.as_millis() as u64;
    let high = max.as_millis() as u64;
    Duration::from_millis(rng.range_u64(low, high.max(low)))
}
