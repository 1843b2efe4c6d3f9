// ABOUTME: Integration tests for personality rewriting and typing pacing under seeded randomness.
// ABOUTME: Checks reproducibility per seed and the timing bounds every typing plan must respect.

use chorus_core::config::PacingConfig;
use chorus_core::pacing::{response_delay, total_duration, typing_duration, PacingSimulator};
use chorus_core::personality::{enhance, EnhanceContext, PersonalityProfile, SlangRule, TraitVector};
use chorus_core::rng::{SeededRandom, SequenceRandom};
use std::time::Duration;

fn chatty_profile() -> PersonalityProfile {
    PersonalityProfile {
        traits: TraitVector {
            verbosity: 0.9,
            formality: 0.1,
            positivity: 0.9,
            emoji_rate: 0.6,
            question_frequency: 0.8,
            ..Default::default()
        },
        slang: vec![SlangRule {
            from: "going to".to_string(),
            to: "gonna".to_string(),
        }],
        ..Default::default()
    }
}

// =============================================================================
// Personality
// =============================================================================

#[test]
fn test_enhance_is_reproducible_per_seed() {
    let profile = chatty_profile();
    let body = "I am going to try the new release. It looks solid.";
    for seed in 0..50 {
        let first = enhance(
            body,
            &profile,
            &EnhanceContext::reply(),
            &mut SeededRandom::from_seed(seed),
        );
        let second = enhance(
            body,
            &profile,
            &EnhanceContext::reply(),
            &mut SeededRandom::from_seed(seed),
        );
        assert_eq!(first, second, "seed {}", seed);
        assert!(!first.is_empty());
    }
}

#[test]
fn test_enhance_keeps_empty_drafts_empty() {
    let mut rng = SequenceRandom::constant(0.0);
    assert_eq!(
        enhance("   ", &chatty_profile(), &EnhanceContext::opener(), &mut rng),
        ""
    );
}

#[test]
fn test_sign_off_never_gains_a_question() {
    let profile = PersonalityProfile {
        traits: TraitVector {
            question_frequency: 1.0,
            ..Default::default()
        },
        questions: vec!["Thoughts?".to_string()],
        ..Default::default()
    };

    let mut rng = SequenceRandom::constant(0.0);
    let sign_off = enhance("Good chat.", &profile, &EnhanceContext::sign_off(), &mut rng);
    assert!(!sign_off.contains("Thoughts?"));

    let mut rng = SequenceRandom::constant(0.0);
    let reply = enhance("Good chat.", &profile, &EnhanceContext::reply(), &mut rng);
    assert!(reply.contains("Thoughts?"));
}

#[test]
fn test_slang_applies_to_informal_voice() {
    let mut rng = SequenceRandom::constant(0.0);
    let out = enhance(
        "We are going to ship it",
        &chatty_profile(),
        &EnhanceContext::sign_off(),
        &mut rng,
    );
    assert!(out.contains("gonna"));
    assert!(!out.contains("going to"));
}

#[test]
fn test_only_openers_are_elaborated() {
    let profile = PersonalityProfile {
        traits: TraitVector {
            verbosity: 1.0,
            ..Default::default()
        },
        elaborations: vec!["Long story.".to_string()],
        ..Default::default()
    };

    let mut rng = SequenceRandom::constant(0.0);
    let opener = enhance("Rust 2024 is out.", &profile, &EnhanceContext::opener(), &mut rng);
    assert!(opener.contains("Long story."));

    let mut rng = SequenceRandom::constant(0.0);
    let reply = enhance("Rust 2024 is out.", &profile, &EnhanceContext::reply(), &mut rng);
    assert!(!reply.contains("Long story."));
}

// =============================================================================
// Pacing
// =============================================================================

#[test]
fn test_typing_plans_respect_burst_and_total_bounds() {
    let config = PacingConfig::default();
    let simulator = PacingSimulator::new(config.clone());
    let profile = PersonalityProfile::default();
    let burst_min = Duration::from_millis(config.burst_min_ms);
    let burst_max = Duration::from_millis(config.burst_max_ms);

    for seed in 0..200 {
        let mut rng = SeededRandom::from_seed(seed);
        for length in [1usize, 40, 400, 5_000] {
            let plan = simulator.simulate(length, &profile, &mut rng);
            assert!(!plan.is_empty());

            for segment in &plan {
                assert!(segment.typing >= burst_min && segment.typing <= burst_max);
            }
            assert!(plan.last().unwrap().pause.is_none(), "trailing pause");

            let typing = typing_duration(&plan);
            assert!(typing >= burst_min);
            assert!(typing <= Duration::from_millis(config.max_total_ms));
            assert!(total_duration(&plan) >= typing);
        }
    }
}

#[test]
fn test_empty_message_has_no_typing() {
    let simulator = PacingSimulator::new(PacingConfig::default());
    let mut rng = SeededRandom::from_seed(1);
    assert!(simulator
        .simulate(0, &PersonalityProfile::default(), &mut rng)
        .is_empty());
}

#[test]
fn test_faster_typists_finish_sooner() {
    let config = PacingConfig {
        jitter: 0.0,
        pause_probability: 0.0,
        ..Default::default()
    };
    let simulator = PacingSimulator::new(config);
    let slow = PersonalityProfile {
        typing_speed_cpm: 150.0,
        ..Default::default()
    };
    let fast = PersonalityProfile {
        typing_speed_cpm: 600.0,
        ..Default::default()
    };

    let mut rng = SequenceRandom::constant(0.5);
    let slow_plan = simulator.simulate(60, &slow, &mut rng);
    let fast_plan = simulator.simulate(60, &fast, &mut rng);
    // 60 chars: 24s at 150cpm clamps to 20s, 6s at 600cpm
    assert_eq!(typing_duration(&slow_plan), Duration::from_millis(20_000));
    assert_eq!(typing_duration(&fast_plan), Duration::from_millis(6_000));
}

#[test]
fn test_response_delay_stays_in_range() {
    let min = Duration::from_millis(1_500);
    let max = Duration::from_millis(6_000);
    for seed in 0..100 {
        let delay = response_delay(min, max, &mut SeededRandom::from_seed(seed));
        assert!(delay >= min && delay <= max);
    }
    let fixed = response_delay(max, max, &mut SeededRandom::from_seed(3));
    assert_eq!(fixed, max);
}
