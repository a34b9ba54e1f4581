use asset_sync::retry::{PassOutput, RetryOrchestrator, RetryStatus};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

fn forbidden_count(text: &str) -> usize {
    text.matches("SIGNED").count()
}

#[tokio::test]
async fn identical_output_stops_early_as_stuck() {
    // attempt 1 changes the text but leaves 2 forbidden refs; attempt 2 returns it unchanged
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let outcome = RetryOrchestrator::new(3)
        .run(
            "SIGNED SIGNED raw".to_string(),
            |t| forbidden_count(t) == 0,
            move |text: String| {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    let text = if n == 0 { text.replace("raw", "cooked") } else { text };
                    PassOutput {
                        remaining_forbidden: forbidden_count(&text),
                        text,
                        failed: 2,
                        ..PassOutput::default()
                    }
                }
            },
        )
        .await;

    assert_eq!(outcome.status, RetryStatus::Stuck);
    assert_eq!(outcome.attempts_used, 2);
    assert_eq!(calls.load(Ordering::SeqCst), 2, "must not spend the third attempt");
    assert_eq!(outcome.remaining_forbidden, 2);
    assert_eq!(outcome.text, "SIGNED SIGNED cooked");
}

#[tokio::test]
async fn heals_on_a_later_attempt_and_sums_savings() {
    let outcome = RetryOrchestrator::new(3)
        .run(
            "SIGNED SIGNED".to_string(),
            |t| forbidden_count(t) == 0,
            |text: String| async move {
                // each pass fixes one reference
                let text = text.replacen("SIGNED", "/assets/x.png", 1);
                PassOutput {
                    remaining_forbidden: forbidden_count(&text),
                    text,
                    resolved: 1,
                    bytes_saved: 100,
                    ..PassOutput::default()
                }
            },
        )
        .await;

    assert!(outcome.is_success());
    assert_eq!(outcome.attempts_used, 2);
    assert_eq!(outcome.bytes_saved, 200, "savings accumulate across attempts");
    assert_eq!(outcome.attempts.len(), 2);
    assert_eq!(outcome.attempts[0].remaining_forbidden, 1);
    assert_eq!(outcome.attempts[1].remaining_forbidden, 0);
}

#[tokio::test]
async fn always_changing_output_exhausts_and_keeps_best_text() {
    let outcome = RetryOrchestrator::new(3)
        .run(
            "SIGNED".to_string(),
            |t| forbidden_count(t) == 0,
            |text: String| async move {
                let text = format!("{text}+");
                PassOutput {
                    remaining_forbidden: forbidden_count(&text),
                    text,
                    ..PassOutput::default()
                }
            },
        )
        .await;

    assert_eq!(outcome.status, RetryStatus::Exhausted);
    assert_eq!(outcome.attempts_used, 3);
    assert_eq!(outcome.text, "SIGNED+++");
    assert_eq!(outcome.remaining_forbidden, 1);
}

#[tokio::test]
async fn never_exceeds_max_attempts() {
    for max in 1..=5 {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let outcome = RetryOrchestrator::new(max)
            .run(
                String::new(),
                |_| false,
                move |text: String| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async move {
                        PassOutput {
                            text: format!("{text}x"),
                            ..PassOutput::default()
                        }
                    }
                },
            )
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), max);
        assert!(outcome.attempts_used <= max);
    }
}
