//! Batch processor integration tests
//!
//! Batch shaping, rate-limit spacing, progress reporting and
//! checkpoint/resume equivalence.

mod helpers;

use cite_common::config::BatchSettings;
use cite_common::{EventBus, RepairEvent};
use cite_repair::services::{BatchOptions, BatchProcessor};
use helpers::memory_store;
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn settings(batch_size: usize, checkpoint_interval: usize) -> BatchSettings {
    BatchSettings {
        batch_size,
        max_concurrent_requests: 10,
        rate_limit_delay_ms: 100,
        checkpoint_interval,
    }
}

fn even_or_fail(n: u32) -> Result<bool, String> {
    if n == 7 {
        Err("item 7 unreachable".to_string())
    } else {
        Ok(n % 2 == 0)
    }
}

// ============================================================================
// Batching
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_twenty_five_items_run_in_three_spaced_batches() {
    let bus = EventBus::new(64);
    let mut rx = bus.subscribe();
    let processor = BatchProcessor::new(settings(10, 0), memory_store()).with_event_bus(bus);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let progress_seen = Arc::clone(&seen);
    let options = BatchOptions::new("scenario-a").with_progress(Arc::new(move |done, total| {
        progress_seen.lock().unwrap().push((done, total));
    }));

    let started = tokio::time::Instant::now();
    let summary = processor
        .process_batch((0..25u32).collect(), &options, |_| async { Ok::<_, String>(true) })
        .await
        .unwrap();

    // Two inter-batch delays of 100 ms
    assert!(started.elapsed() >= Duration::from_millis(200));

    let sizes: Vec<usize> = summary.timing.batches.iter().map(|b| b.size).collect();
    assert_eq!(sizes, vec![10, 10, 5]);
    assert_eq!(summary.processed, 25);
    assert_eq!(summary.succeeded, 25);
    assert!(!summary.stopped);

    let mut event_sizes = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let RepairEvent::BatchCompleted { batch_size, .. } = event {
            event_sizes.push(batch_size);
        }
    }
    assert_eq!(event_sizes, vec![10, 10, 5]);

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 25);
    assert_eq!(seen.last(), Some(&(25, 25)));
    assert!(seen.windows(2).all(|w| w[0].0 < w[1].0));
}

#[tokio::test(start_paused = true)]
async fn test_batch_size_capped_by_concurrency() {
    let mut s = settings(10, 0);
    s.max_concurrent_requests = 4;
    let processor = BatchProcessor::new(s, memory_store());

    let summary = processor
        .process_batch((0..10u32).collect(), &BatchOptions::new("capped"), |_| async {
            Ok::<_, String>(true)
        })
        .await
        .unwrap();

    let sizes: Vec<usize> = summary.timing.batches.iter().map(|b| b.size).collect();
    assert_eq!(sizes, vec![4, 4, 2]);
}

// ============================================================================
// Checkpoints
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_resume_after_stop_matches_uninterrupted_run() {
    let items: Vec<u32> = (0..25).collect();
    let options = BatchOptions::new("resumable");

    let reference = BatchProcessor::new(settings(5, 5), memory_store())
        .process_batch(items.clone(), &options, |n| async move { even_or_fail(n) })
        .await
        .unwrap();

    let processor = BatchProcessor::new(settings(5, 5), memory_store());
    let interrupted = processor
        .process_batch(items, &options, |n| {
            if n == 12 {
                processor.stop();
            }
            async move { even_or_fail(n) }
        })
        .await
        .unwrap();

    assert!(interrupted.stopped);
    assert_eq!(interrupted.processed, 15);

    let checkpoint = processor
        .checkpoint::<u32, bool>("resumable")
        .await
        .unwrap()
        .expect("checkpoint saved on stop");
    assert_eq!(checkpoint.processed_count, 15);
    assert_eq!(checkpoint.remaining_items, (15..25).collect::<Vec<u32>>());
    assert!(checkpoint.is_consistent());

    let resumed = processor
        .resume_processing(&options, |n: u32| async move { even_or_fail(n) })
        .await
        .unwrap();

    assert!(resumed.resumed);
    assert_eq!(resumed.processed, 25);
    assert_eq!(resumed.results, reference.results);
    assert_eq!(resumed.errors, reference.errors);
    assert_eq!(resumed.succeeded, reference.succeeded);
    assert_eq!(resumed.failed, reference.failed);

    // Finished runs clear their checkpoint
    assert!(processor
        .checkpoint::<u32, bool>("resumable")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test(start_paused = true)]
async fn test_checkpoints_written_at_interval() {
    let bus = EventBus::new(64);
    let mut rx = bus.subscribe();
    let processor = BatchProcessor::new(settings(5, 10), memory_store()).with_event_bus(bus);

    processor
        .process_batch((0..25u32).collect(), &BatchOptions::new("periodic"), |_| async {
            Ok::<_, String>(true)
        })
        .await
        .unwrap();

    let mut saved_at = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let RepairEvent::CheckpointSaved { processed, .. } = event {
            saved_at.push(processed);
        }
    }
    assert_eq!(saved_at, vec![10, 20]);
}

// ============================================================================
// Pause / resume
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_pause_holds_next_batch_until_resumed() {
    let processor = BatchProcessor::new(settings(2, 0), memory_store());
    let options = BatchOptions::new("paused");

    let run = processor.process_batch((0..6u32).collect(), &options, |n| {
        if n == 1 {
            processor.pause();
        }
        async { Ok::<_, String>(true) }
    });
    let resume_later = async {
        tokio::time::sleep(Duration::from_secs(5)).await;
        processor.resume();
    };

    let started = tokio::time::Instant::now();
    let (summary, ()) = tokio::join!(run, resume_later);
    let summary = summary.unwrap();

    assert!(started.elapsed() >= Duration::from_secs(5));
    assert_eq!(summary.processed, 6);
    assert!(!summary.stopped);
}
