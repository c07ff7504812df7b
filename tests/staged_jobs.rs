//! Producer/consumer flows through the staged job tracker.

use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tollgate::infrastructure::mocks::MockClock;
use tollgate::{
    Error, JobStage, JobTrackerConfig, ReasonCode, StagedJobTracker, SystemClock,
};

#[tokio::test]
async fn test_two_phase_job_reaches_consumers() {
    let tracker: StagedJobTracker<Vec<String>> = StagedJobTracker::new(
        JobTrackerConfig::new(Duration::from_secs(30), Duration::from_secs(300)),
        Arc::new(SystemClock::new()),
    )
    .unwrap();
    let job = tracker.create_job();

    let consumers: Vec<_> = (0..3)
        .map(|_| {
            let tracker = tracker.clone();
            tokio::spawn(async move { tracker.wait_for_completion(job.job_id).await })
        })
        .collect();

    let producer = {
        let tracker = tracker.clone();
        tokio::spawn(async move {
            tracker.update_stage(job.job_id, JobStage::Processing(1), None)?;
            tokio::time::sleep(Duration::from_millis(10)).await;
            tracker.update_stage(
                job.job_id,
                JobStage::PhaseDone(1),
                Some(json!({"items": ["lamp", "chair"]})),
            )?;
            tracker.update_stage(job.job_id, JobStage::Processing(2), None)?;
            tokio::time::sleep(Duration::from_millis(10)).await;
            tracker.update_stage(
                job.job_id,
                JobStage::PhaseDone(2),
                Some(json!({"prices": {"lamp": 40, "chair": 85}})),
            )?;
            tracker.complete(job.job_id, vec!["lamp: 40".to_string(), "chair: 85".to_string()])
        })
    };

    producer.await.unwrap().unwrap();
    for consumer in consumers {
        let result = consumer.await.unwrap().unwrap().unwrap();
        assert_eq!(result.len(), 2);
    }

    let status = tracker.get_status(job.job_id).unwrap();
    assert_eq!(status.stage, JobStage::Done);
    assert_eq!(status.partial["items"], json!(["lamp", "chair"]));
    assert_eq!(status.partial["prices"]["chair"], json!(85));
    assert_eq!(status.waiters, 0);

    let stats = tracker.stats();
    assert_eq!(stats.total_requests, 1);
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.active_requests, 0);
}

#[tokio::test]
async fn test_stalled_job_times_out_after_100ms() {
    let tracker: StagedJobTracker<String> = StagedJobTracker::new(
        JobTrackerConfig::new(Duration::from_millis(100), Duration::from_secs(60)),
        Arc::new(SystemClock::new()),
    )
    .unwrap();
    let job = tracker.create_job();
    tracker
        .update_stage(job.job_id, JobStage::Processing(1), None)
        .unwrap();

    let started = Instant::now();
    let outcome = tracker.wait_for_completion(job.job_id).await;

    assert!(started.elapsed() >= Duration::from_millis(90));
    assert!(matches!(outcome, Err(Error::Timeout { .. })));

    let status = tracker.get_status(job.job_id).unwrap();
    assert_eq!(status.stage, JobStage::Error);
    assert_eq!(status.error.unwrap().reason, ReasonCode::Timeout);
    assert_eq!(tracker.stats().timed_out, 1);

    // A late producer cannot revive the job
    let late = tracker.complete(job.job_id, "too late".to_string()).unwrap_err();
    assert_eq!(late.reason(), ReasonCode::InvalidTransition);
}

#[tokio::test(start_paused = true)]
async fn test_retention_sweep_drops_finished_jobs() {
    let clock = MockClock::new(Instant::now());
    let tracker: StagedJobTracker<String> = StagedJobTracker::new(
        JobTrackerConfig::new(Duration::from_secs(60), Duration::from_secs(120))
            .with_sweep_interval(Duration::from_secs(10)),
        Arc::new(clock.clone()),
    )
    .unwrap();
    let sweeper = tracker.start_sweeper().unwrap();

    let finished = tracker.create_job();
    tracker.complete(finished.job_id, "ok".to_string()).unwrap();
    let failed = tracker.create_job();
    tracker.fail(failed.job_id, "provider returned 500").unwrap();
    let running = tracker.create_job_with_timeout(Duration::from_secs(600));

    clock.advance(Duration::from_secs(121));
    tokio::time::sleep(Duration::from_secs(11)).await;

    assert!(tracker.get_status(finished.job_id).is_none());
    assert!(tracker.get_status(failed.job_id).is_none());
    assert_eq!(
        tracker.get_status(running.job_id).unwrap().stage,
        JobStage::Pending
    );
    assert_eq!(tracker.stats().errored, 1);

    sweeper.shutdown().await.unwrap();
    tracker.stop();
}

#[test]
fn test_stage_names_round_trip_through_status_json() {
    let clock = MockClock::new(Instant::now());
    let tracker: StagedJobTracker<String> =
        StagedJobTracker::new(JobTrackerConfig::default(), Arc::new(clock)).unwrap();
    let job = tracker.create_job();
    let status = tracker
        .update_stage(job.job_id, JobStage::Processing(2), Some(json!({"step": "pricing"})))
        .unwrap();

    let body = serde_json::to_value(&status).unwrap();
    assert_eq!(body["stage"], "PHASE2_PROCESSING");
    assert_eq!(body["partial"]["step"], "pricing");
    assert_eq!("PHASE2_PROCESSING".parse::<JobStage>().unwrap(), JobStage::Processing(2));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_zero_timeout_always_resolves_waiter() {
    let tracker: StagedJobTracker<String> = StagedJobTracker::new(
        JobTrackerConfig::new(Duration::from_secs(30), Duration::from_secs(300)),
        Arc::new(SystemClock::new()),
    )
    .unwrap();

    for _ in 0..500 {
        let creator = tracker.clone();
        let job = tokio::task::spawn_blocking(move || creator.create_job_with_timeout(Duration::ZERO))
            .await
            .unwrap();

        let outcome = tokio::time::timeout(
            Duration::from_millis(200),
            tracker.wait_for_completion(job.job_id),
        )
        .await
        .expect("zero-timeout job never resolved");
        assert!(matches!(outcome, Err(Error::Timeout { .. })));
    }
    assert_eq!(tracker.stats().timed_out, 500);
}
