//! Admission pipeline in front of a flaky "vision provider".
//!
//! Shows the daily quota, the per-IP rate limit, the breaker opening after
//! repeated provider failures, and identical requests sharing one call.
//!
//! Run with `RUST_LOG=tollgate=debug cargo run --example pipeline`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tollgate::{
    AdmissionConfig, AdmissionPipeline, AdmissionRequest, BoxError, CacheConfig,
    CircuitBreakerConfig, QuotaConfig, RateLimitConfig, SystemClock,
};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tollgate=info")))
        .init();

    let config = AdmissionConfig {
        quota: QuotaConfig::new(8).with_key_prefix("feature:labels:"),
        rate_limit: RateLimitConfig::new(4, Duration::from_secs(1)).with_key_prefix("ip:"),
        breaker: CircuitBreakerConfig::new("vision-provider")
            .with_consecutive_failures(3)
            .with_cooldown(Duration::from_millis(500)),
        cache: CacheConfig::new(Duration::from_secs(60), 100),
        ..AdmissionConfig::default()
    };
    let pipeline: Arc<AdmissionPipeline<String>> =
        Arc::new(AdmissionPipeline::from_config(&config, Arc::new(SystemClock::new()))?);
    pipeline.start_sweepers()?;

    println!("=== Rate limit: 4 requests per second per IP ===\n");
    for i in 1..=6 {
        let request = AdmissionRequest::new("device-1", "203.0.113.7");
        match pipeline.admit(&request) {
            tollgate::Admission::Admitted => println!("request {i}: admitted"),
            tollgate::Admission::Denied(denial) => println!(
                "request {i}: {} (retry after {:.2}s)",
                denial.reason,
                denial.retry_after_seconds.unwrap_or_default()
            ),
        }
    }

    println!("\n=== Coalescing: 10 identical requests, one provider call ===\n");
    let calls = Arc::new(AtomicUsize::new(0));
    let tasks: Vec<_> = (0..10)
        .map(|i| {
            let pipeline = Arc::clone(&pipeline);
            let calls = Arc::clone(&calls);
            tokio::spawn(async move {
                pipeline
                    .execute(
                        &AdmissionRequest::new(format!("device-{}", i + 10), format!("198.51.100.{i}")),
                        "image-sha256:9f86d0",
                        move || async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(200)).await;
                            Ok::<_, BoxError>("cat, sofa, lamp".to_string())
                        },
                    )
                    .await
            })
        })
        .collect();
    for task in tasks {
        task.await??;
    }
    println!("provider calls: {}", calls.load(Ordering::SeqCst));

    println!("\n=== Breaker: three failures open the circuit ===\n");
    for i in 0..5 {
        let outcome = pipeline
            .execute_or_fallback(
                &AdmissionRequest::new(format!("device-{}", i + 30), format!("192.0.2.{i}")),
                &format!("image-{i}"),
                || async { Err::<String, BoxError>("provider returned 502".into()) },
                || "labels unavailable, showing cached defaults".to_string(),
            )
            .await;
        println!("attempt {i}: {outcome:?} (breaker {})", pipeline.breaker().state());
    }

    tokio::time::sleep(Duration::from_millis(600)).await;
    let recovered = pipeline
        .execute(
            &AdmissionRequest::new("device-40", "192.0.2.40"),
            "image-40",
            || async { Ok::<_, BoxError>("dog".to_string()) },
        )
        .await?;
    println!("after cooldown: {recovered} (breaker {})", pipeline.breaker().state());

    println!("\n=== Stats ===\n");
    println!("{}", serde_json::to_string_pretty(&pipeline.stats())?);

    pipeline.shutdown().await?;
    Ok(())
}
