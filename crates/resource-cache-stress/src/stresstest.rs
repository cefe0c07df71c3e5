use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use anyhow::Result;
use sentry::SentryFutureExt;
use sketches_ddsketch::DDSketch;
use tokio::sync::Semaphore;

use resource_cache::ResourceCache;
use resource_cache::config::Config;

use crate::workloads::{WorkloadsConfig, prepare_workload, process_workload};

pub async fn perform_stresstest(
    config: Config,
    workloads: WorkloadsConfig,
    duration: Duration,
) -> Result<()> {
    let runtime = tokio::runtime::Handle::current();
    let cache = ResourceCache::new(config.cache, runtime);
    cache.start();

    let workloads: Vec<_> = workloads
        .workloads
        .into_iter()
        .enumerate()
        .map(|(i, workload)| Arc::new(prepare_workload(i, workload)))
        .collect();

    // run the workloads concurrently
    let mut tasks = Vec::with_capacity(workloads.len());
    for workload in workloads.iter() {
        let start = Instant::now();
        let deadline = tokio::time::Instant::from_std(start + duration);
        let cache = cache.clone();
        let workload = Arc::clone(workload);

        let task = tokio::spawn(async move {
            let concurrency = workload.concurrency.max(1);
            let task_durations = Arc::new(Mutex::new(DDSketch::default()));
            let failures = Arc::new(AtomicUsize::new(0));
            let semaphore = Arc::new(Semaphore::new(concurrency));

            // See <https://docs.rs/tokio/latest/tokio/time/struct.Sleep.html#examples>
            let sleep = tokio::time::sleep_until(deadline);
            tokio::pin!(sleep);

            loop {
                tokio::select! {
                    permit = semaphore.clone().acquire_owned() => {
                        let workload = Arc::clone(&workload);
                        let cache = cache.clone();
                        let task_durations = Arc::clone(&task_durations);
                        let failures = Arc::clone(&failures);
                        let task_start = Instant::now();

                        let hub = sentry::Hub::new_from_top(sentry::Hub::current());
                        let future = async move {
                            if !process_workload(&cache, &workload).await {
                                failures.fetch_add(1, Ordering::Relaxed);
                            }

                            task_durations
                                .lock()
                                .unwrap_or_else(PoisonError::into_inner)
                                .add(task_start.elapsed().as_secs_f64());

                            drop(permit);
                        };

                        tokio::spawn(future.bind_hub(hub));
                    }
                    _ = &mut sleep => {
                        break;
                    }
                }
            }

            // by acquiring *all* the semaphores, we essentially wait for all outstanding tasks to finish
            let _permits = semaphore.acquire_many(concurrency as u32).await;

            let task_durations: DDSketch = {
                let mut task_durations = task_durations
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                std::mem::take(&mut *task_durations)
            };

            (concurrency, task_durations, failures.load(Ordering::Relaxed))
        });
        tasks.push(task);
    }

    let finished_tasks = futures::future::join_all(tasks).await;
    cache.stop().await;

    for (i, (task, workload)) in finished_tasks.into_iter().zip(&workloads).enumerate() {
        let (concurrency, task_durations, failures) = task?;

        let ops = task_durations.count();
        let ops_ps = ops as f64 / duration.as_secs_f64();
        let fetches = workload.fetches();
        println!(
            "Workload {i} (concurrency: {concurrency}): {ops} operations, {ops_ps:.2} ops/s, \
             {fetches} fetches, {failures} failed reads"
        );

        if ops == 0 {
            continue;
        }
        let quantile = |q| {
            let secs = task_durations.quantile(q).ok().flatten().unwrap_or_default();
            Duration::from_secs_f64(secs)
        };
        let avg = Duration::from_secs_f64(task_durations.sum().unwrap_or_default() / ops as f64);
        let (p50, p90, p99) = (quantile(0.5), quantile(0.9), quantile(0.99));
        println!("  avg: {avg:.2?}; p50: {p50:.2?}; p90: {p90:.2?}; p99: {p99:.2?}");
    }

    println!();
    println!("Live entries: {}", cache.entry_count());

    Ok(())
}
