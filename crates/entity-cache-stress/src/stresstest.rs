use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use sketches_ddsketch::DDSketch;
use tokio::sync::Semaphore;

use entity_cache::{
    Config, EntityCache, EntityCacheOptions, MemoryStore, Scheduler, StoreCounters,
};

use crate::workloads::{Player, WorkloadsConfig, process_operation};

struct WorkloadReport {
    concurrency: usize,
    task_durations: DDSketch,
    failures: usize,
    cached: usize,
    stored: usize,
    counters: StoreCounters,
}

pub async fn perform_stresstest(
    config: Config,
    workloads: WorkloadsConfig,
    duration: Duration,
) -> Result<()> {
    // every workload runs against its own cache on top of its own store
    let mut caches = Vec::with_capacity(workloads.workloads.len());
    for _ in &workloads.workloads {
        let store = Arc::new(MemoryStore::<Player>::new());
        let cache = EntityCache::with_store(
            config.cache,
            EntityCacheOptions::new(),
            Arc::clone(&store),
            Scheduler::current(),
        )
        .await
        .context("failed to create entity cache")?;
        caches.push((store, cache));
    }

    // warmup: create every player once, so workloads start with a populated store
    {
        let start = Instant::now();

        let futures = workloads.workloads.iter().zip(&caches).flat_map(|(workload, (_, cache))| {
            (0..workload.keys).map(move |id| async move { cache.get_or_create(&id, |id| Player::new(*id)).await })
        });
        let results = futures::future::join_all(futures).await;
        let failed = results.iter().filter(|r| r.is_err()).count();

        println!("Warmup: {:?} ({} players, {failed} failed)", start.elapsed(), results.len());
    };
    println!();

    // run the workloads concurrently
    let mut tasks = Vec::with_capacity(workloads.workloads.len());
    for (workload, (store, cache)) in workloads.workloads.into_iter().zip(caches) {
        let start = Instant::now();
        let deadline = tokio::time::Instant::from_std(start + duration);

        let task = tokio::spawn(async move {
            let concurrency = workload.concurrency;
            let task_durations = Arc::new(Mutex::new(DDSketch::default()));
            let failures = Arc::new(AtomicUsize::new(0));
            let semaphore = Arc::new(Semaphore::new(concurrency));

            // See <https://docs.rs/tokio/latest/tokio/time/struct.Sleep.html#examples>
            let sleep = tokio::time::sleep_until(deadline);
            tokio::pin!(sleep);

            loop {
                if deadline.elapsed() > Duration::ZERO {
                    break;
                }
                tokio::select! {
                    permit = semaphore.clone().acquire_owned() => {
                        let operation = workload.mix.pick(workload.keys);
                        let cache = cache.clone();
                        let task_durations = Arc::clone(&task_durations);
                        let failures = Arc::clone(&failures);
                        let task_start = Instant::now();

                        tokio::spawn(async move {
                            if let Err(e) = process_operation(&cache, operation).await {
                                failures.fetch_add(1, Ordering::Relaxed);
                                tracing::warn!(error = &e as &dyn std::error::Error, "Operation failed");
                            }

                            task_durations.lock().unwrap().add(task_start.elapsed().as_secs_f64());

                            drop(permit);
                        });
                    }
                    _ = &mut sleep => {
                        break;
                    }
                }
            }

            // by acquiring *all* the semaphores, we essentially wait for all outstanding tasks to finish
            let _permits = semaphore.acquire_many(concurrency as u32).await;

            // flush like on shutdown
            if let Err(e) = cache.persist().await {
                tracing::error!(error = &e as &dyn std::error::Error, "Failed to persist entities");
            }

            let task_durations: DDSketch = {
                let mut task_durations = task_durations.lock().unwrap();
                std::mem::take(&mut task_durations)
            };

            WorkloadReport {
                concurrency,
                task_durations,
                failures: failures.load(Ordering::Relaxed),
                cached: cache.size(),
                stored: store.len(),
                counters: store.counters(),
            }
        });
        tasks.push(task);
    }

    let finished_tasks = futures::future::join_all(tasks).await;

    for (i, task) in finished_tasks.into_iter().enumerate() {
        let WorkloadReport {
            concurrency,
            task_durations,
            failures,
            cached,
            stored,
            counters,
        } = task.context("workload panicked")?;

        let ops = task_durations.count();
        let ops_ps = ops as f32 / duration.as_secs_f32();
        println!(
            "Workload {i} (concurrency: {concurrency}): {ops} operations, {ops_ps:.2} ops/s, {failures} failed"
        );
        if ops > 0 {
            let avg = Duration::from_secs_f64(task_durations.sum().unwrap() / ops as f64);
            let p50 = Duration::from_secs_f64(task_durations.quantile(0.5).unwrap().unwrap());
            let p90 = Duration::from_secs_f64(task_durations.quantile(0.9).unwrap().unwrap());
            let p99 = Duration::from_secs_f64(task_durations.quantile(0.99).unwrap().unwrap());
            println!("  avg: {avg:.2?}; p50: {p50:.2?}; p90: {p90:.2?}; p99: {p99:.2?}");
        }

        println!("  cached entries: {cached}; stored players: {stored}");
        let StoreCounters {
            load_by_id,
            load_many,
            insert,
            insert_or_update,
            batch_insert_or_update,
            delete_by_id,
            ..
        } = counters;
        println!(
            "  loads: {load_by_id}; bulk loads: {load_many}; inserts: {insert}; \
             upserts: {insert_or_update}; batches: {batch_insert_or_update}; deletes: {delete_by_id}"
        );
    }

    Ok(())
}
