use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use sentry::SentryFutureExt;
use sketches_ddsketch::DDSketch;
use subject_cache::config::Config;
use subject_cache::coordinator::LoadCoordinator;
use subject_cache_test::{MockStorage, TransientFallback, subject_cache};
use tokio::sync::Semaphore;

use crate::workloads::{Outcome, PreparedWorkload, WorkloadsConfig, process_payload};

#[derive(Default)]
struct Stats {
    durations: DDSketch,
    outcomes: BTreeMap<Outcome, usize>,
}

pub async fn perform_stresstest(
    config: Config,
    workloads: WorkloadsConfig,
    duration: Duration,
) -> Result<()> {
    let runtime = tokio::runtime::Handle::current();

    // initialize workloads, each with its own backing store and coordinator
    let workloads: Vec<_> = workloads
        .workloads
        .into_iter()
        .map(|workload| {
            let storage = Arc::new(MockStorage::new().with_latency(workload.storage_latency));
            let coordinator = LoadCoordinator::builder(
                subject_cache(),
                storage.clone(),
                TransientFallback::default(),
            )
            .config(&config)
            .build(runtime.clone());

            let cleanup = config.cleanup_interval.map(|interval| {
                coordinator
                    .cleanup_scanner()
                    .spawn_periodic(interval, &runtime)
            });

            let prepared = Arc::new(PreparedWorkload::new(&workload));
            (workload.concurrency, coordinator, storage, prepared, cleanup)
        })
        .collect();

    // warmup: resolve every subject once to make sure caches are warm
    {
        let start = Instant::now();

        let futures = workloads.iter().map(|(_, coordinator, _, workload, _)| {
            let coordinator = coordinator.clone();
            let workload = Arc::clone(workload);
            tokio::spawn(async move {
                for subject in &workload.subjects {
                    coordinator.resolve(&subject.to_string()).await;
                }
            })
        });

        let _results = futures::future::join_all(futures).await;

        println!("Warmup: {:?}", start.elapsed());
    };
    println!();

    // run the workloads concurrently
    let mut tasks = Vec::with_capacity(workloads.len());
    for (concurrency, coordinator, storage, workload, cleanup) in workloads.into_iter() {
        let start = Instant::now();
        let deadline = tokio::time::Instant::from_std(start + duration);

        let task = tokio::spawn(async move {
            let stats = Arc::new(Mutex::new(Stats::default()));
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
                        let workload = Arc::clone(&workload);
                        let coordinator = coordinator.clone();
                        let stats = Arc::clone(&stats);
                        let task_start = Instant::now();

                        let hub = sentry::Hub::new_from_top(sentry::Hub::current());
                        let ctx = sentry::TransactionContext::new("stresstest", "resolve");
                        let transaction = hub.start_transaction(ctx);

                        let future = async move {
                            let outcome = process_payload(&coordinator, &workload).await;

                            transaction.finish();

                            let mut stats = stats.lock().unwrap();
                            stats.durations.add(task_start.elapsed().as_secs_f64());
                            *stats.outcomes.entry(outcome).or_default() += 1;

                            drop(permit);
                        };
                        let future = future.bind_hub(hub);

                        tokio::spawn(future);
                    }
                    _ = &mut sleep => {
                        break;
                    }
                }
            }

            // by acquiring *all* the semaphores, we essentially wait for all outstanding tasks to finish
            let _permits = semaphore.acquire_many(concurrency as u32).await;

            if let Some(cleanup) = cleanup {
                cleanup.abort();
            }

            let stats = std::mem::take(&mut *stats.lock().unwrap());
            let cached = coordinator.cache().all_entries().len();
            (concurrency, stats, storage.fetches(), cached)
        });
        tasks.push(task);
    }

    let finished_tasks = futures::future::join_all(tasks).await;

    for (i, task) in finished_tasks.into_iter().enumerate() {
        let (concurrency, stats, fetches, cached) = task?;
        let Stats {
            durations,
            outcomes,
        } = stats;

        let ops = durations.count();
        let ops_ps = ops as f32 / duration.as_secs_f32();
        println!("Workload {i} (concurrency: {concurrency}): {ops} operations, {ops_ps:.2} ops/s");
        println!("  fetches: {fetches}; cached subjects: {cached}; outcomes: {outcomes:?}");

        if ops == 0 {
            continue;
        }
        let quantile = |q| {
            durations
                .quantile(q)
                .ok()
                .flatten()
                .map(Duration::from_secs_f64)
                .unwrap_or_default()
        };
        let avg = Duration::from_secs_f64(durations.sum().unwrap_or_default() / ops as f64);
        let (p50, p90, p99) = (quantile(0.5), quantile(0.9), quantile(0.99));
        println!("  avg: {avg:.2?}; p50: {p50:.2?}; p90: {p90:.2?}; p99: {p99:.2?}");
    }

    Ok(())
}
