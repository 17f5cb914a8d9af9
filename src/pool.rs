//! Bounded parallel fan-out for per-dataset and per-direction work.
//!
//! Two policies coexist. Per-dataset correction commands are short enough to
//! go through a fixed-size worker pool. Per-direction calibration jobs run
//! for hours and hammer shared I/O when they start, so those are launched
//! with a fixed delay between starts and then left to run concurrently.

use std::thread::scope;

use hifitime::Duration;
use indicatif::{ParallelProgressIterator, ProgressBar};
use log::{error, info};
use rayon::prelude::*;

use crate::error::PipelineError;

/// Apply `worker` to every item using a pool of exactly `pool_size` threads.
///
/// Every item is processed exactly once, independently and in no particular
/// order. All results are accounted for before returning: the first failure
/// is returned and any further failures are logged, never dropped.
pub fn run_bounded<T, F>(
    items: Vec<T>,
    worker: F,
    pool_size: usize,
    progress: ProgressBar,
) -> Result<(), PipelineError>
where
    T: Send,
    F: Fn(T) -> Result<(), PipelineError> + Sync,
{
    if items.is_empty() {
        return Ok(());
    }

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(pool_size.max(1))
        .build()
        .map_err(|e| {
            PipelineError::Configuration(format!(
                "Could not build a worker pool of size {pool_size}: {e}"
            ))
        })?;

    let results: Vec<Result<(), PipelineError>> = pool.install(|| {
        items
            .into_par_iter()
            .progress_with(progress)
            .map(&worker)
            .collect()
    });
    first_failure(results)
}

/// Launch `n_workers` long-lived workers, spacing the starts `delay` apart,
/// then wait for all of them.
///
/// Worker `i` is not started until `i * delay` after the first. The deliberate
/// stagger is admission control for an external resource that tolerates
/// concurrent steady-state load but not simultaneous cold starts. A worker
/// that errors or panics is surfaced after every worker has been joined.
pub fn run_staggered<F>(n_workers: usize, delay: Duration, worker: F) -> Result<(), PipelineError>
where
    F: Fn(usize) -> Result<(), PipelineError> + Sync,
{
    let pause = std::time::Duration::from_secs_f64(delay.to_seconds().max(0.0));

    let results: Vec<Result<(), PipelineError>> = scope(|s| {
        let mut handles = Vec::with_capacity(n_workers);
        for i in 0..n_workers {
            if i > 0 {
                std::thread::sleep(pause);
            }
            info!("Launching worker {i}");
            let worker = &worker;
            handles.push(s.spawn(move || worker(i)));
        }
        handles
            .into_iter()
            .enumerate()
            .map(|(index, handle)| match handle.join() {
                Ok(result) => result,
                Err(_) => Err(PipelineError::WorkerPanic { index }),
            })
            .collect()
    });
    first_failure(results)
}

fn first_failure(results: Vec<Result<(), PipelineError>>) -> Result<(), PipelineError> {
    let mut first = None;
    let mut failures = 0;
    for result in results {
        if let Err(e) = result {
            failures += 1;
            if first.is_none() {
                first = Some(e);
            } else {
                error!("Worker failed: {e}");
            }
        }
    }
    match first {
        None => Ok(()),
        Some(e) => {
            if failures > 1 {
                error!("{failures} workers failed; reporting the first");
            }
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Mutex,
        },
        time::Instant,
    };

    use super::*;

    #[test]
    fn bounded_pool_runs_every_item_exactly_once() {
        let count = AtomicUsize::new(0);
        run_bounded(
            (0..20).collect(),
            |_| {
                count.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
            3,
            ProgressBar::hidden(),
        )
        .unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 20);
    }

    #[test]
    fn bounded_pool_failure_does_not_drop_siblings() {
        let count = AtomicUsize::new(0);
        let result = run_bounded(
            (0..8).collect::<Vec<usize>>(),
            |i| {
                count.fetch_add(1, Ordering::SeqCst);
                if i == 3 {
                    Err(PipelineError::Configuration("task 3 broke".to_string()))
                } else {
                    Ok(())
                }
            },
            2,
            ProgressBar::hidden(),
        );
        // Every task still ran, and the failure surfaced.
        assert_eq!(count.load(Ordering::SeqCst), 8);
        assert!(matches!(result, Err(PipelineError::Configuration(_))));
    }

    #[test]
    fn staggered_starts_are_spaced_by_the_delay() {
        let delay = Duration::from_seconds(0.05);
        let t0 = Instant::now();
        let starts = Mutex::new(Vec::new());
        run_staggered(3, delay, |_| {
            starts.lock().unwrap().push(Instant::now());
            Ok(())
        })
        .unwrap();

        let starts = starts.into_inner().unwrap();
        assert_eq!(starts.len(), 3);
        // The wall-clock floor before the last worker starts is (n-1)*d.
        let last = starts.iter().max().unwrap();
        assert!(last.duration_since(t0) >= std::time::Duration::from_millis(100));
    }

    #[test]
    fn staggered_worker_failure_surfaces_after_join() {
        let count = AtomicUsize::new(0);
        let result = run_staggered(3, Duration::from_seconds(0.0), |i| {
            count.fetch_add(1, Ordering::SeqCst);
            if i == 1 {
                Err(PipelineError::MissingPrerequisite("worker 1".to_string()))
            } else {
                Ok(())
            }
        });
        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert!(matches!(result, Err(PipelineError::MissingPrerequisite(_))));
    }

    #[test]
    fn staggered_worker_panic_is_reported() {
        let result = run_staggered(2, Duration::from_seconds(0.0), |i| {
            if i == 1 {
                panic!("boom");
            }
            Ok(())
        });
        assert!(matches!(result, Err(PipelineError::WorkerPanic { index: 1 })));
    }
}
