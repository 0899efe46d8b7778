//! Worker Pool: dispatches whole templates in batches to worker threads
//! over a bounded `crossbeam_channel`, retrieves completed jobs in
//! dispatch order, and merges per-worker accumulators at shutdown.
//!
//! `threads <= 1` runs synchronously on the calling thread (no channel, no
//! spawn) so the single-threaded path has no concurrency overhead at all.

use std::thread;

use crossbeam_channel::{bounded, Receiver, Sender};

use crate::errors::{DemuxError, DemuxResult};
use crate::record_stream::Template;

pub struct Job {
    pub seq: u64,
    pub templates: Vec<Template>,
}

pub struct JobResult {
    pub seq: u64,
    pub templates: Vec<Template>,
}

/// Per-worker mutable state, cloned read-only inputs aside. `A` is the
/// caller's accumulator type (barcode counters, tag-hop table, adapter
/// metrics, ...); it must know how to merge with another instance of
/// itself at shutdown.
pub trait Accumulator: Send + 'static {
    fn merge(&mut self, other: Self);
}

/// Runs `process` over every template in every job, single-threaded when
/// `threads <= 1` and across a bounded worker pool of depth `2 * threads`
/// otherwise. `process` receives the worker's own accumulator and must
/// mutate it in place.
pub fn run<A, F>(
    threads: usize,
    batches: Vec<Vec<Template>>,
    mut accumulator: A,
    process: F,
) -> DemuxResult<(Vec<Template>, A)>
where
    A: Accumulator + Clone,
    F: Fn(&mut Template, &mut A) -> DemuxResult<()> + Send + Sync + 'static,
{
    if threads <= 1 {
        let mut out = Vec::new();
        for mut batch in batches {
            for template in batch.iter_mut() {
                process(template, &mut accumulator)?;
            }
            out.append(&mut batch);
        }
        return Ok((out, accumulator));
    }

    let depth = 2 * threads;
    let (job_tx, job_rx): (Sender<Job>, Receiver<Job>) = bounded(depth);
    let (result_tx, result_rx): (Sender<DemuxResult<JobResult>>, Receiver<DemuxResult<JobResult>>) =
        bounded(depth);

    let process = std::sync::Arc::new(process);
    let seed = accumulator.clone();
    let mut handles = Vec::new();
    for _ in 0..threads {
        let job_rx = job_rx.clone();
        let result_tx = result_tx.clone();
        let process = process.clone();
        let mut local = seed.clone();
        handles.push(thread::spawn(move || {
            while let Ok(job) = job_rx.recv() {
                let mut templates = job.templates;
                let mut failed = None;
                for template in templates.iter_mut() {
                    if let Err(e) = process(template, &mut local) {
                        failed = Some(e);
                        break;
                    }
                }
                let outcome = match failed {
                    Some(e) => Err(e),
                    None => Ok(JobResult { seq: job.seq, templates }),
                };
                if result_tx.send(outcome).is_err() {
                    break;
                }
            }
            local
        }));
    }
    drop(result_tx);

    let dispatcher = thread::spawn({
        let job_tx = job_tx.clone();
        move || {
            for (seq, templates) in batches.into_iter().enumerate() {
                if job_tx.send(Job { seq: seq as u64, templates }).is_err() {
                    break;
                }
            }
        }
    });
    drop(job_tx);

    let mut pending = std::collections::BTreeMap::new();
    let mut next_emit = 0u64;
    let mut ordered = Vec::new();
    let mut first_error: Option<DemuxError> = None;

    for outcome in result_rx.iter() {
        match outcome {
            Ok(result) => {
                pending.insert(result.seq, result.templates);
                while let Some(templates) = pending.remove(&next_emit) {
                    ordered.push(templates);
                    next_emit += 1;
                }
            }
            Err(e) => {
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
    }

    let _ = dispatcher.join();
    for handle in handles {
        if let Ok(local) = handle.join() {
            accumulator.merge(local);
        } else {
            return Err(DemuxError::ThreadPoolFailure(
                "worker thread panicked".to_string(),
            ));
        }
    }

    if let Some(e) = first_error {
        return Err(e);
    }

    let out = ordered.into_iter().flatten().collect();
    Ok((out, accumulator))
}
