// Rate-limited fetch scheduling.
//
// Google throttles bursts of per-sheet reads, so spreadsheet sub-fetches are
// spaced out on a fixed interval rather than fired all at once. The two
// pieces here are a cancellable delayed operation and a batch runner with
// all-or-nothing semantics.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// A boxed deferred operation as consumed by [`run_spaced`].
pub type SpacedOp<T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send>>;

/// Handle to an operation scheduled to start after a delay.
///
/// Cancellation is cooperative and covers only the delay phase: an operation
/// whose timer has not fired yet never starts, but one that is already
/// running cannot be aborted mid-flight.
pub struct Delayed<T> {
    cancel: Option<oneshot::Sender<()>>,
    handle: JoinHandle<Option<T>>,
}

impl<T> Delayed<T> {
    /// Prevents the operation from starting if its delay has not elapsed.
    pub fn cancel(&mut self) {
        if let Some(tx) = self.cancel.take() {
            let _ = tx.send(());
        }
    }

    /// Waits for the outcome. `None` means the delay was cancelled before
    /// the operation started.
    pub async fn wait(self) -> Option<T> {
        self.handle.await.ok().flatten()
    }
}

/// Schedules `op` to begin no earlier than `delay` from now.
pub fn schedule<F, T>(delay: Duration, op: F) -> Delayed<T>
where
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    let (tx, rx) = oneshot::channel::<()>();
    let handle = tokio::spawn(async move {
        tokio::select! {
            // Check the cancellation side first so a cancel that races the
            // timer always wins and the op never starts.
            biased;
            _ = rx => None,
            _ = tokio::time::sleep(delay) => Some(op.await),
        }
    });
    Delayed {
        cancel: Some(tx),
        handle,
    }
}

/// Runs `ops` with operation `k` (0-indexed) starting no earlier than
/// `(k + 1) * spacing` after the call. Operations run concurrently once
/// their delay elapses; results come back in original list order.
///
/// The batch is all-or-nothing: on the first failure every still-pending
/// delay is cancelled, the remaining started operations are drained, and the
/// first error is returned. No partial results survive a failed batch.
pub async fn run_spaced<T, E>(ops: Vec<SpacedOp<T, E>>, spacing: Duration) -> Result<Vec<T>, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    let total = ops.len();
    if total == 0 {
        return Ok(Vec::new());
    }

    let (tx, mut rx) = mpsc::unbounded_channel::<(usize, Result<T, E>)>();
    let mut delayed: Vec<Delayed<()>> = ops
        .into_iter()
        .enumerate()
        .map(|(k, op)| {
            let tx = tx.clone();
            schedule(spacing * (k as u32 + 1), async move {
                let _ = tx.send((k, op.await));
            })
        })
        .collect();
    drop(tx);

    let mut slots: Vec<Option<T>> = (0..total).map(|_| None).collect();
    let mut first_err: Option<E> = None;

    // The channel closes once every task has either reported or been
    // cancelled (cancelled tasks drop their sender without sending).
    while let Some((k, outcome)) = rx.recv().await {
        match outcome {
            Ok(value) => slots[k] = Some(value),
            Err(err) => {
                if first_err.is_none() {
                    first_err = Some(err);
                    for d in delayed.iter_mut() {
                        d.cancel();
                    }
                }
            }
        }
    }

    // A worker that panicked dropped its sender without ever reporting, so
    // its slot would come up empty. Resurface the panic rather than
    // misreport the batch as complete.
    let mut panicked = None;
    for d in delayed {
        if let Err(join_err) = d.handle.await {
            if join_err.is_panic() && panicked.is_none() {
                panicked = Some(join_err);
            }
        }
    }
    if let Some(join_err) = panicked {
        std::panic::resume_unwind(join_err.into_panic());
    }

    match first_err {
        Some(err) => Err(err),
        None => Ok(slots
            .into_iter()
            .map(|slot| slot.expect("scheduled operation finished without reporting"))
            .collect()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::time::Instant;

    fn op_ok(value: u32) -> SpacedOp<u32, String> {
        Box::pin(async move { Ok(value) })
    }

    #[tokio::test(start_paused = true)]
    async fn results_come_back_in_original_order() {
        // Earlier ops take longer than later ones, so completion order is
        // reversed relative to start order.
        let ops: Vec<SpacedOp<u32, String>> = vec![
            Box::pin(async {
                tokio::time::sleep(Duration::from_millis(500)).await;
                Ok(1)
            }),
            Box::pin(async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok(2)
            }),
            op_ok(3),
        ];

        let results = run_spaced(ops, Duration::from_millis(200)).await.unwrap();
        assert_eq!(results, vec![1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn ops_start_no_earlier_than_their_slot() {
        let base = Instant::now();
        let starts: Arc<tokio::sync::Mutex<Vec<Duration>>> = Arc::default();

        let ops: Vec<SpacedOp<(), String>> = (0..3)
            .map(|_| {
                let starts = starts.clone();
                Box::pin(async move {
                    starts.lock().await.push(base.elapsed());
                    Ok(())
                }) as SpacedOp<(), String>
            })
            .collect();

        run_spaced(ops, Duration::from_millis(200)).await.unwrap();

        let starts = starts.lock().await;
        assert_eq!(starts.len(), 3);
        for (k, started_at) in starts.iter().enumerate() {
            assert!(*started_at >= Duration::from_millis(200 * (k as u64 + 1)));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn failure_cancels_pending_delays() {
        let started = Arc::new(AtomicUsize::new(0));

        let ops: Vec<SpacedOp<(), String>> = (0..5)
            .map(|k| {
                let started = started.clone();
                Box::pin(async move {
                    started.fetch_add(1, Ordering::SeqCst);
                    if k == 2 {
                        Err("sheet fetch blew up".to_string())
                    } else {
                        Ok(())
                    }
                }) as SpacedOp<(), String>
            })
            .collect();

        let err = run_spaced(ops, Duration::from_millis(200))
            .await
            .unwrap_err();
        assert_eq!(err, "sheet fetch blew up");

        // Ops 0-2 started; 3 and 4 had their delays cancelled before firing.
        assert_eq!(started.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_before_delay_prevents_start() {
        let started = Arc::new(AtomicUsize::new(0));
        let flag = started.clone();

        let mut delayed = schedule(Duration::from_millis(100), async move {
            flag.fetch_add(1, Ordering::SeqCst);
        });
        delayed.cancel();

        assert_eq!(delayed.wait().await, None);
        assert_eq!(started.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_after_start_does_not_abort() {
        let mut delayed = schedule(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_millis(500)).await;
            42
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        delayed.cancel();

        assert_eq!(delayed.wait().await, Some(42));
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_op_resurfaces_its_own_panic() {
        let ops: Vec<SpacedOp<u32, String>> = vec![
            op_ok(1),
            Box::pin(async { panic!("boom") }),
        ];

        let join_err = tokio::spawn(run_spaced(ops, Duration::from_millis(200)))
            .await
            .unwrap_err();
        let payload = join_err.into_panic();
        assert_eq!(payload.downcast_ref::<&str>(), Some(&"boom"));
    }

    #[tokio::test]
    async fn empty_batch_is_ok() {
        let results: Vec<u32> = run_spaced::<u32, String>(Vec::new(), Duration::from_millis(200))
            .await
            .unwrap();
        assert!(results.is_empty());
    }
}
