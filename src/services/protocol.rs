//! Compensating-action envelope around backend side effects.
//!
//! A metadata row is committed in its pending state first, then the backend
//! effect runs outside any database transaction. On success the caller's
//! `confirm` step commits the confirmed state; on failure the compensation
//! runs and the caller's `abort` step retires the pending row.
//!
//! The whole sequence runs on a detached task: dropping the caller's future
//! after the row was persisted cannot leave it pending, the task still
//! confirms or compensates.

use crate::services::error::{BackendError, MetadataError, MetadataResult};
use futures::{FutureExt, future::BoxFuture};
use std::{any::Any, future::Future, panic::AssertUnwindSafe};
use tracing::{error, warn};

pub type BackendFuture<T> = BoxFuture<'static, Result<T, BackendError>>;

/// A backend effect plus the compensation that undoes it.
pub struct BackendOp<T> {
    effect: BackendFuture<T>,
    rollback: Box<dyn FnOnce() -> BackendFuture<()> + Send>,
}

impl<T: Send + 'static> BackendOp<T> {
    /// `effect` is not polled until the metadata row is persisted.
    pub fn new<F, R, RF>(effect: F, rollback: R) -> Self
    where
        F: Future<Output = Result<T, BackendError>> + Send + 'static,
        R: FnOnce() -> RF + Send + 'static,
        RF: Future<Output = Result<(), BackendError>> + Send + 'static,
    {
        Self {
            effect: effect.boxed(),
            rollback: Box::new(move || rollback().boxed()),
        }
    }

    /// An effect with nothing to compensate.
    pub fn without_rollback<F>(effect: F) -> Self
    where
        F: Future<Output = Result<T, BackendError>> + Send + 'static,
    {
        Self::new(effect, || async { Ok::<_, BackendError>(()) })
    }
}

impl<T> std::fmt::Debug for BackendOp<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendOp").finish_non_exhaustive()
    }
}

/// Runs `op`, then `confirm` with its output or `abort` after compensating.
///
/// `confirm` must not fail the call: a commit failure after a successful
/// backend effect is left for the garbage detector and only logged there.
pub(crate) async fn execute<T, R, C, CF, A, AF>(
    operation: &'static str,
    op: BackendOp<T>,
    confirm: C,
    abort: A,
) -> MetadataResult<R>
where
    T: Send + 'static,
    R: Send + 'static,
    C: FnOnce(T) -> CF + Send + 'static,
    CF: Future<Output = R> + Send + 'static,
    A: FnOnce() -> AF + Send + 'static,
    AF: Future<Output = ()> + Send + 'static,
{
    let BackendOp { effect, rollback } = op;
    let task = tokio::spawn(async move {
        let outcome = match AssertUnwindSafe(effect).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(panic) => Err(BackendError::Panicked(panic_message(panic.as_ref()))),
        };

        match outcome {
            Ok(value) => Ok(confirm(value).await),
            Err(err) => {
                warn!(operation, error = %err, "backend operation failed, rolling back");
                if let Err(rollback_err) = rollback().await {
                    error!(operation, error = %rollback_err, "compensation failed");
                }
                abort().await;
                Err(err)
            }
        }
    });

    match task.await {
        Ok(result) => result.map_err(MetadataError::Backend),
        Err(join_err) => Err(MetadataError::Interrupted(join_err.to_string())),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    };
    use std::time::Duration;

    fn flag() -> Arc<AtomicBool> {
        Arc::new(AtomicBool::new(false))
    }

    #[tokio::test]
    async fn success_runs_confirm_only() {
        let rolled_back = flag();
        let aborted = flag();
        let rb = rolled_back.clone();
        let ab = aborted.clone();

        let op = BackendOp::new(async { Ok::<_, BackendError>(7) }, move || async move {
            rb.store(true, Ordering::SeqCst);
            Ok::<_, BackendError>(())
        });
        let result = execute("test", op, |v: i32| async move { v * 2 }, move || async move {
            ab.store(true, Ordering::SeqCst);
        })
        .await
        .unwrap();

        assert_eq!(result, 14);
        assert!(!rolled_back.load(Ordering::SeqCst));
        assert!(!aborted.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn failure_compensates_and_propagates() {
        let rolled_back = flag();
        let aborted = flag();
        let rb = rolled_back.clone();
        let ab = aborted.clone();

        let op: BackendOp<i32> = BackendOp::new(
            async { Err::<i32, _>(BackendError::Rejected("disk full".into())) },
            move || async move {
                rb.store(true, Ordering::SeqCst);
                Ok::<_, BackendError>(())
            },
        );
        let err = execute("test", op, |v: i32| async move { v }, move || async move {
            ab.store(true, Ordering::SeqCst);
        })
        .await
        .unwrap_err();

        assert!(matches!(err, MetadataError::Backend(BackendError::Rejected(_))));
        assert!(rolled_back.load(Ordering::SeqCst));
        assert!(aborted.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn panicking_effect_is_treated_as_failure() {
        let aborted = flag();
        let ab = aborted.clone();
        let op: BackendOp<i32> = BackendOp::without_rollback(async {
            if true {
                panic!("boom");
            }
            Ok::<_, BackendError>(0)
        });

        let err = execute("test", op, |v: i32| async move { v }, move || async move {
            ab.store(true, Ordering::SeqCst);
        })
        .await
        .unwrap_err();

        assert!(matches!(err, MetadataError::Backend(BackendError::Panicked(ref m)) if m == "boom"));
        assert!(aborted.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn cancelled_caller_still_finishes() {
        let confirmed = flag();
        let cf = confirmed.clone();
        let op = BackendOp::without_rollback(async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok::<_, BackendError>(())
        });

        let call = execute("test", op, move |_| async move {
            cf.store(true, Ordering::SeqCst);
        }, || async {});
        // Drop the caller's future shortly after the effect started.
        let _ = tokio::time::timeout(Duration::from_millis(5), call).await;

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(confirmed.load(Ordering::SeqCst));
    }
}
