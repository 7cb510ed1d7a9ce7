use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use futures::stream::{self, StreamExt};
use log::debug;

use crate::CloudError;

/// Runs `operation` over `items` with at most `concurrency` units in flight.
///
/// Once any unit fails, units that have not started yet are skipped; units
/// already running are left to finish. Every failure is collected and
/// returned through [`CloudError::from_errors`].
pub async fn fan_out<I, T, F, Fut>(items: I, concurrency: usize, operation: F) -> Result<(), CloudError>
where
    I: IntoIterator<Item = T>,
    F: Fn(T) -> Fut,
    Fut: Future<Output = Result<(), CloudError>>,
{
    let failed = AtomicBool::new(false);
    let skipped = AtomicUsize::new(0);
    let (failed_ref, skipped_ref, operation_ref) = (&failed, &skipped, &operation);

    let errors: Vec<CloudError> = stream::iter(items)
        .map(move |item| async move {
            if failed_ref.load(Ordering::SeqCst) {
                skipped_ref.fetch_add(1, Ordering::SeqCst);
                return None;
            }
            match operation_ref(item).await {
                Ok(()) => None,
                Err(e) => {
                    failed_ref.store(true, Ordering::SeqCst);
                    Some(e)
                }
            }
        })
        .buffer_unordered(concurrency.max(1))
        .filter_map(futures::future::ready)
        .collect()
        .await;

    let skipped = skipped.load(Ordering::SeqCst);
    if skipped > 0 {
        debug!("Skipped {skipped} queued operations after a failure");
    }

    match CloudError::from_errors(errors) {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_all_succeed() {
        let done = AtomicUsize::new(0);
        let done_ref = &done;
        fan_out(0..20, 4, move |_| async move {
            done_ref.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await
        .unwrap();
        assert_eq!(done.load(Ordering::SeqCst), 20);
    }

    #[tokio::test]
    async fn test_failure_stops_new_work() {
        let started = AtomicUsize::new(0);
        let started_ref = &started;
        let result = fan_out(0..10, 1, move |i| async move {
            started_ref.fetch_add(1, Ordering::SeqCst);
            if i == 2 {
                Err(CloudError::SaveDoesntExist(i.to_string()))
            } else {
                Ok(())
            }
        })
        .await;

        assert!(matches!(result, Err(CloudError::SaveDoesntExist(_))));
        assert_eq!(started.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_running_units_finish_and_errors_aggregate() {
        let finished = AtomicUsize::new(0);
        let finished_ref = &finished;
        let result = fan_out(0..3, 3, move |i| async move {
            tokio::time::sleep(Duration::from_millis(10 * (i as u64 + 1))).await;
            finished_ref.fetch_add(1, Ordering::SeqCst);
            if i < 2 {
                Err(CloudError::SaveDoesntExist(i.to_string()))
            } else {
                Ok(())
            }
        })
        .await;

        assert_eq!(finished.load(Ordering::SeqCst), 3);
        assert!(matches!(result, Err(CloudError::Aggregate(errors)) if errors.len() == 2));
    }
}
