use folio_core::ViewerError;
use tracing::warn;

/// Runs a decode job on the blocking pool, or inline when `inline` is set.
///
/// A pool that cannot take the job is reported by tokio as a cancelled join;
/// the job then runs on the calling task instead, so callers never see
/// [`ViewerError::WorkerUnavailable`].
pub async fn run_decode<T, F>(inline: bool, job: F) -> Result<T, ViewerError>
where
    F: FnOnce() -> Result<T, ViewerError> + Clone + Send + 'static,
    T: Send + 'static,
{
    if inline {
        return job();
    }
    match tokio::task::spawn_blocking(job.clone()).await {
        Ok(result) => result,
        Err(err) if err.is_cancelled() => {
            warn!(%err, "decode worker unavailable, decoding inline");
            job()
        }
        Err(err) => Err(ViewerError::Decode(format!("decode worker panicked: {}", err))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[tokio::test]
    async fn inline_job_runs_on_calling_thread() {
        let caller = thread::current().id();
        let ran_on = run_decode(true, move || Ok(thread::current().id()))
            .await
            .unwrap();
        assert_eq!(ran_on, caller);
    }

    #[tokio::test]
    async fn worker_job_runs_on_blocking_pool() {
        let caller = thread::current().id();
        let ran_on = run_decode(false, move || Ok(thread::current().id()))
            .await
            .unwrap();
        assert_ne!(ran_on, caller);
    }

    #[tokio::test]
    async fn job_errors_pass_through() {
        let err = run_decode::<(), _>(false, || Err(ViewerError::page(3, "bad xref")))
            .await
            .unwrap_err();
        assert!(matches!(err, ViewerError::PageRenderFailure { page: 3, .. }));
    }

    #[tokio::test]
    async fn panicking_worker_becomes_decode_error() {
        let err = run_decode::<(), _>(false, || panic!("boom")).await.unwrap_err();
        assert!(matches!(err, ViewerError::Decode(_)));
    }
}
