use tokio::sync::{mpsc, oneshot};
use welltrack_core::{AnalysisSession, CacheLookup, CacheManager, SessionKey};

enum CacheJob {
    Save(AnalysisSession),
    Invalidate(SessionKey),
    Lookup(SessionKey, oneshot::Sender<CacheLookup>),
    Flush(oneshot::Sender<()>),
}

/// Runs every cache read and write in submission order on one task, with
/// the file work itself on the blocking pool.
///
/// A run of queued saves for the same session collapses into the newest,
/// since each save carries the full result list.
#[derive(Debug, Clone)]
pub(crate) struct CacheIo {
    jobs: mpsc::UnboundedSender<CacheJob>,
}

impl CacheIo {
    pub(crate) fn spawn(cache: CacheManager) -> Self {
        let (jobs, receiver) = mpsc::unbounded_channel();
        tokio::spawn(run_cache_jobs(cache, receiver));
        Self { jobs }
    }

    pub(crate) fn save(&self, session: AnalysisSession) {
        let _ = self.jobs.send(CacheJob::Save(session));
    }

    pub(crate) fn invalidate(&self, session_key: SessionKey) {
        let _ = self.jobs.send(CacheJob::Invalidate(session_key));
    }

    pub(crate) async fn lookup(&self, session_key: SessionKey) -> CacheLookup {
        let (reply, response) = oneshot::channel();
        if self.jobs.send(CacheJob::Lookup(session_key, reply)).is_err() {
            return CacheLookup::Missing;
        }
        response.await.unwrap_or(CacheLookup::Missing)
    }

    /// Resolves once every job submitted before it has finished.
    pub(crate) async fn flush(&self) {
        let (reply, response) = oneshot::channel();
        if self.jobs.send(CacheJob::Flush(reply)).is_ok() {
            let _ = response.await;
        }
    }
}

async fn run_cache_jobs(cache: CacheManager, mut receiver: mpsc::UnboundedReceiver<CacheJob>) {
    let mut deferred = None;
    loop {
        let job = match deferred.take() {
            Some(job) => job,
            None => match receiver.recv().await {
                Some(job) => job,
                None => break,
            },
        };

        match job {
            CacheJob::Save(mut session) => {
                while let Ok(next) = receiver.try_recv() {
                    match next {
                        CacheJob::Save(newer) if newer.session_key == session.session_key => {
                            session = newer;
                        }
                        other => {
                            deferred = Some(other);
                            break;
                        }
                    }
                }
                let cache = cache.clone();
                let session_key = session.session_key.clone();
                let written = tokio::task::spawn_blocking(move || cache.save(&session)).await;
                match written {
                    Ok(Ok(())) => {}
                    Ok(Err(error)) => {
                        tracing::warn!(session_key = %session_key, error = %error, "cache write failed");
                    }
                    Err(error) => {
                        tracing::warn!(session_key = %session_key, error = %error, "cache write task failed");
                    }
                }
            }
            CacheJob::Invalidate(session_key) => {
                let cache = cache.clone();
                let key = session_key.clone();
                match tokio::task::spawn_blocking(move || cache.invalidate(&key)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(error)) => {
                        tracing::warn!(session_key = %session_key, error = %error, "cache invalidation failed");
                    }
                    Err(error) => {
                        tracing::warn!(session_key = %session_key, error = %error, "cache invalidation task failed");
                    }
                }
            }
            CacheJob::Lookup(session_key, reply) => {
                let cache = cache.clone();
                let lookup = tokio::task::spawn_blocking(move || cache.lookup(&session_key))
                    .await
                    .unwrap_or_else(|error| CacheLookup::Invalid(error.to_string()));
                let _ = reply.send(lookup);
            }
            CacheJob::Flush(reply) => {
                let _ = reply.send(());
            }
        }
    }
}
