//! The caller-facing side of a stream request: races a main job against an
//! optional alternate job and binds to whichever settles it.
//!
//! # Design Decisions
//! - The first job to produce a stream wins; the other is orphaned into a
//!   background task that runs it to completion and closes what it made
//! - A pause (certificate, credentials) binds the request to the job that
//!   paused, and later resume calls go to that job alone
//! - A failed job waits for its sibling; if both fail the main job's error
//!   is reported
//! - A failed alternate job marks its alternative service broken

use std::sync::Arc;

use futures_util::future::{select, BoxFuture, Either};

use crate::error::NetError;
use crate::net::address::HostPortPair;
use crate::net::tls::ClientCertificate;
use crate::pool::LoadState;
use crate::session::HttpNetworkSession;
use crate::stream_factory::job::{JobKind, JobProgress, StreamReady, StreamRequestError, StreamRequestJob};

type JobOutcome = (StreamRequestJob, Result<StreamReady, StreamRequestError>);
type JobFuture = BoxFuture<'static, JobOutcome>;

/// One outstanding request for a stream.
pub struct StreamRequest {
    session: Arc<HttpNetworkSession>,
    origin: HostPortPair,
    main: Option<StreamRequestJob>,
    alternate: Option<StreamRequestJob>,
    /// The job later calls go to, once the race is settled by a pause.
    bound: Option<StreamRequestJob>,
    progress: JobProgress,
}

impl StreamRequest {
    pub(crate) fn new(
        session: Arc<HttpNetworkSession>,
        origin: HostPortPair,
        main: StreamRequestJob,
        alternate: Option<StreamRequestJob>,
    ) -> Self {
        let progress = main.progress();
        Self {
            session,
            origin,
            main: Some(main),
            alternate,
            bound: None,
            progress,
        }
    }

    /// Have every job connect anew, ignoring idle sockets and live sessions.
    pub fn require_new_connection(&mut self) {
        for job in [&mut self.main, &mut self.alternate].into_iter().flatten() {
            job.require_new_connection();
        }
    }

    /// Whether an alternate job takes part in this request.
    pub fn has_alternate(&self) -> bool {
        self.alternate.is_some()
    }

    pub fn load_state(&self) -> LoadState {
        self.progress.load_state(&self.session)
    }

    /// The main job's progress, readable while the request is being driven.
    pub fn progress(&self) -> JobProgress {
        self.progress.clone()
    }

    /// Drive the jobs until one yields a stream or the request needs the
    /// caller.
    pub async fn start(&mut self) -> Result<StreamReady, StreamRequestError> {
        let Some(main) = self.main.take() else {
            return Err(NetError::Aborted.into());
        };
        let Some(alternate) = self.alternate.take() else {
            self.bound = Some(main);
            return self.drive_bound(Step::Run).await;
        };

        tracing::debug!(origin = %self.origin, alternate = ?alternate.kind(), "Racing main and alternate jobs");
        let main_fut: JobFuture = Box::pin(main.run_owned());
        let alternate_fut: JobFuture = Box::pin(alternate.run_owned());
        match select(main_fut, alternate_fut).await {
            Either::Left((outcome, rest)) => self.on_first_settled(outcome, rest, true).await,
            Either::Right((outcome, rest)) => self.on_first_settled(outcome, rest, false).await,
        }
    }

    async fn on_first_settled(
        &mut self,
        (job, result): JobOutcome,
        rest: JobFuture,
        first_is_main: bool,
    ) -> Result<StreamReady, StreamRequestError> {
        match result {
            Ok(ready) => {
                tracing::debug!(origin = %self.origin, alternate = ready.alternate.is_some(), "Stream request won");
                self.orphan(rest);
                Ok(ready)
            }
            Err(pause) if pause.is_pause() => {
                self.orphan(rest);
                self.bind(job);
                Err(pause)
            }
            Err(first_error) => {
                if !first_is_main {
                    self.mark_alternate_broken();
                }
                let (other, other_result) = rest.await;
                match other_result {
                    Ok(ready) => Ok(ready),
                    Err(pause) if pause.is_pause() => {
                        self.bind(other);
                        Err(pause)
                    }
                    Err(second_error) => {
                        if first_is_main {
                            self.mark_alternate_broken();
                            Err(first_error)
                        } else {
                            Err(second_error)
                        }
                    }
                }
            }
        }
    }

    fn bind(&mut self, job: StreamRequestJob) {
        self.progress = job.progress();
        self.bound = Some(job);
    }

    fn mark_alternate_broken(&self) {
        self.session.alternate_services().mark_broken(&self.origin);
    }

    /// Let the losing job finish in the background for whatever it warms
    /// (a session, a pooled socket); its stream goes straight back.
    fn orphan(&self, rest: JobFuture) {
        let session = Arc::clone(&self.session);
        let origin = self.origin.clone();
        tokio::spawn(async move {
            let (job, result) = rest.await;
            match result {
                Ok(ready) => {
                    tracing::debug!(origin = %origin, kind = ?job.kind(), "Orphaned job finished");
                    ready.stream.close();
                }
                Err(e) => {
                    tracing::debug!(origin = %origin, kind = ?job.kind(), error = ?e, "Orphaned job failed");
                    if matches!(job.kind(), JobKind::Alternate(_)) && !e.is_pause() {
                        session.alternate_services().mark_broken(&origin);
                    }
                }
            }
        });
    }

    pub async fn restart_tunnel_with_proxy_auth(&mut self) -> Result<StreamReady, StreamRequestError> {
        self.drive_bound(Step::RestartTunnel).await
    }

    pub async fn resume_ignoring_cert_error(&mut self) -> Result<StreamReady, StreamRequestError> {
        self.drive_bound(Step::IgnoreCertError).await
    }

    pub async fn restart_with_certificate(
        &mut self,
        certificate: Option<ClientCertificate>,
    ) -> Result<StreamReady, StreamRequestError> {
        self.drive_bound(Step::Certificate(certificate)).await
    }

    async fn drive_bound(&mut self, step: Step) -> Result<StreamReady, StreamRequestError> {
        let Some(job) = self.bound.as_mut() else {
            return Err(NetError::Aborted.into());
        };
        let result = match step {
            Step::Run => job.run().await,
            Step::RestartTunnel => job.restart_tunnel_with_proxy_auth().await,
            Step::IgnoreCertError => job.resume_ignoring_cert_error().await,
            Step::Certificate(certificate) => job.restart_with_certificate(certificate).await,
        };
        match &result {
            Err(e) if e.is_pause() => {}
            _ => {
                if let Some(job) = self.bound.take() {
                    if matches!(job.kind(), JobKind::Alternate(_)) && result.is_err() {
                        self.mark_alternate_broken();
                    }
                }
            }
        }
        result
    }
}

enum Step {
    Run,
    RestartTunnel,
    IgnoreCertError,
    Certificate(Option<ClientCertificate>),
}
