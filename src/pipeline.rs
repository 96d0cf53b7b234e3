//! The credential-issuance pipeline.
//!
//! One strictly sequential pass per process invocation:
//!
//! `Idle → Signing → Exchanging → RequestingToken → Delivering → Done`
//!
//! with a terminal `Failed(category)` reachable from any non-terminal
//! state. The bounded retries inside the two network stages do not change
//! the pipeline state, only the attempt count within the stage. Each
//! stage's output is the next stage's sole input; nothing is cached or
//! reused across runs.

use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::delivery::{self, Destination};
use crate::error::{Error, ErrorCategory, Result};
use crate::github::{JitTokenRequester, TokenExchanger};
use crate::retry::{with_retries, RetryPolicy, Sleeper};
use crate::runner::RunnerSpec;
use crate::signer::AssertionSigner;

/// Orchestrator state. `Done` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Signing,
    Exchanging,
    RequestingToken,
    Delivering,
    Done,
    Failed(ErrorCategory),
}

/// Sequences the pipeline stages and owns their shared context.
pub struct Pipeline {
    signer: Arc<dyn AssertionSigner>,
    exchanger: Arc<dyn TokenExchanger>,
    requester: Arc<dyn JitTokenRequester>,
    sleeper: Arc<dyn Sleeper>,
    policy: RetryPolicy,
    cancel: CancellationToken,
    jwt_ttl: chrono::Duration,
    state: PipelineState,
}

impl Pipeline {
    pub fn new(
        signer: Arc<dyn AssertionSigner>,
        exchanger: Arc<dyn TokenExchanger>,
        requester: Arc<dyn JitTokenRequester>,
        sleeper: Arc<dyn Sleeper>,
        policy: RetryPolicy,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            signer,
            exchanger,
            requester,
            sleeper,
            policy,
            cancel,
            jwt_ttl: chrono::Duration::minutes(9),
            state: PipelineState::Idle,
        }
    }

    /// Override the App JWT time-to-live (clamped by the signer).
    pub fn with_jwt_ttl(mut self, ttl: chrono::Duration) -> Self {
        self.jwt_ttl = ttl;
        self
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Run the pipeline once, delivering the minted token to `destination`.
    ///
    /// On failure the pipeline lands in `Failed` with the error's category
    /// and the error is returned for exit-code mapping.
    pub async fn run(&mut self, spec: &RunnerSpec, destination: &Destination) -> Result<()> {
        match self.run_stages(spec, destination).await {
            Ok(()) => {
                self.state = PipelineState::Done;
                info!("Pipeline complete for runner '{}'", spec.name);
                Ok(())
            }
            Err(err) => {
                self.state = PipelineState::Failed(err.category());
                Err(err)
            }
        }
    }

    async fn run_stages(&mut self, spec: &RunnerSpec, destination: &Destination) -> Result<()> {
        spec.validate()?;
        self.checkpoint()?;

        self.state = PipelineState::Signing;
        debug!("Signing App assertion (ttl {})", self.jwt_ttl);
        let assertion = self.signer.sign(self.jwt_ttl)?;
        self.checkpoint()?;

        self.state = PipelineState::Exchanging;
        // A stale assertion can only come from extreme clock skew or a
        // stalled process; refuse to send it rather than let the platform
        // answer with a confusing rejection.
        if assertion.is_expired(Utc::now()) {
            return Err(Error::AuthenticationRejected {
                status: None,
                detail: "App assertion expired before the exchange; no request was sent".into(),
            });
        }
        let exchanger = Arc::clone(&self.exchanger);
        let credential = with_retries(
            &self.policy,
            self.sleeper.as_ref(),
            &self.cancel,
            "token exchange",
            || {
                let exchanger = Arc::clone(&exchanger);
                let assertion = assertion.clone();
                async move { exchanger.exchange(&assertion).await }
            },
        )
        .await?;
        debug!(
            "Access credential obtained (expires {})",
            credential.expires_at
        );
        self.checkpoint()?;

        self.state = PipelineState::RequestingToken;
        if !credential.is_live(Utc::now()) {
            return Err(Error::AuthenticationRejected {
                status: None,
                detail: "access credential expired before the JIT request; no request was sent"
                    .into(),
            });
        }
        let requester = Arc::clone(&self.requester);
        let mut token = with_retries(
            &self.policy,
            self.sleeper.as_ref(),
            &self.cancel,
            "JIT token request",
            || {
                let requester = Arc::clone(&requester);
                let credential = credential.clone();
                let spec = spec.clone();
                async move { requester.request_jit_token(&credential, &spec).await }
            },
        )
        .await?;
        // The one-time token can never outlive the credential that minted it.
        token.clamp_expiry(credential.expires_at);
        self.checkpoint()?;

        self.state = PipelineState::Delivering;
        delivery::deliver(&token, destination).await?;

        Ok(())
    }

    /// Between-stage cancellation check.
    fn checkpoint(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}
