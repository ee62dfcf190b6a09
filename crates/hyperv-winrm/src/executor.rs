//! The remote executor seam.
//!
//! Device operations build a [`PsCommand`] and hand it to a
//! [`RemoteExecutor`]; they never see how the command reaches the host.
//! [`CallContext`] carries the caller's deadline and cancellation signal
//! down to that boundary.

use crate::command::PsCommand;
use crate::error::{HyperVError, HyperVResult};
use crate::powershell::PsOutput;
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Deadline and cancellation for one logical call chain.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    deadline: Option<Instant>,
    cancel: CancellationToken,
}

impl CallContext {
    /// No deadline, never cancelled unless a token is attached later.
    pub fn background() -> Self {
        Self::default()
    }

    /// Tighten the deadline to at most `timeout` from now.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        let at = Instant::now() + timeout;
        self.deadline = Some(match self.deadline {
            Some(existing) if existing < at => existing,
            _ => at,
        });
        self
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Time left before the deadline; `None` when there is no deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Fail fast if the caller already gave up.
    pub fn check(&self, op: &str) -> HyperVResult<()> {
        if self.cancel.is_cancelled() {
            return Err(HyperVError::cancelled(op));
        }
        if matches!(self.remaining(), Some(left) if left.is_zero()) {
            return Err(HyperVError::timeout(op));
        }
        Ok(())
    }

    /// Drive `fut` until it completes, the deadline passes, or the token fires.
    pub async fn run<T, F>(&self, op: &str, fut: F) -> HyperVResult<T>
    where
        F: Future<Output = HyperVResult<T>>,
    {
        self.check(op)?;
        let work = async {
            match self.deadline {
                Some(at) => match tokio::time::timeout_at(at, fut).await {
                    Ok(res) => res,
                    Err(_) => Err(HyperVError::timeout(op)),
                },
                None => fut.await,
            }
        };
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(HyperVError::cancelled(op)),
            res = work => res,
        }
    }
}

/// Submits commands to a Hyper-V host.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Run a command for its side effect only.
    async fn run_fire_and_forget(&self, ctx: &CallContext, command: &PsCommand)
        -> HyperVResult<()>;

    /// Run a command and return its output for decoding.
    async fn run_with_result(
        &self,
        ctx: &CallContext,
        command: &PsCommand,
    ) -> HyperVResult<PsOutput>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HyperVErrorKind;

    #[test]
    fn background_has_no_deadline() {
        let ctx = CallContext::background();
        assert!(ctx.remaining().is_none());
        assert!(ctx.check("op").is_ok());
    }

    #[test]
    fn check_reports_cancellation() {
        let token = CancellationToken::new();
        let ctx = CallContext::background().with_cancel(token.clone());
        token.cancel();
        assert_eq!(ctx.check("op").unwrap_err().kind, HyperVErrorKind::Cancelled);
    }

    #[tokio::test]
    async fn with_timeout_keeps_the_earlier_deadline() {
        let ctx = CallContext::background()
            .with_timeout(Duration::from_secs(5))
            .with_timeout(Duration::from_secs(60));
        assert!(ctx.remaining().unwrap() <= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn run_times_out_at_deadline() {
        let ctx = CallContext::background().with_timeout(Duration::from_millis(50));
        let err = ctx
            .run("slow", async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind, HyperVErrorKind::Timeout);
    }

    #[tokio::test]
    async fn run_stops_on_cancel() {
        let token = CancellationToken::new();
        let ctx = CallContext::background().with_cancel(token.clone());
        let canceller = {
            let token = token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                token.cancel();
            })
        };
        let err = ctx
            .run("pending", std::future::pending::<HyperVResult<()>>())
            .await
            .unwrap_err();
        assert_eq!(err.kind, HyperVErrorKind::Cancelled);
        canceller.await.unwrap();
    }

    #[tokio::test]
    async fn run_passes_through_result() {
        let ctx = CallContext::background();
        let v = ctx.run("ok", async { Ok(7) }).await.unwrap();
        assert_eq!(v, 7);
    }
}
