//! 后端调用重试执行器
//!
//! 瞬时错误按指数退避 + 抖动重试（`base * 2^attempt ± random`，封顶 max_delay），
//! 永久错误立即上抛；重试耗尽时上抛最后一次瞬时错误，并标记为「后端不可用」。
//! 单次调用施加超时；取消令牌只中止当前在途的后端调用。

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::core::AgentError;
use crate::llm::{BackendError, Inference, ReasoningBackend};
use crate::memory::ConversationContext;

/// 重试策略
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// 总尝试次数（含首次），至少为 1
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// 抖动比例 0.0–1.0
    pub jitter_factor: f64,
    /// 单次后端调用超时
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            jitter_factor: 0.2,
            attempt_timeout: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            max_attempts: cfg.retry.max_attempts.max(1),
            base_delay: Duration::from_millis(cfg.retry.base_delay_ms),
            max_delay: Duration::from_millis(cfg.retry.max_delay_ms),
            jitter_factor: cfg.retry.jitter_factor.clamp(0.0, 1.0),
            attempt_timeout: Duration::from_secs(cfg.llm.timeouts.request),
        }
    }

    /// 第 retry 次重试前的等待时长（retry 从 0 开始）；random 取值 [0, 1)
    pub fn backoff_delay(&self, retry: u32, random: f64) -> Duration {
        let base_ms = self.base_delay.as_millis() as u64;
        let max_ms = self.max_delay.as_millis() as u64;
        let exponential = base_ms.saturating_mul(1u64 << retry.min(31));
        let capped = exponential.min(max_ms);

        // random [0,1) 映射到 [-jitter, +jitter]
        let jitter = 1.0 + (random * 2.0 - 1.0) * self.jitter_factor;
        let with_jitter = ((capped as f64) * jitter).round().max(0.0) as u64;
        Duration::from_millis(with_jitter.min(max_ms))
    }
}

/// 重试执行器：包装 ReasoningBackend
#[derive(Clone)]
pub struct RetryExecutor {
    backend: Arc<dyn ReasoningBackend>,
    policy: RetryPolicy,
}

impl RetryExecutor {
    pub fn new(backend: Arc<dyn ReasoningBackend>, policy: RetryPolicy) -> Self {
        Self { backend, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub async fn call(&self, context: &ConversationContext) -> Result<Inference, AgentError> {
        self.call_with_cancel(context, &CancellationToken::new())
            .await
    }

    /// 调用后端；cancel 触发时中止在途调用与退避等待，返回 Cancelled
    pub async fn call_with_cancel(
        &self,
        context: &ConversationContext,
        cancel: &CancellationToken,
    ) -> Result<Inference, AgentError> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let result = tokio::select! {
                r = tokio::time::timeout(self.policy.attempt_timeout, self.backend.infer(context)) => {
                    r.unwrap_or(Err(BackendError::Timeout))
                }
                _ = cancel.cancelled() => {
                    tracing::info!("Backend call cancelled (attempt {})", attempt);
                    return Err(AgentError::Cancelled);
                }
            };

            let err = match result {
                Ok(inference) => {
                    if attempt > 1 {
                        tracing::info!(
                            "Backend {} succeeded after {} attempts",
                            self.backend.name(),
                            attempt
                        );
                    }
                    return Ok(inference);
                }
                Err(e) => e,
            };

            if !err.is_transient() {
                tracing::warn!("Backend {} rejected input: {}", self.backend.name(), err);
                return Err(AgentError::PermanentBackend(err));
            }

            if attempt >= max_attempts {
                tracing::warn!(
                    "Backend {} unavailable after {} attempts: {}",
                    self.backend.name(),
                    attempt,
                    err
                );
                return Err(AgentError::TransientBackend {
                    attempts: attempt,
                    source: err,
                });
            }

            let delay = self
                .policy
                .backoff_delay(attempt - 1, rand::random::<f64>());
            tracing::debug!(
                "Transient backend error (attempt {}/{}): {}; retrying in {:?}",
                attempt,
                max_attempts,
                err,
                delay
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => return Err(AgentError::Cancelled),
            }
        }
    }
}
