//! 熔断器
//!
//! ```text
//! CLOSED    --(failure_count >= failure_threshold)--> OPEN
//! OPEN      --(now >= next_attempt, 下一次 execute 时)--> HALF_OPEN
//! HALF_OPEN --(任意失败)--> OPEN
//! HALF_OPEN --(success_count >= success_threshold)--> CLOSED
//! ```
//!
//! OPEN 状态下在冷却期内直接失败，不调用被保护的操作。
//! 熔断器从不吞掉错误，只决定是否尝试。

use chrono::{DateTime, Utc};
use hislink_admin::CircuitBreakerSettings;
use hislink_core::{ConnectorError, Result};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// 熔断器状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "CLOSED",
            Self::Open => "OPEN",
            Self::HalfOpen => "HALF_OPEN",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 熔断器配置
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    /// OPEN 状态的冷却时间
    pub timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout: Duration::from_millis(30000),
        }
    }
}

impl From<&CircuitBreakerSettings> for CircuitBreakerConfig {
    fn from(settings: &CircuitBreakerSettings) -> Self {
        Self {
            failure_threshold: settings.failure_threshold,
            success_threshold: settings.success_threshold,
            timeout: Duration::from_millis(settings.timeout_ms),
        }
    }
}

/// 状态变化通知
#[derive(Debug, Clone, Serialize)]
pub struct CircuitStateChange {
    pub name: String,
    pub from: CircuitState,
    pub to: CircuitState,
    pub timestamp: DateTime<Utc>,
    pub next_attempt: Option<DateTime<Utc>>,
}

/// 熔断器状态快照
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub next_attempt: Option<DateTime<Utc>>,
}

pub type CircuitListener = Arc<dyn Fn(&CircuitStateChange) + Send + Sync>;

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure_time: Option<DateTime<Utc>>,
    next_attempt: Option<DateTime<Utc>>,
}

impl BreakerInner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure_time: None,
            next_attempt: None,
        }
    }
}

/// 保护单个远端依赖的熔断器
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
    listeners: RwLock<Vec<CircuitListener>>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("inner", &*self.inner.lock())
            .finish()
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner::new()),
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let inner = self.inner.lock();
        CircuitBreakerSnapshot {
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            last_failure_time: inner.last_failure_time,
            next_attempt: inner.next_attempt,
        }
    }

    /// 注册状态变化监听器
    pub fn on_state_change(&self, listener: CircuitListener) {
        self.listeners.write().push(listener);
    }

    /// 在熔断器保护下执行操作
    pub async fn execute<T, F, Fut>(&self, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.before_call()?;

        match operation().await {
            Ok(value) => {
                self.on_success();
                Ok(value)
            }
            Err(err) => {
                self.on_failure();
                Err(err)
            }
        }
    }

    /// 强制关闭，已经关闭时只清零计数
    pub fn reset(&self) {
        let change = {
            let mut inner = self.inner.lock();
            let from = inner.state;
            inner.failure_count = 0;
            inner.success_count = 0;
            inner.next_attempt = None;
            (from != CircuitState::Closed)
                .then(|| self.transition(&mut inner, from, CircuitState::Closed))
        };
        if let Some(change) = change {
            info!(circuit = %self.name, from = change.from.as_str(), "circuit breaker reset");
            self.notify(change);
        }
    }

    /// 强制打开
    pub fn trip(&self) {
        let change = {
            let mut inner = self.inner.lock();
            let from = inner.state;
            self.open(&mut inner, from)
        };
        warn!(circuit = %self.name, "circuit breaker tripped manually");
        self.notify(change);
    }

    fn before_call(&self) -> Result<()> {
        let change = {
            let mut inner = self.inner.lock();
            if inner.state != CircuitState::Open {
                return Ok(());
            }

            let now = Utc::now();
            match inner.next_attempt {
                Some(next_attempt) if now < next_attempt => {
                    let retry_after = (next_attempt - now).to_std().unwrap_or_default();
                    return Err(ConnectorError::CircuitOpen {
                        name: self.name.clone(),
                        retry_after,
                    });
                }
                _ => {
                    inner.success_count = 0;
                    self.transition(&mut inner, CircuitState::Open, CircuitState::HalfOpen)
                }
            }
        };
        info!(circuit = %self.name, "circuit breaker probing recovery");
        self.notify(change);
        Ok(())
    }

    fn on_success(&self) {
        let change = {
            let mut inner = self.inner.lock();
            inner.failure_count = 0;
            if inner.state != CircuitState::HalfOpen {
                return;
            }
            inner.success_count += 1;
            if inner.success_count < self.config.success_threshold {
                return;
            }
            inner.success_count = 0;
            inner.next_attempt = None;
            self.transition(&mut inner, CircuitState::HalfOpen, CircuitState::Closed)
        };
        info!(circuit = %self.name, "circuit breaker closed after recovery");
        self.notify(change);
    }

    fn on_failure(&self) {
        let change = {
            let mut inner = self.inner.lock();
            inner.failure_count += 1;
            inner.last_failure_time = Some(Utc::now());

            let from = inner.state;
            let should_open = match from {
                CircuitState::HalfOpen => true,
                CircuitState::Closed => inner.failure_count >= self.config.failure_threshold,
                CircuitState::Open => false,
            };
            if !should_open {
                return;
            }
            self.open(&mut inner, from)
        };
        warn!(
            circuit = %self.name,
            cooldown_ms = self.config.timeout.as_millis() as u64,
            "circuit breaker opened"
        );
        self.notify(change);
    }

    fn open(&self, inner: &mut BreakerInner, from: CircuitState) -> CircuitStateChange {
        inner.success_count = 0;
        inner.next_attempt = chrono::Duration::from_std(self.config.timeout)
            .ok()
            .map(|cooldown| Utc::now() + cooldown);
        self.transition(inner, from, CircuitState::Open)
    }

    fn transition(
        &self,
        inner: &mut BreakerInner,
        from: CircuitState,
        to: CircuitState,
    ) -> CircuitStateChange {
        inner.state = to;
        CircuitStateChange {
            name: self.name.clone(),
            from,
            to,
            timestamp: Utc::now(),
            next_attempt: if to == CircuitState::Open { inner.next_attempt } else { None },
        }
    }

    fn notify(&self, change: CircuitStateChange) {
        let listeners = self.listeners.read().clone();
        for listener in listeners {
            listener(&change);
        }
    }
}
