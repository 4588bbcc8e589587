//! Agendamento de reconexões com backoff e espera injetável.

use crossbeam_channel::{Receiver, RecvTimeoutError, TryRecvError};
use std::time::Duration;
use telemetry_core::config::{BackoffKind, RetryConfig};

/// Política de reconexão.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff: BackoffKind,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries.max(1),
            base_delay: config.retry_delay(),
            max_delay: config.max_retry_delay().max(config.retry_delay()),
            backoff: config.backoff,
        }
    }

    /// Espera após a `failure`-ésima falha consecutiva (começa em 1).
    pub fn delay_for(&self, failure: u32) -> Duration {
        match self.backoff {
            BackoffKind::Fixed => self.base_delay,
            BackoffKind::Exponential => {
                let factor = 1u32
                    .checked_shl(failure.saturating_sub(1))
                    .unwrap_or(u32::MAX);
                self.base_delay.saturating_mul(factor).min(self.max_delay)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    GiveUp { attempts: u32 },
}

/// Contador de falhas consecutivas.
#[derive(Debug, Clone)]
pub struct RetrySchedule {
    policy: RetryPolicy,
    failures: u32,
}

impl RetrySchedule {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            failures: 0,
        }
    }

    pub fn record_failure(&mut self) -> RetryDecision {
        self.failures = self.failures.saturating_add(1);
        if self.failures >= self.policy.max_retries {
            RetryDecision::GiveUp {
                attempts: self.failures,
            }
        } else {
            RetryDecision::RetryAfter(self.policy.delay_for(self.failures))
        }
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }
}

/// Espera entre tentativas. Retorna `false` se a espera foi cancelada.
pub trait RetryTimer: Send {
    fn wait(&mut self, delay: Duration) -> bool;

    fn is_cancelled(&self) -> bool {
        false
    }
}

/// Sinal de parada: o lado emissor é descartado para sinalizar.
#[derive(Debug, Clone)]
pub struct StopSignal {
    rx: Receiver<()>,
}

impl StopSignal {
    pub fn new(rx: Receiver<()>) -> Self {
        Self { rx }
    }

    pub fn is_raised(&self) -> bool {
        !matches!(self.rx.try_recv(), Err(TryRecvError::Empty))
    }

    /// Dorme até `timeout` ou até o stop. Retorna `true` se dormiu tudo.
    pub fn sleep(&self, timeout: Duration) -> bool {
        matches!(self.rx.recv_timeout(timeout), Err(RecvTimeoutError::Timeout))
    }
}

/// Timer real, interrompido pelo [`StopSignal`].
pub struct StopAwareTimer {
    stop: StopSignal,
}

impl StopAwareTimer {
    pub fn new(stop: StopSignal) -> Self {
        Self { stop }
    }
}

impl RetryTimer for StopAwareTimer {
    fn wait(&mut self, delay: Duration) -> bool {
        self.stop.sleep(delay)
    }

    fn is_cancelled(&self) -> bool {
        self.stop.is_raised()
    }
}

// ──────────────────────────────────────────────
// Timer de teste
// ──────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Registra as esperas pedidas; dorme apenas `pause` de verdade.
    #[derive(Clone, Default)]
    pub struct RecordingTimer {
        pub waits: Arc<Mutex<Vec<Duration>>>,
        pub pause: Duration,
    }

    impl RecordingTimer {
        pub fn with_pause(pause: Duration) -> Self {
            Self {
                pause,
                ..Default::default()
            }
        }

        pub fn waits(&self) -> Vec<Duration> {
            self.waits.lock().unwrap().clone()
        }
    }

    impl RetryTimer for RecordingTimer {
        fn wait(&mut self, delay: Duration) -> bool {
            self.waits.lock().unwrap().push(delay);
            if !self.pause.is_zero() {
                std::thread::sleep(self.pause);
            }
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(backoff: BackoffKind, max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(3),
            backoff,
        }
    }

    #[test]
    fn fixed_backoff_is_constant() {
        let p = policy(BackoffKind::Fixed, 5);
        assert_eq!(p.delay_for(1), Duration::from_millis(500));
        assert_eq!(p.delay_for(4), Duration::from_millis(500));
    }

    #[test]
    fn exponential_backoff_doubles_and_caps() {
        let p = policy(BackoffKind::Exponential, 5);
        assert_eq!(p.delay_for(1), Duration::from_millis(500));
        assert_eq!(p.delay_for(2), Duration::from_secs(1));
        assert_eq!(p.delay_for(3), Duration::from_secs(2));
        assert_eq!(p.delay_for(4), Duration::from_secs(3));
        assert_eq!(p.delay_for(60), Duration::from_secs(3));
    }

    #[test]
    fn gives_up_after_max_retries() {
        let mut schedule = RetrySchedule::new(policy(BackoffKind::Fixed, 3));
        assert!(matches!(schedule.record_failure(), RetryDecision::RetryAfter(_)));
        assert!(matches!(schedule.record_failure(), RetryDecision::RetryAfter(_)));
        assert_eq!(
            schedule.record_failure(),
            RetryDecision::GiveUp { attempts: 3 }
        );
    }

    #[test]
    fn reset_clears_failures() {
        let mut schedule = RetrySchedule::new(policy(BackoffKind::Fixed, 2));
        schedule.record_failure();
        schedule.reset();
        assert_eq!(schedule.failures(), 0);
        assert!(matches!(schedule.record_failure(), RetryDecision::RetryAfter(_)));
    }

    #[test]
    fn stop_signal_interrupts_sleep() {
        let (tx, rx) = crossbeam_channel::bounded::<()>(1);
        let stop = StopSignal::new(rx);
        assert!(!stop.is_raised());
        assert!(stop.sleep(Duration::from_millis(1)));
        drop(tx);
        assert!(stop.is_raised());
        assert!(!stop.sleep(Duration::from_secs(5)));
    }
}
