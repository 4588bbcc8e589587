//! Sistema de alertas – níveis e máquina de estados da bateria.
//!
//! Um alerta é emitido apenas na *entrada* em WARNING ou CRITICAL. Leituras
//! subsequentes no mesmo nível e recuperações não geram mensagens, o que
//! evita flood com tensão ruidosa perto do threshold.

use crate::config::AlertThresholds;
use crate::types::{AlertMessage, TelemetryRecord};
use serde::{Deserialize, Serialize};

/// Nível de alerta. A ordem reflete a severidade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AlertLevel {
    Normal,
    Warning,
    Critical,
}

/// Estado corrente do avaliador.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AlertState {
    pub level: AlertLevel,
    /// Tensão que produziu a última transição (`None` antes da primeira)
    pub last_transition_volts: Option<f64>,
}

impl Default for AlertState {
    fn default() -> Self {
        Self {
            level: AlertLevel::Normal,
            last_transition_volts: None,
        }
    }
}

/// Retorna o [`AlertLevel`] para uma tensão dados os thresholds.
///
/// Tensão baixa é pior: `v < crit` é crítico, `crit <= v < warn` é aviso.
pub fn level_for_voltage(volts: f64, crit: f64, warn: f64) -> AlertLevel {
    if volts < crit {
        AlertLevel::Critical
    } else if volts < warn {
        AlertLevel::Warning
    } else {
        AlertLevel::Normal
    }
}

/// Máquina de estados de alerta de bateria.
///
/// Guarda apenas o estado anterior; as decisões dependem somente da
/// sequência ordenada de tensões recebidas.
#[derive(Debug, Clone)]
pub struct AlertEvaluator {
    thresholds: AlertThresholds,
    state: AlertState,
}

impl AlertEvaluator {
    pub fn new(thresholds: AlertThresholds) -> Self {
        Self {
            thresholds,
            state: AlertState::default(),
        }
    }

    pub fn state(&self) -> AlertState {
        self.state
    }

    pub fn thresholds(&self) -> &AlertThresholds {
        &self.thresholds
    }

    /// Avalia um registro. Retorna `Some` somente quando o nível escala
    /// para WARNING ou CRITICAL.
    pub fn evaluate(&mut self, record: &TelemetryRecord) -> Option<AlertMessage> {
        let volts = record.battery_voltage;
        let previous = self.state.level;
        let next = self.next_level(volts);

        if next == previous {
            return None;
        }

        self.state = AlertState {
            level: next,
            last_transition_volts: Some(volts),
        };

        if next < previous {
            return None;
        }

        match next {
            AlertLevel::Critical => Some(AlertMessage::critical(
                self.thresholds.critical_voltage,
                record,
            )),
            AlertLevel::Warning => Some(AlertMessage::warning(
                self.thresholds.critical_voltage,
                record,
            )),
            AlertLevel::Normal => None,
        }
    }

    /// Histerese: para sair de um nível a tensão precisa superar o limite
    /// daquele nível somado a `recovery_hysteresis`.
    fn next_level(&self, volts: f64) -> AlertLevel {
        let t = &self.thresholds;
        let current = self.state.level;
        let crit = if current == AlertLevel::Critical {
            t.critical_voltage + t.recovery_hysteresis
        } else {
            t.critical_voltage
        };
        let warn = if current >= AlertLevel::Warning {
            t.warning_voltage + t.recovery_hysteresis
        } else {
            t.warning_voltage
        };
        level_for_voltage(volts, crit, warn)
    }
}
