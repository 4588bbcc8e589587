//! Definição de tipos/structs para telemetria e alertas.
//!
//! Os nomes dos campos serializados são o contrato com o broker: qualquer
//! assinante de `mavlink/telemetry` e `mavlink/alert` depende deles.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ──────────────────────────────────────────────
// Telemetria
// ──────────────────────────────────────────────

/// Um snapshot de telemetria do veículo, criado a partir de um datagrama.
///
/// Imutável: é consumido uma vez pelo avaliador de alertas e uma vez pelo
/// publisher, e então descartado.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    /// Altitude (m)
    pub altitude: f64,
    /// Velocidade do ar (m/s)
    pub airspeed: f64,
    /// Tensão da bateria (V)
    pub battery_voltage: f64,
    /// Instante UTC da leitura (do produtor, ou de recepção)
    pub timestamp: DateTime<Utc>,
}

// ──────────────────────────────────────────────
// Alertas
// ──────────────────────────────────────────────

/// Nível do alerta. Não vai para o wire: é derivado da prioridade.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertKind {
    Warning,
    Critical,
}

/// Valor fixo do campo `type`. Assinantes filtram por ele, então avisos e
/// alertas críticos compartilham o mesmo tipo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlertType {
    #[serde(rename = "CRITICAL_ALERT")]
    CriticalAlert,
}

/// Prioridade do alerta.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AlertPriority {
    Medium,
    High,
}

/// Ação recomendada ao operador.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionRequired {
    PrepareToLand,
    ImmediateLandingRecommended,
}

/// Alerta emitido somente na entrada em WARNING ou CRITICAL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertMessage {
    #[serde(rename = "type")]
    pub alert_type: AlertType,
    pub priority: AlertPriority,
    pub message: String,
    /// Threshold crítico (V), o mesmo para os dois níveis
    #[serde(rename = "threshold")]
    pub threshold_volts: f64,
    /// Tensão que causou a transição (V)
    #[serde(rename = "current_voltage")]
    pub current_volts: f64,
    /// Timestamp do registro que causou a transição
    pub timestamp: DateTime<Utc>,
    pub action_required: ActionRequired,
}

impl AlertMessage {
    /// Alerta crítico: bateria abaixo do threshold crítico.
    pub fn critical(threshold_volts: f64, record: &TelemetryRecord) -> Self {
        Self {
            alert_type: AlertType::CriticalAlert,
            priority: AlertPriority::High,
            message: format!(
                "Battery voltage critical: {:.2}V",
                record.battery_voltage
            ),
            threshold_volts,
            current_volts: record.battery_voltage,
            timestamp: record.timestamp,
            action_required: ActionRequired::ImmediateLandingRecommended,
        }
    }

    /// Alerta de aviso: bateria na faixa entre crítico e warning.
    /// `threshold_volts` é o threshold crítico, como no alerta crítico.
    pub fn warning(threshold_volts: f64, record: &TelemetryRecord) -> Self {
        Self {
            alert_type: AlertType::CriticalAlert,
            priority: AlertPriority::Medium,
            message: format!("Battery voltage low: {:.2}V", record.battery_voltage),
            threshold_volts,
            current_volts: record.battery_voltage,
            timestamp: record.timestamp,
            action_required: ActionRequired::PrepareToLand,
        }
    }

    pub fn kind(&self) -> AlertKind {
        match self.priority {
            AlertPriority::High => AlertKind::Critical,
            AlertPriority::Medium => AlertKind::Warning,
        }
    }
}

// ──────────────────────────────────────────────
// Testes
// ──────────────────────────────────────────────
