//! # Telemetry Core
//!
//! Crate compartilhada que define as estruturas de dados, o protocolo JSON
//! de entrada/saída, a máquina de estados de alertas de bateria e a
//! configuração TOML do relay MAVLink.
//!
//! ## Módulos
//! - [`types`] – Registro de telemetria e mensagens de alerta
//! - [`protocol`] – Decode do datagrama UDP e encode dos payloads MQTT
//! - [`config`] – Configuração unificada via TOML + variáveis de ambiente
//! - [`alerts`] – Níveis de alerta e avaliador com memória do último estado
//! - [`history`] – Buffer de replay com tamanho fixo

pub mod types;
pub mod protocol;
pub mod config;
pub mod alerts;
pub mod history;

// Re-exports convenientes
pub use types::{AlertMessage, TelemetryRecord};
pub use protocol::{DecodeError, decode_datagram, encode_alert, encode_telemetry};
pub use config::{AppConfig, BrokerConfig, ConfigError, ListenConfig};
pub use alerts::{AlertEvaluator, AlertLevel, AlertState};
pub use history::ReplayBuffer;
