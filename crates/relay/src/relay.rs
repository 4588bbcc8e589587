//! Loop do relay: datagrama → decode → avaliação de alerta → publisher.
//!
//! Processamento estritamente sequencial: a máquina de estados de alertas
//! depende da ordem de chegada.

use crate::error::{ConnectivityError, RelayError};
use crate::publisher::PublisherEvent;
use crate::session::ConnectionState;
use crate::udp_source::DatagramSource;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use telemetry_core::alerts::AlertEvaluator;
use telemetry_core::config::AppConfig;
use telemetry_core::history::ReplayBuffer;
use telemetry_core::protocol::{DecodeError, decode_datagram};
use telemetry_core::types::{AlertKind, AlertMessage, TelemetryRecord};
use tracing::{debug, error, info, warn};

/// Lado de saída do relay. Implementado pelo [`crate::publisher::Publisher`].
pub trait Outbound {
    fn publish_telemetry(&self, record: &TelemetryRecord);
    fn publish_alert(&self, alert: &AlertMessage);
    fn poll_event(&self) -> Option<PublisherEvent>;
}

/// Contadores do relay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub datagrams: u64,
    pub relayed: u64,
    pub rejected: u64,
    pub alerts: u64,
    pub inbound: u64,
}

pub struct Relay<O> {
    outbound: O,
    evaluator: AlertEvaluator,
    history: ReplayBuffer,
    stats: RelayStats,
    broker_state: ConnectionState,
    /// Pausa após erro de leitura do socket
    error_backoff: Duration,
}

impl<O: Outbound> Relay<O> {
    pub fn new(config: &AppConfig, outbound: O) -> Self {
        Self {
            outbound,
            evaluator: AlertEvaluator::new(config.alerts.clone()),
            history: ReplayBuffer::new(config.history.capacity),
            stats: RelayStats::default(),
            broker_state: ConnectionState::Disconnected,
            error_backoff: config.listen.read_timeout(),
        }
    }

    pub fn stats(&self) -> RelayStats {
        self.stats
    }

    pub fn last_record(&self) -> Option<&TelemetryRecord> {
        self.history.latest()
    }

    /// Registros no buffer de replay.
    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    /// Menor e maior tensão de bateria no buffer de replay.
    pub fn battery_range(&self) -> Option<(f64, f64)> {
        if self.history.is_empty() {
            return None;
        }
        Some(self.history.iter().map(|r| r.battery_voltage).fold(
            (f64::INFINITY, f64::NEG_INFINITY),
            |(lo, hi), v| (lo.min(v), hi.max(v)),
        ))
    }

    pub fn into_outbound(self) -> O {
        self.outbound
    }

    /// Processa um datagrama. Erros de decode não alteram o estado de
    /// alerta nem afetam os próximos datagramas.
    pub fn handle_datagram(
        &mut self,
        payload: &[u8],
        received_at: DateTime<Utc>,
    ) -> Result<Option<AlertKind>, DecodeError> {
        self.stats.datagrams += 1;
        let record = match decode_datagram(payload, received_at) {
            Ok(record) => record,
            Err(e) => {
                self.stats.rejected += 1;
                return Err(e);
            }
        };

        debug!(
            "Telemetria: Alt={:.1}m, Speed={:.1}m/s, Battery={:.2}V",
            record.altitude, record.airspeed, record.battery_voltage
        );

        let previous = self.evaluator.state().level;
        let alert = self.evaluator.evaluate(&record);
        self.outbound.publish_telemetry(&record);

        let kind = alert.as_ref().map(AlertMessage::kind);
        match &alert {
            Some(alert) => {
                match alert.kind() {
                    AlertKind::Critical => error!(
                        "ALERTA CRÍTICO: bateria {:.2}V abaixo de {:.1}V!",
                        alert.current_volts, alert.threshold_volts
                    ),
                    AlertKind::Warning => warn!(
                        "Aviso: bateria {:.2}V abaixo de {:.1}V",
                        alert.current_volts,
                        self.evaluator.thresholds().warning_voltage
                    ),
                }
                self.outbound.publish_alert(alert);
                self.stats.alerts += 1;
            }
            None => {
                let level = self.evaluator.state().level;
                if level < previous {
                    info!(
                        "Tensão da bateria recuperada: {:.2}V ({previous:?} → {level:?})",
                        record.battery_voltage
                    );
                }
            }
        }

        self.history.push(record);
        self.stats.relayed += 1;
        Ok(kind)
    }

    /// Trata um evento do publisher. Só a falha fatal retorna erro.
    pub fn handle_event(&mut self, event: PublisherEvent) -> Result<(), ConnectivityError> {
        match event {
            PublisherEvent::StateChanged(state) => {
                match state {
                    ConnectionState::Connected => info!("Broker disponível, publicando"),
                    ConnectionState::Disconnected
                        if self.broker_state == ConnectionState::Connected =>
                    {
                        warn!("Broker desconectado, mensagens serão enfileiradas");
                    }
                    other => debug!("Broker: {other}"),
                }
                self.broker_state = state;
                Ok(())
            }
            PublisherEvent::Inbound(message) => {
                self.stats.inbound += 1;
                info!(
                    "Mensagem recebida em {} ({} bytes)",
                    message.topic,
                    message.payload.len()
                );
                Ok(())
            }
            PublisherEvent::Fatal(e) => {
                self.report_fatal(&e);
                Err(e)
            }
        }
    }

    fn report_fatal(&self, e: &ConnectivityError) {
        error!("Falha fatal de conectividade: {e}");
        match self.history.latest() {
            Some(r) => error!(
                "Última telemetria: Alt={:.1}m, Speed={:.1}m/s, Battery={:.2}V em {} | alerta: {:?}",
                r.altitude,
                r.airspeed,
                r.battery_voltage,
                r.timestamp.to_rfc3339(),
                self.evaluator.state().level
            ),
            None => error!("Nenhuma telemetria recebida antes da falha"),
        }
        if let Some((lo, hi)) = self.battery_range() {
            error!(
                "Histórico: {} registro(s), bateria entre {lo:.2}V e {hi:.2}V",
                self.history_len()
            );
        }
        error!(
            "Datagramas: {} | relayados: {} | rejeitados: {} | alertas: {}",
            self.stats.datagrams, self.stats.relayed, self.stats.rejected, self.stats.alerts
        );
    }

    /// Loop principal. Termina com `stop` ou com falha fatal do publisher.
    pub fn run(
        &mut self,
        source: &mut impl DatagramSource,
        stop: &AtomicBool,
    ) -> Result<RelayStats, RelayError> {
        info!("Relay em execução, aguardando telemetria...");

        while !stop.load(Ordering::SeqCst) {
            while let Some(event) = self.outbound.poll_event() {
                self.handle_event(event)?;
            }

            match source.recv() {
                Ok(Some(datagram)) => {
                    if let Err(e) = self.handle_datagram(datagram.payload, datagram.received_at) {
                        warn!("Datagrama inválido de {}: {e}", datagram.source);
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!("Erro ao receber UDP: {e}");
                    std::thread::sleep(self.error_backoff);
                }
            }
        }

        info!("Stop solicitado, encerrando relay");
        Ok(self.stats)
    }
}
