//! Sessão com o broker: máquina de estados explícita da conexão.
//!
//! ```text
//! DISCONNECTED → CONNECTING → CONNECTED → DISCONNECTED (erro/close) → …
//!                     │
//!                     └─ tentativas esgotadas → FAILED
//! ```
//!
//! Toda mudança de estado passa por [`BrokerSession::transition`], que a
//! publica no canal de eventos lido pelo relay.

use crate::error::ConnectivityError;
use crate::publisher::PublisherEvent;
use crate::retry::{RetryDecision, RetrySchedule, RetryTimer};
use crate::transport::{BrokerTransport, Delivery, DeliveryGuarantee, Polled, TransportError};
use crate::outbox::OutboundMessage;
use crossbeam_channel::Sender;
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Estado da conexão com o broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting { attempt: u32 },
    Connected,
    /// Tentativas esgotadas; terminal.
    Failed,
    /// Teardown concluído; terminal.
    Stopped,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "DISCONNECTED"),
            ConnectionState::Connecting { attempt } => write!(f, "CONNECTING (tentativa {attempt})"),
            ConnectionState::Connected => write!(f, "CONNECTED"),
            ConnectionState::Failed => write!(f, "FAILED"),
            ConnectionState::Stopped => write!(f, "STOPPED"),
        }
    }
}

/// Resultado de [`BrokerSession::establish`] quando não é fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Established {
    Connected,
    Cancelled,
}

/// Parâmetros fixos da sessão.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub broker: String,
    pub subscriptions: Vec<String>,
    pub connect_timeout: Duration,
    pub publish_timeout: Duration,
}

pub struct BrokerSession<T, R> {
    transport: T,
    timer: R,
    schedule: RetrySchedule,
    options: SessionOptions,
    state: ConnectionState,
    subscribed: Vec<String>,
    events: Sender<PublisherEvent>,
}

impl<T: BrokerTransport, R: RetryTimer> BrokerSession<T, R> {
    pub fn new(
        transport: T,
        timer: R,
        schedule: RetrySchedule,
        options: SessionOptions,
        events: Sender<PublisherEvent>,
    ) -> Self {
        Self {
            transport,
            timer,
            schedule,
            options,
            state: ConnectionState::Disconnected,
            subscribed: Vec::new(),
            events,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    fn transition(&mut self, next: ConnectionState) {
        if self.state == next {
            return;
        }
        debug!("Broker {}: {} → {}", self.options.broker, self.state, next);
        self.state = next;
        let _ = self.events.send(PublisherEvent::StateChanged(next));
    }

    /// Conecta (e reassina os tópicos) respeitando a política de retry.
    ///
    /// Retorna erro fatal uma única vez, quando as tentativas se esgotam.
    pub fn establish(&mut self) -> Result<Established, ConnectivityError> {
        loop {
            if self.timer.is_cancelled() {
                return Ok(Established::Cancelled);
            }

            let attempt = self.schedule.failures() + 1;
            let attempting = ConnectionState::Connecting { attempt };
            self.transition(attempting);

            let error = match self.open() {
                Ok(()) => {
                    self.schedule.reset();
                    self.transition(ConnectionState::Connected);
                    info!("Conectado ao broker MQTT {}", self.options.broker);
                    return Ok(Established::Connected);
                }
                Err(e) => e,
            };

            warn!(
                "Falha ao conectar em {} (tentativa {attempt}): {error}",
                self.options.broker
            );
            self.release();
            self.transition(ConnectionState::Disconnected);

            match self.schedule.record_failure() {
                RetryDecision::RetryAfter(delay) => {
                    debug!("Nova tentativa em {delay:?}");
                    if !self.timer.wait(delay) {
                        return Ok(Established::Cancelled);
                    }
                }
                RetryDecision::GiveUp { attempts } => {
                    self.transition(ConnectionState::Failed);
                    return Err(ConnectivityError {
                        broker: self.options.broker.clone(),
                        attempts,
                        last_state: attempting,
                        last_error: error,
                    });
                }
            }
        }
    }

    fn open(&mut self) -> Result<(), TransportError> {
        self.transport.connect(self.options.connect_timeout)?;
        for topic in &self.options.subscriptions {
            self.transport
                .subscribe(topic, DeliveryGuarantee::AtLeastOnce)?;
            self.subscribed.push(topic.clone());
            info!("Assinado tópico {topic}");
        }
        Ok(())
    }

    /// Publica uma mensagem. Perda de conexão leva a DISCONNECTED.
    pub fn publish(&mut self, message: &OutboundMessage) -> Result<Delivery, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        let result = self
            .transport
            .publish(message, self.options.publish_timeout);
        if let Err(e) = &result {
            self.on_error(e);
        }
        result
    }

    /// Mantém a conexão viva e coleta mensagens de entrada.
    pub fn poll(&mut self, timeout: Duration) -> Result<Polled, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        let result = self.transport.poll(timeout);
        if let Err(e) = &result {
            self.on_error(e);
        }
        result
    }

    fn on_error(&mut self, error: &TransportError) {
        if error.is_connection_lost() {
            warn!("Conexão com {} perdida: {error}", self.options.broker);
            self.release();
            self.transition(ConnectionState::Disconnected);
        } else {
            debug!("Erro recuperável no broker {}: {error}", self.options.broker);
        }
    }

    fn release(&mut self) {
        self.subscribed.clear();
        self.transport.close();
    }

    /// Teardown: cancela assinaturas e fecha o transporte mesmo se o
    /// unsubscribe falhar.
    pub fn shutdown(&mut self) {
        if self.is_connected() {
            for topic in std::mem::take(&mut self.subscribed) {
                if let Err(e) = self.transport.unsubscribe(&topic) {
                    warn!("Falha ao cancelar assinatura de {topic}: {e}");
                }
            }
        }
        self.release();
        self.transition(ConnectionState::Stopped);
        info!("Conexão com {} liberada", self.options.broker);
    }
}
