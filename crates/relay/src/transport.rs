//! Abstração do transporte até o broker.
//!
//! A sessão ([`crate::session`]) só conversa com o broker através de
//! [`BrokerTransport`]; a implementação MQTT real fica em
//! [`crate::mqtt_transport`] e os testes usam um broker em memória.

use crate::outbox::OutboundMessage;
use std::time::Duration;

/// Garantia de entrega no nível do broker (QoS MQTT).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryGuarantee {
    AtLeastOnce,
    ExactlyOnce,
}

/// Mensagem recebida de um tópico assinado.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Situação de uma publicação aceita pelo transporte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Broker confirmou (PUBACK para QoS 1, PUBCOMP para QoS 2).
    Confirmed,
    /// Já está com o cliente MQTT, mas a confirmação não chegou dentro do
    /// timeout. Não pode ser reenviada enquanto a conexão existir.
    Pending,
}

/// Resultado de um [`BrokerTransport::poll`].
#[derive(Debug, Default, PartialEq)]
pub struct Polled {
    pub inbound: Vec<InboundMessage>,
    /// A publicação pendente foi confirmada neste poll.
    pub confirmed: bool,
}

/// Erros do transporte. Todos recuperáveis enquanto houver tentativas.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransportError {
    #[error("Conexão recusada: {0}")]
    Refused(String),

    #[error("Timeout após {0:?}")]
    Timeout(Duration),

    #[error("Fila de requisições do cliente cheia")]
    Busy,

    #[error("Conexão perdida: {0}")]
    ConnectionLost(String),

    #[error("Não conectado")]
    NotConnected,
}

impl TransportError {
    /// A conexão precisa ser descartada e restabelecida.
    pub fn is_connection_lost(&self) -> bool {
        matches!(
            self,
            TransportError::Refused(_)
                | TransportError::ConnectionLost(_)
                | TransportError::NotConnected
        )
    }
}

/// Conexão exclusiva com o broker.
///
/// Todas as operações são limitadas por timeout; nenhuma bloqueia
/// indefinidamente.
pub trait BrokerTransport: Send {
    /// Abre (ou reabre) a conexão e aguarda a confirmação do broker.
    fn connect(&mut self, timeout: Duration) -> Result<(), TransportError>;

    fn subscribe(&mut self, topic: &str, qos: DeliveryGuarantee) -> Result<(), TransportError>;

    fn unsubscribe(&mut self, topic: &str) -> Result<(), TransportError>;

    /// Publica e aguarda a confirmação do broker até `timeout`.
    ///
    /// `Err` significa que nada ficou em voo: ou o cliente recusou a
    /// mensagem, ou a conexão caiu e levou a publicação junto. Só uma
    /// publicação pendente por vez; com outra em voo retorna `Busy`.
    fn publish(&mut self, message: &OutboundMessage, timeout: Duration)
    -> Result<Delivery, TransportError>;

    /// Processa keep-alive/acks e devolve publicações recebidas.
    fn poll(&mut self, timeout: Duration) -> Result<Polled, TransportError>;

    /// Libera o handle da conexão, descartando publicações em voo.
    /// Idempotente.
    fn close(&mut self);
}

// ──────────────────────────────────────────────
// Broker em memória para testes
// ──────────────────────────────────────────────
