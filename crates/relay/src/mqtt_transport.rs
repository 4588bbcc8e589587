//! Transporte MQTT 3.1.1 sobre rumqttc (API síncrona).
//!
//! Cada [`connect`](BrokerTransport::connect) cria um par `Client` /
//! `Connection` novo; a reconexão automática do rumqttc não é usada, quem
//! decide quando e quantas vezes reconectar é a sessão.
//!
//! Uma publicação só é confirmada com o PUBACK (QoS 1) ou PUBCOMP (QoS 2)
//! do seu packet id. Depois do `try_publish` a mensagem pertence ao event
//! loop: um timeout deixa a publicação em voo em vez de pedir reenvio.

use crate::outbox::OutboundMessage;
use crate::transport::{
    BrokerTransport, Delivery, DeliveryGuarantee, InboundMessage, Polled, TransportError,
};
use rumqttc::{
    Client, ClientError, ConnectReturnCode, Connection, Event, MqttOptions, Outgoing, Packet, QoS,
    RecvTimeoutError,
};
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use telemetry_core::config::BrokerConfig;
use tracing::debug;

/// Capacidade do canal de requisições do cliente rumqttc.
const REQUEST_CAPACITY: usize = 64;

/// Tempo máximo para o DISCONNECT sair no encerramento.
const CLOSE_GRACE: Duration = Duration::from_millis(250);

struct MqttLink {
    client: Client,
    connection: Connection,
}

/// Publicação aceita pelo cliente e ainda não confirmada.
#[derive(Debug, Clone, Copy)]
enum Awaiting {
    /// Na fila do cliente, packet id ainda desconhecido
    Write { qos: QoS },
    Ack { pkid: u16, qos: QoS },
}

pub struct MqttTransport {
    host: String,
    port: u16,
    client_id: String,
    keep_alive: Duration,
    /// Espera por SUBACK
    ack_timeout: Duration,
    link: Option<MqttLink>,
    awaiting: Option<Awaiting>,
    inbound: VecDeque<InboundMessage>,
}

impl MqttTransport {
    pub fn new(config: &BrokerConfig) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            client_id: config.client_id.clone(),
            keep_alive: config.keep_alive(),
            ack_timeout: config.publish_timeout(),
            link: None,
            awaiting: None,
            inbound: VecDeque::new(),
        }
    }
}

fn qos(guarantee: DeliveryGuarantee) -> QoS {
    match guarantee {
        DeliveryGuarantee::AtLeastOnce => QoS::AtLeastOnce,
        DeliveryGuarantee::ExactlyOnce => QoS::ExactlyOnce,
    }
}

fn client_error(error: ClientError) -> TransportError {
    match error {
        ClientError::TryRequest(_) => TransportError::Busy,
        other => TransportError::ConnectionLost(other.to_string()),
    }
}

/// Avança o acompanhamento da publicação em voo. Retorna `true` quando o
/// evento é a confirmação final dela.
fn track(awaiting: &mut Option<Awaiting>, event: &Event) -> bool {
    match (*awaiting, event) {
        (Some(Awaiting::Write { qos }), Event::Outgoing(Outgoing::Publish(pkid))) => {
            *awaiting = Some(Awaiting::Ack { pkid: *pkid, qos });
            false
        }
        (
            Some(Awaiting::Ack { pkid, qos: QoS::AtLeastOnce }),
            Event::Incoming(Packet::PubAck(ack)),
        ) if ack.pkid == pkid => {
            *awaiting = None;
            true
        }
        (
            Some(Awaiting::Ack { pkid, qos: QoS::ExactlyOnce }),
            Event::Incoming(Packet::PubComp(comp)),
        ) if comp.pkid == pkid => {
            *awaiting = None;
            true
        }
        _ => false,
    }
}

/// Processa eventos até `done` aceitar um deles ou o timeout expirar.
/// Publicações recebidas no caminho são guardadas em `inbound`.
fn pump_until(
    connection: &mut Connection,
    inbound: &mut VecDeque<InboundMessage>,
    timeout: Duration,
    mut done: impl FnMut(&Event) -> bool,
) -> Result<(), TransportError> {
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(TransportError::Timeout(timeout));
        }
        match connection.recv_timeout(remaining) {
            Ok(Ok(event)) => {
                if done(&event) {
                    return Ok(());
                }
                absorb(event, inbound)?;
            }
            Ok(Err(e)) => return Err(TransportError::ConnectionLost(e.to_string())),
            Err(RecvTimeoutError::Timeout) => return Err(TransportError::Timeout(timeout)),
            Err(RecvTimeoutError::Disconnected) => {
                return Err(TransportError::ConnectionLost(
                    "event loop encerrado".into(),
                ));
            }
        }
    }
}

fn absorb(event: Event, inbound: &mut VecDeque<InboundMessage>) -> Result<(), TransportError> {
    match event {
        Event::Incoming(Packet::Publish(publish)) => {
            inbound.push_back(InboundMessage {
                topic: publish.topic,
                payload: publish.payload.to_vec(),
            });
        }
        Event::Incoming(Packet::Disconnect) => {
            return Err(TransportError::ConnectionLost(
                "broker enviou DISCONNECT".into(),
            ));
        }
        other => debug!("MQTT: {other:?}"),
    }
    Ok(())
}

impl BrokerTransport for MqttTransport {
    fn connect(&mut self, timeout: Duration) -> Result<(), TransportError> {
        self.close();

        let mut options = MqttOptions::new(self.client_id.clone(), self.host.clone(), self.port);
        options.set_keep_alive(self.keep_alive);
        let (client, mut connection) = Client::new(options, REQUEST_CAPACITY);

        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(TransportError::Timeout(timeout));
            }
            match connection.recv_timeout(remaining) {
                Ok(Ok(Event::Incoming(Packet::ConnAck(ack)))) => {
                    if ack.code != ConnectReturnCode::Success {
                        return Err(TransportError::Refused(format!("{:?}", ack.code)));
                    }
                    self.link = Some(MqttLink { client, connection });
                    return Ok(());
                }
                Ok(Ok(event)) => debug!("MQTT (conectando): {event:?}"),
                Ok(Err(e)) => return Err(TransportError::Refused(e.to_string())),
                Err(RecvTimeoutError::Timeout) => return Err(TransportError::Timeout(timeout)),
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(TransportError::ConnectionLost(
                        "event loop encerrado".into(),
                    ));
                }
            }
        }
    }

    fn subscribe(&mut self, topic: &str, guarantee: DeliveryGuarantee) -> Result<(), TransportError> {
        let timeout = self.ack_timeout;
        let link = self.link.as_mut().ok_or(TransportError::NotConnected)?;
        link.client
            .try_subscribe(topic, qos(guarantee))
            .map_err(client_error)?;
        pump_until(&mut link.connection, &mut self.inbound, timeout, |e| {
            matches!(e, Event::Incoming(Packet::SubAck(_)))
        })
    }

    fn unsubscribe(&mut self, topic: &str) -> Result<(), TransportError> {
        let link = self.link.as_mut().ok_or(TransportError::NotConnected)?;
        link.client.try_unsubscribe(topic).map_err(client_error)?;
        pump_until(&mut link.connection, &mut self.inbound, CLOSE_GRACE, |e| {
            matches!(e, Event::Outgoing(Outgoing::Unsubscribe(_)))
        })
    }

    fn publish(
        &mut self,
        message: &OutboundMessage,
        timeout: Duration,
    ) -> Result<Delivery, TransportError> {
        if self.awaiting.is_some() {
            return Err(TransportError::Busy);
        }
        let link = self.link.as_mut().ok_or(TransportError::NotConnected)?;
        let level = qos(message.qos);
        link.client
            .try_publish(
                message.topic.clone(),
                level,
                message.retain,
                message.payload.clone(),
            )
            .map_err(client_error)?;

        self.awaiting = Some(Awaiting::Write { qos: level });
        let awaiting = &mut self.awaiting;
        match pump_until(&mut link.connection, &mut self.inbound, timeout, |e| {
            track(awaiting, e)
        }) {
            Ok(()) => Ok(Delivery::Confirmed),
            Err(TransportError::Timeout(_)) => Ok(Delivery::Pending),
            Err(e) => Err(e),
        }
    }

    fn poll(&mut self, timeout: Duration) -> Result<Polled, TransportError> {
        let link = self.link.as_mut().ok_or(TransportError::NotConnected)?;
        let mut confirmed = false;
        match link.connection.recv_timeout(timeout) {
            Ok(Ok(event)) => {
                if track(&mut self.awaiting, &event) {
                    confirmed = true;
                } else {
                    absorb(event, &mut self.inbound)?;
                }
            }
            Ok(Err(e)) => return Err(TransportError::ConnectionLost(e.to_string())),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                return Err(TransportError::ConnectionLost(
                    "event loop encerrado".into(),
                ));
            }
        }
        Ok(Polled {
            inbound: self.inbound.drain(..).collect(),
            confirmed,
        })
    }

    fn close(&mut self) {
        // Sessão limpa: o que estava em voo morre com a conexão
        self.awaiting = None;
        let Some(mut link) = self.link.take() else {
            return;
        };
        if link.client.try_disconnect().is_ok() {
            let _ = pump_until(&mut link.connection, &mut self.inbound, CLOSE_GRACE, |e| {
                matches!(e, Event::Outgoing(Outgoing::Disconnect))
            });
        }
        debug!("Conexão MQTT com {}:{} liberada", self.host, self.port);
    }
}
