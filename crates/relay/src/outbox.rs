//! Fila limitada de publicações pendentes.
//!
//! Preserva a ordem de chegada. Quando cheia, descarta a telemetria mais
//! antiga; alertas nunca são descartados.

use crate::transport::DeliveryGuarantee;
use std::collections::VecDeque;

/// Classe da mensagem, decide a política de descarte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageClass {
    Telemetry,
    Alert,
}

/// Mensagem pronta para o broker (payload já serializado).
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub class: MessageClass,
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: DeliveryGuarantee,
    pub retain: bool,
}

/// Resultado de [`Outbox::push`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Enfileirada; `evicted` telemetrias antigas foram descartadas.
    Queued { evicted: usize },
    /// Fila cheia só com alertas: a telemetria nova é descartada.
    RejectedFull,
    /// Publisher encerrado.
    RejectedClosed,
}

#[derive(Debug)]
pub struct Outbox {
    queue: VecDeque<OutboundMessage>,
    capacity: usize,
    closed: bool,
}

impl Outbox {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
            closed: false,
        }
    }

    pub fn push(&mut self, message: OutboundMessage) -> Admission {
        if self.closed {
            return Admission::RejectedClosed;
        }

        let mut evicted = 0;
        while self.queue.len() >= self.capacity {
            match self
                .queue
                .iter()
                .position(|m| m.class == MessageClass::Telemetry)
            {
                Some(index) => {
                    self.queue.remove(index);
                    evicted += 1;
                }
                None => break,
            }
        }

        // Só alertas na fila: alerta entra acima da capacidade
        if self.queue.len() >= self.capacity && message.class == MessageClass::Telemetry {
            return Admission::RejectedFull;
        }

        self.queue.push_back(message);
        Admission::Queued { evicted }
    }

    /// Retira a próxima mensagem para envio.
    pub fn pop_front(&mut self) -> Option<OutboundMessage> {
        self.queue.pop_front()
    }

    /// Devolve uma mensagem cujo envio falhou, mantendo a ordem original.
    pub fn requeue_front(&mut self, message: OutboundMessage) {
        self.queue.push_front(message);
    }

    /// Fecha a fila e devolve o que ficou pendente.
    pub fn close(&mut self) -> Vec<OutboundMessage> {
        self.closed = true;
        self.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(class: MessageClass, n: u8) -> OutboundMessage {
        OutboundMessage {
            class,
            topic: match class {
                MessageClass::Telemetry => "mavlink/telemetry".into(),
                MessageClass::Alert => "mavlink/alert".into(),
            },
            payload: vec![n],
            qos: DeliveryGuarantee::AtLeastOnce,
            retain: false,
        }
    }

    fn payloads(outbox: &mut Outbox) -> Vec<u8> {
        std::iter::from_fn(|| outbox.pop_front())
            .map(|m| m.payload[0])
            .collect()
    }

    #[test]
    fn preserves_arrival_order() {
        let mut outbox = Outbox::new(8);
        for n in 0..4 {
            outbox.push(message(MessageClass::Telemetry, n));
        }
        assert_eq!(payloads(&mut outbox), vec![0, 1, 2, 3]);
    }

    #[test]
    fn overflow_evicts_oldest_telemetry() {
        let mut outbox = Outbox::new(3);
        outbox.push(message(MessageClass::Telemetry, 1));
        outbox.push(message(MessageClass::Alert, 2));
        outbox.push(message(MessageClass::Telemetry, 3));
        assert_eq!(
            outbox.push(message(MessageClass::Telemetry, 4)),
            Admission::Queued { evicted: 1 }
        );
        assert_eq!(payloads(&mut outbox), vec![2, 3, 4]);
    }

    #[test]
    fn alerts_are_never_evicted() {
        let mut outbox = Outbox::new(2);
        outbox.push(message(MessageClass::Alert, 1));
        outbox.push(message(MessageClass::Alert, 2));
        assert_eq!(
            outbox.push(message(MessageClass::Telemetry, 3)),
            Admission::RejectedFull
        );
        assert_eq!(
            outbox.push(message(MessageClass::Alert, 4)),
            Admission::Queued { evicted: 0 }
        );
        assert_eq!(payloads(&mut outbox), vec![1, 2, 4]);
    }

    #[test]
    fn requeued_message_goes_first() {
        let mut outbox = Outbox::new(4);
        outbox.push(message(MessageClass::Telemetry, 1));
        outbox.push(message(MessageClass::Telemetry, 2));
        let first = outbox.pop_front().unwrap();
        outbox.requeue_front(first);
        assert_eq!(payloads(&mut outbox), vec![1, 2]);
    }

    #[test]
    fn closed_outbox_rejects() {
        let mut outbox = Outbox::new(4);
        outbox.push(message(MessageClass::Alert, 1));
        assert_eq!(outbox.close().len(), 1);
        assert_eq!(
            outbox.push(message(MessageClass::Alert, 2)),
            Admission::RejectedClosed
        );
        assert_eq!(outbox.len(), 0);
    }
}
