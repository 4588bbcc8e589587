//! Publisher do broker: handle usado pelo relay + thread dona da conexão.
//!
//! O relay só enfileira ([`Publisher::publish_telemetry`],
//! [`Publisher::publish_alert`]) e nunca bloqueia em rede. A thread
//! `broker-publisher` conecta, reconecta, esvazia a outbox na ordem de
//! chegada e reporta eventos pelo canal lido em [`Publisher::try_event`].

use crate::error::{ConnectivityError, RelayError};
use crate::mqtt_transport::MqttTransport;
use crate::outbox::{Admission, MessageClass, OutboundMessage, Outbox};
use crate::relay::Outbound;
use crate::retry::{RetryPolicy, RetrySchedule, RetryTimer, StopAwareTimer, StopSignal};
use crate::session::{BrokerSession, ConnectionState, Established, SessionOptions};
use crate::transport::{BrokerTransport, Delivery, DeliveryGuarantee, InboundMessage, Polled};
use crossbeam_channel::{Receiver, Sender, bounded, unbounded};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use telemetry_core::config::BrokerConfig;
use telemetry_core::protocol::{encode_alert, encode_telemetry};
use telemetry_core::types::{AlertMessage, TelemetryRecord};
use tracing::{debug, error, info, warn};

/// Evento enviado da thread do publisher para o relay.
#[derive(Debug, Clone, PartialEq)]
pub enum PublisherEvent {
    StateChanged(ConnectionState),
    Inbound(InboundMessage),
    /// Tentativas esgotadas. Enviado uma única vez.
    Fatal(ConnectivityError),
}

// ──────────────────────────────────────────────
// Estatísticas
// ──────────────────────────────────────────────

#[derive(Debug, Default)]
struct PublisherStats {
    telemetry_published: AtomicU64,
    alerts_published: AtomicU64,
    telemetry_evicted: AtomicU64,
    telemetry_rejected: AtomicU64,
    publish_failures: AtomicU64,
    redelivered: AtomicU64,
    encode_failures: AtomicU64,
    dropped_closed: AtomicU64,
    dropped_pending: AtomicU64,
}

/// Cópia dos contadores do publisher.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub telemetry_published: u64,
    pub alerts_published: u64,
    /// Telemetria antiga descartada com a outbox cheia
    pub telemetry_evicted: u64,
    /// Telemetria nova recusada (outbox cheia só de alertas)
    pub telemetry_rejected: u64,
    /// Tentativas de envio que falharam (mensagem volta para a fila)
    pub publish_failures: u64,
    /// Sem confirmação quando a conexão caiu; reenviadas na reconexão
    pub redelivered: u64,
    pub encode_failures: u64,
    /// Publicações pedidas depois do encerramento
    pub dropped_closed: u64,
    /// Pendentes na outbox no encerramento
    pub dropped_pending: u64,
}

impl PublisherStats {
    fn bump(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    fn record_published(&self, class: MessageClass) {
        match class {
            MessageClass::Telemetry => Self::bump(&self.telemetry_published, 1),
            MessageClass::Alert => Self::bump(&self.alerts_published, 1),
        }
    }

    fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            telemetry_published: self.telemetry_published.load(Ordering::Relaxed),
            alerts_published: self.alerts_published.load(Ordering::Relaxed),
            telemetry_evicted: self.telemetry_evicted.load(Ordering::Relaxed),
            telemetry_rejected: self.telemetry_rejected.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
            redelivered: self.redelivered.load(Ordering::Relaxed),
            encode_failures: self.encode_failures.load(Ordering::Relaxed),
            dropped_closed: self.dropped_closed.load(Ordering::Relaxed),
            dropped_pending: self.dropped_pending.load(Ordering::Relaxed),
        }
    }
}

struct Shared {
    outbox: Mutex<Outbox>,
    stats: PublisherStats,
}

impl Shared {
    fn outbox(&self) -> MutexGuard<'_, Outbox> {
        self.outbox.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ──────────────────────────────────────────────
// Handle
// ──────────────────────────────────────────────

pub struct Publisher {
    shared: Arc<Shared>,
    events: Receiver<PublisherEvent>,
    stop_tx: Option<Sender<()>>,
    worker: Option<JoinHandle<()>>,
    telemetry_topic: String,
    alert_topic: String,
    retain_alerts: bool,
}

impl Publisher {
    /// Inicia o publisher MQTT real. A conexão acontece em background.
    pub fn start(config: &BrokerConfig) -> Result<Self, RelayError> {
        info!("Iniciando publisher MQTT → {}", config.address());
        Self::start_with(config, MqttTransport::new(config), StopAwareTimer::new)
    }

    /// Inicia com transporte e timer injetados.
    pub fn start_with<T, R, F>(
        config: &BrokerConfig,
        transport: T,
        make_timer: F,
    ) -> Result<Self, RelayError>
    where
        T: BrokerTransport + 'static,
        R: RetryTimer + 'static,
        F: FnOnce(StopSignal) -> R,
    {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let stop = StopSignal::new(stop_rx);
        let (event_tx, event_rx) = unbounded();

        let shared = Arc::new(Shared {
            outbox: Mutex::new(Outbox::new(config.outbox_capacity)),
            stats: PublisherStats::default(),
        });

        let session = BrokerSession::new(
            transport,
            make_timer(stop.clone()),
            RetrySchedule::new(RetryPolicy::from_config(&config.retry)),
            SessionOptions {
                broker: config.address(),
                subscriptions: config.subscriptions.clone(),
                connect_timeout: config.connect_timeout(),
                publish_timeout: config.publish_timeout(),
            },
            event_tx.clone(),
        );

        let worker = Worker {
            session,
            shared: Arc::clone(&shared),
            events: event_tx,
            stop,
            poll_interval: config.poll_interval(),
            publish_timeout: config.publish_timeout(),
            in_flight: None,
        };

        let handle = std::thread::Builder::new()
            .name("broker-publisher".into())
            .spawn(move || worker.run())
            .map_err(|source| RelayError::Spawn {
                name: "broker-publisher",
                source,
            })?;

        Ok(Self {
            shared,
            events: event_rx,
            stop_tx: Some(stop_tx),
            worker: Some(handle),
            telemetry_topic: config.telemetry_topic.clone(),
            alert_topic: config.alert_topic.clone(),
            retain_alerts: config.retain_alerts,
        })
    }

    /// Telemetria: at-least-once. Nunca falha; descartes são contados.
    pub fn publish_telemetry(&self, record: &TelemetryRecord) {
        match encode_telemetry(record) {
            Ok(payload) => self.enqueue(OutboundMessage {
                class: MessageClass::Telemetry,
                topic: self.telemetry_topic.clone(),
                payload,
                qos: DeliveryGuarantee::AtLeastOnce,
                retain: false,
            }),
            Err(e) => {
                PublisherStats::bump(&self.shared.stats.encode_failures, 1);
                warn!("Telemetria não serializada: {e}");
            }
        }
    }

    /// Alerta: exactly-once, retido no broker se configurado.
    pub fn publish_alert(&self, alert: &AlertMessage) {
        match encode_alert(alert) {
            Ok(payload) => self.enqueue(OutboundMessage {
                class: MessageClass::Alert,
                topic: self.alert_topic.clone(),
                payload,
                qos: DeliveryGuarantee::ExactlyOnce,
                retain: self.retain_alerts,
            }),
            Err(e) => {
                PublisherStats::bump(&self.shared.stats.encode_failures, 1);
                error!("Alerta não serializado: {e}");
            }
        }
    }

    fn enqueue(&self, message: OutboundMessage) {
        let class = message.class;
        let admission = self.shared.outbox().push(message);
        let stats = &self.shared.stats;

        match admission {
            Admission::Queued { evicted: 0 } => {}
            Admission::Queued { evicted } => {
                PublisherStats::bump(&stats.telemetry_evicted, evicted as u64);
                debug!("Outbox cheia, {evicted} telemetria(s) antiga(s) descartada(s)");
            }
            Admission::RejectedFull => {
                PublisherStats::bump(&stats.telemetry_rejected, 1);
                debug!("Outbox cheia de alertas, telemetria descartada");
            }
            Admission::RejectedClosed => {
                PublisherStats::bump(&stats.dropped_closed, 1);
                if class == MessageClass::Alert {
                    warn!("Alerta descartado: publisher encerrado");
                } else {
                    debug!("Telemetria descartada: publisher encerrado");
                }
            }
        }
    }

    /// Próximo evento da thread do publisher, sem bloquear.
    pub fn try_event(&self) -> Option<PublisherEvent> {
        self.events.try_recv().ok()
    }

    /// Mensagens aguardando envio.
    pub fn pending(&self) -> usize {
        self.shared.outbox().len()
    }

    /// Encerra: esvazia a outbox dentro do publish timeout, libera a
    /// conexão e aguarda a thread.
    pub fn stop(mut self) -> StatsSnapshot {
        self.shutdown();
        self.shared.stats.snapshot()
    }

    fn shutdown(&mut self) {
        // Descartar o emissor sinaliza o stop
        drop(self.stop_tx.take());
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                error!("Thread broker-publisher terminou com panic");
            }
        }
    }
}

impl Drop for Publisher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Outbound for Publisher {
    fn publish_telemetry(&self, record: &TelemetryRecord) {
        Publisher::publish_telemetry(self, record);
    }

    fn publish_alert(&self, alert: &AlertMessage) {
        Publisher::publish_alert(self, alert);
    }

    fn poll_event(&self) -> Option<PublisherEvent> {
        self.try_event()
    }
}

// ──────────────────────────────────────────────
// Thread do publisher
// ──────────────────────────────────────────────

struct Worker<T, R> {
    session: BrokerSession<T, R>,
    shared: Arc<Shared>,
    events: Sender<PublisherEvent>,
    stop: StopSignal,
    poll_interval: Duration,
    publish_timeout: Duration,
    /// Entregue ao cliente, aguardando confirmação do broker
    in_flight: Option<OutboundMessage>,
}

impl<T: BrokerTransport, R: RetryTimer> Worker<T, R> {
    fn run(mut self) {
        debug!("Thread broker-publisher iniciada");

        while !self.stop.is_raised() {
            if self.session.is_connected() {
                self.flush();
                self.keep_alive();
                continue;
            }

            self.redeliver_in_flight();
            match self.session.establish() {
                Ok(Established::Connected) => {}
                Ok(Established::Cancelled) => break,
                Err(fatal) => {
                    error!("{fatal}");
                    let pending = self.shared.outbox().close();
                    PublisherStats::bump(&self.shared.stats.dropped_pending, pending.len() as u64);
                    let _ = self.events.send(PublisherEvent::Fatal(fatal));
                    self.session.shutdown();
                    return;
                }
            }
        }

        self.drain_on_stop();
        self.session.shutdown();
        debug!("Thread broker-publisher encerrada ({})", self.session.state());
    }

    /// A conexão caiu antes da confirmação: a mensagem volta para a frente
    /// da fila e sai de novo na próxima conexão.
    fn redeliver_in_flight(&mut self) {
        if let Some(message) = self.in_flight.take() {
            warn!("Publicação em {} sem confirmação, será reenviada", message.topic);
            PublisherStats::bump(&self.shared.stats.redelivered, 1);
            self.shared.outbox().requeue_front(message);
        }
    }

    /// Envia na ordem de chegada até a fila esvaziar, um envio falhar ou
    /// uma publicação ficar aguardando confirmação.
    fn flush(&mut self) {
        while self.in_flight.is_none() {
            let Some(message) = self.shared.outbox().pop_front() else {
                return;
            };
            if !self.send(message) {
                return;
            }
        }
    }

    /// Retorna `true` se a mensagem foi confirmada.
    fn send(&mut self, message: OutboundMessage) -> bool {
        match self.session.publish(&message) {
            Ok(Delivery::Confirmed) => {
                self.shared.stats.record_published(message.class);
                true
            }
            Ok(Delivery::Pending) => {
                debug!("Publicação em {} aguardando confirmação", message.topic);
                self.in_flight = Some(message);
                false
            }
            Err(e) => {
                PublisherStats::bump(&self.shared.stats.publish_failures, 1);
                debug!("Publicação em {} adiada: {e}", message.topic);
                self.shared.outbox().requeue_front(message);
                false
            }
        }
    }

    fn keep_alive(&mut self) {
        // Erros já levaram a sessão para DISCONNECTED
        if let Ok(polled) = self.session.poll(self.poll_interval) {
            self.absorb(polled);
        }
    }

    fn absorb(&mut self, polled: Polled) {
        if polled.confirmed {
            if let Some(message) = self.in_flight.take() {
                debug!("Publicação em {} confirmada", message.topic);
                self.shared.stats.record_published(message.class);
            }
        }
        for message in polled.inbound {
            debug!("Mensagem recebida em {}", message.topic);
            let _ = self.events.send(PublisherEvent::Inbound(message));
        }
    }

    fn drain_on_stop(&mut self) {
        let deadline = Instant::now() + self.publish_timeout;
        while self.session.is_connected() && Instant::now() < deadline {
            if self.in_flight.is_none() {
                let Some(message) = self.shared.outbox().pop_front() else {
                    break;
                };
                if self.send(message) {
                    continue;
                }
            }
            if self.session.is_connected() {
                if let Ok(polled) = self.session.poll(Duration::from_millis(10)) {
                    self.absorb(polled);
                }
            }
        }

        let mut pending = self.shared.outbox().close();
        pending.extend(self.in_flight.take());
        if !pending.is_empty() {
            warn!(
                "{} mensagem(ns) pendente(s) ou sem confirmação descartada(s) no encerramento",
                pending.len()
            );
            PublisherStats::bump(&self.shared.stats.dropped_pending, pending.len() as u64);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::fake::RecordingTimer;
    use crate::transport::fake::FakeTransport;
    use chrono::{TimeZone, Utc};
    use telemetry_core::config::{BackoffKind, RetryConfig};

    fn config(outbox_capacity: usize, max_retries: u32) -> BrokerConfig {
        BrokerConfig {
            outbox_capacity,
            poll_interval_ms: 5,
            publish_timeout_ms: 500,
            retry: RetryConfig {
                max_retries,
                retry_delay_ms: 1,
                backoff: BackoffKind::Fixed,
                max_retry_delay_ms: 1,
            },
            ..Default::default()
        }
    }

    fn record(volts: f64) -> TelemetryRecord {
        TelemetryRecord {
            altitude: 100.0,
            airspeed: 15.0,
            battery_voltage: volts,
            timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        }
    }

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    fn volts_of(message: &OutboundMessage) -> f64 {
        let value: serde_json::Value = serde_json::from_slice(&message.payload).unwrap();
        value
            .get("battery_voltage")
            .or_else(|| value.get("current_voltage"))
            .and_then(serde_json::Value::as_f64)
            .unwrap()
    }

    #[test]
    fn queued_during_disconnect_delivered_in_order() {
        let transport = FakeTransport::new(false);
        let timer = RecordingTimer::with_pause(Duration::from_millis(2));
        let publisher =
            Publisher::start_with(&config(3, 10_000), transport.clone(), |_| timer).unwrap();

        for v in [25.0, 24.9, 24.8, 24.7, 24.6] {
            publisher.publish_telemetry(&record(v));
        }
        publisher.publish_alert(&AlertMessage::critical(21.0, &record(20.9)));
        assert_eq!(publisher.pending(), 3);

        transport.set_online(true);
        assert!(wait_until(|| transport.published_count() == 3));

        let broker = transport.broker.lock().unwrap();
        let volts: Vec<f64> = broker.published.iter().map(volts_of).collect();
        assert_eq!(volts, vec![24.7, 24.6, 20.9]);
        assert_eq!(broker.published[2].class, MessageClass::Alert);
        drop(broker);

        let stats = publisher.stop();
        assert_eq!(stats.telemetry_evicted, 3);
        assert_eq!(stats.telemetry_published, 2);
        assert_eq!(stats.alerts_published, 1);
    }

    #[test]
    fn fatal_reported_exactly_once() {
        let transport = FakeTransport::new(false);
        let timer = RecordingTimer::default();
        let publisher =
            Publisher::start_with(&config(8, 3), transport.clone(), |_| timer.clone()).unwrap();

        let mut fatal = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        while fatal.is_empty() && Instant::now() < deadline {
            match publisher.events.recv_timeout(Duration::from_millis(50)) {
                Ok(PublisherEvent::Fatal(e)) => fatal.push(e),
                _ => {}
            }
        }
        std::thread::sleep(Duration::from_millis(50));
        let more = publisher
            .events
            .try_iter()
            .filter(|e| matches!(e, PublisherEvent::Fatal(_)))
            .count();

        assert_eq!(fatal.len(), 1);
        assert_eq!(more, 0);
        assert_eq!(fatal[0].attempts, 3);
        assert_eq!(transport.broker.lock().unwrap().connect_attempts, 3);
        assert_eq!(timer.waits().len(), 2);

        // Depois da falha fatal publicar não levanta erro, só conta
        publisher.publish_telemetry(&record(24.0));
        let stats = publisher.stop();
        assert_eq!(stats.dropped_closed, 1);
    }

    #[test]
    fn alerts_use_exactly_once_and_retain() {
        let transport = FakeTransport::new(true);
        let publisher =
            Publisher::start_with(&config(8, 3), transport.clone(), |_| RecordingTimer::default())
                .unwrap();

        publisher.publish_telemetry(&record(23.0));
        publisher.publish_alert(&AlertMessage::warning(21.0, &record(21.8)));
        assert!(wait_until(|| transport.published_count() == 2));

        let broker = transport.broker.lock().unwrap();
        assert_eq!(broker.published[0].topic, "mavlink/telemetry");
        assert_eq!(broker.published[0].qos, DeliveryGuarantee::AtLeastOnce);
        assert!(!broker.published[0].retain);
        assert_eq!(broker.published[1].topic, "mavlink/alert");
        assert_eq!(broker.published[1].qos, DeliveryGuarantee::ExactlyOnce);
        assert!(broker.published[1].retain);
    }

    #[test]
    fn unconfirmed_alert_is_not_sent_twice() {
        let transport = FakeTransport::new(true);
        transport.broker.lock().unwrap().hold_acks = true;
        let publisher =
            Publisher::start_with(&config(8, 3), transport.clone(), |_| RecordingTimer::default())
                .unwrap();

        publisher.publish_alert(&AlertMessage::critical(21.0, &record(20.5)));
        publisher.publish_telemetry(&record(20.4));
        assert!(wait_until(|| transport.published_count() == 1));

        // Confirmação atrasada: nada é reenviado nem contado como publicado
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(transport.published_count(), 1);
        assert_eq!(publisher.shared.stats.snapshot().alerts_published, 0);

        transport.broker.lock().unwrap().hold_acks = false;
        assert!(wait_until(|| {
            publisher.shared.stats.snapshot().telemetry_published == 1
        }));

        let stats = publisher.stop();
        let broker = transport.broker.lock().unwrap();
        assert_eq!(broker.published.len(), 2);
        assert_eq!(broker.published[0].class, MessageClass::Alert);
        assert_eq!(broker.published[1].class, MessageClass::Telemetry);
        assert_eq!(stats.alerts_published, 1);
        assert_eq!(stats.redelivered, 0);
    }

    #[test]
    fn unconfirmed_alert_is_resent_after_reconnect() {
        let transport = FakeTransport::new(true);
        transport.broker.lock().unwrap().hold_acks = true;
        let timer = RecordingTimer::with_pause(Duration::from_millis(2));
        let publisher =
            Publisher::start_with(&config(8, 10_000), transport.clone(), |_| timer).unwrap();

        publisher.publish_alert(&AlertMessage::critical(21.0, &record(20.5)));
        assert!(wait_until(|| transport.published_count() == 1));

        // Conexão cai com o alerta sem confirmação
        transport.set_online(false);
        let attempts = transport.broker.lock().unwrap().connect_attempts;
        assert!(wait_until(|| {
            transport.broker.lock().unwrap().connect_attempts > attempts
        }));
        {
            let mut broker = transport.broker.lock().unwrap();
            broker.hold_acks = false;
            broker.online = true;
        }

        assert!(wait_until(|| {
            publisher.shared.stats.snapshot().alerts_published == 1
        }));
        let stats = publisher.stop();
        let broker = transport.broker.lock().unwrap();
        assert_eq!(broker.published.len(), 2);
        assert_eq!(broker.published[0], broker.published[1]);
        assert_eq!(stats.redelivered, 1);
        assert_eq!(stats.dropped_pending, 0);
    }

    #[test]
    fn stop_releases_connection() {
        let transport = FakeTransport::new(true);
        let mut cfg = config(8, 3);
        cfg.subscriptions = vec!["mavlink/command".into()];
        let publisher =
            Publisher::start_with(&cfg, transport.clone(), |_| RecordingTimer::default()).unwrap();

        assert!(wait_until(|| {
            !transport.broker.lock().unwrap().subscribed.is_empty()
        }));
        publisher.publish_telemetry(&record(24.0));
        let stats = publisher.stop();

        let broker = transport.broker.lock().unwrap();
        assert_eq!(broker.published.len(), 1);
        assert_eq!(stats.telemetry_published, 1);
        assert_eq!(broker.unsubscribed, vec!["mavlink/command".to_string()]);
        assert!(broker.closed >= 1);
    }

    #[test]
    fn forwards_inbound_messages() {
        let transport = FakeTransport::new(true);
        let mut cfg = config(8, 3);
        cfg.subscriptions = vec!["mavlink/command".into()];
        let publisher =
            Publisher::start_with(&cfg, transport.clone(), |_| RecordingTimer::default()).unwrap();

        transport
            .broker
            .lock()
            .unwrap()
            .inbound
            .push_back(InboundMessage {
                topic: "mavlink/command".into(),
                payload: b"RTL".to_vec(),
            });

        let mut received = None;
        let deadline = Instant::now() + Duration::from_secs(5);
        while received.is_none() && Instant::now() < deadline {
            if let Ok(PublisherEvent::Inbound(m)) =
                publisher.events.recv_timeout(Duration::from_millis(50))
            {
                received = Some(m);
            }
        }
        assert_eq!(received.unwrap().payload, b"RTL".to_vec());
    }
}
