//! # MAVLink Relay
//!
//! Recebe telemetria JSON via UDP, avalia a tensão da bateria e publica
//! telemetria e alertas em um broker MQTT.
//!
//! ## Uso
//! ```bash
//! mavlink_relay                       # config.toml ao lado do executável
//! mavlink_relay --config relay.toml   # arquivo explícito
//! ```
//!
//! Variáveis de ambiente (`MAVLINK_HOST`, `MQTT_BROKER`, ...) sobrescrevem
//! o arquivo. `RUST_LOG` controla o nível de log.

mod error;
mod mqtt_transport;
mod outbox;
mod publisher;
mod relay;
mod retry;
mod session;
mod transport;
mod udp_source;

use error::RelayError;
use publisher::Publisher;
use relay::Relay;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use telemetry_core::config::AppConfig;
use tracing::{error, info, warn};
use udp_source::UdpSource;

fn main() -> ExitCode {
    // ── Logging ──
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn config_path_from_args() -> Result<PathBuf, RelayError> {
    let mut args = std::env::args().skip(1);
    let mut path = None;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" | "-c" => match args.next() {
                Some(p) => path = Some(PathBuf::from(p)),
                None => return Err(RelayError::Usage("--config requer um caminho".into())),
            },
            other => return Err(RelayError::Usage(format!("argumento desconhecido: {other}"))),
        }
    }
    Ok(path.unwrap_or_else(AppConfig::default_path))
}

fn run() -> Result<(), RelayError> {
    // ── Carregar config ──
    let config_path = config_path_from_args()?;
    let mut config = AppConfig::load(&config_path)?;

    // Salva config padrão se não existir
    if !config_path.exists() {
        if let Err(e) = config.save(&config_path) {
            warn!("Não foi possível salvar config padrão: {e}");
        }
    }

    config.apply_env_overrides()?;
    let config = config.validated()?;

    // ── Sinais ──
    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = Arc::clone(&stop);
        ctrlc::set_handler(move || {
            info!("Sinal de encerramento recebido");
            stop.store(true, Ordering::SeqCst);
        })?;
    }

    // ── Socket UDP ──
    let mut source = UdpSource::bind(&config.listen)?;

    // ── Banner ──
    println!();
    println!("══════════════════════════════════════════════");
    println!("   ⚡ MAVLINK RELAY – ATIVO (Rust)");
    println!("══════════════════════════════════════════════");
    println!("  UDP:       {}", config.listen.address());
    println!("  Broker:    {}", config.broker.address());
    println!("  Tópicos:   {} | {}", config.broker.telemetry_topic, config.broker.alert_topic);
    println!(
        "  Bateria:   aviso < {:.1}V | crítico < {:.1}V",
        config.alerts.warning_voltage, config.alerts.critical_voltage
    );
    println!("══════════════════════════════════════════════");
    println!();

    // ── Publisher + loop principal ──
    let publisher = Publisher::start(&config.broker)?;
    let mut relay = Relay::new(&config, publisher);
    let result = relay.run(&mut source, &stop);

    let relay_stats = relay.stats();
    let last_volts = relay.last_record().map(|r| r.battery_voltage);
    let history = (relay.history_len(), relay.battery_range());
    let publisher = relay.into_outbound();
    let pending = publisher.pending();
    if pending > 0 {
        info!("Encerrando publisher com {pending} mensagem(ns) na outbox");
    }
    let publisher_stats = publisher.stop();

    info!(
        "Resumo: {} datagramas | {} relayados | {} rejeitados | {} alertas | {} mensagens recebidas",
        relay_stats.datagrams,
        relay_stats.relayed,
        relay_stats.rejected,
        relay_stats.alerts,
        relay_stats.inbound
    );
    info!(
        "Publicados: {} telemetria, {} alertas | descartados: {} antigos, {} recusados, {} pendentes, {} após encerramento | falhas de envio: {} | reenviadas: {} | erros de serialização: {}",
        publisher_stats.telemetry_published,
        publisher_stats.alerts_published,
        publisher_stats.telemetry_evicted,
        publisher_stats.telemetry_rejected,
        publisher_stats.dropped_pending,
        publisher_stats.dropped_closed,
        publisher_stats.publish_failures,
        publisher_stats.redelivered,
        publisher_stats.encode_failures
    );
    if let Some(volts) = last_volts {
        info!("Última tensão de bateria: {volts:.2}V");
    }
    if let (count, Some((lo, hi))) = history {
        info!("Histórico: {count} registro(s), bateria entre {lo:.2}V e {hi:.2}V");
    }

    result.map(|_| ())
}
