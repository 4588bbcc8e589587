//! Erros fatais do relay.
//!
//! Erros por mensagem (decode, publish) nunca chegam aqui: são logados e
//! contados onde acontecem.

use crate::session::ConnectionState;
use crate::transport::TransportError;
use std::net::SocketAddr;
use telemetry_core::config::ConfigError;

/// Broker inacessível depois de esgotar as tentativas de reconexão.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error(
    "Broker {broker} inacessível após {attempts} tentativas (último estado: {last_state}): {last_error}"
)]
pub struct ConnectivityError {
    pub broker: String,
    pub attempts: u32,
    pub last_state: ConnectionState,
    pub last_error: TransportError,
}

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Endereço inválido {addr}: {reason}")]
    Address { addr: String, reason: String },

    #[error("Falha ao bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("Argumento inválido: {0}")]
    Usage(String),

    #[error("Falha ao instalar handler de sinal: {0}")]
    Signal(#[from] ctrlc::Error),

    #[error("Falha ao criar thread {name}: {source}")]
    Spawn {
        name: &'static str,
        source: std::io::Error,
    },

    #[error(transparent)]
    Connectivity(#[from] ConnectivityError),
}
