//! Socket UDP que recebe os datagramas JSON do produtor MAVLink.

use crate::error::RelayError;
use chrono::{DateTime, Utc};
use std::net::{IpAddr, SocketAddr, ToSocketAddrs, UdpSocket};
use telemetry_core::config::ListenConfig;
use tracing::{debug, info};

/// Um datagrama recebido.
#[derive(Debug)]
pub struct Datagram<'a> {
    pub payload: &'a [u8],
    pub source: SocketAddr,
    pub received_at: DateTime<Utc>,
}

/// Origem de datagramas lida pelo loop do relay.
pub trait DatagramSource {
    /// Lê um datagrama. `Ok(None)` quando não há nada a entregar agora.
    fn recv(&mut self) -> std::io::Result<Option<Datagram<'_>>>;
}

pub struct UdpSource {
    socket: UdpSocket,
    source_filter: Option<IpAddr>,
    buf: Vec<u8>,
}

impl UdpSource {
    /// Abre o socket. Qualquer falha aqui é erro de configuração fatal.
    pub fn bind(config: &ListenConfig) -> Result<Self, RelayError> {
        let addr_text = config.address();
        let addr = addr_text
            .to_socket_addrs()
            .map_err(|e| RelayError::Address {
                addr: addr_text.clone(),
                reason: e.to_string(),
            })?
            .next()
            .ok_or_else(|| RelayError::Address {
                addr: addr_text.clone(),
                reason: "nenhum endereço resolvido".into(),
            })?;

        let source_filter = if config.source_ip.is_empty() {
            None
        } else {
            Some(
                config
                    .source_ip
                    .parse::<IpAddr>()
                    .map_err(|e| RelayError::Address {
                        addr: config.source_ip.clone(),
                        reason: e.to_string(),
                    })?,
            )
        };

        let socket =
            UdpSocket::bind(addr).map_err(|source| RelayError::Bind { addr, source })?;
        socket
            .set_read_timeout(Some(config.read_timeout()))
            .map_err(|source| RelayError::Bind { addr, source })?;

        let mode = match &source_filter {
            Some(ip) => ip.to_string(),
            None => "qualquer origem".into(),
        };
        info!(
            "Receiver escutando em {} – Origem: {mode}",
            socket.local_addr().unwrap_or(addr)
        );

        Ok(Self {
            socket,
            source_filter,
            buf: vec![0u8; config.max_datagram_size],
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

impl DatagramSource for UdpSource {
    /// `Ok(None)` em timeout ou origem filtrada.
    fn recv(&mut self) -> std::io::Result<Option<Datagram<'_>>> {
        match self.socket.recv_from(&mut self.buf) {
            Ok((size, source)) => {
                let received_at = Utc::now();
                if let Some(expected) = self.source_filter {
                    if source.ip() != expected {
                        debug!("Ignorando pacote de {source} (esperado: {expected})");
                        return Ok(None);
                    }
                }
                Ok(Some(Datagram {
                    payload: &self.buf[..size],
                    source,
                    received_at,
                }))
            }
            Err(ref e)
                if e.kind() == std::io::ErrorKind::TimedOut
                    || e.kind() == std::io::ErrorKind::WouldBlock =>
            {
                // Timeout normal, continua
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}
