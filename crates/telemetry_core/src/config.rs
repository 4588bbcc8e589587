//! Configuração unificada via TOML.
//!
//! Um único `config.toml` com seções `[listen]`, `[broker]`,
//! `[broker.retry]`, `[alerts]` e `[history]`. Variáveis de ambiente
//! sobrescrevem os valores do arquivo.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Erros de configuração. Sempre fatais na inicialização.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Erro ao ler {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Erro ao parsear {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Erro ao salvar {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Erro ao serializar configuração: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Variável de ambiente {var} inválida: {value:?}")]
    Env { var: &'static str, value: String },

    #[error("Configuração inválida: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

/// Socket UDP de entrada (produtor MAVLink/JSON).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenConfig {
    /// IP local para bind
    pub host: String,
    /// Porta UDP
    pub port: u16,
    /// IP do produtor (vazio = aceita qualquer origem)
    pub source_ip: String,
    /// Timeout de leitura do socket (ms); limita a latência do stop
    pub read_timeout_ms: u64,
    /// Maior datagrama aceito (bytes)
    pub max_datagram_size: usize,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 14550,
            source_ip: String::new(),
            read_timeout_ms: 1000,
            max_datagram_size: 4096,
        }
    }
}

impl ListenConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

/// Estratégia de espera entre tentativas de reconexão.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    Fixed,
    Exponential,
}

/// Política de reconexão ao broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Tentativas consecutivas antes da falha fatal
    pub max_retries: u32,
    /// Espera base entre tentativas (ms)
    pub retry_delay_ms: u64,
    pub backoff: BackoffKind,
    /// Teto da espera no modo exponencial (ms)
    pub max_retry_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 10,
            retry_delay_ms: 1000,
            backoff: BackoffKind::Exponential,
            max_retry_delay_ms: 30_000,
        }
    }
}

impl RetryConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn max_retry_delay(&self) -> Duration {
        Duration::from_millis(self.max_retry_delay_ms)
    }
}

/// Conexão com o broker MQTT.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub keep_alive_secs: u64,
    pub telemetry_topic: String,
    pub alert_topic: String,
    /// Publica alertas com a flag retain (assinantes tardios veem o último)
    pub retain_alerts: bool,
    /// Tópicos de entrada assinados a cada (re)conexão
    pub subscriptions: Vec<String>,
    pub connect_timeout_ms: u64,
    pub publish_timeout_ms: u64,
    /// Intervalo de polling da conexão (keep-alive e acks)
    pub poll_interval_ms: u64,
    /// Mensagens pendentes durante uma reconexão
    pub outbox_capacity: usize,
    pub retry: RetryConfig,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 1883,
            client_id: "mavlink_daemon".into(),
            keep_alive_secs: 60,
            telemetry_topic: "mavlink/telemetry".into(),
            alert_topic: "mavlink/alert".into(),
            retain_alerts: true,
            subscriptions: Vec::new(),
            connect_timeout_ms: 5000,
            publish_timeout_ms: 2000,
            poll_interval_ms: 20,
            outbox_capacity: 256,
            retry: RetryConfig::default(),
        }
    }
}

impl BrokerConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Thresholds de alerta de bateria (pack 6S).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertThresholds {
    pub critical_voltage: f64,
    pub warning_voltage: f64,
    /// Margem para sair de um nível (V)
    pub recovery_hysteresis: f64,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            critical_voltage: 21.0,
            warning_voltage: 22.0,
            recovery_hysteresis: 0.0,
        }
    }
}

/// Configuração de histórico.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    /// Registros mantidos no buffer de replay (0 = desativado)
    pub capacity: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self { capacity: 64 }
    }
}

/// Configuração raiz do relay.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub listen: ListenConfig,
    pub broker: BrokerConfig,
    pub alerts: AlertThresholds,
    pub history: HistoryConfig,
}

impl AppConfig {
    /// Carrega configuração de um arquivo TOML. Arquivo ausente = padrão.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            info!("{} não encontrado, usando configuração padrão", path.display());
            return Ok(AppConfig::default());
        }

        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = toml::from_str::<AppConfig>(&content).map_err(|source| {
            ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            }
        })?;
        info!("Configuração carregada de {}", path.display());
        Ok(config)
    }

    /// Salva configuração em arquivo TOML.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })?;
        info!("Configuração salva em {}", path.display());
        Ok(())
    }

    /// Retorna o caminho padrão do config.toml.
    pub fn default_path() -> PathBuf {
        let exe_dir = std::env::current_exe()
            .map(|p| p.parent().unwrap_or(Path::new(".")).to_path_buf())
            .unwrap_or_else(|_| PathBuf::from("."));
        exe_dir.join("config.toml")
    }

    /// Aplica overrides das variáveis de ambiente do processo.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|var| std::env::var(var).ok())
    }

    /// Aplica overrides a partir de uma função de lookup.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("MAVLINK_HOST") {
            self.listen.host = host;
        }
        if let Some(port) = parse_var(&lookup, "MAVLINK_PORT")? {
            self.listen.port = port;
        }
        if let Some(host) = lookup("MQTT_BROKER") {
            self.broker.host = host;
        }
        if let Some(port) = parse_var(&lookup, "MQTT_PORT")? {
            self.broker.port = port;
        }
        if let Some(volts) = parse_var(&lookup, "BATTERY_CRITICAL_VOLTAGE")? {
            self.alerts.critical_voltage = volts;
        }
        if let Some(volts) = parse_var(&lookup, "BATTERY_WARNING_VOLTAGE")? {
            self.alerts.warning_voltage = volts;
        }
        if let Some(retries) = parse_var(&lookup, "MQTT_MAX_RETRIES")? {
            self.broker.retry.max_retries = retries;
        }
        if let Some(delay) = parse_var(&lookup, "MQTT_RETRY_DELAY_MS")? {
            self.broker.retry.retry_delay_ms = delay;
        }
        Ok(())
    }

    /// Valida a configuração e retorna lista de erros.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.listen.host.trim().is_empty() {
            errors.push("Host UDP não pode ser vazio".into());
        }
        if self.listen.port == 0 {
            errors.push("Porta UDP não pode ser 0".into());
        }
        if self.listen.read_timeout_ms == 0 {
            errors.push("read_timeout_ms não pode ser 0".into());
        }
        if self.listen.max_datagram_size == 0
            || self.listen.max_datagram_size > crate::protocol::MAX_UDP_PAYLOAD
        {
            errors.push(format!(
                "max_datagram_size inválido: {} (1–{})",
                self.listen.max_datagram_size,
                crate::protocol::MAX_UDP_PAYLOAD
            ));
        }

        let broker = &self.broker;
        if broker.host.trim().is_empty() {
            errors.push("Host do broker não pode ser vazio".into());
        }
        if broker.port == 0 {
            errors.push("Porta do broker não pode ser 0".into());
        }
        if broker.client_id.is_empty() {
            errors.push("client_id não pode ser vazio".into());
        }
        if broker.keep_alive_secs < 5 {
            errors.push(format!(
                "keep_alive_secs inválido: {} (mínimo 5)",
                broker.keep_alive_secs
            ));
        }
        for (name, topic) in [
            ("telemetry_topic", &broker.telemetry_topic),
            ("alert_topic", &broker.alert_topic),
        ] {
            if topic.is_empty() || topic.contains(['+', '#']) {
                errors.push(format!("{name} inválido: {topic:?}"));
            }
        }
        if broker.subscriptions.iter().any(|t| t.is_empty()) {
            errors.push("subscriptions contém tópico vazio".into());
        }
        if broker.connect_timeout_ms == 0 || broker.publish_timeout_ms == 0 {
            errors.push("Timeouts do broker não podem ser 0".into());
        }
        if broker.poll_interval_ms == 0 {
            errors.push("poll_interval_ms não pode ser 0".into());
        }
        if broker.outbox_capacity == 0 {
            errors.push("outbox_capacity não pode ser 0".into());
        }
        if broker.retry.max_retries == 0 {
            errors.push("max_retries deve ser >= 1".into());
        }
        if broker.retry.max_retry_delay_ms < broker.retry.retry_delay_ms {
            errors.push(format!(
                "max_retry_delay_ms ({}) menor que retry_delay_ms ({})",
                broker.retry.max_retry_delay_ms, broker.retry.retry_delay_ms
            ));
        }

        let alerts = &self.alerts;
        if !(alerts.critical_voltage < alerts.warning_voltage) {
            errors.push(format!(
                "critical_voltage ({}) deve ser menor que warning_voltage ({})",
                alerts.critical_voltage, alerts.warning_voltage
            ));
        }
        if !(alerts.recovery_hysteresis >= 0.0) {
            errors.push(format!(
                "recovery_hysteresis inválido: {}",
                alerts.recovery_hysteresis
            ));
        }

        errors
    }

    /// Valida e converte a lista de erros em [`ConfigError::Invalid`].
    pub fn validated(self) -> Result<Self, ConfigError> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(self)
        } else {
            Err(ConfigError::Invalid(errors))
        }
    }
}

fn parse_var<F, T>(lookup: &F, var: &'static str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(var) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Env { var, value }),
    }
}
