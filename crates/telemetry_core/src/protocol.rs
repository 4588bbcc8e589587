//! Protocolo de comunicação JSON.
//!
//! Entrada (UDP, um objeto por datagrama):
//!
//! ```text
//! {"altitude": <num>, "airspeed": <num>, "battery_voltage": <num>, "timestamp": "<ISO-8601>"?}
//! ```
//!
//! Saída (MQTT): [`TelemetryRecord`] e [`AlertMessage`] serializados com
//! serde_json, timestamps em RFC 3339 UTC.

use crate::types::{AlertMessage, TelemetryRecord};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::{Map, Value};

/// Tamanho máximo de pacote UDP seguro (sem fragmentação).
pub const MAX_UDP_PAYLOAD: usize = 65507;

/// Campos numéricos obrigatórios do datagrama.
pub const REQUIRED_FIELDS: [&str; 3] = ["altitude", "airspeed", "battery_voltage"];

/// Erros de decodificação de um datagrama.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DecodeError {
    #[error("JSON malformado: {0}")]
    MalformedJson(String),

    #[error("Campo obrigatório ausente ou não numérico: {0}")]
    MissingField(&'static str),

    #[error("Timestamp inválido: {0}")]
    InvalidTimestamp(String),
}

/// Erros de serialização de saída.
#[derive(Debug, thiserror::Error)]
#[error("Erro de serialização: {0}")]
pub struct EncodeError(#[from] serde_json::Error);

/// Decodifica um datagrama em [`TelemetryRecord`].
///
/// `received_at` é usado quando o datagrama não traz `timestamp`; assim a
/// função é pura: os mesmos bytes e o mesmo instante geram o mesmo registro.
pub fn decode_datagram(
    data: &[u8],
    received_at: DateTime<Utc>,
) -> Result<TelemetryRecord, DecodeError> {
    let text = std::str::from_utf8(data)
        .map_err(|e| DecodeError::MalformedJson(format!("UTF-8 inválido: {e}")))?;
    let value: Value =
        serde_json::from_str(text).map_err(|e| DecodeError::MalformedJson(e.to_string()))?;
    let Value::Object(fields) = value else {
        return Err(DecodeError::MalformedJson(
            "esperado um objeto JSON".into(),
        ));
    };

    let [altitude, airspeed, battery_voltage] =
        REQUIRED_FIELDS.map(|name| number_field(&fields, name));
    let (altitude, airspeed, battery_voltage) = (altitude?, airspeed?, battery_voltage?);

    let timestamp = match fields.get("timestamp") {
        None | Some(Value::Null) => received_at,
        Some(Value::String(raw)) => parse_timestamp(raw)?,
        Some(other) => return Err(DecodeError::InvalidTimestamp(other.to_string())),
    };

    Ok(TelemetryRecord {
        altitude,
        airspeed,
        battery_voltage,
        timestamp,
    })
}

fn number_field(fields: &Map<String, Value>, name: &'static str) -> Result<f64, DecodeError> {
    fields
        .get(name)
        .and_then(Value::as_f64)
        .ok_or(DecodeError::MissingField(name))
}

/// Aceita RFC 3339 com offset ou ISO-8601 "naive" (interpretado como UTC),
/// que é o formato de `datetime.utcnow().isoformat()` do simulador.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, DecodeError> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|_| DecodeError::InvalidTimestamp(raw.to_string()))
}

/// Serializa um registro para o tópico de telemetria.
pub fn encode_telemetry(record: &TelemetryRecord) -> Result<Vec<u8>, EncodeError> {
    Ok(serde_json::to_vec(record)?)
}

/// Serializa um alerta para o tópico de alertas.
pub fn encode_alert(alert: &AlertMessage) -> Result<Vec<u8>, EncodeError> {
    Ok(serde_json::to_vec(alert)?)
}

/// Decodifica um payload do tópico de alertas (lado assinante).
pub fn decode_alert(data: &[u8]) -> Result<AlertMessage, DecodeError> {
    serde_json::from_slice(data).map_err(|e| DecodeError::MalformedJson(e.to_string()))
}

// ──────────────────────────────────────────────
// Testes
// ──────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn receipt() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn decodes_full_datagram() {
        let raw = br#"{"altitude": 101.5, "airspeed": 15.2, "battery_voltage": 24.8, "timestamp": "2024-05-01T11:59:59Z"}"#;
        let record = decode_datagram(raw, receipt()).unwrap();
        assert_eq!(record.altitude, 101.5);
        assert_eq!(record.airspeed, 15.2);
        assert_eq!(record.battery_voltage, 24.8);
        assert_eq!(
            record.timestamp,
            Utc.with_ymd_and_hms(2024, 5, 1, 11, 59, 59).unwrap()
        );
    }

    #[test]
    fn missing_timestamp_uses_receipt_time() {
        let raw = br#"{"altitude": 1, "airspeed": 2, "battery_voltage": 23}"#;
        let record = decode_datagram(raw, receipt()).unwrap();
        assert_eq!(record.timestamp, receipt());
        assert_eq!(record.altitude, 1.0);
    }

    #[test]
    fn decoding_is_deterministic() {
        let raw = br#"{"altitude": 100, "airspeed": 15, "battery_voltage": 21.7}"#;
        assert_eq!(
            decode_datagram(raw, receipt()).unwrap(),
            decode_datagram(raw, receipt()).unwrap()
        );
    }

    #[test]
    fn accepts_naive_simulator_timestamp() {
        let raw = br#"{"altitude": 100, "airspeed": 15, "battery_voltage": 24.0, "timestamp": "2024-05-01T12:00:00.250000", "message_type": "TELEMETRY"}"#;
        let record = decode_datagram(raw, receipt()).unwrap();
        assert_eq!(
            record.timestamp,
            receipt() + chrono::Duration::milliseconds(250)
        );
    }

    #[test]
    fn each_required_field_is_checked() {
        for missing in REQUIRED_FIELDS {
            let mut fields = Map::new();
            for name in REQUIRED_FIELDS.iter().filter(|n| **n != missing) {
                fields.insert(name.to_string(), Value::from(10.0));
            }
            let raw = serde_json::to_vec(&Value::Object(fields)).unwrap();
            assert_eq!(
                decode_datagram(&raw, receipt()),
                Err(DecodeError::MissingField(missing))
            );
        }
    }

    #[test]
    fn rejects_malformed_json() {
        assert!(matches!(
            decode_datagram(b"{\"altitude\": 1,", receipt()),
            Err(DecodeError::MalformedJson(_))
        ));
        assert!(matches!(
            decode_datagram(&[0xff, 0xfe], receipt()),
            Err(DecodeError::MalformedJson(_))
        ));
        assert!(matches!(
            decode_datagram(b"[1, 2, 3]", receipt()),
            Err(DecodeError::MalformedJson(_))
        ));
    }

    #[test]
    fn rejects_missing_or_non_numeric_field() {
        let missing = br#"{"altitude": 1, "airspeed": 2}"#;
        assert_eq!(
            decode_datagram(missing, receipt()),
            Err(DecodeError::MissingField("battery_voltage"))
        );

        let text = br#"{"altitude": "high", "airspeed": 2, "battery_voltage": 22}"#;
        assert_eq!(
            decode_datagram(text, receipt()),
            Err(DecodeError::MissingField("altitude"))
        );
    }

    #[test]
    fn rejects_bad_timestamp() {
        let raw = br#"{"altitude": 1, "airspeed": 2, "battery_voltage": 22, "timestamp": "yesterday"}"#;
        assert!(matches!(
            decode_datagram(raw, receipt()),
            Err(DecodeError::InvalidTimestamp(_))
        ));
    }

    #[test]
    fn telemetry_wire_roundtrip() {
        let original = TelemetryRecord {
            altitude: 98.76,
            airspeed: 14.9,
            battery_voltage: 21.43,
            timestamp: receipt() + chrono::Duration::microseconds(123_456),
        };
        let encoded = encode_telemetry(&original).unwrap();
        let decoded = decode_datagram(&encoded, Utc::now()).unwrap();
        assert_eq!(original, decoded);
    }

    #[test]
    fn alert_wire_roundtrip() {
        let record = TelemetryRecord {
            altitude: 80.0,
            airspeed: 12.0,
            battery_voltage: 20.91,
            timestamp: receipt(),
        };
        let original = AlertMessage::critical(21.0, &record);
        let decoded = decode_alert(&encode_alert(&original).unwrap()).unwrap();
        assert_eq!(original, decoded);
    }
}
