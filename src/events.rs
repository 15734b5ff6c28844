//! Wire format for stream payloads.
//!
//! Stream messages are flat string maps. An exposure or session event may
//! carry the whole snapshot as JSON under `payload`; otherwise each scalar
//! is its own field and `positions` / `buckets` hold JSON-encoded values.

use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::error::DecodeError;
use crate::model::{
    BucketExposure, ExposureSnapshot, Intent, Position, PublishedIntent, Regime, SessionSnapshot,
};

pub type Fields = BTreeMap<String, String>;

pub const PAYLOAD_FIELD: &str = "payload";

fn parse_f64(fields: &Fields, field: &'static str) -> Result<Option<f64>, DecodeError> {
    match fields.get(field).map(|v| v.trim()) {
        None => Ok(None),
        Some(raw) if is_null(raw) => Ok(None),
        Some(raw) => match raw.parse::<f64>() {
            Ok(v) if v.is_finite() => Ok(Some(v)),
            _ => Err(DecodeError::InvalidNumber {
                field,
                value: raw.to_string(),
            }),
        },
    }
}

fn is_null(raw: &str) -> bool {
    raw.is_empty() || raw.eq_ignore_ascii_case("null") || raw.eq_ignore_ascii_case("none")
}

fn require_f64(fields: &Fields, field: &'static str) -> Result<f64, DecodeError> {
    parse_f64(fields, field)?.ok_or(DecodeError::MissingField { field })
}

fn parse_json<T: serde::de::DeserializeOwned + Default>(
    fields: &Fields,
    field: &'static str,
) -> Result<T, DecodeError> {
    match fields.get(field).map(|v| v.trim()) {
        None => Ok(T::default()),
        Some(raw) if is_null(raw) => Ok(T::default()),
        Some(raw) => serde_json::from_str(raw).map_err(|e| DecodeError::InvalidJson {
            field,
            reason: e.to_string(),
        }),
    }
}

fn check_finite(field: &'static str, value: f64) -> Result<(), DecodeError> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(DecodeError::InvalidNumber {
            field,
            value: value.to_string(),
        })
    }
}

/// Fill in notional from quantity and price when the producer left it out.
fn normalize_positions(positions: &mut [Position]) -> Result<(), DecodeError> {
    for p in positions.iter_mut() {
        check_finite("positions.quantity", p.quantity)?;
        check_finite("positions.avg_price", p.avg_price)?;
        check_finite("positions.notional", p.notional)?;
        if p.notional == 0.0 && p.avg_price > 0.0 {
            p.notional = p.quantity * p.avg_price;
        }
    }
    Ok(())
}

pub fn decode_exposure(fields: &Fields) -> Result<ExposureSnapshot, DecodeError> {
    let mut snapshot = if let Some(raw) = fields.get(PAYLOAD_FIELD) {
        serde_json::from_str::<ExposureSnapshot>(raw).map_err(|e| DecodeError::InvalidJson {
            field: PAYLOAD_FIELD,
            reason: e.to_string(),
        })?
    } else {
        ExposureSnapshot {
            gross_exposure_pct: require_f64(fields, "gross_exposure_pct")?,
            equity: require_f64(fields, "equity")?,
            open_orders_potential: parse_f64(fields, "open_orders_potential")?.unwrap_or(0.0),
            positions: parse_json::<Vec<Position>>(fields, "positions")?,
            buckets: parse_json::<BTreeMap<String, BucketExposure>>(fields, "buckets")?,
        }
    };
    check_finite("gross_exposure_pct", snapshot.gross_exposure_pct)?;
    check_finite("equity", snapshot.equity)?;
    check_finite("open_orders_potential", snapshot.open_orders_potential)?;
    normalize_positions(&mut snapshot.positions)?;
    Ok(snapshot)
}

pub fn decode_session(fields: &Fields) -> Result<SessionSnapshot, DecodeError> {
    if let Some(raw) = fields.get(PAYLOAD_FIELD) {
        let snapshot: SessionSnapshot =
            serde_json::from_str(raw).map_err(|e| DecodeError::InvalidJson {
                field: PAYLOAD_FIELD,
                reason: e.to_string(),
            })?;
        if let Some(m) = snapshot.minutes_to_close {
            check_finite("minutes_to_close", m)?;
        }
        return Ok(snapshot);
    }
    let raw = fields
        .get("regime")
        .ok_or(DecodeError::MissingField { field: "regime" })?;
    let regime = Regime::parse(raw).ok_or_else(|| DecodeError::UnknownRegime(raw.clone()))?;
    Ok(SessionSnapshot {
        regime,
        minutes_to_close: parse_f64(fields, "minutes_to_close")?,
    })
}

pub fn encode_exposure(snapshot: &ExposureSnapshot) -> Fields {
    let mut fields = Fields::new();
    fields.insert("gross_exposure_pct".into(), snapshot.gross_exposure_pct.to_string());
    fields.insert("equity".into(), snapshot.equity.to_string());
    fields.insert(
        "open_orders_potential".into(),
        snapshot.open_orders_potential.to_string(),
    );
    fields.insert(
        "positions".into(),
        serde_json::to_string(&snapshot.positions).unwrap_or_else(|_| "[]".to_string()),
    );
    fields.insert(
        "buckets".into(),
        serde_json::to_string(&snapshot.buckets).unwrap_or_else(|_| "{}".to_string()),
    );
    fields
}

pub fn encode_session(snapshot: &SessionSnapshot) -> Fields {
    let mut fields = Fields::new();
    fields.insert("regime".into(), snapshot.regime.as_str().to_string());
    fields.insert(
        "minutes_to_close".into(),
        snapshot
            .minutes_to_close
            .map(|m| m.to_string())
            .unwrap_or_else(|| "null".to_string()),
    );
    fields
}

/// Outbound record: a few routing fields plus the full JSON payload.
pub fn encode_intent(published: &PublishedIntent) -> Fields {
    let mut fields = Fields::new();
    fields.insert("intent_id".into(), published.intent_id.clone());
    fields.insert("intent_type".into(), published.intent.intent_type.as_str().to_string());
    fields.insert("symbol".into(), published.intent.symbol.clone());
    fields.insert("action".into(), published.intent.action.as_str().to_string());
    fields.insert("quantity".into(), published.intent.quantity.to_string());
    fields.insert("mode".into(), published.mode.clone());
    fields.insert(
        PAYLOAD_FIELD.into(),
        serde_json::to_string(published).unwrap_or_else(|_| "{}".to_string()),
    );
    fields
}

pub fn decode_intent(fields: &Fields) -> Result<PublishedIntent, DecodeError> {
    let raw = fields
        .get(PAYLOAD_FIELD)
        .ok_or(DecodeError::MissingField { field: PAYLOAD_FIELD })?;
    serde_json::from_str(raw).map_err(|e| DecodeError::InvalidJson {
        field: PAYLOAD_FIELD,
        reason: e.to_string(),
    })
}

/// Stable id for an intent: same triggering message and content give the same id.
pub fn intent_id(source_message_id: Option<&str>, index: usize, intent: &Intent) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source_message_id.unwrap_or("-").as_bytes());
    hasher.update(b"|");
    hasher.update(index.to_string().as_bytes());
    hasher.update(b"|");
    hasher.update(intent.intent_type.as_str().as_bytes());
    hasher.update(b"|");
    hasher.update(intent.symbol.as_bytes());
    hasher.update(b"|");
    hasher.update(intent.action.as_str().as_bytes());
    hasher.update(b"|");
    hasher.update(intent.quantity.to_string().as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("INT-{}", &digest[..16])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Action, Bucket, IntentSpec, IntentType};

    fn fields(pairs: &[(&str, &str)]) -> Fields {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_decode_exposure_flat_fields() {
        let f = fields(&[
            ("gross_exposure_pct", "132.0"),
            ("equity", "1000000"),
            (
                "positions",
                r#"[{"symbol":"ABC","qty":1000,"notional":40000,"bucket":"LT"}]"#,
            ),
            ("buckets", r#"{"LT":{"current_pct":4.0,"potential_pct":5.0}}"#),
        ]);
        let snap = decode_exposure(&f).unwrap();
        assert_eq!(snap.gross_exposure_pct, 132.0);
        assert_eq!(snap.open_orders_potential, 0.0);
        assert_eq!(snap.positions.len(), 1);
        assert_eq!(snap.positions[0].quantity, 1000.0);
        assert_eq!(snap.positions[0].bucket, Bucket::Lt);
        assert_eq!(snap.bucket(Bucket::Lt).potential_pct, 5.0);
        assert_eq!(snap.bucket(Bucket::Mm).current_pct, 0.0);
    }

    #[test]
    fn test_decode_exposure_payload() {
        let f = fields(&[(
            "payload",
            r#"{"gross_exposure_pct":80.0,"equity":500.0,"positions":[{"symbol":"X","quantity":-2,"avg_price":10.0,"bucket":"MM"}]}"#,
        )]);
        let snap = decode_exposure(&f).unwrap();
        assert_eq!(snap.equity, 500.0);
        // notional derived from quantity and price
        assert_eq!(snap.positions[0].notional, -20.0);
    }

    #[test]
    fn test_decode_exposure_missing_equity() {
        let f = fields(&[("gross_exposure_pct", "10")]);
        assert_eq!(
            decode_exposure(&f).unwrap_err(),
            DecodeError::MissingField { field: "equity" }
        );
    }

    #[test]
    fn test_decode_exposure_rejects_nan() {
        let f = fields(&[("gross_exposure_pct", "NaN"), ("equity", "10")]);
        assert!(matches!(
            decode_exposure(&f),
            Err(DecodeError::InvalidNumber { field: "gross_exposure_pct", .. })
        ));
    }

    #[test]
    fn test_decode_exposure_bad_positions_json() {
        let f = fields(&[
            ("gross_exposure_pct", "10"),
            ("equity", "10"),
            ("positions", "not json"),
        ]);
        assert!(matches!(
            decode_exposure(&f),
            Err(DecodeError::InvalidJson { field: "positions", .. })
        ));
    }

    #[test]
    fn test_decode_session() {
        let s = decode_session(&fields(&[("regime", "late"), ("minutes_to_close", "12.5")])).unwrap();
        assert_eq!(s.regime, Regime::Late);
        assert_eq!(s.minutes_to_close, Some(12.5));

        let s = decode_session(&fields(&[("regime", "CLOSED"), ("minutes_to_close", "null")])).unwrap();
        assert_eq!(s.minutes_to_close, None);

        assert_eq!(
            decode_session(&fields(&[("regime", "LUNCH")])).unwrap_err(),
            DecodeError::UnknownRegime("LUNCH".to_string())
        );
    }

    #[test]
    fn test_session_encoding_decodes() {
        let s = SessionSnapshot {
            regime: Regime::Regular,
            minutes_to_close: Some(60.0),
        };
        assert_eq!(decode_session(&encode_session(&s)).unwrap(), s);
    }

    #[test]
    fn test_intent_id_is_stable() {
        let pos = Position {
            symbol: "ABC".to_string(),
            quantity: 10.0,
            avg_price: 5.0,
            notional: 50.0,
            bucket: Bucket::Lt,
        };
        let intent = Intent::from_position(IntentSpec {
            intent_type: IntentType::SoftDerisk,
            position: &pos,
            action: Action::Sell,
            quantity: 1,
            equity: 100.0,
            priority: 50,
            limit_price: Some(4.99),
            reason: "r".to_string(),
        });
        let a = intent_id(Some("17"), 0, &intent);
        let b = intent_id(Some("17"), 0, &intent);
        let c = intent_id(Some("18"), 0, &intent);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("INT-"));
        assert_eq!(a.len(), 20);
    }
}
