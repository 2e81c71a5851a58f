// src/utils/ids.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kinds of client-generated ids. Server-assigned ids (trips, offers,
/// drivers) are numeric and never minted here; these exist for log
/// correlation and submit idempotency on the client side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IdKind {
    Request,
    Session,
    Subscription,
}

impl IdKind {
    pub fn prefix(self) -> &'static str {
        match self {
            IdKind::Request => "req",
            IdKind::Session => "ses",
            IdKind::Subscription => "sub",
        }
    }
}

// Crockford base32: no i/l/o/u, so ids survive being read aloud over support
// calls.
const TAIL_ALPHABET: &[u8] = b"0123456789abcdefghjkmnpqrstvwxyz";
const TAIL_LEN: usize = 6;

/// Client-generated id with the shape `{prefix}_{yymmddhhmm}_{tail}`,
/// e.g. `req_2508071423_7kq2mx`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    pub fn generate(kind: IdKind) -> Self {
        Self::generate_at(kind, Utc::now())
    }

    /// Mint with an explicit timestamp (used by tests).
    pub fn generate_at(kind: IdKind, at: DateTime<Utc>) -> Self {
        use rand::Rng;

        let mut rng = rand::rng();
        let tail: String = (0..TAIL_LEN)
            .map(|_| {
                let idx = rng.random_range(0..TAIL_ALPHABET.len());
                TAIL_ALPHABET[idx] as char
            })
            .collect();

        Self(format!(
            "{}_{}_{}",
            kind.prefix(),
            at.format("%y%m%d%H%M"),
            tail
        ))
    }

    /// Validates shape and, when `expected` is given, the prefix too.
    pub fn parse(raw: &str, expected: Option<IdKind>) -> Option<Self> {
        let mut parts = raw.split('_');
        let prefix = parts.next()?;
        let stamp = parts.next()?;
        let tail = parts.next()?;
        if parts.next().is_some() {
            return None;
        }

        let kind = match prefix {
            "req" => IdKind::Request,
            "ses" => IdKind::Session,
            "sub" => IdKind::Subscription,
            _ => return None,
        };
        if let Some(expected) = expected {
            if kind != expected {
                return None;
            }
        }
        if stamp.len() != 10 || !stamp.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        if tail.len() != TAIL_LEN || !tail.bytes().all(|b| TAIL_ALPHABET.contains(&b)) {
            return None;
        }

        Some(Self(raw.to_string()))
    }

    pub fn kind(&self) -> IdKind {
        match self.0.split('_').next() {
            Some("ses") => IdKind::Session,
            Some("sub") => IdKind::Subscription,
            _ => IdKind::Request,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn generated_ids_have_expected_shape() {
        let at = Utc.with_ymd_and_hms(2025, 8, 7, 14, 23, 0).unwrap();
        let id = CorrelationId::generate_at(IdKind::Request, at);
        assert!(id.as_str().starts_with("req_2508071423_"));
        assert_eq!(id.as_str().len(), "req_2508071423_".len() + TAIL_LEN);
        assert_eq!(id.kind(), IdKind::Request);
    }

    #[test]
    fn parse_round_trips_generated_ids() {
        for kind in [IdKind::Request, IdKind::Session, IdKind::Subscription] {
            let id = CorrelationId::generate(kind);
            let parsed = CorrelationId::parse(id.as_str(), Some(kind));
            assert_eq!(parsed, Some(id));
        }
    }

    #[test]
    fn parse_rejects_malformed_ids() {
        assert!(CorrelationId::parse("", None).is_none());
        assert!(CorrelationId::parse("req_2508071423", None).is_none());
        assert!(CorrelationId::parse("zzz_2508071423_7kq2mx", None).is_none());
        assert!(CorrelationId::parse("req_25080714_7kq2mx", None).is_none());
        // 'u' is not in the tail alphabet
        assert!(CorrelationId::parse("req_2508071423_7kqumx", None).is_none());
        // wrong expected kind
        let id = CorrelationId::generate(IdKind::Session);
        assert!(CorrelationId::parse(id.as_str(), Some(IdKind::Request)).is_none());
    }

    #[test]
    fn ids_are_unique_enough() {
        let a = CorrelationId::generate(IdKind::Request);
        let b = CorrelationId::generate(IdKind::Request);
        assert_ne!(a, b);
    }
}
