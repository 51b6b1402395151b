//! Decoding of the escrow contract datum from its detailed Plutus JSON form.
//!
//! Layout: `Constr 0 [Int state, Maybe Delivery]`, where `Maybe` is
//! `Constr 0 [x]` (just) or `Constr 1 []` (nothing) and
//! `Delivery = Constr 0 [Int deadline_ms]`.

use serde::Deserialize;

use crate::domain::{ChainError, DecodedDatum, Delivery};

/// Plutus data in the indexer's detailed JSON schema
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum PlutusData {
    Constr {
        constructor: u64,
        fields: Vec<PlutusData>,
    },
    Int {
        int: i64,
    },
    Bytes {
        bytes: String,
    },
    List {
        list: Vec<PlutusData>,
    },
    Map {
        map: Vec<PlutusPair>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PlutusPair {
    pub k: PlutusData,
    pub v: PlutusData,
}

impl PlutusData {
    fn constr(&self, expected: u64, arity: usize, what: &str) -> Result<&[PlutusData], ChainError> {
        match self {
            Self::Constr {
                constructor,
                fields,
            } if *constructor == expected && fields.len() == arity => Ok(fields),
            other => Err(ChainError::Decode(format!(
                "{what}: expected constructor {expected} with {arity} field(s), got {other:?}"
            ))),
        }
    }

    fn int(&self, what: &str) -> Result<i64, ChainError> {
        match self {
            Self::Int { int } => Ok(*int),
            other => Err(ChainError::Decode(format!(
                "{what}: expected integer, got {other:?}"
            ))),
        }
    }
}

/// Decode the contract datum.
pub fn decode_datum(value: &serde_json::Value) -> Result<DecodedDatum, ChainError> {
    let data = PlutusData::deserialize(value)
        .map_err(|e| ChainError::Decode(format!("datum is not Plutus JSON: {e}")))?;
    decode_plutus(&data)
}

pub fn decode_plutus(data: &PlutusData) -> Result<DecodedDatum, ChainError> {
    let fields = data.constr(0, 2, "datum")?;
    let state = fields[0].int("state")?;
    let delivery = decode_maybe_delivery(&fields[1])?;
    Ok(DecodedDatum { state, delivery })
}

fn decode_maybe_delivery(data: &PlutusData) -> Result<Option<Delivery>, ChainError> {
    match data {
        PlutusData::Constr {
            constructor: 1,
            fields,
        } if fields.is_empty() => Ok(None),
        PlutusData::Constr {
            constructor: 0,
            fields,
        } if fields.len() == 1 => {
            let inner = fields[0].constr(0, 1, "delivery")?;
            let deadline_ms = inner[0].int("deadline")?;
            Ok(Some(Delivery { deadline_ms }))
        }
        other => Err(ChainError::Decode(format!(
            "delivery: expected Maybe constructor, got {other:?}"
        ))),
    }
}
