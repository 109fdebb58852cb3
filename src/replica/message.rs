use std::{fmt, str::FromStr};

use crate::{
    common::{Digest, Error, Hashable, Hasher},
    network::MemberId,
};

/*
    Application messages are single text lines with space separated fields:

        balance <value>
        deposit <amount> <uniqueID>
        addInterest <percent> <uniqueID>

    Numbers are written in shortest round-trip form, so every replica parses
    the exact value the sender held.
*/

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TxKind {
    Deposit,
    AddInterest,
}

impl TxKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxKind::Deposit => "deposit",
            TxKind::AddInterest => "addInterest",
        }
    }

    /// Fold one operation into `balance`. The two kinds do not commute.
    pub fn apply(&self, balance: f64, operand: f64) -> f64 {
        match self {
            TxKind::Deposit => balance + operand,
            TxKind::AddInterest => balance * (1.0 + operand / 100.0),
        }
    }
}

impl fmt::Display for TxKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `<origin>#<batch>.<seq>`: unique across the group as long as member names are.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct UniqueId(String);

impl UniqueId {
    pub fn mint(origin: &MemberId, batch: u64, seq: u64) -> Self {
        let origin = origin.as_str().replace(char::is_whitespace, "_");
        UniqueId(format!("{origin}#{batch}.{seq}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for UniqueId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || s.contains(char::is_whitespace) {
            return Err(Error::Wire {
                message: s.to_string(),
                reason: "bad transaction id".into(),
            });
        }
        Ok(UniqueId(s.to_string()))
    }
}

impl fmt::Display for UniqueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, PartialEq, Debug)]
pub struct Transaction {
    pub kind: TxKind,
    pub operand: f64,
    pub unique_id: UniqueId,
    pub origin: MemberId,
}

impl fmt::Display for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} ({})", self.kind, self.operand, self.unique_id)
    }
}

impl Hashable for Transaction {
    fn hash(&self) -> Digest {
        let mut hasher = Hasher::new();
        hasher
            .update(self.kind.as_str().as_bytes())
            .update(&self.operand.to_bits().to_be_bytes())
            .update(self.unique_id.as_str().as_bytes());
        hasher.finalize()
    }
}

#[derive(Clone, PartialEq, Debug)]
pub enum WireMessage {
    /// Balance snapshot for a joining replica. Never counted or logged.
    Balance(f64),
    Transaction {
        kind: TxKind,
        operand: f64,
        unique_id: UniqueId,
    },
}

impl From<&Transaction> for WireMessage {
    fn from(tx: &Transaction) -> Self {
        WireMessage::Transaction {
            kind: tx.kind,
            operand: tx.operand,
            unique_id: tx.unique_id.clone(),
        }
    }
}

impl fmt::Display for WireMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireMessage::Balance(value) => write!(f, "balance {value}"),
            WireMessage::Transaction {
                kind,
                operand,
                unique_id,
            } => write!(f, "{kind} {operand} {unique_id}"),
        }
    }
}

impl FromStr for WireMessage {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = |reason: &str| Error::Wire {
            message: s.to_string(),
            reason: reason.to_string(),
        };
        let number = |field: &str| match field.parse::<f64>() {
            Ok(value) if value.is_finite() => Ok(value),
            _ => Err(malformed("operand is not a finite number")),
        };

        let fields: Vec<&str> = s.split_whitespace().collect();
        match fields.as_slice() {
            ["balance", value] => Ok(WireMessage::Balance(number(*value)?)),
            [kind @ ("deposit" | "addInterest"), operand, unique_id] => {
                let kind = if *kind == "deposit" {
                    TxKind::Deposit
                } else {
                    TxKind::AddInterest
                };
                Ok(WireMessage::Transaction {
                    kind,
                    operand: number(*operand)?,
                    unique_id: unique_id.parse()?,
                })
            }
            [] => Err(malformed("empty message")),
            ["balance" | "deposit" | "addInterest", ..] => Err(malformed("wrong number of fields")),
            [kind, ..] => Err(malformed(&format!("unknown kind {kind}"))),
        }
    }
}
