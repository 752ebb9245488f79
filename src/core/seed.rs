//! Purpose: Derive generator seeds from chain data.
//! Exports: `InscribeSeed`, `IndexerSeed`, `InscriptionId`.
//! Role: Binds a mint to the block and UTXO it spends so anyone can recompute the seed.
//! Invariants: seed = sha3-256(block hash bytes || txid bytes || index little-endian), `0x`-prefixed hex.
use std::fmt;
use std::str::FromStr;

use bitcoin::hashes::Hash;
use bitcoin::{BlockHash, OutPoint, Txid};
use sha3::{Digest, Sha3_256};

use crate::core::error::{Error, ErrorKind};

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InscribeSeed {
    pub block_hash: BlockHash,
    pub utxo: OutPoint,
}

impl InscribeSeed {
    pub fn new(block_hash: BlockHash, utxo: OutPoint) -> Self {
        Self { block_hash, utxo }
    }

    pub fn parse(block_hash: &str, outpoint: &str) -> Result<Self, Error> {
        let block_hash = parse_block_hash(block_hash)?;
        let utxo = OutPoint::from_str(outpoint).map_err(|err| {
            usage(format!("invalid outpoint `{outpoint}`"))
                .with_hint("Outpoints look like <txid>:<vout>.")
                .with_source(err)
        })?;
        Ok(Self::new(block_hash, utxo))
    }

    pub fn seed(&self) -> String {
        seed_hex(&self.block_hash, &self.utxo.txid, self.utxo.vout)
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct IndexerSeed {
    pub block_hash: BlockHash,
    pub inscription_id: InscriptionId,
}

impl IndexerSeed {
    pub fn new(block_hash: BlockHash, inscription_id: InscriptionId) -> Self {
        Self {
            block_hash,
            inscription_id,
        }
    }

    pub fn parse(block_hash: &str, inscription_id: &str) -> Result<Self, Error> {
        Ok(Self::new(
            parse_block_hash(block_hash)?,
            InscriptionId::from_str(inscription_id)?,
        ))
    }

    pub fn seed(&self) -> String {
        seed_hex(
            &self.block_hash,
            &self.inscription_id.txid,
            self.inscription_id.index,
        )
    }
}

/// `<txid>i<index>`
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct InscriptionId {
    pub txid: Txid,
    pub index: u32,
}

impl fmt::Display for InscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}i{}", self.txid, self.index)
    }
}

impl FromStr for InscriptionId {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let (txid, index) = value
            .rsplit_once('i')
            .ok_or_else(|| usage(format!("inscription id `{value}` has no `i` separator")))?;
        let txid = Txid::from_str(txid)
            .map_err(|err| usage(format!("invalid txid in `{value}`")).with_source(err))?;
        let index = index
            .parse()
            .map_err(|err| usage(format!("invalid index in `{value}`")).with_source(err))?;
        Ok(Self { txid, index })
    }
}

fn seed_hex(block_hash: &BlockHash, txid: &Txid, index: u32) -> String {
    let mut hasher = Sha3_256::new();
    hasher.update(block_hash.as_byte_array());
    hasher.update(txid.as_byte_array());
    hasher.update(index.to_le_bytes());
    format!("0x{}", hex::encode(hasher.finalize()))
}

fn parse_block_hash(value: &str) -> Result<BlockHash, Error> {
    BlockHash::from_str(value)
        .map_err(|err| usage(format!("invalid block hash `{value}`")).with_source(err))
}

fn usage(message: impl Into<String>) -> Error {
    Error::new(ErrorKind::Usage).with_message(message)
}
