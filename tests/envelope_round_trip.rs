// Inscribe-then-replay round trips through a test transaction builder.
use bitcoin::absolute::LockTime;
use bitcoin::opcodes::all::{OP_CHECKSIG, OP_ENDIF, OP_IF};
use bitcoin::opcodes::OP_FALSE;
use bitcoin::script::{Builder, PushBytesBuf};
use bitcoin::transaction::Version;
use bitcoin::{Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness};
use ciborium::Value as CborValue;

use bitseed::api::{
    ApiResult, Content, ErrorKind, FundingRequest, Inscriber, InscriptionRequest, TokenRecord,
    decode_envelope_at, decode_envelope_hex, decode_inscription_meta, decode_transaction,
    replay_inscription,
};

const MAX_PUSH: usize = 520;

/// Builds an unsigned-looking taproot reveal: `[signature, envelope script, control block]`.
struct TestInscriber {
    metaprotocol_override: Option<String>,
    leading_inputs: usize,
    inscribed: usize,
}

impl TestInscriber {
    fn new() -> Self {
        Self {
            metaprotocol_override: None,
            leading_inputs: 0,
            inscribed: 0,
        }
    }

    fn push(builder: Builder, bytes: &[u8]) -> Builder {
        let bytes = PushBytesBuf::try_from(bytes.to_vec()).expect("push fits");
        builder.push_slice(&bytes)
    }

    fn envelope_script(&self, request: &InscriptionRequest) -> ApiResult<ScriptBuf> {
        let mut builder = Self::push(Builder::new(), &[0x02; 32])
            .push_opcode(OP_CHECKSIG)
            .push_opcode(OP_FALSE)
            .push_opcode(OP_IF);
        builder = Self::push(builder, b"ord");
        builder = Self::push(builder, &[1]);
        builder = Self::push(builder, request.content_type.as_bytes());
        for chunk in request.meta_bytes()?.chunks(MAX_PUSH) {
            builder = Self::push(builder, &[5]);
            builder = Self::push(builder, chunk);
        }
        let metaprotocol = self
            .metaprotocol_override
            .as_deref()
            .unwrap_or(&request.metaprotocol);
        builder = Self::push(builder, &[7]);
        builder = Self::push(builder, metaprotocol.as_bytes());
        builder = builder.push_opcode(OP_FALSE);
        for chunk in request.content_bytes.chunks(MAX_PUSH) {
            builder = Self::push(builder, chunk);
        }
        Ok(builder.push_opcode(OP_ENDIF).into_script())
    }
}

fn spend(witness: Witness) -> TxIn {
    TxIn {
        previous_output: OutPoint::null(),
        script_sig: ScriptBuf::new(),
        sequence: Sequence::MAX,
        witness,
    }
}

impl Inscriber for TestInscriber {
    fn funding_request(&self, request: &InscriptionRequest) -> ApiResult<FundingRequest> {
        let script = self.envelope_script(request)?;
        Ok(FundingRequest {
            destination_address: "bcrt1p-test-commit".to_string(),
            required_fee: 1000 + script.len() as u64 / 4,
        })
    }

    fn inscribe(&mut self, request: &InscriptionRequest) -> ApiResult<Vec<u8>> {
        let script = self.envelope_script(request)?;
        let mut input: Vec<TxIn> = (0..self.leading_inputs)
            .map(|_| spend(Witness::from_slice(&[vec![0x01u8; 64]])))
            .collect();
        input.push(spend(Witness::from_slice(&[
            vec![0x01u8; 64],
            script.as_bytes().to_vec(),
            vec![0xc0u8; 33],
        ])));
        let tx = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input,
            output: vec![TxOut {
                value: Amount::from_sat(546),
                script_pubkey: ScriptBuf::new(),
            }],
        };
        self.inscribed += 1;
        Ok(bitcoin::consensus::serialize(&tx))
    }
}

fn hello_record() -> TokenRecord {
    TokenRecord {
        op: "mint".to_string(),
        tick: "seed".to_string(),
        amount: 1000,
        attributes: None,
        content: Some(Content::text("Hello, World!")),
    }
}

#[test]
fn inscribed_record_replays_exactly() {
    let record = hello_record();
    let mut inscriber = TestInscriber::new();
    let funding = inscriber
        .funding_request(&record.to_inscription())
        .expect("funding");
    assert!(funding.required_fee > 1000);

    let signed = inscriber.inscribe(&record.to_inscription()).expect("inscribe");
    assert_eq!(inscriber.inscribed, 1);
    let (envelope, replayed) = replay_inscription(&signed)
        .expect("replay")
        .expect("envelope present");
    assert_eq!(envelope.input, 0);
    assert_eq!(envelope.witness_index, 1);
    assert_eq!(envelope.protocol.as_deref(), Some(&b"ord"[..]));
    assert_eq!(envelope.content_type.as_deref(), Some("text/plain"));
    assert!(envelope.metaprotocol_is("bitseed"));
    assert_eq!(envelope.body_text(), Some("Hello, World!"));
    assert_eq!(replayed, Some(record));
}

#[test]
fn chunked_metadata_and_body_reassemble() {
    let mut record = hello_record();
    record.attributes = Some(CborValue::Map(vec![(
        CborValue::Text("lore".to_string()),
        CborValue::Text("x".repeat(700)),
    )]));
    record.content = Some(Content::new("application/octet-stream", vec![7u8; 1500]));

    let mut inscriber = TestInscriber::new();
    inscriber.leading_inputs = 2;
    let signed = inscriber.inscribe(&record.to_inscription()).expect("inscribe");
    let (envelope, replayed) = replay_inscription(&signed)
        .expect("replay")
        .expect("envelope present");
    assert_eq!(envelope.input, 2);
    assert_eq!(envelope.body.as_ref().map(Vec::len), Some(1500));
    assert_eq!(replayed, Some(record.clone()));

    let tx = decode_transaction(&signed).expect("tx");
    assert!(decode_envelope_at(&tx, 0).expect("input 0").is_none());
    assert!(decode_envelope_at(&tx, 2).expect("input 2").is_some());
    assert!(decode_envelope_at(&tx, 9).expect("out of range").is_none());

    let meta = decode_inscription_meta(&hex::encode(&signed), 2)
        .expect("meta")
        .expect("metadata present");
    let expected = record.to_inscription().meta;
    assert_eq!(meta, expected);
}

#[test]
fn single_byte_trailing_metadata_chunk_replays() {
    // 496-byte tick makes the metadata 521 bytes, so the last chunk is the lone amount byte.
    let record = TokenRecord {
        op: "mint".to_string(),
        tick: "t".repeat(496),
        amount: 9,
        attributes: None,
        content: Some(Content::text("Hello, World!")),
    };
    let request = record.to_inscription();
    let meta = request.meta_bytes().expect("meta bytes");
    assert_eq!(meta.len(), MAX_PUSH + 1);
    assert_eq!(meta.last(), Some(&0x09));

    let signed = TestInscriber::new().inscribe(&request).expect("inscribe");
    let (envelope, replayed) = replay_inscription(&signed)
        .expect("replay")
        .expect("envelope present");
    assert_eq!(envelope.metadata, Some(request.meta.clone()));
    assert_eq!(replayed, Some(record));
    let meta = decode_inscription_meta(&hex::encode(&signed), 0)
        .expect("meta")
        .expect("metadata present");
    assert_eq!(meta, request.meta);
}

#[test]
fn foreign_metaprotocol_keeps_envelope_but_no_record() {
    let mut inscriber = TestInscriber::new();
    inscriber.metaprotocol_override = Some("brc-20".to_string());
    let signed = inscriber
        .inscribe(&hello_record().to_inscription())
        .expect("inscribe");
    let (envelope, record) = replay_inscription(&signed)
        .expect("replay")
        .expect("envelope present");
    assert_eq!(envelope.metaprotocol.as_deref(), Some("brc-20"));
    assert!(envelope.metadata.is_some());
    assert_eq!(record, None);
}

#[test]
fn plain_spend_has_no_envelope() {
    let tx = Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: vec![spend(Witness::from_slice(&[vec![0x01u8; 64], vec![0x02u8; 33]]))],
        output: Vec::new(),
    };
    let hex = bitcoin::consensus::encode::serialize_hex(&tx);
    assert!(decode_envelope_hex(&hex).expect("decode").is_none());
    assert!(decode_inscription_meta(&hex, 0).expect("decode").is_none());
}

#[test]
fn malformed_inputs_are_decode_errors() {
    let err = decode_envelope_hex("zz").err().expect("bad hex");
    assert_eq!(err.kind(), ErrorKind::EnvelopeDecode);

    let err = decode_transaction(&[0x02, 0x00]).err().expect("truncated tx");
    assert_eq!(err.kind(), ErrorKind::EnvelopeDecode);
    assert_eq!(err.raw(), Some(&[0x02u8, 0x00][..]));

    let broken = vec![0x00, 0x63, 0x03, b'o', b'r', b'd', 0x4c];
    let tx = Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: vec![spend(Witness::from_slice(&[broken]))],
        output: Vec::new(),
    };
    let err = decode_envelope_hex(&bitcoin::consensus::encode::serialize_hex(&tx))
        .err()
        .expect("undecompilable witness");
    assert_eq!(err.kind(), ErrorKind::EnvelopeDecode);
}
