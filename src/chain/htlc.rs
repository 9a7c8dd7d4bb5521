use anyhow::{Context as _, Result};
use bitcoin::absolute::LockTime;
use bitcoin::ecdsa::Signature as EcdsaSignature;
use bitcoin::hashes::{Hash as _, ripemd160, sha256};
use bitcoin::opcodes::all as op;
use bitcoin::opcodes::Opcode;
use bitcoin::script::{Builder, Instruction, Script, ScriptBuf};
use bitcoin::secp256k1::{All, Message, PublicKey, Secp256k1, SecretKey};
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::transaction::Version;
use bitcoin::{Address, Amount, Network, OutPoint, Sequence, Transaction, TxIn, TxOut, Witness};

const DUST_LIMIT_SATS: u64 = 546;

/// Script layouts used by the exchange for the two swap directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptTemplate {
    /// Chain to Lightning. The exchange claims, we refund after the timeout.
    Submarine,
    /// Lightning to chain. We claim with the preimage, the exchange refunds.
    Reverse,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapScript {
    pub template: ScriptTemplate,
    /// HASH160 of the preimage, i.e. RIPEMD160 of the payment hash.
    pub hash_lock: [u8; 20],
    pub claim_pubkey: PublicKey,
    pub refund_pubkey: PublicKey,
    pub timeout_block_height: u32,
}

impl SwapScript {
    pub fn witness_script(&self) -> ScriptBuf {
        let timeout = i64::from(self.timeout_block_height);
        match self.template {
            ScriptTemplate::Reverse => Builder::new()
                .push_opcode(op::OP_SIZE)
                .push_int(32)
                .push_opcode(op::OP_EQUAL)
                .push_opcode(op::OP_IF)
                .push_opcode(op::OP_HASH160)
                .push_slice(self.hash_lock)
                .push_opcode(op::OP_EQUALVERIFY)
                .push_slice(self.claim_pubkey.serialize())
                .push_opcode(op::OP_ELSE)
                .push_opcode(op::OP_DROP)
                .push_int(timeout)
                .push_opcode(op::OP_CLTV)
                .push_opcode(op::OP_DROP)
                .push_slice(self.refund_pubkey.serialize())
                .push_opcode(op::OP_ENDIF)
                .push_opcode(op::OP_CHECKSIG)
                .into_script(),
            ScriptTemplate::Submarine => Builder::new()
                .push_opcode(op::OP_HASH160)
                .push_slice(self.hash_lock)
                .push_opcode(op::OP_EQUAL)
                .push_opcode(op::OP_IF)
                .push_slice(self.claim_pubkey.serialize())
                .push_opcode(op::OP_ELSE)
                .push_int(timeout)
                .push_opcode(op::OP_CLTV)
                .push_opcode(op::OP_DROP)
                .push_slice(self.refund_pubkey.serialize())
                .push_opcode(op::OP_ENDIF)
                .push_opcode(op::OP_CHECKSIG)
                .into_script(),
        }
    }

    pub fn p2wsh_address(&self, network: Network) -> Address {
        Address::p2wsh(&self.witness_script(), network)
    }

    pub fn parse(witness_script: &Script) -> Result<Self> {
        fn next<'a>(
            iter: &mut impl Iterator<Item = std::result::Result<Instruction<'a>, bitcoin::script::Error>>,
        ) -> Result<Instruction<'a>> {
            iter.next()
                .transpose()
                .map_err(|e| anyhow::anyhow!("decode script instruction: {e}"))?
                .context("unexpected end of swap script")
        }

        fn expect_op(actual: Instruction<'_>, expected: Opcode) -> Result<()> {
            match actual {
                Instruction::Op(o) if o == expected => Ok(()),
                other => anyhow::bail!("unexpected instruction: expected {expected:?}, got {other:?}"),
            }
        }

        fn expect_push<const N: usize>(actual: Instruction<'_>) -> Result<[u8; N]> {
            match actual {
                Instruction::PushBytes(bytes) if bytes.len() == N => {
                    let mut out = [0u8; N];
                    out.copy_from_slice(bytes.as_bytes());
                    Ok(out)
                }
                other => anyhow::bail!("unexpected instruction: expected push {N} bytes, got {other:?}"),
            }
        }

        fn expect_pubkey(actual: Instruction<'_>) -> Result<PublicKey> {
            let bytes = expect_push::<33>(actual)?;
            PublicKey::from_slice(&bytes).context("invalid public key in swap script")
        }

        fn parse_script_num(actual: Instruction<'_>) -> Result<i64> {
            match actual {
                Instruction::PushBytes(bytes) => decode_script_num(bytes.as_bytes()),
                Instruction::Op(o) => {
                    let code = o.to_u8();
                    let one = op::OP_PUSHNUM_1.to_u8();
                    let sixteen = op::OP_PUSHNUM_16.to_u8();
                    if (one..=sixteen).contains(&code) {
                        return Ok(i64::from(code - one + 1));
                    }
                    anyhow::bail!("unexpected opcode where script number expected: {o:?}");
                }
            }
        }

        fn decode_script_num(bytes: &[u8]) -> Result<i64> {
            if bytes.is_empty() {
                return Ok(0);
            }
            anyhow::ensure!(bytes.len() <= 8, "script number too large: {} bytes", bytes.len());

            let mut magnitude = bytes.to_vec();
            let negative = magnitude.last().is_some_and(|b| (b & 0x80) != 0);
            if let Some(last) = magnitude.last_mut() {
                *last &= 0x7f;
            }

            let mut value: i64 = 0;
            for (i, b) in magnitude.iter().enumerate() {
                value |= i64::from(*b) << (8 * i);
            }
            Ok(if negative { -value } else { value })
        }

        fn timeout_from(actual: Instruction<'_>) -> Result<u32> {
            let value = parse_script_num(actual)?;
            u32::try_from(value).map_err(|_| anyhow::anyhow!("timeout out of range: {value}"))
        }

        let mut iter = witness_script.instructions_minimal();

        let parsed = match next(&mut iter)? {
            Instruction::Op(o) if o == op::OP_SIZE => {
                let size = parse_script_num(next(&mut iter)?)?;
                anyhow::ensure!(size == 32, "unexpected preimage size check: {size}");
                expect_op(next(&mut iter)?, op::OP_EQUAL)?;
                expect_op(next(&mut iter)?, op::OP_IF)?;
                expect_op(next(&mut iter)?, op::OP_HASH160)?;
                let hash_lock = expect_push::<20>(next(&mut iter)?)?;
                expect_op(next(&mut iter)?, op::OP_EQUALVERIFY)?;
                let claim_pubkey = expect_pubkey(next(&mut iter)?)?;
                expect_op(next(&mut iter)?, op::OP_ELSE)?;
                expect_op(next(&mut iter)?, op::OP_DROP)?;
                let timeout_block_height = timeout_from(next(&mut iter)?)?;
                expect_op(next(&mut iter)?, op::OP_CLTV)?;
                expect_op(next(&mut iter)?, op::OP_DROP)?;
                let refund_pubkey = expect_pubkey(next(&mut iter)?)?;
                Self {
                    template: ScriptTemplate::Reverse,
                    hash_lock,
                    claim_pubkey,
                    refund_pubkey,
                    timeout_block_height,
                }
            }
            Instruction::Op(o) if o == op::OP_HASH160 => {
                let hash_lock = expect_push::<20>(next(&mut iter)?)?;
                expect_op(next(&mut iter)?, op::OP_EQUAL)?;
                expect_op(next(&mut iter)?, op::OP_IF)?;
                let claim_pubkey = expect_pubkey(next(&mut iter)?)?;
                expect_op(next(&mut iter)?, op::OP_ELSE)?;
                let timeout_block_height = timeout_from(next(&mut iter)?)?;
                expect_op(next(&mut iter)?, op::OP_CLTV)?;
                expect_op(next(&mut iter)?, op::OP_DROP)?;
                let refund_pubkey = expect_pubkey(next(&mut iter)?)?;
                Self {
                    template: ScriptTemplate::Submarine,
                    hash_lock,
                    claim_pubkey,
                    refund_pubkey,
                    timeout_block_height,
                }
            }
            other => anyhow::bail!("unrecognized swap script, starts with {other:?}"),
        };

        expect_op(next(&mut iter)?, op::OP_ENDIF)?;
        expect_op(next(&mut iter)?, op::OP_CHECKSIG)?;
        anyhow::ensure!(
            iter.next().is_none(),
            "unexpected trailing instructions in swap script"
        );

        Ok(parsed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HtlcOutput {
    pub outpoint: OutPoint,
    pub value: Amount,
}

pub fn find_htlc_output(lockup_tx: &Transaction, witness_script: &Script) -> Result<HtlcOutput> {
    let script_pubkey = ScriptBuf::new_p2wsh(&witness_script.wscript_hash());
    let txid = lockup_tx.compute_txid();
    lockup_tx
        .output
        .iter()
        .enumerate()
        .find(|(_, out)| out.script_pubkey == script_pubkey)
        .map(|(vout, out)| HtlcOutput {
            outpoint: OutPoint {
                txid,
                vout: vout as u32,
            },
            value: out.value,
        })
        .with_context(|| format!("lockup tx {txid} has no output paying to the swap script"))
}

pub fn claim_tx(
    witness_script: &Script,
    htlc: &HtlcOutput,
    destination: &Address,
    secret_key: &SecretKey,
    preimage: [u8; 32],
    fee_sats: u64,
) -> Result<Transaction> {
    let mut tx = sweep_tx(htlc, destination, fee_sats, LockTime::ZERO, Sequence::MAX)?;

    let secp = Secp256k1::new();
    let sig = segwit_v0_sign(&secp, &tx, witness_script, htlc.value, secret_key)
        .context("sign claim input")?;

    tx.input[0].witness =
        Witness::from_slice(&[sig, preimage.to_vec(), witness_script.to_bytes()]);
    Ok(tx)
}

pub fn refund_tx(
    witness_script: &Script,
    timeout_block_height: u32,
    htlc: &HtlcOutput,
    destination: &Address,
    secret_key: &SecretKey,
    fee_sats: u64,
) -> Result<Transaction> {
    let lock_time = LockTime::from_height(timeout_block_height)
        .context("timeout_block_height is not a valid height locktime")?;
    let mut tx = sweep_tx(
        htlc,
        destination,
        fee_sats,
        lock_time,
        Sequence::ENABLE_LOCKTIME_NO_RBF,
    )?;

    let secp = Secp256k1::new();
    let sig = segwit_v0_sign(&secp, &tx, witness_script, htlc.value, secret_key)
        .context("sign refund input")?;

    // An empty preimage fails the hash lock and selects the timeout branch.
    tx.input[0].witness = Witness::from_slice(&[sig, Vec::new(), witness_script.to_bytes()]);
    Ok(tx)
}

fn sweep_tx(
    htlc: &HtlcOutput,
    destination: &Address,
    fee_sats: u64,
    lock_time: LockTime,
    sequence: Sequence,
) -> Result<Transaction> {
    let value = htlc
        .value
        .to_sat()
        .checked_sub(fee_sats)
        .filter(|v| *v >= DUST_LIMIT_SATS)
        .with_context(|| {
            format!(
                "htlc value {} sat cannot pay fee {fee_sats} sat above dust",
                htlc.value.to_sat()
            )
        })?;

    Ok(Transaction {
        version: Version::TWO,
        lock_time,
        input: vec![TxIn {
            previous_output: htlc.outpoint,
            script_sig: ScriptBuf::new(),
            sequence,
            witness: Witness::new(),
        }],
        output: vec![TxOut {
            value: Amount::from_sat(value),
            script_pubkey: destination.script_pubkey(),
        }],
    })
}

fn segwit_v0_sign(
    secp: &Secp256k1<All>,
    tx: &Transaction,
    witness_script: &Script,
    value: Amount,
    secret_key: &SecretKey,
) -> Result<Vec<u8>> {
    let mut cache = SighashCache::new(tx);
    let sighash = cache
        .p2wsh_signature_hash(0, witness_script, value, EcdsaSighashType::All)
        .context("compute segwit v0 sighash")?;
    let msg = Message::from_digest(sighash.to_byte_array());
    let sig = secp.sign_ecdsa(&msg, secret_key);
    Ok(EcdsaSignature::sighash_all(sig).to_vec())
}

pub fn sha256_preimage(preimage: &[u8; 32]) -> [u8; 32] {
    sha256::Hash::hash(preimage).to_byte_array()
}

pub fn hash_lock(payment_hash: &[u8; 32]) -> [u8; 20] {
    ripemd160::Hash::hash(payment_hash).to_byte_array()
}

pub fn tx_from_hex(tx_hex: &str) -> Result<Transaction> {
    let bytes = hex::decode(tx_hex.trim()).context("decode transaction hex")?;
    bitcoin::consensus::deserialize(&bytes).context("deserialize transaction")
}

pub fn tx_to_hex(tx: &Transaction) -> String {
    bitcoin::consensus::encode::serialize_hex(tx)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(byte: u8) -> (SecretKey, PublicKey) {
        let secp = Secp256k1::new();
        let sk = SecretKey::from_slice(&[byte; 32]).unwrap();
        (sk, PublicKey::from_secret_key(&secp, &sk))
    }

    fn lockup(script: &SwapScript, sats: u64) -> Transaction {
        Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![TxIn::default()],
            output: vec![
                TxOut {
                    value: Amount::from_sat(1_234),
                    script_pubkey: ScriptBuf::new(),
                },
                TxOut {
                    value: Amount::from_sat(sats),
                    script_pubkey: script.p2wsh_address(Network::Regtest).script_pubkey(),
                },
            ],
        }
    }

    fn destination() -> Address {
        let (_, pk) = key(9);
        Address::p2wpkh(&bitcoin::CompressedPublicKey(pk), Network::Regtest)
    }

    #[test]
    fn both_templates_parse_back() {
        let (_, claim) = key(1);
        let (_, refund) = key(2);
        for template in [ScriptTemplate::Reverse, ScriptTemplate::Submarine] {
            let script = SwapScript {
                template,
                hash_lock: hash_lock(&[3u8; 32]),
                claim_pubkey: claim,
                refund_pubkey: refund,
                timeout_block_height: 812_345,
            };
            assert_eq!(SwapScript::parse(&script.witness_script()).unwrap(), script);
        }
    }

    #[test]
    fn parse_rejects_foreign_scripts() {
        let script = Builder::new()
            .push_opcode(op::OP_DUP)
            .push_opcode(op::OP_CHECKSIG)
            .into_script();
        assert!(SwapScript::parse(&script).is_err());

        let (_, pk) = key(1);
        let mut bytes = SwapScript {
            template: ScriptTemplate::Reverse,
            hash_lock: [0u8; 20],
            claim_pubkey: pk,
            refund_pubkey: pk,
            timeout_block_height: 100,
        }
        .witness_script()
        .to_bytes();
        bytes.push(op::OP_NOP.to_u8());
        assert!(SwapScript::parse(&ScriptBuf::from_bytes(bytes)).is_err());
    }

    #[test]
    fn claim_tx_reveals_preimage_and_pays_destination() {
        let (claim_sk, claim_pk) = key(1);
        let (_, refund_pk) = key(2);
        let preimage = [5u8; 32];
        let script = SwapScript {
            template: ScriptTemplate::Reverse,
            hash_lock: hash_lock(&sha256_preimage(&preimage)),
            claim_pubkey: claim_pk,
            refund_pubkey: refund_pk,
            timeout_block_height: 500,
        };
        let lockup_tx = lockup(&script, 100_000);
        let htlc = find_htlc_output(&lockup_tx, &script.witness_script()).unwrap();
        assert_eq!(htlc.outpoint.vout, 1);

        let tx = claim_tx(
            &script.witness_script(),
            &htlc,
            &destination(),
            &claim_sk,
            preimage,
            1_000,
        )
        .unwrap();

        assert_eq!(tx.output[0].value, Amount::from_sat(99_000));
        assert_eq!(tx.lock_time, LockTime::ZERO);
        let witness: Vec<&[u8]> = tx.input[0].witness.iter().collect();
        assert_eq!(witness.len(), 3);
        assert_eq!(witness[1], &preimage[..]);
        assert_eq!(witness[2], script.witness_script().as_bytes());
        assert_eq!(tx_from_hex(&tx_to_hex(&tx)).unwrap(), tx);
    }

    #[test]
    fn refund_tx_is_time_locked() {
        let (_, claim_pk) = key(1);
        let (refund_sk, refund_pk) = key(2);
        let script = SwapScript {
            template: ScriptTemplate::Submarine,
            hash_lock: hash_lock(&[8u8; 32]),
            claim_pubkey: claim_pk,
            refund_pubkey: refund_pk,
            timeout_block_height: 700,
        };
        let lockup_tx = lockup(&script, 50_000);
        let htlc = find_htlc_output(&lockup_tx, &script.witness_script()).unwrap();

        let tx = refund_tx(
            &script.witness_script(),
            700,
            &htlc,
            &destination(),
            &refund_sk,
            500,
        )
        .unwrap();

        assert_eq!(tx.lock_time, LockTime::from_height(700).unwrap());
        assert_eq!(tx.input[0].sequence, Sequence::ENABLE_LOCKTIME_NO_RBF);
        assert!(tx.input[0].witness.nth(1).unwrap().is_empty());
    }

    #[test]
    fn sweep_refuses_to_burn_the_output_in_fees() {
        let (sk, pk) = key(1);
        let script = SwapScript {
            template: ScriptTemplate::Reverse,
            hash_lock: [0u8; 20],
            claim_pubkey: pk,
            refund_pubkey: pk,
            timeout_block_height: 1,
        };
        let htlc = find_htlc_output(&lockup(&script, 1_000), &script.witness_script()).unwrap();
        assert!(
            claim_tx(&script.witness_script(), &htlc, &destination(), &sk, [0u8; 32], 900)
                .is_err()
        );
    }
}
