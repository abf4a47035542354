//! UTXO transaction planning, signing and broadcast.
//!
//! Coins are pooled: any wallet's unspent outputs may fund any
//! withdrawal on the chain, with the off-chain balance difference
//! reconciled through the private ledger. Inputs are selected largest
//! first, signed through a PSBT and relayed via the pinned broadcast
//! backend. Selected outputs flip to spent only after the relay accepts
//! the transaction, and change is written back as a fresh unspent
//! output.

use std::str::FromStr;
use std::sync::Arc;

use bitcoin::absolute::LockTime;
use bitcoin::hashes::Hash;
use bitcoin::opcodes::{Opcode, OP_0};
use bitcoin::psbt::Psbt;
use bitcoin::script::{Builder, PushBytesBuf};
use bitcoin::secp256k1::{All, Message, Secp256k1, SecretKey};
use bitcoin::sighash::SighashCache;
use bitcoin::transaction::Version;
use bitcoin::{
    base58, Amount, EcdsaSighashType, OutPoint, PubkeyHash, PublicKey, ScriptBuf, ScriptHash,
    Sequence, Transaction, TxIn, TxOut, Txid, Witness,
};
use tracing::{info, warn};

use crate::chains::{
    chain_spec, satoshi_to_standard_unit, standard_unit_to_satoshi, utxo_params, UtxoParams,
};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::model::{Utxo, UtxoStatus, WithdrawalRequest};
use crate::store::{KeyVault, WalletStore};
use crate::utxo::backend::{self, UtxoBackend};

/// Conservative legacy-input size used for fee estimation
pub const INPUT_VBYTES: u64 = 180;
pub const OUTPUT_VBYTES: u64 = 34;
pub const TX_OVERHEAD_VBYTES: u64 = 10;

/// Outputs below this stay in the fee rather than creating dust
const DUST_LIMIT_SATS: u64 = 546;

pub fn estimated_tx_vbytes(inputs: usize, outputs: usize) -> u64 {
    inputs as u64 * INPUT_VBYTES + outputs as u64 * OUTPUT_VBYTES + TX_OVERHEAD_VBYTES
}

/// Network fee in satoshis. Chains with a flat fee in the registry skip
/// the size-based estimate entirely.
pub fn network_fee_sats(
    chain: &str,
    inputs: usize,
    outputs: usize,
    rate_per_byte: f64,
) -> Result<u64> {
    if let Some(flat) = chain_spec(chain)?.fixed_fee_sats {
        return Ok(flat);
    }
    Ok((estimated_tx_vbytes(inputs, outputs) as f64 * rate_per_byte).ceil() as u64)
}

/// Largest-first selection until `required_sats` is covered
pub fn select_utxos(unspent: &[Utxo], required_sats: u64) -> Result<(Vec<Utxo>, u64)> {
    let mut selected = Vec::new();
    let mut total = 0u64;
    for utxo in unspent {
        if total >= required_sats {
            break;
        }
        selected.push(utxo.clone());
        total += utxo.amount;
    }
    if total < required_sats {
        return Err(Error::InsufficientUtxos {
            total_sats: total,
            required_sats,
        });
    }
    Ok((selected, total))
}

/// A fully costed input selection
#[derive(Debug, Clone)]
pub struct TxPlan {
    pub inputs: Vec<Utxo>,
    pub total_input_sats: u64,
    pub network_fee_sats: u64,
    pub change_sats: u64,
}

/// Select inputs and the matching network fee together.
///
/// The fee depends on the input count and the input count depends on the
/// fee, so the selection loops until it stabilizes. Two outputs are
/// assumed: recipient and change.
pub fn plan_transaction(
    chain: &str,
    unspent: &[Utxo],
    amount_sats: u64,
    flat_fee_sats: u64,
    rate_per_byte: f64,
) -> Result<TxPlan> {
    let mut input_count = 1usize;
    // Input count can only grow, so the loop is bounded by the UTXO set
    for _ in 0..=unspent.len() {
        let fee = network_fee_sats(chain, input_count, 2, rate_per_byte)?;
        let required = amount_sats + flat_fee_sats + fee;
        let (selected, total) = select_utxos(unspent, required)?;
        if selected.len() == input_count {
            let change = total - required;
            return Ok(TxPlan {
                inputs: selected,
                total_input_sats: total,
                network_fee_sats: fee,
                change_sats: change,
            });
        }
        input_count = selected.len();
    }
    Err(Error::Internal("input selection did not converge".to_string()))
}

/// Fee quote for a prospective withdrawal, in satoshis
pub async fn estimate_withdrawal_fee(
    chain: &str,
    unspent: &[Utxo],
    amount_sats: u64,
    config: &Config,
) -> Result<u64> {
    let rate = if chain_spec(chain)?.fixed_fee_sats.is_some() {
        0.0
    } else {
        backend::fee_rate_per_byte(chain, config).await?
    };
    let plan = plan_transaction(chain, unspent, amount_sats, 0, rate)?;
    Ok(plan.network_fee_sats)
}

pub struct UtxoWithdrawer {
    config: Arc<Config>,
    wallets: Arc<dyn WalletStore>,
    vault: Arc<dyn KeyVault>,
}

impl UtxoWithdrawer {
    pub fn new(config: Arc<Config>, wallets: Arc<dyn WalletStore>, vault: Arc<dyn KeyVault>) -> Self {
        Self {
            config,
            wallets,
            vault,
        }
    }

    /// Settle one UTXO withdrawal. Returns the relayed txid.
    ///
    /// The caller must hold the chain's serialization lock: the claim on
    /// the selected outputs is only exactly-once while selection and the
    /// spent flip cannot interleave with another withdrawal.
    pub async fn withdraw(&self, request: &WithdrawalRequest) -> Result<String> {
        let chain = request.chain.as_str();
        let params = utxo_params(chain, self.config.utxo.btc_testnet)?;

        // Recipient is validated before anything touches the network
        let recipient_script = parse_utxo_address(&request.to_address, &params)?;

        let amount_sats = standard_unit_to_satoshi(request.amount, chain)?;
        let flat_fee_sats = standard_unit_to_satoshi(request.fee, chain)?;

        let unspent = self.wallets.list_unspent(chain).await?;
        let rate = if chain_spec(chain)?.fixed_fee_sats.is_some() {
            0.0
        } else {
            backend::fee_rate_per_byte(chain, &self.config).await?
        };
        let plan = plan_transaction(chain, &unspent, amount_sats, flat_fee_sats, rate)?;

        // Change returns to the user's own deposit address on this chain
        let wallet = self.wallets.get_wallet(&request.wallet_id).await?;
        let change_address = wallet
            .chain_address(chain)
            .map(|entry| entry.address.clone())
            .ok_or_else(|| {
                Error::WalletNotFound(format!("{} has no {chain} address", request.wallet_id))
            })?;
        let change_script = parse_utxo_address(&change_address, &params)?;

        let read = backend::backend_for(chain, &self.config)?;
        let signed = self
            .build_and_sign(
                chain,
                &plan,
                &params,
                &recipient_script,
                amount_sats,
                &change_script,
                read.as_ref(),
            )
            .await?;
        let raw_hex = bitcoin::consensus::encode::serialize_hex(&signed);

        let relay = backend::broadcast_backend_for(chain, &self.config)?;
        let txid = relay.broadcast_transaction(&raw_hex).await?;
        info!(chain, %txid, amount = request.amount, "utxo withdrawal broadcast");

        // Only now do the inputs flip to spent; a failed relay leaves the
        // set untouched for the refund path.
        let spent_ids: Vec<String> = plan.inputs.iter().map(|u| u.id.clone()).collect();
        self.wallets.mark_utxos_spent(&spent_ids).await?;

        if plan.change_sats >= DUST_LIMIT_SATS {
            self.record_change(
                chain,
                &txid,
                &request.wallet_id,
                &change_address,
                plan.change_sats,
                read.as_ref(),
            )
            .await;
        } else if plan.change_sats > 0 {
            self.book_dust_remainder(request, chain, plan.change_sats).await;
        }

        Ok(txid)
    }

    /// Change below the dust limit stays with the miners as extra fee.
    /// Book it in the private ledger so the wallet's books reconcile.
    async fn book_dust_remainder(
        &self,
        request: &WithdrawalRequest,
        chain: &str,
        remainder_sats: u64,
    ) {
        let burned = match satoshi_to_standard_unit(remainder_sats, chain) {
            Ok(value) => value,
            Err(e) => {
                warn!(chain, error = %e, "could not convert dust remainder");
                return;
            }
        };
        let index = match self
            .wallets
            .get_wallet_key_data(&request.wallet_id, chain)
            .await
        {
            Ok(data) => data.index,
            Err(e) => {
                warn!(chain, error = %e, "no key data to book dust remainder against");
                return;
            }
        };
        if let Err(e) = crate::ledger::update_private_ledger(
            self.wallets.as_ref(),
            &request.wallet_id,
            index,
            &request.currency,
            chain,
            -burned,
            &self.config,
        )
        .await
        {
            warn!(chain, request_id = %request.id, error = %e, "failed to book dust remainder");
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn build_and_sign(
        &self,
        chain: &str,
        plan: &TxPlan,
        params: &UtxoParams,
        recipient_script: &ScriptBuf,
        amount_sats: u64,
        change_script: &ScriptBuf,
        read: &dyn UtxoBackend,
    ) -> Result<Transaction> {
        let secp = Secp256k1::new();
        let mut tx_inputs = Vec::with_capacity(plan.inputs.len());
        let mut prev_txs = Vec::with_capacity(plan.inputs.len());
        let mut keys = Vec::with_capacity(plan.inputs.len());

        for utxo in &plan.inputs {
            let key_data = self
                .wallets
                .get_wallet_key_data(&utxo.wallet_id, chain)
                .await?;
            let decrypted = self.vault.decrypt(&key_data.encrypted_data).await?;
            let keypair = parse_wif(&decrypted.private_key, params, &secp).map_err(|e| match e {
                Error::Decryption(msg) => {
                    Error::Decryption(format!("wallet {}: {msg}", utxo.wallet_id))
                }
                other => other,
            })?;

            let raw_hex = read.fetch_raw_transaction(&utxo.transaction_id).await?;
            let prev_tx: Transaction = bitcoin::consensus::encode::deserialize_hex(&raw_hex)
                .map_err(|e| Error::Rpc(format!("prev tx {}: {e}", utxo.transaction_id)))?;
            let txid = Txid::from_str(&utxo.transaction_id)
                .map_err(|e| Error::Store(format!("bad txid {}: {e}", utxo.transaction_id)))?;
            if prev_tx.output.get(utxo.index as usize).is_none() {
                return Err(Error::Store(format!(
                    "utxo {} points past outputs of {}",
                    utxo.id, utxo.transaction_id
                )));
            }

            tx_inputs.push(TxIn {
                previous_output: OutPoint {
                    txid,
                    vout: utxo.index,
                },
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::default(),
            });
            prev_txs.push(prev_tx);
            keys.push(keypair);
        }

        let mut outputs = vec![TxOut {
            value: Amount::from_sat(amount_sats),
            script_pubkey: recipient_script.clone(),
        }];
        if plan.change_sats >= DUST_LIMIT_SATS {
            outputs.push(TxOut {
                value: Amount::from_sat(plan.change_sats),
                script_pubkey: change_script.clone(),
            });
        }

        let unsigned = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: tx_inputs,
            output: outputs,
        };

        let mut psbt = Psbt::from_unsigned_tx(unsigned)
            .map_err(|e| Error::Internal(format!("psbt: {e}")))?;
        for (i, prev_tx) in prev_txs.iter().enumerate() {
            psbt.inputs[i].non_witness_utxo = Some(prev_tx.clone());
        }

        // Hash against a copy so the cache's borrow does not block the
        // finalize writes below
        let sighash_tx = psbt.unsigned_tx.clone();
        let cache = SighashCache::new(&sighash_tx);
        for (i, utxo) in plan.inputs.iter().enumerate() {
            let prevout = &prev_txs[i].output[utxo.index as usize];
            let sighash = cache
                .legacy_signature_hash(
                    i,
                    &prevout.script_pubkey,
                    EcdsaSighashType::All.to_u32(),
                )
                .map_err(|e| Error::Internal(format!("sighash: {e}")))?;
            let message = Message::from_digest(sighash.to_byte_array());
            let (secret, pubkey) = &keys[i];
            let signature = bitcoin::ecdsa::Signature {
                signature: secp.sign_ecdsa(&message, secret),
                sighash_type: EcdsaSighashType::All,
            };
            let sig_push = PushBytesBuf::try_from(signature.to_vec())
                .map_err(|e| Error::Internal(format!("signature push: {e}")))?;
            let script_sig = Builder::new()
                .push_slice(sig_push)
                .push_key(pubkey)
                .into_script();
            psbt.inputs[i].final_script_sig = Some(script_sig);
        }

        psbt.extract_tx()
            .map_err(|e| Error::Internal(format!("psbt extract: {e}")))
    }

    /// Persist the change output as a fresh unspent UTXO. Best effort: a
    /// lookup failure is logged and reconciled by the deposit watcher.
    async fn record_change(
        &self,
        chain: &str,
        txid: &str,
        wallet_id: &str,
        change_address: &str,
        change_sats: u64,
        read: &dyn UtxoBackend,
    ) {
        let found = backend::fetch_transaction_bounded(read, txid, &self.config).await;
        match found {
            Ok(tx) => match tx.output_to(change_address) {
                Some((index, output)) => {
                    let utxo = Utxo {
                        id: uuid::Uuid::new_v4().to_string(),
                        wallet_id: wallet_id.to_string(),
                        transaction_id: txid.to_string(),
                        index,
                        amount: change_sats,
                        script: output.script.clone(),
                        status: UtxoStatus::Unspent,
                    };
                    if let Err(e) = self.wallets.insert_utxo(utxo).await {
                        warn!(chain, txid, error = %e, "failed to persist change output");
                    }
                }
                None => warn!(chain, txid, "change output missing from relayed transaction"),
            },
            Err(e) => warn!(chain, txid, error = %e, "could not confirm change output"),
        }
    }
}

/// Decode a destination address against the chain's own prefixes and
/// return its script pubkey. A well-formed address for some other chain
/// fails here, before any network traffic.
pub fn parse_utxo_address(address: &str, params: &UtxoParams) -> Result<ScriptBuf> {
    if let Some(hrp) = params.bech32_hrp {
        let lower = address.to_lowercase();
        if lower.starts_with(&format!("{hrp}1")) {
            let (_, version, program) = bitcoin::bech32::segwit::decode(&lower)
                .map_err(|_| Error::InvalidAddress(address.to_string()))?;
            return witness_script(version.to_u8(), &program)
                .ok_or_else(|| Error::InvalidAddress(address.to_string()));
        }
    }

    let payload =
        base58::decode_check(address).map_err(|_| Error::InvalidAddress(address.to_string()))?;
    if payload.len() != 21 {
        return Err(Error::InvalidAddress(address.to_string()));
    }
    let mut hash = [0u8; 20];
    hash.copy_from_slice(&payload[1..]);
    match payload[0] {
        v if v == params.p2pkh_prefix => {
            Ok(ScriptBuf::new_p2pkh(&PubkeyHash::from_byte_array(hash)))
        }
        v if v == params.p2sh_prefix => {
            Ok(ScriptBuf::new_p2sh(&ScriptHash::from_byte_array(hash)))
        }
        _ => Err(Error::InvalidAddress(address.to_string())),
    }
}

fn witness_script(version: u8, program: &[u8]) -> Option<ScriptBuf> {
    if version > 16 || program.len() < 2 || program.len() > 40 {
        return None;
    }
    if version == 0 && program.len() != 20 && program.len() != 32 {
        return None;
    }
    let opcode = if version == 0 {
        OP_0
    } else {
        // OP_PUSHNUM_1 is 0x51
        Opcode::from(0x50 + version)
    };
    let push = PushBytesBuf::try_from(program.to_vec()).ok()?;
    Some(
        Builder::new()
            .push_opcode(opcode)
            .push_slice(push)
            .into_script(),
    )
}

/// Decode a WIF key with the chain's version byte. Returns the signing
/// key and the public key in the encoding the WIF flag asks for.
pub fn parse_wif(
    wif: &str,
    params: &UtxoParams,
    secp: &Secp256k1<All>,
) -> Result<(SecretKey, PublicKey)> {
    let payload =
        base58::decode_check(wif).map_err(|_| Error::Decryption("malformed WIF key".to_string()))?;
    let compressed = match payload.len() {
        33 => false,
        34 if payload[33] == 0x01 => true,
        _ => return Err(Error::Decryption("malformed WIF key".to_string())),
    };
    if payload[0] != params.wif_prefix {
        return Err(Error::Decryption(
            "WIF key encoded for a different chain".to_string(),
        ));
    }
    let secret = SecretKey::from_slice(&payload[1..33])
        .map_err(|e| Error::Decryption(format!("invalid key material: {e}")))?;
    let public = PublicKey {
        compressed,
        inner: secret.public_key(secp),
    };
    Ok((secret, public))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utxo(id: &str, sats: u64) -> Utxo {
        Utxo {
            id: id.into(),
            wallet_id: "w1".into(),
            transaction_id: format!("tx-{id}"),
            index: 0,
            amount: sats,
            script: "76a914".into(),
            status: UtxoStatus::Unspent,
        }
    }

    #[test]
    fn test_btc_uses_flat_fee() {
        let fee = network_fee_sats("BTC", 5, 2, 50.0).unwrap();
        assert_eq!(fee, 380);
    }

    #[test]
    fn test_size_based_fee() {
        // 2 inputs, 2 outputs at 5 sat/B
        let fee = network_fee_sats("LTC", 2, 2, 5.0).unwrap();
        assert_eq!(fee, (2 * 180 + 2 * 34 + 10) * 5);
    }

    #[test]
    fn test_selection_is_largest_first_prefix() {
        let unspent = vec![utxo("a", 50_000_000), utxo("b", 30_000_000), utxo("c", 10_000_000)];
        let (selected, total) = select_utxos(&unspent, 60_000_000).unwrap();
        assert_eq!(selected.len(), 2);
        assert_eq!(total, 80_000_000);
    }

    #[test]
    fn test_selection_shortfall() {
        let unspent = vec![utxo("a", 10_000)];
        let err = select_utxos(&unspent, 20_000).unwrap_err();
        assert!(matches!(
            err,
            Error::InsufficientUtxos {
                total_sats: 10_000,
                required_sats: 20_000
            }
        ));
    }

    #[test]
    fn test_plan_fee_converges_with_input_count() {
        // Wallet holds 0.5, 0.3 and 0.1 LTC; withdrawing 0.6 at 5 sat/B
        // needs two inputs, so the fee must be priced for two.
        let unspent = vec![utxo("a", 50_000_000), utxo("b", 30_000_000), utxo("c", 10_000_000)];
        let plan = plan_transaction("LTC", &unspent, 60_000_000, 0, 5.0).unwrap();
        assert_eq!(plan.inputs.len(), 2);
        assert_eq!(plan.network_fee_sats, (2 * 180 + 2 * 34 + 10) * 5);
        assert_eq!(
            plan.change_sats,
            80_000_000 - 60_000_000 - plan.network_fee_sats
        );
    }

    #[test]
    fn test_exact_fit_single_input_no_change() {
        // One output covering amount + flat BTC fee exactly: no change
        let unspent = vec![utxo("a", 10_000 + 380)];
        let plan = plan_transaction("BTC", &unspent, 10_000, 0, 0.0).unwrap();
        assert_eq!(plan.inputs.len(), 1);
        assert_eq!(plan.change_sats, 0);
    }

    #[test]
    fn test_plan_insufficient_funds() {
        let unspent = vec![utxo("a", 1_000)];
        let err = plan_transaction("BTC", &unspent, 10_000, 0, 0.0).unwrap_err();
        assert!(matches!(err, Error::InsufficientUtxos { .. }));
    }

    #[test]
    fn test_address_chain_validation() {
        let btc = utxo_params("BTC", false).unwrap();
        let ltc = utxo_params("LTC", false).unwrap();
        let doge = utxo_params("DOGE", false).unwrap();

        // Each chain accepts its own mainnet encoding
        assert!(parse_utxo_address("1BoatSLRHtKNngkdXEeobR76b53LETtpyT", &btc).is_ok());
        assert!(parse_utxo_address("LcHKx9yc2eRgSAcFUJPjYN4cQLUKgBY3f2", &ltc).is_ok());
        assert!(parse_utxo_address("DH5yaieqoZN36fDVciNyRueRGvGLR3mr7L", &doge).is_ok());

        // Well-formed addresses for another chain fail the prefix check
        assert!(matches!(
            parse_utxo_address("DH5yaieqoZN36fDVciNyRueRGvGLR3mr7L", &btc).unwrap_err(),
            Error::InvalidAddress(_)
        ));
        assert!(matches!(
            parse_utxo_address("1BoatSLRHtKNngkdXEeobR76b53LETtpyT", &doge).unwrap_err(),
            Error::InvalidAddress(_)
        ));

        // Mainnet P2PKH fails against the testnet prefixes
        let testnet = utxo_params("BTC", true).unwrap();
        assert!(matches!(
            parse_utxo_address("1BoatSLRHtKNngkdXEeobR76b53LETtpyT", &testnet).unwrap_err(),
            Error::InvalidAddress(_)
        ));
        assert!(matches!(
            parse_utxo_address("garbage", &btc).unwrap_err(),
            Error::InvalidAddress(_)
        ));
    }

    #[test]
    fn test_bech32_recipient_script() {
        let btc = utxo_params("BTC", false).unwrap();
        let script =
            parse_utxo_address("bc1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4", &btc).unwrap();
        assert!(script.is_p2wpkh());

        // Chains without a bech32 prefix refuse segwit strings outright
        let doge = utxo_params("DOGE", false).unwrap();
        assert!(
            parse_utxo_address("bc1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4", &doge).is_err()
        );
    }

    #[tokio::test]
    async fn test_dust_remainder_is_booked_to_ledger() {
        use crate::model::{RequestStatus, WalletKeyData};
        use crate::store::{MemoryStore, PlainKeyVault};

        let store = Arc::new(MemoryStore::new());
        store
            .insert_key_data(WalletKeyData {
                wallet_id: "w1".into(),
                currency: "BTC".into(),
                chain: "BTC".into(),
                index: 2,
                balance: 1.0,
                encrypted_data: "{}".into(),
            })
            .await;
        let withdrawer = UtxoWithdrawer::new(
            Arc::new(Config::default()),
            store.clone(),
            Arc::new(PlainKeyVault),
        );
        let request = WithdrawalRequest {
            id: "r1".into(),
            user_id: "u1".into(),
            wallet_id: "w1".into(),
            currency: "BTC".into(),
            chain: "BTC".into(),
            amount: 0.01,
            fee: 0.0001,
            to_address: "1BoatSLRHtKNngkdXEeobR76b53LETtpyT".into(),
            status: RequestStatus::Pending,
            reference_id: None,
            description: None,
            created_at: chrono::Utc::now(),
        };

        // 300 sats of sub-dust change lands as a negative ledger delta
        withdrawer.book_dust_remainder(&request, "BTC", 300).await;
        let entry = store
            .get_ledger_entry("w1", 2, "BTC", "BTC")
            .await
            .unwrap()
            .unwrap();
        assert!((entry.offchain_difference + 0.000003).abs() < 1e-12);
    }

    #[test]
    fn test_wif_prefix_enforced() {
        let secp = Secp256k1::new();
        let btc = utxo_params("BTC", false).unwrap();
        let doge = utxo_params("DOGE", false).unwrap();
        let wif = "L1uyy5qTuGrVXrmrsvHWHgVzW9kKdrp27wBC7Vs6nZDTF2BRUVwy";

        let (_, pubkey) = parse_wif(wif, &btc, &secp).unwrap();
        assert!(pubkey.compressed);
        assert!(matches!(
            parse_wif(wif, &doge, &secp).unwrap_err(),
            Error::Decryption(_)
        ));
        assert!(matches!(
            parse_wif("garbage", &btc, &secp).unwrap_err(),
            Error::Decryption(_)
        ));
    }
}
