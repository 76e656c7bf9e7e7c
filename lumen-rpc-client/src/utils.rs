use sha2::{Digest, Sha256};
use stellar_xdr::curr::{
    AccountId, LedgerEntryData, LedgerKey, LedgerKeyAccount, Limits,
    PublicKey, ReadXdr, Transaction, Uint256, WriteXdr,
};

use crate::{SorobanRpcClientError, SorobanRpcClientResult};

/// SHA-256 of the network passphrase, used as the signing domain separator.
pub fn network_id(network_passphrase: &str) -> [u8; 32] {
    Sha256::digest(network_passphrase.as_bytes()).into()
}

/// Computes the signing hash of a transaction:
/// `SHA256(network_id ‖ ENVELOPE_TYPE_TX ‖ tx_xdr)`.
pub fn transaction_hash(
    tx: &Transaction,
    network_passphrase: &str,
) -> SorobanRpcClientResult<[u8; 32]> {
    // ENVELOPE_TYPE_TX = 2, big-endian per XDR.
    const ENVELOPE_TYPE_TX: u32 = 2;

    let tx_xdr = tx
        .to_xdr(Limits::none())
        .map_err(|err| SorobanRpcClientError::Xdr(err.to_string()))?;

    let mut preimage =
        Vec::with_capacity(32 + std::mem::size_of::<u32>() + tx_xdr.len());
    preimage.extend_from_slice(&network_id(network_passphrase));
    preimage.extend_from_slice(&ENVELOPE_TYPE_TX.to_be_bytes());
    preimage.extend_from_slice(&tx_xdr);

    Ok(Sha256::digest(&preimage).into())
}

/// Parses a `G...` address into an XDR account id.
pub fn account_id_from_address(
    address: &str,
) -> SorobanRpcClientResult<AccountId> {
    let key = stellar_strkey::ed25519::PublicKey::from_string(address)
        .map_err(|err| {
            SorobanRpcClientError::Xdr(format!(
                "invalid account address '{}': {:?}",
                address, err
            ))
        })?;
    Ok(AccountId(PublicKey::PublicKeyTypeEd25519(Uint256(key.0))))
}

/// Builds the base64 `LedgerKey::Account` for a `G...` address, the key
/// `getLedgerEntries` takes to look up an account entry.
pub fn account_ledger_key(address: &str) -> SorobanRpcClientResult<String> {
    let key = LedgerKey::Account(LedgerKeyAccount {
        account_id: account_id_from_address(address)?,
    });
    key.to_xdr_base64(Limits::none())
        .map_err(|err| SorobanRpcClientError::Xdr(err.to_string()))
}

/// Decodes an account ledger entry and returns its sequence number.
pub fn account_sequence_from_entry(
    entry_xdr: &str,
) -> SorobanRpcClientResult<i64> {
    let data = LedgerEntryData::from_xdr_base64(entry_xdr, Limits::none())
        .map_err(|err| SorobanRpcClientError::Xdr(err.to_string()))?;
    match data {
        LedgerEntryData::Account(account) => Ok(account.seq_num.0),
        other => Err(SorobanRpcClientError::Xdr(format!(
            "expected account ledger entry, got {}",
            other.name()
        ))),
    }
}
