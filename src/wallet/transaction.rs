//! Local signing of router-built transactions.
//!
//! Wire layout (legacy and v0 alike):
//!
//! ```text
//! [num_signatures: compact-u16] [num_signatures × 64-byte slots] [message]
//! ```
//!
//! The signed payload is the whole message; for v0 transactions the
//! message starts with the `0x80` version prefix. The fee payer's
//! signature always goes in slot 0.

use crate::types::CycleError;
use crate::wallet::Keypair;

const SIGNATURE_LEN: usize = 64;

/// Sign `tx` with `keypair`, returning the transaction with slot 0 filled.
pub fn sign_transaction(tx: &[u8], keypair: &Keypair) -> Result<Vec<u8>, CycleError> {
    let (num_sigs, prefix_len) = decode_compact_u16(tx)?;
    if num_sigs == 0 {
        return Err(CycleError::MalformedTransaction(
            "transaction requires no signatures".into(),
        ));
    }

    let message_start = prefix_len + usize::from(num_sigs) * SIGNATURE_LEN;
    if tx.len() <= message_start {
        return Err(CycleError::MalformedTransaction(format!(
            "need more than {message_start} bytes for {num_sigs} signature slot(s), have {}",
            tx.len()
        )));
    }

    let signature = keypair.sign(&tx[message_start..]);

    let mut signed = tx.to_vec();
    signed[prefix_len..prefix_len + SIGNATURE_LEN].copy_from_slice(&signature.to_bytes());
    Ok(signed)
}

/// Decode a compact-u16. Returns `(value, bytes_consumed)`.
pub fn decode_compact_u16(data: &[u8]) -> Result<(u16, usize), CycleError> {
    let mut value: u32 = 0;
    for (i, byte) in data.iter().take(3).enumerate() {
        let byte = u32::from(*byte);
        value |= (byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            return u16::try_from(value)
                .map(|v| (v, i + 1))
                .map_err(|_| CycleError::MalformedTransaction("compact-u16 overflow".into()));
        }
    }
    Err(CycleError::MalformedTransaction("truncated compact-u16".into()))
}

/// Encode a compact-u16.
pub fn encode_compact_u16(value: u16) -> Vec<u8> {
    let mut out = Vec::with_capacity(3);
    let mut rem = value;
    loop {
        let mut byte = (rem & 0x7f) as u8;
        rem >>= 7;
        if rem == 0 {
            out.push(byte);
            return out;
        }
        byte |= 0x80;
        out.push(byte);
    }
}
