//!
//! Syntactic validation of ledger addresses.
//!
//! Sequential ledgers use 16-byte account addresses written as hex, optionally `0x`-prefixed.
//! Block ledgers use 20-byte addresses written as `0x`-prefixed hex.

use crate::chain::types::ChainError;
use crate::ledger::LedgerKind;

const SEQUENTIAL_ADDRESS_LEN: usize = 16;
const BLOCK_ADDRESS_LEN: usize = 20;

/// Decoded form of an address, kept next to the original spelling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerAddress {
	pub kind: LedgerKind,
	pub bytes: Vec<u8>,
}

impl LedgerAddress {
	/// Decode `address` as an address of a `kind` ledger.
	pub fn decode(kind: LedgerKind, address: &str) -> Result<Self, ChainError> {
		let (digits, expected_len) = match kind {
			LedgerKind::Sequential => (
				address.strip_prefix("0x").unwrap_or(address),
				SEQUENTIAL_ADDRESS_LEN,
			),
			LedgerKind::Block => (
				address
					.strip_prefix("0x")
					.ok_or_else(|| ChainError::InvalidAddress(format!("{} is missing the 0x prefix", address)))?,
				BLOCK_ADDRESS_LEN,
			),
		};

		let bytes = hex::decode(digits)
			.map_err(|e| ChainError::InvalidAddress(format!("{}: {}", address, e)))?;
		if bytes.len() != expected_len {
			return Err(ChainError::InvalidAddress(format!(
				"{} is {} bytes, expected {}",
				address,
				bytes.len(),
				expected_len
			)));
		}

		Ok(Self { kind, bytes })
	}

	/// Canonical spelling: lowercase hex, `0x`-prefixed for block ledgers.
	pub fn canonical(&self) -> String {
		match self.kind {
			LedgerKind::Sequential => hex::encode(&self.bytes),
			LedgerKind::Block => format!("0x{}", hex::encode(&self.bytes)),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_decode_sequential() {
		let address = LedgerAddress::decode(LedgerKind::Sequential, "0xF72589B71FF4F8D139674A3F7369C69B")
			.expect("valid sequential address");
		assert_eq!(address.bytes.len(), 16);
		assert_eq!(address.canonical(), "f72589b71ff4f8d139674a3f7369c69b");
	}

	#[test]
	fn test_decode_block() {
		let address =
			LedgerAddress::decode(LedgerKind::Block, "0x765DE816845861e75A25fCA122bb6898B8B1282a")
				.expect("valid block address");
		assert_eq!(address.canonical(), "0x765de816845861e75a25fca122bb6898b8b1282a");
	}

	#[test]
	fn test_rejects_malformed() {
		assert!(LedgerAddress::decode(LedgerKind::Block, "765de816845861e75a25fca122bb6898b8b1282a").is_err());
		assert!(LedgerAddress::decode(LedgerKind::Block, "0x765de8").is_err());
		assert!(LedgerAddress::decode(LedgerKind::Sequential, "zz2589b71ff4f8d139674a3f7369c69b").is_err());
	}
}
