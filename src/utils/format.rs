use crate::ledger::LedgerKind;
use num_bigint::BigUint;

/// Decimal places of the native token amounts of a ledger kind.
pub fn token_decimals(kind: LedgerKind) -> u32 {
    match kind {
        LedgerKind::Sequential => 6,
        LedgerKind::Block => 18,
    }
}

/// Render an integer amount of base units as a decimal string with `decimals` places.
pub fn format_token_amount(amount: &BigUint, decimals: u32) -> String {
    let digits = amount.to_string();
    let decimals = decimals as usize;
    if decimals == 0 {
        return digits;
    }

    let padded = format!("{:0>width$}", digits, width = decimals + 1);
    let (whole, fraction) = padded.split_at(padded.len() - decimals);
    format!("{}.{}", whole, fraction)
}
