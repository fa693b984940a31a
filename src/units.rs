use crate::ledger::Amount;

pub const WEI: Amount = 1;
pub const GWEI: Amount = 1_000_000_000;
pub const FINNEY: Amount = 1_000_000_000_000_000; // 1 finney = 1e15 wei
pub const ETHER: Amount = 1_000_000_000_000_000_000; // 1 ether = 1e18 wei

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum UnitsError {
    #[error("empty amount")]
    Empty,
    #[error("unknown denomination '{0}'")]
    UnknownDenomination(String),
    #[error("malformed amount '{0}'")]
    Malformed(String),
    #[error("amount '{0}' is finer than one wei")]
    TooPrecise(String),
    #[error("amount '{0}' overflows")]
    Overflow(String),
}

fn denomination(name: &str) -> Option<(Amount, u32)> {
    match name.to_ascii_lowercase().as_str() {
        "" | "wei" => Some((WEI, 0)),
        "gwei" => Some((GWEI, 9)),
        "finney" => Some((FINNEY, 15)),
        "eth" | "ether" => Some((ETHER, 18)),
        _ => None,
    }
}

/// Parses `"1.1finney"`, `"2 ether"` or a bare wei count such as `"17"`.
pub fn parse_amount(raw: &str) -> Result<Amount, UnitsError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(UnitsError::Empty);
    }
    let split = raw
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(raw.len());
    let (number, unit) = raw.split_at(split);
    let (scale, decimals) = denomination(unit.trim())
        .ok_or_else(|| UnitsError::UnknownDenomination(unit.trim().to_string()))?;

    let (whole, fraction) = match number.split_once('.') {
        Some((w, f)) => (w, f),
        None => (number, ""),
    };
    if whole.is_empty() && fraction.is_empty() {
        return Err(UnitsError::Malformed(raw.to_string()));
    }
    if fraction.contains('.') {
        return Err(UnitsError::Malformed(raw.to_string()));
    }
    let fraction = fraction.trim_end_matches('0');
    if fraction.len() as u32 > decimals {
        return Err(UnitsError::TooPrecise(raw.to_string()));
    }

    let whole_value: Amount = if whole.is_empty() {
        0
    } else {
        whole
            .parse()
            .map_err(|_| UnitsError::Overflow(raw.to_string()))?
    };
    let fraction_value: Amount = if fraction.is_empty() {
        0
    } else {
        let digits: Amount = fraction
            .parse()
            .map_err(|_| UnitsError::Malformed(raw.to_string()))?;
        digits * 10u128.pow(decimals - fraction.len() as u32)
    };

    whole_value
        .checked_mul(scale)
        .and_then(|v| v.checked_add(fraction_value))
        .ok_or_else(|| UnitsError::Overflow(raw.to_string()))
}

/// Renders an amount as decimal ether, trimming trailing zeros.
pub fn format_ether(amount: Amount) -> String {
    let whole = amount / ETHER;
    let fraction = amount % ETHER;
    if fraction == 0 {
        return format!("{whole} ether");
    }
    let digits = format!("{fraction:018}");
    format!("{whole}.{} ether", digits.trim_end_matches('0'))
}
