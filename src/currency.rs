//! Supported account currencies
//!
//! Checked by callers before an account is created or a transfer submitted.
//! The store itself accepts any code.

pub const USD: &str = "USD";
pub const EUR: &str = "EUR";
pub const CAD: &str = "CAD";

pub const SUPPORTED_CURRENCIES: [&str; 3] = [USD, EUR, CAD];

/// Returns true if the currency code is supported
pub fn is_supported_currency(currency: &str) -> bool {
    SUPPORTED_CURRENCIES.contains(&currency)
}
