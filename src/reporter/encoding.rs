//! Report value encoding

use ethers::abi::{encode, Token};
use ethers::types::U256;
use thiserror::Error;

use crate::types::Exponent;

/// Decimals of every reported value
pub const REPORT_DECIMALS: i32 = 18;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodingError {
    #[error("price {price} with exponent {exponent} does not fit in uint256")]
    Overflow { price: u64, exponent: Exponent },
}

/// ABI-encode a fixed-point price as a uint256 with 18 decimals, returned as
/// lowercase hex without `0x`. Digits beyond 18 decimals are truncated.
pub fn encode_price(price: u64, exponent: Exponent) -> Result<String, EncodingError> {
    let overflow = || EncodingError::Overflow { price, exponent };
    let shift = REPORT_DECIMALS + exponent;
    let scale = U256::from(10u64)
        .checked_pow(U256::from(shift.unsigned_abs()))
        .ok_or_else(overflow)?;

    let value = if shift >= 0 {
        U256::from(price).checked_mul(scale).ok_or_else(overflow)?
    } else {
        U256::from(price) / scale
    };

    Ok(hex::encode(encode(&[Token::Uint(value)])))
}

/// Human-readable price, `price * 10^exponent`
pub fn price_to_f64(price: u64, exponent: Exponent) -> f64 {
    price as f64 * 10f64.powi(exponent)
}
