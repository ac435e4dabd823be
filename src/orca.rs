// Orca Whirlpool price decoder (concentrated liquidity)
//
// Whirlpool state layout (from the Whirlpools program):
// - bytes 0-8: discriminator
// - bytes 8-40: whirlpools_config (pubkey)
// - byte 40: whirlpool_bump
// - bytes 41-43: tick_spacing (u16)
// - bytes 43-45: tick_spacing_seed
// - bytes 45-47: fee_rate
// - bytes 47-49: protocol_fee_rate
// - bytes 49-65: liquidity (u128)
// - bytes 65-81: sqrt_price (u128, Q64.64)

use tracing::warn;

use crate::parser::{AccountParser, FieldSpec};
use crate::programs::ProgramDescriptor;

const Q64: f64 = 18_446_744_073_709_551_616.0; // 2^64

/// Spot price from a Whirlpool account.
///
/// sqrt_price is a Q64.64 fixed-point square root of the raw price, so the
/// price in units of token B per token A is (sqrt_price / 2^64)^2 scaled by
/// the pair's decimal difference from the descriptor.
pub fn price_from_whirlpool(data: &[u8], program: &ProgramDescriptor) -> Option<f64> {
    let Some(state) = AccountParser::new(data).read(&[
        (FieldSpec::Skip(8), "discriminator"),
        (FieldSpec::Skip(32), "whirlpools_config"),
        (FieldSpec::Skip(1), "whirlpool_bump"),
        (FieldSpec::Skip(2), "tick_spacing"),
        (FieldSpec::Skip(2), "tick_spacing_seed"),
        (FieldSpec::Skip(2), "fee_rate"),
        (FieldSpec::Skip(2), "protocol_fee_rate"),
        (FieldSpec::Skip(16), "liquidity"),
        (FieldSpec::U128, "sqrt_price"),
    ]) else {
        warn!("Failed to parse Whirlpool state ({} bytes)", data.len());
        return None;
    };

    let sqrt_price = state.get("sqrt_price")?.as_u128()?;
    let sqrt = sqrt_price as f64 / Q64;
    let price = sqrt * sqrt * 10f64.powi(program.decimals_a - program.decimals_b);

    Some(price)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::programs::PoolHandler;

    pub(crate) fn test_program(
        symbol_a: &str,
        symbol_b: &str,
        decimals_a: i32,
        decimals_b: i32,
        handler: PoolHandler,
    ) -> ProgramDescriptor {
        ProgramDescriptor {
            asset_id: 1,
            program_id: "HJPjoWUrhoZzkNfRpHuieeFk9WcZWjwy6PBjZ81ngndJ".to_string(),
            handler: String::new(),
            decoder: Some(handler),
            symbol_a: symbol_a.to_string(),
            symbol_b: symbol_b.to_string(),
            decimals_a,
            decimals_b,
            pairs: vec![format!("{symbol_a}-{symbol_b}")],
            nonce: serde_json::Value::from(-1),
        }
    }

    pub(crate) fn whirlpool_account(sqrt_price: u128) -> Vec<u8> {
        let mut data = vec![0u8; 65];
        data.extend_from_slice(&sqrt_price.to_le_bytes());
        data
    }

    #[test]
    fn test_wsol_usdc_price() {
        // sqrt_price = 2^64 * sqrt(0.0001); decimals 9/6 give price 0.1.
        let sqrt_price = (1u128 << 64) / 100;
        let program = test_program("WSOL", "USDC", 9, 6, PoolHandler::OrcaWhirlpool);

        let price = price_from_whirlpool(&whirlpool_account(sqrt_price), &program).unwrap();
        assert!((price - 0.1).abs() < 1e-9, "got {price}");
    }

    #[test]
    fn test_equal_decimals_unity_price() {
        let sqrt_price = 1u128 << 64; // raw price exactly 1.0
        let program = test_program("A", "B", 6, 6, PoolHandler::OrcaWhirlpool);

        let price = price_from_whirlpool(&whirlpool_account(sqrt_price), &program).unwrap();
        assert!((price - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_truncated_account_is_absent() {
        let program = test_program("WSOL", "USDC", 9, 6, PoolHandler::OrcaWhirlpool);
        assert!(price_from_whirlpool(&[0u8; 70], &program).is_none());
        assert!(price_from_whirlpool(&[], &program).is_none());
    }
}
