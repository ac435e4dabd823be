// Pump.fun bonding curve price decoder
//
// The curve account keeps virtual reserves for both sides; price is the SOL
// reserve over the token reserve with the fixed 9/6 decimal convention the
// program uses for every launch.

use tracing::warn;

use crate::parser::{AccountParser, FieldSpec};
use crate::programs::ProgramDescriptor;

const LAMPORTS_PER_SOL: f64 = 1_000_000_000.0;
const TOKEN_UNITS: f64 = 1_000_000.0;

/// Spot price from a Pump.fun bonding curve account.
pub fn price_from_curve(data: &[u8], _program: &ProgramDescriptor) -> Option<f64> {
    let Some(state) = AccountParser::new(data).read(&[
        (FieldSpec::Skip(8), "discriminator"),
        (FieldSpec::U64, "virtual_token_reserves"),
        (FieldSpec::U64, "virtual_sol_reserves"),
    ]) else {
        warn!("Failed to parse Pump.fun curve state ({} bytes)", data.len());
        return None;
    };

    let virtual_token_reserves = state.get("virtual_token_reserves")?.as_u64()?;
    let virtual_sol_reserves = state.get("virtual_sol_reserves")?.as_u64()?;

    // An emptied curve has no price.
    if virtual_token_reserves == 0 {
        return None;
    }

    let sol = virtual_sol_reserves as f64 / LAMPORTS_PER_SOL;
    let tokens = virtual_token_reserves as f64 / TOKEN_UNITS;

    Some(sol / tokens)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orca::tests::test_program;
    use crate::programs::PoolHandler;

    fn curve_account(virtual_token_reserves: u64, virtual_sol_reserves: u64) -> Vec<u8> {
        let mut data = vec![0u8; 8];
        data.extend_from_slice(&virtual_token_reserves.to_le_bytes());
        data.extend_from_slice(&virtual_sol_reserves.to_le_bytes());
        data
    }

    #[test]
    fn test_curve_price() {
        let program = test_program("PUMP", "WSOL", 6, 9, PoolHandler::PumpfunCurve);
        // 30 SOL against 1,000,000 tokens.
        let data = curve_account(1_000_000_000_000, 30_000_000_000);
        let price = price_from_curve(&data, &program).unwrap();
        assert!((price - 0.00003).abs() < 1e-15, "got {price}");
    }

    #[test]
    fn test_zero_token_reserves_is_absent_not_a_division_error() {
        let program = test_program("PUMP", "WSOL", 6, 9, PoolHandler::PumpfunCurve);
        assert!(price_from_curve(&curve_account(0, 30_000_000_000), &program).is_none());
    }

    #[test]
    fn test_truncated_is_absent() {
        let program = test_program("PUMP", "WSOL", 6, 9, PoolHandler::PumpfunCurve);
        assert!(price_from_curve(&[0u8; 16], &program).is_none());
    }
}
