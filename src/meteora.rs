// Meteora DLMM price decoder (discrete bin model)
//
// A DLMM pool quotes prices in discrete bins; the active bin id and the bin
// step fully determine the spot price: 1.0001^(bin_step * active_id).

use tracing::warn;

use crate::parser::{AccountParser, FieldSpec};
use crate::programs::ProgramDescriptor;

/// Spot price from a Meteora DLMM lb_pair account.
pub fn price_from_dlmm(data: &[u8], program: &ProgramDescriptor) -> Option<f64> {
    let Some(state) = AccountParser::new(data).read(&[
        (FieldSpec::Skip(8 + 32 + 32 + 1 + 2 + 1), "header"),
        (FieldSpec::I32, "active_id"),
        (FieldSpec::U16, "bin_step"),
    ]) else {
        warn!("Failed to parse DLMM state ({} bytes)", data.len());
        return None;
    };

    let active_id = state.get("active_id")?.as_i32()?;
    let bin_step = state.get("bin_step")?.as_u16()?;

    let base_price = 1.0001f64.powf(bin_step as f64 * active_id as f64);
    let price = base_price * 10f64.powi(program.decimals_a - program.decimals_b);

    Some(price)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orca::tests::test_program;
    use crate::programs::PoolHandler;

    fn dlmm_account(active_id: i32, bin_step: u16) -> Vec<u8> {
        let mut data = vec![0u8; 8 + 32 + 32 + 1 + 2 + 1];
        data.extend_from_slice(&active_id.to_le_bytes());
        data.extend_from_slice(&bin_step.to_le_bytes());
        data
    }

    #[test]
    fn test_active_bin_zero_is_unity() {
        let program = test_program("A", "B", 6, 6, PoolHandler::MeteoraDlmm);
        let price = price_from_dlmm(&dlmm_account(0, 10), &program).unwrap();
        assert!((price - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_negative_active_bin() {
        let program = test_program("HNT", "WSOL", 8, 9, PoolHandler::MeteoraDlmm);
        let price = price_from_dlmm(&dlmm_account(-3000, 20), &program).unwrap();

        let expected = 1.0001f64.powf(20.0 * -3000.0) * 10f64.powi(8 - 9);
        assert!((price - expected).abs() < 1e-15, "got {price}, want {expected}");
        assert!(price > 0.0);
    }

    #[test]
    fn test_truncated_is_absent() {
        let program = test_program("A", "B", 6, 6, PoolHandler::MeteoraDlmm);
        assert!(price_from_dlmm(&[0u8; 40], &program).is_none());
    }
}
