// Raydium price decoders: CLMM (concentrated liquidity) and AMM v4
//
// The CLMM decoder reads sqrt_price straight from pool state, along with the
// two mint decimals the state itself carries. The AMM decoder only gets vault
// addresses from the state and has to fetch the actual reserve balances over
// RPC, making it the single decoder in the set that performs I/O.

use tracing::warn;

use crate::parser::{AccountParser, FieldSpec};
use crate::programs::ProgramDescriptor;
use crate::rpc_client::RpcClient;

const Q64: f64 = 18_446_744_073_709_551_616.0; // 2^64

/// Spot price from a Raydium CLMM pool.
///
/// Unlike Orca, the decimal adjustment uses the mint decimals stored in the
/// pool state, not the descriptor's.
pub fn price_from_clmm(data: &[u8], _program: &ProgramDescriptor) -> Option<f64> {
    let Some(state) = AccountParser::new(data).read(&[
        (FieldSpec::Skip(8 + 1 + 7 * 32), "header"),
        (FieldSpec::U8, "mint0_decimals"),
        (FieldSpec::U8, "mint1_decimals"),
        (FieldSpec::Skip(2), "tick_spacing"),
        (FieldSpec::Skip(16), "liquidity"),
        (FieldSpec::U128, "sqrt_price_x64"),
    ]) else {
        warn!("Failed to parse Raydium CLMM state ({} bytes)", data.len());
        return None;
    };

    let mint0_decimals = state.get("mint0_decimals")?.as_u8()? as i32;
    let mint1_decimals = state.get("mint1_decimals")?.as_u8()? as i32;
    let sqrt_price = state.get("sqrt_price_x64")?.as_u128()?;

    let sqrt = sqrt_price as f64 / Q64;
    let price = sqrt * sqrt * 10f64.powi(mint0_decimals - mint1_decimals);

    Some(price)
}

/// Spot price from a Raydium AMM v4 pool: quote reserve over base reserve.
///
/// Decodes the vault addresses from pool state, then fetches both token
/// balances in one batched RPC. The balance fetch retries with backoff and
/// gives up rather than stalling the ingestion loop; a zero reserve on
/// either side is absence, not a division error.
pub async fn price_from_amm(
    data: &[u8],
    _program: &ProgramDescriptor,
    rpc: &RpcClient,
) -> Option<f64> {
    let Some(state) = AccountParser::new(data).read(&[
        (FieldSpec::Skip(8 * 32), "status_block"),
        (FieldSpec::Skip(16 * 2 + 8), "pnl_block"),
        (FieldSpec::Skip(16 * 2 + 8), "swap_block"),
        (FieldSpec::Pubkey, "base_vault"),
        (FieldSpec::Pubkey, "quote_vault"),
        (FieldSpec::Pubkey, "base_mint"),
        (FieldSpec::Pubkey, "quote_mint"),
    ]) else {
        warn!("Failed to parse Raydium AMM state ({} bytes)", data.len());
        return None;
    };

    let base_vault = state.get("base_vault")?.as_pubkey()?.to_string();
    let quote_vault = state.get("quote_vault")?.as_pubkey()?.to_string();

    let balances = match rpc.token_balances(&[base_vault, quote_vault]).await {
        Ok(balances) => balances,
        Err(e) => {
            warn!("Failed to fetch AMM vault balances: {e:#}");
            return None;
        }
    };

    if balances[0] == 0 || balances[1] == 0 {
        return None;
    }

    Some(balances[1] as f64 / balances[0] as f64)
}
