// Lifinity price decoder (oracle-fed AMM)
//
// Lifinity pools track an oracle-updated last_price in their config block; a
// zero there means the oracle has not priced the pool yet.

use tracing::warn;

use crate::parser::{AccountParser, FieldSpec};
use crate::programs::ProgramDescriptor;

/// Last oracle price from a Lifinity pool account.
pub fn price_from_pool(data: &[u8], program: &ProgramDescriptor) -> Option<f64> {
    let Some(state) = AccountParser::new(data).read(&[
        (FieldSpec::Skip(8), "discriminator"),
        (FieldSpec::Skip(511), "config_head"),
        (FieldSpec::U64, "last_price"),
    ]) else {
        warn!("Failed to parse Lifinity pool state ({} bytes)", data.len());
        return None;
    };

    let last_price = state.get("last_price")?.as_u64()?;
    if last_price == 0 {
        warn!("Lifinity pool reported a zero price");
        return None;
    }

    Some(last_price as f64 / 10f64.powi(program.decimals_a))
}
