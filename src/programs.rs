// Program registry: the tracked pool descriptors loaded from programs.json
//
// The registry file names decoders symbolically ("orca.price_from_whirlpool");
// resolution goes through a static name table, so an unknown handler is a
// configuration error that skips that descriptor only. The registry is also
// the sole source of legal table names: loading it derives the full set of
// tick/candle/metadata tables the external interface may reference.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::SystemTime;
use tracing::{info, warn};

use crate::rpc_client::RpcClient;
use crate::{lifinity, meteora, orca, pumpfun, raydium};

/// Pool decoder selector: the static name table the registry's symbolic
/// handler names resolve into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolHandler {
    OrcaWhirlpool,
    RaydiumClmm,
    RaydiumAmm,
    MeteoraDlmm,
    LifinityPool,
    PumpfunCurve,
}

impl PoolHandler {
    pub fn resolve(name: &str) -> Option<Self> {
        match name {
            "orca.price_from_whirlpool" => Some(PoolHandler::OrcaWhirlpool),
            "raydium.price_from_clmm" => Some(PoolHandler::RaydiumClmm),
            "raydium.price_from_amm" => Some(PoolHandler::RaydiumAmm),
            "meteora.price_from_dlmm" => Some(PoolHandler::MeteoraDlmm),
            "lifinity.price_from_pool" => Some(PoolHandler::LifinityPool),
            "pumpfun.price_from_curve" => Some(PoolHandler::PumpfunCurve),
            _ => None,
        }
    }
}

/// One tracked pool. Created at registry load, mutated only by hot reload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgramDescriptor {
    pub asset_id: i64,
    #[serde(rename = "programId")]
    pub program_id: String,
    /// Symbolic handler name as written in the registry file.
    pub handler: String,
    /// Resolved decoder. Descriptors that fail resolution are dropped at load.
    #[serde(skip)]
    pub decoder: Option<PoolHandler>,
    #[serde(rename = "symbolA")]
    pub symbol_a: String,
    #[serde(rename = "symbolB")]
    pub symbol_b: String,
    #[serde(rename = "decimalsA")]
    pub decimals_a: i32,
    #[serde(rename = "decimalsB")]
    pub decimals_b: i32,
    /// Canonical "A-B" pairs this pool contributes to.
    pub pairs: Vec<String>,
    /// Opaque sentinel carried for the registry contract; per-client diff
    /// state treats it as "never seen".
    #[serde(default)]
    pub nonce: serde_json::Value,
}

impl ProgramDescriptor {
    /// Run this descriptor's decoder over raw account bytes.
    ///
    /// `None` means "this update yielded no price" and is never an error.
    pub async fn decode(&self, data: &[u8], rpc: &RpcClient) -> Option<f64> {
        match self.decoder? {
            PoolHandler::OrcaWhirlpool => orca::price_from_whirlpool(data, self),
            PoolHandler::RaydiumClmm => raydium::price_from_clmm(data, self),
            PoolHandler::RaydiumAmm => raydium::price_from_amm(data, self, rpc).await,
            PoolHandler::MeteoraDlmm => meteora::price_from_dlmm(data, self),
            PoolHandler::LifinityPool => lifinity::price_from_pool(data, self),
            PoolHandler::PumpfunCurve => pumpfun::price_from_curve(data, self),
        }
    }
}

/// "A-B" → "A_B", the form used in table names and composite asset ids.
pub fn flat_pair(pair: &str) -> String {
    pair.replace('-', "_")
}

/// Loaded descriptor list plus the derived set of legal table names.
#[derive(Debug)]
pub struct ProgramRegistry {
    pub programs: Vec<ProgramDescriptor>,
    pub valid_tables: HashSet<String>,
    path: PathBuf,
    loaded_mtime: Option<SystemTime>,
}

impl ProgramRegistry {
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let mut registry = Self {
            programs: Vec::new(),
            valid_tables: HashSet::new(),
            path: path.into(),
            loaded_mtime: None,
        };
        registry.reload()?;
        Ok(registry)
    }

    /// Reload iff the registry file's modification time has changed since the
    /// last load. Returns whether a reload happened.
    pub fn reload_if_changed(&mut self) -> Result<bool> {
        let mtime = std::fs::metadata(&self.path)
            .and_then(|meta| meta.modified())
            .with_context(|| format!("failed to stat registry file {}", self.path.display()))?;
        if Some(mtime) == self.loaded_mtime {
            return Ok(false);
        }
        self.reload()?;
        Ok(true)
    }

    fn reload(&mut self) -> Result<()> {
        let raw = std::fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read registry file {}", self.path.display()))?;
        let mtime = std::fs::metadata(&self.path).and_then(|meta| meta.modified()).ok();

        let mut programs: Vec<ProgramDescriptor> =
            serde_json::from_str(&raw).context("registry file is not a valid descriptor array")?;

        let mut valid_tables = HashSet::new();
        programs.retain_mut(|program| {
            program.decoder = PoolHandler::resolve(&program.handler);
            if program.decoder.is_none() {
                warn!(
                    "⚠️ Unresolvable handler '{}' for asset {}, skipping descriptor",
                    program.handler, program.asset_id
                );
                return false;
            }
            for pair in &program.pairs {
                let flat = flat_pair(pair);
                valid_tables.insert(format!("prices_{}_{}", program.asset_id, flat));
                valid_tables.insert(format!("historical_prices_{}_{}", program.asset_id, flat));
                valid_tables.insert(format!("metadata_{}_{}", program.asset_id, flat));
            }
            true
        });

        info!(
            "📋 Loaded {} pool descriptors ({} valid tables)",
            programs.len(),
            valid_tables.len()
        );

        self.programs = programs;
        self.valid_tables = valid_tables;
        self.loaded_mtime = mtime;
        Ok(())
    }
}
