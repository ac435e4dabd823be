use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;

/// Service configuration, loaded from the environment (.env supported).
#[derive(Debug, Clone)]
pub struct Config {
    pub solana_rpc_ws: String,
    pub solana_rpc_url: String,
    pub host: String,
    pub port: u16,
    pub programs_file: PathBuf,
    pub tick_db_path: PathBuf,
    pub historical_db_path: PathBuf,
}

impl Config {
    /// Validate URL format (basic security check)
    ///
    /// Accepts http(s) and ws(s) schemes and blocks injection via newline,
    /// carriage return, or null characters.
    fn validate_url(url: &str, name: &str) -> Result<()> {
        if !url.starts_with("http://")
            && !url.starts_with("https://")
            && !url.starts_with("ws://")
            && !url.starts_with("wss://")
        {
            return Err(anyhow::anyhow!(
                "Invalid {}: must start with http://, https://, ws://, or wss:// (got: {})",
                name,
                url
            ));
        }

        if url.contains('\n') || url.contains('\r') || url.contains('\0') {
            return Err(anyhow::anyhow!(
                "Invalid {}: contains suspicious characters",
                name
            ));
        }

        Ok(())
    }

    /// Load configuration from environment variables
    ///
    /// # Environment Variables
    /// - `SOLANA_RPC_WS`: chain websocket endpoint for account subscriptions
    /// - `SOLANA_RPC_URL`: chain HTTP endpoint for balance queries
    /// - `HOST` / `PORT`: listen address for the HTTP/WS façade
    /// - `PROGRAMS_FILE`: pool registry path (default: programs.json)
    /// - `TICK_DB_PATH` / `HISTORICAL_DB_PATH`: store locations
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let solana_rpc_ws = env::var("SOLANA_RPC_WS")
            .unwrap_or_else(|_| "wss://api.mainnet-beta.solana.com".to_string());
        Self::validate_url(&solana_rpc_ws, "SOLANA_RPC_WS")?;

        let solana_rpc_url = env::var("SOLANA_RPC_URL")
            .unwrap_or_else(|_| "https://api.mainnet-beta.solana.com".to_string());
        Self::validate_url(&solana_rpc_url, "SOLANA_RPC_URL")?;

        Ok(Self {
            solana_rpc_ws,
            solana_rpc_url,

            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),

            port: env::var("PORT")
                .unwrap_or_else(|_| "8000".to_string())
                .parse()
                .context("Failed to parse PORT: must be a valid port number")?,

            programs_file: env::var("PROGRAMS_FILE")
                .unwrap_or_else(|_| "programs.json".to_string())
                .into(),

            tick_db_path: env::var("TICK_DB_PATH")
                .unwrap_or_else(|_| "prices.db".to_string())
                .into(),

            historical_db_path: env::var("HISTORICAL_DB_PATH")
                .unwrap_or_else(|_| "prices_historical.db".to_string())
                .into(),
        })
    }
}
