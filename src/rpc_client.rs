// JSON-RPC client for on-chain token account balances
//
// Used by the Raydium AMM decoder, which cannot read reserves from pool
// state directly. Requests are batched (one POST for all vaults of a pool)
// and retried with exponential backoff; after the bounded attempts run out
// the caller sees an error and treats the update as yielding no price.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::time::Duration;
use tokio_retry::strategy::ExponentialBackoff;
use tokio_retry::Retry;
use tracing::warn;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const RETRY_BASE_MS: u64 = 250;
const RETRY_ATTEMPTS: usize = 4;

#[derive(Debug, Deserialize)]
struct BalanceResponse {
    id: usize,
    result: Option<BalanceResult>,
}

#[derive(Debug, Deserialize)]
struct BalanceResult {
    value: BalanceValue,
}

#[derive(Debug, Deserialize)]
struct BalanceValue {
    amount: String,
    decimals: u32,
}

pub struct RpcClient {
    client: reqwest::Client,
    url: String,
}

impl RpcClient {
    pub fn new(url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
        }
    }

    /// Whole-token balances for a batch of token accounts, in input order.
    ///
    /// Accounts the node cannot answer for come back as 0, which the AMM
    /// decoder already treats as absence.
    pub async fn token_balances(&self, accounts: &[String]) -> Result<Vec<u64>> {
        let strategy = ExponentialBackoff::from_millis(RETRY_BASE_MS)
            .max_delay(Duration::from_secs(2))
            .take(RETRY_ATTEMPTS);

        Retry::spawn(strategy, || self.fetch_balances(accounts)).await
    }

    async fn fetch_balances(&self, accounts: &[String]) -> Result<Vec<u64>> {
        let batch: Vec<serde_json::Value> = accounts
            .iter()
            .enumerate()
            .map(|(id, account)| {
                serde_json::json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "method": "getTokenAccountBalance",
                    "params": [account],
                })
            })
            .collect();

        let responses: Vec<BalanceResponse> = self
            .client
            .post(&self.url)
            .timeout(REQUEST_TIMEOUT)
            .json(&batch)
            .send()
            .await
            .context("balance request failed")?
            .json()
            .await
            .context("balance response was not valid JSON")?;

        let mut holdings = vec![0u64; accounts.len()];
        for response in responses {
            let Some(result) = response.result else {
                warn!("No balance result for request id {}", response.id);
                continue;
            };
            let Some(slot) = holdings.get_mut(response.id) else {
                continue;
            };
            let amount: u64 = result.value.amount.parse().unwrap_or(0);
            *slot = amount / 10u64.pow(result.value.decimals);
        }

        Ok(holdings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_balance_response_shape() {
        let raw = r#"[
            {"jsonrpc":"2.0","id":1,"result":{"context":{"slot":1},"value":{"amount":"2500000000","decimals":9,"uiAmount":2.5,"uiAmountString":"2.5"}}},
            {"jsonrpc":"2.0","id":0,"result":{"context":{"slot":1},"value":{"amount":"420000000","decimals":6,"uiAmount":420.0,"uiAmountString":"420"}}}
        ]"#;
        let responses: Vec<BalanceResponse> = serde_json::from_str(raw).unwrap();

        // Responses arrive in arbitrary order; ids map them back.
        let mut holdings = vec![0u64; 2];
        for response in responses {
            let result = response.result.unwrap();
            let amount: u64 = result.value.amount.parse().unwrap();
            holdings[response.id] = amount / 10u64.pow(result.value.decimals);
        }
        assert_eq!(holdings, vec![420, 2]);
    }

    #[test]
    fn test_error_entry_leaves_zero() {
        let raw = r#"[{"jsonrpc":"2.0","id":0,"error":{"code":-32602,"message":"Invalid param"}}]"#;
        let responses: Vec<BalanceResponse> = serde_json::from_str(raw).unwrap();
        assert!(responses[0].result.is_none());
    }
}
