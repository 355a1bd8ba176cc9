//! JSON-RPC client for the router contract.
//!
//! Reads go through `eth_call`; mutations are sent with
//! `eth_sendTransaction` from the keeper's unlocked node account and then
//! followed to a receipt.

use super::abi::{self, AbiArg, Word};
use super::error::{ChainError, ChainResult};
use super::traits::ChainClient;
use super::types::*;
use crate::config::Config;
use crate::utils::decimal::{from_fixed_point, price_from_wei};
use anyhow::Context;
use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Words returned by `getOrder(uint256)`.
const ORDER_WORDS: usize = 12;
/// Words returned by `getPosition(uint256)`.
const POSITION_WORDS: usize = 10;
/// Headroom added to the node's gas estimate, in percent.
const GAS_HEADROOM_PCT: u64 = 20;

const SIG_NEXT_ORDER_ID: &str = "getNextOrderId()";
const SIG_NEXT_POSITION_ID: &str = "getNextPositionId()";
const SIG_GET_ORDER: &str = "getOrder(uint256)";
const SIG_GET_POSITION: &str = "getPosition(uint256)";
const SIG_GET_PRICE: &str = "getPrice(address)";
const SIG_GET_BALANCE: &str = "getBalance(address,address)";
const SIG_GET_AVAILABLE_BALANCE: &str = "getAvailableBalance(address,address)";
const SIG_EXECUTE_ORDER: &str = "selfExecuteOrder(uint256)";
const SIG_LIQUIDATE_POSITION: &str = "liquidatePosition(uint256)";

/// Router client speaking JSON-RPC over HTTP.
pub struct RpcChainClient {
    http: Client,
    rpc_url: String,
    router: String,
    keeper_address: String,
    gas_limit_cap: u64,
    call_timeout: Duration,
    receipt_timeout: Duration,
    receipt_poll_interval: Duration,
    request_id: AtomicU64,
}

impl RpcChainClient {
    /// Create a client from configuration.
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let call_timeout = config.retry.call_timeout();
        let http = Client::builder()
            .timeout(call_timeout)
            .build()
            .context("Failed to create HTTP client")?;

        let router = abi::parse_address(&config.chain.router_address)
            .context("Invalid router address")?;
        let keeper = abi::parse_address(&config.chain.keeper_address)
            .context("Invalid keeper address")?;

        Ok(Self {
            http,
            rpc_url: config.chain.rpc_url.clone(),
            router: format!("0x{}", hex::encode(router)),
            keeper_address: format!("0x{}", hex::encode(keeper)),
            gas_limit_cap: config.gas.gas_limit,
            call_timeout,
            receipt_timeout: config.retry.receipt_timeout(),
            receipt_poll_interval: config.retry.receipt_poll_interval(),
            request_id: AtomicU64::new(1),
        })
    }

    /// Send one JSON-RPC request and return its `result`.
    async fn request(&self, method: &str, params: Value) -> ChainResult<Value> {
        let id = self.request_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": id,
        });

        let response = self
            .http
            .post(&self.rpc_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        if response.status().as_u16() == 429 {
            return Err(ChainError::RateLimited(format!("{} returned HTTP 429", method)));
        }

        let resp: Value = response.json().await.map_err(|e| self.transport_error(e))?;

        if let Some(error) = resp.get("error") {
            let code = error.get("code").and_then(Value::as_i64).unwrap_or(0);
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error");
            return Err(ChainError::from_rpc(code, message));
        }

        resp.get("result")
            .cloned()
            .ok_or_else(|| ChainError::Decode(format!("{} response has no result", method)))
    }

    fn transport_error(&self, err: reqwest::Error) -> ChainError {
        if err.is_timeout() {
            ChainError::Timeout(self.call_timeout)
        } else {
            err.into()
        }
    }

    async fn call(&self, data: Vec<u8>) -> ChainResult<Vec<u8>> {
        let result = self
            .request(
                "eth_call",
                json!([{ "to": self.router, "data": to_hex(&data) }, "latest"]),
            )
            .await?;
        let raw = result
            .as_str()
            .ok_or_else(|| ChainError::Decode("eth_call result is not a string".to_string()))?;
        abi::decode_hex(raw)
    }

    async fn call_words(&self, signature: &str, args: &[AbiArg]) -> ChainResult<Vec<Word>> {
        let data = self.call(abi::encode_call(signature, args)).await?;
        abi::words(&data)
    }

    async fn call_uint(&self, signature: &str, args: &[AbiArg]) -> ChainResult<u128> {
        let words = self.call_words(signature, args).await?;
        let first = words
            .first()
            .ok_or_else(|| ChainError::Decode(format!("{} returned no data", signature)))?;
        abi::word_to_u128(first)
    }

    async fn next_order_id(&self) -> ChainResult<u64> {
        let next = self.call_uint(SIG_NEXT_ORDER_ID, &[]).await?;
        u64::try_from(next).map_err(|_| ChainError::Decode("order id exceeds u64".to_string()))
    }

    async fn next_position_id(&self) -> ChainResult<u64> {
        let next = self.call_uint(SIG_NEXT_POSITION_ID, &[]).await?;
        u64::try_from(next).map_err(|_| ChainError::Decode("position id exceeds u64".to_string()))
    }

    /// Raw router price for a token, `None` if the oracle has no price.
    async fn raw_price(&self, token: &str) -> ChainResult<Option<u128>> {
        let token = abi::parse_address(token)?;
        match self.call_uint(SIG_GET_PRICE, &[AbiArg::Address(token)]).await {
            Ok(0) => Ok(None),
            Ok(raw) => Ok(Some(raw)),
            Err(ChainError::Reverted(reason)) => {
                debug!(%reason, "Price lookup reverted");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn fetch_order(&self, id: u64) -> ChainResult<Order> {
        let words = self
            .call_words(SIG_GET_ORDER, &[AbiArg::Uint(id as u128)])
            .await?;
        decode_order(id, &words)
    }

    async fn fetch_position(&self, id: u64) -> ChainResult<Position> {
        let words = self
            .call_words(SIG_GET_POSITION, &[AbiArg::Uint(id as u128)])
            .await?;
        decode_position(id, &words)
    }

    /// Native balance of `address` in wei.
    async fn native_balance(&self, address: &str) -> ChainResult<u128> {
        parse_quantity(
            &self
                .request("eth_getBalance", json!([address, "latest"]))
                .await?,
        )
    }

    /// `signature(owner, token)` for a router balance getter.
    async fn router_balance(&self, signature: &str, owner: &str, token: &str) -> ChainResult<u128> {
        let owner = abi::parse_address(owner)?;
        let token = abi::parse_address(token)?;
        self.call_uint(signature, &[AbiArg::Address(owner), AbiArg::Address(token)])
            .await
    }

    fn tx_request(&self, action: &KeeperAction) -> Value {
        json!({
            "from": self.keeper_address,
            "to": self.router,
            "data": to_hex(&calldata(action)),
        })
    }

    /// Poll for a receipt until it appears or the receipt timeout passes.
    async fn wait_for_receipt(&self, tx_hash: &str) -> ChainResult<Receipt> {
        let deadline = Instant::now() + self.receipt_timeout;

        loop {
            let result = self
                .request("eth_getTransactionReceipt", json!([tx_hash]))
                .await;

            match result {
                Ok(receipt) if !receipt.is_null() => return parse_receipt(tx_hash, &receipt),
                Ok(_) => {}
                // A flaky poll is not a failed transaction; keep waiting.
                Err(e) if e.is_transient() => debug!(tx_hash, error = %e, "Receipt poll failed"),
                Err(e) => return Err(e),
            }

            if Instant::now() + self.receipt_poll_interval > deadline {
                return Err(ChainError::ReceiptTimeout {
                    tx_hash: tx_hash.to_string(),
                    timeout: self.receipt_timeout,
                });
            }
            tokio::time::sleep(self.receipt_poll_interval).await;
        }
    }
}

#[async_trait]
impl ChainClient for RpcChainClient {
    #[instrument(skip(self))]
    async fn chain_id(&self) -> ChainResult<u64> {
        let result = self.request("eth_chainId", json!([])).await?;
        parse_quantity(&result).and_then(|id| {
            u64::try_from(id).map_err(|_| ChainError::Decode("chain id exceeds u64".to_string()))
        })
    }

    fn keeper_address(&self) -> &str {
        &self.keeper_address
    }

    #[instrument(skip(self))]
    async fn open_orders(&self, after_id: u64, limit: usize) -> ChainResult<Vec<Order>> {
        let next = self.next_order_id().await?;
        let mut orders = Vec::new();

        for id in (after_id + 1).max(1)..next {
            if orders.len() >= limit {
                break;
            }
            match skip_unreadable("order", id, self.fetch_order(id).await) {
                Some(order) if order.is_open() => orders.push(order),
                _ => {}
            }
        }

        Ok(orders)
    }

    async fn order(&self, id: u64) -> ChainResult<Option<Order>> {
        if id == 0 || id >= self.next_order_id().await? {
            return Ok(None);
        }
        self.fetch_order(id).await.map(Some)
    }

    #[instrument(skip(self))]
    async fn all_orders(&self) -> ChainResult<Vec<Order>> {
        let next = self.next_order_id().await?;
        let mut orders = Vec::new();
        for id in 1..next {
            if let Some(order) = skip_unreadable("order", id, self.fetch_order(id).await) {
                orders.push(order);
            }
        }
        Ok(orders)
    }

    async fn order_count(&self) -> ChainResult<u64> {
        Ok(self.next_order_id().await?.saturating_sub(1))
    }

    #[instrument(skip(self))]
    async fn open_positions(&self) -> ChainResult<Vec<Position>> {
        let next = self.next_position_id().await?;
        let mut positions = Vec::new();
        for id in 1..next {
            match skip_unreadable("position", id, self.fetch_position(id).await) {
                Some(position) if position.is_open() => positions.push(position),
                _ => {}
            }
        }
        Ok(positions)
    }

    async fn position(&self, id: u64) -> ChainResult<Option<Position>> {
        if id == 0 || id >= self.next_position_id().await? {
            return Ok(None);
        }
        self.fetch_position(id).await.map(Some)
    }

    #[instrument(skip(self))]
    async fn all_positions(&self) -> ChainResult<Vec<Position>> {
        let next = self.next_position_id().await?;
        let mut positions = Vec::new();
        for id in 1..next {
            if let Some(position) = skip_unreadable("position", id, self.fetch_position(id).await) {
                positions.push(position);
            }
        }
        Ok(positions)
    }

    async fn position_count(&self) -> ChainResult<u64> {
        Ok(self.next_position_id().await?.saturating_sub(1))
    }

    async fn mark_price(&self, pair: &TokenPair) -> ChainResult<Option<Decimal>> {
        Ok(self.raw_price(&pair.base).await?.and_then(price_from_wei))
    }

    async fn oracle_health(&self, token: &str) -> ChainResult<OracleHealth> {
        let price = self.raw_price(token).await?.and_then(price_from_wei);
        Ok(OracleHealth {
            token: token.to_string(),
            valid: price.map(|p| p > Decimal::ZERO).unwrap_or(false),
            price,
            staleness_secs: None,
        })
    }

    async fn gas_price(&self) -> ChainResult<u128> {
        let result = self.request("eth_gasPrice", json!([])).await?;
        parse_quantity(&result)
    }

    #[instrument(skip(self, action), fields(action = %action))]
    async fn estimate_gas(&self, action: &KeeperAction) -> ChainResult<GasEstimate> {
        let gas_price = self.gas_price().await?;
        let result = self
            .request("eth_estimateGas", json!([self.tx_request(action)]))
            .await?;
        let estimated = u64::try_from(parse_quantity(&result)?)
            .map_err(|_| ChainError::Decode("gas estimate exceeds u64".to_string()))?;

        let with_headroom = estimated.saturating_mul(100 + GAS_HEADROOM_PCT) / 100;
        Ok(GasEstimate {
            gas_limit: with_headroom.min(self.gas_limit_cap),
            gas_price,
        })
    }

    #[instrument(skip(self, action, gas), fields(action = %action))]
    async fn submit(&self, action: &KeeperAction, gas: &GasEstimate) -> ChainResult<Receipt> {
        let mut tx = self.tx_request(action);
        tx["gas"] = json!(format!("0x{:x}", gas.gas_limit));
        tx["gasPrice"] = json!(format!("0x{:x}", gas.gas_price));

        let result = self.request("eth_sendTransaction", json!([tx])).await?;
        let tx_hash = result
            .as_str()
            .ok_or_else(|| ChainError::Decode("transaction hash is not a string".to_string()))?
            .to_string();

        info!(%tx_hash, gas_limit = gas.gas_limit, gas_price = %gas.gas_price, "Transaction sent");

        self.wait_for_receipt(&tx_hash).await
    }

    async fn balances(
        &self,
        address: &str,
        tokens: &[TokenInfo],
    ) -> ChainResult<BTreeMap<String, Decimal>> {
        let mut balances = BTreeMap::new();

        let native = self.native_balance(address).await?;
        insert_amount(&mut balances, "ETH", native, 18);

        for token in tokens.iter().filter(|t| t.address != NATIVE_TOKEN) {
            let raw = self
                .router_balance(SIG_GET_BALANCE, address, &token.address)
                .await?;
            insert_amount(&mut balances, &token.symbol, raw, token.decimals);
        }

        Ok(balances)
    }

    async fn pool_balances(&self, tokens: &[TokenInfo]) -> ChainResult<BTreeMap<String, Decimal>> {
        let mut balances = BTreeMap::new();

        for token in tokens {
            let raw = if token.address == NATIVE_TOKEN {
                self.native_balance(&self.router).await?
            } else {
                self.router_balance(SIG_GET_BALANCE, &self.router, &token.address)
                    .await?
            };
            insert_amount(&mut balances, &token.symbol, raw, token.decimals);
        }

        Ok(balances)
    }

    async fn available_balances(
        &self,
        address: &str,
        tokens: &[TokenInfo],
    ) -> ChainResult<BTreeMap<String, Decimal>> {
        let mut balances = BTreeMap::new();

        for token in tokens {
            let raw = match self
                .router_balance(SIG_GET_AVAILABLE_BALANCE, address, &token.address)
                .await
            {
                Ok(raw) => raw,
                // Routers without a lock accounting expose only getBalance.
                Err(ChainError::Reverted(reason)) => {
                    debug!(
                        symbol = %token.symbol,
                        %reason,
                        "getAvailableBalance reverted, using getBalance"
                    );
                    self.router_balance(SIG_GET_BALANCE, address, &token.address)
                        .await?
                }
                Err(e) => return Err(e),
            };
            insert_amount(&mut balances, &token.symbol, raw, token.decimals);
        }

        Ok(balances)
    }

    async fn contracts_reachable(&self) -> ChainResult<bool> {
        let code = self
            .request("eth_getCode", json!([self.router, "latest"]))
            .await?;
        let code = abi::decode_hex(code.as_str().unwrap_or("0x"))?;
        if code.is_empty() {
            warn!(router = %self.router, "No contract code at router address");
            return Ok(false);
        }

        self.next_order_id().await?;
        Ok(true)
    }
}

fn insert_amount(balances: &mut BTreeMap<String, Decimal>, symbol: &str, raw: u128, decimals: u32) {
    match from_fixed_point(raw, decimals) {
        Some(amount) => {
            balances.insert(symbol.to_string(), amount);
        }
        None => warn!(%symbol, raw = %raw, "Balance out of decimal range"),
    }
}

/// Per-id reads inside a scan: one unreadable entry is logged and dropped
/// so the rest of the scan still completes.
fn skip_unreadable<T>(entity: &'static str, id: u64, result: ChainResult<T>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(entity, id, error = %e, "⚠️ Skipping unreadable entry");
            None
        }
    }
}

fn to_hex(data: &[u8]) -> String {
    format!("0x{}", hex::encode(data))
}

fn calldata(action: &KeeperAction) -> Vec<u8> {
    match action {
        KeeperAction::ExecuteOrder(id) => {
            abi::encode_call(SIG_EXECUTE_ORDER, &[AbiArg::Uint(*id as u128)])
        }
        KeeperAction::LiquidatePosition(id) => {
            abi::encode_call(SIG_LIQUIDATE_POSITION, &[AbiArg::Uint(*id as u128)])
        }
    }
}

/// Parse a hex quantity (`"0x1a"`).
fn parse_quantity(value: &Value) -> ChainResult<u128> {
    let raw = value
        .as_str()
        .ok_or_else(|| ChainError::Decode(format!("expected hex quantity, got {}", value)))?;
    let stripped = raw.strip_prefix("0x").unwrap_or(raw);
    if stripped.is_empty() {
        return Ok(0);
    }
    u128::from_str_radix(stripped, 16)
        .map_err(|e| ChainError::Decode(format!("failed to parse hex '{}': {}", raw, e)))
}

fn parse_receipt(tx_hash: &str, receipt: &Value) -> ChainResult<Receipt> {
    let status = match receipt.get("status").and_then(Value::as_str) {
        Some("0x1") => ReceiptStatus::Success,
        Some(_) => ReceiptStatus::Reverted,
        None => return Err(ChainError::Decode("receipt has no status".to_string())),
    };
    let quantity = |field: &str| {
        receipt
            .get(field)
            .and_then(|v| parse_quantity(v).ok())
            .and_then(|v| u64::try_from(v).ok())
    };

    Ok(Receipt {
        tx_hash: tx_hash.to_string(),
        status,
        block_number: quantity("blockNumber"),
        gas_used: quantity("gasUsed"),
    })
}

/// Decode `getOrder` return data.
///
/// The router zeroes deleted orders, so an issued id that decodes with a
/// zero `id` word is reported as cancelled.
fn decode_order(id: u64, words: &[Word]) -> ChainResult<Order> {
    if words.len() < ORDER_WORDS {
        return Err(ChainError::Decode(format!(
            "getOrder({}) returned {} words, expected {}",
            id,
            words.len(),
            ORDER_WORDS
        )));
    }

    let kind = OrderKind::from_code(abi::word_to_u64(&words[7])?);
    let side = TradeSide::from_is_long(abi::word_to_bool(&words[8]));
    let stored_id = abi::word_to_u64(&words[0])?;
    let status = if stored_id == 0 {
        OrderStatus::Cancelled
    } else if abi::word_to_bool(&words[9]) {
        OrderStatus::Executed
    } else {
        OrderStatus::Open
    };
    let trigger_raw = abi::word_to_u128(&words[5])?;

    Ok(Order {
        id,
        owner: abi::word_to_address(&words[1]),
        kind,
        side,
        token_in: abi::word_to_address(&words[2]),
        token_out: abi::word_to_address(&words[3]),
        amount_in: abi::word_to_u128(&words[4])?,
        trigger_price: price_from_wei(trigger_raw)
            .ok_or_else(|| ChainError::Decode(format!("order {} trigger out of range", id)))?,
        min_amount_out: abi::word_to_u128(&words[6])?,
        comparator: Comparator::for_order(kind, side),
        created_at: abi::word_to_u64(&words[10])?,
        self_executable: abi::word_to_bool(&words[11]),
        status,
    })
}

/// Decode `getPosition` return data.
fn decode_position(id: u64, words: &[Word]) -> ChainResult<Position> {
    if words.len() < POSITION_WORDS {
        return Err(ChainError::Decode(format!(
            "getPosition({}) returned {} words, expected {}",
            id,
            words.len(),
            POSITION_WORDS
        )));
    }

    let entry_raw = abi::word_to_u128(&words[6])?;
    let leverage = u32::try_from(abi::word_to_u64(&words[4])?)
        .map_err(|_| ChainError::Decode(format!("position {} leverage out of range", id)))?;

    Ok(Position {
        id,
        owner: abi::word_to_address(&words[1]),
        token: abi::word_to_address(&words[2]),
        collateral: abi::word_to_u128(&words[3])?,
        leverage: leverage.max(1),
        side: TradeSide::from_code(abi::word_to_u64(&words[5])?),
        entry_price: price_from_wei(entry_raw)
            .ok_or_else(|| ChainError::Decode(format!("position {} entry out of range", id)))?,
        size: abi::word_to_u128(&words[7])?,
        created_at: abi::word_to_u64(&words[8])?,
        status: if abi::word_to_bool(&words[9]) {
            PositionStatus::Open
        } else {
            PositionStatus::Liquidated
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use wiremock::matchers::{body_partial_json, body_string_contains, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const KEEPER: &str = "0x70997970c51812dc3a010c7d01b50e0d17dc79c8";
    const ROUTER: &str = "0x5fbdb2315678afecb367f032d93f642f64180aa3";
    const WEI: u128 = 1_000_000_000_000_000_000;

    fn uint_word(value: u128) -> Word {
        let mut word = [0u8; 32];
        word[16..].copy_from_slice(&value.to_be_bytes());
        word
    }

    fn address_word(byte: u8) -> Word {
        let mut word = [0u8; 32];
        word[12..].copy_from_slice(&[byte; 20]);
        word
    }

    async fn client_for(server: &MockServer) -> RpcChainClient {
        let mut config = Config::default();
        config.chain.rpc_url = server.uri();
        config.chain.keeper_address = KEEPER.to_string();
        config.chain.router_address = ROUTER.to_string();
        config.retry.receipt_poll_interval_ms = 10;
        config.retry.receipt_timeout_secs = 1;
        RpcChainClient::new(&config).unwrap()
    }

    async fn mount_result(server: &MockServer, rpc_method: &str, result: Value) {
        Mock::given(method("POST"))
            .and(body_partial_json(json!({ "method": rpc_method })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0",
                "id": 1,
                "result": result,
            })))
            .mount(server)
            .await;
    }

    fn words_hex(words: &[Word]) -> String {
        format!("0x{}", hex::encode(words.concat()))
    }

    fn open_order_words(id: u128) -> Vec<Word> {
        vec![
            uint_word(id),
            address_word(0xaa),
            address_word(0x00),
            address_word(0xbb),
            uint_word(2 * WEI),
            uint_word(100 * WEI),
            uint_word(150),
            uint_word(0),
            uint_word(1),
            uint_word(0),
            uint_word(1_700_000_000),
            uint_word(1),
        ]
    }

    /// Answer `eth_call` with `result` when the calldata matches `signature(args)`.
    async fn mount_call(server: &MockServer, signature: &str, args: &[AbiArg], result: String) {
        Mock::given(method("POST"))
            .and(body_partial_json(json!({ "method": "eth_call" })))
            .and(body_string_contains(to_hex(&abi::encode_call(signature, args))))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0",
                "id": 1,
                "result": result,
            })))
            .mount(server)
            .await;
    }

    async fn router_with_bad_first_order() -> MockServer {
        let server = MockServer::start().await;
        mount_call(&server, SIG_NEXT_ORDER_ID, &[], words_hex(&[uint_word(3)])).await;
        // Truncated return data for order 1.
        mount_call(
            &server,
            SIG_GET_ORDER,
            &[AbiArg::Uint(1)],
            words_hex(&[uint_word(1)]),
        )
        .await;
        mount_call(
            &server,
            SIG_GET_ORDER,
            &[AbiArg::Uint(2)],
            words_hex(&open_order_words(2)),
        )
        .await;
        server
    }

    #[test]
    fn test_decode_open_limit_order() {
        let words = vec![
            uint_word(1),
            address_word(0xaa),
            address_word(0x00),
            address_word(0xbb),
            uint_word(2 * WEI),
            uint_word(100 * WEI),
            uint_word(150),
            uint_word(0),
            uint_word(1),
            uint_word(0),
            uint_word(1_700_000_000),
            uint_word(1),
        ];

        let order = decode_order(1, &words).unwrap();
        assert_eq!(order.kind, OrderKind::Limit);
        assert_eq!(order.side, TradeSide::Long);
        assert_eq!(order.comparator, Comparator::AtOrBelow);
        assert_eq!(order.trigger_price, dec!(100));
        assert_eq!(order.amount_in, 2 * WEI);
        assert_eq!(order.status, OrderStatus::Open);
        assert_eq!(order.owner, format!("0x{}", "aa".repeat(20)));
        assert!(order.self_executable);
    }

    #[test]
    fn test_decode_zeroed_order_is_cancelled() {
        let words = vec![[0u8; 32]; ORDER_WORDS];
        let order = decode_order(4, &words).unwrap();
        assert_eq!(order.id, 4);
        assert_eq!(order.status, OrderStatus::Cancelled);
    }

    #[test]
    fn test_decode_short_position() {
        let words = vec![
            uint_word(2),
            address_word(0xaa),
            address_word(0xcc),
            uint_word(WEI),
            uint_word(2),
            uint_word(1),
            uint_word(100 * WEI),
            uint_word(2 * WEI),
            uint_word(1_700_000_000),
            uint_word(1),
        ];

        let position = decode_position(2, &words).unwrap();
        assert_eq!(position.side, TradeSide::Short);
        assert_eq!(position.leverage, 2);
        assert_eq!(position.entry_price, dec!(100));
        assert!(position.is_open());
        assert!(decode_position(2, &words[..5]).is_err());
    }

    #[test]
    fn test_calldata_selectors() {
        let data = calldata(&KeeperAction::ExecuteOrder(9));
        assert_eq!(&data[..4], &abi::selector(SIG_EXECUTE_ORDER));
        assert_eq!(data[35], 9);

        let data = calldata(&KeeperAction::LiquidatePosition(3));
        assert_eq!(&data[..4], &abi::selector(SIG_LIQUIDATE_POSITION));
    }

    #[tokio::test]
    async fn test_chain_id() {
        let server = MockServer::start().await;
        mount_result(&server, "eth_chainId", json!("0x7a69")).await;

        let client = client_for(&server).await;
        assert_eq!(client.chain_id().await.unwrap(), 31337);
    }

    #[tokio::test]
    async fn test_estimate_gas_revert_is_permanent() {
        let server = MockServer::start().await;
        mount_result(&server, "eth_gasPrice", json!("0x3b9aca00")).await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({ "method": "eth_estimateGas" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0",
                "id": 1,
                "error": { "code": 3, "message": "execution reverted: Order not executable" },
            })))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let err = client
            .estimate_gas(&KeeperAction::ExecuteOrder(1))
            .await
            .unwrap_err();

        assert!(matches!(err, ChainError::Reverted(_)));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_estimate_gas_applies_headroom_and_cap() {
        let server = MockServer::start().await;
        mount_result(&server, "eth_gasPrice", json!("0x3b9aca00")).await;
        mount_result(&server, "eth_estimateGas", json!("0x186a0")).await; // 100_000

        let client = client_for(&server).await;
        let gas = client
            .estimate_gas(&KeeperAction::ExecuteOrder(1))
            .await
            .unwrap();

        assert_eq!(gas.gas_price, 1_000_000_000);
        assert_eq!(gas.gas_limit, 120_000);
    }

    #[tokio::test]
    async fn test_submit_waits_for_successful_receipt() {
        let server = MockServer::start().await;
        let tx_hash = format!("0x{}", "ab".repeat(32));
        mount_result(&server, "eth_sendTransaction", json!(tx_hash)).await;
        mount_result(
            &server,
            "eth_getTransactionReceipt",
            json!({
                "transactionHash": tx_hash,
                "status": "0x1",
                "blockNumber": "0x10",
                "gasUsed": "0x5208",
            }),
        )
        .await;

        let client = client_for(&server).await;
        let gas = GasEstimate {
            gas_limit: 200_000,
            gas_price: 1,
        };
        let receipt = client
            .submit(&KeeperAction::LiquidatePosition(1), &gas)
            .await
            .unwrap();

        assert!(receipt.is_success());
        assert_eq!(receipt.tx_hash, tx_hash);
        assert_eq!(receipt.block_number, Some(16));
        assert_eq!(receipt.gas_used, Some(21_000));
    }

    #[tokio::test]
    async fn test_submit_times_out_without_receipt() {
        let server = MockServer::start().await;
        mount_result(&server, "eth_sendTransaction", json!("0x01")).await;
        mount_result(&server, "eth_getTransactionReceipt", Value::Null).await;

        let client = client_for(&server).await;
        let gas = GasEstimate {
            gas_limit: 200_000,
            gas_price: 1,
        };
        let err = client
            .submit(&KeeperAction::ExecuteOrder(1), &gas)
            .await
            .unwrap_err();

        assert!(matches!(err, ChainError::ReceiptTimeout { .. }));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_http_429_is_rate_limit() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let err = client.gas_price().await.unwrap_err();
        assert!(matches!(err, ChainError::RateLimited(_)));
    }

    #[tokio::test]
    async fn test_undecodable_order_does_not_block_scan() {
        let server = router_with_bad_first_order().await;
        let client = client_for(&server).await;

        let open = client.open_orders(0, 10).await.unwrap();
        assert_eq!(open.iter().map(|o| o.id).collect::<Vec<_>>(), vec![2]);

        let all = client.all_orders().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, 2);
        assert_eq!(all[0].trigger_price, dec!(100));

        // Direct lookups still surface the decode error.
        assert!(matches!(client.order(1).await, Err(ChainError::Decode(_))));
    }

    #[tokio::test]
    async fn test_trigger_beyond_decimal_range_is_skipped() {
        let server = MockServer::start().await;
        mount_call(&server, SIG_NEXT_ORDER_ID, &[], words_hex(&[uint_word(3)])).await;
        let mut oversized = open_order_words(1);
        oversized[5] = uint_word(1u128 << 100);
        mount_call(&server, SIG_GET_ORDER, &[AbiArg::Uint(1)], words_hex(&oversized)).await;
        mount_call(
            &server,
            SIG_GET_ORDER,
            &[AbiArg::Uint(2)],
            words_hex(&open_order_words(2)),
        )
        .await;
        let client = client_for(&server).await;

        let open = client.open_orders(0, 1).await.unwrap();

        assert_eq!(open.len(), 1);
        assert_eq!(open[0].id, 2);
    }

    #[tokio::test]
    async fn test_pool_and_available_balances() {
        let server = MockServer::start().await;
        let router = abi::parse_address(ROUTER).unwrap();
        let keeper = abi::parse_address(KEEPER).unwrap();
        let usdc_address = "0x00000000000000000000000000000000000000cc";
        let usdc = abi::parse_address(usdc_address).unwrap();
        let native = abi::parse_address(NATIVE_TOKEN).unwrap();
        let tokens = vec![
            TokenInfo {
                symbol: "ETH".to_string(),
                address: NATIVE_TOKEN.to_string(),
                decimals: 18,
            },
            TokenInfo {
                symbol: "USDC".to_string(),
                address: usdc_address.to_string(),
                decimals: 6,
            },
        ];

        // 3 ETH held by the router contract itself.
        mount_result(&server, "eth_getBalance", json!("0x29a2241af62c0000")).await;
        mount_call(
            &server,
            SIG_GET_BALANCE,
            &[AbiArg::Address(router), AbiArg::Address(usdc)],
            words_hex(&[uint_word(5_000_000_000)]),
        )
        .await;
        mount_call(
            &server,
            SIG_GET_AVAILABLE_BALANCE,
            &[AbiArg::Address(keeper), AbiArg::Address(native)],
            words_hex(&[uint_word(WEI / 2)]),
        )
        .await;
        // No lock accounting for USDC: falls back to getBalance.
        Mock::given(method("POST"))
            .and(body_string_contains(to_hex(&abi::encode_call(
                SIG_GET_AVAILABLE_BALANCE,
                &[AbiArg::Address(keeper), AbiArg::Address(usdc)],
            ))))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0",
                "id": 1,
                "error": { "code": 3, "message": "execution reverted" },
            })))
            .mount(&server)
            .await;
        mount_call(
            &server,
            SIG_GET_BALANCE,
            &[AbiArg::Address(keeper), AbiArg::Address(usdc)],
            words_hex(&[uint_word(1_250_000)]),
        )
        .await;
        let client = client_for(&server).await;

        let pool = client.pool_balances(&tokens).await.unwrap();
        assert_eq!(pool.get("ETH"), Some(&dec!(3)));
        assert_eq!(pool.get("USDC"), Some(&dec!(5000)));

        let available = client.available_balances(KEEPER, &tokens).await.unwrap();
        assert_eq!(available.get("ETH"), Some(&dec!(0.5)));
        assert_eq!(available.get("USDC"), Some(&dec!(1.25)));
    }
}
