use std::sync::Arc;

use log::*;
use serde_json::{json, Value};
use stellar_xdr::curr::{
    HostFunction, Limits, OperationBody, Preconditions, ReadXdr,
    TransactionEnvelope, TransactionExt,
};

use lumen_channel_pool::{ChannelLease, ChannelPool, ChannelPoolConfig};
use lumen_kv::KvStore;
use lumen_rpc_client::{ChainRpc, SorobanRpcClient};

use crate::{
    config::Config,
    error::{ErrorCode, GatewayError, GatewayResult},
    fees::FeeCalculator,
    management::handle_management,
    requests::{
        BuildRequest, GatewayRequest, InboundRequest, ResponseEnvelope,
        TxSummary,
    },
    runtime::{RelayerInfo, RelayerRuntime, STELLAR_NETWORK_TYPE},
    sequence::SequenceCache,
    simulate::{
        append_signature, assemble, envelope_to_base64, is_read_only,
        simulate_host_function, TX_VALIDITY_WINDOW_SECS,
    },
    submit::{submit_and_wait, SubmitOutcome},
    validation::{parse_request, reject_source_account_credentials},
    fees::FeeTracker,
};

/// The request orchestrator. Dependencies are constructed per request from
/// configuration; only the collaborator handles (KV, hosting runtime, and
/// optionally a chain RPC override) live for the gateway's lifetime.
pub struct Gateway {
    kv: Arc<dyn KvStore>,
    runtime: Arc<dyn RelayerRuntime>,
    chain_rpc: Option<Arc<dyn ChainRpc>>,
    config_override: Option<Config>,
}

impl Gateway {
    pub fn new(
        kv: Arc<dyn KvStore>,
        runtime: Arc<dyn RelayerRuntime>,
    ) -> Self {
        Self {
            kv,
            runtime,
            chain_rpc: None,
            config_override: None,
        }
    }

    /// Substitutes the chain RPC client, mainly for tests.
    pub fn with_chain_rpc(mut self, rpc: Arc<dyn ChainRpc>) -> Self {
        self.chain_rpc = Some(rpc);
        self
    }

    /// Uses a fixed configuration instead of re-reading the environment.
    pub fn with_config(mut self, config: Config) -> Self {
        self.config_override = Some(config);
        self
    }

    /// Entry point: never panics, never leaks raw internals; every failure
    /// becomes a `{success: false}` envelope with a stable code.
    pub async fn handle(&self, request: InboundRequest) -> ResponseEnvelope {
        match self.process(&request).await {
            Ok(data) => ResponseEnvelope::ok(data),
            Err(err) => {
                info!(
                    "Request failed with {} ({}): {}",
                    err.code.as_str(),
                    err.status,
                    err.message
                );
                ResponseEnvelope::fail(&err)
            }
        }
    }

    async fn process(
        &self,
        request: &InboundRequest,
    ) -> GatewayResult<Value> {
        let config = match &self.config_override {
            Some(config) => config.clone(),
            None => Config::from_env()?,
        };

        // Management traffic routes before data-plane validation.
        if let Some(management) = request.params.get("management") {
            return handle_management(
                Arc::clone(&self.kv),
                &config,
                management,
            )
            .await;
        }

        let api_key = request.header_value(&config.api_key_header);
        if config.default_fee_limit.is_some() && api_key.is_none() {
            return Err(GatewayError::new(
                ErrorCode::ApiKeyRequired,
                format!(
                    "a fee limit is configured; the '{}' header is required",
                    config.api_key_header
                ),
            ));
        }
        let tracker = api_key.map(|key| {
            FeeTracker::new(
                Arc::clone(&self.kv),
                config.network.as_str(),
                key,
                config.default_fee_limit,
                config.fee_reset_period,
            )
        });

        let parsed = parse_request(&request.params)?;

        let fund = self
            .resolve_stellar_relayer(&config.fund_relayer_id)
            .await?;
        let chain_rpc = self.chain_rpc(&config);
        let calculator = FeeCalculator::from_config(&config);

        match parsed {
            GatewayRequest::Submit { envelope_xdr } => {
                self.run_submit_only(
                    &config,
                    chain_rpc,
                    &fund,
                    &calculator,
                    tracker.as_ref(),
                    &envelope_xdr,
                )
                .await
            }
            GatewayRequest::Build(build) => {
                self.run_build(
                    &config,
                    chain_rpc,
                    &fund,
                    &calculator,
                    tracker.as_ref(),
                    &build,
                )
                .await
            }
        }
    }

    fn chain_rpc(&self, config: &Config) -> Arc<dyn ChainRpc> {
        match &self.chain_rpc {
            Some(rpc) => Arc::clone(rpc),
            None => Arc::new(SorobanRpcClient::new(&config.rpc_url)),
        }
    }

    async fn resolve_stellar_relayer(
        &self,
        relayer_id: &str,
    ) -> GatewayResult<RelayerInfo> {
        let info = self
            .runtime
            .get_relayer(relayer_id)
            .await
            .map_err(|err| {
                GatewayError::new(
                    ErrorCode::RelayerUnavailable,
                    format!("cannot resolve relayer '{}': {}", relayer_id, err),
                )
            })?
            .ok_or_else(|| {
                GatewayError::new(
                    ErrorCode::RelayerUnavailable,
                    format!("relayer '{}' is not provisioned", relayer_id),
                )
            })?;
        if info.network_type != STELLAR_NETWORK_TYPE {
            return Err(GatewayError::new(
                ErrorCode::RelayerUnavailable,
                format!(
                    "relayer '{}' is on network type '{}', expected '{}'",
                    relayer_id, info.network_type, STELLAR_NETWORK_TYPE
                ),
            ));
        }
        Ok(info)
    }

    // -----------------
    // Submit-only pipeline
    // -----------------

    async fn run_submit_only(
        &self,
        config: &Config,
        chain_rpc: Arc<dyn ChainRpc>,
        fund: &RelayerInfo,
        calculator: &FeeCalculator,
        tracker: Option<&FeeTracker>,
        envelope_xdr: &str,
    ) -> GatewayResult<Value> {
        let envelope = TransactionEnvelope::from_xdr_base64(
            envelope_xdr,
            Limits::none(),
        )
        .map_err(|err| {
            GatewayError::new(
                ErrorCode::InvalidXdr,
                format!("cannot decode transaction envelope: {}", err),
            )
        })?;

        let env = match &envelope {
            TransactionEnvelope::Tx(env) => env,
            _ => {
                return Err(GatewayError::new(
                    ErrorCode::InvalidEnvelopeType,
                    "only regular (non-fee-bump, v1) envelopes are accepted",
                ));
            }
        };

        // An unsigned single invoke funnels into the build pipeline: the
        // gateway channels and co-signs it instead of submitting as-is.
        if env.signatures.is_empty() {
            let build = extract_unsigned_invoke(&envelope)?;
            return self
                .run_build(
                    config, chain_rpc, fund, calculator, tracker, &build,
                )
                .await;
        }

        validate_signed_envelope(env, config)?;

        let max_fee = calculator.max_fee(&envelope);
        if let Some(tracker) = tracker {
            tracker.check_budget(max_fee).await?;
        }

        let outcome = submit_and_wait(
            self.runtime.as_ref(),
            config.network,
            envelope_xdr,
            max_fee,
            tracker,
        )
        .await?;
        Ok(summary_value(&outcome))
    }

    // -----------------
    // Build-and-submit pipeline
    // -----------------

    async fn run_build(
        &self,
        config: &Config,
        chain_rpc: Arc<dyn ChainRpc>,
        fund: &RelayerInfo,
        calculator: &FeeCalculator,
        tracker: Option<&FeeTracker>,
        build: &BuildRequest,
    ) -> GatewayResult<Value> {
        let sim = simulate_host_function(
            chain_rpc.as_ref(),
            &fund.address,
            &build.func,
            &build.auth,
        )
        .await?;

        // Read-only calls are answered from the simulation alone; no
        // channel, no submission.
        if is_read_only(&sim) {
            let summary = TxSummary {
                status: "readonly".to_string(),
                return_value: sim
                    .response
                    .results
                    .first()
                    .and_then(|result| result.xdr.clone()),
                latest_ledger: sim.response.latest_ledger,
                ..Default::default()
            };
            return Ok(serde_json::to_value(summary).unwrap_or_default());
        }

        let contract_id = contract_id_of(&build.func);
        let pool = self.pool_for(config);
        let lease = pool.acquire(contract_id.as_deref()).await?;

        let sequences = SequenceCache::new(
            Arc::clone(&self.kv),
            Arc::clone(&chain_rpc),
            config.network.as_str(),
            config.sequence_max_age,
        );

        // From here on the lease must be settled on every path.
        let prepared = self
            .prepare_inner(config, calculator, tracker, build, &lease, &sim, &sequences)
            .await;
        let (envelope_xdr, max_fee, channel_address, sequence) =
            match prepared {
                Ok(prepared) => prepared,
                Err(err) => {
                    pool.release(&lease).await;
                    return Err(err);
                }
            };

        let submitted = submit_and_wait(
            self.runtime.as_ref(),
            config.network,
            &envelope_xdr,
            max_fee,
            tracker,
        )
        .await;

        match submitted {
            Ok(outcome) if outcome.status == "confirmed" => {
                sequences
                    .commit_sequence(&channel_address, sequence)
                    .await;
                pool.release(&lease).await;
                Ok(summary_value(&outcome))
            }
            Ok(outcome) => {
                // Not terminal: hold the channel until the open
                // transaction settles or the lock TTL expires.
                sequences.clear_sequence(&channel_address).await;
                pool.extend(&lease).await;
                Ok(summary_value(&outcome))
            }
            Err(err) if err.code == ErrorCode::WaitTimeout => {
                sequences.clear_sequence(&channel_address).await;
                pool.extend(&lease).await;
                if build.return_tx_hash {
                    Ok(deferred_summary("pending", &err))
                } else {
                    Err(err)
                }
            }
            Err(err) if err.code == ErrorCode::OnchainFailed => {
                sequences.clear_sequence(&channel_address).await;
                pool.release(&lease).await;
                if build.return_tx_hash {
                    Ok(deferred_summary("failed", &err))
                } else {
                    Err(err)
                }
            }
            Err(err) => {
                sequences.clear_sequence(&channel_address).await;
                pool.release(&lease).await;
                Err(err)
            }
        }
    }

    /// Resolves the channel, its sequence, assembles, co-signs and gates
    /// the budget. Returns the signed envelope, the max fee, the channel
    /// address and the sequence it consumes.
    #[allow(clippy::too_many_arguments)]
    async fn prepare_inner(
        &self,
        config: &Config,
        calculator: &FeeCalculator,
        tracker: Option<&FeeTracker>,
        build: &BuildRequest,
        lease: &ChannelLease,
        sim: &crate::simulate::Simulation,
        sequences: &SequenceCache,
    ) -> GatewayResult<(String, i64, String, i64)> {
        let channel =
            self.resolve_stellar_relayer(&lease.relayer_id).await?;
        let sequence = sequences.get_sequence(&channel.address).await?;

        let envelope = assemble(
            &channel.address,
            sequence,
            &build.func,
            &build.auth,
            sim,
        )?;

        let unsigned_xdr = envelope_to_base64(&envelope)?;
        let signature = self
            .runtime
            .sign_transaction(&lease.relayer_id, &unsigned_xdr)
            .await
            .map_err(|err| {
                GatewayError::new(
                    ErrorCode::RelayerUnavailable,
                    format!("channel signing failed: {}", err),
                )
            })?;
        let envelope = append_signature(envelope, &signature)?;

        let max_fee = calculator.max_fee(&envelope);
        if let Some(tracker) = tracker {
            tracker.check_budget(max_fee).await?;
        }

        Ok((
            envelope_to_base64(&envelope)?,
            max_fee,
            channel.address,
            sequence,
        ))
    }

    fn pool_for(&self, config: &Config) -> ChannelPool {
        ChannelPool::new(
            Arc::clone(&self.kv),
            config.network.as_str(),
            ChannelPoolConfig {
                lock_ttl: config.lock_ttl,
                capacity_ratio: config.capacity_ratio,
                limited_contracts: config.limited_contracts.clone(),
            },
        )
    }
}

// -----------------
// Submit-only validation
// -----------------

fn validate_signed_envelope(
    env: &stellar_xdr::curr::TransactionV1Envelope,
    config: &Config,
) -> GatewayResult<()> {
    let Preconditions::Time(bounds) = &env.tx.cond else {
        return Err(GatewayError::new(
            ErrorCode::InvalidTimeBounds,
            "transaction must carry time bounds",
        ));
    };
    let max_time = bounds.max_time.0;
    if max_time == 0 {
        return Err(GatewayError::new(
            ErrorCode::InvalidTimeBounds,
            "transaction must set an upper time bound",
        ));
    }
    let now = now_secs();
    if max_time < now {
        return Err(GatewayError::new(
            ErrorCode::InvalidTimeBounds,
            "transaction time bounds have expired",
        ));
    }
    if max_time > now + TX_VALIDITY_WINDOW_SECS {
        return Err(GatewayError::new(
            ErrorCode::TimeboundsTooFar,
            format!(
                "upper time bound exceeds now + {}s",
                TX_VALIDITY_WINDOW_SECS
            ),
        ));
    }

    // A Soroban transaction whose declared fee exceeds its resource fee
    // plus the smallest inclusion tier is paying someone it should not.
    if let TransactionExt::V1(soroban_data) = &env.tx.ext {
        let ceiling = soroban_data
            .resource_fee
            .saturating_add(config.inclusion_fee_limited);
        if env.tx.fee as i64 > ceiling {
            return Err(GatewayError::with_details(
                ErrorCode::FeeMismatch,
                format!(
                    "envelope fee {} exceeds resource fee + {} stroops",
                    env.tx.fee, config.inclusion_fee_limited
                ),
                json!({
                    "fee": env.tx.fee,
                    "resourceFee": soroban_data.resource_fee,
                }),
            ));
        }
    }
    Ok(())
}

/// Decomposes an unsigned single-invoke envelope into a build request.
fn extract_unsigned_invoke(
    envelope: &TransactionEnvelope,
) -> GatewayResult<BuildRequest> {
    let TransactionEnvelope::Tx(env) = envelope else {
        return Err(invalid_unsigned("unexpected envelope type"));
    };
    let operations = env.tx.operations.as_slice();
    if operations.len() != 1 {
        return Err(invalid_unsigned(
            "unsigned envelopes must contain exactly one operation",
        ));
    }
    let OperationBody::InvokeHostFunction(invoke) = &operations[0].body
    else {
        return Err(invalid_unsigned(
            "unsigned envelopes must contain an invoke-host-function \
             operation",
        ));
    };
    let auth = invoke.auth.to_vec();
    // The funneled entries face the same constraint as the JSON
    // `{func, auth}` shape: the channel is the transaction source.
    reject_source_account_credentials(&auth)?;
    Ok(BuildRequest {
        func: invoke.host_function.clone(),
        auth,
        return_tx_hash: false,
    })
}

fn invalid_unsigned(message: &str) -> GatewayError {
    GatewayError::new(ErrorCode::InvalidUnsignedXdr, message)
}

fn contract_id_of(func: &HostFunction) -> Option<String> {
    match func {
        HostFunction::InvokeContract(args) => {
            match &args.contract_address {
                stellar_xdr::curr::ScAddress::Contract(contract_id) => {
                    Some(
                        stellar_strkey::Contract(contract_id.0 .0)
                            .to_string(),
                    )
                }
                _ => None,
            }
        }
        _ => None,
    }
}

fn summary_value(outcome: &SubmitOutcome) -> Value {
    let summary = TxSummary {
        transaction_id: Some(outcome.transaction_id.clone()),
        hash: Some(outcome.hash.clone()),
        status: outcome.status.clone(),
        ..Default::default()
    };
    serde_json::to_value(summary).unwrap_or_default()
}

/// The `returnTxHash` rendering of a timeout or on-chain failure.
fn deferred_summary(status: &str, err: &GatewayError) -> Value {
    let details = err.details.clone().unwrap_or_default();
    let summary = TxSummary {
        transaction_id: details
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string),
        hash: details
            .get("hash")
            .and_then(Value::as_str)
            .map(str::to_string),
        status: status.to_string(),
        error: Some(err.message.clone()),
        ..Default::default()
    };
    serde_json::to_value(summary).unwrap_or_default()
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
