//! Shared fixtures and collaborator stubs used across the crate's tests.

use std::{
    collections::{HashMap, HashSet},
    sync::Mutex,
    time::Duration,
};

use async_trait::async_trait;
use stellar_xdr::curr::{
    AccountEntry, AccountEntryExt, DecoratedSignature, Hash, HostFunction,
    InvokeContractArgs, InvokeHostFunctionOp, LedgerEntryData,
    LedgerFootprint, LedgerKey, LedgerKeyAccount, Limits, Memo,
    MuxedAccount, Operation, OperationBody, Preconditions, ScAddress,
    ScSymbol, ScVal, SequenceNumber, Signature, SignatureHint,
    SorobanAddressCredentials, SorobanAuthorizationEntry,
    SorobanAuthorizedFunction, SorobanAuthorizedInvocation,
    SorobanCredentials, SorobanResources, SorobanTransactionData,
    SorobanTransactionDataExt, String32, Thresholds, TimeBounds, TimePoint,
    Transaction, TransactionEnvelope, TransactionExt,
    TransactionV1Envelope, Uint256, WriteXdr,
};

use lumen_rpc_client::{
    account_id_from_address, account_ledger_key, ChainRpc,
    GetLedgerEntriesResponse, LedgerEntryResult,
    SimulateHostFunctionResult, SimulateTransactionResponse,
    SorobanRpcClientError, SorobanRpcClientResult,
};

use crate::{
    config::{Config, Network},
    runtime::{
        RelayerInfo, RelayerRuntime, RuntimeError, RuntimeResult,
        SendTransactionRequest, Submission, WaitStatus,
        STELLAR_NETWORK_TYPE,
    },
};

pub const CONTRACT_SEED: u8 = 7;

/// Wires `RUST_LOG` into test output. Safe to call repeatedly.
pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

// -----------------
// Addresses & XDR fixtures
// -----------------

pub fn fund_address() -> String {
    stellar_strkey::ed25519::PublicKey([1; 32]).to_string()
}

pub fn channel_address() -> String {
    stellar_strkey::ed25519::PublicKey([2; 32]).to_string()
}

pub fn contract_address() -> ScAddress {
    ScAddress::Contract(stellar_xdr::curr::ContractId(Hash(
        [CONTRACT_SEED; 32],
    )))
}

pub fn contract_id_str() -> String {
    stellar_strkey::Contract([CONTRACT_SEED; 32]).to_string()
}

pub fn host_function() -> HostFunction {
    HostFunction::InvokeContract(InvokeContractArgs {
        contract_address: contract_address(),
        function_name: ScSymbol("transfer".try_into().unwrap()),
        args: Vec::<ScVal>::new().try_into().unwrap(),
    })
}

pub fn host_function_b64() -> String {
    host_function().to_xdr_base64(Limits::none()).unwrap()
}

pub fn auth_entry() -> SorobanAuthorizationEntry {
    SorobanAuthorizationEntry {
        credentials: SorobanCredentials::Address(
            SorobanAddressCredentials {
                address: ScAddress::Account(
                    account_id_from_address(
                        &stellar_strkey::ed25519::PublicKey([4; 32])
                            .to_string(),
                    )
                    .unwrap(),
                ),
                nonce: 12_345,
                signature_expiration_ledger: 1_000,
                signature: ScVal::Void,
            },
        ),
        root_invocation: SorobanAuthorizedInvocation {
            function: SorobanAuthorizedFunction::ContractFn(
                InvokeContractArgs {
                    contract_address: contract_address(),
                    function_name: ScSymbol("transfer".try_into().unwrap()),
                    args: Vec::<ScVal>::new().try_into().unwrap(),
                },
            ),
            sub_invocations: Vec::new().try_into().unwrap(),
        },
    }
}

pub fn auth_entry_b64() -> String {
    auth_entry().to_xdr_base64(Limits::none()).unwrap()
}

pub fn source_account_auth_entry() -> SorobanAuthorizationEntry {
    let mut entry = auth_entry();
    entry.credentials = SorobanCredentials::SourceAccount;
    entry
}

/// A Soroban footprint with or without read-write entries, resource fee
/// 58 181 stroops.
pub fn soroban_data(empty_read_write: bool) -> SorobanTransactionData {
    let probe_key = LedgerKey::Account(LedgerKeyAccount {
        account_id: account_id_from_address(
            &stellar_strkey::ed25519::PublicKey([5; 32]).to_string(),
        )
        .unwrap(),
    });
    let read_write = if empty_read_write {
        Vec::new()
    } else {
        vec![probe_key.clone()]
    };
    SorobanTransactionData {
        ext: SorobanTransactionDataExt::V0,
        resources: SorobanResources {
            footprint: LedgerFootprint {
                read_only: vec![probe_key].try_into().unwrap(),
                read_write: read_write.try_into().unwrap(),
            },
            instructions: 1_000_000,
            disk_read_bytes: 500,
            write_bytes: if empty_read_write { 0 } else { 300 },
        },
        resource_fee: 58_181,
    }
}

pub fn soroban_data_b64(empty_read_write: bool) -> String {
    soroban_data(empty_read_write)
        .to_xdr_base64(Limits::none())
        .unwrap()
}

pub fn simulate_response_ok(
    transaction_data: Option<String>,
    result_auth: Vec<String>,
) -> SimulateTransactionResponse {
    SimulateTransactionResponse {
        latest_ledger: Some(4_242),
        min_resource_fee: Some("58181".to_string()),
        transaction_data,
        error: None,
        results: vec![SimulateHostFunctionResult {
            xdr: Some("AAAAAQ==".to_string()),
            auth: result_auth,
        }],
        events: Vec::new(),
    }
}

pub fn account_entry_xdr(address: &str, sequence: i64) -> String {
    let entry = AccountEntry {
        account_id: account_id_from_address(address).unwrap(),
        balance: 10_000_000,
        seq_num: SequenceNumber(sequence),
        num_sub_entries: 0,
        inflation_dest: None,
        flags: 0,
        home_domain: String32::default(),
        thresholds: Thresholds([1, 0, 0, 0]),
        signers: Vec::new().try_into().unwrap(),
        ext: AccountEntryExt::V0,
    };
    LedgerEntryData::Account(entry)
        .to_xdr_base64(Limits::none())
        .unwrap()
}

pub fn decorated_signature_b64() -> String {
    DecoratedSignature {
        hint: SignatureHint([0; 4]),
        signature: Signature(vec![7u8; 64].try_into().unwrap()),
    }
    .to_xdr_base64(Limits::none())
    .unwrap()
}

/// A transaction envelope for fee and validation tests.
///
/// - `resource_fee: Some(f)` attaches Soroban data with that fee
/// - `invoke` controls whether the single operation is an
///   invoke-host-function (against the fixture contract) or a classic op
pub fn build_envelope(
    resource_fee: Option<i64>,
    invoke: bool,
) -> TransactionEnvelope {
    envelope_fixture(EnvelopeFixture {
        resource_fee,
        invoke,
        ..Default::default()
    })
}

pub struct EnvelopeFixture {
    pub fee: u32,
    /// `None` leaves the transaction without preconditions.
    pub time_bounds: Option<(u64, u64)>,
    pub resource_fee: Option<i64>,
    pub invoke: bool,
    pub signed: bool,
}

impl Default for EnvelopeFixture {
    fn default() -> Self {
        Self {
            fee: 100,
            time_bounds: Some((0, now_secs() + 60)),
            resource_fee: None,
            invoke: true,
            signed: true,
        }
    }
}

pub fn envelope_fixture(fixture: EnvelopeFixture) -> TransactionEnvelope {
    let body = if fixture.invoke {
        OperationBody::InvokeHostFunction(InvokeHostFunctionOp {
            host_function: host_function(),
            auth: vec![auth_entry()].try_into().unwrap(),
        })
    } else {
        OperationBody::Inflation
    };
    let operation = Operation {
        source_account: None,
        body,
    };

    let source = stellar_strkey::ed25519::PublicKey::from_string(
        &channel_address(),
    )
    .unwrap();

    let tx = Transaction {
        source_account: MuxedAccount::Ed25519(Uint256(source.0)),
        fee: fixture.fee,
        seq_num: SequenceNumber(7),
        cond: match fixture.time_bounds {
            Some((min, max)) => Preconditions::Time(TimeBounds {
                min_time: TimePoint(min),
                max_time: TimePoint(max),
            }),
            None => Preconditions::None,
        },
        memo: Memo::None,
        operations: vec![operation].try_into().unwrap(),
        ext: match fixture.resource_fee {
            Some(fee) => {
                let mut data = soroban_data(false);
                data.resource_fee = fee;
                TransactionExt::V1(data)
            }
            None => TransactionExt::V0,
        },
    };

    let signatures = if fixture.signed {
        vec![DecoratedSignature {
            hint: SignatureHint([1; 4]),
            signature: Signature(vec![9u8; 64].try_into().unwrap()),
        }]
    } else {
        Vec::new()
    };

    TransactionEnvelope::Tx(TransactionV1Envelope {
        tx,
        signatures: signatures.try_into().unwrap(),
    })
}

pub fn envelope_fixture_b64(fixture: EnvelopeFixture) -> String {
    envelope_fixture(fixture)
        .to_xdr_base64(Limits::none())
        .unwrap()
}

pub fn test_config() -> Config {
    Config {
        network: Network::Testnet,
        fund_relayer_id: "fund".to_string(),
        lock_ttl: Duration::from_secs(30),
        default_fee_limit: None,
        fee_reset_period: None,
        api_key_header: "x-api-key".to_string(),
        admin_secret: None,
        limited_contracts: HashSet::new(),
        capacity_ratio: 0.8,
        inclusion_fee_default: 203,
        inclusion_fee_limited: 201,
        rpc_url: "http://localhost:8000".to_string(),
        sequence_max_age: Duration::from_secs(120),
    }
}

// -----------------
// StubChainRpc
// -----------------

enum ScriptedSimulation {
    Ok(SimulateTransactionResponse),
    Transport(String),
    Rpc(i64, String),
}

/// Canned [ChainRpc] for tests.
#[derive(Default)]
pub struct StubChainRpc {
    simulation: Mutex<Option<ScriptedSimulation>>,
    ledger_entries: Mutex<HashMap<String, String>>,
    simulate_calls: Mutex<Vec<String>>,
}

impl StubChainRpc {
    pub fn set_simulation(&self, response: SimulateTransactionResponse) {
        *self.simulation.lock().unwrap() =
            Some(ScriptedSimulation::Ok(response));
    }

    /// Scripts a successful RPC round-trip whose simulation failed.
    pub fn set_simulation_error(&self, error: &str) {
        let mut response = simulate_response_ok(None, Vec::new());
        response.results = Vec::new();
        response.error = Some(error.to_string());
        self.set_simulation(response);
    }

    pub fn fail_simulation_transport(&self, message: &str) {
        *self.simulation.lock().unwrap() =
            Some(ScriptedSimulation::Transport(message.to_string()));
    }

    pub fn fail_simulation_rpc(&self, code: i64, message: &str) {
        *self.simulation.lock().unwrap() =
            Some(ScriptedSimulation::Rpc(code, message.to_string()));
    }

    /// Serves `address` with an account entry at `sequence`.
    pub fn put_account_entry(&self, address: &str, sequence: i64) {
        let key = account_ledger_key(address).unwrap();
        self.ledger_entries
            .lock()
            .unwrap()
            .insert(key, account_entry_xdr(address, sequence));
    }

    pub fn put_raw_ledger_entry(&self, address: &str, xdr: &str) {
        let key = account_ledger_key(address).unwrap();
        self.ledger_entries
            .lock()
            .unwrap()
            .insert(key, xdr.to_string());
    }

    pub fn simulate_count(&self) -> usize {
        self.simulate_calls.lock().unwrap().len()
    }
}

#[async_trait]
impl ChainRpc for StubChainRpc {
    async fn simulate_transaction(
        &self,
        transaction_xdr: &str,
        _auth_mode: lumen_rpc_client::AuthMode,
    ) -> SorobanRpcClientResult<SimulateTransactionResponse> {
        self.simulate_calls
            .lock()
            .unwrap()
            .push(transaction_xdr.to_string());
        match &*self.simulation.lock().unwrap() {
            Some(ScriptedSimulation::Ok(response)) => Ok(response.clone()),
            Some(ScriptedSimulation::Transport(message)) => {
                Err(SorobanRpcClientError::Transport(
                    "simulateTransaction",
                    message.clone(),
                ))
            }
            Some(ScriptedSimulation::Rpc(code, message)) => {
                Err(SorobanRpcClientError::Rpc {
                    method: "simulateTransaction",
                    code: *code,
                    message: message.clone(),
                })
            }
            None => Err(SorobanRpcClientError::Transport(
                "simulateTransaction",
                "no simulation scripted".to_string(),
            )),
        }
    }

    async fn get_ledger_entries(
        &self,
        keys: &[String],
    ) -> SorobanRpcClientResult<GetLedgerEntriesResponse> {
        let entries = self.ledger_entries.lock().unwrap();
        let found: Vec<LedgerEntryResult> = keys
            .iter()
            .filter_map(|key| {
                entries.get(key).map(|xdr| LedgerEntryResult {
                    key: key.clone(),
                    xdr: xdr.clone(),
                    last_modified_ledger_seq: Some(1),
                })
            })
            .collect();
        Ok(GetLedgerEntriesResponse {
            entries: Some(found),
            latest_ledger: Some(4_242),
        })
    }
}

// -----------------
// StubRuntime
// -----------------

/// Canned [RelayerRuntime] with scripted wait outcomes and call capture.
pub struct StubRuntime {
    relayers: Mutex<Vec<RelayerInfo>>,
    wait_status: Mutex<Option<WaitStatus>>,
    sent: Mutex<Vec<SendTransactionRequest>>,
    sign_requests: Mutex<Vec<String>>,
    fail_send: Mutex<Option<String>>,
}

impl Default for StubRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl StubRuntime {
    pub fn new() -> Self {
        Self {
            relayers: Mutex::new(Vec::new()),
            wait_status: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
            sign_requests: Mutex::new(Vec::new()),
            fail_send: Mutex::new(None),
        }
    }

    pub fn add_stellar_relayer(&self, id: &str, address: &str) {
        self.relayers.lock().unwrap().push(RelayerInfo {
            id: id.to_string(),
            address: address.to_string(),
            network_type: STELLAR_NETWORK_TYPE.to_string(),
        });
    }

    pub fn add_relayer(&self, info: RelayerInfo) {
        self.relayers.lock().unwrap().push(info);
    }

    /// Scripts the wait poller's terminal status. Without one, waits time
    /// out.
    pub fn set_wait_status(&self, status: &str, reason: Option<&str>) {
        *self.wait_status.lock().unwrap() = Some(WaitStatus {
            status: status.to_string(),
            reason: reason.map(str::to_string),
            latest_ledger: Some(4_243),
        });
    }

    pub fn fail_send(&self, message: &str) {
        *self.fail_send.lock().unwrap() = Some(message.to_string());
    }

    pub fn sent(&self) -> Vec<SendTransactionRequest> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sign_requests(&self) -> Vec<String> {
        self.sign_requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl RelayerRuntime for StubRuntime {
    async fn get_relayer(
        &self,
        relayer_id: &str,
    ) -> RuntimeResult<Option<RelayerInfo>> {
        Ok(self
            .relayers
            .lock()
            .unwrap()
            .iter()
            .find(|info| info.id == relayer_id)
            .cloned())
    }

    async fn sign_transaction(
        &self,
        _relayer_id: &str,
        transaction_xdr: &str,
    ) -> RuntimeResult<String> {
        self.sign_requests
            .lock()
            .unwrap()
            .push(transaction_xdr.to_string());
        Ok(decorated_signature_b64())
    }

    async fn send_transaction(
        &self,
        request: SendTransactionRequest,
    ) -> RuntimeResult<Submission> {
        if let Some(message) = &*self.fail_send.lock().unwrap() {
            return Err(RuntimeError::Send(message.clone()));
        }
        self.sent.lock().unwrap().push(request);
        Ok(Submission {
            transaction_id: "tx-1".to_string(),
            hash: hex::encode([0xab_u8; 32]),
        })
    }

    async fn transaction_wait(
        &self,
        _submission: &Submission,
        _interval: Duration,
        _timeout: Duration,
    ) -> RuntimeResult<WaitStatus> {
        match &*self.wait_status.lock().unwrap() {
            Some(status) => Ok(status.clone()),
            None => Err(RuntimeError::WaitTimeout),
        }
    }
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
