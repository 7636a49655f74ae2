//! Test fixtures: an in-process provider with scripted behaviour and a
//! reversible secrets crypter.

use async_trait::async_trait;
use converge_engine::error::{ProviderError, SecretsError};
use converge_engine::provider::{
    CheckFailure, CheckRequest, CheckResponse, CreateRequest, CreateResponse, DeleteRequest,
    DiffChanges, DiffRequest, DiffResponse, Provider, ProviderInfo, ReadRequest, ReadResponse,
    UpdateRequest, UpdateResponse,
};
use converge_engine::resource::{PropertyMap, PropertyValue, Urn};
use converge_engine::secrets::{Decrypter, Encrypter};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

/// Package served by [`FakeProvider`].
pub const PACKAGE: &str = "test";

/// One provider call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub operation: &'static str,
    pub name: String,
}

#[derive(Debug)]
struct Failure {
    remaining: Option<u32>,
    retryable: bool,
}

#[derive(Debug, Default)]
struct Behaviour {
    replace_keys: HashSet<String>,
    delete_first: bool,
    cannot_diff: bool,
    failures: HashMap<(String, &'static str), Failure>,
    partial_creates: HashSet<String>,
    rejected: HashSet<String>,
    delays: HashMap<String, Duration>,
}

#[derive(Debug, Default)]
struct Calls {
    log: Vec<Call>,
    next_id: u64,
    live: BTreeMap<String, String>,
    in_flight: usize,
    max_in_flight: usize,
}

/// A provider for package `test` that keeps its "cloud" in memory.
///
/// Created resources get ids `<name>-<n>` and echo their inputs as outputs
/// plus an `arn`. Diffs compare inputs key by key; keys registered with
/// [`replace_on`](Self::replace_on) force a replacement.
#[derive(Debug, Default)]
pub struct FakeProvider {
    behaviour: Mutex<Behaviour>,
    calls: Mutex<Calls>,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Changing `key` requires a replacement.
    pub fn replace_on(&self, key: &str) {
        self.behaviour.lock().unwrap().replace_keys.insert(key.to_string());
    }

    /// Replacements must delete the old resource first.
    pub fn delete_before_replace(&self) {
        self.behaviour.lock().unwrap().delete_first = true;
    }

    /// Diff reports itself unsupported.
    pub fn without_diff(&self) {
        self.behaviour.lock().unwrap().cannot_diff = true;
    }

    /// Fails `operation` on resource `name`, `times` times or forever.
    pub fn fail(&self, name: &str, operation: &'static str, times: Option<u32>, retryable: bool) {
        self.behaviour.lock().unwrap().failures.insert(
            (name.to_string(), operation),
            Failure {
                remaining: times,
                retryable,
            },
        );
    }

    /// Creates of `name` succeed in the cloud but report a partial result.
    pub fn partial_create(&self, name: &str) {
        self.behaviour.lock().unwrap().partial_creates.insert(name.to_string());
    }

    /// Check rejects the inputs of `name`.
    pub fn reject(&self, name: &str) {
        self.behaviour.lock().unwrap().rejected.insert(name.to_string());
    }

    /// Mutating calls on `name` take `delay`.
    pub fn delay(&self, name: &str, delay: Duration) {
        self.behaviour.lock().unwrap().delays.insert(name.to_string(), delay);
    }

    /// Every call, in the order it started.
    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().log.clone()
    }

    /// Create, update and delete calls, in the order they started.
    pub fn mutations(&self) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| matches!(c.operation, "create" | "update" | "delete"))
            .collect()
    }

    /// Number of `operation` calls on `name`.
    pub fn count(&self, operation: &str, name: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.operation == operation && c.name == name)
            .count()
    }

    /// Position of the first `operation` call on `name`.
    pub fn position(&self, operation: &str, name: &str) -> Option<usize> {
        self.calls()
            .iter()
            .position(|c| c.operation == operation && c.name == name)
    }

    /// Ids of resources that currently exist in the fake cloud.
    pub fn live_ids(&self) -> Vec<String> {
        self.calls.lock().unwrap().live.keys().cloned().collect()
    }

    /// Highest number of mutating calls that overlapped.
    pub fn max_in_flight(&self) -> usize {
        self.calls.lock().unwrap().max_in_flight
    }

    fn record(&self, operation: &'static str, urn: &Urn) {
        self.calls.lock().unwrap().log.push(Call {
            operation,
            name: urn.name().to_string(),
        });
    }

    /// Records a mutating call, holds it for the configured delay and then
    /// applies any scripted failure.
    async fn enter(&self, operation: &'static str, urn: &Urn) -> Result<(), ProviderError> {
        let name = urn.name().to_string();
        let delay = self.behaviour.lock().unwrap().delays.get(&name).copied();
        {
            let mut calls = self.calls.lock().unwrap();
            calls.log.push(Call {
                operation,
                name: name.clone(),
            });
            calls.in_flight += 1;
            calls.max_in_flight = calls.max_in_flight.max(calls.in_flight);
        }
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.calls.lock().unwrap().in_flight -= 1;
        self.scripted_failure(&name, operation)
    }

    fn scripted_failure(&self, name: &str, operation: &'static str) -> Result<(), ProviderError> {
        let mut behaviour = self.behaviour.lock().unwrap();
        let Some(failure) = behaviour.failures.get_mut(&(name.to_string(), operation)) else {
            return Ok(());
        };
        match failure.remaining.as_mut() {
            Some(0) => return Ok(()),
            Some(remaining) => *remaining -= 1,
            None => {}
        }
        let message = format!("{operation} of {name} failed");
        Err(if failure.retryable {
            ProviderError::transient(PACKAGE, message)
        } else {
            ProviderError::failure(PACKAGE, message)
        })
    }

    fn outputs(inputs: &PropertyMap, id: &str) -> PropertyMap {
        let mut outputs = inputs.clone();
        outputs.insert(
            "arn".to_string(),
            PropertyValue::String(format!("arn:test:{id}")),
        );
        outputs
    }
}

#[async_trait]
impl Provider for FakeProvider {
    fn info(&self) -> ProviderInfo {
        ProviderInfo::new(PACKAGE)
    }

    async fn configure(&self, _config: &PropertyMap) -> Result<(), ProviderError> {
        Ok(())
    }

    async fn check(&self, request: CheckRequest) -> Result<CheckResponse, ProviderError> {
        self.record("check", &request.urn);
        let failures = if self.behaviour.lock().unwrap().rejected.contains(request.urn.name()) {
            vec![CheckFailure {
                property: "size".to_string(),
                reason: "unsupported size".to_string(),
            }]
        } else {
            Vec::new()
        };
        Ok(CheckResponse {
            inputs: request.news,
            failures,
        })
    }

    async fn diff(&self, request: DiffRequest) -> Result<DiffResponse, ProviderError> {
        self.record("diff", &request.urn);
        let behaviour = self.behaviour.lock().unwrap();
        if behaviour.cannot_diff {
            return Err(ProviderError::Unsupported {
                package: PACKAGE.to_string(),
                operation: "diff",
            });
        }

        let keys: BTreeSet<&String> = request
            .old_inputs
            .keys()
            .chain(request.new_inputs.keys())
            .collect();
        let changed: Vec<String> = keys
            .into_iter()
            .filter(|k| request.old_inputs.get(*k) != request.new_inputs.get(*k))
            .cloned()
            .collect();
        if changed.is_empty() {
            return Ok(DiffResponse::unchanged());
        }
        let replaces: Vec<String> = changed
            .iter()
            .filter(|k| behaviour.replace_keys.contains(*k))
            .cloned()
            .collect();
        Ok(DiffResponse {
            changes: DiffChanges::Some,
            delete_before_replace: behaviour.delete_first && !replaces.is_empty(),
            replaces,
            changed_keys: changed,
            stables: Vec::new(),
        })
    }

    async fn create(&self, request: CreateRequest) -> Result<CreateResponse, ProviderError> {
        self.enter("create", &request.urn).await?;
        let name = request.urn.name().to_string();
        let id = {
            let mut calls = self.calls.lock().unwrap();
            calls.next_id += 1;
            let id = format!("{name}-{}", calls.next_id);
            calls.live.insert(id.clone(), name.clone());
            id
        };
        let outputs = Self::outputs(&request.inputs, &id);

        if self.behaviour.lock().unwrap().partial_creates.contains(&name) {
            return Err(ProviderError::Partial {
                package: PACKAGE.to_string(),
                urn: request.urn,
                id: Some(id),
                outputs,
                reasons: vec!["timed out waiting for the resource to become ready".to_string()],
            });
        }
        Ok(CreateResponse { id, outputs })
    }

    async fn update(&self, request: UpdateRequest) -> Result<UpdateResponse, ProviderError> {
        self.enter("update", &request.urn).await?;
        Ok(UpdateResponse {
            outputs: Self::outputs(&request.new_inputs, &request.id),
        })
    }

    async fn delete(&self, request: DeleteRequest) -> Result<(), ProviderError> {
        self.enter("delete", &request.urn).await?;
        self.calls.lock().unwrap().live.remove(&request.id);
        Ok(())
    }

    async fn read(&self, request: ReadRequest) -> Result<ReadResponse, ProviderError> {
        self.record("read", &request.urn);
        Ok(ReadResponse {
            outputs: Self::outputs(&request.inputs, &request.id),
            id: request.id,
            inputs: request.inputs,
        })
    }
}

/// Reversible crypter: ciphertext is the hex of the plaintext.
#[derive(Debug, Default, Clone, Copy)]
pub struct HexCrypter;

const CIPHER_PREFIX: &str = "hex:";

#[async_trait]
impl Encrypter for HexCrypter {
    async fn encrypt_value(&self, plaintext: &str) -> Result<String, SecretsError> {
        Ok(format!("{CIPHER_PREFIX}{}", hex::encode(plaintext)))
    }
}

#[async_trait]
impl Decrypter for HexCrypter {
    async fn decrypt_value(&self, ciphertext: &str) -> Result<String, SecretsError> {
        let encoded = ciphertext
            .strip_prefix(CIPHER_PREFIX)
            .ok_or_else(|| SecretsError::DecryptFailed {
                message: "unknown ciphertext format".to_string(),
            })?;
        let bytes = hex::decode(encoded).map_err(|e| SecretsError::DecryptFailed {
            message: e.to_string(),
        })?;
        String::from_utf8(bytes).map_err(|e| SecretsError::DecryptFailed {
            message: e.to_string(),
        })
    }
}
