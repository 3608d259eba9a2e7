//! Shared fixtures for engine integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use ed25519_dalek::SigningKey;

use spindle_engine::scrypts::stake::StakeScrypt;
use spindle_engine::scrypts::tokens::TokensScrypt;
use spindle_engine::{
    ConstraintMachine, ConstructionRequest, EngineConfig, EnvelopeParser, KeyBytes, LedgerEngine,
    MachineLimits, NoMeter, Particle, ParticleKind, PermissionLevel, RawTxn, Registry,
    ResourceAddr, SubstateSource, TxnAction,
};
use spindle_store::{EngineStore, MemStore};
use spindle_types::{Amount, SubstateId};

pub type TestEngine = LedgerEngine<u64, MemStore<u64>>;

/// A fully loaded registry: system, tokens, and stake scrypts.
pub fn registry() -> Registry {
    let mut registry = Registry::with_base().expect("base registry");
    registry.load(&TokensScrypt).expect("tokens scrypt");
    registry.load(&StakeScrypt).expect("stake scrypt");
    registry
}

pub fn config() -> EngineConfig {
    let machine = ConstraintMachine::new(registry(), MachineLimits::default(), Box::new(NoMeter));
    EngineConfig::new(machine, Box::new(EnvelopeParser))
}

pub fn engine() -> TestEngine {
    LedgerEngine::new(Arc::new(MemStore::new()), config())
}

pub fn signing_key(seed: u8) -> SigningKey {
    SigningKey::from_bytes(&[seed; 32])
}

pub fn pubkey(key: &SigningKey) -> KeyBytes {
    key.verifying_key().to_bytes()
}

/// Next metadata value for a committing execution.
pub fn next_meta<S: EngineStore<u64>>(engine: &LedgerEngine<u64, S>) -> u64 {
    engine.metadata().map_or(0, |meta| meta + 1)
}

/// Commits a batch at user level, panicking on rejection.
pub fn commit<S: EngineStore<u64>>(engine: &LedgerEngine<u64, S>, txns: &[RawTxn]) {
    let meta = next_meta(engine);
    engine
        .execute(txns, Some(meta), PermissionLevel::User, false)
        .expect("commit batch");
}

/// Creates a resource with an initial supply and commits it.
pub fn create_resource<S: EngineStore<u64>>(
    engine: &LedgerEngine<u64, S>,
    symbol: &[u8],
    owner: Option<KeyBytes>,
    to: KeyBytes,
    supply: Amount,
    granularity: u64,
) -> ResourceAddr {
    let addr = ResourceAddr::derive(&to, symbol);
    let request = ConstructionRequest::new(vec![TxnAction::CreateResource {
        addr,
        granularity: Amount::from_u64(granularity),
        owner,
        initial_supply: Some((to, supply)),
    }]);
    let raw = engine.construct(&request, None).expect("construct genesis");
    commit(engine, &[raw]);
    addr
}

/// Sum of an account's live holdings in one resource.
pub fn balance<S: EngineStore<u64>>(
    engine: &LedgerEngine<u64, S>,
    resource: ResourceAddr,
    owner: &KeyBytes,
) -> Amount {
    engine
        .reduce(ParticleKind::Tokens, Amount::ZERO, |acc, particle| {
            match particle {
                Particle::Tokens {
                    resource: held_resource,
                    owner: held_owner,
                    amount,
                } if *held_resource == resource && held_owner == owner => {
                    acc.checked_add(*amount).expect("balance sum")
                }
                _ => acc,
            }
        })
        .expect("reduce holdings")
}

/// Committed-state snapshot usable as a construction source.
pub struct Snapshot<'a>(pub &'a MemStore<u64>);

impl SubstateSource for Snapshot<'_> {
    fn indexed(&self, type_tag: u8) -> Vec<(SubstateId, Vec<u8>)> {
        self.0.indexed(type_tag)
    }
}
