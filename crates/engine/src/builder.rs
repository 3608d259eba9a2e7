//! Transaction construction.
//!
//! A [`TxnBuilder`] assembles instruction streams against a snapshot
//! of committed substates; an [`ActionCompiler`] turns high-level
//! actions into groups. Fee-paying construction is a two-phase
//! protocol: [`TxnConstructor::build_with_fee`] reserves a guessed fee
//! up front and reports [`BuildOutcome::FeeShortfall`] when the sealed
//! size prices higher than the reservation, letting the caller retry
//! with the exact figure. Amounts encode at fixed width, so a retry
//! with a larger fee does not change the transaction size.

use std::collections::HashSet;

use ed25519_dalek::SigningKey;
use snafu::ResultExt;

use spindle_types::{Amount, SubstateId};

use crate::error::{BuildError, EncodeSnafu, EnvelopeSnafu};
use crate::parser::{
    seal_envelope, Instruction, RawTxn, SubstateRef, FLAG_NO_RESOURCE_BOOKKEEPING,
};
use crate::particles::{KeyBytes, Particle, ParticleKind, ResourceAddr};
use crate::registry::Registry;
use crate::scrypts::system::EPOCH_TAG;

/// Read access to committed substates during construction.
pub trait SubstateSource {
    /// All live substates carrying the given type tag.
    fn indexed(&self, type_tag: u8) -> Vec<(SubstateId, Vec<u8>)>;
}

/// High-level intent compiled into instruction groups.
#[derive(Debug, Clone)]
pub enum TxnAction {
    /// Define a new token resource, optionally minting initial supply.
    CreateResource {
        /// Address of the new resource.
        addr: ResourceAddr,
        /// Granularity constraint on holdings.
        granularity: Amount,
        /// Supply controller, if the supply stays mutable.
        owner: Option<KeyBytes>,
        /// Initial supply minted at creation: recipient and amount.
        initial_supply: Option<(KeyBytes, Amount)>,
    },
    /// Mint new supply of a mutable resource.
    MintTokens {
        /// Resource to mint.
        resource: ResourceAddr,
        /// Recipient of the new supply.
        to: KeyBytes,
        /// Amount to mint.
        amount: Amount,
    },
    /// Move tokens between accounts.
    TransferTokens {
        /// Resource to move.
        resource: ResourceAddr,
        /// Spending account.
        from: KeyBytes,
        /// Receiving account.
        to: KeyBytes,
        /// Amount to move.
        amount: Amount,
    },
    /// Destroy supply of a mutable resource.
    BurnTokens {
        /// Resource to burn.
        resource: ResourceAddr,
        /// Account the burned tokens come from.
        from: KeyBytes,
        /// Amount to burn.
        amount: Amount,
    },
    /// Flip a validator's registration flag to registered.
    RegisterValidator {
        /// Validator identity key.
        key: KeyBytes,
    },
    /// Flip a validator's registration flag to unregistered.
    DeregisterValidator {
        /// Validator identity key.
        key: KeyBytes,
    },
    /// Delegate tokens to a registered validator.
    StakeTokens {
        /// Validator receiving the delegation.
        delegate: KeyBytes,
        /// Resource the stake is denominated in.
        resource: ResourceAddr,
        /// Staking account.
        from: KeyBytes,
        /// Amount to stake.
        amount: Amount,
    },
    /// Advance the epoch counter by one.
    AdvanceEpoch,
}

/// A batch of actions plus envelope-level options.
#[derive(Debug, Clone)]
pub struct ConstructionRequest {
    /// Actions compiled in order, one group each.
    pub actions: Vec<TxnAction>,
    /// Optional attached message.
    pub message: Option<Vec<u8>>,
    /// Whether the envelope disables conservation bookkeeping.
    pub disable_resource_bookkeeping: bool,
}

impl ConstructionRequest {
    /// A request with the given actions and default options.
    #[must_use]
    pub fn new(actions: Vec<TxnAction>) -> Self {
        Self {
            actions,
            message: None,
            disable_resource_bookkeeping: false,
        }
    }
}

/// Outcome of one fee-paying build attempt.
#[derive(Debug)]
pub enum BuildOutcome {
    /// The sealed transaction, with its fee covering its byte size.
    Built(RawTxn),
    /// The reserved fee was below the priced cost; retry with
    /// `required`.
    FeeShortfall {
        /// The fee the sealed size actually requires.
        required: Amount,
    },
}

/// Instruction-stream assembler over a substate snapshot.
pub struct TxnBuilder<'a> {
    registry: &'a Registry,
    source: &'a dyn SubstateSource,
    instructions: Vec<Instruction>,
    spent: HashSet<SubstateId>,
}

impl<'a> TxnBuilder<'a> {
    /// Creates an empty builder.
    #[must_use]
    pub fn new(registry: &'a Registry, source: &'a dyn SubstateSource) -> Self {
        Self {
            registry,
            source,
            instructions: Vec::new(),
            spent: HashSet::new(),
        }
    }

    /// Appends an up-instruction; returns its local index.
    pub fn up(&mut self, particle: &Particle) -> Result<u32, BuildError> {
        let payload = self.registry.encode_particle(particle).context(EncodeSnafu)?;
        let index = self.instructions.len() as u32;
        self.instructions.push(Instruction::Up { payload });
        Ok(index)
    }

    /// Appends a down-instruction for a stored substate and marks it
    /// spent for the rest of this build.
    pub fn down_id(&mut self, id: SubstateId) {
        self.spent.insert(id.clone());
        self.instructions.push(Instruction::Down {
            substate: SubstateRef::Id(id),
        });
    }

    /// Appends a down-instruction for a substate created earlier in
    /// this stream.
    pub fn down_local(&mut self, index: u32) {
        self.instructions.push(Instruction::Down {
            substate: SubstateRef::Local { index },
        });
    }

    /// Appends a down-instruction for a particle's virtual default.
    pub fn down_virtual(&mut self, particle: &Particle) -> Result<(), BuildError> {
        let id = self
            .registry
            .virtual_id(particle)
            .ok_or(BuildError::Encode {
                source: crate::error::SubstateDecodeError::UnknownKind {
                    kind: particle.kind(),
                },
            })?;
        self.down_id(id);
        Ok(())
    }

    /// Appends a read-instruction for a stored substate.
    pub fn read_id(&mut self, id: SubstateId) {
        self.instructions.push(Instruction::Read {
            substate: SubstateRef::Id(id),
        });
    }

    /// Appends a group boundary.
    pub fn end(&mut self) {
        self.instructions.push(Instruction::End);
    }

    /// Appends a message instruction.
    pub fn msg(&mut self, bytes: Vec<u8>) {
        self.instructions.push(Instruction::Msg { bytes });
    }

    /// Live token holdings of `owner` in `resource`, unspent by this
    /// build, in id order.
    pub fn holdings_of(
        &self,
        resource: ResourceAddr,
        owner: &KeyBytes,
    ) -> Result<Vec<(SubstateId, Amount)>, BuildError> {
        let Some(tag) = self.registry.tag_of(ParticleKind::Tokens) else {
            return Ok(Vec::new());
        };
        let mut holdings = Vec::new();
        for (id, payload) in self.source.indexed(tag) {
            if self.spent.contains(&id) {
                continue;
            }
            let (_, particle) = self.registry.decode_payload(&payload).context(EncodeSnafu)?;
            let Particle::Tokens {
                resource: held_resource,
                owner: held_owner,
                amount,
            } = particle
            else {
                continue;
            };
            if held_resource == resource && held_owner == *owner {
                holdings.push((id, amount));
            }
        }
        Ok(holdings)
    }

    /// Selects holdings covering `required`, in id order. Returns the
    /// selected ids and their total.
    pub fn select_tokens(
        &self,
        resource: ResourceAddr,
        owner: &KeyBytes,
        required: Amount,
    ) -> Result<(Vec<SubstateId>, Amount), BuildError> {
        let mut selected = Vec::new();
        let mut total = Amount::ZERO;
        for (id, amount) in self.holdings_of(resource, owner)? {
            selected.push(id);
            total = total.checked_add(amount)?;
            if total >= required {
                return Ok((selected, total));
            }
        }
        Err(BuildError::InsufficientBalance {
            required,
            available: total,
        })
    }

    /// Finds the live definition substate of a resource.
    pub fn find_resource(
        &self,
        addr: ResourceAddr,
    ) -> Result<(SubstateId, Particle), BuildError> {
        let Some(tag) = self.registry.tag_of(ParticleKind::TokenResource) else {
            return Err(BuildError::ResourceNotFound { addr });
        };
        for (id, payload) in self.source.indexed(tag) {
            let (_, particle) = self.registry.decode_payload(&payload).context(EncodeSnafu)?;
            if matches!(&particle, Particle::TokenResource { addr: found, .. } if *found == addr) {
                return Ok((id, particle));
            }
        }
        Err(BuildError::ResourceNotFound { addr })
    }

    /// Finds the live physical validator substate for a key, if one
    /// has ever been written.
    pub fn find_validator(
        &self,
        key: &KeyBytes,
    ) -> Result<Option<(SubstateId, bool)>, BuildError> {
        let Some(tag) = self.registry.tag_of(ParticleKind::Validator) else {
            return Ok(None);
        };
        for (id, payload) in self.source.indexed(tag) {
            let (_, particle) = self.registry.decode_payload(&payload).context(EncodeSnafu)?;
            if let Particle::Validator {
                key: found,
                registered,
            } = particle
            {
                if found == *key {
                    return Ok(Some((id, registered)));
                }
            }
        }
        Ok(None)
    }

    /// The current live epoch substate, if one has ever been written.
    pub fn find_epoch(&self) -> Result<Option<(SubstateId, u64)>, BuildError> {
        for (id, payload) in self.source.indexed(EPOCH_TAG) {
            let (_, particle) = self.registry.decode_payload(&payload).context(EncodeSnafu)?;
            if let Particle::Epoch { epoch } = particle {
                return Ok(Some((id, epoch)));
            }
        }
        Ok(None)
    }

    /// Seals the stream into raw bytes, signing when a key is given.
    pub fn seal(self, flags: u8, signer: Option<&SigningKey>) -> Result<RawTxn, BuildError> {
        seal_envelope(flags, self.instructions, signer).context(EnvelopeSnafu)
    }
}

/// Compiles one action into instruction groups.
pub trait ActionCompiler: Send + Sync {
    /// Appends the groups implementing `action` to `builder`.
    fn compile(&self, action: &TxnAction, builder: &mut TxnBuilder<'_>) -> Result<(), BuildError>;
}

/// The stock compiler covering every [`TxnAction`].
pub struct DefaultCompiler;

impl DefaultCompiler {
    fn transfer(
        builder: &mut TxnBuilder<'_>,
        resource: ResourceAddr,
        from: &KeyBytes,
        to: &KeyBytes,
        amount: Amount,
    ) -> Result<(), BuildError> {
        let (selected, total) = builder.select_tokens(resource, from, amount)?;
        for id in selected {
            builder.down_id(id);
        }
        builder.up(&Particle::Tokens {
            resource,
            owner: *to,
            amount,
        })?;
        let change = total.checked_sub(amount)?;
        if !change.is_zero() {
            builder.up(&Particle::Tokens {
                resource,
                owner: *from,
                amount: change,
            })?;
        }
        builder.end();
        Ok(())
    }
}

impl ActionCompiler for DefaultCompiler {
    fn compile(&self, action: &TxnAction, builder: &mut TxnBuilder<'_>) -> Result<(), BuildError> {
        match action {
            TxnAction::CreateResource {
                addr,
                granularity,
                owner,
                initial_supply,
            } => {
                builder.up(&Particle::TokenResource {
                    addr: *addr,
                    granularity: *granularity,
                    owner: *owner,
                })?;
                if let Some((to, amount)) = initial_supply {
                    builder.up(&Particle::Tokens {
                        resource: *addr,
                        owner: *to,
                        amount: *amount,
                    })?;
                }
                builder.end();
            }

            TxnAction::MintTokens {
                resource,
                to,
                amount,
            } => {
                let (definition_id, _) = builder.find_resource(*resource)?;
                builder.read_id(definition_id);
                builder.up(&Particle::Tokens {
                    resource: *resource,
                    owner: *to,
                    amount: *amount,
                })?;
                builder.end();
            }

            TxnAction::TransferTokens {
                resource,
                from,
                to,
                amount,
            } => {
                Self::transfer(builder, *resource, from, to, *amount)?;
            }

            TxnAction::BurnTokens {
                resource,
                from,
                amount,
            } => {
                let (definition_id, _) = builder.find_resource(*resource)?;
                let (selected, total) = builder.select_tokens(*resource, from, *amount)?;
                if total == *amount {
                    builder.read_id(definition_id);
                    for id in selected {
                        builder.down_id(id);
                    }
                    builder.end();
                } else {
                    // Split off an exact holding first, then burn it.
                    for id in selected {
                        builder.down_id(id);
                    }
                    let exact = builder.up(&Particle::Tokens {
                        resource: *resource,
                        owner: *from,
                        amount: *amount,
                    })?;
                    builder.up(&Particle::Tokens {
                        resource: *resource,
                        owner: *from,
                        amount: total.checked_sub(*amount)?,
                    })?;
                    builder.end();
                    builder.read_id(definition_id);
                    builder.down_local(exact);
                    builder.end();
                }
            }

            TxnAction::RegisterValidator { key } => {
                match builder.find_validator(key)? {
                    Some((id, _)) => builder.down_id(id),
                    None => builder.down_virtual(&Particle::Validator {
                        key: *key,
                        registered: false,
                    })?,
                }
                builder.up(&Particle::Validator {
                    key: *key,
                    registered: true,
                })?;
                builder.end();
            }

            TxnAction::DeregisterValidator { key } => {
                match builder.find_validator(key)? {
                    Some((id, _)) => builder.down_id(id),
                    None => builder.down_virtual(&Particle::Validator {
                        key: *key,
                        registered: false,
                    })?,
                }
                builder.up(&Particle::Validator {
                    key: *key,
                    registered: false,
                })?;
                builder.end();
            }

            TxnAction::StakeTokens {
                delegate,
                resource,
                from,
                amount,
            } => {
                let Some((validator_id, registered)) = builder.find_validator(delegate)? else {
                    return Err(BuildError::ValidatorNotFound { key: *delegate });
                };
                if !registered {
                    return Err(BuildError::ValidatorNotFound { key: *delegate });
                }
                builder.read_id(validator_id);
                let (selected, total) = builder.select_tokens(*resource, from, *amount)?;
                for id in selected {
                    builder.down_id(id);
                }
                builder.up(&Particle::Stake {
                    delegate: *delegate,
                    owner: *from,
                    amount: *amount,
                })?;
                let change = total.checked_sub(*amount)?;
                if !change.is_zero() {
                    builder.up(&Particle::Tokens {
                        resource: *resource,
                        owner: *from,
                        amount: change,
                    })?;
                }
                builder.end();
            }

            TxnAction::AdvanceEpoch => {
                let next = match builder.find_epoch()? {
                    Some((id, epoch)) => {
                        builder.down_id(id);
                        epoch + 1
                    }
                    None => {
                        builder.down_virtual(&Particle::Epoch { epoch: 0 })?;
                        1
                    }
                };
                builder.up(&Particle::Epoch { epoch: next })?;
                builder.end();
            }
        }
        Ok(())
    }
}

/// Construction front end binding a registry, a substate snapshot,
/// and a compiler.
pub struct TxnConstructor<'a> {
    registry: &'a Registry,
    source: &'a dyn SubstateSource,
    compiler: &'a dyn ActionCompiler,
}

impl<'a> TxnConstructor<'a> {
    /// Binds the construction inputs.
    #[must_use]
    pub fn new(
        registry: &'a Registry,
        source: &'a dyn SubstateSource,
        compiler: &'a dyn ActionCompiler,
    ) -> Self {
        Self {
            registry,
            source,
            compiler,
        }
    }

    fn flags(request: &ConstructionRequest) -> u8 {
        if request.disable_resource_bookkeeping {
            FLAG_NO_RESOURCE_BOOKKEEPING
        } else {
            0
        }
    }

    /// Builds a transaction without a fee group.
    pub fn construct(
        &self,
        request: &ConstructionRequest,
        signer: Option<&SigningKey>,
    ) -> Result<RawTxn, BuildError> {
        let mut builder = TxnBuilder::new(self.registry, self.source);
        if let Some(message) = &request.message {
            builder.msg(message.clone());
        }
        for action in &request.actions {
            self.compiler.compile(action, &mut builder)?;
        }
        builder.seal(Self::flags(request), signer)
    }

    /// One fee-paying build attempt: reserves `fee` up front, compiles
    /// the actions, seals, and prices the sealed size at
    /// `fee_rate` per byte.
    pub fn build_with_fee(
        &self,
        request: &ConstructionRequest,
        signer: &SigningKey,
        fee_payer: &KeyBytes,
        fee_resource: ResourceAddr,
        fee_rate: Amount,
        fee: Amount,
    ) -> Result<BuildOutcome, BuildError> {
        let mut builder = TxnBuilder::new(self.registry, self.source);
        if let Some(message) = &request.message {
            builder.msg(message.clone());
        }

        // Fee group first, so action groups cannot spend the holdings
        // that cover it.
        let (selected, total) = builder.select_tokens(fee_resource, fee_payer, fee)?;
        for id in selected {
            builder.down_id(id);
        }
        let change = total.checked_sub(fee)?;
        if !change.is_zero() {
            builder.up(&Particle::Tokens {
                resource: fee_resource,
                owner: *fee_payer,
                amount: change,
            })?;
        }
        builder.up(&Particle::FeePaid {
            payer: *fee_payer,
            amount: fee,
        })?;
        builder.end();

        for action in &request.actions {
            self.compiler.compile(action, &mut builder)?;
        }
        let raw = builder.seal(Self::flags(request), Some(signer))?;
        let required = fee_rate.checked_mul_u64(raw.bytes.len() as u64)?;
        if required > fee {
            return Ok(BuildOutcome::FeeShortfall { required });
        }
        Ok(BuildOutcome::Built(raw))
    }
}
