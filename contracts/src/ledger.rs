//! # Ledger
//!
//! [`Ledger`] owns every table: payment networks, channels, proposals,
//! delegates and in-flight disputes, plus the escrow handle and the anchor
//! block height. The operations live next to the component they belong to
//! (`transfer`, `proposal`, `dispute`); this file holds construction,
//! administration, queries, reconciliation and persistence.
//!
//! Nothing here is global. Hosts that serve many callers wrap the ledger in
//! a [`SharedLedger`], which serializes every mutation behind one lock.

use std::collections::BTreeMap;
use std::sync::Arc;

use hubpay_protocol::config::{network_name, LedgerConfig};
use hubpay_protocol::crypto::{Address, Domain, Hash32};
use hubpay_protocol::storage::{LedgerDb, Table};
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::channel::{channel_id, short_id, Channel, ChannelStatus};
use crate::delegation::{Delegate, DelegationRegistry};
use crate::dispute::ClosingRecord;
use crate::error::{add, LedgerError, LedgerResult};
use crate::escrow::EscrowInterface;
use crate::network::PaymentNetwork;
use crate::proposal::{ProposalRecord, ProposalRegistry};
use crate::roles::Role;
use crate::roles::RoleBook;
use crate::transfer::ArrearsStatus;

const META_HEIGHT: &str = "height";

/// The channel ledger.
#[derive(Debug)]
pub struct Ledger<E: EscrowInterface> {
    pub(crate) config: LedgerConfig,
    pub(crate) domain: Domain,
    pub(crate) roles: RoleBook,
    pub(crate) delegates: DelegationRegistry,
    pub(crate) networks: BTreeMap<Address, PaymentNetwork>,
    pub(crate) channels: BTreeMap<Hash32, Channel>,
    /// Latest epoch opened per `(user, asset)`.
    pub(crate) epochs: BTreeMap<(Address, Address), u64>,
    pub(crate) proposals: ProposalRegistry,
    pub(crate) closings: BTreeMap<Hash32, ClosingRecord>,
    pub(crate) escrow: E,
    pub(crate) height: u64,
}

impl<E: EscrowInterface> Ledger<E> {
    /// Create an empty ledger. Fails if the configuration is inconsistent.
    pub fn new(config: LedgerConfig, escrow: E) -> LedgerResult<Self> {
        config.validate()?;
        info!(
            network = %network_name(config.network_id),
            ledger = %config.verifying_ledger,
            "ledger created"
        );
        Ok(Self {
            domain: Domain::new(config.network_id, config.verifying_ledger),
            roles: RoleBook::from_config(&config),
            delegates: DelegationRegistry::new(config.max_delegates),
            networks: BTreeMap::new(),
            channels: BTreeMap::new(),
            epochs: BTreeMap::new(),
            proposals: ProposalRegistry::default(),
            closings: BTreeMap::new(),
            escrow,
            height: 0,
            config,
        })
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    /// Signing domain for transfer messages.
    pub fn domain(&self) -> &Domain {
        &self.domain
    }

    pub fn roles(&self) -> &RoleBook {
        &self.roles
    }

    pub fn height(&self) -> u64 {
        self.height
    }

    pub fn escrow(&self) -> &E {
        &self.escrow
    }

    pub fn escrow_mut(&mut self) -> &mut E {
        &mut self.escrow
    }

    pub fn proposals(&self) -> &ProposalRegistry {
        &self.proposals
    }

    pub fn channel(&self, id: &Hash32) -> LedgerResult<&Channel> {
        self.channels
            .get(id)
            .ok_or_else(|| LedgerError::ChannelNotFound(short_id(id)))
    }

    /// Status of `id`; `Empty` if there is no such channel.
    pub fn channel_status(&self, id: &Hash32) -> ChannelStatus {
        self.channels
            .get(id)
            .map(|c| c.status)
            .unwrap_or(ChannelStatus::Empty)
    }

    /// Id of the latest channel between the provider and `user` for
    /// `asset`, or of the first one if none was opened yet.
    pub fn channel_id_for(&self, user: &Address, asset: &Address) -> Hash32 {
        let epoch = self.epochs.get(&(*user, *asset)).copied().unwrap_or(0);
        channel_id(&self.roles.provider(), user, asset, epoch)
    }

    pub fn channels(&self) -> impl Iterator<Item = &Channel> {
        self.channels.values()
    }

    pub fn network(&self, asset: &Address) -> LedgerResult<&PaymentNetwork> {
        self.networks
            .get(asset)
            .ok_or(LedgerError::NetworkNotFound(*asset))
    }

    pub fn delegates_of(&self, user: &Address) -> &[Delegate] {
        self.delegates.delegates_of(user)
    }

    pub fn is_authorized_signer(&self, user: &Address, signer: &Address) -> bool {
        self.delegates.is_authorized_signer(user, signer)
    }

    pub fn closing(&self, id: &Hash32) -> Option<&ClosingRecord> {
        self.closings.get(id)
    }

    pub(crate) fn channel_mut(&mut self, id: &Hash32) -> LedgerResult<&mut Channel> {
        self.channels
            .get_mut(id)
            .ok_or_else(|| LedgerError::ChannelNotFound(short_id(id)))
    }

    pub(crate) fn network_mut(&mut self, asset: &Address) -> LedgerResult<&mut PaymentNetwork> {
        self.networks
            .get_mut(asset)
            .ok_or(LedgerError::NetworkNotFound(*asset))
    }

    fn require(&self, caller: &Address, role: Role) -> LedgerResult<()> {
        self.roles
            .authorize(caller, &[role], None, &self.delegates)
            .map(|_| ())
    }

    // -----------------------------------------------------------------------
    // Anchor clock
    // -----------------------------------------------------------------------

    /// Record the anchor height observed by the host.
    pub fn advance_to(&mut self, height: u64) -> LedgerResult<()> {
        if height < self.height {
            return Err(LedgerError::InvalidArgument("block height cannot move backwards"));
        }
        self.height = height;
        debug!(height, "anchor height advanced");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Administration (auditor-relayed)
    // -----------------------------------------------------------------------

    /// Open the channel between the provider and `user` for `asset`,
    /// funded with the user's initial `deposit`.
    pub fn open_channel(
        &mut self,
        caller: &Address,
        user: &Address,
        asset: &Address,
        deposit: u64,
    ) -> LedgerResult<Hash32> {
        self.require(caller, Role::Auditor)?;
        if *user == self.roles.provider() || *user == self.roles.auditor() {
            return Err(LedgerError::InvalidArgument("provider and auditor cannot be users"));
        }
        let latest = self.channel_id_for(user, asset);
        let epoch = match self.channels.get(&latest) {
            None => 0,
            Some(existing) if existing.status == ChannelStatus::Settled => {
                existing.epoch.checked_add(1).ok_or(LedgerError::AmountOverflow)?
            }
            Some(_) => return Err(LedgerError::ChannelAlreadyExists(short_id(&latest))),
        };
        let id = channel_id(&self.roles.provider(), user, asset, epoch);
        let mut network = self
            .networks
            .get(asset)
            .cloned()
            .unwrap_or_else(|| PaymentNetwork::new(*asset));
        network.record_user_deposit(deposit)?;
        if deposit > 0 {
            self.escrow
                .notify_deposit(asset, deposit)
                .map_err(|e| LedgerError::EscrowRejected(e.to_string()))?;
        }

        self.networks.insert(*asset, network);
        self.channels.insert(
            id,
            Channel::open(id, *user, *asset, deposit, self.height, epoch),
        );
        self.epochs.insert((*user, *asset), epoch);

        info!(channel = %short_id(&id), %user, deposit, epoch, "channel opened");
        Ok(id)
    }

    /// Credit a user deposit the auditor saw land in escrow.
    pub fn user_deposit(
        &mut self,
        caller: &Address,
        id: &Hash32,
        amount: u64,
    ) -> LedgerResult<ArrearsStatus> {
        self.require(caller, Role::Auditor)?;
        let channel = self.channel(id)?;
        if !channel.is_open() {
            return Err(LedgerError::ChannelNotOpen(short_id(id)));
        }
        let asset = channel.asset;
        let deposit = add(channel.deposit, amount)?;
        let user_balance = add(channel.user_balance, amount)?;
        let mut network = self.network(&asset)?.clone();
        network.record_user_deposit(amount)?;

        self.escrow
            .notify_deposit(&asset, amount)
            .map_err(|e| LedgerError::EscrowRejected(e.to_string()))?;
        let channel = self.channel_mut(id)?;
        channel.deposit = deposit;
        channel.user_balance = user_balance;
        self.networks.insert(asset, network);

        info!(channel = %short_id(id), amount, deposit, "user deposit credited");
        Ok(self.retry_arrears(id))
    }

    /// Credit a provider deposit into the pooled balance of `asset`.
    pub fn provider_deposit(
        &mut self,
        caller: &Address,
        asset: &Address,
        amount: u64,
    ) -> LedgerResult<()> {
        self.require(caller, Role::Auditor)?;
        let mut network = self
            .networks
            .get(asset)
            .cloned()
            .unwrap_or_else(|| PaymentNetwork::new(*asset));
        network.credit_provider_deposit(amount)?;
        self.escrow
            .notify_deposit(asset, amount)
            .map_err(|e| LedgerError::EscrowRejected(e.to_string()))?;
        info!(%asset, amount, pool = network.provider_balance, "provider deposit credited");
        self.networks.insert(*asset, network);
        Ok(())
    }

    /// Set the fee rate of `asset`. Applies to transfers from now on.
    pub fn set_fee_rate(&mut self, caller: &Address, asset: &Address, rate: u64) -> LedgerResult<()> {
        self.require(caller, Role::Auditor)?;
        self.network_mut(asset)?.set_fee_rate(rate)?;
        info!(%asset, rate, "fee rate updated");
        Ok(())
    }

    pub fn add_delegate(
        &mut self,
        caller: &Address,
        user: &Address,
        delegate: Address,
    ) -> LedgerResult<()> {
        self.require(caller, Role::Auditor)?;
        if self.roles.role_of(&delegate, None, &self.delegates).is_some() {
            return Err(LedgerError::InvalidArgument("fixed role holders cannot be delegates"));
        }
        self.delegates.add_delegate(user, delegate)?;
        info!(%user, %delegate, "delegate added");
        Ok(())
    }

    pub fn disable_delegate(
        &mut self,
        caller: &Address,
        user: &Address,
        delegate: &Address,
    ) -> LedgerResult<()> {
        self.require(caller, Role::Auditor)?;
        self.delegates.disable_delegate(user, delegate)?;
        info!(%user, %delegate, "delegate disabled");
        Ok(())
    }

    pub fn enable_delegate(
        &mut self,
        caller: &Address,
        user: &Address,
        delegate: &Address,
    ) -> LedgerResult<()> {
        self.require(caller, Role::Auditor)?;
        self.delegates.enable_delegate(user, delegate)?;
        info!(%user, %delegate, "delegate enabled");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Reconciliation
    // -----------------------------------------------------------------------

    /// What the ledger says the escrow should hold for `asset`: every
    /// channel's value, the pool, and realized fees.
    pub fn booked_custody(&self, asset: &Address) -> LedgerResult<u64> {
        let network = self.network(asset)?;
        let mut total = add(network.provider_balance, network.accrued_fee)?;
        for channel in self.channels.values().filter(|c| c.asset == *asset) {
            total = add(total, channel.total()?)?;
        }
        Ok(total)
    }

    /// Compare the books with the escrow and check the pool identity.
    pub fn reconcile(&self, asset: &Address) -> LedgerResult<()> {
        let network = self.network(asset)?;
        network.audit()?;
        let booked = self.booked_custody(asset)?;
        let held = self.escrow.custodied(asset);
        if booked != held {
            warn!(%asset, booked, held, "escrow reconciliation mismatch");
            return Err(LedgerError::ReconciliationMismatch {
                asset: *asset,
                ledger: booked,
                escrow: held,
            });
        }
        debug!(%asset, booked, "escrow reconciled");
        Ok(())
    }

    /// Ask the escrow to pay out. The ledger has already committed, so a
    /// refusal is logged and left to reconciliation.
    pub(crate) fn request_payout(&mut self, asset: &Address, recipient: &Address, amount: u64) {
        if amount == 0 {
            return;
        }
        match self.escrow.request_payout(asset, recipient, amount) {
            Ok(payout) => debug!(%asset, %recipient, amount, payout, "payout requested"),
            Err(e) => warn!(%asset, %recipient, amount, error = %e, "escrow refused payout"),
        }
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    /// Write a full snapshot. Each table is replaced atomically.
    pub fn persist(&self, db: &LedgerDb) -> LedgerResult<()> {
        let networks: Vec<(Vec<u8>, PaymentNetwork)> = self
            .networks
            .iter()
            .map(|(asset, net)| (asset.as_bytes().to_vec(), net.clone()))
            .collect();
        let channels: Vec<(Vec<u8>, Channel)> = self
            .channels
            .iter()
            .map(|(id, ch)| (id.to_vec(), ch.clone()))
            .collect();
        let proposals = self.proposals.records();
        let delegates: Vec<(Vec<u8>, Vec<Delegate>)> = self
            .delegates
            .entries()
            .map(|(user, list)| (user.as_bytes().to_vec(), list.clone()))
            .collect();
        let closings: Vec<(Vec<u8>, ClosingRecord)> = self
            .closings
            .iter()
            .map(|(id, rec)| (id.to_vec(), rec.clone()))
            .collect();

        db.replace_tree(Table::Networks, &networks)?;
        db.replace_tree(Table::Channels, &channels)?;
        db.replace_tree(Table::Proposals, &proposals)?;
        db.replace_tree(Table::Delegates, &delegates)?;
        db.replace_tree(Table::Disputes, &closings)?;
        db.put_meta_u64(META_HEIGHT, self.height)?;
        db.flush()?;

        info!(
            networks = networks.len(),
            channels = channels.len(),
            proposals = proposals.len(),
            height = self.height,
            "ledger persisted"
        );
        Ok(())
    }

    /// Rebuild a ledger from a snapshot written by [`persist`](Self::persist).
    pub fn restore(config: LedgerConfig, escrow: E, db: &LedgerDb) -> LedgerResult<Self> {
        let mut ledger = Self::new(config, escrow)?;

        for (_, net) in db.scan::<PaymentNetwork>(Table::Networks)? {
            ledger.networks.insert(net.asset, net);
        }
        for (_, channel) in db.scan::<Channel>(Table::Channels)? {
            let latest = ledger
                .epochs
                .entry((channel.user, channel.asset))
                .or_insert(channel.epoch);
            *latest = (*latest).max(channel.epoch);
            ledger.channels.insert(channel.id, channel);
        }
        for (_, record) in db.scan::<ProposalRecord>(Table::Proposals)? {
            ledger.proposals.insert_record(record);
        }
        for (key, list) in db.scan::<Vec<Delegate>>(Table::Delegates)? {
            let user = address_key(&key)?;
            ledger.delegates.insert_entry(user, list);
        }
        for (key, record) in db.scan::<ClosingRecord>(Table::Disputes)? {
            let id: Hash32 = key
                .as_slice()
                .try_into()
                .map_err(|_| LedgerError::Storage("malformed dispute key".into()))?;
            ledger.closings.insert(id, record);
        }
        ledger.height = db.get_meta_u64(META_HEIGHT)?.unwrap_or(0);

        info!(
            channels = ledger.channels.len(),
            height = ledger.height,
            "ledger restored"
        );
        Ok(ledger)
    }
}

fn address_key(key: &[u8]) -> LedgerResult<Address> {
    let bytes: [u8; 32] = key
        .try_into()
        .map_err(|_| LedgerError::Storage("malformed address key".into()))?;
    Ok(Address::from_bytes(bytes))
}

// ---------------------------------------------------------------------------
// SharedLedger
// ---------------------------------------------------------------------------

/// A ledger shared between threads.
///
/// Every closure passed to [`write`](Self::write) runs under the write
/// lock, so each ledger operation is one atomic, serialized transaction.
#[derive(Debug)]
pub struct SharedLedger<E: EscrowInterface> {
    inner: Arc<RwLock<Ledger<E>>>,
}

impl<E: EscrowInterface> Clone for SharedLedger<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E: EscrowInterface> SharedLedger<E> {
    pub fn new(ledger: Ledger<E>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(ledger)),
        }
    }

    /// Run a read-only query.
    pub fn read<R>(&self, f: impl FnOnce(&Ledger<E>) -> R) -> R {
        f(&self.inner.read())
    }

    /// Run one mutation.
    pub fn write<R>(&self, f: impl FnOnce(&mut Ledger<E>) -> R) -> R {
        f(&mut self.inner.write())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::escrow::InMemoryEscrow;
    use hubpay_protocol::config::NETWORK_ID_DEVNET;
    use hubpay_protocol::crypto::Keypair;

    struct Fixture {
        ledger: Ledger<InMemoryEscrow>,
        auditor: Address,
        user: Address,
        asset: Address,
    }

    fn fixture() -> Fixture {
        let provider = Keypair::from_seed(&[1u8; 32]);
        let auditor = Keypair::from_seed(&[2u8; 32]);
        let config = LedgerConfig::new(
            NETWORK_ID_DEVNET,
            Address::from_bytes([0xEE; 32]),
            provider.address(),
            auditor.address(),
            Keypair::from_seed(&[3u8; 32]).address(),
        );
        Fixture {
            ledger: Ledger::new(config, InMemoryEscrow::new()).unwrap(),
            auditor: auditor.address(),
            user: Keypair::from_seed(&[4u8; 32]).address(),
            asset: Address::from_bytes([0xA5; 32]),
        }
    }

    #[test]
    fn invalid_config_rejected() {
        let mut f = fixture();
        let mut config = f.ledger.config().clone();
        config.auditor = config.provider;
        assert!(matches!(
            Ledger::new(config, InMemoryEscrow::new()),
            Err(LedgerError::Config(_))
        ));
        // Fixture still usable.
        f.ledger.advance_to(1).unwrap();
    }

    #[test]
    fn only_auditor_opens_channels() {
        let mut f = fixture();
        let err = f
            .ledger
            .open_channel(&f.user, &f.user, &f.asset, 100)
            .unwrap_err();
        assert!(matches!(err, LedgerError::UnauthorizedSigner { .. }));
        assert!(f.ledger.channels().next().is_none());
    }

    #[test]
    fn open_channel_books_deposit() {
        let mut f = fixture();
        let id = f
            .ledger
            .open_channel(&f.auditor, &f.user, &f.asset, 100)
            .unwrap();
        let channel = f.ledger.channel(&id).unwrap();
        assert_eq!(channel.user_balance, 100);
        assert_eq!(channel.status, ChannelStatus::Open);
        assert_eq!(f.ledger.network(&f.asset).unwrap().user_total_deposit, 100);
        assert_eq!(f.ledger.escrow().custodied(&f.asset), 100);
        f.ledger.reconcile(&f.asset).unwrap();
    }

    #[test]
    fn user_deposits_accumulate_per_asset() {
        let mut f = fixture();
        let id = f
            .ledger
            .open_channel(&f.auditor, &f.user, &f.asset, 100)
            .unwrap();
        let other = Keypair::from_seed(&[5u8; 32]).address();
        f.ledger
            .open_channel(&f.auditor, &other, &f.asset, 40)
            .unwrap();
        assert_eq!(
            f.ledger.user_deposit(&f.auditor, &id, 25),
            Ok(ArrearsStatus::Empty)
        );
        let net = f.ledger.network(&f.asset).unwrap();
        assert_eq!(net.user_total_deposit, 165);
        assert_eq!(f.ledger.channel(&id).unwrap().deposit, 125);
        f.ledger.reconcile(&f.asset).unwrap();
    }

    #[test]
    fn duplicate_open_rejected() {
        let mut f = fixture();
        f.ledger
            .open_channel(&f.auditor, &f.user, &f.asset, 1)
            .unwrap();
        assert!(matches!(
            f.ledger.open_channel(&f.auditor, &f.user, &f.asset, 1),
            Err(LedgerError::ChannelAlreadyExists(_))
        ));
    }

    #[test]
    fn unknown_channel_is_empty() {
        let f = fixture();
        assert_eq!(f.ledger.channel_status(&[0u8; 32]), ChannelStatus::Empty);
    }

    #[test]
    fn height_never_moves_backwards() {
        let mut f = fixture();
        f.ledger.advance_to(10).unwrap();
        assert!(f.ledger.advance_to(9).is_err());
        assert_eq!(f.ledger.height(), 10);
    }

    #[test]
    fn fee_rate_needs_network() {
        let mut f = fixture();
        assert_eq!(
            f.ledger.set_fee_rate(&f.auditor, &f.asset, 10),
            Err(LedgerError::NetworkNotFound(f.asset))
        );
        f.ledger.provider_deposit(&f.auditor, &f.asset, 50).unwrap();
        f.ledger.set_fee_rate(&f.auditor, &f.asset, 10).unwrap();
        assert_eq!(f.ledger.network(&f.asset).unwrap().fee_rate, 10);
    }

    #[test]
    fn delegates_managed_by_auditor_only() {
        let mut f = fixture();
        let puppet = Keypair::from_seed(&[9u8; 32]).address();
        assert!(f.ledger.add_delegate(&f.user, &f.user, puppet).is_err());
        f.ledger.add_delegate(&f.auditor, &f.user, puppet).unwrap();
        assert!(f.ledger.is_authorized_signer(&f.user, &puppet));
        f.ledger
            .disable_delegate(&f.auditor, &f.user, &puppet)
            .unwrap();
        assert!(!f.ledger.is_authorized_signer(&f.user, &puppet));
    }

    #[test]
    fn shared_ledger_serializes_access() {
        let f = fixture();
        let auditor = f.auditor;
        let asset = f.asset;
        let shared = SharedLedger::new(f.ledger);
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let shared = shared.clone();
                std::thread::spawn(move || {
                    for _ in 0..25 {
                        shared
                            .write(|l| l.provider_deposit(&auditor, &asset, 1))
                            .unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let pool = shared.read(|l| l.network(&asset).map(|n| n.provider_balance));
        assert_eq!(pool, Ok(100));
    }
}
