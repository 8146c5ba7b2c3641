//! Shared fixtures for the ledger integration tests.
//!
//! Keys are seeded, so every run signs the same bytes.

#![allow(dead_code)]

use hubpay_contracts::proposal::rebalance_digest;
use hubpay_contracts::{
    ArrearsStatus, InMemoryEscrow, Ledger, LedgerResult, TransferOutcome,
};
use hubpay_protocol::config::{LedgerConfig, NETWORK_ID_TESTNET};
use hubpay_protocol::crypto::{transfer_digest, Address, Hash32, Keypair, Signature};

pub const LEDGER: Address = Address::from_bytes([0xEE; 32]);
pub const ASSET: Address = Address::from_bytes([0xA5; 32]);

pub struct Harness {
    pub ledger: Ledger<InMemoryEscrow>,
    pub provider: Keypair,
    pub auditor: Keypair,
    pub consignor: Keypair,
    pub user: Keypair,
    pub channel: Hash32,
}

pub fn config(provider: &Keypair, auditor: &Keypair, consignor: &Keypair) -> LedgerConfig {
    LedgerConfig::new(
        NETWORK_ID_TESTNET,
        LEDGER,
        provider.address(),
        auditor.address(),
        consignor.address(),
    )
}

impl Harness {
    /// A ledger with no channels yet.
    pub fn empty() -> Self {
        let provider = Keypair::from_seed(&[1u8; 32]);
        let auditor = Keypair::from_seed(&[2u8; 32]);
        let consignor = Keypair::from_seed(&[3u8; 32]);
        let user = Keypair::from_seed(&[4u8; 32]);
        let ledger = Ledger::new(
            config(&provider, &auditor, &consignor),
            InMemoryEscrow::new(),
        )
        .unwrap();
        let channel = ledger.channel_id_for(&user.address(), &ASSET);
        Self {
            ledger,
            provider,
            auditor,
            consignor,
            user,
            channel,
        }
    }

    /// An open channel with `user_deposit`, and `pool` in the provider's pool.
    pub fn with_channel(user_deposit: u64, pool: u64) -> Self {
        let mut h = Self::empty();
        let auditor = h.auditor.address();
        if pool > 0 {
            h.ledger.provider_deposit(&auditor, &ASSET, pool).unwrap();
        }
        let id = h
            .ledger
            .open_channel(&auditor, &h.user.address(), &ASSET, user_deposit)
            .unwrap();
        assert_eq!(id, h.channel);
        h
    }

    pub fn auditor_addr(&self) -> Address {
        self.auditor.address()
    }

    pub fn provider_addr(&self) -> Address {
        self.provider.address()
    }

    pub fn user_addr(&self) -> Address {
        self.user.address()
    }

    pub fn sign_transfer(&self, signer: &Keypair, balance: u64, nonce: u64) -> Signature {
        let digest = transfer_digest(
            self.ledger.domain(),
            &self.channel,
            balance,
            nonce,
            &self.channel,
        );
        signer.sign(&digest)
    }

    /// User pays, signing directly. `balance` is cumulative.
    pub fn user_pays(&mut self, balance: u64, nonce: u64, amount: u64) -> LedgerResult<TransferOutcome> {
        let sig = self.sign_transfer(&self.user, balance, nonce);
        let (payer, id) = (self.user_addr(), self.channel);
        self.ledger
            .transfer(&payer, &id, balance, nonce, amount, id, sig)
    }

    /// Provider pays. `balance` is cumulative.
    pub fn provider_pays(&mut self, balance: u64, nonce: u64, amount: u64) -> LedgerResult<TransferOutcome> {
        let sig = self.sign_transfer(&self.provider, balance, nonce);
        let (payer, id) = (self.provider_addr(), self.channel);
        self.ledger
            .transfer(&payer, &id, balance, nonce, amount, id, sig)
    }

    pub fn rebalance_sigs(&self, amount: u64, nonce: u64) -> (Hash32, Signature, Signature) {
        let digest = rebalance_digest(&LEDGER, &self.channel, amount, nonce);
        (digest, self.provider.sign(&digest), self.auditor.sign(&digest))
    }

    pub fn propose_rebalance(&mut self, amount: u64, nonce: u64) -> LedgerResult<Hash32> {
        let (_, provider_sig, _) = self.rebalance_sigs(amount, nonce);
        let (caller, id) = (self.provider_addr(), self.channel);
        self.ledger
            .propose_rebalance(&caller, &id, amount, nonce, provider_sig)
    }

    pub fn confirm_rebalance(&mut self, digest: &Hash32) -> LedgerResult<ArrearsStatus> {
        let sig = self.auditor.sign(digest);
        let caller = self.auditor_addr();
        self.ledger.confirm_rebalance(&caller, digest, sig)
    }

    /// Propose and confirm a rebalance to cumulative `amount`.
    pub fn rebalance(&mut self, amount: u64, nonce: u64) -> LedgerResult<ArrearsStatus> {
        let digest = self.propose_rebalance(amount, nonce)?;
        self.confirm_rebalance(&digest)
    }

    pub fn channel_total(&self) -> u64 {
        self.ledger.channel(&self.channel).unwrap().total().unwrap()
    }
}
