//! Bridge orchestrator - drives transfers through lock, prove and mint
//!
//! This module provides:
//! - Intake and validation of bridge requests
//! - A per-transfer driver holding the transfer's async mutex for its whole run
//! - Idempotent minting keyed on the source lock
//! - The refund path for failures after lock, with a pre-refund mint check
//! - A sweep that recovers transfers stuck past the refund timeout

use super::transfer::{BridgeRequest, BridgeStatus, BridgeTransfer};
use crate::adapter::{LockReceipt, LockRequest, MintReceipt, MintRequest};
use crate::config::BridgeConfig;
use crate::error::{AdapterError, BridgeError};
use crate::events::{EventBus, RelayEvent, TransferEvent, TransferEventKind};
use crate::fallback::{call_with_timeout, RetryPolicy};
use crate::metrics;
use crate::model::{Amount, Capability, ChainId};
use crate::quorum::ValidatorQuorum;
use crate::registry::AdapterRegistry;
use crate::state::StateStore;

use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Outcome of one sweep pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub examined: usize,
    pub recovered: usize,
    pub skipped_busy: usize,
}

pub struct BridgeOrchestrator {
    registry: Arc<AdapterRegistry>,
    quorum: Arc<ValidatorQuorum>,
    store: Arc<dyn StateStore>,
    events: EventBus,
    retry: RetryPolicy,
    config: BridgeConfig,
    drivers: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl BridgeOrchestrator {
    pub fn new(
        registry: Arc<AdapterRegistry>,
        quorum: Arc<ValidatorQuorum>,
        store: Arc<dyn StateStore>,
        events: EventBus,
        retry: RetryPolicy,
        config: BridgeConfig,
    ) -> Self {
        Self {
            registry,
            quorum,
            store,
            events,
            retry,
            config,
            drivers: DashMap::new(),
        }
    }

    pub fn quorum(&self) -> &Arc<ValidatorQuorum> {
        &self.quorum
    }

    /// Validate and persist a new transfer in `REQUESTED`.
    #[instrument(skip(self, request), fields(source = %request.source_chain, target = %request.target_chain))]
    pub async fn request(&self, request: BridgeRequest) -> Result<BridgeTransfer, BridgeError> {
        request.validate()?;
        self.require_chain(&request.source_chain, Capability::Lock).await?;
        self.require_chain(&request.target_chain, Capability::Mint).await?;

        if let Some(bridge_id) = request.bridge_id {
            if let Some(existing) = self.load(bridge_id).await? {
                if existing.source_chain != request.source_chain
                    || existing.target_chain != request.target_chain
                    || existing.amount != request.amount
                {
                    return Err(BridgeError::InvalidRequest(format!(
                        "bridge id {} is already used by a different transfer",
                        bridge_id
                    )));
                }
                return Ok(existing);
            }
        }

        let transfer = BridgeTransfer::new(request);
        self.persist(&transfer).await?;
        metrics::record_bridge_transition(BridgeStatus::Requested.as_str());
        info!(
            bridge_id = %transfer.bridge_id,
            "Bridge transfer requested: {} from {} to {}",
            transfer.amount, transfer.source_chain, transfer.target_chain
        );
        Ok(transfer)
    }

    /// Request a transfer and drive it to a terminal state.
    pub async fn execute(&self, request: BridgeRequest) -> Result<BridgeTransfer, BridgeError> {
        let transfer = self.request(request).await?;
        self.drive(transfer.bridge_id).await
    }

    /// Cancel a transfer that has not started locking.
    pub async fn cancel(&self, bridge_id: Uuid) -> Result<BridgeTransfer, BridgeError> {
        let driver = self.driver(bridge_id);
        let _held = driver.lock().await;

        let mut transfer = self
            .load(bridge_id)
            .await?
            .ok_or(BridgeError::NotFound(bridge_id))?;
        if transfer.status != BridgeStatus::Requested {
            return Err(BridgeError::NotCancellable {
                bridge_id,
                status: transfer.status.to_string(),
            });
        }
        self.transition(&mut transfer, BridgeStatus::Failed, Some("cancelled".to_string()))
            .await?;
        self.release_driver(&transfer);
        Ok(transfer)
    }

    pub async fn get(&self, bridge_id: Uuid) -> Result<BridgeTransfer, BridgeError> {
        self.load(bridge_id)
            .await?
            .ok_or(BridgeError::NotFound(bridge_id))
    }

    /// Drive a transfer until it is terminal or parked for the sweep.
    ///
    /// Only one driver runs per bridge id. Past the lock, every failure ends
    /// in `MINTED` (the mint landed after all) or on the refund path.
    #[instrument(skip(self))]
    pub async fn drive(&self, bridge_id: Uuid) -> Result<BridgeTransfer, BridgeError> {
        let driver = self.driver(bridge_id);
        let _held = driver.lock().await;

        let mut transfer = self
            .load(bridge_id)
            .await?
            .ok_or(BridgeError::NotFound(bridge_id))?;
        self.run(&mut transfer).await;
        self.release_driver(&transfer);
        Ok(transfer)
    }

    async fn run(&self, transfer: &mut BridgeTransfer) {
        if transfer.is_terminal() {
            return;
        }

        let advanced = match tokio::time::timeout(self.config.lifecycle_cap(), self.advance(transfer)).await {
            Ok(result) => result,
            Err(_) => Err(BridgeError::LifecycleExpired {
                bridge_id: transfer.bridge_id,
            }),
        };

        if let Err(e) = advanced {
            warn!(bridge_id = %transfer.bridge_id, "Bridge transfer failed in {}: {}", transfer.status, e);
            self.fail(transfer, &e).await;
        }
        self.recover(transfer).await;
    }

    /// Walk the happy path from wherever the transfer currently is.
    async fn advance(&self, transfer: &mut BridgeTransfer) -> Result<(), BridgeError> {
        loop {
            match transfer.status {
                BridgeStatus::Requested => {
                    self.transition(transfer, BridgeStatus::Locking, None).await?;
                }
                BridgeStatus::Locking => self.lock(transfer).await?,
                BridgeStatus::Locked => {
                    self.transition(transfer, BridgeStatus::Proving, None).await?;
                }
                BridgeStatus::Proving => self.prove(transfer).await?,
                BridgeStatus::Proven => {
                    self.transition(transfer, BridgeStatus::Minting, None).await?;
                }
                BridgeStatus::Minting => self.mint(transfer).await?,
                BridgeStatus::Minted
                | BridgeStatus::Failed
                | BridgeStatus::Refunding
                | BridgeStatus::Refunded => return Ok(()),
            }
        }
    }

    async fn lock(&self, transfer: &mut BridgeTransfer) -> Result<(), BridgeError> {
        let bridge_id = transfer.bridge_id;
        let source = transfer.source_chain.clone();
        let (adapter, _guard) = self
            .registry
            .acquire(&source)
            .map_err(|e| BridgeError::LockFailed {
                bridge_id,
                source: AdapterError::Unreachable {
                    chain_id: source.clone(),
                    message: e.to_string(),
                },
            })?;

        // the adapter's lock is idempotent per bridge id, so retries and
        // resumed drivers get the original lock back
        let request = LockRequest {
            bridge_id,
            owner: transfer.owner.clone(),
            amount: transfer.amount,
        };
        let (result, attempts) = self
            .retry
            .run("lock", |_| {
                let adapter = adapter.clone();
                let (source, request) = (&source, &request);
                async move {
                    let result =
                        call_with_timeout(source, "lock", self.config.call_timeout(), adapter.lock(request))
                            .await;
                    self.registry.record_call(source, result.is_ok()).await;
                    result
                }
            })
            .await;

        let receipt = result.map_err(|e| BridgeError::LockFailed { bridge_id, source: e })?;
        debug!(bridge_id = %bridge_id, "Locked {} on chain {} after {} attempts", receipt.amount, source, attempts);
        transfer.record_lock(receipt.lock_ref, receipt.amount);
        self.transition(transfer, BridgeStatus::Locked, None).await
    }

    async fn prove(&self, transfer: &mut BridgeTransfer) -> Result<(), BridgeError> {
        let bridge_id = transfer.bridge_id;
        let claim = transfer.claim().ok_or_else(|| BridgeError::ProofRejected {
            bridge_id,
            reason: "transfer holds no lock".to_string(),
        })?;

        let proof = self.quorum.collect(&claim, self.config.quorum_timeout()).await?;
        let signers = proof.verify(&self.quorum.validator_set())?;

        transfer.attestations.extend(proof.attestations.iter().cloned());
        transfer.proof = Some(proof);
        self.transition(
            transfer,
            BridgeStatus::Proven,
            Some(format!("{} validator signatures", signers)),
        )
        .await
    }

    async fn mint(&self, transfer: &mut BridgeTransfer) -> Result<(), BridgeError> {
        let bridge_id = transfer.bridge_id;
        let target = transfer.target_chain.clone();
        let mint_failed = |source: AdapterError| BridgeError::MintFailed { bridge_id, source };

        let (Some(key), Some(proof)) = (transfer.idempotency_key.clone(), transfer.proof.clone()) else {
            return Err(mint_failed(AdapterError::Rejected {
                chain_id: target,
                reason: "transfer has no proof to mint against".to_string(),
            }));
        };
        let (adapter, _guard) = self.registry.acquire(&target).map_err(|e| {
            mint_failed(AdapterError::Unreachable {
                chain_id: target.clone(),
                message: e.to_string(),
            })
        })?;

        let request = MintRequest {
            idempotency_key: key,
            bridge_id,
            recipient: transfer.recipient.clone(),
            amount: transfer.locked_amount,
            proof,
        };
        let (result, attempts) = self
            .retry
            .run("mint", |_| {
                let adapter = adapter.clone();
                let (target, request) = (&target, &request);
                async move {
                    let result =
                        call_with_timeout(target, "mint", self.config.call_timeout(), adapter.mint(request))
                            .await;
                    self.registry.record_call(target, result.is_ok()).await;
                    result
                }
            })
            .await;

        let receipt = result.map_err(mint_failed)?;
        if receipt.replayed {
            info!(bridge_id = %bridge_id, "Mint {} was already applied on chain {}", receipt.mint_ref, target);
        }
        debug!(bridge_id = %bridge_id, "Minted on chain {} after {} attempts", target, attempts);
        self.apply_mint(transfer, receipt, None).await
    }

    async fn apply_mint(
        &self,
        transfer: &mut BridgeTransfer,
        receipt: MintReceipt,
        detail: Option<String>,
    ) -> Result<(), BridgeError> {
        transfer.minted_amount = receipt.amount;
        transfer.mint_ref = Some(receipt.mint_ref);
        self.transition(transfer, BridgeStatus::Minted, detail).await
    }

    async fn fail(&self, transfer: &mut BridgeTransfer, cause: &BridgeError) {
        if !transfer.status.can_transition(BridgeStatus::Failed) {
            return;
        }
        if let Err(e) = self
            .transition(transfer, BridgeStatus::Failed, Some(cause.to_string()))
            .await
        {
            error!(bridge_id = %transfer.bridge_id, "Could not record failure: {}", e);
        }
    }

    /// Settle a failed transfer that holds a lock: either the mint landed
    /// after all, or the lock is refunded. A transfer that failed mid-lock is
    /// first reconciled against the source ledger. Leaves the transfer in
    /// `FAILED` or `REFUNDING` when the ledgers cannot be reached, for the
    /// sweep to retry.
    async fn recover(&self, transfer: &mut BridgeTransfer) {
        let bridge_id = transfer.bridge_id;

        if transfer.status == BridgeStatus::Failed && transfer.lock_unresolved {
            match self.find_source_lock(transfer).await {
                Ok(Some(receipt)) => {
                    info!(bridge_id = %bridge_id, "Lock {} landed after all; refunding", receipt.lock_ref);
                    transfer.record_lock(receipt.lock_ref, receipt.amount);
                }
                Ok(None) => {
                    debug!(bridge_id = %bridge_id, "No lock on {}; failure is final", transfer.source_chain);
                    transfer.resolve_without_lock();
                }
                Err(e) => {
                    warn!(bridge_id = %bridge_id, "Cannot rule out a landed lock, deferred: {}", e);
                    return;
                }
            }
            if let Err(e) = self.persist(transfer).await {
                error!(bridge_id = %bridge_id, "{}", e);
                return;
            }
        }

        if transfer.status == BridgeStatus::Failed && transfer.has_lock() {
            match self.find_landed_mint(transfer).await {
                Ok(Some(receipt)) => {
                    info!(bridge_id = %bridge_id, "Mint {} already landed; not refunding", receipt.mint_ref);
                    if let Err(e) = self
                        .apply_mint(transfer, receipt, Some("mint found on target".to_string()))
                        .await
                    {
                        error!(bridge_id = %bridge_id, "Could not record landed mint: {}", e);
                    }
                    return;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(bridge_id = %bridge_id, "Cannot rule out a landed mint, refund deferred: {}", e);
                    return;
                }
            }
            if let Err(e) = self.transition(transfer, BridgeStatus::Refunding, None).await {
                error!(bridge_id = %bridge_id, "Could not start refund: {}", e);
                return;
            }
        }

        if transfer.status == BridgeStatus::Refunding {
            if let Err(e) = self.refund(transfer).await {
                error!(bridge_id = %bridge_id, "Refund failed, will retry on sweep: {}", e);
                transfer.last_error = Some(e.to_string());
                if let Err(e) = self.persist(transfer).await {
                    error!(bridge_id = %bridge_id, "{}", e);
                }
            }
        }
    }

    /// Looks for a mint under the transfer's idempotency key. An unreachable
    /// target is an error, never `None`.
    async fn find_landed_mint(&self, transfer: &BridgeTransfer) -> Result<Option<MintReceipt>, AdapterError> {
        let Some(key) = transfer.idempotency_key.as_deref() else {
            return Ok(None);
        };
        let target = &transfer.target_chain;
        let adapter = self.registry.adapter(target).ok_or_else(|| AdapterError::Unreachable {
            chain_id: target.clone(),
            message: "chain is not registered".to_string(),
        })?;
        call_with_timeout(target, "find_mint", self.config.call_timeout(), adapter.find_mint(key)).await
    }

    /// Looks for a lock taken under the transfer's bridge id. An unreachable
    /// source is an error, never `None`.
    async fn find_source_lock(&self, transfer: &BridgeTransfer) -> Result<Option<LockReceipt>, AdapterError> {
        let source = &transfer.source_chain;
        let adapter = self.registry.adapter(source).ok_or_else(|| AdapterError::Unreachable {
            chain_id: source.clone(),
            message: "chain is not registered".to_string(),
        })?;
        call_with_timeout(
            source,
            "find_lock",
            self.config.call_timeout(),
            adapter.find_lock(transfer.bridge_id),
        )
        .await
    }

    async fn refund(&self, transfer: &mut BridgeTransfer) -> Result<(), BridgeError> {
        let bridge_id = transfer.bridge_id;
        let source = transfer.source_chain.clone();
        let refund_failed = |source: AdapterError| BridgeError::RefundFailed { bridge_id, source };

        let Some(lock_ref) = transfer.lock_ref.clone() else {
            return Err(refund_failed(AdapterError::Rejected {
                chain_id: source,
                reason: "no lock to refund".to_string(),
            }));
        };
        // refunds go through even while the source chain drains
        let adapter = self.registry.adapter(&source).ok_or_else(|| {
            refund_failed(AdapterError::Unreachable {
                chain_id: source.clone(),
                message: "chain is not registered".to_string(),
            })
        })?;

        let (result, _) = self
            .retry
            .run("refund", |_| {
                let adapter = adapter.clone();
                let (source, lock_ref) = (&source, lock_ref.as_str());
                async move {
                    let result =
                        call_with_timeout(source, "refund", self.config.call_timeout(), adapter.refund(lock_ref))
                            .await;
                    self.registry.record_call(source, result.is_ok()).await;
                    result
                }
            })
            .await;

        let receipt = result.map_err(refund_failed)?;
        transfer.refunded_amount = receipt.amount;
        self.transition(transfer, BridgeStatus::Refunded, None).await
    }

    /// Recover transfers that no driver is moving: in-flight ones idle past
    /// the refund timeout, and failed or refunding ones that may still hold
    /// a lock.
    pub async fn sweep(&self) -> Result<SweepReport, BridgeError> {
        let active = self
            .store
            .active_transfers()
            .await
            .map_err(|e| BridgeError::Persistence(e.to_string()))?;
        let refund_timeout = chrono::Duration::from_std(self.config.refund_timeout())
            .unwrap_or_else(|_| chrono::Duration::hours(1));
        let now = Utc::now();

        let mut report = SweepReport::default();
        for stale in active {
            let stuck = stale.status.is_in_flight() && stale.idle_for(now) > refund_timeout;
            let parked = matches!(stale.status, BridgeStatus::Failed | BridgeStatus::Refunding);
            if !stuck && !parked {
                continue;
            }
            report.examined += 1;

            let driver = self.driver(stale.bridge_id);
            let Ok(_held) = driver.try_lock() else {
                report.skipped_busy += 1;
                continue;
            };
            // re-read under the driver lock
            let Some(mut transfer) = self.load(stale.bridge_id).await? else {
                continue;
            };
            if transfer.status.is_in_flight() {
                let cause = BridgeError::LifecycleExpired {
                    bridge_id: transfer.bridge_id,
                };
                self.fail(&mut transfer, &cause).await;
            }
            self.recover(&mut transfer).await;
            if transfer.is_terminal() {
                report.recovered += 1;
            }
            drop(_held);
            self.release_driver(&transfer);
        }

        if report.examined > 0 {
            info!(
                "Bridge sweep examined {} transfers, recovered {}, {} busy",
                report.examined, report.recovered, report.skipped_busy
            );
        }
        Ok(report)
    }

    async fn transition(
        &self,
        transfer: &mut BridgeTransfer,
        to: BridgeStatus,
        detail: Option<String>,
    ) -> Result<(), BridgeError> {
        let from = transfer.transition(to, detail.clone())?;
        let at = transfer.updated_at;
        metrics::record_bridge_transition(to.as_str());
        info!(bridge_id = %transfer.bridge_id, "Bridge transfer {} -> {}", from, to);

        self.events.publish(RelayEvent::StatusChanged {
            bridge_id: transfer.bridge_id,
            from,
            to,
            at,
        });
        if let Some((kind, amount)) = outbound(transfer, to) {
            self.events.publish(RelayEvent::Transfer(TransferEvent {
                kind,
                bridge_id: transfer.bridge_id,
                source_chain: transfer.source_chain.clone(),
                target_chain: transfer.target_chain.clone(),
                amount,
                at,
                detail,
            }));
        }
        self.persist(transfer).await
    }

    async fn require_chain(&self, chain_id: &ChainId, capability: Capability) -> Result<(), BridgeError> {
        let chain = self
            .registry
            .get(chain_id)
            .ok_or_else(|| BridgeError::InvalidRequest(format!("chain {} is not registered", chain_id)))?;
        if chain.is_draining() {
            return Err(BridgeError::InvalidRequest(format!("chain {} is draining", chain_id)));
        }
        if !chain.descriptor().await.supports(capability) {
            return Err(BridgeError::InvalidRequest(format!(
                "chain {} does not support {}",
                chain_id, capability
            )));
        }
        Ok(())
    }

    async fn load(&self, bridge_id: Uuid) -> Result<Option<BridgeTransfer>, BridgeError> {
        self.store
            .get_transfer(bridge_id)
            .await
            .map_err(|e| BridgeError::Persistence(e.to_string()))
    }

    async fn persist(&self, transfer: &BridgeTransfer) -> Result<(), BridgeError> {
        self.store
            .save_transfer(transfer)
            .await
            .map_err(|e| BridgeError::Persistence(e.to_string()))
    }

    fn driver(&self, bridge_id: Uuid) -> Arc<Mutex<()>> {
        self.drivers.entry(bridge_id).or_default().clone()
    }

    fn release_driver(&self, transfer: &BridgeTransfer) {
        if transfer.is_terminal() {
            self.drivers.remove(&transfer.bridge_id);
            self.quorum.forget(transfer.bridge_id);
        }
    }
}

/// Outbound event for a status, with the amount it concerns.
fn outbound(transfer: &BridgeTransfer, status: BridgeStatus) -> Option<(TransferEventKind, Amount)> {
    match status {
        BridgeStatus::Locked => Some((TransferEventKind::Locked, transfer.locked_amount)),
        BridgeStatus::Proven => Some((TransferEventKind::Proven, transfer.locked_amount)),
        BridgeStatus::Minted => Some((TransferEventKind::Minted, transfer.minted_amount)),
        BridgeStatus::Failed => Some((TransferEventKind::Failed, transfer.amount)),
        BridgeStatus::Refunded => Some((TransferEventKind::Refunded, transfer.refunded_amount)),
        _ => None,
    }
}
