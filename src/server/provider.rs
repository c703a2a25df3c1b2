//! Per-instance lease provider: the policy layer that turns register rounds
//! into lease acquisitions and renewals, under a clock-drift safety rule.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::consensus::{
    Ballot, BallotGenerator, Instance, Lease, LeaseConfiguration, LocalNode,
    ProviderConfig, RoundBasedRegister, TxOutcome,
};
use crate::utils::{Clock, SynleaseError};

use arc_swap::{ArcSwap, ArcSwapOption};

use bytes::Bytes;

/// What a `get_lease()` call ended up with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseOutcome {
    /// This node owns the returned lease.
    Acquired(Lease),

    /// Another node legitimately holds a live lease; nothing was written.
    HeldByOther(Lease),
}

impl LeaseOutcome {
    #[inline]
    pub fn lease(&self) -> &Lease {
        match self {
            LeaseOutcome::Acquired(lease) => lease,
            LeaseOutcome::HeldByOther(lease) => lease,
        }
    }

    #[inline]
    pub fn is_acquired(&self) -> bool {
        matches!(self, LeaseOutcome::Acquired(_))
    }

    pub fn into_lease(self) -> Lease {
        match self {
            LeaseOutcome::Acquired(lease) => lease,
            LeaseOutcome::HeldByOther(lease) => lease,
        }
    }
}

/// Lease provider of one instance.
///
/// The last known committed lease is cached together with the ballot it was
/// learned under; a cached lease that has not nominally expired is served
/// without any register round trip. The cache only moves forward in ballot
/// order, so concurrent callers finishing out of order never roll it back.
pub struct InstanceLeaseProvider {
    /// Instance this provider manages.
    instance: Instance,

    /// Replicated register holding the instance's lease.
    register: RoundBasedRegister,

    /// Ballot generator of this proposer for this instance.
    ballot_gen: BallotGenerator,

    /// Lease timing parameters.
    config: LeaseConfiguration,

    /// Identity of this node, proposer and lease owner.
    local_node: LocalNode,

    /// Local wall clock.
    clock: Arc<dyn Clock>,

    /// Max number of drift waits per acquisition.
    max_drift_retries: u32,

    /// No lease is issued before this instant.
    activation_at: SystemTime,

    /// Last known committed lease and the ballot it was learned under.
    last_known: ArcSwapOption<(Ballot, Lease)>,

    /// Payload to put into the next lease issued by this node.
    owner_payload: ArcSwap<Bytes>,
}

impl InstanceLeaseProvider {
    /// Creates the provider. With the startup guard on, leases are only
    /// issued once one full lease span has elapsed from now.
    pub fn new(
        instance: Instance,
        register: RoundBasedRegister,
        ballot_gen: BallotGenerator,
        local_node: LocalNode,
        config: &ProviderConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, SynleaseError> {
        config.validate()?;
        if local_node.socket_identity.is_empty() {
            return Err(SynleaseError::config("local node identity is empty"));
        }
        let lease_config = config.lease_config()?;

        let activation_at = if config.startup_guard {
            clock.now() + lease_config.max_lease_time_span
        } else {
            clock.now()
        };

        Ok(InstanceLeaseProvider {
            instance,
            register,
            ballot_gen,
            config: lease_config,
            local_node,
            clock,
            max_drift_retries: config.max_drift_retries,
            activation_at,
            last_known: ArcSwapOption::empty(),
            owner_payload: ArcSwap::from_pointee(Bytes::new()),
        })
    }

    #[inline]
    pub fn instance(&self) -> &Instance {
        &self.instance
    }

    #[inline]
    pub fn local_node(&self) -> &LocalNode {
        &self.local_node
    }

    #[inline]
    pub fn lease_config(&self) -> &LeaseConfiguration {
        &self.config
    }

    /// Time left until this provider may issue leases.
    pub fn activation_wait(&self) -> Duration {
        self.activation_at
            .duration_since(self.clock.now())
            .unwrap_or(Duration::ZERO)
    }

    /// Last known committed lease, valid or not.
    pub fn last_known_lease(&self) -> Option<Lease> {
        self.last_known.load().as_ref().map(|known| known.1.clone())
    }

    /// Returns the current lease of the instance, acquiring or renewing it
    /// for this node when possible. `owner_payload` replaces any payload
    /// recorded by an earlier caller and goes into the next lease this node
    /// issues.
    pub async fn get_lease(
        &self,
        owner_payload: Bytes,
    ) -> Result<LeaseOutcome, SynleaseError> {
        self.owner_payload.store(Arc::new(owner_payload));

        if let Some(lease) = self.cached_valid_lease(self.clock.now()) {
            return Ok(self.classify(lease));
        }

        let wait = self.activation_wait();
        if !wait.is_zero() {
            pf_debug!("{} waiting {:?} for activation", self.instance, wait);
            self.clock.sleep(wait).await;
        }

        self.read_or_renew_lease().await
    }

    fn cached_valid_lease(&self, now: SystemTime) -> Option<Lease> {
        match self.last_known.load().as_deref() {
            Some((_, lease)) if !lease.is_expired_at(now) => Some(lease.clone()),
            _ => None,
        }
    }

    fn classify(&self, lease: Lease) -> LeaseOutcome {
        if lease.is_owned_by(&self.local_node.socket_identity) {
            LeaseOutcome::Acquired(lease)
        } else {
            LeaseOutcome::HeldByOther(lease)
        }
    }

    /// Installs a lease into the cache unless something learned under a
    /// higher ballot is already there.
    fn cache_lease(&self, ballot: Ballot, lease: Lease) {
        let fresh = Arc::new((ballot, lease));
        self.last_known.rcu(|cached| match cached {
            Some(known) if known.0 >= fresh.0 => Some(known.clone()),
            _ => Some(fresh.clone()),
        });
    }

    fn round_aborted(
        &self,
        phase: &str,
        ballot: &Ballot,
        rejected_by: Option<Ballot>,
    ) -> SynleaseError {
        if let Some(higher) = rejected_by.as_ref() {
            self.ballot_gen.observe(higher);
        }
        SynleaseError::aborted(format!(
            "{} {} bal {} aborted{}",
            phase,
            self.instance,
            ballot,
            rejected_by
                .map(|b| format!(", preempted by {}", b))
                .unwrap_or_default()
        ))
    }

    /// Read-decide-write cycle against the register. A read lease that
    /// expired less than one clock drift ago may still be live on another
    /// node's clock; such a lease is waited out and the cycle restarts under
    /// a new ballot, at most `max_drift_retries` times.
    async fn read_or_renew_lease(&self) -> Result<LeaseOutcome, SynleaseError> {
        let local_id = &self.local_node.socket_identity;
        let mut drift_waits = 0;

        loop {
            let ballot = self.ballot_gen.next(local_id);
            let now = self.clock.now();

            let read = self.register.read(&ballot).await?;
            if read.outcome == TxOutcome::Abort {
                return Err(self.round_aborted("read", &ballot, read.rejected_by));
            }

            if let Some(lease) = read.lease.as_ref() {
                if lease.is_within_drift(now, self.config.clock_drift) {
                    if drift_waits >= self.max_drift_retries {
                        return Err(SynleaseError::aborted(format!(
                            "{} lease still within clock drift after {} waits",
                            self.instance, drift_waits
                        )));
                    }
                    drift_waits += 1;
                    pf_debug!(
                        "{} lease {} not safely expired, sleeping {:?}",
                        self.instance,
                        lease,
                        self.config.clock_drift
                    );
                    self.clock.sleep(self.config.clock_drift).await;
                    pf_debug!("{} awake after drift wait", self.instance);
                    continue;
                }

                if !lease.is_expired_at(now) && !lease.is_owned_by(local_id) {
                    pf_trace!("{} held by other: {}", self.instance, lease);
                    let lease = lease.clone();
                    self.cache_lease(ballot, lease.clone());
                    return Ok(LeaseOutcome::HeldByOther(lease));
                }
            }

            let prolonged = read.lease.is_some();
            let lease = Lease::new(
                local_id.clone(),
                now + self.config.max_lease_time_span,
                Bytes::clone(&self.owner_payload.load()),
            );

            let write = self.register.write(&ballot, &lease).await?;
            if write.outcome == TxOutcome::Abort {
                return Err(self.round_aborted(
                    "write",
                    &ballot,
                    write.rejected_by,
                ));
            }

            pf_debug!(
                "{} lease {} {}",
                self.instance,
                if prolonged { "prolonged" } else { "issued" },
                lease
            );
            self.cache_lease(ballot, lease.clone());
            return Ok(LeaseOutcome::Acquired(lease));
        }
    }
}

#[cfg(test)]
mod provider_tests {
    use super::*;
    use crate::consensus::testing::{test_lease, FakeAcceptor, FaultMode};
    use crate::consensus::AcceptorEndpoint;
    use crate::utils::{ManualClock, SkewedClock};
    use async_trait::async_trait;
    use std::time::UNIX_EPOCH;
    use tokio::time::Duration as TokioDuration;

    const SPAN: Duration = Duration::from_secs(5);
    const DRIFT: Duration = Duration::from_millis(200);

    fn config(startup_guard: bool) -> ProviderConfig {
        ProviderConfig {
            max_lease_ms: 5000,
            clock_drift_ms: 200,
            round_timeout_ms: 300,
            max_drift_retries: 3,
            startup_guard,
        }
    }

    fn fake_synod(n: usize) -> Vec<Arc<FakeAcceptor>> {
        (0..n).map(|id| Arc::new(FakeAcceptor::new(id))).collect()
    }

    fn total_calls(synod: &[Arc<FakeAcceptor>]) -> usize {
        synod.iter().map(|a| a.calls()).sum()
    }

    fn provider(
        node: &'static [u8],
        seed: u64,
        synod: &[Arc<FakeAcceptor>],
        clock: Arc<dyn Clock>,
        startup_guard: bool,
    ) -> Result<InstanceLeaseProvider, SynleaseError> {
        let acceptors = synod
            .iter()
            .map(|a| a.clone() as Arc<dyn AcceptorEndpoint>)
            .collect();
        let register = RoundBasedRegister::new(
            Instance::new("inst"),
            acceptors,
            TokioDuration::from_millis(300),
        )?;
        InstanceLeaseProvider::new(
            Instance::new("inst"),
            register,
            BallotGenerator::with_seed(seed),
            LocalNode::new(Bytes::from_static(node), "tcp://localhost"),
            &config(startup_guard),
            clock,
        )
    }

    fn payload(p: &'static str) -> Bytes {
        Bytes::from_static(p.as_bytes())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn acquire_fresh() -> Result<(), SynleaseError> {
        let synod = fake_synod(3);
        let clock = ManualClock::new();
        let x = provider(b"x", 0, &synod, Arc::new(clock.clone()), false)?;

        let outcome = x.get_lease(payload("p1")).await?;
        assert!(outcome.is_acquired());
        let lease = outcome.lease();
        assert!(lease.is_owned_by(b"x"));
        assert_eq!(lease.expires_at, clock.now() + SPAN);
        assert_eq!(lease.owner_payload, payload("p1"));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn other_holder_not_overwritten() -> Result<(), SynleaseError> {
        let synod = fake_synod(3);
        let clock = ManualClock::new();
        let x = provider(b"x", 0, &synod, Arc::new(clock.clone()), false)?;
        let y = provider(b"y", 1000, &synod, Arc::new(clock.clone()), false)?;

        let lease_x = x.get_lease(payload("p1")).await?.into_lease();
        clock.advance(Duration::from_secs(1));
        let outcome = y.get_lease(payload("p2")).await?;
        assert_eq!(outcome, LeaseOutcome::HeldByOther(lease_x.clone()));

        // x keeps serving its own lease
        clock.advance(Duration::from_secs(1));
        let again = x.get_lease(payload("p3")).await?;
        assert_eq!(again, LeaseOutcome::Acquired(lease_x));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn acquire_after_safe_expiry() -> Result<(), SynleaseError> {
        let synod = fake_synod(3);
        let clock = ManualClock::new();
        let x = provider(b"x", 0, &synod, Arc::new(clock.clone()), false)?;
        let y = provider(b"y", 1000, &synod, Arc::new(clock.clone()), false)?;

        x.get_lease(payload("p1")).await?;
        clock.advance(SPAN + DRIFT + Duration::from_millis(100));
        let outcome = y.get_lease(payload("p2")).await?;
        assert!(outcome.is_acquired());
        assert!(outcome.lease().is_owned_by(b"y"));
        assert_eq!(outcome.lease().owner_payload, payload("p2"));
        assert_eq!(clock.slept(), Duration::ZERO);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn drift_window_waited_out() -> Result<(), SynleaseError> {
        let synod = fake_synod(3);
        let clock = ManualClock::new();
        let x = provider(b"x", 0, &synod, Arc::new(clock.clone()), false)?;
        let y = provider(b"y", 1000, &synod, Arc::new(clock.clone()), false)?;

        let lease_x = x.get_lease(payload("p1")).await?.into_lease();
        clock.advance(SPAN + Duration::from_millis(100));
        let observed_at = clock.now();
        assert!(lease_x.is_within_drift(observed_at, DRIFT));

        let outcome = y.get_lease(payload("p2")).await?;
        assert!(outcome.is_acquired());
        assert_eq!(clock.slept(), DRIFT);
        assert_eq!(outcome.lease().expires_at, observed_at + DRIFT + SPAN);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn skewed_clocks_never_overlap() -> Result<(), SynleaseError> {
        let synod = fake_synod(3);
        let base = ManualClock::new();
        let clock_x = Arc::new(base.clone());
        let clock_y = Arc::new(SkewedClock::ahead_of(
            base.clone(),
            Duration::from_millis(150),
        ));
        let x = provider(b"x", 0, &synod, clock_x.clone(), false)?;
        let y = provider(b"y", 1000, &synod, clock_y.clone(), false)?;

        let lease_x = x.get_lease(payload("p1")).await?.into_lease();
        base.advance(SPAN - Duration::from_millis(100));
        // y thinks x's lease has lapsed while x still considers it live
        assert!(lease_x.is_expired_at(clock_y.now()));
        assert!(!lease_x.is_expired_at(clock_x.now()));

        let outcome = y.get_lease(payload("p2")).await?;
        assert!(outcome.is_acquired());
        assert!(base.slept() >= DRIFT);
        assert!(lease_x.is_expired_at(clock_x.now()));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cached_lease_fast_path() -> Result<(), SynleaseError> {
        let synod = fake_synod(3);
        let clock = ManualClock::new();
        let x = provider(b"x", 0, &synod, Arc::new(clock.clone()), false)?;

        let first = x.get_lease(payload("p1")).await?;
        let calls = total_calls(&synod);
        for _ in 0..5 {
            clock.advance(Duration::from_millis(500));
            let again = x.get_lease(payload("p2")).await?;
            assert_eq!(again, first);
        }
        assert_eq!(total_calls(&synod), calls);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn own_lease_renewed() -> Result<(), SynleaseError> {
        let synod = fake_synod(3);
        let clock = ManualClock::new();
        let x = provider(b"x", 0, &synod, Arc::new(clock.clone()), false)?;

        let first = x.get_lease(payload("p1")).await?.into_lease();
        clock.advance(SPAN + DRIFT + Duration::from_millis(1));
        let renewed = x.get_lease(payload("p4")).await?;
        assert!(renewed.is_acquired());
        assert!(renewed.lease().expires_at > first.expires_at);
        assert_eq!(renewed.lease().owner_payload, payload("p4"));
        assert_eq!(x.last_known_lease().as_ref(), Some(renewed.lease()));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn startup_guard_delays_issue() -> Result<(), SynleaseError> {
        let synod = fake_synod(3);
        let clock = ManualClock::new();
        let x = provider(b"x", 0, &synod, Arc::new(clock.clone()), true)?;
        assert_eq!(x.activation_wait(), SPAN);

        let outcome = x.get_lease(payload("p1")).await?;
        assert!(outcome.is_acquired());
        assert_eq!(clock.slept(), SPAN);
        assert_eq!(x.activation_wait(), Duration::ZERO);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn minority_unreachable() -> Result<(), SynleaseError> {
        let synod = fake_synod(3);
        synod[2].set_mode(FaultMode::Unreachable);
        let clock = ManualClock::new();
        let x = provider(b"x", 0, &synod, Arc::new(clock.clone()), false)?;

        let outcome = x.get_lease(payload("p1")).await?;
        assert!(outcome.is_acquired());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn majority_unreachable() -> Result<(), SynleaseError> {
        let synod = fake_synod(3);
        synod[0].set_mode(FaultMode::Unreachable);
        synod[1].set_mode(FaultMode::Silent);
        let clock = ManualClock::new();
        let x = provider(b"x", 0, &synod, Arc::new(clock.clone()), false)?;

        let res = x.get_lease(payload("p1")).await;
        assert!(matches!(res, Err(SynleaseError::RoundAborted(_))));
        assert!(x.last_known_lease().is_none());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn preempted_then_retry() -> Result<(), SynleaseError> {
        let synod = fake_synod(3);
        let clock = ManualClock::new();
        // y's ballots start far above x's
        let x = provider(b"x", 0, &synod, Arc::new(clock.clone()), false)?;
        let y = provider(b"y", 1000, &synod, Arc::new(clock.clone()), false)?;

        y.get_lease(payload("p2")).await?;
        clock.advance(SPAN + DRIFT + Duration::from_millis(1));
        let res = x.get_lease(payload("p1")).await;
        assert!(matches!(res, Err(SynleaseError::RoundAborted(_))));
        // the rejection taught x a higher ballot
        let outcome = x.get_lease(payload("p1")).await?;
        assert!(outcome.is_acquired());
        assert!(outcome.lease().is_owned_by(b"x"));
        Ok(())
    }

    /// Clock that never moves, even across sleeps.
    struct FrozenClock(SystemTime);

    #[async_trait]
    impl Clock for FrozenClock {
        fn now(&self) -> SystemTime {
            self.0
        }

        async fn sleep(&self, _dur: Duration) {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn drift_retries_capped() -> Result<(), SynleaseError> {
        let synod = fake_synod(3);
        let now = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let x = provider(b"x", 0, &synod, Arc::new(FrozenClock(now)), false)?;
        let acceptors = synod
            .iter()
            .map(|a| a.clone() as Arc<dyn AcceptorEndpoint>)
            .collect();
        let register = RoundBasedRegister::new(
            Instance::new("inst"),
            acceptors,
            TokioDuration::from_millis(300),
        )?;
        let stale = Lease::new(
            Bytes::from_static(b"z"),
            now - Duration::from_millis(50),
            Bytes::new(),
        );
        // written under a ballot below anything x generates
        let ballot = Ballot::new(0, Bytes::from_static(b"z"));
        register.write(&ballot, &stale).await?;

        let res = x.get_lease(payload("p1")).await;
        assert!(matches!(res, Err(SynleaseError::RoundAborted(_))));
        let read = register
            .read(&Ballot::new(u64::MAX, Bytes::from_static(b"z")))
            .await?;
        assert_eq!(read.lease, Some(stale));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cache_moves_forward_only() -> Result<(), SynleaseError> {
        let synod = fake_synod(3);
        let clock = ManualClock::new();
        let x = provider(b"x", 0, &synod, Arc::new(clock.clone()), false)?;
        let newer = test_lease(b"y", 1_000);
        let older = test_lease(b"z", 900);

        x.cache_lease(Ballot::new(7, Bytes::from_static(b"y")), newer.clone());
        x.cache_lease(Ballot::new(3, Bytes::from_static(b"z")), older.clone());
        assert_eq!(x.last_known_lease(), Some(newer));
        x.cache_lease(Ballot::new(8, Bytes::from_static(b"z")), older.clone());
        assert_eq!(x.last_known_lease(), Some(older));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_callers_one_provider() -> Result<(), SynleaseError> {
        let synod = fake_synod(3);
        let clock = ManualClock::new();
        let x = Arc::new(provider(
            b"x",
            0,
            &synod,
            Arc::new(clock.clone()),
            false,
        )?);

        let mut handles = vec![];
        for i in 0..8 {
            let x = x.clone();
            handles.push(tokio::spawn(async move {
                x.get_lease(Bytes::from(format!("p{}", i))).await
            }));
        }
        let mut acquired = vec![];
        for handle in handles {
            match handle.await? {
                Ok(outcome) => acquired.push(outcome),
                // callers racing on the same node may preempt each other
                Err(e) if e.is_retryable() => {}
                Err(e) => return Err(e),
            }
        }

        // the highest ballot among the callers is never preempted
        assert!(!acquired.is_empty());
        for outcome in acquired.iter() {
            assert!(outcome.is_acquired());
            assert!(outcome.lease().is_owned_by(b"x"));
            assert_eq!(outcome.lease().expires_at, clock.now() + SPAN);
        }
        let cached = x
            .last_known_lease()
            .ok_or_else(|| SynleaseError::msg("nothing cached"))?;
        assert!(acquired.iter().any(|o| *o.lease() == cached));

        let calls = total_calls(&synod);
        assert_eq!(x.get_lease(payload("p9")).await?.into_lease(), cached);
        assert_eq!(total_calls(&synod), calls);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_providers_never_overlap() -> Result<(), SynleaseError> {
        const ROUNDS: usize = 200;
        let synod = fake_synod(3);
        let clock = ManualClock::new();
        let owners: [&'static [u8]; 3] = [b"x", b"y", b"z"];

        let mut handles = vec![];
        for (i, owner) in owners.into_iter().enumerate() {
            let node = Arc::new(provider(
                owner,
                i as u64 * 7,
                &synod,
                Arc::new(clock.clone()),
                false,
            )?);
            let clock = clock.clone();
            handles.push(tokio::spawn(async move {
                let mut issued = vec![];
                for _ in 0..ROUNDS {
                    match node.get_lease(payload("p")).await {
                        Ok(LeaseOutcome::Acquired(lease)) => issued.push(lease),
                        Ok(LeaseOutcome::HeldByOther(_)) => {}
                        Err(e) if e.is_retryable() => {}
                        Err(e) => return Err(e),
                    }
                    clock.advance(Duration::from_millis(700));
                    tokio::task::yield_now().await;
                }
                Ok::<_, SynleaseError>(issued)
            }));
        }

        let mut leases = vec![];
        for handle in handles {
            leases.extend(handle.await??);
        }
        assert!(!leases.is_empty());

        // every lease is issued at `expires_at - SPAN`; a lease of another
        // owner must not be issued before an earlier one has expired
        for a in leases.iter() {
            for b in leases.iter() {
                if a.owner_identity == b.owner_identity
                    || a.expires_at > b.expires_at
                {
                    continue;
                }
                assert!(
                    b.expires_at - SPAN >= a.expires_at,
                    "leases {} and {} overlap",
                    a,
                    b
                );
            }
        }
        Ok(())
    }
}
