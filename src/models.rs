//! Core data model for the mempool intelligence pipeline
//!
//! Everything that flows between subsystems lives here: raw observations,
//! canonical pending transactions, fingerprints, opportunities with their
//! execution plans, bundle lifecycle state and outcome records.

use std::fmt;
use std::time::Duration;

use alloy_primitives::{Address, Bytes, B256, U256};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::clock::MonoTime;

/// Opaque, non-guessable tag identifying one upstream source.
///
/// The random component keeps sources from being enumerable across the
/// control plane while the label keeps logs readable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceId {
    label: String,
    tag: u64,
}

impl SourceId {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            tag: rand::random(),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{:08x}", self.label, self.tag as u32)
    }
}

/// Raw transaction shape as JSON-RPC providers emit it.
/// Quantities arrive as 0x-hex; `alloy` handles the decoding.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawTransaction {
    pub hash: B256,
    pub from: Address,
    pub to: Option<Address>,
    #[serde(default)]
    pub value: U256,
    pub gas: U256,
    #[serde(default)]
    pub gas_price: Option<U256>,
    #[serde(default)]
    pub max_fee_per_gas: Option<U256>,
    #[serde(default)]
    pub max_priority_fee_per_gas: Option<U256>,
    pub nonce: U256,
    pub input: Bytes,
}

/// What a source adapter actually saw. Some subscriptions only emit hashes;
/// the normalizer hydrates those before canonicalizing.
#[derive(Debug, Clone)]
pub enum ObservationPayload {
    HashOnly,
    Raw(Box<RawTransaction>),
    Canonical(Box<PendingTx>),
}

/// One mempool sighting, as delivered by a source adapter.
#[derive(Debug, Clone)]
pub struct PendingObservation {
    pub chain: u32,
    pub hash: B256,
    pub payload: ObservationPayload,
    pub source: SourceId,
    pub seen_at: MonoTime,
}

/// Gas pricing: a transaction carries either a legacy price or the
/// EIP-1559 pair, never both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum GasPricing {
    Legacy { gas_price: u128 },
    Eip1559 { max_fee: u128, priority_fee: u128 },
}

impl GasPricing {
    /// Upper bound the sender is willing to pay per gas unit.
    pub fn price_ceiling(&self) -> u128 {
        match self {
            GasPricing::Legacy { gas_price } => *gas_price,
            GasPricing::Eip1559 { max_fee, .. } => *max_fee,
        }
    }

    pub fn priority_fee(&self) -> Option<u128> {
        match self {
            GasPricing::Legacy { .. } => None,
            GasPricing::Eip1559 { priority_fee, .. } => Some(*priority_fee),
        }
    }
}

/// Canonical representation of a live mempool transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingTx {
    pub hash: B256,
    pub chain: u32,
    pub from: Address,
    pub to: Option<Address>,
    pub value: U256,
    pub gas_limit: u64,
    pub pricing: Option<GasPricing>,
    pub nonce: u64,
    pub input: Bytes,
    pub first_seen: MonoTime,
    pub last_seen: MonoTime,
    pub source: SourceId,
}

impl PendingTx {
    pub fn from_raw(raw: RawTransaction, chain: u32, source: SourceId, seen_at: MonoTime) -> Self {
        let pricing = match (raw.gas_price, raw.max_fee_per_gas) {
            // Some providers echo gasPrice alongside the 1559 pair; the
            // 1559 fields win so the exclusivity invariant holds.
            (_, Some(max_fee)) => Some(GasPricing::Eip1559 {
                max_fee: max_fee.saturating_to(),
                priority_fee: raw
                    .max_priority_fee_per_gas
                    .map(|p| p.saturating_to())
                    .unwrap_or(0),
            }),
            (Some(gas_price), None) => Some(GasPricing::Legacy {
                gas_price: gas_price.saturating_to(),
            }),
            (None, None) => None,
        };

        Self {
            hash: raw.hash,
            chain,
            from: raw.from,
            to: raw.to,
            value: raw.value,
            gas_limit: raw.gas.saturating_to(),
            pricing,
            nonce: raw.nonce.saturating_to(),
            input: raw.input,
            first_seen: seen_at,
            last_seen: seen_at,
            source,
        }
    }

    /// Record a repeat sighting; `last_seen` only ever moves forward.
    pub fn observe_again(&mut self, seen_at: MonoTime) {
        if seen_at > self.last_seen {
            self.last_seen = seen_at;
        }
    }

    /// First four bytes of the input payload, if any.
    pub fn selector(&self) -> Option<[u8; 4]> {
        if self.input.len() >= 4 {
            let mut sel = [0u8; 4];
            sel.copy_from_slice(&self.input[..4]);
            Some(sel)
        } else {
            None
        }
    }

    pub fn is_deployment(&self) -> bool {
        self.to.is_none() && !self.input.is_empty()
    }

    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::compute(self.chain, self.from, self.nonce, &self.input, self.to)
    }
}

/// Stable 16-byte hash collapsing semantically equivalent transactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fingerprint(pub [u8; 16]);

impl Fingerprint {
    /// SHA-256(chain_id || sender || nonce || input[..4] || recipient-or-zero),
    /// truncated to 16 bytes. Missing selector bytes hash as zeros so short
    /// payloads still fingerprint deterministically.
    pub fn compute(
        chain: u32,
        sender: Address,
        nonce: u64,
        input: &[u8],
        to: Option<Address>,
    ) -> Self {
        let mut selector = [0u8; 4];
        let take = input.len().min(4);
        selector[..take].copy_from_slice(&input[..take]);

        let mut hasher = Sha256::new();
        hasher.update(chain.to_be_bytes());
        hasher.update(sender.as_slice());
        hasher.update(nonce.to_be_bytes());
        hasher.update(selector);
        hasher.update(to.unwrap_or(Address::ZERO).as_slice());

        let digest = hasher.finalize();
        let mut out = [0u8; 16];
        out.copy_from_slice(&digest[..16]);
        Self(out)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Fixed set of strategy kinds. External plug-ins enter through the sandbox
/// boundary, never through this enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    FlashArb,
    Sandwich,
    Liquidation,
    CrosschainArb,
    OracleDeviation,
    Governance,
}

impl StrategyKind {
    pub const ALL: [StrategyKind; 6] = [
        StrategyKind::FlashArb,
        StrategyKind::Sandwich,
        StrategyKind::Liquidation,
        StrategyKind::CrosschainArb,
        StrategyKind::OracleDeviation,
        StrategyKind::Governance,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::FlashArb => "flash_arb",
            StrategyKind::Sandwich => "sandwich",
            StrategyKind::Liquidation => "liquidation",
            StrategyKind::CrosschainArb => "crosschain_arb",
            StrategyKind::OracleDeviation => "oracle_deviation",
            StrategyKind::Governance => "governance",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|k| k.as_str() == s)
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One step of an execution plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "action")]
pub enum Action {
    Swap {
        pool: Address,
        token_in: Address,
        token_out: Address,
        amount_in: U256,
        min_out: U256,
    },
    Call {
        target: Address,
        calldata: Bytes,
        value: U256,
    },
    FlashLoan {
        provider_id: u8,
        token: Address,
        amount: U256,
        inner: Vec<Action>,
    },
    Bridge {
        src_chain: u32,
        dst_chain: u32,
        token: Address,
        amount: U256,
    },
}

/// Ordered action list; serializable to a wire bundle and re-simulatable.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub actions: Vec<Action>,
}

impl ExecutionPlan {
    pub fn new(actions: Vec<Action>) -> Self {
        Self { actions }
    }

    /// Informational opportunities (governance, oracle gates) carry no plan.
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

/// A candidate profitable action discovered by an evaluator.
///
/// Immutable once submitted to the broker; superseding an opportunity means
/// minting a fresh one with a new id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Opportunity {
    pub id: Uuid,
    pub kind: StrategyKind,
    pub chain: u32,
    pub fingerprints: Vec<Fingerprint>,
    pub gross_profit: U256,
    pub gas_cost: U256,
    pub net_profit: U256,
    pub confidence: f64,
    pub required_capital: U256,
    pub plan: ExecutionPlan,
    pub discovered_at: MonoTime,
    pub deadline: MonoTime,
    /// Free-form tag for informational opportunities (severity, asset).
    #[serde(default)]
    pub note: Option<String>,
}

impl Opportunity {
    /// `net_profit` is derived here and never recomputed; a gas cost above
    /// gross saturates to zero, which the broker treats as unschedulable.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        kind: StrategyKind,
        chain: u32,
        fingerprints: Vec<Fingerprint>,
        gross_profit: U256,
        gas_cost: U256,
        confidence: f64,
        required_capital: U256,
        plan: ExecutionPlan,
        discovered_at: MonoTime,
        ttl: Duration,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            chain,
            fingerprints,
            gross_profit,
            gas_cost,
            net_profit: gross_profit.saturating_sub(gas_cost),
            confidence: confidence.clamp(0.0, 1.0),
            required_capital,
            plan,
            discovered_at,
            deadline: crate::clock::add(discovered_at, ttl.max(Duration::from_nanos(1))),
            note: None,
        }
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    pub fn is_informational(&self) -> bool {
        self.plan.is_empty()
    }

    /// Broker ranking score: confidence x net profit.
    pub fn score(&self) -> f64 {
        self.confidence * u256_to_f64(self.net_profit)
    }

    pub fn is_expired(&self, now: MonoTime) -> bool {
        now >= self.deadline
    }
}

/// Lossy U256 -> f64 for ranking and display. Exact for values < 2^53.
pub fn u256_to_f64(v: U256) -> f64 {
    let limbs = v.into_limbs();
    limbs[0] as f64
        + limbs[1] as f64 * 2f64.powi(64)
        + limbs[2] as f64 * 2f64.powi(128)
        + limbs[3] as f64 * 2f64.powi(192)
}

/// Bundle lifecycle. Legal transitions only; anything else is a programming
/// bug surfaced as an invariant violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BundleState {
    Draft,
    Signed,
    Submitted,
    Included,
    Rejected,
    Expired,
}

impl BundleState {
    pub fn can_transition(self, next: BundleState) -> bool {
        use BundleState::*;
        matches!(
            (self, next),
            (Draft, Signed) | (Signed, Submitted) | (Submitted, Included | Rejected | Expired)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            BundleState::Included | BundleState::Rejected | BundleState::Expired
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BundleState::Draft => "draft",
            BundleState::Signed => "signed",
            BundleState::Submitted => "submitted",
            BundleState::Included => "included",
            BundleState::Rejected => "rejected",
            BundleState::Expired => "expired",
        }
    }
}

/// One signed wire transaction inside a bundle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedRawTx {
    pub hash: B256,
    pub raw: Bytes,
    pub sender: Address,
    pub nonce: u64,
}

/// A bundle on its way through the relay path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleSubmission {
    pub id: Uuid,
    pub opportunity_id: Uuid,
    pub chain: u32,
    pub strategy: StrategyKind,
    pub fingerprints: Vec<Fingerprint>,
    pub txs: Vec<SignedRawTx>,
    pub target_block_start: u64,
    pub target_block_end: u64,
    pub relays: Vec<String>,
    pub discovered_at: MonoTime,
    pub submitted_at: Option<MonoTime>,
    pub state: BundleState,
    pub estimated_net_profit: U256,
}

/// Why a bundle failed, if it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    Reverted,
    RelayRejected,
    Expired,
    NonceConflict,
    Transport,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::Reverted => "reverted",
            FailureReason::RelayRejected => "relay_rejected",
            FailureReason::Expired => "expired",
            FailureReason::NonceConflict => "nonce_conflict",
            FailureReason::Transport => "transport",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "reverted" => Some(Self::Reverted),
            "relay_rejected" => Some(Self::RelayRejected),
            "expired" => Some(Self::Expired),
            "nonce_conflict" => Some(Self::NonceConflict),
            "transport" => Some(Self::Transport),
            _ => None,
        }
    }
}

/// Append-only record of what actually happened to a bundle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutcomeRecord {
    pub bundle_id: Uuid,
    pub opportunity_id: Uuid,
    pub strategy: StrategyKind,
    pub chain: u32,
    pub inclusion_block: Option<u64>,
    pub gas_used: u64,
    /// Signed: failed bundles realize the gas burn as a loss.
    pub realized_profit: i128,
    pub latency_ms: u64,
    pub failure: Option<FailureReason>,
    pub recorded_at: chrono::DateTime<chrono::Utc>,
}

impl OutcomeRecord {
    pub fn succeeded(&self) -> bool {
        self.failure.is_none()
    }
}

/// Per-asset price deviation flag maintained by the oracle monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviationFlag {
    pub asset: String,
    pub deviating: bool,
    pub onchain_price: f64,
    pub cex_price: f64,
    pub onchain_at: MonoTime,
    pub cex_at: MonoTime,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock;

    fn addr(b: u8) -> Address {
        Address::repeat_byte(b)
    }

    #[test]
    fn fingerprint_is_stable_and_sensitive() {
        let input = [0xa9, 0x05, 0x9c, 0xbb, 0xff];
        let a = Fingerprint::compute(1, addr(0x11), 7, &input, Some(addr(0x22)));
        let b = Fingerprint::compute(1, addr(0x11), 7, &input, Some(addr(0x22)));
        assert_eq!(a, b);

        // Any field change moves the fingerprint.
        assert_ne!(
            a,
            Fingerprint::compute(2, addr(0x11), 7, &input, Some(addr(0x22)))
        );
        assert_ne!(
            a,
            Fingerprint::compute(1, addr(0x11), 8, &input, Some(addr(0x22)))
        );
        assert_ne!(a, Fingerprint::compute(1, addr(0x11), 7, &input, None));
    }

    #[test]
    fn fingerprint_ignores_input_past_selector() {
        let long = [0xa9, 0x05, 0x9c, 0xbb, 0x01, 0x02, 0x03];
        let short = [0xa9, 0x05, 0x9c, 0xbb];
        let a = Fingerprint::compute(1, addr(1), 0, &long, Some(addr(2)));
        let b = Fingerprint::compute(1, addr(1), 0, &short, Some(addr(2)));
        assert_eq!(a, b);
    }

    #[test]
    fn pending_tx_prefers_eip1559_pricing() {
        let raw = RawTransaction {
            hash: B256::repeat_byte(0xaa),
            from: addr(1),
            to: Some(addr(2)),
            value: U256::from(100u64),
            gas: U256::from(21_000u64),
            gas_price: Some(U256::from(5u64)),
            max_fee_per_gas: Some(U256::from(30u64)),
            max_priority_fee_per_gas: Some(U256::from(2u64)),
            nonce: U256::from(9u64),
            input: Bytes::new(),
        };
        let tx = PendingTx::from_raw(raw, 1, SourceId::new("test"), clock::now());
        assert_eq!(
            tx.pricing,
            Some(GasPricing::Eip1559 {
                max_fee: 30,
                priority_fee: 2
            })
        );
    }

    #[test]
    fn last_seen_never_regresses() {
        let raw = RawTransaction {
            hash: B256::ZERO,
            from: addr(1),
            to: None,
            value: U256::ZERO,
            gas: U256::from(21_000u64),
            gas_price: None,
            max_fee_per_gas: None,
            max_priority_fee_per_gas: None,
            nonce: U256::ZERO,
            input: Bytes::new(),
        };
        let t0 = clock::now();
        let mut tx = PendingTx::from_raw(raw, 1, SourceId::new("test"), t0);
        tx.observe_again(t0.saturating_sub(1_000));
        assert_eq!(tx.last_seen, t0);
        tx.observe_again(t0 + 1_000);
        assert_eq!(tx.last_seen, t0 + 1_000);
        assert!(tx.first_seen <= tx.last_seen);
    }

    #[test]
    fn opportunity_net_is_gross_minus_gas() {
        let opp = Opportunity::new(
            StrategyKind::FlashArb,
            1,
            vec![],
            U256::from(1_000u64),
            U256::from(300u64),
            0.9,
            U256::ZERO,
            ExecutionPlan::default(),
            clock::now(),
            Duration::from_secs(5),
        );
        assert_eq!(opp.net_profit, U256::from(700u64));
        assert!(opp.deadline > opp.discovered_at);
    }

    #[test]
    fn gas_above_gross_saturates_to_zero() {
        let opp = Opportunity::new(
            StrategyKind::Sandwich,
            1,
            vec![],
            U256::from(10u64),
            U256::from(300u64),
            0.5,
            U256::ZERO,
            ExecutionPlan::default(),
            clock::now(),
            Duration::from_secs(1),
        );
        assert_eq!(opp.net_profit, U256::ZERO);
    }

    #[test]
    fn bundle_state_machine_rejects_illegal_moves() {
        use BundleState::*;
        assert!(Draft.can_transition(Signed));
        assert!(Signed.can_transition(Submitted));
        assert!(Submitted.can_transition(Included));
        assert!(Submitted.can_transition(Expired));
        assert!(!Draft.can_transition(Submitted));
        assert!(!Included.can_transition(Rejected));
        assert!(!Expired.can_transition(Submitted));
    }

    #[test]
    fn u256_to_f64_exact_below_2_53() {
        assert_eq!(u256_to_f64(U256::from(0u64)), 0.0);
        assert_eq!(u256_to_f64(U256::from(1u64) << 52), 2f64.powi(52));
    }

    #[test]
    fn fingerprint_survives_serde_round_trip() {
        let raw = RawTransaction {
            hash: B256::repeat_byte(0x42),
            from: addr(0x11),
            to: Some(addr(0x22)),
            value: U256::from(5u64),
            gas: U256::from(90_000u64),
            gas_price: None,
            max_fee_per_gas: Some(U256::from(40u64)),
            max_priority_fee_per_gas: Some(U256::from(2u64)),
            nonce: U256::from(3u64),
            input: Bytes::from(vec![0x38, 0xed, 0x17, 0x39, 0xff]),
        };
        let tx = PendingTx::from_raw(raw, 1, SourceId::new("test"), clock::now());

        let wire = serde_json::to_string(&tx).unwrap();
        let back: PendingTx = serde_json::from_str(&wire).unwrap();
        assert_eq!(tx.fingerprint(), back.fingerprint());
    }
}
