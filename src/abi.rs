//! Minimal ABI plumbing
//!
//! Just enough calldata codec for what the pipeline actually touches:
//! decoding router swap calls seen in the mempool, encoding the operator
//! aggregator's `executeFlashLoan` entrypoint, and matching the
//! `ProfitReported` event in receipts.

use alloy_primitives::{keccak256, Address, Bytes, B256, U256};

use crate::rpc::LogEntry;

/// `swapExactTokensForTokens(uint256,uint256,address[],address,uint256)`
pub const SWAP_EXACT_TOKENS_SELECTOR: [u8; 4] = [0x38, 0xed, 0x17, 0x39];

fn word(input: &[u8], idx: usize) -> Option<U256> {
    let start = 4 + idx * 32;
    input
        .get(start..start + 32)
        .map(|w| U256::from_be_slice(w))
}

fn word_address(input: &[u8], idx: usize) -> Option<Address> {
    let start = 4 + idx * 32;
    input
        .get(start + 12..start + 32)
        .map(Address::from_slice)
}

/// A decoded router swap.
#[derive(Debug, Clone)]
pub struct SwapCall {
    pub amount_in: U256,
    pub min_out: U256,
    pub path: Vec<Address>,
}

impl SwapCall {
    /// Victim slippage tolerance in basis points: how far below the quoted
    /// output the trader is willing to land.
    pub fn slippage_tolerance_bps(&self, quoted_out: U256) -> u32 {
        if quoted_out.is_zero() || self.min_out >= quoted_out {
            return 0;
        }
        let diff = quoted_out - self.min_out;
        (diff.saturating_mul(U256::from(10_000u64)) / quoted_out)
            .saturating_to::<u64>()
            .min(10_000) as u32
    }
}

/// Decode a `swapExactTokensForTokens` call. Returns `None` for anything
/// that is not a well-formed call of that shape.
pub fn decode_swap_exact_tokens(input: &[u8]) -> Option<SwapCall> {
    if input.len() < 4 || input[..4] != SWAP_EXACT_TOKENS_SELECTOR {
        return None;
    }
    let amount_in = word(input, 0)?;
    let min_out = word(input, 1)?;
    let path_offset: usize = word(input, 2)?.saturating_to();
    let path_len_pos = 4 + path_offset;
    let path_len: usize = input
        .get(path_len_pos..path_len_pos + 32)
        .map(U256::from_be_slice)?
        .saturating_to();
    if path_len == 0 || path_len > 8 {
        return None;
    }
    let mut path = Vec::with_capacity(path_len);
    for i in 0..path_len {
        let start = path_len_pos + 32 + i * 32;
        let addr = input.get(start + 12..start + 32).map(Address::from_slice)?;
        path.push(addr);
    }
    Some(SwapCall {
        amount_in,
        min_out,
        path,
    })
}

/// Wire shape of one aggregator action: (address target, uint256 value,
/// bytes data).
#[derive(Debug, Clone)]
pub struct WireAction {
    pub target: Address,
    pub value: U256,
    pub data: Bytes,
}

fn aggregator_selector(signature: &str) -> [u8; 4] {
    let hash = keccak256(signature.as_bytes());
    [hash[0], hash[1], hash[2], hash[3]]
}

pub fn execute_flash_loan_selector() -> [u8; 4] {
    aggregator_selector("executeFlashLoan(uint8,address,uint256,(address,uint256,bytes)[])")
}

pub fn pause_selector() -> [u8; 4] {
    aggregator_selector("pause()")
}

pub fn unpause_selector() -> [u8; 4] {
    aggregator_selector("unpause()")
}

fn push_word(out: &mut Vec<u8>, value: U256) {
    out.extend_from_slice(&value.to_be_bytes::<32>());
}

fn push_address(out: &mut Vec<u8>, addr: Address) {
    let mut w = [0u8; 32];
    w[12..].copy_from_slice(addr.as_slice());
    out.extend_from_slice(&w);
}

/// ABI-encode `executeFlashLoan(uint8,address,uint256,Action[])`.
pub fn encode_execute_flash_loan(
    provider_id: u8,
    loan_token: Address,
    loan_amount: U256,
    actions: &[WireAction],
) -> Bytes {
    let mut out = Vec::with_capacity(4 + 32 * (4 + actions.len() * 6));
    out.extend_from_slice(&execute_flash_loan_selector());

    // Head: three static words plus the offset of the dynamic array.
    push_word(&mut out, U256::from(provider_id));
    push_address(&mut out, loan_token);
    push_word(&mut out, loan_amount);
    push_word(&mut out, U256::from(4 * 32u64));

    // Array of dynamic tuples: length, per-element offsets, then elements.
    push_word(&mut out, U256::from(actions.len() as u64));
    let mut tails: Vec<Vec<u8>> = Vec::with_capacity(actions.len());
    for action in actions {
        let mut tail = Vec::new();
        push_address(&mut tail, action.target);
        push_word(&mut tail, action.value);
        // bytes field: offset within the tuple (3 words), then len + data.
        push_word(&mut tail, U256::from(3 * 32u64));
        push_word(&mut tail, U256::from(action.data.len() as u64));
        tail.extend_from_slice(&action.data);
        let pad = (32 - action.data.len() % 32) % 32;
        tail.extend(std::iter::repeat(0u8).take(pad));
        tails.push(tail);
    }
    let mut offset = actions.len() * 32;
    for tail in &tails {
        push_word(&mut out, U256::from(offset as u64));
        offset += tail.len();
    }
    for tail in tails {
        out.extend_from_slice(&tail);
    }

    Bytes::from(out)
}

/// Topic0 of `ProfitReported(address indexed token, uint256 amount)`.
pub fn profit_reported_topic() -> B256 {
    keccak256("ProfitReported(address,uint256)".as_bytes())
}

/// Parse a `ProfitReported` log emitted by the operator aggregator.
/// Returns (token, amount).
pub fn decode_profit_reported(log: &LogEntry) -> Option<(Address, U256)> {
    if log.topics.first() != Some(&profit_reported_topic()) {
        return None;
    }
    let token_topic = log.topics.get(1)?;
    let token = Address::from_slice(&token_topic.as_slice()[12..]);
    if log.data.len() < 32 {
        return None;
    }
    Some((token, U256::from_be_slice(&log.data[..32])))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_swap_calldata(amount_in: u64, min_out: u64, path: &[Address]) -> Vec<u8> {
        let mut data = SWAP_EXACT_TOKENS_SELECTOR.to_vec();
        let mut w = |v: U256| data.extend_from_slice(&v.to_be_bytes::<32>());
        w(U256::from(amount_in));
        w(U256::from(min_out));
        w(U256::from(5 * 32u64)); // path offset
        w(U256::ZERO); // to (unused by the decoder)
        w(U256::from(9_999_999_999u64)); // deadline
        w(U256::from(path.len() as u64));
        for addr in path {
            let mut word = [0u8; 32];
            word[12..].copy_from_slice(addr.as_slice());
            data.extend_from_slice(&word);
        }
        data
    }

    #[test]
    fn swap_decode_round_trips() {
        let path = [Address::repeat_byte(0xaa), Address::repeat_byte(0xbb)];
        let data = build_swap_calldata(1_000, 950, &path);
        let call = decode_swap_exact_tokens(&data).unwrap();
        assert_eq!(call.amount_in, U256::from(1_000u64));
        assert_eq!(call.min_out, U256::from(950u64));
        assert_eq!(call.path, path.to_vec());
    }

    #[test]
    fn swap_decode_rejects_foreign_selectors() {
        assert!(decode_swap_exact_tokens(&[0xa9, 0x05, 0x9c, 0xbb]).is_none());
        assert!(decode_swap_exact_tokens(&[]).is_none());
    }

    #[test]
    fn slippage_tolerance_in_bps() {
        let call = SwapCall {
            amount_in: U256::from(100u64),
            min_out: U256::from(970u64),
            path: vec![],
        };
        // Quoted 1000, willing to take 970: 300 bps of room.
        assert_eq!(call.slippage_tolerance_bps(U256::from(1_000u64)), 300);
        // min_out above quote means zero tolerance.
        assert_eq!(call.slippage_tolerance_bps(U256::from(900u64)), 0);
    }

    #[test]
    fn flash_loan_encoding_layout() {
        let actions = vec![WireAction {
            target: Address::repeat_byte(0x42),
            value: U256::ZERO,
            data: Bytes::from(vec![0xde, 0xad]),
        }];
        let encoded =
            encode_execute_flash_loan(3, Address::repeat_byte(0x01), U256::from(500u64), &actions);
        assert_eq!(&encoded[..4], &execute_flash_loan_selector());
        // providerId word.
        assert_eq!(U256::from_be_slice(&encoded[4..36]), U256::from(3u64));
        // Array length sits at the head-declared offset.
        let array_off: usize = U256::from_be_slice(&encoded[4 + 96..4 + 128]).saturating_to();
        let len_pos = 4 + array_off;
        assert_eq!(
            U256::from_be_slice(&encoded[len_pos..len_pos + 32]),
            U256::from(1u64)
        );
        // Whole payload is word-aligned.
        assert_eq!((encoded.len() - 4) % 32, 0);
    }

    #[test]
    fn profit_reported_decode() {
        let token = Address::repeat_byte(0x77);
        let mut topic1 = [0u8; 32];
        topic1[12..].copy_from_slice(token.as_slice());
        let log = LogEntry {
            address: Address::repeat_byte(0x01),
            topics: vec![profit_reported_topic(), B256::from(topic1)],
            data: Bytes::from(U256::from(12_345u64).to_be_bytes::<32>().to_vec()),
        };
        let (got_token, amount) = decode_profit_reported(&log).unwrap();
        assert_eq!(got_token, token);
        assert_eq!(amount, U256::from(12_345u64));

        let wrong = LogEntry {
            address: Address::repeat_byte(0x01),
            topics: vec![B256::ZERO],
            data: Bytes::new(),
        };
        assert!(decode_profit_reported(&wrong).is_none());
    }
}
