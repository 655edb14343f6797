//! The token bucket state transition shared by every engine.
//!
//! Refill is discrete: whole intervals credit `refill_amount` tokens each, partial intervals
//! credit nothing, and the refill timestamp only advances by whole intervals. Token counts are
//! integers so that repeated refill/consume cycles never accumulate rounding drift.

use crate::backend::{BucketOutcome, BucketParams};

/// Stored state of one bucket.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct BucketState {
    pub tokens: u64,
    /// Epoch milliseconds up to which refills have been credited.
    pub refilled_at_ms: u64,
}

/// Apply one consume of `requested` tokens at `now_ms`.
///
/// `state` is `None` for a bucket that does not exist yet (or has expired), in which case it
/// starts full. Returns the state to persist alongside the outcome. A request of zero tokens
/// only performs the refill.
pub fn consume(
    state: Option<BucketState>,
    params: &BucketParams,
    requested: u64,
    now_ms: u64,
) -> (BucketState, BucketOutcome) {
    let capacity = params.capacity;
    let interval = params.refill_interval_ms;
    let mut state = state.unwrap_or(BucketState {
        tokens: capacity,
        refilled_at_ms: now_ms,
    });
    // The capacity may have shrunk since the state was written
    state.tokens = state.tokens.min(capacity);

    let elapsed = now_ms.saturating_sub(state.refilled_at_ms);
    if elapsed >= interval {
        let refills = elapsed / interval;
        state.tokens = state
            .tokens
            .saturating_add(refills.saturating_mul(params.refill_amount))
            .min(capacity);
        state.refilled_at_ms += refills * interval;
    }

    let allowed = state.tokens >= requested;
    if allowed {
        state.tokens -= requested;
    }

    let reset_at_ms = full_at(&state, params, capacity).max(now_ms);
    let retry_after_ms = if allowed {
        0
    } else if requested > capacity {
        // Never satisfiable, so point past the next refill rather than at a full bucket now
        full_at(&state, params, capacity)
            .saturating_sub(now_ms)
            .max(interval)
    } else {
        full_at(&state, params, requested).saturating_sub(now_ms)
    };

    let outcome = BucketOutcome {
        allowed,
        remaining: state.tokens,
        reset_at_ms,
        retry_after_ms,
    };
    (state, outcome)
}

// Time at which the bucket holds at least `target` tokens.
fn full_at(state: &BucketState, params: &BucketParams, target: u64) -> u64 {
    if state.tokens >= target {
        return state.refilled_at_ms;
    }
    let missing = target - state.tokens;
    let refills = (missing + params.refill_amount - 1) / params.refill_amount;
    state.refilled_at_ms + refills * params.refill_interval_ms
}

/// The same transition as [consume], executed server side in Redis.
///
/// KEYS[1] is the bucket key. ARGV: capacity, refill amount, refill interval (ms), requested
/// tokens, now (ms), ttl (s). Returns `{allowed, remaining, reset_at_ms, retry_after_ms}`.
pub const LUA_SCRIPT: &str = r#"
local key = KEYS[1]
local capacity = tonumber(ARGV[1])
local refill_amount = tonumber(ARGV[2])
local interval = tonumber(ARGV[3])
local requested = tonumber(ARGV[4])
local now = tonumber(ARGV[5])
local ttl = tonumber(ARGV[6])

local stored = redis.call('HMGET', key, 'tokens', 'ts')
local tokens = tonumber(stored[1])
local ts = tonumber(stored[2])
if tokens == nil or ts == nil then
  tokens = capacity
  ts = now
end
if tokens > capacity then
  tokens = capacity
end

local elapsed = now - ts
if elapsed >= interval then
  local refills = math.floor(elapsed / interval)
  tokens = math.min(capacity, tokens + refills * refill_amount)
  ts = ts + refills * interval
end

local allowed = 0
if tokens >= requested then
  allowed = 1
  tokens = tokens - requested
end

local function full_at(target)
  if tokens >= target then
    return ts
  end
  return ts + math.ceil((target - tokens) / refill_amount) * interval
end

local reset_at = math.max(full_at(capacity), now)
local retry_after = 0
if allowed == 0 then
  if requested > capacity then
    retry_after = math.max(full_at(capacity) - now, interval)
  else
    retry_after = math.max(full_at(requested) - now, 0)
  end
end

redis.call('HSET', key, 'tokens', tokens, 'ts', ts)
redis.call('EXPIRE', key, ttl)
return {allowed, tokens, reset_at, retry_after}
"#;
