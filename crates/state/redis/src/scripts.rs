//! Lua scripts executed atomically on the Redis server.

/// Value-based compare-and-swap.
///
/// KEYS[1]: the key.
/// ARGV[1]: `1` when an expected value is supplied, `0` for set-if-absent.
/// ARGV[2]: the expected value (ignored when ARGV[1] is `0`).
/// ARGV[3]: the new value.
/// ARGV[4]: TTL in milliseconds, `0` for none.
///
/// Returns `1` when the swap was applied, `0` otherwise.
pub const COMPARE_AND_SWAP: &str = r"
local current = redis.call('GET', KEYS[1])
if ARGV[1] == '0' then
  if current then return 0 end
else
  if not current or current ~= ARGV[2] then return 0 end
end
local ttl = tonumber(ARGV[4])
if ttl > 0 then
  redis.call('SET', KEYS[1], ARGV[3], 'PX', ttl)
else
  local remaining = redis.call('PTTL', KEYS[1])
  if remaining and remaining > 0 then
    redis.call('SET', KEYS[1], ARGV[3], 'PX', remaining)
  else
    redis.call('SET', KEYS[1], ARGV[3])
  end
end
return 1
";
