//! Redis checkpoint store.
//!
//! Layout per (user, thread):
//! - `{prefix}:hash:{user}:{thread}`: scalar fields
//! - `{prefix}:side_effects:{user}:{thread}`: idempotency keys (set)
//!
//! Saves run as one Lua script so the forward-only rule for `last_entry_id`
//! and the TTL refresh are applied atomically.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::Script;

use super::{CheckpointError, CheckpointStore};
use crate::models::{Checkpoint, EntryId};

const SAVE_SCRIPT: &str = r#"
local function parse_id(id)
  local ms, seq = string.match(id, "^(%d+)-(%d+)$")
  if ms == nil then
    return nil, nil
  end
  return tonumber(ms), tonumber(seq)
end

redis.call("HSET", KEYS[1], "user_id", ARGV[2], "thread_id", ARGV[3])

if ARGV[4] ~= "" then
  local apply = true
  local current = redis.call("HGET", KEYS[1], "last_entry_id")
  if current then
    local cms, cseq = parse_id(current)
    local nms, nseq = parse_id(ARGV[4])
    if cms and nms and (nms < cms or (nms == cms and nseq <= cseq)) then
      apply = false
    end
  end
  if apply then
    redis.call("HSET", KEYS[1], "last_entry_id", ARGV[4])
  end
end

if ARGV[5] ~= "" then redis.call("HSET", KEYS[1], "last_plan_id", ARGV[5]) end
if ARGV[6] ~= "" then redis.call("HSET", KEYS[1], "last_plan_version", ARGV[6]) end
if ARGV[7] ~= "" then redis.call("HSET", KEYS[1], "pending_prompt_id", ARGV[7]) end

for i = 8, #ARGV do
  redis.call("SADD", KEYS[2], ARGV[i])
end

redis.call("EXPIRE", KEYS[1], ARGV[1])
if redis.call("EXISTS", KEYS[2]) == 1 then
  redis.call("EXPIRE", KEYS[2], ARGV[1])
end
return 1
"#;

pub struct RedisCheckpointStore {
    client: redis::Client,
    prefix: String,
    ttl: Duration,
    save_script: Script,
}

impl RedisCheckpointStore {
    pub fn new(url: &str, prefix: &str, ttl: Duration) -> Result<Self, CheckpointError> {
        Ok(Self {
            client: redis::Client::open(url)?,
            prefix: prefix.trim_end_matches(':').to_string(),
            ttl,
            save_script: Script::new(SAVE_SCRIPT),
        })
    }

    fn hash_key(&self, user_id: &str, thread_id: &str) -> String {
        format!("{}:hash:{}:{}", self.prefix, user_id, thread_id)
    }

    fn set_key(&self, user_id: &str, thread_id: &str) -> String {
        format!("{}:side_effects:{}:{}", self.prefix, user_id, thread_id)
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, CheckpointError> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }
}

#[async_trait]
impl CheckpointStore for RedisCheckpointStore {
    async fn get(&self, user_id: &str, thread_id: &str) -> Result<Checkpoint, CheckpointError> {
        let mut conn = self.connection().await?;
        let (mut fields, keys): (HashMap<String, String>, Vec<String>) = redis::pipe()
            .hgetall(self.hash_key(user_id, thread_id))
            .smembers(self.set_key(user_id, thread_id))
            .query_async(&mut conn)
            .await?;

        let mut take = |name: &str| fields.remove(name).filter(|v| !v.is_empty());
        let last_entry_id: Option<EntryId> = take("last_entry_id").map(|id| id.parse()).transpose()?;

        Ok(Checkpoint {
            user_id: user_id.to_string(),
            thread_id: thread_id.to_string(),
            last_entry_id,
            last_plan_id: take("last_plan_id"),
            last_plan_version: take("last_plan_version"),
            pending_prompt_id: take("pending_prompt_id"),
            side_effect_keys: keys.into_iter().collect(),
        })
    }

    async fn save(
        &self,
        user_id: &str,
        thread_id: &str,
        update: &Checkpoint,
    ) -> Result<(), CheckpointError> {
        let mut conn = self.connection().await?;
        let text = |v: &Option<String>| v.clone().unwrap_or_default();

        let mut invocation = self.save_script.prepare_invoke();
        invocation
            .key(self.hash_key(user_id, thread_id))
            .key(self.set_key(user_id, thread_id))
            .arg(self.ttl.as_secs().max(1))
            .arg(user_id)
            .arg(thread_id)
            .arg(
                update
                    .last_entry_id
                    .map(|id| id.to_string())
                    .unwrap_or_default(),
            )
            .arg(text(&update.last_plan_id))
            .arg(text(&update.last_plan_version))
            .arg(text(&update.pending_prompt_id));
        for key in &update.side_effect_keys {
            invocation.arg(key);
        }
        let _: i64 = invocation.invoke_async(&mut conn).await?;
        Ok(())
    }

    async fn sweep_expired(&self) -> Result<u64, CheckpointError> {
        // Redis expires keys on its own.
        Ok(0)
    }

    fn name(&self) -> &str {
        "redis"
    }
}
