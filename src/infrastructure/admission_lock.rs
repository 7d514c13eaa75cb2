//! 按授权分片的准入锁
//!
//! 同一授权的扣款准入（读取剩余额度 + 预占额度 + 写入扣款记录）串行执行，
//! 不同授权之间互不阻塞。链上结算不在锁内进行。

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use tokio::sync::OwnedMutexGuard;

#[derive(Default)]
pub struct AdmissionLock {
    shards: Mutex<HashMap<i64, Arc<tokio::sync::Mutex<()>>>>,
}

impl AdmissionLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// 获取授权级互斥锁，守卫释放即解锁
    pub async fn acquire(&self, auth_id: i64) -> AdmissionGuard<'_> {
        let shard = {
            let mut shards = self
                .shards
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            shards
                .entry(auth_id)
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        let guard = shard.lock_owned().await;
        AdmissionGuard {
            owner: self,
            auth_id,
            guard: Some(guard),
        }
    }

    /// 当前持有分片数
    pub fn shard_count(&self) -> usize {
        self.shards
            .lock()
            .map(|s| s.len())
            .unwrap_or_else(|poisoned| poisoned.into_inner().len())
    }

    /// 释放后若无其他等待者则回收分片
    fn release(&self, auth_id: i64) {
        let mut shards = self
            .shards
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(shard) = shards.get(&auth_id) {
            if Arc::strong_count(shard) == 1 {
                shards.remove(&auth_id);
            }
        }
    }
}

pub struct AdmissionGuard<'a> {
    owner: &'a AdmissionLock,
    auth_id: i64,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for AdmissionGuard<'_> {
    fn drop(&mut self) {
        // 先释放互斥锁持有的 Arc，再判断是否可回收
        drop(self.guard.take());
        self.owner.release(self.auth_id);
    }
}
