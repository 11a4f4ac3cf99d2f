use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crossbeam::queue::ArrayQueue;
use crossbeam_utils::CachePadded;
use log::{debug, info, warn};

use super::Page;
use crate::error::{ConfigError, EngineError, QuotaScope, Result};

#[derive(Debug, Clone)]
pub struct PagerConfig {
    pub capacity: usize,
    pub page_size: usize,
}

impl Default for PagerConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            page_size: 1900,
        }
    }
}

/// 有界页池，所有流共享
///
/// 空闲页放在无锁队列里，已用计数通过 CAS 预留，因此并发申请不会超过容量。
/// 申请失败立即返回 `PoolExhausted`，不会等待。
pub struct Pager {
    config: PagerConfig,
    free: ArrayQueue<Page>,
    used: CachePadded<AtomicUsize>,
    active: AtomicBool,
}

impl Pager {
    pub fn new(config: PagerConfig) -> std::result::Result<Self, ConfigError> {
        if config.capacity == 0 {
            return Err(ConfigError::NotPositive { field: "page_pool_capacity" });
        }
        if config.page_size == 0 {
            return Err(ConfigError::NotPositive { field: "page_size" });
        }
        Ok(Self {
            free: ArrayQueue::new(config.capacity),
            used: CachePadded::new(AtomicUsize::new(0)),
            active: AtomicBool::new(false),
            config,
        })
    }

    /// 预分配全部空闲页并激活页池，必须与 `stop` 成对调用
    pub fn start(&self) {
        if self.active.swap(true, Ordering::AcqRel) {
            return;
        }
        let outstanding = self.used.load(Ordering::Acquire);
        let mut created = 0;
        while self.free.len() + outstanding < self.config.capacity {
            if self.free.push(Page::new(self.config.page_size)).is_err() {
                break;
            }
            created += 1;
        }
        info!(
            "页池启动: capacity={}, page_size={}, 新建页={}",
            self.config.capacity, self.config.page_size, created
        );
    }

    /// 停用页池并释放空闲页，返回仍被流持有的页数
    pub fn stop(&self) -> usize {
        self.active.store(false, Ordering::Release);
        while self.free.pop().is_some() {}
        let outstanding = self.used.load(Ordering::Acquire);
        if outstanding > 0 {
            warn!("页池停止时仍有 {} 页未归还", outstanding);
        } else {
            info!("页池已停止");
        }
        outstanding
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn acquire(&self) -> Result<Page> {
        if !self.is_active() {
            return Err(EngineError::PagerInactive);
        }

        let limit = self.config.capacity;
        let mut used = self.used.load(Ordering::Relaxed);
        loop {
            if used >= limit {
                return Err(EngineError::PoolExhausted {
                    scope: QuotaScope::Global,
                    used,
                    limit,
                });
            }
            match self.used.compare_exchange_weak(
                used,
                used + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => used = actual,
            }
        }

        match self.free.pop() {
            Some(page) => Ok(page),
            None => {
                // 页池在预留之后被停止
                self.used.fetch_sub(1, Ordering::AcqRel);
                debug!("页池预留成功但空闲队列为空");
                Err(EngineError::PoolExhausted {
                    scope: QuotaScope::Global,
                    used,
                    limit,
                })
            }
        }
    }

    pub fn release(&self, mut page: Page) {
        page.clear();
        if self.is_active() {
            // 先放回再减计数，避免其他线程预留成功却取不到页
            if self.free.push(page).is_err() {
                warn!("空闲队列已满，丢弃归还的页");
            }
        }
        self.used.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn used(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }

    pub fn available(&self) -> usize {
        self.config.capacity.saturating_sub(self.used())
    }

    pub fn capacity(&self) -> usize {
        self.config.capacity
    }

    pub fn page_size(&self) -> usize {
        self.config.page_size
    }
}

impl std::fmt::Debug for Pager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pager")
            .field("capacity", &self.config.capacity)
            .field("page_size", &self.config.page_size)
            .field("used", &self.used())
            .field("active", &self.is_active())
            .finish()
    }
}
