use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// 环形缓冲槽位冲突时的处理策略
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollisionPolicy {
    /// 保留已缓存的段，丢弃新段
    #[default]
    RejectNewer,
    /// 释放旧段，缓存新段
    EvictOlder,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub page_pool_capacity: usize, // 全局页池容量（即全局页配额）
    pub max_pages_per_flow: usize, // 每个流可持有的最大页数
    pub ring_capacity: usize,      // 每个流环形缓冲的槽位数
    pub page_size: usize,          // 单页字节数
    /// 每个方向保留的已交付字节数，用于重叠比较。
    /// 历史窗口不从页池分配，也不受页配额约束：每条已建立连接最多占用
    /// `2 * history_bytes` 字节，总量随连接数增长，连接数只受空闲超时约束。
    pub history_bytes: usize,
    pub collision_policy: CollisionPolicy,
    pub allow_midstream: bool,     // 是否跟踪未观察到握手的连接
    pub stream_timeout: u64,       // 流空闲超时（秒）
    pub cleanup_interval: u64,     // 超时清理间隔（秒）
    pub worker_threads: usize,     // 0 表示使用 CPU 核数
    pub worker_queue_depth: usize,
    pub log_dir: PathBuf,          // 攻击报告输出目录
}

impl Default for Config {
    fn default() -> Self {
        Self {
            page_pool_capacity: 1024,
            max_pages_per_flow: 1024,
            ring_capacity: 40,
            page_size: 1900,
            history_bytes: 64 * 1024,
            collision_policy: CollisionPolicy::default(),
            allow_midstream: false,
            stream_timeout: 300,
            cleanup_interval: 60,
            worker_threads: 0,
            worker_queue_depth: 1000,
            log_dir: PathBuf::from("."),
        }
    }
}

impl Config {
    /// 从 JSON 文件加载配置，缺省字段使用默认值
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Parse(format!("{}: {}", path.as_ref().display(), e)))?;
        Self::from_json_str(&raw)
    }

    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Config =
            serde_json::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// 启动前校验；非法配置是唯一允许致命失败的情形
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("page_pool_capacity", self.page_pool_capacity),
            ("max_pages_per_flow", self.max_pages_per_flow),
            ("ring_capacity", self.ring_capacity),
            ("page_size", self.page_size),
            ("worker_queue_depth", self.worker_queue_depth),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(ConfigError::NotPositive { field });
            }
        }
        if self.cleanup_interval == 0 {
            return Err(ConfigError::NotPositive { field: "cleanup_interval" });
        }
        if self.max_pages_per_flow > self.page_pool_capacity {
            return Err(ConfigError::FlowQuotaAboveGlobal {
                per_flow: self.max_pages_per_flow,
                total: self.page_pool_capacity,
            });
        }
        Ok(())
    }

    pub fn worker_count(&self) -> usize {
        if self.worker_threads == 0 {
            num_cpus::get()
        } else {
            self.worker_threads
        }
    }
}
