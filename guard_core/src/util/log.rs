#[cfg(not(test))]
use std::fs::File;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Once;

use log::LevelFilter;

static INIT_LOGGER: Once = Once::new();
static LOGGER_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// 默认日志初始化：Debug 级别，非测试构建写入 `guard_core.log`
pub fn init_logger() {
    init_logger_with(LevelFilter::Debug, Some(Path::new("guard_core.log")));
}

/// 进程内只生效一次，`RUST_LOG` 仍可覆盖级别
pub fn init_logger_with(level: LevelFilter, file: Option<&Path>) {
    if LOGGER_INITIALIZED.load(Ordering::SeqCst) {
        return;
    }
    INIT_LOGGER.call_once(|| {
        let mut builder = env_logger::Builder::new();
        builder.filter_level(level);
        builder.parse_default_env();
        #[cfg(not(test))]
        {
            if let Some(path) = file {
                if let Ok(file) = File::create(path) {
                    builder.target(env_logger::Target::Pipe(Box::new(file)));
                }
            }
        }
        #[cfg(test)]
        {
            let _ = file;
            builder.is_test(true);
        }
        let _ = builder.try_init();
        LOGGER_INITIALIZED.store(true, Ordering::SeqCst);
    });
}

pub fn is_initialized() -> bool {
    LOGGER_INITIALIZED.load(Ordering::SeqCst)
}
