//! 集成测试共用的初始化。

use std::sync::Once;

use tracing_subscriber::EnvFilter;

/// 为当前测试二进制安装一次日志订阅器；`RUST_LOG` 控制输出级别。
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}
