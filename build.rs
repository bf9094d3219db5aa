use std::time::{SystemTime, UNIX_EPOCH};

fn main() {
    // CI 可通过环境变量固定时间戳，保证 Agent 与 Client 版本一致
    let timestamp = std::env::var("BUILD_TIMESTAMP").ok().unwrap_or_else(|| {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
            .to_string()
    });

    println!("cargo:rustc-env=BUILD_TIMESTAMP={}", timestamp);
    println!("cargo:rerun-if-env-changed=BUILD_TIMESTAMP");
}
