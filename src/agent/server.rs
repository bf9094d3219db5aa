//! Agent 服务器
//!
//! Unix Socket 服务，处理客户端连接和请求

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::time::interval;

use super::broadcaster::EventHub;
use super::handler::{ConnId, Handler};
use super::registry::{CancelReason, SessionRegistry};
use crate::config::StreamConfig;
use crate::protocol::{Request, Response};

/// 单个请求行上限
const MAX_REQUEST_BYTES: u64 = 16 * 1024 * 1024;

/// Agent 配置
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// 数据目录（默认 ~/.vimo）
    pub data_dir: PathBuf,
    /// 空闲超时（秒）：无连接且无执行中任务时退出
    pub idle_timeout_secs: u64,
    /// 流水线配置
    pub stream: StreamConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        let data_dir = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".vimo");

        Self {
            data_dir,
            idle_timeout_secs: 300,
            stream: StreamConfig::default(),
        }
    }
}

impl AgentConfig {
    /// 从环境变量创建（`VIMO_TASK_DATA_DIR`、`VIMO_TASK_AGENT_IDLE_SECS` 以及流水线变量）
    pub fn from_env() -> Self {
        let mut config = Self {
            stream: StreamConfig::from_env(),
            ..Default::default()
        };
        if let Ok(dir) = std::env::var("VIMO_TASK_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
            // 工作区默认跟随数据目录
            if std::env::var_os("VIMO_TASK_WORKSPACE_DIR").is_none() {
                config.stream.workspace_base = config.data_dir.join("task-workspaces");
            }
        }
        if let Some(secs) = std::env::var("VIMO_TASK_AGENT_IDLE_SECS")
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
        {
            config.idle_timeout_secs = secs;
        }
        config
    }

    /// Socket 路径
    pub fn socket_path(&self) -> PathBuf {
        self.data_dir.join("task-agent.sock")
    }

    /// PID 文件路径
    pub fn pid_path(&self) -> PathBuf {
        self.data_dir.join("task-agent.pid")
    }
}

/// Agent 服务
pub struct Agent {
    config: AgentConfig,
    registry: Arc<SessionRegistry>,
    handler: Arc<Handler>,
    next_conn_id: AtomicU64,
    shutdown: Arc<AtomicBool>,
}

impl Agent {
    /// 创建 Agent
    pub fn new(config: AgentConfig) -> Result<Self> {
        // 确保数据目录存在
        fs::create_dir_all(&config.data_dir).context("创建数据目录失败")?;
        fs::create_dir_all(&config.stream.workspace_base).context("创建工作区目录失败")?;

        let hub = EventHub::new(config.stream.queue_capacity, config.stream.keepalive);
        let registry = SessionRegistry::new(Arc::new(config.stream.clone()), hub);
        let handler = Arc::new(Handler::new(registry.clone()));

        Ok(Self {
            config,
            registry,
            handler,
            next_conn_id: AtomicU64::new(1),
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// 运行 Agent
    pub async fn run(self: Arc<Self>) -> Result<()> {
        // 写入 PID 文件
        self.write_pid_file()?;

        // 清理旧的 socket 文件
        let socket_path = self.config.socket_path();
        if socket_path.exists() {
            fs::remove_file(&socket_path)?;
        }

        // 创建 Unix Socket 监听器
        let listener = UnixListener::bind(&socket_path).context("绑定 socket 失败")?;

        // 设置 socket 权限为 0600
        fs::set_permissions(&socket_path, fs::Permissions::from_mode(0o600))?;

        tracing::info!("🚀 Task agent started: {:?}", socket_path);

        // 启动空闲检测
        let agent_for_idle = self.clone();
        tokio::spawn(async move {
            agent_for_idle.idle_checker().await;
        });

        // 启动会话清理
        let agent_for_sweep = self.clone();
        tokio::spawn(async move {
            agent_for_sweep.session_sweeper().await;
        });

        // 接受连接
        let mut poll = interval(Duration::from_secs(1));
        loop {
            // 只有当 shutdown 信号发出 且 没有活跃连接 时才退出
            if self.shutdown.load(Ordering::Relaxed) && self.handler.connection_count() == 0 {
                break;
            }

            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, _)) => {
                            let agent = self.clone();
                            tokio::spawn(async move {
                                if let Err(e) = agent.handle_connection(stream).await {
                                    tracing::error!("处理连接失败: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("接受连接失败: {}", e);
                        }
                    }
                }
                _ = poll.tick() => {}
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("收到中断信号，准备退出...");
                    break;
                }
            }
        }

        self.registry.cancel_all(CancelReason::Shutdown);
        self.cleanup();
        Ok(())
    }

    /// 处理单个连接
    async fn handle_connection(&self, stream: UnixStream) -> Result<()> {
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);

        // 创建消息发送通道（响应和推送共用）
        let (tx, mut rx) = mpsc::channel::<String>(self.config.stream.queue_capacity.max(16));

        let conn_id: ConnId = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        self.handler.connect(conn_id);
        tracing::debug!("📥 新连接: conn_id={}", conn_id);

        // 启动发送任务
        let write_handle = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if writer.write_all(msg.as_bytes()).await.is_err() {
                    break;
                }
            }
        });

        // 读取请求
        let mut line = Vec::new();
        loop {
            line.clear();
            let read = (&mut reader)
                .take(MAX_REQUEST_BYTES)
                .read_until(b'\n', &mut line)
                .await;
            match read {
                Ok(0) => {
                    // 连接关闭
                    break;
                }
                Ok(_) => {
                    if line.last() != Some(&b'\n') && line.len() as u64 >= MAX_REQUEST_BYTES {
                        tracing::warn!("请求过大，关闭连接: conn_id={}", conn_id);
                        let response = Response::error(400, "Request too large");
                        let _ = tx.send(format!("{}\n", serde_json::to_string(&response)?)).await;
                        break;
                    }

                    let text = String::from_utf8_lossy(&line);
                    if text.trim().is_empty() {
                        continue;
                    }

                    // 解析请求
                    let request: Request = match serde_json::from_str(text.trim()) {
                        Ok(r) => r,
                        Err(e) => {
                            tracing::warn!("解析请求失败: {}", e);
                            let response = Response::error(400, format!("Invalid JSON: {}", e));
                            let resp_json = serde_json::to_string(&response)?;
                            if tx.send(format!("{}\n", resp_json)).await.is_err() {
                                break;
                            }
                            continue;
                        }
                    };

                    // 处理请求
                    let response = self.handler.handle(conn_id, &tx, request).await;
                    let resp_json = serde_json::to_string(&response)?;

                    // 发送响应
                    if tx.send(format!("{}\n", resp_json)).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::error!("读取失败: {}", e);
                    break;
                }
            }
        }

        // 清理：取消订阅（最后一个订阅者离开会取消执行）
        self.handler.disconnect(conn_id);
        drop(tx);
        write_handle.abort();
        tracing::debug!("📤 连接关闭: conn_id={}", conn_id);

        Ok(())
    }

    /// 空闲检测
    async fn idle_checker(&self) {
        let mut check_interval = interval(Duration::from_secs(5));
        let mut idle_count = 0u64;
        let idle_threshold = (self.config.idle_timeout_secs / 5).max(1);

        loop {
            check_interval.tick().await;

            let busy = self.handler.connection_count() > 0 || self.registry.has_active_executions();
            if busy {
                // 有连接或执行中的任务时重置状态
                idle_count = 0;
                if self.shutdown.load(Ordering::Relaxed) {
                    tracing::info!("🔄 有新连接，取消退出");
                    self.shutdown.store(false, Ordering::Relaxed);
                }
            } else {
                idle_count += 1;
                if idle_count >= idle_threshold && !self.shutdown.load(Ordering::Relaxed) {
                    tracing::info!("⏰ 空闲超时 ({}s)，准备退出...", self.config.idle_timeout_secs);
                    self.shutdown.store(true, Ordering::Relaxed);
                }
            }
        }
    }

    /// 定期清理空闲会话
    async fn session_sweeper(&self) {
        let max_idle = self.config.stream.session_idle_timeout;
        let period = (max_idle / 4).clamp(Duration::from_secs(1), Duration::from_secs(60));
        let mut ticker = interval(period);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            self.registry.sweep_idle(max_idle).await;
        }
    }

    /// 写入 PID 文件
    fn write_pid_file(&self) -> Result<()> {
        let pid = std::process::id();
        let pid_path = self.config.pid_path();
        fs::write(&pid_path, pid.to_string())?;
        fs::set_permissions(&pid_path, fs::Permissions::from_mode(0o600))?;
        tracing::debug!("📝 写入 PID 文件: {} (pid={})", pid_path.display(), pid);
        Ok(())
    }

    /// 清理资源
    fn cleanup(&self) {
        let socket_path = self.config.socket_path();
        if socket_path.exists() {
            let _ = fs::remove_file(&socket_path);
        }

        let pid_path = self.config.pid_path();
        if pid_path.exists() {
            let _ = fs::remove_file(&pid_path);
        }

        tracing::info!("🧹 Agent 清理完成");
    }
}

/// 检查 Agent 是否正在运行
pub fn is_agent_running(config: &AgentConfig) -> bool {
    let pid_str = match fs::read_to_string(config.pid_path()) {
        Ok(s) => s,
        Err(_) => return false,
    };

    let pid: i32 = match pid_str.trim().parse() {
        Ok(p) => p,
        Err(_) => return false,
    };

    // 检查进程是否存在
    unsafe { libc::kill(pid, 0) == 0 }
}

/// 清理残留的 Agent 状态
pub fn cleanup_stale_agent(config: &AgentConfig) -> Result<()> {
    let socket_path = config.socket_path();
    let pid_path = config.pid_path();

    if socket_path.exists() {
        fs::remove_file(&socket_path)?;
        tracing::debug!("🧹 删除残留 socket: {:?}", socket_path);
    }

    if pid_path.exists() {
        fs::remove_file(&pid_path)?;
        tracing::debug!("🧹 删除残留 PID 文件: {:?}", pid_path);
    }

    Ok(())
}
