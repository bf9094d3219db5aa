//! Agent Client 连接逻辑
//!
//! 实现连接或启动 Agent 的逻辑，以及会话/任务/文件请求的封装

use std::fs;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio::time::sleep;

use crate::event::Frame;
use crate::protocol::{Incoming, QueryType, Request, Response};
use crate::types::{DirectoryStructure, FileContent, FileInfo, PermissionMode};

/// Agent 二进制名
const AGENT_BINARY: &str = "vimo-task-agent";

/// Client 配置
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// 数据目录（默认 ~/.vimo）
    pub data_dir: PathBuf,
    /// 组件名称
    pub component: String,
    /// 组件版本
    pub version: String,
    /// 连接重试次数
    pub connect_retries: u32,
    /// 重试间隔（毫秒）
    pub retry_interval_ms: u64,
    /// Agent 二进制路径覆盖（优先于默认路径）
    pub agent_binary_override: Option<PathBuf>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        let data_dir = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".vimo");

        Self {
            data_dir,
            component: "unknown".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            connect_retries: 3,
            retry_interval_ms: 500,
            agent_binary_override: None,
        }
    }
}

impl ClientConfig {
    /// 创建新的配置
    pub fn new(component: &str) -> Self {
        Self {
            component: component.to_string(),
            ..Default::default()
        }
    }

    /// 设置数据目录
    pub fn with_data_dir(mut self, dir: PathBuf) -> Self {
        self.data_dir = dir;
        self
    }

    /// 设置 Agent 二进制路径
    pub fn with_agent_binary(mut self, path: PathBuf) -> Self {
        self.agent_binary_override = Some(path);
        self
    }

    /// Socket 路径
    pub fn socket_path(&self) -> PathBuf {
        self.data_dir.join("task-agent.sock")
    }

    /// PID 文件路径
    pub fn pid_path(&self) -> PathBuf {
        self.data_dir.join("task-agent.pid")
    }

    /// Agent 二进制默认路径
    pub fn default_agent_binary_path(&self) -> PathBuf {
        self.data_dir.join("bin").join(AGENT_BINARY)
    }

    /// 查找 Agent 二进制（如果需要，自动部署到 ~/.vimo/bin/）
    ///
    /// 查找顺序：
    /// 1. agent_binary_override（配置覆盖）
    /// 2. VIMO_TASK_AGENT_PATH 环境变量
    /// 3. ~/.vimo/bin/vimo-task-agent（默认安装路径）
    /// 4. Cargo target 目录 → 自动部署到 ~/.vimo/bin/
    pub fn find_agent_binary(&self) -> Option<PathBuf> {
        if let Some(ref path) = self.agent_binary_override {
            if path.exists() {
                return Some(path.clone());
            }
        }

        if let Ok(path) = std::env::var("VIMO_TASK_AGENT_PATH") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        let default_path = self.default_agent_binary_path();
        if default_path.exists() {
            return Some(default_path);
        }

        if let Some(source_path) = self.find_agent_source() {
            if let Err(e) = self.deploy_agent(&source_path) {
                tracing::warn!("自动部署 Agent 失败: {}", e);
                return Some(source_path);
            }
            return Some(default_path);
        }

        None
    }

    /// 查找 Agent 源二进制（用于自动部署）
    fn find_agent_source(&self) -> Option<PathBuf> {
        for profile in ["release", "debug"] {
            let cargo_path = PathBuf::from(format!("target/{}/{}", profile, AGENT_BINARY));
            if cargo_path.exists() {
                return Some(cargo_path);
            }
        }

        // 与当前可执行文件同目录
        let exe_path = std::env::current_exe().ok()?;
        let sibling = exe_path.parent()?.join(AGENT_BINARY);
        sibling.exists().then_some(sibling)
    }

    /// 部署 Agent 到 ~/.vimo/bin/
    fn deploy_agent(&self, source: &PathBuf) -> std::io::Result<()> {
        let install_dir = self.data_dir.join("bin");
        let install_path = install_dir.join(AGENT_BINARY);

        fs::create_dir_all(&install_dir)?;
        fs::copy(source, &install_path)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&install_path, fs::Permissions::from_mode(0o755))?;
        }

        tracing::info!("✅ Agent 已部署: {:?} -> {:?}", source, install_path);
        Ok(())
    }
}

/// 推送：(会话 ID, 帧)
pub type PushMessage = (String, Frame);

/// Agent Client
///
/// 同一连接上的响应和推送由读取任务分流：响应按请求顺序一一对应，
/// 推送进入单独的通道，通过 [`AgentClient::recv_push`] 取出。
pub struct AgentClient {
    writer: OwnedWriteHalf,
    responses: mpsc::Receiver<Response>,
    pushes: mpsc::UnboundedReceiver<PushMessage>,
    agent_version: String,
}

impl AgentClient {
    /// 握手返回的 Agent 版本
    pub fn agent_version(&self) -> &str {
        &self.agent_version
    }

    /// 发送请求并等待响应
    pub async fn request(&mut self, request: &Request) -> Result<Response> {
        let request_line = format!("{}\n", serde_json::to_string(request)?);
        self.writer.write_all(request_line.as_bytes()).await?;

        self.responses
            .recv()
            .await
            .ok_or_else(|| anyhow::anyhow!("Connection closed"))
    }

    /// 发送请求，错误响应转为 Err
    async fn call(&mut self, request: Request) -> Result<Response> {
        let name = request_name(&request);
        match self.request(&request).await? {
            Response::Error { code, message } => Err(anyhow::anyhow!("{} failed: {} (code={})", name, message, code)),
            response => Ok(response),
        }
    }

    async fn call_ok(&mut self, request: Request) -> Result<()> {
        match self.call(request).await? {
            Response::Ok => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// 创建会话（服务端生成 ID），返回 (会话 ID, 工作区路径)
    pub async fn create_session(&mut self, permission_mode: Option<PermissionMode>) -> Result<(String, String)> {
        match self.call(Request::CreateSession { permission_mode }).await? {
            Response::SessionCreated { session_id, workspace } => Ok((session_id, workspace)),
            other => Err(unexpected(other)),
        }
    }

    /// 启动指定 ID 的会话，返回工作区路径
    pub async fn start_session(&mut self, session_id: &str, permission_mode: Option<PermissionMode>) -> Result<String> {
        let request = Request::StartSession {
            session_id: session_id.to_string(),
            permission_mode,
        };
        match self.call(request).await? {
            Response::SessionCreated { workspace, .. } => Ok(workspace),
            other => Err(unexpected(other)),
        }
    }

    /// 提交任务，返回执行 ID；会话不存在时 Agent 会创建它
    pub async fn submit_task(
        &mut self,
        session_id: &str,
        prompt: &str,
        permission_mode: Option<PermissionMode>,
    ) -> Result<u64> {
        let request = Request::SubmitTask {
            session_id: session_id.to_string(),
            prompt: prompt.to_string(),
            permission_mode,
        };
        match self.call(request).await? {
            Response::TaskAccepted { execution_id, .. } => Ok(execution_id),
            other => Err(unexpected(other)),
        }
    }

    /// 取消执行中的任务
    pub async fn cancel_task(&mut self, session_id: &str) -> Result<()> {
        self.call_ok(Request::CancelTask {
            session_id: session_id.to_string(),
        })
        .await
    }

    /// 订阅会话事件，返回订阅者 ID
    pub async fn attach(&mut self, session_id: &str) -> Result<u64> {
        let request = Request::Attach {
            session_id: session_id.to_string(),
        };
        match self.call(request).await? {
            Response::Attached { subscriber_id, .. } => Ok(subscriber_id),
            other => Err(unexpected(other)),
        }
    }

    /// 取消订阅
    pub async fn detach(&mut self, session_id: &str) -> Result<()> {
        self.call_ok(Request::Detach {
            session_id: session_id.to_string(),
        })
        .await
    }

    pub async fn list_files(&mut self, session_id: &str) -> Result<Vec<FileInfo>> {
        let request = Request::ListFiles {
            session_id: session_id.to_string(),
        };
        match self.call(request).await? {
            Response::Files { files } => Ok(files),
            other => Err(unexpected(other)),
        }
    }

    pub async fn file_tree(&mut self, session_id: &str) -> Result<DirectoryStructure> {
        let request = Request::FileTree {
            session_id: session_id.to_string(),
        };
        match self.call(request).await? {
            Response::Tree { structure } => Ok(structure),
            other => Err(unexpected(other)),
        }
    }

    pub async fn read_file(&mut self, session_id: &str, path: &str) -> Result<FileContent> {
        let request = Request::ReadFile {
            session_id: session_id.to_string(),
            path: path.to_string(),
        };
        match self.call(request).await? {
            Response::FileContent { file } => Ok(file),
            other => Err(unexpected(other)),
        }
    }

    pub async fn write_file(&mut self, session_id: &str, path: &str, content: &str) -> Result<()> {
        self.call_ok(Request::WriteFile {
            session_id: session_id.to_string(),
            path: path.to_string(),
            content: content.to_string(),
        })
        .await
    }

    pub async fn delete_file(&mut self, session_id: &str, path: &str) -> Result<()> {
        self.call_ok(Request::DeleteFile {
            session_id: session_id.to_string(),
            path: path.to_string(),
        })
        .await
    }

    /// 清理会话（取消执行、断开订阅者、删除工作区）
    pub async fn clear_session(&mut self, session_id: &str) -> Result<()> {
        self.call_ok(Request::ClearSession {
            session_id: session_id.to_string(),
        })
        .await
    }

    pub async fn heartbeat(&mut self) -> Result<()> {
        self.call_ok(Request::Heartbeat).await
    }

    /// 查询
    pub async fn query(&mut self, query_type: QueryType) -> Result<serde_json::Value> {
        match self.call(Request::Query { query_type }).await? {
            Response::QueryResult { data } => Ok(data),
            other => Err(unexpected(other)),
        }
    }

    /// 接收推送（连接关闭返回 None）
    pub async fn recv_push(&mut self) -> Option<PushMessage> {
        self.pushes.recv().await
    }

    /// 获取推送接收器（用于 select!）
    pub fn push_receiver(&mut self) -> &mut mpsc::UnboundedReceiver<PushMessage> {
        &mut self.pushes
    }
}

fn request_name(request: &Request) -> &'static str {
    match request {
        Request::Handshake { .. } => "Handshake",
        Request::CreateSession { .. } => "CreateSession",
        Request::StartSession { .. } => "StartSession",
        Request::SubmitTask { .. } => "SubmitTask",
        Request::CancelTask { .. } => "CancelTask",
        Request::Attach { .. } => "Attach",
        Request::Detach { .. } => "Detach",
        Request::ListFiles { .. } => "ListFiles",
        Request::FileTree { .. } => "FileTree",
        Request::ReadFile { .. } => "ReadFile",
        Request::WriteFile { .. } => "WriteFile",
        Request::DeleteFile { .. } => "DeleteFile",
        Request::ClearSession { .. } => "ClearSession",
        Request::Heartbeat => "Heartbeat",
        Request::Query { .. } => "Query",
    }
}

fn unexpected(response: Response) -> anyhow::Error {
    anyhow::anyhow!("Unexpected response: {:?}", response)
}

/// 连接已运行的 Agent（不尝试启动）
pub async fn connect(config: ClientConfig) -> Result<AgentClient> {
    let stream = UnixStream::connect(config.socket_path())
        .await
        .with_context(|| format!("连接 Agent 失败: {:?}", config.socket_path()))?;
    finish_connect(config, stream).await
}

/// 连接或启动 Agent
///
/// 连接流程：
/// 1. 尝试连接 socket（重试 3 次，间隔 500ms）
/// 2. 连接失败 → 检查残留状态
/// 3. 清理残留 → 启动 Agent
/// 4. 等待 Agent ready → 连接
pub async fn connect_or_start_agent(config: ClientConfig) -> Result<AgentClient> {
    let socket_path = config.socket_path();

    for attempt in 1..=config.connect_retries {
        match UnixStream::connect(&socket_path).await {
            Ok(stream) => {
                tracing::debug!("连接 Agent 成功 (attempt={})", attempt);
                return finish_connect(config, stream).await;
            }
            Err(e) => {
                tracing::debug!("连接 Agent 失败 (attempt={}): {}", attempt, e);
                if attempt < config.connect_retries {
                    sleep(Duration::from_millis(config.retry_interval_ms)).await;
                }
            }
        }
    }

    if is_agent_stuck(&config) {
        tracing::warn!("检测到 Agent 卡死，清理残留状态...");
        cleanup_stale(&config)?;
    }

    start_agent(&config)?;

    for attempt in 1..=10 {
        sleep(Duration::from_millis(200)).await;

        if let Ok(stream) = UnixStream::connect(&socket_path).await {
            tracing::info!("Agent 启动成功，已连接");
            return finish_connect(config, stream).await;
        }

        tracing::debug!("等待 Agent ready (attempt={})", attempt);
    }

    Err(anyhow::anyhow!("启动 Agent 超时"))
}

/// 完成连接（握手 + 启动读取任务）
async fn finish_connect(config: ClientConfig, stream: UnixStream) -> Result<AgentClient> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    let handshake = Request::Handshake {
        component: config.component.clone(),
        version: config.version.clone(),
    };
    writer
        .write_all(format!("{}\n", serde_json::to_string(&handshake)?).as_bytes())
        .await?;

    let mut line = String::new();
    reader.read_line(&mut line).await?;

    let agent_version = match serde_json::from_str::<Response>(line.trim())? {
        Response::HandshakeOk { agent_version } => {
            tracing::info!("握手成功: agent_version={}", agent_version);
            agent_version
        }
        Response::Error { code, message } => {
            return Err(anyhow::anyhow!("握手失败: {} (code={})", message, code));
        }
        _ => {
            return Err(anyhow::anyhow!("握手响应异常"));
        }
    };

    let (response_tx, responses) = mpsc::channel(16);
    let (push_tx, pushes) = mpsc::unbounded_channel();

    // 读取任务：按 type 分流响应与推送
    tokio::spawn(async move {
        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) => break,
                Ok(_) => match Incoming::parse(&line) {
                    Some(Incoming::Response(response)) => {
                        if response_tx.send(response).await.is_err() {
                            break;
                        }
                    }
                    Some(Incoming::Push { session_id, frame }) => {
                        if push_tx.send((session_id, frame)).is_err() {
                            break;
                        }
                    }
                    None => tracing::debug!("忽略无法识别的消息: {}", line.trim()),
                },
                Err(_) => break,
            }
        }
    });

    Ok(AgentClient {
        writer,
        responses,
        pushes,
        agent_version,
    })
}

/// 检查 Agent 是否卡死
fn is_agent_stuck(config: &ClientConfig) -> bool {
    let pid = match fs::read_to_string(config.pid_path())
        .ok()
        .and_then(|s| s.trim().parse::<i32>().ok())
    {
        Some(pid) => pid,
        None => return false,
    };

    let process_alive = unsafe { libc::kill(pid, 0) == 0 };

    // 进程存在但 socket 不在，认为是卡死
    process_alive && !config.socket_path().exists()
}

/// 清理残留状态
fn cleanup_stale(config: &ClientConfig) -> Result<()> {
    let socket_path = config.socket_path();
    let pid_path = config.pid_path();

    if let Some(pid) = fs::read_to_string(&pid_path)
        .ok()
        .and_then(|s| s.trim().parse::<i32>().ok())
    {
        unsafe {
            libc::kill(pid, libc::SIGKILL);
        }
        tracing::debug!("杀死残留 Agent 进程: pid={}", pid);
    }

    if socket_path.exists() {
        fs::remove_file(&socket_path)?;
    }

    if pid_path.exists() {
        fs::remove_file(&pid_path)?;
    }

    Ok(())
}

/// 启动 Agent（数据目录通过环境变量传递）
fn start_agent(config: &ClientConfig) -> Result<()> {
    let agent_path = config.find_agent_binary().ok_or_else(|| {
        anyhow::anyhow!(
            "找不到 Agent 二进制。\n\
             尝试过的路径：\n\
             - 配置覆盖: {:?}\n\
             - 环境变量 VIMO_TASK_AGENT_PATH: {:?}\n\
             - 默认路径: {:?}\n\
             - Cargo target 目录\n\
             \n\
             请设置 VIMO_TASK_AGENT_PATH 环境变量，或运行 `cargo build --features agent --bin vimo-task-agent`",
            config.agent_binary_override,
            std::env::var("VIMO_TASK_AGENT_PATH").ok(),
            config.default_agent_binary_path()
        )
    })?;

    tracing::info!("启动 Agent: {:?}", agent_path);

    Command::new(&agent_path)
        .env("VIMO_TASK_DATA_DIR", &config.data_dir)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .context("启动 Agent 失败")?;

    Ok(())
}
