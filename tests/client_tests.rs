//! Client 单元测试

#[cfg(feature = "client")]
mod tests {
    use ai_cli_task_stream::client::{connect, ClientConfig};
    use std::path::PathBuf;

    #[test]
    fn test_client_config_default() {
        let config = ClientConfig::default();

        assert_eq!(config.component, "unknown");
        assert_eq!(config.connect_retries, 3);
        assert_eq!(config.retry_interval_ms, 500);
        assert!(config.data_dir.to_str().unwrap().contains(".vimo"));
    }

    #[test]
    fn test_client_config_new() {
        let config = ClientConfig::new("test-component");

        assert_eq!(config.component, "test-component");
        assert_eq!(config.connect_retries, 3);
        assert!(config.agent_binary_override.is_none());
    }

    #[test]
    fn test_client_config_paths() {
        let config = ClientConfig::default().with_data_dir(PathBuf::from("/tmp/test-vimo"));

        assert_eq!(config.socket_path(), PathBuf::from("/tmp/test-vimo/task-agent.sock"));
        assert_eq!(config.pid_path(), PathBuf::from("/tmp/test-vimo/task-agent.pid"));
        assert_eq!(
            config.default_agent_binary_path(),
            PathBuf::from("/tmp/test-vimo/bin/vimo-task-agent")
        );
    }

    #[test]
    fn test_agent_binary_override_wins() {
        let tmp = tempfile::tempdir().unwrap();
        let binary = tmp.path().join("custom-agent");
        std::fs::write(&binary, "").unwrap();

        let config = ClientConfig::new("test")
            .with_data_dir(tmp.path().to_path_buf())
            .with_agent_binary(binary.clone());
        assert_eq!(config.find_agent_binary(), Some(binary));
    }

    #[tokio::test]
    async fn test_connect_without_agent_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let config = ClientConfig::new("test").with_data_dir(tmp.path().to_path_buf());

        assert!(connect(config).await.is_err());
    }
}
