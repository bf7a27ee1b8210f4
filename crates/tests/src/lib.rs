//! # Integration Tests
//!
//! 集成测试与端到端测试。
//!
//! 负责：
//! - 合约快照测试（帧载荷格式）
//! - 本地模式 e2e：配置 -> Dispatcher -> 磁盘上的 CSV
//! - Broker 模式 e2e：mock 传输上的信任升级与发布

#[cfg(test)]
mod contract_tests {
    use contracts::{decode_frames, FrameRecord};
    use serde_json::json;

    /// 消费端依赖的载荷格式快照
    #[test]
    fn test_wire_payload_snapshot() {
        let frame = FrameRecord::new("a4c138f0e2b1", 2)
            .with_timestamp(1_700_000_000.5)
            .with_pressure(vec![1.5, 2.5])
            .with_imu([1.0, 2.0, 3.0], [0.0, 0.0, 0.0], [0.0, 0.0, 1.0]);

        let value: serde_json::Value =
            serde_json::from_slice(&frame.to_wire_bytes().unwrap()).unwrap();

        assert_eq!(
            value,
            json!([{
                "ts": 1_700_000_000.5,
                "dn": "a4c138f0e2b1",
                "sn": 2,
                "p": [1.5, 2.5],
                "mag": [1.0, 2.0, 3.0],
                "gyro": [0.0, 0.0, 0.0],
                "acc": [0.0, 0.0, 1.0],
            }])
        );
    }

    #[test]
    fn test_published_payload_decodes_back() {
        let frame = FrameRecord::new("dev", 1).with_timestamp(f64::NAN);
        let decoded = decode_frames(&frame.to_wire_bytes().unwrap()).unwrap();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].device_id, "dev");
        assert!(decoded[0].timestamp_seconds.is_nan());
    }
}

#[cfg(test)]
mod e2e_tests {
    use std::path::Path;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use config_loader::{ConfigFormat, ConfigLoader};
    use contracts::{decode_frames, BridgeConfig, FrameRecord, QosLevel, SinkKind};
    use dispatcher::sinks::network::mock::MockTransport;
    use dispatcher::{
        create_dispatcher, BridgeSink, Dispatcher, NetworkSink, SinkHandle, TransportError,
        TrustMode,
    };
    use tokio::sync::mpsc;

    // 2023-11-15 07:13:20 at +09:00
    const T0: f64 = 1_700_000_000.0;

    fn local_config(root: &Path) -> BridgeConfig {
        let toml = format!(
            r#"
local_mode = true
queue_capacity = 32

[local_store]
root = '{}'
flush_every_rows = 2
inactivity_timeout_secs = 60
utc_offset_minutes = 540
"#,
            root.display()
        );
        ConfigLoader::load_from_str(&toml, ConfigFormat::Toml).unwrap()
    }

    fn tls_config() -> BridgeConfig {
        let toml = r#"
[broker]
host = "broker.test"
port = 8883
client_id = "bridge-e2e"
topic = "etextile/frames"
raw_topic = "etextile/raw"
qos = 1

[broker.trust]
allow_insecure_fallback = false
"#;
        ConfigLoader::load_from_str(toml, ConfigFormat::Toml).unwrap()
    }

    fn frame(device: &str, ts: f64, pressure: &[f32]) -> FrameRecord {
        FrameRecord::new(device, pressure.len() as i32)
            .with_timestamp(ts)
            .with_pressure(pressure.to_vec())
    }

    /// End-to-end test: TOML 配置 -> Dispatcher -> 本地 CSV
    ///
    /// 验证：
    /// 1. 每个设备独立的会话文件
    /// 2. 超过不活跃时间后切换新文件
    /// 3. 文件头与数据行格式
    #[tokio::test]
    async fn test_e2e_local_mode_writes_session_files() {
        let dir = tempfile::tempdir().unwrap();
        let config = local_config(dir.path());
        assert_eq!(config.sink_kind(), SinkKind::Local);

        let (tx, rx) = mpsc::channel(16);
        let dispatcher = create_dispatcher(config, rx).await.unwrap();
        let sink = dispatcher.sink().cloned().unwrap();
        let handle = dispatcher.spawn();

        tx.send(frame("aa01", T0, &[1.0, 2.0])).await.unwrap();
        tx.send(frame("bb02", T0 + 1.0, &[5.0])).await.unwrap();
        tx.send(frame("aa01", T0 + 2.0, &[3.0, 4.0])).await.unwrap();
        // idle past the inactivity timeout
        tx.send(frame("aa01", T0 + 200.0, &[5.0, 6.0])).await.unwrap();
        drop(tx);

        let snapshot = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("dispatcher timed out")
            .unwrap();
        assert_eq!(snapshot.delivered_count, 4);
        assert_eq!(snapshot.failure_count, 0);
        assert_eq!(sink.active_sessions(), 0);

        let first = std::fs::read_to_string(dir.path().join("aa01/20231115/071320.csv")).unwrap();
        let lines: Vec<&str> = first.lines().collect();
        assert_eq!(lines[0], "// DN: aa01, SN: 2");
        assert_eq!(
            lines[1],
            "Timestamp,P1,P2,Mag_x,Mag_y,Mag_z,Gyro_x,Gyro_y,Gyro_z,Acc_x,Acc_y,Acc_z"
        );
        assert_eq!(lines.len(), 4);
        assert!(lines[2].starts_with("1700000000.0,1.000000,2.000000,"));
        assert!(lines[3].starts_with("1700000002.0,3.000000,4.000000,"));

        let rotated = std::fs::read_to_string(dir.path().join("aa01/20231115/071640.csv")).unwrap();
        assert_eq!(rotated.lines().count(), 3);

        let other = std::fs::read_to_string(dir.path().join("bb02/20231115/071321.csv")).unwrap();
        assert_eq!(other.lines().next(), Some("// DN: bb02, SN: 1"));
    }

    /// 本地模式下原始载荷被忽略，不产生任何文件
    #[tokio::test]
    async fn test_e2e_local_mode_ignores_raw_payloads() {
        let dir = tempfile::tempdir().unwrap();
        let (_tx, rx) = mpsc::channel(4);
        let dispatcher = create_dispatcher(local_config(dir.path()), rx).await.unwrap();
        let sink = dispatcher.sink().cloned().unwrap();

        assert!(matches!(sink, BridgeSink::Local(_)));
        assert!(!sink.publish_raw(b"[{}]".to_vec()).await.unwrap());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    /// Broker 模式：固定证书失败后升级到系统信任，帧以单元素数组发布
    #[tokio::test]
    async fn test_e2e_broker_escalates_and_publishes() {
        let config = tls_config();
        let transport = MockTransport::new().fail_with(
            TrustMode::Pinned,
            TransportError::Security("unknown issuer".into()),
        );
        let sink = NetworkSink::with_transport("mqtt", &config.broker, transport.clone());
        assert_eq!(
            sink.trust_plan(),
            &[TrustMode::Pinned, TrustMode::SystemDefault]
        );
        assert_eq!(sink.connect().await.unwrap(), TrustMode::SystemDefault);

        let received = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&received);
        assert!(sink
            .subscribe("etextile/cmd/#", move |msg| {
                seen.lock().unwrap().push(msg.topic);
            })
            .await
            .unwrap());

        let (tx, rx) = mpsc::channel(16);
        let dispatcher = Dispatcher::with_handle(
            SinkHandle::spawn(sink.clone(), config.queue_capacity),
            rx,
        );
        let handle = dispatcher.spawn();

        for i in 0..3 {
            tx.send(frame("cc03", T0 + f64::from(i), &[0.5]))
                .await
                .unwrap();
        }
        assert!(sink.publish_raw(b"raw-bytes".to_vec()).await.unwrap());
        assert_eq!(transport.deliver_inbound("etextile/cmd/reset", "1"), 1);
        drop(tx);

        let snapshot = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("dispatcher timed out")
            .unwrap();
        assert_eq!(snapshot.delivered_count, 3);

        let published = transport.published();
        let frames: Vec<_> = published
            .iter()
            .filter(|m| m.topic == "etextile/frames")
            .collect();
        assert_eq!(frames.len(), 3);
        for message in &frames {
            assert_eq!(message.qos, QosLevel::AtLeastOnce);
            let decoded = decode_frames(&message.payload).unwrap();
            assert_eq!(decoded.len(), 1);
            assert_eq!(decoded[0].device_id, "cc03");
        }
        assert!(published
            .iter()
            .any(|m| m.topic == "etextile/raw" && m.payload.as_ref() == b"raw-bytes"));

        assert_eq!(*received.lock().unwrap(), vec!["etextile/cmd/reset"]);

        assert_eq!(
            transport.attempts(),
            vec![TrustMode::Pinned, TrustMode::SystemDefault]
        );
        // worker shutdown closes the link, later publishes are skipped
        assert!(!sink.state().is_connected());
        assert!(!sink.publish_raw(b"late".to_vec()).await.unwrap());
    }

    /// 所有信任模式都失败时，报告首个错误并附带后续错误
    #[tokio::test]
    async fn test_e2e_broker_total_failure_reports_first_error() {
        let config = tls_config();
        let transport = MockTransport::new()
            .fail_with(TrustMode::Pinned, TransportError::Security("pinned".into()))
            .fail_with(
                TrustMode::SystemDefault,
                TransportError::Security("system".into()),
            );
        let sink = NetworkSink::with_transport("mqtt", &config.broker, transport.clone());

        let err = sink.connect().await.unwrap_err().to_string();
        assert!(err.contains("pinned"));
        assert!(err.contains("system"));
        assert!(!sink.state().is_connected());
        assert_eq!(transport.open_links(), 0);
    }
}
