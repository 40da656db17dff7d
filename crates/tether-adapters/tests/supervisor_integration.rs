#[cfg(unix)]
mod supervisor_integration {
    use std::path::Path;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;
    use tether_adapters::SessionSupervisor;
    use tether_core::{MemoryResumeStore, TetherConfig};
    use tether_proto::{BoundaryEvent, PermissionDecision, PermissionMode, ResumeStore, StartOptions};
    use tokio::sync::mpsc::UnboundedReceiver;

    const WAIT: Duration = Duration::from_secs(10);

    fn tool_use(id: &str, name: &str, input: &serde_json::Value) -> String {
        serde_json::json!({
            "type": "assistant",
            "message": {"content": [{"type": "tool_use", "id": id, "name": name, "input": input}]}
        })
        .to_string()
    }

    fn denial(id: &str) -> String {
        serde_json::json!({
            "type": "user",
            "message": {"content": [{
                "type": "tool_result",
                "tool_use_id": id,
                "is_error": true,
                "content": "Error: requires approval"
            }]}
        })
        .to_string()
    }

    /// Shell script that prints `lines` and then appends its stdin to `log`.
    fn agent_script(lines: &[String], log: &Path) -> String {
        let mut script = String::new();
        for line in lines {
            script.push_str(&format!("printf '%s\\n' '{line}'\n"));
        }
        script.push_str(&format!("exec cat >> '{}'\n", log.display()));
        script
    }

    fn fake_agent_config(script: String) -> TetherConfig {
        let mut config = TetherConfig::default();
        config.agent.command = "sh".to_string();
        config.agent.args = vec!["-c".to_string(), script, "fake-agent".to_string()];
        config.agent.install_dirs = Vec::new();
        config.executor.shell_timeout_secs = 10;
        config
    }

    fn supervisor(
        config: TetherConfig,
        cwd: &Path,
    ) -> (
        SessionSupervisor,
        UnboundedReceiver<BoundaryEvent>,
        Arc<MemoryResumeStore>,
    ) {
        let store = Arc::new(MemoryResumeStore::new());
        let (supervisor, rx) = SessionSupervisor::new(config, store.clone());
        let supervisor = supervisor
            .with_default_cwd(cwd.to_path_buf())
            .with_grace_period(Duration::from_millis(500));
        (supervisor, rx, store)
    }

    fn supervised(cwd: &Path) -> StartOptions {
        StartOptions {
            cwd: Some(cwd.to_path_buf()),
            permission_mode: Some(PermissionMode::Supervised),
            ..StartOptions::default()
        }
    }

    async fn next_matching(
        rx: &mut UnboundedReceiver<BoundaryEvent>,
        mut pred: impl FnMut(&BoundaryEvent) -> bool,
    ) -> BoundaryEvent {
        tokio::time::timeout(WAIT, async {
            loop {
                let event = rx.recv().await.expect("event channel closed");
                if pred(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    async fn permission_request(rx: &mut UnboundedReceiver<BoundaryEvent>) -> BoundaryEvent {
        next_matching(rx, |e| matches!(e, BoundaryEvent::PermissionRequest { .. })).await
    }

    async fn wait_for_log(path: &Path, needle: &str, occurrences: usize) -> String {
        tokio::time::timeout(WAIT, async {
            loop {
                let content = std::fs::read_to_string(path).unwrap_or_default();
                if content.matches(needle).count() >= occurrences {
                    return content;
                }
                tokio::time::sleep(Duration::from_millis(25)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {needle:?} in {}", path.display()))
    }

    #[tokio::test]
    async fn denied_tool_produces_permission_request() {
        let temp = TempDir::new().expect("temp dir");
        let log = temp.path().join("stdin.log");
        let script = agent_script(
            &[
                tool_use("t1", "Bash", &serde_json::json!({"command": "ls"})),
                denial("t1"),
            ],
            &log,
        );
        let (supervisor, mut rx, _) = supervisor(fake_agent_config(script), temp.path());

        supervisor
            .start("s1", supervised(temp.path()))
            .await
            .expect("start");

        let started = rx.recv().await.expect("started");
        assert!(matches!(started, BoundaryEvent::SessionStarted { ref session_id, .. } if session_id == "s1"));

        let BoundaryEvent::PermissionRequest {
            session_id,
            tool_use_id,
            tool_name,
            input,
        } = permission_request(&mut rx).await
        else {
            unreachable!()
        };
        assert_eq!(session_id, "s1");
        assert_eq!(tool_use_id, "t1");
        assert_eq!(tool_name, "Bash");
        assert_eq!(input["command"], "ls");

        let snapshot = supervisor.snapshot("s1").await.expect("snapshot");
        assert!(snapshot.pending_tool_ids.is_empty());
        assert_eq!(snapshot.awaiting_decision, vec!["Bash"]);

        supervisor.abort("s1").await;
    }

    #[tokio::test]
    async fn allow_once_runs_command_in_session_cwd() {
        let temp = TempDir::new().expect("temp dir");
        std::fs::write(temp.path().join("marker.txt"), "").expect("marker");
        let log = temp.path().join("stdin.log");
        let script = agent_script(
            &[
                tool_use("t1", "Bash", &serde_json::json!({"command": "ls"})),
                denial("t1"),
            ],
            &log,
        );
        let (supervisor, mut rx, _) = supervisor(fake_agent_config(script), temp.path());

        supervisor
            .start("s1", supervised(temp.path()))
            .await
            .expect("start");
        permission_request(&mut rx).await;

        supervisor.respond("s1", PermissionDecision::AllowOnce).await;

        let content = wait_for_log(&log, "approved", 1).await;
        assert!(content.contains("[Tool approved and executed: Bash]"));
        assert!(content.contains("marker.txt"));

        let turn: serde_json::Value =
            serde_json::from_str(content.lines().next().expect("one turn")).expect("json turn");
        assert_eq!(turn["type"], "user");
        assert_eq!(turn["message"]["role"], "user");

        let snapshot = supervisor.snapshot("s1").await.expect("snapshot");
        assert!(snapshot.awaiting_decision.is_empty());
        assert!(snapshot.always_allowed.is_empty());

        supervisor.abort("s1").await;
    }

    #[tokio::test]
    async fn deny_sends_notice_without_side_effects() {
        let temp = TempDir::new().expect("temp dir");
        let log = temp.path().join("stdin.log");
        let script = agent_script(
            &[
                tool_use("t1", "Bash", &serde_json::json!({"command": "touch side-effect.txt"})),
                denial("t1"),
            ],
            &log,
        );
        let (supervisor, mut rx, _) = supervisor(fake_agent_config(script), temp.path());

        supervisor
            .start("s1", supervised(temp.path()))
            .await
            .expect("start");
        permission_request(&mut rx).await;

        supervisor.respond("s1", PermissionDecision::Deny).await;

        let content = wait_for_log(&log, "denied", 1).await;
        assert!(content.contains("[Tool denied by user: Bash]"));
        assert!(!content.contains("approved"));
        assert!(!temp.path().join("side-effect.txt").exists());

        supervisor.abort("s1").await;
    }

    #[tokio::test]
    async fn allow_always_skips_later_requests_for_same_tool() {
        let temp = TempDir::new().expect("temp dir");
        let log = temp.path().join("stdin.log");
        let mut script = String::new();
        script.push_str(&format!(
            "printf '%s\\n' '{}'\nprintf '%s\\n' '{}'\n",
            tool_use("t1", "Bash", &serde_json::json!({"command": "echo one"})),
            denial("t1"),
        ));
        // Second denial only after the first report arrives.
        script.push_str(&format!("read -r first\nprintf '%s\\n' \"$first\" >> '{}'\n", log.display()));
        script.push_str(&agent_script(
            &[
                tool_use("t2", "Bash", &serde_json::json!({"command": "echo two"})),
                denial("t2"),
            ],
            &log,
        ));
        let (supervisor, mut rx, _) = supervisor(fake_agent_config(script), temp.path());

        supervisor
            .start("s1", supervised(temp.path()))
            .await
            .expect("start");
        permission_request(&mut rx).await;

        supervisor.respond("s1", PermissionDecision::AllowAlways).await;

        let content = wait_for_log(&log, "[Tool approved and executed: Bash]", 2).await;
        assert!(content.contains("one"));
        assert!(content.contains("two"));

        let snapshot = supervisor.snapshot("s1").await.expect("snapshot");
        assert_eq!(snapshot.always_allowed, vec!["Bash"]);
        assert!(snapshot.awaiting_decision.is_empty());

        supervisor.abort("s1").await;
        let mut requests = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, BoundaryEvent::PermissionRequest { .. }) {
                requests += 1;
            }
        }
        assert_eq!(requests, 0, "no request after the first one");
    }

    #[tokio::test]
    async fn concurrent_denials_are_surfaced_in_order() {
        let temp = TempDir::new().expect("temp dir");
        let log = temp.path().join("stdin.log");
        let script = agent_script(
            &[
                tool_use("t1", "Bash", &serde_json::json!({"command": "echo first"})),
                tool_use("t2", "Write", &serde_json::json!({"file_path": "w.txt", "content": "x"})),
                denial("t1"),
                denial("t2"),
            ],
            &log,
        );
        let (supervisor, mut rx, _) = supervisor(fake_agent_config(script), temp.path());

        supervisor
            .start("s1", supervised(temp.path()))
            .await
            .expect("start");

        let first = permission_request(&mut rx).await;
        assert!(matches!(first, BoundaryEvent::PermissionRequest { ref tool_name, .. } if tool_name == "Bash"));

        supervisor.respond("s1", PermissionDecision::Deny).await;
        let second = permission_request(&mut rx).await;
        assert!(matches!(second, BoundaryEvent::PermissionRequest { ref tool_name, .. } if tool_name == "Write"));

        supervisor.respond("s1", PermissionDecision::AllowOnce).await;
        let content = wait_for_log(&log, "[Tool approved and executed: Write]", 1).await;
        let denied_at = content.find("[Tool denied by user: Bash]").expect("deny notice");
        let approved_at = content.find("[Tool approved and executed: Write]").expect("report");
        assert!(denied_at < approved_at);
        assert_eq!(
            std::fs::read_to_string(temp.path().join("w.txt")).expect("written"),
            "x"
        );

        supervisor.abort("s1").await;
    }

    #[tokio::test]
    async fn sessions_do_not_share_state() {
        let temp = TempDir::new().expect("temp dir");
        let dir_a = temp.path().join("a");
        let dir_b = temp.path().join("b");
        std::fs::create_dir_all(&dir_a).expect("dir a");
        std::fs::create_dir_all(&dir_b).expect("dir b");

        // One config serves both sessions; the script branches on the cwd.
        let script = format!(
            "case \"$(pwd -P)\" in\n*/a) {}\n;;\n*) {}\n;;\nesac\n",
            agent_script(
                &[
                    tool_use("a1", "Bash", &serde_json::json!({"command": "echo a"})),
                    denial("a1"),
                ],
                &dir_a.join("stdin.log"),
            ),
            agent_script(
                &[
                    tool_use("b1", "Write", &serde_json::json!({"file_path": "b.txt", "content": "b"})),
                    tool_use("b2", "Bash", &serde_json::json!({"command": "echo b"})),
                    denial("b1"),
                ],
                &dir_b.join("stdin.log"),
            ),
        );
        let (supervisor, mut rx, _) = supervisor(fake_agent_config(script), temp.path());

        let (a, b) = tokio::join!(
            supervisor.start("a", supervised(&dir_a)),
            supervisor.start("b", supervised(&dir_b)),
        );
        a.expect("start a");
        b.expect("start b");

        let mut requested = Vec::new();
        while requested.len() < 2 {
            if let BoundaryEvent::PermissionRequest {
                session_id,
                tool_name,
                ..
            } = permission_request(&mut rx).await
            {
                requested.push((session_id, tool_name));
            }
        }
        requested.sort();
        assert_eq!(
            requested,
            vec![
                ("a".to_string(), "Bash".to_string()),
                ("b".to_string(), "Write".to_string())
            ]
        );

        supervisor.respond("a", PermissionDecision::AllowAlways).await;
        wait_for_log(&dir_a.join("stdin.log"), "approved", 1).await;

        let snap_a = supervisor.snapshot("a").await.expect("snapshot a");
        let snap_b = supervisor.snapshot("b").await.expect("snapshot b");
        assert_eq!(snap_a.always_allowed, vec!["Bash"]);
        assert!(snap_a.pending_tool_ids.is_empty());
        assert!(snap_b.always_allowed.is_empty());
        assert_eq!(snap_b.pending_tool_ids, vec!["b2"]);
        assert_eq!(snap_b.awaiting_decision, vec!["Write"]);
        assert_eq!(snap_a.cwd, dir_a);
        assert_eq!(snap_b.cwd, dir_b);

        supervisor.abort_all().await;
        assert!(supervisor.list_sessions().await.is_empty());
    }

    #[tokio::test]
    async fn abort_is_idempotent_and_ends_session() {
        let temp = TempDir::new().expect("temp dir");
        let (supervisor, mut rx, _) = supervisor(
            fake_agent_config("exec cat > /dev/null".to_string()),
            temp.path(),
        );

        supervisor
            .start("s1", supervised(temp.path()))
            .await
            .expect("start");
        assert_eq!(supervisor.list_sessions().await, vec!["s1"]);

        supervisor.abort("s1").await;
        assert!(supervisor.list_sessions().await.is_empty());
        supervisor.abort("s1").await;
        supervisor.abort("never-started").await;

        let ended = next_matching(&mut rx, BoundaryEvent::is_terminal).await;
        assert!(matches!(ended, BoundaryEvent::SessionEnded { ref session_id, .. } if session_id == "s1"));
    }

    #[tokio::test]
    async fn stale_operations_are_ignored() {
        let temp = TempDir::new().expect("temp dir");
        let (supervisor, mut rx, _) = supervisor(
            fake_agent_config("exec cat > /dev/null".to_string()),
            temp.path(),
        );

        supervisor.respond("ghost", PermissionDecision::AllowOnce).await;
        supervisor.send("ghost", "hello", &[]).await;

        supervisor
            .start("s1", supervised(temp.path()))
            .await
            .expect("start");
        supervisor.respond("s1", PermissionDecision::Deny).await;

        supervisor.abort("s1").await;
        next_matching(&mut rx, BoundaryEvent::is_terminal).await;
        while let Ok(event) = rx.try_recv() {
            assert!(!matches!(event, BoundaryEvent::PermissionRequest { .. }));
        }
    }

    #[tokio::test]
    async fn exit_code_and_raw_lines_are_relayed() {
        let temp = TempDir::new().expect("temp dir");
        let script = "printf 'not json\\n'\nprintf 'oops\\n' >&2\nexit 3".to_string();
        let (supervisor, mut rx, _) = supervisor(fake_agent_config(script), temp.path());

        supervisor
            .start("s1", supervised(temp.path()))
            .await
            .expect("start");

        let mut raw = None;
        let mut stderr = None;
        let ended = next_matching(&mut rx, |event| {
            match event {
                BoundaryEvent::Raw { text, .. } => raw = Some(text.clone()),
                BoundaryEvent::Stderr { text, .. } => stderr = Some(text.clone()),
                _ => {}
            }
            event.is_terminal()
        })
        .await;

        assert_eq!(raw.as_deref(), Some("not json"));
        assert_eq!(stderr.as_deref(), Some("oops"));
        assert!(matches!(ended, BoundaryEvent::SessionEnded { exit_code: Some(3), .. }));
        assert!(supervisor.list_sessions().await.is_empty());
    }

    #[tokio::test]
    async fn spawn_failure_is_reported() {
        let temp = TempDir::new().expect("temp dir");
        let mut config = TetherConfig::default();
        config.agent.command = temp.path().join("missing-agent").display().to_string();
        let (supervisor, mut rx, _) = supervisor(config, temp.path());

        let result = supervisor.start("s1", supervised(temp.path())).await;
        assert!(result.is_err());

        let event = rx.recv().await.expect("error event");
        assert!(matches!(event, BoundaryEvent::SessionError { ref session_id, .. } if session_id == "s1"));
        assert!(supervisor.list_sessions().await.is_empty());
    }

    #[tokio::test]
    async fn init_event_records_resume_id_for_continue() {
        let temp = TempDir::new().expect("temp dir");
        let args_file = temp.path().join("args.txt");
        let script = format!(
            "printf '%s\\n' \"$*\" >> '{}'\nprintf '%s\\n' '{}'\nexec cat > /dev/null",
            args_file.display(),
            serde_json::json!({"type": "system", "subtype": "init", "session_id": "conv-42"}),
        );
        let (supervisor, mut rx, store) = supervisor(fake_agent_config(script), temp.path());

        supervisor
            .start("s1", supervised(temp.path()))
            .await
            .expect("start");
        next_matching(&mut rx, |e| matches!(e, BoundaryEvent::Agent { .. })).await;
        assert_eq!(store.resume_id("s1").as_deref(), Some("conv-42"));
        let first_spawn = supervisor.snapshot("s1").await.expect("snapshot").spawn_id;

        let options = StartOptions {
            continue_last: true,
            ..supervised(temp.path())
        };
        supervisor.start("s1", options).await.expect("restart");
        let second_spawn = supervisor.snapshot("s1").await.expect("snapshot").spawn_id;
        assert_ne!(first_spawn, second_spawn);
        assert_eq!(supervisor.list_sessions().await, vec!["s1"]);

        let args = wait_for_log(&args_file, "--resume conv-42", 1).await;
        let first_line = args.lines().next().expect("first spawn args");
        assert!(first_line.contains(&format!("--session-id {first_spawn}")));

        supervisor.abort("s1").await;
    }

    fn is_alive(pid: u32) -> bool {
        let pid = i32::try_from(pid).expect("pid fits i32");
        nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok()
    }

    async fn wait_until_exited(pid: u32) {
        tokio::time::timeout(WAIT, async {
            while is_alive(pid) {
                tokio::time::sleep(Duration::from_millis(25)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("process {pid} still running"));
    }

    async fn started(rx: &mut UnboundedReceiver<BoundaryEvent>) -> (String, u32) {
        match next_matching(rx, |e| matches!(e, BoundaryEvent::SessionStarted { .. })).await {
            BoundaryEvent::SessionStarted { spawn_id, pid, .. } => (spawn_id, pid.expect("pid")),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn restart_replaces_live_process() {
        let temp = TempDir::new().expect("temp dir");
        let (supervisor, mut rx, _) = supervisor(
            fake_agent_config("exec cat > /dev/null".to_string()),
            temp.path(),
        );

        supervisor
            .start("s1", supervised(temp.path()))
            .await
            .expect("start");
        let (first_spawn, first_pid) = started(&mut rx).await;

        supervisor
            .start("s1", supervised(temp.path()))
            .await
            .expect("restart");
        let (second_spawn, second_pid) = started(&mut rx).await;
        assert_ne!(first_spawn, second_spawn);

        wait_until_exited(first_pid).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        while let Ok(event) = rx.try_recv() {
            assert!(
                !event.is_terminal() && !matches!(event, BoundaryEvent::SessionStarted { .. }),
                "unexpected event after restart: {event:?}"
            );
        }
        assert!(is_alive(second_pid));
        let snapshot = supervisor.snapshot("s1").await.expect("snapshot");
        assert_eq!(snapshot.spawn_id, second_spawn);

        supervisor.abort("s1").await;
        next_matching(&mut rx, BoundaryEvent::is_terminal).await;
        wait_until_exited(second_pid).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_starts_leave_one_live_process() {
        let temp = TempDir::new().expect("temp dir");
        let (supervisor, mut rx, _) = supervisor(
            fake_agent_config("exec cat > /dev/null".to_string()),
            temp.path(),
        );

        for _ in 0..10 {
            let starts: Vec<_> = (0..2)
                .map(|_| {
                    let supervisor = supervisor.clone();
                    let options = supervised(temp.path());
                    tokio::spawn(async move { supervisor.start("s", options).await })
                })
                .collect();
            for start in starts {
                start.await.expect("join").expect("start");
            }

            let (_, first_pid) = started(&mut rx).await;
            let (_, second_pid) = started(&mut rx).await;
            assert_eq!(supervisor.list_sessions().await, vec!["s"]);

            supervisor.abort("s").await;
            assert!(supervisor.list_sessions().await.is_empty());
            wait_until_exited(first_pid).await;
            wait_until_exited(second_pid).await;
        }
    }

    #[tokio::test]
    async fn output_from_lingering_descendants_is_dropped_after_exit() {
        let temp = TempDir::new().expect("temp dir");
        let script = format!(
            "(sleep 3; printf '%s\\n' '{}') &\nexit 0",
            tool_use("late", "Bash", &serde_json::json!({"command": "ls"})),
        );
        let (supervisor, mut rx, _) = supervisor(fake_agent_config(script), temp.path());

        supervisor
            .start("s1", supervised(temp.path()))
            .await
            .expect("start");

        let mut agent_before_end = false;
        let ended = next_matching(&mut rx, |event| {
            agent_before_end |= matches!(event, BoundaryEvent::Agent { .. });
            event.is_terminal()
        })
        .await;
        assert!(matches!(ended, BoundaryEvent::SessionEnded { exit_code: Some(0), .. }));
        assert!(!agent_before_end);

        tokio::time::sleep(Duration::from_secs(2)).await;
        if let Ok(event) = rx.try_recv() {
            panic!("event after session ended: {event:?}");
        }
    }
}
