//! Remote command executor: one SSH session per call, a concurrent battery of
//! read-only diagnostics, then a sequential auth-log fallback chain.

use crate::error::{MonitorError, Result};
use crate::models::metrics::{
    CommandLog, HealthResponse, HostSnapshot, Metrics, MonitorResponse, OfflineReason,
};
use crate::models::server::{ConnectionTarget, Credential};
use crate::services::parser;
use crate::services::ssh::{CommandOutput, Connector, RemoteSession};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub mod commands {
    pub const CPU: &str = r#"top -bn1 | grep "Cpu(s)" | awk '{print 100 - $8}'"#;
    pub const MEMORY: &str = r#"free -m | awk '/Mem:/ {print $2 " " $3}'"#;
    pub const DISK: &str = r#"df -m / | awk 'NR==2 {print $2 " " $3}'"#;
    pub const UPTIME: &str = "uptime -p";
    pub const KERNEL: &str = "uname -r";
    pub const OS_NAME: &str = r#"grep PRETTY_NAME /etc/os-release | cut -d= -f2 | tr -d '"'"#;
    pub const PROCESSES: &str = "ps -eo pid,comm,%cpu,%mem,user --sort=-%cpu | head -n 6";
    pub const LOAD_AVERAGE: &str = "cat /proc/loadavg";

    pub const JOURNAL_AUTH: &str =
        "journalctl -t sshd -t sudo -t auth -n 10 --no-pager --reverse --output=short-iso";
    pub const AUTH_LOG_TAIL: &str = "tail -n 10 /var/log/auth.log | tac";
    pub const LOGIN_HISTORY: &str = "last -n 10";

    /// Tried in order until one prints something.
    pub const LOG_FALLBACKS: [&str; 3] = [JOURNAL_AUTH, AUTH_LOG_TAIL, LOGIN_HISTORY];

    pub const HEALTH: &str = r#"IP=$(hostname -I 2>/dev/null | awk '{print $1}'); [ -z "$IP" ] && IP=$(hostname -i 2>/dev/null | awk '{print $1}'); echo "$IP $(uptime -p 2>/dev/null || uptime)""#;
}

pub const COMMAND_LOG_CAP: usize = 50;
pub const OUTPUT_PREVIEW_CHARS: usize = 4096;
const COMMAND_FAILED: &str = "Command failed";
const NO_OUTPUT: &str = "(no output)";

/// One executed command, kept for the command log.
#[derive(Debug, Clone)]
struct CommandRun {
    command: &'static str,
    output: CommandOutput,
    timestamp: DateTime<Utc>,
}

impl CommandRun {
    fn stdout(&self) -> &str {
        &self.output.stdout
    }

    fn into_log(self) -> CommandLog {
        let text = if !self.output.stdout.trim().is_empty() {
            &self.output.stdout
        } else if !self.output.stderr.trim().is_empty() {
            &self.output.stderr
        } else {
            NO_OUTPUT
        };
        let output = match text.char_indices().nth(OUTPUT_PREVIEW_CHARS) {
            Some((idx, _)) => text[..idx].to_string(),
            None => text.to_string(),
        };

        CommandLog {
            id: uuid::Uuid::new_v4().to_string(),
            command: self.command.to_string(),
            output,
            timestamp: self.timestamp,
            exit_code: self.output.exit_code,
        }
    }
}

/// Runs a command without letting its failure escape.
async fn exec_guarded(session: &dyn RemoteSession, command: &'static str) -> CommandRun {
    let output = match session.exec(command).await {
        Ok(output) => output,
        Err(e) => {
            debug!("{}", MonitorError::Command(format!("`{}`: {}", command, e)));
            CommandOutput {
                stdout: String::new(),
                stderr: COMMAND_FAILED.to_string(),
                exit_code: -1,
            }
        }
    };
    CommandRun {
        command,
        output,
        timestamp: Utc::now(),
    }
}

/// Auth-log fallback chain. Stops at the first command with non-empty stdout;
/// returns that output, or `None` if every source came back empty.
async fn fetch_auth_log(session: &dyn RemoteSession, runs: &mut Vec<CommandRun>) -> Option<String> {
    for command in commands::LOG_FALLBACKS {
        let run = exec_guarded(session, command).await;
        let found = (!run.stdout().trim().is_empty()).then(|| run.stdout().to_string());
        runs.push(run);
        if found.is_some() {
            return found;
        }
    }
    None
}

fn connection_failure(err: MonitorError) -> MonitorResponse {
    let reason = match err {
        MonitorError::Authentication | MonitorError::Ssh(_) => OfflineReason::Handshake,
        _ => OfflineReason::Unreachable,
    };
    MonitorResponse::offline(format!("Connection failed: {}", err), reason)
}

fn ensure_connection_details(target: &ConnectionTarget) -> Result<()> {
    let secret = match &target.credential {
        Credential::PrivateKey(key) => key.trim(),
        Credential::Password(pw) => pw.as_str(),
    };
    if target.hostname.trim().is_empty() || secret.is_empty() {
        return Err(MonitorError::MissingConnectionDetails);
    }
    Ok(())
}

pub struct Executor {
    connector: Arc<dyn Connector>,
}

impl Executor {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self { connector }
    }

    /// Collects a full diagnostic snapshot. Only missing connection details
    /// are an error; every network or command failure is reported as data.
    pub async fn collect(&self, target: &ConnectionTarget) -> Result<MonitorResponse> {
        ensure_connection_details(target)?;

        let session = match self.connector.connect(target).await {
            Ok(session) => session,
            Err(e) if e.is_connection_failure() => {
                warn!("Connection failed for {}: {}", target.hostname, e);
                return Ok(connection_failure(e));
            }
            Err(e) => return Err(e),
        };

        let snapshot = self.gather(session.as_ref()).await;
        session.close().await;

        info!(
            "Collected {} from {} ({} commands)",
            snapshot.os,
            target.hostname,
            snapshot.command_logs.len()
        );
        Ok(MonitorResponse::Online(snapshot))
    }

    async fn gather(&self, session: &dyn RemoteSession) -> HostSnapshot {
        let captured_at = Utc::now();

        let (cpu, memory, disk, uptime, kernel, os, processes, load) = tokio::join!(
            exec_guarded(session, commands::CPU),
            exec_guarded(session, commands::MEMORY),
            exec_guarded(session, commands::DISK),
            exec_guarded(session, commands::UPTIME),
            exec_guarded(session, commands::KERNEL),
            exec_guarded(session, commands::OS_NAME),
            exec_guarded(session, commands::PROCESSES),
            exec_guarded(session, commands::LOAD_AVERAGE),
        );

        let metrics = Metrics {
            cpu: parser::parse_cpu(cpu.stdout()),
            ram: parser::parse_usage(memory.stdout()),
            disk: parser::parse_usage(disk.stdout()),
            uptime: parser::text_or(uptime.stdout(), "Unknown"),
            load_average: parser::parse_load_average(load.stdout()),
        };
        let os_name = parser::text_or(os.stdout(), "Linux");
        let kernel_version = parser::text_or(kernel.stdout(), "Unknown");
        let process_list = parser::parse_processes(processes.stdout());

        let mut runs = vec![cpu, memory, disk, uptime, kernel, os, processes, load];
        let security_events = match fetch_auth_log(session, &mut runs).await {
            Some(log) => parser::parse_security_events(&log, captured_at),
            None => vec![parser::log_access_placeholder(captured_at)],
        };

        let command_logs = runs
            .into_iter()
            .rev()
            .take(COMMAND_LOG_CAP)
            .map(CommandRun::into_log)
            .collect();

        HostSnapshot {
            metrics,
            os: os_name,
            kernel: kernel_version,
            security_events,
            processes: process_list,
            command_logs,
        }
    }

    /// Quick reachability check: primary IP and uptime over one command.
    pub async fn probe_health(&self, target: &ConnectionTarget) -> Result<HealthResponse> {
        ensure_connection_details(target)?;

        let session = match self.connector.connect(target).await {
            Ok(session) => session,
            Err(e) => {
                warn!("Health probe failed for {}: {}", target.hostname, e);
                return Ok(HealthResponse::Offline {
                    error: format!("Connection failed: {}", e),
                });
            }
        };

        let run = exec_guarded(session.as_ref(), commands::HEALTH).await;
        session.close().await;

        let (ip, uptime) = parser::parse_health(run.stdout());
        Ok(HealthResponse::Online { ip, uptime })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::metrics::{SecurityEventType, Severity};
    use crate::services::ssh::{MockConnector, MockRemoteSession};
    use async_trait::async_trait;
    use mockall::predicate::eq;
    use mockall::Sequence;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Session answering from a fixed command → output table.
    struct ScriptedSession {
        replies: HashMap<&'static str, CommandOutput>,
        closed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl RemoteSession for ScriptedSession {
        async fn exec(&self, command: &str) -> Result<CommandOutput> {
            self.replies
                .get(command)
                .cloned()
                .ok_or_else(|| MonitorError::Command(format!("unscripted: {}", command)))
        }

        async fn close(&self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct ScriptedConnector {
        replies: HashMap<&'static str, CommandOutput>,
        closed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Connector for ScriptedConnector {
        async fn connect(&self, _target: &ConnectionTarget) -> Result<Box<dyn RemoteSession>> {
            Ok(Box::new(ScriptedSession {
                replies: self.replies.clone(),
                closed: Arc::clone(&self.closed),
            }))
        }
    }

    fn target() -> ConnectionTarget {
        ConnectionTarget {
            hostname: "10.0.0.5".to_string(),
            port: 22,
            username: "root".to_string(),
            credential: Credential::Password("secret".to_string()),
        }
    }

    fn healthy_host() -> HashMap<&'static str, CommandOutput> {
        HashMap::from([
            (commands::CPU, CommandOutput::ok("23.7\n")),
            (commands::MEMORY, CommandOutput::ok("16384 12738\n")),
            (commands::DISK, CommandOutput::ok("102400 51200\n")),
            (commands::UPTIME, CommandOutput::ok("up 3 weeks, 2 days\n")),
            (commands::KERNEL, CommandOutput::ok("6.1.0-18-amd64\n")),
            (commands::OS_NAME, CommandOutput::ok("Debian GNU/Linux 12 (bookworm)\n")),
            (
                commands::PROCESSES,
                CommandOutput::ok(
                    "    PID COMMAND         %CPU %MEM USER\n 812 postgres 31.0 4.2 postgres\n 77 nginx 2.5 0.4 www-data\n",
                ),
            ),
            (commands::LOAD_AVERAGE, CommandOutput::ok("0.52 0.58 0.59 1/467 12345\n")),
            (
                commands::JOURNAL_AUTH,
                CommandOutput::ok(
                    "2024-05-01T10:00:00+0000 db sshd[811]: Failed password for root from 198.51.100.4 port 52311 ssh2\n\
                     2024-05-01T09:00:00+0000 db sudo: deploy : TTY=pts/0 ; COMMAND=/usr/bin/systemctl restart app\n",
                ),
            ),
        ])
    }

    fn executor_for(replies: HashMap<&'static str, CommandOutput>) -> (Executor, Arc<AtomicUsize>) {
        let closed = Arc::new(AtomicUsize::new(0));
        let connector = ScriptedConnector {
            replies,
            closed: Arc::clone(&closed),
        };
        (Executor::new(Arc::new(connector)), closed)
    }

    #[tokio::test]
    async fn healthy_host_is_online_with_all_fields() {
        let (executor, closed) = executor_for(healthy_host());
        let resp = executor.collect(&target()).await.unwrap();

        let MonitorResponse::Online(snapshot) = resp else {
            panic!("expected online");
        };
        assert_eq!(snapshot.metrics.cpu, 23.7);
        assert_eq!(snapshot.metrics.ram.used, 12.4);
        assert_eq!(snapshot.metrics.disk.percentage, 50.0);
        assert_eq!(snapshot.metrics.uptime, "up 3 weeks, 2 days");
        assert_eq!(snapshot.metrics.load_average, [0.52, 0.58, 0.59]);
        assert_eq!(snapshot.os, "Debian GNU/Linux 12 (bookworm)");
        assert_eq!(snapshot.kernel, "6.1.0-18-amd64");
        assert!(snapshot.security_events.len() <= 10);
        assert_eq!(snapshot.security_events[0].severity, Severity::High);
        assert_eq!(snapshot.processes[0].name, "postgres");
        // 8 battery commands plus the first fallback
        assert_eq!(snapshot.command_logs.len(), 9);
        assert_eq!(snapshot.command_logs[0].command, commands::JOURNAL_AUTH);
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failing_commands_degrade_instead_of_aborting() {
        let mut replies = healthy_host();
        replies.remove(commands::CPU);
        replies.remove(commands::OS_NAME);
        let (executor, _) = executor_for(replies);

        let MonitorResponse::Online(snapshot) = executor.collect(&target()).await.unwrap() else {
            panic!("expected online");
        };
        assert_eq!(snapshot.metrics.cpu, 0.0);
        assert_eq!(snapshot.os, "Linux");
        assert_eq!(snapshot.kernel, "6.1.0-18-amd64");

        let cpu_log = snapshot
            .command_logs
            .iter()
            .find(|l| l.command == commands::CPU)
            .unwrap();
        assert_eq!(cpu_log.output, COMMAND_FAILED);
        assert_eq!(cpu_log.exit_code, -1);
    }

    #[tokio::test]
    async fn empty_fallback_chain_yields_placeholder_event() {
        let mut replies = healthy_host();
        replies.insert(commands::JOURNAL_AUTH, CommandOutput::ok(""));
        replies.insert(commands::AUTH_LOG_TAIL, CommandOutput::ok("  \n"));
        replies.insert(commands::LOGIN_HISTORY, CommandOutput::ok(""));
        let (executor, _) = executor_for(replies);

        let MonitorResponse::Online(snapshot) = executor.collect(&target()).await.unwrap() else {
            panic!("expected online");
        };
        assert_eq!(snapshot.security_events.len(), 1);
        assert_eq!(snapshot.security_events[0].severity, Severity::Low);
        assert_eq!(snapshot.command_logs.len(), 11);
        assert_eq!(snapshot.command_logs[0].output, NO_OUTPUT);
    }

    #[tokio::test]
    async fn auth_failure_is_reported_offline() {
        let mut connector = MockConnector::new();
        connector
            .expect_connect()
            .times(1)
            .returning(|_| Err(MonitorError::Authentication));
        let executor = Executor::new(Arc::new(connector));

        let resp = executor.collect(&target()).await.unwrap();
        assert_eq!(
            resp,
            MonitorResponse::offline(
                "Connection failed: Authentication failed",
                OfflineReason::Handshake
            )
        );
    }

    #[tokio::test]
    async fn missing_details_never_touch_the_network() {
        let mut connector = MockConnector::new();
        connector.expect_connect().times(0);
        let executor = Executor::new(Arc::new(connector));

        let mut bad = target();
        bad.hostname = "  ".to_string();
        let err = executor.collect(&bad).await.unwrap_err();
        assert!(matches!(err, MonitorError::MissingConnectionDetails));
    }

    fn battery_session() -> MockRemoteSession {
        let mut session = MockRemoteSession::new();
        for command in [
            commands::CPU,
            commands::MEMORY,
            commands::DISK,
            commands::UPTIME,
            commands::KERNEL,
            commands::OS_NAME,
            commands::PROCESSES,
            commands::LOAD_AVERAGE,
        ] {
            session
                .expect_exec()
                .with(eq(command))
                .times(1)
                .returning(|_| Ok(CommandOutput::default()));
        }
        session.expect_close().times(1).return_const(());
        session
    }

    async fn collect_with(session: MockRemoteSession) -> HostSnapshot {
        let mut connector = MockConnector::new();
        let mut session = Some(session);
        connector.expect_connect().times(1).returning(move |_| {
            let s = session.take().expect("connect called once");
            Ok(Box::new(s) as Box<dyn RemoteSession>)
        });
        let executor = Executor::new(Arc::new(connector));
        match executor.collect(&target()).await.unwrap() {
            MonitorResponse::Online(snapshot) => snapshot,
            other => panic!("expected online, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn journal_output_skips_remaining_fallbacks() {
        let mut session = battery_session();
        session
            .expect_exec()
            .with(eq(commands::JOURNAL_AUTH))
            .times(1)
            .returning(|_| Ok(CommandOutput::ok("host sshd[1]: Accepted publickey for ops\n")));
        session.expect_exec().with(eq(commands::AUTH_LOG_TAIL)).times(0);
        session.expect_exec().with(eq(commands::LOGIN_HISTORY)).times(0);

        let snapshot = collect_with(session).await;
        assert_eq!(snapshot.security_events.len(), 1);
        assert_eq!(snapshot.security_events[0].event_type, SecurityEventType::SshAttempt);
    }

    #[tokio::test]
    async fn fallbacks_run_in_order_until_one_answers() {
        let mut session = battery_session();
        let mut seq = Sequence::new();
        session
            .expect_exec()
            .with(eq(commands::JOURNAL_AUTH))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(CommandOutput::default()));
        session
            .expect_exec()
            .with(eq(commands::AUTH_LOG_TAIL))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(MonitorError::Command("permission denied".to_string())));
        session
            .expect_exec()
            .with(eq(commands::LOGIN_HISTORY))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(CommandOutput::ok("deploy pts/0 10.1.1.9 Wed May 1 09:12 still logged in\n")));

        let snapshot = collect_with(session).await;
        assert_eq!(snapshot.security_events.len(), 1);
        assert_eq!(snapshot.security_events[0].event_type, SecurityEventType::AuthFailure);
        assert_eq!(snapshot.security_events[0].source_ip.as_deref(), Some("10.1.1.9"));
    }

    #[tokio::test]
    async fn auth_log_answer_stops_before_login_history() {
        let mut session = battery_session();
        let mut seq = Sequence::new();
        session
            .expect_exec()
            .with(eq(commands::JOURNAL_AUTH))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(CommandOutput::ok(" \n")));
        session
            .expect_exec()
            .with(eq(commands::AUTH_LOG_TAIL))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| {
                Ok(CommandOutput::ok(
                    "May  1 10:02:11 db sshd[902]: Failed password for invalid user admin from 192.0.2.44 port 40022 ssh2\n\
                     May  1 10:01:50 db sudo: ops : TTY=pts/1 ; COMMAND=/bin/ls\n",
                ))
            });
        session.expect_exec().with(eq(commands::LOGIN_HISTORY)).times(0);

        let snapshot = collect_with(session).await;
        assert_eq!(snapshot.security_events.len(), 2);
        assert_eq!(snapshot.security_events[0].event_type, SecurityEventType::SshAttempt);
        assert_eq!(snapshot.security_events[0].severity, Severity::High);
        assert_eq!(snapshot.security_events[0].source_ip.as_deref(), Some("192.0.2.44"));
        assert_eq!(snapshot.command_logs[0].command, commands::AUTH_LOG_TAIL);
        assert_eq!(snapshot.command_logs.len(), 10);
    }

    #[tokio::test]
    async fn repeated_collection_is_stable() {
        let (executor, closed) = executor_for(healthy_host());
        let first = executor.collect(&target()).await.unwrap();
        let second = executor.collect(&target()).await.unwrap();

        match (first, second) {
            (MonitorResponse::Online(a), MonitorResponse::Online(b)) => {
                assert_eq!(a.os, b.os);
                assert_eq!(a.kernel, b.kernel);
            }
            _ => panic!("expected two online snapshots"),
        }
        // a fresh session per call, each closed
        assert_eq!(closed.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn command_log_is_capped() {
        let runs: Vec<CommandRun> = (0..80)
            .map(|_| CommandRun {
                command: commands::UPTIME,
                output: CommandOutput::ok("x".repeat(OUTPUT_PREVIEW_CHARS + 10)),
                timestamp: Utc::now(),
            })
            .collect();
        let logs: Vec<CommandLog> = runs
            .into_iter()
            .rev()
            .take(COMMAND_LOG_CAP)
            .map(CommandRun::into_log)
            .collect();
        assert_eq!(logs.len(), COMMAND_LOG_CAP);
        assert_eq!(logs[0].output.len(), OUTPUT_PREVIEW_CHARS);
    }

    #[tokio::test]
    async fn health_probe_reports_ip() {
        let (executor, closed) = executor_for(HashMap::from([(
            commands::HEALTH,
            CommandOutput::ok("10.0.0.5 up 2 days, 4 hours\n"),
        )]));
        let resp = executor.probe_health(&target()).await.unwrap();
        assert_eq!(
            resp,
            HealthResponse::Online {
                ip: Some("10.0.0.5".to_string()),
                uptime: "up 2 days, 4 hours".to_string(),
            }
        );
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }
}
