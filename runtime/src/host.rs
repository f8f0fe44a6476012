//! Emulated hosts.
//!
//! An emulated host is a process group sharing one network namespace
//! (or the root namespace, for switches). The runtime only needs to run
//! shell commands in it and hand out interface port numbers.

use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use opennet_core::error::{NetError, Result};
use serde::{Deserialize, Serialize};
use tokio::process::Command;

/// A host whose namespace receives migrated interfaces
#[async_trait]
pub trait EmulatedHost: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &str;

    /// Whether the host has a namespace of its own.
    fn in_namespace(&self) -> bool;

    /// Argument to `ip link set dev <x> netns <target>` that moves an
    /// interface into this host.
    fn namespace_target(&self) -> String;

    /// Allocate the next interface port number on this host.
    fn new_port(&self) -> u32;

    /// Run a shell command inside the host's namespace.
    async fn cmd(&self, command: &str) -> Result<String>;

    /// Run a shell command in the root namespace of the machine the host
    /// lives on.
    async fn rcmd(&self, command: &str) -> Result<String>;
}

/// Where a [`NetnsHost`] lives
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HostSpec {
    pub name: String,

    /// Named network namespace (`ip netns`); root namespace when absent
    #[serde(default)]
    pub netns: Option<String>,

    /// Remote machine reached over ssh; local when absent
    #[serde(default)]
    pub server: Option<String>,
}

/// Host backed by a named Linux network namespace
#[derive(Debug)]
pub struct NetnsHost {
    spec: HostSpec,
    next_port: AtomicU32,
}

impl NetnsHost {
    pub fn new(spec: HostSpec) -> Self {
        Self {
            spec,
            next_port: AtomicU32::new(0),
        }
    }

    /// Root-namespace host on this machine.
    pub fn root(name: impl Into<String>) -> Self {
        Self::new(HostSpec {
            name: name.into(),
            ..Default::default()
        })
    }

    /// Host in the named namespace on this machine.
    pub fn namespaced(name: impl Into<String>, netns: impl Into<String>) -> Self {
        Self::new(HostSpec {
            name: name.into(),
            netns: Some(netns.into()),
            server: None,
        })
    }

    pub fn spec(&self) -> &HostSpec {
        &self.spec
    }

    /// argv for running `command` in the host namespace, or in the root
    /// namespace when `root` is set.
    fn argv(&self, command: &str, root: bool) -> Vec<String> {
        let local = match (&self.spec.netns, root) {
            (Some(ns), false) => vec![
                "ip".to_string(),
                "netns".to_string(),
                "exec".to_string(),
                ns.clone(),
                "sh".to_string(),
                "-c".to_string(),
                command.to_string(),
            ],
            _ => vec!["sh".to_string(), "-c".to_string(), command.to_string()],
        };

        match &self.spec.server {
            None => local,
            Some(server) => {
                let remote = local
                    .iter()
                    .map(|arg| shell_quote(arg))
                    .collect::<Vec<_>>()
                    .join(" ");
                vec![
                    "ssh".to_string(),
                    "-o".to_string(),
                    "BatchMode=yes".to_string(),
                    server.clone(),
                    remote,
                ]
            }
        }
    }

    async fn run(&self, command: &str, root: bool) -> Result<String> {
        let argv = self.argv(command, root);
        tracing::debug!(host = %self.spec.name, root, command, "Running host command");

        let output = Command::new(&argv[0])
            .args(&argv[1..])
            .output()
            .await
            .map_err(|e| NetError::Command {
                host: self.spec.name.clone(),
                command: command.to_string(),
                stderr: format!("failed to spawn {}: {}", argv[0], e),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(NetError::Command {
                host: self.spec.name.clone(),
                command: command.to_string(),
                stderr: format!(
                    "exit {}: {}",
                    output.status.code().unwrap_or(-1),
                    stderr.trim()
                ),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl EmulatedHost for NetnsHost {
    fn name(&self) -> &str {
        &self.spec.name
    }

    fn in_namespace(&self) -> bool {
        self.spec.netns.is_some()
    }

    fn namespace_target(&self) -> String {
        // PID 1 owns the root namespace
        self.spec.netns.clone().unwrap_or_else(|| "1".to_string())
    }

    fn new_port(&self) -> u32 {
        self.next_port.fetch_add(1, Ordering::SeqCst)
    }

    async fn cmd(&self, command: &str) -> Result<String> {
        self.run(command, false).await
    }

    async fn rcmd(&self, command: &str) -> Result<String> {
        self.run(command, true).await
    }
}

/// Single-quote `s` for a POSIX shell.
fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:@".contains(c))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', "'\\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_host_runs_plain_shell() {
        let host = NetnsHost::root("s1");
        assert_eq!(host.argv("ip link", false), vec!["sh", "-c", "ip link"]);
        assert_eq!(host.argv("ip link", true), vec!["sh", "-c", "ip link"]);
        assert!(!host.in_namespace());
        assert_eq!(host.namespace_target(), "1");
    }

    #[test]
    fn test_namespaced_host_uses_netns_exec() {
        let host = NetnsHost::namespaced("h1", "ns-h1");
        assert_eq!(
            host.argv("ip link set dev h1-eth0 up", false),
            vec!["ip", "netns", "exec", "ns-h1", "sh", "-c", "ip link set dev h1-eth0 up"]
        );
        // rcmd escapes the namespace
        assert_eq!(host.argv("ip link", true), vec!["sh", "-c", "ip link"]);
        assert_eq!(host.namespace_target(), "ns-h1");
    }

    #[test]
    fn test_remote_host_quotes_for_ssh() {
        let host = NetnsHost::new(HostSpec {
            name: "h2".to_string(),
            netns: Some("h2".to_string()),
            server: Some("node-b".to_string()),
        });
        let argv = host.argv("arp -s 7.0.0.1 00:00:00:00:00:00", false);
        assert_eq!(&argv[..4], &["ssh", "-o", "BatchMode=yes", "node-b"]);
        assert_eq!(
            argv[4],
            "ip netns exec h2 sh -c 'arp -s 7.0.0.1 00:00:00:00:00:00'"
        );
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("plain"), "plain");
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn test_ports_are_sequential() {
        let host = NetnsHost::root("s1");
        assert_eq!(host.new_port(), 0);
        assert_eq!(host.new_port(), 1);
    }

    #[tokio::test]
    async fn test_root_cmd_reports_failure() {
        let host = NetnsHost::root("local");
        assert_eq!(host.cmd("echo ok").await.unwrap().trim(), "ok");
        match host.cmd("echo bad >&2; exit 3").await {
            Err(NetError::Command { host, stderr, .. }) => {
                assert_eq!(host, "local");
                assert!(stderr.contains("exit 3"));
                assert!(stderr.contains("bad"));
            }
            other => panic!("expected Command error, got {other:?}"),
        }
    }
}
