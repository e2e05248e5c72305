//! Broker adapter that drives the host's message queuing service through
//! PowerShell and `System.Messaging`.
//!
//! Every operation runs as a short-lived child process with a hard timeout.
//! Scripts print compact JSON on stdout; message bodies travel over stdin so
//! they never appear on a command line. Remote queues are addressed by
//! direct format name, trying the preferred protocol first and falling back
//! to the other when configured.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, instrument, warn};

use super::addressing::{is_local_host, QueueAddress};
use super::traits::{BrokerAdapter, BrokerMessage, QueueListing, SendRequest};
use crate::config::BrokerConfig;
use crate::domain::{short_name, QueueInfo};
use crate::error::{Result, SyncError};

const PREAMBLE: &str = "$ErrorActionPreference = 'Stop'; Add-Type -AssemblyName System.Messaging; ";

/// Quote a value as a PowerShell single-quoted literal
fn ps_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

#[derive(Debug, Deserialize)]
struct ProbeRow {
    name: String,
    #[serde(default)]
    count: i64,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    missing: bool,
}

#[derive(Debug, Deserialize)]
struct ShellMessage {
    id: String,
    #[serde(default)]
    label: Option<String>,
    #[serde(default)]
    body: String,
    #[serde(default)]
    correlation_id: Option<String>,
    #[serde(default)]
    priority: u8,
    #[serde(default)]
    arrived_at: Option<String>,
}

impl From<ShellMessage> for BrokerMessage {
    fn from(m: ShellMessage) -> Self {
        let arrived_at = m
            .arrived_at
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|d| d.with_timezone(&Utc));
        BrokerMessage {
            id: m.id,
            label: m.label.filter(|l| !l.is_empty()),
            body: m.body,
            correlation_id: m.correlation_id.filter(|c| !c.is_empty()),
            priority: m.priority,
            arrived_at,
        }
    }
}

/// PowerShell prints a bare object for one row and an array for several
fn parse_rows(output: &str) -> Result<Vec<ProbeRow>> {
    let trimmed = output.trim();
    if trimmed.is_empty() || trimmed == "null" {
        return Ok(Vec::new());
    }
    let value: serde_json::Value = serde_json::from_str(trimmed)?;
    let rows = match value {
        serde_json::Value::Array(items) => items
            .into_iter()
            .map(serde_json::from_value)
            .collect::<std::result::Result<Vec<ProbeRow>, _>>()?,
        other => vec![serde_json::from_value(other)?],
    };
    Ok(rows)
}

fn parse_message(output: &str) -> Result<Option<BrokerMessage>> {
    let trimmed = output.trim();
    if trimmed.is_empty() || trimmed == "null" {
        return Ok(None);
    }
    let message: ShellMessage = serde_json::from_str(trimmed)?;
    Ok(Some(message.into()))
}

fn rows_to_listing(rows: Vec<ProbeRow>, host: &str, prefix: &str) -> QueueListing {
    let mut listing = QueueListing::default();
    for row in rows {
        let name = short_name(&row.name).to_string();
        if row.missing {
            continue;
        }
        match row.error {
            Some(err) => listing.unreadable.push((name, err)),
            None => {
                let path = QueueAddress::new(host, prefix, &name).path();
                listing
                    .queues
                    .push(QueueInfo::new(name, path).with_count(row.count));
            }
        }
    }
    listing
}

fn local_listing_script() -> String {
    format!(
        "{}ConvertTo-Json -Compress -InputObject @(Get-MsmqQueue -QueueType Private | ForEach-Object {{ \
         $n = $_.QueueName; try {{ [pscustomobject]@{{ name = $n; count = [int64]$_.MessageCount; error = $null }} }} \
         catch {{ [pscustomobject]@{{ name = $n; count = 0; error = $_.Exception.Message }} }} }})",
        PREAMBLE
    )
}

fn probe_script(name: &str, address: &str) -> String {
    format!(
        "{}$q = New-Object System.Messaging.MessageQueue({addr}); \
         try {{ $e = $q.GetMessageEnumerator2(); $c = 0; while ($e.MoveNext()) {{ $c++ }}; \
         [pscustomobject]@{{ name = {name}; count = $c; error = $null; missing = $false }} | ConvertTo-Json -Compress }} \
         catch [System.Messaging.MessageQueueException] {{ \
         $missing = ($_.Exception.MessageQueueErrorCode -eq 'QueueNotFound'); \
         [pscustomobject]@{{ name = {name}; count = 0; error = $_.Exception.Message; missing = $missing }} | ConvertTo-Json -Compress }}",
        PREAMBLE,
        addr = ps_quote(address),
        name = ps_quote(name),
    )
}

fn read_script(address: &str, timeout: Duration, remove: bool) -> String {
    let op = if remove { "Receive" } else { "Peek" };
    format!(
        "{}$q = New-Object System.Messaging.MessageQueue({addr}); $q.MessageReadPropertyFilter.SetAll(); \
         try {{ $m = $q.{op}([TimeSpan]::FromMilliseconds({ms})) }} \
         catch [System.Messaging.MessageQueueException] {{ if ($_.Exception.MessageQueueErrorCode -eq 'IOTimeout') {{ 'null'; exit 0 }} else {{ throw }} }}; \
         $body = (New-Object System.IO.StreamReader($m.BodyStream)).ReadToEnd(); \
         $corr = if ($m.Extension.Length -gt 0) {{ [Text.Encoding]::UTF8.GetString($m.Extension) }} else {{ $null }}; \
         [pscustomobject]@{{ id = $m.Id; label = $m.Label; body = $body; correlation_id = $corr; \
         priority = [int]$m.Priority; arrived_at = $m.ArrivedTime.ToUniversalTime().ToString('o') }} | ConvertTo-Json -Compress",
        PREAMBLE,
        addr = ps_quote(address),
        op = op,
        ms = timeout.as_millis(),
    )
}

fn send_script(address: &str, request: &SendRequest) -> String {
    format!(
        "{}$body = [Console]::In.ReadToEnd(); $q = New-Object System.Messaging.MessageQueue({addr}); \
         $m = New-Object System.Messaging.Message; \
         $m.BodyStream = New-Object System.IO.MemoryStream(,[Text.Encoding]::UTF8.GetBytes($body)); \
         $m.Label = {label}; $m.Priority = [System.Messaging.MessagePriority]{priority}; \
         $m.Extension = [Text.Encoding]::UTF8.GetBytes({corr}); $m.Recoverable = $true; \
         $q.Send($m); $m.Id",
        PREAMBLE,
        addr = ps_quote(address),
        label = ps_quote(request.label.as_deref().unwrap_or("")),
        priority = request.priority.min(7),
        corr = ps_quote(request.correlation_id.as_deref().unwrap_or("")),
    )
}

fn connect_script(host: &str, port: u16) -> String {
    if is_local_host(host) {
        "(Get-Service -Name MSMQ).Status -eq 'Running'".to_string()
    } else {
        format!(
            "Test-NetConnection -ComputerName {} -Port {} -InformationLevel Quiet -WarningAction SilentlyContinue",
            ps_quote(host),
            port
        )
    }
}

/// Adapter backed by the host's native queuing service
pub struct ShellBroker {
    config: BrokerConfig,
    connected: AtomicBool,
}

impl ShellBroker {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            config,
            connected: AtomicBool::new(false),
        }
    }

    fn address(&self, host: &str, queue: &str) -> QueueAddress {
        QueueAddress::new(host, &self.config.queue_prefix, queue)
    }

    fn candidates(&self, host: &str, queue: &str) -> Vec<String> {
        self.address(host, queue)
            .candidates(self.config.protocol, self.config.protocol_fallback)
    }

    async fn run_script(
        &self,
        operation: &str,
        script: &str,
        stdin: Option<&str>,
        timeout: Duration,
    ) -> Result<String> {
        let mut cmd = Command::new(&self.config.shell_program);
        cmd.args(["-NoProfile", "-NonInteractive", "-Command", script])
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn()?;
        if let Some(input) = stdin {
            if let Some(mut pipe) = child.stdin.take() {
                pipe.write_all(input.as_bytes()).await?;
            }
        }

        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(SyncError::BrokerTimeout {
                    operation: operation.to_string(),
                    elapsed_ms: timeout.as_millis() as u64,
                })
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SyncError::Broker(format!(
                "{} failed: {}",
                operation,
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Run a per-queue script against each candidate address until one succeeds
    async fn run_with_fallback<F>(
        &self,
        operation: &str,
        queue: &str,
        build: F,
        stdin: Option<&str>,
        timeout: Duration,
    ) -> Result<String>
    where
        F: Fn(&str) -> String,
    {
        let mut last_err = None;
        for address in self.candidates(&self.config.host, queue) {
            match self.run_script(operation, &build(&address), stdin, timeout).await {
                Ok(out) => return Ok(out),
                Err(e) => {
                    warn!("{} via {} failed: {}", operation, address, e);
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| SyncError::Broker(format!("no address for {}", queue))))
    }

    fn ensure_enabled(&self) -> Result<()> {
        if self.config.enabled {
            Ok(())
        } else {
            Err(SyncError::Connection("broker integration is disabled".into()))
        }
    }

    async fn probe_configured(&self, host: &str) -> Result<QueueListing> {
        let mut rows = Vec::new();
        for name in &self.config.queues {
            let mut last_err = None;
            let mut probed = false;
            for address in self.candidates(host, name) {
                match self
                    .run_script("probe", &probe_script(name, &address), None, self.config.timeout())
                    .await
                    .and_then(|out| parse_rows(&out))
                {
                    Ok(mut found) => {
                        rows.append(&mut found);
                        probed = true;
                        break;
                    }
                    Err(e) => last_err = Some(e),
                }
            }
            if !probed {
                let reason = last_err.map_or_else(|| "probe failed".to_string(), |e| e.to_string());
                rows.push(ProbeRow {
                    name: name.clone(),
                    count: 0,
                    error: Some(reason),
                    missing: false,
                });
            }
        }
        Ok(rows_to_listing(rows, host, &self.config.queue_prefix))
    }
}

#[async_trait]
impl BrokerAdapter for ShellBroker {
    #[instrument(skip(self), fields(host = %self.config.host))]
    async fn connect(&self) -> Result<()> {
        self.ensure_enabled()?;
        let out = self
            .run_script(
                "connect",
                &connect_script(&self.config.host, self.config.port),
                None,
                self.config.timeout(),
            )
            .await
            .map_err(|e| SyncError::Connection(e.to_string()))?;

        if out.eq_ignore_ascii_case("true") {
            self.connected.store(true, Ordering::SeqCst);
            debug!("Broker reachable at {}:{}", self.config.host, self.config.port);
            Ok(())
        } else {
            self.connected.store(false, Ordering::SeqCst);
            Err(SyncError::Connection(format!(
                "broker not reachable at {}:{}",
                self.config.host, self.config.port
            )))
        }
    }

    async fn disconnect(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        if !self.connected.load(Ordering::SeqCst) {
            return false;
        }
        let alive = self
            .run_script(
                "probe",
                &connect_script(&self.config.host, self.config.port),
                None,
                self.config.timeout(),
            )
            .await
            .map(|out| out.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        if !alive {
            self.connected.store(false, Ordering::SeqCst);
        }
        alive
    }

    #[instrument(skip(self))]
    async fn list_queues(&self, host: &str) -> Result<QueueListing> {
        self.ensure_enabled()?;
        if is_local_host(host) {
            let out = self
                .run_script("list", &local_listing_script(), None, self.config.timeout())
                .await?;
            Ok(rows_to_listing(parse_rows(&out)?, host, &self.config.queue_prefix))
        } else if self.config.queues.is_empty() {
            Err(SyncError::Broker(format!(
                "remote host {} does not allow enumeration and no queues are configured",
                host
            )))
        } else {
            self.probe_configured(host).await
        }
    }

    async fn peek(&self, queue: &str, timeout: Duration) -> Result<Option<BrokerMessage>> {
        self.ensure_enabled()?;
        let out = self
            .run_with_fallback(
                "peek",
                queue,
                |addr| read_script(addr, timeout, false),
                None,
                timeout + self.config.timeout(),
            )
            .await?;
        parse_message(&out)
    }

    async fn receive(&self, queue: &str, timeout: Duration) -> Result<Option<BrokerMessage>> {
        self.ensure_enabled()?;
        let out = self
            .run_with_fallback(
                "receive",
                queue,
                |addr| read_script(addr, timeout, true),
                None,
                timeout + self.config.timeout(),
            )
            .await?;
        parse_message(&out)
    }

    #[instrument(skip(self, request), fields(label = ?request.label))]
    async fn send(&self, queue: &str, request: &SendRequest) -> Result<String> {
        self.ensure_enabled()?;
        let id = self
            .run_with_fallback(
                "send",
                queue,
                |addr| send_script(addr, request),
                Some(&request.body),
                self.config.timeout(),
            )
            .await?;
        if id.is_empty() {
            return Err(SyncError::Broker(format!(
                "send to {} returned no message id",
                queue
            )));
        }
        Ok(id)
    }
}
