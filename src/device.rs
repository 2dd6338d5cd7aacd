//! Power control and health monitoring of the device under test, driven
//! by shell commands from a `<Target>` config file.

use std::future::Future;
use std::path::Path;
use std::time::Duration;

use regex::Regex;
use tokio::process::Command;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::error::DeviceError;
use crate::xml::{self, Element};

/// Power commands report success by printing this marker.
const SUCCESS_MARKER: &str = "'code': 0";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Ok,
    /// The probe itself failed; worth asking again.
    Degraded,
    Failed,
}

pub trait DeviceControl: Send {
    /// Power cycles the device. False when unsupported or every attempt failed.
    fn restart(&mut self) -> impl Future<Output = bool> + Send;
    fn health_check(&mut self) -> impl Future<Output = HealthStatus> + Send;
    /// Runs after every exchange to clear leftover device state.
    fn cleanup(&mut self) -> impl Future<Output = ()> + Send;
    /// Rounds between scheduled restarts.
    fn restart_interval(&self) -> Option<u64>;
}

/// Used when no device config is given.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoDevice;

impl DeviceControl for NoDevice {
    async fn restart(&mut self) -> bool {
        false
    }

    async fn health_check(&mut self) -> HealthStatus {
        HealthStatus::Ok
    }

    async fn cleanup(&mut self) {}

    fn restart_interval(&self) -> Option<u64> {
        None
    }
}

#[derive(Debug, Clone)]
struct PowerCommand {
    cmd: String,
    delay: Duration,
}

#[derive(Debug, Clone, Default)]
struct Switch {
    round: Option<u64>,
    off: Option<PowerCommand>,
    on: Option<PowerCommand>,
}

#[derive(Debug, Clone)]
enum MonitorMode {
    Match(String),
    Increase,
}

#[derive(Debug, Clone)]
struct Monitor {
    command: String,
    pattern: Regex,
    mode: MonitorMode,
    last: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct DeviceController {
    target_ip: Option<String>,
    switch: Option<Switch>,
    monitors: Vec<Monitor>,
    cleanup: Option<String>,
    restart_attempts: u32,
    probe_attempts: u32,
    probe_interval: Duration,
}

impl DeviceController {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, DeviceError> {
        Self::from_element(&xml::parse_file(path)?)
    }

    pub fn parse(source: &str) -> Result<Self, DeviceError> {
        Self::from_element(&xml::parse_str(source)?)
    }

    fn from_element(target: &Element) -> Result<Self, DeviceError> {
        if target.name != "Target" {
            return Err(DeviceError::MissingTarget);
        }
        let switch = target.child("Switch").map(|switch| Switch {
            round: switch.attr("round").and_then(|r| r.trim().parse().ok()),
            off: switch.child("off").map(power_command),
            on: switch.child("on").map(power_command),
        });
        let switch = match switch {
            None => {
                warn!("device config has no Switch section, restarts are disabled");
                None
            }
            Some(switch) if switch.off.is_none() && switch.on.is_none() => {
                warn!("Switch section has no off or on command, restarts are disabled");
                None
            }
            Some(switch) => Some(switch),
        };

        let mut monitors = Vec::new();
        for command in target
            .children_named("Monitor")
            .flat_map(|m| m.children_named("Command"))
        {
            let pattern = command.attr("regex").unwrap_or_default();
            let pattern = Regex::new(pattern).map_err(|source| DeviceError::Pattern {
                pattern: pattern.to_string(),
                source,
            })?;
            let mode = match command.attr("mode").unwrap_or_default() {
                "match" => MonitorMode::Match(command.attr("response").unwrap_or_default().to_string()),
                "increase" => MonitorMode::Increase,
                other => return Err(DeviceError::UnknownMode(other.to_string())),
            };
            monitors.push(Monitor {
                command: command.attr("command").unwrap_or_default().to_string(),
                pattern,
                mode,
                last: None,
            });
        }

        Ok(Self {
            target_ip: target.attr("ip").map(str::to_string),
            switch,
            monitors,
            cleanup: target
                .child("Cleanup")
                .and_then(|c| c.attr("cmd"))
                .map(str::to_string),
            restart_attempts: 5,
            probe_attempts: 5,
            probe_interval: Duration::from_secs(1),
        })
    }

    /// Target address declared by the config, overriding the command line.
    pub fn target_ip(&self) -> Option<&str> {
        self.target_ip.as_deref()
    }

    pub fn with_probe_interval(mut self, interval: Duration) -> Self {
        self.probe_interval = interval;
        self
    }

    fn can_restart(&self) -> bool {
        self.switch.is_some()
    }

    async fn power_cycle(&self) -> Result<(), String> {
        let Some(switch) = &self.switch else {
            return Err("no switch".into());
        };
        for step in [&switch.off, &switch.on].into_iter().flatten() {
            info!(cmd = %step.cmd, "executing power command");
            let output = run_command(&step.cmd).await?;
            if !output.contains(SUCCESS_MARKER) {
                return Err(format!("`{}` did not report success", step.cmd));
            }
            sleep(step.delay).await;
        }
        Ok(())
    }

    /// Counters restart from scratch after a power cycle.
    async fn rebaseline(&mut self) {
        let (attempts, interval) = (self.probe_attempts, self.probe_interval);
        for monitor in &mut self.monitors {
            for attempt in 1..=attempts {
                let value = monitor_value(monitor).await;
                match (&monitor.mode, value) {
                    (MonitorMode::Increase, Some(value)) => {
                        if let Ok(value) = value.trim().parse() {
                            monitor.last = Some(value);
                            break;
                        }
                    }
                    (MonitorMode::Match(expected), Some(value)) if value == *expected => break,
                    _ => {}
                }
                debug!(attempt, command = %monitor.command, "monitor not ready after restart");
                sleep(interval).await;
            }
        }
    }
}

fn power_command(element: &Element) -> PowerCommand {
    PowerCommand {
        cmd: element.attr("cmd").unwrap_or_default().to_string(),
        delay: Duration::from_secs(
            element
                .attr("delay")
                .and_then(|d| d.trim().parse().ok())
                .unwrap_or(0),
        ),
    }
}

/// Runs `cmd` through the shell; non-zero exit is an error.
async fn run_command(cmd: &str) -> Result<String, String> {
    let output = Command::new("sh")
        .arg("-c")
        .arg(cmd)
        .output()
        .await
        .map_err(|err| format!("failed to spawn `{cmd}`: {err}"))?;
    if !output.status.success() {
        return Err(format!("`{cmd}` exited with {}", output.status));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// First capture group of the monitor's pattern over the command output.
async fn monitor_value(monitor: &Monitor) -> Option<String> {
    let output = match run_command(&monitor.command).await {
        Ok(output) => output,
        Err(err) => {
            warn!(%err, "monitor command failed");
            return None;
        }
    };
    monitor
        .pattern
        .captures(&output)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .filter(|v| !v.is_empty())
}

impl DeviceControl for DeviceController {
    async fn restart(&mut self) -> bool {
        if !self.can_restart() {
            return false;
        }
        for attempt in 1..=self.restart_attempts {
            match self.power_cycle().await {
                Ok(()) => {
                    self.rebaseline().await;
                    info!("device restarted");
                    return true;
                }
                Err(err) => warn!(attempt, %err, "restart attempt failed"),
            }
        }
        false
    }

    async fn health_check(&mut self) -> HealthStatus {
        for monitor in &mut self.monitors {
            let Some(value) = monitor_value(monitor).await else {
                return HealthStatus::Degraded;
            };
            match &monitor.mode {
                MonitorMode::Match(expected) => {
                    if value != *expected {
                        warn!(%value, %expected, "monitor mismatch");
                        return HealthStatus::Failed;
                    }
                }
                MonitorMode::Increase => {
                    let Ok(current) = value.trim().parse::<i64>() else {
                        return HealthStatus::Degraded;
                    };
                    let previous = monitor.last.replace(current);
                    if previous.is_some_and(|p| current < p) {
                        warn!(current, previous, "monitored counter went backwards");
                        return HealthStatus::Failed;
                    }
                }
            }
        }
        HealthStatus::Ok
    }

    async fn cleanup(&mut self) {
        if let Some(cmd) = &self.cleanup {
            if let Err(err) = run_command(cmd).await {
                warn!(%err, "cleanup command failed");
            }
        }
    }

    fn restart_interval(&self) -> Option<u64> {
        self.switch.as_ref().and_then(|s| s.round)
    }
}
