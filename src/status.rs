//! Concurrent reachability polling for the configured machines.

use std::collections::HashMap;
use std::io;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use log::warn;
use serde::Serialize;

use crate::config::Machine;

/// How long a single reachability probe may take.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Reachability of one machine during one poll cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MachineStatus {
    Online,
    Offline,
    Unknown,
}

impl MachineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MachineStatus::Online => "online",
            MachineStatus::Offline => "offline",
            MachineStatus::Unknown => "unknown",
        }
    }
}

/// Issues a single liveness probe against one host.
pub trait Prober: Sync {
    /// `Ok(true)` if the host answered before the probe deadline.
    fn probe(&self, host: &str) -> io::Result<bool>;
}

/// Probes every machine concurrently and returns a fresh name-to-status
/// map once all probes have finished.
///
/// A machine without a configured address is `Unknown` without being
/// probed. A failing probe degrades that machine to `Unknown` and never
/// aborts the rest of the batch.
pub fn poll_all(machines: &[Machine], prober: &dyn Prober) -> HashMap<String, MachineStatus> {
    let statuses = Mutex::new(HashMap::with_capacity(machines.len()));
    thread::scope(|scope| {
        for machine in machines {
            let statuses = &statuses;
            scope.spawn(move || {
                let status = machine_status(machine, prober);
                statuses.lock().unwrap().insert(machine.name.clone(), status);
            });
        }
    });
    statuses.into_inner().unwrap()
}

fn machine_status(machine: &Machine, prober: &dyn Prober) -> MachineStatus {
    let host = match machine.ip.as_deref() {
        Some(host) => host,
        None => return MachineStatus::Unknown,
    };
    match prober.probe(host) {
        Ok(true) => MachineStatus::Online,
        Ok(false) => MachineStatus::Offline,
        Err(err) => {
            warn!("status probe for {} failed: {}", machine.name, err);
            MachineStatus::Unknown
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::status::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct ScriptedProber;

    impl Prober for ScriptedProber {
        fn probe(&self, host: &str) -> io::Result<bool> {
            match host {
                "192.168.1.10" => Ok(true),
                "192.168.1.11" => Ok(false),
                _ => Err(io::Error::new(io::ErrorKind::Other, "probe blew up")),
            }
        }
    }

    fn machine(name: &str, ip: Option<&str>) -> Machine {
        Machine {
            name: name.into(),
            mac: "aa:bb:cc:dd:ee:ff".into(),
            ip: ip.map(Into::into),
        }
    }

    #[test]
    fn test_poll_all_merges_every_machine() {
        let machines = vec![
            machine("no-ip", None),
            machine("alive", Some("192.168.1.10")),
            machine("dead", Some("192.168.1.11")),
            machine("broken", Some("10.0.0.1")),
        ];
        let statuses = poll_all(&machines, &ScriptedProber);
        assert_eq!(statuses.len(), 4);
        assert_eq!(statuses["no-ip"], MachineStatus::Unknown);
        assert_eq!(statuses["alive"], MachineStatus::Online);
        assert_eq!(statuses["dead"], MachineStatus::Offline);
        assert_eq!(statuses["broken"], MachineStatus::Unknown);
    }

    #[test]
    fn test_poll_all_empty_batch() {
        assert!(poll_all(&[], &ScriptedProber).is_empty());
    }

    struct FlippingProber(AtomicBool);

    impl Prober for FlippingProber {
        fn probe(&self, _host: &str) -> io::Result<bool> {
            Ok(self.0.fetch_xor(true, Ordering::SeqCst))
        }
    }

    #[test]
    fn test_poll_cycles_do_not_carry_state() {
        let machines = vec![machine("box", Some("192.168.1.10"))];
        let prober = FlippingProber(AtomicBool::new(true));
        assert_eq!(poll_all(&machines, &prober)["box"], MachineStatus::Online);
        assert_eq!(poll_all(&machines, &prober)["box"], MachineStatus::Offline);
    }

    #[test]
    fn test_status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&MachineStatus::Online).unwrap(),
            "\"online\""
        );
        assert_eq!(MachineStatus::Unknown.as_str(), "unknown");
    }
}
