//! Binary inputs and outputs wired to the coordinator: the sync pair used by
//! `SET`/`WAIT`, the aggregate "all axes done" line and the `DETECT` sensors.
use std::{
    cell::RefCell,
    collections::HashMap,
    fs,
    io::Write,
    path::{Path, PathBuf},
    rc::Rc,
};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    SyncIn,
    SyncOut,
    AllDone,
    Sensor(usize),
}

pub trait SignalIo {
    fn read(&mut self, signal: Signal) -> bool;
    fn write(&mut self, signal: Signal, value: bool);
    fn sensor_count(&self) -> usize;

    /// True when every configured sensor reads triggered. With no sensors
    /// configured nothing can trigger, so this stays false.
    fn all_sensors_triggered(&mut self) -> bool {
        let count = self.sensor_count();
        count > 0 && (0..count).all(|index| self.read(Signal::Sensor(index)))
    }
}

/// Signals held in memory. Clones share state, so a test or a bench harness
/// can keep one handle and drive the inputs the engine sees.
#[derive(Debug, Clone, Default)]
pub struct MemorySignals {
    levels: Rc<RefCell<HashMap<Signal, bool>>>,
    sensors: usize,
}

impl MemorySignals {
    pub fn new(sensors: usize) -> Self {
        MemorySignals {
            levels: Default::default(),
            sensors,
        }
    }
    pub fn set(&self, signal: Signal, value: bool) {
        self.levels.borrow_mut().insert(signal, value);
    }
    pub fn get(&self, signal: Signal) -> bool {
        self.levels.borrow().get(&signal).copied().unwrap_or(false)
    }
}

impl SignalIo for MemorySignals {
    fn read(&mut self, signal: Signal) -> bool {
        self.get(signal)
    }
    fn write(&mut self, signal: Signal, value: bool) {
        self.set(signal, value)
    }
    fn sensor_count(&self) -> usize {
        self.sensors
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalBackend {
    Memory,
    Sysfs,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineConfig {
    pub line: u32,
    #[serde(default)]
    pub invert: bool,
}

/// Persisted as `signals.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalMap {
    pub backend: SignalBackend,
    #[serde(default = "default_sysfs_base")]
    pub sysfs_base: PathBuf,
    #[serde(default)]
    pub sync_in: Option<LineConfig>,
    #[serde(default)]
    pub sync_out: Option<LineConfig>,
    #[serde(default)]
    pub all_done: Option<LineConfig>,
    #[serde(default)]
    pub sensors: Vec<LineConfig>,
}

fn default_sysfs_base() -> PathBuf {
    PathBuf::from("/sys/class/gpio")
}

impl Default for SignalMap {
    fn default() -> Self {
        SignalMap {
            backend: SignalBackend::Memory,
            sysfs_base: default_sysfs_base(),
            sync_in: None,
            sync_out: None,
            all_done: None,
            sensors: Vec::new(),
        }
    }
}

impl SignalMap {
    /// Gaps in the wiring that leave `WAIT` or `DETECT` unable to resolve.
    pub fn wiring_problems(&self) -> Vec<String> {
        if self.backend == SignalBackend::Memory {
            return vec!["signals are simulated in memory; WAIT and DETECT will only time out".to_string()];
        }
        let mut problems = Vec::new();
        if self.sync_in.is_none() {
            problems.push("no sync input is wired; WAIT will only time out".to_string());
        }
        if self.sensors.is_empty() {
            problems.push("no sensors are wired; DETECT will only time out".to_string());
        }
        problems
    }

    pub fn open(&self) -> anyhow::Result<Box<dyn SignalIo>> {
        Ok(match self.backend {
            SignalBackend::Memory => Box::new(MemorySignals::new(self.sensors.len())),
            SignalBackend::Sysfs => Box::new(SysfsSignals::open(self)?),
        })
    }
}

/// GPIO lines through the Linux sysfs interface.
pub struct SysfsSignals {
    base: PathBuf,
    map: SignalMap,
}

impl SysfsSignals {
    pub fn open(map: &SignalMap) -> anyhow::Result<Self> {
        let signals = SysfsSignals {
            base: map.sysfs_base.clone(),
            map: map.clone(),
        };
        let inputs = map.sync_in.iter().chain(map.all_done.iter()).chain(map.sensors.iter());
        for entry in inputs {
            signals.configure(entry.line, "in")?;
        }
        if let Some(entry) = &map.sync_out {
            signals.configure(entry.line, "out")?;
            signals.write_line(entry, false)?;
        }
        Ok(signals)
    }

    fn line_path(&self, line: u32, leaf: &str) -> PathBuf {
        self.base.join(format!("gpio{}", line)).join(leaf)
    }

    fn configure(&self, line: u32, direction: &str) -> anyhow::Result<()> {
        if !self.base.join(format!("gpio{}", line)).exists() {
            fs::write(self.base.join("export"), line.to_string())
                .with_context(|| format!("exporting gpio {}", line))?;
        }
        write_path(&self.line_path(line, "direction"), direction)
    }

    fn entry(&self, signal: Signal) -> Option<&LineConfig> {
        match signal {
            Signal::SyncIn => self.map.sync_in.as_ref(),
            Signal::SyncOut => self.map.sync_out.as_ref(),
            Signal::AllDone => self.map.all_done.as_ref(),
            Signal::Sensor(index) => self.map.sensors.get(index),
        }
    }

    fn read_line(&self, entry: &LineConfig) -> anyhow::Result<bool> {
        let path = self.line_path(entry.line, "value");
        let text = fs::read_to_string(&path).with_context(|| format!("reading {:?}", path))?;
        Ok((text.trim() != "0") != entry.invert)
    }

    fn write_line(&self, entry: &LineConfig, value: bool) -> anyhow::Result<()> {
        let level = value != entry.invert;
        write_path(&self.line_path(entry.line, "value"), if level { "1" } else { "0" })
    }
}

fn write_path(path: &Path, value: &str) -> anyhow::Result<()> {
    let mut file = fs::OpenOptions::new()
        .write(true)
        .truncate(true)
        .open(path)
        .with_context(|| format!("opening {:?}", path))?;
    file.write_all(value.as_bytes())
        .with_context(|| format!("writing {:?}", path))
}

impl SignalIo for SysfsSignals {
    fn read(&mut self, signal: Signal) -> bool {
        let Some(entry) = self.entry(signal) else {
            debug!("{:?} is not wired; reading it as inactive", signal);
            return false;
        };
        match self.read_line(entry) {
            Ok(value) => value,
            Err(e) => {
                warn!("failed to read {:?}: {:#}", signal, e);
                false
            }
        }
    }
    fn write(&mut self, signal: Signal, value: bool) {
        let Some(entry) = self.entry(signal) else {
            warn!("{:?} is not wired; ignoring write", signal);
            return;
        };
        if let Err(e) = self.write_line(entry, value) {
            warn!("failed to write {:?}: {:#}", signal, e);
        }
    }
    fn sensor_count(&self) -> usize {
        self.map.sensors.len()
    }
}

#[cfg(test)]
mod test {
    use tempdir::TempDir;

    use super::*;

    fn fake_line(base: &Path, line: u32, value: &str) {
        let dir = base.join(format!("gpio{}", line));
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("direction"), "").unwrap();
        fs::write(dir.join("value"), value).unwrap();
    }

    #[test]
    fn test_memory_signals_share_state() {
        let handle = MemorySignals::new(2);
        let mut io: Box<dyn SignalIo> = Box::new(handle.clone());
        assert!(!io.all_sensors_triggered());
        handle.set(Signal::Sensor(0), true);
        assert!(!io.all_sensors_triggered());
        handle.set(Signal::Sensor(1), true);
        assert!(io.all_sensors_triggered());
        io.write(Signal::SyncOut, true);
        assert!(handle.get(Signal::SyncOut));
    }
    #[test]
    fn test_no_sensors_never_trigger() {
        let mut io = MemorySignals::new(0);
        assert!(!io.all_sensors_triggered());
    }
    #[test]
    fn test_sysfs_lines() {
        let dir = TempDir::new("gpio").unwrap();
        fake_line(dir.path(), 17, "1\n");
        fake_line(dir.path(), 27, "0\n");
        fake_line(dir.path(), 22, "1\n");
        let map = SignalMap {
            backend: SignalBackend::Sysfs,
            sysfs_base: dir.path().to_path_buf(),
            sync_in: Some(LineConfig { line: 17, invert: false }),
            sync_out: Some(LineConfig { line: 27, invert: true }),
            all_done: None,
            sensors: vec![LineConfig { line: 22, invert: true }],
        };
        let mut io = map.open().unwrap();
        assert!(io.read(Signal::SyncIn));
        assert!(!io.read(Signal::Sensor(0)));
        assert!(!io.read(Signal::AllDone));
        // Inverted output: released at open, so the line sits high.
        assert_eq!(fs::read_to_string(dir.path().join("gpio27/value")).unwrap(), "1");
        io.write(Signal::SyncOut, true);
        assert_eq!(fs::read_to_string(dir.path().join("gpio27/value")).unwrap(), "0");
        assert_eq!(fs::read_to_string(dir.path().join("gpio22/direction")).unwrap(), "in");
    }
    #[test]
    fn test_wiring_problems() {
        assert_eq!(SignalMap::default().wiring_problems().len(), 1);
        let mut map = SignalMap {
            backend: SignalBackend::Sysfs,
            ..Default::default()
        };
        assert_eq!(map.wiring_problems().len(), 2);
        map.sync_in = Some(LineConfig { line: 5, invert: false });
        map.sensors.push(LineConfig { line: 6, invert: false });
        assert!(map.wiring_problems().is_empty());
    }
    #[test]
    fn test_signal_map_json() {
        let map: SignalMap = serde_json::from_str(
            r#"{"backend":"sysfs","syncIn":{"line":5},"sensors":[{"line":6,"invert":true}]}"#,
        )
        .unwrap();
        assert_eq!(map.sysfs_base, PathBuf::from("/sys/class/gpio"));
        assert_eq!(map.sync_in, Some(LineConfig { line: 5, invert: false }));
        assert!(map.sensors[0].invert);
        assert_eq!(map.all_done, None);
    }
}
