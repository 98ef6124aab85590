//! Where the coordinator keeps its state, and how its parts are assembled.
use std::{fs::create_dir_all, path::PathBuf, time::Duration};

use anyhow::Context;
use tracing::{info, warn};

use crate::{
    engine::{CompletionMode, Engine, EngineParts},
    policy::TimeoutPolicy,
    protocol::{Protocol, ProtocolConfig},
    queue::{CommandQueue, DEFAULT_CAPACITY},
    signals::SignalMap,
    util::file_backed_json::FileBackedValue,
};

#[derive(Debug, Clone)]
pub struct Config {
    pub data_folder: PathBuf,
    pub protocol: ProtocolConfig,
    pub completion: CompletionMode,
    pub queue_capacity: usize,
    pub tick: Duration,
}

impl Config {
    pub fn new(data_folder: impl Into<PathBuf>) -> Self {
        Config {
            data_folder: data_folder.into(),
            protocol: Default::default(),
            completion: CompletionMode::Ack,
            queue_capacity: DEFAULT_CAPACITY,
            tick: Duration::from_millis(50),
        }
    }

    pub fn queue_log_path(&self) -> PathBuf {
        self.data_folder.join("queue.log")
    }
    pub fn queue_index_path(&self) -> PathBuf {
        self.data_folder.join("queue.idx")
    }
    pub fn timeout_path(&self) -> PathBuf {
        self.data_folder.join("timeout.json")
    }
    pub fn signals_path(&self) -> PathBuf {
        self.data_folder.join("signals.json")
    }

    /// The signal wiring, written out with defaults on first start so it can be edited.
    pub fn load_signal_map(&self) -> anyhow::Result<SignalMap> {
        let map = FileBackedValue::new(self.signals_path(), SignalMap::default)?;
        if !map.exists_on_disk() {
            info!("writing default signal map to {:?}", map.path());
            map.save()?;
        }
        Ok(map.get().clone())
    }

    pub fn build_engine(&self) -> anyhow::Result<Engine> {
        create_dir_all(&self.data_folder)
            .with_context(|| format!("creating data folder {:?}", self.data_folder))?;
        let queue = CommandQueue::open(self.queue_log_path(), self.queue_index_path(), self.queue_capacity)
            .context("opening the command queue")?;
        if !queue.is_empty() {
            info!("resuming with {} queued commands", queue.len());
        }
        let policy = TimeoutPolicy::load(self.timeout_path()).context("loading timeout settings")?;
        let map = self.load_signal_map()?;
        for problem in map.wiring_problems() {
            warn!("{} (see {:?})", problem, self.signals_path());
        }
        if self.completion == CompletionMode::Signal && map.all_done.is_none() {
            warn!("signal completion is selected but no all-done input is wired");
        }
        let signals = map.open().context("opening signal lines")?;
        Ok(Engine::new(EngineParts {
            queue,
            protocol: Protocol::new(self.protocol.clone()),
            signals,
            detector: self.completion.detector(),
            policy,
        }))
    }
}
