use std::{
    fs::{read_to_string, rename, write},
    path::Path,
};

use anyhow::Context;

/// Durable cursor into the command log: the line number of the next entry and
/// how many entries follow it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueIndex {
    pub head: usize,
    pub size: usize,
}

impl QueueIndex {
    pub fn tail(&self) -> usize {
        self.head.saturating_add(self.size)
    }
    /// `None` when a corrupt index does not even fit in memory.
    pub fn checked_tail(&self) -> Option<usize> {
        self.head.checked_add(self.size)
    }
    fn parse(text: &str) -> Option<QueueIndex> {
        let mut lines = text.lines().map(str::trim);
        let head = lines.next()?.parse().ok()?;
        let size = lines.next()?.parse().ok()?;
        Some(QueueIndex { head, size })
    }
    fn render(&self) -> String {
        format!("{}\n{}\n", self.head, self.size)
    }

    /// A missing file reads as an empty queue; an unreadable one is reported.
    pub fn load(path: &Path) -> anyhow::Result<Option<QueueIndex>> {
        if !path.exists() {
            return Ok(None);
        }
        let text = read_to_string(path).with_context(|| format!("reading {:?}", path))?;
        Ok(QueueIndex::parse(&text))
    }
    pub fn store(&self, path: &Path) -> anyhow::Result<()> {
        let temporary = path.with_extension("idx.tmp");
        write(&temporary, self.render()).with_context(|| format!("writing {:?}", temporary))?;
        rename(&temporary, path).with_context(|| format!("replacing {:?}", path))?;
        Ok(())
    }
}
