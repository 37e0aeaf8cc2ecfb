//! Quality level table.

use crate::config::QualityLevel;

/// Ordered quality levels, index 0 is the best.
#[derive(Debug, Clone)]
pub struct QualityLevelTable {
    levels: Vec<QualityLevel>,
}

impl QualityLevelTable {
    /// Returns `None` for an empty table.
    pub fn new(levels: Vec<QualityLevel>) -> Option<Self> {
        if levels.is_empty() {
            return None;
        }
        Some(Self { levels })
    }

    pub fn len(&self) -> usize {
        self.levels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    /// Index of the lowest quality level.
    pub fn lowest(&self) -> usize {
        self.levels.len() - 1
    }

    pub fn is_lowest(&self, index: usize) -> bool {
        index >= self.lowest()
    }

    /// Level at `index`, clamped to the table.
    pub fn level(&self, index: usize) -> &QualityLevel {
        &self.levels[index.min(self.lowest())]
    }

    /// Index of the level with exactly this resolution.
    pub fn index_for_resolution(&self, width: u32, height: u32) -> Option<usize> {
        self.levels
            .iter()
            .position(|l| l.width == width && l.height == height)
    }

    pub fn iter(&self) -> impl Iterator<Item = &QualityLevel> {
        self.levels.iter()
    }
}
