use serde::{Deserialize, Serialize};

/// Prices in USD. Video is billed per generated second.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostTable {
    #[serde(default = "default_image")]
    pub image: f64,
    #[serde(default = "default_video_per_second")]
    pub video_per_second: f64,
    #[serde(default)]
    pub stitch: f64,
    #[serde(default)]
    pub enhancement: f64,
}

fn default_image() -> f64 {
    0.04
}

fn default_video_per_second() -> f64 {
    0.40
}

impl Default for CostTable {
    fn default() -> Self {
        Self {
            image: default_image(),
            video_per_second: default_video_per_second(),
            stitch: 0.0,
            enhancement: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CostKind {
    ReferenceImage,
    VideoSegment,
    Stitch,
    Enhancement,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostItem {
    pub kind: CostKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub segment: Option<usize>,
    pub amount_usd: f64,
    /// The remote call was accepted; a rejected submission is recorded at zero.
    pub billed: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CostLedger {
    pub items: Vec<CostItem>,
    pub total_usd: f64,
}

impl CostLedger {
    pub fn record(&mut self, kind: CostKind, segment: Option<usize>, amount_usd: f64, billed: bool) {
        let amount_usd = if billed { amount_usd.max(0.0) } else { 0.0 };
        self.total_usd += amount_usd;
        self.items.push(CostItem {
            kind,
            segment,
            amount_usd,
            billed,
        });
    }

    pub fn count(&self, kind: CostKind) -> usize {
        self.items.iter().filter(|i| i.kind == kind).count()
    }
}

impl CostTable {
    pub fn video_segment(&self, seconds: f64) -> f64 {
        self.video_per_second * seconds.max(0.0)
    }
}
