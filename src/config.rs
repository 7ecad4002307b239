use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub frames_in_flight: usize,
    pub fence_timeout_ns: u64,
    /// `None` keeps pipeline caches in memory only.
    pub pipeline_cache_path: Option<PathBuf>,
    /// Soft cap on transient attachment memory per baked graph. Zero disables it.
    pub transient_budget_bytes: u64,
    pub bake: BakeOptions,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            frames_in_flight: 2,
            fence_timeout_ns: 1_000_000_000,
            pipeline_cache_path: Some(PathBuf::from("pipeline_cache.bin")),
            transient_budget_bytes: 0,
            bake: BakeOptions::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BakeOptions {
    pub log_aliasing_report: bool,
    pub debug_names: bool,
}

impl Default for BakeOptions {
    fn default() -> Self {
        Self {
            log_aliasing_report: false,
            debug_names: cfg!(debug_assertions),
        }
    }
}
