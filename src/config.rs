use crate::backend::KindFilter;
use crate::error::{Error, Result};

/// Default workgroup size when the caller does not specify one.
pub const DEFAULT_LOCAL_RANGE: u64 = 256;

/// Upper bound on auxiliary command queues per device.
pub const MAX_QUEUES: usize = 16;

#[derive(Debug, Clone)]
pub struct Config {
    pub devices: KindFilter,
    pub num_gpus: i32,
    pub max_cpu: i32,
    pub gpu_streaming: bool,
    pub queue_concurrency: usize,
    pub local_range: u64,
    pub no_pipelining: bool,
    pub smoothing: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            devices: KindFilter::all(),
            num_gpus: -1,
            max_cpu: -1,
            gpu_streaming: false,
            queue_concurrency: 1,
            local_range: DEFAULT_LOCAL_RANGE,
            no_pipelining: false,
            smoothing: true,
        }
    }
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }

    pub fn validate(&self) -> Result<()> {
        if self.queue_concurrency == 0 || self.queue_concurrency > MAX_QUEUES {
            return Err(Error::config(format!(
                "queue_concurrency must be in [1, {}]",
                MAX_QUEUES
            )));
        }

        if self.local_range == 0 {
            return Err(Error::config("local_range must be > 0"));
        }

        if self.num_gpus < -1 {
            return Err(Error::config("num_gpus must be -1 (all) or >= 0"));
        }

        if self.max_cpu < -1 || self.max_cpu == 0 {
            return Err(Error::config("max_cpu must be -1 (auto) or >= 1"));
        }

        Ok(())
    }

    /// CPU parallelism after resolving the -1 sentinel: all logical
    /// processors but one, or the explicit value clamped to [1, logical-1].
    pub fn resolved_max_cpu(&self) -> usize {
        let logical = num_cpus::get();
        let ceiling = logical.saturating_sub(1).max(1);
        if self.max_cpu < 0 {
            ceiling
        } else {
            (self.max_cpu as usize).clamp(1, ceiling)
        }
    }
}

#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    pub fn devices(mut self, filter: KindFilter) -> Self {
        self.config.devices = filter;
        self
    }

    pub fn num_gpus(mut self, n: i32) -> Self {
        self.config.num_gpus = n;
        self
    }

    pub fn max_cpu(mut self, n: i32) -> Self {
        self.config.max_cpu = n;
        self
    }

    pub fn gpu_streaming(mut self, streaming: bool) -> Self {
        self.config.gpu_streaming = streaming;
        self
    }

    pub fn queue_concurrency(mut self, n: usize) -> Self {
        self.config.queue_concurrency = n;
        self
    }

    pub fn local_range(mut self, range: u64) -> Self {
        self.config.local_range = range;
        self
    }

    pub fn no_pipelining(mut self, disable: bool) -> Self {
        self.config.no_pipelining = disable;
        self
    }

    pub fn smoothing(mut self, smooth: bool) -> Self {
        self.config.smoothing = smooth;
        self
    }

    pub fn build(self) -> Result<Config> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_queue_concurrency_bounds() {
        let err = Config::builder().queue_concurrency(0).build();
        assert!(err.is_err());

        let err = Config::builder().queue_concurrency(17).build();
        assert!(err.is_err());

        let ok = Config::builder().queue_concurrency(16).build();
        assert!(ok.is_ok());
    }

    #[test]
    fn test_resolved_max_cpu() {
        let config = Config::builder().max_cpu(-1).build().unwrap();
        let logical = num_cpus::get();
        assert_eq!(config.resolved_max_cpu(), logical.saturating_sub(1).max(1));

        let config = Config::builder().max_cpu(1).build().unwrap();
        assert_eq!(config.resolved_max_cpu(), 1);

        let config = Config::builder().max_cpu(10_000).build().unwrap();
        assert!(config.resolved_max_cpu() <= logical);
    }

    #[test]
    fn test_zero_local_range_rejected() {
        assert!(Config::builder().local_range(0).build().is_err());
    }
}
