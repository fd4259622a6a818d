use crate::runtime::Reactor;
use anyhow::{Result, anyhow};
use std::convert::TryFrom;
use std::thread;

/// Default size for io_uring SQ ring.
const RING_SIZE: usize = 1024;

/// Final cq ring size is RING_SIZE * multiplier.
const CQ_RING_SIZE_MULTIPLIER: usize = 2;

/// Kernel SQ thread idle time before it goes to sleep, in milliseconds.
const SQ_POLL_IDLE_MS: u32 = 100;

/// Empty iterations of `poll()` before the thread yields.
const POLL_YIELD_INTERVAL: usize = 64;

#[derive(Debug, Clone)]
pub struct Builder {
    /// Size of io_uring SQ ring.
    ring_size: usize,

    /// Final size of cq ring will be `ring_size * cq_ring_size_multiplier`.
    /// Default is 2 as per `io_uring`'s own default value.
    ///
    /// The operation slab is sized after the cq ring, every slot is backed by
    /// room for its completion.
    cq_ring_size_multiplier: usize,

    /// Let a kernel thread poll the SQ ring, submissions then need no syscall.
    sq_polling: bool,

    /// How long the kernel SQ thread spins before sleeping, in milliseconds.
    sq_poll_idle: u32,

    /// Pin the kernel SQ thread to this CPU.
    sq_cpu_affinity: Option<u32>,

    /// Busy-wait for completions instead of relying on interrupts. Only some
    /// devices and operations support it, and the loop never blocks.
    io_polling: bool,

    /// How many empty iterations `poll()` spins before yielding the thread.
    poll_yield_interval: usize,
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl Builder {
    /// Returns a new builder with the default configuration.
    ///
    /// Configuration methods can be chained on the return value.
    pub fn new() -> Builder {
        Self {
            ring_size: RING_SIZE,
            cq_ring_size_multiplier: CQ_RING_SIZE_MULTIPLIER,
            sq_polling: false,
            sq_poll_idle: SQ_POLL_IDLE_MS,
            sq_cpu_affinity: None,
            io_polling: false,
            poll_yield_interval: POLL_YIELD_INTERVAL,
        }
    }

    #[track_caller]
    pub fn ring_size(mut self, val: usize) -> Self {
        assert!(val.is_power_of_two(), "ring_size must be a power of two");
        self.ring_size = val;
        self
    }

    #[track_caller]
    pub fn cq_ring_size_multiplier(mut self, val: usize) -> Self {
        assert!(val > 0, "cq_ring_size_multiplier must be greater than 0");
        self.cq_ring_size_multiplier = val;
        self
    }

    pub fn sq_polling(mut self, val: bool) -> Self {
        self.sq_polling = val;
        self
    }

    #[track_caller]
    pub fn sq_poll_idle(mut self, val: u32) -> Self {
        assert!(val > 0, "sq_poll_idle must be greater than 0");
        self.sq_poll_idle = val;
        self
    }

    pub fn sq_cpu_affinity(mut self, cpu: u32) -> Self {
        self.sq_cpu_affinity = Some(cpu);
        self
    }

    pub fn io_polling(mut self, val: bool) -> Self {
        self.io_polling = val;
        self
    }

    #[track_caller]
    pub fn poll_yield_interval(mut self, val: usize) -> Self {
        assert!(val > 0, "poll_yield_interval must be greater than 0");
        self.poll_yield_interval = val;
        self
    }

    /// Creates the configured `Reactor`.
    ///
    /// The ring is set up right away. The reactor still has to be bound to a
    /// thread before it can run.
    pub fn try_build(self) -> Result<Reactor> {
        let cfg = ReactorConfig::try_from(self)?;
        Reactor::with_config(cfg)
    }
}

// Immutable configuration of one reactor, produced by the `Builder`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ReactorConfig {
    pub(crate) ring_size: usize,
    pub(crate) cq_ring_size_multiplier: usize,
    pub(crate) sq_polling: bool,
    pub(crate) sq_poll_idle: u32,
    pub(crate) sq_cpu_affinity: Option<u32>,
    pub(crate) io_polling: bool,
    pub(crate) poll_yield_interval: usize,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        ReactorConfig {
            ring_size: RING_SIZE,
            cq_ring_size_multiplier: CQ_RING_SIZE_MULTIPLIER,
            sq_polling: false,
            sq_poll_idle: SQ_POLL_IDLE_MS,
            sq_cpu_affinity: None,
            io_polling: false,
            poll_yield_interval: POLL_YIELD_INTERVAL,
        }
    }
}

impl ReactorConfig {
    fn validate(&self) -> Result<()> {
        if let Some(cpu) = self.sq_cpu_affinity {
            if !self.sq_polling {
                return Err(anyhow!("sq_cpu_affinity requires sq_polling to be enabled"));
            }

            let num_cpus = thread::available_parallelism()?.get();
            if cpu as usize >= num_cpus {
                return Err(anyhow!(
                    "sq_cpu_affinity ({cpu}) must be lower than the number of available CPUs ({num_cpus})"
                ));
            }
        }

        Ok(())
    }
}

impl TryFrom<Builder> for ReactorConfig {
    type Error = anyhow::Error;

    fn try_from(builder: Builder) -> Result<Self, Self::Error> {
        let cfg = ReactorConfig {
            ring_size: builder.ring_size,
            cq_ring_size_multiplier: builder.cq_ring_size_multiplier,
            sq_polling: builder.sq_polling,
            sq_poll_idle: builder.sq_poll_idle,
            sq_cpu_affinity: builder.sq_cpu_affinity,
            io_polling: builder.io_polling,
            poll_yield_interval: builder.poll_yield_interval,
        };

        cfg.validate()?;

        Ok(cfg)
    }
}
