//! Command-line interface.

use clap::Parser;

/// L4/L7 service proxy worker-plane daemon.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Options {
    /// Path to the JSON configuration file.
    #[arg(long, short = 'c', default_value = "relayd.conf.json")]
    pub config_path: String,

    /// Base id for the shared-memory region and hot-restart domain sockets.
    /// Multiple independent proxies on one host need distinct base ids.
    #[arg(long, default_value_t = 0)]
    pub base_id: u64,

    /// Hot-restart generation. Zero for the first process; each successor
    /// increments by one.
    #[arg(long, default_value_t = 0)]
    pub restart_epoch: u64,

    /// Worker thread count. Zero selects the hardware parallelism.
    #[arg(long, default_value_t = 0)]
    pub concurrency: usize,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

impl Options {
    pub fn worker_count(&self) -> usize {
        if self.concurrency != 0 {
            return self.concurrency;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = Options::parse_from(["relayd"]);
        assert_eq!(0, options.base_id);
        assert_eq!(0, options.restart_epoch);
        assert!(options.worker_count() >= 1);
    }

    #[test]
    fn test_flags_parse() {
        let options = Options::parse_from([
            "relayd",
            "-c",
            "/etc/relayd/relayd.json",
            "--base-id",
            "7",
            "--restart-epoch",
            "2",
            "--concurrency",
            "4",
        ]);
        assert_eq!("/etc/relayd/relayd.json", options.config_path);
        assert_eq!(7, options.base_id);
        assert_eq!(2, options.restart_epoch);
        assert_eq!(4, options.worker_count());
    }
}
