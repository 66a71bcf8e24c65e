use clap::Parser;
use std::path::PathBuf;

use crate::config::Config;

#[derive(Parser, Debug)]
#[command(name = "mirrorfs")]
#[command(about = "Mirror a directory tree at another mount point through FUSE")]
pub struct Args {
    #[arg(value_name = "MOUNTPOINT", help = "Where to mount the mirror")]
    pub mountpoint: PathBuf,

    #[arg(short, long, value_name = "DIR", help = "Directory to mirror")]
    pub mirror: PathBuf,

    #[arg(
        short = 'N',
        long,
        value_name = "N",
        help = "Maximum number of worker threads [default: 8]"
    )]
    pub max_threads: Option<usize>,

    #[arg(
        long,
        value_name = "SECS",
        help = "Attribute and entry cache timeout; 0 disables caching [default: 0]"
    )]
    pub timeout: Option<f64>,

    #[arg(
        long,
        value_name = "SECS",
        help = "Seconds before an idle worker exits [default: 10]"
    )]
    pub idle_timeout: Option<u64>,

    #[arg(long, help = "Log every FUSE request")]
    pub debug_fuse: bool,

    #[arg(long, help = "Allow other users to access the mount")]
    pub allow_other: bool,

    #[arg(long, help = "Unmount automatically when the process exits")]
    pub auto_unmount: bool,

    #[arg(long, value_name = "FILE", help = "Read settings from FILE")]
    pub config: Option<PathBuf>,
}

impl Args {
    /// Settings given on the command line, as a config layer. Switches that
    /// were not passed stay unset so the config file can still enable them.
    pub fn to_config(&self) -> Config {
        Config {
            timeout_secs: self.timeout,
            max_threads: self.max_threads,
            idle_timeout_secs: self.idle_timeout,
            allow_other: self.allow_other.then_some(true),
            auto_unmount: self.auto_unmount.then_some(true),
        }
    }
}
