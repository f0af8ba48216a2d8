use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use crate::config::{DEFAULT_USER_AGENT, ExtractorConfig, FetchConfig, RetryPolicy};
use crate::types::{ExtractionOptions, SourceLocator};

#[derive(Parser, Debug)]
#[command(name = "partfetch")]
#[command(version)]
#[command(about = "Extract partition images from remote or local firmware archives", long_about = None)]
#[command(after_help = "Examples:\n  \
  partfetch https://example.com/fw.zip boot.img -o boot.img   extract one image over HTTP\n  \
  partfetch -l https://example.com/fw.zip                      list the archive's members\n  \
  partfetch --download https://example.com/vbmeta.img -o vbmeta.img")]
pub struct Cli {
    /// Archive path or HTTP(S) URL
    #[arg(value_name = "SOURCE")]
    pub source: String,

    /// Member or partition to extract
    #[arg(value_name = "PARTITION", required_unless_present_any = ["list", "download"])]
    pub partition: Option<String>,

    /// Destination file (default: the partition's file name)
    #[arg(short = 'o', long = "output", value_name = "DEST")]
    pub output: Option<PathBuf>,

    /// List members
    #[arg(short = 'l', long)]
    pub list: bool,

    /// Download the whole object instead of extracting from it
    #[arg(long, conflicts_with = "list")]
    pub download: bool,

    /// Keep downloaded archives in this directory and reuse them
    #[arg(long, value_name = "DIR")]
    pub cache_dir: Option<PathBuf>,

    /// Request timeout in seconds; for streamed transfers, the longest stall allowed
    #[arg(long, value_name = "SECS", default_value_t = 30)]
    pub timeout: u64,

    /// Attempts per network operation
    #[arg(long, value_name = "N", default_value_t = 5)]
    pub retries: u32,

    /// Check CRC-32 and size after extraction
    #[arg(long)]
    pub verify: bool,

    /// User-Agent header
    #[arg(long, value_name = "UA", default_value = DEFAULT_USER_AGENT)]
    pub user_agent: String,

    /// Referer header
    #[arg(long, value_name = "URL")]
    pub referer: Option<String>,

    /// More logging (-vv => debug); in list mode, a detailed table
    #[arg(short = 'v', action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// No progress or messages
    #[arg(short = 'q', long)]
    pub quiet: bool,
}

impl Cli {
    pub fn is_remote(&self) -> bool {
        SourceLocator::parse(&self.source).is_remote()
    }

    /// Where the output goes: `-o`, else the partition's or source's file name
    pub fn destination(&self) -> Option<PathBuf> {
        if let Some(output) = &self.output {
            return Some(output.clone());
        }
        let name = match &self.partition {
            Some(partition) => partition.rsplit('/').next().map(str::to_string),
            None => SourceLocator::parse(&self.source).basename(),
        }?;
        (!name.is_empty()).then(|| PathBuf::from(name))
    }

    /// Default `RUST_LOG` directive for the chosen verbosity
    pub fn log_level(&self) -> &'static str {
        match (self.quiet, self.verbose) {
            (true, _) => "error",
            (false, 0) => "warn",
            (false, 1) => "info",
            (false, _) => "debug",
        }
    }

    pub fn extractor_config(&self) -> ExtractorConfig {
        ExtractorConfig {
            fetch: FetchConfig {
                timeout: Duration::from_secs(self.timeout),
                user_agent: self.user_agent.clone(),
                referer: self.referer.clone(),
                retry: RetryPolicy {
                    max_attempts: self.retries.max(1),
                    ..RetryPolicy::default()
                },
                ..FetchConfig::default()
            },
            cache_dir: self.cache_dir.clone(),
        }
    }

    pub fn extraction_options(&self) -> ExtractionOptions {
        ExtractionOptions {
            timeout: None,
            verify: self.verify,
        }
    }
}
