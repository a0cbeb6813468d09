use clap::Parser;
use std::path::PathBuf;

/// Define CLI arguments
#[derive(Parser, Debug)]
#[command(
    version,
    about = "Fetch media through a streaming disk cache",
    long_about = "Fetches one or more URIs through the media cache.\n\
                  \n\
                  Each resource is downloaded with HTTP range requests into a single cache\n\
                  file and copied to the output directory while it is still downloading.\n\
                  Partially cached resources resume where they stopped, local paths and\n\
                  file:// URLs are read in place."
)]
pub struct CliArgs {
    /// URIs to fetch
    #[arg(
        required = true,
        help = "HTTP(S) URL(s), file:// URL(s) or local paths to fetch"
    )]
    pub input: Vec<String>,

    /// Directory holding the cache files
    #[arg(
        short,
        long,
        help = "Directory holding the cache files (default: <temp>/media-cache)"
    )]
    pub cache_dir: Option<PathBuf>,

    /// Output directory, "-" for stdout
    #[arg(
        short,
        long,
        default_value = ".",
        help = "Directory where fetched files are written, or \"-\" to write to stdout"
    )]
    pub output_dir: String,

    /// Start offset in bytes
    #[arg(
        long,
        default_value = "0",
        help = "Byte offset at which reading starts"
    )]
    pub offset: u64,

    /// Cache size budget with optional unit (B, KB, MB, GB, TB)
    #[arg(
        short,
        long,
        help = "Cache size budget with optional unit (B, KB, MB, GB, TB). Examples: \"512MB\", \"2GB\". Derived from free disk space when omitted."
    )]
    pub max_cache_size: Option<String>,

    /// Overall timeout in seconds
    #[arg(
        long,
        default_value = "0",
        help = "Overall timeout in seconds for HTTP requests (0 disables it)"
    )]
    pub timeout: u64,

    /// Connection timeout in seconds
    #[arg(
        long,
        default_value = "10",
        help = "Connection timeout in seconds (time to establish initial connection)"
    )]
    pub connect_timeout: u64,

    /// Read timeout in seconds
    #[arg(
        long,
        default_value = "30",
        help = "Read timeout in seconds (maximum time between receiving data chunks)"
    )]
    pub read_timeout: u64,

    /// Custom user agent
    #[arg(long, help = "User agent sent with every request")]
    pub user_agent: Option<String>,

    /// Proxy URL (e.g., "http://proxy.example.com:8080")
    #[arg(
        long,
        help = "Proxy server URL for downloads (e.g., \"http://proxy.example.com:8080\" or \"socks5://127.0.0.1:1080\")"
    )]
    pub proxy: Option<String>,

    /// Custom HTTP headers for download requests
    #[arg(
        long = "header",
        short = 'H',
        help = "Add custom HTTP header to requests (can be used multiple times). Format: 'Name: Value'",
        value_name = "HEADER"
    )]
    pub headers: Vec<String>,

    /// Run an eviction sweep after fetching
    #[arg(
        long,
        help = "Run one eviction sweep over the cache directory after all fetches finished"
    )]
    pub sweep: bool,

    /// Enable verbose logging
    #[arg(short, long, help = "Enable detailed debug logging")]
    pub verbose: bool,

    /// Also write logs to a file
    #[arg(long, help = "Write logs to this file in addition to stderr")]
    pub log_file: Option<PathBuf>,
}

impl CliArgs {
    /// Whether the fetched data goes to stdout instead of files
    pub fn to_stdout(&self) -> bool {
        self.output_dir == "-"
    }
}
