use anyhow::{Result, anyhow};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::instrument;

use rscp_tools_rscp::Remote;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "rscp",
    version,
    about = "Resumable, integrity-verified file transfers over SFTP",
    long_about = "`rscp` uploads and downloads files and directories over SFTP.

Files are written to `<destination>.part` and renamed into place when complete; an interrupted \
transfer resumes from whatever the part file already holds. Every file is verified end-to-end by \
comparing MD5 digests of both sides. Transient network failures are retried with exponential \
backoff.

EXAMPLES:
    # Upload a file into a remote directory
    rscp upload -H server.example.com ./backup.tar.gz /srv/backups/

    # Download a directory with progress bars and a summary
    rscp download -H server.example.com -U deploy /var/log/app ./logs --progress --summary

    # Check connectivity and host key trust
    rscp test -H server.example.com -p 2222"
)]
struct Args {
    #[command(subcommand)]
    command: Command,

    // Progress & output
    /// Show progress bars
    #[arg(long, global = true, help_heading = "Progress & output")]
    progress: bool,

    /// Print summary at the end
    #[arg(long, global = true, help_heading = "Progress & output")]
    summary: bool,

    /// Verbose level (implies "summary"): -v INFO / -vv DEBUG / -vvv TRACE (default: ERROR)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true, help_heading = "Progress & output")]
    verbose: u8,

    /// Quiet mode, don't report errors
    #[arg(short = 'q', long = "quiet", global = true, help_heading = "Progress & output")]
    quiet: bool,

    // Advanced settings
    /// Number of worker threads (0 = number of CPU cores)
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        global = true,
        help_heading = "Advanced settings"
    )]
    max_workers: usize,

    /// Number of blocking worker threads (0 = Tokio default of 512)
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        global = true,
        help_heading = "Advanced settings"
    )]
    max_blocking_threads: usize,
}

#[derive(Subcommand, Debug, Clone)]
enum Command {
    /// Upload a local file or directory to the remote host
    #[command(visible_alias = "u")]
    Upload {
        #[command(flatten)]
        connection: ConnectionArgs,

        #[command(flatten)]
        transfer: TransferArgs,

        /// Local file or directory
        local: PathBuf,

        /// Remote destination, a trailing '/' or an existing directory receives the source under its own name
        remote: PathBuf,
    },
    /// Download a remote file or directory
    #[command(visible_alias = "d")]
    Download {
        #[command(flatten)]
        connection: ConnectionArgs,

        #[command(flatten)]
        transfer: TransferArgs,

        /// Remote file or directory
        remote: PathBuf,

        /// Local destination, a trailing '/' or an existing directory receives the source under its own name
        local: PathBuf,
    },
    /// Test the connection: authenticate, verify the host key and open SFTP
    #[command(visible_alias = "t")]
    Test {
        #[command(flatten)]
        connection: ConnectionArgs,
    },
}

#[derive(clap::Args, Debug, Clone)]
struct ConnectionArgs {
    /// Remote host name or address
    #[arg(short = 'H', long, value_name = "HOST", help_heading = "Connection")]
    host: String,

    /// SSH port
    #[arg(short = 'p', long, default_value = "22", value_name = "PORT", help_heading = "Connection")]
    port: u16,

    /// Remote user
    #[arg(
        short = 'U',
        long,
        visible_short_alias = 'u',
        default_value = remote::session::DEFAULT_USER,
        value_name = "USER",
        help_heading = "Connection"
    )]
    user: String,

    /// Private key file (default: first of ~/.ssh/id_ecdsa, id_ed25519, id_rsa that exists)
    #[arg(short = 'k', long, value_name = "PATH", help_heading = "Connection")]
    key: Option<PathBuf>,

    /// known_hosts file used to verify the server (default: ~/.ssh/known_hosts)
    #[arg(long, value_name = "PATH", help_heading = "Connection")]
    known_hosts: Option<PathBuf>,

    /// How to treat host keys not yet in known_hosts: prompt, accept-new or strict
    #[arg(
        long,
        default_value_t = remote::TrustPolicy::Prompt,
        value_name = "POLICY",
        help_heading = "Connection"
    )]
    host_key_policy: remote::TrustPolicy,
}

#[derive(clap::Args, Debug, Clone)]
struct TransferArgs {
    /// Maximum number of attempts for transient network failures (0 = default of 3)
    #[arg(short = 'r', long, default_value = "3", value_name = "N", help_heading = "Retry options")]
    retry: i64,

    /// Delay before the first retry, doubled on every further attempt
    #[arg(long, default_value = "1s", value_name = "DELAY", help_heading = "Retry options")]
    retry_delay: humantime::Duration,

    /// Upper bound of the delay between attempts
    #[arg(long, default_value = "30s", value_name = "DELAY", help_heading = "Retry options")]
    retry_max_delay: humantime::Duration,

    /// Number of concurrent chunk writers per file
    #[arg(
        long,
        default_value_t = common::config::DEFAULT_WORKERS,
        value_name = "N",
        help_heading = "Transfer options"
    )]
    workers: usize,

    /// Size of a single chunk
    #[arg(
        long,
        default_value = "32KiB",
        value_name = "SIZE",
        help_heading = "Transfer options"
    )]
    buffer_size: bytesize::ByteSize,

    /// Number of files transferred at once within a directory
    #[arg(
        long,
        default_value_t = common::config::DEFAULT_FILE_CONCURRENCY,
        value_name = "N",
        help_heading = "Transfer options"
    )]
    concurrency: usize,

    /// Skip the MD5 comparison after each file
    #[arg(long, help_heading = "Transfer options")]
    no_verify: bool,
}

impl TransferArgs {
    fn transfer_config(&self, progress: bool) -> Result<common::TransferConfig> {
        let config = common::TransferConfig {
            workers: self.workers,
            buffer_size: usize::try_from(self.buffer_size.as_u64())
                .map_err(|_| anyhow!("buffer size {} is too large", self.buffer_size))?,
            file_concurrency: self.concurrency,
            verify: !self.no_verify,
            progress,
        };
        config.validate().map_err(|error| anyhow!(error))?;
        Ok(config)
    }

    fn retry_config(&self) -> common::retry::RetryConfig {
        common::retry::RetryConfig {
            initial_delay: self.retry_delay.into(),
            max_delay: self.retry_max_delay.into(),
            ..common::retry::RetryConfig::with_max_attempts(self.retry)
        }
    }
}

impl ConnectionArgs {
    fn remote(&self) -> Result<Remote> {
        let endpoint = remote::Endpoint {
            user: self.user.clone(),
            host: self.host.clone(),
            port: self.port,
            key: self.key.clone(),
        };
        let known_hosts = match &self.known_hosts {
            Some(path) => path.clone(),
            None => remote::KnownHosts::default_path()?,
        };
        Ok(Remote {
            endpoint,
            known_hosts,
            policy: self.host_key_policy,
        })
    }
}

#[derive(Debug)]
enum Outcome {
    Uploaded(common::Summary),
    Downloaded(common::Summary),
    Connected(String),
}

impl Outcome {
    fn success_message(&self) -> String {
        match self {
            Outcome::Uploaded(_) => "✓ Upload successful".to_string(),
            Outcome::Downloaded(_) => "✓ Download successful".to_string(),
            Outcome::Connected(address) => format!("✓ Connection successful to {address}"),
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Outcome::Uploaded(summary) | Outcome::Downloaded(summary) => write!(f, "{summary}"),
            Outcome::Connected(address) => write!(f, "connected to {address}"),
        }
    }
}

#[instrument]
async fn async_main(args: Args) -> Result<Outcome> {
    match args.command {
        Command::Upload {
            connection,
            transfer,
            local,
            remote,
        } => {
            let config = transfer.transfer_config(args.progress)?;
            let summary = rscp_tools_rscp::upload(
                &connection.remote()?,
                &config,
                &transfer.retry_config(),
                &local,
                &remote,
            )
            .await?;
            Ok(Outcome::Uploaded(summary))
        }
        Command::Download {
            connection,
            transfer,
            remote,
            local,
        } => {
            let config = transfer.transfer_config(args.progress)?;
            let summary = rscp_tools_rscp::download(
                &connection.remote()?,
                &config,
                &transfer.retry_config(),
                &remote,
                &local,
            )
            .await?;
            Ok(Outcome::Downloaded(summary))
        }
        Command::Test { connection } => {
            let address = rscp_tools_rscp::test_connection(&connection.remote()?).await?;
            Ok(Outcome::Connected(address))
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    let func = {
        let args = args.clone();
        || async_main(args)
    };
    let output = common::OutputConfig {
        quiet: args.quiet,
        verbose: args.verbose,
        print_summary: args.summary,
    };
    let runtime = common::RuntimeConfig {
        max_workers: args.max_workers,
        max_blocking_threads: args.max_blocking_threads,
    };
    match common::run(output, runtime, func) {
        Some(outcome) => println!("{}", outcome.success_message()),
        None => std::process::exit(1),
    }
    Ok(())
}
