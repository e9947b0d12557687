/*!
The `cli` module provides the data types used for parsing the command
line arguments.
*/

use std::path::PathBuf;
use structopt::StructOpt;

/// Indicates which subcommand the user has chosen.
#[derive(StructOpt, Debug, Clone)]
pub enum Command {
    /// Register this machine and write its key file
    Keygen {
        /// Account user name
        #[structopt(long)]
        user: String,
        /// Friendly name for this machine
        #[structopt(long)]
        machine: String,
        /// Blob holding the server root public key
        #[structopt(long)]
        root_key: Option<PathBuf>,
    },
    /// Generate new keys for an existing machine number
    Keyregen {
        /// The key file being replaced
        #[structopt(long)]
        oldkey: PathBuf,
        /// Account user name
        #[structopt(long)]
        user: String,
        /// Friendly name for this machine
        #[structopt(long)]
        machine: String,
    },
    /// Write a key file holding a subset of another's keys
    Keymgmt {
        /// Where to write the new key file
        #[structopt(long)]
        outkeyfile: PathBuf,
        /// Keep only the keys needed to read archives
        #[structopt(short = "r", long)]
        read_only: bool,
        /// Keep only the keys needed to write archives
        #[structopt(short = "w", long)]
        write_only: bool,
        /// Keep only the keys needed to delete archives
        #[structopt(short = "d", long)]
        delete_only: bool,
        /// The key file to read
        #[structopt(name = "KEYFILE")]
        keyfile: PathBuf,
    },
    /// Create an archive from a byte stream
    Create {
        /// Archive name
        #[structopt(short = "f", long)]
        archive: String,
        /// Stream to archive; standard input when omitted
        #[structopt(long)]
        input: Option<PathBuf>,
        /// Perform every step except sending data
        #[structopt(long)]
        dry_run: bool,
        /// Print storage statistics when done
        #[structopt(long)]
        print_stats: bool,
    },
    /// Write an archive's byte stream back out
    Extract {
        /// Archive name
        #[structopt(short = "f", long)]
        archive: String,
        /// Where to write the stream; standard output when omitted
        #[structopt(long)]
        output: Option<PathBuf>,
    },
    /// List archives
    List,
    /// Delete an archive
    Delete {
        /// Archive name
        #[structopt(short = "f", long)]
        archive: String,
        /// Print storage statistics when done
        #[structopt(long)]
        print_stats: bool,
    },
    /// Verify the server state and rebuild the local chunk directory
    Fsck {
        /// Delete unreferenced files instead of just reporting them
        #[structopt(long)]
        prune: bool,
    },
    /// Delete every archive and every stored byte
    Nuke,
    /// Print storage statistics from the local chunk directory
    PrintStats,
}

/// Struct for holding the options the user has selected.
#[derive(Debug, StructOpt)]
#[structopt(
    name = "tarmac",
    about = "Online, encrypted, deduplicating backup",
    author = env!("CARGO_PKG_AUTHORS"),
)]
pub struct Opt {
    /// Key file for this machine
    #[structopt(long, global = true, default_value = "tarmac.key")]
    pub keyfile: PathBuf,
    /// Directory holding the chunk directory and transaction state
    #[structopt(long, global = true, default_value = ".tarmac-cache")]
    pub cachedir: PathBuf,
    /// Storage server endpoint
    #[structopt(long, global = true, default_value = "public-server.tarmac.net:9279")]
    pub server: String,
    /// Spread uploads across several connections
    #[structopt(long, global = true)]
    pub aggressive: bool,
    /// Stop cleanly after sending this many bytes
    #[structopt(long, global = true)]
    pub maxbw: Option<u64>,
    /// Checkpoint after each multiple of this many bytes
    #[structopt(long, global = true)]
    pub checkpoint_bytes: Option<u64>,
    /// Operation to perform
    #[structopt(subcommand)]
    pub command: Command,
}

impl Opt {
    /// Split the server option into host and port.
    pub fn server_endpoint(&self) -> anyhow::Result<(String, u16)> {
        let mut parts = self.server.rsplitn(2, ':');
        let port = parts
            .next()
            .and_then(|p| p.parse::<u16>().ok())
            .ok_or_else(|| anyhow::anyhow!("server must be host:port"))?;
        let host = parts
            .next()
            .ok_or_else(|| anyhow::anyhow!("server must be host:port"))?;
        Ok((host.to_owned(), port))
    }
}
