use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(author, version, about = "l2dat: DAT file editor engine", long_about = None)]
pub struct Cli {
    /// Settings file (defaults to config/l2dat.toml when present)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Chronicle whose descriptors apply
    #[arg(long, global = true)]
    pub chronicle: Option<String>,

    /// Cipher name, or "Source" to keep the file's own
    #[arg(long, global = true)]
    pub cipher: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List known chronicles and their descriptors
    Chronicles,

    /// List known ciphers with their header identities
    Ciphers,

    /// Decode a DAT and print its text
    Open {
        file: PathBuf,
        /// write the text here instead of stdout
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Decode a DAT and save its text next to it (or at OUT)
    SaveTxt { file: PathBuf, out: Option<PathBuf> },

    /// Encode a text file into a DAT (defaults to the same stem with .dat)
    SaveDat { text: PathBuf, out: Option<PathBuf> },

    /// Check a text file without writing anything
    Validate {
        text: PathBuf,
        /// stop after serialization, skip the cipher
        #[arg(long)]
        dry_run: bool,
    },

    /// Decode every .dat in a directory to .txt
    Unpack { dir: PathBuf },

    /// Encode every .txt in a directory to .dat
    Pack { dir: PathBuf },

    /// Re-encrypt every .dat in a directory in place
    Recrypt { dir: PathBuf },
}
