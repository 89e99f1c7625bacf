pub mod handlers;

use std::path::{Path, PathBuf};

use clap::Parser;
use l2dat_core::error::{DatError, Result};
use l2dat_core::task::{Action, Document, TaskEvents, TaskObserver, TaskRunner, TaskStatus};
use l2dat_core::{CipherChoice, Registries, Settings};
use tracing::debug;

use crate::presentation::cli::{Cli, Commands};

const DEFAULT_SETTINGS: &str = "config/l2dat.toml";

/// Everything a command needs: loaded registries, the worker runner and the
/// chronicle/cipher chosen on the command line or in the settings.
pub struct Session {
    pub registries: Registries,
    pub runner: TaskRunner,
    pub events: TaskEvents,
    chronicle: Option<String>,
    pub cipher: Option<CipherChoice>,
}

impl Session {
    fn open(cli: &Cli) -> Result<Self> {
        let settings = load_settings(cli.config.as_deref())?;
        let registries = Registries::load(&settings)?;
        let (runner, events) = TaskRunner::new(settings.worker_threads)?;
        let cipher = cli
            .cipher
            .as_deref()
            .or(settings.cipher.as_deref())
            .map(CipherChoice::parse);
        Ok(Self {
            registries,
            runner,
            events,
            chronicle: cli.chronicle.clone().or(settings.chronicle),
            cipher,
        })
    }

    pub fn chronicle(&self) -> Result<&str> {
        self.chronicle.as_deref().ok_or_else(|| {
            DatError::Runtime("no chronicle selected (use --chronicle or `chronicle` in settings)".into())
        })
    }

    /// Runs one action to completion, printing its events.
    pub fn run_task(&self, action: Box<dyn Action>) -> Result<Vec<Document>> {
        self.runner.start(action)?;
        let mut console = Console::default();
        match self.events.dispatch(&mut console) {
            Some(TaskStatus::Succeeded) => Ok(console.documents),
            Some(TaskStatus::Cancelled) => Err(DatError::Cancelled),
            Some(TaskStatus::Failed(reason)) => Err(DatError::Runtime(reason)),
            None => Err(DatError::Runtime("task runner stopped".into())),
        }
    }
}

fn load_settings(explicit: Option<&Path>) -> Result<Settings> {
    match explicit {
        Some(path) => Settings::load(path),
        None => {
            let fallback = PathBuf::from(DEFAULT_SETTINGS);
            if fallback.is_file() {
                Settings::load(&fallback)
            } else {
                debug!("no settings file, using defaults");
                Ok(Settings::default())
            }
        }
    }
}

/// Prints task progress to stderr and keeps decoded documents. Log lines
/// and failures already reach stderr through tracing.
#[derive(Default)]
struct Console {
    last_percent: Option<u8>,
    documents: Vec<Document>,
}

impl TaskObserver for Console {
    fn on_start(&mut self, name: &str) {
        eprintln!("{name}");
    }

    fn on_progress(&mut self, percent: u8) {
        // one line per 10%
        if self.last_percent.is_none_or(|p| percent / 10 > p / 10) {
            eprintln!("  {percent:>3}%");
            self.last_percent = Some(percent);
        }
    }

    fn on_document(&mut self, doc: Document) {
        self.documents.push(doc);
    }
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    let session = Session::open(&cli)?;
    match cli.command {
        Commands::Chronicles => handlers::handle_chronicles(&session),
        Commands::Ciphers => handlers::handle_ciphers(&session),
        Commands::Open { file, out } => handlers::handle_open(&session, file, out),
        Commands::SaveTxt { file, out } => handlers::handle_save_txt(&session, file, out),
        Commands::SaveDat { text, out } => handlers::handle_save_dat(&session, text, out),
        Commands::Validate { text, dry_run } => handlers::handle_validate(&session, text, dry_run),
        Commands::Unpack { dir } => handlers::handle_unpack(&session, dir),
        Commands::Pack { dir } => handlers::handle_pack(&session, dir),
        Commands::Recrypt { dir } => handlers::handle_recrypt(&session, dir),
    }
}
