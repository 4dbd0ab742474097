use std::{io::IsTerminal as _, path::PathBuf, time::Duration};

use clap::{ColorChoice, Parser};

#[derive(Parser, Debug, Clone)]
pub struct Options {
    #[arg(short, long, global = true, default_value = "false")]
    pub verbose: bool,

    #[arg(long, global = true, default_value_t = ColorChoice::Auto)]
    pub color: ColorChoice,

    /// Give up on a single backend call after this many seconds
    #[arg(long, global = true, value_name = "SECONDS")]
    pub timeout: Option<u64>,
}

impl Options {
    pub fn color(&self) -> bool {
        match self.color {
            ColorChoice::Always => true,
            ColorChoice::Never => false,
            ColorChoice::Auto => std::io::stderr().is_terminal(),
        }
    }

    pub fn call_timeout(&self) -> Option<Duration> {
        self.timeout.map(Duration::from_secs)
    }
}

/// Where a resource lives and how it is described.
#[derive(Parser, Debug, Clone)]
pub struct ResourceArgs {
    /// Local name of the resource
    #[arg(long)]
    pub name: String,

    /// JSON schema of the resource type
    #[arg(long, value_name = "FILE")]
    pub schema: PathBuf,

    /// State file; created when missing
    #[arg(long, value_name = "FILE", default_value = "converge-state.json")]
    pub state: PathBuf,

    /// Directory of the local backend
    #[arg(long, value_name = "DIR", default_value = ".converge/resources")]
    pub backend: PathBuf,

    /// Use this string attribute as the backend id instead of generating one
    #[arg(long, value_name = "ATTRIBUTE")]
    pub id_attribute: Option<String>,
}
