mod logging;
mod options;

use std::{fs::File, io, path::Path, process::exit};

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use converge::{
    interrupt::set_up_process_interrupt_handler, state::StateStore, state_file::StateFile,
    Controller, ControllerOptions,
};
use converge_resource::{Attributes, Schema};
use converge_resources_local::LocalProvider;
use options::{Options, ResourceArgs};

/// Reconcile a resource with its desired configuration
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(flatten)]
    options: Options,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show what apply would change, without changing anything
    Plan {
        #[command(flatten)]
        resource: ResourceArgs,
        /// Desired configuration as a JSON object
        #[arg(long, value_name = "FILE")]
        config: std::path::PathBuf,
    },
    /// Create, update or replace the resource to match the configuration
    Apply {
        #[command(flatten)]
        resource: ResourceArgs,
        /// Desired configuration as a JSON object
        #[arg(long, value_name = "FILE")]
        config: std::path::PathBuf,
    },
    /// Read the resource from the backend and record what it reports
    Refresh {
        #[command(flatten)]
        resource: ResourceArgs,
    },
    /// Delete the resource and forget it
    Destroy {
        #[command(flatten)]
        resource: ResourceArgs,
    },
    /// Inspect the state file
    #[command(subcommand)]
    State(StateCommands),
}

#[derive(Subcommand, Debug)]
enum StateCommands {
    /// Print the recorded state of all resources
    Show {
        #[arg(long, value_name = "FILE", default_value = "converge-state.json")]
        state: std::path::PathBuf,
    },
}

fn main() {
    let args = Args::parse();
    handle_result(run_args(args));
}

fn handle_result(r: Result<()>) {
    if let Err(e) = r {
        eprintln!("converge error: {:?}", e);
        exit(1);
    }
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("initializing tokio runtime")
}

fn run_args(args: Args) -> Result<()> {
    let mut logger = logging::set_up(logging::Options {
        verbose: args.options.verbose,
        color: args.options.color(),
    })?;
    let r = match &args.command {
        Commands::Plan { resource, config } => plan(resource, config),
        Commands::Apply { resource, config } => apply(&args.options, resource, config),
        Commands::Refresh { resource } => refresh(&args.options, resource),
        Commands::Destroy { resource } => destroy(&args.options, resource),
        Commands::State(StateCommands::Show { state }) => state_show(state),
    };
    logger.tear_down()?;
    r
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path, what: &str) -> Result<T> {
    let file = File::open(path).with_context(|| format!("opening {} {}", what, path.display()))?;
    serde_json::from_reader(io::BufReader::new(file))
        .with_context(|| format!("parsing {} {}", what, path.display()))
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    let s = serde_json::to_string_pretty(value)?;
    println!("{}", s);
    Ok(())
}

struct Session {
    controller: Controller,
    state_file: StateFile,
    provider: LocalProvider,
}

impl Session {
    fn open(options: &Options, resource: &ResourceArgs) -> Result<Session> {
        let schema: Schema = read_json(&resource.schema, "schema")?;
        let (state_file, store) = StateFile::open_or_create(&resource.state)?;
        let mut provider = LocalProvider::new(&resource.backend);
        if let Some(attribute) = &resource.id_attribute {
            provider = provider.with_id_attribute(attribute);
        }
        let controller = Controller::new(
            schema,
            store,
            ControllerOptions {
                call_timeout: options.call_timeout(),
            },
            set_up_process_interrupt_handler()?,
        );
        Ok(Session {
            controller,
            state_file,
            provider,
        })
    }

    /// Persist whatever the controller recorded, also when `r` failed.
    fn finish<T>(mut self, r: converge::Result<T>) -> Result<T> {
        self.state_file
            .sync(self.controller.store())
            .with_context(|| format!("saving state to {}", self.state_file.path().display()))?;
        Ok(r?)
    }
}

fn plan(resource: &ResourceArgs, config: &Path) -> Result<()> {
    let schema: Schema = read_json(&resource.schema, "schema")?;
    let desired: Attributes = read_json(config, "configuration")?;
    let store = if resource.state.exists() {
        StateFile::open_or_create(&resource.state)?.1
    } else {
        StateStore::new()
    };
    let controller = Controller::new(
        schema,
        store,
        ControllerOptions::default(),
        Default::default(),
    );
    let plan = controller.plan(&resource.name, &desired)?;
    if plan.instance.is_present() {
        println!("{}: {}", resource.name, plan.changes);
    } else {
        println!("{}: create", resource.name);
        for change in &plan.changes {
            println!("{}", change);
        }
    }
    Ok(())
}

fn apply(options: &Options, resource: &ResourceArgs, config: &Path) -> Result<()> {
    let desired: Attributes = read_json(config, "configuration")?;
    let session = Session::open(options, resource)?;
    let r = runtime()?.block_on(session.controller.reconcile(
        &session.provider,
        &resource.name,
        &desired,
    ));
    let instance = session.finish(r)?;
    print_json(&instance)
}

fn refresh(options: &Options, resource: &ResourceArgs) -> Result<()> {
    let session = Session::open(options, resource)?;
    let r = runtime()?.block_on(
        session
            .controller
            .refresh(&session.provider, &resource.name),
    );
    let instance = session.finish(r)?;
    print_json(&instance)
}

fn destroy(options: &Options, resource: &ResourceArgs) -> Result<()> {
    let session = Session::open(options, resource)?;
    let r = runtime()?.block_on(
        session
            .controller
            .destroy(&session.provider, &resource.name),
    );
    session.finish(r)?;
    Ok(())
}

fn state_show(path: &Path) -> Result<()> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let store = StateStore::from_events(converge::state_file::StateEventStream::open_from_reader(
        io::BufReader::new(file),
    )?)?;
    let resources: std::collections::BTreeMap<_, _> = store
        .snapshot()
        .iter()
        .map(|(name, stored)| (name.clone(), stored.clone()))
        .collect();
    print_json(&resources)
}
